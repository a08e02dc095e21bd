//! Segment selectors, descriptors and segment registers.
//!
//! A segment register consists of a visible 16-bit *selector* and a hidden
//! *descriptor cache*, which holds the decoded descriptor the selector
//! referred to when it was loaded. All protection checks work on the cache;
//! the descriptor tables in memory are only consulted when a selector is
//! loaded.

use std::fmt;

/// The six segment registers, numbered like the instruction encoding does.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum Segment {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl Segment {
    /// All segment registers in encoding order.
    pub const ALL: [Segment; 6] = [
        Segment::Es, Segment::Cs, Segment::Ss, Segment::Ds, Segment::Fs, Segment::Gs,
    ];

    /// The data segment registers that are re-validated on privilege changes.
    pub const DATA: [Segment; 4] = [Segment::Es, Segment::Ds, Segment::Fs, Segment::Gs];

    pub fn name(&self) -> &'static str {
        match self {
            Segment::Es => "es",
            Segment::Cs => "cs",
            Segment::Ss => "ss",
            Segment::Ds => "ds",
            Segment::Fs => "fs",
            Segment::Gs => "gs",
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A parsed segment selector.
///
/// `rpl` normally mirrors the low 2 bits of `value`, but the CPU forces it
/// independently in a few places (virtual-8086 mode always runs at RPL 3).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Selector {
    /// The raw 16-bit selector.
    pub value: u16,
    /// Descriptor table index.
    pub index: u16,
    /// Table indicator: `false` for the GDT, `true` for the LDT.
    pub ti: bool,
    /// Requested privilege level.
    pub rpl: u8,
}

impl Selector {
    pub fn new(value: u16) -> Self {
        Self {
            value,
            index: value >> 3,
            ti: value & 4 != 0,
            rpl: (value & 3) as u8,
        }
    }

    /// Whether this is a null selector (index 0 in the GDT).
    pub fn is_null(&self) -> bool {
        self.value & 0xfffc == 0
    }

    /// The selector with the RPL stripped, as used in error codes.
    pub fn error_code(&self) -> u16 {
        self.value & 0xfffc
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#06x}", self.value)
    }
}

/// Code and data segment type bits (low nibble of the access rights byte,
/// with the S bit set).
pub mod seg_type {
    pub const ACCESSED: u8 = 1 << 0;
    /// Writable for data, readable for code.
    pub const WRITE_READ: u8 = 1 << 1;
    /// Expand-down for data, conforming for code.
    pub const EXPAND_DOWN_CONFORMING: u8 = 1 << 2;
    pub const CODE: u8 = 1 << 3;

    /// Read/write data, accessed (as loaded in real and v8086 mode).
    pub const DATA_RW_ACCESSED: u8 = WRITE_READ | ACCESSED;
    /// Execute/read code, accessed.
    pub const CODE_RX_ACCESSED: u8 = CODE | WRITE_READ | ACCESSED;
}

/// System descriptor types (with the S bit clear).
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum SystemType {
    AvailableTss286 = 0x1,
    Ldt = 0x2,
    BusyTss286 = 0x3,
    CallGate286 = 0x4,
    TaskGate = 0x5,
    InterruptGate286 = 0x6,
    TrapGate286 = 0x7,
    AvailableTss386 = 0x9,
    BusyTss386 = 0xB,
    CallGate386 = 0xC,
    InterruptGate386 = 0xE,
    TrapGate386 = 0xF,
}

impl SystemType {
    pub fn is_tss(&self) -> bool {
        match self {
            SystemType::AvailableTss286
            | SystemType::BusyTss286
            | SystemType::AvailableTss386
            | SystemType::BusyTss386 => true,
            _ => false,
        }
    }
}

/// Gate-specific descriptor fields.
///
/// For task gates, only `selector` (the TSS selector) is meaningful.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Gate {
    /// Number of stack parameters copied on a privilege change (call gates).
    pub param_count: u8,
    pub selector: u16,
    pub offset: u64,
}

/// A decoded segment or system descriptor, as held in a descriptor cache.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Descriptor {
    /// Whether the cache holds a usable descriptor.
    pub valid: bool,
    pub present: bool,
    pub dpl: u8,
    /// The S bit: `true` for code and data segments, `false` for system
    /// descriptors.
    pub segment: bool,
    /// The 4-bit type field.
    pub kind: u8,
    pub base: u64,
    /// The limit in bytes, with granularity already applied.
    pub limit_scaled: u32,
    pub granularity: bool,
    /// Default operation size (code) or big (stack) flag.
    pub d_b: bool,
    /// 64-bit code segment.
    pub long: bool,
    pub avl: bool,
    pub gate: Gate,
}

impl Descriptor {
    /// Decodes the two dwords of a legacy descriptor.
    ///
    /// Reserved system types produce a descriptor with `valid == false`.
    pub fn parse(dword1: u32, dword2: u32) -> Self {
        let ar = (dword2 >> 8) as u8;
        let mut desc = Descriptor {
            valid: false,
            present: ar & 0x80 != 0,
            dpl: (ar >> 5) & 3,
            segment: ar & 0x10 != 0,
            kind: ar & 0xf,
            ..Descriptor::default()
        };

        if desc.segment {
            desc.parse_segment_fields(dword1, dword2);
            desc.valid = true;
            return desc;
        }

        match desc.system_type() {
            Some(SystemType::CallGate286)
            | Some(SystemType::InterruptGate286)
            | Some(SystemType::TrapGate286) => {
                desc.gate = Gate {
                    param_count: (dword2 & 0x1f) as u8,
                    selector: (dword1 >> 16) as u16,
                    offset: u64::from(dword1 & 0xffff),
                };
                desc.valid = true;
            }
            Some(SystemType::CallGate386)
            | Some(SystemType::InterruptGate386)
            | Some(SystemType::TrapGate386) => {
                desc.gate = Gate {
                    param_count: (dword2 & 0x1f) as u8,
                    selector: (dword1 >> 16) as u16,
                    offset: u64::from((dword2 & 0xffff_0000) | (dword1 & 0xffff)),
                };
                desc.valid = true;
            }
            Some(SystemType::TaskGate) => {
                desc.gate.selector = (dword1 >> 16) as u16;
                desc.valid = true;
            }
            Some(ty) if ty == SystemType::Ldt || ty.is_tss() => {
                desc.parse_segment_fields(dword1, dword2);
                desc.valid = true;
            }
            _ => {}
        }
        desc
    }

    fn parse_segment_fields(&mut self, dword1: u32, dword2: u32) {
        let limit = (dword1 & 0xffff) | (dword2 & 0x000f_0000);
        self.base = u64::from((dword1 >> 16) | ((dword2 & 0xff) << 16) | (dword2 & 0xff00_0000));
        self.granularity = dword2 & (1 << 23) != 0;
        self.d_b = dword2 & (1 << 22) != 0;
        self.long = dword2 & (1 << 21) != 0;
        self.avl = dword2 & (1 << 20) != 0;
        self.limit_scaled = if self.granularity { (limit << 12) | 0xfff } else { limit };
    }

    /// Encodes the descriptor back into its two-dword memory format.
    pub fn to_raw(&self) -> (u32, u32) {
        let ar = u32::from(self.ar_byte()) << 8;
        if !self.segment {
            match self.system_type() {
                Some(SystemType::TaskGate) => {
                    return (u32::from(self.gate.selector) << 16, ar);
                }
                Some(ty) if !ty.is_tss() && ty != SystemType::Ldt => {
                    let offset = self.gate.offset as u32;
                    let dword1 = (u32::from(self.gate.selector) << 16) | (offset & 0xffff);
                    let dword2 = (offset & 0xffff_0000) | ar | u32::from(self.gate.param_count & 0x1f);
                    return (dword1, dword2);
                }
                _ => {}
            }
        }

        let limit = if self.granularity { self.limit_scaled >> 12 } else { self.limit_scaled };
        let base = self.base as u32;
        let dword1 = (base << 16) | (limit & 0xffff);
        let dword2 = (base & 0xff00_0000)
            | ((base >> 16) & 0xff)
            | (limit & 0x000f_0000)
            | ar
            | (self.granularity as u32) << 23
            | (self.d_b as u32) << 22
            | (self.long as u32) << 21
            | (self.avl as u32) << 20;
        (dword1, dword2)
    }

    /// The access rights byte: `P DPL(2) S TYPE(4)`.
    pub fn ar_byte(&self) -> u8 {
        (self.present as u8) << 7 | (self.dpl & 3) << 5 | (self.segment as u8) << 4 | (self.kind & 0xf)
    }

    /// Returns the system descriptor type, or `None` for code and data
    /// segments and reserved types.
    pub fn system_type(&self) -> Option<SystemType> {
        use num_traits::FromPrimitive;

        if self.segment {
            None
        } else {
            SystemType::from_u8(self.kind)
        }
    }

    pub fn is_code(&self) -> bool {
        bitpat!(_ _ _ 1 1 _ _ _)(self.ar_byte())
    }

    pub fn is_data(&self) -> bool {
        bitpat!(_ _ _ 1 0 _ _ _)(self.ar_byte())
    }

    pub fn is_conforming_code(&self) -> bool {
        bitpat!(_ _ _ 1 1 1 _ _)(self.ar_byte())
    }

    pub fn is_readable_code(&self) -> bool {
        bitpat!(_ _ _ 1 1 _ 1 _)(self.ar_byte())
    }

    pub fn is_writable_data(&self) -> bool {
        bitpat!(_ _ _ 1 0 _ 1 _)(self.ar_byte())
    }

    pub fn is_expand_down_data(&self) -> bool {
        bitpat!(_ _ _ 1 0 1 _ _)(self.ar_byte())
    }

    pub fn is_accessed(&self) -> bool {
        self.kind & seg_type::ACCESSED != 0
    }

    /// Whether this describes a 64-bit code segment.
    pub fn is_long_code(&self) -> bool {
        self.is_code() && self.long
    }

    /// The descriptor cache contents after loading `selector` in real or
    /// virtual-8086 mode.
    pub fn real_mode(selector: u16, dpl: u8) -> Self {
        Descriptor {
            valid: true,
            present: true,
            dpl,
            segment: true,
            kind: seg_type::DATA_RW_ACCESSED,
            base: u64::from(selector) << 4,
            limit_scaled: 0xffff,
            ..Descriptor::default()
        }
    }

    /// The cache contents of a null selector.
    pub fn null() -> Self {
        Descriptor {
            segment: true,
            ..Descriptor::default()
        }
    }
}

/// A segment register: visible selector plus hidden descriptor cache.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct SegmentRegister {
    pub selector: Selector,
    pub cache: Descriptor,
}

impl SegmentRegister {
    pub fn new(selector: Selector, cache: Descriptor) -> Self {
        Self { selector, cache }
    }

    /// A segment register as loaded in real mode.
    pub fn real_mode(selector: u16) -> Self {
        Self::new(Selector::new(selector), Descriptor::real_mode(selector, 0))
    }
}

/// `GDTR` or `IDTR`: a linear base address and a 16-bit limit.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}
