use super::{Term, HARDWARE, HW_CACHE};

const PRESET_MASK: u32 = 0x8000_0000;

/// Portable named events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Preset {
    /// Level 1 data cache misses.
    L1Dcm,
    /// Level 1 instruction cache misses.
    L1Icm,
    /// Last level cache misses.
    L3Tcm,
    /// Data TLB misses.
    TlbDm,
    /// Instruction TLB misses.
    TlbIm,
    /// Mispredicted branches.
    BrMsp,
    /// Retired instructions.
    TotIns,
    /// Branch instructions.
    BrIns,
    /// Total cycles.
    TotCyc,
    /// Reference cycles, not affected by frequency scaling.
    RefCyc,
}

const ALL: [Preset; 10] = [
    Preset::L1Dcm,
    Preset::L1Icm,
    Preset::L3Tcm,
    Preset::TlbDm,
    Preset::TlbIm,
    Preset::BrMsp,
    Preset::TotIns,
    Preset::BrIns,
    Preset::TotCyc,
    Preset::RefCyc,
];

impl Preset {
    /// Numeric code of the preset, with the preset bit set.
    pub const fn code(self) -> u32 {
        let idx = match self {
            Preset::L1Dcm => 0x00,
            Preset::L1Icm => 0x01,
            Preset::L3Tcm => 0x08,
            Preset::TlbDm => 0x14,
            Preset::TlbIm => 0x15,
            Preset::BrMsp => 0x2e,
            Preset::TotIns => 0x32,
            Preset::BrIns => 0x37,
            Preset::TotCyc => 0x3b,
            Preset::RefCyc => 0x6b,
        };
        PRESET_MASK | idx
    }

    pub fn from_code(code: u32) -> Option<Self> {
        ALL.into_iter().find(|p| p.code() == code)
    }

    /// The generalized hardware event backing this preset.
    pub const fn term(self) -> Term {
        // Cache events are encoded as `id | (op << 8) | (result << 16)`,
        // every preset here is a read miss.
        const fn cache_miss(id: u64) -> Term {
            Term::new(HW_CACHE, id | (1 << 16))
        }

        match self {
            Preset::L1Dcm => cache_miss(0),
            Preset::L1Icm => cache_miss(1),
            Preset::TlbDm => cache_miss(3),
            Preset::TlbIm => cache_miss(4),
            Preset::TotCyc => Term::new(HARDWARE, 0),
            Preset::TotIns => Term::new(HARDWARE, 1),
            Preset::L3Tcm => Term::new(HARDWARE, 3),
            Preset::BrIns => Term::new(HARDWARE, 4),
            Preset::BrMsp => Term::new(HARDWARE, 5),
            Preset::RefCyc => Term::new(HARDWARE, 9),
        }
    }
}
