//! Low-level object APIs, mostly around IDs and basic things like protection and mapping flags.

use core::{fmt, str::FromStr};

use crate::error::{ArgumentError, TwzError};

/// The maximum size of a mapping, including the meta region.
pub const MAX_SIZE: usize = 16 * 1024 * 1024;
/// The size of the null page at the start of the data region.
pub const NULLPAGE_SIZE: usize = 0x1000;
/// Granularity of object growth.
pub const PAGE_SIZE: usize = 0x1000;
/// The size of the meta region (meta info plus FOT) that precedes the data region.
pub const META_SIZE: usize = 0x10000;
/// The largest number of data bytes an object can hold.
pub const MAX_DATA_LEN: usize = MAX_SIZE - META_SIZE;

/// A 128-bit globally unique object identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ObjID(u128);

impl ObjID {
    pub const fn new(raw: u128) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u128 {
        self.0
    }

    /// Split into (high, low) halves.
    pub const fn parts(&self) -> [u64; 2] {
        [(self.0 >> 64) as u64, self.0 as u64]
    }

    pub const fn from_parts(parts: [u64; 2]) -> Self {
        Self(((parts[0] as u128) << 64) | parts[1] as u128)
    }
}

impl From<u128> for ObjID {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

impl From<ObjID> for u128 {
    fn from(value: ObjID) -> Self {
        value.0
    }
}

impl fmt::Display for ObjID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for ObjID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjID({:x})", self.0)
    }
}

impl fmt::LowerHex for ObjID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl FromStr for ObjID {
    type Err = TwzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        u128::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| ArgumentError::InvalidArgument.into())
    }
}

bitflags::bitflags! {
    /// Mapping flags for a handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct MapFlags: u32 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
        /// Writes through this mapping may be made durable.
        const PERSIST = 8;
        /// Map a stable view that only observes updates on request.
        const INDIRECT = 16;
        /// The data region has no null page; offset zero is usable.
        const NO_NULLPAGE = 32;
    }
}

bitflags::bitflags! {
    /// Default protections of an object.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Protections: u32 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

impl MapFlags {
    /// The object protections a mapping with these flags needs.
    pub fn required_protections(&self) -> Protections {
        let mut prot = Protections::empty();
        if self.contains(MapFlags::READ) {
            prot.insert(Protections::READ);
        }
        if self.contains(MapFlags::WRITE) {
            prot.insert(Protections::WRITE);
        }
        if self.contains(MapFlags::EXEC) {
            prot.insert(Protections::EXEC);
        }
        prot
    }

    /// Offset of the first usable byte of the data region under these flags.
    pub fn base_offset(&self) -> usize {
        if self.contains(MapFlags::NO_NULLPAGE) {
            0
        } else {
            NULLPAGE_SIZE
        }
    }
}
