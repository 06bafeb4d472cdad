//! On-object metadata layout.
//!
//! Every object starts with a meta region of [META_SIZE] bytes. The region begins with a
//! [MetaInfo] header, followed by the Foreign Object Table: an array of [FotEntry] slots that
//! translate a local index into a reference to another object. The data region follows the meta
//! region.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use static_assertions::const_assert_eq;

use crate::{
    create::LifetimeType,
    object::{MapFlags, ObjID, Protections, META_SIZE},
};

pub const META_MAGIC: u32 = 0x7a70_6d6f;
pub const META_VERSION: u32 = 1;

/// Object meta information, at the start of the meta region.
#[repr(C)]
pub struct MetaInfo {
    pub magic: u32,
    pub version: u32,
    pub id: [u64; 2],
    pub kuid: [u64; 2],
    /// One past the highest FOT index ever claimed.
    pub fot_extent: AtomicU32,
    pub default_prot: u32,
    pub lifetime: u32,
    pub flags: u32,
    _resv: u64,
}

const_assert_eq!(core::mem::size_of::<MetaInfo>(), 64);

impl MetaInfo {
    pub fn new(id: ObjID, kuid: ObjID, prot: Protections, lifetime: LifetimeType) -> Self {
        Self {
            magic: META_MAGIC,
            version: META_VERSION,
            id: id.parts(),
            kuid: kuid.parts(),
            fot_extent: AtomicU32::new(0),
            default_prot: prot.bits(),
            lifetime: lifetime as u32,
            flags: 0,
            _resv: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == META_MAGIC && self.version == META_VERSION
    }

    pub fn id(&self) -> ObjID {
        ObjID::from_parts(self.id)
    }

    pub fn default_prot(&self) -> Protections {
        Protections::from_bits_truncate(self.default_prot)
    }

    pub fn fot_extent(&self) -> u64 {
        self.fot_extent.load(Ordering::Acquire) as u64
    }

    /// View the header as raw bytes, for writing it into a fresh object.
    pub fn as_bytes(&self) -> &[u8] {
        // Safety: MetaInfo is repr(C) with no padding (checked above).
        unsafe {
            core::slice::from_raw_parts(
                (self as *const Self).cast::<u8>(),
                core::mem::size_of::<Self>(),
            )
        }
    }

    /// Parse a header out of raw bytes. Returns None if the buffer is too short.
    pub fn read_from(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < core::mem::size_of::<Self>() {
            return None;
        }
        // Safety: length checked, every bit pattern is a valid MetaInfo.
        Some(unsafe { bytes.as_ptr().cast::<Self>().read_unaligned() })
    }
}

bitflags::bitflags! {
    /// State of a FOT slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FotFlags: u32 {
        /// The slot has been claimed by an inserter.
        const ALLOCATED = 1;
        /// The slot's target is written and may be read.
        const ACTIVE = 2;
    }
}

/// A reference stored in a FOT slot: which object, mapped how.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FotTarget {
    pub id: ObjID,
    pub flags: MapFlags,
}

impl FotTarget {
    pub fn new(id: ObjID, flags: MapFlags) -> Self {
        Self { id, flags }
    }
}

/// One slot of the Foreign Object Table.
#[repr(C)]
pub struct FotEntry {
    pub values: [AtomicU64; 2],
    pub resolver: AtomicU64,
    pub flags: AtomicU32,
    pub map_flags: AtomicU32,
}

const_assert_eq!(core::mem::size_of::<FotEntry>(), 32);

/// Offset of the FOT from the start of the meta region.
pub const FOT_OFFSET: usize = core::mem::size_of::<MetaInfo>();
/// Number of FOT slots that fit in the meta region.
pub const MAX_FOT_ENTRIES: u64 =
    ((META_SIZE - FOT_OFFSET) / core::mem::size_of::<FotEntry>()) as u64;
/// Offset of the state word inside a [FotEntry].
pub const FOT_FLAGS_OFFSET: usize = 24;

impl FotEntry {
    pub fn state(&self) -> FotFlags {
        FotFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state().contains(FotFlags::ACTIVE)
    }

    /// Read the target. Only meaningful once the slot is active.
    pub fn target(&self) -> FotTarget {
        let id = ObjID::from_parts([
            self.values[0].load(Ordering::Relaxed),
            self.values[1].load(Ordering::Relaxed),
        ]);
        let flags = MapFlags::from_bits_truncate(self.map_flags.load(Ordering::Relaxed));
        FotTarget { id, flags }
    }

    /// Try to move this slot from empty to allocated.
    pub fn try_claim(&self) -> bool {
        self.flags
            .compare_exchange(
                0,
                FotFlags::ALLOCATED.bits(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Write the target into a claimed slot and make it visible to readers.
    pub fn activate(&self, target: FotTarget) {
        let parts = target.id.parts();
        self.values[0].store(parts[0], Ordering::Relaxed);
        self.values[1].store(parts[1], Ordering::Relaxed);
        self.resolver.store(0, Ordering::Relaxed);
        self.map_flags.store(target.flags.bits(), Ordering::Relaxed);
        self.flags.store(
            (FotFlags::ALLOCATED | FotFlags::ACTIVE).bits(),
            Ordering::Release,
        );
    }
}

/// Byte offset of FOT slot `idx` from the start of the meta region.
pub const fn fot_entry_offset(idx: u64) -> usize {
    FOT_OFFSET + idx as usize * core::mem::size_of::<FotEntry>()
}

/// Pointer to FOT slot `idx`, given the base of a mapped meta region.
///
/// # Safety
/// `meta` must point to a mapped meta region and `idx` must be below [MAX_FOT_ENTRIES].
pub unsafe fn fot_entry_ptr(meta: *const u8, idx: u64) -> *const FotEntry {
    debug_assert!(idx < MAX_FOT_ENTRIES);
    meta.add(fot_entry_offset(idx)).cast()
}
