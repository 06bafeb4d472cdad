use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
};

use objspace_rt_abi::{
    meta::MetaInfo,
    object::{MapFlags, ObjID},
    service::{MappedRegion, ObjectService},
    Result, TwzError,
};

use super::{fotcache::FotCache, ObjectManager, ObjectMapKey};

bitflags::bitflags! {
    /// Flags for [crate::Runtime::release_handle].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReleaseFlags: u32 {
        /// Unmap once the last owner releases, instead of keeping the mapping for reuse.
        const NO_CACHE = 1;
    }
}

/// Runtime-side state shared by every clone of one handle.
pub(crate) struct HandleInfo {
    pub(crate) key: ObjectMapKey,
    pub(crate) region: MappedRegion,
    valid_len: AtomicUsize,
    pub(crate) refs: AtomicU64,
    pub(crate) no_cache: AtomicBool,
    pub(crate) unmapped: AtomicBool,
    pub(crate) fot_cache: FotCache,
    pub(crate) service: Arc<dyn ObjectService>,
    manager: Weak<ObjectManager>,
}

impl HandleInfo {
    pub(crate) fn new(
        key: ObjectMapKey,
        region: MappedRegion,
        service: Arc<dyn ObjectService>,
        manager: Weak<ObjectManager>,
        fot_cache_len: usize,
    ) -> Self {
        Self {
            key,
            valid_len: AtomicUsize::new(region.valid_len),
            region,
            refs: AtomicU64::new(1),
            no_cache: AtomicBool::new(false),
            unmapped: AtomicBool::new(false),
            fot_cache: FotCache::new(fot_cache_len),
            service,
            manager,
        }
    }

    pub(crate) fn valid_len(&self) -> usize {
        self.valid_len.load(Ordering::Acquire)
    }

    /// Record a larger backed length. Never shrinks.
    pub(crate) fn raise_valid_len(&self, len: usize) -> usize {
        self.valid_len.fetch_max(len, Ordering::AcqRel).max(len)
    }

    pub(crate) fn meta_info(&self) -> &MetaInfo {
        // Safety: the meta region is mapped for as long as this info is not unmapped, and every
        // holder of a HandleInfo reference either owns a ref or checked `unmapped`.
        unsafe { &*self.region.meta.cast::<MetaInfo>() }
    }

    pub(crate) fn is_unmapped(&self) -> bool {
        self.unmapped.load(Ordering::Acquire)
    }

    /// Tear down the mapping. Callers claim the teardown first (by setting `unmapped` under
    /// the cache lock), so this runs once per mapping.
    pub(crate) fn unmap(&self) {
        self.unmapped.store(true, Ordering::Release);
        self.fot_cache.clear();
        self.service.release(&self.region);
    }
}

/// A live mapping of one object.
///
/// Clones share the mapping. When the last clone is dropped the mapping goes back to the
/// runtime's handle cache (or is unmapped, see [ReleaseFlags::NO_CACHE]).
pub struct ObjectHandle {
    pub(crate) info: Arc<HandleInfo>,
}

impl ObjectHandle {
    /// Wrap an info whose reference count already accounts for this handle.
    pub(crate) fn from_counted(info: Arc<HandleInfo>) -> Self {
        Self { info }
    }

    pub fn id(&self) -> ObjID {
        self.info.key.0
    }

    pub fn map_flags(&self) -> MapFlags {
        self.info.key.1
    }

    /// Base of the data region.
    pub fn start(&self) -> *mut u8 {
        self.info.region.start
    }

    /// Base of the meta region.
    pub fn meta(&self) -> *mut u8 {
        self.info.region.meta
    }

    pub fn meta_info(&self) -> &MetaInfo {
        self.info.meta_info()
    }

    /// Bytes from [Self::start] that are backed. Only grows.
    pub fn valid_len(&self) -> usize {
        self.info.valid_len()
    }

    /// First usable byte of the data region: past the null page unless the handle was mapped
    /// with [MapFlags::NO_NULLPAGE].
    pub fn base_ptr(&self) -> *mut u8 {
        // Safety: base_offset is within the mapping.
        unsafe { self.start().add(self.map_flags().base_offset()) }
    }

    /// Does `ptr` point into this handle's mapping?
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.info.region.contains(ptr)
    }

    /// Offset of `ptr` from the start of the data region.
    pub fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        let start = self.start() as usize;
        let addr = ptr as usize;
        if addr >= start && self.contains(ptr) {
            Some(addr - start)
        } else {
            None
        }
    }

    fn check_range(&self, off: usize, len: usize) -> Result<()> {
        let end = off.checked_add(len).ok_or(TwzError::INVALID_ARGUMENT)?;
        if off < self.map_flags().base_offset() || end > self.valid_len() {
            return Err(TwzError::INVALID_ARGUMENT);
        }
        Ok(())
    }

    /// Copy bytes out of the data region, starting at `off` from [Self::start].
    pub fn read_at(&self, off: usize, buf: &mut [u8]) -> Result<()> {
        self.check_range(off, buf.len())?;
        // Safety: range checked against the backed length.
        unsafe {
            buf.as_mut_ptr()
                .copy_from_nonoverlapping(self.start().add(off), buf.len())
        };
        Ok(())
    }

    /// Copy bytes into the data region, starting at `off` from [Self::start].
    pub fn write_at(&self, off: usize, data: &[u8]) -> Result<()> {
        if !self.map_flags().contains(MapFlags::WRITE) {
            return Err(TwzError::PERMISSION_DENIED);
        }
        self.check_range(off, data.len())?;
        // Safety: range checked against the backed length, and the mapping is writable.
        unsafe {
            self.start()
                .add(off)
                .copy_from_nonoverlapping(data.as_ptr(), data.len())
        };
        Ok(())
    }
}

impl Clone for ObjectHandle {
    fn clone(&self) -> Self {
        self.info.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            info: self.info.clone(),
        }
    }
}

impl Drop for ObjectHandle {
    fn drop(&mut self) {
        if self.info.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        match self.info.manager.upgrade() {
            Some(manager) => manager.release(&self.info),
            None => {
                if !self.info.unmapped.swap(true, Ordering::AcqRel) {
                    self.info.unmap();
                }
            }
        }
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("id", &self.id())
            .field("flags", &self.map_flags())
            .field("start", &self.start())
            .field("valid_len", &self.valid_len())
            .finish()
    }
}
