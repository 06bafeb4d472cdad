use std::sync::{Arc, Weak};

use handlecache::{Activation, HandleCache};
use objspace_rt_abi::{
    create::{CreateTieSpec, ObjectCreate, ObjectSource},
    object::{MapFlags, ObjID, MAX_DATA_LEN},
    service::{MappedRegion, ObjectCmd, ObjectService},
    Result, TwzError,
};
use parking_lot::Mutex;
use tracing::warn;

pub use handle::{ObjectHandle, ReleaseFlags};
pub(crate) use handle::HandleInfo;
pub use handlecache::CacheStats;

use super::Runtime;

pub(crate) mod fot;
mod fotcache;
mod handle;
mod handlecache;
#[cfg(test)]
pub(crate) mod testing;

/// A key for local mappings of objects.
#[derive(PartialEq, PartialOrd, Ord, Eq, Hash, Copy, Clone, Debug)]
pub struct ObjectMapKey(pub ObjID, pub MapFlags);

/// Owns the handle cache and is the only caller of the service's map and release operations.
pub(crate) struct ObjectManager {
    service: Arc<dyn ObjectService>,
    cache: Mutex<HandleCache>,
    fot_cache_len: usize,
    this: Weak<ObjectManager>,
}

impl ObjectManager {
    pub fn new(
        service: Arc<dyn ObjectService>,
        handle_cache_len: usize,
        fot_cache_len: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            service,
            cache: Mutex::new(HandleCache::new(handle_cache_len)),
            fot_cache_len,
            this: this.clone(),
        })
    }

    pub fn service(&self) -> &Arc<dyn ObjectService> {
        &self.service
    }

    fn try_cached(&self, key: ObjectMapKey) -> Option<ObjectHandle> {
        let epoch = self.service.epoch(key.0);
        let activation = self.cache.lock().activate(key, epoch);
        match activation {
            Activation::Hit(info) => Some(ObjectHandle::from_counted(info)),
            Activation::Stale(old) => {
                self.unmap(&old);
                None
            }
            Activation::Miss => None,
        }
    }

    /// Map an object, reusing a cached mapping if there is a valid one. The service is only
    /// called with the cache unlocked.
    pub fn map_object(&self, key: ObjectMapKey) -> Result<ObjectHandle> {
        if let Some(handle) = self.try_cached(key) {
            return Ok(handle);
        }
        let region = self.service.map(key.0, key.1)?;
        Ok(self.install(key, region))
    }

    pub fn map_pair(
        &self,
        a: ObjectMapKey,
        b: ObjectMapKey,
    ) -> Result<(ObjectHandle, ObjectHandle)> {
        match (self.try_cached(a), self.try_cached(b)) {
            (Some(ha), Some(hb)) => Ok((ha, hb)),
            (Some(ha), None) => Ok((ha, self.map_object(b)?)),
            (None, Some(hb)) => Ok((self.map_object(a)?, hb)),
            (None, None) => {
                let (ra, rb) = self.service.map_pair((a.0, a.1), (b.0, b.1))?;
                Ok((self.install(a, ra), self.install(b, rb)))
            }
        }
    }

    /// Publish a fresh mapping in the cache. If another thread mapped the same key meanwhile,
    /// its mapping wins and ours is released.
    fn install(&self, key: ObjectMapKey, region: MappedRegion) -> ObjectHandle {
        let info = Arc::new(HandleInfo::new(
            key,
            region,
            self.service.clone(),
            self.this.clone(),
            self.fot_cache_len,
        ));
        let mut loser = None;
        let mut stale = None;
        let winner = {
            let mut cache = self.cache.lock();
            match cache.take(key, Some(region.epoch)) {
                Activation::Hit(existing) => {
                    loser = Some(info);
                    existing
                }
                Activation::Stale(old) => {
                    stale = Some(old);
                    cache.insert(info.clone());
                    info
                }
                Activation::Miss => {
                    cache.insert(info.clone());
                    info
                }
            }
        };
        if let Some(loser) = loser {
            warn!("lost mapping race for {:?}, releasing duplicate", key);
            loser.unmap();
        }
        if let Some(stale) = stale {
            self.unmap(&stale);
        }
        ObjectHandle::from_counted(winner)
    }

    /// Get a new owner for a mapping that may be idle. Mappings of a deleted or reopened
    /// object are not handed out again.
    pub fn revive(&self, info: &Arc<HandleInfo>) -> Option<ObjectHandle> {
        if info.is_unmapped() {
            return None;
        }
        let epoch = self.service.epoch(info.key.0);
        if epoch == Some(info.region.epoch) {
            let fast = info.refs.fetch_update(
                std::sync::atomic::Ordering::AcqRel,
                std::sync::atomic::Ordering::Acquire,
                |r| (r > 0).then_some(r + 1),
            );
            if fast.is_ok() {
                return Some(ObjectHandle::from_counted(info.clone()));
            }
        }
        let activation = self.cache.lock().revive(info, epoch);
        match activation {
            Activation::Hit(info) => Some(ObjectHandle::from_counted(info)),
            Activation::Stale(old) => {
                self.unmap(&old);
                None
            }
            Activation::Miss => None,
        }
    }

    /// Called when the last owner of `info` goes away.
    pub fn release(&self, info: &Arc<HandleInfo>) {
        let to_unmap = self.cache.lock().release(info);
        for info in to_unmap {
            self.unmap(&info);
        }
    }

    fn unmap(&self, info: &HandleInfo) {
        tracing::debug!("unmap {:?}", info.key);
        info.unmap();
    }

    pub fn lookup_ptr(&self, ptr: *const u8) -> Option<Arc<HandleInfo>> {
        self.cache.lock().lookup_ptr(ptr)
    }

    /// Make at least `min_len` bytes of the handle's data region addressable.
    pub fn grow(&self, info: &HandleInfo, min_len: usize) -> Result<usize> {
        let len = self.service.grow(&info.region, min_len)?;
        Ok(info.raise_valid_len(len))
    }

    pub fn flush(&self) {
        let to_unmap = self.cache.lock().flush();
        for info in to_unmap {
            self.unmap(&info);
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }
}

impl Runtime {
    /// Map an object into this process.
    #[tracing::instrument(skip(self), level = "trace")]
    pub fn map_object(&self, id: ObjID, flags: MapFlags) -> Result<ObjectHandle> {
        self.objects.map_object(ObjectMapKey(id, flags))
    }

    /// Map two objects in one request to the backing service.
    #[tracing::instrument(skip(self), level = "trace")]
    pub fn map_two_objects(
        &self,
        id_a: ObjID,
        flags_a: MapFlags,
        id_b: ObjID,
        flags_b: MapFlags,
    ) -> Result<(ObjectHandle, ObjectHandle)> {
        self.objects
            .map_pair(ObjectMapKey(id_a, flags_a), ObjectMapKey(id_b, flags_b))
    }

    /// Give up ownership of a handle. Dropping a handle does the same with empty flags.
    #[tracing::instrument(skip(self), level = "trace")]
    pub fn release_handle(&self, handle: ObjectHandle, flags: ReleaseFlags) {
        if flags.contains(ReleaseFlags::NO_CACHE) {
            handle
                .info
                .no_cache
                .store(true, std::sync::atomic::Ordering::Release);
        }
        drop(handle);
    }

    #[tracing::instrument(skip(self, sources, ties), level = "trace")]
    pub fn create_object(
        &self,
        spec: &ObjectCreate,
        sources: &[ObjectSource],
        ties: &[CreateTieSpec],
        name: Option<&str>,
    ) -> Result<ObjID> {
        let id = self.objects.service().create(spec, sources, ties, name)?;
        tracing::debug!("created object {}", id);
        Ok(id)
    }

    /// Create an object and map it. If the mapping fails, the new object is deleted again.
    pub fn create_and_map(
        &self,
        spec: &ObjectCreate,
        sources: &[ObjectSource],
        ties: &[CreateTieSpec],
        name: Option<&str>,
        flags: MapFlags,
    ) -> Result<ObjectHandle> {
        let id = self.create_object(spec, sources, ties, name)?;
        self.map_object(id, flags).inspect_err(|e| {
            warn!("failed to map new object {}: {}", id, e);
            self.delete_unmapped(id);
        })
    }

    fn delete_unmapped(&self, id: ObjID) {
        let service = self.objects.service();
        match service.map(id, MapFlags::READ) {
            Ok(region) => {
                if let Err(e) = service.object_cmd(&region, ObjectCmd::Delete) {
                    warn!("failed to delete object {}: {}", id, e);
                }
                service.release(&region);
            }
            Err(e) => warn!("failed to delete object {}: {}", id, e),
        }
    }

    /// Run a command against the object behind `handle`. `Update` refreshes the handle's backed
    /// length and forgets its cached FOT resolutions.
    #[tracing::instrument(skip(self), level = "trace")]
    pub fn object_cmd(&self, handle: &ObjectHandle, cmd: ObjectCmd) -> Result<()> {
        let service = self.objects.service();
        service.object_cmd(&handle.info.region, cmd)?;
        if cmd == ObjectCmd::Update {
            let len = service.grow(&handle.info.region, 0)?;
            handle.info.raise_valid_len(len);
            handle.info.fot_cache.clear();
        }
        Ok(())
    }

    /// Make at least `min_len` bytes of the handle's data region addressable.
    pub fn grow_object(&self, handle: &ObjectHandle, min_len: usize) -> Result<usize> {
        if min_len > MAX_DATA_LEN {
            return Err(TwzError::INVALID_ARGUMENT);
        }
        self.objects.grow(&handle.info, min_len)
    }

    /// Start of the data region of the mapping that contains `ptr`.
    pub fn locate_object_start(&self, ptr: *const u8) -> Option<*mut u8> {
        self.objects.lookup_ptr(ptr).map(|info| info.region.start)
    }

    /// A new handle on the mapping that contains `ptr`.
    #[tracing::instrument(skip(self), level = "trace")]
    pub fn get_object_handle(&self, ptr: *const u8) -> Result<ObjectHandle> {
        self.objects
            .lookup_ptr(ptr)
            .and_then(|info| self.objects.revive(&info))
            .ok_or(TwzError::INVALID_ARGUMENT)
    }

    /// Unmap every idle cached handle.
    pub fn flush_cache(&self) {
        self.objects.flush();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.objects.stats()
    }
}
