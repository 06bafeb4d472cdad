use std::{
    collections::{BTreeMap, HashMap},
    sync::{atomic::Ordering, Arc},
};

use lru::LruCache;
use tracing::trace;

use super::{handle::HandleInfo, ObjectMapKey};

/// Counters reported by [crate::Runtime::cache_stats].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Mappings with at least one owner.
    pub active: usize,
    /// Released mappings kept for reuse.
    pub idle: usize,
}

/// Result of looking a key up in the cache.
pub(crate) enum Activation {
    /// A usable mapping. Its reference count already includes the caller.
    Hit(Arc<HandleInfo>),
    /// An idle mapping of an object that has since been deleted or replaced. The caller must
    /// unmap it.
    Stale(Arc<HandleInfo>),
    Miss,
}

/// Deduplicates mappings. Every live mapping is either active (owned by at least one handle) or
/// idle (in an LRU of released mappings waiting to be reused). The cache never calls into the
/// object service; it hands back the mappings that must be unmapped.
pub(crate) struct HandleCache {
    active: HashMap<ObjectMapKey, Arc<HandleInfo>>,
    idle: LruCache<ObjectMapKey, Arc<HandleInfo>>,
    idle_len: usize,
    slotmap: BTreeMap<usize, Arc<HandleInfo>>,
    stats: CacheStats,
}

fn slot_of(info: &HandleInfo) -> usize {
    info.region.meta as usize
}

impl HandleCache {
    pub fn new(idle_len: usize) -> Self {
        Self {
            active: HashMap::new(),
            idle: LruCache::unbounded(),
            idle_len,
            slotmap: BTreeMap::new(),
            stats: CacheStats::default(),
        }
    }

    /// Look up `key`, counting the outcome. `epoch` is the object's current generation as
    /// reported by the service; cached mappings from another generation are not returned.
    pub fn activate(&mut self, key: ObjectMapKey, epoch: Option<u64>) -> Activation {
        let res = self.take(key, epoch);
        match &res {
            Activation::Hit(_) => self.stats.hits += 1,
            _ => self.stats.misses += 1,
        }
        res
    }

    /// Like [Self::activate], without touching the counters. Used to re-check after mapping.
    pub fn take(&mut self, key: ObjectMapKey, epoch: Option<u64>) -> Activation {
        match self.active.get(&key) {
            Some(info) if Some(info.region.epoch) == epoch => {
                trace!("activate {:?}", key);
                info.refs.fetch_add(1, Ordering::AcqRel);
                return Activation::Hit(info.clone());
            }
            Some(_) => {
                // Detach. Its owners unmap it on their last release.
                trace!("detach stale active {:?}", key);
                self.active.remove(&key);
            }
            None => {}
        }

        let Some(info) = self.idle.pop(&key) else {
            return Activation::Miss;
        };
        if Some(info.region.epoch) != epoch {
            trace!("drop stale idle {:?}", key);
            self.retire(&info);
            return Activation::Stale(info);
        }
        trace!("activate {:?} from idle", key);
        info.refs.store(1, Ordering::Release);
        self.active.insert(key, info.clone());
        Activation::Hit(info)
    }

    /// Take a reference on a specific mapping, if it is still cached and from the object's
    /// current generation. Used by the FOT cache, which remembers mappings rather than keys.
    pub fn revive(&mut self, info: &Arc<HandleInfo>, epoch: Option<u64>) -> Activation {
        if info.is_unmapped() {
            return Activation::Miss;
        }
        let current = Some(info.region.epoch) == epoch;
        if self
            .active
            .get(&info.key)
            .is_some_and(|a| Arc::ptr_eq(a, info))
        {
            if !current {
                // Left for its owners, as in take.
                return Activation::Miss;
            }
            info.refs.fetch_add(1, Ordering::AcqRel);
            return Activation::Hit(info.clone());
        }
        if self
            .idle
            .peek(&info.key)
            .is_some_and(|i| Arc::ptr_eq(i, info))
        {
            self.idle.pop(&info.key);
            if !current {
                trace!("drop stale idle {:?}", info.key);
                self.retire(info);
                return Activation::Stale(info.clone());
            }
            trace!("revive {:?} from idle", info.key);
            info.refs.store(1, Ordering::Release);
            self.active.insert(info.key, info.clone());
            self.stats.hits += 1;
            return Activation::Hit(info.clone());
        }
        Activation::Miss
    }

    /// Insert a fresh mapping into the active set. The key must not be active.
    pub fn insert(&mut self, info: Arc<HandleInfo>) {
        trace!("insert {:?}", info.key);
        self.slotmap.insert(slot_of(&info), info.clone());
        let _r = self.active.insert(info.key, info);
        debug_assert!(_r.is_none());
    }

    /// Mark a mapping as going away. Returns false if someone else already did.
    fn retire(&mut self, info: &Arc<HandleInfo>) -> bool {
        if info.unmapped.swap(true, Ordering::AcqRel) {
            return false;
        }
        let slot = slot_of(info);
        if self
            .slotmap
            .get(&slot)
            .is_some_and(|s| Arc::ptr_eq(s, info))
        {
            self.slotmap.remove(&slot);
        }
        true
    }

    /// A mapping lost its last owner. Returns the mappings to unmap.
    pub fn release(&mut self, info: &Arc<HandleInfo>) -> Vec<Arc<HandleInfo>> {
        let mut to_unmap = Vec::new();
        if info.refs.load(Ordering::Acquire) != 0 {
            // Revived between the last drop and this call.
            return to_unmap;
        }
        let is_active = self
            .active
            .get(&info.key)
            .is_some_and(|a| Arc::ptr_eq(a, info));
        if !is_active {
            let is_idle = self
                .idle
                .peek(&info.key)
                .is_some_and(|i| Arc::ptr_eq(i, info));
            if !is_idle && self.retire(info) {
                to_unmap.push(info.clone());
            }
            return to_unmap;
        }

        self.active.remove(&info.key);
        if self.idle_len == 0
            || info.no_cache.load(Ordering::Acquire)
            || self.idle.contains(&info.key)
        {
            trace!("release {:?} uncached", info.key);
            if self.retire(info) {
                to_unmap.push(info.clone());
            }
            return to_unmap;
        }

        trace!("release {:?} to idle", info.key);
        self.idle.put(info.key, info.clone());
        while self.idle.len() > self.idle_len {
            let Some((oldkey, old)) = self.idle.pop_lru() else {
                break;
            };
            trace!("evict {:?}", oldkey);
            self.stats.evictions += 1;
            if self.retire(&old) {
                to_unmap.push(old);
            }
        }
        to_unmap
    }

    /// Find the live mapping containing `ptr`.
    pub fn lookup_ptr(&self, ptr: *const u8) -> Option<Arc<HandleInfo>> {
        let (_, info) = self.slotmap.range(..=ptr as usize).next_back()?;
        if info.region.contains(ptr) && !info.is_unmapped() {
            Some(info.clone())
        } else {
            None
        }
    }

    /// Drop every idle mapping. Returns the mappings to unmap.
    pub fn flush(&mut self) -> Vec<Arc<HandleInfo>> {
        let mut to_unmap = Vec::new();
        while let Some((key, info)) = self.idle.pop_lru() {
            trace!("flush {:?}", key);
            if self.retire(&info) {
                to_unmap.push(info);
            }
        }
        to_unmap
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            active: self.active.len(),
            idle: self.idle.len(),
            ..self.stats
        }
    }
}
