use std::{num::NonZeroUsize, ptr::NonNull, sync::Arc};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

use super::handle::HandleInfo;

/// Per-handle cache of FOT resolutions: index to the target's mapping.
///
/// Entries do not hold a reference on the target handle. A target that has since been
/// released to the idle cache is revived on use. One that has been unmapped is dropped.
pub(crate) struct FotCache {
    entries: Option<Mutex<LruCache<u64, Arc<HandleInfo>>>>,
}

impl FotCache {
    pub fn new(len: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(len).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    pub fn get(&self, idx: u64) -> Option<Arc<HandleInfo>> {
        let mut entries = self.entries.as_ref()?.lock();
        let info = entries.get(&idx)?.clone();
        if info.is_unmapped() {
            trace!("fot cache: drop unmapped entry {}", idx);
            entries.pop(&idx);
            return None;
        }
        Some(info)
    }

    pub fn insert(&self, idx: u64, info: Arc<HandleInfo>) {
        if let Some(entries) = &self.entries {
            entries.lock().put(idx, info);
        }
    }

    /// Start of the cached target for `idx`, if it is mapped and backs at least `min_len`
    /// bytes.
    pub fn resolve_cached_ptr(&self, idx: u64, min_len: usize) -> Option<NonNull<u8>> {
        let info = self.get(idx)?;
        if info.valid_len() < min_len {
            return None;
        }
        NonNull::new(info.region.start)
    }

    pub fn clear(&self) {
        if let Some(entries) = &self.entries {
            entries.lock().clear();
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |e| e.lock().len())
    }
}
