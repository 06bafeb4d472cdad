//! A host-side object store: every object is a file, every mapping an `mmap` of that file.
//!
//! Persistent objects live under `<root>/persistent` and survive reopening the store. Volatile
//! objects live under `<root>/volatile`, which is wiped whenever a store is opened or dropped.
//! A JSON catalog at `<root>/catalog.json` remembers names and ties of persistent objects.

use std::{
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
};

use objspace_rt_abi::object::MAX_DATA_LEN;
use serde::{Deserialize, Serialize};

mod catalog;
mod error;
mod id;
mod object;
mod store;
mod ties;

pub use error::StoreError;
pub use store::{ObjectInfo, ObjectStore};

/// Configuration of an [ObjectStore].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the store's files.
    pub root: PathBuf,
    /// Initial data length of objects created without an explicit length.
    pub default_len: usize,
    /// Largest data length an object may grow to.
    pub max_len: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("objspace-store"),
            default_len: 64 * 1024,
            max_len: MAX_DATA_LEN,
        }
    }
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }
}

/// Counters of service calls, for observing cache behavior from outside the runtime.
#[derive(Debug, Default)]
pub struct StoreStats {
    map_calls: AtomicU64,
    release_calls: AtomicU64,
    sync_calls: AtomicU64,
    creates: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStatsSnapshot {
    pub map_calls: u64,
    pub release_calls: u64,
    pub sync_calls: u64,
    pub creates: u64,
}

impl StoreStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            map_calls: self.map_calls.load(Ordering::Relaxed),
            release_calls: self.release_calls.load(Ordering::Relaxed),
            sync_calls: self.sync_calls.load(Ordering::Relaxed),
            creates: self.creates.load(Ordering::Relaxed),
        }
    }
}
