#![allow(dead_code)]

use std::{
    path::Path,
    sync::{atomic::AtomicU64, Arc},
};

use objspace_object_store::{ObjectStore, StoreConfig, StoreStatsSnapshot};
use objspace_rt::{
    abi::{
        create::{CreateTieFlags, CreateTieSpec, ObjectCreate},
        object::{MapFlags, ObjID},
    },
    ObjectHandle, Runtime, RuntimeConfig,
};
use tempfile::TempDir;

/// A runtime over a store in a temporary directory. Fields drop in order, so the runtime goes
/// before the store and the store before its directory.
pub struct Env {
    pub rt: Runtime,
    pub store: Arc<ObjectStore>,
    pub dir: TempDir,
}

impl Env {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let dir = TempDir::new().unwrap();
        Self::open(dir, StoreConfig::default(), config)
    }

    pub fn with_store_config(store_config: StoreConfig) -> Self {
        let dir = TempDir::new().unwrap();
        Self::open(dir, store_config, RuntimeConfig::default())
    }

    fn open(dir: TempDir, store_config: StoreConfig, config: RuntimeConfig) -> Self {
        let store = open_store(dir.path(), store_config);
        let rt = Runtime::new(store.clone(), config);
        Self { rt, store, dir }
    }

    /// Drop the runtime and the store, then open both again over the same directory.
    pub fn reopen(self) -> Self {
        let Env { rt, store, dir } = self;
        let config = rt.config().clone();
        let store_config = store.config().clone();
        drop(rt);
        drop(store);
        Self::open(dir, store_config, config)
    }

    pub fn stats(&self) -> StoreStatsSnapshot {
        self.store.stats().snapshot()
    }

    pub fn persistent(&self) -> ObjID {
        self.rt
            .create_object(&ObjectCreate::persistent(), &[], &[], None)
            .unwrap()
    }

    pub fn volatile(&self) -> ObjID {
        self.rt
            .create_object(&ObjectCreate::default(), &[], &[], None)
            .unwrap()
    }

    /// A persistent object that ties `target`.
    pub fn persistent_tied_to(&self, target: ObjID) -> ObjID {
        self.rt
            .create_object(
                &ObjectCreate::persistent(),
                &[],
                &[CreateTieSpec::new(target, CreateTieFlags::empty())],
                None,
            )
            .unwrap()
    }
}

pub fn open_store(root: &Path, config: StoreConfig) -> Arc<ObjectStore> {
    let config = StoreConfig {
        root: root.to_path_buf(),
        ..config
    };
    Arc::new(ObjectStore::open(config).unwrap())
}

pub fn rw() -> MapFlags {
    MapFlags::READ | MapFlags::WRITE
}

pub fn rwp() -> MapFlags {
    MapFlags::READ | MapFlags::WRITE | MapFlags::PERSIST
}

/// The 64-bit word at `off` bytes past the handle's first usable byte.
pub fn word(handle: &ObjectHandle, off: usize) -> &AtomicU64 {
    assert_eq!(off % 8, 0);
    assert!(handle.map_flags().base_offset() + off + 8 <= handle.valid_len());
    unsafe { &*handle.base_ptr().add(off).cast::<AtomicU64>() }
}
