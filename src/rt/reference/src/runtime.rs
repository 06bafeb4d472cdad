//! Top level runtime module: object mapping, FOT resolution and durability for one process.

use std::sync::Arc;

use objspace_rt_abi::service::ObjectService;

pub mod config;
pub(crate) mod object;
mod sync;

pub use config::RuntimeConfig;
pub use object::{CacheStats, ObjectHandle, ObjectMapKey, ReleaseFlags};
pub use sync::SyncStatus;

use self::{object::ObjectManager, sync::DurabilityCoordinator};

/// A process's view of the object space, backed by an [ObjectService].
///
/// All methods take `&self`; a runtime is meant to be shared between threads.
pub struct Runtime {
    config: RuntimeConfig,
    pub(crate) objects: Arc<ObjectManager>,
    durability: DurabilityCoordinator,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Runtime({:?})", self.objects.stats())
    }
}

impl Runtime {
    pub fn new(service: Arc<dyn ObjectService>, config: RuntimeConfig) -> Self {
        tracing::debug!("starting runtime with {:?}", config);
        let objects = ObjectManager::new(service, config.handle_cache_len, config.fot_cache_len);
        let durability = DurabilityCoordinator::new(config.async_durability);
        Self {
            config,
            objects,
            durability,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn service(&self) -> &Arc<dyn ObjectService> {
        self.objects.service()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.durability.shutdown();
        self.objects.flush();
    }
}
