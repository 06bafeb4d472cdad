//! User-space runtime for the object space: a deduplicating handle cache over an object
//! service, Foreign Object Table insertion and resolution, and publishing of persistent updates.

mod runtime;

pub use objspace_rt_abi as abi;
pub use runtime::{
    CacheStats, ObjectHandle, ObjectMapKey, ReleaseFlags, Runtime, RuntimeConfig, SyncStatus,
};
