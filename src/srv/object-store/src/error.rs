use objspace_rt_abi::{
    error::{GenericError, ObjectError, ResourceError, SecurityError},
    object::ObjID,
    TwzError,
};
use thiserror::Error;

/// Failures inside the store, before they are folded into the runtime's error taxonomy.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog error: {0}")]
    Catalog(#[from] serde_json::Error),
    #[error("object {0} has corrupt metadata")]
    CorruptMeta(ObjID),
}

impl From<StoreError> for TwzError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ObjectError::NoSuchObject.into(),
                std::io::ErrorKind::PermissionDenied => SecurityError::PermissionDenied.into(),
                std::io::ErrorKind::OutOfMemory => ResourceError::OutOfMemory.into(),
                _ => {
                    tracing::warn!("store I/O failure: {}", e);
                    GenericError::Internal.into()
                }
            },
            StoreError::Catalog(e) => {
                tracing::warn!("store catalog failure: {}", e);
                GenericError::Internal.into()
            }
            StoreError::CorruptMeta(_) => ObjectError::InvalidMeta.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
