//! Shared definitions for the objspace runtime: object IDs, mapping flags, the on-object
//! metadata layout (including the Foreign Object Table), the error taxonomy, and the
//! [service::ObjectService] boundary that the runtime uses to reach the backing store.

pub mod create;
pub mod error;
pub mod meta;
pub mod object;
pub mod service;
pub mod sync;

pub use error::TwzError;

pub type Result<T> = core::result::Result<T, TwzError>;
