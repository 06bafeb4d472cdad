//! Error taxonomy shared by the runtime and the backing store.
//!
//! Errors are grouped into categories. A [TwzError] can be packed into a single word
//! ([RawTwzError]) so that it can be stored into a durable word inside an object.

use thiserror::Error;

/// Packed error code used when an error has to travel through memory.
pub const SUCCESS: u64 = 0;
pub const ERROR_CODE_MASK: u64 = 0xffff;
pub const ERROR_CODE_SHIFT: u64 = 0;
pub const ERROR_CATEGORY_MASK: u64 = 0xffff_0000;
pub const ERROR_CATEGORY_SHIFT: u64 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct RawTwzError(u64);

impl RawTwzError {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn success() -> Self {
        Self(SUCCESS)
    }

    pub fn from_parts(cat: u16, code: u16) -> Self {
        let cat = ((cat as u64) << ERROR_CATEGORY_SHIFT) & ERROR_CATEGORY_MASK;
        let code = ((code as u64) << ERROR_CODE_SHIFT) & ERROR_CODE_MASK;
        Self(cat | code)
    }

    pub fn category(&self) -> ErrorCategory {
        let cat = ((self.0 & ERROR_CATEGORY_MASK) >> ERROR_CATEGORY_SHIFT) as u16;
        ErrorCategory::from_raw(cat)
    }

    pub fn code(&self) -> u16 {
        ((self.0 & ERROR_CODE_MASK) >> ERROR_CODE_SHIFT) as u16
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn is_success(&self) -> bool {
        self.0 == SUCCESS
    }

    pub fn error(&self) -> TwzError {
        let code = self.code();
        let err = match self.category() {
            ErrorCategory::Uncategorized => None,
            ErrorCategory::Generic => GenericError::from_code(code).map(TwzError::Generic),
            ErrorCategory::Argument => ArgumentError::from_code(code).map(TwzError::Argument),
            ErrorCategory::Resource => ResourceError::from_code(code).map(TwzError::Resource),
            ErrorCategory::Object => ObjectError::from_code(code).map(TwzError::Object),
            ErrorCategory::Security => SecurityError::from_code(code).map(TwzError::Security),
        };
        err.unwrap_or(TwzError::Uncategorized(code))
    }

    pub fn result(&self) -> Result<(), TwzError> {
        if self.is_success() {
            Ok(())
        } else {
            Err(self.error())
        }
    }
}

impl From<TwzError> for RawTwzError {
    fn from(value: TwzError) -> Self {
        Self(value.raw())
    }
}

impl From<Result<(), TwzError>> for RawTwzError {
    fn from(value: Result<(), TwzError>) -> Self {
        match value {
            Ok(()) => Self::success(),
            Err(e) => e.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Error)]
pub enum TwzError {
    #[error("uncategorized error: {0}")]
    Uncategorized(u16),
    #[error("generic error: {0}")]
    Generic(#[from] GenericError),
    #[error("argument error: {0}")]
    Argument(#[from] ArgumentError),
    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),
    #[error("object error: {0}")]
    Object(#[from] ObjectError),
    #[error("security error: {0}")]
    Security(#[from] SecurityError),
}

impl TwzError {
    pub const NOT_SUPPORTED: Self = Self::Generic(GenericError::NotSupported);
    pub const TIMED_OUT: Self = Self::Generic(GenericError::TimedOut);
    pub const INVALID_ARGUMENT: Self = Self::Argument(ArgumentError::InvalidArgument);
    pub const OUT_OF_RESOURCES: Self = Self::Resource(ResourceError::OutOfResources);
    pub const NO_SUCH_OBJECT: Self = Self::Object(ObjectError::NoSuchObject);
    pub const PERMISSION_DENIED: Self = Self::Security(SecurityError::PermissionDenied);
    /// A compare-and-set lost to a concurrent writer.
    pub const CONFLICT: Self = Self::Resource(ResourceError::Refused);

    pub fn category(&self) -> ErrorCategory {
        match self {
            TwzError::Uncategorized(_) => ErrorCategory::Uncategorized,
            TwzError::Generic(_) => ErrorCategory::Generic,
            TwzError::Argument(_) => ErrorCategory::Argument,
            TwzError::Resource(_) => ErrorCategory::Resource,
            TwzError::Object(_) => ErrorCategory::Object,
            TwzError::Security(_) => ErrorCategory::Security,
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            TwzError::Uncategorized(code) => *code,
            TwzError::Generic(e) => *e as u16,
            TwzError::Argument(e) => *e as u16,
            TwzError::Resource(e) => *e as u16,
            TwzError::Object(e) => *e as u16,
            TwzError::Security(e) => *e as u16,
        }
    }

    pub fn raw(&self) -> u64 {
        RawTwzError::from_parts(self.category().raw(), self.code()).raw()
    }

    /// Is this a lost compare-and-set, which the caller may retry after re-reading?
    pub fn is_conflict(&self) -> bool {
        *self == Self::CONFLICT
    }

    /// Collapse into the coarse mapping error taxonomy.
    pub fn map_error(&self) -> MapError {
        match self {
            TwzError::Resource(ResourceError::OutOfResources | ResourceError::OutOfMemory) => {
                MapError::OutOfResources
            }
            TwzError::Object(ObjectError::NoSuchObject) => MapError::NoSuchObject,
            TwzError::Security(SecurityError::PermissionDenied) => MapError::PermissionDenied,
            TwzError::Argument(_) => MapError::InvalidArgument,
            _ => MapError::Other,
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum ErrorCategory {
    Uncategorized = 0,
    Generic = 1,
    Argument = 2,
    Resource = 3,
    Object = 4,
    Security = 5,
}

impl ErrorCategory {
    pub fn raw(&self) -> u16 {
        *self as u16
    }

    fn from_raw(raw: u16) -> Self {
        match raw {
            1 => Self::Generic,
            2 => Self::Argument,
            3 => Self::Resource,
            4 => Self::Object,
            5 => Self::Security,
            _ => Self::Uncategorized,
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Error)]
#[repr(u16)]
pub enum GenericError {
    #[error("other")]
    Other = 1,
    #[error("not supported")]
    NotSupported = 2,
    #[error("internal")]
    Internal = 3,
    #[error("timed out")]
    TimedOut = 4,
}

impl GenericError {
    fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1 => Self::Other,
            2 => Self::NotSupported,
            3 => Self::Internal,
            4 => Self::TimedOut,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Error)]
#[repr(u16)]
pub enum ArgumentError {
    #[error("invalid argument")]
    InvalidArgument = 1,
    #[error("invalid address")]
    InvalidAddress = 2,
    #[error("bad handle")]
    BadHandle = 3,
}

impl ArgumentError {
    fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1 => Self::InvalidArgument,
            2 => Self::InvalidAddress,
            3 => Self::BadHandle,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Error)]
#[repr(u16)]
pub enum ResourceError {
    #[error("out of memory")]
    OutOfMemory = 1,
    #[error("out of resources")]
    OutOfResources = 2,
    #[error("refused")]
    Refused = 3,
    #[error("busy")]
    Busy = 4,
}

impl ResourceError {
    fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1 => Self::OutOfMemory,
            2 => Self::OutOfResources,
            3 => Self::Refused,
            4 => Self::Busy,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Error)]
#[repr(u16)]
pub enum ObjectError {
    #[error("no such object")]
    NoSuchObject = 1,
    #[error("invalid object metadata")]
    InvalidMeta = 2,
    #[error("mapping failed")]
    MappingFailed = 3,
}

impl ObjectError {
    fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1 => Self::NoSuchObject,
            2 => Self::InvalidMeta,
            3 => Self::MappingFailed,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Error)]
#[repr(u16)]
pub enum SecurityError {
    #[error("permission denied")]
    PermissionDenied = 1,
}

impl SecurityError {
    fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1 => Self::PermissionDenied,
            _ => return None,
        })
    }
}

/// Possible mapping errors, numbered as in the C ABI.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Error)]
#[repr(u32)]
pub enum MapError {
    #[error("success")]
    Success = 0,
    #[error("other mapping error")]
    Other = 1,
    #[error("out of resources")]
    OutOfResources = 2,
    #[error("no such object")]
    NoSuchObject = 3,
    #[error("permission denied")]
    PermissionDenied = 4,
    #[error("invalid argument")]
    InvalidArgument = 5,
}

impl From<MapError> for TwzError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::Success | MapError::Other => GenericError::Other.into(),
            MapError::OutOfResources => TwzError::OUT_OF_RESOURCES,
            MapError::NoSuchObject => TwzError::NO_SUCH_OBJECT,
            MapError::PermissionDenied => TwzError::PERMISSION_DENIED,
            MapError::InvalidArgument => TwzError::INVALID_ARGUMENT,
        }
    }
}
