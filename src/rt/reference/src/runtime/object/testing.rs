//! Fakes for unit tests that exercise runtime internals without a real store.

use std::sync::{atomic::AtomicU64, Arc, Weak};

use objspace_rt_abi::{
    create::{CreateTieSpec, LifetimeType, ObjectCreate, ObjectSource},
    meta::MetaInfo,
    object::{MapFlags, ObjID, Protections, META_SIZE},
    service::{MappedRegion, ObjectCmd, ObjectService},
    Result, TwzError,
};

use super::{HandleInfo, ObjectMapKey};

pub(crate) struct NullService;

impl ObjectService for NullService {
    fn map(&self, _id: ObjID, _flags: MapFlags) -> Result<MappedRegion> {
        Err(TwzError::NOT_SUPPORTED)
    }

    fn release(&self, _region: &MappedRegion) {}

    fn create(
        &self,
        _spec: &ObjectCreate,
        _sources: &[ObjectSource],
        _ties: &[CreateTieSpec],
        _name: Option<&str>,
    ) -> Result<ObjID> {
        Err(TwzError::NOT_SUPPORTED)
    }

    fn object_cmd(&self, _region: &MappedRegion, _cmd: ObjectCmd) -> Result<()> {
        Err(TwzError::NOT_SUPPORTED)
    }

    fn grow(&self, _region: &MappedRegion, _min_len: usize) -> Result<usize> {
        Err(TwzError::NOT_SUPPORTED)
    }

    fn epoch(&self, _id: ObjID) -> Option<u64> {
        None
    }
}

/// A handle info over `meta`, with no manager behind it.
pub(crate) fn fake_info(id: ObjID, flags: MapFlags, meta: *mut u8, epoch: u64) -> Arc<HandleInfo> {
    let region = MappedRegion {
        id,
        flags,
        token: meta as u64,
        meta,
        start: meta.wrapping_add(META_SIZE),
        valid_len: 0x1000,
        epoch,
    };
    Arc::new(HandleInfo::new(
        ObjectMapKey(id, flags),
        region,
        Arc::new(NullService),
        Weak::new(),
        4,
    ))
}

/// A heap-backed meta region with a valid header and an empty FOT.
pub(crate) struct MetaBuf(Box<[AtomicU64]>);

impl MetaBuf {
    pub fn new(id: ObjID) -> Self {
        let buf = (0..META_SIZE / 8)
            .map(|_| AtomicU64::new(0))
            .collect::<Box<[_]>>();
        let meta = MetaInfo::new(
            id,
            ObjID::default(),
            Protections::READ | Protections::WRITE,
            LifetimeType::Persistent,
        );
        let bytes = meta.as_bytes();
        unsafe {
            buf.as_ptr()
                .cast::<u8>()
                .cast_mut()
                .copy_from_nonoverlapping(bytes.as_ptr(), bytes.len())
        };
        Self(buf)
    }

    pub fn ptr(&self) -> *mut u8 {
        self.0.as_ptr().cast::<u8>().cast_mut()
    }
}
