//! The boundary between the runtime and whatever actually backs objects.
//!
//! The runtime never touches storage directly. It asks an [ObjectService] to map, release,
//! create, grow and sync objects.

use crate::{
    create::{CreateTieSpec, ObjectCreate, ObjectSource},
    object::{MapFlags, ObjID, MAX_SIZE},
    Result,
};

/// Addresses of one mapping produced by an [ObjectService].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    pub id: ObjID,
    pub flags: MapFlags,
    /// Service-private identifier of this mapping.
    pub token: u64,
    /// Base of the meta region.
    pub meta: *mut u8,
    /// Base of the data region.
    pub start: *mut u8,
    /// Bytes of the data region backed at map time.
    pub valid_len: usize,
    /// Generation of the object at map time. Changes (or vanishes) if the object is deleted.
    pub epoch: u64,
}

// Safety: the pointers refer to a shared mapping that outlives the region value's use by
// contract with the service; the region itself never dereferences them.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Does `ptr` fall inside this mapping (meta or data region)?
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        addr >= self.meta as usize && addr < self.meta as usize + MAX_SIZE
    }
}

/// Commands that operate on a mapped object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectCmd {
    /// Delete the object. Existing mappings stay usable until released.
    Delete,
    /// Write the object back to its medium, returning once it is durable.
    Sync,
    /// Refresh the mapping's view of the object.
    Update,
}

/// The privileged primitives the runtime is layered on.
pub trait ObjectService: Send + Sync {
    /// Map an object.
    fn map(&self, id: ObjID, flags: MapFlags) -> Result<MappedRegion>;

    /// Map two objects as one request. Either both mappings exist afterwards or neither does.
    fn map_pair(
        &self,
        a: (ObjID, MapFlags),
        b: (ObjID, MapFlags),
    ) -> Result<(MappedRegion, MappedRegion)> {
        let first = self.map(a.0, a.1)?;
        match self.map(b.0, b.1) {
            Ok(second) => Ok((first, second)),
            Err(e) => {
                self.release(&first);
                Err(e)
            }
        }
    }

    /// Tear down a mapping. The region's addresses are invalid afterwards.
    fn release(&self, region: &MappedRegion);

    /// Create a new object.
    fn create(
        &self,
        spec: &ObjectCreate,
        sources: &[ObjectSource],
        ties: &[CreateTieSpec],
        name: Option<&str>,
    ) -> Result<ObjID>;

    /// Run a command against a mapped object.
    fn object_cmd(&self, region: &MappedRegion, cmd: ObjectCmd) -> Result<()>;

    /// Make at least `min_len` bytes of the data region addressable. Returns the new backed
    /// length, which never shrinks.
    fn grow(&self, region: &MappedRegion, min_len: usize) -> Result<usize>;

    /// Current generation of an object, or None if it no longer exists.
    fn epoch(&self, id: ObjID) -> Option<u64>;
}
