//! Object creation specifications.

use bitflags::bitflags;

use crate::object::{ObjID, Protections};

#[derive(Debug, Copy, Clone, PartialEq, PartialOrd, Ord, Eq)]
#[repr(C)]
/// Specifications for an object-copy from a source object. The specified ranges are
/// source:[src_start, src_start + len) copied to <new object>:[dest_start, dest_start + len),
/// with offsets relative to the start of each object's data region.
pub struct ObjectSource {
    /// The ID of the source object.
    pub id: ObjID,
    /// The offset into the source object to start the copy.
    pub src_start: u64,
    /// The offset into the dest object to start the copy to.
    pub dest_start: u64,
    /// The length of the copy.
    pub len: usize,
}

impl ObjectSource {
    /// Construct a new ObjectSource.
    pub fn new(id: ObjID, src_start: u64, dest_start: u64, len: usize) -> Self {
        Self {
            id,
            src_start,
            dest_start,
            len,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, PartialOrd, Ord, Eq, Default)]
#[repr(C)]
/// The backing memory type for this object.
pub enum BackingType {
    /// The default, let the store decide based on the [LifetimeType] of the object.
    #[default]
    Normal = 0,
}

#[derive(Debug, Copy, Clone, PartialEq, PartialOrd, Ord, Eq, Default)]
#[repr(C)]
/// The base lifetime type of the object.
pub enum LifetimeType {
    /// This object is volatile, and is expected to be deleted after a power cycle.
    #[default]
    Volatile = 0,
    /// This object is persistent, and should be deleted only after an explicit delete call.
    Persistent = 1,
}

impl LifetimeType {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Persistent,
            _ => Self::Volatile,
        }
    }
}

bitflags! {
    /// Flags to pass to object creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
    pub struct ObjectCreateFlags: u32 {
    }
}

bitflags! {
    /// Flags controlling how a particular object tie operates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
    pub struct CreateTieFlags: u32 {
    }
}

#[derive(Debug, Copy, Clone, PartialEq, PartialOrd, Ord, Eq)]
#[repr(C)]
/// Full object creation specification, minus sources and ties.
pub struct ObjectCreate {
    pub kuid: ObjID,
    pub bt: BackingType,
    pub lt: LifetimeType,
    pub flags: ObjectCreateFlags,
    pub def_prot: Protections,
    /// Initial length of the data region, or the store's default if zero.
    pub len: usize,
}

impl ObjectCreate {
    /// Build a new object create specification.
    pub fn new(
        bt: BackingType,
        lt: LifetimeType,
        kuid: Option<ObjID>,
        flags: ObjectCreateFlags,
        def_prot: Protections,
    ) -> Self {
        Self {
            kuid: kuid.unwrap_or_default(),
            bt,
            lt,
            flags,
            def_prot,
            len: 0,
        }
    }

    /// Persistent variant of the default spec.
    pub fn persistent() -> Self {
        Self {
            lt: LifetimeType::Persistent,
            ..Default::default()
        }
    }

    pub fn with_len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    pub fn with_prot(mut self, prot: Protections) -> Self {
        self.def_prot = prot;
        self
    }
}

impl Default for ObjectCreate {
    fn default() -> Self {
        Self::new(
            BackingType::Normal,
            LifetimeType::Volatile,
            None,
            ObjectCreateFlags::empty(),
            Protections::READ | Protections::WRITE,
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, PartialOrd, Ord, Eq)]
#[repr(C)]
/// A specification of ties to create. The new object keeps the tied object from being deleted
/// for as long as the new object exists.
pub struct CreateTieSpec {
    pub id: ObjID,
    pub flags: CreateTieFlags,
}

impl CreateTieSpec {
    /// Create a new CreateTieSpec.
    pub fn new(id: ObjID, flags: CreateTieFlags) -> Self {
        Self { id, flags }
    }
}
