use std::{
    collections::BTreeMap,
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

use objspace_rt_abi::object::ObjID;
use serde::{Deserialize, Serialize};

use crate::error::Result;

type EncodedObjectId = String;

pub(crate) fn encode_obj_id(id: ObjID) -> EncodedObjectId {
    format!("{:0>32x}", id.raw())
}

pub(crate) fn decode_obj_id(s: &str) -> Option<ObjID> {
    u128::from_str_radix(s, 16).ok().map(ObjID::new)
}

/// Per-object bookkeeping that does not live in the object's own meta region.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct CatalogEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub ties: Vec<EncodedObjectId>,
}

/// The store's index of persistent objects, kept as JSON next to the object files.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Catalog {
    #[serde(default)]
    pub objects: BTreeMap<EncodedObjectId, CatalogEntry>,
    #[serde(skip)]
    path: PathBuf,
}

impl Catalog {
    /// Load the catalog at `path`. A missing file is an empty catalog.
    pub fn load(path: &Path) -> Result<Self> {
        let mut catalog = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice::<Catalog>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Catalog::default(),
            Err(e) => return Err(e.into()),
        };
        catalog.path = path.to_path_buf();
        Ok(catalog)
    }

    pub fn get(&self, id: ObjID) -> Option<&CatalogEntry> {
        self.objects.get(&encode_obj_id(id))
    }

    pub fn insert(&mut self, id: ObjID, entry: CatalogEntry) {
        self.objects.insert(encode_obj_id(id), entry);
    }

    pub fn remove(&mut self, id: ObjID) -> Option<CatalogEntry> {
        self.objects.remove(&encode_obj_id(id))
    }

    pub fn lookup_name(&self, name: &str) -> Option<ObjID> {
        self.objects
            .iter()
            .find(|(_, e)| e.name.as_deref() == Some(name))
            .and_then(|(id, _)| decode_obj_id(id))
    }

    /// Write the catalog out. The new contents replace the old ones atomically.
    pub fn store(&self) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(self)?;
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
