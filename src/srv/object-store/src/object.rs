use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use objspace_rt_abi::{
    create::{LifetimeType, ObjectCreate},
    meta::{fot_entry_offset, FotFlags, MetaInfo, FOT_FLAGS_OFFSET, MAX_FOT_ENTRIES},
    object::{ObjID, Protections, META_SIZE, PAGE_SIZE},
};

use crate::error::{Result, StoreError};

/// `None` if the rounded length does not fit in a `usize`.
pub(crate) fn round_up_page(len: usize) -> Option<usize> {
    len.checked_next_multiple_of(PAGE_SIZE)
}

/// One object file, plus the store's view of it.
#[derive(Debug)]
pub(crate) struct BackingObject {
    pub id: ObjID,
    pub file: Arc<File>,
    pub path: PathBuf,
    pub lifetime: LifetimeType,
    pub prot: Protections,
    pub kuid: ObjID,
    pub name: Option<String>,
    pub epoch: u64,
    pub deleted: bool,
    pub maps: usize,
}

impl BackingObject {
    /// Create a fresh object file holding `data_len` bytes of (zeroed) data.
    pub fn create(
        path: PathBuf,
        id: ObjID,
        spec: &ObjectCreate,
        data_len: usize,
        name: Option<String>,
        epoch: u64,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len((META_SIZE + data_len) as u64)?;
        let meta = MetaInfo::new(id, spec.kuid, spec.def_prot, spec.lt);
        file.write_all_at(meta.as_bytes(), 0)?;
        tracing::debug!("created object file {} ({} data bytes)", path.display(), data_len);
        Ok(Self {
            id,
            file: Arc::new(file),
            path,
            lifetime: spec.lt,
            prot: spec.def_prot,
            kuid: spec.kuid,
            name,
            epoch,
            deleted: false,
            maps: 0,
        })
    }

    /// Open an existing object file, validating its header and repairing FOT slots that were
    /// claimed but never activated.
    pub fn open(path: &Path, id: ObjID, epoch: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        if file.metadata()?.len() < META_SIZE as u64 {
            return Err(StoreError::CorruptMeta(id));
        }
        let mut meta_bytes = vec![0u8; META_SIZE];
        file.read_exact_at(&mut meta_bytes, 0)?;
        let meta = MetaInfo::read_from(&meta_bytes).ok_or(StoreError::CorruptMeta(id))?;
        if !meta.is_valid() || meta.id() != id {
            return Err(StoreError::CorruptMeta(id));
        }

        let repaired = recover_fot(&file, &meta_bytes)?;
        if repaired > 0 {
            tracing::warn!("object {}: reset {} half-inserted FOT entries", id, repaired);
        }

        Ok(Self {
            id,
            file: Arc::new(file),
            path: path.to_path_buf(),
            lifetime: LifetimeType::from_raw(meta.lifetime),
            prot: meta.default_prot(),
            kuid: ObjID::from_parts(meta.kuid),
            name: None,
            epoch,
            deleted: false,
            maps: 0,
        })
    }

    /// Bytes of the data region currently backed by the file.
    pub fn data_len(&self) -> Result<usize> {
        let len = self.file.metadata()?.len() as usize;
        Ok(len.saturating_sub(META_SIZE))
    }

    pub fn set_data_len(&self, len: usize) -> Result<()> {
        self.file.set_len((META_SIZE + len) as u64)?;
        Ok(())
    }

    pub fn read_data(&self, buf: &mut [u8], off: u64) -> Result<()> {
        self.file.read_exact_at(buf, META_SIZE as u64 + off)?;
        Ok(())
    }

    pub fn write_data(&self, buf: &[u8], off: u64) -> Result<()> {
        self.file.write_all_at(buf, META_SIZE as u64 + off)?;
        Ok(())
    }
}

fn recover_fot(file: &File, meta_bytes: &[u8]) -> Result<usize> {
    let mut repaired = 0;
    for idx in 0..MAX_FOT_ENTRIES {
        let off = fot_entry_offset(idx) + FOT_FLAGS_OFFSET;
        let mut word = [0u8; 4];
        word.copy_from_slice(&meta_bytes[off..off + 4]);
        let flags = FotFlags::from_bits_truncate(u32::from_ne_bytes(word));
        if flags.contains(FotFlags::ALLOCATED) && !flags.contains(FotFlags::ACTIVE) {
            file.write_all_at(&0u32.to_ne_bytes(), off as u64)?;
            repaired += 1;
        }
    }
    Ok(repaired)
}
