use std::{
    collections::HashMap,
    fs::{self, File},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use memmap2::{MmapOptions, MmapRaw};
use objspace_rt_abi::{
    create::{CreateTieSpec, LifetimeType, ObjectCreate, ObjectSource},
    error::{ArgumentError, ResourceError},
    object::{MapFlags, ObjID, Protections, MAX_DATA_LEN, MAX_SIZE, META_SIZE, NULLPAGE_SIZE},
    service::{MappedRegion, ObjectCmd, ObjectService},
    Result, TwzError,
};
use parking_lot::Mutex;

use crate::{
    catalog::{decode_obj_id, encode_obj_id, Catalog, CatalogEntry},
    error::StoreError,
    id::gen_id,
    object::{round_up_page, BackingObject},
    ties::Ties,
    StoreConfig, StoreStats,
};

const PERSISTENT_DIR: &str = "persistent";
const VOLATILE_DIR: &str = "volatile";
const CATALOG_FILE: &str = "catalog.json";
const OBJECT_EXT: &str = "obj";
const COPY_CHUNK: usize = 64 * 1024;

struct Mapping {
    id: ObjID,
    map: MmapRaw,
}

struct StoreInner {
    objects: HashMap<ObjID, BackingObject>,
    maps: HashMap<u64, Arc<Mapping>>,
    ties: Ties,
    catalog: Catalog,
}

/// What the store knows about one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub id: ObjID,
    pub lifetime: LifetimeType,
    pub prot: Protections,
    pub kuid: ObjID,
    pub data_len: usize,
    pub name: Option<String>,
    pub ties: Vec<ObjID>,
    pub maps: usize,
}

/// File-backed implementation of [ObjectService].
pub struct ObjectStore {
    config: StoreConfig,
    inner: Mutex<StoreInner>,
    stats: StoreStats,
    next_token: AtomicU64,
    next_epoch: AtomicU64,
}

fn wipe_dir(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn sync_mapping(mapping: &Mapping, file: &File) -> crate::error::Result<()> {
    let len = (file.metadata()?.len() as usize).min(MAX_SIZE);
    mapping.map.flush_range(0, len)?;
    file.sync_data()?;
    Ok(())
}

impl ObjectStore {
    /// Open (or initialize) the store rooted at `config.root`. Persistent objects are loaded and
    /// checked, volatile ones from earlier runs are discarded.
    pub fn open(config: StoreConfig) -> crate::error::Result<Self> {
        let persistent = config.root.join(PERSISTENT_DIR);
        let volatile = config.root.join(VOLATILE_DIR);
        fs::create_dir_all(&persistent)?;
        wipe_dir(&volatile)?;
        fs::create_dir_all(&volatile)?;
        let mut catalog = Catalog::load(&config.root.join(CATALOG_FILE))?;

        let next_epoch = AtomicU64::new(1);
        let mut objects = HashMap::new();
        for dirent in fs::read_dir(&persistent)? {
            let path = dirent?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(OBJECT_EXT) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(decode_obj_id)
            else {
                tracing::warn!("skipping unrecognized file {}", path.display());
                continue;
            };
            match BackingObject::open(&path, id, next_epoch.fetch_add(1, Ordering::Relaxed)) {
                Ok(mut obj) => {
                    obj.name = catalog.get(id).and_then(|e| e.name.clone());
                    objects.insert(id, obj);
                }
                Err(e) => tracing::warn!("skipping object {}: {}", id, e),
            }
        }

        let stale = catalog
            .objects
            .keys()
            .filter_map(|k| decode_obj_id(k))
            .filter(|id| !objects.contains_key(id))
            .collect::<Vec<_>>();
        for id in &stale {
            tracing::warn!("catalog entry for missing object {}", id);
            catalog.remove(*id);
        }
        if !stale.is_empty() {
            catalog.store()?;
        }

        let mut ties = Ties::default();
        for (key, entry) in &catalog.objects {
            if let Some(id) = decode_obj_id(key) {
                ties.insert_ties(id, entry.ties.iter().filter_map(|t| decode_obj_id(t)));
            }
        }

        tracing::debug!(
            "opened store at {} with {} persistent objects",
            config.root.display(),
            objects.len()
        );
        Ok(Self {
            config,
            inner: Mutex::new(StoreInner {
                objects,
                maps: HashMap::new(),
                ties,
                catalog,
            }),
            stats: StoreStats::default(),
            next_token: AtomicU64::new(1),
            next_epoch,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    pub fn lookup_name(&self, name: &str) -> Option<ObjID> {
        self.inner
            .lock()
            .objects
            .values()
            .find(|o| !o.deleted && o.name.as_deref() == Some(name))
            .map(|o| o.id)
    }

    pub fn info(&self, id: ObjID) -> Result<ObjectInfo> {
        let inner = self.inner.lock();
        let obj = inner
            .objects
            .get(&id)
            .filter(|o| !o.deleted)
            .ok_or(TwzError::NO_SUCH_OBJECT)?;
        Ok(ObjectInfo {
            id,
            lifetime: obj.lifetime,
            prot: obj.prot,
            kuid: obj.kuid,
            data_len: obj.data_len()?,
            name: obj.name.clone(),
            ties: inner.ties.ties_of(id),
            maps: obj.maps,
        })
    }

    fn max_len(&self) -> usize {
        self.config.max_len.min(MAX_DATA_LEN)
    }

    fn dir_for(&self, lifetime: LifetimeType) -> PathBuf {
        match lifetime {
            LifetimeType::Persistent => self.config.root.join(PERSISTENT_DIR),
            LifetimeType::Volatile => self.config.root.join(VOLATILE_DIR),
        }
    }

    fn map_locked(&self, inner: &mut StoreInner, id: ObjID, flags: MapFlags) -> Result<MappedRegion> {
        let obj = inner
            .objects
            .get_mut(&id)
            .filter(|o| !o.deleted)
            .ok_or(TwzError::NO_SUCH_OBJECT)?;
        if !obj.prot.contains(flags.required_protections()) {
            return Err(TwzError::PERMISSION_DENIED);
        }
        if flags.contains(MapFlags::PERSIST) && obj.lifetime == LifetimeType::Volatile {
            return Err(TwzError::INVALID_ARGUMENT);
        }

        let valid_len = obj.data_len()?;
        let mut opts = MmapOptions::new();
        opts.len(MAX_SIZE);
        let map = if flags.contains(MapFlags::WRITE) {
            opts.map_raw(&*obj.file)
        } else {
            opts.map_raw_read_only(&*obj.file)
        }
        .map_err(StoreError::from)?;
        obj.maps += 1;

        let meta = map.as_mut_ptr();
        let region = MappedRegion {
            id,
            flags,
            token: self.next_token.fetch_add(1, Ordering::Relaxed),
            meta,
            // Safety: the mapping is MAX_SIZE bytes, which is larger than META_SIZE.
            start: unsafe { meta.add(META_SIZE) },
            valid_len,
            epoch: obj.epoch,
        };
        inner.maps.insert(region.token, Arc::new(Mapping { id, map }));
        tracing::debug!("map {} {:?} at {:p}", id, flags, region.start);
        Ok(region)
    }

    fn release_locked(inner: &mut StoreInner, token: u64) -> Option<Arc<Mapping>> {
        let mapping = inner.maps.remove(&token)?;
        let gone = match inner.objects.get_mut(&mapping.id) {
            Some(obj) => {
                obj.maps = obj.maps.saturating_sub(1);
                obj.deleted && obj.maps == 0
            }
            None => false,
        };
        if gone {
            inner.objects.remove(&mapping.id);
        }
        Some(mapping)
    }

    fn copy_sources(
        inner: &StoreInner,
        dest: &BackingObject,
        sources: &[ObjectSource],
    ) -> crate::error::Result<()> {
        let mut buf = vec![0u8; COPY_CHUNK];
        for src in sources {
            let Some(from) = inner.objects.get(&src.id) else {
                continue;
            };
            let mut done = 0;
            while done < src.len {
                let n = (src.len - done).min(COPY_CHUNK);
                from.read_data(&mut buf[..n], src.src_start + done as u64)?;
                dest.write_data(&buf[..n], src.dest_start + done as u64)?;
                done += n;
            }
        }
        Ok(())
    }

    fn sync(&self, region: &MappedRegion) -> Result<()> {
        StoreStats::bump(&self.stats.sync_calls);
        let (mapping, file) = {
            let inner = self.inner.lock();
            let mapping = inner
                .maps
                .get(&region.token)
                .cloned()
                .ok_or(ArgumentError::BadHandle)?;
            let obj = inner
                .objects
                .get(&mapping.id)
                .ok_or(TwzError::NO_SUCH_OBJECT)?;
            (mapping, obj.file.clone())
        };
        sync_mapping(&mapping, &file)?;
        tracing::trace!("synced {}", region.id);
        Ok(())
    }

    fn delete(&self, region: &MappedRegion) -> Result<()> {
        let mut inner = self.inner.lock();
        let id = inner
            .maps
            .get(&region.token)
            .map(|m| m.id)
            .ok_or(ArgumentError::BadHandle)?;
        if let Some(holder) = inner.ties.tied_by(id) {
            tracing::debug!("refusing to delete {}: tied by {}", id, holder);
            return Err(ResourceError::Busy.into());
        }
        let obj = inner
            .objects
            .get_mut(&id)
            .filter(|o| !o.deleted)
            .ok_or(TwzError::NO_SUCH_OBJECT)?;
        fs::remove_file(&obj.path).map_err(StoreError::from)?;
        obj.deleted = true;
        let persistent = obj.lifetime == LifetimeType::Persistent;
        inner.ties.remove_all_ties(id);
        if persistent && inner.catalog.remove(id).is_some() {
            inner.catalog.store()?;
        }
        tracing::debug!("deleted {}", id);
        Ok(())
    }
}

impl ObjectService for ObjectStore {
    fn map(&self, id: ObjID, flags: MapFlags) -> Result<MappedRegion> {
        let mut inner = self.inner.lock();
        let region = self.map_locked(&mut inner, id, flags)?;
        StoreStats::bump(&self.stats.map_calls);
        Ok(region)
    }

    fn map_pair(
        &self,
        a: (ObjID, MapFlags),
        b: (ObjID, MapFlags),
    ) -> Result<(MappedRegion, MappedRegion)> {
        let mut inner = self.inner.lock();
        let first = self.map_locked(&mut inner, a.0, a.1)?;
        match self.map_locked(&mut inner, b.0, b.1) {
            Ok(second) => {
                StoreStats::bump(&self.stats.map_calls);
                Ok((first, second))
            }
            Err(e) => {
                let mapping = Self::release_locked(&mut inner, first.token);
                drop(inner);
                drop(mapping);
                Err(e)
            }
        }
    }

    fn release(&self, region: &MappedRegion) {
        let mapping = Self::release_locked(&mut self.inner.lock(), region.token);
        match mapping {
            Some(mapping) => {
                StoreStats::bump(&self.stats.release_calls);
                tracing::debug!("unmap {} at {:p}", mapping.id, region.start);
            }
            None => tracing::warn!("release of unknown mapping {} of {}", region.token, region.id),
        }
    }

    fn create(
        &self,
        spec: &ObjectCreate,
        sources: &[ObjectSource],
        ties: &[CreateTieSpec],
        name: Option<&str>,
    ) -> Result<ObjID> {
        let len = if spec.len == 0 {
            self.config.default_len
        } else {
            spec.len
        };
        let data_len = NULLPAGE_SIZE
            .checked_add(len)
            .and_then(round_up_page)
            .filter(|l| *l <= self.max_len())
            .ok_or(TwzError::OUT_OF_RESOURCES)?;

        let mut inner = self.inner.lock();
        let live = |id: &ObjID| inner.objects.get(id).filter(|o| !o.deleted);
        if let Some(name) = name {
            if inner
                .objects
                .values()
                .any(|o| !o.deleted && o.name.as_deref() == Some(name))
            {
                return Err(TwzError::INVALID_ARGUMENT);
            }
        }
        if ties.iter().any(|tie| live(&tie.id).is_none()) {
            return Err(TwzError::NO_SUCH_OBJECT);
        }
        for src in sources {
            let from = live(&src.id).ok_or(TwzError::NO_SUCH_OBJECT)?;
            let src_len = from.data_len()?;
            let src_end = (src.src_start as usize).checked_add(src.len);
            let dest_end = (src.dest_start as usize).checked_add(src.len);
            if src_end.map_or(true, |end| end > src_len) || dest_end.map_or(true, |end| end > data_len)
            {
                return Err(TwzError::INVALID_ARGUMENT);
            }
        }

        let id = gen_id(spec.kuid, spec.def_prot, spec.lt);
        let path = self
            .dir_for(spec.lt)
            .join(format!("{}.{}", encode_obj_id(id), OBJECT_EXT));
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let obj = BackingObject::create(path, id, spec, data_len, name.map(String::from), epoch)?;

        let copied = Self::copy_sources(&inner, &obj, sources).and_then(|_| {
            if spec.lt == LifetimeType::Persistent {
                obj.file.sync_all()?;
            }
            Ok(())
        });
        if let Err(e) = copied {
            if let Err(rm) = fs::remove_file(&obj.path) {
                tracing::warn!("failed to clean up {}: {}", obj.path.display(), rm);
            }
            return Err(e.into());
        }

        if spec.lt == LifetimeType::Persistent {
            inner.catalog.insert(
                id,
                CatalogEntry {
                    name: obj.name.clone(),
                    ties: ties.iter().map(|t| encode_obj_id(t.id)).collect(),
                },
            );
            inner.catalog.store()?;
        }
        inner.ties.insert_ties(id, ties.iter().map(|t| t.id));
        inner.objects.insert(id, obj);
        StoreStats::bump(&self.stats.creates);
        tracing::debug!("create {} ({:?}, {} bytes)", id, spec.lt, data_len);
        Ok(id)
    }

    fn object_cmd(&self, region: &MappedRegion, cmd: ObjectCmd) -> Result<()> {
        match cmd {
            ObjectCmd::Sync => self.sync(region),
            ObjectCmd::Delete => self.delete(region),
            ObjectCmd::Update => {
                if !self.inner.lock().maps.contains_key(&region.token) {
                    return Err(ArgumentError::BadHandle.into());
                }
                Ok(())
            }
        }
    }

    fn grow(&self, region: &MappedRegion, min_len: usize) -> Result<usize> {
        let inner = self.inner.lock();
        let obj = inner
            .objects
            .get(&region.id)
            .ok_or(TwzError::NO_SUCH_OBJECT)?;
        let current = obj.data_len()?;
        if min_len <= current {
            return Ok(current);
        }
        let new_len = round_up_page(min_len)
            .filter(|l| *l <= self.max_len())
            .ok_or(TwzError::OUT_OF_RESOURCES)?;
        obj.set_data_len(new_len)?;
        tracing::trace!("grow {} from {} to {}", region.id, current, new_len);
        Ok(new_len)
    }

    fn epoch(&self, id: ObjID) -> Option<u64> {
        self.inner
            .lock()
            .objects
            .get(&id)
            .filter(|o| !o.deleted)
            .map(|o| o.epoch)
    }
}

impl Drop for ObjectStore {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if !inner.maps.is_empty() {
            tracing::warn!("dropping store with {} live mappings", inner.maps.len());
        }
        inner.maps.clear();
        if let Err(e) = wipe_dir(&self.config.root.join(VOLATILE_DIR)) {
            tracing::warn!("failed to remove volatile objects: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use objspace_rt_abi::{
        create::CreateTieFlags,
        error::{ArgumentError, ObjectError},
    };
    use tempfile::TempDir;

    use super::*;

    fn open(dir: &TempDir) -> ObjectStore {
        ObjectStore::open(StoreConfig::new(dir.path())).unwrap()
    }

    fn rw() -> MapFlags {
        MapFlags::READ | MapFlags::WRITE
    }

    #[test]
    fn persistent_data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let id = store
            .create(&ObjectCreate::persistent(), &[], &[], Some("root"))
            .unwrap();
        let vol = store.create(&ObjectCreate::default(), &[], &[], None).unwrap();

        let region = store.map(id, rw() | MapFlags::PERSIST).unwrap();
        assert_eq!(
            Some(region.valid_len),
            round_up_page(NULLPAGE_SIZE + 64 * 1024)
        );
        unsafe {
            region
                .start
                .add(NULLPAGE_SIZE)
                .copy_from_nonoverlapping(b"persist".as_ptr(), 7);
        }
        store.object_cmd(&region, ObjectCmd::Sync).unwrap();
        store.release(&region);
        drop(store);

        let store = open(&dir);
        assert_eq!(store.lookup_name("root"), Some(id));
        assert!(store.epoch(vol).is_none());
        let region = store.map(id, MapFlags::READ).unwrap();
        let mut buf = [0u8; 7];
        unsafe {
            buf.as_mut_ptr()
                .copy_from_nonoverlapping(region.start.add(NULLPAGE_SIZE), 7);
        }
        assert_eq!(&buf, b"persist");
        store.release(&region);
    }

    #[test]
    fn map_checks_protections_and_lifetime() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let ro = store
            .create(
                &ObjectCreate::persistent().with_prot(Protections::READ),
                &[],
                &[],
                None,
            )
            .unwrap();
        let vol = store.create(&ObjectCreate::default(), &[], &[], None).unwrap();

        assert_eq!(store.map(ro, rw()), Err(TwzError::PERMISSION_DENIED));
        assert_eq!(
            store.map(vol, rw() | MapFlags::PERSIST),
            Err(TwzError::INVALID_ARGUMENT)
        );
        assert_eq!(
            store.map(ObjID::new(1), MapFlags::READ),
            Err(TwzError::NO_SUCH_OBJECT)
        );
        let region = store.map(ro, MapFlags::READ).unwrap();
        store.release(&region);
        assert_eq!(store.stats().snapshot().map_calls, 1);
        assert_eq!(store.stats().snapshot().release_calls, 1);
    }

    #[test]
    fn tie_blocks_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let target = store
            .create(&ObjectCreate::persistent(), &[], &[], None)
            .unwrap();
        let holder = store
            .create(
                &ObjectCreate::persistent(),
                &[],
                &[CreateTieSpec::new(target, CreateTieFlags::empty())],
                None,
            )
            .unwrap();
        assert_eq!(store.info(holder).unwrap().ties, vec![target]);

        let t = store.map(target, rw()).unwrap();
        assert_eq!(
            store.object_cmd(&t, ObjectCmd::Delete),
            Err(ResourceError::Busy.into())
        );

        let h = store.map(holder, rw()).unwrap();
        store.object_cmd(&h, ObjectCmd::Delete).unwrap();
        assert!(store.epoch(holder).is_none());
        store.object_cmd(&t, ObjectCmd::Delete).unwrap();
        assert!(store.epoch(target).is_none());
        assert_eq!(
            store.object_cmd(&t, ObjectCmd::Delete),
            Err(ObjectError::NoSuchObject.into())
        );
        store.release(&h);
        store.release(&t);
        assert_eq!(store.info(target), Err(TwzError::NO_SUCH_OBJECT));
        assert_eq!(
            store.object_cmd(&t, ObjectCmd::Update),
            Err(ArgumentError::BadHandle.into())
        );
    }

    #[test]
    fn grow_is_monotonic_and_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let id = store
            .create(&ObjectCreate::default().with_len(100), &[], &[], None)
            .unwrap();
        let region = store.map(id, rw()).unwrap();
        assert_eq!(region.valid_len, 2 * NULLPAGE_SIZE);
        assert_eq!(store.grow(&region, 0).unwrap(), 2 * NULLPAGE_SIZE);
        assert_eq!(store.grow(&region, 5 * NULLPAGE_SIZE + 1).unwrap(), 6 * NULLPAGE_SIZE);
        assert_eq!(store.grow(&region, NULLPAGE_SIZE).unwrap(), 6 * NULLPAGE_SIZE);
        assert_eq!(
            store.grow(&region, MAX_DATA_LEN + 1),
            Err(TwzError::OUT_OF_RESOURCES)
        );
        assert_eq!(
            store.grow(&region, usize::MAX),
            Err(TwzError::OUT_OF_RESOURCES)
        );
        store.release(&region);
    }

    #[test]
    fn create_rejects_huge_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        for len in [MAX_DATA_LEN + 1, usize::MAX - NULLPAGE_SIZE, usize::MAX] {
            assert_eq!(
                store.create(&ObjectCreate::default().with_len(len), &[], &[], None),
                Err(TwzError::OUT_OF_RESOURCES)
            );
        }
        assert_eq!(store.stats().snapshot().creates, 0);
    }

    #[test]
    fn create_copies_sources() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let src = store.create(&ObjectCreate::default(), &[], &[], None).unwrap();
        let region = store.map(src, rw()).unwrap();
        unsafe {
            region
                .start
                .add(NULLPAGE_SIZE)
                .copy_from_nonoverlapping(b"abcdef".as_ptr(), 6);
        }
        let off = NULLPAGE_SIZE as u64;
        let copy = store
            .create(
                &ObjectCreate::default(),
                &[ObjectSource::new(src, off + 2, off, 3)],
                &[],
                None,
            )
            .unwrap();
        let copied = store.map(copy, MapFlags::READ).unwrap();
        let mut buf = [0u8; 3];
        unsafe {
            buf.as_mut_ptr()
                .copy_from_nonoverlapping(copied.start.add(NULLPAGE_SIZE), 3);
        }
        assert_eq!(&buf, b"cde");

        let bad = ObjectSource::new(src, off, MAX_DATA_LEN as u64, 1);
        assert_eq!(
            store.create(&ObjectCreate::default(), &[bad], &[], None),
            Err(TwzError::INVALID_ARGUMENT)
        );
        store.release(&copied);
        store.release(&region);
    }

    #[test]
    fn map_pair_is_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let a = store.create(&ObjectCreate::default(), &[], &[], None).unwrap();
        let b = store.create(&ObjectCreate::default(), &[], &[], None).unwrap();
        let (ra, rb) = store
            .map_pair((a, MapFlags::READ), (b, MapFlags::READ))
            .unwrap();
        assert_ne!(ra.start, rb.start);
        store.release(&ra);
        store.release(&rb);

        assert_eq!(
            store.map_pair((a, MapFlags::READ), (ObjID::new(5), MapFlags::READ)),
            Err(TwzError::NO_SUCH_OBJECT)
        );
        assert_eq!(store.info(a).unwrap().maps, 0);
    }

    #[test]
    fn names_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        store
            .create(&ObjectCreate::default(), &[], &[], Some("n"))
            .unwrap();
        assert_eq!(
            store.create(&ObjectCreate::default(), &[], &[], Some("n")),
            Err(TwzError::INVALID_ARGUMENT)
        );
    }
}
