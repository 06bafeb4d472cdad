mod common;

use std::sync::Barrier;

use common::{rw, rwp, Env};
use objspace_rt::{
    abi::{
        object::{MapFlags, MAX_DATA_LEN},
        service::ObjectCmd,
        TwzError,
    },
    ReleaseFlags,
};

#[test]
fn insert_resolve_and_reacquire() {
    let env = Env::new();
    let b = env.persistent();
    let a = env.persistent_tied_to(b);

    let ha = env.rt.map_object(a, rwp()).unwrap();
    assert_eq!(env.rt.insert_fot(&ha, b), Ok(0));
    assert_eq!(env.rt.read_fot(&ha, 0).unwrap().flags, rwp());
    env.rt.release_handle(ha, ReleaseFlags::NO_CACHE);

    // A fresh mapping of A has an empty resolution cache and reads the table itself.
    let ha = env.rt.map_object(a, rwp()).unwrap();
    let hb = env.rt.resolve_fot(&ha, 0, 0).unwrap();
    assert_eq!(hb.id(), b);
    assert_eq!(hb.map_flags(), rwp());
    drop((ha, hb));

    let ha = env.rt.map_object(a, rwp()).unwrap();
    assert_eq!(env.rt.resolve_fot(&ha, 0, 0).unwrap().id(), b);
    assert_eq!(env.rt.insert_fot(&ha, b), Ok(0));
    assert_eq!(env.rt.fot_entries(&ha).unwrap().len(), 1);
}

#[test]
fn resolution_is_stable_and_cached() {
    let env = Env::new();
    let a = env.volatile();
    let b = env.volatile();
    let ha = env.rt.map_object(a, rw()).unwrap();
    let idx = env.rt.insert_fot(&ha, b).unwrap();

    let first = env.rt.resolve_fot(&ha, idx, 0x1000).unwrap();
    let maps = env.stats().map_calls;
    for min in [0x1000, 0x800, 0] {
        let again = env.rt.resolve_fot(&ha, idx, min).unwrap();
        assert_eq!((again.id(), again.start()), (b, first.start()));
    }
    assert_eq!(env.stats().map_calls, maps);

    // Still cached once the target goes idle.
    drop(first);
    let again = env.rt.resolve_fot(&ha, idx, 0).unwrap();
    assert_eq!(again.id(), b);
    assert_eq!(env.stats().map_calls, maps);
}

#[test]
fn resolve_grows_short_targets() {
    let env = Env::new();
    let a = env.volatile();
    let b = env.volatile();
    let ha = env.rt.map_object(a, rw()).unwrap();
    let idx = env.rt.insert_fot(&ha, b).unwrap();

    let hb = env.rt.resolve_fot(&ha, idx, 0).unwrap();
    let start = hb.start();
    assert!(hb.valid_len() < 0x30000);

    let grown = env.rt.resolve_fot(&ha, idx, 0x30000).unwrap();
    assert!(grown.valid_len() >= 0x30000);
    assert_eq!(grown.start(), start);
    assert!(hb.valid_len() >= 0x30000);

    assert_eq!(
        env.rt.resolve_fot(&ha, idx, MAX_DATA_LEN + 1).unwrap_err(),
        TwzError::INVALID_ARGUMENT
    );
}

#[test]
fn deleted_targets_are_not_resolved_from_cache() {
    let env = Env::new();
    let a = env.volatile();
    let ha = env.rt.map_object(a, rw()).unwrap();

    // Idle in the handle cache when deleted.
    let b = env.volatile();
    let idx = env.rt.insert_fot(&ha, b).unwrap();
    let hb = env.rt.resolve_fot(&ha, idx, 0).unwrap();
    env.rt.object_cmd(&hb, ObjectCmd::Delete).unwrap();
    drop(hb);
    assert_eq!(
        env.rt.resolve_fot(&ha, idx, 0).unwrap_err(),
        TwzError::NO_SUCH_OBJECT
    );
    assert_eq!(
        env.rt.map_object(b, rw()).unwrap_err(),
        TwzError::NO_SUCH_OBJECT
    );

    // Still held by its deleter.
    let c = env.volatile();
    let idx = env.rt.insert_fot(&ha, c).unwrap();
    let hc = env.rt.resolve_fot(&ha, idx, 0).unwrap();
    env.rt.object_cmd(&hc, ObjectCmd::Delete).unwrap();
    assert_eq!(
        env.rt.resolve_fot(&ha, idx, 0).unwrap_err(),
        TwzError::NO_SUCH_OBJECT
    );
    drop(hc);

    let stats = env.rt.cache_stats();
    assert_eq!((stats.active, stats.idle), (1, 0));
}

#[test]
fn bad_indices() {
    let env = Env::new();
    let a = env.volatile();
    let ha = env.rt.map_object(a, rw()).unwrap();
    assert_eq!(
        env.rt.resolve_fot(&ha, 0, 0).unwrap_err(),
        TwzError::INVALID_ARGUMENT
    );
    env.rt.insert_fot(&ha, env.volatile()).unwrap();
    assert_eq!(
        env.rt.resolve_fot(&ha, 1, 0).unwrap_err(),
        TwzError::INVALID_ARGUMENT
    );
    assert_eq!(
        env.rt.resolve_fot(&ha, u64::MAX, 0).unwrap_err(),
        TwzError::INVALID_ARGUMENT
    );
}

#[test]
fn resolve_reports_target_errors() {
    let env = Env::new();
    let a = env.volatile();
    let b = env.volatile();
    let ha = env.rt.map_object(a, rw()).unwrap();
    // Volatile targets cannot be mapped persistent.
    let idx = env
        .rt
        .insert_fot_with_flags(&ha, b, MapFlags::READ | MapFlags::PERSIST)
        .unwrap();
    assert_eq!(
        env.rt.resolve_fot(&ha, idx, 0).unwrap_err(),
        TwzError::INVALID_ARGUMENT
    );
}

#[test]
fn insert_needs_writable_source() {
    let env = Env::new();
    let a = env.volatile();
    let ro = env.rt.map_object(a, MapFlags::READ).unwrap();
    assert_eq!(
        env.rt.insert_fot(&ro, env.volatile()),
        Err(TwzError::PERMISSION_DENIED)
    );
}

#[test]
fn resolve_local_uses_only_the_cache() {
    let env = Env::new();
    let a = env.volatile();
    let b = env.volatile();
    let ha = env.rt.map_object(a, rw()).unwrap();
    let idx = env.rt.insert_fot(&ha, b).unwrap();
    let inside = ha.base_ptr().wrapping_add(64);

    assert_eq!(env.rt.resolve_fot_local(inside, idx, 0), None);
    let hb = env.rt.resolve_fot(&ha, idx, 0).unwrap();
    let local = env.rt.resolve_fot_local(inside, idx, 0).unwrap();
    assert_eq!(local.as_ptr(), hb.start());
    assert_eq!(
        env.rt.resolve_fot_local(inside, idx, hb.valid_len() + 1),
        None
    );
    assert_eq!(env.rt.resolve_fot_local(inside, idx + 1, 0), None);
}

#[test]
fn concurrent_inserts_share_one_slot() {
    const THREADS: usize = 8;
    let env = Env::new();
    let a = env.volatile();
    let c = env.volatile();
    let others = (0..THREADS).map(|_| env.volatile()).collect::<Vec<_>>();
    let barrier = Barrier::new(THREADS);

    let indices = std::thread::scope(|s| {
        let workers = others
            .iter()
            .map(|other| {
                let env = &env;
                let barrier = &barrier;
                s.spawn(move || {
                    let ha = env.rt.map_object(a, rw()).unwrap();
                    barrier.wait();
                    env.rt.insert_fot(&ha, *other).unwrap();
                    env.rt.insert_fot(&ha, c).unwrap()
                })
            })
            .collect::<Vec<_>>();
        workers
            .into_iter()
            .map(|w| w.join().unwrap())
            .collect::<Vec<_>>()
    });

    assert!(indices.iter().all(|i| *i == indices[0]));
    let ha = env.rt.map_object(a, rw()).unwrap();
    let entries = env.rt.fot_entries(&ha).unwrap();
    assert_eq!(entries.len(), THREADS + 1);
    assert_eq!(entries.iter().filter(|(_, t)| t.id == c).count(), 1);
    assert_eq!(env.rt.resolve_fot(&ha, indices[0], 0).unwrap().id(), c);
}

#[test]
fn references_survive_reopen() {
    let env = Env::new();
    let b = env.persistent();
    let a = env.persistent_tied_to(b);
    {
        let ha = env.rt.map_object(a, rwp()).unwrap();
        let idx = env.rt.insert_fot(&ha, b).unwrap();
        let hb = env.rt.resolve_fot(&ha, idx, 0).unwrap();
        hb.write_at(0x1000, b"payload").unwrap();
        ha.write_at(0x1000, &idx.to_le_bytes()).unwrap();
        env.rt.object_cmd(&ha, ObjectCmd::Sync).unwrap();
        env.rt.object_cmd(&hb, ObjectCmd::Sync).unwrap();
    }

    let env = env.reopen();
    let ha = env.rt.map_object(a, rwp()).unwrap();
    let mut idx = [0u8; 8];
    ha.read_at(0x1000, &mut idx).unwrap();
    let hb = env.rt.resolve_fot(&ha, u64::from_le_bytes(idx), 0).unwrap();
    assert_eq!(hb.id(), b);
    let mut buf = [0u8; 7];
    hb.read_at(0x1000, &mut buf).unwrap();
    assert_eq!(&buf, b"payload");
    assert_eq!(env.store.info(a).unwrap().ties, vec![b]);
}
