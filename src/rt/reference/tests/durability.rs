mod common;

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Barrier,
    },
    time::Duration,
};

use common::{rw, rwp, word, Env};
use objspace_rt::{
    abi::{
        error::RawTwzError,
        sync::{SyncFlags, SyncInfo, SYNC_PENDING},
        TwzError,
    },
    RuntimeConfig, SyncStatus,
};

#[test]
fn racing_publishes_have_one_winner() {
    const THREADS: usize = 4;
    let env = Env::new();
    let id = env.persistent();
    let h = env.rt.map_object(id, rwp()).unwrap();
    let release = word(&h, 0);
    let barrier = Barrier::new(THREADS);

    let results = std::thread::scope(|s| {
        let workers = (0..THREADS as u64)
            .map(|t| {
                let (env, h, barrier) = (&env, &h, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    let sync = SyncInfo::new(release, 0, t + 1, None, SyncFlags::empty());
                    env.rt.publish(h, &sync)
                })
            })
            .collect::<Vec<_>>();
        workers
            .into_iter()
            .map(|w| w.join().unwrap())
            .collect::<Vec<_>>()
    });

    let winners = results
        .iter()
        .filter(|r| **r == Ok(SyncStatus::Released))
        .count();
    assert_eq!(winners, 1);
    assert!(results
        .iter()
        .all(|r| r.is_ok() || *r == Err(TwzError::CONFLICT)));

    // A loser re-reads the version and retries.
    let current = release.load(Ordering::SeqCst);
    assert_ne!(current, 0);
    let retry = SyncInfo::new(release, current, current + 100, None, SyncFlags::empty());
    assert_eq!(env.rt.publish(&h, &retry), Ok(SyncStatus::Released));
    assert_eq!(release.load(Ordering::SeqCst), current + 100);
}

#[test]
fn conflict_leaves_durable_word_alone() {
    let env = Env::new();
    let id = env.persistent();
    let h = env.rt.map_object(id, rwp()).unwrap();
    let release = word(&h, 0);
    let durable = word(&h, 8);
    durable.store(7, Ordering::SeqCst);

    let sync = SyncInfo::new(release, 1, 2, Some(durable), SyncFlags::DURABLE);
    assert_eq!(env.rt.publish(&h, &sync), Err(TwzError::CONFLICT));
    assert_eq!(durable.load(Ordering::SeqCst), 7);
    assert_eq!(release.load(Ordering::SeqCst), 0);
}

#[test]
fn durable_publish_syncs_inline() {
    let env = Env::new();
    let id = env.persistent();
    let h = env.rt.map_object(id, rwp()).unwrap();
    h.write_at(0x1100, b"payload").unwrap();
    let release = word(&h, 0);
    let durable = word(&h, 8);
    let syncs = env.stats().sync_calls;

    let sync = SyncInfo::new(release, 0, 1, Some(durable), SyncFlags::DURABLE);
    assert_eq!(env.rt.publish(&h, &sync), Ok(SyncStatus::Durable));
    assert_eq!(
        durable.load(Ordering::SeqCst),
        RawTwzError::success().raw()
    );
    assert_eq!(env.stats().sync_calls, syncs + 1);
}

#[test]
fn async_publish_completes_in_background() {
    let env = Env::new();
    let id = env.persistent();
    let h = env.rt.map_object(id, rwp()).unwrap();
    let release = word(&h, 0);
    let durable = word(&h, 8);
    let syncs = env.stats().sync_calls;

    let sync = SyncInfo::new(release, 0, 1, Some(durable), SyncFlags::ASYNC_DURABLE);
    assert_eq!(env.rt.publish(&h, &sync), Ok(SyncStatus::Pending));
    assert_eq!(
        env.rt.wait_durable(durable, Some(Duration::from_secs(10))),
        Ok(())
    );
    assert_ne!(durable.load(Ordering::SeqCst), SYNC_PENDING);

    // Queue a few more, then drain.
    for v in 1..4 {
        let sync = SyncInfo::new(release, v, v + 1, None, SyncFlags::ASYNC_DURABLE);
        assert_eq!(env.rt.publish(&h, &sync), Ok(SyncStatus::Pending));
    }
    env.rt.drain_durable();
    assert_eq!(env.stats().sync_calls, syncs + 4);
}

#[test]
fn async_publish_without_flusher_is_inline() {
    let env = Env::with_config(RuntimeConfig {
        async_durability: false,
        ..Default::default()
    });
    let id = env.persistent();
    let h = env.rt.map_object(id, rwp()).unwrap();
    let release = word(&h, 0);
    let durable = word(&h, 8);

    let sync = SyncInfo::new(release, 0, 1, Some(durable), SyncFlags::ASYNC_DURABLE);
    assert_eq!(env.rt.publish(&h, &sync), Ok(SyncStatus::Durable));
    assert_eq!(env.rt.wait_durable(durable, Some(Duration::ZERO)), Ok(()));
}

#[test]
fn queued_sync_keeps_handle_alive() {
    let env = Env::new();
    let id = env.persistent();
    let h = env.rt.map_object(id, rwp()).unwrap();
    let release = word(&h, 0) as *const AtomicU64;
    let sync = SyncInfo {
        release,
        release_compare: 0,
        release_set: 1,
        durable: core::ptr::null(),
        flags: SyncFlags::ASYNC_DURABLE,
    };
    assert_eq!(env.rt.publish(&h, &sync), Ok(SyncStatus::Pending));
    env.rt.release_handle(h, objspace_rt::ReleaseFlags::NO_CACHE);
    env.rt.drain_durable();
    assert_eq!(env.store.info(id).unwrap().maps, 0);
}

#[test]
fn publish_checks_handle_and_words() {
    let env = Env::new();
    let id = env.persistent();

    let plain = env.rt.map_object(id, rw()).unwrap();
    let sync = SyncInfo::new(word(&plain, 0), 0, 1, None, SyncFlags::empty());
    assert_eq!(env.rt.publish(&plain, &sync), Err(TwzError::INVALID_ARGUMENT));

    let h = env.rt.map_object(id, rwp()).unwrap();
    let stray = AtomicU64::new(0);
    let outside = SyncInfo::new(&stray, 0, 1, None, SyncFlags::empty());
    assert_eq!(env.rt.publish(&h, &outside), Err(TwzError::INVALID_ARGUMENT));

    let misaligned = SyncInfo {
        release: h.base_ptr().wrapping_add(4).cast::<AtomicU64>().cast_const(),
        release_compare: 0,
        release_set: 1,
        durable: core::ptr::null(),
        flags: SyncFlags::empty(),
    };
    assert_eq!(env.rt.publish(&h, &misaligned), Err(TwzError::INVALID_ARGUMENT));

    let null_page = SyncInfo {
        release: h.start().cast::<AtomicU64>().cast_const(),
        ..misaligned
    };
    assert_eq!(env.rt.publish(&h, &null_page), Err(TwzError::INVALID_ARGUMENT));

    let bad_durable = SyncInfo::new(word(&h, 0), 0, 1, Some(&stray), SyncFlags::DURABLE);
    assert_eq!(env.rt.publish(&h, &bad_durable), Err(TwzError::INVALID_ARGUMENT));
    assert_eq!(word(&h, 0).load(Ordering::SeqCst), 0);
}
