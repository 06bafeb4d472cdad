//! Publishing updates to persistent objects.
//!
//! A writer fills in its payload, then publishes it by swinging a release word from the version
//! it read to a new version. With `DURABLE`, publish blocks until the object has been written
//! back and stores the outcome in the durable word. With `ASYNC_DURABLE`, the write-back is
//! handed to a background flusher thread: the durable word holds [SYNC_PENDING] until the flusher
//! stores the outcome and wakes anyone in [Runtime::wait_durable].

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{Receiver, Sender},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use objspace_rt_abi::{
    error::{GenericError, RawTwzError},
    object::MapFlags,
    service::ObjectCmd,
    sync::{SyncFlags, SyncInfo, SYNC_PENDING},
    Result, TwzError,
};
use parking_lot::{Condvar, Mutex};
use tracing::warn;

use super::{object::ObjectHandle, Runtime};

/// How far a successful [Runtime::publish] got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// The release word was updated; no durability was requested.
    Released,
    /// The release word was updated and the object written back.
    Durable,
    /// The release word was updated and write-back is queued. Watch the durable word.
    Pending,
}

struct DurableWord(*const AtomicU64);

// Safety: the word lives inside a mapping that the job keeps alive through its handle.
unsafe impl Send for DurableWord {}

struct FlushJob {
    handle: ObjectHandle,
    durable: Option<DurableWord>,
}

struct FlushState {
    pending: Mutex<usize>,
    cond: Condvar,
}

impl FlushState {
    fn store_result(&self, word: Option<&AtomicU64>, res: Result<()>) {
        if let Some(word) = word {
            word.store(RawTwzError::from(res).raw(), Ordering::SeqCst);
        }
        let _guard = self.pending.lock();
        self.cond.notify_all();
    }

    fn finish_one(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        self.cond.notify_all();
    }
}

struct Flusher {
    sender: Sender<FlushJob>,
    thread: JoinHandle<()>,
}

fn sync_handle(handle: &ObjectHandle) -> Result<()> {
    handle
        .info
        .service
        .object_cmd(&handle.info.region, ObjectCmd::Sync)
}

fn flusher_main(receiver: Receiver<FlushJob>, state: Arc<FlushState>) {
    while let Ok(FlushJob { handle, durable }) = receiver.recv() {
        let res = catch_unwind(AssertUnwindSafe(|| sync_handle(&handle))).unwrap_or_else(|_| {
            tracing::error!("sync of {} panicked", handle.id());
            Err(GenericError::Internal.into())
        });
        if let Err(e) = res {
            warn!("background sync of {} failed: {}", handle.id(), e);
        }
        // Safety: the word lies inside `handle`'s mapping, which is still held.
        let word = durable.map(|w| unsafe { &*w.0 });
        state.store_result(word, res);
        drop(handle);
        state.finish_one();
    }
}

/// Runs write-backs for `ASYNC_DURABLE` publishes and tracks how many are outstanding.
pub(crate) struct DurabilityCoordinator {
    state: Arc<FlushState>,
    flusher: Mutex<Option<Flusher>>,
}

impl DurabilityCoordinator {
    pub fn new(background: bool) -> Self {
        let state = Arc::new(FlushState {
            pending: Mutex::new(0),
            cond: Condvar::new(),
        });
        let flusher = if background {
            let (sender, receiver) = std::sync::mpsc::channel();
            let thread_state = state.clone();
            match std::thread::Builder::new()
                .name("objspace-flusher".into())
                .spawn(move || flusher_main(receiver, thread_state))
            {
                Ok(thread) => Some(Flusher { sender, thread }),
                Err(e) => {
                    warn!("failed to start flusher thread, syncing inline: {}", e);
                    None
                }
            }
        } else {
            None
        };
        Self {
            state,
            flusher: Mutex::new(flusher),
        }
    }

    /// Hand a write-back to the flusher. Gives the job back if there is no flusher.
    fn enqueue(&self, job: FlushJob) -> std::result::Result<(), FlushJob> {
        let flusher = self.flusher.lock();
        let Some(flusher) = flusher.as_ref() else {
            return Err(job);
        };
        *self.state.pending.lock() += 1;
        if let Err(e) = flusher.sender.send(job) {
            self.state.finish_one();
            return Err(e.0);
        }
        Ok(())
    }

    /// Block until a durable word leaves [SYNC_PENDING], then return the outcome it holds.
    pub fn wait(&self, word: &AtomicU64, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut guard = self.state.pending.lock();
        loop {
            let val = word.load(Ordering::SeqCst);
            if val != SYNC_PENDING {
                return RawTwzError::new(val).result();
            }
            match deadline {
                Some(deadline) => {
                    if self.state.cond.wait_until(&mut guard, deadline).timed_out()
                        && word.load(Ordering::SeqCst) == SYNC_PENDING
                    {
                        return Err(TwzError::TIMED_OUT);
                    }
                }
                None => self.state.cond.wait(&mut guard),
            }
        }
    }

    /// Wait for every queued write-back to finish.
    pub fn drain(&self) {
        let mut pending = self.state.pending.lock();
        while *pending > 0 {
            self.state.cond.wait(&mut pending);
        }
    }

    /// Drain, then stop the flusher thread.
    pub fn shutdown(&self) {
        self.drain();
        let Some(Flusher { sender, thread }) = self.flusher.lock().take() else {
            return;
        };
        drop(sender);
        if thread.join().is_err() {
            warn!("flusher thread panicked");
        }
    }
}

fn check_word(handle: &ObjectHandle, word: *const AtomicU64) -> Result<()> {
    let ptr = word.cast::<u8>();
    if ptr.is_null() || ptr as usize % core::mem::align_of::<AtomicU64>() != 0 {
        return Err(TwzError::INVALID_ARGUMENT);
    }
    let in_data = handle.offset_of(ptr).is_some_and(|off| {
        off >= handle.map_flags().base_offset()
            && off + core::mem::size_of::<AtomicU64>() <= handle.valid_len()
    });
    if !in_data {
        return Err(TwzError::INVALID_ARGUMENT);
    }
    Ok(())
}

impl Runtime {
    /// Publish an update to the persistent object behind `handle`.
    ///
    /// The release word is compare-and-set first. If it does not hold `release_compare`, a
    /// conflict is returned and the durable word is left alone; the caller may re-read and
    /// retry. Both words must be 8-byte aligned and lie inside the handle's backed data region.
    #[tracing::instrument(skip(self), level = "trace")]
    pub fn publish(&self, handle: &ObjectHandle, sync: &SyncInfo) -> Result<SyncStatus> {
        if !handle.map_flags().contains(MapFlags::PERSIST) {
            return Err(TwzError::INVALID_ARGUMENT);
        }
        if !handle.map_flags().contains(MapFlags::WRITE) {
            return Err(TwzError::PERMISSION_DENIED);
        }
        check_word(handle, sync.release)?;
        if !sync.durable.is_null() {
            check_word(handle, sync.durable)?;
        }

        // Safety: both words were checked to lie inside the handle's mapping.
        unsafe { sync.try_release() }?;
        let durable = unsafe { sync.durable.as_ref() };

        if sync.flags.contains(SyncFlags::ASYNC_DURABLE) {
            if let Some(word) = durable {
                word.store(SYNC_PENDING, Ordering::SeqCst);
            }
            let job = FlushJob {
                handle: handle.clone(),
                durable: durable.map(|w| DurableWord(w as *const AtomicU64)),
            };
            match self.durability.enqueue(job) {
                Ok(()) => return Ok(SyncStatus::Pending),
                Err(_) => tracing::trace!("no flusher, syncing {} inline", handle.id()),
            }
        }

        if sync
            .flags
            .intersects(SyncFlags::DURABLE | SyncFlags::ASYNC_DURABLE)
        {
            let res = sync_handle(handle);
            self.durability.state.store_result(durable, res);
            res?;
            return Ok(SyncStatus::Durable);
        }
        Ok(SyncStatus::Released)
    }

    /// Wait for a durable word to receive the outcome of a publish. Waits forever when `timeout`
    /// is None.
    pub fn wait_durable(&self, word: &AtomicU64, timeout: Option<Duration>) -> Result<()> {
        self.durability.wait(word, timeout)
    }

    /// Wait for all background write-backs queued so far.
    pub fn drain_durable(&self) {
        self.durability.drain();
    }
}
