use core::sync::atomic::{AtomicU64, Ordering};

use crate::{error::TwzError, Result};

bitflags::bitflags! {
    /// Flags for a sync command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SyncFlags: u32 {
        /// Sync updates to durable storage
        const DURABLE = 1 << 0;
        /// Write release before triggering durable writeback, and don't wait for it
        const ASYNC_DURABLE = 1 << 1;
    }
}

/// Value a durable word holds while a sync is still in flight.
pub const SYNC_PENDING: u64 = u64::MAX;

/// Parameters for publishing an update to a persistent object.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SyncInfo {
    /// Pointer to the release word (the version of the published state).
    pub release: *const AtomicU64,
    /// Value to compare against the release word.
    pub release_compare: u64,
    /// Value to set if the release word matches the compare value.
    pub release_set: u64,
    /// Pointer to wait word for durability return value. May be null.
    pub durable: *const AtomicU64,
    /// Flags for this sync command.
    pub flags: SyncFlags,
}

unsafe impl Send for SyncInfo {}
unsafe impl Sync for SyncInfo {}

impl SyncInfo {
    pub fn new(
        release: &AtomicU64,
        release_compare: u64,
        release_set: u64,
        durable: Option<&AtomicU64>,
        flags: SyncFlags,
    ) -> Self {
        Self {
            release,
            release_compare,
            release_set,
            durable: durable.map_or(core::ptr::null(), |d| d as *const _),
            flags,
        }
    }

    /// Compare-and-set the release word.
    ///
    /// # Safety
    /// The release pointer must be valid.
    pub unsafe fn try_release(&self) -> Result<()> {
        let release = self.release.as_ref().ok_or(TwzError::INVALID_ARGUMENT)?;
        release
            .compare_exchange(
                self.release_compare,
                self.release_set,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| TwzError::CONFLICT)
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_cas() {
        let release = AtomicU64::new(0);
        let durable = AtomicU64::new(SYNC_PENDING);
        let info = SyncInfo::new(&release, 0, 1, Some(&durable), SyncFlags::DURABLE);
        unsafe {
            assert!(info.try_release().is_ok());
            assert_eq!(info.try_release(), Err(TwzError::CONFLICT));
        }
        assert_eq!(release.load(Ordering::SeqCst), 1);
        assert_eq!(durable.load(Ordering::SeqCst), SYNC_PENDING);
    }
}
