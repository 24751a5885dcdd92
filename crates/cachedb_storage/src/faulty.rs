//! Fault-injecting wrapper.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Faults {
    appends: AtomicU32,
    torn: AtomicBool,
    flushes: AtomicBool,
}

/// Shared switchboard controlling a [`FaultyBackend`].
///
/// Cloned handles steer the same backend, so a test can keep one while the
/// backend is owned by a store.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    faults: Arc<Faults>,
}

impl FaultPlan {
    /// Creates a plan with every fault disarmed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `count` appends without writing anything.
    pub fn fail_appends(&self, count: u32) {
        self.faults.appends.store(count, Ordering::SeqCst);
    }

    /// Makes the next failing append write half of its bytes first.
    pub fn tear_writes(&self, torn: bool) {
        self.faults.torn.store(torn, Ordering::SeqCst);
    }

    /// Fails every flush and sync until disarmed.
    pub fn fail_flushes(&self, fail: bool) {
        self.faults.flushes.store(fail, Ordering::SeqCst);
    }

    /// Disarms every fault.
    pub fn clear(&self) {
        self.fail_appends(0);
        self.tear_writes(false);
        self.fail_flushes(false);
    }

    fn take_append_fault(&self) -> bool {
        self.faults
            .appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Wraps a backend and fails operations according to a [`FaultPlan`].
#[derive(Debug)]
pub struct FaultyBackend<B> {
    inner: B,
    plan: FaultPlan,
}

impl<B: StorageBackend> FaultyBackend<B> {
    /// Wraps `inner`, returning the backend and the plan that steers it.
    pub fn new(inner: B) -> (Self, FaultPlan) {
        let plan = FaultPlan::new();
        (
            Self {
                inner,
                plan: plan.clone(),
            },
            plan,
        )
    }

    /// Unwraps the inner backend.
    pub fn into_inner(self) -> B {
        self.inner
    }
}

impl<B: StorageBackend> StorageBackend for FaultyBackend<B> {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        if self.plan.take_append_fault() {
            if self.plan.faults.torn.load(Ordering::SeqCst) {
                self.inner.append(&data[..data.len() / 2])?;
            }
            return Err(StorageError::Injected {
                operation: "append",
            });
        }
        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.plan.faults.flushes.load(Ordering::SeqCst) {
            return Err(StorageError::Injected { operation: "flush" });
        }
        self.inner.flush()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.plan.faults.flushes.load(Ordering::SeqCst) {
            return Err(StorageError::Injected { operation: "sync" });
        }
        self.inner.sync()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }
}
