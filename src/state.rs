use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::codes;
use crate::{AppError, AppResult};

/// Process-wide mutual exclusion between export and restore. A second
/// caller is rejected, never queued.
#[derive(Clone, Default)]
pub struct OperationLock {
    flag: Arc<AtomicBool>,
}

impl OperationLock {
    pub fn acquire(&self, operation: &'static str) -> AppResult<OperationGuard> {
        if self
            .flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::new(
                codes::OPERATION_BUSY,
                "Another backup or restore is already running.",
            )
            .with_context("operation", operation));
        }
        tracing::debug!(target: "codictate_backup", event = "operation_lock_acquired", operation);
        Ok(OperationGuard {
            flag: self.flag.clone(),
        })
    }

    pub fn is_held(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub struct OperationGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Gate in front of every write to the live record store.
///
/// * ordinary writes hold it shared;
/// * the export fence holds it exclusively, so writers wait briefly;
/// * quiesce mode rejects writers outright until the guard drops.
#[derive(Clone, Default)]
pub struct WriteGate {
    inner: Arc<GateInner>,
}

#[derive(Default)]
struct GateInner {
    lock: RwLock<()>,
    quiesced: AtomicBool,
}

pub struct WriteHold<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

pub struct Fence<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

pub struct QuiesceGuard {
    inner: Arc<GateInner>,
}

impl WriteGate {
    pub fn begin_write(&self) -> AppResult<WriteHold<'_>> {
        self.reject_if_quiesced()?;
        let guard = self.inner.lock.read().unwrap_or_else(|e| e.into_inner());
        // Quiesce may have started while this writer waited on a fence.
        self.reject_if_quiesced()?;
        Ok(WriteHold { _guard: guard })
    }

    /// Exclusive hold for the duration of a coherent snapshot read.
    pub fn fence(&self) -> Fence<'_> {
        let guard = self.inner.lock.write().unwrap_or_else(|e| e.into_inner());
        Fence { _guard: guard }
    }

    /// Enter quiesce mode. Returns once in-flight writers have finished.
    pub fn quiesce(&self) -> QuiesceGuard {
        self.inner.quiesced.store(true, Ordering::SeqCst);
        drop(self.inner.lock.write().unwrap_or_else(|e| e.into_inner()));
        tracing::info!(target: "codictate_backup", event = "quiesce_entered");
        QuiesceGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn is_quiesced(&self) -> bool {
        self.inner.quiesced.load(Ordering::SeqCst)
    }

    fn reject_if_quiesced(&self) -> AppResult<()> {
        if self.is_quiesced() {
            return Err(AppError::new(
                codes::STORE_RESTORE_IN_PROGRESS,
                "A restore is in progress; changes cannot be saved right now.",
            ));
        }
        Ok(())
    }
}

impl Drop for QuiesceGuard {
    fn drop(&mut self) {
        self.inner.quiesced.store(false, Ordering::SeqCst);
        tracing::info!(target: "codictate_backup", event = "quiesce_released");
    }
}
