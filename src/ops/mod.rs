//! Progress events, cancellation and the typed operation reports shared by
//! export, preflight, restore and reconcile.

pub mod report;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::codes;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum Phase {
    Snapshot,
    Serialize,
    Media,
    Manifest,
    Package,
    Verify,
    Inspect,
    Checksums,
    Extract,
    Migrate,
    Import,
    Validate,
    RollbackSnapshot,
    Swap,
    Finalize,
    Reconcile,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Snapshot => "snapshot",
            Phase::Serialize => "serialize",
            Phase::Media => "media",
            Phase::Manifest => "manifest",
            Phase::Package => "package",
            Phase::Verify => "verify",
            Phase::Inspect => "inspect",
            Phase::Checksums => "checksums",
            Phase::Extract => "extract",
            Phase::Migrate => "migrate",
            Phase::Import => "import",
            Phase::Validate => "validate",
            Phase::RollbackSnapshot => "rollback_snapshot",
            Phase::Swap => "swap",
            Phase::Finalize => "finalize",
            Phase::Reconcile => "reconcile",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ProgressEvent {
    pub phase: Phase,
    #[ts(type = "number")]
    pub current: u64,
    #[ts(type = "number")]
    pub total: u64,
}

pub type ProgressHandler = Arc<dyn Fn(ProgressEvent) + Send + Sync + 'static>;

/// Observer handle. Silent unless a handler is attached.
#[derive(Clone, Default)]
pub struct Progress {
    handler: Option<ProgressHandler>,
}

impl Progress {
    pub fn new(handler: ProgressHandler) -> Self {
        Self {
            handler: Some(handler),
        }
    }

    pub fn silent() -> Self {
        Self::default()
    }

    pub fn emit(&self, phase: Phase, current: u64, total: u64) {
        tracing::trace!(
            target: "codictate_backup",
            event = "progress",
            phase = phase.as_str(),
            current,
            total
        );
        if let Some(handler) = &self.handler {
            handler(ProgressEvent {
                phase,
                current,
                total,
            });
        }
    }
}

/// Cooperative cancellation, consulted only at phase boundaries.
#[derive(Clone, Default, Debug)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn checkpoint(&self, phase: Phase) -> AppResult<()> {
        if self.is_canceled() {
            tracing::info!(target: "codictate_backup", event = "operation_canceled", phase = phase.as_str());
            return Err(AppError::new(codes::OPERATION_CANCELED, "The operation was canceled.")
                .with_context("phase", phase.as_str()));
        }
        Ok(())
    }
}
