use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::task;

use crate::archive::Scope;
use crate::config::EngineConfig;
use crate::error::codes;
use crate::export::{self, ExportOptions};
use crate::ops::report::{ExportReport, PreflightReport, ReconcileReport, RestoreReport};
use crate::ops::Progress;
use crate::paths::DataLayout;
use crate::preflight;
use crate::restore::{self, reconcile, RestoreOptions};
use crate::state::{OperationLock, WriteGate};
use crate::{AppError, AppResult};

/// Everything an operation needs: configuration, the data layout and the
/// process-wide coordination primitives.
pub struct EngineContext {
    pub config: EngineConfig,
    pub layout: DataLayout,
    pub lock: OperationLock,
    pub gate: WriteGate,
}

impl EngineContext {
    pub fn new(config: EngineConfig) -> Self {
        let layout = DataLayout::new(config.data_dir.clone());
        Self {
            config,
            layout,
            lock: OperationLock::default(),
            gate: WriteGate::default(),
        }
    }
}

/// Async front door for UI and CLI collaborators. Clones share one lock and
/// one write gate.
#[derive(Clone)]
pub struct BackupEngine {
    ctx: Arc<EngineContext>,
}

impl BackupEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            ctx: Arc::new(EngineContext::new(config)),
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// The gate application writers must go through.
    pub fn write_gate(&self) -> WriteGate {
        self.ctx.gate.clone()
    }

    pub async fn create_backup(
        &self,
        scope: Scope,
        destination: PathBuf,
        opts: ExportOptions,
    ) -> AppResult<ExportReport> {
        let ctx = self.ctx.clone();
        run_blocking("create_backup", move || {
            export::create_backup(&ctx, scope, &destination, &opts)
        })
        .await
    }

    /// Read-only inspection. Does not take the operation lock.
    pub async fn preflight_restore(
        &self,
        archive: PathBuf,
        progress: Progress,
    ) -> AppResult<PreflightReport> {
        let ctx = self.ctx.clone();
        run_blocking("preflight_restore", move || {
            preflight::inspect(
                &archive,
                &ctx.config.limits,
                ctx.config.min_format_major,
                &progress,
            )
            .map(|inspection| inspection.report)
        })
        .await
    }

    pub async fn apply_restore(
        &self,
        archive: PathBuf,
        user_confirmed: bool,
        opts: RestoreOptions,
    ) -> AppResult<RestoreReport> {
        let ctx = self.ctx.clone();
        run_blocking("apply_restore", move || {
            restore::apply_restore(&ctx, &archive, user_confirmed, &opts)
        })
        .await
    }

    /// Startup hook: reconcile only when an interrupted restore left its
    /// marker behind.
    pub async fn reconcile_if_pending(&self) -> AppResult<Option<ReconcileReport>> {
        if !self.ctx.layout.marker().exists() {
            return Ok(None);
        }
        self.reconcile().await.map(Some)
    }

    /// Startup recovery; run before the application opens its stores.
    pub async fn reconcile(&self) -> AppResult<ReconcileReport> {
        let ctx = self.ctx.clone();
        run_blocking("reconcile", move || {
            let _guard = ctx.lock.acquire("reconcile")?;
            reconcile::reconcile(&ctx.layout, ctx.config.retention, Utc::now())
        })
        .await
    }
}

async fn run_blocking<T, F>(operation: &'static str, work: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    task::spawn_blocking(work).await.map_err(|err| {
        tracing::error!(target: "codictate_backup", event = "operation_task_failed", operation, error = %err);
        AppError::new(codes::OPERATION_TASK, "Backup task panicked")
            .with_context("operation", operation)
            .with_context("error", err.to_string())
    })?
}
