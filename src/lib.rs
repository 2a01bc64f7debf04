//! Local backup and restore for Codictate user data: transcription history,
//! the custom dictionary, settings and (optionally) audio recordings.
//!
//! The three user-facing operations are [`BackupEngine::create_backup`],
//! [`BackupEngine::preflight_restore`] and [`BackupEngine::apply_restore`].
//! [`BackupEngine::reconcile`] recovers from a restore interrupted by a crash
//! and must run before the application opens its stores.

pub mod archive;
pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod fs_ops;
pub mod import;
pub mod logging;
pub mod migration;
pub mod ops;
pub mod paths;
pub mod preflight;
pub mod restore;
pub mod security;
pub mod state;
pub mod store;

pub use engine::{BackupEngine, EngineContext};
pub use error::{AppError, AppResult, ErrorClass};
