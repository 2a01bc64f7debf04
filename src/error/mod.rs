use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use anyhow::Error as AnyhowError;
use rusqlite::Error as SqliteError;
use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use std::io::Error as IoError;
use ts_rs::TS;
use zip::result::ZipError;

mod crash_id;
pub mod codes;

pub use codes::ErrorClass;
pub use crash_id::CrashId;

/// A structured error that can be serialized and surfaced to the UI or CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct AppError {
    /// Machine readable error code, `AREA/REASON`.
    pub code: String,
    /// Human friendly message that can be shown directly to the user.
    pub message: String,
    /// Arbitrary key/value pairs that provide additional context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    #[ts(as = "Option<HashMap<String, String>>", optional)]
    pub context: HashMap<String, String>,
    /// Optional nested cause that preserves the error chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub cause: Option<Box<AppError>>,
    /// Present on fatal errors so logs and UI reports can be correlated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub crash_id: Option<CrashId>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Default code used when an upstream error does not expose a specific code.
    pub const UNKNOWN_CODE: &'static str = "APP/UNKNOWN";
    /// Code used for errors created from free-form messages.
    pub const GENERIC_CODE: &'static str = "APP/GENERIC";

    /// Construct a new application error with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
            crash_id: None,
        }
    }

    /// Construct an error that carries a fresh crash id.
    pub fn critical(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut error = AppError::new(code, message);
        error.crash_id = Some(CrashId::new());
        error
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    pub fn crash_id(&self) -> Option<&CrashId> {
        self.crash_id.as_ref()
    }

    /// Taxonomy class derived from the error code.
    pub fn class(&self) -> ErrorClass {
        codes::classify(&self.code)
    }

    pub fn is_blocking(&self) -> bool {
        self.class() == ErrorClass::Blocking
    }

    /// Adds a contextual key/value pair to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Sets the nested cause for the error.
    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            write!(f, "[{}] {} ({:?})", self.code, self.message, self.context)
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<AnyhowError> for AppError {
    fn from(error: AnyhowError) -> Self {
        fn convert(err: &(dyn StdError + 'static)) -> AppError {
            if let Some(app) = err.downcast_ref::<AppError>() {
                return app.clone();
            }
            if let Some(io) = err.downcast_ref::<IoError>() {
                return AppError::new(format!("IO/{:?}", io.kind()), io.to_string());
            }

            let mut root = AppError::new(AppError::UNKNOWN_CODE, err.to_string());
            if let Some(source) = err.source() {
                root.cause = Some(Box::new(convert(source)));
            }
            root
        }

        convert(error.as_ref())
    }
}

impl From<IoError> for AppError {
    fn from(error: IoError) -> Self {
        let code = format!("IO/{:?}", error.kind());
        let mut app_error = AppError::new(code, error.to_string());
        if let Some(os_code) = error.raw_os_error() {
            app_error = app_error.with_context("os_code", os_code.to_string());
        }
        app_error
    }
}

impl From<SerdeJsonError> for AppError {
    fn from(error: SerdeJsonError) -> Self {
        let code = if error.is_data() {
            "JSON/DATA"
        } else if error.is_syntax() {
            "JSON/SYNTAX"
        } else if error.is_eof() {
            "JSON/EOF"
        } else if error.is_io() {
            "JSON/IO"
        } else {
            "JSON/ERROR"
        };

        let mut app_error = AppError::new(code, error.to_string());
        let line = error.line();
        if line > 0 {
            app_error = app_error.with_context("line", line.to_string());
        }
        let column = error.column();
        if column > 0 {
            app_error = app_error.with_context("column", column.to_string());
        }
        app_error
    }
}

impl From<SqliteError> for AppError {
    fn from(error: SqliteError) -> Self {
        match error {
            SqliteError::QueryReturnedNoRows => {
                AppError::new("SQLITE/NO_ROWS", "Query returned no rows")
            }
            SqliteError::SqliteFailure(ffi, message) => {
                let code = format!("SQLITE/{:?}", ffi.code);
                let text = message.unwrap_or_else(|| ffi.to_string());
                AppError::new(code, text).with_context("extended_code", ffi.extended_code.to_string())
            }
            SqliteError::FromSqlConversionFailure(index, _, source) => {
                AppError::new("SQLITE/DECODE", source.to_string())
                    .with_context("column_index", index.to_string())
            }
            other => AppError::new("SQLITE/ERROR", other.to_string()),
        }
    }
}

impl From<ZipError> for AppError {
    fn from(error: ZipError) -> Self {
        match error {
            ZipError::Io(err) => AppError::from(err).with_context("source", "zip"),
            ZipError::InvalidArchive(reason) => AppError::new(
                codes::PREFLIGHT_ARCHIVE_UNREADABLE,
                format!("The backup file is not a readable archive: {reason}"),
            ),
            ZipError::UnsupportedArchive(reason) => AppError::new(
                codes::PREFLIGHT_ARCHIVE_UNREADABLE,
                format!("The backup archive uses an unsupported feature: {reason}"),
            ),
            ZipError::FileNotFound => AppError::new(
                codes::PREFLIGHT_MISSING_ENTRY,
                "A required file is missing from the backup.",
            ),
        }
    }
}
