use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ts_rs::TS;
use uuid::Uuid;

/// Identifier attached to fatal restore failures so the UI message, the
/// JSON report and the log lines can be matched up.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[repr(transparent)]
#[serde(transparent)]
#[ts(type = "string")]
pub struct CrashId(Uuid);

impl CrashId {
    /// Generate a new UUIDv7 crash identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Access the underlying UUID value.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for CrashId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for CrashId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for CrashId {
    fn default() -> Self {
        Self::new()
    }
}
