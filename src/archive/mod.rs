//! The portable archive: entry layout, manifest, checksum set, payload
//! line format and the bounded readers used to inspect it.

pub mod checksums;
pub mod lines;
pub mod manifest;
pub mod records;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

pub const ARCHIVE_EXTENSION: &str = "codictatebackup";

pub const MANIFEST_PATH: &str = "manifest.json";
pub const CHECKSUMS_PATH: &str = "checksums.sha256";
pub const HISTORY_PATH: &str = "history/history.jsonl";
pub const STATS_PATH: &str = "history/user_stats.json";
pub const DICTIONARY_PATH: &str = "dictionary/dictionary.json";
pub const SETTINGS_PATH: &str = "settings/settings.json";
pub const RECORDINGS_PREFIX: &str = "recordings/";

/// Every archive must carry these, whatever its scope.
pub const REQUIRED_ENTRIES: [&str; 6] = [
    MANIFEST_PATH,
    CHECKSUMS_PATH,
    HISTORY_PATH,
    STATS_PATH,
    DICTIONARY_PATH,
    SETTINGS_PATH,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum Scope {
    /// Records, dictionary, settings and referenced audio.
    Full,
    /// Everything except audio.
    Lightweight,
}

impl Scope {
    pub fn includes_media(self) -> bool {
        matches!(self, Scope::Full)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Full => "full",
            Scope::Lightweight => "lightweight",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Scope::Full),
            "lightweight" => Ok(Scope::Lightweight),
            other => Err(format!("unknown scope `{other}` (expected full or lightweight)")),
        }
    }
}

/// `recordings/<name>` for media entries, `None` otherwise.
pub fn media_name(entry: &str) -> Option<&str> {
    entry
        .strip_prefix(RECORDINGS_PREFIX)
        .filter(|rest| !rest.is_empty())
}
