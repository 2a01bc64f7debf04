use chrono::{SecondsFormat, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use super::Scope;
use crate::error::codes;
use crate::AppError;

pub const FORMAT_VERSION: &str = "2.0.0";
pub const CURRENT_FORMAT_MAJOR: u64 = 2;
/// Oldest major still restorable. Major 1 is deprecated and will be
/// dropped once the current major is bumped.
pub const OLDEST_SUPPORTED_MAJOR: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ComponentInfo {
    pub payload_version: u32,
    #[ts(type = "number")]
    pub count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct MediaInfo {
    #[ts(type = "number")]
    pub count: u64,
    #[ts(type = "number")]
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Components {
    pub history: ComponentInfo,
    pub dictionary: ComponentInfo,
    pub settings: ComponentInfo,
    #[serde(default)]
    pub recordings: MediaInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ManifestWarning {
    pub code: String,
    pub message: String,
    /// Archive-relative path the warning is about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Manifest {
    pub format_version: String,
    pub created_at: String,
    pub app_version: String,
    pub platform: Platform,
    pub scope: Scope,
    pub components: Components,
    #[serde(default)]
    pub warnings: Vec<ManifestWarning>,
}

impl Manifest {
    pub fn new(scope: Scope, components: Components, warnings: Vec<ManifestWarning>) -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: Platform::current(),
            scope,
            components,
            warnings,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, AppError> {
        serde_json::from_slice(bytes).map_err(|err| {
            AppError::new(
                codes::PREFLIGHT_MANIFEST_INVALID,
                "The backup manifest could not be read.",
            )
            .with_cause(err)
        })
    }

    pub fn format_version(&self) -> Result<Version, AppError> {
        Version::parse(&self.format_version).map_err(|err| {
            AppError::new(
                codes::PREFLIGHT_MANIFEST_INVALID,
                "The backup format version is not valid.",
            )
            .with_context("format_version", self.format_version.clone())
            .with_context("error", err.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn components() -> Components {
        let info = ComponentInfo {
            payload_version: 2,
            count: 3,
        };
        Components {
            history: info,
            dictionary: info,
            settings: info,
            recordings: MediaInfo::default(),
        }
    }

    #[test]
    fn manifest_uses_camel_case_and_current_version() {
        let manifest = Manifest::new(Scope::Lightweight, components(), Vec::new());
        let value = serde_json::to_value(&manifest).expect("serialize");
        assert_eq!(value["formatVersion"], FORMAT_VERSION);
        assert_eq!(value["scope"], "lightweight");
        assert_eq!(value["components"]["history"]["payloadVersion"], 2);
        assert_eq!(manifest.format_version().expect("semver").major, CURRENT_FORMAT_MAJOR);
        assert!(manifest.created_at.ends_with('Z'));
    }

    #[test]
    fn garbage_manifest_is_blocking() {
        let err = Manifest::parse(b"{not json").expect_err("invalid");
        assert_eq!(err.code(), codes::PREFLIGHT_MANIFEST_INVALID);
        assert!(err.is_blocking());
    }

    #[test]
    fn bad_format_version_is_reported() {
        let mut manifest = Manifest::new(Scope::Full, components(), Vec::new());
        manifest.format_version = "two".into();
        let err = manifest.format_version().expect_err("invalid semver");
        assert_eq!(err.code(), codes::PREFLIGHT_MANIFEST_INVALID);
    }
}
