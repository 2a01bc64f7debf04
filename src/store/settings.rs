use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::fs_ops::write_atomic;
use crate::security::hash_path;
use crate::state::WriteGate;
use crate::{AppError, AppResult};

pub const SETTINGS_PAYLOAD_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmPrompt {
    pub id: String,
    pub name: String,
    pub prompt: String,
}

/// Every user preference the application stores. Only the fields listed in
/// [`EXPORTED_FIELDS`] ever leave the machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub app_language: String,
    pub selected_language: String,
    pub translate_to_english: bool,
    pub overlay_position: String,
    pub audio_feedback: bool,
    pub audio_feedback_volume: f32,
    pub sound_theme: String,
    pub start_hidden: bool,
    pub autostart_enabled: bool,
    pub show_tray_icon: bool,
    pub update_checks_enabled: bool,
    pub paste_method: String,
    pub clipboard_handling: String,
    pub append_trailing_space: bool,
    pub auto_submit: bool,
    pub auto_submit_key: String,
    pub post_process_enabled: bool,
    pub post_process_provider_id: String,
    pub post_process_selected_prompt_id: Option<String>,
    pub post_process_prompts: Vec<LlmPrompt>,
    pub history_limit: u32,
    pub recording_retention_period: String,
    pub enable_filler_word_filter: bool,
    pub word_correction_threshold: f64,
    pub mute_while_recording: bool,
    pub log_level: String,

    // Secrets.
    pub post_process_api_keys: BTreeMap<String, String>,
    // Device-bound.
    pub selected_microphone: Option<String>,
    pub clamshell_microphone: Option<String>,
    pub selected_output_device: Option<String>,
    pub bindings: BTreeMap<String, String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            app_language: "en".into(),
            selected_language: "auto".into(),
            translate_to_english: false,
            overlay_position: "bottom".into(),
            audio_feedback: false,
            audio_feedback_volume: 1.0,
            sound_theme: "marimba".into(),
            start_hidden: false,
            autostart_enabled: false,
            show_tray_icon: true,
            update_checks_enabled: true,
            paste_method: "ctrl_v".into(),
            clipboard_handling: "dont_modify".into(),
            append_trailing_space: false,
            auto_submit: false,
            auto_submit_key: "enter".into(),
            post_process_enabled: false,
            post_process_provider_id: "openai".into(),
            post_process_selected_prompt_id: None,
            post_process_prompts: Vec::new(),
            history_limit: 5,
            recording_retention_period: "preserve_limit".into(),
            enable_filler_word_filter: true,
            word_correction_threshold: 0.18,
            mute_while_recording: false,
            log_level: "info".into(),
            post_process_api_keys: BTreeMap::new(),
            selected_microphone: None,
            clamshell_microphone: None,
            selected_output_device: None,
            bindings: BTreeMap::new(),
        }
    }
}

/// A single allow-listed field: how to read it for export and how to apply
/// a value from a backup.
pub struct FieldSpec {
    pub name: &'static str,
    export: fn(&AppSettings) -> Value,
    apply: fn(&mut AppSettings, Value) -> Result<(), serde_json::Error>,
}

macro_rules! field_table {
    ($($field:ident),* $(,)?) => {
        pub static EXPORTED_FIELDS: &[FieldSpec] = &[
            $(
                FieldSpec {
                    name: stringify!($field),
                    export: |settings: &AppSettings| -> Value {
                        serde_json::to_value(&settings.$field).unwrap_or(Value::Null)
                    },
                    apply: |settings: &mut AppSettings, value: Value| -> Result<(), serde_json::Error> {
                        settings.$field = serde_json::from_value(value)?;
                        Ok(())
                    },
                },
            )*
        ];
    };
}

field_table![
    app_language,
    selected_language,
    translate_to_english,
    overlay_position,
    audio_feedback,
    audio_feedback_volume,
    sound_theme,
    start_hidden,
    autostart_enabled,
    show_tray_icon,
    update_checks_enabled,
    paste_method,
    clipboard_handling,
    append_trailing_space,
    auto_submit,
    auto_submit_key,
    post_process_enabled,
    post_process_provider_id,
    post_process_selected_prompt_id,
    post_process_prompts,
    history_limit,
    recording_retention_period,
    enable_filler_word_filter,
    word_correction_threshold,
    mute_while_recording,
    log_level,
];

/// Fields that are never exported: secrets and values tied to this machine.
pub const EXCLUDED_FIELDS: &[&str] = &[
    "post_process_api_keys",
    "selected_microphone",
    "clamshell_microphone",
    "selected_output_device",
    "bindings",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsMergeError {
    #[error("settings field `{field}` has the wrong type: {reason}")]
    WrongType { field: String, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub applied: Vec<&'static str>,
    pub kept_current: Vec<&'static str>,
    /// Backup fields this version does not know about (or never imports).
    pub dropped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsPayload {
    pub version: u32,
    pub fields: Map<String, Value>,
}

/// Allow-listed fields in table order.
pub fn export_fields(settings: &AppSettings) -> SettingsPayload {
    let fields = EXPORTED_FIELDS
        .iter()
        .map(|field| (field.name.to_string(), (field.export)(settings)))
        .collect();
    SettingsPayload {
        version: SETTINGS_PAYLOAD_VERSION,
        fields,
    }
}

/// Field-by-field merge of a backup over the current settings.
pub fn merge_fields(
    current: &AppSettings,
    backup: &Map<String, Value>,
) -> Result<(AppSettings, MergeOutcome), SettingsMergeError> {
    let mut merged = current.clone();
    let mut outcome = MergeOutcome::default();

    for field in EXPORTED_FIELDS {
        match backup.get(field.name) {
            Some(value) => {
                (field.apply)(&mut merged, value.clone()).map_err(|err| {
                    SettingsMergeError::WrongType {
                        field: field.name.to_string(),
                        reason: err.to_string(),
                    }
                })?;
                outcome.applied.push(field.name);
            }
            None => outcome.kept_current.push(field.name),
        }
    }

    outcome.dropped = backup
        .keys()
        .filter(|key| !EXPORTED_FIELDS.iter().any(|field| field.name == key.as_str()))
        .cloned()
        .collect();

    Ok((merged, outcome))
}

/// Re-apply the backup's values for `applied` on top of newer local
/// settings. Everything else follows `current`.
pub fn rebase(
    merged: &AppSettings,
    current: &AppSettings,
    applied: &[&str],
) -> Result<AppSettings, SettingsMergeError> {
    let mut rebased = current.clone();
    for field in EXPORTED_FIELDS.iter().filter(|field| applied.contains(&field.name)) {
        (field.apply)(&mut rebased, (field.export)(merged)).map_err(|err| {
            SettingsMergeError::WrongType {
                field: field.name.to_string(),
                reason: err.to_string(),
            }
        })?;
    }
    Ok(rebased)
}

/// Missing file means defaults. Unknown keys are ignored by serde.
pub fn load(path: &Path) -> AppResult<AppSettings> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(AppSettings::default()),
        Err(err) => {
            return Err(AppError::from(err)
                .with_context("operation", "read_settings")
                .with_context("path_hash", hash_path(path)))
        }
    };
    serde_json::from_slice(&bytes)
        .map_err(|err| AppError::from(err).with_context("operation", "parse_settings"))
}

pub fn save(gate: &WriteGate, path: &Path, settings: &AppSettings) -> AppResult<()> {
    let _hold = gate.begin_write()?;
    write(path, settings)
}

pub(crate) fn write(path: &Path, settings: &AppSettings) -> AppResult<()> {
    let payload = serde_json::to_vec_pretty(settings)
        .map_err(|err| AppError::from(err).with_context("operation", "serialize_settings"))?;
    write_atomic(path, &payload).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "write_settings")
            .with_context("path_hash", hash_path(path))
    })
}
