use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::archive::lines::{BoundedLines, LineError};
use crate::archive::records::HistoryLine;
use crate::error::codes;
use crate::migration::Plan;
use crate::security::hash_path;
use crate::store::dictionary::{self, DictionaryFile};
use crate::store::settings::{self, AppSettings, MergeOutcome, SettingsMergeError, SettingsPayload};
use crate::store::CustomWordEntry;
use crate::{AppError, AppResult};

fn open(path: &Path) -> AppResult<File> {
    File::open(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_extracted_payload")
            .with_context("path_hash", hash_path(path))
    })
}

/// Whole-file payloads were size-checked by preflight; the read is still
/// bounded in case the file changed since.
fn read_json(path: &Path, component: &str, max_bytes: u64) -> AppResult<Value> {
    let mut bytes = Vec::new();
    open(path)?
        .take(max_bytes + 1)
        .read_to_end(&mut bytes)
        .map_err(|err| AppError::from(err).with_context("operation", "read_extracted_payload"))?;
    if bytes.len() as u64 > max_bytes {
        return Err(corrupt_payload(component, "payload is larger than allowed"));
    }
    serde_json::from_slice(&bytes).map_err(|err| corrupt_payload(component, &err.to_string()))
}

fn typed<T: DeserializeOwned>(value: Value, component: &str) -> AppResult<T> {
    serde_json::from_value(value).map_err(|err| corrupt_payload(component, &err.to_string()))
}

fn corrupt_payload(component: &str, reason: &str) -> AppError {
    AppError::new(
        codes::IMPORT_CORRUPT_PAYLOAD,
        format!("The {component} data in this backup is damaged."),
    )
    .with_context("component", component)
    .with_context("reason", reason)
}

fn corrupt_record(line: u64, reason: impl Into<String>) -> AppError {
    AppError::new(
        codes::IMPORT_CORRUPT_RECORD,
        format!("History record on line {line} is damaged."),
    )
    .with_context("line", line.to_string())
    .with_context("reason", reason)
}

/// Streams `history.jsonl`, upgrading and parsing one line at a time.
pub struct HistoryReader<'p> {
    lines: BoundedLines<BufReader<File>>,
    plan: &'p Plan,
}

impl<'p> HistoryReader<'p> {
    pub fn open(path: &Path, plan: &'p Plan, max_line_bytes: usize) -> AppResult<Self> {
        Ok(Self {
            lines: BoundedLines::new(BufReader::new(open(path)?), max_line_bytes),
            plan,
        })
    }

    /// Next record, skipping blank lines. Any bad line is fatal to the import.
    pub fn next_record(&mut self) -> AppResult<Option<HistoryLine>> {
        loop {
            let raw = match self.lines.next_line() {
                Ok(Some(raw)) => raw,
                Ok(None) => return Ok(None),
                Err(LineError::TooLong { line, limit }) => {
                    return Err(corrupt_record(line, format!("longer than {limit} bytes")))
                }
                Err(LineError::Io { line, source }) => {
                    return Err(
                        AppError::from(source).with_context("line", line.to_string())
                    )
                }
            };
            if raw.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let parsed = serde_json::from_slice::<Value>(raw);
            let line = self.lines.line_number();
            let value = parsed.map_err(|err| corrupt_record(line, err.to_string()))?;
            let value = self
                .plan
                .run(value)
                .map_err(|err| corrupt_record(line, err.to_string()))?;
            let record: HistoryLine =
                serde_json::from_value(value).map_err(|err| corrupt_record(line, err.to_string()))?;
            return Ok(Some(record));
        }
    }
}

pub fn read_dictionary(path: &Path, plan: &Plan, max_bytes: u64) -> AppResult<Vec<CustomWordEntry>> {
    let value = read_json(path, "dictionary", max_bytes)?;
    let value = plan.run(value).map_err(AppError::from)?;
    let file: DictionaryFile = typed(value, "dictionary")?;
    if let Some(index) = dictionary::first_duplicate(&file.entries) {
        return Err(corrupt_payload("dictionary", "duplicate entry")
            .with_context("index", index.to_string()));
    }
    Ok(file.entries)
}

pub fn merge_settings(
    path: &Path,
    plan: &Plan,
    current: &AppSettings,
    max_bytes: u64,
) -> AppResult<(AppSettings, MergeOutcome)> {
    let value = read_json(path, "settings", max_bytes)?;
    let value = plan.run(value).map_err(AppError::from)?;
    let payload: SettingsPayload = typed(value, "settings")?;
    settings::merge_fields(current, &payload.fields).map_err(|err| match err {
        SettingsMergeError::WrongType { ref field, .. } => AppError::new(
            codes::IMPORT_SETTINGS_TYPE,
            "A setting in this backup has an unexpected value.",
        )
        .with_context("field", field.clone())
        .with_context("reason", err.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::Component;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn history_reader_upgrades_v1_lines() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("history.jsonl");
        fs::write(
            &path,
            "{\"id\":1,\"timestamp\":5,\"title\":\"a\",\"transcription_text\":\"hi\",\"file_name\":\"a.wav\"}\n\n",
        )
        .expect("write");
        let plan = Plan::for_component(Component::History, 1).expect("plan");
        let mut reader = HistoryReader::open(&path, &plan, 1024).expect("open");
        let record = reader.next_record().expect("read").expect("record");
        assert_eq!(record.audio.map(|a| a.file_name).as_deref(), Some("a.wav"));
        assert_eq!(record.duration_ms, 0);
        assert!(reader.next_record().expect("eof").is_none());
    }

    #[test]
    fn malformed_line_reports_its_number() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("history.jsonl");
        fs::write(&path, "{\"id\":1}\n").expect("write");
        let plan = Plan::for_component(Component::History, 2).expect("plan");
        let err = HistoryReader::open(&path, &plan, 1024)
            .expect("open")
            .next_record()
            .expect_err("missing fields");
        assert_eq!(err.code(), codes::IMPORT_CORRUPT_RECORD);
        assert_eq!(err.context().get("line").map(String::as_str), Some("1"));
    }

    #[test]
    fn duplicate_dictionary_input_is_corruption() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("dictionary.json");
        fs::write(&path, r#"["same", "same"]"#).expect("write");
        let plan = Plan::for_component(Component::Dictionary, 1).expect("plan");
        let err = read_dictionary(&path, &plan, 1024).expect_err("duplicate");
        assert_eq!(err.code(), codes::IMPORT_CORRUPT_PAYLOAD);
    }

    #[test]
    fn wrong_settings_type_is_reported_by_field() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"version":2,"fields":{"start_hidden":"yes"}}"#).expect("write");
        let plan = Plan::for_component(Component::Settings, 2).expect("plan");
        let err = merge_settings(&path, &plan, &AppSettings::default(), 1024).expect_err("type");
        assert_eq!(err.code(), codes::IMPORT_SETTINGS_TYPE);
        assert_eq!(err.context().get("field").map(String::as_str), Some("start_hidden"));
    }
}
