use serde::{Deserialize, Serialize};

use crate::store::{AudioStatus, HistoryEntry, NewHistoryEntry};
use crate::store::stats::UserStats;

pub const HISTORY_PAYLOAD_VERSION: u32 = 2;
pub const STATS_PAYLOAD_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioRef {
    pub file_name: String,
}

/// One line of `history/history.jsonl` at the current payload version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryLine {
    /// Source-machine identifier; informational only.
    pub id: i64,
    pub timestamp: i64,
    #[serde(default)]
    pub saved: bool,
    pub title: String,
    pub transcription_text: String,
    #[serde(default)]
    pub post_processed_text: Option<String>,
    #[serde(default)]
    pub post_process_prompt: Option<String>,
    pub duration_ms: i64,
    #[serde(default)]
    pub audio: Option<AudioRef>,
}

impl HistoryLine {
    pub fn from_entry(entry: &HistoryEntry) -> Self {
        let audio = entry
            .file_name
            .as_ref()
            .filter(|name| !name.is_empty())
            .map(|name| AudioRef {
                file_name: name.clone(),
            });
        Self {
            id: entry.id,
            timestamp: entry.timestamp,
            saved: entry.saved,
            title: entry.title.clone(),
            transcription_text: entry.transcription_text.clone(),
            post_processed_text: entry.post_processed_text.clone(),
            post_process_prompt: entry.post_process_prompt.clone(),
            duration_ms: entry.duration_ms,
            audio,
        }
    }

    /// Row for a fresh store. Media resolution decides the final file name
    /// and status.
    pub fn into_new_entry(self, file_name: Option<String>, audio_status: AudioStatus) -> NewHistoryEntry {
        NewHistoryEntry {
            file_name,
            timestamp: self.timestamp,
            saved: self.saved,
            title: self.title,
            transcription_text: self.transcription_text,
            post_processed_text: self.post_processed_text,
            post_process_prompt: self.post_process_prompt,
            duration_ms: self.duration_ms,
            audio_status,
        }
    }
}

/// `history/user_stats.json`. Written for humans and older tooling; the
/// importer never reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub version: u32,
    pub stats: UserStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_name_means_no_audio() {
        let entry = HistoryEntry {
            id: 4,
            file_name: Some(String::new()),
            timestamp: 10,
            saved: true,
            title: "t".into(),
            transcription_text: "hi".into(),
            post_processed_text: None,
            post_process_prompt: None,
            duration_ms: 5,
            audio_status: AudioStatus::None,
        };
        let line = HistoryLine::from_entry(&entry);
        assert!(line.audio.is_none());
        let json = serde_json::to_value(&line).expect("serialize");
        assert_eq!(json["audio"], serde_json::Value::Null);
    }

    #[test]
    fn missing_required_field_fails_to_parse() {
        let err = serde_json::from_str::<HistoryLine>(r#"{"id":1,"timestamp":2,"title":"x","duration_ms":0}"#)
            .expect_err("transcription_text required");
        assert!(err.to_string().contains("transcription_text"));
    }
}
