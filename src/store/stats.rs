use std::collections::BTreeSet;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

use super::history::HistoryEntry;

/// Aggregates derived from the history table. Never imported from an
/// archive; always recomputed from records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStats {
    pub total_words: i64,
    pub total_duration_ms: i64,
    pub total_transcriptions: i64,
    pub first_transcription_date: Option<i64>,
    pub last_transcription_date: Option<i64>,
    /// Distinct UTC calendar days (`YYYY-MM-DD`) with at least one record.
    pub transcription_dates: Vec<String>,
}

pub fn count_words(text: &str) -> i64 {
    text.unicode_words().count() as i64
}

/// Word counts use the post-processed text when present.
pub fn entry_words(entry: &HistoryEntry) -> i64 {
    match entry.post_processed_text.as_deref() {
        Some(text) if !text.trim().is_empty() => count_words(text),
        _ => count_words(&entry.transcription_text),
    }
}

pub fn utc_day(timestamp: i64) -> Option<String> {
    DateTime::from_timestamp(timestamp, 0).map(|dt| dt.date_naive().format("%Y-%m-%d").to_string())
}

#[derive(Debug, Default)]
pub struct StatsAccumulator {
    stats: UserStats,
    days: BTreeSet<String>,
}

impl StatsAccumulator {
    pub fn add(&mut self, entry: &HistoryEntry) {
        self.stats.total_words += entry_words(entry);
        self.stats.total_duration_ms += entry.duration_ms.max(0);
        self.stats.total_transcriptions += 1;
        self.stats.first_transcription_date = Some(
            self.stats
                .first_transcription_date
                .map_or(entry.timestamp, |first| first.min(entry.timestamp)),
        );
        self.stats.last_transcription_date = Some(
            self.stats
                .last_transcription_date
                .map_or(entry.timestamp, |last| last.max(entry.timestamp)),
        );
        if let Some(day) = utc_day(entry.timestamp) {
            self.days.insert(day);
        }
    }

    pub fn finish(mut self) -> UserStats {
        self.stats.transcription_dates = self.days.into_iter().collect();
        self.stats
    }
}

pub fn compute<'a>(entries: impl IntoIterator<Item = &'a HistoryEntry>) -> UserStats {
    let mut acc = StatsAccumulator::default();
    for entry in entries {
        acc.add(entry);
    }
    acc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::history::AudioStatus;

    fn entry(timestamp: i64, text: &str, post: Option<&str>, duration_ms: i64) -> HistoryEntry {
        HistoryEntry {
            id: 0,
            file_name: None,
            timestamp,
            saved: false,
            title: String::new(),
            transcription_text: text.to_string(),
            post_processed_text: post.map(str::to_string),
            post_process_prompt: None,
            duration_ms,
            audio_status: AudioStatus::None,
        }
    }

    #[test]
    fn words_follow_unicode_segmentation() {
        assert_eq!(count_words("hello, world! it's fine"), 4);
        assert_eq!(count_words(""), 0);
    }

    #[test]
    fn compute_prefers_post_processed_text_and_dedupes_days() {
        let entries = vec![
            entry(1_700_000_000, "one two three", Some("one two"), 1_000),
            entry(1_700_000_100, "four", None, 500),
            entry(1_600_000_000, "five six", None, 250),
        ];
        let stats = compute(&entries);
        assert_eq!(stats.total_words, 5);
        assert_eq!(stats.total_duration_ms, 1_750);
        assert_eq!(stats.total_transcriptions, 3);
        assert_eq!(stats.first_transcription_date, Some(1_600_000_000));
        assert_eq!(stats.last_transcription_date, Some(1_700_000_100));
        assert_eq!(stats.transcription_dates, vec!["2020-09-13", "2023-11-14"]);
    }

    #[test]
    fn empty_history_has_empty_stats() {
        assert_eq!(compute(&Vec::new()), UserStats::default());
    }
}
