use std::path::Path;

use rusqlite::{params, Connection, DatabaseName, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::migrate;
use super::stats::{self, UserStats};
use crate::error::codes;
use crate::security::hash_path;
use crate::state::WriteGate;
use crate::{AppError, AppResult};

/// Whether a record's audio file can be played back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioStatus {
    /// Record never had audio.
    None,
    Available,
    /// Record referenced audio that could not be restored.
    Unavailable,
}

impl AudioStatus {
    fn as_str(self) -> &'static str {
        match self {
            AudioStatus::None => "none",
            AudioStatus::Available => "available",
            AudioStatus::Unavailable => "unavailable",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "available" => AudioStatus::Available,
            "unavailable" => AudioStatus::Unavailable,
            _ => AudioStatus::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub file_name: Option<String>,
    pub timestamp: i64,
    pub saved: bool,
    pub title: String,
    pub transcription_text: String,
    pub post_processed_text: Option<String>,
    pub post_process_prompt: Option<String>,
    pub duration_ms: i64,
    pub audio_status: AudioStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewHistoryEntry {
    pub file_name: Option<String>,
    pub timestamp: i64,
    pub saved: bool,
    pub title: String,
    pub transcription_text: String,
    pub post_processed_text: Option<String>,
    pub post_process_prompt: Option<String>,
    pub duration_ms: i64,
    pub audio_status: AudioStatus,
}

const SELECT_COLUMNS: &str = "id, file_name, timestamp, saved, title, transcription_text, \
     post_processed_text, post_process_prompt, duration_ms, audio_status";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let status: String = row.get(9)?;
    Ok(HistoryEntry {
        id: row.get(0)?,
        file_name: row.get(1)?,
        timestamp: row.get(2)?,
        saved: row.get(3)?,
        title: row.get(4)?,
        transcription_text: row.get(5)?,
        post_processed_text: row.get(6)?,
        post_process_prompt: row.get(7)?,
        duration_ms: row.get(8)?,
        audio_status: AudioStatus::parse(&status),
    })
}

/// The SQLite-backed record store.
pub struct HistoryStore {
    conn: Connection,
}

impl HistoryStore {
    /// Open (creating if needed) and bring the schema up to date.
    pub fn open(path: &Path) -> AppResult<Self> {
        let mut conn = Connection::open(path).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "open_history_db")
                .with_context("path_hash", hash_path(path))
        })?;
        migrate::apply_migrations(&mut conn)?;
        Ok(Self { conn })
    }

    /// A new, empty store initialised purely from migrations. Refuses to
    /// reuse an existing file.
    pub fn create_fresh(path: &Path) -> AppResult<Self> {
        if path.exists() {
            return Err(AppError::new(
                codes::STORE_EXISTS,
                "Refusing to initialise a store over an existing file.",
            )
            .with_context("path_hash", hash_path(path)));
        }
        Self::open(path)
    }

    pub fn open_read_only(path: &Path) -> AppResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "open_history_db_read_only")
                .with_context("path_hash", hash_path(path))
        })?;
        Ok(Self { conn })
    }

    /// Application write path: rejected while a restore holds quiesce mode.
    pub fn insert(&mut self, gate: &WriteGate, entry: &NewHistoryEntry) -> AppResult<i64> {
        let _hold = gate.begin_write()?;
        let tx = self
            .conn
            .transaction()
            .map_err(|err| AppError::from(err).with_context("operation", "begin_insert"))?;
        let id = insert_row(&tx, entry)?;
        let mut current = read_stats_from(&tx)?;
        let stored = HistoryEntry {
            id,
            file_name: entry.file_name.clone(),
            timestamp: entry.timestamp,
            saved: entry.saved,
            title: entry.title.clone(),
            transcription_text: entry.transcription_text.clone(),
            post_processed_text: entry.post_processed_text.clone(),
            post_process_prompt: entry.post_process_prompt.clone(),
            duration_ms: entry.duration_ms,
            audio_status: entry.audio_status,
        };
        fold_into(&mut current, &stored);
        write_stats_to(&tx, &current)?;
        tx.commit()
            .map_err(|err| AppError::from(err).with_context("operation", "commit_insert"))?;
        Ok(id)
    }

    /// Bulk load used while building a staging dataset. The staging store
    /// is private to the restore, so no gate applies.
    pub(crate) fn import_batch(&mut self, entries: &[NewHistoryEntry]) -> AppResult<()> {
        let tx = self
            .conn
            .transaction()
            .map_err(|err| AppError::from(err).with_context("operation", "begin_import"))?;
        for entry in entries {
            insert_row(&tx, entry)?;
        }
        tx.commit()
            .map_err(|err| AppError::from(err).with_context("operation", "commit_import"))
    }

    pub fn count(&self) -> AppResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM transcription_history", [], |row| {
                row.get(0)
            })
            .map_err(|err| AppError::from(err).with_context("operation", "count_history"))?;
        Ok(count.max(0) as u64)
    }

    /// Visit records in stable order (timestamp, then id) without loading
    /// the whole table.
    pub fn for_each_entry<F>(&self, mut visit: F) -> AppResult<()>
    where
        F: FnMut(HistoryEntry) -> AppResult<()>,
    {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM transcription_history ORDER BY timestamp ASC, id ASC"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|err| AppError::from(err).with_context("operation", "prepare_list_history"))?;
        let rows = stmt
            .query_map([], entry_from_row)
            .map_err(|err| AppError::from(err).with_context("operation", "list_history"))?;
        for row in rows {
            let entry =
                row.map_err(|err| AppError::from(err).with_context("operation", "read_history"))?;
            visit(entry)?;
        }
        Ok(())
    }

    pub fn list(&self) -> AppResult<Vec<HistoryEntry>> {
        let mut out = Vec::new();
        self.for_each_entry(|entry| {
            out.push(entry);
            Ok(())
        })?;
        Ok(out)
    }

    pub fn set_audio_status(&self, id: i64, status: AudioStatus) -> AppResult<()> {
        self.conn
            .execute(
                "UPDATE transcription_history SET audio_status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .map_err(|err| AppError::from(err).with_context("operation", "set_audio_status"))?;
        Ok(())
    }

    pub fn read_stats(&self) -> AppResult<UserStats> {
        read_stats_from(&self.conn)
    }

    pub fn write_stats(&self, stats: &UserStats) -> AppResult<()> {
        write_stats_to(&self.conn, stats)
    }

    /// Rebuild the aggregate row from the records themselves.
    pub fn recompute_stats(&self) -> AppResult<UserStats> {
        let mut acc = stats::StatsAccumulator::default();
        self.for_each_entry(|entry| {
            acc.add(&entry);
            Ok(())
        })?;
        let computed = acc.finish();
        self.write_stats(&computed)?;
        Ok(computed)
    }

    /// `PRAGMA integrity_check` plus a foreign-key sweep.
    pub fn integrity_check(&self) -> AppResult<()> {
        let result: String = self
            .conn
            .query_row("PRAGMA integrity_check", [], |row| row.get(0))
            .map_err(|err| AppError::from(err).with_context("operation", "integrity_check"))?;
        if result != "ok" {
            return Err(AppError::new(
                codes::IMPORT_INTEGRITY_FAILED,
                "The rebuilt history store failed its integrity check.",
            )
            .with_context("detail", result));
        }
        let fk_issue: Option<String> = self
            .conn
            .query_row("PRAGMA foreign_key_check", [], |row| row.get(0))
            .optional()
            .map_err(|err| AppError::from(err).with_context("operation", "foreign_key_check"))?;
        if let Some(table) = fk_issue {
            return Err(AppError::new(
                codes::IMPORT_INTEGRITY_FAILED,
                "The rebuilt history store has dangling references.",
            )
            .with_context("table", table));
        }
        Ok(())
    }

    /// Consistent copy of the database through SQLite's online backup.
    pub fn snapshot_to(&self, dest: &Path) -> AppResult<()> {
        self.conn
            .backup(DatabaseName::Main, dest, None)
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "history_snapshot")
                    .with_context("path_hash", hash_path(dest))
            })
    }

    pub fn close(self) -> AppResult<()> {
        self.conn
            .close()
            .map_err(|(_, err)| AppError::from(err).with_context("operation", "close_history_db"))
    }
}

fn insert_row(conn: &Connection, entry: &NewHistoryEntry) -> AppResult<i64> {
    conn.execute(
        "INSERT INTO transcription_history (file_name, timestamp, saved, title, transcription_text, \
         post_processed_text, post_process_prompt, duration_ms, audio_status) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            entry.file_name,
            entry.timestamp,
            entry.saved,
            entry.title,
            entry.transcription_text,
            entry.post_processed_text,
            entry.post_process_prompt,
            entry.duration_ms,
            entry.audio_status.as_str(),
        ],
    )
    .map_err(|err| AppError::from(err).with_context("operation", "insert_history"))?;
    Ok(conn.last_insert_rowid())
}

fn read_stats_from(conn: &Connection) -> AppResult<UserStats> {
    let row = conn
        .query_row(
            "SELECT total_words, total_duration_ms, total_transcriptions, first_transcription_date, \
             last_transcription_date, transcription_dates FROM user_stats WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()
        .map_err(|err| AppError::from(err).with_context("operation", "read_stats"))?;

    let Some((words, duration, count, first, last, dates)) = row else {
        return Ok(UserStats::default());
    };
    let transcription_dates: Vec<String> = serde_json::from_str(&dates)
        .map_err(|err| AppError::from(err).with_context("operation", "decode_stats_dates"))?;
    Ok(UserStats {
        total_words: words,
        total_duration_ms: duration,
        total_transcriptions: count,
        first_transcription_date: first,
        last_transcription_date: last,
        transcription_dates,
    })
}

fn write_stats_to(conn: &Connection, stats: &UserStats) -> AppResult<()> {
    let dates = serde_json::to_string(&stats.transcription_dates)
        .map_err(|err| AppError::from(err).with_context("operation", "encode_stats_dates"))?;
    conn.execute(
        "INSERT INTO user_stats (id, total_words, total_duration_ms, total_transcriptions, \
         first_transcription_date, last_transcription_date, transcription_dates) \
         VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT(id) DO UPDATE SET total_words = excluded.total_words, \
         total_duration_ms = excluded.total_duration_ms, \
         total_transcriptions = excluded.total_transcriptions, \
         first_transcription_date = excluded.first_transcription_date, \
         last_transcription_date = excluded.last_transcription_date, \
         transcription_dates = excluded.transcription_dates",
        params![
            stats.total_words,
            stats.total_duration_ms,
            stats.total_transcriptions,
            stats.first_transcription_date,
            stats.last_transcription_date,
            dates,
        ],
    )
    .map_err(|err| AppError::from(err).with_context("operation", "write_stats"))?;
    Ok(())
}

// Incremental update matching what a full recompute would produce.
fn fold_into(current: &mut UserStats, entry: &HistoryEntry) {
    current.total_words += stats::entry_words(entry);
    current.total_duration_ms += entry.duration_ms.max(0);
    current.total_transcriptions += 1;
    current.first_transcription_date = Some(
        current
            .first_transcription_date
            .map_or(entry.timestamp, |first| first.min(entry.timestamp)),
    );
    current.last_transcription_date = Some(
        current
            .last_transcription_date
            .map_or(entry.timestamp, |last| last.max(entry.timestamp)),
    );
    if let Some(day) = stats::utc_day(entry.timestamp) {
        if let Err(pos) = current.transcription_dates.binary_search(&day) {
            current.transcription_dates.insert(pos, day);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(timestamp: i64, text: &str) -> NewHistoryEntry {
        NewHistoryEntry {
            file_name: Some(format!("codictate-{timestamp}.wav")),
            timestamp,
            saved: false,
            title: format!("Recording {timestamp}"),
            transcription_text: text.to_string(),
            post_processed_text: None,
            post_process_prompt: None,
            duration_ms: 1_200,
            audio_status: AudioStatus::Available,
        }
    }

    #[test]
    fn insert_keeps_stats_equal_to_recompute() {
        let dir = tempdir().expect("tempdir");
        let mut store = HistoryStore::open(&dir.path().join("history.db")).expect("open store");
        let gate = WriteGate::default();
        store.insert(&gate, &sample(1_700_000_000, "hello there")).expect("insert");
        store.insert(&gate, &sample(1_600_000_000, "older entry here")).expect("insert");

        let incremental = store.read_stats().expect("stats");
        let recomputed = store.recompute_stats().expect("recompute");
        assert_eq!(incremental, recomputed);
        assert_eq!(recomputed.total_words, 5);
        assert_eq!(recomputed.total_transcriptions, 2);
    }

    #[test]
    fn list_is_ordered_by_timestamp() {
        let dir = tempdir().expect("tempdir");
        let mut store = HistoryStore::open(&dir.path().join("history.db")).expect("open store");
        let gate = WriteGate::default();
        store.insert(&gate, &sample(30, "c")).expect("insert");
        store.insert(&gate, &sample(10, "a")).expect("insert");
        store.insert(&gate, &sample(20, "b")).expect("insert");
        let texts: Vec<_> = store
            .list()
            .expect("list")
            .into_iter()
            .map(|e| e.transcription_text)
            .collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[test]
    fn quiesced_gate_rejects_insert() {
        let dir = tempdir().expect("tempdir");
        let mut store = HistoryStore::open(&dir.path().join("history.db")).expect("open store");
        let gate = WriteGate::default();
        let _quiesce = gate.quiesce();
        let err = store.insert(&gate, &sample(1, "x")).expect_err("rejected");
        assert_eq!(err.code(), codes::STORE_RESTORE_IN_PROGRESS);
        assert_eq!(store.count().expect("count"), 0);
    }

    #[test]
    fn create_fresh_refuses_existing_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("history.db");
        HistoryStore::open(&path).expect("open").close().expect("close");
        let err = HistoryStore::create_fresh(&path).err().expect("refused");
        assert_eq!(err.code(), codes::STORE_EXISTS);
    }

    #[test]
    fn snapshot_copies_rows() {
        let dir = tempdir().expect("tempdir");
        let mut store = HistoryStore::open(&dir.path().join("history.db")).expect("open store");
        store
            .insert(&WriteGate::default(), &sample(5, "copied"))
            .expect("insert");
        let copy = dir.path().join("copy.db");
        store.snapshot_to(&copy).expect("snapshot");
        let reopened = HistoryStore::open(&copy).expect("open copy");
        assert_eq!(reopened.count().expect("count"), 1);
        reopened.integrity_check().expect("integrity ok");
    }
}
