use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::error::codes;
use crate::{AppError, AppResult};

// Append-only. A fresh store is always built by replaying this list; an
// existing store only ever runs the suffix it has not seen.
static MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_transcription_history",
        "CREATE TABLE transcription_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_name TEXT,
            timestamp INTEGER NOT NULL,
            saved BOOLEAN NOT NULL DEFAULT 0,
            title TEXT NOT NULL,
            transcription_text TEXT NOT NULL
        );",
    ),
    (
        "0002_post_processing",
        "ALTER TABLE transcription_history ADD COLUMN post_processed_text TEXT;
         ALTER TABLE transcription_history ADD COLUMN post_process_prompt TEXT;",
    ),
    (
        "0003_user_stats",
        "CREATE TABLE user_stats (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            total_words INTEGER NOT NULL DEFAULT 0,
            total_duration_ms INTEGER NOT NULL DEFAULT 0,
            total_transcriptions INTEGER NOT NULL DEFAULT 0,
            first_transcription_date INTEGER,
            last_transcription_date INTEGER,
            transcription_dates TEXT NOT NULL DEFAULT '[]'
        );
        INSERT INTO user_stats (id) VALUES (1);",
    ),
    (
        "0004_duration_ms",
        "ALTER TABLE transcription_history ADD COLUMN duration_ms INTEGER NOT NULL DEFAULT 0;",
    ),
    (
        "0005_audio_status",
        "ALTER TABLE transcription_history ADD COLUMN audio_status TEXT NOT NULL DEFAULT 'none';
         CREATE INDEX idx_history_timestamp ON transcription_history(timestamp, id);",
    ),
];

fn checksum(sql: &str) -> String {
    format!("{:x}", Sha256::digest(sql.as_bytes()))
}

/// Applies pending migrations and returns how many ran.
pub fn apply_migrations(conn: &mut Connection) -> AppResult<usize> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
           version    TEXT PRIMARY KEY,
           applied_at INTEGER NOT NULL,
           checksum   TEXT NOT NULL
         );",
    )
    .map_err(|err| AppError::from(err).with_context("operation", "create_schema_migrations"))?;

    let mut applied = 0;
    for (version, sql) in MIGRATIONS {
        let expected = checksum(sql);
        let recorded: Option<String> = conn
            .query_row(
                "SELECT checksum FROM schema_migrations WHERE version = ?1",
                params![version],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| AppError::from(err).with_context("operation", "read_schema_migrations"))?;

        match recorded {
            Some(found) if found == expected => continue,
            Some(_) => {
                return Err(AppError::new(
                    codes::STORE_MIGRATION_DRIFT,
                    "An applied migration no longer matches the shipped schema.",
                )
                .with_context("version", *version));
            }
            None => {}
        }

        let tx = conn
            .transaction()
            .map_err(|err| AppError::from(err).with_context("operation", "begin_migration"))?;
        tx.execute_batch(sql).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "apply_migration")
                .with_context("version", *version)
        })?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at, checksum) VALUES (?1, ?2, ?3)",
            params![version, chrono::Utc::now().timestamp_millis(), expected],
        )
        .map_err(|err| AppError::from(err).with_context("operation", "record_migration"))?;
        tx.commit()
            .map_err(|err| AppError::from(err).with_context("operation", "commit_migration"))?;

        tracing::debug!(target: "codictate_backup", event = "migration_applied", version = *version);
        applied += 1;
    }
    Ok(applied)
}

pub fn latest_version() -> &'static str {
    MIGRATIONS.last().map(|(version, _)| *version).unwrap_or("")
}
