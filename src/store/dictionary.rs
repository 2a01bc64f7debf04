use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::fs_ops::write_atomic;
use crate::security::hash_path;
use crate::state::WriteGate;
use crate::{AppError, AppResult};

pub const DICTIONARY_VERSION: u32 = 2;

/// One vocabulary entry. `is_replacement` entries rewrite `input` (and its
/// aliases) to `replacement`; the others only bias recognition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomWordEntry {
    pub input: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub replacement: String,
    #[serde(default)]
    pub is_replacement: bool,
}

impl CustomWordEntry {
    pub fn word(input: impl Into<String>) -> Self {
        let input = input.into();
        Self {
            replacement: input.clone(),
            input,
            aliases: Vec::new(),
            is_replacement: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryFile {
    pub version: u32,
    pub entries: Vec<CustomWordEntry>,
}

/// Missing file means an empty dictionary.
pub fn load(path: &Path) -> AppResult<Vec<CustomWordEntry>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(AppError::from(err)
                .with_context("operation", "read_dictionary")
                .with_context("path_hash", hash_path(path)))
        }
    };
    let file: DictionaryFile = serde_json::from_slice(&bytes)
        .map_err(|err| AppError::from(err).with_context("operation", "parse_dictionary"))?;
    Ok(file.entries)
}

pub fn save(gate: &WriteGate, path: &Path, entries: &[CustomWordEntry]) -> AppResult<()> {
    let _hold = gate.begin_write()?;
    write(path, entries)
}

pub(crate) fn write(path: &Path, entries: &[CustomWordEntry]) -> AppResult<()> {
    let file = DictionaryFile {
        version: DICTIONARY_VERSION,
        entries: entries.to_vec(),
    };
    let payload = serde_json::to_vec_pretty(&file)
        .map_err(|err| AppError::from(err).with_context("operation", "serialize_dictionary"))?;
    write_atomic(path, &payload).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "write_dictionary")
            .with_context("path_hash", hash_path(path))
    })
}

/// The dictionary is an ordered set keyed by `input`.
pub fn first_duplicate(entries: &[CustomWordEntry]) -> Option<usize> {
    let mut seen = HashSet::new();
    entries
        .iter()
        .position(|entry| !seen.insert(entry.input.as_str()))
}
