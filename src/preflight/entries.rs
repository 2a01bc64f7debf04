use std::collections::BTreeMap;
use std::io::{Read, Seek};

use zip::ZipArchive;

use crate::config::ResourceLimits;
use crate::error::codes;
use crate::ops::report::Finding;
use crate::security::filenames::check_entry_path;

const S_IFMT: u32 = 0o170_000;
const S_IFLNK: u32 = 0o120_000;

/// Central-directory facts about one entry. Nothing here required
/// decompressing content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    pub index: usize,
    pub size: u64,
    pub compressed_size: u64,
    pub is_dir: bool,
}

#[derive(Debug, Default)]
pub struct EntryTable {
    pub entries: BTreeMap<String, EntryMeta>,
    pub total_uncompressed: u64,
}

impl EntryTable {
    pub fn file(&self, name: &str) -> Option<&EntryMeta> {
        self.entries.get(name).filter(|meta| !meta.is_dir)
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &EntryMeta)> {
        self.entries
            .iter()
            .filter(|(_, meta)| !meta.is_dir)
            .map(|(name, meta)| (name.as_str(), meta))
    }
}

/// Entry safety and resource bounds, from metadata alone. Every problem is
/// blocking.
pub fn scan<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    limits: &ResourceLimits,
    findings: &mut Vec<Finding>,
) -> EntryTable {
    let mut table = EntryTable::default();
    if archive.len() > limits.max_entries {
        findings.push(Finding::blocking(
            codes::PREFLIGHT_LIMIT_EXCEEDED,
            format!(
                "The backup has {} entries; at most {} are allowed.",
                archive.len(),
                limits.max_entries
            ),
        ));
        return table;
    }

    for index in 0..archive.len() {
        let file = match archive.by_index_raw(index) {
            Ok(file) => file,
            Err(err) => {
                findings.push(Finding::blocking(
                    codes::PREFLIGHT_ARCHIVE_UNREADABLE,
                    format!("Entry {index} could not be read: {err}"),
                ));
                continue;
            }
        };
        let name = file.name().to_string();

        if let Err(reason) = check_entry_path(&name) {
            findings.push(
                Finding::blocking(codes::PREFLIGHT_UNSAFE_ENTRY, format!("Unsafe entry: {reason}."))
                    .with_path(name),
            );
            continue;
        }
        if file
            .unix_mode()
            .is_some_and(|mode| mode & S_IFMT == S_IFLNK)
        {
            findings.push(
                Finding::blocking(codes::PREFLIGHT_UNSAFE_ENTRY, "Links are not allowed in a backup.")
                    .with_path(name),
            );
            continue;
        }

        let size = file.size();
        let compressed_size = file.compressed_size();
        if size > limits.max_entry_bytes {
            findings.push(
                Finding::blocking(
                    codes::PREFLIGHT_LIMIT_EXCEEDED,
                    format!("Entry is larger than {} bytes.", limits.max_entry_bytes),
                )
                .with_path(name.clone()),
            );
        }
        if size >= limits.ratio_floor_bytes
            && (compressed_size == 0 || size / compressed_size > limits.max_compression_ratio)
        {
            findings.push(
                Finding::blocking(
                    codes::PREFLIGHT_LIMIT_EXCEEDED,
                    "Entry expands far more than real data does.",
                )
                .with_path(name.clone()),
            );
        }
        table.total_uncompressed = table.total_uncompressed.saturating_add(size);

        let meta = EntryMeta {
            index,
            size,
            compressed_size,
            is_dir: file.is_dir(),
        };
        // Names are compared after dropping a directory entry's trailing '/'.
        let key = name.strip_suffix('/').unwrap_or(&name).to_string();
        if table.entries.insert(key, meta).is_some() {
            findings.push(
                Finding::blocking(codes::PREFLIGHT_UNSAFE_ENTRY, "Entry name appears more than once.")
                    .with_path(name),
            );
        }
    }

    if table.total_uncompressed > limits.max_total_bytes {
        findings.push(Finding::blocking(
            codes::PREFLIGHT_LIMIT_EXCEEDED,
            format!(
                "The backup expands to more than {} bytes.",
                limits.max_total_bytes
            ),
        ));
    }
    table
}
