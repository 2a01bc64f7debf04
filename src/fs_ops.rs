use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use fs2::available_space;
use sha2::{Digest, Sha256};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::codes;
use crate::security::{filenames, hash_path};
use crate::{AppError, AppResult};

const REQUIRED_FREE_HEADROOM: f64 = 1.1;
const MIN_REQUIRED_FREE_BYTES: u64 = 8 * 1024 * 1024;

/// Write `bytes` to `path` so readers observe either the old or the new
/// content, never a prefix.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        file_name.to_string_lossy(),
        Uuid::new_v4().simple()
    ));

    let result = (|| -> io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)?;
        sync_dir(parent)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(unix)]
pub fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

// Directory handles cannot be fsynced through std on Windows; renames are
// flushed by the filesystem journal there.
#[cfg(not(unix))]
pub fn sync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

pub fn sync_file(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

/// Stream a file through SHA-256 and return the lowercase hex digest.
pub fn file_sha256(path: &Path) -> anyhow::Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("open {} for hashing", hash_path(path)))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Recursively copy `src` into `dst` (which must not exist), syncing every
/// file. Symlinks are refused. Returns the number of bytes copied.
pub fn copy_tree(src: &Path, dst: &Path) -> AppResult<u64> {
    let mut copied = 0u64;
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry.map_err(|err| {
            AppError::from(io::Error::from(err))
                .with_context("operation", "copy_tree_walk")
                .with_context("path_hash", hash_path(src))
        })?;
        let relative = entry.path().strip_prefix(src).map_err(|_| {
            AppError::new(codes::FS_COPY_TREE, "Walked outside of the source tree")
                .with_context("path_hash", hash_path(entry.path()))
        })?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            return Err(AppError::new(
                codes::FS_SYMLINK,
                "Symbolic links are not allowed inside the dataset.",
            )
            .with_context("path_hash", hash_path(entry.path())));
        }
        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "copy_tree_mkdir")
                    .with_context("path_hash", hash_path(&target))
            })?;
            continue;
        }

        copied += fs::copy(entry.path(), &target).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "copy_tree_file")
                .with_context("path_hash", hash_path(entry.path()))
        })?;
        sync_file(&target).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "copy_tree_sync")
                .with_context("path_hash", hash_path(&target))
        })?;
    }
    if dst.exists() {
        sync_dir(dst).ok();
    }
    Ok(copied)
}

/// Content digest of a directory tree: every relative path (directories
/// included) with the hash of its bytes. Two trees with equal digests are
/// byte-for-byte identical.
pub fn tree_digest(root: &Path) -> AppResult<String> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|err| {
            AppError::from(io::Error::from(err))
                .with_context("operation", "tree_digest_walk")
                .with_context("path_hash", hash_path(root))
        })?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();
        let name = filenames::portable_archive_path(&relative)
            .unwrap_or_else(|| relative.to_string_lossy().into_owned());

        if entry.file_type().is_dir() {
            hasher.update(format!("d {name}\n").as_bytes());
        } else {
            let digest = file_sha256(entry.path()).map_err(|err| {
                AppError::from(err).with_context("operation", "tree_digest_hash")
            })?;
            hasher.update(format!("f {name} {digest}\n").as_bytes());
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn dir_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

pub fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

pub fn required_free_bytes(payload_bytes: u64) -> u64 {
    let padded = (payload_bytes as f64 * REQUIRED_FREE_HEADROOM).ceil() as u64;
    padded.max(MIN_REQUIRED_FREE_BYTES)
}

pub fn free_disk_space(path: &Path, override_bytes: Option<u64>) -> AppResult<u64> {
    if let Some(value) = override_bytes {
        return Ok(value);
    }

    let target = existing_ancestor(path);
    available_space(&target).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "available_space")
            .with_context("path_hash", hash_path(&target))
    })
}

/// Fails with `DISK/LOW_SPACE` unless `path`'s volume can hold
/// `payload_bytes` plus headroom.
pub fn ensure_free_space(
    path: &Path,
    payload_bytes: u64,
    override_bytes: Option<u64>,
    stage: &str,
) -> AppResult<()> {
    let required = required_free_bytes(payload_bytes);
    let available = free_disk_space(path, override_bytes)?;
    if available < required {
        return Err(AppError::new(
            codes::DISK_LOW_SPACE,
            format!("Not enough disk space (need ~{}).", format_bytes(required)),
        )
        .with_context("stage", stage)
        .with_context("available_bytes", available.to_string())
        .with_context("required_bytes", required.to_string()));
    }
    Ok(())
}

/// True when both paths live on the same filesystem volume, which is the
/// precondition for `rename` being atomic between them.
pub fn same_volume(a: &Path, b: &Path) -> io::Result<bool> {
    let a = existing_ancestor(a);
    let b = existing_ancestor(b);
    same_volume_impl(&a, &b)
}

#[cfg(unix)]
fn same_volume_impl(a: &Path, b: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    Ok(fs::metadata(a)?.dev() == fs::metadata(b)?.dev())
}

#[cfg(not(unix))]
fn same_volume_impl(a: &Path, b: &Path) -> io::Result<bool> {
    use std::path::Component;
    let a = fs::canonicalize(a)?;
    let b = fs::canonicalize(b)?;
    let prefix = |p: &Path| match p.components().next() {
        Some(Component::Prefix(prefix)) => Some(prefix.as_os_str().to_ascii_lowercase()),
        _ => None,
    };
    Ok(prefix(&a) == prefix(&b))
}

fn existing_ancestor(path: &Path) -> PathBuf {
    let mut current = Some(path);
    while let Some(candidate) = current {
        if candidate.exists() {
            return candidate.to_path_buf();
        }
        current = candidate.parent();
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
