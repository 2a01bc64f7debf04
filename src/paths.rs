use std::path::{Path, PathBuf};

pub const DATASET_DIR: &str = "dataset";
pub const RESTORE_DIR: &str = ".restore";
pub const MARKER_FILE: &str = "restore-marker.json";
pub const STAGING_PREFIX: &str = "staging-";
pub const ROLLBACK_PREFIX: &str = "rollback-";
pub const ROLLBACK_META_FILE: &str = "rollback.json";

pub const HISTORY_DB_FILE: &str = "history.db";
pub const RECORDINGS_DIR: &str = "recordings";
pub const DICTIONARY_FILE: &str = "dictionary.json";
pub const SETTINGS_FILE: &str = "settings.json";

/// Where everything lives under the application data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn active(&self) -> PathBuf {
        self.root.join(DATASET_DIR)
    }

    pub fn restore_root(&self) -> PathBuf {
        self.root.join(RESTORE_DIR)
    }

    pub fn marker(&self) -> PathBuf {
        self.restore_root().join(MARKER_FILE)
    }

    pub fn staging(&self, restore_id: &str) -> PathBuf {
        self.restore_root()
            .join(format!("{STAGING_PREFIX}{restore_id}"))
    }

    pub fn rollback(&self, restore_id: &str) -> PathBuf {
        self.restore_root()
            .join(format!("{ROLLBACK_PREFIX}{restore_id}"))
    }

    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }
}

/// Files of one dataset root (active, staged or snapshot).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetPaths {
    root: PathBuf,
}

impl DatasetPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn history_db(&self) -> PathBuf {
        self.root.join(HISTORY_DB_FILE)
    }

    pub fn recordings(&self) -> PathBuf {
        self.root.join(RECORDINGS_DIR)
    }

    pub fn recording(&self, file_name: &str) -> PathBuf {
        self.recordings().join(file_name)
    }

    pub fn dictionary(&self) -> PathBuf {
        self.root.join(DICTIONARY_FILE)
    }

    pub fn settings(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }
}

/// Staging workspace: the extracted archive and the dataset being built.
#[derive(Debug, Clone)]
pub struct StagingPaths {
    root: PathBuf,
}

impl StagingPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extract(&self) -> PathBuf {
        self.root.join("extract")
    }

    pub fn dataset(&self) -> DatasetPaths {
        DatasetPaths::new(self.root.join(DATASET_DIR))
    }
}

/// Rollback location: the verified copy and the displaced original.
#[derive(Debug, Clone)]
pub struct RollbackPaths {
    root: PathBuf,
}

impl RollbackPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot(&self) -> PathBuf {
        self.root.join("snapshot")
    }

    pub fn displaced(&self) -> PathBuf {
        self.root.join("displaced")
    }

    pub fn meta(&self) -> PathBuf {
        self.root.join(ROLLBACK_META_FILE)
    }
}
