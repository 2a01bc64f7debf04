//! The live data the engine backs up: the SQLite record store, the
//! dictionary file and the settings file.

pub mod dictionary;
pub mod history;
pub mod migrate;
pub mod settings;
pub mod stats;

pub use dictionary::CustomWordEntry;
pub use history::{AudioStatus, HistoryEntry, HistoryStore, NewHistoryEntry};
pub use settings::AppSettings;
pub use stats::UserStats;
