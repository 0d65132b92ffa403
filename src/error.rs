//! Error types for plugtag.
//!
//! Fatal errors (configuration, snapshot, restore) abort an operation before
//! it touches the metadata store. [`RecordError`] is per-plugin: the apply
//! pass records it in the report and moves on.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Invalid rule set, settings, or store location. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Rule set {path:?} is not valid JSON for the schema: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Config file {path:?} is not valid: {source}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("{field}: {message}")]
    Invalid { field: String, message: String },

    #[error("{field}: invalid pattern {pattern:?}: {source}")]
    Pattern {
        field: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Metadata store not found: {0:?}")]
    MissingStore(PathBuf),

    #[error("Category {category:?} would be removed but is still used by {records} record(s)")]
    DanglingCategory { category: String, records: usize },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// A single record could not be read or written. Recoverable.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("IO error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Unreadable property list {path:?}: {source}")]
    Plist {
        path: PathBuf,
        #[source]
        source: plist::Error,
    },

    #[error("Malformed record {path:?}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("Component {component} already handled for {first:?}")]
    Collision { component: String, first: String },
}

/// Snapshot could not be created or read. Fatal to an apply run.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot IO error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write snapshot manifest {path:?}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Backup root {root:?} and store {store:?} must not contain each other")]
    Nested { root: PathBuf, store: PathBuf },
}

/// Restore failed. The live store is left in its pre-restore state.
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("Snapshot not found: {0}")]
    NotFound(String),

    #[error("No snapshots found in {0:?}")]
    NoSnapshots(PathBuf),

    #[error("Restore IO error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Snapshot {snapshot} failed verification: {detail}")]
    Corrupt { snapshot: String, detail: String },

    #[error("Snapshot or backup root {snapshot:?} and store {store:?} must not contain each other")]
    Nested { snapshot: PathBuf, store: PathBuf },

    #[error("Failed to list snapshots: {0}")]
    Listing(#[from] SnapshotError),

    #[error("Failed to swap {staging:?} into {store:?}: {source}")]
    Swap {
        staging: PathBuf,
        store: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Umbrella error for the top-level operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Restore(#[from] RestoreError),

    #[error(transparent)]
    Record(#[from] RecordError),
}
