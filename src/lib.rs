//! plugtag Core Library
//!
//! Rule-driven categorization of Logic Pro Audio Unit plugins. Categories
//! are written into the host's plugin-manager metadata store (the `Tags`
//! directory) with a snapshot taken before every modifying run.
//!
//! The host application must not be running while the store is modified.
//!
//! # Core Features
//!
//! ## Discovery (`registry` module)
//! - `scan_components()` - Read identities from `*.component` bundles
//! - `load_catalog()` - Read identities from a JSON catalog
//!
//! ## Rules (`rules`, `classify` modules)
//! - `RuleSet::load()` - Load and validate a rule set
//! - `classify()` - Resolve one plugin through exclusions, overrides,
//!   vendor rules, global rules and the fallback category
//!
//! ## Metadata Store (`tagstore` module)
//! - `TagStore::locate()` / `read()` / `write()` - Per-plugin records
//! - `TagStore::update_categories()` - Host category vocabulary
//! - `TagStore::inventory()` - Categories and tags currently in use
//!
//! ## Snapshots (`backup` module)
//! - `BackupManager::snapshot()` - Full copy of the store with a manifest
//! - `BackupManager::restore()` / `restore_latest()` - Wholesale restore
//!
//! ## Runs (`apply`, `diagnose`, `report` modules)
//! - `apply()` - Dry-run or apply the rules, producing an `ApplyReport`
//! - `diagnose()` - Explain plugins that fell through to the fallback

pub mod apply;
pub mod backup;
pub mod classify;
pub mod config;
pub mod diagnose;
pub mod error;
pub mod plugin;
pub mod registry;
pub mod report;
pub mod rules;
pub mod tagstore;

pub use apply::{apply, ApplyOptions};
pub use backup::{BackupManager, Snapshot};
pub use classify::{classify, Classification, Decision, Tier};
pub use diagnose::{diagnose, DiagnoseFilter, Diagnosis, DiagnosticsReport};
pub use error::{ConfigError, Error, RecordError, RestoreError, Result, SnapshotError};
pub use plugin::{ComponentId, PluginIdentity};
pub use report::{ApplyReport, Outcome, PluginReport, Summary};
pub use rules::RuleSet;
pub use tagstore::{TagMode, TagStore};
