//! Tag store adapter for the host application's Tags directory.
//!
//! # Layout
//!
//! - `<tagset>.tagset` - one property list per component. The root is a
//!   dictionary; its `tags` key is a dictionary `{category: "user"}`. Every
//!   other key belongs to the host and is carried through untouched.
//! - `MusicApps.properties` - the `sorting` array is the host's category order.
//! - `MusicApps.tagpool` - `{category: count}`, plus a host-owned `""` key.
//!
//! Records are parsed into a generic [`plist::Dictionary`], only the `tags`
//! key is replaced, and the whole tree is written back in the format it was
//! read in. A write that would not change the tag set is skipped, so the file
//! stays byte-identical.

use crate::error::{ConfigError, RecordError};
use crate::plugin::ComponentId;
use plist::{Dictionary, Value};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const PROPERTIES_FILE: &str = "MusicApps.properties";
pub const TAGPOOL_FILE: &str = "MusicApps.tagpool";
pub const TAGSET_EXTENSION: &str = "tagset";

const TAGS_KEY: &str = "tags";
const SORTING_KEY: &str = "sorting";
const USER_TAG: &str = "user";
const BINARY_MAGIC: &[u8] = b"bplist00";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TagMode {
    /// Tag set becomes exactly the resolved category.
    Replace,
    /// Resolved category is added to the existing tags.
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlistFormat {
    Xml,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Written,
    Unchanged,
}

/// Location of one component's record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHandle {
    path: PathBuf,
    tagset: String,
}

impl RecordHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tagset(&self) -> &str {
        &self.tagset
    }
}

/// Parsed record: the full field tree plus the tag names it holds.
#[derive(Debug, Clone)]
pub struct TagRecord {
    fields: Dictionary,
    format: PlistFormat,
    tags: Vec<String>,
}

impl TagRecord {
    fn parse(bytes: &[u8], path: &Path) -> Result<Self, RecordError> {
        let format = if bytes.starts_with(BINARY_MAGIC) {
            PlistFormat::Binary
        } else {
            PlistFormat::Xml
        };
        let value = Value::from_reader(Cursor::new(bytes)).map_err(|source| RecordError::Plist {
            path: path.to_path_buf(),
            source,
        })?;
        let fields = match value {
            Value::Dictionary(fields) => fields,
            _ => return Err(malformed(path, "root is not a dictionary")),
        };
        let tags = match fields.get(TAGS_KEY) {
            None => Vec::new(),
            Some(Value::Dictionary(tags)) => tags.keys().cloned().collect(),
            Some(_) => return Err(malformed(path, "`tags` is not a dictionary")),
        };
        Ok(Self { fields, format, tags })
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn fields(&self) -> &Dictionary {
        &self.fields
    }

    pub fn format(&self) -> PlistFormat {
        self.format
    }

    /// Tag names after assigning `category` under `mode`.
    pub fn planned_tags(&self, category: &str, mode: TagMode) -> Vec<String> {
        match mode {
            TagMode::Replace => vec![category.to_string()],
            TagMode::Merge => {
                let mut tags = self.tags.clone();
                if !tags.iter().any(|t| t == category) {
                    tags.push(category.to_string());
                }
                tags
            }
        }
    }

    /// New field tree, or `None` when the tag set would not change.
    fn with_category(&self, category: &str, mode: TagMode) -> Option<Dictionary> {
        if self.planned_tags(category, mode) == self.tags {
            return None;
        }
        let mut tags = match mode {
            TagMode::Replace => Dictionary::new(),
            TagMode::Merge => self
                .fields
                .get(TAGS_KEY)
                .and_then(Value::as_dictionary)
                .cloned()
                .unwrap_or_else(Dictionary::new),
        };
        tags.insert(category.to_string(), Value::String(USER_TAG.to_string()));

        let mut fields = self.fields.clone();
        fields.insert(TAGS_KEY.to_string(), Value::Dictionary(tags));
        Some(fields)
    }
}

/// Category lists as the host currently has them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreCategories {
    pub sorting: Vec<String>,
    /// Tagpool keys in file order, without the host's empty key.
    pub tagpool: Vec<String>,
}

impl StoreCategories {
    /// Union of both lists, `sorting` order first.
    pub fn all(&self) -> Vec<String> {
        let mut all = self.sorting.clone();
        for category in &self.tagpool {
            if !all.contains(category) {
                all.push(category.clone());
            }
        }
        all
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordTags {
    pub tagset: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreInventory {
    pub tags_dir: PathBuf,
    pub sorting: Vec<String>,
    pub tagpool: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<RecordTags>>,
}

/// Handle on a metadata store directory.
#[derive(Debug, Clone)]
pub struct TagStore {
    root: PathBuf,
}

impl TagStore {
    /// Opens an existing store. A missing directory is a configuration error.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(ConfigError::MissingStore(root));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Record location for a component, `None` if the host never scanned it.
    pub fn locate(&self, component: &ComponentId) -> Option<RecordHandle> {
        let tagset = component.tagset_name();
        let path = self.root.join(format!("{}.{}", tagset, TAGSET_EXTENSION));
        path.is_file().then_some(RecordHandle { path, tagset })
    }

    pub fn read(&self, handle: &RecordHandle) -> Result<TagRecord, RecordError> {
        let bytes = fs::read(&handle.path).map_err(|source| RecordError::Io {
            path: handle.path.clone(),
            source,
        })?;
        TagRecord::parse(&bytes, &handle.path)
    }

    /// Assigns `category` to the record. Re-reads the record so the write is
    /// based on what is on disk now.
    pub fn write(
        &self,
        handle: &RecordHandle,
        category: &str,
        mode: TagMode,
    ) -> Result<WriteOutcome, RecordError> {
        let record = self.read(handle)?;
        let Some(fields) = record.with_category(category, mode) else {
            return Ok(WriteOutcome::Unchanged);
        };
        let bytes = serialize(fields, record.format).map_err(|source| RecordError::Plist {
            path: handle.path.clone(),
            source,
        })?;
        write_atomic(&handle.path, &bytes)?;
        debug!("Wrote {} -> {:?} ({:?})", handle.tagset, category, mode);
        Ok(WriteOutcome::Written)
    }

    /// Stems of every `.tagset` file in the store.
    pub fn record_names(&self) -> Result<BTreeSet<String>, RecordError> {
        Ok(self
            .tagset_paths()?
            .into_iter()
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().to_string()))
            .collect())
    }

    /// Tags of every readable record. Unreadable records are logged and
    /// left out.
    pub fn scan_tags(&self) -> Result<Vec<RecordTags>, RecordError> {
        let mut records = Vec::new();
        for path in self.tagset_paths()? {
            let tagset = match path.file_stem() {
                Some(stem) => stem.to_string_lossy().to_string(),
                None => continue,
            };
            let handle = RecordHandle { path, tagset };
            match self.read(&handle) {
                Ok(record) => records.push(RecordTags {
                    tagset: handle.tagset,
                    tags: record.tags,
                }),
                Err(e) => warn!("Skipping unreadable record: {}", e),
            }
        }
        Ok(records)
    }

    /// Current `sorting` and tagpool categories. Missing files read as empty.
    pub fn categories(&self) -> Result<StoreCategories, RecordError> {
        let sorting = match self.read_dictionary(PROPERTIES_FILE)? {
            Some((props, _)) => match props.get(SORTING_KEY) {
                None => Vec::new(),
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(Value::as_string)
                    .map(str::to_string)
                    .collect(),
                Some(_) => {
                    return Err(malformed(&self.root.join(PROPERTIES_FILE), "`sorting` is not an array"))
                }
            },
            None => Vec::new(),
        };
        let tagpool = match self.read_dictionary(TAGPOOL_FILE)? {
            Some((pool, _)) => pool.keys().filter(|k| !k.is_empty()).cloned().collect(),
            None => Vec::new(),
        };
        Ok(StoreCategories { sorting, tagpool })
    }

    /// Rewrites the host's category vocabulary to exactly `categories`.
    /// Tagpool counts of kept categories and the host's `""` entry survive.
    /// Returns whether anything changed on disk.
    pub fn update_categories(&self, categories: &[String]) -> Result<bool, RecordError> {
        let mut changed = false;

        let (mut props, props_format) = self
            .read_dictionary(PROPERTIES_FILE)?
            .unwrap_or_else(|| (Dictionary::new(), PlistFormat::Xml));
        let sorting = Value::Array(categories.iter().cloned().map(Value::String).collect());
        if props.get(SORTING_KEY) != Some(&sorting) {
            props.insert(SORTING_KEY.to_string(), sorting);
            self.write_dictionary(PROPERTIES_FILE, props, props_format)?;
            changed = true;
        }

        let (pool, pool_format) = self
            .read_dictionary(TAGPOOL_FILE)?
            .unwrap_or_else(|| (Dictionary::new(), PlistFormat::Xml));
        let mut new_pool = Dictionary::new();
        if let Some(host_entry) = pool.get("") {
            new_pool.insert(String::new(), host_entry.clone());
        }
        for category in categories {
            let count = pool
                .get(category)
                .cloned()
                .unwrap_or_else(|| Value::Integer(0i64.into()));
            new_pool.insert(category.clone(), count);
        }
        let same_order = pool.keys().eq(new_pool.keys());
        if !same_order || pool != new_pool {
            self.write_dictionary(TAGPOOL_FILE, new_pool, pool_format)?;
            changed = true;
        }

        Ok(changed)
    }

    pub fn inventory(&self, include_records: bool) -> Result<StoreInventory, RecordError> {
        let categories = self.categories()?;
        let mut tagpool = categories.tagpool;
        tagpool.sort_by_key(|c| c.to_lowercase());
        let records = if include_records {
            let mut records = self.scan_tags()?;
            for record in &mut records {
                record.tags.sort_by_key(|t| t.to_lowercase());
            }
            Some(records)
        } else {
            None
        };
        Ok(StoreInventory {
            tags_dir: self.root.clone(),
            sorting: categories.sorting,
            tagpool,
            records,
        })
    }

    fn tagset_paths(&self) -> Result<Vec<PathBuf>, RecordError> {
        let entries = fs::read_dir(&self.root).map_err(|source| RecordError::Io {
            path: self.root.clone(),
            source,
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == TAGSET_EXTENSION))
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn read_dictionary(&self, file: &str) -> Result<Option<(Dictionary, PlistFormat)>, RecordError> {
        let path = self.root.join(file);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(|source| RecordError::Io {
            path: path.clone(),
            source,
        })?;
        let record = TagRecord::parse_plain(&bytes, &path)?;
        Ok(Some(record))
    }

    fn write_dictionary(&self, file: &str, dict: Dictionary, format: PlistFormat) -> Result<(), RecordError> {
        let path = self.root.join(file);
        let bytes = serialize(dict, format).map_err(|source| RecordError::Plist {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &bytes)
    }
}

impl TagRecord {
    /// Root dictionary of a non-tagset property list.
    fn parse_plain(bytes: &[u8], path: &Path) -> Result<(Dictionary, PlistFormat), RecordError> {
        let format = if bytes.starts_with(BINARY_MAGIC) {
            PlistFormat::Binary
        } else {
            PlistFormat::Xml
        };
        match Value::from_reader(Cursor::new(bytes)) {
            Ok(Value::Dictionary(dict)) => Ok((dict, format)),
            Ok(_) => Err(malformed(path, "root is not a dictionary")),
            Err(source) => Err(RecordError::Plist {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

fn malformed(path: &Path, reason: &str) -> RecordError {
    RecordError::Malformed {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn serialize(fields: Dictionary, format: PlistFormat) -> Result<Vec<u8>, plist::Error> {
    let value = Value::Dictionary(fields);
    let mut buf = Vec::new();
    match format {
        PlistFormat::Xml => value.to_writer_xml(&mut buf)?,
        PlistFormat::Binary => value.to_writer_binary(&mut buf)?,
    }
    Ok(buf)
}

/// Write through a temp file in the same directory, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RecordError> {
    let io_err = |source: io::Error| RecordError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    if let Ok(meta) = fs::metadata(path) {
        tmp.as_file().set_permissions(meta.permissions()).map_err(io_err)?;
    }
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
