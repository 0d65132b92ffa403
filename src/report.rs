//! Run reports.
//!
//! Reports are read-only artifacts: they describe what a run did (or would
//! do) and are never read back by a later run.

use crate::backup::Snapshot;
use crate::classify::{Classification, Tier};
use crate::plugin::PluginIdentity;
use crate::tagstore::TagMode;
use anyhow::{Context, Result};
use chrono::{Local, SecondsFormat};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Written,
    WouldWrite,
    Unchanged,
    Excluded,
    NoRecord,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginReport {
    pub name: String,
    pub vendor: Option<String>,
    pub component: String,
    pub tagset: String,
    pub outcome: Outcome,
    pub category: Option<String>,
    pub tier: Option<Tier>,
    pub matched_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PluginReport {
    pub(crate) fn new(identity: &PluginIdentity, classification: &Classification) -> Self {
        let (category, tier, matched_pattern, outcome) = match classification {
            Classification::Resolved(d) => (
                Some(d.category.clone()),
                Some(d.tier),
                d.matched_pattern.clone(),
                Outcome::NoRecord,
            ),
            Classification::Excluded { matcher, .. } => {
                (None, None, Some(matcher.clone()), Outcome::Excluded)
            }
        };
        Self {
            name: identity.name.clone(),
            vendor: classification.vendor().map(str::to_string),
            component: identity.component.to_string(),
            tagset: identity.component.tagset_name(),
            outcome,
            category,
            tier,
            matched_pattern,
            previous_tags: None,
            tags: None,
            error: None,
        }
    }

    pub(crate) fn fail(&mut self, error: impl ToString) {
        self.outcome = Outcome::Failed;
        self.error = Some(error.to_string());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    /// Resolved by an override, vendor or global rule.
    pub matched: usize,
    /// Resolved to the fallback category.
    pub unmatched: usize,
    pub excluded: usize,
    pub skipped_no_record: usize,
    pub unchanged: usize,
    /// Records that differ from their resolved tags (written or not).
    pub changed: usize,
    pub written: usize,
    pub failed: usize,
}

impl Summary {
    fn from_plugins(plugins: &[PluginReport]) -> Self {
        let mut summary = Summary {
            total: plugins.len(),
            ..Summary::default()
        };
        for plugin in plugins {
            match plugin.tier {
                Some(Tier::Fallback) => summary.unmatched += 1,
                Some(_) => summary.matched += 1,
                None => {}
            }
            match plugin.outcome {
                Outcome::Written => {
                    summary.written += 1;
                    summary.changed += 1;
                }
                Outcome::WouldWrite => summary.changed += 1,
                Outcome::Unchanged => summary.unchanged += 1,
                Outcome::Excluded => summary.excluded += 1,
                Outcome::NoRecord => summary.skipped_no_record += 1,
                Outcome::Failed => summary.failed += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryUpdate {
    pub categories: Vec<String>,
    pub would_change: bool,
    pub changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub generated_at: String,
    pub store_dir: PathBuf,
    pub dry_run: bool,
    pub mode: TagMode,
    pub fallback_category: String,
    pub snapshot: Option<Snapshot>,
    pub summary: Summary,
    pub plugins: Vec<PluginReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_update: Option<CategoryUpdate>,
}

impl ApplyReport {
    pub(crate) fn new(
        store_dir: &Path,
        dry_run: bool,
        mode: TagMode,
        fallback_category: &str,
        plugins: Vec<PluginReport>,
    ) -> Self {
        Self {
            generated_at: timestamp(),
            store_dir: store_dir.to_path_buf(),
            dry_run,
            mode,
            fallback_category: fallback_category.to_string(),
            snapshot: None,
            summary: Summary::from_plugins(&plugins),
            plugins,
            category_update: None,
        }
    }

    pub(crate) fn refresh_summary(&mut self) {
        self.summary = Summary::from_plugins(&self.plugins);
    }

    pub fn with_outcome(&self, outcome: Outcome) -> impl Iterator<Item = &PluginReport> {
        self.plugins.iter().filter(move |p| p.outcome == outcome)
    }
}

/// Local time, second precision, with offset.
pub fn timestamp() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Write any report as pretty JSON, creating parent directories.
pub fn write_json<T: Serialize>(path: &Path, report: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .context(format!("Failed to create report directory: {:?}", parent))?;
    }
    let content = serde_json::to_string_pretty(report)?;
    fs::write(path, content).context(format!("Failed to write report: {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Decision;
    use crate::plugin::ComponentId;
    use tempfile::TempDir;

    fn entry(tier: Option<Tier>, outcome: Outcome) -> PluginReport {
        let identity = PluginIdentity::new("P", "V", ComponentId::new("aufx", "Tst1", "Test"));
        let classification = match tier {
            Some(tier) => Classification::Resolved(Decision {
                category: "Other".into(),
                tier,
                matched_pattern: None,
                vendor: None,
            }),
            None => Classification::Excluded {
                matcher: "match=P".into(),
                vendor: None,
            },
        };
        let mut report = PluginReport::new(&identity, &classification);
        report.outcome = outcome;
        report
    }

    #[test]
    fn test_summary_counts() {
        let plugins = vec![
            entry(Some(Tier::Override), Outcome::Written),
            entry(Some(Tier::Global), Outcome::WouldWrite),
            entry(Some(Tier::Fallback), Outcome::Unchanged),
            entry(Some(Tier::Fallback), Outcome::NoRecord),
            entry(Some(Tier::Vendor), Outcome::Failed),
            entry(None, Outcome::Excluded),
        ];
        let summary = Summary::from_plugins(&plugins);
        assert_eq!(
            summary,
            Summary {
                total: 6,
                matched: 3,
                unmatched: 2,
                excluded: 1,
                skipped_no_record: 1,
                unchanged: 1,
                changed: 2,
                written: 1,
                failed: 1,
            }
        );
    }

    #[test]
    fn test_write_json_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reports").join("run.json");
        let report = ApplyReport::new(dir.path(), true, TagMode::Merge, "Other", vec![]);
        write_json(&path, &report).unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["dry_run"], true);
        assert_eq!(parsed["mode"], "merge");
        assert_eq!(parsed["summary"]["total"], 0);
    }
}
