//! Apply orchestrator.
//!
//! One pass over the installed plugins:
//!
//! 1. classify every plugin and read its record, computing the tag set it
//!    should end up with (no writes yet);
//! 2. if anything would change and this is not a dry run, take exactly one
//!    snapshot of the store;
//! 3. write every changed record.
//!
//! A snapshot failure aborts before the first write. Per-plugin read or
//! write failures are recorded in the report and the pass continues.
//! The host application must not be running while this executes.

use crate::backup::BackupManager;
use crate::classify::classify;
use crate::error::{ConfigError, Error, RecordError, Result};
use crate::plugin::{ComponentId, PluginIdentity};
use crate::report::{ApplyReport, CategoryUpdate, Outcome, PluginReport};
use crate::rules::RuleSet;
use crate::tagstore::{RecordHandle, TagMode, TagStore, WriteOutcome};
use std::collections::HashMap;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub mode: TagMode,
    pub dry_run: bool,
    /// Also rewrite the host's category vocabulary from the rule set.
    pub update_categories: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            mode: TagMode::Replace,
            dry_run: true,
            update_categories: false,
        }
    }
}

struct PendingWrite {
    index: usize,
    handle: RecordHandle,
    category: String,
}

pub fn apply(
    identities: &[PluginIdentity],
    rules: &RuleSet,
    store: &TagStore,
    backups: &BackupManager,
    options: &ApplyOptions,
) -> Result<ApplyReport> {
    let mut plugins = Vec::with_capacity(identities.len());
    let mut pending = Vec::new();
    let mut seen: HashMap<&ComponentId, &str> = HashMap::new();

    for identity in identities {
        let classification = classify(identity, rules);
        let mut entry = PluginReport::new(identity, &classification);

        if let Some(first) = seen.get(&identity.component) {
            entry.fail(RecordError::Collision {
                component: identity.component.to_string(),
                first: first.to_string(),
            });
            plugins.push(entry);
            continue;
        }
        seen.insert(&identity.component, &identity.name);

        let Some(decision) = classification.decision() else {
            plugins.push(entry);
            continue;
        };
        let Some(handle) = store.locate(&identity.component) else {
            plugins.push(entry);
            continue;
        };

        match store.read(&handle) {
            Ok(record) => {
                let planned = record.planned_tags(&decision.category, options.mode);
                entry.outcome = if planned == record.tags() {
                    Outcome::Unchanged
                } else {
                    pending.push(PendingWrite {
                        index: plugins.len(),
                        handle,
                        category: decision.category.clone(),
                    });
                    Outcome::WouldWrite
                };
                entry.previous_tags = Some(record.tags().to_vec());
                entry.tags = Some(planned);
            }
            Err(e) => {
                warn!("Skipping {}: {}", identity.name, e);
                entry.fail(e);
            }
        }
        plugins.push(entry);
    }

    let mut category_update = if options.update_categories {
        Some(plan_category_update(rules, store, &pending, &plugins)?)
    } else {
        None
    };
    let categories_pending = category_update.as_ref().is_some_and(|u| u.would_change);

    let mut report = ApplyReport::new(
        store.root(),
        options.dry_run,
        options.mode,
        rules.fallback_category(),
        plugins,
    );

    if options.dry_run || (pending.is_empty() && !categories_pending) {
        if options.dry_run {
            info!("Dry run: {} record(s) would change", pending.len());
        }
        report.category_update = category_update;
        return Ok(report);
    }

    let snapshot = backups.snapshot(store.root())?;
    report.snapshot = Some(snapshot);

    for write in pending {
        let entry = &mut report.plugins[write.index];
        match store.write(&write.handle, &write.category, options.mode) {
            Ok(WriteOutcome::Written) => entry.outcome = Outcome::Written,
            Ok(WriteOutcome::Unchanged) => entry.outcome = Outcome::Unchanged,
            Err(e) => {
                warn!("Failed to write {}: {}", entry.name, e);
                entry.fail(e);
            }
        }
    }

    if let Some(update) = category_update.as_mut().filter(|u| u.would_change) {
        match store.update_categories(rules.categories()) {
            Ok(changed) => update.changed = changed,
            Err(e) => {
                warn!("Failed to update categories: {}", e);
                update.error = Some(e.to_string());
            }
        }
    }
    report.category_update = category_update;
    report.refresh_summary();

    info!(
        "Applied: {} written, {} failed",
        report.summary.written, report.summary.failed
    );
    Ok(report)
}

/// Decide whether the host's category lists need rewriting, refusing to drop
/// a category that some record would still carry after this run.
fn plan_category_update(
    rules: &RuleSet,
    store: &TagStore,
    pending: &[PendingWrite],
    plugins: &[PluginReport],
) -> Result<CategoryUpdate> {
    let current = store.categories()?;
    let wanted = rules.categories();

    let removed: Vec<String> = current
        .all()
        .into_iter()
        .filter(|c| !wanted.contains(c))
        .collect();

    if !removed.is_empty() {
        let mut after: HashMap<String, Vec<String>> = store
            .scan_tags()?
            .into_iter()
            .map(|r| (r.tagset, r.tags))
            .collect();
        for write in pending {
            if let Some(tags) = &plugins[write.index].tags {
                after.insert(write.handle.tagset().to_string(), tags.clone());
            }
        }
        for category in removed {
            let records = after.values().filter(|tags| tags.contains(&category)).count();
            if records > 0 {
                return Err(Error::Config(ConfigError::DanglingCategory { category, records }));
            }
        }
    }

    Ok(CategoryUpdate {
        categories: wanted.to_vec(),
        would_change: current.sorting != wanted || current.tagpool != wanted,
        changed: false,
        error: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tagstore::TAGPOOL_FILE;
    use plist::{Dictionary, Value};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: TagStore,
        backups: BackupManager,
    }

    fn write_tagset(root: &Path, component: &ComponentId, tags: &[&str]) {
        let mut tag_dict = Dictionary::new();
        for tag in tags {
            tag_dict.insert(tag.to_string(), Value::String("user".into()));
        }
        let mut dict = Dictionary::new();
        dict.insert("tags".into(), Value::Dictionary(tag_dict));
        Value::Dictionary(dict)
            .to_file_xml(root.join(format!("{}.tagset", component.tagset_name())))
            .unwrap();
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("Tags");
        fs::create_dir_all(&root).unwrap();
        let backups = BackupManager::new(dir.path().join("backups"));
        let store = TagStore::open(&root).unwrap();
        Fixture {
            _dir: dir,
            store,
            backups,
        }
    }

    fn plugin(name: &str, subtype: &str) -> PluginIdentity {
        PluginIdentity::new(name, "Acme", ComponentId::new("aufx", subtype, "Acme"))
    }

    fn rules() -> RuleSet {
        RuleSet::from_json_str(
            r#"{"categories": ["Reverb", "Dynamics", "Other"],
                "rules": [{"pattern": "*Reverb*", "category": "Reverb"},
                          {"pattern": "*Comp*", "category": "Dynamics"}],
                "exclude": ["Secret Reverb"]}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_dry_run_never_snapshots_or_writes() {
        let f = fixture();
        let p = plugin("Big Reverb", "Rvb1");
        write_tagset(f.store.root(), &p.component, &["Other"]);
        let before = fs::read(f.store.locate(&p.component).unwrap().path()).unwrap();

        let report = apply(&[p.clone()], &rules(), &f.store, &f.backups, &ApplyOptions::default()).unwrap();

        assert_eq!(report.summary.changed, 1);
        assert_eq!(report.plugins[0].outcome, Outcome::WouldWrite);
        assert!(report.snapshot.is_none());
        assert!(f.backups.list_snapshots().unwrap().is_empty());
        assert_eq!(fs::read(f.store.locate(&p.component).unwrap().path()).unwrap(), before);
    }

    #[test]
    fn test_apply_outcomes() {
        let f = fixture();
        let reverb = plugin("Big Reverb", "Rvb1");
        let comp = plugin("Bus Comp", "Cmp1");
        let secret = plugin("Secret Reverb", "Sec1");
        let unscanned = plugin("Fresh Delay", "Dly1");
        let duplicate = plugin("Bus Comp Copy", "Cmp1");
        write_tagset(f.store.root(), &reverb.component, &["Other"]);
        write_tagset(f.store.root(), &comp.component, &["Dynamics"]);
        write_tagset(f.store.root(), &secret.component, &["Other"]);

        let options = ApplyOptions {
            dry_run: false,
            ..ApplyOptions::default()
        };
        let identities = [reverb.clone(), comp, secret.clone(), unscanned, duplicate];
        let report = apply(&identities, &rules(), &f.store, &f.backups, &options).unwrap();

        let outcomes: Vec<Outcome> = report.plugins.iter().map(|p| p.outcome).collect();
        assert_eq!(
            outcomes,
            [
                Outcome::Written,
                Outcome::Unchanged,
                Outcome::Excluded,
                Outcome::NoRecord,
                Outcome::Failed
            ]
        );
        assert_eq!(report.summary.written, 1);
        assert_eq!(report.summary.excluded, 1);
        assert_eq!(report.summary.skipped_no_record, 1);
        assert!(report.snapshot.is_some());

        let store = &f.store;
        let read = |p: &PluginIdentity| store.read(&store.locate(&p.component).unwrap()).unwrap();
        assert_eq!(read(&reverb).tags(), ["Reverb"]);
        assert_eq!(read(&secret).tags(), ["Other"]);
    }

    #[test]
    fn test_nothing_to_change_takes_no_snapshot() {
        let f = fixture();
        let p = plugin("Big Reverb", "Rvb1");
        write_tagset(f.store.root(), &p.component, &["Reverb"]);
        let options = ApplyOptions {
            dry_run: false,
            ..ApplyOptions::default()
        };
        let report = apply(&[p], &rules(), &f.store, &f.backups, &options).unwrap();
        assert!(report.snapshot.is_none());
        assert_eq!(report.summary.unchanged, 1);
    }

    #[test]
    fn test_snapshot_failure_aborts_with_zero_writes() {
        let f = fixture();
        let p = plugin("Big Reverb", "Rvb1");
        write_tagset(f.store.root(), &p.component, &["Other"]);
        let blocker = f.backups.root().to_path_buf();
        fs::write(&blocker, b"file in the way").unwrap();

        let options = ApplyOptions {
            dry_run: false,
            ..ApplyOptions::default()
        };
        let err = apply(&[p.clone()], &rules(), &f.store, &f.backups, &options).unwrap_err();
        assert!(matches!(err, Error::Snapshot(_)));
        let record = f.store.read(&f.store.locate(&p.component).unwrap()).unwrap();
        assert_eq!(record.tags(), ["Other"]);
    }

    #[test]
    fn test_update_categories_rejects_dangling_category() {
        let f = fixture();
        let kept = plugin("Big Reverb", "Rvb1");
        write_tagset(f.store.root(), &kept.component, &["Legacy"]);
        write_tagset(f.store.root(), &ComponentId::new("aufx", "Unk1", "Else"), &["Legacy"]);
        let mut pool = Dictionary::new();
        pool.insert("Legacy".into(), Value::Integer(2i64.into()));
        Value::Dictionary(pool)
            .to_file_xml(f.store.root().join(TAGPOOL_FILE))
            .unwrap();

        let options = ApplyOptions {
            dry_run: false,
            update_categories: true,
            ..ApplyOptions::default()
        };
        let err = apply(&[kept], &rules(), &f.store, &f.backups, &options).unwrap_err();
        match err {
            Error::Config(ConfigError::DanglingCategory { category, records }) => {
                assert_eq!(category, "Legacy");
                assert_eq!(records, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(f.backups.list_snapshots().unwrap().is_empty());
    }

    #[test]
    fn test_update_categories_after_snapshot() {
        let f = fixture();
        let p = plugin("Big Reverb", "Rvb1");
        write_tagset(f.store.root(), &p.component, &["Legacy"]);
        let mut pool = Dictionary::new();
        pool.insert("Legacy".into(), Value::Integer(1i64.into()));
        Value::Dictionary(pool)
            .to_file_xml(f.store.root().join(TAGPOOL_FILE))
            .unwrap();

        let options = ApplyOptions {
            dry_run: false,
            update_categories: true,
            ..ApplyOptions::default()
        };
        let report = apply(&[p], &rules(), &f.store, &f.backups, &options).unwrap();
        let update = report.category_update.unwrap();
        assert!(update.changed);
        assert!(report.snapshot.is_some());
        assert_eq!(f.store.categories().unwrap().tagpool, ["Reverb", "Dynamics", "Other"]);
    }
}
