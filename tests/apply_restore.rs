use plist::{Dictionary, Value};
use plugtag_core::report::Outcome;
use plugtag_core::{apply, ApplyOptions, BackupManager, ComponentId, PluginIdentity, RuleSet, TagMode, TagStore};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

const RULES: &str = r#"{
    "categories": ["Dynamics", "EQ", "Reverb", "Other"],
    "vendor_aliases": {"Fab Filter": "FabFilter"},
    "overrides": [{"match": "Pro-C 2", "category": "Dynamics"}],
    "vendor_rules": {"FabFilter": [{"pattern": "Pro-Q*", "category": "EQ"}]},
    "rules": [{"pattern": "*Reverb*", "category": "Reverb"}],
    "exclude": [{"vendor": "Hidden Co"}]
}"#;

struct Env {
    _dir: TempDir,
    store: TagStore,
    backups: BackupManager,
}

impl Env {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let tags = dir.path().join("Tags");
        fs::create_dir_all(&tags).unwrap();
        let backups = BackupManager::new(dir.path().join("backups"));
        Env {
            store: TagStore::open(&tags).unwrap(),
            backups,
            _dir: dir,
        }
    }

    fn record(&self, plugin: &PluginIdentity, tags: &[&str]) -> PathBuf {
        let mut tag_dict = Dictionary::new();
        for tag in tags {
            tag_dict.insert(tag.to_string(), Value::String("user".into()));
        }
        let mut root = Dictionary::new();
        root.insert("tags".into(), Value::Dictionary(tag_dict));
        root.insert("hide".into(), Value::Boolean(false));
        let path = self
            .store
            .root()
            .join(format!("{}.tagset", plugin.component.tagset_name()));
        Value::Dictionary(root).to_file_xml(&path).unwrap();
        path
    }

    fn tags_of(&self, plugin: &PluginIdentity) -> Vec<String> {
        let handle = self.store.locate(&plugin.component).unwrap();
        self.store.read(&handle).unwrap().tags().to_vec()
    }
}

fn plugin(name: &str, vendor: &str, subtype: &str) -> PluginIdentity {
    PluginIdentity::new(name, vendor, ComponentId::new("aufx", subtype, "Test"))
}

fn applying(mode: TagMode) -> ApplyOptions {
    ApplyOptions {
        mode,
        dry_run: false,
        update_categories: false,
    }
}

/// Relative path -> bytes of every file under `root`.
fn tree(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().to_path_buf();
            (rel, fs::read(e.path()).unwrap())
        })
        .collect()
}

#[test]
fn test_dry_run_leaves_store_and_backups_untouched() {
    let env = Env::new();
    let proq = plugin("Pro-Q 3", "Fab Filter", "FQ3p");
    env.record(&proq, &["Other"]);
    let before = tree(env.store.root());

    let rules = RuleSet::from_json_str(RULES).unwrap();
    let report = apply(&[proq], &rules, &env.store, &env.backups, &ApplyOptions::default()).unwrap();

    assert!(report.dry_run);
    assert_eq!(report.summary.changed, 1);
    assert_eq!(tree(env.store.root()), before);
    assert!(!env.backups.root().exists());
}

#[test]
fn test_single_change_snapshot_and_restore() {
    let env = Env::new();
    let proq = plugin("Pro-Q 3", "Fab Filter", "FQ3p");
    let verb = plugin("Room Reverb", "Acme", "Rvb1");
    let proq_path = env.record(&proq, &["Other"]);
    env.record(&verb, &["Reverb"]);
    let before = tree(env.store.root());

    let rules = RuleSet::from_json_str(RULES).unwrap();
    let report = apply(
        &[proq.clone(), verb.clone()],
        &rules,
        &env.store,
        &env.backups,
        &applying(TagMode::Replace),
    )
    .unwrap();

    assert_eq!(report.summary.written, 1);
    assert_eq!(report.summary.unchanged, 1);
    assert_eq!(env.tags_of(&proq), ["EQ"]);

    // Only the changed record differs from the pre-run state.
    let after = tree(env.store.root());
    let changed: Vec<&PathBuf> = after.keys().filter(|k| after[*k] != before[*k]).collect();
    assert_eq!(changed, [&PathBuf::from(proq_path.file_name().unwrap())]);

    // Untouched keys survive a write.
    let root = Value::from_file(&proq_path).unwrap();
    assert_eq!(
        root.as_dictionary().unwrap().get("hide"),
        Some(&Value::Boolean(false))
    );

    let snapshots = env.backups.list_snapshots().unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(Some(&snapshots[0]), report.snapshot.as_ref());
    assert_eq!(tree(&snapshots[0].contents()), before);

    let restored = env.backups.restore_latest(env.store.root()).unwrap();
    assert_eq!(restored, snapshots[0]);
    assert_eq!(tree(env.store.root()), before);
}

#[test]
fn test_merge_keeps_existing_tags() {
    let env = Env::new();
    let proc2 = plugin("Pro-C 2", "FabFilter", "FC2p");
    env.record(&proc2, &["Favorites"]);

    let rules = RuleSet::from_json_str(RULES).unwrap();
    apply(&[proc2.clone()], &rules, &env.store, &env.backups, &applying(TagMode::Merge)).unwrap();
    assert_eq!(env.tags_of(&proc2), ["Favorites", "Dynamics"]);

    apply(&[proc2.clone()], &rules, &env.store, &env.backups, &applying(TagMode::Replace)).unwrap();
    assert_eq!(env.tags_of(&proc2), ["Dynamics"]);
}

#[test]
fn test_repeat_run_is_a_no_op() {
    let env = Env::new();
    let proq = plugin("Pro-Q 3", "FabFilter", "FQ3p");
    env.record(&proq, &["Other"]);
    let rules = RuleSet::from_json_str(RULES).unwrap();

    apply(&[proq.clone()], &rules, &env.store, &env.backups, &applying(TagMode::Replace)).unwrap();
    let settled = tree(env.store.root());

    let second = apply(&[proq], &rules, &env.store, &env.backups, &applying(TagMode::Replace)).unwrap();
    assert_eq!(second.summary.unchanged, 1);
    assert!(second.snapshot.is_none());
    assert_eq!(tree(env.store.root()), settled);
    assert_eq!(env.backups.list_snapshots().unwrap().len(), 1);
}

#[test]
fn test_excluded_and_unscanned_plugins() {
    let env = Env::new();
    let hidden = plugin("Secret Reverb", "Hidden Co", "Sec1");
    let unscanned = plugin("Brand New Reverb", "Acme", "New1");
    let hidden_path = env.record(&hidden, &["Other"]);
    let hidden_bytes = fs::read(&hidden_path).unwrap();

    let rules = RuleSet::from_json_str(RULES).unwrap();
    let report = apply(
        &[hidden, unscanned],
        &rules,
        &env.store,
        &env.backups,
        &applying(TagMode::Replace),
    )
    .unwrap();

    assert_eq!(report.plugins[0].outcome, Outcome::Excluded);
    assert_eq!(report.plugins[1].outcome, Outcome::NoRecord);
    assert_eq!(report.plugins[1].category.as_deref(), Some("Reverb"));
    assert_eq!(fs::read(&hidden_path).unwrap(), hidden_bytes);
    assert!(report.snapshot.is_none());
    assert_eq!(env.store.record_names().unwrap().len(), 1);
}

#[test]
fn test_snapshot_failure_means_zero_writes() {
    let env = Env::new();
    let proq = plugin("Pro-Q 3", "FabFilter", "FQ3p");
    env.record(&proq, &["Other"]);
    let before = tree(env.store.root());
    fs::write(env.backups.root(), b"not a directory").unwrap();

    let rules = RuleSet::from_json_str(RULES).unwrap();
    let result = apply(&[proq], &rules, &env.store, &env.backups, &applying(TagMode::Replace));

    assert!(matches!(result, Err(plugtag_core::Error::Snapshot(_))));
    assert_eq!(tree(env.store.root()), before);
}

#[test]
fn test_unreadable_record_does_not_stop_the_run() {
    let env = Env::new();
    let broken = plugin("Broken Reverb", "Acme", "Brk1");
    let fine = plugin("Fine Reverb", "Acme", "Fin1");
    fs::write(
        env.store
            .root()
            .join(format!("{}.tagset", broken.component.tagset_name())),
        b"not a plist",
    )
    .unwrap();
    env.record(&fine, &[]);

    let rules = RuleSet::from_json_str(RULES).unwrap();
    let report = apply(
        &[broken, fine.clone()],
        &rules,
        &env.store,
        &env.backups,
        &applying(TagMode::Replace),
    )
    .unwrap();

    assert_eq!(report.plugins[0].outcome, Outcome::Failed);
    assert!(report.plugins[0].error.is_some());
    assert_eq!(report.plugins[1].outcome, Outcome::Written);
    assert_eq!(env.tags_of(&fine), ["Reverb"]);
}

#[test]
fn test_backups_inside_store_are_refused() {
    let env = Env::new();
    let proq = plugin("Pro-Q 3", "FabFilter", "FQ3p");
    env.record(&proq, &["Other"]);
    let rules = RuleSet::from_json_str(RULES).unwrap();

    apply(&[proq.clone()], &rules, &env.store, &env.backups, &applying(TagMode::Replace)).unwrap();
    env.backups.snapshot(env.store.root()).unwrap();
    assert_eq!(env.backups.list_snapshots().unwrap().len(), 2);

    let inside = BackupManager::new(env.store.root().join("backups"));
    env.record(&proq, &["Other"]);
    let before = tree(env.store.root());
    let result = apply(&[proq.clone()], &rules, &env.store, &inside, &applying(TagMode::Replace));
    assert!(matches!(
        result,
        Err(plugtag_core::Error::Snapshot(plugtag_core::SnapshotError::Nested { .. }))
    ));
    assert_eq!(tree(env.store.root()), before);
    assert!(!inside.root().exists());

    assert!(inside.restore_latest(env.store.root()).is_err());
    assert_eq!(env.tags_of(&proq), ["Other"]);

    env.backups.restore_latest(env.store.root()).unwrap();
    assert_eq!(env.tags_of(&proq), ["EQ"]);
    assert_eq!(env.backups.list_snapshots().unwrap().len(), 2);
}

#[cfg(unix)]
#[test]
fn test_snapshot_failing_mid_copy_means_zero_writes() {
    let env = Env::new();
    let proq = plugin("Pro-Q 3", "FabFilter", "FQ3p");
    env.record(&proq, &["Other"]);
    std::os::unix::fs::symlink(env.store.root().join("gone"), env.store.root().join("zz.tagset")).unwrap();

    let rules = RuleSet::from_json_str(RULES).unwrap();
    let result = apply(&[proq.clone()], &rules, &env.store, &env.backups, &applying(TagMode::Replace));

    assert!(matches!(result, Err(plugtag_core::Error::Snapshot(_))));
    assert_eq!(env.tags_of(&proq), ["Other"]);
    assert_eq!(fs::read_dir(env.backups.root()).unwrap().count(), 0);
    assert!(env.backups.list_snapshots().unwrap().is_empty());
}
