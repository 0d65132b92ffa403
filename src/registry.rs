//! Plugin discovery.
//!
//! Produces the [`PluginIdentity`] list the rest of the crate works on,
//! either by scanning Audio Unit bundles or from a JSON catalog.
//!
//! # Bundle layout
//!
//! Each `*.component` bundle carries `Contents/Info.plist` with an
//! `AudioComponents` array. Every entry declares one component:
//! `name` (usually `"Vendor: Plugin"`), `type`, `subtype` and `manufacturer`
//! (four-character codes). One bundle can declare several components.
//!
//! Identities are unique by component identifier: when two bundles declare
//! the same one, the first found wins and the rest are logged.

use crate::plugin::{ComponentId, PluginIdentity};
use anyhow::{anyhow, Context, Result};
use plist::{Dictionary, Value};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const BUNDLE_EXTENSION: &str = "component";
const INFO_PLIST: &str = "Contents/Info.plist";

/// Scans every directory for component bundles. Missing directories are
/// skipped and unreadable ones are logged.
pub fn scan_components(dirs: &[PathBuf]) -> Vec<PluginIdentity> {
    let mut found = Vec::new();

    for dir in dirs {
        if !dir.exists() {
            debug!("Skipping missing plugin directory {:?}", dir);
            continue;
        }
        match scan_directory(dir) {
            Ok(mut plugins) => found.append(&mut plugins),
            Err(e) => warn!("Failed to scan directory {:?}: {:#}", dir, e),
        }
    }

    dedupe(found)
}

fn scan_directory(dir: &Path) -> Result<Vec<PluginIdentity>> {
    let entries = fs::read_dir(dir).context(format!("Failed to read directory: {:?}", dir))?;

    let mut bundles: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir() && p.extension().is_some_and(|ext| ext == BUNDLE_EXTENSION))
        .collect();
    bundles.sort();

    let mut plugins = Vec::new();
    for bundle in bundles {
        match read_component_bundle(&bundle) {
            Ok(mut declared) => plugins.append(&mut declared),
            Err(e) => warn!("Skipping bundle {:?}: {:#}", bundle, e),
        }
    }
    Ok(plugins)
}

/// Every component declared by one bundle.
pub fn read_component_bundle(bundle: &Path) -> Result<Vec<PluginIdentity>> {
    let info_path = bundle.join(INFO_PLIST);
    let info = Value::from_file(&info_path)
        .context(format!("Failed to read bundle info: {:?}", info_path))?;
    let info = info
        .as_dictionary()
        .ok_or_else(|| anyhow!("{:?}: root is not a dictionary", info_path))?;

    let bundle_id = info
        .get("CFBundleIdentifier")
        .and_then(Value::as_string)
        .unwrap_or_default();
    let components = info
        .get("AudioComponents")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("{:?}: no AudioComponents", info_path))?;

    let mut plugins = Vec::new();
    for (index, entry) in components.iter().enumerate() {
        match entry.as_dictionary().and_then(component_entry) {
            Some((display_name, component)) => {
                let (vendor, name) = split_display_name(&display_name, &component.manufacturer);
                plugins.push(
                    PluginIdentity::new(name, vendor, component)
                        .with_bundle_id(bundle_id)
                        .with_path(bundle),
                );
            }
            None => warn!("{:?}: AudioComponents[{}] is incomplete", info_path, index),
        }
    }
    Ok(plugins)
}

fn component_entry(entry: &Dictionary) -> Option<(String, ComponentId)> {
    let field = |key: &str| entry.get(key).and_then(Value::as_string);
    let component = ComponentId::new(field("type")?, field("subtype")?, field("manufacturer")?);
    Some((field("name")?.to_string(), component))
}

/// `"Vendor: Plugin"` splits on the first colon. Without one the
/// manufacturer code stands in for the vendor.
fn split_display_name(display_name: &str, manufacturer: &str) -> (String, String) {
    if let Some((vendor, name)) = display_name.split_once(':') {
        let (vendor, name) = (vendor.trim(), name.trim());
        if !vendor.is_empty() && !name.is_empty() {
            return (vendor.to_string(), name.to_string());
        }
    }
    (manufacturer.trim().to_string(), display_name.trim().to_string())
}

fn dedupe(plugins: Vec<PluginIdentity>) -> Vec<PluginIdentity> {
    let mut seen = HashSet::new();
    plugins
        .into_iter()
        .filter(|p| {
            let first = seen.insert(p.component.clone());
            if !first {
                warn!("Duplicate component {} at {:?}; keeping the first", p.component, p.path);
            }
            first
        })
        .collect()
}

/// Loads identities from a JSON array, deduplicated like a scan.
pub fn load_catalog(path: &Path) -> Result<Vec<PluginIdentity>> {
    let content = fs::read_to_string(path).context(format!("Failed to read catalog: {:?}", path))?;
    let plugins: Vec<PluginIdentity> =
        serde_json::from_str(&content).context(format!("Invalid catalog: {:?}", path))?;
    Ok(dedupe(plugins))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn component(name: &str, subtype: &str, manufacturer: &str) -> Value {
        let mut entry = Dictionary::new();
        entry.insert("name".into(), Value::String(name.into()));
        entry.insert("type".into(), Value::String("aufx".into()));
        entry.insert("subtype".into(), Value::String(subtype.into()));
        entry.insert("manufacturer".into(), Value::String(manufacturer.into()));
        Value::Dictionary(entry)
    }

    fn make_bundle(dir: &Path, bundle: &str, bundle_id: &str, components: Vec<Value>) -> PathBuf {
        let path = dir.join(bundle);
        fs::create_dir_all(path.join("Contents")).unwrap();
        let mut info = Dictionary::new();
        info.insert("CFBundleIdentifier".into(), Value::String(bundle_id.into()));
        info.insert("AudioComponents".into(), Value::Array(components));
        Value::Dictionary(info).to_file_xml(path.join(INFO_PLIST)).unwrap();
        path
    }

    #[test]
    fn test_scan_reads_audio_components() {
        let dir = TempDir::new().unwrap();
        let bundle = make_bundle(
            dir.path(),
            "Pro-Q 3.component",
            "com.fabfilter.Pro-Q.AU.3",
            vec![component("FabFilter: Pro-Q 3", "FQ3p", "FabF")],
        );
        make_bundle(dir.path(), "Plain.component", "com.acme.plain", vec![component("Plain Gain", "Gain", "Acme")]);
        fs::create_dir_all(dir.path().join("NotAPlugin.vst3")).unwrap();

        let plugins = scan_components(&[dir.path().to_path_buf(), dir.path().join("missing")]);
        assert_eq!(plugins.len(), 2);

        let plain = &plugins[0];
        assert_eq!(plain.name, "Plain Gain");
        assert_eq!(plain.vendor, "Acme");

        let proq = &plugins[1];
        assert_eq!(proq.name, "Pro-Q 3");
        assert_eq!(proq.vendor, "FabFilter");
        assert_eq!(proq.component, ComponentId::new("aufx", "FQ3p", "FabF"));
        assert_eq!(proq.bundle_id, "com.fabfilter.Pro-Q.AU.3");
        assert_eq!(proq.path, bundle);
    }

    #[test]
    fn test_duplicates_keep_first_and_bad_bundles_skipped() {
        let dir = TempDir::new().unwrap();
        make_bundle(dir.path(), "A.component", "a", vec![component("Acme: One", "One1", "Acme")]);
        make_bundle(dir.path(), "B.component", "b", vec![component("Acme: One Copy", "One1", "Acme")]);
        fs::create_dir_all(dir.path().join("Broken.component")).unwrap();

        let plugins = scan_components(&[dir.path().to_path_buf()]);
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].name, "One");
    }

    #[test]
    fn test_load_catalog() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");
        fs::write(
            &path,
            r#"[{"name": "Pro-R", "vendor": "FabFilter",
                 "component": {"type": "aufx", "subtype": "FRvb", "manufacturer": "FabF"}}]"#,
        )
        .unwrap();
        let plugins = load_catalog(&path).unwrap();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].component.tagset_name(), "61756678-46527662-46616246");
        assert!(plugins[0].bundle_id.is_empty());
    }
}
