//! Rule set loading and validation.
//!
//! A rule set is loaded once per run from a JSON document and compiled into
//! an immutable [`RuleSet`]. Every list in it is ordered: overrides, vendor
//! rules and global rules are evaluated in file order, and the first match
//! wins. Vendor tables are read with their file order preserved as well, so
//! "last write wins" on duplicate keys means the later entry in the file.
//!
//! # Pattern dialect
//!
//! - Default: glob, `*` matches any run of characters and `?` exactly one.
//!   The glob is anchored to the whole name and case-insensitive, so a
//!   pattern without wildcards is an exact match.
//! - `re:` prefix: a raw regular expression, case-insensitive, unanchored
//!   unless it uses `^` or `$` itself.
//!
//! Any structural problem (unknown field, unknown category, bad pattern) is a
//! [`ConfigError`] naming the offending field. Nothing is processed until the
//! whole rule set has compiled.

use crate::error::ConfigError;
use crate::plugin::PluginIdentity;
use regex::{Regex, RegexBuilder};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

pub const DEFAULT_FALLBACK_CATEGORY: &str = "Other";

const REGEX_PREFIX: &str = "re:";

/// Collapse runs of whitespace into single spaces and trim.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Comparison form used by every case-insensitive exact match.
pub fn normalize(text: &str) -> String {
    collapse_whitespace(text).to_lowercase()
}

/// Lowercase alphanumeric words of `text`.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// A compiled name pattern. Keeps its source text for reports.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    pub fn parse(source: &str) -> Result<Self, regex::Error> {
        let expr = match source.strip_prefix(REGEX_PREFIX) {
            Some(raw) => raw.to_string(),
            None => glob_to_regex(source),
        };
        let regex = RegexBuilder::new(&expr).case_insensitive(true).build()?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    /// Literal words of the pattern with wildcard and regex syntax removed.
    pub fn literal_tokens(&self) -> Vec<String> {
        let body = self
            .source
            .strip_prefix(REGEX_PREFIX)
            .unwrap_or(&self.source);
        tokenize(body)
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut expr = String::from("^(?:");
    let mut buf = [0u8; 4];
    for ch in collapse_whitespace(glob).chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
    }
    expr.push_str(")$");
    expr
}

/// Identifies plugins for overrides and exclusions. All present criteria
/// must hold.
#[derive(Debug, Clone)]
pub struct Matcher {
    text: Option<(String, Pattern)>,
    name: Option<String>,
    pattern: Option<Pattern>,
    vendor: Option<String>,
    bundle_id: Option<String>,
    component: Option<String>,
    label: String,
}

impl Matcher {
    /// Human-readable form, used as the "matched pattern" in reports.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// `texts` are the candidate strings for the name criteria (display
    /// names, plus identifiers when matching exclusions). `vendor` is the
    /// canonical vendor.
    pub fn matches(&self, texts: &[String], vendor: Option<&str>, identity: &PluginIdentity) -> bool {
        if let Some((exact, pattern)) = &self.text {
            let hit = texts.iter().any(|t| normalize(t) == *exact)
                || texts.iter().any(|t| pattern.is_match(t));
            if !hit {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if !texts.iter().any(|t| normalize(t) == *name) {
                return false;
            }
        }
        if let Some(pattern) = &self.pattern {
            if !texts.iter().any(|t| pattern.is_match(t)) {
                return false;
            }
        }
        if let Some(expected) = &self.vendor {
            if vendor.map(normalize).as_deref() != Some(expected.as_str()) {
                return false;
            }
        }
        if let Some(bundle_id) = &self.bundle_id {
            if normalize(&identity.bundle_id) != *bundle_id {
                return false;
            }
        }
        if let Some(component) = &self.component {
            let id = &identity.component;
            if !component.eq_ignore_ascii_case(&id.to_string())
                && !component.eq_ignore_ascii_case(&id.tagset_name())
            {
                return false;
            }
        }
        true
    }

    fn compile(fields: MatcherFields, field: &str) -> Result<Self, ConfigError> {
        let mut label = Vec::new();
        let text = match fields.text {
            Some(text) => {
                let pattern = compile_pattern(&text, &format!("{}.match", field))?;
                label.push(format!("match={}", text));
                Some((normalize(&text), pattern))
            }
            None => None,
        };
        let pattern = match fields.pattern {
            Some(source) => {
                label.push(format!("pattern={}", source));
                Some(compile_pattern(&source, &format!("{}.pattern", field))?)
            }
            None => None,
        };
        let name = fields.name.map(|n| {
            label.push(format!("name={}", n));
            normalize(&n)
        });
        let vendor = fields.vendor.map(|v| {
            label.push(format!("vendor={}", v));
            normalize(&v)
        });
        let bundle_id = fields.bundle_id.map(|b| {
            label.push(format!("bundle_id={}", b));
            normalize(&b)
        });
        let component = fields.component.map(|c| {
            label.push(format!("component={}", c));
            c.trim().to_string()
        });

        if label.is_empty() {
            return Err(ConfigError::invalid(field, "matcher has no criteria"));
        }

        Ok(Self {
            text,
            name,
            pattern,
            vendor,
            bundle_id,
            component,
            label: label.join(", "),
        })
    }
}

/// Highest-precedence tier entry.
#[derive(Debug, Clone)]
pub struct Override {
    pub matcher: Matcher,
    pub category: String,
}

/// Vendor or global rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub pattern: Pattern,
    pub category: String,
}

/// Compiled, validated rule set. Immutable for the duration of a run.
#[derive(Debug, Clone)]
pub struct RuleSet {
    categories: Vec<String>,
    fallback_category: String,
    vendor_aliases: HashMap<String, String>,
    overrides: Vec<Override>,
    vendor_rules: Vec<(String, Vec<Rule>)>,
    global_rules: Vec<Rule>,
    exclude: Vec<Matcher>,
}

impl RuleSet {
    /// Load and validate a rule set file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Self::parse(json, Path::new("<string>"))
    }

    fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let file: RuleSetFile =
            serde_json::from_str(content).map_err(|source| ConfigError::Parse {
                path: PathBuf::from(path),
                source,
            })?;
        Self::compile(file)
    }

    fn compile(file: RuleSetFile) -> Result<Self, ConfigError> {
        let mut categories = Vec::with_capacity(file.categories.len());
        let mut seen = HashSet::new();
        for (i, category) in file.categories.into_iter().enumerate() {
            let field = format!("categories[{}]", i);
            let category = category.trim().to_string();
            if category.is_empty() {
                return Err(ConfigError::invalid(field, "category name is empty"));
            }
            if !seen.insert(category.to_lowercase()) {
                return Err(ConfigError::invalid(field, format!("duplicate category {:?}", category)));
            }
            categories.push(category);
        }
        let known = |category: &str, field: &str| -> Result<String, ConfigError> {
            let category = category.trim();
            if categories.iter().any(|c| c == category) {
                Ok(category.to_string())
            } else {
                Err(ConfigError::invalid(field, format!("unknown category {:?}", category)))
            }
        };

        let fallback_category = known(&file.fallback_category, "fallback_category")?;

        let mut vendor_aliases = HashMap::new();
        for (alias, vendor) in file.vendor_aliases.0 {
            let field = format!("vendor_aliases[{:?}]", alias);
            let key = normalize(&alias);
            let vendor = collapse_whitespace(&vendor);
            if key.is_empty() || vendor.is_empty() {
                return Err(ConfigError::invalid(field, "alias and vendor must be non-empty"));
            }
            vendor_aliases.insert(key, vendor);
        }

        let mut overrides = Vec::with_capacity(file.overrides.len());
        for (i, entry) in file.overrides.into_iter().enumerate() {
            let field = format!("overrides[{}]", i);
            let mut fields = entry.into_fields();
            let category = fields
                .category
                .take()
                .ok_or_else(|| ConfigError::invalid(&field, "override has no category"))?;
            let category = known(&category, &format!("{}.category", field))?;
            let matcher = Matcher::compile(fields, &field)?;
            overrides.push(Override { matcher, category });
        }

        let mut vendor_rules: Vec<(String, Vec<Rule>)> = Vec::new();
        for (vendor, entries) in file.vendor_rules.0 {
            let base = format!("vendor_rules[{:?}]", vendor);
            let vendor = collapse_whitespace(&vendor);
            if vendor.is_empty() {
                return Err(ConfigError::invalid(base, "vendor name is empty"));
            }
            let rules = compile_rules(entries, &base, &known)?;
            match vendor_rules
                .iter_mut()
                .find(|(existing, _)| normalize(existing) == normalize(&vendor))
            {
                Some(slot) => *slot = (vendor, rules),
                None => vendor_rules.push((vendor, rules)),
            }
        }

        let global_rules = compile_rules(file.rules, "rules", &known)?;

        let mut exclude = Vec::with_capacity(file.exclude.len());
        for (i, entry) in file.exclude.into_iter().enumerate() {
            let field = format!("exclude[{}]", i);
            let fields = entry.into_fields();
            if fields.category.is_some() {
                return Err(ConfigError::invalid(field, "exclusions do not take a category"));
            }
            exclude.push(Matcher::compile(fields, &field)?);
        }

        Ok(Self {
            categories,
            fallback_category,
            vendor_aliases,
            overrides,
            vendor_rules,
            global_rules,
            exclude,
        })
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn fallback_category(&self) -> &str {
        &self.fallback_category
    }

    pub fn overrides(&self) -> &[Override] {
        &self.overrides
    }

    pub fn global_rules(&self) -> &[Rule] {
        &self.global_rules
    }

    pub fn exclusions(&self) -> &[Matcher] {
        &self.exclude
    }

    /// Rules registered for a canonical vendor, compared case-insensitively.
    pub fn vendor_rules_for(&self, vendor: &str) -> Option<&[Rule]> {
        let key = normalize(vendor);
        self.vendor_rules
            .iter()
            .find(|(name, _)| normalize(name) == key)
            .map(|(_, rules)| rules.as_slice())
    }

    /// Every vendor rule list, in file order.
    pub fn vendor_rule_lists(&self) -> impl Iterator<Item = (&str, &[Rule])> {
        self.vendor_rules
            .iter()
            .map(|(name, rules)| (name.as_str(), rules.as_slice()))
    }

    /// Canonical vendor for a plugin: alias of the raw vendor string, then
    /// alias of any bundle id token, then the raw vendor string itself.
    pub fn canonical_vendor(&self, identity: &PluginIdentity) -> Option<String> {
        let raw = collapse_whitespace(&identity.vendor);
        if let Some(vendor) = self.vendor_aliases.get(&raw.to_lowercase()) {
            return Some(vendor.clone());
        }
        for token in identity.bundle_id.split('.') {
            if let Some(vendor) = self.vendor_aliases.get(&normalize(token)) {
                return Some(vendor.clone());
            }
        }
        if raw.is_empty() {
            None
        } else {
            Some(raw)
        }
    }
}

fn compile_pattern(source: &str, field: &str) -> Result<Pattern, ConfigError> {
    Pattern::parse(source).map_err(|source_err| ConfigError::Pattern {
        field: field.to_string(),
        pattern: source.to_string(),
        source: source_err,
    })
}

fn compile_rules(
    entries: Vec<RuleEntry>,
    base: &str,
    known: &dyn Fn(&str, &str) -> Result<String, ConfigError>,
) -> Result<Vec<Rule>, ConfigError> {
    entries
        .into_iter()
        .enumerate()
        .map(|(i, entry)| {
            let field = format!("{}[{}]", base, i);
            Ok(Rule {
                pattern: compile_pattern(&entry.pattern, &format!("{}.pattern", field))?,
                category: known(&entry.category, &format!("{}.category", field))?,
            })
        })
        .collect()
}

// On-disk schema

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleSetFile {
    categories: Vec<String>,
    #[serde(default = "default_fallback")]
    fallback_category: String,
    #[serde(default)]
    vendor_aliases: OrderedMap<String>,
    #[serde(default)]
    overrides: Vec<MatcherEntry>,
    #[serde(default)]
    vendor_rules: OrderedMap<Vec<RuleEntry>>,
    #[serde(default, alias = "global_rules")]
    rules: Vec<RuleEntry>,
    #[serde(default)]
    exclude: Vec<MatcherEntry>,
}

fn default_fallback() -> String {
    DEFAULT_FALLBACK_CATEGORY.to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleEntry {
    pattern: String,
    category: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MatcherEntry {
    Text(String),
    Fields(MatcherFields),
}

impl MatcherEntry {
    fn into_fields(self) -> MatcherFields {
        match self {
            MatcherEntry::Text(text) => MatcherFields {
                text: Some(text),
                ..MatcherFields::default()
            },
            MatcherEntry::Fields(fields) => fields,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MatcherFields {
    #[serde(rename = "match")]
    text: Option<String>,
    name: Option<String>,
    pattern: Option<String>,
    vendor: Option<String>,
    bundle_id: Option<String>,
    component: Option<String>,
    category: Option<String>,
}

/// JSON object read as an ordered list of entries, duplicates included.
#[derive(Debug)]
struct OrderedMap<V>(Vec<(String, V)>);

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        OrderedMap(Vec::new())
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedMapVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedMapVisitor<V> {
            type Value = OrderedMap<V>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some((key, value)) = map.next_entry::<String, V>()? {
                    entries.push((key, value));
                }
                Ok(OrderedMap(entries))
            }
        }

        deserializer.deserialize_map(OrderedMapVisitor(PhantomData))
    }
}
