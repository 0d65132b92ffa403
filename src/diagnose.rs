//! Diagnostics for plugins that fell through to the fallback category.
//!
//! For each such plugin we replay the tiers that were tried and list the
//! rules that came closest, so a maintainer can see which pattern or alias
//! to add. Nothing here touches the metadata store.

use crate::classify::{classify, name_candidates, Classification, Tier};
use crate::plugin::PluginIdentity;
use crate::report::timestamp;
use crate::rules::{normalize, tokenize, Pattern, RuleSet};
use serde::Serialize;
use std::collections::BTreeSet;

const MAX_NEAR_MISSES: usize = 3;

/// Shortest token that may match inside a longer one.
const MIN_PARTIAL_TOKEN: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct DiagnoseFilter {
    /// Keep only these vendors (canonical or raw, case-insensitive).
    pub vendors: Vec<String>,
    /// When set, keep only plugins whose record name is not in this set.
    pub absent_from: Option<BTreeSet<String>>,
}

impl DiagnoseFilter {
    fn accepts(&self, identity: &PluginIdentity, vendor: Option<&str>) -> bool {
        if !self.vendors.is_empty() {
            let wanted = |v: &str| self.vendors.iter().any(|f| normalize(f) == normalize(v));
            if !wanted(&identity.vendor) && !vendor.is_some_and(wanted) {
                return false;
            }
        }
        match &self.absent_from {
            Some(present) => !present.contains(&identity.component.tagset_name()),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TierCheck {
    pub tier: Tier,
    /// Rules in the tier that were tried.
    pub candidates: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NearMiss {
    pub tier: Tier,
    /// Rule source, prefixed with `<vendor>: ` for vendor rules.
    pub pattern: String,
    pub category: String,
    /// Share of the pattern's words found in the name, in percent.
    pub score: u32,
    pub shared_tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnosis {
    pub identity: PluginIdentity,
    pub vendor: Option<String>,
    pub tiers_checked: Vec<TierCheck>,
    pub near_misses: Vec<NearMiss>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub generated_at: String,
    pub fallback_category: String,
    pub total: usize,
    pub entries: Vec<Diagnosis>,
}

impl DiagnosticsReport {
    pub fn new(rules: &RuleSet, entries: Vec<Diagnosis>) -> Self {
        Self {
            generated_at: timestamp(),
            fallback_category: rules.fallback_category().to_string(),
            total: entries.len(),
            entries,
        }
    }
}

/// Diagnose every fallback-tier plugin accepted by `filter`, sorted by
/// vendor then name.
pub fn diagnose(identities: &[PluginIdentity], rules: &RuleSet, filter: &DiagnoseFilter) -> Vec<Diagnosis> {
    let mut entries: Vec<Diagnosis> = identities
        .iter()
        .filter_map(|identity| {
            let Classification::Resolved(decision) = classify(identity, rules) else {
                return None;
            };
            if decision.tier != Tier::Fallback || !filter.accepts(identity, decision.vendor.as_deref()) {
                return None;
            }
            Some(explain(identity, decision.vendor, rules))
        })
        .collect();

    entries.sort_by_key(|d| {
        (
            d.vendor.as_deref().unwrap_or_default().to_lowercase(),
            d.identity.name.to_lowercase(),
        )
    });
    entries
}

fn explain(identity: &PluginIdentity, vendor: Option<String>, rules: &RuleSet) -> Diagnosis {
    let names = name_candidates(identity, vendor.as_deref());
    let name_tokens: Vec<String> = names.iter().flat_map(|n| tokenize(n)).collect();

    let own_rules = vendor.as_deref().and_then(|v| rules.vendor_rules_for(v));
    let vendor_note = match (&vendor, own_rules) {
        (None, _) => Some("plugin has no vendor".to_string()),
        (Some(v), None) => Some(format!("no vendor rules for {:?}", v)),
        (Some(_), Some(_)) => None,
    };
    let tiers_checked = vec![
        TierCheck {
            tier: Tier::Override,
            candidates: rules.overrides().len(),
            note: None,
        },
        TierCheck {
            tier: Tier::Vendor,
            candidates: own_rules.map_or(0, <[_]>::len),
            note: vendor_note,
        },
        TierCheck {
            tier: Tier::Global,
            candidates: rules.global_rules().len(),
            note: None,
        },
    ];

    let mut near_misses = Vec::new();
    // Rules filed under another vendor are included: a hit there usually
    // means a missing vendor alias.
    for (list_vendor, list) in rules.vendor_rule_lists() {
        for rule in list {
            if let Some((score, shared)) = closeness(&names, &name_tokens, &rule.pattern) {
                near_misses.push(NearMiss {
                    tier: Tier::Vendor,
                    pattern: format!("{}: {}", list_vendor, rule.pattern.source()),
                    category: rule.category.clone(),
                    score,
                    shared_tokens: shared,
                });
            }
        }
    }
    for rule in rules.global_rules() {
        if let Some((score, shared)) = closeness(&names, &name_tokens, &rule.pattern) {
            near_misses.push(NearMiss {
                tier: Tier::Global,
                pattern: rule.pattern.source().to_string(),
                category: rule.category.clone(),
                score,
                shared_tokens: shared,
            });
        }
    }
    // Stable sort: equal scores keep rule-list order.
    near_misses.sort_by(|a, b| b.score.cmp(&a.score));
    near_misses.truncate(MAX_NEAR_MISSES);

    Diagnosis {
        identity: identity.clone(),
        vendor,
        tiers_checked,
        near_misses,
    }
}

/// Word overlap between a plugin name and a pattern. A pattern that
/// matches outright scores 100.
fn closeness(names: &[String], name_tokens: &[String], pattern: &Pattern) -> Option<(u32, Vec<String>)> {
    let tokens = pattern.literal_tokens();
    if names.iter().any(|n| pattern.is_match(n)) {
        return Some((100, tokens));
    }
    if tokens.is_empty() {
        return None;
    }
    let shared: Vec<String> = tokens
        .iter()
        .filter(|t| name_tokens.iter().any(|n| related(n, t)))
        .cloned()
        .collect();
    if shared.is_empty() {
        return None;
    }
    Some(((shared.len() * 100 / tokens.len()) as u32, shared))
}

fn related(a: &str, b: &str) -> bool {
    a == b
        || (b.len() >= MIN_PARTIAL_TOKEN && a.contains(b))
        || (a.len() >= MIN_PARTIAL_TOKEN && b.contains(a))
}
