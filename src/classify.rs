//! Rule engine.
//!
//! [`classify`] maps a plugin identity to a category using a [`RuleSet`].
//! Tiers are tried in strict order and each short-circuits on its first
//! match: exclusions, overrides, vendor rules, global rules, fallback.
//! Within a tier list order is the only tie-break.
//!
//! The function does no IO and depends only on its arguments, so the same
//! decision can be replayed later (see `diagnose`).

use crate::plugin::PluginIdentity;
use crate::rules::{collapse_whitespace, RuleSet};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Override,
    Vendor,
    Global,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub category: String,
    pub tier: Tier,
    /// Source of the matcher or pattern that decided, `None` for fallback.
    pub matched_pattern: Option<String>,
    /// Canonical vendor used for the vendor tier.
    pub vendor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Never written. `matcher` is the label of the exclusion that hit.
    Excluded {
        matcher: String,
        vendor: Option<String>,
    },
    Resolved(Decision),
}

impl Classification {
    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Classification::Resolved(decision) => Some(decision),
            Classification::Excluded { .. } => None,
        }
    }

    pub fn vendor(&self) -> Option<&str> {
        match self {
            Classification::Resolved(decision) => decision.vendor.as_deref(),
            Classification::Excluded { vendor, .. } => vendor.as_deref(),
        }
    }
}

pub fn classify(identity: &PluginIdentity, rules: &RuleSet) -> Classification {
    let vendor = rules.canonical_vendor(identity);
    let names = name_candidates(identity, vendor.as_deref());

    let mut identifiers = names.clone();
    identifiers.push(identity.component.to_string());
    identifiers.push(identity.component.tagset_name());
    if !identity.bundle_id.is_empty() {
        identifiers.push(identity.bundle_id.clone());
    }

    if let Some(matcher) = rules
        .exclusions()
        .iter()
        .find(|m| m.matches(&identifiers, vendor.as_deref(), identity))
    {
        return Classification::Excluded {
            matcher: matcher.label().to_string(),
            vendor,
        };
    }

    if let Some(entry) = rules
        .overrides()
        .iter()
        .find(|o| o.matcher.matches(&names, vendor.as_deref(), identity))
    {
        return resolved(&entry.category, Tier::Override, Some(entry.matcher.label()), vendor);
    }

    if let Some(list) = vendor.as_deref().and_then(|v| rules.vendor_rules_for(v)) {
        if let Some(rule) = list
            .iter()
            .find(|r| names.iter().any(|n| r.pattern.is_match(n)))
        {
            return resolved(&rule.category, Tier::Vendor, Some(rule.pattern.source()), vendor);
        }
    }

    if let Some(rule) = rules
        .global_rules()
        .iter()
        .find(|r| names.iter().any(|n| r.pattern.is_match(n)))
    {
        return resolved(&rule.category, Tier::Global, Some(rule.pattern.source()), vendor);
    }

    resolved(rules.fallback_category(), Tier::Fallback, None, vendor)
}

fn resolved(category: &str, tier: Tier, pattern: Option<&str>, vendor: Option<String>) -> Classification {
    Classification::Resolved(Decision {
        category: category.to_string(),
        tier,
        matched_pattern: pattern.map(str::to_string),
        vendor,
    })
}

/// The display name, plus the name with a leading `<vendor>:` or
/// `<vendor> -` removed when present (canonical or raw vendor).
pub(crate) fn name_candidates(identity: &PluginIdentity, canonical_vendor: Option<&str>) -> Vec<String> {
    let name = collapse_whitespace(&identity.name);
    let mut names = vec![name.clone()];
    let raw_vendor = collapse_whitespace(&identity.vendor);
    for vendor in canonical_vendor.into_iter().chain(std::iter::once(raw_vendor.as_str())) {
        if let Some(stripped) = strip_vendor_prefix(&name, vendor) {
            if !names.contains(&stripped) {
                names.push(stripped);
            }
        }
    }
    names
}

fn strip_vendor_prefix(name: &str, vendor: &str) -> Option<String> {
    if vendor.is_empty() {
        return None;
    }
    let head = name.get(..vendor.len())?;
    if head.to_lowercase() != vendor.to_lowercase() {
        return None;
    }
    let rest = name[vendor.len()..].trim_start();
    let rest = rest.strip_prefix(':').or_else(|| rest.strip_prefix('-'))?;
    let rest = rest.trim();
    if rest.is_empty() {
        None
    } else {
        Some(rest.to_string())
    }
}
