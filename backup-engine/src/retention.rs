//! Retention: deletes succeeded backups that are older than their category's
//! `max_age_days` or beyond its `max_count`, unless a remaining backup still
//! needs them as a baseline.

use crate::catalog::Catalog;
use crate::config::RetentionRule;
use crate::manifest::{Category, Manifest, Status};
use crate::storage::StorageRegistry;
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct RetentionPolicy {
    rules: BTreeMap<Category, RetentionRule>,
}

impl RetentionPolicy {
    pub fn from_config(rules: &BTreeMap<String, RetentionRule>) -> Self {
        let rules = rules
            .iter()
            .filter_map(|(name, rule)| match Category::from_str(name) {
                Ok(category) => Some((category, *rule)),
                Err(e) => {
                    warn!(error = %e, "Ignoring retention rule");
                    None
                }
            })
            .collect();
        Self { rules }
    }

    /// Categories without a rule are kept forever.
    pub fn rule_for(&self, category: Category) -> Option<RetentionRule> {
        self.rules.get(&category).copied()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetentionPlan {
    /// Newest first within each category.
    pub delete: Vec<Manifest>,
    pub skipped_in_use: Vec<String>,
    pub attention: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub deleted: Vec<String>,
    pub skipped_in_use: Vec<String>,
    pub attention: Vec<String>,
    /// Deletions that failed, as `<where>: <error>`. Never fatal.
    pub failures: Vec<String>,
}

pub fn plan(policy: &RetentionPolicy, manifests: &[Manifest], now: DateTime<Utc>) -> RetentionPlan {
    let mut by_category: BTreeMap<Category, Vec<&Manifest>> = BTreeMap::new();
    let mut attention = Vec::new();
    for manifest in manifests {
        match manifest.status {
            Status::Succeeded => by_category.entry(manifest.category).or_default().push(manifest),
            Status::Partial | Status::Failed => attention.push(manifest.id.clone()),
        }
    }

    let mut candidates: Vec<&Manifest> = Vec::new();
    for (category, mut list) in by_category {
        let Some(rule) = policy.rule_for(category) else {
            continue;
        };
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        for (index, manifest) in list.into_iter().enumerate() {
            let too_old = manifest.age_days(now) > i64::from(rule.max_age_days);
            let too_many = rule.max_count.is_some_and(|max| index >= max);
            if too_old || too_many {
                candidates.push(manifest);
            }
        }
    }

    let candidate_ids: HashSet<&str> = candidates.iter().map(|m| m.id.as_str()).collect();
    let index: HashMap<&str, &Manifest> = manifests.iter().map(|m| (m.id.as_str(), m)).collect();

    // Every baseline reachable from a manifest that stays.
    let mut in_use: HashSet<&str> = HashSet::new();
    for manifest in manifests.iter().filter(|m| !candidate_ids.contains(m.id.as_str())) {
        let mut link = manifest.baseline.as_deref();
        while let Some(id) = link {
            if !in_use.insert(id) {
                break;
            }
            link = index.get(id).and_then(|m| m.baseline.as_deref());
        }
    }

    let mut result = RetentionPlan {
        attention,
        ..RetentionPlan::default()
    };
    for manifest in candidates {
        if in_use.contains(manifest.id.as_str()) {
            result.skipped_in_use.push(manifest.id.clone());
        } else {
            result.delete.push(manifest.clone());
        }
    }
    result
}

/// Local manifests plus those held only by a destination. Listing or
/// reading failures are returned as text and never fatal.
async fn known_manifests(
    catalog: &Catalog,
    registry: &StorageRegistry,
) -> Result<(Vec<Manifest>, HashSet<String>, Vec<String>)> {
    let mut manifests = catalog.list(None)?;
    let local: HashSet<String> = manifests.iter().map(|m| m.id.clone()).collect();
    let mut seen = local.clone();
    let mut failures = Vec::new();

    for id in registry.ids() {
        let remotes = match registry.list(&id).await {
            Ok(remotes) => remotes,
            Err(e) => {
                warn!(destination = %id, error = %e, "Listing failed during retention");
                failures.push(format!("{} list: {}", id, e));
                continue;
            }
        };
        for remote in remotes {
            if seen.contains(&remote.manifest_id) {
                continue;
            }
            match registry.get_manifest(&remote).await {
                Ok(manifest) if manifest.id == remote.manifest_id => {
                    seen.insert(manifest.id.clone());
                    manifests.push(manifest);
                }
                Ok(manifest) => {
                    failures.push(format!("{} {}: holds manifest {}", id, remote.manifest_id, manifest.id));
                }
                Err(e) => failures.push(format!("{} {}: {}", id, remote.manifest_id, e)),
            }
        }
    }
    Ok((manifests, local, failures))
}

/// Applies the plan to the local catalog and every destination. Pairs that
/// only a destination still holds are planned like local ones.
pub async fn enforce(
    policy: &RetentionPolicy,
    catalog: &Catalog,
    registry: &StorageRegistry,
    now: DateTime<Utc>,
) -> Result<RetentionReport> {
    let (manifests, local, failures) = known_manifests(catalog, registry).await?;
    let plan = plan(policy, &manifests, now);

    let mut report = RetentionReport {
        skipped_in_use: plan.skipped_in_use,
        attention: plan.attention,
        failures,
        ..RetentionReport::default()
    };
    for id in &report.skipped_in_use {
        warn!(manifest_id = %id, "Expired backup kept: still a baseline of a retained backup");
    }

    for manifest in &plan.delete {
        if local.contains(&manifest.id) {
            if let Err(e) = catalog.delete_pair(manifest) {
                warn!(manifest_id = %manifest.id, error = %e, "Local delete failed");
                report.failures.push(format!("local {}: {}", manifest.id, e));
                continue;
            }
        }
        report.deleted.push(manifest.id.clone());
        report.failures.extend(registry.delete_everywhere(manifest).await);
    }

    if !report.deleted.is_empty() || !report.skipped_in_use.is_empty() {
        info!(
            deleted = report.deleted.len(),
            skipped_in_use = report.skipped_in_use.len(),
            failures = report.failures.len(),
            "Retention applied"
        );
    }
    Ok(report)
}
