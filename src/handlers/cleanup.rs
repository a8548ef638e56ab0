//! Retention-based pruning of installed versions and downloaded artifacts.
//!
//! The agent serves several environments at once, so enabled policies are
//! aggregated by taking the maximum of each dimension: no version that any
//! single policy would keep is ever deleted. Within a family directory the
//! kept set is the union of the newest `retain_versions` entries and every
//! entry modified on or after the cutoff.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::types::{CleanupTask, RetentionPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectivePolicy {
    pub retain_versions: usize,
    pub retain_days: i64,
}

/// Fold all enabled policies into one, clamping negative values to zero.
/// `None` when nothing is enabled.
pub fn aggregate_policies(policies: &[RetentionPolicy]) -> Option<EffectivePolicy> {
    let enabled: Vec<&RetentionPolicy> = policies.iter().filter(|p| p.enabled).collect();
    if enabled.is_empty() {
        return None;
    }
    Some(EffectivePolicy {
        retain_versions: enabled
            .iter()
            .map(|p| p.retain_deployed_versions.max(0) as usize)
            .max()
            .unwrap_or(0),
        retain_days: enabled.iter().map(|p| p.retain_days.max(0)).max().unwrap_or(0),
    })
}

/// Union of the `retain_versions` most recent entries and everything
/// modified at or after `cutoff`.
pub fn compute_keep_set(
    versions: &[(String, DateTime<Utc>)],
    retain_versions: usize,
    cutoff: DateTime<Utc>,
) -> HashSet<String> {
    let mut by_recency: Vec<&(String, DateTime<Utc>)> = versions.iter().collect();
    by_recency.sort_by(|a, b| b.1.cmp(&a.1));

    let mut keep: HashSet<String> = by_recency
        .iter()
        .take(retain_versions)
        .map(|(name, _)| name.clone())
        .collect();
    keep.extend(
        versions
            .iter()
            .filter(|(_, modified)| *modified >= cutoff)
            .map(|(name, _)| name.clone()),
    );
    keep
}

pub struct CleanupHandler {
    artifacts_root: PathBuf,
    installations_root: PathBuf,
    agent_id: Uuid,
}

impl CleanupHandler {
    pub fn new(
        artifacts_root: impl Into<PathBuf>,
        installations_root: impl Into<PathBuf>,
        agent_id: Uuid,
    ) -> Self {
        Self {
            artifacts_root: artifacts_root.into(),
            installations_root: installations_root.into(),
            agent_id,
        }
    }

    pub async fn handle(&self, task: CleanupTask) -> Result<()> {
        let Some(policy) = aggregate_policies(&task.retention_policies) else {
            log::info!("cleanup: no enabled retention policies, nothing to do");
            return Ok(());
        };
        let cutoff = Utc::now() - chrono::Duration::days(policy.retain_days);
        log::info!(
            "cleanup: keeping {} most recent versions and everything newer than {cutoff}",
            policy.retain_versions
        );

        for root in [
            self.artifacts_root.join(self.agent_id.to_string()),
            self.installations_root.join(self.agent_id.to_string()),
        ] {
            prune_root(&root, policy, cutoff);
        }
        Ok(())
    }
}

/// Prune every family under `root`, then remove `root` itself if it ended
/// up empty. Failures are logged and never stop sibling work.
fn prune_root(root: &Path, policy: EffectivePolicy, cutoff: DateTime<Utc>) {
    if !root.exists() {
        return;
    }
    let families = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("cleanup: cannot list {}: {e}", root.display());
            return;
        }
    };

    for family in families.flatten() {
        let path = family.path();
        if path.is_dir() {
            prune_family(&path, policy, cutoff);
        }
    }
    remove_if_empty(root);
}

fn prune_family(family: &Path, policy: EffectivePolicy, cutoff: DateTime<Utc>) {
    let mut versions: Vec<(String, DateTime<Utc>)> = Vec::new();
    let entries = match std::fs::read_dir(family) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("cleanup: cannot list {}: {e}", family.display());
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        match entry.metadata().and_then(|m| m.modified()) {
            Ok(modified) => versions.push((name, DateTime::<Utc>::from(modified))),
            Err(e) => log::warn!("cleanup: no mtime for {}: {e}", path.display()),
        }
    }

    let keep = compute_keep_set(&versions, policy.retain_versions, cutoff);
    for (name, _) in &versions {
        if keep.contains(name) {
            continue;
        }
        let victim = family.join(name);
        clear_readonly(&victim);
        match std::fs::remove_dir_all(&victim) {
            Ok(()) => log::info!("cleanup: removed {}", victim.display()),
            Err(e) => log::warn!("cleanup: failed to remove {}: {e}", victim.display()),
        }
    }
    remove_if_empty(family);
}

/// Best-effort: deletion on some platforms refuses read-only files.
fn clear_readonly(path: &Path) {
    let Ok(metadata) = path.metadata() else {
        return;
    };
    let mut perms = metadata.permissions();
    if perms.readonly() {
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
        let _ = std::fs::set_permissions(path, perms);
    }
    if path.is_dir() {
        if let Ok(entries) = std::fs::read_dir(path) {
            for entry in entries.flatten() {
                clear_readonly(&entry.path());
            }
        }
    }
}

fn remove_if_empty(dir: &Path) {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => {
            if entries.next().is_none() {
                if let Err(e) = std::fs::remove_dir(dir) {
                    log::warn!("cleanup: failed to remove empty {}: {e}", dir.display());
                }
            }
        }
        Err(e) => log::warn!("cleanup: cannot list {}: {e}", dir.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn policy(enabled: bool, versions: i64, days: i64) -> RetentionPolicy {
        RetentionPolicy {
            enabled,
            environment: None,
            retain_deployed_versions: versions,
            retain_days: days,
        }
    }

    #[test]
    fn aggregation_takes_field_wise_maximum() {
        let effective =
            aggregate_policies(&[policy(true, 2, 0), policy(true, 0, 7)]).unwrap();
        assert_eq!(
            effective,
            EffectivePolicy {
                retain_versions: 2,
                retain_days: 7
            }
        );
    }

    #[test]
    fn disabled_policies_are_ignored() {
        assert!(aggregate_policies(&[policy(false, 9, 9)]).is_none());
        let effective =
            aggregate_policies(&[policy(false, 9, 9), policy(true, 1, 1)]).unwrap();
        assert_eq!(effective.retain_versions, 1);
    }

    #[test]
    fn negative_values_clamp_to_zero() {
        let effective = aggregate_policies(&[policy(true, -5, -3)]).unwrap();
        assert_eq!(
            effective,
            EffectivePolicy {
                retain_versions: 0,
                retain_days: 0
            }
        );
    }

    #[test]
    fn keep_set_is_union_of_count_and_age() {
        // versions aged 1, 5, 10 and 30 days against (k=2, d=7)
        let now = Utc::now();
        let versions = vec![
            ("v4".to_string(), now - Duration::days(1)),
            ("v3".to_string(), now - Duration::days(5)),
            ("v2".to_string(), now - Duration::days(10)),
            ("v1".to_string(), now - Duration::days(30)),
        ];
        let keep = compute_keep_set(&versions, 2, now - Duration::days(7));
        assert_eq!(
            keep,
            HashSet::from(["v4".to_string(), "v3".to_string()])
        );
    }

    #[test]
    fn count_keeps_old_versions_age_would_drop() {
        let now = Utc::now();
        let versions = vec![
            ("old".to_string(), now - Duration::days(100)),
            ("older".to_string(), now - Duration::days(200)),
        ];
        let keep = compute_keep_set(&versions, 1, now - Duration::days(7));
        assert_eq!(keep, HashSet::from(["old".to_string()]));
    }

    #[test]
    fn zero_policy_keeps_nothing_old() {
        let now = Utc::now();
        let versions = vec![("v1".to_string(), now - Duration::days(3))];
        let keep = compute_keep_set(&versions, 0, now);
        assert!(keep.is_empty());
    }
}
