// Host resolver - expands a batch target into concrete hosts

use std::collections::HashSet;
use std::sync::Arc;

use super::{GroupDirectory, HostDirectory, HostId, ResolvedHost};
use crate::output::errors::{BatchError, Result};
use crate::store::TargetSpec;

/// Turns a target spec into a deduplicated, ordered host list.
///
/// Group membership is read on every call, so edits made between
/// submission and start are honored.
#[derive(Clone)]
pub struct HostResolver {
    hosts: Arc<dyn HostDirectory>,
    groups: Arc<dyn GroupDirectory>,
}

impl HostResolver {
    pub fn new(hosts: Arc<dyn HostDirectory>, groups: Arc<dyn GroupDirectory>) -> Self {
        HostResolver { hosts, groups }
    }

    pub async fn resolve(&self, target: &TargetSpec) -> Result<Vec<ResolvedHost>> {
        let ids = match target {
            TargetSpec::Hosts(ids) => ids.clone(),
            TargetSpec::Group(group) => self
                .groups
                .resolve_group_members(group)
                .await?
                .ok_or_else(|| BatchError::Resolution(format!("unknown server group '{}'", group)))?,
        };

        let ids = dedup_preserving_order(ids);
        if ids.is_empty() {
            return Err(BatchError::EmptyTarget);
        }

        // Partial target lists are not supported: one unknown id fails the batch
        let mut resolved = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.hosts.resolve_host(id).await? {
                Some(host) => resolved.push(host),
                None => {
                    return Err(BatchError::Resolution(format!("unknown host '{}'", id)));
                }
            }
        }

        Ok(resolved)
    }
}

fn dedup_preserving_order(ids: Vec<HostId>) -> Vec<HostId> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::Inventory;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    fn inventory() -> Arc<Inventory> {
        let mut inv = Inventory::new();
        for id in ["1", "2", "3"] {
            inv.add_host(ResolvedHost::for_test(id));
        }
        inv.add_group("web", vec!["2".into(), "1".into(), "2".into()]);
        inv.add_group("empty", vec![]);
        inv.add_group("stale", vec!["1".into(), "42".into()]);
        Arc::new(inv)
    }

    fn resolver() -> HostResolver {
        let inv = inventory();
        HostResolver::new(inv.clone(), inv)
    }

    fn ids(hosts: &[ResolvedHost]) -> Vec<&str> {
        hosts.iter().map(|h| h.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_explicit_ids_dedup_first_seen() {
        let target = TargetSpec::Hosts(vec!["3".into(), "1".into(), "3".into(), "2".into()]);
        let hosts = resolver().resolve(&target).await.unwrap();
        assert_eq!(ids(&hosts), vec!["3", "1", "2"]);
    }

    #[tokio::test]
    async fn test_resolution_is_idempotent() {
        let target = TargetSpec::Hosts(vec!["2".into(), "1".into()]);
        let r = resolver();
        let first = r.resolve(&target).await.unwrap();
        let second = r.resolve(&target).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_group_expansion() {
        let hosts = resolver()
            .resolve(&TargetSpec::Group("web".into()))
            .await
            .unwrap();
        assert_eq!(ids(&hosts), vec!["2", "1"]);
    }

    #[tokio::test]
    async fn test_resolution_errors() {
        let r = resolver();
        assert!(matches!(
            r.resolve(&TargetSpec::Group("nope".into())).await,
            Err(BatchError::Resolution(_))
        ));
        assert!(matches!(
            r.resolve(&TargetSpec::Group("empty".into())).await,
            Err(BatchError::EmptyTarget)
        ));
        assert!(matches!(
            r.resolve(&TargetSpec::Group("stale".into())).await,
            Err(BatchError::Resolution(_))
        ));
    }

    struct MutableGroups(Mutex<Vec<HostId>>);

    #[async_trait]
    impl GroupDirectory for MutableGroups {
        async fn resolve_group_members(&self, _group: &str) -> Result<Option<Vec<HostId>>> {
            Ok(Some(self.0.lock().clone()))
        }
    }

    #[tokio::test]
    async fn test_group_membership_read_at_resolution_time() {
        let groups = Arc::new(MutableGroups(Mutex::new(vec!["1".into()])));
        let r = HostResolver::new(inventory(), groups.clone());
        let target = TargetSpec::Group("web".into());

        assert_eq!(ids(&r.resolve(&target).await.unwrap()), vec!["1"]);
        groups.0.lock().push("3".into());
        assert_eq!(ids(&r.resolve(&target).await.unwrap()), vec!["1", "3"]);
    }
}
