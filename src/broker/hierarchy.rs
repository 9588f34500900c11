//! Hierarchy placement collaborator.
//!
//! Domain, cluster and channel grouping is decided elsewhere. After a
//! connection binds, the broker asks a [`HierarchyAssigner`] for a
//! placement and applies whatever comes back to that record only.

use async_trait::async_trait;

use crate::ipc::protocol::HierarchyAssignment;

#[async_trait]
pub trait HierarchyAssigner: Send + Sync {
    /// Placement for a freshly bound `(node_id, client_id)`, if any.
    async fn assign(&self, node_id: &str, client_id: &str) -> Option<HierarchyAssignment>;
}

/// Assigns nothing; agents keep whatever they registered with.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHierarchy;

#[async_trait]
impl HierarchyAssigner for NoHierarchy {
    async fn assign(&self, _node_id: &str, _client_id: &str) -> Option<HierarchyAssignment> {
        None
    }
}

/// Places every node in the same configured domain/cluster/channel.
/// The first node seen in a group is not promoted to main; that stays
/// with the grouping service.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FixedHierarchy {
    pub domain_id: Option<String>,
    pub cluster_id: Option<String>,
    pub channel_id: Option<String>,
}

impl FixedHierarchy {
    pub fn is_empty(&self) -> bool {
        self.domain_id.is_none() && self.cluster_id.is_none() && self.channel_id.is_none()
    }
}

#[async_trait]
impl HierarchyAssigner for FixedHierarchy {
    async fn assign(&self, node_id: &str, _client_id: &str) -> Option<HierarchyAssignment> {
        if self.is_empty() {
            return None;
        }
        Some(HierarchyAssignment {
            node_id: node_id.to_owned(),
            domain_id: self.domain_id.clone(),
            cluster_id: self.cluster_id.clone(),
            channel_id: self.channel_id.clone(),
            ..HierarchyAssignment::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_hierarchy_assigns_nothing() {
        assert!(NoHierarchy.assign("n1", "c1").await.is_none());
    }

    #[tokio::test]
    async fn fixed_hierarchy_targets_the_node() {
        let fixed = FixedHierarchy {
            domain_id: Some("d1".into()),
            ..FixedHierarchy::default()
        };
        let a = fixed.assign("n7", "c1").await.unwrap();
        assert_eq!(a.node_id, "n7");
        assert_eq!(a.domain_id.as_deref(), Some("d1"));
        assert_eq!(a.cluster_id, None);
        assert!(!a.is_domain_main);
    }

    #[tokio::test]
    async fn empty_fixed_hierarchy_assigns_nothing() {
        assert!(FixedHierarchy::default().assign("n1", "c1").await.is_none());
    }
}
