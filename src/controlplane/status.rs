//! Status Manager
//!
//! Read-only aggregation of node rows into per-pool counts. Nothing is
//! cached: every call reads the store, so a status taken after a task's
//! storage write was acknowledged always reflects that write.

use crate::domain::{NodeModel, PoolStatus, StorageRef};
use crate::error::Result;

pub struct StatusManager {
    store: StorageRef,
}

impl StatusManager {
    pub fn new(store: StorageRef) -> Self {
        Self { store }
    }

    /// Counts for one pool
    pub async fn pool_status(&self, pool_id: &str) -> Result<PoolStatus> {
        let nodes = self.store.list_nodes(pool_id).await?;
        Ok(summarize(pool_id, &nodes))
    }

    /// Counts for every pool that owns node rows
    pub async fn list_all_pool_statuses(&self) -> Result<Vec<PoolStatus>> {
        let pool_ids = self.store.pool_ids().await?;
        let statuses = futures::future::try_join_all(
            pool_ids.iter().map(|pool_id| self.pool_status(pool_id)),
        )
        .await?;
        Ok(statuses)
    }
}

/// Fold node rows into a [`PoolStatus`]
pub fn summarize(pool_id: &str, nodes: &[NodeModel]) -> PoolStatus {
    let mut status = PoolStatus {
        pool_id: pool_id.to_string(),
        ..Default::default()
    };

    for node in nodes {
        status.total_nodes += 1;
        *status.counts.entry(node.status).or_insert(0) += 1;
        if node.occupied {
            status.occupied_nodes += 1;
        } else if node.status.is_claimable() {
            status.available_nodes += 1;
        }
    }

    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewNode, NodeStatus, Storage};
    use crate::storage::MemoryStore;
    use std::sync::Arc;

    async fn seed(store: &MemoryStore, pool: &str, status: NodeStatus) {
        store
            .insert_node(NewNode {
                status,
                ..NewNode::creating(pool)
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pool_status_counts() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "p1", NodeStatus::Created).await;
        seed(&store, "p1", NodeStatus::Running).await;
        seed(&store, "p1", NodeStatus::Running).await;
        seed(&store, "p1", NodeStatus::Error).await;
        seed(&store, "p2", NodeStatus::Creating).await;
        store.claim_idle_node("p1").await.unwrap().unwrap();

        let manager = StatusManager::new(store.clone());
        let status = manager.pool_status("p1").await.unwrap();

        assert_eq!(status.total_nodes, 4);
        assert_eq!(status.count(NodeStatus::Running), 1);
        assert_eq!(status.count(NodeStatus::Occupied), 1);
        assert_eq!(status.count(NodeStatus::Created), 1);
        assert_eq!(status.count(NodeStatus::Deleted), 0);
        assert_eq!(status.available_nodes, 1);
        assert_eq!(status.occupied_nodes, 1);
    }

    #[tokio::test]
    async fn test_status_reflects_writes_immediately() {
        let store = Arc::new(MemoryStore::new());
        let manager = StatusManager::new(store.clone());
        assert_eq!(manager.pool_status("p1").await.unwrap().total_nodes, 0);

        seed(&store, "p1", NodeStatus::Running).await;
        assert_eq!(manager.pool_status("p1").await.unwrap().available_nodes, 1);
    }

    #[tokio::test]
    async fn test_list_all_pool_statuses() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "p1", NodeStatus::Created).await;
        seed(&store, "p2", NodeStatus::Running).await;
        seed(&store, "p2", NodeStatus::Running).await;

        let manager = StatusManager::new(store);
        let all = manager.list_all_pool_statuses().await.unwrap();
        let totals: Vec<_> = all.iter().map(|s| (s.pool_id.as_str(), s.total_nodes)).collect();
        assert_eq!(totals, vec![("p1", 1), ("p2", 2)]);
    }
}
