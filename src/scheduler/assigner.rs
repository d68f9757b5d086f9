use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::job::{Task, TaskId};
use crate::scheduler::registry::NodeRegistry;
use crate::scheduler::store::JobStore;

/// A live claim of a node on a task. Derived from the task's
/// `assigned_node` and lease expiry, never stored on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: TaskId,
    pub node_id: String,
    pub lease_expiry: DateTime<Utc>,
}

/// Hands pending tasks to live nodes.
///
/// Selection is strict FIFO over task creation order: the first pending task
/// whose capability requirement the node satisfies wins. The claim itself is
/// per task, so two nodes acquiring at once only contend when they race for
/// the same task, and the loser moves on to the next candidate.
#[derive(Debug, Clone)]
pub struct Assigner {
    store: Arc<JobStore>,
    nodes: Arc<NodeRegistry>,
}

impl Assigner {
    pub fn new(store: Arc<JobStore>, nodes: Arc<NodeRegistry>) -> Self {
        Self { store, nodes }
    }

    /// Lease the next eligible task to `node_id`. `None` when the node is
    /// unknown or offline, or nothing it can run is pending.
    pub fn acquire(&self, node_id: &str, capabilities: &BTreeSet<String>) -> Option<Task> {
        if !self.nodes.is_eligible(node_id) {
            tracing::debug!(node_id, "Acquire from ineligible node");
            return None;
        }
        self.reclaim_expired();

        let claimed = self.store.claim_next(node_id, capabilities);
        if claimed.is_none() {
            tracing::debug!(node_id, "No eligible task");
        }
        claimed
    }

    /// Pending tasks after recovering expired leases.
    pub fn list_pending(&self, limit: Option<usize>) -> Vec<Task> {
        self.reclaim_expired();
        self.store.list_pending(limit)
    }

    pub fn reclaim_expired(&self) -> Vec<TaskId> {
        let reclaimed = self.store.reclaim_expired();
        if !reclaimed.is_empty() {
            tracing::info!(count = reclaimed.len(), "Reclaimed expired leases");
        }
        reclaimed
    }

    /// Current assignments, recomputed from the tasks.
    pub fn assignments(&self) -> Vec<Assignment> {
        self.store
            .in_flight()
            .into_iter()
            .filter_map(|task| {
                Some(Assignment {
                    task_id: task.task_id,
                    node_id: task.assigned_node?,
                    lease_expiry: task.lease_expires_at?,
                })
            })
            .collect()
    }
}
