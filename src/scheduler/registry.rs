use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::Clock;
use crate::error::{FarmError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Busy,
    Offline,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Online => write!(f, "online"),
            NodeStatus::Busy => write!(f, "busy"),
            NodeStatus::Offline => write!(f, "offline"),
        }
    }
}

/// A render worker as last seen by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub address: String,
    pub status: NodeStatus,
    pub capabilities: BTreeSet<String>,
    /// Utilisation fraction reported with the last heartbeat.
    pub load: f64,
    /// Free-form host details (cpu, gpu, ...).
    pub info: Map<String, Value>,
    pub first_seen: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Node {
    pub fn is_alive(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_heartbeat <= timeout
    }
}

/// What a node reports on every heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: String,
    #[serde(default)]
    pub address: String,
    /// Omitted keeps the set from earlier heartbeats; an empty list clears it.
    #[serde(default)]
    pub capabilities: Option<BTreeSet<String>>,
    #[serde(default)]
    pub load: f64,
    #[serde(default)]
    pub info: Map<String, Value>,
}

impl Heartbeat {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = Some(capabilities.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_load(mut self, load: f64) -> Self {
        self.load = load;
        self
    }

    fn status(&self) -> NodeStatus {
        if self.load >= 1.0 {
            NodeStatus::Busy
        } else {
            NodeStatus::Online
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub node_id: String,
    pub status: NodeStatus,
    /// True when this heartbeat registered the node.
    pub joined: bool,
}

/// Tracks worker liveness. Each node entry is updated under its own shard
/// lock, so heartbeats from different nodes never contend on a global lock.
#[derive(Debug)]
pub struct NodeRegistry {
    nodes: DashMap<String, Node>,
    heartbeat_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl NodeRegistry {
    pub fn new(heartbeat_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            nodes: DashMap::new(),
            heartbeat_timeout,
            clock,
        }
    }

    /// Upsert a node. Unknown nodes are registered silently.
    pub fn heartbeat(&self, hb: Heartbeat) -> HeartbeatAck {
        let now = self.clock.now();
        let status = hb.status();
        let mut joined = false;

        self.nodes
            .entry(hb.node_id.clone())
            .and_modify(|node| {
                if node.status == NodeStatus::Offline {
                    tracing::info!(node_id = %node.id, "Node back online");
                }
                node.last_heartbeat = now;
                node.status = status;
                node.load = hb.load;
                if let Some(capabilities) = &hb.capabilities {
                    node.capabilities = capabilities.clone();
                }
                if !hb.address.is_empty() {
                    node.address = hb.address.clone();
                }
                if !hb.info.is_empty() {
                    node.info = hb.info.clone();
                }
            })
            .or_insert_with(|| {
                joined = true;
                tracing::info!(node_id = %hb.node_id, address = %hb.address, "Node registered");
                Node {
                    id: hb.node_id.clone(),
                    address: hb.address.clone(),
                    status,
                    capabilities: hb.capabilities.clone().unwrap_or_default(),
                    load: hb.load,
                    info: hb.info.clone(),
                    first_seen: now,
                    last_heartbeat: now,
                }
            });

        HeartbeatAck {
            node_id: hb.node_id,
            status,
            joined,
        }
    }

    /// All known nodes, offline ones included, after a liveness sweep.
    pub fn list(&self) -> Vec<Node> {
        self.sweep();
        let mut nodes: Vec<Node> = self.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn get(&self, node_id: &str) -> Result<Node> {
        self.nodes
            .get(node_id)
            .map(|n| n.value().clone())
            .ok_or_else(|| FarmError::NodeNotFound(node_id.to_string()))
    }

    pub fn mark_offline(&self, node_id: &str) -> Result<()> {
        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| FarmError::NodeNotFound(node_id.to_string()))?;
        if node.status != NodeStatus::Offline {
            node.status = NodeStatus::Offline;
            tracing::info!(node_id, "Node marked offline");
        }
        Ok(())
    }

    /// Manual removal; the only way a node record is deleted.
    pub fn decommission(&self, node_id: &str) -> Result<Node> {
        let (_, node) = self
            .nodes
            .remove(node_id)
            .ok_or_else(|| FarmError::NodeNotFound(node_id.to_string()))?;
        tracing::info!(node_id, "Node decommissioned");
        Ok(node)
    }

    /// Mark nodes offline whose heartbeat is older than the timeout.
    /// Returns the ids that flipped.
    pub fn sweep(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut flipped = Vec::new();
        for mut node in self.nodes.iter_mut() {
            if node.status != NodeStatus::Offline && !node.is_alive(now, self.heartbeat_timeout) {
                node.status = NodeStatus::Offline;
                tracing::warn!(
                    node_id = %node.id,
                    last_heartbeat = %node.last_heartbeat,
                    "Heartbeat timed out, node offline"
                );
                flipped.push(node.id.clone());
            }
        }
        flipped
    }

    /// Known, not offline and heartbeating within the timeout.
    pub fn is_eligible(&self, node_id: &str) -> bool {
        let now = self.clock.now();
        self.nodes.get(node_id).is_some_and(|node| {
            node.status != NodeStatus::Offline && node.is_alive(now, self.heartbeat_timeout)
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
