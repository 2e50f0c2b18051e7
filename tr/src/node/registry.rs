//! Active nodes registry
//!
//! The registry is the only shared mutable resource per node. Backends must
//! make `get` → mutate → `update` atomic per node id; [`NodesRegistry::lock_node`]
//! hands out the guard the facade holds for the whole cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex, RwLock};
use tracing::{debug, info};

use super::{Node, NodeId};
use crate::error::{RelayError, RelayResult};

/// Exclusive access to one node id for the lifetime of the guard
pub struct NodeGuard {
    _guard: ArcMutexGuard<RawMutex, ()>,
}

impl NodeGuard {
    pub fn new(lock: &Arc<Mutex<()>>) -> Self {
        Self {
            _guard: lock.lock_arc(),
        }
    }
}

/// Storage contract for registered nodes
pub trait NodesRegistry: Send + Sync {
    /// Store a freshly registered node
    fn add(&self, node: Node) -> RelayResult<()>;

    /// Fetch a node; unknown ids fail with [`RelayError::NotRegistered`]
    fn get(&self, id: &NodeId) -> RelayResult<Node>;

    /// Persist a mutated node; evicted nodes are not resurrected
    fn update(&self, node: &Node) -> RelayResult<()>;

    /// Remove a node; unknown ids fail with [`RelayError::NotRegistered`]
    fn delete(&self, id: &NodeId) -> RelayResult<()>;

    /// Evict nodes idle for longer than [`NodesRegistry::timeout`], returning how many
    fn clean(&self) -> RelayResult<usize>;

    /// Serialize read-modify-write cycles on one node id
    fn lock_node(&self, id: &NodeId) -> NodeGuard;

    fn timeout(&self) -> Duration;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_ok()
    }
}

/// In-process registry for single-process deployments
pub struct MemoryNodesRegistry {
    timeout: Duration,
    nodes: RwLock<HashMap<NodeId, Node>>,
    locks: Mutex<HashMap<NodeId, Arc<Mutex<()>>>>,
}

impl MemoryNodesRegistry {
    pub fn new(timeout: Duration) -> Self {
        debug!(?timeout, "MemoryNodesRegistry::new: called");
        Self {
            timeout,
            nodes: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn prune_locks(&self) {
        let nodes = self.nodes.read();
        self.locks
            .lock()
            .retain(|id, lock| nodes.contains_key(id) || Arc::strong_count(lock) > 1);
    }
}

impl NodesRegistry for MemoryNodesRegistry {
    fn add(&self, node: Node) -> RelayResult<()> {
        debug!(node_id = %node.id(), "MemoryNodesRegistry::add: called");
        let mut nodes = self.nodes.write();
        if nodes.contains_key(node.id()) {
            return Err(RelayError::Registry(format!("Node \"{}\" is already registered", node.id())));
        }
        let mut node = node;
        node.mark_clean();
        nodes.insert(*node.id(), node);
        Ok(())
    }

    fn get(&self, id: &NodeId) -> RelayResult<Node> {
        self.nodes
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RelayError::NotRegistered(id.to_string()))
    }

    fn update(&self, node: &Node) -> RelayResult<()> {
        debug!(node_id = %node.id(), "MemoryNodesRegistry::update: called");
        let mut nodes = self.nodes.write();
        let slot = nodes
            .get_mut(node.id())
            .ok_or_else(|| RelayError::NotRegistered(node.id().to_string()))?;
        let mut stored = node.clone();
        stored.mark_clean();
        *slot = stored;
        Ok(())
    }

    fn delete(&self, id: &NodeId) -> RelayResult<()> {
        debug!(node_id = %id, "MemoryNodesRegistry::delete: called");
        self.nodes
            .write()
            .remove(id)
            .ok_or_else(|| RelayError::NotRegistered(id.to_string()))?;
        self.prune_locks();
        Ok(())
    }

    fn clean(&self) -> RelayResult<usize> {
        let now = Utc::now();
        let evicted = {
            let mut nodes = self.nodes.write();
            let before = nodes.len();
            nodes.retain(|_, node| !node.is_expired(self.timeout, now));
            before - nodes.len()
        };
        self.prune_locks();

        if evicted > 0 {
            info!(evicted, timeout = ?self.timeout, "Evicted idle nodes");
        }
        Ok(evicted)
    }

    fn lock_node(&self, id: &NodeId) -> NodeGuard {
        // Unknown ids get a private lock; their request fails at `get` anyway
        let known = self.nodes.read().contains_key(id);
        let lock = {
            let mut locks = self.locks.lock();
            match locks.get(id) {
                Some(lock) => lock.clone(),
                None if known => locks.entry(*id).or_default().clone(),
                None => Arc::new(Mutex::new(())),
            }
        };
        NodeGuard::new(&lock)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn len(&self) -> usize {
        self.nodes.read().len()
    }
}
