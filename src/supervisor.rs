//! Owns the set of nodes running in this process and their lifecycle.
//!
//! Mirrors the teacher's notion of a top-level object that starts a fixed
//! set of workers and can stop them all on shutdown, generalized with a
//! registry so that a leader's `ADD-NODE <host:port>` can spin up another
//! node in this same process when the address is local (see `4.5 Cluster
//! Supervisor` in SPEC_FULL.md). Nodes added on a remote host are simply
//! addressed over the network; nothing here tries to reach out and launch a
//! process on another machine.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::error::RaftError;
use crate::node::{normalize_host, Node};

pub struct ClusterSupervisor {
    bind_host: String,
    nodes: Mutex<HashMap<u16, Arc<Node>>>,
}

impl ClusterSupervisor {
    pub fn new(bind_host: impl Into<String>) -> Arc<ClusterSupervisor> {
        Arc::new(ClusterSupervisor { bind_host: normalize_host(&bind_host.into()), nodes: Mutex::new(HashMap::new()) })
    }

    /// Boots a node for every port in `ports`, wiring each one's peer set to
    /// every other configured port (a full mesh, as the original bootstrap
    /// always launches a fully connected cluster).
    pub fn bootstrap(self: &Arc<Self>, ports: &[u16]) -> Result<Vec<Arc<Node>>, RaftError> {
        let mut started = Vec::new();
        for &port in ports {
            let peers = ports
                .iter()
                .filter(|&&p| p != port)
                .map(|&p| {
                    let addr: SocketAddr = format!("{}:{p}", self.bind_host).parse().expect("valid bootstrap address");
                    (addr.to_string(), addr)
                })
                .collect();
            started.push(self.spawn_node(port, peers)?);
        }
        Ok(started)
    }

    fn spawn_node(self: &Arc<Self>, port: u16, peers: HashMap<String, SocketAddr>) -> Result<Arc<Node>, RaftError> {
        let node = Arc::new(Node::new(&self.bind_host, port, peers, Some(Arc::downgrade(self)))?);
        node.start();
        self.nodes.lock().unwrap().insert(port, node.clone());
        Ok(node)
    }

    /// Called after a leader accepts a new peer address: if that address
    /// names a port on this same host that isn't already running here, spin
    /// up a node for it in this process, seeded with `peers_for_new_node` as
    /// its initial peer set.
    pub fn maybe_spawn_local(self: &Arc<Self>, addr_str: &str, peers_for_new_node: HashMap<String, SocketAddr>) {
        let Ok(addr) = addr_str.parse::<SocketAddr>() else { return };
        if addr.ip().to_string() != self.bind_host {
            return;
        }
        if self.nodes.lock().unwrap().contains_key(&addr.port()) {
            return;
        }
        match self.spawn_node(addr.port(), peers_for_new_node) {
            Ok(node) => info!("{}: spawned in-process for {addr_str}", node.id),
            Err(e) => warn!("failed to spawn in-process node for {addr_str}: {e}"),
        }
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.lock().unwrap().values().cloned().collect()
    }

    pub fn stop_all(&self) {
        for node in self.nodes.lock().unwrap().values() {
            node.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_wires_a_full_mesh_and_starts_every_node() {
        let supervisor = ClusterSupervisor::new("127.0.0.1");
        let nodes = supervisor.bootstrap(&[21100, 21101, 21102]).unwrap();
        assert_eq!(nodes.len(), 3);
        for node in &nodes {
            assert!(node.is_running());
        }
        supervisor.stop_all();
    }
}
