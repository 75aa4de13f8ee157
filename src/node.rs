//! The consensus engine: election driver, heartbeat driver, append-entries
//! producer, message dispatcher, commit advancer and membership mutator.
//!
//! This is the hard center of the crate (see `PURPOSE & SCOPE` in
//! SPEC_FULL.md). `Node` owns exactly one state lock (`state`) and one log
//! lock (`log`), mirroring the teacher's `ServerState`/`Log` split; no
//! operation holds either lock across a blocking I/O call.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use log::{debug, info, warn};

use crate::clock;
use crate::constants::{CLIENT_PORT_OFFSET, ELECTION_WATCHDOG_INTERVAL, HEARTBEAT_INTERVAL, SOCKET_POLL_TIMEOUT};
use crate::error::RaftError;
use crate::log::{Log, LogEntry, MemoryLog, Operation};
use crate::message::{build_append_entries, PeerMessage};
use crate::peer::PeerHandle;
use crate::state::{NodeState, Role};
use crate::supervisor::ClusterSupervisor;

/// "localhost" always resolves to the loopback IPv4 address here, so every
/// node in an in-process cluster agrees on the same literal address string
/// for itself regardless of how the local resolver feels that day.
pub fn normalize_host(host: &str) -> String {
    if host == "localhost" {
        "127.0.0.1".to_string()
    } else {
        host.to_string()
    }
}

/// Parses a `host:port` address given to `ADD-NODE`/`REMOVE-NODE`,
/// normalizing the host the same way a node normalizes its own bind host so
/// `localhost:<port>` and `127.0.0.1:<port>` name the same peer.
pub fn parse_peer_address(addr_str: &str) -> Result<SocketAddr, RaftError> {
    let (host, port) = addr_str.rsplit_once(':').ok_or_else(|| RaftError::InvalidAddress(addr_str.to_string()))?;
    format!("{}:{port}", normalize_host(host))
        .parse()
        .map_err(|_| RaftError::InvalidAddress(addr_str.to_string()))
}

pub struct Node {
    /// Canonical identity of this node: the address its peer (raft) channel
    /// is bound to, formatted as `host:port`. Used as the `candidate_id` /
    /// `leader_id` / `node_id` / `voter_id` carried on the wire, and as the
    /// key other nodes store it under in their own peer maps.
    pub id: String,
    pub addr: SocketAddr,
    client_addr: SocketAddr,
    state: Mutex<NodeState>,
    log: Mutex<MemoryLog>,
    peer_handles: Mutex<HashMap<String, PeerHandle>>,
    socket: Arc<UdpSocket>,
    client_listener: TcpListener,
    running: AtomicBool,
    supervisor: Option<Weak<ClusterSupervisor>>,
}

impl Node {
    pub fn new(
        host: &str,
        port: u16,
        peers: HashMap<String, SocketAddr>,
        supervisor: Option<Weak<ClusterSupervisor>>,
    ) -> Result<Node, RaftError> {
        let host = normalize_host(host);
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|_| RaftError::InvalidAddress(format!("{host}:{port}")))?;
        let client_port: u16 = (port as u32 + CLIENT_PORT_OFFSET as u32)
            .try_into()
            .map_err(|_| RaftError::InvalidAddress(format!("{host}:{port}")))?;
        let client_addr: SocketAddr = format!("{host}:{client_port}")
            .parse()
            .expect("host:port is always a valid socket address");

        let socket = Arc::new(UdpSocket::bind(addr)?);
        socket.set_read_timeout(Some(SOCKET_POLL_TIMEOUT))?;
        let client_listener = TcpListener::bind(client_addr)?;

        let id = addr.to_string();
        let mut peer_handles = HashMap::new();
        for (peer_id, peer_addr) in &peers {
            peer_handles.insert(
                peer_id.clone(),
                PeerHandle::start(peer_id.clone(), *peer_addr, socket.clone(), id.clone()),
            );
        }

        info!("{id}: started (raft on {addr}, client on {client_addr})");

        Ok(Node {
            id,
            addr,
            client_addr,
            state: Mutex::new(NodeState::new(peers)),
            log: Mutex::new(MemoryLog::new()),
            peer_handles: Mutex::new(peer_handles),
            socket,
            client_listener,
            running: AtomicBool::new(false),
            supervisor,
        })
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn role(&self) -> Role {
        self.state.lock().unwrap().role
    }

    pub fn current_term(&self) -> u64 {
        self.state.lock().unwrap().current_term
    }

    pub fn leader_hint(&self) -> Option<String> {
        self.state.lock().unwrap().leader_hint.clone()
    }

    /// Spawns the four worker threads (dispatcher, heartbeat driver,
    /// election watchdog, client acceptor) described in `4.5 Cluster
    /// Supervisor`.
    pub fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let n = self.clone();
        thread::spawn(move || n.dispatcher_loop());
        let n = self.clone();
        thread::spawn(move || n.heartbeat_loop());
        let n = self.clone();
        thread::spawn(move || n.election_watchdog_loop());
        let n = self.clone();
        thread::spawn(move || n.client_acceptor_loop());
    }

    /// Sets `running` false and closes both sockets idempotently so the
    /// worker loops observe the closure and exit. Does not block on the
    /// worker threads joining: a node can be asked to stop from inside its
    /// own dispatcher thread (e.g. a `stop_node` message) where joining that
    /// very thread would deadlock.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("{}: stopping", self.id);
        }
        // Wake a blocked accept() with a throwaway local connection; the
        // acceptor loop re-checks `running` immediately after accept()
        // returns and exits without handling it.
        if let Ok(stream) = TcpStream::connect(self.client_addr) {
            drop(stream);
        }
        // The UDP dispatcher wakes on its own read timeout (see
        // SOCKET_POLL_TIMEOUT) and observes `running` there.
    }

    // ---- worker loops -----------------------------------------------

    fn dispatcher_loop(self: Arc<Self>) {
        let mut buf = [0u8; 4096];
        while self.is_running() {
            match self.socket.recv_from(&mut buf) {
                Ok((n, src)) => match PeerMessage::decode(&buf[..n]) {
                    Ok(msg) => self.handle_message(msg, src),
                    Err(e) => warn!("{}: malformed peer message from {src}: {e}", self.id),
                },
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue
                }
                Err(e) => {
                    if self.is_running() {
                        warn!("{}: peer socket error: {e}", self.id);
                    }
                }
            }
        }
    }

    fn heartbeat_loop(self: Arc<Self>) {
        while self.is_running() {
            thread::sleep(HEARTBEAT_INTERVAL);
            if !self.is_running() {
                break;
            }
            if self.role() == Role::Leader {
                self.send_append_entries_round();
            }
        }
    }

    fn election_watchdog_loop(self: Arc<Self>) {
        while self.is_running() {
            thread::sleep(ELECTION_WATCHDOG_INTERVAL);
            if !self.is_running() {
                break;
            }
            let should_start = {
                let state = self.state.lock().unwrap();
                state.role != Role::Leader && state.has_election_timeout_elapsed()
            };
            if should_start {
                self.start_election();
            }
        }
    }

    fn client_acceptor_loop(self: Arc<Self>) {
        while self.is_running() {
            match self.client_listener.accept() {
                Ok((stream, addr)) => {
                    if !self.is_running() {
                        break;
                    }
                    let node = self.clone();
                    thread::spawn(move || crate::gateway::handle_client(node, stream, addr));
                }
                Err(e) => {
                    if self.is_running() {
                        warn!("{}: client accept error: {e}", self.id);
                    }
                }
            }
        }
    }

    // ---- outbound sends -----------------------------------------------

    fn reply(&self, message: PeerMessage, dest: SocketAddr) {
        let bytes = message.encode();
        if let Err(e) = self.socket.send_to(&bytes, dest) {
            warn!("{}: failed to reply to {dest}: {e}", self.id);
        }
    }

    fn broadcast(&self, message: PeerMessage) {
        for handle in self.peer_handles.lock().unwrap().values() {
            handle.send(message.clone());
        }
    }

    // ---- election (4.3.2) ----------------------------------------------

    fn start_election(&self) {
        let (term, last_log_term, last_log_index) = {
            let mut state = self.state.lock().unwrap();
            let term = state.transition_to_candidate(&self.id);
            let log = self.log.lock().unwrap();
            (term, log.last_term(), log.last_index())
        };
        info!("{}: election timeout elapsed, starting election for term {term}", self.id);
        self.broadcast(PeerMessage::RequestVote {
            term,
            candidate_id: self.id.clone(),
            last_log_index,
            last_log_term,
        });
    }

    fn on_became_leader(&self) {
        let term = self.current_term();
        info!("{}: elected leader for term {term}", self.id);
        self.broadcast(PeerMessage::LeaderAnnouncement { term, leader_id: self.id.clone() });
        self.send_append_entries_round();
    }

    // ---- leader replication (4.3.3) ------------------------------------

    /// Sends one append-entries (possibly empty, i.e. a heartbeat) to every
    /// peer based on its current `next_index`. Called on every heartbeat
    /// tick and immediately after a locally accepted mutation.
    fn send_append_entries_round(&self) {
        let (term, leader_commit, next_index) = {
            let state = self.state.lock().unwrap();
            if state.role != Role::Leader {
                return;
            }
            (state.current_term, state.commit_index, state.next_index.clone())
        };
        let log = self.log.lock().unwrap();
        let handles = self.peer_handles.lock().unwrap();
        for (peer_id, handle) in handles.iter() {
            let ni = *next_index.get(peer_id).unwrap_or(&0);
            let prev_log_index = ni as i64 - 1;
            let prev_log_term = if prev_log_index >= 0 {
                log.get(prev_log_index as usize).map(|e| e.term).unwrap_or(0)
            } else {
                0
            };
            let entries = log.entries_from(ni);
            let message = build_append_entries(term, &self.id, prev_log_index, prev_log_term, &entries, leader_commit);
            handle.send(message);
        }
    }

    // ---- client mutation entry point (4.4) -----------------------------

    /// Appends `entry` to the leader's own log, applies it immediately (the
    /// documented relaxation from canonical Raft, kept per the module's
    /// literal step sequence — see DESIGN.md), drives one replication round,
    /// and returns the apply result text.
    pub fn propose(&self, operation: Operation, key: String, value: Option<String>) -> Result<String, String> {
        let (index, result) = {
            let term = self.state.lock().unwrap().current_term;
            let mut log = self.log.lock().unwrap();
            let index = log.append(LogEntry::new(term, operation, key, value));
            let mut results = log.commit_to(index as i64);
            (index, results.pop().expect("we just appended and committed to this index").1)
        };
        debug!("{}: accepted mutation at index {index}", self.id);
        self.send_append_entries_round();
        result.map_err(|e| e.to_string())
    }

    pub fn store_get(&self, key: &str) -> Option<String> {
        self.log.lock().unwrap().store_get(key)
    }

    pub fn store_keys(&self) -> Vec<String> {
        let mut keys = self.log.lock().unwrap().store_keys();
        keys.sort();
        keys
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        let log = self.log.lock().unwrap();
        log.entries_from(0)
    }

    // ---- membership change (4.3.5) -------------------------------------

    pub fn add_node(&self, addr_str: &str) -> Result<String, RaftError> {
        let addr = parse_peer_address(addr_str)?;
        let already_known = {
            let mut state = self.state.lock().unwrap();
            let already_known = state.peers.contains_key(addr_str);
            if !already_known {
                state.peers.insert(addr_str.to_string(), addr);
                state.next_index.insert(addr_str.to_string(), 0);
            }
            already_known
        };
        if !already_known {
            let handle = PeerHandle::start(addr_str.to_string(), addr, self.socket.clone(), self.id.clone());
            self.peer_handles.lock().unwrap().insert(addr_str.to_string(), handle);
            info!("{}: added peer {addr_str}", self.id);

            if let Some(supervisor) = self.supervisor.as_ref().and_then(Weak::upgrade) {
                let mut peers_for_new_node = {
                    let state = self.state.lock().unwrap();
                    state.peers.clone()
                };
                peers_for_new_node.remove(addr_str);
                peers_for_new_node.insert(self.id.clone(), self.addr);
                supervisor.maybe_spawn_local(addr_str, peers_for_new_node);
            }
        }
        Ok(format!("SUCCESS: Node {addr_str} added to cluster."))
    }

    pub fn remove_node(&self, addr_str: &str) -> Result<String, RaftError> {
        parse_peer_address(addr_str)?;
        if addr_str == self.id {
            self.broadcast(PeerMessage::RemoveNode { removed_node: addr_str.to_string() });
            self.stop();
            return Ok(format!("SUCCESS: Node {addr_str} removed from cluster."));
        }
        if let Some(handle) = self.peer_handles.lock().unwrap().get(addr_str) {
            handle.send(PeerMessage::StopNode);
        }
        self.drop_peer(addr_str);
        self.broadcast(PeerMessage::RemoveNode { removed_node: addr_str.to_string() });
        Ok(format!("SUCCESS: Node {addr_str} removed from cluster."))
    }

    fn drop_peer(&self, peer_id: &str) {
        self.peer_handles.lock().unwrap().remove(peer_id);
        let mut state = self.state.lock().unwrap();
        state.peers.remove(peer_id);
        state.next_index.remove(peer_id);
    }

    pub fn cluster_status(&self) -> String {
        let state = self.state.lock().unwrap();
        let mut lines = vec![
            "Cluster status:".to_string(),
            format!("Self: {} ({:?})", self.id, state.role),
            format!("Term: {}", state.current_term),
            format!("Leader: {}", state.leader_hint.clone().unwrap_or_else(|| "unknown".to_string())),
            "Peers:".to_string(),
        ];
        let mut peer_ids: Vec<&String> = state.peers.keys().collect();
        peer_ids.sort();
        for peer_id in peer_ids {
            let ni = state.next_index.get(peer_id).copied().unwrap_or(0);
            lines.push(format!("  {peer_id} (next_index={ni})"));
        }
        lines.join("\n")
    }

    // ---- inbound message dispatch ---------------------------------------

    fn handle_message(&self, message: PeerMessage, src: SocketAddr) {
        if let Some(term) = message.term() {
            let mut state = self.state.lock().unwrap();
            if state.note_term_seen(term) {
                info!("{}: observed higher term {term}, stepping down to follower", self.id);
            }
        }
        match message {
            PeerMessage::RequestVote { term, candidate_id, last_log_index, last_log_term } => {
                self.handle_request_vote(term, candidate_id, last_log_index, last_log_term, src)
            }
            PeerMessage::VoteResponse { term, candidate_id, granted, .. } => {
                self.handle_vote_response(term, candidate_id, granted)
            }
            PeerMessage::LeaderAnnouncement { term, leader_id } => self.handle_leader_contact(term, leader_id),
            PeerMessage::Heartbeat { term, leader_id } => self.handle_leader_contact(term, leader_id),
            PeerMessage::AppendEntries { term, leader_id, prev_log_index, prev_log_term, entries, leader_commit } => {
                self.handle_append_entries(term, leader_id, prev_log_index, prev_log_term, entries, leader_commit, src)
            }
            PeerMessage::AppendEntriesResponse { term, node_id, success, next_index, .. } => {
                self.handle_append_entries_response(term, node_id, success, next_index)
            }
            PeerMessage::RemoveNode { removed_node } => self.handle_remove_node(removed_node),
            PeerMessage::StopNode => self.stop(),
        }
    }

    fn handle_request_vote(&self, term: u64, candidate_id: String, last_log_index: i64, last_log_term: u64, src: SocketAddr) {
        let (reply_term, granted) = {
            let mut state = self.state.lock().unwrap();
            if term < state.current_term {
                (state.current_term, false)
            } else {
                let log = self.log.lock().unwrap();
                let can_vote = matches!(&state.voted_for, None) || state.voted_for.as_deref() == Some(candidate_id.as_str());
                let up_to_date = log.is_up_to_date(last_log_term, last_log_index);
                let granted = can_vote && up_to_date;
                if granted {
                    state.voted_for = Some(candidate_id.clone());
                    state.last_heartbeat = clock::now();
                    info!("{}: voted for {candidate_id} in term {}", self.id, state.current_term);
                }
                (state.current_term, granted)
            }
        };
        self.reply(
            PeerMessage::VoteResponse { term: reply_term, voter_id: self.id.clone(), candidate_id, granted },
            src,
        );
    }

    fn handle_vote_response(&self, term: u64, candidate_id: String, granted: bool) {
        if candidate_id != self.id {
            return;
        }
        let became_leader = {
            let mut state = self.state.lock().unwrap();
            if state.role != Role::Candidate || term != state.current_term || !granted {
                false
            } else {
                state.votes_received += 1;
                if state.has_election_majority() {
                    let log_len = self.log.lock().unwrap().len();
                    state.transition_to_leader(&self.id, log_len);
                    true
                } else {
                    false
                }
            }
        };
        if became_leader {
            self.on_became_leader();
        }
    }

    fn handle_leader_contact(&self, term: u64, leader_id: String) {
        let mut state = self.state.lock().unwrap();
        if term >= state.current_term {
            state.transition_to_follower(term, leader_id);
        }
    }

    fn handle_append_entries(
        &self,
        term: u64,
        leader_id: String,
        prev_log_index: i64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: i64,
        src: SocketAddr,
    ) {
        let current_term = {
            let mut state = self.state.lock().unwrap();
            if term < state.current_term {
                state.current_term
            } else {
                state.transition_to_follower(term, leader_id);
                state.current_term
            }
        };
        if term < current_term {
            self.reply(
                PeerMessage::AppendEntriesResponse {
                    term: current_term,
                    node_id: self.id.clone(),
                    success: false,
                    match_index: 0,
                    next_index: 0,
                },
                src,
            );
            return;
        }

        let mut log = self.log.lock().unwrap();
        let log_len = log.len() as i64;

        if prev_log_index >= log_len {
            let len = log.len();
            drop(log);
            self.reply(
                PeerMessage::AppendEntriesResponse { term: current_term, node_id: self.id.clone(), success: false, match_index: len, next_index: len },
                src,
            );
            return;
        }
        if prev_log_index >= 0 && log.get(prev_log_index as usize).map(|e| e.term) != Some(prev_log_term) {
            let len = log.len();
            drop(log);
            self.reply(
                PeerMessage::AppendEntriesResponse { term: current_term, node_id: self.id.clone(), success: false, match_index: len, next_index: len },
                src,
            );
            return;
        }

        for (i, entry) in entries.into_iter().enumerate() {
            let k = (prev_log_index + 1) as usize + i;
            if k < log.len() {
                if log.get(k).map(|e| e.term) != Some(entry.term) {
                    log.truncate_suffix(k);
                    log.append(entry);
                }
            } else {
                log.append(entry);
            }
        }

        if leader_commit > log.commit_index() {
            let target = leader_commit.min(log.last_index());
            log.commit_to(target);
        }

        let len = log.len();
        drop(log);
        self.reply(
            PeerMessage::AppendEntriesResponse { term: current_term, node_id: self.id.clone(), success: true, match_index: len, next_index: len },
            src,
        );
    }

    fn handle_append_entries_response(&self, term: u64, node_id: String, success: bool, next_index: usize) {
        let commit_target = {
            let mut state = self.state.lock().unwrap();
            if term != state.current_term || state.role != Role::Leader {
                return;
            }
            if success {
                state.next_index.insert(node_id, next_index);
            } else if let Some(ni) = state.next_index.get_mut(&node_id) {
                *ni = ni.saturating_sub(1);
            }

            let current_term = state.current_term;
            let commit_index = state.commit_index;
            let num_nodes = state.peers.len() + 1;
            let peer_next: Vec<usize> = state.next_index.values().copied().collect();
            let log = self.log.lock().unwrap();
            let last_index = log.last_index();
            let mut new_commit = commit_index;
            let mut n = commit_index + 1;
            while n <= last_index {
                if log.get(n as usize).map(|e| e.term) == Some(current_term) {
                    let replicated = 1 + peer_next.iter().filter(|&&ni| ni as i64 > n).count();
                    if replicated > num_nodes / 2 {
                        new_commit = n;
                    }
                }
                n += 1;
            }
            if new_commit > commit_index {
                Some(new_commit)
            } else {
                None
            }
        };
        if let Some(target) = commit_target {
            self.log.lock().unwrap().commit_to(target);
        }
    }

    fn handle_remove_node(&self, removed_node: String) {
        if removed_node == self.id {
            self.stop();
        } else {
            self.drop_peer(&removed_node);
        }
    }
}
