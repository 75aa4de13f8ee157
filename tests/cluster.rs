//! End-to-end scenarios against a real in-process cluster: bootstrap nodes,
//! talk to them over actual TCP sockets, wait out real election timeouts.
//! Each test claims its own port range so they can run concurrently.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use raftkv::node::Node;
use raftkv::state::Role;
use raftkv::supervisor::ClusterSupervisor;

/// Drains whatever the peer has already flushed, the way the original
/// client reads with a single `recv()` per turn rather than line framing
/// (some responses, like CLUSTER-STATUS, are themselves multi-line).
fn recv_all(stream: &mut TcpStream) -> String {
    stream.set_read_timeout(Some(Duration::from_millis(500))).expect("set read timeout");
    std::thread::sleep(Duration::from_millis(50));
    let mut buf = [0u8; 4096];
    let mut out = String::new();
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                out.push_str(&String::from_utf8_lossy(&buf[..n]));
                if n < buf.len() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => break,
            Err(e) => panic!("read error: {e}"),
        }
    }
    out
}

fn send_command(addr: SocketAddr, command: &str) -> String {
    let mut stream = TcpStream::connect(addr).expect("connect to client port");
    let _banner = recv_all(&mut stream);
    writeln!(stream, "{command}").expect("send command");
    recv_all(&mut stream).trim_end().to_string()
}

fn wait_for_leader(nodes: &[Arc<Node>]) -> Arc<Node> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(leader) = nodes.iter().find(|n| n.role() == Role::Leader) {
            return leader.clone();
        }
        assert!(Instant::now() < deadline, "no leader elected within 10s");
        std::thread::sleep(Duration::from_millis(100));
    }
}

#[test]
fn single_leader_emerges() {
    let supervisor = ClusterSupervisor::new("127.0.0.1");
    let nodes = supervisor.bootstrap(&[22100, 22101, 22102]).unwrap();
    wait_for_leader(&nodes);
    let leader_count = nodes.iter().filter(|n| n.role() == Role::Leader).count();
    assert_eq!(leader_count, 1);
    supervisor.stop_all();
}

#[test]
fn write_then_read_replicates_to_followers() {
    let supervisor = ClusterSupervisor::new("127.0.0.1");
    let nodes = supervisor.bootstrap(&[22200, 22201, 22202]).unwrap();
    let leader = wait_for_leader(&nodes);

    let put_response = send_command(leader.client_addr(), "PUT alpha 1");
    assert_eq!(put_response, "SUCCESS: alpha -> 1 added.");

    let follower = nodes.iter().find(|n| n.id != leader.id).expect("a follower exists");
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let response = send_command(follower.client_addr(), "GET alpha");
        if response == "alpha -> 1" {
            break;
        }
        assert!(Instant::now() < deadline, "replication did not reach follower in time: last saw '{response}'");
        std::thread::sleep(Duration::from_millis(200));
    }
    supervisor.stop_all();
}

#[test]
fn follower_redirects_mutating_commands() {
    let supervisor = ClusterSupervisor::new("127.0.0.1");
    let nodes = supervisor.bootstrap(&[22300, 22301, 22302]).unwrap();
    let leader = wait_for_leader(&nodes);
    let follower = nodes.iter().find(|n| n.id != leader.id).expect("a follower exists");

    let response = send_command(follower.client_addr(), "PUT beta 2");
    assert_eq!(response, format!("ERROR: Not the leader. Current leader is {}.", leader.id));
    supervisor.stop_all();
}

#[test]
fn duplicate_key_insert_is_rejected() {
    let supervisor = ClusterSupervisor::new("127.0.0.1");
    let nodes = supervisor.bootstrap(&[22400, 22401, 22402]).unwrap();
    let leader = wait_for_leader(&nodes);

    let first = send_command(leader.client_addr(), "PUT gamma 9");
    assert_eq!(first, "SUCCESS: gamma -> 9 added.");
    let second = send_command(leader.client_addr(), "PUT gamma 10");
    assert_eq!(second, "ERROR: Key already exists.");
    supervisor.stop_all();
}

#[test]
fn update_of_missing_key_fails() {
    let supervisor = ClusterSupervisor::new("127.0.0.1");
    let nodes = supervisor.bootstrap(&[22500, 22501, 22502]).unwrap();
    let leader = wait_for_leader(&nodes);

    let response = send_command(leader.client_addr(), "UPDATE ghost 1");
    assert_eq!(response, "ERROR: Key not found.");
    supervisor.stop_all();
}

#[test]
fn add_node_spawns_and_joins_in_process() {
    let supervisor = ClusterSupervisor::new("127.0.0.1");
    let nodes = supervisor.bootstrap(&[22600, 22601]).unwrap();
    let leader = wait_for_leader(&nodes);

    let response = send_command(leader.client_addr(), "ADD-NODE 127.0.0.1:22602");
    assert_eq!(response, "SUCCESS: Node 127.0.0.1:22602 added to cluster.");

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if supervisor.nodes().iter().any(|n| n.addr.port() == 22602) {
            break;
        }
        assert!(Instant::now() < deadline, "new node never appeared in the registry");
        std::thread::sleep(Duration::from_millis(100));
    }
    supervisor.stop_all();
}

#[test]
fn cluster_status_is_leader_only() {
    let supervisor = ClusterSupervisor::new("127.0.0.1");
    let nodes = supervisor.bootstrap(&[22700, 22701, 22702]).unwrap();
    let leader = wait_for_leader(&nodes);
    let follower = nodes.iter().find(|n| n.id != leader.id).expect("a follower exists");

    let leader_response = send_command(leader.client_addr(), "CLUSTER-STATUS");
    assert!(leader_response.starts_with("Cluster status:"));

    let follower_response = send_command(follower.client_addr(), "CLUSTER-STATUS");
    assert!(follower_response.starts_with("ERROR: Not the leader"));
    supervisor.stop_all();
}
