//! The client-facing TCP gateway: one thread per connection, a line-oriented
//! text protocol in, text responses out. See `6 Client Gateway` in
//! SPEC_FULL.md for the exact wording every response produces.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use log::debug;

use crate::error::RaftError;
use crate::log::Operation;
use crate::node::Node;
use crate::state::Role;

const WELCOME_BANNER: &str =
    "Welcome to the Node database. Commands: PUT key value, GET key, UPDATE key value, DELETE key, STATUS";
const CONTROL_BANNER: &str = "Control cluster commands: ADD-NODE [new node ip], REMOVE-NODE [node ip], CLUSTER-STATUS";
const INVALID_COMMAND: &str = "ERROR: Invalid command format.";

pub fn handle_client(node: Arc<Node>, stream: TcpStream, addr: SocketAddr) {
    debug!("{}: client connected: {addr}", node.id);
    if let Err(e) = serve(&node, stream) {
        debug!("{}: client {addr} disconnected: {e}", node.id);
    }
}

fn serve(node: &Arc<Node>, mut stream: TcpStream) -> std::io::Result<()> {
    // Leaders get an extra line of cluster-management commands, sent before
    // the banner every client sees.
    if node.role() == Role::Leader {
        writeln!(stream, "{CONTROL_BANNER}")?;
    }
    writeln!(stream, "{WELCOME_BANNER}")?;

    let reader = BufReader::new(stream.try_clone()?);
    for line in reader.lines() {
        if !node.is_running() {
            break;
        }
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let response = dispatch(node, trimmed);
        writeln!(stream, "{response}")?;
    }
    Ok(())
}

fn not_leader_error(node: &Node) -> String {
    match node.leader_hint() {
        Some(leader) => format!("ERROR: Not the leader. Current leader is {leader}."),
        None => "ERROR: Not the leader. Current leader is unknown.".to_string(),
    }
}

fn dispatch(node: &Arc<Node>, line: &str) -> String {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or("").to_uppercase();
    let rest: Vec<&str> = parts.collect();

    match command.as_str() {
        "PUT" => mutate(node, Operation::Set, &rest),
        "UPDATE" => mutate(node, Operation::Update, &rest),
        "DELETE" => delete(node, &rest),
        "GET" => get(node, &rest),
        "STATUS" => status(node),
        "LOGS" => logs(node),
        "ADD-NODE" => membership(node, &rest, Node::add_node),
        "REMOVE-NODE" => membership(node, &rest, Node::remove_node),
        "CLUSTER-STATUS" => cluster_status(node),
        _ => INVALID_COMMAND.to_string(),
    }
}

fn mutate(node: &Node, operation: Operation, rest: &[&str]) -> String {
    if node.role() != Role::Leader {
        return not_leader_error(node);
    }
    match rest {
        [key, value] => match node.propose(operation, key.to_string(), Some(value.to_string())) {
            Ok(text) => text,
            Err(text) => format!("ERROR: {text}"),
        },
        _ => INVALID_COMMAND.to_string(),
    }
}

fn delete(node: &Node, rest: &[&str]) -> String {
    if node.role() != Role::Leader {
        return not_leader_error(node);
    }
    match rest {
        [key] => match node.propose(Operation::Delete, key.to_string(), None) {
            Ok(text) => text,
            Err(text) => format!("ERROR: {text}"),
        },
        _ => INVALID_COMMAND.to_string(),
    }
}

fn get(node: &Node, rest: &[&str]) -> String {
    match rest {
        [key] => match node.store_get(key) {
            Some(value) => format!("{key} -> {value}"),
            None => "ERROR: Key not found.".to_string(),
        },
        _ => INVALID_COMMAND.to_string(),
    }
}

fn status(node: &Node) -> String {
    let keys = node.store_keys();
    if keys.is_empty() {
        "Database is empty.".to_string()
    } else {
        format!("Database keys: {}", keys.join(", "))
    }
}

fn logs(node: &Node) -> String {
    let entries = node.log_entries();
    if entries.is_empty() {
        return "Logs are empty.".to_string();
    }
    entries
        .iter()
        .enumerate()
        .map(|(i, e)| {
            format!(
                "Index: {i}, Term: {}, Operation: {}, Key: {}, Value: {}",
                e.term,
                operation_name(e.operation),
                e.key,
                e.value.as_deref().unwrap_or("")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn operation_name(op: Operation) -> &'static str {
    match op {
        Operation::Set => "SET",
        Operation::Update => "UPDATE",
        Operation::Delete => "DELETE",
    }
}

fn membership(node: &Node, rest: &[&str], action: fn(&Node, &str) -> Result<String, RaftError>) -> String {
    if node.role() != Role::Leader {
        return not_leader_error(node);
    }
    match rest {
        [addr] => match action(node, addr) {
            Ok(text) => text,
            Err(e) => format!("ERROR: {e}"),
        },
        _ => INVALID_COMMAND.to_string(),
    }
}

fn cluster_status(node: &Node) -> String {
    if node.role() != Role::Leader {
        return not_leader_error(node);
    }
    node.cluster_status()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lone_node() -> Node {
        Node::new("127.0.0.1", 21777, HashMap::new(), None).expect("bind a node for gateway unit tests")
    }

    #[test]
    fn status_reports_empty_store() {
        let node = lone_node();
        assert_eq!(status(&node), "Database is empty.");
    }

    #[test]
    fn get_of_missing_key_is_a_store_error() {
        let node = lone_node();
        assert_eq!(get(&node, &["missing"]), "ERROR: Key not found.");
    }

    #[test]
    fn mutation_on_a_follower_is_rejected() {
        let node = lone_node();
        assert_eq!(mutate(&node, Operation::Set, &["k", "v"]), "ERROR: Not the leader. Current leader is unknown.");
    }

    #[test]
    fn logs_reports_empty_log() {
        let node = lone_node();
        assert_eq!(logs(&node), "Logs are empty.");
    }
}
