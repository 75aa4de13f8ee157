//! A background thread per peer that serializes the leader's outbound
//! stream to that peer (`append_entries`/`request_vote`/...).
//!
//! Mirrors the teacher's `Peer`/`PeerHandle` split: the main thread never
//! blocks on a peer send, it just drops a command in a channel and moves on.
//! Unlike the teacher, there is no synchronous request/response pairing here
//! — the peer channel is connectionless, so replies arrive independently on
//! the node's shared socket and are handled by the dispatcher, not by this
//! actor.

use std::mem;
use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::warn;

use crate::message::PeerMessage;

pub enum PeerCommand {
    Send(PeerMessage),
    Shutdown,
}

/// Handle held by the consensus engine to push outbound messages to one
/// peer without blocking.
pub struct PeerHandle {
    pub id: String,
    pub addr: SocketAddr,
    to_peer: Sender<PeerCommand>,
    thread: Option<JoinHandle<()>>,
}

impl PeerHandle {
    /// Spawns a new background thread that sends messages handed to it over
    /// `socket` to `addr`, until told to shut down.
    pub fn start(id: String, addr: SocketAddr, socket: Arc<UdpSocket>, self_id: String) -> PeerHandle {
        let (to_peer, from_main) = channel();
        let peer_id = id.clone();
        let thread = thread::spawn(move || peer_main(self_id, peer_id, addr, socket, from_main));
        PeerHandle { id, addr, to_peer, thread: Some(thread) }
    }

    /// Fire-and-forget send; failures are logged by the peer thread itself,
    /// never propagated here. Only panics if the peer thread itself has
    /// already panicked, same contract as the teacher's `PeerHandle`.
    pub fn send(&self, message: PeerMessage) {
        let _ = self.to_peer.send(PeerCommand::Send(message));
    }
}

impl Drop for PeerHandle {
    /// Blocks until the background peer thread exits. Can block for a while
    /// if the thread is wedged on something, but sends never block on I/O
    /// here so in practice this is immediate.
    fn drop(&mut self) {
        if let Some(thread) = mem::replace(&mut self.thread, None) {
            let _ = self.to_peer.send(PeerCommand::Shutdown);
            let _ = thread.join();
        }
    }
}

fn peer_main(
    self_id: String,
    peer_id: String,
    addr: SocketAddr,
    socket: Arc<UdpSocket>,
    from_main: std::sync::mpsc::Receiver<PeerCommand>,
) {
    loop {
        match from_main.recv() {
            Ok(PeerCommand::Send(message)) => {
                let bytes = message.encode();
                if let Err(e) = socket.send_to(&bytes, addr) {
                    warn!("{self_id}: failed to send to peer {peer_id} at {addr}: {e}");
                }
            }
            Ok(PeerCommand::Shutdown) | Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket as StdUdpSocket;
    use std::time::Duration;

    #[test]
    fn send_reaches_the_target_socket() {
        let sender_sock = Arc::new(StdUdpSocket::bind("127.0.0.1:0").unwrap());
        let receiver_sock = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        receiver_sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let receiver_addr = receiver_sock.local_addr().unwrap();

        let handle = PeerHandle::start("peer-1".into(), receiver_addr, sender_sock, "me".into());
        handle.send(PeerMessage::Heartbeat { term: 1, leader_id: "me".into() });

        let mut buf = [0u8; 1024];
        let (n, _) = receiver_sock.recv_from(&mut buf).unwrap();
        let decoded = PeerMessage::decode(&buf[..n]).unwrap();
        match decoded {
            PeerMessage::Heartbeat { term, leader_id } => {
                assert_eq!(term, 1);
                assert_eq!(leader_id, "me");
            }
            _ => panic!("wrong variant"),
        }
    }
}
