// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Top level peer handling: transport abstraction, the peer registry, and the per-peer read and
//! write session tasks.
//!
//! The transport hands us framed byte vectors; authentication and encryption of frames live
//! behind the [`Transport`] trait, with a plain length-prefixed TCP implementation provided
//! here.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::ln::msgs::{decode_msg, encode_msg, Message};
use crate::ln::node::Event;
use crate::ln::NodeId;
use crate::util::logger::Logger;

/// Frames larger than this are treated as a protocol violation and drop the connection.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// An error in dialing, accepting, or moving frames over a transport.
#[derive(Debug)]
pub enum TransportError {
	/// An underlying IO failure.
	Io(String),
	/// The identity exchange at connection setup failed or was malformed.
	Handshake(String),
	/// The connection was closed by the other side.
	Closed,
}

impl fmt::Display for TransportError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			TransportError::Io(e) => write!(f, "transport IO error: {}", e),
			TransportError::Handshake(e) => write!(f, "transport handshake failed: {}", e),
			TransportError::Closed => f.write_str("transport closed"),
		}
	}
}

impl From<std::io::Error> for TransportError {
	fn from(e: std::io::Error) -> Self {
		TransportError::Io(e.to_string())
	}
}

/// The write half of an established peer connection.
#[async_trait]
pub trait FrameWriter: Send {
	/// Sends one frame, in full, to the peer.
	async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError>;
}

/// The read half of an established peer connection.
#[async_trait]
pub trait FrameReader: Send {
	/// Receives the next full frame from the peer, or [`TransportError::Closed`] at end of
	/// stream.
	async fn read_frame(&mut self) -> Result<Vec<u8>, TransportError>;
}

/// A connection established by a [`Transport`], after the identity exchange.
pub struct Connection {
	/// The identity the remote side announced.
	pub their_node_id: NodeId,
	/// The write half.
	pub writer: Box<dyn FrameWriter>,
	/// The read half.
	pub reader: Box<dyn FrameReader>,
}

/// Accepts inbound connections on a bound host.
#[async_trait]
pub trait Listener: Send {
	/// Waits for the next inbound connection.
	async fn accept(&mut self) -> Result<Connection, TransportError>;
}

/// A way to reach other nodes: dial out by host, or bind and accept inbound connections.
#[async_trait]
pub trait Transport: Send + Sync {
	/// Connects to the given host and performs the identity exchange, announcing
	/// `local_node_id`.
	async fn dial(&self, host: &str, local_node_id: NodeId) -> Result<Connection, TransportError>;
	/// Binds the given host for inbound connections.
	async fn listen(
		&self, host: &str, local_node_id: NodeId,
	) -> Result<Box<dyn Listener>, TransportError>;
}

/// Plain-TCP transport: a 32-byte identity preamble in each direction, then big-endian
/// u32-length-prefixed frames.
pub struct TcpTransport {}

impl TcpTransport {
	/// Creates a TCP transport.
	pub fn new() -> Self {
		TcpTransport {}
	}

	async fn handshake(
		stream: TcpStream, local_node_id: NodeId,
	) -> Result<Connection, TransportError> {
		let (mut read_half, mut write_half) = stream.into_split();
		write_half.write_all(&local_node_id.0).await?;
		let mut their_id = [0u8; 32];
		read_half
			.read_exact(&mut their_id)
			.await
			.map_err(|e| TransportError::Handshake(e.to_string()))?;
		Ok(Connection {
			their_node_id: NodeId(their_id),
			writer: Box::new(TcpFrameWriter { write_half }),
			reader: Box::new(TcpFrameReader { read_half }),
		})
	}
}

impl Default for TcpTransport {
	fn default() -> Self {
		Self::new()
	}
}

struct TcpFrameWriter {
	write_half: OwnedWriteHalf,
}

#[async_trait]
impl FrameWriter for TcpFrameWriter {
	async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
		let len = frame.len() as u32;
		self.write_half.write_all(&len.to_be_bytes()).await?;
		self.write_half.write_all(frame).await?;
		Ok(())
	}
}

struct TcpFrameReader {
	read_half: OwnedReadHalf,
}

#[async_trait]
impl FrameReader for TcpFrameReader {
	async fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
		let mut len_bytes = [0u8; 4];
		if let Err(e) = self.read_half.read_exact(&mut len_bytes).await {
			if e.kind() == std::io::ErrorKind::UnexpectedEof {
				return Err(TransportError::Closed);
			}
			return Err(e.into());
		}
		let len = u32::from_be_bytes(len_bytes);
		if len > MAX_FRAME_SIZE {
			return Err(TransportError::Io(format!("oversized frame of {} bytes", len)));
		}
		let mut frame = vec![0u8; len as usize];
		self.read_half.read_exact(&mut frame).await.map_err(|e| {
			if e.kind() == std::io::ErrorKind::UnexpectedEof {
				TransportError::Closed
			} else {
				TransportError::Io(e.to_string())
			}
		})?;
		Ok(frame)
	}
}

struct TcpListenerWrapper {
	listener: TcpListener,
	local_node_id: NodeId,
}

#[async_trait]
impl Listener for TcpListenerWrapper {
	async fn accept(&mut self) -> Result<Connection, TransportError> {
		let (stream, _addr) = self.listener.accept().await?;
		TcpTransport::handshake(stream, self.local_node_id).await
	}
}

#[async_trait]
impl Transport for TcpTransport {
	async fn dial(&self, host: &str, local_node_id: NodeId) -> Result<Connection, TransportError> {
		let stream = TcpStream::connect(host).await?;
		Self::handshake(stream, local_node_id).await
	}

	async fn listen(
		&self, host: &str, local_node_id: NodeId,
	) -> Result<Box<dyn Listener>, TransportError> {
		let listener = TcpListener::bind(host).await?;
		Ok(Box::new(TcpListenerWrapper { listener, local_node_id }))
	}
}

/// A summary of a connected peer, as reported by list_peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerSummary {
	/// The peer's identity.
	pub node_id: NodeId,
	/// The small per-connection id assigned at registration.
	pub peer_id: u64,
	/// Whether the peer connected to us.
	pub inbound: bool,
	/// The host the connection is associated with, when known.
	pub host: Option<String>,
}

/// A registered, connected peer.
pub struct Peer {
	/// The peer's identity.
	pub node_id: NodeId,
	/// The small per-connection id assigned at registration. A reconnecting peer gets a fresh
	/// one, which lets stale disconnect notices be told apart from the live session.
	pub peer_id: u64,
	/// Whether the peer connected to us.
	pub inbound: bool,
	/// The host the connection is associated with, when known.
	pub host: Option<String>,
	/// The bounded queue drained by the peer's write task.
	pub outbound: mpsc::Sender<Message>,
	/// Fired to stop the peer's session tasks.
	pub stop: triggered::Trigger,
}

/// The set of currently connected peers, keyed by identity. Owned by the dispatcher, so no
/// locking is needed.
pub struct PeerRegistry {
	peers: HashMap<NodeId, Peer>,
	next_peer_id: u64,
	logger: Arc<dyn Logger>,
}

impl PeerRegistry {
	/// Creates an empty registry.
	pub fn new(logger: Arc<dyn Logger>) -> Self {
		PeerRegistry { peers: HashMap::new(), next_peer_id: 0, logger }
	}

	/// Assigns the next peer id.
	pub fn next_peer_id(&mut self) -> u64 {
		self.next_peer_id += 1;
		self.next_peer_id
	}

	/// Registers a peer. The caller must have checked [`Self::contains`] first.
	pub fn insert(&mut self, peer: Peer) {
		log_info!(
			self.logger,
			"Registered {} peer {} with peer_id {}",
			if peer.inbound { "inbound" } else { "outbound" },
			peer.node_id,
			peer.peer_id
		);
		self.peers.insert(peer.node_id, peer);
	}

	/// Whether a peer with this identity is connected.
	pub fn contains(&self, node_id: &NodeId) -> bool {
		self.peers.contains_key(node_id)
	}

	/// Looks up a connected peer.
	pub fn get(&self, node_id: &NodeId) -> Option<&Peer> {
		self.peers.get(node_id)
	}

	/// Deregisters the peer with the given identity, but only if its session id matches:
	/// disconnect notices from a replaced session must not tear down its successor.
	pub fn remove(&mut self, node_id: &NodeId, peer_id: u64) -> Option<Peer> {
		match self.peers.get(node_id) {
			Some(peer) if peer.peer_id == peer_id => {
				let peer = self.peers.remove(node_id).expect("checked just above");
				peer.stop.trigger();
				log_info!(self.logger, "Deregistered peer {} (peer_id {})", node_id, peer_id);
				Some(peer)
			},
			_ => None,
		}
	}

	/// Queues a message to the given peer. Returns false if the peer is unknown or its outbound
	/// queue is full (slow peers drop traffic rather than stall the dispatcher).
	pub fn send(&self, node_id: &NodeId, msg: Message) -> bool {
		match self.peers.get(node_id) {
			Some(peer) => {
				let name = msg.name();
				match peer.outbound.try_send(msg) {
					Ok(()) => true,
					Err(_) => {
						log_warn!(
							self.logger,
							"Dropping {} to peer {}: outbound queue full or closed",
							name,
							node_id
						);
						false
					},
				}
			},
			None => false,
		}
	}

	/// Queues a message to every connected peer except `skip`.
	pub fn broadcast(&self, msg: &Message, skip: Option<&NodeId>) {
		for node_id in self.peers.keys() {
			if Some(node_id) != skip {
				self.send(node_id, msg.clone());
			}
		}
	}

	/// Summaries of every connected peer, in stable id order.
	pub fn list(&self) -> Vec<PeerSummary> {
		let mut summaries: Vec<PeerSummary> = self
			.peers
			.values()
			.map(|p| PeerSummary {
				node_id: p.node_id,
				peer_id: p.peer_id,
				inbound: p.inbound,
				host: p.host.clone(),
			})
			.collect();
		summaries.sort_by_key(|s| s.peer_id);
		summaries
	}

	/// The identities of every connected peer.
	pub fn node_ids(&self) -> Vec<NodeId> {
		self.peers.keys().copied().collect()
	}

	/// Fires every peer's session stop trigger.
	pub fn stop_all(&mut self) {
		for peer in self.peers.values() {
			peer.stop.trigger();
		}
		self.peers.clear();
	}
}

/// The per-peer write task: drains the outbound queue into frames until the queue closes, the
/// stop trigger fires, or the transport errors.
pub async fn peer_write_loop(
	mut writer: Box<dyn FrameWriter>, mut outbound: mpsc::Receiver<Message>,
	stop: triggered::Listener, logger: Arc<dyn Logger>, node_id: NodeId,
) {
	loop {
		tokio::select! {
			_ = stop.clone() => return,
			msg = outbound.recv() => {
				let msg = match msg {
					Some(msg) => msg,
					None => return,
				};
				log_trace!(logger, "Sending {} to peer {}", msg.name(), node_id);
				if let Err(e) = writer.write_frame(&encode_msg(&msg)).await {
					log_debug!(logger, "Write to peer {} failed: {}", node_id, e);
					return;
				}
			},
		}
	}
}

/// The per-peer read task: decodes frames into [`Event::PeerMessage`]s until the peer
/// disconnects, then posts [`Event::PeerDisconnected`].
pub async fn peer_read_loop(
	mut reader: Box<dyn FrameReader>, node_id: NodeId, peer_id: u64, events: mpsc::Sender<Event>,
	stop: triggered::Listener, logger: Arc<dyn Logger>,
) {
	loop {
		let frame = tokio::select! {
			_ = stop.clone() => break,
			frame = reader.read_frame() => frame,
		};
		match frame {
			Ok(frame) => match decode_msg(&frame) {
				Ok(msg) => {
					log_trace!(logger, "Received {} from peer {}", msg.name(), node_id);
					if events.send(Event::PeerMessage { node_id, msg }).await.is_err() {
						return;
					}
				},
				Err(e) => {
					log_warn!(
						logger,
						"Dropping peer {}: undecodable frame ({})",
						node_id,
						e
					);
					break;
				},
			},
			Err(TransportError::Closed) => {
				log_debug!(logger, "Peer {} closed the connection", node_id);
				break;
			},
			Err(e) => {
				log_debug!(logger, "Read from peer {} failed: {}", node_id, e);
				break;
			},
		}
	}
	let _ = events.send(Event::PeerDisconnected { node_id, peer_id }).await;
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::util::test_utils::TestLogger;

	#[tokio::test]
	async fn tcp_transport_exchanges_identities_and_frames() {
		let transport = TcpTransport::new();
		let server_id = NodeId([1; 32]);
		let client_id = NodeId([2; 32]);
		// The Listener trait doesn't expose the OS-assigned port, so probe for a free one.
		let mut port = 19735u16;
		let mut listener = loop {
			match transport.listen(&format!("127.0.0.1:{}", port), server_id).await {
				Ok(l) => break l,
				Err(_) => port += 1,
			}
		};

		let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
		let mut client =
			transport.dial(&format!("127.0.0.1:{}", port), client_id).await.unwrap();
		let mut server = accept.await.unwrap();
		assert_eq!(client.their_node_id, server_id);
		assert_eq!(server.their_node_id, client_id);

		client.writer.write_frame(b"hello").await.unwrap();
		assert_eq!(server.reader.read_frame().await.unwrap(), b"hello");
		drop(client);
		match server.reader.read_frame().await {
			Err(TransportError::Closed) => {},
			other => panic!("expected Closed, got {:?}", other.map(|_| ())),
		}
	}

	#[tokio::test]
	async fn registry_send_and_remove_respect_session_ids() {
		let logger = Arc::new(TestLogger::new());
		let mut registry = PeerRegistry::new(logger);
		let node_id = NodeId([7; 32]);
		let (tx, mut rx) = mpsc::channel(4);
		let (trigger, _listener) = triggered::trigger();
		let peer_id = registry.next_peer_id();
		registry.insert(Peer {
			node_id,
			peer_id,
			inbound: false,
			host: Some("example:9735".to_string()),
			outbound: tx,
			stop: trigger,
		});
		assert!(registry.send(&node_id, Message::RoutingTableRequest(Default::default())));
		assert!(rx.recv().await.is_some());
		// A stale disconnect for an old session id is ignored.
		assert!(registry.remove(&node_id, peer_id + 1).is_none());
		assert!(registry.contains(&node_id));
		assert!(registry.remove(&node_id, peer_id).is_some());
		assert!(!registry.contains(&node_id));
	}
}
