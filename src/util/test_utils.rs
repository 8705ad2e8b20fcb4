// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Test doubles: a capturing logger and an in-memory transport so multi-node tests need no real
//! sockets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::ln::peer_handler::{
	Connection, FrameReader, FrameWriter, Listener, Transport, TransportError,
};
use crate::ln::NodeId;
use crate::util::logger::{Logger, Record};

/// A logger which prints to stdout and captures every formatted line for assertions.
pub struct TestLogger {
	id: String,
	lines: Mutex<Vec<String>>,
}

impl TestLogger {
	/// Creates an unnamed test logger.
	pub fn new() -> Self {
		Self::with_id("".to_string())
	}

	/// Creates a test logger whose output is prefixed with `id`, useful in multi-node tests.
	pub fn with_id(id: String) -> Self {
		TestLogger { id, lines: Mutex::new(Vec::new()) }
	}

	/// How many captured lines contain the given substring.
	pub fn lines_containing(&self, needle: &str) -> usize {
		self.lines.lock().unwrap().iter().filter(|l| l.contains(needle)).count()
	}
}

impl Default for TestLogger {
	fn default() -> Self {
		Self::new()
	}
}

impl Logger for TestLogger {
	fn log(&self, record: &Record) {
		let line = format!(
			"{:<5} [{}:{}] {}",
			record.level, record.module_path, record.line, record.args
		);
		println!("{} {}", self.id, line);
		self.lines.lock().unwrap().push(line);
	}
}

struct PendingConn {
	dialer_id: NodeId,
	to_listener: mpsc::UnboundedReceiver<Vec<u8>>,
	to_dialer: mpsc::UnboundedSender<Vec<u8>>,
	// Carries the listening side's identity back to the dialer.
	reply: oneshot::Sender<NodeId>,
}

type Acceptors = Mutex<HashMap<String, mpsc::UnboundedSender<PendingConn>>>;

/// An in-memory [`Transport`]: hosts are plain strings, frames travel over channels, and every
/// clone shares the same network.
#[derive(Clone)]
pub struct MemTransport {
	acceptors: Arc<Acceptors>,
}

impl MemTransport {
	/// Creates a fresh, empty network.
	pub fn new() -> Self {
		MemTransport { acceptors: Arc::new(Mutex::new(HashMap::new())) }
	}
}

impl Default for MemTransport {
	fn default() -> Self {
		Self::new()
	}
}

struct MemFrameWriter {
	tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl FrameWriter for MemFrameWriter {
	async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
		self.tx.send(frame.to_vec()).map_err(|_| TransportError::Closed)
	}
}

struct MemFrameReader {
	rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl FrameReader for MemFrameReader {
	async fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
		self.rx.recv().await.ok_or(TransportError::Closed)
	}
}

struct MemListener {
	local_node_id: NodeId,
	pending: mpsc::UnboundedReceiver<PendingConn>,
}

#[async_trait]
impl Listener for MemListener {
	async fn accept(&mut self) -> Result<Connection, TransportError> {
		let conn = self.pending.recv().await.ok_or(TransportError::Closed)?;
		let _ = conn.reply.send(self.local_node_id);
		Ok(Connection {
			their_node_id: conn.dialer_id,
			writer: Box::new(MemFrameWriter { tx: conn.to_dialer }),
			reader: Box::new(MemFrameReader { rx: conn.to_listener }),
		})
	}
}

#[async_trait]
impl Transport for MemTransport {
	async fn dial(&self, host: &str, local_node_id: NodeId) -> Result<Connection, TransportError> {
		let acceptor = self
			.acceptors
			.lock()
			.unwrap()
			.get(host)
			.cloned()
			.ok_or_else(|| TransportError::Io(format!("no listener on {}", host)))?;
		let (to_listener_tx, to_listener_rx) = mpsc::unbounded_channel();
		let (to_dialer_tx, to_dialer_rx) = mpsc::unbounded_channel();
		let (reply_tx, reply_rx) = oneshot::channel();
		acceptor
			.send(PendingConn {
				dialer_id: local_node_id,
				to_listener: to_listener_rx,
				to_dialer: to_dialer_tx,
				reply: reply_tx,
			})
			.map_err(|_| TransportError::Io(format!("listener on {} is gone", host)))?;
		let their_node_id = reply_rx
			.await
			.map_err(|_| TransportError::Handshake("listener dropped the connection".to_string()))?;
		Ok(Connection {
			their_node_id,
			writer: Box::new(MemFrameWriter { tx: to_listener_tx }),
			reader: Box::new(MemFrameReader { rx: to_dialer_rx }),
		})
	}

	async fn listen(
		&self, host: &str, local_node_id: NodeId,
	) -> Result<Box<dyn Listener>, TransportError> {
		let (tx, rx) = mpsc::unbounded_channel();
		let mut acceptors = self.acceptors.lock().unwrap();
		if acceptors.contains_key(host) {
			return Err(TransportError::Io(format!("{} already bound", host)));
		}
		acceptors.insert(host.to_string(), tx);
		Ok(Box::new(MemListener { local_node_id, pending: rx }))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn mem_transport_connects_and_frames() {
		let transport = MemTransport::new();
		let server_id = NodeId([1; 32]);
		let mut listener = transport.listen("srv", server_id).await.unwrap();
		let t2 = transport.clone();
		let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
		let mut client = t2.dial("srv", NodeId([2; 32])).await.unwrap();
		let mut server = accept.await.unwrap();
		assert_eq!(client.their_node_id, server_id);
		assert_eq!(server.their_node_id, NodeId([2; 32]));
		client.writer.write_frame(b"ping").await.unwrap();
		assert_eq!(server.reader.read_frame().await.unwrap(), b"ping");
		drop(server);
		match client.reader.read_frame().await {
			Err(TransportError::Closed) => {},
			other => panic!("expected Closed, got {:?}", other.map(|_| ())),
		}
		assert!(transport.dial("nowhere", NodeId([3; 32])).await.is_err());
	}
}
