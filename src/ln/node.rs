// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The top-level [`Node`] and its dispatcher: a single task which owns all mutable node state
//! (peer registry, switch, routing table, directory, pending payments) and serializes every
//! state change through one event mailbox. Long-running work (dials, funding workflows, timers)
//! runs in spawned tasks which only ever report back through that mailbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};

use crate::chain::transaction::OutPoint;
use crate::chain::ChainNotifier;
use crate::ln::funding::{
	self, ActiveWorkflow, ChannelDetails, FundingContext, FundingManager, FundingParams,
	FundingUpdate, WORKFLOW_MAILBOX_SIZE,
};
use crate::ln::msgs::{
	AnnouncedChannel, ErrorMessage, HtlcFailReason, Message, NodeDirectoryEntry,
	NodeDirectoryResponse, OpenChannel, RoutingTableResponse, UpdateAddHtlc, UpdateFailHtlc,
	UpdateFulfillHtlc,
};
use crate::ln::payment::{InvoiceRegistry, PaymentManager, PaymentResultSender};
use crate::ln::peer_handler::{
	peer_read_loop, peer_write_loop, Connection, Peer, PeerRegistry, PeerSummary, Transport,
	TransportError,
};
use crate::ln::switch::{Circuit, HtlcSource, HtlcSwitch, Link};
use crate::ln::{ChannelId, NodeId, PaymentHash, PaymentPreimage};
use crate::routing::network_graph::{ChannelEdge, NetworkGraph};
use crate::routing::router::{find_paths, PathCandidate};
use crate::sign::{Signer, WalletController};
use crate::util::config::NodeConfig;
use crate::util::errors::{ConnectError, FundingError};
use crate::util::logger::Logger;
use crate::util::persist::{KVStore, NodeDb};

const EVENT_QUEUE_SIZE: usize = 64;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// The routing weight assigned to freshly opened local channels.
const DEFAULT_EDGE_WEIGHT: u64 = 1;

/// A live channel as reported by list_channels, with current link balances.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSummary {
	/// The peer on the other end.
	pub counterparty: NodeId,
	/// The funding outpoint.
	pub channel_point: OutPoint,
	/// Total capacity in satoshis.
	pub capacity: u64,
	/// Satoshis currently spendable by this node.
	pub local_balance: u64,
	/// Satoshis currently spendable by the peer.
	pub remote_balance: u64,
}

/// Control-plane requests, answered through per-request mailboxes.
pub enum NodeRequest {
	/// Connects to a peer by identity, host, or both. With only an identity the host is
	/// resolved through the node directory.
	ConnectPeer {
		/// The target identity, if known.
		node_id: Option<NodeId>,
		/// The target host, if known.
		host: Option<String>,
		/// Where the outcome is delivered.
		notify: oneshot::Sender<Result<PeerSummary, ConnectError>>,
	},
	/// Lists the currently connected peers.
	ListPeers {
		/// Where the summaries are delivered.
		notify: oneshot::Sender<Vec<PeerSummary>>,
	},
	/// Starts a channel open toward a connected peer. Progress and the terminal outcome are
	/// streamed through `updates`.
	OpenChannel {
		/// The peer to open with.
		node_id: NodeId,
		/// Total amount this node funds, in satoshis.
		funding_satoshis: u64,
		/// Amount pushed to the peer at open, in satoshis.
		push_satoshis: u64,
		/// The confirmation depth to require for this channel, or the configured default.
		min_confs: Option<u32>,
		/// Where progress updates are streamed.
		updates: mpsc::UnboundedSender<FundingUpdate>,
	},
	/// Lists currently open channels with live balances.
	ListChannels {
		/// Where the summaries are delivered.
		notify: oneshot::Sender<Vec<ChannelSummary>>,
	},
	/// Sends a payment to a destination which handed us the payment hash out of band.
	SendPayment {
		/// The destination node.
		destination: NodeId,
		/// The amount in satoshis.
		amount_satoshis: u64,
		/// The payment hash from the destination's invoice.
		payment_hash: PaymentHash,
		/// Where the single terminal outcome is delivered.
		notify: PaymentResultSender,
	},
	/// Registers an invoice for the given amount.
	AddInvoice {
		/// The minimum settlement amount in satoshis.
		amount_satoshis: u64,
		/// Delivers the hash to hand to the payer, and the preimage.
		notify: oneshot::Sender<(PaymentHash, PaymentPreimage)>,
	},
	/// Computes candidate paths to a destination without paying.
	FindPath {
		/// The destination node.
		destination: NodeId,
		/// The amount the paths must admit, in satoshis.
		amount_satoshis: u64,
		/// How many paths to return at most, or the configured default.
		max_paths: Option<usize>,
		/// Whether to annotate each path with an admission status.
		validate: bool,
		/// How long validation may take, or the configured default.
		timeout: Option<Duration>,
		/// Where the candidates are delivered.
		notify: oneshot::Sender<Vec<PathCandidate>>,
	},
	/// Returns a copy of the current routing table.
	RoutingTable {
		/// Where the table is delivered.
		notify: oneshot::Sender<NetworkGraph>,
	},
	/// Clears the identity-to-host directory, in memory and on disk.
	ClearNodeDirectory {
		/// Fires when the directory is cleared.
		notify: oneshot::Sender<()>,
	},
}

/// Everything the dispatcher reacts to: control-plane requests plus reports from spawned tasks.
pub enum Event {
	/// A control-plane request.
	Request(NodeRequest),
	/// A decoded message arrived from a connected peer.
	PeerMessage {
		/// The sending peer.
		node_id: NodeId,
		/// The message.
		msg: Message,
	},
	/// A peer session ended.
	PeerDisconnected {
		/// The peer whose session ended.
		node_id: NodeId,
		/// The session id, so a notice from a replaced session is ignored.
		peer_id: u64,
	},
	/// The listener accepted an inbound connection.
	InboundConnection(Connection),
	/// An outbound dial finished.
	ConnectResult {
		/// The host that was dialed.
		host: String,
		/// The dial outcome.
		result: Result<Connection, TransportError>,
		/// The caller waiting on the connect.
		notify: oneshot::Sender<Result<PeerSummary, ConnectError>>,
	},
	/// A funding workflow reached a terminal state.
	FundingOutcome {
		/// The counterparty of the workflow.
		node_id: NodeId,
		/// The workflow's negotiation id, so a report from a torn-down workflow cannot be
		/// mistaken for its successor's.
		channel_id: ChannelId,
		/// The workflow outcome.
		result: Result<ChannelDetails, FundingError>,
	},
	/// A payment's deadline expired.
	PaymentTimeout {
		/// The payment that timed out.
		payment_hash: PaymentHash,
	},
}

/// A clonable handle through which callers drive a running [`Node`].
#[derive(Clone)]
pub struct NodeHandle {
	/// This node's identity.
	pub node_id: NodeId,
	events: mpsc::Sender<Event>,
	shutdown: triggered::Trigger,
}

/// A running node: its handle plus the dispatcher task.
pub struct Node {
	/// The handle used to drive the node.
	pub handle: NodeHandle,
	dispatcher: JoinHandle<()>,
}

impl Node {
	/// Starts a node: loads persisted state, binds the listener if configured, resumes any
	/// persisted funding waits, and spawns the dispatcher.
	pub async fn start(
		config: NodeConfig, node_id: NodeId, transport: Arc<dyn Transport>,
		signer: Arc<dyn Signer>, chain: Arc<dyn ChainNotifier>, wallet: Arc<dyn WalletController>,
		store: Arc<dyn KVStore>, logger: Arc<dyn Logger>,
	) -> Result<Node, std::io::Error> {
		let db = Arc::new(NodeDb::new(store));
		let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
		let (shutdown_trigger, shutdown) = triggered::trigger();

		let mut directory = db.fetch_node_directory()?;
		if let Some(host) = &config.listen_host {
			directory.insert(node_id, host.clone());
		}
		let graph = db.fetch_routing_table()?.unwrap_or_default();
		let mut pending_resumes = HashMap::new();
		for snapshot in db.fetch_funding_states()? {
			log_info!(
				logger,
				"Found persisted funding workflow {} with {}",
				snapshot.channel_id,
				snapshot.counterparty
			);
			pending_resumes.insert(snapshot.counterparty, snapshot);
		}

		let mut dispatcher = Dispatcher {
			node_id,
			funding_ctx: FundingContext {
				signer,
				wallet,
				chain,
				db: db.clone(),
				logger: logger.clone(),
			},
			transport: transport.clone(),
			db,
			events_tx: events_tx.clone(),
			peers: PeerRegistry::new(logger.clone()),
			pending_connects: HashMap::new(),
			funding: FundingManager::new(logger.clone()),
			switch: HtlcSwitch::new(config.cltv_delta, logger.clone()),
			graph,
			directory,
			payments: PaymentManager::new(config.max_payment_attempts, logger.clone()),
			invoices: InvoiceRegistry::new(logger.clone()),
			pending_resumes,
			tasks: JoinSet::new(),
			shutdown: shutdown.clone(),
			logger: logger.clone(),
			config,
		};

		if let Some(host) = dispatcher.config.listen_host.clone() {
			let mut listener = transport.listen(&host, node_id).await.map_err(|e| {
				std::io::Error::new(std::io::ErrorKind::AddrInUse, e.to_string())
			})?;
			log_info!(logger, "Node {} listening on {}", node_id, host);
			let accept_events = events_tx.clone();
			let accept_shutdown = shutdown.clone();
			let accept_logger = logger.clone();
			dispatcher.tasks.spawn(async move {
				loop {
					let conn = tokio::select! {
						_ = accept_shutdown.clone() => return,
						conn = listener.accept() => conn,
					};
					match conn {
						Ok(conn) => {
							if accept_events.send(Event::InboundConnection(conn)).await.is_err() {
								return;
							}
						},
						Err(e) => {
							log_warn!(accept_logger, "Inbound accept failed: {}", e);
						},
					}
				}
			});
		}

		let dispatcher = tokio::spawn(dispatcher.run(events_rx));
		Ok(Node { handle: NodeHandle { node_id, events: events_tx, shutdown: shutdown_trigger }, dispatcher })
	}

	/// Stops the node: fires the shutdown signal and waits for the dispatcher to drain.
	pub async fn stop(self) {
		self.handle.shutdown.trigger();
		let _ = self.dispatcher.await;
	}
}

impl NodeHandle {
	async fn request(&self, req: NodeRequest) -> bool {
		self.events.send(Event::Request(req)).await.is_ok()
	}

	/// Connects to a peer by identity and/or host. See [`NodeRequest::ConnectPeer`].
	pub async fn connect_peer(
		&self, node_id: Option<NodeId>, host: Option<String>,
	) -> Result<PeerSummary, ConnectError> {
		let (notify, rx) = oneshot::channel();
		if !self.request(NodeRequest::ConnectPeer { node_id, host, notify }).await {
			return Err(ConnectError::NodeShuttingDown);
		}
		rx.await.map_err(|_| ConnectError::NodeShuttingDown)?
	}

	/// Lists the currently connected peers.
	pub async fn list_peers(&self) -> Vec<PeerSummary> {
		let (notify, rx) = oneshot::channel();
		if !self.request(NodeRequest::ListPeers { notify }).await {
			return Vec::new();
		}
		rx.await.unwrap_or_default()
	}

	/// Starts a channel open and returns the update stream. The stream ends with
	/// [`FundingUpdate::ChannelOpen`] or [`FundingUpdate::Failed`]. `min_confs` overrides the
	/// configured confirmation depth for this channel.
	pub async fn open_channel(
		&self, node_id: NodeId, funding_satoshis: u64, push_satoshis: u64, min_confs: Option<u32>,
	) -> mpsc::UnboundedReceiver<FundingUpdate> {
		let (updates, rx) = mpsc::unbounded_channel();
		if !self
			.request(NodeRequest::OpenChannel {
				node_id,
				funding_satoshis,
				push_satoshis,
				min_confs,
				updates: updates.clone(),
			})
			.await
		{
			let _ = updates.send(FundingUpdate::Failed(FundingError::NodeShuttingDown));
		}
		rx
	}

	/// Opens a channel and blocks until it is open or has failed.
	pub async fn open_channel_sync(
		&self, node_id: NodeId, funding_satoshis: u64, push_satoshis: u64, min_confs: Option<u32>,
	) -> Result<ChannelDetails, FundingError> {
		let mut updates =
			self.open_channel(node_id, funding_satoshis, push_satoshis, min_confs).await;
		while let Some(update) = updates.recv().await {
			match update {
				FundingUpdate::ChannelOpen(details) => return Ok(details),
				FundingUpdate::Failed(e) => return Err(e),
				FundingUpdate::StateChange(_) => {},
			}
		}
		Err(FundingError::NodeShuttingDown)
	}

	/// Lists currently open channels.
	pub async fn list_channels(&self) -> Vec<ChannelSummary> {
		let (notify, rx) = oneshot::channel();
		if !self.request(NodeRequest::ListChannels { notify }).await {
			return Vec::new();
		}
		rx.await.unwrap_or_default()
	}

	/// Sends a payment and blocks until its single terminal outcome.
	pub async fn send_payment(
		&self, destination: NodeId, amount_satoshis: u64, payment_hash: PaymentHash,
	) -> Result<PaymentPreimage, crate::util::errors::PaymentSendFailure> {
		let (notify, rx) = oneshot::channel();
		if !self
			.request(NodeRequest::SendPayment {
				destination,
				amount_satoshis,
				payment_hash,
				notify,
			})
			.await
		{
			return Err(crate::util::errors::PaymentSendFailure::NodeShuttingDown);
		}
		rx.await.map_err(|_| crate::util::errors::PaymentSendFailure::NodeShuttingDown)?
	}

	/// Registers an invoice, returning the payment hash to hand to the payer and the preimage.
	pub async fn add_invoice(
		&self, amount_satoshis: u64,
	) -> Option<(PaymentHash, PaymentPreimage)> {
		let (notify, rx) = oneshot::channel();
		if !self.request(NodeRequest::AddInvoice { amount_satoshis, notify }).await {
			return None;
		}
		rx.await.ok()
	}

	/// Computes candidate paths to a destination without paying. With `validate` each path is
	/// annotated with an admission status; `max_paths` and `timeout` override the configured
	/// defaults.
	pub async fn find_path(
		&self, destination: NodeId, amount_satoshis: u64, max_paths: Option<usize>,
		validate: bool, timeout: Option<Duration>,
	) -> Vec<PathCandidate> {
		let (notify, rx) = oneshot::channel();
		let req = NodeRequest::FindPath {
			destination,
			amount_satoshis,
			max_paths,
			validate,
			timeout,
			notify,
		};
		if !self.request(req).await {
			return Vec::new();
		}
		rx.await.unwrap_or_default()
	}

	/// Returns a copy of the current routing table.
	pub async fn routing_table(&self) -> NetworkGraph {
		let (notify, rx) = oneshot::channel();
		if !self.request(NodeRequest::RoutingTable { notify }).await {
			return NetworkGraph::new();
		}
		rx.await.unwrap_or_default()
	}

	/// Clears the identity-to-host directory.
	pub async fn clear_node_directory(&self) {
		let (notify, rx) = oneshot::channel();
		if self.request(NodeRequest::ClearNodeDirectory { notify }).await {
			let _ = rx.await;
		}
	}
}

struct Dispatcher {
	node_id: NodeId,
	config: NodeConfig,
	transport: Arc<dyn Transport>,
	funding_ctx: FundingContext,
	db: Arc<NodeDb>,
	events_tx: mpsc::Sender<Event>,
	peers: PeerRegistry,
	// In-flight outbound dials, keyed by host, with the target identity when known. Concurrent
	// connects to the same target race here, inside the serialized loop, so exactly one wins.
	pending_connects: HashMap<String, Option<NodeId>>,
	funding: FundingManager,
	switch: HtlcSwitch,
	graph: NetworkGraph,
	directory: HashMap<NodeId, String>,
	payments: PaymentManager,
	invoices: InvoiceRegistry,
	pending_resumes: HashMap<NodeId, funding::FundingSnapshot>,
	tasks: JoinSet<()>,
	shutdown: triggered::Listener,
	logger: Arc<dyn Logger>,
}

impl Dispatcher {
	async fn run(mut self, mut events: mpsc::Receiver<Event>) {
		log_info!(self.logger, "Node {} dispatcher running", self.node_id);
		loop {
			tokio::select! {
				_ = self.shutdown.clone() => break,
				event = events.recv() => match event {
					Some(event) => self.handle_event(event).await,
					None => break,
				},
				// Reap finished background tasks so the set does not grow for the node's
				// lifetime.
				Some(finished) = self.tasks.join_next() => {
					if let Err(e) = finished {
						if e.is_panic() {
							log_error!(self.logger, "Background task panicked: {}", e);
						}
					}
				},
			}
		}
		log_info!(self.logger, "Node {} shutting down", self.node_id);
		self.payments.abort_all();
		self.peers.stop_all();
		if let Err(e) = self.db.put_routing_table(&self.graph) {
			log_error!(self.logger, "Failed to persist routing table at shutdown: {}", e);
		}
		if let Err(e) = self.db.put_node_directory(&self.directory) {
			log_error!(self.logger, "Failed to persist node directory at shutdown: {}", e);
		}
		self.tasks.shutdown().await;
	}

	async fn handle_event(&mut self, event: Event) {
		match event {
			Event::Request(req) => self.handle_request(req).await,
			Event::PeerMessage { node_id, msg } => self.handle_peer_message(node_id, msg),
			Event::PeerDisconnected { node_id, peer_id } => {
				self.handle_disconnect(node_id, peer_id)
			},
			Event::InboundConnection(conn) => {
				let _ = self.register_peer(conn, true, None);
			},
			Event::ConnectResult { host, result, notify } => {
				let expected = self.pending_connects.remove(&host).flatten();
				let outcome = match result {
					// A host resolved from the directory may have changed hands; the announced
					// identity must be the one the caller asked for.
					Ok(conn) => match expected {
						Some(id) if id != conn.their_node_id => {
							Err(ConnectError::HandshakeFailed(format!(
								"dialed {} but {} answered",
								id, conn.their_node_id
							)))
						},
						_ => self.register_peer(conn, false, Some(host)),
					},
					Err(TransportError::Handshake(e)) => Err(ConnectError::HandshakeFailed(e)),
					Err(e) => Err(ConnectError::ConnectionFailed(e.to_string())),
				};
				let _ = notify.send(outcome);
			},
			Event::FundingOutcome { node_id, channel_id, result } => {
				self.handle_funding_outcome(node_id, channel_id, result)
			},
			Event::PaymentTimeout { payment_hash } => self.payments.timeout(&payment_hash),
		}
	}

	async fn handle_request(&mut self, req: NodeRequest) {
		match req {
			NodeRequest::ConnectPeer { node_id, host, notify } => {
				self.handle_connect(node_id, host, notify)
			},
			NodeRequest::ListPeers { notify } => {
				let _ = notify.send(self.peers.list());
			},
			NodeRequest::OpenChannel {
				node_id,
				funding_satoshis,
				push_satoshis,
				min_confs,
				updates,
			} => self.handle_open_channel(node_id, funding_satoshis, push_satoshis, min_confs, updates),
			NodeRequest::ListChannels { notify } => {
				let summaries = self
					.switch
					.links()
					.into_iter()
					.map(|(counterparty, link)| ChannelSummary {
						counterparty,
						channel_point: link.channel_point,
						capacity: link.capacity,
						local_balance: link.local_balance,
						remote_balance: link.remote_balance,
					})
					.collect();
				let _ = notify.send(summaries);
			},
			NodeRequest::SendPayment { destination, amount_satoshis, payment_hash, notify } => {
				self.handle_send_payment(destination, amount_satoshis, payment_hash, notify)
			},
			NodeRequest::AddInvoice { amount_satoshis, notify } => {
				let _ = notify.send(self.invoices.add_invoice(amount_satoshis));
			},
			NodeRequest::FindPath {
				destination,
				amount_satoshis,
				max_paths,
				validate,
				timeout,
				notify,
			} => {
				let paths = self.candidate_paths(
					&destination,
					amount_satoshis,
					max_paths.unwrap_or(self.config.max_paths),
					validate,
					timeout.unwrap_or(self.config.payment_timeout),
				);
				let _ = notify.send(paths);
			},
			NodeRequest::RoutingTable { notify } => {
				let _ = notify.send(self.graph.clone());
			},
			NodeRequest::ClearNodeDirectory { notify } => {
				self.directory.clear();
				if let Err(e) = self.db.delete_node_directory() {
					log_error!(self.logger, "Failed to delete node directory: {}", e);
				}
				let _ = notify.send(());
			},
		}
	}

	fn handle_connect(
		&mut self, node_id: Option<NodeId>, host: Option<String>,
		notify: oneshot::Sender<Result<PeerSummary, ConnectError>>,
	) {
		if let Some(id) = &node_id {
			let already_dialing = self.pending_connects.values().any(|t| t.as_ref() == Some(id));
			if self.peers.contains(id) || already_dialing {
				let _ = notify.send(Err(ConnectError::DuplicateConnection));
				return;
			}
		}
		let host = match host.or_else(|| node_id.as_ref().and_then(|id| self.directory.get(id).cloned()))
		{
			Some(host) => host,
			None => {
				let _ = notify.send(Err(ConnectError::UnknownHost));
				return;
			},
		};
		if self.pending_connects.contains_key(&host) {
			let _ = notify.send(Err(ConnectError::DuplicateConnection));
			return;
		}
		self.pending_connects.insert(host.clone(), node_id);
		let transport = self.transport.clone();
		let local_id = self.node_id;
		let events = self.events_tx.clone();
		self.tasks.spawn(async move {
			let result =
				match tokio::time::timeout(CONNECT_TIMEOUT, transport.dial(&host, local_id)).await
				{
					Ok(result) => result,
					Err(_) => Err(TransportError::Io("connect timed out".to_string())),
				};
			let _ = events.send(Event::ConnectResult { host, result, notify }).await;
		});
	}

	fn register_peer(
		&mut self, conn: Connection, inbound: bool, host: Option<String>,
	) -> Result<PeerSummary, ConnectError> {
		let node_id = conn.their_node_id;
		if node_id == self.node_id {
			return Err(ConnectError::ConnectionFailed("connected to self".to_string()));
		}
		if self.peers.contains(&node_id) {
			return Err(ConnectError::DuplicateConnection);
		}
		let (outbound_tx, outbound_rx) = mpsc::channel(self.config.peer_outbound_queue);
		let (stop, stop_listener) = triggered::trigger();
		let peer_id = self.peers.next_peer_id();
		self.tasks.spawn(peer_write_loop(
			conn.writer,
			outbound_rx,
			stop_listener.clone(),
			self.logger.clone(),
			node_id,
		));
		self.tasks.spawn(peer_read_loop(
			conn.reader,
			node_id,
			peer_id,
			self.events_tx.clone(),
			stop_listener,
			self.logger.clone(),
		));
		self.peers.insert(Peer {
			node_id,
			peer_id,
			inbound,
			host: host.clone(),
			outbound: outbound_tx,
			stop,
		});
		if let Some(host) = host {
			let changed = self.directory.get(&node_id) != Some(&host);
			self.directory.insert(node_id, host);
			if changed {
				self.persist_directory();
			}
		}
		// Initial sync: ask the new peer for its view of the network.
		self.peers.send(&node_id, Message::RoutingTableRequest(Default::default()));
		self.peers.send(&node_id, Message::NodeDirectoryRequest(Default::default()));
		self.maybe_resume_funding(node_id);
		let summary = PeerSummary { node_id, peer_id, inbound, host: self.directory.get(&node_id).cloned() };
		Ok(summary)
	}

	fn maybe_resume_funding(&mut self, node_id: NodeId) {
		let snapshot = match self.pending_resumes.remove(&node_id) {
			Some(snapshot) => snapshot,
			None => return,
		};
		let peer_tx = match self.peers.get(&node_id) {
			Some(peer) => peer.outbound.clone(),
			None => return,
		};
		let (msg_tx, msg_rx) = mpsc::channel(WORKFLOW_MAILBOX_SIZE);
		if !self
			.funding
			.register(node_id, ActiveWorkflow { channel_id: snapshot.channel_id, msgs: msg_tx })
		{
			return;
		}
		let ctx = self.funding_ctx.clone();
		let events = self.events_tx.clone();
		let timeout = self.config.funding_timeout;
		let shutdown = self.shutdown.clone();
		let channel_id = snapshot.channel_id;
		self.tasks.spawn(async move {
			let result = funding::run_resume(snapshot, ctx, peer_tx, msg_rx, timeout, shutdown).await;
			let _ = events.send(Event::FundingOutcome { node_id, channel_id, result }).await;
		});
	}

	fn handle_open_channel(
		&mut self, node_id: NodeId, funding_satoshis: u64, push_satoshis: u64,
		min_confs: Option<u32>, updates: mpsc::UnboundedSender<FundingUpdate>,
	) {
		let peer_tx = match self.peers.get(&node_id) {
			Some(peer) => peer.outbound.clone(),
			None => {
				let _ = updates.send(FundingUpdate::Failed(FundingError::PeerNotConnected));
				return;
			},
		};
		let channel_id = ChannelId::new_random();
		let (msg_tx, msg_rx) = mpsc::channel(WORKFLOW_MAILBOX_SIZE);
		if !self.funding.register(node_id, ActiveWorkflow { channel_id, msgs: msg_tx }) {
			let _ = updates.send(FundingUpdate::Failed(FundingError::AlreadyInProgress));
			return;
		}
		let params = FundingParams {
			counterparty: node_id,
			channel_id,
			funding_satoshis,
			push_satoshis,
			min_confs: min_confs.unwrap_or(self.config.min_confs),
			limits: self.config.handshake_limits.clone(),
			timeout: self.config.funding_timeout,
		};
		let ctx = self.funding_ctx.clone();
		let events = self.events_tx.clone();
		let shutdown = self.shutdown.clone();
		self.tasks.spawn(async move {
			let result =
				funding::run_initiator(params, ctx, peer_tx, msg_rx, updates, shutdown).await;
			let _ = events.send(Event::FundingOutcome { node_id, channel_id, result }).await;
		});
	}

	fn handle_funding_outcome(
		&mut self, node_id: NodeId, channel_id: ChannelId,
		result: Result<ChannelDetails, FundingError>,
	) {
		// A workflow torn down by a disconnect can still report in after the peer reconnected
		// and a fresh workflow registered. Only the tracked workflow's outcome may act.
		if self.funding.active_channel(&node_id) != Some(channel_id) {
			log_debug!(
				self.logger,
				"Ignoring stale funding outcome {} for peer {}",
				channel_id,
				node_id
			);
			return;
		}
		self.funding.complete(&node_id);
		let details = match result {
			Ok(details) => details,
			Err(_) => return,
		};
		self.switch.add_link(node_id, Link {
			channel_point: details.channel_point,
			capacity: details.capacity,
			local_balance: details.local_balance,
			remote_balance: details.remote_balance,
		});
		let edge = ChannelEdge {
			channel_point: details.channel_point,
			capacity: details.capacity,
			weight: DEFAULT_EDGE_WEIGHT,
		};
		if self.graph.add_channel(self.node_id, node_id, edge) {
			self.persist_graph();
			let announcement = Message::RoutingTableResponse(RoutingTableResponse {
				channels: vec![AnnouncedChannel { node_a: self.node_id, node_b: node_id, edge }],
			});
			// The counterparty announces it from its own side.
			self.peers.broadcast(&announcement, Some(&node_id));
		}
	}

	fn handle_disconnect(&mut self, node_id: NodeId, peer_id: u64) {
		if self.peers.remove(&node_id, peer_id).is_none() {
			return;
		}
		// Dropping the workflow entry closes its mailbox, which the task sees as a disconnect.
		self.funding.complete(&node_id);
		for circuit in self.switch.drop_circuits_through(&node_id) {
			self.resolve_backward_fail(circuit, HtlcFailReason::NoRoute);
		}
		if let Some(link) = self.switch.remove_link(&node_id) {
			if self.graph.remove_channel(&link.channel_point) {
				self.persist_graph();
			}
		}
	}

	fn handle_peer_message(&mut self, node_id: NodeId, msg: Message) {
		match msg {
			Message::OpenChannel(open) => self.handle_inbound_open(node_id, open),
			msg @ (Message::AcceptChannel(_)
			| Message::FundingSigned(_)
			| Message::ChannelReady(_)
			| Message::Error(_)) => {
				if !self.funding.deliver(&node_id, msg) {
					log_debug!(
						self.logger,
						"Ignoring funding message from {} with no active workflow",
						node_id
					);
				}
			},
			Message::UpdateAddHtlc(add) => self.handle_htlc_add(node_id, add),
			Message::UpdateFulfillHtlc(fulfill) => self.handle_htlc_fulfill(node_id, fulfill),
			Message::UpdateFailHtlc(fail) => self.handle_htlc_fail(node_id, fail),
			Message::RoutingTableRequest(_) => {
				let channels = self
					.graph
					.all_channels()
					.map(|(pair, edge)| AnnouncedChannel { node_a: pair.a, node_b: pair.b, edge: *edge })
					.collect();
				self.peers
					.send(&node_id, Message::RoutingTableResponse(RoutingTableResponse { channels }));
			},
			Message::RoutingTableResponse(resp) => self.ingest_gossip(node_id, resp),
			Message::NodeDirectoryRequest(_) => {
				let mut entries: Vec<NodeDirectoryEntry> = self
					.directory
					.iter()
					.map(|(node_id, host)| NodeDirectoryEntry { node_id: *node_id, host: host.clone() })
					.collect();
				entries.sort_by_key(|e| e.node_id);
				self.peers
					.send(&node_id, Message::NodeDirectoryResponse(NodeDirectoryResponse { entries }));
			},
			Message::NodeDirectoryResponse(resp) => {
				let mut changed = false;
				for entry in resp.entries {
					if entry.node_id == self.node_id {
						continue;
					}
					// First-hand knowledge wins over gossip.
					if !self.directory.contains_key(&entry.node_id) {
						self.directory.insert(entry.node_id, entry.host);
						changed = true;
					}
				}
				if changed {
					self.persist_directory();
				}
			},
		}
	}

	fn handle_inbound_open(&mut self, node_id: NodeId, open: OpenChannel) {
		let channel_id = open.temporary_channel_id;
		let peer_tx = match self.peers.get(&node_id) {
			Some(peer) => peer.outbound.clone(),
			None => return,
		};
		let (msg_tx, msg_rx) = mpsc::channel(WORKFLOW_MAILBOX_SIZE);
		if !self.funding.register(node_id, ActiveWorkflow { channel_id, msgs: msg_tx }) {
			self.peers.send(
				&node_id,
				Message::Error(ErrorMessage {
					channel_id,
					data: FundingError::AlreadyInProgress.to_string(),
				}),
			);
			return;
		}
		let min_confs = self.config.min_confs;
		let limits = self.config.handshake_limits.clone();
		let timeout = self.config.funding_timeout;
		let ctx = self.funding_ctx.clone();
		let events = self.events_tx.clone();
		let shutdown = self.shutdown.clone();
		self.tasks.spawn(async move {
			let result = funding::run_responder(
				open, node_id, min_confs, limits, timeout, ctx, peer_tx, msg_rx, shutdown,
			)
			.await;
			let _ = events.send(Event::FundingOutcome { node_id, channel_id, result }).await;
		});
	}

	fn ingest_gossip(&mut self, from: NodeId, resp: RoutingTableResponse) {
		let mut fresh = Vec::new();
		for announced in resp.channels {
			if self.graph.add_channel(announced.node_a, announced.node_b, announced.edge) {
				fresh.push(announced);
			}
		}
		if fresh.is_empty() {
			return;
		}
		log_gossip!(self.logger, "Learned {} channel(s) from {}", fresh.len(), from);
		self.persist_graph();
		// Only newly-learned edges travel onward, so gossip floods terminate.
		let msg = Message::RoutingTableResponse(RoutingTableResponse { channels: fresh });
		self.peers.broadcast(&msg, Some(&from));
	}

	fn handle_htlc_add(&mut self, from: NodeId, add: UpdateAddHtlc) {
		if !self.switch.accept_incoming(&from, add.amount_satoshis) {
			self.peers.send(
				&from,
				Message::UpdateFailHtlc(UpdateFailHtlc {
					htlc_id: add.htlc_id,
					reason: HtlcFailReason::InsufficientLiquidity,
				}),
			);
			return;
		}
		if add.onward_route.is_empty() {
			match self.invoices.settle(&add.payment_hash, add.amount_satoshis) {
				Ok(preimage) => {
					self.switch.settle_incoming(&from, add.amount_satoshis);
					self.peers.send(
						&from,
						Message::UpdateFulfillHtlc(UpdateFulfillHtlc {
							htlc_id: add.htlc_id,
							payment_preimage: preimage,
						}),
					);
				},
				Err(reason) => {
					self.switch.fail_incoming(&from, add.amount_satoshis);
					self.peers.send(
						&from,
						Message::UpdateFailHtlc(UpdateFailHtlc { htlc_id: add.htlc_id, reason }),
					);
				},
			}
			return;
		}
		let next_hop = add.onward_route[0];
		let rest = add.onward_route[1..].to_vec();
		let source = HtlcSource::Peer { node_id: from, htlc_id: add.htlc_id };
		match self.switch.send_htlc(
			next_hop,
			add.payment_hash,
			add.amount_satoshis,
			add.cltv_expiry,
			rest,
			source,
		) {
			Ok(out) => {
				if !self.peers.send(&next_hop, Message::UpdateAddHtlc(out.clone())) {
					self.switch.fail_outgoing(&next_hop, out.htlc_id);
					self.switch.fail_incoming(&from, add.amount_satoshis);
					self.peers.send(
						&from,
						Message::UpdateFailHtlc(UpdateFailHtlc {
							htlc_id: add.htlc_id,
							reason: HtlcFailReason::NoRoute,
						}),
					);
				}
			},
			Err(reason) => {
				self.switch.fail_incoming(&from, add.amount_satoshis);
				self.peers.send(
					&from,
					Message::UpdateFailHtlc(UpdateFailHtlc { htlc_id: add.htlc_id, reason }),
				);
			},
		}
	}

	fn handle_htlc_fulfill(&mut self, from: NodeId, fulfill: UpdateFulfillHtlc) {
		let payment_hash = match self.switch.outgoing_payment_hash(&from, fulfill.htlc_id) {
			Some(hash) => hash,
			None => {
				log_debug!(self.logger, "Fulfill from {} for unknown HTLC {}", from, fulfill.htlc_id);
				return;
			},
		};
		// The preimage is the proof of payment; the downstream peer earns nothing without it,
		// and the upstream HTLC still has to resolve.
		if fulfill.payment_preimage.payment_hash() != payment_hash {
			log_warn!(
				self.logger,
				"Peer {} fulfilled HTLC {} with a bogus preimage",
				from,
				fulfill.htlc_id
			);
			if let Some(circuit) = self.switch.fail_outgoing(&from, fulfill.htlc_id) {
				self.resolve_backward_fail(circuit, HtlcFailReason::InvalidPreimage);
			}
			return;
		}
		let circuit = match self.switch.settle_outgoing(&from, fulfill.htlc_id) {
			Some(circuit) => circuit,
			None => return,
		};
		match circuit.source {
			HtlcSource::Local { payment_hash } => {
				self.payments.succeed(&payment_hash, fulfill.payment_preimage);
			},
			HtlcSource::Peer { node_id, htlc_id } => {
				self.switch.settle_incoming(&node_id, circuit.amount_satoshis);
				self.peers.send(
					&node_id,
					Message::UpdateFulfillHtlc(UpdateFulfillHtlc {
						htlc_id,
						payment_preimage: fulfill.payment_preimage,
					}),
				);
			},
		}
	}

	fn handle_htlc_fail(&mut self, from: NodeId, fail: UpdateFailHtlc) {
		let circuit = match self.switch.fail_outgoing(&from, fail.htlc_id) {
			Some(circuit) => circuit,
			None => return,
		};
		self.resolve_backward_fail(circuit, fail.reason);
	}

	fn resolve_backward_fail(&mut self, circuit: Circuit, reason: HtlcFailReason) {
		match circuit.source {
			HtlcSource::Local { payment_hash } => {
				if let Some(next) = self.payments.handle_failure(&payment_hash, reason) {
					self.dispatch_payment_path(payment_hash, circuit.amount_satoshis, next);
				}
			},
			HtlcSource::Peer { node_id, htlc_id } => {
				self.switch.fail_incoming(&node_id, circuit.amount_satoshis);
				self.peers
					.send(&node_id, Message::UpdateFailHtlc(UpdateFailHtlc { htlc_id, reason }));
			},
		}
	}

	fn candidate_paths(
		&self, destination: &NodeId, amount_satoshis: u64, max_paths: usize, validate: bool,
		timeout: Duration,
	) -> Vec<PathCandidate> {
		let switch = &self.switch;
		let mut check = |hop: &NodeId, amt: u64| switch.can_send(hop, amt);
		find_paths(
			&self.graph,
			&self.node_id,
			destination,
			amount_satoshis,
			max_paths,
			if validate { Some(&mut check) } else { None },
			Some(std::time::Instant::now() + timeout),
		)
	}

	fn validated_paths(&self, destination: &NodeId, amount_satoshis: u64) -> Vec<PathCandidate> {
		self.candidate_paths(
			destination,
			amount_satoshis,
			self.config.max_paths,
			true,
			self.config.payment_timeout,
		)
	}

	fn handle_send_payment(
		&mut self, destination: NodeId, amount_satoshis: u64, payment_hash: PaymentHash,
		notify: PaymentResultSender,
	) {
		let candidates = self.validated_paths(&destination, amount_satoshis);
		let first = match self.payments.begin(
			destination,
			amount_satoshis,
			payment_hash,
			candidates,
			notify,
		) {
			Some(first) => first,
			None => return,
		};
		// A lost HTLC must not hang the caller forever.
		let events = self.events_tx.clone();
		let deadline = self.config.payment_timeout;
		let shutdown = self.shutdown.clone();
		self.tasks.spawn(async move {
			tokio::select! {
				_ = shutdown.clone() => {},
				_ = tokio::time::sleep(deadline) => {
					let _ = events.send(Event::PaymentTimeout { payment_hash }).await;
				},
			}
		});
		self.dispatch_payment_path(payment_hash, amount_satoshis, first);
	}

	fn dispatch_payment_path(
		&mut self, payment_hash: PaymentHash, amount_satoshis: u64, mut path: PathCandidate,
	) {
		loop {
			let first_hop = match path.hops.first() {
				Some(hop) => *hop,
				None => {
					if let Some(next) = self.payments.handle_failure(&payment_hash, HtlcFailReason::NoRoute)
					{
						path = next;
						continue;
					}
					return;
				},
			};
			let rest = path.hops[1..].to_vec();
			match self.switch.send_htlc(
				first_hop,
				payment_hash,
				amount_satoshis,
				self.config.cltv_start,
				rest,
				HtlcSource::Local { payment_hash },
			) {
				Ok(add) => {
					if self.peers.send(&first_hop, Message::UpdateAddHtlc(add.clone())) {
						return;
					}
					self.switch.fail_outgoing(&first_hop, add.htlc_id);
					match self.payments.handle_failure(&payment_hash, HtlcFailReason::NoRoute) {
						Some(next) => path = next,
						None => return,
					}
				},
				Err(reason) => match self.payments.handle_failure(&payment_hash, reason) {
					Some(next) => path = next,
					None => return,
				},
			}
		}
	}

	fn persist_graph(&self) {
		if let Err(e) = self.db.put_routing_table(&self.graph) {
			log_error!(self.logger, "Failed to persist routing table: {}", e);
		}
	}

	fn persist_directory(&self) {
		if let Err(e) = self.db.put_node_directory(&self.directory) {
			log_error!(self.logger, "Failed to persist node directory: {}", e);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::chain::simnet::SimnetChain;
	use crate::sign::{SimnetSigner, SimnetWallet};
	use crate::util::persist::MemoryStore;
	use crate::util::test_utils::{MemTransport, TestLogger};
	use bitcoin::hashes::Hash;
	use bitcoin::Txid;

	fn dispatcher(
		logger: Arc<TestLogger>,
	) -> (Dispatcher, mpsc::Receiver<Event>, triggered::Trigger) {
		let db = Arc::new(NodeDb::new(Arc::new(MemoryStore::new())));
		let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
		let (trigger, shutdown) = triggered::trigger();
		let dispatcher = Dispatcher {
			node_id: NodeId([1; 32]),
			funding_ctx: FundingContext {
				signer: Arc::new(SimnetSigner::new([1; 32])),
				wallet: Arc::new(SimnetWallet::new(0)),
				chain: Arc::new(SimnetChain::new()),
				db: db.clone(),
				logger: logger.clone(),
			},
			transport: Arc::new(MemTransport::new()),
			db,
			events_tx,
			peers: PeerRegistry::new(logger.clone()),
			pending_connects: HashMap::new(),
			funding: FundingManager::new(logger.clone()),
			switch: HtlcSwitch::new(6, logger.clone()),
			graph: NetworkGraph::new(),
			directory: HashMap::new(),
			payments: PaymentManager::new(3, logger.clone()),
			invoices: InvoiceRegistry::new(logger.clone()),
			pending_resumes: HashMap::new(),
			tasks: JoinSet::new(),
			shutdown,
			logger,
			config: NodeConfig::default(),
		};
		(dispatcher, events_rx, trigger)
	}

	fn outpoint(byte: u8) -> OutPoint {
		OutPoint { txid: Txid::from_byte_array([byte; 32]), index: 0 }
	}

	#[tokio::test]
	async fn stale_funding_outcome_leaves_fresh_workflow_registered() {
		let logger = Arc::new(TestLogger::new());
		let (mut dispatcher, _events, _trigger) = dispatcher(logger);
		let peer = NodeId([2; 32]);
		let fresh_id = ChannelId([2; 32]);
		let (msg_tx, mut msg_rx) = mpsc::channel(WORKFLOW_MAILBOX_SIZE);
		assert!(dispatcher.funding.register(peer, ActiveWorkflow { channel_id: fresh_id, msgs: msg_tx }));

		// A workflow torn down in an earlier session reports in after its replacement
		// registered; the replacement must keep its mailbox.
		dispatcher.handle_funding_outcome(peer, ChannelId([1; 32]), Err(FundingError::Disconnected));
		assert!(dispatcher.funding.is_active(&peer));
		assert!(dispatcher.funding.deliver(&peer, Message::RoutingTableRequest(Default::default())));
		assert!(msg_rx.try_recv().is_ok());

		// The matching outcome clears the entry.
		dispatcher.handle_funding_outcome(peer, fresh_id, Err(FundingError::Disconnected));
		assert!(!dispatcher.funding.is_active(&peer));
	}

	#[tokio::test]
	async fn bogus_preimage_fails_the_circuit_backward() {
		let logger = Arc::new(TestLogger::new());
		let (mut dispatcher, _events, _trigger) = dispatcher(logger);
		let upstream = NodeId([2; 32]);
		let downstream = NodeId([3; 32]);
		dispatcher.switch.add_link(upstream, Link {
			channel_point: outpoint(8),
			capacity: 1_000,
			local_balance: 500,
			remote_balance: 500,
		});
		dispatcher.switch.add_link(downstream, Link {
			channel_point: outpoint(9),
			capacity: 1_000,
			local_balance: 500,
			remote_balance: 500,
		});
		let (outbound, mut upstream_rx) = mpsc::channel(4);
		let peer_id = dispatcher.peers.next_peer_id();
		dispatcher.peers.insert(Peer {
			node_id: upstream,
			peer_id,
			inbound: true,
			host: None,
			outbound,
			stop: triggered::trigger().0,
		});

		// A forwarded HTLC: offered by upstream, sent onward to downstream.
		let hash = PaymentPreimage([5; 32]).payment_hash();
		assert!(dispatcher.switch.accept_incoming(&upstream, 100));
		let add = dispatcher
			.switch
			.send_htlc(downstream, hash, 100, 144, Vec::new(), HtlcSource::Peer {
				node_id: upstream,
				htlc_id: 42,
			})
			.unwrap();

		dispatcher.handle_htlc_fulfill(downstream, UpdateFulfillHtlc {
			htlc_id: add.htlc_id,
			payment_preimage: PaymentPreimage([6; 32]),
		});

		// The downstream peer earned nothing and the upstream HTLC was failed, not dropped.
		let down = dispatcher.switch.link(&downstream).unwrap();
		assert_eq!(down.local_balance, 500);
		assert_eq!(down.remote_balance, 500);
		match upstream_rx.try_recv().unwrap() {
			Message::UpdateFailHtlc(fail) => {
				assert_eq!(fail.htlc_id, 42);
				assert_eq!(fail.reason, HtlcFailReason::InvalidPreimage);
			},
			other => panic!("expected update_fail_htlc, got {}", other.name()),
		}
		assert_eq!(dispatcher.switch.link(&upstream).unwrap().remote_balance, 500);
	}

	#[tokio::test]
	async fn run_loop_reaps_finished_tasks() {
		let logger = Arc::new(TestLogger::new());
		let (mut dispatcher, events, trigger) = dispatcher(logger.clone());
		dispatcher.tasks.spawn(async { panic!("task blew up") });
		let run = tokio::spawn(dispatcher.run(events));

		for _ in 0..500 {
			if logger.lines_containing("Background task panicked") == 1 {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		assert_eq!(logger.lines_containing("Background task panicked"), 1);
		trigger.trigger();
		run.await.unwrap();
	}
}
