// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The channel funding workflow: a per-attempt state machine run as its own task, exchanging
//! wire messages with the counterparty via a mailbox the dispatcher forwards into, and reaching
//! a terminal `Open` or `Failed` state which the dispatcher acts on.
//!
//! Workflow snapshots are persisted while waiting for confirmations so that a restart can pick
//! the wait back up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::hashes::{sha256d, Hash};
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use bitcoin::Txid;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::chain::transaction::OutPoint;
use crate::chain::ChainNotifier;
use crate::ln::msgs::{
	AcceptChannel, ChannelReady, ErrorMessage, FundingSigned, Message, OpenChannel,
};
use crate::ln::{ChannelId, NodeId};
use crate::sign::{funding_input_message, Signer, WalletController};
use crate::util::config::ChannelHandshakeLimits;
use crate::util::errors::FundingError;
use crate::util::logger::Logger;
use crate::util::persist::NodeDb;
use crate::util::ser::Writeable;

/// How many counterparty messages the dispatcher may buffer toward a workflow before it applies
/// backpressure by dropping.
pub const WORKFLOW_MAILBOX_SIZE: usize = 8;

/// The states a funding workflow moves through, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FundingState {
	/// Parameters validated, nothing sent yet.
	Init,
	/// `open_channel` sent (or, for the responder, `accept_channel`).
	OpenSent,
	/// Negotiation agreed; the funding transaction is being built and signed.
	AwaitingFundingTx,
	/// The funding transaction is broadcast; waiting for the agreed confirmation depth.
	AwaitingConfirmations(u32),
	/// The channel is open and usable.
	Open,
	/// The workflow failed and will make no further progress.
	Failed(FundingError),
}

/// A progress report streamed to the caller of open_channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FundingUpdate {
	/// The workflow moved to a new non-terminal state.
	StateChange(FundingState),
	/// The workflow completed and the channel is usable.
	ChannelOpen(ChannelDetails),
	/// The workflow failed.
	Failed(FundingError),
}

/// A channel this node has open, as reported by list_channels and in the terminal funding
/// update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelDetails {
	/// The (temporary) id under which the channel was negotiated.
	pub channel_id: ChannelId,
	/// The funding outpoint.
	pub channel_point: OutPoint,
	/// The peer on the other end.
	pub counterparty: NodeId,
	/// Total channel capacity in satoshis.
	pub capacity: u64,
	/// Satoshis on our side at open.
	pub local_balance: u64,
	/// Satoshis on the counterparty's side at open.
	pub remote_balance: u64,
}

/// The persisted form of a workflow waiting for confirmations, sufficient to resume the wait
/// after a restart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FundingSnapshot {
	/// The negotiation id, also the persistence key.
	pub channel_id: ChannelId,
	/// The counterparty's identity.
	pub counterparty: NodeId,
	/// The funding outpoint being waited on.
	pub channel_point: OutPoint,
	/// Total channel capacity in satoshis.
	pub capacity: u64,
	/// Satoshis on our side once open.
	pub local_balance: u64,
	/// Satoshis on the counterparty's side once open.
	pub remote_balance: u64,
	/// The confirmation depth agreed during negotiation.
	pub min_confs: u32,
	/// Whether this node initiated the open.
	pub initiator: bool,
}
impl_writeable!(FundingSnapshot, {
	channel_id,
	counterparty,
	channel_point,
	capacity,
	local_balance,
	remote_balance,
	min_confs,
	initiator
});

impl FundingSnapshot {
	/// The channel details this snapshot resolves to once the wait completes.
	pub fn details(&self) -> ChannelDetails {
		ChannelDetails {
			channel_id: self.channel_id,
			channel_point: self.channel_point,
			counterparty: self.counterparty,
			capacity: self.capacity,
			local_balance: self.local_balance,
			remote_balance: self.remote_balance,
		}
	}
}

/// The parameters a single workflow runs with.
#[derive(Clone, Debug)]
pub struct FundingParams {
	/// The counterparty's identity.
	pub counterparty: NodeId,
	/// The negotiation id.
	pub channel_id: ChannelId,
	/// Total amount the initiator funds, in satoshis.
	pub funding_satoshis: u64,
	/// Amount pushed to the counterparty at open, in satoshis.
	pub push_satoshis: u64,
	/// The confirmation depth this node wants.
	pub min_confs: u32,
	/// Local policy limits on what the counterparty may ask for.
	pub limits: ChannelHandshakeLimits,
	/// How long the whole workflow may take before failing with `Timeout`.
	pub timeout: Duration,
}

/// The collaborators a workflow task reaches out to.
#[derive(Clone)]
pub struct FundingContext {
	/// Key derivation and signing.
	pub signer: Arc<dyn Signer>,
	/// Funding amount reservation.
	pub wallet: Arc<dyn WalletController>,
	/// Confirmation notifications.
	pub chain: Arc<dyn ChainNotifier>,
	/// Snapshot persistence.
	pub db: Arc<NodeDb>,
	/// Where to log.
	pub logger: Arc<dyn Logger>,
}

/// A workflow the dispatcher is currently forwarding counterparty messages to.
pub struct ActiveWorkflow {
	/// The negotiation id of the workflow.
	pub channel_id: ChannelId,
	/// The workflow task's mailbox.
	pub msgs: mpsc::Sender<Message>,
}

/// Tracks the at-most-one active funding workflow per peer. Owned by the dispatcher.
pub struct FundingManager {
	active: HashMap<NodeId, ActiveWorkflow>,
	logger: Arc<dyn Logger>,
}

impl FundingManager {
	/// Creates an empty manager.
	pub fn new(logger: Arc<dyn Logger>) -> Self {
		FundingManager { active: HashMap::new(), logger }
	}

	/// Whether a workflow with the given peer is in progress.
	pub fn is_active(&self, peer: &NodeId) -> bool {
		self.active.contains_key(peer)
	}

	/// The negotiation id of the peer's active workflow, if any.
	pub fn active_channel(&self, peer: &NodeId) -> Option<ChannelId> {
		self.active.get(peer).map(|w| w.channel_id)
	}

	/// Registers a workflow with a peer. Returns false (registering nothing) if one is already
	/// in progress with that peer.
	pub fn register(&mut self, peer: NodeId, workflow: ActiveWorkflow) -> bool {
		if self.active.contains_key(&peer) {
			return false;
		}
		log_debug!(
			self.logger,
			"Tracking funding workflow {} with peer {}",
			workflow.channel_id,
			peer
		);
		self.active.insert(peer, workflow);
		true
	}

	/// Forwards a counterparty message to the peer's active workflow, if any. Returns false if
	/// no workflow is active or its mailbox is gone.
	pub fn deliver(&mut self, peer: &NodeId, msg: Message) -> bool {
		match self.active.get(peer) {
			Some(workflow) => workflow.msgs.try_send(msg).is_ok(),
			None => false,
		}
	}

	/// Drops the tracking entry for a peer's workflow after it reached a terminal state.
	pub fn complete(&mut self, peer: &NodeId) {
		self.active.remove(peer);
	}

	/// The peers with an active workflow.
	pub fn active_peers(&self) -> Vec<NodeId> {
		self.active.keys().copied().collect()
	}
}

/// Builds the canonical funding transaction bytes for a negotiation. Both sides derive the same
/// bytes from the negotiated parameters, so the responder can check the announced channel point
/// and signature without the initiator shipping the transaction itself.
pub fn build_funding_tx(
	channel_id: &ChannelId, funding_satoshis: u64, initiator_key: &PublicKey,
	responder_key: &PublicKey,
) -> Vec<u8> {
	let mut tx = Vec::with_capacity(32 + 8 + 33 + 33);
	tx.extend_from_slice(&channel_id.0);
	tx.extend_from_slice(&funding_satoshis.to_be_bytes());
	tx.extend_from_slice(&initiator_key.serialize());
	tx.extend_from_slice(&responder_key.serialize());
	tx
}

/// The txid of a funding transaction built by [`build_funding_tx`].
pub fn funding_txid(tx: &[u8]) -> Txid {
	Txid::from_byte_array(sha256d::Hash::hash(tx).to_byte_array())
}

/// Checks an initiator's funding-input signature against its announced funding key.
pub fn verify_funding_signature(
	tx: &[u8], input_index: u32, signature: &Signature, key: &PublicKey,
) -> bool {
	let secp = Secp256k1::verification_only();
	secp.verify_ecdsa(&funding_input_message(tx, input_index), signature, key).is_ok()
}

fn state_change(updates: &mpsc::UnboundedSender<FundingUpdate>, state: FundingState) {
	let _ = updates.send(FundingUpdate::StateChange(state));
}

async fn next_msg(
	msgs: &mut mpsc::Receiver<Message>, deadline: Instant, shutdown: &triggered::Listener,
) -> Result<Message, FundingError> {
	tokio::select! {
		_ = shutdown.clone() => Err(FundingError::NodeShuttingDown),
		_ = tokio::time::sleep_until(deadline) => Err(FundingError::Timeout),
		msg = msgs.recv() => msg.ok_or(FundingError::Disconnected),
	}
}

async fn send_peer(peer_tx: &mpsc::Sender<Message>, msg: Message) -> Result<(), FundingError> {
	peer_tx.send(msg).await.map_err(|_| FundingError::Disconnected)
}

/// Waits for the funding transaction to reach depth, stashing an early `channel_ready` from the
/// counterparty, then performs the `channel_ready` exchange.
async fn confirm_and_ready(
	ctx: &FundingContext, channel_point: OutPoint, depth: u32, peer_tx: &mpsc::Sender<Message>,
	msgs: &mut mpsc::Receiver<Message>, deadline: Instant, shutdown: &triggered::Listener,
) -> Result<(), FundingError> {
	let mut confirmation = ctx.chain.register_confirmations(&channel_point.txid, depth);
	let mut their_ready = false;
	loop {
		tokio::select! {
			_ = shutdown.clone() => return Err(FundingError::NodeShuttingDown),
			_ = tokio::time::sleep_until(deadline) => return Err(FundingError::Timeout),
			confirmed = &mut confirmation.confirmed => {
				let height = confirmed.map_err(|_| FundingError::Timeout)?;
				log_debug!(
					ctx.logger,
					"Funding tx {} reached depth {} at height {}",
					channel_point.txid,
					depth,
					height
				);
				break;
			},
			msg = msgs.recv() => match msg {
				Some(Message::ChannelReady(ready)) if ready.channel_point == channel_point => {
					their_ready = true;
				},
				Some(Message::Error(e)) => return Err(FundingError::Rejected(e.data)),
				Some(_) => {},
				None => return Err(FundingError::Disconnected),
			},
		}
	}
	send_peer(peer_tx, Message::ChannelReady(ChannelReady { channel_point })).await?;
	while !their_ready {
		match next_msg(msgs, deadline, shutdown).await? {
			Message::ChannelReady(ready) if ready.channel_point == channel_point => {
				their_ready = true;
			},
			Message::Error(e) => return Err(FundingError::Rejected(e.data)),
			_ => {},
		}
	}
	Ok(())
}

async fn initiate(
	params: &FundingParams, ctx: &FundingContext, peer_tx: &mpsc::Sender<Message>,
	msgs: &mut mpsc::Receiver<Message>, updates: &mpsc::UnboundedSender<FundingUpdate>,
	shutdown: &triggered::Listener, spent: &mut bool,
) -> Result<ChannelDetails, FundingError> {
	let deadline = Instant::now() + params.timeout;
	let our_key = ctx.signer.derive_funding_key(&params.channel_id);

	state_change(updates, FundingState::OpenSent);
	send_peer(
		peer_tx,
		Message::OpenChannel(OpenChannel {
			temporary_channel_id: params.channel_id,
			funding_satoshis: params.funding_satoshis,
			push_satoshis: params.push_satoshis,
			minimum_depth: params.min_confs,
			funding_pubkey: our_key,
		}),
	)
	.await?;

	let accept = loop {
		match next_msg(msgs, deadline, shutdown).await? {
			Message::AcceptChannel(accept)
				if accept.temporary_channel_id == params.channel_id =>
			{
				break accept;
			},
			Message::Error(e) => return Err(FundingError::Rejected(e.data)),
			_ => {},
		}
	};
	if accept.minimum_depth > params.limits.max_minimum_depth {
		return Err(FundingError::PolicyViolation(format!(
			"counterparty wants depth {} over our limit {}",
			accept.minimum_depth, params.limits.max_minimum_depth
		)));
	}
	let depth = params.min_confs.max(accept.minimum_depth);

	state_change(updates, FundingState::AwaitingFundingTx);
	let tx = build_funding_tx(
		&params.channel_id,
		params.funding_satoshis,
		&our_key,
		&accept.funding_pubkey,
	);
	let channel_point = OutPoint { txid: funding_txid(&tx), index: 0 };
	let signature =
		ctx.signer.sign_input(&params.channel_id, &tx, 0).map_err(|_| FundingError::SignerUnavailable)?;
	// Reservation becomes channel capacity at broadcast. From here on a failure must not
	// release funds: the reservation is gone, and a release would free another workflow's.
	ctx.wallet.spend_funds(params.funding_satoshis);
	*spent = true;
	send_peer(
		peer_tx,
		Message::FundingSigned(FundingSigned {
			temporary_channel_id: params.channel_id,
			channel_point,
			signature,
		}),
	)
	.await?;

	let snapshot = FundingSnapshot {
		channel_id: params.channel_id,
		counterparty: params.counterparty,
		channel_point,
		capacity: params.funding_satoshis,
		local_balance: params.funding_satoshis - params.push_satoshis,
		remote_balance: params.push_satoshis,
		min_confs: depth,
		initiator: true,
	};
	if let Err(e) = ctx.db.put_funding_state(&snapshot) {
		log_error!(ctx.logger, "Failed to persist funding snapshot {}: {}", params.channel_id, e);
	}
	state_change(updates, FundingState::AwaitingConfirmations(depth));
	confirm_and_ready(ctx, channel_point, depth, peer_tx, msgs, deadline, shutdown).await?;
	Ok(snapshot.details())
}

/// Runs an initiator workflow to completion, streaming state updates and cleaning up the
/// persisted snapshot. The local funding amount is reserved up front and released again only if
/// the workflow fails before the funding transaction is committed.
pub async fn run_initiator(
	params: FundingParams, ctx: FundingContext, peer_tx: mpsc::Sender<Message>,
	mut msgs: mpsc::Receiver<Message>, updates: mpsc::UnboundedSender<FundingUpdate>,
	shutdown: triggered::Listener,
) -> Result<ChannelDetails, FundingError> {
	state_change(&updates, FundingState::Init);
	if params.push_satoshis > params.funding_satoshis {
		let err = FundingError::PolicyViolation("push amount exceeds funding amount".to_string());
		let _ = updates.send(FundingUpdate::Failed(err.clone()));
		return Err(err);
	}
	if ctx.wallet.reserve_funds(params.funding_satoshis).is_err() {
		let err = FundingError::InsufficientFunds;
		let _ = updates.send(FundingUpdate::Failed(err.clone()));
		return Err(err);
	}
	let mut spent = false;
	let res = initiate(&params, &ctx, &peer_tx, &mut msgs, &updates, &shutdown, &mut spent).await;
	let _ = ctx.db.remove_funding_state(&params.channel_id);
	match &res {
		Ok(details) => {
			log_info!(
				ctx.logger,
				"Channel {} with {} open with capacity {}",
				details.channel_point,
				details.counterparty,
				details.capacity
			);
			let _ = updates.send(FundingUpdate::ChannelOpen(details.clone()));
		},
		Err(e) => {
			log_info!(
				ctx.logger,
				"Funding workflow {} with {} failed: {}",
				params.channel_id,
				params.counterparty,
				e
			);
			if !spent {
				ctx.wallet.release_funds(params.funding_satoshis);
			}
			let _ = updates.send(FundingUpdate::Failed(e.clone()));
		},
	}
	res
}

async fn respond(
	open: &OpenChannel, counterparty: NodeId, min_confs: u32, limits: &ChannelHandshakeLimits,
	timeout: Duration, ctx: &FundingContext, peer_tx: &mpsc::Sender<Message>,
	msgs: &mut mpsc::Receiver<Message>, shutdown: &triggered::Listener,
) -> Result<ChannelDetails, FundingError> {
	let deadline = Instant::now() + timeout;
	if open.funding_satoshis > limits.max_funding_satoshis {
		return Err(FundingError::PolicyViolation(format!(
			"funding amount {} over our limit {}",
			open.funding_satoshis, limits.max_funding_satoshis
		)));
	}
	if open.push_satoshis > open.funding_satoshis {
		return Err(FundingError::PolicyViolation(
			"push amount exceeds funding amount".to_string(),
		));
	}
	if open.minimum_depth > limits.max_minimum_depth {
		return Err(FundingError::PolicyViolation(format!(
			"counterparty wants depth {} over our limit {}",
			open.minimum_depth, limits.max_minimum_depth
		)));
	}
	let depth = min_confs.max(open.minimum_depth);
	let our_key = ctx.signer.derive_funding_key(&open.temporary_channel_id);
	send_peer(
		peer_tx,
		Message::AcceptChannel(AcceptChannel {
			temporary_channel_id: open.temporary_channel_id,
			minimum_depth: min_confs,
			funding_pubkey: our_key,
		}),
	)
	.await?;

	let signed = loop {
		match next_msg(msgs, deadline, shutdown).await? {
			Message::FundingSigned(signed)
				if signed.temporary_channel_id == open.temporary_channel_id =>
			{
				break signed;
			},
			Message::Error(e) => return Err(FundingError::Rejected(e.data)),
			_ => {},
		}
	};
	let tx = build_funding_tx(
		&open.temporary_channel_id,
		open.funding_satoshis,
		&open.funding_pubkey,
		&our_key,
	);
	let channel_point = OutPoint { txid: funding_txid(&tx), index: 0 };
	if signed.channel_point != channel_point
		|| !verify_funding_signature(&tx, 0, &signed.signature, &open.funding_pubkey)
	{
		return Err(FundingError::SignatureInvalid);
	}

	let snapshot = FundingSnapshot {
		channel_id: open.temporary_channel_id,
		counterparty,
		channel_point,
		capacity: open.funding_satoshis,
		local_balance: open.push_satoshis,
		remote_balance: open.funding_satoshis - open.push_satoshis,
		min_confs: depth,
		initiator: false,
	};
	if let Err(e) = ctx.db.put_funding_state(&snapshot) {
		log_error!(
			ctx.logger,
			"Failed to persist funding snapshot {}: {}",
			open.temporary_channel_id,
			e
		);
	}
	confirm_and_ready(ctx, channel_point, depth, peer_tx, msgs, deadline, shutdown).await?;
	Ok(snapshot.details())
}

/// Runs a responder workflow to completion for a validated inbound `open_channel`. Rejections
/// are reported to the counterparty with a wire `error` before failing.
pub async fn run_responder(
	open: OpenChannel, counterparty: NodeId, min_confs: u32, limits: ChannelHandshakeLimits,
	timeout: Duration, ctx: FundingContext, peer_tx: mpsc::Sender<Message>,
	mut msgs: mpsc::Receiver<Message>, shutdown: triggered::Listener,
) -> Result<ChannelDetails, FundingError> {
	let channel_id = open.temporary_channel_id;
	let res =
		respond(&open, counterparty, min_confs, &limits, timeout, &ctx, &peer_tx, &mut msgs, &shutdown)
			.await;
	let _ = ctx.db.remove_funding_state(&channel_id);
	match &res {
		Ok(details) => {
			log_info!(
				ctx.logger,
				"Channel {} with {} open with capacity {}",
				details.channel_point,
				details.counterparty,
				details.capacity
			);
		},
		Err(e) => {
			log_info!(
				ctx.logger,
				"Inbound funding workflow {} from {} failed: {}",
				channel_id,
				counterparty,
				e
			);
			let _ = peer_tx
				.send(Message::Error(ErrorMessage { channel_id, data: e.to_string() }))
				.await;
		},
	}
	res
}

/// Resumes a persisted workflow after a restart: re-registers the confirmation wait and redoes
/// the `channel_ready` exchange. The counterparty must be connected; the dispatcher fails
/// snapshots for unconnected peers without calling this.
pub async fn run_resume(
	snapshot: FundingSnapshot, ctx: FundingContext, peer_tx: mpsc::Sender<Message>,
	mut msgs: mpsc::Receiver<Message>, timeout: Duration, shutdown: triggered::Listener,
) -> Result<ChannelDetails, FundingError> {
	let deadline = Instant::now() + timeout;
	log_info!(
		ctx.logger,
		"Resuming {} funding workflow {} with {} at depth {}",
		if snapshot.initiator { "initiated" } else { "accepted" },
		snapshot.channel_id,
		snapshot.counterparty,
		snapshot.min_confs
	);
	let res = confirm_and_ready(
		&ctx,
		snapshot.channel_point,
		snapshot.min_confs,
		&peer_tx,
		&mut msgs,
		deadline,
		&shutdown,
	)
	.await;
	let _ = ctx.db.remove_funding_state(&snapshot.channel_id);
	// A snapshot only exists once the funding transaction is committed, so the initiator's
	// reservation was already spent. Nothing to release on failure.
	res.map(|()| snapshot.details())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::chain::simnet::SimnetChain;
	use crate::sign::{SimnetSigner, SimnetWallet};
	use crate::util::persist::MemoryStore;
	use crate::util::test_utils::TestLogger;

	fn context(chain: Arc<SimnetChain>, wallet: Arc<SimnetWallet>, seed: u8) -> FundingContext {
		FundingContext {
			signer: Arc::new(SimnetSigner::new([seed; 32])),
			wallet,
			chain,
			db: Arc::new(NodeDb::new(Arc::new(MemoryStore::new()))),
			logger: Arc::new(TestLogger::new()),
		}
	}

	fn params(counterparty: NodeId, funding: u64, push: u64) -> FundingParams {
		FundingParams {
			counterparty,
			channel_id: ChannelId([7; 32]),
			funding_satoshis: funding,
			push_satoshis: push,
			min_confs: 1,
			limits: ChannelHandshakeLimits::default(),
			timeout: Duration::from_secs(5),
		}
	}

	#[test]
	fn both_sides_derive_the_same_channel_point() {
		let signer_a = SimnetSigner::new([1; 32]);
		let signer_b = SimnetSigner::new([2; 32]);
		let channel_id = ChannelId([7; 32]);
		let key_a = signer_a.derive_funding_key(&channel_id);
		let key_b = signer_b.derive_funding_key(&channel_id);
		let tx = build_funding_tx(&channel_id, 100_000, &key_a, &key_b);
		let sig = signer_a.sign_input(&channel_id, &tx, 0).unwrap();
		assert!(verify_funding_signature(&tx, 0, &sig, &key_a));
		assert!(!verify_funding_signature(&tx, 0, &sig, &key_b));
		assert_eq!(funding_txid(&tx), funding_txid(&tx));
	}

	#[tokio::test]
	async fn initiator_fails_fast_without_funds() {
		let chain = Arc::new(SimnetChain::new());
		let wallet = Arc::new(SimnetWallet::new(10));
		let ctx = context(chain, wallet, 1);
		let (peer_tx, _peer_rx) = mpsc::channel(8);
		let (_msg_tx, msg_rx) = mpsc::channel(8);
		let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
		let (_trigger, listener) = triggered::trigger();
		let res = run_initiator(
			params(NodeId([2; 32]), 100_000, 0),
			ctx,
			peer_tx,
			msg_rx,
			updates_tx,
			listener,
		)
		.await;
		assert_eq!(res.unwrap_err(), FundingError::InsufficientFunds);
		assert_eq!(updates_rx.recv().await, Some(FundingUpdate::StateChange(FundingState::Init)));
		assert_eq!(
			updates_rx.recv().await,
			Some(FundingUpdate::Failed(FundingError::InsufficientFunds))
		);
	}

	#[tokio::test]
	async fn failure_after_broadcast_leaves_other_reservations_alone() {
		let chain = Arc::new(SimnetChain::new());
		let wallet = Arc::new(SimnetWallet::new(1_000_000));
		// Another workflow's reservation, which must survive this one's failure.
		wallet.reserve_funds(200_000).unwrap();
		let ctx = context(chain, wallet.clone(), 1);
		let node_b = NodeId([2; 32]);

		let (peer_tx, mut peer_rx) = mpsc::channel(8);
		let (msg_tx, msg_rx) = mpsc::channel(8);
		let (updates_tx, _updates_rx) = mpsc::unbounded_channel();
		let (_trigger, listener) = triggered::trigger();
		let initiator = tokio::spawn(run_initiator(
			params(node_b, 100_000, 0),
			ctx,
			peer_tx,
			msg_rx,
			updates_tx,
			listener,
		));

		let their_key = SimnetSigner::new([2; 32]).derive_funding_key(&ChannelId([7; 32]));
		match peer_rx.recv().await.unwrap() {
			Message::OpenChannel(open) => {
				msg_tx
					.send(Message::AcceptChannel(AcceptChannel {
						temporary_channel_id: open.temporary_channel_id,
						minimum_depth: 1,
						funding_pubkey: their_key,
					}))
					.await
					.unwrap();
			},
			other => panic!("expected open_channel, got {}", other.name()),
		}
		// Once funding_signed is out the reservation has become channel capacity.
		match peer_rx.recv().await.unwrap() {
			Message::FundingSigned(_) => {},
			other => panic!("expected funding_signed, got {}", other.name()),
		}
		// The peer disconnects while waiting for confirmations.
		drop(msg_tx);

		assert_eq!(initiator.await.unwrap().unwrap_err(), FundingError::Disconnected);
		assert_eq!(wallet.available_balance(), 700_000);
	}

	#[tokio::test]
	async fn full_workflow_opens_on_both_sides() {
		let chain = Arc::new(SimnetChain::new());
		let wallet_a = Arc::new(SimnetWallet::new(1_000_000));
		let wallet_b = Arc::new(SimnetWallet::new(0));
		let ctx_a = context(chain.clone(), wallet_a.clone(), 1);
		let ctx_b = context(chain.clone(), wallet_b, 2);
		let node_a = NodeId([1; 32]);
		let node_b = NodeId([2; 32]);

		// a_out carries messages a -> b, which the pump feeds into b's workflow mailbox.
		let (a_peer_tx, mut a_out) = mpsc::channel(8);
		let (b_msg_tx, b_msg_rx) = mpsc::channel(8);
		let (b_peer_tx, mut b_out) = mpsc::channel(8);
		let (a_msg_tx, a_msg_rx) = mpsc::channel(8);
		let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
		let (_trigger, listener) = triggered::trigger();

		let p = params(node_b, 100_000, 10_000);
		let initiator = tokio::spawn(run_initiator(
			p.clone(),
			ctx_a,
			a_peer_tx,
			a_msg_rx,
			updates_tx,
			listener.clone(),
		));

		// The responder starts from the initiator's open_channel.
		let open = match a_out.recv().await.unwrap() {
			Message::OpenChannel(open) => open,
			other => panic!("expected open_channel, got {}", other.name()),
		};
		let responder = tokio::spawn(run_responder(
			open,
			node_a,
			1,
			ChannelHandshakeLimits::default(),
			Duration::from_secs(5),
			ctx_b,
			b_peer_tx,
			b_msg_rx,
			listener,
		));

		// Pump frames both ways, confirming the funding tx when it appears.
		let chain_pump = chain.clone();
		let pump = tokio::spawn(async move {
			loop {
				tokio::select! {
					msg = a_out.recv() => match msg {
						Some(msg) => {
							if let Message::FundingSigned(ref signed) = msg {
								chain_pump.confirm_transaction(&signed.channel_point.txid);
								chain_pump.mine_blocks(1);
							}
							if b_msg_tx.send(msg).await.is_err() { break; }
						},
						None => break,
					},
					msg = b_out.recv() => match msg {
						Some(msg) => if a_msg_tx.send(msg).await.is_err() { break; },
						None => break,
					},
				}
			}
		});

		let details_b = responder.await.unwrap().unwrap();
		let details_a = initiator.await.unwrap().unwrap();
		pump.abort();

		assert_eq!(details_a.channel_point, details_b.channel_point);
		assert_eq!(details_a.capacity, 100_000);
		assert_eq!(details_a.local_balance, 90_000);
		assert_eq!(details_b.local_balance, 10_000);
		assert_eq!(wallet_a.available_balance(), 900_000);

		let mut saw_confs = false;
		while let Ok(update) = updates_rx.try_recv() {
			if let FundingUpdate::StateChange(FundingState::AwaitingConfirmations(_)) = update {
				saw_confs = true;
			}
		}
		assert!(saw_confs);
	}

	#[tokio::test]
	async fn resume_finishes_a_persisted_confirmation_wait() {
		let chain = Arc::new(SimnetChain::new());
		let wallet = Arc::new(SimnetWallet::new(0));
		let ctx = context(chain.clone(), wallet, 1);
		let snapshot = FundingSnapshot {
			channel_id: ChannelId([7; 32]),
			counterparty: NodeId([2; 32]),
			channel_point: OutPoint {
				txid: funding_txid(b"resumed funding tx"),
				index: 0,
			},
			capacity: 100_000,
			local_balance: 100_000,
			remote_balance: 0,
			min_confs: 2,
			initiator: true,
		};
		ctx.db.put_funding_state(&snapshot).unwrap();

		let (peer_tx, mut peer_rx) = mpsc::channel(8);
		let (msg_tx, msg_rx) = mpsc::channel(8);
		let (_trigger, listener) = triggered::trigger();
		let db = ctx.db.clone();
		let resume = tokio::spawn(run_resume(
			snapshot.clone(),
			ctx,
			peer_tx,
			msg_rx,
			Duration::from_secs(5),
			listener,
		));

		chain.confirm_transaction(&snapshot.channel_point.txid);
		chain.mine_blocks(1);
		// The workflow announces readiness once depth is reached; answer in kind.
		match peer_rx.recv().await.unwrap() {
			Message::ChannelReady(ready) => {
				assert_eq!(ready.channel_point, snapshot.channel_point)
			},
			other => panic!("expected channel_ready, got {}", other.name()),
		}
		msg_tx
			.send(Message::ChannelReady(ChannelReady { channel_point: snapshot.channel_point }))
			.await
			.unwrap();

		let details = resume.await.unwrap().unwrap();
		assert_eq!(details, snapshot.details());
		assert!(db.fetch_funding_states().unwrap().is_empty());
	}

	#[tokio::test]
	async fn responder_rejects_oversized_funding() {
		let chain = Arc::new(SimnetChain::new());
		let ctx = context(chain, Arc::new(SimnetWallet::new(0)), 2);
		let (peer_tx, mut peer_rx) = mpsc::channel(8);
		let (_msg_tx, msg_rx) = mpsc::channel(8);
		let (_trigger, listener) = triggered::trigger();
		let signer = SimnetSigner::new([1; 32]);
		let channel_id = ChannelId([7; 32]);
		let open = OpenChannel {
			temporary_channel_id: channel_id,
			funding_satoshis: u64::MAX,
			push_satoshis: 0,
			minimum_depth: 1,
			funding_pubkey: signer.derive_funding_key(&channel_id),
		};
		let res = run_responder(
			open,
			NodeId([1; 32]),
			1,
			ChannelHandshakeLimits::default(),
			Duration::from_secs(5),
			ctx,
			peer_tx,
			msg_rx,
			listener,
		)
		.await;
		match res.unwrap_err() {
			FundingError::PolicyViolation(_) => {},
			other => panic!("unexpected failure: {}", other),
		}
		// The counterparty is told with a wire error.
		match peer_rx.recv().await.unwrap() {
			Message::Error(e) => assert_eq!(e.channel_id, channel_id),
			other => panic!("expected error message, got {}", other.name()),
		}
	}
}
