// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The HTLC switch moves conditional payments across this node's local channel links, keeping a
//! circuit for each forwarded HTLC so that fulfills and fails can travel backward along the path
//! they came in on. The switch itself never retries; that is payment-level policy.

use std::collections::HashMap;
use std::sync::Arc;

use crate::chain::transaction::OutPoint;
use crate::ln::msgs::{HtlcFailReason, UpdateAddHtlc};
use crate::ln::{HTLCStatus, NodeId, PaymentHash};
use crate::util::logger::Logger;

/// A local channel link with a direct peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
	/// The funding outpoint of the channel backing this link.
	pub channel_point: OutPoint,
	/// Total channel capacity in satoshis.
	pub capacity: u64,
	/// Satoshis spendable by this node, net of in-flight HTLCs.
	pub local_balance: u64,
	/// Satoshis spendable by the peer, net of in-flight HTLCs.
	pub remote_balance: u64,
}

/// Where a forwarded HTLC came from, so its resolution can be sent backward.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HtlcSource {
	/// This node originated the HTLC for one of its own payments.
	Local {
		/// The hash of the payment this HTLC belongs to.
		payment_hash: PaymentHash,
	},
	/// The HTLC was offered to us by a peer and we forwarded it onward.
	Peer {
		/// The peer which offered us the HTLC.
		node_id: NodeId,
		/// The id that peer assigned to the HTLC on the incoming link.
		htlc_id: u64,
	},
}

/// An in-flight forwarded HTLC, keyed in the switch by (outgoing peer, outgoing htlc id).
#[derive(Clone, Debug)]
pub struct Circuit {
	/// Where the HTLC came from.
	pub source: HtlcSource,
	/// The HTLC amount in satoshis.
	pub amount_satoshis: u64,
	/// The payment hash carried by the HTLC.
	pub payment_hash: PaymentHash,
}

/// The switch: one link per direct channel peer, plus the circuit table.
pub struct HtlcSwitch {
	links: HashMap<NodeId, Link>,
	circuits: HashMap<(NodeId, u64), Circuit>,
	next_htlc_id: u64,
	cltv_delta: u32,
	logger: Arc<dyn Logger>,
}

impl HtlcSwitch {
	/// Creates an empty switch. `cltv_delta` is deducted from the time-lock at each forwarding
	/// hop.
	pub fn new(cltv_delta: u32, logger: Arc<dyn Logger>) -> Self {
		HtlcSwitch {
			links: HashMap::new(),
			circuits: HashMap::new(),
			next_htlc_id: 0,
			cltv_delta,
			logger,
		}
	}

	/// Adds a link for a newly opened channel with the given peer.
	pub fn add_link(&mut self, peer: NodeId, link: Link) {
		log_info!(
			self.logger,
			"Link up with peer {}: channel {} capacity {} local {}",
			peer,
			link.channel_point,
			link.capacity,
			link.local_balance
		);
		self.links.insert(peer, link);
	}

	/// Removes the link with the given peer, e.g. on channel close. Returns the removed link.
	pub fn remove_link(&mut self, peer: &NodeId) -> Option<Link> {
		self.links.remove(peer)
	}

	/// Looks up the link with the given peer.
	pub fn link(&self, peer: &NodeId) -> Option<&Link> {
		self.links.get(peer)
	}

	/// Every current link, with the peer it connects to.
	pub fn links(&self) -> Vec<(NodeId, Link)> {
		let mut links: Vec<(NodeId, Link)> =
			self.links.iter().map(|(k, v)| (*k, v.clone())).collect();
		links.sort_by_key(|(peer, _)| *peer);
		links
	}

	/// Whether this node could carry an HTLC of the given amount toward the given peer right
	/// now. Never reports success it cannot back with liquidity.
	pub fn can_send(&self, peer: &NodeId, amount_satoshis: u64) -> HTLCStatus {
		match self.links.get(peer) {
			Some(link) if link.local_balance >= amount_satoshis => HTLCStatus::Allow,
			Some(_) | None => HTLCStatus::Decline,
		}
	}

	/// Offers an HTLC to `next_hop`, debiting the outgoing link and recording the circuit.
	///
	/// `cltv_expiry` is the time-lock of the incoming HTLC (or the origin time-lock for local
	/// sends); the outgoing HTLC carries it less the per-hop delta. `onward_route` is the hop
	/// list after `next_hop`.
	pub fn send_htlc(
		&mut self, next_hop: NodeId, payment_hash: PaymentHash, amount_satoshis: u64,
		cltv_expiry: u32, onward_route: Vec<NodeId>, source: HtlcSource,
	) -> Result<UpdateAddHtlc, HtlcFailReason> {
		let outgoing_expiry = match cltv_expiry.checked_sub(self.cltv_delta) {
			Some(expiry) if expiry > 0 => expiry,
			_ => return Err(HtlcFailReason::ExpiryTooSoon),
		};
		let link = self.links.get_mut(&next_hop).ok_or(HtlcFailReason::NoRoute)?;
		if link.local_balance < amount_satoshis {
			return Err(HtlcFailReason::InsufficientLiquidity);
		}
		link.local_balance -= amount_satoshis;
		self.next_htlc_id += 1;
		let htlc_id = self.next_htlc_id;
		self.circuits
			.insert((next_hop, htlc_id), Circuit { source, amount_satoshis, payment_hash });
		log_debug!(
			self.logger,
			"Offering HTLC {} of {} sat to peer {} for hash {}",
			htlc_id,
			amount_satoshis,
			next_hop,
			payment_hash
		);
		Ok(UpdateAddHtlc {
			htlc_id,
			payment_hash,
			amount_satoshis,
			cltv_expiry: outgoing_expiry,
			onward_route,
		})
	}

	/// The payment hash of an in-flight outgoing HTLC, so the caller can check a claimed
	/// preimage before settling.
	pub fn outgoing_payment_hash(&self, peer: &NodeId, htlc_id: u64) -> Option<PaymentHash> {
		self.circuits.get(&(*peer, htlc_id)).map(|c| c.payment_hash)
	}

	/// Resolves an outgoing HTLC that the downstream peer fulfilled: the amount has crossed to
	/// them. Returns the circuit so the caller can propagate the fulfill backward.
	pub fn settle_outgoing(&mut self, peer: &NodeId, htlc_id: u64) -> Option<Circuit> {
		let circuit = self.circuits.remove(&(*peer, htlc_id))?;
		if let Some(link) = self.links.get_mut(peer) {
			link.remote_balance += circuit.amount_satoshis;
		}
		Some(circuit)
	}

	/// Resolves an outgoing HTLC that the downstream peer failed: the debited amount returns to
	/// our side. Returns the circuit so the caller can propagate the fail backward.
	pub fn fail_outgoing(&mut self, peer: &NodeId, htlc_id: u64) -> Option<Circuit> {
		let circuit = self.circuits.remove(&(*peer, htlc_id))?;
		if let Some(link) = self.links.get_mut(peer) {
			link.local_balance += circuit.amount_satoshis;
		}
		Some(circuit)
	}

	/// Places an inbound HTLC from a peer in flight on the incoming link. Returns false if the
	/// peer overcommitted its balance, in which case the HTLC must be failed back.
	pub fn accept_incoming(&mut self, from: &NodeId, amount_satoshis: u64) -> bool {
		match self.links.get_mut(from) {
			Some(link) if link.remote_balance >= amount_satoshis => {
				link.remote_balance -= amount_satoshis;
				true
			},
			_ => false,
		}
	}

	/// Claims an inbound HTLC: we fulfilled it, so the amount crosses to our side.
	pub fn settle_incoming(&mut self, from: &NodeId, amount_satoshis: u64) {
		if let Some(link) = self.links.get_mut(from) {
			link.local_balance += amount_satoshis;
		}
	}

	/// Returns an inbound HTLC to the peer's balance after we failed it back.
	pub fn fail_incoming(&mut self, from: &NodeId, amount_satoshis: u64) {
		if let Some(link) = self.links.get_mut(from) {
			link.remote_balance += amount_satoshis;
		}
	}

	/// Drops every circuit whose downstream leg goes through the given peer, returning them so
	/// the caller can fail each backward. Outgoing debits are restored.
	pub fn drop_circuits_through(&mut self, peer: &NodeId) -> Vec<Circuit> {
		let keys: Vec<(NodeId, u64)> =
			self.circuits.keys().filter(|(p, _)| p == peer).copied().collect();
		let mut dropped = Vec::new();
		for key in keys {
			if let Some(circuit) = self.fail_outgoing(&key.0, key.1) {
				dropped.push(circuit);
			}
		}
		dropped
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::util::test_utils::TestLogger;
	use bitcoin::hashes::Hash;
	use bitcoin::Txid;

	fn make_switch() -> HtlcSwitch {
		HtlcSwitch::new(6, Arc::new(TestLogger::new()))
	}

	fn link(capacity: u64, local: u64) -> Link {
		Link {
			channel_point: OutPoint { txid: Txid::from_byte_array([9; 32]), index: 0 },
			capacity,
			local_balance: local,
			remote_balance: capacity - local,
		}
	}

	#[test]
	fn can_send_reflects_liquidity() {
		let mut switch = make_switch();
		let peer = NodeId([1; 32]);
		assert_eq!(switch.can_send(&peer, 1), HTLCStatus::Decline);
		switch.add_link(peer, link(1000, 600));
		assert_eq!(switch.can_send(&peer, 600), HTLCStatus::Allow);
		assert_eq!(switch.can_send(&peer, 601), HTLCStatus::Decline);
	}

	#[test]
	fn send_debits_and_settle_credits_remote() {
		let mut switch = make_switch();
		let peer = NodeId([1; 32]);
		switch.add_link(peer, link(1000, 600));
		let hash = PaymentHash([3; 32]);
		let add = switch
			.send_htlc(peer, hash, 100, 144, Vec::new(), HtlcSource::Local { payment_hash: hash })
			.unwrap();
		assert_eq!(add.cltv_expiry, 138);
		assert_eq!(switch.link(&peer).unwrap().local_balance, 500);

		let circuit = switch.settle_outgoing(&peer, add.htlc_id).unwrap();
		assert_eq!(circuit.source, HtlcSource::Local { payment_hash: hash });
		assert_eq!(switch.link(&peer).unwrap().local_balance, 500);
		assert_eq!(switch.link(&peer).unwrap().remote_balance, 500);
		// Settling twice is a no-op.
		assert!(switch.settle_outgoing(&peer, add.htlc_id).is_none());
	}

	#[test]
	fn fail_restores_local_balance() {
		let mut switch = make_switch();
		let peer = NodeId([1; 32]);
		switch.add_link(peer, link(1000, 600));
		let hash = PaymentHash([3; 32]);
		let add = switch
			.send_htlc(peer, hash, 100, 144, Vec::new(), HtlcSource::Local { payment_hash: hash })
			.unwrap();
		assert_eq!(switch.link(&peer).unwrap().local_balance, 500);
		switch.fail_outgoing(&peer, add.htlc_id).unwrap();
		assert_eq!(switch.link(&peer).unwrap().local_balance, 600);
	}

	#[test]
	fn send_failures_name_their_reason() {
		let mut switch = make_switch();
		let peer = NodeId([1; 32]);
		let hash = PaymentHash([3; 32]);
		assert_eq!(
			switch
				.send_htlc(peer, hash, 100, 144, Vec::new(), HtlcSource::Local {
					payment_hash: hash
				})
				.unwrap_err(),
			HtlcFailReason::NoRoute
		);
		switch.add_link(peer, link(1000, 50));
		assert_eq!(
			switch
				.send_htlc(peer, hash, 100, 144, Vec::new(), HtlcSource::Local {
					payment_hash: hash
				})
				.unwrap_err(),
			HtlcFailReason::InsufficientLiquidity
		);
		assert_eq!(
			switch
				.send_htlc(peer, hash, 10, 6, Vec::new(), HtlcSource::Local {
					payment_hash: hash
				})
				.unwrap_err(),
			HtlcFailReason::ExpiryTooSoon
		);
	}

	#[test]
	fn incoming_accounting() {
		let mut switch = make_switch();
		let peer = NodeId([1; 32]);
		switch.add_link(peer, link(1000, 600));
		assert!(switch.accept_incoming(&peer, 300));
		assert_eq!(switch.link(&peer).unwrap().remote_balance, 100);
		// Overcommit is rejected.
		assert!(!switch.accept_incoming(&peer, 200));
		switch.settle_incoming(&peer, 300);
		assert_eq!(switch.link(&peer).unwrap().local_balance, 900);
		switch.add_link(peer, link(1000, 600));
		assert!(switch.accept_incoming(&peer, 300));
		switch.fail_incoming(&peer, 300);
		assert_eq!(switch.link(&peer).unwrap().remote_balance, 400);
	}

	#[test]
	fn peer_loss_drops_its_circuits() {
		let mut switch = make_switch();
		let (a, b) = (NodeId([1; 32]), NodeId([2; 32]));
		switch.add_link(a, link(1000, 600));
		switch.add_link(b, link(1000, 600));
		let hash = PaymentHash([3; 32]);
		switch
			.send_htlc(a, hash, 100, 144, Vec::new(), HtlcSource::Local { payment_hash: hash })
			.unwrap();
		switch
			.send_htlc(b, hash, 100, 144, Vec::new(), HtlcSource::Peer {
				node_id: a,
				htlc_id: 5
			})
			.unwrap();
		let dropped = switch.drop_circuits_through(&b);
		assert_eq!(dropped.len(), 1);
		assert_eq!(dropped[0].source, HtlcSource::Peer { node_id: a, htlc_id: 5 });
		assert_eq!(switch.link(&b).unwrap().local_balance, 600);
		// The circuit through a is untouched.
		assert!(switch.drop_circuits_through(&b).is_empty());
		assert_eq!(switch.drop_circuits_through(&a).len(), 1);
	}
}
