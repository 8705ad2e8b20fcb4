// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Multi-node tests driving whole [`Node`]s over an in-memory transport and simulated chain.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::chain::simnet::SimnetChain;
use crate::ln::funding::{FundingState, FundingUpdate};
use crate::ln::node::Node;
use crate::ln::{HTLCStatus, NodeId};
use crate::sign::{SimnetSigner, SimnetWallet};
use crate::util::config::NodeConfig;
use crate::util::errors::{ConnectError, PaymentSendFailure};
use crate::util::persist::MemoryStore;
use crate::util::test_utils::{MemTransport, TestLogger};

const NODE_FUNDS: u64 = 10_000_000;

async fn launch(
	name: &str, seed: u8, transport: &MemTransport, chain: &Arc<SimnetChain>,
) -> Node {
	let config = NodeConfig {
		listen_host: Some(name.to_string()),
		funding_timeout: Duration::from_secs(10),
		payment_timeout: Duration::from_secs(10),
		..Default::default()
	};
	Node::start(
		config,
		NodeId([seed; 32]),
		Arc::new(transport.clone()),
		Arc::new(SimnetSigner::new([seed; 32])),
		chain.clone(),
		Arc::new(SimnetWallet::new(NODE_FUNDS)),
		Arc::new(MemoryStore::new()),
		Arc::new(TestLogger::with_id(name.to_string())),
	)
	.await
	.unwrap()
}

/// Mines on behalf of the tests: any transaction a funding workflow starts watching gets
/// confirmed to depth shortly after.
fn spawn_miner(chain: Arc<SimnetChain>) -> JoinHandle<()> {
	tokio::spawn(async move {
		loop {
			tokio::time::sleep(Duration::from_millis(10)).await;
			chain.confirm_watched();
		}
	})
}

async fn wait_for_channels(node: &Node, count: usize) {
	for _ in 0..500 {
		if node.handle.routing_table().await.channel_count() == count {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("routing table never reached {} channel(s)", count);
}

#[tokio::test]
async fn three_node_payment_end_to_end() {
	let transport = MemTransport::new();
	let chain = Arc::new(SimnetChain::new());
	let miner = spawn_miner(chain.clone());

	let alice = launch("alice", 1, &transport, &chain).await;
	let bob = launch("bob", 2, &transport, &chain).await;
	let carol = launch("carol", 3, &transport, &chain).await;
	let bob_id = bob.handle.node_id;
	let carol_id = carol.handle.node_id;

	let summary = alice.handle.connect_peer(None, Some("bob".to_string())).await.unwrap();
	assert_eq!(summary.node_id, bob_id);
	bob.handle.connect_peer(None, Some("carol".to_string())).await.unwrap();

	let ab = alice.handle.open_channel_sync(bob_id, 1_000_000, 0, None).await.unwrap();
	assert_eq!(ab.capacity, 1_000_000);
	bob.handle.open_channel_sync(carol_id, 1_000_000, 0, None).await.unwrap();
	// Both edges must have gossiped to alice before she can route through bob.
	wait_for_channels(&alice, 2).await;
	wait_for_channels(&carol, 2).await;

	let (hash, preimage) = carol.handle.add_invoice(25_000).await.unwrap();
	let paid = alice.handle.send_payment(carol_id, 25_000, hash).await.unwrap();
	assert_eq!(paid, preimage);

	let alice_channels = alice.handle.list_channels().await;
	assert_eq!(alice_channels.len(), 1);
	assert_eq!(alice_channels[0].local_balance, 975_000);
	let carol_channels = carol.handle.list_channels().await;
	assert_eq!(carol_channels.len(), 1);
	assert_eq!(carol_channels[0].local_balance, 25_000);
	// Bob forwarded: gained on the alice link, paid out on the carol link.
	let bob_channels = bob.handle.list_channels().await;
	assert_eq!(bob_channels.len(), 2);
	let towards_alice = bob_channels.iter().find(|c| c.counterparty == NodeId([1; 32])).unwrap();
	assert_eq!(towards_alice.local_balance, 25_000);
	let towards_carol = bob_channels.iter().find(|c| c.counterparty == carol_id).unwrap();
	assert_eq!(towards_carol.local_balance, 975_000);

	// A settled invoice cannot be paid again; the failure reason comes all the way back.
	match alice.handle.send_payment(carol_id, 25_000, hash).await.unwrap_err() {
		PaymentSendFailure::RetriesExhausted { reason, .. } => {
			assert_eq!(reason, crate::ln::msgs::HtlcFailReason::UnknownPaymentHash);
		},
		other => panic!("unexpected failure: {}", other),
	}

	alice.stop().await;
	bob.stop().await;
	carol.stop().await;
	miner.abort();
}

#[tokio::test]
async fn concurrent_connects_to_one_peer_race_cleanly() {
	let transport = MemTransport::new();
	let chain = Arc::new(SimnetChain::new());
	let alice = launch("alice", 1, &transport, &chain).await;
	let bob = launch("bob", 2, &transport, &chain).await;

	let (first, second) = tokio::join!(
		alice.handle.connect_peer(None, Some("bob".to_string())),
		alice.handle.connect_peer(None, Some("bob".to_string())),
	);
	let outcomes = [first, second];
	assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
	assert!(outcomes
		.iter()
		.any(|r| matches!(r, Err(ConnectError::DuplicateConnection))));

	// Connecting again once established is also a duplicate.
	let again = alice.handle.connect_peer(Some(bob.handle.node_id), None).await;
	assert!(matches!(again, Err(ConnectError::DuplicateConnection)));
	assert_eq!(alice.handle.list_peers().await.len(), 1);
	assert_eq!(bob.handle.list_peers().await.len(), 1);

	alice.stop().await;
	bob.stop().await;
}

#[tokio::test]
async fn directory_resolves_identity_only_connects() {
	let transport = MemTransport::new();
	let chain = Arc::new(SimnetChain::new());
	let alice = launch("alice", 1, &transport, &chain).await;
	let bob = launch("bob", 2, &transport, &chain).await;
	let carol = launch("carol", 3, &transport, &chain).await;
	let carol_id = carol.handle.node_id;

	// Nobody has told alice where carol lives yet.
	let unresolved = alice.handle.connect_peer(Some(carol_id), None).await;
	assert!(matches!(unresolved, Err(ConnectError::UnknownHost)));

	// Bob learns carol's host first-hand; alice then learns it from bob's directory.
	bob.handle.connect_peer(None, Some("carol".to_string())).await.unwrap();
	alice.handle.connect_peer(None, Some("bob".to_string())).await.unwrap();
	let mut resolved = Err(ConnectError::UnknownHost);
	for _ in 0..500 {
		resolved = alice.handle.connect_peer(Some(carol_id), None).await;
		if !matches!(resolved, Err(ConnectError::UnknownHost)) {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	assert_eq!(resolved.unwrap().node_id, carol_id);

	// Clearing the directory makes unlearned identities unresolvable again.
	alice.handle.clear_node_directory().await;
	let unknown = alice.handle.connect_peer(Some(NodeId([9; 32])), None).await;
	assert!(matches!(unknown, Err(ConnectError::UnknownHost)));

	alice.stop().await;
	bob.stop().await;
	carol.stop().await;
}

#[tokio::test]
async fn undeliverable_payment_reports_why_each_path_failed() {
	let transport = MemTransport::new();
	let chain = Arc::new(SimnetChain::new());
	let miner = spawn_miner(chain.clone());
	let alice = launch("alice", 1, &transport, &chain).await;
	let bob = launch("bob", 2, &transport, &chain).await;
	let bob_id = bob.handle.node_id;

	alice.handle.connect_peer(None, Some("bob".to_string())).await.unwrap();
	alice.handle.open_channel_sync(bob_id, 100_000, 0, None).await.unwrap();
	wait_for_channels(&alice, 1).await;

	// More than the channel holds: the only candidate is declined, not silently skipped.
	let (hash, _preimage) = bob.handle.add_invoice(200_000).await.unwrap();
	match alice.handle.send_payment(bob_id, 200_000, hash).await.unwrap_err() {
		PaymentSendFailure::NoRoute { failures } => {
			assert_eq!(failures.len(), 1);
			assert_eq!(failures[0].hops, vec![bob_id]);
			assert_eq!(failures[0].status, Some(HTLCStatus::Decline));
		},
		other => panic!("unexpected failure: {}", other),
	}

	// No path at all to a node nobody has announced.
	let no_paths = alice.handle.send_payment(NodeId([9; 32]), 1_000, hash).await.unwrap_err();
	match no_paths {
		PaymentSendFailure::NoRoute { failures } => assert!(failures.is_empty()),
		other => panic!("unexpected failure: {}", other),
	}

	// find_path agrees with what send_payment saw.
	let candidates = alice.handle.find_path(bob_id, 50_000, None, true, None).await;
	assert_eq!(candidates.len(), 1);
	assert_eq!(candidates[0].status, Some(HTLCStatus::Allow));

	// An unvalidated lookup skips admission entirely, even for undeliverable amounts.
	let unchecked = alice.handle.find_path(bob_id, 200_000, None, false, None).await;
	assert_eq!(unchecked.len(), 1);
	assert_eq!(unchecked[0].status, None);

	alice.stop().await;
	bob.stop().await;
	miner.abort();
}

#[tokio::test]
async fn dialed_identity_must_match_the_answering_node() {
	let transport = MemTransport::new();
	let chain = Arc::new(SimnetChain::new());
	let alice = launch("alice", 1, &transport, &chain).await;
	let bob = launch("bob", 2, &transport, &chain).await;
	let bob_id = bob.handle.node_id;

	// Alice believes carol lives where bob actually answers.
	let outcome =
		alice.handle.connect_peer(Some(NodeId([3; 32])), Some("bob".to_string())).await;
	match outcome {
		Err(ConnectError::HandshakeFailed(_)) => {},
		Err(other) => panic!("unexpected failure: {}", other),
		Ok(summary) => panic!("imposter accepted as {}", summary.node_id),
	}
	assert!(alice.handle.list_peers().await.is_empty());

	// With the right identity the same dial goes through.
	let mut summary = alice.handle.connect_peer(Some(bob_id), Some("bob".to_string())).await;
	for _ in 0..500 {
		if !matches!(summary, Err(ConnectError::DuplicateConnection)) {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
		summary = alice.handle.connect_peer(Some(bob_id), Some("bob".to_string())).await;
	}
	assert_eq!(summary.unwrap().node_id, bob_id);

	alice.stop().await;
	bob.stop().await;
}

#[tokio::test]
async fn per_channel_min_confs_overrides_config() {
	let transport = MemTransport::new();
	let chain = Arc::new(SimnetChain::new());
	let miner = spawn_miner(chain.clone());
	let alice = launch("alice", 1, &transport, &chain).await;
	let bob = launch("bob", 2, &transport, &chain).await;
	let bob_id = bob.handle.node_id;

	alice.handle.connect_peer(None, Some("bob".to_string())).await.unwrap();
	let mut updates = alice.handle.open_channel(bob_id, 200_000, 0, Some(3)).await;
	let mut awaited_depth = None;
	loop {
		match updates.recv().await {
			Some(FundingUpdate::StateChange(FundingState::AwaitingConfirmations(depth))) => {
				awaited_depth = Some(depth);
			},
			Some(FundingUpdate::ChannelOpen(_)) => break,
			Some(FundingUpdate::Failed(e)) => panic!("funding failed: {}", e),
			Some(_) => {},
			None => panic!("update stream ended without a terminal state"),
		}
	}
	assert_eq!(awaited_depth, Some(3));

	alice.stop().await;
	bob.stop().await;
	miner.abort();
}

#[tokio::test]
async fn push_amount_lands_on_the_far_side() {
	let transport = MemTransport::new();
	let chain = Arc::new(SimnetChain::new());
	let miner = spawn_miner(chain.clone());
	let alice = launch("alice", 1, &transport, &chain).await;
	let bob = launch("bob", 2, &transport, &chain).await;
	let bob_id = bob.handle.node_id;

	alice.handle.connect_peer(None, Some("bob".to_string())).await.unwrap();
	let details = alice.handle.open_channel_sync(bob_id, 500_000, 120_000, None).await.unwrap();
	assert_eq!(details.local_balance, 380_000);
	assert_eq!(details.remote_balance, 120_000);

	wait_for_channels(&bob, 1).await;
	let bob_channels = bob.handle.list_channels().await;
	assert_eq!(bob_channels[0].local_balance, 120_000);
	assert_eq!(bob_channels[0].remote_balance, 380_000);

	// The new channel carries traffic immediately, in both directions.
	let (hash, preimage) = alice.handle.add_invoice(30_000).await.unwrap();
	let paid = bob.handle.send_payment(alice.handle.node_id, 30_000, hash).await.unwrap();
	assert_eq!(paid, preimage);
	let bob_channels = bob.handle.list_channels().await;
	assert_eq!(bob_channels[0].local_balance, 90_000);

	alice.stop().await;
	bob.stop().await;
	miner.abort();
}
