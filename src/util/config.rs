// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Various user-configurable node limits and settings.

use std::time::Duration;

/// Limits applied to inbound channel-open proposals before a responder workflow is started.
///
/// `Default::default()` provides sane defaults.
#[derive(Copy, Clone, Debug)]
pub struct ChannelHandshakeLimits {
	/// The largest channel capacity, in satoshis, we will accept from a counterparty.
	///
	/// Default value: 2^24 - 1.
	pub max_funding_satoshis: u64,
	/// The largest confirmation depth we will agree to wait for on an inbound channel. A
	/// counterparty asking for more than this is rejected.
	///
	/// Default value: 144.
	pub max_minimum_depth: u32,
}

impl Default for ChannelHandshakeLimits {
	fn default() -> ChannelHandshakeLimits {
		ChannelHandshakeLimits { max_funding_satoshis: (1 << 24) - 1, max_minimum_depth: 144 }
	}
}

/// Top-level configuration for a [`Node`].
///
/// `Default::default()` provides sane defaults suitable for tests and simnets; production
/// deployments will want to set at least `listen_host`.
///
/// [`Node`]: crate::ln::node::Node
#[derive(Clone, Debug)]
pub struct NodeConfig {
	/// The host string handed to the transport's listener, if this node accepts inbound
	/// connections.
	pub listen_host: Option<String>,
	/// Confirmation depth requested for locally-initiated channel opens when the caller does not
	/// specify one.
	///
	/// Default value: 1.
	pub min_confs: u32,
	/// Limits applied to inbound channel-open proposals.
	pub handshake_limits: ChannelHandshakeLimits,
	/// Depth of each peer's outbound message queue. When full, dispatcher-originated messages are
	/// dropped rather than stalling the event loop; funding workflows wait instead.
	///
	/// Default value: 50.
	pub peer_outbound_queue: usize,
	/// How long a funding workflow waits on any single step (counterparty response or chain
	/// confirmation) before failing with a timeout.
	///
	/// Default value: 60 seconds.
	pub funding_timeout: Duration,
	/// Maximum number of path attempts per payment before giving up.
	///
	/// Default value: 3.
	pub max_payment_attempts: u32,
	/// Hard deadline on an end-to-end payment; a payment still pending after this long fails with
	/// a timeout rather than hanging its caller.
	///
	/// Default value: 60 seconds.
	pub payment_timeout: Duration,
	/// Number of candidate paths requested from the router when sending a payment.
	///
	/// Default value: 3.
	pub max_paths: usize,
	/// Initial HTLC time-lock granted to a payment, in blocks.
	///
	/// Default value: 144.
	pub cltv_start: u32,
	/// Per-hop time-lock decrement applied when forwarding, in blocks. A forwarded HTLC whose
	/// remaining time-lock would drop below this is failed back.
	///
	/// Default value: 6.
	pub cltv_delta: u32,
}

impl Default for NodeConfig {
	fn default() -> NodeConfig {
		NodeConfig {
			listen_host: None,
			min_confs: 1,
			handshake_limits: ChannelHandshakeLimits::default(),
			peer_outbound_queue: 50,
			funding_timeout: Duration::from_secs(60),
			max_payment_attempts: 3,
			payment_timeout: Duration::from_secs(60),
			max_paths: 3,
			cltv_start: 144,
			cltv_delta: 6,
		}
	}
}
