// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Structs and traits which allow the node to receive notifications about the chain without
//! observing it itself.

use bitcoin::Txid;
use tokio::sync::oneshot;

use crate::chain::transaction::OutPoint;

pub mod simnet;
pub mod transaction;

/// Fires once a registered transaction reaches its requested confirmation depth.
pub struct ConfirmationEvent {
	/// Resolves with the height of the block in which the transaction confirmed. Resolves with an
	/// error if the notifier shut down before the depth was reached.
	pub confirmed: oneshot::Receiver<u32>,
}

/// Fires once a registered outpoint is spent on-chain.
pub struct SpendEvent {
	/// Resolves with the height of the block containing the spend.
	pub spent: oneshot::Receiver<u32>,
}

/// An interface to a chain observer which can notify the node of transaction confirmations and
/// outpoint spends. Chain observation itself (header validation, reorg handling) happens behind
/// this trait.
///
/// If the requested depth (or the spend) has already been observed at registration time, the
/// returned event must fire immediately.
pub trait ChainNotifier: Send + Sync {
	/// Requests a single notification once `txid` has at least `num_confs` confirmations.
	fn register_confirmations(&self, txid: &Txid, num_confs: u32) -> ConfirmationEvent;
	/// Requests a single notification once `outpoint` is spent.
	fn register_spend(&self, outpoint: &OutPoint) -> SpendEvent;
}
