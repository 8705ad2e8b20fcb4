// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! An in-memory simulated chain, driving [`ChainNotifier`] events without any real blockchain.
//! Blocks are "mined" by calling [`SimnetChain::mine_blocks`]; transactions enter the chain via
//! [`SimnetChain::confirm_transaction`]. Useful for simnets and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use bitcoin::Txid;
use tokio::sync::oneshot;

use crate::chain::transaction::OutPoint;
use crate::chain::{ChainNotifier, ConfirmationEvent, SpendEvent};

struct PendingConf {
	txid: Txid,
	num_confs: u32,
	sender: oneshot::Sender<u32>,
}

struct PendingSpend {
	outpoint: OutPoint,
	sender: oneshot::Sender<u32>,
}

struct ChainState {
	height: u32,
	// Block height at which each confirmed transaction was included.
	inclusions: HashMap<Txid, u32>,
	spends: HashMap<OutPoint, u32>,
	pending_confs: Vec<PendingConf>,
	pending_spends: Vec<PendingSpend>,
}

impl ChainState {
	fn depth(&self, txid: &Txid) -> Option<u32> {
		self.inclusions.get(txid).map(|included| self.height - included + 1)
	}

	fn fire_ready(&mut self) {
		let mut still_pending = Vec::new();
		for conf in self.pending_confs.drain(..) {
			match self.inclusions.get(&conf.txid) {
				Some(included) if self.height - included + 1 >= conf.num_confs => {
					let _ = conf.sender.send(*included);
				},
				_ => still_pending.push(conf),
			}
		}
		self.pending_confs = still_pending;

		let mut still_pending = Vec::new();
		for spend in self.pending_spends.drain(..) {
			match self.spends.get(&spend.outpoint) {
				Some(height) => {
					let _ = spend.sender.send(*height);
				},
				None => still_pending.push(spend),
			}
		}
		self.pending_spends = still_pending;
	}
}

/// A simulated chain backing a [`ChainNotifier`].
pub struct SimnetChain {
	state: Mutex<ChainState>,
}

impl Default for SimnetChain {
	fn default() -> Self {
		Self::new()
	}
}

impl SimnetChain {
	/// Constructs a new simulated chain at height 0 with no transactions.
	pub fn new() -> Self {
		Self {
			state: Mutex::new(ChainState {
				height: 0,
				inclusions: HashMap::new(),
				spends: HashMap::new(),
				pending_confs: Vec::new(),
				pending_spends: Vec::new(),
			}),
		}
	}

	/// Includes `txid` in the next block (mining it), giving it one confirmation.
	pub fn confirm_transaction(&self, txid: &Txid) {
		let mut state = self.state.lock().unwrap();
		state.height += 1;
		let height = state.height;
		state.inclusions.entry(*txid).or_insert(height);
		state.fire_ready();
	}

	/// Includes every transaction currently watched for confirmations in the next block, then
	/// mines enough further blocks to satisfy the deepest watch. Lets tests drive funding
	/// workflows without knowing txids up front.
	pub fn confirm_watched(&self) {
		let mut state = self.state.lock().unwrap();
		let watched: Vec<Txid> = state.pending_confs.iter().map(|c| c.txid).collect();
		if watched.is_empty() {
			return;
		}
		state.height += 1;
		let height = state.height;
		for txid in watched {
			state.inclusions.entry(txid).or_insert(height);
		}
		let deepest = state.pending_confs.iter().map(|c| c.num_confs).max().unwrap_or(1);
		state.height += deepest.saturating_sub(1);
		state.fire_ready();
	}

	/// Mines `n` empty blocks, deepening every included transaction.
	pub fn mine_blocks(&self, n: u32) {
		let mut state = self.state.lock().unwrap();
		state.height += n;
		state.fire_ready();
	}

	/// Marks `outpoint` as spent in the next block.
	pub fn spend_outpoint(&self, outpoint: &OutPoint) {
		let mut state = self.state.lock().unwrap();
		state.height += 1;
		let height = state.height;
		state.spends.entry(*outpoint).or_insert(height);
		state.fire_ready();
	}
}

impl ChainNotifier for SimnetChain {
	fn register_confirmations(&self, txid: &Txid, num_confs: u32) -> ConfirmationEvent {
		let (sender, confirmed) = oneshot::channel();
		let mut state = self.state.lock().unwrap();
		match state.depth(txid) {
			Some(depth) if depth >= num_confs => {
				let _ = sender.send(state.inclusions[txid]);
			},
			_ => state.pending_confs.push(PendingConf { txid: *txid, num_confs, sender }),
		}
		ConfirmationEvent { confirmed }
	}

	fn register_spend(&self, outpoint: &OutPoint) -> SpendEvent {
		let (sender, spent) = oneshot::channel();
		let mut state = self.state.lock().unwrap();
		match state.spends.get(outpoint) {
			Some(height) => {
				let _ = sender.send(*height);
			},
			None => state.pending_spends.push(PendingSpend { outpoint: *outpoint, sender }),
		}
		SpendEvent { spent }
	}
}
