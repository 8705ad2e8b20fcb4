// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Traits through which the node reaches its external wallet: key derivation and transaction
//! signing ([`Signer`]) and funding-amount reservation ([`WalletController`]). The node never
//! holds key material or on-chain balances itself.

use std::sync::Mutex;

use bitcoin::hashes::{sha256, sha256d, Hash, HashEngine};
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};

use crate::ln::ChannelId;

/// The signer refused or was unable to produce a signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignError;

/// Computes the message digest a funding-input signature commits to. Both the signing and the
/// verifying side must derive the digest the same way.
pub fn funding_input_message(tx: &[u8], input_index: u32) -> Message {
	let mut engine = sha256d::Hash::engine();
	engine.input(tx);
	engine.input(&input_index.to_be_bytes());
	Message::from_digest(sha256d::Hash::from_engine(engine).to_byte_array())
}

/// An interface to the external wallet's signing capabilities.
pub trait Signer: Send + Sync {
	/// Derives the public key this wallet will use for the funding output of the given channel.
	fn derive_funding_key(&self, channel_id: &ChannelId) -> PublicKey;
	/// Signs the funding-transaction input at `input_index` with the funding key of the given
	/// channel.
	fn sign_input(
		&self, channel_id: &ChannelId, tx: &[u8], input_index: u32,
	) -> Result<Signature, SignError>;
}

/// An interface to the external wallet's on-chain balance, used to reserve the local funding
/// amount for the lifetime of a funding workflow.
///
/// A workflow that reaches a terminal `Failed` state must release its reservation; one that
/// reaches `Open` converts it into channel capacity via [`WalletController::spend_funds`].
pub trait WalletController: Send + Sync {
	/// Reserves `amount` satoshis for a pending channel open. Fails if the spendable balance is
	/// insufficient.
	fn reserve_funds(&self, amount: u64) -> Result<(), ()>;
	/// Releases a previous reservation of `amount` satoshis back into the spendable balance.
	fn release_funds(&self, amount: u64);
	/// Converts a previous reservation of `amount` satoshis into spent (channel) funds.
	fn spend_funds(&self, amount: u64);
	/// The currently spendable (unreserved) balance in satoshis.
	fn available_balance(&self) -> u64;
}

/// A deterministic in-memory [`Signer`] for simnets and tests. Channel funding keys are derived
/// from a single master secret.
pub struct SimnetSigner {
	secp: Secp256k1<All>,
	master: SecretKey,
}

impl SimnetSigner {
	/// Constructs a signer from a 32-byte master seed.
	pub fn new(seed: [u8; 32]) -> Self {
		let master = SecretKey::from_slice(&sha256::Hash::hash(&seed).to_byte_array())
			.expect("sha256 output is a valid secret key with overwhelming probability");
		Self { secp: Secp256k1::new(), master }
	}

	fn channel_secret(&self, channel_id: &ChannelId) -> SecretKey {
		let mut engine = sha256::Hash::engine();
		engine.input(&self.master.secret_bytes());
		engine.input(&channel_id.0);
		SecretKey::from_slice(&sha256::Hash::from_engine(engine).to_byte_array())
			.expect("sha256 output is a valid secret key with overwhelming probability")
	}
}

impl Signer for SimnetSigner {
	fn derive_funding_key(&self, channel_id: &ChannelId) -> PublicKey {
		PublicKey::from_secret_key(&self.secp, &self.channel_secret(channel_id))
	}

	fn sign_input(
		&self, channel_id: &ChannelId, tx: &[u8], input_index: u32,
	) -> Result<Signature, SignError> {
		let msg = funding_input_message(tx, input_index);
		Ok(self.secp.sign_ecdsa(&msg, &self.channel_secret(channel_id)))
	}
}

/// An in-memory [`WalletController`] with a fixed initial balance, for simnets and tests.
pub struct SimnetWallet {
	balances: Mutex<(u64, u64)>, // (available, reserved)
}

impl SimnetWallet {
	/// Constructs a wallet holding `balance` spendable satoshis.
	pub fn new(balance: u64) -> Self {
		Self { balances: Mutex::new((balance, 0)) }
	}
}

impl WalletController for SimnetWallet {
	fn reserve_funds(&self, amount: u64) -> Result<(), ()> {
		let mut balances = self.balances.lock().unwrap();
		if balances.0 < amount {
			return Err(());
		}
		balances.0 -= amount;
		balances.1 += amount;
		Ok(())
	}

	fn release_funds(&self, amount: u64) {
		let mut balances = self.balances.lock().unwrap();
		let released = std::cmp::min(balances.1, amount);
		balances.1 -= released;
		balances.0 += released;
	}

	fn spend_funds(&self, amount: u64) {
		let mut balances = self.balances.lock().unwrap();
		balances.1 = balances.1.saturating_sub(amount);
	}

	fn available_balance(&self) -> u64 {
		self.balances.lock().unwrap().0
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn signatures_verify_against_derived_key() {
		let signer = SimnetSigner::new([9; 32]);
		let channel_id = ChannelId([5; 32]);
		let tx = b"funding tx bytes";
		let sig = signer.sign_input(&channel_id, tx, 0).unwrap();
		let key = signer.derive_funding_key(&channel_id);
		let secp = Secp256k1::verification_only();
		assert!(secp.verify_ecdsa(&funding_input_message(tx, 0), &sig, &key).is_ok());
		// A different input index must not verify.
		assert!(secp.verify_ecdsa(&funding_input_message(tx, 1), &sig, &key).is_err());
	}

	#[test]
	fn wallet_reserve_release() {
		let wallet = SimnetWallet::new(1000);
		assert!(wallet.reserve_funds(600).is_ok());
		assert_eq!(wallet.available_balance(), 400);
		assert!(wallet.reserve_funds(600).is_err());
		wallet.release_funds(600);
		assert_eq!(wallet.available_balance(), 1000);
		assert!(wallet.reserve_funds(1000).is_ok());
		wallet.spend_funds(1000);
		assert_eq!(wallet.available_balance(), 0);
	}
}
