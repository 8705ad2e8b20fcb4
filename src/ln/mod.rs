// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Implementations of the node's control plane and structs/traits for use therein, along with the
//! basic identifier types shared across it.

use std::fmt;
use std::io::{Read, Write};

use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::PublicKey;

use crate::ln::msgs::DecodeError;
use crate::util::ser::{Readable, Writeable};

pub mod funding;
pub mod msgs;
pub mod node;
pub mod payment;
pub mod peer_handler;
pub mod switch;

#[cfg(test)]
mod functional_tests;

macro_rules! hex_display {
	($st: ident) => {
		impl fmt::Display for $st {
			fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
				for b in self.0.iter() {
					write!(f, "{:02x}", b)?;
				}
				Ok(())
			}
		}
		impl fmt::Debug for $st {
			fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
				write!(f, "{}({})", stringify!($st), self)
			}
		}
		impl Writeable for $st {
			fn write<W: Write>(&self, w: &mut W) -> Result<(), std::io::Error> {
				self.0.write(w)
			}
		}
		impl Readable for $st {
			fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
				Ok($st(Readable::read(r)?))
			}
		}
	};
}

/// The network-wide identity of a node: the sha256 digest of its serialized identity public key.
///
/// Unique network-wide and immutable once assigned.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
	/// Derives the node id for the given identity public key.
	pub fn from_pubkey(pubkey: &PublicKey) -> Self {
		NodeId(sha256::Hash::hash(&pubkey.serialize()).to_byte_array())
	}
}

hex_display!(NodeId);

/// The hash of a payment's preimage, identifying an HTLC/invoice end-to-end.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PaymentHash(pub [u8; 32]);
hex_display!(PaymentHash);

/// The secret whose sha256 digest is a [`PaymentHash`]; revealing it settles the HTLC/invoice.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PaymentPreimage(pub [u8; 32]);
hex_display!(PaymentPreimage);

impl PaymentPreimage {
	/// Computes the payment hash committing to this preimage.
	pub fn payment_hash(&self) -> PaymentHash {
		PaymentHash(sha256::Hash::hash(&self.0).to_byte_array())
	}
}

/// The temporary identifier of a channel-funding negotiation, assigned by the initiator.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub [u8; 32]);
hex_display!(ChannelId);

impl ChannelId {
	/// Generates a fresh random temporary channel id.
	pub fn new_random() -> Self {
		use rand::Rng;
		ChannelId(rand::thread_rng().gen())
	}
}

/// The result of an admission-control query: whether an HTLC of a given amount may be sent toward
/// a given peer.
///
/// A `Decline` or `Timeout` must never be treated as success by callers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HTLCStatus {
	/// Sufficient outbound liquidity exists; the HTLC may be sent.
	Allow,
	/// The HTLC was declined, e.g. for insufficient liquidity or a missing link.
	Decline,
	/// The admission query did not complete in time.
	Timeout,
}
