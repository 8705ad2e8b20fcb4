// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Wire messages exchanged with peers, and the error types produced when decoding them.
//!
//! Messages are framed by the transport; within a frame they are encoded as a big-endian u16
//! message type followed by the message payload.

use std::fmt;
use std::io::{self, Cursor, Read, Write};

use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::PublicKey;

use crate::chain::transaction::OutPoint;
use crate::ln::{ChannelId, NodeId, PaymentHash, PaymentPreimage};
use crate::routing::network_graph::ChannelEdge;
use crate::util::ser::{Readable, VecWriter, Writeable};

/// An error in decoding a message or struct.
#[derive(Debug)]
pub enum DecodeError {
	/// A message type we don't know how to handle.
	UnknownMessageType(u16),
	/// Value was invalid, e.g. a byte which was supposed to be a bool was something other than 0
	/// or 1, a public key or signature was malformed, text wasn't UTF-8, etc.
	InvalidValue,
	/// Buffer too short.
	ShortRead,
	/// Error from std::io.
	Io(io::ErrorKind),
}

impl fmt::Display for DecodeError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			DecodeError::UnknownMessageType(ty) => write!(f, "Unknown message type {}", ty),
			DecodeError::InvalidValue => f.write_str("Invalid value in decoded message"),
			DecodeError::ShortRead => f.write_str("Message shorter than expected"),
			DecodeError::Io(kind) => write!(f, "IO error: {:?}", kind),
		}
	}
}

impl From<io::Error> for DecodeError {
	fn from(e: io::Error) -> Self {
		if e.kind() == io::ErrorKind::UnexpectedEof {
			DecodeError::ShortRead
		} else {
			DecodeError::Io(e.kind())
		}
	}
}

/// Why an HTLC was failed back toward its origin. Carried on the wire in [`UpdateFailHtlc`],
/// never dropped silently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HtlcFailReason {
	/// The forwarding node has no link toward the next hop.
	NoRoute,
	/// The forwarding node lacks outbound liquidity toward the next hop.
	InsufficientLiquidity,
	/// The HTLC's remaining time-lock is too small to forward safely.
	ExpiryTooSoon,
	/// The final node has no invoice matching the payment hash (or it was already settled).
	UnknownPaymentHash,
	/// The delivered amount is below the invoice amount.
	IncorrectPaymentAmount,
	/// An admission query toward the next hop did not complete in time.
	Timeout,
	/// The downstream peer claimed an HTLC with a preimage not matching its payment hash.
	InvalidPreimage,
}

impl fmt::Display for HtlcFailReason {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			HtlcFailReason::NoRoute => f.write_str("no route"),
			HtlcFailReason::InsufficientLiquidity => f.write_str("insufficient liquidity"),
			HtlcFailReason::ExpiryTooSoon => f.write_str("expiry too soon"),
			HtlcFailReason::UnknownPaymentHash => f.write_str("unknown payment hash"),
			HtlcFailReason::IncorrectPaymentAmount => f.write_str("incorrect payment amount"),
			HtlcFailReason::Timeout => f.write_str("timeout"),
			HtlcFailReason::InvalidPreimage => f.write_str("invalid preimage"),
		}
	}
}

impl Writeable for HtlcFailReason {
	fn write<W: Write>(&self, w: &mut W) -> Result<(), io::Error> {
		let code: u8 = match self {
			HtlcFailReason::NoRoute => 0,
			HtlcFailReason::InsufficientLiquidity => 1,
			HtlcFailReason::ExpiryTooSoon => 2,
			HtlcFailReason::UnknownPaymentHash => 3,
			HtlcFailReason::IncorrectPaymentAmount => 4,
			HtlcFailReason::Timeout => 5,
			HtlcFailReason::InvalidPreimage => 6,
		};
		code.write(w)
	}
}
impl Readable for HtlcFailReason {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		match <u8 as Readable>::read(r)? {
			0 => Ok(HtlcFailReason::NoRoute),
			1 => Ok(HtlcFailReason::InsufficientLiquidity),
			2 => Ok(HtlcFailReason::ExpiryTooSoon),
			3 => Ok(HtlcFailReason::UnknownPaymentHash),
			4 => Ok(HtlcFailReason::IncorrectPaymentAmount),
			5 => Ok(HtlcFailReason::Timeout),
			6 => Ok(HtlcFailReason::InvalidPreimage),
			_ => Err(DecodeError::InvalidValue),
		}
	}
}

/// An open_channel message: proposes a new channel to a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenChannel {
	/// A temporary channel id, until the funding outpoint is announced.
	pub temporary_channel_id: ChannelId,
	/// The amount the initiator is putting into the channel, in satoshis.
	pub funding_satoshis: u64,
	/// The amount to push to the counterparty as part of the open, in satoshis.
	pub push_satoshis: u64,
	/// The confirmation depth both sides will wait for before the channel is usable.
	pub minimum_depth: u32,
	/// The initiator's key for the funding output.
	pub funding_pubkey: PublicKey,
}
impl_writeable!(OpenChannel, {
	temporary_channel_id,
	funding_satoshis,
	push_satoshis,
	minimum_depth,
	funding_pubkey
});

/// An accept_channel message: accepts a proposed channel open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceptChannel {
	/// The temporary channel id of the negotiation being accepted.
	pub temporary_channel_id: ChannelId,
	/// The confirmation depth the acceptor requires, bounded by its handshake limits.
	pub minimum_depth: u32,
	/// The acceptor's key for the funding output.
	pub funding_pubkey: PublicKey,
}
impl_writeable!(AcceptChannel, { temporary_channel_id, minimum_depth, funding_pubkey });

/// A funding_signed message: announces the funding outpoint and carries the initiator's
/// signature over the funding input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FundingSigned {
	/// The temporary channel id of the negotiation.
	pub temporary_channel_id: ChannelId,
	/// The channel point capitalizing the channel.
	pub channel_point: OutPoint,
	/// The initiator's signature over the funding input.
	pub signature: Signature,
}
impl_writeable!(FundingSigned, { temporary_channel_id, channel_point, signature });

/// A channel_ready message: the sender has seen the funding transaction reach the negotiated
/// depth and considers the channel usable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelReady {
	/// The channel point of the now-usable channel.
	pub channel_point: OutPoint,
}
impl_writeable!(ChannelReady, { channel_point });

/// An update_add_htlc message: offers a conditional payment to the receiving peer.
///
/// The remaining route after the receiver is carried in the clear; onion wrapping of hop payloads
/// is out of scope here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateAddHtlc {
	/// The sender-assigned id of this HTLC on this link, used to correlate the returning fulfill
	/// or fail.
	pub htlc_id: u64,
	/// The hash the payment preimage must match.
	pub payment_hash: PaymentHash,
	/// The conditional payment amount, in satoshis.
	pub amount_satoshis: u64,
	/// The remaining time-lock, in blocks, decremented at each forwarding hop.
	pub cltv_expiry: u32,
	/// The node ids of the hops remaining after the receiver; empty if the receiver is the final
	/// destination.
	pub onward_route: Vec<NodeId>,
}
impl_writeable!(UpdateAddHtlc, { htlc_id, payment_hash, amount_satoshis, cltv_expiry, onward_route });

/// An update_fulfill_htlc message: settles an HTLC by revealing its preimage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFulfillHtlc {
	/// The id the receiver of this message assigned to the HTLC being settled.
	pub htlc_id: u64,
	/// The preimage matching the HTLC's payment hash.
	pub payment_preimage: PaymentPreimage,
}
impl_writeable!(UpdateFulfillHtlc, { htlc_id, payment_preimage });

/// An update_fail_htlc message: fails an HTLC back toward its origin with a reason.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFailHtlc {
	/// The id the receiver of this message assigned to the HTLC being failed.
	pub htlc_id: u64,
	/// Why the HTLC could not be forwarded or settled downstream.
	pub reason: HtlcFailReason,
}
impl_writeable!(UpdateFailHtlc, { htlc_id, reason });

/// A channel edge announced in a [`RoutingTableResponse`], together with the pair of nodes it
/// connects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnouncedChannel {
	/// One endpoint of the channel.
	pub node_a: NodeId,
	/// The other endpoint of the channel.
	pub node_b: NodeId,
	/// The edge itself: channel point, capacity and routing weight.
	pub edge: ChannelEdge,
}
impl_writeable!(AnnouncedChannel, { node_a, node_b, edge });

/// Requests the receiver's full routing table.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct RoutingTableRequest {}
impl Writeable for RoutingTableRequest {
	fn write<W: Write>(&self, _w: &mut W) -> Result<(), io::Error> {
		Ok(())
	}
}
impl Readable for RoutingTableRequest {
	fn read<R: Read>(_r: &mut R) -> Result<Self, DecodeError> {
		Ok(RoutingTableRequest {})
	}
}

/// Carries routing-table state: the full table in response to a [`RoutingTableRequest`], or just
/// the newly-learned edges when re-broadcasting gossip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingTableResponse {
	/// The announced channel edges.
	pub channels: Vec<AnnouncedChannel>,
}
impl_writeable!(RoutingTableResponse, { channels });

/// Requests the receiver's identity-to-host directory.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct NodeDirectoryRequest {}
impl Writeable for NodeDirectoryRequest {
	fn write<W: Write>(&self, _w: &mut W) -> Result<(), io::Error> {
		Ok(())
	}
}
impl Readable for NodeDirectoryRequest {
	fn read<R: Read>(_r: &mut R) -> Result<Self, DecodeError> {
		Ok(NodeDirectoryRequest {})
	}
}

/// A single identity-to-host directory entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeDirectoryEntry {
	/// The node's identity.
	pub node_id: NodeId,
	/// A host string at which the node's transport can be reached.
	pub host: String,
}
impl_writeable!(NodeDirectoryEntry, { node_id, host });

/// The receiver's identity-to-host directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeDirectoryResponse {
	/// The directory entries.
	pub entries: Vec<NodeDirectoryEntry>,
}
impl_writeable!(NodeDirectoryResponse, { entries });

/// An error message: tells the peer a funding negotiation (or the connection) is broken.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorMessage {
	/// The temporary channel id the error pertains to, or all-zero for connection-level errors.
	pub channel_id: ChannelId,
	/// A human-readable description.
	pub data: String,
}
impl_writeable!(ErrorMessage, { channel_id, data });

/// All messages which can cross a peer link, tagged by their wire type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
	/// An error message.
	Error(ErrorMessage),
	/// An open_channel message.
	OpenChannel(OpenChannel),
	/// An accept_channel message.
	AcceptChannel(AcceptChannel),
	/// A funding_signed message.
	FundingSigned(FundingSigned),
	/// A channel_ready message.
	ChannelReady(ChannelReady),
	/// An update_add_htlc message.
	UpdateAddHtlc(UpdateAddHtlc),
	/// An update_fulfill_htlc message.
	UpdateFulfillHtlc(UpdateFulfillHtlc),
	/// An update_fail_htlc message.
	UpdateFailHtlc(UpdateFailHtlc),
	/// A routing-table request.
	RoutingTableRequest(RoutingTableRequest),
	/// A routing-table response or gossip re-broadcast.
	RoutingTableResponse(RoutingTableResponse),
	/// A node-directory request.
	NodeDirectoryRequest(NodeDirectoryRequest),
	/// A node-directory response.
	NodeDirectoryResponse(NodeDirectoryResponse),
}

impl Message {
	/// The wire type of this message.
	pub fn wire_type(&self) -> u16 {
		match self {
			Message::Error(_) => 17,
			Message::OpenChannel(_) => 32,
			Message::AcceptChannel(_) => 33,
			Message::FundingSigned(_) => 35,
			Message::ChannelReady(_) => 36,
			Message::UpdateAddHtlc(_) => 128,
			Message::UpdateFulfillHtlc(_) => 130,
			Message::UpdateFailHtlc(_) => 131,
			Message::RoutingTableRequest(_) => 256,
			Message::RoutingTableResponse(_) => 257,
			Message::NodeDirectoryRequest(_) => 258,
			Message::NodeDirectoryResponse(_) => 259,
		}
	}

	/// A short human-readable name for logging.
	pub fn name(&self) -> &'static str {
		match self {
			Message::Error(_) => "error",
			Message::OpenChannel(_) => "open_channel",
			Message::AcceptChannel(_) => "accept_channel",
			Message::FundingSigned(_) => "funding_signed",
			Message::ChannelReady(_) => "channel_ready",
			Message::UpdateAddHtlc(_) => "update_add_htlc",
			Message::UpdateFulfillHtlc(_) => "update_fulfill_htlc",
			Message::UpdateFailHtlc(_) => "update_fail_htlc",
			Message::RoutingTableRequest(_) => "routing_table_request",
			Message::RoutingTableResponse(_) => "routing_table_response",
			Message::NodeDirectoryRequest(_) => "node_directory_request",
			Message::NodeDirectoryResponse(_) => "node_directory_response",
		}
	}
}

impl Writeable for Message {
	fn write<W: Write>(&self, w: &mut W) -> Result<(), io::Error> {
		self.wire_type().write(w)?;
		match self {
			Message::Error(msg) => msg.write(w),
			Message::OpenChannel(msg) => msg.write(w),
			Message::AcceptChannel(msg) => msg.write(w),
			Message::FundingSigned(msg) => msg.write(w),
			Message::ChannelReady(msg) => msg.write(w),
			Message::UpdateAddHtlc(msg) => msg.write(w),
			Message::UpdateFulfillHtlc(msg) => msg.write(w),
			Message::UpdateFailHtlc(msg) => msg.write(w),
			Message::RoutingTableRequest(msg) => msg.write(w),
			Message::RoutingTableResponse(msg) => msg.write(w),
			Message::NodeDirectoryRequest(msg) => msg.write(w),
			Message::NodeDirectoryResponse(msg) => msg.write(w),
		}
	}
}

impl Readable for Message {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let wire_type: u16 = Readable::read(r)?;
		match wire_type {
			17 => Ok(Message::Error(Readable::read(r)?)),
			32 => Ok(Message::OpenChannel(Readable::read(r)?)),
			33 => Ok(Message::AcceptChannel(Readable::read(r)?)),
			35 => Ok(Message::FundingSigned(Readable::read(r)?)),
			36 => Ok(Message::ChannelReady(Readable::read(r)?)),
			128 => Ok(Message::UpdateAddHtlc(Readable::read(r)?)),
			130 => Ok(Message::UpdateFulfillHtlc(Readable::read(r)?)),
			131 => Ok(Message::UpdateFailHtlc(Readable::read(r)?)),
			256 => Ok(Message::RoutingTableRequest(Readable::read(r)?)),
			257 => Ok(Message::RoutingTableResponse(Readable::read(r)?)),
			258 => Ok(Message::NodeDirectoryRequest(Readable::read(r)?)),
			259 => Ok(Message::NodeDirectoryResponse(Readable::read(r)?)),
			ty => Err(DecodeError::UnknownMessageType(ty)),
		}
	}
}

/// Encodes a message into a transport frame.
pub fn encode_msg(msg: &Message) -> Vec<u8> {
	let mut w = VecWriter(Vec::new());
	msg.write(&mut w).expect("in-memory writes don't error");
	w.0
}

/// Decodes a message from a transport frame.
pub fn decode_msg(frame: &[u8]) -> Result<Message, DecodeError> {
	let mut r = Cursor::new(frame);
	Message::read(&mut r)
}

#[cfg(test)]
mod tests {
	use super::*;
	use bitcoin::hashes::Hash;
	use bitcoin::Txid;

	fn round_trip(msg: Message) {
		let frame = encode_msg(&msg);
		assert_eq!(decode_msg(&frame).unwrap(), msg);
	}

	#[test]
	fn htlc_messages_round_trip() {
		round_trip(Message::UpdateAddHtlc(UpdateAddHtlc {
			htlc_id: 7,
			payment_hash: PaymentHash([1; 32]),
			amount_satoshis: 5000,
			cltv_expiry: 144,
			onward_route: vec![NodeId([2; 32]), NodeId([3; 32])],
		}));
		round_trip(Message::UpdateFulfillHtlc(UpdateFulfillHtlc {
			htlc_id: 7,
			payment_preimage: PaymentPreimage([9; 32]),
		}));
		round_trip(Message::UpdateFailHtlc(UpdateFailHtlc {
			htlc_id: 7,
			reason: HtlcFailReason::InsufficientLiquidity,
		}));
	}

	#[test]
	fn routing_messages_round_trip() {
		round_trip(Message::RoutingTableRequest(RoutingTableRequest {}));
		round_trip(Message::RoutingTableResponse(RoutingTableResponse {
			channels: vec![AnnouncedChannel {
				node_a: NodeId([1; 32]),
				node_b: NodeId([2; 32]),
				edge: ChannelEdge {
					channel_point: OutPoint { txid: Txid::from_byte_array([4; 32]), index: 0 },
					capacity: 100_000,
					weight: 1,
				},
			}],
		}));
		round_trip(Message::NodeDirectoryResponse(NodeDirectoryResponse {
			entries: vec![NodeDirectoryEntry {
				node_id: NodeId([8; 32]),
				host: "127.0.0.1:9735".to_string(),
			}],
		}));
	}

	#[test]
	fn unknown_type_rejected() {
		let mut frame = Vec::new();
		9999u16.write(&mut frame).unwrap();
		match decode_msg(&frame) {
			Err(DecodeError::UnknownMessageType(9999)) => {},
			other => panic!("unexpected decode result: {:?}", other),
		}
	}
}
