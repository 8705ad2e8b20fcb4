// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Error types live here.

use std::fmt;

use crate::ln::msgs::HtlcFailReason;
use crate::routing::router::PathCandidate;

/// Errors establishing an outbound peer connection. These are reported to the caller and are
/// never fatal to the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectError {
	/// An active peer (or an in-flight connection attempt) already exists for this node id.
	DuplicateConnection,
	/// No host is known for the requested node id and none was provided.
	UnknownHost,
	/// The transport-level connection failed.
	ConnectionFailed(String),
	/// The connection was established but the authenticated handshake failed, e.g. the remote
	/// identity did not match the one requested.
	HandshakeFailed(String),
	/// The node is shutting down.
	NodeShuttingDown,
}

impl fmt::Display for ConnectError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			ConnectError::DuplicateConnection => write!(f, "already connected to peer"),
			ConnectError::UnknownHost => write!(f, "unknown host for node id"),
			ConnectError::ConnectionFailed(ref err) => write!(f, "connection failed: {}", err),
			ConnectError::HandshakeFailed(ref err) => write!(f, "handshake failed: {}", err),
			ConnectError::NodeShuttingDown => write!(f, "node shutting down"),
		}
	}
}

/// Terminal failure reasons of a channel funding workflow. Any reserved local funding amount has
/// been released by the time one of these is reported.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FundingError {
	/// A funding workflow with this peer is already in progress.
	AlreadyInProgress,
	/// The target peer is not connected.
	PeerNotConnected,
	/// The wallet could not reserve the requested local funding amount.
	InsufficientFunds,
	/// The counterparty rejected the channel open.
	Rejected(String),
	/// A funding signature failed validation.
	SignatureInvalid,
	/// A step of the workflow (including waiting for confirmations) timed out.
	Timeout,
	/// The peer disconnected mid-workflow.
	Disconnected,
	/// The signer refused to sign the funding transaction.
	SignerUnavailable,
	/// The requested parameters violate local policy (e.g. funding amount over the configured
	/// maximum).
	PolicyViolation(String),
	/// The node is shutting down.
	NodeShuttingDown,
}

impl fmt::Display for FundingError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			FundingError::AlreadyInProgress => write!(f, "funding workflow already in progress"),
			FundingError::PeerNotConnected => write!(f, "peer not connected"),
			FundingError::InsufficientFunds => write!(f, "insufficient wallet funds"),
			FundingError::Rejected(ref err) => write!(f, "counterparty rejected: {}", err),
			FundingError::SignatureInvalid => write!(f, "funding signature invalid"),
			FundingError::Timeout => write!(f, "funding workflow timed out"),
			FundingError::Disconnected => write!(f, "peer disconnected"),
			FundingError::SignerUnavailable => write!(f, "signer unavailable"),
			FundingError::PolicyViolation(ref err) => write!(f, "policy violation: {}", err),
			FundingError::NodeShuttingDown => write!(f, "node shutting down"),
		}
	}
}

/// Why a payment send failed. Carried back to the original caller exactly once per payment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PaymentSendFailure {
	/// No candidate path passed admission control. Every computed candidate is included with its
	/// per-path validation status so callers can see why each was not usable, rather than the
	/// non-allow paths being silently skipped.
	NoRoute {
		/// The candidate paths that were considered, annotated with their validation status.
		failures: Vec<PathCandidate>,
	},
	/// All path attempts failed; the reason of the last failure is included.
	RetriesExhausted {
		/// The failure reason reported for the final attempt.
		reason: HtlcFailReason,
		/// How many attempts were made.
		attempts: u32,
	},
	/// The payment did not complete before the configured deadline.
	Timeout,
	/// A payment with the same payment hash is already in flight.
	DuplicatePayment,
	/// The node is shutting down.
	NodeShuttingDown,
}

impl fmt::Display for PaymentSendFailure {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			PaymentSendFailure::NoRoute { ref failures } => {
				write!(f, "no route ({} candidate path(s) rejected)", failures.len())
			},
			PaymentSendFailure::RetriesExhausted { ref reason, attempts } => {
				write!(f, "payment failed after {} attempt(s): {}", attempts, reason)
			},
			PaymentSendFailure::Timeout => write!(f, "payment timed out"),
			PaymentSendFailure::DuplicatePayment => write!(f, "payment already in flight"),
			PaymentSendFailure::NodeShuttingDown => write!(f, "node shutting down"),
		}
	}
}
