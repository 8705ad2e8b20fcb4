// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Tracking of outbound payments across retries, and the invoice registry which settles inbound
//! HTLCs addressed to this node.

use std::collections::HashMap;
use std::sync::Arc;

use rand::{thread_rng, Rng};
use tokio::sync::oneshot;

use crate::ln::msgs::HtlcFailReason;
use crate::ln::{HTLCStatus, NodeId, PaymentHash, PaymentPreimage};
use crate::routing::router::PathCandidate;
use crate::util::errors::PaymentSendFailure;
use crate::util::logger::Logger;

/// A single-use mailbox through which a payment's final outcome is delivered.
pub type PaymentResultSender = oneshot::Sender<Result<PaymentPreimage, PaymentSendFailure>>;

/// An outbound payment which has been dispatched but not yet resolved.
pub struct PendingPayment {
	/// The destination node.
	pub destination: NodeId,
	/// The payment amount in satoshis.
	pub amount_satoshis: u64,
	/// Candidate paths not yet attempted, best-first.
	pub remaining_paths: Vec<PathCandidate>,
	/// How many paths have been dispatched so far.
	pub attempts: u32,
	result: Option<PaymentResultSender>,
}

/// Tracks every in-flight outbound payment by payment hash and enforces retry and
/// exactly-once-completion policy. Owned by the dispatcher.
pub struct PaymentManager {
	pending: HashMap<PaymentHash, PendingPayment>,
	max_attempts: u32,
	logger: Arc<dyn Logger>,
}

impl PaymentManager {
	/// Creates a payment manager which will dispatch at most `max_attempts` paths per payment.
	pub fn new(max_attempts: u32, logger: Arc<dyn Logger>) -> Self {
		PaymentManager { pending: HashMap::new(), max_attempts, logger }
	}

	/// Admits a new payment given its validated path candidates.
	///
	/// Candidates which did not validate `Allow` are never dispatched; if no candidate is
	/// usable the full annotated set is returned in [`PaymentSendFailure::NoRoute`] so the
	/// caller can see why each path was rejected. On success the payment is registered and the
	/// first path to dispatch is returned; `None` means the payment already completed through
	/// the result mailbox.
	pub fn begin(
		&mut self, destination: NodeId, amount_satoshis: u64, payment_hash: PaymentHash,
		candidates: Vec<PathCandidate>, result: PaymentResultSender,
	) -> Option<PathCandidate> {
		if self.pending.contains_key(&payment_hash) {
			let _ = result.send(Err(PaymentSendFailure::DuplicatePayment));
			return None;
		}
		let (mut usable, unusable): (Vec<PathCandidate>, Vec<PathCandidate>) =
			candidates.into_iter().partition(|c| c.status == Some(HTLCStatus::Allow));
		if usable.is_empty() {
			let _ = result.send(Err(PaymentSendFailure::NoRoute { failures: unusable }));
			return None;
		}
		let first = usable.remove(0);
		log_debug!(
			self.logger,
			"Dispatching payment {} of {} sat to {} ({} backup path(s))",
			payment_hash,
			amount_satoshis,
			destination,
			usable.len()
		);
		self.pending.insert(payment_hash, PendingPayment {
			destination,
			amount_satoshis,
			remaining_paths: usable,
			attempts: 1,
			result: Some(result),
		});
		Some(first)
	}

	/// Whether a payment with this hash is in flight.
	pub fn is_pending(&self, payment_hash: &PaymentHash) -> bool {
		self.pending.contains_key(payment_hash)
	}

	/// Completes a payment whose preimage came back. Idempotent; later resolutions for the same
	/// hash are ignored.
	pub fn succeed(&mut self, payment_hash: &PaymentHash, preimage: PaymentPreimage) {
		if let Some(mut payment) = self.pending.remove(payment_hash) {
			log_info!(
				self.logger,
				"Payment {} to {} succeeded after {} attempt(s)",
				payment_hash,
				payment.destination,
				payment.attempts
			);
			if let Some(tx) = payment.result.take() {
				let _ = tx.send(Ok(preimage));
			}
		}
	}

	/// Handles a failed attempt. Returns the next path to dispatch if the payment should be
	/// retried; otherwise the payment completes with the last failure reason.
	pub fn handle_failure(
		&mut self, payment_hash: &PaymentHash, reason: HtlcFailReason,
	) -> Option<PathCandidate> {
		let payment = self.pending.get_mut(payment_hash)?;
		if payment.attempts < self.max_attempts && !payment.remaining_paths.is_empty() {
			payment.attempts += 1;
			let next = payment.remaining_paths.remove(0);
			log_debug!(
				self.logger,
				"Retrying payment {} over backup path (attempt {}): previous failed with {}",
				payment_hash,
				payment.attempts,
				reason
			);
			return Some(next);
		}
		let mut payment = self.pending.remove(payment_hash).expect("present just above");
		log_info!(
			self.logger,
			"Payment {} to {} failed after {} attempt(s): {}",
			payment_hash,
			payment.destination,
			payment.attempts,
			reason
		);
		if let Some(tx) = payment.result.take() {
			let _ = tx
				.send(Err(PaymentSendFailure::RetriesExhausted { reason, attempts: payment.attempts }));
		}
		None
	}

	/// Completes a payment whose deadline expired before any resolution arrived.
	pub fn timeout(&mut self, payment_hash: &PaymentHash) {
		if let Some(mut payment) = self.pending.remove(payment_hash) {
			log_warn!(
				self.logger,
				"Payment {} to {} timed out in flight",
				payment_hash,
				payment.destination
			);
			if let Some(tx) = payment.result.take() {
				let _ = tx.send(Err(PaymentSendFailure::Timeout));
			}
		}
	}

	/// Fails every in-flight payment, used at node shutdown.
	pub fn abort_all(&mut self) {
		for (_, mut payment) in self.pending.drain() {
			if let Some(tx) = payment.result.take() {
				let _ = tx.send(Err(PaymentSendFailure::NodeShuttingDown));
			}
		}
	}
}

/// An invoice this node can be paid against.
#[derive(Clone, Debug)]
pub struct Invoice {
	/// The payment hash the payer must pay to.
	pub payment_hash: PaymentHash,
	/// The preimage revealed on settlement.
	pub payment_preimage: PaymentPreimage,
	/// The minimum amount in satoshis this invoice settles for.
	pub amount_satoshis: u64,
	/// Whether the invoice has already been settled. A settled invoice never settles again.
	pub settled: bool,
}

/// Invoices registered on this node, keyed by payment hash. Owned by the dispatcher.
pub struct InvoiceRegistry {
	invoices: HashMap<PaymentHash, Invoice>,
	logger: Arc<dyn Logger>,
}

impl InvoiceRegistry {
	/// Creates an empty registry.
	pub fn new(logger: Arc<dyn Logger>) -> Self {
		InvoiceRegistry { invoices: HashMap::new(), logger }
	}

	/// Registers a new invoice for the given amount with a random preimage, returning the hash
	/// to hand to the payer and the preimage itself.
	pub fn add_invoice(&mut self, amount_satoshis: u64) -> (PaymentHash, PaymentPreimage) {
		let preimage = PaymentPreimage(thread_rng().gen());
		let payment_hash = preimage.payment_hash();
		self.invoices.insert(payment_hash, Invoice {
			payment_hash,
			payment_preimage: preimage,
			amount_satoshis,
			settled: false,
		});
		log_info!(self.logger, "Added invoice {} for {} sat", payment_hash, amount_satoshis);
		(payment_hash, preimage)
	}

	/// Attempts to settle an inbound HTLC against a registered invoice. On success the invoice
	/// is marked settled and the preimage is revealed.
	pub fn settle(
		&mut self, payment_hash: &PaymentHash, amount_satoshis: u64,
	) -> Result<PaymentPreimage, HtlcFailReason> {
		let invoice = match self.invoices.get_mut(payment_hash) {
			Some(invoice) if !invoice.settled => invoice,
			// A settled invoice looks no different from an unknown one to the payer.
			Some(_) | None => return Err(HtlcFailReason::UnknownPaymentHash),
		};
		if amount_satoshis < invoice.amount_satoshis {
			return Err(HtlcFailReason::IncorrectPaymentAmount);
		}
		invoice.settled = true;
		log_info!(self.logger, "Settled invoice {} with {} sat", payment_hash, amount_satoshis);
		Ok(invoice.payment_preimage)
	}
}
