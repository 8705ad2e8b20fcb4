// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! A payment-channel network node.
//!
//! Arclight implements the control plane of a payment-channel network node: a
//! peer registry over an authenticated transport, a channel-funding state
//! machine, an HTLC switch forwarding conditional payments hop-by-hop, a
//! distributed routing table with path selection, and a payment lifecycle
//! manager, all coordinated through a single serialized dispatcher.
//!
//! Wallet operations, transaction signing, chain observation, persistence and
//! transport encryption are consumed through narrow traits; see [`sign`],
//! [`chain`], [`util::persist`] and [`ln::peer_handler`] for the interfaces
//! and the provided in-memory/simnet implementations.
//!
//! Start a node with [`ln::node::Node::start`] and drive it through the
//! returned [`ln::node::NodeHandle`].

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![allow(clippy::type_complexity)]

#[macro_use]
pub mod util;
pub mod chain;
pub mod ln;
pub mod routing;
pub mod sign;
