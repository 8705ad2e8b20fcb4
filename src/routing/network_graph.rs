// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The [`NetworkGraph`] stores the channel topology learned from funding completions and from
//! peer gossip, and is what routes are computed over.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use crate::chain::transaction::OutPoint;
use crate::ln::msgs::DecodeError;
use crate::ln::NodeId;
use crate::util::ser::{Readable, Writeable};

/// An unordered pair of channel endpoints, normalized so that the lexicographically smaller node
/// id is always first. Two announcements of the same channel from either side land on the same
/// key.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodePair {
	/// The lexicographically smaller endpoint.
	pub a: NodeId,
	/// The lexicographically larger endpoint.
	pub b: NodeId,
}

impl NodePair {
	/// Builds a normalized pair from two endpoints in any order.
	pub fn new(x: NodeId, y: NodeId) -> Self {
		if x <= y {
			NodePair { a: x, b: y }
		} else {
			NodePair { a: y, b: x }
		}
	}

	/// Given one endpoint of the pair, returns the other.
	pub fn other(&self, node: &NodeId) -> NodeId {
		if *node == self.a {
			self.b
		} else {
			self.a
		}
	}
}
impl_writeable!(NodePair, { a, b });

/// A single channel between a pair of nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelEdge {
	/// The funding outpoint which uniquely identifies the channel.
	pub channel_point: OutPoint,
	/// The channel's total capacity in satoshis, an upper bound on what can flow across it.
	pub capacity: u64,
	/// The routing weight of traversing this channel. Lower is preferred.
	pub weight: u64,
}
impl_writeable!(ChannelEdge, { channel_point, capacity, weight });

/// The channel topology as this node currently understands it.
///
/// Edges are keyed by the normalized endpoint pair; parallel channels between the same pair are
/// kept as separate entries in the per-pair list, deduplicated by channel point.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkGraph {
	channels: BTreeMap<NodePair, Vec<ChannelEdge>>,
}

impl NetworkGraph {
	/// Creates an empty graph.
	pub fn new() -> Self {
		NetworkGraph { channels: BTreeMap::new() }
	}

	/// Inserts a channel between the given endpoints. Returns true if the edge was new, false if
	/// a channel with the same channel point was already present between this pair (in which case
	/// the graph is unchanged).
	pub fn add_channel(&mut self, node_a: NodeId, node_b: NodeId, edge: ChannelEdge) -> bool {
		let pair = NodePair::new(node_a, node_b);
		let edges = self.channels.entry(pair).or_default();
		if edges.iter().any(|e| e.channel_point == edge.channel_point) {
			return false;
		}
		edges.push(edge);
		true
	}

	/// Removes the channel with the given channel point, wherever it is. Returns true if an edge
	/// was removed.
	pub fn remove_channel(&mut self, channel_point: &OutPoint) -> bool {
		let mut removed = false;
		self.channels.retain(|_, edges| {
			let before = edges.len();
			edges.retain(|e| e.channel_point != *channel_point);
			removed |= edges.len() != before;
			!edges.is_empty()
		});
		removed
	}

	/// Enumerates every edge in the graph exactly once, with its endpoints.
	pub fn all_channels(&self) -> impl Iterator<Item = (NodePair, &ChannelEdge)> + '_ {
		self.channels.iter().flat_map(|(pair, edges)| edges.iter().map(move |e| (*pair, e)))
	}

	/// The edges adjacent to the given node, as (neighbor, edge) pairs.
	pub fn adjacent(&self, node: &NodeId) -> Vec<(NodeId, ChannelEdge)> {
		let mut res = Vec::new();
		for (pair, edges) in self.channels.iter() {
			if pair.a == *node || pair.b == *node {
				let other = pair.other(node);
				for edge in edges.iter() {
					res.push((other, *edge));
				}
			}
		}
		res
	}

	/// The largest-capacity edge between two nodes, if any channel connects them.
	pub fn best_edge(&self, x: &NodeId, y: &NodeId) -> Option<ChannelEdge> {
		self.channels
			.get(&NodePair::new(*x, *y))
			.and_then(|edges| edges.iter().max_by_key(|e| e.capacity).copied())
	}

	/// The number of edges in the graph.
	pub fn channel_count(&self) -> usize {
		self.channels.values().map(|v| v.len()).sum()
	}
}

impl Writeable for NetworkGraph {
	fn write<W: Write>(&self, w: &mut W) -> Result<(), io::Error> {
		(self.channel_count() as u32).write(w)?;
		for (pair, edge) in self.all_channels() {
			pair.write(w)?;
			edge.write(w)?;
		}
		Ok(())
	}
}

impl Readable for NetworkGraph {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let count: u32 = Readable::read(r)?;
		let mut graph = NetworkGraph::new();
		for _ in 0..count {
			let pair: NodePair = Readable::read(r)?;
			let edge: ChannelEdge = Readable::read(r)?;
			graph.add_channel(pair.a, pair.b, edge);
		}
		Ok(graph)
	}
}
