// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The router computes candidate paths over the [`NetworkGraph`] and annotates each with an
//! admission status, so callers see exactly why a candidate was not usable instead of having it
//! silently dropped.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::Instant;

use crate::ln::{HTLCStatus, NodeId};
use crate::routing::network_graph::{ChannelEdge, NetworkGraph, NodePair};

/// An admission predicate for the first hop of a path. Given the first-hop peer and the amount,
/// reports whether this node's local link can carry the HTLC.
pub type AdmissionCheck<'a> = &'a mut dyn FnMut(&NodeId, u64) -> HTLCStatus;

/// A candidate path to a destination, ordered best-first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathCandidate {
	/// The hops of the path, beginning with a direct peer of this node and ending with the
	/// destination. The local node is not included.
	pub hops: Vec<NodeId>,
	/// The sum of the edge weights along the path.
	pub total_weight: u64,
	/// The smallest edge capacity along the path, in satoshis.
	pub bottleneck_capacity: u64,
	/// The admission status of this path, if validation was requested.
	pub status: Option<HTLCStatus>,
}

impl PathCandidate {
	fn cmp_key(&self) -> (u64, u64, &[NodeId]) {
		// Larger bottlenecks sort earlier, hence the inversion.
		(self.total_weight, u64::MAX - self.bottleneck_capacity, &self.hops)
	}
}

/// Finds up to `max_paths` loop-free paths from `source` to `dest`, best-first.
///
/// The shortest path is found by edge weight; further paths are the next-shortest simple paths
/// (Yen's algorithm). Total ordering is (total weight, bottleneck capacity descending,
/// lexicographic hop sequence) so results are reproducible for a given graph.
///
/// When `admission` is provided each path is validated: the first hop is checked through the
/// predicate (only local links can answer liquidity queries), and every later hop is checked
/// against the best advertised edge capacity. Validation stops at `deadline` if one is given,
/// after which remaining paths are annotated [`HTLCStatus::Timeout`].
pub fn find_paths(
	graph: &NetworkGraph, source: &NodeId, dest: &NodeId, amount_satoshis: u64, max_paths: usize,
	mut admission: Option<AdmissionCheck<'_>>, deadline: Option<Instant>,
) -> Vec<PathCandidate> {
	if max_paths == 0 || source == dest {
		return Vec::new();
	}
	let mut found: Vec<Vec<NodeId>> = Vec::new();
	let mut candidates: Vec<Vec<NodeId>> = Vec::new();

	if let Some(first) = dijkstra(graph, source, dest, &HashSet::new(), &HashSet::new()) {
		found.push(first);
	} else {
		return Vec::new();
	}

	while found.len() < max_paths {
		let prev = found.last().expect("found is non-empty").clone();
		// Each node of the previous path except the destination is a spur point.
		for spur_idx in 0..prev.len() - 1 {
			let root = &prev[..spur_idx + 1];
			let spur = prev[spur_idx];

			let mut banned_pairs = HashSet::new();
			for path in found.iter().chain(candidates.iter()) {
				if path.len() > spur_idx + 1 && path[..spur_idx + 1] == *root {
					banned_pairs.insert(NodePair::new(path[spur_idx], path[spur_idx + 1]));
				}
			}
			let banned_nodes: HashSet<NodeId> = root[..spur_idx].iter().copied().collect();

			if let Some(spur_path) = dijkstra(graph, &spur, dest, &banned_pairs, &banned_nodes) {
				let mut total = root[..spur_idx].to_vec();
				total.extend(spur_path);
				if !found.contains(&total) && !candidates.contains(&total) {
					candidates.push(total);
				}
			}
		}
		if candidates.is_empty() {
			break;
		}
		let best_idx = candidates
			.iter()
			.enumerate()
			.min_by(|(_, x), (_, y)| cmp_node_paths(graph, x, y))
			.map(|(i, _)| i)
			.expect("candidates is non-empty");
		found.push(candidates.swap_remove(best_idx));
	}

	let mut results: Vec<PathCandidate> = found
		.into_iter()
		.map(|path| {
			let (total_weight, bottleneck_capacity) = path_stats(graph, &path);
			// Drop the source from the reported hop list.
			PathCandidate { hops: path[1..].to_vec(), total_weight, bottleneck_capacity, status: None }
		})
		.collect();
	results.sort_by(|x, y| x.cmp_key().cmp(&y.cmp_key()));

	if let Some(check) = admission.as_mut() {
		for candidate in results.iter_mut() {
			if deadline.map_or(false, |d| Instant::now() >= d) {
				candidate.status = Some(HTLCStatus::Timeout);
				continue;
			}
			candidate.status = Some(validate_path(graph, candidate, amount_satoshis, check));
		}
	}
	results
}

fn validate_path(
	graph: &NetworkGraph, candidate: &PathCandidate, amount_satoshis: u64,
	check: &mut dyn FnMut(&NodeId, u64) -> HTLCStatus,
) -> HTLCStatus {
	let first_hop = match candidate.hops.first() {
		Some(hop) => hop,
		None => return HTLCStatus::Decline,
	};
	match check(first_hop, amount_satoshis) {
		HTLCStatus::Allow => {},
		other => return other,
	}
	// Later hops are not local links, so the best we can do is the advertised capacity.
	for window in candidate.hops.windows(2) {
		match graph.best_edge(&window[0], &window[1]) {
			Some(edge) if edge.capacity >= amount_satoshis => {},
			_ => return HTLCStatus::Decline,
		}
	}
	HTLCStatus::Allow
}

/// The minimum-weight edge between two adjacent nodes, ties broken toward larger capacity.
fn hop_edge(graph: &NetworkGraph, x: &NodeId, y: &NodeId) -> Option<ChannelEdge> {
	let mut best: Option<ChannelEdge> = None;
	for (neighbor, edge) in graph.adjacent(x) {
		if neighbor != *y {
			continue;
		}
		best = match best {
			None => Some(edge),
			Some(cur)
				if (edge.weight, u64::MAX - edge.capacity)
					< (cur.weight, u64::MAX - cur.capacity) =>
			{
				Some(edge)
			},
			Some(cur) => Some(cur),
		};
	}
	best
}

fn path_stats(graph: &NetworkGraph, path: &[NodeId]) -> (u64, u64) {
	let mut total_weight = 0u64;
	let mut bottleneck = u64::MAX;
	for window in path.windows(2) {
		if let Some(edge) = hop_edge(graph, &window[0], &window[1]) {
			total_weight = total_weight.saturating_add(edge.weight);
			bottleneck = bottleneck.min(edge.capacity);
		}
	}
	(total_weight, bottleneck)
}

fn cmp_node_paths(graph: &NetworkGraph, x: &[NodeId], y: &[NodeId]) -> Ordering {
	let (xw, xc) = path_stats(graph, x);
	let (yw, yc) = path_stats(graph, y);
	(xw, u64::MAX - xc, x).cmp(&(yw, u64::MAX - yc, y))
}

#[derive(PartialEq, Eq)]
struct HeapEntry {
	dist: u64,
	node: NodeId,
}
impl Ord for HeapEntry {
	fn cmp(&self, other: &Self) -> Ordering {
		// BinaryHeap is a max-heap; invert so the smallest distance pops first, with node id as
		// the deterministic tie-break.
		(other.dist, &other.node).cmp(&(self.dist, &self.node))
	}
}
impl PartialOrd for HeapEntry {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

fn dijkstra(
	graph: &NetworkGraph, source: &NodeId, dest: &NodeId, banned_pairs: &HashSet<NodePair>,
	banned_nodes: &HashSet<NodeId>,
) -> Option<Vec<NodeId>> {
	let mut dist: HashMap<NodeId, u64> = HashMap::new();
	let mut prev: HashMap<NodeId, NodeId> = HashMap::new();
	let mut heap = BinaryHeap::new();
	dist.insert(*source, 0);
	heap.push(HeapEntry { dist: 0, node: *source });

	while let Some(HeapEntry { dist: d, node }) = heap.pop() {
		if node == *dest {
			break;
		}
		if d > *dist.get(&node).unwrap_or(&u64::MAX) {
			continue;
		}
		for (neighbor, edge) in graph.adjacent(&node) {
			if banned_nodes.contains(&neighbor)
				|| banned_pairs.contains(&NodePair::new(node, neighbor))
			{
				continue;
			}
			let next = d.saturating_add(edge.weight);
			let better = match dist.get(&neighbor) {
				None => true,
				Some(cur) if next < *cur => true,
				// Equal-distance ties resolve toward the smaller predecessor id.
				Some(cur) if next == *cur => prev.get(&neighbor).map_or(true, |p| node < *p),
				Some(_) => false,
			};
			if better {
				dist.insert(neighbor, next);
				prev.insert(neighbor, node);
				heap.push(HeapEntry { dist: next, node: neighbor });
			}
		}
	}

	if !dist.contains_key(dest) {
		return None;
	}
	let mut path = vec![*dest];
	let mut cursor = *dest;
	while cursor != *source {
		cursor = *prev.get(&cursor)?;
		path.push(cursor);
	}
	path.reverse();
	Some(path)
}
