// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! A simple key-value store trait through which the node persists its state as opaque blobs,
//! plus the [`NodeDb`] wrapper defining the key scheme for the node directory, the routing table
//! and in-flight funding workflows.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::ln::funding::FundingSnapshot;
use crate::ln::ChannelId;
use crate::ln::NodeId;
use crate::routing::network_graph::NetworkGraph;
use crate::util::ser::{Readable, Writeable};

/// The namespace under which the identity-to-host directory is stored.
pub const NETWORK_NAMESPACE: &str = "network";
/// The key under which the identity-to-host directory is stored.
pub const DIRECTORY_KEY: &str = "directory";
/// The namespace under which the serialized routing table is stored.
pub const ROUTING_NAMESPACE: &str = "routing";
/// The key under which the serialized routing table is stored.
pub const ROUTING_TABLE_KEY: &str = "table";
/// The namespace under which in-flight funding workflow snapshots are stored, keyed by the hex
/// temporary channel id.
pub const FUNDING_NAMESPACE: &str = "funding";

/// Provides an interface that allows storage and retrieval of persisted values that are associated
/// with given keys.
///
/// In order to avoid collisions, keys are namespaced. Implementations must ensure `write` is
/// atomic with respect to crashes: a reader must observe either the old or the new value, never a
/// torn one.
pub trait KVStore: Send + Sync {
	/// Returns the data stored for the given `namespace` and `key`, or `None` if absent.
	fn read(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, io::Error>;
	/// Persists the given data under the given `key`, overwriting any prior value.
	fn write(&self, namespace: &str, key: &str, buf: &[u8]) -> Result<(), io::Error>;
	/// Removes any data stored for the given `namespace` and `key`. Removing a missing key is not
	/// an error.
	fn remove(&self, namespace: &str, key: &str) -> Result<(), io::Error>;
	/// Returns the keys stored under the given `namespace`.
	fn list(&self, namespace: &str) -> Result<Vec<String>, io::Error>;
}

/// A [`KVStore`] implementation that writes to and reads from the file system, one file per key.
///
/// Writes go through a temporary file followed by a rename so a crash mid-write never leaves a
/// torn value behind.
pub struct FilesystemStore {
	data_dir: PathBuf,
	// Serializes tmp-file writes so two writers can't race on the same tmp path.
	write_lock: Mutex<()>,
}

impl FilesystemStore {
	/// Constructs a new store rooted at the given directory, creating it if needed.
	pub fn new(data_dir: PathBuf) -> Self {
		Self { data_dir, write_lock: Mutex::new(()) }
	}

	fn namespace_path(&self, namespace: &str) -> PathBuf {
		self.data_dir.join(namespace)
	}
}

impl KVStore for FilesystemStore {
	fn read(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, io::Error> {
		let path = self.namespace_path(namespace).join(key);
		match fs::read(&path) {
			Ok(buf) => Ok(Some(buf)),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e),
		}
	}

	fn write(&self, namespace: &str, key: &str, buf: &[u8]) -> Result<(), io::Error> {
		let dir = self.namespace_path(namespace);
		fs::create_dir_all(&dir)?;
		let dest = dir.join(key);
		let tmp = dir.join(format!("{}.tmp", key));
		let _guard = self.write_lock.lock().unwrap();
		fs::write(&tmp, buf)?;
		fs::rename(&tmp, &dest)
	}

	fn remove(&self, namespace: &str, key: &str) -> Result<(), io::Error> {
		let path = self.namespace_path(namespace).join(key);
		match fs::remove_file(&path) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e),
		}
	}

	fn list(&self, namespace: &str) -> Result<Vec<String>, io::Error> {
		let dir = self.namespace_path(namespace);
		let mut keys = Vec::new();
		let entries = match fs::read_dir(&dir) {
			Ok(entries) => entries,
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(keys),
			Err(e) => return Err(e),
		};
		for entry in entries {
			let entry = entry?;
			if let Some(name) = entry.file_name().to_str() {
				if !name.ends_with(".tmp") {
					keys.push(name.to_string());
				}
			}
		}
		Ok(keys)
	}
}

/// An in-memory [`KVStore`], used by tests and simnets.
#[derive(Default)]
pub struct MemoryStore {
	entries: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryStore {
	/// Constructs a new, empty store.
	pub fn new() -> Self {
		Self::default()
	}
}

impl KVStore for MemoryStore {
	fn read(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, io::Error> {
		let entries = self.entries.lock().unwrap();
		Ok(entries.get(&(namespace.to_string(), key.to_string())).cloned())
	}

	fn write(&self, namespace: &str, key: &str, buf: &[u8]) -> Result<(), io::Error> {
		let mut entries = self.entries.lock().unwrap();
		entries.insert((namespace.to_string(), key.to_string()), buf.to_vec());
		Ok(())
	}

	fn remove(&self, namespace: &str, key: &str) -> Result<(), io::Error> {
		let mut entries = self.entries.lock().unwrap();
		entries.remove(&(namespace.to_string(), key.to_string()));
		Ok(())
	}

	fn list(&self, namespace: &str) -> Result<Vec<String>, io::Error> {
		let entries = self.entries.lock().unwrap();
		Ok(entries.keys().filter(|(ns, _)| ns == namespace).map(|(_, k)| k.clone()).collect())
	}
}

fn decode_err(_: crate::ln::msgs::DecodeError) -> io::Error {
	io::Error::new(io::ErrorKind::InvalidData, "corrupt persisted blob")
}

/// Wraps a [`KVStore`] with the node's key scheme.
///
/// All blobs are opaque to the store; encoding goes through [`Writeable`]/[`Readable`].
pub struct NodeDb {
	store: Arc<dyn KVStore>,
}

impl NodeDb {
	/// Constructs a new `NodeDb` over the given backing store.
	pub fn new(store: Arc<dyn KVStore>) -> Self {
		Self { store }
	}

	/// Persists the identity-to-host directory.
	pub fn put_node_directory(&self, dir: &HashMap<NodeId, String>) -> Result<(), io::Error> {
		self.store.write(NETWORK_NAMESPACE, DIRECTORY_KEY, &dir.encode())
	}

	/// Fetches the identity-to-host directory, or an empty one if none was persisted.
	pub fn fetch_node_directory(&self) -> Result<HashMap<NodeId, String>, io::Error> {
		match self.store.read(NETWORK_NAMESPACE, DIRECTORY_KEY)? {
			Some(buf) => Readable::read(&mut Cursor::new(buf)).map_err(decode_err),
			None => Ok(HashMap::new()),
		}
	}

	/// Deletes the persisted identity-to-host directory.
	pub fn delete_node_directory(&self) -> Result<(), io::Error> {
		self.store.remove(NETWORK_NAMESPACE, DIRECTORY_KEY)
	}

	/// Persists the routing table.
	pub fn put_routing_table(&self, graph: &NetworkGraph) -> Result<(), io::Error> {
		self.store.write(ROUTING_NAMESPACE, ROUTING_TABLE_KEY, &graph.encode())
	}

	/// Fetches the routing table, or `None` if none was persisted.
	pub fn fetch_routing_table(&self) -> Result<Option<NetworkGraph>, io::Error> {
		match self.store.read(ROUTING_NAMESPACE, ROUTING_TABLE_KEY)? {
			Some(buf) => Readable::read(&mut Cursor::new(buf)).map(Some).map_err(decode_err),
			None => Ok(None),
		}
	}

	/// Persists an in-flight funding workflow snapshot.
	pub fn put_funding_state(&self, snapshot: &FundingSnapshot) -> Result<(), io::Error> {
		self.store.write(FUNDING_NAMESPACE, &snapshot.channel_id.to_string(), &snapshot.encode())
	}

	/// Removes the snapshot for a funding workflow that reached a terminal state.
	pub fn remove_funding_state(&self, channel_id: &ChannelId) -> Result<(), io::Error> {
		self.store.remove(FUNDING_NAMESPACE, &channel_id.to_string())
	}

	/// Fetches every persisted in-flight funding workflow snapshot.
	pub fn fetch_funding_states(&self) -> Result<Vec<FundingSnapshot>, io::Error> {
		let mut snapshots = Vec::new();
		for key in self.store.list(FUNDING_NAMESPACE)? {
			if let Some(buf) = self.store.read(FUNDING_NAMESPACE, &key)? {
				snapshots.push(Readable::read(&mut Cursor::new(buf)).map_err(decode_err)?);
			}
		}
		Ok(snapshots)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn check_store(store: &dyn KVStore) {
		assert_eq!(store.read("ns", "missing").unwrap(), None);
		store.write("ns", "a", b"hello").unwrap();
		store.write("ns", "a", b"world").unwrap();
		assert_eq!(store.read("ns", "a").unwrap().unwrap(), b"world");
		store.write("ns", "b", b"x").unwrap();
		let mut keys = store.list("ns").unwrap();
		keys.sort();
		assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
		store.remove("ns", "a").unwrap();
		store.remove("ns", "a").unwrap();
		assert_eq!(store.read("ns", "a").unwrap(), None);
	}

	#[test]
	fn memory_store_contract() {
		check_store(&MemoryStore::new());
	}

	#[test]
	fn filesystem_store_contract() {
		let mut dir = std::env::temp_dir();
		dir.push(format!("arclight_fs_store_{}", std::process::id()));
		let store = FilesystemStore::new(dir.clone());
		check_store(&store);
		let _ = std::fs::remove_dir_all(dir);
	}

	#[test]
	fn directory_round_trip() {
		let db = NodeDb::new(Arc::new(MemoryStore::new()));
		let mut dir = HashMap::new();
		dir.insert(NodeId([3; 32]), "127.0.0.1:9735".to_string());
		db.put_node_directory(&dir).unwrap();
		assert_eq!(db.fetch_node_directory().unwrap(), dir);
		db.delete_node_directory().unwrap();
		assert!(db.fetch_node_directory().unwrap().is_empty());
	}
}
