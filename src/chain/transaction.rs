// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Types describing on-chain transaction outpoints.

use std::fmt;
use std::io::{Read, Write};

use bitcoin::Txid;

use crate::ln::msgs::DecodeError;
use crate::util::ser::{Readable, Writeable};

/// A reference to a transaction output. A channel's funding output, the "channel point",
/// identifies the channel for its entire lifetime.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct OutPoint {
	/// The referenced transaction's txid.
	pub txid: Txid,
	/// The index of the referenced output in its transaction's output list.
	pub index: u16,
}

impl fmt::Display for OutPoint {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}:{}", self.txid, self.index)
	}
}

impl Writeable for OutPoint {
	fn write<W: Write>(&self, w: &mut W) -> Result<(), std::io::Error> {
		self.txid.write(w)?;
		self.index.write(w)
	}
}
impl Readable for OutPoint {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(OutPoint { txid: Readable::read(r)?, index: Readable::read(r)? })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bitcoin::hashes::Hash;

	#[test]
	fn outpoint_round_trip() {
		let op = OutPoint { txid: Txid::from_byte_array([7; 32]), index: 3 };
		let encoded = op.encode();
		let decoded: OutPoint = Readable::read(&mut std::io::Cursor::new(encoded)).unwrap();
		assert_eq!(op, decoded);
	}
}
