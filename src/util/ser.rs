// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! A very simple serialization framework which is used to serialize/deserialize wire messages as
//! well as the routing table, the node directory and persisted funding state.

use std::collections::HashMap;
use std::hash::Hash;
use std::io::{Read, Write};

use bitcoin::hashes::Hash as _;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::PublicKey;
use bitcoin::Txid;

use crate::ln::msgs::DecodeError;

/// Cap on up-front allocations while reading length-prefixed collections, so a corrupt length
/// descriptor can't OOM us.
const MAX_BUF_SIZE: usize = 64 * 1024;

/// A simple writer which writes a serialized object to a `Vec<u8>`.
pub struct VecWriter(pub Vec<u8>);
impl Write for VecWriter {
	fn write(&mut self, buf: &[u8]) -> Result<usize, std::io::Error> {
		self.0.extend_from_slice(buf);
		Ok(buf.len())
	}
	fn flush(&mut self) -> Result<(), std::io::Error> {
		Ok(())
	}
}

/// A trait that various arclight types implement allowing them to be written out to a Writer.
pub trait Writeable {
	/// Writes self out to the given Writer.
	fn write<W: Write>(&self, writer: &mut W) -> Result<(), std::io::Error>;

	/// Writes self out to a `Vec<u8>`.
	fn encode(&self) -> Vec<u8> {
		let mut w = VecWriter(Vec::new());
		self.write(&mut w).expect("in-memory writes don't error");
		w.0
	}
}

/// A trait that various arclight types implement allowing them to be read in from a Reader.
pub trait Readable
where
	Self: Sized,
{
	/// Reads a Self in from the given Reader.
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError>;
}

macro_rules! impl_writeable_primitive {
	($val_type:ty, $len: expr) => {
		impl Writeable for $val_type {
			#[inline]
			fn write<W: Write>(&self, writer: &mut W) -> Result<(), std::io::Error> {
				writer.write_all(&self.to_be_bytes())
			}
		}
		impl Readable for $val_type {
			#[inline]
			fn read<R: Read>(reader: &mut R) -> Result<$val_type, DecodeError> {
				let mut buf = [0; $len];
				reader.read_exact(&mut buf)?;
				Ok(<$val_type>::from_be_bytes(buf))
			}
		}
	};
}

impl_writeable_primitive!(u64, 8);
impl_writeable_primitive!(u32, 4);
impl_writeable_primitive!(u16, 2);

impl Writeable for u8 {
	#[inline]
	fn write<W: Write>(&self, writer: &mut W) -> Result<(), std::io::Error> {
		writer.write_all(&[*self])
	}
}
impl Readable for u8 {
	#[inline]
	fn read<R: Read>(reader: &mut R) -> Result<u8, DecodeError> {
		let mut buf = [0; 1];
		reader.read_exact(&mut buf)?;
		Ok(buf[0])
	}
}

impl Writeable for bool {
	#[inline]
	fn write<W: Write>(&self, writer: &mut W) -> Result<(), std::io::Error> {
		writer.write_all(&[*self as u8])
	}
}
impl Readable for bool {
	#[inline]
	fn read<R: Read>(reader: &mut R) -> Result<bool, DecodeError> {
		let mut buf = [0; 1];
		reader.read_exact(&mut buf)?;
		if buf[0] != 0 && buf[0] != 1 {
			return Err(DecodeError::InvalidValue);
		}
		Ok(buf[0] == 1)
	}
}

macro_rules! impl_array {
	($size:expr) => {
		impl Writeable for [u8; $size] {
			#[inline]
			fn write<W: Write>(&self, w: &mut W) -> Result<(), std::io::Error> {
				w.write_all(self)
			}
		}
		impl Readable for [u8; $size] {
			#[inline]
			fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
				let mut buf = [0u8; $size];
				r.read_exact(&mut buf)?;
				Ok(buf)
			}
		}
	};
}

impl_array!(32); // for node ids, payment hashes and preimages
impl_array!(33); // for serialized public keys
impl_array!(64); // for compact signatures

// Vectors are length-prefixed with a u32 element count.
impl<T: Writeable> Writeable for Vec<T> {
	#[inline]
	fn write<W: Write>(&self, w: &mut W) -> Result<(), std::io::Error> {
		(self.len() as u32).write(w)?;
		for e in self.iter() {
			e.write(w)?;
		}
		Ok(())
	}
}
impl<T: Readable> Readable for Vec<T> {
	#[inline]
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let len: u32 = Readable::read(r)?;
		let mut ret = Vec::with_capacity(std::cmp::min(len as usize, MAX_BUF_SIZE));
		for _ in 0..len {
			ret.push(T::read(r)?);
		}
		Ok(ret)
	}
}

impl<K, V> Writeable for HashMap<K, V>
where
	K: Writeable + Eq + Hash,
	V: Writeable,
{
	#[inline]
	fn write<W: Write>(&self, w: &mut W) -> Result<(), std::io::Error> {
		(self.len() as u32).write(w)?;
		for (key, value) in self.iter() {
			key.write(w)?;
			value.write(w)?;
		}
		Ok(())
	}
}
impl<K, V> Readable for HashMap<K, V>
where
	K: Readable + Eq + Hash,
	V: Readable,
{
	#[inline]
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let len: u32 = Readable::read(r)?;
		let mut ret = HashMap::with_capacity(std::cmp::min(len as usize, MAX_BUF_SIZE));
		for _ in 0..len {
			ret.insert(K::read(r)?, V::read(r)?);
		}
		Ok(ret)
	}
}

impl Writeable for String {
	#[inline]
	fn write<W: Write>(&self, w: &mut W) -> Result<(), std::io::Error> {
		let len = u16::try_from(self.len()).map_err(|_| {
			std::io::Error::new(std::io::ErrorKind::InvalidData, "string exceeds u16 length prefix")
		})?;
		len.write(w)?;
		w.write_all(self.as_bytes())
	}
}
impl Readable for String {
	#[inline]
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let len: u16 = Readable::read(r)?;
		let mut buf = vec![0; len as usize];
		r.read_exact(&mut buf)?;
		String::from_utf8(buf).map_err(|_| DecodeError::InvalidValue)
	}
}

impl<T: Writeable> Writeable for Option<T> {
	fn write<W: Write>(&self, w: &mut W) -> Result<(), std::io::Error> {
		match self {
			None => 0u8.write(w),
			Some(ref data) => {
				1u8.write(w)?;
				data.write(w)
			},
		}
	}
}
impl<T: Readable> Readable for Option<T> {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		match <u8 as Readable>::read(r)? {
			0 => Ok(None),
			1 => Ok(Some(Readable::read(r)?)),
			_ => Err(DecodeError::InvalidValue),
		}
	}
}

impl Writeable for PublicKey {
	fn write<W: Write>(&self, w: &mut W) -> Result<(), std::io::Error> {
		self.serialize().write(w)
	}
}
impl Readable for PublicKey {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let buf: [u8; 33] = Readable::read(r)?;
		PublicKey::from_slice(&buf).map_err(|_| DecodeError::InvalidValue)
	}
}

impl Writeable for Signature {
	fn write<W: Write>(&self, w: &mut W) -> Result<(), std::io::Error> {
		self.serialize_compact().write(w)
	}
}
impl Readable for Signature {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let buf: [u8; 64] = Readable::read(r)?;
		Signature::from_compact(&buf).map_err(|_| DecodeError::InvalidValue)
	}
}

impl Writeable for Txid {
	fn write<W: Write>(&self, w: &mut W) -> Result<(), std::io::Error> {
		w.write_all(&self.to_byte_array())
	}
}
impl Readable for Txid {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let buf: [u8; 32] = Readable::read(r)?;
		Ok(Txid::from_byte_array(buf))
	}
}

macro_rules! impl_writeable {
	($st:ident, {$($field:ident),*}) => {
		impl $crate::util::ser::Writeable for $st {
			fn write<W: ::std::io::Write>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
				$( self.$field.write(w)?; )*
				Ok(())
			}
		}

		impl $crate::util::ser::Readable for $st {
			fn read<R: ::std::io::Read>(r: &mut R) -> Result<Self, $crate::ln::msgs::DecodeError> {
				Ok(Self {
					$($field: $crate::util::ser::Readable::read(r)?),*
				})
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::{Readable, Writeable};
	use std::collections::HashMap;
	use std::io::Cursor;

	#[test]
	fn primitives_round_trip() {
		let mut buf = Vec::new();
		0xdeadbeefu32.write(&mut buf).unwrap();
		0x0102u16.write(&mut buf).unwrap();
		true.write(&mut buf).unwrap();
		let mut r = Cursor::new(buf);
		assert_eq!(<u32 as Readable>::read(&mut r).unwrap(), 0xdeadbeef);
		assert_eq!(<u16 as Readable>::read(&mut r).unwrap(), 0x0102);
		assert!(<bool as Readable>::read(&mut r).unwrap());
	}

	#[test]
	fn collections_round_trip() {
		let v = vec![1u64, 2, 3];
		let mut map = HashMap::new();
		map.insert(7u32, "seven".to_string());
		let mut buf = Vec::new();
		v.write(&mut buf).unwrap();
		map.write(&mut buf).unwrap();
		let mut r = Cursor::new(buf);
		assert_eq!(<Vec<u64> as Readable>::read(&mut r).unwrap(), v);
		assert_eq!(<HashMap<u32, String> as Readable>::read(&mut r).unwrap(), map);
	}

	#[test]
	fn oversized_string_is_rejected_not_truncated() {
		let s = "x".repeat(u16::MAX as usize + 1);
		let mut buf = Vec::new();
		assert!(s.write(&mut buf).is_err());
		let fits = "x".repeat(u16::MAX as usize);
		let mut buf = Vec::new();
		fits.write(&mut buf).unwrap();
		assert_eq!(buf.len(), 2 + u16::MAX as usize);
	}

	#[test]
	fn short_read_errors() {
		let mut r = Cursor::new(vec![0u8; 3]);
		assert!(<u64 as Readable>::read(&mut r).is_err());
	}
}
