// Copyright 2025 The Orepool Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Double SHA-256 hashing and the 32-byte hash type used for block, tx and
//! share identities. Bytes are stored in internal (little-endian) order;
//! the conventional hex rendering reverses them.

use crate::util::{from_hex, to_hex_reversed, ToHex};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// A hash consisting of all zeroes, used as a sentinel. No known hash inputs
/// produce it.
pub const ZERO_HASH: Hash = Hash([0; 32]);

/// A 32-byte sha256d hash, stored in internal byte order.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash(pub [u8; 32]);

impl Hash {
	/// The raw bytes in internal order.
	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.0
	}

	/// Build a hash from exactly 32 bytes in internal order.
	pub fn from_bytes(bytes: &[u8]) -> Option<Hash> {
		if bytes.len() != 32 {
			return None;
		}
		let mut h = [0u8; 32];
		h.copy_from_slice(bytes);
		Some(Hash(h))
	}

	/// Parse the conventional reversed-hex rendering back into a hash.
	pub fn from_hex(hex: &str) -> Result<Hash, String> {
		let mut bytes = from_hex(hex)?;
		if bytes.len() != 32 {
			return Err(hex.to_string());
		}
		bytes.reverse();
		let mut h = [0u8; 32];
		h.copy_from_slice(&bytes);
		Ok(Hash(h))
	}

	/// Hex rendering of the internal byte order, as carried in wire fields
	/// that do not reverse (merkle branches).
	pub fn to_internal_hex(&self) -> String {
		self.0.to_hex()
	}
}

impl fmt::Display for Hash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", to_hex_reversed(&self.0))
	}
}

impl fmt::Debug for Hash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", to_hex_reversed(&self.0))
	}
}

impl Serialize for Hash {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&self.to_string())
	}
}

impl<'de> Deserialize<'de> for Hash {
	fn deserialize<D>(deserializer: D) -> Result<Hash, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Hash::from_hex(&s).map_err(|e| de::Error::custom(format!("invalid hash hex {}", e)))
	}
}

/// Double SHA-256 of arbitrary bytes.
pub fn sha256d(data: &[u8]) -> Hash {
	let first = Sha256::digest(data);
	let second = Sha256::digest(&first);
	let mut out = [0u8; 32];
	out.copy_from_slice(&second);
	Hash(out)
}

/// Double SHA-256 of the concatenation of two hashes, one merkle tree step.
pub fn sha256d_pair(left: &Hash, right: &Hash) -> Hash {
	let mut buf = [0u8; 64];
	buf[..32].copy_from_slice(left.as_bytes());
	buf[32..].copy_from_slice(right.as_bytes());
	sha256d(&buf)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn sha256d_known_vectors() {
		// sha256(sha256(""))
		assert_eq!(
			sha256d(b"").to_internal_hex(),
			"5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
		);
		// sha256(sha256("abc"))
		assert_eq!(
			sha256d(b"abc").to_internal_hex(),
			"4f8b42c22dd3729b519ba6f68d2da7cc5b2d606d05daed5ad5128cc03e6c6358"
		);
	}

	#[test]
	fn display_reverses_bytes() {
		let mut bytes = [0u8; 32];
		bytes[0] = 0xab;
		let h = Hash(bytes);
		assert!(h.to_string().ends_with("ab"));
		assert!(h.to_internal_hex().starts_with("ab"));
	}

	#[test]
	fn hex_round_trip() {
		let h = sha256d(b"round trip");
		let parsed = Hash::from_hex(&h.to_string()).unwrap();
		assert_eq!(h, parsed);
	}
}
