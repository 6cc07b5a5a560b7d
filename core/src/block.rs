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

//! Block headers, merkle trees and full block serialization. The header is
//! the 80-byte structure miners actually grind on; the merkle branch lets a
//! coinbase be folded up to the root without the full transaction set.

use crate::hash::{sha256d, sha256d_pair, Hash};

/// The 80-byte block header. All integer fields serialize little-endian,
/// hashes serialize in internal byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
	/// Header version.
	pub version: u32,
	/// Hash of the previous block.
	pub prev_hash: Hash,
	/// Merkle root over all transactions, coinbase first.
	pub merkle_root: Hash,
	/// Unix timestamp the miner stamped.
	pub timestamp: u32,
	/// Compact encoding of the network target.
	pub bits: u32,
	/// The nonce the miner found.
	pub nonce: u32,
}

impl BlockHeader {
	/// Serialize to the canonical 80 bytes.
	pub fn serialize(&self) -> [u8; 80] {
		let mut buf = [0u8; 80];
		buf[0..4].copy_from_slice(&self.version.to_le_bytes());
		buf[4..36].copy_from_slice(self.prev_hash.as_bytes());
		buf[36..68].copy_from_slice(self.merkle_root.as_bytes());
		buf[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
		buf[72..76].copy_from_slice(&self.bits.to_le_bytes());
		buf[76..80].copy_from_slice(&self.nonce.to_le_bytes());
		buf
	}

	/// The proof-of-work hash of this header.
	pub fn hash(&self) -> Hash {
		sha256d(&self.serialize())
	}
}

/// Compute the merkle branch for the coinbase (index zero) given the txids
/// of every other transaction, in block order. Folding the coinbase txid
/// through this branch reproduces the merkle root.
pub fn merkle_branch(tx_hashes: &[Hash]) -> Vec<Hash> {
	let mut branch = Vec::new();
	// the coinbase slot is unknown at this point, carry it as None
	let mut level: Vec<Option<Hash>> = std::iter::once(None)
		.chain(tx_hashes.iter().copied().map(Some))
		.collect();
	while level.len() > 1 {
		if level.len() % 2 == 1 {
			let last = level[level.len() - 1];
			level.push(last);
		}
		branch.push(level[1].expect("coinbase sibling is always concrete"));
		let mut next: Vec<Option<Hash>> = vec![None];
		for pair in level[2..].chunks(2) {
			let left = pair[0].expect("non-coinbase nodes are concrete");
			let right = pair[1].expect("non-coinbase nodes are concrete");
			next.push(Some(sha256d_pair(&left, &right)));
		}
		level = next;
	}
	branch
}

/// Fold a coinbase txid through a merkle branch up to the root.
pub fn merkle_root(coinbase_hash: Hash, branch: &[Hash]) -> Hash {
	branch
		.iter()
		.fold(coinbase_hash, |acc, sibling| sha256d_pair(&acc, sibling))
}

/// Serialize a full block: header, varint tx count, coinbase, then the
/// remaining raw transactions in template order.
pub fn serialize_block(header: &BlockHeader, coinbase: &[u8], transactions: &[Vec<u8>]) -> Vec<u8> {
	let mut block = Vec::with_capacity(
		80 + 9 + coinbase.len() + transactions.iter().map(|tx| tx.len()).sum::<usize>(),
	);
	block.extend_from_slice(&header.serialize());
	write_varint(&mut block, (transactions.len() + 1) as u64);
	block.extend_from_slice(coinbase);
	for tx in transactions {
		block.extend_from_slice(tx);
	}
	block
}

/// Bitcoin-style variable length integer.
pub fn write_varint(buf: &mut Vec<u8>, value: u64) {
	if value < 0xfd {
		buf.push(value as u8);
	} else if value <= 0xffff {
		buf.push(0xfd);
		buf.extend_from_slice(&(value as u16).to_le_bytes());
	} else if value <= 0xffff_ffff {
		buf.push(0xfe);
		buf.extend_from_slice(&(value as u32).to_le_bytes());
	} else {
		buf.push(0xff);
		buf.extend_from_slice(&value.to_le_bytes());
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn h(n: u8) -> Hash {
		sha256d(&[n])
	}

	#[test]
	fn header_serializes_to_80_bytes() {
		let header = BlockHeader {
			version: 0x20000000,
			prev_hash: h(1),
			merkle_root: h(2),
			timestamp: 1_700_000_000,
			bits: 0x1d00ffff,
			nonce: 0xdeadbeef,
		};
		let bytes = header.serialize();
		assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x00, 0x20]);
		assert_eq!(&bytes[4..36], h(1).as_bytes());
		assert_eq!(&bytes[72..76], &[0xff, 0xff, 0x00, 0x1d]);
		assert_eq!(&bytes[76..80], &[0xef, 0xbe, 0xad, 0xde]);
	}

	#[test]
	fn branch_of_lone_coinbase_is_empty() {
		assert!(merkle_branch(&[]).is_empty());
		assert_eq!(merkle_root(h(0), &[]), h(0));
	}

	#[test]
	fn branch_folds_to_direct_root() {
		// three transactions beyond the coinbase, odd level gets duplicated
		let coinbase = h(0);
		let txs = [h(1), h(2), h(3)];
		let branch = merkle_branch(&txs);
		assert_eq!(branch.len(), 2);
		assert_eq!(branch[0], h(1));

		// compute the root directly over [cb, t1, t2, t3]
		let l0 = sha256d_pair(&coinbase, &h(1));
		let l1 = sha256d_pair(&h(2), &h(3));
		let direct = sha256d_pair(&l0, &l1);
		assert_eq!(merkle_root(coinbase, &branch), direct);
	}

	#[test]
	fn branch_duplicates_odd_tail() {
		// [cb, t1, t2] pads the first level with t2 again
		let coinbase = h(0);
		let txs = [h(1), h(2)];
		let branch = merkle_branch(&txs);
		let l0 = sha256d_pair(&coinbase, &h(1));
		let l1 = sha256d_pair(&h(2), &h(2));
		let direct = sha256d_pair(&l0, &l1);
		assert_eq!(merkle_root(coinbase, &branch), direct);
	}

	#[test]
	fn varint_widths() {
		let mut buf = Vec::new();
		write_varint(&mut buf, 0xfc);
		assert_eq!(buf, vec![0xfc]);
		buf.clear();
		write_varint(&mut buf, 0xfd);
		assert_eq!(buf, vec![0xfd, 0xfd, 0x00]);
		buf.clear();
		write_varint(&mut buf, 0x1_0000);
		assert_eq!(buf, vec![0xfe, 0x00, 0x00, 0x01, 0x00]);
	}

	#[test]
	fn block_serialization_layout() {
		let header = BlockHeader {
			version: 1,
			prev_hash: h(1),
			merkle_root: h(2),
			timestamp: 0,
			bits: 0x207fffff,
			nonce: 0,
		};
		let coinbase = vec![0xaa; 10];
		let txs = vec![vec![0xbb; 5], vec![0xcc; 7]];
		let block = serialize_block(&header, &coinbase, &txs);
		assert_eq!(block.len(), 80 + 1 + 10 + 5 + 7);
		assert_eq!(block[80], 3); // tx count
		assert_eq!(&block[81..91], &coinbase[..]);
	}
}
