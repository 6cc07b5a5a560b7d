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

//! Proof-of-work targets and difficulties. Targets are 256-bit thresholds a
//! hash must not exceed; difficulty expresses the same thing as a multiple
//! of the difficulty-1 base target. All conversions use exact 256-bit
//! arithmetic so a share is never credited above what its hash is worth.

use crate::consensus::DIFF1_TARGET;
use crate::hash::Hash;
use primitive_types::U256;
use std::cmp::max;
use std::fmt;
use std::ops::{Add, Div, Mul, Sub};

/// Errors from decoding untrusted target encodings.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
	/// Compact bits decode to a negative number.
	NegativeTarget,
	/// Compact bits overflow 256 bits.
	TargetOverflow,
	/// Compact bits decode to zero.
	ZeroTarget,
}

/// The difficulty is defined as the difficulty-1 target divided by the
/// target actually met, never below one.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Eq, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Difficulty {
	num: u64,
}

impl Difficulty {
	/// Difficulty of one, the minimum (hash exactly on the base target).
	pub fn one() -> Difficulty {
		Difficulty { num: 1 }
	}

	/// Convert a `u64` into a `Difficulty`, clamping to the minimum of one.
	pub fn from_num(num: u64) -> Difficulty {
		Difficulty { num: max(num, 1) }
	}

	/// Computes the difficulty a hash is worth: the difficulty-1 target
	/// divided by the hash interpreted as a 256-bit little-endian integer,
	/// truncated. Exact division, not a leading-zero approximation.
	pub fn from_hash(hash: &Hash) -> Difficulty {
		let hash_num = U256::from_little_endian(hash.as_bytes());
		if hash_num.is_zero() {
			return Difficulty { num: u64::MAX };
		}
		let quotient = diff1() / hash_num;
		if quotient.bits() > 64 {
			Difficulty { num: u64::MAX }
		} else {
			Difficulty::from_num(quotient.low_u64())
		}
	}

	/// Converts the difficulty into a bare `u64`.
	pub fn to_num(self) -> u64 {
		self.num
	}
}

impl fmt::Display for Difficulty {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.num)
	}
}

impl Add<Difficulty> for Difficulty {
	type Output = Difficulty;
	fn add(self, other: Difficulty) -> Difficulty {
		Difficulty {
			num: self.num.saturating_add(other.num),
		}
	}
}

impl Sub<Difficulty> for Difficulty {
	type Output = Difficulty;
	fn sub(self, other: Difficulty) -> Difficulty {
		Difficulty {
			num: self.num.saturating_sub(other.num),
		}
	}
}

impl Mul<u64> for Difficulty {
	type Output = Difficulty;
	fn mul(self, other: u64) -> Difficulty {
		Difficulty::from_num(self.num.saturating_mul(other))
	}
}

impl Div<u64> for Difficulty {
	type Output = Difficulty;
	fn div(self, other: u64) -> Difficulty {
		Difficulty::from_num(self.num / max(other, 1))
	}
}

fn diff1() -> U256 {
	U256::from_big_endian(&DIFF1_TARGET)
}

/// A 256-bit proof-of-work threshold. A hash meets the target when, read as
/// a little-endian integer, it is less than or equal to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Target(U256);

impl Target {
	/// The difficulty-1 base target.
	pub fn diff1() -> Target {
		Target(diff1())
	}

	/// The share target corresponding to a pool difficulty.
	pub fn from_difficulty(difficulty: Difficulty) -> Target {
		Target(diff1() / U256::from(difficulty.to_num()))
	}

	/// Decode a compact "nBits" field into a target. The compact format is
	/// a base-256 exponent/mantissa pair with a sign bit that is never
	/// valid for a target.
	pub fn from_compact(bits: u32) -> Result<Target, Error> {
		let exponent = (bits >> 24) as usize;
		let mantissa = bits & 0x007f_ffff;
		if mantissa == 0 {
			return Err(Error::ZeroTarget);
		}
		if bits & 0x0080_0000 != 0 {
			return Err(Error::NegativeTarget);
		}
		let value = if exponent <= 3 {
			U256::from(mantissa >> (8 * (3 - exponent)))
		} else {
			if exponent > 32 + 3 {
				return Err(Error::TargetOverflow);
			}
			let shifted = U256::from(mantissa) << (8 * (exponent - 3));
			// shifting back must reproduce the mantissa or bits fell off the top
			if (shifted >> (8 * (exponent - 3))) != U256::from(mantissa) {
				return Err(Error::TargetOverflow);
			}
			shifted
		};
		if value.is_zero() {
			return Err(Error::ZeroTarget);
		}
		Ok(Target(value))
	}

	/// Encode the target back into compact "nBits" form.
	pub fn to_compact(&self) -> u32 {
		let mut size = (self.0.bits() + 7) / 8;
		let mut compact = if size <= 3 {
			self.0.low_u64() << (8 * (3 - size))
		} else {
			(self.0 >> (8 * (size - 3))).low_u64()
		};
		// The mantissa sign bit must stay clear, bump the exponent instead.
		if compact & 0x0080_0000 != 0 {
			compact >>= 8;
			size += 1;
		}
		(compact as u32) | ((size as u32) << 24)
	}

	/// Whether a hash, read little-endian, meets this target.
	pub fn is_met_by(&self, hash: &Hash) -> bool {
		U256::from_little_endian(hash.as_bytes()) <= self.0
	}

	/// The difficulty equivalent of this target relative to the base target.
	pub fn to_difficulty(&self) -> Difficulty {
		if self.0.is_zero() {
			return Difficulty::from_num(u64::MAX);
		}
		let quotient = diff1() / self.0;
		if quotient.bits() > 64 {
			Difficulty::from_num(u64::MAX)
		} else {
			Difficulty::from_num(quotient.low_u64())
		}
	}

	/// Hex rendering of the big-endian threshold, zero padded to 32 bytes.
	pub fn to_hex(&self) -> String {
		let mut bytes = [0u8; 32];
		self.0.to_big_endian(&mut bytes);
		use crate::util::ToHex;
		bytes.to_hex()
	}
}

impl fmt::Display for Target {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_hex())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn hash_with_be_bytes(bytes: &[u8; 32]) -> Hash {
		let mut le = *bytes;
		le.reverse();
		Hash(le)
	}

	#[test]
	fn compact_decodes_diff1() {
		// the classic network difficulty-1 bits
		let t = Target::from_compact(0x1d00ffff).unwrap();
		assert_eq!(t, Target::diff1());
		assert_eq!(t.to_difficulty(), Difficulty::one());
	}

	#[test]
	fn compact_round_trip() {
		for bits in [0x1d00ffffu32, 0x1b0404cb, 0x1a05db8b, 0x207fffff] {
			let t = Target::from_compact(bits).unwrap();
			assert_eq!(t.to_compact(), bits);
		}
	}

	#[test]
	fn compact_rejects_bad_encodings() {
		assert_eq!(Target::from_compact(0x1d000000), Err(Error::ZeroTarget));
		assert_eq!(Target::from_compact(0x1d800001), Err(Error::NegativeTarget));
		assert_eq!(Target::from_compact(0xff00ffff), Err(Error::TargetOverflow));
	}

	#[test]
	fn difficulty_of_diff1_boundary() {
		let h = hash_with_be_bytes(&crate::consensus::DIFF1_TARGET);
		// a hash exactly on the base target is worth exactly difficulty 1
		assert_eq!(Difficulty::from_hash(&h), Difficulty::one());
		assert!(Target::diff1().is_met_by(&h));
	}

	#[test]
	fn difficulty_scales_with_leading_zeroes() {
		// shift the diff1 boundary down 8 bits: worth 256 times more
		let mut be = [0u8; 32];
		be[5] = 0xff;
		be[6] = 0xff;
		let h = hash_with_be_bytes(&be);
		assert_eq!(Difficulty::from_hash(&h).to_num(), 256);
	}

	#[test]
	fn zero_hash_is_max_difficulty() {
		assert_eq!(
			Difficulty::from_hash(&crate::hash::ZERO_HASH).to_num(),
			u64::MAX
		);
	}

	#[test]
	fn share_target_for_difficulty() {
		let t = Target::from_difficulty(Difficulty::from_num(1024));
		// meeting the scaled target is worth at least the asked difficulty
		let mut be = [0u8; 32];
		t.0.to_big_endian(&mut be);
		let boundary = hash_with_be_bytes(&be);
		assert!(t.is_met_by(&boundary));
		assert!(Difficulty::from_hash(&boundary).to_num() >= 1024);
	}

	#[test]
	fn exact_share_boundary_is_accepted() {
		// a share exactly matching the credited difficulty passes
		let t = Target::from_difficulty(Difficulty::from_num(1500));
		let mut be = [0u8; 32];
		t.0.to_big_endian(&mut be);
		let h = hash_with_be_bytes(&be);
		assert!(Difficulty::from_hash(&h).to_num() >= 1500);
	}
}
