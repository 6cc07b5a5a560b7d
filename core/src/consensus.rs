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

//! All the constants the pool needs to agree on with the chain it mines
//! for. Placing all of them in one place makes a consensus-breaking typo
//! easy to spot in review.

/// A coin is 100_000_000 base units, all amounts are carried in base units.
pub const COIN: u64 = 100_000_000;

/// Base block reward before any halvings are applied.
pub const BASE_REWARD: u64 = 50 * COIN;

/// Number of blocks between reward halvings.
pub const HALVING_INTERVAL: u64 = 210_000;

/// The difficulty-1 share target, the pool's accounting unit. A share of
/// difficulty `d` must hash below this target divided by `d`.
pub const DIFF1_TARGET: [u8; 32] = [
	0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
	0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
	0x00, 0x00,
];

/// How far ahead of our wall clock a submitted ntime may sit (seconds).
pub const MAX_NTIME_DRIFT: u32 = 2 * 60 * 60;

/// Compute the coinbase reward at a given height.
pub fn block_reward(height: u64) -> u64 {
	let halvings = height / HALVING_INTERVAL;
	if halvings >= 64 {
		return 0;
	}
	BASE_REWARD >> halvings
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn reward_schedule() {
		assert_eq!(block_reward(0), 50 * COIN);
		assert_eq!(block_reward(HALVING_INTERVAL - 1), 50 * COIN);
		assert_eq!(block_reward(HALVING_INTERVAL), 25 * COIN);
		assert_eq!(block_reward(2 * HALVING_INTERVAL), 1_250_000_000);
		assert_eq!(block_reward(64 * HALVING_INTERVAL), 0);
	}
}
