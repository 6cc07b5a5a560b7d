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

//! Reward split calculators. All of them are pure integer math over share
//! counts so the accounting engine can be driven from events and the splits
//! can be tested with literal values.

use std::collections::BTreeMap;

/// The pool's cut of an amount at a fee expressed in percent.
pub fn pool_fee(amount: u64, fee_percent: f64) -> u64 {
	(amount as f64 * fee_percent / 100.0) as u64
}

/// Split `reward` minus the fee across miners proportionally to their counts.
/// Used directly for PROP (in-round counts) and PPLNS (window counts).
pub fn proportional_split(
	counts: &BTreeMap<u64, u64>,
	reward: u64,
	fee_percent: f64,
) -> BTreeMap<u64, u64> {
	let mut payouts = BTreeMap::new();
	let total: u64 = counts.values().sum();
	if total == 0 {
		return payouts;
	}
	let distributable = reward - pool_fee(reward, fee_percent);
	for (miner_id, count) in counts {
		let amount = (distributable as u128 * *count as u128 / total as u128) as u64;
		if amount > 0 {
			payouts.insert(*miner_id, amount);
		}
	}
	payouts
}

/// PPS: the expected value of one share, credited immediately on acceptance.
/// `expected_shares` is the number of shares of the credited difficulty a
/// block statistically costs: network difficulty over share difficulty.
pub fn pps_share_credit(
	reward: u64,
	fee_percent: f64,
	network_difficulty: u64,
	share_difficulty: u64,
) -> u64 {
	if share_difficulty == 0 {
		return 0;
	}
	let expected_shares = (network_difficulty / share_difficulty).max(1);
	(reward - pool_fee(reward, fee_percent)) / expected_shares
}

/// SOLO: the finder takes the whole reward minus the fee.
pub fn solo_credit(reward: u64, fee_percent: f64) -> u64 {
	reward - pool_fee(reward, fee_percent)
}
