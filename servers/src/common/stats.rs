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

//! Server stat collection types, to be used by tests, logging or a
//! dashboard front end to observe pool state. Everything here is a plain
//! snapshot assembled on demand; nothing holds locks.

use chrono::{DateTime, Utc};

/// One share of the credited difficulty represents this many hashes on
/// average.
const HASHES_PER_DIFFICULTY: f64 = 4_294_967_296.0;

/// Struct to return relevant information about a stratum worker
#[derive(Clone, Serialize, Debug)]
pub struct WorkerStats {
	/// Unique ID for this worker
	pub id: u64,
	/// Miner account the worker credits
	pub miner_id: u64,
	/// Worker name from authorize
	pub name: String,
	/// whether the stratum worker is currently connected
	pub is_connected: bool,
	/// Timestamp of most recent communication with this worker
	pub last_seen: DateTime<Utc>,
	/// pool difficulty this worker is mining at
	pub pool_difficulty: u64,
	/// number of valid shares submitted
	pub num_accepted: u64,
	/// number of invalid shares submitted
	pub num_rejected: u64,
	/// number of shares submitted too late
	pub num_stale: u64,
	/// number of valid blocks found
	pub num_blocks_found: u64,
	/// estimated hash rate over the recent share window
	pub hashrate: f64,
}

/// Struct to return relevant information about the stratum server
#[derive(Clone, Serialize, Debug)]
pub struct StratumStats {
	/// whether the stratum server is running
	pub is_running: bool,
	/// Number of connected sessions
	pub num_sessions: usize,
	/// Number of authorized workers
	pub num_workers: usize,
	/// what block height we're mining at
	pub block_height: u64,
	/// current network difficulty we're working on
	pub network_difficulty: u64,
	/// Individual worker status
	pub worker_stats: Vec<WorkerStats>,
}

/// Pool-wide statistics, the dashboard's main view.
#[derive(Clone, Serialize, Debug)]
pub struct PoolStatistics {
	/// Height the pool is mining at.
	pub network_height: u64,
	/// Network difficulty of the current job.
	pub network_difficulty: u64,
	/// Registered miner accounts.
	pub total_miners: usize,
	/// Miners seen recently.
	pub active_miners: usize,
	/// Connected workers.
	pub active_workers: usize,
	/// Live sessions, subscribed or not.
	pub total_connections: usize,
	/// Estimated pool hash rate, hashes per second.
	pub pool_hashrate: f64,
	/// Accepted shares in the open round.
	pub shares_this_round: u64,
	/// All shares ever recorded.
	pub total_shares: u64,
	/// Blocks the chain accepted from us.
	pub blocks_found: u64,
	/// Block candidates awaiting a verdict.
	pub blocks_pending: u64,
	/// Block candidates the chain refused.
	pub blocks_orphaned: u64,
	/// Total settled to miners through confirmed payments.
	pub total_paid: u64,
	/// Credit still owed to miners.
	pub total_unpaid: u64,
	/// Share of valid shares among all recorded.
	pub efficiency: f64,
	/// Hours since the server started.
	pub uptime_hours: f64,
}

/// Estimated hash rate from the credited difficulty accumulated over a
/// trailing window.
pub fn hashrate(total_difficulty: u64, window_secs: u64) -> f64 {
	if window_secs == 0 {
		return 0.0;
	}
	total_difficulty as f64 * HASHES_PER_DIFFICULTY / window_secs as f64
}

/// Share validity ratio out of all recorded shares.
pub fn efficiency(accepted: u64, total: u64) -> f64 {
	if total == 0 {
		return 0.0;
	}
	accepted as f64 / total as f64
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hashrate_formula() {
		// 600 difficulty over 600 seconds is one difficulty per second
		assert_eq!(hashrate(600, 600), HASHES_PER_DIFFICULTY);
		assert_eq!(hashrate(100, 0), 0.0);
	}

	#[test]
	fn efficiency_bounds() {
		assert_eq!(efficiency(0, 0), 0.0);
		assert_eq!(efficiency(9, 10), 0.9);
		assert_eq!(efficiency(10, 10), 1.0);
	}
}
