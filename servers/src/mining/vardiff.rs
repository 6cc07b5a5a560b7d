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

//! Per-worker variable difficulty. A closed loop over the worker's recent
//! share timestamps that keeps the mean share interval near the configured
//! target, stepping difficulty up by half and down by a quarter with a
//! hysteresis band so a steady worker is left alone.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Cap on the per-worker timestamp ring.
pub const RECENT_SHARE_CAP: usize = 100;

/// Minimum timestamps before any adjustment is considered.
pub const MIN_SAMPLES: usize = 3;

fn default_initial_difficulty() -> u64 {
	1024
}

fn default_min_difficulty() -> u64 {
	256
}

fn default_max_difficulty() -> u64 {
	4_294_967_296
}

fn default_target_share_time() -> f64 {
	15.0
}

fn default_retarget_time_secs() -> u64 {
	60
}

fn default_variance() -> f64 {
	0.3
}

/// Difficulty controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarDiffConfig {
	/// Difficulty a fresh worker starts at.
	#[serde(default = "default_initial_difficulty")]
	pub initial_difficulty: u64,

	/// Floor no worker is adjusted below.
	#[serde(default = "default_min_difficulty")]
	pub min_difficulty: u64,

	/// Ceiling no worker is adjusted above.
	#[serde(default = "default_max_difficulty")]
	pub max_difficulty: u64,

	/// Desired seconds between shares from one worker.
	#[serde(default = "default_target_share_time")]
	pub target_share_time: f64,

	/// Seconds between difficulty evaluations for a worker.
	#[serde(default = "default_retarget_time_secs")]
	pub retarget_time_secs: u64,

	/// Tolerated relative deviation from the target before stepping.
	#[serde(default = "default_variance")]
	pub variance: f64,
}

impl Default for VarDiffConfig {
	fn default() -> VarDiffConfig {
		VarDiffConfig {
			initial_difficulty: default_initial_difficulty(),
			min_difficulty: default_min_difficulty(),
			max_difficulty: default_max_difficulty(),
			target_share_time: default_target_share_time(),
			retarget_time_secs: default_retarget_time_secs(),
			variance: default_variance(),
		}
	}
}

impl VarDiffConfig {
	/// Initial difficulty clamped into the configured band.
	pub fn clamped_initial(&self) -> u64 {
		self.initial_difficulty
			.max(self.min_difficulty)
			.min(self.max_difficulty)
	}
}

/// Whether the controller should evaluate this worker now: enough samples
/// and either the retarget interval elapsed or the ring is full.
pub fn should_retarget(
	ring: &VecDeque<DateTime<Utc>>,
	last_retarget: DateTime<Utc>,
	now: DateTime<Utc>,
	config: &VarDiffConfig,
) -> bool {
	if ring.len() < MIN_SAMPLES {
		return false;
	}
	if ring.len() >= RECENT_SHARE_CAP {
		return true;
	}
	(now - last_retarget).num_seconds() >= config.retarget_time_secs as i64
}

/// Compute the next difficulty from the observed mean share interval.
/// Returns the current difficulty unchanged when the worker sits inside the
/// variance band.
pub fn next_difficulty(
	ring: &VecDeque<DateTime<Utc>>,
	current: u64,
	config: &VarDiffConfig,
) -> u64 {
	if ring.len() < MIN_SAMPLES {
		return current;
	}
	let first = match ring.front() {
		Some(t) => *t,
		None => return current,
	};
	let last = match ring.back() {
		Some(t) => *t,
		None => return current,
	};
	let span_ms = (last - first).num_milliseconds().max(0) as f64;
	let avg = span_ms / 1000.0 / (ring.len() - 1) as f64;
	let ratio = avg / config.target_share_time;

	let next = if ratio < 1.0 - config.variance {
		// shares arriving too fast, step up by half, rounded up
		(current as f64 * 1.5).ceil() as u64
	} else if ratio > 1.0 + config.variance {
		// shares arriving too slow, step down by a quarter, rounded down
		(current as f64 * 0.75).floor() as u64
	} else {
		current
	};

	next.max(config.min_difficulty).min(config.max_difficulty)
}

/// Whether a worker's shares have fallen so far below the floor that the
/// controller resets it outright instead of stepping.
pub fn needs_reset(share_difficulty: u64, config: &VarDiffConfig) -> bool {
	share_difficulty < config.min_difficulty / 4
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Duration;

	fn ring_with_interval(count: usize, secs: f64) -> VecDeque<DateTime<Utc>> {
		let start = Utc::now();
		(0..count)
			.map(|i| start + Duration::milliseconds((i as f64 * secs * 1000.0) as i64))
			.collect()
	}

	fn config() -> VarDiffConfig {
		VarDiffConfig::default()
	}

	#[test]
	fn steps_up_when_too_fast() {
		// 10 shares averaging 4s apart against a 15s target
		let ring = ring_with_interval(10, 4.0);
		assert_eq!(next_difficulty(&ring, 1024, &config()), 1536);
	}

	#[test]
	fn steps_down_when_too_slow() {
		// 10 shares averaging 30s apart against a 15s target
		let ring = ring_with_interval(10, 30.0);
		assert_eq!(next_difficulty(&ring, 1024, &config()), 768);
	}

	#[test]
	fn holds_inside_variance_band() {
		let ring = ring_with_interval(10, 15.0);
		assert_eq!(next_difficulty(&ring, 1024, &config()), 1024);
		// 30% band edges stay put as well
		let ring = ring_with_interval(10, 11.0);
		assert_eq!(next_difficulty(&ring, 1024, &config()), 1024);
		let ring = ring_with_interval(10, 19.0);
		assert_eq!(next_difficulty(&ring, 1024, &config()), 1024);
	}

	#[test]
	fn step_up_rounds_up() {
		let ring = ring_with_interval(10, 1.0);
		// 1025 * 1.5 = 1537.5, rounded up
		assert_eq!(next_difficulty(&ring, 1025, &config()), 1538);
	}

	#[test]
	fn clamps_at_floor_and_ceiling() {
		let mut cfg = config();
		cfg.min_difficulty = 512;
		cfg.max_difficulty = 2048;

		// at the floor a slow worker never decreases
		let slow = ring_with_interval(10, 120.0);
		assert_eq!(next_difficulty(&slow, 512, &cfg), 512);

		// at the ceiling a fast worker never increases
		let fast = ring_with_interval(10, 1.0);
		assert_eq!(next_difficulty(&fast, 2048, &cfg), 2048);
	}

	#[test]
	fn retarget_trigger_requires_samples() {
		let cfg = config();
		let now = Utc::now();
		let ring = ring_with_interval(2, 5.0);
		assert!(!should_retarget(&ring, now - Duration::hours(1), now, &cfg));

		let ring = ring_with_interval(3, 5.0);
		assert!(should_retarget(&ring, now - Duration::hours(1), now, &cfg));
		assert!(!should_retarget(&ring, now, now, &cfg));
	}

	#[test]
	fn full_ring_triggers_regardless_of_time() {
		let cfg = config();
		let now = Utc::now();
		let ring = ring_with_interval(RECENT_SHARE_CAP, 1.0);
		assert!(should_retarget(&ring, now, now, &cfg));
	}

	#[test]
	fn reset_threshold() {
		let mut cfg = config();
		cfg.min_difficulty = 1000;
		assert!(needs_reset(249, &cfg));
		assert!(!needs_reset(250, &cfg));
	}
}
