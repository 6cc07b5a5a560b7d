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

//! Server types: configuration, the crate error, and the events flowing
//! between the share pipeline and the accounting / chain submission tasks.

use crate::core::{pow, BlockHeader, Hash};
use chrono::{DateTime, Utc};
use std::convert::From;
use std::sync::Arc;

/// Default port the Stratum listener binds to.
const DEFAULT_STRATUM_ADDR: &str = "0.0.0.0:3333";

/// Default extranonce2 width in bytes.
const DEFAULT_EXTRANONCE2_SIZE: usize = 4;

/// Default cap on concurrent connections from one address.
const DEFAULT_MAX_CONNECTIONS_PER_IP: usize = 10;

/// Default idle timeout before a session is swept.
const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 300;

/// Default bound on a session's outbound message queue.
const DEFAULT_WRITE_QUEUE_DEPTH: usize = 256;

/// Error type wrapping underlying module errors.
#[derive(Debug)]
pub enum Error {
	/// Error originating from target / difficulty math.
	Pow(pow::Error),
	/// Error originating from the chain node upstream.
	Chain(String),
	/// Error originating from the wallet collaborator.
	Wallet(String),
	/// Error originating from socket setup.
	IO(std::io::Error),
	/// Error originating from TLS setup.
	Tls(String),
	/// Invalid configuration.
	Config(String),
	/// A block template the director cannot build a job from.
	Template(String),
}

impl From<pow::Error> for Error {
	fn from(e: pow::Error) -> Error {
		Error::Pow(e)
	}
}

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Error {
		Error::IO(e)
	}
}

impl From<crate::common::adapters::ChainError> for Error {
	fn from(e: crate::common::adapters::ChainError) -> Error {
		Error::Chain(e.0)
	}
}

impl From<crate::common::adapters::WalletError> for Error {
	fn from(e: crate::common::adapters::WalletError) -> Error {
		Error::Wallet(e.0)
	}
}

/// How a closed round's reward is split between the miners that worked it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutPolicy {
	/// Pay-per-last-N-shares across round boundaries.
	Pplns,
	/// Fixed credit per accepted share.
	Pps,
	/// Proportional to shares within the round.
	Prop,
	/// The block finder takes the whole reward.
	Solo,
}

impl Default for PayoutPolicy {
	fn default() -> PayoutPolicy {
		PayoutPolicy::Pplns
	}
}

fn default_stratum_addr() -> String {
	DEFAULT_STRATUM_ADDR.to_string()
}

fn default_extranonce2_size() -> usize {
	DEFAULT_EXTRANONCE2_SIZE
}

fn default_max_connections_per_ip() -> usize {
	DEFAULT_MAX_CONNECTIONS_PER_IP
}

fn default_connection_timeout_secs() -> u64 {
	DEFAULT_CONNECTION_TIMEOUT_SECS
}

fn default_write_queue_depth() -> usize {
	DEFAULT_WRITE_QUEUE_DEPTH
}

/// Stratum listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumServerConfig {
	/// The address and port to listen on.
	#[serde(default = "default_stratum_addr")]
	pub stratum_server_addr: String,

	/// PEM certificate chain to serve TLS with, plaintext TCP if unset.
	#[serde(default)]
	pub tls_certificate_file: Option<String>,

	/// PEM private key matching the certificate.
	#[serde(default)]
	pub tls_private_key_file: Option<String>,

	/// Width of the worker-chosen extranonce in bytes.
	#[serde(default = "default_extranonce2_size")]
	pub extranonce2_size: usize,

	/// Connections beyond this per remote address are refused at accept.
	#[serde(default = "default_max_connections_per_ip")]
	pub max_connections_per_ip: usize,

	/// Sessions idle beyond this many seconds are closed by the sweep.
	#[serde(default = "default_connection_timeout_secs")]
	pub connection_timeout_secs: u64,

	/// Bound on a session's outbound queue before notifications are shed.
	#[serde(default = "default_write_queue_depth")]
	pub write_queue_depth: usize,
}

impl Default for StratumServerConfig {
	fn default() -> StratumServerConfig {
		StratumServerConfig {
			stratum_server_addr: default_stratum_addr(),
			tls_certificate_file: None,
			tls_private_key_file: None,
			extranonce2_size: default_extranonce2_size(),
			max_connections_per_ip: default_max_connections_per_ip(),
			connection_timeout_secs: default_connection_timeout_secs(),
			write_queue_depth: default_write_queue_depth(),
		}
	}
}

fn default_payout_policy() -> PayoutPolicy {
	PayoutPolicy::default()
}

fn default_pplns_window() -> u64 {
	1000
}

fn default_pool_fee_percent() -> f64 {
	1.0
}

fn default_min_payout() -> u64 {
	50_000_000
}

fn default_payout_interval_secs() -> u64 {
	3600
}

/// Payout scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutConfig {
	/// Reward split policy.
	#[serde(default = "default_payout_policy")]
	pub policy: PayoutPolicy,

	/// N for the PPLNS window, counted in accepted shares.
	#[serde(default = "default_pplns_window")]
	pub pplns_window: u64,

	/// Pool fee in percent of the block reward.
	#[serde(default = "default_pool_fee_percent")]
	pub pool_fee_percent: f64,

	/// No payment is emitted below this amount of base units.
	#[serde(default = "default_min_payout")]
	pub min_payout: u64,

	/// Seconds between payout sweeps, and the minimum spacing of payments
	/// to the same miner.
	#[serde(default = "default_payout_interval_secs")]
	pub payout_interval_secs: u64,
}

impl Default for PayoutConfig {
	fn default() -> PayoutConfig {
		PayoutConfig {
			policy: default_payout_policy(),
			pplns_window: default_pplns_window(),
			pool_fee_percent: default_pool_fee_percent(),
			min_payout: default_min_payout(),
			payout_interval_secs: default_payout_interval_secs(),
		}
	}
}

fn default_max_miners() -> usize {
	10_000
}

fn default_max_workers_per_miner() -> usize {
	100
}

fn default_max_invalid_shares() -> u64 {
	20
}

fn default_ban_duration_secs() -> u64 {
	600
}

fn default_job_refresh_secs() -> u64 {
	30
}

fn default_stale_window_secs() -> u64 {
	300
}

/// Full pool configuration, aggregating the per-component sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
	/// Display name of the pool.
	pub pool_name: String,

	/// Address the coinbase pays the pool with, later settled to miners.
	pub pool_payout_address: String,

	/// Hard cap on registered miners.
	#[serde(default = "default_max_miners")]
	pub max_miners: usize,

	/// Hard cap on live workers per miner.
	#[serde(default = "default_max_workers_per_miner")]
	pub max_workers_per_miner: usize,

	/// Invalid shares within the ban window before a miner is banned.
	#[serde(default = "default_max_invalid_shares")]
	pub max_invalid_shares: u64,

	/// How long an automatic ban lasts, seconds.
	#[serde(default = "default_ban_duration_secs")]
	pub ban_duration_secs: u64,

	/// How often the current job is rebuilt with fresh transactions even
	/// without a new tip, seconds.
	#[serde(default = "default_job_refresh_secs")]
	pub job_refresh_secs: u64,

	/// How long retired jobs keep accepting shares, seconds.
	#[serde(default = "default_stale_window_secs")]
	pub stale_window_secs: u64,

	/// Stratum listener configuration.
	#[serde(default)]
	pub stratum_config: StratumServerConfig,

	/// Per-worker difficulty controller configuration.
	#[serde(default)]
	pub vardiff_config: crate::mining::vardiff::VarDiffConfig,

	/// Payout configuration.
	#[serde(default)]
	pub payout_config: PayoutConfig,
}

impl Default for PoolConfig {
	fn default() -> PoolConfig {
		PoolConfig {
			pool_name: "orepool".to_string(),
			pool_payout_address: String::new(),
			stratum_config: StratumServerConfig::default(),
			vardiff_config: Default::default(),
			payout_config: PayoutConfig::default(),
			max_miners: default_max_miners(),
			max_workers_per_miner: default_max_workers_per_miner(),
			max_invalid_shares: default_max_invalid_shares(),
			ban_duration_secs: default_ban_duration_secs(),
			job_refresh_secs: default_job_refresh_secs(),
			stale_window_secs: default_stale_window_secs(),
		}
	}
}

/// Emitted for every share the ledger accepts; drives accounting and stats.
#[derive(Debug, Clone)]
pub struct ShareAccepted {
	/// Owning miner.
	pub miner_id: u64,
	/// Submitting worker.
	pub worker_id: u64,
	/// Height of the job the share was found against.
	pub height: u64,
	/// Difficulty the share is credited at.
	pub difficulty: u64,
	/// Difficulty the hash is actually worth.
	pub share_difficulty: u64,
	/// Network difficulty of the job, for PPS expectations.
	pub network_difficulty: u64,
	/// Whether the share also met the network target.
	pub is_block: bool,
	/// Submission receipt time.
	pub timestamp: DateTime<Utc>,
}

/// A share that also solves the network target, ready for submission.
#[derive(Debug, Clone)]
pub struct BlockCandidate {
	/// Job the share was found against.
	pub job_id: String,
	/// Height the block claims.
	pub height: u64,
	/// The solved header hash.
	pub hash: Hash,
	/// The reconstructed header.
	pub header: BlockHeader,
	/// The reconstructed coinbase transaction bytes.
	pub coinbase: Vec<u8>,
	/// Remaining raw transactions in template order.
	pub transactions: Arc<Vec<Vec<u8>>>,
	/// The block reward claimed by the coinbase.
	pub reward: u64,
	/// Miner that found it.
	pub finder_miner_id: u64,
	/// Worker that found it.
	pub finder_worker_id: u64,
}
