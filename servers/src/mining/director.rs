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

//! The work director owns the current job slot. It turns block templates
//! into Stratum jobs (coinbase split around the extranonce gap, merkle
//! branch precomputed), keeps retired jobs alive for the stale window, and
//! reconstructs candidate headers from submitted share parameters.

use crate::common::adapters::BlockTemplate;
use crate::common::types::{Error, PoolConfig};
use crate::core::block::{merkle_branch, merkle_root, BlockHeader};
use crate::core::consensus::MAX_NTIME_DRIFT;
use crate::core::hash::sha256d;
use crate::core::{Hash, Target};
use crate::mining::proto::JobNotify;
use crate::util::{RwLock, ToHex};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Base delay for upstream retries.
const BACKOFF_BASE_MS: u64 = 1_000;

/// Cap on upstream retry delays.
const BACKOFF_CAP_MS: u64 = 30_000;

/// Relative jitter applied to retry delays.
const BACKOFF_JITTER: f64 = 0.2;

/// The mining problem currently offered to workers.
#[derive(Debug, Clone)]
pub struct Job {
	/// Opaque id, echoed back in submits.
	pub job_id: String,
	/// Height the job mines at.
	pub height: u64,
	/// Header version.
	pub version: u32,
	/// Previous block hash.
	pub prev_hash: Hash,
	/// Coinbase bytes before the extranonce gap.
	pub coinb1: Vec<u8>,
	/// Coinbase bytes after the extranonce gap.
	pub coinb2: Vec<u8>,
	/// Merkle siblings of the coinbase path.
	pub merkle_branch: Vec<Hash>,
	/// Compact network target.
	pub bits: u32,
	/// The decoded network target.
	pub target: Target,
	/// Network difficulty, for stats and PPS expectations.
	pub network_difficulty: u64,
	/// Template timestamp workers start from.
	pub ntime: u32,
	/// Lower bound for submitted ntimes.
	pub min_time: u32,
	/// Reward the coinbase claims.
	pub coinbase_value: u64,
	/// Raw non-coinbase transactions for block assembly.
	pub transactions: Arc<Vec<Vec<u8>>>,
	/// Whether workers must abandon in-flight work.
	pub clean_jobs: bool,
	/// When this job was built.
	pub created_at: DateTime<Utc>,
}

impl Job {
	/// Render the job as `mining.notify` parameters.
	pub fn notify_params(&self) -> JobNotify {
		JobNotify {
			job_id: self.job_id.clone(),
			prev_hash: self.prev_hash.to_string(),
			coinb1: self.coinb1.to_hex(),
			coinb2: self.coinb2.to_hex(),
			merkle_branch: self
				.merkle_branch
				.iter()
				.map(|h| h.to_internal_hex())
				.collect(),
			version: format!("{:08x}", self.version),
			nbits: format!("{:08x}", self.bits),
			ntime: format!("{:08x}", self.ntime),
			clean_jobs: self.clean_jobs,
		}
	}
}

/// Why a reconstruction failed.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconstructError {
	/// The submitted ntime is before the template's minimum.
	TimeTooOld,
	/// The submitted ntime is past the tolerated clock drift.
	TimeTooNew,
}

struct DirectorState {
	current: Option<Arc<Job>>,
	stale: VecDeque<Arc<Job>>,
	next_job_id: u64,
	last_prev_hash: Option<Hash>,
}

/// Owner of the current-job slot and the stale window.
pub struct JobDirector {
	config: Arc<RwLock<PoolConfig>>,
	state: RwLock<DirectorState>,
}

impl JobDirector {
	/// A director with no job yet.
	pub fn new(config: Arc<RwLock<PoolConfig>>) -> JobDirector {
		JobDirector {
			config,
			state: RwLock::new(DirectorState {
				current: None,
				stale: VecDeque::new(),
				next_job_id: 1,
				last_prev_hash: None,
			}),
		}
	}

	/// Build a job from a template: split the coinbase at the template's
	/// extranonce offset and precompute the merkle branch. `clean_jobs` is
	/// set exactly when the template moved to a new tip.
	pub fn make_job(&self, template: &BlockTemplate, now: DateTime<Utc>) -> Result<Job, Error> {
		if template.extranonce_offset > template.coinbase_tx.len() {
			return Err(Error::Template(format!(
				"extranonce offset {} beyond coinbase of {} bytes",
				template.extranonce_offset,
				template.coinbase_tx.len()
			)));
		}
		let target = Target::from_compact(template.bits)?;
		let branch = merkle_branch(&template.txids);

		let mut state = self.state.write();
		let clean_jobs = match state.last_prev_hash {
			Some(prev) => prev != template.prev_hash,
			None => true,
		};
		let job_id = format!("{:08x}", state.next_job_id);
		state.next_job_id += 1;

		Ok(Job {
			job_id,
			height: template.height,
			version: template.version,
			prev_hash: template.prev_hash,
			coinb1: template.coinbase_tx[..template.extranonce_offset].to_vec(),
			coinb2: template.coinbase_tx[template.extranonce_offset..].to_vec(),
			merkle_branch: branch,
			bits: template.bits,
			target,
			network_difficulty: target.to_difficulty().to_num(),
			ntime: template.curtime,
			min_time: template.min_time,
			coinbase_value: template.coinbase_value,
			transactions: Arc::new(template.transactions.clone()),
			clean_jobs,
			created_at: now,
		})
	}

	/// Install a job as current, retiring the previous one into the stale
	/// window. Returns the installed job for broadcasting.
	pub fn install(&self, job: Job) -> Arc<Job> {
		let stale_window =
			ChronoDuration::seconds(self.config.read().stale_window_secs as i64);
		let job = Arc::new(job);
		let mut state = self.state.write();
		state.last_prev_hash = Some(job.prev_hash);
		if let Some(prev) = state.current.take() {
			state.stale.push_back(prev);
		}
		let cutoff = job.created_at - stale_window;
		while state
			.stale
			.front()
			.map(|j| j.created_at < cutoff)
			.unwrap_or(false)
		{
			state.stale.pop_front();
		}
		state.current = Some(job.clone());
		job
	}

	/// The job currently offered, if any.
	pub fn current(&self) -> Option<Arc<Job>> {
		self.state.read().current.clone()
	}

	/// Locate a job a submit refers to: the current one, or a retired one
	/// still inside the stale window.
	pub fn find(&self, job_id: &str, now: DateTime<Utc>) -> Option<Arc<Job>> {
		let stale_window =
			ChronoDuration::seconds(self.config.read().stale_window_secs as i64);
		let state = self.state.read();
		if let Some(job) = &state.current {
			if job.job_id == job_id {
				return Some(job.clone());
			}
		}
		state
			.stale
			.iter()
			.rev()
			.find(|j| j.job_id == job_id && now - j.created_at <= stale_window)
			.cloned()
	}

	/// Reconstruct the candidate block from submitted share parameters:
	/// splice the extranonces into the coinbase, fold the merkle branch,
	/// assemble and hash the 80-byte header.
	pub fn reconstruct(
		&self,
		job: &Job,
		extranonce1: &[u8],
		extranonce2: &[u8],
		ntime: u32,
		nonce: u32,
		wall_clock: u32,
	) -> Result<(Hash, BlockHeader, Vec<u8>), ReconstructError> {
		if ntime < job.min_time {
			return Err(ReconstructError::TimeTooOld);
		}
		if ntime > wall_clock.saturating_add(MAX_NTIME_DRIFT) {
			return Err(ReconstructError::TimeTooNew);
		}

		let mut coinbase = Vec::with_capacity(
			job.coinb1.len() + extranonce1.len() + extranonce2.len() + job.coinb2.len(),
		);
		coinbase.extend_from_slice(&job.coinb1);
		coinbase.extend_from_slice(extranonce1);
		coinbase.extend_from_slice(extranonce2);
		coinbase.extend_from_slice(&job.coinb2);

		let coinbase_hash = sha256d(&coinbase);
		let root = merkle_root(coinbase_hash, &job.merkle_branch);

		let header = BlockHeader {
			version: job.version,
			prev_hash: job.prev_hash,
			merkle_root: root,
			timestamp: ntime,
			bits: job.bits,
			nonce,
		};
		let hash = header.hash();
		Ok((hash, header, coinbase))
	}
}

/// Delay before upstream retry `attempt` (zero-based): exponential from one
/// second, capped at thirty, with ±20% jitter.
pub fn retry_backoff(attempt: u32) -> Duration {
	let base = BACKOFF_BASE_MS.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
	let capped = base.min(BACKOFF_CAP_MS);
	let jitter = rand::thread_rng().gen_range(-BACKOFF_JITTER..=BACKOFF_JITTER);
	let delayed = capped as f64 * (1.0 + jitter);
	Duration::from_millis(delayed.max(0.0) as u64)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::core::hash::sha256d_pair;

	fn test_template(prev: u8, height: u64) -> BlockTemplate {
		// a tiny synthetic coinbase with a 10-byte prefix and 6-byte suffix
		let coinbase_tx: Vec<u8> = (0u8..16).collect();
		let tx1 = vec![0xaa; 20];
		let tx2 = vec![0xbb; 30];
		BlockTemplate {
			version: 0x2000_0000,
			prev_hash: sha256d(&[prev]),
			bits: 0x1d00ffff,
			height,
			min_time: 1_700_000_000,
			curtime: 1_700_000_600,
			coinbase_value: 50 * 100_000_000,
			coinbase_tx,
			extranonce_offset: 10,
			txids: vec![sha256d(&tx1), sha256d(&tx2)],
			transactions: vec![tx1, tx2],
		}
	}

	fn director() -> JobDirector {
		JobDirector::new(Arc::new(RwLock::new(PoolConfig::default())))
	}

	#[test]
	fn job_splits_coinbase_at_template_offset() {
		let d = director();
		let job = d.make_job(&test_template(1, 100), Utc::now()).unwrap();
		assert_eq!(job.coinb1, (0u8..10).collect::<Vec<u8>>());
		assert_eq!(job.coinb2, (10u8..16).collect::<Vec<u8>>());
		assert_eq!(job.merkle_branch.len(), 2);
		assert_eq!(job.network_difficulty, 1);
	}

	#[test]
	fn offset_beyond_coinbase_is_refused() {
		let d = director();
		let mut template = test_template(1, 100);
		template.extranonce_offset = 17;
		assert!(d.make_job(&template, Utc::now()).is_err());
	}

	#[test]
	fn clean_jobs_tracks_tip_changes() {
		let d = director();
		let now = Utc::now();
		let first = d.make_job(&test_template(1, 100), now).unwrap();
		assert!(first.clean_jobs);
		d.install(first);

		// same tip rebuilt with fresh transactions
		let refresh = d.make_job(&test_template(1, 100), now).unwrap();
		assert!(!refresh.clean_jobs);
		d.install(refresh);

		// new tip
		let next = d.make_job(&test_template(2, 101), now).unwrap();
		assert!(next.clean_jobs);
	}

	#[test]
	fn find_covers_current_and_stale_window() {
		let d = director();
		let now = Utc::now();
		let first = d.make_job(&test_template(1, 100), now).unwrap();
		let first_id = first.job_id.clone();
		d.install(first);
		let second = d.make_job(&test_template(2, 101), now).unwrap();
		let second_id = second.job_id.clone();
		d.install(second);

		assert!(d.find(&second_id, now).is_some());
		// the retired job still accepts submits inside the window
		assert!(d.find(&first_id, now).is_some());
		assert!(d.find("ffffffff", now).is_none());

		// one millisecond before expiry it still resolves, after it doesn't
		let almost = now + ChronoDuration::milliseconds(300_000 - 1);
		assert!(d.find(&first_id, almost).is_some());
		let past = now + ChronoDuration::milliseconds(300_000 + 1);
		assert!(d.find(&first_id, past).is_none());
	}

	#[test]
	fn reconstruction_folds_the_real_merkle_tree() {
		let d = director();
		let template = test_template(1, 100);
		let job = d.make_job(&template, Utc::now()).unwrap();

		let extranonce1 = [0, 0, 0, 1];
		let extranonce2 = [0, 0, 0, 2];
		let (hash, header, coinbase) = d
			.reconstruct(&job, &extranonce1, &extranonce2, job.ntime, 42, job.ntime)
			.unwrap();

		// the coinbase is prefix | e1 | e2 | suffix
		let mut expected = (0u8..10).collect::<Vec<u8>>();
		expected.extend_from_slice(&extranonce1);
		expected.extend_from_slice(&extranonce2);
		expected.extend((10u8..16).collect::<Vec<u8>>());
		assert_eq!(coinbase, expected);

		// the merkle root matches a direct tree computation over
		// [coinbase, tx1, tx2] with the odd level duplicated
		let cb = sha256d(&coinbase);
		let t1 = sha256d(&vec![0xaa; 20]);
		let t2 = sha256d(&vec![0xbb; 30]);
		let l0 = sha256d_pair(&cb, &t1);
		let l1 = sha256d_pair(&t2, &t2);
		assert_eq!(header.merkle_root, sha256d_pair(&l0, &l1));

		assert_eq!(header.nonce, 42);
		assert_eq!(hash, header.hash());
	}

	#[test]
	fn ntime_bounds_are_enforced() {
		let d = director();
		let job = d.make_job(&test_template(1, 100), Utc::now()).unwrap();
		let wall = job.ntime;

		assert_eq!(
			d.reconstruct(&job, &[0; 4], &[0; 4], job.min_time - 1, 0, wall),
			Err(ReconstructError::TimeTooOld)
		);
		assert_eq!(
			d.reconstruct(&job, &[0; 4], &[0; 4], wall + MAX_NTIME_DRIFT + 1, 0, wall),
			Err(ReconstructError::TimeTooNew)
		);
		assert!(d
			.reconstruct(&job, &[0; 4], &[0; 4], wall + MAX_NTIME_DRIFT, 0, wall)
			.is_ok());
	}

	#[test]
	fn backoff_is_capped_with_bounded_jitter() {
		for attempt in 0..12 {
			let delay = retry_backoff(attempt).as_millis() as u64;
			assert!(delay <= (BACKOFF_CAP_MS as f64 * 1.2) as u64 + 1);
			if attempt == 0 {
				assert!(delay >= (BACKOFF_BASE_MS as f64 * 0.8) as u64 - 1);
			}
		}
	}
}
