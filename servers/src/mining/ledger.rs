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

//! The share ledger is the sole validator and recorder of shares and the
//! serializing authority over the canonical miner, worker and round tables.
//! Everything here happens under one lock with bounded hold times; no I/O
//! is ever performed while it is held.

use crate::common::types::{PoolConfig, ShareAccepted};
use crate::core::Hash;
use crate::mining::vardiff;
use crate::util::RwLock;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;

/// Cap on the in-memory share ring.
const SHARE_RING_CAP: usize = 10_000;

/// How many shares are evicted at once when the ring overflows.
const SHARE_RING_EVICT: usize = 1_000;

/// Rounds kept in history for the dashboard.
const ROUND_HISTORY_CAP: usize = 100;

/// A registered account. Created on first authorize, identified by its
/// unique username for the life of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Miner {
	/// Process-unique id.
	pub miner_id: u64,
	/// Unique account name, conventionally the payout address.
	pub username: String,
	/// Where payments go.
	pub payout_address: String,
	/// Live workers owned by this miner.
	pub workers: BTreeSet<u64>,
	/// Lifetime accepted shares.
	pub shares_accepted: u64,
	/// Lifetime rejected shares.
	pub shares_rejected: u64,
	/// Lifetime stale shares.
	pub shares_stale: u64,
	/// Lifetime blocks found.
	pub blocks_found: u64,
	/// Credit not yet paid out, base units.
	pub unpaid_balance: u64,
	/// Total settled through confirmed payments.
	pub paid_balance: u64,
	/// When the last payment to this miner was scheduled.
	pub last_payout: Option<DateTime<Utc>>,
	/// Invalid shares inside the current strike window.
	pub invalid_strikes: u64,
	/// When the current strike window opened.
	pub strike_window_start: DateTime<Utc>,
	/// Ban expiry, unbanned when absent or past.
	pub banned_until: Option<DateTime<Utc>>,
	/// First authorize.
	pub registered_at: DateTime<Utc>,
	/// Last accepted share or authorize.
	pub last_seen: DateTime<Utc>,
}

/// One connected mining device, bound to exactly one session and one miner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
	/// Process-unique id.
	pub worker_id: u64,
	/// Owning miner.
	pub miner_id: u64,
	/// Name from the authorize username suffix.
	pub name: String,
	/// Remote address of the session.
	pub ip: IpAddr,
	/// The session this worker rides on.
	pub session_id: u64,
	/// Connect time.
	pub connected_at: DateTime<Utc>,
	/// Last message of any kind.
	pub last_activity: DateTime<Utc>,
	/// Difficulty shares are currently credited at.
	pub pool_difficulty: u64,
	/// Timestamps of recent accepted shares, the vardiff ring.
	pub recent_shares: VecDeque<DateTime<Utc>>,
	/// Last vardiff evaluation.
	pub last_retarget: DateTime<Utc>,
	/// Accepted shares.
	pub shares_accepted: u64,
	/// Rejected shares.
	pub shares_rejected: u64,
	/// Stale shares.
	pub shares_stale: u64,
	/// Blocks found.
	pub blocks_found: u64,
}

/// The identity of one submission, unique within the stale window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubmitKey {
	/// Job the share claims.
	pub job_id: String,
	/// Session-assigned extranonce, lowercase hex.
	pub extranonce1: String,
	/// Worker-chosen extranonce, lowercase hex.
	pub extranonce2: String,
	/// Header timestamp.
	pub ntime: u32,
	/// Header nonce.
	pub nonce: u32,
}

/// A recorded solution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Share {
	/// Process-unique id.
	pub share_id: u64,
	/// Crediting miner.
	pub miner_id: u64,
	/// Submitting worker.
	pub worker_id: u64,
	/// The submission tuple.
	pub key: SubmitKey,
	/// Reconstructed block hash.
	pub hash: Hash,
	/// Difficulty the share was credited at.
	pub difficulty: u64,
	/// Difficulty the hash is actually worth.
	pub share_difficulty: u64,
	/// Whether it also met the network target.
	pub is_block: bool,
	/// Whether it was accepted.
	pub valid: bool,
	/// Receipt time.
	pub timestamp: DateTime<Utc>,
}

/// The interval between two blocks found by the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
	/// Process-unique id.
	pub round_id: u64,
	/// When the round opened.
	pub started_at: DateTime<Utc>,
	/// When it closed, absent while open.
	pub ended_at: Option<DateTime<Utc>>,
	/// Accepted shares in the round.
	pub shares_submitted: u64,
	/// Accepted shares per miner.
	pub miner_shares: BTreeMap<u64, u64>,
	/// Height of the winning block.
	pub block_height: Option<u64>,
	/// Hash of the winning block.
	pub block_hash: Option<Hash>,
	/// Reward of the winning block.
	pub block_reward: Option<u64>,
	/// Miner that found the winning block.
	pub finder_miner_id: Option<u64>,
	/// Closed exactly when the chain accepted our block.
	pub is_complete: bool,
}

impl Round {
	fn open(round_id: u64, now: DateTime<Utc>) -> Round {
		Round {
			round_id,
			started_at: now,
			ended_at: None,
			shares_submitted: 0,
			miner_shares: BTreeMap::new(),
			block_height: None,
			block_hash: None,
			block_reward: None,
			finder_miner_id: None,
			is_complete: false,
		}
	}
}

/// Why authorize was refused.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthError {
	/// The miner or its address is banned.
	Banned,
	/// The pool is at its miner cap.
	MaxMiners,
	/// The miner is at its worker cap.
	MaxWorkers,
}

/// A successful authorize binding.
#[derive(Debug, Clone)]
pub struct AuthGrant {
	/// The account the session now credits.
	pub miner_id: u64,
	/// The freshly created worker.
	pub worker_id: u64,
	/// Difficulty to push to the session.
	pub difficulty: u64,
}

/// Why a share was refused, in validation order.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
	/// The exact tuple was already submitted inside the stale window.
	Duplicate,
	/// The hash is worth less than the credited difficulty.
	LowDifficulty {
		/// What the hash was worth.
		submitted: u64,
		/// What the worker was credited at.
		required: u64,
	},
	/// The job fell out of the stale window between lookup and recording.
	Stale,
}

/// A refused share, with the side effects the authority must apply.
#[derive(Debug, Clone)]
pub struct ShareRejected {
	/// Why.
	pub reason: RejectReason,
	/// The rejection tripped the miner's ban threshold.
	pub miner_banned: bool,
	/// The controller force-reset the worker difficulty, push it.
	pub new_difficulty: Option<u64>,
}

/// What the director hands the ledger after reconstruction.
#[derive(Debug, Clone)]
pub struct SubmitContext {
	/// The submission tuple.
	pub key: SubmitKey,
	/// Reconstructed block hash.
	pub hash: Hash,
	/// Exact difficulty of the hash.
	pub share_difficulty: u64,
	/// Whether the hash meets the network target.
	pub meets_network: bool,
	/// Job height.
	pub height: u64,
	/// Network difficulty of the job.
	pub network_difficulty: u64,
	/// When the job was created, for the freshness re-check.
	pub job_created_at: DateTime<Utc>,
}

/// A difficulty change the sweep wants pushed to a session.
#[derive(Debug, Clone)]
pub struct RetargetPush {
	/// Session to push to.
	pub session_id: u64,
	/// Worker concerned.
	pub worker_id: u64,
	/// The new difficulty.
	pub difficulty: u64,
}

/// A miner due for payment; balances are already debited when returned.
#[derive(Debug, Clone)]
pub struct PayoutDue {
	/// The miner.
	pub miner_id: u64,
	/// Address to pay.
	pub address: String,
	/// Amount debited from the unpaid balance.
	pub amount: u64,
}

/// Aggregate counters over the ledger's lifetime.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerCounters {
	/// All shares ever recorded, valid or not.
	pub total_shares: u64,
	/// Accepted shares.
	pub total_accepted: u64,
	/// Rejected shares (duplicate or low difficulty).
	pub total_rejected: u64,
	/// Stale shares.
	pub total_stale: u64,
	/// Blocks accepted by the chain.
	pub blocks_found: u64,
	/// Block candidates awaiting the chain's verdict.
	pub blocks_pending: u64,
	/// Block candidates the chain refused.
	pub blocks_orphaned: u64,
}

/// Serializable ledger state for the persistence collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
	/// All registered miners.
	pub miners: Vec<Miner>,
	/// The share ring, oldest first.
	pub shares: Vec<Share>,
	/// Completed rounds.
	pub rounds: Vec<Round>,
	/// The open round.
	pub current_round: Round,
}

struct LedgerInner {
	miners: HashMap<u64, Miner>,
	usernames: HashMap<String, u64>,
	workers: HashMap<u64, Worker>,
	shares: VecDeque<Share>,
	recent_keys: HashSet<SubmitKey>,
	key_order: VecDeque<(DateTime<Utc>, SubmitKey)>,
	current_round: Round,
	round_history: Vec<Round>,
	blocked_ips: HashMap<IpAddr, DateTime<Utc>>,
	counters: LedgerCounters,
	next_miner_id: u64,
	next_worker_id: u64,
	next_share_id: u64,
	next_round_id: u64,
}

/// The ledger itself: one lock over the canonical tables.
pub struct ShareLedger {
	config: Arc<RwLock<PoolConfig>>,
	inner: RwLock<LedgerInner>,
}

impl ShareLedger {
	/// Create an empty ledger with round one open.
	pub fn new(config: Arc<RwLock<PoolConfig>>) -> ShareLedger {
		let now = Utc::now();
		ShareLedger {
			config,
			inner: RwLock::new(LedgerInner {
				miners: HashMap::new(),
				usernames: HashMap::new(),
				workers: HashMap::new(),
				shares: VecDeque::new(),
				recent_keys: HashSet::new(),
				key_order: VecDeque::new(),
				current_round: Round::open(1, now),
				round_history: Vec::new(),
				blocked_ips: HashMap::new(),
				counters: LedgerCounters::default(),
				next_miner_id: 1,
				next_worker_id: 1,
				next_share_id: 1,
				next_round_id: 2,
			}),
		}
	}

	/// Authorize a session: find or register the miner, create the worker
	/// binding, hand back the difficulty to push.
	pub fn authorize(
		&self,
		account: &str,
		worker_name: &str,
		ip: IpAddr,
		session_id: u64,
		now: DateTime<Utc>,
	) -> Result<AuthGrant, AuthError> {
		let config = self.config.read().clone();
		let mut inner = self.inner.write();

		let miner_id = match inner.usernames.get(account) {
			Some(id) => *id,
			None => {
				if inner.miners.len() >= config.max_miners {
					return Err(AuthError::MaxMiners);
				}
				let miner_id = inner.next_miner_id;
				inner.next_miner_id += 1;
				let miner = Miner {
					miner_id,
					username: account.to_string(),
					payout_address: account.to_string(),
					workers: BTreeSet::new(),
					shares_accepted: 0,
					shares_rejected: 0,
					shares_stale: 0,
					blocks_found: 0,
					unpaid_balance: 0,
					paid_balance: 0,
					last_payout: None,
					invalid_strikes: 0,
					strike_window_start: now,
					banned_until: None,
					registered_at: now,
					last_seen: now,
				};
				inner.miners.insert(miner_id, miner);
				inner.usernames.insert(account.to_string(), miner_id);
				miner_id
			}
		};

		{
			let miner = inner.miners.get_mut(&miner_id).expect("miner just resolved");
			if let Some(until) = miner.banned_until {
				if until > now {
					return Err(AuthError::Banned);
				}
				miner.banned_until = None;
				miner.invalid_strikes = 0;
			}
			if miner.workers.len() >= config.max_workers_per_miner {
				return Err(AuthError::MaxWorkers);
			}
			miner.last_seen = now;
		}

		let worker_id = inner.next_worker_id;
		inner.next_worker_id += 1;
		let difficulty = config.vardiff_config.clamped_initial();
		let worker = Worker {
			worker_id,
			miner_id,
			name: worker_name.to_string(),
			ip,
			session_id,
			connected_at: now,
			last_activity: now,
			pool_difficulty: difficulty,
			recent_shares: VecDeque::new(),
			last_retarget: now,
			shares_accepted: 0,
			shares_rejected: 0,
			shares_stale: 0,
			blocks_found: 0,
		};
		inner.workers.insert(worker_id, worker);
		inner
			.miners
			.get_mut(&miner_id)
			.expect("miner just resolved")
			.workers
			.insert(worker_id);

		Ok(AuthGrant {
			miner_id,
			worker_id,
			difficulty,
		})
	}

	/// Drop a worker when its session goes away, both sides of the
	/// miner/worker cross reference cleared together.
	pub fn remove_worker(&self, worker_id: u64) {
		let mut inner = self.inner.write();
		if let Some(worker) = inner.workers.remove(&worker_id) {
			if let Some(miner) = inner.miners.get_mut(&worker.miner_id) {
				miner.workers.remove(&worker_id);
			}
		}
	}

	/// Stamp activity on any message from the worker's session.
	pub fn touch_worker(&self, worker_id: u64, now: DateTime<Utc>) {
		let mut inner = self.inner.write();
		if let Some(worker) = inner.workers.get_mut(&worker_id) {
			worker.last_activity = now;
		}
	}

	/// The difficulty a worker's shares are credited at right now.
	pub fn worker_difficulty(&self, worker_id: u64) -> Option<u64> {
		self.inner
			.read()
			.workers
			.get(&worker_id)
			.map(|w| w.pool_difficulty)
	}

	/// Validate and record one reconstructed share. Rejections increment
	/// counters and strikes; acceptance feeds the round, the ring and the
	/// vardiff controller in one atomic step.
	pub fn record_share(
		&self,
		worker_id: u64,
		ctx: SubmitContext,
		now: DateTime<Utc>,
	) -> Result<(ShareAccepted, Option<u64>), ShareRejected> {
		let config = self.config.read().clone();
		let stale_window = Duration::seconds(config.stale_window_secs as i64);
		let mut inner = self.inner.write();

		let (miner_id, credited) = match inner.workers.get(&worker_id) {
			Some(w) => (w.miner_id, w.pool_difficulty),
			None => {
				// session raced its own teardown, treat as stale
				return Err(ShareRejected {
					reason: RejectReason::Stale,
					miner_banned: false,
					new_difficulty: None,
				});
			}
		};

		// evict expired tuples, then check and reserve this one
		while inner
			.key_order
			.front()
			.map(|(t, _)| now - *t > stale_window)
			.unwrap_or(false)
		{
			if let Some((_, key)) = inner.key_order.pop_front() {
				inner.recent_keys.remove(&key);
			}
		}
		if inner.recent_keys.contains(&ctx.key) {
			let banned = inner.note_invalid(miner_id, worker_id, false, &config, now);
			return Err(ShareRejected {
				reason: RejectReason::Duplicate,
				miner_banned: banned,
				new_difficulty: None,
			});
		}
		inner.recent_keys.insert(ctx.key.clone());
		inner.key_order.push_back((now, ctx.key.clone()));

		if ctx.share_difficulty < credited {
			let banned = inner.note_invalid(miner_id, worker_id, false, &config, now);
			// a wildly weak share force-resets the controller
			let new_difficulty = if vardiff::needs_reset(ctx.share_difficulty, &config.vardiff_config)
			{
				inner.reset_worker_difficulty(worker_id, config.vardiff_config.min_difficulty, now)
			} else {
				None
			};
			inner.push_share(Share {
				share_id: 0, // assigned below
				miner_id,
				worker_id,
				key: ctx.key,
				hash: ctx.hash,
				difficulty: credited,
				share_difficulty: ctx.share_difficulty,
				is_block: false,
				valid: false,
				timestamp: now,
			});
			return Err(ShareRejected {
				reason: RejectReason::LowDifficulty {
					submitted: ctx.share_difficulty,
					required: credited,
				},
				miner_banned: banned,
				new_difficulty,
			});
		}

		// freshness re-check for race safety, the director already filtered
		if now - ctx.job_created_at > stale_window {
			let banned = inner.note_invalid(miner_id, worker_id, true, &config, now);
			return Err(ShareRejected {
				reason: RejectReason::Stale,
				miner_banned: banned,
				new_difficulty: None,
			});
		}

		// accepted
		let accepted = ShareAccepted {
			miner_id,
			worker_id,
			height: ctx.height,
			difficulty: credited,
			share_difficulty: ctx.share_difficulty,
			network_difficulty: ctx.network_difficulty,
			is_block: ctx.meets_network,
			timestamp: now,
		};

		inner.push_share(Share {
			share_id: 0,
			miner_id,
			worker_id,
			key: ctx.key,
			hash: ctx.hash,
			difficulty: credited,
			share_difficulty: ctx.share_difficulty,
			is_block: ctx.meets_network,
			valid: true,
			timestamp: now,
		});

		inner.counters.total_shares += 1;
		inner.counters.total_accepted += 1;
		if ctx.meets_network {
			inner.counters.blocks_pending += 1;
		}

		inner.current_round.shares_submitted += 1;
		*inner.current_round.miner_shares.entry(miner_id).or_insert(0) += 1;

		let mut new_difficulty = None;
		if let Some(worker) = inner.workers.get_mut(&worker_id) {
			worker.shares_accepted += 1;
			worker.last_activity = now;
			worker.recent_shares.push_back(now);
			while worker.recent_shares.len() > vardiff::RECENT_SHARE_CAP {
				worker.recent_shares.pop_front();
			}
			if ctx.meets_network {
				worker.blocks_found += 1;
			}
			if vardiff::should_retarget(
				&worker.recent_shares,
				worker.last_retarget,
				now,
				&config.vardiff_config,
			) {
				let next = vardiff::next_difficulty(
					&worker.recent_shares,
					worker.pool_difficulty,
					&config.vardiff_config,
				);
				worker.last_retarget = now;
				if next != worker.pool_difficulty {
					worker.pool_difficulty = next;
					new_difficulty = Some(next);
				}
			}
		}

		if let Some(miner) = inner.miners.get_mut(&miner_id) {
			miner.shares_accepted += 1;
			miner.last_seen = now;
			miner.invalid_strikes = 0;
			if ctx.meets_network {
				miner.blocks_found += 1;
			}
		}

		Ok((accepted, new_difficulty))
	}

	/// Count a stale rejection the director already refused (unknown or
	/// expired job id), so worker stats and strikes stay truthful.
	pub fn note_stale(&self, worker_id: u64, now: DateTime<Utc>) -> bool {
		let config = self.config.read().clone();
		let mut inner = self.inner.write();
		let miner_id = match inner.workers.get(&worker_id) {
			Some(w) => w.miner_id,
			None => return false,
		};
		inner.note_invalid(miner_id, worker_id, true, &config, now)
	}

	/// Sweep-driven retargeting, so workers that went quiet still drift
	/// back down toward the target rate.
	pub fn retarget_idle(&self, now: DateTime<Utc>) -> Vec<RetargetPush> {
		let config = self.config.read().clone();
		let mut inner = self.inner.write();
		let mut pushes = Vec::new();
		for worker in inner.workers.values_mut() {
			if !vardiff::should_retarget(
				&worker.recent_shares,
				worker.last_retarget,
				now,
				&config.vardiff_config,
			) {
				continue;
			}
			let next = vardiff::next_difficulty(
				&worker.recent_shares,
				worker.pool_difficulty,
				&config.vardiff_config,
			);
			worker.last_retarget = now;
			if next != worker.pool_difficulty {
				worker.pool_difficulty = next;
				pushes.push(RetargetPush {
					session_id: worker.session_id,
					worker_id: worker.worker_id,
					difficulty: next,
				});
			}
		}
		pushes
	}

	/// Close the current round against an accepted block and open the next.
	/// Returns the completed round for accounting.
	pub fn close_round(
		&self,
		height: u64,
		hash: Hash,
		reward: u64,
		finder_miner_id: u64,
		now: DateTime<Utc>,
	) -> Round {
		let mut inner = self.inner.write();
		inner.counters.blocks_found += 1;
		inner.counters.blocks_pending = inner.counters.blocks_pending.saturating_sub(1);

		let round_id = inner.next_round_id;
		inner.next_round_id += 1;
		let mut closed = std::mem::replace(&mut inner.current_round, Round::open(round_id, now));
		closed.ended_at = Some(now);
		closed.block_height = Some(height);
		closed.block_hash = Some(hash);
		closed.block_reward = Some(reward);
		closed.finder_miner_id = Some(finder_miner_id);
		closed.is_complete = true;

		inner.round_history.push(closed.clone());
		if inner.round_history.len() > ROUND_HISTORY_CAP {
			inner.round_history.remove(0);
		}
		closed
	}

	/// A block candidate the chain refused as stale: the round stays open
	/// and the share stays credited, only the counters move.
	pub fn note_block_rejected(&self) {
		let mut inner = self.inner.write();
		inner.counters.blocks_pending = inner.counters.blocks_pending.saturating_sub(1);
		inner.counters.blocks_orphaned += 1;
	}

	/// Per-miner counts over the last `n` accepted shares, the PPLNS window.
	pub fn pplns_counts(&self, n: u64) -> BTreeMap<u64, u64> {
		let inner = self.inner.read();
		let mut counts = BTreeMap::new();
		let mut seen = 0u64;
		for share in inner.shares.iter().rev() {
			if !share.valid {
				continue;
			}
			*counts.entry(share.miner_id).or_insert(0) += 1;
			seen += 1;
			if seen >= n {
				break;
			}
		}
		counts
	}

	/// Credit a miner's unpaid balance.
	pub fn credit_miner(&self, miner_id: u64, amount: u64) {
		let mut inner = self.inner.write();
		if let Some(miner) = inner.miners.get_mut(&miner_id) {
			miner.unpaid_balance = miner.unpaid_balance.saturating_add(amount);
		}
	}

	/// Debit every miner that is due a payment. Balances move here, under
	/// the lock; the wallet call happens outside it.
	pub fn collect_due_payouts(
		&self,
		min_payout: u64,
		interval_secs: u64,
		now: DateTime<Utc>,
	) -> Vec<PayoutDue> {
		let mut inner = self.inner.write();
		let mut due = Vec::new();
		for miner in inner.miners.values_mut() {
			if miner.unpaid_balance < min_payout {
				continue;
			}
			if let Some(last) = miner.last_payout {
				if (now - last).num_seconds() < interval_secs as i64 {
					continue;
				}
			}
			let amount = miner.unpaid_balance;
			miner.unpaid_balance = 0;
			miner.last_payout = Some(now);
			due.push(PayoutDue {
				miner_id: miner.miner_id,
				address: miner.payout_address.clone(),
				amount,
			});
		}
		due
	}

	/// Give a failed payment's amount back, exactly once per failure.
	pub fn restore_unpaid(&self, miner_id: u64, amount: u64) {
		let mut inner = self.inner.write();
		if let Some(miner) = inner.miners.get_mut(&miner_id) {
			miner.unpaid_balance = miner.unpaid_balance.saturating_add(amount);
		}
	}

	/// Settle a confirmed payment into the paid balance.
	pub fn settle_paid(&self, miner_id: u64, amount: u64) {
		let mut inner = self.inner.write();
		if let Some(miner) = inner.miners.get_mut(&miner_id) {
			miner.paid_balance = miner.paid_balance.saturating_add(amount);
		}
	}

	/// Administratively ban a miner until the given time.
	pub fn ban_miner(&self, miner_id: u64, until: DateTime<Utc>) -> bool {
		let mut inner = self.inner.write();
		match inner.miners.get_mut(&miner_id) {
			Some(miner) => {
				miner.banned_until = Some(until);
				true
			}
			None => false,
		}
	}

	/// Lift a ban.
	pub fn unban_miner(&self, miner_id: u64) -> bool {
		let mut inner = self.inner.write();
		match inner.miners.get_mut(&miner_id) {
			Some(miner) => {
				miner.banned_until = None;
				miner.invalid_strikes = 0;
				true
			}
			None => false,
		}
	}

	/// Point a miner's payments somewhere else.
	pub fn update_payout_address(&self, miner_id: u64, address: &str) -> bool {
		let mut inner = self.inner.write();
		match inner.miners.get_mut(&miner_id) {
			Some(miner) => {
				miner.payout_address = address.to_string();
				true
			}
			None => false,
		}
	}

	/// Temporarily refuse connections from an address.
	pub fn block_ip(&self, ip: IpAddr, until: DateTime<Utc>) {
		self.inner.write().blocked_ips.insert(ip, until);
	}

	/// Whether an address is currently refused.
	pub fn is_ip_blocked(&self, ip: &IpAddr, now: DateTime<Utc>) -> bool {
		let mut inner = self.inner.write();
		match inner.blocked_ips.get(ip) {
			Some(until) if *until > now => true,
			Some(_) => {
				inner.blocked_ips.remove(ip);
				false
			}
			None => false,
		}
	}

	/// All sessions currently bound to a miner's workers.
	pub fn miner_sessions(&self, miner_id: u64) -> Vec<u64> {
		let inner = self.inner.read();
		inner
			.workers
			.values()
			.filter(|w| w.miner_id == miner_id)
			.map(|w| w.session_id)
			.collect()
	}

	/// Clone of a miner record.
	pub fn miner(&self, miner_id: u64) -> Option<Miner> {
		self.inner.read().miners.get(&miner_id).cloned()
	}

	/// Look a miner up by username.
	pub fn miner_by_username(&self, username: &str) -> Option<Miner> {
		let inner = self.inner.read();
		inner
			.usernames
			.get(username)
			.and_then(|id| inner.miners.get(id))
			.cloned()
	}

	/// Clones of all miner records.
	pub fn miners(&self) -> Vec<Miner> {
		self.inner.read().miners.values().cloned().collect()
	}

	/// Clone of a worker record.
	pub fn worker(&self, worker_id: u64) -> Option<Worker> {
		self.inner.read().workers.get(&worker_id).cloned()
	}

	/// Clones of all worker records.
	pub fn workers(&self) -> Vec<Worker> {
		self.inner.read().workers.values().cloned().collect()
	}

	/// The most recent `count` shares, oldest first.
	pub fn recent_shares(&self, count: usize) -> Vec<Share> {
		let inner = self.inner.read();
		let skip = inner.shares.len().saturating_sub(count);
		inner.shares.iter().skip(skip).cloned().collect()
	}

	/// The open round.
	pub fn current_round(&self) -> Round {
		self.inner.read().current_round.clone()
	}

	/// The last `count` completed rounds.
	pub fn round_history(&self, count: usize) -> Vec<Round> {
		let inner = self.inner.read();
		let skip = inner.round_history.len().saturating_sub(count);
		inner.round_history[skip..].to_vec()
	}

	/// Aggregate counters.
	pub fn counters(&self) -> LedgerCounters {
		self.inner.read().counters.clone()
	}

	/// Sum of credited difficulty over valid shares in the trailing window,
	/// the basis of hashrate estimation.
	pub fn difficulty_in_window(&self, window_secs: u64, now: DateTime<Utc>) -> u64 {
		let cutoff = now - Duration::seconds(window_secs as i64);
		let inner = self.inner.read();
		inner
			.shares
			.iter()
			.rev()
			.take_while(|s| s.timestamp >= cutoff)
			.filter(|s| s.valid)
			.map(|s| s.difficulty)
			.sum()
	}

	/// Export the serializable state.
	pub fn snapshot(&self) -> LedgerSnapshot {
		let inner = self.inner.read();
		LedgerSnapshot {
			miners: inner.miners.values().cloned().collect(),
			shares: inner.shares.iter().cloned().collect(),
			rounds: inner.round_history.clone(),
			current_round: inner.current_round.clone(),
		}
	}

	/// Restore state from a snapshot, rebuilding the derived indexes.
	/// Worker bindings are session-scoped and start empty.
	pub fn restore(&self, snapshot: LedgerSnapshot) {
		let config = self.config.read().clone();
		let stale_window = Duration::seconds(config.stale_window_secs as i64);
		let now = Utc::now();
		let mut inner = self.inner.write();

		inner.usernames = snapshot
			.miners
			.iter()
			.map(|m| (m.username.clone(), m.miner_id))
			.collect();
		inner.next_miner_id = snapshot
			.miners
			.iter()
			.map(|m| m.miner_id)
			.max()
			.unwrap_or(0) + 1;
		let mut miners: HashMap<u64, Miner> = snapshot
			.miners
			.into_iter()
			.map(|mut m| {
				m.workers.clear();
				(m.miner_id, m)
			})
			.collect();
		std::mem::swap(&mut inner.miners, &mut miners);

		inner.next_share_id = snapshot.shares.iter().map(|s| s.share_id).max().unwrap_or(0) + 1;
		inner.recent_keys = snapshot
			.shares
			.iter()
			.filter(|s| now - s.timestamp <= stale_window)
			.map(|s| s.key.clone())
			.collect();
		inner.key_order = snapshot
			.shares
			.iter()
			.filter(|s| now - s.timestamp <= stale_window)
			.map(|s| (s.timestamp, s.key.clone()))
			.collect();
		inner.shares = snapshot.shares.into();

		inner.next_round_id = snapshot
			.rounds
			.iter()
			.map(|r| r.round_id)
			.chain(std::iter::once(snapshot.current_round.round_id))
			.max()
			.unwrap_or(0) + 1;
		inner.round_history = snapshot.rounds;
		inner.current_round = snapshot.current_round;
	}
}

impl LedgerInner {
	fn push_share(&mut self, mut share: Share) {
		share.share_id = self.next_share_id;
		self.next_share_id += 1;
		self.shares.push_back(share);
		if self.shares.len() > SHARE_RING_CAP {
			for _ in 0..SHARE_RING_EVICT {
				self.shares.pop_front();
			}
		}
	}

	/// Count a rejection against the worker and the miner's strike window.
	/// Returns whether this one tripped the ban threshold.
	fn note_invalid(
		&mut self,
		miner_id: u64,
		worker_id: u64,
		stale: bool,
		config: &PoolConfig,
		now: DateTime<Utc>,
	) -> bool {
		if let Some(worker) = self.workers.get_mut(&worker_id) {
			if stale {
				worker.shares_stale += 1;
			} else {
				worker.shares_rejected += 1;
			}
			worker.last_activity = now;
		}
		if stale {
			self.counters.total_stale += 1;
		} else {
			self.counters.total_rejected += 1;
		}
		self.counters.total_shares += 1;

		let ban_window = Duration::seconds(config.ban_duration_secs as i64);
		if let Some(miner) = self.miners.get_mut(&miner_id) {
			if stale {
				miner.shares_stale += 1;
			} else {
				miner.shares_rejected += 1;
			}
			if now - miner.strike_window_start > ban_window {
				miner.strike_window_start = now;
				miner.invalid_strikes = 0;
			}
			miner.invalid_strikes += 1;
			if miner.invalid_strikes >= config.max_invalid_shares {
				miner.banned_until = Some(now + ban_window);
				miner.invalid_strikes = 0;
				return true;
			}
		}
		false
	}

	fn reset_worker_difficulty(
		&mut self,
		worker_id: u64,
		difficulty: u64,
		now: DateTime<Utc>,
	) -> Option<u64> {
		let worker = self.workers.get_mut(&worker_id)?;
		worker.recent_shares.clear();
		worker.last_retarget = now;
		if worker.pool_difficulty == difficulty {
			return None;
		}
		worker.pool_difficulty = difficulty;
		Some(difficulty)
	}
}
