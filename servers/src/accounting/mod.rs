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

//! The accounting engine. Driven by two event streams, accepted shares and
//! closed rounds, it allocates credit under the configured policy, owns the
//! payment queue, and settles wallet confirmations without ever paying the
//! same credit twice.

pub mod payouts;

use crate::common::adapters::{Wallet, WalletEvent};
use crate::common::types::{PayoutPolicy, PoolConfig, ShareAccepted};
use crate::core::consensus::block_reward;
use crate::core::Hash;
use crate::mining::ledger::{Round, ShareLedger};
use crate::util::RwLock;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// An outbound credit settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
	/// Process-unique id.
	pub payment_id: u64,
	/// The miner being paid.
	pub miner_id: u64,
	/// Address the wallet pays to.
	pub address: String,
	/// Amount in base units.
	pub amount: u64,
	/// Lifecycle state.
	pub status: PaymentStatus,
	/// When the payment was scheduled.
	pub created_at: DateTime<Utc>,
	/// When the chain confirmed it.
	pub confirmed_at: Option<DateTime<Utc>>,
	/// On-chain transaction, absent until broadcast.
	pub tx_hash: Option<Hash>,
}

/// Lifecycle of a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
	/// Scheduled, possibly broadcast, awaiting the chain.
	Pending,
	/// Confirmed on chain, the miner's paid balance includes it.
	Confirmed,
	/// Will never confirm, the miner's unpaid balance was restored.
	Failed,
}

/// Serializable accounting state for the persistence collaborator.
/// Pending payments survive restarts and are settled by later wallet
/// events or re-attempted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountingSnapshot {
	/// The full payment book.
	pub payments: Vec<Payment>,
}

struct PaymentBook {
	payments: Vec<Payment>,
	next_payment_id: u64,
}

/// The engine: policy application plus the payment queue.
pub struct AccountingEngine {
	config: Arc<RwLock<PoolConfig>>,
	ledger: Arc<ShareLedger>,
	wallet: Arc<dyn Wallet>,
	book: RwLock<PaymentBook>,
}

impl AccountingEngine {
	/// A fresh engine with an empty payment book.
	pub fn new(
		config: Arc<RwLock<PoolConfig>>,
		ledger: Arc<ShareLedger>,
		wallet: Arc<dyn Wallet>,
	) -> AccountingEngine {
		AccountingEngine {
			config,
			ledger,
			wallet,
			book: RwLock::new(PaymentBook {
				payments: Vec::new(),
				next_payment_id: 1,
			}),
		}
	}

	/// Credit an accepted share. Only PPS pays per share; the other
	/// policies settle on round close.
	pub fn on_share_accepted(&self, share: &ShareAccepted) {
		let payout = self.config.read().payout_config.clone();
		if payout.policy != PayoutPolicy::Pps {
			return;
		}
		let credit = payouts::pps_share_credit(
			block_reward(share.height),
			payout.pool_fee_percent,
			share.network_difficulty,
			share.difficulty,
		);
		if credit > 0 {
			self.ledger.credit_miner(share.miner_id, credit);
		}
	}

	/// Credit a closed round under the configured policy.
	pub fn on_round_closed(&self, round: &Round) {
		let payout = self.config.read().payout_config.clone();
		let reward = match round.block_reward {
			Some(r) => r,
			None => {
				warn!(
					"round {} closed without a reward, nothing to credit",
					round.round_id
				);
				return;
			}
		};
		match payout.policy {
			PayoutPolicy::Pps => {
				// every share was already paid its expected value
			}
			PayoutPolicy::Pplns => {
				let counts = self.ledger.pplns_counts(payout.pplns_window);
				let split =
					payouts::proportional_split(&counts, reward, payout.pool_fee_percent);
				for (miner_id, amount) in split {
					self.ledger.credit_miner(miner_id, amount);
				}
			}
			PayoutPolicy::Prop => {
				let split = payouts::proportional_split(
					&round.miner_shares,
					reward,
					payout.pool_fee_percent,
				);
				for (miner_id, amount) in split {
					self.ledger.credit_miner(miner_id, amount);
				}
			}
			PayoutPolicy::Solo => {
				if let Some(finder) = round.finder_miner_id {
					self.ledger
						.credit_miner(finder, payouts::solo_credit(reward, payout.pool_fee_percent));
				}
			}
		}
	}

	/// One payout sweep: debit every due miner, schedule a pending payment
	/// and hand it to the wallet. The wallet call happens with no locks
	/// held. Returns how many payments were scheduled.
	pub fn process_payouts(&self, now: DateTime<Utc>) -> usize {
		let payout = self.config.read().payout_config.clone();
		let due = self.ledger.collect_due_payouts(
			payout.min_payout,
			payout.payout_interval_secs,
			now,
		);
		let count = due.len();

		for entry in due {
			let payment_id = {
				let mut book = self.book.write();
				let payment_id = book.next_payment_id;
				book.next_payment_id += 1;
				book.payments.push(Payment {
					payment_id,
					miner_id: entry.miner_id,
					address: entry.address.clone(),
					amount: entry.amount,
					status: PaymentStatus::Pending,
					created_at: now,
					confirmed_at: None,
					tx_hash: None,
				});
				payment_id
			};

			match self.wallet.send(&entry.address, entry.amount) {
				Ok(tx) if tx.broadcast_ok => {
					debug!(
						"payment {} of {} to {} broadcast as {}",
						payment_id, entry.amount, entry.address, tx.tx_hash
					);
					let mut book = self.book.write();
					if let Some(p) = book
						.payments
						.iter_mut()
						.find(|p| p.payment_id == payment_id)
					{
						p.tx_hash = Some(tx.tx_hash);
					}
				}
				Ok(_) | Err(_) => {
					warn!(
						"payment {} of {} to {} failed to broadcast, restoring balance",
						payment_id, entry.amount, entry.address
					);
					self.fail_payment_by_id(payment_id);
				}
			}
		}
		count
	}

	/// Apply an asynchronous wallet confirmation event. A payment settles
	/// at most once: only a pending payment reacts.
	pub fn on_wallet_event(&self, event: WalletEvent, now: DateTime<Utc>) {
		let (tx_hash, confirmed) = match event {
			WalletEvent::Confirmed(h) => (h, true),
			WalletEvent::Failed(h) => (h, false),
		};
		let settled = {
			let mut book = self.book.write();
			match book
				.payments
				.iter_mut()
				.find(|p| p.tx_hash == Some(tx_hash) && p.status == PaymentStatus::Pending)
			{
				Some(p) => {
					if confirmed {
						p.status = PaymentStatus::Confirmed;
						p.confirmed_at = Some(now);
					} else {
						p.status = PaymentStatus::Failed;
					}
					Some((p.miner_id, p.amount))
				}
				None => None,
			}
		};
		if let Some((miner_id, amount)) = settled {
			if confirmed {
				info!("payment {} to miner {} confirmed", tx_hash, miner_id);
				self.ledger.settle_paid(miner_id, amount);
			} else {
				warn!(
					"payment {} to miner {} failed, restoring {}",
					tx_hash, miner_id, amount
				);
				self.ledger.restore_unpaid(miner_id, amount);
			}
		}
	}

	fn fail_payment_by_id(&self, payment_id: u64) {
		let failed = {
			let mut book = self.book.write();
			match book
				.payments
				.iter_mut()
				.find(|p| p.payment_id == payment_id && p.status == PaymentStatus::Pending)
			{
				Some(p) => {
					p.status = PaymentStatus::Failed;
					Some((p.miner_id, p.amount))
				}
				None => None,
			}
		};
		if let Some((miner_id, amount)) = failed {
			self.ledger.restore_unpaid(miner_id, amount);
		}
	}

	/// The most recent payments, newest first.
	pub fn payment_history(&self, limit: usize) -> Vec<Payment> {
		let book = self.book.read();
		book.payments.iter().rev().take(limit).cloned().collect()
	}

	/// The most recent payments to one miner, newest first.
	pub fn miner_payment_history(&self, miner_id: u64, limit: usize) -> Vec<Payment> {
		let book = self.book.read();
		book.payments
			.iter()
			.rev()
			.filter(|p| p.miner_id == miner_id)
			.take(limit)
			.cloned()
			.collect()
	}

	/// Sum of payments still pending.
	pub fn pending_total(&self) -> u64 {
		self.book
			.read()
			.payments
			.iter()
			.filter(|p| p.status == PaymentStatus::Pending)
			.map(|p| p.amount)
			.sum()
	}

	/// Export the serializable payment book.
	pub fn snapshot(&self) -> AccountingSnapshot {
		AccountingSnapshot {
			payments: self.book.read().payments.clone(),
		}
	}

	/// Restore the payment book from a snapshot.
	pub fn restore(&self, snapshot: AccountingSnapshot) {
		let mut book = self.book.write();
		book.next_payment_id = snapshot
			.payments
			.iter()
			.map(|p| p.payment_id)
			.max()
			.unwrap_or(0) + 1;
		book.payments = snapshot.payments;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::common::adapters::{WalletError, WalletTx};
	use crate::core::hash::sha256d;
	use crate::mining::ledger::{SubmitContext, SubmitKey};
	use std::sync::atomic::{AtomicBool, Ordering};

	struct MockWallet {
		broken: AtomicBool,
	}

	impl MockWallet {
		fn new() -> MockWallet {
			MockWallet {
				broken: AtomicBool::new(false),
			}
		}
	}

	impl Wallet for MockWallet {
		fn send(&self, to_address: &str, amount: u64) -> Result<WalletTx, WalletError> {
			if self.broken.load(Ordering::SeqCst) {
				return Err(WalletError("unreachable".to_string()));
			}
			Ok(WalletTx {
				tx_hash: sha256d(format!("{}:{}", to_address, amount).as_bytes()),
				broadcast_ok: true,
			})
		}
	}

	fn engine(policy: PayoutPolicy) -> (Arc<RwLock<PoolConfig>>, Arc<ShareLedger>, AccountingEngine)
	{
		let mut config = PoolConfig::default();
		config.payout_config.policy = policy;
		config.payout_config.pplns_window = 10;
		let config = Arc::new(RwLock::new(config));
		let ledger = Arc::new(ShareLedger::new(config.clone()));
		let accounting =
			AccountingEngine::new(config.clone(), ledger.clone(), Arc::new(MockWallet::new()));
		(config, ledger, accounting)
	}

	fn seed_shares(ledger: &ShareLedger, per_miner: &[(&str, u32)]) -> Vec<u64> {
		let now = Utc::now();
		let mut miner_ids = Vec::new();
		let mut nonce = 0u32;
		for (session, (account, shares)) in per_miner.iter().enumerate() {
			let grant = ledger
				.authorize(account, "rig", "127.0.0.1".parse().unwrap(), session as u64, now)
				.unwrap();
			miner_ids.push(grant.miner_id);
			for _ in 0..*shares {
				nonce += 1;
				ledger
					.record_share(
						grant.worker_id,
						SubmitContext {
							key: SubmitKey {
								job_id: "00000001".to_string(),
								extranonce1: format!("{:08x}", session),
								extranonce2: "00000000".to_string(),
								ntime: 1_700_000_000,
								nonce,
							},
							hash: sha256d(&nonce.to_le_bytes()),
							share_difficulty: 2048,
							meets_network: false,
							height: 100,
							network_difficulty: 1_000_000,
							job_created_at: now,
						},
						now,
					)
					.unwrap();
			}
		}
		miner_ids
	}

	fn closed_round(reward: u64, finder: u64, shares: &[(u64, u64)]) -> Round {
		let now = Utc::now();
		Round {
			round_id: 1,
			started_at: now,
			ended_at: Some(now),
			shares_submitted: shares.iter().map(|(_, n)| n).sum(),
			miner_shares: shares.iter().cloned().collect(),
			block_height: Some(100),
			block_hash: Some(sha256d(b"block")),
			block_reward: Some(reward),
			finder_miner_id: Some(finder),
			is_complete: true,
		}
	}

	#[test]
	fn pplns_round_close_credits_the_window() {
		let (_, ledger, accounting) = engine(PayoutPolicy::Pplns);
		// the last 10 shares split 3 / 2 / 5
		let miners = seed_shares(&ledger, &[("a", 3), ("b", 2), ("c", 5)]);
		let round = closed_round(100_000_000, miners[2], &[]);
		accounting.on_round_closed(&round);

		assert_eq!(ledger.miner(miners[0]).unwrap().unpaid_balance, 29_700_000);
		assert_eq!(ledger.miner(miners[1]).unwrap().unpaid_balance, 19_800_000);
		assert_eq!(ledger.miner(miners[2]).unwrap().unpaid_balance, 49_500_000);
	}

	#[test]
	fn prop_uses_round_counts_not_the_window() {
		let (_, ledger, accounting) = engine(PayoutPolicy::Prop);
		let miners = seed_shares(&ledger, &[("a", 1), ("b", 1)]);
		// the round itself saw a 60/40 split regardless of the ring
		let round = closed_round(100_000_000, miners[0], &[(miners[0], 6), (miners[1], 4)]);
		accounting.on_round_closed(&round);

		assert_eq!(ledger.miner(miners[0]).unwrap().unpaid_balance, 59_400_000);
		assert_eq!(ledger.miner(miners[1]).unwrap().unpaid_balance, 39_600_000);
	}

	#[test]
	fn solo_credits_only_the_finder() {
		let (_, ledger, accounting) = engine(PayoutPolicy::Solo);
		let miners = seed_shares(&ledger, &[("a", 5), ("b", 5)]);
		let round = closed_round(100_000_000, miners[1], &[]);
		accounting.on_round_closed(&round);

		assert_eq!(ledger.miner(miners[0]).unwrap().unpaid_balance, 0);
		assert_eq!(ledger.miner(miners[1]).unwrap().unpaid_balance, 99_000_000);
	}

	#[test]
	fn pps_credits_each_share_as_it_lands() {
		let (_, ledger, accounting) = engine(PayoutPolicy::Pps);
		let miners = seed_shares(&ledger, &[("a", 1)]);
		let share = ShareAccepted {
			miner_id: miners[0],
			worker_id: 1,
			height: 100,
			difficulty: 1000,
			share_difficulty: 1500,
			network_difficulty: 1_000_000,
			is_block: false,
			timestamp: Utc::now(),
		};
		let before = ledger.miner(miners[0]).unwrap().unpaid_balance;
		accounting.on_share_accepted(&share);
		let after = ledger.miner(miners[0]).unwrap().unpaid_balance;
		// reward 50 coins, 1% fee, expected 1000 shares per block
		assert_eq!(after - before, 4_950_000_000 / 1000);
	}

	#[test]
	fn payout_lifecycle_confirm_and_fail_exactly_once() {
		let (config, ledger, accounting) = engine(PayoutPolicy::Pplns);
		config.write().payout_config.min_payout = 1_000;
		let miners = seed_shares(&ledger, &[("a", 1)]);
		ledger.credit_miner(miners[0], 100_000);

		let now = Utc::now();
		assert_eq!(accounting.process_payouts(now), 1);
		let payment = accounting.payment_history(1).remove(0);
		assert_eq!(payment.status, PaymentStatus::Pending);
		let tx_hash = payment.tx_hash.unwrap();
		assert_eq!(ledger.miner(miners[0]).unwrap().unpaid_balance, 0);

		// confirmation settles the paid balance
		accounting.on_wallet_event(WalletEvent::Confirmed(tx_hash), now);
		assert_eq!(ledger.miner(miners[0]).unwrap().paid_balance, 100_000);
		let payment = accounting.payment_history(1).remove(0);
		assert_eq!(payment.status, PaymentStatus::Confirmed);

		// replaying the event changes nothing
		accounting.on_wallet_event(WalletEvent::Confirmed(tx_hash), now);
		accounting.on_wallet_event(WalletEvent::Failed(tx_hash), now);
		assert_eq!(ledger.miner(miners[0]).unwrap().paid_balance, 100_000);
		assert_eq!(ledger.miner(miners[0]).unwrap().unpaid_balance, 0);
	}

	#[test]
	fn failed_event_restores_unpaid_balance_once() {
		let (config, ledger, accounting) = engine(PayoutPolicy::Pplns);
		config.write().payout_config.min_payout = 1_000;
		let miners = seed_shares(&ledger, &[("a", 1)]);
		ledger.credit_miner(miners[0], 100_000);

		let now = Utc::now();
		accounting.process_payouts(now);
		let tx_hash = accounting.payment_history(1).remove(0).tx_hash.unwrap();

		accounting.on_wallet_event(WalletEvent::Failed(tx_hash), now);
		assert_eq!(ledger.miner(miners[0]).unwrap().unpaid_balance, 100_000);
		// a duplicate failure event must not double-restore
		accounting.on_wallet_event(WalletEvent::Failed(tx_hash), now);
		assert_eq!(ledger.miner(miners[0]).unwrap().unpaid_balance, 100_000);
	}

	#[test]
	fn broken_wallet_fails_payment_and_restores() {
		let (config, ledger, _) = engine(PayoutPolicy::Pplns);
		config.write().payout_config.min_payout = 1_000;
		let wallet = Arc::new(MockWallet::new());
		wallet.broken.store(true, Ordering::SeqCst);
		let accounting = AccountingEngine::new(config, ledger.clone(), wallet);

		let miners = seed_shares(&ledger, &[("a", 1)]);
		ledger.credit_miner(miners[0], 100_000);
		accounting.process_payouts(Utc::now());

		let payment = accounting.payment_history(1).remove(0);
		assert_eq!(payment.status, PaymentStatus::Failed);
		assert_eq!(ledger.miner(miners[0]).unwrap().unpaid_balance, 100_000);
	}

	#[test]
	fn snapshot_restores_pending_payments() {
		let (config, ledger, accounting) = engine(PayoutPolicy::Pplns);
		config.write().payout_config.min_payout = 1_000;
		let miners = seed_shares(&ledger, &[("a", 1)]);
		ledger.credit_miner(miners[0], 100_000);
		accounting.process_payouts(Utc::now());

		let snapshot = accounting.snapshot();
		let restored = AccountingEngine::new(
			config,
			ledger.clone(),
			Arc::new(MockWallet::new()),
		);
		restored.restore(snapshot);
		assert_eq!(restored.pending_total(), 100_000);
	}
}
