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

//! Pool server implementation, glues the different parts of the system
//! (session authority, work director, share ledger, vardiff and the
//! accounting engine) and acts as a facade. Owns the task topology: the
//! accept loop, the template task, the submission and event pumps, and the
//! periodic sweeps.

use crate::accounting::AccountingEngine;
use crate::common::adapters::{ChainNode, NewTip, Wallet, WalletEvent};
use crate::common::stats::{self, PoolStatistics, StratumStats, WorkerStats};
use crate::common::types::{BlockCandidate, Error, PoolConfig, ShareAccepted};
use crate::core::block::serialize_block;
use crate::mining::director::{retry_backoff, JobDirector};
use crate::mining::ledger::{Round, ShareLedger};
use crate::mining::stratumserver::{accept_connections, load_tls_acceptor, Handler};
use crate::util::{Mutex, RwLock, StopState};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch};

/// Cadence of the vardiff / idle-session sweep.
const SWEEP_INTERVAL_SECS: u64 = 30;

/// How long outstanding blocking calls may drain at shutdown.
const SHUTDOWN_DRAIN_SECS: u64 = 30;

/// How recently a miner must have been seen to count as active.
const ACTIVE_MINER_WINDOW_SECS: i64 = 600;

/// Window used for pool hashrate estimation.
const POOL_HASHRATE_WINDOW_SECS: u64 = 600;

/// Window used for per-worker hashrate estimation.
const WORKER_HASHRATE_WINDOW_SECS: u64 = 300;

/// Serializable server state handed to the persistence collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
	/// Miners, shares and rounds.
	pub ledger: crate::mining::ledger::LedgerSnapshot,
	/// The payment book.
	pub accounting: crate::accounting::AccountingSnapshot,
}

struct ServerInputs {
	share_rx: mpsc::UnboundedReceiver<ShareAccepted>,
	block_rx: mpsc::UnboundedReceiver<BlockCandidate>,
	tips_rx: mpsc::UnboundedReceiver<NewTip>,
	wallet_rx: mpsc::UnboundedReceiver<WalletEvent>,
}

/// Pool server holding internal structures together.
pub struct Server {
	/// Shared configuration, admin-mutable at runtime.
	config: Arc<RwLock<PoolConfig>>,
	/// The share ledger and canonical tables.
	pub ledger: Arc<ShareLedger>,
	/// The work director.
	pub director: Arc<JobDirector>,
	/// The accounting engine.
	pub accounting: Arc<AccountingEngine>,
	handler: Arc<Handler>,
	chain: Arc<dyn ChainNode>,
	/// Stop flag watched by every long-running loop.
	pub stop_state: Arc<StopState>,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
	start_time: DateTime<Utc>,
	inputs: Mutex<Option<ServerInputs>>,
	thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Server {
	/// Assemble a server from its collaborators. `tips_rx` streams new-tip
	/// notifications from the chain node, `wallet_rx` streams payment
	/// confirmations from the wallet.
	pub fn new(
		config: PoolConfig,
		chain: Arc<dyn ChainNode>,
		wallet: Arc<dyn Wallet>,
		tips_rx: mpsc::UnboundedReceiver<NewTip>,
		wallet_rx: mpsc::UnboundedReceiver<WalletEvent>,
	) -> Server {
		let config = Arc::new(RwLock::new(config));
		let ledger = Arc::new(ShareLedger::new(config.clone()));
		let director = Arc::new(JobDirector::new(config.clone()));
		let accounting = Arc::new(AccountingEngine::new(
			config.clone(),
			ledger.clone(),
			wallet,
		));
		let (share_tx, share_rx) = mpsc::unbounded_channel();
		let (block_tx, block_rx) = mpsc::unbounded_channel();
		let handler = Arc::new(Handler::new(
			config.clone(),
			ledger.clone(),
			director.clone(),
			share_tx,
			block_tx,
		));
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		Server {
			config,
			ledger,
			director,
			accounting,
			handler,
			chain,
			stop_state: Arc::new(StopState::new()),
			shutdown_tx,
			shutdown_rx,
			start_time: Utc::now(),
			inputs: Mutex::new(Some(ServerInputs {
				share_rx,
				block_rx,
				tips_rx,
				wallet_rx,
			})),
			thread: Mutex::new(None),
		}
	}

	/// Start every task on a dedicated runtime thread. Fatal conditions
	/// (unparseable or unbindable listen address, broken TLS material)
	/// surface here or stop the server immediately.
	pub fn start(&self) -> Result<(), Error> {
		let inputs = match self.inputs.lock().take() {
			Some(inputs) => inputs,
			None => return Err(Error::Config("server already started".to_string())),
		};

		let stratum_config = self.config.read().stratum_config.clone();
		let listen_addr: SocketAddr = stratum_config
			.stratum_server_addr
			.parse()
			.map_err(|_| {
				Error::Config(format!(
					"invalid stratum listen address {}",
					stratum_config.stratum_server_addr
				))
			})?;
		let tls = match (
			&stratum_config.tls_certificate_file,
			&stratum_config.tls_private_key_file,
		) {
			(Some(cert), Some(key)) => Some(load_tls_acceptor(cert, key)?),
			(None, None) => None,
			_ => {
				return Err(Error::Config(
					"TLS needs both a certificate and a private key".to_string(),
				))
			}
		};

		let config = self.config.clone();
		let ledger = self.ledger.clone();
		let director = self.director.clone();
		let accounting = self.accounting.clone();
		let handler = self.handler.clone();
		let chain = self.chain.clone();
		let stop_state = self.stop_state.clone();
		let shutdown_tx = self.shutdown_tx.clone();
		let shutdown_rx = self.shutdown_rx.clone();

		let handle = thread::Builder::new()
			.name("pool-server".to_string())
			.spawn(move || {
				let runtime = match Runtime::new() {
					Ok(rt) => rt,
					Err(e) => {
						error!("failed to build runtime: {}", e);
						stop_state.stop();
						return;
					}
				};

				runtime.block_on(run_server(
					config,
					ledger,
					director,
					accounting,
					handler,
					chain,
					inputs,
					listen_addr,
					tls,
					stop_state.clone(),
					shutdown_tx,
					shutdown_rx,
				));

				// let outstanding blocking calls (payouts, submissions)
				// drain within the deadline, then give up on them
				runtime.shutdown_timeout(Duration::from_secs(SHUTDOWN_DRAIN_SECS));
				stop_state.stop();
			})
			.map_err(Error::IO)?;
		*self.thread.lock() = Some(handle);
		Ok(())
	}

	/// Signal every task to stop and wait for the runtime thread.
	pub fn stop(&self) {
		self.stop_state.stop();
		let _ = self.shutdown_tx.send(true);
		if let Some(handle) = self.thread.lock().take() {
			let _ = handle.join();
		}
	}

	/// Whether the server has been stopped.
	pub fn is_stopped(&self) -> bool {
		self.stop_state.is_stopped()
	}

	// ------------------------------------------------------------------
	// Control surface

	/// Pool-wide statistics snapshot.
	pub fn statistics(&self) -> PoolStatistics {
		let now = Utc::now();
		let counters = self.ledger.counters();
		let miners = self.ledger.miners();
		let current_job = self.director.current();
		let active_window = ChronoDuration::seconds(ACTIVE_MINER_WINDOW_SECS);

		PoolStatistics {
			network_height: current_job.as_ref().map(|j| j.height).unwrap_or(0),
			network_difficulty: current_job
				.as_ref()
				.map(|j| j.network_difficulty)
				.unwrap_or(0),
			total_miners: miners.len(),
			active_miners: miners
				.iter()
				.filter(|m| now - m.last_seen < active_window)
				.count(),
			active_workers: self.ledger.workers().len(),
			total_connections: self.handler.session_count(),
			pool_hashrate: stats::hashrate(
				self.ledger
					.difficulty_in_window(POOL_HASHRATE_WINDOW_SECS, now),
				POOL_HASHRATE_WINDOW_SECS,
			),
			shares_this_round: self.ledger.current_round().shares_submitted,
			total_shares: counters.total_shares,
			blocks_found: counters.blocks_found,
			blocks_pending: counters.blocks_pending,
			blocks_orphaned: counters.blocks_orphaned,
			total_paid: miners.iter().map(|m| m.paid_balance).sum(),
			total_unpaid: miners.iter().map(|m| m.unpaid_balance).sum(),
			efficiency: stats::efficiency(counters.total_accepted, counters.total_shares),
			uptime_hours: (now - self.start_time).num_minutes() as f64 / 60.0,
		}
	}

	/// Stratum-level statistics with per-worker detail.
	pub fn stratum_stats(&self) -> StratumStats {
		let now = Utc::now();
		let current_job = self.director.current();
		let cutoff = now - ChronoDuration::seconds(WORKER_HASHRATE_WINDOW_SECS as i64);
		let worker_stats = self
			.ledger
			.workers()
			.into_iter()
			.map(|w| {
				let recent = w
					.recent_shares
					.iter()
					.filter(|t| **t >= cutoff)
					.count() as u64;
				WorkerStats {
					id: w.worker_id,
					miner_id: w.miner_id,
					name: w.name,
					is_connected: true,
					last_seen: w.last_activity,
					pool_difficulty: w.pool_difficulty,
					num_accepted: w.shares_accepted,
					num_rejected: w.shares_rejected,
					num_stale: w.shares_stale,
					num_blocks_found: w.blocks_found,
					hashrate: stats::hashrate(
						recent * w.pool_difficulty,
						WORKER_HASHRATE_WINDOW_SECS,
					),
				}
			})
			.collect::<Vec<_>>();
		StratumStats {
			is_running: !self.stop_state.is_stopped(),
			num_sessions: self.handler.session_count(),
			num_workers: worker_stats.len(),
			block_height: current_job.as_ref().map(|j| j.height).unwrap_or(0),
			network_difficulty: current_job
				.as_ref()
				.map(|j| j.network_difficulty)
				.unwrap_or(0),
			worker_stats,
		}
	}

	/// One miner's record.
	pub fn miner(&self, miner_id: u64) -> Option<crate::mining::ledger::Miner> {
		self.ledger.miner(miner_id)
	}

	/// Look a miner up by account name.
	pub fn miner_by_username(&self, username: &str) -> Option<crate::mining::ledger::Miner> {
		self.ledger.miner_by_username(username)
	}

	/// The most recent payments, newest first.
	pub fn payment_history(&self, limit: usize) -> Vec<crate::accounting::Payment> {
		self.accounting.payment_history(limit)
	}

	/// The most recent payments to one miner, newest first.
	pub fn miner_payment_history(
		&self,
		miner_id: u64,
		limit: usize,
	) -> Vec<crate::accounting::Payment> {
		self.accounting.miner_payment_history(miner_id, limit)
	}

	/// The open round.
	pub fn current_round(&self) -> Round {
		self.ledger.current_round()
	}

	/// Completed rounds, most recent last.
	pub fn round_history(&self, count: usize) -> Vec<Round> {
		self.ledger.round_history(count)
	}

	/// Administratively ban a miner for the configured duration and cut
	/// its live sessions.
	pub fn ban_miner(&self, miner_id: u64) -> bool {
		let duration = self.config.read().ban_duration_secs;
		let until = Utc::now() + ChronoDuration::seconds(duration as i64);
		let banned = self.ledger.ban_miner(miner_id, until);
		if banned {
			warn!("miner {} banned until {}", miner_id, until);
			self.handler.disconnect_miner(miner_id);
		}
		banned
	}

	/// Lift a miner's ban.
	pub fn unban_miner(&self, miner_id: u64) -> bool {
		self.ledger.unban_miner(miner_id)
	}

	/// Change where a miner is paid.
	pub fn update_payout_address(&self, miner_id: u64, address: &str) -> bool {
		self.ledger.update_payout_address(miner_id, address)
	}

	/// Replace the runtime configuration. Listener settings take effect on
	/// restart; difficulty, payout and ban settings apply immediately.
	pub fn update_config(&self, new_config: PoolConfig) {
		*self.config.write() = new_config;
	}

	/// A copy of the active configuration.
	pub fn config(&self) -> PoolConfig {
		self.config.read().clone()
	}

	/// Serializable state for the persistence collaborator.
	pub fn snapshot(&self) -> PoolSnapshot {
		PoolSnapshot {
			ledger: self.ledger.snapshot(),
			accounting: self.accounting.snapshot(),
		}
	}

	/// Restore state saved by an earlier run. Call before `start`.
	pub fn restore(&self, snapshot: PoolSnapshot) {
		self.ledger.restore(snapshot.ledger);
		self.accounting.restore(snapshot.accounting);
	}
}

/// The server main future: spawns every task and parks until shutdown.
async fn run_server(
	config: Arc<RwLock<PoolConfig>>,
	ledger: Arc<ShareLedger>,
	director: Arc<JobDirector>,
	accounting: Arc<AccountingEngine>,
	handler: Arc<Handler>,
	chain: Arc<dyn ChainNode>,
	inputs: ServerInputs,
	listen_addr: SocketAddr,
	tls: Option<tokio_rustls::TlsAcceptor>,
	stop_state: Arc<StopState>,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
) {
	let ServerInputs {
		mut share_rx,
		mut block_rx,
		mut tips_rx,
		mut wallet_rx,
	} = inputs;
	let (found_tx, mut found_rx) = mpsc::unbounded_channel::<()>();

	// accept loop; failure to bind is fatal for the whole server
	{
		let handler = handler.clone();
		let shutdown = shutdown_rx.clone();
		let shutdown_tx = shutdown_tx.clone();
		let stop_state = stop_state.clone();
		tokio::spawn(async move {
			if let Err(e) = accept_connections(handler, listen_addr, tls, shutdown).await {
				error!("cannot serve stratum on {}: {:?}", listen_addr, e);
				stop_state.stop();
				let _ = shutdown_tx.send(true);
			}
		});
	}

	// template task: initial job, then rebuilt on tips, found blocks and
	// the refresh cadence, retrying upstream failures with backoff
	{
		let config = config.clone();
		let director = director.clone();
		let handler = handler.clone();
		let chain = chain.clone();
		let mut shutdown = shutdown_rx.clone();
		tokio::spawn(async move {
			loop {
				let mut attempt = 0u32;
				let template = loop {
					let chain = chain.clone();
					let payout_address = config.read().pool_payout_address.clone();
					let fetched = tokio::task::spawn_blocking(move || {
						chain.get_template(&payout_address)
					})
					.await;
					match fetched {
						Ok(Ok(template)) => break Some(template),
						Ok(Err(e)) => {
							// keep serving the last valid job while the
							// upstream recovers
							error!("template fetch failed: {}", e);
						}
						Err(e) => error!("template fetch task died: {}", e),
					}
					let delay = retry_backoff(attempt);
					attempt = attempt.saturating_add(1);
					tokio::select! {
						_ = shutdown.changed() => return,
						_ = tokio::time::sleep(delay) => {}
					}
				};
				if let Some(template) = template {
					match director.make_job(&template, Utc::now()) {
						Ok(job) => {
							let job = director.install(job);
							info!(
								"new job {} at height {} (clean={})",
								job.job_id, job.height, job.clean_jobs
							);
							handler.broadcast_job(&job);
						}
						Err(e) => error!("unusable template: {:?}", e),
					}
				}

				let refresh = config.read().job_refresh_secs;
				tokio::select! {
					_ = shutdown.changed() => return,
					_ = tokio::time::sleep(Duration::from_secs(refresh)) => {}
					Some(tip) = tips_rx.recv() => {
						debug!("chain tip moved to height {}", tip.height);
					}
					Some(_) = found_rx.recv() => {
						debug!("own block accepted, rebuilding work");
					}
				}
			}
		});
	}

	// block submission task
	{
		let ledger = ledger.clone();
		let accounting = accounting.clone();
		let chain = chain.clone();
		let mut shutdown = shutdown_rx.clone();
		tokio::spawn(async move {
			loop {
				let candidate = tokio::select! {
					_ = shutdown.changed() => return,
					candidate = block_rx.recv() => match candidate {
						Some(c) => c,
						None => return,
					},
				};
				let block_bytes = serialize_block(
					&candidate.header,
					&candidate.coinbase,
					&candidate.transactions,
				);
				let chain = chain.clone();
				let submitted =
					tokio::task::spawn_blocking(move || chain.submit_block(&block_bytes)).await;
				match submitted {
					Ok(Ok(acceptance)) if acceptance.accepted => {
						warn!(
							"block {} at height {} accepted by the chain - Yay!!! worker {}",
							candidate.hash, candidate.height, candidate.finder_worker_id
						);
						let round = ledger.close_round(
							candidate.height,
							candidate.hash,
							candidate.reward,
							candidate.finder_miner_id,
							Utc::now(),
						);
						accounting.on_round_closed(&round);
						let _ = found_tx.send(());
					}
					Ok(Ok(acceptance)) => {
						// stale against the real chain: the share keeps
						// its credit and the round stays open
						error!(
							"chain rejected block {} at height {}: {}",
							candidate.hash,
							candidate.height,
							acceptance
								.reject_reason
								.unwrap_or_else(|| "no reason given".to_string())
						);
						ledger.note_block_rejected();
					}
					Ok(Err(e)) => {
						error!("block submission failed: {}", e);
						ledger.note_block_rejected();
					}
					Err(e) => error!("block submission task died: {}", e),
				}
			}
		});
	}

	// accepted-share pump into the accounting engine
	{
		let accounting = accounting.clone();
		let mut shutdown = shutdown_rx.clone();
		tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = shutdown.changed() => return,
					share = share_rx.recv() => match share {
						Some(share) => accounting.on_share_accepted(&share),
						None => return,
					},
				}
			}
		});
	}

	// wallet confirmation pump
	{
		let accounting = accounting.clone();
		let mut shutdown = shutdown_rx.clone();
		tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = shutdown.changed() => return,
					event = wallet_rx.recv() => match event {
						Some(event) => accounting.on_wallet_event(event, Utc::now()),
						None => return,
					},
				}
			}
		});
	}

	// vardiff / idle sweep
	{
		let handler = handler.clone();
		let mut shutdown = shutdown_rx.clone();
		tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = shutdown.changed() => return,
					_ = tokio::time::sleep(Duration::from_secs(SWEEP_INTERVAL_SECS)) => {
						handler.sweep(Utc::now());
					}
				}
			}
		});
	}

	// payout sweep
	{
		let config = config.clone();
		let accounting = accounting.clone();
		let mut shutdown = shutdown_rx.clone();
		tokio::spawn(async move {
			loop {
				let interval = config.read().payout_config.payout_interval_secs;
				tokio::select! {
					_ = shutdown.changed() => return,
					_ = tokio::time::sleep(Duration::from_secs(interval)) => {
						let accounting = accounting.clone();
						let scheduled = tokio::task::spawn_blocking(move || {
							accounting.process_payouts(Utc::now())
						})
						.await;
						match scheduled {
							Ok(count) if count > 0 => info!("scheduled {} payouts", count),
							Ok(_) => {}
							Err(e) => error!("payout task died: {}", e),
						}
					}
				}
			}
		});
	}

	// park until asked to stop
	let mut shutdown = shutdown_rx;
	while !*shutdown.borrow() {
		if shutdown.changed().await.is_err() {
			break;
		}
	}
	info!("pool server shutting down");
}
