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

//! Mining Stratum Server
//!
//! The session authority: owns the set of live connections, drives the
//! per-connection state machine NEW → SUBSCRIBED → AUTHORIZED, and is the
//! only code path that mutates worker bindings. Each session is one task
//! reading line-delimited JSON and one bounded outbound queue; everything
//! the session sends out flows through that queue so difficulty changes
//! always precede the job notifications that follow them.

use crate::common::types::{BlockCandidate, Error, PoolConfig, ShareAccepted};
use crate::core::pow::Difficulty;
use crate::mining::director::{Job, JobDirector};
use crate::mining::ledger::{AuthError, RejectReason, ShareLedger, SubmitContext, SubmitKey};
use crate::mining::proto::{self, MinerMessage, RpcId, SubmitShare};
use crate::util::{from_hex, Mutex, RwLock, ToHex};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Notify};
use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig as TlsServerConfig};
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

/// What the server calls itself in `client.get_version` replies.
const SERVER_VERSION: &str = concat!("orepool/", env!("CARGO_PKG_VERSION"));

/// Protocol errors tolerated inside the strike window before closing.
const MAX_PROTOCOL_ERRORS: usize = 5;

/// The protocol error strike window, seconds.
const PROTOCOL_ERROR_WINDOW_SECS: i64 = 60;

// ----------------------------------------
// Outbound queue

/// One message queued toward a session. Responses are never shed;
/// notifications are, oldest first, when the queue overflows.
#[derive(Debug)]
enum Outbound {
	Response(String),
	SetDifficulty(String),
	Notify { line: String, clean: bool },
}

impl Outbound {
	fn into_line(self) -> String {
		match self {
			Outbound::Response(line) => line,
			Outbound::SetDifficulty(line) => line,
			Outbound::Notify { line, .. } => line,
		}
	}
}

struct QueueInner {
	queue: VecDeque<Outbound>,
	closed: bool,
}

/// Bounded per-session write queue. FIFO, so a difficulty change queued
/// before a notify is delivered before it. Overflow sheds the oldest
/// notification while responses survive; losing a clean-jobs notify closes
/// the session instead, a client must never mine stale work unknowingly.
struct OutboundQueue {
	inner: Mutex<QueueInner>,
	notify: Notify,
	depth: usize,
}

impl OutboundQueue {
	fn new(depth: usize) -> OutboundQueue {
		OutboundQueue {
			inner: Mutex::new(QueueInner {
				queue: VecDeque::new(),
				closed: false,
			}),
			notify: Notify::new(),
			depth,
		}
	}

	fn push(&self, msg: Outbound) {
		{
			let mut inner = self.inner.lock();
			if inner.closed {
				return;
			}
			if inner.queue.len() >= self.depth {
				let victim = inner
					.queue
					.iter()
					.position(|m| !matches!(m, Outbound::Response(_)));
				match victim {
					Some(pos) => {
						if let Some(Outbound::Notify { clean: true, .. }) =
							inner.queue.remove(pos)
						{
							inner.closed = true;
							inner.queue.clear();
							drop(inner);
							self.notify.notify_waiters();
							return;
						}
					}
					None => {
						// nothing sheddable, the queue is all responses;
						// keep the pairs and let it grow past the bound
					}
				}
			}
			inner.queue.push_back(msg);
		}
		self.notify.notify_waiters();
	}

	async fn pop(&self) -> Option<String> {
		loop {
			// register interest before checking, or a push between the
			// check and the await is lost
			let notified = self.notify.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();
			{
				let mut inner = self.inner.lock();
				if let Some(msg) = inner.queue.pop_front() {
					return Some(msg.into_line());
				}
				if inner.closed {
					return None;
				}
			}
			notified.await;
		}
	}

	fn close(&self) {
		self.inner.lock().closed = true;
		self.notify.notify_waiters();
	}

	/// Wait until the queue has been closed.
	async fn wait_closed(&self) {
		loop {
			let notified = self.notify.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();
			if self.inner.lock().closed {
				return;
			}
			notified.await;
		}
	}

	#[cfg(test)]
	fn pop_now(&self) -> Option<String> {
		self.inner.lock().queue.pop_front().map(|m| m.into_line())
	}

	#[cfg(test)]
	fn is_closed(&self) -> bool {
		self.inner.lock().closed
	}

	#[cfg(test)]
	fn len(&self) -> usize {
		self.inner.lock().queue.len()
	}
}

// ----------------------------------------
// Sessions

/// Where a session sits in the Stratum handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
	New,
	Subscribed,
	Authorized,
}

struct Session {
	ip: IpAddr,
	state: SessionState,
	extranonce1: Vec<u8>,
	extranonce1_hex: String,
	miner_id: Option<u64>,
	worker_id: Option<u64>,
	queue: Arc<OutboundQueue>,
	last_seen: DateTime<Utc>,
	protocol_errors: VecDeque<DateTime<Utc>>,
}

/// The connection table. Session ids increase monotonically, which keeps
/// every live session's extranonce1 unique for the life of the process.
struct SessionList {
	sessions: RwLock<HashMap<u64, Session>>,
	next_session_id: AtomicU64,
}

impl SessionList {
	fn new() -> SessionList {
		SessionList {
			sessions: RwLock::new(HashMap::new()),
			next_session_id: AtomicU64::new(1),
		}
	}

	fn add(&self, ip: IpAddr, queue_depth: usize, now: DateTime<Utc>) -> u64 {
		let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
		let extranonce1 = (session_id as u32).to_be_bytes().to_vec();
		let extranonce1_hex = extranonce1.to_hex();
		let session = Session {
			ip,
			state: SessionState::New,
			extranonce1,
			extranonce1_hex,
			miner_id: None,
			worker_id: None,
			queue: Arc::new(OutboundQueue::new(queue_depth)),
			last_seen: now,
			protocol_errors: VecDeque::new(),
		};
		self.sessions.write().insert(session_id, session);
		session_id
	}

	fn remove(&self, session_id: u64) -> Option<(Option<u64>, Arc<OutboundQueue>)> {
		self.sessions
			.write()
			.remove(&session_id)
			.map(|s| (s.worker_id, s.queue))
	}

	fn queue(&self, session_id: u64) -> Option<Arc<OutboundQueue>> {
		self.sessions
			.read()
			.get(&session_id)
			.map(|s| s.queue.clone())
	}

	fn count(&self) -> usize {
		self.sessions.read().len()
	}

	fn count_for_ip(&self, ip: &IpAddr) -> usize {
		self.sessions
			.read()
			.values()
			.filter(|s| s.ip == *ip)
			.count()
	}

	fn touch(&self, session_id: u64, now: DateTime<Utc>) {
		if let Some(s) = self.sessions.write().get_mut(&session_id) {
			s.last_seen = now;
		}
	}

	/// Record a protocol error; true when the session blew its allowance.
	fn strike(&self, session_id: u64, now: DateTime<Utc>) -> bool {
		let mut sessions = self.sessions.write();
		let session = match sessions.get_mut(&session_id) {
			Some(s) => s,
			None => return true,
		};
		let window = ChronoDuration::seconds(PROTOCOL_ERROR_WINDOW_SECS);
		session.protocol_errors.push_back(now);
		while session
			.protocol_errors
			.front()
			.map(|t| now - *t > window)
			.unwrap_or(false)
		{
			session.protocol_errors.pop_front();
		}
		session.protocol_errors.len() > MAX_PROTOCOL_ERRORS
	}

	fn push_to(&self, session_id: u64, msg: Outbound) {
		if let Some(s) = self.sessions.read().get(&session_id) {
			s.queue.push(msg);
		}
	}

	fn close(&self, session_id: u64) {
		if let Some(s) = self.sessions.read().get(&session_id) {
			s.queue.close();
		}
	}

	/// Sessions with no traffic inside the timeout.
	fn idle(&self, timeout_secs: u64, now: DateTime<Utc>) -> Vec<u64> {
		self.sessions
			.read()
			.iter()
			.filter(|(_, s)| (now - s.last_seen).num_seconds() > timeout_secs as i64)
			.map(|(id, _)| *id)
			.collect()
	}

	/// Queue a job toward every authorized session.
	fn broadcast_job(&self, line: &str, clean: bool) {
		for session in self.sessions.read().values() {
			if session.state == SessionState::Authorized {
				session.queue.push(Outbound::Notify {
					line: line.to_string(),
					clean,
				});
			}
		}
	}
}

// ----------------------------------------
// Handler

/// Dispatches parsed messages against the shared state. One instance is
/// shared by every session task.
pub struct Handler {
	config: Arc<RwLock<PoolConfig>>,
	ledger: Arc<ShareLedger>,
	director: Arc<JobDirector>,
	sessions: SessionList,
	share_tx: mpsc::UnboundedSender<ShareAccepted>,
	block_tx: mpsc::UnboundedSender<BlockCandidate>,
}

impl Handler {
	/// Wire a handler up to the shared components and the event streams.
	pub fn new(
		config: Arc<RwLock<PoolConfig>>,
		ledger: Arc<ShareLedger>,
		director: Arc<JobDirector>,
		share_tx: mpsc::UnboundedSender<ShareAccepted>,
		block_tx: mpsc::UnboundedSender<BlockCandidate>,
	) -> Handler {
		Handler {
			config,
			ledger,
			director,
			sessions: SessionList::new(),
			share_tx,
			block_tx,
		}
	}

	/// Live session count, for stats.
	pub fn session_count(&self) -> usize {
		self.sessions.count()
	}

	/// Push the current job to every authorized session.
	pub fn broadcast_job(&self, job: &Job) {
		debug!("broadcast job {} height {}", job.job_id, job.height);
		let line = proto::notify_line(&job.notify_params());
		self.sessions.broadcast_job(&line, job.clean_jobs);
	}

	/// Handle one line from a session. Returns false when the session must
	/// close.
	fn handle_message(&self, session_id: u64, line: &str) -> bool {
		let now = Utc::now();
		self.sessions.touch(session_id, now);

		let extranonce2_size = self.config.read().stratum_config.extranonce2_size;
		let (id, message) = match proto::parse(line, extranonce2_size) {
			Ok(parsed) => parsed,
			Err((id, parse_error)) => {
				debug!("session {}: protocol error: {:?}", session_id, parse_error);
				self.sessions.push_to(
					session_id,
					Outbound::Response(proto::err_line(
						&id,
						proto::ERR_OTHER,
						&parse_error.message(),
					)),
				);
				return !self.sessions.strike(session_id, now);
			}
		};

		match message {
			MinerMessage::Subscribe { user_agent } => {
				self.handle_subscribe(session_id, id, user_agent)
			}
			MinerMessage::Authorize { username, password } => {
				self.handle_authorize(session_id, id, &username, &password, now)
			}
			MinerMessage::Submit(submit) => self.handle_submit(session_id, id, submit, now),
			MinerMessage::GetVersion => {
				self.sessions
					.push_to(session_id, Outbound::Response(proto::ok_line(&id, json!(SERVER_VERSION))));
				true
			}
		}
	}

	fn handle_subscribe(
		&self,
		session_id: u64,
		id: Option<RpcId>,
		user_agent: Option<String>,
	) -> bool {
		let extranonce2_size = self.config.read().stratum_config.extranonce2_size;
		let mut sessions = self.sessions.sessions.write();
		let session = match sessions.get_mut(&session_id) {
			Some(s) => s,
			None => return false,
		};
		// a duplicate subscribe answers with the prior values
		if session.state == SessionState::New {
			session.state = SessionState::Subscribed;
			debug!(
				"session {} subscribed ({})",
				session_id,
				user_agent.as_deref().unwrap_or("unknown agent")
			);
		}
		let result =
			proto::subscribe_result(&session.extranonce1_hex, &session.extranonce1_hex, extranonce2_size);
		session
			.queue
			.push(Outbound::Response(proto::ok_line(&id, result)));
		true
	}

	fn handle_authorize(
		&self,
		session_id: u64,
		id: Option<RpcId>,
		username: &str,
		_password: &str,
		now: DateTime<Utc>,
	) -> bool {
		let (state, ip) = {
			let sessions = self.sessions.sessions.read();
			match sessions.get(&session_id) {
				Some(s) => (s.state, s.ip),
				None => return false,
			}
		};
		match state {
			SessionState::New => {
				self.sessions.push_to(
					session_id,
					Outbound::Response(proto::err_line(&id, proto::ERR_OTHER, "Other/Unknown")),
				);
				return true;
			}
			SessionState::Authorized => {
				// the session already carries a worker binding
				self.sessions
					.push_to(session_id, Outbound::Response(proto::ok_line(&id, json!(true))));
				return true;
			}
			SessionState::Subscribed => {}
		}

		let (account, worker_name) = match username.split_once('.') {
			Some((account, worker)) => (account, worker),
			None => (username, "default"),
		};

		match self.ledger.authorize(account, worker_name, ip, session_id, now) {
			Ok(grant) => {
				{
					let mut sessions = self.sessions.sessions.write();
					if let Some(s) = sessions.get_mut(&session_id) {
						s.state = SessionState::Authorized;
						s.miner_id = Some(grant.miner_id);
						s.worker_id = Some(grant.worker_id);
					}
				}
				info!(
					"session {}: authorized {}.{} as worker {}",
					session_id, account, worker_name, grant.worker_id
				);
				self.sessions
					.push_to(session_id, Outbound::Response(proto::ok_line(&id, json!(true))));
				self.sessions.push_to(
					session_id,
					Outbound::SetDifficulty(proto::set_difficulty_line(grant.difficulty)),
				);
				if let Some(job) = self.director.current() {
					self.sessions.push_to(
						session_id,
						Outbound::Notify {
							line: proto::notify_line(&job.notify_params()),
							clean: job.clean_jobs,
						},
					);
				}
				true
			}
			Err(auth_error) => {
				debug!(
					"session {}: authorize {} refused: {:?}",
					session_id, username, auth_error
				);
				self.sessions.push_to(
					session_id,
					Outbound::Response(proto::err_line(
						&id,
						proto::ERR_UNAUTHORIZED,
						"Unauthorized worker",
					)),
				);
				match auth_error {
					AuthError::Banned => false,
					_ => true,
				}
			}
		}
	}

	fn handle_submit(
		&self,
		session_id: u64,
		id: Option<RpcId>,
		submit: SubmitShare,
		now: DateTime<Utc>,
	) -> bool {
		let (state, extranonce1, extranonce1_hex, miner_id, worker_id) = {
			let sessions = self.sessions.sessions.read();
			match sessions.get(&session_id) {
				Some(s) => (
					s.state,
					s.extranonce1.clone(),
					s.extranonce1_hex.clone(),
					s.miner_id,
					s.worker_id,
				),
				None => return false,
			}
		};
		match state {
			SessionState::New => {
				self.sessions.push_to(
					session_id,
					Outbound::Response(proto::err_line(&id, proto::ERR_OTHER, "Other/Unknown")),
				);
				return true;
			}
			SessionState::Subscribed => {
				self.sessions.push_to(
					session_id,
					Outbound::Response(proto::err_line(
						&id,
						proto::ERR_UNAUTHORIZED,
						"Unauthorized worker",
					)),
				);
				return true;
			}
			SessionState::Authorized => {}
		}
		let (miner_id, worker_id) = match (miner_id, worker_id) {
			(Some(m), Some(w)) => (m, w),
			_ => return false,
		};

		self.ledger.touch_worker(worker_id, now);

		let job = match self.director.find(&submit.job_id, now) {
			Some(job) => job,
			None => {
				debug!(
					"session {}: share for unknown or expired job {}",
					session_id, submit.job_id
				);
				let banned = self.ledger.note_stale(worker_id, now);
				self.sessions.push_to(
					session_id,
					Outbound::Response(proto::err_line(
						&id,
						proto::ERR_JOB_NOT_FOUND,
						"Job not found",
					)),
				);
				if banned {
					self.disconnect_miner(miner_id);
				}
				return true;
			}
		};

		let extranonce2 = match from_hex(&submit.extranonce2) {
			Ok(bytes) => bytes,
			Err(_) => {
				// widths were checked at parse, this cannot normally fail
				self.sessions.push_to(
					session_id,
					Outbound::Response(proto::err_line(
						&id,
						proto::ERR_OTHER,
						"Invalid params: extranonce2",
					)),
				);
				return true;
			}
		};

		let (hash, header, coinbase) = match self.director.reconstruct(
			&job,
			&extranonce1,
			&extranonce2,
			submit.ntime,
			submit.nonce,
			now.timestamp() as u32,
		) {
			Ok(reconstructed) => reconstructed,
			Err(time_error) => {
				debug!(
					"session {}: share with bad ntime on job {}: {:?}",
					session_id, submit.job_id, time_error
				);
				self.sessions.push_to(
					session_id,
					Outbound::Response(proto::err_line(&id, proto::ERR_OTHER, "Invalid time")),
				);
				return true;
			}
		};

		let share_difficulty = Difficulty::from_hash(&hash).to_num();
		let meets_network = job.target.is_met_by(&hash);
		let key = SubmitKey {
			job_id: submit.job_id.clone(),
			extranonce1: extranonce1_hex,
			extranonce2: submit.extranonce2.clone(),
			ntime: submit.ntime,
			nonce: submit.nonce,
		};
		let context = SubmitContext {
			key,
			hash,
			share_difficulty,
			meets_network,
			height: job.height,
			network_difficulty: job.network_difficulty,
			job_created_at: job.created_at,
		};

		match self.ledger.record_share(worker_id, context, now) {
			Ok((accepted, new_difficulty)) => {
				info!(
					"got share at height {}, hash {}, job {}, difficulty {}/{}, submitted by {}",
					job.height, hash, submit.job_id, share_difficulty, accepted.difficulty,
					submit.worker_name,
				);
				self.sessions
					.push_to(session_id, Outbound::Response(proto::ok_line(&id, json!(true))));
				if let Some(difficulty) = new_difficulty {
					self.sessions.push_to(
						session_id,
						Outbound::SetDifficulty(proto::set_difficulty_line(difficulty)),
					);
				}
				let is_block = accepted.is_block;
				let _ = self.share_tx.send(accepted);
				if is_block {
					warn!(
						"solution found for height {}, hash {}, worker {} - submitting block",
						job.height, hash, worker_id
					);
					let _ = self.block_tx.send(BlockCandidate {
						job_id: submit.job_id,
						height: job.height,
						hash,
						header,
						coinbase,
						transactions: job.transactions.clone(),
						reward: job.coinbase_value,
						finder_miner_id: miner_id,
						finder_worker_id: worker_id,
					});
				}
				true
			}
			Err(rejected) => {
				let (code, message) = match rejected.reason {
					RejectReason::Duplicate => (proto::ERR_DUPLICATE_SHARE, "Duplicate share"),
					RejectReason::LowDifficulty { .. } => {
						(proto::ERR_LOW_DIFFICULTY, "Low difficulty share")
					}
					RejectReason::Stale => (proto::ERR_JOB_NOT_FOUND, "Job not found"),
				};
				debug!(
					"session {}: share rejected ({}) on job {}",
					session_id, message, submit.job_id
				);
				self.sessions
					.push_to(session_id, Outbound::Response(proto::err_line(&id, code, message)));
				if let Some(difficulty) = rejected.new_difficulty {
					self.sessions.push_to(
						session_id,
						Outbound::SetDifficulty(proto::set_difficulty_line(difficulty)),
					);
				}
				if rejected.miner_banned {
					warn!("miner {} banned for excessive invalid shares", miner_id);
					self.disconnect_miner(miner_id);
					return false;
				}
				true
			}
		}
	}

	pub(crate) fn disconnect_miner(&self, miner_id: u64) {
		for session_id in self.ledger.miner_sessions(miner_id) {
			self.sessions.close(session_id);
		}
	}

	/// The 30 second sweep: close idle sessions, push retargets for
	/// workers the per-share trigger cannot reach.
	pub fn sweep(&self, now: DateTime<Utc>) {
		let timeout = self.config.read().stratum_config.connection_timeout_secs;
		for session_id in self.sessions.idle(timeout, now) {
			debug!("session {} idle beyond {}s, closing", session_id, timeout);
			self.sessions.close(session_id);
		}
		for push in self.ledger.retarget_idle(now) {
			self.sessions.push_to(
				push.session_id,
				Outbound::SetDifficulty(proto::set_difficulty_line(push.difficulty)),
			);
		}
	}

	fn teardown(&self, session_id: u64) {
		if let Some((worker_id, queue)) = self.sessions.remove(session_id) {
			queue.close();
			if let Some(worker_id) = worker_id {
				self.ledger.remove_worker(worker_id);
			}
		}
	}
}

// ----------------------------------------
// Connection handling

/// Load a TLS acceptor from PEM certificate and key files.
pub fn load_tls_acceptor(cert_file: &str, key_file: &str) -> Result<TlsAcceptor, Error> {
	let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_file)?))
		.map_err(|e| Error::Tls(format!("reading {}: {}", cert_file, e)))?
		.into_iter()
		.map(Certificate)
		.collect::<Vec<_>>();
	let mut keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(File::open(key_file)?))
		.map_err(|e| Error::Tls(format!("reading {}: {}", key_file, e)))?;
	if keys.is_empty() {
		return Err(Error::Tls(format!("no private key in {}", key_file)));
	}
	let tls_config = TlsServerConfig::builder()
		.with_safe_defaults()
		.with_no_client_auth()
		.with_single_cert(certs, PrivateKey(keys.remove(0)))
		.map_err(|e| Error::Tls(e.to_string()))?;
	Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// Accept connections until shutdown. Refuses over-limit and blocked
/// addresses at accept time; everything else becomes a session task.
pub async fn accept_connections(
	handler: Arc<Handler>,
	listen_addr: SocketAddr,
	tls: Option<TlsAcceptor>,
	mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error> {
	let listener = TcpListener::bind(&listen_addr).await?;
	info!("stratum server listening on {}", listen_addr);

	loop {
		let accepted = tokio::select! {
			_ = shutdown.changed() => break,
			accepted = listener.accept() => accepted,
		};
		let (socket, peer_addr) = match accepted {
			Ok(pair) => pair,
			Err(e) => {
				error!("accept error: {}", e);
				continue;
			}
		};
		let ip = peer_addr.ip();
		let now = Utc::now();
		let max_per_ip = handler.config.read().stratum_config.max_connections_per_ip;
		if handler.sessions.count_for_ip(&ip) >= max_per_ip {
			debug!("refusing connection from {}: per-ip limit", ip);
			continue;
		}
		if handler.ledger.is_ip_blocked(&ip, now) {
			debug!("refusing connection from blocked address {}", ip);
			continue;
		}

		let handler = handler.clone();
		let tls = tls.clone();
		let shutdown = shutdown.clone();
		tokio::spawn(async move {
			match tls {
				Some(acceptor) => match acceptor.accept(socket).await {
					Ok(stream) => run_session(handler, stream, ip, shutdown).await,
					Err(e) => debug!("TLS handshake with {} failed: {}", ip, e),
				},
				None => run_session(handler, socket, ip, shutdown).await,
			}
		});
	}
	info!("stratum listener on {} shut down", listen_addr);
	Ok(())
}

/// One session: a framed read loop and a queue-drained write task over the
/// same socket. The read side processes strictly in order, which gives
/// every session its serial submit-after-authorize guarantee.
async fn run_session<S>(
	handler: Arc<Handler>,
	stream: S,
	ip: IpAddr,
	mut shutdown: watch::Receiver<bool>,
) where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let now = Utc::now();
	let queue_depth = handler.config.read().stratum_config.write_queue_depth;
	let session_id = handler.sessions.add(ip, queue_depth, now);
	let queue = match handler.sessions.queue(session_id) {
		Some(q) => q,
		None => return,
	};
	debug!("session {} connected from {}", session_id, ip);

	let framed = Framed::new(stream, LinesCodec::new_with_max_length(proto::MAX_LINE_LENGTH));
	let (mut sink, mut lines) = framed.split();

	let write_queue = queue.clone();
	let writer = tokio::spawn(async move {
		while let Some(line) = write_queue.pop().await {
			if sink.send(line).await.is_err() {
				write_queue.close();
				break;
			}
		}
	});

	loop {
		tokio::select! {
			_ = shutdown.changed() => break,
			_ = queue.wait_closed() => break,
			line = lines.next() => match line {
				Some(Ok(line)) => {
					if !handler.handle_message(session_id, &line) {
						break;
					}
				}
				Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
					warn!("session {}: line beyond {} bytes, closing", session_id, proto::MAX_LINE_LENGTH);
					break;
				}
				Some(Err(_)) | None => break,
			},
		}
	}

	handler.teardown(session_id);
	let _ = writer.await;
	debug!("session {} disconnected", session_id);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::common::adapters::BlockTemplate;
	use crate::core::hash::sha256d;

	fn test_handler() -> (
		Arc<Handler>,
		mpsc::UnboundedReceiver<ShareAccepted>,
		mpsc::UnboundedReceiver<BlockCandidate>,
	) {
		let config = Arc::new(RwLock::new(PoolConfig::default()));
		let ledger = Arc::new(ShareLedger::new(config.clone()));
		let director = Arc::new(JobDirector::new(config.clone()));
		let (share_tx, share_rx) = mpsc::unbounded_channel();
		let (block_tx, block_rx) = mpsc::unbounded_channel();
		let handler = Arc::new(Handler::new(config, ledger, director, share_tx, block_tx));
		(handler, share_rx, block_rx)
	}

	fn install_job(handler: &Handler) -> String {
		let coinbase_tx: Vec<u8> = (0u8..20).collect();
		let template = BlockTemplate {
			version: 0x2000_0000,
			prev_hash: sha256d(b"tip"),
			bits: 0x1d00ffff,
			height: 100,
			min_time: 1_700_000_000,
			curtime: 1_700_000_600,
			coinbase_value: 50 * 100_000_000,
			coinbase_tx,
			extranonce_offset: 12,
			txids: vec![],
			transactions: vec![],
		};
		let job = handler
			.director
			.make_job(&template, Utc::now())
			.unwrap();
		let job = handler.director.install(job);
		job.job_id.clone()
	}

	fn new_session(handler: &Handler) -> u64 {
		handler
			.sessions
			.add("127.0.0.1".parse().unwrap(), 256, Utc::now())
	}

	fn reply(handler: &Handler, session_id: u64) -> serde_json::Value {
		let line = handler
			.sessions
			.queue(session_id)
			.unwrap()
			.pop_now()
			.expect("expected a queued message");
		serde_json::from_str(&line).unwrap()
	}

	#[test]
	fn subscribe_then_authorize_flow() {
		let (handler, _, _) = test_handler();
		install_job(&handler);
		let session = new_session(&handler);

		assert!(handler.handle_message(
			session,
			r#"{"id":1,"method":"mining.subscribe","params":["miner/1.0"]}"#
		));
		let sub = reply(&handler, session);
		assert_eq!(sub["id"], 1);
		assert_eq!(sub["error"], serde_json::Value::Null);
		let extranonce1 = sub["result"][1].as_str().unwrap().to_string();
		assert_eq!(extranonce1.len(), 8);
		assert_eq!(sub["result"][2], 4);

		assert!(handler.handle_message(
			session,
			r#"{"id":2,"method":"mining.authorize","params":["addr1.rig1","x"]}"#
		));
		let auth = reply(&handler, session);
		assert_eq!(auth["result"], true);

		// set_difficulty is pushed before the notify
		let diff = reply(&handler, session);
		assert_eq!(diff["method"], "mining.set_difficulty");
		assert_eq!(diff["params"][0], 1024);
		let notify = reply(&handler, session);
		assert_eq!(notify["method"], "mining.notify");
		assert_eq!(notify["id"], serde_json::Value::Null);
	}

	#[test]
	fn duplicate_subscribe_replies_with_prior_values() {
		let (handler, _, _) = test_handler();
		let session = new_session(&handler);

		handler.handle_message(session, r#"{"id":1,"method":"mining.subscribe","params":[]}"#);
		let first = reply(&handler, session);
		handler.handle_message(session, r#"{"id":5,"method":"mining.subscribe","params":[]}"#);
		let second = reply(&handler, session);
		assert_eq!(first["result"][1], second["result"][1]);
	}

	#[test]
	fn messages_in_new_state_get_error_20() {
		let (handler, _, _) = test_handler();
		let session = new_session(&handler);

		handler.handle_message(
			session,
			r#"{"id":2,"method":"mining.authorize","params":["a.b","x"]}"#,
		);
		let resp = reply(&handler, session);
		assert_eq!(resp["error"][0], 20);

		handler.handle_message(
			session,
			r#"{"id":3,"method":"mining.submit","params":["w","j","00000000","65f1a2b3","00000000"]}"#,
		);
		let resp = reply(&handler, session);
		assert_eq!(resp["error"][0], 20);
	}

	#[test]
	fn submit_before_authorize_gets_error_24() {
		let (handler, _, _) = test_handler();
		let session = new_session(&handler);
		handler.handle_message(session, r#"{"id":1,"method":"mining.subscribe","params":[]}"#);
		reply(&handler, session);

		handler.handle_message(
			session,
			r#"{"id":3,"method":"mining.submit","params":["w","j","00000000","65f1a2b3","00000000"]}"#,
		);
		let resp = reply(&handler, session);
		assert_eq!(resp["error"][0], 24);
	}

	#[test]
	fn unknown_job_gets_error_21_and_low_difficulty_23() {
		let (handler, _, _) = test_handler();
		let job_id = install_job(&handler);
		let session = new_session(&handler);
		handler.handle_message(session, r#"{"id":1,"method":"mining.subscribe","params":[]}"#);
		reply(&handler, session);
		handler.handle_message(
			session,
			r#"{"id":2,"method":"mining.authorize","params":["addr1.rig1","x"]}"#,
		);
		reply(&handler, session);
		reply(&handler, session); // set_difficulty
		reply(&handler, session); // notify

		// bogus job id
		handler.handle_message(
			session,
			r#"{"id":3,"method":"mining.submit","params":["addr1.rig1","ffffffff","00000000","65f1a2b3","00000000"]}"#,
		);
		let resp = reply(&handler, session);
		assert_eq!(resp["error"][0], 21);

		// real job, but a random nonce will not meet difficulty 1024
		let submit = format!(
			r#"{{"id":4,"method":"mining.submit","params":["addr1.rig1","{}","00000000","65f1a2b8","00000001"]}}"#,
			job_id
		);
		handler.handle_message(session, &submit);
		let resp = reply(&handler, session);
		assert_eq!(resp["error"][0], 23);

		// the exact same tuple again is now a duplicate
		handler.handle_message(session, &submit);
		let resp = reply(&handler, session);
		assert_eq!(resp["error"][0], 22);
	}

	#[test]
	fn unknown_method_gets_error_20() {
		let (handler, _, _) = test_handler();
		let session = new_session(&handler);
		handler.handle_message(session, r#"{"id":9,"method":"mining.configure","params":[]}"#);
		let resp = reply(&handler, session);
		assert_eq!(resp["error"][0], 20);
	}

	#[test]
	fn repeated_protocol_errors_close_the_session() {
		let (handler, _, _) = test_handler();
		let session = new_session(&handler);
		for _ in 0..MAX_PROTOCOL_ERRORS {
			assert!(handler.handle_message(session, "{broken"));
		}
		assert!(!handler.handle_message(session, "{broken"));
	}

	#[test]
	fn queue_sheds_oldest_notification_but_keeps_responses() {
		let queue = OutboundQueue::new(3);
		queue.push(Outbound::Response("r1".to_string()));
		queue.push(Outbound::Notify {
			line: "n1".to_string(),
			clean: false,
		});
		queue.push(Outbound::SetDifficulty("d1".to_string()));
		// overflow: n1 is the oldest sheddable message
		queue.push(Outbound::Response("r2".to_string()));
		assert_eq!(queue.len(), 3);
		assert_eq!(queue.pop_now().unwrap(), "r1");
		assert_eq!(queue.pop_now().unwrap(), "d1");
		assert_eq!(queue.pop_now().unwrap(), "r2");
	}

	#[test]
	fn queue_closes_when_a_clean_notify_would_drop() {
		let queue = OutboundQueue::new(2);
		queue.push(Outbound::Notify {
			line: "n1".to_string(),
			clean: true,
		});
		queue.push(Outbound::Response("r1".to_string()));
		queue.push(Outbound::Response("r2".to_string()));
		assert!(queue.is_closed());
	}

	#[test]
	fn queue_never_sheds_responses() {
		let queue = OutboundQueue::new(2);
		queue.push(Outbound::Response("r1".to_string()));
		queue.push(Outbound::Response("r2".to_string()));
		queue.push(Outbound::Response("r3".to_string()));
		assert_eq!(queue.len(), 3);
		assert!(!queue.is_closed());
	}

	#[test]
	fn get_version_replies_with_the_server_string() {
		let (handler, _, _) = test_handler();
		let session = new_session(&handler);
		handler.handle_message(session, r#"{"id":7,"method":"client.get_version","params":[]}"#);
		let resp = reply(&handler, session);
		assert_eq!(resp["result"].as_str().unwrap(), SERVER_VERSION);
	}
}
