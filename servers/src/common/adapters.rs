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

//! The interfaces the pool consumes from its collaborators: the chain node
//! that hands out block templates and accepts assembled blocks, and the
//! wallet that settles miner credit on chain. Both are synchronous traits;
//! callers dispatch them from blocking-friendly tasks and never under the
//! shared-state lock.

use crate::core::Hash;

/// Everything needed to construct mining jobs for the next block. The
/// coinbase carries a reserved gap at `extranonce_offset` where the pool
/// splices `extranonce1 ‖ extranonce2`; the offset is template-dependent
/// and always comes from here.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
	/// Header version to mine with.
	pub version: u32,
	/// The tip this template builds on.
	pub prev_hash: Hash,
	/// Compact network target.
	pub bits: u32,
	/// Height of the block being mined.
	pub height: u64,
	/// Median-time lower bound for header timestamps.
	pub min_time: u32,
	/// The node's current time, the ntime workers start from.
	pub curtime: u32,
	/// Total coinbase payout the template claims.
	pub coinbase_value: u64,
	/// Serialized coinbase transaction with the extranonce gap removed.
	pub coinbase_tx: Vec<u8>,
	/// Byte offset in `coinbase_tx` where the extranonce is spliced in.
	pub extranonce_offset: usize,
	/// Txids of the non-coinbase transactions, in block order.
	pub txids: Vec<Hash>,
	/// The raw non-coinbase transactions, same order as `txids`.
	pub transactions: Vec<Vec<u8>>,
}

/// The chain's verdict on a submitted block.
#[derive(Debug, Clone)]
pub struct BlockAcceptance {
	/// Whether the block was accepted into the chain.
	pub accepted: bool,
	/// The node's reason when it was not.
	pub reject_reason: Option<String>,
}

/// Upstream failure talking to the chain node. Never surfaced to mining
/// clients; the director keeps serving the last valid job and retries.
#[derive(Debug, Clone)]
pub struct ChainError(pub String);

impl std::fmt::Display for ChainError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "chain node: {}", self.0)
	}
}

/// The chain node the pool mines against.
pub trait ChainNode: Send + Sync {
	/// Fetch a fresh block template paying the pool address.
	fn get_template(&self, pool_payout_address: &str) -> Result<BlockTemplate, ChainError>;

	/// Submit a fully serialized block.
	fn submit_block(&self, block: &[u8]) -> Result<BlockAcceptance, ChainError>;

	/// The network difficulty at the current tip.
	fn network_difficulty(&self) -> Result<u64, ChainError>;
}

/// A new chain tip the template task should react to.
#[derive(Debug, Clone, Copy)]
pub struct NewTip {
	/// Height of the new tip.
	pub height: u64,
	/// Hash of the new tip.
	pub hash: Hash,
}

/// A broadcast attempt the wallet made for a payment.
#[derive(Debug, Clone)]
pub struct WalletTx {
	/// On-chain transaction hash.
	pub tx_hash: Hash,
	/// Whether the transaction reached the network.
	pub broadcast_ok: bool,
}

/// Failure building or broadcasting a settlement transaction.
#[derive(Debug, Clone)]
pub struct WalletError(pub String);

impl std::fmt::Display for WalletError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "wallet: {}", self.0)
	}
}

/// The payout transaction builder.
pub trait Wallet: Send + Sync {
	/// Build, sign and broadcast a payment.
	fn send(&self, to_address: &str, amount: u64) -> Result<WalletTx, WalletError>;
}

/// Confirmation events the wallet reports back asynchronously.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WalletEvent {
	/// The transaction confirmed on chain.
	Confirmed(Hash),
	/// The transaction failed and will never confirm.
	Failed(Hash),
}
