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

//! Main for building the binary of the orepool mining pool server.
//!
//! Production deployments embed `orepool_servers::Server` with a real
//! `ChainNode`/`Wallet` integration for their chain; this binary wires the
//! server against a built-in devnet chain so the whole pipeline can be run
//! and mined against locally (`--dev`).

#[macro_use]
extern crate log;

use clap::{App, Arg};
use orepool_config as config;
use orepool_servers as servers;
use orepool_util as util;

use orepool_core::hash::{sha256d, Hash};
use servers::{
	BlockAcceptance, BlockTemplate, ChainError, ChainNode, NewTip, Server, Wallet, WalletError,
	WalletEvent, WalletTx,
};
use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use tokio::sync::mpsc as tokio_mpsc;
use util::RwLock;

/// A self-contained regtest-style chain for local runs: trivially easy
/// targets, every submitted block is accepted and becomes the new tip.
struct DevChainNode {
	tip: RwLock<(u64, Hash)>,
	tips_tx: tokio_mpsc::UnboundedSender<NewTip>,
}

/// Devnet difficulty bits, low enough that CPU miners find blocks.
const DEV_BITS: u32 = 0x207fffff;

impl DevChainNode {
	fn new(tips_tx: tokio_mpsc::UnboundedSender<NewTip>) -> DevChainNode {
		DevChainNode {
			tip: RwLock::new((0, sha256d(b"orepool devnet genesis"))),
			tips_tx,
		}
	}
}

impl ChainNode for DevChainNode {
	fn get_template(&self, pool_payout_address: &str) -> Result<BlockTemplate, ChainError> {
		let (height, prev_hash) = *self.tip.read();
		let now = chrono::Utc::now().timestamp() as u32;

		// a synthetic coinbase: header fields up to the scriptSig where
		// the extranonce gap sits, then outputs paying the pool address
		let mut coinbase_tx = Vec::new();
		coinbase_tx.extend_from_slice(&1u32.to_le_bytes());
		coinbase_tx.push(0x01);
		coinbase_tx.extend_from_slice(&[0u8; 32]);
		coinbase_tx.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
		coinbase_tx.extend_from_slice(&(height + 1).to_le_bytes());
		let extranonce_offset = coinbase_tx.len();
		coinbase_tx.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
		coinbase_tx.push(0x01);
		coinbase_tx.extend_from_slice(&orepool_core::consensus::block_reward(height + 1).to_le_bytes());
		coinbase_tx.extend_from_slice(pool_payout_address.as_bytes());
		coinbase_tx.extend_from_slice(&0u32.to_le_bytes());

		Ok(BlockTemplate {
			version: 0x2000_0000,
			prev_hash,
			bits: DEV_BITS,
			height: height + 1,
			min_time: now.saturating_sub(600),
			curtime: now,
			coinbase_value: orepool_core::consensus::block_reward(height + 1),
			coinbase_tx,
			extranonce_offset,
			txids: vec![],
			transactions: vec![],
		})
	}

	fn submit_block(&self, block: &[u8]) -> Result<BlockAcceptance, ChainError> {
		if block.len() < 80 {
			return Ok(BlockAcceptance {
				accepted: false,
				reject_reason: Some("truncated block".to_string()),
			});
		}
		let hash = sha256d(&block[..80]);
		let mut tip = self.tip.write();
		tip.0 += 1;
		tip.1 = hash;
		let _ = self.tips_tx.send(NewTip {
			height: tip.0,
			hash,
		});
		Ok(BlockAcceptance {
			accepted: true,
			reject_reason: None,
		})
	}

	fn network_difficulty(&self) -> Result<u64, ChainError> {
		orepool_core::Target::from_compact(DEV_BITS)
			.map(|t| t.to_difficulty().to_num())
			.map_err(|e| ChainError(format!("bad devnet bits: {:?}", e)))
	}
}

/// A wallet that confirms every payment instantly.
struct DevWallet {
	counter: AtomicU64,
	events_tx: tokio_mpsc::UnboundedSender<WalletEvent>,
}

impl Wallet for DevWallet {
	fn send(&self, to_address: &str, amount: u64) -> Result<WalletTx, WalletError> {
		let n = self.counter.fetch_add(1, Ordering::SeqCst);
		let tx_hash = sha256d(format!("{}:{}:{}", to_address, amount, n).as_bytes());
		let _ = self.events_tx.send(WalletEvent::Confirmed(tx_hash));
		Ok(WalletTx {
			tx_hash,
			broadcast_ok: true,
		})
	}
}

fn main() {
	let args = App::new("orepool")
		.version(env!("CARGO_PKG_VERSION"))
		.about("Stratum mining pool server")
		.arg(
			Arg::with_name("config")
				.short("c")
				.long("config")
				.help("Path to the configuration file")
				.takes_value(true),
		)
		.arg(
			Arg::with_name("dev")
				.long("dev")
				.help("Run against the built-in devnet chain and wallet"),
		)
		.get_matches();

	let config_path = args.value_of("config").map(PathBuf::from);
	let global_config = match config::initial_setup_server(config_path) {
		Ok(c) => c,
		Err(e) => {
			eprintln!("Failed to load configuration: {}", e);
			exit(1);
		}
	};
	util::init_logger(Some(global_config.members.logging.clone()));
	if let Some(path) = &global_config.config_file_path {
		info!("using configuration file at {}", path.display());
	}

	if !args.is_present("dev") {
		eprintln!(
			"No chain node backend is built into this binary; run with --dev for the \
			 built-in devnet, or embed orepool_servers::Server with your node's \
			 ChainNode/Wallet implementation."
		);
		exit(1);
	}
	warn!("running against the built-in devnet chain; shares and payouts are not real");

	let (tips_tx, tips_rx) = tokio_mpsc::unbounded_channel();
	let (wallet_events_tx, wallet_events_rx) = tokio_mpsc::unbounded_channel();
	let chain = Arc::new(DevChainNode::new(tips_tx));
	let wallet = Arc::new(DevWallet {
		counter: AtomicU64::new(1),
		events_tx: wallet_events_tx,
	});

	let server = Server::new(
		global_config.members.server.clone(),
		chain,
		wallet,
		tips_rx,
		wallet_events_rx,
	);
	if let Err(e) = server.start() {
		error!("pool server failed to start: {:?}", e);
		exit(1);
	}
	info!(
		"orepool {} serving stratum on {}",
		env!("CARGO_PKG_VERSION"),
		global_config.members.server.stratum_config.stratum_server_addr
	);

	// wait for ctrl-c, then wind everything down
	let (stop_tx, stop_rx) = mpsc::channel();
	ctrlc::set_handler(move || {
		let _ = stop_tx.send(());
	})
	.expect("Error setting ctrl-c handler");
	let _ = stop_rx.recv();

	warn!("stopping pool server");
	server.stop();
	println!("Shutdown complete.");
}
