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

//! Create a pool server against a mock chain node, connect a real TCP
//! worker and walk it through the Stratum handshake and the submit error
//! paths.

#[macro_use]
extern crate log;

use bufstream::BufStream;
use orepool_core::hash::sha256d;
use orepool_servers as servers;
use orepool_util as util;
use serde_json::Value;
use servers::{
	BlockAcceptance, BlockTemplate, ChainError, ChainNode, NewTip, PoolConfig, Server, Wallet,
	WalletError, WalletEvent, WalletTx,
};
use std::io::prelude::{BufRead, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;
use std::{thread, time};
use tokio::sync::mpsc;

struct MockChainNode;

impl ChainNode for MockChainNode {
	fn get_template(&self, _pool_payout_address: &str) -> Result<BlockTemplate, ChainError> {
		let coinbase_tx: Vec<u8> = (0u8..32).collect();
		Ok(BlockTemplate {
			version: 0x2000_0000,
			prev_hash: sha256d(b"integration tip"),
			// network difficulty 1: no random share will ever solve it
			bits: 0x1d00ffff,
			height: 1000,
			min_time: 1_700_000_000,
			curtime: 1_700_000_600,
			coinbase_value: 50 * 100_000_000,
			coinbase_tx,
			extranonce_offset: 20,
			txids: vec![sha256d(b"tx1")],
			transactions: vec![b"tx1".to_vec()],
		})
	}

	fn submit_block(&self, _block: &[u8]) -> Result<BlockAcceptance, ChainError> {
		Ok(BlockAcceptance {
			accepted: true,
			reject_reason: None,
		})
	}

	fn network_difficulty(&self) -> Result<u64, ChainError> {
		Ok(1)
	}
}

struct MockWallet;

impl Wallet for MockWallet {
	fn send(&self, to_address: &str, amount: u64) -> Result<WalletTx, WalletError> {
		Ok(WalletTx {
			tx_hash: sha256d(format!("{}:{}", to_address, amount).as_bytes()),
			broadcast_ok: true,
		})
	}
}

fn start_server(addr: &str) -> (Server, mpsc::UnboundedSender<NewTip>) {
	let mut config = PoolConfig::default();
	config.pool_name = "testpool".to_string();
	config.pool_payout_address = "pooladdr000000000000".to_string();
	config.stratum_config.stratum_server_addr = addr.to_string();
	let (tips_tx, tips_rx) = mpsc::unbounded_channel();
	let (_wallet_tx, wallet_rx) = mpsc::unbounded_channel::<WalletEvent>();
	let server = Server::new(
		config,
		Arc::new(MockChainNode),
		Arc::new(MockWallet),
		tips_rx,
		wallet_rx,
	);
	server.start().unwrap();
	(server, tips_tx)
}

fn connect(addr: &str) -> BufStream<TcpStream> {
	// wait for the listener to come up
	for _ in 0..100 {
		if let Ok(stream) = TcpStream::connect(addr) {
			stream
				.set_read_timeout(Some(Duration::from_secs(10)))
				.expect("Failed to set read timeout");
			return BufStream::new(stream);
		}
		thread::sleep(time::Duration::from_millis(100));
	}
	panic!("stratum server did not come up on {}", addr);
}

fn send(worker: &mut BufStream<TcpStream>, line: &str) {
	worker.write_all(line.as_bytes()).unwrap();
	worker.write_all(b"\n").unwrap();
	worker.flush().unwrap();
}

fn read_json(worker: &mut BufStream<TcpStream>) -> Value {
	let mut response = String::new();
	worker.read_line(&mut response).unwrap();
	serde_json::from_str(&response).unwrap()
}

#[test]
fn basic_stratum_server() {
	util::init_test_logger();
	let addr = "127.0.0.1:23416";
	let (server, _tips_tx) = start_server(addr);
	let mut worker = connect(addr);
	info!("stratum server connected");
	// give the template task a moment to install the first job
	thread::sleep(time::Duration::from_millis(500));

	// anything but subscribe on a fresh session is refused with 20
	send(
		&mut worker,
		r#"{"id":10,"method":"mining.authorize","params":["addr1.rig1","x"]}"#,
	);
	let r = read_json(&mut worker);
	assert_eq!(r["id"], 10);
	assert_eq!(r["error"][0], 20);

	// subscribe: [[[notify, sid], [set_difficulty, sid]], extranonce1, 4]
	send(
		&mut worker,
		r#"{"id":1,"method":"mining.subscribe","params":["miner/1.0"]}"#,
	);
	let r = read_json(&mut worker);
	assert_eq!(r["id"], 1);
	assert_eq!(r["error"], Value::Null);
	assert_eq!(r["result"][0][0][0], "mining.notify");
	assert_eq!(r["result"][0][1][0], "mining.set_difficulty");
	let extranonce1 = r["result"][1].as_str().unwrap().to_string();
	assert_eq!(extranonce1.len(), 8);
	assert_eq!(r["result"][2], 4);
	info!("subscribe verification ok");

	// authorize: true, then a set_difficulty push, then the current job
	send(
		&mut worker,
		r#"{"id":2,"method":"mining.authorize","params":["addr1.rig1","x"]}"#,
	);
	let r = read_json(&mut worker);
	assert_eq!(r["id"], 2);
	assert_eq!(r["result"], true);
	assert_eq!(r["error"], Value::Null);

	let diff = read_json(&mut worker);
	assert_eq!(diff["id"], Value::Null);
	assert_eq!(diff["method"], "mining.set_difficulty");
	assert_eq!(diff["params"][0], 1024);

	let notify = read_json(&mut worker);
	assert_eq!(notify["method"], "mining.notify");
	let params = notify["params"].as_array().unwrap();
	assert_eq!(params.len(), 9);
	let job_id = params[0].as_str().unwrap().to_string();
	let ntime = params[7].as_str().unwrap().to_string();
	info!("authorize and notify verification ok, job {}", job_id);

	// a submit against an unknown job is stale
	let bogus = format!(
		r#"{{"id":3,"method":"mining.submit","params":["addr1.rig1","ffffffff","00000000","{}","00000000"]}}"#,
		ntime
	);
	send(&mut worker, &bogus);
	let r = read_json(&mut worker);
	assert_eq!(r["error"][0], 21);
	assert_eq!(r["error"][1], "Job not found");

	// a well-formed submit for the real job: a random nonce cannot meet
	// difficulty 1024, so the share is rejected as too weak
	let submit = format!(
		r#"{{"id":4,"method":"mining.submit","params":["addr1.rig1","{}","00000001","{}","12345678"]}}"#,
		job_id, ntime
	);
	send(&mut worker, &submit);
	let r = read_json(&mut worker);
	assert_eq!(r["id"], 4);
	assert_eq!(r["error"][0], 23);
	assert_eq!(r["error"][1], "Low difficulty share");

	// the exact same tuple again is a duplicate, not another 23
	send(&mut worker, &submit);
	let r = read_json(&mut worker);
	assert_eq!(r["error"][0], 22);
	assert_eq!(r["error"][1], "Duplicate share");
	info!("share rejection codes verification ok");

	// malformed hex widths are a parameter error
	let bad_widths = format!(
		r#"{{"id":5,"method":"mining.submit","params":["addr1.rig1","{}","000001","{}","12345678"]}}"#,
		job_id, ntime
	);
	send(&mut worker, &bad_widths);
	let r = read_json(&mut worker);
	assert_eq!(r["error"][0], 20);

	// unknown methods are refused with 20
	send(&mut worker, r#"{"id":6,"method":"doesnotexist","params":[]}"#);
	let r = read_json(&mut worker);
	assert_eq!(r["id"], 6);
	assert_eq!(r["error"][0], 20);

	// get_version works on any session state
	send(&mut worker, r#"{"id":7,"method":"client.get_version","params":[]}"#);
	let r = read_json(&mut worker);
	assert!(r["result"].as_str().unwrap().starts_with("orepool/"));
	info!("error taxonomy verification ok");

	// the ledger saw the traffic: one worker, rejected shares counted
	let stats = server.stratum_stats();
	assert_eq!(stats.num_workers, 1);
	assert_eq!(stats.block_height, 1000);
	let ws = &stats.worker_stats[0];
	assert_eq!(ws.num_accepted, 0);
	assert!(ws.num_rejected >= 2);
	assert!(ws.num_stale >= 1);

	server.stop();
	assert!(server.is_stopped());
}

#[test]
fn second_worker_gets_distinct_extranonce() {
	util::init_test_logger();
	let addr = "127.0.0.1:23417";
	let (server, _tips_tx) = start_server(addr);

	let mut first = connect(addr);
	send(&mut first, r#"{"id":1,"method":"mining.subscribe","params":[]}"#);
	let e1_first = read_json(&mut first)["result"][1]
		.as_str()
		.unwrap()
		.to_string();

	let mut second = connect(addr);
	send(&mut second, r#"{"id":1,"method":"mining.subscribe","params":[]}"#);
	let e1_second = read_json(&mut second)["result"][1]
		.as_str()
		.unwrap()
		.to_string();

	assert_ne!(e1_first, e1_second);

	// a duplicate subscribe replies with the session's prior extranonce
	send(&mut second, r#"{"id":2,"method":"mining.subscribe","params":[]}"#);
	let again = read_json(&mut second)["result"][1]
		.as_str()
		.unwrap()
		.to_string();
	assert_eq!(again, e1_second);

	server.stop();
}
