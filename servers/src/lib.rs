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

//! The pool server: the Stratum session authority, the work director, the
//! share ledger, the variable-difficulty controller and the accounting
//! engine, glued together by a server facade.

#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]
#![warn(missing_docs)]

#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate log;

use orepool_core as core;
use orepool_util as util;

pub mod accounting;
pub mod common;
pub mod mining;
mod pool;

pub use crate::accounting::{AccountingEngine, Payment, PaymentStatus};
pub use crate::common::adapters::{
	BlockAcceptance, BlockTemplate, ChainError, ChainNode, NewTip, Wallet, WalletError,
	WalletEvent, WalletTx,
};
pub use crate::common::stats::{PoolStatistics, StratumStats, WorkerStats};
pub use crate::common::types::{
	BlockCandidate, Error, PayoutConfig, PayoutPolicy, PoolConfig, ShareAccepted,
	StratumServerConfig,
};
pub use crate::mining::ledger::{Miner, Round, Share, ShareLedger, Worker};
pub use crate::mining::vardiff::VarDiffConfig;
pub use crate::pool::server::{PoolSnapshot, Server};
