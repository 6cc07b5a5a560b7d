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

//! Implementation of the chain primitives the pool works against: double
//! SHA-256 hashing, block headers and merkle trees, compact difficulty
//! targets and the reward schedule. Everything here is pure data and math,
//! shared by all the server components.

#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]
#![warn(missing_docs)]

#[macro_use]
extern crate serde_derive;

use orepool_util as util;

pub mod block;
pub mod consensus;
pub mod hash;
pub mod pow;

pub use crate::block::BlockHeader;
pub use crate::hash::{Hash, ZERO_HASH};
pub use crate::pow::{Difficulty, Target};
