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

//! Logging, locking and various low-level utilities that factor Rust
//! patterns that are frequent within the orepool codebase.

#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]
#![warn(missing_docs)]

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

// Re-export so only has to be included once
pub use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

// Logging related
pub mod logger;
pub use crate::logger::{init_logger, init_test_logger, LogLevel, LoggingConfig};

mod hex;
pub use crate::hex::*;

use std::sync::atomic::{AtomicBool, Ordering};

/// Global stopped state shared between all the server components, checked by
/// every long-running loop so the process can wind down cleanly.
pub struct StopState {
	stopped: AtomicBool,
}

impl StopState {
	/// Create a new stop state, initially running.
	pub fn new() -> StopState {
		StopState {
			stopped: AtomicBool::new(false),
		}
	}

	/// Check whether the server has been asked to stop.
	pub fn is_stopped(&self) -> bool {
		self.stopped.load(Ordering::SeqCst)
	}

	/// Ask all components watching this state to stop.
	pub fn stop(&self) {
		self.stopped.store(true, Ordering::SeqCst);
	}
}

impl Default for StopState {
	fn default() -> StopState {
		StopState::new()
	}
}
