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

//! Configuration file management. The file is searched for in the working
//! directory, then in `~/.orepool`; when neither exists a default file is
//! written there so an operator has something concrete to edit.

use std::env;
use std::fs::{self, File};
use std::io::prelude::*;
use std::path::PathBuf;

use crate::types::{ConfigError, ConfigMembers, GlobalConfig};

/// The configuration file's name.
pub const CONFIG_FILE_NAME: &str = "orepool.toml";

/// Directory under the user's home for the pool's files.
const POOL_HOME: &str = ".orepool";

fn get_pool_path() -> Result<PathBuf, ConfigError> {
	let mut pool_path = match dirs::home_dir() {
		Some(p) => p,
		None => PathBuf::new(),
	};
	pool_path.push(POOL_HOME);
	if !pool_path.exists() {
		fs::create_dir_all(pool_path.clone())?;
	}
	Ok(pool_path)
}

fn check_config_current_dir() -> Option<PathBuf> {
	let p = env::current_dir();
	let mut c = match p {
		Ok(c) => c,
		Err(_) => return None,
	};
	c.push(CONFIG_FILE_NAME);
	if c.exists() {
		return Some(c);
	}
	None
}

/// Whether a configuration file already exists in either location.
pub fn config_file_exists() -> bool {
	if check_config_current_dir().is_some() {
		return true;
	}
	match get_pool_path() {
		Ok(mut path) => {
			path.push(CONFIG_FILE_NAME);
			path.exists()
		}
		Err(_) => false,
	}
}

/// Handle the configuration file on startup: use the given path, or find
/// an existing file, or generate a default one under the pool home.
pub fn initial_setup_server(config_path: Option<PathBuf>) -> Result<GlobalConfig, ConfigError> {
	if let Some(path) = config_path {
		return GlobalConfig::new(path);
	}
	if let Some(path) = check_config_current_dir() {
		return GlobalConfig::new(path);
	}
	let mut path = get_pool_path()?;
	path.push(CONFIG_FILE_NAME);
	if path.exists() {
		GlobalConfig::new(path)
	} else {
		let mut config = GlobalConfig::default();
		config.write_to_file(&path)?;
		config.config_file_path = Some(path);
		Ok(config)
	}
}

impl GlobalConfig {
	/// Load and parse the file at the given path.
	pub fn new(path: PathBuf) -> Result<GlobalConfig, ConfigError> {
		if !path.exists() {
			return Err(ConfigError::FileNotFoundError(
				path.to_string_lossy().to_string(),
			));
		}
		let mut file = File::open(&path)?;
		let mut contents = String::new();
		file.read_to_string(&mut contents)?;
		let members: ConfigMembers = toml::from_str(&contents).map_err(|e| {
			ConfigError::ParseError(path.to_string_lossy().to_string(), e.to_string())
		})?;
		Ok(GlobalConfig {
			config_file_path: Some(path),
			members,
		})
	}

	/// Serialize the members back to TOML.
	pub fn ser_config(&self) -> Result<String, ConfigError> {
		toml::to_string(&self.members)
			.map_err(|e| ConfigError::SerializationError(e.to_string()))
	}

	/// Write the configuration out, for first-run generation.
	pub fn write_to_file(&self, path: &PathBuf) -> Result<(), ConfigError> {
		let serialized = self.ser_config()?;
		let mut file = File::create(path)?;
		file.write_all(serialized.as_bytes())?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_config_sections() {
		let toml_str = r#"
			[server]
			pool_name = "testpool"
			pool_payout_address = "addr0000000000000000"

			[server.stratum_config]
			stratum_server_addr = "127.0.0.1:13416"
			extranonce2_size = 4

			[server.vardiff_config]
			initial_difficulty = 2048
			target_share_time = 10.0

			[server.payout_config]
			policy = "prop"
			pool_fee_percent = 2.0

			[logging]
			log_to_stdout = true
			stdout_log_level = "DEBUG"
			log_to_file = false
			file_log_level = "INFO"
			log_file_path = "orepool.log"
			log_file_append = true
		"#;
		let members: ConfigMembers = toml::from_str(toml_str).unwrap();
		assert_eq!(members.server.pool_name, "testpool");
		assert_eq!(
			members.server.stratum_config.stratum_server_addr,
			"127.0.0.1:13416"
		);
		assert_eq!(members.server.vardiff_config.initial_difficulty, 2048);
		assert_eq!(members.server.payout_config.pool_fee_percent, 2.0);
		// unspecified fields take their defaults
		assert_eq!(members.server.payout_config.pplns_window, 1000);
		assert_eq!(members.server.max_invalid_shares, 20);
	}

	#[test]
	fn default_round_trips_through_toml() {
		let config = GlobalConfig::default();
		let serialized = config.ser_config().unwrap();
		let reparsed: ConfigMembers = toml::from_str(&serialized).unwrap();
		assert_eq!(
			reparsed.server.stratum_config.stratum_server_addr,
			config.members.server.stratum_config.stratum_server_addr
		);
	}
}
