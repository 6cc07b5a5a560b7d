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

/// Implements hex-encoding from bytes to string and decoding of strings
/// to bytes. The Stratum wire carries every binary field as lowercase
/// hex, so both directions are used constantly.
use std::fmt::Write;

fn to_hex(bytes: &[u8]) -> String {
	let mut s = String::with_capacity(bytes.len() * 2);
	for byte in bytes {
		write!(&mut s, "{:02x}", byte).expect("Unable to write hex");
	}
	s
}

/// Convert to lowercase hex
pub trait ToHex {
	/// convert to hex
	fn to_hex(&self) -> String;
}

impl<T: AsRef<[u8]>> ToHex for T {
	fn to_hex(&self) -> String {
		to_hex(self.as_ref())
	}
}

/// Decode a hex string into bytes.
pub fn from_hex(hex: &str) -> Result<Vec<u8>, String> {
	let hex = hex.trim().trim_start_matches("0x");
	if hex.len() % 2 != 0 {
		return Err(hex.to_string());
	}
	let mut bytes = Vec::with_capacity(hex.len() / 2);
	for i in (0..hex.len()).step_by(2) {
		let byte = u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| hex.to_string())?;
		bytes.push(byte);
	}
	Ok(bytes)
}

/// Decode a hex string of exactly `len` bytes, rejecting anything else.
/// Submit parameters declare their widths at subscribe time and must match.
pub fn from_hex_exact(hex: &str, len: usize) -> Result<Vec<u8>, String> {
	if hex.len() != len * 2 {
		return Err(hex.to_string());
	}
	from_hex(hex)
}

/// Hex-encode 32 bytes with the byte order reversed, the conventional
/// rendering for block and tx hashes.
pub fn to_hex_reversed(bytes: &[u8]) -> String {
	let mut rev = bytes.to_vec();
	rev.reverse();
	to_hex(&rev)
}
