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

//! The Stratum v1 wire protocol: line-delimited JSON requests, responses
//! and notifications. Parsing yields a closed set of typed messages and
//! rejects everything else up front, so nothing weakly typed travels
//! deeper than this module.

use crate::util::from_hex_exact;
use serde_json::{json, Value};

/// Lines beyond this many bytes kill the session.
pub const MAX_LINE_LENGTH: usize = 16 * 1024;

/// Other / unknown method or bad params.
pub const ERR_OTHER: i64 = 20;
/// Job not found (stale).
pub const ERR_JOB_NOT_FOUND: i64 = 21;
/// Duplicate share.
pub const ERR_DUPLICATE_SHARE: i64 = 22;
/// Share below the credited difficulty.
pub const ERR_LOW_DIFFICULTY: i64 = 23;
/// Unauthorized worker.
pub const ERR_UNAUTHORIZED: i64 = 24;
/// Not subscribed.
pub const ERR_NOT_SUBSCRIBED: i64 = 25;

/// A request id as clients send them. Decimal ids dominate but string ids
/// exist in the wild.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(untagged)]
pub enum RpcId {
	/// Numeric id.
	Int(u64),
	/// String id.
	Str(String),
}

/// One request line from a client.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct RpcRequest {
	/// Echoed back in the response, null on client notifications.
	pub id: Option<RpcId>,
	/// The dotted method name.
	pub method: String,
	/// Positional parameters.
	#[serde(default)]
	pub params: Value,
}

/// The closed set of client messages this server understands. Anything
/// else is answered with error 20 at the parse step.
#[derive(Debug, PartialEq)]
pub enum MinerMessage {
	/// `mining.subscribe`, with the client's user agent when given.
	Subscribe {
		/// Client software identification, informational only.
		user_agent: Option<String>,
	},
	/// `mining.authorize`.
	Authorize {
		/// `account` or `account.workername`.
		username: String,
		/// Accepted as-is.
		password: String,
	},
	/// `mining.submit`.
	Submit(SubmitShare),
	/// `client.get_version`.
	GetVersion,
}

/// A strictly validated `mining.submit`: hex widths must match what was
/// declared at subscribe time.
#[derive(Debug, PartialEq, Clone)]
pub struct SubmitShare {
	/// Worker name as authorized.
	pub worker_name: String,
	/// Job the share claims to solve.
	pub job_id: String,
	/// Worker-chosen extranonce, lowercase hex.
	pub extranonce2: String,
	/// Header timestamp.
	pub ntime: u32,
	/// Header nonce, exactly four bytes.
	pub nonce: u32,
}

/// Why a line failed to parse into a `MinerMessage`.
#[derive(Debug, PartialEq)]
pub enum ParseError {
	/// Not valid JSON or not a request object.
	Malformed,
	/// Known method, wrong parameter count/type/width.
	BadParams(&'static str),
	/// Method outside the closed set.
	UnknownMethod(String),
}

impl ParseError {
	/// The client-facing message for the error 20 reply.
	pub fn message(&self) -> String {
		match self {
			ParseError::Malformed => "Other/Unknown".to_string(),
			ParseError::BadParams(what) => format!("Invalid params: {}", what),
			ParseError::UnknownMethod(m) => format!("Unknown method: {}", m),
		}
	}
}

fn param_str(params: &[Value], idx: usize, what: &'static str) -> Result<String, ParseError> {
	params
		.get(idx)
		.and_then(|v| v.as_str())
		.map(|s| s.to_string())
		.ok_or(ParseError::BadParams(what))
}

fn param_hex_u32(params: &[Value], idx: usize, what: &'static str) -> Result<u32, ParseError> {
	let hex = param_str(params, idx, what)?;
	let bytes = from_hex_exact(&hex, 4).map_err(|_| ParseError::BadParams(what))?;
	if hex.chars().any(|c| c.is_ascii_uppercase()) {
		return Err(ParseError::BadParams(what));
	}
	let mut be = [0u8; 4];
	be.copy_from_slice(&bytes);
	Ok(u32::from_be_bytes(be))
}

/// Parse one line into a typed message. The declared extranonce2 width is
/// needed to validate submits. On failure the request id, when one could be
/// recovered, comes back so the error reply can still be correlated.
pub fn parse(
	line: &str,
	extranonce2_size: usize,
) -> Result<(Option<RpcId>, MinerMessage), (Option<RpcId>, ParseError)> {
	let request: RpcRequest = match serde_json::from_str(line) {
		Ok(r) => r,
		Err(_) => return Err((None, ParseError::Malformed)),
	};
	let id = request.id.clone();
	let params: Vec<Value> = match request.params {
		Value::Array(p) => p,
		Value::Null => vec![],
		_ => return Err((id, ParseError::BadParams("params must be an array"))),
	};

	match parse_method(&request.method, &params, extranonce2_size) {
		Ok(m) => Ok((id, m)),
		Err(e) => Err((id, e)),
	}
}

fn parse_method(
	method: &str,
	params: &[Value],
	extranonce2_size: usize,
) -> Result<MinerMessage, ParseError> {
	match method {
		"mining.subscribe" => Ok(MinerMessage::Subscribe {
			user_agent: params.get(0).and_then(|v| v.as_str()).map(|s| s.to_string()),
		}),
		"mining.authorize" => Ok(MinerMessage::Authorize {
			username: param_str(params, 0, "username")?,
			password: param_str(params, 1, "password")?,
		}),
		"mining.submit" => {
			if params.len() != 5 {
				return Err(ParseError::BadParams("submit takes 5 params"));
			}
			let extranonce2 = param_str(params, 2, "extranonce2")?;
			if from_hex_exact(&extranonce2, extranonce2_size).is_err()
				|| extranonce2.chars().any(|c| c.is_ascii_uppercase())
			{
				return Err(ParseError::BadParams("extranonce2"));
			}
			Ok(MinerMessage::Submit(SubmitShare {
				worker_name: param_str(params, 0, "worker name")?,
				job_id: param_str(params, 1, "job id")?,
				extranonce2,
				ntime: param_hex_u32(params, 3, "ntime")?,
				nonce: param_hex_u32(params, 4, "nonce")?,
			}))
		}
		"client.get_version" => Ok(MinerMessage::GetVersion),
		other => Err(ParseError::UnknownMethod(other.to_string())),
	}
}

fn id_value(id: &Option<RpcId>) -> Value {
	match id {
		Some(RpcId::Int(n)) => json!(n),
		Some(RpcId::Str(s)) => json!(s),
		None => Value::Null,
	}
}

/// A successful response line.
pub fn ok_line(id: &Option<RpcId>, result: Value) -> String {
	json!({
		"id": id_value(id),
		"result": result,
		"error": Value::Null,
	})
	.to_string()
}

/// An error response line, `error` in the `[code, message, null]` shape.
pub fn err_line(id: &Option<RpcId>, code: i64, message: &str) -> String {
	json!({
		"id": id_value(id),
		"result": Value::Null,
		"error": [code, message, Value::Null],
	})
	.to_string()
}

/// The `mining.subscribe` result payload.
pub fn subscribe_result(subscription_id: &str, extranonce1: &str, extranonce2_size: usize) -> Value {
	json!([
		[
			["mining.notify", subscription_id],
			["mining.set_difficulty", subscription_id]
		],
		extranonce1,
		extranonce2_size
	])
}

/// A `mining.set_difficulty` notification line.
pub fn set_difficulty_line(difficulty: u64) -> String {
	json!({
		"id": Value::Null,
		"method": "mining.set_difficulty",
		"params": [difficulty],
	})
	.to_string()
}

/// Everything a `mining.notify` carries, already hex-rendered.
#[derive(Debug, Clone, PartialEq)]
pub struct JobNotify {
	/// Opaque job id.
	pub job_id: String,
	/// Previous block hash in the conventional reversed rendering.
	pub prev_hash: String,
	/// Coinbase bytes up to the extranonce splice.
	pub coinb1: String,
	/// Coinbase bytes after the extranonce splice.
	pub coinb2: String,
	/// Merkle siblings of the coinbase path, internal byte order.
	pub merkle_branch: Vec<String>,
	/// Header version, eight hex chars.
	pub version: String,
	/// Compact target, eight hex chars.
	pub nbits: String,
	/// Template timestamp, eight hex chars.
	pub ntime: String,
	/// Whether workers must abandon in-flight work.
	pub clean_jobs: bool,
}

/// A `mining.notify` notification line.
pub fn notify_line(job: &JobNotify) -> String {
	json!({
		"id": Value::Null,
		"method": "mining.notify",
		"params": [
			job.job_id,
			job.prev_hash,
			job.coinb1,
			job.coinb2,
			job.merkle_branch,
			job.version,
			job.nbits,
			job.ntime,
			job.clean_jobs,
		],
	})
	.to_string()
}
