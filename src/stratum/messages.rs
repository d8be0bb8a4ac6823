//! Line-delimited JSON-RPC wire types and the tagged method dispatch (§9
//! design note: "the `method` dispatch is naturally expressed as a tagged
//! variant"). Field shapes are grounded in the request/response parsing in
//! the Zion miner-side Stratum client (subscribe/authorize/submit).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub id: Value,
    pub result: Value,
    pub error: Option<(i32, String, Option<String>)>,
}

impl RpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self { id, result, error: None }
    }

    pub fn err(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self { id, result: Value::Null, error: Some((code, message.into(), None)) }
    }

    pub fn to_line(&self) -> String {
        let error = match &self.error {
            Some((code, msg, tb)) => serde_json::json!([code, msg, tb]),
            None => Value::Null,
        };
        let mut line = serde_json::json!({"id": self.id, "result": self.result, "error": error}).to_string();
        line.push('\n');
        line
    }
}

/// Tagged dispatch over the Stratum methods this server implements (§4.4).
#[derive(Debug)]
pub enum StratumMethod {
    Subscribe,
    ExtranonceSubscribe,
    Authorize { worker: String, password: Option<String> },
    Submit {
        worker: String,
        job_id: String,
        extra_nonce2: String,
        n_time: String,
        nonce: String,
    },
    GetTransactions,
    Unknown(String),
}

pub fn parse_method(request: &RpcRequest) -> StratumMethod {
    let params = request.params.as_array().cloned().unwrap_or_default();
    match request.method.as_str() {
        "mining.subscribe" => StratumMethod::Subscribe,
        "mining.extranonce.subscribe" => StratumMethod::ExtranonceSubscribe,
        "mining.authorize" => StratumMethod::Authorize {
            worker: params.first().and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            password: params.get(1).and_then(|v| v.as_str()).map(|s| s.to_string()),
        },
        "mining.submit" => StratumMethod::Submit {
            worker: params.first().and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            job_id: params.get(1).and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            extra_nonce2: params.get(2).and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            n_time: params.get(3).and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            nonce: params.get(4).and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        },
        "mining.get_transactions" => StratumMethod::GetTransactions,
        other => StratumMethod::Unknown(other.to_string()),
    }
}

/// Server subscription reply (§6): `[[[method,sid],...], extraNonce1, extraNonce2Size]`.
pub fn subscribe_result(session_id: &str, extra_nonce1: &str, extra_nonce2_size: usize) -> Value {
    serde_json::json!([
        [["mining.set_difficulty", session_id], ["mining.notify", session_id]],
        extra_nonce1,
        extra_nonce2_size
    ])
}

/// `mining.notify` parameters (§6).
#[allow(clippy::too_many_arguments)]
pub fn notify_params(
    job_id: &str,
    prev_hash: &str,
    coinbase1: &str,
    coinbase2: &str,
    merkle_branches: &[String],
    version: &str,
    n_bits: &str,
    n_time: &str,
    clean_jobs: bool,
) -> Value {
    serde_json::json!([job_id, prev_hash, coinbase1, coinbase2, merkle_branches, version, n_bits, n_time, clean_jobs])
}

/// Full `mining.notify` notification line (§6), built straight from a job's
/// fields: hex-encodes the coinbase halves and merkle branches, word-swaps
/// `prevHash` into the wire's byte order, and formats version/nBits/nTime as
/// fixed-width hex.
pub fn notify_frame(job: &crate::job::Job) -> String {
    let prev_hash_bytes: [u8; 32] = hex::decode(&job.prev_hash)
        .ok()
        .and_then(|v| v.try_into().ok())
        .unwrap_or([0u8; 32]);
    let prev_hash_wire = hex::encode(crate::encoding::reverse_byte_order(&prev_hash_bytes));
    let merkle_branches: Vec<String> = job.merkle_branches.iter().map(hex::encode).collect();

    let params = notify_params(
        &job.job_id,
        &prev_hash_wire,
        &hex::encode(&job.coinbase1),
        &hex::encode(&job.coinbase2),
        &merkle_branches,
        &format!("{:08x}", job.version),
        &format!("{:08x}", job.n_bits),
        &format!("{:08x}", job.n_time),
        job.clean_jobs,
    );
    let mut line =
        serde_json::json!({"id": Value::Null, "method": "mining.notify", "params": params}).to_string();
    line.push('\n');
    line
}

pub fn set_difficulty_notification(difficulty: f64) -> String {
    let mut line = serde_json::json!({"id": Value::Null, "method": "mining.set_difficulty", "params": [difficulty]}).to_string();
    line.push('\n');
    line
}

pub fn set_target_notification(target_hex: &str) -> String {
    let mut line = serde_json::json!({"id": Value::Null, "method": "mining.set_target", "params": [target_hex]}).to_string();
    line.push('\n');
    line
}

pub fn set_extranonce_notification(extra_nonce1: &str, size: usize) -> String {
    let mut line =
        serde_json::json!({"id": Value::Null, "method": "mining.set_extranonce", "params": [extra_nonce1, size]}).to_string();
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_submit_params_positionally() {
        let req = RpcRequest {
            id: serde_json::json!(1),
            method: "mining.submit".to_string(),
            params: serde_json::json!(["addr.rig1", "jobid1", "0011", "5f000000", "deadbeef"]),
        };
        match parse_method(&req) {
            StratumMethod::Submit { worker, job_id, extra_nonce2, n_time, nonce } => {
                assert_eq!(worker, "addr.rig1");
                assert_eq!(job_id, "jobid1");
                assert_eq!(extra_nonce2, "0011");
                assert_eq!(n_time, "5f000000");
                assert_eq!(nonce, "deadbeef");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_method_is_noop_ack() {
        let req = RpcRequest { id: serde_json::json!(2), method: "mining.weird".to_string(), params: Value::Null };
        assert!(matches!(parse_method(&req), StratumMethod::Unknown(m) if m == "mining.weird"));
    }

    #[test]
    fn notify_frame_is_a_well_formed_mining_notify_line() {
        let manager = crate::job::JobManager::new(std::sync::Arc::new(crate::encoding::Sha256dAlgorithm));
        let job = manager.build_job(
            "00".repeat(32),
            vec![0u8; 10],
            vec![0u8; 4],
            vec![[7u8; 32]],
            1,
            0x1d00ffff,
            1_700_000_000,
            840_000,
            true,
            vec![],
        );
        let line = notify_frame(&job);
        assert!(line.ends_with('\n'));
        let parsed: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed["method"], "mining.notify");
        let params = parsed["params"].as_array().unwrap();
        assert_eq!(params.len(), 9);
        assert_eq!(params[0], job.job_id);
        assert_eq!(params[8], true);
    }
}
