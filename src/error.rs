//! Error taxonomy for the pool core.
//!
//! Variants mirror the kinds in the error-handling design rather than one
//! variant per call site; callers match on kind to decide retry/log policy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("daemon rpc transient failure calling {method}: {source}")]
    TransientRpc {
        method: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("gettransaction returned -5 for {tx_hash} ({attempts} attempts so far)")]
    ExpectedRpc { tx_hash: String, attempts: u32 },

    #[error("insufficient spendable funds: need {needed}, daemon reports {available}")]
    InsufficientFunds { needed: f64, available: f64 },

    #[error("invalid share from {worker}: {reason}")]
    InvalidShare { worker: String, reason: String },

    #[error("protocol violation from {peer}: {reason}")]
    ProtocolViolation { peer: String, reason: String },

    #[error("authorization rejected for {worker}")]
    BadAuthorization { worker: String },

    #[error("sendmany succeeded (txid {txid}) but commit failed: {source}")]
    CommitAfterSend {
        txid: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("unexpected rpc response shape for {method}: missing {field}")]
    UnknownRpcShape { method: String, field: String },

    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PoolError>;

/// The JSON-RPC error tuple `[code, message, traceback]` a miner sees on the wire.
impl PoolError {
    pub fn stratum_tuple(&self) -> (i32, String, Option<String>) {
        match self {
            PoolError::InvalidShare { reason, .. } => (23, reason.clone(), None),
            PoolError::BadAuthorization { .. } => (24, "unauthorized worker".into(), None),
            PoolError::ProtocolViolation { reason, .. } => (20, reason.clone(), None),
            other => (20, "internal error".into(), Some(other.to_string())),
        }
    }
}
