//! Per-connection Stratum state machine (§4.4).
//!
//! ```text
//!  START
//!   │  (mining.subscribe)
//!   ▼
//!  SUBSCRIBED ──(mining.authorize)──► AUTHORIZED
//!   │                                     │
//!   │                         (mining.submit, repeated)
//!   │                                     │
//!   └─(flood/malformed/ban)──► DISCONNECTED ◄─┘
//! ```

use super::ban::ShareCounters;
use super::messages::{self, parse_method, RpcRequest, RpcResponse, StratumMethod};
use super::vardiff::VarDiffTracker;
use crate::job::{Submission, ValidationOutcome};
use std::time::Instant;

/// Flood cap (§8): a connection that buffers this many bytes without
/// completing a line is disconnected. Enforced by the `LinesCodec` the
/// socket-driving loop frames its reads with, not by this module.
pub(crate) const MAX_BUFFER_BYTES: usize = 10 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Start,
    Subscribed,
    Authorized,
}

/// Outcome of feeding one line to a connection; the socket-driving loop
/// (outside this module) turns these into actual writes/disconnects.
pub enum LineOutcome {
    Reply(String),
    ReplyAndDisconnect(String),
    Disconnect,
    NoReply,
}

pub struct Connection {
    pub state: ConnectionState,
    pub worker: Option<String>,
    pub session_id: String,
    pub extra_nonce1: String,
    pub extra_nonce2_size: usize,
    pub counters: ShareCounters,
    pub vardiff: Option<VarDiffTracker>,
    pub last_submit: Instant,
    pub extranonce_subscribed: bool,
}

impl Connection {
    pub fn new(session_id: String, extra_nonce1: String, extra_nonce2_size: usize, vardiff: Option<VarDiffTracker>) -> Self {
        Self {
            state: ConnectionState::Start,
            worker: None,
            session_id,
            extra_nonce1,
            extra_nonce2_size,
            counters: ShareCounters::default(),
            vardiff,
            last_submit: Instant::now(),
            extranonce_subscribed: false,
        }
    }

    /// Feeds one newline-delimited line through the state machine.
    /// `authorize`/`submit` are injected so this stays unit-testable without
    /// a live job manager or pool.
    pub fn handle_line<A, S>(&mut self, line: &str, authorize: A, submit: S) -> LineOutcome
    where
        A: FnOnce(&str, Option<&str>) -> bool,
        S: FnOnce(&str, Submission) -> ValidationOutcome,
    {
        let request: RpcRequest = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(_) => return LineOutcome::Disconnect,
        };

        let method = parse_method(&request);
        match method {
            StratumMethod::Subscribe => {
                self.state = ConnectionState::Subscribed;
                let result =
                    messages::subscribe_result(&self.session_id, &self.extra_nonce1, self.extra_nonce2_size);
                LineOutcome::Reply(RpcResponse::ok(request.id, result).to_line())
            }
            StratumMethod::ExtranonceSubscribe => {
                self.extranonce_subscribed = true;
                LineOutcome::Reply(RpcResponse::ok(request.id, serde_json::json!(true)).to_line())
            }
            StratumMethod::Authorize { worker, password } => {
                if authorize(&worker, password.as_deref()) {
                    self.state = ConnectionState::Authorized;
                    self.worker = Some(worker);
                    LineOutcome::Reply(RpcResponse::ok(request.id, serde_json::json!(true)).to_line())
                } else {
                    LineOutcome::ReplyAndDisconnect(RpcResponse::err(request.id, 24, "unauthorized worker").to_line())
                }
            }
            StratumMethod::Submit { worker, job_id, extra_nonce2, n_time, nonce } => {
                if self.state != ConnectionState::Authorized {
                    return LineOutcome::Reply(RpcResponse::err(request.id, 25, "not authorized").to_line());
                }
                self.last_submit = Instant::now();
                let submission = Submission {
                    job_id,
                    extra_nonce1: self.extra_nonce1.clone(),
                    extra_nonce2,
                    n_time: u32::from_str_radix(&n_time, 16).unwrap_or(0),
                    nonce: u32::from_str_radix(&nonce, 16).unwrap_or(0),
                    solution: None,
                };
                match submit(&worker, submission) {
                    ValidationOutcome::Valid { is_block, .. } => {
                        self.counters.valid += 1;
                        if let Some(vd) = &mut self.vardiff {
                            vd.record_accepted_share(Instant::now());
                        }
                        let result = serde_json::json!({"accepted": true, "block": is_block});
                        LineOutcome::Reply(RpcResponse::ok(request.id, result).to_line())
                    }
                    ValidationOutcome::Rejected { reason } => {
                        self.counters.invalid += 1;
                        LineOutcome::Reply(RpcResponse::err(request.id, 23, reason).to_line())
                    }
                }
            }
            StratumMethod::GetTransactions => {
                LineOutcome::Reply(RpcResponse::ok(request.id, serde_json::json!([])).to_line())
            }
            StratumMethod::Unknown(_) => LineOutcome::NoReply,
        }
    }

    pub fn is_timed_out(&self, connection_timeout: std::time::Duration) -> bool {
        self.last_submit.elapsed() > connection_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        Connection::new("sid1".into(), "ab01".into(), 4, None)
    }

    #[test]
    fn subscribe_moves_to_subscribed_state() {
        let mut c = conn();
        let line = r#"{"id":1,"method":"mining.subscribe","params":[]}"#;
        let outcome = c.handle_line(line, |_, _| true, |_, _| ValidationOutcome::Rejected { reason: "unused" });
        assert!(matches!(outcome, LineOutcome::Reply(_)));
        assert_eq!(c.state, ConnectionState::Subscribed);
    }

    #[test]
    fn submit_before_authorize_is_rejected_without_disconnect() {
        let mut c = conn();
        let line = r#"{"id":2,"method":"mining.submit","params":["addr.rig","job1","00000000","5f000000","11111111"]}"#;
        let outcome = c.handle_line(line, |_, _| true, |_, _| ValidationOutcome::Valid { hash: [0; 32], is_block: false, block_hex: None });
        assert!(matches!(outcome, LineOutcome::Reply(_)));
        assert_eq!(c.state, ConnectionState::Start);
    }

    #[test]
    fn failed_authorize_disconnects() {
        let mut c = conn();
        let line = r#"{"id":3,"method":"mining.authorize","params":["bogus","x"]}"#;
        let outcome = c.handle_line(line, |_, _| false, |_, _| ValidationOutcome::Rejected { reason: "unused" });
        assert!(matches!(outcome, LineOutcome::ReplyAndDisconnect(_)));
    }

    #[test]
    fn valid_submit_after_authorize_increments_valid_counter() {
        let mut c = conn();
        c.handle_line(
            r#"{"id":1,"method":"mining.authorize","params":["addr.rig","x"]}"#,
            |_, _| true,
            |_, _| ValidationOutcome::Rejected { reason: "unused" },
        );
        let outcome = c.handle_line(
            r#"{"id":2,"method":"mining.submit","params":["addr.rig","job1","00000000","5f000000","11111111"]}"#,
            |_, _| true,
            |_, _| ValidationOutcome::Valid { hash: [0; 32], is_block: false, block_hex: None },
        );
        assert!(matches!(outcome, LineOutcome::Reply(_)));
        assert_eq!(c.counters.valid, 1);
    }

    #[test]
    fn malformed_json_disconnects_immediately() {
        let mut c = conn();
        let outcome = c.handle_line("not json", |_, _| true, |_, _| ValidationOutcome::Rejected { reason: "unused" });
        assert!(matches!(outcome, LineOutcome::Disconnect));
    }
}
