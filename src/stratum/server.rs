//! Stratum TCP (optional TLS) listener: accepts connections, drives each
//! through the per-connection state machine, and broadcasts new jobs.
//!
//! Grounded in the accept-loop / per-connection-task shape of
//! `mimblewimble-grin`'s `stratumserver.rs` and the teacher's
//! `tokio::spawn`-with-atomic-gate background task idiom.

use super::ban::BanMap;
use super::connection::{Connection, ConnectionState, LineOutcome, MAX_BUFFER_BYTES};
use super::vardiff::{VarDiffSettings, VarDiffTracker};
use crate::config::PortConfig;
use crate::job::{JobManager, Submission, ValidationOutcome};
use dashmap::DashMap;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{self, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{FramedRead, LinesCodec};

pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(600);
pub const JOB_REBROADCAST_TIMEOUT: Duration = Duration::from_secs(55);

/// Assigns unique `extraNonce1` values from a pool-global monotonic counter
/// with a fixed seed (§4.4), so reconstructed coinbases never collide across
/// subscriptions on this process.
pub struct ExtraNonceCounter {
    next: AtomicU32,
}

impl ExtraNonceCounter {
    pub fn new(seed: u32) -> Self {
        Self { next: AtomicU32::new(seed) }
    }

    pub fn assign(&self) -> String {
        let value = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{:08x}", value)
    }
}

pub type SubmitFn = Arc<dyn Fn(&str, Submission, &[u8; 32]) -> ValidationOutcome + Send + Sync>;
pub type AuthorizeFn = Arc<dyn Fn(&str, Option<&str>) -> bool + Send + Sync>;

struct ClientHandle {
    outbox: mpsc::UnboundedSender<String>,
    shutdown: Arc<tokio::sync::Notify>,
    worker: Arc<Mutex<Option<String>>>,
}

pub struct StratumServer {
    pub port: u16,
    config: PortConfig,
    job_manager: Arc<JobManager>,
    ban_map: Arc<BanMap>,
    extra_nonce_counter: Arc<ExtraNonceCounter>,
    clients: Arc<DashMap<u64, ClientHandle>>,
    next_client_id: AtomicU32,
    authorize: AuthorizeFn,
    submit: SubmitFn,
}

impl StratumServer {
    pub fn new(
        port: u16,
        config: PortConfig,
        job_manager: Arc<JobManager>,
        ban_map: Arc<BanMap>,
        extra_nonce_counter: Arc<ExtraNonceCounter>,
        authorize: AuthorizeFn,
        submit: SubmitFn,
    ) -> Self {
        Self {
            port,
            config,
            job_manager,
            ban_map,
            extra_nonce_counter,
            clients: Arc::new(DashMap::new()),
            next_client_id: AtomicU32::new(1),
            authorize,
            submit,
        }
    }

    /// Builds a `TlsAcceptor` from `config.tls_cert`/`config.tls_key` when
    /// `config.tls` is set. `Config::validate` already requires both paths be
    /// present alongside `tls: true`, so a missing file here is a startup-time
    /// misconfiguration, not a runtime condition to tolerate.
    fn build_tls_acceptor(config: &PortConfig) -> anyhow::Result<Option<TlsAcceptor>> {
        if !config.tls {
            return Ok(None);
        }
        let cert_path = config.tls_cert.as_deref().ok_or_else(|| anyhow::anyhow!("tls enabled without tlsCert"))?;
        let key_path = config.tls_key.as_deref().ok_or_else(|| anyhow::anyhow!("tls enabled without tlsKey"))?;

        let mut cert_reader = std::io::BufReader::new(std::fs::File::open(cert_path)?);
        let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;

        let mut key_reader = std::io::BufReader::new(std::fs::File::open(key_path)?);
        let key = rustls_pemfile::private_key(&mut key_reader)?
            .ok_or_else(|| anyhow::anyhow!("no private key found in {key_path}"))?;

        let server_config = tokio_rustls::rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
    }

    pub async fn listen(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        let tls_acceptor = Self::build_tls_acceptor(&self.config)?;
        tracing::info!(port = self.port, tls = tls_acceptor.is_some(), "stratum listening");
        loop {
            let (socket, peer) = listener.accept().await?;
            if self.ban_map.is_banned(&peer.ip()) {
                continue;
            }
            let server = self.clone();
            let acceptor = tls_acceptor.clone();
            tokio::spawn(async move {
                match acceptor {
                    Some(acceptor) => match acceptor.accept(socket).await {
                        Ok(tls_stream) => {
                            if let Err(err) = server.handle_connection(tls_stream, peer).await {
                                tracing::debug!(%peer, %err, "connection ended");
                            }
                        }
                        Err(err) => tracing::debug!(%peer, %err, "tls handshake failed"),
                    },
                    None => {
                        if let Err(err) = server.handle_connection(socket, peer).await {
                            tracing::debug!(%peer, %err, "connection ended");
                        }
                    }
                }
            });
        }
    }

    async fn handle_connection<IO>(self: Arc<Self>, stream: IO, peer: SocketAddr) -> anyhow::Result<()>
    where
        IO: io::AsyncRead + io::AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = io::split(stream);
        let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_BUFFER_BYTES));
        let write_half = Arc::new(Mutex::new(write_half));

        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed) as u64;
        let session_id = format!("{:016x}", client_id);
        let extra_nonce1 = self.extra_nonce_counter.assign();
        let extra_nonce2_size = 4;

        let vardiff = self.config.var_diff.as_ref().map(|vd| {
            VarDiffTracker::new(
                VarDiffSettings {
                    min_diff: vd.min_diff,
                    max_diff: vd.max_diff,
                    target_time: vd.target_time,
                    retarget_time: vd.retarget_time,
                    variance_percent: vd.variance_percent,
                },
                self.config.diff,
            )
        });

        let mut connection = Connection::new(session_id, extra_nonce1, extra_nonce2_size, vardiff);

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let shutdown = Arc::new(tokio::sync::Notify::new());
        let worker_name = Arc::new(Mutex::new(None));
        self.clients.insert(
            client_id,
            ClientHandle { outbox: tx, shutdown: shutdown.clone(), worker: worker_name.clone() },
        );

        let writer_task = {
            let write_half = write_half.clone();
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    let mut w = write_half.lock().await;
                    if w.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
            })
        };

        loop {
            let next = tokio::select! {
                next = tokio::time::timeout(CONNECTION_TIMEOUT, lines.next()) => next,
                _ = shutdown.notified() => {
                    tracing::debug!(%peer, "disconnected by proxy coinswitch");
                    break;
                }
            };
            let Ok(next) = next else {
                break; // connection reaping: no submit within connectionTimeout
            };
            let line = match next {
                Some(Ok(line)) => line,
                Some(Err(_)) => {
                    tracing::warn!(%peer, "flood disconnect: line exceeded buffer cap");
                    break;
                }
                None => break, // EOF
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let authorize = self.authorize.clone();
            let submit = self.submit.clone();
            let share_target = crate::encoding::difficulty_to_target(
                connection.vardiff.as_ref().map(|v| v.current_difficulty()).unwrap_or(self.config.diff),
            );

            let outcome = connection.handle_line(
                trimmed,
                |worker, pass| authorize(worker, pass),
                |worker, submission| submit(worker, submission, &share_target),
            );
            *worker_name.lock().await = connection.worker.clone();

            match outcome {
                LineOutcome::Reply(reply) => {
                    let _ = write_half.lock().await.write_all(reply.as_bytes()).await;
                }
                LineOutcome::ReplyAndDisconnect(reply) => {
                    let _ = write_half.lock().await.write_all(reply.as_bytes()).await;
                    break;
                }
                LineOutcome::Disconnect => break,
                LineOutcome::NoReply => {}
            }

            if self.ban_map.evaluate(peer.ip(), &connection.counters) {
                tracing::warn!(%peer, "banned for excessive invalid shares");
                break;
            }
            if connection.state == ConnectionState::Authorized
                && connection.is_timed_out(CONNECTION_TIMEOUT)
            {
                break;
            }
        }

        self.clients.remove(&client_id);
        writer_task.abort();
        Ok(())
    }

    /// Broadcasts a frame to every connected client, e.g. a fresh
    /// `mining.notify` after the job manager publishes a new template.
    pub fn broadcast(&self, frame: &str) {
        for entry in self.clients.iter() {
            let _ = entry.value().outbox.send(frame.to_string());
        }
    }

    pub fn connected_clients(&self) -> usize {
        self.clients.len()
    }

    /// Accepts a socket handed off by the proxy multiplexer (C10) rather
    /// than from this server's own listener.
    pub async fn accept_external(self: Arc<Self>, socket: tokio::net::TcpStream, peer: SocketAddr) {
        if let Err(err) = self.clone().handle_connection(socket, peer).await {
            tracing::debug!(%peer, %err, "proxied connection ended");
        }
    }

    /// Relinquishes every client whose authorized worker name matches
    /// `predicate`, for the `coinswitch` handoff (§4.10): each disconnected
    /// miner's reconnect lands on the switch port's new target pool.
    pub async fn disconnect_clients_where<F>(&self, predicate: F)
    where
        F: Fn(Option<&str>) -> bool,
    {
        let mut to_drop = Vec::new();
        for entry in self.clients.iter() {
            let worker = entry.value().worker.lock().await;
            if predicate(worker.as_deref()) {
                to_drop.push(*entry.key());
            }
        }
        for client_id in to_drop {
            if let Some((_, handle)) = self.clients.remove(&client_id) {
                handle.shutdown.notify_one();
            }
        }
    }

    pub async fn disconnect_all(&self) {
        self.disconnect_clients_where(|_| true).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_nonce_counter_never_repeats_within_a_process() {
        let counter = ExtraNonceCounter::new(1);
        let a = counter.assign();
        let b = counter.assign();
        assert_ne!(a, b);
    }
}
