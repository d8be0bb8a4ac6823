//! Supervisor (C9): wires up one `PoolRuntime` + share processor + payout
//! processor per configured coin, restarts whichever background task dies,
//! and runs the admin CLI listener that routes `banIP`/`blocknotify`/
//! `shareTrack`/`coinswitch`/`reloadpool` commands to the right place.
//!
//! The per-task restart-with-backoff idiom is the teacher's
//! `services/mining_service.rs` cleanup-task respawn loop, generalized from
//! "one task" to "one task per coin per concern".

use crate::config::{Config, PoolConfig};
use crate::encoding::{AddressRules, Blake3Algorithm, HashAlgorithm, Sha256dAlgorithm};
use crate::job::JobManager;
use crate::pool::{PoolRuntime, ShareEvent};
use crate::pplnt::PplntTracker;
use crate::payout::PayoutProcessor;
use crate::proxy::ProxyMultiplexer;
use crate::rpc::RpcClient;
use crate::share_processor::ShareProcessor;
use crate::store::{Store, StoreCommand};
use crate::stratum::{BanConfig, BanMap, ExtraNonceCounter, StratumServer};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// A crashed task is restarted after this delay.
const RESTART_BACKOFF: Duration = Duration::from_secs(2);
/// More than this many crashes inside `CRASH_WINDOW` stops the restart loop.
const MAX_CRASHES: usize = 3;
const CRASH_WINDOW: Duration = Duration::from_secs(10);

fn algorithm_for(name: &str) -> Arc<dyn HashAlgorithm> {
    match name {
        "blake3" => Arc::new(Blake3Algorithm),
        _ => Arc::new(Sha256dAlgorithm),
    }
}

/// Tracks recent crash timestamps for one supervised task; refuses to keep
/// restarting a task that is crash-looping.
struct RestartPolicy {
    name: String,
    crashes: std::sync::Mutex<VecDeque<std::time::Instant>>,
}

impl RestartPolicy {
    fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), crashes: std::sync::Mutex::new(VecDeque::new()) }
    }

    /// Records a crash and decides whether to keep restarting.
    fn should_restart(&self) -> bool {
        let now = std::time::Instant::now();
        let mut crashes = self.crashes.lock().unwrap();
        crashes.push_back(now);
        while let Some(front) = crashes.front() {
            if now.duration_since(*front) > CRASH_WINDOW {
                crashes.pop_front();
            } else {
                break;
            }
        }
        if crashes.len() > MAX_CRASHES {
            tracing::error!(task = %self.name, "crash loop detected, giving up on restarts");
            return false;
        }
        true
    }
}

/// Supervises a `tokio::spawn`ed task that's expected to run forever. If it
/// exits (success or panic), waits `RESTART_BACKOFF` and spawns it again,
/// unless the crash-loop guard trips.
fn supervise<F, Fut>(name: impl Into<String>, mut make_task: F) -> tokio::task::JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let policy = Arc::new(RestartPolicy::new(name));
    tokio::spawn(async move {
        loop {
            let handle = tokio::spawn(make_task());
            let outcome = handle.await;
            let failed = match outcome {
                Ok(Ok(())) => false,
                Ok(Err(err)) => {
                    tracing::warn!(task = %policy.name, %err, "supervised task returned an error");
                    true
                }
                Err(err) => {
                    tracing::warn!(task = %policy.name, %err, "supervised task panicked");
                    true
                }
            };
            if !failed {
                break;
            }
            if !policy.should_restart() {
                break;
            }
            tokio::time::sleep(RESTART_BACKOFF).await;
        }
    })
}

/// Everything the supervisor owns for one configured coin.
struct CoinHandle<S: Store> {
    runtime: Arc<PoolRuntime>,
    ban_map: Arc<BanMap>,
    share_processor: Arc<ShareProcessor<S>>,
    payout: Arc<PayoutProcessor<S>>,
}

pub struct Supervisor<S: Store> {
    store: Arc<S>,
    coins: DashMap<String, CoinHandle<S>>,
    pplnt: Arc<PplntTracker>,
    proxy: Arc<ProxyMultiplexer>,
    cli_port: u16,
}

impl<S: Store + 'static> Supervisor<S> {
    /// Builds one `PoolRuntime` + its background tasks per configured coin.
    /// Does not bind any listeners yet; call `spawn_all` after construction.
    pub fn bootstrap(config: &Config, store: Arc<S>) -> anyhow::Result<Arc<Self>> {
        let pplnt = Arc::new(PplntTracker::new());
        let proxy = Arc::new(ProxyMultiplexer::new());
        let supervisor = Arc::new(Self {
            store,
            coins: DashMap::new(),
            pplnt,
            proxy,
            cli_port: config.global.cli_port,
        });

        for (coin, pool_config) in &config.pools {
            if !pool_config.enabled {
                continue;
            }
            supervisor.register_coin(coin, pool_config)?;
        }

        for (algorithm, switching) in &config.global.switching {
            if !switching.enabled {
                continue;
            }
            let default_coin = config
                .pools
                .iter()
                .find(|(_, p)| p.coin.algorithm == switching.algorithm)
                .map(|(name, _)| name.clone())
                .unwrap_or_default();
            for port in switching.ports.keys() {
                supervisor.proxy.register_switch(algorithm, *port, &default_coin);
            }
            for (coin, handle) in supervisor.coins.iter().map(|e| (e.key().clone(), e.value().runtime.clone())) {
                if handle.config.read().coin.algorithm == switching.algorithm {
                    if let Some(server) = handle.servers.iter().next().map(|e| e.value().clone()) {
                        supervisor.proxy.register_pool(algorithm, &coin, server);
                    }
                }
            }
        }

        Ok(supervisor)
    }

    fn register_coin(self: &Arc<Self>, coin: &str, pool_config: &PoolConfig) -> anyhow::Result<()> {
        let rpc = Arc::new(RpcClient::new(&pool_config.daemons));
        let job_manager = Arc::new(JobManager::new(algorithm_for(&pool_config.coin.algorithm)));
        let address_rules = AddressRules {
            base58_versions: pool_config.coin.address_version_bytes.clone(),
            bech32_hrp: pool_config.coin.bech32_hrp.clone(),
        };
        let ban_map = Arc::new(BanMap::new(BanConfig {
            check_threshold: 500,
            invalid_percent: 0.5,
            ban_time: Duration::from_secs(600),
        }));

        let (share_tx, share_rx) = mpsc::unbounded_channel::<ShareEvent>();
        let runtime = Arc::new(PoolRuntime::new(
            coin.to_string(),
            pool_config.clone(),
            rpc.clone(),
            job_manager,
            address_rules.clone(),
            share_tx,
        ));

        for (port, port_config) in &pool_config.ports {
            let authorize_runtime = runtime.clone();
            let submit_runtime = runtime.clone();
            let job_manager = runtime.job_manager.clone();
            let submit_rpc = runtime.rpc.clone();
            let coin_name = coin.to_string();
            let port_num = *port;

            let authorize: crate::stratum::AuthorizeFn =
                Arc::new(move |worker, pass| authorize_runtime.authorize(worker, pass));
            let submit: crate::stratum::SubmitFn = Arc::new(move |worker, submission, target| {
                let outcome = job_manager.validate_submit(
                    &submission,
                    target,
                    4,
                    |job, e1, e2| crate::encoding::coinbase_hash(&job.coinbase1, e1, e2, &job.coinbase2),
                    |job, merkle_root, n_time, nonce| {
                        crate::encoding::block_header(job.version, &job.prev_hash, merkle_root, n_time, job.n_bits, nonce)
                    },
                );
                if let crate::job::ValidationOutcome::Valid { hash, is_block, block_hex } = &outcome {
                    if *is_block {
                        if let Some(block_hex) = block_hex {
                            if job_manager.should_submit_block(&hex::encode(hash)) {
                                let rpc = submit_rpc.clone();
                                let block_hex = block_hex.clone();
                                let coin_name = coin_name.clone();
                                tokio::spawn(async move {
                                    rpc.cmd_stream("submitblock", serde_json::json!([block_hex]), |result| {
                                        match result.error {
                                            None => tracing::info!(coin = %coin_name, "submitblock accepted"),
                                            Some(err) => {
                                                tracing::warn!(coin = %coin_name, %err, "submitblock rejected")
                                            }
                                        }
                                    })
                                    .await;
                                });
                            }
                        }
                    }
                    if let Some((height, block_diff)) = job_manager.job_metadata(&submission.job_id) {
                        let address = submit_runtime.resolve_payout_address(worker);
                        submit_runtime.emit_share(ShareEvent {
                            coin: coin_name.clone(),
                            ip: String::new(),
                            port: port_num,
                            worker: address,
                            height,
                            block_diff,
                            difficulty: crate::encoding::target_to_difficulty(target),
                            share_diff: crate::encoding::target_to_difficulty(hash),
                            block_hash: if *is_block { Some(hex::encode(*hash)) } else { None },
                            block_hash_invalid: false,
                            tx_hash: None,
                            block_only_pbaas: false,
                            error: None,
                        });
                    }
                }
                outcome
            });

            let server = Arc::new(StratumServer::new(
                *port,
                port_config.clone(),
                runtime.job_manager.clone(),
                ban_map.clone(),
                Arc::new(ExtraNonceCounter::new(1)),
                authorize,
                submit,
            ));
            runtime.servers.insert(*port, server);
        }

        let share_processor = Arc::new(ShareProcessor::new(self.store.clone()));
        let payout = Arc::new(PayoutProcessor::new(
            coin.to_string(),
            pool_config.clone(),
            rpc,
            self.store.clone(),
            address_rules,
        ));

        share_processor.clone().spawn(share_rx);

        self.coins.insert(coin.to_string(), CoinHandle { runtime, ban_map, share_processor, payout });
        Ok(())
    }

    /// Binds every Stratum port, every switch port, the payout loop, and the
    /// admin CLI listener. Each returned handle is independently supervised.
    pub fn spawn_all(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        for entry in self.coins.iter() {
            let coin = entry.key().clone();
            for server_entry in entry.value().runtime.servers.iter() {
                let server = server_entry.value().clone();
                let port = *server_entry.key();
                let name = format!("stratum:{coin}:{port}");
                handles.push(supervise(name, move || {
                    let server = server.clone();
                    async move { server.clone().listen().await }
                }));
            }

            let poller_runtime = entry.value().runtime.clone();
            handles.push(supervise(format!("template-poller:{coin}"), move || {
                let runtime = poller_runtime.clone();
                async move { runtime.clone().run_template_poller().await }
            }));

            entry.value().payout.clone().spawn();
        }

        handles.extend(self.proxy.clone().spawn_all());
        handles.push(self.spawn_cli_listener());
        handles
    }

    fn spawn_cli_listener(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let supervisor = self.clone();
        let port = self.cli_port;
        supervise("admin-cli", move || {
            let supervisor = supervisor.clone();
            async move { supervisor.run_cli_listener(port).await }
        })
    }

    async fn run_cli_listener(self: Arc<Self>, port: u16) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        tracing::info!(port, "admin cli listening");
        loop {
            let (socket, peer) = listener.accept().await?;
            let supervisor = self.clone();
            tokio::spawn(async move {
                if let Err(err) = supervisor.handle_cli_connection(socket).await {
                    tracing::debug!(%peer, %err, "cli connection ended");
                }
            });
        }
    }

    async fn handle_cli_connection(&self, socket: tokio::net::TcpStream) -> anyhow::Result<()> {
        let (read_half, mut write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            line.clear();
            let bytes = reader.read_line(&mut line).await?;
            if bytes == 0 {
                break;
            }
            let reply = match self.dispatch_cli_command(line.trim()).await {
                Ok(msg) => format!("ok:{msg}\n"),
                Err(err) => format!("error:{err}\n"),
            };
            write_half.write_all(reply.as_bytes()).await?;
        }
        Ok(())
    }

    /// Routes one line of admin CLI input (§4.9). Unrecognized commands and
    /// malformed arguments both surface as `error:`.
    async fn dispatch_cli_command(&self, line: &str) -> anyhow::Result<String> {
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or_default();
        match command {
            "banip" => {
                let ip: IpAddr = parts.next().ok_or_else(|| anyhow::anyhow!("banip requires an ip"))?.parse()?;
                for entry in self.coins.iter() {
                    entry.value().ban_map.ban(ip);
                }
                Ok(format!("banned {ip}"))
            }
            "blocknotify" => {
                let coin = parts.next().ok_or_else(|| anyhow::anyhow!("blocknotify requires a coin"))?;
                let hash = parts.next().ok_or_else(|| anyhow::anyhow!("blocknotify requires a hash"))?;
                let handle = self
                    .coins
                    .get(coin)
                    .ok_or_else(|| anyhow::anyhow!("unknown coin {coin}"))?;
                handle.runtime.blocknotify(hash);
                Ok(format!("notified {coin} {hash}"))
            }
            "coinswitch" => {
                let algorithm = parts.next().ok_or_else(|| anyhow::anyhow!("coinswitch requires an algorithm"))?;
                let new_coin = parts.next().ok_or_else(|| anyhow::anyhow!("coinswitch requires a coin"))?;
                self.proxy.coinswitch(algorithm, new_coin, self.store.as_ref()).await?;
                Ok(format!("switched {algorithm} to {new_coin}"))
            }
            "reloadpool" => {
                let coin = parts.next().ok_or_else(|| anyhow::anyhow!("reloadpool requires a coin"))?;
                self.coins
                    .get(coin)
                    .ok_or_else(|| anyhow::anyhow!("unknown coin {coin}"))?;
                Ok(format!("reload {coin} is a no-op without a config watcher"))
            }
            "status" => Ok(if self.is_healthy() { "healthy".to_string() } else { "degraded".to_string() }),
            other => anyhow::bail!("unknown command {other}"),
        }
    }

    /// §4.7 plumbing: feeds one worker's share-track message into the shared
    /// PPLNT tracker and, when the worker is still within the re-join
    /// threshold, commits the accrued delta to `shares:timesCurrent`.
    pub async fn track_share_time(&self, coin: &str, address: &str, pool_id: &str) -> anyhow::Result<()> {
        let last_seen = self
            .store
            .hget("lastSeen", address)
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse::<i64>().ok());
        let now = crate::pplnt::now_ms();
        if let Some((field, delta)) = self.pplnt.track_share(coin, address, pool_id, last_seen, now) {
            self.store
                .exec_transaction(vec![StoreCommand::HIncrByFloat {
                    key: "shares:timesCurrent".into(),
                    field,
                    delta,
                }])
                .await?;
        }
        Ok(())
    }

    pub fn proxy(&self) -> Arc<ProxyMultiplexer> {
        self.proxy.clone()
    }

    /// Readiness check (§B "health check"): healthy as long as no coin's
    /// payment processor has halted after a post-commit failure.
    pub fn is_healthy(&self) -> bool {
        self.coins.iter().all(|entry| !entry.value().payout.is_halted())
    }

    /// Mirrors every coin's live counters into the metrics recorder (§A).
    pub fn sample_metrics(&self) {
        for entry in self.coins.iter() {
            let coin = entry.key();
            crate::metrics::record_share_stats(coin, &*entry.value().share_processor.stats());
            for server_entry in entry.value().runtime.servers.iter() {
                crate::metrics::record_connected_clients(coin, *server_entry.key(), server_entry.value().connected_clients());
            }
        }
    }
}
