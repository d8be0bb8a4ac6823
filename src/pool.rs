//! Pool runtime (C5): owns one coin's C2 (RPC client), C3 (job manager) and
//! C4 (Stratum servers), wires share events out to C6/C9, and implements
//! the authorization predicate.
//!
//! Struct shape (DashMap of live connections, RwLock'd aggregate stats)
//! follows the teacher's `mining::MiningPool`; the owned components and the
//! share-event plumbing are new, driven by §4.5.

use crate::config::PoolConfig;
use crate::encoding::AddressRules;
use crate::job::{Job, JobManager};
use crate::rpc::RpcClient;
use crate::stratum::StratumServer;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Pool signature embedded in every coinbase's scriptSig, ahead of the
/// extranonce placeholder (classic s-nomp coinbase layout, §4.3).
const POOL_SIGNATURE: &[u8] = b"/lodestone-pool/";
/// `extraNonce1` (4 bytes, assigned per connection) + `extraNonce2` (4 bytes,
/// miner-supplied) — the gap `coinbase1`/`coinbase2` are split around.
const EXTRANONCE_PLACEHOLDER_LEN: usize = 8;

/// Emitted by C4 to C6/C9 on every processed submission (§3 "Share event").
#[derive(Debug, Clone)]
pub struct ShareEvent {
    pub coin: String,
    pub ip: String,
    pub port: u16,
    pub worker: String,
    pub height: u64,
    pub block_diff: f64,
    pub difficulty: f64,
    pub share_diff: f64,
    pub block_hash: Option<String>,
    pub block_hash_invalid: bool,
    pub tx_hash: Option<String>,
    pub block_only_pbaas: bool,
    pub error: Option<String>,
}

impl ShareEvent {
    /// Invariant (§3): exactly one of `block_hash`/`block_hash_invalid`/neither.
    pub fn is_consistent(&self) -> bool {
        !(self.block_hash.is_some() && self.block_hash_invalid)
    }
}

pub struct PoolRuntime {
    pub coin: String,
    pub config: parking_lot::RwLock<PoolConfig>,
    pub rpc: Arc<RpcClient>,
    pub job_manager: Arc<JobManager>,
    pub servers: DashMap<u16, Arc<StratumServer>>,
    pub address_rules: AddressRules,
    pub share_tx: mpsc::UnboundedSender<ShareEvent>,
    current_job: parking_lot::RwLock<Option<Arc<Job>>>,
    last_broadcast: parking_lot::Mutex<Option<Instant>>,
    last_prev_hash: parking_lot::Mutex<Option<String>>,
    /// Nudged by `blocknotify` for an immediate out-of-band template refresh,
    /// ahead of the poller's own `block_refresh_interval_secs` cadence.
    pub refresh_notify: Arc<tokio::sync::Notify>,
}

impl PoolRuntime {
    pub fn new(
        coin: String,
        config: PoolConfig,
        rpc: Arc<RpcClient>,
        job_manager: Arc<JobManager>,
        address_rules: AddressRules,
        share_tx: mpsc::UnboundedSender<ShareEvent>,
    ) -> Self {
        Self {
            coin,
            config: parking_lot::RwLock::new(config),
            rpc,
            job_manager,
            servers: DashMap::new(),
            address_rules,
            share_tx,
            current_job: parking_lot::RwLock::new(None),
            last_broadcast: parking_lot::Mutex::new(None),
            last_prev_hash: parking_lot::Mutex::new(None),
            refresh_notify: Arc::new(tokio::sync::Notify::new()),
        }
    }

    /// Authorization predicate (§4.5): the pool always credits the declared
    /// worker key (for miner-visible hashrate) but resolves accounting to
    /// the fallback address when the declared address fails validation.
    pub fn resolve_payout_address(&self, worker: &str) -> String {
        let address = worker.split('.').next().unwrap_or(worker);
        if crate::encoding::validate_address(address, &self.address_rules) {
            address.to_string()
        } else {
            let config = self.config.read();
            config.invalid_address.clone().unwrap_or_else(|| config.address.clone())
        }
    }

    pub fn authorize(&self, worker: &str, _password: Option<&str>) -> bool {
        if !self.config.read().validate_worker_username {
            return true;
        }
        let address = worker.split('.').next().unwrap_or(worker);
        crate::encoding::validate_address(address, &self.address_rules)
    }

    pub fn emit_share(&self, event: ShareEvent) {
        debug_assert!(event.is_consistent());
        let _ = self.share_tx.send(event);
    }

    /// IPC: `banIP` forwarded from any pool worker (§4.9).
    pub fn ban_ip(&self, ip: std::net::IpAddr, ban_map: &crate::stratum::BanMap) {
        ban_map.ban(ip);
    }

    /// IPC: `blocknotify <coin> <hash>` — wakes the template poller for an
    /// immediate refresh instead of waiting out its regular interval.
    pub fn blocknotify(&self, block_hash: &str) {
        tracing::info!(coin = %self.coin, %block_hash, "block notification received");
        self.refresh_notify.notify_one();
    }

    /// IPC: `reloadpool <coin>`. Returns the previous config.
    pub fn reload(&self, new_config: PoolConfig) -> PoolConfig {
        std::mem::replace(&mut *self.config.write(), new_config)
    }

    /// Builds the two coinbase halves around the extranonce placeholder gap
    /// (§4.3): `scriptSig = heightPush ++ poolTag`, one P2PKH output paying
    /// the pool's configured address. Grounded in the classic s-nomp
    /// coinbase layout this specification's lineage (`_INDEX.md`) descends
    /// from — there is no teacher equivalent to adapt.
    fn build_coinbase(height: u64, value_satoshis: i64, payout_script: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let height_push = crate::encoding::serialize_number(height as i64);
        let script_sig_len = height_push.len() + POOL_SIGNATURE.len() + EXTRANONCE_PLACEHOLDER_LEN;

        let mut coinbase1 = Vec::new();
        coinbase1.extend_from_slice(&1u32.to_le_bytes()); // tx version
        coinbase1.extend(crate::encoding::var_int_encode(1)); // one input
        coinbase1.extend_from_slice(&[0u8; 32]); // null prevout hash
        coinbase1.extend_from_slice(&0xffff_ffffu32.to_le_bytes()); // null prevout index
        coinbase1.extend(crate::encoding::var_int_encode(script_sig_len as u64));
        coinbase1.extend_from_slice(&height_push);
        coinbase1.extend_from_slice(POOL_SIGNATURE);

        let mut coinbase2 = Vec::new();
        coinbase2.extend_from_slice(&0xffff_ffffu32.to_le_bytes()); // sequence
        coinbase2.extend(crate::encoding::var_int_encode(1)); // one output
        coinbase2.extend_from_slice(&(value_satoshis.max(0) as u64).to_le_bytes());
        coinbase2.extend(crate::encoding::var_int_encode(payout_script.len() as u64));
        coinbase2.extend_from_slice(payout_script);
        coinbase2.extend_from_slice(&0u32.to_le_bytes()); // locktime

        (coinbase1, coinbase2)
    }

    /// Turns one `getblocktemplate` response into a built `Job`, registering
    /// it with the job manager. `None` on any field a minimal template is
    /// missing — the caller just skips that poll tick and retries next time.
    fn build_job_from_template(&self, template: &serde_json::Value) -> Option<Arc<Job>> {
        let prev_hash = template.get("previousblockhash")?.as_str()?.to_string();
        let n_bits = u32::from_str_radix(template.get("bits")?.as_str()?, 16).ok()?;
        let version = template.get("version").and_then(|v| v.as_u64()).unwrap_or(1) as u32;
        let n_time = template.get("curtime").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        let height = template.get("height").and_then(|v| v.as_u64())?;
        let coinbase_value = template.get("coinbasevalue").and_then(|v| v.as_i64()).unwrap_or(0);

        let payout_address = self.config.read().address.clone();
        let payout_script = crate::encoding::pay_to_pubkey_hash_script(&payout_address)?;
        let (coinbase1, coinbase2) = Self::build_coinbase(height, coinbase_value, &payout_script);

        let txs = template.get("transactions").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        let mut tx_hashes = Vec::with_capacity(txs.len());
        let mut tx_data = Vec::with_capacity(txs.len());
        for tx in &txs {
            let hash_hex = tx.get("hash").or_else(|| tx.get("txid")).and_then(|v| v.as_str())?;
            let mut bytes: [u8; 32] = hex::decode(hash_hex).ok()?.try_into().ok()?;
            bytes.reverse(); // daemon's display order -> internal byte order
            tx_hashes.push(bytes);
            tx_data.push(tx.get("data").and_then(|v| v.as_str()).unwrap_or_default().to_string());
        }
        let merkle_branches = crate::encoding::merkle_branches_for_coinbase(&tx_hashes);

        let clean_jobs = {
            let mut last_prev = self.last_prev_hash.lock();
            let changed = last_prev.as_deref() != Some(prev_hash.as_str());
            *last_prev = Some(prev_hash.clone());
            changed
        };

        Some(self.job_manager.build_job(
            prev_hash,
            coinbase1,
            coinbase2,
            merkle_branches,
            version,
            n_bits,
            n_time,
            height,
            clean_jobs,
            tx_data,
        ))
    }

    /// One poll tick (§4.3/§4.4 "job broadcast"): fetches the daemon's
    /// current template, broadcasts a fresh `mining.notify` on anything new,
    /// and otherwise re-emits the still-current job once
    /// `JOB_REBROADCAST_TIMEOUT` has elapsed since the last broadcast.
    async fn poll_once(&self) {
        match self.rpc.cmd_first_success("getblocktemplate", serde_json::json!([{"rules": ["segwit"]}])).await {
            Ok(template) => {
                if self.rpc.dedup_template(&template) {
                    if let Some(job) = self.build_job_from_template(&template) {
                        self.broadcast_job(&job);
                    }
                }
            }
            Err(err) => tracing::warn!(coin = %self.coin, %err, "getblocktemplate failed"),
        }

        let due_for_rebroadcast = self
            .last_broadcast
            .lock()
            .as_ref()
            .map(|at| at.elapsed() >= crate::stratum::JOB_REBROADCAST_TIMEOUT)
            .unwrap_or(false);
        if due_for_rebroadcast {
            if let Some(job) = self.current_job.read().clone() {
                self.broadcast_job(&job);
            }
        }
    }

    fn broadcast_job(&self, job: &Arc<Job>) {
        let frame = crate::stratum::notify_frame(job);
        *self.current_job.write() = Some(job.clone());
        *self.last_broadcast.lock() = Some(Instant::now());
        for server in self.servers.iter() {
            server.value().broadcast(&frame);
        }
    }

    /// Runs the template-poll loop forever: ticks on `block_refresh_interval_secs`
    /// or an out-of-band `blocknotify`, whichever comes first.
    pub async fn run_template_poller(self: Arc<Self>) -> anyhow::Result<()> {
        let interval_secs = self.config.read().block_refresh_interval_secs.max(1);
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.refresh_notify.notified() => {}
            }
            self.poll_once().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BannedAddressesConfig, CoinConfig, DaemonConfig, PaymentMode, PaymentProcessingConfig};
    use std::collections::HashMap;

    fn test_pool_config() -> PoolConfig {
        PoolConfig {
            enabled: true,
            address: "pooladdr".into(),
            invalid_address: Some("fallbackaddr".into()),
            payment_processing: PaymentProcessingConfig {
                enabled: true,
                daemon: DaemonConfig { host: "localhost".into(), port: 1, user: "u".into(), password: "p".into() },
                payment_interval: 60,
                payment_mode: PaymentMode::Prop,
                pplnt: 0.51,
                minimum_payment: 0.01,
                min_conf: 1,
                max_blocks_per_payment: 5,
            },
            ports: HashMap::new(),
            daemons: vec![],
            banned_addresses: BannedAddressesConfig::default(),
            validate_worker_username: true,
            coin: CoinConfig {
                name: "test".into(),
                algorithm: "sha256d".into(),
                txfee: 0.0001,
                magnitude: 1e8,
                address_version_bytes: vec![0x00],
                bech32_hrp: None,
            },
            block_refresh_interval_secs: 1,
        }
    }

    fn runtime() -> PoolRuntime {
        let (tx, _rx) = mpsc::unbounded_channel();
        PoolRuntime::new(
            "test".into(),
            test_pool_config(),
            Arc::new(RpcClient::new(&[])),
            Arc::new(JobManager::new(Arc::new(crate::encoding::Sha256dAlgorithm))),
            AddressRules { base58_versions: vec![0x00], bech32_hrp: None },
            tx,
        )
    }

    #[test]
    fn invalid_worker_address_resolves_to_fallback() {
        let pool = runtime();
        assert_eq!(pool.resolve_payout_address("not-an-address.rig1"), "fallbackaddr");
    }

    #[test]
    fn valid_address_is_used_as_is() {
        let pool = runtime();
        let payload = {
            let mut p = vec![0x00u8];
            p.extend_from_slice(&[7u8; 20]);
            p
        };
        let checksum = crate::encoding::sha256d(&payload);
        let mut full = payload;
        full.extend_from_slice(&checksum[..4]);
        let address = bs58::encode(&full).into_string();
        let worker = format!("{address}.rig1");
        assert_eq!(pool.resolve_payout_address(&worker), address);
    }
}
