//! Proxy multiplexer (C10, §4.10): optional algorithm-keyed switch ports
//! that hand each accepted socket to whichever pool currently owns the
//! algorithm, and re-home connected miners on `coinswitch`.
//!
//! Accept-loop-per-listener shape follows C4's `StratumServer::listen`; the
//! handoff/relinquish mechanics are new, grounded directly in §4.10.

use crate::store::{Store, StoreCommand};
use crate::stratum::StratumServer;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::net::TcpListener;

struct Switch {
    port: u16,
    current_coin: RwLock<String>,
    pools: DashMap<String, Arc<StratumServer>>,
}

#[derive(Default)]
pub struct ProxyMultiplexer {
    switches: DashMap<String, Arc<Switch>>,
}

impl ProxyMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the switch port for `algorithm`, defaulting its active coin
    /// to `default_coin` until a `coinswitch` or a restored `proxyState`
    /// entry overrides it.
    pub fn register_switch(&self, algorithm: &str, port: u16, default_coin: &str) {
        self.switches.insert(
            algorithm.to_string(),
            Arc::new(Switch { port, current_coin: RwLock::new(default_coin.to_string()), pools: DashMap::new() }),
        );
    }

    /// Attaches a coin's Stratum server as a possible `coinswitch` target.
    pub fn register_pool(&self, algorithm: &str, coin: &str, server: Arc<StratumServer>) {
        if let Some(switch) = self.switches.get(algorithm) {
            switch.pools.insert(coin.to_string(), server);
        }
    }

    /// Restores a persisted `proxyState` mapping (§3) at startup.
    pub fn restore_state(&self, algorithm: &str, coin: &str) {
        if let Some(switch) = self.switches.get(algorithm) {
            *switch.current_coin.write() = coin.to_string();
        }
    }

    pub fn current_coin(&self, algorithm: &str) -> Option<String> {
        self.switches.get(algorithm).map(|s| s.current_coin.read().clone())
    }

    pub fn registered_algorithms(&self) -> Vec<String> {
        self.switches.iter().map(|e| e.key().clone()).collect()
    }

    /// Spawns the accept loop for every registered switch port.
    pub fn spawn_all(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        self.registered_algorithms()
            .into_iter()
            .map(|algorithm| {
                let proxy = self.clone();
                tokio::spawn(async move { proxy.listen(algorithm).await })
            })
            .collect()
    }

    async fn listen(self: Arc<Self>, algorithm: String) {
        let Some(port) = self.switches.get(&algorithm).map(|s| s.port) else {
            return;
        };
        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(%algorithm, port, %err, "proxy switch failed to bind");
                return;
            }
        };
        tracing::info!(%algorithm, port, "proxy switch listening");
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(%algorithm, %err, "proxy accept failed");
                    continue;
                }
            };
            let Some(target) = self.current_target(&algorithm) else {
                tracing::warn!(%algorithm, "no target pool registered for switch, dropping connection");
                continue;
            };
            tokio::spawn(target.accept_external(socket, peer));
        }
    }

    fn current_target(&self, algorithm: &str) -> Option<Arc<StratumServer>> {
        let switch = self.switches.get(algorithm)?;
        let coin = switch.current_coin.read().clone();
        switch.pools.get(&coin).map(|entry| entry.clone())
    }

    /// `coinswitch` (§4.10): every client currently attached via this switch
    /// port is relinquished from the old pool (the release predicate is
    /// "everyone", since a switch retargets the whole port, not individual
    /// miners), the switch is repointed, and the mapping is persisted.
    /// Miners land on the new pool on their next reconnect.
    pub async fn coinswitch<S: Store>(&self, algorithm: &str, new_coin: &str, store: &S) -> anyhow::Result<()> {
        let switch = self
            .switches
            .get(algorithm)
            .ok_or_else(|| anyhow::anyhow!("no switch registered for algorithm {algorithm}"))?
            .clone();
        if !switch.pools.contains_key(new_coin) {
            anyhow::bail!("coin {new_coin} is not a registered target for algorithm {algorithm}");
        }

        let old_coin = switch.current_coin.read().clone();
        if let Some(old_server) = switch.pools.get(&old_coin) {
            old_server.disconnect_clients_where(|_worker| true).await;
        }
        *switch.current_coin.write() = new_coin.to_string();

        store
            .exec_transaction(vec![StoreCommand::HSet {
                key: "proxyState".into(),
                field: algorithm.to_string(),
                value: new_coin.to_string(),
            }])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortConfig;
    use crate::job::JobManager;
    use crate::store::fake::FakeStore;
    use crate::stratum::{BanConfig, BanMap, ExtraNonceCounter};
    use std::sync::Arc;

    fn dummy_server(port: u16) -> Arc<StratumServer> {
        let job_manager = Arc::new(JobManager::new(Arc::new(crate::encoding::Sha256dAlgorithm)));
        let ban_map = Arc::new(BanMap::new(BanConfig {
            check_threshold: 500,
            invalid_percent: 0.5,
            ban_time: std::time::Duration::from_secs(600),
        }));
        let extra_nonce_counter = Arc::new(ExtraNonceCounter::new(1));
        Arc::new(StratumServer::new(
            port,
            PortConfig { diff: 1.0, var_diff: None, tls: false },
            job_manager,
            ban_map,
            extra_nonce_counter,
            Arc::new(|_worker, _pass| true),
            Arc::new(|_worker, _submission, _target| crate::job::ValidationOutcome::Rejected { reason: "test" }),
        ))
    }

    #[test]
    fn defaults_to_the_registered_default_coin() {
        let proxy = ProxyMultiplexer::new();
        proxy.register_switch("sha256d", 3333, "btc");
        assert_eq!(proxy.current_coin("sha256d").as_deref(), Some("btc"));
    }

    #[test]
    fn restore_state_overrides_the_default() {
        let proxy = ProxyMultiplexer::new();
        proxy.register_switch("sha256d", 3333, "btc");
        proxy.restore_state("sha256d", "ltc");
        assert_eq!(proxy.current_coin("sha256d").as_deref(), Some("ltc"));
    }

    #[tokio::test]
    async fn coinswitch_repoints_the_switch_and_persists_state() {
        let proxy = ProxyMultiplexer::new();
        proxy.register_switch("sha256d", 3333, "btc");
        proxy.register_pool("sha256d", "btc", dummy_server(3333));
        proxy.register_pool("sha256d", "ltc", dummy_server(3334));

        let store = FakeStore::new();
        proxy.coinswitch("sha256d", "ltc", &store).await.unwrap();

        assert_eq!(proxy.current_coin("sha256d").as_deref(), Some("ltc"));
        assert_eq!(store.hash("proxyState").get("sha256d").unwrap(), "ltc");
    }

    #[tokio::test]
    async fn coinswitch_rejects_an_unregistered_target() {
        let proxy = ProxyMultiplexer::new();
        proxy.register_switch("sha256d", 3333, "btc");
        proxy.register_pool("sha256d", "btc", dummy_server(3333));

        let store = FakeStore::new();
        assert!(proxy.coinswitch("sha256d", "doge", &store).await.is_err());
    }
}
