//! Share processor (C6): single writer per coin, turns `ShareEvent`s into the
//! one atomic store transaction that the round-freeze invariant (§4.6, §8)
//! depends on.
//!
//! Task shape (a dedicated background task draining an unbounded channel,
//! atomic counters exposed for introspection) follows the teacher's
//! `ShareProcessor::start_cleanup_task`/statistics idiom; the transaction
//! body is new, grounded in the rename-then-insert sequencing of the Zion
//! `shares-processor.rs` block-handling path.

use crate::pool::ShareEvent;
use crate::store::{Store, StoreCommand};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
pub struct ShareProcessorStats {
    pub valid_shares: AtomicU64,
    pub invalid_shares: AtomicU64,
    pub valid_blocks: AtomicU64,
    pub invalid_blocks: AtomicU64,
}

pub struct ShareProcessor<S: Store> {
    store: Arc<S>,
    stats: Arc<ShareProcessorStats>,
}

impl<S: Store + 'static> ShareProcessor<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store, stats: Arc::new(ShareProcessorStats::default()) }
    }

    pub fn stats(&self) -> Arc<ShareProcessorStats> {
        self.stats.clone()
    }

    /// Spawns the single-writer task for one coin. The supervisor (C9) holds
    /// the returned handle as part of its per-coin restart bookkeeping.
    pub fn spawn(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ShareEvent>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(err) = self.process(event).await {
                    tracing::error!(%err, "share transaction failed");
                }
            }
        })
    }

    async fn process(&self, event: ShareEvent) -> anyhow::Result<()> {
        debug_assert!(event.is_consistent());
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let epoch_s = now.as_secs();
        let epoch_ms = now.as_millis();

        let is_valid_share = event.error.is_none() && event.share_diff >= event.difficulty;
        let mut commands = Vec::new();

        if is_valid_share {
            commands.push(StoreCommand::HIncrByFloat {
                key: "shares:pbaasCurrent".into(),
                field: event.worker.clone(),
                delta: event.difficulty,
            });
            commands.push(StoreCommand::HIncrByFloat {
                key: "shares:roundCurrent".into(),
                field: event.worker.clone(),
                delta: event.difficulty,
            });
            commands.push(StoreCommand::HIncrBy { key: "stats".into(), field: "validShares".into(), delta: 1 });
            commands.push(StoreCommand::HSet {
                key: "lastSeen".into(),
                field: event.worker.clone(),
                value: epoch_s.to_string(),
            });
            self.stats.valid_shares.fetch_add(1, Ordering::Relaxed);
        } else {
            commands.push(StoreCommand::HIncrBy { key: "stats".into(), field: "invalidShares".into(), delta: 1 });
            self.stats.invalid_shares.fetch_add(1, Ordering::Relaxed);
        }

        // Negative diff encodes an invalid share; the epoch-ms suffix keeps
        // the member unique within the same second.
        let signed_diff = if is_valid_share { event.share_diff } else { -event.share_diff };
        commands.push(StoreCommand::ZAdd {
            key: "hashrate".into(),
            score: epoch_s as f64,
            member: format!("{signed_diff}:{}:{epoch_ms}", event.worker),
        });

        if let Some(block_hash) = &event.block_hash {
            commands.push(StoreCommand::SAdd {
                key: "pbaasPending".into(),
                member: format!("{block_hash}:{}:{epoch_ms}", event.worker),
            });

            if !event.block_only_pbaas {
                // Round freeze: rename must land in the same transaction as
                // the blocksPending insert so no share can straddle both.
                commands.push(StoreCommand::Rename {
                    from: "shares:roundCurrent".into(),
                    to: format!("shares:round{}", event.height),
                });
                commands.push(StoreCommand::Rename {
                    from: "shares:timesCurrent".into(),
                    to: format!("shares:times{}", event.height),
                });
                let tx_hash = event.tx_hash.clone().unwrap_or_default();
                commands.push(StoreCommand::SAdd {
                    key: "blocksPending".into(),
                    member: format!("{block_hash}:{tx_hash}:{}:{}:{epoch_ms}", event.height, event.worker),
                });
                commands.push(StoreCommand::HIncrBy { key: "stats".into(), field: "validBlocks".into(), delta: 1 });
                self.stats.valid_blocks.fetch_add(1, Ordering::Relaxed);
            }
        } else if event.block_hash_invalid {
            commands.push(StoreCommand::HIncrBy { key: "stats".into(), field: "invalidBlocks".into(), delta: 1 });
            self.stats.invalid_blocks.fetch_add(1, Ordering::Relaxed);
        }

        if let Err(err) = self.store.exec_transaction(commands.clone()).await {
            tracing::error!(
                %err,
                recovery = %crate::store::render_recovery_commands(&commands),
                "share transaction failed, recovery commands logged"
            );
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fake::FakeStore;

    fn share(worker: &str, diff: f64, share_diff: f64) -> ShareEvent {
        ShareEvent {
            coin: "test".into(),
            ip: "127.0.0.1".into(),
            port: 3333,
            worker: worker.into(),
            height: 100,
            block_diff: 1.0,
            difficulty: diff,
            share_diff,
            block_hash: None,
            block_hash_invalid: false,
            tx_hash: None,
            block_only_pbaas: false,
            error: None,
        }
    }

    #[tokio::test]
    async fn valid_share_credits_round_and_stats() {
        let store = Arc::new(FakeStore::new());
        let processor = ShareProcessor::new(store.clone());
        processor.process(share("alice.rig1", 1.0, 1.0)).await.unwrap();

        assert_eq!(store.hash("shares:roundCurrent").get("alice.rig1").unwrap(), "1");
        assert_eq!(store.hash("stats").get("validShares").unwrap(), "1");
        assert_eq!(processor.stats().valid_shares.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn invalid_share_does_not_touch_round() {
        let store = Arc::new(FakeStore::new());
        let processor = ShareProcessor::new(store.clone());
        let mut event = share("alice.rig1", 2.0, 1.0);
        event.error = Some("low difficulty share".into());
        processor.process(event).await.unwrap();

        assert!(store.hash("shares:roundCurrent").get("alice.rig1").is_none());
        assert_eq!(store.hash("stats").get("invalidShares").unwrap(), "1");
    }

    #[tokio::test]
    async fn main_chain_block_freezes_the_round() {
        let store = Arc::new(FakeStore::new());
        store.seed_hash("shares:roundCurrent", &[("alice.rig1", "5")]);
        let processor = ShareProcessor::new(store.clone());

        let mut event = share("alice.rig1", 1.0, 1.0);
        event.block_hash = Some("abcd".into());
        event.tx_hash = Some("txid".into());
        processor.process(event).await.unwrap();

        assert!(store.hash("shares:roundCurrent").is_empty());
        assert_eq!(store.hash("shares:round100").get("alice.rig1").unwrap(), "6");
        assert!(store.set("blocksPending").iter().any(|m| m.starts_with("abcd:txid:100:alice.rig1:")));
        assert_eq!(store.hash("stats").get("validBlocks").unwrap(), "1");
    }

    #[tokio::test]
    async fn pbaas_only_block_does_not_freeze_the_round() {
        let store = Arc::new(FakeStore::new());
        store.seed_hash("shares:roundCurrent", &[("alice.rig1", "5")]);
        let processor = ShareProcessor::new(store.clone());

        let mut event = share("alice.rig1", 1.0, 1.0);
        event.block_hash = Some("abcd".into());
        event.block_only_pbaas = true;
        processor.process(event).await.unwrap();

        assert_eq!(store.hash("shares:roundCurrent").get("alice.rig1").unwrap(), "6");
        assert!(store.set("blocksPending").is_empty());
        assert!(store.set("pbaasPending").iter().any(|m| m.starts_with("abcd:alice.rig1:")));
    }

    #[tokio::test]
    async fn invalid_block_increments_invalid_block_counter() {
        let store = Arc::new(FakeStore::new());
        let processor = ShareProcessor::new(store.clone());
        let mut event = share("alice.rig1", 1.0, 1.0);
        event.block_hash_invalid = true;
        processor.process(event).await.unwrap();

        assert_eq!(store.hash("stats").get("invalidBlocks").unwrap(), "1");
    }
}
