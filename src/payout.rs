//! Payment processor (C8): the five-stage pipeline from §4.8 — load,
//! classify, compute rewards, execute, commit — plus the recovery-dump path
//! for a send that succeeded but whose commit failed.
//!
//! The deterministic parts of each stage (classification, proportional
//! reward distribution with residue tie-break, PPLNT disqualification,
//! settlement, commit-command construction) are pure functions so they are
//! testable without a daemon or store, in the spirit of the Zion
//! `compute_pplns_payouts` pure-function-plus-test-module pattern. The
//! orchestrating `PayoutProcessor` wires them to the real `RpcClient`/`Store`,
//! following the teacher's interval-task shape in `payout_engine.rs`.

use crate::config::{PaymentMode, PoolConfig};
use crate::encoding::AddressRules;
use crate::rpc::RpcClient;
use crate::store::{render_recovery_commands, Store, StoreCommand};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex as AsyncMutex;

/// RPC error code §4.8 stage 2 treats specially: retried, not immediately fatal.
pub const TRANSACTION_NOT_FOUND_CODE: i64 = -5;
pub const MAX_BAD_BLOCK_RETRIES: u32 = 15;
/// §4.8 stage 4: tolerance against floating satoshi rounding in the safety check.
pub const SAFETY_TOLERANCE_SATOSHIS: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStatus {
    Generate,
    Immature,
    Kicked,
    Orphan,
}

#[derive(Debug, Clone)]
pub struct PendingBlock {
    pub block_hash: String,
    pub tx_hash: String,
    pub height: u64,
    pub minedby: String,
    pub time: i64,
    pub serialized: String,
}

/// Parses a `blockHash:txHash:height:minedby:time` set member (§3).
pub fn parse_pending_block(serialized: &str) -> Option<PendingBlock> {
    let mut parts = serialized.splitn(5, ':');
    let block_hash = parts.next()?.to_string();
    let tx_hash = parts.next()?.to_string();
    let height: u64 = parts.next()?.parse().ok()?;
    let minedby = parts.next()?.to_string();
    let time: i64 = parts.next()?.parse().ok()?;
    Some(PendingBlock { block_hash, tx_hash, height, minedby, time, serialized: serialized.to_string() })
}

/// Groups pending blocks by height so stage 1 can spot collisions.
pub fn group_by_height(blocks: Vec<PendingBlock>) -> HashMap<u64, Vec<PendingBlock>> {
    let mut map: HashMap<u64, Vec<PendingBlock>> = HashMap::new();
    for block in blocks {
        map.entry(block.height).or_default().push(block);
    }
    map
}

/// The wallet's `gettransaction` response, reduced to what stage 2 needs.
#[derive(Debug, Clone)]
pub struct TransactionDetails {
    pub confirmations: i64,
    /// `None` when no output in `details[]` matches the pool's payout address.
    pub category: Option<String>,
    pub reward_satoshis: i64,
}

#[derive(Debug, Clone)]
pub struct ClassifiedRound {
    pub block: PendingBlock,
    pub status: RoundStatus,
    pub confirmations: i64,
    pub reward_satoshis: i64,
    pub can_delete_shares: bool,
    pub shares: HashMap<String, f64>,
    pub times: HashMap<String, f64>,
}

/// Stage 2 classification for one round whose `gettransaction` response was
/// fetched successfully (the `-5` retry path is handled by the caller before
/// this is invoked, since it never needs transaction details at all).
pub fn classify_round(
    block: PendingBlock,
    tx: TransactionDetails,
    min_conf_payout: u32,
    same_height_count: usize,
    shares: HashMap<String, f64>,
    times: HashMap<String, f64>,
) -> ClassifiedRound {
    let can_delete_shares = same_height_count == 1;
    let status = match tx.category.as_deref() {
        Some("orphan") => RoundStatus::Orphan,
        Some("generate") | Some("immature") => {
            if tx.confirmations >= min_conf_payout as i64 {
                RoundStatus::Generate
            } else {
                RoundStatus::Immature
            }
        }
        _ => RoundStatus::Kicked,
    };
    ClassifiedRound {
        block,
        status,
        confirmations: tx.confirmations,
        reward_satoshis: tx.reward_satoshis,
        can_delete_shares,
        shares,
        times,
    }
}

/// A round whose bad-block retry counter has hit [`MAX_BAD_BLOCK_RETRIES`].
pub fn kick_exhausted_round(block: PendingBlock) -> ClassifiedRound {
    ClassifiedRound {
        block,
        status: RoundStatus::Kicked,
        confirmations: 0,
        reward_satoshis: 0,
        can_delete_shares: true,
        shares: HashMap::new(),
        times: HashMap::new(),
    }
}

/// Caps the number of `Generate` rounds paid in a single run, demoting the
/// excess back to `Immature` (§4.8 stage 2, "pay at most maxBlocksPerPayment").
pub fn cap_payable_rounds(rounds: &mut [ClassifiedRound], max_blocks_per_payment: usize) {
    let mut payable = 0usize;
    for round in rounds.iter_mut() {
        if round.status == RoundStatus::Generate {
            payable += 1;
            if payable > max_blocks_per_payment {
                round.status = RoundStatus::Immature;
            }
        }
    }
}

/// §4.7 step 3 / §4.8 stage 3.3: removes workers whose continuous-mining time
/// falls below `roundTime × qualifyFraction`, subtracting their shares from
/// the total distributed.
pub fn apply_pplnt_filter(shares: &mut HashMap<String, f64>, times: &HashMap<String, f64>, round_time_secs: f64, qualify_fraction: f64) {
    let max_time = round_time_secs * qualify_fraction;
    let disqualified: Vec<String> = shares
        .keys()
        .filter(|worker| times.get(*worker).copied().unwrap_or(0.0) < max_time)
        .cloned()
        .collect();
    for worker in disqualified {
        shares.remove(&worker);
    }
}

/// Proportional distribution with exact-sum rounding residue assignment
/// (§4.8 stage 3.4): the residue from `round()` goes to the largest-share
/// worker, ties broken by lexicographically-first worker id.
pub fn distribute_reward(shares: &HashMap<String, f64>, net_reward_satoshis: i64) -> HashMap<String, i64> {
    let total: f64 = shares.values().sum();
    if total <= 0.0 {
        return HashMap::new();
    }

    let mut rewards: HashMap<String, i64> = HashMap::new();
    let mut distributed = 0i64;
    for (worker, share) in shares {
        let reward = ((net_reward_satoshis as f64) * share / total).round() as i64;
        distributed += reward;
        rewards.insert(worker.clone(), reward);
    }

    let residue = net_reward_satoshis - distributed;
    if residue != 0 {
        let mut ordered: Vec<&String> = shares.keys().collect();
        ordered.sort();
        let mut best: Option<&String> = None;
        let mut best_share = f64::MIN;
        for worker in ordered {
            let share = shares[worker];
            if share > best_share {
                best_share = share;
                best = Some(worker);
            }
        }
        if let Some(worker) = best {
            *rewards.get_mut(worker).unwrap() += residue;
        }
    }
    rewards
}

/// Stage 3 for one round: applies the PPLNT filter (when enabled) then
/// distributes `netReward = max(0, blockReward - txFee)`.
pub fn compute_round_payout(round: &ClassifiedRound, payment_mode: PaymentMode, pplnt_qualify: f64, round_time_secs: f64, txfee_satoshis: i64) -> HashMap<String, i64> {
    let mut shares = round.shares.clone();
    if payment_mode == PaymentMode::Pplnt {
        apply_pplnt_filter(&mut shares, &round.times, round_time_secs, pplnt_qualify);
    }
    let net_reward = (round.reward_satoshis - txfee_satoshis).max(0);
    distribute_reward(&shares, net_reward)
}

/// §4.8 stage 3.5: aborts the whole run (demoting every payable round back
/// to `immature`) if the daemon's spendable balance can't cover what's owed.
pub fn spendable_covers_owed(total_balances_satoshis: i64, total_net_rewards_satoshis: i64, spendable_satoshis: i64) -> bool {
    spendable_satoshis >= total_balances_satoshis + total_net_rewards_satoshis
}

#[derive(Debug, Clone, Default)]
pub struct WorkerAccrual {
    pub balance_satoshis: i64,
    pub reward_satoshis: i64,
}

#[derive(Debug, Clone)]
pub struct WorkerSettlement {
    pub address: String,
    pub sent_satoshis: i64,
    pub balance_change_satoshis: i64,
}

/// §4.8 stage 4: selects the addresses meeting `minimumPayment` and computes
/// each worker's `(sent, balanceChange)` pair. Addresses below the threshold
/// are not sent, so their entire accrual defers into `balances`.
pub fn settle_workers(aggregated: HashMap<String, WorkerAccrual>, minimum_payment_satoshis: i64) -> (HashMap<String, i64>, Vec<WorkerSettlement>) {
    let mut to_send = HashMap::new();
    for (address, accrual) in &aggregated {
        let total = accrual.balance_satoshis + accrual.reward_satoshis;
        if total >= minimum_payment_satoshis {
            to_send.insert(address.clone(), total);
        }
    }

    let mut settlements = Vec::with_capacity(aggregated.len());
    for (address, accrual) in aggregated {
        if let Some(&sent) = to_send.get(&address) {
            settlements.push(WorkerSettlement { address, sent_satoshis: sent, balance_change_satoshis: -accrual.balance_satoshis });
        } else {
            settlements.push(WorkerSettlement { address, sent_satoshis: 0, balance_change_satoshis: accrual.reward_satoshis });
        }
    }
    (to_send, settlements)
}

/// Safety check on the built `sendmany` argument map before it is ever sent
/// (§4.8 stage 4): the aggregated total must not exceed what's actually owed.
pub fn sendmany_amount_is_safe(to_send: &HashMap<String, i64>, total_balances_satoshis: i64, total_net_rewards_satoshis: i64) -> bool {
    let sum: i64 = to_send.values().sum();
    sum <= total_balances_satoshis + total_net_rewards_satoshis + SAFETY_TOLERANCE_SATOSHIS
}

/// Stage 5: the single atomic multi-command sequence. `epoch_s` stamps the
/// payment-history entry.
pub fn build_commit(settlements: &[WorkerSettlement], rounds: &[ClassifiedRound], magnitude: f64, epoch_s: i64) -> Vec<StoreCommand> {
    let mut commands = Vec::new();

    for settlement in settlements {
        if settlement.balance_change_satoshis != 0 {
            commands.push(StoreCommand::HIncrByFloat {
                key: "balances".into(),
                field: settlement.address.clone(),
                delta: settlement.balance_change_satoshis as f64 / magnitude,
            });
        }
        if settlement.sent_satoshis != 0 {
            commands.push(StoreCommand::HIncrByFloat {
                key: "payouts".into(),
                field: settlement.address.clone(),
                delta: settlement.sent_satoshis as f64 / magnitude,
            });
        }
    }

    for round in rounds {
        match round.status {
            RoundStatus::Kicked | RoundStatus::Orphan => {
                commands.push(StoreCommand::SMove {
                    src: "blocksPending".into(),
                    dst: "blocksKicked".into(),
                    member: round.block.serialized.clone(),
                });
                if round.status == RoundStatus::Orphan {
                    // Recovered contribution: an orphaned block's shares roll
                    // forward into the fresh round rather than being lost.
                    for (worker, share) in &round.shares {
                        commands.push(StoreCommand::HIncrByFloat {
                            key: "shares:roundCurrent".into(),
                            field: worker.clone(),
                            delta: *share,
                        });
                    }
                }
            }
            RoundStatus::Generate => {
                commands.push(StoreCommand::SMove {
                    src: "blocksPending".into(),
                    dst: "blocksConfirmed".into(),
                    member: round.block.serialized.clone(),
                });
                commands.push(StoreCommand::Del { key: format!("shares:round{}", round.block.height) });
                commands.push(StoreCommand::Del { key: format!("shares:times{}", round.block.height) });
            }
            RoundStatus::Immature => {
                commands.push(StoreCommand::HSet {
                    key: "blocksPendingConfirms".into(),
                    field: round.block.block_hash.clone(),
                    value: round.confirmations.to_string(),
                });
            }
        }
    }

    let total_sent: i64 = settlements.iter().map(|s| s.sent_satoshis).sum();
    if total_sent != 0 {
        commands.push(StoreCommand::ZAdd {
            key: "payments".into(),
            score: epoch_s as f64,
            member: format!("{epoch_s}:{total_sent}"),
        });
        commands.push(StoreCommand::HIncrByFloat {
            key: "stats".into(),
            field: "totalPaid".into(),
            delta: total_sent as f64 / magnitude,
        });
    }

    commands
}

/// Authorization predicate mirrored from C5 (§4.5): workers with an invalid
/// declared address settle against the pool's fallback address instead.
pub fn resolve_settlement_address(worker: &str, rules: &AddressRules, pool_address: &str, invalid_address: Option<&str>) -> String {
    let address = worker.split('.').next().unwrap_or(worker);
    if crate::encoding::validate_address(address, rules) {
        address.to_string()
    } else {
        invalid_address.unwrap_or(pool_address).to_string()
    }
}

/// Drives one coin's payment interval against the real daemon and store.
/// The pure stage functions above carry the logic this orchestrates; this
/// struct's job is fetching inputs, calling them in order, and handling the
/// two genuinely stateful failure paths: the bad-block retry counter and the
/// post-send commit-failure recovery dump.
pub struct PayoutProcessor<S: Store> {
    pub coin: String,
    pub config: PoolConfig,
    pub rpc: Arc<RpcClient>,
    pub store: Arc<S>,
    pub address_rules: AddressRules,
    bad_blocks: DashMap<String, u32>,
    last_round_start: AsyncMutex<Option<i64>>,
    halted: AtomicBool,
}

impl<S: Store + 'static> PayoutProcessor<S> {
    pub fn new(coin: String, config: PoolConfig, rpc: Arc<RpcClient>, store: Arc<S>, address_rules: AddressRules) -> Self {
        Self {
            coin,
            config,
            rpc,
            store,
            address_rules,
            bad_blocks: DashMap::new(),
            last_round_start: AsyncMutex::new(None),
            halted: AtomicBool::new(false),
        }
    }

    /// True once a commit has failed after a successful send: per §4.8, the
    /// processor stops its interval and requires operator intervention.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Relaxed)
    }

    /// Increments the bad-block retry counter for `tx_hash`; the caller
    /// consults [`MAX_BAD_BLOCK_RETRIES`] on the returned value.
    pub fn note_bad_block(&self, tx_hash: &str) -> u32 {
        let mut entry = self.bad_blocks.entry(tx_hash.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn forget_bad_block(&self, tx_hash: &str) {
        self.bad_blocks.remove(tx_hash);
    }

    /// Spawns the fixed-interval loop. A run that is still in flight when the
    /// next tick fires is skipped rather than re-entered (§5).
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval_secs = self.config.payment_processing.payment_interval.max(30);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            let running = Arc::new(AtomicBool::new(false));
            loop {
                ticker.tick().await;
                if self.halted.load(Ordering::Relaxed) {
                    continue;
                }
                if running.swap(true, Ordering::SeqCst) {
                    tracing::warn!(coin = %self.coin, "payment run still in flight, skipping tick");
                    continue;
                }
                let processor = self.clone();
                let running = running.clone();
                tokio::spawn(async move {
                    if let Err(err) = processor.run_once().await {
                        tracing::error!(coin = %processor.coin, %err, "payment run failed");
                    }
                    running.store(false, Ordering::SeqCst);
                });
            }
        })
    }

    /// Commits `commands`; on failure, halts the interval and dumps the
    /// pending commands to `<coin>_finalRedisCommands.txt` for operator replay
    /// (§4.8 "post-send failure path"). This is only ever called after a
    /// `sendmany` has already succeeded, so it must never silently retry.
    pub async fn commit_or_dump(&self, commands: Vec<StoreCommand>) -> anyhow::Result<()> {
        if commands.is_empty() {
            return Ok(());
        }
        if let Err(err) = self.store.exec_transaction(commands.clone()).await {
            self.halted.store(true, Ordering::SeqCst);
            let path = format!("{}_finalRedisCommands.txt", self.coin);
            let rendered = render_recovery_commands(&commands);
            if let Err(write_err) = tokio::fs::write(&path, &rendered).await {
                tracing::error!(coin = %self.coin, %write_err, "failed to write recovery dump, commands follow in log: {rendered}");
            }
            tracing::error!(coin = %self.coin, %err, path = %path, "commit failed after send succeeded, halting payment interval");
            return Err(err);
        }
        Ok(())
    }

    /// The first round processed after a restart has no prior round's start
    /// time to measure against, so it would otherwise compute a multi-year
    /// "duration" from an unset baseline of 0 and disqualify every PPLNT
    /// worker. Seed the baseline from this round's own block time instead and
    /// report an unbounded duration, which exempts this one round from the
    /// PPLNT qualifying-fraction check.
    async fn round_duration_secs(&self, block_time: i64) -> f64 {
        let mut last = self.last_round_start.lock().await;
        let duration = match *last {
            Some(prev) => (block_time - prev).max(0) as f64,
            None => f64::MAX,
        };
        *last = Some(block_time);
        duration
    }

    /// One full pipeline pass. Left largely as an integration seam: the
    /// deterministic decisions it makes all delegate to the pure functions
    /// above, which carry the test coverage.
    pub async fn run_once(&self) -> anyhow::Result<()> {
        if self.halted.load(Ordering::Relaxed) {
            return Ok(());
        }
        let magnitude = self.config.coin.magnitude;
        let min_conf = self.config.payment_processing.min_conf;

        // Stage 1: load.
        let pending_raw = self.store.smembers("blocksPending").await?;
        let mut pending: Vec<_> = pending_raw.iter().filter_map(|m| parse_pending_block(m)).collect();
        pending.sort_by_key(|b| b.height);
        let grouped = group_by_height(pending);

        let mut rounds = Vec::new();
        for (_height, mut same_height) in grouped {
            if same_height.len() > 1 {
                let mut survivors = Vec::new();
                for block in same_height.drain(..) {
                    let result = self.rpc.cmd_first_success("getblock", serde_json::json!([block.block_hash])).await;
                    let confirmations = result.ok().and_then(|v| v.get("confirmations").and_then(|c| c.as_i64())).unwrap_or(0);
                    if confirmations == -1 {
                        self.store
                            .exec_transaction(vec![StoreCommand::SMove {
                                src: "blocksPending".into(),
                                dst: "blocksKicked".into(),
                                member: block.serialized.clone(),
                            }])
                            .await?;
                    } else {
                        survivors.push(block);
                    }
                }
                same_height = survivors;
            }
            let same_height_count = same_height.len();
            for block in same_height {
                rounds.push((block, same_height_count));
            }
        }

        // Stage 2: classify.
        let mut classified = Vec::new();
        for (block, same_height_count) in rounds {
            let retries = self.bad_blocks.get(&block.tx_hash).map(|r| *r).unwrap_or(0);
            if retries >= MAX_BAD_BLOCK_RETRIES {
                classified.push(kick_exhausted_round(block));
                continue;
            }

            let response = self.rpc.cmd_first_success("gettransaction", serde_json::json!([block.tx_hash])).await;
            let tx = match response {
                Err(err) if crate::rpc::is_expected_error_code(&err, TRANSACTION_NOT_FOUND_CODE) => {
                    let count = self.note_bad_block(&block.tx_hash);
                    if count >= MAX_BAD_BLOCK_RETRIES {
                        classified.push(kick_exhausted_round(block));
                    }
                    continue; // below threshold: skip this round this run
                }
                Err(_) => continue,
                Ok(value) => value,
            };
            self.forget_bad_block(&block.tx_hash);

            let confirmations = tx.get("confirmations").and_then(|c| c.as_i64()).unwrap_or(0);
            let details = tx.get("details").and_then(|d| d.as_array()).cloned().unwrap_or_default();
            let matching = details.iter().find(|d| d.get("address").and_then(|a| a.as_str()) == Some(self.config.address.as_str()));
            let Some(matching) = matching else {
                classified.push(classify_round(
                    block,
                    TransactionDetails { confirmations, category: None, reward_satoshis: 0 },
                    min_conf,
                    same_height_count,
                    HashMap::new(),
                    HashMap::new(),
                ));
                continue;
            };
            let category = matching.get("category").and_then(|c| c.as_str()).map(|s| s.to_string());
            let amount = matching.get("amount").and_then(|a| a.as_f64()).unwrap_or(0.0).abs();
            let reward_satoshis = (amount * magnitude).round() as i64;

            let shares = self.store.hgetall(&format!("shares:round{}", block.height)).await?;
            let shares: HashMap<String, f64> = shares.into_iter().filter_map(|(k, v)| v.parse().ok().map(|f| (k, f))).collect();
            let times = if self.config.payment_processing.payment_mode == PaymentMode::Pplnt {
                let times = self.store.hgetall(&format!("shares:times{}", block.height)).await?;
                times.into_iter().filter_map(|(k, v)| v.parse().ok().map(|f| (k, f))).collect()
            } else {
                HashMap::new()
            };

            classified.push(classify_round(
                block,
                TransactionDetails { confirmations, category, reward_satoshis },
                min_conf,
                same_height_count,
                shares,
                times,
            ));
        }

        cap_payable_rounds(&mut classified, self.config.payment_processing.max_blocks_per_payment);

        // Stage 3: compute rewards. `classified` was assembled from a
        // height-keyed HashMap above, so its iteration order is not the
        // ascending-height order `pending` was sorted into — restore it here
        // since `round_duration_secs` depends on strictly increasing
        // `block_time` across this loop.
        classified.sort_by_key(|r| r.block.height);
        let txfee_satoshis = (self.config.coin.txfee * magnitude).round() as i64;
        let mut round_rewards: HashMap<u64, HashMap<String, i64>> = HashMap::new();
        let mut total_net_rewards = 0i64;
        for round in classified.iter().filter(|r| r.status == RoundStatus::Generate) {
            let round_time = self.round_duration_secs(round.block.time).await;
            let rewards = compute_round_payout(round, self.config.payment_processing.payment_mode, self.config.payment_processing.pplnt, round_time, txfee_satoshis);
            total_net_rewards += rewards.values().sum::<i64>();
            round_rewards.insert(round.block.height, rewards);
        }

        let balances = self.store.hgetall("balances").await?;
        let balances: HashMap<String, i64> = balances
            .into_iter()
            .filter_map(|(k, v)| v.parse::<f64>().ok().map(|f| (k, (f * magnitude).round() as i64)))
            .collect();
        let total_balances: i64 = balances.values().sum();

        let spendable_resp = self.rpc.cmd_first_success("listunspent", serde_json::json!([min_conf, 99_999_999])).await;
        let spendable_satoshis = spendable_resp
            .ok()
            .and_then(|v| v.as_array().map(|a| a.iter().filter_map(|u| u.get("amount").and_then(|x| x.as_f64())).sum::<f64>()))
            .map(|coins| (coins * magnitude).round() as i64)
            .unwrap_or(0);

        if !spendable_covers_owed(total_balances, total_net_rewards, spendable_satoshis) {
            tracing::warn!(coin = %self.coin, "spendable balance below total owed, demoting generate rounds to immature");
            for round in classified.iter_mut() {
                if round.status == RoundStatus::Generate {
                    round.status = RoundStatus::Immature;
                }
            }
            round_rewards.clear();
            total_net_rewards = 0;
        }

        // Stage 4: execute.
        let mut aggregated: HashMap<String, WorkerAccrual> = HashMap::new();
        for (address, balance) in &balances {
            aggregated.entry(address.clone()).or_default().balance_satoshis += balance;
        }
        for rewards in round_rewards.values() {
            for (worker, reward) in rewards {
                let address = resolve_settlement_address(worker, &self.address_rules, &self.config.address, self.config.invalid_address.as_deref());
                aggregated.entry(address).or_default().reward_satoshis += reward;
            }
        }

        let minimum_payment_satoshis = (self.config.payment_processing.minimum_payment * magnitude).round() as i64;
        let (to_send, settlements) = settle_workers(aggregated, minimum_payment_satoshis);

        if !to_send.is_empty() {
            if !sendmany_amount_is_safe(&to_send, total_balances, total_net_rewards) {
                tracing::error!(coin = %self.coin, "sendmany amount exceeds owed total, aborting send");
                return Ok(());
            }
            let coin_amounts: serde_json::Map<String, serde_json::Value> = to_send
                .iter()
                .map(|(addr, satoshis)| (addr.clone(), serde_json::json!(*satoshis as f64 / magnitude)))
                .collect();
            self.rpc
                .cmd_first_success("sendmany", serde_json::json!(["", serde_json::Value::Object(coin_amounts)]))
                .await
                .map_err(|e| anyhow::anyhow!("sendmany failed: {e}"))?;
        }

        // Stage 5: commit.
        let epoch_s = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
        let commands = build_commit(&settlements, &classified, magnitude, epoch_s);
        self.commit_or_dump(commands).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BannedAddressesConfig, CoinConfig, DaemonConfig, PaymentMode as PayMode, PaymentProcessingConfig};
    use crate::store::fake::FakeStore;
    use std::collections::HashMap as StdHashMap;

    fn test_processor() -> PayoutProcessor<FakeStore> {
        let config = PoolConfig {
            enabled: true,
            address: "pooladdr".into(),
            invalid_address: None,
            payment_processing: PaymentProcessingConfig {
                enabled: true,
                daemon: DaemonConfig { host: "localhost".into(), port: 1, user: "u".into(), password: "p".into() },
                payment_interval: 60,
                payment_mode: PayMode::Pplnt,
                pplnt: 0.51,
                minimum_payment: 0.01,
                min_conf: 1,
                max_blocks_per_payment: 5,
            },
            ports: StdHashMap::new(),
            daemons: vec![],
            banned_addresses: BannedAddressesConfig::default(),
            validate_worker_username: false,
            coin: CoinConfig {
                name: "test".into(),
                algorithm: "sha256d".into(),
                txfee: 0.0001,
                magnitude: 1e8,
                address_version_bytes: vec![0x00],
                bech32_hrp: None,
            },
            block_refresh_interval_secs: 1,
        };
        PayoutProcessor::new(
            "test".into(),
            config,
            Arc::new(RpcClient::new(&[])),
            Arc::new(FakeStore::new()),
            AddressRules { base58_versions: vec![0x00], bech32_hrp: None },
        )
    }

    #[tokio::test]
    async fn first_round_after_startup_reports_unbounded_duration() {
        let processor = test_processor();
        // No prior round's start time is known yet; a real elapsed duration
        // can't be computed, so PPLNT workers must not be disqualified for it.
        let duration = processor.round_duration_secs(1_700_000_000).await;
        assert_eq!(duration, f64::MAX);
    }

    #[tokio::test]
    async fn subsequent_round_duration_is_measured_against_the_previous_round() {
        let processor = test_processor();
        processor.round_duration_secs(1_700_000_000).await;
        let duration = processor.round_duration_secs(1_700_000_600).await;
        assert_eq!(duration, 600.0);
    }

    fn block(hash: &str, tx: &str, height: u64) -> PendingBlock {
        PendingBlock {
            block_hash: hash.into(),
            tx_hash: tx.into(),
            height,
            minedby: "addr1".into(),
            time: 1000,
            serialized: format!("{hash}:{tx}:{height}:addr1:1"),
        }
    }

    #[test]
    fn parses_pending_block_member() {
        let parsed = parse_pending_block("H:abc:100:addr1:1700000000").unwrap();
        assert_eq!(parsed.block_hash, "H");
        assert_eq!(parsed.height, 100);
        assert_eq!(parsed.time, 1700000000);
    }

    #[test]
    fn classify_promotes_to_generate_past_min_conf() {
        let round = classify_round(
            block("h", "t", 100),
            TransactionDetails { confirmations: 6, category: Some("generate".into()), reward_satoshis: 99_990_000 },
            1,
            1,
            HashMap::from([("addr1.rig1".to_string(), 10.0)]),
            HashMap::new(),
        );
        assert_eq!(round.status, RoundStatus::Generate);
    }

    #[test]
    fn classify_demotes_below_min_conf() {
        let round = classify_round(
            block("h", "t", 100),
            TransactionDetails { confirmations: 1, category: Some("generate".into()), reward_satoshis: 0 },
            6,
            1,
            HashMap::new(),
            HashMap::new(),
        );
        assert_eq!(round.status, RoundStatus::Immature);
    }

    #[test]
    fn classify_missing_details_is_kicked() {
        let round = classify_round(block("h", "t", 100), TransactionDetails { confirmations: 6, category: None, reward_satoshis: 0 }, 1, 1, HashMap::new(), HashMap::new());
        assert_eq!(round.status, RoundStatus::Kicked);
    }

    #[test]
    fn caps_payable_rounds_to_max_blocks_per_payment() {
        let mut rounds = vec![
            classify_round(block("a", "ta", 100), TransactionDetails { confirmations: 6, category: Some("generate".into()), reward_satoshis: 1 }, 1, 1, HashMap::new(), HashMap::new()),
            classify_round(block("b", "tb", 101), TransactionDetails { confirmations: 6, category: Some("generate".into()), reward_satoshis: 1 }, 1, 1, HashMap::new(), HashMap::new()),
        ];
        cap_payable_rounds(&mut rounds, 1);
        assert_eq!(rounds[0].status, RoundStatus::Generate);
        assert_eq!(rounds[1].status, RoundStatus::Immature);
    }

    #[test]
    fn single_worker_round_distributes_full_net_reward() {
        let shares = HashMap::from([("addr1.rig1".to_string(), 10.0)]);
        let rewards = distribute_reward(&shares, 99_990_000);
        assert_eq!(rewards["addr1.rig1"], 99_990_000);
    }

    #[test]
    fn rounding_residue_goes_to_largest_lexicographically_first_worker() {
        let shares = HashMap::from([("a".to_string(), 1.0), ("b".to_string(), 1.0), ("c".to_string(), 1.0)]);
        let rewards = distribute_reward(&shares, 10);
        let total: i64 = rewards.values().sum();
        assert_eq!(total, 10);
        // 10/3 each rounds to 3, leaving residue 1; all shares tie, so the
        // lexicographically-first worker ("a") gets it.
        assert_eq!(rewards["a"], 4);
        assert_eq!(rewards["b"], 3);
        assert_eq!(rewards["c"], 3);
    }

    #[test]
    fn pplnt_disqualifies_workers_below_qualifying_fraction() {
        let mut shares = HashMap::from([("A".to_string(), 6.0), ("B".to_string(), 4.0)]);
        let times = HashMap::from([("A".to_string(), 500.0), ("B".to_string(), 100.0)]);
        apply_pplnt_filter(&mut shares, &times, 600.0, 0.51);
        assert!(shares.contains_key("A"));
        assert!(!shares.contains_key("B"));
    }

    #[test]
    fn spendable_balance_check_rejects_when_short() {
        assert!(!spendable_covers_owed(100, 50, 149));
        assert!(spendable_covers_owed(100, 50, 150));
    }

    #[test]
    fn settle_workers_defers_below_minimum_payment() {
        let aggregated = HashMap::from([("addr1".to_string(), WorkerAccrual { balance_satoshis: 0, reward_satoshis: 500 })]);
        let (to_send, settlements) = settle_workers(aggregated, 1000);
        assert!(to_send.is_empty());
        assert_eq!(settlements[0].sent_satoshis, 0);
        assert_eq!(settlements[0].balance_change_satoshis, 500);
    }

    #[test]
    fn settle_workers_pays_and_clears_balance_above_minimum() {
        let aggregated = HashMap::from([("addr1".to_string(), WorkerAccrual { balance_satoshis: 200, reward_satoshis: 99_990_000 })]);
        let (to_send, settlements) = settle_workers(aggregated, 1_000_000);
        assert_eq!(*to_send.get("addr1").unwrap(), 99_990_200);
        assert_eq!(settlements[0].sent_satoshis, 99_990_200);
        assert_eq!(settlements[0].balance_change_satoshis, -200);
    }

    #[test]
    fn sendmany_safety_check_rejects_overspend() {
        let to_send = HashMap::from([("addr1".to_string(), 1000i64)]);
        assert!(!sendmany_amount_is_safe(&to_send, 0, 998));
        assert!(sendmany_amount_is_safe(&to_send, 0, 999));
    }

    #[test]
    fn build_commit_deletes_round_shares_on_generate() {
        let round = classify_round(
            block("h", "t", 100),
            TransactionDetails { confirmations: 6, category: Some("generate".into()), reward_satoshis: 99_990_000 },
            1,
            1,
            HashMap::from([("addr1.rig1".to_string(), 10.0)]),
            HashMap::new(),
        );
        let settlements = vec![WorkerSettlement { address: "addr1".into(), sent_satoshis: 99_990_000, balance_change_satoshis: 0 }];
        let commands = build_commit(&settlements, &[round], 1e8, 1_700_000_000);
        let has_delete = commands.iter().any(|c| matches!(c, StoreCommand::Del { key } if key == "shares:round100"));
        assert!(has_delete);
    }

    #[test]
    fn build_commit_recredits_orphan_shares() {
        let mut round = classify_round(
            block("h", "t", 100),
            TransactionDetails { confirmations: 6, category: Some("orphan".into()), reward_satoshis: 0 },
            1,
            1,
            HashMap::from([("addr1.rig1".to_string(), 10.0)]),
            HashMap::new(),
        );
        round.status = RoundStatus::Orphan;
        let commands = build_commit(&[], &[round], 1e8, 1_700_000_000);
        let has_recredit = commands.iter().any(|c| matches!(c, StoreCommand::HIncrByFloat { key, field, .. } if key == "shares:roundCurrent" && field == "addr1.rig1"));
        assert!(has_recredit);
    }
}
