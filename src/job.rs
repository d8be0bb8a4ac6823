//! Job manager (C3): builds mining jobs from daemon block templates and
//! validates miner submissions against them.

use crate::encoding::{self, HashAlgorithm};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub prev_hash: String,
    pub coinbase1: Vec<u8>,
    pub coinbase2: Vec<u8>,
    pub merkle_branches: Vec<[u8; 32]>,
    pub version: u32,
    pub n_bits: u32,
    pub n_time: u32,
    pub clean_jobs: bool,
    pub template_min_time: u32,
    pub network_target: [u8; 32],
    pub height: u64,
    /// Raw hex of every non-coinbase transaction in the template, in block
    /// order, so `submitblock` can be fed a complete block once a submission
    /// is a candidate block (§4.3, §4.2 "submitblock").
    pub transactions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub job_id: String,
    pub extra_nonce1: String,
    pub extra_nonce2: String,
    pub n_time: u32,
    pub nonce: u32,
    pub solution: Option<String>,
}

#[derive(Debug)]
pub enum ValidationOutcome {
    Valid {
        hash: [u8; 32],
        is_block: bool,
        /// Full serialized block, hex-encoded, present only when `is_block`
        /// — ready to hand straight to the daemon's `submitblock`.
        block_hex: Option<String>,
    },
    Rejected { reason: &'static str },
}

/// Jobs are kept in a bounded map keyed by `jobId`; the oldest entries are
/// evicted once the cache grows past `max_jobs` (§9 "arena+index").
pub struct JobManager {
    jobs: DashMap<String, Arc<Job>>,
    job_order: parking_lot::Mutex<Vec<String>>,
    max_jobs: usize,
    next_id: AtomicU64,
    hash_algo: Arc<dyn HashAlgorithm>,
    seen_submissions: DashMap<(String, String, u32, u32), ()>,
    submitted_blocks: DashMap<String, ()>,
}

impl JobManager {
    pub fn new(hash_algo: Arc<dyn HashAlgorithm>) -> Self {
        Self {
            jobs: DashMap::new(),
            job_order: parking_lot::Mutex::new(Vec::new()),
            max_jobs: 8,
            next_id: AtomicU64::new(1),
            hash_algo,
            seen_submissions: DashMap::new(),
            submitted_blocks: DashMap::new(),
        }
    }

    fn allocate_job_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{:08x}", n)
    }

    /// Builds a new job from a daemon template and the pool's coinbase
    /// construction policy, registering it in the bounded cache.
    pub fn build_job(
        &self,
        prev_hash: String,
        coinbase1: Vec<u8>,
        coinbase2: Vec<u8>,
        merkle_branches: Vec<[u8; 32]>,
        version: u32,
        n_bits: u32,
        n_time: u32,
        height: u64,
        clean_jobs: bool,
        transactions: Vec<String>,
    ) -> Arc<Job> {
        let job_id = self.allocate_job_id();
        let network_target = encoding::compact_to_target(n_bits);
        let job = Arc::new(Job {
            job_id: job_id.clone(),
            prev_hash,
            coinbase1,
            coinbase2,
            merkle_branches,
            version,
            n_bits,
            n_time,
            clean_jobs,
            template_min_time: n_time.saturating_sub(7200),
            network_target,
            height,
            transactions,
        });

        self.jobs.insert(job_id.clone(), job.clone());
        let mut order = self.job_order.lock();
        order.push(job_id);
        while order.len() > self.max_jobs {
            let oldest = order.remove(0);
            self.jobs.remove(&oldest);
        }
        job
    }

    fn job(&self, job_id: &str) -> Option<Arc<Job>> {
        self.jobs.get(job_id).map(|j| j.clone())
    }

    /// Share validation pipeline (§4.3): lookup, bound checks, hash, and
    /// target comparison. `share_target` is the connection's current vardiff
    /// target; `extranonce2_len` bounds the `extraNonce2` field length.
    pub fn validate_submit(
        &self,
        submission: &Submission,
        share_target: &[u8; 32],
        extranonce2_len: usize,
        coinbase_tx_hash: impl Fn(&Job, &str, &str) -> [u8; 32],
        header_bytes: impl Fn(&Job, [u8; 32], u32, u32) -> Vec<u8>,
    ) -> ValidationOutcome {
        let Some(job) = self.job(&submission.job_id) else {
            return ValidationOutcome::Rejected { reason: "job not found" };
        };

        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as u32;
        if submission.n_time < job.template_min_time || submission.n_time > now + 7200 {
            return ValidationOutcome::Rejected { reason: "ntime out of range" };
        }
        if submission.extra_nonce2.len() / 2 != extranonce2_len {
            return ValidationOutcome::Rejected { reason: "invalid extranonce2 size" };
        }

        let dedup_key = (
            submission.job_id.clone(),
            submission.extra_nonce2.clone(),
            submission.n_time,
            submission.nonce,
        );
        if self.seen_submissions.insert(dedup_key, ()).is_some() {
            return ValidationOutcome::Rejected { reason: "duplicate share" };
        }

        let coinbase_hash = coinbase_tx_hash(&job, &submission.extra_nonce1, &submission.extra_nonce2);
        let merkle_root = encoding::merkle_root(coinbase_hash, &job.merkle_branches);
        let header = header_bytes(&job, merkle_root, submission.n_time, submission.nonce);
        let hash = self.hash_algo.hash(&header);

        if !encoding::hash_meets_target(&hash, share_target) {
            return ValidationOutcome::Rejected { reason: "hash above share target" };
        }

        let is_block = encoding::hash_meets_target(&hash, &job.network_target);
        let block_hex = is_block.then(|| {
            let mut coinbase_bytes = Vec::with_capacity(job.coinbase1.len() + job.coinbase2.len() + 16);
            coinbase_bytes.extend_from_slice(&job.coinbase1);
            coinbase_bytes.extend_from_slice(&hex::decode(&submission.extra_nonce1).unwrap_or_default());
            coinbase_bytes.extend_from_slice(&hex::decode(&submission.extra_nonce2).unwrap_or_default());
            coinbase_bytes.extend_from_slice(&job.coinbase2);

            let mut block = header.clone();
            block.extend(encoding::var_int_encode(job.transactions.len() as u64 + 1));
            block.extend_from_slice(&coinbase_bytes);
            for tx in &job.transactions {
                if let Ok(bytes) = hex::decode(tx) {
                    block.extend_from_slice(&bytes);
                }
            }
            hex::encode(block)
        });
        ValidationOutcome::Valid { hash, is_block, block_hex }
    }

    /// Height and network difficulty for a job, looked up again after a
    /// successful validation so `validate_submit`'s own signature doesn't
    /// have to carry event-plumbing fields it otherwise has no use for.
    pub fn job_metadata(&self, job_id: &str) -> Option<(u64, f64)> {
        self.job(job_id).map(|job| (job.height, encoding::target_to_difficulty(&job.network_target)))
    }

    /// Tie-break for reorg races (§4.3): if two shares at different job IDs
    /// map to the same block, both are accepted as shares but at most one
    /// `submitblock` is sent.
    pub fn should_submit_block(&self, block_hash_hex: &str) -> bool {
        self.submitted_blocks.insert(block_hash_hex.to_string(), ()).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Sha256dAlgorithm;

    fn manager() -> JobManager {
        JobManager::new(Arc::new(Sha256dAlgorithm))
    }

    #[test]
    fn unknown_job_is_rejected() {
        let mgr = manager();
        let submission = Submission {
            job_id: "ffffffff".into(),
            extra_nonce1: "00".into(),
            extra_nonce2: "0000".into(),
            n_time: 0,
            nonce: 0,
            solution: None,
        };
        let outcome = mgr.validate_submit(&submission, &[0xffu8; 32], 2, |_, _, _| [0u8; 32], |_, _, _, _| vec![]);
        assert!(matches!(outcome, ValidationOutcome::Rejected { reason: "job not found" }));
    }

    #[test]
    fn duplicate_submission_is_rejected_on_second_attempt() {
        let mgr = manager();
        let job = mgr.build_job("prev".into(), vec![], vec![], vec![], 1, 0x1d00ffff, 1_700_000_000, 100, true, vec![]);
        let submission = Submission {
            job_id: job.job_id.clone(),
            extra_nonce1: "00".into(),
            extra_nonce2: "0000".into(),
            n_time: 1_700_000_000,
            nonce: 1,
            solution: None,
        };
        let easy_target = [0xffu8; 32];
        let first = mgr.validate_submit(&submission, &easy_target, 2, |_, _, _| [0u8; 32], |_, _, _, _| vec![1, 2, 3]);
        assert!(matches!(first, ValidationOutcome::Valid { .. }));

        let second = mgr.validate_submit(&submission, &easy_target, 2, |_, _, _| [0u8; 32], |_, _, _, _| vec![1, 2, 3]);
        assert!(matches!(second, ValidationOutcome::Rejected { reason: "duplicate share" }));
    }

    #[test]
    fn job_cache_evicts_oldest_past_capacity() {
        let mgr = manager();
        let mut last_id = String::new();
        for h in 0..20u64 {
            let job = mgr.build_job("prev".into(), vec![], vec![], vec![], 1, 0x1d00ffff, 1, h, true, vec![]);
            last_id = job.job_id;
        }
        assert!(mgr.job(&last_id).is_some());
        assert_eq!(mgr.jobs.len(), mgr.max_jobs);
    }

    #[test]
    fn block_submit_sent_at_most_once_per_hash() {
        let mgr = manager();
        assert!(mgr.should_submit_block("abc"));
        assert!(!mgr.should_submit_block("abc"));
        assert!(mgr.should_submit_block("def"));
    }
}
