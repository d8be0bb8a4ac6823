//! Configuration loading: two JSON-with-comments documents (§6) plus
//! `.env`-sourced secret overrides (daemon/redis credentials), in the
//! teacher's `Config::from_env` idiom generalized from env vars to files.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    #[serde(default)]
    pub socket: Option<String>,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_redis_port() -> u16 {
    6379
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_forks")]
    pub forks: ForkCount,
}

fn default_forks() -> ForkCount {
    ForkCount::Auto(String::from("auto"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ForkCount {
    Fixed(usize),
    Auto(String),
}

impl ForkCount {
    pub fn resolve(&self) -> usize {
        match self {
            ForkCount::Fixed(n) => (*n).max(1),
            ForkCount::Auto(_) => std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsiteConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchPortConfig {
    pub diff: f64,
    #[serde(default)]
    pub var_diff: Option<VarDiffConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchingConfig {
    pub algorithm: String,
    #[serde(default)]
    pub enabled: bool,
    pub ports: HashMap<u16, SwitchPortConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub redis: RedisConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    pub cli_port: u16,
    #[serde(default)]
    pub cli_server: bool,
    #[serde(default)]
    pub website: WebsiteConfig,
    #[serde(default)]
    pub switching: HashMap<String, SwitchingConfig>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_colors: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarDiffConfig {
    pub min_diff: f64,
    pub max_diff: f64,
    pub target_time: f64,
    pub retarget_time: f64,
    pub variance_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    pub diff: f64,
    #[serde(default)]
    pub var_diff: Option<VarDiffConfig>,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub tls_cert: Option<String>,
    #[serde(default)]
    pub tls_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMode {
    Prop,
    Pplnt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentProcessingConfig {
    pub enabled: bool,
    pub daemon: DaemonConfig,
    pub payment_interval: u64,
    pub payment_mode: PaymentMode,
    #[serde(default = "default_pplnt_qualify")]
    pub pplnt: f64,
    pub minimum_payment: f64,
    pub min_conf: u32,
    pub max_blocks_per_payment: usize,
}

fn default_pplnt_qualify() -> f64 {
    0.51
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BannedAddressesConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub banned: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinConfig {
    pub name: String,
    pub algorithm: String,
    pub txfee: f64,
    #[serde(default = "default_magnitude")]
    pub magnitude: f64,
    #[serde(default)]
    pub address_version_bytes: Vec<u8>,
    #[serde(default)]
    pub bech32_hrp: Option<String>,
}

fn default_magnitude() -> f64 {
    1e8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub enabled: bool,
    pub address: String,
    #[serde(default)]
    pub invalid_address: Option<String>,
    pub payment_processing: PaymentProcessingConfig,
    pub ports: HashMap<u16, PortConfig>,
    pub daemons: Vec<DaemonConfig>,
    #[serde(default)]
    pub banned_addresses: BannedAddressesConfig,
    #[serde(default)]
    pub validate_worker_username: bool,
    pub coin: CoinConfig,
    /// Cadence for the `getblocktemplate` poll loop (§4.3/§4.4 job broadcast).
    #[serde(default = "default_block_refresh_interval_secs")]
    pub block_refresh_interval_secs: u64,
}

fn default_block_refresh_interval_secs() -> u64 {
    1
}

#[derive(Debug, Clone)]
pub struct Config {
    pub global: GlobalConfig,
    pub pools: HashMap<String, PoolConfig>,
}

impl Config {
    /// Loads `global.conf` plus every file under `pool_configs/`, tolerating
    /// `//`/`/* */` comments and trailing commas as §6 requires. Secrets
    /// (redis/daemon passwords) may be overridden from `.env`/the process
    /// environment so they need not be committed alongside the pool configs.
    pub fn load(global_path: &Path, pool_configs_dir: &Path) -> Result<Self> {
        dotenvy::dotenv().ok();

        let raw = std::fs::read_to_string(global_path)
            .with_context(|| format!("reading global config {}", global_path.display()))?;
        let mut global: GlobalConfig =
            serde_json::from_str(&strip_jsonc(&raw)).context("parsing global config")?;

        if let Ok(password) = std::env::var("REDIS_PASSWORD") {
            global.redis.password = Some(password);
        }

        let mut pools = HashMap::new();
        for entry in std::fs::read_dir(pool_configs_dir)
            .with_context(|| format!("reading pool_configs dir {}", pool_configs_dir.display()))?
        {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json")
                && entry.path().extension().and_then(|e| e.to_str()) != Some("conf")
            {
                continue;
            }
            let coin_name = entry
                .path()
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let raw = std::fs::read_to_string(entry.path())
                .with_context(|| format!("reading pool config {}", entry.path().display()))?;
            let mut pool: PoolConfig =
                serde_json::from_str(&strip_jsonc(&raw)).with_context(|| format!("parsing pool config {coin_name}"))?;

            if let Ok(password) = std::env::var(format!("{}_DAEMON_PASSWORD", coin_name.to_uppercase())) {
                for daemon in &mut pool.daemons {
                    daemon.password = password.clone();
                }
            }
            pools.insert(coin_name, pool);
        }

        let config = Config { global, pools };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.global.cli_port == 0 {
            bail!("cliPort cannot be 0");
        }
        for (coin, pool) in &self.pools {
            if pool.daemons.is_empty() {
                bail!("pool {coin} must configure at least one daemon");
            }
            if pool.payment_processing.minimum_payment <= 0.0 {
                bail!("pool {coin}: minimumPayment must be > 0");
            }
            if pool.payment_processing.max_blocks_per_payment == 0 {
                bail!("pool {coin}: maxBlocksPerPayment must be > 0");
            }
            for port in pool.ports.values() {
                if let Some(vd) = &port.var_diff {
                    if vd.min_diff > vd.max_diff {
                        bail!("pool {coin}: varDiff minDiff must be <= maxDiff");
                    }
                }
                if port.tls && (port.tls_cert.is_none() || port.tls_key.is_none()) {
                    bail!("pool {coin}: tls ports require tlsCert and tlsKey");
                }
            }
        }
        Ok(())
    }
}

/// Strips `//` line comments, `/* */` block comments, and trailing commas
/// before handing the text to `serde_json`. Comment markers inside string
/// literals are left untouched.
pub fn strip_jsonc(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                while let Some(&n) = chars.peek() {
                    if n == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                while let Some(n) = chars.next() {
                    if n == '*' && chars.peek() == Some(&'/') {
                        chars.next();
                        break;
                    }
                }
            }
            ',' => {
                // Defer: only emit if the next non-whitespace char isn't a closer.
                let mut lookahead = chars.clone();
                let mut is_trailing = false;
                while let Some(&n) = lookahead.peek() {
                    if n.is_whitespace() {
                        lookahead.next();
                        continue;
                    }
                    is_trailing = n == '}' || n == ']';
                    break;
                }
                if !is_trailing {
                    out.push(c);
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_comments_and_trailing_commas() {
        let input = r#"{
            // a comment
            "a": 1, /* inline */
            "b": [1, 2, 3,],
        }"#;
        let stripped = strip_jsonc(input);
        let value: serde_json::Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(value["a"], 1);
        assert_eq!(value["b"], serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn leaves_slashes_in_strings_alone() {
        let input = r#"{"path": "http://example.com"}"#;
        let stripped = strip_jsonc(input);
        let value: serde_json::Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(value["path"], "http://example.com");
    }

    #[test]
    fn fork_count_auto_resolves_to_at_least_one() {
        let auto = ForkCount::Auto("auto".to_string());
        assert!(auto.resolve() >= 1);
        assert_eq!(ForkCount::Fixed(4).resolve(), 4);
    }
}
