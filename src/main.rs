// Multi-coin Stratum mining pool backend.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use lodestone_pool::config::{self, Config};
use lodestone_pool::metrics;
use lodestone_pool::store::{self, RedisStore, Store};
use lodestone_pool::supervisor::Supervisor;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

struct Args {
    global_config: PathBuf,
    pool_configs_dir: PathBuf,
    replay_recovery: Option<PathBuf>,
}

fn parse_args() -> Args {
    let mut global_config = PathBuf::from("config.json");
    let mut pool_configs_dir = PathBuf::from("pool_configs");
    let mut replay_recovery = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                if let Some(v) = args.next() {
                    global_config = PathBuf::from(v);
                }
            }
            "--pool-configs" => {
                if let Some(v) = args.next() {
                    pool_configs_dir = PathBuf::from(v);
                }
            }
            "--replay-recovery" => {
                replay_recovery = args.next().map(PathBuf::from);
            }
            _ => {}
        }
    }

    Args { global_config, pool_configs_dir, replay_recovery }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    let config = Config::load(&args.global_config, &args.pool_configs_dir)
        .context("loading configuration")?;

    init_tracing(&config.global.log_level);

    let redis_url = redis_url(&config.global.redis);
    let store = Arc::new(RedisStore::connect(&redis_url).await.context("connecting to redis")?);

    if let Some(path) = &args.replay_recovery {
        return replay_recovery(path, store.as_ref()).await;
    }

    info!("starting mining pool supervisor");
    let supervisor = Supervisor::bootstrap(&config, store)?;

    if let Ok(metrics_addr) = std::env::var("METRICS_ADDR") {
        let addr: SocketAddr = metrics_addr.parse().context("parsing METRICS_ADDR")?;
        metrics::install(addr)?;
        metrics::spawn_sampler(supervisor.clone(), std::time::Duration::from_secs(15));
    }

    let handles = supervisor.spawn_all();
    info!(tasks = handles.len(), "supervisor tasks spawned");

    shutdown_signal().await;
    warn!("shutdown signal received, stopping supervised tasks");
    for handle in handles {
        handle.abort();
    }

    Ok(())
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level.to_string())),
        )
        .with_target(false)
        .compact()
        .init();
}

fn redis_url(redis: &config::RedisConfig) -> String {
    let auth = redis.password.as_deref().map(|p| format!(":{p}@")).unwrap_or_default();
    if let Some(socket) = &redis.socket {
        format!("redis+unix://{auth}{socket}")
    } else {
        format!("redis://{auth}{}:{}", redis.host, redis.port)
    }
}

/// `--replay-recovery <file>` (§B): re-issues a dumped recovery file's
/// commands once an operator has confirmed it's safe to do so.
async fn replay_recovery(path: &Path, store: &RedisStore) -> Result<()> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading recovery file {}", path.display()))?;
    let commands = store::parse_recovery_commands(&text).context("parsing recovery file")?;
    info!(path = %path.display(), commands = commands.len(), "replaying recovery commands");
    store.exec_transaction(commands).await.context("replaying recovery commands")?;
    info!("recovery replay committed");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            warn!("received SIGTERM, initiating graceful shutdown");
        },
    }
}
