use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use roombook::booking::{BookingConfig, BookingRepository, CommitPolicy, ConflictScope};
use roombook::limits::DEFAULT_COMMIT_ATTEMPTS;
use roombook::notify::NotifyHub;
use roombook::observability::{CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL};
use roombook::store::{run_compactor, WalStore};
use roombook::wire;

/// `ROOMBOOK_*` environment, read once at startup.
struct Config {
    bind: String,
    port: u16,
    data_dir: PathBuf,
    max_connections: usize,
    compact_threshold: u64,
    metrics_port: Option<u16>,
    booking: BookingConfig,
}

/// Parse `ROOMBOOK_<key>`, falling back to `default` when unset.
fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    let name = format!("ROOMBOOK_{key}");
    match std::env::var(&name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| format!("invalid {name}={raw:?}: {e}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    fn from_env() -> Result<Self, String> {
        let metrics_port = match std::env::var("ROOMBOOK_METRICS_PORT") {
            Ok(_) => Some(env_or("METRICS_PORT", 0u16)?),
            Err(_) => None,
        };
        Ok(Self {
            bind: env_or("BIND", "0.0.0.0".to_string())?,
            port: env_or("PORT", 5480)?,
            data_dir: env_or("DATA_DIR", PathBuf::from("./data"))?,
            max_connections: env_or("MAX_CONNECTIONS", 256)?,
            compact_threshold: env_or("COMPACT_THRESHOLD", 1000)?,
            metrics_port,
            booking: BookingConfig {
                scope: env_or("CONFLICT_SCOPE", ConflictScope::default())?,
                commit: CommitPolicy::from_attempts(env_or(
                    "MAX_COMMIT_ATTEMPTS",
                    DEFAULT_COMMIT_ATTEMPTS,
                )?),
            },
        })
    }
}

/// Resolves on ctrl-c, or SIGTERM where there is one.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => warn!("no SIGTERM handler ({e}), waiting for ctrl-c only"),
        }
    }
    tokio::signal::ctrl_c().await.ok();
}

/// Wait up to `deadline` for every connection permit to come back.
async fn drain(semaphore: &Semaphore, max_connections: usize, deadline: Duration) {
    let deadline = tokio::time::sleep(deadline);
    tokio::pin!(deadline);
    while semaphore.available_permits() < max_connections {
        tokio::select! {
            _ = &mut deadline => {
                let open = max_connections - semaphore.available_permits();
                warn!("drain timeout, {open} connections still open");
                return;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
    info!("all connections drained");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    roombook::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.data_dir.join("roombook.wal");
    let store = Arc::new(WalStore::open(&wal_path)?);
    tokio::spawn(run_compactor(store.clone(), config.compact_threshold));

    let repo = Arc::new(BookingRepository::new(
        store,
        config.booking,
        Arc::new(NotifyHub::new()),
    ));
    let settings = repo.settings().load().await?;

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("roombook listening on {addr}");
    info!("  title: {}", settings.title);
    info!("  wal: {}", wal_path.display());
    info!("  max_connections: {}", config.max_connections);
    info!("  scope: {:?}, commit: {:?}", config.booking.scope, config.booking.commit);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let semaphore = Arc::new(Semaphore::new(config.max_connections));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    warn!("connection limit reached, rejecting {peer}");
                    metrics::counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
                    continue;
                };

                info!("connection from {peer}");
                metrics::counter!(CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
                let repo = repo.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = wire::process_connection(socket, repo).await {
                        error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    drain(&semaphore, config.max_connections, Duration::from_secs(10)).await;
    info!("roombook stopped");
    Ok(())
}
