use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tidepool_core::{ConcurrencyPolicy, LifeCycle, SessionConfig, SessionStore};
use tokio::signal;
use tracing::info;

mod demo;
mod routes;
mod state;
mod telemetry;

use state::AppState;

#[derive(Debug, Clone)]
struct ServerConfig {
    listen_addr: SocketAddr,
    session: SessionConfig,
    round_timeout: Duration,
    shutdown_grace: Duration,
}

#[derive(Debug, Parser)]
#[command(
    name = "tidepool-server",
    author,
    version,
    about = "Hosts tidepool UI sessions over HTTP"
)]
struct Cli {
    /// Address to bind the HTTP listener to.
    #[arg(long, env = "TIDEPOOL_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    listen_addr: String,

    /// Sessions without a request for this long are destroyed.
    #[arg(long, env = "TIDEPOOL_IDLE_TIMEOUT_SECS", default_value_t = 1800)]
    idle_timeout_secs: u64,

    /// How often the reaper looks for idle sessions.
    #[arg(long, env = "TIDEPOOL_REAP_INTERVAL_SECS", default_value_t = 60)]
    reap_interval_secs: u64,

    /// Upper bound for one request/response round.
    #[arg(long, env = "TIDEPOOL_ROUND_TIMEOUT_SECS", default_value_t = 30)]
    round_timeout_secs: u64,

    /// Fail a request immediately while its session is busy instead of queueing it.
    #[arg(long, env = "TIDEPOOL_REJECT_CONCURRENT", default_value_t = false)]
    reject_concurrent: bool,

    /// Grace period applied during shutdown.
    #[arg(long, env = "TIDEPOOL_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.round_timeout_secs == 0 {
            anyhow::bail!("round timeout must be at least one second");
        }
        if cli.reap_interval_secs == 0 {
            anyhow::bail!("reap interval must be at least one second");
        }
        let concurrency = if cli.reject_concurrent {
            ConcurrencyPolicy::Reject
        } else {
            ConcurrencyPolicy::Queue
        };
        Ok(ServerConfig {
            listen_addr,
            session: SessionConfig {
                idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
                reap_interval: Duration::from_secs(cli.reap_interval_secs),
                concurrency,
            },
            round_timeout: Duration::from_secs(cli.round_timeout_secs),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        idle_timeout_secs = config.session.idle_timeout.as_secs(),
        round_timeout_secs = config.round_timeout.as_secs(),
        policy = ?config.session.concurrency,
        "starting tidepool server"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let store = SessionStore::new(LifeCycle::new(demo::DemoApp), config.session.clone());
    let reaper = store.spawn_reaper();
    let state = AppState::new(store, config.round_timeout, Some(metrics));
    let router = routes::build_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("tidepool listening on {}", config.listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    reaper.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_convert_into_config() {
        let cli = Cli::parse_from(["tidepool-server"]);
        let config = ServerConfig::try_from(cli).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.session.concurrency, ConcurrencyPolicy::Queue);
        assert_eq!(config.round_timeout, Duration::from_secs(30));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let bad_addr = Cli::parse_from(["tidepool-server", "--listen-addr", "nowhere"]);
        assert!(ServerConfig::try_from(bad_addr).is_err());

        let no_timeout = Cli::parse_from(["tidepool-server", "--round-timeout-secs", "0"]);
        assert!(ServerConfig::try_from(no_timeout).is_err());

        let reject = Cli::parse_from(["tidepool-server", "--reject-concurrent"]);
        assert_eq!(
            ServerConfig::try_from(reject).unwrap().session.concurrency,
            ConcurrencyPolicy::Reject
        );
    }
}
