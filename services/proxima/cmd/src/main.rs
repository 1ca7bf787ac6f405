//! Proxima service binary.
//!
//! Loads the YAML configuration, keeps the declared protocol adapters
//! running, reloads the file on SIGHUP and shuts every adapter down on
//! SIGINT or SIGTERM.

use anyhow::Context;
use clap::Parser;
use proxima_adapters::{RsKafkaConnector, SuppaFtpConnector};
use proxima_control::{Controller, ProtocolId, Registry};
use proxima_session::Pipeline;
use proxima_wire::Record;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::ProximaConfig;
use logging::ProximaLogFormatter;

const LOG_TARGETS: [&str; 5] = [
    "proxima",
    "proxima_wire",
    "proxima_session",
    "proxima_adapters",
    "proxima_control",
];

/// Keeps a declared set of protocol adapters connected
#[derive(Parser, Debug)]
#[command(name = "proxima", version, about = "Declarative protocol adapter supervisor")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "./proxima.yaml")]
    config: PathBuf,

    /// Desired state, e.g. "ws_server,tcp_client" (overrides file and environment)
    #[arg(long)]
    state: Option<String>,

    /// Reconcile interval, e.g. 15s (overrides file and environment)
    #[arg(long)]
    reconcile_interval: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(&self, config: &mut ProximaConfig) {
        if let Some(state) = &self.state {
            config.state = state.clone();
        }
        if let Some(interval) = &self.reconcile_interval {
            config.bundle.reconcile_interval_ms =
                u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        }
    }
}

fn init_logging(log_level: &str) -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let mut filter = EnvFilter::new("warn");
            for target in LOG_TARGETS {
                filter = filter.add_directive(format!("{}={}", target, log_level).parse()?);
            }
            filter
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(ProximaLogFormatter::new("proxima"))
        .init();
    Ok(())
}

/// Pipeline that logs every delivered record
fn logging_pipeline(id: ProtocolId) -> Pipeline {
    Pipeline::new().with_deliver(move |record: Record| async move {
        info!(
            protocol = id.as_str(),
            "Received {}",
            serde_json::Value::Object(record)
        );
        Ok(())
    })
}

fn build_registry() -> Registry {
    let registry = Registry::new()
        .with_broker_connector(Arc::new(RsKafkaConnector::new()))
        .with_file_transfer_connector(Arc::new(SuppaFtpConnector::new()));

    ProtocolId::ALL
        .into_iter()
        .fold(registry, |registry, id| {
            registry.with_pipeline(id, logging_pipeline(id))
        })
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level).context("invalid log level")?;

    info!("Starting proxima v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ProximaConfig::load(&args.config);
    args.apply(&mut config);

    let controller = Controller::new(build_registry(), config.bundle.clone());
    controller.set_state(&config.state);
    controller.start_monitoring().await;

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sighup.recv() => {
                match ProximaConfig::read(&args.config) {
                    Ok(mut reloaded) => {
                        reloaded.apply_overrides(|key| std::env::var(key).ok());
                        args.apply(&mut reloaded);

                        let interval_changed = reloaded.bundle.reconcile_interval_ms
                            != controller.config().reconcile_interval_ms;
                        controller.set_state(&reloaded.state);
                        controller.set_config(reloaded.bundle);
                        info!("Configuration reloaded from {}", args.config.display());

                        if interval_changed {
                            controller.start_monitoring().await;
                        }
                    }
                    Err(e) => warn!("Reload failed, keeping current configuration: {:#}", e),
                }
            }
        }
    }

    controller.stop_monitoring().await;
    info!("Proxima stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxima_control::ConfigBundle;
    use proxima_session::ConnectionState;

    #[tokio::test]
    async fn test_registry_connects_kafka_and_ftp() {
        let yaml = r#"
protocols:
  kafka_client:
    client_id: proxima
    brokers: ["127.0.0.1:1"]
    group_id: proxima-group
    topics: [orders]
    connect_timeout_ms: 300
    reconnect_interval_ms: 60000
  ftp_client:
    host: 127.0.0.1
    port: 1
    timeout_ms: 300
    reconnect_interval_ms: 60000
"#;
        let bundle: ConfigBundle = serde_yaml::from_str(yaml).unwrap();
        let registry = build_registry();

        // A registered connector turns an unreachable server into a retry
        // instead of a configuration error
        for id in [ProtocolId::KafkaClient, ProtocolId::FtpClient] {
            let adapter = registry.build(&bundle.get(id).unwrap()).unwrap();
            let lifecycle = adapter.as_protocol();
            lifecycle.start().await.unwrap();
            assert_eq!(lifecycle.state(), ConnectionState::Reconnecting, "{}", id);
            lifecycle.stop().await;
        }
    }
}
