//! Exchange runner.
//!
//! ## Running
//!
//! Against a local broker (requires the `kafka` feature):
//! ```bash
//! cargo run --features kafka --bin kafka-exchange
//! ```
//!
//! Without the feature the run uses the in-memory broker:
//! ```bash
//! BATCH_SIZE=10 LOG_FORMAT=json cargo run --bin kafka-exchange
//! ```
//!
//! See [`ExchangeConfig::from_env`] for every supported variable.

use std::process::ExitCode;
use std::sync::Arc;

use kafka_exchange::broker::BrokerClient;
use kafka_exchange::config::ExchangeConfig;
use kafka_exchange::coordinator::Coordinator;
use kafka_exchange::error::ExchangeError;
use kafka_exchange::telemetry::{LogFormat, init_logging};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_logging(LogFormat::from_env()) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, error_kind = e.as_label(), "Exchange aborted");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), ExchangeError> {
    let config = ExchangeConfig::from_env()?;
    info!(
        brokers = %config.bootstrap_servers(),
        topic = %config.topic.name,
        group = %config.group_id,
        batch_size = config.batch_size,
        rejoin = ?config.rejoin,
        "Starting exchange"
    );
    if !config.rejoin.is_bounded() {
        warn!("Unbounded rejoin policy: set REJOIN_MAX_RETRIES to bound retries");
    }

    let client = connect(&config)?;
    let report = Coordinator::new(config, client).run().await?;

    info!(
        provisioned = ?report.provisioned,
        sent = report.sent,
        observed = report.observed,
        joins = report.joins,
        "Exchange finished"
    );
    Ok(())
}

#[cfg(feature = "kafka")]
fn connect(config: &ExchangeConfig) -> Result<Arc<dyn BrokerClient>, ExchangeError> {
    let broker = kafka_exchange::broker::kafka::KafkaBroker::new(config)?;
    Ok(Arc::new(broker))
}

#[cfg(not(feature = "kafka"))]
fn connect(config: &ExchangeConfig) -> Result<Arc<dyn BrokerClient>, ExchangeError> {
    use kafka_exchange::broker::{InMemoryBroker, MemoryOptions};

    warn!("Built without the `kafka` feature; using the in-memory broker");
    Ok(Arc::new(InMemoryBroker::with_options(MemoryOptions {
        client_id: config.client_id.clone(),
        offset_reset: config.offset_reset,
        ..Default::default()
    })))
}
