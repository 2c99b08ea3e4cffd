use anyhow::{anyhow, Context, Result};
use objectstore_sink::source::KafkaSource;
use objectstore_sink::{Config, ObjectStorageSink};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting object storage sink"
    );

    let kafka_config = config
        .kafka
        .clone()
        .context("Missing [kafka] configuration section")?;

    let sink = Arc::new(
        ObjectStorageSink::start(config)
            .await
            .context("Failed to start sink")?,
    );

    let mut source = KafkaSource::new(&kafka_config, sink.clone())
        .context("Failed to initialize Kafka source")?;

    let shutdown = CancellationToken::new();
    let source_shutdown = shutdown.clone();
    let mut source_handle = tokio::spawn(async move {
        let result = source.run(source_shutdown).await;
        (source, result)
    });

    info!("Sink started successfully");

    // Stop on a signal, or when the source gives up on its own
    let finished = tokio::select! {
        _ = shutdown_signal() => None,
        joined = &mut source_handle => Some(joined),
    };

    info!("Shutting down object storage sink");
    shutdown.cancel();

    let joined = match finished {
        Some(joined) => joined,
        None => source_handle.await,
    };
    let (mut source, source_result) = joined.context("Kafka source task failed")?;

    match sink.shutdown().await {
        Ok(stats) => {
            if stats.failed_terminal > 0 || stats.abandoned > 0 {
                warn!(
                    failed = stats.failed_terminal,
                    abandoned = stats.abandoned,
                    "Some files were not uploaded and remain on local disk"
                );
            }
            info!(
                uploaded = stats.succeeded,
                retries = stats.retries,
                "Uploads drained"
            );
        }
        Err(e) => error!(error = %e, "Sink shutdown failed"),
    }

    // Only offsets whose files reached the store
    source.commit_uploaded();

    if let Some(fatal) = sink.fatal_error() {
        return Err(anyhow!(fatal)).context("Sink halted");
    }
    source_result?;

    info!("Object storage sink stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
