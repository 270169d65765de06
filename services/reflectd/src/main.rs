// Daemon entry point.
use anyhow::Result;
use clap::Parser;
use reflectd::config::{Cli, DaemonConfig};
use reflectd::observability;
use reflectd::server::Daemon;

#[tokio::main]
async fn main() -> Result<()> {
    let config = DaemonConfig::from_cli(Cli::parse())?;
    observability::init_tracing(&config.log_level);

    if let Some(metrics_bind) = config.metrics_bind {
        let handle = observability::install_metrics_recorder();
        tokio::spawn(async move {
            if let Err(err) = observability::serve_metrics(handle, metrics_bind).await {
                tracing::warn!(error = %err, "metrics endpoint exited");
            }
        });
    }

    let daemon = Daemon::bind(config).await?;
    tokio::select! {
        result = daemon.run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
            Ok(())
        }
    }
}
