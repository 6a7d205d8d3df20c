use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use warden_agent::{AgentSettings, Manager};

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "warden-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .with(file_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = AgentSettings::load().context("load agent settings")?;
    let _log_guard = init_tracing(settings.log_dir.as_deref());

    tracing::info!(
        data_root = %settings.data_root.display(),
        version = env!("CARGO_PKG_VERSION"),
        "warden-agent starting"
    );

    let manager = Manager::new(settings)
        .await
        .context("initialise server registry")?;

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    tracing::info!("shutdown requested");

    manager.shutdown().await;
    Ok(())
}
