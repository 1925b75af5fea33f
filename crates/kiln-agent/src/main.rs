use std::sync::Arc;

use kiln_agent::{InstanceStore, JsonInstanceStore, Settings, SupervisorRegistry};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let dir = std::env::var("KILN_LOG_DIR")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    let Some(dir) = dir else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .init();
        return None;
    };

    let appender = tracing_appender::rolling::daily(&dir, "kiln-agent.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer),
        )
        .init();
    Some(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = init_tracing();

    let settings = Settings::from_env();
    let data_root = kiln_agent::settings::data_root();
    tracing::info!(
        data_root = %data_root.display(),
        version = env!("CARGO_PKG_VERSION"),
        "kiln-agent starting"
    );

    let store: Arc<dyn InstanceStore> = Arc::new(JsonInstanceStore::open(&data_root)?);
    let registry = SupervisorRegistry::load(store, settings, data_root).await?;

    for (name, status) in registry.statuses().await {
        tracing::info!(instance = %name, %status, "instance");
    }

    tokio::signal::ctrl_c().await?;

    // Servers run in their own sessions and are re-attached on the next start.
    let running = registry
        .statuses()
        .await
        .into_iter()
        .filter(|(_, s)| !s.is_offline())
        .count();
    tracing::info!(running, "kiln-agent shutting down; leaving servers running");
    Ok(())
}
