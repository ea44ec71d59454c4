//! Deep research service binary.

use tracing_subscriber::prelude::*;

use deep_research::{api, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deep_research=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        "Starting deep-research {} (data dir {})",
        env!("CARGO_PKG_VERSION"),
        config.data_dir.display()
    );

    api::serve(config).await
}
