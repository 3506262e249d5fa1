use clap::Parser;
use std::time::Duration;
use substring_counter::{cancel_on_signal, run, Settings};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .without_time()
        .init();

    // Malformed configuration stops the process here, before any work starts.
    let config = Settings::parse().into_config()?;

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;

    let outcome = runtime.block_on(async {
        let cancel = CancellationToken::new();
        cancel_on_signal(cancel.clone());

        let total = run(BufReader::new(tokio::io::stdin()), &config, cancel.clone()).await?;
        if cancel.is_cancelled() {
            info!("Stopped early on shutdown signal, total covers finished origins only");
        }
        anyhow::Ok(total)
    });

    // A pending stdin read can't be interrupted; don't wait for it.
    runtime.shutdown_timeout(Duration::from_millis(100));

    outcome.map(|_| ())
}
