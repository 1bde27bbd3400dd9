mod config;
mod logging;
mod scenario;

use anyhow::Result;
use rtsviewer_tracks::LayerReconciler;
use std::time::Duration;
use tracing::info;

use crate::config::load_config;
use crate::scenario::{Scenario, ScenarioRunner};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load and validate configuration
    let config = load_config()?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("RTS viewer scenario runner starting...");

    // 3. Load the scenario
    let scenario = match &config.scenario.path {
        Some(path) => {
            info!(path = %path, "Loading scenario file");
            Scenario::from_file(path)?
        }
        None => {
            info!("No scenario configured, running the built-in demo");
            Scenario::demo()?
        }
    };

    // 4. Replay it
    let reconciler = LayerReconciler::new(config.tracks.clone());
    let runner = ScenarioRunner::new(
        reconciler.clone(),
        &scenario.sources,
        Duration::from_millis(config.scenario.call_latency_ms),
        Duration::from_millis(config.scenario.settle_timeout_ms),
    );
    let report = runner.run(&scenario).await?;

    print!("{report}");

    reconciler.reset();
    info!("RTS viewer scenario runner stopped");
    Ok(())
}
