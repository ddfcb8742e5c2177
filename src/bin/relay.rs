//! Relay server binary.
//!
//! Wires the live service clients into the relay and serves until
//! interrupted. Pass a TOML config path as the only argument; without
//! one, defaults apply and credentials come from the environment.

use golem::generation::ApiGeneration;
use golem::recognition::live_ws::LiveWsRecognition;
use golem::relay::{Backends, RelayServer};
use golem::synthesis::stream_ws::StreamWsSynthesis;
use golem::{RelayConfig, SessionRegistry};
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => RelayConfig::load(&path)?,
        None => RelayConfig::default(),
    };

    let backends = Backends {
        recognition: Arc::new(LiveWsRecognition::new(&config.recognition)?),
        generation: Arc::new(ApiGeneration::new(&config.generation)?),
        synthesis: Arc::new(StreamWsSynthesis::new(&config.synthesis)?),
    };
    let registry = Arc::new(SessionRegistry::new());

    let server = RelayServer::bind(config, registry, backends).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.shutdown();
    Ok(())
}
