pub mod config;
pub mod observer;
pub mod server;
pub mod statistics;

use std::sync::Arc;

use self::{config::Config, statistics::Statistics};

#[rustfmt::skip]
static SOFTWARE: &str = concat!(
    "quic-endpoint.",
    env!("CARGO_PKG_VERSION")
);

/// In order to let integration tests start the endpoint directly from
/// the crate, a function is opened to replace the main function.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    log::info!("{} starting", SOFTWARE);
    log::info!(
        "supported versions: {:?}",
        codec::SUPPORTED_VERSIONS
            .map(|it| format!("{:#010x}", it))
    );

    let statistics = Statistics::default();
    server::start(&config, &statistics)?;

    // The endpoint is non-blocking after it runs; park the main task
    // until interrupted.
    tokio::signal::ctrl_c().await?;
    Ok(())
}
