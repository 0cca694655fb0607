// main.rs — process setup and wiring

mod config;
mod events;
mod hooks;
mod level;
mod server;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;
use crate::server::Server;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM, SIGQUIT] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .context("couldn't install signal handler")?;
    }

    let config = ServerConfig::from_env();
    let mut server = Server::new(config, shutdown)?;
    server.run()
}
