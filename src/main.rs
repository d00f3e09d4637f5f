//! Waytty - a Wayland compositor that draws into a terminal
//!
//! Entry point: reads the environment, opens the Wayland socket and serves
//! clients until the event loop fails.

use log::info;
use waytty::config::Config;
use waytty::server::{ServerState, WaylandServer};

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env()?;
    info!(
        "Starting waytty, renderer {:?}, trace {}",
        config.renderer,
        if config.trace { "on" } else { "off" }
    );

    let mut server = WaylandServer::new()?;
    server.register_globals();
    info!("Run clients with WAYLAND_DISPLAY={}", server.socket_name());

    server.run(ServerState::from_config(&config))
}
