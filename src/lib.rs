//! Waytty - a Wayland compositor that draws into a terminal
//!
//! Waytty accepts Wayland clients, negotiates an xdg toplevel with each of
//! them and renders every committed shm buffer to stdout, either as 24-bit
//! coloured block glyphs or as a sixel image scaled to the terminal.
//!
//! # Architecture
//!
//! - **Compositor Core**: surfaces, shell roles and the configure handshake
//! - **Protocol Layer**: wl_shm pools, buffers and pixel access
//! - **Renderer**: terminal encoders behind the `FrameEncoder` trait
//! - **Trace**: one line per protocol message on stderr
//! - **Server**: wayland-server-rs dispatch glue and the calloop event loop
//!
//! # Example
//!
//! ```no_run
//! use waytty::config::Config;
//! use waytty::server::{ServerState, WaylandServer};
//!
//! let config = Config::from_env()?;
//! let mut server = WaylandServer::new()?;
//! server.register_globals();
//! server.run(ServerState::from_config(&config))?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod compositor;
pub mod config;
pub mod protocol;
pub mod renderer;
pub mod server;
pub mod trace;
