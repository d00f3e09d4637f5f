//! Compositor core module
//!
//! This module contains the core compositor logic including:
//! - The surface graph and pending buffers
//! - The xdg_surface / xdg_toplevel role chain
//! - The configure handshake and its serial counter

pub mod shell;
pub mod state;
pub mod surface;

pub use shell::{Configure, RoleError, RoleId, RoleState, ShellSurface, Toplevel, ToplevelState};
pub use state::{CompositorState, SerialCounter};
pub use surface::{BufferHandle, Surface, SurfaceId, SurfaceManager};
