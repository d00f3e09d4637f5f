//! Wayland protocol implementations
//!
//! This module contains the protocol-level pieces that are independent of
//! the dispatch glue:
//! - wl_shm, wl_shm_pool, wl_buffer (buffer import)

pub mod shm;

pub use shm::{BufferAccess, ImportError, PixelView, ShmError, ShmFormat, ShmHandler};
