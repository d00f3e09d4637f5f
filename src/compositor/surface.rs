//! Surface management
//!
//! This module tracks wl_surfaces, their pending buffer and the role chain
//! (xdg_surface, then xdg_toplevel) each surface acquires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::compositor::shell::ShellSurface;
use crate::protocol::shm::ShmBufferId;

/// Unique identifier for surfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u64);

impl SurfaceId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        SurfaceId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A buffer reference as seen by a surface
///
/// Only shm buffers can be imported; anything else is kept as an opaque
/// protocol id so that a commit can skip it silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferHandle {
    /// Buffer created from a wl_shm_pool
    Shm(ShmBufferId),
    /// Buffer of a type this compositor does not import
    Foreign(u32),
}

/// A Wayland surface
#[derive(Debug)]
pub struct Surface {
    /// Unique identifier
    pub id: SurfaceId,
    /// Buffer attached by the client, kept across commits
    pub pending: Option<BufferHandle>,
    /// Number of commits that reached the renderer
    pub presented: u64,
    /// The xdg_surface role, if one was requested
    pub shell: Option<ShellSurface>,
}

impl Surface {
    /// Create a new surface
    pub fn new() -> Self {
        Self {
            id: SurfaceId::new(),
            pending: None,
            presented: 0,
            shell: None,
        }
    }

    /// Attach a buffer (or detach with `None`)
    pub fn attach(&mut self, buffer: Option<BufferHandle>) {
        self.pending = buffer;
    }

    /// Buffer to render for a commit
    ///
    /// The pending buffer is not consumed: committing again without a new
    /// attach re-renders the same buffer.
    pub fn commit(&mut self) -> Option<BufferHandle> {
        let buffer = self.pending?;
        self.presented += 1;
        Some(buffer)
    }

    /// Whether this surface already holds a shell surface role
    pub fn has_role(&self) -> bool {
        self.shell.is_some()
    }
}

impl Default for Surface {
    fn default() -> Self {
        Self::new()
    }
}

/// Manager for all surfaces
#[derive(Debug)]
pub struct SurfaceManager {
    surfaces: HashMap<SurfaceId, Surface>,
}

impl SurfaceManager {
    /// Create a new surface manager
    pub fn new() -> Self {
        Self {
            surfaces: HashMap::new(),
        }
    }

    /// Create a new surface and return its ID
    pub fn create_surface(&mut self) -> SurfaceId {
        let surface = Surface::new();
        let id = surface.id;
        self.surfaces.insert(id, surface);
        id
    }

    /// Get a surface by ID
    pub fn get(&self, id: SurfaceId) -> Option<&Surface> {
        self.surfaces.get(&id)
    }

    /// Get a mutable surface by ID
    pub fn get_mut(&mut self, id: SurfaceId) -> Option<&mut Surface> {
        self.surfaces.get_mut(&id)
    }

    /// Remove a surface, dropping its whole role chain
    pub fn remove(&mut self, id: SurfaceId) -> Option<Surface> {
        self.surfaces.remove(&id)
    }

    /// Get count of surfaces
    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }
}

impl Default for SurfaceManager {
    fn default() -> Self {
        Self::new()
    }
}
