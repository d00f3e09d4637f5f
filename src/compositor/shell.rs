//! Shell roles layered onto a surface
//!
//! A surface acquires a [`ShellSurface`] (xdg_surface) and the shell surface
//! then acquires a [`Toplevel`] (xdg_toplevel). The chain only ever grows:
//! each level is owned by the one below it and is acquired at most once.

use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Toplevel window states
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ToplevelState: u32 {
        const MAXIMIZED = 1 << 0;
        const FULLSCREEN = 1 << 1;
        const MINIMIZED = 1 << 2;
    }
}

/// Identity of one role object
///
/// A surface can hold several xdg_surfaces (and toplevels) over its
/// lifetime, one at a time. Teardown is matched against this id so a late
/// destructor never clears a newer role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoleId(pub u64);

impl RoleId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        RoleId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Where a surface's role chain stands in the configure handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleState {
    /// Plain wl_surface, no role yet
    Created,
    /// xdg_surface exists, no toplevel
    RoleRequested,
    /// Toplevel exists, nothing sent yet
    ToplevelBound,
    /// A configure is waiting for its acknowledgement
    ConfigureSent,
    /// The last configure was acknowledged
    Acknowledged,
}

/// A configure proposal to be sent to the client
///
/// Sent as `xdg_toplevel.configure(size, states)` followed by
/// `xdg_surface.configure(serial)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Configure {
    pub serial: u32,
    /// Size hint, 0x0 lets the client choose
    pub size: (i32, i32),
    pub states: ToplevelState,
}

/// The xdg_toplevel role
#[derive(Debug)]
pub struct Toplevel {
    pub id: RoleId,
    /// States sent in the last configure
    pub states: ToplevelState,
    /// States the client asked for, sent with the next configure
    pub requested: ToplevelState,
    /// Size hint sent in the last configure
    pub size: (i32, i32),
    /// Window title
    pub title: Option<String>,
    /// Application ID
    pub app_id: Option<String>,
}

impl Toplevel {
    /// Create a toplevel with an empty state set and a 0x0 size hint
    pub fn new() -> Self {
        Self {
            id: RoleId::new(),
            states: ToplevelState::empty(),
            requested: ToplevelState::empty(),
            size: (0, 0),
            title: None,
            app_id: None,
        }
    }
}

impl Default for Toplevel {
    fn default() -> Self {
        Self::new()
    }
}

/// The xdg_surface role
#[derive(Debug)]
pub struct ShellSurface {
    pub id: RoleId,
    /// The toplevel role, once requested
    pub toplevel: Option<Toplevel>,
    /// Serial of the most recent configure sent
    pub last_sent: Option<u32>,
    /// Serial of the most recent accepted acknowledgement
    pub acked: Option<u32>,
}

impl ShellSurface {
    /// Create a shell surface without a toplevel
    pub fn new() -> Self {
        Self {
            id: RoleId::new(),
            toplevel: None,
            last_sent: None,
            acked: None,
        }
    }

    /// Current handshake state
    pub fn state(&self) -> RoleState {
        match (&self.toplevel, self.last_sent) {
            (None, _) => RoleState::RoleRequested,
            (Some(_), None) => RoleState::ToplevelBound,
            (Some(_), Some(sent)) if self.acked == Some(sent) => RoleState::Acknowledged,
            (Some(_), Some(_)) => RoleState::ConfigureSent,
        }
    }

    /// Record an outgoing configure for the toplevel
    ///
    /// Returns `None` when there is no toplevel to configure.
    pub fn configure(&mut self, serial: u32) -> Option<Configure> {
        let toplevel = self.toplevel.as_mut()?;
        toplevel.states = toplevel.requested;
        self.last_sent = Some(serial);
        Some(Configure {
            serial,
            size: toplevel.size,
            states: toplevel.states,
        })
    }

    /// Accept an acknowledgement if it echoes the last serial sent
    pub fn ack(&mut self, serial: u32) -> bool {
        if self.last_sent == Some(serial) {
            self.acked = Some(serial);
            true
        } else {
            false
        }
    }
}

impl Default for ShellSurface {
    fn default() -> Self {
        Self::new()
    }
}

/// Role errors
///
/// All of these are protocol violations and end the client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RoleError {
    #[error("Invalid surface")]
    InvalidSurface,
    #[error("Surface already has an xdg_surface")]
    RoleAlreadySet,
    #[error("xdg_surface already has a toplevel")]
    AlreadyConstructed,
    #[error("xdg_surface has no role object")]
    NotConstructed,
}
