//! Global compositor state
//!
//! This module contains the surface graph and the configure serial counter,
//! and implements the role/configure handshake on top of them.

use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, warn};

use crate::compositor::shell::{
    Configure, RoleError, RoleId, RoleState, ShellSurface, Toplevel, ToplevelState,
};
use crate::compositor::{BufferHandle, SurfaceId, SurfaceManager};

/// Monotonic serial source shared by every client
#[derive(Debug)]
pub struct SerialCounter(AtomicU32);

impl SerialCounter {
    /// Create a counter whose first serial is 1
    pub fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    /// Consume the next serial
    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for SerialCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// The compositor state
///
/// Owns every surface (and through them their roles) plus the serial
/// counter. Handlers reach it through the server context, never through a
/// global.
#[derive(Debug, Default)]
pub struct CompositorState {
    /// Surface manager - tracks all wl_surfaces
    pub surfaces: SurfaceManager,

    /// Serial counter for configure and ping events
    serial: SerialCounter,
}

impl CompositorState {
    /// Create a new compositor state
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the next serial number for Wayland events
    pub fn next_serial(&self) -> u32 {
        self.serial.next()
    }

    /// Handle wl_compositor::create_surface
    pub fn create_surface(&mut self) -> SurfaceId {
        let id = self.surfaces.create_surface();
        debug!("Created surface {:?}", id);
        id
    }

    /// Drop a surface together with its role chain
    pub fn destroy_surface(&mut self, id: SurfaceId) {
        if self.surfaces.remove(id).is_some() {
            debug!("Removed surface {:?}", id);
        }
    }

    /// Handle xdg_wm_base::get_xdg_surface
    pub fn get_shell_surface(&mut self, id: SurfaceId) -> Result<RoleId, RoleError> {
        let surface = self
            .surfaces
            .get_mut(id)
            .ok_or(RoleError::InvalidSurface)?;

        if surface.has_role() {
            return Err(RoleError::RoleAlreadySet);
        }

        let shell = ShellSurface::new();
        let role = shell.id;
        surface.shell = Some(shell);
        debug!("Surface {:?} acquired xdg_surface {:?}", id, role);
        Ok(role)
    }

    /// Handle xdg_surface::destroy
    ///
    /// Only the xdg_surface identified by `role` is dropped; anything else
    /// already replaced it and is left alone.
    pub fn destroy_shell_surface(&mut self, id: SurfaceId, role: RoleId) {
        let Some(surface) = self.surfaces.get_mut(id) else {
            return;
        };
        if surface.shell.as_ref().is_some_and(|shell| shell.id == role) {
            surface.shell = None;
        }
    }

    /// Whether the xdg_surface `role` still owns a toplevel
    pub fn has_toplevel(&self, id: SurfaceId, role: RoleId) -> bool {
        self.surfaces
            .get(id)
            .and_then(|surface| surface.shell.as_ref())
            .is_some_and(|shell| shell.id == role && shell.toplevel.is_some())
    }

    /// Handle xdg_surface::get_toplevel
    ///
    /// The toplevel starts with a 0x0 size hint and no states, and the first
    /// configure is issued right away.
    pub fn get_toplevel(&mut self, id: SurfaceId) -> Result<(RoleId, Configure), RoleError> {
        let serial = &self.serial;
        let shell = self
            .surfaces
            .get_mut(id)
            .ok_or(RoleError::InvalidSurface)?
            .shell
            .as_mut()
            .ok_or(RoleError::NotConstructed)?;

        if shell.toplevel.is_some() {
            return Err(RoleError::AlreadyConstructed);
        }

        let toplevel = Toplevel::new();
        let role = toplevel.id;
        shell.toplevel = Some(toplevel);
        let configure = shell
            .configure(serial.next())
            .ok_or(RoleError::NotConstructed)?;
        debug!("Surface {:?} became toplevel {:?}, {:?}", id, role, configure);
        Ok((role, configure))
    }

    /// Handle xdg_toplevel::destroy
    ///
    /// Only the toplevel identified by `role` is dropped, together with the
    /// handshake it went through.
    pub fn destroy_toplevel(&mut self, id: SurfaceId, role: RoleId) {
        let Some(shell) = self.shell_mut(id) else {
            return;
        };
        if shell.toplevel.as_ref().is_some_and(|toplevel| toplevel.id == role) {
            shell.toplevel = None;
            shell.last_sent = None;
            shell.acked = None;
        }
    }

    /// Handle xdg_surface::ack_configure
    ///
    /// Only the most recently sent serial is accepted. Anything else is
    /// ignored and `Ok(false)` is returned; the connection stays up.
    pub fn ack_configure(&mut self, id: SurfaceId, serial: u32) -> Result<bool, RoleError> {
        let shell = self.shell_mut(id).ok_or(RoleError::NotConstructed)?;
        let accepted = shell.ack(serial);
        if !accepted {
            warn!(
                "Surface {:?} acked serial {} but last sent was {:?}, ignoring",
                id, serial, shell.last_sent
            );
        }
        Ok(accepted)
    }

    /// Handle wl_surface::attach
    ///
    /// Attaching to an acknowledged toplevel starts a new configure round.
    pub fn attach(
        &mut self,
        id: SurfaceId,
        buffer: Option<BufferHandle>,
    ) -> Result<Option<Configure>, RoleError> {
        let serial = &self.serial;
        let surface = self
            .surfaces
            .get_mut(id)
            .ok_or(RoleError::InvalidSurface)?;
        surface.attach(buffer);

        match surface.shell.as_mut() {
            Some(shell) if shell.state() == RoleState::Acknowledged => {
                Ok(shell.configure(serial.next()))
            }
            _ => Ok(None),
        }
    }

    /// Handle wl_surface::commit
    ///
    /// Returns the buffer to render, or `None` when nothing is attached.
    pub fn commit(&mut self, id: SurfaceId) -> Option<BufferHandle> {
        self.surfaces.get_mut(id)?.commit()
    }

    /// Handle the xdg_toplevel state requests
    ///
    /// Maximized and fullscreen changes are answered with a configure.
    /// Minimized has no configure state and is only recorded.
    pub fn set_toplevel_state(
        &mut self,
        id: SurfaceId,
        state: ToplevelState,
        enabled: bool,
    ) -> Result<Option<Configure>, RoleError> {
        let serial = &self.serial;
        let shell = self
            .surfaces
            .get_mut(id)
            .ok_or(RoleError::InvalidSurface)?
            .shell
            .as_mut()
            .ok_or(RoleError::NotConstructed)?;
        let toplevel = shell.toplevel.as_mut().ok_or(RoleError::NotConstructed)?;

        toplevel.requested.set(state, enabled);
        if state == ToplevelState::MINIMIZED {
            return Ok(None);
        }
        Ok(shell.configure(serial.next()))
    }

    /// Handle xdg_toplevel::set_title
    pub fn set_title(&mut self, id: SurfaceId, title: String) {
        if let Some(toplevel) = self.toplevel_mut(id) {
            toplevel.title = Some(title);
        }
    }

    /// Handle xdg_toplevel::set_app_id
    pub fn set_app_id(&mut self, id: SurfaceId, app_id: String) {
        if let Some(toplevel) = self.toplevel_mut(id) {
            toplevel.app_id = Some(app_id);
        }
    }

    /// Handshake state of a surface, `None` if it does not exist
    pub fn role_state(&self, id: SurfaceId) -> Option<RoleState> {
        let surface = self.surfaces.get(id)?;
        Some(match &surface.shell {
            None => RoleState::Created,
            Some(shell) => shell.state(),
        })
    }

    fn shell_mut(&mut self, id: SurfaceId) -> Option<&mut ShellSurface> {
        self.surfaces.get_mut(id)?.shell.as_mut()
    }

    fn toplevel_mut(&mut self, id: SurfaceId) -> Option<&mut Toplevel> {
        self.shell_mut(id)?.toplevel.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::shm::ShmBufferId;

    fn toplevel(state: &mut CompositorState) -> (SurfaceId, Configure) {
        let id = state.create_surface();
        state.get_shell_surface(id).unwrap();
        let (_, configure) = state.get_toplevel(id).unwrap();
        (id, configure)
    }

    #[test]
    fn test_serial_increments() {
        let state = CompositorState::new();
        let s1 = state.next_serial();
        let s2 = state.next_serial();
        assert!(s2 > s1);
    }

    #[test]
    fn test_handshake() {
        let mut state = CompositorState::new();
        let id = state.create_surface();
        assert_eq!(state.role_state(id), Some(RoleState::Created));

        state.get_shell_surface(id).unwrap();
        assert_eq!(state.role_state(id), Some(RoleState::RoleRequested));

        let (_, configure) = state.get_toplevel(id).unwrap();
        assert_eq!(configure.size, (0, 0));
        assert!(configure.states.is_empty());
        assert_eq!(state.role_state(id), Some(RoleState::ConfigureSent));

        assert!(state.ack_configure(id, configure.serial).unwrap());
        assert_eq!(state.role_state(id), Some(RoleState::Acknowledged));
    }

    #[test]
    fn test_second_shell_surface_rejected() {
        let mut state = CompositorState::new();
        let id = state.create_surface();
        state.get_shell_surface(id).unwrap();
        assert_eq!(state.get_shell_surface(id), Err(RoleError::RoleAlreadySet));
    }

    #[test]
    fn test_shell_surface_after_destroy() {
        let mut state = CompositorState::new();
        let id = state.create_surface();
        let role = state.get_shell_surface(id).unwrap();
        state.destroy_shell_surface(id, role);
        assert!(state.get_shell_surface(id).is_ok());
    }

    #[test]
    fn test_second_toplevel_rejected() {
        let mut state = CompositorState::new();
        let (id, _) = toplevel(&mut state);
        assert_eq!(state.get_toplevel(id), Err(RoleError::AlreadyConstructed));
    }

    #[test]
    fn test_toplevel_without_shell_surface() {
        let mut state = CompositorState::new();
        let id = state.create_surface();
        assert_eq!(state.get_toplevel(id), Err(RoleError::NotConstructed));
    }

    #[test]
    fn test_unknown_surface() {
        let mut state = CompositorState::new();
        let id = state.create_surface();
        state.destroy_surface(id);
        assert_eq!(state.get_shell_surface(id), Err(RoleError::InvalidSurface));
        assert_eq!(state.role_state(id), None);
        assert_eq!(state.commit(id), None);
    }

    #[test]
    fn test_serials_shared_across_surfaces() {
        let mut state = CompositorState::new();
        let (_, first) = toplevel(&mut state);
        let (_, second) = toplevel(&mut state);
        let (_, third) = toplevel(&mut state);
        assert!(second.serial > first.serial);
        assert!(third.serial > second.serial);
    }

    #[test]
    fn test_unissued_serial_ignored() {
        let mut state = CompositorState::new();
        let (id, configure) = toplevel(&mut state);

        for _ in 0..2 {
            assert!(!state.ack_configure(id, configure.serial + 1000).unwrap());
            assert_eq!(state.role_state(id), Some(RoleState::ConfigureSent));
        }
        assert!(state.ack_configure(id, configure.serial).unwrap());
    }

    #[test]
    fn test_attach_before_ack_does_not_configure() {
        let mut state = CompositorState::new();
        let (id, _) = toplevel(&mut state);
        let buffer = Some(BufferHandle::Shm(ShmBufferId(1)));
        assert_eq!(state.attach(id, buffer).unwrap(), None);
    }

    #[test]
    fn test_attach_after_ack_reconfigures() {
        let mut state = CompositorState::new();
        let (id, configure) = toplevel(&mut state);
        state.ack_configure(id, configure.serial).unwrap();

        let buffer = Some(BufferHandle::Shm(ShmBufferId(1)));
        let again = state.attach(id, buffer).unwrap().unwrap();
        assert!(again.serial > configure.serial);
        assert_eq!(state.role_state(id), Some(RoleState::ConfigureSent));
    }

    #[test]
    fn test_commit_without_attach() {
        let mut state = CompositorState::new();
        let (id, _) = toplevel(&mut state);
        assert_eq!(state.commit(id), None);
    }

    #[test]
    fn test_commit_retains_buffer() {
        let mut state = CompositorState::new();
        let id = state.create_surface();
        let buffer = BufferHandle::Shm(ShmBufferId(3));
        state.attach(id, Some(buffer)).unwrap();
        assert_eq!(state.commit(id), Some(buffer));
        assert_eq!(state.commit(id), Some(buffer));
    }

    #[test]
    fn test_maximize_reconfigures() {
        let mut state = CompositorState::new();
        let (id, first) = toplevel(&mut state);

        let configure = state
            .set_toplevel_state(id, ToplevelState::MAXIMIZED, true)
            .unwrap()
            .unwrap();
        assert!(configure.serial > first.serial);
        assert_eq!(configure.states, ToplevelState::MAXIMIZED);

        let configure = state
            .set_toplevel_state(id, ToplevelState::MAXIMIZED, false)
            .unwrap()
            .unwrap();
        assert!(configure.states.is_empty());
    }

    #[test]
    fn test_minimize_only_recorded() {
        let mut state = CompositorState::new();
        let (id, _) = toplevel(&mut state);
        let configure = state
            .set_toplevel_state(id, ToplevelState::MINIMIZED, true)
            .unwrap();
        assert_eq!(configure, None);
    }

    #[test]
    fn test_destroy_toplevel_allows_new_one() {
        let mut state = CompositorState::new();
        let id = state.create_surface();
        state.get_shell_surface(id).unwrap();
        let (role, _) = state.get_toplevel(id).unwrap();
        state.set_title(id, "term".to_string());
        state.destroy_toplevel(id, role);
        assert_eq!(state.role_state(id), Some(RoleState::RoleRequested));
        assert!(state.get_toplevel(id).is_ok());
    }

    #[test]
    fn test_late_teardown_keeps_newer_roles() {
        let mut state = CompositorState::new();
        let id = state.create_surface();
        let old_shell = state.get_shell_surface(id).unwrap();
        let (old_toplevel, _) = state.get_toplevel(id).unwrap();
        state.destroy_toplevel(id, old_toplevel);
        state.destroy_shell_surface(id, old_shell);

        let shell = state.get_shell_surface(id).unwrap();
        let (_, configure) = state.get_toplevel(id).unwrap();
        state.ack_configure(id, configure.serial).unwrap();

        // Destructors of the first chain arriving again change nothing
        state.destroy_toplevel(id, old_toplevel);
        state.destroy_shell_surface(id, old_shell);
        assert_eq!(state.role_state(id), Some(RoleState::Acknowledged));
        assert!(state.has_toplevel(id, shell));
        assert!(!state.has_toplevel(id, old_shell));
    }

    #[test]
    fn test_has_toplevel() {
        let mut state = CompositorState::new();
        let id = state.create_surface();
        let shell = state.get_shell_surface(id).unwrap();
        assert!(!state.has_toplevel(id, shell));

        let (toplevel, _) = state.get_toplevel(id).unwrap();
        assert!(state.has_toplevel(id, shell));

        state.destroy_toplevel(id, toplevel);
        assert!(!state.has_toplevel(id, shell));
    }
}
