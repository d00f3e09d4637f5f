//! Wayland global registry implementations and the xdg shell
//!
//! Implements GlobalDispatch for advertising globals to clients, and the
//! xdg_wm_base / xdg_surface / xdg_toplevel role objects.
//!
//! Requests that fail still initialize their new object (marked defunct,
//! owning no state) so they can be traced, and the protocol error is then
//! posted on the object the request was sent to.

use log::{debug, warn};
use wayland_protocols::xdg::shell::server::{
    xdg_popup, xdg_positioner, xdg_surface, xdg_toplevel, xdg_wm_base,
};
use wayland_server::protocol::{wl_compositor, wl_shm};
use wayland_server::{Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource};

use super::{new_id, object, object_or_null, ServerState};
use crate::compositor::{RoleError, RoleId, SurfaceId, ToplevelState};
use crate::protocol::ShmFormat;
use crate::trace::WireArg;

// ============================================================================
// wl_compositor global
// ============================================================================

impl GlobalDispatch<wl_compositor::WlCompositor, ()> for ServerState {
    fn bind(
        state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<wl_compositor::WlCompositor>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        debug!("Client bound wl_compositor");
        let compositor = data_init.init(resource, ());
        state.trace_bind(&compositor);
    }
}

// ============================================================================
// wl_shm global
// ============================================================================

impl GlobalDispatch<wl_shm::WlShm, ()> for ServerState {
    fn bind(
        state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<wl_shm::WlShm>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        debug!("Client bound wl_shm");
        let shm = data_init.init(resource, ());
        state.trace_bind(&shm);

        for format in state.shm.formats() {
            let code = format.to_wayland();
            state.trace_event(&shm, "format", &[WireArg::Uint(code)]);
            match format {
                ShmFormat::Argb8888 => shm.format(wl_shm::Format::Argb8888),
                ShmFormat::Xrgb8888 => shm.format(wl_shm::Format::Xrgb8888),
                ShmFormat::Other(_) => {}
            }
        }
    }
}

// ============================================================================
// xdg_wm_base global
// ============================================================================

impl GlobalDispatch<xdg_wm_base::XdgWmBase, ()> for ServerState {
    fn bind(
        state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<xdg_wm_base::XdgWmBase>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        debug!("Client bound xdg_wm_base");
        let wm_base = data_init.init(resource, ());
        state.trace_bind(&wm_base);

        let serial = state.compositor.next_serial();
        state.trace_event(&wm_base, "ping", &[WireArg::Uint(serial)]);
        wm_base.ping(serial);
    }
}

impl Dispatch<xdg_wm_base::XdgWmBase, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &xdg_wm_base::XdgWmBase,
        request: xdg_wm_base::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            xdg_wm_base::Request::GetXdgSurface { id, surface } => {
                let result = match surface.data::<SurfaceId>() {
                    Some(&surface_id) => state
                        .compositor
                        .get_shell_surface(surface_id)
                        .map(|role| (surface_id, role)),
                    None => Err(RoleError::InvalidSurface),
                };
                let xdg_surface = data_init.init(id, ShellSurfaceData { role: result.ok() });
                state.trace_request(
                    resource,
                    "get_xdg_surface",
                    &[new_id(&xdg_surface), object(&surface)],
                );

                match result {
                    Ok((surface_id, role)) => {
                        debug!("Creating xdg_surface {:?} for surface {:?}", role, surface_id);
                        state.objects.entry(surface_id).or_default().xdg_surface =
                            Some(xdg_surface);
                    }
                    Err(e) => {
                        warn!("get_xdg_surface on {}: {}", surface.id(), e);
                        resource.post_error(xdg_wm_base::Error::Role, e.to_string());
                    }
                }
            }
            xdg_wm_base::Request::CreatePositioner { id } => {
                // Popups are not supported, so neither are positioners
                let positioner = data_init.init(id, ());
                state.trace_request(resource, "create_positioner", &[new_id(&positioner)]);
                resource.post_error(
                    xdg_wm_base::Error::InvalidPositioner,
                    "xdg_positioner is not supported",
                );
            }
            xdg_wm_base::Request::Pong { serial } => {
                state.trace_request(resource, "pong", &[WireArg::Uint(serial)]);
                debug!("Received pong for serial {}", serial);
            }
            xdg_wm_base::Request::Destroy => {
                state.trace_request(resource, "destroy", &[]);
                debug!("xdg_wm_base destroy");
            }
            _ => {}
        }
    }
}

// ============================================================================
// xdg_surface
// ============================================================================

/// User data of an xdg_surface
#[derive(Debug, Clone, Copy)]
pub struct ShellSurfaceData {
    /// The surface and the xdg_surface role this object owns, `None` when
    /// it was created by a failed request
    pub role: Option<(SurfaceId, RoleId)>,
}

fn shell_error_code(error: RoleError) -> xdg_surface::Error {
    match error {
        RoleError::AlreadyConstructed => xdg_surface::Error::AlreadyConstructed,
        _ => xdg_surface::Error::NotConstructed,
    }
}

impl Dispatch<xdg_surface::XdgSurface, ShellSurfaceData> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &xdg_surface::XdgSurface,
        request: xdg_surface::Request,
        data: &ShellSurfaceData,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            xdg_surface::Request::GetToplevel { id } => {
                let result = match data.role {
                    Some((surface_id, _)) => state
                        .compositor
                        .get_toplevel(surface_id)
                        .map(|(role, configure)| (surface_id, role, configure)),
                    None => Err(RoleError::NotConstructed),
                };
                let toplevel = data_init.init(
                    id,
                    ToplevelData {
                        role: result.ok().map(|(surface_id, role, _)| (surface_id, role)),
                    },
                );
                state.trace_request(resource, "get_toplevel", &[new_id(&toplevel)]);

                match result {
                    Ok((surface_id, role, configure)) => {
                        debug!("Creating xdg_toplevel {:?} for surface {:?}", role, surface_id);
                        state.objects.entry(surface_id).or_default().toplevel = Some(toplevel);
                        state.send_configure(surface_id, configure);
                    }
                    Err(e) => {
                        warn!("get_toplevel on {}: {}", resource.id(), e);
                        resource.post_error(shell_error_code(e), e.to_string());
                    }
                }
            }
            xdg_surface::Request::GetPopup {
                id,
                parent,
                positioner,
            } => {
                let popup = data_init.init(id, ());
                state.trace_request(
                    resource,
                    "get_popup",
                    &[
                        new_id(&popup),
                        object_or_null(parent.as_ref()),
                        object(&positioner),
                    ],
                );
                resource.post_error(
                    xdg_surface::Error::NotConstructed,
                    "xdg_popup is not supported",
                );
            }
            xdg_surface::Request::SetWindowGeometry {
                x,
                y,
                width,
                height,
            } => {
                state.trace_request(
                    resource,
                    "set_window_geometry",
                    &[
                        WireArg::Int(x),
                        WireArg::Int(y),
                        WireArg::Int(width),
                        WireArg::Int(height),
                    ],
                );
                debug!("Set window geometry ({}, {}, {}, {})", x, y, width, height);
            }
            xdg_surface::Request::AckConfigure { serial } => {
                state.trace_request(resource, "ack_configure", &[WireArg::Uint(serial)]);
                let Some((surface_id, _)) = data.role else {
                    return;
                };
                match state.compositor.ack_configure(surface_id, serial) {
                    Ok(true) => debug!("Surface {:?} acked configure {}", surface_id, serial),
                    Ok(false) => {}
                    Err(e) => warn!("ack_configure on surface {:?}: {}", surface_id, e),
                }
            }
            xdg_surface::Request::Destroy => {
                state.trace_request(resource, "destroy", &[]);
                debug!("xdg_surface destroy");
                // The toplevel has to go first
                if let Some((surface_id, role)) = data.role {
                    if state.compositor.has_toplevel(surface_id, role) {
                        warn!(
                            "xdg_surface of surface {:?} destroyed before its toplevel",
                            surface_id
                        );
                        resource.post_error(
                            xdg_surface::Error::DefunctRoleObject,
                            "xdg_surface destroyed before its xdg_toplevel",
                        );
                    }
                }
            }
            _ => {}
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        resource: &xdg_surface::XdgSurface,
        data: &ShellSurfaceData,
    ) {
        let Some((surface_id, role)) = data.role else {
            return;
        };
        state.compositor.destroy_shell_surface(surface_id, role);
        if let Some(objects) = state.objects.get_mut(&surface_id) {
            if objects.xdg_surface.as_ref() == Some(resource) {
                objects.xdg_surface = None;
                objects.toplevel = None;
            }
        }
    }
}

// ============================================================================
// xdg_toplevel
// ============================================================================

/// User data of an xdg_toplevel
#[derive(Debug, Clone, Copy)]
pub struct ToplevelData {
    /// The surface and the toplevel role this object owns, `None` when it
    /// was created by a failed request
    pub role: Option<(SurfaceId, RoleId)>,
}

impl ServerState {
    fn toggle_toplevel_state(&mut self, data: &ToplevelData, flag: ToplevelState, enabled: bool) {
        let Some((surface_id, _)) = data.role else {
            return;
        };
        match self.compositor.set_toplevel_state(surface_id, flag, enabled) {
            Ok(Some(configure)) => self.send_configure(surface_id, configure),
            Ok(None) => {}
            Err(e) => warn!("Toplevel state change on {:?}: {}", surface_id, e),
        }
    }
}

impl Dispatch<xdg_toplevel::XdgToplevel, ToplevelData> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &xdg_toplevel::XdgToplevel,
        request: xdg_toplevel::Request,
        data: &ToplevelData,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        let surface_id = data.role.map(|(surface_id, _)| surface_id);
        match request {
            xdg_toplevel::Request::SetParent { parent } => {
                state.trace_request(resource, "set_parent", &[object_or_null(parent.as_ref())]);
            }
            xdg_toplevel::Request::SetTitle { title } => {
                state.trace_request(resource, "set_title", &[WireArg::Str(Some(&title))]);
                if let Some(surface_id) = surface_id {
                    debug!("Toplevel {:?} set title: {}", surface_id, title);
                    state.compositor.set_title(surface_id, title);
                }
            }
            xdg_toplevel::Request::SetAppId { app_id } => {
                state.trace_request(resource, "set_app_id", &[WireArg::Str(Some(&app_id))]);
                if let Some(surface_id) = surface_id {
                    debug!("Toplevel {:?} set app_id: {}", surface_id, app_id);
                    state.compositor.set_app_id(surface_id, app_id);
                }
            }
            xdg_toplevel::Request::ShowWindowMenu { seat, serial, x, y } => {
                state.trace_request(
                    resource,
                    "show_window_menu",
                    &[
                        object(&seat),
                        WireArg::Uint(serial),
                        WireArg::Int(x),
                        WireArg::Int(y),
                    ],
                );
            }
            xdg_toplevel::Request::Move { seat, serial } => {
                state.trace_request(resource, "move", &[object(&seat), WireArg::Uint(serial)]);
            }
            xdg_toplevel::Request::Resize {
                seat,
                serial,
                edges,
            } => {
                let edges = match edges {
                    wayland_server::WEnum::Value(v) => u32::from(v),
                    wayland_server::WEnum::Unknown(v) => v,
                };
                state.trace_request(
                    resource,
                    "resize",
                    &[object(&seat), WireArg::Uint(serial), WireArg::Uint(edges)],
                );
            }
            xdg_toplevel::Request::SetMaxSize { width, height } => {
                state.trace_request(
                    resource,
                    "set_max_size",
                    &[WireArg::Int(width), WireArg::Int(height)],
                );
            }
            xdg_toplevel::Request::SetMinSize { width, height } => {
                state.trace_request(
                    resource,
                    "set_min_size",
                    &[WireArg::Int(width), WireArg::Int(height)],
                );
            }
            xdg_toplevel::Request::SetMaximized => {
                state.trace_request(resource, "set_maximized", &[]);
                state.toggle_toplevel_state(data, ToplevelState::MAXIMIZED, true);
            }
            xdg_toplevel::Request::UnsetMaximized => {
                state.trace_request(resource, "unset_maximized", &[]);
                state.toggle_toplevel_state(data, ToplevelState::MAXIMIZED, false);
            }
            xdg_toplevel::Request::SetFullscreen { output } => {
                state.trace_request(resource, "set_fullscreen", &[object_or_null(output.as_ref())]);
                state.toggle_toplevel_state(data, ToplevelState::FULLSCREEN, true);
            }
            xdg_toplevel::Request::UnsetFullscreen => {
                state.trace_request(resource, "unset_fullscreen", &[]);
                state.toggle_toplevel_state(data, ToplevelState::FULLSCREEN, false);
            }
            xdg_toplevel::Request::SetMinimized => {
                state.trace_request(resource, "set_minimized", &[]);
                state.toggle_toplevel_state(data, ToplevelState::MINIMIZED, true);
            }
            xdg_toplevel::Request::Destroy => {
                state.trace_request(resource, "destroy", &[]);
                debug!("Toplevel {:?} destroy", surface_id);
            }
            _ => {}
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        resource: &xdg_toplevel::XdgToplevel,
        data: &ToplevelData,
    ) {
        let Some((surface_id, role)) = data.role else {
            return;
        };
        state.compositor.destroy_toplevel(surface_id, role);
        if let Some(objects) = state.objects.get_mut(&surface_id) {
            if objects.toplevel.as_ref() == Some(resource) {
                objects.toplevel = None;
            }
        }
    }
}

// ============================================================================
// xdg_positioner / xdg_popup
// ============================================================================

// Both are refused when created, so the client is already disconnected
// when these could see a request.

impl Dispatch<xdg_positioner::XdgPositioner, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &xdg_positioner::XdgPositioner,
        request: xdg_positioner::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        if let xdg_positioner::Request::Destroy = request {
            state.trace_request(resource, "destroy", &[]);
        }
    }
}

impl Dispatch<xdg_popup::XdgPopup, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &xdg_popup::XdgPopup,
        request: xdg_popup::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        if let xdg_popup::Request::Destroy = request {
            state.trace_request(resource, "destroy", &[]);
        }
    }
}
