//! Wayland server implementation
//!
//! This module sets up the Wayland display server, registers globals,
//! and dispatches protocol requests to the compositor, the shm importer
//! and the terminal renderer.

mod dispatch;
mod globals;

use std::collections::HashMap;
use std::os::unix::io::AsFd;
use std::sync::Arc;
use std::time::Instant;

use calloop::generic::Generic;
use calloop::{EventLoop, Interest, LoopHandle, Mode, PostAction};
use log::{debug, error, info, warn};
use wayland_backend::protocol::ProtocolError;
use wayland_protocols::xdg::shell::server::{xdg_surface, xdg_toplevel, xdg_wm_base};
use wayland_server::protocol::{wl_callback, wl_compositor, wl_shm};
use wayland_server::{Client, Display, DisplayHandle, ListeningSocket, Resource};

use crate::compositor::{BufferHandle, CompositorState, Configure, SurfaceId, ToplevelState};
use crate::config::Config;
use crate::protocol::ShmHandler;
use crate::renderer::Renderer;
use crate::trace::{new_id_types, signature_of, Direction, ObjectRef, Tracer, WireArg, WireMessage};

pub use globals::*;

/// wl_display.error code for allocation failures
const DISPLAY_NO_MEMORY: u32 = 2;

/// The Wayland server
///
/// Owns the display and the listening socket until both are moved into an
/// event loop.
pub struct WaylandServer {
    /// The Wayland display
    display: Display<ServerState>,
    /// Listening socket for client connections
    socket: ListeningSocket,
    /// Socket name for WAYLAND_DISPLAY
    socket_name: String,
}

/// Protocol objects belonging to one surface
///
/// Kept next to the compositor state so configure and frame events can be
/// sent without the compositor knowing about wire resources.
#[derive(Debug, Default)]
pub struct SurfaceObjects {
    pub xdg_surface: Option<xdg_surface::XdgSurface>,
    pub toplevel: Option<xdg_toplevel::XdgToplevel>,
    /// Pending wl_surface.frame callbacks, fired on the next commit
    pub frame_callbacks: Vec<wl_callback::WlCallback>,
}

/// State passed to Wayland dispatch handlers
pub struct ServerState {
    /// Surfaces, roles and the configure handshake
    pub compositor: CompositorState,
    /// SHM pools and buffers
    pub shm: ShmHandler,
    /// Terminal output
    pub renderer: Renderer,
    /// Protocol trace output
    pub tracer: Tracer,
    /// Wire objects per surface
    pub objects: HashMap<SurfaceId, SurfaceObjects>,
    started: Instant,
}

impl ServerState {
    /// Create a new server state
    pub fn new(renderer: Renderer, tracer: Tracer) -> Self {
        Self {
            compositor: CompositorState::new(),
            shm: ShmHandler::new(),
            renderer,
            tracer,
            objects: HashMap::new(),
            started: Instant::now(),
        }
    }

    /// Server state rendering to stdout and tracing to stderr
    pub fn from_config(config: &Config) -> Self {
        let tracer = if config.trace {
            Tracer::stderr()
        } else {
            Tracer::disabled()
        };
        Self::new(Renderer::stdout(config.renderer), tracer)
    }

    /// Record a request received on `resource`
    pub fn trace_request<R: Resource>(&mut self, resource: &R, message: &str, args: &[WireArg<'_>]) {
        self.trace(Direction::Request, resource, message, args);
    }

    /// Record an event about to be sent on `resource`
    pub fn trace_event<R: Resource>(&mut self, resource: &R, message: &str, args: &[WireArg<'_>]) {
        self.trace(Direction::Event, resource, message, args);
    }

    /// Record a global being bound as `resource`
    ///
    /// wl_registry is served inside wayland-server, so the bind is reported
    /// on the new object together with the negotiated version.
    pub fn trace_bind<R: Resource>(&mut self, resource: &R) {
        if !self.tracer.is_enabled() {
            return;
        }

        let id = resource.id();
        self.tracer.record(&WireMessage {
            direction: Direction::Request,
            object_id: id.protocol_id(),
            interface: id.interface().name,
            message: "bind",
            signature: "u",
            types: &[],
            args: &[WireArg::Uint(resource.version())],
        });
    }

    fn trace<R: Resource>(
        &mut self,
        direction: Direction,
        resource: &R,
        message: &str,
        args: &[WireArg<'_>],
    ) {
        if !self.tracer.is_enabled() {
            return;
        }

        let id = resource.id();
        let interface = id.interface();
        let messages = match direction {
            Direction::Request => interface.requests,
            Direction::Event => interface.events,
        };
        let desc = messages.iter().find(|desc| desc.name == message);
        let signature = desc.map(signature_of).unwrap_or_default();
        let types = desc.map(new_id_types).unwrap_or_default();

        self.tracer.record(&WireMessage {
            direction,
            object_id: id.protocol_id(),
            interface: interface.name,
            message,
            signature: &signature,
            types: &types,
            args,
        });
    }

    /// Send xdg_toplevel.configure followed by xdg_surface.configure
    pub fn send_configure(&mut self, surface_id: SurfaceId, configure: Configure) {
        let (xdg_surface, toplevel) = match self.objects.get(&surface_id) {
            Some(SurfaceObjects {
                xdg_surface: Some(xdg_surface),
                toplevel: Some(toplevel),
                ..
            }) => (xdg_surface.clone(), toplevel.clone()),
            _ => {
                warn!("No toplevel objects for surface {:?}", surface_id);
                return;
            }
        };

        let (width, height) = configure.size;
        let states = encode_states(configure.states);
        self.trace_event(
            &toplevel,
            "configure",
            &[
                WireArg::Int(width),
                WireArg::Int(height),
                WireArg::Array(&states),
            ],
        );
        toplevel.configure(width, height, states);

        self.trace_event(&xdg_surface, "configure", &[WireArg::Uint(configure.serial)]);
        xdg_surface.configure(configure.serial);
        debug!(
            "Configure {} sent to surface {:?}",
            configure.serial, surface_id
        );
    }

    /// Render a committed buffer
    ///
    /// Buffers that cannot be imported are skipped without output.
    pub fn present(&mut self, surface_id: SurfaceId, buffer: BufferHandle) {
        match self.shm.begin_access(buffer) {
            Ok(access) => self.renderer.render(access.view()),
            Err(e) => debug!("Not rendering surface {:?}: {}", surface_id, e),
        }
    }

    /// Fire and drop the frame callbacks of a surface
    pub fn fire_frame_callbacks(&mut self, surface_id: SurfaceId) {
        let callbacks = self
            .objects
            .get_mut(&surface_id)
            .map(|objects| std::mem::take(&mut objects.frame_callbacks))
            .unwrap_or_default();

        let time = self.started.elapsed().as_millis() as u32;
        for callback in callbacks {
            self.trace_event(&callback, "done", &[WireArg::Uint(time)]);
            callback.done(time);
        }
    }
}

/// A reference to an existing object, for tracing
pub fn object<R: Resource>(resource: &R) -> WireArg<'static> {
    let id = resource.id();
    WireArg::Object(Some(ObjectRef {
        interface: id.interface().name,
        id: id.protocol_id(),
    }))
}

/// A nullable object reference, for tracing
pub fn object_or_null<R: Resource>(resource: Option<&R>) -> WireArg<'static> {
    resource.map_or(WireArg::Object(None), object)
}

/// A freshly created object, for tracing
pub fn new_id<R: Resource>(resource: &R) -> WireArg<'static> {
    WireArg::NewId(resource.id().protocol_id())
}

/// Encode toplevel states as the xdg_toplevel.configure state array
fn encode_states(states: ToplevelState) -> Vec<u8> {
    let mut wire = Vec::new();
    if states.contains(ToplevelState::MAXIMIZED) {
        wire.extend_from_slice(&u32::from(xdg_toplevel::State::Maximized).to_ne_bytes());
    }
    if states.contains(ToplevelState::FULLSCREEN) {
        wire.extend_from_slice(&u32::from(xdg_toplevel::State::Fullscreen).to_ne_bytes());
    }
    wire
}

/// Disconnect a client with wl_display.no_memory
fn post_no_memory(client: &Client, dh: &DisplayHandle, message: String) {
    client.kill(
        dh,
        ProtocolError {
            code: DISPLAY_NO_MEMORY,
            object_id: 1,
            object_interface: "wl_display".into(),
            message,
        },
    );
}

/// Advertise the compositor, shm and shell globals
pub fn register_globals(dh: &DisplayHandle) {
    dh.create_global::<ServerState, wl_compositor::WlCompositor, _>(4, ());
    dh.create_global::<ServerState, wl_shm::WlShm, _>(1, ());
    dh.create_global::<ServerState, xdg_wm_base::XdgWmBase, _>(1, ());

    info!("Registered Wayland globals: wl_compositor, wl_shm, xdg_wm_base");
}

impl WaylandServer {
    /// Create a new Wayland server
    pub fn new() -> anyhow::Result<Self> {
        info!("Creating Wayland display server");

        let display: Display<ServerState> = Display::new()?;

        let socket = ListeningSocket::bind_auto("wayland", 0..33)?;
        let socket_name = socket
            .socket_name()
            .and_then(|n| n.to_str().map(String::from))
            .unwrap_or_else(|| "wayland-0".to_string());

        info!("Wayland socket: {}", socket_name);

        Ok(Self {
            display,
            socket,
            socket_name,
        })
    }

    /// Get the socket name (for WAYLAND_DISPLAY)
    pub fn socket_name(&self) -> &str {
        &self.socket_name
    }

    /// Register all protocol globals
    pub fn register_globals(&mut self) {
        register_globals(&self.display.handle());
    }

    /// Serve clients until the event loop fails
    pub fn run(self, mut state: ServerState) -> anyhow::Result<()> {
        let mut event_loop: EventLoop<'static, ServerState> = EventLoop::try_new()?;
        self.insert_into_loop(event_loop.handle())?;

        info!("Waiting for clients");
        event_loop.run(None, &mut state, |_| {})?;
        Ok(())
    }

    /// Insert the Wayland event sources into a calloop event loop
    pub fn insert_into_loop(mut self, handle: LoopHandle<'static, ServerState>) -> anyhow::Result<()> {
        // Insert the listening socket
        handle.insert_source(
            Generic::new(
                self.socket.as_fd().try_clone_to_owned()?,
                Interest::READ,
                Mode::Level,
            ),
            {
                let socket = self.socket;
                let mut display_handle = self.display.handle();
                move |_, _, _state| {
                    if let Some(stream) = socket.accept()? {
                        debug!("New Wayland client connected");
                        if let Err(e) = display_handle.insert_client(stream, Arc::new(())) {
                            error!("Failed to insert client: {}", e);
                        }
                    }
                    Ok(PostAction::Continue)
                }
            },
        )?;

        // Insert the display's event source
        handle.insert_source(
            Generic::new(
                self.display.backend().poll_fd().try_clone_to_owned()?,
                Interest::READ,
                Mode::Level,
            ),
            {
                let mut display = self.display;
                move |_, _, state| {
                    display.dispatch_clients(state)?;
                    display.flush_clients()?;
                    Ok(PostAction::Continue)
                }
            },
        )?;

        Ok(())
    }
}
