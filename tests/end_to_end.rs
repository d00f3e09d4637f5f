//! Drives an in-process server with a real wayland-client connection

use std::io::{self, Write};
use std::os::unix::io::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use wayland_client::protocol::{
    wl_buffer, wl_callback, wl_compositor, wl_registry, wl_shm, wl_shm_pool, wl_surface,
};
use wayland_client::{delegate_noop, Connection, Dispatch, EventQueue, QueueHandle};
use wayland_protocols::xdg::shell::client::{
    xdg_positioner, xdg_surface, xdg_toplevel, xdg_wm_base,
};
use wayland_server::Display;

use waytty::renderer::{RenderStrategy, Renderer, GLYPH, RESET};
use waytty::server::{register_globals, ServerState};
use waytty::trace::Tracer;

#[derive(Clone, Default)]
struct Sink(Arc<Mutex<Vec<u8>>>);

impl Sink {
    fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A server thread serving a fixed set of client sockets
struct TestServer {
    frames: Sink,
    trace: Sink,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start(sockets: Vec<UnixStream>) -> Self {
        let frames = Sink::default();
        let trace = Sink::default();
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let (frames, trace, stop) = (frames.clone(), trace.clone(), stop.clone());
            thread::spawn(move || {
                let mut display: Display<ServerState> = Display::new().unwrap();
                let mut dh = display.handle();
                register_globals(&dh);
                for socket in sockets {
                    dh.insert_client(socket, Arc::new(())).unwrap();
                }

                let renderer = Renderer::new(RenderStrategy::Truecolor, Box::new(frames));
                let mut state = ServerState::new(renderer, Tracer::to_writer(Box::new(trace)));

                while !stop.load(Ordering::SeqCst) {
                    let _ = display.dispatch_clients(&mut state);
                    let _ = display.flush_clients();
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };

        Self {
            frames,
            trace,
            stop,
            thread: Some(thread),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[derive(Debug, PartialEq)]
enum Observed {
    Toplevel {
        width: i32,
        height: i32,
        states: Vec<u8>,
    },
    Surface(u32),
}

#[derive(Default)]
struct ClientState {
    compositor: Option<wl_compositor::WlCompositor>,
    shm: Option<wl_shm::WlShm>,
    wm_base: Option<xdg_wm_base::XdgWmBase>,
    formats: Vec<wl_shm::Format>,
    ping: Option<u32>,
    observed: Vec<Observed>,
    frames_done: u32,
}

impl ClientState {
    /// Serial of the most recent xdg_surface.configure
    fn last_serial(&self) -> u32 {
        self.observed
            .iter()
            .rev()
            .find_map(|o| match o {
                Observed::Surface(serial) => Some(*serial),
                _ => None,
            })
            .unwrap()
    }
}

impl Dispatch<wl_registry::WlRegistry, ()> for ClientState {
    fn event(
        state: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _data: &(),
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        if let wl_registry::Event::Global {
            name, interface, ..
        } = event
        {
            match interface.as_str() {
                "wl_compositor" => state.compositor = Some(registry.bind(name, 4, qh, ())),
                "wl_shm" => state.shm = Some(registry.bind(name, 1, qh, ())),
                "xdg_wm_base" => state.wm_base = Some(registry.bind(name, 1, qh, ())),
                _ => {}
            }
        }
    }
}

impl Dispatch<wl_shm::WlShm, ()> for ClientState {
    fn event(
        state: &mut Self,
        _proxy: &wl_shm::WlShm,
        event: wl_shm::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_shm::Event::Format {
            format: wayland_client::WEnum::Value(format),
        } = event
        {
            state.formats.push(format);
        }
    }
}

impl Dispatch<xdg_wm_base::XdgWmBase, ()> for ClientState {
    fn event(
        state: &mut Self,
        proxy: &xdg_wm_base::XdgWmBase,
        event: xdg_wm_base::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_wm_base::Event::Ping { serial } = event {
            state.ping = Some(serial);
            proxy.pong(serial);
        }
    }
}

impl Dispatch<xdg_surface::XdgSurface, ()> for ClientState {
    fn event(
        state: &mut Self,
        _proxy: &xdg_surface::XdgSurface,
        event: xdg_surface::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        // Acks are sent by the tests themselves
        if let xdg_surface::Event::Configure { serial } = event {
            state.observed.push(Observed::Surface(serial));
        }
    }
}

impl Dispatch<xdg_toplevel::XdgToplevel, ()> for ClientState {
    fn event(
        state: &mut Self,
        _proxy: &xdg_toplevel::XdgToplevel,
        event: xdg_toplevel::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_toplevel::Event::Configure {
            width,
            height,
            states,
        } = event
        {
            state.observed.push(Observed::Toplevel {
                width,
                height,
                states,
            });
        }
    }
}

impl Dispatch<wl_callback::WlCallback, ()> for ClientState {
    fn event(
        state: &mut Self,
        _proxy: &wl_callback::WlCallback,
        event: wl_callback::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_callback::Event::Done { .. } = event {
            state.frames_done += 1;
        }
    }
}

delegate_noop!(ClientState: wl_compositor::WlCompositor);
delegate_noop!(ClientState: wl_shm_pool::WlShmPool);
delegate_noop!(ClientState: xdg_positioner::XdgPositioner);
delegate_noop!(ClientState: ignore wl_surface::WlSurface);
delegate_noop!(ClientState: ignore wl_buffer::WlBuffer);

struct Harness {
    server: Arc<TestServer>,
    conn: Connection,
    queue: EventQueue<ClientState>,
    qh: QueueHandle<ClientState>,
    state: ClientState,
}

impl Harness {
    fn new() -> Self {
        let (server_socket, client_socket) = UnixStream::pair().unwrap();
        let server = Arc::new(TestServer::start(vec![server_socket]));
        Self::connect(server, client_socket)
    }

    /// Two clients of the same server, connected one after the other
    fn pair() -> (Self, Self) {
        let (server_first, client_first) = UnixStream::pair().unwrap();
        let (server_second, client_second) = UnixStream::pair().unwrap();
        let server = Arc::new(TestServer::start(vec![server_first, server_second]));
        let first = Self::connect(server.clone(), client_first);
        let second = Self::connect(server, client_second);
        (first, second)
    }

    fn connect(server: Arc<TestServer>, socket: UnixStream) -> Self {
        let conn = Connection::from_socket(socket).unwrap();

        let mut queue = conn.new_event_queue();
        let qh = queue.handle();
        conn.display().get_registry(&qh, ());

        let mut state = ClientState::default();
        queue.roundtrip(&mut state).unwrap();
        queue.roundtrip(&mut state).unwrap();

        Self {
            server,
            conn,
            queue,
            qh,
            state,
        }
    }

    fn roundtrip(&mut self) -> Result<usize, wayland_client::DispatchError> {
        self.queue.roundtrip(&mut self.state)
    }

    /// Surface, xdg_surface and toplevel, with the first configure received
    fn toplevel(
        &mut self,
    ) -> (
        wl_surface::WlSurface,
        xdg_surface::XdgSurface,
        xdg_toplevel::XdgToplevel,
    ) {
        let qh = &self.qh;
        let surface = self.state.compositor.as_ref().unwrap().create_surface(qh, ());
        let xdg_surface = self
            .state
            .wm_base
            .as_ref()
            .unwrap()
            .get_xdg_surface(&surface, qh, ());
        let toplevel = xdg_surface.get_toplevel(qh, ());
        self.roundtrip().unwrap();
        (surface, xdg_surface, toplevel)
    }

    /// An ARGB8888 wl_buffer filled with one BGRA colour
    ///
    /// The backing file is returned so it outlives the request.
    fn buffer(
        &self,
        width: usize,
        height: usize,
        stride: usize,
        bgra: [u8; 4],
    ) -> (wl_buffer::WlBuffer, std::fs::File) {
        self.buffer_in_format(width, height, stride, bgra, wl_shm::Format::Argb8888)
    }

    fn buffer_in_format(
        &self,
        width: usize,
        height: usize,
        stride: usize,
        bgra: [u8; 4],
        format: wl_shm::Format,
    ) -> (wl_buffer::WlBuffer, std::fs::File) {
        let mut file = tempfile::tempfile().unwrap();
        for _ in 0..height {
            let mut row = bgra.repeat(width);
            row.resize(stride, 0);
            file.write_all(&row).unwrap();
        }

        let size = (stride * height) as i32;
        let pool = self
            .state
            .shm
            .as_ref()
            .unwrap()
            .create_pool(file.as_fd(), size, &self.qh, ());
        let buffer = pool.create_buffer(
            0,
            width as i32,
            height as i32,
            stride as i32,
            format,
            &self.qh,
            (),
        );
        (buffer, file)
    }
}

#[test]
fn test_globals() {
    let harness = Harness::new();
    assert!(harness.state.compositor.is_some());
    assert!(harness.state.wm_base.is_some());
    assert_eq!(
        harness.state.formats,
        vec![wl_shm::Format::Argb8888, wl_shm::Format::Xrgb8888]
    );
    assert!(harness.state.ping.is_some());

    let trace = harness.server.trace.text();
    assert!(trace.contains("wl_compositor::bind(4u)"));
    assert!(trace.contains("wl_shm::bind(1u)"));
    assert!(trace.contains("wl_shm::format(0u)"));
    assert!(trace.contains("xdg_wm_base::bind(1u)"));
}

#[test]
fn test_serials_are_shared_between_clients() {
    let (mut first, mut second) = Harness::pair();
    let (first_ping, second_ping) = (first.state.ping.unwrap(), second.state.ping.unwrap());
    assert!(second_ping > first_ping);

    let _first_window = first.toplevel();
    let a = first.state.last_serial();
    let _second_window = second.toplevel();
    let b = second.state.last_serial();
    let _third_window = first.toplevel();
    let c = first.state.last_serial();

    assert!(a > second_ping);
    assert!(b > a);
    assert!(c > b);
    assert!(first.conn.protocol_error().is_none());
    assert!(second.conn.protocol_error().is_none());
}

#[test]
fn test_configure_ack_attach_commit() {
    let mut harness = Harness::new();
    let (surface, xdg_surface, _toplevel) = harness.toplevel();

    let serial = harness.state.last_serial();
    assert_eq!(
        harness.state.observed,
        vec![
            Observed::Toplevel {
                width: 0,
                height: 0,
                states: vec![],
            },
            Observed::Surface(serial),
        ]
    );
    assert!(serial > harness.state.ping.unwrap());

    xdg_surface.ack_configure(serial);
    let (buffer, _file) = harness.buffer(4, 2, 16, [0, 255, 0, 255]);
    surface.attach(Some(&buffer), 0, 0);
    surface.commit();
    harness.roundtrip().unwrap();

    let green = format!("\x1b[38;2;0;255;0m{}", GLYPH);
    let line = format!("{}{}\n", green.repeat(4), RESET);
    assert_eq!(harness.server.frames.text(), line.repeat(2));

    let trace = harness.server.trace.text();
    assert!(trace.contains(&format!("xdg_surface::ack_configure({}u)", serial)));
    assert!(trace.contains("💥"));
    assert!(trace.contains("xdg_toplevel::configure(0, 0, {})"));
    assert!(trace.contains("wl_surface::commit\n"));
}

#[test]
fn test_attach_after_ack_reconfigures() {
    let mut harness = Harness::new();
    let (surface, xdg_surface, _toplevel) = harness.toplevel();
    let first = harness.state.last_serial();
    xdg_surface.ack_configure(first);

    let (buffer, _file) = harness.buffer(1, 1, 4, [0, 0, 0, 255]);
    surface.attach(Some(&buffer), 0, 0);
    harness.roundtrip().unwrap();

    assert_eq!(harness.state.observed.len(), 4);
    assert!(harness.state.last_serial() > first);
}

#[test]
fn test_commit_without_attach_renders_nothing() {
    let mut harness = Harness::new();
    let (surface, xdg_surface, _toplevel) = harness.toplevel();
    xdg_surface.ack_configure(harness.state.last_serial());

    surface.commit();
    harness.roundtrip().unwrap();

    assert!(harness.server.frames.text().is_empty());
}

#[test]
fn test_repeated_commit_renders_again() {
    let mut harness = Harness::new();
    let (surface, xdg_surface, _toplevel) = harness.toplevel();
    xdg_surface.ack_configure(harness.state.last_serial());

    let (buffer, _file) = harness.buffer(1, 1, 4, [0, 0, 255, 255]);
    surface.attach(Some(&buffer), 0, 0);
    surface.commit();
    surface.commit();
    harness.roundtrip().unwrap();

    let red = format!("\x1b[38;2;255;0;0m{}{}\n", GLYPH, RESET);
    assert_eq!(harness.server.frames.text(), red.repeat(2));
}

#[test]
fn test_stale_ack_is_ignored() {
    let mut harness = Harness::new();
    let (surface, xdg_surface, _toplevel) = harness.toplevel();
    let serial = harness.state.last_serial();

    xdg_surface.ack_configure(serial + 100);
    harness.roundtrip().unwrap();
    assert!(harness.conn.protocol_error().is_none());

    xdg_surface.ack_configure(serial);
    let (buffer, _file) = harness.buffer(2, 1, 8, [255, 0, 0, 255]);
    surface.attach(Some(&buffer), 0, 0);
    surface.commit();
    harness.roundtrip().unwrap();

    assert_eq!(harness.server.frames.text().lines().count(), 1);
}

#[test]
fn test_second_shell_surface_is_a_role_error() {
    let mut harness = Harness::new();
    let (surface, _xdg_surface, _toplevel) = harness.toplevel();

    let wm_base = harness.state.wm_base.clone().unwrap();
    let _again = wm_base.get_xdg_surface(&surface, &harness.qh, ());
    assert!(harness.roundtrip().is_err());

    let error = harness.conn.protocol_error().unwrap();
    assert_eq!(error.code, u32::from(xdg_wm_base::Error::Role));
    assert_eq!(error.object_interface, "xdg_wm_base");
}

#[test]
fn test_second_toplevel_is_already_constructed() {
    let mut harness = Harness::new();
    let (_surface, xdg_surface, _toplevel) = harness.toplevel();

    let _again = xdg_surface.get_toplevel(&harness.qh, ());
    assert!(harness.roundtrip().is_err());

    let error = harness.conn.protocol_error().unwrap();
    assert_eq!(
        error.code,
        u32::from(xdg_surface::Error::AlreadyConstructed)
    );
    assert_eq!(error.object_interface, "xdg_surface");
}

#[test]
fn test_bad_stride_is_a_shm_error() {
    let mut harness = Harness::new();
    // 4 pixels need 16 bytes per row
    let (_buffer, _file) = harness.buffer(4, 2, 8, [0, 0, 0, 255]);
    assert!(harness.roundtrip().is_err());

    let error = harness.conn.protocol_error().unwrap();
    assert_eq!(error.code, u32::from(wl_shm::Error::InvalidStride));
}

#[test]
fn test_frame_callback_fires_on_commit() {
    let mut harness = Harness::new();
    let (surface, xdg_surface, _toplevel) = harness.toplevel();
    xdg_surface.ack_configure(harness.state.last_serial());

    surface.frame(&harness.qh, ());
    surface.commit();
    harness.roundtrip().unwrap();

    assert_eq!(harness.state.frames_done, 1);
}

#[test]
fn test_maximize_sends_configure() {
    let mut harness = Harness::new();
    let (_surface, xdg_surface, toplevel) = harness.toplevel();
    xdg_surface.ack_configure(harness.state.last_serial());

    toplevel.set_maximized();
    harness.roundtrip().unwrap();

    let maximized = u32::from(xdg_toplevel::State::Maximized).to_ne_bytes().to_vec();
    assert!(harness.state.observed.contains(&Observed::Toplevel {
        width: 0,
        height: 0,
        states: maximized,
    }));
}

#[test]
fn test_unsupported_format_renders_nothing() {
    let mut harness = Harness::new();
    let (surface, xdg_surface, _toplevel) = harness.toplevel();
    xdg_surface.ack_configure(harness.state.last_serial());

    let (buffer, _file) =
        harness.buffer_in_format(2, 2, 8, [0, 0, 255, 255], wl_shm::Format::Abgr8888);
    surface.attach(Some(&buffer), 0, 0);
    surface.commit();
    harness.roundtrip().unwrap();

    assert!(harness.conn.protocol_error().is_none());
    assert!(harness.server.frames.text().is_empty());
    let abgr = u32::from(wl_shm::Format::Abgr8888);
    assert!(harness.server.trace.text().contains(&format!(", {}u)", abgr)));
}

#[test]
fn test_xdg_surface_destroyed_before_toplevel() {
    let mut harness = Harness::new();
    let (_surface, xdg_surface, _toplevel) = harness.toplevel();

    xdg_surface.destroy();
    assert!(harness.roundtrip().is_err());

    let error = harness.conn.protocol_error().unwrap();
    assert_eq!(
        error.code,
        u32::from(xdg_surface::Error::DefunctRoleObject)
    );
    assert_eq!(error.object_interface, "xdg_surface");
}

#[test]
fn test_role_chain_can_be_rebuilt() {
    let mut harness = Harness::new();
    let (surface, xdg_surface, toplevel) = harness.toplevel();
    toplevel.destroy();
    xdg_surface.destroy();

    let wm_base = harness.state.wm_base.clone().unwrap();
    let xdg_surface = wm_base.get_xdg_surface(&surface, &harness.qh, ());
    let _toplevel = xdg_surface.get_toplevel(&harness.qh, ());
    harness.roundtrip().unwrap();
    assert!(harness.conn.protocol_error().is_none());
    assert_eq!(harness.state.observed.len(), 4);

    xdg_surface.ack_configure(harness.state.last_serial());
    let (buffer, _file) = harness.buffer(1, 1, 4, [0, 0, 255, 255]);
    surface.attach(Some(&buffer), 0, 0);
    surface.commit();
    harness.roundtrip().unwrap();

    let red = format!("\x1b[38;2;255;0;0m{}{}\n", GLYPH, RESET);
    assert_eq!(harness.server.frames.text(), red);
}

#[test]
fn test_positioner_is_refused() {
    let mut harness = Harness::new();
    let wm_base = harness.state.wm_base.clone().unwrap();
    let _positioner = wm_base.create_positioner(&harness.qh, ());
    assert!(harness.roundtrip().is_err());

    let error = harness.conn.protocol_error().unwrap();
    assert_eq!(
        error.code,
        u32::from(xdg_wm_base::Error::InvalidPositioner)
    );
    assert!(harness
        .server
        .trace
        .text()
        .contains("xdg_wm_base::create_positioner((xdg_positioner)#"));
}
