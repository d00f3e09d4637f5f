//! Simple Wayland shm client
//!
//! Connects to waytty, negotiates a toplevel and commits one small gradient
//! buffer, which the compositor draws into its terminal.
//! Run with: WAYLAND_DISPLAY=wayland-0 cargo run --example shm_client

use std::os::unix::io::AsFd;

use wayland_client::{
    protocol::{wl_buffer, wl_compositor, wl_registry, wl_shm, wl_shm_pool, wl_surface},
    Connection, Dispatch, EventQueue, QueueHandle,
};
use wayland_protocols::xdg::shell::client::{xdg_surface, xdg_toplevel, xdg_wm_base};

const WIDTH: i32 = 32;
const HEIGHT: i32 = 16;

fn main() -> anyhow::Result<()> {
    println!("Connecting to Wayland compositor...");
    let conn = Connection::connect_to_env()?;

    let mut event_queue: EventQueue<AppState> = conn.new_event_queue();
    let qh = event_queue.handle();

    let display = conn.display();
    display.get_registry(&qh, ());

    let mut state = AppState::default();

    // Roundtrip to get globals
    event_queue.roundtrip(&mut state)?;

    let (Some(compositor), Some(xdg_wm_base), Some(shm)) =
        (&state.compositor, &state.xdg_wm_base, &state.shm)
    else {
        anyhow::bail!("Compositor lacks wl_compositor, wl_shm or xdg_wm_base");
    };

    let surface = compositor.create_surface(&qh, ());
    let xdg_surface = xdg_wm_base.get_xdg_surface(&surface, &qh, ());
    let xdg_toplevel = xdg_surface.get_toplevel(&qh, ());
    xdg_toplevel.set_title("Gradient".to_string());
    xdg_toplevel.set_app_id("waytty.shm_client".to_string());

    // Build the gradient before waiting, the pool outlives the configure
    let stride = WIDTH * 4;
    let size = stride * HEIGHT;
    let file = tempfile::tempfile()?;
    file.set_len(size as u64)?;

    let mut mmap = unsafe { memmap2::MmapMut::map_mut(&file)? };
    for y in 0..HEIGHT {
        for x in 0..WIDTH {
            let offset = (y * stride + x * 4) as usize;
            mmap[offset] = (255 * y / (HEIGHT - 1)) as u8; // B
            mmap[offset + 1] = 0x40; // G
            mmap[offset + 2] = (255 * x / (WIDTH - 1)) as u8; // R
            mmap[offset + 3] = 0xFF; // A
        }
    }
    mmap.flush()?;

    let pool = shm.create_pool(file.as_fd(), size, &qh, ());
    let buffer = pool.create_buffer(0, WIDTH, HEIGHT, stride, wl_shm::Format::Xrgb8888, &qh, ());

    println!("Waiting for configure...");
    while !state.configured {
        event_queue.blocking_dispatch(&mut state)?;
    }

    surface.attach(Some(&buffer), 0, 0);
    surface.damage_buffer(0, 0, WIDTH, HEIGHT);
    surface.commit();
    event_queue.roundtrip(&mut state)?;

    println!("Buffer committed, waiting for close (Ctrl+C to exit)");
    while state.running {
        event_queue.blocking_dispatch(&mut state)?;
    }

    Ok(())
}

struct AppState {
    running: bool,
    compositor: Option<wl_compositor::WlCompositor>,
    shm: Option<wl_shm::WlShm>,
    xdg_wm_base: Option<xdg_wm_base::XdgWmBase>,
    configured: bool,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            running: true,
            compositor: None,
            shm: None,
            xdg_wm_base: None,
            configured: false,
        }
    }
}

// Registry handler
impl Dispatch<wl_registry::WlRegistry, ()> for AppState {
    fn event(
        state: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _data: &(),
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        if let wl_registry::Event::Global {
            name,
            interface,
            version,
        } = event
        {
            println!("  Global: {} v{}", interface, version);
            match interface.as_str() {
                "wl_compositor" => {
                    state.compositor = Some(registry.bind(name, version.min(4), qh, ()));
                }
                "wl_shm" => {
                    state.shm = Some(registry.bind(name, 1, qh, ()));
                }
                "xdg_wm_base" => {
                    state.xdg_wm_base = Some(registry.bind(name, 1, qh, ()));
                }
                _ => {}
            }
        }
    }
}

impl Dispatch<wl_compositor::WlCompositor, ()> for AppState {
    fn event(
        _state: &mut Self,
        _proxy: &wl_compositor::WlCompositor,
        _event: wl_compositor::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wl_surface::WlSurface, ()> for AppState {
    fn event(
        _state: &mut Self,
        _proxy: &wl_surface::WlSurface,
        _event: wl_surface::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wl_shm::WlShm, ()> for AppState {
    fn event(
        _state: &mut Self,
        _proxy: &wl_shm::WlShm,
        event: wl_shm::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_shm::Event::Format { format } = event {
            println!("  SHM format: {:?}", format);
        }
    }
}

impl Dispatch<wl_shm_pool::WlShmPool, ()> for AppState {
    fn event(
        _state: &mut Self,
        _proxy: &wl_shm_pool::WlShmPool,
        _event: wl_shm_pool::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wl_buffer::WlBuffer, ()> for AppState {
    fn event(
        _state: &mut Self,
        _proxy: &wl_buffer::WlBuffer,
        _event: wl_buffer::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<xdg_wm_base::XdgWmBase, ()> for AppState {
    fn event(
        _state: &mut Self,
        proxy: &xdg_wm_base::XdgWmBase,
        event: xdg_wm_base::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_wm_base::Event::Ping { serial } = event {
            proxy.pong(serial);
        }
    }
}

impl Dispatch<xdg_surface::XdgSurface, ()> for AppState {
    fn event(
        state: &mut Self,
        proxy: &xdg_surface::XdgSurface,
        event: xdg_surface::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_surface::Event::Configure { serial } = event {
            println!("XDG surface configured (serial {})", serial);
            proxy.ack_configure(serial);
            state.configured = true;
        }
    }
}

impl Dispatch<xdg_toplevel::XdgToplevel, ()> for AppState {
    fn event(
        state: &mut Self,
        _proxy: &xdg_toplevel::XdgToplevel,
        event: xdg_toplevel::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            xdg_toplevel::Event::Configure {
                width,
                height,
                states,
            } => {
                println!(
                    "Toplevel configure: {}x{}, states: {:?}",
                    width, height, states
                );
            }
            xdg_toplevel::Event::Close => {
                state.running = false;
            }
            _ => {}
        }
    }
}
