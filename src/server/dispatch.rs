//! Wayland protocol dispatch implementations
//!
//! Implements the Dispatch trait for the core wl_compositor and wl_shm
//! objects. Every request is traced before it is handled.

use std::os::unix::io::AsRawFd;

use log::{debug, warn};
use wayland_server::protocol::{
    wl_buffer, wl_callback, wl_compositor, wl_region, wl_shm, wl_shm_pool, wl_surface,
};
use wayland_server::{Client, DataInit, Dispatch, DisplayHandle, Resource, WEnum};

use super::{new_id, object_or_null, post_no_memory, ServerState};
use crate::compositor::{BufferHandle, SurfaceId};
use crate::protocol::shm::{ShmBufferId, ShmError, ShmPoolId};
use crate::trace::WireArg;

// ============================================================================
// wl_compositor
// ============================================================================

impl Dispatch<wl_compositor::WlCompositor, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &wl_compositor::WlCompositor,
        request: wl_compositor::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_compositor::Request::CreateSurface { id } => {
                let surface_id = state.compositor.create_surface();
                let surface = data_init.init(id, surface_id);
                state.trace_request(resource, "create_surface", &[new_id(&surface)]);
                debug!("Created wl_surface {:?}", surface_id);
            }
            wl_compositor::Request::CreateRegion { id } => {
                let region = data_init.init(id, ());
                state.trace_request(resource, "create_region", &[new_id(&region)]);
            }
            _ => {}
        }
    }
}

// ============================================================================
// wl_surface
// ============================================================================

/// The compositor's view of an attached wl_buffer
fn buffer_handle(buffer: &wl_buffer::WlBuffer) -> BufferHandle {
    match buffer.data::<Option<ShmBufferId>>() {
        Some(Some(id)) => BufferHandle::Shm(*id),
        _ => BufferHandle::Foreign(buffer.id().protocol_id()),
    }
}

impl Dispatch<wl_surface::WlSurface, SurfaceId> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &wl_surface::WlSurface,
        request: wl_surface::Request,
        surface_id: &SurfaceId,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        let surface_id = *surface_id;
        match request {
            wl_surface::Request::Attach { buffer, x, y } => {
                state.trace_request(
                    resource,
                    "attach",
                    &[
                        object_or_null(buffer.as_ref()),
                        WireArg::Int(x),
                        WireArg::Int(y),
                    ],
                );
                match state.compositor.attach(surface_id, buffer.as_ref().map(buffer_handle)) {
                    Ok(Some(configure)) => state.send_configure(surface_id, configure),
                    Ok(None) => {}
                    Err(e) => warn!("Attach to surface {:?}: {}", surface_id, e),
                }
            }
            wl_surface::Request::Damage {
                x,
                y,
                width,
                height,
            } => {
                state.trace_request(
                    resource,
                    "damage",
                    &[
                        WireArg::Int(x),
                        WireArg::Int(y),
                        WireArg::Int(width),
                        WireArg::Int(height),
                    ],
                );
            }
            wl_surface::Request::DamageBuffer {
                x,
                y,
                width,
                height,
            } => {
                state.trace_request(
                    resource,
                    "damage_buffer",
                    &[
                        WireArg::Int(x),
                        WireArg::Int(y),
                        WireArg::Int(width),
                        WireArg::Int(height),
                    ],
                );
            }
            wl_surface::Request::Frame { callback } => {
                let callback = data_init.init(callback, ());
                state.trace_request(resource, "frame", &[new_id(&callback)]);
                state
                    .objects
                    .entry(surface_id)
                    .or_default()
                    .frame_callbacks
                    .push(callback);
            }
            wl_surface::Request::SetOpaqueRegion { region } => {
                state.trace_request(resource, "set_opaque_region", &[object_or_null(region.as_ref())]);
            }
            wl_surface::Request::SetInputRegion { region } => {
                state.trace_request(resource, "set_input_region", &[object_or_null(region.as_ref())]);
            }
            wl_surface::Request::Commit => {
                state.trace_request(resource, "commit", &[]);
                // The buffer stays attached for later re-renders, so
                // wl_buffer.release is never sent

                match state.compositor.commit(surface_id) {
                    Some(buffer) => state.present(surface_id, buffer),
                    None => debug!("Surface {:?} committed without a buffer", surface_id),
                }
                state.fire_frame_callbacks(surface_id);
            }
            wl_surface::Request::SetBufferTransform { transform } => {
                let transform = match transform {
                    WEnum::Value(v) => u32::from(v) as i32,
                    WEnum::Unknown(v) => v as i32,
                };
                state.trace_request(resource, "set_buffer_transform", &[WireArg::Int(transform)]);
            }
            wl_surface::Request::SetBufferScale { scale } => {
                state.trace_request(resource, "set_buffer_scale", &[WireArg::Int(scale)]);
            }
            wl_surface::Request::Offset { x, y } => {
                state.trace_request(resource, "offset", &[WireArg::Int(x), WireArg::Int(y)]);
            }
            wl_surface::Request::Destroy => {
                state.trace_request(resource, "destroy", &[]);
            }
            _ => {}
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &wl_surface::WlSurface,
        data: &SurfaceId,
    ) {
        debug!("Surface {:?} destroyed", data);
        state.compositor.destroy_surface(*data);
        state.objects.remove(data);
    }
}

// ============================================================================
// wl_region
// ============================================================================

impl Dispatch<wl_region::WlRegion, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &wl_region::WlRegion,
        request: wl_region::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_region::Request::Add {
                x,
                y,
                width,
                height,
            } => {
                state.trace_request(
                    resource,
                    "add",
                    &[
                        WireArg::Int(x),
                        WireArg::Int(y),
                        WireArg::Int(width),
                        WireArg::Int(height),
                    ],
                );
            }
            wl_region::Request::Subtract {
                x,
                y,
                width,
                height,
            } => {
                state.trace_request(
                    resource,
                    "subtract",
                    &[
                        WireArg::Int(x),
                        WireArg::Int(y),
                        WireArg::Int(width),
                        WireArg::Int(height),
                    ],
                );
            }
            wl_region::Request::Destroy => {
                state.trace_request(resource, "destroy", &[]);
            }
            _ => {}
        }
    }
}

// ============================================================================
// wl_callback
// ============================================================================

impl Dispatch<wl_callback::WlCallback, ()> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &wl_callback::WlCallback,
        _request: wl_callback::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        // wl_callback has no requests
    }
}

// ============================================================================
// wl_shm
// ============================================================================

/// The wl_shm error a failed pool or buffer request is reported with
fn shm_error_code(error: &ShmError) -> wl_shm::Error {
    match error {
        ShmError::InvalidStride
        | ShmError::BufferTooLarge
        | ShmError::Shrink
        | ShmError::InvalidSize => wl_shm::Error::InvalidStride,
        ShmError::InvalidPool | ShmError::InvalidFd | ShmError::Map(_) => wl_shm::Error::InvalidFd,
    }
}

/// Report a failed shm request on `resource`
fn post_shm_error<R: Resource>(resource: &R, client: &Client, dh: &DisplayHandle, error: ShmError) {
    warn!("{}: {}", resource.id(), error);
    match error {
        ShmError::Map(ref e) if e.kind() == std::io::ErrorKind::OutOfMemory => {
            post_no_memory(client, dh, error.to_string());
        }
        _ => resource.post_error(shm_error_code(&error), error.to_string()),
    }
}

impl Dispatch<wl_shm::WlShm, ()> for ServerState {
    fn request(
        state: &mut Self,
        client: &Client,
        resource: &wl_shm::WlShm,
        request: wl_shm::Request,
        _data: &(),
        dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_shm::Request::CreatePool { id, fd, size } => {
                let raw_fd = fd.as_raw_fd();
                let result = state.shm.create_pool(fd, size);
                let pool = data_init.init(id, result.as_ref().ok().copied());
                state.trace_request(
                    resource,
                    "create_pool",
                    &[new_id(&pool), WireArg::Fd(raw_fd), WireArg::Int(size)],
                );
                if let Err(e) = result {
                    post_shm_error(resource, client, dhandle, e);
                }
            }
            _ => {}
        }
    }
}

// ============================================================================
// wl_shm_pool
// ============================================================================

impl Dispatch<wl_shm_pool::WlShmPool, Option<ShmPoolId>> for ServerState {
    fn request(
        state: &mut Self,
        client: &Client,
        resource: &wl_shm_pool::WlShmPool,
        request: wl_shm_pool::Request,
        pool_id: &Option<ShmPoolId>,
        dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_shm_pool::Request::CreateBuffer {
                id,
                offset,
                width,
                height,
                stride,
                format,
            } => {
                let format = match format {
                    WEnum::Value(f) => u32::from(f),
                    WEnum::Unknown(v) => v,
                };
                let result = match pool_id {
                    Some(pool_id) => state
                        .shm
                        .create_buffer(*pool_id, offset, width, height, stride, format),
                    None => Err(ShmError::InvalidPool),
                };
                let buffer = data_init.init(id, result.as_ref().ok().copied());
                state.trace_request(
                    resource,
                    "create_buffer",
                    &[
                        new_id(&buffer),
                        WireArg::Int(offset),
                        WireArg::Int(width),
                        WireArg::Int(height),
                        WireArg::Int(stride),
                        WireArg::Uint(format),
                    ],
                );
                if let Err(e) = result {
                    post_shm_error(resource, client, dhandle, e);
                }
            }
            wl_shm_pool::Request::Resize { size } => {
                state.trace_request(resource, "resize", &[WireArg::Int(size)]);
                let result = match pool_id {
                    Some(pool_id) => state.shm.resize_pool(*pool_id, size),
                    None => Err(ShmError::InvalidPool),
                };
                if let Err(e) = result {
                    post_shm_error(resource, client, dhandle, e);
                }
            }
            wl_shm_pool::Request::Destroy => {
                state.trace_request(resource, "destroy", &[]);
            }
            _ => {}
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &wl_shm_pool::WlShmPool,
        pool_id: &Option<ShmPoolId>,
    ) {
        if let Some(pool_id) = pool_id {
            state.shm.destroy_pool(*pool_id);
        }
    }
}

// ============================================================================
// wl_buffer
// ============================================================================

impl Dispatch<wl_buffer::WlBuffer, Option<ShmBufferId>> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &wl_buffer::WlBuffer,
        request: wl_buffer::Request,
        _buffer_id: &Option<ShmBufferId>,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        if let wl_buffer::Request::Destroy = request {
            state.trace_request(resource, "destroy", &[]);
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &wl_buffer::WlBuffer,
        buffer_id: &Option<ShmBufferId>,
    ) {
        if let Some(buffer_id) = buffer_id {
            state.shm.destroy_buffer(*buffer_id);
        }
    }
}
