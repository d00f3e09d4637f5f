//! wl_shm protocol implementation
//!
//! Implements shared memory pools and buffers, and the scoped pixel access
//! used when a surface commit is rendered.

use std::cell::Cell;
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::io::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, trace};
use memmap2::{Mmap, MmapOptions};

use crate::compositor::BufferHandle;

/// Unique identifier for shm pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShmPoolId(pub u64);

impl ShmPoolId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ShmPoolId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Unique identifier for shm buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShmBufferId(pub u64);

impl ShmBufferId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ShmBufferId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Pixel formats of shm buffers
///
/// The two supported formats are stored as little-endian 32-bit words, so
/// the bytes of a pixel are blue, green, red, alpha. XRGB just ignores the
/// alpha byte. Any other code is kept as `Other` and never rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmFormat {
    /// 32-bit ARGB (A in high byte)
    Argb8888,
    /// 32-bit XRGB (X in high byte, alpha ignored)
    Xrgb8888,
    /// A format code this compositor cannot import
    Other(u32),
}

impl ShmFormat {
    /// Create from Wayland format value
    pub fn from_wayland(format: u32) -> Self {
        match format {
            0 => ShmFormat::Argb8888,
            1 => ShmFormat::Xrgb8888,
            other => ShmFormat::Other(other),
        }
    }

    /// Convert to Wayland format value
    pub fn to_wayland(&self) -> u32 {
        match self {
            ShmFormat::Argb8888 => 0,
            ShmFormat::Xrgb8888 => 1,
            ShmFormat::Other(code) => *code,
        }
    }

    /// Whether buffers of this format can be rendered
    pub fn is_supported(&self) -> bool {
        !matches!(self, ShmFormat::Other(_))
    }

    /// Get bytes per pixel
    pub fn bytes_per_pixel(&self) -> u32 {
        4
    }

    /// Decode one pixel into `[r, g, b, a]`
    pub fn rgba(&self, px: &[u8]) -> [u8; 4] {
        let alpha = match self {
            ShmFormat::Xrgb8888 => 0xFF,
            _ => px[3],
        };
        [px[2], px[1], px[0], alpha]
    }
}

/// A read-only view over the pixels of one buffer
///
/// Rows are `stride` bytes apart; only the first `width * 4` bytes of each
/// row are pixels.
#[derive(Debug, Clone, Copy)]
pub struct PixelView<'a> {
    width: u32,
    height: u32,
    stride: u32,
    format: ShmFormat,
    data: &'a [u8],
}

impl<'a> PixelView<'a> {
    /// Wrap a byte span, checking that it holds `height` rows of `width`
    /// pixels
    pub fn new(
        width: u32,
        height: u32,
        stride: u32,
        format: ShmFormat,
        data: &'a [u8],
    ) -> Result<Self, ImportError> {
        if !format.is_supported() {
            return Err(ImportError::UnsupportedFormat(format.to_wayland()));
        }
        let row = width as usize * format.bytes_per_pixel() as usize;
        if (stride as usize) < row {
            return Err(ImportError::OutOfBounds);
        }
        let needed = match height as usize {
            0 => 0,
            h => (h - 1) * stride as usize + row,
        };
        if data.len() < needed {
            return Err(ImportError::OutOfBounds);
        }
        Ok(Self {
            width,
            height,
            stride,
            format,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn format(&self) -> ShmFormat {
        self.format
    }

    /// The pixel bytes of row `y`, without stride padding
    pub fn row(&self, y: u32) -> &'a [u8] {
        let start = y as usize * self.stride as usize;
        let len = self.width as usize * self.format.bytes_per_pixel() as usize;
        &self.data[start..start + len]
    }

    /// Iterate over the rows as `[r, g, b, a]` pixels
    pub fn rows(&self) -> impl Iterator<Item = impl Iterator<Item = [u8; 4]> + 'a> + 'a {
        let view = *self;
        (0..view.height).map(move |y| {
            let format = view.format;
            view.row(y).chunks_exact(4).map(move |px| format.rgba(px))
        })
    }
}

/// A shared memory pool
#[derive(Debug)]
pub struct ShmPool {
    /// Unique identifier
    pub id: ShmPoolId,
    /// Backing file for the shared memory
    file: File,
    /// Size of the pool in bytes
    pub size: usize,
    /// Read-only mapping of the whole pool
    map: Mmap,
    /// Buffers still referencing this pool
    buffers: usize,
    /// The client destroyed the pool object
    orphaned: bool,
}

impl ShmPool {
    /// Map a client fd
    pub fn new(fd: OwnedFd, size: usize) -> Result<Self, ShmError> {
        let file = File::from(fd);
        let map = map_file(&file, size)?;
        Ok(Self {
            id: ShmPoolId::new(),
            file,
            size,
            map,
            buffers: 0,
            orphaned: false,
        })
    }

    /// Grow the pool and remap it
    pub fn resize(&mut self, new_size: usize) -> Result<(), ShmError> {
        if new_size < self.size {
            return Err(ShmError::Shrink);
        }
        self.map = map_file(&self.file, new_size)?;
        self.size = new_size;
        Ok(())
    }
}

fn map_file(file: &File, size: usize) -> Result<Mmap, ShmError> {
    if size == 0 {
        return Err(ShmError::InvalidSize);
    }

    // Mapping past the end of the file would fault on access
    let stat = rustix::fs::fstat(file).map_err(|e| ShmError::Map(e.into()))?;
    if (stat.st_size as u64) < size as u64 {
        return Err(ShmError::InvalidFd);
    }

    // SAFETY: the mapping is read-only and only handed out as a borrowed
    // slice inside a `BufferAccess` scope. The client can still rewrite the
    // memory underneath, which only ever yields garbage pixels.
    unsafe { MmapOptions::new().len(size).map(file) }.map_err(ShmError::Map)
}

/// A buffer created from an shm pool
#[derive(Debug)]
pub struct ShmBuffer {
    /// Unique identifier
    pub id: ShmBufferId,
    /// Parent pool
    pub pool_id: ShmPoolId,
    /// Offset into the pool
    pub offset: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Stride (bytes per row)
    pub stride: u32,
    /// Pixel format
    pub format: ShmFormat,
    /// Set while a `BufferAccess` is alive
    accessed: Cell<bool>,
}

impl ShmBuffer {
    /// Create a new buffer
    pub fn new(
        pool_id: ShmPoolId,
        offset: u32,
        width: u32,
        height: u32,
        stride: u32,
        format: ShmFormat,
    ) -> Self {
        Self {
            id: ShmBufferId::new(),
            pool_id,
            offset,
            width,
            height,
            stride,
            format,
            accessed: Cell::new(false),
        }
    }

    /// Get the size of the buffer data in bytes
    pub fn data_size(&self) -> usize {
        self.stride as usize * self.height as usize
    }
}

/// Scoped access to a buffer's pixels
///
/// Created by [`ShmHandler::begin_access`]; access ends when the guard is
/// dropped. The view must not outlive the guard because the client may
/// start drawing the next frame into the same memory.
#[derive(Debug)]
pub struct BufferAccess<'a> {
    buffer: &'a ShmBuffer,
    view: PixelView<'a>,
}

impl<'a> BufferAccess<'a> {
    /// The pixels of the buffer
    pub fn view(&self) -> &PixelView<'a> {
        &self.view
    }
}

impl Drop for BufferAccess<'_> {
    fn drop(&mut self) {
        self.buffer.accessed.set(false);
        trace!("End access to shm buffer {:?}", self.buffer.id);
    }
}

/// Handler for wl_shm protocol
#[derive(Debug, Default)]
pub struct ShmHandler {
    pools: HashMap<ShmPoolId, ShmPool>,
    buffers: HashMap<ShmBufferId, ShmBuffer>,
}

impl ShmHandler {
    /// Create a new shm handler
    pub fn new() -> Self {
        Self::default()
    }

    /// Get supported formats
    pub fn formats(&self) -> Vec<ShmFormat> {
        vec![ShmFormat::Argb8888, ShmFormat::Xrgb8888]
    }

    /// Create a new shm pool
    pub fn create_pool(&mut self, fd: OwnedFd, size: i32) -> Result<ShmPoolId, ShmError> {
        let size = usize::try_from(size).map_err(|_| ShmError::InvalidSize)?;
        let pool = ShmPool::new(fd, size)?;
        let id = pool.id;
        self.pools.insert(id, pool);
        debug!("Created shm pool {:?}, size {}", id, size);
        Ok(id)
    }

    /// Resize a pool
    pub fn resize_pool(&mut self, pool_id: ShmPoolId, new_size: i32) -> Result<(), ShmError> {
        let new_size = usize::try_from(new_size).map_err(|_| ShmError::InvalidSize)?;
        let pool = self.pools.get_mut(&pool_id).ok_or(ShmError::InvalidPool)?;
        pool.resize(new_size)?;
        debug!("Resized shm pool {:?} to {}", pool_id, new_size);
        Ok(())
    }

    /// Destroy a pool
    ///
    /// The mapping stays alive until the last buffer created from it is
    /// destroyed.
    pub fn destroy_pool(&mut self, pool_id: ShmPoolId) {
        let Some(pool) = self.pools.get_mut(&pool_id) else {
            return;
        };
        if pool.buffers == 0 {
            self.pools.remove(&pool_id);
            debug!("Destroyed shm pool {:?}", pool_id);
        } else {
            pool.orphaned = true;
            debug!(
                "Shm pool {:?} orphaned, {} buffers left",
                pool_id, pool.buffers
            );
        }
    }

    /// Create a buffer from a pool
    pub fn create_buffer(
        &mut self,
        pool_id: ShmPoolId,
        offset: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: u32,
    ) -> Result<ShmBufferId, ShmError> {
        let pool = self.pools.get_mut(&pool_id).ok_or(ShmError::InvalidPool)?;

        // Unknown formats are accepted here and skipped at commit
        let format = ShmFormat::from_wayland(format);

        if offset < 0 || width <= 0 || height <= 0 || stride <= 0 {
            return Err(ShmError::InvalidStride);
        }
        let (offset, width, height, stride) =
            (offset as u32, width as u32, height as u32, stride as u32);

        // Validate stride
        let min_stride = width as u64 * format.bytes_per_pixel() as u64;
        if (stride as u64) < min_stride {
            return Err(ShmError::InvalidStride);
        }

        // Validate buffer fits in pool
        let buffer_end = offset as u64 + stride as u64 * height as u64;
        if buffer_end > pool.size as u64 {
            return Err(ShmError::BufferTooLarge);
        }

        let buffer = ShmBuffer::new(pool_id, offset, width, height, stride, format);
        let id = buffer.id;
        pool.buffers += 1;
        self.buffers.insert(id, buffer);

        debug!(
            "Created shm buffer {:?}, {}x{}, format {:?}",
            id, width, height, format
        );

        Ok(id)
    }

    /// Destroy a buffer
    pub fn destroy_buffer(&mut self, buffer_id: ShmBufferId) {
        let Some(buffer) = self.buffers.remove(&buffer_id) else {
            return;
        };
        debug!("Destroyed shm buffer {:?}", buffer_id);

        if let Some(pool) = self.pools.get_mut(&buffer.pool_id) {
            pool.buffers -= 1;
            if pool.orphaned && pool.buffers == 0 {
                self.pools.remove(&buffer.pool_id);
                debug!("Destroyed shm pool {:?}", buffer.pool_id);
            }
        }
    }

    /// Get a buffer by ID
    pub fn get_buffer(&self, id: ShmBufferId) -> Option<&ShmBuffer> {
        self.buffers.get(&id)
    }

    /// Get a pool by ID
    pub fn get_pool(&self, id: ShmPoolId) -> Option<&ShmPool> {
        self.pools.get(&id)
    }

    /// Start reading a buffer's pixels
    ///
    /// Fails for anything that is not a live shm buffer in a supported
    /// format, for a buffer that is already being read and for a buffer
    /// whose backing file no longer covers it.
    pub fn begin_access(&self, handle: BufferHandle) -> Result<BufferAccess<'_>, ImportError> {
        let id = match handle {
            BufferHandle::Shm(id) => id,
            BufferHandle::Foreign(_) => return Err(ImportError::NotShm),
        };
        let buffer = self.buffers.get(&id).ok_or(ImportError::UnknownBuffer)?;
        let pool = self
            .pools
            .get(&buffer.pool_id)
            .ok_or(ImportError::UnknownBuffer)?;

        if !buffer.format.is_supported() {
            return Err(ImportError::UnsupportedFormat(buffer.format.to_wayland()));
        }
        if buffer.accessed.get() {
            return Err(ImportError::AlreadyAccessed);
        }

        let start = buffer.offset as usize;
        let end = start + buffer.data_size();

        // The client may have truncated the file since the pool was mapped,
        // and reading mapped pages past its end raises SIGBUS
        let file_size = rustix::fs::fstat(&pool.file)
            .map(|stat| stat.st_size as u64)
            .unwrap_or(0);
        if file_size < end as u64 {
            return Err(ImportError::Truncated);
        }

        let data = pool.map.get(start..end).ok_or(ImportError::OutOfBounds)?;
        let view = PixelView::new(
            buffer.width,
            buffer.height,
            buffer.stride,
            buffer.format,
            data,
        )?;

        buffer.accessed.set(true);
        trace!("Begin access to shm buffer {:?}", id);
        Ok(BufferAccess { buffer, view })
    }
}

/// SHM errors
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("Invalid pool")]
    InvalidPool,
    #[error("Invalid pool size")]
    InvalidSize,
    #[error("Pool fd is smaller than the requested size")]
    InvalidFd,
    #[error("Pools can only grow")]
    Shrink,
    #[error("Buffer too large for pool")]
    BufferTooLarge,
    #[error("Invalid stride")]
    InvalidStride,
    #[error("Failed to map pool: {0}")]
    Map(#[source] io::Error),
}

/// Reasons a committed buffer is not rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ImportError {
    #[error("Buffer is not an shm buffer")]
    NotShm,
    #[error("Buffer no longer exists")]
    UnknownBuffer,
    #[error("Buffer is already being accessed")]
    AlreadyAccessed,
    #[error("Buffer exceeds its pool")]
    OutOfBounds,
    #[error("Unsupported format {0:#x}")]
    UnsupportedFormat(u32),
    #[error("Pool file was truncated below the buffer")]
    Truncated,
}
