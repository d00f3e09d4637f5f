//! Rendering module
//!
//! This module turns committed buffers into terminal output. Two strategies
//! exist, picked once at startup:
//! - Truecolor: one coloured glyph per pixel, no scaling
//! - Sixel: the frame resampled to the terminal and sent as a sixel image

pub mod sixel;
pub mod truecolor;

use std::io::{self, Write};

use log::{debug, error};

use crate::protocol::PixelView;

pub use sixel::{CellGeometry, SixelEncoder, TerminalGrid};
pub use truecolor::{TruecolorEncoder, GLYPH, RESET};

/// Turns one frame into terminal bytes
pub trait FrameEncoder: Send {
    fn encode(&self, frame: &PixelView<'_>, out: &mut dyn Write) -> io::Result<()>;
}

/// Which encoder the renderer uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderStrategy {
    #[default]
    Truecolor,
    Sixel,
}

impl RenderStrategy {
    /// Build the encoder for this strategy
    pub fn encoder(self) -> Box<dyn FrameEncoder> {
        match self {
            RenderStrategy::Truecolor => Box::new(TruecolorEncoder::new()),
            RenderStrategy::Sixel => Box::new(SixelEncoder::new(CellGeometry::DEFAULT)),
        }
    }
}

/// Synchronous frame writer
///
/// Each frame is fully written and flushed before `render` returns.
pub struct Renderer {
    encoder: Box<dyn FrameEncoder>,
    out: Box<dyn Write + Send>,
    frames: u64,
}

impl Renderer {
    /// Create a renderer writing to `out`
    pub fn new(strategy: RenderStrategy, out: Box<dyn Write + Send>) -> Self {
        Self::with_encoder(strategy.encoder(), out)
    }

    /// Create a renderer writing to stdout
    pub fn stdout(strategy: RenderStrategy) -> Self {
        Self::new(strategy, Box::new(io::stdout()))
    }

    /// Create a renderer from an encoder
    pub fn with_encoder(encoder: Box<dyn FrameEncoder>, out: Box<dyn Write + Send>) -> Self {
        Self {
            encoder,
            out,
            frames: 0,
        }
    }

    /// Number of frames written so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Write a frame
    ///
    /// A terminal that cannot be written to is fatal: the process exits.
    pub fn render(&mut self, frame: &PixelView<'_>) {
        if let Err(e) = self.try_render(frame) {
            error!("Failed to write frame to terminal: {}", e);
            std::process::exit(1);
        }
    }

    fn try_render(&mut self, frame: &PixelView<'_>) -> io::Result<()> {
        self.encoder.encode(frame, &mut self.out)?;
        self.out.flush()?;
        self.frames += 1;
        debug!(
            "Rendered frame {} ({}x{})",
            self.frames,
            frame.width(),
            frame.height()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::protocol::ShmFormat;

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_renderer_counts_frames() {
        let sink = Sink::default();
        let mut renderer = Renderer::new(RenderStrategy::Truecolor, Box::new(sink.clone()));
        let data = [0, 0, 0, 255];
        let view = PixelView::new(1, 1, 4, ShmFormat::Argb8888, &data).unwrap();

        renderer.render(&view);
        renderer.render(&view);

        assert_eq!(renderer.frames(), 2);
        let text = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_default_strategy() {
        assert_eq!(RenderStrategy::default(), RenderStrategy::Truecolor);
    }
}
