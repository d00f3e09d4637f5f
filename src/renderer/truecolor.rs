//! Direct 24-bit colour rendering
//!
//! Every source pixel becomes one double-wide block glyph coloured with an
//! SGR truecolor escape. One output line per pixel row, no resampling.

use std::fmt::Write as _;
use std::io::{self, Write};

use super::FrameEncoder;
use crate::protocol::PixelView;

/// Two full blocks: roughly square in most terminal fonts
pub const GLYPH: &str = "\u{2588}\u{2588}";

/// SGR reset, written at the end of each row
pub const RESET: &str = "\x1b[0m";

/// Renders one glyph per pixel with truecolor escapes
#[derive(Debug, Clone, Copy, Default)]
pub struct TruecolorEncoder;

impl TruecolorEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl FrameEncoder for TruecolorEncoder {
    fn encode(&self, frame: &PixelView<'_>, out: &mut dyn Write) -> io::Result<()> {
        // Roughly 20 bytes of escape plus the glyph per pixel
        let mut text =
            String::with_capacity(frame.width() as usize * frame.height() as usize * 26);

        for row in frame.rows() {
            for [r, g, b, _] in row {
                // Writing into a String cannot fail
                let _ = write!(text, "\x1b[38;2;{};{};{}m{}", r, g, b, GLYPH);
            }
            text.push_str(RESET);
            text.push('\n');
        }

        out.write_all(text.as_bytes())
    }
}
