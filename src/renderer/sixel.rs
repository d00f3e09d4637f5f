//! Sixel rendering scaled to the terminal
//!
//! The frame is resampled to fill the terminal's character grid (assuming a
//! fixed cell size in pixels), dithered onto a 6x6x6 colour cube and sent as
//! a single sixel DCS sequence.

use std::io::{self, Write};

use image::imageops::{self, ColorMap, FilterType};
use image::{GrayImage, Rgb, RgbImage};
use log::trace;

use super::FrameEncoder;
use crate::protocol::PixelView;

/// Size of one terminal character cell in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellGeometry {
    pub width: u32,
    pub height: u32,
}

impl CellGeometry {
    pub const DEFAULT: Self = Self {
        width: 10,
        height: 20,
    };
}

impl Default for CellGeometry {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Terminal size in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalGrid {
    pub columns: u16,
    pub rows: u16,
}

impl TerminalGrid {
    /// Used when stdout is not a terminal
    pub const FALLBACK: Self = Self {
        columns: 80,
        rows: 24,
    };

    /// Query the size of the terminal on stdout
    pub fn detect() -> Self {
        match rustix::termios::tcgetwinsize(io::stdout()) {
            Ok(size) if size.ws_col > 0 && size.ws_row > 0 => Self {
                columns: size.ws_col,
                rows: size.ws_row,
            },
            _ => Self::FALLBACK,
        }
    }

    /// Pixel area a frame may cover
    ///
    /// The last row is left free for the newline that follows the image.
    pub fn pixel_area(&self, cell: CellGeometry) -> (u32, u32) {
        let rows = (self.rows as u32).saturating_sub(1).max(1);
        (self.columns as u32 * cell.width, rows * cell.height)
    }
}

/// Scale `source` to the largest size fitting in `area`, keeping its aspect
pub fn fit(source: (u32, u32), area: (u32, u32)) -> (u32, u32) {
    let (width, height) = source;
    if width == 0 || height == 0 {
        return (0, 0);
    }
    let scale = f64::min(
        area.0 as f64 / width as f64,
        area.1 as f64 / height as f64,
    );
    (
        ((width as f64 * scale).round() as u32).max(1),
        ((height as f64 * scale).round() as u32).max(1),
    )
}

/// The 216-colour cube used as the sixel palette
#[derive(Debug, Clone, Copy, Default)]
pub struct ColorCube;

impl ColorCube {
    pub const SIZE: usize = 216;

    fn level(channel: u8) -> usize {
        (channel as usize * 5 + 127) / 255
    }

    /// RGB value of a palette entry
    pub fn color(index: usize) -> [u8; 3] {
        let scale = |level: usize| (level * 51) as u8;
        [scale(index / 36), scale(index / 6 % 6), scale(index % 6)]
    }
}

impl ColorMap for ColorCube {
    type Color = Rgb<u8>;

    fn index_of(&self, color: &Rgb<u8>) -> usize {
        let [r, g, b] = color.0;
        Self::level(r) * 36 + Self::level(g) * 6 + Self::level(b)
    }

    fn lookup(&self, index: usize) -> Option<Rgb<u8>> {
        (index < Self::SIZE).then(|| Rgb(Self::color(index)))
    }

    fn has_lookup(&self) -> bool {
        true
    }

    fn map_color(&self, color: &mut Rgb<u8>) {
        color.0 = Self::color(self.index_of(color));
    }
}

/// Renders frames as sixel images fitted to the terminal
#[derive(Debug, Clone, Copy)]
pub struct SixelEncoder {
    cell: CellGeometry,
    /// Fixed grid; queried from the terminal for every frame when unset
    grid: Option<TerminalGrid>,
}

impl SixelEncoder {
    /// Encoder following the size of the terminal on stdout
    pub fn new(cell: CellGeometry) -> Self {
        Self { cell, grid: None }
    }

    /// Encoder for a terminal of known size
    pub fn with_grid(cell: CellGeometry, grid: TerminalGrid) -> Self {
        Self {
            cell,
            grid: Some(grid),
        }
    }

    fn target_size(&self, frame: &PixelView<'_>) -> (u32, u32) {
        let grid = self.grid.unwrap_or_else(TerminalGrid::detect);
        fit(
            (frame.width(), frame.height()),
            grid.pixel_area(self.cell),
        )
    }
}

impl FrameEncoder for SixelEncoder {
    fn encode(&self, frame: &PixelView<'_>, out: &mut dyn Write) -> io::Result<()> {
        let (width, height) = self.target_size(frame);
        if width == 0 || height == 0 {
            return Ok(());
        }

        let mut image = to_rgb(frame);
        if (width, height) != image.dimensions() {
            trace!(
                "Scaling {}x{} frame to {}x{}",
                frame.width(),
                frame.height(),
                width,
                height
            );
            image = imageops::resize(&image, width, height, FilterType::Triangle);
        }

        let cube = ColorCube;
        imageops::dither(&mut image, &cube);
        let indexed = imageops::index_colors(&image, &cube);

        let mut blob = Vec::new();
        write_sixel(&indexed, &mut blob)?;
        blob.push(b'\n');
        out.write_all(&blob)
    }
}

/// Copy the frame into an RGB image, blending alpha over black
fn to_rgb(frame: &PixelView<'_>) -> RgbImage {
    let mut image = RgbImage::new(frame.width(), frame.height());
    for (y, row) in frame.rows().enumerate() {
        for (x, [r, g, b, a]) in row.enumerate() {
            let blend = |c: u8| (c as u16 * a as u16 / 255) as u8;
            image.put_pixel(x as u32, y as u32, Rgb([blend(r), blend(g), blend(b)]));
        }
    }
    image
}

/// Serialize an indexed image as one sixel sequence
fn write_sixel(indexed: &GrayImage, out: &mut Vec<u8>) -> io::Result<()> {
    let (width, height) = indexed.dimensions();

    write!(out, "\x1bPq\"1;1;{};{}", width, height)?;

    let mut used = [false; ColorCube::SIZE];
    for pixel in indexed.pixels() {
        used[pixel.0[0] as usize] = true;
    }
    for (index, _) in used.iter().enumerate().filter(|(_, used)| **used) {
        let percent = ColorCube::color(index).map(|c| c as u32 * 100 / 255);
        write!(
            out,
            "#{};2;{};{};{}",
            index, percent[0], percent[1], percent[2]
        )?;
    }

    for top in (0..height).step_by(6) {
        let band = (height - top).min(6);

        let mut colors = Vec::new();
        for y in top..top + band {
            for x in 0..width {
                let index = indexed.get_pixel(x, y).0[0];
                if !colors.contains(&index) {
                    colors.push(index);
                }
            }
        }
        colors.sort_unstable();

        for (n, &color) in colors.iter().enumerate() {
            if n > 0 {
                out.push(b'$');
            }
            write!(out, "#{}", color)?;

            let mut run = Run::default();
            for x in 0..width {
                let mut bits = 0u8;
                for k in 0..band {
                    if indexed.get_pixel(x, top + k).0[0] == color {
                        bits |= 1 << k;
                    }
                }
                run.push(0x3F + bits, out)?;
            }
            run.flush(out)?;
        }
        out.push(b'-');
    }

    out.extend_from_slice(b"\x1b\\");
    Ok(())
}

/// Run-length state for one sixel row
#[derive(Default)]
struct Run {
    sixel: u8,
    count: usize,
}

impl Run {
    fn push(&mut self, sixel: u8, out: &mut Vec<u8>) -> io::Result<()> {
        if self.count > 0 && sixel != self.sixel {
            self.flush(out)?;
        }
        self.sixel = sixel;
        self.count += 1;
        Ok(())
    }

    fn flush(&mut self, out: &mut Vec<u8>) -> io::Result<()> {
        match self.count {
            0 => {}
            1..=3 => out.extend(std::iter::repeat(self.sixel).take(self.count)),
            n => write!(out, "!{}{}", n, self.sixel as char)?,
        }
        self.count = 0;
        Ok(())
    }
}
