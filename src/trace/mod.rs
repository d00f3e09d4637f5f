//! Protocol tracing
//!
//! Renders every request and event as one human readable line, decoding the
//! arguments with the libwayland signature string of the message:
//!
//! ```text
//! 💬 #3 wl_surface::attach((wl_buffer)#12, 0, 0)
//! 💥 #14 xdg_surface::configure(7u)
//! ```

mod signature;

use std::fmt::Write as _;
use std::io::{self, Write};
use std::os::unix::io::RawFd;

use log::warn;

pub use signature::{new_id_types, signature_of};

/// Message direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to server
    Request,
    /// Server to client
    Event,
}

impl Direction {
    pub fn marker(self) -> &'static str {
        match self {
            Direction::Request => "💬",
            Direction::Event => "💥",
        }
    }
}

/// A reference to an existing object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRef<'a> {
    pub interface: &'a str,
    pub id: u32,
}

/// One decoded argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireArg<'a> {
    Int(i32),
    Uint(u32),
    /// 24.8 fixed point, raw
    Fixed(i32),
    Str(Option<&'a str>),
    Object(Option<ObjectRef<'a>>),
    NewId(u32),
    /// Raw array bytes
    Array(&'a [u8]),
    Fd(RawFd),
}

impl WireArg<'_> {
    /// The 32-bit word this argument occupies in a libwayland argument union
    pub fn raw_word(&self) -> u32 {
        match *self {
            WireArg::Int(v) | WireArg::Fixed(v) => v as u32,
            WireArg::Uint(v) | WireArg::NewId(v) => v,
            WireArg::Str(s) => s.map_or(0, |s| s.len() as u32),
            WireArg::Object(o) => o.map_or(0, |o| o.id),
            WireArg::Array(a) => a.len() as u32,
            WireArg::Fd(fd) => fd as u32,
        }
    }
}

/// Everything needed to describe one message
#[derive(Debug, Clone, Copy)]
pub struct WireMessage<'a> {
    pub direction: Direction,
    pub object_id: u32,
    pub interface: &'a str,
    pub message: &'a str,
    /// libwayland signature, e.g. `"2?ou"`
    pub signature: &'a str,
    /// Static interface of each argument, used for new_id arguments
    pub types: &'a [Option<&'a str>],
    pub args: &'a [WireArg<'a>],
}

/// Split a signature into one `(nullable, tag)` pair per argument
///
/// A leading "since version" number is skipped.
pub fn tags(signature: &str) -> Vec<(bool, char)> {
    let mut chars = signature
        .trim_start_matches(|c: char| c.is_ascii_digit())
        .chars();
    let mut tags = Vec::new();
    while let Some(c) = chars.next() {
        if c == '?' {
            match chars.next() {
                Some(tag) => tags.push((true, tag)),
                None => break,
            }
        } else {
            tags.push((false, c));
        }
    }
    tags
}

/// Format one message
///
/// Pure and deterministic: the same message always gives the same text.
pub fn describe(message: &WireMessage<'_>) -> String {
    let mut line = format!(
        "{} #{} {}::{}",
        message.direction.marker(),
        message.object_id,
        message.interface,
        message.message
    );

    if message.args.is_empty() {
        return line;
    }

    let tags = tags(message.signature);
    for (i, arg) in message.args.iter().enumerate() {
        line.push_str(if i == 0 { "(" } else { ", " });
        // A missing tag falls through to the raw dump
        let tag = tags.get(i).map_or('\0', |(_, tag)| *tag);
        let ty = message.types.get(i).copied().flatten();
        format_arg(&mut line, tag, ty, arg);
    }
    line.push(')');
    line
}

fn format_arg(line: &mut String, tag: char, ty: Option<&str>, arg: &WireArg<'_>) {
    // Writing into a String cannot fail
    let _ = match (tag, arg) {
        ('i', WireArg::Int(v)) => write!(line, "{}", v),
        ('u', WireArg::Uint(v)) => write!(line, "{}u", v),
        ('f', WireArg::Fixed(v)) => write!(line, "{}", *v as f64 / 256.0),
        ('s', WireArg::Str(None)) | ('o', WireArg::Object(None)) => write!(line, "NULL"),
        ('s', WireArg::Str(Some(s))) => write!(line, "\"{}\"", s),
        ('o', WireArg::Object(Some(o))) => write!(line, "({})#{}", o.interface, o.id),
        ('n', WireArg::NewId(id)) => match ty {
            Some(interface) => write!(line, "({})#{}", interface, id),
            None => write!(line, "#{}", id),
        },
        ('a', WireArg::Array(bytes)) if bytes.len() < 4 => write!(line, "{{}}"),
        ('a', WireArg::Array(bytes)) => {
            for (i, word) in bytes.chunks_exact(4).enumerate() {
                let value = i32::from_ne_bytes([word[0], word[1], word[2], word[3]]);
                let _ = write!(line, "{}{}", if i == 0 { "{" } else { ", " }, value);
            }
            write!(line, "}}")
        }
        ('h', WireArg::Fd(fd)) => write!(line, "&{}", fd),
        _ => write!(line, "⁉️ {:x}", arg.raw_word()),
    };
}

/// Writes trace lines to a sink, one per message
pub struct Tracer {
    enabled: bool,
    sink: Box<dyn Write + Send>,
}

impl Tracer {
    /// Trace to stderr
    pub fn stderr() -> Self {
        Self::to_writer(Box::new(io::stderr()))
    }

    /// Trace to any writer
    pub fn to_writer(sink: Box<dyn Write + Send>) -> Self {
        Self {
            enabled: true,
            sink,
        }
    }

    /// A tracer that drops everything
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            sink: Box::new(io::sink()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Describe and write one message
    pub fn record(&mut self, message: &WireMessage<'_>) {
        if !self.enabled {
            return;
        }
        let line = describe(message);
        if let Err(e) = writeln!(self.sink, "{}", line) {
            warn!("Failed to write protocol trace: {}", e);
        }
    }
}
