//! Runtime configuration from the environment

use std::env;

use crate::renderer::RenderStrategy;

/// Selects the frame encoder: `truecolor` or `sixel`
pub const RENDERER_VAR: &str = "WAYTTY_RENDERER";

/// Set to `0`, `off` or `false` to silence the protocol trace
pub const TRACE_VAR: &str = "WAYTTY_TRACE";

/// Server configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub renderer: RenderStrategy,
    pub trace: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            renderer: RenderStrategy::default(),
            trace: true,
        }
    }
}

impl Config {
    /// Read the configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Read the configuration through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup(RENDERER_VAR) {
            config.renderer = match value.trim().to_ascii_lowercase().as_str() {
                "" | "truecolor" => RenderStrategy::Truecolor,
                "sixel" => RenderStrategy::Sixel,
                _ => return Err(ConfigError::UnknownRenderer(value)),
            };
        }

        if let Some(value) = lookup(TRACE_VAR) {
            config.trace = !matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "0" | "off" | "false"
            );
        }

        Ok(config)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown renderer {0:?}, expected \"truecolor\" or \"sixel\"")]
    UnknownRenderer(String),
}
