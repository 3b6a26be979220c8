//! Ambient adapter settings
//!
//! Per-session debug parameters arrive in DAP `launch`/`attach` request
//! bodies; this file covers the ambient knobs that are not part of a launch
//! configuration. Settings load from an optional `jsdap.toml` and every
//! field has a default.

use serde::Deserialize;
use std::path::Path;

use super::{Error, Result};

/// Main settings structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Settings {
    /// Timeout settings
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Breakpoint behavior
    #[serde(default)]
    pub breakpoints: BreakpointSettings,

    /// Variable rendering
    #[serde(default)]
    pub variables: VariableSettings,
}

/// Timeout settings in seconds
#[derive(Debug, Deserialize, Clone)]
pub struct Timeouts {
    /// Timeout waiting for the main target after launch or attach
    #[serde(default = "default_main_target")]
    pub main_target_secs: u64,

    /// Timeout for reading the DevTools websocket endpoint from a spawned
    /// runtime's stderr
    #[serde(default = "default_endpoint")]
    pub endpoint_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            main_target_secs: default_main_target(),
            endpoint_secs: default_endpoint(),
        }
    }
}

fn default_main_target() -> u64 {
    30
}
fn default_endpoint() -> u64 {
    15
}

/// Breakpoint behavior settings
#[derive(Debug, Deserialize, Clone)]
pub struct BreakpointSettings {
    /// Predict compiled breakpoint locations from workspace source maps
    /// before launch
    #[serde(default = "default_true")]
    pub predict: bool,

    /// Request an instrumentation pause on scripts that carry source maps so
    /// breakpoints can be installed before the first statement runs
    #[serde(default = "default_true")]
    pub pause_for_source_maps: bool,
}

impl Default for BreakpointSettings {
    fn default() -> Self {
        Self {
            predict: default_true(),
            pause_for_source_maps: default_true(),
        }
    }
}

/// Variable rendering settings
#[derive(Debug, Deserialize, Clone)]
pub struct VariableSettings {
    /// Arrays longer than this are presented as interval sub-containers
    #[serde(default = "default_array_chunk")]
    pub array_chunk: usize,
}

impl Default for VariableSettings {
    fn default() -> Self {
        Self {
            array_chunk: default_array_chunk(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_array_chunk() -> usize {
    100
}

impl Settings {
    /// Load settings from the given file, or `jsdap.toml` in the working
    /// directory when present
    ///
    /// Returns defaults if no file exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let fallback = Path::new("jsdap.toml");
                if !fallback.exists() {
                    return Ok(Self::default());
                }
                fallback.to_path_buf()
            }
        };

        let content = std::fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!("failed to read '{}': {e}", path.display()))
        })?;
        toml::from_str(&content).map_err(|e| Error::ConfigParse(e.to_string()))
    }
}
