//! Configuration Module
//!
//! Device tuning knobs and loopback kernel parameters, loadable from TOML.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::protocol::SVGA3D_MAX_SHADER_MEMORY_BYTES;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub kernel: LoopbackConfig,

    #[serde(default)]
    pub soak: SoakConfig,
}

/// Per-device parameters of the driver core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Size of the shader allocation created with the first shader
    #[serde(default = "default_shader_memory_bytes")]
    pub shader_memory_bytes: u32,

    /// Size of each CO-allocation created for query results
    #[serde(default = "default_query_coallocation_bytes")]
    pub query_coallocation_bytes: u32,

    /// New stream-output CO-allocations hold this many declarations
    #[serde(default = "default_stream_output_link_factor")]
    pub stream_output_link_factor: u32,

    /// Give up a blocking Map after this many busy polls (0 = never)
    #[serde(default)]
    pub max_map_spins: u32,
}

fn default_shader_memory_bytes() -> u32 {
    SVGA3D_MAX_SHADER_MEMORY_BYTES
}

fn default_query_coallocation_bytes() -> u32 {
    4096
}

fn default_stream_output_link_factor() -> u32 {
    8
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            shader_memory_bytes: default_shader_memory_bytes(),
            query_coallocation_bytes: default_query_coallocation_bytes(),
            stream_output_link_factor: default_stream_output_link_factor(),
            max_map_spins: 0,
        }
    }
}

/// Parameters of the in-process loopback kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopbackConfig {
    /// Command buffer size handed out on every submit
    #[serde(default = "default_command_buffer_bytes")]
    pub command_buffer_bytes: u32,

    /// Allocation list capacity per batch
    #[serde(default = "default_allocation_list_entries")]
    pub allocation_list_entries: u32,

    /// Patch-location list capacity per batch
    #[serde(default = "default_patch_list_entries")]
    pub patch_list_entries: u32,

    /// Non-blocking locks of a just-submitted allocation report busy this
    /// many times
    #[serde(default)]
    pub busy_polls: u32,

    /// Total bytes the loopback kernel will allocate
    #[serde(default = "default_video_memory_bytes")]
    pub video_memory_bytes: u64,

    /// Offered allocations lose their contents
    #[serde(default)]
    pub discard_offered: bool,

    /// Keep a copy of every executed command for inspection
    #[serde(default = "default_record_commands")]
    pub record_commands: bool,
}

fn default_command_buffer_bytes() -> u32 {
    64 * 1024
}

fn default_allocation_list_entries() -> u32 {
    256
}

fn default_patch_list_entries() -> u32 {
    1024
}

fn default_video_memory_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_record_commands() -> bool {
    true
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            command_buffer_bytes: default_command_buffer_bytes(),
            allocation_list_entries: default_allocation_list_entries(),
            patch_list_entries: default_patch_list_entries(),
            busy_polls: 0,
            video_memory_bytes: default_video_memory_bytes(),
            discard_offered: false,
            record_commands: default_record_commands(),
        }
    }
}

/// Settings of the soak binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoakConfig {
    /// Log filter used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Workload iterations (0 = until Ctrl+C)
    #[serde(default = "default_iterations")]
    pub iterations: u64,

    /// Textures rotated per iteration
    #[serde(default = "default_swap_chain_length")]
    pub swap_chain_length: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_iterations() -> u64 {
    1000
}

fn default_swap_chain_length() -> u32 {
    3
}

impl Default for SoakConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            iterations: default_iterations(),
            swap_chain_length: default_swap_chain_length(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
