//! Tracer configuration files
//!
//! A configuration file groups the session options, the collector caps and
//! the activity buffer pool settings. Every field is optional.

use crate::buffer_pool::{BufferPoolConfig, MIN_BUFFER_SIZE};
use crate::collector::CollectorOptions;
use crate::error::{Result, TracerError};
use crate::tracer::TracerOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Complete tracer configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TracerConfig {
    pub tracer: TracerOptions,
    pub collector: CollectorOptions,
    pub buffer_pool: BufferPoolConfig,
}

impl TracerConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    /// Returns error if the file cannot be read, is not valid TOML, names an
    /// unknown driver API or activity kind, or fails validation.
    ///
    /// # Example TOML
    /// ```toml
    /// [tracer]
    /// cbids_selected = ["cuLaunchKernel", "cuMemcpyHtoDAsync"]
    /// activities_selected = ["concurrent_kernel", "memcpy"]
    /// sync_devices_before_stop = true
    ///
    /// [collector]
    /// max_callback_api_events = 100000
    ///
    /// [buffer_pool]
    /// buffer_size_bytes = 65536
    /// ```
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|err| TracerError::Config(format!("{}: {err}", path.display())))
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|err| TracerError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_pool.buffer_size_bytes < MIN_BUFFER_SIZE {
            return Err(TracerError::Config(format!(
                "buffer_size_bytes must be at least {MIN_BUFFER_SIZE}, got {}",
                self.buffer_pool.buffer_size_bytes
            )));
        }
        if self.buffer_pool.max_buffers > 0 && self.buffer_pool.preallocate > self.buffer_pool.max_buffers {
            return Err(TracerError::Config(format!(
                "preallocate ({}) exceeds max_buffers ({})",
                self.buffer_pool.preallocate, self.buffer_pool.max_buffers
            )));
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|err| TracerError::Config(err.to_string()))
    }
}
