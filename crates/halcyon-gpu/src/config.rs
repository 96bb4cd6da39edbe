//! Context configuration.

use crate::descriptors::HeapConfig;
use crate::queue::DEFAULT_POOL_CAPACITY;
use serde::Deserialize;

/// Environment variable overriding [`ContextConfig::validation`] (`0` or `1`).
pub const VALIDATION_ENV: &str = "HALCYON_VALIDATION";

/// Settings for building a [`Context`](crate::Context).
///
/// Hosts typically embed this in their own configuration file; every field
/// has a default.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub app_name: String,
    /// Enable the Khronos validation layer when it is installed.
    pub validation: bool,
    /// Only accept adapters that can present to a surface.
    pub require_presentation: bool,
    pub heap: HeapConfig,
    /// Command buffers per command pool.
    pub pool_capacity: u32,
    /// Hardware queues requested for each role.
    pub queues_per_role: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            app_name: "Halcyon".to_string(),
            validation: cfg!(debug_assertions),
            require_presentation: false,
            heap: HeapConfig::default(),
            pool_capacity: DEFAULT_POOL_CAPACITY,
            queues_per_role: 2,
        }
    }
}

impl ContextConfig {
    /// Apply environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(validation) = parse_flag(std::env::var(VALIDATION_ENV).ok().as_deref()) {
            self.validation = validation;
        }
        self
    }
}

fn parse_flag(value: Option<&str>) -> Option<bool> {
    match value?.trim() {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        other => {
            tracing::warn!("Ignoring {VALIDATION_ENV}={other:?}");
            None
        }
    }
}
