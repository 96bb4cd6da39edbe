//! Test harness for the Halcyon runtime.
//!
//! Builds contexts over the simulated driver so integration tests run
//! without a GPU and can inspect everything the runtime asked the device to do.

pub mod harness;

pub use harness::{color_state, spirv, SimulatedHarness};

use halcyon_gpu::{ContextConfig, GpuError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),
    #[error("Simulated device left {live} objects alive")]
    Leaked { live: usize },
    #[error("Simulated device reported misuse: {0:?}")]
    Violations(Vec<String>),
}

pub type Result<T> = std::result::Result<T, TestError>;

/// Harness configuration.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Submitted work completes only when the test says so.
    pub manual_completion: bool,
    pub context: ContextConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            manual_completion: false,
            context: ContextConfig {
                app_name: "halcyon-test".to_string(),
                validation: false,
                ..Default::default()
            },
        }
    }
}
