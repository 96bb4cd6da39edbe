//! GPU error types.

use ash::vk;
use std::panic::Location;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// A driver call returned an unexpected result.
    #[error("Vulkan error in {op}: {result} (at {location})")]
    Vulkan {
        op: &'static str,
        result: vk::Result,
        location: &'static Location<'static>,
    },

    /// Failed to load the Vulkan library.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// A required extension or feature is not supported by the selected device.
    #[error("Required capability not supported: {0}")]
    MissingCapability(String),

    /// The descriptor heap has no free slot left in the given region.
    #[error("Descriptor heap exhausted: all {capacity} {region} slots are in use")]
    DescriptorHeapExhausted { region: &'static str, capacity: u32 },

    /// A handle was acquired after its object was retired.
    #[error("Handle to {0} acquired after it was retired")]
    HandleRetired(&'static str),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// The swapchain no longer matches the surface and must be rebuilt.
    #[error("Swapchain is out of date")]
    SwapchainOutOfDate,

    /// Shader module or shader object creation failed.
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Build a driver error for `op`, recording the caller's location.
    #[track_caller]
    pub fn vulkan(op: &'static str, result: vk::Result) -> Self {
        Self::Vulkan {
            op,
            result,
            location: Location::caller(),
        }
    }

    /// The raw driver result, if this error came from a driver call.
    pub fn vk_result(&self) -> Option<vk::Result> {
        match self {
            Self::Vulkan { result, .. } => Some(*result),
            _ => None,
        }
    }
}

/// Attaches the failing operation and call site to raw driver results.
pub trait VkResultExt<T> {
    /// Convert a `vk::Result` error into [`GpuError::Vulkan`] naming `op`.
    fn vk_context(self, op: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for std::result::Result<T, vk::Result> {
    #[track_caller]
    fn vk_context(self, op: &'static str) -> Result<T> {
        match self {
            Ok(value) => Ok(value),
            Err(result) => Err(GpuError::vulkan(op, result)),
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vulkan_error_records_call_site() {
        let raw: std::result::Result<(), vk::Result> = Err(vk::Result::ERROR_DEVICE_LOST);
        let err = raw.vk_context("vkQueueSubmit2").unwrap_err();

        match &err {
            GpuError::Vulkan { op, location, .. } => {
                assert_eq!(*op, "vkQueueSubmit2");
                assert!(location.file().ends_with("error.rs"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(err.vk_result(), Some(vk::Result::ERROR_DEVICE_LOST));
        assert!(err.to_string().contains("vkQueueSubmit2"));
    }

    #[test]
    fn exhaustion_message_names_region() {
        let err = GpuError::DescriptorHeapExhausted {
            region: "image",
            capacity: 4,
        };
        assert_eq!(
            err.to_string(),
            "Descriptor heap exhausted: all 4 image slots are in use"
        );
    }
}
