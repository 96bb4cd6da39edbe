//! Vulkan hardware abstraction runtime.
//!
//! This crate provides:
//! - Capability negotiation against a minimum Vulkan 1.3 feature set
//! - A bindless descriptor heap with stable slot indices
//! - Queues with timeline fences and recycled command lists
//! - A layered graphics and compute pipeline cache
//! - Deferred destruction of resources still in use by the GPU
//! - Window and offscreen swapchains, texture upload
//!
//! Every device call goes through [`driver::DeviceDriver`]. The Vulkan
//! backend lives in [`driver::vulkan`]; the `simulated` feature adds an
//! in-process driver for tests.

pub mod capabilities;
pub mod command;
pub mod config;
pub mod context;
pub mod deferred;
pub mod descriptors;
pub mod driver;
pub mod error;
pub mod fence;
pub mod handle;
pub mod instance;
pub mod memory;
pub mod negotiate;
pub mod pipeline;
pub mod queue;
pub mod resource;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod upload;

pub use capabilities::{AdapterInfo, AdapterLimits, GpuVendor, QueueFamilyInfo, RuntimeCaps};
pub use command::CommandList;
pub use config::ContextConfig;
pub use context::{Context, ContextBuilder, ContextStats};
pub use descriptors::{DescriptorHeap, HeapConfig, HeapMode, HeapStats};
pub use driver::{
    Backend, BufferDesc, ColorAttachment, DepthAttachment, DeviceDriver, ImageBarrier, ImageDesc,
    LoadOp, RenderingDesc, SamplerDesc,
};
pub use error::{GpuError, Result};
pub use fence::{Fence, SyncPoint};
pub use handle::Handle;
pub use instance::InstanceBinding;
pub use memory::{allocation_stats, MemoryStats};
pub use negotiate::{CapabilityNegotiator, NegotiatedDevice};
pub use pipeline::{
    ComputePipelineKey, DynamicState, GraphicsPipelineKey, GraphicsState, PipelineCache,
    PipelineCacheStats, PipelineMode,
};
pub use queue::{Queue, QueueKind, QueueStats, SubmitInfo};
pub use resource::{Buffer, GpuBuffer, GpuImage, GpuSampler, Image, Sampler};
pub use shader::{Shader, ShaderId, ShaderRegistry, ShaderSet};
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::{AcquiredImage, Swapchain, SwapchainDesc, SwapchainTarget};
pub use upload::{upload_image, ImageData, UploadedImage};
