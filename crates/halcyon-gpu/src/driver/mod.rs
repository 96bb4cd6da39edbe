//! Driver binding.
//!
//! The runtime talks to the device exclusively through [`DeviceDriver`].
//! [`vulkan::VulkanDevice`] forwards to `ash`; with the `simulated` feature,
//! [`simulated::SimulatedDriver`] provides an in-memory device for headless tests.
//!
//! Entry points are resolved in two stages: [`Backend`] covers everything
//! available before a logical device exists (adapter enumeration), and
//! [`Backend::open_device`] produces the device-level binding.

mod features;
pub mod vulkan;

#[cfg(any(test, feature = "simulated"))]
pub mod simulated;

use crate::capabilities::{AdapterInfo, RuntimeCaps};
use crate::error::Result;
use crate::negotiate::NegotiatedDevice;
use crate::pipeline::{DynamicState, GraphicsState};
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use std::ffi::CStr;
use std::ptr::NonNull;
use std::sync::Arc;

pub use features::FeatureChain;

/// Shared reference to the device-level driver binding.
pub type DriverRef = Arc<dyn DeviceDriver>;

/// Pre-device driver entry points.
pub trait Backend {
    /// Describe every physical device.
    fn adapters(&self) -> Result<Vec<AdapterInfo>>;

    /// Create the logical device for a negotiated adapter.
    fn open_device(
        &self,
        adapter: &AdapterInfo,
        negotiated: &NegotiatedDevice,
    ) -> Result<DriverRef>;
}

/// Device-level driver entry points used by the runtime.
pub trait DeviceDriver: Send + Sync {
    /// The adapter this device was opened on.
    fn adapter(&self) -> &AdapterInfo;

    /// Capabilities negotiated for this device.
    fn caps(&self) -> RuntimeCaps;

    /// Retrieve a hardware queue created with the device.
    fn queue(&self, family: u32, index: u32) -> vk::Queue;

    // Timeline and binary semaphores

    fn create_timeline(&self, initial_value: u64) -> Result<vk::Semaphore>;
    fn timeline_value(&self, semaphore: vk::Semaphore) -> Result<u64>;
    /// Block until the timeline reaches `value`; `false` on timeout.
    fn wait_timeline(&self, semaphore: vk::Semaphore, value: u64, timeout_ns: u64) -> Result<bool>;
    fn signal_timeline(&self, semaphore: vk::Semaphore, value: u64) -> Result<()>;
    fn create_binary_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // Command recording and submission

    fn create_command_pool(&self, family: u32) -> Result<vk::CommandPool>;
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;
    fn record(&self, cmd: vk::CommandBuffer, command: &Command<'_>);
    fn submit(&self, queue: vk::Queue, batch: &SubmitBatch<'_>) -> Result<()>;
    fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()>;
    fn wait_idle(&self) -> Result<()>;

    // Memory and resources

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<BufferAllocation>;
    fn destroy_buffer(&self, buffer: BufferAllocation) -> Result<()>;
    fn create_image(&self, desc: &ImageDesc<'_>) -> Result<ImageAllocation>;
    fn destroy_image(&self, image: ImageAllocation) -> Result<()>;
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);
    /// Copy tightly packed texels into mip 0 from the host and leave the image
    /// in `SHADER_READ_ONLY_OPTIMAL`. Only valid with `host_image_copy`.
    fn copy_memory_to_image(&self, image: &ImageAllocation, data: &[u8]) -> Result<()>;

    // Bindless descriptor table

    fn create_descriptor_heap(&self, desc: &HeapDesc) -> Result<HeapResources>;
    fn write_descriptor(&self, heap: &HeapResources, write: &DescriptorWrite);
    fn destroy_descriptor_heap(&self, heap: HeapResources);

    // Shaders and pipelines

    fn create_shader(&self, desc: &ShaderDesc<'_>) -> Result<ShaderHandles>;
    fn destroy_shader(&self, shader: ShaderHandles);
    fn create_pipeline_fragment(
        &self,
        fragment: &PipelineFragment<'_>,
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline>;
    fn link_pipeline(
        &self,
        fragments: &[vk::Pipeline],
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline>;
    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc<'_>,
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline>;
    fn create_compute_pipeline(
        &self,
        stage: &ShaderStageRef<'_>,
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    /// The `ash` binding, when this driver talks to a real device.
    fn vulkan(&self) -> Option<&vulkan::VulkanDevice> {
        None
    }
}

/// A timeline value to wait on before a submission starts.
#[derive(Debug, Clone, Copy)]
pub struct TimelineWait {
    pub semaphore: vk::Semaphore,
    pub value: u64,
    pub stages: vk::PipelineStageFlags2,
}

/// One queue submission.
#[derive(Debug, Clone, Copy)]
pub struct SubmitBatch<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub waits: &'a [TimelineWait],
    /// Binary semaphores to wait on (swapchain acquisition).
    pub binary_waits: &'a [(vk::Semaphore, vk::PipelineStageFlags2)],
    /// Timeline to signal once the batch completes.
    pub signal: vk::Semaphore,
    pub signal_value: u64,
    /// Binary semaphores to signal (presentation).
    pub binary_signals: &'a [vk::Semaphore],
}

/// Buffer creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

/// A buffer with its memory.
pub struct BufferAllocation {
    pub raw: vk::Buffer,
    pub size: u64,
    pub location: MemoryLocation,
    /// Zero unless created with `SHADER_DEVICE_ADDRESS`.
    pub device_address: vk::DeviceAddress,
    pub(crate) mapped: Option<NonNull<u8>>,
    pub(crate) allocation: Option<Allocation>,
}

// The mapped pointer refers to persistently mapped device memory owned by
// the allocation; access is synchronized by the callers.
unsafe impl Send for BufferAllocation {}
unsafe impl Sync for BufferAllocation {}

impl BufferAllocation {
    /// Host pointer for host-visible buffers.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped
    }
}

impl std::fmt::Debug for BufferAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferAllocation")
            .field("raw", &self.raw)
            .field("size", &self.size)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

/// Image creation parameters. Images are always device-local 2D images.
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc<'a> {
    pub name: &'a str,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub mip_levels: u32,
    pub usage: vk::ImageUsageFlags,
}

impl ImageDesc<'_> {
    /// Number of mips down to 1x1.
    pub fn full_mip_chain(extent: vk::Extent2D) -> u32 {
        32 - extent.width.max(extent.height).max(1).leading_zeros()
    }
}

/// An image with its memory and default view.
pub struct ImageAllocation {
    pub raw: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub mip_levels: u32,
    pub usage: vk::ImageUsageFlags,
    /// Bytes of device memory backing the image.
    pub size: u64,
    pub(crate) allocation: Option<Allocation>,
}

impl std::fmt::Debug for ImageAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageAllocation")
            .field("raw", &self.raw)
            .field("format", &self.format)
            .field("extent", &self.extent)
            .field("mip_levels", &self.mip_levels)
            .finish_non_exhaustive()
    }
}

/// Sampler creation parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    pub max_anisotropy: Option<f32>,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            max_anisotropy: None,
        }
    }
}

/// Binding index of the sampled image array in the bindless set.
pub const HEAP_IMAGE_BINDING: u32 = 0;
/// Binding index of the sampler array in the bindless set.
pub const HEAP_SAMPLER_BINDING: u32 = 1;

/// Layout of the bindless descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapDesc {
    pub image_capacity: u32,
    pub sampler_capacity: u32,
    pub push_constant_size: u32,
}

/// Backing storage of the descriptor table.
#[derive(Debug)]
pub enum HeapStorage {
    /// Update-after-bind descriptor set.
    DescriptorSet {
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
    },
    /// Host-written descriptor buffer.
    DescriptorBuffer {
        buffer: BufferAllocation,
        image_offset: u64,
        image_stride: u64,
        sampler_offset: u64,
        sampler_stride: u64,
    },
}

/// Driver objects behind the descriptor table.
#[derive(Debug)]
pub struct HeapResources {
    pub set_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
    pub push_constant_size: u32,
    pub storage: HeapStorage,
}

/// One slot update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorWrite {
    Image {
        index: u32,
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    Sampler {
        index: u32,
        sampler: vk::Sampler,
    },
}

/// Shader creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct ShaderDesc<'a> {
    pub stage: vk::ShaderStageFlags,
    pub entry: &'a CStr,
    pub code: &'a [u32],
    pub set_layout: vk::DescriptorSetLayout,
    pub push_constant_size: u32,
    /// Also create a direct-bind shader object.
    pub create_object: bool,
}

/// Driver objects behind one shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderHandles {
    pub module: vk::ShaderModule,
    /// Null unless shader objects are in use.
    pub object: vk::ShaderEXT,
}

/// A shader stage referenced by pipeline creation.
#[derive(Debug, Clone, Copy)]
pub struct ShaderStageRef<'a> {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
    pub entry: &'a CStr,
}

/// One independently compiled portion of a graphics pipeline.
#[derive(Debug, Clone, Copy)]
pub enum PipelineFragment<'a> {
    VertexInput {
        topology: vk::PrimitiveTopology,
    },
    PreRasterization {
        stages: &'a [ShaderStageRef<'a>],
        polygon_mode: vk::PolygonMode,
        view_mask: u32,
    },
    FragmentShader {
        stage: Option<ShaderStageRef<'a>>,
        view_mask: u32,
    },
    FragmentOutput {
        color_formats: &'a [vk::Format],
        depth_format: vk::Format,
        stencil_format: vk::Format,
        blend_mask: u32,
        view_mask: u32,
    },
}

impl PipelineFragment<'_> {
    /// Which cache this fragment belongs to.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::VertexInput { .. } => "vertex-input",
            Self::PreRasterization { .. } => "pre-rasterization",
            Self::FragmentShader { .. } => "fragment-shader",
            Self::FragmentOutput { .. } => "fragment-output",
        }
    }
}

/// Everything needed for a monolithic graphics pipeline.
#[derive(Debug, Clone, Copy)]
pub struct GraphicsPipelineDesc<'a> {
    pub stages: &'a [ShaderStageRef<'a>],
    pub state: &'a GraphicsState,
}

/// Load behavior of a color attachment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOp<T> {
    Load,
    Clear(T),
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorAttachment {
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub load: LoadOp<[f32; 4]>,
    pub store: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthAttachment {
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub load: LoadOp<f32>,
    pub store: bool,
}

/// Parameters of a dynamic rendering scope.
#[derive(Debug, Clone, Copy)]
pub struct RenderingDesc<'a> {
    pub extent: vk::Extent2D,
    pub colors: &'a [ColorAttachment],
    pub depth: Option<DepthAttachment>,
    pub view_mask: u32,
}

/// A layout transition with its execution and memory dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub base_mip: u32,
    pub mip_count: u32,
}

/// A command recorded into a command buffer.
#[derive(Debug, Clone, Copy)]
pub enum Command<'a> {
    BindDescriptorHeap {
        bind_point: vk::PipelineBindPoint,
        heap: &'a HeapResources,
    },
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindShaders {
        stages: &'a [vk::ShaderStageFlags],
        shaders: &'a [vk::ShaderEXT],
    },
    /// Pipeline state that shader objects take dynamically.
    SetGraphicsState(&'a GraphicsState),
    SetDynamicState(&'a DynamicState),
    BeginRendering(&'a RenderingDesc<'a>),
    EndRendering,
    SetViewport(vk::Extent2D),
    PushConstants {
        layout: vk::PipelineLayout,
        offset: u32,
        data: &'a [u8],
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    Dispatch([u32; 3]),
    ImageBarrier(&'a ImageBarrier),
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &'a [vk::BufferCopy],
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        regions: &'a [vk::BufferImageCopy],
    },
    /// Downsample one mip level of an image into the next.
    BlitMip {
        image: vk::Image,
        src_mip: u32,
        src_extent: vk::Extent2D,
        dst_extent: vk::Extent2D,
    },
}

impl Command<'_> {
    /// Short name for logs and simulated command streams.
    pub fn name(&self) -> &'static str {
        match self {
            Self::BindDescriptorHeap { .. } => "bind_descriptor_heap",
            Self::BindPipeline { .. } => "bind_pipeline",
            Self::BindShaders { .. } => "bind_shaders",
            Self::SetGraphicsState(_) => "set_graphics_state",
            Self::SetDynamicState(_) => "set_dynamic_state",
            Self::BeginRendering(_) => "begin_rendering",
            Self::EndRendering => "end_rendering",
            Self::SetViewport(_) => "set_viewport",
            Self::PushConstants { .. } => "push_constants",
            Self::Draw { .. } => "draw",
            Self::Dispatch(_) => "dispatch",
            Self::ImageBarrier(_) => "image_barrier",
            Self::CopyBuffer { .. } => "copy_buffer",
            Self::CopyBufferToImage { .. } => "copy_buffer_to_image",
            Self::BlitMip { .. } => "blit_mip",
        }
    }
}

/// Whether `format` carries a stencil component.
pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Aspects covered by a full view of an image in `format`.
pub fn format_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Shader stage that must follow `stage` in a graphics pipeline.
pub(crate) fn next_stages(stage: vk::ShaderStageFlags) -> vk::ShaderStageFlags {
    match stage {
        vk::ShaderStageFlags::VERTEX => {
            vk::ShaderStageFlags::TESSELLATION_CONTROL
                | vk::ShaderStageFlags::GEOMETRY
                | vk::ShaderStageFlags::FRAGMENT
        }
        vk::ShaderStageFlags::TESSELLATION_CONTROL => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
        vk::ShaderStageFlags::TESSELLATION_EVALUATION => {
            vk::ShaderStageFlags::GEOMETRY | vk::ShaderStageFlags::FRAGMENT
        }
        vk::ShaderStageFlags::GEOMETRY => vk::ShaderStageFlags::FRAGMENT,
        _ => vk::ShaderStageFlags::empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_chain_length() {
        let extent = |width, height| vk::Extent2D { width, height };
        assert_eq!(ImageDesc::full_mip_chain(extent(1, 1)), 1);
        assert_eq!(ImageDesc::full_mip_chain(extent(256, 256)), 9);
        assert_eq!(ImageDesc::full_mip_chain(extent(300, 17)), 9);
    }

    #[test]
    fn depth_formats_map_to_depth_aspects() {
        assert_eq!(format_aspect(vk::Format::R8G8B8A8_UNORM), vk::ImageAspectFlags::COLOR);
        assert_eq!(format_aspect(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert!(format_aspect(vk::Format::D24_UNORM_S8_UINT).contains(vk::ImageAspectFlags::STENCIL));
        assert!(has_stencil(vk::Format::D32_SFLOAT_S8_UINT));
    }

    #[test]
    fn vertex_stage_feeds_fragment() {
        assert!(next_stages(vk::ShaderStageFlags::VERTEX).contains(vk::ShaderStageFlags::FRAGMENT));
        assert!(next_stages(vk::ShaderStageFlags::FRAGMENT).is_empty());
    }
}
