//! GPU capability detection.
//!
//! Adapters are described as plain data so that capability negotiation can run
//! against real physical devices and simulated ones alike.

use ash::vk;
use bitflags::bitflags;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

bitflags! {
    /// Device feature bits the runtime knows how to query and enable.
    ///
    /// Each bit maps onto one field of the Vulkan feature structure chain.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceFeatures: u32 {
        const TIMELINE_SEMAPHORE = 1 << 0;
        const BUFFER_DEVICE_ADDRESS = 1 << 1;
        const DESCRIPTOR_INDEXING = 1 << 2;
        const RUNTIME_DESCRIPTOR_ARRAY = 1 << 3;
        const PARTIALLY_BOUND = 1 << 4;
        const SAMPLED_IMAGE_UPDATE_AFTER_BIND = 1 << 5;
        const NON_UNIFORM_INDEXING = 1 << 6;
        const SCALAR_BLOCK_LAYOUT = 1 << 7;
        const DYNAMIC_RENDERING = 1 << 8;
        const SYNCHRONIZATION_2 = 1 << 9;
        const MAINTENANCE_4 = 1 << 10;
        const MULTIVIEW = 1 << 11;
        const DESCRIPTOR_BUFFER = 1 << 12;
        const GRAPHICS_PIPELINE_LIBRARY = 1 << 13;
        const HOST_IMAGE_COPY = 1 << 14;
        const SHADER_OBJECT = 1 << 15;
        const GEOMETRY_SHADER = 1 << 16;
        const TESSELLATION_SHADER = 1 << 17;
    }
}

impl DeviceFeatures {
    /// Human-readable name of a single feature bit.
    pub fn name(self) -> String {
        self.iter_names()
            .map(|(name, _)| name.to_ascii_lowercase())
            .collect::<Vec<_>>()
            .join("|")
    }
}

/// Device limits relevant to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterLimits {
    /// Sampled images per descriptor set with update-after-bind.
    pub max_sampled_images: u32,
    /// Samplers per descriptor set with update-after-bind.
    pub max_samplers: u32,
    /// Push constant bytes available to a pipeline layout.
    pub max_push_constants_size: u32,
    /// Maximum compute workgroup size.
    pub max_compute_workgroup_size: [u32; 3],
    /// Maximum number of views in a multiview render pass.
    pub max_multiview_view_count: u32,
}

impl Default for AdapterLimits {
    fn default() -> Self {
        Self {
            max_sampled_images: 500_000,
            max_samplers: 4_000,
            max_push_constants_size: 128,
            max_compute_workgroup_size: [1024, 1024, 64],
            max_multiview_view_count: 6,
        }
    }
}

/// One queue family exposed by an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub index: u32,
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    /// Whether queues of this family can present to the target surface.
    pub supports_present: bool,
}

/// Everything the negotiator needs to know about one physical device.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    /// Raw handle; null for simulated adapters.
    pub physical_device: vk::PhysicalDevice,
    pub name: String,
    pub vendor: GpuVendor,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub driver_version: u32,
    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    pub limits: AdapterLimits,
    pub queue_families: Vec<QueueFamilyInfo>,
    pub extensions: HashSet<String>,
    pub features: DeviceFeatures,
}

impl AdapterInfo {
    /// Whether the device exposes the named extension.
    pub fn supports_extension(&self, name: &CStr) -> bool {
        name.to_str()
            .map(|name| self.extensions.contains(name))
            .unwrap_or(false)
    }

    /// Whether every bit of `feature` is supported.
    pub fn supports_feature(&self, feature: DeviceFeatures) -> bool {
        self.features.contains(feature)
    }

    /// Whether any graphics-capable family can present.
    pub fn can_present(&self) -> bool {
        self.queue_families
            .iter()
            .any(|f| f.flags.contains(vk::QueueFlags::GRAPHICS) && f.supports_present)
    }

    /// Whether this is a discrete GPU.
    pub fn is_discrete(&self) -> bool {
        self.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.name,
            self.vendor,
            self.device_type,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

/// Runtime switches produced by capability negotiation.
///
/// Each flag picks between an optimized path and its fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeCaps {
    /// Bindless descriptor buffer, else a classic descriptor set.
    pub descriptor_buffer: bool,
    /// Linkable pipeline fragments, else monolithic pipelines.
    pub graphics_pipeline_library: bool,
    /// Host-side copies into images, else staging through a buffer.
    pub host_image_copy: bool,
    /// Direct-bind shader objects, else compiled pipelines.
    pub shader_object: bool,
    /// Multiview rendering; without it view masks must be zero.
    pub multiview: bool,
}

impl std::fmt::Display for RuntimeCaps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mark = |on: bool| if on { "yes" } else { "fallback" };
        write!(
            f,
            "descriptor_buffer={} pipeline_library={} host_image_copy={} shader_object={} multiview={}",
            mark(self.descriptor_buffer),
            mark(self.graphics_pipeline_library),
            mark(self.host_image_copy),
            mark(self.shader_object),
            mark(self.multiview),
        )
    }
}
