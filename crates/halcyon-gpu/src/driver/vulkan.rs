//! `ash` implementation of the driver binding.

use super::features::{ChainExtensions, FeatureChain};
use super::{
    format_aspect, has_stencil, next_stages, Backend, BufferAllocation, BufferDesc, Command,
    DescriptorWrite, DeviceDriver, DriverRef, GraphicsPipelineDesc, HeapDesc, HeapResources,
    HeapStorage, ImageAllocation, ImageBarrier, ImageDesc, LoadOp, PipelineFragment, RenderingDesc,
    SamplerDesc, ShaderDesc, ShaderHandles, ShaderStageRef, SubmitBatch, HEAP_IMAGE_BINDING,
    HEAP_SAMPLER_BINDING,
};
use crate::capabilities::{
    AdapterInfo, AdapterLimits, DeviceFeatures, GpuVendor, QueueFamilyInfo, RuntimeCaps,
};
use crate::error::{GpuError, Result, VkResultExt};
use crate::instance::InstanceBinding;
use crate::memory::GpuAllocator;
use crate::negotiate::NegotiatedDevice;
use crate::pipeline::{DynamicState, GraphicsState};
use crate::surface::SurfaceContext;
use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::ffi::{c_char, CStr};
use std::ptr::NonNull;
use std::sync::Arc;

fn chain_extensions(has: impl Fn(&CStr) -> bool) -> ChainExtensions {
    ChainExtensions {
        descriptor_buffer: has(ash::ext::descriptor_buffer::NAME),
        pipeline_library: has(ash::ext::graphics_pipeline_library::NAME),
        host_image_copy: has(ash::ext::host_image_copy::NAME),
        shader_object: has(ash::ext::shader_object::NAME),
    }
}

/// Pre-device entry points backed by a Vulkan instance.
pub struct VulkanBackend {
    instance: Arc<InstanceBinding>,
    surface: Option<Arc<SurfaceContext>>,
}

impl VulkanBackend {
    /// With a surface, present support is checked against it; without one
    /// every graphics family counts as presentable.
    pub fn new(instance: Arc<InstanceBinding>, surface: Option<Arc<SurfaceContext>>) -> Self {
        Self { instance, surface }
    }

    pub fn instance(&self) -> &Arc<InstanceBinding> {
        &self.instance
    }

    /// # Safety
    /// `physical_device` must come from this backend's instance.
    unsafe fn describe(&self, physical_device: vk::PhysicalDevice) -> Result<AdapterInfo> {
        let instance = self.instance.instance();

        let mut v11 = vk::PhysicalDeviceVulkan11Properties::default();
        let mut v12 = vk::PhysicalDeviceVulkan12Properties::default();
        let properties = {
            let mut properties2 = vk::PhysicalDeviceProperties2::default()
                .push_next(&mut v11)
                .push_next(&mut v12);
            // SAFETY: guaranteed by the caller.
            unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };
            properties2.properties
        };

        let name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        // SAFETY: guaranteed by the caller.
        let memory = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let device_local_memory_mb = memory
            .memory_heaps
            .iter()
            .take(memory.memory_heap_count as usize)
            .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|h| h.size / (1024 * 1024))
            .sum();

        // SAFETY: guaranteed by the caller.
        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let mut queue_families = Vec::with_capacity(families.len());
        for (index, family) in (0u32..).zip(&families) {
            let supports_present = match &self.surface {
                Some(surface) => surface.supports_present(physical_device, index)?,
                None => family.queue_flags.contains(vk::QueueFlags::GRAPHICS),
            };
            queue_families.push(QueueFamilyInfo {
                index,
                flags: family.queue_flags,
                queue_count: family.queue_count,
                supports_present,
            });
        }

        // SAFETY: guaranteed by the caller.
        let extensions: HashSet<String> =
            unsafe { instance.enumerate_device_extension_properties(physical_device) }
                .vk_context("vkEnumerateDeviceExtensionProperties")?
                .iter()
                .filter_map(|props| props.extension_name_as_c_str().ok())
                .map(|name| name.to_string_lossy().into_owned())
                .collect();

        let linked = chain_extensions(|name| {
            name.to_str()
                .map(|name| extensions.contains(name))
                .unwrap_or(false)
        });
        // SAFETY: guaranteed by the caller; only supported structures are linked.
        let features = unsafe { FeatureChain::query(instance, physical_device, linked) }.supported();

        Ok(AdapterInfo {
            physical_device,
            name,
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_type: properties.device_type,
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            device_local_memory_mb,
            limits: AdapterLimits {
                max_sampled_images: v12.max_descriptor_set_update_after_bind_sampled_images,
                max_samplers: v12.max_descriptor_set_update_after_bind_samplers,
                max_push_constants_size: properties.limits.max_push_constants_size,
                max_compute_workgroup_size: properties.limits.max_compute_work_group_size,
                max_multiview_view_count: v11.max_multiview_view_count,
            },
            queue_families,
            extensions,
            features,
        })
    }
}

impl Backend for VulkanBackend {
    fn adapters(&self) -> Result<Vec<AdapterInfo>> {
        // SAFETY: the instance is alive for as long as the backend.
        let devices = unsafe { self.instance.instance().enumerate_physical_devices() }
            .vk_context("vkEnumeratePhysicalDevices")?;

        let mut adapters = Vec::with_capacity(devices.len());
        for device in devices {
            // SAFETY: enumerated from our instance just above.
            let adapter = unsafe { self.describe(device) }?;
            tracing::debug!("Found adapter: {}", adapter.summary());
            adapters.push(adapter);
        }
        Ok(adapters)
    }

    fn open_device(
        &self,
        adapter: &AdapterInfo,
        negotiated: &NegotiatedDevice,
    ) -> Result<DriverRef> {
        let priorities: Vec<Vec<f32>> = negotiated
            .queues
            .iter()
            .map(|role| vec![1.0; role.count as usize])
            .collect();
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = negotiated
            .queues
            .iter()
            .zip(&priorities)
            .map(|(role, priorities)| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(role.family)
                    .queue_priorities(priorities)
            })
            .collect();

        let extension_names: Vec<*const c_char> = negotiated
            .enabled
            .extensions
            .iter()
            .map(|ext| ext.as_ptr())
            .collect();

        let mut features = FeatureChain::enabling(negotiated.enabled.features);
        let mut features2 = features.link(chain_extensions(|name| {
            negotiated.enabled.has_extension(name)
        }));

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_names)
            .push_next(&mut features2);

        // SAFETY: the adapter was described by this backend and every pointer
        // in `create_info` outlives the call.
        let device = unsafe {
            self.instance
                .instance()
                .create_device(adapter.physical_device, &create_info, None)
        }
        .vk_context("vkCreateDevice")?;

        tracing::info!(
            "Created logical device with {} extensions",
            negotiated.enabled.extensions.len()
        );

        let device = VulkanDevice::new(
            self.instance.clone(),
            self.surface.clone(),
            adapter.clone(),
            negotiated,
            device,
        )?;
        Ok(Arc::new(device))
    }
}

/// Sizes reported by `VK_EXT_descriptor_buffer`.
#[derive(Debug, Clone, Copy)]
struct DescriptorSizes {
    sampled_image: u64,
    sampler: u64,
}

/// Second stage of the driver binding: the logical device and its
/// extension loaders.
pub struct VulkanDevice {
    instance: Arc<InstanceBinding>,
    surface: Option<Arc<SurfaceContext>>,
    adapter: AdapterInfo,
    caps: RuntimeCaps,
    device: ash::Device,
    allocator: Mutex<GpuAllocator>,
    swapchain: Option<ash::khr::swapchain::Device>,
    descriptor_buffer: Option<(ash::ext::descriptor_buffer::Device, DescriptorSizes)>,
    shader_object: Option<ash::ext::shader_object::Device>,
    host_image_copy: Option<ash::ext::host_image_copy::Device>,
}

impl VulkanDevice {
    fn new(
        instance: Arc<InstanceBinding>,
        surface: Option<Arc<SurfaceContext>>,
        adapter: AdapterInfo,
        negotiated: &NegotiatedDevice,
        device: ash::Device,
    ) -> Result<Self> {
        let caps = negotiated.caps;
        let raw_instance = instance.instance();

        // SAFETY: the device was just created from this instance and adapter.
        let allocator = unsafe {
            GpuAllocator::new(
                raw_instance,
                &device,
                adapter.physical_device,
                negotiated
                    .enabled
                    .features
                    .contains(DeviceFeatures::BUFFER_DEVICE_ADDRESS),
            )
        };
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(err) => {
                // SAFETY: nothing has been created from the device yet.
                unsafe { device.destroy_device(None) };
                return Err(err);
            }
        };

        let swapchain = negotiated
            .enabled
            .has_extension(ash::khr::swapchain::NAME)
            .then(|| ash::khr::swapchain::Device::new(raw_instance, &device));

        let descriptor_buffer = caps.descriptor_buffer.then(|| {
            let mut props = vk::PhysicalDeviceDescriptorBufferPropertiesEXT::default();
            {
                let mut properties2 = vk::PhysicalDeviceProperties2::default().push_next(&mut props);
                // SAFETY: the extension is enabled on this adapter.
                unsafe {
                    raw_instance
                        .get_physical_device_properties2(adapter.physical_device, &mut properties2);
                }
            }
            let sizes = DescriptorSizes {
                sampled_image: props.sampled_image_descriptor_size as u64,
                sampler: props.sampler_descriptor_size as u64,
            };
            (
                ash::ext::descriptor_buffer::Device::new(raw_instance, &device),
                sizes,
            )
        });

        let shader_object = caps
            .shader_object
            .then(|| ash::ext::shader_object::Device::new(raw_instance, &device));
        let host_image_copy = caps
            .host_image_copy
            .then(|| ash::ext::host_image_copy::Device::new(raw_instance, &device));

        Ok(Self {
            instance,
            surface,
            adapter,
            caps,
            device,
            allocator: Mutex::new(allocator),
            swapchain,
            descriptor_buffer,
            shader_object,
            host_image_copy,
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &Arc<InstanceBinding> {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.adapter.physical_device
    }

    /// The surface the device was negotiated against, if any.
    pub fn surface(&self) -> Option<&Arc<SurfaceContext>> {
        self.surface.as_ref()
    }

    /// Swapchain loader; present when presentation was required.
    pub fn swapchain_loader(&self) -> Option<&ash::khr::swapchain::Device> {
        self.swapchain.as_ref()
    }

    fn pipeline_flags(&self) -> vk::PipelineCreateFlags {
        if self.caps.descriptor_buffer {
            vk::PipelineCreateFlags::DESCRIPTOR_BUFFER_EXT
        } else {
            vk::PipelineCreateFlags::empty()
        }
    }

    fn shader_objects(&self) -> Option<&ash::ext::shader_object::Device> {
        self.shader_object.as_ref()
    }

    fn first_pipeline(
        &self,
        what: &str,
        result: std::result::Result<Vec<vk::Pipeline>, (Vec<vk::Pipeline>, vk::Result)>,
    ) -> Result<vk::Pipeline> {
        match result {
            Ok(pipelines) => pipelines
                .into_iter()
                .next()
                .ok_or_else(|| GpuError::PipelineCreation(format!("{what}: no pipeline returned"))),
            Err((pipelines, err)) => {
                for pipeline in pipelines.into_iter().filter(|p| *p != vk::Pipeline::null()) {
                    // SAFETY: partially created pipelines are unused.
                    unsafe { self.device.destroy_pipeline(pipeline, None) };
                }
                Err(GpuError::PipelineCreation(format!("{what}: {err}")))
            }
        }
    }

    /// Build a graphics pipeline or one library fragment of it.
    fn build_graphics(
        &self,
        parts: &GraphicsParts<'_>,
        library: Option<vk::GraphicsPipelineLibraryFlagsEXT>,
        layout: vk::PipelineLayout,
        what: &str,
    ) -> Result<vk::Pipeline> {
        let stages: Vec<vk::PipelineShaderStageCreateInfo> = parts
            .stages
            .iter()
            .map(|stage| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage.stage)
                    .module(stage.module)
                    .name(stage.entry)
            })
            .collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(parts.topology.unwrap_or(vk::PrimitiveTopology::TRIANGLE_LIST));
        // Viewport and scissor counts are dynamic.
        let viewport = vk::PipelineViewportStateCreateInfo::default();
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(parts.polygon_mode.unwrap_or(vk::PolygonMode::FILL))
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default();

        let (color_formats, depth_format, stencil_format, blend_mask) = match parts.output {
            Some(output) => (
                output.color_formats,
                output.depth_format,
                output.stencil_format,
                output.blend_mask,
            ),
            None => (&[][..], vk::Format::UNDEFINED, vk::Format::UNDEFINED, 0),
        };
        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = (0..color_formats
            .len())
            .map(|i| blend_attachment(blend_mask & (1 << i) != 0))
            .collect();
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let mut dynamic_states = Vec::new();
        if parts.polygon_mode.is_some() {
            dynamic_states.extend([
                vk::DynamicState::VIEWPORT_WITH_COUNT,
                vk::DynamicState::SCISSOR_WITH_COUNT,
                vk::DynamicState::CULL_MODE,
                vk::DynamicState::FRONT_FACE,
            ]);
        }
        if parts.fragment_state {
            dynamic_states.extend([
                vk::DynamicState::DEPTH_TEST_ENABLE,
                vk::DynamicState::DEPTH_WRITE_ENABLE,
                vk::DynamicState::DEPTH_COMPARE_OP,
            ]);
        }
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let mut rendering = vk::PipelineRenderingCreateInfo::default()
            .view_mask(parts.view_mask)
            .color_attachment_formats(color_formats)
            .depth_attachment_format(depth_format)
            .stencil_attachment_format(stencil_format);
        let mut library_info =
            vk::GraphicsPipelineLibraryCreateInfoEXT::default().flags(library.unwrap_or_default());

        let mut flags = self.pipeline_flags();
        let mut info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .layout(layout)
            .dynamic_state(&dynamic)
            .push_next(&mut rendering);
        if parts.topology.is_some() {
            info = info
                .vertex_input_state(&vertex_input)
                .input_assembly_state(&input_assembly);
        }
        if parts.polygon_mode.is_some() {
            info = info
                .viewport_state(&viewport)
                .rasterization_state(&rasterization);
        }
        if parts.fragment_state {
            info = info
                .depth_stencil_state(&depth_stencil)
                .multisample_state(&multisample);
        }
        if parts.output.is_some() {
            info = info
                .color_blend_state(&color_blend)
                .multisample_state(&multisample);
        }
        if library.is_some() {
            flags |= vk::PipelineCreateFlags::LIBRARY_KHR
                | vk::PipelineCreateFlags::RETAIN_LINK_TIME_OPTIMIZATION_INFO_EXT;
            info = info.push_next(&mut library_info);
        }
        info = info.flags(flags);

        // SAFETY: every structure referenced by `info` lives until the call returns.
        let result = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        };
        self.first_pipeline(what, result)
    }

    fn record_rendering(&self, cmd: vk::CommandBuffer, desc: &RenderingDesc<'_>) {
        let colors: Vec<vk::RenderingAttachmentInfo> = desc
            .colors
            .iter()
            .map(|color| {
                let (load_op, clear) = match color.load {
                    LoadOp::Load => (vk::AttachmentLoadOp::LOAD, vk::ClearValue::default()),
                    LoadOp::Clear(float32) => (
                        vk::AttachmentLoadOp::CLEAR,
                        vk::ClearValue {
                            color: vk::ClearColorValue { float32 },
                        },
                    ),
                    LoadOp::DontCare => {
                        (vk::AttachmentLoadOp::DONT_CARE, vk::ClearValue::default())
                    }
                };
                vk::RenderingAttachmentInfo::default()
                    .image_view(color.view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(load_op)
                    .store_op(store_op(color.store))
                    .clear_value(clear)
            })
            .collect();

        let depth = desc.depth.map(|depth| {
            let (load_op, value) = match depth.load {
                LoadOp::Load => (vk::AttachmentLoadOp::LOAD, 1.0),
                LoadOp::Clear(value) => (vk::AttachmentLoadOp::CLEAR, value),
                LoadOp::DontCare => (vk::AttachmentLoadOp::DONT_CARE, 1.0),
            };
            let layout = if has_stencil(depth.format) {
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            } else {
                vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
            };
            let attachment = vk::RenderingAttachmentInfo::default()
                .image_view(depth.view)
                .image_layout(layout)
                .load_op(load_op)
                .store_op(store_op(depth.store))
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: value,
                        stencil: 0,
                    },
                });
            (attachment, has_stencil(depth.format))
        });

        let mut info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: desc.extent,
            })
            .layer_count(1)
            .view_mask(desc.view_mask)
            .color_attachments(&colors);
        if let Some((attachment, stencil)) = &depth {
            info = info.depth_attachment(attachment);
            if *stencil {
                info = info.stencil_attachment(attachment);
            }
        }

        // SAFETY: the command buffer is recording.
        unsafe { self.device.cmd_begin_rendering(cmd, &info) };
    }

    fn record_graphics_state(&self, cmd: vk::CommandBuffer, state: &GraphicsState) {
        let Some(objects) = self.shader_objects() else {
            tracing::error!("Shader object state recorded without shader objects");
            return;
        };
        let count = state.color_formats.len();
        let enables: Vec<vk::Bool32> = (0..count)
            .map(|i| vk::Bool32::from(state.blend_mask & (1 << i) != 0))
            .collect();
        let equations = vec![blend_equation(); count];
        let masks = vec![vk::ColorComponentFlags::RGBA; count];

        // SAFETY: the command buffer is recording and the extension is enabled.
        unsafe {
            self.device.cmd_set_primitive_topology(cmd, state.topology);
            self.device.cmd_set_primitive_restart_enable(cmd, false);
            self.device.cmd_set_rasterizer_discard_enable(cmd, false);
            self.device.cmd_set_depth_bias_enable(cmd, false);
            self.device.cmd_set_depth_bounds_test_enable(cmd, false);
            self.device.cmd_set_stencil_test_enable(cmd, false);
            self.device.cmd_set_line_width(cmd, 1.0);
            objects.cmd_set_polygon_mode(cmd, state.polygon_mode);
            objects.cmd_set_rasterization_samples(cmd, vk::SampleCountFlags::TYPE_1);
            objects.cmd_set_sample_mask(cmd, vk::SampleCountFlags::TYPE_1, &[u32::MAX]);
            objects.cmd_set_alpha_to_coverage_enable(cmd, false);
            objects.cmd_set_vertex_input(cmd, &[], &[]);
            if count > 0 {
                objects.cmd_set_color_blend_enable(cmd, 0, &enables);
                objects.cmd_set_color_blend_equation(cmd, 0, &equations);
                objects.cmd_set_color_write_mask(cmd, 0, &masks);
            }
        }
    }

    fn record_dynamic_state(&self, cmd: vk::CommandBuffer, state: &DynamicState) {
        // SAFETY: the command buffer is recording.
        unsafe {
            self.device.cmd_set_cull_mode(cmd, state.cull_mode);
            self.device.cmd_set_front_face(cmd, state.front_face);
            self.device.cmd_set_depth_test_enable(cmd, state.depth_test);
            self.device.cmd_set_depth_write_enable(cmd, state.depth_write);
            self.device.cmd_set_depth_compare_op(cmd, state.depth_compare);
        }
    }

    fn record_barrier(&self, cmd: vk::CommandBuffer, barrier: &ImageBarrier) {
        let raw = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(barrier.src_stage)
            .src_access_mask(barrier.src_access)
            .dst_stage_mask(barrier.dst_stage)
            .dst_access_mask(barrier.dst_access)
            .old_layout(barrier.old_layout)
            .new_layout(barrier.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(barrier.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: barrier.aspect,
                base_mip_level: barrier.base_mip,
                level_count: barrier.mip_count,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            });
        let dependency =
            vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&raw));
        // SAFETY: the command buffer is recording.
        unsafe { self.device.cmd_pipeline_barrier2(cmd, &dependency) };
    }

    fn bind_heap(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        heap: &HeapResources,
    ) {
        match &heap.storage {
            HeapStorage::DescriptorSet { set, .. } => {
                // SAFETY: the command buffer is recording.
                unsafe {
                    self.device.cmd_bind_descriptor_sets(
                        cmd,
                        bind_point,
                        heap.pipeline_layout,
                        0,
                        &[*set],
                        &[],
                    );
                }
            }
            HeapStorage::DescriptorBuffer { buffer, .. } => {
                let Some((loader, _)) = &self.descriptor_buffer else {
                    tracing::error!("Descriptor buffer bound without the extension");
                    return;
                };
                let binding = vk::DescriptorBufferBindingInfoEXT::default()
                    .address(buffer.device_address)
                    .usage(
                        vk::BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER_EXT
                            | vk::BufferUsageFlags::SAMPLER_DESCRIPTOR_BUFFER_EXT,
                    );
                // SAFETY: the command buffer is recording.
                unsafe {
                    loader.cmd_bind_descriptor_buffers(cmd, std::slice::from_ref(&binding));
                    loader.cmd_set_descriptor_buffer_offsets(
                        cmd,
                        bind_point,
                        heap.pipeline_layout,
                        0,
                        &[0],
                        &[0],
                    );
                }
            }
        }
    }

    fn create_heap_storage(
        &self,
        desc: &HeapDesc,
        set_layout: vk::DescriptorSetLayout,
    ) -> Result<HeapStorage> {
        if let Some((loader, sizes)) = &self.descriptor_buffer {
            // SAFETY: the layout was created with the descriptor buffer flag.
            let (size, image_offset, sampler_offset) = unsafe {
                (
                    loader.get_descriptor_set_layout_size(set_layout),
                    loader.get_descriptor_set_layout_binding_offset(set_layout, HEAP_IMAGE_BINDING),
                    loader
                        .get_descriptor_set_layout_binding_offset(set_layout, HEAP_SAMPLER_BINDING),
                )
            };
            let buffer = self.create_buffer(&BufferDesc {
                name: "descriptor heap",
                size,
                usage: vk::BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER_EXT
                    | vk::BufferUsageFlags::SAMPLER_DESCRIPTOR_BUFFER_EXT
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                location: MemoryLocation::CpuToGpu,
            })?;
            return Ok(HeapStorage::DescriptorBuffer {
                buffer,
                image_offset,
                image_stride: sizes.sampled_image,
                sampler_offset,
                sampler_stride: sizes.sampler,
            });
        }

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: desc.image_capacity,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: desc.sampler_capacity,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        // SAFETY: the device is valid.
        let pool = unsafe { self.device.create_descriptor_pool(&pool_info, None) }
            .vk_context("vkCreateDescriptorPool")?;

        let layouts = [set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        // SAFETY: the pool was sized for exactly this set.
        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .vk_context("vkAllocateDescriptorSets");
        match sets.map(|sets| sets.into_iter().next()) {
            Ok(Some(set)) => Ok(HeapStorage::DescriptorSet { pool, set }),
            Ok(None) => {
                // SAFETY: the pool is unused.
                unsafe { self.device.destroy_descriptor_pool(pool, None) };
                Err(GpuError::InvalidState("no descriptor set allocated".to_string()))
            }
            Err(err) => {
                // SAFETY: the pool is unused.
                unsafe { self.device.destroy_descriptor_pool(pool, None) };
                Err(err)
            }
        }
    }
}

/// Which portions of a graphics pipeline to build.
struct GraphicsParts<'a> {
    topology: Option<vk::PrimitiveTopology>,
    stages: &'a [ShaderStageRef<'a>],
    polygon_mode: Option<vk::PolygonMode>,
    fragment_state: bool,
    output: Option<OutputParts<'a>>,
    view_mask: u32,
}

#[derive(Clone, Copy)]
struct OutputParts<'a> {
    color_formats: &'a [vk::Format],
    depth_format: vk::Format,
    stencil_format: vk::Format,
    blend_mask: u32,
}

fn store_op(store: bool) -> vk::AttachmentStoreOp {
    if store {
        vk::AttachmentStoreOp::STORE
    } else {
        vk::AttachmentStoreOp::DONT_CARE
    }
}

fn blend_attachment(enabled: bool) -> vk::PipelineColorBlendAttachmentState {
    let equation = blend_equation();
    vk::PipelineColorBlendAttachmentState::default()
        .blend_enable(enabled)
        .src_color_blend_factor(equation.src_color_blend_factor)
        .dst_color_blend_factor(equation.dst_color_blend_factor)
        .color_blend_op(equation.color_blend_op)
        .src_alpha_blend_factor(equation.src_alpha_blend_factor)
        .dst_alpha_blend_factor(equation.dst_alpha_blend_factor)
        .alpha_blend_op(equation.alpha_blend_op)
        .color_write_mask(vk::ColorComponentFlags::RGBA)
}

/// Premultiplied-style alpha blending used by every blended attachment.
fn blend_equation() -> vk::ColorBlendEquationEXT {
    vk::ColorBlendEquationEXT::default()
        .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
        .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(vk::BlendFactor::ONE)
        .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .alpha_blend_op(vk::BlendOp::ADD)
}

impl DeviceDriver for VulkanDevice {
    fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    fn caps(&self) -> RuntimeCaps {
        self.caps
    }

    fn queue(&self, family: u32, index: u32) -> vk::Queue {
        // SAFETY: the queue was requested at device creation.
        unsafe { self.device.get_device_queue(family, index) }
    }

    fn create_timeline(&self, initial_value: u64) -> Result<vk::Semaphore> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        // SAFETY: the device is valid.
        unsafe { self.device.create_semaphore(&info, None) }.vk_context("vkCreateSemaphore")
    }

    fn timeline_value(&self, semaphore: vk::Semaphore) -> Result<u64> {
        // SAFETY: the semaphore is a timeline of this device.
        unsafe { self.device.get_semaphore_counter_value(semaphore) }
            .vk_context("vkGetSemaphoreCounterValue")
    }

    fn wait_timeline(&self, semaphore: vk::Semaphore, value: u64, timeout_ns: u64) -> Result<bool> {
        let semaphores = [semaphore];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        // SAFETY: the semaphore is a timeline of this device.
        match unsafe { self.device.wait_semaphores(&info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(GpuError::vulkan("vkWaitSemaphores", err)),
        }
    }

    fn signal_timeline(&self, semaphore: vk::Semaphore, value: u64) -> Result<()> {
        let info = vk::SemaphoreSignalInfo::default()
            .semaphore(semaphore)
            .value(value);
        // SAFETY: the semaphore is a timeline of this device.
        unsafe { self.device.signal_semaphore(&info) }.vk_context("vkSignalSemaphore")
    }

    fn create_binary_semaphore(&self) -> Result<vk::Semaphore> {
        // SAFETY: the device is valid.
        unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
        .vk_context("vkCreateSemaphore")
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        // SAFETY: callers only destroy semaphores no pending work references.
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_command_pool(&self, family: u32) -> Result<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        // SAFETY: the device is valid.
        unsafe { self.device.create_command_pool(&info, None) }.vk_context("vkCreateCommandPool")
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        // SAFETY: the pool is externally synchronized by its checkout.
        unsafe { self.device.allocate_command_buffers(&info) }
            .vk_context("vkAllocateCommandBuffers")?
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::InvalidState("no command buffer allocated".to_string()))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: none of the pool's buffers are pending.
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        // SAFETY: the buffer is available; beginning implicitly resets it.
        unsafe { self.device.begin_command_buffer(cmd, &info) }.vk_context("vkBeginCommandBuffer")
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        // SAFETY: the buffer is recording.
        unsafe { self.device.end_command_buffer(cmd) }.vk_context("vkEndCommandBuffer")
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn record(&self, cmd: vk::CommandBuffer, command: &Command<'_>) {
        let device = &self.device;
        // SAFETY: command lists only record between begin and end.
        unsafe {
            match *command {
                Command::BindDescriptorHeap { bind_point, heap } => {
                    self.bind_heap(cmd, bind_point, heap);
                }
                Command::BindPipeline {
                    bind_point,
                    pipeline,
                } => device.cmd_bind_pipeline(cmd, bind_point, pipeline),
                Command::BindShaders { stages, shaders } => match self.shader_objects() {
                    Some(objects) => objects.cmd_bind_shaders(cmd, stages, shaders),
                    None => tracing::error!("Shader objects bound without the extension"),
                },
                Command::SetGraphicsState(state) => self.record_graphics_state(cmd, state),
                Command::SetDynamicState(state) => self.record_dynamic_state(cmd, state),
                Command::BeginRendering(desc) => self.record_rendering(cmd, desc),
                Command::EndRendering => device.cmd_end_rendering(cmd),
                Command::SetViewport(extent) => {
                    let viewport = vk::Viewport {
                        x: 0.0,
                        y: 0.0,
                        width: extent.width as f32,
                        height: extent.height as f32,
                        min_depth: 0.0,
                        max_depth: 1.0,
                    };
                    let scissor = vk::Rect2D {
                        offset: vk::Offset2D::default(),
                        extent,
                    };
                    device.cmd_set_viewport_with_count(cmd, &[viewport]);
                    device.cmd_set_scissor_with_count(cmd, &[scissor]);
                }
                Command::PushConstants {
                    layout,
                    offset,
                    data,
                } => device.cmd_push_constants(cmd, layout, vk::ShaderStageFlags::ALL, offset, data),
                Command::Draw {
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                } => device.cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance),
                Command::Dispatch([x, y, z]) => device.cmd_dispatch(cmd, x, y, z),
                Command::ImageBarrier(barrier) => self.record_barrier(cmd, barrier),
                Command::CopyBuffer { src, dst, regions } => {
                    device.cmd_copy_buffer(cmd, src, dst, regions);
                }
                Command::CopyBufferToImage { src, dst, regions } => device.cmd_copy_buffer_to_image(
                    cmd,
                    src,
                    dst,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    regions,
                ),
                Command::BlitMip {
                    image,
                    src_mip,
                    src_extent,
                    dst_extent,
                } => {
                    let layers = |mip_level| vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level,
                        base_array_layer: 0,
                        layer_count: 1,
                    };
                    let corner = |extent: vk::Extent2D| vk::Offset3D {
                        x: extent.width as i32,
                        y: extent.height as i32,
                        z: 1,
                    };
                    let blit = vk::ImageBlit {
                        src_subresource: layers(src_mip),
                        src_offsets: [vk::Offset3D::default(), corner(src_extent)],
                        dst_subresource: layers(src_mip + 1),
                        dst_offsets: [vk::Offset3D::default(), corner(dst_extent)],
                    };
                    device.cmd_blit_image(
                        cmd,
                        image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[blit],
                        vk::Filter::LINEAR,
                    );
                }
            }
        }
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn submit(&self, queue: vk::Queue, batch: &SubmitBatch<'_>) -> Result<()> {
        let mut waits: Vec<vk::SemaphoreSubmitInfo> = batch
            .waits
            .iter()
            .map(|wait| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(wait.semaphore)
                    .value(wait.value)
                    .stage_mask(wait.stages)
            })
            .collect();
        waits.extend(batch.binary_waits.iter().map(|(semaphore, stages)| {
            vk::SemaphoreSubmitInfo::default()
                .semaphore(*semaphore)
                .stage_mask(*stages)
        }));

        let mut signals = vec![vk::SemaphoreSubmitInfo::default()
            .semaphore(batch.signal)
            .value(batch.signal_value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        signals.extend(batch.binary_signals.iter().map(|semaphore| {
            vk::SemaphoreSubmitInfo::default()
                .semaphore(*semaphore)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        }));

        let command_buffers: Vec<vk::CommandBufferSubmitInfo> = batch
            .command_buffers
            .iter()
            .map(|cmd| vk::CommandBufferSubmitInfo::default().command_buffer(*cmd))
            .collect();

        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(&command_buffers)
            .signal_semaphore_infos(&signals);

        // SAFETY: the queue is externally synchronized by the per-queue submit lock.
        unsafe {
            self.device
                .queue_submit2(queue, std::slice::from_ref(&submit), vk::Fence::null())
        }
        .vk_context("vkQueueSubmit2")
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()> {
        // SAFETY: the queue belongs to this device.
        unsafe { self.device.queue_wait_idle(queue) }.vk_context("vkQueueWaitIdle")
    }

    fn wait_idle(&self) -> Result<()> {
        // SAFETY: the device is valid.
        unsafe { self.device.device_wait_idle() }.vk_context("vkDeviceWaitIdle")
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<BufferAllocation> {
        let info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        // SAFETY: the device is valid.
        let raw = unsafe { self.device.create_buffer(&info, None) }.vk_context("vkCreateBuffer")?;
        // SAFETY: the buffer was just created.
        let requirements = unsafe { self.device.get_buffer_memory_requirements(raw) };

        let allocation = self
            .allocator
            .lock()
            .allocate(desc.name, requirements, desc.location, true);
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                // SAFETY: the buffer has no memory bound.
                unsafe { self.device.destroy_buffer(raw, None) };
                return Err(err);
            }
        };

        // SAFETY: the allocation satisfies the buffer's requirements.
        let bound = unsafe {
            self.device
                .bind_buffer_memory(raw, allocation.memory(), allocation.offset())
        }
        .vk_context("vkBindBufferMemory");
        if let Err(err) = bound {
            // SAFETY: the buffer is unused.
            unsafe { self.device.destroy_buffer(raw, None) };
            let _ = self.allocator.lock().free(allocation);
            return Err(err);
        }

        let device_address = if desc
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
        {
            let info = vk::BufferDeviceAddressInfo::default().buffer(raw);
            // SAFETY: the buffer has memory bound.
            unsafe { self.device.get_buffer_device_address(&info) }
        } else {
            0
        };

        let mapped = allocation.mapped_ptr().map(NonNull::cast::<u8>);
        Ok(BufferAllocation {
            raw,
            size: desc.size,
            location: desc.location,
            device_address,
            mapped,
            allocation: Some(allocation),
        })
    }

    fn destroy_buffer(&self, buffer: BufferAllocation) -> Result<()> {
        // SAFETY: deferred destruction guarantees the GPU is done with it.
        unsafe { self.device.destroy_buffer(buffer.raw, None) };
        match buffer.allocation {
            Some(allocation) => self.allocator.lock().free(allocation),
            None => Ok(()),
        }
    }

    fn create_image(&self, desc: &ImageDesc<'_>) -> Result<ImageAllocation> {
        let mip_levels = desc.mip_levels.max(1);
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        // SAFETY: the device is valid.
        let raw = unsafe { self.device.create_image(&info, None) }.vk_context("vkCreateImage")?;
        // SAFETY: the image was just created.
        let requirements = unsafe { self.device.get_image_memory_requirements(raw) };

        let allocation =
            self.allocator
                .lock()
                .allocate(desc.name, requirements, MemoryLocation::GpuOnly, false);
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                // SAFETY: the image has no memory bound.
                unsafe { self.device.destroy_image(raw, None) };
                return Err(err);
            }
        };

        let cleanup = |allocation| {
            // SAFETY: the image is unused.
            unsafe { self.device.destroy_image(raw, None) };
            let _ = self.allocator.lock().free(allocation);
        };

        // SAFETY: the allocation satisfies the image's requirements.
        if let Err(err) = unsafe {
            self.device
                .bind_image_memory(raw, allocation.memory(), allocation.offset())
        }
        .vk_context("vkBindImageMemory")
        {
            cleanup(allocation);
            return Err(err);
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(raw)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: format_aspect(desc.format),
                base_mip_level: 0,
                level_count: mip_levels,
                base_array_layer: 0,
                layer_count: 1,
            });
        // SAFETY: the image has memory bound.
        let view = match unsafe { self.device.create_image_view(&view_info, None) }
            .vk_context("vkCreateImageView")
        {
            Ok(view) => view,
            Err(err) => {
                cleanup(allocation);
                return Err(err);
            }
        };

        Ok(ImageAllocation {
            raw,
            view,
            format: desc.format,
            extent: desc.extent,
            mip_levels,
            usage: desc.usage,
            size: requirements.size,
            allocation: Some(allocation),
        })
    }

    fn destroy_image(&self, image: ImageAllocation) -> Result<()> {
        // SAFETY: deferred destruction guarantees the GPU is done with it.
        unsafe {
            self.device.destroy_image_view(image.view, None);
            self.device.destroy_image(image.raw, None);
        }
        match image.allocation {
            Some(allocation) => self.allocator.lock().free(allocation),
            None => Ok(()),
        }
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler> {
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(desc.filter)
            .min_filter(desc.filter)
            .mipmap_mode(desc.mipmap_mode)
            .address_mode_u(desc.address_mode)
            .address_mode_v(desc.address_mode)
            .address_mode_w(desc.address_mode)
            .anisotropy_enable(desc.max_anisotropy.is_some())
            .max_anisotropy(desc.max_anisotropy.unwrap_or(1.0))
            .max_lod(vk::LOD_CLAMP_NONE);
        // SAFETY: the device is valid.
        unsafe { self.device.create_sampler(&info, None) }.vk_context("vkCreateSampler")
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        // SAFETY: deferred destruction guarantees the GPU is done with it.
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    fn copy_memory_to_image(&self, image: &ImageAllocation, data: &[u8]) -> Result<()> {
        let loader = self.host_image_copy.as_ref().ok_or_else(|| {
            GpuError::InvalidState("host image copy used without the capability".to_string())
        })?;

        let transition = vk::HostImageLayoutTransitionInfoEXT::default()
            .image(image.raw)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: image.mip_levels,
                base_array_layer: 0,
                layer_count: 1,
            });
        let region = vk::MemoryToImageCopyEXT::default()
            .host_pointer(data.as_ptr().cast())
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_extent(vk::Extent3D {
                width: image.extent.width,
                height: image.extent.height,
                depth: 1,
            });
        let info = vk::CopyMemoryToImageInfoEXT::default()
            .dst_image(image.raw)
            .dst_image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .regions(std::slice::from_ref(&region));

        // SAFETY: the image was created with HOST_TRANSFER usage and the
        // caller checked `data` covers mip 0.
        unsafe {
            loader
                .transition_image_layout(std::slice::from_ref(&transition))
                .vk_context("vkTransitionImageLayoutEXT")?;
            loader
                .copy_memory_to_image(&info)
                .vk_context("vkCopyMemoryToImageEXT")
        }
    }

    fn create_descriptor_heap(&self, desc: &HeapDesc) -> Result<HeapResources> {
        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(HEAP_IMAGE_BINDING)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(desc.image_capacity)
                .stage_flags(vk::ShaderStageFlags::ALL),
            vk::DescriptorSetLayoutBinding::default()
                .binding(HEAP_SAMPLER_BINDING)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .descriptor_count(desc.sampler_capacity)
                .stage_flags(vk::ShaderStageFlags::ALL),
        ];
        let (layout_flags, binding_flags) = if self.descriptor_buffer.is_some() {
            (
                vk::DescriptorSetLayoutCreateFlags::DESCRIPTOR_BUFFER_EXT,
                vk::DescriptorBindingFlags::PARTIALLY_BOUND,
            )
        } else {
            (
                vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL,
                vk::DescriptorBindingFlags::PARTIALLY_BOUND
                    | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND,
            )
        };
        let binding_flags = [binding_flags; 2];
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(layout_flags)
            .bindings(&bindings)
            .push_next(&mut flags_info);
        // SAFETY: the device is valid.
        let set_layout = unsafe { self.device.create_descriptor_set_layout(&layout_info, None) }
            .vk_context("vkCreateDescriptorSetLayout")?;

        let set_layouts = [set_layout];
        let ranges = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::ALL,
            offset: 0,
            size: desc.push_constant_size,
        }];
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&ranges);
        // SAFETY: the set layout was just created.
        let pipeline_layout =
            match unsafe { self.device.create_pipeline_layout(&pipeline_layout_info, None) }
                .vk_context("vkCreatePipelineLayout")
            {
                Ok(layout) => layout,
                Err(err) => {
                    // SAFETY: the set layout is unused.
                    unsafe { self.device.destroy_descriptor_set_layout(set_layout, None) };
                    return Err(err);
                }
            };

        match self.create_heap_storage(desc, set_layout) {
            Ok(storage) => Ok(HeapResources {
                set_layout,
                pipeline_layout,
                push_constant_size: desc.push_constant_size,
                storage,
            }),
            Err(err) => {
                // SAFETY: neither layout is in use.
                unsafe {
                    self.device.destroy_pipeline_layout(pipeline_layout, None);
                    self.device.destroy_descriptor_set_layout(set_layout, None);
                }
                Err(err)
            }
        }
    }

    fn write_descriptor(&self, heap: &HeapResources, write: &DescriptorWrite) {
        match &heap.storage {
            HeapStorage::DescriptorSet { set, .. } => {
                let (binding, ty, image_info) = match *write {
                    DescriptorWrite::Image { index, view, layout } => (
                        (HEAP_IMAGE_BINDING, index),
                        vk::DescriptorType::SAMPLED_IMAGE,
                        vk::DescriptorImageInfo::default()
                            .image_view(view)
                            .image_layout(layout),
                    ),
                    DescriptorWrite::Sampler { index, sampler } => (
                        (HEAP_SAMPLER_BINDING, index),
                        vk::DescriptorType::SAMPLER,
                        vk::DescriptorImageInfo::default().sampler(sampler),
                    ),
                };
                let raw = vk::WriteDescriptorSet::default()
                    .dst_set(*set)
                    .dst_binding(binding.0)
                    .dst_array_element(binding.1)
                    .descriptor_type(ty)
                    .image_info(std::slice::from_ref(&image_info));
                // SAFETY: update-after-bind lets slots change while bound;
                // the heap serializes writers.
                unsafe { self.device.update_descriptor_sets(&[raw], &[]) };
            }
            HeapStorage::DescriptorBuffer {
                buffer,
                image_offset,
                image_stride,
                sampler_offset,
                sampler_stride,
            } => {
                let (Some((loader, _)), Some(mapped)) = (&self.descriptor_buffer, buffer.mapped)
                else {
                    tracing::error!("Descriptor buffer is not host-visible");
                    return;
                };
                let image_info;
                let sampler;
                let (offset, stride, info) = match *write {
                    DescriptorWrite::Image { index, view, layout } => {
                        image_info = vk::DescriptorImageInfo::default()
                            .image_view(view)
                            .image_layout(layout);
                        (
                            image_offset + u64::from(index) * image_stride,
                            *image_stride,
                            vk::DescriptorGetInfoEXT::default()
                                .ty(vk::DescriptorType::SAMPLED_IMAGE)
                                .data(vk::DescriptorDataEXT {
                                    p_sampled_image: &image_info,
                                }),
                        )
                    }
                    DescriptorWrite::Sampler {
                        index,
                        sampler: raw,
                    } => {
                        sampler = raw;
                        (
                            sampler_offset + u64::from(index) * sampler_stride,
                            *sampler_stride,
                            vk::DescriptorGetInfoEXT::default()
                                .ty(vk::DescriptorType::SAMPLER)
                                .data(vk::DescriptorDataEXT {
                                    p_sampler: &sampler,
                                }),
                        )
                    }
                };
                if offset + stride > buffer.size {
                    tracing::error!("Descriptor write at {offset} exceeds the heap buffer");
                    return;
                }
                // SAFETY: the range lies inside the persistently mapped heap
                // buffer and the heap serializes writers.
                unsafe {
                    let slot = std::slice::from_raw_parts_mut(
                        mapped.as_ptr().add(offset as usize),
                        stride as usize,
                    );
                    loader.get_descriptor(&info, slot);
                }
            }
        }
    }

    fn destroy_descriptor_heap(&self, heap: HeapResources) {
        // SAFETY: the heap is destroyed after all queues are idle.
        unsafe {
            self.device.destroy_pipeline_layout(heap.pipeline_layout, None);
            self.device
                .destroy_descriptor_set_layout(heap.set_layout, None);
        }
        match heap.storage {
            HeapStorage::DescriptorSet { pool, .. } => {
                // SAFETY: as above; the set is freed with its pool.
                unsafe { self.device.destroy_descriptor_pool(pool, None) };
            }
            HeapStorage::DescriptorBuffer { buffer, .. } => {
                if let Err(err) = self.destroy_buffer(buffer) {
                    tracing::error!("Failed to free descriptor heap buffer: {err}");
                }
            }
        }
    }

    fn create_shader(&self, desc: &ShaderDesc<'_>) -> Result<ShaderHandles> {
        let module_info = vk::ShaderModuleCreateInfo::default().code(desc.code);
        // SAFETY: the device is valid.
        let module = unsafe { self.device.create_shader_module(&module_info, None) }
            .map_err(|e| GpuError::ShaderCompilation(format!("{:?} module: {e}", desc.stage)))?;

        let objects = match self.shader_objects() {
            Some(objects) if desc.create_object => objects,
            _ => {
                return Ok(ShaderHandles {
                    module,
                    object: vk::ShaderEXT::null(),
                })
            }
        };

        let set_layouts = [desc.set_layout];
        let ranges = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::ALL,
            offset: 0,
            size: desc.push_constant_size,
        }];
        let info = vk::ShaderCreateInfoEXT::default()
            .stage(desc.stage)
            .next_stage(next_stages(desc.stage))
            .code_type(vk::ShaderCodeTypeEXT::SPIRV)
            .code(bytemuck::cast_slice(desc.code))
            .name(desc.entry)
            .set_layouts(&set_layouts)
            .push_constant_ranges(&ranges);

        // SAFETY: every structure referenced by `info` outlives the call.
        match unsafe { objects.create_shaders(std::slice::from_ref(&info), None) } {
            Ok(created) => match created.into_iter().next() {
                Some(object) => Ok(ShaderHandles { module, object }),
                None => {
                    // SAFETY: the module is unused.
                    unsafe { self.device.destroy_shader_module(module, None) };
                    Err(GpuError::ShaderCompilation(format!(
                        "{:?} shader object was not created",
                        desc.stage
                    )))
                }
            },
            Err((partial, err)) => {
                // SAFETY: nothing references the partial results yet.
                unsafe {
                    for object in partial.into_iter().filter(|o| *o != vk::ShaderEXT::null()) {
                        objects.destroy_shader(object, None);
                    }
                    self.device.destroy_shader_module(module, None);
                }
                Err(GpuError::ShaderCompilation(format!(
                    "{:?} shader object: {err}",
                    desc.stage
                )))
            }
        }
    }

    fn destroy_shader(&self, shader: ShaderHandles) {
        // SAFETY: shaders are destroyed after all queues are idle.
        unsafe {
            if let Some(objects) = self.shader_objects() {
                if shader.object != vk::ShaderEXT::null() {
                    objects.destroy_shader(shader.object, None);
                }
            }
            self.device.destroy_shader_module(shader.module, None);
        }
    }

    fn create_pipeline_fragment(
        &self,
        fragment: &PipelineFragment<'_>,
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline> {
        type Library = vk::GraphicsPipelineLibraryFlagsEXT;
        let fragment_stage;
        let (parts, library) = match *fragment {
            PipelineFragment::VertexInput { topology } => (
                GraphicsParts {
                    topology: Some(topology),
                    stages: &[],
                    polygon_mode: None,
                    fragment_state: false,
                    output: None,
                    view_mask: 0,
                },
                Library::VERTEX_INPUT_INTERFACE,
            ),
            PipelineFragment::PreRasterization {
                stages,
                polygon_mode,
                view_mask,
            } => (
                GraphicsParts {
                    topology: None,
                    stages,
                    polygon_mode: Some(polygon_mode),
                    fragment_state: false,
                    output: None,
                    view_mask,
                },
                Library::PRE_RASTERIZATION_SHADERS,
            ),
            PipelineFragment::FragmentShader { stage, view_mask } => {
                fragment_stage = stage;
                (
                    GraphicsParts {
                        topology: None,
                        stages: fragment_stage.as_slice(),
                        polygon_mode: None,
                        fragment_state: true,
                        output: None,
                        view_mask,
                    },
                    Library::FRAGMENT_SHADER,
                )
            }
            PipelineFragment::FragmentOutput {
                color_formats,
                depth_format,
                stencil_format,
                blend_mask,
                view_mask,
            } => (
                GraphicsParts {
                    topology: None,
                    stages: &[],
                    polygon_mode: None,
                    fragment_state: false,
                    output: Some(OutputParts {
                        color_formats,
                        depth_format,
                        stencil_format,
                        blend_mask,
                    }),
                    view_mask,
                },
                Library::FRAGMENT_OUTPUT_INTERFACE,
            ),
        };
        self.build_graphics(&parts, Some(library), layout, fragment.kind())
    }

    fn link_pipeline(
        &self,
        fragments: &[vk::Pipeline],
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline> {
        let mut library_info = vk::PipelineLibraryCreateInfoKHR::default().libraries(fragments);
        let info = vk::GraphicsPipelineCreateInfo::default()
            .flags(self.pipeline_flags() | vk::PipelineCreateFlags::LINK_TIME_OPTIMIZATION_EXT)
            .layout(layout)
            .push_next(&mut library_info);
        // SAFETY: the fragments are live libraries created with the same layout.
        let result = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        };
        self.first_pipeline("linked pipeline", result)
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc<'_>,
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline> {
        let state = desc.state;
        let parts = GraphicsParts {
            topology: Some(state.topology),
            stages: desc.stages,
            polygon_mode: Some(state.polygon_mode),
            fragment_state: true,
            output: Some(OutputParts {
                color_formats: state.color_formats.as_slice(),
                depth_format: state.depth_format,
                stencil_format: state.stencil_format,
                blend_mask: state.blend_mask,
            }),
            view_mask: state.view_mask,
        };
        self.build_graphics(&parts, None, layout, "graphics pipeline")
    }

    fn create_compute_pipeline(
        &self,
        stage: &ShaderStageRef<'_>,
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline> {
        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(stage.stage)
            .module(stage.module)
            .name(stage.entry);
        let info = vk::ComputePipelineCreateInfo::default()
            .flags(self.pipeline_flags())
            .stage(stage_info)
            .layout(layout);
        // SAFETY: the module and layout are live.
        let result = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
        };
        self.first_pipeline("compute pipeline", result)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        // SAFETY: pipelines are destroyed after all queues are idle.
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn vulkan(&self) -> Option<&VulkanDevice> {
        Some(self)
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        // SAFETY: every runtime object holding the driver has been dropped,
        // so nothing else uses the device.
        unsafe {
            let _ = self.device.device_wait_idle();

            // Frees all VkDeviceMemory, so it must precede device destruction.
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
        }
    }
}

impl std::fmt::Debug for VulkanDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDevice")
            .field("adapter", &self.adapter.name)
            .field("caps", &self.caps)
            .finish_non_exhaustive()
    }
}
