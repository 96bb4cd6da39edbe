//! Device feature structure chain.
//!
//! One [`FeatureChain`] is used to query what a physical device supports and a
//! fresh one to enable the negotiated subset at device creation. Extension
//! structures are only linked when their extension is present, so older
//! drivers never see structure types they do not know.

use crate::capabilities::DeviceFeatures;
use ash::vk;

/// Owned feature structures, linked on demand.
#[derive(Default)]
pub struct FeatureChain {
    pub core: vk::PhysicalDeviceFeatures,
    pub v11: vk::PhysicalDeviceVulkan11Features<'static>,
    pub v12: vk::PhysicalDeviceVulkan12Features<'static>,
    pub v13: vk::PhysicalDeviceVulkan13Features<'static>,
    pub descriptor_buffer: vk::PhysicalDeviceDescriptorBufferFeaturesEXT<'static>,
    pub pipeline_library: vk::PhysicalDeviceGraphicsPipelineLibraryFeaturesEXT<'static>,
    pub host_image_copy: vk::PhysicalDeviceHostImageCopyFeaturesEXT<'static>,
    pub shader_object: vk::PhysicalDeviceShaderObjectFeaturesEXT<'static>,
}

/// Which extension structures to link.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainExtensions {
    pub descriptor_buffer: bool,
    pub pipeline_library: bool,
    pub host_image_copy: bool,
    pub shader_object: bool,
}

impl FeatureChain {
    /// Query the supported features of `physical_device`.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        extensions: ChainExtensions,
    ) -> Self {
        let mut chain = Self::default();
        let core = {
            let mut features2 = chain.link(extensions);
            instance.get_physical_device_features2(physical_device, &mut features2);
            features2.features
        };
        chain.core = core;
        chain
    }

    /// Build a chain enabling exactly `features`.
    pub fn enabling(features: DeviceFeatures) -> Self {
        let on = |flag| vk::Bool32::from(features.contains(flag));
        let mut chain = Self::default();

        chain.core.geometry_shader = on(DeviceFeatures::GEOMETRY_SHADER);
        chain.core.tessellation_shader = on(DeviceFeatures::TESSELLATION_SHADER);
        chain.core.sampler_anisotropy = vk::TRUE;

        chain.v11.multiview = on(DeviceFeatures::MULTIVIEW);

        chain.v12.timeline_semaphore = on(DeviceFeatures::TIMELINE_SEMAPHORE);
        chain.v12.buffer_device_address = on(DeviceFeatures::BUFFER_DEVICE_ADDRESS);
        chain.v12.descriptor_indexing = on(DeviceFeatures::DESCRIPTOR_INDEXING);
        chain.v12.runtime_descriptor_array = on(DeviceFeatures::RUNTIME_DESCRIPTOR_ARRAY);
        chain.v12.descriptor_binding_partially_bound = on(DeviceFeatures::PARTIALLY_BOUND);
        chain.v12.descriptor_binding_sampled_image_update_after_bind =
            on(DeviceFeatures::SAMPLED_IMAGE_UPDATE_AFTER_BIND);
        chain.v12.shader_sampled_image_array_non_uniform_indexing =
            on(DeviceFeatures::NON_UNIFORM_INDEXING);
        chain.v12.scalar_block_layout = on(DeviceFeatures::SCALAR_BLOCK_LAYOUT);

        chain.v13.dynamic_rendering = on(DeviceFeatures::DYNAMIC_RENDERING);
        chain.v13.synchronization2 = on(DeviceFeatures::SYNCHRONIZATION_2);
        chain.v13.maintenance4 = on(DeviceFeatures::MAINTENANCE_4);

        chain.descriptor_buffer.descriptor_buffer = on(DeviceFeatures::DESCRIPTOR_BUFFER);
        chain.pipeline_library.graphics_pipeline_library =
            on(DeviceFeatures::GRAPHICS_PIPELINE_LIBRARY);
        chain.host_image_copy.host_image_copy = on(DeviceFeatures::HOST_IMAGE_COPY);
        chain.shader_object.shader_object = on(DeviceFeatures::SHADER_OBJECT);
        chain
    }

    /// Collapse the chain into feature bits.
    pub fn supported(&self) -> DeviceFeatures {
        let pairs = [
            (self.v12.timeline_semaphore, DeviceFeatures::TIMELINE_SEMAPHORE),
            (self.v12.buffer_device_address, DeviceFeatures::BUFFER_DEVICE_ADDRESS),
            (self.v12.descriptor_indexing, DeviceFeatures::DESCRIPTOR_INDEXING),
            (self.v12.runtime_descriptor_array, DeviceFeatures::RUNTIME_DESCRIPTOR_ARRAY),
            (
                self.v12.descriptor_binding_partially_bound,
                DeviceFeatures::PARTIALLY_BOUND,
            ),
            (
                self.v12.descriptor_binding_sampled_image_update_after_bind,
                DeviceFeatures::SAMPLED_IMAGE_UPDATE_AFTER_BIND,
            ),
            (
                self.v12.shader_sampled_image_array_non_uniform_indexing,
                DeviceFeatures::NON_UNIFORM_INDEXING,
            ),
            (self.v12.scalar_block_layout, DeviceFeatures::SCALAR_BLOCK_LAYOUT),
            (self.v13.dynamic_rendering, DeviceFeatures::DYNAMIC_RENDERING),
            (self.v13.synchronization2, DeviceFeatures::SYNCHRONIZATION_2),
            (self.v13.maintenance4, DeviceFeatures::MAINTENANCE_4),
            (self.v11.multiview, DeviceFeatures::MULTIVIEW),
            (
                self.descriptor_buffer.descriptor_buffer,
                DeviceFeatures::DESCRIPTOR_BUFFER,
            ),
            (
                self.pipeline_library.graphics_pipeline_library,
                DeviceFeatures::GRAPHICS_PIPELINE_LIBRARY,
            ),
            (self.host_image_copy.host_image_copy, DeviceFeatures::HOST_IMAGE_COPY),
            (self.shader_object.shader_object, DeviceFeatures::SHADER_OBJECT),
            (self.core.geometry_shader, DeviceFeatures::GEOMETRY_SHADER),
            (self.core.tessellation_shader, DeviceFeatures::TESSELLATION_SHADER),
        ];

        pairs
            .into_iter()
            .filter(|(value, _)| *value == vk::TRUE)
            .fold(DeviceFeatures::empty(), |acc, (_, flag)| acc | flag)
    }

    /// Link the structures into a `VkPhysicalDeviceFeatures2` chain.
    pub fn link(&mut self, extensions: ChainExtensions) -> vk::PhysicalDeviceFeatures2<'_> {
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .features(self.core)
            .push_next(&mut self.v11)
            .push_next(&mut self.v12)
            .push_next(&mut self.v13);
        if extensions.descriptor_buffer {
            features2 = features2.push_next(&mut self.descriptor_buffer);
        }
        if extensions.pipeline_library {
            features2 = features2.push_next(&mut self.pipeline_library);
        }
        if extensions.host_image_copy {
            features2 = features2.push_next(&mut self.host_image_copy);
        }
        if extensions.shader_object {
            features2 = features2.push_next(&mut self.shader_object);
        }
        features2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabling_round_trips_through_supported() {
        let wanted = DeviceFeatures::TIMELINE_SEMAPHORE
            | DeviceFeatures::DYNAMIC_RENDERING
            | DeviceFeatures::SHADER_OBJECT;
        assert_eq!(FeatureChain::enabling(wanted).supported(), wanted);
    }
}
