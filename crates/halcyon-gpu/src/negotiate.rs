//! Capability negotiation.
//!
//! Runs once at context creation: picks the physical device, checks required
//! extensions and features, enables optional groups all-or-nothing, and plans
//! which hardware queues to create.

use crate::capabilities::{AdapterInfo, DeviceFeatures, RuntimeCaps};
use crate::error::{GpuError, Result};
use crate::queue::QueueKind;
use ash::vk;
use std::ffi::CStr;

/// Minimum Vulkan version the runtime targets.
pub const MIN_API_VERSION: u32 = vk::API_VERSION_1_3;

/// One item that must be present on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// A device extension, by name.
    Extension(&'static CStr),
    /// One or more device feature bits.
    Feature(DeviceFeatures),
    /// A minimum driver API version.
    ApiVersion(u32),
}

impl Requirement {
    /// Whether the adapter supports this item.
    pub fn is_supported(&self, adapter: &AdapterInfo) -> bool {
        match *self {
            Self::Extension(name) => adapter.supports_extension(name),
            Self::Feature(feature) => adapter.supports_feature(feature),
            Self::ApiVersion(version) => adapter.api_version >= version,
        }
    }

    /// Name used in diagnostics and errors.
    pub fn name(&self) -> String {
        match *self {
            Self::Extension(name) => name.to_string_lossy().into_owned(),
            Self::Feature(feature) => format!("feature {}", feature.name()),
            Self::ApiVersion(version) => format!(
                "Vulkan {}.{}",
                vk::api_version_major(version),
                vk::api_version_minor(version)
            ),
        }
    }
}

/// Runtime switch controlled by an optional group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    DescriptorBuffer,
    GraphicsPipelineLibrary,
    HostImageCopy,
    ShaderObject,
    Multiview,
}

impl Capability {
    fn set(self, caps: &mut RuntimeCaps) {
        match self {
            Self::DescriptorBuffer => caps.descriptor_buffer = true,
            Self::GraphicsPipelineLibrary => caps.graphics_pipeline_library = true,
            Self::HostImageCopy => caps.host_image_copy = true,
            Self::ShaderObject => caps.shader_object = true,
            Self::Multiview => caps.multiview = true,
        }
    }
}

/// Items enabled together or not at all.
#[derive(Debug, Clone)]
pub struct OptionalGroup {
    pub name: &'static str,
    pub members: Vec<Requirement>,
    pub capability: Option<Capability>,
}

/// Accumulated extensions and feature bits to enable at device creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnableChain {
    pub extensions: Vec<&'static CStr>,
    pub features: DeviceFeatures,
    pub api_version: u32,
}

impl EnableChain {
    fn add(&mut self, item: Requirement) {
        match item {
            Requirement::Extension(name) => {
                if !self.extensions.contains(&name) {
                    self.extensions.push(name);
                }
            }
            Requirement::Feature(feature) => self.features |= feature,
            Requirement::ApiVersion(version) => self.api_version = self.api_version.max(version),
        }
    }

    /// Whether the extension was enabled.
    pub fn has_extension(&self, name: &CStr) -> bool {
        self.extensions.iter().any(|ext| *ext == name)
    }
}

/// Hardware queues to create for one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRole {
    pub kind: QueueKind,
    pub family: u32,
    pub count: u32,
}

/// Outcome of negotiation against one adapter.
#[derive(Debug, Clone)]
pub struct NegotiatedDevice {
    /// Index into the adapter list passed to [`CapabilityNegotiator::negotiate`].
    pub adapter_index: usize,
    pub enabled: EnableChain,
    pub caps: RuntimeCaps,
    pub queues: Vec<QueueRole>,
}

impl NegotiatedDevice {
    /// The planned role for `kind`, if the device has a family for it.
    pub fn role(&self, kind: QueueKind) -> Option<&QueueRole> {
        self.queues.iter().find(|role| role.kind == kind)
    }
}

/// Builds the enable chain for a device.
#[derive(Debug, Clone)]
pub struct CapabilityNegotiator {
    required: Vec<Requirement>,
    optional: Vec<OptionalGroup>,
    require_presentation: bool,
    queues_per_role: u32,
}

impl CapabilityNegotiator {
    /// Create a negotiator with no items.
    pub fn empty(require_presentation: bool) -> Self {
        Self {
            required: Vec::new(),
            optional: Vec::new(),
            require_presentation,
            queues_per_role: 2,
        }
    }

    /// Create a negotiator with the runtime's standard item lists.
    pub fn new(require_presentation: bool) -> Self {
        let mut negotiator = Self::empty(require_presentation)
            .require(Requirement::ApiVersion(MIN_API_VERSION))
            .require(Requirement::Feature(DeviceFeatures::TIMELINE_SEMAPHORE))
            .require(Requirement::Feature(DeviceFeatures::SYNCHRONIZATION_2))
            .require(Requirement::Feature(DeviceFeatures::DYNAMIC_RENDERING))
            .require(Requirement::Feature(DeviceFeatures::DESCRIPTOR_INDEXING))
            .require(Requirement::Feature(DeviceFeatures::RUNTIME_DESCRIPTOR_ARRAY))
            .require(Requirement::Feature(DeviceFeatures::PARTIALLY_BOUND))
            .require(Requirement::Feature(
                DeviceFeatures::SAMPLED_IMAGE_UPDATE_AFTER_BIND,
            ))
            .require(Requirement::Feature(DeviceFeatures::NON_UNIFORM_INDEXING))
            .require(Requirement::Feature(DeviceFeatures::BUFFER_DEVICE_ADDRESS));

        if require_presentation {
            negotiator = negotiator.require(Requirement::Extension(ash::khr::swapchain::NAME));
        }

        negotiator
            .add_all(
                "descriptor buffer",
                Some(Capability::DescriptorBuffer),
                [
                    Requirement::Extension(ash::ext::descriptor_buffer::NAME),
                    Requirement::Feature(DeviceFeatures::DESCRIPTOR_BUFFER),
                ],
            )
            .add_all(
                "graphics pipeline library",
                Some(Capability::GraphicsPipelineLibrary),
                [
                    Requirement::Extension(ash::khr::pipeline_library::NAME),
                    Requirement::Extension(ash::ext::graphics_pipeline_library::NAME),
                    Requirement::Feature(DeviceFeatures::GRAPHICS_PIPELINE_LIBRARY),
                ],
            )
            .add_all(
                "host image copy",
                Some(Capability::HostImageCopy),
                [
                    Requirement::Extension(ash::ext::host_image_copy::NAME),
                    Requirement::Feature(DeviceFeatures::HOST_IMAGE_COPY),
                ],
            )
            .add_all(
                "shader object",
                Some(Capability::ShaderObject),
                [
                    Requirement::Extension(ash::ext::shader_object::NAME),
                    Requirement::Feature(DeviceFeatures::SHADER_OBJECT),
                ],
            )
            .add_all(
                "multiview",
                Some(Capability::Multiview),
                [Requirement::Feature(DeviceFeatures::MULTIVIEW)],
            )
            .add_all(
                "geometry shaders",
                None,
                [Requirement::Feature(DeviceFeatures::GEOMETRY_SHADER)],
            )
            .add_all(
                "tessellation shaders",
                None,
                [Requirement::Feature(DeviceFeatures::TESSELLATION_SHADER)],
            )
    }

    /// Add a required item.
    pub fn require(mut self, item: Requirement) -> Self {
        self.required.push(item);
        self
    }

    /// Add an optional group that is enabled only if every member is supported.
    pub fn add_all(
        mut self,
        name: &'static str,
        capability: Option<Capability>,
        members: impl IntoIterator<Item = Requirement>,
    ) -> Self {
        self.optional.push(OptionalGroup {
            name,
            members: members.into_iter().collect(),
            capability,
        });
        self
    }

    /// Drop an optional group by name, forcing its fallback path.
    pub fn without(mut self, name: &str) -> Self {
        self.optional.retain(|group| group.name != name);
        self
    }

    /// Cap the number of hardware queues created per role (at least one).
    pub fn queues_per_role(mut self, count: u32) -> Self {
        self.queues_per_role = count.max(1);
        self
    }

    /// Optional groups, in registration order.
    pub fn optional_groups(&self) -> &[OptionalGroup] {
        &self.optional
    }

    /// Select an adapter and negotiate the feature set against it.
    pub fn negotiate(&self, adapters: &[AdapterInfo]) -> Result<NegotiatedDevice> {
        let adapter_index = select_adapter(adapters, self.require_presentation)?;
        let adapter = &adapters[adapter_index];
        tracing::info!("Selected GPU: {}", adapter.summary());

        let mut enabled = EnableChain::default();
        for item in &self.required {
            if !item.is_supported(adapter) {
                return Err(GpuError::MissingCapability(item.name()));
            }
            enabled.add(*item);
        }

        let mut caps = RuntimeCaps::default();
        for group in &self.optional {
            let missing = group.members.iter().find(|item| !item.is_supported(adapter));
            match missing {
                None => {
                    for item in &group.members {
                        enabled.add(*item);
                    }
                    if let Some(capability) = group.capability {
                        capability.set(&mut caps);
                    }
                    tracing::debug!("Enabled optional group '{}'", group.name);
                }
                Some(item) => {
                    tracing::debug!(
                        "Optional group '{}' disabled: {} unsupported",
                        group.name,
                        item.name()
                    );
                }
            }
        }

        let queues = plan_queues(adapter, self.require_presentation, self.queues_per_role)?;
        tracing::info!("Negotiated capabilities: {caps}");

        Ok(NegotiatedDevice {
            adapter_index,
            enabled,
            caps,
            queues,
        })
    }
}

/// Pick the adapter: a discrete GPU that can present, else the first adapter
/// that can present.
pub fn select_adapter(adapters: &[AdapterInfo], require_presentation: bool) -> Result<usize> {
    let usable = |adapter: &AdapterInfo| {
        let has_graphics = adapter
            .queue_families
            .iter()
            .any(|f| f.flags.contains(vk::QueueFlags::GRAPHICS));
        has_graphics && (!require_presentation || adapter.can_present())
    };

    adapters
        .iter()
        .position(|adapter| adapter.is_discrete() && usable(adapter))
        .or_else(|| adapters.iter().position(usable))
        .ok_or(GpuError::NoSuitableDevice)
}

/// Partition queue families into the combined, async compute and dedicated
/// transfer roles.
pub fn plan_queues(
    adapter: &AdapterInfo,
    require_presentation: bool,
    queues_per_role: u32,
) -> Result<Vec<QueueRole>> {
    let families = &adapter.queue_families;
    let combined_flags = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;

    // Graphics families implicitly support transfer.
    let combined = families
        .iter()
        .find(|f| {
            f.flags.contains(combined_flags)
                && f.queue_count > 0
                && (!require_presentation || f.supports_present)
        })
        .ok_or(GpuError::NoSuitableDevice)?;

    let async_compute = families.iter().find(|f| {
        f.flags.contains(vk::QueueFlags::COMPUTE)
            && !f.flags.contains(vk::QueueFlags::GRAPHICS)
            && f.queue_count > 0
    });

    let transfer = families.iter().find(|f| {
        f.flags.contains(vk::QueueFlags::TRANSFER)
            && !f.flags.intersects(combined_flags)
            && f.queue_count > 0
    });

    let role = |kind, family: &crate::capabilities::QueueFamilyInfo| QueueRole {
        kind,
        family: family.index,
        count: family.queue_count.min(queues_per_role),
    };

    let mut roles = vec![role(QueueKind::Graphics, combined)];
    if let Some(family) = async_compute {
        roles.push(role(QueueKind::AsyncCompute, family));
    }
    if let Some(family) = transfer {
        roles.push(role(QueueKind::Transfer, family));
    }

    Ok(roles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{AdapterLimits, GpuVendor, QueueFamilyInfo};

    fn adapter(device_type: vk::PhysicalDeviceType, present: bool) -> AdapterInfo {
        AdapterInfo {
            physical_device: vk::PhysicalDevice::null(),
            name: format!("{device_type:?}"),
            vendor: GpuVendor::Other(0),
            device_type,
            api_version: vk::API_VERSION_1_3,
            driver_version: 1,
            device_local_memory_mb: 4096,
            limits: AdapterLimits::default(),
            queue_families: vec![
                QueueFamilyInfo {
                    index: 0,
                    flags: vk::QueueFlags::GRAPHICS
                        | vk::QueueFlags::COMPUTE
                        | vk::QueueFlags::TRANSFER,
                    queue_count: 16,
                    supports_present: present,
                },
                QueueFamilyInfo {
                    index: 1,
                    flags: vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                    queue_count: 1,
                    supports_present: false,
                },
                QueueFamilyInfo {
                    index: 2,
                    flags: vk::QueueFlags::TRANSFER,
                    queue_count: 2,
                    supports_present: false,
                },
            ],
            extensions: Default::default(),
            features: DeviceFeatures::all(),
        }
    }

    fn with_extensions(mut adapter: AdapterInfo, names: &[&CStr]) -> AdapterInfo {
        adapter.extensions = names
            .iter()
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        adapter
    }

    #[test]
    fn prefers_discrete_presentable_adapter() {
        let adapters = [
            adapter(vk::PhysicalDeviceType::INTEGRATED_GPU, true),
            adapter(vk::PhysicalDeviceType::DISCRETE_GPU, false),
            adapter(vk::PhysicalDeviceType::DISCRETE_GPU, true),
        ];
        assert_eq!(select_adapter(&adapters, true).unwrap(), 2);
    }

    #[test]
    fn falls_back_to_first_presentable_adapter() {
        let adapters = [
            adapter(vk::PhysicalDeviceType::DISCRETE_GPU, false),
            adapter(vk::PhysicalDeviceType::CPU, true),
            adapter(vk::PhysicalDeviceType::INTEGRATED_GPU, true),
        ];
        assert_eq!(select_adapter(&adapters, true).unwrap(), 1);
    }

    #[test]
    fn no_presentable_adapter_is_fatal() {
        let adapters = [adapter(vk::PhysicalDeviceType::DISCRETE_GPU, false)];
        assert!(matches!(
            select_adapter(&adapters, true),
            Err(GpuError::NoSuitableDevice)
        ));
        // Headless selection ignores presentation.
        assert_eq!(select_adapter(&adapters, false).unwrap(), 0);
    }

    #[test]
    fn missing_required_item_is_named() {
        let adapters = [adapter(vk::PhysicalDeviceType::DISCRETE_GPU, true)];
        let err = CapabilityNegotiator::new(true)
            .negotiate(&adapters)
            .unwrap_err();
        match err {
            GpuError::MissingCapability(name) => assert_eq!(name, "VK_KHR_swapchain"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn partially_supported_group_enables_nothing() {
        // Pipeline library extension present, graphics pipeline library extension missing.
        let adapters = [with_extensions(
            adapter(vk::PhysicalDeviceType::DISCRETE_GPU, true),
            &[ash::khr::swapchain::NAME, ash::khr::pipeline_library::NAME],
        )];

        let negotiated = CapabilityNegotiator::new(true).negotiate(&adapters).unwrap();

        assert!(!negotiated.caps.graphics_pipeline_library);
        assert!(!negotiated
            .enabled
            .has_extension(ash::khr::pipeline_library::NAME));
        assert!(!negotiated
            .enabled
            .features
            .contains(DeviceFeatures::GRAPHICS_PIPELINE_LIBRARY));
        // Feature-only groups still come through.
        assert!(negotiated.caps.multiview);
    }

    #[test]
    fn fully_supported_group_sets_its_flag() {
        let adapters = [with_extensions(
            adapter(vk::PhysicalDeviceType::DISCRETE_GPU, true),
            &[
                ash::khr::swapchain::NAME,
                ash::khr::pipeline_library::NAME,
                ash::ext::graphics_pipeline_library::NAME,
                ash::ext::shader_object::NAME,
            ],
        )];

        let negotiated = CapabilityNegotiator::new(true).negotiate(&adapters).unwrap();

        assert!(negotiated.caps.graphics_pipeline_library);
        assert!(negotiated.caps.shader_object);
        assert!(!negotiated.caps.descriptor_buffer);
        assert!(negotiated
            .enabled
            .has_extension(ash::ext::graphics_pipeline_library::NAME));
    }

    #[test]
    fn without_forces_fallback() {
        let adapters = [with_extensions(
            adapter(vk::PhysicalDeviceType::DISCRETE_GPU, false),
            &[ash::ext::shader_object::NAME],
        )];
        let negotiated = CapabilityNegotiator::new(false)
            .without("shader object")
            .negotiate(&adapters)
            .unwrap();
        assert!(!negotiated.caps.shader_object);
    }

    #[test]
    fn queue_roles_are_partitioned() {
        let roles = plan_queues(
            &adapter(vk::PhysicalDeviceType::DISCRETE_GPU, true),
            true,
            2,
        )
        .unwrap();

        assert_eq!(
            roles,
            vec![
                QueueRole {
                    kind: QueueKind::Graphics,
                    family: 0,
                    count: 2
                },
                QueueRole {
                    kind: QueueKind::AsyncCompute,
                    family: 1,
                    count: 1
                },
                QueueRole {
                    kind: QueueKind::Transfer,
                    family: 2,
                    count: 2
                },
            ]
        );
    }

    #[test]
    fn missing_roles_are_omitted() {
        let mut info = adapter(vk::PhysicalDeviceType::INTEGRATED_GPU, true);
        info.queue_families.truncate(1);
        let roles = plan_queues(&info, true, 2).unwrap();
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].kind, QueueKind::Graphics);
    }
}
