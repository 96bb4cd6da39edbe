//! Vulkan instance creation.

use crate::error::{GpuError, Result, VkResultExt};
use ash::vk;
use std::ffi::{CStr, CString};

/// Instance extensions needed to create window surfaces.
pub fn surface_instance_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::surface::NAME,
        #[cfg(target_os = "windows")]
        ash::khr::win32_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xlib_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::wayland_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::ext::metal_surface::NAME,
    ]
}

/// Validation layers to enable in debug builds.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// First stage of the driver binding: the loader entry and the instance.
///
/// Everything created from the instance (surfaces, devices) holds an `Arc` to
/// the binding, so the instance is destroyed last.
pub struct InstanceBinding {
    entry: ash::Entry,
    instance: ash::Instance,
    validation: bool,
    surfaces: bool,
}

impl InstanceBinding {
    /// Load the Vulkan library and create an instance.
    ///
    /// With `surfaces` the platform surface extensions are enabled; headless
    /// contexts skip them so they work without a display server.
    pub fn new(app_name: &str, enable_validation: bool, surfaces: bool) -> Result<Self> {
        // SAFETY: loading the system Vulkan library has no preconditions.
        let entry =
            unsafe { ash::Entry::load() }.map_err(|e| GpuError::Loading(e.to_string()))?;

        let app_name = CString::new(app_name)
            .map_err(|_| GpuError::InvalidState("app name contains a NUL byte".to_string()))?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"Halcyon")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extensions = if surfaces {
            surface_instance_extensions()
        } else {
            Vec::new()
        };
        #[cfg(target_os = "macos")]
        extensions.push(ash::khr::portability_enumeration::NAME);

        // SAFETY: the entry is valid.
        let available_extensions = unsafe { entry.enumerate_instance_extension_properties(None) }
            .vk_context("vkEnumerateInstanceExtensionProperties")?;
        let has_extension = |name: &CStr| {
            available_extensions
                .iter()
                .any(|props| props.extension_name_as_c_str() == Ok(name))
        };
        if let Some(missing) = extensions.iter().find(|name| !has_extension(name)) {
            // Linux loaders commonly ship only one of xlib/wayland.
            tracing::warn!("Instance extension {missing:?} not available");
        }
        extensions.retain(|name| has_extension(name));
        if surfaces && !extensions.contains(&ash::khr::surface::NAME) {
            return Err(GpuError::MissingCapability(
                ash::khr::surface::NAME.to_string_lossy().into_owned(),
            ));
        }
        let extension_names: Vec<*const std::ffi::c_char> =
            extensions.iter().map(|ext| ext.as_ptr()).collect();

        let mut layers = if enable_validation {
            validation_layers()
        } else {
            vec![]
        };

        // SAFETY: the entry is valid.
        let available_layers = unsafe { entry.enumerate_instance_layer_properties() }
            .vk_context("vkEnumerateInstanceLayerProperties")?;
        layers.retain(|layer| {
            let found = available_layers
                .iter()
                .any(|props| props.layer_name_as_c_str() == Ok(*layer));
            if !found {
                tracing::warn!("Validation layer {layer:?} not available");
            }
            found
        });
        let layer_names: Vec<*const std::ffi::c_char> = layers.iter().map(|l| l.as_ptr()).collect();

        // Required for MoltenVK on macOS
        #[cfg(target_os = "macos")]
        let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        #[cfg(not(target_os = "macos"))]
        let create_flags = vk::InstanceCreateFlags::empty();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_names)
            .flags(create_flags);

        // SAFETY: every pointer in `create_info` outlives the call.
        let instance = unsafe { entry.create_instance(&create_info, None) }
            .vk_context("vkCreateInstance")?;

        tracing::debug!(
            "Created Vulkan instance (validation: {}, surfaces: {})",
            !layers.is_empty(),
            surfaces
        );

        Ok(Self {
            entry,
            instance,
            validation: !layers.is_empty(),
            surfaces,
        })
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Whether the validation layer was actually enabled.
    pub fn validation_enabled(&self) -> bool {
        self.validation
    }

    /// Whether surface extensions were enabled.
    pub fn supports_surfaces(&self) -> bool {
        self.surfaces
    }
}

impl Drop for InstanceBinding {
    fn drop(&mut self) {
        // SAFETY: every child object holds an Arc to this binding.
        unsafe {
            self.instance.destroy_instance(None);
        }
    }
}

impl std::fmt::Debug for InstanceBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceBinding")
            .field("instance", &self.instance.handle())
            .field("validation", &self.validation)
            .finish_non_exhaustive()
    }
}
