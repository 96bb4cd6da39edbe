//! Surface management for windowed rendering.
//!
//! Wraps the raw-window-handle plumbing so application code only hands over
//! a window.

use crate::error::{GpuError, Result, VkResultExt};
use crate::instance::InstanceBinding;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;

/// A Vulkan surface for one window.
pub struct SurfaceContext {
    instance: Arc<InstanceBinding>,
    loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
}

impl SurfaceContext {
    /// Create a surface for `window`.
    ///
    /// # Safety
    /// The window must outlive the returned surface.
    pub unsafe fn from_window<W>(instance: &Arc<InstanceBinding>, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        if !instance.supports_surfaces() {
            return Err(GpuError::SurfaceCreation(
                "instance was created without surface extensions".to_string(),
            ));
        }

        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        // SAFETY: the handles are valid for the window's lifetime, which the
        // caller guarantees exceeds the surface's.
        let surface = unsafe {
            ash_window::create_surface(
                instance.entry(),
                instance.instance(),
                display.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        let loader = ash::khr::surface::Instance::new(instance.entry(), instance.instance());

        Ok(Self {
            instance: instance.clone(),
            loader,
            surface,
        })
    }

    pub fn raw(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn instance(&self) -> &Arc<InstanceBinding> {
        &self.instance
    }

    /// Whether queues of `family` can present to this surface.
    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, family: u32) -> Result<bool> {
        // SAFETY: the physical device was enumerated from the same instance.
        unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, family, self.surface)
        }
        .vk_context("vkGetPhysicalDeviceSurfaceSupportKHR")
    }

    /// Query surface capabilities.
    pub fn capabilities(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceCapabilities> {
        // SAFETY: the physical device was enumerated from the same instance.
        unsafe {
            let capabilities = self
                .loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)
                .vk_context("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;

            let formats = self
                .loader
                .get_physical_device_surface_formats(physical_device, self.surface)
                .vk_context("vkGetPhysicalDeviceSurfaceFormatsKHR")?;

            let present_modes = self
                .loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)
                .vk_context("vkGetPhysicalDeviceSurfacePresentModesKHR")?;

            Ok(SurfaceCapabilities {
                capabilities,
                formats,
                present_modes,
            })
        }
    }
}

impl Drop for SurfaceContext {
    fn drop(&mut self) {
        // SAFETY: swapchains hold an Arc to this surface, so none remain.
        unsafe {
            self.loader.destroy_surface(self.surface, None);
        }
    }
}

impl std::fmt::Debug for SurfaceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfaceContext")
            .field("surface", &self.surface)
            .finish_non_exhaustive()
    }
}

/// Surface capabilities query result.
#[derive(Debug, Clone)]
pub struct SurfaceCapabilities {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceCapabilities {
    /// Get the recommended surface format.
    pub fn recommended_format(&self) -> Result<vk::SurfaceFormatKHR> {
        select_surface_format(&self.formats)
    }

    /// Get the recommended present mode.
    pub fn recommended_present_mode(&self, vsync: bool) -> vk::PresentModeKHR {
        select_present_mode(&self.present_modes, vsync)
    }

    /// Clamp the desired size to what the surface allows.
    pub fn extent(&self, desired: vk::Extent2D) -> vk::Extent2D {
        calculate_extent(&self.capabilities, desired)
    }
}

/// Select the best surface format, preferring 8-bit sRGB.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|format| {
            format.format == vk::Format::B8G8R8A8_SRGB
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first())
        .copied()
        .ok_or_else(|| GpuError::SwapchainCreation("surface reports no formats".to_string()))
}

/// Select the best present mode.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        // FIFO is always supported
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Swapchain extent for a desired size.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}
