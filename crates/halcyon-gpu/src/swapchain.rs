//! Swapchain management.
//!
//! [`Swapchain::Native`] presents to a window surface. [`Swapchain::Offscreen`]
//! renders into a ring of ordinary images instead, for headless runs and
//! tests; both share the acquire / prepare / present protocol.

use crate::command::CommandList;
use crate::context::Context;
use crate::driver::vulkan::VulkanDevice;
use crate::driver::{DriverRef, ImageBarrier, ImageDesc};
use crate::error::{GpuError, Result, VkResultExt};
use crate::fence::SyncPoint;
use crate::queue::{Queue, SubmitInfo};
use crate::resource::Image;
use crate::surface::SurfaceContext;
use ash::vk;
use std::sync::Arc;

/// Requested swapchain parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub extent: vk::Extent2D,
    pub vsync: bool,
    /// Ring size for offscreen swapchains; native ones use the surface minimum plus one.
    pub image_count: u32,
    /// Offscreen image format; native ones use the surface's preferred format.
    pub format: vk::Format,
}

impl Default for SwapchainDesc {
    fn default() -> Self {
        Self {
            extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            vsync: true,
            image_count: 3,
            format: vk::Format::B8G8R8A8_SRGB,
        }
    }
}

/// One presentable image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainTarget {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

/// An image handed out by [`Swapchain::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    /// The surface changed; presenting still works but a rebuild is due.
    pub suboptimal: bool,
    wait: Option<vk::Semaphore>,
    signal: Option<vk::Semaphore>,
    slot: usize,
}

impl AcquiredImage {
    /// Synchronization the frame's submission must carry.
    pub fn submit_info(&self) -> SubmitInfo {
        SubmitInfo {
            binary_waits: self
                .wait
                .map(|semaphore| (semaphore, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT))
                .into_iter()
                .collect(),
            binary_signals: self.signal.into_iter().collect(),
            ..Default::default()
        }
    }
}

/// Presentation strategy.
pub enum Swapchain {
    Native(NativeSwapchain),
    Offscreen(OffscreenSwapchain),
}

impl Swapchain {
    /// A native swapchain when a surface is given, an offscreen ring otherwise.
    pub fn new(
        context: &Context,
        surface: Option<&Arc<SurfaceContext>>,
        desc: &SwapchainDesc,
    ) -> Result<Self> {
        match surface {
            Some(surface) => Self::native(context, surface, desc),
            None => Self::offscreen(context, desc),
        }
    }

    pub fn native(
        context: &Context,
        surface: &Arc<SurfaceContext>,
        desc: &SwapchainDesc,
    ) -> Result<Self> {
        NativeSwapchain::new(context, surface.clone(), desc).map(Self::Native)
    }

    pub fn offscreen(context: &Context, desc: &SwapchainDesc) -> Result<Self> {
        OffscreenSwapchain::new(context, desc).map(Self::Offscreen)
    }

    pub fn extent(&self) -> vk::Extent2D {
        match self {
            Self::Native(native) => native.extent,
            Self::Offscreen(offscreen) => offscreen.extent,
        }
    }

    pub fn format(&self) -> vk::Format {
        match self {
            Self::Native(native) => native.format.format,
            Self::Offscreen(offscreen) => offscreen.format,
        }
    }

    pub fn image_count(&self) -> usize {
        match self {
            Self::Native(native) => native.images.len(),
            Self::Offscreen(offscreen) => offscreen.images.len(),
        }
    }

    /// Render target for image `index`.
    pub fn target(&self, index: u32) -> Result<SwapchainTarget> {
        let slot = index as usize;
        let (image, view) = match self {
            Self::Native(native) => (
                native.images.get(slot).copied(),
                native.views.get(slot).copied(),
            ),
            Self::Offscreen(offscreen) => match offscreen.images.get(slot) {
                Some(frame) => (Some(frame.image.raw()), Some(frame.image.view())),
                None => (None, None),
            },
        };
        match (image, view) {
            (Some(image), Some(view)) => Ok(SwapchainTarget {
                image,
                view,
                format: self.format(),
                extent: self.extent(),
            }),
            _ => Err(GpuError::InvalidState(format!(
                "swapchain image {index} out of range"
            ))),
        }
    }

    /// Acquire the next image, waiting until its previous frame has retired.
    ///
    /// Fails with [`GpuError::SwapchainOutOfDate`] when the surface changed
    /// and the swapchain must be rebuilt first.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn acquire(&mut self) -> Result<AcquiredImage> {
        match self {
            Self::Native(native) => native.acquire(),
            Self::Offscreen(offscreen) => offscreen.acquire(),
        }
    }

    /// Transition the acquired image for color attachment writes.
    pub fn prepare_render(&self, list: &mut CommandList, acquired: &AcquiredImage) -> Result<()> {
        let target = self.target(acquired.index)?;
        list.image_barrier(&ImageBarrier {
            image: target.image,
            aspect: vk::ImageAspectFlags::COLOR,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            src_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            src_access: vk::AccessFlags2::NONE,
            dst_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            dst_access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            base_mip: 0,
            mip_count: 1,
        })
    }

    /// Transition the acquired image from rendering to presentation.
    ///
    /// Offscreen images end in `TRANSFER_SRC_OPTIMAL` so they can be read back.
    pub fn prepare_present(&self, list: &mut CommandList, acquired: &AcquiredImage) -> Result<()> {
        let target = self.target(acquired.index)?;
        let (new_layout, dst_stage, dst_access) = match self {
            Self::Native(_) => (
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                vk::AccessFlags2::NONE,
            ),
            Self::Offscreen(_) => (
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_READ,
            ),
        };
        list.image_barrier(&ImageBarrier {
            image: target.image,
            aspect: vk::ImageAspectFlags::COLOR,
            old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            new_layout,
            src_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            src_access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            dst_stage,
            dst_access,
            base_mip: 0,
            mip_count: 1,
        })
    }

    /// Present the acquired image once `frame` has been submitted.
    ///
    /// Returns `true` when the swapchain should be rebuilt.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn present(
        &mut self,
        queue: &Queue,
        acquired: &AcquiredImage,
        frame: SyncPoint,
    ) -> Result<bool> {
        match self {
            Self::Native(native) => native.present(queue, acquired, frame),
            Self::Offscreen(offscreen) => {
                offscreen.present(acquired, frame);
                Ok(false)
            }
        }
    }

    /// Rebuild for `desired` if the resulting extent differs from the
    /// current one. Returns whether a rebuild happened.
    pub fn resize(&mut self, context: &Context, desired: vk::Extent2D) -> Result<bool> {
        match self {
            Self::Native(native) => {
                let extent = native.surface_extent(desired)?;
                if extent == native.extent {
                    return Ok(false);
                }
                native.rebuild(desired)?;
            }
            Self::Offscreen(offscreen) => {
                if desired == offscreen.extent {
                    return Ok(false);
                }
                offscreen.rebuild(context, desired)?;
            }
        }
        Ok(true)
    }

    /// Rebuild unconditionally, e.g. after [`GpuError::SwapchainOutOfDate`].
    pub fn rebuild(&mut self, context: &Context, desired: vk::Extent2D) -> Result<()> {
        match self {
            Self::Native(native) => native.rebuild(desired),
            Self::Offscreen(offscreen) => offscreen.rebuild(context, desired),
        }
    }

    /// Wait for in-flight frames and release every image. Idempotent.
    pub fn destroy(&mut self) {
        match self {
            Self::Native(native) => native.destroy(),
            Self::Offscreen(offscreen) => offscreen.destroy(),
        }
    }
}

impl std::fmt::Debug for Swapchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Native(_) => "Native",
            Self::Offscreen(_) => "Offscreen",
        };
        f.debug_struct("Swapchain")
            .field("kind", &kind)
            .field("extent", &self.extent())
            .field("format", &self.format())
            .field("images", &self.image_count())
            .finish()
    }
}

fn wait_all<'a>(points: impl Iterator<Item = &'a mut Option<SyncPoint>>) {
    for point in points {
        if let Some(point) = point.take() {
            if let Err(err) = point.wait() {
                tracing::error!("Failed waiting for in-flight frame: {err}");
            }
        }
    }
}

struct AcquireSlot {
    semaphore: vk::Semaphore,
    in_flight: Option<SyncPoint>,
}

/// Swapchain on a window surface.
pub struct NativeSwapchain {
    driver: DriverRef,
    surface: Arc<SurfaceContext>,
    family: u32,
    vsync: bool,
    raw: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    acquire_slots: Vec<AcquireSlot>,
    next_slot: usize,
    // One per image: presentation waits on the semaphore of the image it shows.
    render_done: Vec<vk::Semaphore>,
}

impl NativeSwapchain {
    fn new(context: &Context, surface: Arc<SurfaceContext>, desc: &SwapchainDesc) -> Result<Self> {
        let family = context.graphics_queue()?.family();
        let mut swapchain = Self {
            driver: context.driver().clone(),
            surface,
            family,
            vsync: desc.vsync,
            raw: vk::SwapchainKHR::null(),
            images: Vec::new(),
            views: Vec::new(),
            format: vk::SurfaceFormatKHR::default(),
            extent: desc.extent,
            acquire_slots: Vec::new(),
            next_slot: 0,
            render_done: Vec::new(),
        };
        swapchain.rebuild(desc.extent)?;
        Ok(swapchain)
    }

    fn device(driver: &DriverRef) -> Result<&VulkanDevice> {
        driver.vulkan().ok_or_else(|| {
            GpuError::SwapchainCreation("native swapchains need a Vulkan device".to_string())
        })
    }

    fn loader(device: &VulkanDevice) -> Result<&ash::khr::swapchain::Device> {
        device.swapchain_loader().ok_or_else(|| {
            GpuError::SwapchainCreation("device was created without presentation".to_string())
        })
    }

    fn surface_extent(&self, desired: vk::Extent2D) -> Result<vk::Extent2D> {
        let device = Self::device(&self.driver)?;
        let capabilities = self.surface.capabilities(device.physical_device())?;
        Ok(capabilities.extent(desired))
    }

    /// Create a swapchain for the surface's current state, retiring the old one.
    fn rebuild(&mut self, desired: vk::Extent2D) -> Result<()> {
        wait_all(self.acquire_slots.iter_mut().map(|slot| &mut slot.in_flight));

        let driver = self.driver.clone();
        let device = Self::device(&driver)?;
        let loader = Self::loader(device)?;
        let surface = self.surface.capabilities(device.physical_device())?;
        let format = surface.recommended_format()?;
        let present_mode = surface.recommended_present_mode(self.vsync);
        let extent = surface.extent(desired);
        if extent.width == 0 || extent.height == 0 {
            return Err(GpuError::SwapchainOutOfDate);
        }

        let caps = &surface.capabilities;
        let mut image_count = caps.min_image_count + 1;
        if caps.max_image_count > 0 {
            image_count = image_count.min(caps.max_image_count);
        }

        let families = [self.family];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface.raw())
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&families)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(self.raw);

        // SAFETY: the surface and device are alive; the old swapchain is idle.
        let raw = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;
        self.release_images(device, loader);
        self.raw = raw;

        // SAFETY: the swapchain was just created.
        self.images =
            unsafe { loader.get_swapchain_images(raw) }.vk_context("vkGetSwapchainImagesKHR")?;
        for &image in &self.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            // SAFETY: the image belongs to the live swapchain.
            let view = unsafe { device.device().create_image_view(&view_info, None) }
                .vk_context("vkCreateImageView")?;
            self.views.push(view);
        }

        while self.acquire_slots.len() < self.images.len() + 1 {
            let semaphore = self.driver.create_binary_semaphore()?;
            self.acquire_slots.push(AcquireSlot {
                semaphore,
                in_flight: None,
            });
        }
        for semaphore in self.render_done.drain(..) {
            self.driver.destroy_semaphore(semaphore);
        }
        for _ in 0..self.images.len() {
            self.render_done.push(self.driver.create_binary_semaphore()?);
        }

        self.format = format;
        self.extent = extent;
        tracing::info!(
            "Swapchain {}x{} {:?} {:?}, {} images",
            extent.width,
            extent.height,
            format.format,
            present_mode,
            self.images.len()
        );
        Ok(())
    }

    /// Destroy views and any swapchain that is no longer current.
    fn release_images(&mut self, device: &VulkanDevice, loader: &ash::khr::swapchain::Device) {
        // SAFETY: all frames using these images have completed.
        unsafe {
            for view in self.views.drain(..) {
                device.device().destroy_image_view(view, None);
            }
            if self.raw != vk::SwapchainKHR::null() {
                loader.destroy_swapchain(self.raw, None);
                self.raw = vk::SwapchainKHR::null();
            }
        }
        self.images.clear();
    }

    fn acquire(&mut self) -> Result<AcquiredImage> {
        let driver = self.driver.clone();
        let loader = Self::loader(Self::device(&driver)?)?;

        let slot_index = self.next_slot;
        let slot = self
            .acquire_slots
            .get_mut(slot_index)
            .ok_or_else(|| GpuError::InvalidState("swapchain was destroyed".to_string()))?;
        if let Some(point) = slot.in_flight.take() {
            point.wait()?;
        }
        let semaphore = slot.semaphore;

        // SAFETY: the semaphore is unsignaled; its last wait has completed.
        let result = unsafe {
            loader.acquire_next_image(self.raw, u64::MAX, semaphore, vk::Fence::null())
        };
        let (index, suboptimal) = match result {
            Ok(acquired) => acquired,
            // No image was acquired; the swapchain must be recreated.
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Err(GpuError::SwapchainOutOfDate),
            Err(err) => return Err(GpuError::vulkan("vkAcquireNextImageKHR", err)),
        };
        self.next_slot = (slot_index + 1) % self.acquire_slots.len();

        Ok(AcquiredImage {
            index,
            suboptimal,
            wait: Some(semaphore),
            signal: self.render_done.get(index as usize).copied(),
            slot: slot_index,
        })
    }

    fn present(&mut self, queue: &Queue, acquired: &AcquiredImage, frame: SyncPoint) -> Result<bool> {
        if let Some(slot) = self.acquire_slots.get_mut(acquired.slot) {
            slot.in_flight = Some(frame);
        }

        let driver = self.driver.clone();
        let loader = Self::loader(Self::device(&driver)?)?;
        let swapchains = [self.raw];
        let indices = [acquired.index];
        let waits: Vec<vk::Semaphore> = acquired.signal.into_iter().collect();
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&indices);

        // SAFETY: the queue is externally synchronized by `with_raw`.
        match queue.with_raw(|raw| unsafe { loader.queue_present(raw, &info) }) {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(err) => Err(GpuError::vulkan("vkQueuePresentKHR", err)),
        }
    }

    fn destroy(&mut self) {
        wait_all(self.acquire_slots.iter_mut().map(|slot| &mut slot.in_flight));
        let driver = self.driver.clone();
        if let Ok(device) = Self::device(&driver) {
            if let Ok(loader) = Self::loader(device) {
                // Presentation may still read the images.
                if let Err(err) = driver.wait_idle() {
                    tracing::warn!("Swapchain teardown: wait idle failed: {err}");
                }
                self.release_images(device, loader);
            }
        }
        for slot in self.acquire_slots.drain(..) {
            self.driver.destroy_semaphore(slot.semaphore);
        }
        for semaphore in self.render_done.drain(..) {
            self.driver.destroy_semaphore(semaphore);
        }
    }
}

impl Drop for NativeSwapchain {
    fn drop(&mut self) {
        self.destroy();
    }
}

struct OffscreenFrame {
    image: Image,
    in_flight: Option<SyncPoint>,
}

/// A ring of color images standing in for a window.
pub struct OffscreenSwapchain {
    images: Vec<OffscreenFrame>,
    format: vk::Format,
    extent: vk::Extent2D,
    count: u32,
    next: usize,
}

impl OffscreenSwapchain {
    fn new(context: &Context, desc: &SwapchainDesc) -> Result<Self> {
        let mut swapchain = Self {
            images: Vec::new(),
            format: desc.format,
            extent: desc.extent,
            count: desc.image_count.max(1),
            next: 0,
        };
        swapchain.rebuild(context, desc.extent)?;
        Ok(swapchain)
    }

    fn rebuild(&mut self, context: &Context, extent: vk::Extent2D) -> Result<()> {
        self.destroy();
        let mut images = Vec::with_capacity(self.count as usize);
        for _ in 0..self.count {
            let image = context.create_image(&ImageDesc {
                name: "offscreen swapchain",
                format: self.format,
                extent,
                mip_levels: 1,
                usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
            })?;
            images.push(OffscreenFrame {
                image,
                in_flight: None,
            });
        }
        self.images = images;
        self.extent = extent;
        self.next = 0;
        tracing::debug!(
            "Offscreen swapchain {}x{}, {} images",
            extent.width,
            extent.height,
            self.count
        );
        Ok(())
    }

    fn acquire(&mut self) -> Result<AcquiredImage> {
        let slot = self.next;
        let frame = self
            .images
            .get_mut(slot)
            .ok_or_else(|| GpuError::InvalidState("swapchain was destroyed".to_string()))?;
        if let Some(point) = frame.in_flight.take() {
            point.wait()?;
        }
        self.next = (slot + 1) % self.images.len();
        Ok(AcquiredImage {
            index: slot as u32,
            suboptimal: false,
            wait: None,
            signal: None,
            slot,
        })
    }

    fn present(&mut self, acquired: &AcquiredImage, frame: SyncPoint) {
        if let Some(image) = self.images.get_mut(acquired.slot) {
            image.in_flight = Some(frame);
        }
    }

    fn destroy(&mut self) {
        wait_all(self.images.iter_mut().map(|frame| &mut frame.in_flight));
        // Dropped handles go through deferred destruction.
        self.images.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextBuilder;
    use crate::driver::simulated::{RecordedCommand, SimulatedAdapter, SimulatedBackend};

    fn context(backend: &SimulatedBackend) -> Context {
        ContextBuilder::new().build_with(backend).unwrap()
    }

    fn small() -> SwapchainDesc {
        SwapchainDesc {
            extent: vk::Extent2D {
                width: 64,
                height: 32,
            },
            image_count: 2,
            ..Default::default()
        }
    }

    #[test]
    fn headless_contexts_get_offscreen_rings() {
        let backend = SimulatedBackend::new([SimulatedAdapter::discrete("sim")]);
        let context = context(&backend);
        let mut swapchain = Swapchain::new(&context, None, &small()).unwrap();
        assert!(matches!(swapchain, Swapchain::Offscreen(_)));
        assert_eq!(swapchain.image_count(), 2);

        let first = swapchain.acquire().unwrap();
        assert_eq!(first.index, 0);
        assert!(first.submit_info().binary_waits.is_empty());
        assert!(swapchain.target(first.index).is_ok());
        assert!(swapchain.target(5).is_err());
    }

    #[test]
    fn frames_cycle_through_the_ring() {
        let backend = SimulatedBackend::new([SimulatedAdapter::discrete("sim")]);
        let context = context(&backend);
        let sim = backend.driver().unwrap();
        let queue = context.graphics_queue().unwrap().clone();
        let mut swapchain = Swapchain::offscreen(&context, &small()).unwrap();

        let mut indices = Vec::new();
        for _ in 0..3 {
            let acquired = swapchain.acquire().unwrap();
            let mut list = queue.begin().unwrap();
            swapchain.prepare_render(&mut list, &acquired).unwrap();
            swapchain.prepare_present(&mut list, &acquired).unwrap();
            let raw = list.raw();
            let frame = queue.submit(vec![list], acquired.submit_info()).unwrap();
            assert!(!swapchain.present(&queue, &acquired, frame).unwrap());

            let barriers: Vec<vk::ImageLayout> = sim
                .recorded(raw)
                .into_iter()
                .filter_map(|command| match command {
                    RecordedCommand::ImageBarrier(barrier) => Some(barrier.new_layout),
                    _ => None,
                })
                .collect();
            assert_eq!(
                barriers,
                vec![
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL
                ]
            );
            indices.push(acquired.index);
        }
        assert_eq!(indices, vec![0, 1, 0]);
    }

    #[test]
    fn resize_rebuilds_only_on_extent_change() {
        let backend = SimulatedBackend::new([SimulatedAdapter::discrete("sim")]);
        let context = context(&backend);
        let mut swapchain = Swapchain::offscreen(&context, &small()).unwrap();

        assert!(!swapchain.resize(&context, small().extent).unwrap());
        let larger = vk::Extent2D {
            width: 128,
            height: 128,
        };
        assert!(swapchain.resize(&context, larger).unwrap());
        assert_eq!(swapchain.extent(), larger);
        assert_eq!(swapchain.target(1).unwrap().extent, larger);
        assert_eq!(context.stats().memory.live_images, 2);

        swapchain.destroy();
        assert_eq!(swapchain.image_count(), 0);
        assert!(swapchain.acquire().is_err());
    }
}
