//! Buffers, images and samplers.
//!
//! Each object is reached through a [`Handle`]. Dropping the last handle
//! retires the object into the [`DeferredDestroyQueue`], which destroys it
//! and returns its heap slot once the GPU has finished with it.

use crate::deferred::{DeferredDestroyQueue, Retired};
use crate::driver::{BufferAllocation, BufferDesc, ImageAllocation, ImageDesc, SamplerDesc};
use crate::error::{GpuError, Result};
use crate::handle::Handle;
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::mem::ManuallyDrop;
use std::sync::Arc;

/// Shared buffer handle.
///
/// Destruction waits for work that was submitted before the last handle went
/// away. A list still being recorded is not submitted yet, so keep a handle
/// alive until every list that references the object has been submitted.
pub type Buffer = Handle<GpuBuffer>;
/// Shared image handle. The same lifetime rule as [`Buffer`] applies.
pub type Image = Handle<GpuImage>;
pub type Sampler = Handle<GpuSampler>;

/// A GPU buffer with its allocation.
pub struct GpuBuffer {
    allocation: ManuallyDrop<BufferAllocation>,
    deferred: Arc<DeferredDestroyQueue>,
}

impl GpuBuffer {
    pub fn raw(&self) -> vk::Buffer {
        self.allocation.raw
    }

    pub fn size(&self) -> u64 {
        self.allocation.size
    }

    pub fn location(&self) -> MemoryLocation {
        self.allocation.location
    }

    /// Zero unless created with `SHADER_DEVICE_ADDRESS` usage.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.allocation.device_address
    }

    pub fn is_mapped(&self) -> bool {
        self.allocation.mapped.is_some()
    }

    /// Write raw bytes at `offset` (must be host-visible).
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .allocation
            .mapped
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size() {
            return Err(GpuError::InvalidState(format!(
                "write of {}..{end} exceeds buffer size {}",
                offset,
                self.size()
            )));
        }

        // SAFETY: the range was checked against the mapped allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                ptr.as_ptr().add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    /// Write plain-old-data values at `offset` (must be host-visible).
    pub fn write<T: bytemuck::Pod>(&self, offset: u64, data: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        // SAFETY: the allocation is not touched after this point.
        let allocation = unsafe { ManuallyDrop::take(&mut self.allocation) };
        self.deferred.retire(Retired::Buffer(allocation));
    }
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("GpuBuffer").field(&*self.allocation).finish()
    }
}

/// A 2D image with a full view and, when sampled, a heap slot.
pub struct GpuImage {
    allocation: ManuallyDrop<ImageAllocation>,
    bindless: Option<u32>,
    deferred: Arc<DeferredDestroyQueue>,
}

impl GpuImage {
    pub fn raw(&self) -> vk::Image {
        self.allocation.raw
    }

    pub fn view(&self) -> vk::ImageView {
        self.allocation.view
    }

    pub fn format(&self) -> vk::Format {
        self.allocation.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.allocation.extent
    }

    pub fn mip_levels(&self) -> u32 {
        self.allocation.mip_levels
    }

    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.allocation.usage
    }

    /// Slot in the heap's image region, for sampled images.
    pub fn bindless_index(&self) -> Option<u32> {
        self.bindless
    }

    pub(crate) fn allocation(&self) -> &ImageAllocation {
        &self.allocation
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        // SAFETY: the allocation is not touched after this point.
        let allocation = unsafe { ManuallyDrop::take(&mut self.allocation) };
        self.deferred.retire(Retired::Image(allocation));
        if let Some(index) = self.bindless {
            self.deferred.retire(Retired::ImageIndex(index));
        }
    }
}

impl std::fmt::Debug for GpuImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuImage")
            .field("allocation", &*self.allocation)
            .field("bindless", &self.bindless)
            .finish()
    }
}

/// A sampler and its heap slot.
#[derive(Debug)]
pub struct GpuSampler {
    raw: vk::Sampler,
    index: u32,
    deferred: Arc<DeferredDestroyQueue>,
}

impl GpuSampler {
    pub fn raw(&self) -> vk::Sampler {
        self.raw
    }

    pub fn bindless_index(&self) -> u32 {
        self.index
    }
}

impl Drop for GpuSampler {
    fn drop(&mut self) {
        self.deferred.retire(Retired::Sampler(self.raw));
        self.deferred.retire(Retired::SamplerIndex(self.index));
    }
}

pub(crate) fn create_buffer(deferred: &Arc<DeferredDestroyQueue>, desc: &BufferDesc<'_>) -> Result<Buffer> {
    let allocation = deferred.driver.create_buffer(desc)?;
    deferred.memory.buffer_created(allocation.size);
    tracing::trace!("Created buffer '{}' ({} bytes)", desc.name, desc.size);
    Ok(Handle::new(GpuBuffer {
        allocation: ManuallyDrop::new(allocation),
        deferred: deferred.clone(),
    }))
}

/// Create an image. Sampled images get a heap slot pointing at their view.
pub(crate) fn create_image(deferred: &Arc<DeferredDestroyQueue>, desc: &ImageDesc<'_>) -> Result<Image> {
    let allocation = deferred.driver.create_image(desc)?;
    deferred.memory.image_created(allocation.size);

    let mut image = GpuImage {
        allocation: ManuallyDrop::new(allocation),
        bindless: None,
        deferred: deferred.clone(),
    };
    if desc.usage.contains(vk::ImageUsageFlags::SAMPLED) {
        // On failure `image` drops here and is retired like any other.
        let index = deferred.heap.allocate_image_index()?;
        image.bindless = Some(index);
        deferred
            .heap
            .write_image(index, image.view(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)?;
    }
    tracing::trace!(
        "Created image '{}' {}x{} ({:?})",
        desc.name,
        desc.extent.width,
        desc.extent.height,
        image.bindless
    );
    Ok(Handle::new(image))
}

pub(crate) fn create_sampler(deferred: &Arc<DeferredDestroyQueue>, desc: &SamplerDesc) -> Result<Sampler> {
    let raw = deferred.driver.create_sampler(desc)?;
    let index = match deferred.heap.allocate_sampler_index() {
        Ok(index) => index,
        Err(err) => {
            deferred.driver.destroy_sampler(raw);
            return Err(err);
        }
    };
    let sampler = GpuSampler {
        raw,
        index,
        deferred: deferred.clone(),
    };
    deferred.heap.write_sampler(index, raw)?;
    Ok(Handle::new(sampler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::RuntimeCaps;
    use crate::descriptors::{DescriptorHeap, HeapConfig};
    use crate::driver::simulated::{CompletionMode, SimulatedAdapter, SimulatedDriver};
    use crate::driver::DescriptorWrite;
    use crate::memory::MemoryTracker;

    fn setup(image_capacity: u32) -> (Arc<SimulatedDriver>, Arc<DeferredDestroyQueue>) {
        let sim = Arc::new(SimulatedDriver::new(
            SimulatedAdapter::discrete("sim").build(),
            RuntimeCaps::default(),
            CompletionMode::Immediate,
        ));
        let heap = Arc::new(
            DescriptorHeap::new(
                sim.clone(),
                &HeapConfig {
                    image_capacity,
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        let deferred = Arc::new(DeferredDestroyQueue::new(
            sim.clone(),
            heap,
            Arc::new(MemoryTracker::new()),
            Vec::new(),
        ));
        (sim, deferred)
    }

    fn texture(name: &str) -> ImageDesc<'_> {
        ImageDesc {
            name,
            format: vk::Format::R8G8B8A8_UNORM,
            extent: vk::Extent2D {
                width: 16,
                height: 16,
            },
            mip_levels: 1,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        }
    }

    #[test]
    fn host_visible_buffer_round_trips_writes() {
        let (sim, deferred) = setup(4);
        let buffer = create_buffer(
            &deferred,
            &BufferDesc {
                name: "staging",
                size: 16,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                location: MemoryLocation::CpuToGpu,
            },
        )
        .unwrap();
        buffer.acquire().unwrap().write(4, &[7u32, 9]).unwrap();
        let bytes = sim.read_buffer(buffer.raw()).unwrap();
        assert_eq!(&bytes[4..12], bytemuck::cast_slice::<u32, u8>(&[7, 9]));
        assert!(buffer.write(12, &[1u32, 2]).is_err());
    }

    #[test]
    fn sampled_images_get_heap_slots() {
        let (sim, deferred) = setup(4);
        let image = create_image(&deferred, &texture("albedo")).unwrap();
        let index = image.bindless_index().unwrap();
        assert!(sim.descriptor_writes().contains(&DescriptorWrite::Image {
            index,
            view: image.view(),
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }));

        drop(image);
        assert_eq!(deferred.heap.stats().images_live, 0);
        assert_eq!(sim.live_objects("image"), 0);
        assert_eq!(deferred.memory.stats().live_images, 0);
    }

    #[test]
    fn heap_exhaustion_releases_the_image() {
        let (sim, deferred) = setup(1);
        let _first = create_image(&deferred, &texture("a")).unwrap();
        let err = create_image(&deferred, &texture("b")).unwrap_err();
        assert!(matches!(err, GpuError::DescriptorHeapExhausted { .. }));
        assert_eq!(sim.live_objects("image"), 1);
    }

    #[test]
    fn retired_handles_refuse_access_but_keep_the_object() {
        let (sim, deferred) = setup(4);
        let sampler = create_sampler(&deferred, &SamplerDesc::default()).unwrap();
        let clone = sampler.clone();
        assert!(sampler.retire());
        assert!(matches!(clone.acquire(), Err(GpuError::HandleRetired(_))));
        assert_eq!(sim.live_objects("sampler"), 1);

        drop(sampler);
        drop(clone);
        assert_eq!(sim.live_objects("sampler"), 0);
        assert_eq!(deferred.heap.stats().samplers_live, 0);
    }
}
