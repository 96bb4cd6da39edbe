//! Global bindless descriptor heap.
//!
//! One table of sampled images and samplers is shared by every queue and
//! pipeline. Shaders address resources by slot index, so binding happens once
//! per recording instead of once per draw.

use crate::command::CommandList;
use crate::driver::{
    Command, DescriptorWrite, DriverRef, HeapDesc, HeapResources, HeapStorage,
};
use crate::error::{GpuError, Result};
use ash::vk;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::mem::ManuallyDrop;

/// Upper bound on sampled image slots regardless of device limits.
pub const MAX_IMAGE_SLOTS: u32 = 1 << 16;
/// Upper bound on sampler slots regardless of device limits.
pub const MAX_SAMPLER_SLOTS: u32 = 1 << 12;
/// Push constant bytes visible to every stage.
pub const PUSH_CONSTANT_SIZE: u32 = 128;

/// Requested heap capacities. The heap clamps them to device limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    pub image_capacity: u32,
    pub sampler_capacity: u32,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            image_capacity: MAX_IMAGE_SLOTS,
            sampler_capacity: MAX_SAMPLER_SLOTS,
        }
    }
}

/// Which storage backs the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapMode {
    DescriptorBuffer,
    DescriptorSet,
}

/// Slot allocator for one region of the heap.
///
/// Released indices are reused last-in first-out; fresh indices are handed
/// out in increasing order once the free list is empty.
#[derive(Debug)]
pub struct IndexAllocator {
    region: &'static str,
    capacity: u32,
    next: u32,
    free: Vec<u32>,
}

impl IndexAllocator {
    pub fn new(region: &'static str, capacity: u32) -> Self {
        Self {
            region,
            capacity,
            next: 0,
            free: Vec::new(),
        }
    }

    pub fn allocate(&mut self) -> Result<u32> {
        if let Some(index) = self.free.pop() {
            return Ok(index);
        }
        if self.next >= self.capacity {
            return Err(GpuError::DescriptorHeapExhausted {
                region: self.region,
                capacity: self.capacity,
            });
        }
        let index = self.next;
        self.next += 1;
        Ok(index)
    }

    /// Return an index. The caller guarantees no in-flight work reads it.
    pub fn release(&mut self, index: u32) {
        debug_assert!(index < self.next, "{} index {index} was never allocated", self.region);
        debug_assert!(
            !self.free.contains(&index),
            "{} index {index} released twice",
            self.region
        );
        self.free.push(index);
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Indices currently handed out.
    pub fn live(&self) -> u32 {
        self.next - self.free.len() as u32
    }
}

/// Slot usage snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub image_capacity: u32,
    pub images_live: u32,
    pub sampler_capacity: u32,
    pub samplers_live: u32,
}

/// The process-wide bindless table.
pub struct DescriptorHeap {
    driver: DriverRef,
    resources: ManuallyDrop<HeapResources>,
    images: Mutex<IndexAllocator>,
    samplers: Mutex<IndexAllocator>,
    // Slot writes take this exclusively; binds share it.
    table: RwLock<()>,
}

impl DescriptorHeap {
    /// Create the table, its set layout and the shared pipeline layout.
    pub fn new(driver: DriverRef, config: &HeapConfig) -> Result<Self> {
        let limits = driver.adapter().limits;
        let image_capacity = MAX_IMAGE_SLOTS
            .min(limits.max_sampled_images)
            .min(config.image_capacity)
            .max(1);
        let sampler_capacity = MAX_SAMPLER_SLOTS
            .min(limits.max_samplers)
            .min(config.sampler_capacity)
            .max(1);
        let push_constant_size = PUSH_CONSTANT_SIZE.min(limits.max_push_constants_size);

        let resources = driver.create_descriptor_heap(&HeapDesc {
            image_capacity,
            sampler_capacity,
            push_constant_size,
        })?;

        let heap = Self {
            driver,
            resources: ManuallyDrop::new(resources),
            images: Mutex::new(IndexAllocator::new("image", image_capacity)),
            samplers: Mutex::new(IndexAllocator::new("sampler", sampler_capacity)),
            table: RwLock::new(()),
        };
        tracing::debug!(
            "Descriptor heap ({:?}): {} images, {} samplers",
            heap.mode(),
            image_capacity,
            sampler_capacity
        );
        Ok(heap)
    }

    pub fn mode(&self) -> HeapMode {
        match self.resources.storage {
            HeapStorage::DescriptorBuffer { .. } => HeapMode::DescriptorBuffer,
            HeapStorage::DescriptorSet { .. } => HeapMode::DescriptorSet,
        }
    }

    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.resources.set_layout
    }

    /// The single pipeline layout every pipeline and shader object uses.
    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.resources.pipeline_layout
    }

    pub fn push_constant_size(&self) -> u32 {
        self.resources.push_constant_size
    }

    pub fn allocate_image_index(&self) -> Result<u32> {
        self.images.lock().allocate()
    }

    pub fn allocate_sampler_index(&self) -> Result<u32> {
        self.samplers.lock().allocate()
    }

    pub fn release_image_index(&self, index: u32) {
        self.images.lock().release(index);
    }

    pub fn release_sampler_index(&self, index: u32) {
        self.samplers.lock().release(index);
    }

    /// Point image slot `index` at `view`.
    pub fn write_image(&self, index: u32, view: vk::ImageView, layout: vk::ImageLayout) -> Result<()> {
        self.check_index(index, &self.images)?;
        let _table = self.table.write();
        self.driver
            .write_descriptor(&self.resources, &DescriptorWrite::Image { index, view, layout });
        Ok(())
    }

    /// Point sampler slot `index` at `sampler`.
    pub fn write_sampler(&self, index: u32, sampler: vk::Sampler) -> Result<()> {
        self.check_index(index, &self.samplers)?;
        let _table = self.table.write();
        self.driver
            .write_descriptor(&self.resources, &DescriptorWrite::Sampler { index, sampler });
        Ok(())
    }

    fn check_index(&self, index: u32, region: &Mutex<IndexAllocator>) -> Result<()> {
        let region = region.lock();
        if index >= region.capacity() {
            return Err(GpuError::InvalidState(format!(
                "{} slot {index} is outside the heap (capacity {})",
                region.region,
                region.capacity()
            )));
        }
        Ok(())
    }

    /// Bind the whole table to `bind_point` of a recording list.
    pub fn bind(&self, list: &CommandList, bind_point: vk::PipelineBindPoint) -> Result<()> {
        list.ensure_recording()?;
        self.bind_raw(list.raw(), bind_point);
        Ok(())
    }

    pub(crate) fn bind_raw(&self, cmd: vk::CommandBuffer, bind_point: vk::PipelineBindPoint) {
        let _table = self.table.read();
        self.driver.record(
            cmd,
            &Command::BindDescriptorHeap {
                bind_point,
                heap: &self.resources,
            },
        );
    }

    pub fn stats(&self) -> HeapStats {
        let images = self.images.lock();
        let samplers = self.samplers.lock();
        HeapStats {
            image_capacity: images.capacity(),
            images_live: images.live(),
            sampler_capacity: samplers.capacity(),
            samplers_live: samplers.live(),
        }
    }
}

impl Drop for DescriptorHeap {
    fn drop(&mut self) {
        // SAFETY: `resources` is not touched again after this point.
        let resources = unsafe { ManuallyDrop::take(&mut self.resources) };
        self.driver.destroy_descriptor_heap(resources);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{AdapterLimits, RuntimeCaps};
    use crate::driver::simulated::{CompletionMode, SimulatedAdapter, SimulatedDriver};
    use crate::driver::DeviceDriver;
    use ash::vk::Handle;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn driver(caps: RuntimeCaps, limits: AdapterLimits) -> Arc<SimulatedDriver> {
        Arc::new(SimulatedDriver::new(
            SimulatedAdapter::discrete("sim").limits(limits).build(),
            caps,
            CompletionMode::Immediate,
        ))
    }

    #[test]
    fn capacity_is_clamped_to_device_limits() {
        let limits = AdapterLimits {
            max_sampled_images: 1000,
            max_samplers: 8,
            ..Default::default()
        };
        let heap = DescriptorHeap::new(
            driver(RuntimeCaps::default(), limits),
            &HeapConfig {
                image_capacity: 1 << 20,
                sampler_capacity: 4,
            },
        )
        .unwrap();
        let stats = heap.stats();
        assert_eq!(stats.image_capacity, 1000);
        assert_eq!(stats.sampler_capacity, 4);
    }

    #[test]
    fn released_indices_are_reused_lifo() {
        let mut indices = IndexAllocator::new("image", 8);
        let a = indices.allocate().unwrap();
        let b = indices.allocate().unwrap();
        let c = indices.allocate().unwrap();
        assert_eq!((a, b, c), (0, 1, 2));

        indices.release(a);
        indices.release(c);
        assert_eq!(indices.allocate().unwrap(), c);
        assert_eq!(indices.allocate().unwrap(), a);
        assert_eq!(indices.allocate().unwrap(), 3);
        assert_eq!(indices.live(), 4);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut indices = IndexAllocator::new("sampler", 2);
        indices.allocate().unwrap();
        indices.allocate().unwrap();
        assert!(matches!(
            indices.allocate(),
            Err(GpuError::DescriptorHeapExhausted {
                region: "sampler",
                capacity: 2
            })
        ));
    }

    #[test]
    fn concurrent_allocation_never_duplicates() {
        let heap = Arc::new(
            DescriptorHeap::new(
                driver(RuntimeCaps::default(), AdapterLimits::default()),
                &HeapConfig::default(),
            )
            .unwrap(),
        );
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let heap = heap.clone();
                std::thread::spawn(move || {
                    let mut mine = Vec::new();
                    for round in 0..200 {
                        let index = heap.allocate_image_index().unwrap();
                        if round % 3 == 0 {
                            heap.release_image_index(index);
                        } else {
                            mine.push(index);
                        }
                    }
                    mine
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for thread in threads {
            for index in thread.join().unwrap() {
                assert!(seen.insert(index), "index {index} handed out twice");
            }
        }
        assert_eq!(heap.stats().images_live as usize, seen.len());
    }

    #[test]
    fn descriptor_buffer_writes_land_in_memory() {
        let caps = RuntimeCaps {
            descriptor_buffer: true,
            ..Default::default()
        };
        let sim = driver(caps, AdapterLimits::default());
        let heap = DescriptorHeap::new(sim.clone(), &HeapConfig::default()).unwrap();
        assert_eq!(heap.mode(), HeapMode::DescriptorBuffer);

        let index = heap.allocate_image_index().unwrap();
        let view = vk::ImageView::from_raw(0xabcd);
        heap.write_image(index, view, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .unwrap();

        let HeapStorage::DescriptorBuffer { buffer, .. } = &heap.resources.storage else {
            panic!("expected descriptor buffer storage");
        };
        let memory = sim.read_buffer(buffer.raw).unwrap();
        assert_eq!(&memory[..8], &0xabcdu64.to_le_bytes());
    }

    #[test]
    fn out_of_range_write_is_rejected() {
        let heap = DescriptorHeap::new(
            driver(RuntimeCaps::default(), AdapterLimits::default()),
            &HeapConfig {
                image_capacity: 4,
                sampler_capacity: 4,
            },
        )
        .unwrap();
        assert!(heap
            .write_sampler(4, vk::Sampler::null())
            .is_err());
    }

    #[test]
    fn drop_destroys_driver_objects() {
        let sim = driver(RuntimeCaps::default(), AdapterLimits::default());
        let heap = DescriptorHeap::new(sim.clone(), &HeapConfig::default()).unwrap();
        assert_eq!(sim.live_objects("pipeline layout"), 1);
        drop(heap);
        assert_eq!(sim.live_objects("pipeline layout"), 0);
        assert_eq!(sim.live_objects("descriptor pool"), 0);
        assert!(sim.violations().is_empty());
    }
}
