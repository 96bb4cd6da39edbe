//! GPU memory management.

use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Device memory sub-allocator.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
}

impl GpuAllocator {
    /// # Safety
    /// The instance, device, and physical device must be valid and outlive
    /// the allocator.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
        buffer_device_address: bool,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
        })
    }

    fn inner(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator already shut down".to_string()))
    }

    /// Allocate memory for a buffer (`linear`) or optimally tiled image.
    pub fn allocate(
        &mut self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        self.inner()?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(format!("{name}: {e}")))
    }

    pub fn free(&mut self, allocation: Allocation) -> Result<()> {
        self.inner()?
            .free(allocation)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    /// Release all device memory. Must run before the device is destroyed;
    /// outstanding allocations are reported as leaks.
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Snapshot of allocation counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryStats {
    pub live_buffers: u64,
    pub live_images: u64,
    pub live_bytes: u64,
    pub total_allocations: u64,
    pub allocations_per_second: f64,
}

/// Resource allocation accounting.
///
/// Each context owns a tracker; every update is mirrored into a process-wide
/// tracker readable through [`allocation_stats`].
#[derive(Debug)]
pub struct MemoryTracker {
    buffers: AtomicU64,
    images: AtomicU64,
    live_bytes: AtomicU64,
    total: AtomicU64,
    started: Instant,
}

static PROCESS: OnceLock<MemoryTracker> = OnceLock::new();

fn process() -> &'static MemoryTracker {
    PROCESS.get_or_init(MemoryTracker::default)
}

/// Allocation counters summed over every context in the process.
pub fn allocation_stats() -> MemoryStats {
    process().stats()
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self {
            buffers: AtomicU64::new(0),
            images: AtomicU64::new(0),
            live_bytes: AtomicU64::new(0),
            total: AtomicU64::new(0),
            started: Instant::now(),
        }
    }
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn buffer_created(&self, bytes: u64) {
        for tracker in [self, process()] {
            tracker.buffers.fetch_add(1, Ordering::Relaxed);
            tracker.created(bytes);
        }
    }

    pub(crate) fn image_created(&self, bytes: u64) {
        for tracker in [self, process()] {
            tracker.images.fetch_add(1, Ordering::Relaxed);
            tracker.created(bytes);
        }
    }

    fn created(&self, bytes: u64) {
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn buffer_destroyed(&self, bytes: u64) {
        for tracker in [self, process()] {
            tracker.buffers.fetch_sub(1, Ordering::Relaxed);
            tracker.live_bytes.fetch_sub(bytes, Ordering::Relaxed);
        }
    }

    pub(crate) fn image_destroyed(&self, bytes: u64) {
        for tracker in [self, process()] {
            tracker.images.fetch_sub(1, Ordering::Relaxed);
            tracker.live_bytes.fetch_sub(bytes, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> MemoryStats {
        let total = self.total.load(Ordering::Relaxed);
        let elapsed = self.started.elapsed().as_secs_f64();
        MemoryStats {
            live_buffers: self.buffers.load(Ordering::Relaxed),
            live_images: self.images.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            total_allocations: total,
            allocations_per_second: if elapsed > 0.0 {
                total as f64 / elapsed
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_counts_live_resources() {
        let tracker = MemoryTracker::new();
        tracker.buffer_created(256);
        tracker.buffer_created(64);
        tracker.image_created(4096);
        tracker.buffer_destroyed(64);

        let stats = tracker.stats();
        assert_eq!(stats.live_buffers, 1);
        assert_eq!(stats.live_images, 1);
        assert_eq!(stats.live_bytes, 256 + 4096);
        assert_eq!(stats.total_allocations, 3);
        assert!(stats.allocations_per_second >= 0.0);
    }

    #[test]
    fn updates_reach_the_process_counters() {
        let before = allocation_stats().total_allocations;
        let tracker = MemoryTracker::new();
        tracker.image_created(16);
        tracker.image_destroyed(16);
        assert!(allocation_stats().total_allocations > before);
    }
}
