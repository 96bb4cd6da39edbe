//! Deferred resource destruction.
//!
//! GPU resources cannot be freed the moment the host drops them, because
//! submitted work may still read them. Retired objects are tagged with every
//! queue's last submitted fence value and destroyed once all of those values
//! have completed.

use crate::descriptors::DescriptorHeap;
use crate::driver::{BufferAllocation, DriverRef, ImageAllocation};
use crate::error::Result;
use crate::fence::Fence;
use crate::memory::MemoryTracker;
use ash::vk;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// An object waiting for the GPU to finish with it.
#[derive(Debug)]
pub(crate) enum Retired {
    Buffer(BufferAllocation),
    Image(ImageAllocation),
    Sampler(vk::Sampler),
    ImageIndex(u32),
    SamplerIndex(u32),
}

struct PendingDestroy {
    item: Retired,
    /// One value per fence, in fence order.
    waits: Vec<u64>,
}

/// FIFO of retired objects keyed on fence snapshots.
pub struct DeferredDestroyQueue {
    pub(crate) driver: DriverRef,
    pub(crate) heap: Arc<DescriptorHeap>,
    pub(crate) memory: Arc<MemoryTracker>,
    fences: Vec<Arc<Fence>>,
    pending: Mutex<VecDeque<PendingDestroy>>,
}

impl DeferredDestroyQueue {
    pub(crate) fn new(
        driver: DriverRef,
        heap: Arc<DescriptorHeap>,
        memory: Arc<MemoryTracker>,
        fences: Vec<Arc<Fence>>,
    ) -> Self {
        Self {
            driver,
            heap,
            memory,
            fences,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue `item` for destruction after all currently submitted work.
    ///
    /// Objects no submission could reference are destroyed immediately.
    pub(crate) fn retire(&self, item: Retired) {
        let waits: Vec<u64> = self
            .fences
            .iter()
            .map(|fence| fence.last_submitted_value())
            .collect();
        let idle = self
            .fences
            .iter()
            .zip(&waits)
            .all(|(fence, value)| fence.last_seen_value() >= *value);

        let mut pending = self.pending.lock();
        if idle && pending.is_empty() {
            drop(pending);
            self.destroy(item);
        } else {
            pending.push_back(PendingDestroy { item, waits });
        }
    }

    /// Destroy every retired object whose fence values have completed.
    ///
    /// Returns how many objects were destroyed.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn process(&self) -> Result<usize> {
        let mut ready = Vec::new();
        {
            let mut pending = self.pending.lock();
            // Snapshots never decrease, so only the front can mature.
            while let Some(front) = pending.front() {
                if !self.is_complete(&front.waits)? {
                    break;
                }
                if let Some(entry) = pending.pop_front() {
                    ready.push(entry.item);
                }
            }
        }

        let count = ready.len();
        for item in ready {
            self.destroy(item);
        }
        if count > 0 {
            tracing::trace!("Destroyed {count} retired objects");
        }
        Ok(count)
    }

    /// Wait for every retired object's fence values, then destroy them all.
    pub fn flush(&self) -> Result<()> {
        let drained: Vec<PendingDestroy> = self.pending.lock().drain(..).collect();
        if let Some(last) = drained.last() {
            for (fence, value) in self.fences.iter().zip(&last.waits) {
                fence.wait(Some(*value))?;
            }
        }
        for entry in drained {
            self.destroy(entry.item);
        }
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn is_complete(&self, waits: &[u64]) -> Result<bool> {
        for (fence, value) in self.fences.iter().zip(waits) {
            if !fence.check(*value)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn destroy(&self, item: Retired) {
        let result = match item {
            Retired::Buffer(buffer) => {
                let size = buffer.size;
                self.memory.buffer_destroyed(size);
                self.driver.destroy_buffer(buffer)
            }
            Retired::Image(image) => {
                let size = image.size;
                self.memory.image_destroyed(size);
                self.driver.destroy_image(image)
            }
            Retired::Sampler(sampler) => {
                self.driver.destroy_sampler(sampler);
                Ok(())
            }
            Retired::ImageIndex(index) => {
                self.heap.release_image_index(index);
                Ok(())
            }
            Retired::SamplerIndex(index) => {
                self.heap.release_sampler_index(index);
                Ok(())
            }
        };
        if let Err(err) = result {
            tracing::error!("Failed to destroy retired object: {err}");
        }
    }
}

impl std::fmt::Debug for DeferredDestroyQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredDestroyQueue")
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl Drop for DeferredDestroyQueue {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            tracing::error!("Failed to flush deferred destruction: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::RuntimeCaps;
    use crate::descriptors::HeapConfig;
    use crate::driver::simulated::{CompletionMode, SimulatedAdapter, SimulatedDriver};
    use crate::driver::{BufferDesc, DeviceDriver, SubmitBatch};
    use gpu_allocator::MemoryLocation;

    struct Rig {
        sim: Arc<SimulatedDriver>,
        fence: Arc<Fence>,
        deferred: DeferredDestroyQueue,
    }

    fn rig() -> Rig {
        let sim = Arc::new(SimulatedDriver::new(
            SimulatedAdapter::discrete("sim").build(),
            RuntimeCaps::default(),
            CompletionMode::Manual,
        ));
        let heap = Arc::new(DescriptorHeap::new(sim.clone(), &HeapConfig::default()).unwrap());
        let fence = Arc::new(Fence::new(sim.clone()).unwrap());
        let deferred = DeferredDestroyQueue::new(
            sim.clone(),
            heap,
            Arc::new(MemoryTracker::new()),
            vec![fence.clone()],
        );
        Rig {
            sim,
            fence,
            deferred,
        }
    }

    fn buffer(rig: &Rig) -> BufferAllocation {
        let buffer = rig
            .sim
            .create_buffer(&BufferDesc {
                name: "test",
                size: 64,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                location: MemoryLocation::GpuOnly,
            })
            .unwrap();
        rig.deferred.memory.buffer_created(buffer.size);
        buffer
    }

    fn submit(rig: &Rig) -> u64 {
        let value = rig.fence.last_submitted_value() + 1;
        rig.sim
            .submit(
                vk::Queue::null(),
                &SubmitBatch {
                    command_buffers: &[],
                    waits: &[],
                    binary_waits: &[],
                    signal: rig.fence.semaphore(),
                    signal_value: value,
                    binary_signals: &[],
                },
            )
            .unwrap();
        rig.fence.advance_to(value)
    }

    #[test]
    fn idle_retirement_is_immediate() {
        let rig = rig();
        rig.deferred.retire(Retired::Buffer(buffer(&rig)));
        assert_eq!(rig.deferred.pending_count(), 0);
        assert_eq!(rig.sim.live_objects("buffer"), 0);
    }

    #[test]
    fn retired_objects_wait_for_their_fence_value() {
        let rig = rig();
        let first = submit(&rig);
        rig.deferred.retire(Retired::Buffer(buffer(&rig)));
        let second = submit(&rig);
        rig.deferred.retire(Retired::Buffer(buffer(&rig)));

        assert_eq!(rig.deferred.process().unwrap(), 0);
        rig.sim.complete_through(rig.fence.semaphore(), first);
        assert_eq!(rig.deferred.process().unwrap(), 1);
        assert_eq!(rig.sim.live_objects("buffer"), 1);

        rig.sim.complete_through(rig.fence.semaphore(), second);
        assert_eq!(rig.deferred.process().unwrap(), 1);
        assert_eq!(rig.sim.live_objects("buffer"), 0);
        assert_eq!(rig.deferred.memory.stats().live_buffers, 0);
        assert!(rig.sim.violations().is_empty());
    }

    #[test]
    fn flush_waits_then_destroys_everything() {
        let rig = rig();
        let value = submit(&rig);
        rig.deferred.retire(Retired::Buffer(buffer(&rig)));
        rig.deferred.retire(Retired::ImageIndex(rig.deferred.heap.allocate_image_index().unwrap()));

        let completer = {
            let sim = rig.sim.clone();
            let semaphore = rig.fence.semaphore();
            std::thread::spawn(move || sim.complete_through(semaphore, value))
        };
        rig.deferred.flush().unwrap();
        completer.join().unwrap();

        assert_eq!(rig.deferred.pending_count(), 0);
        assert_eq!(rig.sim.live_objects("buffer"), 0);
        assert_eq!(rig.deferred.heap.stats().images_live, 0);
    }
}
