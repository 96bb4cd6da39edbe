//! GPU context management.

use crate::capabilities::{AdapterInfo, RuntimeCaps};
use crate::config::ContextConfig;
use crate::deferred::DeferredDestroyQueue;
use crate::descriptors::{DescriptorHeap, HeapConfig, HeapStats};
use crate::driver::vulkan::{VulkanBackend, VulkanDevice};
use crate::driver::{Backend, BufferDesc, DriverRef, ImageDesc, SamplerDesc};
use crate::error::{GpuError, Result};
use crate::handle::Handle;
use crate::instance::InstanceBinding;
use crate::memory::{MemoryStats, MemoryTracker};
use crate::negotiate::{CapabilityNegotiator, NegotiatedDevice};
use crate::pipeline::{PipelineCache, PipelineCacheStats};
use crate::queue::{Queue, QueueKind, QueueStats};
use crate::resource::{self, Buffer, Image, Sampler};
use crate::shader::{Shader, ShaderRegistry, ShaderRequest, ShaderSource};
use crate::surface::SurfaceContext;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Root object of the runtime: one per device.
///
/// Owns the driver binding, descriptor heap, pipeline cache, shader registry
/// and queues. Dropping the context waits for the device to go idle and then
/// destroys everything exactly once.
pub struct Context {
    config: ContextConfig,
    adapter: AdapterInfo,
    negotiated: NegotiatedDevice,
    queues: BTreeMap<QueueKind, Vec<Queue>>,
    deferred: Arc<DeferredDestroyQueue>,
    shaders: ShaderRegistry,
    pipelines: Arc<PipelineCache>,
    heap: Arc<DescriptorHeap>,
    memory: Arc<MemoryTracker>,
    driver: DriverRef,
}

/// Snapshot of context bookkeeping.
#[derive(Debug, Clone)]
pub struct ContextStats {
    pub memory: MemoryStats,
    pub heap: HeapStats,
    pub pipelines: PipelineCacheStats,
    pub queues: Vec<(QueueKind, QueueStats)>,
    pub shaders: usize,
    pub pending_destroys: usize,
}

impl Context {
    fn assemble(config: ContextConfig, backend: &dyn Backend) -> Result<Self> {
        let adapters = backend.adapters()?;
        let negotiated = CapabilityNegotiator::new(config.require_presentation)
            .queues_per_role(config.queues_per_role)
            .negotiate(&adapters)?;
        let adapter = adapters
            .get(negotiated.adapter_index)
            .cloned()
            .ok_or(GpuError::NoSuitableDevice)?;

        let driver = backend.open_device(&adapter, &negotiated)?;
        let caps = negotiated.caps;

        let heap = Arc::new(DescriptorHeap::new(driver.clone(), &config.heap)?);
        let pipelines = Arc::new(PipelineCache::new(
            driver.clone(),
            heap.pipeline_layout(),
            caps,
        ));
        let shaders = ShaderRegistry::new(
            driver.clone(),
            heap.set_layout(),
            heap.push_constant_size(),
            caps.shader_object,
        );

        let mut queues: BTreeMap<QueueKind, Vec<Queue>> = BTreeMap::new();
        for role in &negotiated.queues {
            for index in 0..role.count {
                let queue = Queue::new(
                    driver.clone(),
                    role.kind,
                    role.family,
                    index,
                    heap.clone(),
                    pipelines.clone(),
                    config.pool_capacity,
                )?;
                queues.entry(role.kind).or_default().push(queue);
            }
        }

        let fences = queues
            .values()
            .flatten()
            .map(|queue| queue.fence().clone())
            .collect();
        let memory = Arc::new(MemoryTracker::new());
        let deferred = Arc::new(DeferredDestroyQueue::new(
            driver.clone(),
            heap.clone(),
            memory.clone(),
            fences,
        ));

        tracing::info!(
            "Context ready on {} ({caps}, {} queues)",
            adapter.name,
            queues.values().map(Vec::len).sum::<usize>()
        );

        Ok(Self {
            config,
            adapter,
            negotiated,
            queues,
            deferred,
            shaders,
            pipelines,
            heap,
            memory,
            driver,
        })
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    pub fn negotiated(&self) -> &NegotiatedDevice {
        &self.negotiated
    }

    /// Optional features the device ended up with.
    pub fn caps(&self) -> RuntimeCaps {
        self.negotiated.caps
    }

    pub fn driver(&self) -> &DriverRef {
        &self.driver
    }

    /// The Vulkan device, unless the context runs on another backend.
    pub fn vulkan(&self) -> Option<&VulkanDevice> {
        self.driver.vulkan()
    }

    pub fn heap(&self) -> &Arc<DescriptorHeap> {
        &self.heap
    }

    pub fn pipelines(&self) -> &Arc<PipelineCache> {
        &self.pipelines
    }

    pub fn shaders(&self) -> &ShaderRegistry {
        &self.shaders
    }

    pub fn memory(&self) -> &MemoryTracker {
        &self.memory
    }

    /// Queue `index` of role `kind`.
    ///
    /// Roles the device has no dedicated family for are served by the
    /// graphics queues.
    pub fn queue(&self, kind: QueueKind, index: usize) -> Result<&Queue> {
        let queues = self
            .queues
            .get(&kind)
            .or_else(|| self.queues.get(&QueueKind::Graphics))
            .ok_or_else(|| GpuError::InvalidState(format!("no queue serves the {kind} role")))?;
        queues.get(index).ok_or_else(|| {
            GpuError::InvalidState(format!(
                "{kind} queue {index} requested but only {} exist",
                queues.len()
            ))
        })
    }

    pub fn graphics_queue(&self) -> Result<&Queue> {
        self.queue(QueueKind::Graphics, 0)
    }

    /// Every queue, grouped by role.
    pub fn queues(&self) -> impl Iterator<Item = &Queue> {
        self.queues.values().flatten()
    }

    pub fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<Buffer> {
        resource::create_buffer(&self.deferred, desc)
    }

    /// Create a 2D image. Sampled images are written into the heap.
    pub fn create_image(&self, desc: &ImageDesc<'_>) -> Result<Image> {
        resource::create_image(&self.deferred, desc)
    }

    pub fn create_sampler(&self, desc: &SamplerDesc) -> Result<Sampler> {
        resource::create_sampler(&self.deferred, desc)
    }

    /// Retire a buffer, image or sampler and drop `handle`.
    ///
    /// Other clones can no longer [`Handle::acquire`] it. The object is
    /// destroyed after the last clone is gone and the GPU work submitted up to
    /// that point has completed.
    pub fn destroy<T>(&self, handle: Handle<T>) -> Result<()> {
        handle.release()?;
        self.deferred.process()?;
        Ok(())
    }

    pub fn register_shader(
        &self,
        stage: vk::ShaderStageFlags,
        entry: &str,
        code: &[u32],
    ) -> Result<Arc<Shader>> {
        self.shaders.register(stage, entry, code)
    }

    pub fn load_shader(
        &self,
        source: &dyn ShaderSource,
        request: &ShaderRequest<'_>,
        stage: vk::ShaderStageFlags,
        entry: &str,
    ) -> Result<Arc<Shader>> {
        self.shaders.load(source, request, stage, entry)
    }

    /// Reclaim finished command lists and destroy retired resources.
    ///
    /// Call once per frame. Returns the number of resources destroyed.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn collect_garbage(&self) -> Result<usize> {
        for queue in self.queues() {
            queue.clear_pending_command_lists()?;
        }
        self.deferred.process()
    }

    /// Wait for every queue to drain.
    pub fn wait_idle(&self) -> Result<()> {
        for queue in self.queues() {
            queue.wait_idle()?;
        }
        self.driver.wait_idle()?;
        self.deferred.process()?;
        Ok(())
    }

    pub fn stats(&self) -> ContextStats {
        ContextStats {
            memory: self.memory.stats(),
            heap: self.heap.stats(),
            pipelines: self.pipelines.stats(),
            queues: self
                .queues()
                .map(|queue| (queue.kind(), queue.stats()))
                .collect(),
            shaders: self.shaders.len(),
            pending_destroys: self.deferred.pending_count(),
        }
    }

    pub(crate) fn deferred(&self) -> &Arc<DeferredDestroyQueue> {
        &self.deferred
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(err) = self.wait_idle() {
            tracing::error!("Context teardown: wait idle failed: {err}");
        }
        if let Err(err) = self.deferred.flush() {
            tracing::error!("Context teardown: deferred flush failed: {err}");
        }
        // Pipelines reference shader modules, so they go first.
        self.pipelines.destroy();
        self.shaders.destroy();
        tracing::debug!("Context destroyed");
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("adapter", &self.adapter.name)
            .field("caps", &self.negotiated.caps)
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}

/// Builder for creating a [`Context`].
#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    config: ContextConfig,
}

impl ContextBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a loaded configuration.
    pub fn from_config(config: ContextConfig) -> Self {
        Self { config }
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.config.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.config.validation = enable;
        self
    }

    /// Only accept adapters that can present.
    pub fn require_presentation(mut self, require: bool) -> Self {
        self.config.require_presentation = require;
        self
    }

    pub fn heap(mut self, heap: HeapConfig) -> Self {
        self.config.heap = heap;
        self
    }

    pub fn pool_capacity(mut self, capacity: u32) -> Self {
        self.config.pool_capacity = capacity;
        self
    }

    pub fn queues_per_role(mut self, count: u32) -> Self {
        self.config.queues_per_role = count;
        self
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Build a headless context on the system Vulkan driver.
    pub fn build(self) -> Result<Context> {
        let config = self.config.with_env_overrides();
        let instance = Arc::new(InstanceBinding::new(
            &config.app_name,
            config.validation,
            false,
        )?);
        let backend = VulkanBackend::new(instance, None);
        Context::assemble(config, &backend)
    }

    /// Build a context that can present to `window`.
    ///
    /// Returns the surface alongside the context for swapchain creation.
    ///
    /// # Safety
    /// The window must outlive the context and the surface.
    pub unsafe fn build_for_window<W>(self, window: &W) -> Result<(Context, Arc<SurfaceContext>)>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let mut config = self.config.with_env_overrides();
        config.require_presentation = true;
        let instance = Arc::new(InstanceBinding::new(
            &config.app_name,
            config.validation,
            true,
        )?);
        // SAFETY: guaranteed by the caller.
        let surface = Arc::new(unsafe { SurfaceContext::from_window(&instance, window) }?);
        let backend = VulkanBackend::new(instance, Some(surface.clone()));
        let context = Context::assemble(config, &backend)?;
        Ok((context, surface))
    }

    /// Build against an explicit backend, e.g. a simulated one.
    pub fn build_with(self, backend: &dyn Backend) -> Result<Context> {
        Context::assemble(self.config.with_env_overrides(), backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::simulated::{SimulatedAdapter, SimulatedBackend};
    use crate::queue::SubmitInfo;
    use gpu_allocator::MemoryLocation;

    fn simulated(adapter: SimulatedAdapter) -> (Context, SimulatedBackend) {
        let backend = SimulatedBackend::new([adapter]);
        let context = ContextBuilder::new()
            .heap(HeapConfig {
                image_capacity: 64,
                sampler_capacity: 16,
            })
            .build_with(&backend)
            .unwrap();
        (context, backend)
    }

    #[test]
    fn creates_two_queues_per_planned_role() {
        let (context, _backend) = simulated(SimulatedAdapter::discrete("sim"));
        let kinds: Vec<QueueKind> = context.queues().map(Queue::kind).collect();
        assert_eq!(
            kinds,
            vec![
                QueueKind::Graphics,
                QueueKind::Graphics,
                QueueKind::AsyncCompute,
                QueueKind::AsyncCompute,
                QueueKind::Transfer,
                QueueKind::Transfer
            ]
        );
        assert_eq!(context.queue(QueueKind::Graphics, 1).unwrap().index(), 1);
        assert!(context.queue(QueueKind::Graphics, 2).is_err());
    }

    #[test]
    fn missing_roles_fall_back_to_graphics() {
        let (context, _backend) = simulated(SimulatedAdapter::discrete("sim").single_queue_family());
        let transfer = context.queue(QueueKind::Transfer, 0).unwrap();
        assert_eq!(transfer.kind(), QueueKind::Graphics);
    }

    #[test]
    fn drop_destroys_every_driver_object() {
        let (context, backend) = simulated(SimulatedAdapter::discrete("sim"));
        let sim = backend.driver().unwrap();

        let buffer = context
            .create_buffer(&BufferDesc {
                name: "vertices",
                size: 256,
                usage: vk::BufferUsageFlags::VERTEX_BUFFER,
                location: MemoryLocation::GpuOnly,
            })
            .unwrap();
        let queue = context.graphics_queue().unwrap();
        let list = queue.begin().unwrap();
        queue.submit(vec![list], SubmitInfo::default()).unwrap();
        drop(buffer);

        context.collect_garbage().unwrap();
        let stats = context.stats();
        assert_eq!(stats.memory.live_buffers, 0);
        assert_eq!(stats.pending_destroys, 0);
        drop(context);

        assert_eq!(sim.total_live_objects(), 0);
        assert!(sim.violations().is_empty());
    }
}
