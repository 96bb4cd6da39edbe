//! In-memory device for headless testing.
//!
//! [`SimulatedDriver`] hands out fabricated handles, keeps timeline values in
//! host memory and records everything the runtime asks of it so tests can
//! assert on command streams, pipeline creation and object lifetimes.
//! Usage errors a validation layer would catch are collected as violations.

use super::{
    Backend, BufferAllocation, BufferDesc, Command, DescriptorWrite, DeviceDriver, DriverRef,
    GraphicsPipelineDesc, HeapDesc, HeapResources, HeapStorage, ImageAllocation, ImageBarrier,
    ImageDesc, PipelineFragment, SamplerDesc, ShaderDesc, ShaderHandles, ShaderStageRef,
    SubmitBatch,
};
use crate::capabilities::{
    AdapterInfo, AdapterLimits, DeviceFeatures, GpuVendor, QueueFamilyInfo, RuntimeCaps,
};
use crate::error::{GpuError, Result};
use crate::negotiate::NegotiatedDevice;
use crate::pipeline::{DynamicState, GraphicsState};
use crate::shader::SPIRV_MAGIC;
use ash::vk::{self, Handle};
use gpu_allocator::MemoryLocation;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::ffi::CStr;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Every optional device extension the runtime knows about.
pub const KNOWN_EXTENSIONS: [&CStr; 6] = [
    ash::khr::swapchain::NAME,
    ash::ext::descriptor_buffer::NAME,
    ash::khr::pipeline_library::NAME,
    ash::ext::graphics_pipeline_library::NAME,
    ash::ext::host_image_copy::NAME,
    ash::ext::shader_object::NAME,
];

const IMAGE_DESCRIPTOR_SIZE: u64 = 32;
const SAMPLER_DESCRIPTOR_SIZE: u64 = 16;

/// Builder for fake adapters.
#[derive(Debug, Clone)]
pub struct SimulatedAdapter {
    info: AdapterInfo,
}

impl SimulatedAdapter {
    /// A discrete GPU supporting every known extension and feature, with a
    /// combined family, an async compute family and a transfer family.
    pub fn discrete(name: &str) -> Self {
        Self {
            info: AdapterInfo {
                physical_device: vk::PhysicalDevice::null(),
                name: name.to_string(),
                vendor: GpuVendor::Other(0),
                device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
                api_version: vk::API_VERSION_1_3,
                driver_version: 1,
                device_local_memory_mb: 8192,
                limits: AdapterLimits::default(),
                queue_families: vec![
                    QueueFamilyInfo {
                        index: 0,
                        flags: vk::QueueFlags::GRAPHICS
                            | vk::QueueFlags::COMPUTE
                            | vk::QueueFlags::TRANSFER,
                        queue_count: 16,
                        supports_present: true,
                    },
                    QueueFamilyInfo {
                        index: 1,
                        flags: vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                        queue_count: 4,
                        supports_present: false,
                    },
                    QueueFamilyInfo {
                        index: 2,
                        flags: vk::QueueFlags::TRANSFER,
                        queue_count: 2,
                        supports_present: false,
                    },
                ],
                extensions: KNOWN_EXTENSIONS
                    .iter()
                    .map(|name| name.to_string_lossy().into_owned())
                    .collect(),
                features: DeviceFeatures::all(),
            },
        }
    }

    /// Same as [`Self::discrete`] but reported as an integrated GPU.
    pub fn integrated(name: &str) -> Self {
        let mut adapter = Self::discrete(name);
        adapter.info.device_type = vk::PhysicalDeviceType::INTEGRATED_GPU;
        adapter.info.device_local_memory_mb = 512;
        adapter
    }

    pub fn without_extension(mut self, name: &CStr) -> Self {
        let name = name.to_string_lossy();
        self.info.extensions.retain(|ext| *ext != name);
        self
    }

    pub fn without_feature(mut self, feature: DeviceFeatures) -> Self {
        self.info.features.remove(feature);
        self
    }

    /// Only the combined graphics family.
    pub fn single_queue_family(mut self) -> Self {
        self.info.queue_families.truncate(1);
        self
    }

    pub fn presentable(mut self, present: bool) -> Self {
        for family in &mut self.info.queue_families {
            family.supports_present = present && family.flags.contains(vk::QueueFlags::GRAPHICS);
        }
        self
    }

    pub fn api_version(mut self, version: u32) -> Self {
        self.info.api_version = version;
        self
    }

    pub fn limits(mut self, limits: AdapterLimits) -> Self {
        self.info.limits = limits;
        self
    }

    pub fn build(self) -> AdapterInfo {
        self.info
    }
}

impl From<SimulatedAdapter> for AdapterInfo {
    fn from(adapter: SimulatedAdapter) -> Self {
        adapter.info
    }
}

/// When submitted work completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// A batch completes as soon as its waits are satisfied.
    #[default]
    Immediate,
    /// Timelines only advance through [`SimulatedDriver::complete_through`]
    /// or host signals.
    Manual,
}

/// Owned copy of a recorded command.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BindDescriptorHeap(vk::PipelineBindPoint),
    BindPipeline(vk::PipelineBindPoint, vk::Pipeline),
    BindShaders(Vec<vk::ShaderStageFlags>),
    SetGraphicsState(GraphicsState),
    SetDynamicState(DynamicState),
    BeginRendering {
        extent: vk::Extent2D,
        color_count: usize,
        has_depth: bool,
        view_mask: u32,
    },
    EndRendering,
    SetViewport(vk::Extent2D),
    PushConstants { offset: u32, data: Vec<u8> },
    Draw { vertex_count: u32, instance_count: u32 },
    Dispatch([u32; 3]),
    ImageBarrier(ImageBarrier),
    CopyBuffer { src: vk::Buffer, dst: vk::Buffer, bytes: u64 },
    CopyBufferToImage { src: vk::Buffer, dst: vk::Image },
    BlitMip { image: vk::Image, src_mip: u32 },
}

impl RecordedCommand {
    fn from_command(command: &Command<'_>) -> Self {
        match *command {
            Command::BindDescriptorHeap { bind_point, .. } => Self::BindDescriptorHeap(bind_point),
            Command::BindPipeline {
                bind_point,
                pipeline,
            } => Self::BindPipeline(bind_point, pipeline),
            Command::BindShaders { stages, .. } => Self::BindShaders(stages.to_vec()),
            Command::SetGraphicsState(state) => Self::SetGraphicsState(*state),
            Command::SetDynamicState(state) => Self::SetDynamicState(*state),
            Command::BeginRendering(desc) => Self::BeginRendering {
                extent: desc.extent,
                color_count: desc.colors.len(),
                has_depth: desc.depth.is_some(),
                view_mask: desc.view_mask,
            },
            Command::EndRendering => Self::EndRendering,
            Command::SetViewport(extent) => Self::SetViewport(extent),
            Command::PushConstants { offset, data, .. } => Self::PushConstants {
                offset,
                data: data.to_vec(),
            },
            Command::Draw {
                vertex_count,
                instance_count,
                ..
            } => Self::Draw {
                vertex_count,
                instance_count,
            },
            Command::Dispatch(groups) => Self::Dispatch(groups),
            Command::ImageBarrier(barrier) => Self::ImageBarrier(*barrier),
            Command::CopyBuffer { src, dst, regions } => Self::CopyBuffer {
                src,
                dst,
                bytes: regions.iter().map(|r| r.size).sum(),
            },
            Command::CopyBufferToImage { src, dst, .. } => Self::CopyBufferToImage { src, dst },
            Command::BlitMip { image, src_mip, .. } => Self::BlitMip { image, src_mip },
        }
    }
}

/// One recorded pipeline creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineRecord {
    /// A library fragment of the named kind.
    Fragment(&'static str),
    /// A pipeline linked from this many fragments.
    Linked(usize),
    /// A graphics pipeline compiled in one step.
    Monolithic,
    Compute,
}

/// One recorded queue submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRecord {
    pub queue: vk::Queue,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub waits: Vec<(vk::Semaphore, u64)>,
    pub signal: (vk::Semaphore, u64),
    pub binary_waits: usize,
    pub binary_signals: usize,
}

#[derive(Default)]
struct CommandBufferState {
    pool: u64,
    recording: bool,
    commands: Vec<RecordedCommand>,
    last_submit: Option<(u64, u64)>,
}

struct PendingBatch {
    waits: Vec<(u64, u64)>,
    signal: (u64, u64),
}

#[derive(Default)]
struct SimState {
    timelines: HashMap<u64, u64>,
    highest_submitted: HashMap<u64, u64>,
    pending: Vec<PendingBatch>,
    queues: HashMap<(u32, u32), vk::Queue>,
    command_buffers: HashMap<u64, CommandBufferState>,
    submissions: Vec<SubmitRecord>,
    pipelines: Vec<PipelineRecord>,
    descriptor_writes: Vec<DescriptorWrite>,
    host_copies: Vec<(vk::Image, usize)>,
    memory: HashMap<u64, Box<[u8]>>,
    live: HashMap<u64, &'static str>,
    violations: Vec<String>,
    fail_next_submit: Option<vk::Result>,
    device_waits: usize,
}

impl SimState {
    /// Apply every pending batch whose waits are satisfied, until nothing moves.
    fn retire_ready(&mut self) {
        loop {
            let timelines = &self.timelines;
            let ready = self.pending.iter().position(|batch| {
                batch
                    .waits
                    .iter()
                    .all(|(sem, value)| timelines.get(sem).copied().unwrap_or(0) >= *value)
            });
            let Some(index) = ready else { break };
            let batch = self.pending.remove(index);
            let (sem, value) = batch.signal;
            let current = self.timelines.entry(sem).or_insert(0);
            *current = (*current).max(value);
        }
    }

    fn release(&mut self, raw: u64, kind: &'static str) {
        if raw == 0 {
            return;
        }
        match self.live.remove(&raw) {
            Some(live_kind) if live_kind == kind => {}
            Some(live_kind) => self.violations.push(format!(
                "destroyed {live_kind} {raw:#x} through the {kind} entry point"
            )),
            None => self
                .violations
                .push(format!("{kind} {raw:#x} destroyed twice or never created")),
        }
    }

    fn check_live(&mut self, raw: u64, kind: &'static str, op: &str) {
        if raw != 0 && self.live.get(&raw) != Some(&kind) {
            self.violations
                .push(format!("{op} used dead or unknown {kind} {raw:#x}"));
        }
    }
}

/// Fake device behind the [`DeviceDriver`] trait.
pub struct SimulatedDriver {
    adapter: AdapterInfo,
    caps: RuntimeCaps,
    mode: CompletionMode,
    next_handle: AtomicU64,
    state: Mutex<SimState>,
    timeline_changed: Condvar,
}

impl SimulatedDriver {
    pub fn new(adapter: AdapterInfo, caps: RuntimeCaps, mode: CompletionMode) -> Self {
        Self {
            adapter,
            caps,
            mode,
            next_handle: AtomicU64::new(0x1000),
            state: Mutex::new(SimState::default()),
            timeline_changed: Condvar::new(),
        }
    }

    fn fabricate<H: Handle>(&self, state: &mut SimState, kind: &'static str) -> H {
        let raw = self.next_handle.fetch_add(1, Ordering::Relaxed);
        state.live.insert(raw, kind);
        H::from_raw(raw)
    }

    /// Advance a timeline as if the GPU finished everything up to `value`.
    pub fn complete_through(&self, semaphore: vk::Semaphore, value: u64) {
        let mut state = self.state.lock();
        let current = state.timelines.entry(semaphore.as_raw()).or_insert(0);
        *current = (*current).max(value);
        state.retire_ready();
        self.timeline_changed.notify_all();
    }

    /// Complete every submitted batch.
    pub fn complete_all(&self) {
        let mut state = self.state.lock();
        let targets: Vec<(u64, u64)> = state
            .highest_submitted
            .iter()
            .map(|(sem, value)| (*sem, *value))
            .collect();
        for (sem, value) in targets {
            let current = state.timelines.entry(sem).or_insert(0);
            *current = (*current).max(value);
        }
        state.pending.clear();
        self.timeline_changed.notify_all();
    }

    /// Make the next submission fail with `result`.
    pub fn fail_next_submit(&self, result: vk::Result) {
        self.state.lock().fail_next_submit = Some(result);
    }

    /// Commands recorded into `cmd` since its last begin.
    pub fn recorded(&self, cmd: vk::CommandBuffer) -> Vec<RecordedCommand> {
        self.state
            .lock()
            .command_buffers
            .get(&cmd.as_raw())
            .map(|cb| cb.commands.clone())
            .unwrap_or_default()
    }

    pub fn submissions(&self) -> Vec<SubmitRecord> {
        self.state.lock().submissions.clone()
    }

    pub fn pipeline_records(&self) -> Vec<PipelineRecord> {
        self.state.lock().pipelines.clone()
    }

    pub fn descriptor_writes(&self) -> Vec<DescriptorWrite> {
        self.state.lock().descriptor_writes.clone()
    }

    /// Images written through host image copy, with byte counts.
    pub fn host_copies(&self) -> Vec<(vk::Image, usize)> {
        self.state.lock().host_copies.clone()
    }

    /// Number of live objects of `kind` ("buffer", "pipeline", ...).
    pub fn live_objects(&self, kind: &str) -> usize {
        self.state
            .lock()
            .live
            .values()
            .filter(|live| **live == kind)
            .count()
    }

    /// Live objects that need explicit destruction. Queues are owned by the
    /// device and are not counted.
    pub fn total_live_objects(&self) -> usize {
        self.state
            .lock()
            .live
            .values()
            .filter(|live| **live != "queue")
            .count()
    }

    /// Usage errors observed so far.
    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    /// Number of device-wide idle waits.
    pub fn device_waits(&self) -> usize {
        self.state.lock().device_waits
    }

    /// Contents of a host-visible buffer.
    pub fn read_buffer(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state
            .lock()
            .memory
            .get(&buffer.as_raw())
            .map(|bytes| bytes.to_vec())
    }
}

impl DeviceDriver for SimulatedDriver {
    fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    fn caps(&self) -> RuntimeCaps {
        self.caps
    }

    fn queue(&self, family: u32, index: u32) -> vk::Queue {
        let mut state = self.state.lock();
        if let Some(queue) = state.queues.get(&(family, index)) {
            return *queue;
        }
        let queue = self.fabricate(&mut state, "queue");
        state.queues.insert((family, index), queue);
        queue
    }

    fn create_timeline(&self, initial_value: u64) -> Result<vk::Semaphore> {
        let mut state = self.state.lock();
        let semaphore: vk::Semaphore = self.fabricate(&mut state, "semaphore");
        state.timelines.insert(semaphore.as_raw(), initial_value);
        Ok(semaphore)
    }

    fn timeline_value(&self, semaphore: vk::Semaphore) -> Result<u64> {
        self.state
            .lock()
            .timelines
            .get(&semaphore.as_raw())
            .copied()
            .ok_or_else(|| GpuError::InvalidState(format!("unknown timeline {semaphore:?}")))
    }

    fn wait_timeline(&self, semaphore: vk::Semaphore, value: u64, timeout_ns: u64) -> Result<bool> {
        let deadline = Instant::now().checked_add(Duration::from_nanos(timeout_ns));
        let mut state = self.state.lock();
        loop {
            let current = state
                .timelines
                .get(&semaphore.as_raw())
                .copied()
                .ok_or_else(|| GpuError::InvalidState(format!("unknown timeline {semaphore:?}")))?;
            if current >= value {
                return Ok(true);
            }
            if timeout_ns == 0 {
                return Ok(false);
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .timeline_changed
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        let current = state.timelines.get(&semaphore.as_raw()).copied();
                        return Ok(current.is_some_and(|current| current >= value));
                    }
                }
                None => self.timeline_changed.wait(&mut state),
            }
        }
    }

    fn signal_timeline(&self, semaphore: vk::Semaphore, value: u64) -> Result<()> {
        let mut state = self.state.lock();
        let current = state
            .timelines
            .get_mut(&semaphore.as_raw())
            .ok_or_else(|| GpuError::InvalidState(format!("unknown timeline {semaphore:?}")))?;
        if value <= *current {
            // Timeline values must strictly increase.
            state.violations.push(format!(
                "host signal of {semaphore:?} to {value} does not advance the timeline"
            ));
            return Ok(());
        }
        *current = value;
        state.retire_ready();
        self.timeline_changed.notify_all();
        Ok(())
    }

    fn create_binary_semaphore(&self) -> Result<vk::Semaphore> {
        let mut state = self.state.lock();
        Ok(self.fabricate(&mut state, "semaphore"))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.timelines.remove(&semaphore.as_raw());
        state.release(semaphore.as_raw(), "semaphore");
    }

    fn create_command_pool(&self, _family: u32) -> Result<vk::CommandPool> {
        let mut state = self.state.lock();
        Ok(self.fabricate(&mut state, "command pool"))
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let mut state = self.state.lock();
        state.check_live(pool.as_raw(), "command pool", "vkAllocateCommandBuffers");
        let cmd: vk::CommandBuffer = self.fabricate(&mut state, "command buffer");
        state.command_buffers.insert(
            cmd.as_raw(),
            CommandBufferState {
                pool: pool.as_raw(),
                ..Default::default()
            },
        );
        Ok(cmd)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        state.release(pool.as_raw(), "command pool");
        // Buffers are freed with their pool.
        let freed: Vec<u64> = state
            .command_buffers
            .iter()
            .filter(|(_, cb)| cb.pool == pool.as_raw())
            .map(|(raw, _)| *raw)
            .collect();
        for raw in freed {
            state.command_buffers.remove(&raw);
            state.live.remove(&raw);
        }
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        let raw = cmd.as_raw();
        let Some(cb) = state.command_buffers.get(&raw) else {
            return Err(GpuError::InvalidState(format!("unknown command buffer {cmd:?}")));
        };
        let mut problem = None;
        if cb.recording {
            problem = Some(format!("{cmd:?} begun while already recording"));
        } else if let Some((sem, value)) = cb.last_submit {
            let done = state.timelines.get(&sem).copied().unwrap_or(u64::MAX);
            if done < value {
                problem = Some(format!(
                    "{cmd:?} reused while its submission at value {value} is pending"
                ));
            }
        }
        if let Some(problem) = problem {
            state.violations.push(problem);
        }
        if let Some(cb) = state.command_buffers.get_mut(&raw) {
            cb.recording = true;
            cb.commands.clear();
        }
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        match state.command_buffers.get_mut(&cmd.as_raw()) {
            Some(cb) if cb.recording => {
                cb.recording = false;
                Ok(())
            }
            Some(_) => {
                state
                    .violations
                    .push(format!("{cmd:?} ended while not recording"));
                Ok(())
            }
            None => Err(GpuError::InvalidState(format!("unknown command buffer {cmd:?}"))),
        }
    }

    fn record(&self, cmd: vk::CommandBuffer, command: &Command<'_>) {
        let mut state = self.state.lock();
        match state.command_buffers.get_mut(&cmd.as_raw()) {
            Some(cb) if cb.recording => cb.commands.push(RecordedCommand::from_command(command)),
            _ => state.violations.push(format!(
                "{} recorded into {cmd:?} outside of recording",
                command.name()
            )),
        }
    }

    fn submit(&self, queue: vk::Queue, batch: &SubmitBatch<'_>) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(result) = state.fail_next_submit.take() {
            return Err(GpuError::vulkan("vkQueueSubmit2", result));
        }

        let signal = (batch.signal.as_raw(), batch.signal_value);
        for cmd in batch.command_buffers {
            let problem = match state.command_buffers.get_mut(&cmd.as_raw()) {
                Some(cb) if cb.recording => Some(format!("{cmd:?} submitted while recording")),
                Some(cb) => {
                    cb.last_submit = Some(signal);
                    None
                }
                None => Some(format!("unknown {cmd:?} submitted")),
            };
            if let Some(problem) = problem {
                state.violations.push(problem);
            }
        }

        state.submissions.push(SubmitRecord {
            queue,
            command_buffers: batch.command_buffers.to_vec(),
            waits: batch
                .waits
                .iter()
                .map(|wait| (wait.semaphore, wait.value))
                .collect(),
            signal: (batch.signal, batch.signal_value),
            binary_waits: batch.binary_waits.len(),
            binary_signals: batch.binary_signals.len(),
        });

        let highest = state.highest_submitted.entry(signal.0).or_insert(0);
        *highest = (*highest).max(signal.1);

        if self.mode == CompletionMode::Immediate {
            state.pending.push(PendingBatch {
                waits: batch
                    .waits
                    .iter()
                    .map(|wait| (wait.semaphore.as_raw(), wait.value))
                    .collect(),
                signal,
            });
            state.retire_ready();
            self.timeline_changed.notify_all();
        }
        Ok(())
    }

    fn queue_wait_idle(&self, _queue: vk::Queue) -> Result<()> {
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        self.state.lock().device_waits += 1;
        // The simulated device drains on idle waits even in manual mode.
        self.complete_all();
        Ok(())
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<BufferAllocation> {
        if desc.size == 0 {
            return Err(GpuError::AllocationFailed(format!(
                "buffer '{}' has zero size",
                desc.name
            )));
        }
        let mut state = self.state.lock();
        let raw: vk::Buffer = self.fabricate(&mut state, "buffer");
        let mapped = match desc.location {
            MemoryLocation::CpuToGpu | MemoryLocation::GpuToCpu => {
                let mut memory = vec![0u8; desc.size as usize].into_boxed_slice();
                let ptr = NonNull::new(memory.as_mut_ptr());
                state.memory.insert(raw.as_raw(), memory);
                ptr
            }
            _ => None,
        };
        let device_address = if desc
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
        {
            raw.as_raw() << 16
        } else {
            0
        };
        Ok(BufferAllocation {
            raw,
            size: desc.size,
            location: desc.location,
            device_address,
            mapped,
            allocation: None,
        })
    }

    fn destroy_buffer(&self, buffer: BufferAllocation) -> Result<()> {
        let mut state = self.state.lock();
        state.memory.remove(&buffer.raw.as_raw());
        state.release(buffer.raw.as_raw(), "buffer");
        Ok(())
    }

    fn create_image(&self, desc: &ImageDesc<'_>) -> Result<ImageAllocation> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(GpuError::AllocationFailed(format!(
                "image '{}' has an empty extent",
                desc.name
            )));
        }
        let mut state = self.state.lock();
        let raw = self.fabricate(&mut state, "image");
        let view = self.fabricate(&mut state, "image view");
        let base = u64::from(desc.extent.width) * u64::from(desc.extent.height) * 4;
        let size = (0..desc.mip_levels.max(1)).map(|mip| (base >> (2 * mip)).max(4)).sum();
        Ok(ImageAllocation {
            raw,
            view,
            format: desc.format,
            extent: desc.extent,
            mip_levels: desc.mip_levels.max(1),
            usage: desc.usage,
            size,
            allocation: None,
        })
    }

    fn destroy_image(&self, image: ImageAllocation) -> Result<()> {
        let mut state = self.state.lock();
        state.release(image.view.as_raw(), "image view");
        state.release(image.raw.as_raw(), "image");
        Ok(())
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> Result<vk::Sampler> {
        let mut state = self.state.lock();
        Ok(self.fabricate(&mut state, "sampler"))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.state.lock().release(sampler.as_raw(), "sampler");
    }

    fn copy_memory_to_image(&self, image: &ImageAllocation, data: &[u8]) -> Result<()> {
        if !self.caps.host_image_copy {
            return Err(GpuError::InvalidState(
                "host image copy used without the capability".to_string(),
            ));
        }
        let mut state = self.state.lock();
        state.check_live(image.raw.as_raw(), "image", "vkCopyMemoryToImageEXT");
        state.host_copies.push((image.raw, data.len()));
        Ok(())
    }

    fn create_descriptor_heap(&self, desc: &HeapDesc) -> Result<HeapResources> {
        let storage = if self.caps.descriptor_buffer {
            let image_bytes = u64::from(desc.image_capacity) * IMAGE_DESCRIPTOR_SIZE;
            let sampler_bytes = u64::from(desc.sampler_capacity) * SAMPLER_DESCRIPTOR_SIZE;
            let buffer = self.create_buffer(&BufferDesc {
                name: "descriptor heap",
                size: image_bytes + sampler_bytes,
                usage: vk::BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER_EXT
                    | vk::BufferUsageFlags::SAMPLER_DESCRIPTOR_BUFFER_EXT
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                location: MemoryLocation::CpuToGpu,
            })?;
            HeapStorage::DescriptorBuffer {
                buffer,
                image_offset: 0,
                image_stride: IMAGE_DESCRIPTOR_SIZE,
                sampler_offset: image_bytes,
                sampler_stride: SAMPLER_DESCRIPTOR_SIZE,
            }
        } else {
            let mut state = self.state.lock();
            HeapStorage::DescriptorSet {
                pool: self.fabricate(&mut state, "descriptor pool"),
                set: vk::DescriptorSet::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed)),
            }
        };

        let mut state = self.state.lock();
        Ok(HeapResources {
            set_layout: self.fabricate(&mut state, "descriptor set layout"),
            pipeline_layout: self.fabricate(&mut state, "pipeline layout"),
            push_constant_size: desc.push_constant_size,
            storage,
        })
    }

    fn write_descriptor(&self, heap: &HeapResources, write: &DescriptorWrite) {
        if let HeapStorage::DescriptorBuffer {
            buffer,
            image_offset,
            image_stride,
            sampler_offset,
            sampler_stride,
        } = &heap.storage
        {
            let (offset, raw) = match *write {
                DescriptorWrite::Image { index, view, .. } => {
                    (image_offset + u64::from(index) * image_stride, view.as_raw())
                }
                DescriptorWrite::Sampler { index, sampler } => {
                    (sampler_offset + u64::from(index) * sampler_stride, sampler.as_raw())
                }
            };
            let mut state = self.state.lock();
            if let Some(memory) = state.memory.get_mut(&buffer.raw.as_raw()) {
                let start = offset as usize;
                memory[start..start + 8].copy_from_slice(&raw.to_le_bytes());
            }
        }
        self.state.lock().descriptor_writes.push(*write);
    }

    fn destroy_descriptor_heap(&self, heap: HeapResources) {
        {
            let mut state = self.state.lock();
            state.release(heap.pipeline_layout.as_raw(), "pipeline layout");
            state.release(heap.set_layout.as_raw(), "descriptor set layout");
        }
        match heap.storage {
            HeapStorage::DescriptorSet { pool, .. } => {
                self.state.lock().release(pool.as_raw(), "descriptor pool");
            }
            HeapStorage::DescriptorBuffer { buffer, .. } => {
                let _ = self.destroy_buffer(buffer);
            }
        }
    }

    fn create_shader(&self, desc: &ShaderDesc<'_>) -> Result<ShaderHandles> {
        if desc.code.first() != Some(&SPIRV_MAGIC) {
            return Err(GpuError::ShaderCompilation(format!(
                "{:?} shader is not SPIR-V",
                desc.stage
            )));
        }
        let mut state = self.state.lock();
        let module = self.fabricate(&mut state, "shader module");
        let object = if desc.create_object && self.caps.shader_object {
            self.fabricate(&mut state, "shader object")
        } else {
            vk::ShaderEXT::null()
        };
        Ok(ShaderHandles { module, object })
    }

    fn destroy_shader(&self, shader: ShaderHandles) {
        let mut state = self.state.lock();
        state.release(shader.object.as_raw(), "shader object");
        state.release(shader.module.as_raw(), "shader module");
    }

    fn create_pipeline_fragment(
        &self,
        fragment: &PipelineFragment<'_>,
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline> {
        let mut state = self.state.lock();
        if !self.caps.graphics_pipeline_library {
            state
                .violations
                .push("pipeline fragment created without pipeline libraries".to_string());
        }
        state.check_live(layout.as_raw(), "pipeline layout", "vkCreateGraphicsPipelines");
        if let PipelineFragment::PreRasterization { stages, .. } = fragment {
            for stage in *stages {
                state.check_live(stage.module.as_raw(), "shader module", "vkCreateGraphicsPipelines");
            }
        }
        state.pipelines.push(PipelineRecord::Fragment(fragment.kind()));
        Ok(self.fabricate(&mut state, "pipeline"))
    }

    fn link_pipeline(
        &self,
        fragments: &[vk::Pipeline],
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline> {
        let mut state = self.state.lock();
        for fragment in fragments {
            state.check_live(fragment.as_raw(), "pipeline", "pipeline link");
        }
        state.check_live(layout.as_raw(), "pipeline layout", "pipeline link");
        state.pipelines.push(PipelineRecord::Linked(fragments.len()));
        Ok(self.fabricate(&mut state, "pipeline"))
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc<'_>,
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline> {
        let mut state = self.state.lock();
        for stage in desc.stages {
            state.check_live(stage.module.as_raw(), "shader module", "vkCreateGraphicsPipelines");
        }
        state.check_live(layout.as_raw(), "pipeline layout", "vkCreateGraphicsPipelines");
        state.pipelines.push(PipelineRecord::Monolithic);
        Ok(self.fabricate(&mut state, "pipeline"))
    }

    fn create_compute_pipeline(
        &self,
        stage: &ShaderStageRef<'_>,
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline> {
        let mut state = self.state.lock();
        state.check_live(stage.module.as_raw(), "shader module", "vkCreateComputePipelines");
        state.check_live(layout.as_raw(), "pipeline layout", "vkCreateComputePipelines");
        state.pipelines.push(PipelineRecord::Compute);
        Ok(self.fabricate(&mut state, "pipeline"))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.state.lock().release(pipeline.as_raw(), "pipeline");
    }
}

/// Backend that opens [`SimulatedDriver`]s over a fixed adapter list.
pub struct SimulatedBackend {
    adapters: Vec<AdapterInfo>,
    mode: CompletionMode,
    opened: Mutex<Option<Arc<SimulatedDriver>>>,
}

impl SimulatedBackend {
    pub fn new<A: Into<AdapterInfo>>(adapters: impl IntoIterator<Item = A>) -> Self {
        Self {
            adapters: adapters.into_iter().map(Into::into).collect(),
            mode: CompletionMode::Immediate,
            opened: Mutex::new(None),
        }
    }

    /// Require tests to complete submitted work explicitly.
    pub fn manual_completion(mut self) -> Self {
        self.mode = CompletionMode::Manual;
        self
    }

    /// The most recently opened device.
    pub fn driver(&self) -> Option<Arc<SimulatedDriver>> {
        self.opened.lock().clone()
    }
}

impl Backend for SimulatedBackend {
    fn adapters(&self) -> Result<Vec<AdapterInfo>> {
        Ok(self.adapters.clone())
    }

    fn open_device(
        &self,
        adapter: &AdapterInfo,
        negotiated: &NegotiatedDevice,
    ) -> Result<DriverRef> {
        let driver = Arc::new(SimulatedDriver::new(
            adapter.clone(),
            negotiated.caps,
            self.mode,
        ));
        *self.opened.lock() = Some(driver.clone());
        Ok(driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::TimelineWait;

    fn driver(mode: CompletionMode) -> SimulatedDriver {
        SimulatedDriver::new(
            SimulatedAdapter::discrete("sim").build(),
            RuntimeCaps::default(),
            mode,
        )
    }

    fn submit(driver: &SimulatedDriver, signal: vk::Semaphore, value: u64, waits: &[TimelineWait]) {
        driver
            .submit(
                vk::Queue::null(),
                &SubmitBatch {
                    command_buffers: &[],
                    waits,
                    binary_waits: &[],
                    signal,
                    signal_value: value,
                    binary_signals: &[],
                },
            )
            .unwrap();
    }

    #[test]
    fn adapter_builder_removes_extension() {
        let info = SimulatedAdapter::discrete("sim")
            .without_extension(ash::ext::shader_object::NAME)
            .build();
        assert!(!info.supports_extension(ash::ext::shader_object::NAME));
        assert!(info.supports_extension(ash::khr::swapchain::NAME));
    }

    #[test]
    fn cross_timeline_waits_defer_completion() {
        let driver = driver(CompletionMode::Immediate);
        let a = driver.create_timeline(0).unwrap();
        let b = driver.create_timeline(0).unwrap();

        let wait = TimelineWait {
            semaphore: a,
            value: 1,
            stages: vk::PipelineStageFlags2::ALL_COMMANDS,
        };
        submit(&driver, b, 1, &[wait]);
        assert_eq!(driver.timeline_value(b).unwrap(), 0);

        driver.signal_timeline(a, 1).unwrap();
        assert_eq!(driver.timeline_value(b).unwrap(), 1);
    }

    #[test]
    fn manual_mode_holds_values_until_completed() {
        let driver = driver(CompletionMode::Manual);
        let sem = driver.create_timeline(0).unwrap();
        submit(&driver, sem, 3, &[]);

        assert_eq!(driver.timeline_value(sem).unwrap(), 0);
        assert!(!driver.wait_timeline(sem, 3, 0).unwrap());

        driver.complete_through(sem, 2);
        assert_eq!(driver.timeline_value(sem).unwrap(), 2);
        driver.complete_all();
        assert!(driver.wait_timeline(sem, 3, u64::MAX).unwrap());
    }

    #[test]
    fn double_destroy_is_a_violation() {
        let driver = driver(CompletionMode::Immediate);
        let sampler = driver.create_sampler(&SamplerDesc::default()).unwrap();
        driver.destroy_sampler(sampler);
        assert!(driver.violations().is_empty());
        driver.destroy_sampler(sampler);
        assert_eq!(driver.violations().len(), 1);
    }

    #[test]
    fn host_visible_buffers_are_backed_by_memory() {
        let driver = driver(CompletionMode::Immediate);
        let buffer = driver
            .create_buffer(&BufferDesc {
                name: "staging",
                size: 16,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                location: MemoryLocation::CpuToGpu,
            })
            .unwrap();
        assert!(buffer.mapped_ptr().is_some());
        assert_eq!(driver.read_buffer(buffer.raw).unwrap().len(), 16);
        driver.destroy_buffer(buffer).unwrap();
        assert_eq!(driver.live_objects("buffer"), 0);
    }

    #[test]
    fn shaders_must_be_spirv() {
        let driver = driver(CompletionMode::Immediate);
        let desc = ShaderDesc {
            stage: vk::ShaderStageFlags::VERTEX,
            entry: c"main",
            code: &[0xdead_beef],
            set_layout: vk::DescriptorSetLayout::null(),
            push_constant_size: 128,
            create_object: false,
        };
        assert!(matches!(
            driver.create_shader(&desc),
            Err(GpuError::ShaderCompilation(_))
        ));
    }
}
