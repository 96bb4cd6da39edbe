//! Command pools and command lists.

use crate::driver::{has_stencil, Command, DriverRef, ImageBarrier, RenderingDesc};
use crate::error::{GpuError, Result};
use crate::pipeline::{ColorFormats, DynamicState, GraphicsState};
use crate::queue::{QueueKind, QueueShared};
use crate::shader::{Shader, ShaderSet};
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Lifecycle of one command buffer inside its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListState {
    /// Free to begin recording.
    Available,
    /// Owned by a live [`CommandList`], recording or ended.
    Recording,
    /// Submitted; waits for its fence value before reuse.
    Pending,
}

/// Command pool with a bounded number of buffers.
///
/// A pool is checked out by at most one recording list at a time, which
/// keeps recording free of pool-level locking in the driver.
pub(crate) struct CommandPool {
    raw: vk::CommandPool,
    capacity: u32,
    slots: Mutex<Vec<(vk::CommandBuffer, ListState)>>,
}

impl CommandPool {
    pub fn new(driver: &DriverRef, family: u32, capacity: u32) -> Result<Self> {
        let raw = driver.create_command_pool(family)?;
        Ok(Self {
            raw,
            capacity,
            slots: Mutex::new(Vec::with_capacity(capacity as usize)),
        })
    }

    pub fn raw(&self) -> vk::CommandPool {
        self.raw
    }

    /// Mark an available buffer as recording, allocating one if the pool
    /// has room. `None` when every buffer is in use.
    pub fn checkout(&self, driver: &DriverRef) -> Result<Option<vk::CommandBuffer>> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots
            .iter_mut()
            .find(|(_, state)| *state == ListState::Available)
        {
            slot.1 = ListState::Recording;
            return Ok(Some(slot.0));
        }
        if slots.len() as u32 >= self.capacity {
            return Ok(None);
        }
        let cmd = driver.allocate_command_buffer(self.raw)?;
        slots.push((cmd, ListState::Recording));
        Ok(Some(cmd))
    }

    pub fn set_state(&self, cmd: vk::CommandBuffer, state: ListState) {
        let mut slots = self.slots.lock();
        match slots.iter_mut().find(|(raw, _)| *raw == cmd) {
            Some(slot) => slot.1 = state,
            None => tracing::error!("{cmd:?} does not belong to pool {:?}", self.raw),
        }
    }

    #[cfg(test)]
    pub fn state(&self, cmd: vk::CommandBuffer) -> Option<ListState> {
        self.slots
            .lock()
            .iter()
            .find(|(raw, _)| *raw == cmd)
            .map(|(_, state)| *state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Recording,
    Executable,
    Released,
}

const GRAPHICS_STAGES: [vk::ShaderStageFlags; 5] = [
    vk::ShaderStageFlags::VERTEX,
    vk::ShaderStageFlags::TESSELLATION_CONTROL,
    vk::ShaderStageFlags::TESSELLATION_EVALUATION,
    vk::ShaderStageFlags::GEOMETRY,
    vk::ShaderStageFlags::FRAGMENT,
];

/// A command buffer being recorded for one queue.
///
/// Pipeline state is tracked on the host and resolved lazily: draws and
/// dispatches look up (or build) the matching pipeline, or bind shader
/// objects and set state directly when the device supports them.
pub struct CommandList {
    pub(crate) queue: Arc<QueueShared>,
    pool: Arc<CommandPool>,
    raw: vk::CommandBuffer,
    phase: Phase,
    rendering: bool,

    graphics: GraphicsState,
    dynamic: DynamicState,
    shaders: Option<ShaderSet>,
    compute: Option<Arc<Shader>>,
    bound_stages: vk::ShaderStageFlags,
    bound_graphics: Option<vk::Pipeline>,
    bound_compute: Option<vk::Pipeline>,

    shaders_dirty: bool,
    state_dirty: bool,
    dynamic_dirty: bool,
    compute_dirty: bool,
}

impl CommandList {
    pub(crate) fn new(queue: Arc<QueueShared>, pool: Arc<CommandPool>, raw: vk::CommandBuffer) -> Self {
        Self {
            queue,
            pool,
            raw,
            phase: Phase::Recording,
            rendering: false,
            graphics: GraphicsState::default(),
            dynamic: DynamicState::default(),
            shaders: None,
            compute: None,
            bound_stages: vk::ShaderStageFlags::empty(),
            bound_graphics: None,
            bound_compute: None,
            shaders_dirty: false,
            state_dirty: true,
            dynamic_dirty: true,
            compute_dirty: false,
        }
    }

    pub fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }

    pub fn queue_kind(&self) -> QueueKind {
        self.queue.kind
    }

    pub fn is_recording(&self) -> bool {
        self.phase == Phase::Recording
    }

    /// Fixed-function state the next draw will use.
    pub fn graphics_state(&self) -> &GraphicsState {
        &self.graphics
    }

    pub(crate) fn ensure_recording(&self) -> Result<()> {
        if self.phase != Phase::Recording {
            return Err(GpuError::InvalidState(format!(
                "{:?} is not recording ({:?})",
                self.raw, self.phase
            )));
        }
        Ok(())
    }

    fn record(&self, command: &Command<'_>) {
        self.queue.driver.record(self.raw, command);
    }

    fn supports(&self, bind_point: vk::PipelineBindPoint) -> Result<()> {
        if !self.queue.kind.bind_points().contains(&bind_point) {
            return Err(GpuError::InvalidState(format!(
                "{bind_point:?} work recorded on the {} queue",
                self.queue.kind
            )));
        }
        Ok(())
    }

    /// Begin dynamic rendering. Attachment formats and the view mask become
    /// part of the graphics state for subsequent draws.
    pub fn begin_rendering(&mut self, desc: &RenderingDesc<'_>) -> Result<()> {
        self.ensure_recording()?;
        self.supports(vk::PipelineBindPoint::GRAPHICS)?;
        if self.rendering {
            return Err(GpuError::InvalidState(
                "begin_rendering inside an active render pass".to_string(),
            ));
        }

        let formats: Vec<vk::Format> = desc.colors.iter().map(|color| color.format).collect();
        self.graphics.color_formats = ColorFormats::new(&formats)?;
        let depth_format = desc.depth.map_or(vk::Format::UNDEFINED, |depth| depth.format);
        self.graphics.depth_format = depth_format;
        self.graphics.stencil_format = if has_stencil(depth_format) {
            depth_format
        } else {
            vk::Format::UNDEFINED
        };
        self.graphics.view_mask = desc.view_mask;
        self.state_dirty = true;

        self.record(&Command::BeginRendering(desc));
        self.record(&Command::SetViewport(desc.extent));
        self.rendering = true;
        Ok(())
    }

    pub fn end_rendering(&mut self) -> Result<()> {
        self.ensure_recording()?;
        if !self.rendering {
            return Err(GpuError::InvalidState(
                "end_rendering without begin_rendering".to_string(),
            ));
        }
        self.record(&Command::EndRendering);
        self.rendering = false;
        Ok(())
    }

    pub fn set_viewport(&mut self, extent: vk::Extent2D) -> Result<()> {
        self.ensure_recording()?;
        self.record(&Command::SetViewport(extent));
        Ok(())
    }

    pub fn set_topology(&mut self, topology: vk::PrimitiveTopology) {
        if self.graphics.topology != topology {
            self.graphics.topology = topology;
            self.state_dirty = true;
        }
    }

    pub fn set_polygon_mode(&mut self, polygon_mode: vk::PolygonMode) {
        if self.graphics.polygon_mode != polygon_mode {
            self.graphics.polygon_mode = polygon_mode;
            self.state_dirty = true;
        }
    }

    /// Bit `i` enables alpha blending on color attachment `i`.
    pub fn set_blend_mask(&mut self, blend_mask: u32) {
        if self.graphics.blend_mask != blend_mask {
            self.graphics.blend_mask = blend_mask;
            self.state_dirty = true;
        }
    }

    pub fn set_dynamic_state(&mut self, state: DynamicState) {
        if self.dynamic != state {
            self.dynamic = state;
            self.dynamic_dirty = true;
        }
    }

    pub fn bind_shaders(&mut self, shaders: &ShaderSet) -> Result<()> {
        self.ensure_recording()?;
        self.supports(vk::PipelineBindPoint::GRAPHICS)?;
        self.shaders = Some(shaders.clone());
        self.shaders_dirty = true;
        Ok(())
    }

    pub fn bind_compute_shader(&mut self, shader: &Arc<Shader>) -> Result<()> {
        self.ensure_recording()?;
        self.supports(vk::PipelineBindPoint::COMPUTE)?;
        if shader.stage() != vk::ShaderStageFlags::COMPUTE {
            return Err(GpuError::InvalidState(format!(
                "{:?} shader bound as compute",
                shader.stage()
            )));
        }
        self.compute = Some(shader.clone());
        self.compute_dirty = true;
        Ok(())
    }

    /// Write push constants shared by every stage.
    pub fn push_constants(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        self.ensure_recording()?;
        let limit = self.queue.heap.push_constant_size();
        let end = offset as usize + data.len();
        if offset % 4 != 0 || data.len() % 4 != 0 || end > limit as usize {
            return Err(GpuError::InvalidState(format!(
                "push constant range {offset}..{end} is misaligned or exceeds {limit} bytes"
            )));
        }
        self.record(&Command::PushConstants {
            layout: self.queue.heap.pipeline_layout(),
            offset,
            data,
        });
        Ok(())
    }

    /// Push a plain-old-data value, typically a struct of heap indices.
    pub fn push<T: bytemuck::Pod>(&mut self, offset: u32, value: &T) -> Result<()> {
        self.push_constants(offset, bytemuck::bytes_of(value))
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<()> {
        self.ensure_recording()?;
        if !self.rendering {
            return Err(GpuError::InvalidState("draw outside of rendering".to_string()));
        }
        self.flush_graphics()?;
        self.record(&Command::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
        Ok(())
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.ensure_recording()?;
        if self.rendering {
            return Err(GpuError::InvalidState("dispatch inside rendering".to_string()));
        }
        self.flush_compute()?;
        self.record(&Command::Dispatch([x, y, z]));
        Ok(())
    }

    pub fn image_barrier(&mut self, barrier: &ImageBarrier) -> Result<()> {
        self.ensure_recording()?;
        self.record(&Command::ImageBarrier(barrier));
        Ok(())
    }

    pub fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) -> Result<()> {
        self.ensure_recording()?;
        self.record(&Command::CopyBuffer { src, dst, regions });
        Ok(())
    }

    /// Copy into an image in `TRANSFER_DST_OPTIMAL`.
    pub fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        regions: &[vk::BufferImageCopy],
    ) -> Result<()> {
        self.ensure_recording()?;
        self.record(&Command::CopyBufferToImage { src, dst, regions });
        Ok(())
    }

    /// Downsample mip `src_mip` into `src_mip + 1` with a linear blit.
    pub fn blit_mip(
        &mut self,
        image: vk::Image,
        src_mip: u32,
        src_extent: vk::Extent2D,
        dst_extent: vk::Extent2D,
    ) -> Result<()> {
        self.ensure_recording()?;
        self.supports(vk::PipelineBindPoint::GRAPHICS)?;
        self.record(&Command::BlitMip {
            image,
            src_mip,
            src_extent,
            dst_extent,
        });
        Ok(())
    }

    fn flush_graphics(&mut self) -> Result<()> {
        let Some(shaders) = self.shaders.as_ref() else {
            return Err(GpuError::InvalidState("draw without bound shaders".to_string()));
        };

        if self.queue.driver.caps().shader_object {
            if self.shaders_dirty {
                let mut bound = vk::ShaderStageFlags::empty();
                let mut stages = Vec::with_capacity(GRAPHICS_STAGES.len());
                let mut objects = Vec::with_capacity(GRAPHICS_STAGES.len());
                for stage in GRAPHICS_STAGES {
                    let object = shaders
                        .stages()
                        .find(|shader| shader.stage() == stage)
                        .map(|shader| shader.object());
                    // Stages never bound stay untouched; previously bound ones are cleared.
                    if object.is_some() || self.bound_stages.contains(stage) {
                        stages.push(stage);
                        objects.push(object.unwrap_or(vk::ShaderEXT::null()));
                    }
                    if object.is_some() {
                        bound |= stage;
                    }
                }
                self.record(&Command::BindShaders {
                    stages: &stages,
                    shaders: &objects,
                });
                self.bound_stages = bound;
            }
            if self.state_dirty {
                self.record(&Command::SetGraphicsState(&self.graphics));
            }
        } else if self.shaders_dirty || self.state_dirty {
            let pipeline = self.queue.pipelines.graphics_pipeline(shaders, &self.graphics)?;
            if self.bound_graphics != Some(pipeline) {
                self.record(&Command::BindPipeline {
                    bind_point: vk::PipelineBindPoint::GRAPHICS,
                    pipeline,
                });
                self.bound_graphics = Some(pipeline);
            }
        }

        if self.dynamic_dirty {
            self.record(&Command::SetDynamicState(&self.dynamic));
        }
        self.shaders_dirty = false;
        self.state_dirty = false;
        self.dynamic_dirty = false;
        Ok(())
    }

    fn flush_compute(&mut self) -> Result<()> {
        let Some(shader) = self.compute.clone() else {
            return Err(GpuError::InvalidState("dispatch without a compute shader".to_string()));
        };
        if !self.compute_dirty {
            return Ok(());
        }

        if self.queue.driver.caps().shader_object {
            self.record(&Command::BindShaders {
                stages: &[vk::ShaderStageFlags::COMPUTE],
                shaders: &[shader.object()],
            });
        } else {
            let pipeline = self.queue.pipelines.compute_pipeline(&shader)?;
            if self.bound_compute != Some(pipeline) {
                self.record(&Command::BindPipeline {
                    bind_point: vk::PipelineBindPoint::COMPUTE,
                    pipeline,
                });
                self.bound_compute = Some(pipeline);
            }
        }
        self.compute_dirty = false;
        Ok(())
    }

    /// Finish recording. Submission does this implicitly.
    pub fn end(&mut self) -> Result<()> {
        match self.phase {
            Phase::Executable => Ok(()),
            Phase::Released => Err(GpuError::InvalidState(format!(
                "{:?} was already released",
                self.raw
            ))),
            Phase::Recording => {
                if self.rendering {
                    tracing::warn!("{:?} ended inside rendering; closing the render pass", self.raw);
                    self.record(&Command::EndRendering);
                    self.rendering = false;
                }
                self.queue.driver.end_command_buffer(self.raw)?;
                self.phase = Phase::Executable;
                self.queue.return_pool(self.pool.clone());
                Ok(())
            }
        }
    }

    /// Drop the list without submitting it, returning its buffer to the pool.
    pub fn discard(mut self) {
        self.release();
    }

    pub(crate) fn into_submitted(mut self) -> (Arc<CommandPool>, vk::CommandBuffer) {
        self.phase = Phase::Released;
        (self.pool.clone(), self.raw)
    }

    fn release(&mut self) {
        if self.phase == Phase::Recording {
            if let Err(err) = self.queue.driver.end_command_buffer(self.raw) {
                tracing::warn!("Failed to end discarded {:?}: {err}", self.raw);
            }
            self.queue.return_pool(self.pool.clone());
        }
        if self.phase != Phase::Released {
            self.pool.set_state(self.raw, ListState::Available);
            self.phase = Phase::Released;
        }
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        if self.phase != Phase::Released {
            tracing::warn!(
                "{:?} dropped without being submitted; discarding",
                self.raw
            );
            self.release();
        }
    }
}

impl std::fmt::Debug for CommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("raw", &self.raw)
            .field("queue", &self.queue.kind)
            .field("phase", &self.phase)
            .field("rendering", &self.rendering)
            .finish_non_exhaustive()
    }
}
