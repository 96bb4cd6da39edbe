//! Contexts over the simulated driver.

use ash::vk;
use halcyon_gpu::driver::simulated::{SimulatedAdapter, SimulatedBackend, SimulatedDriver};
use halcyon_gpu::pipeline::ColorFormats;
use halcyon_gpu::shader::{Shader, SPIRV_MAGIC};
use halcyon_gpu::{
    Context, ContextBuilder, GraphicsState, QueueKind, ShaderSet, SubmitInfo, SyncPoint,
};
use std::sync::Arc;

use crate::{HarnessConfig, Result, TestError};

/// Minimal fake SPIR-V: the magic number, a version word and a tag that
/// makes otherwise identical blobs distinct.
pub fn spirv(tag: u32) -> Vec<u32> {
    vec![SPIRV_MAGIC, 0x0001_0600, tag]
}

/// Graphics state rendering into one color attachment of `format`.
pub fn color_state(format: vk::Format) -> GraphicsState {
    GraphicsState {
        color_formats: ColorFormats::new(&[format]).unwrap_or_default(),
        ..Default::default()
    }
}

/// A [`Context`] running on a [`SimulatedDriver`].
pub struct SimulatedHarness {
    context: Context,
    driver: Arc<SimulatedDriver>,
}

impl SimulatedHarness {
    /// Discrete adapter with every optional capability; work completes on submit.
    pub fn new() -> Result<Self> {
        Self::with_adapter(SimulatedAdapter::discrete("simulated"), HarnessConfig::default())
    }

    /// Like [`Self::new`], but submitted work waits for [`Self::complete_all`].
    pub fn manual() -> Result<Self> {
        Self::with_adapter(
            SimulatedAdapter::discrete("simulated"),
            HarnessConfig {
                manual_completion: true,
                ..Default::default()
            },
        )
    }

    pub fn with_adapter(adapter: SimulatedAdapter, config: HarnessConfig) -> Result<Self> {
        let mut backend = SimulatedBackend::new([adapter]);
        if config.manual_completion {
            backend = backend.manual_completion();
        }
        let context = ContextBuilder::from_config(config.context).build_with(&backend)?;
        let driver = backend
            .driver()
            .ok_or(TestError::Gpu(halcyon_gpu::GpuError::NoSuitableDevice))?;
        tracing::debug!("Simulated harness ready: {}", context.caps());
        Ok(Self { context, driver })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn driver(&self) -> &Arc<SimulatedDriver> {
        &self.driver
    }

    /// Register a vertex and fragment shader pair built from two tags.
    pub fn shader_set(&self, vertex_tag: u32, fragment_tag: u32) -> Result<ShaderSet> {
        let vertex =
            self.context
                .register_shader(vk::ShaderStageFlags::VERTEX, "main", &spirv(vertex_tag))?;
        let fragment = self.context.register_shader(
            vk::ShaderStageFlags::FRAGMENT,
            "main",
            &spirv(fragment_tag),
        )?;
        Ok(ShaderSet::new(vertex, Some(fragment))?)
    }

    pub fn compute_shader(&self, tag: u32) -> Result<Arc<Shader>> {
        Ok(self
            .context
            .register_shader(vk::ShaderStageFlags::COMPUTE, "main", &spirv(tag))?)
    }

    /// Submit an empty command list to the first queue of `kind`.
    pub fn submit_empty(&self, kind: QueueKind) -> Result<SyncPoint> {
        let queue = self.context.queue(kind, 0)?;
        let list = queue.begin()?;
        Ok(queue.submit(vec![list], SubmitInfo::default())?)
    }

    /// Finish every submitted batch on the simulated device.
    pub fn complete_all(&self) {
        self.driver.complete_all();
    }

    /// Complete outstanding work, tear the context down and check the
    /// device was left clean.
    pub fn finish(self) -> Result<()> {
        let Self { context, driver } = self;
        driver.complete_all();
        drop(context);

        let violations = driver.violations();
        if !violations.is_empty() {
            return Err(TestError::Violations(violations));
        }
        match driver.total_live_objects() {
            0 => Ok(()),
            live => Err(TestError::Leaked { live }),
        }
    }
}
