//! Pipeline state cache.
//!
//! With pipeline libraries, graphics pipelines are assembled from four
//! independently cached fragments and linked; without them every distinct
//! state is compiled in one step. Both modes share the linked-pipeline cache,
//! so a repeated request costs one hash lookup either way.

mod cache;
mod key;

pub use cache::CacheStats;
pub use key::{
    ColorFormats, ComputePipelineKey, DynamicState, FragmentOutputKey, FragmentShaderKey,
    GraphicsPipelineKey, GraphicsState, PipelineKey, PreRasterizationKey, VertexInputKey,
    KEY_VERSION, MAX_COLOR_ATTACHMENTS,
};

use crate::capabilities::RuntimeCaps;
use crate::driver::{DriverRef, GraphicsPipelineDesc, PipelineFragment, ShaderStageRef};
use crate::error::{GpuError, Result};
use crate::shader::{Shader, ShaderSet};
use ash::vk;
use cache::KeyedCache;

/// How graphics pipelines are compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    /// Fragments compiled separately and linked.
    Library,
    /// Whole pipelines compiled from the full key.
    Monolithic,
}

/// Counters for every cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineCacheStats {
    pub vertex_input: CacheStats,
    pub pre_rasterization: CacheStats,
    pub fragment_shader: CacheStats,
    pub fragment_output: CacheStats,
    pub graphics: CacheStats,
    pub compute: CacheStats,
}

impl PipelineCacheStats {
    /// Entries across the four fragment caches.
    pub fn fragment_entries(&self) -> usize {
        self.vertex_input.entries
            + self.pre_rasterization.entries
            + self.fragment_shader.entries
            + self.fragment_output.entries
    }

    pub fn total_entries(&self) -> usize {
        self.fragment_entries() + self.graphics.entries + self.compute.entries
    }
}

/// Structural cache of compiled pipelines, shared by every queue.
pub struct PipelineCache {
    driver: DriverRef,
    layout: vk::PipelineLayout,
    mode: PipelineMode,
    multiview: bool,
    vertex_input: KeyedCache<VertexInputKey>,
    pre_rasterization: KeyedCache<PreRasterizationKey>,
    fragment_shader: KeyedCache<FragmentShaderKey>,
    fragment_output: KeyedCache<FragmentOutputKey>,
    graphics: KeyedCache<GraphicsPipelineKey>,
    compute: KeyedCache<ComputePipelineKey>,
}

impl PipelineCache {
    /// Every pipeline is created against the heap's single `layout`.
    pub fn new(driver: DriverRef, layout: vk::PipelineLayout, caps: RuntimeCaps) -> Self {
        let mode = if caps.graphics_pipeline_library {
            PipelineMode::Library
        } else {
            PipelineMode::Monolithic
        };
        tracing::debug!("Pipeline cache in {:?} mode", mode);

        Self {
            driver,
            layout,
            mode,
            multiview: caps.multiview,
            vertex_input: KeyedCache::new(),
            pre_rasterization: KeyedCache::new(),
            fragment_shader: KeyedCache::new(),
            fragment_output: KeyedCache::new(),
            graphics: KeyedCache::new(),
            compute: KeyedCache::new(),
        }
    }

    pub fn mode(&self) -> PipelineMode {
        self.mode
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Fetch or build the graphics pipeline for `shaders` under `state`.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn graphics_pipeline(
        &self,
        shaders: &ShaderSet,
        state: &GraphicsState,
    ) -> Result<vk::Pipeline> {
        if state.view_mask != 0 && !self.multiview {
            return Err(GpuError::InvalidState(format!(
                "view mask {:#x} requires multiview support",
                state.view_mask
            )));
        }

        let key = GraphicsPipelineKey::new(shaders, state);
        self.graphics.get_or_create(&key, || match self.mode {
            PipelineMode::Library => self.link(&key, shaders),
            PipelineMode::Monolithic => {
                let stages: Vec<ShaderStageRef<'_>> =
                    shaders.stages().map(|shader| shader.stage_ref()).collect();
                self.driver.create_graphics_pipeline(
                    &GraphicsPipelineDesc {
                        stages: &stages,
                        state,
                    },
                    self.layout,
                )
            }
        })
    }

    fn link(&self, key: &GraphicsPipelineKey, shaders: &ShaderSet) -> Result<vk::Pipeline> {
        let vertex_input = self.vertex_input.get_or_create(&key.vertex_input, || {
            self.driver.create_pipeline_fragment(
                &PipelineFragment::VertexInput {
                    topology: key.vertex_input.topology,
                },
                self.layout,
            )
        })?;

        let pre = &key.pre_rasterization;
        let pre_rasterization = self.pre_rasterization.get_or_create(pre, || {
            let stages: Vec<ShaderStageRef<'_>> = shaders
                .pre_rasterization()
                .map(|shader| shader.stage_ref())
                .collect();
            self.driver.create_pipeline_fragment(
                &PipelineFragment::PreRasterization {
                    stages: &stages,
                    polygon_mode: pre.polygon_mode,
                    view_mask: pre.view_mask,
                },
                self.layout,
            )
        })?;

        let fragment_shader = self.fragment_shader.get_or_create(&key.fragment_shader, || {
            self.driver.create_pipeline_fragment(
                &PipelineFragment::FragmentShader {
                    stage: shaders.fragment.as_ref().map(|shader| shader.stage_ref()),
                    view_mask: key.fragment_shader.view_mask,
                },
                self.layout,
            )
        })?;

        let out = &key.fragment_output;
        let fragment_output = self.fragment_output.get_or_create(out, || {
            self.driver.create_pipeline_fragment(
                &PipelineFragment::FragmentOutput {
                    color_formats: out.color_formats.as_slice(),
                    depth_format: out.depth_format,
                    stencil_format: out.stencil_format,
                    blend_mask: out.blend_mask,
                    view_mask: out.view_mask,
                },
                self.layout,
            )
        })?;

        self.driver.link_pipeline(
            &[vertex_input, pre_rasterization, fragment_shader, fragment_output],
            self.layout,
        )
    }

    /// Fetch or build the compute pipeline for `shader`.
    pub fn compute_pipeline(&self, shader: &Shader) -> Result<vk::Pipeline> {
        if shader.stage() != vk::ShaderStageFlags::COMPUTE {
            return Err(GpuError::InvalidState(format!(
                "{:?} shader used as a compute pipeline",
                shader.stage()
            )));
        }
        let key = ComputePipelineKey { shader: shader.id() };
        self.compute.get_or_create(&key, || {
            self.driver
                .create_compute_pipeline(&shader.stage_ref(), self.layout)
        })
    }

    pub fn stats(&self) -> PipelineCacheStats {
        PipelineCacheStats {
            vertex_input: self.vertex_input.stats(),
            pre_rasterization: self.pre_rasterization.stats(),
            fragment_shader: self.fragment_shader.stats(),
            fragment_output: self.fragment_output.stats(),
            graphics: self.graphics.stats(),
            compute: self.compute.stats(),
        }
    }

    /// Destroy every cached pipeline. No queue may still reference them.
    pub(crate) fn destroy(&self) {
        // Linked pipelines first, then the fragments they were built from.
        let pipelines = self
            .graphics
            .drain()
            .into_iter()
            .chain(self.compute.drain())
            .chain(self.vertex_input.drain())
            .chain(self.pre_rasterization.drain())
            .chain(self.fragment_shader.drain())
            .chain(self.fragment_output.drain());
        for pipeline in pipelines {
            self.driver.destroy_pipeline(pipeline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::simulated::{
        CompletionMode, PipelineRecord, SimulatedAdapter, SimulatedDriver,
    };
    use crate::shader::tests::spirv;
    use crate::driver::{DeviceDriver, HeapDesc};
    use crate::shader::ShaderRegistry;
    use std::sync::Arc;

    struct Fixture {
        driver: Arc<SimulatedDriver>,
        shaders: ShaderRegistry,
        cache: PipelineCache,
    }

    fn fixture(caps: RuntimeCaps) -> Fixture {
        let driver = Arc::new(SimulatedDriver::new(
            SimulatedAdapter::discrete("sim").build(),
            caps,
            CompletionMode::Immediate,
        ));
        let heap = driver
            .create_descriptor_heap(&HeapDesc {
                image_capacity: 16,
                sampler_capacity: 4,
                push_constant_size: 128,
            })
            .unwrap();
        let shaders = ShaderRegistry::new(driver.clone(), heap.set_layout, 128, false);
        let cache = PipelineCache::new(driver.clone(), heap.pipeline_layout, caps);
        Fixture {
            driver,
            shaders,
            cache,
        }
    }

    fn library_caps() -> RuntimeCaps {
        RuntimeCaps {
            graphics_pipeline_library: true,
            multiview: true,
            ..Default::default()
        }
    }

    fn shader_set(f: &Fixture, vertex_tag: u32, fragment_tag: u32) -> ShaderSet {
        let vertex = f
            .shaders
            .register(vk::ShaderStageFlags::VERTEX, "main", &spirv(vertex_tag))
            .unwrap();
        let fragment = f
            .shaders
            .register(vk::ShaderStageFlags::FRAGMENT, "main", &spirv(fragment_tag))
            .unwrap();
        ShaderSet::new(vertex, Some(fragment)).unwrap()
    }

    fn color_state(format: vk::Format) -> GraphicsState {
        GraphicsState {
            color_formats: ColorFormats::new(&[format]).unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn identical_keys_return_the_same_pipeline() {
        let f = fixture(library_caps());
        let set = shader_set(&f, 1, 2);
        let state = color_state(vk::Format::B8G8R8A8_SRGB);

        let a = f.cache.graphics_pipeline(&set, &state).unwrap();
        let b = f.cache.graphics_pipeline(&set, &state).unwrap();

        assert_eq!(a, b);
        let stats = f.cache.stats();
        assert_eq!(stats.graphics.hits, 1);
        assert_eq!(stats.graphics.misses, 1);
        assert_eq!(stats.fragment_entries(), 4);
    }

    #[test]
    fn fragments_are_reused_across_linked_pipelines() {
        let f = fixture(library_caps());
        let set = shader_set(&f, 1, 2);

        f.cache
            .graphics_pipeline(&set, &color_state(vk::Format::B8G8R8A8_SRGB))
            .unwrap();
        f.cache
            .graphics_pipeline(&set, &color_state(vk::Format::R16G16B16A16_SFLOAT))
            .unwrap();

        let stats = f.cache.stats();
        assert_eq!(stats.graphics.entries, 2);
        // Only the output fragment differs.
        assert_eq!(stats.vertex_input.hits, 1);
        assert_eq!(stats.pre_rasterization.hits, 1);
        assert_eq!(stats.fragment_shader.hits, 1);
        assert_eq!(stats.fragment_output.misses, 2);

        let linked = f
            .driver
            .pipeline_records()
            .iter()
            .filter(|record| **record == PipelineRecord::Linked(4))
            .count();
        assert_eq!(linked, 2);
    }

    #[test]
    fn monolithic_mode_creates_no_fragments() {
        let f = fixture(RuntimeCaps::default());
        assert_eq!(f.cache.mode(), PipelineMode::Monolithic);
        let set = shader_set(&f, 1, 2);

        f.cache
            .graphics_pipeline(&set, &color_state(vk::Format::B8G8R8A8_SRGB))
            .unwrap();
        f.cache
            .graphics_pipeline(&set, &color_state(vk::Format::B8G8R8A8_SRGB))
            .unwrap();

        assert_eq!(f.driver.pipeline_records(), vec![PipelineRecord::Monolithic]);
        assert_eq!(f.cache.stats().fragment_entries(), 0);
        assert!(f.driver.violations().is_empty());
    }

    #[test]
    fn view_mask_requires_multiview() {
        let f = fixture(RuntimeCaps::default());
        let set = shader_set(&f, 1, 2);
        let state = GraphicsState {
            view_mask: 0b11,
            ..color_state(vk::Format::B8G8R8A8_SRGB)
        };
        assert!(matches!(
            f.cache.graphics_pipeline(&set, &state),
            Err(GpuError::InvalidState(_))
        ));
    }

    #[test]
    fn compute_pipelines_are_keyed_by_shader() {
        let f = fixture(library_caps());
        let shader = f
            .shaders
            .register(vk::ShaderStageFlags::COMPUTE, "main", &spirv(7))
            .unwrap();
        let a = f.cache.compute_pipeline(&shader).unwrap();
        let b = f.cache.compute_pipeline(&shader).unwrap();
        assert_eq!(a, b);
        assert_eq!(f.cache.stats().compute.entries, 1);

        let vertex = f
            .shaders
            .register(vk::ShaderStageFlags::VERTEX, "main", &spirv(8))
            .unwrap();
        assert!(f.cache.compute_pipeline(&vertex).is_err());
    }

    #[test]
    fn destroy_releases_each_pipeline_once() {
        let f = fixture(library_caps());
        let set = shader_set(&f, 1, 2);
        f.cache
            .graphics_pipeline(&set, &color_state(vk::Format::B8G8R8A8_SRGB))
            .unwrap();
        f.cache
            .graphics_pipeline(&set, &color_state(vk::Format::R8G8B8A8_UNORM))
            .unwrap();
        assert_eq!(f.driver.live_objects("pipeline"), 7);

        f.cache.destroy();
        assert_eq!(f.driver.live_objects("pipeline"), 0);
        assert_eq!(f.cache.stats().total_entries(), 0);
        assert!(f.driver.violations().is_empty());
    }
}
