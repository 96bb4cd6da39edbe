//! Structural pipeline cache keys.
//!
//! Every key is a plain value type. Two requests that describe the same
//! pipeline state hash and compare equal no matter where they were built.

use crate::error::{GpuError, Result};
use crate::shader::{ShaderId, ShaderSet};
use ash::vk;
use std::fmt::Debug;
use std::hash::Hash;

/// Maximum number of color attachments a pipeline can target.
pub const MAX_COLOR_ATTACHMENTS: usize = 8;

/// Bumped whenever the layout of any key changes.
pub const KEY_VERSION: u16 = 1;

/// Common bound for all pipeline cache keys.
pub trait PipelineKey: Hash + Eq + Clone + Debug + Send + Sync {
    /// Cache name used in logs and statistics.
    const KIND: &'static str;
    /// Layout version of this key shape.
    const VERSION: u16 = KEY_VERSION;
}

/// Color attachment formats, stored inline so keys stay `Copy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorFormats {
    count: u8,
    formats: [vk::Format; MAX_COLOR_ATTACHMENTS],
}

impl ColorFormats {
    /// No color attachments.
    pub const NONE: Self = Self {
        count: 0,
        formats: [vk::Format::UNDEFINED; MAX_COLOR_ATTACHMENTS],
    };

    /// Build from a slice of formats.
    pub fn new(formats: &[vk::Format]) -> Result<Self> {
        if formats.len() > MAX_COLOR_ATTACHMENTS {
            return Err(GpuError::InvalidState(format!(
                "{} color attachments exceed the limit of {MAX_COLOR_ATTACHMENTS}",
                formats.len()
            )));
        }
        let mut out = Self::NONE;
        out.formats[..formats.len()].copy_from_slice(formats);
        out.count = formats.len() as u8;
        Ok(out)
    }

    pub fn as_slice(&self) -> &[vk::Format] {
        &self.formats[..self.count as usize]
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl Default for ColorFormats {
    fn default() -> Self {
        Self::NONE
    }
}

/// Fixed-function state baked into graphics pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphicsState {
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub color_formats: ColorFormats,
    /// `UNDEFINED` when there is no depth attachment.
    pub depth_format: vk::Format,
    /// `UNDEFINED` when there is no stencil attachment.
    pub stencil_format: vk::Format,
    /// Bit `i` enables alpha blending on color attachment `i`.
    pub blend_mask: u32,
    /// Multiview mask; zero disables multiview.
    pub view_mask: u32,
}

impl Default for GraphicsState {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            color_formats: ColorFormats::NONE,
            depth_format: vk::Format::UNDEFINED,
            stencil_format: vk::Format::UNDEFINED,
            blend_mask: 0,
            view_mask: 0,
        }
    }
}

/// State set with dynamic-state commands instead of being baked in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicState {
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
}

impl Default for DynamicState {
    fn default() -> Self {
        Self {
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: false,
            depth_write: false,
            depth_compare: vk::CompareOp::LESS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexInputKey {
    pub topology: vk::PrimitiveTopology,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PreRasterizationKey {
    pub vertex: ShaderId,
    pub tess_control: Option<ShaderId>,
    pub tess_eval: Option<ShaderId>,
    pub geometry: Option<ShaderId>,
    pub polygon_mode: vk::PolygonMode,
    pub view_mask: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentShaderKey {
    pub fragment: Option<ShaderId>,
    pub view_mask: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentOutputKey {
    pub color_formats: ColorFormats,
    pub depth_format: vk::Format,
    pub stencil_format: vk::Format,
    pub blend_mask: u32,
    pub view_mask: u32,
}

/// Key of a complete graphics pipeline, linked or monolithic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineKey {
    pub vertex_input: VertexInputKey,
    pub pre_rasterization: PreRasterizationKey,
    pub fragment_shader: FragmentShaderKey,
    pub fragment_output: FragmentOutputKey,
}

impl GraphicsPipelineKey {
    pub fn new(shaders: &ShaderSet, state: &GraphicsState) -> Self {
        Self {
            vertex_input: VertexInputKey {
                topology: state.topology,
            },
            pre_rasterization: PreRasterizationKey {
                vertex: shaders.vertex.id(),
                tess_control: shaders.tess_control.as_ref().map(|s| s.id()),
                tess_eval: shaders.tess_eval.as_ref().map(|s| s.id()),
                geometry: shaders.geometry.as_ref().map(|s| s.id()),
                polygon_mode: state.polygon_mode,
                view_mask: state.view_mask,
            },
            fragment_shader: FragmentShaderKey {
                fragment: shaders.fragment.as_ref().map(|s| s.id()),
                view_mask: state.view_mask,
            },
            fragment_output: FragmentOutputKey {
                color_formats: state.color_formats,
                depth_format: state.depth_format,
                stencil_format: state.stencil_format,
                blend_mask: state.blend_mask,
                view_mask: state.view_mask,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComputePipelineKey {
    pub shader: ShaderId,
}

impl PipelineKey for VertexInputKey {
    const KIND: &'static str = "vertex-input";
}

impl PipelineKey for PreRasterizationKey {
    const KIND: &'static str = "pre-rasterization";
}

impl PipelineKey for FragmentShaderKey {
    const KIND: &'static str = "fragment-shader";
}

impl PipelineKey for FragmentOutputKey {
    const KIND: &'static str = "fragment-output";
}

impl PipelineKey for GraphicsPipelineKey {
    const KIND: &'static str = "graphics";
}

impl PipelineKey for ComputePipelineKey {
    const KIND: &'static str = "compute";
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::Hasher;

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn equal_formats_built_separately_collide() {
        let a = ColorFormats::new(&[vk::Format::B8G8R8A8_SRGB, vk::Format::R16G16B16A16_SFLOAT])
            .unwrap();
        let mut formats = vec![vk::Format::B8G8R8A8_SRGB];
        formats.push(vk::Format::R16G16B16A16_SFLOAT);
        let b = ColorFormats::new(&formats).unwrap();

        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_eq!(a.as_slice(), formats.as_slice());
    }

    #[test]
    fn too_many_color_attachments_rejected() {
        let formats = [vk::Format::R8G8B8A8_UNORM; MAX_COLOR_ATTACHMENTS + 1];
        assert!(ColorFormats::new(&formats).is_err());
    }

    #[test]
    fn output_key_distinguishes_blend_mask() {
        let base = FragmentOutputKey {
            color_formats: ColorFormats::new(&[vk::Format::R8G8B8A8_UNORM]).unwrap(),
            depth_format: vk::Format::D32_SFLOAT,
            stencil_format: vk::Format::UNDEFINED,
            blend_mask: 0,
            view_mask: 0,
        };
        let blended = FragmentOutputKey {
            blend_mask: 1,
            ..base
        };
        assert_ne!(base, blended);
    }
}
