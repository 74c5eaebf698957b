// src/materials/mod.rs
//! Material definitions. Materials are a closed set of variants; each variant
//! knows how to pack its parameters into the per-draw uniform block. Shaders
//! and binding requirements live in the descriptor registry
//! ([`material_system`]), never in the frame loop.

use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::{Pod, Zeroable};

pub mod material_system;

pub use material_system::{BindingRequirement, MaterialDescriptor, MaterialDescriptorRegistry, ShaderProgram};

static NEXT_MATERIAL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialId(pub u64);

// ═══════════════════════════════════════════════════════════════════════════════
// Render state
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Side {
    #[default]
    Front,
    Back,
    Double,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    #[default]
    Opaque,
    Alpha,
    Additive,
    Premultiplied,
}

impl BlendMode {
    pub fn blend_state(self) -> Option<wgpu::BlendState> {
        match self {
            BlendMode::Opaque => None,
            BlendMode::Alpha => Some(wgpu::BlendState::ALPHA_BLENDING),
            BlendMode::Premultiplied => Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
            BlendMode::Additive => Some(wgpu::BlendState {
                color: wgpu::BlendComponent {
                    src_factor: wgpu::BlendFactor::SrcAlpha,
                    dst_factor: wgpu::BlendFactor::One,
                    operation: wgpu::BlendOperation::Add,
                },
                alpha: wgpu::BlendComponent::OVER,
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StencilState {
    pub compare: wgpu::CompareFunction,
    pub fail_op: wgpu::StencilOperation,
    pub depth_fail_op: wgpu::StencilOperation,
    pub pass_op: wgpu::StencilOperation,
    pub read_mask: u32,
    pub write_mask: u32,
}

/// Depth bias in the units wgpu takes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PolygonOffset {
    pub constant: i32,
    pub slope_scale: f32,
}

/// Fixed-function state of a material. Everything here feeds both the
/// pipeline key and the batch key.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderState {
    pub side: Side,
    pub front_face: wgpu::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: wgpu::CompareFunction,
    pub blend: BlendMode,
    pub stencil: Option<StencilState>,
    pub polygon_offset: Option<PolygonOffset>,
    pub dithering: bool,
    pub alpha_to_coverage: bool,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            side: Side::Front,
            front_face: wgpu::FrontFace::Ccw,
            depth_test: true,
            depth_write: true,
            depth_compare: wgpu::CompareFunction::LessEqual,
            blend: BlendMode::Opaque,
            stencil: None,
            polygon_offset: None,
            dithering: false,
            alpha_to_coverage: false,
        }
    }
}

impl RenderState {
    pub fn transparent() -> Self {
        Self {
            blend: BlendMode::Alpha,
            depth_write: false,
            ..Self::default()
        }
    }

    pub fn cull_mode(&self) -> Option<wgpu::Face> {
        match self.side {
            Side::Front => Some(wgpu::Face::Back),
            Side::Back => Some(wgpu::Face::Front),
            Side::Double => None,
        }
    }

    /// Depth compare actually used by the pipeline (test disabled = Always).
    pub fn effective_depth_compare(&self) -> wgpu::CompareFunction {
        if self.depth_test {
            self.depth_compare
        } else {
            wgpu::CompareFunction::Always
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Material variants
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MaterialKind {
    Basic,
    Lambert,
    Standard,
    Line,
}

/// Four vec4 rows appended to the mesh uniform block.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct MaterialUniforms {
    pub rows: [[f32; 4]; 4],
}

#[derive(Clone, Debug, PartialEq)]
pub enum MaterialVariant {
    Basic {
        color: [f32; 4],
    },
    Lambert {
        color: [f32; 4],
        emissive: [f32; 3],
    },
    /// Metallic-roughness with image-based lighting.
    Standard {
        base_color: [f32; 4],
        metallic: f32,
        roughness: f32,
        emissive: [f32; 3],
        env_intensity: f32,
    },
    Line {
        color: [f32; 4],
        width: f32,
    },
}

impl MaterialVariant {
    pub fn kind(&self) -> MaterialKind {
        match self {
            MaterialVariant::Basic { .. } => MaterialKind::Basic,
            MaterialVariant::Lambert { .. } => MaterialKind::Lambert,
            MaterialVariant::Standard { .. } => MaterialKind::Standard,
            MaterialVariant::Line { .. } => MaterialKind::Line,
        }
    }

    /// Row 0 is always the base colour. Row 3.w of `Standard` is filled with
    /// the environment mip count by the frame loop.
    pub fn uniforms(&self) -> MaterialUniforms {
        let rows = match *self {
            MaterialVariant::Basic { color } => [color, [0.0; 4], [0.0; 4], [0.0; 4]],
            MaterialVariant::Lambert { color, emissive } => {
                [color, [emissive[0], emissive[1], emissive[2], 0.0], [0.0; 4], [0.0; 4]]
            }
            MaterialVariant::Standard {
                base_color,
                metallic,
                roughness,
                emissive,
                env_intensity,
            } => [
                base_color,
                [emissive[0], emissive[1], emissive[2], 0.0],
                [metallic.clamp(0.0, 1.0), roughness.clamp(0.04, 1.0), env_intensity, 0.0],
                [0.0; 4],
            ],
            MaterialVariant::Line { color, width } => [color, [width, 0.0, 0.0, 0.0], [0.0; 4], [0.0; 4]],
        };
        MaterialUniforms { rows }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Material {
    id: MaterialId,
    pub name: String,
    pub variant: MaterialVariant,
    pub render_state: RenderState,
}

impl Material {
    pub fn new(name: impl Into<String>, variant: MaterialVariant) -> Self {
        Self {
            id: MaterialId(NEXT_MATERIAL_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            variant,
            render_state: RenderState::default(),
        }
    }

    pub fn basic(color: [f32; 4]) -> Self {
        Self::new("basic", MaterialVariant::Basic { color })
    }

    pub fn lambert(color: [f32; 4]) -> Self {
        Self::new(
            "lambert",
            MaterialVariant::Lambert {
                color,
                emissive: [0.0; 3],
            },
        )
    }

    pub fn standard(base_color: [f32; 4], metallic: f32, roughness: f32) -> Self {
        Self::new(
            "standard",
            MaterialVariant::Standard {
                base_color,
                metallic,
                roughness,
                emissive: [0.0; 3],
                env_intensity: 1.0,
            },
        )
    }

    pub fn line(color: [f32; 4]) -> Self {
        Self::new("line", MaterialVariant::Line { color, width: 1.0 })
    }

    pub fn with_render_state(mut self, render_state: RenderState) -> Self {
        self.render_state = render_state;
        self
    }

    #[inline]
    pub fn id(&self) -> MaterialId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> MaterialKind {
        self.variant.kind()
    }

    pub fn uniforms(&self) -> MaterialUniforms {
        self.variant.uniforms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_uniforms_clamp_parameters() {
        let material = Material::standard([1.0, 0.5, 0.25, 1.0], 2.0, 0.0);
        let uniforms = material.uniforms();
        assert_eq!(uniforms.rows[0], [1.0, 0.5, 0.25, 1.0]);
        assert_eq!(uniforms.rows[2][0], 1.0);
        assert_eq!(uniforms.rows[2][1], 0.04);
        assert_eq!(std::mem::size_of::<MaterialUniforms>(), 64);
    }

    #[test]
    fn side_maps_to_cull_mode() {
        let mut state = RenderState::default();
        assert_eq!(state.cull_mode(), Some(wgpu::Face::Back));
        state.side = Side::Double;
        assert_eq!(state.cull_mode(), None);
        state.depth_test = false;
        assert_eq!(state.effective_depth_compare(), wgpu::CompareFunction::Always);
    }

    #[test]
    fn materials_get_distinct_ids() {
        let a = Material::basic([1.0; 4]);
        let b = Material::basic([1.0; 4]);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.kind(), MaterialKind::Basic);
    }
}
