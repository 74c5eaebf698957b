// src/gpu/mod.rs
//! Narrow device contract consumed by the orchestrator.
//!
//! The core never touches a native graphics API directly. It talks to a
//! [`GpuDevice`] through typed handles and plain descriptors. Descriptor
//! enums reuse `wgpu`'s API-neutral value types (formats, usages, blend
//! state) so the production backend maps them one-to-one.
//!
//! Two implementations ship with the crate:
//! * [`wgpu_backend::WgpuDevice`] – the real GPU path.
//! * [`headless::HeadlessDevice`] – in-memory registry used for tests and
//!   GPU-less runs; every handle is validated.

use std::ops::Range;

use crossbeam::channel::{Receiver, Sender};

use crate::error::Result;

pub mod headless;
pub mod resource_pool;
#[cfg(all(feature = "wgpu_backend", not(target_arch = "wasm32")))]
pub mod wgpu_backend;

// -----------------------------------------------------------------------------
// Handles
// -----------------------------------------------------------------------------

macro_rules! gpu_handle {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub const KIND: &'static str = $kind;

            #[inline]
            pub fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

gpu_handle!(BufferId, "buffer");
gpu_handle!(TextureId, "texture");
gpu_handle!(TextureViewId, "texture view");
gpu_handle!(SamplerId, "sampler");
gpu_handle!(BindGroupLayoutId, "bind group layout");
gpu_handle!(BindGroupId, "bind group");
gpu_handle!(ShaderModuleId, "shader module");
gpu_handle!(PipelineId, "render pipeline");
gpu_handle!(
    /// Token for an in-flight non-blocking pipeline compilation.
    PipelineTicket,
    "pipeline compile ticket"
);
gpu_handle!(CommandEncoderId, "command encoder");
gpu_handle!(CommandBufferId, "command buffer");

// -----------------------------------------------------------------------------
// Limits
// -----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Dynamic uniform offsets must be multiples of this (commonly 256).
    pub min_uniform_buffer_offset_alignment: u32,
    /// `bytes_per_row` of texture uploads must be a multiple of this.
    pub texture_row_pitch_alignment: u32,
    pub max_uniform_buffer_binding_size: u32,
    pub max_vertex_buffers: u32,
    pub max_vertex_attributes: u32,
    pub max_texture_dimension_2d: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_uniform_buffer_offset_alignment: 256,
            texture_row_pitch_alignment: wgpu::COPY_BYTES_PER_ROW_ALIGNMENT,
            max_uniform_buffer_binding_size: 64 << 10,
            max_vertex_buffers: 8,
            max_vertex_attributes: 16,
            max_texture_dimension_2d: 8192,
        }
    }
}

// -----------------------------------------------------------------------------
// Resource descriptors
// -----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub usage: wgpu::BufferUsages,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TextureDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    /// 6 for cubemaps.
    pub depth_or_array_layers: u32,
    pub mip_level_count: u32,
    pub sample_count: u32,
    pub format: wgpu::TextureFormat,
    pub usage: wgpu::TextureUsages,
}

impl TextureDesc {
    /// Approximate resident size, summed over the mip chain.
    pub fn size_bytes(&self) -> u64 {
        let bpp = crate::texture::bytes_per_texel(self.format) as u64;
        let mut size = 0u64;
        let mut w = self.width as u64;
        let mut h = self.height as u64;
        for _ in 0..self.mip_level_count.max(1) {
            size += w * h * bpp;
            w = (w / 2).max(1);
            h = (h / 2).max(1);
        }
        size * self.depth_or_array_layers.max(1) as u64 * self.sample_count.max(1) as u64
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TextureViewDesc {
    pub label: String,
    pub dimension: wgpu::TextureViewDimension,
    pub base_mip_level: u32,
    pub mip_level_count: Option<u32>,
    pub base_array_layer: u32,
    pub array_layer_count: Option<u32>,
}

impl TextureViewDesc {
    pub fn new(label: impl Into<String>, dimension: wgpu::TextureViewDimension) -> Self {
        Self {
            label: label.into(),
            dimension,
            base_mip_level: 0,
            mip_level_count: None,
            base_array_layer: 0,
            array_layer_count: None,
        }
    }
}

/// One region upload into a texture (a single mip of a single layer).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TextureWrite {
    pub texture: TextureId,
    pub mip_level: u32,
    /// Array layer (cube face index for cubemaps).
    pub layer: u32,
    pub width: u32,
    pub height: u32,
    /// Must be a multiple of [`DeviceLimits::texture_row_pitch_alignment`]
    /// whenever `height > 1`.
    pub bytes_per_row: u32,
    pub rows_per_image: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SamplerDesc {
    pub label: String,
    pub address_mode: wgpu::AddressMode,
    pub mag_filter: wgpu::FilterMode,
    pub min_filter: wgpu::FilterMode,
    pub mipmap_filter: wgpu::FilterMode,
    pub lod_min_clamp: f32,
    pub lod_max_clamp: f32,
}

impl SamplerDesc {
    pub fn linear_clamp(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            address_mode: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Linear,
            lod_min_clamp: 0.0,
            lod_max_clamp: 32.0,
        }
    }
}

/// Binding slot kind inside a bind group layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindingKind {
    UniformBuffer {
        has_dynamic_offset: bool,
        min_binding_size: u64,
    },
    Texture {
        view_dimension: wgpu::TextureViewDimension,
    },
    Sampler,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BindGroupLayoutEntry {
    pub binding: u32,
    pub visibility: wgpu::ShaderStages,
    pub kind: BindingKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingResource {
    Buffer {
        buffer: BufferId,
        offset: u64,
        size: Option<u64>,
    },
    TextureView(TextureViewId),
    Sampler(SamplerId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindGroupEntry {
    pub binding: u32,
    pub resource: BindingResource,
}

// -----------------------------------------------------------------------------
// Pipeline descriptors
// -----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttributeDesc {
    pub format: wgpu::VertexFormat,
    pub offset: u64,
    pub shader_location: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VertexBufferLayoutDesc {
    pub array_stride: u64,
    pub step_mode: wgpu::VertexStepMode,
    pub attributes: Vec<VertexAttributeDesc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PrimitiveDesc {
    pub topology: wgpu::PrimitiveTopology,
    pub strip_index_format: Option<wgpu::IndexFormat>,
    pub front_face: wgpu::FrontFace,
    pub cull_mode: Option<wgpu::Face>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StencilDesc {
    pub compare: wgpu::CompareFunction,
    pub fail_op: wgpu::StencilOperation,
    pub depth_fail_op: wgpu::StencilOperation,
    pub pass_op: wgpu::StencilOperation,
    pub read_mask: u32,
    pub write_mask: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthStencilDesc {
    pub format: wgpu::TextureFormat,
    pub depth_write_enabled: bool,
    pub depth_compare: wgpu::CompareFunction,
    pub stencil: Option<StencilDesc>,
    pub bias_constant: i32,
    pub bias_slope_scale: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MultisampleDesc {
    pub count: u32,
    pub alpha_to_coverage_enabled: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ColorTargetDesc {
    pub format: wgpu::TextureFormat,
    pub blend: Option<wgpu::BlendState>,
    pub write_mask: wgpu::ColorWrites,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShaderStageDesc<'a> {
    pub module: ShaderModuleId,
    pub entry_point: &'a str,
}

/// Fully-resolved pipeline description handed to the device. Borrowed so the
/// hot path never allocates to describe a pipeline.
#[derive(Clone, Copy, Debug)]
pub struct RenderPipelineDesc<'a> {
    pub label: &'a str,
    pub vertex: ShaderStageDesc<'a>,
    pub fragment: ShaderStageDesc<'a>,
    pub bind_group_layouts: &'a [BindGroupLayoutId],
    pub vertex_buffers: &'a [VertexBufferLayoutDesc],
    pub primitive: PrimitiveDesc,
    pub depth_stencil: Option<DepthStencilDesc>,
    pub multisample: MultisampleDesc,
    pub color_target: ColorTargetDesc,
}

/// Progress of a non-blocking pipeline compilation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelinePoll {
    Pending,
    Ready(PipelineId),
    Failed(String),
}

// -----------------------------------------------------------------------------
// Command recording
// -----------------------------------------------------------------------------

/// A recorded render-pass command. The orchestrator fills one reusable list
/// per frame; backends replay it inside a single pass.
#[derive(Clone, Debug, PartialEq)]
pub enum RenderCommand {
    SetPipeline(PipelineId),
    SetBindGroup {
        index: u32,
        group: BindGroupId,
        dynamic_offset: Option<u32>,
    },
    SetVertexBuffer {
        slot: u32,
        buffer: BufferId,
        offset: u64,
        size: u64,
    },
    SetIndexBuffer {
        buffer: BufferId,
        format: wgpu::IndexFormat,
        offset: u64,
        size: u64,
    },
    Draw {
        vertices: Range<u32>,
        instances: Range<u32>,
    },
    DrawIndexed {
        indices: Range<u32>,
        base_vertex: i32,
        instances: Range<u32>,
    },
}

impl RenderCommand {
    #[inline]
    pub fn is_draw(&self) -> bool {
        matches!(self, RenderCommand::Draw { .. } | RenderCommand::DrawIndexed { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ColorAttachment {
    pub view: TextureViewId,
    /// Single-sample target the multisampled `view` resolves into.
    pub resolve_target: Option<TextureViewId>,
    /// `None` loads existing contents.
    pub clear: Option<wgpu::Color>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthAttachment {
    pub view: TextureViewId,
    pub clear_depth: Option<f32>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderPassDesc<'a> {
    pub label: &'a str,
    pub color: ColorAttachment,
    pub depth: Option<DepthAttachment>,
}

/// Swapchain image acquired for the current frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceTarget {
    pub view: TextureViewId,
    pub width: u32,
    pub height: u32,
    pub format: wgpu::TextureFormat,
}

// -----------------------------------------------------------------------------
// Device loss signalling
// -----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceLostEvent {
    pub reason: String,
}

pub type DeviceLossSender = Sender<DeviceLostEvent>;
pub type DeviceLossReceiver = Receiver<DeviceLostEvent>;

// -----------------------------------------------------------------------------
// Device contract
// -----------------------------------------------------------------------------

/// The only graphics surface the orchestrator depends on. All calls come from
/// the single render thread. Any call may return
/// [`RenderError::ContextLost`](crate::RenderError::ContextLost) once the
/// device is gone; `destroy_*` calls on a lost device are silent no-ops.
pub trait GpuDevice {
    fn limits(&self) -> DeviceLimits;

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferId>;
    fn destroy_buffer(&mut self, buffer: BufferId);

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId>;
    fn destroy_texture(&mut self, texture: TextureId);
    fn create_texture_view(
        &mut self,
        texture: TextureId,
        desc: &TextureViewDesc,
    ) -> Result<TextureViewId>;
    fn destroy_texture_view(&mut self, view: TextureViewId);

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId>;
    fn destroy_sampler(&mut self, sampler: SamplerId);

    fn create_bind_group_layout(
        &mut self,
        label: &str,
        entries: &[BindGroupLayoutEntry],
    ) -> Result<BindGroupLayoutId>;
    fn destroy_bind_group_layout(&mut self, layout: BindGroupLayoutId);
    fn create_bind_group(
        &mut self,
        label: &str,
        layout: BindGroupLayoutId,
        entries: &[BindGroupEntry],
    ) -> Result<BindGroupId>;
    fn destroy_bind_group(&mut self, group: BindGroupId);

    fn create_shader_module(&mut self, label: &str, source: &str) -> Result<ShaderModuleId>;
    fn destroy_shader_module(&mut self, module: ShaderModuleId);

    /// Blocking compile.
    fn create_render_pipeline(&mut self, desc: &RenderPipelineDesc<'_>) -> Result<PipelineId>;
    /// Start a compile without waiting for it.
    fn begin_pipeline_compile(&mut self, desc: &RenderPipelineDesc<'_>)
        -> Result<PipelineTicket>;
    /// Non-blocking progress check. Returns `Ready`/`Failed` exactly once per
    /// ticket; the ticket is invalid afterwards.
    fn poll_pipeline(&mut self, ticket: PipelineTicket) -> PipelinePoll;
    /// Abandon an unresolved compile; a pipeline that finishes later is
    /// dropped by the device instead of being handed out.
    fn cancel_pipeline_compile(&mut self, ticket: PipelineTicket);
    fn destroy_render_pipeline(&mut self, pipeline: PipelineId);

    // Queue.
    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()>;
    fn write_texture(&mut self, write: &TextureWrite, data: &[u8]) -> Result<()>;
    fn submit(&mut self, command_buffers: &[CommandBufferId]) -> Result<()>;

    // Command recording.
    fn create_command_encoder(&mut self, label: &str) -> Result<CommandEncoderId>;
    fn encode_render_pass(
        &mut self,
        encoder: CommandEncoderId,
        pass: &RenderPassDesc<'_>,
        commands: &[RenderCommand],
    ) -> Result<()>;
    fn finish_command_encoder(&mut self, encoder: CommandEncoderId) -> Result<CommandBufferId>;

    // Swapchain.
    fn acquire_surface_target(&mut self) -> Result<SurfaceTarget>;
    fn present(&mut self);
    fn resize_surface(&mut self, width: u32, height: u32);
}

/// Creates devices; called once at start-up and again after every loss.
pub trait DeviceFactory {
    /// `loss` must be wired to the new device's asynchronous loss
    /// notification. The callback may only send on it.
    fn request_device(&mut self, loss: DeviceLossSender) -> Result<Box<dyn GpuDevice>>;
}

/// Round `value` up to the next multiple of `alignment` (power of two or not).
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiples() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(10, 12), 12);
        assert_eq!(align_up(7, 0), 7);
    }

    #[test]
    fn cube_texture_size_counts_layers_and_mips() {
        let desc = TextureDesc {
            label: "env".into(),
            width: 4,
            height: 4,
            depth_or_array_layers: 6,
            mip_level_count: 3,
            sample_count: 1,
            format: wgpu::TextureFormat::Rgba16Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
        };
        // (16 + 4 + 1) texels * 8 bytes * 6 faces
        assert_eq!(desc.size_bytes(), 21 * 8 * 6);
    }
}
