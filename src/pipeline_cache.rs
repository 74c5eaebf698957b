// src/pipeline_cache.rs
//! Memoized render pipelines keyed by their complete state.
//!
//! - The key is an xxh3 digest over the program hash (sources hashed once at
//!   program construction), vertex layouts, bind group layout handles,
//!   primitive/depth/stencil/multisample state and the color target.
//! - `request` never blocks: a miss registers a `Pending` entry and starts a
//!   compile on the device. `poll` advances pending entries once per frame.
//! - Failed entries keep their diagnostics and are not recompiled until
//!   `clear`.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use xxhash_rust::xxh3::Xxh3;

use crate::error::{ErrorKind, RenderError, Result};
use crate::gpu::{
    BindGroupLayoutId, ColorTargetDesc, DepthStencilDesc, GpuDevice, MultisampleDesc, PipelineId,
    PipelinePoll, PipelineTicket, PrimitiveDesc, RenderPipelineDesc, ShaderModuleId, ShaderStageDesc,
    StencilDesc, VertexBufferLayoutDesc,
};
use crate::materials::{RenderState, ShaderProgram};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineKey(pub u64);

/// Everything a pipeline is built from, borrowed from the frame loop.
#[derive(Clone, Copy, Debug)]
pub struct PipelineState<'a> {
    pub program: &'a ShaderProgram,
    pub vertex_buffers: &'a [VertexBufferLayoutDesc],
    pub bind_group_layouts: &'a [BindGroupLayoutId],
    pub topology: wgpu::PrimitiveTopology,
    pub render_state: &'a RenderState,
    pub color_format: wgpu::TextureFormat,
    /// `None` when the pass has no depth attachment.
    pub depth_format: Option<wgpu::TextureFormat>,
    pub sample_count: u32,
}

impl PipelineState<'_> {
    pub fn key(&self) -> PipelineKey {
        let mut h = Xxh3::new();
        self.program.hash().hash(&mut h);
        self.vertex_buffers.hash(&mut h);
        self.bind_group_layouts.hash(&mut h);
        self.primitive().hash(&mut h);
        match self.depth_stencil() {
            Some(ds) => {
                1u8.hash(&mut h);
                ds.format.hash(&mut h);
                ds.depth_write_enabled.hash(&mut h);
                ds.depth_compare.hash(&mut h);
                ds.stencil.hash(&mut h);
                ds.bias_constant.hash(&mut h);
                ds.bias_slope_scale.to_bits().hash(&mut h);
            }
            None => 0u8.hash(&mut h),
        }
        self.multisample().hash(&mut h);
        self.color_target().hash(&mut h);
        PipelineKey(h.finish())
    }

    pub fn primitive(&self) -> PrimitiveDesc {
        let triangles = matches!(
            self.topology,
            wgpu::PrimitiveTopology::TriangleList | wgpu::PrimitiveTopology::TriangleStrip
        );
        PrimitiveDesc {
            topology: self.topology,
            strip_index_format: None,
            front_face: self.render_state.front_face,
            cull_mode: if triangles { self.render_state.cull_mode() } else { None },
        }
    }

    pub fn depth_stencil(&self) -> Option<DepthStencilDesc> {
        let format = self.depth_format?;
        let rs = self.render_state;
        let stencil = rs.stencil.filter(|_| format.has_stencil_aspect()).map(|s| StencilDesc {
            compare: s.compare,
            fail_op: s.fail_op,
            depth_fail_op: s.depth_fail_op,
            pass_op: s.pass_op,
            read_mask: s.read_mask,
            write_mask: s.write_mask,
        });
        let (bias_constant, bias_slope_scale) = rs
            .polygon_offset
            .map_or((0, 0.0), |offset| (offset.constant, offset.slope_scale));
        Some(DepthStencilDesc {
            format,
            depth_write_enabled: rs.depth_test && rs.depth_write,
            depth_compare: rs.effective_depth_compare(),
            stencil,
            bias_constant,
            bias_slope_scale,
        })
    }

    pub fn multisample(&self) -> MultisampleDesc {
        let count = self.sample_count.max(1);
        MultisampleDesc {
            count,
            alpha_to_coverage_enabled: self.render_state.alpha_to_coverage && count > 1,
        }
    }

    pub fn color_target(&self) -> ColorTargetDesc {
        ColorTargetDesc {
            format: self.color_format,
            blend: self.render_state.blend.blend_state(),
            write_mask: wgpu::ColorWrites::ALL,
        }
    }
}

/// Externally visible state of one cache entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineStatus {
    Pending,
    Ready(PipelineId),
    Failed(Arc<str>),
}

impl PipelineStatus {
    #[inline]
    pub fn ready(&self) -> Option<PipelineId> {
        match self {
            PipelineStatus::Ready(id) => Some(*id),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum Entry {
    Pending { ticket: PipelineTicket, label: String },
    Ready(PipelineId),
    Failed(Arc<str>),
}

impl Entry {
    fn status(&self) -> PipelineStatus {
        match self {
            Entry::Pending { .. } => PipelineStatus::Pending,
            Entry::Ready(id) => PipelineStatus::Ready(*id),
            Entry::Failed(diagnostics) => PipelineStatus::Failed(diagnostics.clone()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub compile_failures: u64,
    pub ready: usize,
    pub pending: usize,
    pub shader_modules: usize,
}

#[derive(Debug, Default)]
pub struct PipelineCache {
    entries: HashMap<PipelineKey, Entry>,
    /// Source hash -> module.
    modules: HashMap<u64, ShaderModuleId>,
    pending: Vec<PipelineKey>,
    hits: u64,
    misses: u64,
    compile_failures: u64,
}

impl PipelineCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking lookup. On a miss the compile is started and, if the
    /// device finishes it immediately, the entry is `Ready` on return.
    pub fn request(&mut self, device: &mut dyn GpuDevice, state: &PipelineState<'_>) -> Result<PipelineStatus> {
        let key = state.key();
        if let Some(entry) = self.entries.get(&key) {
            if matches!(entry, Entry::Ready(_)) {
                self.hits += 1;
            }
            return Ok(entry.status());
        }

        self.misses += 1;
        log::debug!("PipelineCache: miss for `{}` ({key:?})", state.program.label());
        let (vs, fs) = match self.modules_for(device, state.program) {
            Ok(modules) => modules,
            Err(err) => return self.fail_or_propagate(key, err),
        };
        let desc = describe(state, vs, fs);
        let ticket = match device.begin_pipeline_compile(&desc) {
            Ok(ticket) => ticket,
            Err(err) => return self.fail_or_propagate(key, err),
        };
        let entry = match device.poll_pipeline(ticket) {
            PipelinePoll::Ready(pipeline) => Entry::Ready(pipeline),
            PipelinePoll::Pending => {
                self.pending.push(key);
                Entry::Pending {
                    ticket,
                    label: state.program.label().to_owned(),
                }
            }
            PipelinePoll::Failed(diagnostics) => {
                self.record_failure(state.program.label(), &diagnostics);
                Entry::Failed(diagnostics.into())
            }
        };
        let status = entry.status();
        self.entries.insert(key, entry);
        Ok(status)
    }

    /// Blocking lookup: compiles on a miss and waits for an in-flight
    /// compile of the same key.
    pub fn get_or_create(&mut self, device: &mut dyn GpuDevice, state: &PipelineState<'_>) -> Result<PipelineId> {
        let key = state.key();
        if !self.entries.contains_key(&key) {
            self.misses += 1;
            let (vs, fs) = match self.modules_for(device, state.program) {
                Ok(modules) => modules,
                Err(err) => {
                    self.fail_or_propagate(key, err.clone())?;
                    return Err(err);
                }
            };
            let entry = match device.create_render_pipeline(&describe(state, vs, fs)) {
                Ok(pipeline) => Entry::Ready(pipeline),
                Err(err) if err.kind() == ErrorKind::PipelineCompile => {
                    self.record_failure(state.program.label(), &err.to_string());
                    self.entries.insert(key, Entry::Failed(err.to_string().into()));
                    return Err(err);
                }
                Err(err) => return Err(err),
            };
            self.entries.insert(key, entry);
            return self.ready_or_error(key, state.program.label());
        }

        loop {
            match self.entries.get(&key) {
                Some(Entry::Pending { .. }) => {
                    if self.poll_one(device, key) {
                        std::thread::yield_now();
                    } else {
                        self.pending.retain(|pending| *pending != key);
                    }
                }
                Some(Entry::Ready(_)) => {
                    self.hits += 1;
                    return self.ready_or_error(key, state.program.label());
                }
                _ => return self.ready_or_error(key, state.program.label()),
            }
        }
    }

    /// Advance every pending compile once. Returns how many resolved.
    pub fn poll(&mut self, device: &mut dyn GpuDevice) -> usize {
        let mut pending = std::mem::take(&mut self.pending);
        let before = pending.len();
        pending.retain(|&key| self.poll_one(device, key));
        let resolved = before - pending.len();
        self.pending = pending;
        resolved
    }

    pub fn status(&self, key: PipelineKey) -> Option<PipelineStatus> {
        self.entries.get(&key).map(Entry::status)
    }

    /// Destroy every pipeline and shader module. Pending compiles are
    /// cancelled, so a pipeline finishing after this call is dropped by the
    /// device.
    pub fn clear(&mut self, device: &mut dyn GpuDevice) {
        for (_, entry) in self.entries.drain() {
            match entry {
                Entry::Ready(pipeline) => device.destroy_render_pipeline(pipeline),
                Entry::Pending { ticket, .. } => device.cancel_pipeline_compile(ticket),
                Entry::Failed(_) => {}
            }
        }
        for (_, module) in self.modules.drain() {
            device.destroy_shader_module(module);
        }
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> PipelineCacheStats {
        let ready = self.entries.values().filter(|e| matches!(e, Entry::Ready(_))).count();
        PipelineCacheStats {
            hits: self.hits,
            misses: self.misses,
            compile_failures: self.compile_failures,
            ready,
            pending: self.pending.len(),
            shader_modules: self.modules.len(),
        }
    }

    // ── internals ────────────────────────────────────────────────────────

    fn modules_for(
        &mut self,
        device: &mut dyn GpuDevice,
        program: &ShaderProgram,
    ) -> Result<(ShaderModuleId, ShaderModuleId)> {
        let vs = self.module(device, program.label(), program.vertex_hash(), program.vertex_source())?;
        let fs = self.module(device, program.label(), program.fragment_hash(), program.fragment_source())?;
        Ok((vs, fs))
    }

    fn module(&mut self, device: &mut dyn GpuDevice, label: &str, hash: u64, source: &str) -> Result<ShaderModuleId> {
        if let Some(&module) = self.modules.get(&hash) {
            return Ok(module);
        }
        let module = device.create_shader_module(label, source)?;
        self.modules.insert(hash, module);
        Ok(module)
    }

    /// Compile diagnostics become a `Failed` entry; anything else (lost
    /// device, stale handle) is the caller's problem.
    fn fail_or_propagate(&mut self, key: PipelineKey, err: RenderError) -> Result<PipelineStatus> {
        if err.kind() != ErrorKind::PipelineCompile {
            return Err(err);
        }
        let diagnostics: Arc<str> = err.to_string().into();
        self.compile_failures += 1;
        log::warn!("PipelineCache: {err}; {}", err.remedy());
        self.entries.insert(key, Entry::Failed(diagnostics.clone()));
        Ok(PipelineStatus::Failed(diagnostics))
    }

    fn record_failure(&mut self, label: &str, diagnostics: &str) {
        self.compile_failures += 1;
        log::warn!("PipelineCache: `{label}` failed to compile: {diagnostics}");
    }

    /// Returns true while the entry is still compiling.
    fn poll_one(&mut self, device: &mut dyn GpuDevice, key: PipelineKey) -> bool {
        let Some(Entry::Pending { ticket, label }) = self.entries.get(&key) else {
            return false;
        };
        let (ticket, label) = (*ticket, label.clone());
        match device.poll_pipeline(ticket) {
            PipelinePoll::Pending => true,
            PipelinePoll::Ready(pipeline) => {
                log::debug!("PipelineCache: `{label}` ready");
                self.entries.insert(key, Entry::Ready(pipeline));
                false
            }
            PipelinePoll::Failed(diagnostics) => {
                self.record_failure(&label, &diagnostics);
                self.entries.insert(key, Entry::Failed(diagnostics.into()));
                false
            }
        }
    }

    fn ready_or_error(&self, key: PipelineKey, label: &str) -> Result<PipelineId> {
        match self.entries.get(&key) {
            Some(Entry::Ready(pipeline)) => Ok(*pipeline),
            Some(Entry::Failed(diagnostics)) => Err(RenderError::PipelineCompileFailure {
                label: label.to_owned(),
                diagnostics: diagnostics.to_string(),
            }),
            _ => Err(RenderError::custom(format!("pipeline `{label}` is still compiling"))),
        }
    }
}

fn describe<'a>(state: &PipelineState<'a>, vs: ShaderModuleId, fs: ShaderModuleId) -> RenderPipelineDesc<'a> {
    RenderPipelineDesc {
        label: state.program.label(),
        vertex: ShaderStageDesc {
            module: vs,
            entry_point: state.program.vertex_entry(),
        },
        fragment: ShaderStageDesc {
            module: fs,
            entry_point: state.program.fragment_entry(),
        },
        bind_group_layouts: state.bind_group_layouts,
        vertex_buffers: state.vertex_buffers,
        primitive: state.primitive(),
        depth_stencil: state.depth_stencil(),
        multisample: state.multisample(),
        color_target: state.color_target(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bind_group_manager::BindGroupManager;
    use crate::gpu::headless::{HeadlessDevice, COMPILE_ERROR_MARKER};
    use crate::gpu::VertexAttributeDesc;
    use crate::materials::{BlendMode, Side, StencilState};
    use crate::texture::DEPTH_FORMAT;

    /// Pipeline inputs; the device is kept outside so tests can borrow the
    /// state and the device at the same time.
    struct Inputs {
        layouts: Vec<BindGroupLayoutId>,
        buffers: Vec<VertexBufferLayoutDesc>,
        program: ShaderProgram,
        render_state: RenderState,
    }

    impl Inputs {
        fn state(&self) -> PipelineState<'_> {
            PipelineState {
                program: &self.program,
                vertex_buffers: &self.buffers,
                bind_group_layouts: &self.layouts,
                topology: wgpu::PrimitiveTopology::TriangleList,
                render_state: &self.render_state,
                color_format: wgpu::TextureFormat::Bgra8UnormSrgb,
                depth_format: Some(DEPTH_FORMAT),
                sample_count: 1,
            }
        }
    }

    fn setup(source: &str) -> (HeadlessDevice, Inputs) {
        let mut device = HeadlessDevice::new();
        let layout = BindGroupManager::new().dynamic_uniform_layout(&mut device, 256).unwrap();
        let inputs = Inputs {
            layouts: vec![layout],
            buffers: vec![VertexBufferLayoutDesc {
                array_stride: 12,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: vec![VertexAttributeDesc {
                    format: wgpu::VertexFormat::Float32x3,
                    offset: 0,
                    shader_location: 0,
                }],
            }],
            program: ShaderProgram::single_module("test", source),
            render_state: RenderState::default(),
        };
        (device, inputs)
    }

    #[test]
    fn same_key_returns_same_pipeline() {
        let (mut device, inputs) = setup("fn vs_main() {}");
        let mut cache = PipelineCache::new();
        let state = inputs.state();
        let a = cache.get_or_create(&mut device, &state).unwrap();
        let b = cache.get_or_create(&mut device, &state).unwrap();
        assert_eq!(a, b);
        assert_eq!(device.probe().counters().pipelines_created, 1);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn cull_mode_change_is_a_miss() {
        let (mut device, mut inputs) = setup("fn vs_main() {}");
        let mut cache = PipelineCache::new();
        let front = cache.get_or_create(&mut device, &inputs.state()).unwrap();
        let key_front = inputs.state().key();

        inputs.render_state.side = Side::Double;
        assert_ne!(inputs.state().key(), key_front);
        let double = cache.get_or_create(&mut device, &inputs.state()).unwrap();
        assert_ne!(front, double);
        assert_eq!(cache.stats().misses, 2);
        // Both pipelines share the same shader module.
        assert_eq!(cache.stats().shader_modules, 1);
    }

    #[test]
    fn request_resolves_immediately_on_synchronous_device() {
        let (mut device, inputs) = setup("fn vs_main() {}");
        let mut cache = PipelineCache::new();
        let status = cache.request(&mut device, &inputs.state()).unwrap();
        assert!(status.ready().is_some());
    }

    #[test]
    fn pending_entries_resolve_through_poll() {
        let (mut device, inputs) = setup("fn vs_main() {}");
        device.probe().set_pipeline_latency(1);
        let mut cache = PipelineCache::new();
        let state = inputs.state();
        assert_eq!(cache.request(&mut device, &state).unwrap(), PipelineStatus::Pending);
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.poll(&mut device), 1);
        assert!(cache.request(&mut device, &state).unwrap().ready().is_some());
        assert_eq!(cache.stats().pending, 0);
    }

    #[test]
    fn pending_key_is_not_compiled_twice() {
        let (mut device, inputs) = setup("fn vs_main() {}");
        device.probe().set_pipeline_latency(3);
        let mut cache = PipelineCache::new();
        let state = inputs.state();
        assert_eq!(cache.request(&mut device, &state).unwrap(), PipelineStatus::Pending);
        assert_eq!(cache.request(&mut device, &state).unwrap(), PipelineStatus::Pending);
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(device.probe().pending_compiles(), 1);
    }

    #[test]
    fn failed_entries_are_not_retried() {
        let source = format!("fn vs_main() {{}} // {COMPILE_ERROR_MARKER}");
        let (mut device, inputs) = setup(&source);
        let mut cache = PipelineCache::new();
        let state = inputs.state();
        let status = cache.request(&mut device, &state).unwrap();
        let PipelineStatus::Failed(diagnostics) = status else {
            panic!("expected failure, got {status:?}");
        };
        assert!(diagnostics.contains(COMPILE_ERROR_MARKER));
        cache.request(&mut device, &state).unwrap();
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().compile_failures, 1);

        let err = cache.get_or_create(&mut device, &state).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PipelineCompile);
    }

    #[test]
    fn clear_destroys_pipelines_and_modules() {
        let (mut device, mut inputs) = setup("fn vs_main() {}");
        let probe = device.probe();
        let mut cache = PipelineCache::new();
        cache.get_or_create(&mut device, &inputs.state()).unwrap();
        inputs.render_state.blend = BlendMode::Alpha;
        cache.get_or_create(&mut device, &inputs.state()).unwrap();
        assert_eq!(probe.live_pipelines(), 2);

        cache.clear(&mut device);
        assert!(cache.is_empty());
        assert_eq!(probe.live_pipelines(), 0);
        assert_eq!(probe.live_shader_modules(), 0);
        assert_eq!(probe.invalid_handle_uses(), 0);
    }

    #[test]
    fn clear_cancels_compiles_still_in_flight() {
        let (mut device, inputs) = setup("fn vs_main() {}");
        let probe = device.probe();
        probe.set_pipeline_latency(5);
        let mut cache = PipelineCache::new();
        assert_eq!(cache.request(&mut device, &inputs.state()).unwrap(), PipelineStatus::Pending);

        cache.clear(&mut device);
        assert_eq!(probe.pending_compiles(), 0);
        assert_eq!(probe.counters().compiles_cancelled, 1);
        assert_eq!(probe.live_pipelines(), 0);
        assert_eq!(cache.stats().pending, 0);
        assert_eq!(probe.invalid_handle_uses(), 0);
    }

    #[test]
    fn stencil_is_dropped_without_a_stencil_aspect() {
        let (_device, mut inputs) = setup("fn vs_main() {}");
        inputs.render_state.stencil = Some(StencilState {
            compare: wgpu::CompareFunction::Always,
            fail_op: wgpu::StencilOperation::Keep,
            depth_fail_op: wgpu::StencilOperation::Keep,
            pass_op: wgpu::StencilOperation::Replace,
            read_mask: 0xff,
            write_mask: 0xff,
        });
        let with_stencil = inputs.state();
        assert!(with_stencil.depth_stencil().unwrap().stencil.is_some());
        let no_stencil = PipelineState {
            depth_format: Some(wgpu::TextureFormat::Depth32Float),
            ..with_stencil
        };
        assert!(no_stencil.depth_stencil().unwrap().stencil.is_none());
        assert_ne!(with_stencil.key(), no_stencil.key());
    }
}
