//! # Headless Device
//!
//! A [`GpuDevice`] with no GPU behind it. Every object lives in an in-memory
//! registry, so the backend can:
//!
//! * reject stale or never-created handles with `InvalidHandle` and count them,
//! * keep buffer contents for inspection (uniform slots, vertex streams),
//! * inject failures (buffer budget, broken shaders, compile latency,
//!   outdated swapchain, device loss).
//!
//! Handles are unique across every headless device in the process, so a
//! handle from a lost device can never alias one from its replacement.
//!
//! Tests keep a [`HeadlessProbe`] (shared state) while the device itself is
//! boxed inside the renderer.

// -----------------------------------------------------------------------------
// Imports
// -----------------------------------------------------------------------------

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{RenderError, Result};
use crate::gpu::{
    BindGroupEntry, BindGroupId, BindGroupLayoutEntry, BindGroupLayoutId, BindingKind, BindingResource,
    BufferDesc, BufferId, CommandBufferId, CommandEncoderId, DeviceFactory, DeviceLimits,
    DeviceLossSender, DeviceLostEvent, GpuDevice, PipelineId, PipelinePoll, PipelineTicket,
    RenderCommand, RenderPassDesc, RenderPipelineDesc, SamplerDesc, SamplerId, ShaderModuleId,
    SurfaceTarget, TextureDesc, TextureId, TextureViewDesc, TextureViewId, TextureWrite,
};

/// Shader sources containing this marker fail pipeline compilation.
pub const COMPILE_ERROR_MARKER: &str = "@compile_error";

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

#[inline]
fn next_handle() -> u64 {
    NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)
}

// -----------------------------------------------------------------------------
// Settings
// -----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeadlessSettings {
    pub limits: DeviceLimits,
    pub surface_width: u32,
    pub surface_height: u32,
    pub surface_format: wgpu::TextureFormat,
    /// Polls a non-blocking compile stays `Pending` before resolving.
    pub pipeline_latency: u32,
    /// Remaining buffer creations before allocation fails. `None` = unlimited.
    pub buffer_budget: Option<u64>,
}

impl Default for HeadlessSettings {
    fn default() -> Self {
        Self {
            limits: DeviceLimits::default(),
            surface_width: 1280,
            surface_height: 720,
            surface_format: wgpu::TextureFormat::Bgra8UnormSrgb,
            pipeline_latency: 0,
            buffer_budget: None,
        }
    }
}

// -----------------------------------------------------------------------------
// Shared state
// -----------------------------------------------------------------------------

#[derive(Debug)]
struct BufferRecord {
    data: Vec<u8>,
}

#[derive(Debug)]
struct PendingCompile {
    polls_left: u32,
    outcome: std::result::Result<(), String>,
}

#[derive(Debug, Default)]
struct RecordedPass {
    commands: Vec<RenderCommand>,
    draws: u64,
}

/// Counters exposed through [`HeadlessProbe`].
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeadlessCounters {
    pub buffers_created: u64,
    pub buffers_destroyed: u64,
    pub buffer_writes: u64,
    pub textures_created: u64,
    pub texture_writes: u64,
    pub texture_bytes_written: u64,
    pub shader_modules_created: u64,
    pub pipelines_created: u64,
    pub compiles_cancelled: u64,
    pub bind_groups_created: u64,
    pub submits: u64,
    pub presents: u64,
    pub draws_submitted: u64,
    pub last_submit_draws: u64,
    pub invalid_handle_uses: u64,
    pub misaligned_offsets: u64,
}

#[derive(Debug, Default)]
struct HeadlessState {
    settings: HeadlessSettings,
    lost: Option<String>,
    loss_tx: Option<DeviceLossSender>,

    buffers: HashMap<u64, BufferRecord>,
    textures: HashMap<u64, TextureDesc>,
    views: HashMap<u64, u64>,
    samplers: HashSet<u64>,
    layouts: HashMap<u64, Vec<BindGroupLayoutEntry>>,
    bind_groups: HashSet<u64>,
    shaders: HashMap<u64, bool>,
    pipelines: HashSet<u64>,
    compiles: HashMap<u64, PendingCompile>,
    encoders: HashMap<u64, Vec<RecordedPass>>,
    command_buffers: HashMap<u64, Vec<RecordedPass>>,

    surface_view: Option<u64>,
    outdated_acquires: u32,
    /// Loss raised from inside the next `submit`.
    lose_on_submit: Option<String>,
    last_commands: Vec<RenderCommand>,
    counters: HeadlessCounters,
}

impl HeadlessState {
    fn check_alive(&self) -> Result<()> {
        match &self.lost {
            Some(reason) => Err(RenderError::context_lost(reason.clone())),
            None => Ok(()),
        }
    }

    fn invalid(&mut self, kind: &'static str, id: u64) -> RenderError {
        self.counters.invalid_handle_uses += 1;
        log::warn!("HeadlessDevice: use of invalid {kind} handle #{id}");
        RenderError::InvalidHandle { kind, id }
    }

    fn require(&mut self, present: bool, kind: &'static str, id: u64) -> Result<()> {
        if present {
            Ok(())
        } else {
            Err(self.invalid(kind, id))
        }
    }

    fn lose(&mut self, reason: &str) {
        if self.lost.is_some() {
            return;
        }
        log::error!("HeadlessDevice: simulated device loss: {reason}");
        self.lost = Some(reason.to_owned());
        if let Some(tx) = self.loss_tx.take() {
            // Receiver gone means nobody listens any more.
            let _ = tx.send(DeviceLostEvent {
                reason: reason.to_owned(),
            });
        }
    }

    fn validate_command(&mut self, command: &RenderCommand) -> Result<()> {
        let alignment = self.settings.limits.min_uniform_buffer_offset_alignment;
        match command {
            RenderCommand::SetPipeline(id) => {
                let ok = self.pipelines.contains(&id.0);
                self.require(ok, PipelineId::KIND, id.0)
            }
            RenderCommand::SetBindGroup {
                group,
                dynamic_offset,
                ..
            } => {
                let ok = self.bind_groups.contains(&group.0);
                self.require(ok, BindGroupId::KIND, group.0)?;
                if let Some(offset) = dynamic_offset {
                    if offset % alignment != 0 {
                        self.counters.misaligned_offsets += 1;
                        return Err(RenderError::custom(format!(
                            "dynamic offset {offset} is not a multiple of {alignment}"
                        )));
                    }
                }
                Ok(())
            }
            RenderCommand::SetVertexBuffer { buffer, .. }
            | RenderCommand::SetIndexBuffer { buffer, .. } => {
                let ok = self.buffers.contains_key(&buffer.0);
                self.require(ok, BufferId::KIND, buffer.0)
            }
            RenderCommand::Draw { .. } | RenderCommand::DrawIndexed { .. } => Ok(()),
        }
    }
}

// -----------------------------------------------------------------------------
// Probe
// -----------------------------------------------------------------------------

/// Shared view into a [`HeadlessDevice`]'s state.
#[derive(Clone, Debug)]
pub struct HeadlessProbe {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessProbe {
    pub fn counters(&self) -> HeadlessCounters {
        self.state.lock().counters
    }

    pub fn buffers_created(&self) -> u64 {
        self.counters().buffers_created
    }

    pub fn invalid_handle_uses(&self) -> u64 {
        self.counters().invalid_handle_uses
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_textures(&self) -> usize {
        self.state.lock().textures.len()
    }

    pub fn live_pipelines(&self) -> usize {
        self.state.lock().pipelines.len()
    }

    pub fn live_shader_modules(&self) -> usize {
        self.state.lock().shaders.len()
    }

    pub fn live_bind_groups(&self) -> usize {
        self.state.lock().bind_groups.len()
    }

    /// Non-blocking compiles that were started and not yet resolved.
    pub fn pending_compiles(&self) -> usize {
        self.state.lock().compiles.len()
    }

    pub fn is_lost(&self) -> bool {
        self.state.lock().lost.is_some()
    }

    /// Copy of a buffer's contents, `None` once destroyed.
    pub fn buffer_contents(&self, buffer: BufferId) -> Option<Vec<u8>> {
        self.state
            .lock()
            .buffers
            .get(&buffer.0)
            .map(|record| record.data.clone())
    }

    /// Commands of the last render pass that was submitted.
    pub fn last_commands(&self) -> Vec<RenderCommand> {
        self.state.lock().last_commands.clone()
    }

    /// Signal device loss: future calls fail with `ContextLost` and the loss
    /// channel receives one event.
    pub fn lose(&self, reason: &str) {
        self.state.lock().lose(reason);
    }

    pub fn set_buffer_budget(&self, budget: Option<u64>) {
        self.state.lock().settings.buffer_budget = budget;
    }

    pub fn set_pipeline_latency(&self, polls: u32) {
        self.state.lock().settings.pipeline_latency = polls;
    }

    /// The next `count` surface acquisitions report an outdated swapchain.
    pub fn set_outdated_acquires(&self, count: u32) {
        self.state.lock().outdated_acquires = count;
    }

    /// Lose the device inside the next `submit`, after the frame was encoded.
    pub fn lose_on_next_submit(&self, reason: &str) {
        self.state.lock().lose_on_submit = Some(reason.to_owned());
    }
}

// -----------------------------------------------------------------------------
// Device
// -----------------------------------------------------------------------------

#[derive(Debug)]
pub struct HeadlessDevice {
    state: Arc<Mutex<HeadlessState>>,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::with_settings(HeadlessSettings::default())
    }

    pub fn with_settings(settings: HeadlessSettings) -> Self {
        let state = HeadlessState {
            settings,
            ..HeadlessState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn probe(&self) -> HeadlessProbe {
        HeadlessProbe {
            state: Arc::clone(&self.state),
        }
    }

    /// Wire the asynchronous loss notification.
    pub fn set_loss_sender(&mut self, loss: DeviceLossSender) {
        self.state.lock().loss_tx = Some(loss);
    }

    pub fn set_buffer_budget(&mut self, budget: Option<u64>) {
        self.state.lock().settings.buffer_budget = budget;
    }

    pub fn lose(&mut self, reason: &str) {
        self.state.lock().lose(reason);
    }
}

impl GpuDevice for HeadlessDevice {
    fn limits(&self) -> DeviceLimits {
        self.state.lock().settings.limits
    }

    // ---------------------------------------------------------------------
    // Buffers / textures / samplers
    // ---------------------------------------------------------------------

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferId> {
        let mut state = self.state.lock();
        state.check_alive()?;
        if let Some(budget) = state.settings.buffer_budget.as_mut() {
            if *budget == 0 {
                return Err(RenderError::allocation(
                    desc.label.clone(),
                    desc.size,
                    "out of device memory",
                ));
            }
            *budget -= 1;
        }
        let id = next_handle();
        state.buffers.insert(
            id,
            BufferRecord {
                data: vec![0; desc.size as usize],
            },
        );
        state.counters.buffers_created += 1;
        Ok(BufferId(id))
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        let mut state = self.state.lock();
        if state.lost.is_some() {
            return;
        }
        if state.buffers.remove(&buffer.0).is_some() {
            state.counters.buffers_destroyed += 1;
        } else {
            state.invalid(BufferId::KIND, buffer.0);
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId> {
        let mut state = self.state.lock();
        state.check_alive()?;
        let max = state.settings.limits.max_texture_dimension_2d;
        if desc.width == 0 || desc.height == 0 || desc.width > max || desc.height > max {
            return Err(RenderError::allocation(
                desc.label.clone(),
                desc.size_bytes(),
                format!("texture extent {}x{} outside 1..={max}", desc.width, desc.height),
            ));
        }
        let id = next_handle();
        state.textures.insert(id, desc.clone());
        state.counters.textures_created += 1;
        Ok(TextureId(id))
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        let mut state = self.state.lock();
        if state.lost.is_some() {
            return;
        }
        if state.textures.remove(&texture.0).is_none() {
            state.invalid(TextureId::KIND, texture.0);
        }
    }

    fn create_texture_view(
        &mut self,
        texture: TextureId,
        _desc: &TextureViewDesc,
    ) -> Result<TextureViewId> {
        let mut state = self.state.lock();
        state.check_alive()?;
        let ok = state.textures.contains_key(&texture.0);
        state.require(ok, TextureId::KIND, texture.0)?;
        let id = next_handle();
        state.views.insert(id, texture.0);
        Ok(TextureViewId(id))
    }

    fn destroy_texture_view(&mut self, view: TextureViewId) {
        let mut state = self.state.lock();
        if state.lost.is_none() && state.views.remove(&view.0).is_none() {
            state.invalid(TextureViewId::KIND, view.0);
        }
    }

    fn create_sampler(&mut self, _desc: &SamplerDesc) -> Result<SamplerId> {
        let mut state = self.state.lock();
        state.check_alive()?;
        let id = next_handle();
        state.samplers.insert(id);
        Ok(SamplerId(id))
    }

    fn destroy_sampler(&mut self, sampler: SamplerId) {
        let mut state = self.state.lock();
        if state.lost.is_none() && !state.samplers.remove(&sampler.0) {
            state.invalid(SamplerId::KIND, sampler.0);
        }
    }

    // ---------------------------------------------------------------------
    // Bind groups
    // ---------------------------------------------------------------------

    fn create_bind_group_layout(
        &mut self,
        _label: &str,
        entries: &[BindGroupLayoutEntry],
    ) -> Result<BindGroupLayoutId> {
        let mut state = self.state.lock();
        state.check_alive()?;
        let id = next_handle();
        state.layouts.insert(id, entries.to_vec());
        Ok(BindGroupLayoutId(id))
    }

    fn destroy_bind_group_layout(&mut self, layout: BindGroupLayoutId) {
        let mut state = self.state.lock();
        if state.lost.is_none() && state.layouts.remove(&layout.0).is_none() {
            state.invalid(BindGroupLayoutId::KIND, layout.0);
        }
    }

    fn create_bind_group(
        &mut self,
        label: &str,
        layout: BindGroupLayoutId,
        entries: &[BindGroupEntry],
    ) -> Result<BindGroupId> {
        let mut state = self.state.lock();
        state.check_alive()?;
        let layout_entries = match state.layouts.get(&layout.0) {
            Some(entries) => entries.clone(),
            None => return Err(state.invalid(BindGroupLayoutId::KIND, layout.0)),
        };
        if layout_entries.len() != entries.len() {
            return Err(RenderError::custom(format!(
                "bind group `{label}` has {} entries, layout expects {}",
                entries.len(),
                layout_entries.len()
            )));
        }
        let max_uniform = u64::from(state.settings.limits.max_uniform_buffer_binding_size);
        for entry in entries {
            match entry.resource {
                BindingResource::Buffer { buffer, offset, size } => {
                    let len = state.buffers.get(&buffer.0).map(|record| record.data.len() as u64);
                    state.require(len.is_some(), BufferId::KIND, buffer.0)?;
                    let bound = size.unwrap_or_else(|| len.unwrap_or(0).saturating_sub(offset));
                    let uniform = layout_entries.iter().any(|layout| {
                        layout.binding == entry.binding
                            && matches!(layout.kind, BindingKind::UniformBuffer { .. })
                    });
                    if uniform && bound > max_uniform {
                        return Err(RenderError::CapacityExceeded {
                            what: "uniform buffer binding size",
                            limit: max_uniform,
                        }
                        .context(format!("bind group `{label}` binds {bound} bytes")));
                    }
                }
                BindingResource::TextureView(view) => {
                    let ok = state.views.contains_key(&view.0);
                    state.require(ok, TextureViewId::KIND, view.0)?;
                }
                BindingResource::Sampler(sampler) => {
                    let ok = state.samplers.contains(&sampler.0);
                    state.require(ok, SamplerId::KIND, sampler.0)?;
                }
            }
        }
        let id = next_handle();
        state.bind_groups.insert(id);
        state.counters.bind_groups_created += 1;
        Ok(BindGroupId(id))
    }

    fn destroy_bind_group(&mut self, group: BindGroupId) {
        let mut state = self.state.lock();
        if state.lost.is_none() && !state.bind_groups.remove(&group.0) {
            state.invalid(BindGroupId::KIND, group.0);
        }
    }

    // ---------------------------------------------------------------------
    // Shaders / pipelines
    // ---------------------------------------------------------------------

    fn create_shader_module(&mut self, _label: &str, source: &str) -> Result<ShaderModuleId> {
        let mut state = self.state.lock();
        state.check_alive()?;
        let id = next_handle();
        state.shaders.insert(id, source.contains(COMPILE_ERROR_MARKER));
        state.counters.shader_modules_created += 1;
        Ok(ShaderModuleId(id))
    }

    fn destroy_shader_module(&mut self, module: ShaderModuleId) {
        let mut state = self.state.lock();
        if state.lost.is_none() && state.shaders.remove(&module.0).is_none() {
            state.invalid(ShaderModuleId::KIND, module.0);
        }
    }

    fn create_render_pipeline(&mut self, desc: &RenderPipelineDesc<'_>) -> Result<PipelineId> {
        let mut state = self.state.lock();
        state.check_alive()?;
        match validate_pipeline(&mut state, desc)? {
            Ok(()) => {
                let id = next_handle();
                state.pipelines.insert(id);
                state.counters.pipelines_created += 1;
                Ok(PipelineId(id))
            }
            Err(diagnostics) => Err(RenderError::PipelineCompileFailure {
                label: desc.label.to_owned(),
                diagnostics,
            }),
        }
    }

    fn begin_pipeline_compile(
        &mut self,
        desc: &RenderPipelineDesc<'_>,
    ) -> Result<PipelineTicket> {
        let mut state = self.state.lock();
        state.check_alive()?;
        let outcome = validate_pipeline(&mut state, desc)?;
        let ticket = next_handle();
        let polls_left = state.settings.pipeline_latency;
        state.compiles.insert(ticket, PendingCompile { polls_left, outcome });
        Ok(PipelineTicket(ticket))
    }

    fn poll_pipeline(&mut self, ticket: PipelineTicket) -> PipelinePoll {
        let mut state = self.state.lock();
        if let Some(reason) = &state.lost {
            return PipelinePoll::Failed(format!("device lost: {reason}"));
        }
        let Some(compile) = state.compiles.get_mut(&ticket.0) else {
            let err = state.invalid(PipelineTicket::KIND, ticket.0);
            return PipelinePoll::Failed(err.to_string());
        };
        if compile.polls_left > 0 {
            compile.polls_left -= 1;
            return PipelinePoll::Pending;
        }
        let outcome = state
            .compiles
            .remove(&ticket.0)
            .map(|compile| compile.outcome);
        match outcome {
            Some(Ok(())) => {
                let id = next_handle();
                state.pipelines.insert(id);
                state.counters.pipelines_created += 1;
                PipelinePoll::Ready(PipelineId(id))
            }
            Some(Err(diagnostics)) => PipelinePoll::Failed(diagnostics),
            None => PipelinePoll::Failed("compile ticket vanished".into()),
        }
    }

    fn cancel_pipeline_compile(&mut self, ticket: PipelineTicket) {
        let mut state = self.state.lock();
        if state.compiles.remove(&ticket.0).is_some() {
            state.counters.compiles_cancelled += 1;
        } else if state.lost.is_none() {
            state.invalid(PipelineTicket::KIND, ticket.0);
        }
    }

    fn destroy_render_pipeline(&mut self, pipeline: PipelineId) {
        let mut state = self.state.lock();
        if state.lost.is_none() && !state.pipelines.remove(&pipeline.0) {
            state.invalid(PipelineId::KIND, pipeline.0);
        }
    }

    // ---------------------------------------------------------------------
    // Queue
    // ---------------------------------------------------------------------

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.check_alive()?;
        if offset % 4 != 0 || data.len() % 4 != 0 {
            return Err(RenderError::custom(format!(
                "buffer write at {offset} of {} bytes is not 4-byte aligned",
                data.len()
            )));
        }
        let Some(record) = state.buffers.get_mut(&buffer.0) else {
            return Err(state.invalid(BufferId::KIND, buffer.0));
        };
        let start = offset as usize;
        let end = start + data.len();
        if end > record.data.len() {
            return Err(RenderError::custom(format!(
                "buffer write {start}..{end} overruns buffer #{} of {} bytes",
                buffer.0,
                record.data.len()
            )));
        }
        record.data[start..end].copy_from_slice(data);
        state.counters.buffer_writes += 1;
        Ok(())
    }

    fn write_texture(&mut self, write: &TextureWrite, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.check_alive()?;
        let Some(desc) = state.textures.get(&write.texture.0) else {
            return Err(state.invalid(TextureId::KIND, write.texture.0));
        };
        let bpp = crate::texture::bytes_per_texel(desc.format);
        let pitch_alignment = state.settings.limits.texture_row_pitch_alignment;
        if write.mip_level >= desc.mip_level_count || write.layer >= desc.depth_or_array_layers {
            return Err(RenderError::custom(format!(
                "texture write targets mip {} layer {} outside {}x{} chain",
                write.mip_level, write.layer, desc.mip_level_count, desc.depth_or_array_layers
            )));
        }
        if write.height > 1 && write.bytes_per_row % pitch_alignment != 0 {
            return Err(RenderError::custom(format!(
                "bytes_per_row {} is not a multiple of {pitch_alignment}",
                write.bytes_per_row
            )));
        }
        let row_bytes = write.width * bpp;
        if write.bytes_per_row < row_bytes {
            return Err(RenderError::custom(format!(
                "bytes_per_row {} smaller than a row of {row_bytes} bytes",
                write.bytes_per_row
            )));
        }
        let needed = write.bytes_per_row as usize * (write.height.max(1) as usize - 1)
            + row_bytes as usize;
        if data.len() < needed {
            return Err(RenderError::custom(format!(
                "texture write needs {needed} bytes, got {}",
                data.len()
            )));
        }
        state.counters.texture_writes += 1;
        state.counters.texture_bytes_written += data.len() as u64;
        Ok(())
    }

    fn submit(&mut self, command_buffers: &[CommandBufferId]) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(reason) = state.lose_on_submit.take() {
            state.lose(&reason);
        }
        state.check_alive()?;
        let mut draws = 0;
        for id in command_buffers {
            let Some(passes) = state.command_buffers.remove(&id.0) else {
                return Err(state.invalid(CommandBufferId::KIND, id.0));
            };
            for pass in passes {
                draws += pass.draws;
                state.last_commands = pass.commands;
            }
        }
        state.counters.submits += 1;
        state.counters.draws_submitted += draws;
        state.counters.last_submit_draws = draws;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Command recording
    // ---------------------------------------------------------------------

    fn create_command_encoder(&mut self, _label: &str) -> Result<CommandEncoderId> {
        let mut state = self.state.lock();
        state.check_alive()?;
        let id = next_handle();
        state.encoders.insert(id, Vec::new());
        Ok(CommandEncoderId(id))
    }

    fn encode_render_pass(
        &mut self,
        encoder: CommandEncoderId,
        pass: &RenderPassDesc<'_>,
        commands: &[RenderCommand],
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.check_alive()?;
        let ok = state.encoders.contains_key(&encoder.0);
        state.require(ok, CommandEncoderId::KIND, encoder.0)?;
        let color_ok = state.views.contains_key(&pass.color.view.0);
        state.require(color_ok, TextureViewId::KIND, pass.color.view.0)?;
        if let Some(resolve) = pass.color.resolve_target {
            let resolve_ok = state.views.contains_key(&resolve.0);
            state.require(resolve_ok, TextureViewId::KIND, resolve.0)?;
        }
        if let Some(depth) = &pass.depth {
            let depth_ok = state.views.contains_key(&depth.view.0);
            state.require(depth_ok, TextureViewId::KIND, depth.view.0)?;
        }
        for command in commands {
            state.validate_command(command)?;
        }
        let recorded = RecordedPass {
            commands: commands.to_vec(),
            draws: commands.iter().filter(|c| c.is_draw()).count() as u64,
        };
        if let Some(passes) = state.encoders.get_mut(&encoder.0) {
            passes.push(recorded);
        }
        Ok(())
    }

    fn finish_command_encoder(&mut self, encoder: CommandEncoderId) -> Result<CommandBufferId> {
        let mut state = self.state.lock();
        state.check_alive()?;
        let Some(passes) = state.encoders.remove(&encoder.0) else {
            return Err(state.invalid(CommandEncoderId::KIND, encoder.0));
        };
        let id = next_handle();
        state.command_buffers.insert(id, passes);
        Ok(CommandBufferId(id))
    }

    // ---------------------------------------------------------------------
    // Surface
    // ---------------------------------------------------------------------

    fn acquire_surface_target(&mut self) -> Result<SurfaceTarget> {
        let mut state = self.state.lock();
        state.check_alive()?;
        if state.outdated_acquires > 0 {
            state.outdated_acquires -= 1;
            return Err(RenderError::SurfaceUnavailable {
                reason: "swapchain outdated".into(),
            });
        }
        if let Some(previous) = state.surface_view.take() {
            state.views.remove(&previous);
        }
        let id = next_handle();
        state.views.insert(id, 0);
        state.surface_view = Some(id);
        let settings = state.settings;
        Ok(SurfaceTarget {
            view: TextureViewId(id),
            width: settings.surface_width,
            height: settings.surface_height,
            format: settings.surface_format,
        })
    }

    fn present(&mut self) {
        let mut state = self.state.lock();
        if state.lost.is_some() {
            return;
        }
        if let Some(view) = state.surface_view.take() {
            state.views.remove(&view);
            state.counters.presents += 1;
        }
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        let mut state = self.state.lock();
        state.settings.surface_width = width.max(1);
        state.settings.surface_height = height.max(1);
    }
}

/// Handle checks fail the call outright; shader problems are compile
/// diagnostics (the inner `Err`).
fn validate_pipeline(
    state: &mut HeadlessState,
    desc: &RenderPipelineDesc<'_>,
) -> Result<std::result::Result<(), String>> {
    let mut broken = false;
    for module in [desc.vertex.module, desc.fragment.module] {
        match state.shaders.get(&module.0) {
            Some(&failing) => broken |= failing,
            None => return Err(state.invalid(ShaderModuleId::KIND, module.0)),
        }
    }
    for layout in desc.bind_group_layouts {
        let ok = state.layouts.contains_key(&layout.0);
        state.require(ok, BindGroupLayoutId::KIND, layout.0)?;
    }
    if broken {
        return Ok(Err(format!(
            "error: shader for `{}` contains {COMPILE_ERROR_MARKER}",
            desc.label
        )));
    }
    let max_attributes = state.settings.limits.max_vertex_attributes as usize;
    let attributes: usize = desc.vertex_buffers.iter().map(|b| b.attributes.len()).sum();
    if attributes > max_attributes {
        return Ok(Err(format!(
            "error: {attributes} vertex attributes exceed the device limit of {max_attributes}"
        )));
    }
    Ok(Ok(()))
}

// -----------------------------------------------------------------------------
// Factory
// -----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct FactoryState {
    settings: HeadlessSettings,
    devices: Vec<HeadlessProbe>,
    failures_remaining: u32,
}

/// Produces [`HeadlessDevice`]s. Cloning shares the factory, so a test can
/// keep one clone while the renderer owns another.
#[derive(Clone, Debug, Default)]
pub struct HeadlessFactory {
    shared: Arc<Mutex<FactoryState>>,
}

impl HeadlessFactory {
    pub fn new(settings: HeadlessSettings) -> Self {
        Self {
            shared: Arc::new(Mutex::new(FactoryState {
                settings,
                ..FactoryState::default()
            })),
        }
    }

    /// Probe of the most recently created device.
    pub fn current(&self) -> Option<HeadlessProbe> {
        self.shared.lock().devices.last().cloned()
    }

    pub fn devices_created(&self) -> usize {
        self.shared.lock().devices.len()
    }

    /// The next `count` device requests fail.
    pub fn fail_next_requests(&self, count: u32) {
        self.shared.lock().failures_remaining = count;
    }
}

impl DeviceFactory for HeadlessFactory {
    fn request_device(&mut self, loss: DeviceLossSender) -> Result<Box<dyn GpuDevice>> {
        let mut shared = self.shared.lock();
        if shared.failures_remaining > 0 {
            shared.failures_remaining -= 1;
            return Err(RenderError::context_lost("no adapter available"));
        }
        let mut device = HeadlessDevice::with_settings(shared.settings);
        device.set_loss_sender(loss);
        shared.devices.push(device.probe());
        Ok(Box::new(device))
    }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
