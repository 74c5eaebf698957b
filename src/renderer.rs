// src/renderer.rs
//! Per-frame entry point.
//!
//! ```text
//! drain loss channel -> cull -> batch -> acquire surface -> per batch / mesh:
//!   material -> environment -> geometry -> attributes -> pipeline -> uniform slot
//!   -> bind (elided when unchanged) -> draw
//! -> flush uniforms -> encode pass -> submit -> present
//! ```
//!
//! A failing mesh is skipped and counted; only device loss aborts the frame.

use std::collections::HashSet;

use crate::batching::DrawCallBatcher;
use crate::bind_group_manager::BindGroupManager;
use crate::camera::RenderCamera;
use crate::config::RendererConfig;
use crate::context::{Context, OptionContext};
use crate::culling::FrustumCuller;
use crate::environment::{EnvironmentBinding, EnvironmentBindingManager, EnvironmentStats};
use crate::error::{ErrorKind, RenderError, Result};
use crate::geometry_cache::GeometryBufferCache;
use crate::gpu::resource_pool::{BufferPool, PoolStats};
use crate::gpu::{
    BindGroupId, BindGroupLayoutId, BufferId, ColorAttachment, DepthAttachment, DeviceFactory,
    GpuDevice, PipelineId, RenderCommand, RenderPassDesc, SurfaceTarget, TextureViewId,
};
use crate::materials::material_system::MaterialDescriptorRegistry;
use crate::materials::MaterialKind;
use crate::pipeline_cache::{PipelineCache, PipelineState, PipelineStatus};
use crate::recovery::{ContextLossRecovery, RecoveryState};
use crate::scene::{Mesh, MeshId, Scene};
use crate::stats::{FrameStats, MeshSkipReason, RenderStatsTracker};
use crate::texture::{AttachmentTarget, DEPTH_FORMAT};
use crate::uniforms::UniformBufferManager;

/// Why a whole frame produced no image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSkipReason {
    Disposed,
    SurfaceUnavailable,
    /// A device call failed for a reason other than loss.
    DeviceError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented { draws: u32 },
    Skipped(FrameSkipReason),
    /// The device is gone or still being recreated.
    ContextLost,
}

/// Handles bound in the current pass; used to drop redundant binds.
#[derive(Debug, Default)]
struct BoundState {
    pipeline: Option<PipelineId>,
    environment: Option<BindGroupId>,
    vertex: [Option<(BufferId, u64)>; 4],
    index: Option<BufferId>,
}

/// Per-frame values every mesh needs.
struct FrameTarget {
    color_format: wgpu::TextureFormat,
    depth_format: Option<wgpu::TextureFormat>,
    sample_count: u32,
    uniform_layout: BindGroupLayoutId,
    uniform_group: BindGroupId,
    environment: Option<EnvironmentBinding>,
}

enum MeshOutcome {
    Drawn { triangles: u64 },
    Skipped(MeshSkipReason, Option<RenderError>),
}

/// Everything that owns GPU objects. Grouped so the frame loop can borrow it
/// independently of the batcher and stats.
#[derive(Debug)]
struct GpuCaches {
    pool: BufferPool,
    pipelines: PipelineCache,
    geometry: GeometryBufferCache,
    uniforms: UniformBufferManager,
    bind_groups: BindGroupManager,
    environment: EnvironmentBindingManager,
    depth: AttachmentTarget,
    msaa: AttachmentTarget,
}

impl GpuCaches {
    /// Uniform buffer and default samplers for a fresh device.
    fn create_device_resources(&mut self, device: &mut dyn GpuDevice, config: &RendererConfig) -> Result<()> {
        self.uniforms = UniformBufferManager::new(
            config.max_draws_per_frame,
            config.uniform_slot_size,
            &device.limits(),
        )?;
        self.uniforms.create(device, &mut self.pool, &mut self.bind_groups)?;
        self.environment.create_default_samplers(device)
    }

    /// Release what the (possibly lost) device still tracks: pipelines,
    /// in-flight compiles and pooled buffers.
    fn release_device_objects(&mut self, device: &mut dyn GpuDevice) {
        self.pipelines.clear(device);
        self.pool.clear(device);
    }

    /// Forget every handle after device loss, in dependency order.
    fn clear_after_loss(&mut self) {
        self.geometry.clear();
        self.environment.clear();
        self.uniforms.forget();
        self.bind_groups.clear();
        self.depth.forget();
        self.msaa.forget();
    }

    fn dispose(&mut self, device: &mut dyn GpuDevice) {
        self.geometry.dispose(&mut self.pool, device);
        self.uniforms.dispose(device, &mut self.pool);
        self.environment.dispose(device);
        self.pipelines.clear(device);
        self.depth.release(device);
        self.msaa.release(device);
        self.pool.clear(device);
        self.bind_groups.dispose(device);
    }

    #[allow(clippy::too_many_arguments)]
    fn encode_mesh(
        &mut self,
        device: &mut dyn GpuDevice,
        materials: &MaterialDescriptorRegistry,
        async_compile: bool,
        frame_index: u64,
        mesh: &Mesh,
        camera: &dyn RenderCamera,
        target: &FrameTarget,
        draw_index: u32,
        bound: &mut BoundState,
        commands: &mut Vec<RenderCommand>,
    ) -> Result<MeshOutcome> {
        let Some(descriptor) = materials.resolve(&mesh.material) else {
            return Ok(MeshOutcome::Skipped(MeshSkipReason::UnknownMaterial, None));
        };
        let environment = match (descriptor.requires_environment(), target.environment) {
            (false, _) => None,
            (true, Some(binding)) => Some(binding),
            (true, None) => return Ok(MeshOutcome::Skipped(MeshSkipReason::MissingEnvironment, None)),
        };

        let set = match self.geometry.get_or_create(&mesh.geometry, frame_index, &mut self.pool, device) {
            Ok(set) => set,
            Err(err) => return skip_or_abort(err),
        };
        let missing = descriptor.missing_attributes(set.attributes);
        if !missing.is_empty() {
            let err = RenderError::custom(format!("geometry lacks {missing:?}"));
            return Ok(MeshOutcome::Skipped(MeshSkipReason::MissingAttributes, Some(err)));
        }

        let mut layouts = [target.uniform_layout; 2];
        let layout_count = match environment {
            Some(binding) => {
                layouts[1] = binding.layout;
                2
            }
            None => 1,
        };
        let state = PipelineState {
            program: &descriptor.program,
            vertex_buffers: &set.layouts,
            bind_group_layouts: &layouts[..layout_count],
            topology: set.kind.topology(),
            render_state: &mesh.material.render_state,
            color_format: target.color_format,
            depth_format: target.depth_format,
            sample_count: target.sample_count,
        };
        let pipeline = if async_compile {
            match self.pipelines.request(device, &state) {
                Ok(PipelineStatus::Ready(pipeline)) => pipeline,
                Ok(PipelineStatus::Pending) => {
                    return Ok(MeshOutcome::Skipped(MeshSkipReason::PipelinePending, None))
                }
                Ok(PipelineStatus::Failed(diagnostics)) => {
                    let err = RenderError::PipelineCompileFailure {
                        label: descriptor.program.label().to_owned(),
                        diagnostics: diagnostics.to_string(),
                    };
                    return Ok(MeshOutcome::Skipped(MeshSkipReason::PipelineFailed, Some(err)));
                }
                Err(err) => return skip_or_abort(err),
            }
        } else {
            match self.pipelines.get_or_create(device, &state) {
                Ok(pipeline) => pipeline,
                Err(err) => return skip_or_abort(err),
            }
        };

        let mut uniforms = mesh.material.uniforms();
        if let (MaterialKind::Standard, Some(binding)) = (mesh.material.kind(), environment) {
            uniforms.rows[3][3] = binding.mip_level_count as f32;
        }
        if !self.uniforms.update_uniforms(mesh, camera, draw_index, uniforms) {
            return Ok(MeshOutcome::Skipped(MeshSkipReason::UniformBudget, None));
        }
        let Some(dynamic_offset) = self.uniforms.dynamic_offset(draw_index) else {
            return Ok(MeshOutcome::Skipped(MeshSkipReason::UniformBudget, None));
        };

        if bound.pipeline != Some(pipeline) {
            commands.push(RenderCommand::SetPipeline(pipeline));
            bound.pipeline = Some(pipeline);
        }
        commands.push(RenderCommand::SetBindGroup {
            index: 0,
            group: target.uniform_group,
            dynamic_offset: Some(dynamic_offset),
        });
        if let Some(binding) = environment {
            if bound.environment != Some(binding.bind_group) {
                commands.push(RenderCommand::SetBindGroup {
                    index: 1,
                    group: binding.bind_group,
                    dynamic_offset: None,
                });
                bound.environment = Some(binding.bind_group);
            }
        }
        for command in set.bind_commands() {
            match command {
                RenderCommand::SetVertexBuffer { slot, buffer, size, .. } => {
                    let bound_slot = bound.vertex.get_mut(slot as usize);
                    match bound_slot {
                        Some(current) if *current == Some((buffer, size)) => continue,
                        Some(current) => *current = Some((buffer, size)),
                        None => {}
                    }
                }
                RenderCommand::SetIndexBuffer { buffer, .. } => {
                    if bound.index == Some(buffer) {
                        continue;
                    }
                    bound.index = Some(buffer);
                }
                _ => {}
            }
            commands.push(command);
        }
        commands.push(set.draw_command());

        Ok(MeshOutcome::Drawn {
            triangles: mesh.geometry.primitive_count(),
        })
    }
}

/// Device loss aborts the frame; anything else skips the mesh.
fn skip_or_abort(err: RenderError) -> Result<MeshOutcome> {
    if err.is_context_lost() {
        return Err(err);
    }
    Ok(MeshOutcome::Skipped(MeshSkipReason::from_error(&err), Some(err)))
}

/// Cumulative counters captured at frame start; the frame's stats are the
/// difference at frame end.
struct CounterSnapshot {
    pool: PoolStats,
    texture_allocated: u64,
    texture_destroyed: u64,
    pipeline_hits: u64,
    pipeline_misses: u64,
    geometry_hits: u64,
    geometry_misses: u64,
}

pub struct RenderFrameOrchestrator {
    config: RendererConfig,
    factory: Box<dyn DeviceFactory>,
    device: Option<Box<dyn GpuDevice>>,
    materials: MaterialDescriptorRegistry,
    caches: GpuCaches,
    culler: FrustumCuller,
    batcher: DrawCallBatcher,
    recovery: ContextLossRecovery,
    stats: RenderStatsTracker,
    commands: Vec<RenderCommand>,
    /// (mesh, reason) pairs already reported; cleared on recovery.
    warned: HashSet<(MeshId, MeshSkipReason)>,
    surface_extent: Option<(u32, u32)>,
    visible_hint: usize,
    frame_index: u64,
    disposed: bool,
}

impl RenderFrameOrchestrator {
    /// Validate `config`, request the first device and allocate the
    /// per-frame uniform buffer.
    pub fn new(
        mut factory: Box<dyn DeviceFactory>,
        config: RendererConfig,
        materials: MaterialDescriptorRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let mut recovery = ContextLossRecovery::new();
        let mut device = factory.request_device(recovery.arm())?;
        let limits = device.limits();

        let mut caches = GpuCaches {
            pool: BufferPool::new(&config.buffer_pool),
            pipelines: PipelineCache::new(),
            geometry: GeometryBufferCache::new(),
            uniforms: UniformBufferManager::new(config.max_draws_per_frame, config.uniform_slot_size, &limits)?,
            bind_groups: BindGroupManager::new(),
            environment: EnvironmentBindingManager::new(),
            depth: AttachmentTarget::new("depth_target"),
            msaa: AttachmentTarget::new("msaa_color_target"),
        };
        caches.create_device_resources(device.as_mut(), &config)?;
        log::info!(
            "RenderFrameOrchestrator: {} draws/frame, {} byte slots, async compile {}",
            config.max_draws_per_frame,
            caches.uniforms.slot_stride(),
            config.async_pipeline_compilation
        );

        Ok(Self {
            culler: FrustumCuller::new(config.clip_depth),
            stats: RenderStatsTracker::new(config.allocation_warning_threshold),
            config,
            factory,
            device: Some(device),
            materials,
            caches,
            batcher: DrawCallBatcher::new(),
            recovery,
            commands: Vec::new(),
            warned: HashSet::new(),
            surface_extent: None,
            visible_hint: 0,
            frame_index: 0,
            disposed: false,
        })
    }

    /// Render one frame of `scene` seen from `camera`.
    pub fn render_frame(&mut self, scene: &Scene, camera: &dyn RenderCamera) -> FrameOutcome {
        if self.disposed {
            return FrameOutcome::Skipped(FrameSkipReason::Disposed);
        }
        self.stats.begin_frame(self.frame_index);

        let outcome = if self.ensure_device() {
            let before = self.snapshot();
            let outcome = match self.encode_and_submit(scene, camera) {
                Ok(outcome) => outcome,
                Err(err) if err.is_context_lost() => {
                    self.recovery.signal_loss(&err.to_string());
                    self.teardown_after_loss();
                    FrameOutcome::ContextLost
                }
                Err(err) => {
                    log::error!("frame {} aborted: {err} ({})", self.frame_index, err.remedy());
                    self.stats.record_frame_error(&err);
                    FrameOutcome::Skipped(FrameSkipReason::DeviceError)
                }
            };
            self.record_counters(&before);
            outcome
        } else {
            FrameOutcome::ContextLost
        };

        self.stats.end_frame();
        self.frame_index += 1;
        outcome
    }

    /// Forward a window resize to the surface.
    pub fn resize(&mut self, width: u32, height: u32) {
        let extent = (width.max(1), height.max(1));
        self.surface_extent = Some(extent);
        if let Some(device) = self.device.as_deref_mut() {
            device.resize_surface(extent.0, extent.1);
        }
    }

    /// Release every GPU object. Later frames are no-ops.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if let Some(mut device) = self.device.take() {
            self.caches.dispose(device.as_mut());
        } else {
            self.caches.clear_after_loss();
        }
        self.warned.clear();
        log::info!("RenderFrameOrchestrator: disposed after {} frames", self.frame_index);
    }

    // ── accessors ────────────────────────────────────────────────────────

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Counters of the most recently finished frame.
    pub fn last_frame_stats(&self) -> &FrameStats {
        self.stats.last_frame()
    }

    pub fn stats_tracker(&self) -> &RenderStatsTracker {
        &self.stats
    }

    pub fn recovery_state(&self) -> RecoveryState {
        self.recovery.state()
    }

    pub fn recovery(&self) -> &ContextLossRecovery {
        &self.recovery
    }

    pub fn pipeline_cache(&self) -> &PipelineCache {
        &self.caches.pipelines
    }

    pub fn geometry_cache(&self) -> &GeometryBufferCache {
        &self.caches.geometry
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.caches.pool.stats()
    }

    pub fn environment_binding(&self) -> Option<&EnvironmentBinding> {
        self.caches.environment.binding()
    }

    pub fn environment_stats(&self) -> EnvironmentStats {
        self.caches.environment.stats()
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    // ── device lifetime ──────────────────────────────────────────────────

    /// Drain loss events and, if needed, tear down and rebuild. Returns
    /// `true` when the frame may render.
    fn ensure_device(&mut self) -> bool {
        self.recovery.poll();
        if self.recovery.state() == RecoveryState::LossDetected {
            self.teardown_after_loss();
        }
        if self.recovery.state() == RecoveryState::Recovering {
            self.try_recover();
        }
        self.recovery.is_healthy() && self.device.is_some()
    }

    fn teardown_after_loss(&mut self) {
        if let Some(mut device) = self.device.take() {
            self.caches.release_device_objects(device.as_mut());
        }
        self.caches.clear_after_loss();
        self.warned.clear();
        self.recovery.begin_recovery();
        log::info!("RenderFrameOrchestrator: caches cleared after device loss");
    }

    fn try_recover(&mut self) {
        let loss = self.recovery.arm();
        let mut device = match self.factory.request_device(loss) {
            Ok(device) => device,
            Err(err) => {
                log::warn!("device re-creation failed: {err}; retrying next frame");
                return;
            }
        };
        match self.caches.create_device_resources(device.as_mut(), &self.config) {
            Ok(()) => {
                if let Some((width, height)) = self.surface_extent {
                    device.resize_surface(width, height);
                }
                self.device = Some(device);
                self.recovery.complete_recovery();
            }
            Err(err) => {
                log::warn!("rebuilding GPU state failed: {err}; retrying next frame");
                self.caches.release_device_objects(device.as_mut());
                self.caches.clear_after_loss();
            }
        }
    }

    // ── frame ────────────────────────────────────────────────────────────

    fn snapshot(&self) -> CounterSnapshot {
        let environment = self.caches.environment.stats();
        let pipelines = self.caches.pipelines.stats();
        let geometry = self.caches.geometry.stats();
        let (depth_allocated, depth_destroyed) = self.caches.depth.byte_counters();
        let (msaa_allocated, msaa_destroyed) = self.caches.msaa.byte_counters();
        CounterSnapshot {
            pool: self.caches.pool.stats(),
            texture_allocated: environment.bytes_allocated + depth_allocated + msaa_allocated,
            texture_destroyed: environment.bytes_destroyed + depth_destroyed + msaa_destroyed,
            pipeline_hits: pipelines.hits,
            pipeline_misses: pipelines.misses,
            geometry_hits: geometry.hits,
            geometry_misses: geometry.misses,
        }
    }

    /// Counters may be reset by a teardown inside the frame, hence saturating.
    fn record_counters(&mut self, before: &CounterSnapshot) {
        let after = self.snapshot();
        let frame = self.stats.current();
        frame.buffer_bytes_allocated = after.pool.allocated_bytes.saturating_sub(before.pool.allocated_bytes);
        frame.buffer_bytes_disposed = after.pool.destroyed_bytes.saturating_sub(before.pool.destroyed_bytes);
        frame.pool_hits = after.pool.hits.saturating_sub(before.pool.hits);
        frame.pool_misses = after.pool.misses.saturating_sub(before.pool.misses);
        frame.texture_bytes_allocated = after.texture_allocated.saturating_sub(before.texture_allocated);
        frame.texture_bytes_disposed = after.texture_destroyed.saturating_sub(before.texture_destroyed);
        frame.pipeline_hits = after.pipeline_hits.saturating_sub(before.pipeline_hits);
        frame.pipeline_misses = after.pipeline_misses.saturating_sub(before.pipeline_misses);
        frame.geometry_hits = after.geometry_hits.saturating_sub(before.geometry_hits);
        frame.geometry_misses = after.geometry_misses.saturating_sub(before.geometry_misses);
    }

    fn encode_and_submit(&mut self, scene: &Scene, camera: &dyn RenderCamera) -> Result<FrameOutcome> {
        let Self {
            config,
            device,
            materials,
            caches,
            culler,
            batcher,
            stats,
            commands,
            warned,
            surface_extent,
            visible_hint,
            frame_index,
            ..
        } = self;
        let device: &mut dyn GpuDevice = device
            .as_deref_mut()
            .ok_or_else(|| RenderError::context_lost("no device"))?;
        let frame_index = *frame_index;

        caches.pipelines.poll(device);
        // Left over when an earlier frame aborted before submit.
        caches.geometry.release_retired(&mut caches.pool, device);
        caches.uniforms.begin_frame();
        commands.clear();

        let mut visible: Vec<&Mesh> = Vec::with_capacity(*visible_hint);
        culler.cull_scene(scene, camera, &mut visible);
        *visible_hint = visible.len();
        let cull = culler.stats();

        batcher.clear();
        batcher.add_meshes(visible.iter().copied());
        {
            let frame = stats.current();
            frame.total_meshes = cull.total;
            frame.visible_meshes = cull.visible;
            frame.culled_meshes = cull.culled;
            frame.batches = batcher.batch_count();
        }

        let Some(surface) = acquire_surface(device, *surface_extent)? else {
            return Ok(FrameOutcome::Skipped(FrameSkipReason::SurfaceUnavailable));
        };
        *surface_extent = Some((surface.width, surface.height));

        let sample_count = config.sample_count.max(1);
        let depth_view = if config.depth_buffer {
            let view = caches
                .depth
                .ensure(device, surface.width, surface.height, sample_count, DEPTH_FORMAT)
                .context("depth attachment")?;
            Some(view)
        } else {
            None
        };
        let (color_view, resolve_target): (TextureViewId, Option<TextureViewId>) = if sample_count > 1 {
            let msaa = caches
                .msaa
                .ensure(device, surface.width, surface.height, sample_count, surface.format)
                .context("multisampled colour attachment")?;
            (msaa, Some(surface.view))
        } else {
            (surface.view, None)
        };

        caches
            .uniforms
            .create(device, &mut caches.pool, &mut caches.bind_groups)
            .context("per-draw uniform buffer")?;
        let uniform_layout = caches.uniforms.layout().context("uniform layout missing after creation")?;
        let uniform_group = caches.uniforms.bind_group().context("uniform bind group missing after creation")?;

        let environment = match caches.environment.prepare(
            device,
            &mut caches.bind_groups,
            scene.environment.as_deref(),
            scene.brdf_lut.as_deref(),
        ) {
            Ok(binding) => binding.copied(),
            Err(err) if err.is_context_lost() => return Err(err),
            Err(err) => {
                log::warn!("environment unavailable this frame: {err} ({})", err.remedy());
                None
            }
        };

        let target = FrameTarget {
            color_format: surface.format,
            depth_format: depth_view.map(|_| DEPTH_FORMAT),
            sample_count,
            uniform_layout,
            uniform_group,
            environment,
        };

        let mut bound = BoundState::default();
        let mut draw_index = 0u32;
        let mut triangles = 0u64;
        let mut budget_drops = 0u32;
        for batch in batcher.batches() {
            for &member in &batch.members {
                let mesh = visible[member as usize];
                let outcome = caches.encode_mesh(
                    device,
                    materials,
                    config.async_pipeline_compilation,
                    frame_index,
                    mesh,
                    camera,
                    &target,
                    draw_index,
                    &mut bound,
                    commands,
                )?;
                match outcome {
                    MeshOutcome::Drawn { triangles: count } => {
                        draw_index += 1;
                        triangles += count;
                    }
                    MeshOutcome::Skipped(reason, err) => {
                        stats.record_skip(reason);
                        if reason == MeshSkipReason::UniformBudget {
                            budget_drops += 1;
                        } else {
                            report_skip(warned, frame_index, mesh, reason, err.as_ref());
                        }
                    }
                }
            }
        }
        if budget_drops > 0 {
            log::warn!(
                "frame {frame_index}: dropped {budget_drops} draws past the {} draw budget ({})",
                config.max_draws_per_frame,
                RenderError::CapacityExceeded {
                    what: "uniform slot",
                    limit: u64::from(config.max_draws_per_frame),
                }
                .remedy()
            );
        }

        caches.uniforms.flush(device)?;
        let encoder = device.create_command_encoder("frame_encoder")?;
        device.encode_render_pass(
            encoder,
            &RenderPassDesc {
                label: "main_pass",
                color: ColorAttachment {
                    view: color_view,
                    resolve_target,
                    clear: Some(config.clear_color()),
                },
                depth: depth_view.map(|view| DepthAttachment {
                    view,
                    clear_depth: Some(1.0),
                }),
            },
            commands.as_slice(),
        )?;
        let command_buffer = device.finish_command_encoder(encoder)?;
        device
            .submit(&[command_buffer])
            .with_context(|| format!("submitting frame {frame_index}"))?;
        device.present();
        caches.geometry.release_retired(&mut caches.pool, device);

        let frame = stats.current();
        frame.draw_calls = draw_index;
        frame.triangles = triangles;
        Ok(FrameOutcome::Presented { draws: draw_index })
    }
}

impl Drop for RenderFrameOrchestrator {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for RenderFrameOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderFrameOrchestrator")
            .field("frame_index", &self.frame_index)
            .field("recovery", &self.recovery.state())
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}

/// Acquire the swapchain image, reconfiguring and retrying once when the
/// surface is outdated. `None` skips the frame.
fn acquire_surface(device: &mut dyn GpuDevice, extent: Option<(u32, u32)>) -> Result<Option<SurfaceTarget>> {
    match device.acquire_surface_target() {
        Ok(target) => Ok(Some(target)),
        Err(err) if err.kind() == ErrorKind::Surface => {
            log::warn!("failed to acquire swapchain image: {err}; reconfiguring surface");
            if let Some((width, height)) = extent {
                device.resize_surface(width, height);
            }
            match device.acquire_surface_target() {
                Ok(target) => Ok(Some(target)),
                Err(err) if err.kind() == ErrorKind::Surface => {
                    log::error!("failed to acquire swapchain image after reconfigure: {err}");
                    Ok(None)
                }
                Err(err) => Err(err),
            }
        }
        Err(err) => Err(err),
    }
}

fn report_skip(
    warned: &mut HashSet<(MeshId, MeshSkipReason)>,
    frame_index: u64,
    mesh: &Mesh,
    reason: MeshSkipReason,
    err: Option<&RenderError>,
) {
    if reason == MeshSkipReason::PipelinePending {
        log::debug!("frame {frame_index}: mesh `{}` waits for its pipeline", mesh.name);
        return;
    }
    if !warned.insert((mesh.id(), reason)) {
        return;
    }
    match err {
        Some(err) => log::warn!(
            "frame {frame_index}: skipping mesh `{}` ({}): {err}; {}",
            mesh.name,
            reason.as_str(),
            err.remedy()
        ),
        None => log::warn!(
            "frame {frame_index}: skipping mesh `{}` ({}) with material `{}`",
            mesh.name,
            reason.as_str(),
            mesh.material.name
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Camera;
    use crate::environment::EnvironmentMap;
    use crate::geometry::{cube, GeometryData, GeometryKind};
    use crate::gpu::headless::{HeadlessFactory, HeadlessProbe};
    use crate::materials::Material;
    use glam::{Mat4, Vec3};
    use std::sync::Arc;

    fn camera() -> Camera {
        Camera::looking_at(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, 1.0, 16.0 / 9.0, 0.1, 100.0)
    }

    fn orchestrator(config: RendererConfig) -> (RenderFrameOrchestrator, HeadlessFactory) {
        let factory = HeadlessFactory::default();
        let renderer = RenderFrameOrchestrator::new(
            Box::new(factory.clone()),
            config,
            MaterialDescriptorRegistry::with_builtin(),
        )
        .unwrap();
        (renderer, factory)
    }

    fn probe(factory: &HeadlessFactory) -> HeadlessProbe {
        factory.current().unwrap()
    }

    fn sync_config() -> RendererConfig {
        RendererConfig {
            async_pipeline_compilation: false,
            ..RendererConfig::default()
        }
    }

    fn row_of_cubes(count: usize, material: &Arc<Material>) -> Scene {
        let geometry = Arc::new(cube(0.5));
        let mut scene = Scene::new();
        for i in 0..count {
            let x = i as f32 - count as f32 / 2.0;
            scene.add_mesh(
                Mesh::new(geometry.clone(), material.clone(), Mat4::from_translation(Vec3::new(x, 0.0, 0.0)))
                    .with_name(format!("cube{i}")),
            );
        }
        scene
    }

    #[test]
    fn draws_every_visible_mesh() {
        let (mut renderer, factory) = orchestrator(sync_config());
        let scene = row_of_cubes(5, &Arc::new(Material::basic([1.0; 4])));
        assert_eq!(renderer.render_frame(&scene, &camera()), FrameOutcome::Presented { draws: 5 });

        let probe = probe(&factory);
        assert_eq!(probe.counters().last_submit_draws, 5);
        assert_eq!(probe.counters().presents, 1);
        let stats = renderer.last_frame_stats();
        assert_eq!(stats.draw_calls, 5);
        assert_eq!(stats.triangles, 60);
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.pipeline_misses, 1);
    }

    #[test]
    fn redundant_binds_are_elided() {
        let (mut renderer, factory) = orchestrator(sync_config());
        let scene = row_of_cubes(3, &Arc::new(Material::basic([1.0; 4])));
        renderer.render_frame(&scene, &camera());

        let commands = probe(&factory).last_commands();
        let count = |pred: fn(&RenderCommand) -> bool| commands.iter().filter(|c| pred(c)).count();
        assert_eq!(count(|c| matches!(c, RenderCommand::SetPipeline(_))), 1);
        assert_eq!(count(|c| matches!(c, RenderCommand::SetVertexBuffer { .. })), 2);
        assert_eq!(count(|c| matches!(c, RenderCommand::SetIndexBuffer { .. })), 1);
        assert_eq!(count(|c| matches!(c, RenderCommand::SetBindGroup { index: 0, .. })), 3);
        assert_eq!(count(RenderCommand::is_draw), 3);
    }

    #[test]
    fn standard_material_needs_an_environment() {
        let (mut renderer, _factory) = orchestrator(sync_config());
        let mut scene = row_of_cubes(2, &Arc::new(Material::standard([1.0; 4], 0.5, 0.5)));
        assert_eq!(renderer.render_frame(&scene, &camera()), FrameOutcome::Presented { draws: 0 });
        assert_eq!(renderer.last_frame_stats().skipped.missing_environment, 2);

        scene.set_environment(Some(Arc::new(EnvironmentMap::uniform(8, [1.0; 4]))));
        assert_eq!(renderer.render_frame(&scene, &camera()), FrameOutcome::Presented { draws: 2 });
        assert_eq!(renderer.environment_binding().unwrap().mip_level_count, 4);
        assert!(renderer.last_frame_stats().texture_bytes_allocated > 0);
    }

    #[test]
    fn missing_attributes_skip_only_that_mesh() {
        let (mut renderer, _factory) = orchestrator(sync_config());
        let mut scene = row_of_cubes(1, &Arc::new(Material::lambert([1.0; 4])));
        // Lambert needs normals; a bare triangle has none.
        let bare = GeometryData::new(GeometryKind::Mesh, vec![[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        scene.add_mesh(Mesh::new(Arc::new(bare), Arc::new(Material::lambert([1.0; 4])), Mat4::IDENTITY));
        assert_eq!(renderer.render_frame(&scene, &camera()), FrameOutcome::Presented { draws: 1 });
        assert_eq!(renderer.last_frame_stats().skipped.missing_attributes, 1);
    }

    #[test]
    fn outdated_surface_is_retried_once() {
        let (mut renderer, factory) = orchestrator(sync_config());
        let scene = row_of_cubes(1, &Arc::new(Material::basic([1.0; 4])));
        probe(&factory).set_outdated_acquires(1);
        assert_eq!(renderer.render_frame(&scene, &camera()), FrameOutcome::Presented { draws: 1 });

        probe(&factory).set_outdated_acquires(2);
        assert_eq!(
            renderer.render_frame(&scene, &camera()),
            FrameOutcome::Skipped(FrameSkipReason::SurfaceUnavailable)
        );
    }

    #[test]
    fn multisampling_resolves_into_the_surface() {
        let config = RendererConfig {
            sample_count: 4,
            ..sync_config()
        };
        let (mut renderer, factory) = orchestrator(config);
        let scene = row_of_cubes(2, &Arc::new(Material::basic([1.0; 4])));
        assert_eq!(renderer.render_frame(&scene, &camera()), FrameOutcome::Presented { draws: 2 });
        // Depth and MSAA colour attachments.
        assert_eq!(probe(&factory).live_textures(), 2);
    }

    #[test]
    fn dispose_releases_everything_and_stops_rendering() {
        let (mut renderer, factory) = orchestrator(sync_config());
        let scene = row_of_cubes(4, &Arc::new(Material::basic([1.0; 4])));
        renderer.render_frame(&scene, &camera());
        renderer.dispose();

        let probe = probe(&factory);
        assert_eq!(probe.live_buffers(), 0);
        assert_eq!(probe.live_textures(), 0);
        assert_eq!(probe.live_pipelines(), 0);
        assert_eq!(probe.live_shader_modules(), 0);
        assert_eq!(probe.live_bind_groups(), 0);
        assert_eq!(
            renderer.render_frame(&scene, &camera()),
            FrameOutcome::Skipped(FrameSkipReason::Disposed)
        );
        assert_eq!(probe.invalid_handle_uses(), 0);
    }

    #[test]
    fn cloned_geometry_keeps_its_own_buffers() {
        let (mut renderer, factory) = orchestrator(sync_config());
        let material = Arc::new(Material::basic([1.0; 4]));
        let original = cube(0.5);
        let mut moved = original.clone();
        moved.update_attributes(|attrs| attrs.positions.iter_mut().for_each(|p| p[0] += 3.0));
        let mut expected = [original.attributes().positions[0][0], moved.attributes().positions[0][0]];
        expected.sort_by(f32::total_cmp);

        let mut scene = Scene::new();
        scene.add_mesh(Mesh::new(Arc::new(original), material.clone(), Mat4::IDENTITY).with_name("original"));
        scene.add_mesh(Mesh::new(Arc::new(moved), material, Mat4::IDENTITY).with_name("moved"));
        for _ in 0..3 {
            assert_eq!(renderer.render_frame(&scene, &camera()), FrameOutcome::Presented { draws: 2 });
        }
        assert_eq!(renderer.last_frame_stats().geometry_misses, 0);
        assert_eq!(renderer.geometry_cache().len(), 2);

        let probe = probe(&factory);
        let positions: Vec<BufferId> = probe
            .last_commands()
            .iter()
            .filter_map(|command| match command {
                RenderCommand::SetVertexBuffer { slot: 0, buffer, .. } => Some(*buffer),
                _ => None,
            })
            .collect();
        assert_eq!(positions.len(), 2);
        let mut first_x: Vec<f32> = positions
            .iter()
            .map(|&buffer| {
                let bytes = probe.buffer_contents(buffer).unwrap();
                f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
            })
            .collect();
        first_x.sort_by(f32::total_cmp);
        assert_eq!(first_x, expected);
    }

    #[test]
    fn replaced_geometry_buffers_are_recycled_after_submit() {
        let (mut renderer, _factory) = orchestrator(sync_config());
        let material = Arc::new(Material::basic([1.0; 4]));
        let mut shared = Arc::new(cube(0.5));
        let mut scene = Scene::new();
        scene.add_mesh(Mesh::new(shared.clone(), material.clone(), Mat4::IDENTITY));
        renderer.render_frame(&scene, &camera());
        drop(scene);

        Arc::get_mut(&mut shared)
            .unwrap()
            .update_attributes(|attrs| attrs.positions[0] = [0.0; 3]);
        let mut edited = Scene::new();
        edited.add_mesh(Mesh::new(shared.clone(), material.clone(), Mat4::IDENTITY));
        edited.add_mesh(Mesh::new(shared, material, Mat4::from_translation(Vec3::X)));
        assert_eq!(renderer.render_frame(&edited, &camera()), FrameOutcome::Presented { draws: 2 });
        assert_eq!(renderer.geometry_cache().retired_len(), 0);
        assert_eq!(renderer.last_frame_stats().geometry_misses, 1);
    }

    #[test]
    fn frame_level_allocation_failures_raise_the_warning() {
        let config = RendererConfig {
            allocation_warning_threshold: 2,
            ..sync_config()
        };
        let (mut renderer, _factory) = orchestrator(config);
        let scene = row_of_cubes(2, &Arc::new(Material::basic([1.0; 4])));
        // The depth attachment exceeds the device's texture limit.
        renderer.resize(9000, 9000);
        for _ in 0..2 {
            assert_eq!(
                renderer.render_frame(&scene, &camera()),
                FrameOutcome::Skipped(FrameSkipReason::DeviceError)
            );
        }
        assert_eq!(renderer.last_frame_stats().frame_allocation_failures, 1);
        assert!(renderer.stats_tracker().allocation_warning());

        renderer.resize(800, 600);
        assert_eq!(renderer.render_frame(&scene, &camera()), FrameOutcome::Presented { draws: 2 });
        assert!(!renderer.stats_tracker().allocation_warning());
    }

    #[test]
    fn malformed_environment_is_validated_once() {
        let (mut renderer, _factory) = orchestrator(sync_config());
        let mut scene = row_of_cubes(1, &Arc::new(Material::standard([1.0; 4], 0.5, 0.5)));
        let bad = EnvironmentMap::new(8, 4, vec![std::array::from_fn(|_| vec![0.0; 8 * 4 * 4])]);
        scene.set_environment(Some(Arc::new(bad)));
        for _ in 0..3 {
            assert_eq!(renderer.render_frame(&scene, &camera()), FrameOutcome::Presented { draws: 0 });
            assert_eq!(renderer.last_frame_stats().skipped.missing_environment, 1);
        }
        assert_eq!(renderer.environment_stats().rejections, 1);
        assert_eq!(renderer.environment_stats().uploads, 0);
    }

    #[test]
    fn failed_device_recreation_is_retried() {
        let (mut renderer, factory) = orchestrator(sync_config());
        let scene = row_of_cubes(2, &Arc::new(Material::basic([1.0; 4])));
        renderer.render_frame(&scene, &camera());

        probe(&factory).lose("test reset");
        factory.fail_next_requests(1);
        assert_eq!(renderer.render_frame(&scene, &camera()), FrameOutcome::ContextLost);
        assert_eq!(renderer.recovery_state(), RecoveryState::Recovering);

        assert_eq!(renderer.render_frame(&scene, &camera()), FrameOutcome::Presented { draws: 2 });
        assert_eq!(renderer.recovery().loss_count(), 1);
        assert_eq!(factory.devices_created(), 2);
    }
}
