//! # wgpu Backend
//!
//! Production [`GpuDevice`] over `wgpu` 22.
//!
//! * Objects live in per-kind registries keyed by the crate's `u64` handles.
//! * Non-blocking pipeline compilation runs on a dedicated worker thread.
//!   The worker owns its own shader module cache and reports finished
//!   pipelines (or diagnostics) through a crossbeam channel that
//!   [`GpuDevice::poll_pipeline`] drains.
//! * The device-lost callback only flips a flag and sends one
//!   [`DeviceLostEvent`]; the orchestrator reacts at the next frame boundary.
//! * Buffer and texture creation run inside an out-of-memory error scope so
//!   allocation failures come back as [`RenderError::AllocationFailure`].
//!   Error scopes are a per-device stack, so every push/pop pair (render
//!   thread or worker) holds the shared `scopes` lock.
//! * Without a surface the device renders into an offscreen colour texture.

// -----------------------------------------------------------------------------
// Imports
// -----------------------------------------------------------------------------

use std::collections::{HashMap, HashSet};
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};

use crate::error::{RenderError, Result};
use crate::gpu::{
    BindGroupEntry, BindGroupId, BindGroupLayoutEntry, BindGroupLayoutId, BindingKind,
    BindingResource, BufferDesc, BufferId, ColorTargetDesc, CommandBufferId, CommandEncoderId,
    DepthStencilDesc, DeviceFactory, DeviceLimits, DeviceLossSender, DeviceLostEvent, GpuDevice,
    MultisampleDesc, PipelineId, PipelinePoll, PipelineTicket, PrimitiveDesc, RenderCommand,
    RenderPassDesc, RenderPipelineDesc, SamplerDesc, SamplerId, ShaderModuleId, SurfaceTarget,
    TextureDesc, TextureId, TextureViewDesc, TextureViewId, TextureWrite, VertexBufferLayoutDesc,
};

// -----------------------------------------------------------------------------
// Owned pipeline description (crosses to the compile worker)
// -----------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct ShaderSource {
    label: String,
    source: Arc<str>,
}

#[derive(Clone, Debug)]
struct StageJob {
    module: u64,
    shader: ShaderSource,
    entry_point: String,
}

#[derive(Debug)]
struct PipelineJob {
    label: String,
    vertex: StageJob,
    fragment: StageJob,
    layouts: Vec<Arc<wgpu::BindGroupLayout>>,
    vertex_buffers: Vec<VertexBufferLayoutDesc>,
    primitive: PrimitiveDesc,
    depth_stencil: Option<DepthStencilDesc>,
    multisample: MultisampleDesc,
    color_target: ColorTargetDesc,
}

enum WorkerMessage {
    Compile { ticket: u64, job: PipelineJob },
    ForgetModule(u64),
}

type CompileResult = (u64, std::result::Result<wgpu::RenderPipeline, String>);

/// Serializes error-scope push/pop pairs across threads.
type ScopeLock = parking_lot::Mutex<()>;

fn compile_module(
    device: &wgpu::Device,
    scopes: &ScopeLock,
    cache: &mut HashMap<u64, wgpu::ShaderModule>,
    stage: &StageJob,
) -> std::result::Result<(), String> {
    if cache.contains_key(&stage.module) {
        return Ok(());
    }
    let _scope = scopes.lock();
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(&stage.shader.label),
        source: wgpu::ShaderSource::Wgsl(stage.shader.source.as_ref().into()),
    });
    if let Some(err) = pollster::block_on(device.pop_error_scope()) {
        return Err(format!("shader `{}`: {err}", stage.shader.label));
    }
    cache.insert(stage.module, module);
    Ok(())
}

/// Compile both stages (memoized in `modules`) and build the pipeline inside
/// a validation error scope.
fn build_pipeline(
    device: &wgpu::Device,
    scopes: &ScopeLock,
    modules: &mut HashMap<u64, wgpu::ShaderModule>,
    job: &PipelineJob,
) -> std::result::Result<wgpu::RenderPipeline, String> {
    compile_module(device, scopes, modules, &job.vertex)?;
    compile_module(device, scopes, modules, &job.fragment)?;
    let (Some(vs), Some(fs)) = (modules.get(&job.vertex.module), modules.get(&job.fragment.module))
    else {
        return Err("shader module missing after compilation".into());
    };

    let layout_refs: Vec<&wgpu::BindGroupLayout> = job.layouts.iter().map(|l| l.as_ref()).collect();
    let attributes: Vec<Vec<wgpu::VertexAttribute>> = job
        .vertex_buffers
        .iter()
        .map(|buffer| {
            buffer
                .attributes
                .iter()
                .map(|a| wgpu::VertexAttribute {
                    format: a.format,
                    offset: a.offset,
                    shader_location: a.shader_location,
                })
                .collect()
        })
        .collect();
    let buffers: Vec<wgpu::VertexBufferLayout<'_>> = job
        .vertex_buffers
        .iter()
        .zip(&attributes)
        .map(|(buffer, attributes)| wgpu::VertexBufferLayout {
            array_stride: buffer.array_stride,
            step_mode: buffer.step_mode,
            attributes,
        })
        .collect();

    let _scope = scopes.lock();
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(&job.label),
        bind_group_layouts: &layout_refs,
        push_constant_ranges: &[],
    });
    let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(&job.label),
        layout: Some(&layout),
        vertex: wgpu::VertexState {
            module: vs,
            entry_point: &job.vertex.entry_point,
            buffers: &buffers,
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: fs,
            entry_point: &job.fragment.entry_point,
            targets: &[Some(wgpu::ColorTargetState {
                format: job.color_target.format,
                blend: job.color_target.blend,
                write_mask: job.color_target.write_mask,
            })],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: job.primitive.topology,
            strip_index_format: job.primitive.strip_index_format,
            front_face: job.primitive.front_face,
            cull_mode: job.primitive.cull_mode,
            unclipped_depth: false,
            polygon_mode: wgpu::PolygonMode::Fill,
            conservative: false,
        },
        depth_stencil: job.depth_stencil.map(depth_stencil_state),
        multisample: wgpu::MultisampleState {
            count: job.multisample.count,
            mask: !0,
            alpha_to_coverage_enabled: job.multisample.alpha_to_coverage_enabled,
        },
        multiview: None,
        cache: None,
    });
    match pollster::block_on(device.pop_error_scope()) {
        Some(err) => Err(err.to_string()),
        None => Ok(pipeline),
    }
}

fn depth_stencil_state(desc: DepthStencilDesc) -> wgpu::DepthStencilState {
    let stencil = match desc.stencil {
        Some(s) => {
            let face = wgpu::StencilFaceState {
                compare: s.compare,
                fail_op: s.fail_op,
                depth_fail_op: s.depth_fail_op,
                pass_op: s.pass_op,
            };
            wgpu::StencilState {
                front: face,
                back: face,
                read_mask: s.read_mask,
                write_mask: s.write_mask,
            }
        }
        None => wgpu::StencilState::default(),
    };
    wgpu::DepthStencilState {
        format: desc.format,
        depth_write_enabled: desc.depth_write_enabled,
        depth_compare: desc.depth_compare,
        stencil,
        bias: wgpu::DepthBiasState {
            constant: desc.bias_constant,
            slope_scale: desc.bias_slope_scale,
            clamp: 0.0,
        },
    }
}

// -----------------------------------------------------------------------------
// Compile worker
// -----------------------------------------------------------------------------

/// Owns the worker thread and the bookkeeping of its tickets.
struct PipelineCompiler {
    jobs: Option<Sender<WorkerMessage>>,
    results: Receiver<CompileResult>,
    worker: Option<JoinHandle<()>>,
    in_flight: HashSet<u64>,
    /// Tickets abandoned while in flight; their results are dropped on arrival.
    cancelled: HashSet<u64>,
    finished: HashMap<u64, std::result::Result<wgpu::RenderPipeline, String>>,
}

impl PipelineCompiler {
    fn spawn(device: Arc<wgpu::Device>, scopes: Arc<ScopeLock>) -> Result<Self> {
        let (job_tx, job_rx) = channel::unbounded::<WorkerMessage>();
        let (result_tx, result_rx) = channel::unbounded::<CompileResult>();
        let worker = std::thread::Builder::new()
            .name("pipeline-compiler".into())
            .spawn(move || {
                let mut modules = HashMap::new();
                for message in job_rx.iter() {
                    match message {
                        WorkerMessage::Compile { ticket, job } => {
                            let result = build_pipeline(&device, &scopes, &mut modules, &job);
                            if result_tx.send((ticket, result)).is_err() {
                                break;
                            }
                        }
                        WorkerMessage::ForgetModule(id) => {
                            modules.remove(&id);
                        }
                    }
                }
                log::debug!("pipeline-compiler: worker exiting");
            })
            .map_err(|e| RenderError::custom(format!("failed to spawn pipeline compiler: {e}")))?;

        Ok(Self {
            jobs: Some(job_tx),
            results: result_rx,
            worker: Some(worker),
            in_flight: HashSet::new(),
            cancelled: HashSet::new(),
            finished: HashMap::new(),
        })
    }

    fn send(&self, message: WorkerMessage) -> bool {
        self.jobs
            .as_ref()
            .is_some_and(|jobs| jobs.send(message).is_ok())
    }

    fn drain(&mut self) {
        for (ticket, result) in self.results.try_iter() {
            self.in_flight.remove(&ticket);
            if self.cancelled.remove(&ticket) {
                log::debug!("pipeline-compiler: dropping result of cancelled ticket #{ticket}");
                continue;
            }
            self.finished.insert(ticket, result);
        }
    }

    fn cancel(&mut self, ticket: u64) {
        if self.finished.remove(&ticket).is_some() {
            return;
        }
        if self.in_flight.contains(&ticket) {
            self.cancelled.insert(ticket);
        }
    }
}

impl Drop for PipelineCompiler {
    fn drop(&mut self) {
        // Closing the job channel ends the worker loop.
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("pipeline-compiler: worker panicked");
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Render targets
// -----------------------------------------------------------------------------

struct SurfaceState {
    surface: Arc<wgpu::Surface<'static>>,
    config: wgpu::SurfaceConfiguration,
    frame: Option<wgpu::SurfaceTexture>,
}

struct OffscreenTarget {
    texture: wgpu::Texture,
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
}

fn create_offscreen(device: &wgpu::Device, width: u32, height: u32) -> OffscreenTarget {
    let format = wgpu::TextureFormat::Rgba8UnormSrgb;
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("offscreen_color"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    });
    OffscreenTarget {
        texture,
        width,
        height,
        format,
    }
}

struct ViewEntry {
    view: wgpu::TextureView,
    format: wgpu::TextureFormat,
}

// -----------------------------------------------------------------------------
// Device
// -----------------------------------------------------------------------------

pub struct WgpuDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    limits: DeviceLimits,
    max_buffer_size: u64,
    lost: Arc<AtomicBool>,
    lost_reason: Arc<parking_lot::Mutex<Option<String>>>,
    scopes: Arc<ScopeLock>,

    surface: Option<SurfaceState>,
    offscreen: Option<OffscreenTarget>,
    surface_view: Option<u64>,

    buffers: HashMap<u64, wgpu::Buffer>,
    textures: HashMap<u64, wgpu::Texture>,
    views: HashMap<u64, ViewEntry>,
    samplers: HashMap<u64, wgpu::Sampler>,
    layouts: HashMap<u64, Arc<wgpu::BindGroupLayout>>,
    bind_groups: HashMap<u64, wgpu::BindGroup>,
    shaders: HashMap<u64, ShaderSource>,
    modules: HashMap<u64, wgpu::ShaderModule>,
    pipelines: HashMap<u64, wgpu::RenderPipeline>,
    encoders: HashMap<u64, wgpu::CommandEncoder>,
    command_buffers: HashMap<u64, wgpu::CommandBuffer>,

    compiler: PipelineCompiler,
    next_id: u64,
}

impl WgpuDevice {
    fn new(
        device: wgpu::Device,
        queue: wgpu::Queue,
        surface: Option<SurfaceState>,
        offscreen_size: (u32, u32),
        loss: DeviceLossSender,
    ) -> Result<Self> {
        let device = Arc::new(device);
        let lost = Arc::new(AtomicBool::new(false));
        let lost_reason = Arc::new(parking_lot::Mutex::new(None));

        {
            let lost = Arc::clone(&lost);
            let lost_reason = Arc::clone(&lost_reason);
            device.set_device_lost_callback(move |reason, message| {
                let reason = format!("{reason:?}: {message}");
                log::error!("wgpu: device lost ({reason})");
                lost.store(true, Ordering::Release);
                *lost_reason.lock() = Some(reason.clone());
                let _ = loss.send(DeviceLostEvent { reason });
            });
        }
        device.on_uncaptured_error(Box::new(|err| {
            log::error!("wgpu: uncaptured error: {err}");
        }));

        let raw = device.limits();
        let limits = DeviceLimits {
            min_uniform_buffer_offset_alignment: raw.min_uniform_buffer_offset_alignment,
            texture_row_pitch_alignment: wgpu::COPY_BYTES_PER_ROW_ALIGNMENT,
            max_uniform_buffer_binding_size: raw.max_uniform_buffer_binding_size,
            max_vertex_buffers: raw.max_vertex_buffers,
            max_vertex_attributes: raw.max_vertex_attributes,
            max_texture_dimension_2d: raw.max_texture_dimension_2d,
        };
        let offscreen = match surface {
            Some(_) => None,
            None => Some(create_offscreen(&device, offscreen_size.0, offscreen_size.1)),
        };
        let scopes = Arc::new(ScopeLock::new(()));
        let compiler = PipelineCompiler::spawn(Arc::clone(&device), Arc::clone(&scopes))?;

        Ok(Self {
            max_buffer_size: raw.max_buffer_size,
            device,
            queue: Arc::new(queue),
            limits,
            lost,
            lost_reason,
            scopes,
            surface,
            offscreen,
            surface_view: None,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            views: HashMap::new(),
            samplers: HashMap::new(),
            layouts: HashMap::new(),
            bind_groups: HashMap::new(),
            shaders: HashMap::new(),
            modules: HashMap::new(),
            pipelines: HashMap::new(),
            encoders: HashMap::new(),
            command_buffers: HashMap::new(),
            compiler,
            next_id: 1,
        })
    }

    /// Raw device, for hosts that record their own passes.
    pub fn raw_device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub fn raw_queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }

    #[inline]
    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_alive(&self) -> Result<()> {
        if self.lost.load(Ordering::Acquire) {
            let reason = self
                .lost_reason
                .lock()
                .clone()
                .unwrap_or_else(|| "device lost".into());
            return Err(RenderError::context_lost(reason));
        }
        Ok(())
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Run `create` inside an out-of-memory error scope. A captured error
    /// drops the (invalid) object and reports an allocation failure.
    fn allocate<T>(&self, label: &str, size: u64, create: impl FnOnce(&wgpu::Device) -> T) -> Result<T> {
        let _scope = self.scopes.lock();
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let object = create(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(RenderError::allocation(label, size, err.to_string())),
            None => Ok(object),
        }
    }

    fn pipeline_job(&self, desc: &RenderPipelineDesc<'_>) -> Result<PipelineJob> {
        let stage = |module: ShaderModuleId, entry_point: &str| -> Result<StageJob> {
            let shader = self.shaders.get(&module.0).cloned().ok_or(RenderError::InvalidHandle {
                kind: ShaderModuleId::KIND,
                id: module.0,
            })?;
            Ok(StageJob {
                module: module.0,
                shader,
                entry_point: entry_point.to_owned(),
            })
        };
        let layouts = desc
            .bind_group_layouts
            .iter()
            .map(|layout| {
                self.layouts
                    .get(&layout.0)
                    .cloned()
                    .ok_or(RenderError::InvalidHandle {
                        kind: BindGroupLayoutId::KIND,
                        id: layout.0,
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(PipelineJob {
            label: desc.label.to_owned(),
            vertex: stage(desc.vertex.module, desc.vertex.entry_point)?,
            fragment: stage(desc.fragment.module, desc.fragment.entry_point)?,
            layouts,
            vertex_buffers: desc.vertex_buffers.to_vec(),
            primitive: desc.primitive,
            depth_stencil: desc.depth_stencil,
            multisample: desc.multisample,
            color_target: desc.color_target,
        })
    }

    fn check_command(&self, command: &RenderCommand) -> Result<()> {
        let (present, kind, id) = match command {
            RenderCommand::SetPipeline(p) => (self.pipelines.contains_key(&p.0), PipelineId::KIND, p.0),
            RenderCommand::SetBindGroup { group, .. } => {
                (self.bind_groups.contains_key(&group.0), BindGroupId::KIND, group.0)
            }
            RenderCommand::SetVertexBuffer { buffer, .. }
            | RenderCommand::SetIndexBuffer { buffer, .. } => {
                (self.buffers.contains_key(&buffer.0), BufferId::KIND, buffer.0)
            }
            RenderCommand::Draw { .. } | RenderCommand::DrawIndexed { .. } => return Ok(()),
        };
        if present {
            Ok(())
        } else {
            Err(RenderError::InvalidHandle { kind, id })
        }
    }
}

fn invalid(kind: &'static str, id: u64) -> RenderError {
    RenderError::InvalidHandle { kind, id }
}

impl GpuDevice for WgpuDevice {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    // ---------------------------------------------------------------------
    // Buffers / textures / samplers
    // ---------------------------------------------------------------------

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferId> {
        self.check_alive()?;
        if desc.size > self.max_buffer_size {
            return Err(RenderError::allocation(
                desc.label.clone(),
                desc.size,
                format!("exceeds device max_buffer_size {}", self.max_buffer_size),
            ));
        }
        let buffer = self.allocate(&desc.label, desc.size, |device| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&desc.label),
                size: desc.size,
                usage: desc.usage,
                mapped_at_creation: false,
            })
        })?;
        let id = self.alloc_id();
        self.buffers.insert(id, buffer);
        Ok(BufferId(id))
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        if let Some(buffer) = self.buffers.remove(&buffer.0) {
            if !self.is_lost() {
                buffer.destroy();
            }
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId> {
        self.check_alive()?;
        let max = self.limits.max_texture_dimension_2d;
        if desc.width == 0 || desc.height == 0 || desc.width > max || desc.height > max {
            return Err(RenderError::allocation(
                desc.label.clone(),
                desc.size_bytes(),
                format!("texture extent {}x{} outside 1..={max}", desc.width, desc.height),
            ));
        }
        let texture = self.allocate(&desc.label, desc.size_bytes(), |device| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(&desc.label),
                size: wgpu::Extent3d {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers: desc.depth_or_array_layers,
                },
                mip_level_count: desc.mip_level_count,
                sample_count: desc.sample_count,
                dimension: wgpu::TextureDimension::D2,
                format: desc.format,
                usage: desc.usage,
                view_formats: &[],
            })
        })?;
        let id = self.alloc_id();
        self.textures.insert(id, texture);
        Ok(TextureId(id))
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if let Some(texture) = self.textures.remove(&texture.0) {
            if !self.is_lost() {
                texture.destroy();
            }
        }
    }

    fn create_texture_view(
        &mut self,
        texture: TextureId,
        desc: &TextureViewDesc,
    ) -> Result<TextureViewId> {
        self.check_alive()?;
        let raw = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| invalid(TextureId::KIND, texture.0))?;
        let view = raw.create_view(&wgpu::TextureViewDescriptor {
            label: Some(&desc.label),
            format: None,
            dimension: Some(desc.dimension),
            aspect: wgpu::TextureAspect::All,
            base_mip_level: desc.base_mip_level,
            mip_level_count: desc.mip_level_count,
            base_array_layer: desc.base_array_layer,
            array_layer_count: desc.array_layer_count,
        });
        let format = raw.format();
        let id = self.alloc_id();
        self.views.insert(id, ViewEntry { view, format });
        Ok(TextureViewId(id))
    }

    fn destroy_texture_view(&mut self, view: TextureViewId) {
        self.views.remove(&view.0);
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId> {
        self.check_alive()?;
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some(&desc.label),
            address_mode_u: desc.address_mode,
            address_mode_v: desc.address_mode,
            address_mode_w: desc.address_mode,
            mag_filter: desc.mag_filter,
            min_filter: desc.min_filter,
            mipmap_filter: desc.mipmap_filter,
            lod_min_clamp: desc.lod_min_clamp,
            lod_max_clamp: desc.lod_max_clamp,
            ..Default::default()
        });
        let id = self.alloc_id();
        self.samplers.insert(id, sampler);
        Ok(SamplerId(id))
    }

    fn destroy_sampler(&mut self, sampler: SamplerId) {
        self.samplers.remove(&sampler.0);
    }

    // ---------------------------------------------------------------------
    // Bind groups
    // ---------------------------------------------------------------------

    fn create_bind_group_layout(
        &mut self,
        label: &str,
        entries: &[BindGroupLayoutEntry],
    ) -> Result<BindGroupLayoutId> {
        self.check_alive()?;
        let raw_entries: Vec<wgpu::BindGroupLayoutEntry> = entries
            .iter()
            .map(|entry| wgpu::BindGroupLayoutEntry {
                binding: entry.binding,
                visibility: entry.visibility,
                ty: match entry.kind {
                    BindingKind::UniformBuffer {
                        has_dynamic_offset,
                        min_binding_size,
                    } => wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset,
                        min_binding_size: NonZeroU64::new(min_binding_size),
                    },
                    BindingKind::Texture { view_dimension } => wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension,
                        multisampled: false,
                    },
                    BindingKind::Sampler => {
                        wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering)
                    }
                },
                count: None,
            })
            .collect();
        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries: &raw_entries,
            });
        let id = self.alloc_id();
        self.layouts.insert(id, Arc::new(layout));
        Ok(BindGroupLayoutId(id))
    }

    fn destroy_bind_group_layout(&mut self, layout: BindGroupLayoutId) {
        self.layouts.remove(&layout.0);
    }

    fn create_bind_group(
        &mut self,
        label: &str,
        layout: BindGroupLayoutId,
        entries: &[BindGroupEntry],
    ) -> Result<BindGroupId> {
        self.check_alive()?;
        let raw_layout = self
            .layouts
            .get(&layout.0)
            .ok_or_else(|| invalid(BindGroupLayoutId::KIND, layout.0))?;
        let mut raw_entries = Vec::with_capacity(entries.len());
        for entry in entries {
            let resource = match entry.resource {
                BindingResource::Buffer {
                    buffer,
                    offset,
                    size,
                } => wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: self
                        .buffers
                        .get(&buffer.0)
                        .ok_or_else(|| invalid(BufferId::KIND, buffer.0))?,
                    offset,
                    size: size.and_then(NonZeroU64::new),
                }),
                BindingResource::TextureView(view) => wgpu::BindingResource::TextureView(
                    &self
                        .views
                        .get(&view.0)
                        .ok_or_else(|| invalid(TextureViewId::KIND, view.0))?
                        .view,
                ),
                BindingResource::Sampler(sampler) => wgpu::BindingResource::Sampler(
                    self.samplers
                        .get(&sampler.0)
                        .ok_or_else(|| invalid(SamplerId::KIND, sampler.0))?,
                ),
            };
            raw_entries.push(wgpu::BindGroupEntry {
                binding: entry.binding,
                resource,
            });
        }
        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: raw_layout,
            entries: &raw_entries,
        });
        let id = self.alloc_id();
        self.bind_groups.insert(id, group);
        Ok(BindGroupId(id))
    }

    fn destroy_bind_group(&mut self, group: BindGroupId) {
        self.bind_groups.remove(&group.0);
    }

    // ---------------------------------------------------------------------
    // Shaders / pipelines
    // ---------------------------------------------------------------------

    /// WGSL is validated lazily, when a pipeline first uses the module, so
    /// the diagnostics surface as a pipeline compile failure.
    fn create_shader_module(&mut self, label: &str, source: &str) -> Result<ShaderModuleId> {
        self.check_alive()?;
        let id = self.alloc_id();
        self.shaders.insert(
            id,
            ShaderSource {
                label: label.to_owned(),
                source: Arc::from(source),
            },
        );
        Ok(ShaderModuleId(id))
    }

    fn destroy_shader_module(&mut self, module: ShaderModuleId) {
        self.shaders.remove(&module.0);
        self.modules.remove(&module.0);
        self.compiler.send(WorkerMessage::ForgetModule(module.0));
    }

    fn create_render_pipeline(&mut self, desc: &RenderPipelineDesc<'_>) -> Result<PipelineId> {
        self.check_alive()?;
        let job = self.pipeline_job(desc)?;
        let pipeline = build_pipeline(&self.device, &self.scopes, &mut self.modules, &job).map_err(|diagnostics| {
            RenderError::PipelineCompileFailure {
                label: job.label.clone(),
                diagnostics,
            }
        })?;
        let id = self.alloc_id();
        self.pipelines.insert(id, pipeline);
        Ok(PipelineId(id))
    }

    fn begin_pipeline_compile(
        &mut self,
        desc: &RenderPipelineDesc<'_>,
    ) -> Result<PipelineTicket> {
        self.check_alive()?;
        let job = self.pipeline_job(desc)?;
        let ticket = self.alloc_id();
        if !self.compiler.send(WorkerMessage::Compile { ticket, job }) {
            return Err(RenderError::custom("pipeline compiler worker is gone"));
        }
        self.compiler.in_flight.insert(ticket);
        Ok(PipelineTicket(ticket))
    }

    fn poll_pipeline(&mut self, ticket: PipelineTicket) -> PipelinePoll {
        if self.is_lost() {
            return PipelinePoll::Failed("device lost".into());
        }
        self.compiler.drain();
        match self.compiler.finished.remove(&ticket.0) {
            Some(Ok(pipeline)) => {
                let id = self.alloc_id();
                self.pipelines.insert(id, pipeline);
                PipelinePoll::Ready(PipelineId(id))
            }
            Some(Err(diagnostics)) => PipelinePoll::Failed(diagnostics),
            None if self.compiler.in_flight.contains(&ticket.0) => PipelinePoll::Pending,
            None => PipelinePoll::Failed(invalid(PipelineTicket::KIND, ticket.0).to_string()),
        }
    }

    fn cancel_pipeline_compile(&mut self, ticket: PipelineTicket) {
        self.compiler.drain();
        self.compiler.cancel(ticket.0);
    }

    fn destroy_render_pipeline(&mut self, pipeline: PipelineId) {
        self.pipelines.remove(&pipeline.0);
    }

    // ---------------------------------------------------------------------
    // Queue
    // ---------------------------------------------------------------------

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        self.check_alive()?;
        let raw = self
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| invalid(BufferId::KIND, buffer.0))?;
        self.queue.write_buffer(raw, offset, data);
        Ok(())
    }

    fn write_texture(&mut self, write: &TextureWrite, data: &[u8]) -> Result<()> {
        self.check_alive()?;
        let raw = self
            .textures
            .get(&write.texture.0)
            .ok_or_else(|| invalid(TextureId::KIND, write.texture.0))?;
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: raw,
                mip_level: write.mip_level,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: write.layer,
                },
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(write.bytes_per_row),
                rows_per_image: Some(write.rows_per_image),
            },
            wgpu::Extent3d {
                width: write.width,
                height: write.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn submit(&mut self, command_buffers: &[CommandBufferId]) -> Result<()> {
        self.check_alive()?;
        let mut raw = Vec::with_capacity(command_buffers.len());
        for id in command_buffers {
            raw.push(
                self.command_buffers
                    .remove(&id.0)
                    .ok_or_else(|| invalid(CommandBufferId::KIND, id.0))?,
            );
        }
        self.queue.submit(raw);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Command recording
    // ---------------------------------------------------------------------

    fn create_command_encoder(&mut self, label: &str) -> Result<CommandEncoderId> {
        self.check_alive()?;
        let encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        let id = self.alloc_id();
        self.encoders.insert(id, encoder);
        Ok(CommandEncoderId(id))
    }

    fn encode_render_pass(
        &mut self,
        encoder: CommandEncoderId,
        pass: &RenderPassDesc<'_>,
        commands: &[RenderCommand],
    ) -> Result<()> {
        self.check_alive()?;
        for command in commands {
            self.check_command(command)?;
        }
        let color = self
            .views
            .get(&pass.color.view.0)
            .ok_or_else(|| invalid(TextureViewId::KIND, pass.color.view.0))?;
        let resolve = match pass.color.resolve_target {
            Some(view) => Some(
                self.views
                    .get(&view.0)
                    .ok_or_else(|| invalid(TextureViewId::KIND, view.0))?,
            ),
            None => None,
        };
        let depth = match &pass.depth {
            Some(depth) => Some((
                self.views
                    .get(&depth.view.0)
                    .ok_or_else(|| invalid(TextureViewId::KIND, depth.view.0))?,
                depth.clear_depth,
            )),
            None => None,
        };
        let raw_encoder = self
            .encoders
            .get_mut(&encoder.0)
            .ok_or_else(|| invalid(CommandEncoderId::KIND, encoder.0))?;

        let mut render_pass = raw_encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(pass.label),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &color.view,
                resolve_target: resolve.map(|entry| &entry.view),
                ops: wgpu::Operations {
                    load: pass.color.clear.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: depth.map(|(entry, clear)| {
                wgpu::RenderPassDepthStencilAttachment {
                    view: &entry.view,
                    depth_ops: Some(wgpu::Operations {
                        load: clear.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: entry.format.has_stencil_aspect().then_some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(0),
                        store: wgpu::StoreOp::Store,
                    }),
                }
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        for command in commands {
            match command {
                RenderCommand::SetPipeline(id) => {
                    if let Some(pipeline) = self.pipelines.get(&id.0) {
                        render_pass.set_pipeline(pipeline);
                    }
                }
                RenderCommand::SetBindGroup {
                    index,
                    group,
                    dynamic_offset,
                } => {
                    if let Some(group) = self.bind_groups.get(&group.0) {
                        let offsets = dynamic_offset
                            .as_ref()
                            .map(std::slice::from_ref)
                            .unwrap_or(&[]);
                        render_pass.set_bind_group(*index, group, offsets);
                    }
                }
                RenderCommand::SetVertexBuffer {
                    slot,
                    buffer,
                    offset,
                    size,
                } => {
                    if let Some(buffer) = self.buffers.get(&buffer.0) {
                        render_pass.set_vertex_buffer(*slot, buffer.slice(*offset..*offset + *size));
                    }
                }
                RenderCommand::SetIndexBuffer {
                    buffer,
                    format,
                    offset,
                    size,
                } => {
                    if let Some(buffer) = self.buffers.get(&buffer.0) {
                        render_pass.set_index_buffer(buffer.slice(*offset..*offset + *size), *format);
                    }
                }
                RenderCommand::Draw {
                    vertices,
                    instances,
                } => render_pass.draw(vertices.clone(), instances.clone()),
                RenderCommand::DrawIndexed {
                    indices,
                    base_vertex,
                    instances,
                } => render_pass.draw_indexed(indices.clone(), *base_vertex, instances.clone()),
            }
        }
        Ok(())
    }

    fn finish_command_encoder(&mut self, encoder: CommandEncoderId) -> Result<CommandBufferId> {
        self.check_alive()?;
        let raw = self
            .encoders
            .remove(&encoder.0)
            .ok_or_else(|| invalid(CommandEncoderId::KIND, encoder.0))?;
        let id = self.alloc_id();
        self.command_buffers.insert(id, raw.finish());
        Ok(CommandBufferId(id))
    }

    // ---------------------------------------------------------------------
    // Surface
    // ---------------------------------------------------------------------

    fn acquire_surface_target(&mut self) -> Result<SurfaceTarget> {
        self.check_alive()?;
        if let Some(previous) = self.surface_view.take() {
            self.views.remove(&previous);
        }

        let (view, width, height, format) = if let Some(state) = self.surface.as_mut() {
            let frame = match state.surface.get_current_texture() {
                Ok(frame) => frame,
                Err(wgpu::SurfaceError::OutOfMemory) => {
                    return Err(RenderError::context_lost("surface out of memory"));
                }
                Err(err) => {
                    return Err(RenderError::SurfaceUnavailable {
                        reason: err.to_string(),
                    });
                }
            };
            let view = frame
                .texture
                .create_view(&wgpu::TextureViewDescriptor::default());
            let format = state.config.format;
            let size = (state.config.width, state.config.height);
            state.frame = Some(frame);
            (view, size.0, size.1, format)
        } else if let Some(target) = self.offscreen.as_ref() {
            let view = target
                .texture
                .create_view(&wgpu::TextureViewDescriptor::default());
            (view, target.width, target.height, target.format)
        } else {
            return Err(RenderError::SurfaceUnavailable {
                reason: "no render target configured".into(),
            });
        };

        let id = self.alloc_id();
        self.views.insert(id, ViewEntry { view, format });
        self.surface_view = Some(id);
        Ok(SurfaceTarget {
            view: TextureViewId(id),
            width,
            height,
            format,
        })
    }

    fn present(&mut self) {
        if let Some(view) = self.surface_view.take() {
            self.views.remove(&view);
        }
        if let Some(frame) = self.surface.as_mut().and_then(|s| s.frame.take()) {
            frame.present();
        }
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        let (width, height) = (width.max(1), height.max(1));
        if let Some(state) = self.surface.as_mut() {
            state.frame = None;
            state.config.width = width;
            state.config.height = height;
            state.surface.configure(&self.device, &state.config);
        } else if self.offscreen.is_some() {
            self.offscreen = Some(create_offscreen(&self.device, width, height));
        }
    }
}

// -----------------------------------------------------------------------------
// Factory
// -----------------------------------------------------------------------------

/// Requests adapters and devices from one `wgpu::Instance`. The surface (if
/// any) outlives device losses and is reconfigured for every new device.
pub struct WgpuFactory {
    instance: wgpu::Instance,
    surface: Option<Arc<wgpu::Surface<'static>>>,
    width: u32,
    height: u32,
    power_preference: wgpu::PowerPreference,
}

impl WgpuFactory {
    pub fn new(
        instance: wgpu::Instance,
        surface: Option<wgpu::Surface<'static>>,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            instance,
            surface: surface.map(Arc::new),
            width: width.max(1),
            height: height.max(1),
            power_preference: wgpu::PowerPreference::HighPerformance,
        }
    }

    /// Render into an offscreen texture; no window required.
    pub fn offscreen(width: u32, height: u32) -> Self {
        Self::new(
            wgpu::Instance::new(wgpu::InstanceDescriptor::default()),
            None,
            width,
            height,
        )
    }

    pub fn with_power_preference(mut self, preference: wgpu::PowerPreference) -> Self {
        self.power_preference = preference;
        self
    }

    /// Track window size so a recreated device configures the right extent.
    pub fn set_size(&mut self, width: u32, height: u32) {
        self.width = width.max(1);
        self.height = height.max(1);
    }
}

impl DeviceFactory for WgpuFactory {
    fn request_device(&mut self, loss: DeviceLossSender) -> Result<Box<dyn GpuDevice>> {
        let adapter = pollster::block_on(self.instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: self.power_preference,
            compatible_surface: self.surface.as_deref(),
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| RenderError::context_lost("no compatible adapter"))?;

        let info = adapter.get_info();
        log::info!("wgpu: using adapter `{}` ({:?})", info.name, info.backend);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("render_orchestrator_device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default().using_resolution(adapter.limits()),
                memory_hints: Default::default(),
            },
            None,
        ))
        .map_err(|e| RenderError::context_lost(format!("device request failed: {e}")))?;

        let surface = match &self.surface {
            Some(surface) => {
                let caps = surface.get_capabilities(&adapter);
                let format = caps
                    .formats
                    .iter()
                    .copied()
                    .find(|f| f.is_srgb())
                    .or_else(|| caps.formats.first().copied())
                    .ok_or_else(|| RenderError::SurfaceUnavailable {
                        reason: "surface reports no formats for this adapter".into(),
                    })?;
                let config = wgpu::SurfaceConfiguration {
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                    format,
                    width: self.width,
                    height: self.height,
                    present_mode: caps
                        .present_modes
                        .first()
                        .copied()
                        .unwrap_or(wgpu::PresentMode::Fifo),
                    alpha_mode: caps
                        .alpha_modes
                        .first()
                        .copied()
                        .unwrap_or(wgpu::CompositeAlphaMode::Auto),
                    view_formats: vec![],
                    desired_maximum_frame_latency: 2,
                };
                surface.configure(&device, &config);
                Some(SurfaceState {
                    surface: Arc::clone(surface),
                    config,
                    frame: None,
                })
            }
            None => None,
        };

        let device = WgpuDevice::new(device, queue, surface, (self.width, self.height), loss)?;
        Ok(Box::new(device))
    }
}
