// src/uniforms.rs
//! Per-draw uniforms in one buffer addressed by dynamic offsets.
//!
//! The buffer holds `max_draws` slots of `slot_stride` bytes and is allocated
//! once. Each frame the slots are filled in a CPU staging copy and uploaded
//! with a single `write_buffer` in [`UniformBufferManager::flush`].

use bytemuck::{Pod, Zeroable};
use glam::{Mat3, Mat4};

use crate::bind_group_manager::{BindGroupBuilder, BindGroupManager};
use crate::camera::RenderCamera;
use crate::error::{RenderError, Result};
use crate::gpu::resource_pool::{BufferPool, PooledBuffer};
use crate::gpu::{align_up, BindGroupId, BindGroupLayoutId, DeviceLimits, GpuDevice};
use crate::materials::MaterialUniforms;
use crate::scene::Mesh;

/// Uniform block shared by every built-in shader (256 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct MeshUniforms {
    pub model: [[f32; 4]; 4],
    pub view_projection: [[f32; 4]; 4],
    /// `mat3x3<f32>` in WGSL: three columns padded to vec4.
    pub normal_matrix: [[f32; 4]; 3],
    pub camera_position: [f32; 4],
    pub material: MaterialUniforms,
}

impl MeshUniforms {
    pub fn new(model: Mat4, camera: &dyn RenderCamera, material: MaterialUniforms) -> Self {
        let normal = normal_matrix(model);
        Self {
            model: model.to_cols_array_2d(),
            view_projection: camera.view_projection_matrix().to_cols_array_2d(),
            normal_matrix: [
                normal.x_axis.extend(0.0).to_array(),
                normal.y_axis.extend(0.0).to_array(),
                normal.z_axis.extend(0.0).to_array(),
            ],
            camera_position: camera.world_position().extend(1.0).to_array(),
            material,
        }
    }
}

/// Inverse-transpose of the upper 3×3; identity for degenerate transforms.
pub fn normal_matrix(model: Mat4) -> Mat3 {
    let upper = Mat3::from_mat4(model);
    let det = upper.determinant();
    if det.abs() <= f32::EPSILON || !det.is_finite() {
        return Mat3::IDENTITY;
    }
    upper.inverse().transpose()
}

#[derive(Debug)]
pub struct UniformBufferManager {
    max_draws: u32,
    slot_stride: u64,
    alignment: u64,
    staging: Vec<u8>,
    /// Slots written this frame (highest index + 1).
    used: u32,
    buffer: Option<PooledBuffer>,
    layout: Option<BindGroupLayoutId>,
    bind_group: Option<BindGroupId>,
    dropped: u64,
}

impl UniformBufferManager {
    /// Stride is the larger of `slot_size` and the uniform block, rounded up
    /// to the device's dynamic offset alignment.
    ///
    /// Rejects a stride above `max_uniform_buffer_binding_size` and a buffer
    /// whose last dynamic offset would not fit in `u32`.
    pub fn new(max_draws: u32, slot_size: u64, limits: &DeviceLimits) -> Result<Self> {
        let alignment = u64::from(limits.min_uniform_buffer_offset_alignment.max(1));
        let slot_stride = align_up(slot_size.max(std::mem::size_of::<MeshUniforms>() as u64), alignment);
        let binding_limit = u64::from(limits.max_uniform_buffer_binding_size);
        if slot_stride > binding_limit {
            return Err(RenderError::Config(format!(
                "uniform slot of {slot_stride} bytes exceeds the device binding limit of {binding_limit} bytes"
            )));
        }
        let buffer_size = u64::from(max_draws)
            .checked_mul(slot_stride)
            .filter(|&size| size <= u64::from(u32::MAX))
            .ok_or_else(|| {
                RenderError::Config(format!(
                    "{max_draws} draws x {slot_stride} byte slots overflow the 32-bit dynamic offset range"
                ))
            })?;
        Ok(Self {
            max_draws,
            slot_stride,
            alignment,
            staging: vec![0; buffer_size as usize],
            used: 0,
            buffer: None,
            layout: None,
            bind_group: None,
            dropped: 0,
        })
    }

    #[inline]
    pub fn slot_stride(&self) -> u64 {
        self.slot_stride
    }

    #[inline]
    pub fn max_draws(&self) -> u32 {
        self.max_draws
    }

    #[inline]
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn buffer_size(&self) -> u64 {
        self.max_draws as u64 * self.slot_stride
    }

    /// Allocate the buffer and bind group. No-op while they exist.
    pub fn create(
        &mut self,
        device: &mut dyn GpuDevice,
        pool: &mut BufferPool,
        bind_groups: &mut BindGroupManager,
    ) -> Result<()> {
        if self.buffer.is_some() {
            return Ok(());
        }
        let buffer = pool.acquire(device, "mesh_uniforms", self.buffer_size(), wgpu::BufferUsages::UNIFORM)?;
        let built = BindGroupBuilder::new(bind_groups, "mesh_uniforms")
            .add_dynamic_uniform(0, buffer.id(), self.slot_stride)
            .build(device);
        match built {
            Ok((layout, group)) => {
                log::debug!(
                    "UniformBufferManager: {} slots x {} bytes",
                    self.max_draws,
                    self.slot_stride
                );
                self.layout = Some(layout);
                self.bind_group = Some(group);
                self.buffer = Some(buffer);
                Ok(())
            }
            Err(err) => {
                pool.release(device, buffer);
                Err(err)
            }
        }
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.bind_group.is_some()
    }

    pub fn layout(&self) -> Option<BindGroupLayoutId> {
        self.layout
    }

    pub fn bind_group(&self) -> Option<BindGroupId> {
        self.bind_group
    }

    pub fn begin_frame(&mut self) {
        self.used = 0;
    }

    /// Draws rejected because the slot budget ran out (cumulative).
    pub fn dropped_draws(&self) -> u64 {
        self.dropped
    }

    /// Compute and stage the uniforms for `mesh` into slot `draw_index`.
    /// Returns `false` (and writes nothing) when the index is out of budget.
    pub fn update_uniforms(
        &mut self,
        mesh: &Mesh,
        camera: &dyn RenderCamera,
        draw_index: u32,
        material: MaterialUniforms,
    ) -> bool {
        if draw_index >= self.max_draws {
            self.dropped += 1;
            return false;
        }
        let uniforms = MeshUniforms::new(mesh.world_transform, camera, material);
        self.write_slot(draw_index, &uniforms)
    }

    pub fn write_slot(&mut self, draw_index: u32, uniforms: &MeshUniforms) -> bool {
        if draw_index >= self.max_draws {
            return false;
        }
        let start = (draw_index as u64 * self.slot_stride) as usize;
        let bytes = bytemuck::bytes_of(uniforms);
        self.staging[start..start + bytes.len()].copy_from_slice(bytes);
        self.used = self.used.max(draw_index + 1);
        true
    }

    /// Byte offset of slot `draw_index`; `None` outside the budget.
    #[inline]
    pub fn dynamic_offset(&self, draw_index: u32) -> Option<u32> {
        if draw_index >= self.max_draws {
            return None;
        }
        u32::try_from(u64::from(draw_index) * self.slot_stride).ok()
    }

    /// Upload the slots used this frame in one write.
    pub fn flush(&mut self, device: &mut dyn GpuDevice) -> Result<()> {
        if self.used == 0 {
            return Ok(());
        }
        let Some(buffer) = &self.buffer else {
            crate::bail!("uniform buffer flushed before creation");
        };
        let len = (self.used as u64 * self.slot_stride) as usize;
        device.write_buffer(buffer.id(), 0, &self.staging[..len])
    }

    /// Drop handles after device loss (the pool already destroyed the buffer).
    pub fn forget(&mut self) {
        self.buffer = None;
        self.layout = None;
        self.bind_group = None;
        self.used = 0;
    }

    pub fn dispose(&mut self, device: &mut dyn GpuDevice, pool: &mut BufferPool) {
        if let Some(group) = self.bind_group.take() {
            device.destroy_bind_group(group);
        }
        if let Some(buffer) = self.buffer.take() {
            pool.release(device, buffer);
        }
        self.layout = None;
        self.used = 0;
    }
}
