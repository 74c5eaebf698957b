// src/bind_group_manager.rs
//! Bind group layout cache + bind group builder over the device contract.
//!
//! - Layouts are memoized by an xxh3 hash of their full entry list, so two
//!   subsystems asking for the same shape share one layout handle (and the
//!   pipeline cache sees equal layout ids for equal layouts).
//! - Bind groups are never cached here; their owners (uniform manager,
//!   environment manager) hold them alongside the resources they reference.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use wgpu::ShaderStages;
use xxhash_rust::xxh3::Xxh3;

use crate::error::Result;
use crate::gpu::{
    BindGroupEntry, BindGroupId, BindGroupLayoutEntry, BindGroupLayoutId, BindingKind,
    BindingResource, BufferId, GpuDevice, SamplerId, TextureViewId,
};

#[derive(Debug, Default)]
pub struct BindGroupManager {
    layout_cache: HashMap<u64, BindGroupLayoutId>,
    hits: u64,
    misses: u64,
}

impl BindGroupManager {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layout_key(entries: &[BindGroupLayoutEntry]) -> u64 {
        let mut hasher = Xxh3::new();
        entries.hash(&mut hasher);
        hasher.finish()
    }

    /// Get or create a layout (cached by content hash).
    pub fn get_or_create_layout(
        &mut self,
        device: &mut dyn GpuDevice,
        label: &str,
        entries: &[BindGroupLayoutEntry],
    ) -> Result<BindGroupLayoutId> {
        let key = Self::layout_key(entries);
        if let Some(&layout) = self.layout_cache.get(&key) {
            self.hits += 1;
            return Ok(layout);
        }
        let layout = device.create_bind_group_layout(label, entries)?;
        self.layout_cache.insert(key, layout);
        self.misses += 1;
        log::debug!("BindGroupManager: created layout `{label}` ({} entries)", entries.len());
        Ok(layout)
    }

    // ================ COMMON LAYOUTS ================

    /// Binding 0: one uniform slot addressed with a dynamic offset.
    pub fn dynamic_uniform_layout(
        &mut self,
        device: &mut dyn GpuDevice,
        slot_size: u64,
    ) -> Result<BindGroupLayoutId> {
        let entries = [BindGroupLayoutEntry {
            binding: 0,
            visibility: ShaderStages::VERTEX_FRAGMENT,
            kind: BindingKind::UniformBuffer {
                has_dynamic_offset: true,
                min_binding_size: slot_size,
            },
        }];
        self.get_or_create_layout(device, "mesh_uniforms_layout", &entries)
    }

    /// Cube map + sampler, BRDF LUT + sampler.
    pub fn environment_layout(&mut self, device: &mut dyn GpuDevice) -> Result<BindGroupLayoutId> {
        let entries = [
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStages::FRAGMENT,
                kind: BindingKind::Texture {
                    view_dimension: wgpu::TextureViewDimension::Cube,
                },
            },
            BindGroupLayoutEntry {
                binding: 1,
                visibility: ShaderStages::FRAGMENT,
                kind: BindingKind::Sampler,
            },
            BindGroupLayoutEntry {
                binding: 2,
                visibility: ShaderStages::FRAGMENT,
                kind: BindingKind::Texture {
                    view_dimension: wgpu::TextureViewDimension::D2,
                },
            },
            BindGroupLayoutEntry {
                binding: 3,
                visibility: ShaderStages::FRAGMENT,
                kind: BindingKind::Sampler,
            },
        ];
        self.get_or_create_layout(device, "environment_layout", &entries)
    }

    /// Forget every layout without destroying (device already gone).
    pub fn clear(&mut self) {
        self.layout_cache.clear();
    }

    pub fn dispose(&mut self, device: &mut dyn GpuDevice) {
        for (_, layout) in self.layout_cache.drain() {
            device.destroy_bind_group_layout(layout);
        }
    }

    pub fn len(&self) -> usize {
        self.layout_cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layout_cache.is_empty()
    }

    pub fn hit_miss(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

/// Fluent builder: collects layout and bind entries side by side.
pub struct BindGroupBuilder<'a> {
    manager: &'a mut BindGroupManager,
    label: String,
    layout_entries: Vec<BindGroupLayoutEntry>,
    bind_entries: Vec<BindGroupEntry>,
}

impl<'a> BindGroupBuilder<'a> {
    #[inline]
    pub fn new(manager: &'a mut BindGroupManager, label: impl Into<String>) -> Self {
        Self {
            manager,
            label: label.into(),
            layout_entries: Vec::with_capacity(4),
            bind_entries: Vec::with_capacity(4),
        }
    }

    pub fn add_dynamic_uniform(mut self, binding: u32, buffer: BufferId, slot_size: u64) -> Self {
        self.layout_entries.push(BindGroupLayoutEntry {
            binding,
            visibility: ShaderStages::VERTEX_FRAGMENT,
            kind: BindingKind::UniformBuffer {
                has_dynamic_offset: true,
                min_binding_size: slot_size,
            },
        });
        self.bind_entries.push(BindGroupEntry {
            binding,
            resource: BindingResource::Buffer {
                buffer,
                offset: 0,
                size: Some(slot_size),
            },
        });
        self
    }

    pub fn add_texture(
        mut self,
        binding: u32,
        view: TextureViewId,
        view_dimension: wgpu::TextureViewDimension,
    ) -> Self {
        self.layout_entries.push(BindGroupLayoutEntry {
            binding,
            visibility: ShaderStages::FRAGMENT,
            kind: BindingKind::Texture { view_dimension },
        });
        self.bind_entries.push(BindGroupEntry {
            binding,
            resource: BindingResource::TextureView(view),
        });
        self
    }

    pub fn add_sampler(mut self, binding: u32, sampler: SamplerId) -> Self {
        self.layout_entries.push(BindGroupLayoutEntry {
            binding,
            visibility: ShaderStages::FRAGMENT,
            kind: BindingKind::Sampler,
        });
        self.bind_entries.push(BindGroupEntry {
            binding,
            resource: BindingResource::Sampler(sampler),
        });
        self
    }

    /// Cached layout + a fresh bind group owned by the caller.
    pub fn build(self, device: &mut dyn GpuDevice) -> Result<(BindGroupLayoutId, BindGroupId)> {
        let layout = self
            .manager
            .get_or_create_layout(device, &format!("{}_layout", self.label), &self.layout_entries)?;
        let group = device.create_bind_group(&self.label, layout, &self.bind_entries)?;
        Ok((layout, group))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::HeadlessDevice;
    use crate::gpu::{BufferDesc, SamplerDesc};

    #[test]
    fn identical_layouts_share_one_handle() {
        let mut device = HeadlessDevice::new();
        let mut manager = BindGroupManager::new();
        let a = manager.environment_layout(&mut device).unwrap();
        let b = manager.environment_layout(&mut device).unwrap();
        assert_eq!(a, b);
        assert_eq!(manager.hit_miss(), (1, 1));

        let c = manager.dynamic_uniform_layout(&mut device, 256).unwrap();
        assert_ne!(a, c);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn builder_matches_helper_layout() {
        let mut device = HeadlessDevice::new();
        let mut manager = BindGroupManager::new();
        let buffer = device
            .create_buffer(&BufferDesc {
                label: "u".into(),
                size: 1024,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            })
            .unwrap();
        let (layout, _group) = BindGroupBuilder::new(&mut manager, "mesh_uniforms")
            .add_dynamic_uniform(0, buffer, 256)
            .build(&mut device)
            .unwrap();
        assert_eq!(manager.dynamic_uniform_layout(&mut device, 256).unwrap(), layout);
    }

    #[test]
    fn builder_rejects_stale_sampler() {
        let mut device = HeadlessDevice::new();
        let mut manager = BindGroupManager::new();
        let sampler = device.create_sampler(&SamplerDesc::linear_clamp("s")).unwrap();
        device.destroy_sampler(sampler);
        let err = BindGroupBuilder::new(&mut manager, "broken")
            .add_sampler(0, sampler)
            .build(&mut device)
            .unwrap_err();
        assert!(err.is_invalid_handle());
    }
}
