// src/geometry_cache.rs
//! Per-geometry GPU buffer sets.
//!
//! Vertex data is split into up to three streams:
//! * slot 0 – positions (`location 0`)
//! * slot 1 – interleaved surface attributes present on the geometry
//!   (normal 1, uv 2, uv2 3, tangent 4, color 5)
//! * slot 2 – interleaved morph-target deltas (position `6 + 2i`, normal `7 + 2i`)
//!
//! Entries are keyed by geometry id and valid only for the content version
//! they were built from. Buffers come from the [`BufferPool`]. A replaced
//! set may still be referenced by commands recorded this frame, so it is
//! parked until [`GeometryBufferCache::release_retired`] runs after submit.

use std::collections::HashMap;

use wgpu::{BufferUsages, VertexFormat, VertexStepMode};

use crate::error::{RenderError, Result};
use crate::geometry::{AttributeFlags, GeometryData, GeometryId, GeometryKind, MAX_MORPH_TARGETS};
use crate::gpu::resource_pool::{BufferPool, PooledBuffer};
use crate::gpu::{GpuDevice, RenderCommand, VertexAttributeDesc, VertexBufferLayoutDesc};

pub const POSITION_LOCATION: u32 = 0;
pub const NORMAL_LOCATION: u32 = 1;
pub const UV_LOCATION: u32 = 2;
pub const UV2_LOCATION: u32 = 3;
pub const TANGENT_LOCATION: u32 = 4;
pub const COLOR_LOCATION: u32 = 5;
pub const MORPH_BASE_LOCATION: u32 = 6;

/// Shader location of morph target `index`'s position (`normal = +1`).
#[inline]
pub fn morph_position_location(index: usize) -> u32 {
    MORPH_BASE_LOCATION + 2 * index as u32
}

/// One vertex stream bound to `slot`.
#[derive(Debug)]
pub struct VertexStream {
    pub slot: u32,
    buffer: PooledBuffer,
    /// Bytes actually written (the pooled buffer may be larger).
    pub byte_len: u64,
}

impl VertexStream {
    pub fn buffer(&self) -> &PooledBuffer {
        &self.buffer
    }
}

#[derive(Debug)]
pub struct IndexStream {
    buffer: PooledBuffer,
    pub format: wgpu::IndexFormat,
    pub count: u32,
    /// Unpadded index bytes.
    pub byte_len: u64,
}

impl IndexStream {
    pub fn buffer(&self) -> &PooledBuffer {
        &self.buffer
    }
}

/// GPU-side buffers and layout metadata for one geometry version.
#[derive(Debug)]
pub struct GeometryBufferSet {
    pub geometry: GeometryId,
    pub version: u64,
    pub kind: GeometryKind,
    pub streams: Vec<VertexStream>,
    pub index: Option<IndexStream>,
    /// Parallel to `streams`; feeds the pipeline key.
    pub layouts: Vec<VertexBufferLayoutDesc>,
    pub vertex_count: u32,
    pub instance_count: u32,
    pub attributes: AttributeFlags,
    /// `(attribute, shader location)` for every bound attribute.
    pub locations: Vec<(AttributeFlags, u32)>,
    pub morph_target_count: usize,
    pub last_used_frame: u64,
}

impl GeometryBufferSet {
    #[inline]
    pub fn has_uv2(&self) -> bool {
        self.attributes.contains(AttributeFlags::UV2)
    }

    #[inline]
    pub fn has_tangents(&self) -> bool {
        self.attributes.contains(AttributeFlags::TANGENT)
    }

    /// Vertex and index buffer binds this set needs, in slot order.
    pub fn bind_commands(&self) -> impl Iterator<Item = RenderCommand> + '_ {
        let vertex = self.streams.iter().map(|stream| RenderCommand::SetVertexBuffer {
            slot: stream.slot,
            buffer: stream.buffer.id(),
            offset: 0,
            size: stream.byte_len,
        });
        let index = self.index.iter().map(|index| RenderCommand::SetIndexBuffer {
            buffer: index.buffer.id(),
            format: index.format,
            offset: 0,
            size: index.byte_len,
        });
        vertex.chain(index)
    }

    pub fn draw_command(&self) -> RenderCommand {
        match &self.index {
            Some(index) => RenderCommand::DrawIndexed {
                indices: 0..index.count,
                base_vertex: 0,
                instances: 0..self.instance_count,
            },
            None => RenderCommand::Draw {
                vertices: 0..self.vertex_count,
                instances: 0..self.instance_count,
            },
        }
    }

    fn release(self, pool: &mut BufferPool, device: &mut dyn GpuDevice) {
        for stream in self.streams {
            pool.release(device, stream.buffer);
        }
        if let Some(index) = self.index {
            pool.release(device, index.buffer);
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeometryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub rebuilds: u64,
    pub bytes_uploaded: u64,
    pub entries: usize,
}

#[derive(Debug, Default)]
pub struct GeometryBufferCache {
    entries: HashMap<GeometryId, GeometryBufferSet>,
    retired: Vec<GeometryBufferSet>,
    scratch: Vec<u8>,
    stats: GeometryCacheStats,
}

impl GeometryBufferCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached set for the geometry's current version, building (and
    /// replacing a stale entry) on miss.
    pub fn get_or_create(
        &mut self,
        geometry: &GeometryData,
        frame_index: u64,
        pool: &mut BufferPool,
        device: &mut dyn GpuDevice,
    ) -> Result<&GeometryBufferSet> {
        let id = geometry.id();
        let fresh = self
            .entries
            .get(&id)
            .is_some_and(|set| set.version == geometry.version());

        if !fresh {
            self.stats.misses += 1;
            if let Some(stale) = self.entries.remove(&id) {
                log::debug!(
                    "GeometryBufferCache: geometry #{} changed (v{} -> v{}), rebuilding",
                    id.0,
                    stale.version,
                    geometry.version()
                );
                self.stats.rebuilds += 1;
                self.retired.push(stale);
            }
            let set = self.build(geometry, pool, device)?;
            self.entries.insert(id, set);
        } else {
            self.stats.hits += 1;
        }

        let set = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| RenderError::custom("geometry entry vanished after insert"))?;
        set.last_used_frame = frame_index;
        Ok(set)
    }

    pub fn get(&self, id: GeometryId) -> Option<&GeometryBufferSet> {
        self.entries.get(&id)
    }

    /// Return sets replaced since the last call to the pool. Call once the
    /// commands that referenced them have been submitted.
    pub fn release_retired(&mut self, pool: &mut BufferPool, device: &mut dyn GpuDevice) {
        for set in self.retired.drain(..) {
            set.release(pool, device);
        }
    }

    /// Sets waiting for [`release_retired`](Self::release_retired).
    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }

    /// Forget every entry; their buffers were already destroyed by the pool.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.retired.clear();
    }

    /// Hand every buffer back to the pool.
    pub fn dispose(&mut self, pool: &mut BufferPool, device: &mut dyn GpuDevice) {
        self.release_retired(pool, device);
        for (_, set) in self.entries.drain() {
            set.release(pool, device);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> GeometryCacheStats {
        GeometryCacheStats {
            entries: self.entries.len(),
            ..self.stats
        }
    }

    // ── building ─────────────────────────────────────────────────────────

    fn build(
        &mut self,
        geometry: &GeometryData,
        pool: &mut BufferPool,
        device: &mut dyn GpuDevice,
    ) -> Result<GeometryBufferSet> {
        validate(geometry)?;

        let vertex_count = geometry.vertex_count();
        let mut set = GeometryBufferSet {
            geometry: geometry.id(),
            version: geometry.version(),
            kind: geometry.kind(),
            streams: Vec::with_capacity(3),
            index: None,
            layouts: Vec::with_capacity(3),
            vertex_count,
            instance_count: geometry.instance_count(),
            attributes: AttributeFlags::POSITION,
            locations: vec![(AttributeFlags::POSITION, POSITION_LOCATION)],
            morph_target_count: 0,
            last_used_frame: 0,
        };

        // Any failure hands the partial set back to the pool.
        let result = self.upload_streams(geometry, &mut set, pool, device);

        match result {
            Ok(()) => {
                log::debug!(
                    "GeometryBufferCache: built geometry #{} v{} ({} streams, {} vertices, {:?})",
                    set.geometry.0,
                    set.version,
                    set.streams.len(),
                    set.vertex_count,
                    set.attributes
                );
                Ok(set)
            }
            Err(err) => {
                set.release(pool, device);
                Err(err.context(format!("uploading geometry #{}", geometry.id().0)))
            }
        }
    }

    fn upload_streams(
        &mut self,
        geometry: &GeometryData,
        set: &mut GeometryBufferSet,
        pool: &mut BufferPool,
        device: &mut dyn GpuDevice,
    ) -> Result<()> {
        let attrs = geometry.attributes();
        let vertex_count = set.vertex_count;

        // Stream 0: positions.
        self.scratch.clear();
        self.scratch.extend_from_slice(bytemuck::cast_slice(&attrs.positions));
        let layout = VertexBufferLayoutDesc {
            array_stride: 12,
            step_mode: VertexStepMode::Vertex,
            attributes: vec![VertexAttributeDesc {
                format: VertexFormat::Float32x3,
                offset: 0,
                shader_location: POSITION_LOCATION,
            }],
        };
        self.push_stream(set, layout, "geometry_positions", pool, device)?;

        // Stream 1: interleaved surface attributes.
        let mut surface: Vec<(AttributeFlags, VertexFormat, u32, &[u8], usize)> = Vec::with_capacity(5);
        if let Some(normals) = &attrs.normals {
            surface.push((AttributeFlags::NORMAL, VertexFormat::Float32x3, NORMAL_LOCATION, bytemuck::cast_slice(normals), 12));
        }
        if let Some(uvs) = &attrs.uvs {
            surface.push((AttributeFlags::UV, VertexFormat::Float32x2, UV_LOCATION, bytemuck::cast_slice(uvs), 8));
        }
        if let Some(uv2s) = &attrs.uv2s {
            surface.push((AttributeFlags::UV2, VertexFormat::Float32x2, UV2_LOCATION, bytemuck::cast_slice(uv2s), 8));
        }
        if let Some(tangents) = &attrs.tangents {
            surface.push((AttributeFlags::TANGENT, VertexFormat::Float32x4, TANGENT_LOCATION, bytemuck::cast_slice(tangents), 16));
        }
        if let Some(colors) = &attrs.colors {
            surface.push((AttributeFlags::COLOR, VertexFormat::Float32x4, COLOR_LOCATION, bytemuck::cast_slice(colors), 16));
        }
        if !surface.is_empty() {
            let parts: Vec<(&[u8], usize)> = surface.iter().map(|s| (s.3, s.4)).collect();
            let stride = interleave(&parts, vertex_count as usize, &mut self.scratch);
            let mut offset = 0u64;
            let mut attributes = Vec::with_capacity(surface.len());
            for &(flag, format, location, _, size) in &surface {
                attributes.push(VertexAttributeDesc {
                    format,
                    offset,
                    shader_location: location,
                });
                offset += size as u64;
                set.attributes |= flag;
                set.locations.push((flag, location));
            }
            let layout = VertexBufferLayoutDesc {
                array_stride: stride as u64,
                step_mode: VertexStepMode::Vertex,
                attributes,
            };
            self.push_stream(set, layout, "geometry_surface", pool, device)?;
        }

        // Stream 2: morph target deltas.
        if attrs.morph_targets.len() > MAX_MORPH_TARGETS {
            log::debug!(
                "GeometryBufferCache: geometry #{} has {} morph targets, binding the first {MAX_MORPH_TARGETS}",
                geometry.id().0,
                attrs.morph_targets.len()
            );
        }
        let targets = &attrs.morph_targets[..attrs.morph_targets.len().min(MAX_MORPH_TARGETS)];
        if !targets.is_empty() {
            let mut parts: Vec<(&[u8], usize)> = Vec::with_capacity(targets.len() * 2);
            let mut attributes = Vec::with_capacity(targets.len() * 2);
            let mut offset = 0u64;
            for (i, target) in targets.iter().enumerate() {
                parts.push((bytemuck::cast_slice(&target.position_deltas), 12));
                attributes.push(VertexAttributeDesc {
                    format: VertexFormat::Float32x3,
                    offset,
                    shader_location: morph_position_location(i),
                });
                offset += 12;
                if let Some(normals) = &target.normal_deltas {
                    parts.push((bytemuck::cast_slice(normals), 12));
                    attributes.push(VertexAttributeDesc {
                        format: VertexFormat::Float32x3,
                        offset,
                        shader_location: morph_position_location(i) + 1,
                    });
                    offset += 12;
                }
            }
            let stride = interleave(&parts, vertex_count as usize, &mut self.scratch);
            for attribute in &attributes {
                set.locations.push((AttributeFlags::MORPH_TARGETS, attribute.shader_location));
            }
            set.attributes |= AttributeFlags::MORPH_TARGETS;
            set.morph_target_count = targets.len();
            let layout = VertexBufferLayoutDesc {
                array_stride: stride as u64,
                step_mode: VertexStepMode::Vertex,
                attributes,
            };
            self.push_stream(set, layout, "geometry_morph", pool, device)?;
        }

        // Index buffer, padded to the 4-byte copy alignment.
        if let Some(indices) = geometry.indices() {
            let bytes = indices.as_bytes();
            self.scratch.clear();
            self.scratch.extend_from_slice(bytes);
            self.scratch.resize(bytes.len().next_multiple_of(4), 0);
            let buffer = pool.acquire(device, "geometry_indices", self.scratch.len() as u64, BufferUsages::INDEX)?;
            if let Err(err) = device.write_buffer(buffer.id(), 0, &self.scratch) {
                pool.release(device, buffer);
                return Err(err);
            }
            self.stats.bytes_uploaded += self.scratch.len() as u64;
            set.index = Some(IndexStream {
                buffer,
                format: indices.format(),
                count: indices.len() as u32,
                byte_len: bytes.len() as u64,
            });
        }
        Ok(())
    }

    /// Upload `self.scratch` into a fresh stream on the next slot.
    fn push_stream(
        &mut self,
        set: &mut GeometryBufferSet,
        layout: VertexBufferLayoutDesc,
        label: &str,
        pool: &mut BufferPool,
        device: &mut dyn GpuDevice,
    ) -> Result<()> {
        let byte_len = self.scratch.len() as u64;
        let buffer = pool.acquire(device, label, byte_len, BufferUsages::VERTEX)?;
        if let Err(err) = device.write_buffer(buffer.id(), 0, &self.scratch) {
            pool.release(device, buffer);
            return Err(err);
        }
        self.stats.bytes_uploaded += byte_len;
        set.streams.push(VertexStream {
            slot: set.streams.len() as u32,
            buffer,
            byte_len,
        });
        set.layouts.push(layout);
        Ok(())
    }
}

/// Interleave `parts` (per-vertex element bytes, element size) into `out`.
/// Returns the vertex stride.
fn interleave(parts: &[(&[u8], usize)], vertex_count: usize, out: &mut Vec<u8>) -> usize {
    let stride: usize = parts.iter().map(|&(_, size)| size).sum();
    out.clear();
    out.reserve(stride * vertex_count);
    for vertex in 0..vertex_count {
        for &(bytes, size) in parts {
            out.extend_from_slice(&bytes[vertex * size..(vertex + 1) * size]);
        }
    }
    stride
}

fn validate(geometry: &GeometryData) -> Result<()> {
    let invalid = |reason: String| RenderError::InvalidGeometry {
        geometry: geometry.id().0,
        reason,
    };
    let attrs = geometry.attributes();
    let count = attrs.positions.len();
    if count == 0 {
        return Err(invalid("geometry has no vertices".into()));
    }
    let optional = [
        ("normals", attrs.normals.as_ref().map(Vec::len)),
        ("uvs", attrs.uvs.as_ref().map(Vec::len)),
        ("uv2s", attrs.uv2s.as_ref().map(Vec::len)),
        ("tangents", attrs.tangents.as_ref().map(Vec::len)),
        ("colors", attrs.colors.as_ref().map(Vec::len)),
    ];
    for (name, len) in optional {
        if let Some(len) = len {
            if len != count {
                return Err(invalid(format!("{name} has {len} entries for {count} vertices")));
            }
        }
    }
    for (i, target) in attrs.morph_targets.iter().take(MAX_MORPH_TARGETS).enumerate() {
        if target.position_deltas.len() != count {
            return Err(invalid(format!(
                "morph target {i} has {} position deltas for {count} vertices",
                target.position_deltas.len()
            )));
        }
        if let Some(normals) = &target.normal_deltas {
            if normals.len() != count {
                return Err(invalid(format!(
                    "morph target {i} has {} normal deltas for {count} vertices",
                    normals.len()
                )));
            }
        }
    }
    if let Some(indices) = geometry.indices() {
        if indices.is_empty() {
            return Err(invalid("index list is empty".into()));
        }
        if let Some(max) = indices.max_index() {
            if max as usize >= count {
                return Err(invalid(format!("index {max} out of range for {count} vertices")));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::geometry::{cube, IndexData, MorphTarget};
    use crate::gpu::headless::HeadlessDevice;

    fn setup() -> (HeadlessDevice, BufferPool, GeometryBufferCache) {
        (
            HeadlessDevice::new(),
            BufferPool::new(&PoolConfig::default()),
            GeometryBufferCache::new(),
        )
    }

    fn triangle() -> GeometryData {
        GeometryData::new(
            GeometryKind::Mesh,
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        )
    }

    #[test]
    fn same_version_is_a_hit() {
        let (mut device, mut pool, mut cache) = setup();
        let geometry = cube(1.0);
        let first = cache.get_or_create(&geometry, 1, &mut pool, &mut device).unwrap().streams[0]
            .buffer()
            .id();
        let set = cache.get_or_create(&geometry, 2, &mut pool, &mut device).unwrap();
        assert_eq!(set.streams[0].buffer().id(), first);
        assert_eq!(set.last_used_frame, 2);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn cube_streams_and_locations() {
        let (mut device, mut pool, mut cache) = setup();
        let set = cache.get_or_create(&cube(1.0), 0, &mut pool, &mut device).unwrap();
        assert_eq!(set.streams.len(), 2);
        assert_eq!(set.layouts[1].array_stride, 20);
        assert_eq!(set.layouts[1].attributes[1].offset, 12);
        assert!(set.attributes.contains(AttributeFlags::NORMAL | AttributeFlags::UV));
        assert!(!set.has_uv2());
        assert!(set.locations.contains(&(AttributeFlags::UV, UV_LOCATION)));
        let index = set.index.as_ref().unwrap();
        assert_eq!(index.count, 36);
        assert_eq!(index.format, wgpu::IndexFormat::Uint16);
        assert!(matches!(set.draw_command(), RenderCommand::DrawIndexed { .. }));

        let binds: Vec<RenderCommand> = set.bind_commands().collect();
        assert_eq!(binds.len(), 3);
        assert!(matches!(binds[1], RenderCommand::SetVertexBuffer { slot: 1, .. }));
        assert!(matches!(
            binds[2],
            RenderCommand::SetIndexBuffer { format: wgpu::IndexFormat::Uint16, offset: 0, .. }
        ));
    }

    #[test]
    fn surface_stream_is_interleaved() {
        let (mut device, mut pool, mut cache) = setup();
        let probe = device.probe();
        let geometry = triangle()
            .with_normals(vec![[0.0, 0.0, 1.0]; 3])
            .with_colors(vec![[1.0, 0.5, 0.25, 1.0]; 3]);
        let set = cache.get_or_create(&geometry, 0, &mut pool, &mut device).unwrap();
        let bytes = probe.buffer_contents(set.streams[1].buffer().id()).unwrap();
        let floats: Vec<f32> = bytes[..28 * 2]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(&floats[..7], &[0.0, 0.0, 1.0, 1.0, 0.5, 0.25, 1.0]);
        assert_eq!(&floats[7..10], &[0.0, 0.0, 1.0]);
        assert_eq!(set.layouts[1].attributes[1].shader_location, COLOR_LOCATION);
    }

    #[test]
    fn version_change_rebuilds_and_retires_old_buffers() {
        let (mut device, mut pool, mut cache) = setup();
        let mut geometry = triangle();
        let old = cache.get_or_create(&geometry, 0, &mut pool, &mut device).unwrap().streams[0]
            .buffer()
            .id();
        geometry.update_attributes(|a| a.normals = Some(vec![[0.0, 1.0, 0.0]; 3]));
        let set = cache.get_or_create(&geometry, 1, &mut pool, &mut device).unwrap();
        assert_eq!(set.version, geometry.version());
        assert_eq!(set.streams.len(), 2);
        // Still referenced by this frame's commands, so not handed out again.
        assert_ne!(set.streams[0].buffer().id(), old);
        assert_eq!(cache.stats().rebuilds, 1);
        assert_eq!(cache.retired_len(), 1);
        assert_eq!(pool.stats().hits, 0);

        cache.release_retired(&mut pool, &mut device);
        assert_eq!(cache.retired_len(), 0);
        assert_eq!(pool.stats().in_use_buffers, 2);
        assert_eq!(pool.stats().idle_buffers, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn dispose_also_returns_retired_sets() {
        let (mut device, mut pool, mut cache) = setup();
        let mut geometry = triangle();
        cache.get_or_create(&geometry, 0, &mut pool, &mut device).unwrap();
        geometry.update_attributes(|a| a.positions[0] = [0.5, 0.0, 0.0]);
        cache.get_or_create(&geometry, 1, &mut pool, &mut device).unwrap();
        cache.dispose(&mut pool, &mut device);
        assert_eq!(cache.retired_len(), 0);
        assert_eq!(pool.stats().in_use_buffers, 0);
    }

    #[test]
    fn morph_targets_get_their_own_stream() {
        let (mut device, mut pool, mut cache) = setup();
        let geometry = triangle()
            .with_morph_target(MorphTarget {
                position_deltas: vec![[0.1; 3]; 3],
                normal_deltas: Some(vec![[0.0; 3]; 3]),
            })
            .with_morph_target(MorphTarget {
                position_deltas: vec![[0.2; 3]; 3],
                normal_deltas: None,
            });
        let set = cache.get_or_create(&geometry, 0, &mut pool, &mut device).unwrap();
        assert_eq!(set.morph_target_count, 2);
        let morph = set.layouts.last().unwrap();
        let locations: Vec<u32> = morph.attributes.iter().map(|a| a.shader_location).collect();
        assert_eq!(locations, [6, 7, 8]);
        assert_eq!(morph.array_stride, 36);
    }

    #[test]
    fn odd_u16_index_counts_are_padded() {
        let (mut device, mut pool, mut cache) = setup();
        let geometry = GeometryData::new(GeometryKind::Lines, vec![[0.0; 3], [1.0; 3], [2.0; 3]])
            .with_indices(IndexData::U16(vec![0, 1, 2]));
        let set = cache.get_or_create(&geometry, 0, &mut pool, &mut device).unwrap();
        let index = set.index.as_ref().unwrap();
        assert_eq!(index.byte_len, 6);
        assert_eq!(index.count, 3);
    }

    #[test]
    fn malformed_geometry_is_rejected_without_leaking() {
        let (mut device, mut pool, mut cache) = setup();
        let probe = device.probe();
        let bad = triangle().with_uvs(vec![[0.0, 0.0]; 2]);
        let err = cache.get_or_create(&bad, 0, &mut pool, &mut device).unwrap_err();
        assert!(matches!(err.root(), RenderError::InvalidGeometry { .. }));

        let out_of_range = triangle().with_indices(IndexData::U32(vec![0, 1, 7]));
        assert!(cache.get_or_create(&out_of_range, 0, &mut pool, &mut device).is_err());
        assert!(cache.is_empty());
        assert_eq!(probe.live_buffers(), pool.stats().idle_buffers);
    }

    #[test]
    fn allocation_failure_releases_partial_sets() {
        let (mut device, mut pool, mut cache) = setup();
        // Positions succeed, the surface stream fails.
        device.set_buffer_budget(Some(1));
        let geometry = triangle().with_normals(vec![[0.0, 0.0, 1.0]; 3]);
        let err = cache.get_or_create(&geometry, 0, &mut pool, &mut device).unwrap_err();
        assert!(err.is_allocation_failure());
        assert_eq!(pool.stats().in_use_buffers, 0);
        assert_eq!(pool.stats().idle_buffers, 1);
    }

    #[test]
    fn dispose_returns_buffers_to_the_pool() {
        let (mut device, mut pool, mut cache) = setup();
        cache.get_or_create(&cube(1.0), 0, &mut pool, &mut device).unwrap();
        assert_eq!(pool.stats().in_use_buffers, 3);
        cache.dispose(&mut pool, &mut device);
        assert!(cache.is_empty());
        assert_eq!(pool.stats().in_use_buffers, 0);
    }
}
