// src/geometry.rs
//! CPU-side geometry descriptors consumed (read-only) by the geometry buffer
//! cache. Every mutation bumps the content version, which is what the cache
//! keys on together with the geometry id.

use std::sync::atomic::{AtomicU64, Ordering};

use glam::Vec3;

/// Morph target streams beyond this count are ignored.
pub const MAX_MORPH_TARGETS: usize = 4;

static NEXT_GEOMETRY_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeometryId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GeometryKind {
    Mesh,
    Instanced,
    Lines,
    Points,
}

impl GeometryKind {
    pub fn topology(self) -> wgpu::PrimitiveTopology {
        match self {
            GeometryKind::Mesh | GeometryKind::Instanced => wgpu::PrimitiveTopology::TriangleList,
            GeometryKind::Lines => wgpu::PrimitiveTopology::LineList,
            GeometryKind::Points => wgpu::PrimitiveTopology::PointList,
        }
    }

    /// Stable tag folded into batch keys.
    pub fn tag(self) -> u8 {
        match self {
            GeometryKind::Mesh => 0,
            GeometryKind::Instanced => 1,
            GeometryKind::Lines => 2,
            GeometryKind::Points => 3,
        }
    }
}

bitflags::bitflags! {
    /// Vertex attribute set of a geometry (or the set a material requires).
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct AttributeFlags: u32 {
        const POSITION      = 1 << 0;
        const NORMAL        = 1 << 1;
        const UV            = 1 << 2;
        const UV2           = 1 << 3;
        const TANGENT       = 1 << 4;
        const COLOR         = 1 << 5;
        const MORPH_TARGETS = 1 << 6;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum IndexData {
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl IndexData {
    pub fn len(&self) -> usize {
        match self {
            IndexData::U16(v) => v.len(),
            IndexData::U32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn format(&self) -> wgpu::IndexFormat {
        match self {
            IndexData::U16(_) => wgpu::IndexFormat::Uint16,
            IndexData::U32(_) => wgpu::IndexFormat::Uint32,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            IndexData::U16(v) => bytemuck::cast_slice(v),
            IndexData::U32(v) => bytemuck::cast_slice(v),
        }
    }

    pub fn max_index(&self) -> Option<u32> {
        match self {
            IndexData::U16(v) => v.iter().max().map(|&i| i as u32),
            IndexData::U32(v) => v.iter().max().copied(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MorphTarget {
    pub position_deltas: Vec<[f32; 3]>,
    pub normal_deltas: Option<Vec<[f32; 3]>>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingSphere {
    pub center: Vec3,
    pub radius: f32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct VertexAttributes {
    pub positions: Vec<[f32; 3]>,
    pub normals: Option<Vec<[f32; 3]>>,
    pub uvs: Option<Vec<[f32; 2]>>,
    pub uv2s: Option<Vec<[f32; 2]>>,
    pub tangents: Option<Vec<[f32; 4]>>,
    pub colors: Option<Vec<[f32; 4]>>,
    pub morph_targets: Vec<MorphTarget>,
}

impl VertexAttributes {
    pub fn flags(&self) -> AttributeFlags {
        let mut flags = AttributeFlags::empty();
        flags.set(AttributeFlags::POSITION, !self.positions.is_empty());
        flags.set(AttributeFlags::NORMAL, self.normals.is_some());
        flags.set(AttributeFlags::UV, self.uvs.is_some());
        flags.set(AttributeFlags::UV2, self.uv2s.is_some());
        flags.set(AttributeFlags::TANGENT, self.tangents.is_some());
        flags.set(AttributeFlags::COLOR, self.colors.is_some());
        flags.set(AttributeFlags::MORPH_TARGETS, !self.morph_targets.is_empty());
        flags
    }
}

/// Cloning yields a new geometry: the copy gets a fresh id so its GPU buffers
/// never share a cache entry with the original.
#[derive(Debug, PartialEq)]
pub struct GeometryData {
    id: GeometryId,
    version: u64,
    kind: GeometryKind,
    attributes: VertexAttributes,
    indices: Option<IndexData>,
    instance_count: u32,
    bounding_sphere: Option<BoundingSphere>,
}

impl Clone for GeometryData {
    fn clone(&self) -> Self {
        Self {
            id: next_geometry_id(),
            version: self.version,
            kind: self.kind,
            attributes: self.attributes.clone(),
            indices: self.indices.clone(),
            instance_count: self.instance_count,
            bounding_sphere: self.bounding_sphere,
        }
    }
}

fn next_geometry_id() -> GeometryId {
    GeometryId(NEXT_GEOMETRY_ID.fetch_add(1, Ordering::Relaxed))
}

impl GeometryData {
    pub fn new(kind: GeometryKind, positions: Vec<[f32; 3]>) -> Self {
        let mut geometry = Self {
            id: next_geometry_id(),
            version: 1,
            kind,
            attributes: VertexAttributes {
                positions,
                ..VertexAttributes::default()
            },
            indices: None,
            instance_count: 1,
            bounding_sphere: None,
        };
        geometry.compute_bounding_sphere();
        geometry
    }

    // ── Builders ─────────────────────────────────────────────────────────

    pub fn with_normals(mut self, normals: Vec<[f32; 3]>) -> Self {
        self.attributes.normals = Some(normals);
        self
    }

    pub fn with_uvs(mut self, uvs: Vec<[f32; 2]>) -> Self {
        self.attributes.uvs = Some(uvs);
        self
    }

    pub fn with_uv2s(mut self, uv2s: Vec<[f32; 2]>) -> Self {
        self.attributes.uv2s = Some(uv2s);
        self
    }

    pub fn with_tangents(mut self, tangents: Vec<[f32; 4]>) -> Self {
        self.attributes.tangents = Some(tangents);
        self
    }

    pub fn with_colors(mut self, colors: Vec<[f32; 4]>) -> Self {
        self.attributes.colors = Some(colors);
        self
    }

    pub fn with_morph_target(mut self, target: MorphTarget) -> Self {
        self.attributes.morph_targets.push(target);
        self
    }

    pub fn with_indices(mut self, indices: IndexData) -> Self {
        self.indices = Some(indices);
        self
    }

    pub fn with_instance_count(mut self, count: u32) -> Self {
        self.instance_count = count.max(1);
        self
    }

    /// Overrides the computed sphere; a zero radius means "never cull".
    pub fn with_bounding_sphere(mut self, sphere: Option<BoundingSphere>) -> Self {
        self.bounding_sphere = sphere;
        self
    }

    // ── Accessors ────────────────────────────────────────────────────────

    #[inline]
    pub fn id(&self) -> GeometryId {
        self.id
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn kind(&self) -> GeometryKind {
        self.kind
    }

    #[inline]
    pub fn attributes(&self) -> &VertexAttributes {
        &self.attributes
    }

    #[inline]
    pub fn indices(&self) -> Option<&IndexData> {
        self.indices.as_ref()
    }

    #[inline]
    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    #[inline]
    pub fn bounding_sphere(&self) -> Option<BoundingSphere> {
        self.bounding_sphere
    }

    #[inline]
    pub fn vertex_count(&self) -> u32 {
        self.attributes.positions.len() as u32
    }

    pub fn attribute_flags(&self) -> AttributeFlags {
        self.attributes.flags()
    }

    /// Triangles for triangle lists, segments for lines, points for points.
    pub fn primitive_count(&self) -> u64 {
        let elements = self
            .indices
            .as_ref()
            .map_or(self.vertex_count() as u64, |i| i.len() as u64);
        let per_instance = match self.kind {
            GeometryKind::Mesh | GeometryKind::Instanced => elements / 3,
            GeometryKind::Lines => elements / 2,
            GeometryKind::Points => elements,
        };
        per_instance * self.instance_count as u64
    }

    // ── Mutation (bumps version) ─────────────────────────────────────────

    /// Mutable access to vertex data; the content version is bumped even if
    /// the closure changes nothing.
    pub fn update_attributes(&mut self, f: impl FnOnce(&mut VertexAttributes)) {
        f(&mut self.attributes);
        self.version += 1;
        self.compute_bounding_sphere();
    }

    pub fn set_indices(&mut self, indices: Option<IndexData>) {
        self.indices = indices;
        self.version += 1;
    }

    pub fn set_instance_count(&mut self, count: u32) {
        self.instance_count = count.max(1);
        self.version += 1;
    }

    /// AABB-centred sphere enclosing all positions.
    pub fn compute_bounding_sphere(&mut self) {
        let positions = &self.attributes.positions;
        if positions.is_empty() {
            self.bounding_sphere = None;
            return;
        }
        let (min, max) = positions.iter().fold(
            (Vec3::splat(f32::INFINITY), Vec3::splat(f32::NEG_INFINITY)),
            |(min, max), &p| {
                let p = Vec3::from(p);
                (min.min(p), max.max(p))
            },
        );
        let center = (min + max) * 0.5;
        let radius = positions
            .iter()
            .map(|&p| Vec3::from(p).distance_squared(center))
            .fold(0.0f32, f32::max)
            .sqrt();
        self.bounding_sphere = Some(BoundingSphere { center, radius });
    }
}

// ── Primitive shapes (tests, demos) ──────────────────────────────────────────

/// Unit cube (24 vertices, normals + uvs, u16 indices).
pub fn cube(half_extent: f32) -> GeometryData {
    let h = half_extent;
    let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
        ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
        ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
        ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
    ];
    let mut positions = Vec::with_capacity(24);
    let mut normals = Vec::with_capacity(24);
    let mut uvs = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (face, (n, u, v)) in faces.iter().enumerate() {
        let (n, u, v) = (Vec3::from(*n), Vec3::from(*u), Vec3::from(*v));
        for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            positions.push(((n + u * su + v * sv) * h).to_array());
            normals.push(n.to_array());
            uvs.push([(su + 1.0) * 0.5, (1.0 - sv) * 0.5]);
        }
        let base = (face * 4) as u16;
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    GeometryData::new(GeometryKind::Mesh, positions)
        .with_normals(normals)
        .with_uvs(uvs)
        .with_indices(IndexData::U16(indices))
}
