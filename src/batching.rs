// src/batching.rs
//! Groups visible meshes that can share pipeline and material state.
//!
//! A batch key is {material identity, geometry type tag, render-state hash}.
//! Batches come out in first-seen order and keep their meshes in insertion
//! order; nothing is sorted or merged. Members are recorded as indices in
//! `add_mesh` call order so batch storage can be recycled across frames
//! without borrowing the scene.

use std::collections::HashMap;

use xxhash_rust::xxh3::xxh3_64;

use crate::materials::{MaterialId, RenderState};
use crate::scene::Mesh;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub material: MaterialId,
    pub geometry_kind: u8,
    pub render_state: u64,
}

impl BatchKey {
    pub fn for_mesh(mesh: &Mesh) -> Self {
        Self {
            material: mesh.material.id(),
            geometry_kind: mesh.geometry.kind().tag(),
            render_state: render_state_hash(&mesh.material.render_state),
        }
    }
}

/// Fold of per-field digests with wrapping addition, so the result does not
/// depend on the order fields are visited in. Each digest covers a field tag
/// and the field's value bytes.
pub fn render_state_hash(state: &RenderState) -> u64 {
    fn field(tag: u8, bytes: &[u8]) -> u64 {
        let mut buf = [0u8; 32];
        buf[0] = tag;
        let len = bytes.len().min(31);
        buf[1..=len].copy_from_slice(&bytes[..len]);
        xxh3_64(&buf[..=len])
    }

    let stencil = state.stencil.map_or([0u8; 16], |s| {
        let mut b = [0u8; 16];
        b[0] = 1;
        b[1] = s.compare as u8;
        b[2] = s.fail_op as u8;
        b[3] = s.depth_fail_op as u8;
        b[4] = s.pass_op as u8;
        b[5..9].copy_from_slice(&s.read_mask.to_le_bytes());
        b[9..13].copy_from_slice(&s.write_mask.to_le_bytes());
        b
    });
    let offset = state.polygon_offset.map_or([0u8; 9], |o| {
        let mut b = [0u8; 9];
        b[0] = 1;
        b[1..5].copy_from_slice(&o.constant.to_le_bytes());
        b[5..9].copy_from_slice(&o.slope_scale.to_bits().to_le_bytes());
        b
    });

    [
        field(0, &[state.side as u8]),
        field(1, &[state.front_face as u8]),
        field(2, &[state.depth_test as u8, state.depth_write as u8]),
        field(3, &[state.depth_compare as u8]),
        field(4, &[state.blend as u8]),
        field(5, &stencil),
        field(6, &offset),
        field(7, &[state.dithering as u8, state.alpha_to_coverage as u8]),
    ]
    .into_iter()
    .fold(0u64, u64::wrapping_add)
}

#[derive(Debug, Clone)]
pub struct MeshBatch {
    pub key: BatchKey,
    /// Indices in `add_mesh` order.
    pub members: Vec<u32>,
}

impl MeshBatch {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct DrawCallBatcher {
    batches: Vec<MeshBatch>,
    index: HashMap<BatchKey, usize>,
    /// Member vectors from previous frames, reused by new batches.
    spare: Vec<Vec<u32>>,
    added: u32,
}

impl DrawCallBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the index assigned to `mesh`.
    pub fn add_mesh(&mut self, mesh: &Mesh) -> u32 {
        let key = BatchKey::for_mesh(mesh);
        let member = self.added;
        self.added += 1;
        let slot = match self.index.get(&key) {
            Some(&slot) => slot,
            None => {
                let mut members = self.spare.pop().unwrap_or_default();
                members.clear();
                self.batches.push(MeshBatch { key, members });
                self.index.insert(key, self.batches.len() - 1);
                self.batches.len() - 1
            }
        };
        self.batches[slot].members.push(member);
        member
    }

    pub fn add_meshes<'a>(&mut self, meshes: impl IntoIterator<Item = &'a Mesh>) {
        for mesh in meshes {
            self.add_mesh(mesh);
        }
    }

    /// First-seen order.
    pub fn batches(&self) -> &[MeshBatch] {
        &self.batches
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    pub fn mesh_count(&self) -> u32 {
        self.added
    }

    /// Empty the batcher, keeping member storage for the next frame.
    pub fn clear(&mut self) {
        self.index.clear();
        for batch in self.batches.drain(..) {
            self.spare.push(batch.members);
        }
        self.added = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{cube, GeometryData, GeometryKind};
    use crate::materials::{BlendMode, Material, Side};
    use glam::Mat4;
    use std::sync::Arc;

    fn mesh(geometry: &Arc<GeometryData>, material: &Arc<Material>) -> Mesh {
        Mesh::new(geometry.clone(), material.clone(), Mat4::IDENTITY)
    }

    #[test]
    fn identical_meshes_share_one_batch() {
        let geometry = Arc::new(cube(1.0));
        let material = Arc::new(Material::basic([1.0; 4]));
        let meshes: Vec<Mesh> = (0..10).map(|_| mesh(&geometry, &material)).collect();
        let mut batcher = DrawCallBatcher::new();
        batcher.add_meshes(&meshes);
        assert_eq!(batcher.batch_count(), 1);
        assert_eq!(batcher.batches()[0].members, (0..10).collect::<Vec<u32>>());
    }

    #[test]
    fn changing_one_field_starts_a_new_batch() {
        let geometry = Arc::new(cube(1.0));
        let lines = Arc::new(GeometryData::new(GeometryKind::Lines, vec![[0.0; 3], [1.0; 3]]));
        let material = Arc::new(Material::basic([1.0; 4]));
        let other = Arc::new(Material::basic([1.0; 4]));

        let mut batcher = DrawCallBatcher::new();
        batcher.add_mesh(&mesh(&geometry, &material));
        batcher.add_mesh(&mesh(&geometry, &other));
        batcher.add_mesh(&mesh(&lines, &material));
        batcher.add_mesh(&mesh(&geometry, &material));
        assert_eq!(batcher.batch_count(), 3);
        assert_eq!(batcher.batches()[0].members, [0, 3]);
        assert_eq!(batcher.batches()[1].members, [1]);
        assert_eq!(batcher.batches()[2].members, [2]);
    }

    #[test]
    fn render_state_hash_sees_every_field() {
        let base = RenderState::default();
        assert_eq!(render_state_hash(&base), render_state_hash(&RenderState::default()));

        let variants = [
            RenderState { side: Side::Double, ..base },
            RenderState { depth_write: false, ..base },
            RenderState { blend: BlendMode::Additive, ..base },
            RenderState { dithering: true, ..base },
            RenderState { depth_compare: wgpu::CompareFunction::Greater, ..base },
            RenderState { front_face: wgpu::FrontFace::Cw, ..base },
        ];
        for variant in variants {
            assert_ne!(render_state_hash(&variant), render_state_hash(&base), "{variant:?}");
        }
        // Same bits in different fields must not collide.
        assert_ne!(
            render_state_hash(&RenderState { depth_test: false, ..base }),
            render_state_hash(&RenderState { depth_write: false, ..base })
        );
    }

    #[test]
    fn clear_recycles_storage_and_restarts_numbering() {
        let geometry = Arc::new(cube(1.0));
        let material = Arc::new(Material::basic([1.0; 4]));
        let mut batcher = DrawCallBatcher::new();
        batcher.add_mesh(&mesh(&geometry, &material));
        batcher.clear();
        assert_eq!(batcher.batch_count(), 0);
        assert_eq!(batcher.spare.len(), 1);
        assert_eq!(batcher.add_mesh(&mesh(&geometry, &material)), 0);
        assert!(batcher.spare.is_empty());
    }
}
