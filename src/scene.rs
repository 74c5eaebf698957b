// src/scene.rs
// Read-only scene description consumed by the frame loop.
// World transforms are evaluated upstream; nodes here only carry the result.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use glam::Mat4;

use crate::environment::{BrdfLut, EnvironmentMap};
use crate::geometry::GeometryData;
use crate::materials::Material;

static NEXT_MESH_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct MeshId(pub u64);

/// Renderable leaf: geometry + material + world transform.
#[derive(Clone, Debug)]
pub struct Mesh {
    id: MeshId,
    pub name: String,
    pub geometry: Arc<GeometryData>,
    pub material: Arc<Material>,
    pub world_transform: Mat4,
}

impl Mesh {
    pub fn new(geometry: Arc<GeometryData>, material: Arc<Material>, world_transform: Mat4) -> Self {
        Self {
            id: MeshId(NEXT_MESH_ID.fetch_add(1, Ordering::Relaxed)),
            name: String::new(),
            geometry,
            material,
            world_transform,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[inline]
    pub fn id(&self) -> MeshId {
        self.id
    }
}

#[derive(Clone, Debug)]
pub struct SceneNode {
    pub name: String,
    /// Hidden nodes hide their whole subtree.
    pub visible: bool,
    pub mesh: Option<Mesh>,
    pub children: Vec<SceneNode>,
}

impl Default for SceneNode {
    fn default() -> Self {
        Self {
            name: String::new(),
            visible: true,
            mesh: None,
            children: Vec::new(),
        }
    }
}

impl SceneNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_mesh(mesh: Mesh) -> Self {
        Self {
            name: mesh.name.clone(),
            mesh: Some(mesh),
            ..Self::default()
        }
    }

    pub fn add_child(&mut self, child: SceneNode) -> &mut Self {
        self.children.push(child);
        self
    }
}

/// Scene roots plus the optional image-based lighting inputs.
#[derive(Clone, Debug, Default)]
pub struct Scene {
    pub roots: Vec<SceneNode>,
    pub environment: Option<Arc<EnvironmentMap>>,
    pub brdf_lut: Option<Arc<BrdfLut>>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: SceneNode) {
        self.roots.push(node);
    }

    pub fn add_mesh(&mut self, mesh: Mesh) {
        self.roots.push(SceneNode::with_mesh(mesh));
    }

    pub fn set_environment(&mut self, environment: Option<Arc<EnvironmentMap>>) {
        self.environment = environment;
    }

    /// Depth-first, pre-order, children in insertion order. Hidden subtrees
    /// are skipped entirely.
    pub fn visit_meshes<'a>(&'a self, mut f: impl FnMut(&'a Mesh)) {
        let mut stack: Vec<&'a SceneNode> = self.roots.iter().rev().collect();
        while let Some(node) = stack.pop() {
            if !node.visible {
                continue;
            }
            if let Some(mesh) = &node.mesh {
                f(mesh);
            }
            stack.extend(node.children.iter().rev());
        }
    }

    /// Appends every visible mesh to `out` (caller clears).
    pub fn collect_meshes<'a>(&'a self, out: &mut Vec<&'a Mesh>) {
        self.visit_meshes(|mesh| out.push(mesh));
    }

    pub fn mesh_count(&self) -> usize {
        let mut count = 0;
        self.visit_meshes(|_| count += 1);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::cube;

    fn mesh(name: &str) -> Mesh {
        Mesh::new(
            Arc::new(cube(1.0)),
            Arc::new(Material::basic([1.0; 4])),
            Mat4::IDENTITY,
        )
        .with_name(name)
    }

    #[test]
    fn traversal_is_preorder_and_skips_hidden_subtrees() {
        let mut root = SceneNode::with_mesh(mesh("root"));
        let mut hidden = SceneNode::with_mesh(mesh("hidden"));
        hidden.visible = false;
        hidden.add_child(SceneNode::with_mesh(mesh("hidden_child")));
        let mut group = SceneNode::new("group");
        group.add_child(SceneNode::with_mesh(mesh("a"))).add_child(SceneNode::with_mesh(mesh("b")));
        root.add_child(group).add_child(hidden);

        let mut scene = Scene::new();
        scene.add(root);
        scene.add_mesh(mesh("second_root"));

        let mut names = Vec::new();
        scene.visit_meshes(|m| names.push(m.name.clone()));
        assert_eq!(names, ["root", "a", "b", "second_root"]);
        assert_eq!(scene.mesh_count(), 4);
    }

    #[test]
    fn mesh_ids_are_unique() {
        assert_ne!(mesh("x").id(), mesh("x").id());
    }
}
