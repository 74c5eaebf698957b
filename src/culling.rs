//! # Frustum Culling
//!
//! * **Plane extraction** – Gribb–Hartmann row combinations of the
//!   view-projection matrix, each plane normalised so signed distances are
//!   in world units.
//! * **Sphere test** – the geometry's local bounding sphere is moved to world
//!   space and its radius scaled by the largest axis scale of the transform.
//! * **Statistics** – `total / culled / visible`, reset on every cull call.
//!
//! A sphere with zero or non-finite radius (or no sphere at all) is never
//! culled.

use glam::{Mat4, Vec3, Vec4};

use crate::camera::RenderCamera;
use crate::config::ClipDepthRange;
use crate::geometry::BoundingSphere;
use crate::scene::{Mesh, Scene};

// ---------------------------------------------------------------------------
// Public API Types
// ---------------------------------------------------------------------------

/// Per-call culling counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CullStats {
    pub total: usize,
    pub culled: usize,
    pub visible: usize,
}

/// Six planes `(normal, distance)`: left, right, bottom, top, near, far.
/// A point is inside when `normal · p + distance >= 0` for every plane.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Frustum {
    planes: [Vec4; 6],
}

impl Default for Frustum {
    /// Accepts everything until planes are extracted.
    fn default() -> Self {
        Self {
            planes: [Vec4::new(0.0, 0.0, 0.0, f32::INFINITY); 6],
        }
    }
}

impl Frustum {
    pub fn from_view_projection(view_projection: &Mat4, depth_range: ClipDepthRange) -> Self {
        Self {
            planes: extract_frustum_planes(view_projection, depth_range),
        }
    }

    #[inline]
    pub fn planes(&self) -> &[Vec4; 6] {
        &self.planes
    }

    /// Culled only when the sphere lies fully behind some plane.
    #[inline]
    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        sphere_in_frustum(center, radius, &self.planes)
    }
}

// ---------------------------------------------------------------------------
// Culler
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct FrustumCuller {
    depth_range: ClipDepthRange,
    frustum: Frustum,
    stats: CullStats,
}

impl FrustumCuller {
    pub fn new(depth_range: ClipDepthRange) -> Self {
        Self {
            depth_range,
            frustum: Frustum::default(),
            stats: CullStats::default(),
        }
    }

    pub fn extract_planes(&mut self, view_projection: &Mat4) {
        self.frustum = Frustum::from_view_projection(view_projection, self.depth_range);
    }

    #[inline]
    pub fn frustum(&self) -> &Frustum {
        &self.frustum
    }

    #[inline]
    pub fn stats(&self) -> CullStats {
        self.stats
    }

    pub fn is_visible(&self, mesh: &Mesh) -> bool {
        match mesh.geometry.bounding_sphere() {
            Some(sphere) => self.is_sphere_visible(sphere, &mesh.world_transform),
            None => true,
        }
    }

    /// `sphere` is in the local space of `world`.
    pub fn is_sphere_visible(&self, sphere: BoundingSphere, world: &Mat4) -> bool {
        if !sphere.radius.is_finite() || sphere.radius <= 0.0 {
            return true;
        }
        let center = world.transform_point3(sphere.center);
        let radius = sphere.radius * max_axis_scale(world);
        if !center.is_finite() || !radius.is_finite() {
            return true;
        }
        self.frustum.intersects_sphere(center, radius)
    }

    /// Extract planes from `camera` and append the visible meshes of `scene`
    /// to `out` in traversal order.
    pub fn cull_scene<'a>(&mut self, scene: &'a Scene, camera: &dyn RenderCamera, out: &mut Vec<&'a Mesh>) {
        self.extract_planes(&camera.view_projection_matrix());
        let mut stats = CullStats::default();
        let culler = &*self;
        scene.visit_meshes(|mesh| {
            stats.total += 1;
            if culler.is_visible(mesh) {
                stats.visible += 1;
                out.push(mesh);
            } else {
                stats.culled += 1;
            }
        });
        self.stats = stats;
    }

    /// Cull an explicit list against the current planes.
    pub fn cull_objects<'a>(&mut self, meshes: &[&'a Mesh], out: &mut Vec<&'a Mesh>) {
        let mut visible = 0;
        for &mesh in meshes {
            if self.is_visible(mesh) {
                visible += 1;
                out.push(mesh);
            }
        }
        self.stats = CullStats {
            total: meshes.len(),
            culled: meshes.len() - visible,
            visible,
        };
    }
}

// ---------------------------------------------------------------------------
// Helper functions (math)
// ---------------------------------------------------------------------------

/// Normalised frustum planes from a combined view-projection matrix.
fn extract_frustum_planes(vp: &Mat4, depth_range: ClipDepthRange) -> [Vec4; 6] {
    let (r0, r1, r2, r3) = (vp.row(0), vp.row(1), vp.row(2), vp.row(3));
    let near = match depth_range {
        ClipDepthRange::ZeroToOne => r2,
        ClipDepthRange::NegativeOneToOne => r3 + r2,
    };
    [r3 + r0, r3 - r0, r3 + r1, r3 - r1, near, r3 - r2].map(normalize_plane)
}

fn normalize_plane(plane: Vec4) -> Vec4 {
    let len = plane.truncate().length();
    if len > f32::EPSILON {
        plane / len
    } else {
        plane
    }
}

fn sphere_in_frustum(center: Vec3, radius: f32, planes: &[Vec4; 6]) -> bool {
    planes
        .iter()
        .all(|p| p.truncate().dot(center) + p.w >= -radius)
}

fn max_axis_scale(world: &Mat4) -> f32 {
    world
        .x_axis
        .truncate()
        .length()
        .max(world.y_axis.truncate().length())
        .max(world.z_axis.truncate().length())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Camera;
    use crate::geometry::{GeometryData, GeometryKind};
    use crate::materials::Material;
    use std::sync::Arc;

    fn camera() -> Camera {
        // At z = 5 looking down -Z, near 0.1, far 100.
        Camera::looking_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, 1.0, 1.0, 0.1, 100.0)
    }

    fn culler() -> FrustumCuller {
        let mut culler = FrustumCuller::new(ClipDepthRange::ZeroToOne);
        culler.extract_planes(&camera().view_projection_matrix());
        culler
    }

    fn sphere(radius: f32) -> BoundingSphere {
        BoundingSphere {
            center: Vec3::ZERO,
            radius,
        }
    }

    fn mesh_at(position: Vec3) -> Mesh {
        let geometry = GeometryData::new(GeometryKind::Mesh, vec![[-1.0, -1.0, -1.0], [1.0, 1.0, 1.0]]);
        Mesh::new(
            Arc::new(geometry),
            Arc::new(Material::basic([1.0; 4])),
            Mat4::from_translation(position),
        )
    }

    #[test]
    fn planes_are_normalized() {
        for plane in culler().frustum().planes() {
            assert!((plane.truncate().length() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn inside_sphere_is_visible() {
        let c = culler();
        assert!(c.is_sphere_visible(sphere(1.0), &Mat4::IDENTITY));
        assert!(c.is_sphere_visible(sphere(0.5), &Mat4::from_translation(Vec3::new(0.0, 0.0, -50.0))));
    }

    #[test]
    fn sphere_beyond_a_plane_is_culled() {
        let c = culler();
        // Behind the camera.
        assert!(!c.is_sphere_visible(sphere(1.0), &Mat4::from_translation(Vec3::new(0.0, 0.0, 20.0))));
        // Far to the side.
        assert!(!c.is_sphere_visible(sphere(1.0), &Mat4::from_translation(Vec3::new(500.0, 0.0, 0.0))));
        // Past the far plane.
        assert!(!c.is_sphere_visible(sphere(1.0), &Mat4::from_translation(Vec3::new(0.0, 0.0, -200.0))));
    }

    #[test]
    fn straddling_sphere_is_visible() {
        let c = culler();
        // Centre just outside the right plane, radius reaching back in.
        let world = Mat4::from_translation(Vec3::new(3.5, 0.0, 0.0));
        assert!(c.is_sphere_visible(sphere(2.0), &world));
    }

    #[test]
    fn scale_grows_the_radius() {
        let c = culler();
        let outside = Mat4::from_translation(Vec3::new(12.0, 0.0, 0.0));
        assert!(!c.is_sphere_visible(sphere(1.0), &outside));
        let scaled = outside * Mat4::from_scale(Vec3::splat(10.0));
        assert!(c.is_sphere_visible(sphere(1.0), &scaled));
    }

    #[test]
    fn zero_or_undefined_radius_is_never_culled() {
        let c = culler();
        let far_away = Mat4::from_translation(Vec3::new(1e4, 0.0, 0.0));
        assert!(c.is_sphere_visible(sphere(0.0), &far_away));
        assert!(c.is_sphere_visible(sphere(f32::NAN), &far_away));
        assert!(c.is_sphere_visible(sphere(f32::INFINITY), &far_away));
    }

    #[test]
    fn near_plane_follows_depth_range() {
        let view = camera().view_matrix();
        let gl = Mat4::perspective_rh_gl(1.0, 1.0, 0.1, 100.0) * view;
        let mut culler = FrustumCuller::new(ClipDepthRange::NegativeOneToOne);
        culler.extract_planes(&gl);
        let near = culler.frustum().planes()[4];
        // The near plane sits 0.1 in front of the camera at z = 4.9.
        assert!((near.truncate().dot(Vec3::new(0.0, 0.0, 4.9)) + near.w).abs() < 1e-3);

        let mut wgpu_style = FrustumCuller::new(ClipDepthRange::ZeroToOne);
        wgpu_style.extract_planes(&camera().view_projection_matrix());
        let near = wgpu_style.frustum().planes()[4];
        assert!((near.truncate().dot(Vec3::new(0.0, 0.0, 4.9)) + near.w).abs() < 1e-3);
    }

    #[test]
    fn stats_reset_per_call() {
        let mut scene = Scene::new();
        scene.add_mesh(mesh_at(Vec3::ZERO));
        scene.add_mesh(mesh_at(Vec3::new(0.0, 0.0, 30.0)));
        scene.add_mesh(mesh_at(Vec3::new(0.0, 1.0, 0.0)));

        let mut culler = FrustumCuller::new(ClipDepthRange::ZeroToOne);
        let mut out = Vec::new();
        culler.cull_scene(&scene, &camera(), &mut out);
        assert_eq!(culler.stats(), CullStats { total: 3, culled: 1, visible: 2 });
        assert_eq!(out.len(), 2);

        let first = [out[0]];
        let mut again = Vec::new();
        culler.cull_objects(&first, &mut again);
        assert_eq!(culler.stats(), CullStats { total: 1, culled: 0, visible: 1 });
    }
}
