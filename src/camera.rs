// src/camera.rs
use glam::{Mat4, Vec3};

/// What the frame loop needs from a camera.
pub trait RenderCamera {
    fn projection_matrix(&self) -> Mat4;
    fn view_matrix(&self) -> Mat4;
    fn world_position(&self) -> Vec3;

    /// Combined projection * view (fed to the frustum culler).
    fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }
}

/// Perspective camera with position and Euler rotation (yaw, pitch).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    /// Radians about +Y; zero looks down +Z.
    pub yaw: f32,
    /// Radians above the horizon.
    pub pitch: f32,

    pub fovy: f32,
    pub aspect: f32,
    pub znear: f32,
    pub zfar: f32,
}

impl Camera {
    pub fn new(position: Vec3, yaw: f32, pitch: f32, fovy_radians: f32, aspect: f32, znear: f32, zfar: f32) -> Self {
        Self {
            position,
            yaw,
            pitch,
            fovy: fovy_radians,
            aspect,
            znear,
            zfar,
        }
    }

    /// Camera at `position` looking at `target`.
    pub fn looking_at(position: Vec3, target: Vec3, fovy_radians: f32, aspect: f32, znear: f32, zfar: f32) -> Self {
        let dir = (target - position).normalize_or_zero();
        let yaw = dir.x.atan2(dir.z);
        let pitch = dir.y.clamp(-1.0, 1.0).asin();
        Self::new(position, yaw, pitch, fovy_radians, aspect, znear, zfar)
    }

    /// Unit forward vector from yaw/pitch.
    pub fn forward(&self) -> Vec3 {
        let (sin_yaw, cos_yaw) = self.yaw.sin_cos();
        let (sin_pitch, cos_pitch) = self.pitch.sin_cos();
        Vec3::new(cos_pitch * sin_yaw, sin_pitch, cos_pitch * cos_yaw).normalize_or_zero()
    }

    /// Keep the projection in step with a resized surface.
    pub fn fit_surface(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.aspect = width as f32 / height as f32;
        }
    }
}

impl RenderCamera for Camera {
    /// Right-handed perspective with 0..1 clip depth.
    fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fovy, self.aspect, self.znear, self.zfar)
    }

    /// Right-handed, Y up.
    fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.position + self.forward(), Vec3::Y)
    }

    fn world_position(&self) -> Vec3 {
        self.position
    }
}
