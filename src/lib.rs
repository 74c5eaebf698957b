// src/lib.rs
//! Real-time frame orchestration over a narrow GPU device contract.
//!
//! [`RenderFrameOrchestrator`] turns a [`Scene`] and a camera into one
//! submitted frame: frustum culling, batching by material and render state,
//! cached geometry buffers, deduplicated pipelines, a dynamic-offset uniform
//! buffer and an image-based-lighting environment binding. Device loss is
//! detected at frame boundaries and recovered from without restarting.
//!
//! ```no_run
//! use std::sync::Arc;
//! use glam::{Mat4, Vec3};
//! use render_orchestrator::{
//!     geometry::cube, gpu::headless::HeadlessFactory, Camera, Material,
//!     MaterialDescriptorRegistry, Mesh, RenderFrameOrchestrator, RendererConfig, Scene,
//! };
//!
//! # fn main() -> render_orchestrator::Result<()> {
//! render_orchestrator::logging::init();
//! let mut renderer = RenderFrameOrchestrator::new(
//!     Box::new(HeadlessFactory::default()),
//!     RendererConfig::default(),
//!     MaterialDescriptorRegistry::with_builtin(),
//! )?;
//! let mut scene = Scene::new();
//! scene.add_mesh(Mesh::new(
//!     Arc::new(cube(0.5)),
//!     Arc::new(Material::basic([1.0, 0.5, 0.2, 1.0])),
//!     Mat4::IDENTITY,
//! ));
//! let camera = Camera::looking_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, 1.0, 16.0 / 9.0, 0.1, 100.0);
//! let outcome = renderer.render_frame(&scene, &camera);
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

pub mod batching;
pub mod bind_group_manager;
pub mod camera;
pub mod config;
pub mod context;
pub mod culling;
pub mod environment;
pub mod error;
pub mod geometry;
pub mod geometry_cache;
pub mod gpu;
pub mod logging;
pub mod materials;
pub mod pipeline_cache;
pub mod recovery;
pub mod renderer;
pub mod scene;
pub mod stats;
pub mod texture;
pub mod uniforms;

pub use camera::{Camera, RenderCamera};
pub use config::{ClipDepthRange, PoolConfig, RendererConfig};
pub use environment::{BrdfLut, EnvironmentMap};
pub use error::{ErrorKind, RenderError, Result};
pub use geometry::{GeometryData, GeometryKind};
pub use gpu::{DeviceFactory, GpuDevice};
pub use materials::material_system::MaterialDescriptorRegistry;
pub use materials::{Material, MaterialKind};
pub use recovery::RecoveryState;
pub use renderer::{FrameOutcome, FrameSkipReason, RenderFrameOrchestrator};
pub use scene::{Mesh, Scene, SceneNode};
pub use stats::{FrameStats, MeshSkipReason};
