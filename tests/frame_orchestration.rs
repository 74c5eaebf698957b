//! End-to-end frames against the headless device.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use glam::{Mat4, Vec3};
use render_orchestrator::geometry::cube;
use render_orchestrator::gpu::headless::{HeadlessFactory, HeadlessProbe};
use render_orchestrator::{
    Camera, FrameOutcome, Material, MaterialDescriptorRegistry, Mesh, RecoveryState, RenderFrameOrchestrator,
    RendererConfig, Scene,
};

fn camera() -> Camera {
    Camera::looking_at(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, 1.0, 16.0 / 9.0, 0.1, 100.0)
}

fn setup(config: RendererConfig) -> Result<(RenderFrameOrchestrator, HeadlessFactory)> {
    render_orchestrator::logging::init();
    let factory = HeadlessFactory::default();
    let renderer = RenderFrameOrchestrator::new(
        Box::new(factory.clone()),
        config,
        MaterialDescriptorRegistry::with_builtin(),
    )?;
    Ok((renderer, factory))
}

fn probe(factory: &HeadlessFactory) -> Result<HeadlessProbe> {
    factory.current().context("no device was created")
}

/// 40 cubes in an 8x5 grid in front of the camera, 10 behind it, cycling
/// through three materials.
fn fifty_mesh_scene() -> Scene {
    let geometry = Arc::new(cube(0.4));
    let materials = [
        Arc::new(Material::basic([1.0, 0.0, 0.0, 1.0])),
        Arc::new(Material::basic([0.0, 1.0, 0.0, 1.0])),
        Arc::new(Material::lambert([0.0, 0.0, 1.0, 1.0])),
    ];
    let mut scene = Scene::new();
    for i in 0..50usize {
        let position = if i < 40 {
            Vec3::new((i % 8) as f32 - 3.5, (i / 8) as f32 - 2.0, 0.0)
        } else {
            Vec3::new((i - 40) as f32, 0.0, 40.0)
        };
        let mesh = Mesh::new(
            geometry.clone(),
            materials[i % materials.len()].clone(),
            Mat4::from_translation(position),
        )
        .with_name(format!("mesh{i}"));
        scene.add_mesh(mesh);
    }
    scene
}

fn sync() -> RendererConfig {
    RendererConfig {
        async_pipeline_compilation: false,
        ..RendererConfig::default()
    }
}

#[test]
fn fifty_meshes_three_materials_ten_culled() -> Result<()> {
    let (mut renderer, factory) = setup(sync())?;
    let scene = fifty_mesh_scene();

    let outcome = renderer.render_frame(&scene, &camera());
    assert_eq!(outcome, FrameOutcome::Presented { draws: 40 });

    let stats = *renderer.last_frame_stats();
    assert_eq!(stats.total_meshes, 50);
    assert_eq!(stats.visible_meshes, 40);
    assert_eq!(stats.culled_meshes, 10);
    assert!(stats.batches <= 3, "{} batches", stats.batches);
    assert_eq!(stats.draw_calls, 40);
    assert_eq!(stats.triangles, 40 * 12);
    assert_eq!(stats.skipped.total(), 0);

    let probe = probe(&factory)?;
    assert_eq!(probe.counters().last_submit_draws, 40);
    assert_eq!(probe.counters().misaligned_offsets, 0);
    assert_eq!(probe.invalid_handle_uses(), 0);
    Ok(())
}

#[test]
fn second_frame_reuses_every_cache() -> Result<()> {
    let (mut renderer, factory) = setup(sync())?;
    let scene = fifty_mesh_scene();
    renderer.render_frame(&scene, &camera());
    let created = probe(&factory)?.counters();

    assert_eq!(renderer.render_frame(&scene, &camera()), FrameOutcome::Presented { draws: 40 });
    let after = probe(&factory)?.counters();
    assert_eq!(after.buffers_created, created.buffers_created);
    assert_eq!(after.pipelines_created, created.pipelines_created);

    let stats = renderer.last_frame_stats();
    assert_eq!(stats.pipeline_misses, 0);
    assert_eq!(stats.geometry_misses, 0);
    assert_eq!(stats.buffer_bytes_allocated, 0);
    Ok(())
}

#[test]
fn context_loss_mid_frame_recovers_on_the_next_frame() -> Result<()> {
    let (mut renderer, factory) = setup(sync())?;
    let scene = fifty_mesh_scene();
    renderer.render_frame(&scene, &camera());
    assert!(!renderer.pipeline_cache().is_empty());

    probe(&factory)?.lose_on_next_submit("driver reset");
    assert_eq!(renderer.render_frame(&scene, &camera()), FrameOutcome::ContextLost);
    assert_eq!(renderer.recovery_state(), RecoveryState::Recovering);
    assert!(renderer.pipeline_cache().is_empty());
    assert!(renderer.geometry_cache().is_empty());
    assert_eq!(renderer.pool_stats().live_bytes, 0);
    assert!(renderer.environment_binding().is_none());

    assert_eq!(renderer.render_frame(&scene, &camera()), FrameOutcome::Presented { draws: 40 });
    assert_eq!(renderer.recovery_state(), RecoveryState::Healthy);
    assert_eq!(renderer.recovery().loss_count(), 1);
    assert_eq!(factory.devices_created(), 2);

    let fresh = probe(&factory)?;
    assert!(!fresh.is_lost());
    assert_eq!(fresh.invalid_handle_uses(), 0);
    assert_eq!(fresh.counters().last_submit_draws, 40);
    Ok(())
}

#[test]
fn loss_between_frames_is_seen_at_the_frame_boundary() -> Result<()> {
    let (mut renderer, factory) = setup(sync())?;
    let scene = fifty_mesh_scene();
    renderer.render_frame(&scene, &camera());

    probe(&factory)?.lose("surface reset");
    // Teardown and re-creation both happen before this frame renders.
    assert_eq!(renderer.render_frame(&scene, &camera()), FrameOutcome::Presented { draws: 40 });
    assert_eq!(renderer.recovery().recoveries(), 1);
    assert_eq!(probe(&factory)?.invalid_handle_uses(), 0);
    Ok(())
}

#[test]
fn draws_beyond_the_uniform_budget_are_dropped() -> Result<()> {
    let config = RendererConfig {
        max_draws_per_frame: 16,
        ..sync()
    };
    let (mut renderer, factory) = setup(config)?;
    let scene = fifty_mesh_scene();

    assert_eq!(renderer.render_frame(&scene, &camera()), FrameOutcome::Presented { draws: 16 });
    let stats = renderer.last_frame_stats();
    assert_eq!(stats.skipped.uniform_budget, 24);
    assert_eq!(probe(&factory)?.counters().last_submit_draws, 16);
    Ok(())
}

#[test]
fn pending_pipelines_skip_meshes_until_ready() -> Result<()> {
    let (mut renderer, factory) = setup(RendererConfig::default())?;
    probe(&factory)?.set_pipeline_latency(1);
    let scene = fifty_mesh_scene();

    assert_eq!(renderer.render_frame(&scene, &camera()), FrameOutcome::Presented { draws: 0 });
    assert_eq!(renderer.last_frame_stats().skipped.pipeline_pending, 40);

    assert_eq!(renderer.render_frame(&scene, &camera()), FrameOutcome::Presented { draws: 40 });
    assert_eq!(renderer.pipeline_cache().stats().pending, 0);
    Ok(())
}

#[test]
fn allocation_failures_raise_a_warning_after_consecutive_frames() -> Result<()> {
    let config = RendererConfig {
        allocation_warning_threshold: 2,
        ..sync()
    };
    let (mut renderer, factory) = setup(config)?;
    // The uniform buffer already exists; geometry uploads now fail.
    probe(&factory)?.set_buffer_budget(Some(0));
    let scene = fifty_mesh_scene();

    renderer.render_frame(&scene, &camera());
    assert_eq!(renderer.last_frame_stats().skipped.allocation_failure, 40);
    assert!(!renderer.stats_tracker().allocation_warning());
    renderer.render_frame(&scene, &camera());
    assert!(renderer.stats_tracker().allocation_warning());

    probe(&factory)?.set_buffer_budget(None);
    assert_eq!(renderer.render_frame(&scene, &camera()), FrameOutcome::Presented { draws: 40 });
    assert!(!renderer.stats_tracker().allocation_warning());
    Ok(())
}

#[test]
fn dispose_is_final() -> Result<()> {
    let (mut renderer, factory) = setup(sync())?;
    let scene = fifty_mesh_scene();
    renderer.render_frame(&scene, &camera());
    renderer.dispose();
    renderer.dispose();

    let probe = probe(&factory)?;
    assert_eq!(probe.live_buffers(), 0);
    assert_eq!(probe.live_pipelines(), 0);
    assert!(renderer.is_disposed());
    assert!(matches!(renderer.render_frame(&scene, &camera()), FrameOutcome::Skipped(_)));
    assert_eq!(probe.counters().submits, 1);
    Ok(())
}
