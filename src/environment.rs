// src/environment.rs
//! Image-based lighting inputs and their GPU binding.
//!
//! [`EnvironmentMap`] and [`BrdfLut`] are CPU-side descriptors owned by the
//! scene. [`EnvironmentBindingManager`] turns them into one bind group
//! (cube view, sampler, BRDF view, BRDF sampler) and keeps it until the
//! environment identity, its version, or the BRDF identity changes.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::bind_group_manager::{BindGroupBuilder, BindGroupManager};
use crate::error::{RenderError, Result};
use crate::gpu::{
    BindGroupId, BindGroupLayoutId, GpuDevice, SamplerDesc, SamplerId, TextureDesc, TextureId,
    TextureViewDesc, TextureViewId, TextureWrite,
};
use crate::texture::{f32_to_f16_bytes, max_mip_levels, mip_extent, pad_rows};

pub const CUBE_FACES: usize = 6;
pub const ENVIRONMENT_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;
pub const BRDF_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rg16Float;
/// (scale, bias) written when no usable lookup table is supplied.
pub const FALLBACK_BRDF: [f32; 2] = [1.0, 0.0];

static NEXT_ENVIRONMENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EnvironmentId(pub u64);

impl EnvironmentId {
    fn next() -> Self {
        Self(NEXT_ENVIRONMENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inputs
// ─────────────────────────────────────────────────────────────────────────────

/// One mip level: six faces of RGBA `f32` texels, `+X -X +Y -Y +Z -Z`.
pub type CubeMip = [Vec<f32>; CUBE_FACES];

/// Prefiltered cubemap. Mip 0 is `width`×`height`; each following level
/// halves the extent.
#[derive(Debug, Clone)]
pub struct EnvironmentMap {
    id: EnvironmentId,
    version: u64,
    width: u32,
    height: u32,
    mips: Vec<CubeMip>,
}

impl EnvironmentMap {
    pub fn new(width: u32, height: u32, mips: Vec<CubeMip>) -> Self {
        Self {
            id: EnvironmentId::next(),
            version: 1,
            width,
            height,
            mips,
        }
    }

    /// Full chain of a single colour, handy for tests and placeholder skies.
    pub fn uniform(size: u32, color: [f32; 4]) -> Self {
        let levels = max_mip_levels(size, size);
        let mips = (0..levels)
            .map(|level| {
                let extent = mip_extent(size, level) as usize;
                let face: Vec<f32> = color.repeat(extent * extent);
                std::array::from_fn(|_| face.clone())
            })
            .collect();
        Self::new(size, size, mips)
    }

    #[inline]
    pub fn id(&self) -> EnvironmentId {
        self.id
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn mip_count(&self) -> u32 {
        self.mips.len() as u32
    }

    #[inline]
    pub fn mips(&self) -> &[CubeMip] {
        &self.mips
    }

    /// Replace the texel data; bumps the version.
    pub fn set_mips(&mut self, width: u32, height: u32, mips: Vec<CubeMip>) {
        self.width = width;
        self.height = height;
        self.mips = mips;
        self.version += 1;
    }
}

/// Split-sum BRDF lookup table: `width`×`height` RG `f32` pairs.
#[derive(Debug, Clone)]
pub struct BrdfLut {
    id: EnvironmentId,
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl BrdfLut {
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Self {
        Self {
            id: EnvironmentId::next(),
            width,
            height,
            data,
        }
    }

    #[inline]
    pub fn id(&self) -> EnvironmentId {
        self.id
    }

    fn is_well_formed(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() == (self.width * self.height * 2) as usize
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Binding
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvironmentBinding {
    pub bind_group: BindGroupId,
    pub layout: BindGroupLayoutId,
    pub mip_level_count: u32,
    /// The 1×1 fallback stands in for a missing or malformed LUT.
    pub brdf_synthesized: bool,
    /// Some supplied mips were dropped (malformed or beyond the full chain).
    pub mips_truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BindingKey {
    environment: EnvironmentId,
    version: u64,
    brdf: Option<EnvironmentId>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EnvironmentStats {
    pub uploads: u64,
    pub hits: u64,
    /// Malformed environments rejected by validation (once per version).
    pub rejections: u64,
    pub bytes_allocated: u64,
    pub bytes_destroyed: u64,
}

/// Everything one binding owns. Filled progressively so a failed build can
/// destroy exactly what it created.
#[derive(Debug, Default)]
struct EnvironmentResources {
    cube: Option<TextureId>,
    cube_view: Option<TextureViewId>,
    cube_sampler: Option<SamplerId>,
    brdf: Option<TextureId>,
    brdf_view: Option<TextureViewId>,
    bind_group: Option<BindGroupId>,
    bytes: u64,
}

impl EnvironmentResources {
    fn destroy(self, device: &mut dyn GpuDevice) {
        if let Some(group) = self.bind_group {
            device.destroy_bind_group(group);
        }
        if let Some(view) = self.brdf_view {
            device.destroy_texture_view(view);
        }
        if let Some(texture) = self.brdf {
            device.destroy_texture(texture);
        }
        if let Some(sampler) = self.cube_sampler {
            device.destroy_sampler(sampler);
        }
        if let Some(view) = self.cube_view {
            device.destroy_texture_view(view);
        }
        if let Some(texture) = self.cube {
            device.destroy_texture(texture);
        }
    }
}

#[derive(Debug)]
struct CachedEnvironment {
    key: BindingKey,
    binding: EnvironmentBinding,
    resources: EnvironmentResources,
}

#[derive(Debug, Default)]
pub struct EnvironmentBindingManager {
    current: Option<CachedEnvironment>,
    /// Last key that failed validation; not retried until it changes.
    rejected: Option<BindingKey>,
    /// Shared by every BRDF binding; recreated after device loss.
    brdf_sampler: Option<SamplerId>,
    stats: EnvironmentStats,
    half_scratch: Vec<u8>,
    row_scratch: Vec<u8>,
}

impl EnvironmentBindingManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the sampler every BRDF binding shares. No-op while it exists.
    pub fn create_default_samplers(&mut self, device: &mut dyn GpuDevice) -> Result<()> {
        if self.brdf_sampler.is_none() {
            let desc = SamplerDesc {
                lod_max_clamp: 0.0,
                ..SamplerDesc::linear_clamp("brdf_lut_sampler")
            };
            self.brdf_sampler = Some(device.create_sampler(&desc)?);
        }
        Ok(())
    }

    /// Binding for `environment`, uploading on first use or identity change.
    /// `None` means there is nothing to bind, including an environment whose
    /// current version was already rejected as malformed.
    pub fn prepare(
        &mut self,
        device: &mut dyn GpuDevice,
        bind_groups: &mut BindGroupManager,
        environment: Option<&EnvironmentMap>,
        brdf: Option<&BrdfLut>,
    ) -> Result<Option<&EnvironmentBinding>> {
        let Some(environment) = environment else {
            return Ok(None);
        };
        let key = BindingKey {
            environment: environment.id(),
            version: environment.version(),
            brdf: brdf.map(BrdfLut::id),
        };

        if self.rejected == Some(key) {
            return Ok(None);
        }
        let hit = self.current.as_ref().is_some_and(|cached| cached.key == key);
        if hit {
            self.stats.hits += 1;
        } else {
            if let Some(stale) = self.current.take() {
                log::debug!(
                    "EnvironmentBindingManager: environment #{} changed, re-uploading",
                    stale.key.environment.0
                );
                self.stats.bytes_destroyed += stale.resources.bytes;
                stale.resources.destroy(device);
            }
            let cached = match self.build(device, bind_groups, key, environment, brdf) {
                Ok(cached) => cached,
                Err(err) => {
                    if matches!(err.root(), RenderError::InvalidEnvironment { .. }) {
                        self.stats.rejections += 1;
                        self.rejected = Some(key);
                    }
                    return Err(err);
                }
            };
            self.rejected = None;
            self.stats.uploads += 1;
            self.stats.bytes_allocated += cached.resources.bytes;
            self.current = Some(cached);
        }
        Ok(self.current.as_ref().map(|cached| &cached.binding))
    }

    pub fn binding(&self) -> Option<&EnvironmentBinding> {
        self.current.as_ref().map(|cached| &cached.binding)
    }

    pub fn stats(&self) -> EnvironmentStats {
        self.stats
    }

    /// Forget every handle without destroying (device already gone).
    pub fn clear(&mut self) {
        if let Some(stale) = self.current.take() {
            self.stats.bytes_destroyed += stale.resources.bytes;
        }
        self.brdf_sampler = None;
        self.rejected = None;
    }

    pub fn dispose(&mut self, device: &mut dyn GpuDevice) {
        if let Some(stale) = self.current.take() {
            self.stats.bytes_destroyed += stale.resources.bytes;
            stale.resources.destroy(device);
        }
        if let Some(sampler) = self.brdf_sampler.take() {
            device.destroy_sampler(sampler);
        }
    }

    fn build(
        &mut self,
        device: &mut dyn GpuDevice,
        bind_groups: &mut BindGroupManager,
        key: BindingKey,
        environment: &EnvironmentMap,
        brdf: Option<&BrdfLut>,
    ) -> Result<CachedEnvironment> {
        let (usable, mips_truncated) = validate_environment(environment)?;
        self.create_default_samplers(device)?;

        let mut resources = EnvironmentResources::default();
        match self.upload(device, bind_groups, &mut resources, environment, usable, brdf) {
            Ok((layout, brdf_synthesized)) => {
                let binding = EnvironmentBinding {
                    bind_group: resources.bind_group.ok_or_else(|| RenderError::msg("environment bind group missing"))?,
                    layout,
                    mip_level_count: usable,
                    brdf_synthesized,
                    mips_truncated,
                };
                log::info!(
                    "EnvironmentBindingManager: uploaded environment #{} ({}x{}, {} mips, {} bytes)",
                    environment.id().0,
                    environment.width(),
                    environment.height(),
                    usable,
                    resources.bytes
                );
                Ok(CachedEnvironment { key, binding, resources })
            }
            Err(err) => {
                resources.destroy(device);
                Err(err.context(format!("uploading environment #{}", environment.id().0)))
            }
        }
    }

    /// Returns the bind group layout and whether the BRDF was synthesized.
    fn upload(
        &mut self,
        device: &mut dyn GpuDevice,
        bind_groups: &mut BindGroupManager,
        resources: &mut EnvironmentResources,
        environment: &EnvironmentMap,
        mip_count: u32,
        brdf: Option<&BrdfLut>,
    ) -> Result<(BindGroupLayoutId, bool)> {
        let pitch = device.limits().texture_row_pitch_alignment;
        let size = environment.width();

        let cube_desc = TextureDesc {
            label: "environment_cube".into(),
            width: size,
            height: size,
            depth_or_array_layers: CUBE_FACES as u32,
            mip_level_count: mip_count,
            sample_count: 1,
            format: ENVIRONMENT_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        };
        let cube = device.create_texture(&cube_desc)?;
        resources.cube = Some(cube);
        resources.bytes += cube_desc.size_bytes();

        for (level, faces) in environment.mips().iter().take(mip_count as usize).enumerate() {
            let extent = mip_extent(size, level as u32);
            for (face, texels) in faces.iter().enumerate() {
                f32_to_f16_bytes(texels, &mut self.half_scratch);
                let bytes_per_row = pad_rows(&self.half_scratch, extent * 8, extent, pitch, &mut self.row_scratch);
                device.write_texture(
                    &TextureWrite {
                        texture: cube,
                        mip_level: level as u32,
                        layer: face as u32,
                        width: extent,
                        height: extent,
                        bytes_per_row,
                        rows_per_image: extent,
                    },
                    &self.row_scratch,
                )?;
            }
        }

        let cube_view = device.create_texture_view(
            cube,
            &TextureViewDesc {
                mip_level_count: Some(mip_count),
                array_layer_count: Some(CUBE_FACES as u32),
                ..TextureViewDesc::new("environment_cube_view", wgpu::TextureViewDimension::Cube)
            },
        )?;
        resources.cube_view = Some(cube_view);

        let cube_sampler = device.create_sampler(&SamplerDesc {
            lod_max_clamp: mip_count.saturating_sub(1) as f32,
            ..SamplerDesc::linear_clamp("environment_sampler")
        })?;
        resources.cube_sampler = Some(cube_sampler);

        let usable_brdf = brdf.filter(|lut| lut.is_well_formed());
        if let Some(lut) = brdf.filter(|lut| !lut.is_well_formed()) {
            log::warn!(
                "EnvironmentBindingManager: BRDF LUT #{} is {}x{} with {} values; using the 1x1 fallback",
                lut.id.0,
                lut.width,
                lut.height,
                lut.data.len()
            );
        }
        let (brdf_width, brdf_height, brdf_data) = match usable_brdf {
            Some(lut) => (lut.width, lut.height, lut.data.as_slice()),
            None => (1, 1, FALLBACK_BRDF.as_slice()),
        };
        let brdf_desc = TextureDesc {
            label: "brdf_lut".into(),
            width: brdf_width,
            height: brdf_height,
            depth_or_array_layers: 1,
            mip_level_count: 1,
            sample_count: 1,
            format: BRDF_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        };
        let brdf_texture = device.create_texture(&brdf_desc)?;
        resources.brdf = Some(brdf_texture);
        resources.bytes += brdf_desc.size_bytes();

        f32_to_f16_bytes(brdf_data, &mut self.half_scratch);
        let bytes_per_row = pad_rows(&self.half_scratch, brdf_width * 4, brdf_height, pitch, &mut self.row_scratch);
        device.write_texture(
            &TextureWrite {
                texture: brdf_texture,
                mip_level: 0,
                layer: 0,
                width: brdf_width,
                height: brdf_height,
                bytes_per_row,
                rows_per_image: brdf_height,
            },
            &self.row_scratch,
        )?;
        let brdf_view = device.create_texture_view(
            brdf_texture,
            &TextureViewDesc::new("brdf_lut_view", wgpu::TextureViewDimension::D2),
        )?;
        resources.brdf_view = Some(brdf_view);

        let brdf_sampler = self.brdf_sampler.ok_or_else(|| RenderError::msg("BRDF sampler missing"))?;
        let (layout, group) = BindGroupBuilder::new(bind_groups, "environment")
            .add_texture(0, cube_view, wgpu::TextureViewDimension::Cube)
            .add_sampler(1, cube_sampler)
            .add_texture(2, brdf_view, wgpu::TextureViewDimension::D2)
            .add_sampler(3, brdf_sampler)
            .build(device)?;
        resources.bind_group = Some(group);
        Ok((layout, usable_brdf.is_none()))
    }
}

/// Number of uploadable mips and whether the supplied chain was cut short.
fn validate_environment(environment: &EnvironmentMap) -> Result<(u32, bool)> {
    let invalid = |reason: String| RenderError::InvalidEnvironment {
        environment: environment.id().0,
        reason,
    };
    let (width, height) = (environment.width(), environment.height());
    if width == 0 || width != height {
        return Err(invalid(format!("cube faces must be square and non-empty, got {width}x{height}")));
    }
    if environment.mips().is_empty() {
        return Err(invalid("no mip levels supplied".into()));
    }

    let full_chain = max_mip_levels(width, height);
    let mut usable = 0;
    for (level, faces) in environment.mips().iter().enumerate().take(full_chain as usize) {
        let extent = mip_extent(width, level as u32) as usize;
        let expected = extent * extent * 4;
        if let Some(face) = faces.iter().position(|texels| texels.len() != expected) {
            log::warn!(
                "environment #{}: mip {level} face {face} has {} values, expected {expected}; truncating chain",
                environment.id().0,
                faces[face].len()
            );
            break;
        }
        usable += 1;
    }
    if usable == 0 {
        return Err(invalid("mip 0 is malformed".into()));
    }
    Ok((usable, usable < environment.mip_count()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::HeadlessDevice;

    fn prepare_once(
        manager: &mut EnvironmentBindingManager,
        device: &mut HeadlessDevice,
        bind_groups: &mut BindGroupManager,
        environment: &EnvironmentMap,
        brdf: Option<&BrdfLut>,
    ) -> EnvironmentBinding {
        *manager
            .prepare(device, bind_groups, Some(environment), brdf)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn missing_environment_yields_none() {
        let mut device = HeadlessDevice::new();
        let mut bind_groups = BindGroupManager::new();
        let mut manager = EnvironmentBindingManager::new();
        assert!(manager.prepare(&mut device, &mut bind_groups, None, None).unwrap().is_none());
        assert_eq!(device.probe().live_textures(), 0);
    }

    #[test]
    fn uploads_every_mip_of_every_face_once() {
        let mut device = HeadlessDevice::new();
        let probe = device.probe();
        let mut bind_groups = BindGroupManager::new();
        let mut manager = EnvironmentBindingManager::new();
        let environment = EnvironmentMap::uniform(16, [0.5, 0.5, 1.0, 1.0]);

        let binding = prepare_once(&mut manager, &mut device, &mut bind_groups, &environment, None);
        assert_eq!(binding.mip_level_count, 5);
        assert!(binding.brdf_synthesized);
        assert!(!binding.mips_truncated);
        // 5 mips x 6 faces + the fallback LUT.
        assert_eq!(probe.counters().texture_writes, 31);
        assert_eq!(binding.layout, bind_groups.environment_layout(&mut device).unwrap());

        let again = prepare_once(&mut manager, &mut device, &mut bind_groups, &environment, None);
        assert_eq!(again, binding);
        assert_eq!(probe.counters().texture_writes, 31);
        assert_eq!(manager.stats().uploads, 1);
        assert_eq!(manager.stats().hits, 1);
    }

    #[test]
    fn version_or_brdf_change_rebuilds() {
        let mut device = HeadlessDevice::new();
        let probe = device.probe();
        let mut bind_groups = BindGroupManager::new();
        let mut manager = EnvironmentBindingManager::new();
        let mut environment = EnvironmentMap::uniform(4, [1.0; 4]);
        let first = prepare_once(&mut manager, &mut device, &mut bind_groups, &environment, None);

        let lut = BrdfLut::new(2, 2, vec![0.5; 8]);
        let with_lut = prepare_once(&mut manager, &mut device, &mut bind_groups, &environment, Some(&lut));
        assert_ne!(with_lut.bind_group, first.bind_group);
        assert!(!with_lut.brdf_synthesized);

        let mips = EnvironmentMap::uniform(4, [0.0; 4]).mips().to_vec();
        environment.set_mips(4, 4, mips);
        prepare_once(&mut manager, &mut device, &mut bind_groups, &environment, Some(&lut));
        assert_eq!(manager.stats().uploads, 3);
        // Only the live binding's cube and LUT remain.
        assert_eq!(probe.live_textures(), 2);
        assert_eq!(probe.invalid_handle_uses(), 0);
    }

    #[test]
    fn rows_are_padded_for_the_device() {
        let mut device = HeadlessDevice::new();
        let mut bind_groups = BindGroupManager::new();
        let mut manager = EnvironmentBindingManager::new();
        // 8 texels * 8 bytes = 64-byte rows, far below the 256-byte pitch.
        let environment = EnvironmentMap::uniform(8, [0.25; 4]);
        prepare_once(&mut manager, &mut device, &mut bind_groups, &environment, None);
        assert!(manager.stats().bytes_allocated > 0);
    }

    #[test]
    fn malformed_mips_truncate_the_chain() {
        let mut device = HeadlessDevice::new();
        let mut bind_groups = BindGroupManager::new();
        let mut manager = EnvironmentBindingManager::new();
        let mut mips = EnvironmentMap::uniform(8, [1.0; 4]).mips().to_vec();
        mips[2][3].truncate(3);
        let environment = EnvironmentMap::new(8, 8, mips);
        let binding = prepare_once(&mut manager, &mut device, &mut bind_groups, &environment, None);
        assert_eq!(binding.mip_level_count, 2);
        assert!(binding.mips_truncated);
    }

    #[test]
    fn non_square_faces_are_rejected() {
        let mut device = HeadlessDevice::new();
        let mut bind_groups = BindGroupManager::new();
        let mut manager = EnvironmentBindingManager::new();
        let environment = EnvironmentMap::new(8, 4, vec![std::array::from_fn(|_| vec![0.0; 8 * 4 * 4])]);
        let err = manager
            .prepare(&mut device, &mut bind_groups, Some(&environment), None)
            .unwrap_err();
        assert!(matches!(err.root(), RenderError::InvalidEnvironment { .. }));
        assert_eq!(device.probe().live_textures(), 0);
    }

    #[test]
    fn rejected_environment_is_not_revalidated() {
        let mut device = HeadlessDevice::new();
        let mut bind_groups = BindGroupManager::new();
        let mut manager = EnvironmentBindingManager::new();
        let environment = EnvironmentMap::new(8, 4, vec![std::array::from_fn(|_| vec![0.0; 8 * 4 * 4])]);
        assert!(manager.prepare(&mut device, &mut bind_groups, Some(&environment), None).is_err());
        for _ in 0..3 {
            let binding = manager
                .prepare(&mut device, &mut bind_groups, Some(&environment), None)
                .unwrap();
            assert!(binding.is_none());
        }
        assert_eq!(manager.stats().rejections, 1);

        // A valid environment replaces the rejection.
        let valid = EnvironmentMap::uniform(2, [1.0; 4]);
        assert!(manager
            .prepare(&mut device, &mut bind_groups, Some(&valid), None)
            .unwrap()
            .is_some());
        assert_eq!(manager.stats().uploads, 1);
    }

    #[test]
    fn malformed_brdf_falls_back() {
        let mut device = HeadlessDevice::new();
        let mut bind_groups = BindGroupManager::new();
        let mut manager = EnvironmentBindingManager::new();
        let environment = EnvironmentMap::uniform(2, [1.0; 4]);
        let lut = BrdfLut::new(4, 4, vec![0.0; 5]);
        let binding = prepare_once(&mut manager, &mut device, &mut bind_groups, &environment, Some(&lut));
        assert!(binding.brdf_synthesized);
    }

    #[test]
    fn dispose_destroys_everything() {
        let mut device = HeadlessDevice::new();
        let probe = device.probe();
        let mut bind_groups = BindGroupManager::new();
        let mut manager = EnvironmentBindingManager::new();
        let environment = EnvironmentMap::uniform(4, [1.0; 4]);
        prepare_once(&mut manager, &mut device, &mut bind_groups, &environment, None);
        manager.dispose(&mut device);
        assert_eq!(probe.live_textures(), 0);
        assert_eq!(probe.live_bind_groups(), 0);
        assert_eq!(manager.stats().bytes_allocated, manager.stats().bytes_destroyed);
    }
}
