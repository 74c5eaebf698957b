// src/config.rs
//! Renderer configuration.
//!
//! Everything has a sensible default; hosts typically override a handful of
//! fields from a JSON settings file via [`RendererConfig::from_json_str`].

use serde::{Deserialize, Serialize};

use crate::error::{RenderError, Result};

/// Upper bound on draws per frame. One uniform slot per draw.
pub const DEFAULT_MAX_DRAWS_PER_FRAME: u32 = 1024;

/// Clip-space depth convention of the projection matrices fed to the culler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipDepthRange {
    /// `0 <= z <= w` (wgpu, D3D, Metal, `glam::Mat4::perspective_rh`).
    ZeroToOne,
    /// `-w <= z <= w` (OpenGL).
    NegativeOneToOne,
}

impl Default for ClipDepthRange {
    fn default() -> Self {
        Self::ZeroToOne
    }
}

/// Buffer pool tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Ascending size-class thresholds in bytes.
    pub size_classes: Vec<u64>,
    /// Maximum idle buffers retained per (class, usage) list.
    pub per_class_capacity: usize,
    /// Hard cap on live pooled bytes (idle + in use).
    pub memory_ceiling: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        // 4 KiB .. 4 MiB, powers of two.
        let size_classes = (12..=22).map(|shift| 1u64 << shift).collect();
        Self {
            size_classes,
            per_class_capacity: 8,
            memory_ceiling: 512 * 1024 * 1024, // 512 MiB
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub max_draws_per_frame: u32,
    /// Lower bound for the uniform slot stride; the effective stride is this
    /// rounded up to the device's uniform offset alignment.
    pub uniform_slot_size: u64,
    pub buffer_pool: PoolConfig,
    /// Compile pipelines without blocking the frame; affected meshes are
    /// skipped until their pipeline is ready.
    pub async_pipeline_compilation: bool,
    pub clear_color: [f64; 4],
    pub depth_buffer: bool,
    pub sample_count: u32,
    pub clip_depth: ClipDepthRange,
    /// Consecutive frames with allocation failures before the stats tracker
    /// raises a renderer-level warning.
    pub allocation_warning_threshold: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            max_draws_per_frame: DEFAULT_MAX_DRAWS_PER_FRAME,
            uniform_slot_size: 256,
            buffer_pool: PoolConfig::default(),
            async_pipeline_compilation: true,
            clear_color: [0.08, 0.12, 0.18, 1.0],
            depth_buffer: true,
            sample_count: 1,
            clip_depth: ClipDepthRange::ZeroToOne,
            allocation_warning_threshold: 3,
        }
    }
}

impl RendererConfig {
    /// Parse and validate a JSON document. Missing fields take defaults.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| RenderError::Config(format!("invalid renderer config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_draws_per_frame == 0 {
            return Err(RenderError::Config("max_draws_per_frame must be > 0".into()));
        }
        if self.uniform_slot_size == 0 || self.uniform_slot_size % 16 != 0 {
            return Err(RenderError::Config(format!(
                "uniform_slot_size must be a non-zero multiple of 16 (got {})",
                self.uniform_slot_size
            )));
        }
        // Device limits are checked again when the uniform buffer is built.
        if u64::from(self.max_draws_per_frame) * self.uniform_slot_size > u64::from(u32::MAX) {
            return Err(RenderError::Config(format!(
                "max_draws_per_frame ({}) x uniform_slot_size ({}) exceeds the 32-bit dynamic offset range",
                self.max_draws_per_frame, self.uniform_slot_size
            )));
        }
        let classes = &self.buffer_pool.size_classes;
        if classes.is_empty() {
            return Err(RenderError::Config("buffer_pool.size_classes is empty".into()));
        }
        if classes.windows(2).any(|w| w[0] >= w[1]) || classes[0] == 0 {
            return Err(RenderError::Config(
                "buffer_pool.size_classes must be strictly ascending and non-zero".into(),
            ));
        }
        let largest = classes[classes.len() - 1];
        if self.buffer_pool.memory_ceiling < largest {
            return Err(RenderError::Config(format!(
                "buffer_pool.memory_ceiling ({}) is below the largest size class ({largest})",
                self.buffer_pool.memory_ceiling
            )));
        }
        if !matches!(self.sample_count, 1 | 4) {
            return Err(RenderError::Config(format!(
                "sample_count must be 1 or 4 (got {})",
                self.sample_count
            )));
        }
        Ok(())
    }

    pub fn clear_color(&self) -> wgpu::Color {
        let [r, g, b, a] = self.clear_color;
        wgpu::Color { r, g, b, a }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        RendererConfig::default().validate().unwrap();
        let pool = PoolConfig::default();
        assert_eq!(pool.size_classes.first(), Some(&4096));
        assert_eq!(pool.size_classes.last(), Some(&(4 * 1024 * 1024)));
    }

    #[test]
    fn json_overrides_merge_with_defaults() {
        let config = RendererConfig::from_json_str(
            r#"{ "max_draws_per_frame": 64, "clip_depth": "negative_one_to_one" }"#,
        )
        .unwrap();
        assert_eq!(config.max_draws_per_frame, 64);
        assert_eq!(config.clip_depth, ClipDepthRange::NegativeOneToOne);
        assert!(config.async_pipeline_compilation);
    }

    #[test]
    fn rejects_unsorted_size_classes() {
        let err = RendererConfig::from_json_str(
            r#"{ "buffer_pool": { "size_classes": [8192, 4096] } }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("ascending"));
    }

    #[test]
    fn rejects_uniform_buffers_past_the_offset_range() {
        let config = RendererConfig {
            max_draws_per_frame: 19_000_000,
            ..RendererConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("dynamic offset"), "{err}");
    }

    #[test]
    fn rejects_zero_draw_budget() {
        let config = RendererConfig {
            max_draws_per_frame: 0,
            ..RendererConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
