// src/texture.rs
//! Texture helpers shared by the environment binding manager and the frame
//! loop: texel sizes, mip chains, row-pitch padding, half-float conversion
//! and the resize-tracking attachment targets.

use half::f16;

use crate::error::Result;
use crate::gpu::{GpuDevice, TextureDesc, TextureId, TextureViewDesc, TextureViewId};

// ─────────────────────────────────────────────────────────────────────────────
// Format helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Depth target format. Carries a stencil aspect so stencil render state works.
pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth24PlusStencil8;

/// Bytes per texel for uncompressed formats (0 for block-compressed).
#[inline]
pub fn bytes_per_texel(format: wgpu::TextureFormat) -> u32 {
    use wgpu::TextureFormat as F;
    match format {
        F::R8Unorm | F::R8Snorm | F::R8Uint | F::R8Sint => 1,
        F::Rg8Unorm | F::Rg8Snorm | F::Rg8Uint | F::Rg8Sint => 2,
        F::R16Float | F::R16Uint | F::R16Sint | F::R16Unorm | F::R16Snorm => 2,
        F::Rgba8Unorm
        | F::Rgba8UnormSrgb
        | F::Rgba8Snorm
        | F::Rgba8Uint
        | F::Rgba8Sint
        | F::Bgra8Unorm
        | F::Bgra8UnormSrgb => 4,
        F::Rg16Float | F::Rg16Uint | F::Rg16Sint => 4,
        F::Rgba16Float | F::Rgba16Uint | F::Rgba16Sint => 8,
        F::R32Float | F::R32Uint | F::R32Sint => 4,
        F::Rg32Float | F::Rg32Uint | F::Rg32Sint => 8,
        F::Rgba32Float | F::Rgba32Uint | F::Rgba32Sint => 16,
        F::Depth32Float | F::Depth24Plus | F::Depth24PlusStencil8 => 4,
        F::Depth16Unorm => 2,
        _ => 0,
    }
}

/// Length of a full mip chain for the given extent.
#[inline]
pub fn max_mip_levels(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Extent of `level` in a chain whose base is `base`.
#[inline]
pub fn mip_extent(base: u32, level: u32) -> u32 {
    (base >> level).max(1)
}

#[inline]
pub fn padded_bytes_per_row(unpadded: u32, alignment: u32) -> u32 {
    let align = alignment.max(1);
    unpadded.div_ceil(align) * align
}

/// Copy `height` rows of `row_bytes` each from `src` into `scratch`, padding
/// every row to `alignment`. Returns the padded `bytes_per_row`.
///
/// A single row needs no padding and is copied as is.
pub fn pad_rows(src: &[u8], row_bytes: u32, height: u32, alignment: u32, scratch: &mut Vec<u8>) -> u32 {
    scratch.clear();
    if height <= 1 {
        scratch.extend_from_slice(&src[..row_bytes as usize]);
        return padded_bytes_per_row(row_bytes, alignment);
    }
    let padded = padded_bytes_per_row(row_bytes, alignment);
    scratch.resize(padded as usize * height as usize, 0);
    for row in 0..height as usize {
        let from = row * row_bytes as usize;
        let to = row * padded as usize;
        scratch[to..to + row_bytes as usize].copy_from_slice(&src[from..from + row_bytes as usize]);
    }
    padded
}

/// Convert RGBA `f32` texels to little-endian half floats.
pub fn f32_to_f16_bytes(src: &[f32], dst: &mut Vec<u8>) {
    dst.clear();
    dst.reserve(src.len() * 2);
    for &value in src {
        dst.extend_from_slice(&f16::from_f32(value).to_le_bytes());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Attachment targets
// ─────────────────────────────────────────────────────────────────────────────

/// Render attachment matching the current swapchain extent (the depth buffer,
/// or the multisampled colour buffer); rebuilt whenever the extent, sample
/// count or format changes.
#[derive(Debug)]
pub struct AttachmentTarget {
    label: &'static str,
    current: Option<Attachment>,
    bytes_allocated: u64,
    bytes_destroyed: u64,
}

#[derive(Debug, Clone, Copy)]
struct Attachment {
    texture: TextureId,
    view: TextureViewId,
    width: u32,
    height: u32,
    sample_count: u32,
    format: wgpu::TextureFormat,
    size_bytes: u64,
}

impl AttachmentTarget {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            current: None,
            bytes_allocated: 0,
            bytes_destroyed: 0,
        }
    }

    /// View for a `width`×`height` target; recreated only on change.
    pub fn ensure(
        &mut self,
        device: &mut dyn GpuDevice,
        width: u32,
        height: u32,
        sample_count: u32,
        format: wgpu::TextureFormat,
    ) -> Result<TextureViewId> {
        if let Some(current) = self.current {
            if current.width == width
                && current.height == height
                && current.sample_count == sample_count
                && current.format == format
            {
                return Ok(current.view);
            }
            log::debug!(
                "{}: resizing {}x{} -> {width}x{height}",
                self.label,
                current.width,
                current.height
            );
            self.release(device);
        }

        let desc = TextureDesc {
            label: self.label.into(),
            width,
            height,
            depth_or_array_layers: 1,
            mip_level_count: 1,
            sample_count,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        };
        let texture = device.create_texture(&desc)?;
        let view = match device.create_texture_view(
            texture,
            &TextureViewDesc::new(self.label, wgpu::TextureViewDimension::D2),
        ) {
            Ok(view) => view,
            Err(err) => {
                device.destroy_texture(texture);
                return Err(err);
            }
        };
        self.current = Some(Attachment {
            texture,
            view,
            width,
            height,
            sample_count,
            format,
            size_bytes: desc.size_bytes(),
        });
        self.bytes_allocated += desc.size_bytes();
        Ok(view)
    }

    pub fn release(&mut self, device: &mut dyn GpuDevice) {
        if let Some(current) = self.current.take() {
            device.destroy_texture_view(current.view);
            device.destroy_texture(current.texture);
            self.bytes_destroyed += current.size_bytes;
        }
    }

    /// Drop the handles without touching the device (it is gone).
    pub fn forget(&mut self) {
        self.current = None;
    }

    pub fn is_allocated(&self) -> bool {
        self.current.is_some()
    }

    /// Cumulative `(allocated, destroyed)` texture bytes.
    pub fn byte_counters(&self) -> (u64, u64) {
        (self.bytes_allocated, self.bytes_destroyed)
    }
}
