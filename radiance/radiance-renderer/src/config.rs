//! Radiance configuration: output target, frames in flight, cascade layout.

use radiance_rhi::TextureFormat;

use crate::error::CascadeError;

/// Which cascade levels run the trace kernel each frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TraceMode {
    #[default]
    AllLevels,
    /// Trace only level 0; coarser levels keep whatever they last held and are still merged.
    FinestOnly,
}

/// Layout of the cascade set. Every level shares the volume (extents and offset);
/// level `i` holds `max(resolution[2] >> i, 1)` probe slices.
#[derive(Clone, Debug, PartialEq)]
pub struct CascadeConfig {
    /// Probe grid resolution of level 0.
    pub resolution: [u32; 3],
    pub level_count: usize,
    /// Texels each probe occupies in the level texture (width, height).
    pub probe_texels: (u32, u32),
    /// World-space size of the probe volume.
    pub extents: [f32; 3],
    /// World-space position of the volume's minimum corner.
    pub offset: [f32; 3],
    pub trace_mode: TraceMode,
}

impl CascadeConfig {
    /// Uniform probe spacing: extents = resolution × spacing, volume at the origin.
    pub fn with_spacing(resolution: [u32; 3], level_count: usize, spacing: f32) -> Self {
        Self {
            resolution,
            level_count,
            probe_texels: (16, 8),
            extents: resolution.map(|r| r as f32 * spacing),
            offset: [0.0; 3],
            trace_mode: TraceMode::default(),
        }
    }

    /// Probe slices of level `index`.
    pub fn level_depth(&self, index: usize) -> u32 {
        let shift = index.min(31) as u32;
        (self.resolution[2] >> shift).max(1)
    }

    /// Texture size of level `index`: (width, height, array layers). Saturates on a
    /// layout that [`CascadeConfig::validate`] rejects.
    pub fn level_size(&self, index: usize) -> (u32, u32, u32) {
        let (width, height) = self.level_extent().unwrap_or((u32::MAX, u32::MAX));
        (width, height, self.level_depth(index))
    }

    /// Level texture width and height, `None` when they overflow `u32`.
    fn level_extent(&self) -> Option<(u32, u32)> {
        Some((
            self.probe_texels.0.checked_mul(self.resolution[0])?,
            self.probe_texels.1.checked_mul(self.resolution[1])?,
        ))
    }

    pub fn validate(&self) -> Result<(), CascadeError> {
        if self.level_count < 2 {
            return Err(CascadeError::TooFewLevels { count: self.level_count });
        }
        if self.resolution.contains(&0) || self.probe_texels.0 == 0 || self.probe_texels.1 == 0 {
            return Err(CascadeError::EmptyLevel { resolution: self.resolution, probe_texels: self.probe_texels });
        }
        if self.level_extent().is_none() {
            return Err(CascadeError::TooLarge { resolution: self.resolution, probe_texels: self.probe_texels });
        }
        Ok(())
    }
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self::with_spacing([32, 32, 32], 4, 1.0)
    }
}

/// Radiance renderer configuration.
#[derive(Clone, Debug)]
pub struct RendererConfig {
    /// Initial output size; follows `ExtractedView::viewport_size` afterwards.
    pub width: u32,
    pub height: u32,
    pub output_format: TextureFormat,
    /// Frames the host may record ahead of the GPU. Also the camera constant ring length.
    pub frames_in_flight: usize,
    pub cascades: CascadeConfig,
    /// Cascade level drawn over the output by the debug pass.
    pub debug_cascade: Option<usize>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            output_format: TextureFormat::Rgba8Unorm,
            frames_in_flight: 2,
            cascades: CascadeConfig::default(),
            debug_cascade: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spacing_scales_extents() {
        let config = CascadeConfig::with_spacing([32, 16, 8], 3, 0.5);
        assert_eq!(config.extents, [16.0, 8.0, 4.0]);
        assert_eq!(config.offset, [0.0; 3]);
    }

    #[test]
    fn depth_halves_per_level_and_never_reaches_zero() {
        let config = CascadeConfig::with_spacing([32, 32, 4], 5, 1.0);
        let depths: Vec<u32> = (0..5).map(|i| config.level_depth(i)).collect();
        assert_eq!(depths, vec![4, 2, 1, 1, 1]);
    }

    #[test]
    fn oversized_grid_is_rejected_instead_of_overflowing() {
        let config = CascadeConfig::with_spacing([1 << 30, 8, 8], 3, 1.0);
        assert!(matches!(config.validate(), Err(CascadeError::TooLarge { .. })));
        assert_eq!(config.level_size(0).0, u32::MAX);

        let mut config = CascadeConfig::default();
        config.probe_texels = (8, u32::MAX);
        assert!(matches!(config.validate(), Err(CascadeError::TooLarge { .. })));
        assert!(CascadeConfig::default().validate().is_ok());
    }

    #[test]
    fn level_size_uses_probe_footprint() {
        let config = CascadeConfig::default();
        assert_eq!(config.level_size(0), (512, 256, 32));
        assert_eq!(config.level_size(3), (512, 256, 4));
    }
}
