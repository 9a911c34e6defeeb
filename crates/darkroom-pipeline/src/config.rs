//! Coordinator configuration.

use serde::{Deserialize, Serialize};

/// How the interactive preview is demosaiced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PreviewDemosaic {
    /// Use the cheap demosaic for the preview; full-detail crop windows
    /// promote to the configured method on demand.
    #[default]
    Fast,
    /// Always use the configured method, as the exported image would.
    Sidecar,
}

/// Configuration for a [`Coordinator`](crate::Coordinator).
///
/// These settings are fixed for the coordinator's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Preview downscale factor tried first.
    pub initial_scale: u32,

    /// The scale is lowered until the preview is at least this tall...
    pub min_preview_height: u32,

    /// ...unless the preview would then exceed this many pixels.
    pub max_preview_pixels: u64,

    /// Preview demosaic policy.
    pub preview_demosaic: PreviewDemosaic,
}

impl CoordinatorConfig {
    /// Default for [`initial_scale`](Self::initial_scale).
    pub const DEFAULT_INITIAL_SCALE: u32 = 10;
    /// Default for [`min_preview_height`](Self::min_preview_height).
    pub const DEFAULT_MIN_PREVIEW_HEIGHT: u32 = 400;
    /// Default for [`max_preview_pixels`](Self::max_preview_pixels).
    pub const DEFAULT_MAX_PREVIEW_PIXELS: u64 = 1_000_000;

    /// Limits used by the preview scale heuristic.
    #[must_use]
    pub const fn scale_limits(&self) -> ScaleLimits {
        ScaleLimits {
            min_height: self.min_preview_height,
            max_pixels: self.max_preview_pixels,
        }
    }

    /// Whether the preview is always computed at full detail.
    #[must_use]
    pub const fn sidecar(&self) -> bool {
        matches!(self.preview_demosaic, PreviewDemosaic::Sidecar)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            initial_scale: Self::DEFAULT_INITIAL_SCALE,
            min_preview_height: Self::DEFAULT_MIN_PREVIEW_HEIGHT,
            max_preview_pixels: Self::DEFAULT_MAX_PREVIEW_PIXELS,
            preview_demosaic: PreviewDemosaic::default(),
        }
    }
}

/// Bounds for choosing the preview scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleLimits {
    /// Preferred minimum preview height.
    pub min_height: u32,
    /// Pixel count above which the scale is not lowered further.
    pub max_pixels: u64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.initial_scale, 10);
        assert_eq!(config.scale_limits().min_height, 400);
        assert_eq!(config.scale_limits().max_pixels, 1_000_000);
        assert!(!config.sidecar());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"preview_demosaic": "Sidecar"}"#).unwrap();
        assert!(config.sidecar());
        assert_eq!(
            config.initial_scale,
            CoordinatorConfig::DEFAULT_INITIAL_SCALE
        );
    }
}
