//! The image source collaborator.
//!
//! An [`ImageSource`] owns the decoded raw (or RGB) data of one image and
//! performs everything that needs the sensor data: preprocessing,
//! demosaic, white balance estimation and extraction of downscaled RGB
//! regions. The coordinator drives it from the worker thread while holding
//! the run lock, so implementations need `Send` but not `Sync`.

use serde::{Deserialize, Serialize};

use crate::color::ColorTemp;
use crate::histogram::ChannelHistograms;
use crate::params::{
    ColorManagementParams, LensProfileParams, RawParams, RetinexParams, ToneCurveParams,
};
use crate::types::{Dimensions, Rgb32FImage};

/// Errors reported by collaborators.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SourceError {
    /// Raw data could not be decoded or preprocessed.
    #[error("raw decode failed: {0}")]
    Decode(String),

    /// Conversion into the working space failed.
    #[error("color conversion failed: {0}")]
    ColorConversion(String),

    /// The named color profile is not available.
    #[error("color profile {0:?} is not available")]
    MissingProfile(String),

    /// The requested region is not inside the image.
    #[error("region {0:?} lies outside the source image")]
    OutOfBounds(Viewport),
}

/// 90-degree rotation and flips applied while reading the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoarseTransform {
    rotation: u16,
    horizontal_flip: bool,
    vertical_flip: bool,
}

impl CoarseTransform {
    /// Create a coarse transform; rotation is rounded down to a multiple
    /// of 90 degrees.
    #[must_use]
    pub const fn new(rotation: u16, horizontal_flip: bool, vertical_flip: bool) -> Self {
        Self {
            rotation: (rotation % 360) / 90 * 90,
            horizontal_flip,
            vertical_flip,
        }
    }

    /// Clockwise rotation in degrees: 0, 90, 180 or 270.
    #[must_use]
    pub const fn rotation(self) -> u16 {
        self.rotation
    }

    #[must_use]
    pub const fn horizontal_flip(self) -> bool {
        self.horizontal_flip
    }

    #[must_use]
    pub const fn vertical_flip(self) -> bool {
        self.vertical_flip
    }

    /// Whether width and height are exchanged.
    #[must_use]
    pub const fn swaps_axes(self) -> bool {
        self.rotation == 90 || self.rotation == 270
    }

    /// Dimensions of a sensor image after this transform.
    #[must_use]
    pub const fn apply(self, sensor: Dimensions) -> Dimensions {
        if self.swaps_axes() {
            sensor.transposed()
        } else {
            sensor
        }
    }

    /// Map a point in transformed coordinates back to sensor coordinates.
    #[must_use]
    pub const fn to_sensor(self, x: u32, y: u32, sensor: Dimensions) -> (u32, u32) {
        let out = self.apply(sensor);
        let x = if self.horizontal_flip {
            out.width - 1 - x
        } else {
            x
        };
        let y = if self.vertical_flip {
            out.height - 1 - y
        } else {
            y
        };
        match self.rotation {
            90 => (y, sensor.height - 1 - x),
            180 => (sensor.width - 1 - x, sensor.height - 1 - y),
            270 => (sensor.width - 1 - y, x),
            _ => (x, y),
        }
    }
}

/// A region of the (coarse-transformed) full image, read every `skip`
/// pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Subsampling step; 1 is full detail.
    pub skip: u32,
}

impl Viewport {
    /// The whole image at the given skip.
    #[must_use]
    pub const fn full(size: Dimensions, skip: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width: size.width,
            height: size.height,
            skip,
        }
    }

    /// Size of the image produced for this viewport.
    ///
    /// Partial steps at the right and bottom edges still produce a pixel.
    #[must_use]
    pub const fn output_dimensions(self) -> Dimensions {
        let skip = if self.skip == 0 { 1 } else { self.skip };
        Dimensions::new(self.width.div_ceil(skip), self.height.div_ceil(skip))
    }

    /// Whether this viewport lies inside an image of the given size.
    #[must_use]
    pub const fn fits(self, size: Dimensions) -> bool {
        self.x as u64 + self.width as u64 <= size.width as u64
            && self.y as u64 + self.height as u64 <= size.height as u64
    }
}

/// Sensor layout of the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorType {
    #[default]
    Bayer,
    XTrans,
    /// Three values per photosite.
    Foveon,
    /// Not a raw file.
    NonRaw,
}

/// What kind of image the source holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SensorInfo {
    pub sensor: SensorType,
    pub monochrome: bool,
}

impl SensorInfo {
    /// Whether the source holds raw sensor data.
    #[must_use]
    pub const fn is_raw(self) -> bool {
        !matches!(self.sensor, SensorType::NonRaw)
    }
}

/// What a demosaic produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeInfo {
    /// Sensor geometry of the decoded image.
    pub sensor: Dimensions,
    /// Contrast threshold a dual demosaic picked automatically, if any.
    pub contrast_threshold: Option<f64>,
}

/// Statistics of a retinex pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RetinexStats {
    pub mean: f64,
    pub sigma: f64,
    pub min: f64,
    pub max: f64,
}

/// Raw decoding and color extraction for one image.
pub trait ImageSource: Send {
    /// Sensor layout.
    fn sensor(&self) -> SensorInfo;

    /// Full image size after the coarse transform.
    fn full_size(&self, coarse: CoarseTransform) -> Dimensions;

    /// Size of the whole image read at `scale`.
    fn preview_size(&self, coarse: CoarseTransform, scale: u32) -> Dimensions {
        Viewport::full(self.full_size(coarse), scale).output_dimensions()
    }

    /// Number of frames in a multi-frame raw.
    fn frame_count(&self) -> u32 {
        1
    }

    /// Frame decoded by subsequent calls.
    fn select_frame(&mut self, _frame: u32) {}

    /// Dark frame, flat field, pixel filters, lens corrections on raw data.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Decode`] if the raw data cannot be processed.
    fn preprocess(
        &mut self,
        raw: &RawParams,
        lens: &LensProfileParams,
        coarse: CoarseTransform,
    ) -> Result<(), SourceError>;

    /// Clip value the last flat field correction applied.
    fn flat_field_clip_value(&self) -> Option<f64> {
        None
    }

    /// Per-channel histograms of the raw data.
    fn raw_histogram(&self) -> Option<ChannelHistograms> {
        None
    }

    /// Demosaic with the methods in `raw`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Decode`] if demosaicing fails.
    fn demosaic(&mut self, raw: &RawParams) -> Result<DecodeInfo, SourceError>;

    /// Whether the demosaiced RGB data was modified in place, which makes
    /// toggling color-propagation highlight recovery require a re-demosaic.
    fn is_rgb_source_modified(&self) -> bool {
        false
    }

    /// Allocate whatever the retinex pass needs after a demosaic.
    ///
    /// # Errors
    ///
    /// Returns an error if the demosaiced data is unusable.
    fn prepare_retinex(
        &mut self,
        _params: &RetinexParams,
        _icm: &ColorManagementParams,
    ) -> Result<(), SourceError> {
        Ok(())
    }

    /// Retinex local-contrast pass over the demosaiced data.
    ///
    /// # Errors
    ///
    /// Returns an error if the pass fails.
    fn retinex(&mut self, _params: &RetinexParams) -> Result<RetinexStats, SourceError> {
        Ok(RetinexStats::default())
    }

    /// Global highlight recovery before white balance.
    fn highlight_recovery(&mut self, _tone: &ToneCurveParams) {}

    /// As-shot white balance.
    fn camera_white_balance(&self) -> ColorTemp;

    /// Channel multipliers of an automatic white balance estimate.
    fn auto_white_balance_multipliers(&self) -> Option<[f64; 3]>;

    /// White balance that neutralizes the given points (sensor
    /// coordinates).
    fn spot_white_balance(
        &self,
        points: &[(u32, u32)],
        coarse: CoarseTransform,
        equal: f64,
    ) -> Option<ColorTemp>;

    /// Fill `dest` with white-balanced camera RGB for `viewport`.
    ///
    /// `dest` has exactly [`Viewport::output_dimensions`] pixels.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::OutOfBounds`] if the viewport does not fit.
    fn get_image(
        &self,
        wb: &ColorTemp,
        coarse: CoarseTransform,
        viewport: Viewport,
        tone: &ToneCurveParams,
        dest: &mut Rgb32FImage,
    ) -> Result<(), SourceError>;

    /// Convert camera RGB in place into the working space.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::ColorConversion`] if no conversion is
    /// available for the input profile.
    fn convert_color_space(
        &self,
        image: &mut Rgb32FImage,
        icm: &ColorManagementParams,
        wb: &ColorTemp,
    ) -> Result<(), SourceError>;

    /// Luminance histogram of the full-resolution data for auto exposure.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is not available.
    fn auto_exposure_histogram(&self) -> Result<Vec<u32>, SourceError>;
}
