//! Color: white balance temperatures, matrix profiles, Lab conversion and
//! the monitor transform.
//!
//! All profiles are matrix/TRC profiles relative to D65. Chromatic
//! adaptation and LUT-based profiles are the profile store's business; the
//! pipeline only needs a forward matrix and a transfer curve.

use serde::{Deserialize, Serialize};

use crate::params::{ColorManagementParams, RenderingIntent, WorkingProfile};
use crate::source::SourceError;

/// 3x3 matrix, row major.
pub type Matrix3 = [[f64; 3]; 3];

/// D65 reference white in XYZ.
const D65_WHITE: [f64; 3] = [0.950_47, 1.0, 1.088_83];

const LAB_EPSILON: f64 = 216.0 / 24_389.0;
const LAB_KAPPA: f64 = 24_389.0 / 27.0;

/// Pixel color painted where soft proofing finds an out-of-gamut color.
pub const GAMUT_WARNING: [u8; 3] = [0, 255, 255];

/// A white balance setting: temperature, tint and blue/red equalizer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorTemp {
    /// Correlated color temperature in kelvin.
    pub temperature: f64,
    /// Green multiplier relative to red/blue.
    pub green: f64,
    /// Blue/red equalizer; 1.0 is neutral.
    pub equal: f64,
}

impl ColorTemp {
    /// Daylight: multipliers are all 1.
    pub const D65: Self = Self {
        temperature: 6504.0,
        green: 1.0,
        equal: 1.0,
    };

    const EXPONENT: f64 = 0.8;

    /// Create a white balance setting.
    #[must_use]
    pub const fn new(temperature: f64, green: f64, equal: f64) -> Self {
        Self {
            temperature,
            green,
            equal,
        }
    }

    /// Channel multipliers that neutralize a light source at this
    /// temperature.
    #[must_use]
    pub fn multipliers(&self) -> [f64; 3] {
        let ratio = (self.temperature / Self::D65.temperature).powf(Self::EXPONENT);
        let equal = self.equal.max(1e-6).sqrt();
        [ratio / equal, self.green, equal / ratio]
    }

    /// Inverse of [`multipliers`](Self::multipliers).
    ///
    /// `temp_bias` shifts the resulting temperature by that fraction.
    #[must_use]
    pub fn from_multipliers(multipliers: [f64; 3], equal: f64, temp_bias: f64) -> Self {
        let [red, green, blue] = multipliers.map(|m| m.max(1e-9));
        let ratio = red / blue * equal.max(1e-6);
        let temperature = Self::D65.temperature * ratio.powf(0.5 / Self::EXPONENT);
        Self {
            temperature: temperature * (1.0 + temp_bias),
            green: green / (red * blue).sqrt(),
            equal,
        }
    }
}

impl Default for ColorTemp {
    fn default() -> Self {
        Self::D65
    }
}

/// Tone response of an RGB encoding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TransferCurve {
    Linear,
    Srgb,
    Gamma(f64),
}

impl TransferCurve {
    /// Linear light to encoded value, both in `[0, 1]`.
    #[must_use]
    pub fn encode(self, v: f64) -> f64 {
        match self {
            Self::Linear => v,
            Self::Srgb => {
                if v <= 0.003_130_8 {
                    12.92 * v
                } else {
                    1.055f64.mul_add(v.powf(1.0 / 2.4), -0.055)
                }
            }
            Self::Gamma(gamma) => v.max(0.0).powf(1.0 / gamma),
        }
    }
}

/// A matrix/TRC color profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorProfile {
    /// Profile name as known to the profile store.
    pub name: String,
    /// Linear RGB to XYZ (D65).
    pub to_xyz: Matrix3,
    /// Encoding applied after the matrix.
    pub transfer: TransferCurve,
}

const SRGB_TO_XYZ: Matrix3 = [
    [0.412_456_4, 0.357_576_1, 0.180_437_5],
    [0.212_672_9, 0.715_152_2, 0.072_175_0],
    [0.019_333_9, 0.119_192_0, 0.950_304_1],
];

const ADOBE_RGB_TO_XYZ: Matrix3 = [
    [0.576_730_9, 0.185_554_0, 0.188_185_2],
    [0.297_376_9, 0.627_349_1, 0.075_274_1],
    [0.027_034_3, 0.070_687_2, 0.991_108_5],
];

const REC2020_TO_XYZ: Matrix3 = [
    [0.636_958_0, 0.144_616_9, 0.168_881_0],
    [0.262_700_2, 0.677_998_1, 0.059_301_7],
    [0.0, 0.028_072_7, 1.060_985_1],
];

impl WorkingProfile {
    /// Linear RGB to XYZ matrix of this working space.
    #[must_use]
    pub const fn to_xyz(self) -> Matrix3 {
        match self {
            Self::Srgb => SRGB_TO_XYZ,
            Self::AdobeRgb => ADOBE_RGB_TO_XYZ,
            Self::Rec2020 => REC2020_TO_XYZ,
        }
    }
}

/// Resolves profile names to profiles.
///
/// Implementations wrap whatever ICC machinery the application uses.
pub trait ProfileStore: Send {
    /// Look up a profile by name.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::MissingProfile`] if the name is unknown.
    fn profile(&self, name: &str) -> Result<ColorProfile, SourceError>;
}

/// Built-in sRGB, Adobe RGB and Rec.2020 display profiles.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinProfiles;

impl ProfileStore for BuiltinProfiles {
    fn profile(&self, name: &str) -> Result<ColorProfile, SourceError> {
        let (to_xyz, transfer) = match name {
            "sRGB" => (SRGB_TO_XYZ, TransferCurve::Srgb),
            "Adobe RGB" => (ADOBE_RGB_TO_XYZ, TransferCurve::Gamma(2.199_218_75)),
            "Rec2020" => (REC2020_TO_XYZ, TransferCurve::Gamma(2.4)),
            _ => return Err(SourceError::MissingProfile(name.to_owned())),
        };
        Ok(ColorProfile {
            name: name.to_owned(),
            to_xyz,
            transfer,
        })
    }
}

/// Multiply a matrix by a column vector.
#[must_use]
pub fn mul_vec(m: &Matrix3, v: [f64; 3]) -> [f64; 3] {
    [
        m[0][2].mul_add(v[2], m[0][0].mul_add(v[0], m[0][1] * v[1])),
        m[1][2].mul_add(v[2], m[1][0].mul_add(v[0], m[1][1] * v[1])),
        m[2][2].mul_add(v[2], m[2][0].mul_add(v[0], m[2][1] * v[1])),
    ]
}

/// Invert a 3x3 matrix, or `None` if it is singular.
#[must_use]
pub fn invert(m: &Matrix3) -> Option<Matrix3> {
    let cofactor = |r0: usize, r1: usize, c0: usize, c1: usize| {
        m[r0][c0].mul_add(m[r1][c1], -(m[r0][c1] * m[r1][c0]))
    };
    let c00 = cofactor(1, 2, 1, 2);
    let c01 = -cofactor(1, 2, 0, 2);
    let c02 = cofactor(1, 2, 0, 1);
    let det = m[0][2].mul_add(c02, m[0][0].mul_add(c00, m[0][1] * c01));
    if det.abs() < 1e-12 {
        return None;
    }
    let inv = 1.0 / det;
    Some([
        [
            c00 * inv,
            -cofactor(0, 2, 1, 2) * inv,
            cofactor(0, 1, 1, 2) * inv,
        ],
        [
            c01 * inv,
            cofactor(0, 2, 0, 2) * inv,
            -cofactor(0, 1, 0, 2) * inv,
        ],
        [
            c02 * inv,
            -cofactor(0, 2, 0, 1) * inv,
            cofactor(0, 1, 0, 1) * inv,
        ],
    ])
}

fn lab_f(t: f64) -> f64 {
    if t > LAB_EPSILON {
        t.cbrt()
    } else {
        LAB_KAPPA.mul_add(t, 16.0) / 116.0
    }
}

fn lab_f_inv(f: f64) -> f64 {
    let cube = f * f * f;
    if cube > LAB_EPSILON {
        cube
    } else {
        116.0f64.mul_add(f, -16.0) / LAB_KAPPA
    }
}

/// XYZ (D65, Y in `[0, 1]`) to Lab.
#[must_use]
pub fn xyz_to_lab(xyz: [f64; 3]) -> [f64; 3] {
    let fx = lab_f(xyz[0] / D65_WHITE[0]);
    let fy = lab_f(xyz[1] / D65_WHITE[1]);
    let fz = lab_f(xyz[2] / D65_WHITE[2]);
    [
        116.0f64.mul_add(fy, -16.0),
        500.0 * (fx - fy),
        200.0 * (fy - fz),
    ]
}

/// Lab to XYZ (D65, Y in `[0, 1]`).
#[must_use]
pub fn lab_to_xyz(lab: [f64; 3]) -> [f64; 3] {
    let fy = (lab[0] + 16.0) / 116.0;
    let fx = fy + lab[1] / 500.0;
    let fz = fy - lab[2] / 200.0;
    [
        lab_f_inv(fx) * D65_WHITE[0],
        lab_f_inv(fy) * D65_WHITE[1],
        lab_f_inv(fz) * D65_WHITE[2],
    ]
}

/// Converts linear working-space RGB to Lab.
#[derive(Debug, Clone, Copy)]
pub struct LabConverter {
    to_xyz: Matrix3,
}

impl LabConverter {
    /// Converter for a working profile.
    #[must_use]
    pub const fn new(working: WorkingProfile) -> Self {
        Self {
            to_xyz: working.to_xyz(),
        }
    }

    /// Convert one pixel.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn rgb_to_lab(&self, rgb: [f32; 3]) -> [f32; 3] {
        let xyz = mul_vec(&self.to_xyz, rgb.map(f64::from));
        xyz_to_lab(xyz).map(|v| v as f32)
    }
}

/// Encodes XYZ into an 8-bit RGB profile.
#[derive(Debug, Clone)]
pub struct RgbEncoder {
    from_xyz: Matrix3,
    to_xyz: Matrix3,
    transfer: TransferCurve,
}

impl RgbEncoder {
    /// Encoder for a profile.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::ColorConversion`] if the profile matrix is
    /// singular.
    pub fn new(profile: &ColorProfile) -> Result<Self, SourceError> {
        let from_xyz = invert(&profile.to_xyz).ok_or_else(|| {
            SourceError::ColorConversion(format!("profile {:?} has a singular matrix", profile.name))
        })?;
        Ok(Self {
            from_xyz,
            to_xyz: profile.to_xyz,
            transfer: profile.transfer,
        })
    }

    /// Linear RGB in this profile, unclipped.
    fn linear(&self, xyz: [f64; 3]) -> [f64; 3] {
        mul_vec(&self.from_xyz, xyz)
    }

    /// Encode XYZ to 8-bit RGB, clipping to the gamut.
    #[must_use]
    pub fn encode(&self, xyz: [f64; 3]) -> [u8; 3] {
        self.linear(xyz).map(|v| quantize(self.transfer.encode(v.clamp(0.0, 1.0))))
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn quantize(v: f64) -> u8 {
    v.mul_add(255.0, 0.5).clamp(0.0, 255.0) as u8
}

/// Display settings owned by the coordinator rather than the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Monitor profile name.
    pub profile: String,
    pub intent: RenderingIntent,
    /// Preview through the output profile's gamut.
    pub soft_proof: bool,
    /// Mark colors the output profile cannot represent.
    pub gamut_check: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            profile: "sRGB".to_owned(),
            intent: RenderingIntent::default(),
            soft_proof: false,
            gamut_check: false,
        }
    }
}

/// Identity of the output profile a monitor transform was built for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputProfileKey {
    profile: String,
    intent: RenderingIntent,
    bpc: bool,
}

impl OutputProfileKey {
    /// Key of the output settings in a snapshot.
    #[must_use]
    pub fn of(icm: &ColorManagementParams) -> Self {
        Self {
            profile: icm.output_profile.clone(),
            intent: icm.output_intent,
            bpc: icm.output_bpc,
        }
    }
}

/// Lab to monitor RGB, optionally soft-proofed through the output profile.
///
/// With matrix profiles every intent reduces to colorimetric clipping, so
/// the intent only participates in deciding when to rebuild.
#[derive(Debug, Clone)]
pub struct MonitorTransform {
    monitor: RgbEncoder,
    output: RgbEncoder,
    soft_proof: bool,
    gamut_check: bool,
}

impl MonitorTransform {
    /// Build the transform for the current display and output settings.
    ///
    /// # Errors
    ///
    /// Returns an error if either profile is unknown to the store or has a
    /// singular matrix.
    pub fn build(
        store: &dyn ProfileStore,
        monitor: &MonitorSettings,
        icm: &ColorManagementParams,
    ) -> Result<Self, SourceError> {
        let monitor_profile = store.profile(&monitor.profile)?;
        let output_profile = store.profile(&icm.output_profile)?;
        Ok(Self {
            monitor: RgbEncoder::new(&monitor_profile)?,
            output: RgbEncoder::new(&output_profile)?,
            soft_proof: monitor.soft_proof,
            gamut_check: monitor.gamut_check,
        })
    }

    /// Lab pixel to monitor RGB.
    #[must_use]
    pub fn to_monitor(&self, lab: [f32; 3]) -> [u8; 3] {
        let mut xyz = lab_to_xyz(lab.map(f64::from));
        if self.soft_proof {
            let proofed = self.output.linear(xyz);
            let out_of_gamut = proofed.iter().any(|v| !(-1e-4..=1.0 + 1e-4).contains(v));
            if self.gamut_check && out_of_gamut {
                return GAMUT_WARNING;
            }
            xyz = mul_vec(&self.output.to_xyz, proofed.map(|v| v.clamp(0.0, 1.0)));
        }
        self.monitor.encode(xyz)
    }

    /// Lab pixel to output-profile RGB, used for analysis histograms.
    #[must_use]
    pub fn to_output(&self, lab: [f32; 3]) -> [u8; 3] {
        self.output.encode(lab_to_xyz(lab.map(f64::from)))
    }
}
