//! Configuration surface for a co-design run.
//!
//! Everything is plain data with `Default` impls, so a run can be configured in code or loaded
//! from TOML. Every section may be omitted from the file; missing fields take their defaults.
//!
//! Identifiers that select behavior (`loss_type`, `model_choice`) are parsed into enums at load
//! time. An unknown identifier therefore fails before any simulator or optimizer exists.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Which objective drives the optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LossType {
    /// Direct imaging: `-ln(center_to_background_ratio(psf))`.
    Cbr,
    /// Computational imaging: smooth-L1 after Richardson–Lucy deconvolution.
    DeconvLoss,
}

impl LossType {
    pub fn as_str(self) -> &'static str {
        match self {
            LossType::Cbr => "cbr",
            LossType::DeconvLoss => "deconv_loss",
        }
    }
}

impl FromStr for LossType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cbr" => Ok(LossType::Cbr),
            "deconv_loss" => Ok(LossType::DeconvLoss),
            other => {
                tracing::error!(loss_type = other, "wrong loss type");
                Err(Error::Config(format!(
                    "unknown loss_type {other:?} (expected \"cbr\" or \"deconv_loss\")"
                )))
            }
        }
    }
}

impl TryFrom<String> for LossType {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<LossType> for String {
    fn from(t: LossType) -> Self {
        t.as_str().to_string()
    }
}

/// Lithography model identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LithoChoice {
    /// Identity: the mask is printed perfectly.
    Ideal,
    /// Fixed Gaussian proximity blur.
    Gaussian,
    /// Learned residual conv net (pretrained weights loaded from a checkpoint).
    Cnn,
}

impl LithoChoice {
    pub fn as_str(self) -> &'static str {
        match self {
            LithoChoice::Ideal => "ideal",
            LithoChoice::Gaussian => "gaussian",
            LithoChoice::Cnn => "cnn",
        }
    }
}

impl FromStr for LithoChoice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ideal" => Ok(LithoChoice::Ideal),
            "gaussian" => Ok(LithoChoice::Gaussian),
            "cnn" => Ok(LithoChoice::Cnn),
            other => Err(Error::Config(format!(
                "unknown model_choice {other:?} (expected \"ideal\", \"gaussian\" or \"cnn\")"
            ))),
        }
    }
}

impl TryFrom<String> for LithoChoice {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<LithoChoice> for String {
    fn from(c: LithoChoice) -> Self {
        c.as_str().to_string()
    }
}

/// Optimization-loop options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Lithography model identifier.
    pub model_choice: LithoChoice,
    /// Route the mask sample through the lithography model (and load its checkpoint).
    pub use_litho_model_flag: bool,
    /// Number of optimizer steps.
    pub num_iters: usize,
    /// AdamW learning rate.
    pub lr: f64,
    /// Halve the learning rate every 25 steps.
    pub use_scheduler: bool,
    /// Render diagnostics when `(i + 1) % interval == 0`.
    pub image_visualize_interval: usize,
    /// Poisson-like noise coefficient. Accepted and recorded; the camera uses its own constant.
    pub cam_a_poisson: f32,
    /// Additive noise coefficient. Accepted and recorded; the camera uses its own constant.
    pub cam_b_sqrt: f32,
    /// Output directory for `mask.bmp` / `psf.bmp`.
    pub save_dir: PathBuf,
    pub loss_type: LossType,
    /// Side of the central window used by the `cbr` objective.
    pub centersize: usize,
    /// Richardson–Lucy iterations for `deconv_loss`.
    pub rl_iterations: usize,
    /// Gaussian window size of the structural-similarity metric (odd).
    pub ssim_window: usize,
    /// Seed for logits init, Gumbel sampling and sensor noise.
    pub seed: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model_choice: LithoChoice::Gaussian,
            use_litho_model_flag: false,
            num_iters: 100,
            lr: 0.1,
            use_scheduler: true,
            image_visualize_interval: 10,
            cam_a_poisson: 0.004,
            cam_b_sqrt: 0.02,
            save_dir: PathBuf::from("out"),
            loss_type: LossType::Cbr,
            centersize: 10,
            rl_iterations: 30,
            ssim_window: 1,
            seed: 123,
        }
    }
}

/// Optical system geometry. Lengths are in meters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpticsConfig {
    /// DOE pixel pitch.
    pub input_dx: f64,
    /// DOE side length in pixels.
    pub input_shape: usize,
    /// Sensor pixel pitch.
    pub output_dx: f64,
    /// PSF side length in pixels.
    pub output_shape: usize,
    /// Wavelength.
    pub lambda: f64,
    /// DOE-to-sensor distance.
    pub z: f64,
    /// Frequency-grid oversampling (>= 1).
    pub pad_scale: f64,
    /// Refractive-index contrast of the printed material.
    pub delta_n: f64,
    /// Multiply the field by a circular pupil inscribed in the DOE.
    pub circular_aperture: bool,
}

impl Default for OpticsConfig {
    fn default() -> Self {
        Self {
            input_dx: 1.0e-6,
            input_shape: 64,
            output_dx: 1.0e-6,
            output_shape: 64,
            lambda: 532.0e-9,
            z: 100.0e-6,
            pad_scale: 2.0,
            delta_n: 0.5,
            circular_aperture: true,
        }
    }
}

/// How logits cells tile the DOE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoeLayout {
    /// `num_partition × num_partition` square blocks.
    Free,
    /// `num_partition` concentric rings (rotationally symmetric lens).
    Rotational,
}

/// DOE parameterization options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DoeConfig {
    /// Number of printable height levels.
    pub num_level: usize,
    /// Cells per side (`free`) or number of rings (`rotational`).
    pub num_partition: usize,
    pub layout: DoeLayout,
    /// Gumbel-softmax temperature.
    pub tau: f32,
    /// Draw Gumbel noise per sample; otherwise use the expected profile.
    pub stochastic: bool,
}

impl Default for DoeConfig {
    fn default() -> Self {
        Self {
            num_level: 16,
            num_partition: 32,
            layout: DoeLayout::Rotational,
            tau: 1.0,
            stochastic: true,
        }
    }
}

/// Lithography model options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LithoConfig {
    /// Physical height of one level (meters).
    pub slicing_distance: f64,
    /// Proximity blur of the `gaussian` model, in DOE pixels.
    pub gaussian_sigma: f32,
    /// Hidden channels of the `cnn` model.
    pub cnn_hidden: usize,
    /// Directory holding `learned_litho_model_<id>.pt` (or the `.mpk` fallback).
    pub checkpoint_dir: PathBuf,
}

impl Default for LithoConfig {
    fn default() -> Self {
        Self {
            slicing_distance: 70.0e-9,
            gaussian_sigma: 1.0,
            cnn_hidden: 8,
            checkpoint_dir: PathBuf::from("model/ckpt"),
        }
    }
}

/// Full configuration of a co-design run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoDesignConfig {
    pub run: RunConfig,
    pub optics: OpticsConfig,
    pub doe: DoeConfig,
    pub litho: LithoConfig,
}

impl CoDesignConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let run = &self.run;
        if run.num_iters == 0 {
            return Err(Error::Domain("num_iters must be >= 1".into()));
        }
        if !run.lr.is_finite() || run.lr <= 0.0 {
            return Err(Error::Domain("lr must be positive and finite".into()));
        }
        if run.image_visualize_interval == 0 {
            return Err(Error::Domain("image_visualize_interval must be >= 1".into()));
        }
        if run.centersize == 0 {
            return Err(Error::Domain("centersize must be >= 1".into()));
        }
        if run.rl_iterations == 0 {
            return Err(Error::Domain("rl_iterations must be >= 1".into()));
        }
        if run.ssim_window == 0 || run.ssim_window % 2 == 0 {
            return Err(Error::Domain("ssim_window must be odd".into()));
        }

        let o = &self.optics;
        for (name, v) in [
            ("input_dx", o.input_dx),
            ("output_dx", o.output_dx),
            ("lambda", o.lambda),
            ("z", o.z),
            ("delta_n", o.delta_n),
        ] {
            if !v.is_finite() || v <= 0.0 {
                return Err(Error::Domain(format!("{name} must be positive and finite")));
            }
        }
        if !o.pad_scale.is_finite() || o.pad_scale < 1.0 {
            return Err(Error::Domain("pad_scale must be >= 1".into()));
        }
        if o.input_shape == 0 || o.output_shape == 0 {
            return Err(Error::Domain("input_shape and output_shape must be >= 1".into()));
        }

        let d = &self.doe;
        if d.num_level < 2 {
            return Err(Error::Domain("num_level must be >= 2".into()));
        }
        if d.num_partition == 0 {
            return Err(Error::Domain("num_partition must be >= 1".into()));
        }
        if !d.tau.is_finite() || d.tau <= 0.0 {
            return Err(Error::Domain("tau must be positive and finite".into()));
        }
        if d.layout == DoeLayout::Free && o.input_shape % d.num_partition != 0 {
            return Err(Error::Shape(format!(
                "input_shape {} is not divisible by num_partition {}",
                o.input_shape, d.num_partition
            )));
        }

        let l = &self.litho;
        if !l.slicing_distance.is_finite() || l.slicing_distance <= 0.0 {
            return Err(Error::Domain("slicing_distance must be positive and finite".into()));
        }
        if !l.gaussian_sigma.is_finite() || l.gaussian_sigma <= 0.0 {
            return Err(Error::Domain("gaussian_sigma must be positive and finite".into()));
        }
        if l.cnn_hidden == 0 {
            return Err(Error::Domain("cnn_hidden must be >= 1".into()));
        }
        Ok(())
    }
}
