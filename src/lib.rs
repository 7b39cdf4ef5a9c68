//! # litholens
//!
//! Gradient-based co-design of a diffractive optical element (DOE) through two differentiable
//! simulators: a lithography model (what actually gets printed) and a camera model (what the
//! printed lens images).
//!
//! Per iteration the data flows strictly forward:
//!
//! ```text
//! logits -> mask sample -> (litho) print prediction -> |propagate|^2 = PSF
//!        -> conv(target, PSF) + noise = sensor image -> loss -> grad -> logits
//! ```
//!
//! ## Public invariants (must not change)
//!
//! - **The logits are the only trainable state.** The optimizer is built over `DoeLogits`
//!   alone; lithography parameters participate in the forward pass but are never updated.
//! - **Non-finite PSFs are fatal.** A NaN/Inf PSF returns `Error::NonFinitePsf` and the run
//!   stops before any artifact is written.
//! - **Determinism knobs are explicit**: Gumbel sampling and sensor noise draw from a
//!   `ChaCha8Rng` seeded from configuration.
//! - **Host-side outputs are `ndarray`**: exported profiles and diagnostic snapshots never leak
//!   burn tensor types.
//!
//! ## Objectives
//!
//! - `cbr` (direct imaging): `-ln(center_to_background_ratio(psf))`, rewards a sharp PSF.
//! - `deconv_loss` (computational imaging): Richardson–Lucy deconvolution of the sensor image,
//!   then smooth-L1 against the target. The deconvolution sits inside the graph.
//!
//! ## Module map
//!
//! - `config`: TOML configuration surface (`CoDesignConfig`)
//! - `doe`: logits, Gumbel-softmax mask sampling, fabrication profile
//! - `litho`: lithography model selector (`ideal`, `gaussian`, `cnn`) and checkpoint loading
//! - `optics`: complex fields and angular-spectrum free-space propagation
//! - `compose`: PSF convolution, sensor noise, normalize/crop helpers
//! - `camera`: the camera pipeline (mask -> sensor image)
//! - `deconv`: Richardson–Lucy deconvolution
//! - `metrics`: structural-similarity and PSNR losses
//! - `objective`: the two loss variants
//! - `schedule`: learning-rate step decay
//! - `codesign`: the optimization driver
//! - `diagnostics`, `export`: per-interval snapshots and final BMP artifacts

use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;

pub mod camera;
pub mod codesign;
pub mod compose;
pub mod config;
pub mod deconv;
pub mod diagnostics;
pub mod doe;
pub mod export;
pub mod litho;
pub mod metrics;
pub mod objective;
pub mod optics;
pub mod schedule;

/// Default backend: ndarray + autodiff.
pub type CoDesignBackend = Autodiff<NdArray<f32>>;

/// litholens error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("domain error: {0}")]
    Domain(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("psf contains {count} non-finite values")]
    NonFinitePsf { count: usize },
    #[error("psf carries no energy")]
    EmptyPsf,
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error("tensor data error: {0}")]
    Data(String),
    #[error("plot error: {0}")]
    Plot(String),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
