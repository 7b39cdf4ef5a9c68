//! Coherent free-space propagation from a printed DOE profile to the sensor plane.
//!
//! The propagation is an angular-spectrum transfer written entirely as dense matrix products,
//! so it stays on the autodiff graph without an FFT primitive:
//!
//! \[
//! u_{out} = G\,\big(H \odot (F\,u_{in}\,F^\top)\big)\,G^\top
//! \]
//!
//! - `F` (`P × N`): forward DFT of the DOE plane onto a padded frequency grid
//!   (`P = round(N · pad_scale)`, spacing `1 / (P · input_dx)`),
//! - `H` (`P × P`): transfer function `exp(i 2π z sqrt(1/λ² − fx² − fy²))`, evanescent
//!   components dropped,
//! - `G` (`M × P`): inverse transform evaluated directly on the sensor grid (`output_dx`),
//!   so input and output pitches are independent.
//!
//! Every matrix is separable in x/y except `H`, which is applied elementwise. The optical axis
//! lands on output pixel `(M/2, M/2)`.

use burn_core as burn;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::compose::tensor_from_vec;
use crate::config::OpticsConfig;
use crate::{Error, Result};

/// A complex tensor stored as a pair of real tensors.
#[derive(Debug, Clone)]
pub struct ComplexTensor<B: Backend, const D: usize> {
    pub re: Tensor<B, D>,
    pub im: Tensor<B, D>,
}

impl<B: Backend, const D: usize> ComplexTensor<B, D> {
    pub fn new(re: Tensor<B, D>, im: Tensor<B, D>) -> Self {
        Self { re, im }
    }

    /// `amplitude · exp(i · phase)`.
    pub fn from_polar(amplitude: Tensor<B, D>, phase: Tensor<B, D>) -> Self {
        let re = amplitude.clone() * phase.clone().cos();
        let im = amplitude * phase.sin();
        Self { re, im }
    }

    pub fn dims(&self) -> [usize; D] {
        self.re.dims()
    }

    /// `|z|²`.
    pub fn intensity(self) -> Tensor<B, D> {
        self.re.powf_scalar(2.0) + self.im.powf_scalar(2.0)
    }

    /// Elementwise product.
    pub fn mul(self, rhs: Self) -> Self {
        let re = self.re.clone() * rhs.re.clone() - self.im.clone() * rhs.im.clone();
        let im = self.re * rhs.im + self.im * rhs.re;
        Self { re, im }
    }

    pub fn reshape<const D2: usize>(self, shape: [usize; D2]) -> ComplexTensor<B, D2> {
        ComplexTensor {
            re: self.re.reshape(shape),
            im: self.im.reshape(shape),
        }
    }
}

impl<B: Backend> ComplexTensor<B, 2> {
    /// Matrix product `self · rhs`.
    pub fn matmul(self, rhs: Self) -> Self {
        let re = self.re.clone().matmul(rhs.re.clone()) - self.im.clone().matmul(rhs.im.clone());
        let im = self.re.matmul(rhs.im) + self.im.matmul(rhs.re);
        Self { re, im }
    }

    /// Plain (non-conjugating) transpose.
    pub fn transpose(self) -> Self {
        Self {
            re: self.re.transpose(),
            im: self.im.transpose(),
        }
    }

    /// Matrix of `rows × cols` complex values produced by `f(row, col) -> (re, im)`.
    fn from_fn(
        rows: usize,
        cols: usize,
        device: &B::Device,
        f: impl Fn(usize, usize) -> (f64, f64),
    ) -> Self {
        let mut re = Vec::with_capacity(rows * cols);
        let mut im = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                let (a, b) = f(r, c);
                re.push(a as f32);
                im.push(b as f32);
            }
        }
        Self {
            re: tensor_from_vec(re, [rows, cols], device),
            im: tensor_from_vec(im, [rows, cols], device),
        }
    }
}

/// Maps a printed profile `[1, 1, n, n]` (height-level units) to the complex sensor field
/// `[1, 1, m, m]`.
pub trait Propagation<B: Backend> {
    fn propagate(&self, profile: Tensor<B, 4>) -> Result<ComplexTensor<B, 4>>;
}

/// Angular-spectrum propagation over a fixed distance.
#[derive(Debug, Clone)]
pub struct FreeSpace<B: Backend> {
    input_shape: usize,
    output_shape: usize,
    /// Phase delay of one height level: `2π/λ · Δn · slicing_distance`.
    phase_per_level: f32,
    aperture: Tensor<B, 2>,
    forward: ComplexTensor<B, 2>,
    transfer: ComplexTensor<B, 2>,
    inverse: ComplexTensor<B, 2>,
}

impl<B: Backend> FreeSpace<B> {
    /// Precompute the propagation operators for `optics`.
    ///
    /// `slicing_distance` is the physical height (meters) of one profile level.
    pub fn new(optics: &OpticsConfig, slicing_distance: f64, device: &B::Device) -> Result<Self> {
        let n = optics.input_shape;
        let m = optics.output_shape;
        let dx = optics.input_dx;
        let lambda = optics.lambda;
        if n == 0 || m == 0 {
            return Err(Error::Domain("input/output shape must be >= 1".into()));
        }
        for (name, v) in [
            ("input_dx", dx),
            ("output_dx", optics.output_dx),
            ("lambda", lambda),
            ("z", optics.z),
            ("slicing_distance", slicing_distance),
        ] {
            if !v.is_finite() || v <= 0.0 {
                return Err(Error::Domain(format!("{name} must be positive and finite")));
            }
        }
        if !optics.pad_scale.is_finite() || optics.pad_scale < 1.0 {
            return Err(Error::Domain("pad_scale must be >= 1".into()));
        }

        let p = ((n as f64) * optics.pad_scale).round() as usize;
        let df = 1.0 / (p as f64 * dx);
        let freq = |k: usize| (k as f64 - (p / 2) as f64) * df;
        let xi = |k: usize| (k as f64 - (n as f64 - 1.0) / 2.0) * dx;
        let x_out = |k: usize| (k as f64 - (m / 2) as f64) * optics.output_dx;
        let tau = 2.0 * std::f64::consts::PI;

        let forward = ComplexTensor::from_fn(p, n, device, |r, c| {
            let a = -tau * freq(r) * xi(c);
            (a.cos() * dx, a.sin() * dx)
        });
        let inverse = ComplexTensor::from_fn(m, p, device, |r, c| {
            let a = tau * freq(c) * x_out(r);
            (a.cos() * df, a.sin() * df)
        });
        let inv_lambda_sq = 1.0 / (lambda * lambda);
        let transfer = ComplexTensor::from_fn(p, p, device, |r, c| {
            let arg = inv_lambda_sq - freq(r).powi(2) - freq(c).powi(2);
            if arg <= 0.0 {
                (0.0, 0.0)
            } else {
                let a = tau * optics.z * arg.sqrt();
                (a.cos(), a.sin())
            }
        });

        let center = (n as f64 - 1.0) / 2.0;
        let radius = n as f64 / 2.0;
        let mut pupil = Vec::with_capacity(n * n);
        for r in 0..n {
            for c in 0..n {
                let inside = !optics.circular_aperture
                    || (r as f64 - center).hypot(c as f64 - center) <= radius;
                pupil.push(if inside { 1.0f32 } else { 0.0 });
            }
        }

        let phase_per_level = (tau / lambda * optics.delta_n * slicing_distance) as f32;
        tracing::debug!(n, m, p, phase_per_level, "built free-space propagation");

        Ok(Self {
            input_shape: n,
            output_shape: m,
            phase_per_level,
            aperture: tensor_from_vec(pupil, [n, n], device),
            forward,
            transfer,
            inverse,
        })
    }

    pub fn input_shape(&self) -> usize {
        self.input_shape
    }

    pub fn output_shape(&self) -> usize {
        self.output_shape
    }
}

impl<B: Backend> Propagation<B> for FreeSpace<B> {
    fn propagate(&self, profile: Tensor<B, 4>) -> Result<ComplexTensor<B, 4>> {
        let n = self.input_shape;
        if profile.dims() != [1, 1, n, n] {
            return Err(Error::Shape(format!(
                "profile must be [1, 1, {n}, {n}], got {:?}",
                profile.dims()
            )));
        }
        let phase = profile.reshape([n, n]).mul_scalar(self.phase_per_level);
        let field = ComplexTensor::from_polar(self.aperture.clone(), phase);

        let spectrum = self
            .forward
            .clone()
            .matmul(field)
            .matmul(self.forward.clone().transpose());
        let propagated = spectrum.mul(self.transfer.clone());
        let out = self
            .inverse
            .clone()
            .matmul(propagated)
            .matmul(self.inverse.clone().transpose());

        let m = self.output_shape;
        Ok(out.reshape([1, 1, m, m]))
    }
}
