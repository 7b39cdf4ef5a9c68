//! Image-composition utilities: PSF convolution, sensor noise, and small host-side helpers.
//!
//! Tensor layout is `[batch, channels, height, width]` throughout. Host-side snapshots are
//! `ndarray::Array2<f32>` (one plane).

use burn_core as burn;

use burn::tensor::backend::Backend;
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;
use burn::tensor::{Tensor, TensorData};
use ndarray::Array2;
use rand_distr::{Distribution, StandardNormal};

use crate::{Error, Result};

/// Copy a tensor's values to the host as `f32` (row-major).
pub fn tensor_to_vec<B: Backend, const D: usize>(t: &Tensor<B, D>) -> Result<Vec<f32>> {
    t.to_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| Error::Data(format!("{e:?}")))
}

/// Build a tensor from row-major `f32` values.
pub fn tensor_from_vec<B: Backend, const D: usize>(
    values: Vec<f32>,
    shape: [usize; D],
    device: &B::Device,
) -> Tensor<B, D> {
    let data = TensorData::new(values, shape).convert::<B::FloatElem>();
    Tensor::from_data(data, device)
}

/// Extract plane `[b, c]` of a 4-D tensor as a host array.
pub fn plane<B: Backend>(t: &Tensor<B, 4>, b: usize, c: usize) -> Result<Array2<f32>> {
    let [nb, nc, h, w] = t.dims();
    if b >= nb || c >= nc {
        return Err(Error::Shape(format!(
            "plane [{b}, {c}] out of range for dims {:?}",
            t.dims()
        )));
    }
    let slice = t.clone().slice([b..b + 1, c..c + 1, 0..h, 0..w]);
    let values = tensor_to_vec(&slice)?;
    Array2::from_shape_vec((h, w), values).map_err(|e| Error::Shape(e.to_string()))
}

/// Depthwise "same"-size filtering of every channel of `x` with one 2-D `kernel`.
///
/// With `flip = true` this is a true convolution, otherwise a cross-correlation. Either way the
/// kernel is anchored at index `(kh / 2, kw / 2)` and the image is zero-padded.
pub(crate) fn filter_same<B: Backend>(
    x: Tensor<B, 4>,
    kernel: Tensor<B, 2>,
    flip: bool,
) -> Tensor<B, 4> {
    let [nb, nc, h, w] = x.dims();
    let [kh, kw] = kernel.dims();
    let kernel = if flip { kernel.flip([0, 1]) } else { kernel };
    let weight = kernel.reshape([1, 1, kh, kw]).repeat_dim(0, nc);

    let (ph, pw) = (kh / 2, kw / 2);
    let out = conv2d(
        x,
        weight,
        None,
        ConvOptions::new([1, 1], [ph, pw], [1, 1], nc),
    );

    // Even kernels leave one extra row/column; which end it sits on depends on the flip.
    let (sh, sw) = if flip {
        (2 * ph + 1 - kh, 2 * pw + 1 - kw)
    } else {
        (0, 0)
    };
    out.slice([0..nb, 0..nc, sh..sh + h, sw..sw + w])
}

/// Image formation: convolve every channel of `scene` with the PSF.
///
/// `psf` is `[1, 1, h, w]`. With `intensity_output` the PSF is normalized to unit energy first
/// (scene flux is preserved) and the result is clamped to be non-negative.
pub fn convolve_psf<B: Backend>(
    scene: Tensor<B, 4>,
    psf: Tensor<B, 4>,
    intensity_output: bool,
) -> Tensor<B, 4> {
    let [_, _, kh, kw] = psf.dims();
    let kernel = psf.reshape([kh, kw]);
    let kernel = if intensity_output {
        let energy = kernel.clone().sum().reshape([1, 1]);
        kernel / energy
    } else {
        kernel
    };
    let out = filter_same(scene, kernel, true);
    if intensity_output {
        out.clamp_min(0.0)
    } else {
        out
    }
}

/// Rows/cols `[start, end)` of a centered window of `size` pixels on an axis of length `n`.
pub(crate) fn central_window(n: usize, size: usize) -> (usize, usize) {
    let start = (n / 2).saturating_sub(size / 2);
    (start, (start + size).min(n))
}

/// Fraction of PSF energy inside the central `centersize × centersize` window.
///
/// Differentiable; returns shape `[1]`.
pub fn center_to_background_ratio<B: Backend>(
    psf: Tensor<B, 4>,
    centersize: usize,
) -> Tensor<B, 1> {
    let [nb, nc, h, w] = psf.dims();
    let (r0, r1) = central_window(h, centersize);
    let (c0, c1) = central_window(w, centersize);
    let center = psf.clone().slice([0..nb, 0..nc, r0..r1, c0..c1]).sum();
    center / psf.sum()
}

/// Two-term sensor noise: a signal-dependent (Poisson-like) term and an additive read term.
///
/// `noise = sqrt(a_poisson · max(x, 0)) · n₁ + b_sqrt · n₂`, with `n₁, n₂ ~ N(0, 1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorNoise {
    pub a_poisson: f32,
    pub b_sqrt: f32,
}

impl SensorNoise {
    /// The coefficients the camera pipeline injects.
    pub const CAMERA: SensorNoise = SensorNoise {
        a_poisson: 0.004,
        b_sqrt: 0.02,
    };

    /// Draw a noise tensor for `clean`.
    ///
    /// The standard deviation is computed from a detached host copy, so the returned tensor is a
    /// constant of the graph and gradients only flow through `clean` itself.
    pub fn sample<B: Backend>(
        &self,
        clean: &Tensor<B, 4>,
        rng: &mut impl rand::Rng,
    ) -> Result<Tensor<B, 4>> {
        let values = tensor_to_vec(clean)?;
        let mut noise = Vec::with_capacity(values.len());
        for x in values {
            let n1: f32 = StandardNormal.sample(&mut *rng);
            let n2: f32 = StandardNormal.sample(&mut *rng);
            noise.push((self.a_poisson * x.max(0.0)).sqrt() * n1 + self.b_sqrt * n2);
        }
        Ok(tensor_from_vec(noise, clean.dims(), &clean.device()))
    }
}

/// Min/max normalization to `[0, 1]`; a constant image maps to zeros.
pub fn normalize(x: &Array2<f32>) -> Array2<f32> {
    let lo = x.iter().copied().fold(f32::INFINITY, f32::min);
    let hi = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let span = hi - lo;
    if !span.is_finite() || span <= 0.0 {
        return Array2::zeros(x.raw_dim());
    }
    x.mapv(|v| (v - lo) / span)
}

/// Central `size × size` crop (clipped to the array).
pub fn central_crop(x: &Array2<f32>, size: usize) -> Array2<f32> {
    let (h, w) = x.dim();
    let (r0, r1) = central_window(h, size);
    let (c0, c1) = central_window(w, size);
    x.slice(ndarray::s![r0..r1, c0..c1]).to_owned()
}
