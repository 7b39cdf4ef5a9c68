//! Differentiable deconvolution of sensor images.

use burn_core as burn;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::compose::filter_same;

/// Recover a scene estimate from `observed` (`[b, c, h, w]`) blurred by `psf` (`[1, 1, kh, kw]`).
pub trait Deconvolution<B: Backend> {
    fn deconvolve(&self, observed: Tensor<B, 4>, psf: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// Richardson–Lucy iterations, unrolled on the graph.
#[derive(Debug, Clone, Copy)]
pub struct RichardsonLucy {
    pub iterations: usize,
    pub eps: f32,
}

impl Default for RichardsonLucy {
    fn default() -> Self {
        Self {
            iterations: 30,
            eps: 1e-7,
        }
    }
}

impl RichardsonLucy {
    pub fn new(iterations: usize) -> Self {
        Self {
            iterations,
            ..Self::default()
        }
    }
}

impl<B: Backend> Deconvolution<B> for RichardsonLucy {
    fn deconvolve(&self, observed: Tensor<B, 4>, psf: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, kh, kw] = psf.dims();
        let kernel = psf.reshape([kh, kw]);
        let energy = kernel.clone().sum().reshape([1, 1]);
        let kernel = kernel / energy;

        // Noise can push sensor values below zero; the multiplicative update needs them >= 0.
        let observed = observed.clamp_min(0.0);
        let mut estimate = observed.ones_like().mul_scalar(0.5);
        for _ in 0..self.iterations {
            let blurred = filter_same(estimate.clone(), kernel.clone(), true).add_scalar(self.eps);
            let ratio = observed.clone() / blurred;
            estimate = estimate * filter_same(ratio, kernel.clone(), false);
        }
        estimate
    }
}
