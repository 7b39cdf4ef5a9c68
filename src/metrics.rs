//! Image-quality losses used for reporting (and available as training signals).
//!
//! Both losses are differentiable and return a `[1]` tensor averaged over the batch:
//!
//! - [`SsimLoss`]: `mean(clamp((1 - ssim_map) / 2, 0, 1))`, so 0 means identical images.
//! - [`PsnrLoss`]: `-psnr = -10·log10(max_val² / mse)`.
//!
//! The reported scores are derived from the raw losses with [`structural_score`] and
//! [`noise_score`].

use burn_core as burn;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::compose::{filter_same, tensor_from_vec};
use crate::{Error, Result};

/// Gaussian window width used by the structural-similarity statistics.
pub const SSIM_SIGMA: f32 = 1.5;

/// `1 - raw·2`: maps the SSIM loss back to an SSIM-like score in `[-1, 1]`.
pub fn structural_score(raw_ssim_loss: f32) -> f32 {
    1.0 - raw_ssim_loss * 2.0
}

/// `-raw`: the PSNR in dB.
pub fn noise_score(raw_psnr_loss: f32) -> f32 {
    -raw_psnr_loss
}

/// Structural-similarity loss with a Gaussian window.
#[derive(Debug, Clone)]
pub struct SsimLoss<B: Backend> {
    window: Tensor<B, 2>,
    c1: f32,
    c2: f32,
}

impl<B: Backend> SsimLoss<B> {
    /// `window_size` must be odd; 1 compares pixels directly.
    pub fn new(window_size: usize, max_val: f32, device: &B::Device) -> Result<Self> {
        if window_size == 0 || window_size % 2 == 0 {
            return Err(Error::Domain(format!(
                "ssim window must be odd and positive, got {window_size}"
            )));
        }
        if !max_val.is_finite() || max_val <= 0.0 {
            return Err(Error::Domain("ssim max_val must be positive and finite".into()));
        }
        let half = (window_size / 2) as f32;
        let g: Vec<f32> = (0..window_size)
            .map(|i| {
                let d = i as f32 - half;
                (-(d * d) / (2.0 * SSIM_SIGMA * SSIM_SIGMA)).exp()
            })
            .collect();
        let mut w = Vec::with_capacity(window_size * window_size);
        for a in &g {
            for b in &g {
                w.push(a * b);
            }
        }
        let total: f32 = w.iter().sum();
        w.iter_mut().for_each(|v| *v /= total);

        Ok(Self {
            window: tensor_from_vec(w, [window_size, window_size], device),
            c1: (0.01 * max_val).powi(2),
            c2: (0.03 * max_val).powi(2),
        })
    }

    fn local_mean(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        filter_same(x, self.window.clone(), false)
    }

    pub fn forward(&self, x: Tensor<B, 4>, y: Tensor<B, 4>) -> Tensor<B, 1> {
        let mu_x = self.local_mean(x.clone());
        let mu_y = self.local_mean(y.clone());
        let mu_xx = mu_x.clone() * mu_x.clone();
        let mu_yy = mu_y.clone() * mu_y.clone();
        let mu_xy = mu_x * mu_y;

        let s_xx = self.local_mean(x.clone() * x.clone()) - mu_xx.clone();
        let s_yy = self.local_mean(y.clone() * y.clone()) - mu_yy.clone();
        let s_xy = self.local_mean(x * y) - mu_xy.clone();

        let num =
            mu_xy.mul_scalar(2.0).add_scalar(self.c1) * s_xy.mul_scalar(2.0).add_scalar(self.c2);
        let den = (mu_xx + mu_yy).add_scalar(self.c1) * (s_xx + s_yy).add_scalar(self.c2);
        let ssim = num / den;

        ssim.neg().add_scalar(1.0).div_scalar(2.0).clamp(0.0, 1.0).mean()
    }
}

/// Negative peak signal-to-noise ratio.
#[derive(Debug, Clone, Copy)]
pub struct PsnrLoss {
    pub max_val: f32,
}

impl Default for PsnrLoss {
    fn default() -> Self {
        Self { max_val: 1.0 }
    }
}

impl PsnrLoss {
    pub fn forward<B: Backend>(&self, x: Tensor<B, 4>, y: Tensor<B, 4>) -> Tensor<B, 1> {
        let mse = (x - y).powf_scalar(2.0).mean();
        // 10·log10(mse / max²)
        mse.div_scalar(self.max_val * self.max_val)
            .log()
            .mul_scalar(10.0 / std::f32::consts::LN_10)
    }
}
