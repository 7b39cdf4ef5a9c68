//! The camera pipeline: DOE logits -> mask -> print -> PSF -> noisy sensor image.
//!
//! One `render` call is the full differentiable forward model of a co-design iteration. Every
//! tensor it returns stays on the autodiff graph rooted at the logits.

use burn_core as burn;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::compose::{convolve_psf, tensor_to_vec, SensorNoise};
use crate::doe::{Doe, DoeLogits};
use crate::litho::Lithography;
use crate::optics::Propagation;
use crate::{Error, Result};

/// Everything one forward pass produces.
#[derive(Debug, Clone)]
pub struct Capture<B: Backend> {
    /// `conv(target, psf) + noise`, same shape as the target batch.
    pub sensor_image: Tensor<B, 4>,
    /// `|field|²`, `[1, 1, m, m]`.
    pub psf: Tensor<B, 4>,
    /// `sum(psf)`, diagnostics only.
    pub psf_energy: f32,
    pub print_prediction: Tensor<B, 4>,
    pub mask_sample: Tensor<B, 4>,
}

/// Forward camera model for a DOE lens.
pub struct CameraPipeline<B: Backend> {
    doe: Doe<B>,
    propagation: Box<dyn Propagation<B>>,
    noise: Option<SensorNoise>,
    use_litho_model: bool,
    rng: ChaCha8Rng,
}

impl<B: Backend> CameraPipeline<B> {
    /// Camera with the fixed sensor-noise model `SensorNoise::CAMERA`.
    pub fn new(
        doe: Doe<B>,
        propagation: impl Propagation<B> + 'static,
        use_litho_model: bool,
        seed: u64,
    ) -> Self {
        Self {
            doe,
            propagation: Box::new(propagation),
            noise: Some(SensorNoise::CAMERA),
            use_litho_model,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Drop noise injection (the sensor image becomes the deterministic convolution).
    pub fn without_noise(mut self) -> Self {
        self.noise = None;
        self
    }

    pub fn doe(&self) -> &Doe<B> {
        &self.doe
    }

    pub fn uses_litho_model(&self) -> bool {
        self.use_litho_model
    }

    /// Mask sample -> print prediction -> PSF.
    ///
    /// Returns `(psf, psf_energy, print_prediction, mask_sample)`. A PSF with any non-finite
    /// element, or without positive energy, is a fatal error.
    pub fn psf(
        &mut self,
        logits: &DoeLogits<B>,
        litho: &dyn Lithography<B>,
    ) -> Result<(Tensor<B, 4>, f32, Tensor<B, 4>, Tensor<B, 4>)> {
        let mask = self.doe.sample(logits, &mut self.rng)?;
        let print_pred = if self.use_litho_model {
            litho.print(mask.clone())
        } else {
            mask.clone()
        };

        let psf = self.propagation.propagate(print_pred.clone())?.intensity();

        let values = tensor_to_vec(&psf)?;
        let bad = values.iter().filter(|v| !v.is_finite()).count();
        if bad > 0 {
            return Err(Error::NonFinitePsf { count: bad });
        }
        let psf_energy = values.iter().map(|&v| v as f64).sum::<f64>() as f32;
        if psf_energy <= 0.0 {
            return Err(Error::EmptyPsf);
        }

        Ok((psf, psf_energy, print_pred, mask))
    }

    /// Full forward pass for `target` (`[batch, channels, h, w]`).
    pub fn render(
        &mut self,
        logits: &DoeLogits<B>,
        target: Tensor<B, 4>,
        litho: &dyn Lithography<B>,
    ) -> Result<Capture<B>> {
        let (psf, psf_energy, print_prediction, mask_sample) = self.psf(logits, litho)?;

        let clean = convolve_psf(target, psf.clone(), true);
        let sensor_image = match self.noise {
            Some(noise) => {
                let n = noise.sample(&clean, &mut self.rng)?;
                clean + n
            }
            None => clean,
        };

        Ok(Capture {
            sensor_image,
            psf,
            psf_energy,
            print_prediction,
            mask_sample,
        })
    }
}
