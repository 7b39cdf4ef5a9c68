//! Loss evaluation for one co-design iteration.
//!
//! The loss variant is fixed when the evaluator is built:
//!
//! - [`Objective::Direct`] (`cbr`): `-ln(center_to_background_ratio(psf))`; no deconvolution.
//! - [`Objective::Computational`] (`deconv_loss`): deconvolve the sensor image, then smooth-L1
//!   against the target.
//!
//! Either way the evaluator also reports SSIM/PSNR scores of the sensor image (and of the
//! deconvolved image when there is one) against the target.

use burn_core as burn;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::compose::{center_to_background_ratio, tensor_to_vec};
use crate::config::{LossType, RunConfig};
use crate::deconv::{Deconvolution, RichardsonLucy};
use crate::metrics::{noise_score, structural_score, PsnrLoss, SsimLoss};
use crate::{Error, Result};

/// Smooth-L1 transition point used by the computational objective.
pub const SMOOTH_L1_BETA: f32 = 0.1;

/// Mean smooth-L1 (Huber-like) distance between `x` and `y`.
pub fn smooth_l1<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    y: Tensor<B, D>,
    beta: f32,
) -> Tensor<B, 1> {
    let d = (x - y).abs();
    let m = d.clone().clamp_max(beta);
    let quadratic = m.clone().powf_scalar(2.0).mul_scalar(0.5 / beta);
    (quadratic + (d - m)).mean()
}

/// The two loss variants.
pub enum Objective<B: Backend> {
    Direct {
        centersize: usize,
    },
    Computational {
        deconv: Box<dyn Deconvolution<B>>,
        beta: f32,
    },
}

impl<B: Backend> Objective<B> {
    pub fn loss_type(&self) -> LossType {
        match self {
            Objective::Direct { .. } => LossType::Cbr,
            Objective::Computational { .. } => LossType::DeconvLoss,
        }
    }
}

impl<B: Backend> std::fmt::Debug for Objective<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Objective::Direct { centersize } => f
                .debug_struct("Direct")
                .field("centersize", centersize)
                .finish(),
            Objective::Computational { beta, .. } => f
                .debug_struct("Computational")
                .field("beta", beta)
                .finish_non_exhaustive(),
        }
    }
}

/// Output of [`Evaluator::evaluate`].
#[derive(Debug, Clone)]
pub struct Evaluation<B: Backend> {
    /// Scalar loss, shape `[1]`, on the graph.
    pub loss: Tensor<B, 1>,
    pub deconv: Option<Tensor<B, 4>>,
    /// `[sensor vs target]` or `[sensor vs target, deconv vs target]`.
    pub ssim: Vec<f32>,
    pub psnr: Vec<f32>,
}

#[derive(Debug)]
pub struct Evaluator<B: Backend> {
    objective: Objective<B>,
    ssim: SsimLoss<B>,
    psnr: PsnrLoss,
}

impl<B: Backend> Evaluator<B> {
    pub fn new(objective: Objective<B>, ssim_window: usize, device: &B::Device) -> Result<Self> {
        Ok(Self {
            objective,
            ssim: SsimLoss::new(ssim_window, 1.0, device)?,
            psnr: PsnrLoss::default(),
        })
    }

    /// Resolve `run.loss_type` into an objective.
    pub fn from_config(run: &RunConfig, device: &B::Device) -> Result<Self> {
        let objective = match run.loss_type {
            LossType::Cbr => Objective::Direct {
                centersize: run.centersize,
            },
            LossType::DeconvLoss => Objective::Computational {
                deconv: Box::new(RichardsonLucy::new(run.rl_iterations)),
                beta: SMOOTH_L1_BETA,
            },
        };
        Self::new(objective, run.ssim_window, device)
    }

    pub fn loss_type(&self) -> LossType {
        self.objective.loss_type()
    }

    pub fn objective(&self) -> &Objective<B> {
        &self.objective
    }

    fn scores(&self, image: Tensor<B, 4>, target: Tensor<B, 4>) -> Result<(f32, f32)> {
        let (image, target) = (image.detach(), target.detach());
        let ssim = tensor_to_vec(&self.ssim.forward(image.clone(), target.clone()))?[0];
        let psnr = tensor_to_vec(&self.psnr.forward(image, target))?[0];
        Ok((structural_score(ssim), noise_score(psnr)))
    }

    pub fn evaluate(
        &self,
        sensor_image: Tensor<B, 4>,
        target: Tensor<B, 4>,
        psf: Tensor<B, 4>,
    ) -> Result<Evaluation<B>> {
        if sensor_image.dims() != target.dims() {
            return Err(Error::Shape(format!(
                "sensor image {:?} does not match target {:?}",
                sensor_image.dims(),
                target.dims()
            )));
        }

        let (s, p) = self.scores(sensor_image.clone(), target.clone())?;
        let (mut ssim, mut psnr) = (vec![s], vec![p]);

        let (loss, deconv) = match &self.objective {
            Objective::Direct { centersize } => {
                let cbr = center_to_background_ratio(psf, *centersize);
                (cbr.log().neg(), None)
            }
            Objective::Computational { deconv, beta } => {
                let restored = deconv.deconvolve(sensor_image, psf);
                let (s, p) = self.scores(restored.clone(), target.clone())?;
                ssim.push(s);
                psnr.push(p);
                (smooth_l1(restored.clone(), target, *beta), Some(restored))
            }
        };

        Ok(Evaluation {
            loss,
            deconv,
            ssim,
            psnr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::tensor_from_vec;
    use crate::CoDesignBackend as B;
    use std::cell::Cell;
    use std::rc::Rc;

    fn dev() -> <B as Backend>::Device {
        Default::default()
    }

    /// Counts calls, then delegates.
    struct Counting {
        inner: RichardsonLucy,
        calls: Rc<Cell<usize>>,
    }

    impl Deconvolution<B> for Counting {
        fn deconvolve(&self, observed: Tensor<B, 4>, psf: Tensor<B, 4>) -> Tensor<B, 4> {
            self.calls.set(self.calls.get() + 1);
            self.inner.deconvolve(observed, psf)
        }
    }

    fn gaussian_psf(n: usize, sigma: f32) -> Tensor<B, 4> {
        let c = (n / 2) as f32;
        let v: Vec<f32> = (0..n * n)
            .map(|i| {
                let (r, q) = ((i / n) as f32 - c, (i % n) as f32 - c);
                (-(r * r + q * q) / (2.0 * sigma * sigma)).exp()
            })
            .collect();
        tensor_from_vec(v, [1, 1, n, n], &dev())
    }

    fn target() -> Tensor<B, 4> {
        let v: Vec<f32> = (0..256).map(|i| ((i * 7) % 11) as f32 / 10.0).collect();
        tensor_from_vec(v, [1, 1, 16, 16], &dev())
    }

    fn scalar(t: Tensor<B, 1>) -> f32 {
        tensor_to_vec(&t).unwrap()[0]
    }

    #[test]
    fn smooth_l1_matches_closed_form() {
        let x = tensor_from_vec::<B, 1>(vec![0.0, 0.0, 0.0], [3], &dev());
        let y = tensor_from_vec::<B, 1>(vec![0.05, -0.1, 0.5], [3], &dev());
        let got = scalar(smooth_l1(x, y, 0.1));
        let want = (0.5 * 0.05f32 * 0.05 / 0.1 + 0.05 + (0.5 - 0.05)) / 3.0;
        assert!((got - want).abs() < 1e-6, "{got} vs {want}");
    }

    #[test]
    fn cbr_loss_is_zero_for_a_psf_inside_the_window() -> Result<()> {
        let ev = Evaluator::<B>::new(Objective::Direct { centersize: 10 }, 1, &dev())?;
        let mut v = vec![0.0f32; 256];
        v[8 * 16 + 8] = 2.0;
        v[7 * 16 + 9] = 1.0;
        let psf = tensor_from_vec(v, [1, 1, 16, 16], &dev());
        let out = ev.evaluate(target(), target(), psf)?;
        assert!(scalar(out.loss).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn direct_and_computational_report_the_right_metrics() -> Result<()> {
        let calls = Rc::new(Cell::new(0));
        let direct = Evaluator::<B>::new(Objective::Direct { centersize: 10 }, 1, &dev())?;
        let computational = Evaluator::<B>::new(
            Objective::Computational {
                deconv: Box::new(Counting {
                    inner: RichardsonLucy::new(5),
                    calls: calls.clone(),
                }),
                beta: SMOOTH_L1_BETA,
            },
            1,
            &dev(),
        )?;
        let psf = gaussian_psf(9, 1.0);
        let sensor = target().mul_scalar(0.9);

        let d = direct.evaluate(sensor.clone(), target(), psf.clone())?;
        assert!(d.deconv.is_none());
        assert_eq!((d.ssim.len(), d.psnr.len()), (1, 1));
        assert_eq!(calls.get(), 0);

        let c = computational.evaluate(sensor, target(), psf)?;
        assert_eq!(calls.get(), 1);
        assert_eq!(c.deconv.map(|t| t.dims()), Some([1, 1, 16, 16]));
        assert_eq!((c.ssim.len(), c.psnr.len()), (2, 2));
        assert_eq!(c.ssim[0], d.ssim[0]);
        assert_eq!(c.psnr[0], d.psnr[0]);
        Ok(())
    }

    #[test]
    fn evaluation_is_deterministic() -> Result<()> {
        let run = RunConfig {
            loss_type: LossType::DeconvLoss,
            rl_iterations: 4,
            ..RunConfig::default()
        };
        let ev = Evaluator::<B>::from_config(&run, &dev())?;
        assert_eq!(ev.loss_type(), LossType::DeconvLoss);
        let a = ev.evaluate(target(), target(), gaussian_psf(7, 1.2))?;
        let b = ev.evaluate(target(), target(), gaussian_psf(7, 1.2))?;
        assert_eq!(scalar(a.loss), scalar(b.loss));
        assert_eq!(a.ssim, b.ssim);
        assert_eq!(a.psnr, b.psnr);
        Ok(())
    }

    #[test]
    fn computational_loss_reaches_the_psf() -> Result<()> {
        let run = RunConfig {
            loss_type: LossType::DeconvLoss,
            rl_iterations: 3,
            ..RunConfig::default()
        };
        let ev = Evaluator::<B>::from_config(&run, &dev())?;
        let psf = gaussian_psf(7, 1.0).require_grad();
        let out = ev.evaluate(target().mul_scalar(0.8), target(), psf.clone())?;
        let grads = out.loss.backward();
        assert!(psf.grad(&grads).is_some());
        Ok(())
    }

    #[test]
    fn mismatched_shapes_are_rejected() -> Result<()> {
        let ev = Evaluator::<B>::new(Objective::Direct { centersize: 4 }, 1, &dev())?;
        let small = tensor_from_vec::<B, 4>(vec![0.0; 16], [1, 1, 4, 4], &dev());
        assert!(matches!(
            ev.evaluate(small, target(), gaussian_psf(5, 1.0)),
            Err(Error::Shape(_))
        ));
        Ok(())
    }
}
