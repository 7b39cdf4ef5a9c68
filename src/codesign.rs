//! The co-design optimization driver.
//!
//! A run moves linearly through `INIT -> ITERATING -> FINALIZE -> DONE`:
//!
//! - **INIT**: AdamW bound to the DOE logits alone, the learning-rate schedule, empty history.
//! - **ITERATING** (`num_iters` times): render, evaluate, backpropagate, step, record, and
//!   every `image_visualize_interval` iterations hand a frame to the diagnostics sink.
//! - **FINALIZE**: discretize the logits into a profile and write `mask.bmp` / `psf.bmp`.
//!
//! Any error (including a non-finite PSF) aborts the run before FINALIZE, so artifacts exist
//! only for runs that completed every iteration.

use std::path::PathBuf;

use burn_core as burn;

use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;
use burn_optim::{AdamWConfig, GradientsParams, Optimizer};
use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::camera::{CameraPipeline, Capture};
use crate::compose::{central_crop, normalize, plane, tensor_to_vec, SensorNoise};
use crate::config::{CoDesignConfig, RunConfig};
use crate::diagnostics::{DiagnosticFrame, Diagnostics, LogDiagnostics};
use crate::doe::{Doe, DoeLogits};
use crate::export;
use crate::litho::{Lithography, LithoModel};
use crate::objective::Evaluator;
use crate::optics::FreeSpace;
use crate::schedule;
use crate::{Error, Result};

/// Side of the PSF snapshot kept for diagnostics and `psf.bmp`.
pub const PSF_SNAPSHOT_SIZE: usize = 128;

/// Result of a completed run.
#[derive(Debug)]
pub struct CoDesignOutcome<B: AutodiffBackend> {
    /// Optimized logits.
    pub logits: DoeLogits<B>,
    /// Per-pixel fabrication levels (`mask.bmp` stores these plus 10).
    pub profile: Array2<u32>,
    /// Print prediction of the last iteration, detached.
    pub print_prediction: Tensor<B, 4>,
    /// `(iteration, loss)`, one entry per optimizer step.
    pub history: Vec<(usize, f32)>,
    pub psf_snapshot: Array2<f32>,
    pub mask_path: PathBuf,
    pub psf_path: PathBuf,
}

impl<B: AutodiffBackend> CoDesignOutcome<B> {
    pub fn final_loss(&self) -> Option<f32> {
        self.history.last().map(|&(_, loss)| loss)
    }
}

/// Run context of one co-design: everything a run needs, consumed by [`CoDesign::run`].
pub struct CoDesign<B: AutodiffBackend> {
    run: RunConfig,
    camera: CameraPipeline<B>,
    litho: Box<dyn Lithography<B>>,
    evaluator: Evaluator<B>,
    logits: DoeLogits<B>,
    diagnostics: Box<dyn Diagnostics>,
}

fn psf_snapshot<B: AutodiffBackend>(psf: &Tensor<B, 4>) -> Result<Array2<f32>> {
    Ok(central_crop(&normalize(&plane(psf, 0, 0)?), PSF_SNAPSHOT_SIZE))
}

impl<B: AutodiffBackend> CoDesign<B> {
    /// Build the full stack from configuration.
    ///
    /// Fails on invalid configuration, inconsistent geometry or a missing litho checkpoint.
    pub fn new(cfg: &CoDesignConfig, device: &B::Device) -> Result<Self> {
        cfg.validate()?;
        let run = cfg.run.clone();

        let doe = Doe::new(&cfg.doe, cfg.optics.input_shape, device)?;
        let propagation = FreeSpace::new(&cfg.optics, cfg.litho.slicing_distance, device)?;

        let litho = LithoModel::for_run(&run, &cfg.litho, device)?;
        tracing::debug!(
            model_choice = run.model_choice.as_str(),
            litho = litho.choice().as_str(),
            "lithography model ready"
        );

        let evaluator = Evaluator::from_config(&run, device)?;
        let logits = doe.init_logits(&mut ChaCha8Rng::seed_from_u64(run.seed), device);
        let camera = CameraPipeline::new(
            doe,
            propagation,
            run.use_litho_model_flag,
            run.seed.wrapping_add(1),
        );

        Ok(Self::from_parts(run, camera, Box::new(litho), evaluator, logits))
    }

    /// Assemble a run from already-built collaborators.
    pub fn from_parts(
        run: RunConfig,
        camera: CameraPipeline<B>,
        litho: Box<dyn Lithography<B>>,
        evaluator: Evaluator<B>,
        logits: DoeLogits<B>,
    ) -> Self {
        Self {
            run,
            camera,
            litho,
            evaluator,
            logits,
            diagnostics: Box::new(LogDiagnostics),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Box<dyn Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn logits(&self) -> &DoeLogits<B> {
        &self.logits
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.run
    }

    /// Optimize the DOE for `target` (`[batch, channels, h, w]`).
    pub fn run(self, target: Tensor<B, 4>) -> Result<CoDesignOutcome<B>> {
        let CoDesign {
            run,
            mut camera,
            litho,
            evaluator,
            mut logits,
            mut diagnostics,
        } = self;
        if run.num_iters == 0 {
            return Err(Error::Domain("num_iters must be >= 1".into()));
        }
        if run.image_visualize_interval == 0 {
            return Err(Error::Domain("image_visualize_interval must be >= 1".into()));
        }

        // INIT
        let mut optim = AdamWConfig::new()
            .with_beta_1(0.9)
            .with_beta_2(0.999)
            .with_epsilon(1e-8)
            .with_weight_decay(0.01)
            .init::<B, DoeLogits<B>>();
        let mut lr_schedule = schedule::from_run(run.lr, run.use_scheduler)?;
        let mut history: Vec<(usize, f32)> = Vec::with_capacity(run.num_iters);
        let mut snapshot: Option<Array2<f32>> = None;
        let mut last: Option<Capture<B>> = None;

        let camera_noise = SensorNoise::CAMERA;
        if run.cam_a_poisson != camera_noise.a_poisson || run.cam_b_sqrt != camera_noise.b_sqrt {
            tracing::warn!(
                cam_a_poisson = run.cam_a_poisson,
                cam_b_sqrt = run.cam_b_sqrt,
                used_a = camera_noise.a_poisson,
                used_b = camera_noise.b_sqrt,
                "configured noise coefficients are recorded but the camera uses its fixed model"
            );
        }
        tracing::info!(
            loss_type = evaluator.loss_type().as_str(),
            num_iters = run.num_iters,
            lr = run.lr,
            use_scheduler = run.use_scheduler,
            use_litho_model = camera.uses_litho_model(),
            target = ?target.dims(),
            "starting co-design"
        );

        // ITERATING
        for i in 0..run.num_iters {
            // Each backward pass yields fresh gradients; nothing accumulates across iterations.
            let capture = camera
                .render(&logits, target.clone(), litho.as_ref())
                .inspect_err(|e| {
                    tracing::error!(iteration = i, error = %e, "forward pass failed");
                })?;
            let eval = evaluator.evaluate(
                capture.sensor_image.clone(),
                target.clone(),
                capture.psf.clone(),
            )?;
            let loss = tensor_to_vec(&eval.loss)?[0];

            let lr = lr_schedule.current_lr();
            let grads = eval.loss.backward();
            let grads = GradientsParams::from_grads(grads, &logits);
            logits = optim.step(lr, logits, grads);
            lr_schedule.step();

            history.push((i, loss));
            tracing::debug!(iteration = i, loss, lr, psf_energy = capture.psf_energy, "step");

            if (i + 1) % run.image_visualize_interval == 0 {
                let psf = psf_snapshot(&capture.psf)?;
                let mask = plane(&capture.mask_sample, 0, 0)?;
                let sensor = plane(&capture.sensor_image, 0, 0)?;
                let deconv = eval.deconv.as_ref().map(|t| plane(t, 0, 0)).transpose()?;
                diagnostics.visualize(&DiagnosticFrame {
                    iteration: i,
                    loss,
                    psf_energy: capture.psf_energy,
                    ssim: &eval.ssim,
                    psnr: &eval.psnr,
                    mask: &mask,
                    psf: &psf,
                    sensor: &sensor,
                    deconv: deconv.as_ref(),
                    history: &history,
                })?;
                snapshot = Some(psf);
            }
            last = Some(capture);
        }

        // FINALIZE
        let last = last.ok_or_else(|| Error::Domain("no iteration ran".into()))?;
        let psf_snapshot = match snapshot {
            Some(s) => s,
            None => psf_snapshot(&last.psf)?,
        };
        let profile = camera.doe().profile(&logits)?;
        let (mask_path, psf_path) = export::save_artifacts(&run.save_dir, &profile, &psf_snapshot)?;

        let outcome = CoDesignOutcome {
            logits,
            profile,
            print_prediction: last.print_prediction.detach(),
            history,
            psf_snapshot,
            mask_path,
            psf_path,
        };
        tracing::info!(final_loss = ?outcome.final_loss(), "co-design finished");
        Ok(outcome)
    }
}
