//! Lithography forward models: designed mask -> predicted printed profile.
//!
//! Models are chosen by identifier (`LithoChoice`):
//!
//! - `ideal`: the mask prints perfectly.
//! - `gaussian`: a fixed proximity blur; no parameters.
//! - `cnn`: a small residual conv net `mask + conv(relu(conv(mask)))`, meant to be loaded from a
//!   pretrained PyTorch state dict `learned_litho_model_cnn.pt`.
//!
//! State-dict keys are remapped onto [`CnnLitho`]: `conv1.*`/`conv2.*` load as-is, and the
//! `nn.Sequential` layout (`net.0.*`, `net.2.*`, also under `model.` or `layers.`) maps to
//! them. A burn record `learned_litho_model_cnn.mpk` is read when no `.pt` file exists.
//!
//! Pretrained parameters are frozen (`no_grad`). Gradients still flow *through* a model to the
//! mask, which is what the co-design loop needs.

use std::path::{Path, PathBuf};

use burn_core as burn;

use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use burn_nn::conv::{Conv2d, Conv2dConfig};
use burn_nn::{PaddingConfig2d, Relu};

use crate::compose::{filter_same, tensor_from_vec};
use crate::config::{LithoChoice, LithoConfig, RunConfig};
use crate::{Error, Result};

/// `(pattern, replacement)` applied to PyTorch state-dict keys before loading [`CnnLitho`].
pub const STATE_DICT_REMAP: [(&str, &str); 2] = [
    (r"^(?:net|model|layers)\.0\.(.+)$", "conv1.$1"),
    (r"^(?:net|model|layers)\.2\.(.+)$", "conv2.$1"),
];

/// Maps a mask `[1, 1, n, n]` to a print prediction of the same shape and units.
pub trait Lithography<B: Backend> {
    fn print(&self, mask: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// Isotropic Gaussian proximity blur (zero-padded at the DOE border).
#[derive(Debug, Clone)]
pub struct GaussianProximity<B: Backend> {
    kernel: Tensor<B, 2>,
}

impl<B: Backend> GaussianProximity<B> {
    /// `sigma` in DOE pixels; the kernel spans `±ceil(3σ)`.
    pub fn new(sigma: f32, device: &B::Device) -> Result<Self> {
        if !sigma.is_finite() || sigma <= 0.0 {
            return Err(Error::Domain("gaussian sigma must be positive and finite".into()));
        }
        let radius = (3.0 * sigma).ceil() as usize;
        let size = 2 * radius + 1;
        let mut k = Vec::with_capacity(size * size);
        for i in 0..size {
            for j in 0..size {
                let (di, dj) = (i as f32 - radius as f32, j as f32 - radius as f32);
                k.push((-(di * di + dj * dj) / (2.0 * sigma * sigma)).exp());
            }
        }
        let total: f32 = k.iter().sum();
        k.iter_mut().for_each(|v| *v /= total);
        Ok(Self {
            kernel: tensor_from_vec(k, [size, size], device),
        })
    }
}

impl<B: Backend> Lithography<B> for GaussianProximity<B> {
    fn print(&self, mask: Tensor<B, 4>) -> Tensor<B, 4> {
        filter_same(mask, self.kernel.clone(), false)
    }
}

/// Learned residual lithography model.
#[derive(Module, Debug)]
pub struct CnnLitho<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
}

impl<B: Backend> CnnLitho<B> {
    pub fn new(hidden: usize, device: &B::Device) -> Self {
        let conv1 = Conv2dConfig::new([1, hidden], [5, 5])
            .with_padding(PaddingConfig2d::Explicit(2, 2))
            .init(device);
        let conv2 = Conv2dConfig::new([hidden, 1], [5, 5])
            .with_padding(PaddingConfig2d::Explicit(2, 2))
            .init(device);
        Self { conv1, conv2 }
    }

    pub fn forward(&self, mask: Tensor<B, 4>) -> Tensor<B, 4> {
        let h = Relu.forward(self.conv1.forward(mask.clone()));
        mask + self.conv2.forward(h)
    }
}

impl<B: Backend> Lithography<B> for CnnLitho<B> {
    fn print(&self, mask: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward(mask)
    }
}

/// The selectable lithography models.
#[derive(Debug)]
pub enum LithoModel<B: Backend> {
    Ideal,
    Gaussian(GaussianProximity<B>),
    Cnn(CnnLitho<B>),
}

/// `<dir>/learned_litho_model_<id>.pt`.
pub fn checkpoint_path(dir: &Path, choice: LithoChoice) -> PathBuf {
    dir.join(format!("learned_litho_model_{}.pt", choice.as_str()))
}

/// `<dir>/learned_litho_model_<id>.mpk`, the burn-native fallback.
pub fn record_path(dir: &Path, choice: LithoChoice) -> PathBuf {
    checkpoint_path(dir, choice).with_extension("mpk")
}

impl<B: Backend> CnnLitho<B> {
    /// Load parameters from a PyTorch state dict at `path`.
    pub fn load_state_dict(self, path: &Path, device: &B::Device) -> Result<Self> {
        let args = STATE_DICT_REMAP
            .iter()
            .fold(LoadArgs::new(path.to_path_buf()), |args, (pattern, replacement)| {
                args.with_key_remap(pattern, replacement)
            });
        let record: CnnLithoRecord<B> = PyTorchFileRecorder::<FullPrecisionSettings>::default()
            .load(args, device)
            .map_err(|e| Error::Checkpoint(format!("{}: {e:?}", path.display())))?;
        Ok(self.load_record(record))
    }
}

impl<B: Backend> LithoModel<B> {
    /// Build the model named by `choice` with freshly initialized parameters.
    pub fn select(choice: LithoChoice, cfg: &LithoConfig, device: &B::Device) -> Result<Self> {
        Ok(match choice {
            LithoChoice::Ideal => LithoModel::Ideal,
            LithoChoice::Gaussian => {
                LithoModel::Gaussian(GaussianProximity::new(cfg.gaussian_sigma, device)?)
            }
            LithoChoice::Cnn => LithoModel::Cnn(CnnLitho::new(cfg.cnn_hidden, device)),
        })
    }

    /// The model a run actually uses.
    ///
    /// With `use_litho_model_flag` off the mask bypasses lithography, so no model (and no
    /// trainable parameter) is built. With it on, the selected model is loaded and frozen.
    pub fn for_run(run: &RunConfig, cfg: &LithoConfig, device: &B::Device) -> Result<Self> {
        if !run.use_litho_model_flag {
            return Ok(LithoModel::Ideal);
        }
        Self::select(run.model_choice, cfg, device)?.load_pretrained(&cfg.checkpoint_dir, device)
    }

    pub fn choice(&self) -> LithoChoice {
        match self {
            LithoModel::Ideal => LithoChoice::Ideal,
            LithoModel::Gaussian(_) => LithoChoice::Gaussian,
            LithoModel::Cnn(_) => LithoChoice::Cnn,
        }
    }

    /// Load pretrained parameters from `dir` and freeze them.
    ///
    /// Parameter-free models are returned unchanged.
    pub fn load_pretrained(self, dir: &Path, device: &B::Device) -> Result<Self> {
        match self {
            LithoModel::Cnn(model) => {
                let pt = checkpoint_path(dir, LithoChoice::Cnn);
                let mpk = record_path(dir, LithoChoice::Cnn);
                let (model, path) = if pt.is_file() {
                    (model.load_state_dict(&pt, device)?, pt)
                } else if mpk.is_file() {
                    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
                    let model = model
                        .load_file(mpk.clone(), &recorder, device)
                        .map_err(|e| Error::Checkpoint(format!("{}: {e:?}", mpk.display())))?;
                    (model, mpk)
                } else {
                    return Err(Error::Checkpoint(format!(
                        "no checkpoint at {} (or {})",
                        pt.display(),
                        mpk.display()
                    )));
                };
                tracing::info!(path = %path.display(), "loaded pretrained litho model");
                Ok(LithoModel::Cnn(model.no_grad()))
            }
            other => {
                tracing::info!(
                    model = other.choice().as_str(),
                    "litho model has no parameters to load"
                );
                Ok(other)
            }
        }
    }
}

impl<B: Backend> Lithography<B> for LithoModel<B> {
    fn print(&self, mask: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            LithoModel::Ideal => mask,
            LithoModel::Gaussian(m) => m.print(mask),
            LithoModel::Cnn(m) => m.print(mask),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::{plane, tensor_to_vec};
    use crate::CoDesignBackend as B;

    fn dev() -> <B as Backend>::Device {
        Default::default()
    }

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("litholens-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn step_mask() -> Tensor<B, 4> {
        let v: Vec<f32> = (0..256).map(|i| if i % 16 < 8 { 0.0 } else { 3.0 }).collect();
        tensor_from_vec(v, [1, 1, 16, 16], &dev())
    }

    #[test]
    fn ideal_is_identity() -> Result<()> {
        let m = LithoModel::<B>::select(LithoChoice::Ideal, &LithoConfig::default(), &dev())?;
        let mask = step_mask();
        assert_eq!(tensor_to_vec(&m.print(mask.clone()))?, tensor_to_vec(&mask)?);
        Ok(())
    }

    #[test]
    fn gaussian_smooths_edges_and_keeps_flat_regions() -> Result<()> {
        let m = LithoModel::<B>::select(LithoChoice::Gaussian, &LithoConfig::default(), &dev())?;
        let out = plane(&m.print(step_mask()), 0, 0)?;
        // Interior of a flat region is unchanged, the edge is softened.
        assert!((out[[8, 12]] - 3.0).abs() < 1e-3);
        assert!(out[[8, 8]] > 0.5 && out[[8, 8]] < 3.0);
        assert!(out[[8, 7]] > 0.0 && out[[8, 7]] < 2.5);
        Ok(())
    }

    #[test]
    fn cnn_preserves_shape() -> Result<()> {
        let m = LithoModel::<B>::select(LithoChoice::Cnn, &LithoConfig::default(), &dev())?;
        assert_eq!(m.print(step_mask()).dims(), [1, 1, 16, 16]);
        Ok(())
    }

    #[test]
    fn missing_checkpoint_is_reported() {
        let dir = scratch_dir("missing");
        let m = LithoModel::<B>::select(LithoChoice::Cnn, &LithoConfig::default(), &dev()).unwrap();
        assert!(matches!(
            m.load_pretrained(&dir, &dev()),
            Err(Error::Checkpoint(_))
        ));
    }

    fn fixture() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/data/learned_litho_model_cnn.pt")
    }

    fn hidden4() -> LithoConfig {
        LithoConfig {
            cnn_hidden: 4,
            ..LithoConfig::default()
        }
    }

    fn assert_frozen(loaded: &LithoModel<B>, out: Tensor<B, 4>, mask: &Tensor<B, 4>) {
        let grads = out.powf_scalar(2.0).mean().backward();
        assert!(mask.grad(&grads).is_some(), "gradient must flow to the mask");
        match loaded {
            LithoModel::Cnn(m) => {
                assert!(m.conv1.weight.val().grad(&grads).is_none());
                assert!(m.conv2.weight.val().grad(&grads).is_none());
            }
            other => panic!("expected the cnn model, got {:?}", other.choice()),
        }
    }

    /// `tests/data/learned_litho_model_cnn.pt` is a PyTorch state dict of
    /// `nn.Sequential(Conv2d(1, 4, 5, padding=2), ReLU(), Conv2d(4, 1, 5, padding=2))` saved
    /// as `net`: centre taps `net.0.weight[0, 0] = 1`, `net.2.weight[0, 0] = 2`, bias
    /// `net.2.bias = 0.25`, everything else zero. On a non-negative mask it prints
    /// `3·mask + 0.25`.
    #[test]
    fn pytorch_state_dict_loads_through_the_key_remap() -> Result<()> {
        let dir = scratch_dir("pt");
        let pt = checkpoint_path(&dir, LithoChoice::Cnn);
        assert_eq!(pt.file_name().and_then(|n| n.to_str()), Some("learned_litho_model_cnn.pt"));
        std::fs::copy(fixture(), &pt)?;

        let loaded = LithoModel::<B>::select(LithoChoice::Cnn, &hidden4(), &dev())?
            .load_pretrained(&dir, &dev())?;

        let mask = step_mask().require_grad();
        let out = loaded.print(mask.clone());
        let want = tensor_to_vec(&mask)?;
        for (m, got) in want.iter().zip(tensor_to_vec(&out)?) {
            assert!((got - (3.0 * m + 0.25)).abs() < 1e-5, "{got} vs {}", 3.0 * m + 0.25);
        }
        assert_frozen(&loaded, out, &mask);
        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn pytorch_checkpoint_wins_over_the_burn_record() -> Result<()> {
        let dir = scratch_dir("both");
        std::fs::copy(fixture(), checkpoint_path(&dir, LithoChoice::Cnn))?;
        CnnLitho::<B>::new(4, &dev())
            .save_file(
                record_path(&dir, LithoChoice::Cnn),
                &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
            )
            .map_err(|e| Error::Checkpoint(format!("{e:?}")))?;

        let loaded = LithoModel::<B>::select(LithoChoice::Cnn, &hidden4(), &dev())?
            .load_pretrained(&dir, &dev())?;
        let out = plane(&loaded.print(step_mask()), 0, 0)?;
        assert!((out[[0, 0]] - 0.25).abs() < 1e-5);
        assert!((out[[0, 15]] - 9.25).abs() < 1e-5);
        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn corrupt_pytorch_checkpoint_is_reported() -> Result<()> {
        let dir = scratch_dir("corrupt");
        std::fs::write(checkpoint_path(&dir, LithoChoice::Cnn), b"not a zip archive")?;
        let m = LithoModel::<B>::select(LithoChoice::Cnn, &hidden4(), &dev())?;
        assert!(matches!(
            m.load_pretrained(&dir, &dev()),
            Err(Error::Checkpoint(_))
        ));
        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn flag_off_bypasses_the_selected_model() -> Result<()> {
        // No checkpoint exists, so anything but the bypass would fail to load.
        let cfg = LithoConfig {
            checkpoint_dir: scratch_dir("bypass"),
            ..LithoConfig::default()
        };
        for choice in [LithoChoice::Ideal, LithoChoice::Gaussian, LithoChoice::Cnn] {
            let run = RunConfig {
                model_choice: choice,
                use_litho_model_flag: false,
                ..RunConfig::default()
            };
            let m = LithoModel::<B>::for_run(&run, &cfg, &dev())?;
            assert_eq!(m.choice(), LithoChoice::Ideal);
        }

        let run = RunConfig {
            model_choice: LithoChoice::Cnn,
            use_litho_model_flag: true,
            ..RunConfig::default()
        };
        assert!(matches!(
            LithoModel::<B>::for_run(&run, &cfg, &dev()),
            Err(Error::Checkpoint(_))
        ));

        let run = RunConfig {
            model_choice: LithoChoice::Gaussian,
            ..run
        };
        assert_eq!(
            LithoModel::<B>::for_run(&run, &cfg, &dev())?.choice(),
            LithoChoice::Gaussian
        );
        let _ = std::fs::remove_dir_all(&cfg.checkpoint_dir);
        Ok(())
    }

    #[test]
    fn burn_record_fallback_round_trips_and_is_frozen() -> Result<()> {
        let dir = scratch_dir("ckpt");
        let trained = CnnLitho::<B>::new(4, &dev());
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        trained
            .clone()
            .save_file(record_path(&dir, LithoChoice::Cnn), &recorder)
            .map_err(|e| Error::Checkpoint(format!("{e:?}")))?;

        assert!(!checkpoint_path(&dir, LithoChoice::Cnn).exists());
        let loaded = LithoModel::<B>::select(LithoChoice::Cnn, &hidden4(), &dev())?
            .load_pretrained(&dir, &dev())?;

        let mask = step_mask().require_grad();
        let want = tensor_to_vec(&trained.forward(mask.clone()))?;
        let out = loaded.print(mask.clone());
        let got = tensor_to_vec(&out)?;
        for (a, b) in want.iter().zip(&got) {
            assert!((a - b).abs() < 1e-5);
        }
        assert_frozen(&loaded, out, &mask);
        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }
}
