//! DOE parameterization: trainable logits, a differentiable mask sample, and the discretized
//! profile that gets fabricated.
//!
//! Each *cell* of the DOE holds a categorical distribution over `num_level` printable heights.
//! The logits (`[cells, num_level]`) are the only trainable state of a co-design run.
//!
//! - `sample`: Gumbel-softmax relaxation `softmax((logits + g) / tau) · [0, 1, …, L−1]`,
//!   expanded from cells to pixels. Gradients flow back to the logits.
//! - `profile`: argmax level per cell, expanded to pixels (what `mask.bmp` stores).
//!
//! Cells tile the DOE either as square blocks (`free`) or as concentric rings (`rotational`).

use burn_core as burn;

use burn::module::{Module, Param};
use burn::tensor::activation::softmax;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use ndarray::Array2;

use crate::compose::{tensor_from_vec, tensor_to_vec};
use crate::config::{DoeConfig, DoeLayout};
use crate::{Error, Result};

/// The trainable logits, `[cells, num_level]`.
///
/// Kept as its own module so an optimizer can be bound to exactly this parameter set.
#[derive(Module, Debug)]
pub struct DoeLogits<B: Backend> {
    pub logits: Param<Tensor<B, 2>>,
}

impl<B: Backend> DoeLogits<B> {
    pub fn from_tensor(logits: Tensor<B, 2>) -> Self {
        Self {
            logits: Param::from_tensor(logits),
        }
    }

    pub fn val(&self) -> Tensor<B, 2> {
        self.logits.val()
    }

    pub fn dims(&self) -> [usize; 2] {
        self.logits.val().dims()
    }
}

#[derive(Debug, Clone)]
enum CellMap<B: Backend> {
    Blocks {
        cells_per_side: usize,
        block: usize,
    },
    Rings {
        /// One-hot `[n·n, rings]` pixel-to-ring matrix.
        basis: Tensor<B, 2>,
        ring_of_pixel: Vec<usize>,
    },
}

/// Layout and sampler of a DOE with `n × n` pixels.
#[derive(Debug, Clone)]
pub struct Doe<B: Backend> {
    n: usize,
    num_level: usize,
    tau: f32,
    stochastic: bool,
    /// Level heights `[num_level, 1]`.
    levels: Tensor<B, 2>,
    map: CellMap<B>,
}

impl<B: Backend> Doe<B> {
    pub fn new(cfg: &DoeConfig, input_shape: usize, device: &B::Device) -> Result<Self> {
        let n = input_shape;
        let p = cfg.num_partition;
        if n == 0 || p == 0 {
            return Err(Error::Domain("input_shape and num_partition must be >= 1".into()));
        }
        if cfg.num_level < 2 {
            return Err(Error::Domain("num_level must be >= 2".into()));
        }
        if !cfg.tau.is_finite() || cfg.tau <= 0.0 {
            return Err(Error::Domain("tau must be positive and finite".into()));
        }

        let map = match cfg.layout {
            DoeLayout::Free => {
                if n % p != 0 {
                    return Err(Error::Shape(format!(
                        "input_shape {n} is not divisible by num_partition {p}"
                    )));
                }
                CellMap::Blocks {
                    cells_per_side: p,
                    block: n / p,
                }
            }
            DoeLayout::Rotational => {
                let center = (n as f64 - 1.0) / 2.0;
                let width = (n as f64 / 2.0) / p as f64;
                let mut ring_of_pixel = Vec::with_capacity(n * n);
                for i in 0..n {
                    for j in 0..n {
                        let r = (i as f64 - center).hypot(j as f64 - center);
                        ring_of_pixel.push(((r / width) as usize).min(p - 1));
                    }
                }
                let mut onehot = vec![0.0f32; n * n * p];
                for (px, &ring) in ring_of_pixel.iter().enumerate() {
                    onehot[px * p + ring] = 1.0;
                }
                CellMap::Rings {
                    basis: tensor_from_vec(onehot, [n * n, p], device),
                    ring_of_pixel,
                }
            }
        };

        let levels: Vec<f32> = (0..cfg.num_level).map(|l| l as f32).collect();
        Ok(Self {
            n,
            num_level: cfg.num_level,
            tau: cfg.tau,
            stochastic: cfg.stochastic,
            levels: tensor_from_vec(levels, [cfg.num_level, 1], device),
            map,
        })
    }

    pub fn num_cells(&self) -> usize {
        match &self.map {
            CellMap::Blocks { cells_per_side, .. } => cells_per_side * cells_per_side,
            CellMap::Rings { basis, .. } => basis.dims()[1],
        }
    }

    pub fn num_level(&self) -> usize {
        self.num_level
    }

    pub fn side(&self) -> usize {
        self.n
    }

    /// Fresh logits, uniform in `[-0.01, 0.01]`.
    pub fn init_logits(&self, rng: &mut impl rand::Rng, device: &B::Device) -> DoeLogits<B> {
        let (cells, levels) = (self.num_cells(), self.num_level);
        let values: Vec<f32> = (0..cells * levels)
            .map(|_| rng.random::<f32>() * 0.02 - 0.01)
            .collect();
        DoeLogits::from_tensor(tensor_from_vec(values, [cells, levels], device))
    }

    fn check(&self, logits: &DoeLogits<B>) -> Result<()> {
        let expected = [self.num_cells(), self.num_level];
        if logits.dims() != expected {
            return Err(Error::Shape(format!(
                "logits must be {expected:?}, got {:?}",
                logits.dims()
            )));
        }
        Ok(())
    }

    /// Draw a differentiable mask sample `[1, 1, n, n]` in level units.
    ///
    /// When the DOE is not stochastic this is the expected profile and `rng` is untouched.
    pub fn sample(&self, logits: &DoeLogits<B>, rng: &mut impl rand::Rng) -> Result<Tensor<B, 4>> {
        self.check(logits)?;
        if !self.stochastic {
            return Ok(self.relaxed(logits.val()));
        }
        let [cells, levels] = logits.dims();
        let gumbel: Vec<f32> = (0..cells * levels)
            .map(|_| {
                let u = rng.random::<f64>().max(1e-12);
                (-(-u.ln()).ln()) as f32
            })
            .collect();
        let noise = tensor_from_vec(gumbel, [cells, levels], &logits.val().device());
        Ok(self.relaxed(logits.val() + noise))
    }

    /// Noise-free sample: the softmax-weighted mean level of every cell.
    pub fn expected(&self, logits: &DoeLogits<B>) -> Result<Tensor<B, 4>> {
        self.check(logits)?;
        Ok(self.relaxed(logits.val()))
    }

    fn relaxed(&self, scores: Tensor<B, 2>) -> Tensor<B, 4> {
        let weights = softmax(scores.div_scalar(self.tau), 1);
        let per_cell = weights.matmul(self.levels.clone());
        self.expand(per_cell)
    }

    /// `[cells, 1]` -> `[1, 1, n, n]`.
    fn expand(&self, per_cell: Tensor<B, 2>) -> Tensor<B, 4> {
        let n = self.n;
        match &self.map {
            CellMap::Blocks {
                cells_per_side: p,
                block: b,
            } => per_cell
                .reshape([*p, 1, *p, 1])
                .repeat_dim(1, *b)
                .repeat_dim(3, *b)
                .reshape([1, 1, n, n]),
            CellMap::Rings { basis, .. } => basis
                .clone()
                .matmul(per_cell)
                .reshape([1, 1, n, n]),
        }
    }

    /// Discretized profile for fabrication: the most likely level of every pixel.
    pub fn profile(&self, logits: &DoeLogits<B>) -> Result<Array2<u32>> {
        self.check(logits)?;
        let levels = self.num_level;
        let values = tensor_to_vec(&logits.val())?;
        let best: Vec<u32> = values
            .chunks(levels)
            .map(|row| {
                let mut arg = 0usize;
                for (l, &v) in row.iter().enumerate() {
                    if v > row[arg] {
                        arg = l;
                    }
                }
                arg as u32
            })
            .collect();

        let n = self.n;
        let profile = match &self.map {
            CellMap::Blocks {
                cells_per_side: p,
                block: b,
            } => Array2::from_shape_fn((n, n), |(i, j)| best[(i / b) * p + j / b]),
            CellMap::Rings { ring_of_pixel, .. } => {
                Array2::from_shape_fn((n, n), |(i, j)| best[ring_of_pixel[i * n + j]])
            }
        };
        Ok(profile)
    }
}
