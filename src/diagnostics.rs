//! Per-interval diagnostics of a running co-design.
//!
//! The driver hands one [`DiagnosticFrame`] to its [`Diagnostics`] sink every
//! `image_visualize_interval` iterations. Frames carry host-side snapshots only.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use image::ImageFormat;
use ndarray::Array2;
use plotters::prelude::{BitMapBackend, ChartBuilder, IntoDrawingArea, LineSeries, BLUE, WHITE};

use crate::compose::normalize;
use crate::export::unit_image;
use crate::{Error, Result};

/// Pixel size of `loss.png`.
pub const LOSS_PLOT_SIZE: (u32, u32) = (640, 480);

/// Snapshot of one visualized iteration.
#[derive(Debug, Clone, Copy)]
pub struct DiagnosticFrame<'a> {
    pub iteration: usize,
    pub loss: f32,
    pub psf_energy: f32,
    pub ssim: &'a [f32],
    pub psnr: &'a [f32],
    /// Mask sample, plane `[0, 0]`.
    pub mask: &'a Array2<f32>,
    /// Normalized, center-cropped PSF; this is what ends up in `psf.bmp`.
    pub psf: &'a Array2<f32>,
    pub sensor: &'a Array2<f32>,
    pub deconv: Option<&'a Array2<f32>>,
    /// `(iteration, loss)` for every step so far.
    pub history: &'a [(usize, f32)],
}

pub trait Diagnostics {
    fn visualize(&mut self, frame: &DiagnosticFrame<'_>) -> Result<()>;
}

/// Structured log line per frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDiagnostics;

impl Diagnostics for LogDiagnostics {
    fn visualize(&mut self, frame: &DiagnosticFrame<'_>) -> Result<()> {
        tracing::info!(
            iteration = frame.iteration,
            loss = frame.loss,
            psf_energy = frame.psf_energy,
            ssim = ?frame.ssim,
            psnr = ?frame.psnr,
            "co-design progress"
        );
        Ok(())
    }
}

/// Axis ranges covering every finite point, never empty.
fn loss_bounds(history: &[(usize, f32)]) -> (f64, f64, f64) {
    let x_max = history.last().map_or(1, |&(i, _)| i.max(1)) as f64;
    let (lo, hi) = history
        .iter()
        .map(|&(_, l)| f64::from(l))
        .filter(|l| l.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), l| (lo.min(l), hi.max(l)));
    if lo > hi {
        return (x_max, 0.0, 1.0);
    }
    let pad = ((hi - lo) * 0.05).max(1e-3);
    (x_max, lo - pad, hi + pad)
}

/// Draw the loss curve to `path` (format from the extension).
///
/// No text is drawn, so no font backend is needed.
pub fn plot_loss(path: &Path, history: &[(usize, f32)]) -> Result<()> {
    let (x_max, y_min, y_max) = loss_bounds(history);
    let root = BitMapBackend::new(path, LOSS_PLOT_SIZE).into_drawing_area();
    root.fill(&WHITE)
        .map_err(|e| Error::Plot(format!("backend error: {e}")))?;
    {
        let mut chart = ChartBuilder::on(&root)
            .margin(16)
            .build_cartesian_2d(0.0..x_max, y_min..y_max)
            .map_err(|e| Error::Plot(format!("chart build error: {e}")))?;
        let points = history
            .iter()
            .filter(|(_, l)| l.is_finite())
            .map(|&(i, l)| (i as f64, f64::from(l)));
        chart
            .draw_series(LineSeries::new(points, &BLUE))
            .map_err(|e| Error::Plot(format!("series error: {e}")))?;
    }
    root.present()
        .map_err(|e| Error::Plot(format!("{}: {e}", path.display())))?;
    Ok(())
}

/// Logs like [`LogDiagnostics`] and writes PNG snapshots, `loss.png` and `loss.csv` into a
/// directory.
#[derive(Debug, Clone)]
pub struct ImageDiagnostics {
    dir: PathBuf,
}

impl ImageDiagnostics {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot(&self, name: &str, iteration: usize, values: &Array2<f32>) -> Result<()> {
        let path = self.dir.join(format!("{name}_itr{iteration:05}.png"));
        unit_image(&normalize(values)).save_with_format(&path, ImageFormat::Png)?;
        Ok(())
    }
}

impl Diagnostics for ImageDiagnostics {
    fn visualize(&mut self, frame: &DiagnosticFrame<'_>) -> Result<()> {
        LogDiagnostics.visualize(frame)?;

        let i = frame.iteration;
        self.snapshot("mask", i, frame.mask)?;
        self.snapshot("psf", i, frame.psf)?;
        self.snapshot("sensor", i, frame.sensor)?;
        if let Some(deconv) = frame.deconv {
            self.snapshot("deconv", i, deconv)?;
        }

        let mut csv = String::from("iteration,loss\n");
        for (it, loss) in frame.history {
            // Writing to a String cannot fail.
            let _ = writeln!(csv, "{it},{loss}");
        }
        std::fs::write(self.dir.join("loss.csv"), csv)?;
        plot_loss(&self.dir.join("loss.png"), frame.history)
    }
}
