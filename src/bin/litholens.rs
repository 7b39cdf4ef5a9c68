//! litholens CLI: co-design a DOE lens from a TOML configuration.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use image::imageops::FilterType;
use ndarray::Array2;

use litholens::codesign::CoDesign;
use litholens::compose::tensor_from_vec;
use litholens::config::CoDesignConfig;
use litholens::diagnostics::ImageDiagnostics;
use litholens::CoDesignBackend;

#[derive(Parser)]
#[command(name = "litholens")]
#[command(about = "Co-design a diffractive lens through lithography and camera models")]
#[command(version)]
struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Grayscale target image; a synthetic bar/point chart is used when omitted.
    #[arg(long)]
    target: Option<PathBuf>,

    /// Overrides `run.save_dir`.
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Write PNG snapshots, `loss.png` and `loss.csv` here at every visualization interval.
    #[arg(long)]
    diagnostics_dir: Option<PathBuf>,
}

/// Bars of increasing width plus a few isolated points, values in `[0, 1]`.
fn synthetic_chart(side: usize) -> Array2<f32> {
    let mut chart = Array2::<f32>::zeros((side, side));
    let (top, bottom) = (side / 8, side / 2);
    let mut col = side / 8;
    for width in 1..=4 {
        for _ in 0..2 {
            for c in col..(col + width).min(side) {
                for r in top..bottom {
                    chart[[r, c]] = 1.0;
                }
            }
            col += 2 * width;
        }
    }
    let row = (3 * side) / 4;
    for k in 1..4 {
        let c = k * side / 4;
        if row < side && c < side {
            chart[[row, c]] = 1.0;
        }
    }
    chart
}

fn load_target(path: &Path, side: usize) -> anyhow::Result<Array2<f32>> {
    let img = image::open(path)
        .with_context(|| format!("failed to open target image {}", path.display()))?
        .to_luma8();
    let img = image::imageops::resize(&img, side as u32, side as u32, FilterType::Triangle);
    Ok(Array2::from_shape_fn((side, side), |(r, c)| {
        img.get_pixel(c as u32, r as u32)[0] as f32 / 255.0
    }))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = CoDesignConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;
    if let Some(dir) = cli.save_dir {
        cfg.run.save_dir = dir;
    }

    let side = cfg.optics.output_shape;
    let target = match &cli.target {
        Some(path) => load_target(path, side)?,
        None => {
            tracing::info!(side, "no target image given, using a synthetic chart");
            synthetic_chart(side)
        }
    };

    let device = Default::default();
    let target = tensor_from_vec::<CoDesignBackend, 4>(
        target.iter().copied().collect(),
        [1, 1, side, side],
        &device,
    );

    let mut codesign = CoDesign::<CoDesignBackend>::new(&cfg, &device)?;
    if let Some(dir) = cli.diagnostics_dir {
        codesign = codesign.with_diagnostics(Box::new(ImageDiagnostics::new(dir)?));
    }
    let outcome = codesign.run(target)?;

    tracing::info!(
        final_loss = ?outcome.final_loss(),
        mask = %outcome.mask_path.display(),
        psf = %outcome.psf_path.display(),
        "done"
    );
    Ok(())
}
