//! Final artifacts of a co-design run.
//!
//! Two 8-bit grayscale BMPs land in the save directory:
//!
//! - `mask.bmp`: the fabrication profile, each pixel `level + 10`;
//! - `psf.bmp`: the final PSF snapshot (min-max normalized, center-cropped) scaled by 255.

use std::path::{Path, PathBuf};

use image::{GrayImage, ImageFormat, Luma};
use ndarray::Array2;

use crate::Result;

pub const MASK_FILE: &str = "mask.bmp";
pub const PSF_FILE: &str = "psf.bmp";

/// Added to every height level in `mask.bmp`.
pub const MASK_LEVEL_OFFSET: u32 = 10;

/// `level + MASK_LEVEL_OFFSET`, saturating at 255.
pub fn mask_image(profile: &Array2<u32>) -> GrayImage {
    let (h, w) = profile.dim();
    GrayImage::from_fn(w as u32, h as u32, |x, y| {
        let level = profile[[y as usize, x as usize]].saturating_add(MASK_LEVEL_OFFSET);
        Luma([level.min(255) as u8])
    })
}

/// `value · 255`, truncated and clipped to `[0, 255]`.
pub fn unit_image(values: &Array2<f32>) -> GrayImage {
    let (h, w) = values.dim();
    GrayImage::from_fn(w as u32, h as u32, |x, y| {
        let v = values[[y as usize, x as usize]] * 255.0;
        // Float-to-int `as` saturates and maps NaN to 0.
        Luma([v as u8])
    })
}

/// Write `mask.bmp` and `psf.bmp` into `dir` (created if missing).
pub fn save_artifacts(
    dir: &Path,
    profile: &Array2<u32>,
    psf_snapshot: &Array2<f32>,
) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)?;
    let mask_path = dir.join(MASK_FILE);
    let psf_path = dir.join(PSF_FILE);
    mask_image(profile).save_with_format(&mask_path, ImageFormat::Bmp)?;
    unit_image(psf_snapshot).save_with_format(&psf_path, ImageFormat::Bmp)?;
    tracing::info!(
        mask = %mask_path.display(),
        psf = %psf_path.display(),
        "saved optimized mask and psf"
    );
    Ok((mask_path, psf_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn mask_levels_are_offset() {
        let img = mask_image(&array![[0u32, 1, 15], [3, 250, 7]]);
        assert_eq!(img.dimensions(), (3, 2));
        assert_eq!(img.get_pixel(0, 0)[0], 10);
        assert_eq!(img.get_pixel(2, 0)[0], 25);
        assert_eq!(img.get_pixel(0, 1)[0], 13);
        assert_eq!(img.get_pixel(1, 1)[0], 255);
    }

    #[test]
    fn psf_is_scaled_and_clipped() {
        let img = unit_image(&array![[0.0f32, 0.5, 1.0, 1.5], [-0.2, f32::NAN, 0.999, 0.1]]);
        let row0: Vec<u8> = (0..4).map(|x| img.get_pixel(x, 0)[0]).collect();
        let row1: Vec<u8> = (0..4).map(|x| img.get_pixel(x, 1)[0]).collect();
        assert_eq!(row0, vec![0, 127, 255, 255]);
        assert_eq!(row1, vec![0, 0, 254, 25]);
    }

    #[test]
    fn artifacts_round_trip_through_bmp() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("litholens-export-{}", std::process::id()));
        let profile = Array2::from_shape_fn((8, 8), |(r, c)| ((r + c) % 4) as u32);
        let psf = Array2::from_shape_fn((4, 4), |(r, c)| (r * 4 + c) as f32 / 15.0);
        let (mask_path, psf_path) = save_artifacts(&dir, &profile, &psf)?;

        let mask = image::open(&mask_path)?.to_luma8();
        for ((r, c), &level) in profile.indexed_iter() {
            assert_eq!(mask.get_pixel(c as u32, r as u32)[0] as u32, level + 10);
        }
        let psf_img = image::open(&psf_path)?.to_luma8();
        assert_eq!(psf_img.dimensions(), (4, 4));
        assert_eq!(psf_img.get_pixel(3, 3)[0], 255);
        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }
}
