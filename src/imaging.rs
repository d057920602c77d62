//! Writing image grids and scatter plots to disk.

use std::path::Path;

use image::{Rgb, RgbImage};

use crate::error::AnalysisError;

const PADDING: u32 = 2;

/// Categorical colors for scatter plots, cycled by label.
const PALETTE: [[u8; 3]; 10] = [
    [31, 119, 180],
    [255, 127, 14],
    [44, 160, 44],
    [214, 39, 40],
    [148, 103, 189],
    [140, 86, 75],
    [227, 119, 194],
    [127, 127, 127],
    [188, 189, 34],
    [23, 190, 207],
];

fn write(img: &RgbImage, path: &Path) -> Result<(), AnalysisError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    img.save(path).map_err(|e| AnalysisError::ImageWrite {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Tile `[N, C, H, W]` images into rows of `nrow`, rescaling the whole grid
/// to the full 8-bit range. Single-channel images are drawn in gray.
pub fn tile_grid(images: &[f32], shape: [usize; 3], nrow: usize) -> RgbImage {
    let [c, h, w] = shape;
    let item = c * h * w;
    let n = images.len() / item.max(1);
    let nrow = nrow.clamp(1, n.max(1));
    let rows = n.div_ceil(nrow);
    let (h32, w32) = (h as u32, w as u32);
    let width = nrow as u32 * (w32 + PADDING) + PADDING;
    let height = rows as u32 * (h32 + PADDING) + PADDING;

    let lo = images.iter().copied().fold(f32::INFINITY, f32::min);
    let hi = images.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = if hi > lo { hi - lo } else { 1.0 };
    let to_u8 = |v: f32| (((v - lo) / range) * 255.0).round().clamp(0.0, 255.0) as u8;

    let mut img = RgbImage::new(width, height);
    for idx in 0..n {
        let pixels = &images[idx * item..(idx + 1) * item];
        let x0 = (idx % nrow) as u32 * (w32 + PADDING) + PADDING;
        let y0 = (idx / nrow) as u32 * (h32 + PADDING) + PADDING;
        for y in 0..h {
            for x in 0..w {
                let at = |ch: usize| to_u8(pixels[ch.min(c - 1) * h * w + y * w + x]);
                img.put_pixel(x0 + x as u32, y0 + y as u32, Rgb([at(0), at(1), at(2)]));
            }
        }
    }
    img
}

/// Write `images` as a grid with `nrow` images per row.
pub fn save_grid(
    path: &Path,
    images: &[f32],
    shape: [usize; 3],
    nrow: usize,
) -> Result<(), AnalysisError> {
    write(&tile_grid(images, shape, nrow), path)
}

/// Render 2-D points colored by label on a white square canvas.
pub fn render_scatter(points: &[[f32; 2]], labels: &[usize], size: u32) -> RgbImage {
    let mut img = RgbImage::from_pixel(size, size, Rgb([255, 255, 255]));
    if points.is_empty() {
        return img;
    }
    let bounds = |axis: usize| {
        points.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), p| {
            (lo.min(p[axis]), hi.max(p[axis]))
        })
    };
    let (x_lo, x_hi) = bounds(0);
    let (y_lo, y_hi) = bounds(1);
    let margin = 8.0;
    let span = size as f32 - 2.0 * margin;
    let scale = |v: f32, lo: f32, hi: f32| {
        let t = if hi > lo { (v - lo) / (hi - lo) } else { 0.5 };
        (margin + t * span) as i64
    };

    for (p, &label) in points.iter().zip(labels.iter()) {
        let cx = scale(p[0], x_lo, x_hi);
        // image rows grow downwards
        let cy = size as i64 - 1 - scale(p[1], y_lo, y_hi);
        let color = Rgb(PALETTE[label % PALETTE.len()]);
        for dy in -1..=1 {
            for dx in -1..=1 {
                let (x, y) = (cx + dx, cy + dy);
                if x >= 0 && y >= 0 && (x as u32) < size && (y as u32) < size {
                    img.put_pixel(x as u32, y as u32, color);
                }
            }
        }
    }
    img
}

pub fn save_scatter(
    path: &Path,
    points: &[[f32; 2]],
    labels: &[usize],
    size: u32,
) -> Result<(), AnalysisError> {
    write(&render_scatter(points, labels, size), path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_dimensions() {
        let images = vec![0.0f32; 5 * 3 * 4 * 6];
        let img = tile_grid(&images, [3, 4, 6], 2);
        // 2 columns and 3 rows with 2px padding around every tile
        assert_eq!(img.width(), 2 * (6 + 2) + 2);
        assert_eq!(img.height(), 3 * (4 + 2) + 2);
    }

    #[test]
    fn test_grid_rescales_to_full_range() {
        let images = vec![-1.0, 1.0];
        let img = tile_grid(&images, [1, 1, 2], 1);
        assert_eq!(img.get_pixel(2, 2), &Rgb([0, 0, 0]));
        assert_eq!(img.get_pixel(3, 2), &Rgb([255, 255, 255]));
    }

    #[test]
    fn test_scatter_colors_by_label() {
        let img = render_scatter(&[[0.0, 0.0], [1.0, 1.0]], &[0, 1], 64);
        assert_eq!(img.get_pixel(8, 55), &Rgb(PALETTE[0]));
        assert_eq!(img.get_pixel(56, 7), &Rgb(PALETTE[1]));
    }

    #[test]
    fn test_save_grid_writes_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("grid.png");
        save_grid(&path, &[0.0, 0.5, 1.0, 0.25], [1, 2, 2], 1).unwrap();
        let loaded = image::open(&path).unwrap();
        assert_eq!(loaded.width(), 6);
    }
}
