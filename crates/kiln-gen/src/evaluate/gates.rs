//! Pixel-level hard-gate measurements
//!
//! Pure functions over decoded RGBA buffers. Each returns a measurement;
//! thresholding and reason strings live in the evaluator so every check
//! can run regardless of earlier failures.

use crate::target::ImageSize;
use image::RgbaImage;
use std::collections::HashSet;

/// Luma above which a fringing boundary pixel counts toward halo risk
pub const HALO_LUMA_MIN: f64 = 200.0;

/// Proportional deviation of actual dimensions from the expected size:
/// mean of per-axis relative errors, 0.0 for an exact match.
pub fn size_deviation(width: u32, height: u32, expected: ImageSize) -> f64 {
    let dw = (width as f64 - expected.width as f64).abs() / expected.width as f64;
    let dh = (height as f64 - expected.height as f64).abs() / expected.height as f64;
    (dw + dh) / 2.0
}

/// Whether any pixel is fully transparent
pub fn has_transparent_pixels(img: &RgbaImage) -> bool {
    img.pixels().any(|p| p.0[3] == 0)
}

/// Tileability seam score: mean absolute per-channel difference between
/// opposing edge strips of the given width. Compares left vs right and
/// top vs bottom, returning the worse of the two.
pub fn seam_score(img: &RgbaImage, strip_px: u32) -> f64 {
    let (w, h) = img.dimensions();
    let strip = strip_px.max(1).min(w / 2).min(h / 2).max(1);

    let mut horizontal = 0.0;
    let mut h_samples = 0u64;
    for y in 0..h {
        for s in 0..strip {
            let left = img.get_pixel(s, y);
            let right = img.get_pixel(w - 1 - s, y);
            for c in 0..3 {
                horizontal += (left.0[c] as f64 - right.0[c] as f64).abs();
                h_samples += 1;
            }
        }
    }

    let mut vertical = 0.0;
    let mut v_samples = 0u64;
    for x in 0..w {
        for s in 0..strip {
            let top = img.get_pixel(x, s);
            let bottom = img.get_pixel(x, h - 1 - s);
            for c in 0..3 {
                vertical += (top.0[c] as f64 - bottom.0[c] as f64).abs();
                v_samples += 1;
            }
        }
    }

    let horizontal = if h_samples > 0 {
        horizontal / h_samples as f64
    } else {
        0.0
    };
    let vertical = if v_samples > 0 {
        vertical / v_samples as f64
    } else {
        0.0
    };
    horizontal.max(vertical)
}

/// Alpha boundary quality statistics.
///
/// A boundary pixel is an opaque pixel (alpha > 0) that is 4-adjacent to a
/// fully transparent pixel or to the image edge.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoundaryStats {
    /// Fraction of boundary pixels with high luma and partial alpha (fringing)
    pub halo_risk: f64,
    /// Fraction of opaque pixels whose 8 neighbors are all transparent or out of bounds
    pub stray_noise_ratio: f64,
    /// Mean normalized alpha over boundary pixels
    pub edge_sharpness: f64,
    pub boundary_pixels: u64,
    pub opaque_pixels: u64,
}

/// Compute boundary stats. Returns `None` when the image has no transparent
/// pixels at all (boundary analysis is meaningless for fully opaque art).
pub fn boundary_stats(img: &RgbaImage) -> Option<BoundaryStats> {
    if !has_transparent_pixels(img) {
        return None;
    }

    let (w, h) = img.dimensions();
    let transparent_at = |x: i64, y: i64| -> bool {
        if x < 0 || y < 0 || x >= w as i64 || y >= h as i64 {
            // Out of bounds counts as transparent for boundary purposes.
            return true;
        }
        img.get_pixel(x as u32, y as u32).0[3] == 0
    };

    let mut boundary = 0u64;
    let mut halo = 0u64;
    let mut stray = 0u64;
    let mut opaque = 0u64;
    let mut alpha_sum = 0.0;

    for y in 0..h {
        for x in 0..w {
            let pixel = img.get_pixel(x, y).0;
            let a = pixel[3];
            if a == 0 {
                continue;
            }
            opaque += 1;

            let xi = x as i64;
            let yi = y as i64;
            let on_boundary = transparent_at(xi - 1, yi)
                || transparent_at(xi + 1, yi)
                || transparent_at(xi, yi - 1)
                || transparent_at(xi, yi + 1);

            if on_boundary {
                boundary += 1;
                alpha_sum += a as f64 / 255.0;

                let luma = 0.299 * pixel[0] as f64
                    + 0.587 * pixel[1] as f64
                    + 0.114 * pixel[2] as f64;
                if luma >= HALO_LUMA_MIN && a < 255 {
                    halo += 1;
                }
            }

            let mut isolated = true;
            'neighbors: for dy in -1..=1i64 {
                for dx in -1..=1i64 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    if !transparent_at(xi + dx, yi + dy) {
                        isolated = false;
                        break 'neighbors;
                    }
                }
            }
            if isolated {
                stray += 1;
            }
        }
    }

    Some(BoundaryStats {
        halo_risk: if boundary > 0 {
            halo as f64 / boundary as f64
        } else {
            0.0
        },
        stray_noise_ratio: if opaque > 0 {
            stray as f64 / opaque as f64
        } else {
            0.0
        },
        edge_sharpness: if boundary > 0 {
            alpha_sum / boundary as f64
        } else {
            1.0
        },
        boundary_pixels: boundary,
        opaque_pixels: opaque,
    })
}

/// Parse a "#rrggbb" hex color
pub fn parse_hex_color(s: &str) -> Option<[u8; 3]> {
    let hex = s.strip_prefix('#')?;
    if hex.len() != 6 {
        return None;
    }
    let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
    let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
    let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
    Some([r, g, b])
}

/// Fraction of visible (alpha > 0) pixels whose color exactly matches the
/// allowed set. 1.0 for an image with no visible pixels.
pub fn palette_match_fraction(img: &RgbaImage, allowed: &HashSet<[u8; 3]>) -> f64 {
    let mut visible = 0u64;
    let mut matched = 0u64;
    for p in img.pixels() {
        if p.0[3] == 0 {
            continue;
        }
        visible += 1;
        if allowed.contains(&[p.0[0], p.0[1], p.0[2]]) {
            matched += 1;
        }
    }
    if visible == 0 {
        1.0
    } else {
        matched as f64 / visible as f64
    }
}

/// Number of distinct colors among visible pixels
pub fn distinct_visible_colors(img: &RgbaImage) -> usize {
    let mut colors: HashSet<[u8; 3]> = HashSet::new();
    for p in img.pixels() {
        if p.0[3] > 0 {
            colors.insert([p.0[0], p.0[1], p.0[2]]);
        }
    }
    colors.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn solid(w: u32, h: u32, color: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba(color))
    }

    #[test]
    fn test_size_deviation() {
        let expected = ImageSize::new(100, 100);
        assert_eq!(size_deviation(100, 100, expected), 0.0);
        assert!((size_deviation(110, 100, expected) - 0.05).abs() < 1e-9);
        assert!((size_deviation(50, 50, expected) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_seam_score_solid_is_zero() {
        let img = solid(32, 32, [100, 150, 200, 255]);
        assert_eq!(seam_score(&img, 4), 0.0);
    }

    #[test]
    fn test_seam_score_detects_mismatched_edges() {
        // Left half black, right half white: edges differ maximally.
        let mut img = solid(32, 32, [0, 0, 0, 255]);
        for y in 0..32 {
            for x in 16..32 {
                img.put_pixel(x, y, Rgba([255, 255, 255, 255]));
            }
        }
        let score = seam_score(&img, 2);
        assert!(score > 200.0, "seam score was {}", score);
    }

    #[test]
    fn test_boundary_stats_none_without_transparency() {
        let img = solid(8, 8, [10, 10, 10, 255]);
        assert!(boundary_stats(&img).is_none());
    }

    #[test]
    fn test_boundary_stats_sharp_square() {
        // 4x4 opaque square centered in a transparent 8x8 image.
        let mut img = solid(8, 8, [0, 0, 0, 0]);
        for y in 2..6 {
            for x in 2..6 {
                img.put_pixel(x, y, Rgba([50, 50, 50, 255]));
            }
        }
        let stats = boundary_stats(&img).unwrap();
        assert_eq!(stats.opaque_pixels, 16);
        // Ring of the square is its boundary: 16 - 4 interior = 12.
        assert_eq!(stats.boundary_pixels, 12);
        assert_eq!(stats.edge_sharpness, 1.0);
        assert_eq!(stats.halo_risk, 0.0);
        assert_eq!(stats.stray_noise_ratio, 0.0);
    }

    #[test]
    fn test_boundary_stats_detects_stray_noise() {
        let mut img = solid(8, 8, [0, 0, 0, 0]);
        // One isolated opaque pixel.
        img.put_pixel(1, 1, Rgba([255, 0, 0, 255]));
        // A 2x2 blob that is not isolated.
        for y in 5..7 {
            for x in 5..7 {
                img.put_pixel(x, y, Rgba([0, 255, 0, 255]));
            }
        }
        let stats = boundary_stats(&img).unwrap();
        assert_eq!(stats.opaque_pixels, 5);
        assert!((stats.stray_noise_ratio - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_boundary_stats_halo_risk() {
        let mut img = solid(8, 8, [0, 0, 0, 0]);
        // Bright, semi-transparent boundary pixel: the classic white fringe.
        img.put_pixel(3, 3, Rgba([250, 250, 250, 120]));
        let stats = boundary_stats(&img).unwrap();
        assert_eq!(stats.boundary_pixels, 1);
        assert_eq!(stats.halo_risk, 1.0);
        assert!(stats.edge_sharpness < 0.5);
    }

    #[test]
    fn test_parse_hex_color() {
        assert_eq!(parse_hex_color("#ff0080"), Some([255, 0, 128]));
        assert_eq!(parse_hex_color("ff0080"), None);
        assert_eq!(parse_hex_color("#ff00"), None);
        assert_eq!(parse_hex_color("#zzzzzz"), None);
    }

    #[test]
    fn test_palette_match_fraction() {
        let mut img = solid(4, 1, [255, 0, 0, 255]);
        img.put_pixel(3, 0, Rgba([0, 0, 255, 255]));
        let allowed: HashSet<[u8; 3]> = [[255, 0, 0]].into_iter().collect();
        assert!((palette_match_fraction(&img, &allowed) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_palette_ignores_invisible_pixels() {
        let mut img = solid(2, 1, [255, 0, 0, 255]);
        // Off-palette but fully transparent: must not count.
        img.put_pixel(1, 0, Rgba([1, 2, 3, 0]));
        let allowed: HashSet<[u8; 3]> = [[255, 0, 0]].into_iter().collect();
        assert_eq!(palette_match_fraction(&img, &allowed), 1.0);
    }

    #[test]
    fn test_distinct_visible_colors() {
        let mut img = solid(4, 1, [10, 20, 30, 255]);
        img.put_pixel(1, 0, Rgba([40, 50, 60, 255]));
        img.put_pixel(2, 0, Rgba([40, 50, 60, 255]));
        img.put_pixel(3, 0, Rgba([70, 80, 90, 0])); // invisible
        assert_eq!(distinct_visible_colors(&img), 2);
    }
}
