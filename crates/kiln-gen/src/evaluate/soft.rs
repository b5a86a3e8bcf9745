//! Built-in soft-score metrics
//!
//! Readability (contrast proxy) and cross-candidate consistency (luma
//! histogram distance from the job centroid). Both map to [0, 1].

use image::RgbaImage;

pub const HISTOGRAM_BINS: usize = 256;

/// Readability: mean per-channel standard deviation, normalized to [0, 1].
///
/// Flat images score near 0; high-contrast art scores higher. 127.5 is the
/// maximum possible stdev for 8-bit channels.
pub fn readability(img: &RgbaImage) -> f64 {
    let n = (img.width() as u64 * img.height() as u64) as f64;
    if n == 0.0 {
        return 0.0;
    }

    let mut sums = [0.0f64; 3];
    let mut sq_sums = [0.0f64; 3];
    for p in img.pixels() {
        for c in 0..3 {
            let v = p.0[c] as f64;
            sums[c] += v;
            sq_sums[c] += v * v;
        }
    }

    let mut stdev_sum = 0.0;
    for c in 0..3 {
        let mean = sums[c] / n;
        let variance = (sq_sums[c] / n - mean * mean).max(0.0);
        stdev_sum += variance.sqrt();
    }
    (stdev_sum / 3.0 / 127.5).clamp(0.0, 1.0)
}

/// Normalized luma histogram (bins sum to 1 for a non-empty image)
pub fn luma_histogram(img: &RgbaImage) -> Vec<f64> {
    let mut hist = vec![0.0f64; HISTOGRAM_BINS];
    let mut count = 0u64;
    for p in img.pixels() {
        let luma =
            0.299 * p.0[0] as f64 + 0.587 * p.0[1] as f64 + 0.114 * p.0[2] as f64;
        hist[(luma as usize).min(HISTOGRAM_BINS - 1)] += 1.0;
        count += 1;
    }
    if count > 0 {
        for bin in hist.iter_mut() {
            *bin /= count as f64;
        }
    }
    hist
}

/// Mean of a set of normalized histograms
pub fn centroid_histogram(hists: &[Vec<f64>]) -> Vec<f64> {
    let mut centroid = vec![0.0f64; HISTOGRAM_BINS];
    if hists.is_empty() {
        return centroid;
    }
    for hist in hists {
        for (c, v) in centroid.iter_mut().zip(hist.iter()) {
            *c += v;
        }
    }
    for c in centroid.iter_mut() {
        *c /= hists.len() as f64;
    }
    centroid
}

/// Consistency score: 1 minus the normalized L1 distance between this
/// candidate's histogram and the centroid. L1 over two unit-sum histograms
/// is at most 2, so the result is in [0, 1].
pub fn consistency(hist: &[f64], centroid: &[f64]) -> f64 {
    let l1: f64 = hist
        .iter()
        .zip(centroid.iter())
        .map(|(a, b)| (a - b).abs())
        .sum();
    (1.0 - l1 / 2.0).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn solid(color: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(16, 16, Rgba(color))
    }

    fn checkerboard() -> RgbaImage {
        let mut img = RgbaImage::new(16, 16);
        for y in 0..16 {
            for x in 0..16 {
                let v = if (x + y) % 2 == 0 { 0 } else { 255 };
                img.put_pixel(x, y, Rgba([v, v, v, 255]));
            }
        }
        img
    }

    #[test]
    fn test_readability_flat_image_is_zero() {
        assert_eq!(readability(&solid([128, 128, 128, 255])), 0.0);
    }

    #[test]
    fn test_readability_checkerboard_is_high() {
        let score = readability(&checkerboard());
        assert!(score > 0.9, "readability was {}", score);
    }

    #[test]
    fn test_histogram_sums_to_one() {
        let hist = luma_histogram(&checkerboard());
        let sum: f64 = hist.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_consistency_identical_is_one() {
        let hist = luma_histogram(&solid([40, 90, 200, 255]));
        let centroid = centroid_histogram(&[hist.clone()]);
        assert!((consistency(&hist, &centroid) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_consistency_disjoint_is_zero() {
        let dark = luma_histogram(&solid([0, 0, 0, 255]));
        let light = luma_histogram(&solid([255, 255, 255, 255]));
        assert!(consistency(&dark, &light) < 1e-9);
    }

    #[test]
    fn test_outlier_scores_lower_than_members() {
        let a = luma_histogram(&solid([100, 100, 100, 255]));
        let b = luma_histogram(&solid([100, 100, 100, 255]));
        let outlier = luma_histogram(&solid([255, 255, 255, 255]));
        let centroid = centroid_histogram(&[a.clone(), b.clone(), outlier.clone()]);
        assert!(consistency(&a, &centroid) > consistency(&outlier, &centroid));
    }
}
