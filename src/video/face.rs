//! Face-region search
//!
//! A small rectangle-feature detector over the grayscale frame. Each square
//! window is split into three horizontal bands (forehead, eyes, cheeks); a
//! face-like window has an eye band clearly darker than both neighbours.
//! Windows are scanned at several scales using integral images, and the best
//! window is kept only if enough overlapping windows agree with it.

use image::imageops::{self, FilterType};
use image::GrayImage;

use super::processing::FrameAnnotator;
use super::{Region, VisionInfo};

/// Frames wider than this are downscaled before scanning
const MAX_SCAN_WIDTH: u32 = 320;

/// Summed-area tables for O(1) window statistics
struct Integral {
    stride: usize,
    sum: Vec<u64>,
    sq: Vec<u64>,
}

impl Integral {
    fn new(gray: &GrayImage) -> Self {
        let (w, h) = (gray.width() as usize, gray.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sq = vec![0u64; stride * (h + 1)];
        for y in 0..h {
            let mut row_sum = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let v = u64::from(gray.get_pixel(x as u32, y as u32).0[0]);
                row_sum += v;
                row_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row_sum;
                sq[(y + 1) * stride + x + 1] = sq[y * stride + x + 1] + row_sq;
            }
        }
        Self { stride, sum, sq }
    }

    fn area(table: &[u64], stride: usize, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        table[y1 * stride + x1] + table[y0 * stride + x0] - table[y0 * stride + x1] - table[y1 * stride + x0]
    }

    fn mean(&self, x: u32, y: u32, w: u32, h: u32) -> f32 {
        Self::area(&self.sum, self.stride, x, y, w, h) as f32 / (w * h) as f32
    }

    fn std_dev(&self, x: u32, y: u32, w: u32, h: u32) -> f32 {
        let n = (w * h) as f64;
        let mean = Self::area(&self.sum, self.stride, x, y, w, h) as f64 / n;
        let mean_sq = Self::area(&self.sq, self.stride, x, y, w, h) as f64 / n;
        (mean_sq - mean * mean).max(0.0).sqrt() as f32
    }
}

/// Reference face-region pass
#[derive(Debug, Clone)]
pub struct FaceRegionDetector {
    /// Smallest window side in pixels
    pub min_size: u32,
    /// Growth factor between scan scales
    pub scale_factor: f32,
    /// Overlapping hits required to accept a region
    pub min_neighbors: usize,
    /// Gray levels the eye band must sit below forehead and cheeks
    pub min_contrast: f32,
    /// Flat windows below this standard deviation are skipped
    pub min_std_dev: f32,
}

impl Default for FaceRegionDetector {
    fn default() -> Self {
        Self {
            min_size: 30,
            scale_factor: 1.1,
            min_neighbors: 3,
            min_contrast: 25.0,
            min_std_dev: 12.0,
        }
    }
}

impl FaceRegionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strongest face-like region in the frame, in frame coordinates
    pub fn detect(&self, gray: &GrayImage) -> Option<Region> {
        if gray.width() > MAX_SCAN_WIDTH {
            let scale = MAX_SCAN_WIDTH as f32 / gray.width() as f32;
            let height = ((gray.height() as f32 * scale) as u32).max(1);
            let small = imageops::resize(gray, MAX_SCAN_WIDTH, height, FilterType::Triangle);
            let region = self.detect_unscaled(&small)?;
            let up = |v: u32| (v as f32 / scale).round() as u32;
            return Some(Region::new(up(region.x), up(region.y), up(region.width), up(region.height)));
        }
        self.detect_unscaled(gray)
    }

    fn detect_unscaled(&self, gray: &GrayImage) -> Option<Region> {
        let (w, h) = gray.dimensions();
        let min_size = self.min_size.max(8);
        if w < min_size || h < min_size {
            return None;
        }

        let integral = Integral::new(gray);
        let mut candidates = Vec::new();
        let mut size = min_size as f32;
        while (size as u32) <= w.min(h) {
            let s = size as u32;
            let step = (s / 10).max(2) as usize;
            for y in (0..=h - s).step_by(step) {
                for x in (0..=w - s).step_by(step) {
                    if let Some(score) = self.score(&integral, x, y, s) {
                        candidates.push((Region::new(x, y, s, s), score));
                    }
                }
            }
            size *= self.scale_factor.max(1.01);
        }

        self.group(&candidates)
    }

    /// Band contrast of a window, if it looks like a face
    fn score(&self, integral: &Integral, x: u32, y: u32, s: u32) -> Option<f32> {
        if integral.std_dev(x, y, s, s) < self.min_std_dev {
            return None;
        }
        let band = |top: f32, bottom: f32| {
            let y0 = y + (s as f32 * top) as u32;
            let y1 = y + (s as f32 * bottom) as u32;
            integral.mean(x, y0, s, (y1 - y0).max(1))
        };
        let forehead = band(0.0, 0.2);
        let eyes = band(0.2, 0.45);
        let cheeks = band(0.5, 0.8);

        let contrast = (forehead - eyes).min(cheeks - eyes);
        (contrast >= self.min_contrast).then_some(contrast)
    }

    /// Average the windows that overlap the best one; reject weak support
    fn group(&self, candidates: &[(Region, f32)]) -> Option<Region> {
        let (best, _) = candidates
            .iter()
            .max_by(|a, b| a.1.total_cmp(&b.1))?;

        let members: Vec<&Region> = candidates
            .iter()
            .map(|(r, _)| r)
            .filter(|r| overlap_ratio(best, r) >= 0.5)
            .collect();
        if members.len() < self.min_neighbors.max(1) {
            return None;
        }

        let n = members.len() as u64;
        let avg = |f: fn(&Region) -> u32| (members.iter().map(|r| u64::from(f(r))).sum::<u64>() / n) as u32;
        Some(Region::new(avg(|r| r.x), avg(|r| r.y), avg(|r| r.width), avg(|r| r.height)))
    }
}

/// Intersection area over the smaller rectangle's area
fn overlap_ratio(a: &Region, b: &Region) -> f32 {
    let x0 = a.x.max(b.x);
    let y0 = a.y.max(b.y);
    let x1 = (a.x + a.width).min(b.x + b.width);
    let y1 = (a.y + a.height).min(b.y + b.height);
    if x1 <= x0 || y1 <= y0 {
        return 0.0;
    }
    let inter = ((x1 - x0) * (y1 - y0)) as f32;
    let smaller = (a.width * a.height).min(b.width * b.height) as f32;
    inter / smaller
}

impl FrameAnnotator for FaceRegionDetector {
    fn name(&self) -> &str {
        "face"
    }

    fn annotate(&mut self, frame: &GrayImage, info: &mut VisionInfo) {
        info.face_region = self.detect(frame);
        info.face_detected = info.face_region.is_some();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Luma;

    /// Gray background with a bright square "face" and a dark eye band
    pub(crate) fn synthetic_face(width: u32, height: u32, face: Region) -> GrayImage {
        let mut img = GrayImage::from_pixel(width, height, Luma([100]));
        let eye_top = face.y + face.height / 5;
        let eye_bottom = face.y + face.height * 9 / 20;
        for y in face.y..face.y + face.height {
            for x in face.x..face.x + face.width {
                let level = if (eye_top..eye_bottom).contains(&y) { 40 } else { 200 };
                img.put_pixel(x, y, Luma([level]));
            }
        }
        img
    }

    #[test]
    fn test_detects_synthetic_face() {
        let face = Region::new(50, 30, 60, 60);
        let img = synthetic_face(160, 120, face);
        let region = FaceRegionDetector::new().detect(&img).expect("face not found");
        let (cx, cy) = region.center();
        assert!(face.contains(cx, cy), "center ({}, {}) outside {:?}", cx, cy, face);
    }

    #[test]
    fn test_uniform_frame_has_no_face() {
        let img = GrayImage::from_pixel(160, 120, Luma([128]));
        assert!(FaceRegionDetector::new().detect(&img).is_none());
    }

    #[test]
    fn test_frame_smaller_than_min_size() {
        let img = GrayImage::from_pixel(20, 20, Luma([50]));
        assert!(FaceRegionDetector::new().detect(&img).is_none());
    }

    #[test]
    fn test_large_frame_is_scaled_back() {
        let face = Region::new(200, 120, 200, 200);
        let img = synthetic_face(640, 480, face);
        let region = FaceRegionDetector::new().detect(&img).expect("face not found");
        let (cx, cy) = region.center();
        assert!(face.contains(cx, cy), "center ({}, {}) outside {:?}", cx, cy, face);
    }

    #[test]
    fn test_annotate_clears_previous_region() {
        let mut detector = FaceRegionDetector::new();
        let mut info = VisionInfo {
            face_detected: true,
            face_region: Some(Region::new(0, 0, 10, 10)),
            ..VisionInfo::default()
        };
        detector.annotate(&GrayImage::from_pixel(64, 48, Luma([90])), &mut info);
        assert!(!info.face_detected);
        assert!(info.face_region.is_none());
    }

    #[test]
    fn test_overlap_ratio() {
        let a = Region::new(0, 0, 10, 10);
        assert_eq!(overlap_ratio(&a, &Region::new(0, 0, 5, 5)), 1.0);
        assert_eq!(overlap_ratio(&a, &Region::new(20, 20, 5, 5)), 0.0);
        assert_eq!(overlap_ratio(&a, &Region::new(5, 0, 10, 10)), 0.5);
    }
}
