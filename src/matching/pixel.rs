//! Exact pixel matcher
//!
//! Exhaustive sum-of-squared-differences correlation with early exit: a
//! position is abandoned as soon as its accumulated difference can no longer
//! reach the requested similarity.

use image::{GrayImage, Luma, RgbImage};

use crate::config::GlobalConfig;
use crate::diagnostics::DiagnosticSink;
use crate::error::FinderResult;
use crate::params::registry::no_params;
use crate::params::{CategorySpec, ParamDecl, ParamRegistry, Parameter};
use crate::target::Target;

use super::matcher::{find_spec, Family, Matcher};
use super::ranking::{self, ScoreMap};
use super::types::{Candidate, FindOutcome, Haystack, Rect, StageArtifact};
use super::{check_needle_fits, needle_pixels};

fn pixel_params(_backend: &str) -> Vec<ParamDecl> {
    vec![
        ("early_exit", Parameter::new(true).enumerated()),
        (
            "check_interval",
            Parameter::new(1000).bounded(1.0, 1_000_000.0).delta(100.0),
        ),
    ]
}

pub(crate) fn pixel_spec() -> CategorySpec {
    CategorySpec {
        name: "pixel",
        backends: &["ssd", "ssd_gray"],
        base: no_params,
        backend_params: pixel_params,
        read_only: &[],
    }
}

/// Either colour or grey pixels, compared channel by channel.
enum Pixels {
    Rgb(RgbImage),
    Gray(GrayImage),
}

impl Pixels {
    fn channels(&self) -> usize {
        match self {
            Pixels::Rgb(_) => 3,
            Pixels::Gray(_) => 1,
        }
    }

    fn dimensions(&self) -> (u32, u32) {
        match self {
            Pixels::Rgb(img) => img.dimensions(),
            Pixels::Gray(img) => img.dimensions(),
        }
    }

    fn raw(&self) -> &[u8] {
        match self {
            Pixels::Rgb(img) => img.as_raw(),
            Pixels::Gray(img) => img.as_raw(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PixelMatcher {
    params: ParamRegistry,
}

impl PixelMatcher {
    pub fn new(config: &GlobalConfig) -> FinderResult<Self> {
        let params = ParamRegistry::new(vec![find_spec(Family::Pixel), pixel_spec()], config)?;
        Ok(Self { params })
    }

    /// Similarity of every placement of `needle` in `haystack`. With
    /// `min_similarity > 0` placements that cannot reach it score zero.
    fn score_map(&self, needle: &Pixels, haystack: &Pixels, min_similarity: f64) -> FinderResult<ScoreMap> {
        let check_interval = self.params.int("pixel", "check_interval")?.max(1) as usize;
        let channels = needle.channels();
        let (nw, nh) = needle.dimensions();
        let (hw, hh) = haystack.dimensions();
        let (map_w, map_h) = (hw - nw + 1, hh - nh + 1);

        let pixel_count = (nw * nh) as usize;
        let max_sq_diff = pixel_count as f64 * channels as f64 * (255.0 * 255.0);
        let max_allowed_diff = max_sq_diff * (1.0 - min_similarity);

        let needle_raw = needle.raw();
        let haystack_raw = haystack.raw();
        let row_len = nw as usize * channels;
        let haystack_stride = hw as usize * channels;

        let total_positions = map_w as usize * map_h as usize;
        let report_interval = (total_positions / 10).max(1);
        let mut position_count = 0;

        let mut scores = ScoreMap::new(map_w, map_h);
        for y in 0..map_h {
            for x in 0..map_w {
                let mut sum_sq_diff = 0.0;
                let mut checked_pixels = 0;
                let mut pruned = false;
                'rows: for dy in 0..nh as usize {
                    let n_start = dy * row_len;
                    let h_start = (y as usize + dy) * haystack_stride + x as usize * channels;
                    let needle_row = &needle_raw[n_start..n_start + row_len];
                    let haystack_row = &haystack_raw[h_start..h_start + row_len];
                    for (n_px, h_px) in needle_row.chunks_exact(channels).zip(haystack_row.chunks_exact(channels)) {
                        for c in 0..channels {
                            let diff = n_px[c] as i32 - h_px[c] as i32;
                            sum_sq_diff += (diff * diff) as f64;
                        }
                        checked_pixels += 1;
                        if min_similarity > 0.0 && checked_pixels % check_interval == 0 && sum_sq_diff > max_allowed_diff {
                            pruned = true;
                            break 'rows;
                        }
                    }
                }
                let similarity = if pruned { 0.0 } else { 1.0 - sum_sq_diff / max_sq_diff };
                scores.put_pixel(x, y, Luma([similarity.clamp(0.0, 1.0) as f32]));

                position_count += 1;
                if position_count % report_interval == 0 {
                    let progress_pct = (position_count as f32 / total_positions as f32 * 100.0) as u32;
                    log::trace!("  ⏳ Correlation scanning: {}%", progress_pct);
                }
            }
        }
        Ok(scores)
    }
}

impl Matcher for PixelMatcher {
    fn family(&self) -> Family {
        Family::Pixel
    }

    fn params(&self) -> &ParamRegistry {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamRegistry {
        &mut self.params
    }

    fn find(&self, needle: &Target, haystack: &Haystack, _sink: &mut dyn DiagnosticSink) -> FinderResult<FindOutcome> {
        let needle_rgb = needle_pixels(needle)?;
        check_needle_fits(needle, needle_rgb.width(), needle_rgb.height(), haystack)?;
        let similarity = self.similarity()?;
        let early_exit = self.params.flag("pixel", "early_exit")?;

        let (needle_px, haystack_px) = match self.params.backend("pixel")? {
            "ssd_gray" => (
                Pixels::Gray(image::imageops::grayscale(needle_rgb)),
                Pixels::Gray(haystack.gray()),
            ),
            _ => (Pixels::Rgb(needle_rgb.clone()), Pixels::Rgb(haystack.image().clone())),
        };

        let prune_at = if early_exit { similarity } else { 0.0 };
        let mut scores = self.score_map(&needle_px, &haystack_px, prune_at)?;
        let mut picks = ranking::pick_peaks(&mut scores.clone(), needle_rgb.width(), needle_rgb.height(), similarity);
        if prune_at > 0.0 && picks.first().is_none_or(|(_, _, s)| *s < similarity) {
            // pruned scores hide how close the best miss was
            scores = self.score_map(&needle_px, &haystack_px, 0.0)?;
            picks = ranking::pick_peaks(&mut scores.clone(), needle_rgb.width(), needle_rgb.height(), similarity);
        }

        let candidates = picks
            .into_iter()
            .map(|(x, y, s)| Candidate::new(Rect::new(x, y, needle_rgb.width(), needle_rgb.height()), s, "pixel"))
            .collect();
        let candidates = ranking::rank(candidates, similarity);
        let best = candidates.first().map(|c: &Candidate| c.similarity).unwrap_or(0.0);
        let artifact = StageArtifact::new("ssd", best).with_hotmap(ranking::hotmap(&scores));
        Ok(FindOutcome::new(candidates, similarity).with_stages(vec![artifact]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::NullSink;
    use image::{ImageBuffer, Rgb};

    fn scene() -> RgbImage {
        ImageBuffer::from_fn(40, 30, |x, y| {
            let v = ((x * 7919 + y * 104_729 + x * y * 31) % 251) as u8;
            Rgb([v, v.wrapping_mul(3), v.wrapping_mul(7)])
        })
    }

    #[test]
    fn test_finds_exact_crop() {
        let haystack = Haystack::new(scene(), "scene").unwrap();
        let patch = image::imageops::crop_imm(haystack.image(), 12, 9, 8, 6).to_image();
        let needle = Target::image("patch", patch).unwrap();

        let matcher = PixelMatcher::new(&GlobalConfig::default()).unwrap();
        let outcome = matcher.find(&needle, &haystack, &mut NullSink).unwrap();
        let best = outcome.best().unwrap();
        assert_eq!(best.rect, Rect::new(12, 9, 8, 6));
        assert!(best.similarity > 0.999);
        assert_eq!(outcome.stages.len(), 1);
    }

    #[test]
    fn test_closest_miss_is_unpruned() {
        let haystack = Haystack::new(RgbImage::from_pixel(20, 20, Rgb([200, 200, 200])), "flat").unwrap();
        let needle = Target::image("dark", RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]))).unwrap();

        let mut matcher = PixelMatcher::new(&GlobalConfig::default()).unwrap();
        matcher.params_mut().set("pixel", "check_interval", 1).unwrap();
        let outcome = matcher.find(&needle, &haystack, &mut NullSink).unwrap();
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.candidates[0].rect, Rect::new(0, 0, 4, 4));
        let expected = 1.0 - (200.0 * 200.0) / (255.0 * 255.0);
        assert!((outcome.candidates[0].similarity - expected).abs() < 1e-6);
        assert!(!outcome.is_match());
    }

    #[test]
    fn test_gray_backend() {
        let haystack = Haystack::new(scene(), "scene").unwrap();
        let patch = image::imageops::crop_imm(haystack.image(), 3, 4, 5, 5).to_image();
        let needle = Target::image("patch", patch).unwrap();

        let mut matcher = PixelMatcher::new(&GlobalConfig::default()).unwrap();
        matcher.configure_backend("ssd_gray", None, false).unwrap();
        let outcome = matcher.find(&needle, &haystack, &mut NullSink).unwrap();
        assert_eq!(outcome.best().unwrap().rect.x, 3);
        assert_eq!(outcome.best().unwrap().rect.y, 4);
    }

    #[test]
    fn test_oversized_needle() {
        let haystack = Haystack::new(RgbImage::new(4, 4), "tiny").unwrap();
        let needle = Target::image("big", RgbImage::new(8, 8)).unwrap();
        let matcher = PixelMatcher::new(&GlobalConfig::default()).unwrap();
        assert!(matcher.find(&needle, &haystack, &mut NullSink).is_err());
    }
}
