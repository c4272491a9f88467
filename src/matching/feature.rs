//! Keypoint matcher
//!
//! FAST corners described by binary intensity comparisons in a smoothed
//! patch, matched by Hamming distance and projected onto the haystack by
//! translation voting. Similarity is the share of needle keypoints that
//! agree with the winning translation.

use std::sync::OnceLock;

use image::{GrayImage, Rgb, RgbImage};
use imageproc::corners::{corners_fast12, corners_fast9, Corner};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::filter::gaussian_blur_f32;

use crate::config::GlobalConfig;
use crate::diagnostics::DiagnosticSink;
use crate::error::FinderResult;
use crate::params::registry::no_params;
use crate::params::{CategorySpec, ParamDecl, ParamRegistry, Parameter};
use crate::target::Target;

use super::matcher::{find_spec, Family, Matcher};
use super::ranking;
use super::types::{Candidate, FindOutcome, Haystack, Rect, StageArtifact};
use super::{check_needle_fits, needle_pixels};

const PATCH_RADIUS: i32 = 8;
/// Keypoints closer than this to the image edge are dropped
const BORDER: u32 = 12;
const DESCRIPTOR_BYTES: usize = 32;
const BLUR_SIGMA: f32 = 1.2;

type Descriptor = [u8; DESCRIPTOR_BYTES];

fn feature_params(_backend: &str) -> Vec<ParamDecl> {
    vec![
        (
            "projectionTolerance",
            Parameter::new(3.0).bounded(0.0, 50.0).delta(1.0).tolerance(0.1),
        ),
        ("minDetectedFeatures", Parameter::new(4).bounded(1.0, 1000.0)),
        ("minMatchedFeatures", Parameter::new(4).bounded(1.0, 1000.0)),
    ]
}

fn fdetect_base() -> Vec<ParamDecl> {
    vec![("maxFeatures", Parameter::new(500).bounded(1.0, 10_000.0).delta(50.0))]
}

fn fdetect_params(backend: &str) -> Vec<ParamDecl> {
    let arc = if backend == "fast12" { 12 } else { 9 };
    vec![
        ("threshold", Parameter::new(20).bounded(1.0, 255.0).delta(5.0)),
        ("arc", Parameter::new(arc).bounded(9.0, 12.0).enumerated()),
        ("border", Parameter::new(BORDER).at_least(0.0)),
    ]
}

fn fmatch_params(_backend: &str) -> Vec<ParamDecl> {
    vec![
        (
            "ratioThreshold",
            Parameter::new(0.65).bounded(0.0, 1.0).delta(0.1).tolerance(0.01),
        ),
        ("ratioTest", Parameter::new(false).enumerated()),
        ("symmetryTest", Parameter::new(false).enumerated()),
        ("maxDistance", Parameter::new(64).bounded(0.0, 256.0).delta(8.0)),
    ]
}

pub(crate) fn feature_specs() -> Vec<CategorySpec> {
    vec![
        CategorySpec {
            name: "feature",
            backends: &["mixed"],
            base: no_params,
            backend_params: feature_params,
            read_only: &[],
        },
        CategorySpec {
            name: "fdetect",
            backends: &["fast9", "fast12"],
            base: fdetect_base,
            backend_params: fdetect_params,
            read_only: &["arc", "border"],
        },
        CategorySpec {
            name: "fmatch",
            backends: &["bruteforce-hamming"],
            base: no_params,
            backend_params: fmatch_params,
            read_only: &[],
        },
    ]
}

/// Write the live detector's constants back into `fdetect`.
pub(crate) fn synchronize_detector(params: &mut ParamRegistry) -> FinderResult<()> {
    let arc = match params.backend("fdetect")? {
        "fast12" => 12,
        _ => 9,
    };
    params.set("fdetect", "arc", arc)?;
    params.set("fdetect", "border", BORDER)?;
    Ok(())
}

/// Sampling pairs of the binary descriptor, identical for every run.
fn pattern() -> &'static [(i32, i32, i32, i32)] {
    static PATTERN: OnceLock<Vec<(i32, i32, i32, i32)>> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let mut state: u32 = 0x9E37_79B9;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state % (2 * PATCH_RADIUS as u32 + 1)) as i32 - PATCH_RADIUS
        };
        (0..DESCRIPTOR_BYTES * 8)
            .map(|_| (next(), next(), next(), next()))
            .collect()
    })
}

fn detect(gray: &GrayImage, params: &ParamRegistry) -> FinderResult<Vec<Corner>> {
    let threshold = params.int("fdetect", "threshold")?.clamp(1, 255) as u8;
    let max_features = params.int("fdetect", "maxFeatures")?.max(1) as usize;
    let corners = match params.backend("fdetect")? {
        "fast12" => corners_fast12(gray, threshold),
        _ => corners_fast9(gray, threshold),
    };
    let (w, h) = gray.dimensions();
    let mut kept: Vec<Corner> = corners
        .into_iter()
        .filter(|c| c.x >= BORDER && c.y >= BORDER && c.x + BORDER < w && c.y + BORDER < h)
        .collect();
    kept.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.y.cmp(&b.y))
            .then_with(|| a.x.cmp(&b.x))
    });
    kept.truncate(max_features);
    Ok(kept)
}

fn describe(smoothed: &GrayImage, keypoints: &[Corner]) -> Vec<Descriptor> {
    let pairs = pattern();
    keypoints
        .iter()
        .map(|kp| {
            let mut descriptor = [0u8; DESCRIPTOR_BYTES];
            let (x, y) = (kp.x as i32, kp.y as i32);
            for (bit, &(ax, ay, bx, by)) in pairs.iter().enumerate() {
                let a = smoothed.get_pixel((x + ax) as u32, (y + ay) as u32)[0];
                let b = smoothed.get_pixel((x + bx) as u32, (y + by) as u32)[0];
                if a < b {
                    descriptor[bit / 8] |= 1 << (bit % 8);
                }
            }
            descriptor
        })
        .collect()
}

fn hamming(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Nearest and second nearest neighbour of `query` among `pool`.
fn nearest(query: &Descriptor, pool: &[Descriptor]) -> Option<(usize, u32, Option<u32>)> {
    let mut best: Option<(usize, u32)> = None;
    let mut second: Option<u32> = None;
    for (j, candidate) in pool.iter().enumerate() {
        let distance = hamming(query, candidate);
        match best {
            Some((_, d)) if distance >= d => {
                if second.is_none_or(|s| distance < s) {
                    second = Some(distance);
                }
            }
            _ => {
                second = best.map(|(_, d)| d);
                best = Some((j, distance));
            }
        }
    }
    best.map(|(j, d)| (j, d, second))
}

/// Needle to haystack descriptor matches surviving the enabled filters.
fn match_descriptors(
    needle: &[Descriptor],
    haystack: &[Descriptor],
    params: &ParamRegistry,
) -> FinderResult<Vec<(usize, usize)>> {
    let ratio_test = params.flag("fmatch", "ratioTest")?;
    let ratio_threshold = params.float("fmatch", "ratioThreshold")?;
    let symmetry_test = params.flag("fmatch", "symmetryTest")?;
    let max_distance = params.int("fmatch", "maxDistance")?.max(0) as u32;

    let mut matches = Vec::new();
    for (i, query) in needle.iter().enumerate() {
        let Some((j, distance, second)) = nearest(query, haystack) else {
            continue;
        };
        if distance > max_distance {
            continue;
        }
        if ratio_test {
            if let Some(second) = second {
                if distance as f64 > ratio_threshold * second as f64 {
                    continue;
                }
            }
        }
        if symmetry_test && nearest(&haystack[j], needle).map(|(back, _, _)| back) != Some(i) {
            continue;
        }
        matches.push((i, j));
    }
    Ok(matches)
}

/// Translation agreed on by most matches, with the agreeing matches.
fn project(
    needle_kps: &[Corner],
    haystack_kps: &[Corner],
    matches: &[(usize, usize)],
    tolerance: f64,
) -> Option<((i64, i64), Vec<(usize, usize)>)> {
    let shift = |&(i, j): &(usize, usize)| {
        (
            haystack_kps[j].x as i64 - needle_kps[i].x as i64,
            haystack_kps[j].y as i64 - needle_kps[i].y as i64,
        )
    };
    let agrees = |a: (i64, i64), b: (i64, i64)| {
        ((a.0 - b.0).abs() as f64) <= tolerance && ((a.1 - b.1).abs() as f64) <= tolerance
    };

    let mut best: Option<((i64, i64), usize)> = None;
    for hypothesis in matches.iter().map(shift) {
        let votes = matches.iter().filter(|m| agrees(shift(m), hypothesis)).count();
        if best.is_none_or(|(_, v)| votes > v) {
            best = Some((hypothesis, votes));
        }
    }
    let (hypothesis, _) = best?;
    let inliers: Vec<(usize, usize)> = matches
        .iter()
        .copied()
        .filter(|m| agrees(shift(m), hypothesis))
        .collect();
    let n = inliers.len() as f64;
    let (sx, sy) = inliers
        .iter()
        .map(shift)
        .fold((0i64, 0i64), |acc, s| (acc.0 + s.0, acc.1 + s.1));
    Some((((sx as f64 / n).round() as i64, (sy as f64 / n).round() as i64), inliers))
}

fn keypoint_map(haystack: &RgbImage, points: &[(u32, u32)], colour: Rgb<u8>) -> RgbImage {
    let mut canvas = haystack.clone();
    for &(x, y) in points {
        let rect = imageproc::rect::Rect::at(x as i32 - 2, y as i32 - 2).of_size(5, 5);
        draw_hollow_rect_mut(&mut canvas, rect, colour);
    }
    canvas
}

/// Outcome of the feature stage for one needle/haystack pair.
pub(crate) struct FeatureSearch {
    pub candidate: Option<Candidate>,
    pub artifacts: Vec<StageArtifact>,
    /// The needle itself has too few keypoints to judge by features
    pub feature_poor: bool,
}

/// Feature stage shared with the combined template+feature matcher.
pub(crate) fn search(params: &ParamRegistry, needle: &RgbImage, haystack: &Haystack) -> FinderResult<FeatureSearch> {
    let min_detected = params.int("feature", "minDetectedFeatures")?.max(1) as usize;
    let min_matched = params.int("feature", "minMatchedFeatures")?.max(1) as usize;
    let tolerance = params.float("feature", "projectionTolerance")?;

    let needle_gray = image::imageops::grayscale(needle);
    let haystack_gray = haystack.gray();
    let needle_kps = detect(&needle_gray, params)?;
    let haystack_kps = detect(&haystack_gray, params)?;
    log::debug!(
        "🔍 Detected {} needle and {} haystack keypoints",
        needle_kps.len(),
        haystack_kps.len()
    );

    let haystack_points: Vec<(u32, u32)> = haystack_kps.iter().map(|c| (c.x, c.y)).collect();
    let detect_artifact = |similarity: f64| {
        StageArtifact::new("detect", similarity)
            .with_hotmap(keypoint_map(haystack.image(), &haystack_points, Rgb([255, 255, 0])))
            .with_points(haystack_points.clone())
    };

    if needle_kps.len() < min_detected {
        log::debug!("⚠️ Needle has only {} keypoints, need {}", needle_kps.len(), min_detected);
        return Ok(FeatureSearch {
            candidate: None,
            artifacts: vec![detect_artifact(0.0)],
            feature_poor: true,
        });
    }
    if haystack_kps.len() < min_detected {
        return Ok(FeatureSearch {
            candidate: None,
            artifacts: vec![detect_artifact(0.0)],
            feature_poor: false,
        });
    }

    let needle_desc = describe(&gaussian_blur_f32(&needle_gray, BLUR_SIGMA), &needle_kps);
    let haystack_desc = describe(&gaussian_blur_f32(&haystack_gray, BLUR_SIGMA), &haystack_kps);
    let matches = match_descriptors(&needle_desc, &haystack_desc, params)?;
    let total = needle_kps.len() as f64;
    let matched_points: Vec<(u32, u32)> = matches
        .iter()
        .map(|&(_, j)| (haystack_kps[j].x, haystack_kps[j].y))
        .collect();
    let match_artifact = StageArtifact::new("match", matches.len() as f64 / total)
        .with_hotmap(keypoint_map(haystack.image(), &matched_points, Rgb([0, 255, 255])))
        .with_points(matched_points);

    if matches.len() < min_matched {
        log::debug!("⚠️ Only {} keypoint matches, need {}", matches.len(), min_matched);
        return Ok(FeatureSearch {
            candidate: None,
            artifacts: vec![detect_artifact(1.0), match_artifact],
            feature_poor: false,
        });
    }

    let Some(((dx, dy), inliers)) = project(&needle_kps, &haystack_kps, &matches, tolerance) else {
        return Ok(FeatureSearch {
            candidate: None,
            artifacts: vec![detect_artifact(1.0), match_artifact],
            feature_poor: false,
        });
    };

    let similarity = inliers.len() as f64 / total;
    let max_x = (haystack.width() - needle.width()) as i64;
    let max_y = (haystack.height() - needle.height()) as i64;
    let rect = Rect::new(
        dx.clamp(0, max_x) as u32,
        dy.clamp(0, max_y) as u32,
        needle.width(),
        needle.height(),
    );
    let inlier_points: Vec<(u32, u32)> = inliers
        .iter()
        .map(|&(_, j)| (haystack_kps[j].x, haystack_kps[j].y))
        .collect();
    let mut projection = keypoint_map(haystack.image(), &inlier_points, Rgb([0, 255, 0]));
    draw_hollow_rect_mut(
        &mut projection,
        imageproc::rect::Rect::at(rect.x as i32, rect.y as i32).of_size(rect.width, rect.height),
        Rgb([255, 0, 0]),
    );
    let project_artifact = StageArtifact::new("project", similarity)
        .with_hotmap(projection)
        .with_points(inlier_points);

    log::debug!(
        "📐 {} of {} keypoints agree on ({},{}) similarity {:.3}",
        inliers.len(),
        needle_kps.len(),
        dx,
        dy,
        similarity
    );
    Ok(FeatureSearch {
        candidate: Some(Candidate::new(rect, similarity, "feature")),
        artifacts: vec![detect_artifact(1.0), match_artifact, project_artifact],
        feature_poor: false,
    })
}

#[derive(Debug, Clone)]
pub struct FeatureMatcher {
    params: ParamRegistry,
}

impl FeatureMatcher {
    pub fn new(config: &GlobalConfig) -> FinderResult<Self> {
        let mut specs = vec![find_spec(Family::Feature)];
        specs.extend(feature_specs());
        let params = ParamRegistry::new(specs, config)?;
        Ok(Self { params })
    }
}

impl Matcher for FeatureMatcher {
    fn family(&self) -> Family {
        Family::Feature
    }

    fn params(&self) -> &ParamRegistry {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamRegistry {
        &mut self.params
    }

    fn synchronize_backend(&mut self, category: Option<&str>) -> FinderResult<()> {
        match category {
            None | Some("fdetect") => synchronize_detector(&mut self.params),
            _ => Ok(()),
        }
    }

    fn find(&self, needle: &Target, haystack: &Haystack, _sink: &mut dyn DiagnosticSink) -> FinderResult<FindOutcome> {
        let pixels = needle_pixels(needle)?;
        check_needle_fits(needle, pixels.width(), pixels.height(), haystack)?;
        let similarity = self.similarity()?;
        let result = search(&self.params, pixels, haystack)?;
        let candidates = ranking::rank(result.candidate.into_iter().collect(), similarity);
        Ok(FindOutcome::new(candidates, similarity).with_stages(result.artifacts))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::diagnostics::NullSink;

    /// 64x64 needle of sparse bright dots on black, kept clear of the border.
    pub(crate) fn dotted_needle() -> RgbImage {
        let mut needle = RgbImage::new(64, 64);
        let mut state: u32 = 12345;
        let mut placed = 0;
        while placed < 24 {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let x = 18 + (state >> 16) % 28;
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let y = 18 + (state >> 16) % 28;
            if needle.get_pixel(x, y)[0] == 0 {
                needle.put_pixel(x, y, Rgb([255, 255, 255]));
                placed += 1;
            }
        }
        needle
    }

    pub(crate) fn scene_with(needle: &RgbImage, x: u32, y: u32) -> RgbImage {
        let mut scene = RgbImage::new(160, 120);
        image::imageops::replace(&mut scene, needle, x as i64, y as i64);
        scene
    }

    #[test]
    fn test_pattern_is_stable_and_within_patch() {
        let first = pattern();
        assert_eq!(first.len(), 256);
        assert!(first.iter().all(|&(a, b, c, d)| [a, b, c, d]
            .iter()
            .all(|v| v.abs() <= PATCH_RADIUS)));
        assert_eq!(first, pattern());
    }

    #[test]
    fn test_hamming() {
        let a = [0u8; DESCRIPTOR_BYTES];
        let mut b = [0u8; DESCRIPTOR_BYTES];
        b[0] = 0b1011;
        b[31] = 0x80;
        assert_eq!(hamming(&a, &b), 4);
    }

    #[test]
    fn test_projection_votes_for_majority() {
        let corner = |x, y| Corner::new(x, y, 1.0);
        let needle = vec![corner(10, 10), corner(20, 15), corner(30, 30), corner(12, 40)];
        let haystack = vec![corner(60, 50), corner(70, 55), corner(80, 70), corner(5, 5)];
        let matches = vec![(0, 0), (1, 1), (2, 2), (3, 3)];
        let ((dx, dy), inliers) = project(&needle, &haystack, &matches, 2.0).unwrap();
        assert_eq!((dx, dy), (50, 40));
        assert_eq!(inliers.len(), 3);
    }

    #[test]
    fn test_locates_dotted_needle() {
        let needle_img = dotted_needle();
        let haystack = Haystack::new(scene_with(&needle_img, 70, 30), "dots").unwrap();
        let needle = Target::image("dots", needle_img).unwrap();

        let mut matcher = FeatureMatcher::new(&GlobalConfig::default()).unwrap();
        matcher.params_mut().set("find", "similarity", 0.3).unwrap();
        let outcome = matcher.find(&needle, &haystack, &mut NullSink).unwrap();

        let best = outcome.best().unwrap();
        assert_eq!((best.rect.x, best.rect.y), (70, 30));
        assert!(outcome.is_match());
        assert_eq!(
            outcome.stages.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec!["detect", "match", "project"]
        );
    }

    #[test]
    fn test_flat_needle_is_feature_poor() {
        let params = FeatureMatcher::new(&GlobalConfig::default()).unwrap().params;
        let flat = RgbImage::from_pixel(40, 40, Rgb([90, 90, 90]));
        let haystack = Haystack::new(scene_with(&flat, 10, 10), "flat").unwrap();
        let result = search(&params, &flat, &haystack).unwrap();
        assert!(result.feature_poor);
        assert!(result.candidate.is_none());
    }

    #[test]
    fn test_synchronize_tracks_detector() {
        let mut matcher = FeatureMatcher::new(&GlobalConfig::default()).unwrap();
        matcher.configure_backend("fast12", Some("fdetect"), false).unwrap();
        assert_eq!(matcher.params().int("fdetect", "arc").unwrap(), 12);
        matcher.params_mut().can_calibrate("fdetect", true).unwrap();
        assert!(matcher.params().get("fdetect", "arc").unwrap().is_fixed());
        assert!(!matcher.params().get("fdetect", "threshold").unwrap().is_fixed());
    }

    #[test]
    fn test_ratio_test_rejects_ambiguous_matches() {
        let mut params = FeatureMatcher::new(&GlobalConfig::default()).unwrap().params;
        params.set("fmatch", "ratioTest", true).unwrap();
        let a = [0u8; DESCRIPTOR_BYTES];
        let mut b = [0u8; DESCRIPTOR_BYTES];
        b[0] = 1;
        let mut far = [0xFFu8; DESCRIPTOR_BYTES];
        far[0] = 0;
        // equally close to two haystack descriptors: rejected
        assert!(match_descriptors(&[b], &[a, a], &params).unwrap().is_empty());
        // clearly closest to one: kept
        assert_eq!(match_descriptors(&[a], &[a, far], &params).unwrap(), vec![(0, 0)]);
    }
}
