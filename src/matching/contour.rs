//! Contour matcher: shape comparison of binarized outlines
//!
//! Needle and haystack are blurred, thresholded and traced into contours.
//! Every haystack contour is compared with every needle contour through Hu
//! moment invariants, so matches survive scaling and translation. Haystack
//! contours are then assigned to needle contours greedily, one haystack
//! contour per needle contour, until the average distance exceeds what the
//! `find/similarity` threshold allows.

use image::{DynamicImage, GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::contrast::{threshold, ThresholdType};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::edges::canny;
use imageproc::filter::{box_filter, gaussian_blur_f32, median_filter};
use imageproc::geometry::{approximate_polygon_dp, contour_area};
use imageproc::point::Point;

use crate::config::GlobalConfig;
use crate::diagnostics::DiagnosticSink;
use crate::error::{FinderError, FinderResult};
use crate::params::registry::no_params;
use crate::params::{CategorySpec, ParamDecl, ParamRegistry, Parameter};
use crate::target::Target;

use super::matcher::{find_spec, Family, Matcher};
use super::needle_pixels;
use super::ranking;
use super::types::{Candidate, FindOutcome, Haystack, Rect, StageArtifact};

/// Distance given to contour pairs that were never compared.
const UNMATCHED: f64 = 1.0;
/// Marks a haystack contour already assigned to a needle contour.
const TAKEN: f64 = 1.1;
const APPROX_EPSILON: f64 = 3.0;
const HU_EPSILON: f64 = 1e-5;

fn contour_params(_backend: &str) -> Vec<ParamDecl> {
    vec![
        // 1 outermost contours only, 2 every contour
        ("retrievalMode", Parameter::new(2).bounded(1.0, 2.0).enumerated()),
        // 1 raw border points, 2 polygon approximation
        ("approxMethod", Parameter::new(2).bounded(1.0, 2.0).enumerated()),
        ("minArea", Parameter::new(0).at_least(0.0).delta(100.0)),
        // Hu moment comparison: 1 inverse log sum, 2 log sum, 3 relative max
        ("contoursMatch", Parameter::new(1).bounded(1.0, 3.0).enumerated()),
    ]
}

fn threshold_base() -> Vec<ParamDecl> {
    vec![
        // 1 box, 2 median, 3 gaussian, 4 none
        ("blurType", Parameter::new(4).bounded(1.0, 4.0).enumerated()),
        ("blurKernelSize", Parameter::new(5).at_least(1.0).delta(100.0)),
        ("blurKernelSigma", Parameter::new(0).at_least(0.0).delta(100.0)),
    ]
}

fn threshold_params(backend: &str) -> Vec<ParamDecl> {
    match backend {
        "normal" => vec![
            ("thresholdValue", Parameter::new(122).bounded(0.0, 255.0).delta(50.0)),
            ("thresholdMax", Parameter::new(255).bounded(0.0, 255.0).delta(20.0)),
            // 0 binary, 1 inverted
            ("thresholdType", Parameter::new(1).bounded(0.0, 1.0).enumerated()),
        ],
        "adaptive" => vec![
            ("thresholdMax", Parameter::new(255).bounded(0.0, 255.0).delta(20.0)),
            // 0 block mean, 1 gaussian weighted mean
            ("adaptiveMethod", Parameter::new(1).bounded(0.0, 1.0).enumerated()),
            ("thresholdType", Parameter::new(1).bounded(0.0, 1.0).enumerated()),
            ("blockSize", Parameter::new(11).at_least(3.0).delta(200.0).tolerance(2.0)),
            ("constant", Parameter::new(2).bounded(-255.0, 255.0).delta(1.0)),
        ],
        _ => vec![
            ("threshold1", Parameter::new(100.0).at_least(0.0).delta(50.0)),
            ("threshold2", Parameter::new(1000.0).at_least(0.0).delta(500.0)),
        ],
    }
}

fn contour_specs() -> Vec<CategorySpec> {
    vec![
        CategorySpec {
            name: "contour",
            backends: &["mixed"],
            base: no_params,
            backend_params: contour_params,
            read_only: &[],
        },
        CategorySpec {
            name: "threshold",
            backends: &["normal", "adaptive", "canny"],
            base: threshold_base,
            backend_params: threshold_params,
            read_only: &[],
        },
    ]
}

/// Sigma matching a gaussian kernel of `size` pixels.
fn kernel_sigma(size: u32) -> f32 {
    (0.3 * ((size as f64 - 1.0) * 0.5 - 1.0) + 0.8).max(0.1) as f32
}

fn blur(gray: &GrayImage, params: &ParamRegistry) -> FinderResult<GrayImage> {
    let size = params.int("threshold", "blurKernelSize")?.max(1) as u32;
    let radius = size / 2;
    Ok(match params.int("threshold", "blurType")? {
        1 if radius > 0 => box_filter(gray, radius, radius),
        2 if radius > 0 => median_filter(gray, radius, radius),
        3 => {
            let sigma = params.int("threshold", "blurKernelSigma")?;
            let sigma = if sigma > 0 { sigma as f32 } else { kernel_sigma(size) };
            gaussian_blur_f32(gray, sigma)
        }
        _ => gray.clone(),
    })
}

/// Binary image with foreground at 255, following the `threshold` category.
pub(crate) fn binarize(gray: &GrayImage, params: &ParamRegistry) -> FinderResult<GrayImage> {
    let blurred = blur(gray, params)?;
    let backend = params.backend("threshold")?;
    match backend {
        "normal" | "adaptive" => {
            let max = params.int("threshold", "thresholdMax")?.clamp(0, 255) as u8;
            let inverted = params.int("threshold", "thresholdType")? == 1;
            let mut mask = if backend == "normal" {
                let level = params.int("threshold", "thresholdValue")?.clamp(0, 255) as u8;
                let kind = if inverted { ThresholdType::BinaryInverted } else { ThresholdType::Binary };
                threshold(&blurred, level, kind)
            } else {
                adaptive_mask(&blurred, params, inverted)?
            };
            if max != 255 {
                for p in mask.pixels_mut().filter(|p| p[0] != 0) {
                    p[0] = max;
                }
            }
            Ok(mask)
        }
        _ => {
            let a = params.float("threshold", "threshold1")? as f32;
            let b = params.float("threshold", "threshold2")? as f32;
            Ok(canny(&blurred, a.min(b), a.max(b)))
        }
    }
}

/// Foreground where a pixel is brighter than its local mean minus `constant`.
fn adaptive_mask(gray: &GrayImage, params: &ParamRegistry, inverted: bool) -> FinderResult<GrayImage> {
    let block = (params.int("threshold", "blockSize")?.max(3) as u32) | 1;
    let constant = params.int("threshold", "constant")? as i32;
    let local_mean = match params.int("threshold", "adaptiveMethod")? {
        0 => box_filter(gray, block / 2, block / 2),
        _ => gaussian_blur_f32(gray, kernel_sigma(block)),
    };
    Ok(ImageBuffer::from_fn(gray.width(), gray.height(), |x, y| {
        let bright = gray.get_pixel(x, y)[0] as i32 > local_mean.get_pixel(x, y)[0] as i32 - constant;
        Luma([if bright != inverted { 255 } else { 0 }])
    }))
}

fn point_bounds(points: &[Point<i32>]) -> Option<Rect> {
    let min_x = points.iter().map(|p| p.x).min()?;
    let min_y = points.iter().map(|p| p.y).min()?;
    let max_x = points.iter().map(|p| p.x).max()?;
    let max_y = points.iter().map(|p| p.y).max()?;
    Some(Rect::new(
        min_x.max(0) as u32,
        min_y.max(0) as u32,
        (max_x - min_x + 1) as u32,
        (max_y - min_y + 1) as u32,
    ))
}

fn union(a: Rect, b: Rect) -> Rect {
    let x = a.x.min(b.x);
    let y = a.y.min(b.y);
    let right = (a.x + a.width).max(b.x + b.width);
    let bottom = (a.y + a.height).max(b.y + b.height);
    Rect::new(x, y, right - x, bottom - y)
}

/// Bounding boxes of the outer borders in a binary image, in trace order.
pub(crate) fn outer_bounds(mask: &GrayImage) -> Vec<Rect> {
    find_contours::<i32>(mask)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer)
        .filter_map(|c| point_bounds(&c.points))
        .collect()
}

/// One traced outline with what matching needs from it.
#[derive(Debug, Clone)]
struct Shape {
    points: Vec<Point<i32>>,
    bounds: Rect,
    area: f64,
    hu: Option<[f64; 7]>,
}

fn extract_shapes(mask: &GrayImage, params: &ParamRegistry) -> FinderResult<Vec<Shape>> {
    let outermost_only = params.int("contour", "retrievalMode")? == 1;
    let approximate = params.int("contour", "approxMethod")? == 2;
    let shapes = find_contours::<i32>(mask)
        .into_iter()
        .filter(|c: &Contour<i32>| !outermost_only || c.parent.is_none())
        .filter_map(|c| {
            let bounds = point_bounds(&c.points)?;
            let points = if approximate && c.points.len() >= 3 {
                approximate_polygon_dp(&c.points, APPROX_EPSILON, true)
            } else {
                c.points
            };
            Some(Shape {
                area: contour_area(&points),
                hu: hu_moments(&points),
                points,
                bounds,
            })
        })
        .collect();
    Ok(shapes)
}

/// The seven Hu invariants of a closed polygon, or `None` for degenerate outlines.
pub fn hu_moments(points: &[Point<i32>]) -> Option<[f64; 7]> {
    if points.len() < 3 {
        return None;
    }
    let (mut m00, mut m10, mut m01) = (0.0, 0.0, 0.0);
    let (mut m20, mut m11, mut m02) = (0.0, 0.0, 0.0);
    let (mut m30, mut m21, mut m12, mut m03) = (0.0, 0.0, 0.0, 0.0);
    for (i, p) in points.iter().enumerate() {
        let q = points[(i + 1) % points.len()];
        let (x0, y0, x1, y1) = (p.x as f64, p.y as f64, q.x as f64, q.y as f64);
        let a = x0 * y1 - x1 * y0;
        m00 += a / 2.0;
        m10 += a * (x0 + x1) / 6.0;
        m01 += a * (y0 + y1) / 6.0;
        m20 += a * (x0 * x0 + x0 * x1 + x1 * x1) / 12.0;
        m02 += a * (y0 * y0 + y0 * y1 + y1 * y1) / 12.0;
        m11 += a * (2.0 * x0 * y0 + x0 * y1 + x1 * y0 + 2.0 * x1 * y1) / 24.0;
        m30 += a * (x0.powi(3) + x0 * x0 * x1 + x0 * x1 * x1 + x1.powi(3)) / 20.0;
        m03 += a * (y0.powi(3) + y0 * y0 * y1 + y0 * y1 * y1 + y1.powi(3)) / 20.0;
        m21 += a * (x0 * x0 * (3.0 * y0 + y1) + 2.0 * x0 * x1 * (y0 + y1) + x1 * x1 * (y0 + 3.0 * y1)) / 60.0;
        m12 += a * (y0 * y0 * (3.0 * x0 + x1) + 2.0 * y0 * y1 * (x0 + x1) + y1 * y1 * (x0 + 3.0 * x1)) / 60.0;
    }
    // clockwise traces give negative moments
    let sign = m00.signum();
    let [m00, m10, m01, m20, m11, m02, m30, m21, m12, m03] =
        [m00, m10, m01, m20, m11, m02, m30, m21, m12, m03].map(|m| m * sign);
    if m00 < f64::EPSILON {
        return None;
    }

    let (xc, yc) = (m10 / m00, m01 / m00);
    let mu20 = m20 - xc * m10;
    let mu02 = m02 - yc * m01;
    let mu11 = m11 - xc * m01;
    let mu30 = m30 - 3.0 * xc * m20 + 2.0 * xc * xc * m10;
    let mu03 = m03 - 3.0 * yc * m02 + 2.0 * yc * yc * m01;
    let mu21 = m21 - 2.0 * xc * m11 - yc * m20 + 2.0 * xc * xc * m01;
    let mu12 = m12 - 2.0 * yc * m11 - xc * m02 + 2.0 * yc * yc * m10;

    let (s2, s3) = (m00.powi(2), m00.powf(2.5));
    let (n20, n02, n11) = (mu20 / s2, mu02 / s2, mu11 / s2);
    let (n30, n03, n21, n12) = (mu30 / s3, mu03 / s3, mu21 / s3, mu12 / s3);

    let (t0, t1) = (n30 + n12, n21 + n03);
    let (q0, q1) = (n30 - 3.0 * n12, 3.0 * n21 - n03);
    Some([
        n20 + n02,
        (n20 - n02).powi(2) + 4.0 * n11 * n11,
        q0 * q0 + q1 * q1,
        t0 * t0 + t1 * t1,
        q0 * t0 * (t0 * t0 - 3.0 * t1 * t1) + q1 * t1 * (3.0 * t0 * t0 - t1 * t1),
        (n20 - n02) * (t0 * t0 - t1 * t1) + 4.0 * n11 * t0 * t1,
        q1 * t0 * (t0 * t0 - 3.0 * t1 * t1) - q0 * t1 * (3.0 * t0 * t0 - t1 * t1),
    ])
}

/// Distance between two Hu moment sets; 0 for identical shapes.
///
/// Invariants too close to zero in either set are skipped.
pub fn shape_distance(a: &[f64; 7], b: &[f64; 7], method: i64) -> f64 {
    let log_scale = |h: f64| h.signum() * h.abs().log10();
    let mut distance: f64 = 0.0;
    for (&ha, &hb) in a.iter().zip(b) {
        if ha.abs() <= HU_EPSILON || hb.abs() <= HU_EPSILON {
            continue;
        }
        let (ma, mb) = (log_scale(ha), log_scale(hb));
        match method {
            1 => distance += (1.0 / ma - 1.0 / mb).abs(),
            2 => distance += (ma - mb).abs(),
            _ => distance = distance.max((ma - mb).abs() / ma.abs()),
        }
    }
    distance
}

fn mask_preview(mask: &GrayImage) -> RgbImage {
    DynamicImage::ImageLuma8(mask.clone()).to_rgb8()
}

fn contour_preview(width: u32, height: u32, shapes: &[Shape]) -> RgbImage {
    let mut canvas = RgbImage::new(width, height);
    for point in shapes.iter().flat_map(|s| s.points.iter()) {
        if point.x >= 0 && point.y >= 0 && (point.x as u32) < width && (point.y as u32) < height {
            canvas.put_pixel(point.x as u32, point.y as u32, Rgb([255, 255, 255]));
        }
    }
    canvas
}

#[derive(Debug, Clone)]
pub struct ContourMatcher {
    params: ParamRegistry,
}

impl ContourMatcher {
    pub fn new(config: &GlobalConfig) -> FinderResult<Self> {
        let mut specs = vec![find_spec(Family::Contour)];
        specs.extend(contour_specs());
        let params = ParamRegistry::new(specs, config)?;
        Ok(Self { params })
    }

    fn distances(&self, haystack: &[Shape], needle: &[Shape]) -> FinderResult<Vec<Vec<f64>>> {
        let min_area = self.params.int("contour", "minArea")?.max(0) as f64;
        let method = self.params.int("contour", "contoursMatch")?;
        let mut distances = vec![vec![UNMATCHED; needle.len()]; haystack.len()];
        for (row, h) in distances.iter_mut().zip(haystack) {
            if h.area < min_area {
                continue;
            }
            for (cell, n) in row.iter_mut().zip(needle) {
                if n.area < min_area {
                    continue;
                }
                if let (Some(hh), Some(nh)) = (&h.hu, &n.hu) {
                    *cell = shape_distance(hh, nh, method);
                }
            }
        }
        Ok(distances)
    }
}

impl Matcher for ContourMatcher {
    fn family(&self) -> Family {
        Family::Contour
    }

    fn params(&self) -> &ParamRegistry {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamRegistry {
        &mut self.params
    }

    fn find(&self, needle: &Target, haystack: &Haystack, _sink: &mut dyn DiagnosticSink) -> FinderResult<FindOutcome> {
        let needle_image = needle_pixels(needle)?;
        let similarity = self.similarity()?;

        let needle_mask = binarize(&image::imageops::grayscale(needle_image), &self.params)?;
        let needle_shapes = extract_shapes(&needle_mask, &self.params)?;
        let needle_bounds = needle_shapes
            .iter()
            .map(|s| s.bounds)
            .reduce(union)
            .ok_or_else(|| FinderError::InvalidNeedle {
                needle: needle.name().to_string(),
                reason: "no contours found in the needle".to_string(),
            })?;

        let haystack_mask = binarize(&haystack.gray(), &self.params)?;
        let haystack_shapes = extract_shapes(&haystack_mask, &self.params)?;
        log::debug!(
            "🔍 {} needle and {} haystack contour(s)",
            needle_shapes.len(),
            haystack_shapes.len()
        );

        let mut distances = self.distances(&haystack_shapes, &needle_shapes)?;
        let required = 1.0 - similarity;
        let mut boxes = haystack.image().clone();
        let mut candidates = Vec::new();
        while !haystack_shapes.is_empty() {
            let mut total = 0.0;
            let mut picked = Vec::with_capacity(needle_shapes.len());
            for column in 0..needle_shapes.len() {
                let Some((row, distance)) = distances
                    .iter()
                    .enumerate()
                    .map(|(i, r)| (i, r[column]))
                    .min_by(|a, b| a.1.total_cmp(&b.1))
                else {
                    break;
                };
                total += distance;
                picked.push(row);
                // each haystack contour serves one needle contour at most
                distances[row].fill(TAKEN);
            }
            let average = total / needle_shapes.len() as f64;
            log::trace!("  📐 average shape distance {:.4} of max allowed {:.4}", average, required);
            if average > required {
                break;
            }

            let Some(found) = picked.iter().map(|&i| haystack_shapes[i].bounds).reduce(union) else {
                break;
            };
            let scale_x = found.width as f64 / needle_bounds.width as f64;
            let scale_y = found.height as f64 / needle_bounds.height as f64;
            let x = (found.x as f64 - needle_bounds.x as f64 * scale_x).max(0.0) as u32;
            let y = (found.y as f64 - needle_bounds.y as f64 * scale_y).max(0.0) as u32;
            let right = ((x as f64 + needle_image.width() as f64 * scale_x).round() as u32).min(haystack.width());
            let bottom = ((y as f64 + needle_image.height() as f64 * scale_y).round() as u32).min(haystack.height());
            let rect = Rect::new(x, y, right.saturating_sub(x).max(1), bottom.saturating_sub(y).max(1));

            draw_hollow_rect_mut(
                &mut boxes,
                imageproc::rect::Rect::at(rect.x as i32, rect.y as i32).of_size(rect.width, rect.height),
                Rgb([255, 0, 0]),
            );
            candidates.push(Candidate::new(rect, 1.0 - average, "contour"));
        }

        let candidates = ranking::rank(candidates, similarity);
        let best = candidates.first().map(|c| c.similarity).unwrap_or(0.0);
        let stages = vec![
            StageArtifact::new("threshold", best).with_hotmap(mask_preview(&haystack_mask)),
            StageArtifact::new("contours", best).with_hotmap(contour_preview(
                haystack.width(),
                haystack.height(),
                &haystack_shapes,
            )),
            StageArtifact::new("contour", best)
                .with_hotmap(boxes)
                .with_points(candidates.iter().map(|c| (c.rect.x, c.rect.y)).collect()),
        ];
        Ok(FindOutcome::new(candidates, similarity).with_stages(stages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::NullSink;

    fn polygon(points: &[(i32, i32)]) -> Vec<Point<i32>> {
        points.iter().map(|&(x, y)| Point::new(x, y)).collect()
    }

    fn fill(image: &mut RgbImage, x: u32, y: u32, w: u32, h: u32) {
        for dy in 0..h {
            for dx in 0..w {
                image.put_pixel(x + dx, y + dy, Rgb([20, 20, 20]));
            }
        }
    }

    /// Light background with a dark L at (60, 20) and a dark bar at (10, 10).
    fn scene() -> RgbImage {
        let mut image = RgbImage::from_pixel(120, 80, Rgb([230, 230, 230]));
        fill(&mut image, 60, 20, 8, 24);
        fill(&mut image, 60, 36, 20, 8);
        fill(&mut image, 10, 10, 30, 6);
        image
    }

    fn matcher() -> ContourMatcher {
        let mut matcher = ContourMatcher::new(&GlobalConfig::default()).unwrap();
        matcher.configure_backend("normal", Some("threshold"), false).unwrap();
        matcher
    }

    #[test]
    fn test_hu_moments_ignore_translation_and_scale() {
        let l_shape = [(0, 0), (2, 0), (2, 1), (1, 1), (1, 2), (0, 2)];
        let small = hu_moments(&polygon(&l_shape)).unwrap();
        let large: Vec<(i32, i32)> = l_shape.iter().map(|&(x, y)| (3 * x + 40, 3 * y + 7)).collect();
        let large = hu_moments(&polygon(&large)).unwrap();
        let square = hu_moments(&polygon(&[(0, 0), (4, 0), (4, 4), (0, 4)])).unwrap();

        assert!((small[0] - 0.2037).abs() < 1e-4);
        for method in 1..=3 {
            assert!(shape_distance(&small, &large, method) < 1e-9);
            assert!(shape_distance(&small, &square, method) > 0.05);
        }
    }

    #[test]
    fn test_degenerate_outlines_have_no_moments() {
        assert!(hu_moments(&polygon(&[(0, 0), (5, 0)])).is_none());
        assert!(hu_moments(&polygon(&[(0, 0), (5, 0), (10, 0)])).is_none());
    }

    #[test]
    fn test_finds_shape_cut_from_haystack() {
        let image = scene();
        let needle = image::imageops::crop_imm(&image, 55, 15, 30, 34).to_image();
        let needle = Target::image("l-shape", needle).unwrap();
        let haystack = Haystack::new(image, "scene").unwrap();

        let outcome = matcher().find(&needle, &haystack, &mut NullSink).unwrap();
        let best = outcome.best().unwrap();
        assert_eq!(best.rect, Rect::new(55, 15, 30, 34));
        assert!(best.similarity > 0.99);
        assert_eq!(best.stage, "contour");
        assert_eq!(
            outcome.stages.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec!["threshold", "contours", "contour"]
        );
    }

    #[test]
    fn test_blank_needle_is_invalid() {
        let needle = Target::image("blank", RgbImage::from_pixel(10, 10, Rgb([230, 230, 230]))).unwrap();
        let haystack = Haystack::new(scene(), "scene").unwrap();
        let err = matcher().find(&needle, &haystack, &mut NullSink).unwrap_err();
        assert!(matches!(err, FinderError::InvalidNeedle { .. }));
    }

    #[test]
    fn test_outer_bounds_skip_holes() {
        let mut image = RgbImage::from_pixel(40, 30, Rgb([230, 230, 230]));
        fill(&mut image, 5, 5, 12, 12);
        image.put_pixel(10, 10, Rgb([230, 230, 230]));
        fill(&mut image, 25, 8, 4, 9);
        let mask = binarize(&image::imageops::grayscale(&image), &matcher().params).unwrap();
        let mut bounds = outer_bounds(&mask);
        bounds.sort_by_key(|r| r.x);
        assert_eq!(bounds, vec![Rect::new(5, 5, 12, 12), Rect::new(25, 8, 4, 9)]);
    }

    #[test]
    fn test_every_threshold_backend_binarizes() {
        let gray = image::imageops::grayscale(&scene());
        for backend in ["normal", "adaptive", "canny"] {
            let mut matcher = ContourMatcher::new(&GlobalConfig::default()).unwrap();
            matcher.configure_backend(backend, Some("threshold"), false).unwrap();
            matcher.params_mut().set("threshold", "blurType", 3).unwrap();
            if backend == "canny" {
                matcher.params_mut().set("threshold", "threshold1", 50.0).unwrap();
                matcher.params_mut().set("threshold", "threshold2", 200.0).unwrap();
            }
            let mask = binarize(&gray, &matcher.params).unwrap();
            assert_eq!(mask.dimensions(), gray.dimensions());
            assert!(mask.pixels().any(|p| p[0] != 0), "{backend} produced an empty mask");
        }
    }
}
