//! Text matcher: box detection followed by pluggable recognition
//!
//! Stage 1 traces character outlines with the contour matcher's border
//! following and groups them into text lines. Stage 2 hands
//! each line to a registered [`TextRecognizer`] and scores the recognised
//! string against the wanted one by edit distance.

use std::fmt;
use std::sync::Arc;

use image::{GrayImage, ImageBuffer, Luma, Rgb};
use imageproc::contrast::otsu_level;
use imageproc::drawing::draw_hollow_rect_mut;

use crate::config::GlobalConfig;
use crate::diagnostics::DiagnosticSink;
use crate::error::{FinderError, FinderResult};
use crate::params::registry::no_params;
use crate::params::{Category, CategorySpec, ParamDecl, ParamRegistry, Parameter};
use crate::target::{Target, TargetData};

use super::composite::{self, StageResult};
use super::contour::outer_bounds;
use super::matcher::{find_spec, Family, Matcher};
use super::ranking;
use super::types::{Candidate, FindOutcome, Haystack, Rect, StageArtifact};

/// OCR engine turning a cropped line image into text.
pub trait TextRecognizer: Send + Sync {
    fn recognize(&self, line: &GrayImage, settings: &Category) -> FinderResult<String>;
}

fn text_base() -> Vec<ParamDecl> {
    vec![
        ("minArea", Parameter::new(4).bounded(1.0, 1_000_000.0)),
        ("maxArea", Parameter::new(10_000).bounded(1.0, 1_000_000.0).delta(500.0)),
        ("minChars", Parameter::new(1).bounded(1.0, 100.0).delta(1.0)),
        ("horizontalSpacing", Parameter::new(10).bounded(0.0, 200.0).delta(2.0)),
        ("verticalVariance", Parameter::new(10).bounded(0.0, 200.0).delta(2.0)),
    ]
}

fn text_params(_backend: &str) -> Vec<ParamDecl> {
    vec![("invert", Parameter::new(false).enumerated())]
}

fn ocr_params(_backend: &str) -> Vec<ParamDecl> {
    vec![
        ("language", Parameter::new("eng").enumerated()),
        ("char_whitelist", Parameter::new("")),
        ("min_confidence", Parameter::new(0).bounded(0.0, 100.0)),
        ("border_size", Parameter::new(10).bounded(0.0, 100.0).delta(2.0)),
    ]
}

fn text_specs() -> Vec<CategorySpec> {
    vec![
        CategorySpec {
            name: "text",
            backends: &["contours"],
            base: text_base,
            backend_params: text_params,
            read_only: &[],
        },
        CategorySpec {
            name: "ocr",
            backends: &["external"],
            base: no_params,
            backend_params: ocr_params,
            read_only: &["language"],
        },
    ]
}

/// Edit distance between two strings, counted in characters.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b_chars.len()).collect();
    let mut current = vec![0; b_chars.len() + 1];
    for (i, ca) in a.chars().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != *cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b_chars.len()]
}

/// 1 for identical strings, 0 when nothing is shared.
pub fn text_similarity(wanted: &str, found: &str) -> f64 {
    let longest = wanted.chars().count().max(found.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(wanted, found) as f64 / longest as f64
}

#[derive(Debug, Clone, Copy)]
struct Bounds {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
}

impl From<Rect> for Bounds {
    fn from(r: Rect) -> Self {
        Self {
            min_x: r.x,
            min_y: r.y,
            max_x: r.x + r.width - 1,
            max_y: r.y + r.height - 1,
        }
    }
}

impl Bounds {
    fn include(&mut self, other: &Bounds) {
        self.min_x = self.min_x.min(other.min_x);
        self.min_y = self.min_y.min(other.min_y);
        self.max_x = self.max_x.max(other.max_x);
        self.max_y = self.max_y.max(other.max_y);
    }

    fn rect(&self) -> Rect {
        Rect::new(self.min_x, self.min_y, self.max_x - self.min_x + 1, self.max_y - self.min_y + 1)
    }

    fn center_y(&self) -> f64 {
        (self.min_y + self.max_y) as f64 / 2.0
    }
}

/// Character boxes from the outer contours of the binarized haystack.
fn character_boxes(gray: &GrayImage, params: &ParamRegistry) -> FinderResult<Vec<Bounds>> {
    let invert = params.flag("text", "invert")?;
    let min_area = params.int("text", "minArea")?.max(1) as u64;
    let max_area = params.int("text", "maxArea")?.max(1) as u64;

    let level = otsu_level(gray);
    let mask: GrayImage = ImageBuffer::from_fn(gray.width(), gray.height(), |x, y| {
        let dark = gray.get_pixel(x, y)[0] <= level;
        Luma([if dark != invert { 255 } else { 0 }])
    });

    Ok(outer_bounds(&mask)
        .into_iter()
        .filter(|r| r.area() >= min_area && r.area() <= max_area)
        .map(Bounds::from)
        .collect())
}

/// Group character boxes into text lines, top to bottom then left to right.
fn text_lines(mut chars: Vec<Bounds>, params: &ParamRegistry) -> FinderResult<Vec<Rect>> {
    let spacing = params.int("text", "horizontalSpacing")?.max(0) as u32;
    let variance = params.int("text", "verticalVariance")?.max(0) as f64;
    let min_chars = params.int("text", "minChars")?.max(1) as usize;

    chars.sort_by_key(|b| (b.min_x, b.min_y));
    let mut lines: Vec<(Bounds, f64, usize)> = Vec::new();
    for ch in chars {
        let joined = lines.iter_mut().find(|(line, center, _)| {
            (ch.center_y() - *center).abs() <= variance && ch.min_x <= line.max_x + spacing + 1
        });
        match joined {
            Some((line, _, count)) => {
                line.include(&ch);
                *count += 1;
            }
            None => lines.push((ch, ch.center_y(), 1)),
        }
    }

    let mut rects: Vec<Rect> = lines
        .into_iter()
        .filter(|(_, _, count)| *count >= min_chars)
        .map(|(line, _, _)| line.rect())
        .collect();
    rects.sort_by_key(|r| (r.y, r.x));
    Ok(rects)
}

#[derive(Clone)]
pub struct TextMatcher {
    params: ParamRegistry,
    recognizer: Option<Arc<dyn TextRecognizer>>,
}

impl fmt::Debug for TextMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextMatcher")
            .field("params", &self.params)
            .field("recognizer", &self.recognizer.is_some())
            .finish()
    }
}

impl TextMatcher {
    pub fn new(config: &GlobalConfig) -> FinderResult<Self> {
        let mut specs = vec![find_spec(Family::Text)];
        specs.extend(text_specs());
        let params = ParamRegistry::new(specs, config)?;
        Ok(Self {
            params,
            recognizer: config.text_recognizer.clone(),
        })
    }
}

impl Matcher for TextMatcher {
    fn family(&self) -> Family {
        Family::Text
    }

    fn params(&self) -> &ParamRegistry {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamRegistry {
        &mut self.params
    }

    fn find(&self, needle: &Target, haystack: &Haystack, _sink: &mut dyn DiagnosticSink) -> FinderResult<FindOutcome> {
        let TargetData::Text { value } = needle.data() else {
            return Err(FinderError::InvalidNeedle {
                needle: needle.name().to_string(),
                reason: format!("expected a text target, got {}", needle.kind()),
            });
        };
        let wanted = value.trim();
        if wanted.is_empty() {
            return Err(FinderError::InvalidNeedle {
                needle: needle.name().to_string(),
                reason: "text to find is empty".to_string(),
            });
        }
        let recognizer = self.recognizer.as_ref().ok_or_else(|| FinderError::BackendUnavailable {
            backend: format!("ocr/{}", self.params.backend("ocr").unwrap_or("external")),
            reason: "no text recognizer registered".to_string(),
        })?;
        let similarity = self.similarity()?;
        let ocr = self.params.category("ocr")?;
        let border = ocr.int("border_size").unwrap_or(0).max(0) as u32;

        let gray = haystack.gray();
        let lines = text_lines(character_boxes(&gray, &self.params)?, &self.params)?;
        log::debug!("🔍 Detected {} text line(s) in {}", lines.len(), haystack.name());

        let mut detection_map = haystack.image().clone();
        for line in &lines {
            draw_hollow_rect_mut(
                &mut detection_map,
                imageproc::rect::Rect::at(line.x as i32, line.y as i32).of_size(line.width, line.height),
                Rgb([255, 0, 0]),
            );
        }
        let detect_artifact = StageArtifact::new("detect", if lines.is_empty() { 0.0 } else { 1.0 })
            .with_hotmap(detection_map)
            .with_points(lines.iter().map(|r| (r.x, r.y)).collect());

        let mut candidates = Vec::with_capacity(lines.len());
        for line in &lines {
            let x0 = line.x.saturating_sub(border);
            let y0 = line.y.saturating_sub(border);
            let x1 = (line.x + line.width + border).min(gray.width());
            let y1 = (line.y + line.height + border).min(gray.height());
            let crop = image::imageops::crop_imm(&gray, x0, y0, x1 - x0, y1 - y0).to_image();
            let found = recognizer.recognize(&crop, ocr)?;
            let score = text_similarity(wanted, found.trim());
            log::trace!("  📝 '{}' at ({},{}) scores {:.3}", found.trim(), line.x, line.y, score);

            let stages = vec![
                StageResult::new(Candidate::new(*line, 1.0, "detect"), Vec::new()),
                StageResult::new(Candidate::new(*line, score, "ocr"), Vec::new()),
            ];
            if let Some((merged, _)) = composite::merge(stages, false) {
                candidates.push(merged);
            }
        }

        let candidates = ranking::rank(candidates, similarity);
        let best = candidates.first().map(|c| c.similarity).unwrap_or(0.0);
        let mut ocr_artifact = StageArtifact::new("ocr", best).with_points(candidates.iter().map(|c| (c.rect.x, c.rect.y)).collect());
        ocr_artifact.stage = 2;
        Ok(FindOutcome::new(candidates, similarity).with_stages(vec![detect_artifact, ocr_artifact]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::NullSink;
    use image::RgbImage;

    /// Reads wide lines as "OPEN" and narrow ones as "OK".
    struct WidthReader;

    impl TextRecognizer for WidthReader {
        fn recognize(&self, line: &GrayImage, settings: &Category) -> FinderResult<String> {
            assert_eq!(settings.text("language"), Some("eng"));
            Ok(if line.width() > 45 { "OPEN" } else { "OK" }.to_string())
        }
    }

    fn draw_word(image: &mut RgbImage, x: u32, y: u32, chars: u32) {
        for c in 0..chars {
            for dy in 0..10 {
                for dx in 0..6 {
                    image.put_pixel(x + c * 9 + dx, y + dy, Rgb([10, 10, 10]));
                }
            }
        }
    }

    fn screen() -> Haystack {
        let mut image = RgbImage::from_pixel(120, 70, Rgb([240, 240, 240]));
        draw_word(&mut image, 20, 10, 4);
        draw_word(&mut image, 20, 40, 2);
        Haystack::new(image, "dialog").unwrap()
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("OK", "OPEN"), 3);
        assert_eq!(text_similarity("", ""), 1.0);
        assert_eq!(text_similarity("OPEN", "OPEN"), 1.0);
        assert_eq!(text_similarity("OK", "OPEN"), 0.25);
    }

    #[test]
    fn test_lines_are_grouped() {
        let matcher = TextMatcher::new(&GlobalConfig::default()).unwrap();
        let gray = screen().gray();
        let lines = text_lines(character_boxes(&gray, &matcher.params).unwrap(), &matcher.params).unwrap();
        assert_eq!(lines, vec![Rect::new(20, 10, 33, 10), Rect::new(20, 40, 15, 10)]);
    }

    #[test]
    fn test_finds_recognised_line() {
        let config = GlobalConfig::default().with_text_recognizer(Arc::new(WidthReader));
        let matcher = TextMatcher::new(&config).unwrap();
        let outcome = matcher.find(&Target::text("OK"), &screen(), &mut NullSink).unwrap();

        assert_eq!(outcome.candidates.len(), 1);
        let best = outcome.best().unwrap();
        assert_eq!(best.rect, Rect::new(20, 40, 15, 10));
        assert_eq!(best.similarity, 1.0);
        assert_eq!(best.stage, "ocr");
        assert_eq!(best.sub_results[0].stage, "detect");
        assert_eq!(
            outcome.stages.iter().map(|s| s.stage).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn test_missing_recognizer_is_unavailable() {
        let matcher = TextMatcher::new(&GlobalConfig::default()).unwrap();
        let err = matcher.find(&Target::text("OK"), &screen(), &mut NullSink).unwrap_err();
        assert!(matches!(err, FinderError::BackendUnavailable { .. }));
    }
}
