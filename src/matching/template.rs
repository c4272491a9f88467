//! Normalized template matching
//!
//! Colour needles are matched per channel and the score maps averaged,
//! unless `nocolor` reduces both images to grey first.

use image::{GrayImage, ImageBuffer, Luma, RgbImage};
use imageproc::template_matching::{match_template, MatchTemplateMethod};

use crate::config::GlobalConfig;
use crate::diagnostics::DiagnosticSink;
use crate::error::FinderResult;
use crate::params::registry::no_backend_params;
use crate::params::{CategorySpec, ParamDecl, ParamRegistry, Parameter};
use crate::target::Target;

use super::matcher::{find_spec, Family, Matcher};
use super::ranking::{self, ScoreMap};
use super::types::{Candidate, FindOutcome, Haystack, Rect, StageArtifact};
use super::{check_needle_fits, needle_pixels};

fn template_base() -> Vec<ParamDecl> {
    vec![("nocolor", Parameter::new(false).enumerated())]
}

pub(crate) fn template_spec() -> CategorySpec {
    CategorySpec {
        name: "template",
        backends: &["sqdiff_normed", "ccorr_normed"],
        base: template_base,
        backend_params: no_backend_params,
        read_only: &[],
    }
}

fn channel(image: &RgbImage, c: usize) -> GrayImage {
    ImageBuffer::from_fn(image.width(), image.height(), |x, y| Luma([image.get_pixel(x, y)[c]]))
}

/// Similarity map of every needle placement, higher is better.
fn score_map(needle: &RgbImage, haystack: &RgbImage, backend: &str, nocolor: bool) -> ScoreMap {
    let method = match backend {
        "sqdiff_normed" => MatchTemplateMethod::SumOfSquaredErrorsNormalized,
        _ => MatchTemplateMethod::CrossCorrelationNormalized,
    };
    let planes: Vec<(GrayImage, GrayImage)> = if nocolor {
        vec![(image::imageops::grayscale(needle), image::imageops::grayscale(haystack))]
    } else {
        (0..3).map(|c| (channel(needle, c), channel(haystack, c))).collect()
    };

    let mut combined: Option<ScoreMap> = None;
    for (needle_plane, haystack_plane) in &planes {
        let result = match_template(haystack_plane, needle_plane, method);
        combined = Some(match combined {
            None => result,
            Some(mut acc) => {
                for (a, r) in acc.pixels_mut().zip(result.pixels()) {
                    a[0] += r[0];
                }
                acc
            }
        });
    }

    let mut scores = combined.unwrap_or_else(|| ScoreMap::new(1, 1));
    let planes = planes.len().max(1) as f32;
    for pixel in scores.pixels_mut() {
        let mean = pixel[0] / planes;
        let similarity = if backend == "sqdiff_normed" { 1.0 - mean } else { mean };
        // flat needles or regions give 0/0 under normalization
        pixel[0] = if similarity.is_finite() { similarity.clamp(0.0, 1.0) } else { 0.0 };
    }
    scores
}

/// Template stage shared with the combined template+feature matcher.
pub(crate) fn search(
    params: &ParamRegistry,
    needle: &RgbImage,
    haystack: &Haystack,
    threshold: f64,
) -> FinderResult<(Vec<Candidate>, StageArtifact)> {
    let backend = params.backend("template")?;
    let nocolor = params.flag("template", "nocolor")?;
    log::debug!(
        "🔍 Performing template matching ({}): {}x{} in {}x{}",
        backend,
        needle.width(),
        needle.height(),
        haystack.width(),
        haystack.height()
    );

    let scores = score_map(needle, haystack.image(), backend, nocolor);
    let picks = ranking::pick_peaks(&mut scores.clone(), needle.width(), needle.height(), threshold);
    let candidates: Vec<Candidate> = picks
        .into_iter()
        .map(|(x, y, s)| Candidate::new(Rect::new(x, y, needle.width(), needle.height()), s, "template"))
        .collect();
    let candidates = ranking::rank(candidates, threshold);

    let best = candidates.first().map(|c| c.similarity).unwrap_or(0.0);
    let artifact = StageArtifact::new(backend, best)
        .with_hotmap(ranking::hotmap(&scores))
        .with_points(candidates.iter().map(|c| (c.rect.x, c.rect.y)).collect());
    Ok((candidates, artifact))
}

#[derive(Debug, Clone)]
pub struct TemplateMatcher {
    params: ParamRegistry,
}

impl TemplateMatcher {
    pub fn new(config: &GlobalConfig) -> FinderResult<Self> {
        let params = ParamRegistry::new(vec![find_spec(Family::Template), template_spec()], config)?;
        Ok(Self { params })
    }
}

impl Matcher for TemplateMatcher {
    fn family(&self) -> Family {
        Family::Template
    }

    fn params(&self) -> &ParamRegistry {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamRegistry {
        &mut self.params
    }

    fn find(&self, needle: &Target, haystack: &Haystack, _sink: &mut dyn DiagnosticSink) -> FinderResult<FindOutcome> {
        let pixels = needle_pixels(needle)?;
        check_needle_fits(needle, pixels.width(), pixels.height(), haystack)?;
        let similarity = self.similarity()?;
        let (candidates, artifact) = search(&self.params, pixels, haystack, similarity)?;
        Ok(FindOutcome::new(candidates, similarity).with_stages(vec![artifact]))
    }
}
