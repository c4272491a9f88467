//! Template stage followed by feature verification
//!
//! Template matching at `front_similarity` proposes locations; the feature
//! stage re-scores each proposal and has the final word. Needles too plain
//! for keypoints fall back to template similarity checked against the final
//! threshold.

use crate::config::GlobalConfig;
use crate::diagnostics::DiagnosticSink;
use crate::error::FinderResult;
use crate::params::registry::no_params;
use crate::params::{CategorySpec, ParamDecl, ParamRegistry, Parameter};
use crate::target::Target;

use super::composite::{self, StageResult};
use super::matcher::{find_spec, Family, Matcher};
use super::types::{Candidate, FindOutcome, Haystack};
use super::{check_needle_fits, feature, needle_pixels, ranking, template};

fn tempfeat_params(_backend: &str) -> Vec<ParamDecl> {
    vec![(
        "front_similarity",
        Parameter::new(0.7).bounded(0.0, 1.0).delta(0.1).tolerance(0.01),
    )]
}

fn tempfeat_spec() -> CategorySpec {
    CategorySpec {
        name: "tempfeat",
        backends: &["mixed"],
        base: no_params,
        backend_params: tempfeat_params,
        read_only: &[],
    }
}

#[derive(Debug, Clone)]
pub struct TempFeatMatcher {
    params: ParamRegistry,
}

impl TempFeatMatcher {
    pub fn new(config: &GlobalConfig) -> FinderResult<Self> {
        let mut specs = vec![find_spec(Family::TempFeat), tempfeat_spec(), template::template_spec()];
        specs.extend(feature::feature_specs());
        let params = ParamRegistry::new(specs, config)?;
        Ok(Self { params })
    }
}

impl Matcher for TempFeatMatcher {
    fn family(&self) -> Family {
        Family::TempFeat
    }

    fn params(&self) -> &ParamRegistry {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamRegistry {
        &mut self.params
    }

    fn synchronize_backend(&mut self, category: Option<&str>) -> FinderResult<()> {
        match category {
            None | Some("fdetect") => feature::synchronize_detector(&mut self.params),
            _ => Ok(()),
        }
    }

    fn find(&self, needle: &Target, haystack: &Haystack, _sink: &mut dyn DiagnosticSink) -> FinderResult<FindOutcome> {
        let pixels = needle_pixels(needle)?;
        check_needle_fits(needle, pixels.width(), pixels.height(), haystack)?;
        let similarity = self.similarity()?;
        let front_similarity = self.params.float("tempfeat", "front_similarity")?;

        let (proposals, template_artifact) = template::search(&self.params, pixels, haystack, front_similarity)?;
        let survivors: Vec<&Candidate> = proposals.iter().filter(|c| c.similarity >= front_similarity).collect();
        let mut artifacts = vec![template_artifact];

        if survivors.is_empty() {
            log::debug!("❌ No template proposals above {:.3}", front_similarity);
            let candidates = ranking::rank(proposals, similarity);
            return Ok(FindOutcome::new(candidates, similarity).with_stages(artifacts));
        }

        let mut verified = Vec::with_capacity(survivors.len());
        for proposal in survivors {
            let region = haystack.crop(proposal.rect)?;
            let features = feature::search(&self.params, pixels, &region)?;
            if features.feature_poor {
                log::debug!("⚠️ {} is feature-poor, keeping template similarity", needle.name());
                let candidates = ranking::rank(proposals.clone(), similarity);
                return Ok(FindOutcome::new(candidates, similarity).with_stages(artifacts));
            }

            let rescored = match features.candidate {
                Some(c) => c.translated(proposal.rect.x, proposal.rect.y),
                None => Candidate::new(proposal.rect, 0.0, "feature"),
            };
            let stages = vec![
                StageResult::new(proposal.clone(), Vec::new()),
                StageResult::new(rescored, features.artifacts),
            ];
            if let Some((merged, stage_artifacts)) = composite::merge(stages, false) {
                artifacts.extend(stage_artifacts);
                verified.push(merged);
            }
        }

        let candidates = ranking::rank(verified, similarity);
        Ok(FindOutcome::new(candidates, similarity).with_stages(artifacts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::NullSink;
    use crate::matching::feature::tests::{dotted_needle, scene_with};
    use crate::matching::types::Rect;
    use image::{ImageBuffer, Rgb};

    #[test]
    fn test_feature_stage_decides() {
        let needle_img = dotted_needle();
        let haystack = Haystack::new(scene_with(&needle_img, 40, 20), "dots").unwrap();
        let needle = Target::image("dots", needle_img).unwrap();

        let mut matcher = TempFeatMatcher::new(&GlobalConfig::default()).unwrap();
        matcher.params_mut().set("find", "similarity", 0.3).unwrap();
        let outcome = matcher.find(&needle, &haystack, &mut NullSink).unwrap();

        let best = outcome.best().unwrap();
        assert_eq!(best.rect, Rect::new(40, 20, 64, 64));
        assert_eq!(best.stage, "feature");
        assert_eq!(best.sub_results.len(), 1);
        assert_eq!(best.sub_results[0].stage, "template");
        assert!(outcome.stages.iter().any(|s| s.stage == 1));
        assert!(outcome.stages.iter().any(|s| s.stage == 2));
    }

    #[test]
    fn test_feature_poor_needle_falls_back_to_template() {
        let gradient: image::RgbImage = ImageBuffer::from_fn(40, 40, |x, y| {
            let v = (x * 3 + y * 2) as u8;
            Rgb([v, v, v])
        });
        let haystack = Haystack::new(scene_with(&gradient, 50, 30), "gradient").unwrap();
        let needle = Target::image("gradient", gradient).unwrap();

        let matcher = TempFeatMatcher::new(&GlobalConfig::default()).unwrap();
        let outcome = matcher.find(&needle, &haystack, &mut NullSink).unwrap();
        let best = outcome.best().unwrap();
        assert_eq!(best.stage, "template");
        assert_eq!((best.rect.x, best.rect.y), (50, 30));
        assert!(outcome.is_match());
    }
}
