//! Learned object detection through a pluggable engine

use std::fmt;
use std::sync::Arc;

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;

use crate::config::GlobalConfig;
use crate::diagnostics::DiagnosticSink;
use crate::error::{FinderError, FinderResult};
use crate::params::registry::no_params;
use crate::params::{Category, CategorySpec, ParamDecl, ParamRegistry, ParamValue, Parameter};
use crate::target::{Target, TargetData};

use super::matcher::{find_spec, Family, Matcher};
use super::ranking;
use super::types::{Candidate, FindOutcome, Haystack, Rect, StageArtifact};

/// Model runtime producing scored boxes for a pattern identifier.
pub trait ObjectDetector: Send + Sync {
    fn detect(&self, haystack: &RgbImage, pattern: &str, settings: &Category) -> FinderResult<Vec<(Rect, f64)>>;

    /// Values the loaded model actually runs with, e.g. the resolved device.
    fn runtime_params(&self, _settings: &Category) -> Vec<(String, ParamValue)> {
        Vec::new()
    }
}

fn deep_params(_backend: &str) -> Vec<ParamDecl> {
    vec![
        ("device", Parameter::new("auto").enumerated()),
        ("classes", Parameter::new(91).at_least(1.0)),
        ("arch", Parameter::new("fasterrcnn_resnet50_fpn").enumerated()),
        ("model", Parameter::new("")),
    ]
}

fn deep_spec() -> CategorySpec {
    CategorySpec {
        name: "deep",
        backends: &["external"],
        base: no_params,
        backend_params: deep_params,
        read_only: &["device", "classes"],
    }
}

#[derive(Clone)]
pub struct DeepMatcher {
    params: ParamRegistry,
    detector: Option<Arc<dyn ObjectDetector>>,
}

impl fmt::Debug for DeepMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeepMatcher")
            .field("params", &self.params)
            .field("detector", &self.detector.is_some())
            .finish()
    }
}

impl DeepMatcher {
    pub fn new(config: &GlobalConfig) -> FinderResult<Self> {
        let params = ParamRegistry::new(vec![find_spec(Family::Deep), deep_spec()], config)?;
        Ok(Self {
            params,
            detector: config.object_detector.clone(),
        })
    }
}

impl Matcher for DeepMatcher {
    fn family(&self) -> Family {
        Family::Deep
    }

    fn params(&self) -> &ParamRegistry {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamRegistry {
        &mut self.params
    }

    fn synchronize_backend(&mut self, category: Option<&str>) -> FinderResult<()> {
        if !matches!(category, None | Some("deep")) {
            return Ok(());
        }
        let Some(detector) = &self.detector else {
            return Ok(());
        };
        let runtime = detector.runtime_params(self.params.category("deep")?);
        for (name, value) in runtime {
            log::debug!("🔧 deep/{} synchronized to {}", name, value);
            self.params.set("deep", &name, value)?;
        }
        Ok(())
    }

    fn find(&self, needle: &Target, haystack: &Haystack, _sink: &mut dyn DiagnosticSink) -> FinderResult<FindOutcome> {
        let TargetData::Pattern { id } = needle.data() else {
            return Err(FinderError::InvalidNeedle {
                needle: needle.name().to_string(),
                reason: format!("expected a pattern target, got {}", needle.kind()),
            });
        };
        let detector = self.detector.as_ref().ok_or_else(|| FinderError::BackendUnavailable {
            backend: "deep/external".to_string(),
            reason: "no object detector registered".to_string(),
        })?;
        let similarity = self.similarity()?;

        let detections = detector.detect(haystack.image(), id, self.params.category("deep")?)?;
        log::debug!("🔍 Detector returned {} box(es) for '{}'", detections.len(), id);

        let mut boxes = haystack.image().clone();
        let mut candidates = Vec::with_capacity(detections.len());
        for (rect, score) in detections {
            if rect.width == 0 || rect.height == 0 || !rect.fits_within(haystack.width(), haystack.height()) {
                log::warn!("⚠️ Dropping detection {:?} outside of {}", rect, haystack.name());
                continue;
            }
            draw_hollow_rect_mut(
                &mut boxes,
                imageproc::rect::Rect::at(rect.x as i32, rect.y as i32).of_size(rect.width, rect.height),
                Rgb([255, 0, 0]),
            );
            candidates.push(Candidate::new(rect, score, "deep"));
        }

        let candidates = ranking::rank(candidates, similarity);
        let best = candidates.first().map(|c| c.similarity).unwrap_or(0.0);
        let artifact = StageArtifact::new("detect", best)
            .with_hotmap(boxes)
            .with_points(candidates.iter().map(|c| c.rect.center()).collect());
        Ok(FindOutcome::new(candidates, similarity).with_stages(vec![artifact]))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::diagnostics::NullSink;

    /// Detector scoring one fixed box per pattern, chosen by the `arch` setting.
    pub(crate) struct ScriptedDetector;

    impl ObjectDetector for ScriptedDetector {
        fn detect(&self, _haystack: &RgbImage, pattern: &str, settings: &Category) -> FinderResult<Vec<(Rect, f64)>> {
            let score = match (pattern, settings.text("arch")) {
                (_, Some("weak")) => 0.5,
                ("circle", _) => 0.95,
                _ => 0.1,
            };
            Ok(vec![(Rect::new(4, 4, 8, 8), score), (Rect::new(0, 0, 2, 2), score / 2.0)])
        }

        fn runtime_params(&self, _settings: &Category) -> Vec<(String, ParamValue)> {
            vec![("device".to_string(), ParamValue::from("cpu"))]
        }
    }

    #[test]
    fn test_missing_detector_is_unavailable() {
        let matcher = DeepMatcher::new(&GlobalConfig::default()).unwrap();
        let haystack = Haystack::new(RgbImage::new(16, 16), "screen").unwrap();
        let err = matcher.find(&Target::pattern("circle"), &haystack, &mut NullSink).unwrap_err();
        assert!(matches!(err, FinderError::BackendUnavailable { .. }));
    }

    #[test]
    fn test_synchronize_reads_runtime_device() {
        let config = GlobalConfig::default().with_object_detector(Arc::new(ScriptedDetector));
        let mut matcher = DeepMatcher::new(&config).unwrap();
        assert_eq!(matcher.params().text("deep", "device").unwrap(), "auto");
        matcher.synchronize_backend(None).unwrap();
        assert_eq!(matcher.params().text("deep", "device").unwrap(), "cpu");
    }

    #[test]
    fn test_detections_are_ranked() {
        let config = GlobalConfig::default().with_object_detector(Arc::new(ScriptedDetector));
        let matcher = DeepMatcher::new(&config).unwrap();
        let haystack = Haystack::new(RgbImage::new(16, 16), "screen").unwrap();
        let outcome = matcher.find(&Target::pattern("circle"), &haystack, &mut NullSink).unwrap();
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.candidates[0].similarity, 0.95);
    }
}
