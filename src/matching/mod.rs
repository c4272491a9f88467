//! Matcher backends behind one contract
//!
//! [`Finder`] dispatches to one struct per family, the same way every family
//! exposes its settings through a [`ParamRegistry`].

pub mod composite;
pub mod contour;
pub mod deep;
pub mod feature;
pub mod hybrid;
pub mod matcher;
pub mod pixel;
pub mod ranking;
pub mod tempfeat;
pub mod template;
pub mod text;
pub mod types;

use std::path::Path;

use crate::config::GlobalConfig;
use crate::diagnostics::{DiagnosticSink, MatchReport};
use crate::error::{FinderError, FinderResult};
use crate::params::{codec, ParamRegistry};
use crate::target::{Target, TargetData};

pub use contour::ContourMatcher;
pub use deep::{DeepMatcher, ObjectDetector};
pub use feature::FeatureMatcher;
pub use hybrid::HybridMatcher;
pub use matcher::{Family, Matcher};
pub use pixel::PixelMatcher;
pub use tempfeat::TempFeatMatcher;
pub use template::TemplateMatcher;
pub use text::{TextMatcher, TextRecognizer};
pub use types::{Candidate, FindOutcome, Haystack, Rect, StageArtifact};

/// A configured matcher of any family.
#[derive(Debug, Clone)]
pub enum Finder {
    Pixel(PixelMatcher),
    Template(TemplateMatcher),
    Feature(FeatureMatcher),
    TempFeat(TempFeatMatcher),
    Contour(ContourMatcher),
    Text(TextMatcher),
    Deep(DeepMatcher),
    Hybrid(HybridMatcher),
}

impl Finder {
    /// Matcher of `family` with process-wide default settings.
    pub fn new(family: Family, config: &GlobalConfig) -> FinderResult<Self> {
        let mut finder = match family {
            Family::Pixel => Finder::Pixel(PixelMatcher::new(config)?),
            Family::Template => Finder::Template(TemplateMatcher::new(config)?),
            Family::Feature => Finder::Feature(FeatureMatcher::new(config)?),
            Family::TempFeat => Finder::TempFeat(TempFeatMatcher::new(config)?),
            Family::Contour => Finder::Contour(ContourMatcher::new(config)?),
            Family::Text => Finder::Text(TextMatcher::new(config)?),
            Family::Deep => Finder::Deep(DeepMatcher::new(config)?),
            Family::Hybrid => Finder::Hybrid(HybridMatcher::new(config)?),
        };
        finder.synchronize()?;
        Ok(finder)
    }

    pub fn from_name(name: &str, config: &GlobalConfig) -> FinderResult<Self> {
        Self::new(name.parse()?, config)
    }

    /// Rebuild a matcher from `.match` text; the family comes from `[find] backend`.
    pub fn from_match_text(text: &str, config: &GlobalConfig) -> FinderResult<Self> {
        let sections = codec::parse_sections(text)?;
        let entry = codec::find_backend(&sections)
            .ok_or_else(|| FinderError::malformed(1, "missing backend in [find] section"))?;
        let family: Family = entry
            .raw
            .parse()
            .map_err(|e: FinderError| FinderError::malformed(entry.line, e.to_string()))?;

        let mut finder = Finder::new(family, config)?;
        codec::apply_sections(finder.params_mut(), &sections)?;
        finder.synchronize()?;
        Ok(finder)
    }

    pub fn from_match_file(path: impl AsRef<Path>, config: &GlobalConfig) -> FinderResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| FinderError::io(path, e))?;
        log::debug!("📄 Loading match settings from {}", path.display());
        Self::from_match_text(&text, config)
    }

    pub fn to_match_text(&self) -> String {
        self.params().serialize()
    }

    pub fn save_match_file(&self, path: impl AsRef<Path>) -> FinderResult<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_match_text()).map_err(|e| FinderError::io(path, e))?;
        log::debug!("💾 Saved {} settings to {}", self.family(), path.display());
        Ok(())
    }

    /// Whether matchers of `family` can search for `target` at all.
    pub fn accepts(family: Family, target: &Target) -> bool {
        match (family, target.data()) {
            (Family::Hybrid, _) => true,
            (Family::Text, TargetData::Text { .. }) => true,
            (Family::Deep, TargetData::Pattern { .. }) => true,
            (
                Family::Pixel | Family::Template | Family::Feature | Family::TempFeat | Family::Contour,
                TargetData::Image { .. },
            ) => true,
            _ => false,
        }
    }

    fn matcher(&self) -> &dyn Matcher {
        match self {
            Finder::Pixel(m) => m,
            Finder::Template(m) => m,
            Finder::Feature(m) => m,
            Finder::TempFeat(m) => m,
            Finder::Contour(m) => m,
            Finder::Text(m) => m,
            Finder::Deep(m) => m,
            Finder::Hybrid(m) => m,
        }
    }

    fn matcher_mut(&mut self) -> &mut dyn Matcher {
        match self {
            Finder::Pixel(m) => m,
            Finder::Template(m) => m,
            Finder::Feature(m) => m,
            Finder::TempFeat(m) => m,
            Finder::Contour(m) => m,
            Finder::Text(m) => m,
            Finder::Deep(m) => m,
            Finder::Hybrid(m) => m,
        }
    }

    pub fn family(&self) -> Family {
        self.matcher().family()
    }

    pub fn params(&self) -> &ParamRegistry {
        self.matcher().params()
    }

    pub fn params_mut(&mut self) -> &mut ParamRegistry {
        self.matcher_mut().params_mut()
    }

    pub fn similarity(&self) -> FinderResult<f64> {
        self.matcher().similarity()
    }

    pub fn set_similarity(&mut self, similarity: f64) -> FinderResult<()> {
        self.params_mut().set("find", "similarity", similarity)
    }

    pub fn configure_backend(&mut self, backend: &str, category: Option<&str>, reset: bool) -> FinderResult<()> {
        self.matcher_mut().configure_backend(backend, category, reset)
    }

    pub fn synchronize_backend(&mut self, category: Option<&str>) -> FinderResult<()> {
        self.matcher_mut().synchronize_backend(category)
    }

    /// Synchronize every category.
    pub fn synchronize(&mut self) -> FinderResult<()> {
        let categories: Vec<String> = self.params().categories().map(|(name, _)| name.to_string()).collect();
        for category in categories {
            self.synchronize_backend(Some(&category))?;
        }
        Ok(())
    }

    /// Search `haystack` for `needle` and report the outcome to `sink`.
    pub fn find(&self, needle: &Target, haystack: &Haystack, sink: &mut dyn DiagnosticSink) -> FinderResult<FindOutcome> {
        let family = self.family();
        if !Self::accepts(family, needle) {
            return Err(FinderError::InvalidNeedle {
                needle: needle.name().to_string(),
                reason: format!("{} matcher cannot search for {} targets", family, needle.kind()),
            });
        }
        log::debug!("🔍 {} matcher searching for {} in {}", family, needle.name(), haystack.name());
        let outcome = self.matcher().find(needle, haystack, sink)?;
        log::debug!(
            "📊 {} candidate(s), best {:.3} (required {:.3})",
            outcome.candidates.len(),
            outcome.best().map(|c| c.similarity).unwrap_or(0.0),
            outcome.threshold
        );
        sink.record(&MatchReport {
            needle,
            haystack,
            family,
            chain_step: outcome.chain_step,
            outcome: &outcome,
        });
        Ok(outcome)
    }
}

impl PartialEq for Finder {
    fn eq(&self, other: &Self) -> bool {
        self.family() == other.family() && self.params() == other.params()
    }
}

/// Image-kind needle pixels, or `InvalidNeedle`.
pub(crate) fn needle_pixels(needle: &Target) -> FinderResult<&image::RgbImage> {
    needle.pixels().ok_or_else(|| FinderError::InvalidNeedle {
        needle: needle.name().to_string(),
        reason: format!("expected an image target, got {}", needle.kind()),
    })
}

/// Reject needles that cannot fit inside the haystack.
pub(crate) fn check_needle_fits(needle: &Target, width: u32, height: u32, haystack: &Haystack) -> FinderResult<()> {
    if width > haystack.width() || height > haystack.height() {
        return Err(FinderError::InvalidNeedle {
            needle: needle.name().to_string(),
            reason: format!(
                "{}x{} needle is larger than {}x{} haystack {}",
                width,
                height,
                haystack.width(),
                haystack.height(),
                haystack.name()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests;
