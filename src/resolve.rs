//! Effective matcher resolution and region-scoped searches
//!
//! Precedence, highest first: call, region, target instance (when
//! `use_own_settings`), target file, process-wide defaults. The first scope
//! present wins wholesale; nothing is merged per parameter.

use crate::config::GlobalConfig;
use crate::diagnostics::DiagnosticSink;
use crate::error::FinderResult;
use crate::matching::{Candidate, Family, FindOutcome, Finder, Haystack, Rect};
use crate::target::{Target, TargetData};

/// Matcher to use for one call. Always a clone owned by the caller.
pub fn resolve(
    config: &GlobalConfig,
    target: &Target,
    region: Option<&Finder>,
    call: Option<&Finder>,
) -> FinderResult<Finder> {
    if let Some(finder) = call {
        log::trace!("🔧 {}: using call settings", target.name());
        return Ok(finder.clone());
    }
    if let Some(finder) = region {
        log::trace!("🔧 {}: using region settings", target.name());
        return Ok(finder.clone());
    }
    if target.use_own_settings() {
        if let Some(finder) = target.settings() {
            log::trace!("🔧 {}: using own settings", target.name());
            return Ok(finder.clone());
        }
    }
    if let Some(finder) = target.file_settings() {
        log::trace!("🔧 {}: using file settings", target.name());
        return Ok(finder.clone());
    }
    Finder::new(default_family(config, target)?, config)
}

/// Family used when neither the target nor the caller configured one.
///
/// Chains always go through the hybrid matcher. For single targets the
/// configured find backend (or, for `hybrid`, the hybrid default) is used if
/// it can match the target's kind, else the kind's natural family.
pub fn default_family(config: &GlobalConfig, target: &Target) -> FinderResult<Family> {
    if matches!(target.data(), TargetData::Chain(_)) {
        return Ok(Family::Hybrid);
    }
    let mut preferred: Family = config.find_backend.parse()?;
    if preferred == Family::Hybrid {
        preferred = config.hybrid_backend.parse()?;
    }
    if preferred != Family::Hybrid && Finder::accepts(preferred, target) {
        return Ok(preferred);
    }
    Ok(match target.data() {
        TargetData::Text { .. } => Family::Text,
        TargetData::Pattern { .. } => Family::Deep,
        _ => Family::Template,
    })
}

/// A searchable area of the haystack with an optional matcher override.
#[derive(Debug, Clone)]
pub struct Region {
    config: GlobalConfig,
    bounds: Option<Rect>,
    settings: Option<Finder>,
}

impl Region {
    pub fn new(config: GlobalConfig) -> Self {
        Self {
            config,
            bounds: None,
            settings: None,
        }
    }

    pub fn with_bounds(mut self, bounds: Rect) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn with_settings(mut self, finder: Finder) -> Self {
        self.settings = Some(finder);
        self
    }

    pub fn bounds(&self) -> Option<Rect> {
        self.bounds
    }

    pub fn settings(&self) -> Option<&Finder> {
        self.settings.as_ref()
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    /// Matcher a search for `target` would use with the given call override.
    pub fn resolve(&self, target: &Target, call: Option<&Finder>) -> FinderResult<Finder> {
        resolve(&self.config, target, self.settings.as_ref(), call)
    }

    /// Run one search, translating results back into haystack coordinates.
    pub fn search(
        &self,
        target: &Target,
        haystack: &Haystack,
        call: Option<&Finder>,
        sink: &mut dyn DiagnosticSink,
    ) -> FinderResult<FindOutcome> {
        let finder = self.resolve(target, call)?;
        let mut outcome = match self.bounds {
            Some(bounds) => {
                let cropped = haystack.crop(bounds)?;
                let mut outcome = finder.find(target, &cropped, sink)?;
                outcome.candidates = outcome
                    .candidates
                    .into_iter()
                    .map(|c| c.translated(bounds.x, bounds.y))
                    .collect();
                outcome
            }
            None => finder.find(target, haystack, sink)?,
        };
        let offset = target.center_offset();
        for candidate in outcome.candidates.iter_mut() {
            candidate.offset = offset;
        }
        Ok(outcome)
    }

    /// Best acceptable match, if any.
    pub fn find(
        &self,
        target: &Target,
        haystack: &Haystack,
        call: Option<&Finder>,
        sink: &mut dyn DiagnosticSink,
    ) -> FinderResult<Option<Candidate>> {
        let outcome = self.search(target, haystack, call, sink)?;
        let best = outcome.matches().next().cloned();
        match &best {
            Some(candidate) => log::info!(
                "✅ Found {} at ({},{}) similarity {:.3}",
                target.name(),
                candidate.rect.x,
                candidate.rect.y,
                candidate.similarity
            ),
            None => log::info!(
                "❌ {} not found (best {:.3}, required {:.3})",
                target.name(),
                outcome.best().map(|c| c.similarity).unwrap_or(0.0),
                outcome.threshold
            ),
        }
        Ok(best)
    }

    /// Every acceptable match, best first.
    pub fn find_all(
        &self,
        target: &Target,
        haystack: &Haystack,
        call: Option<&Finder>,
        sink: &mut dyn DiagnosticSink,
    ) -> FinderResult<Vec<Candidate>> {
        let outcome = self.search(target, haystack, call, sink)?;
        Ok(outcome.matches().cloned().collect())
    }

    pub fn exists(
        &self,
        target: &Target,
        haystack: &Haystack,
        call: Option<&Finder>,
        sink: &mut dyn DiagnosticSink,
    ) -> FinderResult<bool> {
        Ok(self.find(target, haystack, call, sink)?.is_some())
    }

    /// Similarity of the best location regardless of any threshold.
    pub fn sample(&self, target: &Target, haystack: &Haystack, sink: &mut dyn DiagnosticSink) -> FinderResult<f64> {
        let mut finder = self.resolve(target, None)?;
        finder.set_similarity(0.0)?;
        let outcome = self.search(target, haystack, Some(&finder), sink)?;
        Ok(outcome.best().map(|c| c.similarity).unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests;
