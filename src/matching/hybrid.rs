//! Fallback matcher
//!
//! Chain targets are searched step by step, each step with its own settings.
//! Any other target is handed to a default matcher of the family selected in
//! the `hybrid` category.

use crate::config::GlobalConfig;
use crate::diagnostics::DiagnosticSink;
use crate::error::FinderResult;
use crate::params::registry::{no_backend_params, no_params};
use crate::params::{CategorySpec, ParamRegistry};
use crate::target::{Target, TargetData};

use super::matcher::{find_spec, Family, Matcher};
use super::types::{FindOutcome, Haystack};
use super::Finder;

fn hybrid_spec() -> CategorySpec {
    CategorySpec {
        name: "hybrid",
        backends: &["pixel", "template", "feature", "tempfeat", "contour", "text", "deep"],
        base: no_params,
        backend_params: no_backend_params,
        read_only: &[],
    }
}

#[derive(Debug, Clone)]
pub struct HybridMatcher {
    params: ParamRegistry,
    config: GlobalConfig,
    fallback: Box<Finder>,
}

impl HybridMatcher {
    pub fn new(config: &GlobalConfig) -> FinderResult<Self> {
        let params = ParamRegistry::new(vec![find_spec(Family::Hybrid), hybrid_spec()], config)?;
        let family: Family = params.backend("hybrid")?.parse()?;
        Ok(Self {
            params,
            config: config.clone(),
            fallback: Box::new(Finder::new(family, config)?),
        })
    }

    /// Matcher used for targets that are not chains.
    pub fn fallback(&self) -> &Finder {
        &self.fallback
    }
}

impl Matcher for HybridMatcher {
    fn family(&self) -> Family {
        Family::Hybrid
    }

    fn params(&self) -> &ParamRegistry {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamRegistry {
        &mut self.params
    }

    fn synchronize_backend(&mut self, category: Option<&str>) -> FinderResult<()> {
        if !matches!(category, None | Some("hybrid")) {
            return Ok(());
        }
        let family: Family = self.params.backend("hybrid")?.parse()?;
        if self.fallback.family() != family {
            log::debug!("🔧 Hybrid fallback matcher switched to {}", family);
            self.fallback = Box::new(Finder::new(family, &self.config)?);
        }
        Ok(())
    }

    fn find(&self, needle: &Target, haystack: &Haystack, sink: &mut dyn DiagnosticSink) -> FinderResult<FindOutcome> {
        match needle.data() {
            TargetData::Chain(chain) => {
                let outcome = chain.find(haystack, &self.config, sink)?;
                Ok(outcome.into_find_outcome(self.similarity()?))
            }
            _ => self.fallback.find(needle, haystack, sink),
        }
    }
}
