//! The contract every matcher backend implements

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::diagnostics::DiagnosticSink;
use crate::error::{FinderError, FinderResult};
use crate::params::{CategorySpec, ParamDecl, ParamRegistry, Parameter};
use crate::params::registry::no_backend_params;
use crate::target::Target;

use super::types::{FindOutcome, Haystack};

/// Matcher families, also the backend names of the `find` category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Pixel,
    Template,
    Feature,
    TempFeat,
    Contour,
    Text,
    Deep,
    Hybrid,
}

impl Family {
    pub const ALL: [Family; 8] = [
        Family::Pixel,
        Family::Template,
        Family::Feature,
        Family::TempFeat,
        Family::Contour,
        Family::Text,
        Family::Deep,
        Family::Hybrid,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Family::Pixel => "pixel",
            Family::Template => "template",
            Family::Feature => "feature",
            Family::TempFeat => "tempfeat",
            Family::Contour => "contour",
            Family::Text => "text",
            Family::Deep => "deep",
            Family::Hybrid => "hybrid",
        }
    }

    /// The family's own category, the default target of `configure_backend`.
    pub fn category(&self) -> &'static str {
        self.name()
    }

    fn find_choices(&self) -> &'static [&'static str] {
        match self {
            Family::Pixel => &["pixel"],
            Family::Template => &["template"],
            Family::Feature => &["feature"],
            Family::TempFeat => &["tempfeat"],
            Family::Contour => &["contour"],
            Family::Text => &["text"],
            Family::Deep => &["deep"],
            Family::Hybrid => &["hybrid"],
        }
    }

    pub fn names() -> Vec<String> {
        Self::ALL.iter().map(|f| f.name().to_string()).collect()
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Family {
    type Err = FinderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Family::ALL
            .iter()
            .copied()
            .find(|f| f.name() == s)
            .ok_or_else(|| FinderError::UnknownBackend {
                category: "find".to_string(),
                backend: s.to_string(),
                choices: Family::names(),
            })
    }
}

fn find_base() -> Vec<ParamDecl> {
    vec![(
        "similarity",
        Parameter::new(0.8).bounded(0.0, 1.0).delta(0.1).tolerance(0.01),
    )]
}

/// The `find` category common to every family.
pub(crate) fn find_spec(family: Family) -> CategorySpec {
    CategorySpec {
        name: "find",
        backends: family.find_choices(),
        base: find_base,
        backend_params: no_backend_params,
        read_only: &[],
    }
}

/// A needle finding strategy owning its fully resolved parameters.
pub trait Matcher {
    fn family(&self) -> Family;

    fn params(&self) -> &ParamRegistry;

    fn params_mut(&mut self) -> &mut ParamRegistry;

    /// Select `backend` for `category` (the family's own category by default)
    /// and re-derive any live parameters.
    fn configure_backend(&mut self, backend: &str, category: Option<&str>, reset: bool) -> FinderResult<()> {
        let category = category.unwrap_or(self.family().category());
        self.params_mut().select_backend(category, backend, reset)?;
        self.synchronize_backend(Some(category))
    }

    /// Re-derive parameters that mirror a live algorithm instance.
    fn synchronize_backend(&mut self, _category: Option<&str>) -> FinderResult<()> {
        Ok(())
    }

    /// Search `haystack` for `needle`, returning candidates ranked against
    /// the `find/similarity` threshold.
    fn find(&self, needle: &Target, haystack: &Haystack, sink: &mut dyn DiagnosticSink) -> FinderResult<FindOutcome>;

    fn similarity(&self) -> FinderResult<f64> {
        self.params().float("find", "similarity")
    }
}
