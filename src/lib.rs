//! Locate needles (image patches, text, detector patterns) in haystack images
//! with per-target matcher settings and fallback chains of settings.

pub mod args;
pub mod chain;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod matching;
pub mod params;
pub mod resolve;
pub mod target;

pub use chain::{Chain, ChainOutcome, ChainState, ChainStep, StepUsage};
pub use config::GlobalConfig;
pub use diagnostics::{DiagnosticSink, ImageLogger, MatchReport, MemorySink, NullSink};
pub use error::{FinderError, FinderResult};
pub use matching::{Candidate, Family, FindOutcome, Finder, Haystack, Rect};
pub use params::{ParamRegistry, ParamValue, Parameter};
pub use resolve::{resolve, Region};
pub use target::{Target, TargetData};
