//! Merging rules for multi-stage matchers

use super::types::{Candidate, StageArtifact};

/// Result of one stage for one location.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub candidate: Candidate,
    pub artifacts: Vec<StageArtifact>,
}

impl StageResult {
    pub fn new(candidate: Candidate, artifacts: Vec<StageArtifact>) -> Self {
        Self { candidate, artifacts }
    }
}

/// Combine ordered stage results into one candidate.
///
/// The last stage's similarity is authoritative; earlier stage candidates
/// become sub-results and every artifact is tagged with its 1-based stage.
/// The location is the first stage's unless the final stage refines it.
pub fn merge(stages: Vec<StageResult>, refine_location: bool) -> Option<(Candidate, Vec<StageArtifact>)> {
    let mut artifacts = Vec::new();
    let mut candidates = Vec::with_capacity(stages.len());
    for (index, stage) in stages.into_iter().enumerate() {
        for mut artifact in stage.artifacts {
            artifact.stage = index + 1;
            artifacts.push(artifact);
        }
        candidates.push(stage.candidate);
    }

    let mut last = candidates.pop()?;
    if let Some(first) = candidates.first() {
        if !refine_location {
            last.rect = first.rect;
        }
    }
    last.sub_results = candidates;
    Some((last, artifacts))
}
