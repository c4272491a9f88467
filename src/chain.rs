//! Fallback chains of independently configured matching steps
//!
//! A `.steps` file lists one `<data> <config>` pair per line. Steps are tried
//! strictly in order and the first one whose best candidate meets its own
//! threshold wins.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::GlobalConfig;
use crate::diagnostics::{DiagnosticSink, MatchReport};
use crate::error::{FinderError, FinderResult};
use crate::matching::{Candidate, Family, FindOutcome, Finder, Haystack, StageArtifact};
use crate::resolve;
use crate::target::Target;

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// One step: the raw references as written plus the loaded target, which
/// carries the step's own settings.
#[derive(Debug, Clone)]
pub struct ChainStep {
    pub data_ref: String,
    pub config_ref: String,
    pub target: Target,
}

#[derive(Debug, Clone)]
pub struct Chain {
    name: String,
    steps: Vec<ChainStep>,
}

/// Where a traversal stands.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainState {
    Pending(usize),
    Succeeded { step: usize, candidates: Vec<Candidate> },
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepAttempt {
    pub step: usize,
    pub best_similarity: Option<f64>,
    pub threshold: f64,
}

#[derive(Debug, Clone)]
pub struct ChainOutcome {
    pub state: ChainState,
    /// Every step tried, in order
    pub attempts: Vec<StepAttempt>,
    /// Stage artifacts of the last step tried
    pub stages: Vec<StageArtifact>,
}

impl ChainOutcome {
    pub fn step(&self) -> Option<usize> {
        match &self.state {
            ChainState::Succeeded { step, .. } => Some(*step),
            _ => None,
        }
    }

    pub fn candidates(&self) -> &[Candidate] {
        match &self.state {
            ChainState::Succeeded { candidates, .. } => candidates,
            _ => &[],
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == ChainState::Exhausted
    }

    pub fn into_find_outcome(self, exhausted_threshold: f64) -> FindOutcome {
        let threshold = self.attempts.last().map(|a| a.threshold);
        match self.state {
            ChainState::Succeeded { step, candidates } => FindOutcome {
                candidates,
                stages: self.stages,
                threshold: threshold.unwrap_or(exhausted_threshold),
                chain_step: Some(step),
            },
            _ => FindOutcome {
                candidates: Vec::new(),
                stages: self.stages,
                threshold: exhausted_threshold,
                chain_step: None,
            },
        }
    }
}

/// Per-step win counts accumulated over many traversals.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StepUsage {
    wins: Vec<u64>,
    exhausted: u64,
}

impl StepUsage {
    pub fn record(&mut self, outcome: &ChainOutcome) {
        match outcome.step() {
            Some(step) => {
                if self.wins.len() <= step {
                    self.wins.resize(step + 1, 0);
                }
                self.wins[step] += 1;
            }
            None => self.exhausted += 1,
        }
    }

    pub fn wins(&self, step: usize) -> u64 {
        self.wins.get(step).copied().unwrap_or(0)
    }

    pub fn exhausted(&self) -> u64 {
        self.exhausted
    }

    pub fn total(&self) -> u64 {
        self.wins.iter().sum::<u64>() + self.exhausted
    }
}

/// Run steps `0..step_count` in order until one succeeds.
///
/// `run_step` returns the step's outcome together with the threshold that
/// step must meet.
pub fn traverse<F>(step_count: usize, mut run_step: F) -> FinderResult<ChainOutcome>
where
    F: FnMut(usize) -> FinderResult<(FindOutcome, f64)>,
{
    let mut state = if step_count == 0 {
        ChainState::Exhausted
    } else {
        ChainState::Pending(0)
    };
    let mut attempts = Vec::new();
    let mut stages = Vec::new();

    while let ChainState::Pending(index) = state {
        let (outcome, threshold) = run_step(index)?;
        let best = outcome.best().map(|c| c.similarity);
        let succeeded = best.is_some_and(|s| s >= threshold);
        log::debug!(
            "⛓️ Step {}: best {:.3} against {:.3}{}",
            index,
            best.unwrap_or(0.0),
            threshold,
            if succeeded { " ✅" } else { "" }
        );
        attempts.push(StepAttempt {
            step: index,
            best_similarity: best,
            threshold,
        });
        stages = outcome.stages;
        state = if succeeded {
            ChainState::Succeeded {
                step: index,
                candidates: outcome
                    .candidates
                    .into_iter()
                    .filter(|c| c.similarity >= threshold)
                    .collect(),
            }
        } else if index + 1 < step_count {
            ChainState::Pending(index + 1)
        } else {
            ChainState::Exhausted
        };
    }

    Ok(ChainOutcome {
        state,
        attempts,
        stages,
    })
}

/// Tags every report from inside a step with the step index.
struct StepSink<'a> {
    inner: &'a mut dyn DiagnosticSink,
    step: usize,
}

impl DiagnosticSink for StepSink<'_> {
    fn record(&mut self, report: &MatchReport<'_>) {
        let tagged = MatchReport {
            chain_step: Some(self.step),
            ..*report
        };
        self.inner.record(&tagged);
    }
}

impl Chain {
    pub fn new(name: impl Into<String>, steps: Vec<ChainStep>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[ChainStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Load a `.steps` file. References resolve relative to its directory and
    /// nested `.steps` files are expanded in place, each at most once.
    pub fn load(path: impl AsRef<Path>, config: &GlobalConfig) -> FinderResult<Self> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let mut steps = Vec::new();
        let mut visited = Vec::new();
        load_steps(path, config, &mut visited, &mut steps)?;
        log::debug!("⛓️ Loaded chain {} with {} step(s)", name, steps.len());
        Ok(Self::new(name, steps))
    }

    /// Parse step text whose references resolve relative to `base_dir`.
    pub fn parse(name: &str, text: &str, base_dir: &Path, config: &GlobalConfig) -> FinderResult<Self> {
        let mut steps = Vec::new();
        let mut visited = Vec::new();
        parse_steps(text, None, base_dir, config, &mut visited, &mut steps)?;
        Ok(Self::new(name, steps))
    }

    pub fn to_steps_text(&self) -> String {
        self.steps
            .iter()
            .map(|s| format!("{}\t{}\n", s.data_ref, s.config_ref))
            .collect()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> FinderResult<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_steps_text()).map_err(|e| FinderError::io(path, e))
    }

    /// Traverse the chain from step 0 against `haystack`.
    pub fn find(
        &self,
        haystack: &Haystack,
        config: &GlobalConfig,
        sink: &mut dyn DiagnosticSink,
    ) -> FinderResult<ChainOutcome> {
        log::debug!("⛓️ Searching chain {} ({} steps) in {}", self.name, self.steps.len(), haystack.name());
        traverse(self.steps.len(), |index| {
            let step = &self.steps[index];
            let finder = resolve::resolve(config, &step.target, None, None)?;
            let mut step_sink = StepSink {
                inner: &mut *sink,
                step: index,
            };
            let mut outcome = finder.find(&step.target, haystack, &mut step_sink)?;
            outcome.chain_step = Some(index);
            Ok((outcome, finder.similarity()?))
        })
    }
}

fn load_steps(
    path: &Path,
    config: &GlobalConfig,
    visited: &mut Vec<PathBuf>,
    steps: &mut Vec<ChainStep>,
) -> FinderResult<()> {
    let key = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    if visited.contains(&key) {
        log::warn!("⚠️ {} already included, skipping", path.display());
        return Ok(());
    }
    visited.push(key);

    let text = std::fs::read_to_string(path).map_err(|e| FinderError::io(path, e))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_steps(&text, Some(path), base_dir, config, visited, steps)
}

/// Split a step line into data and configuration references: at the last
/// tab, or failing that at the last run of whitespace.
fn split_step_line(line: &str) -> Option<(&str, &str)> {
    let (data, config) = match line.rsplit_once('\t') {
        Some(split) => split,
        None => {
            let at = line.rfind(char::is_whitespace)?;
            (&line[..at], &line[at..])
        }
    };
    let (data, config) = (data.trim(), config.trim());
    (!data.is_empty() && !config.is_empty()).then_some((data, config))
}

fn parse_steps(
    text: &str,
    source: Option<&Path>,
    base_dir: &Path,
    config: &GlobalConfig,
    visited: &mut Vec<PathBuf>,
    steps: &mut Vec<ChainStep>,
) -> FinderResult<()> {
    let malformed = |line: usize, reason: String| FinderError::MalformedChain {
        path: source.map(Path::to_path_buf),
        line,
        reason,
    };

    for (index, raw_line) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (data_ref, config_ref) = split_step_line(line)
            .ok_or_else(|| malformed(line_no, format!("expected '<data> <config>', got '{}'", line)))?;

        if data_ref.ends_with(".steps") {
            load_steps(&base_dir.join(data_ref), config, visited, steps)?;
            continue;
        }

        let mut config_path = base_dir.join(config_ref);
        if config_path.extension().is_none() {
            config_path.set_extension("match");
        }
        let finder = Finder::from_match_file(&config_path, config)?;
        let target = step_target(data_ref, base_dir, &finder, config)
            .map_err(|reason| malformed(line_no, reason))??
            .with_settings(finder);

        steps.push(ChainStep {
            data_ref: data_ref.to_string(),
            config_ref: config_ref.to_string(),
            target,
        });
    }
    Ok(())
}

/// Build the step's target. The outer error is a chain authoring problem,
/// the inner one a failure loading referenced data.
fn step_target(
    data_ref: &str,
    base_dir: &Path,
    finder: &Finder,
    config: &GlobalConfig,
) -> Result<FinderResult<Target>, String> {
    let family = finder.family();
    let extension = Path::new(data_ref)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if family == Family::Hybrid {
        return Err("a step cannot use hybrid settings".to_string());
    }
    if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        return Ok(Target::from_data_file(base_dir.join(data_ref), config));
    }
    if extension == "txt" {
        let path = base_dir.join(data_ref);
        return Ok(std::fs::read_to_string(&path)
            .map(|text| Target::text(text.trim_end_matches(['\r', '\n'])))
            .map_err(|e| FinderError::io(path, e)));
    }
    match family {
        Family::Text => Ok(Ok(Target::text(data_ref))),
        Family::Deep => Ok(Ok(Target::pattern(data_ref))),
        other => Err(format!("'{}' is not image data for a {} step", data_ref, other)),
    }
}
