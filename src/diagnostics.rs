//! Where finished searches are reported
//!
//! Every `Finder::find` hands a [`MatchReport`] to a [`DiagnosticSink`].
//! Sinks never influence results and never fail a search.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::GlobalConfig;
use crate::matching::{Candidate, Family, FindOutcome, Haystack};
use crate::target::Target;

/// Everything known about one finished search.
#[derive(Debug, Clone, Copy)]
pub struct MatchReport<'a> {
    pub needle: &'a Target,
    pub haystack: &'a Haystack,
    pub family: Family,
    /// Set when the search ran as a step of a chain
    pub chain_step: Option<usize>,
    pub outcome: &'a FindOutcome,
}

pub trait DiagnosticSink {
    fn record(&mut self, report: &MatchReport<'_>);
}

/// Discards every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn record(&mut self, _report: &MatchReport<'_>) {}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedStage {
    pub name: String,
    pub stage: usize,
    pub similarity: f64,
}

/// Owned summary of a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedMatch {
    pub needle: String,
    pub haystack: String,
    pub family: String,
    pub chain_step: Option<usize>,
    pub threshold: f64,
    pub candidates: Vec<Candidate>,
    pub stages: Vec<RecordedStage>,
}

impl From<&MatchReport<'_>> for RecordedMatch {
    fn from(report: &MatchReport<'_>) -> Self {
        Self {
            needle: report.needle.name().to_string(),
            haystack: report.haystack.name().to_string(),
            family: report.family.name().to_string(),
            chain_step: report.chain_step,
            threshold: report.outcome.threshold,
            candidates: report.outcome.candidates.clone(),
            stages: report
                .outcome
                .stages
                .iter()
                .map(|s| RecordedStage {
                    name: s.name.clone(),
                    stage: s.stage,
                    similarity: s.similarity,
                })
                .collect(),
        }
    }
}

/// Keeps a summary of every report in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Vec<RecordedMatch>,
}

impl MemorySink {
    pub fn records(&self) -> &[RecordedMatch] {
        &self.records
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl DiagnosticSink for MemorySink {
    fn record(&mut self, report: &MatchReport<'_>) {
        self.records.push(RecordedMatch::from(report));
    }
}

/// Dumps needle, haystack and stage hotmaps of each search as numbered PNG
/// files.
///
/// Misses are dumped from `Warn` upwards, matches only from `Info`.
#[derive(Debug, Clone)]
pub struct ImageLogger {
    destination: PathBuf,
    step_width: usize,
    level: log::LevelFilter,
    step: usize,
}

impl ImageLogger {
    pub fn new(config: &GlobalConfig) -> Self {
        Self {
            destination: config.image_logging_destination.clone(),
            step_width: config.image_logging_step_width,
            level: config.image_logging_level,
            step: 1,
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Number the next dump will carry.
    pub fn step(&self) -> usize {
        self.step
    }

    fn prefix(&self) -> String {
        format!("imglog{:0width$}", self.step, width = self.step_width)
    }

    fn dump(&self, report: &MatchReport<'_>) -> Result<(), String> {
        std::fs::create_dir_all(&self.destination)
            .map_err(|e| format!("cannot create {}: {}", self.destination.display(), e))?;
        let prefix = self.prefix();
        let save = |file: String, image: &image::RgbImage| {
            let path = self.destination.join(&file);
            image.save(&path).map_err(|e| format!("cannot write {}: {}", path.display(), e))
        };

        if let Some(pixels) = report.needle.pixels() {
            save(format!("{}-1needle-{}.png", prefix, file_safe(report.needle.name())), pixels)?;
        }
        save(
            format!("{}-2haystack-{}.png", prefix, file_safe(report.haystack.name())),
            report.haystack.image(),
        )?;
        for (index, stage) in report.outcome.stages.iter().enumerate() {
            if let Some(hotmap) = &stage.hotmap {
                save(
                    format!(
                        "{}-3hotmap-{}{}-{:.3}.png",
                        prefix,
                        index + 1,
                        file_safe(&stage.name),
                        stage.similarity
                    ),
                    hotmap,
                )?;
            }
        }

        let summary = serde_json::to_string_pretty(&RecordedMatch::from(report))
            .map_err(|e| format!("cannot encode summary: {}", e))?;
        let path = self.destination.join(format!("{}-4result.json", prefix));
        std::fs::write(&path, summary).map_err(|e| format!("cannot write {}: {}", path.display(), e))
    }
}

/// Keep dumped names inside the destination directory.
fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

impl DiagnosticSink for ImageLogger {
    fn record(&mut self, report: &MatchReport<'_>) {
        let level = if report.outcome.is_match() {
            log::Level::Info
        } else {
            log::Level::Warn
        };
        if level > self.level {
            return;
        }
        match self.dump(report) {
            Ok(()) => log::debug!("🖼️ Dumped {} for {}", self.prefix(), report.needle.name()),
            Err(reason) => log::warn!("⚠️ Image logging failed: {}", reason),
        }
        self.step += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::{Rect, StageArtifact};
    use image::{Rgb, RgbImage};

    fn report_parts() -> (Target, Haystack, FindOutcome) {
        let needle = Target::image("dot", RgbImage::from_pixel(2, 2, Rgb([9, 9, 9]))).unwrap();
        let haystack = Haystack::new(RgbImage::new(8, 8), "screen").unwrap();
        let outcome = FindOutcome::new(vec![Candidate::new(Rect::new(1, 1, 2, 2), 0.9, "template")], 0.8)
            .with_stages(vec![StageArtifact::new("template", 0.9).with_hotmap(RgbImage::new(7, 7))]);
        (needle, haystack, outcome)
    }

    #[test]
    fn test_memory_sink_records_summary() {
        let (needle, haystack, outcome) = report_parts();
        let mut sink = MemorySink::default();
        sink.record(&MatchReport {
            needle: &needle,
            haystack: &haystack,
            family: Family::Template,
            chain_step: Some(2),
            outcome: &outcome,
        });
        let record = &sink.records()[0];
        assert_eq!(record.needle, "dot");
        assert_eq!(record.family, "template");
        assert_eq!(record.chain_step, Some(2));
        assert_eq!(record.stages[0].name, "template");
    }

    #[test]
    fn test_image_logger_writes_numbered_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = GlobalConfig {
            image_logging_level: log::LevelFilter::Info,
            image_logging_destination: dir.path().to_path_buf(),
            ..GlobalConfig::default()
        };
        let (needle, haystack, outcome) = report_parts();
        let mut logger = ImageLogger::new(&config);
        logger.record(&MatchReport {
            needle: &needle,
            haystack: &haystack,
            family: Family::Template,
            chain_step: None,
            outcome: &outcome,
        });

        assert_eq!(logger.step(), 2);
        assert!(dir.path().join("imglog001-1needle-dot.png").is_file());
        assert!(dir.path().join("imglog001-2haystack-screen.png").is_file());
        assert!(dir.path().join("imglog001-3hotmap-1template-0.900.png").is_file());
        assert!(dir.path().join("imglog001-4result.json").is_file());
    }

    #[test]
    fn test_image_logger_keeps_path_like_names_in_destination() {
        let dir = tempfile::tempdir().unwrap();
        let config = GlobalConfig {
            image_logging_level: log::LevelFilter::Info,
            image_logging_destination: dir.path().join("dumps"),
            ..GlobalConfig::default()
        };
        let (_, haystack, outcome) = report_parts();
        let needle = Target::image("../icons/ok", RgbImage::from_pixel(2, 2, Rgb([9, 9, 9]))).unwrap();
        let mut logger = ImageLogger::new(&config);
        logger.record(&MatchReport {
            needle: &needle,
            haystack: &haystack,
            family: Family::Template,
            chain_step: None,
            outcome: &outcome,
        });

        assert!(dir.path().join("dumps").join("imglog001-1needle-.._icons_ok.png").is_file());
        assert!(!dir.path().join("icons").exists());
        assert_eq!(file_safe("a\\b:c"), "a_b_c");
    }

    #[test]
    fn test_image_logger_skips_matches_below_info() {
        let dir = tempfile::tempdir().unwrap();
        let config = GlobalConfig {
            image_logging_level: log::LevelFilter::Warn,
            image_logging_destination: dir.path().join("out"),
            ..GlobalConfig::default()
        };
        let (needle, haystack, outcome) = report_parts();
        let mut logger = ImageLogger::new(&config);
        logger.record(&MatchReport {
            needle: &needle,
            haystack: &haystack,
            family: Family::Template,
            chain_step: None,
            outcome: &outcome,
        });
        assert_eq!(logger.step(), 1);
        assert!(!dir.path().join("out").exists());
    }
}
