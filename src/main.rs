use std::path::{Path, PathBuf};
use std::process::ExitCode;

use serde::Serialize;

use match_chain::args::{Args, Mode};
use match_chain::chain::{ChainState, StepAttempt};
use match_chain::{
    Candidate, Chain, DiagnosticSink, Finder, FinderError, FinderResult, GlobalConfig, Haystack, ImageLogger, NullSink,
    Region, Target, TargetData,
};

#[derive(Serialize)]
struct FindReport<'a> {
    needle: &'a str,
    haystack: &'a str,
    threshold: f64,
    best_similarity: Option<f64>,
    matches: Vec<Candidate>,
}

#[derive(Serialize)]
struct ChainReport<'a> {
    chain: &'a str,
    haystack: &'a str,
    step: Option<usize>,
    step_data: Option<&'a str>,
    matches: &'a [Candidate],
    attempts: &'a [StepAttempt],
}

fn main() -> ExitCode {
    let Some(args) = Args::parse() else {
        return ExitCode::SUCCESS;
    };

    let default_level = if args.debug_mode {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(default_level)
        .parse_default_env()
        .init();

    let base = args
        .preset
        .as_deref()
        .and_then(match_chain::config::preset)
        .unwrap_or_default();
    let mut config = base.with_env_overrides();
    if let Some(dir) = &args.imglog {
        config.image_logging_destination = dir.clone();
        config.image_logging_level = log::LevelFilter::Info;
    }
    let mut sink: Box<dyn DiagnosticSink> = if config.image_logging_enabled(log::Level::Warn) {
        log::debug!("🖼️ Image logging into {}", config.image_logging_destination.display());
        Box::new(ImageLogger::new(&config))
    } else {
        Box::new(NullSink)
    };

    match run(&args, &config, sink.as_mut()) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("❌ {}", e);
            ExitCode::from(e.exit_status())
        }
    }
}

/// Returns whether anything was found.
fn run(args: &Args, config: &GlobalConfig, sink: &mut dyn DiagnosticSink) -> FinderResult<bool> {
    match &args.mode {
        Mode::Find {
            needle,
            haystack,
            match_file,
            similarity,
            backend,
            all,
        } => run_find(
            FindRequest {
                needle,
                haystack,
                match_file: match_file.as_deref(),
                similarity: *similarity,
                backend: backend.as_deref(),
                all: *all,
            },
            args.json,
            config,
            sink,
        ),
        Mode::Chain { steps, haystack } => run_chain(steps, haystack, args.json, config, sink),
        Mode::Defaults { family } => {
            print!("{}", Finder::from_name(family, config)?.to_match_text());
            Ok(true)
        }
    }
}

struct FindRequest<'a> {
    needle: &'a PathBuf,
    haystack: &'a PathBuf,
    match_file: Option<&'a Path>,
    similarity: Option<f64>,
    backend: Option<&'a str>,
    all: bool,
}

fn run_find(
    request: FindRequest<'_>,
    json: bool,
    config: &GlobalConfig,
    sink: &mut dyn DiagnosticSink,
) -> FinderResult<bool> {
    let haystack = Haystack::open(request.haystack)?;
    let mut target = Target::from_data_file(request.needle, config)?;
    check_similarity_override(&target, request.similarity)?;
    let mut call = match (request.match_file, request.backend) {
        (Some(path), _) => Some(Finder::from_match_file(path, config)?),
        (None, Some(name)) => Some(Finder::from_name(name, config)?),
        (None, None) => None,
    };
    if let Some(similarity) = request.similarity {
        match call.as_mut() {
            Some(finder) => finder.set_similarity(similarity)?,
            None => target = target.with_similarity(similarity, config)?,
        }
    }

    let region = Region::new(config.clone());
    let outcome = region.search(&target, &haystack, call.as_ref(), sink)?;
    let mut matches: Vec<Candidate> = outcome.matches().cloned().collect();
    if !request.all {
        matches.truncate(1);
    }

    if json {
        print_json(&FindReport {
            needle: target.name(),
            haystack: haystack.name(),
            threshold: outcome.threshold,
            best_similarity: outcome.best().map(|c| c.similarity),
            matches: matches.clone(),
        });
    } else if matches.is_empty() {
        println!(
            "❌ {} not found (best {:.3}, required {:.3})",
            target.name(),
            outcome.best().map(|c| c.similarity).unwrap_or(0.0),
            outcome.threshold
        );
    } else {
        for candidate in &matches {
            print_candidate(candidate);
        }
    }
    Ok(!matches.is_empty())
}

/// Chain steps are judged by their own thresholds, so a single override
/// could never take effect.
fn check_similarity_override(target: &Target, similarity: Option<f64>) -> FinderResult<()> {
    match (target.data(), similarity) {
        (TargetData::Chain(chain), Some(_)) => Err(FinderError::InvalidNeedle {
            needle: target.name().to_string(),
            reason: format!(
                "--similarity does not apply to chain {}; set it in the .match file of each step",
                chain.name()
            ),
        }),
        _ => Ok(()),
    }
}

fn run_chain(
    steps: &Path,
    haystack: &Path,
    json: bool,
    config: &GlobalConfig,
    sink: &mut dyn DiagnosticSink,
) -> FinderResult<bool> {
    let chain = Chain::load(steps, config)?;
    let haystack = Haystack::open(haystack)?;
    let outcome = chain.find(&haystack, config, sink)?;
    let step = outcome.step();

    if json {
        print_json(&ChainReport {
            chain: chain.name(),
            haystack: haystack.name(),
            step,
            step_data: step.map(|i| chain.steps()[i].data_ref.as_str()),
            matches: outcome.candidates(),
            attempts: &outcome.attempts,
        });
        return Ok(step.is_some());
    }

    for attempt in &outcome.attempts {
        println!(
            "⛓️ step {} ({}): best {:.3}, required {:.3}",
            attempt.step,
            chain.steps()[attempt.step].data_ref,
            attempt.best_similarity.unwrap_or(0.0),
            attempt.threshold
        );
    }
    match &outcome.state {
        ChainState::Succeeded { step, candidates } => {
            println!("✅ {} matched at step {}", chain.name(), step);
            for candidate in candidates {
                print_candidate(candidate);
            }
            Ok(true)
        }
        _ => {
            println!("❌ {} exhausted after {} step(s)", chain.name(), outcome.attempts.len());
            Ok(false)
        }
    }
}

fn print_candidate(candidate: &Candidate) {
    let (x, y) = candidate.target();
    println!(
        "✅ {}x{} at ({},{}) similarity {:.3}, click ({},{})",
        candidate.rect.width, candidate.rect.height, candidate.rect.x, candidate.rect.y, candidate.similarity, x, y
    );
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("❌ JSON encoding failed: {}", e),
    }
}
