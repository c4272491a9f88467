use std::env;
use std::path::PathBuf;

use crate::config::PRESETS;

#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    /// Search one needle file in a haystack image
    Find {
        needle: PathBuf,
        haystack: PathBuf,
        match_file: Option<PathBuf>,
        similarity: Option<f64>,
        backend: Option<String>,
        all: bool,
    },
    /// Traverse a `.steps` chain against a haystack image
    Chain { steps: PathBuf, haystack: PathBuf },
    /// Print the default `.match` text of a matcher family
    Defaults { family: String },
}

#[derive(Debug, PartialEq)]
pub struct Args {
    pub mode: Mode,
    pub json: bool,
    pub debug_mode: bool,
    pub imglog: Option<PathBuf>,
    /// Configuration preset replacing the built-in defaults
    pub preset: Option<String>,
}

impl Args {
    pub fn parse() -> Option<Self> {
        let args: Vec<String> = env::args().skip(1).collect();
        match Self::parse_from(&args) {
            Ok(Some(parsed)) => Some(parsed),
            Ok(None) => None,
            Err(message) => {
                eprintln!("❌ {}", message);
                print_help();
                None
            }
        }
    }

    /// Parse arguments without the program name. `Ok(None)` means help or
    /// version was printed.
    pub fn parse_from(args: &[String]) -> Result<Option<Self>, String> {
        let mut positional: Vec<&str> = Vec::new();
        let mut json = false;
        let mut debug_mode = false;
        let mut imglog: Option<PathBuf> = None;
        let mut preset: Option<String> = None;
        let mut match_file: Option<PathBuf> = None;
        let mut similarity: Option<f64> = None;
        let mut backend: Option<String> = None;
        let mut all = false;

        for arg in args {
            if arg == "--help" || arg == "-h" {
                print_help();
                return Ok(None);
            } else if arg == "--version" || arg == "-v" {
                println!("match-chain v{} ({})", env!("APP_VERSION_DISPLAY"), env!("APP_BUILD_YEAR"));
                return Ok(None);
            } else if arg == "--debug" {
                debug_mode = true;
            } else if arg == "--json" {
                json = true;
            } else if arg == "--all" {
                all = true;
            } else if let Some(val) = arg.strip_prefix("--imglog=") {
                imglog = Some(PathBuf::from(val));
            } else if let Some(val) = arg.strip_prefix("--preset=") {
                if !PRESETS.contains(&val) {
                    return Err(format!("Unknown preset: {} (expected one of {:?})", val, PRESETS));
                }
                preset = Some(val.to_string());
            } else if let Some(val) = arg.strip_prefix("--match=") {
                match_file = Some(PathBuf::from(val));
            } else if let Some(val) = arg.strip_prefix("--backend=") {
                backend = Some(val.to_string());
            } else if let Some(val) = arg.strip_prefix("--similarity=") {
                match val.parse::<f64>() {
                    Ok(s) if (0.0..=1.0).contains(&s) => similarity = Some(s),
                    _ => return Err(format!("Invalid similarity value: {}", val)),
                }
            } else if arg.starts_with('-') {
                return Err(format!("Unknown argument: {}", arg));
            } else {
                positional.push(arg);
            }
        }

        let mode = match positional.as_slice() {
            ["find", needle, haystack] => Mode::Find {
                needle: PathBuf::from(needle),
                haystack: PathBuf::from(haystack),
                match_file,
                similarity,
                backend,
                all,
            },
            ["chain", steps, haystack] => Mode::Chain {
                steps: PathBuf::from(steps),
                haystack: PathBuf::from(haystack),
            },
            ["defaults", family] => Mode::Defaults {
                family: family.to_string(),
            },
            [] => return Err("Missing command".to_string()),
            other => return Err(format!("Unexpected arguments: {}", other.join(" "))),
        };

        Ok(Some(Args {
            mode,
            json,
            debug_mode,
            imglog,
            preset,
        }))
    }
}

fn print_help() {
    println!("🔍 match-chain: find images and text on a screenshot");
    println!();
    println!("USAGE:");
    println!("    match-chain find <needle> <haystack> [FLAGS]");
    println!("    match-chain chain <file.steps> <haystack> [FLAGS]");
    println!("    match-chain defaults <family>");
    println!();
    println!("FLAGS:");
    println!("    --match=FILE        Use settings from FILE instead of the needle's own");
    println!("    --similarity=S      Required similarity in [0, 1]");
    println!("    --backend=NAME      Matcher family (pixel, template, feature, tempfeat, contour, text, deep, hybrid)");
    println!("    --all               Report every acceptable match, not only the best");
    println!("    --json              Print results as JSON");
    println!("    --imglog=DIR        Dump needle, haystack and hotmaps into DIR");
    println!("    --preset=NAME       Start from a settings preset (ui, robust)");
    println!("    --debug             Enable debug output");
    println!("    --help, -h          Show this help message");
    println!("    --version, -v       Show version information");
    println!();
    println!("EXAMPLES:");
    println!("    match-chain find ok_button.png screen.png --similarity=0.9");
    println!("    match-chain chain login.steps screen.png --json");
    println!("    match-chain defaults tempfeat > button.match");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Option<Args>, String> {
        let owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        Args::parse_from(&owned)
    }

    #[test]
    fn test_find_with_flags() {
        let args = parse(&["find", "ok.png", "screen.png", "--similarity=0.9", "--all", "--json"])
            .unwrap()
            .unwrap();
        assert!(args.json);
        assert_eq!(
            args.mode,
            Mode::Find {
                needle: PathBuf::from("ok.png"),
                haystack: PathBuf::from("screen.png"),
                match_file: None,
                similarity: Some(0.9),
                backend: None,
                all: true,
            }
        );
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(parse(&["find", "ok.png", "screen.png", "--similarity=1.5"]).is_err());
        assert!(parse(&["find", "ok.png"]).is_err());
        assert!(parse(&["chain", "a.steps", "s.png", "--frobnicate"]).is_err());
        assert!(parse(&[]).is_err());
    }

    #[test]
    fn test_defaults_and_imglog() {
        let args = parse(&["defaults", "text", "--imglog=out", "--debug"]).unwrap().unwrap();
        assert_eq!(args.mode, Mode::Defaults { family: "text".to_string() });
        assert_eq!(args.imglog, Some(PathBuf::from("out")));
        assert!(args.debug_mode);
        assert_eq!(args.preset, None);
    }

    #[test]
    fn test_preset_names() {
        let args = parse(&["chain", "a.steps", "s.png", "--preset=robust"]).unwrap().unwrap();
        assert_eq!(args.preset.as_deref(), Some("robust"));
        assert!(parse(&["chain", "a.steps", "s.png", "--preset=turbo"]).is_err());
    }
}
