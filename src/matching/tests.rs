use image::{Rgb, RgbImage};

use super::*;
use crate::chain::{Chain, ChainStep};
use crate::diagnostics::{MemorySink, NullSink};

fn scene() -> RgbImage {
    RgbImage::from_fn(64, 48, |x, y| {
        let v = ((x * 7919 + y * 104729 + x * y * 31) % 251) as u8;
        Rgb([v, 255 - v, v / 3])
    })
}

fn patch(x: u32, y: u32) -> Target {
    let pixels = image::imageops::crop_imm(&scene(), x, y, 9, 7).to_image();
    Target::image("patch", pixels).unwrap()
}

#[test]
fn test_match_text_round_trip() {
    let config = GlobalConfig::default();
    let mut finder = Finder::new(Family::Template, &config).unwrap();
    finder.configure_backend("sqdiff_normed", None, false).unwrap();
    finder.set_similarity(0.65).unwrap();

    let text = finder.to_match_text();
    assert!(text.starts_with(codec::HEADER));
    let restored = Finder::from_match_text(&text, &config).unwrap();
    assert_eq!(restored, finder);
    assert_eq!(restored.params().backend("template").unwrap(), "sqdiff_normed");
}

#[test]
fn test_match_text_without_find_backend() {
    let err = Finder::from_match_text("# IMAGE MATCH DATA\n[template]\nbackend = ccorr_normed\n", &GlobalConfig::default())
        .unwrap_err();
    assert!(matches!(err, FinderError::MalformedConfiguration { .. }));
}

#[test]
fn test_match_text_with_unknown_family() {
    let err = Finder::from_match_text("[find]\nbackend = telepathy\n", &GlobalConfig::default()).unwrap_err();
    assert!(matches!(err, FinderError::MalformedConfiguration { line: 2, .. }));
}

#[test]
fn test_accepts_by_kind() {
    assert!(Finder::accepts(Family::Pixel, &patch(0, 0)));
    assert!(!Finder::accepts(Family::Pixel, &Target::text("ok")));
    assert!(Finder::accepts(Family::Text, &Target::text("ok")));
    assert!(Finder::accepts(Family::Deep, &Target::pattern("cat")));
    assert!(!Finder::accepts(Family::Feature, &Target::pattern("cat")));
    assert!(Finder::accepts(Family::Hybrid, &Target::text("ok")));
    assert!(Finder::accepts(Family::Contour, &patch(0, 0)));
    assert!(!Finder::accepts(Family::Contour, &Target::text("ok")));
}

#[test]
fn test_contour_settings_in_match_text() {
    let config = GlobalConfig::default();
    let mut finder = Finder::new(Family::Contour, &config).unwrap();
    assert_eq!(finder.params().backend("threshold").unwrap(), "adaptive");

    finder.configure_backend("canny", Some("threshold"), false).unwrap();
    finder.params_mut().set("contour", "minArea", 40).unwrap();
    let text = finder.to_match_text();
    assert!(text.contains("[contour]\nbackend = mixed\n"));
    assert!(text.contains("[threshold]\nbackend = canny\n"));

    let restored = Finder::from_match_text(&text, &config).unwrap();
    assert_eq!(restored.family(), Family::Contour);
    assert_eq!(restored.params().int("contour", "minArea").unwrap(), 40);
    assert!(restored.params().get("threshold", "threshold2").is_ok());
}

#[test]
fn test_wrong_kind_is_invalid_needle() {
    let finder = Finder::new(Family::Template, &GlobalConfig::default()).unwrap();
    let haystack = Haystack::new(scene(), "scene").unwrap();
    let err = finder.find(&Target::text("ok"), &haystack, &mut NullSink).unwrap_err();
    assert!(matches!(err, FinderError::InvalidNeedle { .. }));
}

#[test]
fn test_find_reports_to_sink() {
    let finder = Finder::new(Family::Pixel, &GlobalConfig::default()).unwrap();
    let haystack = Haystack::new(scene(), "scene").unwrap();
    let mut sink = MemorySink::default();
    let outcome = finder.find(&patch(20, 11), &haystack, &mut sink).unwrap();

    assert_eq!(outcome.best().unwrap().rect, Rect::new(20, 11, 9, 7));
    let record = &sink.records()[0];
    assert_eq!(record.family, "pixel");
    assert_eq!(record.needle, "patch");
    assert_eq!(record.chain_step, None);
}

#[test]
fn test_hybrid_switches_fallback_family() {
    let config = GlobalConfig::default();
    let mut finder = Finder::new(Family::Hybrid, &config).unwrap();
    let Finder::Hybrid(hybrid) = &finder else {
        panic!("expected hybrid matcher");
    };
    assert_eq!(hybrid.fallback().family(), Family::Template);

    finder.configure_backend("pixel", None, false).unwrap();
    let Finder::Hybrid(hybrid) = &finder else {
        panic!("expected hybrid matcher");
    };
    assert_eq!(hybrid.fallback().family(), Family::Pixel);

    let haystack = Haystack::new(scene(), "scene").unwrap();
    let outcome = finder.find(&patch(3, 30), &haystack, &mut NullSink).unwrap();
    assert_eq!(outcome.best().unwrap().stage, "pixel");
}

#[test]
fn test_hybrid_runs_chain_targets() {
    let config = GlobalConfig::default();
    let strict = {
        let mut f = Finder::new(Family::Pixel, &config).unwrap();
        f.set_similarity(1.0).unwrap();
        f
    };
    let missing = Target::image("blank", RgbImage::from_pixel(9, 7, Rgb([1, 2, 3])))
        .unwrap()
        .with_settings(strict.clone());
    let present = patch(40, 8).with_settings(strict);
    let chain = Chain::new(
        "patches",
        vec![
            ChainStep {
                data_ref: "blank.png".to_string(),
                config_ref: "strict.match".to_string(),
                target: missing,
            },
            ChainStep {
                data_ref: "patch.png".to_string(),
                config_ref: "strict.match".to_string(),
                target: present,
            },
        ],
    );

    let finder = Finder::new(Family::Hybrid, &config).unwrap();
    let haystack = Haystack::new(scene(), "scene").unwrap();
    let mut sink = MemorySink::default();
    let outcome = finder.find(&Target::chain(chain), &haystack, &mut sink).unwrap();

    assert_eq!(outcome.chain_step, Some(1));
    assert_eq!(outcome.threshold, 1.0);
    assert_eq!(outcome.best().unwrap().rect, Rect::new(40, 8, 9, 7));
    let steps: Vec<Option<usize>> = sink.records().iter().map(|r| r.chain_step).collect();
    assert_eq!(steps, vec![Some(0), Some(1), Some(1)]);
}

#[test]
fn test_family_names_parse() {
    for family in Family::ALL {
        assert_eq!(family.name().parse::<Family>().unwrap(), family);
    }
    assert!(matches!("nope".parse::<Family>(), Err(FinderError::UnknownBackend { .. })));
}

#[test]
fn test_finders_are_shareable_across_threads() {
    fn assert_shareable<T: Clone + Send + Sync>() {}
    assert_shareable::<Finder>();
    assert_shareable::<Target>();
}
