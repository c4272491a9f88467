use image::{Rgb, RgbImage};

use super::*;
use crate::chain::Chain;
use crate::config::create_robust_config;
use crate::diagnostics::{MemorySink, NullSink};
use crate::error::FinderError;

fn finder_with(family: Family, similarity: f64, config: &GlobalConfig) -> Finder {
    let mut finder = Finder::new(family, config).unwrap();
    finder.set_similarity(similarity).unwrap();
    finder
}

fn scene() -> RgbImage {
    RgbImage::from_fn(80, 60, |x, y| {
        let v = ((x * 7919 + y * 104729 + x * y * 31) % 251) as u8;
        Rgb([v, v / 2, 255 - v])
    })
}

fn needle_at(x: u32, y: u32) -> Target {
    let pixels = image::imageops::crop_imm(&scene(), x, y, 10, 8).to_image();
    Target::image("patch", pixels).unwrap()
}

#[test]
fn test_precedence_replaces_wholesale() {
    let config = GlobalConfig::default();
    let target = Target::text("OK");
    assert_eq!(resolve(&config, &target, None, None).unwrap().similarity().unwrap(), 0.8);

    let target = target.with_file_settings(finder_with(Family::Text, 0.6, &config));
    assert_eq!(resolve(&config, &target, None, None).unwrap().similarity().unwrap(), 0.6);

    let mut target = target.with_settings(finder_with(Family::Text, 0.5, &config));
    assert_eq!(resolve(&config, &target, None, None).unwrap().similarity().unwrap(), 0.5);

    let region = finder_with(Family::Text, 0.7, &config);
    assert_eq!(resolve(&config, &target, Some(&region), None).unwrap().similarity().unwrap(), 0.7);

    let call = finder_with(Family::Text, 0.95, &config);
    assert_eq!(
        resolve(&config, &target, Some(&region), Some(&call)).unwrap().similarity().unwrap(),
        0.95
    );

    target.set_use_own_settings(false);
    assert_eq!(resolve(&config, &target, None, None).unwrap().similarity().unwrap(), 0.6);
}

#[test]
fn test_resolved_finder_is_a_copy() {
    let config = GlobalConfig::default();
    let target = Target::text("OK").with_file_settings(finder_with(Family::Text, 0.6, &config));
    let mut resolved = resolve(&config, &target, None, None).unwrap();
    resolved.set_similarity(0.1).unwrap();
    assert_eq!(target.file_settings().unwrap().similarity().unwrap(), 0.6);
}

#[test]
fn test_default_family_by_kind() {
    let config = GlobalConfig::default();
    assert_eq!(default_family(&config, &Target::text("a")).unwrap(), Family::Text);
    assert_eq!(default_family(&config, &Target::pattern("cat")).unwrap(), Family::Deep);
    assert_eq!(default_family(&config, &needle_at(0, 0)).unwrap(), Family::Template);
    assert_eq!(
        default_family(&config, &Target::chain(Chain::new("empty", Vec::new()))).unwrap(),
        Family::Hybrid
    );
    assert_eq!(default_family(&create_robust_config(), &needle_at(0, 0)).unwrap(), Family::TempFeat);
}

#[test]
fn test_unknown_find_backend_is_reported() {
    let config = GlobalConfig {
        find_backend: "telepathy".to_string(),
        ..GlobalConfig::default()
    };
    assert!(matches!(
        default_family(&config, &Target::text("a")),
        Err(FinderError::UnknownBackend { .. })
    ));
}

#[test]
fn test_region_bounds_translate_results() {
    let haystack = Haystack::new(scene(), "scene").unwrap();
    let target = needle_at(30, 20).with_center_offset(3, -2);
    let region = Region::new(GlobalConfig::default()).with_bounds(Rect::new(20, 10, 40, 30));

    let mut sink = MemorySink::default();
    let found = region.find(&target, &haystack, None, &mut sink).unwrap().unwrap();
    assert_eq!((found.rect.x, found.rect.y), (30, 20));
    assert_eq!(found.offset, (3, -2));
    assert_eq!(found.target(), (38, 22));
    assert_eq!(sink.records().len(), 1);
}

#[test]
fn test_region_too_small_for_needle() {
    let haystack = Haystack::new(scene(), "scene").unwrap();
    let region = Region::new(GlobalConfig::default()).with_bounds(Rect::new(0, 0, 6, 6));
    let err = region.find(&needle_at(0, 0), &haystack, None, &mut NullSink).unwrap_err();
    assert!(matches!(err, FinderError::InvalidNeedle { .. }));
}

#[test]
fn test_region_settings_and_call_override() {
    let config = GlobalConfig::default();
    let haystack = Haystack::new(scene(), "scene").unwrap();
    let target = needle_at(12, 40);
    let impossible = finder_with(Family::Template, 1.0, &config);
    let lenient = finder_with(Family::Template, 0.5, &config);

    let region = Region::new(config.clone()).with_settings(lenient);
    assert!(region.exists(&target, &haystack, None, &mut NullSink).unwrap());
    assert_eq!(region.resolve(&target, Some(&impossible)).unwrap().similarity().unwrap(), 1.0);
}

#[test]
fn test_sample_ignores_threshold() {
    let config = GlobalConfig::default();
    let haystack = Haystack::new(scene(), "scene").unwrap();
    let target = needle_at(50, 30).with_settings(finder_with(Family::Template, 1.0, &config));
    let region = Region::new(config);
    assert!(region.sample(&target, &haystack, &mut NullSink).unwrap() > 0.99);
}

#[test]
fn test_find_all_returns_only_passing() {
    let haystack = Haystack::new(scene(), "scene").unwrap();
    let region = Region::new(GlobalConfig::default());
    let all = region.find_all(&needle_at(5, 5), &haystack, None, &mut NullSink).unwrap();
    assert!(!all.is_empty());
    assert!(all.iter().all(|c| c.similarity >= 0.8));
    assert_eq!((all[0].rect.x, all[0].rect.y), (5, 5));
}
