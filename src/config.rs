//! Process-wide defaults for matchers and image diagnostics

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::matching::{ObjectDetector, TextRecognizer};

/// Defaults consulted whenever a matcher is created without explicit settings.
///
/// Values here are only defaults: a `.match` file, the target's own settings or a
/// call-scoped matcher always replace them wholesale.
#[derive(Clone)]
pub struct GlobalConfig {
    /// Matcher family used when a target carries no settings at all
    pub find_backend: String,
    pub pixel_backend: String,
    pub template_backend: String,
    pub feature_detect_backend: String,
    pub feature_match_backend: String,
    pub contour_threshold_backend: String,
    pub text_detect_backend: String,
    pub text_ocr_backend: String,
    pub deep_backend: String,
    /// Family used by the hybrid matcher for single (non-chain) targets
    pub hybrid_backend: String,
    /// Image diagnostics are written for reports at or above this level
    pub image_logging_level: log::LevelFilter,
    pub image_logging_destination: PathBuf,
    /// Zero padding of the step counter in dumped file names
    pub image_logging_step_width: usize,
    pub text_recognizer: Option<Arc<dyn TextRecognizer>>,
    pub object_detector: Option<Arc<dyn ObjectDetector>>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            find_backend: "hybrid".to_string(),
            pixel_backend: "ssd".to_string(),
            template_backend: "ccorr_normed".to_string(),
            feature_detect_backend: "fast9".to_string(),
            feature_match_backend: "bruteforce-hamming".to_string(),
            contour_threshold_backend: "adaptive".to_string(),
            text_detect_backend: "contours".to_string(),
            text_ocr_backend: "external".to_string(),
            deep_backend: "external".to_string(),
            hybrid_backend: "template".to_string(),
            image_logging_level: log::LevelFilter::Off,
            image_logging_destination: PathBuf::from("imglog"),
            image_logging_step_width: 3,
            text_recognizer: None,
            object_detector: None,
        }
    }
}

impl fmt::Debug for GlobalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalConfig")
            .field("find_backend", &self.find_backend)
            .field("pixel_backend", &self.pixel_backend)
            .field("template_backend", &self.template_backend)
            .field("feature_detect_backend", &self.feature_detect_backend)
            .field("feature_match_backend", &self.feature_match_backend)
            .field("contour_threshold_backend", &self.contour_threshold_backend)
            .field("text_detect_backend", &self.text_detect_backend)
            .field("text_ocr_backend", &self.text_ocr_backend)
            .field("deep_backend", &self.deep_backend)
            .field("hybrid_backend", &self.hybrid_backend)
            .field("image_logging_level", &self.image_logging_level)
            .field("image_logging_destination", &self.image_logging_destination)
            .field("image_logging_step_width", &self.image_logging_step_width)
            .field("text_recognizer", &self.text_recognizer.is_some())
            .field("object_detector", &self.object_detector.is_some())
            .finish()
    }
}

impl GlobalConfig {
    /// Defaults with environment overrides applied.
    ///
    /// Unknown backend names are kept as given and rejected later, when a
    /// matcher is actually built from them.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// These settings with `MATCH_*` environment overrides applied on top.
    pub fn with_env_overrides(mut self) -> Self {
        self.apply_env_overrides(|key| std::env::var(key).ok());
        self
    }

    pub(crate) fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("MATCH_FIND_BACKEND") {
            log::debug!("🔧 find backend overridden from environment: {}", value);
            self.find_backend = value;
        }
        if let Some(value) = lookup("MATCH_TEMPLATE_BACKEND") {
            log::debug!("🔧 template backend overridden from environment: {}", value);
            self.template_backend = value;
        }
        if let Some(value) = lookup("MATCH_HYBRID_BACKEND") {
            log::debug!("🔧 hybrid backend overridden from environment: {}", value);
            self.hybrid_backend = value;
        }
        if let Some(value) = lookup("MATCH_IMGLOG_DIR") {
            self.image_logging_destination = PathBuf::from(value);
        }
        if let Some(value) = lookup("MATCH_IMGLOG_LEVEL") {
            match value.parse::<log::LevelFilter>() {
                Ok(level) => self.image_logging_level = level,
                Err(_) => log::warn!("⚠️ Ignoring invalid MATCH_IMGLOG_LEVEL '{}'", value),
            }
        }
    }

    /// Backend configured for a category, if the category has a process-wide default.
    pub fn default_backend(&self, category: &str) -> Option<&str> {
        let backend = match category {
            "pixel" => &self.pixel_backend,
            "template" => &self.template_backend,
            "fdetect" => &self.feature_detect_backend,
            "fmatch" => &self.feature_match_backend,
            "threshold" => &self.contour_threshold_backend,
            "text" => &self.text_detect_backend,
            "ocr" => &self.text_ocr_backend,
            "deep" => &self.deep_backend,
            "hybrid" => &self.hybrid_backend,
            _ => return None,
        };
        Some(backend.as_str())
    }

    pub fn with_text_recognizer(mut self, recognizer: Arc<dyn TextRecognizer>) -> Self {
        self.text_recognizer = Some(recognizer);
        self
    }

    pub fn with_object_detector(mut self, detector: Arc<dyn ObjectDetector>) -> Self {
        self.object_detector = Some(detector);
        self
    }

    pub fn image_logging_enabled(&self, level: log::Level) -> bool {
        level <= self.image_logging_level
    }
}

/// Names accepted by [`preset`].
pub const PRESETS: [&str; 2] = ["ui", "robust"];

/// Named configuration preset.
pub fn preset(name: &str) -> Option<GlobalConfig> {
    match name {
        "ui" => Some(create_ui_config()),
        "robust" => Some(create_robust_config()),
        _ => None,
    }
}

/// Preset for crisp UI elements (buttons, icons) where exact pixels are expected
pub fn create_ui_config() -> GlobalConfig {
    GlobalConfig {
        find_backend: "template".to_string(),
        template_backend: "sqdiff_normed".to_string(),
        hybrid_backend: "template".to_string(),
        ..GlobalConfig::default()
    }
}

/// Preset for content that may be partially occluded or re-rendered
pub fn create_robust_config() -> GlobalConfig {
    GlobalConfig {
        find_backend: "tempfeat".to_string(),
        hybrid_backend: "tempfeat".to_string(),
        ..GlobalConfig::default()
    }
}
