//! Needles: what is being looked for, plus optional per-target settings

use std::path::{Path, PathBuf};

use image::RgbImage;

use crate::chain::Chain;
use crate::config::GlobalConfig;
use crate::error::{FinderError, FinderResult};
use crate::matching::{Family, Finder};
use crate::resolve;

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

#[derive(Debug, Clone)]
pub enum TargetData {
    Image { name: String, pixels: RgbImage },
    Text { value: String },
    /// Identifier understood by a learned object detector
    Pattern { id: String },
    Chain(Chain),
}

/// A needle with its settings slots.
///
/// `file_settings` come from a `.match` file loaded with the target;
/// `settings` are instance settings that only apply while
/// `use_own_settings` is set.
#[derive(Debug, Clone)]
pub struct Target {
    data: TargetData,
    source: Option<PathBuf>,
    file_settings: Option<Finder>,
    settings: Option<Finder>,
    use_own_settings: bool,
    center_offset: (i32, i32),
}

impl Target {
    fn from_data(data: TargetData) -> Self {
        Self {
            data,
            source: None,
            file_settings: None,
            settings: None,
            use_own_settings: false,
            center_offset: (0, 0),
        }
    }

    pub fn image(name: impl Into<String>, pixels: RgbImage) -> FinderResult<Self> {
        let name = name.into();
        if pixels.width() == 0 || pixels.height() == 0 {
            return Err(FinderError::InvalidNeedle {
                needle: name,
                reason: "image has no pixels".to_string(),
            });
        }
        Ok(Self::from_data(TargetData::Image { name, pixels }))
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::from_data(TargetData::Text { value: value.into() })
    }

    pub fn pattern(id: impl Into<String>) -> Self {
        Self::from_data(TargetData::Pattern { id: id.into() })
    }

    pub fn chain(chain: Chain) -> Self {
        Self::from_data(TargetData::Chain(chain))
    }

    /// Load a target by file extension. A sibling `.match` file, if present,
    /// becomes the target's file settings.
    pub fn from_data_file(path: impl AsRef<Path>, config: &GlobalConfig) -> FinderResult<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let mut target = match extension.as_str() {
            ext if IMAGE_EXTENSIONS.contains(&ext) => Self::load_image(path)?,
            "txt" => Self::text(read_text(path)?),
            "steps" => return Ok(Self::chain(Chain::load(path, config)?).with_source(path)),
            "match" => return Self::from_match_file(path, config),
            _ => {
                return Err(FinderError::UnsupportedTarget {
                    path: path.to_path_buf(),
                });
            }
        };

        let sidecar = path.with_extension("match");
        if sidecar.is_file() {
            log::debug!("📄 Loading settings for {} from {}", target.name(), sidecar.display());
            target.file_settings = Some(Finder::from_match_file(&sidecar, config)?);
        }
        Ok(target.with_source(path))
    }

    /// Load a target from its `.match` file; the data kind follows the
    /// configured `find` backend and is looked up next to the file.
    pub fn from_match_file(path: impl AsRef<Path>, config: &GlobalConfig) -> FinderResult<Self> {
        let path = path.as_ref();
        let finder = Finder::from_match_file(path, config)?;
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut target = match finder.family() {
            Family::Text => Self::text(read_text(&path.with_extension("txt"))?),
            Family::Deep => Self::pattern(stem),
            Family::Hybrid => Self::chain(Chain::load(path.with_extension("steps"), config)?),
            _ => {
                let image_path = IMAGE_EXTENSIONS
                    .iter()
                    .map(|ext| path.with_extension(ext))
                    .find(|p| p.is_file())
                    .ok_or_else(|| FinderError::UnsupportedTarget {
                        path: path.with_extension("png"),
                    })?;
                Self::load_image(&image_path)?
            }
        };
        target.file_settings = Some(finder);
        Ok(target.with_source(path))
    }

    fn load_image(path: &Path) -> FinderResult<Self> {
        let pixels = image::open(path)
            .map_err(|source| FinderError::ImageDecode {
                path: path.to_path_buf(),
                source,
            })?
            .to_rgb8();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self::image(name, pixels)
    }

    fn with_source(mut self, path: &Path) -> Self {
        self.source = Some(path.to_path_buf());
        self
    }

    pub fn data(&self) -> &TargetData {
        &self.data
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn name(&self) -> &str {
        match &self.data {
            TargetData::Image { name, .. } => name,
            TargetData::Text { value } => value,
            TargetData::Pattern { id } => id,
            TargetData::Chain(chain) => chain.name(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match &self.data {
            TargetData::Image { .. } => "image",
            TargetData::Text { .. } => "text",
            TargetData::Pattern { .. } => "pattern",
            TargetData::Chain(_) => "chain",
        }
    }

    pub fn pixels(&self) -> Option<&RgbImage> {
        match &self.data {
            TargetData::Image { pixels, .. } => Some(pixels),
            _ => None,
        }
    }

    pub fn file_settings(&self) -> Option<&Finder> {
        self.file_settings.as_ref()
    }

    pub fn settings(&self) -> Option<&Finder> {
        self.settings.as_ref()
    }

    pub fn use_own_settings(&self) -> bool {
        self.use_own_settings
    }

    pub fn set_use_own_settings(&mut self, enabled: bool) {
        self.use_own_settings = enabled;
    }

    pub fn with_file_settings(mut self, finder: Finder) -> Self {
        self.file_settings = Some(finder);
        self
    }

    /// Install instance settings and switch to using them.
    pub fn with_settings(mut self, finder: Finder) -> Self {
        self.settings = Some(finder);
        self.use_own_settings = true;
        self
    }

    /// Instance settings, materialised from the currently effective ones on
    /// first access. Using them is switched on as a side effect.
    pub fn own_settings_mut(&mut self, config: &GlobalConfig) -> FinderResult<&mut Finder> {
        let finder = match self.settings.take() {
            Some(finder) => finder,
            None => resolve::resolve(config, self, None, None)?,
        };
        self.use_own_settings = true;
        Ok(self.settings.insert(finder))
    }

    /// Copy of this target whose own settings require `similarity`.
    pub fn with_similarity(&self, similarity: f64, config: &GlobalConfig) -> FinderResult<Self> {
        let mut copy = self.clone();
        copy.own_settings_mut(config)?.set_similarity(similarity)?;
        Ok(copy)
    }

    pub fn with_center_offset(mut self, dx: i32, dy: i32) -> Self {
        self.center_offset = (dx, dy);
        self
    }

    pub fn center_offset(&self) -> (i32, i32) {
        self.center_offset
    }

    /// Persist the settings this target would be matched with when no region
    /// or call override applies.
    pub fn save_settings(&self, path: impl AsRef<Path>, config: &GlobalConfig) -> FinderResult<()> {
        let effective = resolve::resolve(config, self, None, None)?;
        effective.save_match_file(path)
    }
}

fn read_text(path: &Path) -> FinderResult<String> {
    std::fs::read_to_string(path)
        .map(|text| text.trim_end_matches(['\r', '\n']).to_string())
        .map_err(|e| FinderError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_empty_image_needle_rejected() {
        assert!(matches!(
            Target::image("void", RgbImage::new(0, 0)),
            Err(FinderError::InvalidNeedle { .. })
        ));
    }

    #[test]
    fn test_from_data_file_loads_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let config = GlobalConfig::default();
        let image_path = dir.path().join("button.png");
        RgbImage::from_pixel(4, 4, Rgb([200, 10, 10])).save(&image_path).unwrap();

        let mut finder = Finder::new(Family::Template, &config).unwrap();
        finder.set_similarity(0.6).unwrap();
        finder.save_match_file(dir.path().join("button.match")).unwrap();

        let target = Target::from_data_file(&image_path, &config).unwrap();
        assert_eq!(target.name(), "button");
        assert_eq!(target.kind(), "image");
        assert!(!target.use_own_settings());
        assert_eq!(target.file_settings().unwrap().similarity().unwrap(), 0.6);
    }

    #[test]
    fn test_from_match_file_picks_kind_by_family() {
        let dir = tempfile::tempdir().unwrap();
        let config = GlobalConfig::default();
        std::fs::write(dir.path().join("greeting.txt"), "Hello world\n").unwrap();
        Finder::new(Family::Text, &config)
            .unwrap()
            .save_match_file(dir.path().join("greeting.match"))
            .unwrap();

        let target = Target::from_match_file(dir.path().join("greeting.match"), &config).unwrap();
        assert_eq!(target.kind(), "text");
        assert_eq!(target.name(), "Hello world");
        assert_eq!(target.file_settings().unwrap().family(), Family::Text);
    }

    #[test]
    fn test_unsupported_extension() {
        let config = GlobalConfig::default();
        assert!(matches!(
            Target::from_data_file("needle.gif2", &config),
            Err(FinderError::UnsupportedTarget { .. })
        ));
    }

    #[test]
    fn test_with_similarity_leaves_original_untouched() {
        let config = GlobalConfig::default();
        let target = Target::text("OK");
        let strict = target.with_similarity(0.95, &config).unwrap();
        assert!(strict.use_own_settings());
        assert_eq!(strict.settings().unwrap().similarity().unwrap(), 0.95);
        assert!(target.settings().is_none());
    }

    #[test]
    fn test_save_settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = GlobalConfig::default();
        let target = Target::pattern("cat").with_similarity(0.4, &config).unwrap();
        let path = dir.path().join("cat.match");
        target.save_settings(&path, &config).unwrap();

        let restored = Target::from_match_file(&path, &config).unwrap();
        assert_eq!(restored.kind(), "pattern");
        assert_eq!(restored.name(), "cat");
        assert_eq!(restored.file_settings().unwrap().similarity().unwrap(), 0.4);
    }
}
