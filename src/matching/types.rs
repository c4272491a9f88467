//! Core data types shared by all matcher backends

use std::path::Path;

use image::{GrayImage, RgbImage};
use serde::Serialize;

use crate::error::{FinderError, FinderResult};

/// Axis-aligned rectangle in haystack pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn center(&self) -> (u32, u32) {
        (self.x.saturating_add(self.width / 2), self.y.saturating_add(self.height / 2))
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Moved by `(dx, dy)`, saturating at the coordinate limit.
    pub fn translated(&self, dx: u32, dy: u32) -> Rect {
        Rect::new(self.x.saturating_add(dx), self.y.saturating_add(dy), self.width, self.height)
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        let (x, y) = (x as u64, y as u64);
        x >= self.x as u64
            && y >= self.y as u64
            && x < self.x as u64 + self.width as u64
            && y < self.y as u64 + self.height as u64
    }

    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x as u64 + self.width as u64 <= width as u64 && self.y as u64 + self.height as u64 <= height as u64
    }
}

/// One located occurrence of a needle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub rect: Rect,
    /// Similarity in `[0, 1]`; 1 means a perfect match
    pub similarity: f64,
    /// Name of the stage that produced the final similarity
    pub stage: String,
    /// Click offset from the rect center, copied from the target
    pub offset: (i32, i32),
    /// Earlier-stage candidates of multi-stage backends, informational only
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sub_results: Vec<Candidate>,
}

impl Candidate {
    pub fn new(rect: Rect, similarity: f64, stage: impl Into<String>) -> Self {
        Self {
            rect,
            similarity: similarity.clamp(0.0, 1.0),
            stage: stage.into(),
            offset: (0, 0),
            sub_results: Vec::new(),
        }
    }

    pub fn with_offset(mut self, offset: (i32, i32)) -> Self {
        self.offset = offset;
        self
    }

    /// Point a click on this match would land on.
    pub fn target(&self) -> (i64, i64) {
        let (cx, cy) = self.rect.center();
        (cx as i64 + self.offset.0 as i64, cy as i64 + self.offset.1 as i64)
    }

    pub(crate) fn translated(mut self, dx: u32, dy: u32) -> Self {
        self.rect = self.rect.translated(dx, dy);
        self.sub_results = self
            .sub_results
            .into_iter()
            .map(|c| c.translated(dx, dy))
            .collect();
        self
    }
}

/// Named intermediate artifact of a backend stage, for diagnostics only.
#[derive(Debug, Clone)]
pub struct StageArtifact {
    pub name: String,
    /// 1-based position of the producing stage in a multi-stage pipeline
    pub stage: usize,
    pub similarity: f64,
    pub hotmap: Option<RgbImage>,
    pub points: Vec<(u32, u32)>,
}

impl StageArtifact {
    pub fn new(name: impl Into<String>, similarity: f64) -> Self {
        Self {
            name: name.into(),
            stage: 1,
            similarity,
            hotmap: None,
            points: Vec::new(),
        }
    }

    pub fn with_hotmap(mut self, hotmap: RgbImage) -> Self {
        self.hotmap = Some(hotmap);
        self
    }

    pub fn with_points(mut self, points: Vec<(u32, u32)>) -> Self {
        self.points = points;
        self
    }
}

/// Result of one `find`: ranked candidates plus diagnostics.
#[derive(Debug, Clone, Default)]
pub struct FindOutcome {
    pub candidates: Vec<Candidate>,
    pub stages: Vec<StageArtifact>,
    /// Threshold the candidates were ranked against
    pub threshold: f64,
    /// Index of the chain step that produced the candidates, if any
    pub chain_step: Option<usize>,
}

impl FindOutcome {
    pub fn new(candidates: Vec<Candidate>, threshold: f64) -> Self {
        Self {
            candidates,
            stages: Vec::new(),
            threshold,
            chain_step: None,
        }
    }

    pub fn with_stages(mut self, stages: Vec<StageArtifact>) -> Self {
        self.stages = stages;
        self
    }

    pub fn best(&self) -> Option<&Candidate> {
        self.candidates.first()
    }

    /// Candidates that clear the threshold (never the closest miss).
    pub fn matches(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.iter().filter(|c| c.similarity >= self.threshold)
    }

    pub fn is_match(&self) -> bool {
        self.best().is_some_and(|c| c.similarity >= self.threshold)
    }
}

/// The image being searched.
#[derive(Debug, Clone)]
pub struct Haystack {
    image: RgbImage,
    name: String,
}

impl Haystack {
    pub fn new(image: RgbImage, name: impl Into<String>) -> FinderResult<Self> {
        let name = name.into();
        if image.width() == 0 || image.height() == 0 {
            return Err(FinderError::InvalidHaystack {
                haystack: name,
                reason: "image has no pixels".to_string(),
            });
        }
        Ok(Self { image, name })
    }

    pub fn open(path: impl AsRef<Path>) -> FinderResult<Self> {
        let path = path.as_ref();
        let image = image::open(path)
            .map_err(|source| FinderError::ImageDecode {
                path: path.to_path_buf(),
                source,
            })?
            .to_rgb8();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self::new(image, name)
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn gray(&self) -> GrayImage {
        image::imageops::grayscale(&self.image)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Sub-haystack restricted to `bounds`.
    pub fn crop(&self, bounds: Rect) -> FinderResult<Haystack> {
        if bounds.width == 0 || bounds.height == 0 || !bounds.fits_within(self.width(), self.height()) {
            return Err(FinderError::InvalidHaystack {
                haystack: self.name.clone(),
                reason: format!(
                    "region {}x{} at ({},{}) exceeds {}x{}",
                    bounds.width,
                    bounds.height,
                    bounds.x,
                    bounds.y,
                    self.width(),
                    self.height()
                ),
            });
        }
        let cropped = image::imageops::crop_imm(&self.image, bounds.x, bounds.y, bounds.width, bounds.height).to_image();
        Ok(Haystack {
            image: cropped,
            name: self.name.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_click_point_uses_offset() {
        let candidate = Candidate::new(Rect::new(10, 20, 8, 6), 0.9, "template").with_offset((-3, 2));
        assert_eq!(candidate.target(), (11, 25));
    }

    #[test]
    fn test_rect_arithmetic_at_coordinate_limit() {
        let edge = Rect::new(u32::MAX - 2, 5, 10, 4);
        assert!(edge.contains(u32::MAX, 6));
        assert!(!edge.contains(u32::MAX - 3, 6));
        assert_eq!(edge.translated(100, 1), Rect::new(u32::MAX, 6, 10, 4));
        assert_eq!(edge.center(), (u32::MAX, 7));
        assert!(!edge.fits_within(u32::MAX, 100));
    }

    #[test]
    fn test_similarity_is_clamped() {
        assert_eq!(Candidate::new(Rect::new(0, 0, 1, 1), 1.2, "x").similarity, 1.0);
        assert_eq!(Candidate::new(Rect::new(0, 0, 1, 1), -0.1, "x").similarity, 0.0);
    }

    #[test]
    fn test_empty_haystack_rejected() {
        let err = Haystack::new(RgbImage::new(0, 4), "empty").unwrap_err();
        assert!(matches!(err, FinderError::InvalidHaystack { .. }));
    }

    #[test]
    fn test_crop_bounds() {
        let haystack = Haystack::new(RgbImage::new(20, 10), "screen").unwrap();
        let cropped = haystack.crop(Rect::new(5, 5, 10, 5)).unwrap();
        assert_eq!((cropped.width(), cropped.height()), (10, 5));
        assert!(haystack.crop(Rect::new(15, 0, 10, 5)).is_err());
    }

    #[test]
    fn test_outcome_matches_excludes_closest_miss() {
        let outcome = FindOutcome::new(vec![Candidate::new(Rect::new(0, 0, 2, 2), 0.4, "pixel")], 0.8);
        assert!(!outcome.is_match());
        assert_eq!(outcome.matches().count(), 0);
        assert!(outcome.best().is_some());
    }
}
