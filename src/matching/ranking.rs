//! Ordering and selection rules shared by every backend

use std::cmp::Ordering;

use image::{ImageBuffer, Luma, Rgb, RgbImage};

use super::types::Candidate;

pub type ScoreMap = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Descending similarity, ties broken by ascending row-major location.
pub fn compare(a: &Candidate, b: &Candidate) -> Ordering {
    b.similarity
        .total_cmp(&a.similarity)
        .then_with(|| a.rect.y.cmp(&b.rect.y))
        .then_with(|| a.rect.x.cmp(&b.rect.x))
}

/// Sort candidates and keep those reaching `threshold`. When none does, the
/// single best candidate is kept as the closest miss.
pub fn rank(mut candidates: Vec<Candidate>, threshold: f64) -> Vec<Candidate> {
    candidates.sort_by(compare);
    let accepted = candidates
        .iter()
        .take_while(|c| c.similarity >= threshold)
        .count();
    candidates.truncate(accepted.max(1));
    candidates
}

/// Pick peaks from a score map, wiping a needle-sized neighbourhood around
/// each pick so overlapping duplicates are not reported.
///
/// Picks stop at the first peak below `threshold`; that peak is only kept
/// when nothing was accepted. A zero threshold yields a single pick.
pub fn pick_peaks(scores: &mut ScoreMap, needle_width: u32, needle_height: u32, threshold: f64) -> Vec<(u32, u32, f64)> {
    let mut picks = Vec::new();
    let half_w = needle_width / 2;
    let half_h = needle_height / 2;

    while let Some((x, y, value)) = peak(scores) {
        let similarity = (value as f64).clamp(0.0, 1.0);
        if similarity < threshold {
            if picks.is_empty() {
                log::debug!("🔍 Best similarity {:.3} at ({},{}) below {:.3}", similarity, x, y, threshold);
                picks.push((x, y, similarity));
            }
            break;
        }
        picks.push((x, y, similarity));
        if threshold <= 0.0 {
            break;
        }

        let x0 = x.saturating_sub(half_w);
        let y0 = y.saturating_sub(half_h);
        let x1 = (x + half_w).max(x + 1).min(scores.width());
        let y1 = (y + half_h).max(y + 1).min(scores.height());
        for wy in y0..y1 {
            for wx in x0..x1 {
                scores.put_pixel(wx, wy, Luma([f32::NEG_INFINITY]));
            }
        }
    }
    picks
}

/// Highest finite score, first in row-major order on ties.
fn peak(scores: &ScoreMap) -> Option<(u32, u32, f32)> {
    let mut best: Option<(u32, u32, f32)> = None;
    for (x, y, pixel) in scores.enumerate_pixels() {
        let value = pixel[0];
        if !value.is_finite() {
            continue;
        }
        if best.is_none_or(|(_, _, b)| value > b) {
            best = Some((x, y, value));
        }
    }
    best
}

/// Grey-level rendering of a score map for the image logger.
pub fn hotmap(scores: &ScoreMap) -> RgbImage {
    ImageBuffer::from_fn(scores.width(), scores.height(), |x, y| {
        let value = scores.get_pixel(x, y)[0];
        let level = if value.is_finite() {
            (value.clamp(0.0, 1.0) * 255.0) as u8
        } else {
            0
        };
        Rgb([level, level, level])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::types::Rect;

    fn cand(x: u32, y: u32, similarity: f64) -> Candidate {
        Candidate::new(Rect::new(x, y, 4, 4), similarity, "test")
    }

    #[test]
    fn test_rank_orders_and_breaks_ties_row_major() {
        let ranked = rank(vec![cand(5, 5, 0.9), cand(1, 9, 0.95), cand(7, 2, 0.9), cand(3, 2, 0.9)], 0.8);
        let locations: Vec<(u32, u32)> = ranked.iter().map(|c| (c.rect.x, c.rect.y)).collect();
        assert_eq!(locations, vec![(1, 9), (3, 2), (7, 2), (5, 5)]);
    }

    #[test]
    fn test_rank_keeps_single_closest_miss() {
        let ranked = rank(vec![cand(0, 0, 0.4), cand(2, 2, 0.6), cand(4, 4, 0.5)], 0.8);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].similarity, 0.6);
    }

    #[test]
    fn test_rank_drops_below_threshold_when_some_pass() {
        let ranked = rank(vec![cand(0, 0, 0.4), cand(2, 2, 0.85)], 0.8);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].similarity, 0.85);
        assert!(rank(Vec::new(), 0.8).is_empty());
    }

    #[test]
    fn test_pick_peaks_wipes_neighbourhood() {
        let mut scores = ScoreMap::from_pixel(20, 10, Luma([0.1]));
        scores.put_pixel(3, 3, Luma([0.95]));
        scores.put_pixel(4, 3, Luma([0.93]));
        scores.put_pixel(15, 6, Luma([0.9]));

        let picks = pick_peaks(&mut scores, 6, 6, 0.8);
        assert_eq!(picks.len(), 2);
        assert_eq!((picks[0].0, picks[0].1), (3, 3));
        assert_eq!((picks[1].0, picks[1].1), (15, 6));
    }

    #[test]
    fn test_pick_peaks_reports_closest_miss_once() {
        let mut scores = ScoreMap::from_pixel(5, 5, Luma([0.2]));
        scores.put_pixel(2, 1, Luma([0.5]));
        let picks = pick_peaks(&mut scores, 1, 1, 0.8);
        assert_eq!(picks, vec![(2, 1, 0.5)]);
    }

    #[test]
    fn test_pick_peaks_zero_threshold_single_pick() {
        let mut scores = ScoreMap::from_pixel(5, 5, Luma([0.3]));
        assert_eq!(pick_peaks(&mut scores, 1, 1, 0.0).len(), 1);
    }
}
