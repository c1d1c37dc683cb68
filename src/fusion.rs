//! Detection fusion.
//!
//! Pure functions that turn per-anchor detector rows into a minimal set of
//! non-duplicate objects:
//! - `overlap_ratio`: intersection-over-union on the inclusive pixel grid
//! - `classify`: best class of a score vector (first index wins ties)
//! - `fuse`: greedy, arrival-order merge of overlapping candidates
//!
//! `fuse` is not non-max-suppression. Every incoming candidate is compared
//! against all entries accumulated so far (including those added earlier in
//! the same pass), so dense clusters of mutually overlapping boxes can resolve
//! differently depending on arrival order. Callers must not reorder candidates
//! before fusing.

/// Overlap above which two boxes are treated as the same object.
pub const DEFAULT_OVERLAP_THRESHOLD: f64 = 0.7;

/// Axis-aligned box in pixel units.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundingBox {
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub fn new(left: i32, top: i32, width: i32, height: i32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// Build a pixel box from normalized center/size geometry.
    ///
    /// Each term is truncated to whole pixels before the half-size offset is
    /// applied, so `left = trunc(cx * W) - trunc(w * W) / 2`.
    pub fn from_normalized(
        center_x: f32,
        center_y: f32,
        width: f32,
        height: f32,
        frame_width: u32,
        frame_height: u32,
    ) -> Self {
        let cx = (center_x * frame_width as f32) as i32;
        let cy = (center_y * frame_height as f32) as i32;
        let w = (width * frame_width as f32) as i32;
        let h = (height * frame_height as f32) as i32;
        Self {
            left: cx - w / 2,
            top: cy - h / 2,
            width: w,
            height: h,
        }
    }

    pub fn right(&self) -> i32 {
        self.left + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.top + self.height
    }

    /// Zero or negative extent on either axis.
    pub fn is_degenerate(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }
}

/// Intersection-over-union of two boxes.
///
/// Uses inclusive pixel bounds (`+1` on the overlap and area terms). Disjoint
/// boxes and degenerate boxes both score exactly 0.
pub fn overlap_ratio(a: &BoundingBox, b: &BoundingBox) -> f64 {
    if a.is_degenerate() || b.is_degenerate() {
        return 0.0;
    }

    let x_a = a.left.max(b.left) as f64;
    let y_a = a.top.max(b.top) as f64;
    let x_b = a.right().min(b.right()) as f64;
    let y_b = a.bottom().min(b.bottom()) as f64;

    let inter_area = (x_b - x_a + 1.0).max(0.0) * (y_b - y_a + 1.0).max(0.0);
    if inter_area == 0.0 {
        return 0.0;
    }

    let area_a = (a.width as f64 + 1.0) * (a.height as f64 + 1.0);
    let area_b = (b.width as f64 + 1.0) * (b.height as f64 + 1.0);
    let union = area_a + area_b - inter_area;
    if union <= 0.0 {
        return 0.0;
    }

    inter_area / union
}

/// Resolve a score vector to `(class_index, confidence)`.
///
/// Strict `>` scan starting from 0.0: the earliest index reaching the maximum
/// wins, and an empty (or all non-positive) vector yields `(0, 0.0)`.
pub fn classify(scores: &[f32]) -> (usize, f32) {
    let mut best = 0usize;
    let mut max = 0.0f32;
    for (i, &score) in scores.iter().enumerate() {
        if score > max {
            max = score;
            best = i;
        }
    }
    (best, max)
}

/// Single-class resolution of one raw detector row.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Candidate {
    pub class_index: usize,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Fused object with its human-readable label.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectedObject {
    pub class_index: usize,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    /// `"{class} - {percent}%"`
    pub label: String,
}

impl DetectedObject {
    pub fn from_candidate(candidate: Candidate, class_name: String) -> Self {
        let label = format!(
            "{} - {}%",
            class_name,
            (100.0 * candidate.confidence) as i32
        );
        Self {
            class_index: candidate.class_index,
            class_name,
            confidence: candidate.confidence,
            bbox: candidate.bbox,
            label,
        }
    }
}

/// Anything `fuse` can merge.
pub trait Fusable {
    fn bbox(&self) -> &BoundingBox;
    fn confidence(&self) -> f32;
}

impl Fusable for Candidate {
    fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    fn confidence(&self) -> f32 {
        self.confidence
    }
}

impl Fusable for DetectedObject {
    fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    fn confidence(&self) -> f32 {
        self.confidence
    }
}

/// Greedy arrival-order merge.
///
/// For each item: when it overlaps an accumulated entry by more than
/// `overlap_threshold` it is a duplicate of that entry and replaces it only
/// when strictly more confident; it is never inserted separately. An item that
/// overlaps no entry is appended. Confidence filtering is the caller's job.
pub fn fuse<T, I>(items: I, overlap_threshold: f64) -> Vec<T>
where
    T: Fusable + Clone,
    I: IntoIterator<Item = T>,
{
    let mut fused: Vec<T> = Vec::new();

    for item in items {
        if fused.is_empty() {
            fused.push(item);
            continue;
        }

        let mut is_new = true;
        for entry in fused.iter_mut() {
            if overlap_ratio(item.bbox(), entry.bbox()) > overlap_threshold {
                is_new = false;
                if item.confidence() > entry.confidence() {
                    *entry = item.clone();
                }
            }
        }

        if is_new {
            fused.push(item);
        }
    }

    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(conf: f32, left: i32, top: i32, w: i32, h: i32) -> Candidate {
        Candidate {
            class_index: 0,
            confidence: conf,
            bbox: BoundingBox::new(left, top, w, h),
        }
    }

    #[test]
    fn overlap_ratio_is_symmetric() {
        let boxes = [
            BoundingBox::new(0, 0, 10, 10),
            BoundingBox::new(5, 5, 10, 10),
            BoundingBox::new(3, -2, 40, 7),
            BoundingBox::new(100, 100, 1, 1),
            BoundingBox::new(0, 0, 0, 10),
        ];
        for a in &boxes {
            for b in &boxes {
                assert_eq!(overlap_ratio(a, b), overlap_ratio(b, a));
            }
        }
    }

    #[test]
    fn overlap_ratio_of_box_with_itself_is_one() {
        let a = BoundingBox::new(12, 40, 33, 17);
        assert_eq!(overlap_ratio(&a, &a), 1.0);
    }

    #[test]
    fn disjoint_boxes_do_not_overlap() {
        let a = BoundingBox::new(0, 0, 10, 10);
        let b = BoundingBox::new(50, 50, 10, 10);
        assert_eq!(overlap_ratio(&a, &b), 0.0);
    }

    #[test]
    fn overlap_uses_inclusive_pixel_bounds() {
        // 11x11 pixel boxes sharing a 6x11 column strip.
        let a = BoundingBox::new(0, 0, 10, 10);
        let b = BoundingBox::new(5, 0, 10, 10);
        let expected = 66.0 / (121.0 + 121.0 - 66.0);
        assert!((overlap_ratio(&a, &b) - expected).abs() < 1e-12);
    }

    #[test]
    fn degenerate_boxes_score_zero() {
        let a = BoundingBox::new(0, 0, 0, 0);
        assert_eq!(overlap_ratio(&a, &a), 0.0);
        let b = BoundingBox::new(0, 0, 10, -3);
        assert_eq!(overlap_ratio(&b, &BoundingBox::new(0, 0, 10, 10)), 0.0);
    }

    #[test]
    fn classify_picks_best_score() {
        assert_eq!(classify(&[0.1, 0.9, 0.3]), (1, 0.9));
    }

    #[test]
    fn classify_empty_scores() {
        assert_eq!(classify(&[]), (0, 0.0));
    }

    #[test]
    fn classify_ties_favor_earliest_index() {
        assert_eq!(classify(&[0.5, 0.5]), (0, 0.5));
        assert_eq!(classify(&[0.2, 0.7, 0.7]), (1, 0.7));
    }

    #[test]
    fn from_normalized_truncates_like_pixel_grid() {
        let b = BoundingBox::from_normalized(0.5, 0.5, 0.25, 0.5, 640, 480);
        assert_eq!(b, BoundingBox::new(320 - 80, 240 - 120, 160, 240));
    }

    #[test]
    fn fuse_keeps_higher_confidence_duplicate() {
        let fused = fuse(
            vec![cand(0.8, 10, 10, 100, 100), cand(0.95, 12, 11, 100, 100)],
            DEFAULT_OVERLAP_THRESHOLD,
        );
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].confidence, 0.95);
        assert_eq!(fused[0].bbox, BoundingBox::new(12, 11, 100, 100));
    }

    #[test]
    fn fuse_does_not_replace_with_lower_confidence() {
        let fused = fuse(
            vec![cand(0.95, 10, 10, 100, 100), cand(0.8, 12, 11, 100, 100)],
            DEFAULT_OVERLAP_THRESHOLD,
        );
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].confidence, 0.95);
    }

    #[test]
    fn fuse_keeps_separate_objects() {
        let fused = fuse(
            vec![
                cand(0.8, 0, 0, 50, 50),
                cand(0.9, 200, 200, 50, 50),
                cand(0.85, 30, 0, 50, 50),
            ],
            DEFAULT_OVERLAP_THRESHOLD,
        );
        assert_eq!(fused.len(), 3);
        assert_eq!(fused[1].confidence, 0.9);
    }

    #[test]
    fn fuse_is_idempotent_on_its_output() {
        let input = vec![
            cand(0.8, 10, 10, 100, 100),
            cand(0.95, 12, 11, 100, 100),
            cand(0.77, 400, 300, 60, 80),
            cand(0.9, 402, 301, 60, 80),
            cand(0.99, 700, 10, 20, 20),
        ];
        let once = fuse(input, DEFAULT_OVERLAP_THRESHOLD);
        let twice = fuse(once.clone(), DEFAULT_OVERLAP_THRESHOLD);
        assert_eq!(once, twice);
        assert_eq!(once.len(), 3);
    }

    #[test]
    fn fuse_depends_on_arrival_order_for_chains() {
        // a overlaps b, b overlaps c, a does not overlap c.
        let a = cand(0.80, 0, 0, 100, 100);
        let b = cand(0.90, 12, 0, 100, 100);
        let c = cand(0.85, 24, 0, 100, 100);
        assert!(overlap_ratio(&a.bbox, &b.bbox) > DEFAULT_OVERLAP_THRESHOLD);
        assert!(overlap_ratio(&b.bbox, &c.bbox) > DEFAULT_OVERLAP_THRESHOLD);
        assert!(overlap_ratio(&a.bbox, &c.bbox) <= DEFAULT_OVERLAP_THRESHOLD);

        let forward = fuse(vec![a, b, c], DEFAULT_OVERLAP_THRESHOLD);
        assert_eq!(forward, vec![b]);

        let reordered = fuse(vec![a, c, b], DEFAULT_OVERLAP_THRESHOLD);
        assert_eq!(reordered.len(), 2);
    }

    #[test]
    fn detected_object_label_truncates_percent() {
        let obj = DetectedObject::from_candidate(cand(0.876, 0, 0, 1, 1), "bird".to_string());
        assert_eq!(obj.label, "bird - 87%");
    }
}
