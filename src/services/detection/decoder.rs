// Raw detector tensor -> classified, deduplicated boxes
//
// Rows are `[cx, cy, w, h, objectness, class scores...]` in model-input
// pixels. The objectness column is ignored; confidence is the best class
// score.

use tracing::{debug, trace};

use crate::core::errors::{DetectResult, DetectionError};
use crate::core::types::{DetectionBox, DetectionResult, ImageSize, PixelBox, RegionClass};

/// Columns before the class scores: cx, cy, w, h, objectness
const BOX_COLUMNS: usize = 5;

/// How non-maximum suppression treats boxes of different classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NmsPolicy {
    /// Any two overlapping boxes compete regardless of class
    #[default]
    ClassAgnostic,
    /// Only boxes of the same class suppress each other
    PerClass,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecoderParams {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub nms: NmsPolicy,
}

impl Default for DecoderParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.35,
            iou_threshold: 0.45,
            nms: NmsPolicy::ClassAgnostic,
        }
    }
}

/// Raw model output, flattened, with its reported dimensions
#[derive(Debug, Clone)]
pub struct RawDetections {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl RawDetections {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }

    /// Row-major `[num_rows, row_width]` view, transposing when the model
    /// emits the class axis first (`[1, K, D]`).
    fn rows(&self, row_width: usize) -> DetectResult<Vec<Vec<f32>>> {
        let shape_error = || DetectionError::UnexpectedOutputShape {
            shape: self.shape.clone(),
            row_width,
        };

        let (a, b) = match self.shape.as_slice() {
            [1, a, b] | [a, b] => (*a, *b),
            _ => return Err(shape_error()),
        };

        if a * b != self.data.len() {
            return Err(shape_error());
        }

        if b == row_width {
            Ok(self.data.chunks_exact(row_width).map(<[f32]>::to_vec).collect())
        } else if a == row_width {
            trace!("Transposing detector output [{}, {}]", a, b);
            Ok((0..b)
                .map(|col| (0..a).map(|row| self.data[row * b + col]).collect())
                .collect())
        } else {
            Err(shape_error())
        }
    }
}

/// Greedy NMS. Input must already be sorted by confidence, descending.
/// Returns indices of the kept boxes in input order.
pub fn non_max_suppression(sorted: &[DetectionBox], iou_threshold: f32, policy: NmsPolicy) -> Vec<usize> {
    let boxes: Vec<PixelBox> = sorted.iter().map(DetectionBox::pixel_box).collect();
    let mut keep = Vec::new();
    let mut suppressed = vec![false; sorted.len()];
    let mut suppressed_count = 0;

    for i in 0..sorted.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(i);

        for j in (i + 1)..sorted.len() {
            if suppressed[j] {
                continue;
            }
            if policy == NmsPolicy::PerClass && sorted[i].class_id != sorted[j].class_id {
                continue;
            }
            let iou = boxes[i].iou(&boxes[j]);
            if iou > iou_threshold {
                suppressed[j] = true;
                suppressed_count += 1;
                trace!("NMS: Suppressed detection {} (IoU={:.3} with detection {})", j, iou, i);
            }
        }
    }

    debug!(
        "NMS: Kept {}/{} detections (suppressed {})",
        keep.len(),
        sorted.len(),
        suppressed_count
    );
    keep
}

/// Decode a raw tensor into boxes in the pixel space of `image_size`.
///
/// `model_size` is the spatial size the image was resized to before
/// inference. X and Y are scaled independently, so non-square pages keep
/// their aspect ratio. Coordinates are not clamped to the image.
pub fn decode(
    raw: &RawDetections,
    model_size: ImageSize,
    image_size: ImageSize,
    params: &DecoderParams,
) -> DetectResult<DetectionResult> {
    if model_size.width == 0 || model_size.height == 0 {
        return Err(DetectionError::InvalidImageSize {
            width: model_size.width,
            height: model_size.height,
        });
    }

    let row_width = BOX_COLUMNS + RegionClass::COUNT;
    let rows = raw.rows(row_width)?;
    trace!("Raw detections from model: {}", rows.len());

    let x_factor = image_size.width as f32 / model_size.width as f32;
    let y_factor = image_size.height as f32 / model_size.height as f32;

    let mut candidates = Vec::new();
    for row in &rows {
        let scores = &row[BOX_COLUMNS..];
        let (class_index, confidence) = scores
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, s)| if s > best.1 { (i, s) } else { best });

        // NaN scores never pass this comparison
        if !(confidence >= params.confidence_threshold) {
            continue;
        }
        let Some(class_id) = RegionClass::from_index(class_index) else {
            continue;
        };

        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
        // `as i32` truncates toward zero and saturates on overflow
        let x1 = ((cx - w / 2.0) * x_factor) as i32;
        let y1 = ((cy - h / 2.0) * y_factor) as i32;
        let width = (w * x_factor) as i32;
        let height = (h * y_factor) as i32;
        let bbox = PixelBox::new(x1, y1, x1.saturating_add(width), y1.saturating_add(height));

        if !bbox.is_valid() {
            trace!("Dropping degenerate box {:?} (conf={:.3})", bbox, confidence);
            continue;
        }
        candidates.push(DetectionBox::new(class_id, confidence, bbox));
    }

    debug!(
        "Filtered {} detections above confidence threshold {:.2}",
        candidates.len(),
        params.confidence_threshold
    );

    // Stable sort: equal confidences keep tensor order
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let keep = non_max_suppression(&candidates, params.iou_threshold, params.nms);
    let boxes = keep.into_iter().map(|i| candidates[i].clone()).collect();

    Ok(DetectionResult {
        boxes,
        source_width: image_size.width,
        source_height: image_size.height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const K: usize = BOX_COLUMNS + RegionClass::COUNT;

    fn row(cx: f32, cy: f32, w: f32, h: f32, scores: [f32; 3]) -> Vec<f32> {
        let mut r = vec![cx, cy, w, h, 1.0];
        r.extend_from_slice(&scores);
        r
    }

    fn tensor(rows: &[Vec<f32>]) -> RawDetections {
        RawDetections::new(vec![1, rows.len(), K], rows.concat())
    }

    fn square() -> ImageSize {
        ImageSize::new(640, 640)
    }

    #[test]
    fn test_confidence_threshold_is_a_hard_cut() {
        let raw = tensor(&[
            row(100.0, 100.0, 50.0, 50.0, [0.35, 0.0, 0.0]),
            row(300.0, 300.0, 50.0, 50.0, [0.3499, 0.0, 0.0]),
        ]);
        let result = decode(&raw, square(), square(), &DecoderParams::default()).unwrap();
        assert_eq!(result.boxes.len(), 1);
        assert_eq!(result.boxes[0].xyxy, [75, 75, 125, 125]);
    }

    #[test]
    fn test_overlapping_lower_box_suppressed() {
        // Two 100x100 boxes offset by 25px: IoU = 7500 / 12500 = 0.6
        let raw = tensor(&[
            row(150.0, 150.0, 100.0, 100.0, [0.4, 0.0, 0.0]),
            row(125.0, 150.0, 100.0, 100.0, [0.9, 0.0, 0.0]),
        ]);
        let a = PixelBox::new(100, 100, 200, 200);
        let b = PixelBox::new(75, 100, 175, 200);
        assert!((a.iou(&b) - 0.6).abs() < 1e-6);

        let result = decode(&raw, square(), square(), &DecoderParams::default()).unwrap();
        assert_eq!(result.boxes.len(), 1);
        assert_eq!(result.boxes[0].confidence, 0.9);
        assert_eq!(result.boxes[0].xyxy, b.to_array());
    }

    #[test]
    fn test_class_agnostic_suppresses_across_classes() {
        let rows = [
            row(150.0, 150.0, 100.0, 100.0, [0.9, 0.0, 0.0]),
            row(155.0, 150.0, 100.0, 100.0, [0.0, 0.8, 0.0]),
        ];
        let agnostic = decode(&tensor(&rows), square(), square(), &DecoderParams::default()).unwrap();
        assert_eq!(agnostic.boxes.len(), 1);
        assert_eq!(agnostic.boxes[0].class_id, RegionClass::Normal);

        let params = DecoderParams {
            nms: NmsPolicy::PerClass,
            ..DecoderParams::default()
        };
        let per_class = decode(&tensor(&rows), square(), square(), &params).unwrap();
        assert_eq!(per_class.boxes.len(), 2);
        assert_eq!(per_class.boxes[1].class_id, RegionClass::Tilted);
    }

    #[test]
    fn test_equal_confidence_keeps_earlier_row() {
        let raw = tensor(&[
            row(150.0, 150.0, 100.0, 100.0, [0.7, 0.0, 0.0]),
            row(152.0, 150.0, 100.0, 100.0, [0.0, 0.7, 0.0]),
        ]);
        let result = decode(&raw, square(), square(), &DecoderParams::default()).unwrap();
        assert_eq!(result.boxes.len(), 1);
        assert_eq!(result.boxes[0].class_id, RegionClass::Normal);
        assert_eq!(result.boxes[0].xyxy, [100, 100, 200, 200]);
    }

    #[test]
    fn test_iou_exactly_at_threshold_survives() {
        // [0, 0, 100, 100] and [0, 0, 100, 50]: IoU = 5000 / 10000 = 0.5
        let rows = [
            row(50.0, 50.0, 100.0, 100.0, [0.9, 0.0, 0.0]),
            row(50.0, 25.0, 100.0, 50.0, [0.8, 0.0, 0.0]),
        ];
        let at = DecoderParams {
            iou_threshold: 0.5,
            ..DecoderParams::default()
        };
        let kept = decode(&tensor(&rows), square(), square(), &at).unwrap();
        assert_eq!(kept.boxes.len(), 2);
        assert_eq!(kept.boxes[0].pixel_box().iou(&kept.boxes[1].pixel_box()), 0.5);

        let below = DecoderParams {
            iou_threshold: 0.49,
            ..DecoderParams::default()
        };
        let suppressed = decode(&tensor(&rows), square(), square(), &below).unwrap();
        assert_eq!(suppressed.boxes.len(), 1);
        assert_eq!(suppressed.boxes[0].confidence, 0.9);
    }

    #[test]
    fn test_independent_axis_scaling() {
        let raw = tensor(&[row(320.0, 320.0, 64.0, 64.0, [0.0, 0.0, 0.9])]);
        let result = decode(&raw, square(), ImageSize::new(1280, 320), &DecoderParams::default()).unwrap();
        let b = &result.boxes[0];
        assert_eq!(b.class_id, RegionClass::Empty);
        assert_eq!(b.xyxy, [576, 144, 704, 176]);
        assert_eq!(b.xywh, [640.0, 160.0, 128.0, 32.0]);
        assert_eq!((result.source_width, result.source_height), (1280, 320));
    }

    #[test]
    fn test_transposed_layout_matches_row_layout() {
        let rows = [
            row(100.0, 100.0, 40.0, 40.0, [0.9, 0.1, 0.0]),
            row(400.0, 300.0, 80.0, 60.0, [0.1, 0.6, 0.0]),
            row(500.0, 500.0, 20.0, 20.0, [0.1, 0.1, 0.1]),
        ];
        let row_major = tensor(&rows);

        let d = rows.len();
        let mut transposed = vec![0.0; d * K];
        for (r, values) in rows.iter().enumerate() {
            for (c, v) in values.iter().enumerate() {
                transposed[c * d + r] = *v;
            }
        }
        let column_major = RawDetections::new(vec![1, K, d], transposed);

        let params = DecoderParams::default();
        let a = decode(&row_major, square(), square(), &params).unwrap();
        let b = decode(&column_major, square(), square(), &params).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.boxes.len(), 2);
    }

    #[test]
    fn test_unexpected_shape_is_an_error() {
        let raw = RawDetections::new(vec![1, 4, 6], vec![0.0; 24]);
        let err = decode(&raw, square(), square(), &DecoderParams::default()).unwrap_err();
        assert!(matches!(err, DetectionError::UnexpectedOutputShape { row_width: 8, .. }));

        let mismatched = RawDetections::new(vec![1, 2, K], vec![0.0; K]);
        assert!(decode(&mismatched, square(), square(), &DecoderParams::default()).is_err());
    }

    #[test]
    fn test_no_boxes_is_empty_not_error() {
        let raw = tensor(&[row(100.0, 100.0, 10.0, 10.0, [0.1, 0.1, 0.1])]);
        let result = decode(&raw, square(), square(), &DecoderParams::default()).unwrap();
        assert!(result.boxes.is_empty());

        let none = RawDetections::new(vec![1, 0, K], Vec::new());
        assert!(decode(&none, square(), square(), &DecoderParams::default())
            .unwrap()
            .boxes
            .is_empty());
    }

    #[test]
    fn test_coordinates_are_not_clamped() {
        let raw = tensor(&[row(5.0, 5.0, 40.0, 40.0, [0.9, 0.0, 0.0])]);
        let result = decode(&raw, square(), square(), &DecoderParams::default()).unwrap();
        assert_eq!(result.boxes[0].xyxy, [-15, -15, 25, 25]);
    }

    #[test]
    fn test_degenerate_boxes_dropped() {
        let raw = tensor(&[row(100.0, 100.0, 0.5, 30.0, [0.9, 0.0, 0.0])]);
        let result = decode(&raw, square(), square(), &DecoderParams::default()).unwrap();
        assert!(result.boxes.is_empty());
    }

    #[test]
    fn test_random_tensors_satisfy_output_invariants() {
        let mut rng = StdRng::seed_from_u64(7);
        let params = DecoderParams::default();

        for _ in 0..50 {
            let n = rng.gen_range(0..60);
            let rows: Vec<Vec<f32>> = (0..n)
                .map(|_| {
                    row(
                        rng.gen_range(0.0..640.0),
                        rng.gen_range(0.0..640.0),
                        rng.gen_range(1.0..200.0),
                        rng.gen_range(1.0..200.0),
                        [rng.gen(), rng.gen(), rng.gen()],
                    )
                })
                .collect();
            let image = ImageSize::new(rng.gen_range(100..3000), rng.gen_range(100..3000));
            let result = decode(&tensor(&rows), square(), image, &params).unwrap();

            for pair in result.boxes.windows(2) {
                assert!(pair[0].confidence >= pair[1].confidence);
            }
            for (i, a) in result.boxes.iter().enumerate() {
                assert!(a.confidence >= params.confidence_threshold);
                let pa = a.pixel_box();
                assert!(pa.is_valid());
                assert_eq!(a.xywh, pa.xywh());
                // Exact ties survive NMS
                for b in &result.boxes[i + 1..] {
                    assert!(pa.iou(&b.pixel_box()) <= params.iou_threshold);
                }
            }
        }
    }
}
