// Shared detection types and application state

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::config::Config;
use crate::middleware::CircuitBreaker;
use crate::services::detection::RegionDetector;
use crate::services::dispatch::AnnotationDispatcher;
use crate::utils::metrics::Metrics;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub detector: Arc<RegionDetector>,
    pub dispatcher: Arc<AnnotationDispatcher>,
    /// One breaker per extractor backend, for health reporting
    pub circuit_breakers: Vec<CircuitBreaker>,
    pub metrics: Metrics,
}

/// Detector class labels (0=table, 1=tilted table, 2=empty)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum RegionClass {
    Normal = 0,
    Tilted = 1,
    Empty = 2,
}

impl RegionClass {
    /// Number of class score columns the detector emits
    pub const COUNT: usize = 3;

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Normal),
            1 => Some(Self::Tilted),
            2 => Some(Self::Empty),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Normal => "table",
            Self::Tilted => "tilted",
            Self::Empty => "empty",
        }
    }
}

impl From<RegionClass> for u8 {
    fn from(class: RegionClass) -> Self {
        class as u8
    }
}

impl TryFrom<u8> for RegionClass {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_index(value as usize).ok_or_else(|| format!("unknown region class {}", value))
    }
}

/// Width and height of an image or model input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn of(img: &image::DynamicImage) -> Self {
        Self::new(img.width(), img.height())
    }
}

/// Integer pixel box in corner form. Not clamped to any image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl PixelBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn from_array(xyxy: [i32; 4]) -> Self {
        Self::new(xyxy[0], xyxy[1], xyxy[2], xyxy[3])
    }

    pub fn to_array(self) -> [i32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    pub fn width(&self) -> i32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> i32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn is_valid(&self) -> bool {
        self.x1 < self.x2 && self.y1 < self.y2
    }

    /// Centre and extents
    pub fn xywh(&self) -> [f32; 4] {
        let w = self.width() as f32;
        let h = self.height() as f32;
        [self.x1 as f32 + w / 2.0, self.y1 as f32 + h / 2.0, w, h]
    }

    pub fn iou(&self, other: &PixelBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        // i64 so page-sized boxes at high resolution cannot overflow
        let intersection = ((x2 as i64 - x1 as i64) * (y2 as i64 - y1 as i64)) as f32;
        let area1 = (self.width() as i64 * self.height() as i64) as f32;
        let area2 = (other.width() as i64 * other.height() as i64) as f32;
        let union = area1 + area2 - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// A single classified detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub class_id: RegionClass,
    pub xyxy: [i32; 4],
    pub xywh: [f32; 4],
    pub confidence: f32,
}

impl DetectionBox {
    pub fn new(class_id: RegionClass, confidence: f32, bbox: PixelBox) -> Self {
        Self {
            class_id,
            xyxy: bbox.to_array(),
            xywh: bbox.xywh(),
            confidence,
        }
    }

    pub fn pixel_box(&self) -> PixelBox {
        PixelBox::from_array(self.xyxy)
    }

    pub fn is_tilted(&self) -> bool {
        self.class_id == RegionClass::Tilted
    }
}

/// Boxes found in one image, highest confidence first
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub boxes: Vec<DetectionBox>,
    pub source_width: u32,
    pub source_height: u32,
}

impl DetectionResult {
    pub fn source_size(&self) -> ImageSize {
        ImageSize::new(self.source_width, self.source_height)
    }
}

/// Wire shape of a detection result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResponse {
    pub bbox_data: Vec<DetectionBox>,
    pub num_detections: usize,
    pub width: u32,
    pub height: u32,
}

impl From<DetectionResult> for DetectionResponse {
    fn from(result: DetectionResult) -> Self {
        Self {
            num_detections: result.boxes.len(),
            width: result.source_width,
            height: result.source_height,
            bbox_data: result.boxes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_identical_and_disjoint() {
        let a = PixelBox::new(0, 0, 10, 10);
        let b = PixelBox::new(20, 20, 30, 30);
        assert_eq!(a.iou(&a), 1.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_half_overlap() {
        let a = PixelBox::new(0, 0, 10, 10);
        let b = PixelBox::new(5, 0, 15, 10);
        // 50 / (100 + 100 - 50)
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_xywh_is_centre_form() {
        let b = PixelBox::new(10, 20, 50, 100);
        assert_eq!(b.xywh(), [30.0, 60.0, 40.0, 80.0]);
    }

    #[test]
    fn test_region_class_serializes_as_integer() {
        let det = DetectionBox::new(RegionClass::Tilted, 0.9, PixelBox::new(1, 2, 3, 4));
        let json = serde_json::to_value(&det).unwrap();
        assert_eq!(json["class_id"], 1);
        assert_eq!(json["xyxy"], serde_json::json!([1, 2, 3, 4]));

        let back: DetectionBox = serde_json::from_value(json).unwrap();
        assert_eq!(back.class_id, RegionClass::Tilted);
        assert!(serde_json::from_value::<RegionClass>(serde_json::json!(7)).is_err());
    }

    #[test]
    fn test_detection_response_counts_boxes() {
        let result = DetectionResult {
            boxes: vec![DetectionBox::new(RegionClass::Normal, 0.5, PixelBox::new(0, 0, 5, 5))],
            source_width: 100,
            source_height: 80,
        };
        let response = DetectionResponse::from(result);
        assert_eq!(response.num_detections, 1);
        assert_eq!((response.width, response.height), (100, 80));
    }
}
