pub mod decoder;
pub mod geometry;
pub mod model;

use image::{DynamicImage, Rgba};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

use crate::core::annotation::Rotation;
use crate::core::config::DetectionConfig;
use crate::core::errors::{DetectResult, DetectionError};
use crate::core::types::{DetectionBox, DetectionResult, ImageSize};
use crate::utils::metrics::Metrics;

pub use decoder::{DecoderParams, NmsPolicy, RawDetections};
pub use geometry::{correct_tilt, crop_region, scale_box, TiltCorrection};
pub use model::{DetectionModel, OnnxDetectionModel};

/// One detected region cut from the high-resolution page
#[derive(Debug, Clone)]
pub struct RegionCrop {
    pub detection: DetectionBox,
    pub image: DynamicImage,
    pub tilt_corrected: bool,
}

#[derive(Debug, Clone)]
pub struct RegionCrops {
    /// In detection order
    pub crops: Vec<RegionCrop>,
    /// True if any crop was rotated to undo detector-flagged tilt
    pub tilt_corrected: bool,
    /// Detections that fell outside the high-resolution page and produced
    /// no crop
    pub skipped: usize,
}

/// Detect regions in page images and map them across resolutions
pub struct RegionDetector {
    model: Arc<dyn DetectionModel>,
    params: DecoderParams,
    crop_margin: u32,
    tilt_rotation: Rotation,
    metrics: Metrics,
}

impl RegionDetector {
    pub fn new(model: Arc<dyn DetectionModel>, config: &DetectionConfig, metrics: Metrics) -> Self {
        Self {
            model,
            params: DecoderParams {
                confidence_threshold: config.confidence_threshold,
                iou_threshold: config.iou_threshold,
                nms: config.nms_policy,
            },
            crop_margin: config.crop_margin,
            tilt_rotation: config.tilt_rotation,
            metrics,
        }
    }

    pub fn params(&self) -> &DecoderParams {
        &self.params
    }

    pub fn backend(&self) -> &str {
        self.model.backend()
    }

    /// Find classified boxes in `image`, in its own pixel space
    #[instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    pub fn detect(&self, image: &DynamicImage) -> DetectResult<DetectionResult> {
        let image_size = ImageSize::of(image);
        if image_size.width == 0 || image_size.height == 0 {
            return Err(DetectionError::InvalidImageSize {
                width: image_size.width,
                height: image_size.height,
            });
        }

        let detection_start = Instant::now();
        let model_size = self.model.input_size();
        let input = model::preprocess_image(image, model_size);
        let raw = self.model.infer(input)?;
        let result = decoder::decode(&raw, model_size, image_size, &self.params)?;

        let elapsed = detection_start.elapsed();
        self.metrics.record_detection(result.boxes.len(), elapsed);
        debug!(
            "✓ Detection completed in {:.2}ms: {} regions",
            elapsed.as_secs_f64() * 1000.0,
            result.boxes.len()
        );
        Ok(result)
    }

    /// Copy of `image` with every detected region painted white
    pub fn mask_detected_regions(&self, image: &DynamicImage) -> DetectResult<DynamicImage> {
        let result = self.detect(image)?;
        Ok(mask_boxes(image, &result.boxes))
    }

    /// Detect on `low_res`, then cut each region out of `high_res` with a
    /// margin, rotating regions the detector flagged as tilted.
    ///
    /// Regions that fall entirely outside `high_res` after scaling are
    /// skipped with a warning and counted in `skipped`.
    #[instrument(skip_all, fields(
        low = %format!("{}x{}", low_res.width(), low_res.height()),
        high = %format!("{}x{}", high_res.width(), high_res.height())
    ))]
    pub fn crop_regions_at_high_resolution(
        &self,
        low_res: &DynamicImage,
        high_res: &DynamicImage,
    ) -> DetectResult<RegionCrops> {
        let detections = self.detect(low_res)?;
        let from = detections.source_size();
        let tilt = TiltCorrection::Detected(self.tilt_rotation);

        let crops: Vec<RegionCrop> = detections
            .boxes
            .par_iter()
            .filter_map(|detection| {
                let correction = detection.is_tilted().then_some(tilt);
                match geometry::extract_region(high_res, detection.pixel_box(), from, self.crop_margin, correction) {
                    Ok(image) => Some(RegionCrop {
                        detection: detection.clone(),
                        image,
                        tilt_corrected: correction.is_some(),
                    }),
                    Err(e) => {
                        warn!("Skipping region {:?}: {}", detection.xyxy, e);
                        None
                    }
                }
            })
            .collect();

        let tilted = crops.iter().filter(|c| c.tilt_corrected).count();
        let skipped = detections.boxes.len() - crops.len();
        self.metrics.record_crops(crops.len(), tilted);

        Ok(RegionCrops {
            tilt_corrected: tilted > 0,
            crops,
            skipped,
        })
    }
}

/// Paint each box (corners inclusive) solid white on a copy of `image`
pub fn mask_boxes(image: &DynamicImage, boxes: &[DetectionBox]) -> DynamicImage {
    let mut masked = image.clone();
    let (max_x, max_y) = (image.width() as i64 - 1, image.height() as i64 - 1);
    for detection in boxes {
        let b = detection.pixel_box();
        if !b.is_valid() {
            continue;
        }
        // Clip in i64 so boxes spanning the whole i32 range stay representable
        let x1 = (b.x1 as i64).max(0);
        let y1 = (b.y1 as i64).max(0);
        let x2 = (b.x2 as i64).min(max_x);
        let y2 = (b.y2 as i64).min(max_y);
        if x2 < x1 || y2 < y1 {
            continue;
        }
        let rect = Rect::at(x1 as i32, y1 as i32).of_size((x2 - x1 + 1) as u32, (y2 - y1 + 1) as u32);
        draw_filled_rect_mut(&mut masked, rect, Rgba([255, 255, 255, 255]));
    }
    masked
}
