use anyhow::{Context, Result};
use image::DynamicImage;
use ndarray::Array4;
use ort::value::Tensor;
use rayon::prelude::*;
use tracing::{debug, info, trace};

use crate::core::config::DetectionConfig;
use crate::core::errors::{DetectResult, DetectionError};
use crate::core::types::ImageSize;
use crate::services::detection::decoder::RawDetections;
use crate::services::onnx_builder::{build_session_with_acceleration, OnnxSessionPool};

/// A detector network: NCHW float batch in, raw detection tensor out.
///
/// Implementations must be shareable across request tasks; inference is
/// called from blocking worker threads.
pub trait DetectionModel: Send + Sync {
    /// Spatial size images are resized to before inference
    fn input_size(&self) -> ImageSize;

    fn infer(&self, input: Array4<f32>) -> DetectResult<RawDetections>;

    fn backend(&self) -> &str {
        "custom"
    }
}

/// Resize to the model input, RGB channel order, scale to [0, 1], NCHW
pub fn preprocess_image(img: &DynamicImage, size: ImageSize) -> Array4<f32> {
    trace!(
        "Preprocessing image: {}x{} → {}x{}",
        img.width(),
        img.height(),
        size.width,
        size.height
    );

    let resized = img.resize_exact(size.width, size.height, image::imageops::FilterType::Triangle);
    let rgb_img = resized.to_rgb8();

    let (w, h) = (size.width as usize, size.height as usize);
    let mut array = Array4::<f32>::zeros((1, 3, h, w));

    for (x, y, pixel) in rgb_img.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        array[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
        array[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
        array[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
    }

    debug!("✓ Image preprocessed: array shape=[1, 3, {}, {}]", h, w);
    array
}

/// Region detector backed by ONNX Runtime
pub struct OnnxDetectionModel {
    pool: OnnxSessionPool,
    input_name: String,
    input_size: ImageSize,
    device_type: String,
}

impl OnnxDetectionModel {
    /// Load the model file and build `onnx_pool_size` sessions
    pub fn load(config: &DetectionConfig) -> Result<Self> {
        let model_bytes = std::fs::read(&config.detector_model_path).with_context(|| {
            format!("Failed to read detector model at {}", config.detector_model_path)
        })?;
        info!(
            "Loading ONNX detector model ({} bytes) from {}",
            model_bytes.len(),
            config.detector_model_path
        );
        Self::from_bytes(&model_bytes, config)
    }

    pub fn from_bytes(model_bytes: &[u8], config: &DetectionConfig) -> Result<Self> {
        let backend = config.inference_backend.as_deref();
        let pool_size = config.onnx_pool_size.max(1);

        let (device_type, first) = build_session_with_acceleration(model_bytes, "region detector", backend)?;

        let input = first
            .inputs
            .first()
            .context("Detector model declares no inputs")?;
        let input_name = input.name.clone();

        // [N, C, H, W]; dynamic dims are reported as -1
        let input_size = match input.input_type.tensor_shape().map(|s| s.to_vec()).as_deref() {
            Some([_, _, h, w]) if *h > 0 && *w > 0 => ImageSize::new(*w as u32, *h as u32),
            _ => ImageSize::new(config.target_size, config.target_size),
        };
        debug!(
            "Detector input '{}' at {}x{}",
            input_name, input_size.width, input_size.height
        );

        // Remaining sessions in parallel for faster startup
        let mut sessions = (1..pool_size)
            .into_par_iter()
            .map(|i| {
                debug!("Creating session {} of {}", i + 1, pool_size);
                build_session_with_acceleration(model_bytes, "region detector", backend)
                    .map(|(_, session)| session)
            })
            .collect::<Result<Vec<_>>>()?;
        sessions.insert(0, first);

        info!("✓ Detection: {} ({} sessions)", device_type, pool_size);

        Ok(Self {
            pool: OnnxSessionPool::new(sessions),
            input_name,
            input_size,
            device_type,
        })
    }
}

impl DetectionModel for OnnxDetectionModel {
    fn input_size(&self) -> ImageSize {
        self.input_size
    }

    fn infer(&self, input: Array4<f32>) -> DetectResult<RawDetections> {
        let inference_start = std::time::Instant::now();
        let tensor = Tensor::from_array(input)?;

        let mut session = self.pool.acquire()?;
        let outputs = session.run(ort::inputs![self.input_name.as_str() => tensor])?;
        if outputs.len() == 0 {
            return Err(DetectionError::ModelUnavailable(
                "detector produced no outputs".to_string(),
            ));
        }

        let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;
        let raw = RawDetections::new(
            shape.iter().map(|&d| d.max(0) as usize).collect(),
            data.to_vec(),
        );

        debug!(
            "✓ Inference completed in {:.2}ms on {}",
            inference_start.elapsed().as_secs_f64() * 1000.0,
            self.device_type
        );
        Ok(raw)
    }

    fn backend(&self) -> &str {
        &self.device_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_preprocess_layout_and_scale() {
        let mut img = RgbImage::from_pixel(4, 2, Rgb([255, 0, 51]));
        img.put_pixel(3, 1, Rgb([0, 255, 0]));
        let array = preprocess_image(&DynamicImage::ImageRgb8(img), ImageSize::new(4, 2));

        assert_eq!(array.shape(), &[1, 3, 2, 4]);
        assert_eq!(array[[0, 0, 0, 0]], 1.0);
        assert_eq!(array[[0, 1, 0, 0]], 0.0);
        assert!((array[[0, 2, 0, 0]] - 0.2).abs() < 1e-6);
        assert_eq!(array[[0, 0, 1, 3]], 0.0);
        assert_eq!(array[[0, 1, 1, 3]], 1.0);
    }

    #[test]
    fn test_preprocess_resizes_to_model_input() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(300, 100));
        let array = preprocess_image(&img, ImageSize::new(64, 32));
        assert_eq!(array.shape(), &[1, 3, 32, 64]);
    }

    #[test]
    fn test_missing_model_file_is_an_error() {
        let config = crate::core::config::Config::default();
        let mut detection = config.detection.clone();
        detection.detector_model_path = "does/not/exist.onnx".to_string();
        assert!(OnnxDetectionModel::load(&detection).is_err());
    }
}
