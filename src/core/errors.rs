// Custom error types for the detection and dispatch pipeline
//
// Every stage returns a typed error; only the HTTP boundary and the
// dispatcher envelope collapse them into wire data.

use thiserror::Error;

/// Region detection errors (model, decoder and coordinate mapping)
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("ONNX inference failed: {0}")]
    InferenceFailed(#[from] ort::Error),

    #[error("Detection model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Unexpected model output shape {shape:?} (expected rows of width {row_width})")]
    UnexpectedOutputShape { shape: Vec<usize>, row_width: usize },

    #[error("Invalid image dimensions: {width}x{height}")]
    InvalidImageSize { width: u32, height: u32 },

    #[error("Region [{x1}, {y1}, {x2}, {y2}] is empty inside a {width}x{height} image")]
    EmptyRegion {
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        width: u32,
        height: u32,
    },

    #[error("Task join failed: {0}")]
    TaskJoinFailed(String),
}

/// Errors turning caller-supplied bytes into an image
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Image data is empty")]
    Empty,

    #[error("Invalid base64 image data: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("Unreadable image: {0}")]
    InvalidImage(#[from] image::ImageError),
}

/// Content extractor errors (LLM backends, OCR engines)
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("{extractor} extractor is not configured (missing {missing})")]
    NotConfigured {
        extractor: &'static str,
        missing: &'static str,
    },

    #[error("Circuit breaker open for {service}, request rejected")]
    CircuitOpen { service: String },

    #[error("API request failed: {0}")]
    ApiRequestFailed(#[from] reqwest::Error),

    #[error("API returned status {status}: {body}")]
    ApiStatus { status: u16, body: String },

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),

    #[error("Extractor returned no content")]
    EmptyResult,

    #[error("OCR engine failed: {0}")]
    OcrFailed(String),

    #[error("Image encoding failed: {0}")]
    ImageEncoding(#[from] image::ImageError),
}

/// Annotation dispatch errors, one per pipeline stage
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unsupported annotation type")]
    UnsupportedType(String),

    #[error("Invalid annotation: {0}")]
    InvalidRequest(String),

    #[error("Error decoding image: {0}")]
    Decode(#[from] DecodeError),

    #[error("Error correcting orientation: {0}")]
    Orientation(String),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid detection config: {0}")]
    InvalidDetectionConfig(String),

    #[error("Invalid extractor config: {0}")]
    InvalidExtractorConfig(String),

    #[error("Confidence threshold must be in (0.0, 1.0], got {0}")]
    InvalidConfidenceThreshold(f32),

    #[error("IoU threshold must be in (0.0, 1.0], got {0}")]
    InvalidIoUThreshold(f32),

    #[error("ONNX pool size must be > 0, got {0}")]
    InvalidPoolSize(usize),
}

// Convenience type aliases for Results
pub type DetectResult<T> = Result<T, DetectionError>;
pub type DecodeResult<T> = Result<T, DecodeError>;
pub type ExtractResult<T> = Result<T, ExtractionError>;
pub type DispatchResult<T> = Result<T, DispatchError>;
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_type_message_is_stable() {
        let err = DispatchError::UnsupportedType("bogus".to_string());
        assert_eq!(err.to_string(), "Unsupported annotation type");
    }

    #[test]
    fn test_decode_error_names_the_stage() {
        let err = DispatchError::from(DecodeError::Empty);
        assert!(err.to_string().starts_with("Error decoding image: "));
    }
}
