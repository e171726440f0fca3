// Library exports for region detection and annotation dispatch
//
// Detection maps a page image to classified table regions; dispatch routes
// user-confirmed annotations to the matching content extractor.

// Core modules
pub mod core;
pub mod middleware;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use core::{
    annotation::{Annotation, AnnotationKind, AnnotationRequest, Rotation},
    config::Config,
    errors::{ConfigError, DecodeError, DetectionError, DispatchError, ExtractionError},
    types::{AppState, DetectionBox, DetectionResponse, DetectionResult, ImageSize, PixelBox, RegionClass},
};

pub use middleware::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

pub use services::detection::{DecoderParams, DetectionModel, NmsPolicy, RegionCrop, RegionCrops};
pub use services::{AnnotationDispatcher, AnnotationEnvelope, ExtractionResult, OnnxDetectionModel, RegionDetector};

pub use utils::{Metrics, decode_image_data};
