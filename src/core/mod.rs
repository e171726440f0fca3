pub mod annotation;
pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use annotation::{Annotation, AnnotationKind, AnnotationRequest, Rotation};
pub use config::Config;
pub use errors::{ConfigError, DecodeError, DetectionError, DispatchError, ExtractionError};
pub use types::{
    AppState, DetectionBox, DetectionResponse, DetectionResult, ImageSize, PixelBox, RegionClass,
};
