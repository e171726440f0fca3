pub mod detection;
pub mod dispatch;
pub mod extraction;
pub mod onnx_builder; // Shared ONNX session builder with hardware acceleration fallback

// Re-export commonly used services
pub use detection::{OnnxDetectionModel, RegionDetector};
pub use dispatch::{AnnotationDispatcher, AnnotationEnvelope, ExtractionResult};
pub use extraction::{AnthropicClient, OpenAiClient};
