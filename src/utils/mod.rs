pub mod image_ops;
pub mod metrics;

// Re-export commonly used items
pub use image_ops::{
    decode_image_bytes,
    decode_image_data,
    encode_png,
    encode_png_base64,
    png_data_url,
    strip_data_url,
};
pub use metrics::Metrics;
