use base64::{engine::general_purpose, Engine as _};
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

use crate::core::errors::{DecodeError, DecodeResult};

/// Strip an optional `data:<mime>;base64,` prefix
pub fn strip_data_url(data: &str) -> &str {
    let trimmed = data.trim();
    if trimmed.starts_with("data:") {
        if let Some((_, payload)) = trimmed.split_once(',') {
            return payload;
        }
    }
    trimmed
}

/// Decode base64 image data, with or without a data-URL prefix
pub fn decode_image_data(data: &str) -> DecodeResult<DynamicImage> {
    let payload = strip_data_url(data);
    if payload.is_empty() {
        return Err(DecodeError::Empty);
    }
    // Some clients wrap long base64 payloads
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = general_purpose::STANDARD.decode(compact)?;
    decode_image_bytes(&bytes)
}

pub fn decode_image_bytes(bytes: &[u8]) -> DecodeResult<DynamicImage> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(image::load_from_memory(bytes)?)
}

pub fn encode_png(img: &DynamicImage) -> image::ImageResult<Vec<u8>> {
    let mut png_bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)?;
    Ok(png_bytes)
}

pub fn encode_png_base64(img: &DynamicImage) -> image::ImageResult<String> {
    Ok(general_purpose::STANDARD.encode(encode_png(img)?))
}

pub fn png_data_url(img: &DynamicImage) -> image::ImageResult<String> {
    Ok(format!("data:image/png;base64,{}", encode_png_base64(img)?))
}
