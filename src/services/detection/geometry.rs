// Box and image transforms between coordinate spaces
//
// Always applied in the same order: scale, crop with margin, rotate.

use image::DynamicImage;
use tracing::trace;

use crate::core::annotation::Rotation;
use crate::core::errors::{DetectResult, DetectionError};
use crate::core::types::{ImageSize, PixelBox};

/// Margin added around every crop unless configured otherwise
pub const DEFAULT_CROP_MARGIN: u32 = 25;

/// Counter-clockwise rotation applied to regions the detector flags as
/// tilted. Assumes tilted tables sit a quarter turn counter-clockwise on the page.
pub const DEFAULT_TILT_ROTATION: Rotation = Rotation::Deg270;

/// Why an image is being rotated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TiltCorrection {
    /// Detector classified the region as tilted; rotate by the given
    /// counter-clockwise amount
    Detected(Rotation),
    /// Caller's UI already rotated the image by this much; undo it
    Declared(Rotation),
}

impl TiltCorrection {
    pub fn detected() -> Self {
        Self::Detected(DEFAULT_TILT_ROTATION)
    }

    /// Counter-clockwise rotation this correction applies
    pub fn ccw_rotation(self) -> Rotation {
        match self {
            Self::Detected(rotation) => rotation,
            Self::Declared(rotation) => rotation.inverse(),
        }
    }
}

/// Map a box between two sizes of the same image. X and Y scale
/// independently; results truncate toward zero.
pub fn scale_box(bbox: PixelBox, from: ImageSize, to: ImageSize) -> DetectResult<PixelBox> {
    if from.width == 0 || from.height == 0 {
        return Err(DetectionError::InvalidImageSize {
            width: from.width,
            height: from.height,
        });
    }

    let scale = |v: i32, to: u32, from: u32| {
        (v as i64 * to as i64 / from as i64).clamp(i32::MIN as i64, i32::MAX as i64) as i32
    };
    let sx = |v: i32| scale(v, to.width, from.width);
    let sy = |v: i32| scale(v, to.height, from.height);

    Ok(PixelBox::new(sx(bbox.x1), sy(bbox.y1), sx(bbox.x2), sy(bbox.y2)))
}

/// Expand `bbox` by `margin` on every side and clamp it to the image.
/// Returns `(x, y, width, height)` of the surviving area.
pub fn clamp_with_margin(bbox: PixelBox, margin: u32, size: ImageSize) -> DetectResult<(u32, u32, u32, u32)> {
    let m = margin as i64;
    let x1 = (bbox.x1 as i64 - m).max(0);
    let y1 = (bbox.y1 as i64 - m).max(0);
    let x2 = (bbox.x2 as i64 + m).min(size.width as i64);
    let y2 = (bbox.y2 as i64 + m).min(size.height as i64);

    if x2 <= x1 || y2 <= y1 {
        return Err(DetectionError::EmptyRegion {
            x1: bbox.x1,
            y1: bbox.y1,
            x2: bbox.x2,
            y2: bbox.y2,
            width: size.width,
            height: size.height,
        });
    }

    Ok((x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32))
}

/// Crop `bbox` plus `margin`, tolerating boxes that spill past the edges
pub fn crop_region(image: &DynamicImage, bbox: PixelBox, margin: u32) -> DetectResult<DynamicImage> {
    let (x, y, width, height) = clamp_with_margin(bbox, margin, ImageSize::of(image))?;
    trace!("Cropping {}x{} at ({}, {}) for box {:?}", width, height, x, y, bbox);
    Ok(image.crop_imm(x, y, width, height))
}

/// Rotate counter-clockwise by a right angle. The canvas grows to fit.
pub fn rotate_ccw(image: DynamicImage, rotation: Rotation) -> DynamicImage {
    // image's rotateN helpers turn clockwise
    match rotation {
        Rotation::Deg0 => image,
        Rotation::Deg90 => image.rotate270(),
        Rotation::Deg180 => image.rotate180(),
        Rotation::Deg270 => image.rotate90(),
    }
}

pub fn correct_tilt(image: DynamicImage, correction: TiltCorrection) -> DynamicImage {
    rotate_ccw(image, correction.ccw_rotation())
}

/// Full mapping of a low-resolution box onto a high-resolution image
pub fn extract_region(
    high_res: &DynamicImage,
    bbox: PixelBox,
    from: ImageSize,
    margin: u32,
    tilt: Option<TiltCorrection>,
) -> DetectResult<DynamicImage> {
    let scaled = scale_box(bbox, from, ImageSize::of(high_res))?;
    let cropped = crop_region(high_res, scaled, margin)?;
    Ok(match tilt {
        Some(correction) => correct_tilt(cropped, correction),
        None => cropped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgba, RgbaImage};

    fn canvas(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255])))
    }

    #[test]
    fn test_scale_box_doubles() {
        let scaled = scale_box(
            PixelBox::new(10, 10, 50, 50),
            ImageSize::new(100, 100),
            ImageSize::new(200, 200),
        )
        .unwrap();
        assert_eq!(scaled.to_array(), [20, 20, 100, 100]);
    }

    #[test]
    fn test_scale_box_round_trip_within_a_pixel() {
        let low = ImageSize::new(640, 480);
        let high = ImageSize::new(2550, 3300);
        for b in [
            PixelBox::new(0, 0, 640, 480),
            PixelBox::new(13, 27, 301, 199),
            PixelBox::new(-20, -5, 17, 33),
        ] {
            let there = scale_box(b, low, high).unwrap();
            let back = scale_box(there, high, low).unwrap();
            for (orig, round) in b.to_array().iter().zip(back.to_array()) {
                assert!((orig - round).abs() <= 1, "{:?} -> {:?}", b, back);
            }
        }
    }

    #[test]
    fn test_scale_box_saturates_instead_of_wrapping() {
        let scaled = scale_box(
            PixelBox::new(i32::MIN, -1, i32::MAX, 1),
            ImageSize::new(1, 1),
            ImageSize::new(4, 4),
        )
        .unwrap();
        assert_eq!(scaled.to_array(), [i32::MIN, -4, i32::MAX, 4]);
    }

    #[test]
    fn test_scale_box_rejects_empty_source() {
        assert!(scale_box(PixelBox::new(0, 0, 1, 1), ImageSize::new(0, 10), ImageSize::new(5, 5)).is_err());
    }

    #[test]
    fn test_crop_region_adds_margin() {
        let img = canvas(200, 200);
        let crop = crop_region(&img, PixelBox::new(50, 60, 100, 120), 25).unwrap();
        assert_eq!(crop.dimensions(), (100, 110));
    }

    #[test]
    fn test_crop_region_clamps_out_of_bounds() {
        let img = canvas(100, 80);
        let crop = crop_region(&img, PixelBox::new(-40, 70, 30, 200), DEFAULT_CROP_MARGIN).unwrap();
        assert_eq!(crop.dimensions(), (55, 35));
    }

    #[test]
    fn test_crop_region_outside_image_is_empty() {
        let img = canvas(100, 100);
        let err = crop_region(&img, PixelBox::new(300, 300, 400, 400), 25).unwrap_err();
        assert!(matches!(err, DetectionError::EmptyRegion { .. }));
    }

    #[test]
    fn test_detected_tilt_swaps_dimensions() {
        let rotated = correct_tilt(canvas(30, 10), TiltCorrection::detected());
        assert_eq!(rotated.dimensions(), (10, 30));
    }

    #[test]
    fn test_rotate_then_inverse_restores_image() {
        let mut base = RgbaImage::from_pixel(4, 3, Rgba([0, 0, 0, 255]));
        base.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
        let img = DynamicImage::ImageRgba8(base);

        for degrees in [0, 90, 180, 270] {
            let r = Rotation::from_degrees(degrees).unwrap();
            let turned = rotate_ccw(img.clone(), r);
            if r.swaps_axes() {
                assert_eq!(turned.dimensions(), (3, 4));
            }
            let restored = correct_tilt(turned, TiltCorrection::Declared(r));
            assert_eq!(restored.dimensions(), (4, 3));
            assert_eq!(restored.to_rgba8(), img.to_rgba8());
        }
    }

    #[test]
    fn test_ccw_quarter_turn_moves_top_left_to_bottom_left() {
        let mut base = RgbaImage::from_pixel(4, 3, Rgba([0, 0, 0, 255]));
        base.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
        let turned = rotate_ccw(DynamicImage::ImageRgba8(base), Rotation::Deg90).to_rgba8();
        assert_eq!(turned.dimensions(), (3, 4));
        assert_eq!(turned.get_pixel(0, 3), &Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn test_extract_region_scales_crops_and_rotates() {
        let high = canvas(400, 400);
        let region = extract_region(
            &high,
            PixelBox::new(10, 10, 60, 30),
            ImageSize::new(100, 100),
            0,
            Some(TiltCorrection::detected()),
        )
        .unwrap();
        // 200x80 crop turned a quarter
        assert_eq!(region.dimensions(), (80, 200));
    }
}
