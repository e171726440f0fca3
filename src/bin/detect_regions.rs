//! Run the region detector on a page image and print the detection JSON.
//! Run with: cargo run --release --bin detect_regions -- <low_res> [high_res] [out_dir]
//!
//! With a high-resolution image, crops are written to `out_dir`
//! (default `crops/`) as PNG files, tilted regions already corrected.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use region_dispatch::core::types::DetectionResponse;
use region_dispatch::core::Config;
use region_dispatch::services::detection::{OnnxDetectionModel, RegionDetector};
use region_dispatch::utils::Metrics;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("region_dispatch::services::detection=debug,ort=off")
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let Some(low_path) = args.get(1) else {
        bail!("usage: detect_regions <low_res> [high_res] [out_dir]");
    };
    if !Path::new(low_path).exists() {
        bail!("Image not found: {}", low_path);
    }

    let config = Config::new()?;
    let model = OnnxDetectionModel::load(&config.detection)?;
    let detector = RegionDetector::new(Arc::new(model), &config.detection, Metrics::new());

    info!("Loading image: {}", low_path);
    let low = image::open(low_path).with_context(|| format!("Failed to open {}", low_path))?;
    info!("Image dimensions: {}x{}", low.width(), low.height());

    let Some(high_path) = args.get(2) else {
        let result = detector.detect(&low)?;
        println!("{}", serde_json::to_string_pretty(&DetectionResponse::from(result))?);
        return Ok(());
    };

    let high = image::open(high_path).with_context(|| format!("Failed to open {}", high_path))?;
    let out_dir = args.get(3).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("crops"));
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let result = detector.crop_regions_at_high_resolution(&low, &high)?;
    println!("\n=== Crops ===");
    println!("Tilt corrected: {}", result.tilt_corrected);
    if result.skipped > 0 {
        println!("Skipped {} regions outside the high-res page", result.skipped);
    }
    for (i, crop) in result.crops.iter().enumerate() {
        let path = out_dir.join(format!("region_{:02}_{}.png", i, crop.detection.class_id.name()));
        crop.image
            .save(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!(
            "  {}. {:?} conf={:.2} -> {} ({}x{})",
            i + 1,
            crop.detection.xyxy,
            crop.detection.confidence,
            path.display(),
            crop.image.width(),
            crop.image.height()
        );
    }

    Ok(())
}
