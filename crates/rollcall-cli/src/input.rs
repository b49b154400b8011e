//! Detector output files.
//!
//! Face detection and embedding run upstream; the CLI consumes their output
//! as JSON. A batch file is an array of images:
//!
//! ```json
//! [{"image": "a.jpg", "captured_at": "2025-06-02T09:00:00Z",
//!   "detections": [{"embedding": [0.1, ...], "bbox": [10, 20, 110, 140]}]}]
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rollcall_core::Detection;
use serde::Deserialize;
use std::path::Path;

/// Detector output for one captured image.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageDetections {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
    pub detections: Vec<Detection>,
}

pub fn load_batch(path: &Path) -> Result<Vec<ImageDetections>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_batch(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Accepts either an array of images or a single image object.
pub fn parse_batch(text: &str) -> Result<Vec<ImageDetections>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Batch {
        Many(Vec<ImageDetections>),
        One(ImageDetections),
    }
    Ok(match serde_json::from_str(text)? {
        Batch::Many(images) => images,
        Batch::One(image) => vec![image],
    })
}

/// Detections of a single image, for enrollment and frame recognition.
pub fn load_image(path: &Path) -> Result<ImageDetections> {
    let mut images = load_batch(path)?;
    match images.len() {
        1 => Ok(images.remove(0)),
        n => anyhow::bail!("{} holds {n} images, expected exactly one", path.display()),
    }
}
