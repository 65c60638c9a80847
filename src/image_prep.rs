//! Source image normalization for conditioned generation.
//!
//! Screenshots come in every size. Backends want exactly 1392x752, so the
//! image is scaled to cover the target and center-cropped, never stretched.

use std::io::Cursor;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, RgbImage};
use tempfile::TempPath;
use tracing::debug;

use crate::error::{PluginError, Result};

pub const KONTEXT_WIDTH: u32 = 1392;
pub const KONTEXT_HEIGHT: u32 = 752;

/// Scale-then-crop geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropPlan {
    pub scaled_width: u32,
    pub scaled_height: u32,
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl CropPlan {
    /// Plan covering `target` with `source`, preserving aspect ratio.
    ///
    /// The scale factor is `max(tw/sw, th/sh)`. Scaled sizes are truncated
    /// and never smaller than the target, so the crop window always fits.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::similar_names
    )]
    pub fn cover(source: (u32, u32), target: (u32, u32)) -> Result<Self> {
        let (sw, sh) = source;
        let (tw, th) = target;
        if sw == 0 || sh == 0 || tw == 0 || th == 0 {
            return Err(PluginError::protocol(format!(
                "Cannot resize {sw}x{sh} image to {tw}x{th}"
            )));
        }

        let scale = f64::max(
            f64::from(tw) / f64::from(sw),
            f64::from(th) / f64::from(sh),
        );
        let scaled_width = ((f64::from(sw) * scale) as u32).max(tw);
        let scaled_height = ((f64::from(sh) * scale) as u32).max(th);

        Ok(Self {
            scaled_width,
            scaled_height,
            left: (scaled_width - tw) / 2,
            top: (scaled_height - th) / 2,
            width: tw,
            height: th,
        })
    }
}

/// Scale and center-crop `image` to exactly `width`x`height` RGB.
pub fn normalize(image: &DynamicImage, width: u32, height: u32) -> Result<RgbImage> {
    let plan = CropPlan::cover((image.width(), image.height()), (width, height))?;
    debug!(
        from_w = image.width(),
        from_h = image.height(),
        ?plan,
        "Normalizing source image"
    );

    let rgb = image.to_rgb8();
    let scaled = imageops::resize(&rgb, plan.scaled_width, plan.scaled_height, FilterType::Lanczos3);
    Ok(imageops::crop_imm(&scaled, plan.left, plan.top, plan.width, plan.height).to_image())
}

/// Decode an image file.
pub fn load(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|e| PluginError::Image {
        context: format!("Failed to read image {}", path.display()),
        source: e,
    })
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|e| PluginError::Image {
            context: "Failed to encode PNG".into(),
            source: e,
        })?;
    Ok(buffer.into_inner())
}

/// Normalize the file at `path` and return it as a `data:image/png;base64,` URI.
pub fn png_data_uri(path: &Path, width: u32, height: u32) -> Result<String> {
    let normalized = normalize(&load(path)?, width, height)?;
    let png = encode_png(&normalized)?;
    Ok(format!("data:image/png;base64,{}", BASE64.encode(png)))
}

/// Normalize the file at `path` into a temporary PNG.
///
/// The file is removed when the returned path is dropped.
pub fn png_temp_file(path: &Path, width: u32, height: u32) -> Result<TempPath> {
    let normalized = normalize(&load(path)?, width, height)?;
    let temp = tempfile::Builder::new()
        .prefix("kontext_source_")
        .suffix(".png")
        .tempfile()
        .map_err(|e| PluginError::filesystem("Failed to create temporary image", e))?
        .into_temp_path();

    normalized
        .save_with_format(&temp, ImageFormat::Png)
        .map_err(|e| PluginError::Image {
            context: format!("Failed to write {}", temp.display()),
            source: e,
        })?;
    Ok(temp)
}
