//! Watermark renderer: turns a logo image into a one-page overlay PDF.

use image::RgbaImage;
use std::io::Cursor;
use tracing::debug;

use crate::builder;
use crate::config::RenderOptions;
use crate::error::RenderError;

/// Where the logo lands on the overlay page, in PDF points (origin bottom-left).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Renders the overlay used for every document of one job.
pub fn render(logo_bytes: &[u8], opts: &RenderOptions) -> Result<Vec<u8>, RenderError> {
    opts.validate()
        .map_err(|e| RenderError::Options(e.to_string()))?;
    let logo = decode_logo(logo_bytes)?;
    let (w, h) = logo.dimensions();
    let placement = place(w, h, opts);
    debug!(
        logo_w = w,
        logo_h = h,
        x = placement.x,
        y = placement.y,
        width = placement.width,
        height = placement.height,
        "placing watermark"
    );
    builder::build_overlay(&logo, &placement, opts)
}

pub fn decode_logo(data: &[u8]) -> Result<RgbaImage, RenderError> {
    let logo = image::load(Cursor::new(data), image::ImageFormat::Png)
        .or_else(|_| image::load(Cursor::new(data), image::ImageFormat::Jpeg))
        .or_else(|_| image::load_from_memory(data))
        .map_err(|e| RenderError::Decode(e.to_string()))?;
    Ok(logo.into_rgba8())
}

/// Scales the logo by `opts.scale`, shrinks it to fit if it would overflow
/// the page, and centers it on both axes.
pub fn place(img_w: u32, img_h: u32, opts: &RenderOptions) -> Placement {
    let page = opts.page;
    let mut width = img_w as f32 * opts.scale;
    let mut height = img_h as f32 * opts.scale;

    if width > page.width || height > page.height {
        let fit = (page.width / width).min(page.height / height);
        width *= fit;
        height *= fit;
    }

    Placement {
        x: (page.width - width) / 2.0,
        y: (page.height - height) / 2.0,
        width,
        height,
    }
}

/// True when at least one pixel is not fully opaque.
pub fn has_transparency(logo: &RgbaImage) -> bool {
    logo.pixels().any(|p| p[3] < u8::MAX)
}
