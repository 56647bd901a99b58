use flate2::write::ZlibEncoder;
use flate2::Compression;
use image::RgbaImage;
use lopdf::{dictionary, Document, Object, Stream};
use std::io::Write;

use crate::config::RenderOptions;
use crate::error::RenderError;
use crate::watermark::{has_transparency, Placement};

/// Assembles the single-page overlay PDF: one image XObject drawn through
/// an ExtGState carrying the fill alpha.
pub fn build_overlay(
    logo: &RgbaImage,
    placement: &Placement,
    opts: &RenderOptions,
) -> Result<Vec<u8>, RenderError> {
    let mut doc = Document::with_version("1.4");
    let pages_id = doc.new_object_id();

    let (image_stream, mask_stream) = encode_image_stream(logo)?;
    let mut image_stream = image_stream;
    if let Some(mask) = mask_stream {
        let mask_id = doc.add_object(mask);
        image_stream.dict.set("SMask", Object::Reference(mask_id));
    }
    let img_id = doc.add_object(image_stream);

    let gs_id = doc.add_object(dictionary! {
        "Type" => "ExtGState",
        "ca" => Object::Real(opts.opacity),
        "CA" => Object::Real(opts.opacity),
    });

    let content = format!(
        "q\n/GS0 gs\n{:.3} 0 0 {:.3} {:.3} {:.3} cm\n/Im0 Do\nQ\n",
        placement.width, placement.height, placement.x, placement.y
    );
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));

    let page = dictionary! {
        "Type" => "Page",
        "Parent" => Object::Reference(pages_id),
        "MediaBox" => vec![
            0.into(),
            0.into(),
            Object::Real(opts.page.width),
            Object::Real(opts.page.height),
        ],
        "Contents" => Object::Reference(content_id),
        "Resources" => dictionary! {
            "XObject" => dictionary! {
                "Im0" => Object::Reference(img_id),
            },
            "ExtGState" => dictionary! {
                "GS0" => Object::Reference(gs_id),
            },
        },
    };
    let page_id = doc.add_object(page);

    let pages = dictionary! {
        "Type" => "Pages",
        "Kids" => vec![Object::Reference(page_id)],
        "Count" => 1_i64,
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages));

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(pages_id),
    });
    doc.trailer.set("Root", Object::Reference(catalog_id));

    let mut out = Vec::new();
    doc.save_to(&mut out)
        .map_err(|e| RenderError::Finalize(e.to_string()))?;
    Ok(out)
}

/// RGB samples plus, when the logo has any transparency, a DeviceGray soft mask.
fn encode_image_stream(logo: &RgbaImage) -> Result<(Stream, Option<Stream>), RenderError> {
    let (w, h) = logo.dimensions();
    let with_alpha = has_transparency(logo);

    let mut rgb = Vec::with_capacity((w * h * 3) as usize);
    let mut alpha = Vec::with_capacity(if with_alpha { (w * h) as usize } else { 0 });
    for pixel in logo.pixels() {
        rgb.extend_from_slice(&pixel.0[..3]);
        if with_alpha {
            alpha.push(pixel[3]);
        }
    }

    let image = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => w as i64,
            "Height" => h as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8_i64,
            "Filter" => "FlateDecode",
        },
        deflate(&rgb)?,
    );

    let mask = if with_alpha {
        Some(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => w as i64,
                "Height" => h as i64,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8_i64,
                "Filter" => "FlateDecode",
            },
            deflate(&alpha)?,
        ))
    } else {
        None
    };

    Ok((image, mask))
}

fn deflate(raw: &[u8]) -> Result<Vec<u8>, RenderError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(raw)
        .map_err(|e| RenderError::Finalize(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| RenderError::Finalize(e.to_string()))
}
