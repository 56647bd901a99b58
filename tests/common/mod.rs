//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use lopdf::{dictionary, Document, Object, Stream};

use watermark_mirror::{
    Config, MemoryTree, Node, NodeKind, Orchestrator, RetryPolicy, TaskId, TaskSnapshot,
};

/// Orchestrator with near-instant retries.
pub fn orchestrator() -> Orchestrator {
    let mut config = Config::default();
    config.mirror.retry = RetryPolicy {
        attempts: 3,
        base_delay_ms: 1,
    };
    Orchestrator::new(config).expect("valid config")
}

pub fn logo_png() -> Vec<u8> {
    let mut logo = RgbaImage::from_pixel(32, 16, Rgba([220, 30, 30, 255]));
    logo.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
    let mut png = Vec::new();
    DynamicImage::ImageRgba8(logo)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .expect("encode png");
    png
}

/// A text PDF with `pages` pages, each saying "Page N".
pub fn sample_pdf(pages: usize) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let mut kids = Vec::new();
    for i in 0..pages {
        let content = format!("BT /F1 18 Tf 72 720 Td (Page {}) Tj ET", i + 1);
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "Font" => dictionary! { "F1" => font_id },
            },
        });
        kids.push(Object::Reference(page_id));
    }
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    let mut out = Vec::new();
    doc.save_to(&mut out).expect("save pdf");
    out
}

pub fn add_pdf(tree: &MemoryTree, name: &str, pages: usize, parent: &str) -> String {
    tree.add_file(name, NodeKind::Document, sample_pdf(pages), parent)
}

/// The destination root the orchestrator creates at the top level.
pub fn dest_root(tree: &MemoryTree, source_name: &str) -> Node {
    tree.find_child("", &format!("{} (Watermarked)", source_name))
        .expect("destination root exists")
}

pub async fn wait(orchestrator: &Orchestrator, id: &TaskId) -> TaskSnapshot {
    tokio::time::timeout(Duration::from_secs(10), orchestrator.wait(id))
        .await
        .expect("job finished in time")
        .expect("task is known")
}

/// Polls `cond` until it holds, yielding to the walker in between.
pub async fn wait_until<F: FnMut() -> bool>(mut cond: F) {
    let polling = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), polling)
        .await
        .expect("condition reached in time");
}

pub fn handle(tree: &Arc<MemoryTree>) -> watermark_mirror::TreeHandle {
    Arc::clone(tree) as watermark_mirror::TreeHandle
}
