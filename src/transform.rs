//! Document transformer: stamps the overlay page on top of every page.
//!
//! The overlay page is imported once as a Form XObject. Each page's original
//! content is wrapped in `q ... Q` so its graphics state cannot leak into the
//! stamp, and the form is drawn afterwards, i.e. on top. Applying the same
//! overlay twice draws it twice; no attempt is made to detect an existing
//! stamp.

use lopdf::{dictionary, Document, Object, ObjectId, Stream};

use crate::error::TransformError;
use crate::pdf;

/// Prefix of the XObject names used for stamps.
const STAMP_PREFIX: &str = "Wm";

/// The rendered overlay, parsed once and shared by every document of a job.
#[derive(Clone)]
pub struct Overlay {
    doc: Document,
}

impl Overlay {
    pub fn parse(bytes: &[u8]) -> Result<Self, TransformError> {
        let doc = pdf::load(bytes)?;
        if doc.get_pages().is_empty() {
            return Err(TransformError::EmptyOverlay);
        }
        Ok(Self { doc })
    }
}

pub fn apply(source: &[u8], overlay: &Overlay) -> Result<Vec<u8>, TransformError> {
    let mut doc = pdf::load(source)?;

    let form_id = import_overlay(&mut doc, overlay.doc.clone())?;
    let save_id = doc.add_object(Stream::new(dictionary! {}, b"q\n".to_vec()));

    for (page_num, page_id) in pdf::page_ids(&doc) {
        stamp_page(&mut doc, page_id, form_id, save_id).map_err(|e| TransformError::Page {
            page: page_num,
            reason: e.to_string(),
        })?;
    }

    // Drops the overlay's own catalog and page tree, now unreachable.
    doc.prune_objects();

    let mut out = Vec::new();
    doc.save_to(&mut out)
        .map_err(|e| TransformError::Write(e.to_string()))?;
    Ok(out)
}

pub fn page_count(bytes: &[u8]) -> Result<usize, TransformError> {
    Ok(pdf::load(bytes)?.get_pages().len())
}

/// Moves every overlay object into `doc` and wraps the first overlay page
/// in a Form XObject, returning the form's id.
fn import_overlay(doc: &mut Document, mut overlay: Document) -> Result<ObjectId, TransformError> {
    overlay.renumber_objects_with(doc.max_id + 1);

    let page_id = pdf::page_ids(&overlay)
        .first()
        .map(|(_, id)| *id)
        .ok_or(TransformError::EmptyOverlay)?;
    let content = overlay
        .get_page_content(page_id)
        .map_err(|e| TransformError::Parse(format!("overlay content: {}", e)))?;
    let resources = pdf::resources(&overlay, page_id);
    let [llx, lly, urx, ury] = pdf::media_box(&overlay, page_id);

    doc.max_id = doc.max_id.max(overlay.max_id);
    doc.objects.extend(overlay.objects);

    let form = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Form",
            "BBox" => vec![
                Object::Real(llx),
                Object::Real(lly),
                Object::Real(urx),
                Object::Real(ury),
            ],
            "Resources" => resources,
        },
        content,
    );
    Ok(doc.add_object(form))
}

fn stamp_page(
    doc: &mut Document,
    page_id: ObjectId,
    form_id: ObjectId,
    save_id: ObjectId,
) -> Result<(), lopdf::Error> {
    let mut resources = pdf::resources(doc, page_id);
    let mut xobjects = resources
        .get(b"XObject")
        .ok()
        .and_then(|obj| pdf::resolve_to_dict(doc, obj))
        .unwrap_or_default();

    let name = (0..)
        .map(|i| format!("{}{}", STAMP_PREFIX, i))
        .find(|candidate| xobjects.get(candidate.as_bytes()).is_err())
        .unwrap_or_else(|| STAMP_PREFIX.to_string());
    xobjects.set(name.as_bytes().to_vec(), Object::Reference(form_id));
    resources.set("XObject", Object::Dictionary(xobjects));

    let [llx, lly, _, _] = pdf::media_box(doc, page_id);
    let stamp = format!(
        "\nQ\nq\n1 0 0 1 {:.3} {:.3} cm\n/{} Do\nQ\n",
        llx, lly, name
    );
    let stamp_id = doc.add_object(Stream::new(dictionary! {}, stamp.into_bytes()));

    let mut contents = vec![Object::Reference(save_id)];
    contents.extend(pdf::content_refs(doc, page_id)?);
    contents.push(Object::Reference(stamp_id));

    let page = doc.get_object_mut(page_id)?.as_dict_mut()?;
    page.set("Resources", Object::Dictionary(resources));
    page.set("Contents", Object::Array(contents));
    Ok(())
}
