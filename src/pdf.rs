use lopdf::{Dictionary, Document, Object, ObjectId};

use crate::config::PageSize;
use crate::error::TransformError;

/// Inherited page attributes are looked up this many levels up the page tree.
const MAX_TREE_DEPTH: usize = 32;

pub fn load(bytes: &[u8]) -> Result<Document, TransformError> {
    let doc = Document::load_mem(bytes).map_err(|e| TransformError::Parse(e.to_string()))?;
    if doc.is_encrypted() {
        return Err(TransformError::Parse("document is encrypted".into()));
    }
    Ok(doc)
}

/// Page ids in page order.
pub fn page_ids(doc: &Document) -> Vec<(u32, ObjectId)> {
    // get_pages() is keyed by page number, so iteration order is page order.
    doc.get_pages().into_iter().collect()
}

pub fn resolve(doc: &Document, obj: &Object) -> Result<Object, lopdf::Error> {
    match obj {
        Object::Reference(id) => doc.get_object(*id).cloned(),
        other => Ok(other.clone()),
    }
}

pub fn resolve_to_dict(doc: &Document, obj: &Object) -> Option<Dictionary> {
    match resolve(doc, obj).ok()? {
        Object::Dictionary(d) => Some(d),
        Object::Stream(s) => Some(s.dict),
        _ => None,
    }
}

/// Looks `key` up on the page, then on its ancestors.
pub fn inherited(doc: &Document, page_id: ObjectId, key: &[u8]) -> Option<Object> {
    let mut current = doc.get_dictionary(page_id).ok()?;
    for _ in 0..MAX_TREE_DEPTH {
        if let Ok(value) = current.get(key) {
            return resolve(doc, value).ok();
        }
        let parent = current.get(b"Parent").ok()?.as_reference().ok()?;
        current = doc.get_dictionary(parent).ok()?;
    }
    None
}

/// Effective resource dictionary of a page, owned so it can be edited and
/// stored back directly on the page.
pub fn resources(doc: &Document, page_id: ObjectId) -> Dictionary {
    inherited(doc, page_id, b"Resources")
        .and_then(|obj| resolve_to_dict(doc, &obj))
        .unwrap_or_default()
}

pub fn media_box(doc: &Document, page_id: ObjectId) -> [f32; 4] {
    let fallback = [0.0, 0.0, PageSize::LETTER.width, PageSize::LETTER.height];
    let Some(Object::Array(values)) = inherited(doc, page_id, b"MediaBox") else {
        return fallback;
    };
    let numbers: Vec<f32> = values
        .iter()
        .filter_map(|v| resolve(doc, v).ok())
        .filter_map(|v| as_number(&v))
        .collect();
    match numbers.as_slice() {
        [a, b, c, d] => [a.min(*c), b.min(*d), a.max(*c), b.max(*d)],
        _ => fallback,
    }
}

pub fn as_number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r),
        _ => None,
    }
}

/// The page's content streams as a list of references, registering any
/// direct stream as a new object first.
pub fn content_refs(doc: &mut Document, page_id: ObjectId) -> Result<Vec<Object>, lopdf::Error> {
    let contents = match doc.get_dictionary(page_id)?.get(b"Contents") {
        Ok(obj) => obj.clone(),
        Err(_) => return Ok(Vec::new()),
    };
    let entries = match contents {
        Object::Reference(id) => match doc.get_object(id)? {
            Object::Array(items) => items.clone(),
            _ => vec![Object::Reference(id)],
        },
        Object::Array(items) => items,
        Object::Stream(stream) => vec![Object::Stream(stream)],
        _ => Vec::new(),
    };

    let mut refs = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry {
            Object::Reference(_) => refs.push(entry),
            Object::Stream(stream) => refs.push(Object::Reference(doc.add_object(stream))),
            _ => {}
        }
    }
    Ok(refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::dictionary;

    fn doc_with_inherited_box() -> (Document, ObjectId) {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![Object::Reference(page_id)],
                "Count" => 1_i64,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), Object::Real(842.0)],
                "Resources" => dictionary! { "Font" => dictionary! {} },
            }),
        );
        (doc, page_id)
    }

    #[test]
    fn attributes_are_inherited_from_page_tree() {
        let (doc, page_id) = doc_with_inherited_box();
        assert_eq!(media_box(&doc, page_id), [0.0, 0.0, 595.0, 842.0]);
        assert!(resources(&doc, page_id).get(b"Font").is_ok());
    }

    #[test]
    fn missing_contents_means_no_streams() {
        let (mut doc, page_id) = doc_with_inherited_box();
        assert!(content_refs(&mut doc, page_id).unwrap().is_empty());
    }

    #[test]
    fn garbage_does_not_parse() {
        assert!(matches!(load(b"not a pdf"), Err(TransformError::Parse(_))));
    }
}
