// Content sniffing and container expansion for acquired sources.

use std::cmp::Ordering;
use std::io::{Cursor, Read};
use std::sync::LazyLock;

use image::ImageFormat;
use lopdf::{Dictionary, Document, Object, ObjectId};
use regex::Regex;
use reqwest::Url;
use tracing::debug;

use crate::errors::PipelineError;

static RE_IMG_SRC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<img\b[^>]*?\b(?:data-src|src)\s*=\s*["']([^"']+)["']"#).unwrap()
});
static RE_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Image(ImageFormat),
    Zip,
    Pdf,
    Html,
}

/// One page image produced by acquisition, before it is stored.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub name: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Detect the format from the leading bytes. `declared` (a content type) is
/// only consulted for HTML, which has no magic number.
pub fn sniff(bytes: &[u8], declared: Option<&str>) -> Option<SourceFormat> {
    if let Ok(format) = image::guess_format(bytes) {
        return match format {
            ImageFormat::Png
            | ImageFormat::Jpeg
            | ImageFormat::Gif
            | ImageFormat::WebP
            | ImageFormat::Bmp
            | ImageFormat::Tiff => Some(SourceFormat::Image(format)),
            _ => None,
        };
    }
    if bytes.starts_with(b"PK\x03\x04") {
        return Some(SourceFormat::Zip);
    }
    if bytes.starts_with(b"%PDF-") {
        return Some(SourceFormat::Pdf);
    }

    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(512)]).to_ascii_lowercase();
    let head = head.trim_start_matches('\u{feff}').trim_start();
    let declared_html = declared.is_some_and(|ct| ct.contains("html"));
    if declared_html || head.starts_with("<!doctype html") || head.starts_with("<html") {
        return Some(SourceFormat::Html);
    }
    None
}

pub fn image_content_type(format: ImageFormat) -> String {
    format.to_mime_type().to_string()
}

/// Natural ("human") ordering: digit runs compare by numeric value, other
/// characters case-insensitively, so `page2` sorts before `page10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();

    loop {
        let (l, r) = match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => (l, r),
        };

        if l.is_ascii_digit() && r.is_ascii_digit() {
            let mut left_digits = String::new();
            while let Some(c) = left.next_if(|c| c.is_ascii_digit()) {
                left_digits.push(c);
            }
            let mut right_digits = String::new();
            while let Some(c) = right.next_if(|c| c.is_ascii_digit()) {
                right_digits.push(c);
            }
            let lt = left_digits.trim_start_matches('0');
            let rt = right_digits.trim_start_matches('0');
            let ord = lt.len().cmp(&rt.len()).then_with(|| lt.cmp(rt));
            if ord != Ordering::Equal {
                return ord;
            }
        } else {
            let ord = l.to_lowercase().cmp(r.to_lowercase());
            if ord != Ordering::Equal {
                return ord;
            }
            left.next();
            right.next();
        }
    }
}

/// Page order of uploaded files: explicitly indexed files first, the rest by
/// natural name order.
pub fn upload_order(a: (Option<usize>, &str), b: (Option<usize>, &str)) -> Ordering {
    match (a.0, b.0) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| natural_cmp(a.1, b.1)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => natural_cmp(a.1, b.1),
    }
}

fn is_hidden_entry(name: &str) -> bool {
    name.starts_with("__MACOSX/")
        || name
            .rsplit('/')
            .next()
            .is_some_and(|base| base.starts_with('.') || base.is_empty())
}

/// Expand a ZIP/CBZ archive into its images, in natural name order.
/// Non-image entries are skipped. `max_total_bytes` bounds everything
/// decompressed, whatever the entries declare.
pub fn expand_zip(
    bytes: &[u8],
    max_entry_bytes: u64,
    max_total_bytes: u64,
    max_pages: usize,
) -> Result<Vec<RawPage>, PipelineError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| PipelineError::UnsupportedFormat(format!("unreadable archive: {}", e)))?;

    let mut entries: Vec<(usize, String)> = Vec::new();
    for i in 0..archive.len() {
        let file = archive
            .by_index(i)
            .map_err(|e| PipelineError::UnsupportedFormat(format!("unreadable archive: {}", e)))?;
        if file.is_dir() || is_hidden_entry(file.name()) {
            continue;
        }
        entries.push((i, file.name().to_string()));
    }
    entries.sort_by(|a, b| natural_cmp(&a.1, &b.1));

    let mut pages = Vec::new();
    let mut total: u64 = 0;
    for (i, name) in entries {
        let mut file = archive
            .by_index(i)
            .map_err(|e| PipelineError::UnsupportedFormat(format!("unreadable archive: {}", e)))?;
        if file.size() > max_entry_bytes {
            return Err(PipelineError::SourceTooLarge(format!(
                "archive entry '{}' is {} bytes, limit is {}",
                name,
                file.size(),
                max_entry_bytes
            )));
        }

        let remaining = max_total_bytes.saturating_sub(total);
        if file.size() > remaining {
            return Err(expanded_too_large(max_total_bytes));
        }

        let limit = max_entry_bytes.min(remaining);
        let mut buf = Vec::with_capacity(file.size() as usize);
        (&mut file)
            .take(limit + 1)
            .read_to_end(&mut buf)
            .map_err(|e| {
                PipelineError::UnsupportedFormat(format!("cannot read entry '{}': {}", name, e))
            })?;
        if buf.len() as u64 > max_entry_bytes {
            return Err(PipelineError::SourceTooLarge(format!(
                "archive entry '{}' exceeds {} bytes",
                name, max_entry_bytes
            )));
        }
        if buf.len() as u64 > remaining {
            return Err(expanded_too_large(max_total_bytes));
        }
        total += buf.len() as u64;

        match sniff(&buf, None) {
            Some(SourceFormat::Image(format)) => {
                pages.push(RawPage {
                    name,
                    bytes: buf,
                    content_type: image_content_type(format),
                });
                if pages.len() > max_pages {
                    return Err(PipelineError::SourceTooLarge(format!(
                        "archive has more than {} pages",
                        max_pages
                    )));
                }
            }
            _ => debug!("Skipping non-image archive entry '{}'", name),
        }
    }

    if pages.is_empty() {
        return Err(PipelineError::UnsupportedFormat(
            "archive contains no images".to_string(),
        ));
    }
    Ok(pages)
}

fn expanded_too_large(max_total_bytes: u64) -> PipelineError {
    PipelineError::SourceTooLarge(format!(
        "archive expands to more than {} bytes",
        max_total_bytes
    ))
}

fn resolve<'a>(doc: &'a Document, object: &'a Object) -> Option<&'a Object> {
    match object {
        Object::Reference(id) => doc.get_object(*id).ok(),
        other => Some(other),
    }
}

fn resolve_dict<'a>(doc: &'a Document, dict: &'a Dictionary, key: &[u8]) -> Option<&'a Dictionary> {
    dict.get(key)
        .ok()
        .and_then(|o| resolve(doc, o))
        .and_then(|o| o.as_dict().ok())
}

/// Page resources, following the `Parent` chain for inherited ones.
fn page_resources(doc: &Document, page_id: ObjectId) -> Option<&Dictionary> {
    let mut node = doc.get_dictionary(page_id).ok()?;
    for _ in 0..32 {
        if let Some(resources) = resolve_dict(doc, node, b"Resources") {
            return Some(resources);
        }
        let parent = node.get(b"Parent").ok()?.as_reference().ok()?;
        node = doc.get_dictionary(parent).ok()?;
    }
    None
}

fn has_filter(dict: &Dictionary, filter: &[u8]) -> bool {
    match dict.get(b"Filter") {
        Ok(Object::Name(name)) => name.as_slice() == filter,
        Ok(Object::Array(filters)) => filters
            .iter()
            .any(|f| f.as_name().map(|n| n == filter).unwrap_or(false)),
        _ => false,
    }
}

fn page_jpegs(doc: &Document, page_id: ObjectId) -> Vec<Vec<u8>> {
    let Some(resources) = page_resources(doc, page_id) else {
        return Vec::new();
    };
    let Some(xobjects) = resolve_dict(doc, resources, b"XObject") else {
        return Vec::new();
    };

    let mut images = Vec::new();
    for (_, object) in xobjects.iter() {
        let Some(Object::Stream(stream)) = resolve(doc, object) else {
            continue;
        };
        let is_image = stream
            .dict
            .get(b"Subtype")
            .and_then(|s| s.as_name())
            .map(|n| n == b"Image")
            .unwrap_or(false);
        if is_image && has_filter(&stream.dict, b"DCTDecode") {
            images.push(stream.content.clone());
        }
    }
    images
}

/// Extract the embedded JPEG page images of a scanned PDF, in page order.
/// A page without a JPEG image makes the whole document unsupported.
pub fn expand_pdf(bytes: &[u8], max_pages: usize) -> Result<Vec<RawPage>, PipelineError> {
    let doc = Document::load_mem(bytes)
        .map_err(|e| PipelineError::UnsupportedFormat(format!("unreadable PDF: {}", e)))?;

    let mut pages = Vec::new();
    for (page_number, page_id) in doc.get_pages() {
        let images = page_jpegs(&doc, page_id);
        if images.is_empty() {
            return Err(PipelineError::UnsupportedFormat(format!(
                "PDF page {} has no embedded JPEG image",
                page_number
            )));
        }
        for (n, data) in images.into_iter().enumerate() {
            pages.push(RawPage {
                name: format!("page-{:04}-{}.jpg", page_number, n),
                bytes: data,
                content_type: "image/jpeg".to_string(),
            });
        }
        if pages.len() > max_pages {
            return Err(PipelineError::SourceTooLarge(format!(
                "PDF has more than {} pages",
                max_pages
            )));
        }
    }

    if pages.is_empty() {
        return Err(PipelineError::UnsupportedFormat(
            "PDF contains no pages".to_string(),
        ));
    }
    Ok(pages)
}

/// Image URLs referenced by an HTML chapter page, resolved against `base`,
/// in document order without duplicates.
pub fn extract_image_links(html: &str, base: &Url) -> Vec<Url> {
    let mut links: Vec<Url> = Vec::new();
    for capture in RE_IMG_SRC.captures_iter(html) {
        let raw = capture[1].trim().replace("&amp;", "&");
        if raw.is_empty() || raw.starts_with("data:") {
            continue;
        }
        match base.join(&raw) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {
                if !links.contains(&url) {
                    links.push(url);
                }
            }
            _ => debug!("Ignoring image reference '{}'", raw),
        }
    }
    links
}

pub fn extract_title(html: &str) -> Option<String> {
    let title = RE_TITLE.captures(html)?.get(1)?.as_str();
    let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
    (!title.is_empty()).then_some(title)
}
