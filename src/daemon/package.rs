// Download bundles: rendered pages of a job packed into a ZIP archive.

use std::io::{Seek, Write};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::errors::PipelineError;

pub const BUNDLE_CONTENT_TYPE: &str = "application/zip";

pub struct BundleEntry {
    pub index: usize,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

pub fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        "image/tiff" => "tiff",
        _ => "bin",
    }
}

/// `001.png`, `002.jpg`, ... numbered from one, padded so that archive
/// viewers sort them correctly.
pub fn entry_name(index: usize, content_type: &str, total: usize) -> String {
    let width = total.to_string().len().max(3);
    format!(
        "{:0width$}.{}",
        index + 1,
        extension_for(content_type),
        width = width
    )
}

/// Pack entries in index order into `sink`. Images are stored uncompressed
/// since they are already compressed.
pub fn write_bundle<W: Write + Seek>(
    mut entries: Vec<BundleEntry>,
    sink: W,
) -> Result<W, PipelineError> {
    entries.sort_by_key(|e| e.index);
    let total = entries.iter().map(|e| e.index + 1).max().unwrap_or(0);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    let mut writer = ZipWriter::new(sink);
    for entry in &entries {
        let name = entry_name(entry.index, &entry.content_type, total);
        writer
            .start_file(name.as_str(), options)
            .map_err(|e| PipelineError::Internal(format!("cannot add {} to bundle: {}", name, e)))?;
        writer
            .write_all(&entry.bytes)
            .map_err(|e| PipelineError::Internal(format!("cannot write {} to bundle: {}", name, e)))?;
    }
    writer
        .finish()
        .map_err(|e| PipelineError::Internal(format!("cannot finish bundle: {}", e)))
}

/// File name offered to browsers for a bundle download.
pub fn bundle_file_name(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.');
    if cleaned.is_empty() {
        "translation.zip".to_string()
    } else {
        format!("{}.zip", cleaned)
    }
}
