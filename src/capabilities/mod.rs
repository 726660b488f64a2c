// Capability seams: OCR, machine translation, typesetting and remote fetch,
// each with a real implementation and a scripted mock.

pub mod fetch;
pub mod http;
pub mod mock;
pub mod typeset;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use fetch::{FetchedBody, HttpFetcher, RemoteFetcher};
pub use http::{HttpOcrEngine, HttpTranslator};
pub use typeset::RasterTypesetter;

/// Pixel rectangle, origin at the top-left corner of the image.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Clip to an image of the given size. Returns None if nothing remains.
    pub fn clamp_to(&self, image_width: u32, image_height: u32) -> Option<BoundingBox> {
        if self.x >= image_width || self.y >= image_height {
            return None;
        }
        let width = self.width.min(image_width - self.x);
        let height = self.height.min(image_height - self.y);
        let clamped = BoundingBox::new(self.x, self.y, width, height);
        (!clamped.is_empty()).then_some(clamped)
    }
}

/// A text region found by OCR.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TextRegion {
    pub bbox: BoundingBox,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_language: Option<String>,
}

/// Translated text to draw into a region.
#[derive(Debug, Clone, PartialEq)]
pub struct TypesetRegion {
    pub bbox: BoundingBox,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct ComposedImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CapabilityError {
    /// Network failure, timeout, 5xx or 429. Worth retrying.
    #[error("{0}")]
    Transient(String),
    /// Malformed input or a 4xx response. Retrying will not help.
    #[error("{0}")]
    Permanent(String),
}

impl CapabilityError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CapabilityError::Transient(_))
    }
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn detect_text(&self, image: &[u8]) -> Result<Vec<TextRegion>, CapabilityError>;
}

#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> Result<String, CapabilityError>;
}

#[async_trait]
pub trait Typesetter: Send + Sync {
    async fn compose(
        &self,
        image: &[u8],
        regions: &[TypesetRegion],
    ) -> Result<ComposedImage, CapabilityError>;
}

/// The set of capabilities a page processor works with.
#[derive(Clone)]
pub struct Capabilities {
    pub ocr: Arc<dyn OcrEngine>,
    pub translator: Arc<dyn Translator>,
    pub typesetter: Arc<dyn Typesetter>,
}

/// OCR that never finds text, so every page passes through untouched.
/// Used when no OCR endpoint is configured.
pub struct PassthroughOcr;

#[async_trait]
impl OcrEngine for PassthroughOcr {
    async fn detect_text(&self, _image: &[u8]) -> Result<Vec<TextRegion>, CapabilityError> {
        Ok(Vec::new())
    }
}

/// Translator used when no translation endpoint is configured.
pub struct UnconfiguredTranslator;

#[async_trait]
impl Translator for UnconfiguredTranslator {
    async fn translate(
        &self,
        _text: &str,
        _source_language: &str,
        _target_language: &str,
    ) -> Result<String, CapabilityError> {
        Err(CapabilityError::Permanent(
            "no translation endpoint is configured".to_string(),
        ))
    }
}
