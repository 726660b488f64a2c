// Scripted capability implementations for tests and local dry runs.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::capabilities::{
    CapabilityError, ComposedImage, OcrEngine, TextRegion, Translator, Typesetter, TypesetRegion,
};

type RegionScript = Arc<dyn Fn(&[u8]) -> Vec<TextRegion> + Send + Sync>;
type DelayScript = Arc<dyn Fn(&[u8]) -> Duration + Send + Sync>;

/// Configuration for creating a MockOcr.
#[derive(Clone, Default)]
pub struct MockOcrConfig {
    /// Regions returned for every image
    pub regions: Vec<TextRegion>,
    /// Number of calls that fail with a transient error before any succeeds
    pub transient_failures: u32,
    /// When set, every call fails permanently with this message
    pub permanent_error: Option<String>,
}

/// Mock OCR engine for testing.
pub struct MockOcr {
    config: MockOcrConfig,
    script: Option<RegionScript>,
    delay: Option<DelayScript>,
    calls: AtomicU32,
}

impl MockOcr {
    pub fn new(config: MockOcrConfig) -> Self {
        Self {
            config,
            script: None,
            delay: None,
            calls: AtomicU32::new(0),
        }
    }

    /// Finds no text on any page.
    pub fn no_text() -> Self {
        Self::new(MockOcrConfig::default())
    }

    /// Returns the same regions for every page.
    pub fn with_regions(regions: Vec<TextRegion>) -> Self {
        Self::new(MockOcrConfig {
            regions,
            ..Default::default()
        })
    }

    /// Fails transiently `failures` times, then returns `regions`.
    pub fn flaky(failures: u32, regions: Vec<TextRegion>) -> Self {
        Self::new(MockOcrConfig {
            regions,
            transient_failures: failures,
            ..Default::default()
        })
    }

    /// Fails every call with a permanent error.
    pub fn failing(message: &str) -> Self {
        Self::new(MockOcrConfig {
            permanent_error: Some(message.to_string()),
            ..Default::default()
        })
    }

    /// Compute regions from the image bytes instead of the fixed list.
    pub fn with_script<F>(mut self, script: F) -> Self
    where
        F: Fn(&[u8]) -> Vec<TextRegion> + Send + Sync + 'static,
    {
        self.script = Some(Arc::new(script));
        self
    }

    /// Sleep before answering, per image.
    pub fn with_delay<F>(mut self, delay: F) -> Self
    where
        F: Fn(&[u8]) -> Duration + Send + Sync + 'static,
    {
        self.delay = Some(Arc::new(delay));
        self
    }

    /// Number of detect_text calls so far, failed ones included.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrEngine for MockOcr {
    async fn detect_text(&self, image: &[u8]) -> Result<Vec<TextRegion>, CapabilityError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(ref delay) = self.delay {
            let wait = delay(image);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }

        if let Some(ref message) = self.config.permanent_error {
            return Err(CapabilityError::Permanent(message.clone()));
        }
        if call < self.config.transient_failures {
            return Err(CapabilityError::Transient(format!(
                "scripted transient failure {} of {}",
                call + 1,
                self.config.transient_failures
            )));
        }

        match self.script {
            Some(ref script) => Ok(script(image)),
            None => Ok(self.config.regions.clone()),
        }
    }
}

/// Mock translator: prefixes text, optionally failing on matching input.
pub struct MockTranslator {
    prefix: String,
    fail_on: Option<String>,
    calls: AtomicU32,
}

impl MockTranslator {
    pub fn prefix(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            fail_on: None,
            calls: AtomicU32::new(0),
        }
    }

    /// Fail permanently for any text containing `needle`.
    pub fn failing_on(mut self, needle: &str) -> Self {
        self.fail_on = Some(needle.to_string());
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Translator for MockTranslator {
    async fn translate(
        &self,
        text: &str,
        _source_language: &str,
        target_language: &str,
    ) -> Result<String, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(ref needle) = self.fail_on {
            if text.contains(needle.as_str()) {
                return Err(CapabilityError::Permanent(format!(
                    "cannot translate '{}' to {}",
                    text, target_language
                )));
            }
        }
        Ok(format!("{}{}", self.prefix, text))
    }
}

/// Mock typesetter. The output is a header listing the drawn texts followed by
/// the original bytes, so tests can tell which page an output came from.
#[derive(Default)]
pub struct MockTypesetter {
    error: Option<CapabilityError>,
}

impl MockTypesetter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: CapabilityError) -> Self {
        Self { error: Some(error) }
    }
}

#[async_trait]
impl Typesetter for MockTypesetter {
    async fn compose(
        &self,
        image: &[u8],
        regions: &[TypesetRegion],
    ) -> Result<ComposedImage, CapabilityError> {
        if let Some(ref error) = self.error {
            return Err(error.clone());
        }
        let texts: Vec<&str> = regions.iter().map(|r| r.text.as_str()).collect();
        let mut bytes = format!("composed[{}]\n", texts.join("|")).into_bytes();
        bytes.extend_from_slice(image);
        Ok(ComposedImage {
            bytes,
            content_type: "image/png".to_string(),
        })
    }
}
