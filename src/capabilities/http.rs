// JSON-over-HTTP adapters for the OCR and translation capabilities.
//
// OCR:         POST {url} {"image": <base64>, "model"?}      -> {"regions": [TextRegion]}
// Translation: POST {url} {"text", "source", "target", "model"?} -> {"text": "..."}
//
// Each call is a single attempt; retries and deadlines are applied by the
// page processor.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capabilities::{CapabilityError, OcrEngine, TextRegion, Translator};
use crate::models::CapabilityEndpoint;

/// Classify a transport error: timeouts and connection failures are transient.
pub fn classify_transport(err: &reqwest::Error) -> CapabilityError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        CapabilityError::Transient(err.to_string())
    } else if err.is_decode() {
        CapabilityError::Permanent(format!("invalid response body: {}", err))
    } else {
        CapabilityError::Transient(err.to_string())
    }
}

/// Classify a non-success status: 5xx and 429 are transient, other 4xx are not.
pub fn classify_status(status: StatusCode, body: &str) -> CapabilityError {
    let message = if body.trim().is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, truncate(body.trim(), 300))
    };
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        CapabilityError::Transient(message)
    } else {
        CapabilityError::Permanent(message)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

struct EndpointClient {
    http_client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: Option<String>,
}

impl EndpointClient {
    fn new(endpoint: &CapabilityEndpoint, timeout: Duration) -> Result<Self> {
        let api_key = match endpoint.api_key_env {
            Some(ref var) => Some(
                std::env::var(var)
                    .with_context(|| format!("{} environment variable not set", var))?,
            ),
            None => None,
        };

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(8)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            url: endpoint.url.clone(),
            api_key,
            model: endpoint.model.clone(),
        })
    }

    async fn post_json<Req, Resp>(&self, body: &Req) -> Result<Resp, CapabilityError>
    where
        Req: Serialize + Sync,
        Resp: for<'de> Deserialize<'de>,
    {
        let mut request = self.http_client.post(&self.url).json(body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| classify_transport(&e))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }
        response
            .json::<Resp>()
            .await
            .map_err(|e| classify_transport(&e))
    }
}

// ---------------------------------------------------------------------------
// OCR
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct OcrRequest<'a> {
    image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Deserialize)]
struct OcrResponse {
    #[serde(default)]
    regions: Vec<TextRegion>,
}

pub struct HttpOcrEngine {
    client: EndpointClient,
}

impl HttpOcrEngine {
    pub fn new(endpoint: &CapabilityEndpoint, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: EndpointClient::new(endpoint, timeout)?,
        })
    }
}

#[async_trait]
impl OcrEngine for HttpOcrEngine {
    async fn detect_text(&self, image: &[u8]) -> Result<Vec<TextRegion>, CapabilityError> {
        let request = OcrRequest {
            image: STANDARD.encode(image),
            model: self.client.model.as_deref(),
        };
        let response: OcrResponse = self.client.post_json(&request).await?;
        debug!("OCR returned {} regions", response.regions.len());
        Ok(response.regions)
    }
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct TranslateRequest<'a> {
    text: &'a str,
    source: &'a str,
    target: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Deserialize)]
struct TranslateResponse {
    #[serde(alias = "translation")]
    text: String,
}

pub struct HttpTranslator {
    client: EndpointClient,
}

impl HttpTranslator {
    pub fn new(endpoint: &CapabilityEndpoint, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: EndpointClient::new(endpoint, timeout)?,
        })
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn translate(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> Result<String, CapabilityError> {
        let request = TranslateRequest {
            text,
            source: source_language,
            target: target_language,
            model: self.client.model.as_deref(),
        };
        let response: TranslateResponse = self.client.post_json(&request).await?;
        if response.text.trim().is_empty() {
            return Err(CapabilityError::Permanent(
                "translation endpoint returned empty text".to_string(),
            ));
        }
        Ok(response.text)
    }
}
