use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Url;
use tracing::debug;

use crate::capabilities::http::classify_status;
use crate::errors::PipelineError;

#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    /// URL after redirects, used to resolve relative links.
    pub final_url: Url,
}

/// HTTP GET with a deadline and a size cap.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    async fn fetch(&self, url: &str, max_bytes: u64) -> Result<FetchedBody, PipelineError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("translateable/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, timeout })
    }

    async fn fetch_inner(&self, url: &str, max_bytes: u64) -> Result<FetchedBody, PipelineError> {
        let parsed = Url::parse(url).map_err(|e| PipelineError::FetchFailed {
            message: format!("invalid URL '{}': {}", url, e),
            transient: false,
        })?;

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| transport_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            let classified = classify_status(status, "");
            return Err(PipelineError::FetchFailed {
                message: format!("GET {} returned {}", url, classified),
                transient: classified.is_transient(),
            });
        }

        if let Some(len) = response.content_length() {
            if len > max_bytes {
                return Err(PipelineError::SourceTooLarge(format!(
                    "{} declares {} bytes, limit is {}",
                    url, len, max_bytes
                )));
            }
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase());

        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| transport_error(url, e))?;
            if bytes.len() as u64 + chunk.len() as u64 > max_bytes {
                return Err(PipelineError::SourceTooLarge(format!(
                    "{} exceeds the download limit of {} bytes",
                    url, max_bytes
                )));
            }
            bytes.extend_from_slice(&chunk);
        }

        debug!("Fetched {} ({} bytes)", final_url, bytes.len());
        Ok(FetchedBody {
            bytes,
            content_type,
            final_url,
        })
    }
}

fn transport_error(url: &str, err: reqwest::Error) -> PipelineError {
    if err.is_timeout() {
        PipelineError::FetchTimeout(format!("GET {}: {}", url, err))
    } else {
        PipelineError::FetchFailed {
            message: format!("GET {}: {}", url, err),
            transient: true,
        }
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, max_bytes: u64) -> Result<FetchedBody, PipelineError> {
        match tokio::time::timeout(self.timeout, self.fetch_inner(url, max_bytes)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::FetchTimeout(format!(
                "GET {} did not complete within {}s",
                url,
                self.timeout.as_secs_f64()
            ))),
        }
    }
}
