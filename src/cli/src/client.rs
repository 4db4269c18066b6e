//! HTTP client for communicating with the Vantage API server.
//!
//! Also defines the wire types the CLI reads: the `ApiResponse` wrapper,
//! the experiment record, and the live event envelope.

use anyhow::{Context, Result};
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// ── Wire types ──────────────────────────────────────────────────────────────

/// API response wrapper matching the server's ApiResponse format.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    #[allow(dead_code)]
    pub error_code: Option<String>,
}

/// An experiment record as served by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: String,
    #[serde(default)]
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub statistical_significance: f64,
    #[serde(default)]
    pub winner: Option<String>,
    #[serde(default)]
    pub confidence_level: f64,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub traffic_percentage: f64,
    #[serde(default)]
    pub visitors: u64,
    #[serde(default)]
    pub conversions: u64,
    #[serde(default)]
    pub conversion_rate: f64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub is_control: bool,
}

/// Envelope carried on the live event stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LiveEvent {
    Experiment { experiment: Experiment },
    Error { message: String },
}

// ── Client ──────────────────────────────────────────────────────────────────

/// HTTP client for the Vantage API.
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a new API client pointing at the given base URL.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Return the configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Perform a GET request and deserialize the response data.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;
        Self::unwrap_response(resp, &url).await
    }

    /// Perform a POST request with a JSON body and deserialize the response.
    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;
        Self::unwrap_response(resp, &url).await
    }

    /// Perform a DELETE request and deserialize the response.
    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .with_context(|| format!("DELETE {} failed", url))?;
        Self::unwrap_response(resp, &url).await
    }

    /// Check the status and unwrap the `ApiResponse` envelope. A success
    /// response with no `data` field deserializes as null, so nullable
    /// payloads (e.g. stop on an absent experiment) come back as `None`.
    async fn unwrap_response<T: DeserializeOwned>(resp: reqwest::Response, url: &str) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        let api_resp: ApiResponse<serde_json::Value> = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))?;

        if api_resp.success {
            let data = api_resp.data.unwrap_or(serde_json::Value::Null);
            serde_json::from_value(data)
                .with_context(|| format!("Unexpected response shape from {}", url))
        } else {
            Err(anyhow::anyhow!(
                "API error: {}",
                api_resp.error.unwrap_or_else(|| "Unknown error".into())
            ))
        }
    }

    /// Perform a raw GET request and return the full JSON value (for the
    /// health endpoint).
    pub async fn get_raw(&self, path: &str) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        resp.json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }

    /// Open the server-sent event stream for an experiment and yield parsed
    /// live events. The stream ends when the server closes the channel.
    pub async fn live_events(&self, experiment_id: &str) -> Result<BoxStream<'static, Result<LiveEvent>>> {
        let url = format!("{}/experiments/{}/live", self.base_url, experiment_id);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        let bytes = resp.bytes_stream().boxed();
        let stream = futures::stream::unfold(
            (bytes, String::new()),
            |(mut bytes, mut buffer)| async move {
                loop {
                    // A complete SSE event ends with a blank line.
                    if let Some(pos) = buffer.find("\n\n") {
                        let frame = buffer[..pos].to_string();
                        buffer.drain(..pos + 2);
                        if let Some(event) = parse_sse_frame(&frame) {
                            return Some((event, (bytes, buffer)));
                        }
                        continue;
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            buffer.push_str(&String::from_utf8_lossy(&chunk));
                        }
                        Some(Err(err)) => {
                            return Some((
                                Err(anyhow::Error::new(err).context("live stream read failed")),
                                (bytes, buffer),
                            ));
                        }
                        None => return None,
                    }
                }
            },
        );
        Ok(stream.boxed())
    }
}

/// Parse one SSE frame into a live event. Comment/keep-alive frames yield
/// nothing.
fn parse_sse_frame(frame: &str) -> Option<Result<LiveEvent>> {
    let data: String = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        .collect::<Vec<_>>()
        .join("\n");
    if data.is_empty() {
        return None;
    }
    Some(serde_json::from_str(&data).context("failed to parse live event"))
}
