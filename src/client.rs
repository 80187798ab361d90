//! HTTP client for the layout-parsing service.
//!
//! ## Retry strategy
//!
//! Failures are classified per response status:
//!
//! * 401/403 — auth failure, fatal for the run.
//! * Other 4xx except 408/429 — client error, fatal; body kept (truncated)
//!   for diagnosis.
//! * 408/429/5xx and transport errors — retried with exponential backoff
//!   (`2^(attempt-1)` s plus up to 0.3 s of jitter, capped at 30 s) up to
//!   `max_retries`, then surfaced as a retryable failure.
//! * A 2xx body that is not JSON, or JSON without the expected structure, is
//!   retried the same way; some gateways return HTML error pages with 200.
//!
//! One carve-out: a **read timeout** is not retried unless
//! `retry_on_read_timeout` is set. The server may have accepted the request
//! and still be processing (and billing) it, so an automatic resubmit risks
//! duplicate work. The orchestrator keeps the segment pending so a later run
//! can pick it up.
//!
//! An optional client-side minimum inter-request interval spaces calls out
//! for rate-limited deployments.

use crate::config::ConversionConfig;
use crate::error::LayoutMdError;
use crate::protocol::{self, RecognizedPage};
use crate::task::DocumentKind;
use base64::Engine;
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

/// The recognition seam the orchestrator drives.
///
/// Implemented by [`ParseClient`] in production and by scripted fakes in
/// tests, so orchestration logic is exercised without a network.
pub trait PageParser: Send + Sync {
    /// Submit one file (whole input or an extracted page range) and return
    /// its recognized pages in order.
    fn parse_file(
        &self,
        path: &Path,
        kind: DocumentKind,
    ) -> impl Future<Output = Result<Vec<RecognizedPage>, LayoutMdError>> + Send;

    /// Re-flow already recognized pages through the restructure endpoint.
    fn restructure(
        &self,
        pages: &[RecognizedPage],
        concatenate: bool,
    ) -> impl Future<Output = Result<Vec<RecognizedPage>, LayoutMdError>> + Send;
}

/// How a response status is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusClass {
    Ok,
    AuthFatal,
    ClientFatal,
    Retryable,
}

pub(crate) fn classify_status(status: u16) -> StatusClass {
    match status {
        401 | 403 => StatusClass::AuthFatal,
        408 | 429 => StatusClass::Retryable,
        400..=499 => StatusClass::ClientFatal,
        500..=599 => StatusClass::Retryable,
        _ => StatusClass::Ok,
    }
}

/// Backoff before retry `attempt` (1-based): `2^(attempt-1)` s + jitter, ≤ 30 s.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let base = 2f64.powi(attempt.saturating_sub(1).min(16) as i32);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let jitter = (nanos % 1000) as f64 / 1000.0 * 0.3;
    Duration::from_secs_f64((base + jitter).min(30.0))
}

/// Restructure endpoint derived from the parse endpoint when not configured.
pub(crate) fn derive_restructure_url(api_url: &str) -> String {
    let u = api_url.trim();
    if u.is_empty() {
        return String::new();
    }
    for suffix in ["/layout-parsing", "/layout_parsing"] {
        if let Some(base) = u.strip_suffix(suffix) {
            return format!("{base}/restructure-pages");
        }
    }
    format!("{}/restructure-pages", u.trim_end_matches('/'))
}

fn truncate_body(body: &str) -> String {
    let mut s: String = body.chars().take(200).collect();
    if s.len() < body.len() {
        s.push('…');
    }
    s
}

/// Client for the layout-parsing and restructure-pages routes.
pub struct ParseClient {
    http: reqwest::Client,
    config: ConversionConfig,
    last_request_at: Mutex<Option<Instant>>,
}

impl ParseClient {
    /// Build a client, failing fast on missing endpoint or token.
    pub fn new(config: ConversionConfig) -> Result<Self, LayoutMdError> {
        if config.api_url.trim().is_empty() {
            return Err(LayoutMdError::Config("api_url is not configured".into()));
        }
        if config.token.trim().is_empty() {
            return Err(LayoutMdError::Config("token is not configured".into()));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.read_timeout_secs))
            .build()
            .map_err(|e| LayoutMdError::Internal(format!("building HTTP client: {e}")))?;
        Ok(Self {
            http,
            config,
            last_request_at: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    fn restructure_url(&self) -> Result<String, LayoutMdError> {
        let configured = self.config.restructure_api_url.trim();
        let url = if configured.is_empty() {
            derive_restructure_url(&self.config.api_url)
        } else {
            configured.to_string()
        };
        if url.is_empty() {
            return Err(LayoutMdError::Config(
                "restructure_api_url is not configured and cannot be derived".into(),
            ));
        }
        Ok(url)
    }

    async fn respect_min_interval(&self) {
        let ms = self.config.request_min_interval_ms;
        if ms == 0 {
            return;
        }
        let mut last = self.last_request_at.lock().await;
        if let Some(at) = *last {
            let spacing = Duration::from_millis(ms);
            let elapsed = at.elapsed();
            if elapsed < spacing {
                sleep(spacing - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// POST with the retry policy described at module level.
    async fn post_pages(
        &self,
        url: &str,
        body: &Value,
        what: &str,
    ) -> Result<Vec<RecognizedPage>, LayoutMdError> {
        let auth = format!("token {}", self.config.token);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.respect_min_interval().await;

            let sent = self
                .http
                .post(url)
                .header(reqwest::header::AUTHORIZATION, &auth)
                .json(body)
                .send()
                .await;

            let resp = match sent {
                Ok(resp) => resp,
                Err(e) => {
                    let read_timeout = e.is_timeout() && !e.is_connect();
                    if read_timeout && !self.config.retry_on_read_timeout {
                        return Err(LayoutMdError::ReadTimeout {
                            secs: self.config.read_timeout_secs,
                        });
                    }
                    if attempt <= self.config.max_retries {
                        let delay = backoff_delay(attempt);
                        warn!(%what, attempt, error = %e, delay_ms = delay.as_millis() as u64,
                              "transport error; backing off");
                        sleep(delay).await;
                        continue;
                    }
                    return Err(LayoutMdError::Retryable {
                        attempts: attempt,
                        status: None,
                        detail: format!("network error: {e}"),
                    });
                }
            };

            let status = resp.status().as_u16();
            match classify_status(status) {
                StatusClass::AuthFatal => return Err(LayoutMdError::Auth { status }),
                StatusClass::ClientFatal => {
                    let mut body_text = truncate_body(&resp.text().await.unwrap_or_default());
                    if status == 404 {
                        body_text.push_str(
                            "; check that api_url points at the layout-parsing route",
                        );
                    }
                    return Err(LayoutMdError::Client {
                        status,
                        body: body_text,
                    });
                }
                StatusClass::Retryable => {
                    let body_text = truncate_body(&resp.text().await.unwrap_or_default());
                    if attempt <= self.config.max_retries {
                        let delay = backoff_delay(attempt);
                        warn!(%what, attempt, status, delay_ms = delay.as_millis() as u64,
                              "server error; backing off");
                        sleep(delay).await;
                        continue;
                    }
                    return Err(LayoutMdError::Retryable {
                        attempts: attempt,
                        status: Some(status),
                        detail: format!("HTTP {status}: {body_text}"),
                    });
                }
                StatusClass::Ok => {}
            }

            let parsed = match resp.json::<Value>().await {
                Ok(v) => protocol::parse_pages(&v),
                Err(e) => Err(LayoutMdError::MalformedResponse {
                    detail: format!("response is not JSON: {e}"),
                }),
            };
            match parsed {
                Ok(pages) => {
                    debug!(%what, attempt, pages = pages.len(), "request succeeded");
                    return Ok(pages);
                }
                Err(e) if attempt <= self.config.max_retries => {
                    let delay = backoff_delay(attempt);
                    warn!(%what, attempt, error = %e, delay_ms = delay.as_millis() as u64,
                          "unusable response; backing off");
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl PageParser for ParseClient {
    async fn parse_file(
        &self,
        path: &Path,
        kind: DocumentKind,
    ) -> Result<Vec<RecognizedPage>, LayoutMdError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| LayoutMdError::io(path, e))?;
        let file_b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
        let body = protocol::build_parse_body(&file_b64, kind, &self.config.payload_options());
        self.post_pages(&self.config.api_url, &body, "layout-parsing")
            .await
    }

    async fn restructure(
        &self,
        pages: &[RecognizedPage],
        concatenate: bool,
    ) -> Result<Vec<RecognizedPage>, LayoutMdError> {
        let url = self.restructure_url()?;
        let body =
            protocol::build_restructure_body(pages, concatenate, &self.config.restructure_options());
        self.post_pages(&url, &body, "restructure-pages").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_taxonomy() {
        assert_eq!(classify_status(200), StatusClass::Ok);
        assert_eq!(classify_status(401), StatusClass::AuthFatal);
        assert_eq!(classify_status(403), StatusClass::AuthFatal);
        assert_eq!(classify_status(404), StatusClass::ClientFatal);
        assert_eq!(classify_status(422), StatusClass::ClientFatal);
        assert_eq!(classify_status(408), StatusClass::Retryable);
        assert_eq!(classify_status(429), StatusClass::Retryable);
        assert_eq!(classify_status(500), StatusClass::Retryable);
        assert_eq!(classify_status(503), StatusClass::Retryable);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let d1 = backoff_delay(1);
        let d3 = backoff_delay(3);
        assert!(d1 >= Duration::from_secs(1) && d1 < Duration::from_millis(1400));
        assert!(d3 >= Duration::from_secs(4) && d3 < Duration::from_millis(4400));
        assert!(backoff_delay(12) <= Duration::from_secs(30));
        assert!(backoff_delay(u32::MAX) <= Duration::from_secs(30));
    }

    #[test]
    fn restructure_url_derivation() {
        assert_eq!(
            derive_restructure_url("https://x.example.com/v1/layout-parsing"),
            "https://x.example.com/v1/restructure-pages"
        );
        assert_eq!(
            derive_restructure_url("https://x.example.com/v1/layout_parsing"),
            "https://x.example.com/v1/restructure-pages"
        );
        assert_eq!(
            derive_restructure_url("https://x.example.com/v1/"),
            "https://x.example.com/v1/restructure-pages"
        );
        assert_eq!(derive_restructure_url("  "), "");
    }

    #[test]
    fn new_requires_endpoint_and_token() {
        let no_url = ConversionConfig::builder().token("t").build().unwrap();
        assert!(matches!(
            ParseClient::new(no_url),
            Err(LayoutMdError::Config(_))
        ));
        let no_token = ConversionConfig::builder()
            .api_url("https://x.example.com/layout-parsing")
            .build()
            .unwrap();
        assert!(matches!(
            ParseClient::new(no_token),
            Err(LayoutMdError::Config(_))
        ));
    }

    #[test]
    fn body_truncation() {
        let long = "x".repeat(500);
        let t = truncate_body(&long);
        assert!(t.chars().count() == 201 && t.ends_with('…'));
        assert_eq!(truncate_body("short"), "short");
    }
}
