//! Materializes the image assets referenced by recognized Markdown.
//!
//! A page's image map gives `relative path → source reference`, where the
//! reference can be a `data:image/...;base64,` URL, bare base64 (some
//! servers inline the bytes without the data-URL wrapper), an absolute URL,
//! or a path relative to the parse endpoint. Everything is written under the
//! task directory at its relative path.
//!
//! Downloads are best effort with their own small retry loop; a failed image
//! never fails the run. Completed paths are recorded in the task state as
//! they land, so a resumed run skips them.

use crate::config::ConversionConfig;
use crate::error::LayoutMdError;
use crate::task::TaskState;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

static B64_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9+/=\s]+$").unwrap());

/// Decode an inline image reference, if that is what it is.
pub(crate) fn decode_inline_image(value: &str) -> Option<Vec<u8>> {
    if value.starts_with("data:image/") {
        let b64 = value.split_once(";base64,")?.1;
        let cleaned: String = b64.chars().filter(|c| !c.is_whitespace()).collect();
        return base64::engine::general_purpose::STANDARD.decode(cleaned).ok();
    }
    // Bare base64, possibly with embedded newlines.
    let cleaned: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.len() >= 64 && cleaned.len() % 4 == 0 && B64_RE.is_match(value) {
        return base64::engine::general_purpose::STANDARD.decode(cleaned).ok();
    }
    None
}

fn is_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Presigned object-store URLs carry auth in the URL; sending the service
/// token as well makes some providers reject the request.
pub(crate) fn should_omit_auth_header(url: &str) -> bool {
    let u = url.to_ascii_lowercase();
    u.contains("bcebos.com") || u.contains("authorization=bce-auth-v1")
}

/// Resolve a possibly-relative reference against the parse endpoint.
pub(crate) fn resolve_ref(api_url: &str, reference: &str) -> Option<String> {
    let r = reference.trim();
    if r.is_empty() {
        return None;
    }
    if is_url(r) {
        return Some(r.to_string());
    }
    let base = api_url.trim();
    if !is_url(base) {
        return None;
    }
    if let Some(rest) = r.strip_prefix('/') {
        // Host-absolute: keep scheme and authority only.
        let scheme_end = base.find("://")? + 3;
        let authority_end = base[scheme_end..]
            .find('/')
            .map(|i| scheme_end + i)
            .unwrap_or(base.len());
        return Some(format!("{}/{rest}", &base[..authority_end]));
    }
    Some(format!("{}/{r}", base.trim_end_matches('/')))
}

/// Downloads image assets into a task directory.
pub struct ImageDownloader {
    http: reqwest::Client,
    api_url: String,
    auth: Option<String>,
    max_retries: u32,
}

impl ImageDownloader {
    pub fn new(config: &ConversionConfig) -> Result<Self, LayoutMdError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.read_timeout_secs))
            .build()
            .map_err(|e| LayoutMdError::Internal(format!("building HTTP client: {e}")))?;
        let auth = {
            let t = config.token.trim();
            (!t.is_empty()).then(|| format!("token {t}"))
        };
        Ok(Self {
            http,
            api_url: config.api_url.clone(),
            auth,
            max_retries: config.max_retries,
        })
    }

    /// Materialize every reference not yet recorded as downloaded. The state
    /// is saved after each asset so progress survives interruption.
    pub async fn download(
        &self,
        task_dir: &Path,
        state: &mut TaskState,
        images: &BTreeMap<String, String>,
    ) -> Result<(), LayoutMdError> {
        for (rel_path, reference) in images {
            let rel_path = rel_path.replace('\\', "/");
            if state.images_downloaded.contains(&rel_path) {
                continue;
            }

            let dst = task_dir.join(&rel_path);
            if let Some(parent) = dst.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| LayoutMdError::io(parent, e))?;
            }

            if let Some(bytes) = decode_inline_image(reference) {
                tokio::fs::write(&dst, bytes)
                    .await
                    .map_err(|e| LayoutMdError::io(&dst, e))?;
                state.images_downloaded.insert(rel_path);
                state.save(task_dir).await?;
                continue;
            }

            let Some(url) = resolve_ref(&self.api_url, reference) else {
                warn!(rel = %rel_path, reference, "unrecognized image reference; skipping");
                continue;
            };

            if self.fetch_to(&url, &dst).await {
                state.images_downloaded.insert(rel_path);
                state.save(task_dir).await?;
            }
        }
        Ok(())
    }

    async fn fetch_to(&self, url: &str, dst: &Path) -> bool {
        let auth = if should_omit_auth_header(url) {
            None
        } else {
            self.auth.as_deref()
        };
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let mut req = self.http.get(url);
            if let Some(auth) = auth {
                req = req.header(reqwest::header::AUTHORIZATION, auth);
            }
            let outcome: Result<(), String> = match req.send().await {
                Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                    Ok(bytes) => match tokio::fs::write(dst, &bytes).await {
                        Ok(()) => {
                            debug!(url, path = %dst.display(), "image downloaded");
                            return true;
                        }
                        Err(e) => Err(format!("write: {e}")),
                    },
                    Err(e) => Err(format!("body: {e}")),
                },
                Ok(resp) => Err(format!("HTTP {}", resp.status().as_u16())),
                Err(e) => Err(e.to_string()),
            };
            if let Err(detail) = outcome {
                if attempt <= self.max_retries {
                    let secs = (2f64.powi(attempt.saturating_sub(1).min(8) as i32) + 0.2).min(10.0);
                    sleep(Duration::from_secs_f64(secs)).await;
                    continue;
                }
                warn!(url, error = %detail, "image download failed; leaving reference dangling");
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::DocumentKind;

    #[test]
    fn data_url_decodes() {
        let bytes = decode_inline_image("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn bare_base64_needs_length_and_padding() {
        let long = base64::engine::general_purpose::STANDARD.encode([7u8; 60]);
        assert!(decode_inline_image(&long).is_some());
        // short strings are treated as paths, not payloads
        assert!(decode_inline_image("aGVsbG8=").is_none());
        assert!(decode_inline_image("images/a.png").is_none());
    }

    #[test]
    fn base64_with_newlines_decodes() {
        let encoded = base64::engine::general_purpose::STANDARD.encode([9u8; 96]);
        let wrapped = format!("{}\n{}", &encoded[..64], &encoded[64..]);
        assert!(decode_inline_image(&wrapped).is_some());
    }

    #[test]
    fn reference_resolution() {
        let api = "https://ocr.example.com/v1/layout-parsing";
        assert_eq!(
            resolve_ref(api, "https://cdn.example.com/x.png").unwrap(),
            "https://cdn.example.com/x.png"
        );
        assert_eq!(
            resolve_ref(api, "/outputImages/x.png").unwrap(),
            "https://ocr.example.com/outputImages/x.png"
        );
        assert_eq!(
            resolve_ref(api, "outputImages/x.png").unwrap(),
            "https://ocr.example.com/v1/layout-parsing/outputImages/x.png"
        );
        assert!(resolve_ref("", "outputImages/x.png").is_none());
        assert!(resolve_ref(api, "  ").is_none());
    }

    #[test]
    fn presigned_urls_skip_auth() {
        assert!(should_omit_auth_header(
            "https://bj.bcebos.com/bucket/x.png?sig=1"
        ));
        assert!(should_omit_auth_header(
            "https://other.example.com/x.png?authorization=bce-auth-v1%2F..."
        ));
        assert!(!should_omit_auth_header("https://cdn.example.com/x.png"));
    }

    #[tokio::test]
    async fn inline_images_materialize_and_are_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConversionConfig::default();
        let downloader = ImageDownloader::new(&config).unwrap();
        let mut state = TaskState::new("in.pdf", DocumentKind::Pdf);
        let images: BTreeMap<String, String> = [(
            "images/a.png".to_string(),
            "data:image/png;base64,aGVsbG8=".to_string(),
        )]
        .into();

        downloader
            .download(dir.path(), &mut state, &images)
            .await
            .unwrap();
        assert_eq!(
            tokio::fs::read(dir.path().join("images/a.png")).await.unwrap(),
            b"hello"
        );
        assert!(state.images_downloaded.contains("images/a.png"));

        // second pass is a no-op
        downloader
            .download(dir.path(), &mut state, &images)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unreachable_remote_image_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // bind and drop to get a port nothing listens on
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let config = ConversionConfig::builder().max_retries(0).build().unwrap();
        let downloader = ImageDownloader::new(&config).unwrap();
        let mut state = TaskState::new("in.pdf", DocumentKind::Pdf);
        let images: BTreeMap<String, String> = [(
            "images/x.png".to_string(),
            format!("http://127.0.0.1:{port}/img.png"),
        )]
        .into();

        downloader
            .download(dir.path(), &mut state, &images)
            .await
            .unwrap();
        assert!(!dir.path().join("images/x.png").exists());
        assert!(state.images_downloaded.is_empty());
    }
}
