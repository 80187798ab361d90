//! Wire shapes of the layout-parsing service.
//!
//! The request body is assembled as loose JSON rather than a fixed struct:
//! the option set is an open map (see `ConversionConfig::payload_options`)
//! and servers tolerate unknown fields, so a `serde_json::Value` keeps the
//! camelCase/snake_case mirroring in one place. Responses are validated
//! strictly — a body that parses as JSON but lacks the expected structure is
//! a [`LayoutMdError::MalformedResponse`], which the client treats as
//! retryable until its budget runs out.

use crate::error::LayoutMdError;
use crate::task::DocumentKind;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Result of recognizing one page.
#[derive(Debug, Clone, Default)]
pub struct RecognizedPage {
    /// Markdown for the page, image references included.
    pub markdown: String,
    /// Relative image path → source reference (URL, data URL, or bare base64).
    pub images: BTreeMap<String, String>,
    /// Structured pruned layout, when the server returned one.
    pub layout: Option<Value>,
}

/// Body of a layout-parsing request.
pub fn build_parse_body(
    file_b64: &str,
    kind: DocumentKind,
    options: &Map<String, Value>,
) -> Value {
    let mut body = Map::new();
    body.insert("file".into(), json!(file_b64));
    body.insert("fileType".into(), json!(kind.file_type_code()));
    // Some serving builds read the snake_case spelling.
    body.insert("file_type".into(), json!(kind.file_type_code()));
    for (k, v) in options {
        body.insert(k.clone(), v.clone());
    }
    Value::Object(body)
}

/// Body of a restructure-pages request.
///
/// `extra` carries the restructure-scoped option fields (merge tables,
/// relevel titles, prettify, formula numbering) already mirrored in both
/// casings by the config layer.
pub fn build_restructure_body(
    pages: &[RecognizedPage],
    concatenate: bool,
    extra: &Map<String, Value>,
) -> Value {
    let page_values: Vec<Value> = pages
        .iter()
        .map(|p| {
            json!({
                "prunedResult": p.layout.clone().unwrap_or_else(|| json!({})),
                "markdownImages": p.images,
            })
        })
        .collect();
    let mut body = Map::new();
    body.insert("pages".into(), Value::Array(page_values));
    body.insert("concatenatePages".into(), json!(concatenate));
    body.insert("concatenate_pages".into(), json!(concatenate));
    for (k, v) in extra {
        body.insert(k.clone(), v.clone());
    }
    Value::Object(body)
}

/// Extract recognized pages from a parse or restructure response.
///
/// Expected shape: `{"result": {"layoutParsingResults": [{"markdown":
/// {"text": ..., "images": {...}}, "prunedResult": ...}, ...]}}`.
pub fn parse_pages(body: &Value) -> Result<Vec<RecognizedPage>, LayoutMdError> {
    let results = body
        .get("result")
        .and_then(|r| r.get("layoutParsingResults"))
        .and_then(Value::as_array)
        .ok_or_else(|| LayoutMdError::MalformedResponse {
            detail: describe_missing(body),
        })?;

    let mut pages = Vec::with_capacity(results.len());
    for (idx, entry) in results.iter().enumerate() {
        let markdown = entry
            .get("markdown")
            .ok_or_else(|| LayoutMdError::MalformedResponse {
                detail: format!("layoutParsingResults[{idx}] has no 'markdown' object"),
            })?;
        let text = markdown
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut images = BTreeMap::new();
        if let Some(map) = markdown.get("images").and_then(Value::as_object) {
            for (path, source) in map {
                if let Some(s) = source.as_str() {
                    images.insert(path.clone(), s.to_string());
                }
            }
        }
        let layout = entry.get("prunedResult").filter(|v| !v.is_null()).cloned();
        pages.push(RecognizedPage {
            markdown: text,
            images,
            layout,
        });
    }
    Ok(pages)
}

fn describe_missing(body: &Value) -> String {
    match body.get("result") {
        None => {
            // Surface the server's own error text when it sent one.
            let msg = body
                .get("errorMsg")
                .or_else(|| body.get("message"))
                .and_then(Value::as_str);
            match msg {
                Some(m) => format!("no 'result' object (server said: {m})"),
                None => "no 'result' object in response".into(),
            }
        }
        Some(_) => "'result.layoutParsingResults' missing or not an array".into(),
    }
}
