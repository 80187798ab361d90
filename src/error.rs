//! Error types for the layoutmd library.
//!
//! The taxonomy mirrors how failures propagate through a segmented run:
//!
//! * **Configuration** errors (missing endpoint or token, invalid option
//!   values) are fatal and fail fast — no request is ever issued.
//! * **Transport and server** errors are retried with backoff inside the
//!   client; what surfaces here is the post-retry verdict. A read timeout is
//!   deliberately *not* retried by default: the server may have accepted the
//!   request and still be working (and billing) on it, so an automatic
//!   resubmit risks duplicate work. [`LayoutMdError::ReadTimeout`] keeps that
//!   case distinguishable from ordinary transport failures.
//! * **Segment-level** failures never abort a document run. They are recorded
//!   in the task state, rendered as placeholder blocks, and rolled up into
//!   [`LayoutMdError::SegmentsFailed`] after every segment had its turn.
//! * **Cancellation** is a dedicated condition, not a failure, so callers can
//!   tell "the user stopped this" apart from "this broke".

use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the layoutmd library.
#[derive(Debug, Error)]
pub enum LayoutMdError {
    // ── Configuration ─────────────────────────────────────────────────────
    /// Invalid or incomplete configuration. Fatal, never retried.
    #[error("Invalid configuration: {0}")]
    Config(String),

    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'")]
    FileNotFound { path: PathBuf },

    /// The input file extension maps to neither `pdf` nor a known image type.
    #[error("Unsupported file type: '{path}'")]
    UnsupportedFile { path: PathBuf },

    /// The PDF could not be loaded or has no pages.
    #[error("PDF error for '{path}': {detail}")]
    Pdf { path: PathBuf, detail: String },

    // ── Remote parsing client ─────────────────────────────────────────────
    /// HTTP 401/403 from the parsing service. Fatal for the run.
    #[error("Authentication failed (HTTP {status}); check the configured token")]
    Auth { status: u16 },

    /// Non-retryable 4xx (other than 408/429). Body is truncated for logs.
    #[error("Client error (HTTP {status}): {body}")]
    Client { status: u16, body: String },

    /// 408/429/5xx or a transport failure that survived all retries.
    ///
    /// Retryable in nature — a later run may succeed — but the retry budget
    /// for this call is spent. `status` is the last HTTP status seen, `None`
    /// when the final failure never got a response.
    #[error("Retryable failure after {attempts} attempt(s): {detail}")]
    Retryable {
        attempts: u32,
        status: Option<u16>,
        detail: String,
    },

    /// Read timeout with `retry_on_read_timeout` disabled.
    ///
    /// Not retried: the server may have accepted the request and still be
    /// processing it. Raise `read_timeout_secs`, or lower `chunk_pages` so a
    /// single request finishes sooner, then rerun the task.
    #[error(
        "Read timed out after {secs}s; not retried to avoid duplicate server-side work.\n\
         Raise read_timeout_secs or lower chunk_pages and rerun — completed segments are kept."
    )]
    ReadTimeout { secs: u64 },

    /// Response was not JSON or lacked the expected structure, after retries.
    #[error("Malformed response from parsing service: {detail}")]
    MalformedResponse { detail: String },

    // ── Run-level ─────────────────────────────────────────────────────────
    /// The run was canceled cooperatively. Not a failure.
    #[error("Run canceled")]
    Canceled,

    /// One or more segments failed after all were attempted.
    ///
    /// A best-effort `merged_result.md` with placeholder blocks was still
    /// written so the failed page ranges can be located and rerun.
    #[error("{failed} segment(s) failed (best-effort document written): {summary}")]
    SegmentsFailed { failed: usize, summary: String },

    /// Assembly was requested but the task has no segments at all.
    #[error("No segments to assemble")]
    NoSegments,

    /// Strict assembly refused because some segments are not done.
    #[error("{pending} segment(s) not yet done; strict assembly refused")]
    Incomplete { pending: usize },

    // ── I/O ───────────────────────────────────────────────────────────────
    /// Reading or writing task files failed.
    #[error("I/O error for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Image decoding/encoding failed during fragment merging.
    #[error("Image error: {0}")]
    Image(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LayoutMdError {
    /// Whether a later run (after operator action or backoff) could
    /// plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LayoutMdError::Retryable { .. }
                | LayoutMdError::ReadTimeout { .. }
                | LayoutMdError::SegmentsFailed { .. }
        )
    }

    /// Shorthand used where file system errors are mapped inline.
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LayoutMdError::Io {
            path: path.into(),
            source,
        }
    }
}
