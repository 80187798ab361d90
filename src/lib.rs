//! # layoutmd
//!
//! Convert PDFs and images to Markdown through a remote layout-parsing
//! service, with durable, resumable per-segment progress.
//!
//! ## Why this crate?
//!
//! Layout-parsing services do the hard part — reading-order recovery,
//! tables, formulae — but a 600-page scan is a terrible unit of work: one
//! network hiccup at page 580 and everything is lost. This crate splits the
//! document into page-range segments, submits each independently, records
//! progress on disk after every step, and assembles the final Markdown from
//! whatever has completed. Re-running the same task directory picks up
//! exactly where the previous run stopped.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF / image
//!  │
//!  ├─ 1. Segment   split into page ranges via lopdf (task_state.json plan)
//!  ├─ 2. Submit    each segment to the layout-parsing endpoint (retries,
//!  │               backoff, heartbeat, cancellation)
//!  ├─ 3. Persist   per-segment Markdown, image map, layout snapshot
//!  ├─ 4. Images    materialize inline / remote image assets
//!  ├─ 5. Merge     recombine fragmented figure crops using layout geometry
//!  └─ 6. Assemble  merged_result.md with page markers and placeholders
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use layoutmd::{run_task, ConversionConfig, ParseClient, RunControl};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConversionConfig::builder()
//!         .api_url("https://ocr.example.com/v1/layout-parsing")
//!         .token(std::env::var("LAYOUT_API_TOKEN")?)
//!         .build()?;
//!     let client = ParseClient::new(config.clone())?;
//!     let control = RunControl::new();
//!     let merged = run_task(
//!         &client,
//!         &config,
//!         Path::new("document.pdf"),
//!         Path::new("out/document"),
//!         &control,
//!     )
//!     .await?;
//!     println!("{}", merged.display());
//!     Ok(())
//! }
//! ```
//!
//! Interrupted? Run it again with the same task directory: completed
//! segments are skipped, pending ones retried, and segments whose
//! recognition options changed since they completed are re-run.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod client;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod segmenter;
pub mod task;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use client::{PageParser, ParseClient};
pub use config::{
    BboxMergeMode, ConversionConfig, ConversionConfigBuilder, LayoutShapeMode, ParseOptions,
};
pub use error::LayoutMdError;
pub use pipeline::assemble::{assemble, AssemblyPolicy};
pub use pipeline::fragments::MergeTuning;
pub use pipeline::orchestrator::{run_task, RunControl};
pub use pipeline::PageSnapshot;
pub use protocol::RecognizedPage;
pub use task::{merged_path, state_path, DocumentKind, SegmentState, TaskState};
