//! The conversion pipeline: orchestration, fragment merging, rendering,
//! image materialization, assembly, and Markdown post-processing.

pub mod assemble;
pub mod fragments;
pub mod images;
pub mod orchestrator;
pub mod postprocess;
pub mod render;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-page snapshot persisted as `_parts/<segment_id>_layout.json`.
///
/// Carries everything needed to re-run local post-processing (fragment
/// merging in particular) without another network call: the page's pruned
/// layout, its image srcs, and the Markdown exactly as recognized — the
/// segment's `.md` file gets rewritten in place, so the snapshot is the only
/// place the original fragment references survive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageSnapshot {
    /// 1-based page number within the document.
    pub page_no: u32,
    pub pruned_result: Option<Value>,
    pub markdown_images: Vec<String>,
    pub page_markdown: Option<String>,
}
