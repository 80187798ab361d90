//! Configuration for a document conversion run.
//!
//! All behaviour is controlled through [`ConversionConfig`], built via its
//! [`ConversionConfigBuilder`]. Keeping every knob in one struct makes it
//! trivial to share configs across components, serialise the
//! recognition-affecting subset for fingerprinting, and diff two runs to
//! understand why their outputs differ.
//!
//! Two classes of field matter for resumability:
//!
//! * **Recognition-affecting** fields (endpoint, remote option set, the
//!   per-page rerun settings) feed [`ConversionConfig::recognition_fingerprint`].
//!   Changing any of them invalidates completed segments so stale results are
//!   never silently reused.
//! * **Local post-processing** fields (separator, page numbering, image
//!   display width, fragment-merge tuning) are excluded from the fingerprint
//!   on purpose: adjusting them must never force a network re-run.

use crate::error::LayoutMdError;
use crate::pipeline::fragments::MergeTuning;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::str::FromStr;
use tracing::warn;

/// Overlap-filtering strategy for layout-detection bounding boxes,
/// forwarded to the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BboxMergeMode {
    Large,
    Small,
    Union,
}

impl BboxMergeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BboxMergeMode::Large => "large",
            BboxMergeMode::Small => "small",
            BboxMergeMode::Union => "union",
        }
    }
}

impl FromStr for BboxMergeMode {
    type Err = LayoutMdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "large" => Ok(BboxMergeMode::Large),
            "small" => Ok(BboxMergeMode::Small),
            "union" => Ok(BboxMergeMode::Union),
            other => Err(LayoutMdError::Config(format!(
                "invalid bbox merge mode '{other}' (allowed: large/small/union)"
            ))),
        }
    }
}

/// Geometry the remote service should use for detected layout regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutShapeMode {
    Rect,
    Quad,
    Poly,
    Auto,
}

impl LayoutShapeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LayoutShapeMode::Rect => "rect",
            LayoutShapeMode::Quad => "quad",
            LayoutShapeMode::Poly => "poly",
            LayoutShapeMode::Auto => "auto",
        }
    }
}

impl FromStr for LayoutShapeMode {
    type Err = LayoutMdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rect" => Ok(LayoutShapeMode::Rect),
            "quad" => Ok(LayoutShapeMode::Quad),
            "poly" => Ok(LayoutShapeMode::Poly),
            "auto" => Ok(LayoutShapeMode::Auto),
            other => Err(LayoutMdError::Config(format!(
                "invalid layout shape mode '{other}' (allowed: rect/quad/poly/auto)"
            ))),
        }
    }
}

/// Optional recognition options forwarded to the parsing service.
///
/// `None` means "omit the field; let the server apply its default" — the
/// request stays minimal and the fingerprint only moves when the caller
/// actually pins a value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseOptions {
    pub orientation_classify: Option<bool>,
    pub unwarping: Option<bool>,
    pub chart_recognition: Option<bool>,
    pub layout_detection: Option<bool>,
    pub bbox_merge_mode: Option<BboxMergeMode>,
    pub shape_mode: Option<LayoutShapeMode>,
    pub visualize: Option<bool>,
    pub restructure_pages: Option<bool>,
    pub merge_tables: Option<bool>,
    pub relevel_titles: Option<bool>,
    pub prettify_markdown: Option<bool>,
    pub show_formula_number: Option<bool>,
    /// Task label (`ocr` / `formula` / `table` / `chart`). Only honoured by
    /// the server when layout detection is off.
    pub prompt_label: Option<String>,
}

/// Configuration for converting one document through the parsing service.
///
/// Built via [`ConversionConfig::builder()`] or [`ConversionConfig::default()`].
///
/// # Example
/// ```rust
/// use layoutmd::ConversionConfig;
///
/// let config = ConversionConfig::builder()
///     .api_url("https://ocr.example.com/layout-parsing")
///     .token("secret")
///     .chunk_pages(40)
///     .insert_page_numbers(true)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct ConversionConfig {
    /// Endpoint of the layout-parsing route.
    pub api_url: String,

    /// Endpoint of the restructure-pages route. Empty = derive from `api_url`.
    pub restructure_api_url: String,

    /// Bearer token sent as `Authorization: token <...>`.
    pub token: String,

    /// Maximum pages per segment. Default: 80.
    ///
    /// A segment is one network request; the remote service processes the
    /// whole range before responding. Lowering this shortens individual
    /// requests (less read-timeout exposure) at the cost of more requests.
    pub chunk_pages: u32,

    /// Retry budget per remote call for retryable failures. Default: 3.
    pub max_retries: u32,

    /// TCP connect timeout in seconds. Default: 10.
    pub connect_timeout_secs: u64,

    /// Read timeout per request in seconds. Default: 120.
    ///
    /// Recognition of a dense 80-page segment can take minutes; size this to
    /// the slowest segment you expect, not to typical API latency.
    pub read_timeout_secs: u64,

    /// Retry after a read timeout. Default: false.
    ///
    /// Off by default because a timed-out request may still be processing
    /// (and billing) server-side; retrying risks duplicate work. Enable only
    /// when the service is known to be idempotent per request.
    pub retry_on_read_timeout: bool,

    /// Minimum spacing between any two requests, in milliseconds. Default: 0.
    pub request_min_interval_ms: u64,

    /// Interval of the liveness log line while a call is outstanding. Default: 15 s.
    pub heartbeat_secs: u64,

    /// Separator between page blocks in assembled output. Default: `\n\n---\n\n`.
    pub page_separator: String,

    /// Prefix each page with `<!-- page:N -->` plus a visible page label. Default: false.
    pub insert_page_numbers: bool,

    /// Remote recognition options (fingerprinted).
    pub options: ParseOptions,

    /// Ask the restructure endpoint to concatenate page flows. `None` = skip
    /// the restructure call entirely.
    pub concatenate_pages: Option<bool>,

    /// Pages to rerun locally in image mode, e.g. `"15,18-20"`. Default: empty.
    ///
    /// Occasional characters go missing when a page is parsed as part of a
    /// PDF; rerunning just that page as a rendered image usually recovers
    /// them without resubmitting the whole segment.
    pub rerun_pages: String,

    /// DPI for locally rendered rerun pages. Default: 300.
    pub rerun_dpi: u32,

    /// Longest-side cap for locally rendered rerun pages, in px. Default: 5000.
    pub rerun_max_side_px: u32,

    /// Rewrite image references with a percentage display width (0 = off). Local only.
    pub image_width_percent: u8,

    /// Maximum display height in px for image references (0 = off). Local only.
    pub image_max_height_px: u32,

    /// Reconstruct fragmented figures into single images. Default: true. Local only.
    pub merge_image_fragments: bool,

    /// Clustering thresholds for fragment merging. Local only.
    pub merge_tuning: MergeTuning,

    /// Dump the option payload per segment under `_parts/` for debugging.
    pub debug_dump_requests: bool,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            restructure_api_url: String::new(),
            token: String::new(),
            chunk_pages: 80,
            max_retries: 3,
            connect_timeout_secs: 10,
            read_timeout_secs: 120,
            retry_on_read_timeout: false,
            request_min_interval_ms: 0,
            heartbeat_secs: 15,
            page_separator: "\n\n---\n\n".to_string(),
            insert_page_numbers: false,
            options: ParseOptions::default(),
            concatenate_pages: None,
            rerun_pages: String::new(),
            rerun_dpi: 300,
            rerun_max_side_px: 5000,
            image_width_percent: 0,
            image_max_height_px: 0,
            merge_image_fragments: true,
            merge_tuning: MergeTuning::default(),
            debug_dump_requests: false,
        }
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    /// The option fields attached to every layout-parsing request.
    ///
    /// Applies two pieces of hygiene learned from serving deployments:
    ///
    /// * `prompt_label` only takes effect when layout detection is off. A
    ///   caller that sets the label but leaves detection unset almost always
    ///   means "label mode", so detection is turned off for them (logged).
    /// * When layout detection is explicitly off, detection-scoped fields
    ///   (bbox merge mode, shape mode) are suppressed — some servers read
    ///   them anyway and crop the page as if detection were on.
    ///
    /// Every emitted camelCase key is mirrored in snake_case with the same
    /// value, since serving implementations disagree on the convention.
    pub fn payload_options(&self) -> Map<String, Value> {
        let o = &self.options;
        let mut payload = Map::new();

        let prompt_label = o
            .prompt_label
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        let mut layout_detection = o.layout_detection;
        if prompt_label.is_some() && layout_detection.is_none() {
            warn!(
                label = prompt_label.unwrap_or_default(),
                "prompt label set without layout_detection; forcing layout detection off"
            );
            layout_detection = Some(false);
        }

        if let Some(v) = o.orientation_classify {
            payload.insert("useDocOrientationClassify".into(), json!(v));
        }
        if let Some(v) = o.unwarping {
            payload.insert("useDocUnwarping".into(), json!(v));
        }
        if let Some(v) = o.chart_recognition {
            payload.insert("useChartRecognition".into(), json!(v));
        }
        if let Some(v) = layout_detection {
            payload.insert("useLayoutDetection".into(), json!(v));
        }
        if layout_detection != Some(false) {
            if let Some(m) = o.bbox_merge_mode {
                payload.insert("layoutMergeBboxesMode".into(), json!(m.as_str()));
            }
            if let Some(m) = o.shape_mode {
                payload.insert("layoutShapeMode".into(), json!(m.as_str()));
            }
        }
        if let Some(v) = o.visualize {
            payload.insert("visualize".into(), json!(v));
        }
        if let Some(v) = o.restructure_pages {
            payload.insert("restructurePages".into(), json!(v));
        }
        if let Some(v) = o.merge_tables {
            payload.insert("mergeTables".into(), json!(v));
        }
        if let Some(v) = o.relevel_titles {
            payload.insert("relevelTitles".into(), json!(v));
        }
        if let Some(v) = o.prettify_markdown {
            payload.insert("prettifyMarkdown".into(), json!(v));
        }
        if let Some(v) = o.show_formula_number {
            payload.insert("showFormulaNumber".into(), json!(v));
        }
        if let Some(label) = prompt_label {
            if layout_detection == Some(false) {
                payload.insert("promptLabel".into(), json!(label));
            }
        }

        mirror_snake_case(&mut payload);
        payload
    }

    /// The option fields attached to a restructure-pages request, mirrored
    /// in both casings like [`Self::payload_options`].
    pub fn restructure_options(&self) -> Map<String, Value> {
        let o = &self.options;
        let mut payload = Map::new();
        if let Some(v) = o.merge_tables {
            payload.insert("mergeTables".into(), json!(v));
        }
        if let Some(v) = o.relevel_titles {
            payload.insert("relevelTitles".into(), json!(v));
        }
        if let Some(v) = o.prettify_markdown {
            payload.insert("prettifyMarkdown".into(), json!(v));
        }
        if let Some(v) = o.show_formula_number {
            payload.insert("showFormulaNumber".into(), json!(v));
        }
        mirror_snake_case(&mut payload);
        payload
    }

    /// Hash of every recognition-affecting parameter.
    ///
    /// Stored per segment; a mismatch on a later run resets the segment to
    /// pending so stale recognition output is never reused. Purely local
    /// post-processing parameters are excluded so tweaking, say, image
    /// display width re-assembles without re-calling the service.
    pub fn recognition_fingerprint(&self) -> String {
        let meta = json!({
            "apiUrl": non_empty(&self.api_url),
            "restructureApiUrl": non_empty(&self.restructure_api_url),
            "concatenatePages": self.concatenate_pages,
            "parseOptions": Value::Object(self.payload_options()),
            "rerunPages": non_empty(&self.rerun_pages),
            "rerunDpi": self.rerun_dpi,
            "rerunMaxSidePx": self.rerun_max_side_px,
        });
        // serde_json's default map is ordered by key, so the serialisation is
        // canonical without extra work.
        let raw = serde_json::to_string(&meta).unwrap_or_default();
        blake3::hash(raw.as_bytes()).to_hex().to_string()
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let t = s.trim();
    (!t.is_empty()).then_some(t)
}

fn mirror_snake_case(payload: &mut Map<String, Value>) {
    const MAPPING: &[(&str, &str)] = &[
        ("useDocOrientationClassify", "use_doc_orientation_classify"),
        ("useDocUnwarping", "use_doc_unwarping"),
        ("useChartRecognition", "use_chart_recognition"),
        ("useLayoutDetection", "use_layout_detection"),
        ("layoutMergeBboxesMode", "layout_merge_bboxes_mode"),
        ("layoutShapeMode", "layout_shape_mode"),
        ("restructurePages", "restructure_pages"),
        ("mergeTables", "merge_tables"),
        ("relevelTitles", "relevel_titles"),
        ("prettifyMarkdown", "prettify_markdown"),
        ("showFormulaNumber", "show_formula_number"),
        ("promptLabel", "prompt_label"),
    ];
    for (camel, snake) in MAPPING {
        if let Some(v) = payload.get(*camel).cloned() {
            payload.entry(snake.to_string()).or_insert(v);
        }
    }
}

/// Builder for [`ConversionConfig`].
#[derive(Debug)]
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_url = url.into();
        self
    }

    pub fn restructure_api_url(mut self, url: impl Into<String>) -> Self {
        self.config.restructure_api_url = url.into();
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = token.into();
        self
    }

    pub fn chunk_pages(mut self, pages: u32) -> Self {
        self.config.chunk_pages = pages.max(1);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.config.connect_timeout_secs = secs.max(1);
        self
    }

    pub fn read_timeout_secs(mut self, secs: u64) -> Self {
        self.config.read_timeout_secs = secs.max(1);
        self
    }

    pub fn retry_on_read_timeout(mut self, v: bool) -> Self {
        self.config.retry_on_read_timeout = v;
        self
    }

    pub fn request_min_interval_ms(mut self, ms: u64) -> Self {
        self.config.request_min_interval_ms = ms;
        self
    }

    pub fn heartbeat_secs(mut self, secs: u64) -> Self {
        self.config.heartbeat_secs = secs.max(1);
        self
    }

    pub fn page_separator(mut self, sep: impl Into<String>) -> Self {
        self.config.page_separator = sep.into();
        self
    }

    pub fn insert_page_numbers(mut self, v: bool) -> Self {
        self.config.insert_page_numbers = v;
        self
    }

    pub fn options(mut self, options: ParseOptions) -> Self {
        self.config.options = options;
        self
    }

    pub fn concatenate_pages(mut self, v: Option<bool>) -> Self {
        self.config.concatenate_pages = v;
        self
    }

    pub fn rerun_pages(mut self, spec: impl Into<String>) -> Self {
        self.config.rerun_pages = spec.into();
        self
    }

    pub fn rerun_dpi(mut self, dpi: u32) -> Self {
        self.config.rerun_dpi = dpi.clamp(72, 1200);
        self
    }

    pub fn rerun_max_side_px(mut self, px: u32) -> Self {
        self.config.rerun_max_side_px = px.max(512);
        self
    }

    pub fn image_width_percent(mut self, pct: u8) -> Self {
        self.config.image_width_percent = pct.min(100);
        self
    }

    pub fn image_max_height_px(mut self, px: u32) -> Self {
        self.config.image_max_height_px = px;
        self
    }

    pub fn merge_image_fragments(mut self, v: bool) -> Self {
        self.config.merge_image_fragments = v;
        self
    }

    pub fn merge_tuning(mut self, tuning: MergeTuning) -> Self {
        self.config.merge_tuning = tuning;
        self
    }

    pub fn debug_dump_requests(mut self, v: bool) -> Self {
        self.config.debug_dump_requests = v;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, LayoutMdError> {
        let c = &self.config;
        if c.chunk_pages == 0 {
            return Err(LayoutMdError::Config("chunk_pages must be ≥ 1".into()));
        }
        if c.image_width_percent > 100 {
            return Err(LayoutMdError::Config(format!(
                "image_width_percent must be 0–100, got {}",
                c.image_width_percent
            )));
        }
        Ok(self.config)
    }
}
