//! Reconstructs figures the parsing service split into fragment images.
//!
//! Layout detection frequently cuts one figure into several crops (grids of
//! sub-plots, captions detected separately, split halves of a diagram). Each
//! fragment arrives as its own image file plus a bounding box, either inside
//! the structured pruned layout or encoded in the file name
//! (`img_in_image_box_{x0}_{y0}_{x1}_{y1}.png`).
//!
//! Fragments are clustered with a disjoint-set over pairwise geometry checks
//! (intersection-over-union, axis overlap with bounded gap, center alignment
//! for size-mismatched crops). Every threshold lives in [`MergeTuning`]; the
//! defaults were tuned on real service output and work for both normalized
//! and pixel coordinates because gaps scale with the page span and the
//! median fragment size.
//!
//! For each group of two or more fragments one merged artifact is produced,
//! preferably by cropping the union box out of a freshly rendered PDF page
//! (pixel-exact), otherwise by compositing the fragments onto a white canvas
//! at the median fragment scale. Artifacts are content-addressed under
//! `images/merged/` so re-runs are idempotent. The page Markdown is then
//! rewritten: the group's first reference points at the merged image, the
//! remaining references are dropped.

use crate::error::LayoutMdError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, warn};

/// Axis-aligned box, `x0 < x1`, `y0 < y1`, unit-agnostic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl BBox {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> f64 {
        (self.x1 - self.x0).max(0.0)
    }

    pub fn height(&self) -> f64 {
        (self.y1 - self.y0).max(0.0)
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    pub fn is_valid(&self) -> bool {
        self.x1 > self.x0 && self.y1 > self.y0
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.x0 + self.x1) / 2.0, (self.y0 + self.y1) / 2.0)
    }

    pub fn union(&self, other: &BBox) -> BBox {
        BBox::new(
            self.x0.min(other.x0),
            self.y0.min(other.y0),
            self.x1.max(other.x1),
            self.y1.max(other.y1),
        )
    }
}

/// One fragment image and where it sits on the page.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRegion {
    pub src: String,
    pub bbox: BBox,
}

/// Intersection area over union area.
pub fn iou(a: &BBox, b: &BBox) -> f64 {
    let iw = (a.x1.min(b.x1) - a.x0.max(b.x0)).max(0.0);
    let ih = (a.y1.min(b.y1) - a.y0.max(b.y0)).max(0.0);
    let inter = iw * ih;
    if inter <= 0.0 {
        return 0.0;
    }
    let denom = a.area() + b.area() - inter;
    if denom > 0.0 {
        inter / denom
    } else {
        0.0
    }
}

/// Overlap of two 1-D intervals relative to the shorter one.
pub fn overlap_ratio_1d(a0: f64, a1: f64, b0: f64, b1: f64) -> f64 {
    let inter = (a1.min(b1) - a0.max(b0)).max(0.0);
    let denom = (a1 - a0).min(b1 - b0).max(1e-9);
    inter / denom
}

/// Area of the bounding union over the summed areas. ~1.0 for adjacent
/// same-size boxes, growing with distance and size mismatch.
pub fn union_over_sum(a: &BBox, b: &BBox) -> f64 {
    let denom = a.area() + b.area();
    if denom > 0.0 {
        a.union(b).area() / denom
    } else {
        f64::INFINITY
    }
}

/// Index-based union-find with path halving.
#[derive(Debug)]
pub struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    pub fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    pub fn union(&mut self, i: usize, j: usize) {
        let ri = self.find(i);
        let rj = self.find(j);
        if ri != rj {
            self.parent[rj] = ri;
        }
    }

    /// Member indices per root, in first-seen order.
    pub fn groups(&mut self) -> Vec<Vec<usize>> {
        let mut by_root: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..self.parent.len() {
            let root = self.find(i);
            by_root.entry(root).or_default().push(i);
        }
        by_root.into_values().collect()
    }
}

/// Clustering thresholds. Fields come in pairs of a page-span fraction and a
/// median-fragment fraction; the larger of the two wins, which keeps the
/// behavior stable across normalized and pixel coordinate systems.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeTuning {
    /// Any measurable overlap merges outright.
    pub min_iou: f64,
    /// Minimum 1-D overlap for the same-row / same-column rule.
    pub min_overlap: f64,
    /// Gap allowance as a fraction of the page span.
    pub gap_span_frac: f64,
    /// Gap allowance as a fraction of the median fragment size.
    pub gap_median_frac: f64,
    /// Center-alignment tolerance as a fraction of the page span.
    pub center_span_frac: f64,
    /// Center-alignment tolerance as a fraction of the median fragment size.
    pub center_median_frac: f64,
    /// Gap multiplier for the center-alignment fallback.
    pub center_gap_factor: f64,
    /// union/sum above this on a row/column merge is logged as unusually
    /// sparse; the merge is still kept.
    pub max_union_over_sum: f64,
    /// Looser union/sum ceiling for center-alignment merges.
    pub max_union_over_sum_center: f64,
    /// Composited canvas cap in pixels; a bigger canvas means the boxes were
    /// not in one coordinate system.
    pub max_canvas_pixels: u64,
    /// A prior artifact smaller than this for a region larger than
    /// `rebuild_min_area` is rebuilt when a page render is available.
    pub rebuild_max_bytes: u64,
    pub rebuild_min_area: f64,
}

impl Default for MergeTuning {
    fn default() -> Self {
        Self {
            min_iou: 0.02,
            min_overlap: 0.22,
            gap_span_frac: 0.08,
            gap_median_frac: 0.40,
            center_span_frac: 0.03,
            center_median_frac: 0.35,
            center_gap_factor: 1.5,
            max_union_over_sum: 2.20,
            max_union_over_sum_center: 2.60,
            max_canvas_pixels: 60_000_000,
            rebuild_max_bytes: 8_192,
            rebuild_min_area: 200.0 * 200.0,
        }
    }
}

static MD_IMAGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)]+)\)(?:\s*\{[^}]*\})?").unwrap());
static HTML_IMG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<img\s+[^>]*?src=(['"])([^'"]+)['"][^>]*/?>"#).unwrap()
});
static BBOX_IN_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:^|/)img_in_image_box_(\d+(?:\.\d+)?)_(\d+(?:\.\d+)?)_(\d+(?:\.\d+)?)_(\d+(?:\.\d+)?)\.(?:png|jpg|jpeg|webp)$",
    )
    .unwrap()
});
static BLANK_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

pub(crate) fn normalize_src(value: &str) -> String {
    let mut v = value.trim();
    if v.len() >= 2 && v.starts_with('<') && v.ends_with('>') {
        v = v[1..v.len() - 1].trim();
    }
    v.replace('\\', "/")
}

pub(crate) fn src_for_markdown(src: &str) -> String {
    let s = src.trim();
    if s.contains(char::is_whitespace) {
        format!("<{s}>")
    } else {
        s.to_string()
    }
}

/// Rewrite HTML `<img>` tags to Markdown image syntax so the rest of the
/// pipeline only deals with one reference form.
pub fn html_imgs_to_markdown(text: &str) -> String {
    HTML_IMG_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let src = normalize_src(caps.get(2).map_or("", |m| m.as_str()));
            format!("![]({})", src_for_markdown(&src))
        })
        .into_owned()
}

fn to_f(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

const SHAPE_KEYS: [&str; 7] = ["bbox", "box", "rect", "points", "quad", "poly", "polygon"];

/// Shape keys may carry a prefix (`block_bbox`, `layout_bbox`, …) depending
/// on the serving build.
fn is_shape_key(key: &str) -> bool {
    SHAPE_KEYS
        .iter()
        .any(|k| key == *k || key.strip_suffix(k).is_some_and(|p| p.ends_with('_')))
}

/// Normalize any of the layout shape encodings to a corner box.
///
/// Accepted: `[x0,y0,x1,y1]`, `[x,y,w,h]` (detected by inverted corners),
/// point lists (`[[x,y],…]` or a flat even-length list), and objects with
/// `left/top/right/bottom`, `x/y/w/h`, `x/y/width/height`, or a nested shape
/// under `bbox`/`box`/`rect`/`points`/`quad`/`poly`/`polygon` (bare or
/// prefixed, e.g. `block_bbox`).
pub fn bbox_from_value(value: &Value) -> Option<BBox> {
    match value {
        Value::Object(map) => {
            if let (Some(x0), Some(y0), Some(x1), Some(y1)) = (
                map.get("left").and_then(to_f),
                map.get("top").and_then(to_f),
                map.get("right").and_then(to_f),
                map.get("bottom").and_then(to_f),
            ) {
                return Some(BBox::new(x0, y0, x1, y1));
            }
            for (wk, hk) in [("w", "h"), ("width", "height")] {
                if let (Some(x), Some(y), Some(w), Some(h)) = (
                    map.get("x").and_then(to_f),
                    map.get("y").and_then(to_f),
                    map.get(wk).and_then(to_f),
                    map.get(hk).and_then(to_f),
                ) {
                    return Some(BBox::new(x, y, x + w, y + h));
                }
            }
            map.iter()
                .filter(|(k, _)| is_shape_key(k))
                .find_map(|(_, v)| bbox_from_value(v))
        }
        Value::Array(arr) => {
            if !arr.is_empty()
                && arr
                    .iter()
                    .all(|p| p.as_array().is_some_and(|a| a.len() >= 2))
            {
                let mut xs = Vec::with_capacity(arr.len());
                let mut ys = Vec::with_capacity(arr.len());
                for p in arr {
                    let pa = p.as_array()?;
                    xs.push(to_f(&pa[0])?);
                    ys.push(to_f(&pa[1])?);
                }
                return Some(BBox::new(
                    xs.iter().cloned().fold(f64::INFINITY, f64::min),
                    ys.iter().cloned().fold(f64::INFINITY, f64::min),
                    xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                    ys.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                ));
            }
            let nums: Option<Vec<f64>> = arr.iter().map(to_f).collect();
            let n = nums?;
            if n.len() == 4 {
                let [x0, y0, x1, y1] = [n[0], n[1], n[2], n[3]];
                if x1 >= 0.0 && y1 >= 0.0 && (x1 < x0 || y1 < y0) {
                    return None;
                }
                if x1 >= x0 && y1 >= y0 {
                    return Some(BBox::new(x0, y0, x1, y1));
                }
                return Some(BBox::new(x0, y0, x0 + x1.abs(), y0 + y1.abs()));
            }
            if n.len() >= 6 && n.len() % 2 == 0 {
                let xs: Vec<f64> = n.iter().step_by(2).copied().collect();
                let ys: Vec<f64> = n.iter().skip(1).step_by(2).copied().collect();
                return Some(BBox::new(
                    xs.iter().cloned().fold(f64::INFINITY, f64::min),
                    ys.iter().cloned().fold(f64::INFINITY, f64::min),
                    xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                    ys.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                ));
            }
            None
        }
        _ => None,
    }
}

/// Walk the pruned layout and pair every known image src with the box of the
/// node that references it. One region per src, first mention wins.
pub fn regions_from_layout(layout: &Value, known_srcs: &BTreeSet<String>) -> Vec<ImageRegion> {
    let mut regions: Vec<ImageRegion> = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();

    fn match_src(raw: &str, known: &BTreeSet<String>) -> Option<String> {
        let v = normalize_src(raw);
        if known.contains(&v) {
            return Some(v);
        }
        known.iter().find(|k| v.ends_with(k.as_str())).cloned()
    }

    fn walk(
        node: &Value,
        known: &BTreeSet<String>,
        seen: &mut BTreeSet<String>,
        out: &mut Vec<ImageRegion>,
    ) {
        match node {
            Value::Object(map) => {
                let matched: Vec<String> = map
                    .values()
                    .filter_map(|v| v.as_str())
                    .filter_map(|s| match_src(s, known))
                    .collect();
                if !matched.is_empty() {
                    let bbox = map
                        .iter()
                        .filter(|(k, _)| is_shape_key(k))
                        .find_map(|(_, v)| bbox_from_value(v))
                        .or_else(|| bbox_from_value(node));
                    if let Some(bbox) = bbox.filter(BBox::is_valid) {
                        for src in matched {
                            if seen.insert(src.clone()) {
                                out.push(ImageRegion { src, bbox });
                            }
                        }
                    }
                }
                for v in map.values() {
                    walk(v, known, seen, out);
                }
            }
            Value::Array(arr) => {
                for v in arr {
                    walk(v, known, seen, out);
                }
            }
            _ => {}
        }
    }

    walk(layout, known_srcs, &mut seen, &mut regions);
    regions
}

/// Fallback when no layout was returned: decode coordinates from file names
/// like `img_in_image_box_101_220_540_690.png`.
pub fn regions_from_names(known_srcs: &BTreeSet<String>) -> Vec<ImageRegion> {
    let mut regions = Vec::new();
    for src in known_srcs {
        let norm = normalize_src(src);
        let Some(caps) = BBOX_IN_NAME_RE.captures(&norm) else {
            continue;
        };
        let nums: Vec<f64> = (1..=4)
            .filter_map(|i| caps.get(i))
            .filter_map(|m| m.as_str().parse().ok())
            .collect();
        let [a, b, c, d] = nums[..] else { continue };
        let bbox = if c < a || d < b {
            BBox::new(a, b, a + c.abs(), b + d.abs())
        } else {
            BBox::new(a, b, c, d)
        };
        if bbox.is_valid() {
            regions.push(ImageRegion {
                src: src.clone(),
                bbox,
            });
        }
    }
    regions
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 1.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        (values[mid - 1] + values[mid]) / 2.0
    }
}

/// Cluster regions into groups of fragments belonging to one figure.
/// Only groups of two or more are returned.
pub fn group_regions(regions: &[ImageRegion], t: &MergeTuning) -> Vec<Vec<ImageRegion>> {
    if regions.len() < 2 {
        return Vec::new();
    }

    let span_x = regions.iter().map(|r| r.bbox.x1).fold(f64::NEG_INFINITY, f64::max)
        - regions.iter().map(|r| r.bbox.x0).fold(f64::INFINITY, f64::min);
    let span_y = regions.iter().map(|r| r.bbox.y1).fold(f64::NEG_INFINITY, f64::max)
        - regions.iter().map(|r| r.bbox.y0).fold(f64::INFINITY, f64::min);
    let span = span_x.max(span_y).max(1e-6);

    let mut widths: Vec<f64> = regions.iter().map(|r| r.bbox.width().max(1e-6)).collect();
    let mut heights: Vec<f64> = regions.iter().map(|r| r.bbox.height().max(1e-6)).collect();
    let med_w = median(&mut widths);
    let med_h = median(&mut heights);

    let gap_thresh = (span * t.gap_span_frac)
        .max(med_w * t.gap_median_frac)
        .max(med_h * t.gap_median_frac);
    let center_align_x = (span * t.center_span_frac).max(med_w * t.center_median_frac);
    let center_align_y = (span * t.center_span_frac).max(med_h * t.center_median_frac);

    let mut ds = DisjointSet::new(regions.len());
    for i in 0..regions.len() {
        let a = &regions[i].bbox;
        for j in (i + 1)..regions.len() {
            let b = &regions[j].bbox;
            if iou(a, b) > t.min_iou {
                ds.union(i, j);
                continue;
            }
            let v_overlap = overlap_ratio_1d(a.y0, a.y1, b.y0, b.y1);
            let h_overlap = overlap_ratio_1d(a.x0, a.x1, b.x0, b.x1);
            let h_gap = (b.x0 - a.x1).max(a.x0 - b.x1).max(0.0);
            let v_gap = (b.y0 - a.y1).max(a.y0 - b.y1).max(0.0);
            let uos = union_over_sum(a, b);

            // Same row / same column, separated by a tolerable gap. Size
            // mismatch is common here (a box beside a thin strip), so
            // union-over-sum never prunes these merges.
            if (v_overlap >= t.min_overlap && h_gap <= gap_thresh)
                || (h_overlap >= t.min_overlap && v_gap <= gap_thresh)
            {
                if uos > t.max_union_over_sum {
                    debug!(uos, "sparse row/column merge above the union/sum ceiling");
                }
                ds.union(i, j);
                continue;
            }

            // Size-mismatched crops can overlap barely at all; fall back to
            // center alignment with a looser ceiling.
            if uos <= t.max_union_over_sum_center {
                let (cx_a, cy_a) = a.center();
                let (cx_b, cy_b) = b.center();
                if (v_gap <= gap_thresh * t.center_gap_factor
                    && (cx_a - cx_b).abs() <= center_align_x)
                    || (h_gap <= gap_thresh * t.center_gap_factor
                        && (cy_a - cy_b).abs() <= center_align_y)
                {
                    ds.union(i, j);
                }
            }
        }
    }

    ds.groups()
        .into_iter()
        .filter(|g| g.len() >= 2)
        .map(|g| g.into_iter().map(|i| regions[i].clone()).collect())
        .collect()
}

fn bbox_union_of(regions: &[ImageRegion]) -> BBox {
    let mut it = regions.iter();
    let first = it.next().map(|r| r.bbox).unwrap_or(BBox::new(0.0, 0.0, 0.0, 0.0));
    it.fold(first, |acc, r| acc.union(&r.bbox))
}

/// Stable content address for a merged artifact: page number plus the sorted
/// fragment srcs and their coordinates.
pub fn merged_artifact_rel(page_no: u32, group: &[ImageRegion]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(page_no.to_string().as_bytes());
    let mut sorted: Vec<&ImageRegion> = group.iter().collect();
    sorted.sort_by(|a, b| a.src.cmp(&b.src));
    for r in sorted {
        hasher.update(normalize_src(&r.src).as_bytes());
        hasher.update(
            format!(
                ",{:.6},{:.6},{:.6},{:.6}",
                r.bbox.x0, r.bbox.y0, r.bbox.x1, r.bbox.y1
            )
            .as_bytes(),
        );
    }
    let digest = hasher.finalize().to_hex();
    format!("images/merged/page_{page_no:04}_{}.png", &digest.as_str()[..12])
}

/// Supplies freshly rendered page images for pixel-exact merged crops.
/// Implemented over pdfium; absent (or failing) sources degrade to fragment
/// compositing.
pub trait PageImageSource: Sync {
    /// Render the 0-based page at the given pixel size.
    fn render_page(&self, page_index: u32, width: u32, height: u32) -> Option<image::RgbaImage>;
}

fn save_artifact(task_dir: &Path, merged_rel: &str, img: &image::RgbaImage) -> bool {
    let out_path = task_dir.join(normalize_src(merged_rel));
    if let Some(parent) = out_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(path = %parent.display(), error = %e, "cannot create merged image dir");
            return false;
        }
    }
    match img.save(&out_path) {
        Ok(()) => true,
        Err(e) => {
            warn!(path = %out_path.display(), error = %e, "cannot save merged image");
            false
        }
    }
}

fn crop_from_page(
    task_dir: &Path,
    merged_rel: &str,
    source: &dyn PageImageSource,
    page_index: u32,
    crop: BBox,
    render_w: u32,
    render_h: u32,
) -> bool {
    let Some(page_img) = source.render_page(page_index, render_w, render_h) else {
        return false;
    };
    let x = crop.x0.min(crop.x1).round().max(0.0) as u32;
    let y = crop.y0.min(crop.y1).round().max(0.0) as u32;
    let mut w = ((crop.x1 - crop.x0).abs().round() as u32).max(1);
    let mut h = ((crop.y1 - crop.y0).abs().round() as u32).max(1);
    if x >= page_img.width() || y >= page_img.height() {
        return false;
    }
    w = w.min(page_img.width() - x).max(1);
    h = h.min(page_img.height() - y).max(1);
    let cropped = image::imageops::crop_imm(&page_img, x, y, w, h).to_image();
    save_artifact(task_dir, merged_rel, &cropped)
}

/// Composite fragments onto a white canvas at the median fragment scale.
fn compose_fragments(
    task_dir: &Path,
    merged_rel: &str,
    regions: &[ImageRegion],
    t: &MergeTuning,
) -> bool {
    let union = bbox_union_of(regions);
    let uw = union.width().max(1e-6);
    let uh = union.height().max(1e-6);

    let mut scales_x = Vec::new();
    let mut scales_y = Vec::new();
    let mut loaded: Vec<(&ImageRegion, image::RgbaImage)> = Vec::new();
    for r in regions {
        let src_path = task_dir.join(normalize_src(&r.src));
        let Ok(img) = image::open(&src_path) else {
            debug!(path = %src_path.display(), "fragment not loadable; skipping");
            continue;
        };
        let img = img.to_rgba8();
        let bw = r.bbox.width().max(1e-6);
        let bh = r.bbox.height().max(1e-6);
        if img.width() > 0 && img.height() > 0 {
            scales_x.push(img.width() as f64 / bw);
            scales_y.push(img.height() as f64 / bh);
        }
        loaded.push((r, img));
    }
    if loaded.len() < 2 {
        return false;
    }

    let sx = median(&mut scales_x);
    let sy = median(&mut scales_y);
    // One uniform scale keeps the seams tight.
    let s = if sx > 0.0 && sy > 0.0 {
        (sx + sy) / 2.0
    } else {
        sx.max(sy).max(1.0)
    };

    let canvas_w = ((uw * s).round() as u32).max(1);
    let canvas_h = ((uh * s).round() as u32).max(1);
    if canvas_w as u64 * canvas_h as u64 > t.max_canvas_pixels {
        // Boxes were not in one coordinate system.
        return false;
    }

    let mut canvas =
        image::RgbaImage::from_pixel(canvas_w, canvas_h, image::Rgba([255, 255, 255, 255]));
    for (r, img) in loaded {
        let dx = ((r.bbox.x0 - union.x0) * s).round() as i64;
        let dy = ((r.bbox.y0 - union.y0) * s).round() as i64;
        let tw = ((r.bbox.width().max(1e-6) * s).round() as u32).max(1);
        let th = ((r.bbox.height().max(1e-6) * s).round() as u32).max(1);
        let scaled = if img.width() != tw || img.height() != th {
            image::imageops::resize(&img, tw, th, image::imageops::FilterType::Triangle)
        } else {
            img
        };
        image::imageops::overlay(&mut canvas, &scaled, dx, dy);
    }
    save_artifact(task_dir, merged_rel, &canvas)
}

/// Render size for the page crop. Trust the layout's own page dimensions
/// when they are sane, otherwise fall back to the bbox extent.
fn render_size(layout: Option<&Value>, regions: &[ImageRegion]) -> (u32, u32) {
    let dim = |key: &str| -> u32 {
        layout
            .and_then(|l| l.get(key))
            .and_then(to_f)
            .map(|v| v as u32)
            .filter(|v| (256..=50_000).contains(v))
            .unwrap_or(0)
    };
    let (w, h) = (dim("width"), dim("height"));
    if w > 0 && h > 0 {
        return (w, h);
    }
    let max_x = regions.iter().map(|r| r.bbox.x1).fold(0.0, f64::max) + 2.0;
    let max_y = regions.iter().map(|r| r.bbox.y1).fold(0.0, f64::max) + 2.0;
    ((max_x as u32).max(256), (max_y as u32).max(256))
}

fn rewrite_markdown(markdown: &str, replacements: &BTreeMap<String, String>) -> String {
    if markdown.is_empty() || replacements.is_empty() {
        return markdown.to_string();
    }
    struct Span {
        start: usize,
        end: usize,
        alt: String,
        src: String,
    }
    let spans: Vec<Span> = MD_IMAGE_RE
        .captures_iter(markdown)
        .map(|caps| {
            let whole = caps.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
            Span {
                start: whole.0,
                end: whole.1,
                alt: caps.get(1).map_or(String::new(), |m| m.as_str().to_string()),
                src: normalize_src(caps.get(2).map_or("", |m| m.as_str())),
            }
        })
        .collect();
    if spans.is_empty() {
        return markdown.to_string();
    }

    // The first reference of each group becomes the merged image; later
    // fragments of the same group are removed.
    let mut kept: BTreeSet<&str> = BTreeSet::new();
    enum Edit {
        Replace(String),
        Remove,
    }
    let mut edits: Vec<(usize, usize, Edit)> = Vec::new();
    for span in &spans {
        let Some(merged) = replacements.get(&span.src) else {
            continue;
        };
        if kept.insert(merged.as_str()) {
            let tag = format!("![{}]({})", span.alt, src_for_markdown(merged));
            edits.push((span.start, span.end, Edit::Replace(tag)));
        } else {
            edits.push((span.start, span.end, Edit::Remove));
        }
    }
    if edits.is_empty() {
        return markdown.to_string();
    }

    let mut out = markdown.to_string();
    for (start, end, edit) in edits.into_iter().rev() {
        match edit {
            Edit::Replace(tag) => out.replace_range(start..end, &tag),
            Edit::Remove => out.replace_range(start..end, ""),
        }
    }
    BLANK_RUN_RE.replace_all(&out, "\n\n").into_owned()
}

/// Merge fragment images for one page and rewrite its Markdown.
///
/// `page_render` is the optional `(source, 0-based page index)` pair for the
/// pixel-exact crop path. Blocking (file and image work); callers run it on a
/// blocking thread.
#[allow(clippy::too_many_arguments)]
pub fn merge_fragments_for_page(
    task_dir: &Path,
    page_markdown: &str,
    layout: Option<&Value>,
    image_srcs: &[String],
    page_no: u32,
    page_render: Option<(&dyn PageImageSource, u32)>,
    tuning: &MergeTuning,
) -> Result<String, LayoutMdError> {
    if page_markdown.is_empty() {
        return Ok(String::new());
    }
    let markdown = html_imgs_to_markdown(page_markdown);

    let known: BTreeSet<String> = image_srcs
        .iter()
        .map(|s| normalize_src(s))
        .filter(|s| !s.is_empty())
        .collect();
    if known.is_empty() {
        return Ok(markdown);
    }

    let mut regions = layout
        .map(|l| regions_from_layout(l, &known))
        .unwrap_or_default();
    if regions.is_empty() {
        regions = regions_from_names(&known);
    }
    if regions.len() < 2 {
        return Ok(markdown);
    }
    let groups = group_regions(&regions, tuning);
    if groups.is_empty() {
        return Ok(markdown);
    }

    let (render_w, render_h) = render_size(layout, &regions);

    let mut replacements: BTreeMap<String, String> = BTreeMap::new();
    for group in &groups {
        let merged_rel = merged_artifact_rel(page_no, group);
        let out_path = task_dir.join(&merged_rel);
        let union = bbox_union_of(group);

        let mut need_build = !out_path.exists();
        if !need_build && page_render.is_some() {
            // A tiny file for a large region is the signature of a crop that
            // rendered blank; rebuild it now that a page render is available.
            if union.area() > tuning.rebuild_min_area {
                if let Ok(meta) = std::fs::metadata(&out_path) {
                    need_build = meta.len() < tuning.rebuild_max_bytes;
                }
            }
        }

        if need_build {
            let mut built = false;
            if let Some((source, page_index)) = page_render {
                built = crop_from_page(
                    task_dir, &merged_rel, source, page_index, union, render_w, render_h,
                );
            }
            if !built {
                built = compose_fragments(task_dir, &merged_rel, group, tuning);
            }
            if !built {
                debug!(page_no, merged = %merged_rel, "merged artifact not produced; leaving fragments");
                continue;
            }
        }

        for r in group {
            replacements.insert(normalize_src(&r.src), merged_rel.clone());
        }
    }

    Ok(rewrite_markdown(&markdown, &replacements))
}
