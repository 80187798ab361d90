//! Local Markdown post-processing for image display size.
//!
//! Markdown previews and EPUB converters tend to render images at their
//! native pixel size, which for 300-DPI crops is enormous. When the config
//! asks for it, image references are rewritten with a style block:
//!
//! * `![alt](src)` becomes `![alt](src){ style="..." }` — Pandoc's
//!   `link_attributes` form, which survives further Markdown processing.
//! * `<img>` tags get a `style` attribute injected, unless they carry one.
//! * `<div>`-wrapped Markdown images are rewritten to plain HTML `<img>`:
//!   CommonMark does not parse Markdown inside an HTML block, so downstream
//!   converters would drop the image entirely. This rewrite happens even
//!   with sizing off.
//!
//! Everything here is deterministic text rewriting with no effect on
//! recognition, so none of it participates in the options fingerprint.

use once_cell::sync::Lazy;
use regex::Regex;

static MD_IMAGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)]+)\)(\s*\{[^}]*\})?").unwrap());
static DIV_WRAPPED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)(<div\b[^>]*>)\s*!\[([^\]]*)\]\(([^)]+)\)\s*(\{[^}]*\})?\s*(</div>)")
        .unwrap()
});
static HTML_IMG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<img\b([^>]*?)(/?)>").unwrap());
static HAS_STYLE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bstyle\s*=").unwrap());
static ATTR_STYLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)\bstyle\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});

/// Display constraints for rewritten image references.
#[derive(Debug, Clone, Copy)]
pub struct ImageStyle {
    pub width_percent: u8,
    pub max_height_px: u32,
}

impl ImageStyle {
    pub fn is_active(&self) -> bool {
        self.width_percent > 0 || self.max_height_px > 0
    }

    fn css(&self) -> String {
        if !self.is_active() {
            return String::new();
        }
        let width = if self.width_percent > 0 {
            format!("max-width:{}%", self.width_percent.min(100))
        } else {
            "max-width:100%".to_string()
        };
        let mut parts = vec![
            width,
            "height:auto".to_string(),
            "object-fit:contain".to_string(),
            "display:block".to_string(),
            "margin:0 auto".to_string(),
        ];
        if self.max_height_px > 0 {
            parts.push(format!("max-height:{}px", self.max_height_px));
        }
        parts.join("; ")
    }
}

fn extract_src(raw: &str) -> String {
    let mut v = raw.trim();
    if v.len() >= 2 && v.starts_with('<') && v.ends_with('>') {
        v = v[1..v.len() - 1].trim();
    }
    // `path "title"` — the first token is the src
    v.split_whitespace().next().unwrap_or("").to_string()
}

fn escape_attr(v: &str) -> String {
    v.replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn style_from_md_attrs(attrs: &str) -> String {
    ATTR_STYLE_RE
        .captures(attrs)
        .and_then(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

/// Apply the display-size rewrite described in the module docs.
pub fn apply_image_width(text: &str, style: ImageStyle) -> String {
    let css = style.css();

    // Div-wrapped Markdown images become plain HTML, with or without sizing.
    let updated = DIV_WRAPPED_RE.replace_all(text, |caps: &regex::Captures<'_>| {
        let div_open = caps.get(1).map_or("<div>", |m| m.as_str());
        let alt = caps.get(2).map_or("", |m| m.as_str());
        let src = extract_src(caps.get(3).map_or("", |m| m.as_str()));
        let existing = style_from_md_attrs(caps.get(4).map_or("", |m| m.as_str()));
        let div_close = caps.get(5).map_or("</div>", |m| m.as_str());
        let effective = if existing.is_empty() { css.clone() } else { existing };
        let img = if effective.is_empty() {
            format!(r#"<img src="{}" alt="{}" />"#, escape_attr(&src), escape_attr(alt))
        } else {
            format!(
                r#"<img src="{}" alt="{}" style="{}" />"#,
                escape_attr(&src),
                escape_attr(alt),
                escape_attr(&effective)
            )
        };
        format!("{div_open}\n{img}\n{div_close}")
    });

    if css.is_empty() {
        return updated.into_owned();
    }

    // Existing <img> tags: inject a style only where none is present.
    let updated = HTML_IMG_RE.replace_all(&updated, |caps: &regex::Captures<'_>| {
        let attrs = caps.get(1).map_or("", |m| m.as_str());
        if HAS_STYLE_RE.is_match(attrs) {
            return caps.get(0).map_or(String::new(), |m| m.as_str().to_string());
        }
        let slash = caps.get(2).map_or("", |m| m.as_str());
        format!(r#"<img{attrs} style="{}"{slash}>"#, escape_attr(&css))
    });

    // Markdown images gain a link-attributes block; ones that already carry
    // attributes are left alone.
    MD_IMAGE_RE
        .replace_all(&updated, |caps: &regex::Captures<'_>| {
            if caps.get(3).is_some() {
                return caps.get(0).map_or(String::new(), |m| m.as_str().to_string());
            }
            let alt = caps.get(1).map_or("", |m| m.as_str());
            let src = extract_src(caps.get(2).map_or("", |m| m.as_str()));
            let target = if src.contains(char::is_whitespace) {
                format!("<{src}>")
            } else {
                src
            };
            format!(r#"![{alt}]({target}){{ style="{css}" }}"#)
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIDTH60: ImageStyle = ImageStyle {
        width_percent: 60,
        max_height_px: 0,
    };
    const OFF: ImageStyle = ImageStyle {
        width_percent: 0,
        max_height_px: 0,
    };

    #[test]
    fn markdown_image_gains_style_attrs() {
        let out = apply_image_width("![fig](images/a.png)", WIDTH60);
        assert_eq!(
            out,
            r#"![fig](images/a.png){ style="max-width:60%; height:auto; object-fit:contain; display:block; margin:0 auto" }"#
        );
    }

    #[test]
    fn disabled_style_is_a_noop_for_plain_images() {
        let md = "![fig](images/a.png)";
        assert_eq!(apply_image_width(md, OFF), md);
    }

    #[test]
    fn max_height_appends() {
        let style = ImageStyle {
            width_percent: 0,
            max_height_px: 800,
        };
        let out = apply_image_width("![](a.png)", style);
        assert!(out.contains("max-width:100%"));
        assert!(out.contains("max-height:800px"));
    }

    #[test]
    fn existing_attrs_are_preserved() {
        let md = r#"![f](a.png){ style="max-width:30%" }"#;
        assert_eq!(apply_image_width(md, WIDTH60), md);
    }

    #[test]
    fn div_wrapped_image_becomes_html_even_when_off() {
        let md = r#"<div align="center">![cap](images/a.png)</div>"#;
        let out = apply_image_width(md, OFF);
        assert!(out.contains(r#"<img src="images/a.png" alt="cap" />"#), "got: {out}");
        assert!(out.starts_with(r#"<div align="center">"#));
        assert!(out.ends_with("</div>"));
    }

    #[test]
    fn div_wrapped_image_keeps_its_own_style() {
        let md = r#"<div>![](a.png){ style="max-width:10%" }</div>"#;
        let out = apply_image_width(md, WIDTH60);
        assert!(out.contains(r#"style="max-width:10%""#), "got: {out}");
    }

    #[test]
    fn html_img_without_style_gets_one() {
        let out = apply_image_width(r#"<img src="a.png" alt=""/>"#, WIDTH60);
        assert!(out.contains("max-width:60%"), "got: {out}");
    }

    #[test]
    fn html_img_with_style_is_untouched() {
        let md = r#"<img src="a.png" style="width:10px">"#;
        assert_eq!(apply_image_width(md, WIDTH60), md);
    }

    #[test]
    fn src_with_title_keeps_first_token() {
        let out = apply_image_width(r#"![f](a.png "caption")"#, WIDTH60);
        assert!(out.starts_with("![f](a.png){"), "got: {out}");
    }
}
