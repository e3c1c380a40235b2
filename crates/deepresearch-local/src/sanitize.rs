//! Shrink raw markup before conversion.
//!
//! Scripts, styles, meta/link tags and comments are removed outright. Inline base64 images
//! become `<img src="#">` and SVG bodies become placeholder text, so the converter never sees
//! binary blobs.

use regex::Regex;
use std::sync::OnceLock;

struct Patterns {
    strip: Vec<Regex>,
    base64_img: Regex,
    svg: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static P: OnceLock<Option<Patterns>> = OnceLock::new();
    P.get_or_init(|| {
        let strip = [
            r"(?is)<[ ]*script.*?/[ ]*script[ ]*>",
            r"(?is)<[ ]*style.*?/[ ]*style[ ]*>",
            r"(?is)<[ ]*meta.*?>",
            r"(?is)<[ ]*!--.*?--[ ]*>",
            r"(?is)<[ ]*link.*?>",
        ]
        .iter()
        .map(|p| Regex::new(p).ok())
        .collect::<Option<Vec<_>>>()?;
        Some(Patterns {
            strip,
            base64_img: Regex::new(r#"<img[^>]+src="data:image/[^;]+;base64,[^"]+"[^>]*>"#).ok()?,
            svg: Regex::new(r"(?s)(<svg[^>]*>)(.*?)(</svg>)").ok()?,
        })
    })
    .as_ref()
}

pub const SVG_PLACEHOLDER: &str = "this is a placeholder";

pub fn sanitize_html(html: &str) -> String {
    let Some(p) = patterns() else {
        return html.to_string();
    };
    let mut out = html.to_string();
    for re in &p.strip {
        out = re.replace_all(&out, "").into_owned();
    }
    out = p
        .base64_img
        .replace_all(&out, r##"<img src="#">"##)
        .into_owned();
    p.svg
        .replace_all(&out, format!("${{1}}{SVG_PLACEHOLDER}${{3}}").as_str())
        .into_owned()
}
