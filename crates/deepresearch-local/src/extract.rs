use std::io::Cursor;

/// Convert HTML to readable plain text.
///
/// Notes:
/// - Deterministic and "good enough"; not a readability engine.
/// - Callers apply their own output bounds.
pub fn html_to_text(html: &str, width: usize) -> String {
    html2text::from_read(Cursor::new(html.as_bytes()), width).unwrap_or_else(|_| html.to_string())
}

fn norm_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract text from a PDF body.
pub fn pdf_to_text(bytes: &[u8]) -> Result<String, String> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| e.to_string())
}

/// Best-effort sniff for PDF bytes (magic header).
pub fn bytes_look_like_pdf(bytes: &[u8]) -> bool {
    bytes.starts_with(b"%PDF-")
}

/// Best-effort guess for whether bytes are HTML-ish.
pub fn bytes_look_like_html(bytes: &[u8]) -> bool {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let rest = &bytes[start..];
    let head = &rest[..rest.len().min(16)];
    let head = head.to_ascii_lowercase();
    head.starts_with(b"<!doctype")
        || head.starts_with(b"<html")
        || head.starts_with(b"<head")
        || head.starts_with(b"<body")
}

/// Keep the first `max_chars` characters. Returns `(text, truncated)`.
pub fn truncate_chars(s: &str, max_chars: usize) -> (String, bool) {
    match s.char_indices().nth(max_chars) {
        Some((byte, _)) => (s[..byte].to_string(), true),
        None => (s.to_string(), false),
    }
}

/// Containers tried in order before falling back to `<body>`.
const MAIN_SELECTORS: [&str; 6] = ["main", "article", ".content", "#content", ".main", "#main"];
/// Elements whose text never counts as page content.
const NOISE_TAGS: [&str; 8] = [
    "script", "style", "nav", "footer", "header", "aside", "iframe", "noscript",
];
const MIN_BLOCK_CHARS: usize = 20;
const MIN_LINE_CHARS: usize = 10;
const MAX_BLOCKS: usize = 100;

fn inside_noise(el: &html_scraper::ElementRef) -> bool {
    el.ancestors().any(|n| {
        n.value()
            .as_element()
            .is_some_and(|e| NOISE_TAGS.contains(&e.name()))
    })
}

/// Structural fallback used when no reader model is available.
///
/// Picks the first main-content container (or the body), collects heading, paragraph and
/// list-item text longer than 20 chars, prefixes headings with `#` per level, keeps lines
/// longer than 10 chars, caps at 100 blocks and joins them with blank lines. Returns an
/// empty string when nothing qualifies.
pub fn fallback_extract(html: &str) -> String {
    let doc = html_scraper::Html::parse_document(html);

    let container = MAIN_SELECTORS
        .iter()
        .chain(std::iter::once(&"body"))
        .filter_map(|s| html_scraper::Selector::parse(s).ok())
        .find_map(|sel| doc.select(&sel).next());
    let Some(container) = container else {
        return String::new();
    };
    let Ok(blocks) = html_scraper::Selector::parse("h1, h2, h3, h4, h5, h6, p, li") else {
        return String::new();
    };

    let mut parts: Vec<String> = Vec::new();
    for el in container.select(&blocks) {
        if inside_noise(&el) {
            continue;
        }
        let text = norm_ws(&el.text().collect::<Vec<_>>().join(" "));
        if text.chars().count() <= MIN_BLOCK_CHARS {
            continue;
        }
        let name = el.value().name();
        match name.strip_prefix('h').and_then(|d| d.parse::<usize>().ok()) {
            Some(level) => parts.push(format!("{} {text}", "#".repeat(level))),
            None => parts.push(text),
        }
    }

    parts
        .join("\n\n")
        .lines()
        .map(str::trim)
        .filter(|l| l.chars().count() > MIN_LINE_CHARS)
        .take(MAX_BLOCKS)
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_text_from_simple_html() {
        let html = r#"<html><body><h1>Hello</h1><p>world</p></body></html>"#;
        let out = html_to_text(html, 80);
        assert!(out.contains("Hello"));
        assert!(out.contains("world"));
    }

    #[test]
    fn fallback_prefers_main_container_and_marks_headings() {
        let html = r#"<html><body>
            <nav><p>Home | About | Contact | Careers | Press</p></nav>
            <p>This sidebar paragraph lives outside the main element.</p>
            <main>
              <h2>Quarterly results were strong overall</h2>
              <p>Revenue grew by twelve percent compared with last year.</p>
              <p>short</p>
              <ul><li>Operating margin improved to eighteen percent.</li></ul>
            </main>
        </body></html>"#;
        let out = fallback_extract(html);
        assert_eq!(
            out,
            "## Quarterly results were strong overall\n\nRevenue grew by twelve percent compared with last year.\n\nOperating margin improved to eighteen percent."
        );
    }

    #[test]
    fn fallback_uses_body_and_skips_noise() {
        let html = r#"<html><body>
            <header><p>Site header text that is long enough to count.</p></header>
            <p>The body paragraph is what we actually want to keep.</p>
            <footer><p>Copyright notice that is long enough to count.</p></footer>
        </body></html>"#;
        let out = fallback_extract(html);
        assert_eq!(out, "The body paragraph is what we actually want to keep.");
    }

    #[test]
    fn fallback_caps_block_count() {
        let mut html = String::from("<html><body>");
        for i in 0..150 {
            html.push_str(&format!("<p>Paragraph number {i} with enough text.</p>"));
        }
        html.push_str("</body></html>");
        let out = fallback_extract(&html);
        assert_eq!(out.split("\n\n").count(), 100);
    }

    #[test]
    fn fallback_returns_empty_for_contentless_page() {
        assert_eq!(fallback_extract("<html><body><p>tiny</p></body></html>"), "");
    }

    #[test]
    fn truncate_chars_counts_chars_not_bytes() {
        assert_eq!(truncate_chars("héllo", 2), ("hé".to_string(), true));
        assert_eq!(truncate_chars("abc", 5), ("abc".to_string(), false));
    }

    #[test]
    fn sniffs_pdf_and_html() {
        assert!(bytes_look_like_pdf(b"%PDF-1.7\n"));
        assert!(bytes_look_like_html(b"  \n<!DOCTYPE html><html>"));
        assert!(!bytes_look_like_html(b"plain text"));
    }
}
