//! Regex-based harvesting of text and links from fetched HTML.

use base64::Engine;
use regex::Regex;
use std::sync::LazyLock;

static SCRIPT_OR_STYLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<(script|style|noscript)\b[^>]*>.*?</(script|style|noscript)>").unwrap());

static COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());

static BLOCK_BREAK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<br\s*/?>|</(p|div|h[1-6]|li|tr|pre|section|article|table|ul|ol)>").unwrap()
});

static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]+>").unwrap());

static ATOB: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"atob\(\s*[`"']([A-Za-z0-9+/=\s]+)[`"']\s*\)"#).unwrap());

static MEDIA_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<(?:audio|video|source)\b[^>]*?\bsrc\s*=\s*["']([^"']+)["']"#).unwrap()
});

static ANCHOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)<a\b[^>]*?\bhref\s*=\s*["']([^"']+)["']"#).unwrap());

const MEDIA_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "ogg", "opus", "flac", "mp4", "mpeg", "webm"];

const FILE_EXTENSIONS: &[&str] = &[
    "csv", "tsv", "json", "pdf", "xlsx", "xls", "txt", "zip", "png", "jpg", "jpeg", "gif", "xml",
];

/// Links found on a page, already absolute and de-duplicated.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PageLinks {
    pub media: Vec<String>,
    pub files: Vec<String>,
}

/// Visible text, one line per block, with blank lines dropped.
pub fn visible_text(html: &str) -> String {
    let without_comments = COMMENT.replace_all(html, "");
    let without_scripts = SCRIPT_OR_STYLE.replace_all(&without_comments, "");
    let with_breaks = BLOCK_BREAK.replace_all(&without_scripts, "\n");
    let stripped = TAG.replace_all(&with_breaks, " ");
    decode_entities(&stripped)
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Payloads of inline `atob("...")` calls, decoded to text.
///
/// Pages that build their content client-side usually ship it this way.
pub fn inline_base64_payloads(html: &str) -> Vec<String> {
    ATOB.captures_iter(html)
        .filter_map(|cap| {
            let compact: String = cap[1].chars().filter(|c| !c.is_whitespace()).collect();
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(compact)
                .ok()?;
            let decoded = String::from_utf8(bytes).ok()?;
            let text = if decoded.contains('<') {
                visible_text(&decoded)
            } else {
                decoded.trim().to_string()
            };
            (!text.is_empty()).then_some(text)
        })
        .collect()
}

/// Media and file links, resolved against `base`.
pub fn harvest_links(html: &str, base: &str) -> PageLinks {
    let mut links = PageLinks::default();

    for cap in MEDIA_TAG.captures_iter(html) {
        push_unique(&mut links.media, resolve(base, &cap[1]));
    }

    for cap in ANCHOR.captures_iter(html) {
        let href = decode_entities(&cap[1]);
        match extension(&href).as_deref() {
            Some(ext) if MEDIA_EXTENSIONS.contains(&ext) => {
                push_unique(&mut links.media, resolve(base, &href))
            }
            Some(ext) if FILE_EXTENSIONS.contains(&ext) => {
                push_unique(&mut links.files, resolve(base, &href))
            }
            _ => {}
        }
    }

    links
}

/// Resolve `href` against `base`; unparseable input is returned as-is.
pub fn resolve(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    match reqwest::Url::parse(base).and_then(|b| b.join(href)) {
        Ok(url) => Some(url.to_string()),
        Err(_) => Some(href.to_string()),
    }
}

fn push_unique(list: &mut Vec<String>, url: Option<String>) {
    if let Some(url) = url {
        if !list.contains(&url) {
            list.push(url);
        }
    }
}

fn extension(href: &str) -> Option<String> {
    let path = href.split(['?', '#']).next()?;
    let last = path.rsplit('/').next()?;
    let (_, ext) = last.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
