use anyhow::{Context, Result, bail};
use regex::Regex;
use reqwest::Client;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::io::AsyncWriteExt;
use tracing::debug;

static DISPOSITION_FILENAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)filename\*?=(?:UTF-8'')?"?([^";]+)"?"#).unwrap());

/// Extensions for the content types quiz pages serve most, checked before the
/// generic table because it lists several extensions per type.
const PREFERRED_EXTENSIONS: &[(&str, &str)] = &[
    ("audio/mpeg", "mp3"),
    ("audio/wav", "wav"),
    ("audio/x-wav", "wav"),
    ("audio/mp4", "m4a"),
    ("audio/x-m4a", "m4a"),
    ("application/json", "json"),
    ("application/pdf", "pdf"),
    ("text/csv", "csv"),
    ("text/plain", "txt"),
];

/// Stream `url` into `dir`. Returns the local path.
pub async fn download(client: &Client, url: &str, dir: &Path) -> Result<PathBuf> {
    let mut response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to request {}", url))?;
    if !response.status().is_success() {
        bail!("{} returned {}", url, response.status());
    }

    let disposition = response
        .headers()
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase());

    let name = file_name(url, disposition.as_deref(), content_type.as_deref());
    let path = unique_path(dir, &name);

    let mut file = tokio::fs::File::create(&path)
        .await
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut written = 0usize;
    while let Some(chunk) = response
        .chunk()
        .await
        .with_context(|| format!("Failed to read body of {}", url))?
    {
        file.write_all(&chunk).await?;
        written += chunk.len();
    }
    file.flush().await?;

    debug!(url, path = %path.display(), bytes = written, "downloaded artifact");
    Ok(path)
}

/// Name from Content-Disposition, else the last URL path segment; an extension
/// is added from the content type when the name has none.
pub fn file_name(url: &str, disposition: Option<&str>, content_type: Option<&str>) -> String {
    let from_header = disposition
        .and_then(|d| DISPOSITION_FILENAME.captures(d))
        .map(|c| c[1].trim().to_string());
    let from_url = || {
        reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.path_segments()?.next_back().map(str::to_string))
    };

    let mut name = from_header
        .or_else(from_url)
        .map(|n| sanitize(&n))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| format!("download_{}", &uuid::Uuid::new_v4().to_string()[..8]));

    if !name.contains('.') {
        if let Some(ext) = content_type.and_then(extension_for) {
            name.push('.');
            name.push_str(ext);
        }
    }
    name
}

fn extension_for(content_type: &str) -> Option<&'static str> {
    let essence = content_type.split(';').next()?.trim();
    PREFERRED_EXTENSIONS
        .iter()
        .find(|(ct, _)| *ct == essence)
        .map(|(_, ext)| *ext)
        .or_else(|| mime_guess::get_mime_extensions_str(essence)?.first().copied())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    (1..)
        .map(|n| dir.join(format!("{}_{}", n, name)))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// True for audio and video files, judged by extension.
pub fn is_media_path(path: &Path) -> bool {
    mime_guess::from_path(path)
        .first()
        .is_some_and(|m| m.type_() == mime_guess::mime::AUDIO || m.type_() == mime_guess::mime::VIDEO)
}
