//! Page context building: fetch a link, harvest its text and links, download
//! artifacts, transcribe media.
//!
//! Every visit gets its own scratch directory under the work directory. The
//! directory lives as long as the link that produced it: callers hand the page
//! to a [`ScratchDirs`] and it is removed when the link is left behind.

pub mod download;
pub mod html;
pub mod transcribe;

#[cfg(feature = "browser")]
pub mod browser;

#[cfg(feature = "browser")]
pub use browser::{BrowserPageVisitor, BrowserSettings};
pub use transcribe::{DisabledTranscriber, Transcriber, WhisperTranscriber};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, COOKIE, REFERER, SET_COOKIE};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chain::{Artifact, ArtifactKind, ChallengeLink, Cookie, PageContext, cookie_header};

/// Builds a [`PageContext`] for a link. Never fails: an unreachable page yields
/// [`PageContext::unretrievable`] so the caller decides what to do.
#[async_trait]
pub trait PageVisitor: Send + Sync {
    async fn visit(&self, link: &ChallengeLink) -> PageContext;
}

/// Create the work directory and return its absolute form. Artifact paths are
/// recorded under it and read back by the sandbox, so both sides must agree on
/// one absolute root.
pub fn prepare_work_dir(dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create work directory {}", dir.display()))?;
    std::fs::canonicalize(dir)
        .with_context(|| format!("Failed to resolve work directory {}", dir.display()))
}

/// Absolute form of `dir` without touching the filesystem.
pub(crate) fn absolute(dir: PathBuf) -> PathBuf {
    std::path::absolute(&dir).unwrap_or(dir)
}

/// Visit directories owned by one link or one solve. Removed on
/// [`ScratchDirs::release`] or when dropped.
#[derive(Debug, Default)]
pub struct ScratchDirs {
    dirs: Vec<PathBuf>,
}

impl ScratchDirs {
    pub fn track(&mut self, page: &PageContext) {
        if let Some(dir) = &page.visit_dir {
            self.dirs.push(dir.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    pub fn release(&mut self) {
        for dir in self.dirs.drain(..) {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => debug!(dir = %dir.display(), "removed visit directory"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(dir = %dir.display(), "could not remove visit directory: {}", e),
            }
        }
    }
}

impl Drop for ScratchDirs {
    fn drop(&mut self) {
        self.release();
    }
}

/// A fetched page before any harvesting.
pub(crate) struct Fetched {
    pub(crate) final_url: String,
    pub(crate) cookies: Vec<Cookie>,
    pub(crate) is_html: bool,
    pub(crate) body: String,
}

/// Turns a fetched body into a [`PageContext`]: saves the source, extracts
/// text and decoded payloads, downloads linked files and transcribes media.
/// Shared by every visitor so only the fetch differs between them.
pub(crate) struct PageAssembler {
    client: Client,
    work_dir: PathBuf,
    transcriber: Arc<dyn Transcriber>,
}

impl PageAssembler {
    pub(crate) fn new(client: Client, work_dir: PathBuf, transcriber: Arc<dyn Transcriber>) -> Self {
        Self {
            client,
            work_dir: absolute(work_dir),
            transcriber,
        }
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    fn visit_dir(&self) -> PathBuf {
        let id = uuid::Uuid::new_v4().to_string();
        self.work_dir.join(format!(
            "{}_{}",
            chrono::Utc::now().format("%Y%m%dT%H%M%S"),
            &id[..8]
        ))
    }

    pub(crate) async fn assemble(
        &self,
        link: &ChallengeLink,
        fetched: Result<Fetched, String>,
    ) -> PageContext {
        let fetched = match fetched {
            Ok(f) => f,
            Err(e) => {
                warn!(url = %link.url, error = %e, "page unretrievable");
                return PageContext::unretrievable(&link.url, e);
            }
        };

        let dir = self.visit_dir();
        let (visit_dir, raw_source_path) = match tokio::fs::create_dir_all(&dir).await {
            Ok(()) => {
                let path = dir.join("source.html");
                match tokio::fs::write(&path, &fetched.body).await {
                    Ok(()) => (Some(dir.clone()), Some(path)),
                    Err(e) => {
                        warn!(path = %path.display(), "could not save page source: {}", e);
                        (Some(dir.clone()), None)
                    }
                }
            }
            Err(e) => {
                warn!(dir = %dir.display(), "could not create visit directory: {}", e);
                (None, None)
            }
        };

        if !fetched.is_html {
            return PageContext {
                url: fetched.final_url,
                text: fetched.body,
                cookies: fetched.cookies,
                raw_source_path,
                visit_dir,
                ..PageContext::default()
            };
        }

        let mut text = html::visible_text(&fetched.body);
        let decoded = html::inline_base64_payloads(&fetched.body);
        if !decoded.is_empty() {
            text.push_str("\n\n--- DECODED CONTENT ---\n");
            text.push_str(&decoded.join("\n"));
        }

        let links = html::harvest_links(&fetched.body, &fetched.final_url);
        debug!(
            media = links.media.len(),
            files = links.files.len(),
            "harvested links"
        );
        let (downloaded_artifacts, transcripts) = if visit_dir.is_some() {
            self.collect_artifacts(links, &dir).await
        } else {
            (Vec::new(), Vec::new())
        };

        PageContext {
            url: fetched.final_url,
            text,
            downloaded_artifacts,
            transcripts,
            cookies: fetched.cookies,
            raw_source_path,
            fetch_error: None,
            visit_dir,
        }
    }

    async fn collect_artifacts(
        &self,
        links: html::PageLinks,
        dir: &Path,
    ) -> (Vec<Artifact>, Vec<String>) {
        let mut artifacts = Vec::new();
        let mut transcripts = Vec::new();

        let wanted = links
            .media
            .into_iter()
            .map(|u| (ArtifactKind::Media, u))
            .chain(links.files.into_iter().map(|u| (ArtifactKind::File, u)));

        for (kind, url) in wanted {
            let local_path = match download::download(&self.client, &url, dir).await {
                Ok(path) => path,
                Err(e) => {
                    warn!(url = %url, "skipping artifact: {:#}", e);
                    continue;
                }
            };

            if kind == ArtifactKind::Media && download::is_media_path(&local_path) {
                match self.transcriber.transcribe(&local_path).await {
                    Ok(text) => transcripts.push(transcribe::label_transcript(&url, &text)),
                    Err(e) => {
                        warn!(url = %url, "transcription failed: {:#}", e);
                        transcripts.push(format!("Error transcribing {}: {}", url, e));
                    }
                }
            }

            artifacts.push(Artifact {
                kind,
                local_path,
                source_url: url,
            });
        }
        (artifacts, transcripts)
    }
}

/// Static GET of the page. Content a page builds with scripts is only seen
/// through its inline `atob` payloads; use the browser visitor for more.
pub struct HttpPageVisitor {
    assembler: PageAssembler,
}

impl HttpPageVisitor {
    pub fn new(client: Client, work_dir: PathBuf, transcriber: Arc<dyn Transcriber>) -> Self {
        Self {
            assembler: PageAssembler::new(client, work_dir, transcriber),
        }
    }

    async fn fetch(&self, link: &ChallengeLink) -> Result<Fetched, String> {
        let mut request = self
            .assembler
            .client()
            .get(&link.url)
            .header(REFERER, &link.referer);
        if let Some(cookies) = cookie_header(&link.cookies) {
            request = request.header(COOKIE, cookies);
        }
        let response = request.send().await.map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("{} returned {}", link.url, status));
        }
        let final_url = response.url().to_string();
        let cookies: Vec<Cookie> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(Cookie::from_set_cookie)
            .collect();
        let is_html = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_none_or(|ct| ct.contains("html"));
        let body = response.text().await.map_err(|e| e.to_string())?;

        Ok(Fetched {
            final_url,
            cookies,
            is_html,
            body,
        })
    }
}

#[async_trait]
impl PageVisitor for HttpPageVisitor {
    async fn visit(&self, link: &ChallengeLink) -> PageContext {
        info!(url = %link.url, "visiting page");
        let fetched = self.fetch(link).await;
        self.assembler.assemble(link, fetched).await
    }
}
