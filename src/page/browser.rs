//! Headless Chromium page visitor: the page's scripts run before its DOM is
//! read, then the same harvesting as the HTTP visitor applies.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, Headers, SetExtraHttpHeadersParams,
};
use futures::StreamExt;
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Fetched, PageAssembler, PageVisitor, Transcriber};
use crate::chain::{ChallengeLink, Cookie, PageContext};

#[derive(Debug, Clone)]
pub struct BrowserSettings {
    /// Wait after navigation for client-side rendering.
    pub settle: Duration,
    pub navigation_timeout: Duration,
    pub executable: Option<PathBuf>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(3),
            navigation_timeout: Duration::from_secs(30),
            executable: None,
        }
    }
}

/// One browser process shared by every visit; each visit uses a fresh tab.
pub struct BrowserPageVisitor {
    browser: Browser,
    handler: JoinHandle<()>,
    assembler: PageAssembler,
    settings: BrowserSettings,
}

impl BrowserPageVisitor {
    pub async fn launch(
        client: Client,
        work_dir: PathBuf,
        transcriber: Arc<dyn Transcriber>,
        settings: BrowserSettings,
    ) -> Result<Self> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .request_timeout(settings.navigation_timeout);
        if let Some(path) = &settings.executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("invalid browser config: {}", e))?;

        let (browser, mut events) = Browser::launch(config)
            .await
            .context("Failed to launch headless Chromium")?;
        let handler = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let Err(e) = event {
                    debug!("browser handler event error: {}", e);
                }
            }
        });
        info!("headless browser ready");

        Ok(Self {
            browser,
            handler,
            assembler: PageAssembler::new(client, work_dir, transcriber),
            settings,
        })
    }

    async fn render(&self, link: &ChallengeLink) -> Result<Fetched> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .context("Failed to open a tab")?;
        let rendered = self.render_in(&page, link).await;
        if let Err(e) = page.close().await {
            debug!("closing tab failed: {}", e);
        }
        rendered
    }

    async fn render_in(&self, page: &Page, link: &ChallengeLink) -> Result<Fetched> {
        page.execute(SetExtraHttpHeadersParams::new(Headers::new(referer_header(
            link,
        ))))
        .await
        .context("Failed to set Referer")?;
        let cookies = cookie_params(link)?;
        if !cookies.is_empty() {
            page.set_cookies(cookies)
                .await
                .context("Failed to set link cookies")?;
        }

        tokio::time::timeout(self.settings.navigation_timeout, page.goto(link.url.clone()))
            .await
            .with_context(|| format!("navigation to {} timed out", link.url))?
            .with_context(|| format!("navigation to {} failed", link.url))?;
        tokio::time::sleep(self.settings.settle).await;

        let body = page.content().await.context("Failed to read rendered DOM")?;
        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| link.url.clone());
        let cookies = page
            .get_cookies()
            .await
            .map(|all| {
                all.into_iter()
                    .map(|c| Cookie::new(c.name, c.value))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Fetched {
            final_url,
            cookies,
            is_html: true,
            body,
        })
    }
}

#[async_trait]
impl PageVisitor for BrowserPageVisitor {
    async fn visit(&self, link: &ChallengeLink) -> PageContext {
        info!(url = %link.url, "rendering page");
        let fetched = self.render(link).await.map_err(|e| {
            warn!(url = %link.url, "render failed: {:#}", e);
            format!("{:#}", e)
        });
        self.assembler.assemble(link, fetched).await
    }
}

impl Drop for BrowserPageVisitor {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

fn referer_header(link: &ChallengeLink) -> serde_json::Value {
    serde_json::json!({ "Referer": link.referer })
}

/// The link's cookies, scoped to its URL.
fn cookie_params(link: &ChallengeLink) -> Result<Vec<CookieParam>> {
    link.cookies
        .iter()
        .map(|c| {
            CookieParam::builder()
                .name(c.name.clone())
                .value(c.value.clone())
                .url(link.url.clone())
                .build()
                .map_err(|e| anyhow::anyhow!("invalid cookie {}: {}", c.name, e))
        })
        .collect()
}
