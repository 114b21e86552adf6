//! Headless browser port used by the JavaScript-rendered marketplaces.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use pricehub_core::{Marketplace, MarketplaceError};
use thirtyfour::prelude::*;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::extract::first_matching_selector;

#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn goto(&self, url: &str) -> anyhow::Result<()>;
    async fn page_source(&self) -> anyhow::Result<String>;
    async fn close(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> anyhow::Result<Arc<dyn BrowserSession>>;
}

#[derive(Debug, Clone)]
pub struct WebDriverLauncher {
    pub webdriver_url: String,
    pub user_agent: String,
    pub headless: bool,
}

#[async_trait]
impl BrowserLauncher for WebDriverLauncher {
    async fn launch(&self) -> anyhow::Result<Arc<dyn BrowserSession>> {
        let mut caps = DesiredCapabilities::chrome();
        if self.headless {
            caps.set_headless().context("enabling headless chrome")?;
        }
        caps.add_arg("--no-sandbox")?;
        caps.add_arg("--disable-dev-shm-usage")?;
        caps.add_arg("--disable-blink-features=AutomationControlled")?;
        caps.add_arg("--window-size=1366,768")?;
        caps.add_arg(&format!("--user-agent={}", self.user_agent))?;

        let driver = WebDriver::new(self.webdriver_url.as_str(), caps)
            .await
            .with_context(|| format!("connecting to webdriver at {}", self.webdriver_url))?;
        Ok(Arc::new(WebDriverSession { driver }))
    }
}

struct WebDriverSession {
    driver: WebDriver,
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    async fn goto(&self, url: &str) -> anyhow::Result<()> {
        self.driver
            .goto(url)
            .await
            .with_context(|| format!("navigating to {url}"))
    }

    async fn page_source(&self) -> anyhow::Result<String> {
        self.driver.source().await.context("reading page source")
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.driver.clone().quit().await.context("closing webdriver session")
    }
}

/// The session is closed on every exit path, including errors and budget expiry.
pub async fn with_browser_session<T, F, Fut>(
    launcher: &dyn BrowserLauncher,
    marketplace: Marketplace,
    budget: Duration,
    work: F,
) -> Result<T, MarketplaceError>
where
    F: FnOnce(Arc<dyn BrowserSession>) -> Fut,
    Fut: Future<Output = Result<T, MarketplaceError>>,
{
    let started = Instant::now();
    let session = match tokio::time::timeout(budget, launcher.launch()).await {
        Ok(Ok(session)) => session,
        Ok(Err(err)) => {
            return Err(MarketplaceError::network(
                marketplace,
                format!("browser launch failed: {err:#}"),
            ))
        }
        Err(_) => return Err(MarketplaceError::timeout(marketplace, budget)),
    };

    let remaining = budget.saturating_sub(started.elapsed());
    let outcome = match tokio::time::timeout(remaining, work(Arc::clone(&session))).await {
        Ok(outcome) => outcome,
        Err(_) => Err(MarketplaceError::timeout(marketplace, budget)),
    };

    if let Err(err) = session.close().await {
        warn!(marketplace = marketplace.slug(), error = %format!("{err:#}"), "browser session did not close cleanly");
    }
    outcome
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageProbe {
    Ready { html: String, selector: &'static str },
    /// Nothing matched before the wait ran out; carries the last page source seen.
    TimedOut { html: String },
}

pub async fn wait_for_any(
    session: &dyn BrowserSession,
    candidates: &[&'static str],
    wait: Duration,
    poll_every: Duration,
) -> anyhow::Result<PageProbe> {
    let started = Instant::now();
    loop {
        let html = session.page_source().await?;
        if let Some(selector) = first_matching_selector(&html, candidates) {
            debug!(selector, waited_ms = started.elapsed().as_millis() as u64, "page ready");
            return Ok(PageProbe::Ready { html, selector });
        }
        if started.elapsed() >= wait {
            return Ok(PageProbe::TimedOut { html });
        }
        tokio::time::sleep(poll_every).await;
    }
}
