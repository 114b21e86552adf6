//! Marketplace adapter contracts and the per-marketplace implementations.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pricehub_core::{ListingBatch, Marketplace, MarketplaceError, SearchQuery};
use pricehub_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub mod browser;
pub mod extract;
pub mod normalize;

mod alibaba;
mod daraz;
mod ebay;
mod priceoye;
mod telemart;

pub use alibaba::{parse_alibaba_page, AlibabaAdapter};
pub use browser::{BrowserLauncher, BrowserSession, WebDriverLauncher};
pub use daraz::{parse_daraz_response, DarazAdapter};
pub use ebay::{parse_ebay_response, EbayAdapter};
pub use priceoye::{parse_priceoye_page, PriceOyeAdapter};
pub use telemart::{parse_telemart_response, TelemartAdapter};

pub const CRATE_NAME: &str = "pricehub-adapters";

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    Api,
    Browser,
}

#[async_trait]
pub trait MarketplaceAdapter: Send + Sync {
    fn marketplace(&self) -> Marketplace;
    fn access(&self) -> Access;
    fn budget(&self) -> Duration;

    fn quality_gated(&self) -> bool {
        false
    }

    /// One attempt. Distinguishable failures are errors, never an empty batch.
    async fn fetch(&self, query: &SearchQuery) -> Result<ListingBatch, MarketplaceError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterSettings {
    pub user_agent: String,
    pub webdriver_url: String,
    pub headless: bool,
    pub ebay_app_id: Option<String>,
    pub results_per_page: u32,
    pub max_browser_listings: usize,
    pub poll_interval_ms: u64,
    pub budgets: BudgetSettings,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            user_agent: BROWSER_USER_AGENT.to_string(),
            webdriver_url: "http://localhost:9515".to_string(),
            headless: true,
            ebay_app_id: None,
            results_per_page: 20,
            max_browser_listings: 20,
            poll_interval_ms: 250,
            budgets: BudgetSettings::default(),
        }
    }
}

impl AdapterSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSettings {
    pub daraz_ms: u64,
    pub priceoye_ms: u64,
    pub telemart_ms: u64,
    pub alibaba_ms: u64,
    pub ebay_ms: u64,
    /// How long the browser adapters wait for result containers to render.
    pub priceoye_wait_ms: u64,
    pub alibaba_wait_ms: u64,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            daraz_ms: 15_000,
            priceoye_ms: 30_000,
            telemart_ms: 15_000,
            alibaba_ms: 7_000,
            ebay_ms: 15_000,
            priceoye_wait_ms: 15_000,
            alibaba_wait_ms: 5_000,
        }
    }
}

impl BudgetSettings {
    pub fn budget(&self, marketplace: Marketplace) -> Duration {
        Duration::from_millis(match marketplace {
            Marketplace::Daraz => self.daraz_ms,
            Marketplace::PriceOye => self.priceoye_ms,
            Marketplace::Telemart => self.telemart_ms,
            Marketplace::Alibaba => self.alibaba_ms,
            Marketplace::Ebay => self.ebay_ms,
        })
    }

    /// Selector wait, kept inside the attempt budget so a missing layout is classified before the budget fires.
    pub fn selector_wait(&self, marketplace: Marketplace) -> Duration {
        let wait = match marketplace {
            Marketplace::PriceOye => self.priceoye_wait_ms,
            Marketplace::Alibaba => self.alibaba_wait_ms,
            _ => 0,
        };
        Duration::from_millis(wait).min(self.budget(marketplace) * 4 / 5)
    }
}

pub fn adapter_for_marketplace(
    marketplace: Marketplace,
    settings: &AdapterSettings,
    http: Arc<HttpFetcher>,
    browser: Arc<dyn BrowserLauncher>,
) -> Option<Box<dyn MarketplaceAdapter>> {
    match marketplace {
        Marketplace::Daraz => Some(Box::new(DarazAdapter::new(http, settings))),
        Marketplace::Telemart => Some(Box::new(TelemartAdapter::new(http, settings))),
        Marketplace::PriceOye => Some(Box::new(PriceOyeAdapter::new(browser, settings))),
        Marketplace::Alibaba => Some(Box::new(AlibabaAdapter::new(browser, settings))),
        Marketplace::Ebay => match settings.ebay_app_id.as_deref().map(str::trim) {
            Some(app_id) if !app_id.is_empty() => {
                Some(Box::new(EbayAdapter::new(http, app_id.to_string(), settings)))
            }
            _ => {
                warn!("EBAY_APP_ID is not configured; eBay is disabled");
                None
            }
        },
    }
}

pub(crate) async fn within_budget<T>(
    marketplace: Marketplace,
    budget: Duration,
    attempt: impl Future<Output = Result<T, MarketplaceError>>,
) -> Result<T, MarketplaceError> {
    match tokio::time::timeout(budget, attempt).await {
        Ok(outcome) => outcome,
        Err(_) => Err(MarketplaceError::timeout(marketplace, budget)),
    }
}

#[cfg(test)]
pub(crate) fn fixture(marketplace: &str, name: &str) -> String {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(marketplace)
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}
