use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use pricehub_core::{ListingBatch, Marketplace, MarketplaceError, RawListing, SearchQuery};
use scraper::Html;
use url::Url;

use crate::browser::{wait_for_any, with_browser_session, PageProbe};
use crate::extract::{page_has_any, select_containers, try_extract, try_extract_where, Strategy};
use crate::normalize::is_usable_image_url;
use crate::{Access, AdapterSettings, BrowserLauncher, MarketplaceAdapter};

const SEARCH_URL: &str = "https://priceoye.pk/search";

const PRODUCT_BOX: &str = ".productBox";
const NO_RESULTS: [&str; 2] = [".no-results", ".empty-state"];
const READY: [&str; 3] = [PRODUCT_BOX, NO_RESULTS[0], NO_RESULTS[1]];
const CHALLENGE: [&str; 4] = ["#challenge-form", ".cf-browser-verification", "#captcha", ".captcha"];

const TITLE: [Strategy; 3] = [
    Strategy::Text(".p-title"),
    Strategy::Text("h3"),
    Strategy::Attr("a", "title"),
];
const PRICE: [Strategy; 3] = [
    Strategy::Text(".price-box"),
    Strategy::Text(".price"),
    Strategy::Text("[class*='price']"),
];
const LINK: [Strategy; 1] = [Strategy::Attr("a", "href")];

const IMAGE_SELECTORS: [&str; 9] = [
    "img[data-src*='product']",
    "img[src*='product']",
    "img[data-original*='product']",
    ".product-image img",
    ".p-image img",
    "picture img",
    "[class*='image'] img",
    "img[loading='lazy']",
    "img",
];

// Lazy-loading attributes first; `src` often holds a placeholder until scrolled into view.
static IMAGE: LazyLock<Vec<Strategy>> = LazyLock::new(|| {
    IMAGE_SELECTORS
        .iter()
        .copied()
        .flat_map(|sel| {
            [
                Strategy::Attr(sel, "data-src"),
                Strategy::Attr(sel, "data-original"),
                Strategy::Attr(sel, "data-lazy-src"),
                Strategy::SrcsetLast(sel),
                Strategy::Attr(sel, "src"),
            ]
        })
        .collect()
});

pub struct PriceOyeAdapter {
    browser: Arc<dyn BrowserLauncher>,
    budget: Duration,
    wait: Duration,
    poll_every: Duration,
    max_listings: usize,
}

impl PriceOyeAdapter {
    pub fn new(browser: Arc<dyn BrowserLauncher>, settings: &AdapterSettings) -> Self {
        Self {
            browser,
            budget: settings.budgets.budget(Marketplace::PriceOye),
            wait: settings.budgets.selector_wait(Marketplace::PriceOye),
            poll_every: settings.poll_interval(),
            max_listings: settings.max_browser_listings,
        }
    }

    pub fn search_url(query: &SearchQuery) -> String {
        Url::parse_with_params(SEARCH_URL, [("q", query.text())])
            .map(String::from)
            .unwrap_or_else(|_| SEARCH_URL.to_string())
    }
}

#[async_trait]
impl MarketplaceAdapter for PriceOyeAdapter {
    fn marketplace(&self) -> Marketplace {
        Marketplace::PriceOye
    }

    fn access(&self) -> Access {
        Access::Browser
    }

    fn budget(&self) -> Duration {
        self.budget
    }

    async fn fetch(&self, query: &SearchQuery) -> Result<ListingBatch, MarketplaceError> {
        let url = Self::search_url(query);
        let (wait, poll_every, max_listings) = (self.wait, self.poll_every, self.max_listings);
        with_browser_session(self.browser.as_ref(), Marketplace::PriceOye, self.budget, |session| async move {
            session
                .goto(&url)
                .await
                .map_err(|e| MarketplaceError::network(Marketplace::PriceOye, format!("{e:#}")))?;
            let probe = wait_for_any(session.as_ref(), &READY, wait, poll_every)
                .await
                .map_err(|e| MarketplaceError::network(Marketplace::PriceOye, format!("{e:#}")))?;

            match probe {
                PageProbe::Ready { selector: PRODUCT_BOX, html } => {
                    let mut listings = parse_priceoye_page(&html);
                    listings.truncate(max_listings);
                    Ok(ListingBatch::new(url, listings))
                }
                // explicit "no results" markup
                PageProbe::Ready { .. } => Ok(ListingBatch::new(url, Vec::new())),
                PageProbe::TimedOut { html } if page_has_any(&html, &CHALLENGE) => Err(
                    MarketplaceError::blocked(Marketplace::PriceOye, "search page served a bot challenge"),
                ),
                PageProbe::TimedOut { .. } => Err(MarketplaceError::parse(
                    Marketplace::PriceOye,
                    format!("no {PRODUCT_BOX} containers rendered; layout may have changed"),
                )),
            }
        })
        .await
    }
}

pub fn parse_priceoye_page(html: &str) -> Vec<RawListing> {
    let document = Html::parse_document(html);
    select_containers(&document, &[PRODUCT_BOX])
        .into_iter()
        .map(|card| {
            let mut raw = RawListing::new(Marketplace::PriceOye);
            raw.title = try_extract(card, &TITLE);
            raw.price_text = try_extract(card, &PRICE);
            raw.href = try_extract(card, &LINK);
            raw.image = try_extract_where(card, &IMAGE, is_usable_image_url);
            raw
        })
        .collect()
}
