use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pricehub_core::{ListingBatch, Marketplace, MarketplaceError, RawListing, SearchQuery};
use scraper::Html;
use url::Url;

use crate::browser::{wait_for_any, with_browser_session, PageProbe};
use crate::extract::{page_has_any, select_containers, try_extract, try_extract_where, visible_text, Strategy};
use crate::normalize::is_usable_image_url;
use crate::{Access, AdapterSettings, BrowserLauncher, MarketplaceAdapter};

const SEARCH_URL: &str = "https://www.alibaba.com/trade/search";

const CONTAINERS: [&str; 7] = [
    ".fy23-search-card",
    ".search-card",
    ".organic-offer-wrapper",
    ".m-offer-item",
    ".list-no-v2-outter",
    ".product-item",
    "[data-spm*='product']",
];

const CAPTCHA: [&str; 5] = [".captcha", "#captcha", ".slider-verify", ".verification", "#nocaptcha"];

const NAME: [Strategy; 7] = [
    Strategy::Text(".search-card-e-title a span"),
    Strategy::Text(".search-card-e-title"),
    Strategy::Text(".elements-title-normal__content"),
    Strategy::Text(".offer-title"),
    Strategy::Text(".m-offer-title"),
    Strategy::Text("h2"),
    Strategy::Text("h3"),
];
const PRICE: [Strategy; 5] = [
    Strategy::Text(".search-card-e-price-main"),
    Strategy::Text(".elements-offer-price-normal__price"),
    Strategy::Text(".offer-price"),
    Strategy::Text(".price-range"),
    Strategy::Text("[class*='price']"),
];
const LINK: [Strategy; 2] = [
    Strategy::Attr(".search-card-e-title a", "href"),
    Strategy::Attr("a", "href"),
];
const RATING: [Strategy; 2] = [
    Strategy::Text(".search-card-e-review strong"),
    Strategy::Text("[class*='review'] strong"),
];
const IMAGE: [Strategy; 4] = [
    Strategy::Attr(".search-card-e-slider__img", "src"),
    Strategy::Attr("img", "data-src"),
    Strategy::Attr("img", "src"),
    Strategy::SrcsetLast("img"),
];
const SUPPLIER: [Strategy; 4] = [
    Strategy::Text(".search-card-e-company"),
    Strategy::Text(".company-name"),
    Strategy::Text(".supplier-name"),
    Strategy::Text(".supplier"),
];
const MOQ: [Strategy; 5] = [
    Strategy::Text(".search-card-e-market-power-common"),
    Strategy::Text(".element-offer-minorder-normal__value"),
    Strategy::Text(".min-order"),
    Strategy::Text("[class*='min-order']"),
    Strategy::Text("[class*='moq']"),
];

pub struct AlibabaAdapter {
    browser: Arc<dyn BrowserLauncher>,
    budget: Duration,
    wait: Duration,
    poll_every: Duration,
    max_listings: usize,
}

impl AlibabaAdapter {
    pub fn new(browser: Arc<dyn BrowserLauncher>, settings: &AdapterSettings) -> Self {
        Self {
            browser,
            budget: settings.budgets.budget(Marketplace::Alibaba),
            wait: settings.budgets.selector_wait(Marketplace::Alibaba),
            poll_every: settings.poll_interval(),
            max_listings: settings.max_browser_listings,
        }
    }

    pub fn search_url(query: &SearchQuery) -> String {
        let mut params = vec![("SearchText", query.text().to_string()), ("page", "1".to_string())];
        if let Some(max_price) = query.max_price() {
            params.push(("priceto", max_price.to_string()));
        }
        Url::parse_with_params(SEARCH_URL, params)
            .map(String::from)
            .unwrap_or_else(|_| SEARCH_URL.to_string())
    }
}

#[async_trait]
impl MarketplaceAdapter for AlibabaAdapter {
    fn marketplace(&self) -> Marketplace {
        Marketplace::Alibaba
    }

    fn access(&self) -> Access {
        Access::Browser
    }

    fn budget(&self) -> Duration {
        self.budget
    }

    fn quality_gated(&self) -> bool {
        true
    }

    async fn fetch(&self, query: &SearchQuery) -> Result<ListingBatch, MarketplaceError> {
        let url = Self::search_url(query);
        let (wait, poll_every, max_listings) = (self.wait, self.poll_every, self.max_listings);
        with_browser_session(self.browser.as_ref(), Marketplace::Alibaba, self.budget, |session| async move {
            session
                .goto(&url)
                .await
                .map_err(|e| MarketplaceError::network(Marketplace::Alibaba, format!("{e:#}")))?;
            let probe = wait_for_any(session.as_ref(), &CONTAINERS, wait, poll_every)
                .await
                .map_err(|e| MarketplaceError::network(Marketplace::Alibaba, format!("{e:#}")))?;

            match probe {
                PageProbe::Ready { html, .. } => {
                    let mut listings = parse_alibaba_page(&html);
                    listings.truncate(max_listings);
                    Ok(ListingBatch::new(url, listings).with_page_text(visible_text(&html)))
                }
                PageProbe::TimedOut { html } if page_has_any(&html, &CAPTCHA) => Err(
                    MarketplaceError::blocked(Marketplace::Alibaba, "captcha detected on search page"),
                ),
                PageProbe::TimedOut { .. } => Err(MarketplaceError::parse(
                    Marketplace::Alibaba,
                    "no product containers rendered; layout may have changed",
                )),
            }
        })
        .await
    }
}

pub fn parse_alibaba_page(html: &str) -> Vec<RawListing> {
    let document = Html::parse_document(html);
    select_containers(&document, &CONTAINERS)
        .into_iter()
        .map(|card| {
            let mut raw = RawListing::new(Marketplace::Alibaba);
            raw.title = try_extract(card, &NAME);
            raw.price_text = try_extract(card, &PRICE);
            raw.href = try_extract(card, &LINK);
            raw.rating_text = try_extract(card, &RATING);
            raw.image = try_extract_where(card, &IMAGE, is_usable_image_url);
            raw.seller = try_extract(card, &SUPPLIER);
            raw.moq = try_extract(card, &MOQ);
            raw
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::ScriptedLauncher;
    use crate::fixture;
    use crate::normalize::normalize;
    use pricehub_core::ErrorKind;

    fn adapter(launcher: &ScriptedLauncher) -> AlibabaAdapter {
        AlibabaAdapter::new(Arc::new(launcher.clone()), &AdapterSettings::default())
    }

    #[test]
    fn parses_offer_cards_with_supplier_and_moq() {
        let listings = parse_alibaba_page(&fixture("alibaba", "search.html"));
        assert_eq!(listings.len(), 5);

        let first = normalize(&listings[0]).expect("product");
        assert_eq!(first.name, "Wireless Bluetooth Earbuds TWS Headphones");
        assert_eq!(first.price, Some(3.5));
        assert_eq!(first.currency, "USD");
        assert_eq!(first.rating, Some(4.7));
        assert_eq!(first.company.as_deref(), Some("Shenzhen Audio Tech Co., Ltd."));
        assert_eq!(first.moq.as_deref(), Some("Min. order: 100 pieces"));
        assert_eq!(
            first.url.as_deref(),
            Some("https://www.alibaba.com/product-detail/Wireless-Earbuds_1600001.html")
        );
        assert!(first.image_url.is_some());
    }

    #[test]
    fn search_url_carries_price_ceiling() {
        let plain = SearchQuery::new("wireless earbuds").expect("query");
        assert_eq!(
            AlibabaAdapter::search_url(&plain),
            "https://www.alibaba.com/trade/search?SearchText=wireless+earbuds&page=1"
        );
        let capped = plain.with_max_price(15.0).expect("price");
        assert!(AlibabaAdapter::search_url(&capped).ends_with("&priceto=15"));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_carries_visible_page_text() {
        let launcher = ScriptedLauncher::new(vec![fixture("alibaba", "search.html")]);
        let query = SearchQuery::new("wireless earbuds").expect("query");
        let batch = adapter(&launcher).fetch(&query).await.expect("batch");
        assert_eq!(batch.listings.len(), 5);
        let text = batch.page_text.expect("page text");
        assert!(text.contains("Wireless Bluetooth Earbuds"));
        assert!(!text.contains("window.runParams"));
        assert_eq!(launcher.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn captcha_interstitial_is_blocked() {
        let launcher = ScriptedLauncher::new(vec![
            "<html><body><div id='nocaptcha'>Please slide to verify</div></body></html>".into(),
        ]);
        let query = SearchQuery::new("wireless earbuds").expect("query");
        let err = adapter(&launcher).fetch(&query).await.expect_err("blocked");
        assert_eq!(err.kind, ErrorKind::Blocked);
        assert!(!err.is_retryable());
        assert_eq!(launcher.closes(), 1);

        let launcher = ScriptedLauncher::new(vec!["<html><body><main></main></body></html>".into()]);
        let err = adapter(&launcher).fetch(&query).await.expect_err("parse");
        assert_eq!(err.kind, ErrorKind::Parse);
    }
}
