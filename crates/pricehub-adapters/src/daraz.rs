use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pricehub_core::{ListingBatch, Marketplace, MarketplaceError, RawListing, SearchQuery};
use pricehub_storage::HttpFetcher;
use serde_json::Value as JsonValue;
use url::Url;

use crate::extract::{json_first_text, json_text};
use crate::{within_budget, Access, AdapterSettings, MarketplaceAdapter};

const CATALOG_URL: &str = "https://www.daraz.pk/catalog/";

const URL_FIELDS: [&str; 7] = [
    "productUrl",
    "itemUrl",
    "url",
    "link",
    "href",
    "productLink",
    "itemLink",
];

// Markers of the anti-bot interstitial served instead of catalog JSON.
const BLOCK_MARKERS: [&str; 3] = ["punish", "captcha", "x5secdata"];

pub struct DarazAdapter {
    http: Arc<HttpFetcher>,
    user_agent: String,
    budget: Duration,
}

impl DarazAdapter {
    pub fn new(http: Arc<HttpFetcher>, settings: &AdapterSettings) -> Self {
        Self {
            http,
            user_agent: settings.user_agent.clone(),
            budget: settings.budgets.budget(Marketplace::Daraz),
        }
    }

    pub fn search_url(query: &SearchQuery) -> String {
        Url::parse_with_params(
            CATALOG_URL,
            [("_keyori", "ss"), ("ajax", "true"), ("q", query.text())],
        )
        .map(String::from)
        .unwrap_or_else(|_| CATALOG_URL.to_string())
    }
}

#[async_trait]
impl MarketplaceAdapter for DarazAdapter {
    fn marketplace(&self) -> Marketplace {
        Marketplace::Daraz
    }

    fn access(&self) -> Access {
        Access::Api
    }

    fn budget(&self) -> Duration {
        self.budget
    }

    async fn fetch(&self, query: &SearchQuery) -> Result<ListingBatch, MarketplaceError> {
        let url = Self::search_url(query);
        within_budget(Marketplace::Daraz, self.budget, async {
            let headers = [
                ("User-Agent", self.user_agent.as_str()),
                ("Accept", "application/json, text/plain, */*"),
                ("Accept-Language", "en-US,en;q=0.9"),
                ("Cache-Control", "no-cache"),
            ];
            let resp = self.http.get(Marketplace::Daraz, &url, &headers).await?;
            let body: JsonValue = match serde_json::from_slice(&resp.body) {
                Ok(body) => body,
                Err(err) => {
                    let text = resp.text().to_ascii_lowercase();
                    if BLOCK_MARKERS.iter().any(|m| text.contains(m)) {
                        return Err(MarketplaceError::blocked(
                            Marketplace::Daraz,
                            "catalog returned an anti-bot challenge",
                        ));
                    }
                    return Err(MarketplaceError::parse(
                        Marketplace::Daraz,
                        format!("catalog response is not json: {err}"),
                    ));
                }
            };
            Ok(ListingBatch::new(url.clone(), parse_daraz_response(&body)?))
        })
        .await
    }
}

/// Listings under `mods.listItems`. A payload without `mods` is treated as a changed API.
pub fn parse_daraz_response(body: &JsonValue) -> Result<Vec<RawListing>, MarketplaceError> {
    if body.get("rgv587_flag").is_some() {
        return Err(MarketplaceError::blocked(
            Marketplace::Daraz,
            "catalog redirected to a slider challenge",
        ));
    }
    let mods = body
        .get("mods")
        .ok_or_else(|| MarketplaceError::parse(Marketplace::Daraz, "missing mods in catalog response"))?;
    let Some(items) = mods.get("listItems").and_then(JsonValue::as_array) else {
        return Ok(Vec::new());
    };

    Ok(items
        .iter()
        .map(|item| {
            let mut raw = RawListing::new(Marketplace::Daraz);
            raw.title = json_text(item, &["name"]);
            raw.price_text = json_first_text(item, &["priceShow", "price"]);
            raw.href = json_first_text(item, &URL_FIELDS).or_else(|| {
                json_first_text(item, &["productId", "itemId", "nid"])
                    .map(|id| format!("/products/i{id}.html"))
            });
            raw.image = json_text(item, &["image"]);
            raw.rating_text = json_text(item, &["ratingScore"]);
            raw.brand = json_text(item, &["brandName"]);
            raw.seller = json_text(item, &["sellerName"]);
            raw
        })
        .collect())
}
