use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pricehub_core::{ListingBatch, Marketplace, MarketplaceError, RawListing, SearchQuery};
use pricehub_storage::HttpFetcher;
use serde_json::{json, Value as JsonValue};
use url::form_urlencoded;

use crate::extract::{json_first_text, json_text};
use crate::normalize::parse_price;
use crate::{within_budget, Access, AdapterSettings, MarketplaceAdapter};

const ALGOLIA_QUERIES_URL: &str = "https://2fm1qovagb-dsn.algolia.net/1/indexes/*/queries";
// Public search-only credentials served to every telemart.pk visitor.
const ALGOLIA_APP_ID: &str = "2FM1QOVAGB";
const ALGOLIA_SEARCH_KEY: &str = "26a36df3159aaedcb93de21c509d17fc";

pub struct TelemartAdapter {
    http: Arc<HttpFetcher>,
    hits_per_page: u32,
    user_agent: String,
    budget: Duration,
}

impl TelemartAdapter {
    pub fn new(http: Arc<HttpFetcher>, settings: &AdapterSettings) -> Self {
        Self {
            http,
            hits_per_page: settings.results_per_page,
            user_agent: settings.user_agent.clone(),
            budget: settings.budgets.budget(Marketplace::Telemart),
        }
    }

    pub fn request_body(&self, query: &SearchQuery) -> JsonValue {
        let params = form_urlencoded::Serializer::new(String::new())
            .append_pair("query", query.text())
            .append_pair("hitsPerPage", &self.hits_per_page.to_string())
            .finish();
        json!({ "requests": [{ "indexName": "products", "params": params }] })
    }
}

#[async_trait]
impl MarketplaceAdapter for TelemartAdapter {
    fn marketplace(&self) -> Marketplace {
        Marketplace::Telemart
    }

    fn access(&self) -> Access {
        Access::Api
    }

    fn budget(&self) -> Duration {
        self.budget
    }

    async fn fetch(&self, query: &SearchQuery) -> Result<ListingBatch, MarketplaceError> {
        let body = self.request_body(query);
        within_budget(Marketplace::Telemart, self.budget, async {
            let headers = [
                ("x-algolia-application-id", ALGOLIA_APP_ID),
                ("x-algolia-api-key", ALGOLIA_SEARCH_KEY),
                ("User-Agent", self.user_agent.as_str()),
            ];
            let resp = self
                .http
                .post_json(Marketplace::Telemart, ALGOLIA_QUERIES_URL, &headers, &body)
                .await?;
            let payload: JsonValue = resp.json(Marketplace::Telemart)?;
            Ok(ListingBatch::new(ALGOLIA_QUERIES_URL, parse_telemart_response(&payload)?))
        })
        .await
    }
}

pub fn parse_telemart_response(body: &JsonValue) -> Result<Vec<RawListing>, MarketplaceError> {
    let results = body
        .get("results")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| MarketplaceError::parse(Marketplace::Telemart, "missing algolia results"))?;
    let Some(hits) = results
        .first()
        .and_then(|r| r.get("hits"))
        .and_then(JsonValue::as_array)
    else {
        return Ok(Vec::new());
    };

    Ok(hits
        .iter()
        .map(|hit| {
            let mut raw = RawListing::new(Marketplace::Telemart);
            raw.title = json_first_text(hit, &["title", "name"]);
            // a zero sale price means "no sale"; fall through to the next field
            raw.price_text = ["sale_price", "discounted_price", "price"]
                .iter()
                .filter_map(|key| json_text(hit, &[*key]))
                .find(|value| parse_price(value).is_some_and(|p| p > 0.0));
            raw.brand = json_first_text(hit, &["brand"]);
            raw.href = json_first_text(hit, &["slug"]);
            raw.image = json_first_text(hit, &["mainImageLink", "placeholder_link"]);
            raw
        })
        .collect())
}
