use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pricehub_core::{ListingBatch, Marketplace, MarketplaceError, RawListing, SearchQuery};
use pricehub_storage::HttpFetcher;
use serde_json::Value as JsonValue;
use url::Url;

use crate::extract::json_text;
use crate::{within_budget, Access, AdapterSettings, MarketplaceAdapter};

const FINDING_ENDPOINT: &str = "https://svcs.ebay.com/services/search/FindingService/v1";

pub struct EbayAdapter {
    http: Arc<HttpFetcher>,
    app_id: String,
    entries_per_page: u32,
    user_agent: String,
    budget: Duration,
}

impl EbayAdapter {
    pub fn new(http: Arc<HttpFetcher>, app_id: String, settings: &AdapterSettings) -> Self {
        Self {
            http,
            app_id,
            entries_per_page: settings.results_per_page,
            user_agent: settings.user_agent.clone(),
            budget: settings.budgets.budget(Marketplace::Ebay),
        }
    }

    pub fn search_url(&self, query: &SearchQuery) -> String {
        let entries = self.entries_per_page.to_string();
        let params = [
            ("OPERATION-NAME", "findItemsByKeywords"),
            ("SERVICE-VERSION", "1.0.0"),
            ("SECURITY-APPNAME", self.app_id.as_str()),
            ("RESPONSE-DATA-FORMAT", "JSON"),
            ("REST-PAYLOAD", ""),
            ("keywords", query.text()),
            ("paginationInput.entriesPerPage", entries.as_str()),
            ("sortOrder", "BestMatch"),
            ("GLOBAL-ID", "EBAY-US"),
            ("itemFilter(0).name", "Condition"),
            ("itemFilter(0).value", "New"),
            ("itemFilter(1).name", "ListingType"),
            ("itemFilter(1).value", "FixedPrice"),
        ];
        Url::parse_with_params(FINDING_ENDPOINT, params)
            .map(String::from)
            .unwrap_or_else(|_| FINDING_ENDPOINT.to_string())
    }
}

#[async_trait]
impl MarketplaceAdapter for EbayAdapter {
    fn marketplace(&self) -> Marketplace {
        Marketplace::Ebay
    }

    fn access(&self) -> Access {
        Access::Api
    }

    fn budget(&self) -> Duration {
        self.budget
    }

    async fn fetch(&self, query: &SearchQuery) -> Result<ListingBatch, MarketplaceError> {
        let url = self.search_url(query);
        within_budget(Marketplace::Ebay, self.budget, async {
            let resp = self
                .http
                .get(Marketplace::Ebay, &url, &[("User-Agent", self.user_agent.as_str())])
                .await?;
            let body: JsonValue = resp.json(Marketplace::Ebay)?;
            let listings = parse_ebay_response(&body)?;
            Ok(ListingBatch::new(url.clone(), listings))
        })
        .await
    }
}

/// A response without the top-level envelope, or with `ack = Failure`, is a parse error;
/// a well-formed response without items is an empty result.
pub fn parse_ebay_response(body: &JsonValue) -> Result<Vec<RawListing>, MarketplaceError> {
    let envelope = body
        .get("findItemsByKeywordsResponse")
        .and_then(|r| r.get(0))
        .ok_or_else(|| MarketplaceError::parse(Marketplace::Ebay, "missing findItemsByKeywordsResponse"))?;

    if json_text(envelope, &["ack"]).as_deref() == Some("Failure") {
        let message = json_text(envelope, &["errorMessage", "error", "message"])
            .unwrap_or_else(|| "finding api reported failure".to_string());
        return Err(MarketplaceError::parse(Marketplace::Ebay, message));
    }

    let Some(items) = envelope
        .pointer("/searchResult/0/item")
        .and_then(JsonValue::as_array)
    else {
        return Ok(Vec::new());
    };

    Ok(items
        .iter()
        .filter(|item| json_text(item, &["sellingStatus", "currentPrice", "__value__"]).is_some())
        .map(|item| {
            let mut raw = RawListing::new(Marketplace::Ebay);
            raw.title = json_text(item, &["title"]);
            raw.price_text = json_text(item, &["sellingStatus", "currentPrice", "__value__"]);
            raw.href = json_text(item, &["viewItemURL"]);
            raw.image = json_text(item, &["galleryURL"]);
            raw.rating_text = json_text(item, &["sellerInfo", "positiveFeedbackPercent"]);
            raw
        })
        .collect())
}
