//! Core domain model for PriceHub: queries, raw listings, products and search results.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "pricehub-core";

/// Marketplaces in their static configuration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Marketplace {
    Daraz,
    PriceOye,
    Telemart,
    Alibaba,
    Ebay,
}

/// How a marketplace reports ratings before normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatingScale {
    FiveStar,
    Percent,
}

impl Marketplace {
    pub const ALL: [Marketplace; 5] = [
        Marketplace::Daraz,
        Marketplace::PriceOye,
        Marketplace::Telemart,
        Marketplace::Alibaba,
        Marketplace::Ebay,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            Marketplace::Daraz => "daraz",
            Marketplace::PriceOye => "priceoye",
            Marketplace::Telemart => "telemart",
            Marketplace::Alibaba => "alibaba",
            Marketplace::Ebay => "ebay",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Marketplace::Daraz => "Daraz",
            Marketplace::PriceOye => "PriceOye",
            Marketplace::Telemart => "Telemart",
            Marketplace::Alibaba => "Alibaba",
            Marketplace::Ebay => "eBay",
        }
    }

    /// Origin used to repair relative product and image links.
    pub fn origin(self) -> &'static str {
        match self {
            Marketplace::Daraz => "https://www.daraz.pk",
            Marketplace::PriceOye => "https://priceoye.pk",
            Marketplace::Telemart => "https://telemart.pk",
            Marketplace::Alibaba => "https://www.alibaba.com",
            Marketplace::Ebay => "https://www.ebay.com",
        }
    }

    pub fn currency(self) -> &'static str {
        match self {
            Marketplace::Daraz | Marketplace::PriceOye | Marketplace::Telemart => "PKR",
            Marketplace::Alibaba | Marketplace::Ebay => "USD",
        }
    }

    pub fn rating_scale(self) -> RatingScale {
        match self {
            Marketplace::Ebay => RatingScale::Percent,
            _ => RatingScale::FiveStar,
        }
    }
}

impl fmt::Display for Marketplace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for Marketplace {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace([' ', '-', '_'], "");
        Marketplace::ALL
            .into_iter()
            .find(|m| m.slug() == wanted)
            .ok_or_else(|| QueryError::UnknownMarketplace(s.trim().to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    #[error("search query must not be empty")]
    Empty,
    #[error("max price must be a non-negative number, got {0}")]
    InvalidMaxPrice(f64),
    #[error("unknown marketplace `{0}`")]
    UnknownMarketplace(String),
}

/// A validated search request. The text is always trimmed and non-empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchQuery {
    text: String,
    marketplaces: Option<Vec<Marketplace>>,
    max_price: Option<f64>,
}

impl SearchQuery {
    pub fn new(raw: &str) -> Result<Self, QueryError> {
        let text = raw.trim();
        if text.is_empty() {
            return Err(QueryError::Empty);
        }
        Ok(Self {
            text: text.to_string(),
            marketplaces: None,
            max_price: None,
        })
    }

    /// Restrict the search to the given marketplaces. An empty list means all.
    pub fn with_marketplaces(mut self, marketplaces: Vec<Marketplace>) -> Self {
        self.marketplaces = if marketplaces.is_empty() {
            None
        } else {
            Some(marketplaces)
        };
        self
    }

    pub fn with_max_price(mut self, max_price: f64) -> Result<Self, QueryError> {
        if !max_price.is_finite() || max_price < 0.0 {
            return Err(QueryError::InvalidMaxPrice(max_price));
        }
        self.max_price = Some(max_price);
        Ok(self)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn marketplaces(&self) -> Option<&[Marketplace]> {
        self.marketplaces.as_deref()
    }

    pub fn max_price(&self) -> Option<f64> {
        self.max_price
    }

    pub fn includes(&self, marketplace: Marketplace) -> bool {
        self.marketplaces
            .as_ref()
            .map_or(true, |allowed| allowed.contains(&marketplace))
    }
}

/// Listing fields exactly as scraped, before any normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub marketplace: Marketplace,
    pub title: Option<String>,
    pub price_text: Option<String>,
    pub href: Option<String>,
    pub image: Option<String>,
    pub rating_text: Option<String>,
    pub brand: Option<String>,
    pub seller: Option<String>,
    pub moq: Option<String>,
}

impl RawListing {
    pub fn new(marketplace: Marketplace) -> Self {
        Self {
            marketplace,
            title: None,
            price_text: None,
            href: None,
            image: None,
            rating_text: None,
            brand: None,
            seller: None,
            moq: None,
        }
    }
}

/// Output of a single adapter attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingBatch {
    pub listings: Vec<RawListing>,
    /// Visible page text; only browser-driven adapters fill this in.
    pub page_text: Option<String>,
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
}

impl ListingBatch {
    pub fn new(source_url: impl Into<String>, listings: Vec<RawListing>) -> Self {
        Self {
            listings,
            page_text: None,
            source_url: source_url.into(),
            fetched_at: Utc::now(),
        }
    }

    pub fn with_page_text(mut self, page_text: impl Into<String>) -> Self {
        self.page_text = Some(page_text.into());
        self
    }
}

/// Canonical product record returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub name: String,
    pub price: Option<f64>,
    pub currency: String,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub marketplace: Marketplace,
    pub rating: Option<f64>,
    pub company: Option<String>,
    pub moq: Option<String>,
    /// Ranking signal; never part of a serialized payload.
    #[serde(skip)]
    pub relevance_score: u32,
}

/// Per-marketplace outcome of one aggregated search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketplaceReport {
    pub marketplace: Marketplace,
    pub succeeded: bool,
    pub count: usize,
    pub unpriced: usize,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

impl MarketplaceReport {
    pub fn succeeded(
        marketplace: Marketplace,
        count: usize,
        unpriced: usize,
        attempts: u32,
        elapsed: Duration,
    ) -> Self {
        Self {
            marketplace,
            succeeded: true,
            count,
            unpriced,
            attempts,
            elapsed_ms: elapsed.as_millis() as u64,
            error: None,
        }
    }

    pub fn failed(error: &MarketplaceError, attempts: u32, elapsed: Duration) -> Self {
        Self {
            marketplace: error.marketplace,
            succeeded: false,
            count: 0,
            unpriced: 0,
            attempts,
            elapsed_ms: elapsed.as_millis() as u64,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub query: String,
    pub products: Vec<Product>,
    pub total: usize,
    pub sources: Vec<MarketplaceReport>,
    pub generated_at: DateTime<Utc>,
}

impl AggregatedResult {
    pub fn new(query: impl Into<String>, products: Vec<Product>, sources: Vec<MarketplaceReport>) -> Self {
        Self {
            query: query.into(),
            total: products.len(),
            products,
            sources,
            generated_at: Utc::now(),
        }
    }

    /// Products per marketplace, groups in the order their first product appears.
    pub fn grouped(&self) -> Vec<(Marketplace, Vec<&Product>)> {
        let mut groups: Vec<(Marketplace, Vec<&Product>)> = Vec::new();
        for product in &self.products {
            match groups.iter_mut().find(|(m, _)| *m == product.marketplace) {
                Some((_, members)) => members.push(product),
                None => groups.push((product.marketplace, vec![product])),
            }
        }
        groups
    }

    /// True when marketplaces were dispatched and none of them succeeded.
    pub fn all_failed(&self) -> bool {
        !self.sources.is_empty() && self.sources.iter().all(|s| !s.succeeded)
    }

    pub fn report_for(&self, marketplace: Marketplace) -> Option<&MarketplaceReport> {
        self.sources.iter().find(|s| s.marketplace == marketplace)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub score: f64,
    pub product_count: usize,
    pub rejected: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    RateLimit,
    Parse,
    Blocked,
    Timeout,
    Validation,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Parse => "parse",
            ErrorKind::Blocked => "blocked",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Validation => "validation",
        }
    }

    /// Bot-wall blocks are terminal; everything else may succeed on another attempt.
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Blocked)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure of one marketplace adapter attempt.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{marketplace} {kind} error: {message}")]
pub struct MarketplaceError {
    pub marketplace: Marketplace,
    pub kind: ErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl MarketplaceError {
    pub fn new(marketplace: Marketplace, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            marketplace,
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn network(marketplace: Marketplace, message: impl Into<String>) -> Self {
        Self::new(marketplace, ErrorKind::Network, message)
    }

    pub fn parse(marketplace: Marketplace, message: impl Into<String>) -> Self {
        Self::new(marketplace, ErrorKind::Parse, message)
    }

    pub fn blocked(marketplace: Marketplace, message: impl Into<String>) -> Self {
        Self::new(marketplace, ErrorKind::Blocked, message)
    }

    pub fn validation(marketplace: Marketplace, message: impl Into<String>) -> Self {
        Self::new(marketplace, ErrorKind::Validation, message)
    }

    pub fn timeout(marketplace: Marketplace, budget: Duration) -> Self {
        Self::new(
            marketplace,
            ErrorKind::Timeout,
            format!("exceeded {}ms budget", budget.as_millis()),
        )
    }

    pub fn rate_limited(marketplace: Marketplace, retry_after: Option<Duration>) -> Self {
        Self {
            marketplace,
            kind: ErrorKind::RateLimit,
            message: "upstream rate limited the request".to_string(),
            retry_after,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(name: &str, marketplace: Marketplace) -> Product {
        Product {
            name: name.to_string(),
            price: Some(100.0),
            currency: marketplace.currency().to_string(),
            url: None,
            image_url: None,
            marketplace,
            rating: None,
            company: None,
            moq: None,
            relevance_score: 7,
        }
    }

    #[test]
    fn query_is_trimmed_and_rejects_blank_input() {
        let query = SearchQuery::new("  iPhone 14  ").expect("query");
        assert_eq!(query.text(), "iPhone 14");
        assert_eq!(SearchQuery::new("   \t"), Err(QueryError::Empty));
        assert!(SearchQuery::new("x")
            .expect("query")
            .with_max_price(-1.0)
            .is_err());
    }

    #[test]
    fn marketplace_allow_list_filters_dispatch() {
        let query = SearchQuery::new("laptop")
            .expect("query")
            .with_marketplaces(vec![Marketplace::Daraz, Marketplace::Ebay]);
        assert!(query.includes(Marketplace::Ebay));
        assert!(!query.includes(Marketplace::Alibaba));

        let unrestricted = SearchQuery::new("laptop").expect("query").with_marketplaces(vec![]);
        assert!(Marketplace::ALL.iter().all(|m| unrestricted.includes(*m)));
    }

    #[test]
    fn marketplace_names_parse_leniently() {
        assert_eq!("PriceOye".parse::<Marketplace>(), Ok(Marketplace::PriceOye));
        assert_eq!(" price-oye ".parse::<Marketplace>(), Ok(Marketplace::PriceOye));
        assert_eq!("eBay".parse::<Marketplace>(), Ok(Marketplace::Ebay));
        assert!(matches!(
            "amazon".parse::<Marketplace>(),
            Err(QueryError::UnknownMarketplace(name)) if name == "amazon"
        ));
    }

    #[test]
    fn relevance_score_is_not_serialized() {
        let json = serde_json::to_value(product("Apple iPhone 14", Marketplace::Daraz)).expect("json");
        assert!(json.get("relevance_score").is_none());
        assert_eq!(json["marketplace"], "daraz");
        assert_eq!(json["currency"], "PKR");
    }

    #[test]
    fn aggregated_result_counts_and_groups() {
        let result = AggregatedResult::new(
            "phone",
            vec![
                product("a", Marketplace::Daraz),
                product("b", Marketplace::Ebay),
                product("c", Marketplace::Daraz),
            ],
            vec![MarketplaceReport::succeeded(
                Marketplace::Daraz,
                2,
                0,
                1,
                Duration::from_millis(5),
            )],
        );
        assert_eq!(result.total, 3);
        let groups = result.grouped();
        assert_eq!(groups[0].0, Marketplace::Daraz);
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].1[0].name, "b");
        assert!(!result.all_failed());
    }

    #[test]
    fn groups_follow_merge_order_not_enum_order() {
        let result = AggregatedResult::new(
            "phone",
            vec![
                product("x", Marketplace::Ebay),
                product("y", Marketplace::Ebay),
                product("z", Marketplace::Daraz),
            ],
            Vec::new(),
        );
        let order: Vec<Marketplace> = result.grouped().into_iter().map(|(m, _)| m).collect();
        assert_eq!(order, vec![Marketplace::Ebay, Marketplace::Daraz]);
    }

    #[test]
    fn all_failed_requires_at_least_one_source() {
        let empty = AggregatedResult::new("q", vec![], vec![]);
        assert!(!empty.all_failed());

        let err = MarketplaceError::blocked(Marketplace::Alibaba, "captcha");
        let failed = AggregatedResult::new(
            "q",
            vec![],
            vec![MarketplaceReport::failed(&err, 1, Duration::ZERO)],
        );
        assert!(failed.all_failed());
        assert_eq!(
            failed.report_for(Marketplace::Alibaba).and_then(|r| r.error.clone()),
            Some("Alibaba blocked error: captcha".to_string())
        );
    }

    #[test]
    fn only_blocked_errors_are_terminal() {
        assert!(!ErrorKind::Blocked.is_retryable());
        for kind in [
            ErrorKind::Network,
            ErrorKind::RateLimit,
            ErrorKind::Parse,
            ErrorKind::Timeout,
            ErrorKind::Validation,
        ] {
            assert!(kind.is_retryable(), "{kind} should be retryable");
        }
    }
}
