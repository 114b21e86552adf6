//! Concurrent marketplace fan-out, ranking and merge.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use pricehub_adapters::normalize::normalize;
use pricehub_adapters::{adapter_for_marketplace, BrowserLauncher, MarketplaceAdapter, WebDriverLauncher};
use pricehub_core::{
    AggregatedResult, ListingBatch, Marketplace, MarketplaceError, MarketplaceReport, Product, RawListing,
    SearchQuery,
};
use pricehub_storage::{BackoffPolicy, HttpFetcher};
use tokio::time::Instant;
use tracing::{info_span, Instrument};

pub mod config;
pub mod dedup;
pub mod observer;
pub mod quality;
pub mod relevance;
pub mod retry;

pub use config::{MarketplaceConfig, RetrySettings, SearchConfig};
pub use dedup::{DedupConfig, Deduplicator};
pub use observer::{NoopObserver, SearchObserver, TracingObserver};
pub use quality::{GateState, QualityConfig, QualityGate};
pub use relevance::{Exclusion, RelevanceConfig, RelevanceScorer, Verdict};

pub const CRATE_NAME: &str = "pricehub-search";

struct Registered {
    adapter: Box<dyn MarketplaceAdapter>,
    retry: BackoffPolicy,
}

#[derive(Debug, Default)]
pub struct Ranked {
    pub products: Vec<Product>,
    pub unpriced: usize,
}

pub struct Aggregator {
    adapters: Vec<Registered>,
    scorer: RelevanceScorer,
    dedup: Deduplicator,
    gate: QualityGate,
    max_results: usize,
    rate_limit_default: Duration,
    observer: Arc<dyn SearchObserver>,
}

impl Aggregator {
    /// Adapters run and merge in the order given. Retry policies come from `config`.
    pub fn new(config: &SearchConfig, adapters: Vec<Box<dyn MarketplaceAdapter>>) -> Self {
        Self {
            adapters: adapters
                .into_iter()
                .map(|adapter| Registered {
                    retry: config.retry_policy(adapter.marketplace()),
                    adapter,
                })
                .collect(),
            scorer: RelevanceScorer::new(config.relevance.clone()),
            dedup: Deduplicator::new(config.dedup.clone()),
            gate: QualityGate::new(config.quality.clone()),
            max_results: config.max_results_per_marketplace,
            rate_limit_default: config.rate_limit_default(),
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let browser: Arc<dyn BrowserLauncher> = Arc::new(WebDriverLauncher {
            webdriver_url: config.adapters.webdriver_url.clone(),
            user_agent: config.adapters.user_agent.clone(),
            headless: config.adapters.headless,
        });
        let adapters = config
            .enabled_marketplaces()
            .filter_map(|entry| {
                adapter_for_marketplace(entry.marketplace, &config.adapters, Arc::clone(&http), Arc::clone(&browser))
            })
            .collect();
        Ok(Self::new(config, adapters))
    }

    pub fn with_observer(mut self, observer: Arc<dyn SearchObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn marketplaces(&self) -> Vec<Marketplace> {
        self.adapters.iter().map(|r| r.adapter.marketplace()).collect()
    }

    /// Never fails: a marketplace that errors contributes a failed report and no products.
    pub async fn search_all(&self, query: &SearchQuery) -> AggregatedResult {
        let selected: Vec<&Registered> = self
            .adapters
            .iter()
            .filter(|r| query.includes(r.adapter.marketplace()))
            .collect();
        let marketplaces: Vec<Marketplace> = selected.iter().map(|r| r.adapter.marketplace()).collect();
        self.observer.search_started(query, &marketplaces);

        let runs = join_all(selected.into_iter().map(|registered| {
            let span = info_span!("marketplace_search", marketplace = registered.adapter.marketplace().slug());
            self.run_marketplace(registered, query).instrument(span)
        }))
        .await;

        let mut products = Vec::new();
        let mut sources = Vec::with_capacity(runs.len());
        for (ranked, report) in runs {
            products.extend(ranked);
            sources.push(report);
        }
        let result = AggregatedResult::new(query.text(), products, sources);
        self.observer.search_finished(&result);
        result
    }

    async fn run_marketplace(&self, registered: &Registered, query: &SearchQuery) -> (Vec<Product>, MarketplaceReport) {
        let started = Instant::now();
        let adapter = registered.adapter.as_ref();
        let outcome = retry::run_with_retry(
            &registered.retry,
            self.rate_limit_default,
            self.observer.as_ref(),
            |attempt| self.attempt(adapter, query, attempt),
        )
        .await;

        let (products, report) = match outcome.result {
            Ok(batch) => {
                let ranked = self.rank(query, &batch.listings);
                let report = MarketplaceReport::succeeded(
                    adapter.marketplace(),
                    ranked.products.len(),
                    ranked.unpriced,
                    outcome.attempts,
                    started.elapsed(),
                );
                (ranked.products, report)
            }
            Err(error) => (Vec::new(), MarketplaceReport::failed(&error, outcome.attempts, started.elapsed())),
        };
        self.observer.marketplace_finished(&report);
        (products, report)
    }

    async fn attempt(
        &self,
        adapter: &dyn MarketplaceAdapter,
        query: &SearchQuery,
        attempt: u32,
    ) -> Result<ListingBatch, MarketplaceError> {
        let batch = adapter.fetch(query).await?;
        if !adapter.quality_gated() {
            return Ok(batch);
        }
        let mut run = self.gate.begin();
        let assessment = run.validate(&batch);
        self.observer.quality_assessed(adapter.marketplace(), attempt, assessment);
        if assessment.rejected {
            return Err(MarketplaceError::validation(
                adapter.marketplace(),
                format!(
                    "quality gate rejected page (score {:.2}, {} listings): {}",
                    assessment.score,
                    assessment.product_count,
                    assessment.reason.as_deref().unwrap_or("below threshold")
                ),
            ));
        }
        Ok(batch)
    }

    pub fn rank(&self, query: &SearchQuery, listings: &[RawListing]) -> Ranked {
        let mut unpriced = 0;
        let mut scored = Vec::new();
        for mut product in listings.iter().filter_map(normalize) {
            let Some(price) = product.price else {
                unpriced += 1;
                continue;
            };
            if query.max_price().is_some_and(|max| price > max) {
                continue;
            }
            match self.scorer.evaluate(&product.name, query.text()) {
                Verdict::Relevant(score) => {
                    product.relevance_score = score;
                    scored.push(product);
                }
                Verdict::Excluded(reason) => self.observer.product_excluded(&product, &reason),
            }
        }

        let mut products = self.dedup.dedupe(scored);
        products.sort_by(|a, b| b.relevance_score.cmp(&a.relevance_score));
        products.truncate(self.max_results);
        Ranked { products, unpriced }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pricehub_adapters::Access;
    use pricehub_core::{ErrorKind, QualityAssessment};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FakeAdapter {
        marketplace: Marketplace,
        gated: bool,
        outcomes: Mutex<Vec<Result<ListingBatch, MarketplaceError>>>,
        delay: Duration,
        calls: Arc<AtomicU32>,
    }

    impl FakeAdapter {
        fn new(marketplace: Marketplace, outcomes: Vec<Result<ListingBatch, MarketplaceError>>) -> Self {
            Self {
                marketplace,
                gated: marketplace == Marketplace::Alibaba,
                outcomes: Mutex::new(outcomes),
                delay: Duration::ZERO,
                calls: Arc::new(AtomicU32::new(0)),
            }
        }

        fn listing(marketplace: Marketplace, title: &str, price: &str) -> RawListing {
            let mut raw = RawListing::new(marketplace);
            raw.title = Some(title.to_string());
            raw.price_text = Some(price.to_string());
            raw.href = Some(format!("https://{}.example/{}", marketplace.slug(), title.len()));
            raw
        }

        fn returning(marketplace: Marketplace, titles: &[(&str, &str)]) -> Self {
            let listings = titles.iter().map(|(t, p)| Self::listing(marketplace, t, p)).collect();
            Self::new(marketplace, vec![Ok(ListingBatch::new(marketplace.origin(), listings))])
        }

        fn failing(error: MarketplaceError) -> Self {
            Self::new(error.marketplace, vec![Err(error)])
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl MarketplaceAdapter for FakeAdapter {
        fn marketplace(&self) -> Marketplace {
            self.marketplace
        }

        fn access(&self) -> Access {
            Access::Api
        }

        fn budget(&self) -> Duration {
            Duration::from_secs(15)
        }

        fn quality_gated(&self) -> bool {
            self.gated
        }

        async fn fetch(&self, _query: &SearchQuery) -> Result<ListingBatch, MarketplaceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut outcomes = self.outcomes.lock().expect("lock");
            if outcomes.len() > 1 {
                outcomes.remove(0)
            } else {
                outcomes[0].clone()
            }
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        assessments: Mutex<Vec<(u32, QualityAssessment)>>,
        retries: Mutex<Vec<(Marketplace, u32)>>,
        excluded: Mutex<Vec<String>>,
    }

    impl SearchObserver for RecordingObserver {
        fn attempt_failed(&self, error: &MarketplaceError, attempt: u32, _retry_in: Duration) {
            self.retries.lock().expect("lock").push((error.marketplace, attempt));
        }

        fn quality_assessed(&self, _marketplace: Marketplace, attempt: u32, assessment: &QualityAssessment) {
            self.assessments.lock().expect("lock").push((attempt, assessment.clone()));
        }

        fn product_excluded(&self, product: &Product, _reason: &Exclusion) {
            self.excluded.lock().expect("lock").push(product.name.clone());
        }
    }

    fn config() -> SearchConfig {
        let mut config = SearchConfig::default();
        for entry in &mut config.marketplaces {
            entry.retry = Some(RetrySettings {
                base_delay_ms: 0,
                max_delay_ms: Some(0),
                ..RetrySettings::default()
            });
        }
        config.rate_limit_default_ms = 0;
        config
    }

    fn aggregator(adapters: Vec<FakeAdapter>) -> Aggregator {
        let boxed = adapters
            .into_iter()
            .map(|a| Box::new(a) as Box<dyn MarketplaceAdapter>)
            .collect();
        Aggregator::new(&config(), boxed).with_observer(Arc::new(NoopObserver))
    }

    fn query(text: &str) -> SearchQuery {
        SearchQuery::new(text).expect("query")
    }

    fn names(result: &AggregatedResult) -> Vec<&str> {
        result.products.iter().map(|p| p.name.as_str()).collect()
    }

    #[tokio::test]
    async fn accessory_listing_is_dropped_for_device_search() {
        let agg = aggregator(vec![FakeAdapter::returning(
            Marketplace::Daraz,
            &[("iPhone 14 Silicone Case", "Rs. 1,499"), ("Apple iPhone 14 128GB", "Rs. 244,999")],
        )]);
        let result = agg.search_all(&query("iPhone 14")).await;
        assert_eq!(names(&result), vec!["Apple iPhone 14 128GB"]);
        assert!(result.products.iter().all(|p| p.relevance_score > 0));
    }

    #[tokio::test]
    async fn model_number_mismatch_is_excluded() {
        let agg = aggregator(vec![FakeAdapter::returning(
            Marketplace::Telemart,
            &[("Samsung Galaxy S22", "169999"), ("Samsung Galaxy S23 Ultra", "289999")],
        )]);
        let result = agg.search_all(&query("Samsung Galaxy S23")).await;
        assert_eq!(names(&result), vec!["Samsung Galaxy S23 Ultra"]);
        for product in &result.products {
            assert!(RelevanceScorer::digit_runs(&product.name).contains(&"23".to_string()));
        }
    }

    #[tokio::test]
    async fn near_duplicates_keep_first_seen() {
        let agg = aggregator(vec![FakeAdapter::returning(
            Marketplace::Ebay,
            &[
                ("Sony WH-1000XM4 Headphones", "$248.00"),
                ("Sony WH-1000XM4 Wireless Headphones", "$239.00"),
            ],
        )]);
        let result = agg.search_all(&query("sony wh-1000xm4")).await;
        assert_eq!(names(&result), vec!["Sony WH-1000XM4 Headphones"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_quality_gate_retries_then_contributes_nothing() {
        let small_page = ListingBatch::new(
            "https://www.alibaba.com/trade/search?SearchText=earbuds",
            vec![
                FakeAdapter::listing(Marketplace::Alibaba, "Wireless Earbuds A", "US$3.50"),
                FakeAdapter::listing(Marketplace::Alibaba, "Wireless Earbuds B", "US$4.10"),
            ],
        )
        .with_page_text("Wireless Earbuds A Wireless Earbuds B");
        let alibaba = FakeAdapter::new(Marketplace::Alibaba, vec![Ok(small_page)]);
        let alibaba_calls = Arc::clone(&alibaba.calls);
        let daraz = FakeAdapter::returning(Marketplace::Daraz, &[("Wireless Earbuds Pro", "Rs. 3,999")]);

        let observer = Arc::new(RecordingObserver::default());
        // Alibaba keeps its 3s-per-attempt page backoff here
        let boxed: Vec<Box<dyn MarketplaceAdapter>> = vec![Box::new(alibaba), Box::new(daraz)];
        let agg = Aggregator::new(&SearchConfig::default(), boxed).with_observer(observer.clone());

        let result = agg.search_all(&query("wireless earbuds")).await;

        assert_eq!(alibaba_calls.load(Ordering::SeqCst), 3);
        let assessments = observer.assessments.lock().expect("lock");
        assert_eq!(assessments.len(), 3);
        assert!(assessments.iter().all(|(_, a)| a.rejected && a.score < 0.7 && a.product_count == 2));
        assert_eq!(
            *observer.retries.lock().expect("lock"),
            vec![(Marketplace::Alibaba, 1), (Marketplace::Alibaba, 2)]
        );

        let report = result.report_for(Marketplace::Alibaba).expect("alibaba report");
        assert!(!report.succeeded);
        assert_eq!(report.attempts, 3);
        assert!(report.error.as_deref().is_some_and(|e| e.contains("validation")));
        assert_eq!(names(&result), vec!["Wireless Earbuds Pro"]);
        assert!(!result.all_failed());
    }

    #[tokio::test(start_paused = true)]
    async fn two_failing_marketplaces_do_not_fail_the_search() {
        let agg = aggregator(vec![
            FakeAdapter::returning(Marketplace::Daraz, &[("Apple iPhone 14 128GB", "Rs. 244,999")])
                .slow(Duration::from_millis(300)),
            FakeAdapter::failing(MarketplaceError::timeout(Marketplace::PriceOye, Duration::from_secs(30))),
            FakeAdapter::returning(
                Marketplace::Telemart,
                &[("Apple iPhone 14 Pro Max 256GB", "389999"), ("Apple iPhone 14 128GB", "229999")],
            ),
            FakeAdapter::failing(MarketplaceError::blocked(Marketplace::Alibaba, "captcha")),
            FakeAdapter::returning(Marketplace::Ebay, &[("Apple iPhone 14 128GB Midnight", "$629.99")]),
        ]);

        let result = agg.search_all(&query("iphone 14")).await;

        assert_eq!(result.total, 4);
        assert_eq!(result.total, result.products.len());
        // configuration order, not completion order
        let order: Vec<_> = result.products.iter().map(|p| p.marketplace).collect();
        assert_eq!(
            order,
            vec![Marketplace::Daraz, Marketplace::Telemart, Marketplace::Telemart, Marketplace::Ebay]
        );
        let failed: Vec<_> = result.sources.iter().filter(|s| !s.succeeded).map(|s| s.marketplace).collect();
        assert_eq!(failed, vec![Marketplace::PriceOye, Marketplace::Alibaba]);
        assert_eq!(result.report_for(Marketplace::Alibaba).map(|r| r.attempts), Some(1));
        assert_eq!(result.report_for(Marketplace::PriceOye).map(|r| r.attempts), Some(3));
        assert!(result.products.iter().all(|p| p.relevance_score > 0));
    }

    #[tokio::test]
    async fn reordered_config_keeps_groups_in_dispatch_order() {
        let agg = aggregator(vec![
            FakeAdapter::returning(Marketplace::Ebay, &[("Apple iPhone 14 128GB", "$629.99")]),
            FakeAdapter::returning(Marketplace::Daraz, &[("Apple iPhone 14 128GB", "Rs. 244,999")]),
        ]);
        let result = agg.search_all(&query("iphone 14")).await;
        let order: Vec<_> = result.grouped().into_iter().map(|(m, _)| m).collect();
        assert_eq!(order, vec![Marketplace::Ebay, Marketplace::Daraz]);
    }

    #[tokio::test]
    async fn every_marketplace_failing_is_reported() {
        let agg = aggregator(vec![
            FakeAdapter::failing(MarketplaceError::network(Marketplace::Daraz, "dns")),
            FakeAdapter::failing(MarketplaceError::parse(Marketplace::Telemart, "missing results")),
        ]);
        let result = agg.search_all(&query("iphone 14")).await;
        assert!(result.all_failed());
        assert_eq!(result.total, 0);
        let kinds: Vec<_> = result.sources.iter().map(|s| s.error.clone().unwrap_or_default()).collect();
        assert!(kinds[0].contains(ErrorKind::Network.as_str()));
    }

    #[tokio::test]
    async fn allow_list_limits_dispatch() {
        let daraz = FakeAdapter::returning(Marketplace::Daraz, &[("Apple iPhone 14", "Rs. 1")]);
        let ebay = FakeAdapter::returning(Marketplace::Ebay, &[("Apple iPhone 14", "$1")]);
        let ebay_calls = Arc::clone(&ebay.calls);
        let agg = aggregator(vec![daraz, ebay]);

        let result = agg
            .search_all(&query("iphone 14").with_marketplaces(vec![Marketplace::Daraz]))
            .await;
        assert_eq!(result.sources.len(), 1);
        assert_eq!(result.sources[0].marketplace, Marketplace::Daraz);
        assert_eq!(ebay_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_attempt_is_retried() {
        let listing = FakeAdapter::listing(Marketplace::Ebay, "Apple iPhone 14 128GB", "$629.99");
        let ebay = FakeAdapter::new(
            Marketplace::Ebay,
            vec![
                Err(MarketplaceError::rate_limited(Marketplace::Ebay, Some(Duration::from_secs(1)))),
                Ok(ListingBatch::new("https://svcs.ebay.com", vec![listing])),
            ],
        );
        let result = aggregator(vec![ebay]).search_all(&query("iphone 14")).await;
        assert_eq!(result.total, 1);
        assert_eq!(result.sources[0].attempts, 2);
    }

    #[test]
    fn rank_counts_unpriced_and_applies_price_ceiling() {
        let agg = aggregator(vec![]);
        let mut nameless = RawListing::new(Marketplace::Daraz);
        nameless.price_text = Some("Rs. 10".into());
        let listings = vec![
            FakeAdapter::listing(Marketplace::Daraz, "Apple iPhone 14 128GB", "Rs. 244,999"),
            FakeAdapter::listing(Marketplace::Daraz, "Apple iPhone 14 Plus", "Rs. 269,999"),
            FakeAdapter::listing(Marketplace::Daraz, "Apple iPhone 14 Pro", "Call for price"),
            nameless,
        ];

        let ranked = agg.rank(&query("iphone 14").with_max_price(250_000.0).expect("price"), &listings);
        assert_eq!(ranked.unpriced, 1);
        let names: Vec<_> = ranked.products.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Apple iPhone 14 128GB"]);
    }

    #[test]
    fn rank_sorts_by_score_stably_and_caps() {
        let mut config = config();
        config.max_results_per_marketplace = 3;
        let agg = Aggregator::new(&config, Vec::new()).with_observer(Arc::new(NoopObserver));
        let listings: Vec<_> = [
            "Galaxy Buds Pouch Holder",
            "Samsung GalaxyS23 Plus",
            "Samsung Galaxy A54",
            "Samsung Galaxy S23 Ultra",
            "Samsung Galaxy S23",
            "Samsung Galaxy S23 FE",
        ]
        .iter()
        .map(|name| FakeAdapter::listing(Marketplace::Daraz, name, "Rs. 100,000"))
        .collect();

        let ranked = agg.rank(&query("samsung galaxy s23"), &listings);
        let names: Vec<_> = ranked.products.iter().map(|p| p.name.as_str()).collect();
        // the run-together name scores lower; equal scores keep scraped order
        assert_eq!(
            names,
            vec!["Samsung Galaxy S23 Ultra", "Samsung Galaxy S23", "Samsung Galaxy S23 FE"]
        );
    }

    #[tokio::test]
    async fn exclusions_reach_the_observer() {
        let observer = Arc::new(RecordingObserver::default());
        let agg = Aggregator::new(
            &config(),
            vec![Box::new(FakeAdapter::returning(
                Marketplace::PriceOye,
                &[("iPhone 14 Screen Protector", "Rs 999"), ("Apple iPhone 14", "Rs 244,999")],
            )) as Box<dyn MarketplaceAdapter>],
        )
        .with_observer(observer.clone());
        agg.search_all(&query("iphone 14")).await;
        assert_eq!(*observer.excluded.lock().expect("lock"), vec!["iPhone 14 Screen Protector"]);
    }
}
