use std::time::Duration;

use pricehub_core::{AggregatedResult, Marketplace, MarketplaceError, MarketplaceReport, Product, QualityAssessment, SearchQuery};
use tracing::{debug, info, warn};

use crate::relevance::Exclusion;

/// Receives pipeline events. Every method defaults to doing nothing.
pub trait SearchObserver: Send + Sync {
    fn search_started(&self, _query: &SearchQuery, _marketplaces: &[Marketplace]) {}

    /// A failed attempt that will be retried after `retry_in`.
    fn attempt_failed(&self, _error: &MarketplaceError, _attempt: u32, _retry_in: Duration) {}

    fn quality_assessed(&self, _marketplace: Marketplace, _attempt: u32, _assessment: &QualityAssessment) {}

    fn product_excluded(&self, _product: &Product, _reason: &Exclusion) {}

    fn marketplace_finished(&self, _report: &MarketplaceReport) {}

    fn search_finished(&self, _result: &AggregatedResult) {}
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl SearchObserver for NoopObserver {}

#[derive(Debug, Default)]
pub struct TracingObserver;

impl SearchObserver for TracingObserver {
    fn search_started(&self, query: &SearchQuery, marketplaces: &[Marketplace]) {
        let names: Vec<&str> = marketplaces.iter().map(|m| m.slug()).collect();
        info!(query = query.text(), marketplaces = ?names, "search started");
    }

    fn attempt_failed(&self, error: &MarketplaceError, attempt: u32, retry_in: Duration) {
        warn!(
            marketplace = error.marketplace.slug(),
            kind = error.kind.as_str(),
            attempt,
            retry_in_ms = retry_in.as_millis() as u64,
            "{}",
            error.message
        );
    }

    fn quality_assessed(&self, marketplace: Marketplace, attempt: u32, assessment: &QualityAssessment) {
        if assessment.rejected {
            warn!(
                marketplace = marketplace.slug(),
                attempt,
                score = assessment.score,
                listings = assessment.product_count,
                reason = assessment.reason.as_deref().unwrap_or_default(),
                "quality gate rejected page"
            );
        } else {
            debug!(
                marketplace = marketplace.slug(),
                attempt,
                score = assessment.score,
                listings = assessment.product_count,
                "quality gate accepted page"
            );
        }
    }

    fn product_excluded(&self, product: &Product, reason: &Exclusion) {
        debug!(marketplace = product.marketplace.slug(), name = %product.name, %reason, "excluded");
    }

    fn marketplace_finished(&self, report: &MarketplaceReport) {
        match &report.error {
            None => info!(
                marketplace = report.marketplace.slug(),
                products = report.count,
                unpriced = report.unpriced,
                attempts = report.attempts,
                elapsed_ms = report.elapsed_ms,
                "marketplace finished"
            ),
            Some(error) => warn!(
                marketplace = report.marketplace.slug(),
                attempts = report.attempts,
                elapsed_ms = report.elapsed_ms,
                error = %error,
                "marketplace failed"
            ),
        }
    }

    fn search_finished(&self, result: &AggregatedResult) {
        let failed = result.sources.iter().filter(|s| !s.succeeded).count();
        info!(query = %result.query, total = result.total, failed, "search finished");
    }
}
