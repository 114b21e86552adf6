//! Search configuration: YAML file, then environment overrides.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use pricehub_adapters::AdapterSettings;
use pricehub_core::Marketplace;
use pricehub_storage::{BackoffCurve, BackoffPolicy, HttpClientConfig};
use serde::{Deserialize, Serialize};

use crate::dedup::DedupConfig;
use crate::quality::QualityConfig;
use crate::relevance::RelevanceConfig;

pub const DEFAULT_CONFIG_FILE: &str = "pricehub.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub adapters: AdapterSettings,
    pub http: HttpSettings,
    /// Dispatch and presentation order.
    pub marketplaces: Vec<MarketplaceConfig>,
    pub relevance: RelevanceConfig,
    pub dedup: DedupConfig,
    pub quality: QualityConfig,
    pub max_results_per_marketplace: usize,
    pub rate_limit_default_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            adapters: AdapterSettings::default(),
            http: HttpSettings::default(),
            marketplaces: Marketplace::ALL.into_iter().map(MarketplaceConfig::enabled).collect(),
            relevance: RelevanceConfig::default(),
            dedup: DedupConfig::default(),
            quality: QualityConfig::default(),
            max_results_per_marketplace: 10,
            rate_limit_default_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub global_concurrency: usize,
    pub per_marketplace_concurrency: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            global_concurrency: 16,
            per_marketplace_concurrency: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketplaceConfig {
    pub marketplace: Marketplace,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySettings>,
}

fn enabled_by_default() -> bool {
    true
}

impl MarketplaceConfig {
    pub fn enabled(marketplace: Marketplace) -> Self {
        Self {
            marketplace,
            enabled: true,
            retry: None,
        }
    }

    pub fn retry_settings(&self) -> RetrySettings {
        self.retry
            .clone()
            .unwrap_or_else(|| RetrySettings::for_marketplace(self.marketplace))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: Option<u64>,
    pub curve: BackoffCurve,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 1_000,
            max_delay_ms: Some(3_000),
            curve: BackoffCurve::Linear,
        }
    }
}

impl RetrySettings {
    /// Alibaba retries whole page loads, so it backs off 3s per attempt without a cap.
    pub fn for_marketplace(marketplace: Marketplace) -> Self {
        match marketplace {
            Marketplace::Alibaba => Self {
                base_delay_ms: 3_000,
                max_delay_ms: None,
                ..Self::default()
            },
            _ => Self::default(),
        }
    }

    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: self.max_delay_ms.map(Duration::from_millis),
            curve: self.curve,
        }
    }
}

impl SearchConfig {
    /// `PRICEHUB_CONFIG`, else `./pricehub.yaml` when present, else defaults; then env overrides.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var("PRICEHUB_CONFIG").map(PathBuf::from).ok().or_else(|| {
            let local = PathBuf::from(DEFAULT_CONFIG_FILE);
            local.exists().then_some(local)
        });
        let mut config = match path {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text).context("deserializing search config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("serializing search config")
    }

    /// Applies `EBAY_APP_ID`, `PRICEHUB_USER_AGENT` and `PRICEHUB_WEBDRIVER_URL`; blank values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        if let Some(app_id) = get("EBAY_APP_ID") {
            self.adapters.ebay_app_id = Some(app_id);
        }
        if let Some(user_agent) = get("PRICEHUB_USER_AGENT") {
            self.adapters.user_agent = user_agent;
        }
        if let Some(url) = get("PRICEHUB_WEBDRIVER_URL") {
            self.adapters.webdriver_url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for entry in &self.marketplaces {
            if !seen.insert(entry.marketplace) {
                bail!("marketplace {} is configured more than once", entry.marketplace.slug());
            }
        }
        let unit_ranges = [
            ("dedup.similarity_threshold", self.dedup.similarity_threshold),
            ("quality.threshold", self.quality.threshold),
            ("quality.bot_penalty", self.quality.bot_penalty),
            ("relevance.min_coverage_general", self.relevance.min_coverage_general),
            ("relevance.min_coverage_general_long", self.relevance.min_coverage_general_long),
            ("relevance.min_coverage_numeric", self.relevance.min_coverage_numeric),
            ("relevance.min_coverage_numeric_long", self.relevance.min_coverage_numeric_long),
        ];
        for (name, value) in unit_ranges {
            if !(0.0..=1.0).contains(&value) {
                bail!("{name} must be between 0 and 1, got {value}");
            }
        }
        if self.max_results_per_marketplace == 0 {
            bail!("max_results_per_marketplace must be at least 1");
        }
        Ok(())
    }

    pub fn enabled_marketplaces(&self) -> impl Iterator<Item = &MarketplaceConfig> {
        self.marketplaces.iter().filter(|m| m.enabled)
    }

    pub fn retry_policy(&self, marketplace: Marketplace) -> BackoffPolicy {
        self.marketplaces
            .iter()
            .find(|m| m.marketplace == marketplace)
            .map(MarketplaceConfig::retry_settings)
            .unwrap_or_else(|| RetrySettings::for_marketplace(marketplace))
            .policy()
    }

    pub fn rate_limit_default(&self) -> Duration {
        Duration::from_millis(self.rate_limit_default_ms)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http.timeout_secs),
            user_agent: Some(self.adapters.user_agent.clone()),
            global_concurrency: self.http.global_concurrency,
            per_marketplace_concurrency: self.http.per_marketplace_concurrency,
        }
    }
}
