use std::collections::BTreeSet;

use pricehub_core::Product;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub similarity_threshold: f64,
    /// Marketing filler ignored when comparing names.
    pub ignored_words: Vec<String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            ignored_words: ["new", "original", "official", "genuine", "wireless", "with", "and", "for", "the"]
                .iter()
                .map(|w| w.to_string())
                .collect(),
        }
    }
}

pub struct Deduplicator {
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    pub fn normalize_key_fragment(input: &str) -> String {
        input
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Word set of a name. Filler words are dropped unless nothing else remains.
    pub fn name_tokens(&self, name: &str) -> BTreeSet<String> {
        let normalized = Self::normalize_key_fragment(name);
        let all: BTreeSet<String> = normalized.split(' ').filter(|w| !w.is_empty()).map(str::to_string).collect();
        let meaningful: BTreeSet<String> = all
            .iter()
            .filter(|w| !self.config.ignored_words.iter().any(|i| i == *w))
            .cloned()
            .collect();
        if meaningful.is_empty() {
            all
        } else {
            meaningful
        }
    }

    pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
        let union = a.union(b).count();
        if union == 0 {
            return 0.0;
        }
        a.intersection(b).count() as f64 / union as f64
    }

    pub fn similarity(&self, a: &str, b: &str) -> f64 {
        Self::jaccard(&self.name_tokens(a), &self.name_tokens(b))
    }

    /// Products are only compared against accepted products of the same marketplace.
    pub fn dedupe(&self, products: Vec<Product>) -> Vec<Product> {
        let mut accepted: Vec<(Product, BTreeSet<String>)> = Vec::with_capacity(products.len());
        for product in products {
            let tokens = self.name_tokens(&product.name);
            let duplicate = accepted.iter().any(|(kept, kept_tokens)| {
                kept.marketplace == product.marketplace
                    && Self::jaccard(kept_tokens, &tokens) > self.config.similarity_threshold
            });
            if !duplicate {
                accepted.push((product, tokens));
            }
        }
        accepted.into_iter().map(|(product, _)| product).collect()
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}
