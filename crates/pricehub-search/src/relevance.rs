//! Query relevance scoring shared by every marketplace.

use std::fmt;

use pricehub_core::Product;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelevanceConfig {
    pub accessory_exclusion: bool,
    pub device_keywords: Vec<String>,
    pub accessory_keywords: Vec<String>,
    pub model_number_bonus: u32,
    /// Accept names carrying only the leading half of the query's digit runs.
    pub allow_partial_model_match: bool,
    pub partial_model_bonus: u32,
    pub word_boundary_points: u32,
    pub substring_points: u32,
    pub min_coverage_general: f64,
    pub min_coverage_general_long: f64,
    pub min_coverage_numeric: f64,
    pub min_coverage_numeric_long: f64,
    /// Queries with more words than this use the `_long` coverage thresholds.
    pub long_query_words: usize,
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self {
            accessory_exclusion: true,
            device_keywords: words(&[
                "iphone", "samsung", "galaxy", "pixel", "oneplus", "xiaomi", "oppo", "vivo", "realme",
                "huawei", "nokia", "motorola", "laptop", "macbook", "tablet", "ipad", "watch",
                "airpods", "buds",
            ]),
            accessory_keywords: words(&[
                "protector", "case", "cover", "charger", "cable", "adapter", "screen guard",
                "tempered glass", "holder", "stand", "mount", "earphone", "headphone", "earbuds",
                "airpods", "pouch", "bag", "stylus", "pen", "cleaner", "kit", "tool", "sticker",
                "skin", "strap", "band", "ring", "grip", "wallet", "card holder", "lens protector",
                "camera protector", "back cover", "flip cover", "bumper", "shell", "sleeve",
                "jacket", "armor", "shield",
            ]),
            model_number_bonus: 5,
            allow_partial_model_match: false,
            partial_model_bonus: 1,
            word_boundary_points: 2,
            substring_points: 1,
            min_coverage_general: 0.5,
            min_coverage_general_long: 0.6,
            min_coverage_numeric: 0.6,
            min_coverage_numeric_long: 0.75,
            long_query_words: 3,
        }
    }
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|w| w.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Exclusion {
    Accessory { keyword: String },
    ModelNumberMismatch { missing: Vec<String> },
    LowCoverage { matched: usize, total: usize },
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exclusion::Accessory { keyword } => write!(f, "accessory keyword '{keyword}'"),
            Exclusion::ModelNumberMismatch { missing } => {
                write!(f, "missing model number(s) {}", missing.join(", "))
            }
            Exclusion::LowCoverage { matched, total } => {
                write!(f, "matched {matched} of {total} query words")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Relevant(u32),
    Excluded(Exclusion),
}

impl Verdict {
    pub fn score(&self) -> u32 {
        match self {
            Verdict::Relevant(score) => *score,
            Verdict::Excluded(_) => 0,
        }
    }
}

pub struct RelevanceScorer {
    config: RelevanceConfig,
}

impl RelevanceScorer {
    pub fn new(config: RelevanceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RelevanceConfig {
        &self.config
    }

    pub fn tokenize(text: &str) -> Vec<String> {
        normalized(text)
            .split(' ')
            .filter(|w| w.chars().count() > 1)
            .map(str::to_string)
            .collect()
    }

    pub fn digit_runs(text: &str) -> Vec<String> {
        text.split(|c: char| !c.is_ascii_digit())
            .filter(|run| !run.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn score(&self, product: &Product, query: &str) -> u32 {
        self.evaluate(&product.name, query).score()
    }

    pub fn evaluate(&self, name: &str, query: &str) -> Verdict {
        let query_words = Self::tokenize(query);
        let query_norm = normalized(query);
        let name_norm = normalized(name);
        let name_padded = format!(" {name_norm} ");

        if self.config.accessory_exclusion {
            if let Some(keyword) = self.accessory_match(&query_words, &query_norm, &name_padded) {
                return Verdict::Excluded(Exclusion::Accessory { keyword });
            }
        }

        let mut score = 0u32;
        let query_digits = Self::digit_runs(query);
        if !query_digits.is_empty() {
            let name_digits = Self::digit_runs(name);
            let missing: Vec<String> = query_digits
                .iter()
                .filter(|run| !name_digits.contains(run))
                .cloned()
                .collect();
            if missing.is_empty() {
                score += self.config.model_number_bonus;
            } else if self.leading_half_matches(&query_digits, &name_digits) {
                score += self.config.partial_model_bonus;
            } else {
                return Verdict::Excluded(Exclusion::ModelNumberMismatch { missing });
            }
        }

        let name_words: Vec<&str> = name_norm.split(' ').collect();
        let mut matched = 0usize;
        for word in &query_words {
            let singular = word.strip_suffix('s').filter(|s| s.len() > 1);
            let at_boundary = name_words
                .iter()
                .any(|w| *w == word.as_str() || Some(*w) == singular);
            if at_boundary {
                matched += 1;
                score += self.config.word_boundary_points;
            } else if name_norm.contains(word.as_str()) || singular.is_some_and(|s| name_norm.contains(s)) {
                matched += 1;
                score += self.config.substring_points;
            }
        }

        let total = query_words.len();
        if total > 0 {
            let coverage = matched as f64 / total as f64;
            if coverage < self.min_coverage(total, !query_digits.is_empty()) {
                return Verdict::Excluded(Exclusion::LowCoverage { matched, total });
            }
        }

        Verdict::Relevant(score.max(1))
    }

    fn accessory_match(&self, query_words: &[String], query_norm: &str, name_padded: &str) -> Option<String> {
        let device_search = query_words
            .iter()
            .any(|w| self.config.device_keywords.iter().any(|d| d.eq_ignore_ascii_case(w)));
        if !device_search {
            return None;
        }
        self.config
            .accessory_keywords
            .iter()
            .map(|kw| normalized(kw))
            .filter(|kw| !kw.is_empty() && !query_norm.contains(kw.as_str()))
            .find(|kw| name_padded.contains(&format!(" {kw} ")))
    }

    fn leading_half_matches(&self, query_digits: &[String], name_digits: &[String]) -> bool {
        if !self.config.allow_partial_model_match || query_digits.len() < 2 {
            return false;
        }
        let leading = query_digits.len().div_ceil(2);
        query_digits[..leading].iter().all(|run| name_digits.contains(run))
    }

    fn min_coverage(&self, words: usize, numeric: bool) -> f64 {
        let long = words > self.config.long_query_words;
        match (numeric, long) {
            (true, true) => self.config.min_coverage_numeric_long,
            (true, false) => self.config.min_coverage_numeric,
            (false, true) => self.config.min_coverage_general_long,
            (false, false) => self.config.min_coverage_general,
        }
    }
}

impl Default for RelevanceScorer {
    fn default() -> Self {
        Self::new(RelevanceConfig::default())
    }
}

fn normalized(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
