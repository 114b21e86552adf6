use pricehub_core::{ListingBatch, QualityAssessment, RawListing};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub min_listings: usize,
    /// Batches at least this large earn the count bonus.
    pub bonus_listings: usize,
    pub validity_weight: f64,
    pub bonus_weight: f64,
    pub threshold: f64,
    pub bot_keywords: Vec<String>,
    pub bot_penalty: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_listings: 3,
            bonus_listings: 5,
            validity_weight: 0.8,
            bonus_weight: 0.2,
            threshold: 0.7,
            bot_keywords: ["captcha", "robot", "blocked", "access denied"]
                .iter()
                .map(|k| k.to_string())
                .collect(),
            bot_penalty: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Fetching,
    Extracted,
    Validating,
    Accepted,
    Rejected,
}

impl GateState {
    pub fn is_terminal(self) -> bool {
        matches!(self, GateState::Accepted | GateState::Rejected)
    }
}

#[derive(Debug)]
pub struct GateRun<'a> {
    gate: &'a QualityGate,
    state: GateState,
    assessment: Option<QualityAssessment>,
}

impl<'a> GateRun<'a> {
    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn assessment(&self) -> Option<&QualityAssessment> {
        self.assessment.as_ref()
    }

    pub fn extracted(&mut self) {
        if self.state == GateState::Fetching {
            self.state = GateState::Extracted;
        }
    }

    pub fn validate(&mut self, batch: &ListingBatch) -> &QualityAssessment {
        self.extracted();
        self.state = GateState::Validating;
        let assessment = self.gate.assess(&batch.listings, batch.page_text.as_deref());
        self.state = if assessment.rejected {
            GateState::Rejected
        } else {
            GateState::Accepted
        };
        self.assessment.insert(assessment)
    }
}

#[derive(Debug, Clone, Default)]
pub struct QualityGate {
    config: QualityConfig,
}

impl QualityGate {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn begin(&self) -> GateRun<'_> {
        GateRun {
            gate: self,
            state: GateState::Fetching,
            assessment: None,
        }
    }

    /// Structural validity: a name, a price with a digit, and an absolute link.
    pub fn is_valid_listing(listing: &RawListing) -> bool {
        let named = listing.title.as_deref().is_some_and(|t| !t.trim().is_empty());
        let priced = listing
            .price_text
            .as_deref()
            .is_some_and(|p| p.chars().any(|c| c.is_ascii_digit()));
        let linked = listing.href.as_deref().map(str::trim).is_some_and(|href| {
            href.starts_with("https://") || href.starts_with("http://") || href.starts_with("//")
        });
        named && priced && linked
    }

    pub fn bot_keyword(&self, page_text: &str) -> Option<&str> {
        let lower = page_text.to_lowercase();
        self.config
            .bot_keywords
            .iter()
            .find(|k| lower.contains(&k.to_lowercase()))
            .map(String::as_str)
    }

    pub fn assess(&self, listings: &[RawListing], page_text: Option<&str>) -> QualityAssessment {
        let count = listings.len();
        let (mut score, mut reason) = if count < self.config.min_listings {
            (
                0.0,
                Some(format!("only {count} listings, need {}", self.config.min_listings)),
            )
        } else {
            let valid = listings.iter().filter(|l| Self::is_valid_listing(l)).count();
            let valid_fraction = valid as f64 / count as f64;
            let bonus = if count >= self.config.bonus_listings { 1.0 } else { 0.0 };
            let score = self.config.validity_weight * valid_fraction + self.config.bonus_weight * bonus;
            (score, Some(format!("{valid} of {count} listings structurally valid")))
        };

        if let Some(keyword) = page_text.and_then(|text| self.bot_keyword(text)) {
            score *= self.config.bot_penalty;
            reason = Some(format!("page mentions '{keyword}'"));
        }

        let rejected = score < self.config.threshold;
        QualityAssessment {
            score,
            product_count: count,
            rejected,
            reason: if rejected { reason } else { None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricehub_core::Marketplace;

    fn listing(n: usize) -> RawListing {
        let mut raw = RawListing::new(Marketplace::Alibaba);
        raw.title = Some(format!("Wireless Earbuds Model {n}"));
        raw.price_text = Some(format!("US${n}.50"));
        raw.href = Some(format!("//www.alibaba.com/product-detail/earbuds_{n}.html"));
        raw
    }

    fn batch(n: usize) -> Vec<RawListing> {
        (1..=n).map(listing).collect()
    }

    #[test]
    fn too_few_listings_score_zero() {
        let assessment = QualityGate::default().assess(&batch(2), None);
        assert_eq!(assessment.score, 0.0);
        assert!(assessment.rejected);
        assert_eq!(assessment.product_count, 2);
        assert_eq!(assessment.reason.as_deref(), Some("only 2 listings, need 3"));
    }

    #[test]
    fn full_valid_batch_with_bonus_is_accepted() {
        let assessment = QualityGate::default().assess(&batch(5), Some("Wireless Earbuds supplier results"));
        assert!((assessment.score - 1.0).abs() < 1e-9);
        assert!(!assessment.rejected);
        assert_eq!(assessment.reason, None);
    }

    #[test]
    fn small_valid_batch_without_bonus_still_passes() {
        // 0.8 * 1.0 + 0.2 * 0
        let assessment = QualityGate::default().assess(&batch(4), None);
        assert!((assessment.score - 0.8).abs() < 1e-9);
        assert!(!assessment.rejected);
    }

    #[test]
    fn invalid_listings_pull_the_score_down() {
        let mut listings = batch(5);
        listings[0].price_text = Some("Negotiable".into());
        listings[1].href = Some("/product-detail/relative.html".into());
        listings[2].title = Some("  ".into());
        let assessment = QualityGate::default().assess(&listings, None);
        // 0.8 * 2/5 + 0.2
        assert!((assessment.score - 0.52).abs() < 1e-9);
        assert!(assessment.rejected);
    }

    #[test]
    fn bot_text_multiplies_the_score_down() {
        let assessment = QualityGate::default().assess(&batch(6), Some("Sorry, we have detected unusual traffic. Please complete the CAPTCHA"));
        assert!((assessment.score - 0.3).abs() < 1e-9);
        assert!(assessment.rejected);
        assert_eq!(assessment.reason.as_deref(), Some("page mentions 'captcha'"));
    }

    #[test]
    fn gate_run_moves_through_states() {
        let gate = QualityGate::default();
        let mut run = gate.begin();
        assert_eq!(run.state(), GateState::Fetching);
        run.extracted();
        assert_eq!(run.state(), GateState::Extracted);

        let rejected = run.validate(&ListingBatch::new("https://www.alibaba.com", batch(2))).rejected;
        assert!(rejected);
        assert_eq!(run.state(), GateState::Rejected);
        assert!(run.state().is_terminal());

        let mut run = gate.begin();
        run.validate(&ListingBatch::new("https://www.alibaba.com", batch(5)));
        assert_eq!(run.state(), GateState::Accepted);
        assert!(run.assessment().is_some_and(|a| !a.rejected));
    }
}
