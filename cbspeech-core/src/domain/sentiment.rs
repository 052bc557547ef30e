use serde::{Deserialize, Serialize};
use std::fmt;

/// The five topic-emphasis fields every model output must carry, each in [0, 100].
pub const TOPIC_FIELDS: [&str; 5] = [
    "topic_inflation",
    "topic_growth",
    "topic_employment",
    "topic_financial_stability",
    "topic_international",
];

/// Predicted direction of a market after the speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketImpact {
    Rise,
    Fall,
    Neutral,
}

impl MarketImpact {
    /// Exact, case-sensitive match against the model vocabulary.
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "rise" => Some(MarketImpact::Rise),
            "fall" => Some(MarketImpact::Fall),
            "neutral" => Some(MarketImpact::Neutral),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketImpact::Rise => "rise",
            MarketImpact::Fall => "fall",
            MarketImpact::Neutral => "neutral",
        }
    }
}

impl fmt::Display for MarketImpact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Market whose reaction the model predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarketDimension {
    Stocks,
    Bonds,
    Currency,
}

impl MarketDimension {
    pub const ALL: [MarketDimension; 3] = [
        MarketDimension::Stocks,
        MarketDimension::Bonds,
        MarketDimension::Currency,
    ];

    /// Name of the model output field carrying this dimension.
    pub fn field(&self) -> &'static str {
        match self {
            MarketDimension::Stocks => "market_impact_stocks",
            MarketDimension::Bonds => "market_impact_bonds",
            MarketDimension::Currency => "market_impact_currency",
        }
    }
}

/// Validated structured output for one speech.
///
/// Only built by the validator, so every field is known to be in range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentRecord {
    pub speech_id: String,
    /// -100 (very dovish) .. 100 (very hawkish).
    pub hawkish_dovish_score: f64,
    pub uncertainty: f64,
    pub forward_guidance_strength: f64,
    pub topic_inflation: f64,
    pub topic_growth: f64,
    pub topic_employment: f64,
    pub topic_financial_stability: f64,
    pub topic_international: f64,
    pub market_impact_stocks: MarketImpact,
    pub market_impact_bonds: MarketImpact,
    pub market_impact_currency: MarketImpact,
}

impl SentimentRecord {
    /// Number of continuous metrics aggregated by mean.
    pub const CONTINUOUS_COUNT: usize = 8;

    /// Continuous metrics in column order: score, uncertainty, guidance, five topics.
    pub fn continuous(&self) -> [f64; Self::CONTINUOUS_COUNT] {
        [
            self.hawkish_dovish_score,
            self.uncertainty,
            self.forward_guidance_strength,
            self.topic_inflation,
            self.topic_growth,
            self.topic_employment,
            self.topic_financial_stability,
            self.topic_international,
        ]
    }

    pub fn impact(&self, dimension: MarketDimension) -> MarketImpact {
        match dimension {
            MarketDimension::Stocks => self.market_impact_stocks,
            MarketDimension::Bonds => self.market_impact_bonds,
            MarketDimension::Currency => self.market_impact_currency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn impact_labels_are_case_sensitive() {
        assert_eq!(MarketImpact::from_label("rise"), Some(MarketImpact::Rise));
        assert_eq!(MarketImpact::from_label("Rise"), None);
        assert_eq!(MarketImpact::from_label("up"), None);
    }

    #[test]
    fn impact_serde_matches_labels() {
        let json = serde_json::to_string(&MarketImpact::Neutral).unwrap();
        assert_eq!(json, "\"neutral\"");
    }
}
