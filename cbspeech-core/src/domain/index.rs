use super::speech::Institution;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One day of the sentiment index for one institution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyIndexRow {
    pub date: NaiveDate,
    pub institution: Institution,
    pub hawkish_dovish_score: f64,
    pub uncertainty: f64,
    pub forward_guidance_strength: f64,
    pub topic_inflation: f64,
    pub topic_growth: f64,
    pub topic_employment: f64,
    pub topic_financial_stability: f64,
    pub topic_international: f64,
    pub stocks_diffusion_index: f64,
    pub bonds_diffusion_index: f64,
    pub currency_diffusion_index: f64,
    /// Speeches behind this row; 0 on forward-filled days.
    pub speech_count: usize,
}

impl DailyIndexRow {
    /// Column names in export order.
    pub const COLUMNS: [&'static str; 14] = [
        "date",
        "institution",
        "hawkish_dovish_score",
        "uncertainty",
        "forward_guidance_strength",
        "topic_inflation",
        "topic_growth",
        "topic_employment",
        "topic_financial_stability",
        "topic_international",
        "stocks_diffusion_index",
        "bonds_diffusion_index",
        "currency_diffusion_index",
        "speech_count",
    ];

    /// The eleven metric columns (everything except date, institution, count).
    pub fn metrics(&self) -> [f64; 11] {
        [
            self.hawkish_dovish_score,
            self.uncertainty,
            self.forward_guidance_strength,
            self.topic_inflation,
            self.topic_growth,
            self.topic_employment,
            self.topic_financial_stability,
            self.topic_international,
            self.stocks_diffusion_index,
            self.bonds_diffusion_index,
            self.currency_diffusion_index,
        ]
    }

    /// Copy of this row moved to `date` with no contributing speeches.
    pub fn carried_to(&self, date: NaiveDate) -> Self {
        Self {
            date,
            speech_count: 0,
            ..self.clone()
        }
    }
}

/// The four output tables: forward-filled and sparse series per institution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexTables {
    pub forward_filled: BTreeMap<Institution, Vec<DailyIndexRow>>,
    pub sparse: BTreeMap<Institution, Vec<DailyIndexRow>>,
}

impl IndexTables {
    pub fn is_empty(&self) -> bool {
        self.sparse.values().all(|rows| rows.is_empty())
    }
}
