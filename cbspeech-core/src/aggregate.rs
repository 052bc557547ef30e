//! Daily index construction.
//!
//! Validated records are joined with their speech date and institution,
//! grouped by `(institution, date)` and reduced to one row per group:
//! - continuous metrics: arithmetic mean across same-day speeches
//! - market impacts: diffusion index `100 * (frac_rise + 0.5 * frac_neutral)`
//!
//! Two views per institution come out of this:
//! - sparse: one row per day with at least one speech
//! - forward-filled: one row per calendar day between the first and last
//!   observation; gap days repeat the previous row with `speech_count = 0`
//!
//! Institutions never mix.

use crate::domain::{
    DailyIndexRow, IndexTables, Institution, MarketDimension, MarketImpact, SentimentRecord,
    SpeechRecord,
};
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};

/// A validated record with the speech fields aggregation needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredSpeech {
    pub date: NaiveDate,
    pub institution: Institution,
    pub record: SentimentRecord,
}

/// Result of joining records against the corpus.
#[derive(Debug, Clone, Default)]
pub struct JoinOutcome {
    pub joined: Vec<ScoredSpeech>,
    /// Speech ids of records with no matching speech.
    pub unmatched: Vec<String>,
}

/// Attach date and institution to each record by speech id.
pub fn join_records(speeches: &[SpeechRecord], records: Vec<SentimentRecord>) -> JoinOutcome {
    let by_id: HashMap<&str, &SpeechRecord> =
        speeches.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut outcome = JoinOutcome::default();
    for record in records {
        match by_id.get(record.speech_id.as_str()) {
            Some(speech) => outcome.joined.push(ScoredSpeech {
                date: speech.date,
                institution: speech.institution,
                record,
            }),
            None => outcome.unmatched.push(record.speech_id),
        }
    }
    if !outcome.unmatched.is_empty() {
        tracing::warn!(
            count = outcome.unmatched.len(),
            "records without a matching speech were dropped"
        );
    }
    outcome
}

/// Diffusion index over a set of categorical predictions, in [0, 100].
///
/// `None` for an empty set.
pub fn diffusion_index<I>(impacts: I) -> Option<f64>
where
    I: IntoIterator<Item = MarketImpact>,
{
    let (mut rise, mut neutral, mut n) = (0usize, 0usize, 0usize);
    for impact in impacts {
        n += 1;
        match impact {
            MarketImpact::Rise => rise += 1,
            MarketImpact::Neutral => neutral += 1,
            MarketImpact::Fall => {}
        }
    }
    if n == 0 {
        return None;
    }
    let n = n as f64;
    Some(100.0 * (rise as f64 / n + 0.5 * neutral as f64 / n))
}

/// Reduce one `(institution, date)` group to a row. `group` must be non-empty.
fn aggregate_day(
    institution: Institution,
    date: NaiveDate,
    group: &[&SentimentRecord],
) -> DailyIndexRow {
    let n = group.len() as f64;
    let mut sums = [0.0f64; SentimentRecord::CONTINUOUS_COUNT];
    for record in group {
        for (sum, v) in sums.iter_mut().zip(record.continuous()) {
            *sum += v;
        }
    }
    let mean = |i: usize| sums[i] / n;
    let diffusion = |dim: MarketDimension| {
        diffusion_index(group.iter().map(|r| r.impact(dim))).unwrap_or(50.0)
    };

    DailyIndexRow {
        date,
        institution,
        hawkish_dovish_score: mean(0),
        uncertainty: mean(1),
        forward_guidance_strength: mean(2),
        topic_inflation: mean(3),
        topic_growth: mean(4),
        topic_employment: mean(5),
        topic_financial_stability: mean(6),
        topic_international: mean(7),
        stocks_diffusion_index: diffusion(MarketDimension::Stocks),
        bonds_diffusion_index: diffusion(MarketDimension::Bonds),
        currency_diffusion_index: diffusion(MarketDimension::Currency),
        speech_count: group.len(),
    }
}

/// Expand a sparse, date-ascending series to a dense daily calendar.
///
/// Starts at the first observation; nothing is fabricated before it.
pub fn forward_fill(sparse: &[DailyIndexRow]) -> Vec<DailyIndexRow> {
    let (Some(first), Some(last)) = (sparse.first(), sparse.last()) else {
        return Vec::new();
    };
    let days = (last.date - first.date).num_days().max(0) as usize + 1;
    let mut out = Vec::with_capacity(days);

    let mut observed = sparse.iter().peekable();
    let mut carry: Option<&DailyIndexRow> = None;
    let mut date = first.date;
    while date <= last.date {
        match observed.peek() {
            Some(row) if row.date == date => {
                out.push((*row).clone());
                carry = observed.next();
            }
            _ => {
                if let Some(prev) = carry {
                    out.push(prev.carried_to(date));
                }
            }
        }
        match date.succ_opt() {
            Some(next) => date = next,
            None => break,
        }
    }
    out
}

/// Build forward-filled and sparse tables for every institution present.
pub fn build_indices(records: &[ScoredSpeech]) -> IndexTables {
    let mut groups: BTreeMap<(Institution, NaiveDate), Vec<&SentimentRecord>> = BTreeMap::new();
    for r in records {
        groups
            .entry((r.institution, r.date))
            .or_default()
            .push(&r.record);
    }

    let mut tables = IndexTables::default();
    // BTreeMap order: institution, then date ascending.
    for ((institution, date), group) in &groups {
        tables
            .sparse
            .entry(*institution)
            .or_default()
            .push(aggregate_day(*institution, *date, group));
    }
    for (institution, rows) in &tables.sparse {
        tables.forward_filled.insert(*institution, forward_fill(rows));
    }

    tracing::info!(
        groups = groups.len(),
        records = records.len(),
        "built daily indices"
    );
    tables
}
