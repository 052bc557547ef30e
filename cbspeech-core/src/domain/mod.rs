//! Domain types: speeches, sentiment records, daily index rows, identifiers.

pub mod ids;
pub mod index;
pub mod sentiment;
pub mod speech;

pub use ids::SubmissionId;
pub use index::{DailyIndexRow, IndexTables};
pub use sentiment::{MarketDimension, MarketImpact, SentimentRecord, TOPIC_FIELDS};
pub use speech::{Institution, SpeechRecord};
