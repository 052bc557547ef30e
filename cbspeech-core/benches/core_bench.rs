//! Criterion benchmarks for the core hot paths.
//!
//! 1. Chunking a corpus (prompt build + estimate + pack)
//! 2. Output validation
//! 3. Daily index construction

use cbspeech_core::aggregate::{build_indices, ScoredSpeech};
use cbspeech_core::chunker::{ChunkLimits, RequestChunker};
use cbspeech_core::domain::{Institution, MarketImpact, SentimentRecord, SpeechRecord};
use cbspeech_core::prompt::PromptBuilder;
use cbspeech_core::tokens::CharRatioEstimator;
use cbspeech_core::validate::parse_and_validate;
use chrono::NaiveDate;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

// ── Helpers ──────────────────────────────────────────────────────────

fn make_speeches(n: usize) -> Vec<SpeechRecord> {
    let base = NaiveDate::from_ymd_opt(2015, 1, 1).unwrap();
    (0..n)
        .map(|i| SpeechRecord {
            id: format!("s{i:06}"),
            date: base + chrono::Duration::days((i / 3) as i64),
            institution: if i % 2 == 0 { Institution::Fed } else { Institution::Ecb },
            text: "The committee remains attentive to inflation risks. ".repeat(40 + i % 200),
            title: None,
            speaker: None,
        })
        .collect()
}

fn make_scored(n: usize) -> Vec<ScoredSpeech> {
    let base = NaiveDate::from_ymd_opt(2015, 1, 1).unwrap();
    (0..n)
        .map(|i| ScoredSpeech {
            date: base + chrono::Duration::days((i * 2) as i64),
            institution: if i % 2 == 0 { Institution::Fed } else { Institution::Ecb },
            record: SentimentRecord {
                speech_id: format!("s{i}"),
                hawkish_dovish_score: (i % 200) as f64 - 100.0,
                uncertainty: (i % 100) as f64,
                forward_guidance_strength: 50.0,
                topic_inflation: 20.0,
                topic_growth: 20.0,
                topic_employment: 20.0,
                topic_financial_stability: 20.0,
                topic_international: 20.0,
                market_impact_stocks: MarketImpact::Rise,
                market_impact_bonds: MarketImpact::Fall,
                market_impact_currency: MarketImpact::Neutral,
            },
        })
        .collect()
}

// ── Benchmarks ───────────────────────────────────────────────────────

fn bench_chunking(c: &mut Criterion) {
    let est = CharRatioEstimator::default();
    let prompts = PromptBuilder::new();
    let mut group = c.benchmark_group("chunking");
    for n in [1_000usize, 10_000] {
        let speeches = make_speeches(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &speeches, |b, speeches| {
            let chunker = RequestChunker::new(&est, &prompts, ChunkLimits::new(1_800_000));
            b.iter(|| black_box(chunker.chunk(black_box(speeches)).unwrap()));
        });
    }
    group.finish();
}

fn bench_validation(c: &mut Criterion) {
    let raw = r#"{"speech_id":"s1","hawkish_dovish_score":-35.5,"uncertainty":42,"forward_guidance_strength":70,"topic_inflation":50,"topic_growth":20,"topic_employment":15,"topic_financial_stability":10,"topic_international":5,"market_impact_stocks":"rise","market_impact_bonds":"fall","market_impact_currency":"neutral"}"#;
    c.bench_function("parse_and_validate", |b| {
        b.iter(|| black_box(parse_and_validate(black_box(raw), "s1").unwrap()))
    });
}

fn bench_indices(c: &mut Criterion) {
    let scored = make_scored(20_000);
    c.bench_function("build_indices_20k", |b| {
        b.iter(|| black_box(build_indices(black_box(&scored))))
    });
}

criterion_group!(benches, bench_chunking, bench_validation, bench_indices);
criterion_main!(benches);
