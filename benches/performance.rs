//! Benchmarks for per-cycle hot paths
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use adaptive_trader::experience::{MacdCross, MarketStateSnapshot};
use adaptive_trader::risk::{default_specs, RiskSettings};
use adaptive_trader::sizing::{evaluate, SizingParams, SizingRequest};
use adaptive_trader::utils::helpers::extract_json_object;
use adaptive_trader::utils::{TradeAction, TradeSide};
use adaptive_trader::{ExperienceRecord, ExperienceStore};

fn snapshot(i: usize) -> MarketStateSnapshot {
    MarketStateSnapshot {
        symbol: "SPY".to_string(),
        current_price: 100.0 + i as f64 * 0.1,
        rsi: Some(30.0 + (i % 40) as f64),
        macd_signal: Some(if i % 2 == 0 { MacdCross::Bullish } else { MacdCross::Bearish }),
        price_change_5d: Some(((i % 20) as f64 - 10.0) / 100.0),
    }
}

/// Benchmark a full sizing breakdown
fn bench_sizing(c: &mut Criterion) {
    let params = SizingParams::from(&RiskSettings::from_specs(&default_specs()));
    let request = SizingRequest {
        portfolio_value: 100_000.0,
        cash_available: 50_000.0,
        asset_price: 420.0,
        side: TradeSide::Buy,
        sentiment: 75.0,
        stop_loss_price: Some(400.0),
        atr: Some(6.5),
    };

    c.bench_function("position_sizing", |b| {
        b.iter(|| black_box(evaluate(black_box(&params), black_box(&request))))
    });
}

/// Benchmark similarity search at increasing log sizes
fn bench_find_similar(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_similar");
    for size in [100usize, 1_000, 10_000] {
        let records = (0..size)
            .map(|i| ExperienceRecord::new("SPY", snapshot(i), TradeAction::Hold, 0))
            .collect();
        let store = ExperienceStore::with_records(records);
        let current = snapshot(7);

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(store.find_similar(black_box(&current), 0.10, 5)))
        });
    }
    group.finish();
}

/// Benchmark JSON extraction from chatty advisor text
fn bench_json_extraction(c: &mut Criterion) {
    let text = format!(
        "{} Final answer: {{\"sentiment\": 72, \"action\": \"BUY\", \"reasoning\": \"momentum {{strong}}\"}} trailing",
        "Market commentary. ".repeat(50)
    );
    c.bench_function("extract_json_object", |b| {
        b.iter(|| black_box(extract_json_object(black_box(&text))))
    });
}

criterion_group!(benches, bench_sizing, bench_find_similar, bench_json_extraction);
criterion_main!(benches);
