use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use league_ingest::league_rules::LeagueRules;
use league_ingest::precheck::validate_batches;
use league_ingest::records::parse_league_json;
use league_ingest::score::parse_score;
use league_ingest::winner::determine;

const SCORES: &[&str] = &[
    "6-2, 6-1",
    "5-7, 6-3, 6-4",
    "7-6 [7-5], 6-3",
    "6-3, 4-6, 10-6",
    "6-3, 4-6, 8-10",
    "6-2, 6-2, 6-6",
    "4-3",
    "rain delay",
];

fn league_json(records: usize) -> String {
    let rows = (0..records)
        .map(|i| {
            format!(
                r#"{{"date": "2024-10-{:02}", "home_team": "Club {} - 1", "away_team": "Club {} - 2", "score": "{}", "winner": "home"}}"#,
                i % 28 + 1,
                i,
                i + 1,
                SCORES[i % SCORES.len()]
            )
        })
        .collect::<Vec<_>>();
    format!("[{}]", rows.join(","))
}

fn bench_parse_score(c: &mut Criterion) {
    c.bench_function("parse_score", |b| {
        b.iter(|| {
            for raw in SCORES {
                let _ = black_box(parse_score(black_box(raw)));
            }
        })
    });
}

fn bench_determine(c: &mut Criterion) {
    let rules = LeagueRules::builtin();
    let parsed = SCORES.iter().map(|raw| parse_score(raw)).collect::<Vec<_>>();
    c.bench_function("determine_all_policies", |b| {
        b.iter(|| {
            for league in ["APTA_CHICAGO", "NSTF", "CITA"] {
                for (raw, parsed) in SCORES.iter().zip(&parsed) {
                    black_box(determine(raw, parsed, league, &rules, None));
                }
            }
        })
    });
}

fn bench_validate_batch(c: &mut Criterion) {
    let rules = LeagueRules::builtin();
    let raw = league_json(5_000);
    c.bench_function("validate_5k_records", |b| {
        b.iter(|| {
            let mut batches = vec![parse_league_json("NSTF", &raw).unwrap()];
            let outcome = validate_batches(&mut batches, &rules, 0.10);
            black_box(outcome.report.flagged());
        })
    });
}

criterion_group!(benches, bench_parse_score, bench_determine, bench_validate_batch);
criterion_main!(benches);
