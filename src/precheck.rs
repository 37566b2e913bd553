use std::collections::{BTreeMap, HashSet};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::league_rules::{LeaguePolicy, LeagueRules};
use crate::records::{LeagueBatch, PlayerRef, RawMatchRecord};
use crate::score::{Side, parse_score};
use crate::winner::{Confidence, WinnerDecision, determine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Unchanged,
    Corrected,
    Flagged,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordCheck {
    pub league: String,
    pub index: usize,
    pub date: Option<String>,
    pub home_team: Option<String>,
    pub away_team: Option<String>,
    pub score: String,
    pub outcome: RecordOutcome,
    pub recorded: Option<Side>,
    pub decision: WinnerDecision,
    pub parse_error: Option<String>,
    #[serde(skip)]
    sets_won: (u32, u32),
}

#[derive(Debug, Clone, Serialize)]
pub struct LeagueCheckSummary {
    pub league: String,
    pub policy: LeaguePolicy,
    pub total: usize,
    pub unchanged: usize,
    pub corrected: usize,
    pub flagged: usize,
    pub parse_errors: usize,
}

impl LeagueCheckSummary {
    fn new(league: &str, policy: LeaguePolicy) -> Self {
        Self {
            league: league.to_string(),
            policy,
            total: 0,
            unchanged: 0,
            corrected: 0,
            flagged: 0,
            parse_errors: 0,
        }
    }

    pub fn flagged_ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.flagged as f64 / self.total as f64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GateViolation {
    pub league: String,
    pub policy: LeaguePolicy,
    pub flagged: usize,
    pub total: usize,
    pub ratio: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrecheckReport {
    pub threshold: f64,
    pub leagues: Vec<LeagueCheckSummary>,
    /// Corrected and flagged records; unchanged ones are only counted.
    pub records: Vec<RecordCheck>,
    pub gate_violations: Vec<GateViolation>,
}

impl PrecheckReport {
    pub fn gate_passed(&self) -> bool {
        self.gate_violations.is_empty()
    }

    pub fn total(&self) -> usize {
        self.leagues.iter().map(|l| l.total).sum()
    }

    pub fn corrected(&self) -> usize {
        self.leagues.iter().map(|l| l.corrected).sum()
    }

    pub fn flagged(&self) -> usize {
        self.leagues.iter().map(|l| l.flagged).sum()
    }

    pub fn league(&self, code: &str) -> Option<&LeagueCheckSummary> {
        self.leagues.iter().find(|l| l.league == code)
    }

    pub fn gate_error(&self) -> Option<PipelineError> {
        if self.gate_passed() {
            return None;
        }
        let detail = self
            .gate_violations
            .iter()
            .map(|v| {
                format!(
                    "{} flagged {}/{} ({:.1}% > {:.1}%)",
                    v.league,
                    v.flagged,
                    v.total,
                    v.ratio * 100.0,
                    self.threshold * 100.0
                )
            })
            .collect::<Vec<_>>()
            .join("; ");
        Some(PipelineError::ImportPrecheckFailure(detail))
    }
}

/// A record after validation, ready for the loader.
#[derive(Debug, Clone)]
pub struct ValidatedMatch {
    pub league_code: String,
    pub policy: LeaguePolicy,
    pub date: Option<String>,
    pub home_team: Option<String>,
    pub away_team: Option<String>,
    pub score_text: String,
    pub decision: WinnerDecision,
    /// Completed sets won by (home, away).
    pub sets_won: (u32, u32),
    pub players: [PlayerRef; 4],
}

impl ValidatedMatch {
    /// Records without a usable natural key are reported but never loaded.
    pub fn is_loadable(&self) -> bool {
        self.date.is_some() && self.home_team.is_some() && self.away_team.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct PrecheckOutcome {
    pub report: PrecheckReport,
    pub matches: Vec<ValidatedMatch>,
}

/// Pure per-record check: parse, decide, classify. No mutation.
pub fn check_record(record: &RawMatchRecord, rules: &LeagueRules) -> RecordCheck {
    let date = record.normalized_date();
    let mut parse_error = None;
    let mut sets_won = (0, 0);

    let decision = if let Some(field) = record.missing_key_field() {
        WinnerDecision::indeterminate(format!("missing_field:{field}"))
    } else if date.is_none() {
        WinnerDecision::indeterminate("invalid_date")
    } else {
        let raw = record.score_text();
        let parsed = parse_score(raw);
        match &parsed {
            Ok(score) => sets_won = score.sets_won(score.sets.len()),
            Err(err) => parse_error = Some(err.to_string()),
        }
        determine(raw, &parsed, &record.league_code, rules, record.recorded_winner)
    };

    let outcome = if decision.is_indeterminate() {
        RecordOutcome::Flagged
    } else if decision.confidence == Confidence::Corrected {
        RecordOutcome::Corrected
    } else {
        RecordOutcome::Unchanged
    };

    RecordCheck {
        league: record.league_code.clone(),
        index: record.index,
        date,
        home_team: record.home_team.clone(),
        away_team: record.away_team.clone(),
        score: record.score_text().to_string(),
        outcome,
        recorded: record.recorded_winner,
        decision,
        parse_error,
        sets_won,
    }
}

/// Runs the winner determiner over every record, applies corrections in place and
/// evaluates the flagged-ratio gate. Touches no store.
pub fn validate_batches(
    batches: &mut [LeagueBatch],
    rules: &LeagueRules,
    threshold: f64,
) -> PrecheckOutcome {
    let mut summaries: BTreeMap<String, LeagueCheckSummary> = BTreeMap::new();
    let mut reported = Vec::new();
    let mut matches = Vec::new();
    let mut warned_unknown = HashSet::new();

    for batch in batches.iter_mut() {
        let checks = batch
            .records
            .par_iter()
            .map(|record| check_record(record, rules))
            .collect::<Vec<_>>();

        for (record, check) in batch.records.iter_mut().zip(checks) {
            let policy = rules.policy_for(&record.league_code);
            if rules.rule(&record.league_code).is_none()
                && warned_unknown.insert(record.league_code.clone())
            {
                warn!(league = %record.league_code, "unknown league code, scoring with standard policy");
            }

            let summary = summaries
                .entry(record.league_code.clone())
                .or_insert_with(|| LeagueCheckSummary::new(&record.league_code, policy));
            summary.total += 1;
            if check.parse_error.is_some() {
                summary.parse_errors += 1;
            }
            match check.outcome {
                RecordOutcome::Unchanged => summary.unchanged += 1,
                RecordOutcome::Corrected => summary.corrected += 1,
                RecordOutcome::Flagged => summary.flagged += 1,
            }

            apply_check(record, &check, policy);
            matches.push(ValidatedMatch {
                league_code: record.league_code.clone(),
                policy,
                date: check.date.clone(),
                home_team: record.home_team.clone(),
                away_team: record.away_team.clone(),
                score_text: check.score.clone(),
                decision: check.decision.clone(),
                sets_won: check.sets_won,
                players: record.players.clone(),
            });
            if check.outcome != RecordOutcome::Unchanged {
                reported.push(check);
            }
        }
    }

    let leagues = summaries.into_values().collect::<Vec<_>>();
    let gate_violations = leagues
        .iter()
        .filter(|l| l.policy.is_gated() && l.total > 0 && l.flagged_ratio() > threshold)
        .map(|l| GateViolation {
            league: l.league.clone(),
            policy: l.policy,
            flagged: l.flagged,
            total: l.total,
            ratio: l.flagged_ratio(),
        })
        .collect::<Vec<_>>();
    for v in &gate_violations {
        warn!(league = %v.league, flagged = v.flagged, total = v.total, "flagged ratio above gate threshold");
    }

    PrecheckOutcome {
        report: PrecheckReport {
            threshold,
            leagues,
            records: reported,
            gate_violations,
        },
        matches,
    }
}

fn apply_check(record: &mut RawMatchRecord, check: &RecordCheck, policy: LeaguePolicy) {
    match check.outcome {
        // The source already agrees with the score, so its indicator text stays verbatim.
        RecordOutcome::Unchanged => {}
        RecordOutcome::Corrected => {
            info!(
                league = %check.league,
                index = check.index,
                old = check.recorded.map(Side::as_str).unwrap_or("none"),
                new = %check.decision.winner,
                score = %check.score,
                "corrected recorded winner"
            );
            record.winner = Some(check.decision.winner.as_str().to_string());
            record.correction_reason = Some(check.decision.reason.clone());
        }
        RecordOutcome::Flagged => {
            // Ambiguous lenient-league data is left exactly as scraped.
            if policy == LeaguePolicy::LenientIncomplete {
                return;
            }
            record.correction_reason = Some(check.decision.reason.clone());
        }
    }
}
