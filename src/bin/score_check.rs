use std::path::Path;

use anyhow::{Result, anyhow};

use league_ingest::config::load_dotenv;
use league_ingest::league_rules::LeagueRules;
use league_ingest::score::parse_score;
use league_ingest::winner::{determine, parse_indicator};

fn main() -> Result<()> {
    load_dotenv();
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let mut positional = Vec::new();
    let mut indicator = None;
    let mut idx = 0;
    while idx < args.len() {
        let arg = &args[idx];
        if let Some(raw) = arg.strip_prefix("--winner=") {
            indicator = Some(raw.to_string());
        } else if arg == "--winner" {
            idx += 1;
            let next = args
                .get(idx)
                .ok_or_else(|| anyhow!("--winner needs home or away"))?;
            indicator = Some(next.clone());
        } else {
            positional.push(arg.clone());
        }
        idx += 1;
    }
    let [league, score] = positional.as_slice() else {
        return Err(anyhow!("usage: score_check <LEAGUE> <SCORE> [--winner home|away]"));
    };

    let rules = match std::env::var("LEAGUE_RULES_FILE") {
        Ok(path) if !path.trim().is_empty() => LeagueRules::from_file(Path::new(path.trim()))?,
        _ => LeagueRules::builtin(),
    };
    let recorded = match indicator.as_deref() {
        Some(raw) => Some(
            parse_indicator(raw, None, None)
                .ok_or_else(|| anyhow!("--winner must be home or away, got {raw}"))?,
        ),
        None => None,
    };

    let parsed = parse_score(score);
    let decision = determine(score, &parsed, league, &rules, recorded);

    println!("League: {} ({})", league, rules.policy_for(league).as_str());
    if rules.rule(league).is_none() {
        println!("note: unknown league, using standard policy");
    }
    match &parsed {
        Ok(parsed) => {
            println!("Parsed: {parsed}");
            let (home, away) = parsed.sets_won(parsed.sets.len());
            println!(
                "Sets won: {home}-{away} incomplete={} super_tiebreak={}",
                parsed.is_incomplete, parsed.is_super_tiebreak_finish
            );
        }
        Err(err) => println!("Parse error: {err}"),
    }
    println!(
        "Winner: {} ({}, {})",
        decision.winner,
        decision.confidence.as_str(),
        decision.reason
    );
    Ok(())
}
