//! The `cbt score` command, plus the score tables shared with `cbt run`.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use comfy_table::{Cell, Table};

use cbt_core::ledger::ResponseLedger;
use cbt_core::parser;
use cbt_core::scoring::{self, Outcome, QuestionReview, ScoreCard};

pub fn execute(package_path: PathBuf, responses_path: PathBuf, format: String) -> Result<()> {
    let package = parser::parse_package(&package_path)?;

    let raw = std::fs::read_to_string(&responses_path)
        .with_context(|| format!("failed to read responses: {}", responses_path.display()))?;
    let ledger: ResponseLedger = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse responses: {}", responses_path.display()))?;

    let known: HashSet<&str> = package.all_questions().map(|q| q.id.as_str()).collect();
    for response in ledger.iter() {
        if !known.contains(response.question_id.as_str()) {
            tracing::warn!(
                question = %response.question_id,
                "response for a question not in the package ignored"
            );
        }
    }

    let card = scoring::score(package.all_questions(), &ledger);

    match format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&card)?),
        "text" => {
            println!("Package: {}", package.title);
            print_score_card(&card);
            print_review(&scoring::review(package.all_questions(), &ledger));
        }
        other => anyhow::bail!("unknown format: {other} (expected text or json)"),
    }

    Ok(())
}

pub fn print_score_card(card: &ScoreCard) {
    println!(
        "Total score: {} / {} (weight {}/{})",
        card.total,
        scoring::SCORE_SCALE,
        card.earned_weight,
        card.max_weight
    );

    let mut table = Table::new();
    table.set_header(vec!["Subject", "Score", "Weight"]);
    for (subject, s) in &card.subjects {
        table.add_row(vec![
            Cell::new(subject),
            Cell::new(s.score),
            Cell::new(format!("{}/{}", s.earned_weight, s.max_weight)),
        ]);
    }
    println!("{table}");
}

pub fn print_review(reviews: &[QuestionReview]) {
    let mut table = Table::new();
    table.set_header(vec!["Question", "Subject", "Weight", "Result", "Flagged"]);
    for r in reviews {
        let outcome = match r.outcome {
            Outcome::Correct => "correct",
            Outcome::Incorrect => "incorrect",
            Outcome::Unanswered => "unanswered",
        };
        table.add_row(vec![
            Cell::new(&r.question_id),
            Cell::new(&r.subject),
            Cell::new(r.weight),
            Cell::new(outcome),
            Cell::new(if r.flagged { "yes" } else { "" }),
        ]);
    }
    println!("{table}");
}
