//! The `cbt history` command.

use std::path::PathBuf;

use anyhow::{Context, Result};
use comfy_table::{Cell, Table};

use cbt_store::{create_remote_store, load_config_from};

pub async fn execute(format: String, config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config_from(config_path.as_deref())?;
    let remote = create_remote_store(&config)?;

    let results = remote
        .list_results(&config.user_id)
        .await
        .with_context(|| format!("failed to list results from {} store", remote.name()))?;

    match format.as_str() {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&results)?);
            return Ok(());
        }
        "text" => {}
        other => anyhow::bail!("unknown format: {other} (expected text or json)"),
    }

    if results.is_empty() {
        println!("No results for {}.", config.user_id);
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["Completed", "Package", "Score", "Subjects"]);
    for result in &results {
        let subjects = result
            .subject_scores
            .iter()
            .map(|(name, score)| format!("{name} {score}"))
            .collect::<Vec<_>>()
            .join(", ");
        table.add_row(vec![
            Cell::new(
                result
                    .completed_at
                    .with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M"),
            ),
            Cell::new(&result.package_title),
            Cell::new(result.total_score),
            Cell::new(subjects),
        ]);
    }

    println!("{} result(s) for {}", results.len(), config.user_id);
    println!("{table}");
    Ok(())
}
