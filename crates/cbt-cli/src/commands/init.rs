//! The `cbt init` command.

use anyhow::Result;

pub fn execute() -> Result<()> {
    // Create cbt.toml
    if std::path::Path::new("cbt.toml").exists() {
        println!("cbt.toml already exists, skipping.");
    } else {
        std::fs::write("cbt.toml", SAMPLE_CONFIG)?;
        println!("Created cbt.toml");
    }

    // Create example package
    std::fs::create_dir_all("packages")?;
    let example_path = std::path::Path::new("packages/example.toml");
    if example_path.exists() {
        println!("packages/example.toml already exists, skipping.");
    } else {
        std::fs::write(example_path, EXAMPLE_PACKAGE)?;
        println!("Created packages/example.toml");
    }

    println!("\nNext steps:");
    println!("  1. Edit cbt.toml to point at your remote store");
    println!("  2. Run: cbt validate --package packages/example.toml");
    println!("  3. Run: cbt run --package example");

    Ok(())
}

const SAMPLE_CONFIG: &str = r#"# cbt configuration

user_id = "local-user"
packages_dir = "packages"
local_dir = ".cbt/local"

# Without a [remote] table, sessions and results are mirrored to .cbt/remote.
# [remote]
# type = "rest"
# base_url = "https://your-project.supabase.co"
# api_key = "${CBT_REMOTE_API_KEY}"

# [remote]
# type = "file"
# dir = "/mnt/shared/cbt"

[timer]
anomaly_threshold_secs = 5
anomaly_deduction_secs = 1
low_time_warning_secs = 300
tick_interval_ms = 1000
"#;

const EXAMPLE_PACKAGE: &str = r#"[package]
id = "example"
title = "Example Tryout"

[[sections]]
id = "quant"
title = "Quantitative Reasoning"
duration_minutes = 10

[[sections.questions]]
id = "quant-1"
type = "single_choice"
subject = "Mathematics"
difficulty = 2
text = "What is 12 x 12?"
choices = [
  { id = "A", text = "124" },
  { id = "B", text = "144" },
  { id = "C", text = "148" },
]
correct = "B"
explanation = "12 x 12 = 144."

[[sections.questions]]
id = "quant-2"
type = "multi_statement"
subject = "Mathematics"
difficulty = 4
text = "Mark each statement true or false."
statements = [
  { id = "a", text = "Every prime number is odd.", correct = false },
  { id = "b", text = "The sum of two even numbers is even.", correct = true },
]

[[sections]]
id = "verbal"
title = "Verbal Reasoning"
duration_minutes = 5

[[sections.questions]]
id = "verbal-1"
type = "free_text"
subject = "Language"
difficulty = 3
passage = "The committee postponed the vote until every member had read the report."
text = "Until when was the vote postponed? Answer with one word: 'reading' or 'tomorrow'."
correct = "reading"
"#;
