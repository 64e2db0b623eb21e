//! The `cbt validate` command.

use std::path::PathBuf;

use anyhow::Result;

use cbt_core::parser;

pub fn execute(package_path: PathBuf) -> Result<()> {
    let packages = if package_path.is_dir() {
        parser::load_package_directory(&package_path)?
    } else {
        vec![parser::parse_package(&package_path)?]
    };

    let mut total_warnings = 0;

    for package in &packages {
        println!(
            "Package: {} ({} sections, {} questions)",
            package.title,
            package.sections.len(),
            package.question_count()
        );

        let warnings = parser::validate_package(package);
        for w in &warnings {
            let prefix = match (&w.section_id, &w.question_id) {
                (_, Some(question)) => format!("  [{question}]"),
                (Some(section), None) => format!("  [{section}]"),
                (None, None) => "  ".to_string(),
            };
            println!("{prefix} WARNING: {}", w.message);
        }
        total_warnings += warnings.len();
    }

    if total_warnings == 0 {
        println!("All packages valid.");
    } else {
        println!("\n{total_warnings} warning(s) found.");
    }

    Ok(())
}
