//! TOML exam package parser.
//!
//! Loads exam packages from TOML files and directories, and validates them.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::model::{Choice, Difficulty, ExamPackage, Question, QuestionKind, Section, Statement};
use crate::traits::PackageCatalog;

/// Duration given to sections derived from top-level questions.
pub const DERIVED_SECTION_MINUTES: u32 = 30;

/// Intermediate TOML structure for parsing package files.
#[derive(Debug, Deserialize)]
struct TomlPackageFile {
    package: TomlPackageHeader,
    #[serde(default)]
    sections: Vec<TomlSection>,
    #[serde(default)]
    questions: Vec<TomlQuestion>,
}

#[derive(Debug, Deserialize)]
struct TomlPackageHeader {
    id: String,
    title: String,
}

#[derive(Debug, Deserialize)]
struct TomlSection {
    id: String,
    title: String,
    #[serde(default = "default_duration")]
    duration_minutes: u32,
    #[serde(default)]
    questions: Vec<TomlQuestion>,
}

fn default_duration() -> u32 {
    DERIVED_SECTION_MINUTES
}

#[derive(Debug, Deserialize)]
struct TomlQuestion {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default = "default_difficulty")]
    difficulty: u8,
    text: String,
    #[serde(default)]
    passage: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    choices: Vec<TomlChoice>,
    #[serde(default)]
    statements: Vec<TomlStatement>,
    #[serde(default)]
    correct: Option<String>,
}

fn default_difficulty() -> u8 {
    1
}

#[derive(Debug, Deserialize)]
struct TomlChoice {
    id: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct TomlStatement {
    id: String,
    text: String,
    correct: bool,
}

impl TomlQuestion {
    fn into_question(self, default_subject: &str) -> Result<Question> {
        let id = self.id;
        let difficulty = Difficulty::new(self.difficulty)
            .map_err(|e| anyhow::anyhow!("question '{id}': {e}"))?;

        let kind = match self.kind.as_str() {
            "single_choice" => QuestionKind::SingleChoice {
                choices: self
                    .choices
                    .into_iter()
                    .map(|c| Choice {
                        id: c.id,
                        text: c.text,
                    })
                    .collect(),
                correct: self
                    .correct
                    .with_context(|| format!("question '{id}': single_choice needs `correct`"))?,
            },
            "multi_statement" => QuestionKind::MultiStatement {
                statements: self
                    .statements
                    .into_iter()
                    .map(|s| Statement {
                        id: s.id,
                        text: s.text,
                        correct: s.correct,
                    })
                    .collect(),
            },
            "free_text" => QuestionKind::FreeText {
                correct: self
                    .correct
                    .with_context(|| format!("question '{id}': free_text needs `correct`"))?,
            },
            other => anyhow::bail!("question '{id}': unknown question type '{other}'"),
        };

        Ok(Question {
            subject: self.subject.unwrap_or_else(|| default_subject.to_string()),
            id,
            difficulty,
            text: self.text,
            passage: self.passage,
            image_url: self.image_url,
            explanation: self.explanation,
            kind,
        })
    }
}

/// Parse a single TOML file into an `ExamPackage`.
pub fn parse_package(path: &Path) -> Result<ExamPackage> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read package file: {}", path.display()))?;

    parse_package_str(&content, path)
}

/// Parse a TOML string into an `ExamPackage` (useful for testing).
pub fn parse_package_str(content: &str, source_path: &Path) -> Result<ExamPackage> {
    let parsed: TomlPackageFile = toml::from_str(content)
        .with_context(|| format!("failed to parse TOML: {}", source_path.display()))?;

    let package_id = parsed.package.id;

    let sections = if parsed.sections.is_empty() {
        derive_sections(&package_id, parsed.questions)?
    } else {
        if !parsed.questions.is_empty() {
            tracing::warn!(
                "{}: top-level questions ignored because sections are declared",
                source_path.display()
            );
        }
        parsed
            .sections
            .into_iter()
            .map(|s| {
                let questions = s
                    .questions
                    .into_iter()
                    .map(|q| q.into_question(&s.title))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Section {
                    id: s.id,
                    title: s.title,
                    duration_minutes: s.duration_minutes,
                    questions,
                })
            })
            .collect::<Result<Vec<_>>>()?
    };

    Ok(ExamPackage {
        id: package_id,
        title: parsed.package.title,
        sections,
    })
}

/// One section per distinct subject, in order of first appearance.
fn derive_sections(package_id: &str, questions: Vec<TomlQuestion>) -> Result<Vec<Section>> {
    let mut sections: Vec<Section> = Vec::new();

    for q in questions {
        let question = q.into_question("General")?;
        match sections.iter_mut().find(|s| s.title == question.subject) {
            Some(section) => section.questions.push(question),
            None => sections.push(Section {
                id: format!("{package_id}-{}", question.subject),
                title: question.subject.clone(),
                duration_minutes: DERIVED_SECTION_MINUTES,
                questions: vec![question],
            }),
        }
    }

    Ok(sections)
}

/// Recursively load all `.toml` package files from a directory.
pub fn load_package_directory(dir: &Path) -> Result<Vec<ExamPackage>> {
    let mut packages = Vec::new();

    if !dir.is_dir() {
        anyhow::bail!("not a directory: {}", dir.display());
    }

    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory: {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();

        if path.is_dir() {
            packages.extend(load_package_directory(&path)?);
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            match parse_package(&path) {
                Ok(package) => packages.push(package),
                Err(e) => {
                    tracing::warn!("skipping {}: {:#}", path.display(), e);
                }
            }
        }
    }

    Ok(packages)
}

/// Find the package with `package_id` under `dir`.
pub fn find_package(dir: &Path, package_id: &str) -> Result<Option<ExamPackage>> {
    Ok(load_package_directory(dir)?
        .into_iter()
        .find(|p| p.id == package_id))
}

/// A warning from package validation.
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    /// The section ID (if applicable).
    pub section_id: Option<String>,
    /// The question ID (if applicable).
    pub question_id: Option<String>,
    /// Warning message.
    pub message: String,
}

/// Validate a package for common authoring issues.
pub fn validate_package(package: &ExamPackage) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();

    if package.sections.is_empty() {
        warnings.push(ValidationWarning {
            section_id: None,
            question_id: None,
            message: "package has no sections".into(),
        });
    }

    let mut seen_sections = HashSet::new();
    let mut seen_questions = HashSet::new();

    for section in &package.sections {
        let section_warning = |message: String| ValidationWarning {
            section_id: Some(section.id.clone()),
            question_id: None,
            message,
        };

        if !seen_sections.insert(&section.id) {
            warnings.push(section_warning(format!("duplicate section ID: {}", section.id)));
        }
        if section.questions.is_empty() {
            warnings.push(section_warning("section has no questions".into()));
        }
        if section.duration_minutes == 0 {
            warnings.push(section_warning("section duration is zero".into()));
        }

        for question in &section.questions {
            let mut warn = |message: String| {
                warnings.push(ValidationWarning {
                    section_id: Some(section.id.clone()),
                    question_id: Some(question.id.clone()),
                    message,
                })
            };

            if !seen_questions.insert(&question.id) {
                warn(format!("duplicate question ID: {}", question.id));
            }

            match &question.kind {
                QuestionKind::SingleChoice { choices, correct } => {
                    if choices.is_empty() {
                        warn("single_choice question has no choices".into());
                    } else if !choices.iter().any(|c| &c.id == correct) {
                        warn(format!("correct choice '{correct}' is not among the choices"));
                    }
                }
                QuestionKind::MultiStatement { statements } => {
                    if statements.is_empty() {
                        warn("multi_statement question has no statements".into());
                    }
                }
                QuestionKind::FreeText { correct } => {
                    if correct.trim().is_empty() {
                        warn("free_text answer key is empty".into());
                    }
                }
            }
        }
    }

    warnings
}

/// Package catalog backed by a directory of TOML files.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    dir: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl PackageCatalog for DirectoryCatalog {
    async fn fetch_package(&self, package_id: &str) -> Result<Option<ExamPackage>> {
        find_package(&self.dir, package_id)
    }
}
