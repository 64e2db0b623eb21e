//! Core data model types for the exam engine.
//!
//! Packages, sections and questions are immutable content supplied by the
//! catalog. Sessions and results are the engine's own records.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::ResponseLedger;

/// Question difficulty level, always within `1..=5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Difficulty(u8);

impl Difficulty {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    /// Create a difficulty level, rejecting values outside `1..=5`.
    pub fn new(level: u8) -> Result<Self, String> {
        if (Self::MIN..=Self::MAX).contains(&level) {
            Ok(Self(level))
        } else {
            Err(format!(
                "difficulty must be between {} and {}, got {level}",
                Self::MIN,
                Self::MAX
            ))
        }
    }

    /// Scoring weight of a question at this difficulty.
    pub fn weight(self) -> u64 {
        u64::from(self.0) * 10
    }
}

impl TryFrom<u8> for Difficulty {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        Self::new(level)
    }
}

impl From<Difficulty> for u8 {
    fn from(d: Difficulty) -> Self {
        d.0
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One option of a single-choice question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub id: String,
    pub text: String,
}

/// One true/false statement of a multi-statement question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    pub id: String,
    pub text: String,
    /// Whether the statement is true.
    pub correct: bool,
}

/// Question type together with its answer key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuestionKind {
    /// Pick exactly one option; `correct` is the option id.
    SingleChoice {
        choices: Vec<Choice>,
        correct: String,
    },
    /// Mark every statement true or false.
    MultiStatement { statements: Vec<Statement> },
    /// Type a short answer, compared case-insensitively after trimming.
    FreeText { correct: String },
}

impl QuestionKind {
    /// Short machine name used in package files and error messages.
    pub fn label(&self) -> &'static str {
        match self {
            QuestionKind::SingleChoice { .. } => "single_choice",
            QuestionKind::MultiStatement { .. } => "multi_statement",
            QuestionKind::FreeText { .. } => "free_text",
        }
    }

    /// Whether a candidate has at least one option to act on.
    pub fn is_answerable(&self) -> bool {
        match self {
            QuestionKind::SingleChoice { choices, .. } => !choices.is_empty(),
            QuestionKind::MultiStatement { statements } => !statements.is_empty(),
            QuestionKind::FreeText { .. } => true,
        }
    }
}

/// An immutable content unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub subject: String,
    pub difficulty: Difficulty,
    pub text: String,
    #[serde(default)]
    pub passage: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub explanation: String,
    #[serde(flatten)]
    pub kind: QuestionKind,
}

impl Question {
    pub fn weight(&self) -> u64 {
        self.difficulty.weight()
    }
}

/// A timed, ordered group of questions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub id: String,
    pub title: String,
    pub duration_minutes: u32,
    #[serde(default)]
    pub questions: Vec<Question>,
}

impl Section {
    /// Full time budget in seconds.
    pub fn duration_secs(&self) -> u64 {
        u64::from(self.duration_minutes) * 60
    }

    pub fn question(&self, question_id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == question_id)
    }

    pub fn question_ids(&self) -> impl Iterator<Item = &str> {
        self.questions.iter().map(|q| q.id.as_str())
    }
}

/// A resolved exam package as supplied by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamPackage {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub sections: Vec<Section>,
}

impl ExamPackage {
    pub fn section(&self, index: usize) -> Option<&Section> {
        self.sections.get(index)
    }

    /// Every question of every section, in section order.
    pub fn all_questions(&self) -> impl Iterator<Item = &Question> {
        self.sections.iter().flat_map(|s| s.questions.iter())
    }

    pub fn question_count(&self) -> usize {
        self.sections.iter().map(|s| s.questions.len()).sum()
    }
}

/// A submitted answer, shaped by the question type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Answer {
    /// Selected option id.
    Choice(String),
    /// One slot per statement; `None` marks a statement not yet decided.
    Statements(Vec<Option<bool>>),
    /// Free text as typed.
    Text(String),
}

impl Answer {
    /// An empty option id or empty text counts as no answer at all.
    pub fn is_blank(&self) -> bool {
        match self {
            Answer::Choice(s) | Answer::Text(s) => s.is_empty(),
            Answer::Statements(_) => false,
        }
    }

    /// Whether this answer has the shape the question type expects.
    pub fn fits(&self, kind: &QuestionKind) -> bool {
        match (self, kind) {
            (Answer::Choice(id), QuestionKind::SingleChoice { choices, .. }) => {
                id.is_empty() || choices.iter().any(|c| &c.id == id)
            }
            (Answer::Statements(values), QuestionKind::MultiStatement { statements }) => {
                values.len() == statements.len()
            }
            (Answer::Text(_), QuestionKind::FreeText { .. }) => true,
            _ => false,
        }
    }
}

/// The recorded state of one question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub question_id: String,
    #[serde(default)]
    pub answer: Option<Answer>,
    /// Marked for review ("unsure").
    #[serde(default)]
    pub flagged: bool,
}

impl Response {
    pub fn is_answered(&self) -> bool {
        self.answer.as_ref().is_some_and(|a| !a.is_blank())
    }
}

/// The stateful root of one exam attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub package_id: String,
    pub current_section_index: usize,
    #[serde(default)]
    pub responses: ResponseLedger,
    pub started_at: DateTime<Utc>,
    pub section_started_at: DateTime<Utc>,
    #[serde(default)]
    pub is_finished: bool,
}

impl Session {
    /// A fresh attempt positioned at the first section.
    pub fn begin(package_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            package_id: package_id.into(),
            current_section_index: 0,
            responses: ResponseLedger::new(),
            started_at: now,
            section_started_at: now,
            is_finished: false,
        }
    }

    /// Whether `other` is a record of the same attempt (same package, same start).
    pub fn same_attempt(&self, other: &Session) -> bool {
        self.package_id == other.package_id && self.started_at == other.started_at
    }
}

/// A finalized, scored attempt. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamResult {
    pub id: Uuid,
    pub user_id: String,
    pub package_id: String,
    pub package_title: String,
    pub completed_at: DateTime<Utc>,
    /// Normalized total score, `0..=1000`.
    pub total_score: u32,
    /// Normalized score per subject, `0..=1000`.
    pub subject_scores: BTreeMap<String, u32>,
    /// The ledger the scores were computed from.
    pub responses: ResponseLedger,
}
