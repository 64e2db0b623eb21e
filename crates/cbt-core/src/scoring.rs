//! Difficulty-weighted scoring.
//!
//! Pure functions from (questions, ledger) to scores. Each question weighs
//! `difficulty * 10`; a scope's score is `earned / max * 1000`, rounded half
//! up, or 0 for an empty scope. Everything here is integer arithmetic, so the
//! result does not depend on the order questions are visited in.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ledger::ResponseLedger;
use crate::model::{Answer, Question, QuestionKind};

/// Upper bound of a normalized score.
pub const SCORE_SCALE: u64 = 1000;

/// Earned and maximum weight for one scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectScore {
    pub earned_weight: u64,
    pub max_weight: u64,
    pub score: u32,
}

impl SubjectScore {
    fn add(&mut self, weight: u64, correct: bool) {
        self.max_weight += weight;
        if correct {
            self.earned_weight += weight;
        }
    }

    fn finish(mut self) -> Self {
        self.score = normalize(self.earned_weight, self.max_weight);
        self
    }
}

/// Total and per-subject scores for one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreCard {
    pub total: u32,
    pub earned_weight: u64,
    pub max_weight: u64,
    pub subjects: BTreeMap<String, SubjectScore>,
}

impl ScoreCard {
    /// Subject name → normalized score.
    pub fn subject_scores(&self) -> BTreeMap<String, u32> {
        self.subjects
            .iter()
            .map(|(name, s)| (name.clone(), s.score))
            .collect()
    }
}

/// How a single question was judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Correct,
    Incorrect,
    Unanswered,
}

/// One line of the answer review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionReview {
    pub question_id: String,
    pub subject: String,
    pub weight: u64,
    pub outcome: Outcome,
    pub flagged: bool,
}

/// `round(earned / max * 1000)` with half-up rounding; 0 when `max` is 0.
pub fn normalize(earned: u64, max: u64) -> u32 {
    if max == 0 {
        return 0;
    }
    let earned = earned.min(max);
    let scaled = (2 * earned * SCORE_SCALE + max) / (2 * max);
    // scaled <= SCORE_SCALE, so this cannot truncate
    scaled as u32
}

/// Whether `answer` is correct for `question`. A missing answer is incorrect.
pub fn is_correct(question: &Question, answer: Option<&Answer>) -> bool {
    let Some(answer) = answer else {
        return false;
    };
    match (&question.kind, answer) {
        (QuestionKind::SingleChoice { correct, .. }, Answer::Choice(chosen)) => chosen == correct,
        (QuestionKind::MultiStatement { statements }, Answer::Statements(values)) => {
            !statements.is_empty()
                && statements
                    .iter()
                    .enumerate()
                    .all(|(i, s)| values.get(i) == Some(&Some(s.correct)))
        }
        (QuestionKind::FreeText { correct }, Answer::Text(text)) => {
            text.trim().to_lowercase() == correct.trim().to_lowercase()
        }
        _ => false,
    }
}

/// Score `questions` against `ledger`.
pub fn score<'a>(
    questions: impl IntoIterator<Item = &'a Question>,
    ledger: &ResponseLedger,
) -> ScoreCard {
    let mut total = SubjectScore::default();
    let mut subjects: BTreeMap<String, SubjectScore> = BTreeMap::new();

    for question in questions {
        let weight = question.weight();
        let correct = is_correct(question, ledger.answer(&question.id));
        total.add(weight, correct);
        subjects
            .entry(question.subject.clone())
            .or_default()
            .add(weight, correct);
    }

    let total = total.finish();
    ScoreCard {
        total: total.score,
        earned_weight: total.earned_weight,
        max_weight: total.max_weight,
        subjects: subjects
            .into_iter()
            .map(|(name, s)| (name, s.finish()))
            .collect(),
    }
}

/// Per-question outcomes, in the order given.
pub fn review<'a>(
    questions: impl IntoIterator<Item = &'a Question>,
    ledger: &ResponseLedger,
) -> Vec<QuestionReview> {
    questions
        .into_iter()
        .map(|q| {
            let answer = ledger.answer(&q.id);
            let outcome = match answer {
                None => Outcome::Unanswered,
                Some(a) if is_correct(q, Some(a)) => Outcome::Correct,
                Some(_) => Outcome::Incorrect,
            };
            QuestionReview {
                question_id: q.id.clone(),
                subject: q.subject.clone(),
                weight: q.weight(),
                outcome,
                flagged: ledger.is_flagged(&q.id),
            }
        })
        .collect()
}
