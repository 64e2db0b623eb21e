//! The response ledger: question id → latest response for one attempt.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{Answer, Response};

/// Append/overwrite store of responses, keyed by question id.
///
/// The ledger does not know which section a question belongs to and does not
/// validate answer shapes; the session controller does that before recording.
/// Entries are kept ordered by id so serialized sessions are byte-stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseLedger {
    entries: BTreeMap<String, Response>,
}

impl ResponseLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the response for `question_id`.
    pub fn record(
        &mut self,
        question_id: impl Into<String>,
        answer: Option<Answer>,
        flagged: bool,
    ) -> &Response {
        let question_id = question_id.into();
        let response = Response {
            question_id: question_id.clone(),
            answer,
            flagged,
        };
        self.entries.insert(question_id.clone(), response);
        &self.entries[&question_id]
    }

    pub fn get(&self, question_id: &str) -> Option<&Response> {
        self.entries.get(question_id)
    }

    /// The recorded answer, if one exists and is not blank.
    pub fn answer(&self, question_id: &str) -> Option<&Answer> {
        self.entries
            .get(question_id)
            .and_then(|r| r.answer.as_ref())
            .filter(|a| !a.is_blank())
    }

    pub fn is_answered(&self, question_id: &str) -> bool {
        self.answer(question_id).is_some()
    }

    pub fn is_flagged(&self, question_id: &str) -> bool {
        self.entries.get(question_id).is_some_and(|r| r.flagged)
    }

    /// Number of ids in `question_ids` that have a non-blank answer.
    pub fn count_answered<'a>(&self, question_ids: impl IntoIterator<Item = &'a str>) -> usize {
        question_ids
            .into_iter()
            .filter(|id| self.is_answered(id))
            .count()
    }

    /// Number of ids in `question_ids` marked for review.
    pub fn count_flagged<'a>(&self, question_ids: impl IntoIterator<Item = &'a str>) -> usize {
        question_ids
            .into_iter()
            .filter(|id| self.is_flagged(id))
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Response> {
        self.entries.values()
    }
}
