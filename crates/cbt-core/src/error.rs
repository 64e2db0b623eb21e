//! Error types for the exam engine.
//!
//! `StoreError` covers persistence failures from both the device-local and the
//! remote store; `ExamError` covers everything the session controller can
//! reject or fail on.

use thiserror::Error;

/// Errors that can occur when reading or writing a session store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The requested record does not exist.
    #[error("record not found")]
    NotFound,

    /// The store could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// The remote API returned an error response.
    #[error("remote error (HTTP {status}): {message}")]
    Http { status: u16, message: String },

    /// The request timed out.
    #[error("request timed out after {0}s")]
    Timeout(u64),

    /// A record could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A filesystem operation failed.
    #[error("io error: {0}")]
    Io(String),
}

impl StoreError {
    /// Returns `true` if retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Connection(_) | StoreError::Timeout(_) | StoreError::Io(_) => true,
            StoreError::Http { status, .. } => *status == 429 || *status >= 500,
            StoreError::NotFound | StoreError::Serialization(_) => false,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// Errors surfaced by the session controller.
#[derive(Debug, Error)]
pub enum ExamError {
    /// The package has no sections.
    #[error("exam package has no sections")]
    EmptyPackage,

    /// A section that must be entered has no questions.
    #[error("section '{section_id}' has no questions")]
    EmptySection { section_id: String },

    /// The first section has no question a candidate could answer.
    #[error("first section has no answerable question")]
    NoAnswerableQuestion,

    /// The user tried to submit before answering every question.
    #[error("section incomplete: {answered}/{total} questions answered")]
    SectionIncomplete { answered: usize, total: usize },

    /// A persisted session points past the package's last section.
    #[error("section index {0} does not exist in this package")]
    UnknownSection(usize),

    /// The question is not part of the current section.
    #[error("question '{0}' is not in the current section")]
    UnknownQuestion(String),

    /// The answer shape does not match the question type.
    #[error("answer for question '{question_id}' does not match its type ({expected})")]
    AnswerShapeMismatch {
        question_id: String,
        expected: &'static str,
    },

    /// The requested operation is not allowed in the current state.
    #[error("cannot {action} while {state}")]
    InvalidTransition { state: String, action: &'static str },

    /// A session exists for a different package than the one requested.
    #[error("an attempt for package '{active}' is still in progress")]
    SessionPackageMismatch { active: String },

    /// Writing the result failed; the attempt is kept and finalize can be retried.
    #[error("failed to persist result, finalize can be retried: {0}")]
    Finalize(#[source] StoreError),

    /// A persistence failure that could not be recovered locally.
    #[error(transparent)]
    Persistence(#[from] StoreError),
}

impl ExamError {
    /// Returns `true` for content problems that must block entry into the exam.
    pub fn is_content_error(&self) -> bool {
        matches!(
            self,
            ExamError::EmptyPackage
                | ExamError::EmptySection { .. }
                | ExamError::NoAnswerableQuestion
                | ExamError::UnknownSection(_)
        )
    }

    /// Returns `true` if the caller should offer a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExamError::Finalize(_))
    }
}
