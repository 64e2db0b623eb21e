//! Session controller: the exam attempt state machine.
//!
//! Owns the in-memory session of one user and drives it through
//! `Idle → SectionInProgress(i) → SectionSubmitting(i) → … → Finalizing → Completed`.
//! Every transition goes through [`ExamState::next`]; anything not listed
//! there is rejected with [`ExamError::InvalidTransition`].

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::ExamError;
use crate::model::{Answer, ExamPackage, ExamResult, Section, Session};
use crate::persistence::SessionPersistence;
use crate::scoring;
use crate::timer::{timer_key, TickOutcome, TimerEngine, TimerPolicy};
use crate::traits::{LocalStore, PackageCatalog, RemoteStore};

/// Where an attempt currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExamState {
    Idle,
    SectionInProgress(usize),
    SectionSubmitting(usize),
    Finalizing,
    Completed,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Begin a fresh attempt.
    Start,
    /// Re-enter a persisted attempt at the given section.
    Resume(usize),
    /// Leave the current section (user confirmed or time expired).
    Submit,
    /// Move on to the next section.
    Advance,
    /// The submitted section was the last one.
    Finish,
    /// The result was persisted.
    Persisted,
}

impl Transition {
    fn action(self) -> &'static str {
        match self {
            Transition::Start => "start an attempt",
            Transition::Resume(_) => "resume an attempt",
            Transition::Submit => "submit a section",
            Transition::Advance => "advance to the next section",
            Transition::Finish => "finish the attempt",
            Transition::Persisted => "complete the attempt",
        }
    }
}

impl ExamState {
    /// The single transition function.
    pub fn next(self, transition: Transition) -> Result<ExamState, ExamError> {
        use ExamState::*;
        match (self, transition) {
            (Idle | Completed, Transition::Start) => Ok(SectionInProgress(0)),
            (Idle, Transition::Resume(index)) => Ok(SectionInProgress(index)),
            (SectionInProgress(i), Transition::Submit) => Ok(SectionSubmitting(i)),
            (SectionSubmitting(i), Transition::Advance) => Ok(SectionInProgress(i + 1)),
            (SectionSubmitting(_), Transition::Finish) => Ok(Finalizing),
            (Finalizing, Transition::Persisted) => Ok(Completed),
            (state, transition) => Err(invalid(state, transition.action())),
        }
    }
}

impl fmt::Display for ExamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExamState::Idle => write!(f, "idle"),
            ExamState::SectionInProgress(i) => write!(f, "section {} in progress", i + 1),
            ExamState::SectionSubmitting(i) => write!(f, "submitting section {}", i + 1),
            ExamState::Finalizing => write!(f, "finalizing"),
            ExamState::Completed => write!(f, "completed"),
        }
    }
}

fn invalid(state: ExamState, action: &'static str) -> ExamError {
    ExamError::InvalidTransition {
        state: state.to_string(),
        action,
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExamEvent {
    SectionChanged {
        index: usize,
        section_id: String,
        remaining_secs: u64,
    },
    AnswerRecorded {
        question_id: String,
        answered: bool,
    },
    FlagToggled {
        question_id: String,
        flagged: bool,
    },
    TimeLowWarning {
        section_id: String,
        remaining_secs: u64,
    },
    SectionForcedSubmit {
        index: usize,
        section_id: String,
    },
    AttemptFinalized(ExamResult),
    FinalizeFailed {
        message: String,
    },
}

/// Receiver of [`ExamEvent`]s.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ExamEvent);
}

/// Event sink that drops everything.
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _: ExamEvent) {}
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Why a section is being submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitTrigger {
    UserConfirmed,
    TimeExpired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Now in the section at `index`.
    Advanced { index: usize },
    /// The attempt is complete.
    Finalized(ExamResult),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    NoActiveSession,
    Resumed { index: usize },
    /// A session exists but cannot be entered; it is left in place.
    PackageUnavailable { package_id: String, reason: String },
}

/// Result of one timer tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub timer: TickOutcome,
    /// Set when the tick expired the section and forced a submission.
    pub submitted: Option<SubmitOutcome>,
}

/// Snapshot of the current section for progress display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub section_index: usize,
    pub section_count: usize,
    pub section_title: String,
    pub answered: usize,
    pub total: usize,
    pub flagged: usize,
    pub remaining_secs: u64,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct Attempt {
    package: Arc<ExamPackage>,
    session: Session,
    timer: TimerEngine,
    /// Result id and completion time, fixed on the first finalize call.
    result_identity: Option<(Uuid, DateTime<Utc>)>,
}

/// Drives one user's exam attempt.
pub struct SessionController {
    user_id: String,
    state: ExamState,
    attempt: Option<Attempt>,
    persistence: SessionPersistence,
    local: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
    policy: TimerPolicy,
    events: Arc<dyn EventSink>,
}

impl SessionController {
    /// Create a controller. Must be called from within a tokio runtime.
    pub fn new(
        user_id: impl Into<String>,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let persistence = SessionPersistence::new(Arc::clone(&local), remote, Arc::clone(&clock));
        Self {
            user_id: user_id.into(),
            state: ExamState::Idle,
            attempt: None,
            persistence,
            local,
            clock,
            policy: TimerPolicy::default(),
            events: Arc::new(NoopSink),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_timer_policy(mut self, policy: TimerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> ExamState {
        self.state
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session(&self) -> Option<&Session> {
        self.attempt.as_ref().map(|a| &a.session)
    }

    pub fn package(&self) -> Option<&ExamPackage> {
        self.attempt.as_ref().map(|a| a.package.as_ref())
    }

    /// The section currently being worked on, if any.
    pub fn current_section(&self) -> Option<&Section> {
        let ExamState::SectionInProgress(index) = self.state else {
            return None;
        };
        self.attempt.as_ref()?.package.section(index)
    }

    pub fn persistence(&self) -> &SessionPersistence {
        &self.persistence
    }

    /// Wait for queued remote session writes.
    pub async fn flush(&self) {
        self.persistence.flush().await;
    }

    /// Begin a fresh attempt on `package`.
    ///
    /// Rejected before any session exists when the package has no sections or
    /// its first section has nothing to answer.
    pub fn start(&mut self, package: Arc<ExamPackage>) -> Result<(), ExamError> {
        let next = self.state.next(Transition::Start)?;
        check_startable(&package)?;

        // Remaining times left over from an abandoned attempt must not leak
        // into this one.
        for section in &package.sections {
            if let Err(e) = self.local.remove(&timer_key(&section.id)) {
                warn!(section = %section.id, "failed to clear stale timer: {e}");
            }
        }

        let session = Session::begin(&package.id, self.clock.now());
        self.persistence.save(&self.user_id, &session)?;

        let first = &package.sections[0];
        let timer = TimerEngine::start(
            first,
            self.policy,
            Arc::clone(&self.clock),
            Arc::clone(&self.local),
        );
        let event = ExamEvent::SectionChanged {
            index: 0,
            section_id: first.id.clone(),
            remaining_secs: timer.remaining(),
        };

        info!(user_id = %self.user_id, package = %package.id, "attempt started");
        self.attempt = Some(Attempt {
            package,
            session,
            timer,
            result_identity: None,
        });
        self.state = next;
        self.events.emit(event);
        Ok(())
    }

    /// Re-enter the user's persisted attempt, fetching its package from
    /// `catalog`.
    pub async fn resume(&mut self, catalog: &dyn PackageCatalog) -> Result<ResumeOutcome, ExamError> {
        let state = self.state;
        if state != ExamState::Idle {
            return Err(invalid(state, Transition::Resume(0).action()));
        }

        let Some(session) = self.load_unfinished().await else {
            return Ok(ResumeOutcome::NoActiveSession);
        };

        let package = match catalog.fetch_package(&session.package_id).await {
            Ok(Some(package)) => Arc::new(package),
            Ok(None) => {
                warn!(package = %session.package_id, "package of active session not found");
                return Ok(ResumeOutcome::PackageUnavailable {
                    package_id: session.package_id,
                    reason: "package not found".into(),
                });
            }
            Err(e) => {
                warn!(package = %session.package_id, "failed to fetch package: {e:#}");
                return Ok(ResumeOutcome::PackageUnavailable {
                    package_id: session.package_id,
                    reason: format!("{e:#}"),
                });
            }
        };

        match self.hydrate(package, session) {
            Ok(index) => Ok(ResumeOutcome::Resumed { index }),
            Err((package_id, e)) if e.is_content_error() => {
                warn!(package = %package_id, "active session cannot be resumed: {e}");
                Ok(ResumeOutcome::PackageUnavailable {
                    package_id,
                    reason: e.to_string(),
                })
            }
            Err((_, e)) => Err(e),
        }
    }

    /// Resume the user's attempt on `package` if one is active, otherwise
    /// start a fresh one. Returns the section index entered.
    pub async fn open(&mut self, package: Arc<ExamPackage>) -> Result<usize, ExamError> {
        let state = self.state;
        if state != ExamState::Idle {
            return Err(invalid(state, Transition::Start.action()));
        }

        match self.load_unfinished().await {
            Some(session) if session.package_id != package.id => {
                Err(ExamError::SessionPackageMismatch {
                    active: session.package_id,
                })
            }
            Some(session) => self.hydrate(package, session).map_err(|(_, e)| e),
            None => self.start(package).map(|()| 0),
        }
    }

    /// Load the persisted session, discarding the leftover record of an
    /// attempt that was already finalized.
    async fn load_unfinished(&self) -> Option<Session> {
        let session = self.persistence.load(&self.user_id).await?;
        if !session.is_finished {
            return Some(session);
        }
        debug!(package = %session.package_id, "removing record of finished attempt");
        if let Err(e) = self.persistence.clear(&self.user_id, &session).await {
            warn!("failed to remove finished session record: {e}");
        }
        None
    }

    fn hydrate(
        &mut self,
        package: Arc<ExamPackage>,
        session: Session,
    ) -> Result<usize, (String, ExamError)> {
        let index = session.current_section_index;
        let fail = |e: ExamError| (session.package_id.clone(), e);

        if package.sections.is_empty() {
            return Err(fail(ExamError::EmptyPackage));
        }
        let section = package
            .section(index)
            .ok_or_else(|| fail(ExamError::UnknownSection(index)))?;
        if section.questions.is_empty() {
            return Err(fail(ExamError::EmptySection {
                section_id: section.id.clone(),
            }));
        }
        let next = self
            .state
            .next(Transition::Resume(index))
            .map_err(fail)?;

        let timer = TimerEngine::start(
            section,
            self.policy,
            Arc::clone(&self.clock),
            Arc::clone(&self.local),
        );
        let event = ExamEvent::SectionChanged {
            index,
            section_id: section.id.clone(),
            remaining_secs: timer.remaining(),
        };

        info!(
            user_id = %self.user_id,
            package = %package.id,
            section = index,
            remaining = timer.remaining(),
            "attempt resumed"
        );
        self.attempt = Some(Attempt {
            package,
            session,
            timer,
            result_identity: None,
        });
        self.state = next;
        self.events.emit(event);
        Ok(index)
    }

    /// Record (or clear, with `None`) the answer to a question of the
    /// current section. The flag is kept as is.
    pub fn record_answer(
        &mut self,
        question_id: &str,
        answer: Option<Answer>,
    ) -> Result<(), ExamError> {
        const ACTION: &str = "record an answer";
        let state = self.state;
        let ExamState::SectionInProgress(index) = state else {
            return Err(invalid(state, ACTION));
        };
        let attempt = self.attempt.as_mut().ok_or_else(|| invalid(state, ACTION))?;
        let question = attempt
            .package
            .section(index)
            .and_then(|s| s.question(question_id))
            .ok_or_else(|| ExamError::UnknownQuestion(question_id.to_string()))?;

        if let Some(answer) = &answer {
            if !answer.fits(&question.kind) {
                return Err(ExamError::AnswerShapeMismatch {
                    question_id: question_id.to_string(),
                    expected: question.kind.label(),
                });
            }
        }

        let flagged = attempt.session.responses.is_flagged(question_id);
        let answered = attempt
            .session
            .responses
            .record(question_id, answer, flagged)
            .is_answered();
        save(&self.persistence, &self.user_id, &attempt.session);

        debug!(question = question_id, answered, "answer recorded");
        self.events.emit(ExamEvent::AnswerRecorded {
            question_id: question_id.to_string(),
            answered,
        });
        Ok(())
    }

    /// Flip the review flag of a question of the current section. Returns the
    /// new flag value.
    pub fn toggle_flag(&mut self, question_id: &str) -> Result<bool, ExamError> {
        const ACTION: &str = "flag a question";
        let state = self.state;
        let ExamState::SectionInProgress(index) = state else {
            return Err(invalid(state, ACTION));
        };
        let attempt = self.attempt.as_mut().ok_or_else(|| invalid(state, ACTION))?;
        if attempt
            .package
            .section(index)
            .and_then(|s| s.question(question_id))
            .is_none()
        {
            return Err(ExamError::UnknownQuestion(question_id.to_string()));
        }

        let responses = &mut attempt.session.responses;
        let flagged = !responses.is_flagged(question_id);
        let answer = responses.get(question_id).and_then(|r| r.answer.clone());
        responses.record(question_id, answer, flagged);
        save(&self.persistence, &self.user_id, &attempt.session);

        self.events.emit(ExamEvent::FlagToggled {
            question_id: question_id.to_string(),
            flagged,
        });
        Ok(flagged)
    }

    /// Advance the section timer. Expiry forces submission of the section.
    ///
    /// Returns `None` when no section is in progress.
    pub async fn tick(&mut self) -> Result<Option<TickReport>, ExamError> {
        let ExamState::SectionInProgress(index) = self.state else {
            return Ok(None);
        };
        let Some(attempt) = self.attempt.as_mut() else {
            return Ok(None);
        };

        let outcome = attempt.timer.tick();
        let section_id = attempt.timer.section_id().to_string();

        if outcome.low_time {
            info!(section = %section_id, remaining = outcome.remaining, "time running low");
            self.events.emit(ExamEvent::TimeLowWarning {
                section_id: section_id.clone(),
                remaining_secs: outcome.remaining,
            });
        }

        if !outcome.expired {
            return Ok(Some(TickReport {
                timer: outcome,
                submitted: None,
            }));
        }

        info!(section = %section_id, "section time expired, forcing submission");
        self.events
            .emit(ExamEvent::SectionForcedSubmit { index, section_id });
        let submitted = self.submit(SubmitTrigger::TimeExpired).await?;
        Ok(Some(TickReport {
            timer: outcome,
            submitted: Some(submitted),
        }))
    }

    /// Submit the current section on the user's request. Allowed only once
    /// every question of the section is answered.
    pub async fn submit_section(&mut self) -> Result<SubmitOutcome, ExamError> {
        self.submit(SubmitTrigger::UserConfirmed).await
    }

    async fn submit(&mut self, trigger: SubmitTrigger) -> Result<SubmitOutcome, ExamError> {
        let state = self.state;
        let action = Transition::Submit.action();
        let ExamState::SectionInProgress(index) = state else {
            return Err(invalid(state, action));
        };
        let attempt = self.attempt.as_mut().ok_or_else(|| invalid(state, action))?;
        let package = Arc::clone(&attempt.package);
        let section = package
            .section(index)
            .ok_or(ExamError::UnknownSection(index))?;

        if trigger == SubmitTrigger::UserConfirmed {
            let total = section.questions.len();
            let answered = attempt
                .session
                .responses
                .count_answered(section.question_ids());
            if answered < total {
                return Err(ExamError::SectionIncomplete { answered, total });
            }
        }

        self.state = state.next(Transition::Submit)?;
        info!(section = %section.id, ?trigger, "section submitted");

        let Some(next_section) = package.section(index + 1) else {
            // Until the result is stored, a reload lands on an expired
            // section and is submitted again on its first tick.
            attempt.timer.persist_exhausted();
            self.state = self.state.next(Transition::Finish)?;
            return self.finalize().await;
        };
        attempt.timer.clear_persisted();

        attempt.session.current_section_index = index + 1;
        attempt.session.section_started_at = self.clock.now();
        if let Err(e) = self.local.remove(&timer_key(&next_section.id)) {
            warn!(section = %next_section.id, "failed to clear timer: {e}");
        }
        attempt.timer.ensure_section(next_section);
        self.state = self.state.next(Transition::Advance)?;
        save(&self.persistence, &self.user_id, &attempt.session);

        self.events.emit(ExamEvent::SectionChanged {
            index: index + 1,
            section_id: next_section.id.clone(),
            remaining_secs: attempt.timer.remaining(),
        });
        Ok(SubmitOutcome::Advanced { index: index + 1 })
    }

    /// Score the attempt and persist its result.
    ///
    /// Entered automatically after the last section; call again to retry
    /// after a [`ExamError::Finalize`] failure. Retries reuse the same result
    /// id, so a result that did reach the remote store is not duplicated.
    pub async fn finalize(&mut self) -> Result<SubmitOutcome, ExamError> {
        let state = self.state;
        let action = Transition::Persisted.action();
        if state != ExamState::Finalizing {
            return Err(invalid(state, action));
        }
        let attempt = self.attempt.as_mut().ok_or_else(|| invalid(state, action))?;

        let now = self.clock.now();
        let (id, completed_at) = *attempt
            .result_identity
            .get_or_insert_with(|| (Uuid::new_v4(), now));
        let card = scoring::score(attempt.package.all_questions(), &attempt.session.responses);
        let result = ExamResult {
            id,
            user_id: self.user_id.clone(),
            package_id: attempt.package.id.clone(),
            package_title: attempt.package.title.clone(),
            completed_at,
            total_score: card.total,
            subject_scores: card.subject_scores(),
            responses: attempt.session.responses.clone(),
        };

        if let Err(e) = self.persistence.remote().insert_result(&result).await {
            error!(result_id = %id, "failed to persist result: {e}");
            self.events.emit(ExamEvent::FinalizeFailed {
                message: e.to_string(),
            });
            return Err(ExamError::Finalize(e));
        }

        attempt.timer.clear_persisted();
        attempt.session.is_finished = true;
        save(&self.persistence, &self.user_id, &attempt.session);
        if let Err(e) = self.persistence.clear(&self.user_id, &attempt.session).await {
            warn!("result saved but session record not fully cleared: {e}");
        }

        self.state = state.next(Transition::Persisted)?;
        info!(
            result_id = %id,
            total = result.total_score,
            "attempt finalized"
        );
        self.events.emit(ExamEvent::AttemptFinalized(result.clone()));
        Ok(SubmitOutcome::Finalized(result))
    }

    /// Progress through the current section.
    pub fn progress(&self) -> Option<Progress> {
        let ExamState::SectionInProgress(index) = self.state else {
            return None;
        };
        let attempt = self.attempt.as_ref()?;
        let section = attempt.package.section(index)?;
        let responses = &attempt.session.responses;
        Some(Progress {
            section_index: index,
            section_count: attempt.package.sections.len(),
            section_title: section.title.clone(),
            answered: responses.count_answered(section.question_ids()),
            total: section.questions.len(),
            flagged: responses.count_flagged(section.question_ids()),
            remaining_secs: attempt.timer.remaining(),
        })
    }
}

impl fmt::Debug for SessionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionController")
            .field("user_id", &self.user_id)
            .field("state", &self.state)
            .field("session", &self.session())
            .finish_non_exhaustive()
    }
}

/// The first section must exist and contain something answerable.
fn check_startable(package: &ExamPackage) -> Result<(), ExamError> {
    let first = package.section(0).ok_or(ExamError::EmptyPackage)?;
    if first.questions.is_empty() {
        return Err(ExamError::EmptySection {
            section_id: first.id.clone(),
        });
    }
    if !first.questions.iter().any(|q| q.kind.is_answerable()) {
        return Err(ExamError::NoAnswerableQuestion);
    }
    Ok(())
}

/// Save, logging instead of failing: the in-memory session stays
/// authoritative for this context.
fn save(persistence: &SessionPersistence, user_id: &str, session: &Session) {
    if let Err(e) = persistence.save(user_id, session) {
        warn!(user_id, "failed to save session locally: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fakes::{MemoryLocalStore, MemoryRemoteStore, RecordingSink, StaticCatalog};
    use crate::model::{Choice, Difficulty, Question, QuestionKind, Statement};
    use crate::persistence::SESSION_KEY;

    fn question(id: &str, subject: &str, difficulty: u8, kind: QuestionKind) -> Question {
        Question {
            id: id.into(),
            subject: subject.into(),
            difficulty: Difficulty::new(difficulty).unwrap(),
            text: format!("question {id}"),
            passage: None,
            image_url: None,
            explanation: String::new(),
            kind,
        }
    }

    fn single(correct: &str) -> QuestionKind {
        QuestionKind::SingleChoice {
            choices: vec![
                Choice {
                    id: "A".into(),
                    text: "a".into(),
                },
                Choice {
                    id: "B".into(),
                    text: "b".into(),
                },
            ],
            correct: correct.into(),
        }
    }

    fn package() -> ExamPackage {
        ExamPackage {
            id: "tryout".into(),
            title: "Tryout".into(),
            sections: vec![
                Section {
                    id: "s1".into(),
                    title: "Quant".into(),
                    duration_minutes: 1,
                    questions: vec![
                        question("q1", "Math", 1, single("A")),
                        question(
                            "q2",
                            "Math",
                            3,
                            QuestionKind::MultiStatement {
                                statements: vec![
                                    Statement {
                                        id: "a".into(),
                                        text: "a".into(),
                                        correct: true,
                                    },
                                    Statement {
                                        id: "b".into(),
                                        text: "b".into(),
                                        correct: false,
                                    },
                                ],
                            },
                        ),
                    ],
                },
                Section {
                    id: "s2".into(),
                    title: "Verbal".into(),
                    duration_minutes: 10,
                    questions: vec![question(
                        "q3",
                        "Language",
                        5,
                        QuestionKind::FreeText {
                            correct: "Jakarta".into(),
                        },
                    )],
                },
            ],
        }
    }

    struct Fixture {
        local: Arc<MemoryLocalStore>,
        remote: Arc<MemoryRemoteStore>,
        clock: Arc<ManualClock>,
        sink: Arc<RecordingSink>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                local: Arc::new(MemoryLocalStore::new()),
                remote: Arc::new(MemoryRemoteStore::new()),
                clock: Arc::new(ManualClock::default()),
                sink: Arc::new(RecordingSink::new()),
            }
        }

        fn controller(&self) -> SessionController {
            SessionController::new(
                "u1",
                self.local.clone(),
                self.remote.clone(),
                self.clock.clone(),
            )
            .with_events(self.sink.clone())
        }
    }

    fn answer_section_one(c: &mut SessionController) {
        c.record_answer("q1", Some(Answer::Choice("A".into()))).unwrap();
        c.record_answer("q2", Some(Answer::Statements(vec![Some(true), Some(false)])))
            .unwrap();
    }

    #[test]
    fn transition_table() {
        use ExamState::*;
        assert_eq!(Idle.next(Transition::Start).unwrap(), SectionInProgress(0));
        assert_eq!(
            Idle.next(Transition::Resume(2)).unwrap(),
            SectionInProgress(2)
        );
        assert_eq!(
            SectionInProgress(1).next(Transition::Submit).unwrap(),
            SectionSubmitting(1)
        );
        assert_eq!(
            SectionSubmitting(1).next(Transition::Advance).unwrap(),
            SectionInProgress(2)
        );
        assert_eq!(
            SectionSubmitting(1).next(Transition::Finish).unwrap(),
            Finalizing
        );
        assert_eq!(Finalizing.next(Transition::Persisted).unwrap(), Completed);

        assert!(Completed.next(Transition::Submit).is_err());
        assert!(Finalizing.next(Transition::Submit).is_err());
        assert!(SectionInProgress(0).next(Transition::Start).is_err());
        assert!(Idle.next(Transition::Persisted).is_err());
        let err = Completed.next(Transition::Submit).unwrap_err();
        assert_eq!(err.to_string(), "cannot submit a section while completed");
    }

    #[tokio::test]
    async fn start_rejects_unusable_packages() {
        let f = Fixture::new();
        let mut c = f.controller();

        let mut empty = package();
        empty.sections.clear();
        assert!(matches!(
            c.start(Arc::new(empty)),
            Err(ExamError::EmptyPackage)
        ));

        let mut no_questions = package();
        no_questions.sections[0].questions.clear();
        assert!(matches!(
            c.start(Arc::new(no_questions)),
            Err(ExamError::EmptySection { .. })
        ));

        let mut unanswerable = package();
        unanswerable.sections[0].questions = vec![question(
            "q1",
            "Math",
            1,
            QuestionKind::SingleChoice {
                choices: vec![],
                correct: "A".into(),
            },
        )];
        assert!(matches!(
            c.start(Arc::new(unanswerable)),
            Err(ExamError::NoAnswerableQuestion)
        ));

        assert_eq!(c.state(), ExamState::Idle);
        assert!(f.local.get(SESSION_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn start_persists_new_session() {
        let f = Fixture::new();
        let mut c = f.controller();
        c.start(Arc::new(package())).unwrap();
        c.flush().await;

        assert_eq!(c.state(), ExamState::SectionInProgress(0));
        let remote = f.remote.stored_session("u1").unwrap();
        assert_eq!(remote.package_id, "tryout");
        assert_eq!(remote.current_section_index, 0);
        assert_eq!(c.progress().unwrap().remaining_secs, 60);
        assert!(matches!(
            f.sink.events().first(),
            Some(ExamEvent::SectionChanged { index: 0, .. })
        ));
    }

    #[tokio::test]
    async fn start_discards_stale_timer_values() {
        let f = Fixture::new();
        f.local.set(&timer_key("s1"), "5").unwrap();
        let mut c = f.controller();
        c.start(Arc::new(package())).unwrap();
        assert_eq!(c.progress().unwrap().remaining_secs, 60);
    }

    #[tokio::test]
    async fn answers_are_limited_to_current_section() {
        let f = Fixture::new();
        let mut c = f.controller();
        c.start(Arc::new(package())).unwrap();

        let err = c
            .record_answer("q3", Some(Answer::Text("x".into())))
            .unwrap_err();
        assert!(matches!(err, ExamError::UnknownQuestion(id) if id == "q3"));

        let err = c
            .record_answer("q1", Some(Answer::Text("A".into())))
            .unwrap_err();
        assert!(matches!(err, ExamError::AnswerShapeMismatch { .. }));
    }

    #[tokio::test]
    async fn flag_survives_answer_changes() {
        let f = Fixture::new();
        let mut c = f.controller();
        c.start(Arc::new(package())).unwrap();

        assert!(c.toggle_flag("q1").unwrap());
        c.record_answer("q1", Some(Answer::Choice("B".into()))).unwrap();
        let session = c.session().unwrap();
        assert!(session.responses.is_flagged("q1"));
        assert!(session.responses.is_answered("q1"));

        assert!(!c.toggle_flag("q1").unwrap());
        assert_eq!(c.progress().unwrap().flagged, 0);
    }

    #[tokio::test]
    async fn submission_is_gated_on_answers() {
        let f = Fixture::new();
        let mut c = f.controller();
        c.start(Arc::new(package())).unwrap();
        c.record_answer("q1", Some(Answer::Choice("A".into()))).unwrap();

        let err = c.submit_section().await.unwrap_err();
        assert!(matches!(
            err,
            ExamError::SectionIncomplete {
                answered: 1,
                total: 2
            }
        ));
        assert_eq!(c.state(), ExamState::SectionInProgress(0));

        c.record_answer("q2", Some(Answer::Statements(vec![Some(true), None])))
            .unwrap();
        f.clock.advance_secs(30);
        let outcome = c.submit_section().await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Advanced { index: 1 });
        assert_eq!(c.state(), ExamState::SectionInProgress(1));

        let session = c.session().unwrap();
        assert_eq!(session.current_section_index, 1);
        assert_eq!(session.section_started_at, f.clock.now());
        assert_eq!(c.progress().unwrap().remaining_secs, 600);
    }

    #[tokio::test]
    async fn expiry_forces_submission_of_incomplete_section() {
        let f = Fixture::new();
        let mut c = f.controller();
        c.start(Arc::new(package())).unwrap();
        c.record_answer("q1", Some(Answer::Choice("A".into()))).unwrap();

        let mut forced = None;
        for _ in 0..60 {
            f.clock.advance_secs(1);
            let report = c.tick().await.unwrap().unwrap();
            if report.timer.expired {
                forced = report.submitted;
                break;
            }
        }

        assert_eq!(forced, Some(SubmitOutcome::Advanced { index: 1 }));
        assert_eq!(c.state(), ExamState::SectionInProgress(1));
        assert_eq!(
            f.sink
                .count(|e| matches!(e, ExamEvent::SectionForcedSubmit { index: 0, .. })),
            1
        );
        assert!(f.local.get(&timer_key("s1")).unwrap().is_none());
    }

    #[tokio::test]
    async fn low_time_warning_is_emitted_once() {
        let f = Fixture::new();
        let mut c = f
            .controller()
            .with_timer_policy(TimerPolicy {
                low_time_warning_secs: 58,
                ..TimerPolicy::default()
            });
        c.start(Arc::new(package())).unwrap();

        for _ in 0..5 {
            f.clock.advance_secs(1);
            c.tick().await.unwrap();
        }
        assert_eq!(
            f.sink
                .count(|e| matches!(e, ExamEvent::TimeLowWarning { .. })),
            1
        );
    }

    #[tokio::test]
    async fn full_attempt_is_scored_and_cleared() {
        let f = Fixture::new();
        let mut c = f.controller();
        c.start(Arc::new(package())).unwrap();
        answer_section_one(&mut c);
        c.submit_section().await.unwrap();
        c.record_answer("q3", Some(Answer::Text(" jakarta ".into())))
            .unwrap();

        let SubmitOutcome::Finalized(result) = c.submit_section().await.unwrap() else {
            panic!("expected finalized attempt");
        };
        c.flush().await;

        assert_eq!(c.state(), ExamState::Completed);
        assert_eq!(result.total_score, 1000);
        assert_eq!(result.subject_scores["Math"], 1000);
        assert_eq!(result.package_title, "Tryout");
        assert_eq!(f.remote.stored_results(), vec![result.clone()]);
        assert!(f.remote.stored_session("u1").is_none());
        assert!(f.local.get(SESSION_KEY).unwrap().is_none());
        assert_eq!(
            f.sink
                .count(|e| matches!(e, ExamEvent::AttemptFinalized(_))),
            1
        );
    }

    #[tokio::test]
    async fn finalize_failure_keeps_session_for_retry() {
        let f = Fixture::new();
        let mut c = f.controller();
        c.start(Arc::new(package())).unwrap();
        answer_section_one(&mut c);
        c.submit_section().await.unwrap();
        c.record_answer("q3", Some(Answer::Text("Bandung".into())))
            .unwrap();

        f.remote.fail_next_result_inserts(1);
        let err = c.submit_section().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(c.state(), ExamState::Finalizing);
        c.flush().await;
        assert!(f.remote.stored_session("u1").is_some());
        assert!(f.local.get(SESSION_KEY).unwrap().is_some());

        f.clock.advance_secs(10);
        let SubmitOutcome::Finalized(result) = c.finalize().await.unwrap() else {
            panic!("expected finalized attempt");
        };
        assert_eq!(c.state(), ExamState::Completed);
        // 40 of 90 weight correct
        assert_eq!(result.total_score, 444);
        assert_eq!(f.remote.stored_results().len(), 1);
        c.flush().await;
        assert!(f.remote.stored_session("u1").is_none());
        assert_eq!(
            f.sink
                .count(|e| matches!(e, ExamEvent::FinalizeFailed { .. })),
            1
        );
    }

    #[tokio::test]
    async fn failed_clear_leaves_finished_record_for_cleanup() {
        let f = Fixture::new();
        {
            let mut c = f.controller();
            c.start(Arc::new(package())).unwrap();
            answer_section_one(&mut c);
            c.submit_section().await.unwrap();
            c.record_answer("q3", Some(Answer::Text("Jakarta".into())))
                .unwrap();

            f.remote.fail_next_deletes(1);
            assert!(matches!(
                c.submit_section().await.unwrap(),
                SubmitOutcome::Finalized(_)
            ));
            assert_eq!(c.state(), ExamState::Completed);
            c.flush().await;
        }
        let leftover = f.remote.stored_session("u1").unwrap();
        assert!(leftover.is_finished);

        let mut c = f.controller();
        let outcome = c.resume(&StaticCatalog::new([package()])).await.unwrap();
        assert_eq!(outcome, ResumeOutcome::NoActiveSession);
        c.flush().await;
        assert!(f.remote.stored_session("u1").is_none());
        assert!(f.local.get(SESSION_KEY).unwrap().is_none());

        // The next open starts over instead of re-entering the finished attempt.
        assert_eq!(c.open(Arc::new(package())).await.unwrap(), 0);
        assert!(c.session().unwrap().responses.is_empty());
        assert_eq!(f.remote.stored_results().len(), 1);
    }

    #[tokio::test]
    async fn unsaved_result_resumes_into_resubmission() {
        let f = Fixture::new();
        {
            let mut c = f.controller();
            c.start(Arc::new(package())).unwrap();
            answer_section_one(&mut c);
            c.submit_section().await.unwrap();
            c.record_answer("q3", Some(Answer::Text("Jakarta".into())))
                .unwrap();

            f.remote.fail_next_result_inserts(1);
            assert!(c.submit_section().await.unwrap_err().is_retryable());
            c.flush().await;
        }
        assert_eq!(f.local.get(&timer_key("s2")).unwrap().as_deref(), Some("0"));

        let mut c = f.controller();
        let outcome = c.resume(&StaticCatalog::new([package()])).await.unwrap();
        assert_eq!(outcome, ResumeOutcome::Resumed { index: 1 });
        assert_eq!(c.progress().unwrap().remaining_secs, 0);

        let report = c.tick().await.unwrap().unwrap();
        let Some(SubmitOutcome::Finalized(result)) = report.submitted else {
            panic!("expected the attempt to be finalized");
        };
        assert_eq!(result.total_score, 1000);
        assert!(f.local.get(&timer_key("s2")).unwrap().is_none());
    }

    #[tokio::test]
    async fn completed_attempt_rejects_mutation() {
        let f = Fixture::new();
        let mut c = f.controller();
        c.start(Arc::new(package())).unwrap();
        answer_section_one(&mut c);
        c.submit_section().await.unwrap();
        c.record_answer("q3", Some(Answer::Text("x".into()))).unwrap();
        c.submit_section().await.unwrap();

        assert!(matches!(
            c.record_answer("q3", None),
            Err(ExamError::InvalidTransition { .. })
        ));
        assert!(c.submit_section().await.is_err());
        assert!(c.finalize().await.is_err());
        assert!(c.tick().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resume_restores_answers_and_timer() {
        let f = Fixture::new();
        {
            let mut c = f.controller();
            c.start(Arc::new(package())).unwrap();
            c.record_answer("q1", Some(Answer::Choice("B".into()))).unwrap();
            c.toggle_flag("q2").unwrap();
            for _ in 0..10 {
                f.clock.advance_secs(1);
                c.tick().await.unwrap();
            }
            c.flush().await;
        }

        let catalog = StaticCatalog::new([package()]);
        let mut c = f.controller();
        let outcome = c.resume(&catalog).await.unwrap();
        assert_eq!(outcome, ResumeOutcome::Resumed { index: 0 });
        assert_eq!(c.state(), ExamState::SectionInProgress(0));

        let progress = c.progress().unwrap();
        assert_eq!(progress.remaining_secs, 50);
        assert_eq!(progress.answered, 1);
        assert_eq!(progress.flagged, 1);
    }

    #[tokio::test]
    async fn resume_without_session() {
        let f = Fixture::new();
        let mut c = f.controller();
        let outcome = c.resume(&StaticCatalog::default()).await.unwrap();
        assert_eq!(outcome, ResumeOutcome::NoActiveSession);
        assert_eq!(c.state(), ExamState::Idle);
    }

    #[tokio::test]
    async fn resume_discards_finished_record() {
        let f = Fixture::new();
        let mut finished = Session::begin("tryout", f.clock.now());
        finished.is_finished = true;
        f.remote.seed_session("u1", finished, f.clock.now());

        let mut c = f.controller();
        let outcome = c.resume(&StaticCatalog::new([package()])).await.unwrap();
        assert_eq!(outcome, ResumeOutcome::NoActiveSession);
        assert!(f.remote.stored_session("u1").is_none());
    }

    #[tokio::test]
    async fn resume_with_missing_package_is_safe() {
        let f = Fixture::new();
        f.remote
            .seed_session("u1", Session::begin("gone", f.clock.now()), f.clock.now());

        let mut c = f.controller();
        let outcome = c.resume(&StaticCatalog::default()).await.unwrap();
        assert!(matches!(
            outcome,
            ResumeOutcome::PackageUnavailable { ref package_id, .. } if package_id == "gone"
        ));
        assert_eq!(c.state(), ExamState::Idle);
        assert!(f.remote.stored_session("u1").is_some());
    }

    #[tokio::test]
    async fn open_refuses_other_package() {
        let f = Fixture::new();
        f.remote
            .seed_session("u1", Session::begin("other", f.clock.now()), f.clock.now());

        let mut c = f.controller();
        let err = c.open(Arc::new(package())).await.unwrap_err();
        assert!(matches!(err, ExamError::SessionPackageMismatch { active } if active == "other"));
    }

    #[tokio::test]
    async fn open_resumes_or_starts() {
        let f = Fixture::new();
        let mut first = f.controller();
        assert_eq!(first.open(Arc::new(package())).await.unwrap(), 0);
        answer_section_one(&mut first);
        first.submit_section().await.unwrap();
        first.flush().await;

        let mut second = f.controller();
        assert_eq!(second.open(Arc::new(package())).await.unwrap(), 1);
        assert!(second.session().unwrap().responses.is_answered("q2"));
    }

    #[tokio::test]
    async fn answer_in_expiring_tick_is_scored() {
        let f = Fixture::new();
        {
            let mut c = f.controller();
            c.start(Arc::new(package())).unwrap();
            answer_section_one(&mut c);
            c.submit_section().await.unwrap();
            c.flush().await;
        }
        f.local.set(&timer_key("s2"), "1").unwrap();

        let mut c = f.controller();
        let outcome = c.resume(&StaticCatalog::new([package()])).await.unwrap();
        assert_eq!(outcome, ResumeOutcome::Resumed { index: 1 });
        c.record_answer("q3", Some(Answer::Text("Jakarta".into())))
            .unwrap();
        f.clock.advance_secs(1);

        let report = c.tick().await.unwrap().unwrap();
        assert!(report.timer.expired);
        let Some(SubmitOutcome::Finalized(result)) = report.submitted else {
            panic!("expected forced finalization");
        };
        assert_eq!(result.total_score, 1000);
        assert_eq!(c.state(), ExamState::Completed);
    }
}
