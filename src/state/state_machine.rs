use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

/// Question currently open for answers, together with its answer window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveQuestion {
    /// Position of the question in the quiz order.
    pub index: usize,
    /// Identifier of the question being served.
    pub question_id: Uuid,
    /// Moment the answer window opened.
    pub opened_at: Instant,
    /// Length of the answer window.
    pub duration: Duration,
}

impl ActiveQuestion {
    /// Instant at which the answer window closes on its own.
    pub fn deadline(&self) -> Instant {
        self.opened_at + self.duration
    }

    /// Time left in the answer window as seen at `now`.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline().saturating_duration_since(now)
    }
}

/// Phases a live session moves through.
///
/// Phase data carries the question position, so a reader always sees the phase
/// and its question together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    /// Admin connected, players may join. `next_index` is the next question to serve.
    Waiting { next_index: usize },
    /// Start requested; the roster is being checked.
    Starting { next_index: usize },
    /// Short synchronisation delay before question `index` opens.
    CountdownToQuestion { index: usize },
    /// Answer window open.
    QuestionActive(ActiveQuestion),
    /// Answer window closed, results are being shown.
    Scoring { index: usize, question_id: Uuid },
    /// Terminal.
    Ended(EndReason),
}

impl SessionPhase {
    /// Whether the session reached its terminal phase.
    pub fn is_ended(&self) -> bool {
        matches!(self, SessionPhase::Ended(_))
    }

    /// Number of leading questions whose answer window has already closed.
    pub fn closed_questions(&self) -> usize {
        match self {
            SessionPhase::Waiting { next_index } | SessionPhase::Starting { next_index } => {
                *next_index
            }
            SessionPhase::CountdownToQuestion { index } => *index,
            SessionPhase::QuestionActive(active) => active.index,
            SessionPhase::Scoring { index, .. } => index + 1,
            SessionPhase::Ended(_) => usize::MAX,
        }
    }
}

/// Why the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Every question has been served and scored.
    QuizCompleted,
    /// The admin terminated the session.
    AdminTerminated,
}

/// Why an answer window closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The question timer elapsed.
    Timeout,
    /// The admin forced the window closed.
    ForceSkip,
    /// A pending skip request was satisfied by the last outstanding answer.
    AllAnswered,
}

/// Events that can be applied to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Admin asked to start the quiz.
    RequestStart,
    /// The start was refused (no players registered).
    RefuseStart,
    /// Begin the countdown to question `index`.
    BeginCountdown { index: usize },
    /// Open the answer window of a question.
    OpenQuestion(ActiveQuestion),
    /// Close the current answer window.
    CloseQuestion(CloseReason),
    /// End the session.
    Finish(EndReason),
}

/// Error returned when attempting to apply an invalid transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// The phase the state machine was in when the invalid event was received.
    pub from: SessionPhase,
    /// The event that cannot be applied from this phase.
    pub event: SessionEvent,
}

/// Errors that can occur when planning a state machine transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// A transition is already pending and must be applied or aborted.
    AlreadyPending,
    /// The requested transition is not valid from the current phase.
    InvalidTransition(InvalidTransition),
}

/// Errors that can occur when applying a planned state machine transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// No transition is currently pending.
    NoPending,
    /// Plan ID does not match the pending plan.
    IdMismatch {
        /// Expected plan ID.
        expected: PlanId,
        /// Provided plan ID.
        got: PlanId,
    },
    /// State machine phase changed since the plan was created.
    PhaseMismatch {
        /// Phase when plan was created.
        expected: SessionPhase,
        /// Current phase.
        actual: SessionPhase,
    },
}

/// Errors that can occur when aborting a planned state machine transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortError {
    /// No transition is currently pending.
    NoPending,
    /// Plan ID does not match the pending plan.
    IdMismatch {
        /// Expected plan ID.
        expected: PlanId,
        /// Provided plan ID.
        got: PlanId,
    },
}

/// Unique identifier for a planned state transition.
pub type PlanId = Uuid;

/// A planned state machine transition that has been validated but not yet applied.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Unique identifier for this plan.
    pub id: PlanId,
    /// Phase the state machine is currently in.
    pub from: SessionPhase,
    /// Phase the state machine will transition to.
    pub to: SessionPhase,
    /// Event that triggered this transition.
    pub event: SessionEvent,
}

/// State machine for one live session.
///
/// The version increases on every applied transition; timers capture it when
/// they are scheduled and only fire if nothing moved in between.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    phase: SessionPhase,
    version: u64,
    question_count: usize,
    pending: Option<Plan>,
}

impl SessionStateMachine {
    /// Create a machine in `Waiting` for a quiz of `question_count` questions.
    pub fn new(question_count: usize) -> Self {
        Self::resume_at(question_count, 0)
    }

    /// Create a machine in `Waiting` that will serve `next_index` first.
    pub fn resume_at(question_count: usize, next_index: usize) -> Self {
        Self {
            phase: SessionPhase::Waiting { next_index },
            version: 0,
            question_count,
            pending: None,
        }
    }

    /// Inspect the current phase.
    pub fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    /// Number of applied transitions.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of questions the session serves.
    pub fn question_count(&self) -> usize {
        self.question_count
    }

    /// Plan a transition by validating that the event can be applied from the current phase.
    pub fn plan(&mut self, event: SessionEvent) -> Result<Plan, PlanError> {
        if self.pending.is_some() {
            return Err(PlanError::AlreadyPending);
        }

        let next = self
            .compute_transition(event.clone())
            .map_err(PlanError::InvalidTransition)?;

        let plan = Plan {
            id: Uuid::new_v4(),
            from: self.phase.clone(),
            to: next,
            event,
        };
        self.pending = Some(plan.clone());
        Ok(plan)
    }

    /// Apply a planned transition, returning the new phase.
    pub fn apply(&mut self, plan_id: PlanId) -> Result<SessionPhase, ApplyError> {
        let plan = self.pending.take().ok_or(ApplyError::NoPending)?;

        if plan.id != plan_id {
            let expected = plan.id;
            self.pending = Some(plan);
            return Err(ApplyError::IdMismatch {
                expected,
                got: plan_id,
            });
        }

        if self.phase != plan.from {
            return Err(ApplyError::PhaseMismatch {
                expected: plan.from,
                actual: self.phase.clone(),
            });
        }

        self.phase = plan.to;
        self.version += 1;
        Ok(self.phase.clone())
    }

    /// Abort a planned transition without applying it.
    pub fn abort(&mut self, plan_id: PlanId) -> Result<(), AbortError> {
        let plan = self.pending.as_ref().ok_or(AbortError::NoPending)?;

        if plan.id != plan_id {
            return Err(AbortError::IdMismatch {
                expected: plan.id,
                got: plan_id,
            });
        }

        self.pending = None;
        Ok(())
    }

    fn compute_transition(&self, event: SessionEvent) -> Result<SessionPhase, InvalidTransition> {
        let count = self.question_count;
        let next = match (&self.phase, &event) {
            (SessionPhase::Waiting { next_index }, SessionEvent::RequestStart) => {
                SessionPhase::Starting {
                    next_index: *next_index,
                }
            }
            (SessionPhase::Starting { next_index }, SessionEvent::RefuseStart) => {
                SessionPhase::Waiting {
                    next_index: *next_index,
                }
            }
            (SessionPhase::Starting { next_index }, SessionEvent::BeginCountdown { index })
                if index == next_index && *index < count =>
            {
                SessionPhase::CountdownToQuestion { index: *index }
            }
            (SessionPhase::Scoring { index: current, .. }, SessionEvent::BeginCountdown { index })
                if *index == current + 1 && *index < count =>
            {
                SessionPhase::CountdownToQuestion { index: *index }
            }
            (SessionPhase::CountdownToQuestion { index }, SessionEvent::OpenQuestion(question))
                if question.index == *index =>
            {
                SessionPhase::QuestionActive(question.clone())
            }
            (SessionPhase::QuestionActive(question), SessionEvent::CloseQuestion(_)) => {
                SessionPhase::Scoring {
                    index: question.index,
                    question_id: question.question_id,
                }
            }
            (
                SessionPhase::Scoring { index, .. },
                SessionEvent::Finish(EndReason::QuizCompleted),
            ) if index + 1 == count => SessionPhase::Ended(EndReason::QuizCompleted),
            (phase, SessionEvent::Finish(EndReason::AdminTerminated)) if !phase.is_ended() => {
                SessionPhase::Ended(EndReason::AdminTerminated)
            }
            (from, _) => {
                return Err(InvalidTransition {
                    from: from.clone(),
                    event: event.clone(),
                });
            }
        };

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(sm: &mut SessionStateMachine, event: SessionEvent) -> SessionPhase {
        let plan = sm.plan(event).unwrap();
        sm.apply(plan.id).unwrap()
    }

    fn question(index: usize) -> ActiveQuestion {
        ActiveQuestion {
            index,
            question_id: Uuid::new_v4(),
            opened_at: Instant::now(),
            duration: Duration::from_secs(20),
        }
    }

    #[test]
    fn closed_questions_counts_finished_answer_windows() {
        let active = question(1);
        let question_id = active.question_id;
        assert_eq!(SessionPhase::Waiting { next_index: 0 }.closed_questions(), 0);
        assert_eq!(SessionPhase::Starting { next_index: 2 }.closed_questions(), 2);
        assert_eq!(SessionPhase::CountdownToQuestion { index: 1 }.closed_questions(), 1);
        assert_eq!(SessionPhase::QuestionActive(active).closed_questions(), 1);
        assert_eq!(
            SessionPhase::Scoring {
                index: 1,
                question_id
            }
            .closed_questions(),
            2
        );
    }

    #[test]
    fn initial_state_is_waiting() {
        let sm = SessionStateMachine::new(2);
        assert_eq!(sm.phase(), &SessionPhase::Waiting { next_index: 0 });
        assert_eq!(sm.version(), 0);
    }

    #[test]
    fn full_happy_path_through_quiz() {
        let mut sm = SessionStateMachine::new(2);

        apply(&mut sm, SessionEvent::RequestStart);
        assert_eq!(
            apply(&mut sm, SessionEvent::BeginCountdown { index: 0 }),
            SessionPhase::CountdownToQuestion { index: 0 }
        );
        let first = question(0);
        apply(&mut sm, SessionEvent::OpenQuestion(first.clone()));
        assert_eq!(
            apply(&mut sm, SessionEvent::CloseQuestion(CloseReason::Timeout)),
            SessionPhase::Scoring {
                index: 0,
                question_id: first.question_id
            }
        );
        apply(&mut sm, SessionEvent::BeginCountdown { index: 1 });
        apply(&mut sm, SessionEvent::OpenQuestion(question(1)));
        apply(&mut sm, SessionEvent::CloseQuestion(CloseReason::ForceSkip));
        assert_eq!(
            apply(&mut sm, SessionEvent::Finish(EndReason::QuizCompleted)),
            SessionPhase::Ended(EndReason::QuizCompleted)
        );
        assert_eq!(sm.version(), 8);
    }

    #[test]
    fn refused_start_returns_to_waiting() {
        let mut sm = SessionStateMachine::new(1);
        apply(&mut sm, SessionEvent::RequestStart);
        assert_eq!(
            apply(&mut sm, SessionEvent::RefuseStart),
            SessionPhase::Waiting { next_index: 0 }
        );
    }

    #[test]
    fn questions_are_served_strictly_in_order() {
        let mut sm = SessionStateMachine::new(3);
        apply(&mut sm, SessionEvent::RequestStart);
        assert!(sm.plan(SessionEvent::BeginCountdown { index: 1 }).is_err());

        apply(&mut sm, SessionEvent::BeginCountdown { index: 0 });
        assert!(sm.plan(SessionEvent::OpenQuestion(question(1))).is_err());
        apply(&mut sm, SessionEvent::OpenQuestion(question(0)));
        apply(&mut sm, SessionEvent::CloseQuestion(CloseReason::Timeout));

        assert!(sm.plan(SessionEvent::BeginCountdown { index: 0 }).is_err());
        assert!(sm.plan(SessionEvent::BeginCountdown { index: 2 }).is_err());
        assert!(
            sm.plan(SessionEvent::Finish(EndReason::QuizCompleted))
                .is_err()
        );
    }

    #[test]
    fn resumed_machine_starts_after_served_questions() {
        let mut sm = SessionStateMachine::resume_at(3, 2);
        apply(&mut sm, SessionEvent::RequestStart);
        assert!(sm.plan(SessionEvent::BeginCountdown { index: 0 }).is_err());
        assert_eq!(
            apply(&mut sm, SessionEvent::BeginCountdown { index: 2 }),
            SessionPhase::CountdownToQuestion { index: 2 }
        );
    }

    #[test]
    fn admin_can_terminate_from_any_live_phase_but_not_twice() {
        let mut sm = SessionStateMachine::new(1);
        apply(&mut sm, SessionEvent::RequestStart);
        apply(&mut sm, SessionEvent::BeginCountdown { index: 0 });
        apply(&mut sm, SessionEvent::OpenQuestion(question(0)));
        assert_eq!(
            apply(&mut sm, SessionEvent::Finish(EndReason::AdminTerminated)),
            SessionPhase::Ended(EndReason::AdminTerminated)
        );

        let err = sm
            .plan(SessionEvent::Finish(EndReason::AdminTerminated))
            .unwrap_err();
        assert!(matches!(err, PlanError::InvalidTransition(_)));
    }

    #[test]
    fn close_is_only_valid_while_a_question_is_open() {
        let mut sm = SessionStateMachine::new(1);
        let err = sm
            .plan(SessionEvent::CloseQuestion(CloseReason::ForceSkip))
            .unwrap_err();
        match err {
            PlanError::InvalidTransition(invalid) => {
                assert_eq!(invalid.from, SessionPhase::Waiting { next_index: 0 });
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn pending_plan_blocks_and_abort_clears_it() {
        let mut sm = SessionStateMachine::new(1);
        let plan = sm.plan(SessionEvent::RequestStart).unwrap();
        assert_eq!(
            sm.plan(SessionEvent::RequestStart).unwrap_err(),
            PlanError::AlreadyPending
        );
        sm.abort(plan.id).unwrap();
        assert!(sm.pending.is_none());
        assert_eq!(sm.phase(), &SessionPhase::Waiting { next_index: 0 });
        assert_eq!(sm.version(), 0);
    }

    #[test]
    fn remaining_time_shrinks_with_elapsed_time() {
        let active = question(0);
        let later = active.opened_at + Duration::from_secs(5);
        assert_eq!(active.remaining(later), Duration::from_secs(15));
        assert_eq!(
            active.remaining(active.opened_at + Duration::from_secs(30)),
            Duration::ZERO
        );
    }
}
