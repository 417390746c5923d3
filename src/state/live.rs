use std::collections::HashMap;

use indexmap::IndexMap;
use tokio::{
    sync::{Mutex, MutexGuard},
    task::AbortHandle,
    time::Instant,
};
use uuid::Uuid;

use crate::{
    dao::models::{ParticipationEntity, QuestionEntity, ResponseRows, SessionEntity},
    state::{
        ClientConnection,
        state_machine::{SessionPhase, SessionStateMachine},
    },
};

/// A player known to the live session, connected or not.
#[derive(Debug, Clone)]
pub struct Participant {
    pub participation_id: Uuid,
    pub user_id: Option<Uuid>,
    pub display_name: String,
    pub is_host: bool,
    /// Consecutive positively scored answers.
    pub streak: u32,
    /// Points earned while this process served the session.
    pub total_score: i64,
    /// Live socket, `None` while the player is disconnected.
    pub connection: Option<ClientConnection>,
}

impl Participant {
    /// Build an offline participant from its persisted row.
    pub fn from_entity(entity: &ParticipationEntity) -> Self {
        Self {
            participation_id: entity.id,
            user_id: entity.user_id,
            display_name: entity.display_name.clone(),
            is_host: entity.is_host,
            streak: 0,
            total_score: 0,
            connection: None,
        }
    }

    /// Whether a socket is currently registered for this participant.
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}

/// Outcome of one graded answer in the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundAnswer {
    pub points: i64,
    pub correct: bool,
}

/// Bookkeeping for the question currently being played.
#[derive(Debug, Default)]
pub struct RoundState {
    /// Graded answers keyed by participation id.
    pub answers: HashMap<Uuid, RoundAnswer>,
    /// The admin asked to skip once every connected player has answered.
    pub skip_requested: bool,
    /// The window is being closed; late answers are stale even if the deadline
    /// has not passed yet.
    pub closing: bool,
}

/// Mutable state of one live session. Only ever touched through
/// [`LiveSession::lock`], so phase and roster always change together.
#[derive(Debug)]
pub struct SessionRuntime {
    pub machine: SessionStateMachine,
    pub admin: Option<ClientConnection>,
    /// Roster in join order.
    pub participants: IndexMap<Uuid, Participant>,
    pub round: RoundState,
    /// End of the countdown or reveal hold currently running.
    pub phase_deadline: Option<Instant>,
    timer: Option<AbortHandle>,
}

impl SessionRuntime {
    fn new(machine: SessionStateMachine) -> Self {
        Self {
            machine,
            admin: None,
            participants: IndexMap::new(),
            round: RoundState::default(),
            phase_deadline: None,
            timer: None,
        }
    }

    /// Current phase of the session state machine.
    pub fn phase(&self) -> &SessionPhase {
        self.machine.phase()
    }

    /// Install the pending phase timer, cancelling the previous one.
    pub fn set_timer(&mut self, handle: AbortHandle) {
        if let Some(previous) = self.timer.replace(handle) {
            previous.abort();
        }
    }

    /// Cancel the pending phase timer, if any.
    pub fn cancel_timer(&mut self) {
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
    }

    /// Forget the pending timer without aborting it. Used by the timer task itself.
    pub fn release_timer(&mut self) {
        self.timer = None;
    }

    /// Players (hosts excluded) with a live socket.
    pub fn connected_players(&self) -> impl Iterator<Item = &Participant> {
        self.participants
            .values()
            .filter(|p| !p.is_host && p.is_connected())
    }

    /// How many connected players still owe an answer this round.
    pub fn outstanding(&self) -> usize {
        self.connected_players()
            .filter(|p| !self.round.answers.contains_key(&p.participation_id))
            .count()
    }

    /// Participation already registered for a signed-in user.
    pub fn find_by_user(&self, user_id: Uuid) -> Option<Uuid> {
        self.participants
            .values()
            .find(|p| p.user_id == Some(user_id))
            .map(|p| p.participation_id)
    }
}

/// One activated session served by this process.
#[derive(Debug)]
pub struct LiveSession {
    pub id: Uuid,
    pub quiz_id: Uuid,
    pub admin_id: Uuid,
    pub code: u32,
    /// Questions in serving order.
    pub questions: Vec<QuestionEntity>,
    runtime: Mutex<SessionRuntime>,
}

impl LiveSession {
    /// Build the live view of `entity`, positioned before question `next_index`.
    pub fn new(
        entity: &SessionEntity,
        code: u32,
        questions: Vec<QuestionEntity>,
        next_index: usize,
    ) -> Self {
        let machine = SessionStateMachine::resume_at(questions.len(), next_index);
        Self {
            id: entity.id,
            quiz_id: entity.quiz_id,
            admin_id: entity.admin_id,
            code,
            questions,
            runtime: Mutex::new(SessionRuntime::new(machine)),
        }
    }

    /// Serialise access to the session's mutable state.
    pub async fn lock(&self) -> MutexGuard<'_, SessionRuntime> {
        self.runtime.lock().await
    }

    /// Question served at `index`.
    pub fn question(&self, index: usize) -> Option<&QuestionEntity> {
        self.questions.get(index)
    }

    /// Rows to pre-create for a participant joining after `closed` questions
    /// have had their answer window closed.
    pub fn response_rows(&self, closed: usize) -> ResponseRows {
        ResponseRows::split(self.questions.iter().map(|q| q.id), closed)
    }
}
