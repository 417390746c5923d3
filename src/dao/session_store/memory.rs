//! In-process [`SessionStore`] used for development and tests.
//!
//! All tables live behind one mutex, so every trait method observes and mutates
//! a consistent snapshot exactly like a single transaction would.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::SystemTime,
};

use futures::{FutureExt, future::BoxFuture};
use indexmap::IndexMap;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::SessionStore;
use crate::dao::{
    models::{
        ActivationOutcome, Grade, ParticipationEntity, QuestionEntity, QuizEntity,
        ResponseEntity, ResponseRows, SessionEntity,
    },
    storage::{StorageError, StorageResult},
};

#[derive(Debug, Error)]
#[error("in-memory store switched offline")]
struct OfflineError;

#[derive(Default)]
struct Tables {
    quizzes: HashMap<Uuid, QuizEntity>,
    questions: HashMap<Uuid, Vec<QuestionEntity>>,
    sessions: HashMap<Uuid, SessionEntity>,
    participations: IndexMap<Uuid, ParticipationEntity>,
    responses: Vec<ResponseEntity>,
}

impl Tables {
    fn session_participations(&self, session_id: Uuid) -> impl Iterator<Item = Uuid> + '_ {
        self.participations
            .values()
            .filter(move |p| p.session_id == session_id)
            .map(|p| p.id)
    }
}

/// [`SessionStore`] keeping every table in memory.
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    tables: Arc<Mutex<Tables>>,
    offline: Arc<AtomicBool>,
}

impl MemorySessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a quiz and its questions, replacing any previous definition.
    pub async fn insert_quiz(&self, quiz: QuizEntity, mut questions: Vec<QuestionEntity>) {
        questions.sort_by_key(|q| q.order_index);
        let mut tables = self.tables.lock().await;
        tables.questions.insert(quiz.id, questions);
        tables.quizzes.insert(quiz.id, quiz);
    }

    /// Simulate a backend outage; every operation fails while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Run `op` against the tables unless the store is offline.
    fn with_tables<T, F>(&self, op: F) -> BoxFuture<'static, StorageResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Tables) -> T + Send + 'static,
    {
        let tables = self.tables.clone();
        let offline = self.offline.clone();
        async move {
            if offline.load(Ordering::SeqCst) {
                return Err(StorageError::unavailable(
                    "memory store offline".into(),
                    OfflineError,
                ));
            }
            let mut guard = tables.lock().await;
            Ok(op(&mut *guard))
        }
        .boxed()
    }
}

impl SessionStore for MemorySessionStore {
    fn find_quiz(&self, quiz_id: Uuid) -> BoxFuture<'static, StorageResult<Option<QuizEntity>>> {
        self.with_tables(move |t| t.quizzes.get(&quiz_id).cloned())
    }

    fn questions_for_quiz(
        &self,
        quiz_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<QuestionEntity>>> {
        self.with_tables(move |t| t.questions.get(&quiz_id).cloned().unwrap_or_default())
    }

    fn create_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<()>> {
        self.with_tables(move |t| {
            t.sessions.insert(session.id, session);
        })
    }

    fn find_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        self.with_tables(move |t| t.sessions.get(&id).cloned())
    }

    fn find_active_by_code(
        &self,
        code: u32,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        self.with_tables(move |t| {
            t.sessions
                .values()
                .find(|s| s.is_active && s.invitation_code == Some(code))
                .cloned()
        })
    }

    fn try_activate(
        &self,
        session_id: Uuid,
        admin_id: Uuid,
        code: u32,
        now: SystemTime,
    ) -> BoxFuture<'static, StorageResult<ActivationOutcome>> {
        self.with_tables(move |t| {
            let code_taken = t
                .sessions
                .values()
                .any(|s| s.id != session_id && s.is_active && s.invitation_code == Some(code));

            let Some(session) = t.sessions.get_mut(&session_id) else {
                return ActivationOutcome::NotFound;
            };
            if session.admin_id != admin_id {
                return ActivationOutcome::NotOwner;
            }
            if session.activated_to.is_some() {
                return ActivationOutcome::Closed;
            }
            if session.is_active {
                return match session.invitation_code {
                    Some(existing) => ActivationOutcome::AlreadyActive { code: existing },
                    None => ActivationOutcome::Closed,
                };
            }
            if code_taken {
                return ActivationOutcome::CodeTaken;
            }

            session.is_active = true;
            session.invitation_code = Some(code);
            session.activated_from = Some(now);
            ActivationOutcome::Activated
        })
    }

    fn open_question(
        &self,
        session_id: Uuid,
        question_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<()>> {
        self.with_tables(move |t| {
            if let Some(session) = t.sessions.get_mut(&session_id) {
                session.current_question_id = Some(question_id);
                session.is_question_active = true;
            }
        })
    }

    fn close_question(
        &self,
        session_id: Uuid,
        question_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<u64>> {
        self.with_tables(move |t| {
            let members: Vec<Uuid> = t.session_participations(session_id).collect();
            let mut graded = 0;
            for response in t.responses.iter_mut().filter(|r| {
                r.question_id == question_id
                    && !r.is_graded
                    && members.contains(&r.participation_id)
            }) {
                response.submitted_keys.clear();
                response.calculated_score = Some(0);
                response.is_graded = true;
                graded += 1;
            }

            if let Some(session) = t.sessions.get_mut(&session_id) {
                session.current_question_id = None;
                session.is_question_active = false;
            }
            graded
        })
    }

    fn deactivate(
        &self,
        session_id: Uuid,
        now: SystemTime,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        self.with_tables(move |t| {
            let Some(session) = t.sessions.get_mut(&session_id) else {
                return false;
            };
            if session.activated_to.is_some() {
                return false;
            }
            session.is_active = false;
            session.invitation_code = None;
            session.activated_to = Some(now);
            session.current_question_id = None;
            session.is_question_active = false;
            true
        })
    }

    fn join_participation(
        &self,
        participation: ParticipationEntity,
        rows: ResponseRows,
    ) -> BoxFuture<'static, StorageResult<ParticipationEntity>> {
        self.with_tables(move |t| {
            if let Some(user_id) = participation.user_id {
                if let Some(existing) = t.participations.values().find(|p| {
                    p.session_id == participation.session_id && p.user_id == Some(user_id)
                }) {
                    return existing.clone();
                }
            }

            for question_id in rows.missed {
                t.responses
                    .push(ResponseEntity::missed(participation.id, question_id));
            }
            for question_id in rows.pending {
                t.responses
                    .push(ResponseEntity::pending(participation.id, question_id));
            }
            t.participations
                .insert(participation.id, participation.clone());
            participation
        })
    }

    fn find_participation(
        &self,
        id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<ParticipationEntity>>> {
        self.with_tables(move |t| t.participations.get(&id).cloned())
    }

    fn grade_response(
        &self,
        participation_id: Uuid,
        question_id: Uuid,
        grade: Grade,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        self.with_tables(move |t| {
            let Some(response) = t.responses.iter_mut().find(|r| {
                r.participation_id == participation_id
                    && r.question_id == question_id
                    && !r.is_graded
            }) else {
                return false;
            };
            response.submitted_keys = grade.submitted_keys;
            response.response_time_ms = Some(grade.response_time_ms);
            response.calculated_score = Some(grade.score);
            response.is_graded = true;
            true
        })
    }

    fn list_participations(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ParticipationEntity>>> {
        self.with_tables(move |t| {
            t.participations
                .values()
                .filter(|p| p.session_id == session_id)
                .cloned()
                .collect()
        })
    }

    fn list_responses(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ResponseEntity>>> {
        self.with_tables(move |t| {
            let members: Vec<Uuid> = t.session_participations(session_id).collect();
            t.responses
                .iter()
                .filter(|r| members.contains(&r.participation_id))
                .cloned()
                .collect()
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        self.with_tables(|_| ())
    }
}
