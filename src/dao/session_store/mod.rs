pub mod memory;
#[cfg(feature = "mongo-store")]
pub mod mongodb;

use std::time::SystemTime;

use futures::future::BoxFuture;
use uuid::Uuid;

use crate::dao::models::{
    ActivationOutcome, Grade, ParticipationEntity, QuestionEntity, QuizEntity, ResponseEntity,
    ResponseRows, SessionEntity,
};
use crate::dao::storage::StorageResult;

pub use self::memory::MemorySessionStore;

/// Abstraction over the persistence layer backing live sessions.
///
/// Every method is a single atomic operation against the backend: callers never
/// read-then-write to enforce an invariant.
pub trait SessionStore: Send + Sync {
    fn find_quiz(&self, quiz_id: Uuid) -> BoxFuture<'static, StorageResult<Option<QuizEntity>>>;
    /// Questions of a quiz ordered by `order_index`.
    fn questions_for_quiz(
        &self,
        quiz_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<QuestionEntity>>>;

    fn create_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<()>>;
    fn find_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>>;
    fn find_active_by_code(
        &self,
        code: u32,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>>;
    /// Activate `session_id` with `code` iff the caller owns it, it is inactive and
    /// not terminated, and no other active session holds `code`.
    fn try_activate(
        &self,
        session_id: Uuid,
        admin_id: Uuid,
        code: u32,
        now: SystemTime,
    ) -> BoxFuture<'static, StorageResult<ActivationOutcome>>;
    fn open_question(
        &self,
        session_id: Uuid,
        question_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<()>>;
    /// Grade every still-ungraded response to `question_id` as zero and clear the
    /// current question. Returns how many rows were graded.
    fn close_question(
        &self,
        session_id: Uuid,
        question_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<u64>>;
    /// Terminate the session. Returns `false` when it was already terminated.
    fn deactivate(&self, session_id: Uuid, now: SystemTime)
    -> BoxFuture<'static, StorageResult<bool>>;

    /// Insert a participation with its response rows: graded zero for questions
    /// already closed, pending for the rest. Returns the existing row when the
    /// same signed-in user already joined the session.
    fn join_participation(
        &self,
        participation: ParticipationEntity,
        rows: ResponseRows,
    ) -> BoxFuture<'static, StorageResult<ParticipationEntity>>;
    fn find_participation(
        &self,
        id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<ParticipationEntity>>>;
    /// Write a grade iff the response has not been graded yet.
    fn grade_response(
        &self,
        participation_id: Uuid,
        question_id: Uuid,
        grade: Grade,
    ) -> BoxFuture<'static, StorageResult<bool>>;
    fn list_participations(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ParticipationEntity>>>;
    fn list_responses(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ResponseEntity>>>;

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
}
