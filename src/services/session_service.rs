//! Business logic powering the session REST routes. Lifecycle changes of a
//! session served by this process always go through the live engine so the
//! phase and the stored row change together.

use std::{sync::Arc, time::SystemTime};

use tracing::info;
use uuid::Uuid;

use crate::{
    dao::models::SessionEntity,
    dto::session::{
        ActivationResponse, CreateSessionRequest, LeaderboardResponse, SessionStatusDto,
        SessionSummary, TerminateResponse,
    },
    error::ServiceError,
    services::{allocator, identity::Identity, leaderboard, session_engine},
    state::{SharedState, live::LiveSession, session::SessionStatus},
};

fn require_admin(caller: &Identity) -> Result<(), ServiceError> {
    if caller.is_admin() {
        Ok(())
    } else {
        Err(ServiceError::Forbidden("admin role required".into()))
    }
}

async fn owned_session(
    state: &SharedState,
    caller: &Identity,
    session_id: Uuid,
) -> Result<SessionEntity, ServiceError> {
    require_admin(caller)?;
    let entity = state
        .store()
        .find_session(session_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("session `{session_id}` not found")))?;
    if entity.admin_id != caller.user_id {
        return Err(ServiceError::Forbidden(
            "session belongs to another admin".into(),
        ));
    }
    Ok(entity)
}

/// Create a waiting session for a quiz the caller owns.
pub async fn create_session(
    state: &SharedState,
    caller: &Identity,
    request: CreateSessionRequest,
) -> Result<SessionSummary, ServiceError> {
    require_admin(caller)?;
    let store = state.store();
    let quiz = store
        .find_quiz(request.quiz_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("quiz `{}` not found", request.quiz_id)))?;
    if quiz.owner_id != caller.user_id {
        return Err(ServiceError::Forbidden("quiz belongs to another admin".into()));
    }
    if store.questions_for_quiz(quiz.id).await?.is_empty() {
        return Err(ServiceError::InvalidInput("quiz has no questions".into()));
    }

    let entity = SessionEntity::waiting(quiz.id, caller.user_id);
    store.create_session(entity.clone()).await?;
    info!(session_id = %entity.id, quiz_id = %quiz.id, "session created");
    Ok(SessionSummary::new(&entity, None))
}

/// Stored summary of a session, with its live state when this process serves it.
pub async fn get_session(
    state: &SharedState,
    caller: &Identity,
    session_id: Uuid,
) -> Result<SessionSummary, ServiceError> {
    let entity = owned_session(state, caller, session_id).await?;
    let live = match state.sessions().get(&session_id) {
        Some(live) => Some(session_engine::summary(&live).await),
        None => None,
    };
    Ok(SessionSummary::new(&entity, live))
}

/// Activate a session and return its invitation code. Idempotent.
pub async fn activate(
    state: &SharedState,
    caller: &Identity,
    session_id: Uuid,
) -> Result<ActivationResponse, ServiceError> {
    let live = open_admin_session(state, caller, session_id).await?;
    Ok(ActivationResponse {
        session_id,
        invitation_code: live.code,
    })
}

/// Authorize `caller` as the session admin, activating the session on first
/// use, and return the live session it drives.
pub async fn open_admin_session(
    state: &SharedState,
    caller: &Identity,
    session_id: Uuid,
) -> Result<Arc<LiveSession>, ServiceError> {
    require_admin(caller)?;
    allocator::activate(
        state.store().as_ref(),
        state.codes(),
        session_id,
        caller.user_id,
    )
    .await?;
    let entity = state
        .store()
        .find_session(session_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("session `{session_id}` not found")))?;
    session_engine::ensure_live(state, &entity).await
}

/// End a session. Terminating twice is an invalid-state error.
pub async fn terminate(
    state: &SharedState,
    caller: &Identity,
    session_id: Uuid,
) -> Result<TerminateResponse, ServiceError> {
    let entity = owned_session(state, caller, session_id).await?;

    if let Some(live) = state.sessions().get(&session_id) {
        session_engine::terminate(state, &live).await?;
    } else {
        if matches!(SessionStatus::from(&entity), SessionStatus::Closed { .. }) {
            return Err(ServiceError::InvalidState(
                "session has already been terminated".into(),
            ));
        }
        let store = state.store();
        if let Some(question_id) = entity.current_question_id {
            store.close_question(session_id, question_id).await?;
        }
        store.deactivate(session_id, SystemTime::now()).await?;
        info!(session_id = %session_id, "idle session terminated");
    }

    Ok(TerminateResponse {
        session_id,
        status: SessionStatusDto::Closed,
    })
}

/// Ranking of a session, live or finished.
pub async fn leaderboard(
    state: &SharedState,
    session_id: Uuid,
) -> Result<LeaderboardResponse, ServiceError> {
    state
        .store()
        .find_session(session_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("session `{session_id}` not found")))?;
    let entries = leaderboard::for_session(state.store().as_ref(), session_id).await?;
    Ok(LeaderboardResponse {
        session_id,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AppConfig,
        dao::{
            models::{QuestionEntity, QuestionType, QuizEntity},
            session_store::MemorySessionStore,
        },
        services::identity::{Role, TokenDirectory},
        state::AppState,
    };

    fn admin() -> Identity {
        Identity {
            user_id: Uuid::new_v4(),
            role: Role::Admin,
        }
    }

    async fn setup(owner: &Identity, question_count: u32) -> (SharedState, Uuid) {
        let store = MemorySessionStore::new();
        let quiz = QuizEntity {
            id: Uuid::new_v4(),
            owner_id: owner.user_id,
            title: "quiz".into(),
        };
        let questions = (0..question_count)
            .map(|order_index| QuestionEntity {
                id: Uuid::new_v4(),
                quiz_id: quiz.id,
                order_index,
                text: "q".into(),
                options: vec!["a".into(), "b".into()],
                correct_keys: vec![0],
                question_type: QuestionType::SingleChoice,
                duration_secs: 10,
                points_weight: 10,
                media_url: None,
            })
            .collect();
        store.insert_quiz(quiz.clone(), questions).await;
        let state = AppState::new(
            Arc::new(store),
            Arc::new(TokenDirectory::default()),
            AppConfig::default(),
        );
        (state, quiz.id)
    }

    #[tokio::test]
    async fn sessions_require_an_owned_quiz_with_questions() {
        let owner = admin();
        let (state, quiz_id) = setup(&owner, 0).await;

        let empty = create_session(&state, &owner, CreateSessionRequest { quiz_id }).await;
        assert!(matches!(empty, Err(ServiceError::InvalidInput(_))));

        let stranger = admin();
        let foreign = create_session(&state, &stranger, CreateSessionRequest { quiz_id }).await;
        assert!(matches!(foreign, Err(ServiceError::Forbidden(_))));

        let player = Identity {
            user_id: owner.user_id,
            role: Role::Player,
        };
        let not_admin = create_session(&state, &player, CreateSessionRequest { quiz_id }).await;
        assert!(matches!(not_admin, Err(ServiceError::Forbidden(_))));
    }

    #[tokio::test]
    async fn activation_is_idempotent_and_serves_the_session() {
        let owner = admin();
        let (state, quiz_id) = setup(&owner, 2).await;
        let summary = create_session(&state, &owner, CreateSessionRequest { quiz_id })
            .await
            .unwrap();
        assert_eq!(summary.status, SessionStatusDto::Waiting);

        let first = activate(&state, &owner, summary.id).await.unwrap();
        let second = activate(&state, &owner, summary.id).await.unwrap();
        assert_eq!(first.invitation_code, second.invitation_code);
        assert_eq!(state.sessions().len(), 1);

        let fetched = get_session(&state, &owner, summary.id).await.unwrap();
        assert_eq!(fetched.status, SessionStatusDto::Active);
        assert_eq!(fetched.live.map(|l| l.total_questions), Some(2));
    }

    #[tokio::test]
    async fn terminate_closes_once() {
        let owner = admin();
        let (state, quiz_id) = setup(&owner, 1).await;
        let summary = create_session(&state, &owner, CreateSessionRequest { quiz_id })
            .await
            .unwrap();
        activate(&state, &owner, summary.id).await.unwrap();

        let response = terminate(&state, &owner, summary.id).await.unwrap();
        assert_eq!(response.status, SessionStatusDto::Closed);
        assert!(state.sessions().is_empty());
        assert!(matches!(
            terminate(&state, &owner, summary.id).await,
            Err(ServiceError::InvalidState(_))
        ));
        assert!(matches!(
            activate(&state, &owner, summary.id).await,
            Err(ServiceError::InvalidState(_))
        ));

        let board = leaderboard(&state, summary.id).await.unwrap();
        assert!(board.entries.is_empty());
    }

    #[tokio::test]
    async fn unknown_sessions_are_not_found() {
        let owner = admin();
        let (state, _) = setup(&owner, 1).await;
        assert!(matches!(
            leaderboard(&state, Uuid::new_v4()).await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            get_session(&state, &owner, Uuid::new_v4()).await,
            Err(ServiceError::NotFound(_))
        ));
    }
}
