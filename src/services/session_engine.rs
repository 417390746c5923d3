//! Live session engine.
//!
//! Every entry point takes the session lock for its whole duration, so phase
//! transitions, roster changes and grading of one session are totally ordered.
//! Timers are spawned tasks that capture the state machine version they were
//! scheduled at and do nothing if the session moved on in between.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime},
};

use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    dao::models::{Grade, ParticipationEntity, QuestionEntity, ResponseEntity, SessionEntity},
    dto::{
        phase::{VisiblePhase, phase_question_index},
        session::{LeaderboardEntry, LiveSummary},
        ws::{
            AdminCommand, AnswerProgressPayload, AnswerRejectedPayload, AnswerSubmission,
            Component, CountdownPayload, EndedPayload, InvitationCodePayload, JoinRequest,
            JoinedPayload, QuestionPayload, QuizQuestionsPayload, ReasonPayload, RejectReason,
            ResultPayload, ScoreboardPayload, SkipPendingPayload,
        },
    },
    error::ServiceError,
    services::{
        identity::Identity,
        leaderboard,
        scoring::{self, ScoreInput},
        ws_events::{
            EVENT_ANSWER_ACCEPTED, EVENT_ANSWER_PROGRESS, EVENT_ANSWER_REJECTED, EVENT_COUNTDOWN,
            EVENT_ENDED, EVENT_INVITATION_CODE, EVENT_JOINED, EVENT_QUESTION,
            EVENT_QUIZ_QUESTIONS, EVENT_RESULT, EVENT_SCOREBOARD, EVENT_SCORING,
            EVENT_SKIP_ALREADY_REQUESTED, EVENT_SKIP_PENDING, EVENT_START_REFUSED,
            broadcast_players, close_all, replace_connection, send_admin, send_player,
            send_roster,
        },
    },
    state::{
        ClientConnection, SharedState,
        live::{LiveSession, Participant, RoundAnswer, RoundState, SessionRuntime},
        session::SessionStatus,
        state_machine::{ActiveQuestion, CloseReason, EndReason, SessionEvent, SessionPhase},
        transitions::run_transition,
    },
};

/// Deferred phase action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    OpenQuestion { index: usize },
    CloseQuestion(CloseReason),
    Advance,
    Finish(EndReason),
}

/// Live handle for an active session, rebuilding it from the store when this
/// process does not serve it yet.
///
/// A rebuilt session closes any question a previous run left open and resumes
/// in `Waiting` after the last question that has graded responses.
pub async fn ensure_live(
    state: &SharedState,
    entity: &SessionEntity,
) -> Result<Arc<LiveSession>, ServiceError> {
    if let Some(live) = state.sessions().get(&entity.id) {
        return Ok(live);
    }

    let SessionStatus::Active {
        code,
        current_question,
        ..
    } = SessionStatus::from(entity)
    else {
        return Err(ServiceError::InvalidState("session is not active".into()));
    };

    let store = state.store();
    let questions = store.questions_for_quiz(entity.quiz_id).await?;
    if let Some(question_id) = current_question {
        let graded = store.close_question(entity.id, question_id).await?;
        info!(
            session_id = %entity.id,
            question_id = %question_id,
            graded,
            "closed question left open by a previous run"
        );
    }

    let responses = store.list_responses(entity.id).await?;
    let next_index = resume_index(&questions, &responses);
    if next_index >= questions.len() {
        store.deactivate(entity.id, SystemTime::now()).await?;
        info!(session_id = %entity.id, "every question was already served; session closed");
        return Err(ServiceError::InvalidState("session has ended".into()));
    }

    let participations = store.list_participations(entity.id).await?;
    let mut totals: HashMap<Uuid, i64> = HashMap::new();
    for response in responses.iter().filter(|r| r.is_graded) {
        *totals.entry(response.participation_id).or_default() +=
            response.calculated_score.unwrap_or(0);
    }

    let live = Arc::new(LiveSession::new(entity, code, questions, next_index));
    {
        let mut runtime = live.lock().await;
        for participation in &participations {
            let mut participant = Participant::from_entity(participation);
            participant.total_score = totals.get(&participation.id).copied().unwrap_or(0);
            runtime
                .participants
                .insert(participation.id, participant);
        }
    }

    let registered = state.sessions().insert_or_get(live.clone());
    if !Arc::ptr_eq(&registered, &live) {
        return Ok(registered);
    }

    // The snapshot may predate a concurrent finish; the stored row decides.
    let still_active = match store.find_session(entity.id).await {
        Ok(stored) => stored.is_some_and(|stored| {
            matches!(
                SessionStatus::from(&stored),
                SessionStatus::Active { code: current, .. } if current == code
            )
        }),
        Err(err) => {
            state.sessions().remove_handle(&live);
            return Err(err.into());
        }
    };
    if !still_active {
        state.sessions().remove_handle(&live);
        warn!(session_id = %entity.id, "session closed while being rebuilt");
        return Err(ServiceError::InvalidState("session is not active".into()));
    }

    if next_index > 0 || !participations.is_empty() {
        info!(session_id = %entity.id, next_index, "live session rebuilt from storage");
    }
    Ok(registered)
}

/// Position of the first question without graded responses.
fn resume_index(questions: &[QuestionEntity], responses: &[ResponseEntity]) -> usize {
    questions
        .iter()
        .rposition(|question| {
            responses
                .iter()
                .any(|r| r.question_id == question.id && r.is_graded)
        })
        .map_or(0, |index| index + 1)
}

/// Live session players join with `code`.
pub async fn resolve_code(state: &SharedState, code: u32) -> Result<Arc<LiveSession>, ServiceError> {
    if let Some(live) = state.sessions().by_code(code) {
        return Ok(live);
    }
    let entity = state
        .store()
        .find_active_by_code(code)
        .await?
        .ok_or_else(|| ServiceError::NotFound("no active session uses this code".into()))?;
    ensure_live(state, &entity).await
}

/// Register the admin socket, replacing any previous one, and bring it up to date.
pub async fn attach_admin(
    live: &Arc<LiveSession>,
    connection: ClientConnection,
) -> Result<(), ServiceError> {
    let mut runtime = live.lock().await;
    if runtime.phase().is_ended() {
        return Err(ServiceError::InvalidState("session has ended".into()));
    }

    info!(session_id = %live.id, connection_id = %connection.id, "admin attached");
    replace_connection(&mut runtime.admin, connection);
    send_admin(
        &mut runtime,
        Component::Waiting,
        EVENT_INVITATION_CODE,
        &InvitationCodePayload { code: live.code },
    );
    send_roster(&mut runtime);
    resync_admin(live, &mut runtime);
    Ok(())
}

/// Forget the admin socket unless it was already replaced.
pub async fn detach_admin(live: &Arc<LiveSession>, connection_id: Uuid) {
    let mut runtime = live.lock().await;
    if runtime.admin.as_ref().map(|c| c.id) == Some(connection_id) {
        runtime.admin = None;
        info!(session_id = %live.id, "admin detached; session stays active");
    }
}

fn resync_admin(live: &LiveSession, runtime: &mut SessionRuntime) {
    let now = Instant::now();
    match runtime.phase().clone() {
        SessionPhase::CountdownToQuestion { index } => {
            let payload = countdown_payload(live, runtime, index, now);
            send_admin(runtime, Component::Question, EVENT_COUNTDOWN, &payload);
        }
        SessionPhase::QuestionActive(active) => {
            if let Some(question) = live.question(active.index) {
                let payload = QuestionPayload::for_admin(question, millis(active.remaining(now)));
                send_admin(runtime, Component::Question, EVENT_QUESTION, &payload);
            }
            send_progress(runtime);
        }
        _ => {}
    }
}

fn resync_player(live: &LiveSession, runtime: &mut SessionRuntime, participation_id: Uuid) {
    let now = Instant::now();
    match runtime.phase().clone() {
        SessionPhase::CountdownToQuestion { index } => {
            let payload = countdown_payload(live, runtime, index, now);
            send_player(
                runtime,
                participation_id,
                Component::Question,
                EVENT_COUNTDOWN,
                &payload,
            );
        }
        SessionPhase::QuestionActive(active) => {
            if let Some(question) = live.question(active.index) {
                let payload = QuestionPayload::for_player(question, millis(active.remaining(now)));
                send_player(
                    runtime,
                    participation_id,
                    Component::Question,
                    EVENT_QUESTION,
                    &payload,
                );
            }
            if runtime.round.answers.contains_key(&participation_id) {
                send_player(
                    runtime,
                    participation_id,
                    Component::Question,
                    EVENT_ANSWER_ACCEPTED,
                    &(),
                );
            }
        }
        SessionPhase::Scoring { .. } => {
            send_player(runtime, participation_id, Component::Score, EVENT_SCORING, &());
        }
        SessionPhase::Waiting { .. } | SessionPhase::Starting { .. } | SessionPhase::Ended(_) => {}
    }
}

fn countdown_payload(
    live: &LiveSession,
    runtime: &SessionRuntime,
    index: usize,
    now: Instant,
) -> CountdownPayload {
    let remaining = runtime
        .phase_deadline
        .map(|deadline| deadline.saturating_duration_since(now))
        .unwrap_or_default();
    CountdownPayload {
        question_index: index,
        total: live.questions.len(),
        seconds: remaining.as_millis().div_ceil(1000) as u64,
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn new_participation(
    session_id: Uuid,
    user_id: Option<Uuid>,
    display_name: String,
    is_host: bool,
) -> ParticipationEntity {
    let now = SystemTime::now();
    ParticipationEntity {
        id: Uuid::new_v4(),
        session_id,
        user_id,
        display_name,
        is_host,
        created_at: now,
        updated_at: now,
    }
}

/// Register a player socket and return its participation id.
///
/// Signed-in users map onto their existing participation; guests may reclaim
/// theirs with `resume`. A late joiner receives the open question with its
/// remaining time, never a closed one.
pub async fn join_player(
    state: &SharedState,
    live: &Arc<LiveSession>,
    identity: Option<Identity>,
    request: &JoinRequest,
    connection: ClientConnection,
) -> Result<Uuid, ServiceError> {
    let mut runtime = live.lock().await;
    if runtime.phase().is_ended() {
        return Err(ServiceError::InvalidState("session has ended".into()));
    }

    let display_name = request.display_name.trim().to_owned();
    let existing = match (identity, request.resume) {
        (Some(identity), _) => runtime.find_by_user(identity.user_id),
        (None, Some(resume)) => resume_guest(state, live, &mut runtime, resume).await?,
        (None, None) => None,
    };

    let participation_id = match existing {
        Some(id) => id,
        None => {
            let user_id = identity.map(|i| i.user_id);
            let is_host = user_id == Some(live.admin_id);
            let entity = new_participation(live.id, user_id, display_name, is_host);
            let rows = live.response_rows(runtime.phase().closed_questions());
            let stored = state.store().join_participation(entity, rows).await?;
            runtime
                .participants
                .entry(stored.id)
                .or_insert_with(|| Participant::from_entity(&stored));
            stored.id
        }
    };

    let Some(participant) = runtime.participants.get_mut(&participation_id) else {
        return Err(ServiceError::NotFound("participation not found".into()));
    };
    info!(
        session_id = %live.id,
        participation_id = %participation_id,
        resumed = existing.is_some(),
        "player joined"
    );
    replace_connection(&mut participant.connection, connection);
    let joined = JoinedPayload {
        participation_id,
        display_name: participant.display_name.clone(),
    };

    send_player(
        &mut runtime,
        participation_id,
        Component::Waiting,
        EVENT_JOINED,
        &joined,
    );
    resync_player(live, &mut runtime, participation_id);
    send_roster(&mut runtime);
    Ok(participation_id)
}

async fn resume_guest(
    state: &SharedState,
    live: &LiveSession,
    runtime: &mut SessionRuntime,
    resume: Uuid,
) -> Result<Option<Uuid>, ServiceError> {
    if let Some(participant) = runtime.participants.get(&resume) {
        return Ok(participant.user_id.is_none().then_some(resume));
    }
    let Some(entity) = state.store().find_participation(resume).await? else {
        return Ok(None);
    };
    if entity.session_id != live.id || entity.user_id.is_some() {
        return Ok(None);
    }
    runtime
        .participants
        .insert(entity.id, Participant::from_entity(&entity));
    Ok(Some(entity.id))
}

/// Unregister a player socket. Rows persist so the player can resume later.
pub async fn leave_player(
    state: &SharedState,
    live: &Arc<LiveSession>,
    participation_id: Uuid,
    connection_id: Uuid,
) {
    let mut runtime = live.lock().await;
    let Some(participant) = runtime.participants.get_mut(&participation_id) else {
        return;
    };
    if participant.connection.as_ref().map(|c| c.id) != Some(connection_id) {
        return;
    }
    participant.connection = None;
    info!(session_id = %live.id, participation_id = %participation_id, "player left");
    send_roster(&mut runtime);

    if let Err(err) = complete_pending_skip(state, live, &mut runtime).await {
        warn!(session_id = %live.id, error = %err, "failed to complete pending skip");
    }
}

/// Dispatch one admin action.
pub async fn handle_admin_command(
    state: &SharedState,
    live: &Arc<LiveSession>,
    command: AdminCommand,
) -> Result<(), ServiceError> {
    match command {
        AdminCommand::StartQuiz => start_quiz(state, live).await,
        AdminCommand::GetQuizQuestions => {
            let mut runtime = live.lock().await;
            let questions = live
                .questions
                .iter()
                .map(|q| QuestionPayload::for_admin(q, u64::from(q.duration_secs) * 1000))
                .collect();
            send_admin(
                &mut runtime,
                Component::Waiting,
                EVENT_QUIZ_QUESTIONS,
                &QuizQuestionsPayload { questions },
            );
            Ok(())
        }
        AdminCommand::SkipQuestion => skip_question(state, live).await,
        AdminCommand::ForceSkip => force_skip(state, live).await,
        AdminCommand::NextQuestion => next_question(state, live).await,
        AdminCommand::Terminate => terminate(state, live).await,
    }
}

/// Start the quiz, or refuse and stay in `Waiting` when nobody can play.
pub async fn start_quiz(state: &SharedState, live: &Arc<LiveSession>) -> Result<(), ServiceError> {
    let limit = state.config().engine.transition_timeout();
    let mut runtime = live.lock().await;
    let next_index = match runtime.phase() {
        SessionPhase::Waiting { next_index } => *next_index,
        other => {
            return Err(ServiceError::InvalidState(format!(
                "cannot start while in {:?}",
                VisiblePhase::from(other)
            )));
        }
    };

    run_transition(&mut runtime, SessionEvent::RequestStart, limit, || async {
        Ok(())
    })
    .await?;

    let refusal = if runtime.connected_players().next().is_none() {
        Some("no players have joined")
    } else if next_index >= live.questions.len() {
        Some("no questions left to serve")
    } else {
        None
    };

    if let Some(reason) = refusal {
        run_transition(&mut runtime, SessionEvent::RefuseStart, limit, || async {
            Ok(())
        })
        .await?;
        warn!(session_id = %live.id, reason, "start refused");
        send_admin(
            &mut runtime,
            Component::Waiting,
            EVENT_START_REFUSED,
            &ReasonPayload {
                reason: reason.into(),
            },
        );
        return Ok(());
    }

    info!(session_id = %live.id, next_index, "quiz started");
    begin_countdown(state, live, &mut runtime, next_index).await
}

async fn begin_countdown(
    state: &SharedState,
    live: &Arc<LiveSession>,
    runtime: &mut SessionRuntime,
    index: usize,
) -> Result<(), ServiceError> {
    let engine = state.config().engine;
    run_transition(
        runtime,
        SessionEvent::BeginCountdown { index },
        engine.transition_timeout(),
        || async { Ok(()) },
    )
    .await?;

    let countdown = engine.countdown();
    runtime.round = RoundState::default();
    runtime.phase_deadline = Some(Instant::now() + countdown);
    let payload = CountdownPayload {
        question_index: index,
        total: live.questions.len(),
        seconds: countdown.as_secs(),
    };
    broadcast_players(runtime, Component::Question, EVENT_COUNTDOWN, &payload);
    send_admin(runtime, Component::Question, EVENT_COUNTDOWN, &payload);
    schedule(state, live, runtime, countdown, TimerKind::OpenQuestion { index });
    Ok(())
}

async fn open_question(
    state: &SharedState,
    live: &Arc<LiveSession>,
    runtime: &mut SessionRuntime,
    index: usize,
) -> Result<(), ServiceError> {
    let engine = state.config().engine;
    let question = live
        .question(index)
        .ok_or_else(|| ServiceError::InvalidState(format!("no question at index {index}")))?;
    let active = ActiveQuestion {
        index,
        question_id: question.id,
        opened_at: Instant::now(),
        duration: Duration::from_secs(u64::from(question.duration_secs)),
    };

    let work = state.store().open_question(live.id, question.id);
    let opened = run_transition(
        runtime,
        SessionEvent::OpenQuestion(active.clone()),
        engine.transition_timeout(),
        move || async move { work.await.map_err(ServiceError::from) },
    )
    .await;
    if let Err(err) = opened {
        error!(
            session_id = %live.id,
            question_id = %question.id,
            error = %err,
            "failed to open question; retrying"
        );
        schedule(
            state,
            live,
            runtime,
            engine.grading_retry(),
            TimerKind::OpenQuestion { index },
        );
        return Err(err);
    }

    runtime.phase_deadline = None;
    runtime.round = RoundState::default();
    let remaining_ms = millis(active.duration);
    broadcast_players(
        runtime,
        Component::Question,
        EVENT_QUESTION,
        &QuestionPayload::for_player(question, remaining_ms),
    );
    send_admin(
        runtime,
        Component::Question,
        EVENT_QUESTION,
        &QuestionPayload::for_admin(question, remaining_ms),
    );
    send_progress(runtime);
    schedule(
        state,
        live,
        runtime,
        active.duration,
        TimerKind::CloseQuestion(CloseReason::Timeout),
    );
    info!(session_id = %live.id, index, question_id = %question.id, "question opened");
    Ok(())
}

fn send_progress(runtime: &mut SessionRuntime) {
    let payload = AnswerProgressPayload {
        answered: runtime.round.answers.len(),
        total: runtime.connected_players().count(),
    };
    send_admin(runtime, Component::Question, EVENT_ANSWER_PROGRESS, &payload);
}

/// Grade an answer to the open question.
///
/// Rejections (stale, duplicate, invalid option, storage failure) are answered
/// on the player's socket and leave every row untouched.
pub async fn submit_answer(
    state: &SharedState,
    live: &Arc<LiveSession>,
    participation_id: Uuid,
    submission: AnswerSubmission,
) -> Result<(), ServiceError> {
    let mut runtime = live.lock().await;

    let active = match runtime.phase() {
        SessionPhase::QuestionActive(active) if active.question_id == submission.question_id => {
            active.clone()
        }
        _ => {
            reject_answer(&mut runtime, participation_id, RejectReason::Stale);
            return Ok(());
        }
    };
    if runtime.round.closing || active.remaining(Instant::now()).is_zero() {
        reject_answer(&mut runtime, participation_id, RejectReason::Stale);
        return Ok(());
    }
    if runtime.round.answers.contains_key(&participation_id) {
        reject_answer(&mut runtime, participation_id, RejectReason::Duplicate);
        return Ok(());
    }
    let Some(streak) = runtime.participants.get(&participation_id).map(|p| p.streak) else {
        return Err(ServiceError::NotFound("participation not found".into()));
    };
    let question = live
        .question(active.index)
        .ok_or_else(|| ServiceError::InvalidState("open question is unknown".into()))?;

    let mut selected = submission.selected;
    selected.sort_unstable();
    selected.dedup();
    if selected.iter().any(|&key| key >= question.options.len()) {
        reject_answer(&mut runtime, participation_id, RejectReason::InvalidOption);
        return Ok(());
    }

    let window_ms = u64::from(question.duration_secs) * 1000;
    let response_time_ms = u64::try_from(submission.response_time_ms)
        .unwrap_or(0)
        .min(window_ms);
    let outcome = scoring::score(ScoreInput {
        correct_keys: &question.correct_keys,
        submitted_keys: &selected,
        response_time_ms,
        duration_secs: question.duration_secs,
        question_type: question.question_type,
        points_weight: question.points_weight,
        streak,
    });

    let grade = Grade {
        submitted_keys: selected,
        response_time_ms,
        score: outcome.earned_points,
    };
    let persisted = timeout(
        state.config().engine.transition_timeout(),
        state
            .store()
            .grade_response(participation_id, question.id, grade),
    )
    .await
    .map_err(|_| ServiceError::Timeout)
    .and_then(|result| result.map_err(ServiceError::from));

    match persisted {
        Ok(true) => {}
        Ok(false) => {
            reject_answer(&mut runtime, participation_id, RejectReason::Duplicate);
            return Ok(());
        }
        Err(err) => {
            error!(
                session_id = %live.id,
                participation_id = %participation_id,
                question_id = %question.id,
                error = %err,
                "failed to persist grade; response left ungraded"
            );
            reject_answer(&mut runtime, participation_id, RejectReason::Unavailable);
            return Ok(());
        }
    }

    if let Some(participant) = runtime.participants.get_mut(&participation_id) {
        participant.streak = outcome.new_streak;
        participant.total_score += outcome.earned_points;
    }
    runtime.round.answers.insert(
        participation_id,
        RoundAnswer {
            points: outcome.earned_points,
            correct: outcome.correct,
        },
    );
    send_player(
        &mut runtime,
        participation_id,
        Component::Question,
        EVENT_ANSWER_ACCEPTED,
        &(),
    );
    send_progress(&mut runtime);

    complete_pending_skip(state, live, &mut runtime).await
}

fn reject_answer(runtime: &mut SessionRuntime, participation_id: Uuid, reason: RejectReason) {
    debug!(participation_id = %participation_id, reason = ?reason, "answer rejected");
    send_player(
        runtime,
        participation_id,
        Component::Question,
        EVENT_ANSWER_REJECTED,
        &AnswerRejectedPayload { reason },
    );
}

async fn complete_pending_skip(
    state: &SharedState,
    live: &Arc<LiveSession>,
    runtime: &mut SessionRuntime,
) -> Result<(), ServiceError> {
    let pending = matches!(runtime.phase(), SessionPhase::QuestionActive(_))
        && runtime.round.skip_requested
        && !runtime.round.closing
        && runtime.outstanding() == 0;
    if pending {
        close_question(state, live, runtime, CloseReason::AllAnswered).await?;
    }
    Ok(())
}

/// Skip once every connected player has answered.
///
/// Closes right away when nobody is outstanding; repeated requests only warn.
pub async fn skip_question(
    state: &SharedState,
    live: &Arc<LiveSession>,
) -> Result<(), ServiceError> {
    let mut runtime = live.lock().await;
    ensure_question_open(&runtime)?;

    if runtime.round.skip_requested {
        send_admin(
            &mut runtime,
            Component::Question,
            EVENT_SKIP_ALREADY_REQUESTED,
            &(),
        );
        return Ok(());
    }

    let outstanding = runtime.outstanding();
    if outstanding == 0 {
        return close_question(state, live, &mut runtime, CloseReason::AllAnswered).await;
    }
    runtime.round.skip_requested = true;
    info!(session_id = %live.id, outstanding, "skip requested");
    send_admin(
        &mut runtime,
        Component::Question,
        EVENT_SKIP_PENDING,
        &SkipPendingPayload { outstanding },
    );
    Ok(())
}

/// Close the answer window immediately.
pub async fn force_skip(state: &SharedState, live: &Arc<LiveSession>) -> Result<(), ServiceError> {
    let mut runtime = live.lock().await;
    ensure_question_open(&runtime)?;
    close_question(state, live, &mut runtime, CloseReason::ForceSkip).await
}

fn ensure_question_open(runtime: &SessionRuntime) -> Result<(), ServiceError> {
    match runtime.phase() {
        SessionPhase::QuestionActive(_) => Ok(()),
        other => Err(ServiceError::InvalidState(format!(
            "no question is open (phase {:?})",
            VisiblePhase::from(other)
        ))),
    }
}

async fn close_question(
    state: &SharedState,
    live: &Arc<LiveSession>,
    runtime: &mut SessionRuntime,
    reason: CloseReason,
) -> Result<(), ServiceError> {
    let engine = state.config().engine;
    let SessionPhase::QuestionActive(active) = runtime.phase().clone() else {
        return Err(ServiceError::InvalidState("no question is open".into()));
    };
    runtime.round.closing = true;

    let work = state.store().close_question(live.id, active.question_id);
    let closed = run_transition(
        runtime,
        SessionEvent::CloseQuestion(reason),
        engine.transition_timeout(),
        move || async move { work.await.map_err(ServiceError::from) },
    )
    .await;
    let zeroed = match closed {
        Ok((zeroed, _)) => zeroed,
        Err(err) => {
            error!(
                session_id = %live.id,
                question_id = %active.question_id,
                error = %err,
                "failed to close question; retrying"
            );
            schedule(
                state,
                live,
                runtime,
                engine.grading_retry(),
                TimerKind::CloseQuestion(reason),
            );
            return Err(err);
        }
    };
    runtime.cancel_timer();
    info!(
        session_id = %live.id,
        index = active.index,
        reason = ?reason,
        zeroed,
        "question closed"
    );

    let answers = &runtime.round.answers;
    for participant in runtime.participants.values_mut() {
        if !answers.contains_key(&participant.participation_id) {
            participant.streak = 0;
        }
    }

    publish_results(state, live, runtime, active.question_id).await;

    if let Some(hold) = engine.reveal() {
        runtime.phase_deadline = Some(Instant::now() + hold);
        schedule(state, live, runtime, hold, TimerKind::Advance);
    }
    Ok(())
}

async fn publish_results(
    state: &SharedState,
    live: &LiveSession,
    runtime: &mut SessionRuntime,
    question_id: Uuid,
) {
    let projection = timeout(
        state.config().engine.transition_timeout(),
        leaderboard::for_session(state.store().as_ref(), live.id),
    )
    .await;
    let board = match projection {
        Ok(Ok(board)) => board,
        Ok(Err(err)) => {
            warn!(session_id = %live.id, error = %err, "leaderboard unavailable; using live totals");
            live_board(runtime)
        }
        Err(_) => {
            warn!(session_id = %live.id, "leaderboard timed out; using live totals");
            live_board(runtime)
        }
    };

    let ids: Vec<Uuid> = runtime.participants.keys().copied().collect();
    for participation_id in ids {
        let Some(participant) = runtime.participants.get(&participation_id) else {
            continue;
        };
        if !participant.is_connected() {
            continue;
        }
        let answer = runtime.round.answers.get(&participation_id).copied();
        let entry = board
            .iter()
            .find(|entry| entry.participation_id == participation_id);
        let payload = ResultPayload {
            question_id,
            correct: answer.is_some_and(|a| a.correct),
            points: answer.map_or(0, |a| a.points),
            total_score: entry.map_or(participant.total_score, |e| e.score),
            streak: participant.streak,
            rank: entry.map(|e| e.rank),
        };
        send_player(
            runtime,
            participation_id,
            Component::Score,
            EVENT_RESULT,
            &payload,
        );
    }

    send_admin(
        runtime,
        Component::Score,
        EVENT_SCOREBOARD,
        &ScoreboardPayload {
            question_id,
            leaderboard: board,
        },
    );
}

/// Ranking from in-memory totals, used when the store cannot be read.
fn live_board(runtime: &SessionRuntime) -> Vec<LeaderboardEntry> {
    let mut players: Vec<&Participant> = runtime
        .participants
        .values()
        .filter(|p| !p.is_host)
        .collect();
    players.sort_by(|a, b| b.total_score.cmp(&a.total_score));
    players
        .into_iter()
        .enumerate()
        .map(|(position, p)| LeaderboardEntry {
            rank: position as u32 + 1,
            participation_id: p.participation_id,
            display_name: p.display_name.clone(),
            score: p.total_score,
            total_response_time_ms: 0,
            answered: 0,
        })
        .collect()
}

/// Leave the reveal and serve the next question, or end after the last one.
pub async fn next_question(
    state: &SharedState,
    live: &Arc<LiveSession>,
) -> Result<(), ServiceError> {
    let mut runtime = live.lock().await;
    advance(state, live, &mut runtime).await
}

async fn advance(
    state: &SharedState,
    live: &Arc<LiveSession>,
    runtime: &mut SessionRuntime,
) -> Result<(), ServiceError> {
    let index = match runtime.phase() {
        SessionPhase::Scoring { index, .. } => *index,
        other => {
            return Err(ServiceError::InvalidState(format!(
                "results are not being shown (phase {:?})",
                VisiblePhase::from(other)
            )));
        }
    };
    runtime.phase_deadline = None;

    if index + 1 < live.questions.len() {
        begin_countdown(state, live, runtime, index + 1).await
    } else {
        finish(state, live, runtime, EndReason::QuizCompleted).await
    }
}

/// End the session on the admin's request. Valid from any live phase.
pub async fn terminate(state: &SharedState, live: &Arc<LiveSession>) -> Result<(), ServiceError> {
    let mut runtime = live.lock().await;
    finish(state, live, &mut runtime, EndReason::AdminTerminated).await
}

async fn finish(
    state: &SharedState,
    live: &Arc<LiveSession>,
    runtime: &mut SessionRuntime,
    reason: EndReason,
) -> Result<(), ServiceError> {
    let engine = state.config().engine;
    if runtime.phase().is_ended() {
        return Err(ServiceError::InvalidState("session has already ended".into()));
    }

    let open_question = match runtime.phase() {
        SessionPhase::QuestionActive(active) => Some(active.question_id),
        SessionPhase::Scoring { question_id, .. } => Some(*question_id),
        _ => None,
    };
    let store = state.store().clone();
    let session_id = live.id;
    let finished = run_transition(
        runtime,
        SessionEvent::Finish(reason),
        engine.transition_timeout(),
        move || async move {
            if let Some(question_id) = open_question {
                store.close_question(session_id, question_id).await?;
            }
            store.deactivate(session_id, SystemTime::now()).await?;
            Ok::<(), ServiceError>(())
        },
    )
    .await;

    if let Err(err) = finished {
        error!(session_id = %live.id, reason = ?reason, error = %err, "failed to end session");
        if reason == EndReason::QuizCompleted {
            schedule(
                state,
                live,
                runtime,
                engine.grading_retry(),
                TimerKind::Finish(reason),
            );
        }
        return Err(err);
    }

    runtime.cancel_timer();
    runtime.phase_deadline = None;
    let payload = EndedPayload {
        reason: reason.into(),
    };
    broadcast_players(runtime, Component::Session, EVENT_ENDED, &payload);
    send_admin(runtime, Component::Session, EVENT_ENDED, &payload);
    close_all(runtime);
    state.sessions().remove(&live.id);
    info!(session_id = %live.id, reason = ?reason, "session ended");
    Ok(())
}

/// Snapshot of the live state for REST summaries.
pub async fn summary(live: &LiveSession) -> LiveSummary {
    let runtime = live.lock().await;
    LiveSummary {
        phase: VisiblePhase::from(runtime.phase()),
        question_index: phase_question_index(runtime.phase()),
        total_questions: live.questions.len(),
        connected_players: runtime.connected_players().count(),
        registered_players: runtime.participants.values().filter(|p| !p.is_host).count(),
        admin_connected: runtime.admin.is_some(),
    }
}

fn schedule(
    state: &SharedState,
    live: &Arc<LiveSession>,
    runtime: &mut SessionRuntime,
    delay: Duration,
    kind: TimerKind,
) {
    let version = runtime.machine.version();
    let state = state.clone();
    let live = live.clone();
    let handle = tokio::spawn(async move {
        sleep(delay).await;
        fire_timer(&state, &live, version, kind).await;
    });
    runtime.set_timer(handle.abort_handle());
}

async fn fire_timer(state: &SharedState, live: &Arc<LiveSession>, version: u64, kind: TimerKind) {
    let mut runtime = live.lock().await;
    if runtime.machine.version() != version {
        debug!(session_id = %live.id, timer = ?kind, "ignoring stale timer");
        return;
    }
    runtime.release_timer();

    let result = match kind {
        TimerKind::OpenQuestion { index } => open_question(state, live, &mut runtime, index).await,
        TimerKind::CloseQuestion(reason) => close_question(state, live, &mut runtime, reason).await,
        TimerKind::Advance => advance(state, live, &mut runtime).await,
        TimerKind::Finish(reason) => finish(state, live, &mut runtime, reason).await,
    };
    if let Err(err) = result {
        warn!(session_id = %live.id, timer = ?kind, error = %err, "timer action failed");
    }
}

#[cfg(test)]
mod tests {
    use axum::extract::ws::Message;
    use serde_json::Value;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        config::{AppConfig, EngineConfig},
        dao::{
            models::{QuestionType, QuizEntity, ResponseRows},
            session_store::{MemorySessionStore, SessionStore},
        },
        services::{
            allocator::{self, RandomCodes},
            identity::{Role, TokenDirectory},
        },
        state::AppState,
    };

    struct Harness {
        state: SharedState,
        store: MemorySessionStore,
        live: Arc<LiveSession>,
    }

    fn question(quiz_id: Uuid, order_index: u32, correct: usize, duration_secs: u32) -> QuestionEntity {
        QuestionEntity {
            id: Uuid::new_v4(),
            quiz_id,
            order_index,
            text: format!("question {order_index}"),
            options: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            correct_keys: vec![correct],
            question_type: QuestionType::SingleChoice,
            duration_secs,
            points_weight: 10,
            media_url: None,
        }
    }

    async fn harness(question_count: u32, engine: EngineConfig) -> Harness {
        let store = MemorySessionStore::new();
        let admin_id = Uuid::new_v4();
        let quiz = QuizEntity {
            id: Uuid::new_v4(),
            owner_id: admin_id,
            title: "quiz".into(),
        };
        let questions = (0..question_count)
            .map(|i| question(quiz.id, i, 2, 20))
            .collect();
        store.insert_quiz(quiz.clone(), questions).await;

        let session = SessionEntity::waiting(quiz.id, admin_id);
        store.create_session(session.clone()).await.unwrap();
        allocator::activate(&store, &RandomCodes, session.id, admin_id)
            .await
            .unwrap();

        let config = AppConfig {
            engine,
            ..AppConfig::default()
        };
        let state = AppState::new(
            Arc::new(store.clone()),
            Arc::new(TokenDirectory::default()),
            config,
        );
        let entity = store.find_session(session.id).await.unwrap().unwrap();
        let live = ensure_live(&state, &entity).await.unwrap();
        Harness { state, store, live }
    }

    fn manual_reveal() -> EngineConfig {
        EngineConfig {
            reveal_secs: 0,
            ..EngineConfig::default()
        }
    }

    fn socket() -> (ClientConnection, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientConnection::new(tx), rx)
    }

    /// Drain queued frames as `("Component/event", data)` pairs.
    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<(String, Value)> {
        let mut frames = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let Message::Text(text) = message {
                let value: Value = serde_json::from_str(text.as_str()).unwrap();
                let key = format!(
                    "{}/{}",
                    value["component"].as_str().unwrap(),
                    value["event"].as_str().unwrap()
                );
                frames.push((key, value["data"].clone()));
            }
        }
        frames
    }

    fn find<'a>(frames: &'a [(String, Value)], key: &str) -> Option<&'a Value> {
        frames.iter().find(|(k, _)| k == key).map(|(_, data)| data)
    }

    fn join_request(code: u32, name: &str, resume: Option<Uuid>) -> JoinRequest {
        JoinRequest {
            code: code.to_string(),
            display_name: name.into(),
            resume,
        }
    }

    async fn join_guest(
        h: &Harness,
        name: &str,
    ) -> (Uuid, mpsc::UnboundedReceiver<Message>) {
        let (connection, rx) = socket();
        let id = join_player(
            &h.state,
            &h.live,
            None,
            &join_request(h.live.code, name, None),
            connection,
        )
        .await
        .unwrap();
        (id, rx)
    }

    async fn phase(h: &Harness) -> SessionPhase {
        h.live.lock().await.phase().clone()
    }

    async fn open_first_question(h: &Harness) -> Uuid {
        start_quiz(&h.state, &h.live).await.unwrap();
        sleep(h.state.config().engine.countdown() + Duration::from_millis(10)).await;
        match phase(h).await {
            SessionPhase::QuestionActive(active) => active.question_id,
            other => panic!("question not open: {other:?}"),
        }
    }

    fn answer(question_id: Uuid, selected: Vec<usize>, response_time_ms: i64) -> AnswerSubmission {
        AnswerSubmission {
            question_id,
            selected,
            response_time_ms,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_refused_without_players() {
        let h = harness(1, manual_reveal()).await;
        let (admin, mut admin_rx) = socket();
        attach_admin(&h.live, admin).await.unwrap();

        start_quiz(&h.state, &h.live).await.unwrap();

        let frames = drain(&mut admin_rx);
        assert_eq!(
            find(&frames, "Waiting/invitation_code").unwrap()["code"],
            h.live.code
        );
        assert!(find(&frames, "Waiting/start_refused").is_some());
        assert_eq!(phase(&h).await, SessionPhase::Waiting { next_index: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn the_host_alone_does_not_count_as_a_player() {
        let h = harness(1, manual_reveal()).await;
        let host = Identity {
            user_id: h.live.admin_id,
            role: Role::Admin,
        };
        let (connection, _rx) = socket();
        join_player(
            &h.state,
            &h.live,
            Some(host),
            &join_request(h.live.code, "host", None),
            connection,
        )
        .await
        .unwrap();

        start_quiz(&h.state, &h.live).await.unwrap();
        assert_eq!(phase(&h).await, SessionPhase::Waiting { next_index: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn correct_answer_is_scored_and_revealed() {
        let h = harness(1, manual_reveal()).await;
        let (admin, mut admin_rx) = socket();
        attach_admin(&h.live, admin).await.unwrap();
        let (player, mut player_rx) = join_guest(&h, "ana").await;

        let question_id = open_first_question(&h).await;
        let frames = drain(&mut player_rx);
        assert!(find(&frames, "Waiting/joined").is_some());
        assert_eq!(
            find(&frames, "Question/countdown").unwrap()["seconds"],
            3
        );
        let shown = find(&frames, "Question/question").unwrap();
        assert_eq!(shown["remaining_ms"], 20_000);
        assert!(shown.get("correct_keys").is_none());

        submit_answer(&h.state, &h.live, player, answer(question_id, vec![2], 5000))
            .await
            .unwrap();
        assert!(find(&drain(&mut player_rx), "Question/answer_accepted").is_some());

        force_skip(&h.state, &h.live).await.unwrap();
        assert!(matches!(phase(&h).await, SessionPhase::Scoring { index: 0, .. }));

        let frames = drain(&mut player_rx);
        let result = find(&frames, "Score/result").unwrap();
        assert_eq!(result["points"], 1800);
        assert_eq!(result["correct"], true);
        assert_eq!(result["streak"], 1);
        assert_eq!(result["rank"], 1);

        let admin_frames = drain(&mut admin_rx);
        let board = find(&admin_frames, "Score/scoreboard").unwrap();
        assert_eq!(board["leaderboard"][0]["score"], 1800);

        next_question(&h.state, &h.live).await.unwrap();
        assert_eq!(phase(&h).await, SessionPhase::Ended(EndReason::QuizCompleted));
        assert!(find(&drain(&mut player_rx), "Session/ended").is_some());
        assert!(h.state.sessions().get(&h.live.id).is_none());

        let stored = h.store.find_session(h.live.id).await.unwrap().unwrap();
        assert!(!stored.is_active);
        assert!(stored.activated_to.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn force_skip_without_answers_grades_every_row_zero() {
        let h = harness(2, manual_reveal()).await;
        join_guest(&h, "ana").await;
        join_guest(&h, "ben").await;
        let question_id = open_first_question(&h).await;

        force_skip(&h.state, &h.live).await.unwrap();
        assert!(matches!(phase(&h).await, SessionPhase::Scoring { index: 0, .. }));

        let responses = h.store.list_responses(h.live.id).await.unwrap();
        let rows: Vec<_> = responses
            .iter()
            .filter(|r| r.question_id == question_id)
            .collect();
        assert_eq!(rows.len(), 2);
        assert!(
            rows.iter()
                .all(|r| r.is_graded && r.calculated_score == Some(0))
        );
        assert!(
            responses
                .iter()
                .filter(|r| r.question_id != question_id)
                .all(|r| !r.is_graded)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnecting_player_gets_the_open_question_with_less_time() {
        let h = harness(1, manual_reveal()).await;
        let (connection, _rx) = socket();
        let first_connection = connection.id;
        let player = join_player(
            &h.state,
            &h.live,
            None,
            &join_request(h.live.code, "ana", None),
            connection,
        )
        .await
        .unwrap();
        let question_id = open_first_question(&h).await;

        sleep(Duration::from_secs(5)).await;
        leave_player(&h.state, &h.live, player, first_connection).await;

        let (connection, mut rx) = socket();
        let resumed = join_player(
            &h.state,
            &h.live,
            None,
            &join_request(h.live.code, "ana", Some(player)),
            connection,
        )
        .await
        .unwrap();
        assert_eq!(resumed, player);

        let frames = drain(&mut rx);
        let shown = find(&frames, "Question/question").unwrap();
        assert_eq!(shown["question_id"], question_id.to_string());
        assert!(shown["remaining_ms"].as_u64().unwrap() <= 15_000);

        let responses = h.store.list_responses(h.live.id).await.unwrap();
        assert!(
            responses
                .iter()
                .filter(|r| r.participation_id == player)
                .all(|r| !r.is_graded)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_and_duplicate_answers_are_rejected() {
        let h = harness(1, manual_reveal()).await;
        let (player, mut rx) = join_guest(&h, "ana").await;
        let question_id = open_first_question(&h).await;
        drain(&mut rx);

        submit_answer(&h.state, &h.live, player, answer(Uuid::new_v4(), vec![1], 100))
            .await
            .unwrap();
        assert_eq!(
            find(&drain(&mut rx), "Question/answer_rejected").unwrap()["reason"],
            "stale"
        );

        submit_answer(&h.state, &h.live, player, answer(question_id, vec![1], 100))
            .await
            .unwrap();
        submit_answer(&h.state, &h.live, player, answer(question_id, vec![2], 100))
            .await
            .unwrap();
        let frames = drain(&mut rx);
        assert!(find(&frames, "Question/answer_accepted").is_some());
        assert_eq!(
            find(&frames, "Question/answer_rejected").unwrap()["reason"],
            "duplicate"
        );

        submit_answer(&h.state, &h.live, player, answer(question_id, vec![9], 100))
            .await
            .unwrap();
        force_skip(&h.state, &h.live).await.unwrap();
        submit_answer(&h.state, &h.live, player, answer(question_id, vec![2], 100))
            .await
            .unwrap();
        let frames = drain(&mut rx);
        assert_eq!(
            find(&frames, "Question/answer_rejected").unwrap()["reason"],
            "duplicate"
        );
        assert_eq!(
            frames
                .iter()
                .filter(|(k, d)| k == "Question/answer_rejected" && d["reason"] == "stale")
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn skip_waits_for_outstanding_players() {
        let h = harness(1, manual_reveal()).await;
        let (admin, mut admin_rx) = socket();
        attach_admin(&h.live, admin).await.unwrap();
        let (ana, _ana_rx) = join_guest(&h, "ana").await;
        let (ben, _ben_rx) = join_guest(&h, "ben").await;
        let question_id = open_first_question(&h).await;
        drain(&mut admin_rx);

        skip_question(&h.state, &h.live).await.unwrap();
        skip_question(&h.state, &h.live).await.unwrap();
        let frames = drain(&mut admin_rx);
        assert_eq!(
            find(&frames, "Question/skip_pending").unwrap()["outstanding"],
            2
        );
        assert!(find(&frames, "Question/skip_already_requested").is_some());

        submit_answer(&h.state, &h.live, ana, answer(question_id, vec![2], 1000))
            .await
            .unwrap();
        assert!(matches!(phase(&h).await, SessionPhase::QuestionActive(_)));

        submit_answer(&h.state, &h.live, ben, answer(question_id, vec![], 1000))
            .await
            .unwrap();
        assert!(matches!(phase(&h).await, SessionPhase::Scoring { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn skip_completes_when_the_last_outstanding_player_leaves() {
        let h = harness(1, manual_reveal()).await;
        let (ana, _ana_rx) = join_guest(&h, "ana").await;
        let (connection, _ben_rx) = socket();
        let ben_connection = connection.id;
        let ben = join_player(
            &h.state,
            &h.live,
            None,
            &join_request(h.live.code, "ben", None),
            connection,
        )
        .await
        .unwrap();
        let question_id = open_first_question(&h).await;

        skip_question(&h.state, &h.live).await.unwrap();
        submit_answer(&h.state, &h.live, ana, answer(question_id, vec![2], 1000))
            .await
            .unwrap();
        assert!(matches!(phase(&h).await, SessionPhase::QuestionActive(_)));

        leave_player(&h.state, &h.live, ben, ben_connection).await;
        assert!(matches!(phase(&h).await, SessionPhase::Scoring { index: 0, .. }));

        let responses = h.store.list_responses(h.live.id).await.unwrap();
        let ben_row = responses
            .iter()
            .find(|r| r.participation_id == ben)
            .unwrap();
        assert!(ben_row.is_graded);
        assert_eq!(ben_row.calculated_score, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn late_joiners_leave_no_ungraded_rows_behind() {
        let h = harness(2, manual_reveal()).await;
        join_guest(&h, "ana").await;
        let first = open_first_question(&h).await;
        force_skip(&h.state, &h.live).await.unwrap();

        let (late, _late_rx) = join_guest(&h, "late").await;
        let responses = h.store.list_responses(h.live.id).await.unwrap();
        let missed = responses
            .iter()
            .find(|r| r.participation_id == late && r.question_id == first)
            .unwrap();
        assert!(missed.is_graded);
        assert_eq!(missed.calculated_score, Some(0));

        next_question(&h.state, &h.live).await.unwrap();
        sleep(h.state.config().engine.countdown() + Duration::from_millis(10)).await;
        assert!(matches!(
            phase(&h).await,
            SessionPhase::QuestionActive(ActiveQuestion { index: 1, .. })
        ));
        force_skip(&h.state, &h.live).await.unwrap();
        next_question(&h.state, &h.live).await.unwrap();
        assert_eq!(phase(&h).await, SessionPhase::Ended(EndReason::QuizCompleted));

        let responses = h.store.list_responses(h.live.id).await.unwrap();
        assert_eq!(responses.len(), 4);
        assert!(responses.iter().all(|r| r.is_graded));
    }

    #[tokio::test(start_paused = true)]
    async fn terminating_during_scoring_grades_rows_of_that_question() {
        let h = harness(2, manual_reveal()).await;
        join_guest(&h, "ana").await;
        let first = open_first_question(&h).await;
        force_skip(&h.state, &h.live).await.unwrap();

        // A row created behind the engine's back, as a racing join would.
        let stray = new_participation(h.live.id, None, "stray".into(), false);
        let stray = h
            .store
            .join_participation(stray, ResponseRows::pending(vec![first]))
            .await
            .unwrap();

        terminate(&h.state, &h.live).await.unwrap();
        let responses = h.store.list_responses(h.live.id).await.unwrap();
        assert!(
            responses
                .iter()
                .filter(|r| r.participation_id == stray.id)
                .all(|r| r.is_graded && r.calculated_score == Some(0))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn a_stale_snapshot_does_not_revive_a_closed_session() {
        let h = harness(1, manual_reveal()).await;
        let snapshot = h.store.find_session(h.live.id).await.unwrap().unwrap();
        h.state.sessions().remove(&h.live.id);
        h.store
            .deactivate(h.live.id, SystemTime::now())
            .await
            .unwrap();

        assert!(matches!(
            ensure_live(&h.state, &snapshot).await,
            Err(ServiceError::InvalidState(_))
        ));
        assert!(h.state.sessions().is_empty());
        assert!(h.state.sessions().by_code(h.live.code).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timers_drive_the_quiz_to_completion() {
        let h = harness(2, EngineConfig::default()).await;
        let (_player, mut rx) = join_guest(&h, "ana").await;
        start_quiz(&h.state, &h.live).await.unwrap();

        // countdown 3s + answer window 20s + reveal 5s, twice.
        sleep(Duration::from_secs(2 * (3 + 20 + 5) + 1)).await;

        assert_eq!(phase(&h).await, SessionPhase::Ended(EndReason::QuizCompleted));
        let frames = drain(&mut rx);
        assert_eq!(
            frames
                .iter()
                .filter(|(k, _)| k == "Question/question")
                .count(),
            2
        );
        assert_eq!(find(&frames, "Session/ended").unwrap()["reason"], "quiz_completed");
    }

    #[tokio::test(start_paused = true)]
    async fn grading_failure_keeps_rows_ungraded_and_close_is_retried() {
        let h = harness(1, manual_reveal()).await;
        let (player, mut rx) = join_guest(&h, "ana").await;
        let question_id = open_first_question(&h).await;
        drain(&mut rx);

        h.store.set_offline(true);
        submit_answer(&h.state, &h.live, player, answer(question_id, vec![2], 1000))
            .await
            .unwrap();
        assert_eq!(
            find(&drain(&mut rx), "Question/answer_rejected").unwrap()["reason"],
            "unavailable"
        );

        assert!(force_skip(&h.state, &h.live).await.is_err());
        assert!(matches!(phase(&h).await, SessionPhase::QuestionActive(_)));

        h.store.set_offline(false);
        sleep(h.state.config().engine.grading_retry() + Duration::from_millis(10)).await;
        assert!(matches!(phase(&h).await, SessionPhase::Scoring { .. }));

        let responses = h.store.list_responses(h.live.id).await.unwrap();
        assert!(responses.iter().all(|r| r.is_graded));
    }

    #[tokio::test(start_paused = true)]
    async fn a_new_admin_socket_replaces_the_old_one() {
        let h = harness(1, manual_reveal()).await;
        let (first, mut first_rx) = socket();
        attach_admin(&h.live, first).await.unwrap();
        let (second, _second_rx) = socket();
        let second_id = second.id;
        attach_admin(&h.live, second).await.unwrap();

        let mut closed = false;
        while let Ok(message) = first_rx.try_recv() {
            closed |= matches!(message, Message::Close(_));
        }
        assert!(closed);
        assert_eq!(
            h.live.lock().await.admin.as_ref().map(|c| c.id),
            Some(second_id)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_closes_the_open_question_and_every_socket() {
        let h = harness(2, manual_reveal()).await;
        let (_player, mut rx) = join_guest(&h, "ana").await;
        open_first_question(&h).await;

        terminate(&h.state, &h.live).await.unwrap();
        assert_eq!(
            phase(&h).await,
            SessionPhase::Ended(EndReason::AdminTerminated)
        );
        let frames = drain(&mut rx);
        assert_eq!(
            find(&frames, "Session/ended").unwrap()["reason"],
            "admin_terminated"
        );
        assert!(terminate(&h.state, &h.live).await.is_err());

        let stored = h.store.find_session(h.live.id).await.unwrap().unwrap();
        assert!(!stored.is_question_active);
        assert_eq!(stored.invitation_code, None);
    }

    #[tokio::test(start_paused = true)]
    async fn rebuilt_session_resumes_after_the_last_graded_question() {
        let h = harness(3, manual_reveal()).await;
        join_guest(&h, "ana").await;
        open_first_question(&h).await;
        force_skip(&h.state, &h.live).await.unwrap();

        // Simulate a restart with question 1 left open in storage.
        let dangling = h.live.questions[1].id;
        h.store.open_question(h.live.id, dangling).await.unwrap();
        h.state.sessions().remove(&h.live.id);

        let entity = h.store.find_session(h.live.id).await.unwrap().unwrap();
        let rebuilt = ensure_live(&h.state, &entity).await.unwrap();
        assert!(!Arc::ptr_eq(&rebuilt, &h.live));
        assert_eq!(
            rebuilt.lock().await.phase(),
            &SessionPhase::Waiting { next_index: 2 }
        );
        assert_eq!(rebuilt.lock().await.participants.len(), 1);

        let responses = h.store.list_responses(h.live.id).await.unwrap();
        assert!(
            responses
                .iter()
                .filter(|r| r.question_id == dangling)
                .all(|r| r.is_graded && r.calculated_score == Some(0))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn guests_cannot_resume_someone_elses_participation() {
        let h = harness(1, manual_reveal()).await;
        let user = Identity {
            user_id: Uuid::new_v4(),
            role: Role::Player,
        };
        let (connection, _rx) = socket();
        let signed_in = join_player(
            &h.state,
            &h.live,
            Some(user),
            &join_request(h.live.code, "sam", None),
            connection,
        )
        .await
        .unwrap();

        let (connection, _rx) = socket();
        let guest = join_player(
            &h.state,
            &h.live,
            None,
            &join_request(h.live.code, "eve", Some(signed_in)),
            connection,
        )
        .await
        .unwrap();
        assert_ne!(guest, signed_in);

        let (connection, _rx) = socket();
        let again = join_player(
            &h.state,
            &h.live,
            Some(user),
            &join_request(h.live.code, "sam", None),
            connection,
        )
        .await
        .unwrap();
        assert_eq!(again, signed_in);
    }
}
