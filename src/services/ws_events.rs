use std::fmt::Debug;

use axum::extract::ws::{Message, Utf8Bytes};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    dto::ws::{Component, ErrorPayload, OutboundEnvelope, RosterEntry, RosterPayload},
    error::ProtocolError,
    state::{ClientConnection, live::SessionRuntime},
};

pub const EVENT_INVITATION_CODE: &str = "invitation_code";
pub const EVENT_ROSTER: &str = "roster";
pub const EVENT_QUIZ_QUESTIONS: &str = "quiz_questions";
pub const EVENT_START_REFUSED: &str = "start_refused";
pub const EVENT_JOINED: &str = "joined";
pub const EVENT_COUNTDOWN: &str = "countdown";
pub const EVENT_QUESTION: &str = "question";
pub const EVENT_ANSWER_ACCEPTED: &str = "answer_accepted";
pub const EVENT_ANSWER_REJECTED: &str = "answer_rejected";
pub const EVENT_ANSWER_PROGRESS: &str = "answer_progress";
pub const EVENT_SKIP_PENDING: &str = "skip_pending";
pub const EVENT_SKIP_ALREADY_REQUESTED: &str = "skip_already_requested";
pub const EVENT_SCOREBOARD: &str = "scoreboard";
pub const EVENT_RESULT: &str = "result";
pub const EVENT_SCORING: &str = "scoring";
pub const EVENT_ENDED: &str = "ended";
pub const EVENT_ERROR: &str = "error";

/// The socket's writer task is gone.
#[derive(Debug, Error)]
#[error("connection closed")]
pub struct ConnectionClosed;

/// Serialize an envelope once so it can be fanned out.
///
/// Serialization failure is a bug, not a transient condition: it is logged and
/// `None` is returned.
fn encode<T>(component: Component, event: &str, value: &T) -> Option<Utf8Bytes>
where
    T: ?Sized + Serialize + Debug,
{
    let envelope = OutboundEnvelope {
        component,
        event,
        data: &value,
    };
    match serde_json::to_string(&envelope) {
        Ok(payload) => Some(payload.into()),
        Err(err) => {
            warn!(error = %err, event, "failed to serialize message `{value:?}`");
            None
        }
    }
}

/// Serialize a payload and push it onto the provided WebSocket sender.
///
/// Returns `Err(ConnectionClosed)` only when the writer channel is closed.
pub fn send_message_to_websocket<T>(
    tx: &mpsc::UnboundedSender<Message>,
    component: Component,
    event: &str,
    value: &T,
) -> Result<(), ConnectionClosed>
where
    T: ?Sized + Serialize + Debug,
{
    let Some(payload) = encode(component, event, value) else {
        return Ok(());
    };
    tx.send(Message::Text(payload)).map_err(|_| ConnectionClosed)
}

/// Answer a rejected frame on the socket that sent it.
pub fn send_error(tx: &mpsc::UnboundedSender<Message>, err: &ProtocolError) {
    let _ = send_message_to_websocket(tx, Component::Session, EVENT_ERROR, &ErrorPayload::from(err));
}

/// Send to the admin socket, detaching it when its writer is gone.
pub fn send_admin<T>(runtime: &mut SessionRuntime, component: Component, event: &str, value: &T)
where
    T: ?Sized + Serialize + Debug,
{
    let Some(admin) = runtime.admin.as_ref() else {
        return;
    };
    if send_message_to_websocket(&admin.tx, component, event, value).is_err() {
        debug!(connection_id = %admin.id, "admin writer closed; detaching");
        runtime.admin = None;
    }
}

/// Send to one participant. Returns `false` when its socket had to be dropped.
pub fn send_player<T>(
    runtime: &mut SessionRuntime,
    participation_id: Uuid,
    component: Component,
    event: &str,
    value: &T,
) -> bool
where
    T: ?Sized + Serialize + Debug,
{
    let Some(participant) = runtime.participants.get_mut(&participation_id) else {
        return true;
    };
    let Some(connection) = participant.connection.as_ref() else {
        return true;
    };
    if send_message_to_websocket(&connection.tx, component, event, value).is_ok() {
        return true;
    }
    debug!(participation_id = %participation_id, "player writer closed; unregistering");
    participant.connection = None;
    false
}

/// Fan a message out to every connected participant.
///
/// Each send is independent; a dead socket is unregistered and the admin gets
/// a fresh roster.
pub fn broadcast_players<T>(runtime: &mut SessionRuntime, component: Component, event: &str, value: &T)
where
    T: ?Sized + Serialize + Debug,
{
    let Some(payload) = encode(component, event, value) else {
        return;
    };

    let mut dropped = 0;
    for participant in runtime.participants.values_mut() {
        let Some(connection) = participant.connection.as_ref() else {
            continue;
        };
        if connection.tx.send(Message::Text(payload.clone())).is_err() {
            participant.connection = None;
            dropped += 1;
        }
    }

    if dropped > 0 {
        debug!(dropped, event, "unregistered closed player sockets during broadcast");
        send_roster(runtime);
    }
}

/// Push the current roster to the admin.
pub fn send_roster(runtime: &mut SessionRuntime) {
    let payload = roster(runtime);
    send_admin(runtime, Component::Waiting, EVENT_ROSTER, &payload);
}

/// Roster snapshot in join order.
pub fn roster(runtime: &SessionRuntime) -> RosterPayload {
    let players: Vec<RosterEntry> = runtime
        .participants
        .values()
        .map(|p| RosterEntry {
            participation_id: p.participation_id,
            display_name: p.display_name.clone(),
            connected: p.is_connected(),
            is_host: p.is_host,
        })
        .collect();
    RosterPayload {
        count: runtime.connected_players().count(),
        players,
    }
}

/// Close and forget every socket attached to the session.
pub fn close_all(runtime: &mut SessionRuntime) {
    if let Some(admin) = runtime.admin.take() {
        admin.close();
    }
    for participant in runtime.participants.values_mut() {
        if let Some(connection) = participant.connection.take() {
            connection.close();
        }
    }
}

/// Replace `slot` with `connection`, closing the previous socket.
pub fn replace_connection(slot: &mut Option<ClientConnection>, connection: ClientConnection) {
    if let Some(previous) = slot.replace(connection) {
        debug!(connection_id = %previous.id, "closing replaced socket");
        previous.close();
    }
}
