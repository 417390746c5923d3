use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::ws::{Message, Utf8Bytes, WebSocket},
};
use futures::{SinkExt, Stream, StreamExt, stream::SplitSink};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Duration, Instant, Interval, MissedTickBehavior, interval_at, timeout},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::EngineConfig,
    dto::ws::{AdminCommand, PlayerCommand},
    error::{ProtocolError, ServiceError},
    services::{identity::Identity, session_engine, ws_events::send_error},
    state::{ClientConnection, SharedState, live::LiveSession},
};

/// Ping schedule of one socket.
struct Keepalive {
    ticker: Interval,
    missed: u32,
    limit: u32,
}

impl Keepalive {
    fn new(engine: &EngineConfig) -> Self {
        let period = engine.keepalive_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        // A stalled read loop must not turn into a burst of missed probes.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            ticker,
            missed: 0,
            limit: engine.keepalive_missed_limit.max(1),
        }
    }
}

/// Forward queued messages to the socket, each under `send_timeout`.
///
/// Stops after a close frame or the first failed write; the dropped receiver
/// makes every later send on the connection fail.
fn spawn_writer(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    send_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            match timeout(send_timeout, sender.send(message)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(error = %err, "websocket send failed");
                    break;
                }
                Err(_) => {
                    warn!("websocket send timed out; dropping connection");
                    break;
                }
            }
            if closing {
                break;
            }
        }
    })
}

/// Wait for the next text frame while keeping the connection alive.
///
/// Returns `None` once the socket should be dropped: the peer closed it, it
/// stayed silent for too many keep-alive intervals, or its writer stopped.
async fn next_text<S>(
    receiver: &mut S,
    outbound_tx: &mpsc::UnboundedSender<Message>,
    keepalive: &mut Keepalive,
) -> Option<Utf8Bytes>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        tokio::select! {
            frame = receiver.next() => {
                keepalive.missed = 0;
                match frame {
                    Some(Ok(Message::Text(text))) => return Some(text),
                    Some(Ok(Message::Close(_))) | None => return None,
                    Some(Ok(Message::Binary(_))) => {
                        send_error(
                            outbound_tx,
                            &ProtocolError::Malformed("binary frames are not supported".into()),
                        );
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(error = %err, "websocket receive error");
                        return None;
                    }
                }
            }
            _ = keepalive.ticker.tick() => {
                keepalive.missed += 1;
                if keepalive.missed >= keepalive.limit {
                    warn!(missed = keepalive.missed, "keep-alive missed; dropping socket");
                    return None;
                }
                if outbound_tx.send(Message::Ping(Bytes::new())).is_err() {
                    return None;
                }
            }
            _ = outbound_tx.closed() => return None,
        }
    }
}

/// Handle the full lifecycle of the admin socket of `live`.
///
/// The caller authorized the admin and activated the session before upgrading.
pub async fn handle_admin_socket(state: SharedState, socket: WebSocket, live: Arc<LiveSession>) {
    let engine = state.config().engine;
    let (sender, mut receiver) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Message>();
    let writer_task = spawn_writer(sender, outbound_rx, engine.send_timeout());

    let connection = ClientConnection::new(outbound_tx.clone());
    let connection_id = connection.id;
    if let Err(err) = session_engine::attach_admin(&live, connection).await {
        reject_and_close(&outbound_tx, err.into());
        finalize(writer_task, outbound_tx).await;
        return;
    }

    let mut keepalive = Keepalive::new(&engine);
    while let Some(text) = next_text(&mut receiver, &outbound_tx, &mut keepalive).await {
        debug!(session_id = %live.id, payload = %text, "received admin message");
        let result = match AdminCommand::from_json_str(&text) {
            Ok(command) => session_engine::handle_admin_command(&state, &live, command)
                .await
                .map_err(ProtocolError::from),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            warn!(session_id = %live.id, error = %err, "admin action rejected");
            send_error(&outbound_tx, &err);
        }
    }

    session_engine::detach_admin(&live, connection_id).await;
    finalize(writer_task, outbound_tx).await;
}

/// Handle the full lifecycle of a player socket.
///
/// The first frame must be a join naming an invitation code; it has to arrive
/// within the join timeout.
pub async fn handle_player_socket(
    state: SharedState,
    socket: WebSocket,
    identity: Option<Identity>,
) {
    let engine = state.config().engine;
    let (sender, mut receiver) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Message>();
    let writer_task = spawn_writer(sender, outbound_rx, engine.send_timeout());
    let mut keepalive = Keepalive::new(&engine);

    let first = timeout(
        engine.join_timeout(),
        next_text(&mut receiver, &outbound_tx, &mut keepalive),
    )
    .await;
    let text = match first {
        Ok(Some(text)) => text,
        Ok(None) => {
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Err(_) => {
            warn!("player socket did not join in time");
            reject_and_close(
                &outbound_tx,
                ProtocolError::Service(ServiceError::Timeout),
            );
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let joined = match join(&state, identity, &text, &outbound_tx).await {
        Ok(joined) => joined,
        Err(err) => {
            warn!(error = %err, "player join rejected");
            reject_and_close(&outbound_tx, err);
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };
    let (live, participation_id, connection_id) = joined;

    while let Some(text) = next_text(&mut receiver, &outbound_tx, &mut keepalive).await {
        debug!(participation_id = %participation_id, payload = %text, "received player message");
        let result = match PlayerCommand::from_json_str(&text) {
            Ok(PlayerCommand::SubmitAnswer(submission)) => {
                session_engine::submit_answer(&state, &live, participation_id, submission)
                    .await
                    .map_err(ProtocolError::from)
            }
            Ok(PlayerCommand::Join(_)) => Err(ProtocolError::Service(ServiceError::InvalidState(
                "already joined".into(),
            ))),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            warn!(participation_id = %participation_id, error = %err, "player action rejected");
            send_error(&outbound_tx, &err);
        }
    }

    session_engine::leave_player(&state, &live, participation_id, connection_id).await;
    finalize(writer_task, outbound_tx).await;
}

async fn join(
    state: &SharedState,
    identity: Option<Identity>,
    text: &str,
    outbound_tx: &mpsc::UnboundedSender<Message>,
) -> Result<(Arc<LiveSession>, Uuid, Uuid), ProtocolError> {
    let PlayerCommand::Join(request) = PlayerCommand::from_json_str(text)? else {
        return Err(ProtocolError::Service(ServiceError::InvalidState(
            "the first message must be a join".into(),
        )));
    };
    let code = request
        .code_value()
        .ok_or_else(|| ProtocolError::InvalidPayload("invalid invitation code".into()))?;

    let live = session_engine::resolve_code(state, code).await?;
    let connection = ClientConnection::new(outbound_tx.clone());
    let connection_id = connection.id;
    let participation_id =
        session_engine::join_player(state, &live, identity, &request, connection).await?;
    info!(session_id = %live.id, participation_id = %participation_id, "player socket joined");
    Ok((live, participation_id, connection_id))
}

fn reject_and_close(outbound_tx: &mpsc::UnboundedSender<Message>, err: ProtocolError) {
    send_error(outbound_tx, &err);
    let _ = outbound_tx.send(Message::Close(None));
}

async fn finalize(writer_task: JoinHandle<()>, outbound_tx: mpsc::UnboundedSender<Message>) {
    drop(outbound_tx);
    let _ = writer_task.await;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::{channel::mpsc as frames, stream};
    use serde_json::Value;
    use tokio::time::sleep;

    use super::*;
    use crate::{
        config::AppConfig, dao::session_store::MemorySessionStore,
        services::identity::TokenDirectory, state::AppState,
    };

    type Inbound = Result<Message, axum::Error>;

    fn error_kind(message: Message) -> String {
        let Message::Text(text) = message else {
            panic!("expected a text frame, got {message:?}");
        };
        let value: Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(value["event"], "error");
        value["data"]["kind"].as_str().unwrap().to_owned()
    }

    #[tokio::test(start_paused = true)]
    async fn silent_socket_is_dropped_after_the_missed_limit() {
        let engine = EngineConfig::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut keepalive = Keepalive::new(&engine);
        let mut silent = stream::pending::<Inbound>();
        let started = Instant::now();

        assert!(next_text(&mut silent, &tx, &mut keepalive).await.is_none());

        let limit = engine.keepalive_missed_limit;
        assert_eq!(started.elapsed(), engine.keepalive_interval() * limit);
        let mut pings = 0;
        while let Ok(message) = rx.try_recv() {
            assert!(matches!(message, Message::Ping(_)));
            pings += 1;
        }
        assert_eq!(pings, limit - 1);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_frames_keep_the_socket_alive() {
        let engine = EngineConfig::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut keepalive = Keepalive::new(&engine);
        let (peer, mut inbound) = frames::unbounded::<Inbound>();

        tokio::spawn(async move {
            peer.unbounded_send(Ok(Message::Binary(Bytes::from_static(b"\x01"))))
                .unwrap();
            sleep(Duration::from_secs(9)).await;
            peer.unbounded_send(Ok(Message::Pong(Bytes::new()))).unwrap();
            sleep(Duration::from_secs(9)).await;
            peer.unbounded_send(Ok(Message::Text("hello".into()))).unwrap();
        });

        let text = next_text(&mut inbound, &tx, &mut keepalive).await;
        assert_eq!(text.as_ref().map(Utf8Bytes::as_str), Some("hello"));
        assert_eq!(error_kind(rx.try_recv().unwrap()), "malformed");
    }

    #[tokio::test(start_paused = true)]
    async fn a_stalled_reader_does_not_burst_missed_probes() {
        let engine = EngineConfig::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut keepalive = Keepalive::new(&engine);
        tokio::time::advance(engine.keepalive_interval() * (engine.keepalive_missed_limit + 1))
            .await;

        let (peer, mut inbound) = frames::unbounded::<Inbound>();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            peer.unbounded_send(Ok(Message::Text("late".into()))).unwrap();
        });

        assert!(next_text(&mut inbound, &tx, &mut keepalive).await.is_some());
    }

    fn state() -> SharedState {
        AppState::new(
            Arc::new(MemorySessionStore::new()),
            Arc::new(TokenDirectory::default()),
            AppConfig::default(),
        )
    }

    #[tokio::test]
    async fn unknown_or_malformed_codes_are_rejected_and_closed() {
        let state = state();
        let cases = [
            (
                r#"{"component":"Waiting","action":"join","data":{"code":"482913","display_name":"Ana"}}"#,
                "not_found",
            ),
            (
                r#"{"component":"Waiting","action":"join","data":{"code":"48x913","display_name":"Ana"}}"#,
                "invalid_payload",
            ),
            ("not json", "malformed"),
        ];

        for (frame, kind) in cases {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let err = join(&state, None, frame, &tx).await.unwrap_err();
            assert_eq!(err.kind(), kind, "frame {frame}");

            reject_and_close(&tx, err);
            assert_eq!(error_kind(rx.try_recv().unwrap()), kind);
            assert!(matches!(rx.try_recv().unwrap(), Message::Close(None)));
        }
        assert!(state.sessions().is_empty());
    }
}
