//! # WebSocket Transcription Endpoint
//!
//! Clients connect to `/ws/transcribe`, send `start`, stream audio, and
//! send `stop` to get the final transcript (see [`crate::protocol`]).
//!
//! ## Connection Model:
//! - **Actor**: one [`TranscriptionSocket`] per connection parses frames and
//!   writes replies; it never touches the recognizer
//! - **Worker**: one task per connection owns the
//!   [`TranscriptionSessionController`] and handles queued messages strictly
//!   in arrival order
//! - **Queue**: bounded (`session.queue_size`). When it is full the actor
//!   stops reading the socket until the worker catches up, so audio is
//!   never dropped
//!
//! When the transport goes away the actor drops its end of the queue; the
//! worker finishes what is already queued and then finalizes the session.
//! Workers are tracked in [`AppState::workers`] so shutdown waits for them.

use crate::error::{AppError, ProtocolError};
use crate::protocol::{parse_client_message, ClientMessage, ServerMessage};
use crate::audio::AudioPayload;
use crate::session::{SessionPhase, TranscriptionSessionController};
use crate::state::{AppState, ConnectionSlot};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// An item queued for the session worker.
#[derive(Debug)]
pub enum Inbound {
    Message(ClientMessage),
    /// A frame that could not be parsed; answered with an `error` in order.
    Rejected(ProtocolError),
}

/// Sent from the worker back to the connection actor.
#[derive(Debug, Clone, PartialEq, Message)]
#[rtype(result = "()")]
pub enum Outbound {
    Message(ServerMessage),
    /// The session is over; close the connection normally.
    Close,
}

/// Drive one session until the client stops it or the queue closes.
///
/// Returns the phase the session ended in.
pub async fn run_session<E>(
    mut controller: TranscriptionSessionController,
    mut inbound: mpsc::Receiver<Inbound>,
    mut emit: E,
) -> SessionPhase
where
    E: FnMut(Outbound),
{
    while let Some(item) = inbound.recv().await {
        let message = match item {
            Inbound::Message(message) => message,
            Inbound::Rejected(err) => {
                warn!(session_id = ?controller.session_id(), %err, "Rejected client message");
                emit(Outbound::Message(ServerMessage::error(err)));
                continue;
            }
        };

        match message {
            ClientMessage::Start { metadata } => match controller.start(metadata).await {
                Ok(started) => emit(Outbound::Message(started)),
                Err(err) => {
                    warn!(%err, "Could not start session");
                    emit(Outbound::Message(ServerMessage::error(err)));
                }
            },
            ClientMessage::Audio { payload } => {
                for reply in controller.audio(payload).await {
                    emit(Outbound::Message(reply));
                }
            }
            ClientMessage::Stop => {
                match controller.stop().await {
                    Ok(replies) => replies
                        .into_iter()
                        .for_each(|reply| emit(Outbound::Message(reply))),
                    Err(err) => {
                        warn!(session_id = ?controller.session_id(), %err, "Stop rejected");
                        emit(Outbound::Message(ServerMessage::error(err)));
                    }
                }
                emit(Outbound::Close);
                return controller.phase();
            }
        }
    }

    controller.connection_lost().await;
    controller.phase()
}

/// WebSocket actor for one transcription connection.
pub struct TranscriptionSocket {
    state: web::Data<AppState>,
    /// Sender half of the worker queue; `None` once the connection stopped.
    queue: Option<mpsc::Sender<Inbound>>,
    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    _slot: ConnectionSlot,
}

impl TranscriptionSocket {
    pub fn new(state: web::Data<AppState>, slot: ConnectionSlot) -> Self {
        let session = &state.config.session;
        Self {
            heartbeat_interval: session.heartbeat_interval(),
            client_timeout: session.client_timeout(),
            state: state.clone(),
            queue: None,
            last_heartbeat: Instant::now(),
            _slot: slot,
        }
    }

    fn start_worker(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let (tx, rx) = mpsc::channel(self.state.config.session.queue_size);
        self.queue = Some(tx);

        let controller = TranscriptionSessionController::new(
            self.state.engine.clone(),
            self.state.store.clone(),
            self.state.session_settings(),
        );
        let metrics = self.state.metrics.clone();
        let addr = ctx.address();

        self.state.workers.spawn(async move {
            let phase = run_session(controller, rx, move |out| addr.do_send(out)).await;
            debug!(?phase, "Session worker finished");
            metrics.record_session(phase);
        });
    }

    /// Queue an item for the worker, pausing the socket while the queue is full.
    fn enqueue(&mut self, item: Inbound, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(queue) = &self.queue else {
            return;
        };

        match queue.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(item)) => {
                debug!("Session queue full, pausing reads");
                let queue = queue.clone();
                ctx.wait(
                    async move {
                        if queue.send(item).await.is_err() {
                            debug!("Session worker gone while waiting for queue space");
                        }
                    }
                    .into_actor(self),
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // The worker already finished after `stop`.
                debug!("Dropping message after session end");
            }
        }
    }

    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for TranscriptionSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(
            open_connections = self.state.metrics.open_connections(),
            "WebSocket connection started"
        );
        self.start_worker(ctx);
        self.heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("WebSocket connection stopped");
        // Closing the queue lets the worker drain and finalize.
        self.queue = None;
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for TranscriptionSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();
        match msg {
            Ok(ws::Message::Text(text)) => {
                let item = match parse_client_message(&text) {
                    Ok(message) => Inbound::Message(message),
                    Err(err) => Inbound::Rejected(err),
                };
                self.enqueue(item, ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                let payload = AudioPayload::Pcm(data.to_vec());
                self.enqueue(Inbound::Message(ClientMessage::Audio { payload }), ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed by client: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<Outbound> for TranscriptionSocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        match msg {
            Outbound::Message(message) => ctx.text(message.to_json()),
            Outbound::Close => {
                ctx.close(Some(ws::CloseCode::Normal.into()));
                ctx.stop();
            }
        }
    }
}

/// `GET /ws/transcribe`: upgrade to a transcription WebSocket.
///
/// Answers 503 when `performance.max_concurrent_sessions` connections are
/// already open.
pub async fn transcribe_socket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let Some(slot) = state.try_open_connection() else {
        warn!(
            limit = state.config.performance.max_concurrent_sessions,
            "Refusing WebSocket connection, session limit reached"
        );
        return Err(AppError::Unavailable("Too many active sessions".to_string()).into());
    };

    info!("New WebSocket connection from {:?}", req.connection_info().peer_addr());
    ws::start(TranscriptionSocket::new(state, slot), &req, stream)
}
