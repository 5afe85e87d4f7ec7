//! # WebSocket Emotion Streaming Handler
//!
//! Clients connect to `/ws`, stream microphone audio, and receive one JSON
//! outcome per chunk (or only ready outcomes, depending on `audio.emit_policy`).
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: A session slot is reserved before the upgrade; a full
//!    server answers 503 instead of upgrading
//! 2. **Audio**: Text frames `{"audio": [...], "timestamp": 1712}` (`samples` also
//!    accepted) or binary frames of little-endian `f32` samples. The frame size
//!    limit follows `performance.max_chunk_samples`
//! 3. **Outcomes**: `{"ready", "silence", "notReadyReason", "emotion", "confidence",
//!    "allEmotions", "level", "inputTimestamp"}`
//! 4. **Errors**: Undecodable frames get `{"error": {"code", "message"}}` and the
//!    session continues
//! 5. **Heartbeat**: Ping every 30s; no traffic for 60s closes the connection
//!
//! ## Backpressure:
//! Each chunk is processed inside `ctx.wait`, which stops the actor from reading
//! further frames until the classifier call returns. Pending frames queue in the
//! transport, never inside the pipeline.

use crate::audio::codec::{self, CodecError};
use crate::audio::{InputChunk, OutcomeRecord, ProcessingOutcome, SessionCoordinator};
use crate::error::AppError;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often a ping is sent to the client.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Close the connection when nothing has been heard for this long.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Error frame sent for input the server could not use.
#[derive(Debug, Serialize)]
pub struct ErrorFrame {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ErrorFrame {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code: code.into(),
                message: message.into(),
            },
        }
    }
}

impl From<&CodecError> for ErrorFrame {
    fn from(err: &CodecError) -> Self {
        ErrorFrame::new(err.code(), err.to_string())
    }
}

/// One actor per WebSocket connection.
///
/// ## Actor Model:
/// The actor owns the session's [`SessionCoordinator`]. While a chunk is being
/// classified the coordinator is moved onto a blocking thread and `coordinator`
/// is `None`; `ctx.wait` guarantees no other frame is handled in the meantime.
pub struct EmotionWebSocket {
    session_id: String,
    coordinator: Option<SessionCoordinator>,
    app_state: web::Data<AppState>,
    max_chunk_samples: usize,
    last_heartbeat: Instant,
}

impl EmotionWebSocket {
    pub fn new(
        session_id: String,
        coordinator: SessionCoordinator,
        app_state: web::Data<AppState>,
        max_chunk_samples: usize,
    ) -> Self {
        Self {
            session_id,
            coordinator: Some(coordinator),
            app_state,
            max_chunk_samples,
            last_heartbeat: Instant::now(),
        }
    }

    fn send_json<T: Serialize>(&self, ctx: &mut ws::WebsocketContext<Self>, message: &T) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(session_id = %self.session_id, error = %e, "Failed to serialize message"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, frame: ErrorFrame) {
        warn!(
            session_id = %self.session_id,
            code = %frame.error.code,
            message = %frame.error.message,
            "Rejected client frame"
        );
        self.send_json(ctx, &frame);
    }

    fn send_outcome(&self, ctx: &mut ws::WebsocketContext<Self>, outcome: &ProcessingOutcome) {
        self.send_json(ctx, &OutcomeRecord::from(outcome));
    }

    /// Run one chunk through the coordinator on a blocking thread.
    fn process_chunk(&mut self, chunk: InputChunk, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(mut coordinator) = self.coordinator.take() else {
            self.send_error(ctx, ErrorFrame::new("busy", "Previous chunk is still being processed"));
            return;
        };

        let work = async move {
            tokio::task::spawn_blocking(move || {
                let result = coordinator.handle_chunk(chunk);
                (coordinator, result)
            })
            .await
        };

        ctx.wait(work.into_actor(self).map(|joined, act, ctx| match joined {
            Ok((coordinator, result)) => {
                act.app_state.sessions.update(&act.session_id, coordinator.stats());
                act.coordinator = Some(coordinator);

                match result {
                    Ok(Some(outcome)) => act.send_outcome(ctx, &outcome),
                    Ok(None) => {}
                    Err(failure) => {
                        act.send_error(ctx, ErrorFrame::new("model_unavailable", failure.to_string()));
                        ctx.close(Some(ws::CloseReason {
                            code: ws::CloseCode::Error,
                            description: Some("classifier unavailable".to_string()),
                        }));
                        ctx.stop();
                    }
                }
            }
            Err(e) => {
                error!(session_id = %act.session_id, error = %e, "Chunk processing task failed");
                ctx.stop();
            }
        }));
    }
}

impl Actor for EmotionWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.app_state.record_session_started();
        info!(session_id = %self.session_id, "Streaming session started");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session_id = %act.session_id, "Heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let stats = self.app_state.sessions.remove(&self.session_id);

        match stats {
            Some(stats) => info!(
                session_id = %self.session_id,
                chunks = stats.chunks_received,
                ready = stats.ready,
                inference_errors = stats.inference_errors,
                avg_inference_ms = stats.average_inference_ms(),
                "Streaming session ended"
            ),
            None => info!(session_id = %self.session_id, "Streaming session ended"),
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for EmotionWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match codec::decode_text_frame(&text, self.max_chunk_samples) {
                    Ok(chunk) => self.process_chunk(chunk, ctx),
                    Err(err) => self.send_error(ctx, ErrorFrame::from(&err)),
                }
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                match codec::decode_binary_frame(&data, self.max_chunk_samples) {
                    Ok(chunk) => self.process_chunk(chunk, ctx),
                    Err(err) => self.send_error(ctx, ErrorFrame::from(&err)),
                }
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(session_id = %self.session_id, reason = ?reason, "Client closed connection");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                self.send_error(ctx, ErrorFrame::new("unsupported_frame", "Fragmented messages are not supported"));
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Reserves a session slot, builds the session's coordinator from the current
/// audio settings and hands the connection to an [`EmotionWebSocket`] actor.
pub async fn emotion_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let config = app_state.get_config();

    let session_id = app_state
        .sessions
        .register(config.performance.max_concurrent_sessions)
        .map_err(|e| {
            warn!(error = %e, "Rejecting WebSocket connection");
            AppError::from(e)
        })?;

    debug!(session_id = %session_id, peer = ?req.connection_info().peer_addr(), "WebSocket upgrade requested");

    let coordinator = SessionCoordinator::new(session_id.clone(), &config.audio, app_state.classifier.clone());
    let actor = EmotionWebSocket::new(
        session_id.clone(),
        coordinator,
        app_state.clone(),
        config.performance.max_chunk_samples,
    );

    // The actor never starts on a failed handshake, so release the slot here.
    ws::WsResponseBuilder::new(actor, &req, stream)
        .frame_size(codec::max_frame_bytes(config.performance.max_chunk_samples))
        .start()
        .map_err(|e| {
            app_state.sessions.remove(&session_id);
            e
        })
}
