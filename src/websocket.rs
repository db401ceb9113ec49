//! # WebSocket Session Transport
//!
//! Real-time transport for voice-driven practice sessions. Clients connect
//! to `/ws/session`, start a session, then stream edit and speech events;
//! the server pushes state changes and spoken feedback back as JSON.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: client connects and receives heartbeat pings
//! 2. **start_session**: creates the session and returns the first question
//! 3. **Events**: `code_edit`, `listening`, `transcript`, `force_analyze`
//! 4. **Server pushes**: `session_status`, `feedback`, `question_changed`
//! 5. **end_session**: tears the session down; the socket stays usable for
//!    a fresh `start_session`
//!
//! One socket owns at most one live session. Dropping the connection ends
//! the session.

use crate::session::{SessionEvent, SessionListener, SessionOrchestrator};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often the server pings the client.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// How long a silent client is tolerated before the socket is dropped.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Messages the client may send.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Create a session on this socket.
    #[serde(rename = "start_session")]
    StartSession {
        /// Programming language of the practice code
        language: Option<String>,
    },

    /// The code buffer changed.
    #[serde(rename = "code_edit")]
    CodeEdit { code: String },

    /// Speech capture started.
    #[serde(rename = "listening")]
    Listening,

    /// A finalized speech transcript.
    #[serde(rename = "transcript")]
    Transcript { text: String },

    /// Analyze immediately, skipping the debounce wait.
    #[serde(rename = "force_analyze")]
    ForceAnalyze,

    /// Tear the session down.
    #[serde(rename = "end_session")]
    EndSession,
}

/// Messages the server pushes.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "session_started")]
    SessionStarted { session_id: String, question: String },

    #[serde(rename = "session_status")]
    SessionStatus { session_id: String, state: String },

    #[serde(rename = "feedback")]
    Feedback {
        session_id: String,
        text: String,
        is_fallback: bool,
    },

    #[serde(rename = "question_changed")]
    QuestionChanged { session_id: String, question: String },

    #[serde(rename = "error")]
    Error { code: String, message: String },
}

/// Session event forwarded into the actor mailbox.
#[derive(Message)]
#[rtype(result = "()")]
struct SocketEvent(SessionEvent);

/// Bridges the orchestrator's listener seam onto the actor mailbox.
/// `do_send` never blocks, which keeps orchestration paths cheap.
struct SocketListener {
    addr: Addr<SessionSocket>,
}

impl SessionListener for SocketListener {
    fn on_event(&self, event: SessionEvent) {
        self.addr.do_send(SocketEvent(event));
    }
}

/// WebSocket actor owning one client connection and at most one session.
pub struct SessionSocket {
    app_state: web::Data<AppState>,

    /// Rate-limiter key for this connection (client IP)
    client_id: String,

    session: Option<Arc<SessionOrchestrator>>,

    last_heartbeat: Instant,
}

impl SessionSocket {
    pub fn new(app_state: web::Data<AppState>, client_id: String) -> Self {
        Self {
            app_state,
            client_id,
            session: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, msg: &ServerMessage) {
        match serde_json::to_string(msg) {
            Ok(json) => ctx.text(json),
            Err(err) => warn!(error = %err, "failed to serialize server message"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        warn!(code = %code, message = %message, "websocket error sent to client");
        self.send(
            ctx,
            &ServerMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    fn handle_start_session(
        &mut self,
        language: Option<String>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        if self.session.is_some() {
            self.send_error(ctx, "session_exists", "A session is already active on this connection");
            return;
        }

        let config = self.app_state.get_config();
        let listener = Arc::new(SocketListener {
            addr: ctx.address(),
        });
        let session = SessionOrchestrator::new(
            self.client_id.clone(),
            language.unwrap_or_else(|| "javascript".to_string()),
            Duration::from_millis(config.analysis.debounce_ms),
            Arc::clone(&self.app_state.limiter),
            Arc::clone(&self.app_state.scheduler),
            Arc::clone(&self.app_state.audio_queue),
            Arc::clone(&self.app_state.backend),
            Arc::clone(&self.app_state.fallback),
            listener,
        );
        self.app_state.sessions.register(Arc::clone(&session));

        info!(session_id = %session.id(), client_id = %self.client_id, "websocket session started");
        self.send(
            ctx,
            &ServerMessage::SessionStarted {
                session_id: session.id().to_string(),
                question: session.question(),
            },
        );
        self.session = Some(session);
    }

    fn handle_end_session(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        match self.session.take() {
            Some(session) => {
                let session_id = session.id().to_string();
                self.app_state.sessions.end_session(&session_id);
                self.send(
                    ctx,
                    &ServerMessage::SessionStatus {
                        session_id,
                        state: "ended".to_string(),
                    },
                );
            }
            None => self.send_error(ctx, "no_session", "No active session on this connection"),
        }
    }

    fn handle_client_message(
        &mut self,
        msg: ClientMessage,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        match msg {
            ClientMessage::StartSession { language } => self.handle_start_session(language, ctx),
            ClientMessage::EndSession => self.handle_end_session(ctx),
            ClientMessage::CodeEdit { code } => match &self.session {
                Some(session) => session.handle_edit(code),
                None => self.send_error(ctx, "no_session", "Send start_session first"),
            },
            ClientMessage::Listening => match &self.session {
                Some(session) => session.handle_listening(),
                None => self.send_error(ctx, "no_session", "Send start_session first"),
            },
            ClientMessage::Transcript { text } => match &self.session {
                Some(session) => {
                    let session = Arc::clone(session);
                    tokio::spawn(async move {
                        session.handle_transcript(text).await;
                    });
                }
                None => self.send_error(ctx, "no_session", "Send start_session first"),
            },
            ClientMessage::ForceAnalyze => match &self.session {
                Some(session) => {
                    let session = Arc::clone(session);
                    tokio::spawn(async move {
                        session.force_analyze().await;
                    });
                }
                None => self.send_error(ctx, "no_session", "Send start_session first"),
            },
        }
    }
}

impl Actor for SessionSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(client_id = %self.client_id, "websocket connection started");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(client_id = %act.client_id, "websocket heartbeat timeout, closing");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(session) = self.session.take() {
            info!(session_id = %session.id(), "connection dropped, ending session");
            self.app_state.sessions.end_session(session.id());
        }
        info!(client_id = %self.client_id, "websocket connection stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SessionSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => self.handle_client_message(msg, ctx),
                Err(err) => {
                    self.send_error(ctx, "invalid_json", &format!("Invalid message: {}", err));
                }
            },
            Ok(ws::Message::Binary(_)) => {
                self.send_error(ctx, "unsupported", "Binary frames are not part of this protocol");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(client_id = %self.client_id, reason = ?reason, "websocket closed by client");
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(error = %err, "websocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<SocketEvent> for SessionSocket {
    type Result = ();

    fn handle(&mut self, msg: SocketEvent, ctx: &mut Self::Context) {
        let session_id = match &self.session {
            Some(session) => session.id().to_string(),
            // Events may trail in right after end_session; drop them.
            None => return,
        };

        let out = match msg.0 {
            SessionEvent::StateChanged(state) => ServerMessage::SessionStatus {
                session_id,
                state: state.as_str().to_string(),
            },
            SessionEvent::Feedback { text, is_fallback } => ServerMessage::Feedback {
                session_id,
                text,
                is_fallback,
            },
            SessionEvent::QuestionChanged(question) => ServerMessage::QuestionChanged {
                session_id,
                question,
            },
        };
        self.send(ctx, &out);
    }
}

/// HTTP to WebSocket upgrade for `/ws/session`.
pub async fn session_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let client_id = req
        .connection_info()
        .realip_remote_addr()
        .unwrap_or("unknown")
        .to_string();
    debug!(client_id = %client_id, "websocket connection request");

    ws::start(SessionSocket::new(app_state, client_id), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_deserialize_by_tag() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"start_session","language":"python"}"#).unwrap();
        match msg {
            ClientMessage::StartSession { language } => {
                assert_eq!(language.as_deref(), Some("python"));
            }
            _ => panic!("wrong message type"),
        }

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"code_edit","code":"let x = 1;"}"#).unwrap();
        match msg {
            ClientMessage::CodeEdit { code } => assert_eq!(code, "let x = 1;"),
            _ => panic!("wrong message type"),
        }

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"force_analyze"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::ForceAnalyze));
    }

    #[test]
    fn start_session_language_is_optional() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"start_session"}"#).unwrap();
        match msg {
            ClientMessage::StartSession { language } => assert!(language.is_none()),
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn server_messages_carry_the_tag() {
        let json = serde_json::to_string(&ServerMessage::Feedback {
            session_id: "abc".to_string(),
            text: "try a hash map".to_string(),
            is_fallback: true,
        })
        .unwrap();
        assert!(json.contains(r#""type":"feedback""#));
        assert!(json.contains(r#""is_fallback":true"#));

        let json = serde_json::to_string(&ServerMessage::SessionStatus {
            session_id: "abc".to_string(),
            state: "speaking".to_string(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"session_status""#));
        assert!(json.contains(r#""state":"speaking""#));
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let result = serde_json::from_str::<ClientMessage>(r#"{"type":"upload_audio"}"#);
        assert!(result.is_err());
    }
}
