//! # Session Orchestration
//!
//! The state machine binding the core together. A session receives edit
//! and speech events, coalesces them through the [`AnalysisScheduler`],
//! asks the [`RateLimiter`] for admission, calls the reasoning backend
//! (falling back to the rule analyzer on any failure), and enqueues the
//! resulting feedback into the [`AudioPlaybackQueue`].
//!
//! ## Session Lifecycle:
//! 1. **Idle**: waiting for input; edits re-arm the debounce timer
//! 2. **Listening**: active speech capture; a finalized transcript
//!    triggers analysis as a chat message
//! 3. **Analyzing**: admission check, backend call, fallback on failure
//! 4. **Speaking**: feedback is playing; new edits are recorded but no
//!    analysis fires until playback ends
//! 5. **Ended**: terminal; timers cancelled, queued audio purged
//!
//! All other components are stateless or keyed by id; only this module
//! owns and branches on [`SessionState`].

use crate::analysis::{AnalysisContext, Exchange, FallbackAnalyzer, ReasoningBackend};
use crate::audio::{AudioPlaybackQueue, QueueItem};
use crate::limiter::RateLimiter;
use crate::scheduler::AnalysisScheduler;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fixed bank of practice questions rotated by the "new question" voice
/// command. Content generation is out of scope; the bank is static.
const QUESTION_BANK: &[&str] = &[
    "Reverse a singly linked list in place.",
    "Given an array of integers, return the indices of two numbers that add up to a target.",
    "Check whether a string is a valid sequence of balanced brackets.",
    "Find the longest substring without repeating characters.",
    "Merge two sorted arrays into one sorted array.",
    "Given a binary tree, return its maximum depth.",
];

/// Upper bound on stored conversation entries (10 exchanges).
const MAX_CONVERSATION_ENTRIES: usize = 20;

/// Legal states of a session. Owned exclusively by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Listening,
    Analyzing,
    Speaking,
    Ended,
}

impl SessionState {
    /// Wire representation for status messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Listening => "listening",
            SessionState::Analyzing => "analyzing",
            SessionState::Speaking => "speaking",
            SessionState::Ended => "ended",
        }
    }
}

/// Notifications pushed out of the core toward the transport (WebSocket
/// actor, tests, ...).
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Feedback { text: String, is_fallback: bool },
    QuestionChanged(String),
}

/// Transport-side observer of a session. Implementations must be cheap
/// and non-blocking; they are called from orchestration paths.
pub trait SessionListener: Send + Sync {
    fn on_event(&self, event: SessionEvent);
}

/// Listener that discards everything (HTTP-only usage, tests).
pub struct NullListener;

impl SessionListener for NullListener {
    fn on_event(&self, _event: SessionEvent) {}
}

/// What caused an analysis run, for logging and chat handling.
enum AnalysisTrigger {
    Debounce,
    Manual,
    Chat(String),
}

impl AnalysisTrigger {
    fn name(&self) -> &'static str {
        match self {
            AnalysisTrigger::Debounce => "debounce",
            AnalysisTrigger::Manual => "manual",
            AnalysisTrigger::Chat(_) => "chat",
        }
    }
}

/// Voice commands recognized at the transcript level. These short-circuit
/// the state machine and never reach the backend.
#[derive(Debug, PartialEq)]
enum VoiceCommand {
    NewQuestion,
    Reset,
}

fn parse_voice_command(transcript: &str) -> Option<VoiceCommand> {
    let normalized = transcript.trim().trim_end_matches(['.', '!', '?']).to_lowercase();
    if normalized.contains("new question") || normalized.contains("next question") {
        return Some(VoiceCommand::NewQuestion);
    }
    if normalized == "reset" || normalized == "clear" || normalized.contains("start over") {
        return Some(VoiceCommand::Reset);
    }
    None
}

struct SessionInner {
    state: SessionState,
    code: String,
    language: String,
    question_index: usize,
    conversation: Vec<Exchange>,

    /// Set when an edit arrives during Analyzing/Speaking; drives the
    /// fresh debounce re-arm when playback ends
    edit_deferred: bool,
}

/// One user's practice session. Shared as `Arc`; every method takes care
/// to never hold the inner lock across an await point.
pub struct SessionOrchestrator {
    id: String,
    client_id: String,
    debounce: Duration,
    inner: Mutex<SessionInner>,
    limiter: Arc<RateLimiter>,
    scheduler: Arc<AnalysisScheduler>,
    queue: Arc<AudioPlaybackQueue>,
    backend: Arc<dyn ReasoningBackend>,
    fallback: Arc<FallbackAnalyzer>,
    listener: Arc<dyn SessionListener>,
    pub created_at: DateTime<Utc>,
}

impl SessionOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_id: String,
        language: String,
        debounce: Duration,
        limiter: Arc<RateLimiter>,
        scheduler: Arc<AnalysisScheduler>,
        queue: Arc<AudioPlaybackQueue>,
        backend: Arc<dyn ReasoningBackend>,
        fallback: Arc<FallbackAnalyzer>,
        listener: Arc<dyn SessionListener>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            client_id,
            debounce,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                code: String::new(),
                language,
                question_index: 0,
                conversation: Vec::new(),
                edit_deferred: false,
            }),
            limiter,
            scheduler,
            queue,
            backend,
            fallback,
            listener,
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    pub fn question(&self) -> String {
        let inner = self.inner.lock().unwrap();
        QUESTION_BANK[inner.question_index % QUESTION_BANK.len()].to_string()
    }

    fn emit(&self, event: SessionEvent) {
        self.listener.on_event(event);
    }

    fn set_state(&self, inner: &mut SessionInner, state: SessionState) {
        if inner.state != state {
            inner.state = state;
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn arm_debounce(self: &Arc<Self>) {
        let session = Arc::clone(self);
        self.scheduler.schedule(&self.id, self.debounce, async move {
            session.run_analysis(AnalysisTrigger::Debounce).await;
        });
    }

    /// The user changed the code buffer. While Analyzing or Speaking the
    /// edit is recorded but must not fire an analysis; otherwise the
    /// debounce timer is re-armed.
    pub fn handle_edit(self: &Arc<Self>, code: String) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == SessionState::Ended {
                return;
            }
            inner.code = code;
            if matches!(inner.state, SessionState::Analyzing | SessionState::Speaking) {
                inner.edit_deferred = true;
                return;
            }
        }
        self.arm_debounce();
    }

    /// Speech capture started.
    pub fn handle_listening(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == SessionState::Idle {
            self.set_state(&mut inner, SessionState::Listening);
        }
    }

    /// A finalized transcript arrived. Voice commands short-circuit;
    /// anything else is treated as a chat trigger and analyzed now.
    pub async fn handle_transcript(self: &Arc<Self>, transcript: String) {
        if self.state() == SessionState::Ended {
            return;
        }

        if let Some(command) = parse_voice_command(&transcript) {
            self.apply_voice_command(command);
            return;
        }

        self.scheduler.cancel(&self.id);
        self.run_analysis(AnalysisTrigger::Chat(transcript)).await;
    }

    fn apply_voice_command(&self, command: VoiceCommand) {
        self.scheduler.cancel(&self.id);
        let mut inner = self.inner.lock().unwrap();
        match command {
            VoiceCommand::NewQuestion => {
                inner.question_index = (inner.question_index + 1) % QUESTION_BANK.len();
                inner.conversation.clear();
                inner.code.clear();
                let question = QUESTION_BANK[inner.question_index].to_string();
                info!(session_id = %self.id, "rotating to a new question");
                self.set_state(&mut inner, SessionState::Idle);
                self.emit(SessionEvent::QuestionChanged(question));
            }
            VoiceCommand::Reset => {
                inner.conversation.clear();
                inner.code.clear();
                info!(session_id = %self.id, "session context reset by voice command");
                self.set_state(&mut inner, SessionState::Idle);
            }
        }
    }

    /// "Analyze now" request: skips the debounce wait but stays subject to
    /// the rate limiter like any other analysis.
    pub async fn force_analyze(self: &Arc<Self>) {
        self.scheduler.cancel(&self.id);
        self.run_analysis(AnalysisTrigger::Manual).await;
    }

    /// Run one analysis pass: admission, backend call or fallback, then
    /// hand the feedback to the playback queue. A trigger arriving while
    /// another analysis is in flight for this session is dropped; the
    /// post-playback re-arm covers the follow-up.
    async fn run_analysis(self: &Arc<Self>, trigger: AnalysisTrigger) {
        let ctx = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                SessionState::Ended => return,
                SessionState::Analyzing | SessionState::Speaking => {
                    debug!(
                        session_id = %self.id,
                        trigger = trigger.name(),
                        "analysis already in flight, dropping trigger"
                    );
                    return;
                }
                _ => {}
            }
            self.set_state(&mut inner, SessionState::Analyzing);

            let (current_message, is_chat) = match &trigger {
                AnalysisTrigger::Chat(message) => (Some(message.clone()), true),
                _ => (None, false),
            };
            AnalysisContext {
                code: inner.code.clone(),
                language: inner.language.clone(),
                question: QUESTION_BANK[inner.question_index % QUESTION_BANK.len()].to_string(),
                conversation: inner.conversation.clone(),
                current_message,
                is_chat,
            }
        };

        let decision = self.limiter.check(&self.client_id);
        let (feedback, is_fallback) = if !decision.admitted {
            debug!(
                session_id = %self.id,
                retry_after = decision.retry_after_secs,
                "analysis denied by rate limiter"
            );
            (
                format!(
                    "I'm thinking as fast as I can. Give me about {} seconds and try again.",
                    decision.retry_after_secs
                ),
                true,
            )
        } else {
            match self.backend.request_feedback(&ctx).await {
                Ok(text) => (text, false),
                Err(err) => {
                    warn!(session_id = %self.id, error = %err, "backend failed, using fallback");
                    (self.fallback.analyze(&ctx.code), true)
                }
            }
        };

        {
            let mut inner = self.inner.lock().unwrap();
            // Teardown may have raced the backend call.
            if inner.state == SessionState::Ended {
                return;
            }

            if let Some(message) = &ctx.current_message {
                inner.conversation.push(Exchange {
                    role: "user".to_string(),
                    text: message.clone(),
                });
            }
            inner.conversation.push(Exchange {
                role: "assistant".to_string(),
                text: feedback.clone(),
            });
            let overflow = inner.conversation.len().saturating_sub(MAX_CONVERSATION_ENTRIES);
            if overflow > 0 {
                inner.conversation.drain(..overflow);
            }

            self.set_state(&mut inner, SessionState::Speaking);
        }

        self.emit(SessionEvent::Feedback {
            text: feedback.clone(),
            is_fallback,
        });

        let session = Arc::clone(self);
        self.queue.enqueue(
            QueueItem::new(feedback)
                .for_session(&self.id)
                .on_end(Box::new(move |result| {
                    if let Err(err) = result {
                        debug!(session_id = %session.id, error = %err, "playback ended with error");
                    }
                    session.on_playback_end();
                })),
        );
    }

    /// Playback of this session's feedback finished (or failed, or was
    /// evicted). Leave Speaking, and re-arm the debounce timer fresh if an
    /// edit came in while we were talking.
    fn on_playback_end(self: &Arc<Self>) {
        let rearm = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == SessionState::Ended {
                return;
            }
            self.set_state(&mut inner, SessionState::Idle);
            std::mem::take(&mut inner.edit_deferred)
        };

        if rearm {
            self.arm_debounce();
        }
    }

    /// Terminal teardown: cancel pending timers, purge this session's
    /// queued audio. Idempotent, and safe for sessions that never emitted
    /// a single request.
    pub fn end(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == SessionState::Ended {
                return;
            }
            self.set_state(&mut inner, SessionState::Ended);
        }
        self.scheduler.cancel(&self.id);
        self.queue.teardown(&self.id);
        info!(session_id = %self.id, "session ended");
    }
}

/// Process-level registry of live sessions.
///
/// ## Thread Safety:
/// RwLock allows many concurrent lookups; creation and cleanup take the
/// write lock briefly.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionOrchestrator>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, session: Arc<SessionOrchestrator>) {
        self.sessions
            .write()
            .unwrap()
            .insert(session.id().to_string(), session);
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionOrchestrator>> {
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    /// End and drop a session by id. Returns whether it existed.
    pub fn end_session(&self, session_id: &str) -> bool {
        let session = self.sessions.write().unwrap().remove(session_id);
        match session {
            Some(session) => {
                session.end();
                true
            }
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Drop sessions that have reached the terminal state. Run from the
    /// periodic background sweep.
    pub fn cleanup(&self) -> usize {
        let mut sessions = self.sessions.write().unwrap();
        let before = sessions.len();
        sessions.retain(|_, session| session.state() != SessionState::Ended);
        before - sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
