//! **Session Lifecycle Manager** — session start, the active loop, and
//! teardown.
//!
//! The manager exclusively owns the session (token, model, transcript) and
//! the audio-output resource; everything else sees them through handles. The
//! active loop is a single driver task consuming one event queue: capture,
//! synthesis, and network completions all funnel through it, so the turn
//! arbiter's state checks are the only ordering authority.

use crate::capture::{CaptureConfig, CaptureController, SpeechRecognizer};
use crate::chat::{AgentModel, ChatClient, SessionToken};
use crate::error::{UserNotice, VoiceError, VoiceResult};
use crate::output::{OutputController, SpeechSynthesizer};
use crate::turn::{Directive, SessionEvent, TurnArbiter, TurnState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Result of the platform's microphone permission query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    /// Not yet decided; the platform will prompt when capture starts.
    Prompt,
    Denied,
}

/// Platform seam for the permission query consumed at session start.
#[async_trait]
pub trait PermissionProbe: Send + Sync {
    async fn microphone(&self) -> PermissionState;
}

/// Fixed-answer probe, for native environments and tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticPermission(pub PermissionState);

#[async_trait]
impl PermissionProbe for StaticPermission {
    async fn microphone(&self) -> PermissionState {
        self.0
    }
}

/// Backend reachability, from the one-shot [`SessionManager::probe_backend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendHealth {
    Unknown,
    Reachable,
    Unreachable,
}

/// One recorded exchange. The transcript is append-only, session-scoped, and
/// discarded on session end.
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub user: String,
    pub agent: String,
    pub at: DateTime<Utc>,
}

/// Observable state for rendering. Snapshots are published through a
/// `watch` channel after every processed event.
#[derive(Debug, Clone, Serialize)]
pub struct UiState {
    pub backend: BackendHealth,
    pub active: bool,
    pub state: TurnState,
    pub model: Option<AgentModel>,
    /// Accumulated text of the utterance currently being spoken by the user.
    pub live_transcript: String,
    pub turns: Vec<Turn>,
    pub agent_speaking: bool,
    pub notice: Option<UserNotice>,
}

impl UiState {
    fn inactive() -> Self {
        Self {
            backend: BackendHealth::Unknown,
            active: false,
            state: TurnState::Idle,
            model: None,
            live_transcript: String::new(),
            turns: Vec::new(),
            agent_speaking: false,
            notice: None,
        }
    }
}

struct ActiveSession {
    token: SessionToken,
    events: mpsc::UnboundedSender<SessionEvent>,
    driver: JoinHandle<()>,
}

/// Orchestrates one voice conversation at a time.
pub struct SessionManager {
    chat: Arc<dyn ChatClient>,
    recognizer: Arc<dyn SpeechRecognizer>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    permissions: Arc<dyn PermissionProbe>,
    capture_config: CaptureConfig,
    ui: watch::Sender<UiState>,
    active: Option<ActiveSession>,
}

impl SessionManager {
    pub fn new(
        chat: Arc<dyn ChatClient>,
        recognizer: Arc<dyn SpeechRecognizer>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        permissions: Arc<dyn PermissionProbe>,
        capture_config: CaptureConfig,
    ) -> Self {
        let (ui, _) = watch::channel(UiState::inactive());
        Self {
            chat,
            recognizer,
            synthesizer,
            permissions,
            capture_config,
            ui,
            active: None,
        }
    }

    /// Subscribe to observable state for rendering.
    pub fn ui_state(&self) -> watch::Receiver<UiState> {
        self.ui.subscribe()
    }

    /// One-shot backend reachability probe, used to gate whether session
    /// start is offered to the user at all.
    pub async fn probe_backend(&self) -> bool {
        let ok = self.chat.health().await;
        self.ui.send_modify(|s| {
            s.backend = if ok {
                BackendHealth::Reachable
            } else {
                BackendHealth::Unreachable
            };
        });
        ok
    }

    pub fn is_active(&self) -> bool {
        self.active
            .as_ref()
            .map(|s| !s.driver.is_finished())
            .unwrap_or(false)
    }

    fn notify(&self, notice: UserNotice) {
        warn!("{}", notice);
        self.ui.send_modify(|s| s.notice = Some(notice.clone()));
    }

    /// Start a session: permission check, remote session creation, resource
    /// acquisition, capture start. On any failure nothing stays active and
    /// anything already acquired is rolled back.
    pub async fn start(&mut self, model: AgentModel) -> VoiceResult<()> {
        if self.is_active() {
            return Err(VoiceError::SessionStartFailed(
                "a session is already active".to_string(),
            ));
        }
        // A driver that tore itself down (capture failure) leaves a finished
        // handle behind; forget it.
        self.active = None;

        if self.permissions.microphone().await == PermissionState::Denied {
            self.notify(UserNotice::PermissionDenied);
            return Err(VoiceError::PermissionDenied);
        }

        let token = match self.chat.create_session(model).await {
            Ok(token) => token,
            Err(e) => {
                let reason = e.to_string();
                self.notify(UserNotice::SessionStartFailed(reason.clone()));
                return Err(VoiceError::SessionStartFailed(reason));
            }
        };

        let (events, queue) = mpsc::unbounded_channel();
        let output = OutputController::new(self.synthesizer.clone(), events.clone());
        // Capture spawning cannot fail; platform errors surface later as
        // CaptureFailed events and the driver tears the session down.
        let capture = CaptureController::start(
            self.recognizer.clone(),
            self.capture_config.clone(),
            events.clone(),
        );

        let mut arbiter = TurnArbiter::new();
        arbiter.activate();

        // Fresh transcript, listening state, before the driver can publish.
        self.ui.send_modify(|s| {
            s.active = true;
            s.state = TurnState::Listening;
            s.model = Some(model);
            s.live_transcript.clear();
            s.turns.clear();
            s.agent_speaking = false;
            s.notice = None;
        });

        let driver = Driver {
            queue,
            events: events.clone(),
            arbiter,
            output: Some(output),
            capture: Some(capture),
            chat: self.chat.clone(),
            token: token.clone(),
            ui: self.ui.clone(),
            turns: Vec::new(),
            live: String::new(),
            notice: None,
        };
        let handle = tokio::spawn(driver.run());

        info!("session started with {} (token {})", model, token);
        self.active = Some(ActiveSession {
            token,
            events,
            driver: handle,
        });
        Ok(())
    }

    /// End the session. Cleanup is ordered and best-effort; calling this with
    /// no session active is a no-op.
    pub async fn end(&mut self) {
        let Some(session) = self.active.take() else {
            return;
        };
        if session.driver.is_finished() {
            // Capture failure already ran teardown.
            let _ = session.driver.await;
            return;
        }
        if session.events.send(SessionEvent::Shutdown).is_err() {
            return;
        }
        if let Err(e) = session.driver.await {
            error!("session driver ended abnormally: {}", e);
        }
        info!("session ended");
    }

    /// Switch the agent model serving the active session. The local
    /// transcript is kept; the backend resets its own history.
    pub async fn switch_model(&mut self, model: AgentModel) -> VoiceResult<AgentModel> {
        let token = match &self.active {
            Some(s) if !s.driver.is_finished() => s.token.clone(),
            _ => {
                return Err(VoiceError::ChatRequestFailed(
                    "no active session".to_string(),
                ))
            }
        };
        match self.chat.switch_model(&token, model).await {
            Ok(selected) => {
                self.ui.send_modify(|s| s.model = Some(selected));
                info!("switched session model to {}", selected);
                Ok(selected)
            }
            Err(e) => {
                let reason = e.to_string();
                self.notify(UserNotice::ChatRequestFailed(reason.clone()));
                Err(VoiceError::ChatRequestFailed(reason))
            }
        }
    }
}

/// The active loop: one task, one queue, explicit state checks.
struct Driver {
    queue: mpsc::UnboundedReceiver<SessionEvent>,
    events: mpsc::UnboundedSender<SessionEvent>,
    arbiter: TurnArbiter,
    output: Option<OutputController>,
    capture: Option<CaptureController>,
    chat: Arc<dyn ChatClient>,
    token: SessionToken,
    ui: watch::Sender<UiState>,
    turns: Vec<Turn>,
    live: String,
    notice: Option<UserNotice>,
}

impl Driver {
    async fn run(mut self) {
        while let Some(event) = self.queue.recv().await {
            match event {
                SessionEvent::Shutdown => {
                    self.teardown().await;
                    return;
                }
                SessionEvent::CaptureFailed { reason } => {
                    // Session-ending, but internal: nothing surfaces beyond
                    // the session going inactive.
                    error!("capture failed, ending session: {}", reason);
                    self.teardown().await;
                    return;
                }
                event => {
                    let directives = self.arbiter.on_event(event);
                    self.apply(directives);
                    self.publish();
                }
            }
        }
    }

    /// Execute directives in order. `CancelOutput` takes effect here,
    /// synchronously, before the next event is dequeued.
    fn apply(&mut self, directives: Vec<Directive>) {
        for directive in directives {
            match directive {
                Directive::CancelOutput => {
                    if let Some(output) = self.output.as_mut() {
                        output.cancel();
                    }
                }
                Directive::Speak { reply } => {
                    if let Some(output) = self.output.as_mut() {
                        output.speak(reply);
                    }
                }
                Directive::SendChat { text } => {
                    let chat = self.chat.clone();
                    let token = self.token.clone();
                    let events = self.events.clone();
                    tokio::spawn(async move {
                        match chat.send_message(&token, &text).await {
                            Ok(reply) => {
                                let _ = events.send(SessionEvent::ReplyReady {
                                    user_text: text,
                                    reply,
                                });
                            }
                            Err(e) => {
                                let _ = events.send(SessionEvent::ChatFailed {
                                    reason: e.to_string(),
                                });
                            }
                        }
                    });
                }
                Directive::RecordTurn { user, agent } => {
                    self.turns.push(Turn {
                        user,
                        agent,
                        at: Utc::now(),
                    });
                    self.live.clear();
                }
                Directive::ShowInterim { text } => {
                    self.live = text;
                }
                Directive::Notify { notice } => {
                    warn!("{}", notice);
                    self.notice = Some(notice);
                }
            }
        }
    }

    fn publish(&self) {
        let state = self.arbiter.state();
        let speaking = self
            .output
            .as_ref()
            .map(|o| o.is_speaking())
            .unwrap_or(false);
        self.ui.send_modify(|s| {
            s.active = state != TurnState::Idle;
            s.state = state;
            s.live_transcript = self.live.clone();
            s.turns = self.turns.clone();
            s.agent_speaking = speaking;
            s.notice = self.notice.clone();
        });
    }

    /// Ordered, unconditional teardown. Every step is best-effort so one
    /// failure cannot block the next.
    async fn teardown(&mut self) {
        // 1. Cancel any in-flight speech.
        if let Some(output) = self.output.as_mut() {
            output.cancel();
        }
        // 2. Clear the output controller's bindings and release the
        //    audio-output resource it holds.
        drop(self.output.take());
        // 3. Stop and discard the capture resource (never reused).
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        // 4. Tell the backend, fire-and-forget: local cleanup is already
        //    done, so a remote failure is only logged.
        let chat = self.chat.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            if let Err(e) = chat.end_session(&token).await {
                warn!("remote end-session failed (ignored): {}", e);
            }
        });
        // 5. Clear session-scoped state.
        self.arbiter.deactivate();
        self.turns.clear();
        self.live.clear();
        self.notice = None;
        self.ui.send_modify(|s| {
            s.active = false;
            s.state = TurnState::Idle;
            s.model = None;
            s.live_transcript.clear();
            s.turns.clear();
            s.agent_speaking = false;
            s.notice = None;
        });
    }
}
