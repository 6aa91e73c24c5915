//! # Solace Voice - Real-Time Voice Conversation Core
//!
//! This crate implements the turn-taking and session-lifecycle core of a
//! voice conversation front end: continuous speech capture, a remote chat
//! agent, spoken replies, and barge-in (user speech interrupts agent speech
//! immediately).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   Session Lifecycle Manager                  │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐     │
//! │  │   Capture    │ → │     Turn     │ → │  Chat Client │     │
//! │  │ (supervised) │   │   Arbiter    │   │    (HTTP)    │     │
//! │  └──────────────┘   └──────────────┘   └──────────────┘     │
//! │         ↓                   ↑ ↓                ↓            │
//! │   audio activity     speaking state     agent replies       │
//! │         ↓                   ↑ ↓                ↓            │
//! │  ┌─────────────────────────────────────────────────┐        │
//! │  │         Output Controller (kill-switch)         │        │
//! │  └─────────────────────────────────────────────────┘        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All platform callbacks and network completions flow through one event
//! queue into the [`turn::TurnArbiter`], so the turn-taking logic is a pure,
//! testable state machine. Platform capabilities (recognition, synthesis,
//! permissions) are trait seams; the crate ships HTTP/rodio-backed impls plus
//! placeholders for development.

pub mod capture;
pub mod chat;
pub mod error;
pub mod output;
pub mod session;
pub mod turn;

pub use capture::{
    CaptureConfig, CaptureController, CaptureError, RecognizerEvent, SpeechRecognizer,
    TypedInputRecognizer,
};
pub use chat::{AgentModel, ChatClient, ChatReply, HttpChatClient, SessionToken};
pub use error::{UserNotice, VoiceError, VoiceResult};
pub use output::{
    OpenAiTts, OutputController, RodioSpeech, SilentSynthesizer, SpeechRequest,
    SpeechSynthesizer, TtsBackend,
};
pub use session::{
    BackendHealth, PermissionProbe, PermissionState, SessionManager, StaticPermission, Turn,
    UiState,
};
pub use turn::{Directive, SessionEvent, TurnArbiter, TurnState};
