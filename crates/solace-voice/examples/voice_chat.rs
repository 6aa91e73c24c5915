//! Voice Chat Demo — full conversation loop against the companion backend.
//!
//! Speech input is simulated from the keyboard: every line you type is one
//! final utterance, and typing while the agent is "speaking" barge-ins just
//! like real speech would. Replies are spoken through rodio when
//! `TTS_API_KEY` is set, otherwise paced silently.
//!
//! Environment: `CHAT_API_URL` (default http://localhost:8000),
//! `AGENT_MODEL` (`gpt4` or `gemini`), `TTS_API_KEY` / `TTS_VOICE` for audio.

use solace_voice::{
    AgentModel, CaptureConfig, HttpChatClient, OpenAiTts, PermissionState, RodioSpeech,
    SessionManager, SilentSynthesizer, SpeechSynthesizer, StaticPermission, TurnState,
    TypedInputRecognizer,
};
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Voice Chat Demo — type a line to speak, Ctrl+C (or close stdin) to stop.");

    let chat = Arc::new(HttpChatClient::from_env()?);

    let synthesizer: Arc<dyn SpeechSynthesizer> = match OpenAiTts::from_env() {
        Ok(tts) => {
            info!("Synthesis: rodio playback with API TTS (voice {}).", tts.voice);
            Arc::new(RodioSpeech::new(Arc::new(tts)))
        }
        Err(_) => {
            info!("Synthesis: silent pacing (set TTS_API_KEY to hear replies).");
            Arc::new(SilentSynthesizer::new())
        }
    };

    let model = match std::env::var("AGENT_MODEL").as_deref() {
        Ok("gemini") => AgentModel::Gemini,
        _ => AgentModel::Gpt4,
    };

    let mut manager = SessionManager::new(
        chat,
        Arc::new(TypedInputRecognizer),
        synthesizer,
        Arc::new(StaticPermission(PermissionState::Granted)),
        CaptureConfig::default(),
    );

    if !manager.probe_backend().await {
        info!("Backend is unreachable; is it running at CHAT_API_URL?");
        return Ok(());
    }

    // Render every observable state change until the session goes idle.
    let mut ui = manager.ui_state();
    let render = tokio::spawn(async move {
        let mut shown_turns = 0;
        while ui.changed().await.is_ok() {
            let snapshot = ui.borrow_and_update().clone();
            for turn in snapshot.turns.iter().skip(shown_turns) {
                info!("you:   {}", turn.user);
                info!("agent: {}", turn.agent);
            }
            shown_turns = snapshot.turns.len();
            if let Some(notice) = &snapshot.notice {
                info!("! {}", notice);
            }
            match snapshot.state {
                TurnState::Listening => info!("(listening)"),
                TurnState::Thinking => info!("(thinking...)"),
                TurnState::AgentSpeaking => info!("(agent speaking — type to interrupt)"),
                TurnState::Idle => break,
            }
        }
    });

    manager.start(model).await?;
    info!("Session started with {}.", model);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, ending session.");
        }
        _ = render => {
            info!("Session ended.");
        }
    }
    manager.end().await;

    info!("Goodbye.");
    Ok(())
}
