//! **Speech Output Controller** — synthesis, playback, and the barge-in
//! kill-switch.
//!
//! At most one utterance plays at a time: every `speak` cancels whatever is
//! in flight first, and `cancel` stops playback immediately without waiting
//! for the utterance to finish. The speaking flag is mutated only here and is
//! guaranteed to return to false after every `speak`, including on error.

use crate::chat::ChatReply;
use crate::error::{VoiceError, VoiceResult};
use crate::turn::SessionEvent;
use async_trait::async_trait;
use rodio::{Decoder, OutputStream, Sink, Source};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Backend that turns reply text into audio bytes (WAV/MP3).
#[async_trait]
pub trait TtsBackend: Send + Sync {
    /// Synthesize text to audio bytes. Return an empty vec to skip playback.
    async fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>>;
}

/// API-based TTS (OpenAI-compatible `/audio/speech`).
#[derive(Debug, Clone)]
pub struct OpenAiTts {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    /// Bearer API key.
    pub api_key: String,
    /// TTS model, e.g. tts-1.
    pub model: String,
    /// Voice id (alloy, echo, fable, onyx, nova, shimmer, ...).
    pub voice: String,
    client: reqwest::Client,
}

impl OpenAiTts {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        voice: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            voice: voice.into(),
            client,
        })
    }

    /// Build from environment: `TTS_API_URL`, `TTS_API_KEY`, `TTS_MODEL`,
    /// `TTS_VOICE`.
    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("TTS_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("TTS_API_KEY")
            .map_err(|_| VoiceError::Config("TTS requires TTS_API_KEY".to_string()))?;
        let model = std::env::var("TTS_MODEL").unwrap_or_else(|_| "tts-1".to_string());
        let voice = std::env::var("TTS_VOICE").unwrap_or_else(|_| "alloy".to_string());
        Self::new(base_url, api_key, model, voice)
    }
}

#[async_trait]
impl TtsBackend for OpenAiTts {
    async fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Synthesis(format!(
                "TTS API error {}: {}",
                status, body
            )));
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// One utterance for the platform to speak: the reply text plus optional
/// pre-rendered audio. When audio is present it is played as-is.
#[derive(Debug, Clone)]
pub struct SpeechRequest {
    pub text: String,
    pub audio: Option<Vec<u8>>,
}

impl From<ChatReply> for SpeechRequest {
    fn from(reply: ChatReply) -> Self {
        Self {
            text: reply.text,
            audio: reply.audio,
        }
    }
}

/// The platform's synthesis capability: speak one utterance to completion,
/// with a hard cancel that takes effect immediately.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Speak the request. Resolves when playback finishes or is cancelled.
    async fn speak(&self, request: SpeechRequest) -> VoiceResult<()>;

    /// Stop any in-flight playback now. Idempotent; no-op when idle.
    fn cancel(&self);
}

/// Placeholder synthesizer: paces real time per word without producing audio.
/// Useful for demos and machines without an output device.
pub struct SilentSynthesizer {
    per_word: Duration,
    cancelled: Notify,
}

impl SilentSynthesizer {
    pub fn new() -> Self {
        Self::with_pace(Duration::from_millis(120))
    }

    pub fn with_pace(per_word: Duration) -> Self {
        Self {
            per_word,
            cancelled: Notify::new(),
        }
    }
}

impl Default for SilentSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpeechSynthesizer for SilentSynthesizer {
    async fn speak(&self, request: SpeechRequest) -> VoiceResult<()> {
        let words = request.text.split_whitespace().count().max(1) as u32;
        let duration = self.per_word * words;
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.cancelled.notified() => {
                debug!("silent synthesis cancelled");
            }
        }
        Ok(())
    }

    fn cancel(&self) {
        self.cancelled.notify_waiters();
    }
}

enum PlayerCmd {
    Play {
        bytes: Vec<u8>,
        done: oneshot::Sender<VoiceResult<()>>,
    },
    Stop,
}

/// Real playback: synthesizes bytes via a [`TtsBackend`] and plays them on a
/// dedicated sink thread (the rodio output stream is not `Send` on some
/// platforms, same constraint the playback layer always has). `Stop` clears
/// the queue immediately.
pub struct RodioSpeech {
    tts: Arc<dyn TtsBackend>,
    cmd_tx: Mutex<Option<std::sync::mpsc::Sender<PlayerCmd>>>,
}

impl RodioSpeech {
    pub fn new(tts: Arc<dyn TtsBackend>) -> Self {
        Self {
            tts,
            cmd_tx: Mutex::new(None),
        }
    }

    /// The sink thread is opened on first use and kept for the lifetime of
    /// this synthesizer.
    fn player(&self) -> VoiceResult<std::sync::mpsc::Sender<PlayerCmd>> {
        let mut guard = self
            .cmd_tx
            .lock()
            .map_err(|e| VoiceError::Playback(e.to_string()))?;
        if let Some(ref tx) = *guard {
            return Ok(tx.clone());
        }
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || player_thread(rx));
        *guard = Some(tx.clone());
        info!("audio output ready");
        Ok(tx)
    }
}

fn player_thread(rx: std::sync::mpsc::Receiver<PlayerCmd>) {
    let (stream, handle) = match OutputStream::try_default() {
        Ok(pair) => pair,
        Err(e) => {
            warn!("no audio output device: {}", e);
            // Keep draining so callers get an answer instead of hanging.
            while let Ok(cmd) = rx.recv() {
                if let PlayerCmd::Play { done, .. } = cmd {
                    let _ = done.send(Err(VoiceError::Playback(e.to_string())));
                }
            }
            return;
        }
    };
    let _stream = stream;
    let sink = match Sink::try_new(&handle) {
        Ok(s) => s,
        Err(e) => {
            warn!("audio sink unavailable: {}", e);
            while let Ok(cmd) = rx.recv() {
                if let PlayerCmd::Play { done, .. } = cmd {
                    let _ = done.send(Err(VoiceError::Playback(e.to_string())));
                }
            }
            return;
        }
    };

    let mut pending: Option<PlayerCmd> = None;
    loop {
        let cmd = match pending.take() {
            Some(cmd) => cmd,
            None => match rx.recv() {
                Ok(cmd) => cmd,
                Err(_) => break,
            },
        };
        match cmd {
            PlayerCmd::Stop => sink.stop(),
            PlayerCmd::Play { bytes, done } => {
                sink.stop();
                let source = match Decoder::new(Cursor::new(bytes)) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = done.send(Err(VoiceError::Playback(format!(
                            "decode failed: {}",
                            e
                        ))));
                        continue;
                    }
                };
                sink.append(source.convert_samples::<f32>());
                // Poll for completion while staying responsive to Stop.
                while !sink.empty() {
                    match rx.recv_timeout(Duration::from_millis(20)) {
                        Ok(PlayerCmd::Stop) => {
                            sink.stop();
                            break;
                        }
                        Ok(next @ PlayerCmd::Play { .. }) => {
                            sink.stop();
                            pending = Some(next);
                            break;
                        }
                        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                        Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                            sink.stop();
                            break;
                        }
                    }
                }
                let _ = done.send(Ok(()));
            }
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for RodioSpeech {
    async fn speak(&self, request: SpeechRequest) -> VoiceResult<()> {
        let bytes = match request.audio {
            Some(bytes) => bytes,
            None => self.tts.synthesize(&request.text).await?,
        };
        if bytes.is_empty() {
            return Ok(());
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.player()?
            .send(PlayerCmd::Play {
                bytes,
                done: done_tx,
            })
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))?;
        done_rx
            .await
            .map_err(|_| VoiceError::Playback("player thread gone".to_string()))?
    }

    fn cancel(&self) {
        if let Ok(guard) = self.cmd_tx.lock() {
            if let Some(ref tx) = *guard {
                let _ = tx.send(PlayerCmd::Stop);
            }
        }
    }
}

/// Tracks the speaking flag and enforces the at-most-one-synthesis invariant
/// on top of a [`SpeechSynthesizer`]. Owned by the session driver; created at
/// session start and released in teardown.
pub struct OutputController {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    events: mpsc::UnboundedSender<SessionEvent>,
    speaking: Arc<AtomicBool>,
    // Bumped on every speak and cancel; a completion watcher only reports
    // for the generation it was spawned with, so a stop that already
    // happened via cancel is never replayed.
    generation: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl OutputController {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            synthesizer,
            events,
            speaking: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            task: None,
        }
    }

    /// Whether the agent is currently producing audio.
    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    /// Cancel anything in flight, then begin speaking `reply`.
    pub fn speak(&mut self, reply: ChatReply) {
        self.cancel();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.speaking.store(true, Ordering::SeqCst);
        let _ = self.events.send(SessionEvent::SpeakingStarted);

        let synthesizer = self.synthesizer.clone();
        let speaking = self.speaking.clone();
        let generations = self.generation.clone();
        let events = self.events.clone();
        self.task = Some(tokio::spawn(async move {
            let result = synthesizer.speak(reply.into()).await;
            if generations.load(Ordering::SeqCst) == generation {
                speaking.store(false, Ordering::SeqCst);
                if let Err(e) = result {
                    // Recovered locally: the speaking flag still resets.
                    warn!("synthesis failed: {}", e);
                }
                let _ = events.send(SessionEvent::SpeakingStopped);
            }
        }));
    }

    /// Stop playback immediately. Idempotent: when nothing is playing this
    /// changes nothing and emits nothing. Takes effect before any subsequent
    /// `speak` begins.
    pub fn cancel(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.synthesizer.cancel();
        if self.speaking.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(SessionEvent::SpeakingStopped);
        }
    }
}

impl Drop for OutputController {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.synthesizer.cancel();
        self.speaking.store(false, Ordering::SeqCst);
    }
}
