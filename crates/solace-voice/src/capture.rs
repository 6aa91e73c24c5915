//! **Speech Capture Controller** — supervised continuous recognition.
//!
//! The platform's recognition capability ([`SpeechRecognizer`]) delivers
//! *bounded* streams: each `run()` call ends when the platform decides the
//! stream is over (typically after silence). The controller owns the restart
//! policy — restart iff the session is still active — so callers see one
//! effectively continuous stream of utterances for the session's lifetime.

use crate::turn::SessionEvent;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Errors a platform recognition stream can report.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// The platform heard nothing. Benign; the stream is simply restarted.
    #[error("no speech detected")]
    NoSpeech,
    /// Anything else. Session-ending.
    #[error("{0}")]
    Platform(String),
}

/// Events a recognition stream emits while running.
#[derive(Debug, Clone)]
pub enum RecognizerEvent {
    /// Audio began on the stream, before any words were transcribed. Used to
    /// preempt playing agent audio the instant the user starts talking.
    AudioStart,
    /// Accumulated transcript text for the current utterance.
    Transcript { text: String, is_final: bool },
}

/// Capture configuration: interim results on, a single locale, and no fixed
/// utterance limit, plus the delay before a restarted stream is opened.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Recognition locale (default "en-US").
    pub language: String,
    /// Deliver interim (non-final) transcripts (default true).
    pub interim_results: bool,
    /// Pause before reopening a stream after the platform ends one.
    pub restart_delay: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            language: "en-US".to_string(),
            interim_results: true,
            restart_delay: Duration::from_millis(100),
        }
    }
}

/// One bounded recognition stream per `run()` call. Returning `Ok` means the
/// platform ended the stream normally; the controller decides whether to
/// reopen it.
///
/// Impls MUST send [`RecognizerEvent::AudioStart`] as soon as the platform
/// detects audio on a stream, before any transcript for it. That signal is
/// the barge-in trigger; an impl that never emits it leaves agent speech
/// uninterruptible.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    async fn run(
        &self,
        config: &CaptureConfig,
        events: mpsc::UnboundedSender<RecognizerEvent>,
    ) -> Result<(), CaptureError>;
}

/// Supervises the platform recognizer for the lifetime of one session.
///
/// Exactly one controller exists per active session. Dropping it (or calling
/// [`CaptureController::stop`]) tears the capture task down.
pub struct CaptureController {
    task: JoinHandle<()>,
}

impl CaptureController {
    /// Start supervised capture, forwarding utterances and audio-activity
    /// notifications into the session event queue. Spawning cannot fail;
    /// platform errors arrive later as [`SessionEvent::CaptureFailed`].
    pub fn start(
        recognizer: Arc<dyn SpeechRecognizer>,
        config: CaptureConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let task = tokio::spawn(async move {
            info!("capture started (locale {})", config.language);
            loop {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let forward = {
                    let events = events.clone();
                    async move {
                        while let Some(ev) = rx.recv().await {
                            let mapped = match ev {
                                RecognizerEvent::AudioStart => SessionEvent::AudioActivity,
                                RecognizerEvent::Transcript { text, is_final } => {
                                    SessionEvent::Utterance { text, is_final }
                                }
                            };
                            if events.send(mapped).is_err() {
                                // Driver gone; session is over.
                                return;
                            }
                        }
                    }
                };
                // Drain the stream fully before deciding to restart so a
                // final delivered right at stream end is neither lost nor
                // replayed by the next stream.
                let (result, _) = tokio::join!(recognizer.run(&config, tx), forward);
                match result {
                    Ok(()) => debug!("capture stream ended, restarting"),
                    Err(CaptureError::NoSpeech) => debug!("no speech detected, restarting"),
                    Err(e) => {
                        error!("capture failed: {}", e);
                        let _ = events.send(SessionEvent::CaptureFailed {
                            reason: e.to_string(),
                        });
                        break;
                    }
                }
                tokio::time::sleep(config.restart_delay).await;
            }
        });
        Self { task }
    }

    /// Stop capture. The platform stream is discarded, never reused.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Keyboard-driven recognizer for demos and development: every stdin line is
/// one final utterance, preceded by an audio-activity notification (typing a
/// line while the agent is speaking barge-ins exactly like real speech).
/// EOF is reported as a platform failure so closing stdin ends the session.
#[derive(Debug, Default)]
pub struct TypedInputRecognizer;

#[async_trait]
impl SpeechRecognizer for TypedInputRecognizer {
    async fn run(
        &self,
        _config: &CaptureConfig,
        events: mpsc::UnboundedSender<RecognizerEvent>,
    ) -> Result<(), CaptureError> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let _ = events.send(RecognizerEvent::AudioStart);
                    let _ = events.send(RecognizerEvent::Transcript {
                        text: line,
                        is_final: true,
                    });
                }
                Ok(None) => return Err(CaptureError::Platform("stdin closed".to_string())),
                Err(e) => return Err(CaptureError::Platform(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    /// Scripted platform: first stream ends normally, second reports
    /// "no speech", third dies. The controller must restart across the first
    /// two and give up on the third.
    struct FlakyRecognizer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SpeechRecognizer for FlakyRecognizer {
        async fn run(
            &self,
            _config: &CaptureConfig,
            events: mpsc::UnboundedSender<RecognizerEvent>,
        ) -> Result<(), CaptureError> {
            match self.calls.fetch_add(1, Ordering::SeqCst) {
                0 => {
                    let _ = events.send(RecognizerEvent::AudioStart);
                    let _ = events.send(RecognizerEvent::Transcript {
                        text: "one".to_string(),
                        is_final: true,
                    });
                    Ok(())
                }
                1 => Err(CaptureError::NoSpeech),
                2 => {
                    let _ = events.send(RecognizerEvent::Transcript {
                        text: "two".to_string(),
                        is_final: true,
                    });
                    Ok(())
                }
                _ => Err(CaptureError::Platform("device lost".to_string())),
            }
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for capture event")
            .expect("capture channel closed")
    }

    #[tokio::test]
    async fn restarts_until_fatal_error_then_reports_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = CaptureConfig {
            restart_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let controller = CaptureController::start(
            Arc::new(FlakyRecognizer {
                calls: AtomicUsize::new(0),
            }),
            config,
            tx,
        );

        assert!(matches!(next(&mut rx).await, SessionEvent::AudioActivity));
        match next(&mut rx).await {
            SessionEvent::Utterance { text, is_final } => {
                assert_eq!(text, "one");
                assert!(is_final);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        // Survives the normal end and the no-speech error.
        match next(&mut rx).await {
            SessionEvent::Utterance { text, .. } => assert_eq!(text, "two"),
            other => panic!("unexpected event: {:?}", other),
        }
        match next(&mut rx).await {
            SessionEvent::CaptureFailed { reason } => assert_eq!(reason, "device lost"),
            other => panic!("unexpected event: {:?}", other),
        }

        controller.stop();
    }

    #[test]
    fn capture_config_defaults() {
        let c = CaptureConfig::default();
        assert_eq!(c.language, "en-US");
        assert!(c.interim_results);
    }
}
