//! **Turn Arbitration Unit** — the state machine at the center of the core.
//!
//! Mediates between capture and output: the user interrupting the agent
//! (barge-in) forces playback cancellation, and transcripts heard while the
//! agent is speaking are dropped so the agent's own audio is never re-captured
//! as user input.
//!
//! The arbiter is pure: it consumes [`SessionEvent`]s from a single queue and
//! returns [`Directive`]s for the session driver to execute, so the transition
//! logic is testable independent of any platform callback timing.

use crate::chat::ChatReply;
use crate::error::UserNotice;
use serde::Serialize;
use tracing::{debug, info};

/// Conversation states while a session is active (plus `Idle` for inactive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    /// No session active.
    Idle,
    /// Session active, agent silent, waiting for a final utterance.
    Listening,
    /// Final utterance sent to the remote agent, awaiting the reply.
    Thinking,
    /// The output controller is producing audio.
    AgentSpeaking,
}

/// Events funneled into the arbiter's queue. Ordering between *sources*
/// (capture, synthesis, network) is not guaranteed; the state checks below
/// resolve the races.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The platform reported audio beginning on the capture stream, before
    /// any words are transcribed. This is the barge-in trigger.
    AudioActivity,
    /// Accumulated transcript for the current utterance.
    Utterance { text: String, is_final: bool },
    /// The remote agent answered the outstanding chat request.
    ReplyReady { user_text: String, reply: ChatReply },
    /// The outstanding chat request failed; the turn is discarded.
    ChatFailed { reason: String },
    /// Output controller began producing audio.
    SpeakingStarted,
    /// Output controller finished, errored, or was cancelled.
    SpeakingStopped,
    /// Capture hit an unrecoverable platform error. Session-ending; handled
    /// by the driver, not the arbiter.
    CaptureFailed { reason: String },
    /// Explicit end request. Handled by the driver.
    Shutdown,
}

/// What the driver must do as a result of a transition. `CancelOutput` is
/// executed synchronously before the next event is dequeued.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Forward a finalized utterance to the remote chat client.
    SendChat { text: String },
    /// Hard-stop agent audio right now.
    CancelOutput,
    /// Speak an agent reply.
    Speak { reply: ChatReply },
    /// Append a completed exchange to the transcript.
    RecordTurn { user: String, agent: String },
    /// Update the live (interim) transcript shown to the user.
    ShowInterim { text: String },
    /// Surface a user-visible notice.
    Notify { notice: UserNotice },
}

/// The turn-taking state machine.
pub struct TurnArbiter {
    state: TurnState,
}

impl Default for TurnArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnArbiter {
    pub fn new() -> Self {
        Self {
            state: TurnState::Idle,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Session start: `Idle -> Listening`.
    pub fn activate(&mut self) {
        self.state = TurnState::Listening;
    }

    /// Session end: any state `-> Idle`.
    pub fn deactivate(&mut self) {
        self.state = TurnState::Idle;
    }

    /// Process one event and return the directives it triggers, in order.
    pub fn on_event(&mut self, event: SessionEvent) -> Vec<Directive> {
        match (self.state, event) {
            // Barge-in: the instant audio activity arrives while the agent is
            // speaking, cancel output and listen, regardless of whether the
            // reply finished. Any transcript accumulated afterward is a fresh
            // utterance.
            (TurnState::AgentSpeaking, SessionEvent::AudioActivity) => {
                info!("barge-in: user audio while agent speaking, cancelling output");
                self.state = TurnState::Listening;
                vec![Directive::CancelOutput]
            }

            // Agent finished uninterrupted.
            (TurnState::AgentSpeaking, SessionEvent::SpeakingStopped) => {
                debug!("agent finished speaking");
                self.state = TurnState::Listening;
                vec![]
            }

            // While the agent is audible, transcripts are presumed echo of
            // its own output and dropped. Real user speech raises
            // AudioActivity first, which has already moved us to Listening.
            (TurnState::AgentSpeaking, SessionEvent::Utterance { .. }) => vec![],

            (TurnState::Listening, SessionEvent::Utterance { text, is_final }) => {
                if !is_final {
                    return vec![Directive::ShowInterim { text }];
                }
                if text.trim().is_empty() {
                    // Whitespace-only finals never reach the chat client.
                    debug!("discarding empty final utterance");
                    return vec![];
                }
                info!("final utterance, requesting reply");
                self.state = TurnState::Thinking;
                vec![
                    Directive::ShowInterim { text: text.clone() },
                    Directive::SendChat { text },
                ]
            }

            (TurnState::Thinking, SessionEvent::ReplyReady { user_text, reply }) => {
                info!("reply received ({} chars)", reply.text.len());
                vec![
                    Directive::RecordTurn {
                        user: user_text,
                        agent: reply.text.clone(),
                    },
                    Directive::Speak { reply },
                ]
            }

            (TurnState::Thinking, SessionEvent::SpeakingStarted) => {
                self.state = TurnState::AgentSpeaking;
                vec![]
            }

            (TurnState::Thinking, SessionEvent::ChatFailed { reason }) => {
                self.state = TurnState::Listening;
                vec![Directive::Notify {
                    notice: UserNotice::ChatRequestFailed(reason),
                }]
            }

            // Capture keeps flowing while a request is outstanding; we only
            // withhold further chat requests. The text stays visible.
            (TurnState::Thinking, SessionEvent::Utterance { text, .. }) => {
                vec![Directive::ShowInterim { text }]
            }

            // A speak began but barge-in (or end) already cancelled it; the
            // stop event for it is equally stale.
            (TurnState::Listening, SessionEvent::SpeakingStarted)
            | (TurnState::Listening, SessionEvent::SpeakingStopped)
            | (TurnState::Thinking, SessionEvent::SpeakingStopped) => {
                debug!("ignoring stale speaking transition in {:?}", self.state);
                vec![]
            }

            // Audio activity with nothing playing needs no reaction.
            (TurnState::Listening, SessionEvent::AudioActivity)
            | (TurnState::Thinking, SessionEvent::AudioActivity) => vec![],

            // Late callbacks after session end.
            (TurnState::Idle, _) => vec![],

            (state, event) => {
                debug!("no transition for {:?} in {:?}", event, state);
                vec![]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active() -> TurnArbiter {
        let mut a = TurnArbiter::new();
        a.activate();
        a
    }

    fn final_utterance(text: &str) -> SessionEvent {
        SessionEvent::Utterance {
            text: text.to_string(),
            is_final: true,
        }
    }

    #[test]
    fn starts_idle_and_activates_to_listening() {
        let mut a = TurnArbiter::new();
        assert_eq!(a.state(), TurnState::Idle);
        a.activate();
        assert_eq!(a.state(), TurnState::Listening);
    }

    #[test]
    fn final_utterance_sends_chat_and_enters_thinking() {
        let mut a = active();
        let out = a.on_event(final_utterance("I feel anxious"));
        assert_eq!(a.state(), TurnState::Thinking);
        assert!(out.contains(&Directive::SendChat {
            text: "I feel anxious".to_string()
        }));
    }

    #[test]
    fn whitespace_final_is_discarded_silently() {
        let mut a = active();
        let out = a.on_event(final_utterance("   \n\t"));
        assert_eq!(a.state(), TurnState::Listening);
        assert!(out.is_empty());
    }

    #[test]
    fn interim_is_display_only() {
        let mut a = active();
        let out = a.on_event(SessionEvent::Utterance {
            text: "I fee".to_string(),
            is_final: false,
        });
        assert_eq!(a.state(), TurnState::Listening);
        assert_eq!(
            out,
            vec![Directive::ShowInterim {
                text: "I fee".to_string()
            }]
        );
    }

    #[test]
    fn reply_records_turn_then_speaks() {
        let mut a = active();
        a.on_event(final_utterance("hello"));
        let out = a.on_event(SessionEvent::ReplyReady {
            user_text: "hello".to_string(),
            reply: ChatReply::text("Tell me more"),
        });
        assert_eq!(
            out[0],
            Directive::RecordTurn {
                user: "hello".to_string(),
                agent: "Tell me more".to_string()
            }
        );
        assert_eq!(
            out[1],
            Directive::Speak {
                reply: ChatReply::text("Tell me more")
            }
        );
        // AgentSpeaking only once the output controller actually starts.
        assert_eq!(a.state(), TurnState::Thinking);
        a.on_event(SessionEvent::SpeakingStarted);
        assert_eq!(a.state(), TurnState::AgentSpeaking);
    }

    #[test]
    fn barge_in_cancels_and_returns_to_listening() {
        let mut a = active();
        a.on_event(final_utterance("hello"));
        a.on_event(SessionEvent::ReplyReady {
            user_text: "hello".to_string(),
            reply: ChatReply::text("Tell me more"),
        });
        a.on_event(SessionEvent::SpeakingStarted);
        let out = a.on_event(SessionEvent::AudioActivity);
        assert_eq!(out, vec![Directive::CancelOutput]);
        assert_eq!(a.state(), TurnState::Listening);
        // The stop event for the cancelled utterance arrives later; stale.
        let out = a.on_event(SessionEvent::SpeakingStopped);
        assert!(out.is_empty());
        assert_eq!(a.state(), TurnState::Listening);
    }

    #[test]
    fn natural_end_of_speech_returns_to_listening() {
        let mut a = active();
        a.on_event(final_utterance("hello"));
        a.on_event(SessionEvent::ReplyReady {
            user_text: "hello".to_string(),
            reply: ChatReply::text("mm-hm"),
        });
        a.on_event(SessionEvent::SpeakingStarted);
        a.on_event(SessionEvent::SpeakingStopped);
        assert_eq!(a.state(), TurnState::Listening);
    }

    #[test]
    fn chat_failure_surfaces_notice_and_resumes_listening() {
        let mut a = active();
        a.on_event(final_utterance("hello"));
        let out = a.on_event(SessionEvent::ChatFailed {
            reason: "500".to_string(),
        });
        assert_eq!(a.state(), TurnState::Listening);
        assert_eq!(
            out,
            vec![Directive::Notify {
                notice: UserNotice::ChatRequestFailed("500".to_string())
            }]
        );
    }

    #[test]
    fn finals_while_thinking_are_withheld() {
        let mut a = active();
        a.on_event(final_utterance("first"));
        assert_eq!(a.state(), TurnState::Thinking);
        let out = a.on_event(final_utterance("second"));
        // Shown, but no second outstanding request.
        assert_eq!(
            out,
            vec![Directive::ShowInterim {
                text: "second".to_string()
            }]
        );
        assert_eq!(a.state(), TurnState::Thinking);
    }

    #[test]
    fn transcripts_while_agent_speaking_are_dropped() {
        let mut a = active();
        a.on_event(final_utterance("hello"));
        a.on_event(SessionEvent::ReplyReady {
            user_text: "hello".to_string(),
            reply: ChatReply::text("Tell me more"),
        });
        a.on_event(SessionEvent::SpeakingStarted);
        let out = a.on_event(final_utterance("tell me more"));
        assert!(out.is_empty());
        assert_eq!(a.state(), TurnState::AgentSpeaking);
    }

    #[test]
    fn audio_activity_while_listening_is_a_no_op() {
        let mut a = active();
        let out = a.on_event(SessionEvent::AudioActivity);
        assert!(out.is_empty());
        assert_eq!(a.state(), TurnState::Listening);
    }

    #[test]
    fn deactivate_silences_late_callbacks() {
        let mut a = active();
        a.deactivate();
        assert!(a.on_event(SessionEvent::AudioActivity).is_empty());
        assert!(a.on_event(final_utterance("anyone there")).is_empty());
        assert_eq!(a.state(), TurnState::Idle);
    }
}
