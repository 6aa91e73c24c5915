//! **Remote Chat Client** — the network boundary to the conversational agent.
//!
//! The core never builds prompts; it hands finalized user text to a
//! [`ChatClient`] and speaks whatever comes back. [`HttpChatClient`] talks to
//! the companion backend (`/start`, `/message`, `/switch-model`,
//! `/end/{client_id}`, `/ping`).

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// The agent models the backend can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentModel {
    Gpt4,
    Gemini,
}

impl fmt::Display for AgentModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentModel::Gpt4 => write!(f, "gpt4"),
            AgentModel::Gemini => write!(f, "gemini"),
        }
    }
}

/// Opaque session token issued by the backend on session creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken(pub String);

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One agent reply: text to speak, plus optional pre-rendered audio bytes
/// (WAV/MP3). When audio is present the output controller plays it directly
/// instead of synthesizing the text.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub text: String,
    pub audio: Option<Vec<u8>>,
}

impl ChatReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            audio: None,
        }
    }
}

/// The remote agent boundary. All calls are fire-and-wait network requests;
/// `end_session` is best-effort (failures are logged by the caller, never
/// surfaced).
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Create a remote session for the given model. Failure means no session
    /// exists anywhere.
    async fn create_session(&self, model: AgentModel) -> VoiceResult<SessionToken>;

    /// Exchange one user message for the agent's reply.
    async fn send_message(&self, token: &SessionToken, text: &str) -> VoiceResult<ChatReply>;

    /// Switch the model serving an existing session.
    async fn switch_model(&self, token: &SessionToken, model: AgentModel)
        -> VoiceResult<AgentModel>;

    /// Tell the backend the session is over. Best-effort.
    async fn end_session(&self, token: &SessionToken) -> VoiceResult<()>;

    /// One-shot reachability probe, used to gate whether session start is
    /// offered at all.
    async fn health(&self) -> bool;
}

// Wire types matching the backend's pydantic models.

#[derive(Serialize)]
struct StartRequest {
    model: AgentModel,
}

#[derive(Deserialize)]
struct StartResponse {
    client_id: String,
}

#[derive(Serialize)]
struct UserMessage<'a> {
    client_id: &'a str,
    message: &'a str,
}

#[derive(Deserialize)]
struct AiResponse {
    response: String,
    model: AgentModel,
    /// Optional base64-encoded audio rendering of the reply.
    #[serde(default)]
    audio: Option<String>,
}

#[derive(Serialize)]
struct ModelSwitch<'a> {
    client_id: &'a str,
    model: AgentModel,
}

/// HTTP client for the companion chat backend.
#[derive(Debug, Clone)]
pub struct HttpChatClient {
    /// Base URL without trailing slash (e.g. http://localhost:8000).
    base_url: String,
    client: reqwest::Client,
}

impl HttpChatClient {
    /// Create a client for the given base URL.
    pub fn new(base_url: impl Into<String>) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Build from environment: `CHAT_API_URL` (default http://localhost:8000).
    pub fn from_env() -> VoiceResult<Self> {
        let base_url =
            std::env::var("CHAT_API_URL").unwrap_or_else(|_| "http://localhost:8000".to_string());
        Self::new(base_url)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn create_session(&self, model: AgentModel) -> VoiceResult<SessionToken> {
        let res = self
            .client
            .post(self.url("/start"))
            .json(&StartRequest { model })
            .send()
            .await
            .map_err(|e| VoiceError::SessionStartFailed(e.to_string()))?;
        if !res.status().is_success() {
            return Err(VoiceError::SessionStartFailed(format!(
                "backend returned {}",
                res.status()
            )));
        }
        let body: StartResponse = res
            .json()
            .await
            .map_err(|e| VoiceError::SessionStartFailed(e.to_string()))?;
        debug!("chat session created: {}", body.client_id);
        Ok(SessionToken(body.client_id))
    }

    async fn send_message(&self, token: &SessionToken, text: &str) -> VoiceResult<ChatReply> {
        let res = self
            .client
            .post(self.url("/message"))
            .json(&UserMessage {
                client_id: &token.0,
                message: text,
            })
            .send()
            .await
            .map_err(|e| VoiceError::ChatRequestFailed(e.to_string()))?;
        if !res.status().is_success() {
            return Err(VoiceError::ChatRequestFailed(format!(
                "backend returned {}",
                res.status()
            )));
        }
        let body: AiResponse = res
            .json()
            .await
            .map_err(|e| VoiceError::ChatRequestFailed(e.to_string()))?;
        let audio = match body.audio {
            Some(b64) => match BASE64.decode(b64.as_bytes()) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    // Bad audio is not worth failing the turn over; speak the text.
                    warn!("reply audio could not be decoded: {}", e);
                    None
                }
            },
            None => None,
        };
        Ok(ChatReply {
            text: body.response,
            audio,
        })
    }

    async fn switch_model(
        &self,
        token: &SessionToken,
        model: AgentModel,
    ) -> VoiceResult<AgentModel> {
        let res = self
            .client
            .post(self.url("/switch-model"))
            .json(&ModelSwitch {
                client_id: &token.0,
                model,
            })
            .send()
            .await
            .map_err(|e| VoiceError::ChatRequestFailed(e.to_string()))?;
        if !res.status().is_success() {
            return Err(VoiceError::ChatRequestFailed(format!(
                "backend returned {}",
                res.status()
            )));
        }
        let body: AiResponse = res
            .json()
            .await
            .map_err(|e| VoiceError::ChatRequestFailed(e.to_string()))?;
        Ok(body.model)
    }

    async fn end_session(&self, token: &SessionToken) -> VoiceResult<()> {
        let res = self
            .client
            .delete(self.url(&format!("/end/{}", token.0)))
            .send()
            .await
            .map_err(|e| VoiceError::ChatRequestFailed(e.to_string()))?;
        if !res.status().is_success() {
            return Err(VoiceError::ChatRequestFailed(format!(
                "backend returned {}",
                res.status()
            )));
        }
        Ok(())
    }

    async fn health(&self) -> bool {
        match self.client.get(self.url("/ping")).send().await {
            Ok(res) => res.status().is_success(),
            Err(e) => {
                debug!("backend unreachable: {}", e);
                false
            }
        }
    }
}
