//! # Model endpoint
//!
//! The engine talks to a model through [CompletionEndpoint]. An endpoint executes exactly one request per call and
//! does no retrying of its own; retrying, budgeting and cancellation live in [Transport](crate::transport::Transport).
//!
//! With the `openai` feature, [openai::OpenAIEndpoint] implements the trait on top of `async_openai`.

use std::fmt;
use std::pin::Pin;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::bias::LogitBias;
use crate::stream::{AggregatedMessage, StreamDelta};

#[cfg(feature = "openai")]
pub mod openai;

/// Role of a message or of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    #[default]
    Assistant,
    Function,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Function => "function",
        };
        f.write_str(name)
    }
}

/// A message in the prompt of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }
}

/// A function the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the arguments.
    pub parameters: serde_json::Value,
}

/// One completion request as the endpoint sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub n: u8,
    pub stop: Vec<String>,
    pub stream: bool,
    pub logit_bias: LogitBias,
    pub functions: Vec<FunctionSpec>,
}

impl ModelRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            n: 1,
            stop: Vec::new(),
            stream: false,
            logit_bias: LogitBias::new(),
            functions: Vec::new(),
        }
    }

    /// The prompt as one string, for endpoints that take plain text.
    pub fn prompt_text(&self) -> String {
        self.messages.iter().map(|msg| msg.content.as_str()).collect()
    }
}

/// Failure of a single endpoint call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EndpointError {
    #[error("request timed out")]
    Timeout,
    #[error("HTTP {code}: {message}")]
    Status { code: u16, message: String },
    #[error("connection reset: {0}")]
    ConnectionReset(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("{0}")]
    Other(String),
}

impl EndpointError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            EndpointError::Timeout | EndpointError::ConnectionReset(_) => true,
            EndpointError::Status { code, .. } => *code == 429 || (500..600).contains(code),
            EndpointError::InvalidRequest(_) | EndpointError::Other(_) => false,
        }
    }
}

/// Deltas of one streamed response, in arrival order.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamDelta, EndpointError>> + Send>>;

/// A model endpoint.
#[async_trait]
pub trait CompletionEndpoint: Send + Sync {
    /// Issue a non-streaming request and return the complete response.
    async fn complete(&self, request: &ModelRequest) -> Result<AggregatedMessage, EndpointError>;

    /// Issue a streaming request. The returned stream ends after the last delta.
    async fn stream(&self, request: &ModelRequest) -> Result<DeltaStream, EndpointError>;
}
