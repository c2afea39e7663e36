//! # Errors
//!
//! Every failure a program evaluation can end with is a variant of [Error]. Failures of the model endpoint itself
//! are described by [EndpointError](crate::utils::llm::EndpointError) and get wrapped on their way out, so the
//! original cause stays reachable through [std::error::Error::source].
//!
//! Slot values that cannot be coerced are not fatal: they are kept as [CoercionError] next to the slot output.

use crate::stream::AggregatedMessage;
use crate::utils::llm::EndpointError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The prompt alone does not fit into the context window of the model.
    #[error("BudgetExceeded: prompt takes {prompt_tokens} tokens but the context window of {model} is {context_window}")]
    BudgetExceeded {
        model: String,
        prompt_tokens: usize,
        context_window: usize,
    },

    /// Transient failures kept coming until the attempt budget ran out.
    #[error("RetriesExhausted: gave up after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: EndpointError,
    },

    /// A failure the retry loop does not retry.
    #[error("Endpoint: request failed")]
    Endpoint(#[source] EndpointError),

    /// The generation was aborted. Carries everything folded before the abort.
    #[error("Cancelled: generation aborted after {} characters", partial.content.chars().count())]
    Cancelled { partial: Box<AggregatedMessage> },

    /// Stream deltas that do not belong to the same response.
    #[error("ProtocolMismatch: expected deltas of stream {expected} but got {found}")]
    ProtocolMismatch { expected: String, found: String },

    /// The stream ended before delivering a single delta.
    #[error("EmptyStream: the stream ended without any delta")]
    EmptyStream,

    #[error("InvalidRange: from({from}) > to({to})")]
    InvalidRange { from: i64, to: i64 },

    #[error("InvalidSlotConfig: {0}")]
    InvalidSlotConfig(String),

    #[error("InvalidTemplate: {0}")]
    InvalidTemplate(String),

    /// A placeholder referenced an input that the caller did not supply.
    #[error("MissingInput: no value supplied for input `{0}`")]
    MissingInput(String),

    #[error(transparent)]
    Coercion(#[from] CoercionError),
}

impl Error {
    /// The partial message of a [Error::Cancelled], if this is one.
    pub fn partial(&self) -> Option<&AggregatedMessage> {
        match self {
            Error::Cancelled { partial } => Some(partial),
            _ => None,
        }
    }
}

/// Generated text of a slot that is not a value of the slot type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("CoercionError: cannot read {text:?} as a {kind} value, {reason}")]
pub struct CoercionError {
    pub kind: &'static str,
    pub text: String,
    pub reason: String,
}

impl CoercionError {
    pub(crate) fn new(kind: &'static str, text: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            reason: reason.into(),
        }
    }
}
