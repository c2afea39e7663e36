//! # Stream aggregation
//!
//! A streamed response arrives as a sequence of [StreamDelta]s. [StreamAggregator] folds them, in arrival order,
//! into one [AggregatedMessage]:
//!
//! * all deltas must carry the id of the first one, otherwise the fold fails with [Error::ProtocolMismatch]
//! * content fragments are concatenated
//! * function call arguments are concatenated, the name is taken from the first fragment that has one
//! * role, finish reason and choice index are first-wins
//!
//! A fold that ends normally is returned by [StreamAggregator::finish]. A fold that is cut short is turned into an
//! [Error::Cancelled] by [StreamAggregator::cancel], so partial output is never lost but never mistaken for a complete
//! response either.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::llm::Role;

/// Fragment of a function call in a delta.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FunctionCallDelta {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// One incremental fragment of a streamed response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StreamDelta {
    pub id: String,
    pub created_at: u64,
    pub choice_index: u32,
    pub role: Option<Role>,
    pub content: Option<String>,
    pub finish_reason: Option<String>,
    pub function_call: Option<FunctionCallDelta>,
}

impl StreamDelta {
    /// A delta that only carries content.
    pub fn content(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: Some(content.into()),
            ..Default::default()
        }
    }

    /// A delta that only carries the finish reason.
    pub fn finish(id: impl Into<String>, finish_reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            finish_reason: Some(finish_reason.into()),
            ..Default::default()
        }
    }
}

/// A complete function call. `arguments` is the raw JSON text sent by the model.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

impl FunctionCall {
    /// Parse the arguments. Only succeeds once the argument text is complete.
    pub fn parse_arguments(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.arguments)
    }
}

/// The fold of all deltas of one response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregatedMessage {
    pub id: Option<String>,
    pub role: Role,
    pub content: String,
    pub function_call: Option<FunctionCall>,
    pub finish_reason: Option<String>,
    pub choice_index: Option<u32>,
    pub created_at: Option<u64>,
}

impl AggregatedMessage {
    /// An empty assistant message.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A complete assistant message with the given content.
    pub fn with_content(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// Folds [StreamDelta]s into an [AggregatedMessage].
#[derive(Debug, Default)]
pub struct StreamAggregator {
    id: Option<String>,
    created_at: Option<u64>,
    role: Option<Role>,
    content: String,
    finish_reason: Option<String>,
    choice_index: Option<u32>,
    function_name: Option<String>,
    function_arguments: Option<String>,
    received: usize,
}

impl StreamAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of deltas folded so far.
    pub fn received(&self) -> usize {
        self.received
    }

    /// Fold one delta.
    pub fn push(&mut self, delta: &StreamDelta) -> Result<()> {
        match &self.id {
            Some(id) if *id != delta.id => {
                return Err(Error::ProtocolMismatch {
                    expected: id.clone(),
                    found: delta.id.clone(),
                });
            }
            Some(_) => {}
            None => {
                self.id = Some(delta.id.clone());
                self.created_at = Some(delta.created_at);
            }
        }
        self.received += 1;
        if self.role.is_none() {
            self.role = delta.role;
        }
        if self.choice_index.is_none() {
            // the first delta always names its choice
            self.choice_index = Some(delta.choice_index);
        }
        if self.finish_reason.is_none() {
            self.finish_reason = delta.finish_reason.clone();
        }
        if let Some(content) = &delta.content {
            self.content.push_str(content);
        }
        if let Some(call) = &delta.function_call {
            if self.function_name.is_none() {
                self.function_name = call.name.clone();
            }
            let arguments = self.function_arguments.get_or_insert_with(String::new);
            if let Some(fragment) = &call.arguments {
                arguments.push_str(fragment);
            }
        }
        Ok(())
    }

    /// The message folded so far, without consuming the aggregator.
    pub fn snapshot(&self) -> AggregatedMessage {
        let function_call = match (&self.function_name, &self.function_arguments) {
            (None, None) => None,
            (name, arguments) => Some(FunctionCall {
                name: name.clone().unwrap_or_default(),
                arguments: arguments.clone().unwrap_or_default(),
            }),
        };
        AggregatedMessage {
            id: self.id.clone(),
            role: self.role.unwrap_or_default(),
            content: self.content.clone(),
            function_call,
            finish_reason: self.finish_reason.clone(),
            choice_index: self.choice_index,
            created_at: self.created_at,
        }
    }

    /// Finalize after the stream ended normally.
    pub fn finish(self) -> Result<AggregatedMessage> {
        if self.received == 0 {
            return Err(Error::EmptyStream);
        }
        Ok(self.snapshot())
    }

    /// Finalize after the stream was aborted. The partial fold travels inside the error.
    pub fn cancel(self) -> Error {
        Error::Cancelled {
            partial: Box::new(self.snapshot()),
        }
    }
}
