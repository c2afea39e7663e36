//! [CompletionEndpoint] on top of `async_openai`.
//!
//! Chat models are called through the chat completion API; instruct and legacy models through the text completion
//! API, which takes the running prompt as one plain string. See [Api::for_model].
//!
//! Note that `async_openai` retries rate-limited requests on its own before an error reaches the engine.

use std::collections::HashMap;
use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionFunctionsArgs,
    ChatCompletionRequestAssistantMessageArgs,
    ChatCompletionRequestFunctionMessageArgs,
    ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest,
    CreateChatCompletionRequestArgs,
    CreateChatCompletionResponse,
    CreateChatCompletionStreamResponse,
    CreateCompletionRequest,
    CreateCompletionRequestArgs,
    CreateCompletionResponse,
    Stop,
};
use async_trait::async_trait;
use futures::StreamExt;
use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::bias::LogitBias;
use crate::stream::{AggregatedMessage, FunctionCall, FunctionCallDelta, StreamDelta};
use crate::utils::llm::{CompletionEndpoint, DeltaStream, EndpointError, Message, ModelRequest, Role};

/// OpenAI accepts at most this many stop sequences.
const MAX_STOPS: usize = 4;

lazy_static! {
    static ref STATUS_CODE_RE: Regex = Regex::new(r"(?i)status(?: code)?:?\s*(\d{3})").unwrap();
}

/// Which OpenAI API a model is called through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Api {
    Chat,
    Completions,
}

impl Api {
    /// Instruct and legacy GPT-3 models only speak the text completion API.
    pub fn for_model(model: &str) -> Self {
        let legacy = ["text-", "davinci", "babbage", "curie", "ada"];
        if model.contains("instruct") || legacy.iter().any(|prefix| model.starts_with(prefix)) {
            Api::Completions
        } else {
            Api::Chat
        }
    }
}

#[derive(Clone, Debug)]
pub struct OpenAIEndpoint {
    pub client: Client<OpenAIConfig>,
    pub api: Api,
}

impl OpenAIEndpoint {
    pub fn new(client: Client<OpenAIConfig>, api: Api) -> Self {
        Self { client, api }
    }

    /// An endpoint for `model` with the API key read from `OPENAI_API_KEY`.
    pub fn for_model(model: &str) -> Self {
        Self::new(Client::new(), Api::for_model(model))
    }
}

#[async_trait]
impl CompletionEndpoint for OpenAIEndpoint {
    async fn complete(&self, request: &ModelRequest) -> Result<AggregatedMessage, EndpointError> {
        match self.api {
            Api::Chat => {
                let response = self.client
                    .chat()
                    .create(chat_request(request).map_err(classify)?)
                    .await
                    .map_err(classify)?;
                Ok(chat_response(response))
            }
            Api::Completions => {
                let response = self.client
                    .completions()
                    .create(completion_request(request).map_err(classify)?)
                    .await
                    .map_err(classify)?;
                Ok(completion_response(response))
            }
        }
    }

    async fn stream(&self, request: &ModelRequest) -> Result<DeltaStream, EndpointError> {
        match self.api {
            Api::Chat => {
                let stream = self.client
                    .chat()
                    .create_stream(chat_request(request).map_err(classify)?)
                    .await
                    .map_err(classify)?;
                Ok(Box::pin(stream.map(|chunk| chunk.map(chat_delta).map_err(classify))))
            }
            Api::Completions => {
                let stream = self.client
                    .completions()
                    .create_stream(completion_request(request).map_err(classify)?)
                    .await
                    .map_err(classify)?;
                Ok(Box::pin(stream.map(|chunk| chunk.map(completion_delta).map_err(classify))))
            }
        }
    }
}

/// Move a value between two serde representations, e.g. an `async_openai` enum and a plain string.
fn convert<T: Serialize, U: DeserializeOwned>(value: &T) -> Option<U> {
    serde_json::to_value(value)
        .ok()
        .and_then(|value| serde_json::from_value(value).ok())
}

fn stop_of(stop: &[String]) -> Stop {
    if stop.len() > MAX_STOPS {
        warn!("OpenAI accepts at most {} stop sequences, dropping {:?}", MAX_STOPS, &stop[MAX_STOPS..]);
    }
    Stop::StringArray(stop.iter().take(MAX_STOPS).cloned().collect())
}

fn logit_bias_of(bias: &LogitBias) -> HashMap<String, serde_json::Value> {
    bias.iter()
        .map(|(token, weight)| (token.to_string(), serde_json::json!(weight)))
        .collect()
}

fn max_tokens_of(max_tokens: u32) -> u16 {
    u16::try_from(max_tokens).unwrap_or(u16::MAX)
}

fn chat_message(message: &Message) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    let content = message.content.clone();
    let message = match message.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(content)
            .build()?
            .into(),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(content)
            .build()?
            .into(),
        Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(content)
            .build()?
            .into(),
        Role::Function => ChatCompletionRequestFunctionMessageArgs::default()
            .name(message.name.clone().unwrap_or_default())
            .content(content)
            .build()?
            .into(),
    };
    Ok(message)
}

pub(crate) fn chat_request(request: &ModelRequest) -> Result<CreateChatCompletionRequest, OpenAIError> {
    let messages = request.messages
        .iter()
        .map(chat_message)
        .collect::<Result<Vec<_>, _>>()?;
    let mut args = CreateChatCompletionRequestArgs::default();
    args.model(&request.model)
        .messages(messages)
        .n(request.n)
        .stream(request.stream);
    if let Some(temperature) = request.temperature {
        args.temperature(temperature);
    }
    if let Some(max_tokens) = request.max_tokens {
        args.max_tokens(max_tokens_of(max_tokens));
    }
    if !request.stop.is_empty() {
        args.stop(stop_of(&request.stop));
    }
    if !request.logit_bias.is_empty() {
        args.logit_bias(logit_bias_of(&request.logit_bias));
    }
    if !request.functions.is_empty() {
        let mut functions = Vec::with_capacity(request.functions.len());
        for spec in &request.functions {
            let mut function = ChatCompletionFunctionsArgs::default();
            function.name(&spec.name).parameters(spec.parameters.clone());
            if let Some(description) = &spec.description {
                function.description(description);
            }
            functions.push(function.build()?);
        }
        args.functions(functions);
    }
    args.build()
}

pub(crate) fn completion_request(request: &ModelRequest) -> Result<CreateCompletionRequest, OpenAIError> {
    let mut args = CreateCompletionRequestArgs::default();
    args.model(&request.model)
        .prompt(request.prompt_text())
        .n(request.n)
        .stream(request.stream);
    if let Some(temperature) = request.temperature {
        args.temperature(temperature);
    }
    if let Some(max_tokens) = request.max_tokens {
        args.max_tokens(max_tokens_of(max_tokens));
    }
    if !request.stop.is_empty() {
        args.stop(stop_of(&request.stop));
    }
    if !request.logit_bias.is_empty() {
        args.logit_bias(logit_bias_of(&request.logit_bias));
    }
    if !request.functions.is_empty() {
        warn!("Functions are not supported by the text completion API and are ignored");
    }
    args.build()
}

fn chat_response(response: CreateChatCompletionResponse) -> AggregatedMessage {
    let mut message = AggregatedMessage {
        id: Some(response.id),
        created_at: Some(u64::from(response.created)),
        ..Default::default()
    };
    if let Some(choice) = response.choices.into_iter().next() {
        message.choice_index = Some(choice.index);
        message.finish_reason = choice.finish_reason.as_ref().and_then(convert);
        message.role = convert(&choice.message.role).unwrap_or_default();
        message.content = choice.message.content.unwrap_or_default();
        message.function_call = choice.message.function_call.map(|call| FunctionCall {
            name: call.name,
            arguments: call.arguments,
        });
    }
    message
}

fn completion_response(response: CreateCompletionResponse) -> AggregatedMessage {
    let mut message = AggregatedMessage {
        id: Some(response.id),
        created_at: Some(u64::from(response.created)),
        ..Default::default()
    };
    if let Some(choice) = response.choices.into_iter().next() {
        message.choice_index = Some(choice.index);
        message.finish_reason = choice.finish_reason.as_ref().and_then(convert);
        message.content = choice.text;
    }
    message
}

fn chat_delta(chunk: CreateChatCompletionStreamResponse) -> StreamDelta {
    let mut delta = StreamDelta {
        id: chunk.id,
        created_at: u64::from(chunk.created),
        ..Default::default()
    };
    if let Some(choice) = chunk.choices.into_iter().next() {
        delta.choice_index = choice.index;
        delta.finish_reason = choice.finish_reason.as_ref().and_then(convert);
        delta.role = choice.delta.role.as_ref().and_then(convert);
        delta.content = choice.delta.content;
        delta.function_call = choice.delta.function_call.map(|call| FunctionCallDelta {
            name: call.name,
            arguments: call.arguments,
        });
    }
    delta
}

fn completion_delta(chunk: CreateCompletionResponse) -> StreamDelta {
    let mut delta = StreamDelta {
        id: chunk.id,
        created_at: u64::from(chunk.created),
        ..Default::default()
    };
    if let Some(choice) = chunk.choices.into_iter().next() {
        delta.choice_index = choice.index;
        delta.finish_reason = choice.finish_reason.as_ref().and_then(convert);
        delta.content = Some(choice.text);
    }
    delta
}

/// Map an `async_openai` error to an [EndpointError], deciding whether it is worth a retry.
pub(crate) fn classify(error: OpenAIError) -> EndpointError {
    match error {
        OpenAIError::Reqwest(e) => {
            if e.is_timeout() {
                EndpointError::Timeout
            } else if let Some(status) = e.status() {
                EndpointError::Status {
                    code: status.as_u16(),
                    message: e.to_string(),
                }
            } else if e.is_connect() || e.is_request() || e.is_body() {
                EndpointError::ConnectionReset(e.to_string())
            } else {
                EndpointError::Other(e.to_string())
            }
        }
        OpenAIError::ApiError(api) => classify_api(api.r#type.as_deref(), api.message),
        OpenAIError::StreamError(message) => classify_stream(message),
        OpenAIError::InvalidArgument(message) => EndpointError::InvalidRequest(message),
        other => EndpointError::Other(other.to_string()),
    }
}

fn classify_api(kind: Option<&str>, message: String) -> EndpointError {
    match kind {
        Some(kind) if kind.contains("rate_limit") || kind == "requests" => EndpointError::Status { code: 429, message },
        Some("server_error") => EndpointError::Status { code: 500, message },
        Some("service_unavailable") => EndpointError::Status { code: 503, message },
        Some("invalid_request_error") => EndpointError::InvalidRequest(message),
        _ if message.contains("overloaded") => EndpointError::Status { code: 503, message },
        _ => EndpointError::Other(message),
    }
}

fn classify_stream(message: String) -> EndpointError {
    let code = STATUS_CODE_RE.captures(&message)
        .and_then(|captures| captures.get(1))
        .and_then(|code| code.as_str().parse::<u16>().ok());
    if let Some(code) = code {
        return EndpointError::Status { code, message };
    }
    let lowered = message.to_lowercase();
    if lowered.contains("json") || lowered.contains("parse") || lowered.contains("utf") {
        EndpointError::Other(message)
    } else {
        EndpointError::ConnectionReset(message)
    }
}

#[cfg(test)]
mod test_openai {
    use crate::utils::llm::{EndpointError, FunctionSpec, Message, ModelRequest, Role};
    use super::{Api, chat_request, classify_api, classify_stream, completion_request};

    fn request() -> ModelRequest {
        let mut request = ModelRequest::new("gpt-3.5-turbo-instruct", vec![
            Message::new(Role::System, "You write character sheets.\n"),
            Message::new(Role::Assistant, "name: \""),
        ]);
        request.stop = ["a", "b", "c", "d", "e"].iter().map(|s| s.to_string()).collect();
        request.max_tokens = Some(100_000);
        request.logit_bias.insert(98, 100.0);
        request
    }

    #[test]
    fn test_api_for_model() {
        assert_eq!(Api::Completions, Api::for_model("gpt-3.5-turbo-instruct"));
        assert_eq!(Api::Completions, Api::for_model("text-davinci-003"));
        assert_eq!(Api::Chat, Api::for_model("gpt-4"));
        assert_eq!(Api::Chat, Api::for_model("gpt-3.5-turbo-16k"));
    }

    #[test]
    fn test_completion_request() {
        let body = serde_json::to_value(completion_request(&request()).unwrap()).unwrap();
        assert_eq!("You write character sheets.\nname: \"", body["prompt"]);
        assert_eq!(4, body["stop"].as_array().unwrap().len());
        assert_eq!(u16::MAX as u64, body["max_tokens"].as_u64().unwrap());
        assert_eq!(100.0, body["logit_bias"]["98"].as_f64().unwrap());
    }

    #[test]
    fn test_chat_request() {
        let mut request = request();
        request.model = "gpt-4".to_string();
        request.functions.push(FunctionSpec {
            name: "roll".to_string(),
            description: Some("Roll dice".to_string()),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        });
        let body = serde_json::to_value(chat_request(&request).unwrap()).unwrap();
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(2, messages.len());
        assert_eq!("system", messages[0]["role"]);
        assert_eq!("assistant", messages[1]["role"]);
        assert_eq!("roll", body["functions"][0]["name"]);
    }

    #[test]
    fn test_classify_api() {
        assert!(classify_api(Some("rate_limit_exceeded"), "slow down".to_string()).is_transient());
        assert!(classify_api(Some("server_error"), "oops".to_string()).is_transient());
        assert!(classify_api(None, "The server is overloaded".to_string()).is_transient());
        assert!(matches!(classify_api(Some("invalid_request_error"), "bad".to_string()),
            EndpointError::InvalidRequest(_)));
        assert!(!classify_api(Some("insufficient_quota"), "pay up".to_string()).is_transient());
    }

    #[test]
    fn test_classify_stream() {
        let error = classify_stream("Invalid status code: 429 Too Many Requests".to_string());
        assert!(matches!(error, EndpointError::Status { code: 429, .. }));
        let error = classify_stream("Invalid status code: 401 Unauthorized".to_string());
        assert!(!error.is_transient());
        assert!(classify_stream("Transport error: connection closed".to_string()).is_transient());
        assert!(!classify_stream("failed to parse JSON".to_string()).is_transient());
    }
}
