use std::collections::HashMap;
use anyhow::{anyhow, Result};
pub use tiktoken_rs::{get_bpe_from_model, CoreBPE};

use crate::utils::llm::Message;
use crate::utils::token::{TokenId, Tokenizer};
use lazy_static::lazy_static;

const TOKENS_PER_MESSAGE: usize = 3;
const TOKENS_PER_NAME: usize = 1;

lazy_static! {
    /// const map from model name to the size of its context window.
    /// TODO: when `LazyCell` is stabilized, use that instead
    pub static ref MODEL_TO_MAX_TOKENS: HashMap<&'static str, usize> = HashMap::from([
        ("gpt-4", 8192),
        ("gpt-4-0613", 8192),
        ("gpt-4-32k", 32768),
        ("gpt-4-32k-0613", 32768),
        ("gpt-4-1106-preview", 128000),
        ("gpt-3.5-turbo", 4096),
        ("gpt-3.5-turbo-16k", 16384),
        ("gpt-3.5-turbo-0613", 4096),
        ("gpt-3.5-turbo-16k-0613", 16384),
        ("gpt-3.5-turbo-1106", 16385),
        ("gpt-3.5-turbo-instruct", 4096),
    ]);
}

/// Look up the context window of a known model.
pub fn context_window_of(model: &str) -> Option<usize> {
    MODEL_TO_MAX_TOKENS.get(model).copied()
}

/// Tokenizer using the Tiktoken BPE.
#[derive(Clone)]
#[readonly::make]
pub struct Tiktoken {
    /// The model name of the tokenizer. read-only.
    #[readonly]
    pub model: String,
    /// The tokenizer. read-only.
    #[readonly]
    pub bpe: CoreBPE,
}

impl Tiktoken {
    /// Create a new Tiktoken tokenizer for a known model.
    pub fn new(model: impl Into<String>) -> Result<Self> {
        let model = model.into();
        if !MODEL_TO_MAX_TOKENS.contains_key(model.as_str()) {
            return Err(anyhow!("model {} is not supported", model));
        }
        let model = if model.starts_with("gpt-4-32k") {
            "gpt-4-32k"
        } else if model.starts_with("gpt-4") {
            "gpt-4"
        } else if model == "gpt-3.5-turbo-instruct" {
            "gpt-3.5-turbo-instruct"
        } else {
            "gpt-3.5-turbo"
        };
        get_bpe_from_model(model).map(|bpe| Tiktoken {
            model: model.to_string(),
            bpe,
        })
    }
}

impl Tokenizer for Tiktoken {
    fn encode(&self, string: &str) -> Vec<TokenId> {
        self.bpe
            .encode_with_special_tokens(string)
            .into_iter()
            .map(|token| token as TokenId)
            .collect()
    }

    /// Count the number of tokens in a chat message. Following best practices from the OpenAI example.
    fn count_msg_token(&self, msg: &Message) -> usize {
        let name_token_count = if msg.name.is_some() { TOKENS_PER_NAME } else { 0 };
        self.count_token(&msg.content) + name_token_count + TOKENS_PER_MESSAGE
    }
}
