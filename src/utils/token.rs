//! Tokenizer trait and utilities

pub mod tiktoken;

use crate::utils::llm::Message;

/// Id of a token in the vocabulary of a model.
pub type TokenId = u32;

/// Trait for turning text into the token ids of a model.
///
/// Tokenizers are passed into the engine explicitly, so every program evaluation can use its own.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, string: &str) -> Vec<TokenId>;

    fn count_token(&self, string: &str) -> usize {
        self.encode(string).len()
    }

    /// Tokens a message takes in a prompt. Tokenizers of chat models add the per-message overhead.
    fn count_msg_token(&self, msg: &Message) -> usize {
        self.count_token(&msg.content)
    }
}

/// Blanket impl of Tokenizer for Fn(&str) -> Vec<TokenId>.
impl<F> Tokenizer for F where F: Fn(&str) -> Vec<TokenId> + Send + Sync {
    fn encode(&self, string: &str) -> Vec<TokenId> {
        self(string)
    }
}

/// Encode a string byte by byte. Every byte is a token, so the count is the length of the string.
#[inline]
pub fn encode_by_bytes(string: &str) -> Vec<TokenId> {
    string.bytes().map(TokenId::from).collect()
}
