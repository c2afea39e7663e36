//! # slotgen
//!
//! Slot-constrained generation engine for LLM programs in Rust
//!
//! **Note: `slotgen` is now a WIP, so the APIs are subject to change.**
//!
//! ## Usage
//! `slotgen` is not released on crates.io. To use it, add a dependency in `Cargo.toml`
//! ```toml
//! slotgen = { git = "https://github.com/ifsheldon/slotgen.git", branch = "main"}
//! ```
//!
//! ## Concepts and Design
//! A prompt is not just text that goes in before the model speaks. Very often we know the *shape* of the answer
//! already: a JSON object with a name and an age, a pick from a list of classes, three bullet points. `slotgen` lets
//! you write that shape down as a program and has the model fill in only the holes.
//!
//! ### Slot
//!
//! A [slot](crate::slot::Slot) is a typed hole: free text, a number, an integer in a range, one of a list of items,
//! text matching a regex, or a block repeated a fixed number of times. Constrained slots steer the model with a
//! [logit bias](crate::bias) so that it rarely even tries an invalid token.
//!
//! ### Turn and Program
//!
//! A [turn](crate::program::Turn) is a template: literal text interleaved with slots, nested turns and caller inputs.
//! A turn may carry a role (system, user or assistant). A [program](crate::program::Program) is an ordered list of
//! turns.
//!
//! A template looks like
//!
//! ```text
//! The following is a character profile for an RPG game.
//! name: "{[name]}", class: {[class]}
//! ```
//!
//! where `{[name]}` and `{[class]}` are placeholders. A placeholder bound to a slot is generated; any other
//! placeholder is an input that the caller supplies.
//!
//! ### Interpreter
//!
//! The [interpreter](crate::interpreter) walks a program left to right. Literal text is appended to the running
//! prompt. Every slot gets its own completion call, and the generated text is read character by character until the
//! slot has what it needs: the closing quote after a name, the end of a number, an exact item of a list. The accepted
//! text is appended to the running prompt, so every later slot sees what was generated before it.
//!
//! ### Transport
//!
//! Completion calls go through the [transport](crate::transport), which keeps the prompt within the context window,
//! retries transient failures with exponential backoff, enforces a first byte timeout on streams, and honors a
//! cancellation token at every await. Streamed responses are folded by the [stream aggregator](crate::stream).
//!
//! ### Endpoint and Tokenizer
//!
//! Both are injected. Anything implementing [CompletionEndpoint](crate::utils::llm::CompletionEndpoint) can be the
//! model; with the default `openai` feature, [OpenAIEndpoint](crate::utils::llm::openai::OpenAIEndpoint) calls OpenAI
//! through `async_openai`. Anything implementing [Tokenizer](crate::utils::token::Tokenizer), including a plain
//! closure, can count tokens; [Tiktoken](crate::utils::token::tiktoken::Tiktoken) uses `tiktoken-rs`.
//!
//! ## Logging
//!
//! `slotgen` logs through the `log` facade and never installs a logger.
//!
//! ## License
//!
//! `slotgen` will always remain free under Apache license.
//!
//! ## Attribution
//! * `tiktoken-rs`: In [crate::utils::token::tiktoken], we build the tokenizer on the `tiktoken-rs` crate.

pub mod bias;
pub mod config;
pub mod error;
pub mod interpreter;
pub mod program;
pub mod slot;
pub mod stream;
pub mod transport;
pub mod utils;

pub use error::{Error, Result};
