//! # Logit bias
//! Constrained slots steer the model with a logit bias: a map from token id to a weight that is added to the logit of
//! the token before sampling. [BiasCompiler] computes the map of a slot:
//!
//! * `select`: every token of every item gets [BIAS_WEIGHT]
//! * `range`: the leading token of the decimal text of every integer in the range gets [BIAS_WEIGHT], unless the range
//!   is wider than the configured limit, in which case no bias is compiled and a warning is logged
//! * other kinds: no bias
//!
//! The bias only steers token by token. Whether the generated text is a valid value is decided by the interpreter.
//!
//! Biases given in the slot options are added last and win over compiled weights.

use std::collections::HashMap;
use log::warn;

use crate::slot::{Slot, SlotKind};
use crate::utils::token::{TokenId, Tokenizer};

/// Mapping from token id to bias weight.
pub type LogitBias = HashMap<TokenId, f32>;

/// Weight given to allowed tokens. It is the largest weight OpenAI endpoints accept.
pub const BIAS_WEIGHT: f32 = 100.0;

/// Widest range, as `to - from`, that still gets a bias.
pub const DEFAULT_RANGE_BIAS_LIMIT: u64 = 1000;

/// Compiles the logit bias of slots with a given tokenizer.
pub struct BiasCompiler<'a> {
    tokenizer: &'a dyn Tokenizer,
    range_limit: u64,
}

impl<'a> BiasCompiler<'a> {
    pub fn new(tokenizer: &'a dyn Tokenizer) -> Self {
        Self {
            tokenizer,
            range_limit: DEFAULT_RANGE_BIAS_LIMIT,
        }
    }

    pub fn with_range_limit(mut self, range_limit: u64) -> Self {
        self.range_limit = range_limit;
        self
    }

    /// The bias of `slot`, or `None` if it has none.
    pub fn compile(&self, slot: &Slot) -> Option<LogitBias> {
        let mut bias = LogitBias::new();
        match &slot.kind {
            SlotKind::Select { items } => {
                for item in items {
                    self.weigh_all(&mut bias, item, BIAS_WEIGHT);
                }
            }
            SlotKind::Range { from, to } => {
                let width = to.abs_diff(*from);
                if width > self.range_limit {
                    warn!("Range [{}, {}] is wider than {}, so it is generated without logit bias. \
                    Expect invalid values more often.", from, to, self.range_limit);
                } else {
                    for number in *from..=*to {
                        if let Some(leading) = self.tokenizer.encode(&number.to_string()).first() {
                            bias.insert(*leading, BIAS_WEIGHT);
                        }
                    }
                }
            }
            SlotKind::String | SlotKind::Number | SlotKind::Match { .. } | SlotKind::Repeat { .. } => {}
        }
        for (text, weight) in &slot.options.bias {
            self.weigh_all(&mut bias, text, *weight);
        }
        if bias.is_empty() {
            None
        } else {
            Some(bias)
        }
    }

    fn weigh_all(&self, bias: &mut LogitBias, text: &str, weight: f32) {
        for token in self.tokenizer.encode(text) {
            bias.insert(token, weight);
        }
    }
}
