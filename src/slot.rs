//! # Slot
//! A slot is a typed placeholder whose value is generated by the model. The set of slot kinds is closed, see
//! [SlotKind]. Every slot also carries [SlotOptions] that tune the request made for it.
//!
//! Slots are validated when constructed, so an invalid slot never reaches an evaluation:
//!
//! ```
//! use slotgen::slot::Slot;
//! assert!(Slot::range(1, 100).is_ok());
//! assert!(Slot::range(100, 1).is_err());
//! assert!(Slot::select(Vec::<String>::new()).is_err());
//! ```
//!
//! A slot is immutable. [Slot::with] and its shortcuts return a modified copy.

use std::collections::HashMap;
use std::fmt;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CoercionError, Error, Result};
use crate::program::Turn;

/// Options shared by all slot kinds.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotOptions {
    /// Stop sequences. Without any, a string slot stops at the first character of the literal that follows it.
    pub stop: Vec<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Extra bias from text to weight. Every token of the text gets the weight.
    pub bias: HashMap<String, f32>,
}

/// The kind of a slot, with its kind-specific configuration.
#[derive(Debug, Clone)]
pub enum SlotKind {
    /// Free text.
    String,
    /// A decimal number.
    Number,
    /// An integer in `[from, to]`.
    Range { from: i64, to: i64 },
    /// One of the items.
    Select { items: Vec<String> },
    /// Text matching `pattern`. The regex is kept anchored at both ends, `tail` is the same regex anchored at the end
    /// only and is what generated text is checked against.
    Match { pattern: Regex, tail: Regex },
    /// `length` evaluations of `body` in a row.
    Repeat { length: usize, body: Box<Turn> },
}

impl SlotKind {
    pub fn name(&self) -> &'static str {
        match self {
            SlotKind::String => "string",
            SlotKind::Number => "number",
            SlotKind::Range { .. } => "range",
            SlotKind::Select { .. } => "select",
            SlotKind::Match { .. } => "match",
            SlotKind::Repeat { .. } => "repeat",
        }
    }
}

/// A typed placeholder.
#[derive(Debug, Clone)]
#[readonly::make]
pub struct Slot {
    #[readonly]
    pub kind: SlotKind,
    #[readonly]
    pub options: SlotOptions,
}

impl Slot {
    fn of(kind: SlotKind) -> Self {
        Self {
            kind,
            options: SlotOptions::default(),
        }
    }

    pub fn string() -> Self {
        Self::of(SlotKind::String)
    }

    pub fn number() -> Self {
        Self::of(SlotKind::Number)
    }

    /// An integer slot over `[from, to]`. Fails with [Error::InvalidRange] if `from > to`.
    pub fn range(from: i64, to: i64) -> Result<Self> {
        if from > to {
            return Err(Error::InvalidRange { from, to });
        }
        Ok(Self::of(SlotKind::Range { from, to }))
    }

    /// A slot over a non-empty list of non-empty items.
    pub fn select<I, S>(items: I) -> Result<Self>
        where I: IntoIterator<Item=S>,
              S: Into<String> {
        let items: Vec<String> = items.into_iter().map(Into::into).collect();
        if items.is_empty() {
            return Err(Error::InvalidSlotConfig("select needs at least one item".to_string()));
        }
        if items.iter().any(String::is_empty) {
            return Err(Error::InvalidSlotConfig(format!("select items must not be empty, got {:?}", items)));
        }
        Ok(Self::of(SlotKind::Select { items }))
    }

    /// A slot whose text must match `pattern` as a whole.
    pub fn matching(pattern: &str) -> Result<Self> {
        let compile = |anchored: String| Regex::new(&anchored)
            .map_err(|e| Error::InvalidSlotConfig(format!("invalid pattern {:?}: {}", pattern, e)));
        let tail = compile(format!("(?:{})$", pattern))?;
        let pattern = compile(format!("^(?:{})$", pattern))?;
        Ok(Self::of(SlotKind::Match { pattern, tail }))
    }

    /// Repeat `body` `length` times. `length` must be at least 1.
    pub fn repeat(length: usize, body: Turn) -> Result<Self> {
        if length == 0 {
            return Err(Error::InvalidSlotConfig("repeat length must be at least 1".to_string()));
        }
        Ok(Self::of(SlotKind::Repeat {
            length,
            body: Box::new(body),
        }))
    }

    /// A copy with `overrides` laid over the current options. Unset overrides keep the current value.
    pub fn with(&self, overrides: SlotOptions) -> Self {
        let mut options = self.options.clone();
        if !overrides.stop.is_empty() {
            options.stop = overrides.stop;
        }
        if overrides.temperature.is_some() {
            options.temperature = overrides.temperature;
        }
        if overrides.max_tokens.is_some() {
            options.max_tokens = overrides.max_tokens;
        }
        options.bias.extend(overrides.bias);
        Self {
            kind: self.kind.clone(),
            options,
        }
    }

    pub fn stop<I, S>(&self, stop: I) -> Self
        where I: IntoIterator<Item=S>,
              S: Into<String> {
        self.with(SlotOptions {
            stop: stop.into_iter().map(Into::into).collect(),
            ..Default::default()
        })
    }

    pub fn temperature(&self, temperature: f32) -> Self {
        self.with(SlotOptions {
            temperature: Some(temperature),
            ..Default::default()
        })
    }

    pub fn max_tokens(&self, max_tokens: u32) -> Self {
        self.with(SlotOptions {
            max_tokens: Some(max_tokens),
            ..Default::default()
        })
    }

    pub fn bias(&self, text: impl Into<String>, weight: f32) -> Self {
        self.with(SlotOptions {
            bias: HashMap::from([(text.into(), weight)]),
            ..Default::default()
        })
    }

    /// Coerce generated (or caller-supplied) text into a value of this slot.
    pub fn coerce(&self, text: &str) -> std::result::Result<Value, CoercionError> {
        let kind = self.kind.name();
        match &self.kind {
            SlotKind::String => Ok(Value::Text(text.to_string())),
            SlotKind::Match { pattern, .. } => {
                if pattern.is_match(text) {
                    Ok(Value::Text(text.to_string()))
                } else {
                    Err(CoercionError::new(kind, text, format!("does not match {}", pattern)))
                }
            }
            SlotKind::Number => parse_number(kind, text).map(Value::Number),
            SlotKind::Range { from, to } => {
                let number = parse_number(kind, text)?;
                if number.fract() != 0.0 {
                    Err(CoercionError::new(kind, text, "not an integer"))
                } else if number < *from as f64 || number > *to as f64 {
                    Err(CoercionError::new(kind, text, format!("out of [{}, {}]", from, to)))
                } else {
                    Ok(Value::Number(number))
                }
            }
            SlotKind::Select { items } => {
                if items.iter().any(|item| item == text) {
                    Ok(Value::Text(text.to_string()))
                } else {
                    Err(CoercionError::new(kind, text, format!("not one of {:?}", items)))
                }
            }
            SlotKind::Repeat { .. } => Err(CoercionError::new(kind, text, "repeated values are generated per item")),
        }
    }
}

fn parse_number(kind: &'static str, text: &str) -> std::result::Result<f64, CoercionError> {
    if !text.chars().any(|c| c.is_ascii_digit()) {
        return Err(CoercionError::new(kind, text, "no digits"));
    }
    text.parse::<f64>()
        .map_err(|e| CoercionError::new(kind, text, e.to_string()))
}

/// The resolved value of a slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Text(String),
    Number(f64),
    List(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(number) => Some(*number),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(text) => f.write_str(text),
            Value::Number(number) => write!(f, "{}", number),
            Value::List(list) => {
                f.write_str("[")?;
                for (i, value) in list.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", value)?;
                }
                f.write_str("]")
            }
        }
    }
}
