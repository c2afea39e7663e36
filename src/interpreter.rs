//! # Slot interpreter
//! [Interpreter] evaluates a [Program] against a model, one segment at a time:
//!
//! 1. A literal span (or a caller input) is appended to the [RunningPrompt].
//! 2. A slot gets one completion call with the running prompt as context. The generated text is fed, character by
//!    character, to an extractor that decides when the slot has enough: see [Extractor].
//! 3. The accepted text goes back into the running prompt, so every later slot sees it.
//!
//! Nested turns and repeat bodies recurse with the same running prompt. Turns are evaluated strictly in order, and
//! so are the slots of a turn and the iterations of a repeat.
//!
//! [Interpreter::start] returns a [ProgramRun] that is stepped turn by turn; [Interpreter::run] steps it to the end.
//!
//! ```no_run
//! # use std::collections::HashMap;
//! # use std::sync::Arc;
//! # use tokio_util::sync::CancellationToken;
//! # use slotgen::config::EngineConfig;
//! # use slotgen::interpreter::Interpreter;
//! # use slotgen::program::{Program, Turn};
//! # use slotgen::slot::Slot;
//! # use slotgen::utils::llm::CompletionEndpoint;
//! # async fn demo(endpoint: Arc<dyn CompletionEndpoint>) -> slotgen::Result<()> {
//! let program = Program::from(Turn::builder()
//!     .text("The quick ")
//!     .slot("color", Slot::select(["brown", "red"])?)
//!     .text(" fox jumped.")
//!     .try_build()?);
//! let tokenizer = Arc::new(|text: &str| text.bytes().map(u32::from).collect::<Vec<_>>());
//! let mut interpreter = Interpreter::new(endpoint, tokenizer, EngineConfig::default())
//!     .with_echo(|text: &str| print!("{}", text));
//! let evaluation = interpreter.run(&program, &HashMap::new(), &CancellationToken::new()).await?;
//! println!("{:?}", evaluation.get("color"));
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, warn};
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::bias::BiasCompiler;
use crate::config::EngineConfig;
use crate::error::{CoercionError, Error, Result};
use crate::program::{Program, Segment, Turn};
use crate::slot::{Slot, SlotKind, Value};
use crate::transport::Transport;
use crate::utils::llm::{CompletionEndpoint, Message, ModelRequest, Role};
use crate::utils::token::Tokenizer;

/// Values supplied by the caller, by input or slot name.
pub type Inputs = HashMap<String, String>;

/// Receives prompt text as it is produced: literal spans, inputs and every accepted generated character.
pub trait Echo: Send {
    fn echo(&mut self, text: &str);
}

impl<F> Echo for F where F: FnMut(&str) + Send {
    fn echo(&mut self, text: &str) {
        self(text)
    }
}

/// The prompt accumulated so far, as role-tagged messages. Consecutive text of the same role is merged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunningPrompt {
    messages: Vec<Message>,
    len: usize,
}

impl RunningPrompt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, role: Role, text: &str) {
        if text.is_empty() {
            return;
        }
        self.len += text.len();
        match self.messages.last_mut() {
            Some(last) if last.role == role => last.content.push_str(text),
            _ => self.messages.push(Message::new(role, text)),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Length of the prompt text in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn text(&self) -> String {
        self.messages.iter().map(|msg| msg.content.as_str()).collect()
    }

    /// The text appended after the first `offset` bytes.
    pub fn text_from(&self, offset: usize) -> String {
        let text = self.text();
        text.get(offset..).unwrap_or_default().to_string()
    }
}

/// What happened to one slot.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotOutput {
    pub name: Option<String>,
    pub kind: &'static str,
    /// The text the value was read from.
    pub text: String,
    pub value: std::result::Result<Value, CoercionError>,
    /// Slots of every repeat iteration, in order. Empty for other kinds.
    pub items: Vec<SlotOutput>,
}

/// One evaluated turn. `slots` lists the slots of the turn and of its nested turns in template order.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutput {
    pub role: Role,
    pub text: String,
    pub slots: Vec<SlotOutput>,
}

/// Result of a whole program.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub turns: Vec<TurnOutput>,
    pub prompt: RunningPrompt,
}

impl Evaluation {
    pub fn get(&self, name: &str) -> Option<&SlotOutput> {
        self.slots().find(|slot| slot.name.as_deref() == Some(name))
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.get(name).and_then(|slot| slot.value.as_ref().ok())
    }

    /// Values of all named slots that were resolved.
    pub fn values(&self) -> HashMap<String, Value> {
        self.slots()
            .filter_map(|slot| match (&slot.name, &slot.value) {
                (Some(name), Ok(value)) => Some((name.clone(), value.clone())),
                _ => None,
            })
            .collect()
    }

    /// Named slots whose text could not be coerced.
    pub fn errors(&self) -> Vec<(Option<&str>, &CoercionError)> {
        self.slots()
            .filter_map(|slot| slot.value.as_ref().err().map(|e| (slot.name.as_deref(), e)))
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.values()).unwrap_or_default()
    }

    fn slots(&self) -> impl Iterator<Item=&SlotOutput> {
        self.turns.iter().flat_map(|turn| turn.slots.iter())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Step {
    /// Keep the character in the value.
    Take,
    /// Keep the character in the prompt only.
    Skip,
    /// Keep the character, the value is complete.
    Finish,
    /// Drop the character, the value is complete.
    Stop,
}

#[derive(Debug)]
enum Rule<'a> {
    Text,
    Number { saw_decimal: bool },
    Select { items: &'a [String] },
    Match { tail: &'a Regex, matched: bool },
}

impl<'a> Rule<'a> {
    fn step(&mut self, text: &str, c: char) -> Step {
        match self {
            Rule::Text => Step::Take,
            Rule::Number { saw_decimal } => match c {
                '0'..='9' => Step::Take,
                '-' if text.is_empty() => Step::Take,
                '.' if !*saw_decimal => {
                    *saw_decimal = true;
                    Step::Take
                }
                c if c.is_whitespace() && text.is_empty() => Step::Skip,
                _ => Step::Stop,
            },
            Rule::Select { items } => {
                let candidate = format!("{}{}", text, c);
                if items.iter().any(|item| *item == candidate) {
                    Step::Finish
                } else if items.iter().any(|item| item.starts_with(&candidate)) {
                    Step::Take
                } else {
                    Step::Stop
                }
            }
            Rule::Match { tail, matched } => {
                let candidate = format!("{}{}", text, c);
                if tail.is_match(&candidate) {
                    *matched = true;
                    Step::Take
                } else if *matched {
                    Step::Stop
                } else {
                    Step::Take
                }
            }
        }
    }

    /// The part of the accumulated text that is the value.
    fn value(&self, text: String) -> String {
        match self {
            Rule::Match { tail, .. } => match tail.find(&text) {
                Some(found) => found.as_str().to_string(),
                None => text,
            },
            _ => text,
        }
    }
}

/// Decides, character by character, how much generated text belongs to a slot.
///
/// * string: everything up to a stop sequence, which is dropped
/// * number, range: an optional `-`, digits and at most one `.`, after optional leading whitespace
/// * select: up to the first exact item, or up to the first character that no item continues with
/// * match: up to the first character that breaks a match once there has been one. The text is checked against the
///   pattern anchored at the end, and the value is the match that ends the text
///
/// Stop sequences end any kind. A stream that ends first ends the slot with what was accumulated.
///
/// Accepted text is handed out for echoing by [Extractor::take_echo], minus any tail that may still turn out to be
/// the start of a stop sequence.
#[derive(Debug)]
pub(crate) struct Extractor<'a> {
    rule: Rule<'a>,
    stops: Vec<String>,
    raw: String,
    text: String,
    echoed: usize,
    done: bool,
}

impl<'a> Extractor<'a> {
    pub(crate) fn new(slot: &'a Slot, stops: Vec<String>) -> Self {
        let rule = match &slot.kind {
            SlotKind::String | SlotKind::Repeat { .. } => Rule::Text,
            SlotKind::Number | SlotKind::Range { .. } => Rule::Number { saw_decimal: false },
            SlotKind::Select { items } => Rule::Select { items },
            SlotKind::Match { tail, .. } => Rule::Match { tail, matched: false },
        };
        Self {
            rule,
            stops: stops.into_iter().filter(|stop| !stop.is_empty()).collect(),
            raw: String::new(),
            text: String::new(),
            echoed: 0,
            done: false,
        }
    }

    /// Feed a fragment and return the part of it that was accepted.
    pub(crate) fn feed(&mut self, fragment: &str) -> String {
        let start = self.raw.len();
        for c in fragment.chars() {
            if self.done {
                break;
            }
            match self.rule.step(&self.text, c) {
                Step::Take => {
                    self.text.push(c);
                    self.raw.push(c);
                }
                Step::Finish => {
                    self.text.push(c);
                    self.raw.push(c);
                    self.done = true;
                }
                Step::Skip => self.raw.push(c),
                Step::Stop => {
                    self.done = true;
                    break;
                }
            }
            let text = &self.text;
            let stop = self.stops.iter().find(|stop| text.ends_with(stop.as_str())).map(String::len);
            if let Some(cut) = stop {
                self.text.truncate(self.text.len() - cut);
                self.raw.truncate(self.raw.len() - cut);
                self.done = true;
            }
        }
        self.raw.get(start..).unwrap_or_default().to_string()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    /// Accepted text not echoed yet. Unless `flush` is set or the slot is done, a tail that is the start of a stop
    /// sequence is held back.
    pub(crate) fn take_echo(&mut self, flush: bool) -> String {
        let held = if flush || self.done { 0 } else { self.pending_stop() };
        let end = self.raw.len() - held;
        if end <= self.echoed {
            return String::new();
        }
        let echo = self.raw.get(self.echoed..end).unwrap_or_default().to_string();
        self.echoed = end;
        echo
    }

    /// Length of the longest tail of the text that a stop sequence starts with.
    fn pending_stop(&self) -> usize {
        self.stops
            .iter()
            .flat_map(|stop| stop.char_indices().skip(1).map(move |(i, _)| &stop[..i]))
            .filter(|prefix| self.text.ends_with(prefix))
            .map(str::len)
            .max()
            .unwrap_or(0)
    }

    /// Text for the prompt and text of the value.
    pub(crate) fn finish(self) -> (String, String) {
        let text = self.rule.value(self.text);
        (self.raw, text)
    }
}

/// Stop sequences of a slot. A slot without any stops at the first character of the literal after it. Number, range
/// and match slots only do so if that character is not whitespace, since they may skip or contain it.
fn stops_of(slot: &Slot, next_literal: &str) -> Vec<String> {
    if !slot.options.stop.is_empty() {
        return slot.options.stop.clone();
    }
    match (&slot.kind, next_literal.chars().next()) {
        (SlotKind::String, Some(c)) => vec![c.to_string()],
        (SlotKind::Number | SlotKind::Range { .. } | SlotKind::Match { .. }, Some(c)) if !c.is_whitespace() => {
            vec![c.to_string()]
        }
        _ => Vec::new(),
    }
}

#[derive(Clone, Copy)]
struct Context<'a> {
    inputs: &'a Inputs,
    cancel: &'a CancellationToken,
}

/// Evaluates programs. Holds no state between evaluations besides the echo sink.
pub struct Interpreter {
    transport: Transport,
    echo: Option<Box<dyn Echo>>,
}

impl Interpreter {
    pub fn new(endpoint: Arc<dyn CompletionEndpoint>, tokenizer: Arc<dyn Tokenizer>, config: EngineConfig) -> Self {
        Self::from_transport(Transport::new(endpoint, tokenizer, config))
    }

    pub fn from_transport(transport: Transport) -> Self {
        Self {
            transport,
            echo: None,
        }
    }

    /// Echo the prompt live. Requests are streamed from now on.
    pub fn with_echo(mut self, echo: impl Echo + 'static) -> Self {
        self.echo = Some(Box::new(echo));
        self
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Start evaluating `program`. Fails with [Error::MissingInput] before any call if an input is not supplied.
    pub fn start<'a>(&'a mut self,
                     program: &'a Program,
                     inputs: &'a Inputs,
                     cancel: &'a CancellationToken) -> Result<ProgramRun<'a>> {
        if let Some(missing) = program.turns
            .iter()
            .flat_map(Turn::inputs)
            .find(|name| !inputs.contains_key(*name)) {
            return Err(Error::MissingInput(missing.to_string()));
        }
        Ok(ProgramRun {
            interpreter: self,
            program,
            context: Context { inputs, cancel },
            prompt: RunningPrompt::new(),
            turns: Vec::new(),
            failed: false,
        })
    }

    /// Evaluate all turns of `program`.
    pub async fn run(&mut self, program: &Program, inputs: &Inputs, cancel: &CancellationToken) -> Result<Evaluation> {
        let mut run = self.start(program, inputs, cancel)?;
        while run.next_turn().await?.is_some() {}
        Ok(run.finish())
    }

    fn append(&mut self, prompt: &mut RunningPrompt, role: Role, text: &str) {
        if text.is_empty() {
            return;
        }
        prompt.push(role, text);
        if let Some(echo) = self.echo.as_mut() {
            echo.echo(text);
        }
    }

    fn eval_turn<'a>(&'a mut self,
                     turn: &'a Turn,
                     role: Role,
                     prompt: &'a mut RunningPrompt,
                     context: Context<'a>) -> BoxFuture<'a, Result<Vec<SlotOutput>>> {
        async move {
            let role = turn.role.unwrap_or(role);
            let segments = turn.segments();
            let mut outputs = Vec::new();
            for (i, segment) in segments.iter().enumerate() {
                match *segment {
                    Segment::Literal(text) => self.append(prompt, role, text),
                    Segment::Input(name) => {
                        let value = context.inputs
                            .get(name)
                            .ok_or_else(|| Error::MissingInput(name.to_string()))?;
                        self.append(prompt, role, value);
                    }
                    Segment::Turn(nested) => {
                        let nested = self.eval_turn(nested, role, prompt, context).await?;
                        outputs.extend(nested);
                    }
                    Segment::Slot { name, slot } => {
                        let next_literal = match segments.get(i + 1) {
                            Some(Segment::Literal(text)) => *text,
                            _ => "",
                        };
                        let output = self.resolve(name, slot, next_literal, role, prompt, context).await?;
                        outputs.push(output);
                    }
                    Segment::Repeat { name, length, body } => {
                        let output = self.repeat(name, length, body, role, prompt, context).await?;
                        outputs.push(output);
                    }
                }
            }
            Ok(outputs)
        }.boxed()
    }

    async fn repeat(&mut self,
                    name: Option<&str>,
                    length: usize,
                    body: &Turn,
                    role: Role,
                    prompt: &mut RunningPrompt,
                    context: Context<'_>) -> Result<SlotOutput> {
        let start = prompt.len();
        let mut items = Vec::with_capacity(length);
        let mut values = Vec::with_capacity(length);
        let mut error = None;
        for i in 0..length {
            debug!("Repeat {}: iteration {} of {}", name.unwrap_or("<unnamed>"), i + 1, length);
            let mut iteration = self.eval_turn(body, role, prompt, context).await?;
            let collected: std::result::Result<Vec<Value>, CoercionError> = iteration.iter()
                .map(|output| output.value.clone())
                .collect();
            match collected {
                Ok(mut collected) if collected.len() == 1 => values.push(collected.remove(0)),
                Ok(collected) => values.push(Value::List(collected)),
                Err(e) => {
                    error.get_or_insert(e);
                }
            }
            items.append(&mut iteration);
        }
        Ok(SlotOutput {
            name: name.map(str::to_string),
            kind: "repeat",
            text: prompt.text_from(start),
            value: match error {
                Some(e) => Err(e),
                None => Ok(Value::List(values)),
            },
            items,
        })
    }

    async fn resolve(&mut self,
                     name: Option<&str>,
                     slot: &Slot,
                     next_literal: &str,
                     role: Role,
                     prompt: &mut RunningPrompt,
                     context: Context<'_>) -> Result<SlotOutput> {
        let kind = slot.kind.name();
        if let Some(supplied) = name.and_then(|name| context.inputs.get(name)) {
            debug!("Slot {} is supplied by the caller", name.unwrap_or_default());
            self.append(prompt, role, supplied);
            return Ok(self.output(name, slot, supplied.clone()));
        }
        if context.cancel.is_cancelled() {
            return Err(Error::Cancelled {
                partial: Default::default(),
            });
        }
        let mut extractor = Extractor::new(slot, stops_of(slot, next_literal));
        let request = self.request_for(slot, &extractor.stops, prompt);
        debug!("Generating {} slot {}", kind, name.unwrap_or("<unnamed>"));
        if request.stream {
            let mut stream = self.transport.open(request, context.cancel)?;
            while let Some(fragment) = stream.next_fragment().await {
                extractor.feed(&fragment?);
                self.echo_from(&mut extractor, false);
                if extractor.is_done() {
                    break;
                }
            }
            if extractor.is_done() {
                stream.close();
            } else {
                stream.finish().await?;
                self.echo_from(&mut extractor, true);
            }
        } else {
            let message = self.transport.complete(request, context.cancel).await?;
            extractor.feed(&message.content);
        }
        let (raw, text) = extractor.finish();
        prompt.push(role, &raw);
        Ok(self.output(name, slot, text))
    }

    fn echo_from(&mut self, extractor: &mut Extractor<'_>, flush: bool) {
        let text = extractor.take_echo(flush);
        if let Some(echo) = self.echo.as_mut() {
            if !text.is_empty() {
                echo.echo(&text);
            }
        }
    }

    fn output(&self, name: Option<&str>, slot: &Slot, text: String) -> SlotOutput {
        let value = slot.coerce(&text);
        if let Err(error) = &value {
            warn!("Slot {}: {}", name.unwrap_or("<unnamed>"), error);
        }
        SlotOutput {
            name: name.map(str::to_string),
            kind: slot.kind.name(),
            text,
            value,
            items: Vec::new(),
        }
    }

    fn request_for(&self, slot: &Slot, stops: &[String], prompt: &RunningPrompt) -> ModelRequest {
        let config = self.transport.config();
        let tokenizer = self.transport.tokenizer();
        let compiler = BiasCompiler::new(tokenizer).with_range_limit(config.range_bias_limit);
        let mut request = ModelRequest::new(config.model.clone(), prompt.messages().to_vec());
        request.temperature = slot.options.temperature.or(config.temperature);
        request.max_tokens = slot.options.max_tokens
            .or_else(|| token_limit(tokenizer, slot))
            .or(config.max_tokens);
        request.stop = stops.to_vec();
        request.logit_bias = compiler.compile(slot).unwrap_or_default();
        request.stream = self.echo.is_some();
        request
    }
}

/// Most tokens a select or range value can take.
fn token_limit(tokenizer: &dyn Tokenizer, slot: &Slot) -> Option<u32> {
    let longest = match &slot.kind {
        SlotKind::Select { items } => items.iter().map(|item| tokenizer.count_token(item)).max(),
        SlotKind::Range { from, to } => [from, to].iter().map(|n| tokenizer.count_token(&n.to_string())).max(),
        _ => None,
    };
    longest.map(|n| n as u32)
}

/// A program evaluation in progress.
pub struct ProgramRun<'a> {
    interpreter: &'a mut Interpreter,
    program: &'a Program,
    context: Context<'a>,
    prompt: RunningPrompt,
    turns: Vec<TurnOutput>,
    failed: bool,
}

impl<'a> ProgramRun<'a> {
    /// Evaluate the next turn. Returns `None` when all turns are done or an earlier turn failed.
    pub async fn next_turn(&mut self) -> Result<Option<&TurnOutput>> {
        let program = self.program;
        let Some(turn) = program.turns.get(self.turns.len()) else {
            return Ok(None);
        };
        if self.failed {
            return Ok(None);
        }
        let start = self.prompt.len();
        let role = turn.role.unwrap_or_default();
        let slots = match self.interpreter.eval_turn(turn, role, &mut self.prompt, self.context).await {
            Ok(slots) => slots,
            Err(error) => {
                self.failed = true;
                return Err(error);
            }
        };
        self.turns.push(TurnOutput {
            role,
            text: self.prompt.text_from(start),
            slots,
        });
        Ok(self.turns.last())
    }

    pub fn prompt(&self) -> &RunningPrompt {
        &self.prompt
    }

    pub fn finish(self) -> Evaluation {
        Evaluation {
            turns: self.turns,
            prompt: self.prompt,
        }
    }
}

#[cfg(test)]
mod test_interpreter {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use async_trait::async_trait;
    use futures::stream;
    use tokio_util::sync::CancellationToken;

    use crate::config::EngineConfig;
    use crate::error::Error;
    use crate::program::{Program, Turn};
    use crate::slot::{Slot, Value};
    use crate::stream::{AggregatedMessage, StreamDelta};
    use crate::transport::test_transport::{Script, ScriptedEndpoint};
    use crate::utils::llm::{CompletionEndpoint, DeltaStream, EndpointError, ModelRequest, Role};
    use crate::utils::token::encode_by_bytes;
    use super::{Extractor, Inputs, Interpreter};

    /// Continues the prompt along a fixed transcript. Streams it word by word.
    struct TranscriptEndpoint {
        transcript: String,
        requests: Mutex<Vec<ModelRequest>>,
    }

    impl TranscriptEndpoint {
        fn new(transcript: &str) -> Arc<Self> {
            Arc::new(Self {
                transcript: transcript.to_string(),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn continuation(&self, request: &ModelRequest) -> String {
            self.requests.lock().unwrap().push(request.clone());
            let prompt = request.prompt_text();
            assert!(self.transcript.starts_with(&prompt), "prompt {:?} left the transcript", prompt);
            self.transcript[prompt.len()..].to_string()
        }
    }

    #[async_trait]
    impl CompletionEndpoint for TranscriptEndpoint {
        async fn complete(&self, request: &ModelRequest) -> Result<AggregatedMessage, EndpointError> {
            Ok(AggregatedMessage::with_content(self.continuation(request)))
        }

        async fn stream(&self, request: &ModelRequest) -> Result<DeltaStream, EndpointError> {
            let deltas: Vec<Result<StreamDelta, EndpointError>> = self.continuation(request)
                .split_inclusive(' ')
                .map(|word| Ok(StreamDelta::content("t", word)))
                .collect();
            Ok(Box::pin(stream::iter(deltas)))
        }
    }

    fn interpreter(endpoint: Arc<dyn CompletionEndpoint>) -> Interpreter {
        Interpreter::new(endpoint, Arc::new(encode_by_bytes), EngineConfig::default())
    }

    fn extract(slot: &Slot, stops: &[&str], generated: &str) -> (String, String) {
        let mut extractor = Extractor::new(slot, stops.iter().map(|s| s.to_string()).collect());
        extractor.feed(generated);
        extractor.finish()
    }

    #[tokio::test]
    async fn test_select_boundaries() {
        let endpoint = TranscriptEndpoint::new("The quick brown fox jumped.");
        let echoed = Arc::new(Mutex::new(String::new()));
        let sink = echoed.clone();
        let mut interpreter = interpreter(endpoint.clone())
            .with_echo(move |text: &str| sink.lock().unwrap().push_str(text));
        let program = Program::from(Turn::builder()
            .text("The quick ")
            .slot("color", Slot::select(["brown", "red"]).unwrap())
            .text(" ")
            .slot("animal", Slot::select(["fox", "dog", "cat"]).unwrap())
            .text(" jumped.")
            .build());
        let evaluation = interpreter.run(&program, &Inputs::new(), &CancellationToken::new()).await.unwrap();
        assert_eq!(Some(&Value::Text("brown".to_string())), evaluation.value("color"));
        assert_eq!(Some(&Value::Text("fox".to_string())), evaluation.value("animal"));
        assert_eq!("The quick brown fox jumped.", evaluation.prompt.text());
        assert_eq!("The quick brown fox jumped.", *echoed.lock().unwrap());

        let requests = endpoint.requests.lock().unwrap();
        assert_eq!(2, requests.len());
        assert!(requests.iter().all(|request| request.stream && request.stop.is_empty()));
        assert_eq!(Some(5), requests[0].max_tokens);
        assert!(requests[0].logit_bias.contains_key(&(b'b' as u32)));
        assert_eq!(Some(3), requests[1].max_tokens);
    }

    #[tokio::test]
    async fn test_scripted_token_stream() {
        let endpoint = ScriptedEndpoint::new(vec![
            Script::Stream(vec![
                StreamDelta::content("a", "brown"),
                StreamDelta::content("a", " "),
                StreamDelta::content("a", "fox"),
            ]),
            Script::Stream(vec![
                StreamDelta::content("b", "fox"),
                StreamDelta::content("b", " jumped."),
            ]),
        ]);
        let mut interpreter = interpreter(endpoint.clone()).with_echo(|_: &str| {});
        let program = Program::from(Turn::builder()
            .text("The quick ")
            .slot("color", Slot::select(["brown", "red"]).unwrap())
            .text(" ")
            .slot("animal", Slot::select(["fox", "dog", "cat"]).unwrap())
            .text(" jumped.")
            .build());
        let evaluation = interpreter.run(&program, &Inputs::new(), &CancellationToken::new()).await.unwrap();
        assert_eq!("brown", evaluation.get("color").unwrap().text);
        assert_eq!("fox", evaluation.get("animal").unwrap().text);
        let requests = endpoint.requests.lock().unwrap();
        assert_eq!("The quick brown ", requests[1].prompt_text());
    }

    #[tokio::test]
    async fn test_string_and_number() {
        let endpoint = TranscriptEndpoint::new("{\n  \"name\": \"Aria\",\n  \"age\": 27\n}");
        let mut interpreter = interpreter(endpoint.clone());
        let program = Program::from(Turn::builder()
            .text("{\n  \"name\": \"")
            .slot("name", Slot::string())
            .text("\",\n  \"age\": ")
            .slot("age", Slot::range(1, 100).unwrap())
            .text("\n}")
            .build());
        let evaluation = interpreter.run(&program, &Inputs::new(), &CancellationToken::new()).await.unwrap();
        assert_eq!(Some(&Value::Text("Aria".to_string())), evaluation.value("name"));
        assert_eq!(Some(&Value::Number(27.0)), evaluation.value("age"));
        assert_eq!(serde_json::json!({"name": "Aria", "age": 27.0}), evaluation.to_json());

        let requests = endpoint.requests.lock().unwrap();
        assert_eq!(vec!["\"".to_string()], requests[0].stop);
        assert!(requests[0].logit_bias.is_empty());
        assert!(!requests[0].stream);
        assert!(requests[1].stop.is_empty());
        assert!(!requests[1].logit_bias.is_empty());
    }

    #[tokio::test]
    async fn test_repeat_flattens() {
        let endpoint = TranscriptEndpoint::new("Items:\n- sword\n- shield\n- potion\n");
        let mut interpreter = interpreter(endpoint).with_echo(|_: &str| {});
        let body = Turn::builder().text("- ").slot_unnamed(Slot::string()).text("\n").build();
        let program = Program::from(Turn::builder()
            .text("Items:\n")
            .slot("items", Slot::repeat(3, body).unwrap())
            .build());
        let evaluation = interpreter.run(&program, &Inputs::new(), &CancellationToken::new()).await.unwrap();
        let items = evaluation.value("items").unwrap().as_list().unwrap();
        assert_eq!(vec![
            Value::Text("sword".to_string()),
            Value::Text("shield".to_string()),
            Value::Text("potion".to_string()),
        ], items);
        let output = evaluation.get("items").unwrap();
        assert_eq!(3, output.items.len());
        assert_eq!("- sword\n- shield\n- potion\n", output.text);
    }

    #[tokio::test]
    async fn test_repeat_keeps_pairs() {
        let endpoint = TranscriptEndpoint::new("sword 3\nbow 1\n");
        let mut interpreter = interpreter(endpoint);
        let body = Turn::builder()
            .slot("item", Slot::string())
            .text(" ")
            .slot("count", Slot::number())
            .text("\n")
            .build();
        let program = Program::from(Turn::builder().slot("loot", Slot::repeat(2, body).unwrap()).build());
        let evaluation = interpreter.run(&program, &Inputs::new(), &CancellationToken::new()).await.unwrap();
        assert_eq!(Value::List(vec![
            Value::List(vec![Value::Text("sword".to_string()), Value::Number(3.0)]),
            Value::List(vec![Value::Text("bow".to_string()), Value::Number(1.0)]),
        ]), *evaluation.value("loot").unwrap());
        // slots of the body are only reported inside the repeat
        assert!(evaluation.get("item").is_none());
    }

    #[tokio::test]
    async fn test_coercion_is_scoped() {
        let endpoint = TranscriptEndpoint::new("level 42, class mage.");
        let mut interpreter = interpreter(endpoint);
        let program = Program::from(Turn::builder()
            .text("level ")
            .slot("level", Slot::range(1, 10).unwrap())
            .text(", class ")
            .slot("class", Slot::select(["mage", "rogue"]).unwrap())
            .text(".")
            .build());
        let evaluation = interpreter.run(&program, &Inputs::new(), &CancellationToken::new()).await.unwrap();
        let level = evaluation.get("level").unwrap();
        assert_eq!("42", level.text);
        assert!(level.value.is_err());
        assert_eq!(Some(&Value::Text("mage".to_string())), evaluation.value("class"));
        assert_eq!(1, evaluation.errors().len());
        assert_eq!(1, evaluation.values().len());
    }

    #[tokio::test]
    async fn test_inputs_and_supplied_values() {
        let endpoint = TranscriptEndpoint::new("Hero: Aria. Class: rogue. Motto: Never look back.");
        let mut interpreter = interpreter(endpoint.clone());
        let turn = Turn::from_template(None, "Hero: {[hero]}. Class: {[class]}. Motto: {[motto]}.", [
            ("class", Slot::select(["mage", "rogue"]).unwrap()),
            ("motto", Slot::string()),
        ]).unwrap();
        let program = Program::from(turn);
        let inputs = Inputs::from([
            ("hero".to_string(), "Aria".to_string()),
            ("class".to_string(), "rogue".to_string()),
        ]);
        let evaluation = interpreter.run(&program, &inputs, &CancellationToken::new()).await.unwrap();
        assert_eq!(Some(&Value::Text("rogue".to_string())), evaluation.value("class"));
        assert_eq!(Some(&Value::Text("Never look back".to_string())), evaluation.value("motto"));
        // only the motto was generated
        assert_eq!(1, endpoint.requests.lock().unwrap().len());
    }

    #[tokio::test]
    async fn test_missing_input() {
        let endpoint = ScriptedEndpoint::new(vec![]);
        let mut interpreter = interpreter(endpoint.clone());
        let program = Program::from(Turn::builder()
            .slot("greeting", Slot::string())
            .text(", ")
            .input("user")
            .build());
        let error = interpreter.run(&program, &HashMap::new(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(error, Error::MissingInput(name) if name == "user"));
        assert_eq!(0, endpoint.calls());
    }

    #[tokio::test]
    async fn test_already_cancelled() {
        let endpoint = ScriptedEndpoint::new(vec![]);
        let mut interpreter = interpreter(endpoint.clone());
        let program = Program::from(Turn::builder().text("Say: ").slot("word", Slot::string()).build());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = interpreter.run(&program, &Inputs::new(), &cancel).await.unwrap_err();
        assert!(matches!(error, Error::Cancelled { .. }));
        assert_eq!(0, endpoint.calls());
    }

    #[tokio::test]
    async fn test_cancel_while_streaming() {
        let endpoint = ScriptedEndpoint::new(vec![Script::Stream(vec![
            StreamDelta::content("a", "Hel"),
            StreamDelta::content("a", "lo"),
            StreamDelta::content("a", " there"),
        ])]);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        let mut interpreter = interpreter(endpoint).with_echo(move |text: &str| {
            if text == "Hel" {
                canceller.cancel();
            }
        });
        let program = Program::from(Turn::builder().text("Say: ").slot("word", Slot::string()).build());
        let error = interpreter.run(&program, &Inputs::new(), &cancel).await.unwrap_err();
        assert_eq!("Hel", error.partial().expect("cancelled with the partial message").content);
    }

    #[tokio::test]
    async fn test_turns_are_stepped() {
        let endpoint = TranscriptEndpoint::new("Pick a class: mage or rogue?rogue");
        let mut interpreter = interpreter(endpoint.clone());
        let program = Program::new(vec![
            Turn::user().text("Pick a class: mage or rogue?").build(),
            Turn::assistant().slot("class", Slot::select(["mage", "rogue"]).unwrap()).build(),
        ]).unwrap();
        let inputs = Inputs::new();
        let cancel = CancellationToken::new();
        let mut run = interpreter.start(&program, &inputs, &cancel).unwrap();
        let first = run.next_turn().await.unwrap().unwrap();
        assert_eq!(Role::User, first.role);
        assert!(first.slots.is_empty());
        let second = run.next_turn().await.unwrap().unwrap();
        assert_eq!("rogue", second.text);
        assert!(run.next_turn().await.unwrap().is_none());
        let evaluation = run.finish();
        assert_eq!(2, evaluation.prompt.messages().len());

        let requests = endpoint.requests.lock().unwrap();
        assert_eq!(Role::User, requests[0].messages[0].role);
    }

    #[test]
    fn test_number_extraction() {
        let number = Slot::number();
        assert_eq!(("12.5".to_string(), "12.5".to_string()), extract(&number, &[], "12.5.3"));
        assert_eq!(("-7".to_string(), "-7".to_string()), extract(&number, &[], "-7 apples"));
        assert_eq!((" 42".to_string(), "42".to_string()), extract(&number, &[], " 42,"));
        assert_eq!(("3".to_string(), "3".to_string()), extract(&number, &[], "3-4"));
        let (_, text) = extract(&number, &[], "abc");
        assert!(number.coerce(&text).is_err());
    }

    #[test]
    fn test_select_extraction() {
        let select = Slot::select(["chain", "chainmail", "plate"]).unwrap();
        // the first exact item wins
        assert_eq!("chain", extract(&select, &[], "chainmail").1);
        assert_eq!("pla", extract(&select, &[], "plank").1);
        assert_eq!("plate", extract(&select, &[], "plate armor").1);
    }

    #[test]
    fn test_match_extraction() {
        let slot = Slot::matching("[a-z]+@[a-z]+").unwrap();
        assert_eq!("bob@mail", extract(&slot, &[], "bob@mail.com").1);
        let digits = Slot::matching("[0-9]+").unwrap();
        assert_eq!("1234", extract(&digits, &[], "1234, 5").1);
        // never matched: everything is kept and fails coercion
        let (_, text) = extract(&digits, &[], "abc");
        assert_eq!("abc", text);
        assert!(digits.coerce(&text).is_err());
    }

    #[test]
    fn test_match_after_leading_text() {
        let digits = Slot::matching("[0-9]+").unwrap();
        let (raw, text) = extract(&digits, &[","], "about 12,\n  \"items\": [\"sword\"]");
        assert_eq!("about 12", raw);
        assert_eq!("12", text);
        assert_eq!(Value::Text("12".to_string()), digits.coerce(&text).unwrap());
        // the first character breaking the match ends the slot even without stops
        assert_eq!(("about 12".to_string(), "12".to_string()), extract(&digits, &[], "about 12 and more"));
    }

    #[tokio::test]
    async fn test_match_and_number_stop_at_next_literal() {
        let endpoint = TranscriptEndpoint::new("Code: AB-12, level 7.5!");
        let mut interpreter = interpreter(endpoint.clone());
        let program = Program::from(Turn::builder()
            .text("Code: ")
            .slot("code", Slot::matching("[A-Z]+-[0-9]+").unwrap())
            .text(", level ")
            .slot("level", Slot::number())
            .text("!")
            .build());
        let evaluation = interpreter.run(&program, &Inputs::new(), &CancellationToken::new()).await.unwrap();
        assert_eq!(Some(&Value::Text("AB-12".to_string())), evaluation.value("code"));
        assert_eq!(Some(&Value::Number(7.5)), evaluation.value("level"));
        assert_eq!("Code: AB-12, level 7.5!", evaluation.prompt.text());

        let requests = endpoint.requests.lock().unwrap();
        assert_eq!(vec![",".to_string()], requests[0].stop);
        assert_eq!(vec!["!".to_string()], requests[1].stop);
    }

    #[test]
    fn test_stop_sequences() {
        let slot = Slot::string();
        assert_eq!("foo", extract(&slot, &["END"], "fooEND bar").1);
        assert_eq!("a", extract(&slot, &[",", "\n"], "a\nb,c").1);
        assert_eq!("no stop", extract(&slot, &[], "no stop").1);

        let mut extractor = Extractor::new(&slot, vec!["END".to_string()]);
        assert_eq!("fooE", extractor.feed("fooE"));
        assert!(!extractor.is_done());
        assert_eq!("", extractor.feed("ND more"));
        assert!(extractor.is_done());
        assert_eq!("foo", extractor.finish().1);
    }

    #[test]
    fn test_echo_holds_back_stop_prefix() {
        let slot = Slot::string();
        let mut extractor = Extractor::new(&slot, vec!["END".to_string()]);
        extractor.feed("fooE");
        assert_eq!("foo", extractor.take_echo(false));
        extractor.feed("ND more");
        assert_eq!("", extractor.take_echo(false));

        let mut extractor = Extractor::new(&slot, vec!["END".to_string()]);
        extractor.feed("fooE");
        assert_eq!("foo", extractor.take_echo(false));
        extractor.feed("x");
        assert_eq!("Ex", extractor.take_echo(false));
        extractor.feed("EN");
        assert_eq!("", extractor.take_echo(false));
        // the stream ended before the stop completed
        assert_eq!("EN", extractor.take_echo(true));
    }

    #[tokio::test]
    async fn test_echo_matches_prompt_across_fragments() {
        let endpoint = ScriptedEndpoint::new(vec![Script::Stream(vec![
            StreamDelta::content("a", "fooE"),
            StreamDelta::content("a", "ND more"),
        ])]);
        let echoed = Arc::new(Mutex::new(String::new()));
        let sink = echoed.clone();
        let mut interpreter = interpreter(endpoint)
            .with_echo(move |text: &str| sink.lock().unwrap().push_str(text));
        let program = Program::from(Turn::builder().text("Say: ").slot("word", Slot::string().stop(["END"])).build());
        let evaluation = interpreter.run(&program, &Inputs::new(), &CancellationToken::new()).await.unwrap();
        assert_eq!("Say: foo", evaluation.prompt.text());
        assert_eq!("Say: foo", *echoed.lock().unwrap());
    }
}
