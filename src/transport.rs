//! # Completion transport
//! [Transport] executes one logical completion call against a [CompletionEndpoint]:
//!
//! 1. If the caller's cancellation token is already cancelled, nothing is sent and an empty assistant message is
//!    returned.
//! 2. The prompt is counted with the injected tokenizer. Max output tokens are cut down to what is left of the context
//!    window; a prompt that does not leave room for a single token fails with [Error::BudgetExceeded].
//! 3. The request is sent. Transient failures (see [EndpointError::is_transient]) are retried with exponential backoff,
//!    see [RequestState]. Other failures are returned at once, wrapped in [Error::Endpoint].
//!
//! Streaming calls are handled by a driver task that connects (with the same retry loop), waits at most
//! `first_byte_timeout` for the first delta, and then forwards deltas into a channel. The caller reads the channel
//! through a [CompletionStream], which folds the deltas as they pass. A connection that stays silent past the
//! timeout counts as a transient failure. Once the first delta has been forwarded, failures are no longer retried
//! because the caller may already have consumed output.
//!
//! Every call owns a child of the caller's token. Cancelling either one stops the network call, and the call fails
//! with [Error::Cancelled] carrying the partial message.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use futures::StreamExt;
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, RetryConfig};
use crate::error::{Error, Result};
use crate::stream::{AggregatedMessage, StreamAggregator, StreamDelta};
use crate::utils::llm::{CompletionEndpoint, EndpointError, ModelRequest};
use crate::utils::token::Tokenizer;

/// Deltas buffered between the driver task and the reader.
const STREAM_BUFFER: usize = 32;

/// Retry bookkeeping of one logical call. Never shared between calls.
#[derive(Debug, Clone)]
pub struct RequestState {
    attempts_left: u32,
    backoff: Duration,
    max_backoff: Duration,
}

impl RequestState {
    pub fn new(retry: &RetryConfig) -> Self {
        Self {
            attempts_left: retry.attempts,
            backoff: retry.base_backoff(),
            max_backoff: retry.max_backoff(),
        }
    }

    pub fn attempts_left(&self) -> u32 {
        self.attempts_left
    }

    /// Spend one attempt and return the delay to wait before it, or `None` if no attempt is left.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.attempts_left == 0 {
            return None;
        }
        self.attempts_left -= 1;
        let delay = self.backoff.min(self.max_backoff);
        self.backoff = self.backoff.saturating_mul(2).min(self.max_backoff);
        Some(delay)
    }
}

fn cancelled_empty() -> Error {
    StreamAggregator::new().cancel()
}

/// Run `attempt` until it succeeds, fails for good, or `token` is cancelled.
async fn retrying<T, F, Fut>(retry: &RetryConfig, token: &CancellationToken, mut attempt: F) -> Result<T>
    where F: FnMut() -> Fut,
          Fut: Future<Output=std::result::Result<T, EndpointError>> {
    let mut state = RequestState::new(retry);
    let mut attempts = 0;
    loop {
        attempts += 1;
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            outcome = attempt() => Some(outcome),
        };
        let Some(outcome) = outcome else {
            return Err(cancelled_empty());
        };
        let error = match outcome {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() => error,
            Err(error) => return Err(Error::Endpoint(error)),
        };
        let Some(delay) = state.next_backoff() else {
            return Err(Error::RetriesExhausted {
                attempts,
                source: error,
            });
        };
        warn!("Attempt {} failed with a transient error: {}. Retrying in {:?}, {} retries left.",
            attempts, error, delay, state.attempts_left());
        let slept = tokio::select! {
            biased;
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        };
        if !slept {
            return Err(cancelled_empty());
        }
    }
}

/// Issues completion calls with budgeting, retries and cancellation.
#[derive(Clone)]
pub struct Transport {
    endpoint: Arc<dyn CompletionEndpoint>,
    tokenizer: Arc<dyn Tokenizer>,
    config: EngineConfig,
}

impl Transport {
    pub fn new(endpoint: Arc<dyn CompletionEndpoint>, tokenizer: Arc<dyn Tokenizer>, config: EngineConfig) -> Self {
        Self {
            endpoint,
            tokenizer,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    /// Number of prompt tokens of a request.
    pub fn prompt_tokens(&self, request: &ModelRequest) -> usize {
        request.messages
            .iter()
            .map(|msg| self.tokenizer.count_msg_token(msg))
            .sum()
    }

    /// Fit the max output tokens of `request` into the context window.
    pub fn fit_budget(&self, request: &mut ModelRequest) -> Result<()> {
        let Some(context_window) = self.config.context_window() else {
            warn!("Context window of model {} is unknown, so the token budget is not checked", self.config.model);
            return Ok(());
        };
        let prompt_tokens = self.prompt_tokens(request);
        if prompt_tokens >= context_window {
            return Err(Error::BudgetExceeded {
                model: self.config.model.clone(),
                prompt_tokens,
                context_window,
            });
        }
        let available = context_window - prompt_tokens;
        if let Some(max_tokens) = request.max_tokens {
            if max_tokens as usize > available {
                debug!("Max output tokens {} cut down to {} to fit the context window", max_tokens, available);
                request.max_tokens = Some(available as u32);
            }
        }
        Ok(())
    }

    /// Issue a call and return the complete response.
    ///
    /// With `request.stream` set, the response is streamed and folded.
    pub async fn complete(&self, mut request: ModelRequest, cancel: &CancellationToken) -> Result<AggregatedMessage> {
        if cancel.is_cancelled() {
            debug!("Cancelled before the call, nothing is sent");
            return Ok(AggregatedMessage::empty());
        }
        if request.stream {
            return self.open(request, cancel)?.finish().await;
        }
        self.fit_budget(&mut request)?;
        debug!("Sending request to {} with {} messages", request.model, request.messages.len());
        let token = cancel.child_token();
        let endpoint = self.endpoint.as_ref();
        let request = &request;
        retrying(&self.config.retry, &token, move || endpoint.complete(request)).await
    }

    /// Issue a streaming call. Deltas are read through the returned [CompletionStream].
    pub fn open(&self, mut request: ModelRequest, cancel: &CancellationToken) -> Result<CompletionStream> {
        if cancel.is_cancelled() {
            debug!("Cancelled before the call, nothing is sent");
            return Ok(CompletionStream::skipped());
        }
        self.fit_budget(&mut request)?;
        request.stream = true;
        debug!("Streaming request to {} with {} messages", request.model, request.messages.len());
        let token = cancel.child_token();
        let (sender, receiver) = mpsc::channel(STREAM_BUFFER);
        let driver = tokio::spawn(drive(
            self.endpoint.clone(),
            request,
            self.config.retry.clone(),
            self.config.first_byte_timeout(),
            token.clone(),
            sender,
        ));
        Ok(CompletionStream {
            receiver,
            aggregator: StreamAggregator::new(),
            token,
            driver: Some(driver),
            done: false,
            skipped: false,
        })
    }
}

/// Driver task of a streaming call: connect with retries, then forward deltas until the end or cancellation.
async fn drive(endpoint: Arc<dyn CompletionEndpoint>,
               request: ModelRequest,
               retry: RetryConfig,
               first_byte_timeout: Duration,
               token: CancellationToken,
               sender: mpsc::Sender<Result<StreamDelta>>) {
    let endpoint = endpoint.as_ref();
    let request = &request;
    let connect = move || async move {
        let connecting = async {
            let mut stream = endpoint.stream(request).await?;
            let first = stream.next().await.transpose()?;
            Ok::<_, EndpointError>((first, stream))
        };
        tokio::time::timeout(first_byte_timeout, connecting)
            .await
            .unwrap_or(Err(EndpointError::Timeout))
    };
    let (first, mut stream) = match retrying(&retry, &token, connect).await {
        Ok(connected) => connected,
        Err(error) => {
            let _ = sender.send(Err(error)).await;
            return;
        }
    };
    let Some(first) = first else {
        return;
    };
    if sender.send(Ok(first)).await.is_err() {
        return;
    }
    loop {
        let item = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            item = stream.next() => Some(item),
        };
        match item {
            None | Some(None) => break,
            Some(Some(Ok(delta))) => {
                if sender.send(Ok(delta)).await.is_err() {
                    break;
                }
            }
            Some(Some(Err(error))) => {
                let _ = sender.send(Err(Error::Endpoint(error))).await;
                break;
            }
        }
    }
    // dropping the stream closes the connection
    drop(stream);
}

/// Reader side of a streaming call.
pub struct CompletionStream {
    receiver: mpsc::Receiver<Result<StreamDelta>>,
    aggregator: StreamAggregator,
    token: CancellationToken,
    driver: Option<JoinHandle<()>>,
    done: bool,
    skipped: bool,
}

impl CompletionStream {
    /// A stream of a call that was never sent.
    fn skipped() -> Self {
        let (_, receiver) = mpsc::channel(1);
        Self {
            receiver,
            aggregator: StreamAggregator::new(),
            token: CancellationToken::new(),
            driver: None,
            done: true,
            skipped: true,
        }
    }

    /// Number of deltas read so far.
    pub fn received(&self) -> usize {
        self.aggregator.received()
    }

    /// Read the content fragment of the next delta. Deltas without content yield an empty fragment.
    ///
    /// Returns `None` after the stream ended normally. Once an error was returned, the stream is done.
    pub async fn next_fragment(&mut self) -> Option<Result<String>> {
        if self.done {
            return None;
        }
        let item = tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            item = self.receiver.recv() => Some(item),
        };
        let Some(item) = item else {
            return Some(Err(self.cancelled()));
        };
        match item {
            Some(Ok(delta)) => match self.aggregator.push(&delta) {
                Ok(()) => Some(Ok(delta.content.unwrap_or_default())),
                Err(error) => {
                    self.shutdown();
                    Some(Err(error))
                }
            },
            Some(Err(error)) => {
                self.shutdown();
                Some(Err(error))
            }
            None if self.token.is_cancelled() => Some(Err(self.cancelled())),
            None => {
                self.done = true;
                None
            }
        }
    }

    /// Read the rest of the stream and return the complete message.
    pub async fn finish(mut self) -> Result<AggregatedMessage> {
        while let Some(fragment) = self.next_fragment().await {
            fragment?;
        }
        if self.skipped {
            return Ok(AggregatedMessage::empty());
        }
        std::mem::take(&mut self.aggregator).finish()
    }

    /// Stop reading, close the connection, and return what was folded so far.
    pub fn close(mut self) -> AggregatedMessage {
        self.shutdown();
        self.aggregator.snapshot()
    }

    fn cancelled(&mut self) -> Error {
        self.shutdown();
        Error::Cancelled {
            partial: Box::new(self.aggregator.snapshot()),
        }
    }

    fn shutdown(&mut self) {
        self.done = true;
        self.token.cancel();
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

impl Drop for CompletionStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}
