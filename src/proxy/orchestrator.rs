//! Per-request coordination of the credential pool and the upstream.
//!
//! Each request runs an explicit, bounded state machine:
//!
//! ```text
//! Init -> Acquiring -> CreatingConversation -> SendingChat -> Success
//!             ^                 |                   |
//!             |                 +-------+-----------+
//!             |                         v
//!        RetryPending <------ retryable failure ------> Exhausted
//!                             non-retryable failure --> Fatal
//! ```
//!
//! A streamed reply is committed once its first delta arrives; after that
//! the attempt can no longer be retried and an upstream error ends the
//! stream with a truncation marker.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{Stream, StreamExt};
use tokio::time::Instant;

use super::retry::{calculate_backoff, should_retry};
use super::stats::ProxyStats;
use crate::config::RetryConfig;
use crate::pool::{CredentialPool, PoolError, TokenId, TokenLease};
use crate::types::openai::{
    estimate_tokens, ChatCompletionChoice, ChatCompletionChunk, ChatCompletionDelta,
    ChatCompletionRequest, ChatCompletionResponse, ChatCompletionStreamChoice, ChatMessage, Role,
    Usage,
};
use crate::types::{ProxyError, Result};
use crate::upstream::{
    ChatReply, ConversationContext, DeltaStream, Upstream, UpstreamCompletion, UpstreamDelta,
    UpstreamFailure,
};

pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Item of a committed streamed reply. `Truncated` is always last.
#[derive(Debug)]
pub enum StreamEvent {
    Chunk(ChatCompletionChunk),
    Truncated(ProxyError),
}

pub enum ProxyOutcome {
    Complete(ChatCompletionResponse),
    Stream(ChunkStream),
}

impl std::fmt::Debug for ProxyOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyOutcome::Complete(r) => f.debug_tuple("Complete").field(r).finish(),
            ProxyOutcome::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// One iteration of the retry loop, logged when it ends.
#[derive(Debug)]
struct RequestAttempt {
    number: usize,
    token_id: TokenId,
    started: Instant,
}

impl RequestAttempt {
    fn finish(&self, outcome: &str) {
        tracing::info!(
            attempt = self.number,
            token_id = self.token_id,
            outcome,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Attempt finished"
        );
    }
}

enum State {
    Init,
    Acquiring,
    CreatingConversation {
        lease: TokenLease,
        attempt: RequestAttempt,
    },
    SendingChat {
        lease: TokenLease,
        attempt: RequestAttempt,
        conversation: ConversationContext,
    },
    RetryPending {
        delay: Duration,
    },
    Success(ProxyOutcome),
    Exhausted(UpstreamFailure),
    Fatal(ProxyError),
}

/// Identity shared by every object of one response.
#[derive(Debug, Clone)]
struct ResponseMeta {
    id: String,
    created: i64,
    model: String,
    prompt_tokens: u32,
}

impl ResponseMeta {
    fn new(request: &ChatCompletionRequest) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: Utc::now().timestamp(),
            model: request.model.clone(),
            prompt_tokens: request.estimated_prompt_tokens(),
        }
    }

    fn chunk(
        &self,
        delta: ChatCompletionDelta,
        finish_reason: Option<String>,
        usage: Option<Usage>,
    ) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChatCompletionStreamChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        }
    }
}

pub struct ProxyOrchestrator {
    pool: Arc<CredentialPool>,
    upstream: Arc<dyn Upstream>,
    retry: RetryConfig,
    stats: Arc<ProxyStats>,
}

impl ProxyOrchestrator {
    pub fn new(
        pool: Arc<CredentialPool>,
        upstream: Arc<dyn Upstream>,
        retry: RetryConfig,
        stats: Arc<ProxyStats>,
    ) -> Self {
        Self {
            pool,
            upstream,
            retry,
            stats,
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.stats
    }

    /// Serve one chat request. Dropping the returned future cancels the
    /// in-flight upstream call or backoff and returns the lease unjudged.
    pub async fn handle(&self, request: ChatCompletionRequest) -> Result<ProxyOutcome> {
        self.stats.record_request();

        let meta = ResponseMeta::new(&request);
        let mut attempts = 0usize;
        let mut tried: HashSet<TokenId> = HashSet::new();
        let mut last_failure: Option<UpstreamFailure> = None;
        let mut state = State::Init;

        loop {
            state = match state {
                State::Init => State::Acquiring,

                State::Acquiring => match self.pool.acquire_excluding(&tried) {
                    Ok(lease) => {
                        attempts += 1;
                        tried.insert(lease.id());
                        let attempt = RequestAttempt {
                            number: attempts,
                            token_id: lease.id(),
                            started: Instant::now(),
                        };
                        State::CreatingConversation { lease, attempt }
                    }
                    Err(PoolError::NoHealthyCredentials) => {
                        if attempts > 0 {
                            tracing::warn!(attempts, "Pool has no healthy token left for retry");
                        }
                        State::Fatal(ProxyError::NoHealthyCredentials)
                    }
                    Err(PoolError::AllTried) => match last_failure.take() {
                        Some(failure) => {
                            tracing::warn!(attempts, "No untried healthy token left for retry");
                            State::Exhausted(failure)
                        }
                        None => State::Fatal(ProxyError::NoHealthyCredentials),
                    },
                    Err(e) => State::Fatal(ProxyError::Internal(e.to_string())),
                },

                State::CreatingConversation { lease, attempt } => {
                    match self.upstream.create_conversation(lease.credential()).await {
                        Ok(conversation) => {
                            tracing::debug!(
                                attempt = attempt.number,
                                token_id = conversation.token_id,
                                conversation_id = %conversation.conversation_id,
                                referer = %conversation.referer,
                                created_at = %conversation.created_at,
                                "Conversation created"
                            );
                            State::SendingChat {
                                lease,
                                attempt,
                                conversation,
                            }
                        }
                        Err(failure) => self.on_failure(lease, &attempt, failure, &mut last_failure),
                    }
                }

                State::SendingChat {
                    lease,
                    attempt,
                    conversation,
                } => {
                    let reply = self
                        .upstream
                        .send_chat(lease.credential(), &conversation, &request)
                        .await;

                    match reply {
                        Ok(ChatReply::Complete(completion)) => {
                            lease.succeed();
                            attempt.finish("success");
                            self.stats.record_success();
                            State::Success(ProxyOutcome::Complete(complete_response(
                                &meta, completion,
                            )))
                        }
                        Ok(ChatReply::Stream(mut deltas)) => match deltas.next().await {
                            Some(Err(failure)) => {
                                self.on_failure(lease, &attempt, failure, &mut last_failure)
                            }
                            first => {
                                attempt.finish("committed");
                                let first = first.and_then(|item| item.ok());
                                State::Success(ProxyOutcome::Stream(self.commit_stream(
                                    lease, first, deltas, meta.clone(),
                                )))
                            }
                        },
                        Err(failure) => self.on_failure(lease, &attempt, failure, &mut last_failure),
                    }
                }

                State::RetryPending { delay } => {
                    tracing::info!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying request with a fresh token"
                    );
                    tokio::time::sleep(delay).await;
                    State::Acquiring
                }

                State::Success(outcome) => return Ok(outcome),

                State::Exhausted(failure) => {
                    self.stats.record_failure();
                    return Err(ProxyError::RetriesExhausted {
                        attempts,
                        last: failure.to_string(),
                    });
                }

                State::Fatal(error) => {
                    self.stats.record_failure();
                    return Err(error);
                }
            };
        }
    }

    fn on_failure(
        &self,
        lease: TokenLease,
        attempt: &RequestAttempt,
        failure: UpstreamFailure,
        last_failure: &mut Option<UpstreamFailure>,
    ) -> State {
        attempt.finish(failure.kind());
        tracing::warn!(
            attempt = attempt.number,
            token_id = attempt.token_id,
            error = %failure,
            "Upstream attempt failed"
        );

        if !failure.is_retryable() {
            // Request-level failure, the token is not to blame
            drop(lease);
            return State::Fatal(fatal_error(failure));
        }

        lease.fail();

        if should_retry(&failure, attempt.number, &self.retry) {
            let delay = calculate_backoff(attempt.number, &self.retry);
            *last_failure = Some(failure);
            State::RetryPending { delay }
        } else {
            State::Exhausted(failure)
        }
    }

    fn commit_stream(
        &self,
        lease: TokenLease,
        first: Option<UpstreamDelta>,
        rest: DeltaStream,
        meta: ResponseMeta,
    ) -> ChunkStream {
        let stats = Arc::clone(&self.stats);

        Box::pin(async_stream::stream! {
            // Held until the stream ends or is dropped
            let mut lease = Some(lease);
            let deltas = futures::stream::iter(first.map(Ok)).chain(rest);
            futures::pin_mut!(deltas);

            let mut sent_role = false;
            let mut content = String::new();
            let mut finish_reason: Option<String> = None;
            let mut usage: Option<Usage> = None;

            while let Some(item) = deltas.next().await {
                let delta = match item {
                    Ok(delta) => delta,
                    Err(failure) => {
                        tracing::warn!(
                            id = %meta.id,
                            error = %failure,
                            "Upstream stream failed after commit"
                        );
                        drop(lease.take());
                        stats.record_failure();
                        yield StreamEvent::Truncated(ProxyError::StreamTruncated(failure.to_string()));
                        return;
                    }
                };

                if delta.finish_reason.is_some() {
                    finish_reason = delta.finish_reason;
                }
                if delta.usage.is_some() {
                    usage = delta.usage;
                }
                if delta.role.is_none() && delta.content.is_none() {
                    continue;
                }

                let role = match delta.role {
                    Some(role) => Some(role),
                    None if !sent_role => Some(Role::Assistant),
                    None => None,
                };
                sent_role = true;
                if let Some(text) = &delta.content {
                    content.push_str(text);
                }

                yield StreamEvent::Chunk(meta.chunk(
                    ChatCompletionDelta { role, content: delta.content },
                    None,
                    None,
                ));
            }

            let usage = usage.unwrap_or_else(|| {
                Usage::new(meta.prompt_tokens, estimate_tokens(&content))
            });
            yield StreamEvent::Chunk(meta.chunk(
                ChatCompletionDelta::default(),
                Some(finish_reason.unwrap_or_else(|| "stop".to_string())),
                Some(usage),
            ));

            if let Some(lease) = lease.take() {
                lease.succeed();
            }
            stats.record_success();
            tracing::debug!(id = %meta.id, "Upstream stream completed");
        })
    }
}

fn complete_response(meta: &ResponseMeta, completion: UpstreamCompletion) -> ChatCompletionResponse {
    let usage = completion.usage.unwrap_or_else(|| {
        Usage::new(meta.prompt_tokens, estimate_tokens(&completion.content))
    });

    ChatCompletionResponse {
        id: meta.id.clone(),
        object: "chat.completion".to_string(),
        created: meta.created,
        model: meta.model.clone(),
        choices: vec![ChatCompletionChoice {
            index: 0,
            message: ChatMessage {
                role: Role::Assistant,
                content: completion.content,
            },
            finish_reason: Some(
                completion
                    .finish_reason
                    .unwrap_or_else(|| "stop".to_string()),
            ),
        }],
        usage: Some(usage),
    }
}

fn fatal_error(failure: UpstreamFailure) -> ProxyError {
    match failure {
        UpstreamFailure::Http { status } => ProxyError::UpstreamClient { status },
        UpstreamFailure::Malformed(message) => ProxyError::MalformedResponse(message),
        other => ProxyError::Internal(other.to_string()),
    }
}
