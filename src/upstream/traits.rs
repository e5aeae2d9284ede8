use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;

use super::UpstreamFailure;
use crate::pool::{Credential, TokenId};
use crate::types::openai::{ChatCompletionRequest, Role, Usage};

/// Per-attempt state created by a successful create-conversation call.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationContext {
    pub token_id: TokenId,
    pub conversation_id: String,
    pub referer: String,
    pub created_at: DateTime<Utc>,
}

/// A fully buffered upstream reply.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamCompletion {
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

/// One incremental piece of a streamed upstream reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpstreamDelta {
    pub role: Option<Role>,
    pub content: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

/// Lazy, finite and non-restartable. An `Err` item ends the stream.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<UpstreamDelta, UpstreamFailure>> + Send>>;

pub enum ChatReply {
    Complete(UpstreamCompletion),
    Stream(DeltaStream),
}

impl std::fmt::Debug for ChatReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatReply::Complete(c) => f.debug_tuple("Complete").field(c).finish(),
            ChatReply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// The two-call upstream protocol.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn create_conversation(
        &self,
        credential: &Credential,
    ) -> Result<ConversationContext, UpstreamFailure>;

    async fn send_chat(
        &self,
        credential: &Credential,
        conversation: &ConversationContext,
        request: &ChatCompletionRequest,
    ) -> Result<ChatReply, UpstreamFailure>;
}
