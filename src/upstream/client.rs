use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use http::HeaderMap;
use reqwest::{Client, ClientBuilder};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::stream::{decode_stream, parse_usage, with_deadlines};
use super::traits::{ChatReply, ConversationContext, Upstream, UpstreamCompletion};
use super::{HeaderTemplate, UpstreamFailure};
use crate::config::UpstreamConfig;
use crate::logging::RequestLogger;
use crate::pool::Credential;
use crate::types::openai::ChatCompletionRequest;
use crate::types::{ProxyError, Result};

const CONVERSATION_ID_KEYS: [&str; 3] = ["conversationId", "id", "conversation_id"];

/// reqwest-backed implementation of the two-call upstream protocol.
pub struct UpstreamClient {
    client: Client,
    config: Arc<UpstreamConfig>,
    headers: HeaderTemplate,
    logger: RequestLogger,
}

impl UpstreamClient {
    pub fn new(config: Arc<UpstreamConfig>, logger: RequestLogger) -> Result<Self> {
        let mut builder = ClientBuilder::new()
            .connect_timeout(Duration::from_secs(10).min(config.timeout_duration()))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));

        if !config.ssl_verify {
            tracing::warn!(
                endpoint = %config.chat_url,
                "SSL verification is disabled for the upstream"
            );
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| ProxyError::Config(format!("Failed to create HTTP client: {}", e)))?;

        let headers = HeaderTemplate::new(&config)?;

        Ok(Self {
            client,
            config,
            headers,
            logger,
        })
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.timeout_duration()
    }

    /// POST `body` and return the response if its status is 2xx.
    async fn post(
        &self,
        call: &'static str,
        url: &str,
        credential: &Credential,
        headers: HeaderMap,
        body: &Value,
        deadline: Instant,
    ) -> std::result::Result<reqwest::Response, UpstreamFailure> {
        self.logger.log_upstream_request(
            call,
            url,
            &credential.masked(),
            &headers,
            Some(&body.to_string()),
        );

        let started = Instant::now();
        let send = self
            .client
            .post(url)
            .headers(headers)
            .bearer_auth(&credential.secret)
            .json(body)
            .send();

        let response = match tokio::time::timeout_at(deadline, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                let failure = UpstreamFailure::from(e);
                self.logger.log_upstream_response(
                    call,
                    None,
                    started.elapsed(),
                    None,
                    Some(&failure.to_string()),
                );
                return Err(failure);
            }
            Err(_) => {
                self.logger.log_upstream_response(
                    call,
                    None,
                    started.elapsed(),
                    None,
                    Some("timed out"),
                );
                return Err(UpstreamFailure::Timeout);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = match tokio::time::timeout_at(deadline, response.text()).await {
                Ok(Ok(text)) => text,
                _ => String::new(),
            };
            self.logger.log_upstream_response(
                call,
                Some(status.as_u16()),
                started.elapsed(),
                Some(&text),
                None,
            );
            return Err(UpstreamFailure::Http {
                status: status.as_u16(),
            });
        }

        self.logger.log_upstream_response(
            call,
            Some(status.as_u16()),
            started.elapsed(),
            None,
            None,
        );
        Ok(response)
    }
}

async fn read_json(
    response: reqwest::Response,
    deadline: Instant,
) -> std::result::Result<Value, UpstreamFailure> {
    let body: Bytes = tokio::time::timeout_at(deadline, response.bytes())
        .await
        .map_err(|_| UpstreamFailure::Timeout)??;

    serde_json::from_slice(&body)
        .map_err(|e| UpstreamFailure::Malformed(format!("response is not JSON: {}", e)))
}

fn conversation_id(value: &Value) -> Option<String> {
    CONVERSATION_ID_KEYS.iter().find_map(|key| match value.get(*key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn chat_payload(conversation: &ConversationContext, request: &ChatCompletionRequest) -> Value {
    let mut payload = json!({
        "conversationId": conversation.conversation_id,
        "model": request.model,
        "messages": request.messages,
        "stream": request.stream,
    });

    if let Some(obj) = payload.as_object_mut() {
        if let Some(t) = request.temperature {
            obj.insert("temperature".to_string(), json!(t));
        }
        if let Some(n) = request.max_tokens {
            obj.insert("max_tokens".to_string(), json!(n));
        }
        if let Some(p) = request.top_p {
            obj.insert("top_p".to_string(), json!(p));
        }
        if let Some(p) = request.frequency_penalty {
            obj.insert("frequency_penalty".to_string(), json!(p));
        }
        if let Some(p) = request.presence_penalty {
            obj.insert("presence_penalty".to_string(), json!(p));
        }
        if let Some(stop) = &request.stop {
            obj.insert("stop".to_string(), json!(stop));
        }
    }

    payload
}

/// Pull the assistant text out of the shapes the upstream is known to use.
fn parse_completion(value: &Value) -> Option<UpstreamCompletion> {
    let choice = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first());

    let content = choice
        .and_then(|c| {
            c.pointer("/message/content")
                .or_else(|| c.get("text"))
                .and_then(Value::as_str)
        })
        .or_else(|| {
            ["response", "content", "message"]
                .iter()
                .find_map(|key| value.get(*key).and_then(Value::as_str))
        })?;

    Some(UpstreamCompletion {
        content: content.to_string(),
        finish_reason: choice
            .and_then(|c| c.get("finish_reason"))
            .and_then(Value::as_str)
            .map(str::to_string),
        usage: parse_usage(value),
    })
}

#[async_trait]
impl Upstream for UpstreamClient {
    async fn create_conversation(
        &self,
        credential: &Credential,
    ) -> std::result::Result<ConversationContext, UpstreamFailure> {
        let deadline = self.deadline();
        let response = self
            .post(
                "create_conversation",
                &self.config.conversation_url,
                credential,
                self.headers.defaults().clone(),
                &json!({}),
                deadline,
            )
            .await?;

        let value = read_json(response, deadline).await?;
        let conversation_id = conversation_id(&value).ok_or_else(|| {
            UpstreamFailure::Malformed("no conversation id in response".to_string())
        })?;

        tracing::debug!(
            token_id = credential.id,
            conversation_id = %conversation_id,
            "Created upstream conversation"
        );

        Ok(ConversationContext {
            token_id: credential.id,
            referer: self.headers.referer(&conversation_id),
            conversation_id,
            created_at: Utc::now(),
        })
    }

    async fn send_chat(
        &self,
        credential: &Credential,
        conversation: &ConversationContext,
        request: &ChatCompletionRequest,
    ) -> std::result::Result<ChatReply, UpstreamFailure> {
        let headers = self.headers.build_headers(&conversation.conversation_id)?;
        let payload = chat_payload(conversation, request);
        let deadline = self.deadline();

        let response = self
            .post(
                "send_chat",
                &self.config.chat_url,
                credential,
                headers,
                &payload,
                deadline,
            )
            .await?;

        if request.stream {
            let body = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(UpstreamFailure::from));
            return Ok(ChatReply::Stream(with_deadlines(
                decode_stream(body),
                deadline,
                self.config.timeout_duration(),
            )));
        }

        let value = read_json(response, deadline).await?;
        parse_completion(&value)
            .map(ChatReply::Complete)
            .ok_or_else(|| UpstreamFailure::Malformed("no assistant content in response".to_string()))
    }
}
