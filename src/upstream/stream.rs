//! Decoding of the upstream's incremental chat output.
//!
//! The upstream emits one event per line, either as standard SSE
//! (`data: {json}`) or tab-framed (`message\t{json}\t`). `[DONE]` in either
//! framing ends the reply.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::time::Instant;

use super::traits::{DeltaStream, UpstreamDelta};
use super::UpstreamFailure;
use crate::types::openai::{Role, Usage};

/// Longest line accepted from the upstream before the reply is rejected.
pub const MAX_LINE_BYTES: usize = 1 << 20;

#[derive(Debug, PartialEq)]
enum StreamLine {
    Data(Value),
    Done,
}

fn parse_line(line: &str) -> Option<StreamLine> {
    let line = line.trim_end_matches(['\r', '\n']);

    let payload = if let Some(rest) = line.strip_prefix("message\t") {
        rest.trim_end_matches('\t')
    } else if let Some(rest) = line.strip_prefix("data:") {
        rest.trim_start()
    } else {
        return None;
    };

    if payload.trim() == "[DONE]" {
        return Some(StreamLine::Done);
    }

    match serde_json::from_str(payload) {
        Ok(value) => Some(StreamLine::Data(value)),
        Err(e) => {
            tracing::warn!(error = %e, "Skipping undecodable upstream stream line");
            None
        }
    }
}

pub(super) fn parse_usage(value: &Value) -> Option<Usage> {
    let usage = value.get("usage")?;
    let field = |name: &str| {
        usage
            .get(name)
            .and_then(Value::as_u64)
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .unwrap_or(0)
    };
    Some(Usage::new(
        field("prompt_tokens"),
        field("completion_tokens"),
    ))
}

fn delta_from_value(value: &Value) -> Option<UpstreamDelta> {
    let usage = parse_usage(value);
    let choice = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first());

    let Some(choice) = choice else {
        // Usage-only trailer
        return usage.map(|usage| UpstreamDelta {
            usage: Some(usage),
            ..Default::default()
        });
    };

    let delta = choice.get("delta");
    let text = |v: Option<&Value>, key: &str| {
        v.and_then(|v| v.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    Some(UpstreamDelta {
        role: delta
            .and_then(|d| d.get("role"))
            .and_then(|r| serde_json::from_value::<Role>(r.clone()).ok()),
        content: text(delta, "content"),
        finish_reason: text(Some(choice), "finish_reason"),
        usage,
    })
}

/// Turn the raw upstream body into a stream of deltas. Transport errors are
/// yielded once and end the stream; a clean end of body without `[DONE]`
/// ends it normally.
pub fn decode_stream<S>(body: S) -> DeltaStream
where
    S: Stream<Item = Result<Bytes, UpstreamFailure>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut buffer = BytesMut::new();
        futures::pin_mut!(body);

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    buffer.extend_from_slice(&bytes);
                    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                        let line = buffer.split_to(pos + 1);
                        match parse_line(&String::from_utf8_lossy(&line)) {
                            Some(StreamLine::Done) => return,
                            Some(StreamLine::Data(value)) => {
                                if let Some(delta) = delta_from_value(&value) {
                                    yield Ok(delta);
                                }
                            }
                            None => {}
                        }
                    }
                    if buffer.len() > MAX_LINE_BYTES {
                        yield Err(UpstreamFailure::Malformed(format!(
                            "stream line exceeds {} bytes",
                            MAX_LINE_BYTES
                        )));
                        return;
                    }
                }
                Err(failure) => {
                    yield Err(failure);
                    return;
                }
            }
        }

        if !buffer.is_empty() {
            if let Some(StreamLine::Data(value)) = parse_line(&String::from_utf8_lossy(&buffer)) {
                if let Some(delta) = delta_from_value(&value) {
                    yield Ok(delta);
                }
            }
        }
    })
}

/// Bound the wait for each delta: the first must arrive by `first_deadline`,
/// later ones within `idle` of the previous. An elapsed wait yields
/// `Timeout` and ends the stream.
pub fn with_deadlines(inner: DeltaStream, first_deadline: Instant, idle: Duration) -> DeltaStream {
    Box::pin(async_stream::stream! {
        let mut inner = inner;
        let mut deadline = first_deadline;

        loop {
            match tokio::time::timeout_at(deadline, inner.next()).await {
                Ok(Some(item)) => {
                    let failed = item.is_err();
                    yield item;
                    if failed {
                        return;
                    }
                    deadline = Instant::now() + idle;
                }
                Ok(None) => return,
                Err(_) => {
                    tracing::warn!(idle_secs = idle.as_secs(), "Upstream stream stalled");
                    yield Err(UpstreamFailure::Timeout);
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use serde_json::json;

    fn body(parts: Vec<Result<&'static str, UpstreamFailure>>) -> DeltaStream {
        decode_stream(stream::iter(
            parts
                .into_iter()
                .map(|p| p.map(|s| Bytes::from_static(s.as_bytes())))
                .collect::<Vec<_>>(),
        ))
    }

    async fn contents(stream: DeltaStream) -> Vec<Result<Option<String>, UpstreamFailure>> {
        stream.map(|item| item.map(|d| d.content)).collect().await
    }

    #[test]
    fn test_parse_line_framings() {
        assert_eq!(
            parse_line("data: {\"a\":1}\n"),
            Some(StreamLine::Data(json!({"a": 1})))
        );
        assert_eq!(
            parse_line("message\t{\"a\":2}\t"),
            Some(StreamLine::Data(json!({"a": 2})))
        );
        assert_eq!(parse_line("data: [DONE]"), Some(StreamLine::Done));
        assert_eq!(parse_line("message\t[DONE]\t"), Some(StreamLine::Done));
        assert_eq!(parse_line("event: message"), None);
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("data: {not json"), None);
    }

    #[test]
    fn test_delta_from_value() {
        let delta = delta_from_value(&json!({
            "choices": [{"delta": {"role": "assistant", "content": "Hi"}, "finish_reason": null}]
        }))
        .unwrap();
        assert_eq!(delta.role, Some(Role::Assistant));
        assert_eq!(delta.content.as_deref(), Some("Hi"));
        assert_eq!(delta.finish_reason, None);

        let trailer = delta_from_value(&json!({
            "usage": {"prompt_tokens": 3, "completion_tokens": 4}
        }))
        .unwrap();
        assert_eq!(trailer.usage, Some(Usage::new(3, 4)));

        assert!(delta_from_value(&json!({"ping": true})).is_none());
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks() {
        let stream = body(vec![
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"Hel"),
            Ok("lo\"}}]}\n\nmessage\t{\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\t\n"),
            Ok("data: [DONE]\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n"),
        ]);

        assert_eq!(
            contents(stream).await,
            vec![Ok(Some("Hello".to_string())), Ok(Some(" world".to_string()))]
        );
    }

    #[tokio::test]
    async fn test_trailing_line_without_newline() {
        let stream = body(vec![Ok("data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}")]);
        assert_eq!(contents(stream).await, vec![Ok(Some("x".to_string()))]);
    }

    #[test]
    fn test_usage_values_saturate() {
        let usage = parse_usage(&json!({
            "usage": {"prompt_tokens": 4294967295u64, "completion_tokens": 5}
        }))
        .unwrap();
        assert_eq!(usage.prompt_tokens, u32::MAX);
        assert_eq!(usage.completion_tokens, 5);
        assert_eq!(usage.total_tokens, u32::MAX);

        let usage = parse_usage(&json!({"usage": {"prompt_tokens": 1u64 << 40}})).unwrap();
        assert_eq!(usage.prompt_tokens, u32::MAX);
    }

    #[tokio::test]
    async fn test_unterminated_line_is_rejected() {
        let long = Bytes::from(vec![b'a'; MAX_LINE_BYTES + 1]);
        let parts: Vec<Result<Bytes, UpstreamFailure>> = vec![Ok(long), Ok(Bytes::from_static(b"\n"))];
        let stream = decode_stream(stream::iter(parts));
        let items: Vec<_> = stream.collect().await;

        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(UpstreamFailure::Malformed(_))));
    }

    fn delta(text: &str) -> Result<UpstreamDelta, UpstreamFailure> {
        Ok(UpstreamDelta {
            content: Some(text.to_string()),
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_delta_deadline() {
        let stalled: DeltaStream = Box::pin(stream::pending());
        let deadline = Instant::now() + Duration::from_secs(5);
        let items: Vec<_> = with_deadlines(stalled, deadline, Duration::from_secs(5))
            .collect()
            .await;

        assert_eq!(items, vec![Err(UpstreamFailure::Timeout)]);
        assert!(Instant::now() >= deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_deadline_after_first_delta() {
        let stalls_after_one: DeltaStream =
            Box::pin(stream::iter(vec![delta("a")]).chain(stream::pending()));
        let items: Vec<_> = with_deadlines(
            stalls_after_one,
            Instant::now() + Duration::from_secs(5),
            Duration::from_secs(2),
        )
        .collect()
        .await;

        assert_eq!(items, vec![delta("a"), Err(UpstreamFailure::Timeout)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadlines_pass_through_a_timely_stream() {
        let items: Vec<_> = with_deadlines(
            Box::pin(stream::iter(vec![delta("a"), delta("b")])),
            Instant::now() + Duration::from_secs(5),
            Duration::from_secs(2),
        )
        .collect()
        .await;

        assert_eq!(items, vec![delta("a"), delta("b")]);
    }

    #[tokio::test]
    async fn test_transport_error_ends_stream() {
        let stream = body(vec![
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n"),
            Err(UpstreamFailure::Network("connection reset".to_string())),
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n"),
        ]);

        assert_eq!(
            contents(stream).await,
            vec![
                Ok(Some("a".to_string())),
                Err(UpstreamFailure::Network("connection reset".to_string())),
            ]
        );
    }
}
