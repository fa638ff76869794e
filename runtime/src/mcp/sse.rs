//! Server-sent events carrying MCP traffic
//!
//! Framing is decoded by `eventsource-stream`; this module only sorts the
//! decoded events into what the HTTP transports care about.

use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt};
use serde_json::Value;

/// An event the HTTP transports act on
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    /// Legacy SSE transport: the URL requests are POSTed to
    Endpoint(String),
    /// A JSON-RPC message from a default or `message` event
    Message(Value),
}

/// Decode a byte stream into frames, dropping events nobody handles
pub fn frames<S, B, E>(stream: S) -> impl Stream<Item = Result<SseFrame, EventStreamError<E>>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    stream
        .eventsource()
        .filter_map(|event| async move { event.map(classify).transpose() })
}

fn classify(event: Event) -> Option<SseFrame> {
    match event.event.as_str() {
        "endpoint" => Some(SseFrame::Endpoint(event.data.trim().to_string())),
        "" | "message" => match serde_json::from_str(&event.data) {
            Ok(message) => Some(SseFrame::Message(message)),
            Err(e) => {
                tracing::debug!("ignoring malformed SSE message: {}", e);
                None
            }
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    async fn decode(chunks: &[&'static str]) -> Vec<SseFrame> {
        let chunks: Vec<Result<&'static str, std::convert::Infallible>> =
            chunks.iter().map(|c| Ok(*c)).collect();
        frames(stream::iter(chunks))
            .map(|frame| frame.expect("decoded"))
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_endpoint_split_across_chunks() {
        let frames = decode(&["event: endpoint\nda", "ta: /messages?sessionId=abc\r\n\r\n"]).await;
        assert_eq!(
            frames,
            vec![SseFrame::Endpoint("/messages?sessionId=abc".to_string())]
        );
    }

    #[tokio::test]
    async fn test_multiline_data_and_comments() {
        let frames = decode(&[": keep-alive\ndata: {\"a\":\ndata: 1}\n\n"]).await;
        assert_eq!(frames, vec![SseFrame::Message(serde_json::json!({"a": 1}))]);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_events_are_dropped() {
        let frames = decode(&[
            "event: ping\ndata: {}\n\n",
            "data: not json\n\n",
            "event: message\ndata: {\"id\":7}\n\n",
        ])
        .await;
        assert_eq!(frames, vec![SseFrame::Message(serde_json::json!({"id": 7}))]);
    }
}
