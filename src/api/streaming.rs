//! SSE response plumbing shared by both inbound protocols.
//!
//! A spawned pump task drives the source stream and hands frames to the
//! response body over a bounded channel. The body is wrapped in a
//! [`DisconnectStream`], so a caller that goes away cancels the pump, which
//! drops the upstream response and closes its connection.

use crate::api::disconnect::DisconnectStream;
use crate::core::cancel::StreamCancelHandle;
use crate::core::error::Result;
use crate::core::logging::{get_request_id, ENDPOINT, REQUEST_ID};
use crate::services::UpstreamStream;
use crate::transformer::{sse_events, ChunkAccumulator, StreamDelta, StreamInput, StreamState};
use axum::body::{Body, Bytes};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use futures::stream::{Stream, StreamExt};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Frames buffered between the pump and the response body.
pub const SSE_CHANNEL_CAPACITY: usize = 32;

/// How a streamed response ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOutcome {
    /// Source ran to its end.
    pub completed: bool,
    /// Caller disconnected first.
    pub cancelled: bool,
    /// Source failed after forwarding began.
    pub error: Option<String>,
}

/// Build an SSE response forwarding `source`.
///
/// `on_finish` runs once on the pump task after the source is dropped.
pub fn sse_response<S, F>(source: S, endpoint: &'static str, on_finish: F) -> Response
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
    F: FnOnce(StreamOutcome) + Send + 'static,
{
    let cancel = StreamCancelHandle::new();
    let (tx, rx) = mpsc::channel::<std::result::Result<Bytes, std::io::Error>>(SSE_CHANNEL_CAPACITY);

    let pump_cancel = cancel.clone();
    let pump = async move {
        let mut source = Box::pin(source);
        let mut outcome = StreamOutcome::default();
        loop {
            tokio::select! {
                biased;
                _ = pump_cancel.cancelled() => {
                    outcome.cancelled = true;
                    break;
                }
                next = source.next() => match next {
                    Some(Ok(frame)) => {
                        if tx.send(Ok(frame)).await.is_err() {
                            outcome.cancelled = true;
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        tracing::error!(
                            request_id = %get_request_id(),
                            endpoint,
                            error = %err,
                            "Stream failed after forwarding began; closing"
                        );
                        outcome.error = Some(err.to_string());
                        break;
                    }
                    None => {
                        outcome.completed = true;
                        break;
                    }
                }
            }
        }
        if !outcome.cancelled {
            pump_cancel.mark_completed();
        } else {
            tracing::debug!(
                request_id = %get_request_id(),
                endpoint,
                "Dropping upstream stream after client disconnect"
            );
        }
        drop(source);
        on_finish(outcome);
    };
    tokio::spawn(REQUEST_ID.scope(
        get_request_id(),
        ENDPOINT.scope(endpoint.to_string(), pump),
    ));

    let frames = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|frame| (frame, rx))
    });
    let body = Body::from_stream(DisconnectStream::new(Box::pin(frames), cancel, endpoint));

    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        body,
    )
        .into_response()
}

/// Transcode an upstream chat/completions stream into Protocol-B events.
///
/// Every decoded chunk is also folded into `tap` for the request log.
pub fn transcode_stream(
    upstream: UpstreamStream,
    message_id: String,
    model: String,
    tap: Arc<Mutex<ChunkAccumulator>>,
) -> impl Stream<Item = Result<Bytes>> + Send {
    async_stream::try_stream! {
        let mut state = StreamState::new(message_id, model);
        let mut frames = Box::pin(sse_events(upstream.response.bytes_stream()));

        while let Some(frame) = frames.next().await {
            let frame = frame?;
            let data = match frame.data {
                Some(data) => data,
                None => continue,
            };
            let input = if data.trim() == "[DONE]" {
                StreamInput::Done
            } else {
                match serde_json::from_str::<Value>(&data) {
                    Ok(chunk) => {
                        let delta = StreamDelta::from_chunk(&chunk);
                        if let Ok(mut shared) = tap.lock() {
                            shared.add(&delta);
                        }
                        StreamInput::Chunk(delta)
                    }
                    Err(e) => {
                        tracing::warn!(
                            request_id = %get_request_id(),
                            error = %e,
                            "Skipping unparseable upstream chunk"
                        );
                        continue;
                    }
                }
            };

            for event in state.step(input) {
                yield Bytes::from(event.to_sse());
            }
            if state.is_finished() {
                break;
            }
        }

        // Upstream closed without a sentinel; close out whatever is open.
        for event in state.step(StreamInput::Done) {
            yield Bytes::from(event.to_sse());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::AppError;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_sse_response_forwards_and_reports_completion() {
        let (done_tx, done_rx) = oneshot::channel();
        let source = futures::stream::iter(vec![
            Ok(Bytes::from("data: a\n\n")),
            Ok(Bytes::from("data: b\n\n")),
        ]);
        let response = sse_response(source, "/v1/chat/completions", move |outcome| {
            let _ = done_tx.send(outcome);
        });
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"data: a\n\ndata: b\n\n");

        let outcome = done_rx.await.unwrap();
        assert!(outcome.completed);
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn test_sse_response_reports_source_error() {
        let (done_tx, done_rx) = oneshot::channel();
        let source = futures::stream::iter(vec![
            Ok(Bytes::from("data: a\n\n")),
            Err(AppError::UpstreamUnavailable("reset".into())),
        ]);
        let response = sse_response(source, "/v1/messages", move |outcome| {
            let _ = done_tx.send(outcome);
        });
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"data: a\n\n");

        let outcome = done_rx.await.unwrap();
        assert!(!outcome.completed);
        assert!(outcome.error.unwrap().contains("reset"));
    }

    #[tokio::test]
    async fn test_dropping_body_cancels_pump() {
        let (done_tx, done_rx) = oneshot::channel();
        let source = futures::stream::unfold(0u32, |n| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Some((Ok(Bytes::from(format!("data: {}\n\n", n))), n + 1))
        });
        let response = sse_response(source, "/v1/chat/completions", move |outcome| {
            let _ = done_tx.send(outcome);
        });
        drop(response);

        let outcome = tokio::time::timeout(Duration::from_secs(2), done_rx)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.cancelled);
        assert!(!outcome.completed);
    }
}
