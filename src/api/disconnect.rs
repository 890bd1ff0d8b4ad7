use crate::core::metrics::get_metrics;
use crate::core::StreamCancelHandle;
use axum::body::Bytes;
use futures::stream::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Response body wrapper that fires a cancellation handle when dropped.
///
/// Hyper drops the body as soon as the caller goes away, which is the only
/// reliable disconnect signal an SSE response gets.
pub struct DisconnectStream<S> {
    pub stream: S,
    pub cancel_handle: StreamCancelHandle,
    pub endpoint: &'static str,
}

impl<S> DisconnectStream<S> {
    pub fn new(stream: S, cancel_handle: StreamCancelHandle, endpoint: &'static str) -> Self {
        Self {
            stream,
            cancel_handle,
            endpoint,
        }
    }
}

impl<S, E> Stream for DisconnectStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}

impl<S> Drop for DisconnectStream<S> {
    fn drop(&mut self) {
        // A pump that finished normally marked the handle completed first.
        if !self.cancel_handle.is_completed() {
            tracing::info!(endpoint = self.endpoint, "Client disconnected mid-stream");
            get_metrics()
                .client_disconnects
                .with_label_values(&[self.endpoint])
                .inc();
        }
        self.cancel_handle.cancel();
    }
}
