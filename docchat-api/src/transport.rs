use async_trait::async_trait;
use futures::future::{self, Either};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::api::StreamRequest;
use crate::client::{ApiClient, BoxedStream, ByteStream};
use crate::error::{ApiError, ApiResult};
use crate::frame::{StreamEvent, decode_stream};

/// An open chat stream: raw body chunks plus the token that stops it.
pub struct TransportStream {
    pub chunks: ByteStream,
    pub cancel: CancellationToken,
}

impl TransportStream {
    pub fn new(chunks: ByteStream, cancel: CancellationToken) -> Self {
        Self { chunks, cancel }
    }

    /// Decode the body into events. Nothing is yielded once the token is
    /// cancelled, not even the implicit completion.
    pub fn into_events(self) -> BoxedStream<StreamEvent> {
        let cancelled = self.cancel.cancelled_owned();
        Box::pin(decode_stream(self.chunks).take_until(cancelled))
    }
}

/// Opens chat streams. Implementations never touch session state.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Start a stream for `request`. Cancelling `cancel` while waiting for
    /// response headers aborts with [`ApiError::Cancelled`].
    async fn send(&self, request: &StreamRequest, cancel: CancellationToken) -> ApiResult<TransportStream>;
}

/// `POST /chat/stream` over HTTP.
#[derive(Clone)]
pub struct HttpTransport {
    client: ApiClient,
}

impl HttpTransport {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send(&self, request: &StreamRequest, cancel: CancellationToken) -> ApiResult<TransportStream> {
        let open = self.client.chat_stream(request);
        let cancelled = cancel.clone().cancelled_owned();
        futures::pin_mut!(open);
        futures::pin_mut!(cancelled);

        match future::select(open, cancelled).await {
            Either::Left((result, _)) => Ok(TransportStream::new(result?, cancel)),
            Either::Right(_) => {
                tracing::debug!("Chat stream cancelled before response headers arrived");
                Err(ApiError::Cancelled)
            }
        }
    }
}
