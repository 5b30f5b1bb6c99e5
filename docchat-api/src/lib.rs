//! Client for the document-QA chat backend
//!
//! - [`ApiClient`]: typed access to every backend endpoint
//! - [`frame`]: incremental decoder for the chat stream body
//! - [`ChatTransport`]: cancellable chat stream primitive, with
//!   [`HttpTransport`] as the reqwest implementation

pub mod api;
mod client;
pub mod error;
pub mod frame;
pub mod transport;

pub use api::*;
pub use client::{ApiClient, BoxedStream, ByteStream, DEFAULT_BASE_URL};
pub use error::{ApiError, ApiResult};
pub use frame::{FrameDecoder, StreamEvent, decode_stream};
pub use transport::{ChatTransport, HttpTransport, TransportStream};
