// Chunked plain-text streaming of assistant deltas

use axum::{
    body::{Body, Bytes},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use futures::StreamExt;

use crate::providers::TokenStream;

/// One body chunk per text delta.
///
/// An error ends the body early; the client sees a truncated stream.
pub fn text_stream(tokens: TokenStream) -> Response {
    let body = tokens.map(|delta| {
        if let Err(e) = &delta {
            tracing::error!("Stream aborted: {}", e);
        }
        delta.map(Bytes::from)
    });

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}
