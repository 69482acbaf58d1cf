use std::io;

use axum::{
    body::Body,
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{stream, StreamExt};
use tracing::{debug, instrument};

use super::AppState;
use crate::Error;

/// Streams the events of a drive as newline-delimited JSON.
///
/// The subscription is registered before the response is returned, so the
/// client observes every mutation committed after it received the headers.
/// A leading empty line makes sure the headers are flushed right away.
#[instrument(skip(state))]
pub async fn get(
    axum::extract::Path(drive): axum::extract::Path<String>,
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<Response, Error> {
    let subscription = state.drive(&drive)?.subscribe();
    debug!("subscriber connected");

    let lines = stream::once(async { Ok::<_, io::Error>(Bytes::from_static(b"\n")) }).chain(
        subscription.map(|event| -> io::Result<Bytes> {
            let mut line = serde_json::to_vec(&event)?;
            line.push(b'\n');
            Ok(Bytes::from(line))
        }),
    );

    Ok((
        [(CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response())
}
