use std::convert::Infallible;

use axum::{
    extract::{Query, State},
    http::{header, HeaderName},
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
};
use futures::stream::{self, Stream};
use serde::Deserialize;
use tokio::sync::mpsc;

use types::ids::ConnectionId;

use crate::broadcaster::Frame;
use crate::error::AppError;
use crate::hub::HubHandle;
use crate::state::AppState;

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub symbol: Option<String>,
}

/// Unsubscribes when the response body is dropped.
struct ConnectionGuard {
    id: ConnectionId,
    hub: HubHandle,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

impl Frame {
    fn into_event(self) -> Event {
        match self {
            Frame::Data(data) => Event::default().data(data),
            Frame::Comment(text) => Event::default().comment(text),
        }
    }
}

fn frame_stream(
    frames: mpsc::Receiver<Frame>,
    guard: ConnectionGuard,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold((frames, guard), |(mut frames, guard)| async move {
        let frame = frames.recv().await?;
        Some((Ok(frame.into_event()), (frames, guard)))
    })
}

pub async fn stream_ticks(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Result<impl IntoResponse, AppError> {
    let filter = query
        .symbol
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let sub = state.hub.subscribe(filter).await?;
    let guard = ConnectionGuard {
        id: sub.id,
        hub: state.hub.clone(),
    };

    let headers = [
        (header::CACHE_CONTROL, "no-cache, no-transform"),
        (X_ACCEL_BUFFERING, "no"),
    ];
    Ok((headers, Sse::new(frame_stream(sub.frames, guard))))
}
