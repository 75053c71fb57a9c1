use axum::{
    extract::State,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use tracing::{debug, warn};

use crate::executor::Executor;

/// Server-sent events, one per container transition. The SSE event name is
/// the event type and the data is the JSON-encoded event.
pub async fn subscribe_to_events(
    State(executor): State<Executor>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    debug!("New event subscriber");
    let stream = executor.subscribe_to_events().filter_map(|event| async move {
        match SseEvent::default().event(event.event_type()).json_data(&event) {
            Ok(sse) => Some(Ok(sse)),
            Err(e) => {
                warn!("Failed to encode event: {}", e);
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
