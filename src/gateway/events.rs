use super::{AppState, internal_error, not_found};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use serde_json::Value;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const STREAM_BUFFER: usize = 64;

/// Terminal task events close the stream.
fn is_terminal_event(event_type: &str) -> bool {
    matches!(
        event_type,
        "task.completed" | "task.failed" | "task.timed_out" | "task.denied"
    )
}

/// `GET /api/tasks/{id}/events` — replay the journal, then stream live
/// events until the task reaches a terminal state. Frames are
/// `event: <name>\ndata: <JSON>`; a `: keepalive` comment flows every 15 s.
/// Dropping the response unregisters the listener.
pub async fn task_events_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<Value>)> {
    let Some(task) = state.repo.get_task(&task_id).map_err(internal_error)? else {
        return Err(not_found("task"));
    };

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(STREAM_BUFFER);
    let repo = state.repo.clone();
    let hub = state.repo.hub();

    tokio::spawn(async move {
        // Subscribe before replaying so nothing slips between the two.
        let mut live = hub.subscribe(&task_id);

        let replayed = match repo.list_events(&task_id, 0) {
            Ok(events) => events,
            Err(e) => {
                debug!("event replay for {} failed: {:#}", task_id, e);
                return;
            }
        };
        let mut last_seq = 0;
        let mut terminal_seen = task.status.is_terminal();
        for event in replayed {
            last_seq = event.seq;
            if is_terminal_event(&event.event_type) {
                terminal_seen = true;
            }
            let frame = Event::default()
                .event(event.event_type.clone())
                .data(event.payload.to_string());
            if tx.send(Ok(frame)).await.is_err() {
                return;
            }
        }
        if terminal_seen {
            return;
        }

        loop {
            match live.recv().await {
                Ok(event) => {
                    // Events journaled during the replay window arrive on
                    // both paths; sequence numbers dedupe them.
                    if event.seq <= last_seq {
                        continue;
                    }
                    last_seq = event.seq;
                    let terminal = is_terminal_event(&event.event_type);
                    let frame = Event::default()
                        .event(event.event_type.clone())
                        .data(event.payload.to_string());
                    if tx.send(Ok(frame)).await.is_err() || terminal {
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    // This listener fell behind; re-read what it missed.
                    debug!("SSE listener for {} lagged by {}", task_id, n);
                    let Ok(missed) = repo.list_events(&task_id, last_seq) else {
                        return;
                    };
                    for event in missed {
                        last_seq = event.seq;
                        let terminal = is_terminal_event(&event.event_type);
                        let frame = Event::default()
                            .event(event.event_type.clone())
                            .data(event.payload.to_string());
                        if tx.send(Ok(frame)).await.is_err() || terminal {
                            return;
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    ))
}
