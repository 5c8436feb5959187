//! Server-Sent Events stream of job lifecycle events.
//!
//! Replays the recent-event ring for late joiners, then forwards live events
//! from the [`mf_core::events::EventBus`] with periodic heartbeats.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;

use mf_core::JobId;

use crate::context::AppContext;
use crate::error::AppError;
use crate::routes::jobs::parse_job_id;

/// Events replayed to a new subscriber.
const REPLAY_EVENTS: usize = 50;

const HEARTBEAT: Duration = Duration::from_secs(15);

/// Optional filter for the event stream.
#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct EventsQuery {
    /// Only events about this job.
    pub job_id: Option<String>,
}

/// GET /api/events
#[utoipa::path(
    get,
    path = "/api/events",
    params(EventsQuery),
    responses(
        (status = 200, description = "SSE stream of job events", content_type = "text/event-stream"),
        (status = 400, description = "Invalid job ID")
    )
)]
pub async fn events_handler(
    State(ctx): State<AppContext>,
    Query(params): Query<EventsQuery>,
) -> Result<Sse<impl futures_core::Stream<Item = Result<Event, Infallible>>>, AppError> {
    let job_filter = params.job_id.as_deref().map(parse_job_id).transpose()?;

    // Subscribe before reading the ring so nothing falls in between.
    let mut rx = ctx.event_bus.subscribe();
    let recent = ctx.event_bus.recent_events(REPLAY_EVENTS);

    let stream = async_stream::stream! {
        for event in recent.into_iter().rev() {
            if matches_job(&event, job_filter) {
                if let Ok(data) = serde_json::to_string(&event) {
                    yield Ok(Event::default().data(data));
                }
            }
        }

        let mut heartbeat = tokio::time::interval(HEARTBEAT);
        loop {
            tokio::select! {
                result = rx.recv() => match result {
                    Ok(event) => {
                        if matches_job(&event, job_filter) {
                            if let Ok(data) = serde_json::to_string(&event) {
                                yield Ok(Event::default().data(data));
                            }
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::debug!("SSE client lagged by {n} events");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = heartbeat.tick() => {
                    yield Ok(Event::default()
                        .event("heartbeat")
                        .data(r#"{"type":"heartbeat"}"#));
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(HEARTBEAT).text("ping")))
}

fn matches_job(event: &mf_core::events::Event, filter: Option<JobId>) -> bool {
    filter.map_or(true, |id| event.payload.job_id() == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mf_core::events::{Event as BusEvent, EventPayload};

    #[test]
    fn job_filter_matches_only_that_job() {
        let mine = JobId::new();
        let event = BusEvent::new(EventPayload::JobStarted { job_id: mine });
        assert!(matches_job(&event, None));
        assert!(matches_job(&event, Some(mine)));
        assert!(!matches_job(&event, Some(JobId::new())));
    }
}
