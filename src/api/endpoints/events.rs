//! Run event stream (SSE).
//!
//! `GET /runs/:run_id/events?token=` replays stored events, then follows
//! live ones until the run's terminal event. Browsers cannot set headers on
//! an `EventSource`, so with a data secret configured the stream accepts a
//! one-time token bound to the run instead of the API key. Without a
//! secret, only direct loopback callers are admitted.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{self, Stream};
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::middleware::auth::is_direct_loopback;
use crate::api::types::ApiContext;
use crate::db;
use crate::models::StoredEvent;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Default, Deserialize)]
pub struct StreamParams {
    pub token: Option<String>,
}

fn authorize(
    ctx: &ApiContext,
    run_id: &str,
    token: Option<&str>,
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
) -> Result<(), ApiError> {
    let security = &ctx.core.config().security;
    if security.api_key.is_some() {
        let token = token.filter(|t| !t.is_empty()).ok_or(ApiError::Unauthorized)?;
        let issued_to = ctx
            .stream_tokens
            .lock()
            .map_err(|_| ApiError::Internal("stream token lock".into()))?
            .consume(token, run_id)
            .ok_or(ApiError::Unauthorized)?;
        tracing::debug!(run_id = %run_id, caller = %issued_to, "Stream token accepted");
        return Ok(());
    }
    if !security.require_api_key && is_direct_loopback(peer, headers) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

fn frame_header(event: &StoredEvent) -> Event {
    Event::default()
        .id(event.id.to_string())
        .event(event.event.event_type.as_str())
}

fn frame(event: &StoredEvent) -> Event {
    match frame_header(event).json_data(event) {
        Ok(framed) => framed,
        Err(e) => {
            tracing::error!(run_id = %event.run_id, event_id = event.id, error = %e, "Failed to encode event");
            frame_header(event).data("{}")
        }
    }
}

/// `GET /runs/:run_id/events`
pub async fn stream(
    State(ctx): State<ApiContext>,
    Path(run_id): Path<String>,
    Query(params): Query<StreamParams>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let peer = peer.map(|ConnectInfo(addr)| addr);
    if let Err(err) = authorize(&ctx, &run_id, params.token.as_deref(), &headers, peer) {
        tracing::warn!(run_id = %run_id, "Rejected event stream request");
        return Err(err);
    }

    {
        let conn = ctx.core.open_db()?;
        if db::get_run(&conn, &run_id)?.is_none() {
            return Err(ApiError::NotFound("Unknown run_id".into()));
        }
    }

    let subscription = ctx.core.trace().subscribe(&run_id)?;
    tracing::debug!(run_id = %run_id, "Event stream opened");

    let events = stream::unfold(subscription, |mut sub| async move {
        let event = sub.next().await?;
        Some((Ok::<_, Infallible>(frame(&event)), sub))
    });

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keepalive"),
    ))
}
