// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Streaming endpoints: the `/ws` realtime bus and the scanner's SSE
//! stream. The heavy lifting lives in [`crate::realtime`] and
//! [`crate::scan`]; these handlers only adapt them to HTTP.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Response;
use futures::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use super::error::ApiResult;
use super::models::{parse_probe_types, parse_uuid_csv, NetworkScanStreamQuery};
use super::AppState;
use crate::scan::{ScanEvent, ScanRequest};

/// SSE heartbeat period; detects dead clients between scan events.
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Upgrade handler for the realtime bus.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| async move { state.hub.run_socket(socket).await })
}

/// `event: <name>` / `data: <json>` rendering of one scan event.
fn sse_event(event: &ScanEvent) -> Event {
    Event::default().event(event.name()).data(event.data().to_string())
}

/// Streaming network scan.
pub async fn network_scan_stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NetworkScanStreamQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let credential_profile_ids = parse_uuid_csv(&query.credential_profile_ids)?;
    let probe_types = parse_probe_types(&query.probe_types)?;

    let rx = state
        .scanner
        .start(ScanRequest {
            ip_range: query.ip_range,
            credential_profile_ids,
            probe_types,
        })
        .await?;

    let stream = ReceiverStream::new(rx).map(|event| Ok(sse_event(&event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE).text("keep-alive")))
}
