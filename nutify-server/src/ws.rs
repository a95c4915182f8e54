//! WebSocket sessions feeding live-bus events to browser clients.

use std::sync::Arc;
use std::time::Duration;

use actix_ws::{CloseReason, Message};
use futures_util::StreamExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::interval;

use nutify_common::metric_name::MetricName;
use nutify_common::metrics::StatsdClientExt;

use crate::app_state::AppState;
use crate::bus::BusEvent;

const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Live-bus WebSocket handler task.
pub fn spawn_bus_ws(
    session: actix_ws::Session,
    msg_stream: actix_ws::MessageStream,
    state: Arc<AppState>,
) {
    actix_rt::spawn(async move {
        let mut session = session;
        let close_reason = bus_ws(&mut session, msg_stream, &state).await;
        trace!("bus ws closing: {:?}", close_reason);
        let _ = session.close(close_reason).await;
    });
}

/// The per-client loop: forwards bus events, answers pings, and observes
/// (but does not stall on) lag.
async fn bus_ws(
    session: &mut actix_ws::Session,
    mut msg_stream: actix_ws::MessageStream,
    state: &AppState,
) -> Option<CloseReason> {
    state
        .metrics
        .incr_with_tags(MetricName::BusClientConnected)
        .send();
    let mut rx = state.bus.subscribe();
    let mut ping = interval(WS_PING_INTERVAL);

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        if send_event(session, &event).await.is_err() {
                            break None;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // Slow subscriber: drop forward and keep going.
                        state.bus.note_dropped(skipped);
                        debug!("ws subscriber lagged, {} event(s) dropped", skipped);
                    }
                    Err(RecvError::Closed) => break None,
                }
            }

            maybe_msg = msg_stream.next() => {
                let Some(Ok(msg)) = maybe_msg else {
                    break None;
                };
                match msg {
                    Message::Ping(bytes) => {
                        if session.pong(&bytes).await.is_err() {
                            break None;
                        }
                    }
                    Message::Close(reason) => break reason,
                    // Browser clients only listen; anything else is noise.
                    _ => {}
                }
            }

            _ = ping.tick() => {
                if session.ping(b"").await.is_err() {
                    break None;
                }
            }
        }
    }
}

async fn send_event(
    session: &mut actix_ws::Session,
    event: &BusEvent,
) -> Result<(), actix_ws::Closed> {
    match serde_json::to_string(event) {
        Ok(text) => session.text(text).await,
        Err(e) => {
            warn!("cannot serialize bus event: {}", e);
            Ok(())
        }
    }
}
