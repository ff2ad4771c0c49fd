//! WebSocket protocol engine: framed commands, per-connection state, and
//! hybrid routing of published events.
//!
//! Each connection gets a reader loop (this task) and a writer task
//! draining its bounded outbound queue, so a slow socket never stalls a
//! publisher. Inbound frames are processed strictly in order: a PUBLISH
//! is fully classified, stored, and acknowledged before the next frame
//! is examined.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;

use crate::event::{now_ts, Event, REFERENCE_KIND};
use crate::privacy::{classify, PrivacyLevel};
use crate::query::{self, Filter};
use crate::reference;
use crate::satellite;
use crate::server::RelayState;
use crate::subs::{ConnQueue, Frame, LiveSub};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Drive one client connection until the transport closes.
pub async fn process(socket: WebSocket, state: Arc<RelayState>) {
    let conn = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let queue = ConnQueue::new(state.cfg.max_outbound_queue);
    let (mut sink, mut stream) = socket.split();

    let writer_queue = queue.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = writer_queue.pop().await {
            if sink.send(Message::Text(frame.to_json())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(Ok(msg)) = stream.next().await {
        if queue.is_closing() {
            break;
        }
        let Message::Text(txt) = msg else { continue };
        let Ok(val) = serde_json::from_str::<Value>(&txt) else {
            queue.push(Frame::Notice {
                message: "could not parse message".into(),
            });
            continue;
        };
        let Some(arr) = val.as_array() else {
            queue.push(Frame::Notice {
                message: "message must be a JSON array".into(),
            });
            continue;
        };
        match arr.first().and_then(|v| v.as_str()) {
            Some("EVENT") if arr.len() >= 2 => {
                handle_publish(&state, &queue, &arr[1]);
            }
            Some("REQ") if arr.len() >= 2 => {
                let label = arr[1].as_str().unwrap_or_default().to_string();
                handle_req(&state, conn, &queue, label, &arr[2..]);
            }
            Some("CLOSE") if arr.len() >= 2 => {
                // unknown labels are silently ignored
                if let Some(label) = arr[1].as_str() {
                    state.subs.remove(conn, label);
                }
            }
            Some(other) => {
                queue.push(Frame::Notice {
                    message: format!("unknown command: {other}"),
                });
            }
            None => {
                queue.push(Frame::Notice {
                    message: "message must start with a command string".into(),
                });
            }
        }
    }

    state.subs.remove_conn(conn);
    queue.close();
    let _ = writer.await;
}

/// PUBLISH pipeline: validate, classify, then store locally or route to a
/// satellite with a local reference event. Exactly one OK frame per
/// PUBLISH.
fn handle_publish(state: &Arc<RelayState>, queue: &ConnQueue, raw: &Value) {
    let supplied_id = raw
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let ev: Event = match serde_json::from_value(raw.clone()) {
        Ok(ev) => ev,
        Err(_) => {
            queue.push(Frame::Ok {
                id: supplied_id,
                accepted: false,
                message: "invalid: malformed event".into(),
            });
            return;
        }
    };
    let now = now_ts();
    if let Err(e) = state.validator.validate(&ev, now) {
        queue.push(Frame::Ok {
            id: ev.id,
            accepted: false,
            message: e.to_string(),
        });
        return;
    }
    match classify(&ev) {
        PrivacyLevel::Public | PrivacyLevel::Limited => {
            accept_local(state, queue, ev, String::new());
        }
        PrivacyLevel::Private => match state.satellites.route(&ev, now) {
            Some(node) => offload(state, queue, ev, node, now),
            None => {
                // fallback-local: the main relay keeps the event
                accept_local(
                    state,
                    queue,
                    ev,
                    "no satellite available; stored locally".into(),
                );
            }
        },
    }
}

/// Store an event on the main relay, fan it out if newly inserted, and
/// acknowledge.
fn accept_local(state: &Arc<RelayState>, queue: &ConnQueue, ev: Event, message: String) {
    let _order = state.accept_lock.lock();
    match state.store.put(&ev) {
        Ok(inserted) => {
            queue.push(Frame::Ok {
                id: ev.id.clone(),
                accepted: true,
                message,
            });
            // duplicates are acknowledged but never fanned out again
            if inserted {
                state.subs.dispatch(&ev);
            }
        }
        Err(e) => {
            tracing::error!(id = %ev.id, error = %e, "store put failed");
            queue.push(Frame::Ok {
                id: ev.id,
                accepted: false,
                message: format!("error: {e}"),
            });
        }
    }
}

/// Route a private event: persist a public reference locally, forward the
/// original asynchronously, and acknowledge once the reference is
/// durable.
fn offload(
    state: &Arc<RelayState>,
    queue: &ConnQueue,
    ev: Event,
    node: crate::satellite::SatelliteNode,
    now: u64,
) {
    // Re-publishing an already offloaded event must not mint another
    // reference; the reference's `e` tag is indexed, so look it up.
    match already_referenced(state, &ev.id) {
        Ok(true) => {
            queue.push(Frame::Ok {
                id: ev.id,
                accepted: true,
                message: String::new(),
            });
            return;
        }
        Ok(false) => {}
        Err(e) => {
            queue.push(Frame::Ok {
                id: ev.id,
                accepted: false,
                message: format!("error: {e}"),
            });
            return;
        }
    }
    let reference = match reference::synthesize(&state.identity, &ev, &node, now) {
        Ok(r) => r,
        Err(e) => {
            queue.push(Frame::Ok {
                id: ev.id,
                accepted: false,
                message: format!("error: {e}"),
            });
            return;
        }
    };
    let _order = state.accept_lock.lock();
    match state.store.put(&reference) {
        Ok(inserted) => {
            // the OK only vouches for the locally durable pointer;
            // forwarding runs in the background
            queue.push(Frame::Ok {
                id: ev.id.clone(),
                accepted: true,
                message: String::new(),
            });
            if inserted {
                state.subs.dispatch(&reference);
            }
            tokio::spawn(satellite::forward(
                ev,
                node,
                queue.clone(),
                Duration::from_secs(state.cfg.forward_retry_ceiling_seconds),
            ));
        }
        Err(e) => {
            tracing::error!(id = %ev.id, error = %e, "storing reference event failed");
            queue.push(Frame::Ok {
                id: ev.id,
                accepted: false,
                message: format!("error: {e}"),
            });
        }
    }
}

/// Whether a reference event pointing at `id` already exists.
fn already_referenced(state: &Arc<RelayState>, id: &str) -> anyhow::Result<bool> {
    for entry in state.store.range_by_tag('e', id, None, None, None, None)? {
        if let Some(candidate) = state.store.get(&entry.id)? {
            if candidate.kind == REFERENCE_KIND {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// SUBSCRIBE: replace any subscription with the same label, replay the
/// backlog, delimit it with EOSE, then go live.
fn handle_req(
    state: &Arc<RelayState>,
    conn: u64,
    queue: &ConnQueue,
    label: String,
    raw_filters: &[Value],
) {
    let filters: Vec<Filter> = raw_filters.iter().map(Filter::from_value).collect();
    if filters.is_empty() {
        queue.push(Frame::Notice {
            message: "REQ requires at least one filter".into(),
        });
        return;
    }
    state.subs.remove(conn, &label);
    match query::execute(
        &state.store,
        &filters,
        state.cfg.default_query_limit,
        state.cfg.max_query_limit,
    ) {
        Ok(backlog) => {
            for ev in backlog {
                let delivered = queue.push(Frame::Event {
                    label: label.clone(),
                    event: ev,
                    backlog: true,
                });
                if !delivered {
                    // connection closing: stop at this yield point
                    return;
                }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "backlog query failed");
            queue.push(Frame::Notice {
                message: "error: query failed".into(),
            });
        }
    }
    queue.push(Frame::Eose {
        label: label.clone(),
    });
    state.subs.install(LiveSub {
        conn,
        label,
        filters,
        queue: queue.clone(),
    });
}
