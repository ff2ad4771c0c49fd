//! Live subscriptions and per-connection outbound queues.

use std::{collections::VecDeque, sync::Arc};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::event::Event;
use crate::query::Filter;

/// Server-to-client frame queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event {
        label: String,
        event: Event,
        /// Stored-event replay frames are sheddable under back-pressure;
        /// live frames never are.
        backlog: bool,
    },
    Eose {
        label: String,
    },
    Ok {
        id: String,
        accepted: bool,
        message: String,
    },
    Notice {
        message: String,
    },
}

impl Frame {
    /// Wire form of the frame.
    pub fn to_json(&self) -> String {
        match self {
            Frame::Event { label, event, .. } => {
                serde_json::json!(["EVENT", label, event]).to_string()
            }
            Frame::Eose { label } => serde_json::json!(["EOSE", label]).to_string(),
            Frame::Ok {
                id,
                accepted,
                message,
            } => serde_json::json!(["OK", id, accepted, message]).to_string(),
            Frame::Notice { message } => serde_json::json!(["NOTICE", message]).to_string(),
        }
    }
}

#[derive(Default)]
struct QueueState {
    frames: VecDeque<Frame>,
    closing: bool,
    shed_noticed: bool,
}

struct QueueInner {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

/// Bounded outbound frame queue shared between the protocol engine and a
/// connection's writer task. Overflow sheds the oldest backlog frame and
/// announces it once; when nothing is sheddable the queue flips to
/// closing and the writer drains what remains before the connection is
/// torn down.
#[derive(Clone)]
pub struct ConnQueue {
    inner: Arc<QueueInner>,
}

impl ConnQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Enqueue a frame. Returns `false` once the connection is closing,
    /// which backlog producers treat as a cancellation point.
    pub fn push(&self, frame: Frame) -> bool {
        let mut st = self.inner.state.lock();
        if st.closing {
            return false;
        }
        // NOTICE frames bypass the capacity check so overflow itself can
        // be reported.
        let bypass = matches!(frame, Frame::Notice { .. });
        if !bypass && st.frames.len() >= self.inner.capacity {
            let sheddable = st
                .frames
                .iter()
                .position(|f| matches!(f, Frame::Event { backlog: true, .. }));
            match sheddable {
                Some(pos) => {
                    st.frames.remove(pos);
                    if !st.shed_noticed {
                        st.shed_noticed = true;
                        st.frames.push_back(Frame::Notice {
                            message: "slow consumer: dropped stored events".into(),
                        });
                    }
                }
                None => {
                    st.closing = true;
                    st.frames.push_back(Frame::Notice {
                        message: "slow consumer: closing connection".into(),
                    });
                    drop(st);
                    self.inner.notify.notify_one();
                    return false;
                }
            }
        }
        st.frames.push_back(frame);
        drop(st);
        self.inner.notify.notify_one();
        true
    }

    /// Dequeue the next frame; `None` once the queue is closing and
    /// drained.
    pub async fn pop(&self) -> Option<Frame> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut st = self.inner.state.lock();
                if let Some(frame) = st.frames.pop_front() {
                    if st.frames.len() * 2 < self.inner.capacity {
                        st.shed_noticed = false;
                    }
                    return Some(frame);
                }
                if st.closing {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark the queue closing; the writer drains remaining frames then
    /// stops.
    pub fn close(&self) {
        self.inner.state.lock().closing = true;
        self.inner.notify.notify_one();
    }

    pub fn is_closing(&self) -> bool {
        self.inner.state.lock().closing
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.state.lock().frames.len()
    }
}

/// One live subscription: matching accepted events are enqueued on its
/// connection.
#[derive(Clone)]
pub struct LiveSub {
    pub conn: u64,
    pub label: String,
    pub filters: Vec<Filter>,
    pub queue: ConnQueue,
}

/// Copy-on-write registry of live subscriptions across all connections.
///
/// Writers swap in a fresh `Arc<Vec<_>>`; dispatch clones the current
/// snapshot out of the lock, so a fan-out in flight always sees a
/// consistent set.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    subs: Arc<RwLock<Arc<Vec<LiveSub>>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a subscription, atomically replacing any previous one with
    /// the same connection and label.
    pub fn install(&self, sub: LiveSub) {
        let mut guard = self.subs.write();
        let mut next: Vec<LiveSub> = guard
            .iter()
            .filter(|s| !(s.conn == sub.conn && s.label == sub.label))
            .cloned()
            .collect();
        next.push(sub);
        *guard = Arc::new(next);
    }

    pub fn remove(&self, conn: u64, label: &str) {
        let mut guard = self.subs.write();
        let next: Vec<LiveSub> = guard
            .iter()
            .filter(|s| !(s.conn == conn && s.label == label))
            .cloned()
            .collect();
        *guard = Arc::new(next);
    }

    /// Drop every subscription owned by a connection.
    pub fn remove_conn(&self, conn: u64) {
        let mut guard = self.subs.write();
        let next: Vec<LiveSub> = guard.iter().filter(|s| s.conn != conn).cloned().collect();
        *guard = Arc::new(next);
    }

    pub fn snapshot(&self) -> Arc<Vec<LiveSub>> {
        self.subs.read().clone()
    }

    /// Fan an accepted event out to every matching live subscription.
    pub fn dispatch(&self, ev: &Event) {
        for sub in self.snapshot().iter() {
            if sub.filters.iter().any(|f| f.matches(ev)) {
                sub.queue.push(Frame::Event {
                    label: sub.label.clone(),
                    event: ev.clone(),
                    backlog: false,
                });
            }
        }
    }
}
