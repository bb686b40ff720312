//! Journal → client fan-out: SSE hub, WS hub, and the single journal
//! subscription that feeds both.
//!
//! The journal is the only fan-out point. The server subscribes once; SSE
//! clients get per-session routing with bounded buffers (backpressure
//! pauses a client, too many missed events evicts it), WS clients get
//! `{type:"event"}` frames for the sessions they subscribed to.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::response::sse::Event as SseFrame;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::journal::{Event, Journal};

/// Missed events tolerated before an SSE client is evicted.
pub const MAX_MISSED_EVENTS: u32 = 1000;

/// Serialized event size above which an event is dropped from fan-out.
pub const MAX_EVENT_BYTES: usize = 100_000;

/// Events replayed per SSE reconnect before truncation.
pub const MAX_SSE_REPLAY: usize = 500;

/// Per-client SSE buffer; a full buffer means the client is "paused".
const SSE_CHANNEL_CAPACITY: usize = 64;

/// SSE keepalive comment interval.
pub const SSE_KEEPALIVE: Duration = Duration::from_secs(15);

/// Hard cap on SSE connection lifetime.
pub const SSE_MAX_LIFETIME: Duration = Duration::from_secs(30 * 60);

// ── SSE hub ─────────────────────────────────────────────────────

struct SseClient {
    id: u64,
    tx: mpsc::Sender<Event>,
    missed: u32,
}

/// Per-session SSE client registry with backpressure accounting.
#[derive(Default)]
pub struct SseHub {
    clients: Mutex<HashMap<String, Vec<SseClient>>>,
    next_id: AtomicU64,
}

impl SseHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client for a session; returns its id and event stream.
    pub fn register(&self, session_id: &str) -> (u64, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(SSE_CHANNEL_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut clients) = self.clients.lock() {
            clients
                .entry(session_id.to_owned())
                .or_default()
                .push(SseClient { id, tx, missed: 0 });
        }
        (id, rx)
    }

    /// Remove a client.
    pub fn unregister(&self, session_id: &str, id: u64) {
        if let Ok(mut clients) = self.clients.lock() {
            if let Some(list) = clients.get_mut(session_id) {
                list.retain(|c| c.id != id);
                if list.is_empty() {
                    clients.remove(session_id);
                }
            }
        }
    }

    /// Number of clients attached to a session.
    pub fn client_count(&self, session_id: &str) -> usize {
        self.clients
            .lock()
            .map(|c| c.get(session_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Total clients across sessions.
    pub fn total_clients(&self) -> usize {
        self.clients
            .lock()
            .map(|c| c.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Route one event to the session's clients.
    ///
    /// A full buffer counts a missed event (the client is paused); more
    /// than [`MAX_MISSED_EVENTS`] misses evicts the client. A successful
    /// send resets the counter (drain).
    pub fn dispatch(&self, event: &Event) {
        let Ok(mut clients) = self.clients.lock() else {
            return;
        };
        let Some(list) = clients.get_mut(&event.session_id) else {
            return;
        };
        list.retain_mut(|client| match client.tx.try_send(event.clone()) {
            Ok(()) => {
                client.missed = 0;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                client.missed = client.missed.saturating_add(1);
                if client.missed > MAX_MISSED_EVENTS {
                    warn!(
                        session_id = %event.session_id,
                        client = client.id,
                        "evicting paused SSE client"
                    );
                    false
                } else {
                    true
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if list.is_empty() {
            clients.remove(&event.session_id);
        }
    }

    /// Drop every client (shutdown drain).
    pub fn close_all(&self) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.clear();
        }
    }
}

// ── WS hub ──────────────────────────────────────────────────────

struct WsClient {
    tx: mpsc::UnboundedSender<String>,
    subscriptions: HashSet<String>,
}

/// WebSocket client registry with per-connection session subscriptions.
#[derive(Default)]
pub struct WsHub {
    clients: Mutex<HashMap<u64, WsClient>>,
    next_id: AtomicU64,
}

impl WsHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; returns its id and outbound frame stream.
    pub fn register(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut clients) = self.clients.lock() {
            clients.insert(
                id,
                WsClient {
                    tx,
                    subscriptions: HashSet::new(),
                },
            );
        }
        (id, rx)
    }

    /// Remove a connection.
    pub fn unregister(&self, id: u64) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.remove(&id);
        }
    }

    /// Subscribe a connection to a session's events.
    pub fn subscribe(&self, id: u64, session_id: &str) {
        if let Ok(mut clients) = self.clients.lock() {
            if let Some(client) = clients.get_mut(&id) {
                client.subscriptions.insert(session_id.to_owned());
            }
        }
    }

    /// Send a frame to one connection.
    pub fn send_to(&self, id: u64, frame: &serde_json::Value) {
        if let Ok(clients) = self.clients.lock() {
            if let Some(client) = clients.get(&id) {
                let _ = client.tx.send(frame.to_string());
            }
        }
    }

    /// Broadcast a frame to every connection.
    pub fn send_all(&self, frame: &serde_json::Value) {
        let text = frame.to_string();
        if let Ok(mut clients) = self.clients.lock() {
            clients.retain(|_, client| client.tx.send(text.clone()).is_ok());
        }
    }

    /// Send a journal event to connections subscribed to its session.
    pub fn send_event(&self, event: &Event) {
        let frame = serde_json::json!({
            "type": "event",
            "session_id": event.session_id,
            "event": event,
        });
        let text = frame.to_string();
        if let Ok(mut clients) = self.clients.lock() {
            clients.retain(|_, client| {
                if client.subscriptions.contains(&event.session_id) {
                    client.tx.send(text.clone()).is_ok()
                } else {
                    true
                }
            });
        }
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Drop every connection (shutdown drain).
    pub fn close_all(&self) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.clear();
        }
    }
}

// ── Fan-out loop ────────────────────────────────────────────────

/// Pump the single journal subscription into both hubs until shutdown.
///
/// Oversized events are dropped with a warning and never block or evict
/// clients. A lagged broadcast receiver resynchronizes silently — clients
/// catch up through replay.
pub async fn fan_out_loop(
    journal: Arc<dyn Journal>,
    sse: Arc<SseHub>,
    ws: Arc<WsHub>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut rx = journal.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = rx.recv() => match received {
                Ok(event) => {
                    let size = serde_json::to_string(&event).map(|s| s.len()).unwrap_or(0);
                    if size > MAX_EVENT_BYTES {
                        warn!(
                            seq = event.seq,
                            event_type = %event.event_type,
                            size,
                            "dropping oversized event from fan-out"
                        );
                        continue;
                    }
                    sse.dispatch(&event);
                    ws.send_event(&event);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event fan-out lagged behind the journal");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    debug!("event fan-out loop stopped");
}

// ── SSE stream assembly ─────────────────────────────────────────

/// Replay computed for a reconnecting SSE client.
pub struct SseReplay {
    /// Events to backfill, at most [`MAX_SSE_REPLAY`].
    pub events: Vec<Event>,
    /// Events still beyond the replay window, when truncated.
    pub remaining: Option<u64>,
}

/// Compute the replay window for `after_seq`.
///
/// Reads one past the cap to detect truncation, then counts what remains
/// so the client knows how far behind it still is.
pub async fn compute_replay(
    journal: &dyn Journal,
    session_id: &str,
    after_seq: u64,
) -> Result<SseReplay, crate::journal::JournalError> {
    let mut events = journal
        .read_session(session_id, after_seq.saturating_add(1), MAX_SSE_REPLAY.saturating_add(1))
        .await?;
    if events.len() <= MAX_SSE_REPLAY {
        return Ok(SseReplay {
            events,
            remaining: None,
        });
    }
    events.truncate(MAX_SSE_REPLAY);
    let last_sent = events.last().map(|e| e.seq).unwrap_or(after_seq);
    let remaining = journal
        .read_session(session_id, last_sent.saturating_add(1), usize::MAX)
        .await?
        .len();
    Ok(SseReplay {
        events,
        remaining: Some(u64::try_from(remaining).unwrap_or(u64::MAX)),
    })
}

/// Assemble the SSE frame stream: replay, truncation notice, then live
/// events de-duplicated against the replay tail. The stream ends at the
/// 30-minute lifetime cap; `guard` is dropped with the stream and
/// unregisters the client.
pub fn sse_stream(
    replay: SseReplay,
    live: mpsc::Receiver<Event>,
    guard: SseClientGuard,
) -> impl futures::Stream<Item = Result<SseFrame, Infallible>> {
    let last_replayed = replay.events.last().map(|e| e.seq).unwrap_or(0);

    let mut frames: Vec<SseFrame> = replay.events.iter().map(event_frame).collect();
    if let Some(remaining) = replay.remaining {
        let notice = serde_json::json!({
            "type": "replay.truncated",
            "remaining": remaining,
        });
        frames.push(SseFrame::default().data(notice.to_string()));
    }

    let guard = Arc::new(guard);
    let backfill = futures::stream::iter(frames);
    let live = ReceiverStream::new(live).filter_map(move |event| {
        let frame = if event.seq > last_replayed {
            Some(event_frame(&event))
        } else {
            None
        };
        futures::future::ready(frame)
    });

    backfill
        .chain(live)
        .take_until(Box::pin(tokio::time::sleep(SSE_MAX_LIFETIME)))
        .map(move |frame| {
            let _keep_alive = &guard;
            Ok(frame)
        })
}

/// Unregisters an SSE client when its stream is dropped.
pub struct SseClientGuard {
    hub: Arc<SseHub>,
    session_id: String,
    id: u64,
}

impl SseClientGuard {
    /// Build a guard for a registered client.
    pub fn new(hub: Arc<SseHub>, session_id: String, id: u64) -> Self {
        Self {
            hub,
            session_id,
            id,
        }
    }
}

impl Drop for SseClientGuard {
    fn drop(&mut self) {
        self.hub.unregister(&self.session_id, self.id);
    }
}

fn event_frame(event: &Event) -> SseFrame {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_owned());
    SseFrame::default().id(event.seq.to_string()).data(data)
}
