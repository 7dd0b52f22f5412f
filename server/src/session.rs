use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use rand::RngCore;
use rand::rngs::OsRng;
use serde_json::Value;
use tokio::sync::mpsc;

/// Session lifecycle. `Closed` is terminal; a closed session never becomes
/// visible again and its id is never handed out twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Active,
    Closed,
}

/// One entry of a session's push log. Sequence ids start at 1 and are gapless
/// within a session, so a reconnecting client can name exactly where it left
/// off via `Last-Event-ID`.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub seq: u64,
    pub payload: Value,
}

struct SessionInner {
    state: SessionState,
    next_seq: u64,
    log_cap: usize,
    events: VecDeque<StoredEvent>,
    stream: Option<mpsc::UnboundedSender<StoredEvent>>,
}

pub struct SessionHandle {
    pub id: String,
    inner: Mutex<SessionInner>,
    /// Serializes request processing within one session. Cross-session
    /// requests never contend on this.
    pub gate: tokio::sync::Mutex<()>,
}

impl SessionHandle {
    fn new(id: String, log_cap: usize) -> Self {
        Self {
            id,
            inner: Mutex::new(SessionInner {
                state: SessionState::Uninitialized,
                next_seq: 1,
                log_cap,
                events: VecDeque::new(),
                stream: None,
            }),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Move Uninitialized -> Active. A no-op on an already-active session;
    /// a closed session stays closed.
    pub fn activate(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state == SessionState::Uninitialized {
            inner.state = SessionState::Active;
        }
    }

    /// Record a payload in the session log and deliver it to the attached
    /// stream, if any. Returns the assigned sequence id, or None once the
    /// session is closed.
    pub fn publish(&self, payload: Value) -> Option<u64> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state == SessionState::Closed {
            return None;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let event = StoredEvent { seq, payload };
        inner.events.push_back(event.clone());
        while inner.events.len() > inner.log_cap {
            inner.events.pop_front();
        }

        if let Some(stream) = &inner.stream {
            if stream.send(event).is_err() {
                inner.stream = None;
            }
        }
        Some(seq)
    }

    /// Open (or re-open) the push channel. Retained events with a sequence id
    /// greater than `last_event_id` are queued first; replay and switch-over
    /// happen under the session lock, so nothing published concurrently is
    /// dropped or duplicated.
    pub fn attach_stream(
        &self,
        last_event_id: Option<u64>,
    ) -> Option<mpsc::UnboundedReceiver<StoredEvent>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state != SessionState::Active {
            return None;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(cursor) = last_event_id {
            for event in inner.events.iter().filter(|e| e.seq > cursor) {
                // Receiver is in hand, the channel cannot be closed yet.
                let _ = tx.send(event.clone());
            }
        }
        inner.stream = Some(tx);
        Some(rx)
    }

    fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.state = SessionState::Closed;
        inner.stream = None;
        inner.events.clear();
    }
}

/// Owned id -> session map. Constructed once at startup, carried in app
/// state, and drained on shutdown; nothing here is process-global.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
    event_log_cap: usize,
}

impl SessionRegistry {
    pub fn new(event_log_cap: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            event_log_cap,
        }
    }

    /// Register a fresh Uninitialized session under a new random id.
    pub fn begin(&self) -> Arc<SessionHandle> {
        let session = Arc::new(SessionHandle::new(new_session_id(), self.event_log_cap));
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.insert(session.id.clone(), session.clone());
        session
    }

    pub fn resume(&self, id: &str) -> Option<Arc<SessionHandle>> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(id).cloned()
    }

    /// Close a session and drop it from the map. Returns false for ids that
    /// are unknown or already terminated.
    pub fn terminate(&self, id: &str) -> bool {
        let removed = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.remove(id)
        };
        match removed {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// Close every session. Used on graceful shutdown after the listener has
    /// drained.
    pub fn shutdown_all(&self) {
        let drained: Vec<Arc<SessionHandle>> = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.drain().map(|(_, session)| session).collect()
        };
        for session in drained {
            session.close();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 16 bytes from the OS CSPRNG, hex-encoded. Collision-resistant enough that
/// ids are effectively never reused without tracking terminated ones.
fn new_session_id() -> String {
    let mut bytes = [0_u8; 16];
    OsRng.fill_bytes(&mut bytes);
    format!("mcp-{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_ids_are_distinct_and_prefixed() {
        let registry = SessionRegistry::new(8);
        let a = registry.begin();
        let b = registry.begin();
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("mcp-"));
        assert_eq!(a.id.len(), 4 + 32);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn lifecycle_is_uninitialized_active_closed() {
        let registry = SessionRegistry::new(8);
        let session = registry.begin();
        assert_eq!(session.state(), SessionState::Uninitialized);

        session.activate();
        assert!(session.is_active());

        assert!(registry.terminate(&session.id));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.resume(&session.id).is_none());

        // Closed is terminal.
        session.activate();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn terminate_unknown_id_reports_failure() {
        let registry = SessionRegistry::new(8);
        assert!(!registry.terminate("mcp-ffffffffffffffffffffffffffffffff"));
    }

    #[test]
    fn publish_assigns_gapless_sequence_ids_from_one() {
        let registry = SessionRegistry::new(8);
        let session = registry.begin();
        session.activate();

        assert_eq!(session.publish(json!({"n": 1})), Some(1));
        assert_eq!(session.publish(json!({"n": 2})), Some(2));
        assert_eq!(session.publish(json!({"n": 3})), Some(3));
    }

    #[test]
    fn publish_after_close_is_rejected() {
        let registry = SessionRegistry::new(8);
        let session = registry.begin();
        session.activate();
        registry.terminate(&session.id);
        assert_eq!(session.publish(json!({})), None);
    }

    #[test]
    fn log_retention_evicts_oldest_but_keeps_sequence() {
        let registry = SessionRegistry::new(3);
        let session = registry.begin();
        session.activate();
        for n in 1..=5 {
            session.publish(json!({ "n": n }));
        }

        // Only 3..=5 retained; the next id continues gaplessly.
        let mut rx = session.attach_stream(Some(0)).expect("active session");
        let replayed: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.seq)
            .collect();
        assert_eq!(replayed, vec![3, 4, 5]);
        assert_eq!(session.publish(json!({ "n": 6 })), Some(6));
    }

    #[test]
    fn attach_stream_requires_an_active_session() {
        let registry = SessionRegistry::new(8);
        let session = registry.begin();
        assert!(session.attach_stream(None).is_none());

        session.activate();
        assert!(session.attach_stream(None).is_some());
    }

    #[tokio::test]
    async fn reconnect_replays_after_cursor_then_delivers_live() {
        let registry = SessionRegistry::new(32);
        let session = registry.begin();
        session.activate();
        for n in 1..=4 {
            session.publish(json!({ "n": n }));
        }

        let mut rx = session.attach_stream(Some(2)).expect("active session");
        session.publish(json!({ "n": 5 }));

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event.seq);
        }
        assert_eq!(seen, vec![3, 4, 5]);
    }

    #[test]
    fn reattach_replaces_the_previous_stream() {
        let registry = SessionRegistry::new(8);
        let session = registry.begin();
        session.activate();

        let mut first = session.attach_stream(None).expect("active session");
        let mut second = session.attach_stream(None).expect("active session");
        session.publish(json!({ "n": 1 }));

        assert!(first.try_recv().is_err());
        assert_eq!(second.try_recv().unwrap().seq, 1);
    }

    #[test]
    fn shutdown_all_closes_every_session() {
        let registry = SessionRegistry::new(8);
        let a = registry.begin();
        let b = registry.begin();
        a.activate();
        b.activate();

        registry.shutdown_all();
        assert!(registry.is_empty());
        assert_eq!(a.state(), SessionState::Closed);
        assert_eq!(b.state(), SessionState::Closed);
    }
}
