//! Distribution fabric: live session registry and event fan-out.
//!
//! The fabric tracks connected sessions, owns each session's bounded
//! outbound queue, and remembers per-client sync cursors across disconnects.
//! Broadcasting walks the registry and applies the per-queue drop policy;
//! sessions whose queues overflow with undroppable events are closed on the
//! spot.

pub mod events;
pub mod session;

pub use events::{InboundEvent, OutboundEvent};
pub use session::{OutboundQueue, PushOutcome};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

use threatnet_core::ClientProfile;

use crate::now_ts;

/// One live client connection.
#[derive(Debug)]
pub struct Session {
    /// The client this session belongs to.
    pub client_id: String,
    /// Outbound event queue owned by this session.
    pub queue: Arc<OutboundQueue>,
    /// Connection time (unix seconds).
    pub connected_at: i64,
    /// Monotonic id distinguishing reconnects of the same client.
    pub session_seq: u64,
}

/// Connection registry and event bus.
#[derive(Debug)]
pub struct Fabric {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    profiles: RwLock<HashMap<String, ClientProfile>>,
    cursors: Mutex<HashMap<String, i64>>,
    queue_capacity: usize,
    session_counter: AtomicU64,
}

impl Fabric {
    /// Create a fabric whose session queues hold `queue_capacity` events.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            profiles: RwLock::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
            queue_capacity,
            session_counter: AtomicU64::new(0),
        }
    }

    /// Register a session for a client, replacing (and closing) any previous
    /// session with the same client id.
    pub fn register(&self, profile: ClientProfile) -> Arc<Session> {
        let session = Arc::new(Session {
            client_id: profile.client_id.clone(),
            queue: Arc::new(OutboundQueue::new(self.queue_capacity)),
            connected_at: now_ts(),
            session_seq: self.session_counter.fetch_add(1, Ordering::Relaxed),
        });

        let previous = self
            .sessions
            .write()
            .expect("fabric sessions poisoned")
            .insert(profile.client_id.clone(), session.clone());
        if let Some(previous) = previous {
            debug!(client_id = %profile.client_id, "replacing existing session");
            previous.queue.close();
        }

        self.profiles
            .write()
            .expect("fabric profiles poisoned")
            .insert(profile.client_id.clone(), profile);

        session
    }

    /// Mark a session offline. The cursor and profile are preserved so the
    /// client can reconnect and re-sync. A stale handle from a replaced
    /// session is ignored.
    pub fn disconnect(&self, session: &Session) {
        session.queue.close();
        let mut sessions = self.sessions.write().expect("fabric sessions poisoned");
        if let Some(current) = sessions.get(&session.client_id) {
            if current.session_seq == session.session_seq {
                sessions.remove(&session.client_id);
            }
        }
    }

    /// Forcibly close a client's live session, if any.
    pub fn close_client(&self, client_id: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .expect("fabric sessions poisoned")
            .remove(client_id);
        match removed {
            Some(session) => {
                session.queue.close();
                true
            }
            None => false,
        }
    }

    /// Fan an event out to every live session.
    ///
    /// Sessions whose queues overflow with undroppable events are closed and
    /// removed; their clients must reconnect and re-sync.
    pub fn broadcast(&self, event: &OutboundEvent) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .read()
            .expect("fabric sessions poisoned")
            .values()
            .cloned()
            .collect();

        for session in sessions {
            match session.queue.push(event.clone()) {
                PushOutcome::Queued | PushOutcome::DroppedIncoming => {}
                PushOutcome::QueuedAfterDrop => {
                    debug!(client_id = %session.client_id, "dropped oldest status event under back-pressure");
                }
                PushOutcome::Overflow => {
                    warn!(client_id = %session.client_id, "outbound queue overflow; closing session");
                    self.disconnect(&session);
                }
            }
        }
    }

    /// Unicast an event to one client. Returns false if the client is
    /// offline or its queue overflowed.
    pub fn send_to(&self, client_id: &str, event: OutboundEvent) -> bool {
        let session = self
            .sessions
            .read()
            .expect("fabric sessions poisoned")
            .get(client_id)
            .cloned();

        match session {
            Some(session) => match session.queue.push(event) {
                PushOutcome::Queued | PushOutcome::QueuedAfterDrop => true,
                PushOutcome::DroppedIncoming => false,
                PushOutcome::Overflow => {
                    warn!(client_id, "outbound queue overflow; closing session");
                    self.disconnect(&session);
                    false
                }
            },
            None => false,
        }
    }

    /// Whether a client has a live session.
    pub fn is_online(&self, client_id: &str) -> bool {
        self.sessions
            .read()
            .expect("fabric sessions poisoned")
            .contains_key(client_id)
    }

    /// Ids of all connected clients.
    pub fn online_ids(&self) -> Vec<String> {
        self.sessions
            .read()
            .expect("fabric sessions poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Number of connected clients.
    pub fn online_count(&self) -> usize {
        self.sessions
            .read()
            .expect("fabric sessions poisoned")
            .len()
    }

    /// Remember a client's sync cursor.
    pub fn set_cursor(&self, client_id: &str, cursor: i64) {
        self.cursors
            .lock()
            .expect("fabric cursors poisoned")
            .insert(client_id.to_string(), cursor);
    }

    /// The client's last known sync cursor, if any.
    pub fn cursor(&self, client_id: &str) -> Option<i64> {
        self.cursors
            .lock()
            .expect("fabric cursors poisoned")
            .get(client_id)
            .copied()
    }

    /// Every profile the fabric has seen, with current presence.
    pub fn profiles(&self) -> Vec<(ClientProfile, bool)> {
        let sessions = self.sessions.read().expect("fabric sessions poisoned");
        self.profiles
            .read()
            .expect("fabric profiles poisoned")
            .values()
            .map(|profile| {
                let online = sessions.contains_key(&profile.client_id);
                (profile.clone(), online)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use threatnet_core::{IocId, IocStatus};

    fn profile(client_id: &str) -> ClientProfile {
        ClientProfile {
            client_id: client_id.to_string(),
            hostname: format!("{}.host", client_id),
            version: "1.0".to_string(),
        }
    }

    fn ack_event() -> OutboundEvent {
        OutboundEvent::ReportAck {
            ioc_id: IocId::new("abc".into()),
            status: IocStatus::Pending,
        }
    }

    #[tokio::test]
    async fn test_register_and_disconnect() {
        let fabric = Fabric::new(16);

        let session = fabric.register(profile("agent-1"));
        assert!(fabric.is_online("agent-1"));
        assert_eq!(fabric.online_count(), 1);

        fabric.disconnect(&session);
        assert!(!fabric.is_online("agent-1"));

        // The profile survives the disconnect.
        let profiles = fabric.profiles();
        assert_eq!(profiles.len(), 1);
        assert!(!profiles[0].1);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_session() {
        let fabric = Fabric::new(16);

        let first = fabric.register(profile("agent-1"));
        let second = fabric.register(profile("agent-1"));

        assert!(first.queue.is_closed());
        assert_eq!(fabric.online_count(), 1);

        // A disconnect of the stale handle must not evict the live session.
        fabric.disconnect(&first);
        assert!(fabric.is_online("agent-1"));

        fabric.disconnect(&second);
        assert!(!fabric.is_online("agent-1"));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_sessions() {
        let fabric = Fabric::new(16);
        let a = fabric.register(profile("agent-a"));
        let b = fabric.register(profile("agent-b"));

        fabric.broadcast(&ack_event());

        assert_eq!(a.queue.len(), 1);
        assert_eq!(b.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_closes_overflowed_session() {
        let fabric = Fabric::new(1);
        let session = fabric.register(profile("agent-a"));

        // Saturate with an undroppable event, then overflow.
        fabric.broadcast(&ack_event());
        fabric.broadcast(&ack_event());

        assert!(session.queue.is_closed());
        assert!(!fabric.is_online("agent-a"));
    }

    #[tokio::test]
    async fn test_send_to_offline_client() {
        let fabric = Fabric::new(16);
        assert!(!fabric.send_to("ghost", ack_event()));
    }

    #[tokio::test]
    async fn test_cursor_survives_disconnect() {
        let fabric = Fabric::new(16);
        let session = fabric.register(profile("agent-1"));
        fabric.set_cursor("agent-1", 12345);
        fabric.disconnect(&session);

        assert_eq!(fabric.cursor("agent-1"), Some(12345));
        assert_eq!(fabric.cursor("unknown"), None);
    }
}
