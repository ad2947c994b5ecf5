//! Connected-session bookkeeping.
//!
//! Sessions, meeting rooms and producer ownership are flat lookup tables
//! keyed by ids; cleanup always starts from a session id. Event sinks are
//! unbounded senders, safe for concurrent emit from any task.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use maskmeet_protocol::ServerEvent;

pub type SessionId = Uuid;

pub const MAX_MEETING_PARTICIPANTS: usize = 2;

/// Per-session overlay settings.
#[derive(Debug, Clone)]
pub struct UserSettings {
    pub overlay_url: Option<String>,
    pub opacity: f32,
    pub enabled: bool,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            overlay_url: None,
            opacity: 1.0,
            enabled: true,
        }
    }
}

pub struct SessionHandle {
    pub id: SessionId,
    pub name: RwLock<Option<String>>,
    pub settings: RwLock<UserSettings>,
    pub meeting: RwLock<Option<String>>,
    sink: mpsc::UnboundedSender<ServerEvent>,
}

impl SessionHandle {
    /// Queue an event on this session's outbound channel.
    pub fn emit(&self, event: ServerEvent) -> bool {
        self.sink.send(event).is_ok()
    }
}

/// Outcome of a join attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// First participant; waiting for a partner.
    Waiting,
    /// Second participant; paired with the existing one.
    Paired(SessionId),
    /// Meeting already holds two participants.
    Full,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<SessionHandle>>>,
    /// Ordered participant lists, capped at two.
    rooms: RwLock<HashMap<String, Vec<SessionId>>>,
    producer_owner: RwLock<HashMap<Uuid, SessionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, sink: mpsc::UnboundedSender<ServerEvent>) -> Arc<SessionHandle> {
        let handle = Arc::new(SessionHandle {
            id: Uuid::new_v4(),
            name: RwLock::new(None),
            settings: RwLock::new(UserSettings::default()),
            meeting: RwLock::new(None),
            sink,
        });
        self.sessions
            .write()
            .await
            .insert(handle.id, handle.clone());
        tracing::info!(session = %handle.id, "session connected");
        handle
    }

    pub async fn get(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.write().await.remove(&id)
    }

    pub async fn send_to(&self, id: SessionId, event: ServerEvent) -> bool {
        match self.get(id).await {
            Some(handle) => handle.emit(event),
            None => false,
        }
    }

    /// The other participant of `id`'s meeting, if any.
    pub async fn peer_of(&self, id: SessionId) -> Option<SessionId> {
        let meeting = self.get(id).await?.meeting.read().await.clone()?;
        let rooms = self.rooms.read().await;
        rooms
            .get(&meeting)?
            .iter()
            .copied()
            .find(|other| *other != id)
    }

    pub async fn send_to_peer(&self, id: SessionId, event: ServerEvent) -> bool {
        match self.peer_of(id).await {
            Some(peer) => self.send_to(peer, event).await,
            None => false,
        }
    }

    /// Add the session to a meeting, enforcing the two-participant cap.
    pub async fn join_meeting(&self, id: SessionId, meeting_id: &str, name: &str) -> JoinOutcome {
        let Some(handle) = self.get(id).await else {
            return JoinOutcome::Full;
        };

        let mut rooms = self.rooms.write().await;
        let participants = rooms.entry(meeting_id.to_string()).or_default();

        if participants.contains(&id) {
            // Re-join of the same session is a no-op at room level.
        } else if participants.len() >= MAX_MEETING_PARTICIPANTS {
            return JoinOutcome::Full;
        } else {
            participants.push(id);
        }

        *handle.name.write().await = Some(name.to_string());
        *handle.meeting.write().await = Some(meeting_id.to_string());

        match participants
            .iter()
            .copied()
            .find(|other| *other != id)
        {
            Some(peer) => JoinOutcome::Paired(peer),
            None => JoinOutcome::Waiting,
        }
    }

    /// Remove the session from its meeting. Returns the remaining peer,
    /// if one is left behind.
    pub async fn leave_meeting(&self, id: SessionId) -> Option<SessionId> {
        let meeting = match self.get(id).await {
            Some(handle) => handle.meeting.write().await.take(),
            None => None,
        }?;

        let mut rooms = self.rooms.write().await;
        let Some(participants) = rooms.get_mut(&meeting) else {
            return None;
        };
        participants.retain(|other| *other != id);

        if participants.is_empty() {
            rooms.remove(&meeting);
            tracing::info!(meeting = %meeting, "meeting deleted");
            None
        } else {
            participants.first().copied()
        }
    }

    pub async fn participants(&self, meeting_id: &str) -> Vec<SessionId> {
        self.rooms
            .read()
            .await
            .get(meeting_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn settings(&self, id: SessionId) -> Option<UserSettings> {
        let handle = self.get(id).await?;
        let settings = handle.settings.read().await.clone();
        Some(settings)
    }

    pub async fn register_producer(&self, producer_id: Uuid, owner: SessionId) {
        self.producer_owner
            .write()
            .await
            .insert(producer_id, owner);
    }

    pub async fn producer_owner(&self, producer_id: Uuid) -> Option<SessionId> {
        self.producer_owner.read().await.get(&producer_id).copied()
    }

    pub async fn remove_producers_of(&self, owner: SessionId) -> Vec<Uuid> {
        let mut map = self.producer_owner.write().await;
        let ids: Vec<Uuid> = map
            .iter()
            .filter(|(_, o)| **o == owner)
            .map(|(p, _)| *p)
            .collect();
        for id in &ids {
            map.remove(id);
        }
        ids
    }
}
