use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use slab::Slab;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinError;
use tokio::time::{sleep, Instant};

use crate::connection::Connection;
use crate::metadata::MetadataStore;
use crate::session::{RelaySession, SessionSettings, Status};
use crate::transcoder;

pub type SessionId = usize;

struct SessionEntry {
    status: Status,
    channel: Option<String>,
    pid: Option<u32>,
    connected_at: DateTime<Utc>,
    close: Arc<Notify>,
}

/// Point-in-time view of one session, as served by the admin listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub status: Status,
    pub channel: Option<String>,
    pub pid: Option<u32>,
    pub connected_at: DateTime<Utc>,
}

type Sessions = Arc<RwLock<Slab<SessionEntry>>>;

/// A session's handle on its own registry entry.
pub struct Tracker {
    id: SessionId,
    sessions: Sessions,
}

impl Tracker {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub async fn update(&self, status: Status, channel: Option<&str>, pid: Option<u32>) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(self.id) {
            entry.status = status;
            entry.channel = channel.map(str::to_string);
            entry.pid = pid;
        }
    }
}

/// Accepts connections and runs one relay session per connection.
///
/// The registry only mirrors session state for lookup and shutdown; each
/// session stays the sole owner of its transcoder. Two sessions streaming the
/// same channel are not coordinated: the last write to the store wins.
pub struct ServerInner {
    sessions: Sessions,
    store: Arc<dyn MetadataStore>,
    settings: Arc<SessionSettings>,
}

impl ServerInner {
    pub fn new(store: Arc<dyn MetadataStore>, settings: SessionSettings) -> Self {
        ServerInner {
            sessions: Arc::new(RwLock::new(Slab::new())),
            store,
            settings: Arc::new(settings),
        }
    }

    /// Runs a session for `conn` to completion.
    ///
    /// The session runs in its own task so a panic inside it still reaches the
    /// cleanup below.
    pub async fn serve_connection<C>(&self, conn: C)
    where
        C: Connection + 'static,
    {
        let close = Arc::new(Notify::new());
        let id = {
            let mut sessions = self.sessions.write().await;
            sessions.insert(SessionEntry {
                status: Status::Idle,
                channel: None,
                pid: None,
                connected_at: Utc::now(),
                close: close.clone(),
            })
        };

        let tracker = Tracker {
            id,
            sessions: self.sessions.clone(),
        };
        let session = RelaySession::new(
            conn,
            self.store.clone(),
            self.settings.clone(),
            tracker,
            close,
        );

        let outcome = tokio::spawn(session.run()).await;
        self.finish(id, outcome).await;
    }

    async fn finish(&self, id: SessionId, outcome: Result<(), JoinError>) {
        let entry = {
            let mut sessions = self.sessions.write().await;
            sessions.try_remove(id)
        };

        let Err(e) = outcome else {
            return;
        };
        error!("session {} aborted: {}", id, e);
        if let Some(entry) = entry {
            self.abandon(entry).await;
        }
    }

    /// Cleans up after a session that cannot run its own teardown: the channel
    /// goes inactive first, then the recorded transcoder pid is killed.
    async fn abandon(&self, entry: SessionEntry) {
        if let Some(channel) = &entry.channel {
            if let Err(e) = self.store.mark_inactive(channel, Utc::now()).await {
                warn!("marking {} inactive after abort failed: {}", channel, e);
            }
        }
        if let Some(pid) = entry.pid {
            if transcoder::kill_pid(pid) {
                info!("killed orphaned transcoder pid={}", pid);
            }
        }
    }

    pub async fn list(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .map(|(id, entry)| SessionSnapshot {
                id,
                status: entry.status,
                channel: entry.channel.clone(),
                pid: entry.pid,
                connected_at: entry.connected_at,
            })
            .collect()
    }

    /// Asks one session to close. Returns false if no such session exists.
    pub async fn close_session(&self, id: SessionId) -> bool {
        let sessions = self.sessions.read().await;
        match sessions.get(id) {
            Some(entry) => {
                entry.close.notify_one();
                true
            }
            None => false,
        }
    }

    /// Asks every session to close and waits up to `grace` for them to finish.
    pub async fn shutdown(&self, grace: Duration) {
        let open = {
            let sessions = self.sessions.read().await;
            for (_, entry) in sessions.iter() {
                entry.close.notify_one();
            }
            sessions.len()
        };
        info!("closing {} session(s)", open);

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.sessions.read().await.is_empty() {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
        let stragglers: Vec<SessionEntry> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().collect()
        };
        warn!("{} session(s) still open after {:?}", stragglers.len(), grace);
        for entry in stragglers {
            self.abandon(entry).await;
        }
    }
}
