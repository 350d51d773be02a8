use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::Notify;

use crate::connection::Connection;
use crate::error::{RelayError, Result};
use crate::metadata::{MetadataStore, StreamMetadata};
use crate::protocol::{decode_control, Control, Inbound, Reply, StartRequest};
use crate::server_inner::Tracker;
use crate::transcoder::{Transcoder, TranscoderConfig};

/// Session lifecycle. `Closed` is terminal.
///
/// ```text
/// Idle -start-> Starting -> Active -stop-> Stopping -> Idle
///   any --connection lost / fatal error--> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Idle,
    Starting,
    Active,
    Stopping,
    Closed,
}

/// Settings shared by every session of one server.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub transcoder: TranscoderConfig,
    pub remove_on_stop: bool,
}

/// Binds one client connection to at most one transcoder at a time.
pub struct RelaySession<C> {
    conn: C,
    status: Status,
    channel: Option<String>,
    transcoder: Option<Transcoder>,
    store: Arc<dyn MetadataStore>,
    settings: Arc<SessionSettings>,
    tracker: Tracker,
    close: Arc<Notify>,
}

impl<C: Connection> RelaySession<C> {
    pub fn new(
        conn: C,
        store: Arc<dyn MetadataStore>,
        settings: Arc<SessionSettings>,
        tracker: Tracker,
        close: Arc<Notify>,
    ) -> Self {
        RelaySession {
            conn,
            status: Status::Idle,
            channel: None,
            transcoder: None,
            store,
            settings,
            tracker,
            close,
        }
    }

    /// Reads until the client leaves, a fatal error occurs or a close is
    /// requested, then tears everything down. Teardown runs exactly once.
    pub async fn run(mut self) {
        info!("session {} opened", self.tracker.id());
        let close = self.close.clone();

        loop {
            let next = tokio::select! {
                inbound = self.conn.recv() => Some(inbound),
                _ = close.notified() => None,
            };
            let Some(inbound) = next else {
                info!("session {} asked to close", self.tracker.id());
                break;
            };

            let outcome = match inbound {
                None => {
                    info!("session {}: client disconnected", self.tracker.id());
                    break;
                }
                Some(Err(e)) => {
                    warn!("session {}: read failed: {}", self.tracker.id(), e);
                    break;
                }
                Some(Ok(Inbound::Binary(frame))) => self.on_frame(frame).await,
                Some(Ok(Inbound::Text(text))) => self.on_text(&text).await,
            };

            match outcome {
                Err(e) if e.is_fatal() => {
                    error!("session {} ending: {}", self.tracker.id(), e);
                    break;
                }
                Err(e) => warn!("session {}: {}", self.tracker.id(), e),
                Ok(()) => {}
            }
        }

        self.teardown().await;
    }

    async fn on_text(&mut self, text: &str) -> Result<()> {
        match decode_control(text) {
            Ok(Control::Start(request)) => self.start(request).await,
            Ok(Control::Stop) => self.stop().await,
            Err(RelayError::Validation(message)) => {
                // Only a start can fail validation, and a start replaces the stream even when rejected.
                warn!("session {}: rejected start: {}", self.tracker.id(), message);
                self.replace_running().await;
                self.conn.send(Reply::Error(message)).await
            }
            Err(e) => {
                warn!("session {}: ignoring envelope: {}", self.tracker.id(), e);
                Ok(())
            }
        }
    }

    async fn on_frame(&mut self, frame: Bytes) -> Result<()> {
        let Some(transcoder) = self.transcoder.as_mut() else {
            debug!(
                "session {}: transcoder not started, dropping {} bytes",
                self.tracker.id(),
                frame.len()
            );
            return Ok(());
        };
        transcoder.write(&frame).await
    }

    /// Retires the running stream, if any, ahead of a new start. Its channel
    /// goes inactive before the transcoder is stopped.
    async fn replace_running(&mut self) {
        if let Some(channel) = self.channel.take() {
            self.mark_inactive(&channel).await;
        }
        if let Some(mut previous) = self.transcoder.take() {
            info!(
                "session {}: replacing transcoder for {}",
                self.tracker.id(),
                previous.channel()
            );
            previous.stop().await;
        }
        if self.status != Status::Idle {
            self.set_status(Status::Idle).await;
        }
    }

    /// A start always replaces whatever is running.
    async fn start(&mut self, request: StartRequest) -> Result<()> {
        self.replace_running().await;

        let channel = request.channel_name.clone();
        self.channel = Some(channel.clone());
        self.set_status(Status::Starting).await;

        let transcoder = match Transcoder::start(&self.settings.transcoder, &channel) {
            Ok(transcoder) => transcoder,
            Err(e) => {
                error!("session {}: {}", self.tracker.id(), e);
                self.channel = None;
                self.set_status(Status::Idle).await;
                return self.conn.send(Reply::Error("internal error".to_string())).await;
            }
        };
        self.transcoder = Some(transcoder);
        self.publish().await;

        let metadata = StreamMetadata::starting(&request, Utc::now());
        if let Err(e) = self.store.upsert(&metadata).await {
            // A transcoder without a metadata record is not allowed to keep running.
            // Drop whatever part of the record may have landed; teardown then has
            // no channel to mark and only kills the process.
            if let Some(channel) = self.channel.take() {
                if let Err(remove_err) = self.store.remove(&channel).await {
                    warn!(
                        "session {}: removing {} failed: {}",
                        self.tracker.id(),
                        channel,
                        remove_err
                    );
                }
            }
            if let Err(send_err) = self.conn.send(Reply::Error("server error".to_string())).await {
                debug!("session {}: {}", self.tracker.id(), send_err);
            }
            return Err(e);
        }

        self.set_status(Status::Active).await;
        info!("session {}: streaming {}", self.tracker.id(), channel);
        self.conn.send(Reply::StreamStarted).await
    }

    async fn stop(&mut self) -> Result<()> {
        if !matches!(self.status, Status::Starting | Status::Active) {
            debug!("session {}: stop while {:?}", self.tracker.id(), self.status);
            return self.conn.send(Reply::StreamStopped).await;
        }

        self.set_status(Status::Stopping).await;
        if let Some(mut transcoder) = self.transcoder.take() {
            transcoder.stop().await;
        }
        if let Some(channel) = self.channel.take() {
            if self.settings.remove_on_stop {
                if let Err(e) = self.store.remove(&channel).await {
                    warn!("session {}: removing {} failed: {}", self.tracker.id(), channel, e);
                }
            } else {
                self.mark_inactive(&channel).await;
            }
            info!("session {}: stopped {}", self.tracker.id(), channel);
        }
        self.set_status(Status::Idle).await;
        self.conn.send(Reply::StreamStopped).await
    }

    /// The single exit path. Metadata goes inactive before the transcoder is
    /// killed so no reader sees an active channel without a process.
    async fn teardown(mut self) {
        self.status = Status::Closed;
        self.conn.close().await;
        if let Some(channel) = self.channel.take() {
            self.mark_inactive(&channel).await;
        }
        if let Some(mut transcoder) = self.transcoder.take() {
            transcoder.terminate().await;
        }
        self.tracker.update(self.status, None, None).await;
        info!("session {} closed", self.tracker.id());
    }

    async fn mark_inactive(&mut self, channel: &str) {
        if let Err(e) = self.store.mark_inactive(channel, Utc::now()).await {
            warn!(
                "session {}: marking {} inactive failed: {}",
                self.tracker.id(),
                channel,
                e
            );
        }
    }

    async fn set_status(&mut self, status: Status) {
        self.status = status;
        self.publish().await;
    }

    async fn publish(&mut self) {
        let pid = self.transcoder.as_ref().and_then(Transcoder::pid);
        self.tracker
            .update(self.status, self.channel.as_deref(), pid)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    use super::*;
    use crate::connection::testing::{pair, Client};
    use crate::metadata::memory::MemoryStore;
    use crate::server_inner::ServerInner;
    use crate::transcoder::process_alive;
    use crate::transcoder::testing::{counting_sink, file_sink, spawned_pids, wait_for_spawns};

    struct Harness {
        server: Arc<ServerInner>,
        store: Arc<MemoryStore>,
        client: Client,
        task: JoinHandle<()>,
        dir: tempfile::TempDir,
    }

    fn harness_with(
        store: MemoryStore,
        transcoder: Option<TranscoderConfig>,
        remove_on_stop: bool,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store);
        let settings = SessionSettings {
            transcoder: transcoder.unwrap_or_else(|| file_sink(dir.path())),
            remove_on_stop,
        };
        let server = Arc::new(ServerInner::new(store.clone(), settings));
        let (conn, client) = pair();
        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve_connection(conn).await })
        };
        Harness {
            server,
            store,
            client,
            task,
            dir,
        }
    }

    fn harness() -> Harness {
        harness_with(MemoryStore::default(), None, false)
    }

    fn start(channel: &str) -> String {
        format!(r#"{{"type":"start","data":{{"channelName":"{channel}","title":"t","tags":["a","b"]}}}}"#)
    }

    const STOP: &str = r#"{"type":"stop","data":{}}"#;

    impl Harness {
        async fn reply(&mut self) -> Reply {
            timeout(Duration::from_secs(5), self.client.reply())
                .await
                .expect("no reply in time")
                .expect("session hung up")
        }

        async fn pid(&self) -> Option<u32> {
            self.server.list().await.first().and_then(|s| s.pid)
        }

        async fn status(&self) -> Option<Status> {
            self.server.list().await.first().map(|s| s.status)
        }

        /// Drops the client's sending half, as a vanished peer would.
        fn hang_up(&mut self) {
            let (to_server, _) = tokio::sync::mpsc::unbounded_channel();
            drop(std::mem::replace(&mut self.client.to_server, to_server));
        }

        async fn finished(self) -> (Arc<MemoryStore>, Arc<ServerInner>, tempfile::TempDir) {
            timeout(Duration::from_secs(10), self.task)
                .await
                .expect("session did not finish")
                .unwrap();
            (self.store, self.server, self.dir)
        }
    }

    #[tokio::test]
    async fn start_frames_stop_round_trip() {
        let mut h = harness();

        h.client.text(&start("abc"));
        assert_eq!(h.reply().await, Reply::StreamStarted);
        assert_eq!(h.status().await, Some(Status::Active));
        assert_eq!(h.store.field("abc", "active").await.as_deref(), Some("1"));
        assert_eq!(h.store.field("abc", "tags").await.as_deref(), Some("a,b"));
        let pid = h.pid().await.unwrap();

        h.client.binary(b"frame-1;");
        h.client.binary(b"frame-2;");
        h.client.binary(b"frame-3");
        h.client.text(STOP);
        assert_eq!(h.reply().await, Reply::StreamStopped);

        assert!(!process_alive(pid));
        assert_eq!(h.status().await, Some(Status::Idle));
        assert_eq!(h.store.field("abc", "active").await.as_deref(), Some("0"));
        let written = std::fs::read(h.dir.path().join("abc")).unwrap();
        assert_eq!(written, b"frame-1;frame-2;frame-3");
    }

    #[tokio::test]
    async fn stop_can_delete_the_record() {
        let mut h = harness_with(MemoryStore::default(), None, true);

        h.client.text(&start("abc"));
        assert_eq!(h.reply().await, Reply::StreamStarted);
        assert!(h.store.contains("abc").await);

        h.client.text(STOP);
        assert_eq!(h.reply().await, Reply::StreamStopped);
        assert!(!h.store.contains("abc").await);
    }

    #[tokio::test]
    async fn empty_channel_is_rejected_and_session_stays_idle() {
        let mut h = harness();

        h.client.text(&start(""));
        assert_eq!(h.reply().await, Reply::Error("channelName is required".to_string()));
        assert_eq!(h.status().await, Some(Status::Idle));
        assert_eq!(h.pid().await, None);

        h.client.text(r#"{"type":"start","data":[1,2]}"#);
        assert_eq!(h.reply().await, Reply::Error("invalid start data".to_string()));

        // Still usable afterwards.
        h.client.text(&start("abc"));
        assert_eq!(h.reply().await, Reply::StreamStarted);
    }

    #[tokio::test]
    async fn rejected_start_stops_the_running_stream() {
        let mut h = harness();

        h.client.text(&start("abc"));
        assert_eq!(h.reply().await, Reply::StreamStarted);
        let pid = h.pid().await.unwrap();

        h.client.text(&start(" "));
        assert_eq!(h.reply().await, Reply::Error("channelName is required".to_string()));
        assert!(!process_alive(pid));
        assert_eq!(h.status().await, Some(Status::Idle));
        assert_eq!(h.pid().await, None);
        assert_eq!(h.store.field("abc", "active").await.as_deref(), Some("0"));

        h.client.binary(b"dropped");
        h.client.text(STOP);
        assert_eq!(h.reply().await, Reply::StreamStopped);
    }

    #[tokio::test]
    async fn failed_restart_of_the_same_channel_leaves_it_inactive() {
        let sink = tempfile::tempdir().unwrap();
        let mut h = harness_with(MemoryStore::default(), Some(counting_sink(sink.path())), false);

        h.client.text(&start("abc"));
        assert_eq!(h.reply().await, Reply::StreamStarted);
        let pid = h.pid().await.unwrap();

        std::fs::remove_file(sink.path().join("transcoder")).unwrap();
        h.client.text(&start("abc"));
        assert_eq!(h.reply().await, Reply::Error("internal error".to_string()));
        assert!(!process_alive(pid));
        assert_eq!(h.status().await, Some(Status::Idle));
        assert_eq!(h.store.field("abc", "active").await.as_deref(), Some("0"));

        h.hang_up();
        let (store, _, _dir) = h.finished().await;
        assert_eq!(store.field("abc", "active").await.as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn never_more_than_one_transcoder_running() {
        let sink = tempfile::tempdir().unwrap();
        let mut h = harness_with(MemoryStore::default(), Some(counting_sink(sink.path())), false);
        let running = |dir: &std::path::Path| {
            spawned_pids(dir).into_iter().filter(|pid| process_alive(*pid)).count()
        };

        h.client.text(&start("a"));
        assert_eq!(h.reply().await, Reply::StreamStarted);
        wait_for_spawns(sink.path(), 1).await;
        assert_eq!(running(sink.path()), 1);

        h.client.text(&start("b"));
        assert_eq!(h.reply().await, Reply::StreamStarted);
        wait_for_spawns(sink.path(), 2).await;
        assert_eq!(running(sink.path()), 1);

        h.client.text(&start(""));
        assert_eq!(h.reply().await, Reply::Error("channelName is required".to_string()));
        assert_eq!(running(sink.path()), 0);

        h.client.text(&start("a"));
        assert_eq!(h.reply().await, Reply::StreamStarted);
        wait_for_spawns(sink.path(), 3).await;
        assert_eq!(running(sink.path()), 1);

        std::fs::remove_file(sink.path().join("transcoder")).unwrap();
        h.client.text(&start("a"));
        assert_eq!(h.reply().await, Reply::Error("internal error".to_string()));
        assert_eq!(running(sink.path()), 0);
        assert_eq!(spawned_pids(sink.path()).len(), 3);
        assert_eq!(h.store.field("a", "active").await.as_deref(), Some("0"));
        assert_eq!(h.store.field("b", "active").await.as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn frames_before_start_are_dropped() {
        let mut h = harness();

        h.client.binary(b"too early");
        h.client.text("{not json");
        h.client.text(r#"{"type":"offer","data":{}}"#);
        h.client.text(STOP);
        assert_eq!(h.reply().await, Reply::StreamStopped);
        assert_eq!(h.status().await, Some(Status::Idle));
        assert_eq!(h.pid().await, None);
        assert!(std::fs::read_dir(h.dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn restart_replaces_the_running_transcoder() {
        let mut h = harness();

        h.client.text(&start("first"));
        assert_eq!(h.reply().await, Reply::StreamStarted);
        let first = h.pid().await.unwrap();

        h.client.text(&start("second"));
        assert_eq!(h.reply().await, Reply::StreamStarted);
        let second = h.pid().await.unwrap();

        assert_ne!(first, second);
        assert!(!process_alive(first));
        assert!(process_alive(second));
        assert_eq!(h.store.field("first", "active").await.as_deref(), Some("0"));
        assert_eq!(h.store.field("second", "active").await.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn disconnect_mid_stream_cleans_up() {
        let mut h = harness();

        h.client.text(&start("abc"));
        assert_eq!(h.reply().await, Reply::StreamStarted);
        let pid = h.pid().await.unwrap();
        h.client.binary(b"partial");
        h.hang_up();

        let (store, server, _dir) = h.finished().await;
        assert!(!process_alive(pid));
        assert_eq!(store.field("abc", "active").await.as_deref(), Some("0"));
        assert!(store.field("abc", "lastActive").await.is_some());
        assert!(server.list().await.is_empty());
    }

    #[tokio::test]
    async fn disconnect_marks_inactive_while_the_transcoder_still_runs() {
        let mut h = harness();

        h.client.text(&start("abc"));
        assert_eq!(h.reply().await, Reply::StreamStarted);
        let pid = h.pid().await.unwrap();
        h.store.watch_pid.store(pid, Ordering::SeqCst);

        h.hang_up();
        let (store, _, _dir) = h.finished().await;
        assert_eq!(store.alive_at_mark().await, vec![true]);
        assert!(!process_alive(pid));
    }

    #[tokio::test]
    async fn write_error_marks_inactive_while_the_transcoder_still_runs() {
        // Closes its input but keeps running, so writes fail while the pid lives.
        let config = TranscoderConfig {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "exec 0<&-; exec sleep 30".to_string()],
            output_base: String::new(),
            stop_timeout: Duration::from_secs(1),
        };
        let mut h = harness_with(MemoryStore::default(), Some(config), false);

        h.client.text(&start("abc"));
        assert_eq!(h.reply().await, Reply::StreamStarted);
        let pid = h.pid().await.unwrap();
        h.store.watch_pid.store(pid, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        for _ in 0..8 {
            h.client.binary(&[0u8; 64 * 1024]);
        }

        let (store, _, _dir) = h.finished().await;
        assert_eq!(store.alive_at_mark().await, vec![true]);
        assert_eq!(store.field("abc", "active").await.as_deref(), Some("0"));
        assert!(!process_alive(pid));
    }

    #[tokio::test]
    async fn read_error_ends_the_session() {
        let mut h = harness();

        h.client.text(&start("abc"));
        assert_eq!(h.reply().await, Reply::StreamStarted);
        let pid = h.pid().await.unwrap();
        h.client
            .to_server
            .send(Err(RelayError::Connection("reset by peer".to_string())))
            .unwrap();

        let (store, _, _dir) = h.finished().await;
        assert!(!process_alive(pid));
        assert_eq!(store.field("abc", "active").await.as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn store_outage_at_start_aborts_the_session() {
        let store = MemoryStore::default();
        store.fail_upserts.store(true, Ordering::SeqCst);
        let mut h = harness_with(store, None, false);

        h.client.text(&start("abc"));
        assert_eq!(h.reply().await, Reply::Error("server error".to_string()));

        let (store, server, _dir) = h.finished().await;
        assert!(server.list().await.is_empty());
        assert!(!store.contains("abc").await);
    }

    #[tokio::test]
    async fn spawn_failure_keeps_the_session_idle() {
        let config = TranscoderConfig {
            program: "/nonexistent/transcoder".to_string(),
            ..TranscoderConfig::default()
        };
        let mut h = harness_with(MemoryStore::default(), Some(config), false);

        h.client.text(&start("abc"));
        assert_eq!(h.reply().await, Reply::Error("internal error".to_string()));
        assert_eq!(h.status().await, Some(Status::Idle));
        assert!(!h.store.contains("abc").await);

        h.client.binary(b"ignored");
        h.client.text(STOP);
        assert_eq!(h.reply().await, Reply::StreamStopped);
    }

    #[tokio::test]
    async fn broken_media_pipe_is_fatal() {
        let config = TranscoderConfig {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "exit 0".to_string()],
            output_base: String::new(),
            stop_timeout: Duration::from_secs(1),
        };
        let mut h = harness_with(MemoryStore::default(), Some(config), false);

        h.client.text(&start("abc"));
        assert_eq!(h.reply().await, Reply::StreamStarted);
        tokio::time::sleep(Duration::from_millis(200)).await;
        for _ in 0..64 {
            h.client.binary(&[0u8; 64 * 1024]);
        }

        let (store, _, _dir) = h.finished().await;
        assert_eq!(store.field("abc", "active").await.as_deref(), Some("0"));
    }
}
