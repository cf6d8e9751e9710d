//! Per-notebook synchronization coordinator.
//!
//! One coordinator actor per notebook id owns the authoritative document,
//! the awareness registry, and every attached socket. All document
//! mutations happen inside the actor task, so updates broadcast in exactly
//! the order they were applied and the originating socket never hears its
//! own echo.
//!
//! ```text
//! socket A ──┐                       ┌── outbound A
//!            ├─► Command queue ──► actor ──┤
//! socket B ──┘        │                 └── outbound B
//!                     │  Doc + Awareness
//!                     ▼
//!             persistence alarm (≥1s, coalesced)
//!                     │
//!                     ▼
//!               SnapshotStore
//! ```
//!
//! Cold start is strictly hydrate → sanitize → hook install → ready; the
//! [`Registry`] holds concurrent activations behind one lock so no request
//! can observe a half-initialized document.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, Mutex};
use yrs::{Origin, Subscription};

use crate::awareness::{Awareness, AwarenessUpdate, ClientId};
use crate::document::{DocError, NotebookDoc, ORIGIN_SANITIZE};
use crate::protocol::{
    encode_sync_step1, encode_sync_update, handle_sync_message, Message, ProtocolError,
};
use crate::storage::{SnapshotStore, StoreError};

/// Debounce window for snapshot persistence.
const PERSIST_DEBOUNCE: Duration = Duration::from_secs(1);

/// Command queue depth per coordinator.
const COMMAND_CAPACITY: usize = 64;

/// Identifies one attached socket within a coordinator.
pub type SocketId = u64;

/// Coordinator errors.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("document error: {0}")]
    Document(#[from] DocError),
    #[error("coordinator evicted")]
    Evicted,
    #[error("blocking task failed: {0}")]
    Join(String),
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoordinatorStats {
    pub sockets: usize,
    pub frames_routed: u64,
    pub updates_broadcast: u64,
    pub snapshots_written: u64,
}

enum Command {
    Attach {
        outbound: UnboundedSender<Vec<u8>>,
        reply: oneshot::Sender<SocketId>,
    },
    Frame {
        socket: SocketId,
        data: Vec<u8>,
    },
    Detach {
        socket: SocketId,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<u8>>,
    },
    Stats {
        reply: oneshot::Sender<CoordinatorStats>,
    },
}

/// Cloneable handle to a running coordinator actor.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    /// Register a socket. Frames the coordinator produces for it arrive on
    /// `outbound`, starting with sync step 1.
    pub async fn attach(
        &self,
        outbound: UnboundedSender<Vec<u8>>,
    ) -> Result<SocketId, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Attach { outbound, reply })
            .await
            .map_err(|_| CoordinatorError::Evicted)?;
        rx.await.map_err(|_| CoordinatorError::Evicted)
    }

    /// Route one inbound frame from `socket`.
    pub async fn frame(&self, socket: SocketId, data: Vec<u8>) -> Result<(), CoordinatorError> {
        self.tx
            .send(Command::Frame { socket, data })
            .await
            .map_err(|_| CoordinatorError::Evicted)
    }

    pub async fn detach(&self, socket: SocketId) -> Result<(), CoordinatorError> {
        self.tx
            .send(Command::Detach { socket })
            .await
            .map_err(|_| CoordinatorError::Evicted)
    }

    /// Full document state as an encoded update.
    pub async fn snapshot(&self) -> Result<Vec<u8>, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| CoordinatorError::Evicted)?;
        rx.await.map_err(|_| CoordinatorError::Evicted)
    }

    pub async fn stats(&self) -> Result<CoordinatorStats, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Stats { reply })
            .await
            .map_err(|_| CoordinatorError::Evicted)?;
        rx.await.map_err(|_| CoordinatorError::Evicted)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct SocketState {
    outbound: UnboundedSender<Vec<u8>>,
    origin: Origin,
    /// Awareness client ids announced through this socket; exactly these
    /// are removed on close.
    controlled: Vec<ClientId>,
}

struct Coordinator {
    notebook_id: String,
    doc: NotebookDoc,
    awareness: Awareness,
    sockets: HashMap<SocketId, SocketState>,
    next_socket: SocketId,
    store: Arc<SnapshotStore>,
    persist_pending: bool,
    persist_at: Option<tokio::time::Instant>,
    stats: CoordinatorStats,
    served_sockets: bool,
    _update_hook: Subscription,
}

impl Coordinator {
    /// Hydrate, sanitize, install the update hook, then start the actor.
    /// Returns only once the coordinator is ready to take frames.
    pub async fn activate(
        notebook_id: String,
        store: Arc<SnapshotStore>,
    ) -> Result<CoordinatorHandle, CoordinatorError> {
        let loaded = {
            let store = store.clone();
            let id = notebook_id.clone();
            tokio::task::spawn_blocking(move || store.load(&id))
                .await
                .map_err(|e| CoordinatorError::Join(e.to_string()))?
        };

        let doc = NotebookDoc::new();
        let mut must_persist = false;
        match loaded {
            Ok(Some(snapshot)) => {
                if let Err(e) = doc.apply_update(&snapshot, ORIGIN_SANITIZE) {
                    log::error!("notebook {notebook_id}: snapshot rejected ({e}); reseeding");
                    doc.seed_default(ORIGIN_SANITIZE);
                    must_persist = true;
                }
            }
            Ok(None) => {
                log::info!("notebook {notebook_id}: no snapshot, seeding default");
                doc.seed_default(ORIGIN_SANITIZE);
                must_persist = true;
            }
            Err(e) => {
                log::error!("notebook {notebook_id}: snapshot load failed ({e}); seeding default");
                doc.seed_default(ORIGIN_SANITIZE);
                must_persist = true;
            }
        }
        if doc.sanitize() {
            must_persist = true;
        }
        if must_persist {
            let snapshot = doc.encode_snapshot();
            let store_w = store.clone();
            let id = notebook_id.clone();
            let write = tokio::task::spawn_blocking(move || store_w.save(&id, &snapshot))
                .await
                .map_err(|e| CoordinatorError::Join(e.to_string()))?;
            if let Err(e) = write {
                log::error!("notebook {notebook_id}: initial persist failed: {e}");
            }
        }

        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let hook = doc.observe_updates(update_tx)?;
        let local_id = doc.client_id();

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let coordinator = Coordinator {
            notebook_id,
            doc,
            awareness: Awareness::new(local_id),
            sockets: HashMap::new(),
            next_socket: 1,
            store,
            persist_pending: false,
            persist_at: None,
            stats: CoordinatorStats::default(),
            served_sockets: false,
            _update_hook: hook,
        };
        tokio::spawn(coordinator.run(cmd_rx, update_rx));
        Ok(CoordinatorHandle { tx: cmd_tx })
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut update_rx: UnboundedReceiver<(Option<Origin>, Vec<u8>)>,
    ) {
        loop {
            let deadline = self.persist_at;
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                update = update_rx.recv() => {
                    if let Some((origin, bytes)) = update {
                        self.on_update(origin, bytes);
                    }
                }
                _ = async move {
                    match deadline {
                        Some(t) => tokio::time::sleep_until(t).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.persist_async();
                }
            }

            // The hosting process evicts an idle coordinator once its last
            // socket detaches; the registry re-activates on demand.
            if self.served_sockets && self.sockets.is_empty() {
                break;
            }
        }

        // Drain any updates committed but not yet observed, then take a
        // final snapshot so eviction never loses state.
        while update_rx.try_recv().is_ok() {}
        self.persist_blocking().await;
        log::info!("notebook {}: coordinator evicted", self.notebook_id);
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Attach { outbound, reply } => {
                let socket = self.on_attach(outbound);
                let _ = reply.send(socket);
            }
            Command::Frame { socket, data } => self.on_frame(socket, data),
            Command::Detach { socket } => self.on_detach(socket),
            Command::Snapshot { reply } => {
                let _ = reply.send(self.doc.encode_snapshot());
            }
            Command::Stats { reply } => {
                let mut stats = self.stats;
                stats.sockets = self.sockets.len();
                let _ = reply.send(stats);
            }
        }
    }

    fn on_attach(&mut self, outbound: UnboundedSender<Vec<u8>>) -> SocketId {
        // Cheap and idempotent; a joining client's first sync must already
        // see valid cell ids.
        self.doc.sanitize();

        let socket = self.next_socket;
        self.next_socket += 1;
        let origin: Origin = format!("socket-{socket}").as_str().into();

        let _ = outbound.send(encode_sync_step1(self.doc.doc()));
        if !self.awareness.is_empty() {
            let frame = Message::Awareness(self.awareness.full_update().encode()).encode();
            let _ = outbound.send(frame);
        }

        self.sockets.insert(
            socket,
            SocketState {
                outbound,
                origin,
                controlled: Vec::new(),
            },
        );
        self.served_sockets = true;
        log::debug!(
            "notebook {}: socket {socket} attached ({} online)",
            self.notebook_id,
            self.sockets.len()
        );
        socket
    }

    fn on_frame(&mut self, socket: SocketId, data: Vec<u8>) {
        let Some(state) = self.sockets.get(&socket) else {
            return;
        };
        self.stats.frames_routed += 1;
        let origin = state.origin.clone();
        let outbound = state.outbound.clone();

        match Message::decode(&data) {
            Ok(Message::Sync(sync)) => {
                match handle_sync_message(self.doc.doc(), sync, Some(&origin)) {
                    Ok(Some(reply)) => {
                        let _ = outbound.send(reply);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        log::debug!(
                            "notebook {}: dropping sync frame from socket {socket}: {e}",
                            self.notebook_id
                        );
                    }
                }
            }
            Ok(Message::Awareness(payload)) => match AwarenessUpdate::decode(&payload) {
                Ok(update) => self.on_awareness(socket, update, data),
                Err(e) => {
                    log::debug!(
                        "notebook {}: dropping awareness frame from socket {socket}: {e}",
                        self.notebook_id
                    );
                }
            },
            Ok(Message::Auth) => {}
            Err(ProtocolError::UnknownType(t)) => {
                log::debug!(
                    "notebook {}: ignoring frame type {t} from socket {socket}",
                    self.notebook_id
                );
            }
            Err(e) => {
                log::debug!(
                    "notebook {}: dropping malformed frame from socket {socket}: {e}",
                    self.notebook_id
                );
            }
        }
    }

    fn on_awareness(&mut self, socket: SocketId, update: AwarenessUpdate, frame: Vec<u8>) {
        let event = self.awareness.apply_update(update);
        if event.is_empty() {
            return;
        }

        if let Some(state) = self.sockets.get_mut(&socket) {
            for id in &event.added {
                if !state.controlled.contains(id) {
                    state.controlled.push(*id);
                }
            }
            state.controlled.retain(|id| !event.removed.contains(id));
        }

        self.broadcast_except(Some(socket), frame);
    }

    /// Update hook: fan out to every socket except the origin, then arm the
    /// coalesced persistence alarm.
    fn on_update(&mut self, origin: Option<Origin>, bytes: Vec<u8>) {
        self.stats.updates_broadcast += 1;
        let frame = encode_sync_update(bytes);
        let origin_socket = origin.and_then(|o| {
            self.sockets
                .iter()
                .find(|(_, s)| s.origin == o)
                .map(|(id, _)| *id)
        });
        self.broadcast_except(origin_socket, frame);
        self.schedule_persist();
    }

    fn broadcast_except(&self, skip: Option<SocketId>, frame: Vec<u8>) {
        for (id, state) in &self.sockets {
            if Some(*id) == skip {
                continue;
            }
            let _ = state.outbound.send(frame.clone());
        }
    }

    fn on_detach(&mut self, socket: SocketId) {
        let Some(state) = self.sockets.remove(&socket) else {
            return;
        };
        if !state.controlled.is_empty() {
            if let Some(update) = self.awareness.remove_clients(&state.controlled) {
                let frame = Message::Awareness(update.encode()).encode();
                self.broadcast_except(None, frame);
            }
        }
        log::debug!(
            "notebook {}: socket {socket} detached ({} online)",
            self.notebook_id,
            self.sockets.len()
        );
    }

    fn schedule_persist(&mut self) {
        // Rescheduling while an alarm is pending is a no-op; that is what
        // coalesces bursts into one write.
        if !self.persist_pending {
            self.persist_pending = true;
            self.persist_at = Some(tokio::time::Instant::now() + PERSIST_DEBOUNCE);
        }
    }

    /// Alarm handler. Clears the pending flag before writing so an update
    /// landing mid-write arms a follow-up alarm.
    fn persist_async(&mut self) {
        self.persist_pending = false;
        self.persist_at = None;
        self.stats.snapshots_written += 1;
        let snapshot = self.doc.encode_snapshot();
        let store = self.store.clone();
        let id = self.notebook_id.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.save(&id, &snapshot) {
                log::error!("notebook {id}: snapshot persist failed: {e}");
            }
        });
    }

    async fn persist_blocking(&mut self) {
        self.persist_pending = false;
        self.persist_at = None;
        let snapshot = self.doc.encode_snapshot();
        let store = self.store.clone();
        let id = self.notebook_id.clone();
        let result = tokio::task::spawn_blocking(move || store.save(&id, &snapshot)).await;
        match result {
            Ok(Err(e)) => log::error!(
                "notebook {}: final snapshot persist failed: {e}",
                self.notebook_id
            ),
            Err(e) => log::error!(
                "notebook {}: final snapshot persist task failed: {e}",
                self.notebook_id
            ),
            Ok(Ok(())) => {}
        }
    }
}

/// Process-wide map from notebook id to its single live coordinator.
///
/// The lock is held across activation on purpose: concurrent requests for
/// the same notebook converge on one instance and wait out the cold start
/// instead of observing a half-initialized document.
pub struct Registry {
    store: Arc<SnapshotStore>,
    coordinators: Mutex<HashMap<String, CoordinatorHandle>>,
}

impl Registry {
    pub fn new(store: Arc<SnapshotStore>) -> Self {
        Self {
            store,
            coordinators: Mutex::new(HashMap::new()),
        }
    }

    /// The live coordinator for `notebook_id`, activating (or re-activating
    /// after eviction) as needed.
    pub async fn coordinator(&self, notebook_id: &str) -> Result<CoordinatorHandle, CoordinatorError> {
        let mut map = self.coordinators.lock().await;
        if let Some(handle) = map.get(notebook_id) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }
        let handle = Coordinator::activate(notebook_id.to_string(), self.store.clone()).await?;
        map.insert(notebook_id.to_string(), handle.clone());
        Ok(handle)
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{CellType, DEFAULT_TITLE, ORIGIN_LOCAL, ORIGIN_REMOTE};
    use crate::protocol::SyncMessage;
    use crate::storage::StoreConfig;
    use tokio::sync::mpsc::unbounded_channel;

    fn test_store() -> Arc<SnapshotStore> {
        Arc::new(SnapshotStore::open(StoreConfig::in_memory()).unwrap())
    }

    async fn recv_frame(rx: &mut UnboundedReceiver<Vec<u8>>) -> Message {
        let data = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbound channel closed");
        Message::decode(&data).unwrap()
    }

    #[tokio::test]
    async fn test_activation_seeds_and_persists_default() {
        let store = test_store();
        let registry = Registry::new(store.clone());
        let handle = registry.coordinator("nb1").await.unwrap();

        let snapshot = handle.snapshot().await.unwrap();
        assert!(!snapshot.is_empty());

        let doc = NotebookDoc::new();
        doc.apply_update(&snapshot, ORIGIN_REMOTE).unwrap();
        assert_eq!(doc.title_string(), DEFAULT_TITLE);
        assert_eq!(doc.cell_count(), 2);

        // The default was persisted during cold start.
        assert!(store.load("nb1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_first_frame_is_sync_step1() {
        let registry = Registry::new(test_store());
        let handle = registry.coordinator("nb").await.unwrap();

        let (tx, mut rx) = unbounded_channel();
        handle.attach(tx).await.unwrap();

        match recv_frame(&mut rx).await {
            Message::Sync(SyncMessage::Step1(sv)) => assert!(!sv.is_empty()),
            other => panic!("expected step1 first, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_update_broadcast_skips_origin() {
        let registry = Registry::new(test_store());
        let handle = registry.coordinator("nb").await.unwrap();

        let (tx_a, mut rx_a) = unbounded_channel();
        let a = handle.attach(tx_a).await.unwrap();
        let (tx_b, mut rx_b) = unbounded_channel();
        let b = handle.attach(tx_b).await.unwrap();

        // Drain handshake frames.
        let _ = recv_frame(&mut rx_a).await;
        let _ = recv_frame(&mut rx_b).await;

        // A sends an update.
        let client = NotebookDoc::new();
        client.seed_default(ORIGIN_LOCAL);
        client.set_title(ORIGIN_LOCAL, "from A");
        let frame = encode_sync_update(client.encode_snapshot());
        handle.frame(a, frame).await.unwrap();

        // B receives it; A must not.
        match recv_frame(&mut rx_b).await {
            Message::Sync(SyncMessage::Update(update)) => {
                let doc = NotebookDoc::new();
                doc.apply_update(&update, ORIGIN_REMOTE).unwrap();
                assert_eq!(doc.title_string(), "from A");
            }
            other => panic!("expected update, got {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            rx_a.try_recv().is_err(),
            "origin socket must not receive its own update"
        );

        handle.detach(a).await.unwrap();
        handle.detach(b).await.unwrap();
    }

    #[tokio::test]
    async fn test_step1_gets_step2_reply_to_origin_only() {
        let registry = Registry::new(test_store());
        let handle = registry.coordinator("nb").await.unwrap();

        let (tx, mut rx) = unbounded_channel();
        let socket = handle.attach(tx).await.unwrap();
        let _ = recv_frame(&mut rx).await; // step1

        let client = NotebookDoc::new();
        let step1 = Message::Sync(SyncMessage::Step1(client.encode_state_vector())).encode();
        handle.frame(socket, step1).await.unwrap();

        match recv_frame(&mut rx).await {
            Message::Sync(SyncMessage::Step2(update)) => {
                client.apply_update(&update, ORIGIN_REMOTE).unwrap();
                assert_eq!(client.title_string(), DEFAULT_TITLE);
            }
            other => panic!("expected step2, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_awareness_rebroadcast_and_close_cleanup() {
        let registry = Registry::new(test_store());
        let handle = registry.coordinator("nb").await.unwrap();

        let (tx_a, mut rx_a) = unbounded_channel();
        let a = handle.attach(tx_a).await.unwrap();
        let _ = recv_frame(&mut rx_a).await; // step1

        // A announces presence for client 42.
        let update = AwarenessUpdate {
            entries: vec![crate::awareness::AwarenessEntry {
                client_id: 42,
                clock: 1,
                state: Some(r#"{"user":{"name":"a"},"hb":1}"#.into()),
            }],
        };
        let frame = Message::Awareness(update.encode()).encode();
        handle.frame(a, frame).await.unwrap();

        // A joining socket now receives the awareness roster after step1.
        let (tx_b, mut rx_b) = unbounded_channel();
        let b = handle.attach(tx_b).await.unwrap();
        let _ = recv_frame(&mut rx_b).await; // step1
        match recv_frame(&mut rx_b).await {
            Message::Awareness(payload) => {
                let roster = AwarenessUpdate::decode(&payload).unwrap();
                assert_eq!(roster.entries.len(), 1);
                assert_eq!(roster.entries[0].client_id, 42);
            }
            other => panic!("expected awareness roster, got {other:?}"),
        }

        // Closing A removes exactly its announced client ids; B hears it.
        handle.detach(a).await.unwrap();
        match recv_frame(&mut rx_b).await {
            Message::Awareness(payload) => {
                let removal = AwarenessUpdate::decode(&payload).unwrap();
                assert_eq!(removal.entries.len(), 1);
                assert_eq!(removal.entries[0].client_id, 42);
                assert!(removal.entries[0].state.is_none());
            }
            other => panic!("expected awareness removal, got {other:?}"),
        }

        handle.detach(b).await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_kill_socket() {
        let registry = Registry::new(test_store());
        let handle = registry.coordinator("nb").await.unwrap();

        let (tx, mut rx) = unbounded_channel();
        let socket = handle.attach(tx).await.unwrap();
        let _ = recv_frame(&mut rx).await; // step1

        handle.frame(socket, vec![0xff, 0xff, 0xff]).await.unwrap();

        // The socket still works: a step1 still earns a step2.
        let client = NotebookDoc::new();
        let step1 = Message::Sync(SyncMessage::Step1(client.encode_state_vector())).encode();
        handle.frame(socket, step1).await.unwrap();
        assert!(matches!(
            recv_frame(&mut rx).await,
            Message::Sync(SyncMessage::Step2(_))
        ));
    }

    #[tokio::test]
    async fn test_persist_then_rehydrate_roundtrip() {
        let store = test_store();
        {
            let registry = Registry::new(store.clone());
            let handle = registry.coordinator("nb").await.unwrap();

            let (tx, mut rx) = unbounded_channel();
            let socket = handle.attach(tx).await.unwrap();
            let _ = recv_frame(&mut rx).await;

            let client = NotebookDoc::new();
            client.apply_update(&handle.snapshot().await.unwrap(), ORIGIN_REMOTE).unwrap();
            client.set_title(ORIGIN_LOCAL, "Hello");
            client
                .set_cell_content(
                    ORIGIN_LOCAL,
                    &client.cells_snapshot()[0].id,
                    "print(\"hi\")",
                )
                .unwrap();
            let frame = encode_sync_update(client.encode_snapshot());
            handle.frame(socket, frame).await.unwrap();

            // Wait out the persistence debounce, then detach (which also
            // persists on eviction).
            tokio::time::sleep(Duration::from_millis(1500)).await;
            handle.detach(socket).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        // Fresh registry, same store: rehydrates the edited document.
        let registry = Registry::new(store);
        let handle = registry.coordinator("nb").await.unwrap();
        let doc = NotebookDoc::new();
        doc.apply_update(&handle.snapshot().await.unwrap(), ORIGIN_REMOTE).unwrap();
        assert_eq!(doc.title_string(), "Hello");
        assert_eq!(doc.cells_snapshot()[0].content, "print(\"hi\")");
    }

    #[tokio::test]
    async fn test_hydrate_sanitizes_duplicate_ids() {
        let store = test_store();
        // Persist a snapshot with colliding cell ids.
        let dirty = NotebookDoc::new();
        {
            let mut txn = dirty.transact_with(ORIGIN_LOCAL);
            dirty.insert_cell_raw(&mut txn, 0, "dup", CellType::Code, "a");
            dirty.insert_cell_raw(&mut txn, 1, "dup", CellType::Code, "b");
        }
        store.save("nb", &dirty.encode_snapshot()).unwrap();

        let registry = Registry::new(store);
        let handle = registry.coordinator("nb").await.unwrap();
        let doc = NotebookDoc::new();
        doc.apply_update(&handle.snapshot().await.unwrap(), ORIGIN_REMOTE).unwrap();

        let cells = doc.cells_snapshot();
        assert_eq!(cells.len(), 2);
        assert_ne!(cells[0].id, cells[1].id);
    }

    #[tokio::test]
    async fn test_registry_reuses_live_coordinator() {
        let registry = Registry::new(test_store());
        let a = registry.coordinator("nb").await.unwrap();
        let b = registry.coordinator("nb").await.unwrap();
        // Same actor: both handles feed one command queue.
        assert!(!a.is_closed());
        assert!(!b.is_closed());
        let s1 = a.snapshot().await.unwrap();
        let s2 = b.snapshot().await.unwrap();
        assert_eq!(s1, s2);
    }
}
