//! Client-side notebook session.
//!
//! One [`NotebookSession`] per open notebook. It owns the local CRDT
//! replica, the websocket provider that keeps it synchronized with the
//! coordinator, the awareness registry, and the runtime state (execution
//! status, outputs, variables) that lives beside the document rather than
//! inside it.
//!
//! Bootstrap is strictly ordered: remote HTTP snapshot first, then the
//! blob store / local backup, then the seeded default — and only after
//! sanitization does the provider connect, so websocket traffic can never
//! race a half-seeded replica.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use uuid::Uuid;
use yrs::{Origin, Subscription};

use crate::awareness::{Awareness, AwarenessUpdate, ClientId};
use crate::blobstore::{BlobStoreClient, BlobStoreError, LocalBackup, StoredCell, StoredNotebook};
use crate::config::{ConfigError, KernelMode, SessionConfig};
use crate::document::{CellType, DocError, NotebookDoc, ORIGIN_LOCAL, ORIGIN_REMOTE};
use crate::kernel::{CellOutput, KernelClient, KernelError, KernelStatus, OutputType, Variable};
use crate::protocol::{
    encode_sync_step1, encode_sync_update, handle_sync_message, Message, SyncMessage,
};

/// Debounce for folding CRDT update bursts into one view refresh; one
/// animation frame.
const VIEW_REFRESH_DEBOUNCE: Duration = Duration::from_millis(16);

/// Websocket reconnect backoff bounds.
const RECONNECT_MIN: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Collaboration connection state as surfaced to the UI. `Fallback` is
/// informational, not terminal: the provider keeps retrying and a later
/// successful sync promotes it to `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollabStatus {
    Disabled,
    Connecting,
    Connected,
    Fallback,
}

/// Per-cell execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Success,
    Error,
}

/// Client-local state keyed by cell id; never CRDT-replicated and erased
/// when the cell disappears from the document.
#[derive(Debug, Clone, Default)]
pub struct RuntimeCellState {
    pub status: RunStatus,
    pub output: Option<CellOutput>,
    pub execution_count: Option<u32>,
    pub is_collapsed: bool,
}

/// What the UI renders for one cell: document fields plus runtime fields.
#[derive(Debug, Clone)]
pub struct CellView {
    pub id: String,
    pub cell_type: CellType,
    pub content: String,
    pub runtime: RuntimeCellState,
}

/// Events emitted toward the UI.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    CellsChanged,
    CollabStatus(CollabStatus),
    KernelStatus(KernelStatus),
    Peers(usize),
    Dirty,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("document error: {0}")]
    Document(String),
    #[error("no cell with id {0}")]
    CellNotFound(String),
    #[error("a notebook keeps at least one cell")]
    LastCell,
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error(transparent)]
    BlobStore(#[from] BlobStoreError),
}

impl From<DocError> for SessionError {
    fn from(e: DocError) -> Self {
        match e {
            DocError::LastCell => Self::LastCell,
            DocError::CellNotFound(id) => Self::CellNotFound(id),
            other => Self::Document(other.to_string()),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Presence payload each peer writes into awareness.
fn presence_state(user_name: &str, nonce: &str) -> String {
    serde_json::json!({
        "user": { "name": user_name, "nonce": nonce },
        "hb": now_ms(),
    })
    .to_string()
}

fn presence_nonce(state: &str) -> String {
    serde_json::from_str::<serde_json::Value>(state)
        .ok()
        .and_then(|v| {
            v.get("user")
                .and_then(|u| u.get("nonce"))
                .and_then(|n| n.as_str())
                .map(str::to_owned)
        })
        .unwrap_or_default()
}

/// The peer that performs external persistence this tick: numerically
/// smallest active client id, ties broken lexicographically on the session
/// nonce carried in the presence state.
pub(crate) fn elect_leader(states: &[(ClientId, String)]) -> Option<(ClientId, String)> {
    states
        .iter()
        .map(|(id, state)| (*id, presence_nonce(state)))
        .min()
}

struct Shared {
    doc: NotebookDoc,
    awareness: Awareness,
    views: Vec<CellView>,
    runtime: HashMap<String, RuntimeCellState>,
    active_cell: Option<String>,
    dirty: bool,
    bootstrap_done: bool,
    refresh_pending: bool,
    synced_once: bool,
    collab_status: CollabStatus,
    kernel_status: KernelStatus,
    kernel_message: Option<String>,
    execution_count: u32,
    variables: Vec<Variable>,
    peer_count: usize,
}

type SharedHandle = Arc<Mutex<Shared>>;

fn lock(shared: &SharedHandle) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

/// One open notebook: CRDT replica + provider + runtime state.
pub struct NotebookSession {
    notebook_id: String,
    config: SessionConfig,
    nonce: String,
    shared: SharedHandle,
    events_tx: UnboundedSender<SessionEvent>,
    events_rx: Option<UnboundedReceiver<SessionEvent>>,
    outbound_tx: UnboundedSender<Vec<u8>>,
    kernel: Option<KernelClient>,
    blob: Option<Arc<BlobStoreClient>>,
    backup: Option<Arc<LocalBackup>>,
    tasks: Vec<JoinHandle<()>>,
    _doc_hook: Subscription,
}

impl NotebookSession {
    /// Bootstrap a session for `notebook_id` following the strict seeding
    /// order, then (when collaboration is configured) connect the provider.
    pub async fn bootstrap(
        config: SessionConfig,
        notebook_id: impl Into<String>,
    ) -> Result<Self, SessionError> {
        let notebook_id = notebook_id.into();
        let nonce = Uuid::new_v4().simple().to_string();
        let collab = config.collab_active();

        let doc = NotebookDoc::new();
        let (update_tx, mut update_rx) = mpsc::unbounded_channel();
        let doc_hook = doc.observe_updates(update_tx)?;
        let local_id = doc.client_id();

        let blob = match config.notebook_store_url.as_deref().filter(|u| !u.is_empty()) {
            Some(url) => Some(Arc::new(BlobStoreClient::new(url)?)),
            None => None,
        };
        let backup = config.backup_dir.clone().map(|d| Arc::new(LocalBackup::new(d)));

        let kernel = match (config.kernel_mode, config.backend_kernel_url.as_deref()) {
            (KernelMode::Backend, Some(url)) if !url.is_empty() => Some(KernelClient::new(url)?),
            _ => None,
        };

        let mut collab_status = if collab {
            CollabStatus::Connecting
        } else {
            CollabStatus::Disabled
        };

        // Step 3: remote HTTP snapshot, with the configured watchdog.
        let mut seeded_from_remote = false;
        if collab {
            let url = config.snapshot_url(&notebook_id)?;
            let timeout = Duration::from_millis(config.collab_connect_timeout_ms);
            match fetch_snapshot(&url, timeout).await {
                Ok(bytes) if !bytes.is_empty() => {
                    match doc.apply_update(&bytes, ORIGIN_REMOTE) {
                        Ok(()) => seeded_from_remote = true,
                        Err(e) => {
                            log::warn!("bootstrap: remote snapshot rejected: {e}");
                            collab_status = CollabStatus::Fallback;
                        }
                    }
                }
                Ok(_) => collab_status = CollabStatus::Fallback,
                Err(e) => {
                    log::info!("bootstrap: remote snapshot unavailable ({e}); using fallback");
                    collab_status = CollabStatus::Fallback;
                }
            }
        }

        // Step 4: blob store, then local backup, then the default template.
        if !seeded_from_remote {
            match load_stored(&blob, &backup, &notebook_id).await {
                Some(stored) => stored.apply_to_doc(&doc),
                None => doc.seed_default(ORIGIN_LOCAL),
            }
        } else if doc.is_default_template() {
            // Step 5: the coordinator only has the seeded default, but a
            // real notebook exists in storage — promote it.
            if let Some(stored) = load_stored(&blob, &backup, &notebook_id).await {
                if !stored.is_default_template() {
                    log::info!("bootstrap: promoting stored notebook {notebook_id} to collaborative");
                    stored.apply_to_doc(&doc);
                }
            }
        }

        // Step 6: client-side sanitization; storage payloads may carry
        // duplicate ids or scalar content.
        doc.sanitize();

        let shared = Arc::new(Mutex::new(Shared {
            doc,
            awareness: Awareness::new(local_id),
            views: Vec::new(),
            runtime: HashMap::new(),
            active_cell: None,
            dirty: false,
            bootstrap_done: false,
            refresh_pending: false,
            synced_once: false,
            collab_status,
            kernel_status: KernelStatus::Disconnected,
            kernel_message: None,
            execution_count: 0,
            variables: Vec::new(),
            peer_count: 1,
        }));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let mut session = Self {
            notebook_id,
            config,
            nonce,
            shared,
            events_tx,
            events_rx: Some(events_rx),
            outbound_tx,
            kernel,
            blob,
            backup,
            tasks: Vec::new(),
            _doc_hook: doc_hook,
        };

        // Step 7: open the gate for dirty-marking, then let traffic flow.
        // Updates emitted while seeding must not count as user edits (nor
        // be replayed to the provider — the handshake carries them).
        while update_rx.try_recv().is_ok() {}
        lock(&session.shared).bootstrap_done = true;
        refresh_views(&session.shared, &session.events_tx);

        session.spawn_update_pump(update_rx);
        session.spawn_heartbeat();
        session.spawn_autosave();
        if collab {
            session.spawn_provider(outbound_rx);
            session.spawn_connect_watchdog();
        }
        Ok(session)
    }

    // ─── background tasks ───────────────────────────────────────────

    fn spawn_update_pump(&mut self, mut update_rx: UnboundedReceiver<(Option<Origin>, Vec<u8>)>) {
        let shared = self.shared.clone();
        let events = self.events_tx.clone();
        let outbound = self.outbound_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            let remote: Origin = ORIGIN_REMOTE.into();
            while let Some((origin, update)) = update_rx.recv().await {
                let schedule_refresh = {
                    let mut s = lock(&shared);
                    if s.bootstrap_done {
                        if !s.dirty {
                            s.dirty = true;
                            let _ = events.send(SessionEvent::Dirty);
                        }
                        // Remote updates came from the provider; echoing
                        // them back would loop.
                        if origin.as_ref() != Some(&remote) {
                            let _ = outbound.send(encode_sync_update(update));
                        }
                    }
                    if s.refresh_pending {
                        false
                    } else {
                        s.refresh_pending = true;
                        true
                    }
                };
                if schedule_refresh {
                    let shared = shared.clone();
                    let events = events.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(VIEW_REFRESH_DEBOUNCE).await;
                        refresh_views(&shared, &events);
                    });
                }
            }
        }));
    }

    fn spawn_provider(&mut self, mut outbound_rx: UnboundedReceiver<Vec<u8>>) {
        let shared = self.shared.clone();
        let events = self.events_tx.clone();
        let ws_url = match self.config.ws_url(&self.notebook_id) {
            Ok(url) => url,
            Err(e) => {
                log::error!("provider: bad websocket URL: {e}");
                return;
            }
        };
        self.tasks.push(tokio::spawn(async move {
            let mut backoff = RECONNECT_MIN;
            loop {
                match tokio_tungstenite::connect_async(ws_url.as_str()).await {
                    Ok((stream, _)) => {
                        backoff = RECONNECT_MIN;
                        let (mut sink, mut reader) = stream.split();

                        // Announce our state vector; the server does the
                        // same and each side fills the other's gaps.
                        let step1 = {
                            let s = lock(&shared);
                            encode_sync_step1(s.doc.doc())
                        };
                        if sink
                            .send(tokio_tungstenite::tungstenite::Message::Binary(step1.into()))
                            .await
                            .is_err()
                        {
                            tokio::time::sleep(backoff).await;
                            continue;
                        }
                        // Re-announce presence after a reconnect.
                        let presence = {
                            let mut s = lock(&shared);
                            let current = s.awareness.local_state().map(str::to_owned);
                            current.map(|state| {
                                let update = s.awareness.set_local_state(state);
                                Message::Awareness(update.encode()).encode()
                            })
                        };
                        if let Some(frame) = presence {
                            let _ = sink
                                .send(tokio_tungstenite::tungstenite::Message::Binary(frame.into()))
                                .await;
                        }

                        loop {
                            tokio::select! {
                                frame = outbound_rx.recv() => match frame {
                                    Some(frame) => {
                                        if sink
                                            .send(tokio_tungstenite::tungstenite::Message::Binary(frame.into()))
                                            .await
                                            .is_err()
                                        {
                                            break;
                                        }
                                    }
                                    // Session dropped; stop for good.
                                    None => return,
                                },
                                message = reader.next() => match message {
                                    Some(Ok(tokio_tungstenite::tungstenite::Message::Binary(data))) => {
                                        let data: Vec<u8> = data.into();
                                        if let Some(reply) = handle_server_frame(&shared, &events, &data) {
                                            if sink
                                                .send(tokio_tungstenite::tungstenite::Message::Binary(reply.into()))
                                                .await
                                                .is_err()
                                            {
                                                break;
                                            }
                                        }
                                    }
                                    Some(Ok(tokio_tungstenite::tungstenite::Message::Close(_))) | None => break,
                                    Some(Err(_)) => break,
                                    Some(Ok(_)) => {}
                                }
                            }
                        }
                        log::debug!("provider: connection lost, retrying");
                    }
                    Err(e) => {
                        log::debug!("provider: connect failed ({e}); retrying");
                    }
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_MAX);
            }
        }));
    }

    /// `connecting → fallback` after the configured window without a sync.
    fn spawn_connect_watchdog(&mut self) {
        let shared = self.shared.clone();
        let events = self.events_tx.clone();
        let window = Duration::from_millis(self.config.collab_connect_timeout_ms);
        self.tasks.push(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let fell_back = {
                let mut s = lock(&shared);
                if !s.synced_once && s.collab_status == CollabStatus::Connecting {
                    s.collab_status = CollabStatus::Fallback;
                    true
                } else {
                    false
                }
            };
            if fell_back {
                let _ = events.send(SessionEvent::CollabStatus(CollabStatus::Fallback));
            }
        }));
    }

    fn spawn_heartbeat(&mut self) {
        let shared = self.shared.clone();
        let events = self.events_tx.clone();
        let outbound = self.outbound_tx.clone();
        let user_name = self.config.user_name.clone();
        let nonce = self.nonce.clone();
        let period = Duration::from_millis(self.config.heartbeat_interval_ms);
        let stale = Duration::from_millis(self.config.awareness_stale_ms);
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let (frame, count) = {
                    let mut s = lock(&shared);
                    let update = s.awareness.set_local_state(presence_state(&user_name, &nonce));
                    let frame = Message::Awareness(update.encode()).encode();
                    let count = s.awareness.active_clients(stale).len().max(1);
                    s.peer_count = count;
                    (frame, count)
                };
                let _ = outbound.send(frame);
                let _ = events.send(SessionEvent::Peers(count));
            }
        }));
    }

    fn spawn_autosave(&mut self) {
        let shared = self.shared.clone();
        let blob = self.blob.clone();
        let backup = self.backup.clone();
        let notebook_id = self.notebook_id.clone();
        let nonce = self.nonce.clone();
        let period = Duration::from_millis(self.config.autosave_interval_ms);
        let stale = Duration::from_millis(self.config.awareness_stale_ms);
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // the immediate tick; nothing is dirty yet
            loop {
                ticker.tick().await;
                let work = {
                    let mut s = lock(&shared);
                    if !s.dirty || !s.bootstrap_done {
                        None
                    } else {
                        s.dirty = false;
                        let payload = build_stored(&s, &notebook_id);
                        let leads = is_leader(&s, &nonce, stale);
                        Some((payload, leads))
                    }
                };
                let Some((payload, leads)) = work else {
                    continue;
                };
                // Every client writes the local backup; only the elected
                // leader touches the shared blob store.
                if let Some(backup) = &backup {
                    if let Err(e) = backup.save(&notebook_id, &payload) {
                        log::warn!("autosave: local backup failed: {e}");
                    }
                }
                if leads {
                    if let Some(blob) = &blob {
                        if let Err(e) = blob.save(&notebook_id, &payload).await {
                            log::warn!("autosave: blob store save failed: {e}");
                            lock(&shared).dirty = true;
                        }
                    }
                }
            }
        }));
    }

    // ─── reads ──────────────────────────────────────────────────────

    pub fn notebook_id(&self) -> &str {
        &self.notebook_id
    }

    pub fn client_id(&self) -> ClientId {
        lock(&self.shared).doc.client_id()
    }

    /// Take the event receiver; can only be done once.
    pub fn take_events(&mut self) -> Option<UnboundedReceiver<SessionEvent>> {
        self.events_rx.take()
    }

    pub fn title(&self) -> String {
        lock(&self.shared).doc.title_string()
    }

    pub fn views(&self) -> Vec<CellView> {
        lock(&self.shared).views.clone()
    }

    pub fn active_cell(&self) -> Option<String> {
        lock(&self.shared).active_cell.clone()
    }

    pub fn collab_status(&self) -> CollabStatus {
        lock(&self.shared).collab_status
    }

    pub fn kernel_status(&self) -> KernelStatus {
        lock(&self.shared).kernel_status
    }

    /// The remediation message for the last kernel failure, if any.
    pub fn kernel_message(&self) -> Option<String> {
        lock(&self.shared).kernel_message.clone()
    }

    pub fn peer_count(&self) -> usize {
        lock(&self.shared).peer_count
    }

    pub fn is_dirty(&self) -> bool {
        lock(&self.shared).dirty
    }

    pub fn execution_count(&self) -> u32 {
        lock(&self.shared).execution_count
    }

    pub fn variables(&self) -> Vec<Variable> {
        lock(&self.shared).variables.clone()
    }

    // ─── document mutations ─────────────────────────────────────────

    pub fn set_active_cell(&self, id: &str) {
        let mut s = lock(&self.shared);
        if s.doc.find_cell_index(id).is_some() {
            s.active_cell = Some(id.to_string());
        }
    }

    /// Insert a fresh cell after `after_id` (or at the end); returns its id.
    pub fn insert_cell(&self, after_id: Option<&str>, cell_type: CellType) -> String {
        let s = lock(&self.shared);
        s.doc.insert_cell(ORIGIN_LOCAL, after_id, cell_type)
    }

    pub fn delete_cell(&self, id: &str) -> Result<(), SessionError> {
        let s = lock(&self.shared);
        s.doc.delete_cell(ORIGIN_LOCAL, id)?;
        Ok(())
    }

    pub fn move_cell(&self, id: &str, new_index: u32) -> Result<(), SessionError> {
        let s = lock(&self.shared);
        s.doc.move_cell(ORIGIN_LOCAL, id, new_index)?;
        Ok(())
    }

    /// Switch a cell between code and markdown; stale execution state makes
    /// no sense across the switch, so it is cleared.
    pub fn set_cell_type(&self, id: &str, cell_type: CellType) -> Result<(), SessionError> {
        {
            let mut s = lock(&self.shared);
            s.doc.set_cell_type(ORIGIN_LOCAL, id, cell_type)?;
            if let Some(runtime) = s.runtime.get_mut(id) {
                runtime.status = RunStatus::Idle;
                runtime.output = None;
                runtime.execution_count = None;
            }
        }
        refresh_views(&self.shared, &self.events_tx);
        Ok(())
    }

    pub fn update_cell_content(&self, id: &str, next: &str) -> Result<(), SessionError> {
        let s = lock(&self.shared);
        s.doc.set_cell_content(ORIGIN_LOCAL, id, next)?;
        Ok(())
    }

    pub fn update_title(&self, next: &str) {
        let s = lock(&self.shared);
        s.doc.set_title(ORIGIN_LOCAL, next);
    }

    // ─── kernel operations ──────────────────────────────────────────

    /// Probe the kernel and settle into `Idle` or `Disconnected`.
    pub async fn connect_kernel(&self) {
        let Some(kernel) = &self.kernel else {
            let mut s = lock(&self.shared);
            s.kernel_status = KernelStatus::Disconnected;
            if self.config.kernel_mode == KernelMode::Backend {
                s.kernel_message = Some("no kernel URL configured".to_string());
            }
            return;
        };

        self.set_kernel_status(KernelStatus::Loading, None);
        match kernel.health().await {
            Ok(health) => {
                log::info!(
                    "kernel ready: {}",
                    health.name.as_deref().unwrap_or("backend kernel")
                );
                self.set_kernel_status(KernelStatus::Idle, None);
            }
            Err(KernelError::Misconfigured(message)) => {
                log::error!("kernel misconfigured: {message}");
                self.set_kernel_status(KernelStatus::Disconnected, Some(message));
            }
            Err(e) => {
                self.set_kernel_status(KernelStatus::Disconnected, Some(e.to_string()));
            }
        }
    }

    /// Execute one cell. The code is read from the CRDT at dispatch time,
    /// not from the cached view. Kernel failures stay inside this cell's
    /// output.
    pub async fn run_cell(&self, cell_id: &str, advance: bool) -> Result<(), SessionError> {
        let code = {
            let s = lock(&self.shared);
            s.doc
                .cells_snapshot()
                .into_iter()
                .find(|c| c.id == cell_id)
                .map(|c| c.content)
                .ok_or_else(|| SessionError::CellNotFound(cell_id.to_string()))?
        };

        let Some(kernel) = &self.kernel else {
            let mut s = lock(&self.shared);
            let runtime = s.runtime.entry(cell_id.to_string()).or_default();
            runtime.status = RunStatus::Error;
            runtime.output = Some(CellOutput::error("no kernel connected"));
            drop(s);
            refresh_views(&self.shared, &self.events_tx);
            return Ok(());
        };

        {
            let mut s = lock(&self.shared);
            let runtime = s.runtime.entry(cell_id.to_string()).or_default();
            runtime.status = RunStatus::Running;
            runtime.output = None;
            s.kernel_status = KernelStatus::Busy;
        }
        let _ = self.events_tx.send(SessionEvent::KernelStatus(KernelStatus::Busy));
        refresh_views(&self.shared, &self.events_tx);

        let result = kernel.execute(&code).await;
        {
            let mut s = lock(&self.shared);
            match result {
                Ok(output) => {
                    s.execution_count += 1;
                    let count = s.execution_count;
                    let runtime = s.runtime.entry(cell_id.to_string()).or_default();
                    runtime.status = if output.output_type == OutputType::Error {
                        RunStatus::Error
                    } else {
                        RunStatus::Success
                    };
                    runtime.output = Some(output);
                    runtime.execution_count = Some(count);
                    s.kernel_status = KernelStatus::Idle;
                }
                Err(KernelError::Misconfigured(message)) => {
                    let runtime = s.runtime.entry(cell_id.to_string()).or_default();
                    runtime.status = RunStatus::Error;
                    runtime.output = Some(CellOutput::error(message.clone()));
                    s.kernel_status = KernelStatus::Disconnected;
                    s.kernel_message = Some(message);
                }
                Err(e) => {
                    let runtime = s.runtime.entry(cell_id.to_string()).or_default();
                    runtime.status = RunStatus::Error;
                    runtime.output = Some(CellOutput::error(e.to_string()));
                    s.kernel_status = KernelStatus::Idle;
                }
            }
            s.dirty = true;
        }
        let status = self.kernel_status();
        let _ = self.events_tx.send(SessionEvent::KernelStatus(status));
        refresh_views(&self.shared, &self.events_tx);

        self.refresh_variables().await;

        if advance {
            let next = {
                let s = lock(&self.shared);
                let cells = s.doc.cells_snapshot();
                cells
                    .iter()
                    .position(|c| c.id == cell_id)
                    .and_then(|i| cells.get(i + 1))
                    .map(|c| c.id.clone())
            };
            match next {
                Some(id) => self.set_active_cell(&id),
                None => {
                    let id = self.insert_cell(Some(cell_id), CellType::Code);
                    let mut s = lock(&self.shared);
                    s.active_cell = Some(id);
                }
            }
        }
        Ok(())
    }

    /// Refresh the variable inspector; failures just leave the old list.
    pub async fn refresh_variables(&self) {
        let Some(kernel) = &self.kernel else {
            return;
        };
        match kernel.variables().await {
            Ok(variables) => {
                lock(&self.shared).variables = variables;
            }
            Err(e) => log::debug!("variables refresh failed: {e}"),
        }
    }

    pub async fn restart_kernel(&self) {
        let Some(kernel) = &self.kernel else {
            return;
        };
        self.set_kernel_status(KernelStatus::Starting, None);
        match kernel.restart().await {
            Ok(()) => {
                {
                    let mut s = lock(&self.shared);
                    s.execution_count = 0;
                    s.variables.clear();
                }
                self.set_kernel_status(KernelStatus::Idle, None);
            }
            Err(e) => self.set_kernel_status(KernelStatus::Disconnected, Some(e.to_string())),
        }
    }

    pub fn interrupt_kernel(&self) {
        if let Some(kernel) = &self.kernel {
            kernel.interrupt();
        }
    }

    fn set_kernel_status(&self, status: KernelStatus, message: Option<String>) {
        {
            let mut s = lock(&self.shared);
            s.kernel_status = status;
            if message.is_some() {
                s.kernel_message = message;
            }
        }
        let _ = self.events_tx.send(SessionEvent::KernelStatus(status));
    }

    /// Force one save tick now (e.g. before navigating away).
    pub async fn save_now(&self) -> Result<(), SessionError> {
        let payload = {
            let mut s = lock(&self.shared);
            s.dirty = false;
            build_stored(&s, &self.notebook_id)
        };
        if let Some(backup) = &self.backup {
            backup.save(&self.notebook_id, &payload)?;
        }
        if let Some(blob) = &self.blob {
            blob.save(&self.notebook_id, &payload).await?;
        }
        Ok(())
    }
}

impl Drop for NotebookSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ─── free helpers shared with the background tasks ──────────────────

async fn fetch_snapshot(url: &str, timeout: Duration) -> Result<Vec<u8>, SessionError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| SessionError::Document(e.to_string()))?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| SessionError::Document(e.to_string()))?;
    if !response.status().is_success() {
        return Err(SessionError::Document(format!(
            "snapshot fetch returned {}",
            response.status()
        )));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| SessionError::Document(e.to_string()))?;
    Ok(bytes.to_vec())
}

async fn load_stored(
    blob: &Option<Arc<BlobStoreClient>>,
    backup: &Option<Arc<LocalBackup>>,
    notebook_id: &str,
) -> Option<StoredNotebook> {
    if let Some(blob) = blob {
        match blob.load(notebook_id).await {
            Ok(stored) => return Some(stored),
            Err(BlobStoreError::NotFound) => {}
            Err(e) => log::info!("blob store load failed: {e}"),
        }
    }
    if let Some(backup) = backup {
        match backup.load(notebook_id) {
            Ok(stored) => return Some(stored),
            Err(BlobStoreError::NotFound) => {}
            Err(e) => log::info!("local backup load failed: {e}"),
        }
    }
    None
}

/// Handle one frame from the coordinator; returns a reply frame if one is
/// due. The first step 2 (or update) flips the session to `Connected`,
/// including from `Fallback`.
fn handle_server_frame(
    shared: &SharedHandle,
    events: &UnboundedSender<SessionEvent>,
    data: &[u8],
) -> Option<Vec<u8>> {
    match Message::decode(data) {
        Ok(Message::Sync(sync)) => {
            let is_data_sync = matches!(sync, SyncMessage::Step2(_) | SyncMessage::Update(_));
            let remote: Origin = ORIGIN_REMOTE.into();
            let (reply, newly_connected) = {
                let mut s = lock(shared);
                let reply = match handle_sync_message(s.doc.doc(), sync, Some(&remote)) {
                    Ok(reply) => reply,
                    Err(e) => {
                        log::debug!("provider: dropping sync frame: {e}");
                        return None;
                    }
                };
                let newly_connected = if is_data_sync && !s.synced_once {
                    s.synced_once = true;
                    if s.collab_status != CollabStatus::Connected {
                        s.collab_status = CollabStatus::Connected;
                        true
                    } else {
                        false
                    }
                } else {
                    false
                };
                (reply, newly_connected)
            };
            if newly_connected {
                let _ = events.send(SessionEvent::CollabStatus(CollabStatus::Connected));
            }
            reply
        }
        Ok(Message::Awareness(payload)) => {
            match AwarenessUpdate::decode(&payload) {
                Ok(update) => {
                    let count = {
                        let mut s = lock(shared);
                        s.awareness.apply_update(update);
                        // Staleness pruning happens against the heartbeat
                        // config; use the default threshold here.
                        let count = s
                            .awareness
                            .active_clients(Duration::from_millis(
                                crate::config::DEFAULT_AWARENESS_STALE_MS,
                            ))
                            .len()
                            .max(1);
                        s.peer_count = count;
                        count
                    };
                    let _ = events.send(SessionEvent::Peers(count));
                }
                Err(e) => log::debug!("provider: dropping awareness frame: {e}"),
            }
            None
        }
        Ok(Message::Auth) => None,
        Err(e) => {
            log::debug!("provider: dropping malformed frame: {e}");
            None
        }
    }
}

fn refresh_views(shared: &SharedHandle, events: &UnboundedSender<SessionEvent>) {
    {
        let mut s = lock(shared);
        s.refresh_pending = false;
        let cells = s.doc.cells_snapshot();

        // Runtime state for vanished cells is erased.
        s.runtime
            .retain(|id, _| cells.iter().any(|c| &c.id == id));

        let mut views = Vec::with_capacity(cells.len());
        for cell in cells {
            let runtime = s.runtime.entry(cell.id.clone()).or_default().clone();
            views.push(CellView {
                id: cell.id,
                cell_type: cell.cell_type,
                content: cell.content,
                runtime,
            });
        }
        s.views = views;

        let active_still_present = s
            .active_cell
            .as_ref()
            .map(|id| s.views.iter().any(|v| &v.id == id))
            .unwrap_or(false);
        if !active_still_present {
            s.active_cell = s.views.first().map(|v| v.id.clone());
        }
    }
    let _ = events.send(SessionEvent::CellsChanged);
}

fn is_leader(s: &Shared, nonce: &str, stale: Duration) -> bool {
    let active = s.awareness.active_clients(stale);
    let local = s.awareness.local_id();
    let states: Vec<(ClientId, String)> = s
        .awareness
        .states()
        .filter(|(id, _)| active.contains(id))
        .map(|(id, state)| (id, state.to_string()))
        .collect();
    match elect_leader(&states) {
        // Alone (or presence not announced yet): we persist.
        None => true,
        Some((id, winner_nonce)) => id == local && winner_nonce == nonce,
    }
}

fn build_stored(s: &Shared, notebook_id: &str) -> StoredNotebook {
    let cells = s
        .doc
        .cells_snapshot()
        .into_iter()
        .map(|cell| {
            let runtime = s.runtime.get(&cell.id);
            StoredCell {
                id: cell.id,
                cell_type: cell.cell_type.as_str().to_string(),
                content: cell.content,
                output: runtime.and_then(|r| r.output.clone()),
                execution_count: runtime.and_then(|r| r.execution_count),
            }
        })
        .collect();
    StoredNotebook {
        id: Some(notebook_id.to_string()),
        title: s.doc.title_string(),
        cells,
        variables: s.variables.clone(),
    }
}
