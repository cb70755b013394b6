//! Client-side document replica.
//!
//! A [`ClientDoc`] keeps two engines:
//!
//! ```text
//!   base     mirror of the server state, replaced on every (re)connect
//!   changes  local edits not yet acknowledged, keyed by local seq
//!
//!   tree = materialize(base ⊕ changes)
//! ```
//!
//! Local edits land in `changes` at the current seq. Every tick, anything
//! in `changes` newer than the last sent seq goes out as one `update` and
//! the seq advances. When the server answers with `replyTo = n`, every
//! change up to `n` is folded into `base` by the server's broadcast and
//! dropped from `changes`.
//!
//! Connection state machine:
//!
//! ```text
//!            connect()            first serverUpdate
//!   Closed ───────────► Connecting ─────► Ready ──┐
//!     ▲                      │                    │ transport closed,
//!     └──── backoff ◄────────┴────────────────────┘ error, heartbeat timeout
//! ```

use std::sync::Arc;
use std::time::Duration;

use canopy_core::{collect_working_changesets, Changeset, DocTree, DocTreeCollector, InsertPosition, WorkingChangeset};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::backoff::BackoffConfig;
use crate::handshake::{ConnectError, Connector};
use crate::persistence::{ClientDocPersistence, ClientSave, PersistenceError};
use crate::protocol::{Awareness, ClientInfo, Msg, ProtocolError};
use crate::transport::{Transport, TransportSender};

/// Client document configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Send loop period.
    pub tick: Duration,
    /// Send an empty update every this many ticks when idle.
    pub heartbeat_ticks: u64,
    /// Close the transport after this many ticks without a server message.
    pub heartbeat_timeout_ticks: u64,
    /// Upper bound on connect plus handshake.
    pub auth_timeout: Duration,
    pub backoff: BackoffConfig,
    /// Seed for idx generation and backoff jitter; entropy when `None`.
    pub seed: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(10),
            heartbeat_ticks: 1000,
            heartbeat_timeout_ticks: 3000,
            auth_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
            seed: None,
        }
    }
}

impl ClientConfig {
    pub fn for_testing() -> Self {
        Self {
            tick: Duration::from_millis(2),
            heartbeat_ticks: 100,
            heartbeat_timeout_ticks: 1000,
            auth_timeout: Duration::from_secs(2),
            backoff: BackoffConfig::for_testing(),
            seed: None,
        }
    }
}

/// Observable sync state of a [`ClientDoc`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStatus {
    /// Some state is available, from local persistence or the server.
    pub loaded: bool,
    pub connected: bool,
    /// Local entries the server has not acknowledged.
    pub unsynced_changes: usize,
    /// When the next connection attempt is due, while disconnected.
    pub reconnect_at: Option<Instant>,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("document is closed")]
    Closed,
}

enum Command {
    Add {
        position: InsertPosition,
        reply: oneshot::Sender<String>,
    },
    Move {
        node: String,
        position: InsertPosition,
        reply: oneshot::Sender<()>,
    },
    Set {
        node: String,
        key: String,
        value: Value,
        reply: oneshot::Sender<()>,
    },
    Delete {
        node: String,
        reply: oneshot::Sender<()>,
    },
    SetAwareness {
        awareness: Awareness,
        reply: oneshot::Sender<()>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

enum Internal {
    Loaded(Result<Option<ClientSave>, PersistenceError>),
    Connected {
        gen: u64,
        result: Result<Transport, ConnectError>,
    },
    Inbound {
        gen: u64,
        msg: Msg,
    },
    TransportClosed {
        gen: u64,
    },
}

/// Handle to an open client document. Cheap to clone; the document closes
/// when [`close`](Self::close) is called or every handle is dropped.
#[derive(Clone)]
pub struct ClientDoc {
    client_id: Arc<str>,
    doc_id: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    tree: watch::Receiver<Arc<DocTree>>,
    peers: watch::Receiver<Vec<ClientInfo>>,
    awareness: watch::Receiver<Awareness>,
    status: watch::Receiver<ClientStatus>,
}

impl std::fmt::Debug for ClientDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientDoc")
            .field("client_id", &self.client_id)
            .field("doc_id", &self.doc_id)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl ClientDoc {
    /// Open `doc_id`: start loading local state and connecting through
    /// `connector`. Must be called inside a tokio runtime.
    pub fn open(
        doc_id: impl Into<String>,
        connector: Arc<dyn Connector>,
        persistence: Arc<dyn ClientDocPersistence>,
        config: ClientConfig,
    ) -> Self {
        let client_id: Arc<str> = Arc::from(format!("c:{}", Uuid::new_v4()));
        let doc_id: Arc<str> = Arc::from(doc_id.into());

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (tree_tx, tree_rx) = watch::channel(DocTree::empty());
        let (peers_tx, peers_rx) = watch::channel(Vec::new());
        let (awareness_tx, awareness_rx) = watch::channel(Awareness::new());
        let (status_tx, status_rx) = watch::channel(ClientStatus::default());

        let (saves_tx, saver) = spawn_saver(Arc::clone(&doc_id), Arc::clone(&persistence));

        let loader_tx = internal_tx.clone();
        let loader_id = Arc::clone(&doc_id);
        tokio::spawn(async move {
            let result = persistence.load(&loader_id).await;
            let _ = loader_tx.send(Internal::Loaded(result));
        });

        let seed = config.seed;
        let actor = ClientActor {
            client_id: Arc::clone(&client_id),
            doc_id: Arc::clone(&doc_id),
            connector,
            rng: rng_from(seed, 0),
            base: WorkingChangeset::with_rng(rng_from(seed, 1)),
            changes: WorkingChangeset::with_rng(rng_from(seed, 2)),
            collector: DocTreeCollector::new(),
            tree: DocTree::empty(),
            node: 0,
            seq: 1,
            seq_sent: 0,
            seq_acked: 0,
            conn: Conn::Closed {
                reconnect_at: Instant::now(),
            },
            gen: 0,
            failures: 0,
            rejected: false,
            tick: 0,
            load_done: false,
            persistence_loaded: false,
            transport_loaded: false,
            save_pending: false,
            awareness: Awareness::new(),
            has_unsent_awareness: true,
            peers: Vec::new(),
            internal: internal_tx,
            saves: Some(saves_tx),
            saver: Some(saver),
            tree_tx,
            peers_tx,
            awareness_tx,
            status_tx,
            config,
        };
        tokio::spawn(actor.run(commands_rx, internal_rx));

        Self {
            client_id,
            doc_id,
            commands: commands_tx,
            tree: tree_rx,
            peers: peers_rx,
            awareness: awareness_rx,
            status: status_rx,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Current materialized tree, local edits included.
    pub fn tree(&self) -> Arc<DocTree> {
        self.tree.borrow().clone()
    }

    /// Notified when the tree changes identity.
    pub fn subscribe_tree(&self) -> watch::Receiver<Arc<DocTree>> {
        self.tree.clone()
    }

    /// Other clients on the document, as last reported by the server.
    pub fn peers(&self) -> Vec<ClientInfo> {
        self.peers.borrow().clone()
    }

    pub fn subscribe_peers(&self) -> watch::Receiver<Vec<ClientInfo>> {
        self.peers.clone()
    }

    pub fn awareness(&self) -> Awareness {
        self.awareness.borrow().clone()
    }

    pub fn subscribe_awareness(&self) -> watch::Receiver<Awareness> {
        self.awareness.clone()
    }

    pub fn status(&self) -> ClientStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ClientStatus> {
        self.status.clone()
    }

    /// Create a node at `position` and return its id.
    pub async fn add(&self, position: InsertPosition) -> Result<String, ClientError> {
        self.request(|reply| Command::Add { position, reply }).await
    }

    pub async fn move_node(&self, node: impl Into<String>, position: InsertPosition) -> Result<(), ClientError> {
        let node = node.into();
        self.request(|reply| Command::Move { node, position, reply }).await
    }

    pub async fn set(
        &self,
        node: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), ClientError> {
        let (node, key, value) = (node.into(), key.into(), value.into());
        self.request(|reply| Command::Set { node, key, value, reply }).await
    }

    /// Delete `node` and its descendants.
    pub async fn delete(&self, node: impl Into<String>) -> Result<(), ClientError> {
        let node = node.into();
        self.request(|reply| Command::Delete { node, reply }).await
    }

    pub async fn set_awareness(&self, awareness: Awareness) -> Result<(), ClientError> {
        self.request(|reply| Command::SetAwareness { awareness, reply }).await
    }

    /// Stop syncing. Returns after the last local save has been written.
    pub async fn close(&self) {
        let _ = self.request(|reply| Command::Close { reply }).await;
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(make(reply)).map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)
    }
}

fn rng_from(seed: Option<u64>, stream: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
        None => StdRng::from_entropy(),
    }
}

/// Background writer that only keeps the newest pending save.
fn spawn_saver(
    doc_id: Arc<str>,
    persistence: Arc<dyn ClientDocPersistence>,
) -> (mpsc::UnboundedSender<ClientSave>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ClientSave>();
    let handle = tokio::spawn(async move {
        while let Some(mut save) = rx.recv().await {
            while let Ok(newer) = rx.try_recv() {
                save = newer;
            }
            if let Err(e) = persistence.save(&doc_id, &save).await {
                log::error!("doc {doc_id}: failed to save local state: {e}");
            }
        }
    });
    (tx, handle)
}

enum Conn {
    Connecting {
        gen: u64,
    },
    Ready {
        gen: u64,
        sender: TransportSender,
        got_update: bool,
        last_recv_tick: u64,
    },
    Closed {
        reconnect_at: Instant,
    },
    Stopped,
}

struct ClientActor {
    client_id: Arc<str>,
    doc_id: Arc<str>,
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    rng: StdRng,

    base: WorkingChangeset,
    changes: WorkingChangeset,
    collector: DocTreeCollector,
    tree: Arc<DocTree>,

    node: u64,
    seq: u64,
    seq_sent: u64,
    seq_acked: u64,

    conn: Conn,
    gen: u64,
    failures: u32,
    rejected: bool,
    tick: u64,

    load_done: bool,
    persistence_loaded: bool,
    transport_loaded: bool,
    save_pending: bool,

    awareness: Awareness,
    has_unsent_awareness: bool,
    peers: Vec<ClientInfo>,

    internal: mpsc::UnboundedSender<Internal>,
    saves: Option<mpsc::UnboundedSender<ClientSave>>,
    saver: Option<JoinHandle<()>>,

    tree_tx: watch::Sender<Arc<DocTree>>,
    peers_tx: watch::Sender<Vec<ClientInfo>>,
    awareness_tx: watch::Sender<Awareness>,
    status_tx: watch::Sender<ClientStatus>,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl ClientActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.publish();

        let mut closers = Vec::new();
        loop {
            let reconnect_at = match self.conn {
                Conn::Closed { reconnect_at } => Some(reconnect_at),
                _ => None,
            };
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Close { reply }) => {
                        closers.push(reply);
                        break;
                    }
                    Some(cmd) => self.on_command(cmd),
                    None => break,
                },
                Some(event) = internal.recv() => self.on_internal(event),
                _ = ticker.tick() => self.send_tick(),
                _ = sleep_until(reconnect_at) => self.connect(),
            }
        }

        self.shutdown(&mut internal).await;
        for reply in closers {
            let _ = reply.send(());
        }
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Add { position, reply } => {
                self.node += 1;
                let id = format!("oid:{}:{}", self.client_id, self.node);
                let (parent, idx) = position.resolve(&mut self.rng, &self.tree);
                self.change(
                    Changeset::empty()
                        .with_create([id.as_str()])
                        .with_position(id.as_str(), parent, idx),
                );
                let _ = reply.send(id);
            }
            Command::Move { node, position, reply } => {
                let (parent, idx) = position.resolve(&mut self.rng, &self.tree);
                self.change(Changeset::empty().with_position(node, parent, idx));
                let _ = reply.send(());
            }
            Command::Set { node, key, value, reply } => {
                self.change(Changeset::empty().with_property(node, key, value));
                let _ = reply.send(());
            }
            Command::Delete { node, reply } => {
                self.change(Changeset::empty().with_delete([node]));
                let _ = reply.send(());
            }
            Command::SetAwareness { awareness, reply } => {
                self.awareness = awareness;
                self.has_unsent_awareness = true;
                self.publish();
                let _ = reply.send(());
            }
            Command::Close { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn change(&mut self, cs: Changeset) {
        self.changes.change(&cs, self.seq);
        self.save();
        self.publish();
    }

    fn on_internal(&mut self, event: Internal) {
        match event {
            Internal::Loaded(result) => self.on_loaded(result),
            Internal::Connected { gen, result } => self.on_connected(gen, result),
            Internal::Inbound { gen, msg } => self.on_message(gen, msg),
            Internal::TransportClosed { gen } => self.on_transport_closed(gen),
        }
    }

    fn on_loaded(&mut self, result: Result<Option<ClientSave>, PersistenceError>) {
        self.load_done = true;
        match result {
            Ok(Some(save)) => {
                self.persistence_loaded = true;
                if !self.transport_loaded {
                    log::info!("doc {}: local state loaded before server state", self.doc_id);
                    self.base.clear();
                    self.base.change(&save.base, 0);
                }
                self.changes.change(&save.changes, self.seq);
                log::info!("doc {}: restored {} local changes", self.doc_id, save.changes.size());
            }
            Ok(None) => {
                self.persistence_loaded = true;
                log::info!("doc {}: no local save", self.doc_id);
            }
            Err(e) => log::error!("doc {}: failed to load local state: {e}", self.doc_id),
        }
        if self.save_pending {
            self.save();
        }
        self.publish();
    }

    fn connect(&mut self) {
        self.seq_sent = self.seq_acked;
        self.gen += 1;
        let gen = self.gen;
        self.conn = Conn::Connecting { gen };
        self.publish();

        let connector = Arc::clone(&self.connector);
        let doc_id = Arc::clone(&self.doc_id);
        let internal = self.internal.clone();
        let timeout = self.config.auth_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, connector.connect(&doc_id)).await {
                Ok(result) => result,
                Err(_) => Err(ProtocolError::Timeout.into()),
            };
            let _ = internal.send(Internal::Connected { gen, result });
        });
    }

    fn on_connected(&mut self, gen: u64, result: Result<Transport, ConnectError>) {
        if !matches!(self.conn, Conn::Connecting { gen: current } if current == gen) {
            if let Ok(transport) = result {
                transport.close();
            }
            return;
        }

        let transport = match result {
            Ok(transport) => transport,
            Err(e) => {
                log::warn!("doc {}: connect failed: {e}", self.doc_id);
                self.failures += 1;
                self.schedule_reconnect();
                return;
            }
        };

        let (sender, mut receiver) = transport.split();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            while let Some(msg) = receiver.recv().await {
                if internal.send(Internal::Inbound { gen, msg }).is_err() {
                    return;
                }
            }
            let _ = internal.send(Internal::TransportClosed { gen });
        });

        log::info!("doc {}: connected as {}", self.doc_id, self.client_id);
        // The server starts every session with empty awareness.
        self.has_unsent_awareness = true;
        self.conn = Conn::Ready {
            gen,
            sender,
            got_update: false,
            last_recv_tick: self.tick,
        };
        self.publish();
    }

    fn on_message(&mut self, gen: u64, msg: Msg) {
        let tick = self.tick;
        let Conn::Ready {
            gen: current,
            sender,
            got_update,
            last_recv_tick,
        } = &mut self.conn
        else {
            return;
        };
        if *current != gen {
            return;
        }
        *last_recv_tick = tick;

        match msg {
            Msg::ServerUpdate {
                reply_to,
                clients,
                changeset,
                ..
            } => {
                let is_load = !*got_update;
                *got_update = true;
                if is_load {
                    self.transport_loaded = true;
                }
                // After a server rejection only an acknowledged write proves
                // the connection healthy.
                if (is_load && !self.rejected) || reply_to.is_some() {
                    if self.failures > 0 {
                        log::info!("doc {}: connection healthy, clearing {} failures", self.doc_id, self.failures);
                    }
                    self.failures = 0;
                    self.rejected = false;
                }
                self.on_server_update(is_load, reply_to, clients, changeset);
            }
            Msg::Error { error } => {
                log::warn!("doc {}: server error {error:?}, reconnecting", self.doc_id);
                sender.close();
                self.failures += 1;
                self.rejected = true;
            }
            other => log::debug!("doc {}: ignoring {}", self.doc_id, other.kind()),
        }
    }

    fn on_server_update(
        &mut self,
        is_load: bool,
        reply_to: Option<u64>,
        clients: Vec<ClientInfo>,
        changeset: Option<Changeset>,
    ) {
        if is_load {
            self.base.clear();
        }
        let changed = changeset.is_some() || reply_to.is_some();
        if let Some(cs) = &changeset {
            self.base.change(cs, 0);
        }
        if let Some(reply_to) = reply_to {
            self.seq_acked = self.seq_acked.max(reply_to);
            self.changes.remove_changes_before(reply_to + 1);
        }
        if changed {
            self.save();
        }
        self.peers = clients;
        self.publish();
    }

    fn on_transport_closed(&mut self, gen: u64) {
        let Conn::Ready { gen: current, got_update, .. } = &self.conn else {
            return;
        };
        if *current != gen {
            return;
        }
        if !*got_update {
            self.failures += 1;
        }
        log::info!("doc {}: transport closed", self.doc_id);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.config.backoff.delay(self.failures, &mut self.rng);
        log::info!(
            "doc {}: reconnecting in {delay:?} after {} failures",
            self.doc_id,
            self.failures
        );
        self.conn = Conn::Closed {
            reconnect_at: Instant::now() + delay,
        };
        self.publish();
    }

    fn send_tick(&mut self) {
        self.tick += 1;
        let tick = self.tick;
        let Conn::Ready {
            sender, last_recv_tick, ..
        } = &self.conn
        else {
            return;
        };

        if tick.saturating_sub(*last_recv_tick) > self.config.heartbeat_timeout_ticks {
            log::warn!("doc {}: no server message for {} ticks", self.doc_id, tick - *last_recv_tick);
            sender.close();
            return;
        }

        let changeset = self.changes.collect(Some(self.seq_sent));
        if !changeset.is_empty() {
            let seq = self.seq;
            sender.send(Msg::Update {
                awareness: self.awareness.clone(),
                seq: Some(seq),
                changeset: Some(changeset),
            });
            self.seq += 1;
            self.seq_sent = seq;
        } else if self.has_unsent_awareness || tick % self.config.heartbeat_ticks.max(1) == 0 {
            sender.send(Msg::Update {
                awareness: self.awareness.clone(),
                seq: None,
                changeset: None,
            });
        }
        self.has_unsent_awareness = false;
    }

    fn save(&mut self) {
        if !self.load_done {
            self.save_pending = true;
            return;
        }
        self.save_pending = false;
        let save = ClientSave {
            base: self.base.collect(None),
            changes: self.changes.collect(None),
        };
        if let Some(saves) = &self.saves {
            let _ = saves.send(save);
        }
    }

    /// Recompute derived state and notify watchers of what changed.
    fn publish(&mut self) {
        let merged = collect_working_changesets([&self.base, &self.changes]);
        let tree = self.collector.collect(&merged);
        if !Arc::ptr_eq(&tree, &self.tree) {
            self.tree = Arc::clone(&tree);
            self.tree_tx.send_replace(tree);
        }

        let peers = &self.peers;
        self.peers_tx.send_if_modified(|current| {
            if current == peers {
                return false;
            }
            current.clone_from(peers);
            true
        });

        let awareness = &self.awareness;
        self.awareness_tx.send_if_modified(|current| {
            if current == awareness {
                return false;
            }
            current.clone_from(awareness);
            true
        });

        let status = ClientStatus {
            loaded: self.transport_loaded || self.persistence_loaded,
            connected: matches!(self.conn, Conn::Ready { got_update: true, .. }),
            unsynced_changes: self.changes.size(),
            reconnect_at: match self.conn {
                Conn::Closed { reconnect_at } => Some(reconnect_at),
                _ => None,
            },
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    async fn shutdown(&mut self, internal: &mut mpsc::UnboundedReceiver<Internal>) {
        if let Conn::Ready { sender, .. } = &self.conn {
            sender.close();
        }
        self.conn = Conn::Stopped;

        // A pending save must not overwrite local state that was never loaded.
        while !self.load_done {
            match internal.recv().await {
                Some(Internal::Loaded(result)) => self.on_loaded(result),
                Some(Internal::Connected { result: Ok(transport), .. }) => transport.close(),
                Some(_) => {}
                None => break,
            }
        }
        self.saves = None;
        if let Some(saver) = self.saver.take() {
            let _ = saver.await;
        }
        self.publish();
        log::info!("doc {}: client {} closed", self.doc_id, self.client_id);
    }
}
