//! Authoritative per-document sync state.
//!
//! ```text
//!   transport A ── recv task ──┐
//!   transport B ── recv task ──┼──► events (bounded) ──► DocActor
//!   ServerDoc handle ──────────┘                           │
//!                                   WorkingChangeset ◄─────┤ apply authoritatively
//!                                   persistence     ◄──────┤ save full state
//!                                   sessions        ◄──────┘ debounced serverUpdate
//! ```
//!
//! One task owns the engine and every session. Receive tasks and the
//! public handle only talk to it through the event queue, so updates from
//! all clients are applied in receipt order.

use std::collections::{BTreeMap, HashMap};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use canopy_core::{Changeset, DocTree, DocTreeCollector, WorkingChangeset};
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::handshake::Admitted;
use crate::persistence::{PersistenceError, ServerDocPersistence};
use crate::protocol::{Awareness, Authz, ClientInfo, ErrorCode, Msg, UserInfo};
use crate::transport::{Transport, TransportSender};

/// Server document configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Delay between the first change and the broadcast that carries it.
    pub broadcast_debounce: Duration,
    /// Sessions silent for longer than this are closed.
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    /// Capacity of the event queue shared by all receive tasks.
    pub inbound_capacity: usize,
    /// Close the document once its last session leaves.
    pub close_when_empty: bool,
    /// Seed for idx conflict resolution; entropy when `None`.
    pub seed: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            broadcast_debounce: Duration::from_millis(5),
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(1),
            inbound_capacity: 256,
            close_when_empty: true,
            seed: None,
        }
    }
}

impl ServerConfig {
    pub fn for_testing() -> Self {
        Self {
            broadcast_debounce: Duration::from_millis(1),
            idle_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(100),
            inbound_capacity: 64,
            close_when_empty: true,
            seed: Some(7),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("client {0} is already connected")]
    DuplicateClient(String),
    #[error("document is closed")]
    Closed,
}

enum Event {
    Connect {
        client_id: String,
        admitted: Admitted,
        transport: Transport,
        reply: oneshot::Sender<Result<(), ServerError>>,
    },
    Inbound {
        client_id: String,
        conn: u64,
        msg: Msg,
    },
    Disconnected {
        client_id: String,
        conn: u64,
    },
    Snapshot {
        reply: oneshot::Sender<Changeset>,
    },
    Clients {
        reply: oneshot::Sender<Vec<ClientInfo>>,
    },
    Close,
}

/// Handle to an open server document. Cheap to clone.
#[derive(Clone)]
pub struct ServerDoc {
    id: Arc<str>,
    events: mpsc::Sender<Event>,
    seq: watch::Receiver<u64>,
    closed: watch::Receiver<bool>,
}

impl std::fmt::Debug for ServerDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerDoc")
            .field("id", &self.id)
            .field("seq", &*self.seq.borrow())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ServerDoc {
    /// Load `id` from `persistence` and start serving it. A document that
    /// was never saved starts empty.
    pub async fn load(
        id: impl Into<String>,
        persistence: Arc<dyn ServerDocPersistence>,
        config: ServerConfig,
    ) -> Result<Self, PersistenceError> {
        let id = id.into();
        let state = persistence.load(&id).await?.unwrap_or_default();
        Ok(Self::new(id, &state, persistence, config))
    }

    /// Start serving `initial`. Must be called inside a tokio runtime.
    pub fn new(
        id: impl Into<String>,
        initial: &Changeset,
        persistence: Arc<dyn ServerDocPersistence>,
        config: ServerConfig,
    ) -> Self {
        let id: Arc<str> = Arc::from(id.into());
        let (events_tx, events_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (seq_tx, seq_rx) = watch::channel(0);
        let (closed_tx, closed_rx) = watch::channel(false);

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let data = WorkingChangeset::with_rng(rng).seeded(initial);
        log::info!("doc {id}: opened with {} entries", data.size());

        let actor = DocActor {
            id: Arc::clone(&id),
            config,
            persistence,
            data,
            seq: 0,
            sessions: BTreeMap::new(),
            next_conn: 0,
            events: events_tx.clone(),
            broadcast_at: None,
            empty_since: Some(Instant::now()),
            closing: false,
            seq_tx,
            closed_tx,
        };
        tokio::spawn(actor.run(events_rx));

        Self {
            id,
            events: events_tx,
            seq: seq_rx,
            closed: closed_rx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register an admitted client on `transport` and send it the current
    /// state.
    pub async fn connect(
        &self,
        client_id: impl Into<String>,
        admitted: Admitted,
        transport: Transport,
    ) -> Result<(), ServerError> {
        let (reply, rx) = oneshot::channel();
        let event = Event::Connect {
            client_id: client_id.into(),
            admitted,
            transport,
            reply,
        };
        self.events.send(event).await.map_err(|_| ServerError::Closed)?;
        rx.await.map_err(|_| ServerError::Closed)?
    }

    /// Full authoritative state.
    pub async fn snapshot(&self) -> Result<Changeset, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(Event::Snapshot { reply })
            .await
            .map_err(|_| ServerError::Closed)?;
        rx.await.map_err(|_| ServerError::Closed)
    }

    pub async fn tree(&self) -> Result<Arc<DocTree>, ServerError> {
        Ok(DocTreeCollector::collect_once(&self.snapshot().await?))
    }

    /// Connected clients, sorted by id.
    pub async fn clients(&self) -> Result<Vec<ClientInfo>, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(Event::Clients { reply })
            .await
            .map_err(|_| ServerError::Closed)?;
        rx.await.map_err(|_| ServerError::Closed)
    }

    /// Current server write-version.
    pub fn seq(&self) -> u64 {
        *self.seq.borrow()
    }

    /// Receiver notified whenever the authoritative state changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.seq.clone()
    }

    /// Close every session and stop the document.
    pub async fn close(&self) {
        let _ = self.events.send(Event::Close).await;
        self.closed().await;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the document has stopped.
    pub async fn closed(&self) {
        let mut rx = self.closed.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

struct Session {
    conn: u64,
    sender: TransportSender,
    authz: Authz,
    user: UserInfo,
    awareness: Awareness,
    pending_reply: Option<u64>,
    last_sent_seq: u64,
    last_active: Instant,
}

struct DocActor {
    id: Arc<str>,
    config: ServerConfig,
    persistence: Arc<dyn ServerDocPersistence>,
    data: WorkingChangeset,
    seq: u64,
    sessions: BTreeMap<String, Session>,
    next_conn: u64,
    events: mpsc::Sender<Event>,
    broadcast_at: Option<Instant>,
    empty_since: Option<Instant>,
    closing: bool,
    seq_tx: watch::Sender<u64>,
    closed_tx: watch::Sender<bool>,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl DocActor {
    async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if self.handle(event).await.is_break() {
                        break;
                    }
                }
                _ = sleep_until(self.broadcast_at) => self.flush(),
                _ = sweep.tick() => self.sweep(),
            }
            if self.closing {
                break;
            }
        }

        self.shutdown();
    }

    async fn handle(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::Connect {
                client_id,
                admitted,
                transport,
                reply,
            } => {
                let _ = reply.send(self.connect(client_id, admitted, transport));
            }
            Event::Inbound { client_id, conn, msg } => self.on_message(&client_id, conn, msg).await,
            Event::Disconnected { client_id, conn } => self.on_disconnect(&client_id, conn),
            Event::Snapshot { reply } => {
                let _ = reply.send(self.data.collect(None));
            }
            Event::Clients { reply } => {
                let _ = reply.send(self.roster());
            }
            Event::Close => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn connect(&mut self, client_id: String, admitted: Admitted, transport: Transport) -> Result<(), ServerError> {
        if self.sessions.contains_key(&client_id) {
            log::warn!("doc {}: client {client_id} already connected", self.id);
            transport.close();
            return Err(ServerError::DuplicateClient(client_id));
        }

        let conn = self.next_conn;
        self.next_conn += 1;
        let (sender, mut receiver) = transport.split();

        let events = self.events.clone();
        let task_client = client_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = receiver.recv().await {
                let event = Event::Inbound {
                    client_id: task_client.clone(),
                    conn,
                    msg,
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            let _ = events
                .send(Event::Disconnected {
                    client_id: task_client,
                    conn,
                })
                .await;
        });

        let clients = self.roster().into_iter().filter(|c| c.id != client_id).collect();
        sender.send(Msg::ServerUpdate {
            seq: self.seq,
            reply_to: None,
            clients,
            changeset: Some(self.data.collect(None)),
        });

        log::info!(
            "doc {}: client {client_id} ({}) connected with {:?}",
            self.id,
            admitted.user.id,
            admitted.authz
        );
        self.sessions.insert(
            client_id,
            Session {
                conn,
                sender,
                authz: admitted.authz,
                user: admitted.user,
                awareness: Awareness::new(),
                pending_reply: None,
                last_sent_seq: self.seq,
                last_active: Instant::now(),
            },
        );
        self.empty_since = None;
        self.schedule_broadcast();
        Ok(())
    }

    async fn on_message(&mut self, client_id: &str, conn: u64, msg: Msg) {
        let Some(session) = self.sessions.get_mut(client_id).filter(|s| s.conn == conn) else {
            return;
        };
        session.last_active = Instant::now();

        let (awareness, seq, changeset) = match msg {
            Msg::Update {
                awareness,
                seq,
                changeset,
            } => (awareness, seq, changeset),
            other => {
                log::warn!("doc {}: ignoring {} from client {client_id}", self.id, other.kind());
                return;
            }
        };

        session.awareness = awareness;
        if let Some(cs) = changeset {
            if !session.authz.can_write() {
                log::warn!("doc {}: read-only client {client_id} sent a changeset", self.id);
                session.sender.send(Msg::Error {
                    error: ErrorCode::NoWritePermission,
                });
            }
            match seq {
                Some(seq) => {
                    session.pending_reply = Some(session.pending_reply.map_or(seq, |prev| prev.max(seq)));
                }
                None => log::warn!("doc {}: changeset without seq from client {client_id}", self.id),
            }
            self.apply(&cs).await;
        }

        self.schedule_broadcast();
    }

    async fn apply(&mut self, cs: &Changeset) {
        let prev = self.seq;
        self.seq += 1;
        self.data.change_authoritative(cs, self.seq);

        if self.data.collect(Some(prev)).is_empty() {
            log::debug!("doc {}: changeset at seq {} had no effect", self.id, self.seq);
            return;
        }

        let state = self.data.collect(None);
        if let Err(e) = self.persistence.save(&self.id, &state).await {
            log::error!("doc {}: failed to persist seq {}: {e}", self.id, self.seq);
        }
        self.seq_tx.send_replace(self.seq);
    }

    fn on_disconnect(&mut self, client_id: &str, conn: u64) {
        if self.sessions.get(client_id).is_some_and(|s| s.conn == conn) {
            self.sessions.remove(client_id);
            log::info!("doc {}: client {client_id} disconnected", self.id);
            self.after_removal();
        }
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout;

        let idle: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_active) > idle_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for client_id in idle {
            if let Some(session) = self.sessions.remove(&client_id) {
                log::info!("doc {}: evicting idle client {client_id}", self.id);
                session.sender.close();
            }
            self.after_removal();
        }

        if let Some(since) = self.empty_since {
            if self.config.close_when_empty && now.duration_since(since) > idle_timeout {
                log::info!("doc {}: idle with no clients", self.id);
                self.closing = true;
            }
        }
    }

    fn after_removal(&mut self) {
        if self.sessions.is_empty() {
            self.empty_since = Some(Instant::now());
            if self.config.close_when_empty {
                self.closing = true;
            }
        } else {
            self.schedule_broadcast();
        }
    }

    fn schedule_broadcast(&mut self) {
        if self.broadcast_at.is_none() {
            self.broadcast_at = Some(Instant::now() + self.config.broadcast_debounce);
        }
    }

    /// Send each session the delta since its last update, the roster of
    /// everyone else and its pending reply.
    fn flush(&mut self) {
        self.broadcast_at = None;
        let roster = self.roster();
        let data = &self.data;
        let mut deltas: HashMap<u64, Option<Changeset>> = HashMap::new();

        for (client_id, session) in self.sessions.iter_mut() {
            let changeset = deltas
                .entry(session.last_sent_seq)
                .or_insert_with(|| {
                    let delta = data.collect(Some(session.last_sent_seq));
                    (!delta.is_empty()).then_some(delta)
                })
                .clone();
            let clients = roster.iter().filter(|c| c.id != *client_id).cloned().collect();

            session.sender.send(Msg::ServerUpdate {
                seq: self.seq,
                reply_to: session.pending_reply.take(),
                clients,
                changeset,
            });
            session.last_sent_seq = self.seq;
        }
    }

    fn roster(&self) -> Vec<ClientInfo> {
        self.sessions
            .iter()
            .map(|(id, s)| ClientInfo {
                id: id.clone(),
                awareness: s.awareness.clone(),
                user: s.user.clone(),
            })
            .collect()
    }

    fn shutdown(&mut self) {
        for session in self.sessions.values() {
            session.sender.close();
        }
        self.sessions.clear();
        self.closed_tx.send_replace(true);
        log::info!("doc {}: closed at seq {}", self.id, self.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryServerPersistence;
    use canopy_core::ROOT;
    use serde_json::json;

    const WAIT: Duration = Duration::from_secs(5);

    fn open(persistence: Arc<InMemoryServerPersistence>) -> ServerDoc {
        ServerDoc::new("doc", &Changeset::empty(), persistence, ServerConfig::for_testing())
    }

    async fn join(doc: &ServerDoc, id: &str, authz: Authz) -> Transport {
        let (client, server) = Transport::pair();
        let admitted = Admitted {
            user: UserInfo::new(id, id),
            authz,
        };
        doc.connect(id, admitted, server).await.unwrap();
        client
    }

    /// Read until `pred` matches a message, returning it.
    async fn recv_until(t: &mut Transport, mut pred: impl FnMut(&Msg) -> bool) -> Msg {
        loop {
            let msg = t.recv_timeout(WAIT).await.unwrap().expect("transport closed");
            if pred(&msg) {
                return msg;
            }
        }
    }

    fn update(seq: u64, cs: Changeset) -> Msg {
        Msg::Update {
            awareness: Awareness::new(),
            seq: Some(seq),
            changeset: Some(cs),
        }
    }

    fn create_a() -> Changeset {
        Changeset::empty().with_create(["a"]).with_position("a", ROOT, "O")
    }

    #[tokio::test]
    async fn test_intro_is_full_snapshot() {
        let persistence = Arc::new(InMemoryServerPersistence::new());
        let doc = ServerDoc::new("doc", &create_a(), persistence, ServerConfig::for_testing());
        let mut client = join(&doc, "c1", Authz::Write).await;

        match client.recv_timeout(WAIT).await.unwrap() {
            Some(Msg::ServerUpdate {
                seq,
                reply_to,
                clients,
                changeset,
            }) => {
                assert_eq!(seq, 0);
                assert_eq!(reply_to, None);
                assert!(clients.is_empty());
                assert_eq!(changeset, Some(create_a()));
            }
            other => panic!("expected intro, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_client_rejected() {
        let doc = open(Arc::new(InMemoryServerPersistence::new()));
        let _first = join(&doc, "c1", Authz::Write).await;

        let (_client, server) = Transport::pair();
        let admitted = Admitted {
            user: UserInfo::new("u", "U"),
            authz: Authz::Write,
        };
        let err = doc.connect("c1", admitted, server).await.unwrap_err();
        assert!(matches!(err, ServerError::DuplicateClient(id) if id == "c1"));
        assert_eq!(doc.clients().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_is_acked_persisted_and_broadcast() {
        let persistence = Arc::new(InMemoryServerPersistence::new());
        let doc = open(Arc::clone(&persistence));
        let mut writer = join(&doc, "c1", Authz::Write).await;
        let mut reader = join(&doc, "c2", Authz::Write).await;

        writer.send(update(1, create_a()));

        let reply = recv_until(&mut writer, |m| matches!(m, Msg::ServerUpdate { reply_to: Some(_), .. })).await;
        let Msg::ServerUpdate {
            seq,
            reply_to,
            clients,
            changeset,
        } = reply
        else {
            unreachable!()
        };
        assert_eq!(reply_to, Some(1));
        assert_eq!(seq, 1);
        assert_eq!(clients.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(), vec!["c2"]);
        assert_eq!(changeset, Some(create_a()));

        let seen = recv_until(&mut reader, |m| matches!(m, Msg::ServerUpdate { changeset: Some(cs), .. } if !cs.position.is_empty())).await;
        assert!(matches!(seen, Msg::ServerUpdate { reply_to: None, seq: 1, .. }));

        assert_eq!(persistence.load("doc").await.unwrap(), Some(create_a()));
        assert_eq!(doc.seq(), 1);
        assert!(doc.tree().await.unwrap().contains("a"));
    }

    #[tokio::test]
    async fn test_read_only_write_flagged_but_applied() {
        let doc = open(Arc::new(InMemoryServerPersistence::new()));
        let mut client = join(&doc, "c1", Authz::Read).await;

        client.send(update(1, create_a()));
        let err = recv_until(&mut client, |m| matches!(m, Msg::Error { .. })).await;
        assert_eq!(
            err,
            Msg::Error {
                error: ErrorCode::NoWritePermission
            }
        );
        recv_until(&mut client, |m| matches!(m, Msg::ServerUpdate { reply_to: Some(1), .. })).await;
        assert!(!client.is_closed());
        assert_eq!(doc.snapshot().await.unwrap(), create_a());
    }

    #[tokio::test]
    async fn test_awareness_reaches_peers() {
        let doc = open(Arc::new(InMemoryServerPersistence::new()));
        let a = join(&doc, "a", Authz::Write).await;
        let mut b = join(&doc, "b", Authz::Write).await;

        let mut awareness = Awareness::new();
        awareness.insert("cursor".into(), json!("n1"));
        a.send(Msg::Update {
            awareness,
            seq: None,
            changeset: None,
        });

        recv_until(&mut b, |m| match m {
            Msg::ServerUpdate { clients, .. } => clients
                .iter()
                .any(|c| c.id == "a" && c.awareness.get("cursor") == Some(&json!("n1"))),
            _ => false,
        })
        .await;
    }

    #[tokio::test]
    async fn test_rejected_changeset_is_not_persisted() {
        let persistence = Arc::new(InMemoryServerPersistence::new());
        let doc = open(Arc::clone(&persistence));
        let mut client = join(&doc, "c1", Authz::Write).await;

        // Property on a node that does not exist.
        client.send(update(1, Changeset::empty().with_property("ghost", "k", 1)));
        let reply = recv_until(&mut client, |m| matches!(m, Msg::ServerUpdate { reply_to: Some(1), .. })).await;
        assert!(matches!(reply, Msg::ServerUpdate { changeset: None, .. }));
        assert_eq!(persistence.load("doc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_closes_when_last_client_leaves() {
        let doc = open(Arc::new(InMemoryServerPersistence::new()));
        let client = join(&doc, "c1", Authz::Write).await;
        client.close();
        tokio::time::timeout(WAIT, doc.closed()).await.unwrap();
        assert!(doc.is_closed());
        assert!(matches!(doc.snapshot().await, Err(ServerError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_client_is_evicted() {
        let config = ServerConfig {
            close_when_empty: false,
            ..ServerConfig::for_testing()
        };
        let doc = ServerDoc::new("doc", &Changeset::empty(), Arc::new(InMemoryServerPersistence::new()), config);
        let mut client = join(&doc, "c1", Authz::Write).await;

        tokio::time::sleep(Duration::from_secs(6)).await;
        while client.recv().await.is_some() {}
        assert!(client.is_closed());
        assert!(doc.clients().await.unwrap().is_empty());
        assert!(!doc.is_closed());
    }

    #[tokio::test]
    async fn test_close_disconnects_everyone() {
        let doc = open(Arc::new(InMemoryServerPersistence::new()));
        let a = join(&doc, "a", Authz::Write).await;
        let b = join(&doc, "b", Authz::Read).await;
        doc.close().await;
        assert!(a.is_closed() && b.is_closed());
    }

    /// Every message already queued or arriving within `quiet` of the last.
    async fn drain(t: &mut Transport, quiet: Duration) -> Vec<Msg> {
        let mut msgs = Vec::new();
        while let Ok(Some(msg)) = t.recv_timeout(quiet).await {
            msgs.push(msg);
        }
        msgs
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_within_debounce_coalesce() {
        let doc = open(Arc::new(InMemoryServerPersistence::new()));
        let mut writer = join(&doc, "w", Authz::Write).await;
        let mut peer = join(&doc, "p", Authz::Write).await;
        let quiet = Duration::from_millis(50);
        drain(&mut writer, quiet).await;
        drain(&mut peer, quiet).await;

        let titled = Changeset::empty().with_property("a", "title", "x");
        writer.send(update(1, create_a()));
        writer.send(update(2, titled.clone()));

        let updates: Vec<Changeset> = drain(&mut peer, quiet)
            .await
            .into_iter()
            .filter_map(|m| match m {
                Msg::ServerUpdate { changeset, .. } => changeset,
                _ => None,
            })
            .collect();
        assert_eq!(updates.len(), 1, "expected one coalesced update, got {updates:?}");
        assert_eq!(updates[0], create_a().combine(&titled));

        let replies: Vec<Option<u64>> = drain(&mut writer, quiet)
            .await
            .into_iter()
            .filter_map(|m| match m {
                Msg::ServerUpdate { reply_to, .. } => Some(reply_to),
                _ => None,
            })
            .collect();
        assert_eq!(replies, vec![Some(2)]);
        assert_eq!(doc.seq(), 2);
    }
}
