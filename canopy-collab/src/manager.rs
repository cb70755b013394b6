//! Registry of open server documents.
//!
//! Concurrent requests for the same document share one load. A document
//! that closes (last client gone, idle) is evicted and reloaded from
//! persistence on the next request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canopy_core::Changeset;
use tokio::sync::{Mutex, OnceCell};
use uuid::Uuid;

use crate::auth::{Authenticator, Authorizer};
use crate::handshake::{self, ConnectError, Connector};
use crate::persistence::{PersistenceError, ServerDocPersistence};
use crate::server::{ServerConfig, ServerDoc};
use crate::transport::Transport;

type DocSlot = Arc<OnceCell<ServerDoc>>;

struct Inner {
    persistence: Arc<dyn ServerDocPersistence>,
    authenticator: Arc<dyn Authenticator>,
    authorizer: Arc<dyn Authorizer>,
    config: ServerConfig,
    handshake_timeout: Duration,
    docs: Mutex<HashMap<String, DocSlot>>,
}

/// Shared handle to the registry. Cheap to clone.
#[derive(Clone)]
pub struct DocManager {
    inner: Arc<Inner>,
}

impl DocManager {
    pub fn new(
        persistence: Arc<dyn ServerDocPersistence>,
        authenticator: Arc<dyn Authenticator>,
        authorizer: Arc<dyn Authorizer>,
        config: ServerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                persistence,
                authenticator,
                authorizer,
                config,
                handshake_timeout: Duration::from_secs(10),
                docs: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn authenticator(&self) -> &dyn Authenticator {
        self.inner.authenticator.as_ref()
    }

    pub fn authorizer(&self) -> &dyn Authorizer {
        self.inner.authorizer.as_ref()
    }

    /// Persist an empty document unless `doc_id` already exists.
    pub async fn create(&self, doc_id: &str) -> Result<(), PersistenceError> {
        if self.inner.persistence.load(doc_id).await?.is_some() {
            log::info!("doc {doc_id}: already exists, skipping create");
            return Ok(());
        }
        log::info!("doc {doc_id}: creating");
        self.inner.persistence.save(doc_id, &Changeset::empty()).await
    }

    /// The open document for `doc_id`, loading it if needed.
    pub async fn get(&self, doc_id: &str) -> Result<ServerDoc, PersistenceError> {
        loop {
            let slot = {
                let mut docs = self.inner.docs.lock().await;
                Arc::clone(docs.entry(doc_id.to_string()).or_default())
            };

            let doc = slot
                .get_or_try_init(|| async {
                    let doc = ServerDoc::load(
                        doc_id,
                        Arc::clone(&self.inner.persistence),
                        self.inner.config.clone(),
                    )
                    .await?;
                    self.evict_on_close(doc.clone(), Arc::clone(&slot));
                    Ok::<_, PersistenceError>(doc)
                })
                .await?;

            if !doc.is_closed() {
                return Ok(doc.clone());
            }
            self.evict(doc_id, &slot).await;
        }
    }

    /// Number of documents currently open.
    pub async fn open_docs(&self) -> usize {
        self.inner.docs.lock().await.len()
    }

    fn evict_on_close(&self, doc: ServerDoc, slot: DocSlot) {
        let manager = self.clone();
        tokio::spawn(async move {
            doc.closed().await;
            manager.evict(doc.id(), &slot).await;
        });
    }

    async fn evict(&self, doc_id: &str, slot: &DocSlot) {
        let mut docs = self.inner.docs.lock().await;
        if docs.get(doc_id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            docs.remove(doc_id);
            log::info!("doc {doc_id}: evicted");
        }
    }

    /// Run the server side of a connection: handshake, load the document
    /// and hand the transport to it.
    pub async fn accept(&self, mut transport: Transport, doc_id: &str) -> Result<(), ConnectError> {
        let admitted = handshake::accept(
            &mut transport,
            doc_id,
            self.authenticator(),
            self.authorizer(),
            self.inner.handshake_timeout,
        )
        .await?;

        let doc = match self.get(doc_id).await {
            Ok(doc) => doc,
            Err(e) => {
                log::error!("doc {doc_id}: failed to load: {e}");
                transport.close();
                return Err(ConnectError::Unavailable(e.to_string()));
            }
        };

        admitted.confirm(&transport);
        let client_id = format!("sid:{}", Uuid::new_v4());
        doc.connect(client_id, admitted, transport)
            .await
            .map_err(|e| ConnectError::Unavailable(e.to_string()))
    }

    /// Close every open document.
    pub async fn shutdown(&self) {
        let slots: Vec<DocSlot> = self.inner.docs.lock().await.drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            if let Some(doc) = slot.get() {
                doc.close().await;
            }
        }
    }
}

/// Connects a client to a [`DocManager`] in the same process.
#[derive(Clone)]
pub struct LocalConnector {
    manager: DocManager,
    token: String,
    timeout: Duration,
}

impl LocalConnector {
    pub fn new(manager: DocManager, token: impl Into<String>) -> Self {
        Self {
            manager,
            token: token.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, doc_id: &str) -> Result<Transport, ConnectError> {
        let (mut client, server) = Transport::pair();

        let manager = self.manager.clone();
        let server_doc_id = doc_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = manager.accept(server, &server_doc_id).await {
                log::info!("doc {server_doc_id}: local connection refused: {e}");
            }
        });

        handshake::authenticate(&mut client, &self.token, self.timeout).await?;
        Ok(client)
    }
}
