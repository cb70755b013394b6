//! # canopy-collab: real-time sync for canopy documents
//!
//! Keeps any number of client replicas of a tree document converged with
//! one authoritative server copy.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   Transport (JSON)   ┌─────────────┐
//! │ ClientDoc   │ ◄──────────────────► │ ServerDoc   │
//! │ base+changes│   update / serverUpd │ authority   │
//! └──────┬──────┘                      └──────┬──────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌─────────────┐                      ┌─────────────┐
//! │ ClientDoc-  │                      │ ServerDoc-  │
//! │ Persistence │                      │ Persistence │
//! └─────────────┘                      └──────┬──────┘
//!                                             │
//!                                      ┌──────┴──────┐
//!                                      │ DocManager  │
//!                                      │ + http (ws) │
//!                                      └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: wire messages
//! - [`transport`]: in-memory message pipe
//! - [`handshake`]: auth exchange and the [`Connector`] seam
//! - [`client`] / [`server`]: per-document sync actors
//! - [`manager`]: registry of open server documents
//! - [`ws`] / [`http`]: WebSocket transport and HTTP routes
//! - [`persistence`], [`auth`], [`backoff`]: collaborators

pub mod auth;
pub mod backoff;
pub mod client;
pub mod handshake;
pub mod http;
pub mod manager;
pub mod persistence;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod ws;

pub use auth::{AllowAll, AnyTokenAuthenticator, Authenticator, Authorizer, StaticAuthenticator, StaticAuthorizer};
pub use backoff::BackoffConfig;
pub use client::{ClientConfig, ClientDoc, ClientError, ClientStatus};
pub use handshake::{Admitted, ConnectError, Connector};
pub use manager::{DocManager, LocalConnector};
pub use persistence::{
    ClientDocPersistence, ClientSave, FileStore, InMemoryClientPersistence, InMemoryServerPersistence,
    PersistenceError, ServerDocPersistence,
};
pub use protocol::{AuthIssue, Authz, Awareness, ClientInfo, ErrorCode, Msg, ProtocolError, UserInfo};
pub use server::{ServerConfig, ServerDoc, ServerError};
pub use transport::Transport;
pub use ws::WsConnector;
