//! Connection handshake.
//!
//! ```text
//!   client                         server
//!     │ ── auth{token} ───────────► │  authenticate(token) → user
//!     │                             │  authorize(doc, user) → authz
//!     │ ◄── authResult{…} ───────── │
//!     │ ◄── serverUpdate (intro) ── │  only on success
//! ```
//!
//! A failed handshake is answered with `authResult{success:false, issue}`
//! and the transport is closed. Neither side retries on its own; the client
//! reconnect loop treats a failed handshake like any other connect failure.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::auth::{Authenticator, Authorizer};
use crate::protocol::{AuthIssue, Authz, Msg, ProtocolError, UserInfo};
use crate::transport::Transport;

/// Why a client could not get a ready transport.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("handshake rejected: {0:?}")]
    Rejected(AuthIssue),
    #[error("server unavailable: {0}")]
    Unavailable(String),
}

/// Produces authenticated transports for a document.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, doc_id: &str) -> Result<Transport, ConnectError>;
}

/// Client side: send the token and wait for the verdict.
pub async fn authenticate(
    transport: &mut Transport,
    token: &str,
    timeout: Duration,
) -> Result<(Authz, UserInfo), ConnectError> {
    transport.send(Msg::auth(token));

    let reply = transport.recv_timeout(timeout).await;
    let msg = match reply {
        Ok(Some(msg)) => msg,
        Ok(None) => return Err(ProtocolError::Closed.into()),
        Err(e) => {
            transport.close();
            return Err(e.into());
        }
    };

    match msg {
        Msg::AuthResult {
            success: true,
            authz: Some(authz),
            user: Some(user),
            ..
        } => Ok((authz, user)),
        Msg::AuthResult { issue, .. } => {
            transport.close();
            Err(ConnectError::Rejected(issue.unwrap_or(AuthIssue::InvalidToken)))
        }
        other => {
            transport.close();
            Err(ProtocolError::Unexpected(other.kind()).into())
        }
    }
}

/// A user who passed the server side of the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct Admitted {
    pub user: UserInfo,
    pub authz: Authz,
}

impl Admitted {
    /// Tell the client it is in.
    pub fn confirm(&self, transport: &Transport) {
        transport.send(Msg::auth_accepted(self.authz, self.user.clone()));
    }
}

/// Server side: read the `auth` message, authenticate and authorize.
///
/// On rejection the client is told why and the transport is closed. On
/// success nothing is sent yet; call [`Admitted::confirm`] once the
/// document is ready.
pub async fn accept(
    transport: &mut Transport,
    doc_id: &str,
    authenticator: &dyn Authenticator,
    authorizer: &dyn Authorizer,
    timeout: Duration,
) -> Result<Admitted, ConnectError> {
    let token = match transport.recv_timeout(timeout).await {
        Ok(Some(Msg::Auth { token })) => token,
        Ok(Some(other)) => {
            log::info!("doc {doc_id}: expected auth, got {}", other.kind());
            transport.close();
            return Err(ProtocolError::Unexpected(other.kind()).into());
        }
        Ok(None) => return Err(ProtocolError::Closed.into()),
        Err(e) => {
            transport.close();
            return Err(e.into());
        }
    };

    let Some(user) = authenticator.authenticate(&token).await else {
        log::info!("doc {doc_id}: rejected invalid token");
        return Err(reject(transport, AuthIssue::InvalidToken));
    };

    let authz = authorizer.authorize(doc_id, &user.id).await;
    if authz == Authz::None {
        log::info!("doc {doc_id}: user {} has no access", user.id);
        return Err(reject(transport, AuthIssue::PermissionDenied));
    }

    Ok(Admitted { user, authz })
}

fn reject(transport: &Transport, issue: AuthIssue) -> ConnectError {
    transport.send(Msg::auth_rejected(issue));
    transport.close();
    ConnectError::Rejected(issue)
}
