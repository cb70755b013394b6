//! JSON wire protocol between clients and the server.
//!
//! Every frame is one JSON object tagged by `type`:
//! ```text
//! client → server   {"type":"auth","token":"…"}
//! server → client   {"type":"authResult","success":true,"authz":"write","user":{…}}
//! client → server   {"type":"update","awareness":{…},"seq":7,"changeset":{…}}
//! server → client   {"type":"serverUpdate","seq":42,"replyTo":7,"clients":[…],"changeset":{…}}
//! server → client   {"type":"error","error":"no-write-permission"}
//! ```
//!
//! `seq` on an `update` names the client's local write-version for the
//! attached changeset; the server echoes it back as `replyTo` once the
//! changeset has been applied. `seq` on a `serverUpdate` is the server's
//! own write-version the attached delta brings the client up to.

use canopy_core::Changeset;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Free-form presence data (cursor, selection, …) owned by each client.
pub type Awareness = serde_json::Map<String, Value>;

/// Access level a user has on a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Authz {
    None,
    Read,
    Write,
}

impl Authz {
    pub fn can_read(self) -> bool {
        matches!(self, Authz::Read | Authz::Write)
    }

    pub fn can_write(self) -> bool {
        self == Authz::Write
    }
}

/// Authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub id: String,
    pub name: String,
    pub is_anonymous: bool,
}

impl UserInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_anonymous: false,
        }
    }

    pub fn anonymous(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: format!("Anonymous {id}"),
            id,
            is_anonymous: true,
        }
    }
}

/// A peer as seen in a `serverUpdate` roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    pub awareness: Awareness,
    pub user: UserInfo,
}

/// Why a handshake was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthIssue {
    InvalidToken,
    PermissionDenied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    NoWritePermission,
}

/// Protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Msg {
    Auth {
        token: String,
    },
    AuthResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        issue: Option<AuthIssue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        authz: Option<Authz>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<UserInfo>,
    },
    Update {
        awareness: Awareness,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        changeset: Option<Changeset>,
    },
    ServerUpdate {
        seq: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<u64>,
        clients: Vec<ClientInfo>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        changeset: Option<Changeset>,
    },
    Error {
        error: ErrorCode,
    },
}

impl Msg {
    pub fn auth(token: impl Into<String>) -> Self {
        Msg::Auth { token: token.into() }
    }

    pub fn auth_accepted(authz: Authz, user: UserInfo) -> Self {
        Msg::AuthResult {
            success: true,
            issue: None,
            authz: Some(authz),
            user: Some(user),
        }
    }

    pub fn auth_rejected(issue: AuthIssue) -> Self {
        Msg::AuthResult {
            success: false,
            issue: Some(issue),
            authz: None,
            user: None,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Auth { .. } => "auth",
            Msg::AuthResult { .. } => "authResult",
            Msg::Update { .. } => "update",
            Msg::ServerUpdate { .. } => "serverUpdate",
            Msg::Error { .. } => "error",
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("unexpected {0} message")]
    Unexpected(&'static str),
    #[error("connection closed")]
    Closed,
    #[error("timed out waiting for message")]
    Timeout,
}
