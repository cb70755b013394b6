//! HTTP surface of the sync server.
//!
//! | Route            | Auth         | Purpose                                   |
//! |------------------|--------------|-------------------------------------------|
//! | `GET /health`    | none         | liveness                                  |
//! | `GET /v1/doc`    | bearer token | `{doc, changeset}` snapshot of `docId`    |
//! | `POST /v1/create`| admin token  | create `{docId}` if it does not exist     |
//! | `GET /v1/ws`     | handshake    | WebSocket sync connection for `docId`     |

use std::future::Future;

use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use canopy_core::{Changeset, DocTree, DocTreeCollector};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;

use crate::auth::{Authenticator, Authorizer};
use crate::manager::DocManager;
use crate::ws;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocQuery {
    doc_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequest {
    doc_id: String,
}

#[derive(Serialize)]
struct DocResponse<'a> {
    doc: &'a DocTree,
    changeset: &'a Changeset,
}

type HttpResult = Result<Response, (StatusCode, String)>;

fn error(status: StatusCode, message: impl Into<String>) -> (StatusCode, String) {
    (status, message.into())
}

/// Router with every route, sharing `manager`.
pub fn router(manager: DocManager) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/v1/doc", get(handle_doc_get))
        .route("/v1/create", post(handle_create))
        .route("/v1/ws", get(handle_ws))
        .with_state(manager)
}

/// Serve [`router`] on `listener` until `shutdown` resolves, then close
/// every open document.
pub async fn serve<F>(listener: TcpListener, manager: DocManager, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        log::info!("listening on {addr}");
    }
    axum::serve(listener, router(manager.clone()))
        .with_graceful_shutdown(shutdown)
        .await?;
    manager.shutdown().await;
    Ok(())
}

/// Token from an `Authorization: Bearer <token>` header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let mut parts = value.split(' ');
    let (scheme, token) = (parts.next()?, parts.next()?);
    if parts.next().is_some() || !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token)
}

const MISSING_TOKEN: &str = "expected Authorization: Bearer <token> header";
const MISSING_DOC_ID: &str = "missing docId search parameter";

async fn handle_doc_get(
    State(manager): State<DocManager>,
    Query(query): Query<DocQuery>,
    headers: HeaderMap,
) -> HttpResult {
    let doc_id = query.doc_id.ok_or_else(|| error(StatusCode::BAD_REQUEST, MISSING_DOC_ID))?;
    let token = bearer_token(&headers).ok_or_else(|| error(StatusCode::BAD_REQUEST, MISSING_TOKEN))?;

    let user = manager
        .authenticator()
        .authenticate(token)
        .await
        .ok_or_else(|| error(StatusCode::UNAUTHORIZED, "invalid token"))?;
    if !manager.authorizer().authorize(&doc_id, &user.id).await.can_read() {
        return Err(error(StatusCode::FORBIDDEN, "unauthorized"));
    }

    let doc = manager.get(&doc_id).await.map_err(|e| {
        log::error!("doc {doc_id}: failed to load: {e}");
        error(StatusCode::INTERNAL_SERVER_ERROR, "failed to load doc")
    })?;
    let changeset = doc
        .snapshot()
        .await
        .map_err(|e| error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    let tree = DocTreeCollector::collect_once(&changeset);

    Ok(Json(DocResponse {
        doc: &tree,
        changeset: &changeset,
    })
    .into_response())
}

async fn handle_create(State(manager): State<DocManager>, headers: HeaderMap, body: Bytes) -> HttpResult {
    let token = bearer_token(&headers).ok_or_else(|| error(StatusCode::BAD_REQUEST, MISSING_TOKEN))?;
    if !manager.authorizer().check_admin(token) {
        return Err(error(StatusCode::FORBIDDEN, "unauthorized"));
    }

    let request: CreateRequest = serde_json::from_slice(&body)
        .map_err(|e| error(StatusCode::BAD_REQUEST, format!("invalid request body: {e}")))?;

    manager.create(&request.doc_id).await.map_err(|e| {
        log::error!("doc {}: create failed: {e}", request.doc_id);
        error(StatusCode::INTERNAL_SERVER_ERROR, "failed to create doc")
    })?;
    Ok(Json(json!({})).into_response())
}

async fn handle_ws(
    State(manager): State<DocManager>,
    Query(query): Query<DocQuery>,
    upgrade: WebSocketUpgrade,
) -> HttpResult {
    let doc_id = query.doc_id.ok_or_else(|| error(StatusCode::BAD_REQUEST, MISSING_DOC_ID))?;
    log::info!("doc {doc_id}: websocket connection");

    Ok(upgrade.on_upgrade(move |socket| async move {
        let transport = ws::bridge(socket);
        if let Err(e) = manager.accept(transport, &doc_id).await {
            log::info!("doc {doc_id}: connection refused: {e}");
        }
    }))
}
