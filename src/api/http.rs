//! HTTP API Server
//!
//! REST surface of the replication layer. Batches are replication contexts
//! on the wire; tick-valued fields travel as decimal strings, and tailing
//! responses carry their protocol state in `x-quill-*` headers so the body
//! can stay a plain newline-delimited operation stream.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::node::ReplicationNode;
use crate::parser::WalTailParser;
use crate::sync;
use crate::tick::Tick;

/// Response header: whether another tailing call will return more data
const X_CHECKMORE: &str = "x-quill-checkmore";
/// Response header: last tick or local offset actually included
const X_LASTINCLUDED: &str = "x-quill-lastincluded";
/// Response header: the server's current tick
const X_LASTTICK: &str = "x-quill-lasttick";
/// Response header: whether the requested start tick is still in the WAL
const X_FROMPRESENT: &str = "x-quill-frompresent";

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    node: Arc<ReplicationNode>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, node: Arc<ReplicationNode>) -> Self {
        Self { config, node }
    }

    fn create_router(node: Arc<ReplicationNode>, cors_enabled: bool) -> Router {
        let router = Router::new()
            // batch (context) lifecycle
            .route("/replication/batch", post(handle_batch_create))
            .route(
                "/replication/batch/:id",
                put(handle_batch_extend).delete(handle_batch_delete),
            )
            // continuous replication
            .route("/replication/logger-follow", get(handle_logger_follow))
            // initial sync
            .route("/replication/inventory", get(handle_inventory))
            .route("/replication/dump", get(handle_dump))
            // incremental sync
            .route("/replication/keys-chunks", get(handle_key_chunks))
            .route("/replication/keys", get(handle_keys))
            .route("/replication/docs", put(handle_docs))
            // explicit WAL release
            .route("/replication/release", put(handle_release))
            // operator visibility
            .route("/replication/tracker", get(handle_tracker))
            .route("/health", get(handle_health))
            .layer(TraceLayer::new_for_http())
            .with_state(node);

        if cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Start serving; runs until the process shuts down
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.node), self.config.cors_enabled);

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Http(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

#[derive(Debug, Deserialize)]
pub struct BatchCreateRequest {
    /// TTL in seconds; defaults to the configured context TTL
    pub ttl: Option<u64>,
    #[serde(rename = "syncerId")]
    pub syncer_id: Option<String>,
    #[serde(rename = "serverId")]
    pub server_id: Option<String>,
    /// Collection whose document count should be corrected at end-of-scan
    #[serde(rename = "patchCollection")]
    pub patch_collection: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BatchCreateResponse {
    pub id: String,
    #[serde(rename = "lastTick")]
    pub last_tick: String,
}

#[derive(Debug, Deserialize)]
pub struct BatchExtendRequest {
    pub ttl: Option<u64>,
    #[serde(rename = "syncerId")]
    pub syncer_id: Option<String>,
    #[serde(rename = "serverId")]
    pub server_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FollowQuery {
    pub from: Option<String>,
    pub to: Option<String>,
    #[serde(rename = "chunkSize")]
    pub chunk_size: Option<u64>,
    pub collection: Option<String>,
    #[serde(rename = "includeSystem")]
    pub include_system: Option<bool>,
    #[serde(rename = "syncerId")]
    pub syncer_id: Option<String>,
    #[serde(rename = "serverId")]
    pub server_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchIdQuery {
    #[serde(rename = "batchId")]
    pub batch_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DumpQuery {
    #[serde(rename = "batchId")]
    pub batch_id: String,
    pub collection: String,
    #[serde(rename = "chunkSize")]
    pub chunk_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct KeysQuery {
    #[serde(rename = "batchId")]
    pub batch_id: String,
    pub collection: String,
    pub chunk: Option<u64>,
    #[serde(rename = "chunkSize")]
    pub chunk_size: Option<u64>,
    #[serde(rename = "lowKey")]
    pub low_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    /// Tick below which WAL data may be pruned, as a decimal string
    pub tick: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Wire-side error wrapper mapping the taxonomy onto HTTP statuses
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_not_found() {
            StatusCode::NOT_FOUND
        } else if self.0.is_bad_request() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============ Handlers ============

async fn handle_batch_create(
    State(node): State<Arc<ReplicationNode>>,
    Json(request): Json<BatchCreateRequest>,
) -> ApiResult<impl IntoResponse> {
    let ttl = request
        .ttl
        .map(std::time::Duration::from_secs)
        .unwrap_or_else(|| node.config().context_ttl());
    let syncer_id = parse_opt_u64("syncerId", request.syncer_id.as_deref())?;
    let server_id = parse_opt_u64("serverId", request.server_id.as_deref())?;

    let (id, last_tick) =
        node.contexts()
            .create_context(ttl, syncer_id, server_id, request.patch_collection);

    if syncer_id != 0 || server_id != 0 {
        node.progress().track(syncer_id, server_id, "", 0, ttl).await;
    }

    Ok((
        StatusCode::OK,
        Json(BatchCreateResponse {
            id: id.to_string(),
            last_tick: last_tick.to_string(),
        }),
    ))
}

async fn handle_batch_extend(
    State(node): State<Arc<ReplicationNode>>,
    Path(id): Path<String>,
    Json(request): Json<BatchExtendRequest>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_u64("batch id", &id)?;
    let ttl = request
        .ttl
        .map(std::time::Duration::from_secs)
        .unwrap_or_else(|| node.config().context_ttl());
    node.contexts().extend(id, ttl)?;

    let syncer_id = parse_opt_u64("syncerId", request.syncer_id.as_deref())?;
    let server_id = parse_opt_u64("serverId", request.server_id.as_deref())?;
    if syncer_id != 0 || server_id != 0 {
        node.progress().extend(syncer_id, server_id, ttl).await;
    }

    Ok(StatusCode::NO_CONTENT)
}

async fn handle_batch_delete(
    State(node): State<Arc<ReplicationNode>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_u64("batch id", &id)?;
    node.contexts().delete(id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Tail the WAL as newline-delimited logical operations.
///
/// A purge preventer is held for the whole read so retention cannot delete
/// segments out from under it. The `x-quill-frompresent` header reports
/// honestly whether the requested start tick was still available; a client
/// seeing `false` has a gap and must fall back to a full resync.
async fn handle_logger_follow(
    State(node): State<Arc<ReplicationNode>>,
    Query(query): Query<FollowQuery>,
) -> ApiResult<Response> {
    let _preventer = node.retention().prevent_purge().await;
    let engine = node.engine();

    let from = parse_opt_u64("from", query.from.as_deref())?;
    let current = engine.current_sequence();
    let to = match query.to.as_deref() {
        Some(raw) => parse_u64("to", raw)?,
        None => current,
    };
    let budget = clamp_budget(node.as_ref(), query.chunk_size);

    let available_from = engine.oldest_retained_sequence();
    let from_present = from == 0 || from.saturating_add(1) >= available_from;

    let mut parser = WalTailParser::new(engine.database_id(), engine.object_directory())
        .with_system_collections(query.include_system.unwrap_or(false));
    if let Some(name) = &query.collection {
        let collection_id = engine.snapshot().collection(name)?.id;
        parser = parser.with_collection(collection_id);
    }

    let batches = engine.wal_batches_from(from.saturating_add(1))?;
    let ops = parser.parse(&batches);

    let mut body = String::new();
    let mut last_included: Tick = 0;
    let mut check_more = false;
    for op in ops.iter().filter(|o| o.tick > from && o.tick <= to) {
        if body.len() as u64 >= budget {
            check_more = true;
            break;
        }
        body.push_str(&serde_json::to_string(op).map_err(Error::from)?);
        body.push('\n');
        last_included = op.tick;
    }

    let syncer_id = parse_opt_u64("syncerId", query.syncer_id.as_deref())?;
    let server_id = parse_opt_u64("serverId", query.server_id.as_deref())?;
    if syncer_id != 0 || server_id != 0 {
        node.progress()
            .track(syncer_id, server_id, "", last_included, node.config().context_ttl())
            .await;
    }

    let status = if body.is_empty() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::OK
    };
    Response::builder()
        .status(status)
        .header("content-type", "application/x-ndjson")
        .header(X_CHECKMORE, check_more.to_string())
        .header(X_LASTINCLUDED, last_included.to_string())
        .header(X_LASTTICK, current.to_string())
        .header(X_FROMPRESENT, from_present.to_string())
        .body(Body::from(body))
        .map_err(|e| ApiError(Error::Http(e.to_string())))
}

async fn handle_inventory(
    State(node): State<Arc<ReplicationNode>>,
    Query(query): Query<BatchIdQuery>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_u64("batchId", &query.batch_id)?;
    let guard = node.contexts().lease(id)?;
    let inventory = guard.inventory()?;
    Ok(Json(inventory))
}

async fn handle_dump(
    State(node): State<Arc<ReplicationNode>>,
    Query(query): Query<DumpQuery>,
) -> ApiResult<Response> {
    let id = parse_u64("batchId", &query.batch_id)?;
    let budget = clamp_budget(node.as_ref(), query.chunk_size);

    let guard = node.contexts().lease(id)?;
    let page = guard.dump_documents(&query.collection, budget as usize)?;

    let mut body = String::new();
    for doc in &page.documents {
        body.push_str(&serde_json::to_string(doc).map_err(Error::from)?);
        body.push('\n');
    }

    let status = if body.is_empty() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::OK
    };
    Response::builder()
        .status(status)
        .header("content-type", "application/x-ndjson")
        .header(X_CHECKMORE, page.has_more.to_string())
        .header(X_LASTINCLUDED, page.next_offset.to_string())
        .body(Body::from(body))
        .map_err(|e| ApiError(Error::Http(e.to_string())))
}

async fn handle_key_chunks(
    State(node): State<Arc<ReplicationNode>>,
    Query(query): Query<DumpQuery>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_u64("batchId", &query.batch_id)?;
    let chunk_size = query
        .chunk_size
        .unwrap_or(node.config().replication.keys_per_chunk);

    let guard = node.contexts().lease(id)?;
    let listing = sync::dump_key_chunks(&guard, &query.collection, chunk_size)?;
    Ok(Json(listing))
}

async fn handle_keys(
    State(node): State<Arc<ReplicationNode>>,
    Query(query): Query<KeysQuery>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_u64("batchId", &query.batch_id)?;
    let chunk = query.chunk.unwrap_or(0);
    let chunk_size = query
        .chunk_size
        .unwrap_or(node.config().replication.keys_per_chunk);

    let guard = node.contexts().lease(id)?;
    let pairs = sync::dump_keys(
        &guard,
        &query.collection,
        chunk,
        chunk_size,
        query.low_key.as_deref(),
    )?;
    Ok(Json(pairs))
}

async fn handle_docs(
    State(node): State<Arc<ReplicationNode>>,
    Query(query): Query<KeysQuery>,
    Json(offsets): Json<Vec<u64>>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_u64("batchId", &query.batch_id)?;
    let chunk = query.chunk.unwrap_or(0);
    let chunk_size = query
        .chunk_size
        .unwrap_or(node.config().replication.keys_per_chunk);

    let guard = node.contexts().lease(id)?;
    let documents = sync::dump_documents_by_offset(
        &guard,
        &query.collection,
        chunk,
        chunk_size,
        &offsets,
    )?;
    Ok(Json(documents))
}

/// Explicitly release the WAL up to a tick: the caller asserts it will
/// never ask for anything at or below it again
async fn handle_release(
    State(node): State<Arc<ReplicationNode>>,
    Json(request): Json<ReleaseRequest>,
) -> ApiResult<impl IntoResponse> {
    let tick = parse_u64("tick", &request.tick)?;
    node.retention().set_released_tick(tick);
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_tracker(
    State(node): State<Arc<ReplicationNode>>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(node.progress().list().await))
}

async fn handle_health(State(node): State<Arc<ReplicationNode>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "healthy": true,
        "node": node.config().node.id,
        "lastTick": node.engine().current_sequence().to_string(),
    }))
}

// ============ Helpers ============

fn parse_u64(name: &str, raw: &str) -> Result<u64> {
    raw.parse()
        .map_err(|_| Error::BadRequest(format!("invalid {}: '{}'", name, raw)))
}

fn parse_opt_u64(name: &str, raw: Option<&str>) -> Result<u64> {
    match raw {
        Some(raw) => parse_u64(name, raw),
        None => Ok(0),
    }
}

/// Byte budget for dump/tailing calls, clamped to the configured maximum
fn clamp_budget(node: &ReplicationNode, requested: Option<u64>) -> u64 {
    let config = &node.config().replication;
    requested
        .unwrap_or(config.chunk_bytes)
        .min(config.max_chunk_bytes)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuillSyncConfig;
    use tempfile::tempdir;

    fn test_node(dir: &std::path::Path) -> Arc<ReplicationNode> {
        let mut config = QuillSyncConfig::default();
        config.node.data_dir = dir.to_path_buf();
        ReplicationNode::open(config).unwrap()
    }

    #[tokio::test]
    async fn test_follow_from_largest_tick_is_empty_and_present() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        node.engine().create_collection("docs").unwrap();
        node.engine()
            .insert_document("docs", "a", serde_json::json!({ "v": 1 }))
            .unwrap();

        // a client may legitimately resume from any tick it was last given,
        // including the largest representable one
        let query = FollowQuery {
            from: Some(u64::MAX.to_string()),
            to: None,
            chunk_size: None,
            collection: None,
            include_system: None,
            syncer_id: None,
            server_id: None,
        };
        let response = handle_logger_follow(State(Arc::clone(&node)), Query(query))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()[X_FROMPRESENT], "true");
        assert_eq!(response.headers()[X_LASTINCLUDED], "0");
    }

    #[test]
    fn test_numeric_parameter_parsing() {
        assert_eq!(parse_u64("from", "12345").unwrap(), 12345);
        assert!(matches!(
            parse_u64("from", "abc"),
            Err(Error::BadRequest(_))
        ));
        assert_eq!(parse_opt_u64("syncerId", None).unwrap(), 0);
        assert_eq!(parse_opt_u64("syncerId", Some("7")).unwrap(), 7);
    }

    #[test]
    fn test_error_status_mapping() {
        let r = ApiError(Error::ContextNotFound(1)).into_response();
        assert_eq!(r.status(), StatusCode::NOT_FOUND);

        let r = ApiError(Error::BadRequest("nope".into())).into_response();
        assert_eq!(r.status(), StatusCode::BAD_REQUEST);

        let r = ApiError(Error::Internal("boom".into())).into_response();
        assert_eq!(r.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
