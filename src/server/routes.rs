//! HTTP route handlers.

use crate::distance::similarity_percent;
use crate::embedding::Embedding;
use crate::error::FaceMatchError;
use crate::matcher::{IndexStats, Match};
use crate::metrics::MetricsReport;
use crate::persistence::PersonId;
use crate::server::AppState;
use crate::source::{FaceRecord, Metadata};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

// --- Request/Response types ---

#[derive(Deserialize)]
pub struct AddFaceRequest {
    pub person_id: PersonId,
    pub embedding: Embedding,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Serialize, Deserialize)]
pub struct AddFaceResponse {
    pub face_id: String,
    pub person_id: PersonId,
}

#[derive(Deserialize)]
pub struct SearchRequest {
    pub embedding: Embedding,
    pub k: Option<usize>,
}

#[derive(Serialize, Deserialize)]
pub struct SearchResponse {
    pub person_id: PersonId,
    /// Best cosine score as a percentage.
    pub similarity: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matches: Option<Vec<MatchResponse>>,
}

#[derive(Serialize, Deserialize)]
pub struct MatchResponse {
    pub person_id: PersonId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_id: Option<String>,
    pub similarity: f32,
}

#[derive(Deserialize)]
pub struct DeleteFaceRequest {
    /// Document id returned when the face was added.
    pub face_id: String,
}

#[derive(Serialize, Deserialize)]
pub struct DeleteResponse {
    pub removed_records: usize,
    pub removed_entries: usize,
}

#[derive(Serialize, Deserialize)]
pub struct CollectionsResponse {
    pub collections: Vec<String>,
    pub indexed: Vec<String>,
}

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub index_count: usize,
}

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub retryable: bool,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(e: FaceMatchError) -> ApiError {
    let status = match &e {
        FaceMatchError::NotFound { .. } => StatusCode::NOT_FOUND,
        FaceMatchError::LockTimeout { .. } | FaceMatchError::LeaseLost { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        FaceMatchError::DimensionMismatch { .. } | FaceMatchError::InvalidVector { .. } => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            retryable: e.is_retryable(),
            error: e.to_string(),
        }),
    )
}

/// Reject embeddings the index cannot take before anything is persisted.
fn validate_embedding(state: &AppState, embedding: &Embedding) -> Result<(), ApiError> {
    embedding
        .check_dimension(state.matcher.config().dimension)
        .and_then(|_| embedding.normalized().map(|_| ()))
        .map_err(api_error)
}

// --- Router ---

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(get_metrics))
        .route("/rebuild", post(rebuild_all))
        .route("/collections", get(list_collections))
        .route(
            "/collections/:name",
            post(create_collection).delete(delete_collection),
        )
        .route("/collections/:name/stats", get(collection_stats))
        .route("/collections/:name/rebuild", post(rebuild_collection))
        .route("/collections/:name/faces", post(add_face))
        .route("/collections/:name/faces/delete", post(delete_face))
        .route("/collections/:name/persons/:person_id", delete(delete_person))
        .route("/collections/:name/search", post(search))
        .with_state(state)
}

// --- Handlers ---

async fn add_face(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<AddFaceRequest>,
) -> Result<(StatusCode, Json<AddFaceResponse>), ApiError> {
    validate_embedding(&state, &req.embedding)?;

    // The record must be durable before the index sees it.
    let record = FaceRecord::new(req.person_id, req.embedding.as_slice().to_vec())
        .with_metadata(req.metadata);
    let face_id = state
        .faces
        .insert_face(&name, record)
        .await
        .map_err(api_error)?;

    state
        .matcher
        .add_face(&name, &req.embedding, req.person_id, &face_id)
        .await
        .map_err(api_error)?;

    Ok((
        StatusCode::CREATED,
        Json(AddFaceResponse {
            face_id,
            person_id: req.person_id,
        }),
    ))
}

async fn search(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    validate_embedding(&state, &req.embedding)?;
    let k = req.k.unwrap_or(1).max(1);

    let matches: Vec<Match> = match state.matcher.search_top_k(&name, &req.embedding, k).await {
        Ok(matches) => matches,
        Err(e) => {
            warn!(collection = %name, error = %e, "search degraded to no match");
            Vec::new()
        }
    };

    let (person_id, similarity) = matches
        .first()
        .map(|m| (m.person_id, similarity_percent(m.score)))
        .unwrap_or((0, 0.0));

    Ok(Json(SearchResponse {
        person_id,
        similarity,
        matches: (k > 1).then(|| {
            matches
                .iter()
                .map(|m| MatchResponse {
                    person_id: m.person_id,
                    face_id: m.face_id.clone(),
                    similarity: similarity_percent(m.score),
                })
                .collect()
        }),
    }))
}

async fn delete_person(
    State(state): State<Arc<AppState>>,
    Path((name, person_id)): Path<(String, PersonId)>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let removed_records = state
        .faces
        .delete_person(&name, person_id)
        .await
        .map_err(api_error)?;
    let removed_entries = state
        .matcher
        .delete_person(&name, person_id)
        .await
        .map_err(api_error)?;

    Ok(Json(DeleteResponse {
        removed_records,
        removed_entries,
    }))
}

async fn delete_face(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<DeleteFaceRequest>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let removed_record = state
        .faces
        .delete_face(&name, &req.face_id)
        .await
        .map_err(api_error)?;
    let removed_entry = state
        .matcher
        .delete_face(&name, &req.face_id)
        .await
        .map_err(api_error)?;

    Ok(Json(DeleteResponse {
        removed_records: removed_record as usize,
        removed_entries: removed_entry as usize,
    }))
}

async fn create_collection(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let created = state
        .matcher
        .create_index(&name)
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::json!({"collection": name, "created": created})))
}

async fn delete_collection(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let index_existed = state
        .matcher
        .delete_index(&name)
        .await
        .map_err(api_error)?;
    let documents_existed = state
        .faces
        .drop_collection(&name)
        .await
        .map_err(api_error)?;

    if !index_existed && !documents_existed {
        return Err(api_error(FaceMatchError::NotFound { collection: name }));
    }
    Ok(Json(serde_json::json!({"collection": name, "status": "deleted"})))
}

async fn rebuild_collection(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let count = state
        .matcher
        .update_index(&name)
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::json!({"collection": name, "count": count})))
}

async fn rebuild_all(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let rebuilt = state.matcher.update_all().await.map_err(api_error)?;
    Ok(Json(serde_json::json!({"rebuilt": rebuilt})))
}

async fn collection_stats(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<IndexStats>, ApiError> {
    state
        .matcher
        .get_index_stats(&name)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn list_collections(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CollectionsResponse>, ApiError> {
    let collections = state.faces.list_collections().await.map_err(api_error)?;
    let indexed = state.matcher.list_indexes().await.map_err(api_error)?;
    Ok(Json(CollectionsResponse {
        collections,
        indexed,
    }))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let index_count = state
        .matcher
        .list_indexes()
        .await
        .map(|names| names.len())
        .unwrap_or(0);

    Json(HealthResponse {
        status: "ok".to_string(),
        index_count,
    })
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsReport> {
    Json(state.matcher.metrics())
}
