//! API and static-serving handlers

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use berth_common::{DeploymentRecord, LogEntry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::detect;
use crate::fetch::SourceFetcher;
use crate::pipeline::{DeployOutcome, Pipeline, RedeployOutcome, VerifyOutcome};
use crate::resolve::{self, ServingRoot};
use crate::rewrite;
use crate::store::RecordStore;

/// Flat payment price for a blocked deployment
const PAYMENT_AMOUNT: u32 = 10;
const PAYMENT_CURRENCY: &str = "INR";

/// Shared application state
pub struct AppState {
    pub pipeline: Pipeline,
    pub store: Arc<RecordStore>,
}

impl AppState {
    pub fn new(config: &Config, store: Arc<RecordStore>, fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self {
            pipeline: Pipeline::new(config, store.clone(), fetcher),
            store,
        }
    }
}

/// API Error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message
        });

        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

/// The requesting user, from the `x-user-id` header. Session mechanics
/// live outside this service; ownership checks still apply.
fn owner_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "Unauthorized"))
}

/// Fetch a record and require it to belong to the caller. Unknown and
/// foreign ids are indistinguishable to the caller.
async fn owned_record(
    state: &AppState,
    headers: &HeaderMap,
    id: Uuid,
) -> Result<DeploymentRecord, ApiError> {
    let owner = owner_id(headers)?;
    state
        .store
        .get(id)
        .await
        .filter(|r| r.owner_id == owner)
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::FORBIDDEN,
                "Site not found or unauthorized",
            )
        })
}

/// Request to deploy a repository
#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    pub repo_url: String,

    #[serde(default)]
    pub project_name: Option<String>,
}

/// Successful deployment response
#[derive(Debug, Serialize)]
pub struct DeployResponse {
    pub success: bool,
    pub deployment_id: Uuid,
    pub url: String,
}

/// Payment-required response, sent with status 402
#[derive(Debug, Serialize)]
pub struct PaymentRequiredResponse {
    pub requires_payment: bool,
    pub deployment_id: Uuid,
    pub amount: u32,
    pub currency: String,
    pub project_size_mb: u64,
    pub current_usage_mb: u64,
    pub total_storage_mb: u64,
    pub free_limit_mb: u64,
    pub message: String,
}

/// Request to verify a payment for a blocked deployment
#[derive(Debug, Deserialize)]
pub struct VerifyPaymentRequest {
    pub deployment_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct VerifyPaymentResponse {
    pub success: bool,
    pub message: String,
    pub deployment_id: Uuid,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct BuildStatusResponse {
    pub deployment_id: Uuid,
    pub has_manifest: bool,
    pub is_built: bool,
    pub status: String,
}

/// Health check
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "deploy-service"
    }))
}

/// Favicon requests get an empty answer instead of 404 noise
pub async fn favicon_handler() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

/// Deploy a repository
pub async fn deploy_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<DeployRequest>,
) -> Result<Response, ApiError> {
    let owner = owner_id(&headers)?;

    if payload.repo_url.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Repo URL required"));
    }

    info!("Deploy request from {}: {}", owner, payload.repo_url);

    let (id, outcome) = state
        .pipeline
        .deploy(&owner, payload.repo_url.trim(), payload.project_name)
        .await;

    match outcome {
        DeployOutcome::Live { url } => Ok(Json(DeployResponse {
            success: true,
            deployment_id: id,
            url,
        })
        .into_response()),
        DeployOutcome::PaymentRequired(decision) => {
            let free_limit_mb = state.pipeline.free_limit_mb();
            let body = PaymentRequiredResponse {
                requires_payment: true,
                deployment_id: id,
                amount: PAYMENT_AMOUNT,
                currency: PAYMENT_CURRENCY.to_string(),
                project_size_mb: decision.project_size_mb,
                current_usage_mb: decision.current_usage_mb,
                total_storage_mb: decision.current_usage_mb + decision.project_size_mb,
                free_limit_mb,
                message: format!(
                    "Free {free_limit_mb}MB limit reached. Pay {PAYMENT_CURRENCY} {PAYMENT_AMOUNT} to deploy this project."
                ),
            };
            Ok((StatusCode::PAYMENT_REQUIRED, Json(body)).into_response())
        }
        DeployOutcome::Failed => Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Deployment failed",
        )),
    }
}

/// List the caller's deployments
pub async fn list_sites_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<DeploymentRecord>>, ApiError> {
    let owner = owner_id(&headers)?;
    Ok(Json(state.store.list_by_owner(&owner).await))
}

/// Ordered pipeline log for a deployment
pub async fn logs_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<LogEntry>>, ApiError> {
    let record = owned_record(&state, &headers, id).await?;
    Ok(Json(record.log))
}

/// Delete a deployment and its artifacts
pub async fn delete_site_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<SuccessResponse>, ApiError> {
    owned_record(&state, &headers, id).await?;

    state.pipeline.delete(id).await?;
    Ok(Json(SuccessResponse { success: true }))
}

/// Redeploy an existing deployment
pub async fn redeploy_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<SuccessResponse>, ApiError> {
    owned_record(&state, &headers, id).await?;

    match state.pipeline.redeploy(id).await {
        RedeployOutcome::Live { .. } => Ok(Json(SuccessResponse { success: true })),
        RedeployOutcome::NotAllowed => Err(ApiError::new(
            StatusCode::CONFLICT,
            "Redeploy not allowed in the deployment's current status",
        )),
        RedeployOutcome::Failed => Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Redeploy failed",
        )),
    }
}

/// Payment-verification callback: flips a blocked deployment to live
pub async fn verify_payment_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<VerifyPaymentRequest>,
) -> Result<Json<VerifyPaymentResponse>, ApiError> {
    owned_record(&state, &headers, payload.deployment_id).await?;

    match state.pipeline.verify_payment(payload.deployment_id).await? {
        Some(VerifyOutcome::Verified { url }) => Ok(Json(VerifyPaymentResponse {
            success: true,
            message: "Payment verified and site deployed".to_string(),
            deployment_id: payload.deployment_id,
            url,
        })),
        Some(VerifyOutcome::WrongState) => Err(ApiError::new(
            StatusCode::CONFLICT,
            "Deployment is not awaiting payment",
        )),
        None => Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "Site not found or unauthorized",
        )),
    }
}

/// Build an existing deployment's tree
pub async fn build_site_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<SuccessResponse>, ApiError> {
    owned_record(&state, &headers, id).await?;

    if !state.pipeline.workdir(id).is_dir() {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("Deployment {id} not found"),
        ));
    }

    match state.pipeline.build_existing(id).await {
        Ok(true) => Ok(Json(SuccessResponse { success: true })),
        Ok(false) => Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to build {id}: no project manifest"),
        )),
        Err(e) => {
            error!("Build of {} failed: {}", id, e);
            Err(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to build {id}"),
            ))
        }
    }
}

/// Whether a deployment needs a build and whether it already has output
pub async fn build_status_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<BuildStatusResponse>, ApiError> {
    owned_record(&state, &headers, id).await?;

    let workdir = state.pipeline.workdir(id);
    if !workdir.is_dir() {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("Deployment {id} not found"),
        ));
    }

    let has_manifest = detect::find_project_root(&workdir).is_some();
    let is_built = detect::is_built(&workdir);
    let status = if is_built {
        "ready"
    } else if has_manifest {
        "needs-build"
    } else {
        "static"
    };

    Ok(Json(BuildStatusResponse {
        deployment_id: id,
        has_manifest,
        is_built,
        status: status.to_string(),
    }))
}

/// Serve a deployment's entry document
pub async fn serve_site_index(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    serve_deployment(&state, id, "")
}

/// Serve a path under a deployment
pub async fn serve_site_path(
    State(state): State<Arc<AppState>>,
    Path((id, path)): Path<(Uuid, String)>,
) -> Response {
    serve_deployment(&state, id, &path)
}

/// Serve the most recently created deployment with a valid serving root
pub async fn serve_latest_index(State(state): State<Arc<AppState>>) -> Response {
    serve_latest(&state, "").await
}

pub async fn serve_latest_path(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Response {
    serve_latest(&state, &path).await
}

async fn serve_latest(state: &AppState, path: &str) -> Response {
    let mut records = state.store.list_all().await;
    records.sort_by_key(|r| r.created_at);

    let latest = records
        .iter()
        .rev()
        .find(|r| resolve::find_serving_root(&state.pipeline.workdir(r.id)).is_some());

    match latest {
        Some(record) => serve_deployment(state, record.id, path),
        None => (StatusCode::NOT_FOUND, "No deployment found").into_response(),
    }
}

fn serve_deployment(state: &AppState, id: Uuid, path: &str) -> Response {
    let workdir = state.pipeline.workdir(id);
    let Some(root) = resolve::find_serving_root(&workdir) else {
        return (
            StatusCode::NOT_FOUND,
            format!("Deployment not found: {id}"),
        )
            .into_response();
    };

    serve_from_root(&root, path)
}

/// Resolve and serve one request against a serving root.
///
/// Entry-document requests and navigational misses deliver the entry
/// document with its asset references rewritten; everything else is served
/// as-is.
fn serve_from_root(root: &ServingRoot, request_path: &str) -> Response {
    let bare = request_path.split('?').next().unwrap_or("");
    let is_entry_request = bare.trim_matches('/').is_empty();

    if !is_entry_request {
        if let Some(file) = resolve::resolve_path(&root.dir, request_path) {
            return serve_file(&file);
        }
    }

    if resolve::is_navigational(request_path) {
        if let Some(entry) = resolve::fallback_entry(root) {
            return serve_entry(&entry, root.nested_prefix.as_deref());
        }
    }

    (
        StatusCode::NOT_FOUND,
        format!("File not found: {request_path}"),
    )
        .into_response()
}

fn serve_file(path: &std::path::Path) -> Response {
    match std::fs::read(path) {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, resolve::content_type(path))],
            bytes,
        )
            .into_response(),
        Err(e) => {
            error!("Error reading {}: {}", path.display(), e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Error reading file").into_response()
        }
    }
}

fn serve_entry(path: &std::path::Path, nested_prefix: Option<&str>) -> Response {
    match std::fs::read_to_string(path) {
        Ok(html) => {
            let html = rewrite::rewrite_entry_document(&html, nested_prefix);
            (
                [
                    (header::CONTENT_TYPE, "text/html; charset=utf-8"),
                    (header::CACHE_CONTROL, "no-cache, must-revalidate"),
                ],
                html,
            )
                .into_response()
        }
        Err(e) => {
            error!("Error reading entry document {}: {}", path.display(), e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Error reading entry document").into_response()
        }
    }
}
