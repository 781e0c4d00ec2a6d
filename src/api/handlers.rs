//! API request handlers

use super::models::{
    DownloadStatus, HealthResponse, ManifestSelector, PathResponse, ResetRequest, ResetResponse,
    StartResponse, UpdateCheckResponse, ValidateRequest, ValidateResponse,
};
use super::routes::AppState;
use crate::download::StartOutcome;
use crate::error::ApiError;
use crate::layout::{RepoKind, RepositoryId};
use crate::validator;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;

fn repository(kind: &str, id: &str) -> Result<RepositoryId, ApiError> {
    let kind: RepoKind = kind.parse()?;
    Ok(RepositoryId::new(kind, id)?)
}

/// GET /health - Service health check
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let manager = state.cache.manager().await;
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now(),
            cache_root: manager.cache_root().to_path_buf(),
            active_downloads: manager.active_count(),
        }),
    )
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// GET /downloads - List all known repositories
pub async fn list_downloads(State(state): State<AppState>) -> Json<Vec<DownloadStatus>> {
    let manager = state.cache.manager().await;
    let list: Vec<DownloadStatus> = manager.list().into_iter().map(Into::into).collect();

    crate::metrics::update_active_downloads(manager.active_count());

    Json(list)
}

/// GET /downloads/{kind}/{id} - Download state of one repository
pub async fn get_download(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<DownloadStatus>, ApiError> {
    let repo = repository(&kind, &id)?;
    let info = state.cache.manager().await.get_download_info(&repo);
    Ok(Json(info.into()))
}

/// POST /downloads/{kind}/{id}/start - Start or resume a download
pub async fn start_download(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<(StatusCode, Json<StartResponse>), ApiError> {
    let repo = repository(&kind, &id)?;
    let manager = state.cache.manager().await;

    let (status, outcome) = match manager.start_download(&repo)? {
        StartOutcome::Started => (StatusCode::ACCEPTED, "started"),
        StartOutcome::AlreadyActive => (StatusCode::OK, "already_active"),
        StartOutcome::AlreadyComplete(_) => (StatusCode::OK, "already_complete"),
    };

    let response = StartResponse {
        outcome: outcome.to_string(),
        status: manager.get_download_info(&repo).into(),
    };

    Ok((status, Json(response)))
}

/// POST /downloads/{kind}/{id}/pause - Pause an active download
pub async fn pause_download(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<DownloadStatus>, ApiError> {
    let repo = repository(&kind, &id)?;
    let manager = state.cache.manager().await;

    if !manager.pause_download(&repo).await {
        return Err(ApiError::Conflict(format!("{} has no active download", repo)));
    }

    Ok(Json(manager.get_download_info(&repo).into()))
}

/// DELETE /downloads/{kind}/{id} - Abort and delete everything cached
pub async fn remove_download(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let repo = repository(&kind, &id)?;
    state.cache.manager().await.remove_download(&repo).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /downloads/{kind}/{id}/path - Validated install path
pub async fn downloaded_path(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<PathResponse>, ApiError> {
    let repo = repository(&kind, &id)?;
    let path = state
        .cache
        .manager()
        .await
        .get_downloaded_file(&repo)
        .ok_or_else(|| ApiError::NotFound(format!("{} is not installed", repo)))?;

    Ok(Json(PathResponse {
        repository: repo,
        path,
    }))
}

/// POST /downloads/{kind}/{id}/check-update - Compare with the registry
pub async fn check_update(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<UpdateCheckResponse>, ApiError> {
    let repo = repository(&kind, &id)?;
    let has_update = state.cache.manager().await.check_for_update(&repo).await?;

    Ok(Json(UpdateCheckResponse {
        repository: repo,
        has_update,
    }))
}

/// POST /validate - Validate an arbitrary directory
pub async fn validate(
    State(state): State<AppState>,
    Json(req): Json<ValidateRequest>,
) -> Result<Json<ValidateResponse>, ApiError> {
    let files = match req.manifest {
        None => Vec::new(),
        Some(ManifestSelector::Files(files)) => files,
        Some(ManifestSelector::Family(family)) => state
            .cache
            .manager()
            .await
            .catalog()
            .family(&family)
            .map(|m| m.files().to_vec())
            .ok_or_else(|| ApiError::BadRequest(format!("Unknown manifest '{}'", family)))?,
    };

    let result = tokio::task::spawn_blocking(move || validator::validate(&req.path, &files))
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;

    Ok(Json(match result {
        Ok(()) => ValidateResponse {
            valid: true,
            reason: None,
        },
        Err(failure) => ValidateResponse {
            valid: false,
            reason: Some(failure.to_string()),
        },
    }))
}

/// POST /reset - Re-root the cache, discarding in-memory state
pub async fn reset(
    State(state): State<AppState>,
    Json(req): Json<ResetRequest>,
) -> Result<Json<ResetResponse>, ApiError> {
    if req.cache_root.as_os_str().is_empty() {
        return Err(ApiError::BadRequest("cache_root must not be empty".to_string()));
    }

    let manager = state.cache.reset_instance(req.cache_root).await?;

    Ok(Json(ResetResponse {
        cache_root: manager.cache_root().to_path_buf(),
    }))
}

/// GET /events - Server-sent stream of download events
pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.cache.manager().await.subscribe();

    // Lagged subscribers skip what they missed
    let stream = BroadcastStream::new(rx).filter_map(|event| async move {
        let event = event.ok()?;
        Event::default()
            .event(event.name())
            .json_data(&event)
            .ok()
            .map(Ok)
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
