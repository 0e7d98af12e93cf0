//! Administrative controls and diagnostics, mounted under `/admin`.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use wsman_model::{InstanceName, InstanceOwner, WorkspaceHash};

use crate::assignments::PoolSizes;
use crate::builds::BuildStatus;
use crate::git::{self, GitTaskInfo, ImportKey, RebaseKey, StoredVersion};
use crate::security::json_error;
use crate::state::AppState;

const DEFAULT_LOG_LINES: u32 = 1000;
const MAX_LOG_LINES: u32 = 10_000;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/disable-instance", post(disable_instance))
        .route("/enable-instance", post(enable_instance))
        .route("/change-unassigned", post(change_unassigned))
        .route("/instances", get(instances))
        .route("/log/:instance/content", get(log_content))
        .route("/log/:instance/events", get(log_events))
        .route("/git/refs", get(git_refs))
        .route("/git/tasks", get(git_tasks))
        .route("/git/import", post(git_import))
        .route("/git/rebase", post(git_rebase))
        .route("/git/invalidate", post(git_invalidate))
}

#[derive(Debug, Deserialize)]
pub struct InstanceRequest {
    pub instance: String,
}

#[derive(Debug, Serialize)]
pub struct InstanceToggled {
    pub instance: String,
    pub disabled: bool,
    pub changed: bool,
}

async fn disable_instance(State(state): State<AppState>, Json(input): Json<InstanceRequest>) -> Response {
    set_disabled(&state, input.instance, true)
}

async fn enable_instance(State(state): State<AppState>, Json(input): Json<InstanceRequest>) -> Response {
    set_disabled(&state, input.instance, false)
}

fn set_disabled(state: &AppState, instance: String, disabled: bool) -> Response {
    if instance.trim().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "instance is required");
    }
    let name = InstanceName(instance);
    let disabled_set = &state.manager.disabled;
    let changed = if disabled {
        disabled_set.disable(&name)
    } else {
        disabled_set.enable(&name)
    };
    tracing::info!(instance = %name, disabled, changed, "instance toggled");
    Json(InstanceToggled {
        instance: name.0,
        disabled,
        changed,
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct ChangeUnassignedRequest {
    pub workspace_hash: String,
    pub value: u32,
}

#[derive(Debug, Serialize)]
pub struct ChangeUnassignedResponse {
    pub workspace_hash: String,
    pub pool: PoolSizes,
}

const MAX_POOL_SIZE: u32 = 100;

async fn change_unassigned(
    State(state): State<AppState>,
    Json(input): Json<ChangeUnassignedRequest>,
) -> Response {
    if input.value > MAX_POOL_SIZE {
        return json_error(
            StatusCode::BAD_REQUEST,
            format!("pool size must be at most {MAX_POOL_SIZE}"),
        );
    }
    let manager = &state.manager;
    let hash = WorkspaceHash(input.workspace_hash);
    let table = match manager.registry.get(&hash) {
        Some(table) => table,
        None if manager.registry.is_retired(&hash) => {
            return json_error(StatusCode::CONFLICT, "workspace version was superseded");
        }
        None => match manager.catalog.version(&hash) {
            Some(version) => manager.registry.get_or_create(&version),
            None => return json_error(StatusCode::NOT_FOUND, "unknown workspace version"),
        },
    };
    table.set_unassigned_pool_size(input.value, true);
    tracing::info!(hash = %hash, value = input.value, "unassigned pool size changed");
    Json(ChangeUnassignedResponse {
        workspace_hash: hash.0,
        pool: table.pool_sizes(),
    })
    .into_response()
}

#[derive(Debug, Serialize)]
pub struct InstanceRow {
    pub instance: String,
    pub instance_id: String,
    pub workspace: String,
    pub workspace_hash: String,
    pub owner: InstanceOwner,
    pub disabled: bool,
}

#[derive(Debug, Serialize)]
pub struct VersionRow {
    pub workspace: String,
    pub workspace_hash: String,
    pub build: BuildStatus,
    pub pool: PoolSizes,
    pub instances: Vec<InstanceRow>,
}

async fn instances(State(state): State<AppState>) -> Json<Vec<VersionRow>> {
    let manager = &state.manager;
    let disabled = manager.disabled.snapshot();
    let rows = manager
        .registry
        .tables()
        .into_iter()
        .map(|table| {
            let version = table.version();
            let instances = table
                .snapshot()
                .into_iter()
                .map(|(owner, name)| InstanceRow {
                    instance_id: name.uuid().to_string(),
                    workspace: version.id().to_string(),
                    workspace_hash: version.hash().to_string(),
                    disabled: disabled.contains(&name),
                    instance: name.0,
                    owner,
                })
                .collect();
            VersionRow {
                workspace: version.id().to_string(),
                workspace_hash: version.hash().to_string(),
                build: manager.builds.peek(version.hash()),
                pool: table.pool_sizes(),
                instances,
            }
        })
        .collect();
    Json(rows)
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub tail: Option<u32>,
}

async fn log_content(
    State(state): State<AppState>,
    Path(instance): Path<String>,
    Query(query): Query<LogQuery>,
) -> Response {
    let manager = &state.manager;
    let pod = match manager.bounded(manager.cluster.find_pod(&instance)).await {
        Ok(Some(pod)) => pod,
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "no pod for instance"),
        Err(e) => return json_error(StatusCode::BAD_GATEWAY, e.to_string()),
    };
    let tail = query.tail.unwrap_or(DEFAULT_LOG_LINES).clamp(1, MAX_LOG_LINES);
    match manager.bounded(manager.cluster.pod_logs(&pod.name, tail)).await {
        Ok(text) => ([("content-type", "text/plain; charset=utf-8")], text).into_response(),
        Err(e) => json_error(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

async fn log_events(State(state): State<AppState>, Path(instance): Path<String>) -> Response {
    let manager = &state.manager;
    match manager.bounded(manager.cluster.list_events(&instance)).await {
        Ok(events) => Json(events).into_response(),
        Err(e) => json_error(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct RefsQuery {
    pub url: String,
}

async fn git_refs(Query(query): Query<RefsQuery>) -> Response {
    match git::list_remote_refs(&query.url).await {
        Ok(refs) => Json(refs).into_response(),
        Err(git::GitError::InvalidArgument { what, value }) => {
            json_error(StatusCode::BAD_REQUEST, format!("invalid {what}: {value:?}"))
        }
        Err(e) => json_error(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

#[derive(Debug, Serialize)]
pub struct GitTasksResponse {
    pub imports: Vec<GitTaskInfo<ImportKey>>,
    pub rebases: Vec<GitTaskInfo<RebaseKey>>,
}

async fn git_tasks(State(state): State<AppState>) -> Json<GitTasksResponse> {
    Json(GitTasksResponse {
        imports: state.git.imports(),
        rebases: state.git.rebases(),
    })
}

#[derive(Debug, Deserialize)]
pub struct TaskRequest<K> {
    #[serde(flatten)]
    pub key: K,
    /// Wait for the outcome instead of answering `202 Accepted` right away.
    #[serde(default)]
    pub wait: bool,
}

fn task_response(result: Option<wsman_core::TaskResult<StoredVersion>>) -> Response {
    match result {
        None => (StatusCode::ACCEPTED, Json(serde_json::json!({ "state": "running" }))).into_response(),
        Some(Ok(version)) => Json(version).into_response(),
        Some(Err(failure)) => json_error(StatusCode::UNPROCESSABLE_ENTITY, failure.message()),
    }
}

async fn git_import(State(state): State<AppState>, Json(input): Json<TaskRequest<ImportKey>>) -> Response {
    let handle = state.git.import(input.key);
    if input.wait {
        return task_response(Some(handle.await_result().await));
    }
    handle.launch();
    task_response(handle.try_result())
}

async fn git_rebase(State(state): State<AppState>, Json(input): Json<TaskRequest<RebaseKey>>) -> Response {
    let handle = state.git.rebase(input.key);
    if input.wait {
        return task_response(Some(handle.await_result().await));
    }
    handle.launch();
    task_response(handle.try_result())
}

/// Which cached task to forget so the next request runs it again.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvalidateRequest {
    Import(ImportKey),
    Rebase(RebaseKey),
    Build { workspace_hash: String },
}

async fn git_invalidate(State(state): State<AppState>, Json(input): Json<InvalidateRequest>) -> Response {
    let removed = match &input {
        InvalidateRequest::Import(key) => state.git.invalidate_import(key),
        InvalidateRequest::Rebase(key) => state.git.invalidate_rebase(key),
        InvalidateRequest::Build { workspace_hash } => {
            let removed = state
                .manager
                .builds
                .invalidate(&WorkspaceHash(workspace_hash.clone()));
            if removed {
                state.manager.wake.fire(());
            }
            removed
        }
    };
    tracing::info!(request = ?input, removed, "task cache invalidated");
    Json(serde_json::json!({ "removed": removed })).into_response()
}
