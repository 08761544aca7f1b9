use crate::config::Listener as ListenerConfig;
use crate::directory::{DirectoryError, IdentityDirectory};
use crate::metrics_defs::API_ERRORS;
use crate::reconciler::{DeviceAssignmentReconciler, ReconcileError};
use crate::types::{DeviceRecord, User, UserStatus};
use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
};
use serde::{Deserialize, Serialize};
use shared::counter;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

#[derive(Serialize)]
struct ApiErrorResponse {
    error_message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_)
            | ApiError::Directory(DirectoryError::UnknownGroup(_))
            | ApiError::Reconcile(ReconcileError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
            ApiError::Directory(DirectoryError::UserNotFound(_))
            | ApiError::Reconcile(ReconcileError::DeviceNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Directory(DirectoryError::UserExists(_))
            | ApiError::Reconcile(ReconcileError::Conflict(_)) => StatusCode::CONFLICT,
            ApiError::Directory(_) | ApiError::Reconcile(ReconcileError::Store(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }
        counter!(API_ERRORS, "status" => status.as_str().to_owned()).increment(1);

        let body = Json(ApiErrorResponse {
            error_message: self.to_string(),
        });
        (status, body).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<DeviceAssignmentReconciler>,
    pub directory: Arc<dyn IdentityDirectory>,
    pub groups: Arc<BTreeSet<String>>,
}

impl AppState {
    fn check_group(&self, group: &str) -> Result<(), ApiError> {
        if self.groups.contains(group) {
            Ok(())
        } else {
            Err(DirectoryError::UnknownGroup(group.to_string()).into())
        }
    }

    async fn view(&self, user: User) -> Result<UserView, ApiError> {
        let device_uid = self.reconciler.current_device(&user.email).await?;
        Ok(UserView {
            id: user.id,
            email: user.email,
            name: user.name,
            groups: user.groups,
            status: user.status,
            created_at: user.created_at,
            device_uid,
        })
    }
}

/// A directory user joined with the device they own.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct UserView {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub groups: BTreeSet<String>,
    pub status: UserStatus,
    pub created_at: u64,
    pub device_uid: Option<String>,
}

#[derive(Deserialize, Debug)]
struct InviteRequest {
    email: String,
    #[serde(default)]
    name: Option<String>,
    group: String,
    #[serde(default)]
    device_uids: Vec<String>,
}

#[derive(Deserialize, Debug)]
struct GroupsRequest {
    groups: BTreeSet<String>,
}

#[derive(Deserialize, Debug)]
struct DeviceRequest {
    #[serde(default)]
    device_uid: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/users", get(list_users).post(invite_user))
        .route("/users/{id}", get(get_user))
        .route("/users/{id}/groups", put(set_groups))
        .route("/users/{id}/device", put(set_device))
        .route("/devices/unassigned", get(list_unassigned))
        .with_state(state)
}

pub async fn serve(listener: ListenerConfig, state: AppState) -> Result<(), std::io::Error> {
    let addr = format!("{}:{}", listener.host, listener.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "device manager API listening");
    axum::serve(listener, router(state)).await
}

async fn list_users(State(state): State<AppState>) -> Result<Json<Vec<UserView>>, ApiError> {
    let users = state.directory.list_users().await?;
    let mut views = Vec::with_capacity(users.len());
    for user in users {
        views.push(state.view(user).await?);
    }
    Ok(Json(views))
}

async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<UserView>, ApiError> {
    let user = state.directory.get_user(&id).await?;
    Ok(Json(state.view(user).await?))
}

async fn invite_user(
    State(state): State<AppState>,
    body: Result<Json<InviteRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<UserView>), ApiError> {
    let Json(req) = body?;
    let email = req.email.trim();
    if email.is_empty() {
        return Err(ApiError::BadRequest("email is required".into()));
    }
    state.check_group(&req.group)?;
    let device_uid = req.device_uids.first().map(|uid| uid.trim());
    if device_uid.is_some_and(str::is_empty) {
        return Err(ApiError::BadRequest("device_uid cannot be empty".into()));
    }

    let user = state.directory.create_user(email, req.name.as_deref()).await?;
    state.directory.add_user_to_group(&user.id, &req.group).await?;
    if let Some(device_uid) = device_uid {
        state
            .reconciler
            .assign(device_uid, &user.email, req.name.as_deref())
            .await?;
    }

    let user = state.directory.get_user(&user.id).await?;
    tracing::info!(user = %user.email, group = %req.group, ?device_uid, "invited user");
    Ok((StatusCode::CREATED, Json(state.view(user).await?)))
}

async fn set_groups(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<GroupsRequest>, JsonRejection>,
) -> Result<Json<UserView>, ApiError> {
    let Json(req) = body?;
    for group in &req.groups {
        state.check_group(group)?;
    }

    let current: BTreeSet<String> = state
        .directory
        .list_groups_for_user(&id)
        .await?
        .into_iter()
        .collect();
    for group in req.groups.difference(&current) {
        state.directory.add_user_to_group(&id, group).await?;
    }
    for group in current.difference(&req.groups) {
        state.directory.remove_user_from_group(&id, group).await?;
    }

    let user = state.directory.get_user(&id).await?;
    Ok(Json(state.view(user).await?))
}

async fn set_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<DeviceRequest>, JsonRejection>,
) -> Result<Json<UserView>, ApiError> {
    let Json(req) = body?;
    let user = state.directory.get_user(&id).await?;
    state
        .reconciler
        .reassign_user_device(&user.email, user.name.as_deref(), req.device_uid.as_deref())
        .await?;
    Ok(Json(state.view(user).await?))
}

async fn list_unassigned(
    State(state): State<AppState>,
) -> Result<Json<Vec<DeviceRecord>>, ApiError> {
    Ok(Json(state.reconciler.list_unassigned_devices().await?))
}
