//! Administrative surface.
//!
//! Task CRUD, user management and dashboard stats. Balance overrides
//! write the user record directly and intentionally bypass the supply
//! ledger (the admin escape hatch); everything else is plain field
//! mutation outside the ledger core.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::LedgerError;
use crate::server::{AppState, AuthedUser};
use crate::storage::{AdminUserUpdate, ReferrerRow, User};
use crate::tasks::{NewTask, Task, TaskUpdate};

const TOP_REFERRERS_LIMIT: i64 = 30;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/admin/dashboard-stats", get(dashboard_stats_handler))
        .route("/api/admin/users", get(list_users_handler))
        .route("/api/admin/users/search", get(search_users_handler))
        .route(
            "/api/admin/users/:id",
            get(get_user_handler)
                .put(update_user_handler)
                .delete(delete_user_handler),
        )
        .route(
            "/api/admin/leaderboard/referrers",
            get(top_referrers_handler),
        )
        .route("/api/admin/tasks", post(create_task_handler))
        .route(
            "/api/admin/tasks/:id",
            axum::routing::put(update_task_handler).delete(delete_task_handler),
        )
}

/// Resolve the caller and require the admin flag.
fn require_admin(state: &AppState, auth: &AuthedUser) -> Result<User, LedgerError> {
    let user = state
        .storage
        .user_by_id(&auth.0)?
        .ok_or(LedgerError::Forbidden)?;
    if !user.is_admin {
        return Err(LedgerError::Forbidden);
    }
    Ok(user)
}

// ============================================================================
// DASHBOARD
// ============================================================================

#[derive(Debug, Serialize)]
pub struct DashboardStats {
    pub total_users: i64,
    pub total_supply: f64,
    pub circulating_supply: f64,
    pub remaining_supply: f64,
    pub active_tasks: i64,
    pub total_tasks: i64,
}

async fn dashboard_stats_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthedUser,
) -> Result<Json<DashboardStats>, LedgerError> {
    require_admin(&state, &auth)?;

    let total_users = state.storage.count_users()?;
    let snapshot = state.supply.snapshot()?;
    let (total_tasks, active_tasks) = state.storage.count_tasks()?;

    Ok(Json(DashboardStats {
        total_users,
        total_supply: snapshot.total_supply,
        circulating_supply: snapshot.circulating_supply,
        remaining_supply: snapshot.remaining(),
        active_tasks,
        total_tasks,
    }))
}

// ============================================================================
// USERS
// ============================================================================

#[derive(Debug, Serialize)]
pub struct UsersResponse {
    pub success: bool,
    pub users: Vec<User>,
}

async fn list_users_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthedUser,
) -> Result<Json<UsersResponse>, LedgerError> {
    require_admin(&state, &auth)?;
    let users = state.storage.list_users()?;
    Ok(Json(UsersResponse {
        success: true,
        users,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub username: String,
}

async fn search_users_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthedUser,
    Query(query): Query<SearchQuery>,
) -> Result<Json<UsersResponse>, LedgerError> {
    require_admin(&state, &auth)?;
    let users = state.storage.search_users(&query.username)?;
    Ok(Json(UsersResponse {
        success: true,
        users,
    }))
}

async fn get_user_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthedUser,
    Path(id): Path<String>,
) -> Result<Json<User>, LedgerError> {
    require_admin(&state, &auth)?;
    let user = state
        .storage
        .user_by_id(&id)?
        .ok_or(LedgerError::UserNotFound)?;
    Ok(Json(user))
}

async fn update_user_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthedUser,
    Path(id): Path<String>,
    Json(update): Json<AdminUserUpdate>,
) -> Result<Json<User>, LedgerError> {
    let admin = require_admin(&state, &auth)?;
    let user = state.storage.admin_update_user(&id, &update)?;
    info!("Admin {} updated user {}", admin.username, user.username);
    Ok(Json(user))
}

async fn delete_user_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthedUser,
    Path(id): Path<String>,
) -> Result<StatusCode, LedgerError> {
    let admin = require_admin(&state, &auth)?;
    state.storage.delete_user(&id)?;
    info!("Admin {} deleted user {}", admin.username, id);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct ReferrersResponse {
    pub success: bool,
    pub data: Vec<ReferrerRow>,
}

async fn top_referrers_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthedUser,
) -> Result<Json<ReferrersResponse>, LedgerError> {
    require_admin(&state, &auth)?;
    let data = state.storage.top_referrers(TOP_REFERRERS_LIMIT)?;
    Ok(Json(ReferrersResponse {
        success: true,
        data,
    }))
}

// ============================================================================
// TASKS
// ============================================================================

async fn create_task_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthedUser,
    Json(new): Json<NewTask>,
) -> Result<(StatusCode, Json<Task>), LedgerError> {
    require_admin(&state, &auth)?;

    if new.name.trim().is_empty() || new.link.trim().is_empty() || new.platform.trim().is_empty() {
        return Err(LedgerError::InvalidAmount(
            "Task name, link and platform are required.".to_string(),
        ));
    }
    if new.reward <= 0.0 {
        return Err(LedgerError::InvalidAmount(
            "Task reward must be a positive amount.".to_string(),
        ));
    }

    let task = state.storage.create_task(&new)?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn update_task_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthedUser,
    Path(id): Path<String>,
    Json(update): Json<TaskUpdate>,
) -> Result<Json<Task>, LedgerError> {
    require_admin(&state, &auth)?;

    if let Some(reward) = update.reward {
        if reward <= 0.0 {
            return Err(LedgerError::InvalidAmount(
                "Task reward must be a positive amount.".to_string(),
            ));
        }
    }

    let task = state.storage.update_task(&id, &update)?;
    Ok(Json(task))
}

async fn delete_task_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthedUser,
    Path(id): Path<String>,
) -> Result<StatusCode, LedgerError> {
    let admin = require_admin(&state, &auth)?;
    state.storage.delete_task(&id)?;
    info!("Admin {} deleted task {}", admin.username, id);
    Ok(StatusCode::NO_CONTENT)
}
