//! DialFi Airdrop Server
//!
//! HTTP surface for the airdrop ledger. The session collaborator
//! authenticates requests upstream and forwards the user identity in the
//! x-user-id header; the core trusts it without re-verifying credentials.

use std::sync::Arc;

use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequestParts, State},
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::admin;
use crate::convert::ConversionEngine;
use crate::error::LedgerError;
use crate::mining::MiningGate;
use crate::payments::{InvoiceDetails, PaymentService};
use crate::referral::ReferralAccrual;
use crate::storage::{AirdropStorage, DifiLeaderboardRow, DpowerLeaderboardRow, NewUser};
use crate::supply::SupplyLedger;
use crate::tasks::{Task, TaskLedger};

const LEADERBOARD_LIMIT: i64 = 10;

pub struct AppState {
    pub storage: Arc<AirdropStorage>,
    pub supply: SupplyLedger,
    pub mining: MiningGate,
    pub conversion: ConversionEngine,
    pub tasks: TaskLedger,
    pub payments: PaymentService,
    pub referral: ReferralAccrual,
    pub started_at: std::time::Instant,
}

impl AppState {
    pub fn new(storage: Arc<AirdropStorage>, payments: PaymentService) -> Self {
        Self {
            supply: SupplyLedger::new(storage.clone()),
            mining: MiningGate::new(storage.clone()),
            conversion: ConversionEngine::new(storage.clone()),
            tasks: TaskLedger::new(storage.clone()),
            referral: ReferralAccrual::new(storage.clone()),
            payments,
            storage,
            started_at: std::time::Instant::now(),
        }
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/auth/register", post(register_handler))
        .route("/api/airdrop/total-supply", get(total_supply_handler))
        .route("/api/airdrop/mine", post(mine_handler))
        .route("/api/airdrop/convert-dpower", post(convert_handler))
        .route("/api/airdrop/tasks", get(tasks_handler))
        .route("/api/airdrop/claim-task", post(claim_task_handler))
        .route(
            "/api/airdrop/generate-payment-address",
            post(generate_payment_handler),
        )
        .route("/api/airdrop/webhook/nowpayments", post(webhook_handler))
        .route("/api/airdrop/leaderboard/difi", get(difi_leaderboard_handler))
        .route(
            "/api/airdrop/leaderboard/dpower",
            get(dpower_leaderboard_handler),
        )
        .merge(admin::router())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// AUTHENTICATION
// ============================================================================

/// Authenticated user identity forwarded by the session collaborator.
pub struct AuthedUser(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for AuthedUser
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match parts.headers.get("x-user-id").and_then(|v| v.to_str().ok()) {
            Some(id) if !id.is_empty() => Ok(AuthedUser(id.to_string())),
            _ => Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({ "success": false, "message": "Not authorized." })),
            )
                .into_response()),
        }
    }
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let status = match &self {
            LedgerError::CooldownActive { .. }
            | LedgerError::SupplyExhausted
            | LedgerError::InvalidAmount(_)
            | LedgerError::InsufficientBalance
            | LedgerError::AlreadyClaimed
            | LedgerError::UserExists
            | LedgerError::InvalidPayload => StatusCode::BAD_REQUEST,
            LedgerError::TaskNotFound
            | LedgerError::OrderNotFound
            | LedgerError::UserNotFound => StatusCode::NOT_FOUND,
            LedgerError::InvalidSignature
            | LedgerError::AccountBlocked
            | LedgerError::Forbidden => StatusCode::FORBIDDEN,
            LedgerError::Storage(_) | LedgerError::Gateway(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        // Internal failures get a generic message; details go to the log.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Internal error: {}", self);
            "Server error.".to_string()
        } else {
            self.to_string()
        };

        (status, Json(json!({ "success": false, "message": message }))).into_response()
    }
}

// ============================================================================
// PUBLIC + USER HANDLERS
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub uptime_secs: u64,
    pub version: String,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        uptime_secs: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub referral_code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub success: bool,
    pub message: String,
    pub user_id: String,
    pub referral_code: String,
}

async fn register_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), LedgerError> {
    if request.username.trim().is_empty() || request.email.trim().is_empty() {
        return Err(LedgerError::InvalidAmount(
            "Please enter all fields.".to_string(),
        ));
    }

    // Resolve the referrer first so the new user records the association;
    // an unknown code registers without one.
    let referrer = match &request.referral_code {
        Some(code) if !code.trim().is_empty() => state.referral.resolve_referrer(code.trim())?,
        _ => None,
    };

    let user = state.storage.create_user(&NewUser {
        username: request.username,
        email: request.email,
        referred_by: referrer.as_ref().map(|r| r.referral_code.clone()),
    })?;

    if let Some(referrer) = &referrer {
        state.referral.credit_referrer(referrer)?;
    }

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            success: true,
            message: "Registration successful!".to_string(),
            user_id: user.id,
            referral_code: user.referral_code,
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct TotalSupplyResponse {
    pub success: bool,
    pub total_supply: f64,
    pub circulating_supply: f64,
    pub remaining_supply: f64,
}

async fn total_supply_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TotalSupplyResponse>, LedgerError> {
    let snapshot = state.supply.snapshot()?;
    Ok(Json(TotalSupplyResponse {
        success: true,
        total_supply: snapshot.total_supply,
        circulating_supply: snapshot.circulating_supply,
        remaining_supply: snapshot.remaining(),
    }))
}

#[derive(Debug, Serialize)]
pub struct MineResponse {
    pub success: bool,
    pub message: String,
    pub user_difi_balance: f64,
    pub remaining_supply: f64,
    pub last_mine_timestamp: DateTime<Utc>,
}

async fn mine_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthedUser,
) -> Result<Json<MineResponse>, LedgerError> {
    let receipt = state.mining.mine(&auth.0)?;
    Ok(Json(MineResponse {
        success: true,
        message: format!("Successfully mined {} DiFi!", receipt.mined),
        user_difi_balance: receipt.difi_balance,
        remaining_supply: receipt.remaining_supply,
        last_mine_timestamp: receipt.last_mine_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ConvertRequest {
    pub amount: i64,
}

#[derive(Debug, Serialize)]
pub struct ConvertResponse {
    pub success: bool,
    pub message: String,
    pub user_dpower_balance: i64,
    pub user_difi_balance: f64,
    pub remaining_supply: f64,
}

async fn convert_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthedUser,
    Json(request): Json<ConvertRequest>,
) -> Result<Json<ConvertResponse>, LedgerError> {
    let receipt = state.conversion.convert(&auth.0, request.amount)?;
    Ok(Json(ConvertResponse {
        success: true,
        message: format!(
            "Successfully converted {} Dpower to {:.2} DiFi!",
            receipt.converted_points, receipt.tokens_earned
        ),
        user_dpower_balance: receipt.dpower_balance,
        user_difi_balance: receipt.difi_balance,
        remaining_supply: receipt.remaining_supply,
    }))
}

#[derive(Debug, Serialize)]
pub struct TasksResponse {
    pub success: bool,
    pub tasks: Vec<Task>,
    pub completed_task_ids: Vec<String>,
}

async fn tasks_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthedUser,
) -> Result<Json<TasksResponse>, LedgerError> {
    let tasks = state.tasks.list()?;
    let completed_task_ids = state.storage.completed_task_ids(&auth.0)?;
    Ok(Json(TasksResponse {
        success: true,
        tasks,
        completed_task_ids,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ClaimTaskRequest {
    pub task_id: String,
}

#[derive(Debug, Serialize)]
pub struct ClaimTaskResponse {
    pub success: bool,
    pub message: String,
    pub user_difi_balance: f64,
    pub remaining_supply: f64,
}

async fn claim_task_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthedUser,
    Json(request): Json<ClaimTaskRequest>,
) -> Result<Json<ClaimTaskResponse>, LedgerError> {
    let receipt = state.tasks.claim(&auth.0, &request.task_id)?;
    Ok(Json(ClaimTaskResponse {
        success: true,
        message: format!(
            "Task \"{}\" claimed! {} DiFi added to your balance.",
            receipt.task_name, receipt.reward
        ),
        user_difi_balance: receipt.difi_balance,
        remaining_supply: receipt.remaining_supply,
    }))
}

#[derive(Debug, Deserialize)]
pub struct GeneratePaymentRequest {
    pub usd_amount: i64,
    pub crypto: String,
}

#[derive(Debug, Serialize)]
pub struct GeneratePaymentResponse {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub invoice: InvoiceDetails,
}

async fn generate_payment_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthedUser,
    Json(request): Json<GeneratePaymentRequest>,
) -> Result<Json<GeneratePaymentResponse>, LedgerError> {
    let invoice = state
        .payments
        .create_invoice(&auth.0, request.usd_amount, &request.crypto)
        .await?;
    Ok(Json(GeneratePaymentResponse {
        success: true,
        message: "Payment invoice generated successfully.".to_string(),
        invoice,
    }))
}

/// Gateway status notification (IPN). Response bodies and status codes
/// are what the gateway's retry logic expects: 200 acknowledges both
/// fresh and duplicate deliveries, 403/404 reject without internal
/// detail.
async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers.get("x-callback-sig").and_then(|v| v.to_str().ok());

    match state.payments.handle_notification(signature, &body) {
        Ok(_) => (StatusCode::OK, "Webhook received and processed.").into_response(),
        Err(LedgerError::InvalidSignature) => {
            (StatusCode::FORBIDDEN, "Forbidden: Invalid signature.").into_response()
        }
        Err(LedgerError::OrderNotFound) => {
            (StatusCode::NOT_FOUND, "Payment Order Not Found.").into_response()
        }
        Err(LedgerError::InvalidPayload) => {
            (StatusCode::BAD_REQUEST, "Malformed payload.").into_response()
        }
        Err(e) => {
            error!("Error processing payment webhook: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Error processing webhook.").into_response()
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DifiLeaderboardResponse {
    pub success: bool,
    pub leaders: Vec<DifiLeaderboardRow>,
}

async fn difi_leaderboard_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DifiLeaderboardResponse>, LedgerError> {
    let leaders = state.storage.top_by_difi(LEADERBOARD_LIMIT)?;
    Ok(Json(DifiLeaderboardResponse {
        success: true,
        leaders,
    }))
}

#[derive(Debug, Serialize)]
pub struct DpowerLeaderboardResponse {
    pub success: bool,
    pub leaders: Vec<DpowerLeaderboardRow>,
}

async fn dpower_leaderboard_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DpowerLeaderboardResponse>, LedgerError> {
    let leaders = state.storage.top_by_dpower(LEADERBOARD_LIMIT)?;
    Ok(Json(DpowerLeaderboardResponse {
        success: true,
        leaders,
    }))
}

/// Run the server
pub async fn run_server(
    host: &str,
    port: u16,
    storage: Arc<AirdropStorage>,
    payments: PaymentService,
) -> anyhow::Result<()> {
    let state = Arc::new(AppState::new(storage, payments));

    let app = create_router(state);
    let addr = format!("{}:{}", host, port);

    info!("Starting DialFi Airdrop server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
