// HTTP surface
//
// Thin handlers over the core: purchase initiation, payment confirmation,
// trial issuance, the subscription descriptor, and balance display. No
// handler holds state beyond a single operation.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use tracing::warn;

use crate::config::ServiceConfig;
use crate::error::Error;
use crate::money;
use crate::payments::{ConfirmationResult, PaymentReconciler};
use crate::referral::ReferralLedger;
use crate::store::EntitlementStore;
use crate::subscription::{connection_text, SubscriptionManager};
use crate::xray::XrayConfig;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub store: EntitlementStore,
    pub xray: Arc<XrayConfig>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub payments: Arc<PaymentReconciler>,
    pub referrals: Arc<ReferralLedger>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/purchase", post(purchase))
        .route("/payments/:payment_id/confirm", post(confirm))
        .route("/trial", post(trial))
        .route("/sub/:token", get(subscription_descriptor))
        .route("/balance/:user_id", get(balance))
        .with_state(state)
}

fn error_response(e: Error) -> Response {
    let status = match &e {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
        Error::ConfigInvalid(_) | Error::InvalidKeyMaterial(_) => {
            warn!("misconfiguration surfaced to caller: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
        Error::PersistFailed(_) | Error::ReloadFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "subgress",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": state.payments.provider_tags(),
    }))
}

#[derive(Debug, Deserialize)]
struct PurchaseRequest {
    user_id: String,
    provider: String,
    #[serde(default)]
    referrer: Option<String>,
}

async fn purchase(
    State(state): State<AppState>,
    Json(request): Json<PurchaseRequest>,
) -> Response {
    // bind the referral edge before the reconciler touches the account
    if let Err(e) = state
        .store
        .ensure_account(&request.user_id, request.referrer.as_deref())
        .await
    {
        return error_response(e);
    }
    match state
        .payments
        .initiate_purchase(&request.user_id, &request.provider)
        .await
    {
        Ok(payment) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "payment_id": payment.id,
                "pay_url": payment.pay_url,
                "amount": money::format_major(payment.amount),
                "currency": payment.currency,
            })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn confirm(State(state): State<AppState>, Path(payment_id): Path<String>) -> Response {
    match state.payments.confirm(&payment_id).await {
        Ok(ConfirmationResult::StillPending) => {
            Json(serde_json::json!({ "state": "pending" })).into_response()
        }
        Ok(ConfirmationResult::AlreadyCredited) => {
            Json(serde_json::json!({ "state": "already_credited" })).into_response()
        }
        Ok(ConfirmationResult::Credited { net, token }) => Json(serde_json::json!({
            "state": "credited",
            "net": money::format_major(net),
            "token": token,
            "sub_url": format!("{}/sub/{}", state.config.public_base, token),
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct TrialRequest {
    user_id: String,
}

async fn trial(State(state): State<AppState>, Json(request): Json<TrialRequest>) -> Response {
    if let Err(e) = state.store.ensure_account(&request.user_id, None).await {
        return error_response(e);
    }
    let duration = Duration::days(state.config.trial_days);
    match state.subscriptions.issue(&request.user_id, duration).await {
        Ok(sub) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "token": sub.token,
                "expires_at": sub.expires_at,
                "sub_url": format!("{}/sub/{}", state.config.public_base, sub.token),
            })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// Two-line VLESS descriptor for an active token. Expired-but-unswept
/// tokens are treated as inactive here.
async fn subscription_descriptor(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Response {
    let sub = match state.subscriptions.lookup(&token).await {
        Ok(Some(sub)) if sub.expires_at > Utc::now().timestamp() => sub,
        Ok(_) => return error_response(Error::NotFound("subscription")),
        Err(e) => return error_response(e),
    };
    match state.xray.transport_parameters().await {
        Ok(params) => connection_text(
            &state.config.public_host,
            &sub.user_id,
            &sub.client_id,
            &params,
        )
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn balance(State(state): State<AppState>, Path(user_id): Path<String>) -> Response {
    let balance = match state.store.balance(&user_id).await {
        Ok(balance) => balance,
        Err(e) => return error_response(e),
    };
    let stats = match state.referrals.stats(&user_id).await {
        Ok(stats) => stats,
        Err(e) => return error_response(e),
    };
    Json(serde_json::json!({
        "balance": money::format_major(balance),
        "referrals": {
            "count": stats.count,
            "total": money::format_major(stats.total),
        },
    }))
    .into_response()
}
