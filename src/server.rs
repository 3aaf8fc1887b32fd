//! Webhook HTTP surface.
//!
//! One axum server exposes the per-platform webhook endpoints plus a health
//! probe. Each request opens its own Unit of Work and the whole command runs
//! within the webhook request; the acknowledgment is sent after processing
//! completes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::db::Store;
use crate::error::Result;
use crate::integrations::payments::decode_event;
use crate::messengers::whatsapp::WebhookPayload;
use crate::messengers::{Messenger, Telegram, WhatsApp};
use crate::models::Platform;
use crate::service::Service;

/// Application state shared across handlers
pub struct AppState {
    pub store: Store,
    pub service: Service,
    pub whatsapp: WhatsApp,
    pub telegram: Telegram,
    pub start_time: Instant,
}

/// Build the router with all routes and middleware
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/whatsapp", get(whatsapp_verify).post(whatsapp_webhook))
        .route("/api/telegram", post(telegram_webhook))
        .route("/api/payment", post(payment_webhook))
        .route("/api/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the server and run until shutdown signal
pub async fn run(state: Arc<AppState>, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let router = build_router(state);
    info!("starting webhook server on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("webhook server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("failed to install SIGTERM handler: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

async fn whatsapp_verify(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    match state.whatsapp.verify(
        params.get("hub.mode").map(String::as_str),
        params.get("hub.verify_token").map(String::as_str),
        params.get("hub.challenge").map(String::as_str),
    ) {
        Some(challenge) => (StatusCode::OK, challenge).into_response(),
        None => (StatusCode::FORBIDDEN, "verification token mismatch").into_response(),
    }
}

async fn whatsapp_webhook(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<WebhookPayload>,
) -> Response {
    // Delivery-status notifications are acknowledged without processing.
    if payload.is_status_update() {
        return (StatusCode::OK, "ok").into_response();
    }

    let outcome: Result<()> = async {
        let uow = state.store.begin()?;
        let message = state.whatsapp.process_message(&payload, &uow).await?;
        state
            .service
            .receive_and_process(&message, &uow, &state.whatsapp)
            .await
    }
    .await;

    match outcome {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(e) => {
            error!("whatsapp webhook failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

async fn telegram_webhook(
    State(state): State<Arc<AppState>>,
    Json(update): Json<teloxide::types::Update>,
) -> Response {
    let outcome: Result<()> = async {
        let uow = state.store.begin()?;
        let message = state.telegram.process_update(update, &uow).await?;
        state
            .service
            .receive_and_process(&message, &uow, &state.telegram)
            .await
    }
    .await;

    match outcome {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(e) => {
            error!("telegram webhook failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    let event = match decode_event(&payload) {
        Ok(event) => event,
        Err(e) => {
            error!("undecodable payment event: {e}");
            return (StatusCode::BAD_REQUEST, "bad event").into_response();
        }
    };

    let outcome: Result<()> = async {
        let uow = state.store.begin()?;
        let Some(settlement) = state.service.settle_payment(&event, &uow).await? else {
            // Re-delivered event; already handled.
            return Ok(());
        };

        let identifier = if settlement.dispatched {
            "payment_webhook-success"
        } else {
            "payment_webhook-success-no_dispatch"
        };
        let body = uow.sys.render(
            identifier,
            &[
                &settlement.credits_bought.to_string(),
                &settlement.balance.to_string(),
            ],
        )?;

        let messenger: &dyn Messenger = match settlement.message.platform {
            Platform::WhatsApp => &state.whatsapp,
            Platform::Telegram => &state.telegram,
        };
        messenger.reply_text(&settlement.message, &body, &uow).await?;
        Ok(())
    }
    .await;

    match outcome {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(e) => {
            error!("payment webhook for event {} failed: {e}", event.event_id);
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}
