//! Read-only HTTP API over the dashboard state.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::info;

use super::DashboardState;

pub fn router(state: Arc<DashboardState>) -> Router {
    Router::new()
        .route("/api/candles", get(candles))
        .route("/api/trades", get(trades))
        .route("/api/gaps", get(gaps))
        .route("/api/orderbook", get(orderbook))
        .route("/api/equity", get(equity))
        .route("/api/health", get(health))
        .with_state(state)
}

/// Bind and serve until the process exits
pub async fn serve(addr: &str, state: Arc<DashboardState>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding dashboard to {addr}"))?;
    info!(addr, "dashboard listening");
    axum::serve(listener, router(state))
        .await
        .context("dashboard server")?;
    Ok(())
}

async fn candles(State(state): State<Arc<DashboardState>>) -> Json<Value> {
    Json(json!(state.candles().await))
}

async fn trades(State(state): State<Arc<DashboardState>>) -> Json<Value> {
    Json(json!(state.trades().await))
}

async fn gaps(State(state): State<Arc<DashboardState>>) -> Json<Value> {
    Json(json!(state.gaps().await))
}

async fn orderbook(State(state): State<Arc<DashboardState>>) -> Json<Value> {
    Json(json!(state.orderbook().await))
}

async fn equity(State(state): State<Arc<DashboardState>>) -> Json<Value> {
    Json(json!(state.equity().await))
}

async fn health(State(state): State<Arc<DashboardState>>) -> Json<Value> {
    let status = state.status().await;
    Json(json!({
        "status": if status.connected { "ok" } else { "degraded" },
        "connection": status,
    }))
}
