use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::{json, Value};
use tokio::task;

use crate::{db, error::AppError, error::AppResult, state::AppState};

pub async fn live() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

/// Ready once the database answers a round trip.
pub async fn ready(State(state): State<AppState>) -> AppResult<(StatusCode, Json<Value>)> {
    task::spawn_blocking(move || {
        let mut conn = state.db()?;
        db::ping(&mut conn).map_err(|err| AppError::unavailable(format!("database ping failed: {err}")))
    })
    .await
    .map_err(AppError::internal)??;

    Ok((StatusCode::OK, Json(json!({ "status": "ready" }))))
}
