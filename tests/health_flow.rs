mod common;

use anyhow::Result;
use axum::http::StatusCode;
use common::{acquire_db_lock, body_to_vec, TestApp};
use serde_json::Value;

#[tokio::test]
async fn probes_report_live_and_ready() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let live = app.get("/health/live").await?;
    assert_eq!(live.status(), StatusCode::OK);

    let ready = app.get("/health/ready").await?;
    assert_eq!(ready.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(&body_to_vec(ready.into_body()).await?)?;
    assert_eq!(body["status"], "ready");

    let missing = app.get("/api/documents").await?;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    Ok(())
}
