use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::api::error::{bad_body, ok, ApiResult};
use crate::api::types::AppState;
use crate::join::{ConfirmJoin, JoinClaim};

async fn verify_student_join(
    State(state): State<AppState>,
    body: Result<Json<JoinClaim>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(claim) = body.map_err(bad_body)?;
    let payload = state.joins.verify(claim).await?;
    Ok(ok(payload))
}

async fn confirm_student_joined(
    State(state): State<AppState>,
    body: Result<Json<ConfirmJoin>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(req) = body.map_err(bad_body)?;
    let student = state.joins.confirm(req).await?;
    Ok(ok(json!({ "student": student })))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sections/verify-student-join/", post(verify_student_join))
        .route("/sections/confirm-student-joined/", post(confirm_student_joined))
}
