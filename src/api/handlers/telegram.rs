use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::error::{bad_body, ok, ApiResult};
use crate::api::types::AppState;

#[derive(Deserialize)]
struct BotAdded {
    chat_id: i64,
    #[serde(default)]
    is_admin: bool,
}

/// Bot membership update. Accepts raw or canonical chat ids.
async fn bot_added(
    State(state): State<AppState>,
    body: Result<Json<BotAdded>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(req) = body.map_err(bad_body)?;
    let group = state.provisioner.on_bot_added(req.chat_id, req.is_admin).await?;
    if !group.is_ready() {
        state.provision_queue.enqueue(group.section_id)?;
    }
    Ok(ok(json!({ "section_id": group.section_id, "status": group.status })))
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/sections/telegram/bot-added/", post(bot_added))
}
