use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::error::{bad_body, ok, ApiResult};
use crate::api::types::{AppState, CurrentTeacher};
use crate::provision;
use crate::roster;

#[derive(Deserialize)]
struct NewGrade {
    display_name: String,
    school_name: String,
}

async fn create_grade(
    State(state): State<AppState>,
    CurrentTeacher(teacher): CurrentTeacher,
    body: Result<Json<NewGrade>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(req) = body.map_err(bad_body)?;
    let grade = state
        .db
        .call(move |conn| roster::create_grade(conn, teacher.id, &req.display_name, &req.school_name))
        .await?;
    tracing::info!(grade_id = grade.id, teacher_id = teacher.id, "grade created");
    Ok((StatusCode::CREATED, ok(json!({ "grade": grade }))))
}

async fn list_grade_sections(
    State(state): State<AppState>,
    CurrentTeacher(teacher): CurrentTeacher,
    Path(grade_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let sections = state
        .db
        .call(move |conn| {
            roster::ensure_grade_owner(conn, grade_id, teacher.id)?;
            let mut out = Vec::new();
            for section in roster::list_sections(conn, grade_id)? {
                let group_status = provision::get_group(conn, section.id)?.map(|g| g.status);
                out.push(json!({ "section": section, "group_status": group_status }));
            }
            Ok(out)
        })
        .await?;
    Ok(ok(json!({ "sections": sections })))
}

async fn delete_grade(
    State(state): State<AppState>,
    CurrentTeacher(teacher): CurrentTeacher,
    Path(grade_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    state
        .db
        .call(move |conn| {
            roster::ensure_grade_owner(conn, grade_id, teacher.id)?;
            roster::delete_grade(conn, grade_id)
        })
        .await?;
    tracing::info!(grade_id, "grade deleted");
    Ok(ok(json!({ "deleted": grade_id })))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sections/grades/", post(create_grade))
        .route("/sections/grades/:grade_id/sections/", get(list_grade_sections))
        .route("/sections/grades/:grade_id/", delete(delete_grade))
}
