use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::error::{bad_body, ok, ApiResult};
use crate::api::types::{AppState, CurrentTeacher};
use crate::error::CoreError;
use crate::provision;
use crate::roster::{self, StudentRow};

#[derive(Deserialize)]
struct NewSection {
    grade_id: i64,
    section_name: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StudentsBody {
    Bulk { rows: Vec<StudentRow> },
    Single(StudentRow),
}

async fn create_section(
    State(state): State<AppState>,
    CurrentTeacher(teacher): CurrentTeacher,
    body: Result<Json<NewSection>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(req) = body.map_err(bad_body)?;
    let section = state
        .db
        .call(move |conn| {
            roster::ensure_grade_owner(conn, req.grade_id, teacher.id)?;
            roster::create_section(conn, req.grade_id, &req.section_name)
        })
        .await?;
    tracing::info!(section_id = section.id, grade_id = section.grade_id, "section created");
    Ok((StatusCode::CREATED, ok(json!({ "section": section }))))
}

async fn list_students(
    State(state): State<AppState>,
    CurrentTeacher(teacher): CurrentTeacher,
    Path(section_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let students = state
        .db
        .call(move |conn| {
            roster::ensure_section_owner(conn, section_id, teacher.id)?;
            roster::list_students(conn, section_id)
        })
        .await?;
    Ok(ok(json!({ "count": students.len(), "students": students })))
}

async fn add_students(
    State(state): State<AppState>,
    CurrentTeacher(teacher): CurrentTeacher,
    Path(section_id): Path<i64>,
    body: Result<Json<StudentsBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(req) = body.map_err(bad_body)?;
    match req {
        StudentsBody::Bulk { rows } => {
            let report = state
                .db
                .call(move |conn| {
                    roster::ensure_section_owner(conn, section_id, teacher.id)?;
                    roster::bulk_import_students(conn, section_id, &rows)
                })
                .await?;
            tracing::info!(section_id, created = report.created, skipped = report.skipped, "students imported");
            Ok((StatusCode::OK, ok(report)))
        }
        StudentsBody::Single(row) => {
            let student = state
                .db
                .call(move |conn| {
                    roster::ensure_section_owner(conn, section_id, teacher.id)?;
                    roster::register_student(conn, section_id, &row.full_name, row.phone.as_deref())
                })
                .await?;
            Ok((StatusCode::CREATED, ok(json!({ "student": student }))))
        }
    }
}

async fn provision_group(
    State(state): State<AppState>,
    CurrentTeacher(teacher): CurrentTeacher,
    Path(section_id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let group = state
        .db
        .call(move |conn| {
            roster::ensure_section_owner(conn, section_id, teacher.id)?;
            provision::ensure_group_row(conn, section_id)
        })
        .await?;
    if !group.is_ready() {
        state.provision_queue.enqueue(section_id)?;
    }
    Ok((StatusCode::ACCEPTED, ok(json!({ "status": group.status }))))
}

async fn retry_group(
    State(state): State<AppState>,
    CurrentTeacher(teacher): CurrentTeacher,
    Path(section_id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    state
        .db
        .call(move |conn| roster::ensure_section_owner(conn, section_id, teacher.id))
        .await?;
    let group = state.provisioner.retry(section_id).await?;
    state.provision_queue.enqueue(section_id)?;
    Ok((StatusCode::ACCEPTED, ok(json!({ "status": group.status }))))
}

async fn get_group(
    State(state): State<AppState>,
    CurrentTeacher(teacher): CurrentTeacher,
    Path(section_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let group = state
        .db
        .call(move |conn| {
            roster::ensure_section_owner(conn, section_id, teacher.id)?;
            provision::get_group(conn, section_id)?
                .ok_or_else(|| CoreError::not_found("telegram_group", section_id))
        })
        .await?;
    Ok(ok(group))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sections/sections/", post(create_section))
        .route(
            "/sections/sections/:section_id/students/",
            get(list_students).post(add_students),
        )
        .route("/sections/sections/:section_id/provision-group/", post(provision_group))
        .route("/sections/sections/:section_id/retry-group/", post(retry_group))
        .route("/sections/sections/:section_id/group/", get(get_group))
}
