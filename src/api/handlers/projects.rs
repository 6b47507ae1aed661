use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::api::error::{bad_body, ok, ApiResult};
use crate::api::types::{AppState, CurrentTeacher};
use crate::error::CoreError;
use crate::submissions::{self, NewProject};

// Largest per-type limit plus multipart framing.
const UPLOAD_BODY_LIMIT: usize = 110 * 1024 * 1024;

async fn create_project(
    State(state): State<AppState>,
    CurrentTeacher(teacher): CurrentTeacher,
    body: Result<Json<NewProject>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(req) = body.map_err(bad_body)?;
    let project = state
        .db
        .call(move |conn| submissions::create_project(conn, teacher.id, &req))
        .await?;
    tracing::info!(project_id = project.id, teacher_id = teacher.id, "project created");
    Ok((StatusCode::CREATED, ok(json!({ "project": project }))))
}

#[derive(Default)]
struct Upload {
    project_id: Option<i64>,
    student_name: Option<String>,
    file: Option<(String, Vec<u8>)>,
}

fn multipart_error(e: impl std::fmt::Display) -> CoreError {
    CoreError::validation("body", e.to_string())
}

async fn read_upload(mut multipart: Multipart) -> ApiResult<Upload> {
    let mut upload = Upload::default();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        match field.name().unwrap_or_default() {
            "project_id" => {
                let raw = field.text().await.map_err(multipart_error)?;
                let id = raw
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| CoreError::validation("project_id", "must be an integer"))?;
                upload.project_id = Some(id);
            }
            "student_name" => upload.student_name = Some(field.text().await.map_err(multipart_error)?),
            "file" => {
                let name = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await.map_err(multipart_error)?;
                upload.file = Some((name, bytes.to_vec()));
            }
            _ => {}
        }
    }
    Ok(upload)
}

async fn submit(State(state): State<AppState>, multipart: Multipart) -> ApiResult<(StatusCode, Json<Value>)> {
    let upload = read_upload(multipart).await?;
    let project_id = upload
        .project_id
        .ok_or_else(|| CoreError::validation("project_id", "required"))?;
    let student_name = upload
        .student_name
        .ok_or_else(|| CoreError::validation("student_name", "required"))?;
    let (file_name, bytes) = upload
        .file
        .ok_or_else(|| CoreError::validation("file", "required"))?;
    let submission = state
        .submissions
        .submit(project_id, &student_name, &file_name, bytes)
        .await?;
    Ok((StatusCode::CREATED, ok(json!({ "submission": submission }))))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/projects/", post(create_project))
        .route(
            "/projects/submissions/",
            post(submit).layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT)),
        )
}
