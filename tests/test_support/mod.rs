#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use sectionsd::api::{build_router, AppState, TEACHER_HEADER};
use sectionsd::config::Config;
use sectionsd::db::{open_in_memory, Db};
use sectionsd::provision::{self, Provisioner};
use sectionsd::retry::Backoff;
use sectionsd::roster;
use sectionsd::submissions::SubmissionValidator;
use sectionsd::telegram::mock::MockTelegram;

pub const BOT_USERNAME: &str = "SectionsTestBot";

pub fn test_config() -> Config {
    Config::from_lookup(|key| match key {
        "DATABASE_URL" => Some(":memory:".into()),
        "OTP_SECRET_KEY" => Some("test-secret".into()),
        "TELEGRAM_BOT_USERNAME" => Some(BOT_USERNAME.into()),
        _ => None,
    })
    .expect("test config")
}

pub fn memory_db() -> Db {
    Db::new(open_in_memory().expect("in-memory db"))
}

pub fn provisioner(db: &Db, actor: Arc<MockTelegram>, attempts: u32) -> Arc<Provisioner> {
    Arc::new(Provisioner::new(
        db.clone(),
        actor,
        Backoff::immediate(attempts),
        BOT_USERNAME.to_string(),
    ))
}

pub struct TestApp {
    pub router: Router,
    pub db: Db,
    pub actor: Arc<MockTelegram>,
}

/// Full HTTP stack over an in-memory database and a mock actor.
pub fn spawn_app() -> TestApp {
    let db = memory_db();
    let actor = Arc::new(MockTelegram::new().with_auto_bot());
    let state = AppState::with_parts(
        db.clone(),
        test_config(),
        provisioner(&db, actor.clone(), 3),
        Arc::new(SubmissionValidator::new(None, None, 70)),
    )
    .expect("app state");
    TestApp {
        router: build_router(state),
        db,
        actor,
    }
}

pub struct Seeded {
    pub teacher_id: i64,
    pub grade_id: i64,
    pub section_id: i64,
}

/// One teacher, one grade, one section holding `students`.
pub async fn seed_section(db: &Db, students: &[&str]) -> Seeded {
    let students: Vec<String> = students.iter().map(|s| s.to_string()).collect();
    db.call(move |conn| {
        let teacher = roster::create_teacher(conn, "أ. منى", None, None)?;
        let grade = roster::create_grade(conn, teacher.id, "الصف الثالث متوسط", "مدرسة النور")?;
        let section = roster::create_section(conn, grade.id, "أ")?;
        for name in &students {
            roster::register_student(conn, section.id, name, None)?;
        }
        Ok(Seeded {
            teacher_id: teacher.id,
            grade_id: grade.id,
            section_id: section.id,
        })
    })
    .await
    .expect("seed section")
}

/// Puts the section's group straight into `ready` with `invite_link`.
pub async fn make_ready(db: &Db, section_id: i64, chat_id: i64, invite_link: &str) {
    let invite_link = invite_link.to_string();
    db.call(move |conn| {
        provision::ensure_group_row(conn, section_id)?;
        provision::record_created(conn, section_id, chat_id)?;
        provision::record_bot_membership(conn, section_id, true)?;
        provision::record_ready(conn, section_id, &invite_link)
    })
    .await
    .expect("make group ready");
}

pub async fn send_json(
    router: &Router,
    method: Method,
    uri: &str,
    teacher_id: Option<i64>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(id) = teacher_id {
        builder = builder.header(TEACHER_HEADER, id.to_string());
    }
    let request = match body {
        Some(v) => builder
            .header("content-type", "application/json")
            .body(Body::from(v.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("request");
    send(router, request).await
}

pub async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}
