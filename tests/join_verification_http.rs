mod test_support;

use axum::http::{Method, StatusCode};
use serde_json::json;
use test_support::{make_ready, seed_section, send_json, spawn_app};

use sectionsd::provision;
use sectionsd::roster;

const VERIFY: &str = "/sections/verify-student-join/";

#[tokio::test]
async fn happy_join_binds_telegram_identity_and_returns_invite() {
    let app = spawn_app();
    let seeded = seed_section(&app.db, &["ريماس باسم محمد الحجري"]).await;
    make_ready(&app.db, seeded.section_id, -1_001_234_567_890, "https://t.me/+abc").await;

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        VERIFY,
        None,
        Some(json!({
            "student_name": "ريماس باسم محمد الحجري",
            "section_id": seeded.section_id,
            "telegram_user_id": 777
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["telegram_group"]["invite_link"], "https://t.me/+abc");
    assert_eq!(body["telegram_group"]["chat_id"], -1_001_234_567_890i64);
    assert!(body["invitation"]["signature"].as_str().is_some_and(|s| s.len() == 64));

    let section_id = seeded.section_id;
    let (students, section) = app
        .db
        .call(move |conn| Ok((roster::list_students(conn, section_id)?, roster::get_section(conn, section_id)?)))
        .await
        .unwrap();
    assert!(students[0].joined_telegram);
    assert_eq!(students[0].telegram_user_id, Some(777));
    assert!(students[0].joined_at.is_some());
    assert_eq!(section.joined_students, 1);
}

#[tokio::test]
async fn spelling_variants_match_the_stored_name() {
    let app = spawn_app();
    let seeded = seed_section(&app.db, &["أحمد علي"]).await;
    make_ready(&app.db, seeded.section_id, -1_001_000_000_001, "https://t.me/+variant").await;

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        VERIFY,
        None,
        Some(json!({ "student_name": "  احمد   على ", "section_id": seeded.section_id, "telegram_user_id": 55 })),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["student"]["full_name"], "أحمد علي");
}

#[tokio::test]
async fn unknown_name_is_rejected_without_writes() {
    let app = spawn_app();
    let seeded = seed_section(&app.db, &["سارة خالد العتيبي", "نورة سعد"]).await;
    make_ready(&app.db, seeded.section_id, -1_001_000_000_002, "https://t.me/+x").await;

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        VERIFY,
        None,
        Some(json!({ "student_name": "سارة خالد العتيبى", "section_id": seeded.section_id, "telegram_user_id": 9 })),
    )
    .await;
    // ى → ي folds, so this one matches; a different name does not.
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        VERIFY,
        None,
        Some(json!({ "student_name": "نورة سعيد", "section_id": seeded.section_id, "telegram_user_id": 10 })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "StudentNotInRoster");
    let suggestions = body["details"]["suggestions"].as_array().unwrap();
    assert_eq!(suggestions[0]["name"], "نورة سعد");

    let section_id = seeded.section_id;
    let students = app
        .db
        .call(move |conn| roster::list_students(conn, section_id))
        .await
        .unwrap();
    let nora = students.iter().find(|s| s.full_name == "نورة سعد").unwrap();
    assert!(!nora.joined_telegram);
    assert_eq!(nora.telegram_user_id, None);
}

#[tokio::test]
async fn repeated_join_by_same_user_is_idempotent() {
    let app = spawn_app();
    let seeded = seed_section(&app.db, &["ريماس باسم محمد الحجري"]).await;
    make_ready(&app.db, seeded.section_id, -1_001_234_567_890, "https://t.me/+abc").await;
    let claim = json!({
        "student_name": "ريماس باسم محمد الحجري",
        "section_id": seeded.section_id,
        "telegram_user_id": 777
    });

    let (first, _) = send_json(&app.router, Method::POST, VERIFY, None, Some(claim.clone())).await;
    assert_eq!(first, StatusCode::OK);
    let section_id = seeded.section_id;
    let joined_at = app
        .db
        .call(move |conn| roster::list_students(conn, section_id))
        .await
        .unwrap()[0]
        .joined_at;

    let (second, body) = send_json(&app.router, Method::POST, VERIFY, None, Some(claim)).await;
    assert_eq!(second, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (students, section) = app
        .db
        .call(move |conn| Ok((roster::list_students(conn, section_id)?, roster::get_section(conn, section_id)?)))
        .await
        .unwrap();
    assert_eq!(students[0].joined_at, joined_at);
    assert_eq!(section.joined_students, 1);
}

#[tokio::test]
async fn another_telegram_account_cannot_claim_a_joined_student() {
    let app = spawn_app();
    let seeded = seed_section(&app.db, &["ليان فهد"]).await;
    make_ready(&app.db, seeded.section_id, -1_001_000_000_003, "https://t.me/+l").await;
    let claim = |tg: i64| json!({ "student_name": "ليان فهد", "section_id": seeded.section_id, "telegram_user_id": tg });

    let (status, _) = send_json(&app.router, Method::POST, VERIFY, None, Some(claim(1))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send_json(&app.router, Method::POST, VERIFY, None, Some(claim(2))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["message"], "JoinConflict");
}

#[tokio::test]
async fn group_not_ready_leaves_student_untouched() {
    let app = spawn_app();
    let seeded = seed_section(&app.db, &["ريماس باسم محمد الحجري"]).await;
    let section_id = seeded.section_id;
    app.db
        .call(move |conn| {
            provision::ensure_group_row(conn, section_id)?;
            provision::record_created(conn, section_id, -1_001_234_567_890)?;
            provision::record_bot_membership(conn, section_id, false)
        })
        .await
        .unwrap();

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        VERIFY,
        None,
        Some(json!({ "student_name": "ريماس باسم محمد الحجري", "section_id": section_id, "telegram_user_id": 777 })),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "GroupNotReady");
    assert_eq!(body["details"]["status"], "bot_added");
    let students = app
        .db
        .call(move |conn| roster::list_students(conn, section_id))
        .await
        .unwrap();
    assert!(!students[0].joined_telegram);
}

#[tokio::test]
async fn unknown_section_and_blank_name_are_rejected() {
    let app = spawn_app();
    let seeded = seed_section(&app.db, &["أحمد علي"]).await;

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        VERIFY,
        None,
        Some(json!({ "student_name": "أحمد علي", "section_id": 999 })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "SectionNotFound");

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        VERIFY,
        None,
        Some(json!({ "student_name": "  ـــ ", "section_id": seeded.section_id })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "ValidationError");
}

#[tokio::test]
async fn bot_confirmation_binds_student_once() {
    let app = spawn_app();
    let seeded = seed_section(&app.db, &["عبدالله ناصر"]).await;
    make_ready(&app.db, seeded.section_id, -1_001_000_000_004, "https://t.me/+c").await;
    let section_id = seeded.section_id;
    let student_id = app
        .db
        .call(move |conn| roster::list_students(conn, section_id))
        .await
        .unwrap()[0]
        .id;

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/sections/confirm-student-joined/",
        None,
        // raw chat id form is accepted
        Some(json!({ "student_id": student_id, "telegram_user_id": 42, "telegram_username": "@abd", "chat_id": 1_000_000_004 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["student"]["joined_telegram"], true);
    assert_eq!(body["student"]["telegram_username"], "abd");

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/sections/confirm-student-joined/",
        None,
        Some(json!({ "student_id": student_id, "telegram_user_id": 42, "chat_id": -1_009_999_999_999i64 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"]["field"], "chat_id");
}

#[tokio::test]
async fn concurrent_joins_by_the_same_user_count_once() {
    let app = spawn_app();
    let seeded = seed_section(&app.db, &["أحمد علي"]).await;
    make_ready(&app.db, seeded.section_id, -1_001_234_567_890, "https://t.me/+abc").await;
    let claim = json!({ "student_name": "أحمد علي", "section_id": seeded.section_id, "telegram_user_id": 777 });

    let ((a, _), (b, _)) = tokio::join!(
        send_json(&app.router, Method::POST, VERIFY, None, Some(claim.clone())),
        send_json(&app.router, Method::POST, VERIFY, None, Some(claim.clone())),
    );
    assert_eq!((a, b), (StatusCode::OK, StatusCode::OK));

    let section_id = seeded.section_id;
    let section = app
        .db
        .call(move |conn| roster::get_section(conn, section_id))
        .await
        .unwrap();
    assert_eq!(section.joined_students, 1);
}

#[tokio::test]
async fn concurrent_joins_by_different_users_bind_only_one() {
    let app = spawn_app();
    let seeded = seed_section(&app.db, &["أحمد علي"]).await;
    make_ready(&app.db, seeded.section_id, -1_001_234_567_890, "https://t.me/+abc").await;
    let claim = |tg: i64| json!({ "student_name": "أحمد علي", "section_id": seeded.section_id, "telegram_user_id": tg });

    let ((a, body_a), (b, body_b)) = tokio::join!(
        send_json(&app.router, Method::POST, VERIFY, None, Some(claim(777))),
        send_json(&app.router, Method::POST, VERIFY, None, Some(claim(888))),
    );
    let mut statuses = vec![a, b];
    statuses.sort();
    assert_eq!(statuses, vec![StatusCode::OK, StatusCode::CONFLICT], "{body_a} {body_b}");
    let conflict = if a == StatusCode::CONFLICT { body_a } else { body_b };
    assert_eq!(conflict["message"], "JoinConflict");

    let section_id = seeded.section_id;
    let (students, section) = app
        .db
        .call(move |conn| Ok((roster::list_students(conn, section_id)?, roster::get_section(conn, section_id)?)))
        .await
        .unwrap();
    assert!(matches!(students[0].telegram_user_id, Some(777) | Some(888)));
    assert_eq!(section.joined_students, 1);
}
