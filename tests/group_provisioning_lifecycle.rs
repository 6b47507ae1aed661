mod test_support;

use std::sync::Arc;
use std::time::Duration;

use axum::http::{Method, StatusCode};
use serde_json::json;
use test_support::{memory_db, provisioner, seed_section, send_json, spawn_app, BOT_USERNAME};

use sectionsd::error::CoreError;
use sectionsd::provision::{self, GroupStatus, ProvisionQueue, Provisioner};
use sectionsd::retry::Backoff;
use sectionsd::telegram::mock::{MockOp, MockTelegram};
use sectionsd::telegram::{ActorError, TelegramControl};

#[tokio::test]
async fn provisioning_reaches_ready_with_canonical_chat_id() {
    let db = memory_db();
    let seeded = seed_section(&db, &["أحمد علي"]).await;
    let actor = Arc::new(MockTelegram::new().with_auto_bot());
    actor.set_next_chat_id(1_234_567_890);
    let p = provisioner(&db, actor.clone(), 3);

    let group = p.provision(seeded.section_id).await.unwrap();

    assert_eq!(group.status, GroupStatus::Ready);
    assert_eq!(group.chat_id, Some(-1_001_234_567_890));
    assert_eq!(group.invite_link.as_deref(), Some("https://t.me/+mock1001234567890"));
    assert!(group.is_bot_added && group.is_bot_admin);
    assert!(group.instructions_sent);
    assert_eq!(actor.group_titles(), vec!["الصف الثالث متوسط — أ".to_string()]);
    let sent = actor.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, -1_001_234_567_890);
    assert!(sent[0].1.contains(&format!("@{BOT_USERNAME}")));
}

#[tokio::test]
async fn provisioning_a_ready_group_again_changes_nothing() {
    let db = memory_db();
    let seeded = seed_section(&db, &[]).await;
    let actor = Arc::new(MockTelegram::new().with_auto_bot());
    let p = provisioner(&db, actor.clone(), 3);

    let first = p.provision(seeded.section_id).await.unwrap();
    let second = p.provision(seeded.section_id).await.unwrap();

    assert_eq!(second.status, GroupStatus::Ready);
    assert_eq!(second.chat_id, first.chat_id);
    assert_eq!(second.invite_link, first.invite_link);
    assert_eq!(actor.calls(MockOp::CreateGroup), 1);
    assert_eq!(actor.calls(MockOp::ExportInvite), 1);
    assert_eq!(actor.sent().len(), 1);
}

#[tokio::test]
async fn waits_in_created_until_the_bot_joins() {
    let db = memory_db();
    let seeded = seed_section(&db, &[]).await;
    let actor = Arc::new(MockTelegram::new());
    let p = provisioner(&db, actor.clone(), 3);

    let group = p.provision(seeded.section_id).await.unwrap();
    assert_eq!(group.status, GroupStatus::Created);
    assert!(!group.is_bot_added);

    // The webhook may carry the raw id.
    actor.set_bot_present(1_234_567_890, true);
    let group = p.on_bot_added(1_234_567_890, false).await.unwrap();
    assert_eq!(group.status, GroupStatus::BotAdded);

    let group = p.provision(seeded.section_id).await.unwrap();
    assert_eq!(group.status, GroupStatus::Ready);
    assert_eq!(actor.calls(MockOp::PromoteBot), 1);
}

#[tokio::test]
async fn bot_added_for_an_unknown_chat_is_not_found() {
    let db = memory_db();
    let p = provisioner(&db, Arc::new(MockTelegram::new()), 3);
    let err = p.on_bot_added(-1_009_999_999_999, true).await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound { .. }), "{err:?}");
}

#[tokio::test]
async fn permanent_failure_parks_group_until_retried() {
    let db = memory_db();
    let seeded = seed_section(&db, &[]).await;
    let actor = Arc::new(MockTelegram::new().with_auto_bot());
    actor.fail_next(MockOp::CreateGroup, ActorError::permanent("USER_RESTRICTED"));
    let p = provisioner(&db, actor.clone(), 3);

    let group = p.provision(seeded.section_id).await.unwrap();
    assert_eq!(group.status, GroupStatus::Failed);
    assert_eq!(group.attempts, 1);
    assert!(group.last_error.as_deref().unwrap().contains("USER_RESTRICTED"));

    let group = p.provision(seeded.section_id).await.unwrap();
    assert_eq!(group.status, GroupStatus::Failed);
    assert_eq!(actor.calls(MockOp::CreateGroup), 1);

    let group = p.retry(seeded.section_id).await.unwrap();
    assert_eq!(group.status, GroupStatus::Pending);
    assert_eq!(group.attempts, 0);
    assert!(group.last_error.is_none());

    let group = p.provision(seeded.section_id).await.unwrap();
    assert_eq!(group.status, GroupStatus::Ready);
}

#[tokio::test]
async fn zero_chat_id_from_the_actor_fails_the_group() {
    let db = memory_db();
    let seeded = seed_section(&db, &[]).await;
    let actor = Arc::new(MockTelegram::new().with_auto_bot());
    actor.set_next_chat_id(0);
    let p = provisioner(&db, actor, 3);

    let group = p.provision(seeded.section_id).await.unwrap();
    assert_eq!(group.status, GroupStatus::Failed);
    assert_eq!(group.chat_id, None);
}

#[tokio::test]
async fn transient_failures_are_retried_within_the_backoff() {
    let db = memory_db();
    let seeded = seed_section(&db, &[]).await;
    let actor = Arc::new(MockTelegram::new().with_auto_bot());
    actor.fail_next(MockOp::ExportInvite, ActorError::transient("FLOOD_WAIT"));
    actor.fail_next(MockOp::ExportInvite, ActorError::from_status(503, "unavailable"));
    let p = provisioner(&db, actor.clone(), 3);

    let group = p.provision(seeded.section_id).await.unwrap();
    assert_eq!(group.status, GroupStatus::Ready);
    assert_eq!(actor.calls(MockOp::ExportInvite), 3);
    assert_eq!(group.attempts, 0);
}

#[tokio::test]
async fn exhausted_transient_failures_keep_the_state() {
    let db = memory_db();
    let seeded = seed_section(&db, &[]).await;
    let actor = Arc::new(MockTelegram::new().with_auto_bot());
    for _ in 0..2 {
        actor.fail_next(MockOp::CreateGroup, ActorError::transient("timeout"));
    }
    let p = provisioner(&db, actor.clone(), 2);

    let err = p.provision(seeded.section_id).await.unwrap_err();
    assert!(matches!(err, CoreError::Transient(_)), "{err:?}");

    let section_id = seeded.section_id;
    let group = db
        .call(move |conn| provision::get_group(conn, section_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(group.status, GroupStatus::Pending);
    assert_eq!(group.attempts, 1);
    assert!(group.last_error.as_deref().unwrap().starts_with("create_group"));

    let group = p.provision(seeded.section_id).await.unwrap();
    assert_eq!(group.status, GroupStatus::Ready);
    assert_eq!(actor.calls(MockOp::CreateGroup), 3);
}

#[tokio::test]
async fn promotion_without_the_bot_fails_the_group() {
    let db = memory_db();
    let seeded = seed_section(&db, &[]).await;
    let actor = Arc::new(MockTelegram::new());
    let p = provisioner(&db, actor.clone(), 3);

    p.provision(seeded.section_id).await.unwrap();
    // Webhook says the bot is in, but the chat disagrees.
    p.on_bot_added(-1_001_234_567_890, false).await.unwrap();
    let group = p.provision(seeded.section_id).await.unwrap();

    assert_eq!(group.status, GroupStatus::Failed);
    assert!(group.last_error.as_deref().unwrap().starts_with("promote_bot"));
}

#[tokio::test]
async fn concurrent_provisioning_of_one_section_creates_one_group() {
    let db = memory_db();
    let seeded = seed_section(&db, &[]).await;
    let actor = Arc::new(
        MockTelegram::new()
            .with_auto_bot()
            .with_latency(Duration::from_millis(20)),
    );
    let p = provisioner(&db, actor.clone(), 3);

    let (a, b) = tokio::join!(p.provision(seeded.section_id), p.provision(seeded.section_id));

    assert_eq!(a.unwrap().status, GroupStatus::Ready);
    assert_eq!(b.unwrap().status, GroupStatus::Ready);
    assert_eq!(actor.calls(MockOp::CreateGroup), 1);
    assert_eq!(actor.sent().len(), 1);
}

#[tokio::test]
async fn lost_create_reply_does_not_create_a_second_group() {
    let db = memory_db();
    let seeded = seed_section(&db, &[]).await;
    let actor = Arc::new(MockTelegram::new().with_auto_bot());
    actor.lose_next_reply(MockOp::CreateGroup);
    let p = provisioner(&db, actor.clone(), 3);

    let group = p.provision(seeded.section_id).await.unwrap();

    assert_eq!(group.status, GroupStatus::Ready);
    assert_eq!(group.chat_id, Some(-1_001_234_567_890));
    assert_eq!(actor.calls(MockOp::CreateGroup), 2);
    assert_eq!(actor.group_titles().len(), 1);
}

#[tokio::test]
async fn already_created_group_is_adopted_by_key() {
    let db = memory_db();
    let seeded = seed_section(&db, &[]).await;
    let section_id = seeded.section_id;
    let row = db
        .call(move |conn| provision::ensure_group_row(conn, section_id))
        .await
        .unwrap();
    let actor = Arc::new(MockTelegram::new().with_auto_bot());
    // An earlier run created the group but crashed before recording it.
    let raw = actor
        .create_group(&row.group_name, &provision::group_key(section_id, row.id))
        .await
        .unwrap();
    actor.fail_next(MockOp::CreateGroup, ActorError::already_done("group exists"));
    let p = provisioner(&db, actor.clone(), 3);

    let group = p.provision(section_id).await.unwrap();

    assert_eq!(group.status, GroupStatus::Ready, "{:?}", group.last_error);
    assert_eq!(group.chat_id, Some(sectionsd::telegram::canonical_chat_id(raw)));
    assert_eq!(group.attempts, 0);
    assert_eq!(actor.calls(MockOp::FindGroup), 1);
    assert_eq!(actor.group_titles().len(), 1);
}

#[tokio::test]
async fn already_done_without_a_group_under_the_key_fails() {
    let db = memory_db();
    let seeded = seed_section(&db, &[]).await;
    let actor = Arc::new(MockTelegram::new().with_auto_bot());
    actor.fail_next(MockOp::CreateGroup, ActorError::already_done("group exists"));
    let p = provisioner(&db, actor.clone(), 3);

    let group = p.provision(seeded.section_id).await.unwrap();

    assert_eq!(group.status, GroupStatus::Failed);
    assert!(group.last_error.as_deref().unwrap().contains("not found"));
    assert!(actor.group_titles().is_empty());
}

#[tokio::test]
async fn long_sweep_does_not_hold_up_queued_sections() {
    let db = memory_db();
    let stuck = seed_section(&db, &[]).await;
    let actor = Arc::new(MockTelegram::new().with_auto_bot());
    actor.fail_next(MockOp::CreateGroup, ActorError::transient("FLOOD_WAIT"));
    let p = Arc::new(Provisioner::new(
        db.clone(),
        actor.clone(),
        Backoff {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(5),
            max_attempts: 2,
        },
        BOT_USERNAME.to_string(),
    ));
    let queue = ProvisionQueue::spawn(p, Duration::from_millis(20));

    // Let the first sweep pick up the stuck section and sit in its backoff.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let queued = seed_section(&db, &[]).await;
    queue.enqueue(queued.section_id).unwrap();

    let section_id = queued.section_id;
    let mut status = None;
    for _ in 0..100 {
        status = db
            .call(move |conn| provision::get_group(conn, section_id))
            .await
            .unwrap()
            .map(|g| g.status);
        if status == Some(GroupStatus::Ready) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, Some(GroupStatus::Ready));

    let stuck_id = stuck.section_id;
    let stuck_group = db
        .call(move |conn| provision::get_group(conn, stuck_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stuck_group.status, GroupStatus::Pending);
}

#[tokio::test]
async fn pending_sweep_provisions_every_section_in_progress() {
    let db = memory_db();
    let first = seed_section(&db, &[]).await;
    let second = seed_section(&db, &[]).await;
    let actor = Arc::new(MockTelegram::new().with_auto_bot());
    let p = provisioner(&db, actor.clone(), 3);

    let results = p.provision_pending().await.unwrap();
    let ids: Vec<i64> = results.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![first.section_id, second.section_id]);
    assert!(results
        .iter()
        .all(|(_, r)| r.as_ref().is_ok_and(|g| g.status == GroupStatus::Ready)));

    assert!(p.provision_pending().await.unwrap().is_empty());
    assert_eq!(actor.calls(MockOp::CreateGroup), 2);
}

#[tokio::test]
async fn retry_endpoint_requeues_a_failed_group() {
    let app = spawn_app();
    let seeded = seed_section(&app.db, &[]).await;
    let section_id = seeded.section_id;
    app.db
        .call(move |conn| {
            provision::ensure_group_row(conn, section_id)?;
            provision::record_failure(conn, section_id, "create_group: USER_RESTRICTED", true)
        })
        .await
        .unwrap();
    let t = Some(seeded.teacher_id);
    let group_uri = format!("/sections/sections/{section_id}/group/");

    let (status, body) = send_json(&app.router, Method::GET, &group_uri, t, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "failed");

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        &format!("/sections/sections/{section_id}/retry-group/"),
        t,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{body}");
    assert_eq!(body["status"], "pending");

    let mut body = serde_json::Value::Null;
    for _ in 0..200 {
        let (_, b) = send_json(&app.router, Method::GET, &group_uri, t, None).await;
        body = b;
        if body["status"] == "ready" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(body["status"], "ready", "{body}");
    assert_eq!(body["chat_id"], -1_001_234_567_890i64);
    assert_eq!(app.actor.calls(MockOp::CreateGroup), 1);
}

#[tokio::test]
async fn bot_added_webhook_accepts_raw_chat_ids() {
    let app = spawn_app();
    let seeded = seed_section(&app.db, &[]).await;
    let section_id = seeded.section_id;
    app.db
        .call(move |conn| {
            provision::ensure_group_row(conn, section_id)?;
            provision::record_created(conn, section_id, -1_005_555_555_555)
        })
        .await
        .unwrap();

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/sections/telegram/bot-added/",
        None,
        Some(json!({ "chat_id": 5_555_555_555i64, "is_admin": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["section_id"], section_id);
    assert_eq!(body["status"], "bot_added");

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/sections/telegram/bot-added/",
        None,
        Some(json!({ "chat_id": 42 })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NotFound");
}
