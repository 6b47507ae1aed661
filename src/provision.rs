//! Section → Telegram group provisioning.
//!
//! Each section owns at most one `telegram_groups` row that walks
//! `pending → created → bot_added → ready`, with `failed` reachable from any
//! step on a non-transient actor error. Every step reads the persisted state
//! before acting, so re-running a step after a crash or a retry converges on
//! the same row.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::db::Db;
use crate::error::{CoreError, CoreResult};
use crate::retry::Backoff;
use crate::roster;
use crate::telegram::{canonical_chat_id, ActorError, ActorErrorKind, TelegramControl};

static INVITE_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://t\.me/").expect("valid invite pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Pending,
    Created,
    BotAdded,
    Ready,
    Failed,
}

impl GroupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupStatus::Pending => "pending",
            GroupStatus::Created => "created",
            GroupStatus::BotAdded => "bot_added",
            GroupStatus::Ready => "ready",
            GroupStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => GroupStatus::Pending,
            "created" => GroupStatus::Created,
            "bot_added" => GroupStatus::BotAdded,
            "ready" => GroupStatus::Ready,
            "failed" => GroupStatus::Failed,
            _ => return None,
        })
    }
}

impl ToSql for GroupStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for GroupStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        GroupStatus::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown group status {s:?}").into()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TelegramGroup {
    pub id: i64,
    pub section_id: i64,
    pub group_name: String,
    pub chat_id: Option<i64>,
    pub invite_link: Option<String>,
    pub is_bot_added: bool,
    pub is_bot_admin: bool,
    pub status: GroupStatus,
    pub last_error: Option<String>,
    pub attempts: i64,
    pub instructions_sent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TelegramGroup {
    pub fn is_ready(&self) -> bool {
        self.status == GroupStatus::Ready
    }
}

const GROUP_COLUMNS: &str = "id, section_id, group_name, chat_id, invite_link, is_bot_added, \
     is_bot_admin, status, last_error, attempts, instructions_sent, created_at, updated_at";

fn group_from_row(r: &Row<'_>) -> rusqlite::Result<TelegramGroup> {
    Ok(TelegramGroup {
        id: r.get(0)?,
        section_id: r.get(1)?,
        group_name: r.get(2)?,
        chat_id: r.get(3)?,
        invite_link: r.get(4)?,
        is_bot_added: r.get(5)?,
        is_bot_admin: r.get(6)?,
        status: r.get(7)?,
        last_error: r.get(8)?,
        attempts: r.get(9)?,
        instructions_sent: r.get(10)?,
        created_at: r.get(11)?,
        updated_at: r.get(12)?,
    })
}

pub fn get_group(conn: &Connection, section_id: i64) -> CoreResult<Option<TelegramGroup>> {
    let sql = format!("SELECT {GROUP_COLUMNS} FROM telegram_groups WHERE section_id = ?");
    Ok(conn.query_row(&sql, [section_id], group_from_row).optional()?)
}

fn require_group(conn: &Connection, section_id: i64) -> CoreResult<TelegramGroup> {
    get_group(conn, section_id)?.ok_or_else(|| CoreError::not_found("telegram_group", section_id))
}

/// Looks a group up by chat id in either raw or canonical form.
pub fn get_group_by_chat_id(conn: &Connection, chat_id: i64) -> CoreResult<Option<TelegramGroup>> {
    let sql = format!("SELECT {GROUP_COLUMNS} FROM telegram_groups WHERE chat_id = ?");
    Ok(conn
        .query_row(&sql, [canonical_chat_id(chat_id)], group_from_row)
        .optional()?)
}

/// Returns the section's group row, inserting a pending one if absent.
pub fn ensure_group_row(conn: &Connection, section_id: i64) -> CoreResult<TelegramGroup> {
    if let Some(group) = get_group(conn, section_id)? {
        return Ok(group);
    }
    let title = roster::section_title(conn, section_id)?;
    let now = Utc::now();
    conn.execute(
        "INSERT INTO telegram_groups(section_id, group_name, status, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(section_id) DO NOTHING",
        params![section_id, title, GroupStatus::Pending, now, now],
    )?;
    require_group(conn, section_id)
}

pub fn record_created(conn: &Connection, section_id: i64, chat_id: i64) -> CoreResult<TelegramGroup> {
    conn.execute(
        "UPDATE telegram_groups
         SET chat_id = ?, status = ?, last_error = NULL, updated_at = ?
         WHERE section_id = ? AND status = ?",
        params![chat_id, GroupStatus::Created, Utc::now(), section_id, GroupStatus::Pending],
    )?;
    require_group(conn, section_id)
}

/// Marks the bot as present (and optionally admin). A `created` group moves
/// to `bot_added`; other states keep their status.
pub fn record_bot_membership(conn: &Connection, section_id: i64, admin: bool) -> CoreResult<TelegramGroup> {
    conn.execute(
        "UPDATE telegram_groups
         SET is_bot_added = 1,
             is_bot_admin = (is_bot_admin OR ?),
             status = CASE WHEN status = ? THEN ? ELSE status END,
             updated_at = ?
         WHERE section_id = ?",
        params![
            admin,
            GroupStatus::Created,
            GroupStatus::BotAdded,
            Utc::now(),
            section_id
        ],
    )?;
    require_group(conn, section_id)
}

pub fn record_bot_admin(conn: &Connection, section_id: i64) -> CoreResult<TelegramGroup> {
    conn.execute(
        "UPDATE telegram_groups SET is_bot_admin = 1, updated_at = ? WHERE section_id = ?",
        params![Utc::now(), section_id],
    )?;
    require_group(conn, section_id)
}

pub fn record_ready(conn: &Connection, section_id: i64, invite_link: &str) -> CoreResult<TelegramGroup> {
    if !INVITE_LINK_RE.is_match(invite_link) {
        return Err(CoreError::validation("invite_link", "not a t.me link"));
    }
    conn.execute(
        "UPDATE telegram_groups
         SET invite_link = ?, status = ?, last_error = NULL, updated_at = ?
         WHERE section_id = ? AND status = ? AND chat_id < 0 AND is_bot_added = 1 AND is_bot_admin = 1",
        params![invite_link, GroupStatus::Ready, Utc::now(), section_id, GroupStatus::BotAdded],
    )?;
    require_group(conn, section_id)
}

pub fn record_instructions_sent(conn: &Connection, section_id: i64) -> CoreResult<()> {
    conn.execute(
        "UPDATE telegram_groups SET instructions_sent = 1, updated_at = ? WHERE section_id = ?",
        params![Utc::now(), section_id],
    )?;
    Ok(())
}

/// Counts the failed attempt; a terminal failure also parks the group in `failed`.
pub fn record_failure(
    conn: &Connection,
    section_id: i64,
    message: &str,
    terminal: bool,
) -> CoreResult<TelegramGroup> {
    conn.execute(
        "UPDATE telegram_groups
         SET last_error = ?, attempts = attempts + 1,
             status = CASE WHEN ? THEN ? ELSE status END,
             updated_at = ?
         WHERE section_id = ?",
        params![message, terminal, GroupStatus::Failed, Utc::now(), section_id],
    )?;
    require_group(conn, section_id)
}

/// Operator retry: `failed → pending`. Any other state is left untouched.
pub fn reset_failed(conn: &Connection, section_id: i64) -> CoreResult<TelegramGroup> {
    roster::get_section(conn, section_id)?;
    let group = require_group(conn, section_id)?;
    if group.status != GroupStatus::Failed {
        return Ok(group);
    }
    conn.execute(
        "UPDATE telegram_groups
         SET status = ?, last_error = NULL, attempts = 0, updated_at = ?
         WHERE section_id = ? AND status = ?",
        params![GroupStatus::Pending, Utc::now(), section_id, GroupStatus::Failed],
    )?;
    require_group(conn, section_id)
}

/// Sections with no group yet, or whose group is still in progress.
pub fn sections_needing_group(conn: &Connection) -> CoreResult<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT s.id FROM sections s
         LEFT JOIN telegram_groups g ON g.section_id = s.id
         WHERE g.id IS NULL OR g.status NOT IN ('ready', 'failed')
         ORDER BY s.id",
    )?;
    let ids = stmt
        .query_map([], |r| r.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(ids)
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatIdFix {
    pub section_id: i64,
    pub from: i64,
    pub to: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CanonicalizeReport {
    pub fixed: Vec<ChatIdFix>,
    /// Rows whose canonical id is already taken by another group.
    pub conflicts: Vec<ChatIdFix>,
}

/// Rewrites stored positive chat ids into canonical supergroup form.
pub fn canonicalize_stored_chat_ids(conn: &mut Connection, dry_run: bool) -> CoreResult<CanonicalizeReport> {
    let tx = conn.transaction()?;
    let rows: Vec<(i64, i64)> = {
        let mut stmt = tx.prepare(
            "SELECT section_id, chat_id FROM telegram_groups WHERE chat_id > 0 ORDER BY section_id",
        )?;
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    let mut report = CanonicalizeReport::default();
    for (section_id, raw) in rows {
        let fix = ChatIdFix {
            section_id,
            from: raw,
            to: canonical_chat_id(raw),
        };
        let taken: Option<i64> = tx
            .query_row(
                "SELECT section_id FROM telegram_groups WHERE chat_id = ?",
                [fix.to],
                |r| r.get(0),
            )
            .optional()?;
        if taken.is_some() {
            report.conflicts.push(fix);
            continue;
        }
        if !dry_run {
            tx.execute(
                "UPDATE telegram_groups SET chat_id = ?, updated_at = ? WHERE section_id = ?",
                params![fix.to, Utc::now(), section_id],
            )?;
        }
        report.fixed.push(fix);
    }
    tx.commit()?;
    Ok(report)
}

fn instructions_text(group_name: &str, bot_username: &str) -> String {
    format!(
        "مرحباً بكم في مجموعة {group_name} 👋\n\
         للتحقق من تسجيلك أرسل اسمك الكامل كما هو مسجل لدى المعلم إلى @{bot_username}.\n\
         سيتم تأكيد انضمامك تلقائياً بعد المطابقة مع كشف الشعبة."
    )
}

enum Step<T> {
    Done(T),
    Parked(TelegramGroup),
}

/// Drives groups through their lifecycle against the external actor.
pub struct Provisioner {
    db: Db,
    actor: Arc<dyn TelegramControl>,
    backoff: Backoff,
    bot_username: String,
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl Provisioner {
    pub fn new(db: Db, actor: Arc<dyn TelegramControl>, backoff: Backoff, bot_username: String) -> Self {
        Self {
            db,
            actor,
            backoff,
            bot_username,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `fut` while holding the section's lock. The map entry is removed
    /// once no other task holds or waits on it.
    async fn with_section_lock<T>(&self, section_id: i64, fut: impl Future<Output = T>) -> T {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.entry(section_id).or_default().clone()
        };
        let out = {
            let _guard = lock.lock().await;
            fut.await
        };
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        drop(lock);
        if locks.get(&section_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&section_id);
        }
        out
    }

    /// Advances the section's group as far as the actor allows and returns it.
    ///
    /// Stops early (without error) when waiting on the bot to join or when
    /// the group is parked in `failed`. Transient failures that outlast the
    /// backoff leave the state unchanged and surface as `CoreError::Transient`.
    pub async fn provision(&self, section_id: i64) -> CoreResult<TelegramGroup> {
        self.with_section_lock(section_id, self.provision_locked(section_id))
            .await
    }

    async fn provision_locked(&self, section_id: i64) -> CoreResult<TelegramGroup> {
        let mut group = self
            .db
            .call(move |conn| ensure_group_row(conn, section_id))
            .await?;

        loop {
            match group.status {
                GroupStatus::Pending => {
                    let chat_id = match group.chat_id {
                        Some(id) => id,
                        None => {
                            let res = self.create_or_find_group(&group).await.and_then(|raw| match raw {
                                0 => Err(ActorError::permanent("session service returned chat id 0")),
                                raw => Ok(canonical_chat_id(raw)),
                            });
                            match self.settle(section_id, "create_group", res).await? {
                                Step::Done(id) => id,
                                Step::Parked(g) => return Ok(g),
                            }
                        }
                    };
                    info!(section_id, chat_id, "telegram group created");
                    group = self
                        .db
                        .call(move |conn| record_created(conn, section_id, chat_id))
                        .await?;
                }
                GroupStatus::Created => {
                    let chat_id = stored_chat_id(&group)?;
                    let actor = self.actor.clone();
                    let res = self
                        .backoff
                        .run("bot_membership", || {
                            let actor = actor.clone();
                            async move { actor.bot_membership(chat_id).await }
                        })
                        .await;
                    let membership = match self.settle(section_id, "bot_membership", res).await? {
                        Step::Done(m) => m,
                        Step::Parked(g) => return Ok(g),
                    };
                    if !membership.present {
                        return Ok(group);
                    }
                    info!(section_id, chat_id, admin = membership.admin, "bot joined group");
                    group = self
                        .db
                        .call(move |conn| record_bot_membership(conn, section_id, membership.admin))
                        .await?;
                }
                GroupStatus::BotAdded => {
                    let chat_id = stored_chat_id(&group)?;
                    if !group.is_bot_admin {
                        let actor = self.actor.clone();
                        let res = self
                            .backoff
                            .run("promote_bot", || {
                                let actor = actor.clone();
                                async move { actor.promote_bot(chat_id).await }
                            })
                            .await
                            .or_else(|e| match e.kind {
                                ActorErrorKind::AlreadyDone => Ok(()),
                                _ => Err(e),
                            });
                        if let Step::Parked(g) = self.settle(section_id, "promote_bot", res).await? {
                            return Ok(g);
                        }
                        group = self
                            .db
                            .call(move |conn| record_bot_admin(conn, section_id))
                            .await?;
                    }

                    let actor = self.actor.clone();
                    let res = self
                        .backoff
                        .run("export_invite", || {
                            let actor = actor.clone();
                            async move { actor.export_invite(chat_id).await }
                        })
                        .await
                        .and_then(|link| {
                            if INVITE_LINK_RE.is_match(&link) {
                                Ok(link)
                            } else {
                                Err(ActorError::permanent(format!("unexpected invite link {link:?}")))
                            }
                        });
                    let link = match self.settle(section_id, "export_invite", res).await? {
                        Step::Done(link) => link,
                        Step::Parked(g) => return Ok(g),
                    };
                    group = self
                        .db
                        .call(move |conn| record_ready(conn, section_id, &link))
                        .await?;
                    if group.is_ready() {
                        info!(section_id, chat_id, "telegram group ready");
                    } else {
                        return Err(CoreError::Internal(format!(
                            "group of section {section_id} did not reach ready"
                        )));
                    }
                }
                GroupStatus::Ready => {
                    if !group.instructions_sent {
                        self.send_instructions(&group).await?;
                        group.instructions_sent = true;
                    }
                    return Ok(group);
                }
                GroupStatus::Failed => return Ok(group),
            }
        }
    }

    /// Creates the group under its idempotency key. A reply lost after the
    /// actor acted is retried with the same key; an `AlreadyDone` answer is
    /// resolved by looking the key up.
    async fn create_or_find_group(&self, group: &TelegramGroup) -> Result<i64, ActorError> {
        let title = group.group_name.clone();
        let key = group_key(group.section_id, group.id);
        let actor = self.actor.clone();
        let created = self
            .backoff
            .run("create_group", || {
                let (actor, title, key) = (actor.clone(), title.clone(), key.clone());
                async move { actor.create_group(&title, &key).await }
            })
            .await;
        match created {
            Err(e) if e.kind == ActorErrorKind::AlreadyDone => {
                info!(section_id = group.section_id, %key, "group already created, looking it up");
                let found = self
                    .backoff
                    .run("find_group", || {
                        let (actor, key) = (actor.clone(), key.clone());
                        async move { actor.find_group(&key).await }
                    })
                    .await?;
                found.ok_or_else(|| {
                    ActorError::permanent(format!("group {key} reported as created but not found"))
                })
            }
            other => other,
        }
    }

    async fn send_instructions(&self, group: &TelegramGroup) -> CoreResult<()> {
        let chat_id = stored_chat_id(group)?;
        let section_id = group.section_id;
        let text = instructions_text(&group.group_name, &self.bot_username);
        let actor = self.actor.clone();
        let res = self
            .backoff
            .run("send", || {
                let (actor, text) = (actor.clone(), text.clone());
                async move { actor.send(chat_id, &text).await }
            })
            .await;
        match res {
            Ok(()) => {
                self.db
                    .call(move |conn| record_instructions_sent(conn, section_id))
                    .await
            }
            // The group stays ready; the message is retried on the next pass.
            Err(e) => {
                warn!(section_id, chat_id, error = %e, "failed to send group instructions");
                Ok(())
            }
        }
    }

    async fn settle<T>(
        &self,
        section_id: i64,
        op: &'static str,
        res: Result<T, ActorError>,
    ) -> CoreResult<Step<T>> {
        let err = match res {
            Ok(v) => return Ok(Step::Done(v)),
            Err(e) => e,
        };
        let message = format!("{op}: {}", err.message);
        let terminal = !err.is_transient();
        let group = {
            let message = message.clone();
            self.db
                .call(move |conn| record_failure(conn, section_id, &message, terminal))
                .await?
        };
        if terminal {
            error!(section_id, op, error = %err, "provisioning failed");
            Ok(Step::Parked(group))
        } else {
            warn!(section_id, op, error = %err, "provisioning step exhausted retries");
            Err(CoreError::Transient(message))
        }
    }

    /// Bot webhook: the bot was added to `chat_id` (raw or canonical).
    pub async fn on_bot_added(&self, chat_id: i64, is_admin: bool) -> CoreResult<TelegramGroup> {
        let group = self
            .db
            .call(move |conn| {
                get_group_by_chat_id(conn, chat_id)?
                    .ok_or_else(|| CoreError::not_found("telegram_group", canonical_chat_id(chat_id)))
            })
            .await?;
        let section_id = group.section_id;
        self.with_section_lock(
            section_id,
            self.db
                .call(move |conn| record_bot_membership(conn, section_id, is_admin)),
        )
        .await
    }

    /// Operator retry of a failed group. The caller re-enqueues it.
    pub async fn retry(&self, section_id: i64) -> CoreResult<TelegramGroup> {
        self.with_section_lock(
            section_id,
            self.db.call(move |conn| reset_failed(conn, section_id)),
        )
        .await
    }

    /// Runs [`Provisioner::provision`] for every section still in progress.
    pub async fn provision_pending(self: &Arc<Self>) -> CoreResult<Vec<(i64, CoreResult<TelegramGroup>)>> {
        let ids = self.db.call(|conn| sections_needing_group(conn)).await?;
        let mut set = JoinSet::new();
        for section_id in ids {
            let this = Arc::clone(self);
            set.spawn(async move { (section_id, this.provision(section_id).await) });
        }
        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(r) => results.push(r),
                Err(e) => error!(error = %e, "provisioning task panicked"),
            }
        }
        results.sort_by_key(|(id, _)| *id);
        Ok(results)
    }
}

/// Idempotency key the actor stores with a created group.
pub fn group_key(section_id: i64, group_id: i64) -> String {
    format!("section-{section_id}-group-{group_id}")
}

fn stored_chat_id(group: &TelegramGroup) -> CoreResult<i64> {
    group.chat_id.ok_or_else(|| {
        CoreError::Internal(format!(
            "group of section {} is {} without a chat id",
            group.section_id,
            group.status.as_str()
        ))
    })
}

/// Background worker fed by the HTTP edge; also sweeps periodically.
#[derive(Clone)]
pub struct ProvisionQueue {
    tx: mpsc::UnboundedSender<i64>,
}

impl ProvisionQueue {
    pub fn spawn(provisioner: Arc<Provisioner>, poll_every: Duration) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<i64>();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + poll_every;
            let mut tick = tokio::time::interval_at(start, poll_every);
            let mut sweep: Option<JoinHandle<()>> = None;
            loop {
                tokio::select! {
                    msg = rx.recv() => {
                        let Some(section_id) = msg else { break };
                        let p = Arc::clone(&provisioner);
                        tokio::spawn(async move {
                            match p.provision(section_id).await {
                                Ok(g) => info!(section_id, status = g.status.as_str(), "provisioning pass done"),
                                Err(e) => warn!(section_id, error = %e, "provisioning pass failed"),
                            }
                        });
                    }
                    _ = tick.tick() => {
                        if sweep.as_ref().is_some_and(|h| !h.is_finished()) {
                            debug!("previous provisioning sweep still running");
                            continue;
                        }
                        let p = Arc::clone(&provisioner);
                        sweep = Some(tokio::spawn(async move {
                            if let Err(e) = p.provision_pending().await {
                                warn!(error = %e, "provisioning sweep failed");
                            }
                        }));
                    }
                }
            }
        });
        Self { tx }
    }

    pub fn enqueue(&self, section_id: i64) -> CoreResult<()> {
        self.tx
            .send(section_id)
            .map_err(|_| CoreError::Internal("provisioning worker stopped".into()))
    }
}
