//! Student join verification.
//!
//! A student claims a roster slot by name. The claim is matched on the
//! normalized name inside one IMMEDIATE transaction that also checks group
//! readiness, so a rejected claim never writes to the student row.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use rusqlite::{params, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};

use crate::db::Db;
use crate::error::{CoreError, CoreResult, NameSuggestion};
use crate::normalize::{normalize, similarity};
use crate::provision::{self, TelegramGroup};
use crate::roster::{self, StudentRegistration};

pub const SUGGESTION_THRESHOLD: f64 = 0.75;
pub const MAX_SUGGESTIONS: usize = 3;
pub const INVITATION_TTL_MINUTES: i64 = 60;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Deserialize)]
pub struct JoinClaim {
    pub student_name: String,
    pub section_id: i64,
    #[serde(default)]
    pub telegram_user_id: Option<i64>,
    #[serde(default)]
    pub telegram_username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmJoin {
    pub student_id: i64,
    pub telegram_user_id: i64,
    #[serde(default)]
    pub telegram_username: Option<String>,
    #[serde(default)]
    pub chat_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinedStudent {
    pub id: i64,
    pub full_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupInvite {
    pub invite_link: String,
    pub group_name: String,
    pub chat_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Invitation {
    pub expires_at: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinPayload {
    pub success: bool,
    pub student: JoinedStudent,
    pub telegram_group: GroupInvite,
    pub invitation: Invitation,
}

#[derive(Debug)]
struct Verified {
    student: StudentRegistration,
    invite: GroupInvite,
    first_join: bool,
}

/// Signs invitation payloads with `OTP_SECRET_KEY`.
#[derive(Clone)]
pub struct InviteSigner {
    keyed: HmacSha256,
    ttl: Duration,
}

impl InviteSigner {
    pub fn new(secret: &str) -> CoreResult<Self> {
        let keyed = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| CoreError::Internal(format!("invitation key: {e}")))?;
        Ok(Self {
            keyed,
            ttl: Duration::minutes(INVITATION_TTL_MINUTES),
        })
    }

    fn mac(&self, student_id: i64, chat_id: i64, invite_link: &str, expires_at: &str) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(format!("{student_id}|{chat_id}|{invite_link}|{expires_at}").as_bytes());
        mac
    }

    pub fn issue(&self, student_id: i64, invite: &GroupInvite, now: DateTime<Utc>) -> Invitation {
        let expires_at = (now + self.ttl).to_rfc3339_opts(SecondsFormat::Secs, true);
        let signature = hex::encode(
            self.mac(student_id, invite.chat_id, &invite.invite_link, &expires_at)
                .finalize()
                .into_bytes(),
        );
        Invitation {
            expires_at,
            signature,
        }
    }

    /// Checks the signature and that the invitation has not expired.
    pub fn verify(
        &self,
        student_id: i64,
        invite: &GroupInvite,
        invitation: &Invitation,
        now: DateTime<Utc>,
    ) -> bool {
        let Ok(expires_at) = DateTime::parse_from_rfc3339(&invitation.expires_at) else {
            return false;
        };
        if expires_at.with_timezone(&Utc) < now {
            return false;
        }
        let Ok(sig) = hex::decode(&invitation.signature) else {
            return false;
        };
        self.mac(student_id, invite.chat_id, &invite.invite_link, &invitation.expires_at)
            .verify_slice(&sig)
            .is_ok()
    }
}

/// Binds a telegram identity to the student. Returns whether this was the
/// student's first join. Without a telegram id nothing is written.
fn apply_join(
    conn: &Connection,
    student: &StudentRegistration,
    telegram_user_id: Option<i64>,
    telegram_username: Option<&str>,
    now: DateTime<Utc>,
) -> CoreResult<bool> {
    let Some(tg_id) = telegram_user_id else {
        return Ok(false);
    };
    if student.joined_telegram {
        if student.telegram_user_id == Some(tg_id) {
            return Ok(false);
        }
        return Err(CoreError::JoinConflict {
            student_id: student.id,
        });
    }
    let username = telegram_username
        .map(|u| u.trim().trim_start_matches('@'))
        .filter(|u| !u.is_empty());
    let changed = conn.execute(
        "UPDATE student_registrations
         SET joined_telegram = 1, telegram_user_id = ?, telegram_username = ?, joined_at = ?
         WHERE id = ? AND joined_telegram = 0",
        params![tg_id, username, now, student.id],
    )?;
    if changed == 0 {
        return Err(CoreError::JoinConflict {
            student_id: student.id,
        });
    }
    Ok(true)
}

fn suggestions(conn: &Connection, section_id: i64, claimed: &str) -> CoreResult<Vec<NameSuggestion>> {
    let mut scored: Vec<NameSuggestion> = roster::list_students(conn, section_id)?
        .into_iter()
        .map(|s| NameSuggestion {
            similarity: similarity(claimed, &s.full_name),
            name: s.full_name,
        })
        .filter(|s| s.similarity >= SUGGESTION_THRESHOLD)
        .collect();
    scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    scored.truncate(MAX_SUGGESTIONS);
    Ok(scored)
}

fn ready_invite(group: Option<TelegramGroup>, section_id: i64) -> CoreResult<GroupInvite> {
    match group {
        Some(g) if g.is_ready() => match (g.chat_id, g.invite_link) {
            (Some(chat_id), Some(invite_link)) => Ok(GroupInvite {
                invite_link,
                group_name: g.group_name,
                chat_id,
            }),
            _ => Err(CoreError::Internal(format!(
                "ready group of section {section_id} lacks chat id or invite link"
            ))),
        },
        Some(g) => Err(CoreError::GroupNotReady {
            section_id,
            status: g.status.as_str().to_string(),
        }),
        None => Err(CoreError::GroupNotReady {
            section_id,
            status: "missing".into(),
        }),
    }
}

fn verify_in_tx(conn: &mut Connection, claim: &JoinClaim, now: DateTime<Utc>) -> CoreResult<Verified> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let section = roster::get_section(&tx, claim.section_id)?;

    let norm = normalize(&claim.student_name);
    if norm.is_empty() {
        return Err(CoreError::validation("student_name", "required"));
    }

    let mut matches = roster::find_by_normalized_all(&tx, section.id, &norm)?.into_iter();
    let student = match (matches.next(), matches.next()) {
        (None, _) => {
            return Err(CoreError::StudentNotInRoster {
                section_id: section.id,
                suggestions: suggestions(&tx, section.id, &claim.student_name)?,
            })
        }
        (Some(s), None) => s,
        (Some(_), Some(_)) => {
            return Err(CoreError::AmbiguousRoster {
                section_id: section.id,
                count: 2 + matches.count(),
            })
        }
    };

    let invite = ready_invite(provision::get_group(&tx, section.id)?, section.id)?;
    let first_join = apply_join(
        &tx,
        &student,
        claim.telegram_user_id,
        claim.telegram_username.as_deref(),
        now,
    )?;
    let student = roster::get_student(&tx, student.id)?;
    tx.commit()?;
    Ok(Verified {
        student,
        invite,
        first_join,
    })
}

fn confirm_in_tx(conn: &mut Connection, req: &ConfirmJoin, now: DateTime<Utc>) -> CoreResult<(StudentRegistration, bool)> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let student = roster::get_student(&tx, req.student_id)?;
    if let Some(chat_id) = req.chat_id {
        let group = provision::get_group_by_chat_id(&tx, chat_id)?;
        if group.map(|g| g.section_id) != Some(student.section_id) {
            return Err(CoreError::validation(
                "chat_id",
                "chat does not belong to the student's section",
            ));
        }
    }
    let first_join = apply_join(
        &tx,
        &student,
        Some(req.telegram_user_id),
        req.telegram_username.as_deref(),
        now,
    )?;
    let student = roster::get_student(&tx, student.id)?;
    tx.commit()?;
    Ok((student, first_join))
}

#[derive(Clone)]
pub struct JoinVerifier {
    db: Db,
    signer: InviteSigner,
}

impl JoinVerifier {
    pub fn new(db: Db, signer: InviteSigner) -> Self {
        Self { db, signer }
    }

    pub async fn verify(&self, claim: JoinClaim) -> CoreResult<JoinPayload> {
        let now = Utc::now();
        let section_id = claim.section_id;
        let verified = self
            .db
            .call(move |conn| verify_in_tx(conn, &claim, now))
            .await?;
        if verified.first_join {
            info!(section_id, student_id = verified.student.id, "student joined");
            self.bump_joined(section_id).await;
        }
        let invitation = self.signer.issue(verified.student.id, &verified.invite, now);
        Ok(JoinPayload {
            success: true,
            student: JoinedStudent {
                id: verified.student.id,
                full_name: verified.student.full_name,
            },
            telegram_group: verified.invite,
            invitation,
        })
    }

    /// Bot webhook: the student was seen joining the chat.
    pub async fn confirm(&self, req: ConfirmJoin) -> CoreResult<StudentRegistration> {
        let now = Utc::now();
        let (student, first_join) = self
            .db
            .call(move |conn| confirm_in_tx(conn, &req, now))
            .await?;
        if first_join {
            info!(section_id = student.section_id, student_id = student.id, "student join confirmed");
            self.bump_joined(student.section_id).await;
        }
        Ok(student)
    }

    // The reconciler corrects the counter if this is lost.
    async fn bump_joined(&self, section_id: i64) {
        if let Err(e) = self
            .db
            .call(move |conn| roster::increment_joined(conn, section_id))
            .await
        {
            warn!(section_id, error = %e, "failed to bump joined counter");
        }
    }
}
