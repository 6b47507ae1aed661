//! Production actor: group management goes through the user-session service
//! (`TELEGRAM_SERVICE_URL`), messaging and membership polls through the Bot API.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{ActorError, BotMembership, TelegramControl};
use crate::config::Config;
use crate::db::Db;
use crate::error::CoreResult;
use crate::lease::ActorLease;

pub const BOT_API_URL: &str = "https://api.telegram.org";
pub const SESSION_LEASE: &str = "telegram-session";

pub struct HttpTelegram {
    client: reqwest::Client,
    service_url: String,
    bot_api_url: String,
    bot_token: Option<String>,
    bot_username: String,
    lease: ActorLease,
}

#[derive(Deserialize)]
struct CreatedGroup {
    chat_id: i64,
}

#[derive(Deserialize)]
struct InviteLink {
    invite_link: String,
}

#[derive(Deserialize)]
struct BotApiReply<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<u16>,
}

#[derive(Deserialize)]
struct ChatMember {
    status: String,
}

impl HttpTelegram {
    /// Takes the session lease first; fails while another process holds it.
    pub async fn connect(db: Db, config: &Config) -> CoreResult<Self> {
        let lease = ActorLease::acquire(db, SESSION_LEASE).await?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| crate::error::CoreError::Internal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            service_url: config.telegram_service_url.trim_end_matches('/').to_string(),
            bot_api_url: BOT_API_URL.to_string(),
            bot_token: config.telegram_bot_token.clone(),
            bot_username: config.telegram_bot_username.clone(),
            lease,
        })
    }

    /// The session is only driven while this process still holds the lease.
    fn ensure_lease(&self) -> Result<(), ActorError> {
        if self.lease.is_held() {
            Ok(())
        } else {
            Err(ActorError::permanent(format!(
                "lease {SESSION_LEASE} was taken over by another process"
            )))
        }
    }

    async fn session_post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, ActorError> {
        self.ensure_lease()?;
        let url = format!("{}{}", self.service_url, path);
        debug!(%url, "session service call");
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;
        Self::session_reply(resp).await
    }

    async fn session_get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, ActorError> {
        self.ensure_lease()?;
        let url = format!("{}{}", self.service_url, path);
        debug!(%url, "session service lookup");
        let resp = self.client.get(&url).send().await.map_err(network_error)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::session_reply(resp).await.map(Some)
    }

    async fn session_reply<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ActorError> {
        let status = resp.status();
        if status.as_u16() == 409 {
            let text = resp.text().await.unwrap_or_default();
            return Err(ActorError::already_done(text));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ActorError::from_status(status.as_u16(), text));
        }
        resp.json::<T>()
            .await
            .map_err(|e| ActorError::permanent(format!("unexpected session reply: {e}")))
    }

    async fn bot_call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, ActorError> {
        let token = self
            .bot_token
            .as_deref()
            .ok_or_else(|| ActorError::permanent("TELEGRAM_BOT_TOKEN is not configured"))?;
        let url = format!("{}/bot{}/{}", self.bot_api_url, token, method);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;
        let status = resp.status().as_u16();
        let reply: BotApiReply<T> = resp
            .json()
            .await
            .map_err(|e| ActorError::from_status(status, format!("bad Bot API reply: {e}")))?;
        match (reply.ok, reply.result) {
            (true, Some(v)) => Ok(v),
            _ => Err(ActorError::from_status(
                reply.error_code.unwrap_or(status),
                reply.description.unwrap_or_else(|| method.to_string()),
            )),
        }
    }

    fn bot_user_id(&self) -> Result<i64, ActorError> {
        self.bot_token
            .as_deref()
            .and_then(|t| t.split(':').next())
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| ActorError::permanent("bot token has no numeric id prefix"))
    }
}

fn network_error(e: reqwest::Error) -> ActorError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        ActorError::transient(e.to_string())
    } else {
        ActorError::permanent(e.to_string())
    }
}

#[async_trait]
impl TelegramControl for HttpTelegram {
    async fn create_group(&self, title: &str, key: &str) -> Result<i64, ActorError> {
        let created: CreatedGroup = self
            .session_post("/groups", json!({ "title": title, "idempotency_key": key }))
            .await?;
        Ok(created.chat_id)
    }

    async fn find_group(&self, key: &str) -> Result<Option<i64>, ActorError> {
        let found: Option<CreatedGroup> = self.session_get(&format!("/groups/by-key/{key}")).await?;
        Ok(found.map(|g| g.chat_id))
    }

    async fn promote_bot(&self, chat_id: i64) -> Result<(), ActorError> {
        let _: serde_json::Value = self
            .session_post(
                &format!("/groups/{chat_id}/promote-bot"),
                json!({ "bot_username": self.bot_username }),
            )
            .await?;
        Ok(())
    }

    async fn export_invite(&self, chat_id: i64) -> Result<String, ActorError> {
        let link: InviteLink = self
            .session_post(&format!("/groups/{chat_id}/invite-link"), json!({}))
            .await?;
        Ok(link.invite_link)
    }

    async fn send(&self, chat_id: i64, text: &str) -> Result<(), ActorError> {
        let _: serde_json::Value = self
            .bot_call("sendMessage", json!({ "chat_id": chat_id, "text": text }))
            .await?;
        Ok(())
    }

    async fn bot_membership(&self, chat_id: i64) -> Result<BotMembership, ActorError> {
        let user_id = self.bot_user_id()?;
        let member: Result<ChatMember, _> = self
            .bot_call("getChatMember", json!({ "chat_id": chat_id, "user_id": user_id }))
            .await;
        match member {
            Ok(m) => Ok(membership_from_status(&m.status)),
            // The Bot API answers 400/403 for chats the bot cannot see yet.
            Err(e) if !e.is_transient() => Ok(BotMembership::default()),
            Err(e) => Err(e),
        }
    }
}

fn membership_from_status(status: &str) -> BotMembership {
    match status {
        "creator" | "administrator" => BotMembership {
            present: true,
            admin: true,
        },
        "member" | "restricted" => BotMembership {
            present: true,
            admin: false,
        },
        _ => BotMembership::default(),
    }
}
