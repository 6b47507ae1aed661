//! In-memory actor for tests and local development.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{canonical_chat_id, ActorError, BotMembership, TelegramControl};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    CreateGroup,
    FindGroup,
    PromoteBot,
    ExportInvite,
    Send,
    BotMembership,
}

#[derive(Debug, Default)]
struct MockGroup {
    title: String,
    bot_present: bool,
    bot_admin: bool,
}

#[derive(Debug, Default)]
struct Inner {
    next_chat_id: i64,
    auto_bot: bool,
    groups: HashMap<i64, MockGroup>,
    keys: HashMap<String, i64>,
    lost_replies: HashMap<MockOp, usize>,
    failures: HashMap<MockOp, VecDeque<ActorError>>,
    calls: HashMap<MockOp, usize>,
    sent: Vec<(i64, String)>,
}

#[derive(Debug)]
pub struct MockTelegram {
    inner: Mutex<Inner>,
    latency: Duration,
}

impl Default for MockTelegram {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTelegram {
    /// Groups get positive ids starting at 1234567890, like the session API.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_chat_id: 1_234_567_890,
                ..Inner::default()
            }),
            latency: Duration::ZERO,
        }
    }

    /// The bot joins each group as soon as it is created.
    pub fn with_auto_bot(self) -> Self {
        self.lock().auto_bot = true;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_next_chat_id(&self, id: i64) {
        self.lock().next_chat_id = id;
    }

    /// Queues an error returned by the next call of `op`.
    pub fn fail_next(&self, op: MockOp, err: ActorError) {
        self.lock().failures.entry(op).or_default().push_back(err);
    }

    /// The next call of `op` takes effect but its reply is lost (timeout).
    pub fn lose_next_reply(&self, op: MockOp) {
        *self.lock().lost_replies.entry(op).or_default() += 1;
    }

    /// `chat_id` may be given raw or canonical.
    pub fn set_bot_present(&self, chat_id: i64, present: bool) {
        let mut inner = self.lock();
        let group = inner.groups.entry(canonical_chat_id(chat_id)).or_default();
        group.bot_present = present;
    }

    pub fn calls(&self, op: MockOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn sent(&self) -> Vec<(i64, String)> {
        self.lock().sent.clone()
    }

    pub fn group_titles(&self) -> Vec<String> {
        self.lock().groups.values().map(|g| g.title.clone()).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic inside a test closure must not hide the first failure.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn enter(&self, op: MockOp) -> Result<(), ActorError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut inner = self.lock();
        *inner.calls.entry(op).or_default() += 1;
        match inner.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn known(inner: &Inner, chat_id: i64) -> Result<(), ActorError> {
        if inner.groups.contains_key(&canonical_chat_id(chat_id)) {
            Ok(())
        } else {
            Err(ActorError::permanent(format!("chat {chat_id} not found")))
        }
    }
}

#[async_trait]
impl TelegramControl for MockTelegram {
    async fn create_group(&self, title: &str, key: &str) -> Result<i64, ActorError> {
        self.enter(MockOp::CreateGroup).await?;
        let mut inner = self.lock();
        if let Some(&raw) = inner.keys.get(key) {
            return Ok(raw);
        }
        let raw = inner.next_chat_id;
        inner.next_chat_id += 1;
        let auto_bot = inner.auto_bot;
        inner.groups.insert(
            canonical_chat_id(raw),
            MockGroup {
                title: title.to_string(),
                bot_present: auto_bot,
                bot_admin: false,
            },
        );
        inner.keys.insert(key.to_string(), raw);
        if let Some(n) = inner.lost_replies.get_mut(&MockOp::CreateGroup).filter(|n| **n > 0) {
            *n -= 1;
            return Err(ActorError::transient("create_group reply timed out"));
        }
        Ok(raw)
    }

    async fn find_group(&self, key: &str) -> Result<Option<i64>, ActorError> {
        self.enter(MockOp::FindGroup).await?;
        Ok(self.lock().keys.get(key).copied())
    }

    async fn promote_bot(&self, chat_id: i64) -> Result<(), ActorError> {
        self.enter(MockOp::PromoteBot).await?;
        let mut inner = self.lock();
        Self::known(&inner, chat_id)?;
        let group = inner.groups.entry(canonical_chat_id(chat_id)).or_default();
        if !group.bot_present {
            return Err(ActorError::permanent("bot is not a member of the chat"));
        }
        if group.bot_admin {
            return Err(ActorError::already_done("bot is already an administrator"));
        }
        group.bot_admin = true;
        Ok(())
    }

    async fn export_invite(&self, chat_id: i64) -> Result<String, ActorError> {
        self.enter(MockOp::ExportInvite).await?;
        let inner = self.lock();
        Self::known(&inner, chat_id)?;
        Ok(format!("https://t.me/+mock{}", canonical_chat_id(chat_id).unsigned_abs()))
    }

    async fn send(&self, chat_id: i64, text: &str) -> Result<(), ActorError> {
        self.enter(MockOp::Send).await?;
        let mut inner = self.lock();
        Self::known(&inner, chat_id)?;
        inner.sent.push((chat_id, text.to_string()));
        Ok(())
    }

    async fn bot_membership(&self, chat_id: i64) -> Result<BotMembership, ActorError> {
        self.enter(MockOp::BotMembership).await?;
        let inner = self.lock();
        Ok(inner
            .groups
            .get(&canonical_chat_id(chat_id))
            .map(|g| BotMembership {
                present: g.bot_present,
                admin: g.bot_admin,
            })
            .unwrap_or_default())
    }
}
