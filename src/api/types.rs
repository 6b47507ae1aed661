use std::sync::Arc;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::config::Config;
use crate::db::Db;
use crate::error::{CoreError, CoreResult};
use crate::join::{InviteSigner, JoinVerifier};
use crate::provision::{ProvisionQueue, Provisioner};
use crate::retry::Backoff;
use crate::roster::{self, Teacher};
use crate::submissions::{
    AiReviewer, ClamAvScanner, HttpAiReviewer, SubmissionService, SubmissionValidator,
    ValidationQueue, VirusScanner,
};
use crate::telegram::TelegramControl;

pub const TEACHER_HEADER: &str = "x-teacher-id";

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub config: Arc<Config>,
    pub provisioner: Arc<Provisioner>,
    pub provision_queue: ProvisionQueue,
    pub joins: JoinVerifier,
    pub submissions: SubmissionService,
}

impl AppState {
    /// Production wiring: default backoff, ClamAV and AI reviewer when configured.
    pub fn new(db: Db, config: Config, actor: Arc<dyn TelegramControl>) -> CoreResult<Self> {
        let provisioner = Arc::new(Provisioner::new(
            db.clone(),
            actor,
            Backoff::default(),
            config.telegram_bot_username.clone(),
        ));
        let scanner = config
            .clamav_addr
            .as_ref()
            .map(|addr| Arc::new(ClamAvScanner::new(addr.clone())) as Arc<dyn VirusScanner>);
        let reviewer = match &config.ai_review_url {
            Some(url) => Some(Arc::new(HttpAiReviewer::new(url.clone())?) as Arc<dyn AiReviewer>),
            None => None,
        };
        let validator = Arc::new(SubmissionValidator::new(scanner, reviewer, config.ai_threshold));
        Self::with_parts(db, config, provisioner, validator)
    }

    pub fn with_parts(
        db: Db,
        config: Config,
        provisioner: Arc<Provisioner>,
        validator: Arc<SubmissionValidator>,
    ) -> CoreResult<Self> {
        let provision_queue =
            ProvisionQueue::spawn(Arc::clone(&provisioner), config.provision_poll_interval);
        let joins = JoinVerifier::new(db.clone(), InviteSigner::new(&config.otp_secret_key)?);
        let submissions = SubmissionService::new(
            db.clone(),
            ValidationQueue::spawn(validator, config.validation_timeout),
        );
        Ok(Self {
            db,
            config: Arc::new(config),
            provisioner,
            provision_queue,
            joins,
            submissions,
        })
    }
}

/// The teacher named by the `X-Teacher-Id` header.
pub struct CurrentTeacher(pub Teacher);

#[async_trait]
impl FromRequestParts<AppState> for CurrentTeacher {
    type Rejection = CoreError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let teacher_id = parts
            .headers
            .get(TEACHER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .ok_or_else(|| CoreError::Forbidden("missing teacher identity".into()))?;
        let teacher = state
            .db
            .call(move |conn| roster::get_teacher(conn, teacher_id))
            .await?
            .ok_or_else(|| CoreError::Forbidden(format!("user {teacher_id} has no teacher profile")))?;
        Ok(CurrentTeacher(teacher))
    }
}
