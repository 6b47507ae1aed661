//! Projects and submission validation.
//!
//! Every uploaded file is hashed, checked structurally against its project,
//! optionally virus-scanned and (for text content) reviewed by an AI model.
//! Validation runs on a worker task; the caller waits with a timeout and the
//! submission is stored whatever the outcome.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::db::Db;
use crate::error::{CoreError, CoreResult};

pub const SMALL_FILE_BYTES: u64 = 10 * 1024;
pub const MAX_FILE_NAME_CHARS: usize = 255;
pub const AI_EXCERPT_CHARS: usize = 5000;
const DANGEROUS_NAME_PATTERNS: &[&str] = &["..", "/", "\\", "<", ">", ":", "\"", "|", "?", "*"];
const TEXT_EXTENSIONS: &[&str] = &[".txt", ".md", ".csv"];
const CLAMD_CHUNK: usize = 8192;

static JSON_OBJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid json object pattern"));

#[derive(Debug, Clone, Copy)]
pub struct FileTypeSpec {
    pub code: &'static str,
    pub extensions: &'static [&'static str],
    pub max_size_mb: i64,
    pub label: &'static str,
}

pub const SUPPORTED_FILE_TYPES: &[FileTypeSpec] = &[
    FileTypeSpec { code: "pdf", extensions: &[".pdf"], max_size_mb: 50, label: "PDF" },
    FileTypeSpec { code: "doc", extensions: &[".doc", ".docx", ".txt", ".md"], max_size_mb: 50, label: "Word" },
    FileTypeSpec { code: "ppt", extensions: &[".ppt", ".pptx"], max_size_mb: 50, label: "PowerPoint" },
    FileTypeSpec { code: "xls", extensions: &[".xls", ".xlsx", ".csv"], max_size_mb: 50, label: "Excel" },
    FileTypeSpec {
        code: "img",
        extensions: &[".jpg", ".jpeg", ".png", ".gif", ".bmp", ".webp", ".svg"],
        max_size_mb: 20,
        label: "صور",
    },
    FileTypeSpec {
        code: "video",
        extensions: &[".mp4", ".avi", ".mov", ".wmv", ".mkv", ".flv", ".webm", ".m4v"],
        max_size_mb: 50,
        label: "فيديو",
    },
    FileTypeSpec {
        code: "audio",
        extensions: &[".mp3", ".wav", ".m4a", ".aac", ".ogg", ".wma", ".flac"],
        max_size_mb: 20,
        label: "صوت",
    },
    FileTypeSpec {
        code: "zip",
        extensions: &[".zip", ".rar", ".7z", ".tar", ".gz"],
        max_size_mb: 100,
        label: "ملفات مضغوطة",
    },
];

/// Upper bound for a project's own size limit: the largest per-type limit.
pub const MAX_PROJECT_FILE_SIZE_MB: i64 = 100;

pub fn file_type(code: &str) -> Option<&'static FileTypeSpec> {
    SUPPORTED_FILE_TYPES.iter().find(|t| t.code == code)
}

/// Type code of the first allowed type that accepts `extension`.
pub fn file_type_for_extension(extension: &str, allowed: &[String]) -> Option<&'static str> {
    allowed
        .iter()
        .filter_map(|code| file_type(code))
        .find(|t| t.extensions.contains(&extension))
        .map(|t| t.code)
}

/// Lowercased extension including the dot, or empty.
pub fn extension_of(file_name: &str) -> String {
    match file_name.rfind('.') {
        Some(i) if i > 0 => file_name[i..].to_lowercase(),
        _ => String::new(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: i64,
    pub teacher_id: i64,
    pub title: String,
    pub instructions: String,
    pub requirements: String,
    pub allowed_file_types: Vec<String>,
    pub max_file_size_mb: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewProject {
    pub title: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub requirements: String,
    pub allowed_file_types: Vec<String>,
    #[serde(default)]
    pub max_file_size_mb: Option<i64>,
}

pub fn create_project(conn: &Connection, teacher_id: i64, new: &NewProject) -> CoreResult<Project> {
    let title = new.title.trim().to_string();
    if title.is_empty() {
        return Err(CoreError::validation("title", "required"));
    }
    if new.allowed_file_types.is_empty() {
        return Err(CoreError::validation("allowed_file_types", "at least one type is required"));
    }
    let mut types: Vec<String> = Vec::new();
    for code in &new.allowed_file_types {
        let code = code.trim().to_lowercase();
        if file_type(&code).is_none() {
            return Err(CoreError::validation("allowed_file_types", format!("unknown type {code}")));
        }
        if !types.contains(&code) {
            types.push(code);
        }
    }
    // Default is the largest limit among the allowed types, never below 10 MB.
    let max_file_size_mb = match new.max_file_size_mb {
        Some(mb) if mb > MAX_PROJECT_FILE_SIZE_MB => {
            return Err(CoreError::validation(
                "max_file_size_mb",
                format!("must not exceed {MAX_PROJECT_FILE_SIZE_MB}"),
            ))
        }
        Some(mb) if mb > 0 => mb,
        Some(_) => return Err(CoreError::validation("max_file_size_mb", "must be positive")),
        None => types
            .iter()
            .filter_map(|c| file_type(c))
            .map(|t| t.max_size_mb)
            .fold(10, i64::max),
    };
    let types_json = serde_json::to_string(&types)
        .map_err(|e| CoreError::Internal(format!("encode file types: {e}")))?;
    conn.execute(
        "INSERT INTO projects(teacher_id, title, instructions, requirements, allowed_file_types, max_file_size_mb, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        params![
            teacher_id,
            title,
            new.instructions.trim(),
            new.requirements.trim(),
            types_json,
            max_file_size_mb,
            Utc::now()
        ],
    )?;
    get_project(conn, conn.last_insert_rowid())
}

pub fn get_project(conn: &Connection, project_id: i64) -> CoreResult<Project> {
    let row = conn
        .query_row(
            "SELECT id, teacher_id, title, instructions, requirements, allowed_file_types, max_file_size_mb
             FROM projects WHERE id = ?",
            [project_id],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, i64>(6)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| CoreError::not_found("project", project_id))?;
    let allowed_file_types = serde_json::from_str(&row.5)
        .map_err(|e| CoreError::Internal(format!("project {project_id} file types: {e}")))?;
    Ok(Project {
        id: row.0,
        teacher_id: row.1,
        title: row.2,
        instructions: row.3,
        requirements: row.4,
        allowed_file_types,
        max_file_size_mb: row.6,
    })
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StructuralReport {
    pub extension: String,
    pub file_type: Option<&'static str>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl StructuralReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

pub fn structural_checks(file_name: &str, size: u64, project: &Project) -> StructuralReport {
    let extension = extension_of(file_name);
    let file_type = file_type_for_extension(&extension, &project.allowed_file_types);
    let mut report = StructuralReport {
        extension,
        file_type,
        ..StructuralReport::default()
    };

    let max_bytes = u64::try_from(project.max_file_size_mb)
        .unwrap_or(0)
        .saturating_mul(1024 * 1024);
    if size > max_bytes {
        report.errors.push(format!(
            "حجم الملف يتجاوز الحد الأقصى ({} MB)",
            project.max_file_size_mb
        ));
    } else if size < SMALL_FILE_BYTES {
        report
            .warnings
            .push("حجم الملف صغير جداً، تأكد من أنه يحتوي على العمل المطلوب".into());
    }
    if report.file_type.is_none() {
        let shown = if report.extension.is_empty() {
            "بدون امتداد".to_string()
        } else {
            report.extension.clone()
        };
        report.errors.push(format!("نوع الملف غير مسموح ({shown})"));
    }
    if DANGEROUS_NAME_PATTERNS.iter().any(|p| file_name.contains(p)) {
        report.errors.push("اسم الملف يحتوي على أحرف غير مسموحة".into());
    }
    if file_name.chars().count() > MAX_FILE_NAME_CHARS {
        report
            .errors
            .push(format!("اسم الملف طويل جداً (الحد الأقصى: {MAX_FILE_NAME_CHARS} حرف)"));
    }
    report
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    Clean,
    Infected(String),
}

#[async_trait]
pub trait VirusScanner: Send + Sync {
    async fn scan(&self, bytes: &[u8]) -> Result<ScanVerdict, String>;
}

/// clamd over TCP using the INSTREAM command.
pub struct ClamAvScanner {
    addr: String,
    timeout: Duration,
}

impl ClamAvScanner {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: Duration::from_secs(30),
        }
    }

    async fn instream(&self, bytes: &[u8]) -> std::io::Result<String> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        stream.write_all(b"zINSTREAM\0").await?;
        for chunk in bytes.chunks(CLAMD_CHUNK) {
            stream.write_all(&(chunk.len() as u32).to_be_bytes()).await?;
            stream.write_all(chunk).await?;
        }
        stream.write_all(&0u32.to_be_bytes()).await?;
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await?;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }
}

pub fn parse_clamd_reply(reply: &str) -> Result<ScanVerdict, String> {
    let reply = reply.trim_end_matches('\0').trim();
    let body = reply.strip_prefix("stream:").unwrap_or(reply).trim();
    if body == "OK" {
        Ok(ScanVerdict::Clean)
    } else if let Some(sig) = body.strip_suffix("FOUND") {
        Ok(ScanVerdict::Infected(sig.trim().to_string()))
    } else {
        Err(format!("clamd: {body}"))
    }
}

#[async_trait]
impl VirusScanner for ClamAvScanner {
    async fn scan(&self, bytes: &[u8]) -> Result<ScanVerdict, String> {
        let reply = tokio::time::timeout(self.timeout, self.instream(bytes))
            .await
            .map_err(|_| "clamd timed out".to_string())?
            .map_err(|e| format!("clamd: {e}"))?;
        parse_clamd_reply(&reply)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AiVerdict {
    #[serde(default)]
    pub compliant: bool,
    #[serde(default)]
    pub confidence: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

#[async_trait]
pub trait AiReviewer: Send + Sync {
    /// Returns the model's raw reply to `prompt`.
    async fn review(&self, prompt: &str) -> Result<String, String>;
}

/// Posts `{"prompt": ...}` to `AI_REVIEW_URL`; the reply body is the model text.
pub struct HttpAiReviewer {
    client: reqwest::Client,
    url: String,
}

impl HttpAiReviewer {
    pub fn new(url: impl Into<String>) -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| CoreError::Internal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AiReviewer for HttpAiReviewer {
    async fn review(&self, prompt: &str) -> Result<String, String> {
        let resp = self
            .client
            .post(&self.url)
            .json(&json!({ "prompt": prompt }))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| e.to_string())?;
        if !status.is_success() {
            return Err(format!("AI reviewer HTTP {status}: {body}"));
        }
        Ok(body)
    }
}

/// Extracts the outermost JSON object from a model reply.
pub fn parse_ai_reply(reply: &str) -> Option<AiVerdict> {
    let m = JSON_OBJECT_RE.find(reply)?;
    let mut verdict: AiVerdict = serde_json::from_str(m.as_str()).ok()?;
    verdict.confidence = verdict.confidence.clamp(0, 100);
    Some(verdict)
}

pub fn build_prompt(project: &Project, file_name: &str, excerpt: &str) -> String {
    format!(
        "أنت مساعد معلم تراجع تسليمات الطلاب.\n\
         عنوان المشروع: {title}\n\
         التعليمات: {instructions}\n\
         المتطلبات: {requirements}\n\
         اسم الملف: {file_name}\n\
         محتوى الملف:\n{excerpt}\n\n\
         أجب بصيغة JSON فقط:\n\
         {{\"compliant\": true/false, \"confidence\": 0-100, \"message\": \"...\", \"issues\": [], \"suggestions\": []}}",
        title = project.title,
        instructions = project.instructions,
        requirements = project.requirements,
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub file_hash: String,
    pub virus_scanned: bool,
    pub virus_clean: bool,
    pub ai_checked: bool,
    pub ai_compliant: bool,
    pub ai_confidence: i64,
    pub validation_data: serde_json::Value,
}

impl ValidationOutcome {
    fn unchecked(file_hash: String, validation_data: serde_json::Value) -> Self {
        Self {
            file_hash,
            virus_scanned: false,
            virus_clean: true,
            ai_checked: false,
            ai_compliant: false,
            ai_confidence: 0,
            validation_data,
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub struct SubmissionValidator {
    scanner: Option<Arc<dyn VirusScanner>>,
    reviewer: Option<Arc<dyn AiReviewer>>,
    threshold: i64,
}

impl SubmissionValidator {
    pub fn new(
        scanner: Option<Arc<dyn VirusScanner>>,
        reviewer: Option<Arc<dyn AiReviewer>>,
        threshold: u8,
    ) -> Self {
        Self {
            scanner,
            reviewer,
            threshold: i64::from(threshold),
        }
    }

    pub async fn validate(&self, file_name: &str, bytes: &[u8], project: &Project) -> ValidationOutcome {
        let file_hash = sha256_hex(bytes);
        let structure = structural_checks(file_name, bytes.len() as u64, project);
        let mut data = json!({ "structure": structure });
        let mut outcome = ValidationOutcome::unchecked(file_hash, serde_json::Value::Null);

        if let Some(scanner) = &self.scanner {
            match scanner.scan(bytes).await {
                Ok(ScanVerdict::Clean) => outcome.virus_scanned = true,
                Ok(ScanVerdict::Infected(sig)) => {
                    warn!(project_id = project.id, %sig, "infected submission");
                    outcome.virus_scanned = true;
                    outcome.virus_clean = false;
                    data["virus"] = json!({ "signature": sig });
                }
                Err(e) => {
                    warn!(project_id = project.id, error = %e, "virus scan unavailable");
                    data["virus"] = json!({ "error": e });
                }
            }
        }

        if !structure.is_valid() || !outcome.virus_clean {
            data["ai"] = json!({ "skipped": "file rejected before review" });
        } else if let Some(reviewer) = &self.reviewer {
            if TEXT_EXTENSIONS.contains(&structure.extension.as_str()) {
                let excerpt: String = String::from_utf8_lossy(bytes).chars().take(AI_EXCERPT_CHARS).collect();
                let prompt = build_prompt(project, file_name, &excerpt);
                match reviewer.review(&prompt).await.map(|r| parse_ai_reply(&r)) {
                    Ok(Some(v)) => {
                        outcome.ai_checked = true;
                        outcome.ai_confidence = v.confidence;
                        outcome.ai_compliant = v.compliant && v.confidence >= self.threshold;
                        data["ai"] = json!(v);
                    }
                    Ok(None) => data["ai"] = json!({ "error": "reply had no JSON verdict" }),
                    Err(e) => {
                        warn!(project_id = project.id, error = %e, "AI review failed");
                        data["ai"] = json!({ "error": e });
                    }
                }
            } else {
                data["ai"] = json!({ "skipped": "binary content" });
            }
        }

        outcome.validation_data = data;
        outcome
    }
}

struct Job {
    file_name: String,
    bytes: Arc<Vec<u8>>,
    project: Project,
    reply: oneshot::Sender<ValidationOutcome>,
}

/// Runs validations on worker tasks and waits for each with a deadline.
#[derive(Clone)]
pub struct ValidationQueue {
    tx: mpsc::Sender<Job>,
    timeout: Duration,
}

impl ValidationQueue {
    pub fn spawn(validator: Arc<SubmissionValidator>, timeout: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<Job>(64);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let validator = Arc::clone(&validator);
                tokio::spawn(async move {
                    let outcome = validator.validate(&job.file_name, &job.bytes, &job.project).await;
                    // The caller may have given up already.
                    let _ = job.reply.send(outcome);
                });
            }
        });
        Self { tx, timeout }
    }

    pub async fn validate(&self, file_name: &str, bytes: Arc<Vec<u8>>, project: &Project) -> ValidationOutcome {
        let file_hash = sha256_hex(&bytes);
        let (reply, rx) = oneshot::channel();
        let job = Job {
            file_name: file_name.to_string(),
            bytes,
            project: project.clone(),
            reply,
        };
        if self.tx.send(job).await.is_err() {
            warn!("validation worker stopped");
            return ValidationOutcome::unchecked(file_hash, json!({ "error": "validator unavailable" }));
        }
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => ValidationOutcome::unchecked(file_hash, json!({ "error": "validator dropped the job" })),
            Err(_) => {
                warn!(project_id = project.id, "validation timed out");
                ValidationOutcome::unchecked(file_hash, json!({ "timeout": true }))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub id: i64,
    pub project_id: i64,
    pub student_name: String,
    pub file_name: String,
    pub file_size: i64,
    pub file_type: String,
    pub file_hash: String,
    pub validation_data: serde_json::Value,
    pub virus_scanned: bool,
    pub virus_clean: bool,
    pub ai_checked: bool,
    pub ai_compliant: bool,
    pub ai_confidence: i64,
    pub submitted_at: DateTime<Utc>,
}

fn submission_from_row(r: &Row<'_>) -> rusqlite::Result<(Submission, String)> {
    Ok((
        Submission {
            id: r.get(0)?,
            project_id: r.get(1)?,
            student_name: r.get(2)?,
            file_name: r.get(3)?,
            file_size: r.get(4)?,
            file_type: r.get(5)?,
            file_hash: r.get(6)?,
            validation_data: serde_json::Value::Null,
            virus_scanned: r.get(8)?,
            virus_clean: r.get(9)?,
            ai_checked: r.get(10)?,
            ai_compliant: r.get(11)?,
            ai_confidence: r.get(12)?,
            submitted_at: r.get(13)?,
        },
        r.get(7)?,
    ))
}

pub fn get_submission(conn: &Connection, submission_id: i64) -> CoreResult<Submission> {
    let (mut sub, data) = conn
        .query_row(
            "SELECT id, project_id, student_name, file_name, file_size, file_type, file_hash,
                    validation_data, virus_scanned, virus_clean, ai_checked, ai_compliant,
                    ai_confidence, submitted_at
             FROM submissions WHERE id = ?",
            [submission_id],
            submission_from_row,
        )
        .optional()?
        .ok_or_else(|| CoreError::not_found("submission", submission_id))?;
    sub.validation_data = serde_json::from_str(&data)
        .map_err(|e| CoreError::Internal(format!("submission {submission_id} validation data: {e}")))?;
    Ok(sub)
}

pub fn insert_submission(
    conn: &Connection,
    project_id: i64,
    student_name: &str,
    file_name: &str,
    file_size: i64,
    file_type: &str,
    outcome: &ValidationOutcome,
) -> CoreResult<Submission> {
    let ai_confidence = if outcome.ai_checked { outcome.ai_confidence.clamp(0, 100) } else { 0 };
    conn.execute(
        "INSERT INTO submissions(project_id, student_name, file_name, file_size, file_type, file_hash,
                                 validation_data, virus_scanned, virus_clean, ai_checked, ai_compliant,
                                 ai_confidence, submitted_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            project_id,
            student_name,
            file_name,
            file_size,
            file_type,
            outcome.file_hash,
            outcome.validation_data.to_string(),
            outcome.virus_scanned,
            outcome.virus_clean,
            outcome.ai_checked,
            outcome.ai_compliant,
            ai_confidence,
            Utc::now()
        ],
    )?;
    get_submission(conn, conn.last_insert_rowid())
}

#[derive(Clone)]
pub struct SubmissionService {
    db: Db,
    queue: ValidationQueue,
}

impl SubmissionService {
    pub fn new(db: Db, queue: ValidationQueue) -> Self {
        Self { db, queue }
    }

    pub async fn submit(
        &self,
        project_id: i64,
        student_name: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> CoreResult<Submission> {
        let student_name = student_name.split_whitespace().collect::<Vec<_>>().join(" ");
        if student_name.is_empty() {
            return Err(CoreError::validation("student_name", "required"));
        }
        let file_name = file_name.trim().to_string();
        if file_name.is_empty() {
            return Err(CoreError::validation("file", "missing file name"));
        }
        let project = self.db.call(move |conn| get_project(conn, project_id)).await?;
        let file_size = bytes.len() as i64;
        let outcome = self.queue.validate(&file_name, Arc::new(bytes), &project).await;
        debug!(project_id, file_hash = %outcome.file_hash, ai_checked = outcome.ai_checked, "validated");

        let file_type = file_type_for_extension(&extension_of(&file_name), &project.allowed_file_types)
            .unwrap_or("unknown")
            .to_string();
        let submission = self
            .db
            .call(move |conn| {
                insert_submission(conn, project_id, &student_name, &file_name, file_size, &file_type, &outcome)
            })
            .await?;
        info!(project_id, submission_id = submission.id, "submission stored");
        Ok(submission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(types: &[&str], max_mb: i64) -> Project {
        Project {
            id: 1,
            teacher_id: 1,
            title: "بحث عن الماء".into(),
            instructions: "اكتب تقريراً".into(),
            requirements: String::new(),
            allowed_file_types: types.iter().map(|s| s.to_string()).collect(),
            max_file_size_mb: max_mb,
        }
    }

    #[test]
    fn extension_lookup_respects_allowed_types() {
        let allowed = vec!["pdf".to_string(), "img".to_string()];
        assert_eq!(file_type_for_extension(".png", &allowed), Some("img"));
        assert_eq!(file_type_for_extension(".mp4", &allowed), None);
        assert_eq!(extension_of("Report.PDF"), ".pdf");
        assert_eq!(extension_of(".hidden"), "");
    }

    #[test]
    fn structural_checks_flag_each_rule() {
        let p = project(&["pdf"], 1);
        let ok = structural_checks("report.pdf", 20 * 1024, &p);
        assert!(ok.is_valid() && ok.warnings.is_empty());

        let small = structural_checks("report.pdf", 100, &p);
        assert!(small.is_valid());
        assert_eq!(small.warnings.len(), 1);

        assert!(!structural_checks("report.pdf", 2 * 1024 * 1024, &p).is_valid());
        assert!(!structural_checks("report.exe", 20 * 1024, &p).is_valid());
        assert!(!structural_checks("../report.pdf", 20 * 1024, &p).is_valid());
        let long = format!("{}.pdf", "a".repeat(300));
        assert!(!structural_checks(&long, 20 * 1024, &p).is_valid());
    }

    #[test]
    fn oversized_limits_do_not_overflow() {
        let p = project(&["zip"], i64::MAX);
        assert!(structural_checks("archive.zip", 20 * 1024, &p).is_valid());
        assert!(structural_checks("archive.zip", u64::MAX, &p).is_valid());
    }

    fn teacher(conn: &Connection) -> i64 {
        crate::roster::create_teacher(conn, "أ. سارة", None, None).unwrap().id
    }

    fn new_project(types: &[&str], max_mb: Option<i64>) -> NewProject {
        NewProject {
            title: "بحث عن الماء".into(),
            instructions: "اكتب تقريراً".into(),
            requirements: String::new(),
            allowed_file_types: types.iter().map(|s| s.to_string()).collect(),
            max_file_size_mb: max_mb,
        }
    }

    #[test]
    fn project_size_limit_is_capped() {
        let conn = crate::db::open_in_memory().unwrap();
        let t = teacher(&conn);

        let err = create_project(&conn, t, &new_project(&["pdf"], Some(i64::MAX))).unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }), "{err:?}");
        let err = create_project(&conn, t, &new_project(&["pdf"], Some(MAX_PROJECT_FILE_SIZE_MB + 1))).unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }), "{err:?}");

        let p = create_project(&conn, t, &new_project(&["pdf"], Some(MAX_PROJECT_FILE_SIZE_MB))).unwrap();
        assert_eq!(p.max_file_size_mb, MAX_PROJECT_FILE_SIZE_MB);
        let p = create_project(&conn, t, &new_project(&["zip", "img"], None)).unwrap();
        assert_eq!(p.max_file_size_mb, 100);
    }

    #[test]
    fn corrupt_validation_data_is_an_error() {
        let conn = crate::db::open_in_memory().unwrap();
        let t = teacher(&conn);
        let p = create_project(&conn, t, &new_project(&["doc"], None)).unwrap();
        let outcome = ValidationOutcome::unchecked(sha256_hex(b"x"), json!({ "timeout": true }));
        let sub = insert_submission(&conn, p.id, "ليلى حسن", "essay.txt", 1, "doc", &outcome).unwrap();
        assert_eq!(sub.validation_data["timeout"], true);

        conn.execute(
            "UPDATE submissions SET validation_data = '{not json' WHERE id = ?",
            [sub.id],
        )
        .unwrap();
        let err = get_submission(&conn, sub.id).unwrap_err();
        assert!(matches!(err, CoreError::Internal(_)), "{err:?}");
    }

    #[test]
    fn clamd_replies_parse() {
        assert_eq!(parse_clamd_reply("stream: OK\0").unwrap(), ScanVerdict::Clean);
        assert_eq!(
            parse_clamd_reply("stream: Eicar-Test-Signature FOUND\0").unwrap(),
            ScanVerdict::Infected("Eicar-Test-Signature".into())
        );
        assert!(parse_clamd_reply("INSTREAM size limit exceeded. ERROR").is_err());
    }

    #[test]
    fn ai_reply_json_is_extracted_and_clamped() {
        let reply = "Here is my review:\n```json\n{\"compliant\": true,\n \"confidence\": 140, \"issues\": []}\n```";
        let v = parse_ai_reply(reply).unwrap();
        assert!(v.compliant);
        assert_eq!(v.confidence, 100);
        assert!(parse_ai_reply("no verdict").is_none());
    }

    struct FixedReviewer(&'static str);

    #[async_trait]
    impl AiReviewer for FixedReviewer {
        async fn review(&self, _prompt: &str) -> Result<String, String> {
            Ok(self.0.to_string())
        }
    }

    struct Infected;

    #[async_trait]
    impl VirusScanner for Infected {
        async fn scan(&self, _bytes: &[u8]) -> Result<ScanVerdict, String> {
            Ok(ScanVerdict::Infected("Eicar".into()))
        }
    }

    #[tokio::test]
    async fn compliance_requires_the_threshold() {
        let p = project(&["doc"], 10);
        let body = "x".repeat(20 * 1024);
        let low = SubmissionValidator::new(
            None,
            Some(Arc::new(FixedReviewer(r#"{"compliant": true, "confidence": 60}"#))),
            70,
        );
        let out = low.validate("essay.txt", body.as_bytes(), &p).await;
        assert!(out.ai_checked);
        assert_eq!(out.ai_confidence, 60);
        assert!(!out.ai_compliant);
        assert_eq!(out.file_hash, sha256_hex(body.as_bytes()));

        let high = SubmissionValidator::new(
            None,
            Some(Arc::new(FixedReviewer(r#"{"compliant": true, "confidence": 85}"#))),
            70,
        );
        assert!(high.validate("essay.txt", body.as_bytes(), &p).await.ai_compliant);
    }

    #[tokio::test]
    async fn infected_files_skip_review() {
        let p = project(&["doc"], 10);
        let v = SubmissionValidator::new(
            Some(Arc::new(Infected)),
            Some(Arc::new(FixedReviewer(r#"{"compliant": true, "confidence": 99}"#))),
            70,
        );
        let out = v.validate("essay.txt", &[b'a'; 20 * 1024], &p).await;
        assert!(out.virus_scanned);
        assert!(!out.virus_clean);
        assert!(!out.ai_checked);
    }

    struct SlowReviewer;

    #[async_trait]
    impl AiReviewer for SlowReviewer {
        async fn review(&self, _prompt: &str) -> Result<String, String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(r#"{"compliant": true, "confidence": 99}"#.into())
        }
    }

    #[tokio::test]
    async fn slow_review_stores_the_submission_unchecked() {
        let db = Db::new(crate::db::open_in_memory().unwrap());
        let project_id = db
            .call(|conn| {
                let t = teacher(conn);
                Ok(create_project(conn, t, &new_project(&["doc"], None))?.id)
            })
            .await
            .unwrap();
        let validator = Arc::new(SubmissionValidator::new(None, Some(Arc::new(SlowReviewer)), 70));
        let service = SubmissionService::new(db, ValidationQueue::spawn(validator, Duration::from_millis(50)));

        let body = "x".repeat(20 * 1024).into_bytes();
        let hash = sha256_hex(&body);
        let started = std::time::Instant::now();
        let sub = service.submit(project_id, "ليلى  حسن", "essay.txt", body).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(sub.student_name, "ليلى حسن");
        assert!(!sub.ai_checked);
        assert!(!sub.ai_compliant);
        assert_eq!(sub.file_hash, hash);
        assert_eq!(sub.validation_data["timeout"], true);
    }
}
