use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use rusqlite::Connection;

use crate::config::DatabaseLocation;
use crate::error::{CoreError, CoreResult};

pub fn open_db(path: &Path) -> anyhow::Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create database directory {}", parent.display()))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("open database {}", path.display()))?;
    // journal_mode returns the resulting mode as a row.
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            full_name TEXT NOT NULL,
            phone TEXT,
            telegram_user_id INTEGER,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS school_grades(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            teacher_id INTEGER NOT NULL,
            display_name TEXT NOT NULL,
            school_name TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_school_grades_teacher ON school_grades(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sections(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            grade_id INTEGER NOT NULL,
            section_name TEXT NOT NULL,
            total_students INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(grade_id) REFERENCES school_grades(id),
            UNIQUE(grade_id, section_name)
        )",
        [],
    )?;
    // Databases created before join tracking lack the joined counter.
    ensure_sections_joined_students(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_registrations(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            section_id INTEGER NOT NULL,
            full_name TEXT NOT NULL,
            normalized_name TEXT NOT NULL,
            phone_number TEXT,
            joined_telegram INTEGER NOT NULL DEFAULT 0,
            telegram_user_id INTEGER,
            telegram_username TEXT,
            joined_at TEXT,
            registered_at TEXT NOT NULL,
            FOREIGN KEY(section_id) REFERENCES sections(id),
            UNIQUE(section_id, normalized_name),
            CHECK(joined_telegram = 0 OR (telegram_user_id IS NOT NULL AND joined_at IS NOT NULL))
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_section ON student_registrations(section_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS telegram_groups(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            section_id INTEGER NOT NULL UNIQUE,
            group_name TEXT NOT NULL,
            chat_id INTEGER UNIQUE,
            invite_link TEXT,
            is_bot_added INTEGER NOT NULL DEFAULT 0,
            is_bot_admin INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            last_error TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(section_id) REFERENCES sections(id)
        )",
        [],
    )?;
    ensure_telegram_groups_instructions_sent(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS projects(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            teacher_id INTEGER NOT NULL,
            title TEXT NOT NULL,
            instructions TEXT NOT NULL DEFAULT '',
            requirements TEXT NOT NULL DEFAULT '',
            allowed_file_types TEXT NOT NULL,
            max_file_size_mb INTEGER NOT NULL DEFAULT 10,
            created_at TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS submissions(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id INTEGER NOT NULL,
            student_name TEXT NOT NULL,
            file_name TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            file_type TEXT NOT NULL,
            file_hash TEXT NOT NULL,
            validation_data TEXT NOT NULL,
            virus_scanned INTEGER NOT NULL DEFAULT 0,
            virus_clean INTEGER NOT NULL DEFAULT 1,
            ai_checked INTEGER NOT NULL DEFAULT 0,
            ai_compliant INTEGER NOT NULL DEFAULT 0,
            ai_confidence INTEGER NOT NULL DEFAULT 0,
            submitted_at TEXT NOT NULL,
            FOREIGN KEY(project_id) REFERENCES projects(id),
            CHECK(ai_confidence BETWEEN 0 AND 100)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_submissions_project ON submissions(project_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS actor_leases(
            name TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            heartbeat_at TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

fn ensure_sections_joined_students(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "sections", "joined_students")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE sections ADD COLUMN joined_students INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn ensure_telegram_groups_instructions_sent(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "telegram_groups", "instructions_sent")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE telegram_groups ADD COLUMN instructions_sent INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    // Groups already ready were announced by the bot when they were created.
    conn.execute(
        "UPDATE telegram_groups SET instructions_sent = 1 WHERE status = 'ready'",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Shared handle to the store. Blocking work runs off the async executor.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub fn open(location: &DatabaseLocation) -> anyhow::Result<Self> {
        let conn = match location {
            DatabaseLocation::File(path) => open_db(path)?,
            DatabaseLocation::Memory => open_in_memory()?,
        };
        Ok(Self::new(conn))
    }

    pub async fn call<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Connection) -> CoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.blocking(f))
            .await
            .map_err(|e| CoreError::Internal(format!("database task failed: {e}")))?
    }

    pub fn blocking<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Connection) -> CoreResult<T>,
    {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| CoreError::Internal("database connection mutex poisoned".into()))?;
        f(&mut *guard)
    }
}
