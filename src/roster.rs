//! Teachers, grades, sections and student registrations.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::normalize::normalize;

pub const MAX_NAME_CHARS: usize = 200;

static SAUDI_MOBILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^05\d{8}$").expect("valid phone pattern"));

#[derive(Debug, Clone, Serialize)]
pub struct Teacher {
    pub id: i64,
    pub full_name: String,
    pub phone: Option<String>,
    pub telegram_user_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Grade {
    pub id: i64,
    pub teacher_id: i64,
    pub display_name: String,
    pub school_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Section {
    pub id: i64,
    pub grade_id: i64,
    pub section_name: String,
    pub total_students: i64,
    pub joined_students: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentRegistration {
    pub id: i64,
    pub section_id: i64,
    pub full_name: String,
    pub normalized_name: String,
    pub phone_number: Option<String>,
    pub joined_telegram: bool,
    pub telegram_user_id: Option<i64>,
    pub telegram_username: Option<String>,
    pub joined_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StudentRow {
    pub full_name: String,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RowError {
    pub row: usize,
    pub field: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub created: usize,
    pub skipped: usize,
    pub errors: Vec<RowError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SectionCounts {
    pub total_students: i64,
    pub joined_students: i64,
}

pub fn create_teacher(
    conn: &Connection,
    full_name: &str,
    phone: Option<&str>,
    telegram_user_id: Option<i64>,
) -> CoreResult<Teacher> {
    let full_name = clean_name(full_name)?;
    let phone = phone.map(normalize_phone).transpose()?.flatten();
    conn.execute(
        "INSERT INTO teachers(full_name, phone, telegram_user_id, created_at) VALUES(?, ?, ?, ?)",
        params![full_name, phone, telegram_user_id, Utc::now()],
    )?;
    Ok(Teacher {
        id: conn.last_insert_rowid(),
        full_name,
        phone,
        telegram_user_id,
    })
}

pub fn get_teacher(conn: &Connection, teacher_id: i64) -> CoreResult<Option<Teacher>> {
    Ok(conn
        .query_row(
            "SELECT id, full_name, phone, telegram_user_id FROM teachers WHERE id = ?",
            [teacher_id],
            |r| {
                Ok(Teacher {
                    id: r.get(0)?,
                    full_name: r.get(1)?,
                    phone: r.get(2)?,
                    telegram_user_id: r.get(3)?,
                })
            },
        )
        .optional()?)
}

pub fn create_grade(
    conn: &Connection,
    teacher_id: i64,
    display_name: &str,
    school_name: &str,
) -> CoreResult<Grade> {
    if get_teacher(conn, teacher_id)?.is_none() {
        return Err(CoreError::not_found("teacher", teacher_id));
    }
    let display_name = collapse_ws(display_name);
    if display_name.is_empty() {
        return Err(CoreError::validation("display_name", "required"));
    }
    let school_name = clean_school_name(school_name);
    if school_name.is_empty() {
        return Err(CoreError::validation("school_name", "required"));
    }
    conn.execute(
        "INSERT INTO school_grades(teacher_id, display_name, school_name, created_at)
         VALUES(?, ?, ?, ?)",
        params![teacher_id, display_name, school_name, Utc::now()],
    )?;
    Ok(Grade {
        id: conn.last_insert_rowid(),
        teacher_id,
        display_name,
        school_name,
    })
}

pub fn get_grade(conn: &Connection, grade_id: i64) -> CoreResult<Grade> {
    conn.query_row(
        "SELECT id, teacher_id, display_name, school_name FROM school_grades WHERE id = ?",
        [grade_id],
        |r| {
            Ok(Grade {
                id: r.get(0)?,
                teacher_id: r.get(1)?,
                display_name: r.get(2)?,
                school_name: r.get(3)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| CoreError::not_found("grade", grade_id))
}

/// Removes a grade with its sections, rosters and groups.
pub fn delete_grade(conn: &mut Connection, grade_id: i64) -> CoreResult<()> {
    get_grade(conn, grade_id)?;
    let tx = conn.transaction()?;
    // Children first; the schema has no ON DELETE CASCADE.
    tx.execute(
        "DELETE FROM student_registrations
         WHERE section_id IN (SELECT id FROM sections WHERE grade_id = ?)",
        [grade_id],
    )?;
    tx.execute(
        "DELETE FROM telegram_groups
         WHERE section_id IN (SELECT id FROM sections WHERE grade_id = ?)",
        [grade_id],
    )?;
    tx.execute("DELETE FROM sections WHERE grade_id = ?", [grade_id])?;
    tx.execute("DELETE FROM school_grades WHERE id = ?", [grade_id])?;
    tx.commit()?;
    Ok(())
}

pub fn create_section(conn: &Connection, grade_id: i64, section_name: &str) -> CoreResult<Section> {
    get_grade(conn, grade_id)?;
    let section_name = collapse_ws(section_name);
    if section_name.is_empty() {
        return Err(CoreError::validation("section_name", "required"));
    }
    let exists: Option<i64> = conn
        .query_row(
            "SELECT id FROM sections WHERE grade_id = ? AND section_name = ?",
            params![grade_id, section_name],
            |r| r.get(0),
        )
        .optional()?;
    if exists.is_some() {
        return Err(CoreError::validation("section_name", "duplicate"));
    }
    conn.execute(
        "INSERT INTO sections(grade_id, section_name, created_at) VALUES(?, ?, ?)",
        params![grade_id, section_name, Utc::now()],
    )?;
    Ok(Section {
        id: conn.last_insert_rowid(),
        grade_id,
        section_name,
        total_students: 0,
        joined_students: 0,
    })
}

const SECTION_COLUMNS: &str = "id, grade_id, section_name, total_students, joined_students";

fn section_from_row(r: &Row<'_>) -> rusqlite::Result<Section> {
    Ok(Section {
        id: r.get(0)?,
        grade_id: r.get(1)?,
        section_name: r.get(2)?,
        total_students: r.get(3)?,
        joined_students: r.get(4)?,
    })
}

pub fn find_section(conn: &Connection, section_id: i64) -> CoreResult<Option<Section>> {
    let sql = format!("SELECT {SECTION_COLUMNS} FROM sections WHERE id = ?");
    Ok(conn
        .query_row(&sql, [section_id], section_from_row)
        .optional()?)
}

pub fn get_section(conn: &Connection, section_id: i64) -> CoreResult<Section> {
    find_section(conn, section_id)?.ok_or(CoreError::SectionNotFound(section_id))
}

pub fn list_sections(conn: &Connection, grade_id: i64) -> CoreResult<Vec<Section>> {
    get_grade(conn, grade_id)?;
    let sql = format!("SELECT {SECTION_COLUMNS} FROM sections WHERE grade_id = ? ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([grade_id], section_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn all_section_ids(conn: &Connection) -> CoreResult<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM sections ORDER BY id")?;
    let ids = stmt
        .query_map([], |r| r.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(ids)
}

/// Telegram group title for the section.
pub fn section_title(conn: &Connection, section_id: i64) -> CoreResult<String> {
    let section = get_section(conn, section_id)?;
    let grade = get_grade(conn, section.grade_id)?;
    Ok(format!("{} — {}", grade.display_name, section.section_name))
}

/// Sections belonging to another teacher are reported as missing.
pub fn ensure_section_owner(conn: &Connection, section_id: i64, teacher_id: i64) -> CoreResult<Section> {
    let section = get_section(conn, section_id)?;
    let grade = get_grade(conn, section.grade_id)?;
    if grade.teacher_id != teacher_id {
        return Err(CoreError::SectionNotFound(section_id));
    }
    Ok(section)
}

pub fn ensure_grade_owner(conn: &Connection, grade_id: i64, teacher_id: i64) -> CoreResult<Grade> {
    let grade = get_grade(conn, grade_id)?;
    if grade.teacher_id != teacher_id {
        return Err(CoreError::not_found("grade", grade_id));
    }
    Ok(grade)
}

pub fn register_student(
    conn: &mut Connection,
    section_id: i64,
    full_name: &str,
    phone: Option<&str>,
) -> CoreResult<StudentRegistration> {
    let (full_name, normalized_name, phone) = prepare_row(full_name, phone)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    get_section(&tx, section_id)?;
    if find_by_normalized(&tx, section_id, &normalized_name)?.is_some() {
        return Err(CoreError::DuplicateStudent {
            section_id,
            normalized_name,
        });
    }
    let id = insert_student(&tx, section_id, &full_name, &normalized_name, phone.as_deref())?;
    recount_section(&tx, section_id)?;
    let student = get_student(&tx, id)?;
    tx.commit()?;
    Ok(student)
}

/// Validates every row up front, then inserts the accepted ones in a single
/// transaction. Row failures are reported, never fatal to the batch.
pub fn bulk_import_students(
    conn: &mut Connection,
    section_id: i64,
    rows: &[StudentRow],
) -> CoreResult<ImportReport> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    get_section(&tx, section_id)?;

    let mut report = ImportReport::default();
    let mut seen = HashSet::new();
    let mut accepted = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        let (full_name, normalized_name, phone) = match prepare_row(&row.full_name, row.phone.as_deref()) {
            Ok(v) => v,
            Err(CoreError::Validation { field, reason }) => {
                report.errors.push(RowError { row: i, field, reason });
                continue;
            }
            Err(e) => return Err(e),
        };
        if !seen.insert(normalized_name.clone())
            || find_by_normalized(&tx, section_id, &normalized_name)?.is_some()
        {
            report.skipped += 1;
            continue;
        }
        accepted.push((full_name, normalized_name, phone));
    }

    for (full_name, normalized_name, phone) in &accepted {
        insert_student(&tx, section_id, full_name, normalized_name, phone.as_deref())?;
        report.created += 1;
    }
    recount_section(&tx, section_id)?;
    tx.commit()?;
    Ok(report)
}

fn insert_student(
    conn: &Connection,
    section_id: i64,
    full_name: &str,
    normalized_name: &str,
    phone: Option<&str>,
) -> CoreResult<i64> {
    conn.execute(
        "INSERT INTO student_registrations(section_id, full_name, normalized_name, phone_number, registered_at)
         VALUES(?, ?, ?, ?, ?)",
        params![section_id, full_name, normalized_name, phone, Utc::now()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Writes the observed roster and join counts into the section row.
pub fn recount_section(conn: &Connection, section_id: i64) -> CoreResult<SectionCounts> {
    let counts = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(joined_telegram), 0)
         FROM student_registrations WHERE section_id = ?",
        [section_id],
        |r| {
            Ok(SectionCounts {
                total_students: r.get(0)?,
                joined_students: r.get(1)?,
            })
        },
    )?;
    let changed = conn.execute(
        "UPDATE sections SET total_students = ?, joined_students = ? WHERE id = ?",
        params![counts.total_students, counts.joined_students, section_id],
    )?;
    if changed == 0 {
        return Err(CoreError::SectionNotFound(section_id));
    }
    Ok(counts)
}

pub fn increment_joined(conn: &Connection, section_id: i64) -> CoreResult<()> {
    conn.execute(
        "UPDATE sections SET joined_students = joined_students + 1 WHERE id = ?",
        [section_id],
    )?;
    Ok(())
}

const STUDENT_COLUMNS: &str = "id, section_id, full_name, normalized_name, phone_number, \
     joined_telegram, telegram_user_id, telegram_username, joined_at, registered_at";

fn student_from_row(r: &Row<'_>) -> rusqlite::Result<StudentRegistration> {
    Ok(StudentRegistration {
        id: r.get(0)?,
        section_id: r.get(1)?,
        full_name: r.get(2)?,
        normalized_name: r.get(3)?,
        phone_number: r.get(4)?,
        joined_telegram: r.get(5)?,
        telegram_user_id: r.get(6)?,
        telegram_username: r.get(7)?,
        joined_at: r.get(8)?,
        registered_at: r.get(9)?,
    })
}

pub fn get_student(conn: &Connection, student_id: i64) -> CoreResult<StudentRegistration> {
    let sql = format!("SELECT {STUDENT_COLUMNS} FROM student_registrations WHERE id = ?");
    conn.query_row(&sql, [student_id], student_from_row)
        .optional()?
        .ok_or_else(|| CoreError::not_found("student", student_id))
}

pub fn list_students(conn: &Connection, section_id: i64) -> CoreResult<Vec<StudentRegistration>> {
    get_section(conn, section_id)?;
    let sql = format!(
        "SELECT {STUDENT_COLUMNS} FROM student_registrations WHERE section_id = ? ORDER BY full_name, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([section_id], student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// All registrations of a section sharing `normalized_name`.
pub fn find_by_normalized_all(
    conn: &Connection,
    section_id: i64,
    normalized_name: &str,
) -> CoreResult<Vec<StudentRegistration>> {
    let sql = format!(
        "SELECT {STUDENT_COLUMNS} FROM student_registrations
         WHERE section_id = ? AND normalized_name = ? ORDER BY id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![section_id, normalized_name], student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn find_by_normalized(
    conn: &Connection,
    section_id: i64,
    normalized_name: &str,
) -> CoreResult<Option<StudentRegistration>> {
    Ok(find_by_normalized_all(conn, section_id, normalized_name)?
        .into_iter()
        .next())
}

fn prepare_row(full_name: &str, phone: Option<&str>) -> CoreResult<(String, String, Option<String>)> {
    let full_name = clean_name(full_name)?;
    let normalized_name = normalize(&full_name);
    if normalized_name.is_empty() {
        return Err(CoreError::validation("full_name", "required"));
    }
    let phone = phone.map(normalize_phone).transpose()?.flatten();
    Ok((full_name, normalized_name, phone))
}

fn clean_name(full_name: &str) -> CoreResult<String> {
    let name = collapse_ws(full_name);
    if name.is_empty() {
        return Err(CoreError::validation("full_name", "required"));
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(CoreError::validation(
            "full_name",
            format!("longer than {MAX_NAME_CHARS} characters"),
        ));
    }
    Ok(name)
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fixes the misspellings teachers commonly type in school names.
pub fn clean_school_name(name: &str) -> String {
    collapse_ws(name)
        .split(' ')
        .map(|w| match w {
            "مدرسه" => "مدرسة",
            "الاولى" => "الأولى",
            "الثانيه" => "الثانية",
            other => other,
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Saudi mobile numbers in local `05XXXXXXXX` form. Blank input means no phone.
pub fn normalize_phone(raw: &str) -> CoreResult<Option<String>> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();
    if cleaned.is_empty() {
        return Ok(None);
    }
    let mut phone = match cleaned.strip_prefix("+966") {
        Some(rest) => format!("0{rest}"),
        None => cleaned,
    };
    if phone.starts_with('5') {
        phone.insert(0, '0');
    }
    if !SAUDI_MOBILE_RE.is_match(&phone) {
        return Err(CoreError::validation("phone", "expected 05XXXXXXXX"));
    }
    Ok(Some(phone))
}
