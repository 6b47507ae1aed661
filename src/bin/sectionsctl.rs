//! Operator tool for maintenance tasks against the sectionsd database.
//!
//! Exit codes: 0 success, 1 configuration or input error, 2 operation failed.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use sectionsd::config::{parse_database_url, Config, DEFAULT_DATABASE_URL, DEFAULT_LOG_LEVEL};
use sectionsd::db::Db;
use sectionsd::logging;
use sectionsd::provision::{self, Provisioner};
use sectionsd::reconcile::reconcile_once;
use sectionsd::retry::Backoff;
use sectionsd::roster::{self, StudentRow};
use sectionsd::telegram::http::HttpTelegram;

#[derive(Parser)]
#[command(name = "sectionsctl")]
#[command(about = "sectionsd maintenance commands")]
struct Cli {
    /// Database URL (sqlite://path or :memory:)
    #[arg(long, env = "DATABASE_URL", default_value = DEFAULT_DATABASE_URL)]
    database: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Recompute total/joined counters for every section
    Recount,

    /// Drive Telegram group provisioning (needs the full service configuration)
    Provision {
        /// Only this section; otherwise every section still in progress
        #[arg(long)]
        section: Option<i64>,
    },

    /// Rewrite stored raw chat ids into canonical supergroup form
    CanonicalizeChatIds {
        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Create a teacher profile
    AddTeacher {
        #[arg(long)]
        name: String,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        telegram_user_id: Option<i64>,
    },

    /// Import students from a file of `name,phone` lines
    ImportStudents {
        #[arg(long)]
        section: i64,
        file: PathBuf,
    },
}

enum Failure {
    Input(anyhow::Error),
    Operation(anyhow::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::init(
        &std::env::var("LOG_LEVEL").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string()),
        None,
    ) {
        eprintln!("sectionsctl: {e:#}");
        return ExitCode::from(1);
    }
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(Failure::Input(e)) => {
            eprintln!("sectionsctl: {e:#}");
            ExitCode::from(1)
        }
        Err(Failure::Operation(e)) => {
            eprintln!("sectionsctl: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<(), Failure> {
    let location = parse_database_url(&cli.database).map_err(|e| Failure::Input(e.into()))?;
    let db = Db::open(&location).map_err(Failure::Operation)?;
    match cli.command {
        Command::Recount => {
            let summary = reconcile_once(&db).await.map_err(op)?;
            println!("recounted {} sections ({} failed)", summary.sections, summary.failed);
            if summary.failed > 0 {
                return Err(Failure::Operation(anyhow::anyhow!("{} sections failed", summary.failed)));
            }
        }
        Command::Provision { section } => {
            let config = Config::from_env().map_err(|e| Failure::Input(e.into()))?;
            let actor = HttpTelegram::connect(db.clone(), &config).await.map_err(op)?;
            let provisioner = Arc::new(Provisioner::new(
                db.clone(),
                Arc::new(actor),
                Backoff::default(),
                config.telegram_bot_username.clone(),
            ));
            match section {
                Some(section_id) => {
                    db.call(move |conn| provision::ensure_group_row(conn, section_id))
                        .await
                        .map_err(op)?;
                    let group = provisioner.provision(section_id).await.map_err(op)?;
                    print_json(&group)?;
                }
                None => {
                    let mut failed = 0;
                    for (section_id, result) in provisioner.provision_pending().await.map_err(op)? {
                        match result {
                            Ok(g) => println!("section {section_id}: {}", g.status.as_str()),
                            Err(e) => {
                                failed += 1;
                                println!("section {section_id}: error: {e}");
                            }
                        }
                    }
                    if failed > 0 {
                        return Err(Failure::Operation(anyhow::anyhow!("{failed} sections failed")));
                    }
                }
            }
        }
        Command::CanonicalizeChatIds { dry_run } => {
            let report = db
                .call(move |conn| provision::canonicalize_stored_chat_ids(conn, dry_run))
                .await
                .map_err(op)?;
            print_json(&report)?;
            if !report.conflicts.is_empty() {
                return Err(Failure::Operation(anyhow::anyhow!(
                    "{} chat ids collide with an existing canonical id",
                    report.conflicts.len()
                )));
            }
        }
        Command::AddTeacher {
            name,
            phone,
            telegram_user_id,
        } => {
            let teacher = db
                .call(move |conn| roster::create_teacher(conn, &name, phone.as_deref(), telegram_user_id))
                .await
                .map_err(|e| Failure::Input(e.into()))?;
            print_json(&teacher)?;
        }
        Command::ImportStudents { section, file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("read {}", file.display()))
                .map_err(Failure::Input)?;
            let rows = parse_student_lines(&text);
            let report = db
                .call(move |conn| roster::bulk_import_students(conn, section, &rows))
                .await
                .map_err(op)?;
            print_json(&report)?;
        }
    }
    Ok(())
}

fn op(e: sectionsd::error::CoreError) -> Failure {
    Failure::Operation(e.into())
}

fn print_json(value: &impl Serialize) -> Result<(), Failure> {
    let text = serde_json::to_string_pretty(value).map_err(|e| Failure::Operation(e.into()))?;
    println!("{text}");
    Ok(())
}

/// `name[,phone]` per line; blank lines and `#` comments are skipped.
fn parse_student_lines(text: &str) -> Vec<StudentRow> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|line| {
            let (name, phone) = match line.rsplit_once(',') {
                Some((n, p)) => (n.trim(), Some(p.trim()).filter(|p| !p.is_empty())),
                None => (line, None),
            };
            StudentRow {
                full_name: name.to_string(),
                phone: phone.map(str::to_string),
            }
        })
        .collect()
}
