use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};

use sectionsd::api::{build_router, AppState};
use sectionsd::config::Config;
use sectionsd::db::Db;
use sectionsd::reconcile::spawn_reconciler;
use sectionsd::logging;
use sectionsd::telegram::http::HttpTelegram;
use sectionsd::telegram::TelegramControl;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("sectionsd: {e}");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = logging::init(&config.log_level, config.log_file.as_deref()) {
        eprintln!("sectionsd: {e:#}");
        return ExitCode::from(1);
    }
    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "sectionsd stopped");
            ExitCode::from(2)
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let db = Db::open(&config.database)?;
    let actor: Arc<dyn TelegramControl> = Arc::new(HttpTelegram::connect(db.clone(), &config).await?);
    let reconcile_every = config.reconcile_interval;
    let bind_addr = config.bind_addr;
    let state = AppState::new(db.clone(), config, actor)?;
    let reconciler = spawn_reconciler(db, reconcile_every);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "sectionsd listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    reconciler.abort();
    info!("sectionsd shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
