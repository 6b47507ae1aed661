//! Periodic recount of the denormalized section counters.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::Db;
use crate::error::CoreResult;
use crate::roster;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub sections: usize,
    pub failed: usize,
}

/// Recounts every section. Each section is its own short database call, so
/// the reconciler never holds the connection for a whole sweep.
pub async fn reconcile_once(db: &Db) -> CoreResult<ReconcileSummary> {
    let ids = db.call(|conn| roster::all_section_ids(conn)).await?;
    let mut summary = ReconcileSummary::default();
    for section_id in ids {
        match db
            .call(move |conn| roster::recount_section(conn, section_id))
            .await
        {
            Ok(counts) => {
                summary.sections += 1;
                debug!(section_id, total = counts.total_students, joined = counts.joined_students, "recounted");
            }
            Err(e) => {
                summary.failed += 1;
                warn!(section_id, error = %e, "recount failed");
            }
        }
    }
    Ok(summary)
}

pub fn spawn_reconciler(db: Db, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tick.tick().await;
            match reconcile_once(&db).await {
                Ok(s) => info!(sections = s.sections, failed = s.failed, "section counters reconciled"),
                Err(e) => warn!(error = %e, "reconcile sweep failed"),
            }
        }
    })
}
