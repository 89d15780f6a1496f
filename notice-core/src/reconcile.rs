use crate::error::Result;
use crate::lifecycle::delete_notification;
use crate::store::Store;
use rusqlite::Transaction;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyStats {
    pub orphaned_extraction: u32,
    pub orphaned_raw_source: u32,
    pub incomplete_notifications: u32,
    pub orphaned_impacts: u32,
    pub fixed_issues: u32,
    pub errors: u32,
}

/// Periodic repair of drift between notifications and their owned records.
#[derive(Clone, Debug)]
pub struct Reconciler {
    store: Store,
}

impl Reconciler {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// One repair pass in a single transaction. Failure rolls everything back
    /// and is reported through `errors` rather than returned.
    pub fn run_check(&self) -> ConsistencyStats {
        tracing::info!("starting consistency check");
        match self.store.with_tx(repair) {
            Ok(stats) => {
                tracing::info!(
                    orphaned_extraction = stats.orphaned_extraction,
                    orphaned_raw_source = stats.orphaned_raw_source,
                    incomplete_notifications = stats.incomplete_notifications,
                    orphaned_impacts = stats.orphaned_impacts,
                    fixed_issues = stats.fixed_issues,
                    "consistency check complete"
                );
                stats
            }
            Err(err) => {
                tracing::error!(error = %err, "consistency check failed; rolled back");
                ConsistencyStats {
                    errors: 1,
                    ..ConsistencyStats::default()
                }
            }
        }
    }
}

fn repair(tx: &Transaction<'_>) -> Result<ConsistencyStats> {
    let mut stats = ConsistencyStats::default();

    stats.orphaned_extraction = tx.execute(
        "DELETE FROM extractions
         WHERE id NOT IN (SELECT extraction_id FROM notifications)",
        [],
    )? as u32;

    stats.orphaned_raw_source = tx.execute(
        "DELETE FROM raw_sources
         WHERE id NOT IN (SELECT raw_source_id FROM notifications)",
        [],
    )? as u32;

    let incomplete: Vec<i64> = {
        let mut stmt = tx.prepare(
            "SELECT n.id FROM notifications n
             WHERE NOT EXISTS (SELECT 1 FROM raw_sources r WHERE r.id = n.raw_source_id)
                OR NOT EXISTS (SELECT 1 FROM extractions e WHERE e.id = n.extraction_id)
             ORDER BY n.id",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };
    for notification_id in incomplete {
        // An earlier cascade in this pass may already have removed it.
        match delete_notification(tx, notification_id) {
            Ok(()) => {
                tracing::warn!(notification_id, "removed incomplete notification");
                stats.incomplete_notifications += 1;
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
    }

    stats.orphaned_impacts = tx.execute(
        "DELETE FROM notification_impacts
         WHERE notification_id NOT IN (SELECT id FROM notifications)",
        [],
    )? as u32;

    stats.fixed_issues = stats.orphaned_extraction
        + stats.orphaned_raw_source
        + stats.incomplete_notifications
        + stats.orphaned_impacts;
    Ok(stats)
}
