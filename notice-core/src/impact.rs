use crate::catalog::{load_system, service_by_name};
use crate::error::{is_constraint_violation, Error, Result};
use crate::models::{InternalSystem, NotificationImpact};
use crate::store::Store;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// An impact row together with the system it points at.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImpactedSystem {
    pub impact: NotificationImpact,
    pub system: InternalSystem,
}

#[derive(Clone, Debug)]
pub struct ImpactResolver {
    store: Store,
}

impl ImpactResolver {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Records one impact per internal system depending on `service_name`.
    /// Unknown or missing names resolve to nothing.
    pub fn resolve_impacts(
        &self,
        notification_id: i64,
        service_name: Option<&str>,
    ) -> Result<Vec<ImpactedSystem>> {
        let Some(service_name) = service_name.filter(|name| !name.is_empty()) else {
            return Ok(Vec::new());
        };

        self.store.with_tx(|tx| {
            let Some(service) = service_by_name(tx, service_name)? else {
                tracing::info!(notification_id, service_name, "service not in catalog; no impacts");
                return Ok(Vec::new());
            };

            let system_ids: Vec<i64> = {
                let mut stmt = tx.prepare(
                    "SELECT internal_system_id FROM dependencies
                     WHERE external_service_id = ?1 ORDER BY internal_system_id",
                )?;
                let rows = stmt.query_map(params![service.id], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };

            let mut impacted = Vec::with_capacity(system_ids.len());
            for system_id in system_ids {
                let Some(system) = load_system(tx, system_id)? else {
                    tracing::warn!(system_id, "dependency points at missing internal system");
                    continue;
                };
                let impact = upsert_impact(tx, notification_id, system_id)?;
                impacted.push(ImpactedSystem { impact, system });
            }
            tracing::info!(
                notification_id,
                service = %service.name,
                impacted = impacted.len(),
                "resolved impacts"
            );
            Ok(impacted)
        })
    }

    pub fn impacts_for_notification(
        &self,
        notification_id: i64,
    ) -> Result<Vec<NotificationImpact>> {
        let conn = self.store.connection()?;
        let sql = format!(
            "SELECT {} FROM notification_impacts WHERE notification_id = ?1 ORDER BY id",
            NotificationImpact::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![notification_id], NotificationImpact::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn upsert_impact(
    conn: &Connection,
    notification_id: i64,
    internal_system_id: i64,
) -> Result<NotificationImpact> {
    match conn.execute(
        "INSERT INTO notification_impacts (notification_id, internal_system_id, created_at)
         VALUES (?1, ?2, ?3)",
        params![notification_id, internal_system_id, Utc::now()],
    ) {
        Ok(_) => {}
        Err(err) if is_constraint_violation(&err) => {}
        Err(err) => return Err(err.into()),
    }
    let sql = format!(
        "SELECT {} FROM notification_impacts WHERE notification_id = ?1 AND internal_system_id = ?2",
        NotificationImpact::COLUMNS
    );
    conn.query_row(
        &sql,
        params![notification_id, internal_system_id],
        NotificationImpact::from_row,
    )
    .optional()?
    .ok_or_else(|| Error::not_found("notification impact", notification_id))
}
