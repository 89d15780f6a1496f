//! Notification lifecycle: aggregate creation, extraction-driven status
//! transitions, administrative overrides and the cascading delete.

use crate::error::{is_constraint_violation, Conflict, Error, Result};
use crate::models::{
    ExtractionRecord, Notification, NotificationDetail, NotificationStatus, NotificationType,
    Pagination, ProcessingStatus, RawSource, Severity,
};
use crate::store::Store;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Summary keywords that turn an `update`/`info` notification into `resolved`.
const RESOLUTION_KEYWORDS: &[&str] = &["resolved", "fixed", "restored", "completed", "normal"];

#[derive(Clone, Debug)]
pub struct NewNotification {
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub external_message_id: String,
    pub sender: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
}

/// Fields written by [`NotificationLifecycle::apply_extraction`].
#[derive(Clone, Debug, Default)]
pub struct ExtractionUpdate {
    pub extracted_service_name: Option<String>,
    pub event_start_time: Option<DateTime<Utc>>,
    pub event_end_time: Option<DateTime<Utc>>,
    pub notification_type: Option<NotificationType>,
    pub severity: Option<Severity>,
    pub summary: Option<String>,
    pub raw_response: Option<String>,
    pub processing_status: ProcessingStatus,
    /// Explicit business status; takes precedence over every mapping rule.
    pub notification_status: Option<NotificationStatus>,
}

#[derive(Clone, Debug, Default)]
pub struct NotificationPatch {
    pub title: Option<String>,
    pub status: Option<NotificationStatus>,
    pub service_name: Option<String>,
    pub severity: Option<Severity>,
}

impl NotificationPatch {
    fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.status.is_none()
            && self.service_name.is_none()
            && self.severity.is_none()
    }
}

pub fn message_id_hash(external_message_id: &str) -> String {
    format!("{:x}", Sha256::digest(external_message_id.as_bytes()))
}

/// Business status for a finished extraction, by notification type.
pub fn status_for_completed(
    notification_type: Option<NotificationType>,
    summary: Option<&str>,
) -> NotificationStatus {
    match notification_type {
        Some(NotificationType::Outage) | Some(NotificationType::Alert) => {
            NotificationStatus::InProgress
        }
        Some(NotificationType::Maintenance) | Some(NotificationType::Security) => {
            NotificationStatus::ActionPending
        }
        Some(NotificationType::Update) | Some(NotificationType::Info) => {
            let summary = summary.unwrap_or_default().to_lowercase();
            if RESOLUTION_KEYWORDS.iter().any(|kw| summary.contains(kw)) {
                NotificationStatus::Resolved
            } else {
                NotificationStatus::New
            }
        }
        Some(NotificationType::Unknown) | None => NotificationStatus::New,
    }
}

/// Business status for an extraction that has not completed.
pub fn status_for_processing(processing_status: ProcessingStatus) -> NotificationStatus {
    match processing_status {
        ProcessingStatus::Error => NotificationStatus::ErrorProcessing,
        ProcessingStatus::ManualReview => NotificationStatus::PendingManualReview,
        ProcessingStatus::PendingValidation => NotificationStatus::PendingValidation,
        _ => NotificationStatus::New,
    }
}

/// Status precedence: explicit status, then type mapping for completed
/// extractions, then the processing-status table.
pub fn resolve_status(
    explicit: Option<NotificationStatus>,
    processing_status: ProcessingStatus,
    notification_type: Option<NotificationType>,
    summary: Option<&str>,
) -> NotificationStatus {
    if let Some(status) = explicit {
        return status;
    }
    if processing_status == ProcessingStatus::Completed {
        return status_for_completed(notification_type, summary);
    }
    status_for_processing(processing_status)
}

#[derive(Clone, Debug)]
pub struct NotificationLifecycle {
    store: Store,
}

impl NotificationLifecycle {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Inserts raw source, extraction shell and notification as one unit.
    pub fn create(&self, new: &NewNotification) -> Result<Notification> {
        let hash = message_id_hash(&new.external_message_id);
        let now = Utc::now();
        let has_html_body = new.body_html.as_deref().is_some_and(|h| !h.is_empty());

        let created = self.store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO raw_sources
                 (message_id_hash, subject, sender, received_at, body_text, body_html, has_html_body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    hash,
                    new.subject,
                    new.sender,
                    new.received_at,
                    new.body_text,
                    new.body_html,
                    has_html_body,
                    now,
                ],
            )
            .map_err(|err| {
                if is_constraint_violation(&err) {
                    Error::Conflict(Conflict::Duplicate(format!("raw source {hash}")))
                } else {
                    Error::from(err)
                }
            })?;
            let raw_source_id = tx.last_insert_rowid();

            tx.execute(
                "INSERT INTO extractions (processing_status, created_at, updated_at)
                 VALUES (?1, ?2, ?2)",
                params![ProcessingStatus::Unprocessed, now],
            )?;
            let extraction_id = tx.last_insert_rowid();

            tx.execute(
                "INSERT INTO notifications
                 (title, status, raw_source_id, extraction_id, last_checked_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?5)",
                params![
                    new.subject,
                    NotificationStatus::New,
                    raw_source_id,
                    extraction_id,
                    now,
                ],
            )?;
            let id = tx.last_insert_rowid();
            load_notification(tx, id)?.ok_or_else(|| Error::not_found("notification", id))
        });

        match &created {
            Ok(notification) => tracing::info!(
                notification_id = notification.id,
                raw_source_id = notification.raw_source_id,
                extraction_id = notification.extraction_id,
                hash = %hash,
                "created notification"
            ),
            Err(err) if err.is_duplicate() => tracing::warn!(
                external_message_id = %new.external_message_id,
                "message already captured"
            ),
            Err(err) => tracing::error!(
                external_message_id = %new.external_message_id,
                error = %err,
                "failed to create notification"
            ),
        }
        created
    }

    pub fn find_by_external_message_id(
        &self,
        external_message_id: &str,
    ) -> Result<Option<Notification>> {
        let conn = self.store.connection()?;
        let sql = format!(
            "SELECT {} FROM notifications
             WHERE raw_source_id = (SELECT id FROM raw_sources WHERE message_id_hash = ?1)",
            Notification::COLUMNS
        );
        Ok(conn
            .query_row(
                &sql,
                params![message_id_hash(external_message_id)],
                Notification::from_row,
            )
            .optional()?)
    }

    pub fn get(&self, notification_id: i64) -> Result<Notification> {
        let conn = self.store.connection()?;
        load_notification(&conn, notification_id)?
            .ok_or_else(|| Error::not_found("notification", notification_id))
    }

    pub fn get_detail(&self, notification_id: i64) -> Result<NotificationDetail> {
        let conn = self.store.connection()?;
        let notification = load_notification(&conn, notification_id)?
            .ok_or_else(|| Error::not_found("notification", notification_id))?;
        Ok(NotificationDetail {
            raw_source: load_raw_source(&conn, notification.raw_source_id)?,
            extraction: load_extraction(&conn, notification.extraction_id)?,
            notification,
        })
    }

    /// Newest first.
    pub fn list(&self, page: Pagination) -> Result<Vec<Notification>> {
        let conn = self.store.connection()?;
        let sql = format!(
            "SELECT {} FROM notifications ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2",
            Notification::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![page.limit, page.skip], Notification::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Notifications whose extraction never ran, was cut off mid-run or awaits
    /// validation, oldest first.
    pub fn list_pending(&self, limit: u32) -> Result<Vec<Notification>> {
        let conn = self.store.connection()?;
        let sql = format!(
            "SELECT {} FROM notifications
             WHERE extraction_id IN (
                 SELECT id FROM extractions WHERE processing_status IN (?1, ?2, ?3)
             )
             ORDER BY created_at ASC, id ASC
             LIMIT ?4",
            Notification::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                ProcessingStatus::Unprocessed,
                ProcessingStatus::Processing,
                ProcessingStatus::PendingValidation,
                limit
            ],
            Notification::from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Writes extracted fields, clears any earlier error and recomputes the
    /// parent notification's status, all in one transaction.
    pub fn apply_extraction(
        &self,
        extraction_id: i64,
        update: &ExtractionUpdate,
    ) -> Result<ExtractionRecord> {
        self.store.with_tx(|tx| {
            ensure_extraction(tx, extraction_id)?;
            let now = Utc::now();
            tx.execute(
                "UPDATE extractions SET
                    extracted_service_name = ?2,
                    event_start_time = ?3,
                    event_end_time = ?4,
                    notification_type = ?5,
                    severity = ?6,
                    summary = ?7,
                    raw_response = ?8,
                    processing_status = ?9,
                    error_message = NULL,
                    updated_at = ?10
                 WHERE id = ?1",
                params![
                    extraction_id,
                    update.extracted_service_name,
                    update.event_start_time,
                    update.event_end_time,
                    update.notification_type,
                    update.severity,
                    update.summary,
                    update.raw_response,
                    update.processing_status,
                    now,
                ],
            )?;

            let status = resolve_status(
                update.notification_status,
                update.processing_status,
                update.notification_type,
                update.summary.as_deref(),
            );
            set_parent_status(tx, extraction_id, status, now)?;
            load_extraction(tx, extraction_id)?
                .ok_or_else(|| Error::not_found("extraction", extraction_id))
        })
    }

    /// Records a terminal extraction failure; the notification moves to
    /// `error_processing`.
    pub fn mark_extraction_failed(
        &self,
        extraction_id: i64,
        error_message: &str,
        raw_response: Option<&str>,
    ) -> Result<ExtractionRecord> {
        self.transition(
            extraction_id,
            ProcessingStatus::Error,
            Some(error_message),
            raw_response,
        )
    }

    /// Moves the extraction to `status` without touching extracted fields.
    pub fn set_processing_status(
        &self,
        extraction_id: i64,
        status: ProcessingStatus,
        message: Option<&str>,
    ) -> Result<ExtractionRecord> {
        self.transition(extraction_id, status, message, None)
    }

    fn transition(
        &self,
        extraction_id: i64,
        status: ProcessingStatus,
        message: Option<&str>,
        raw_response: Option<&str>,
    ) -> Result<ExtractionRecord> {
        self.store.with_tx(|tx| {
            ensure_extraction(tx, extraction_id)?;
            let now = Utc::now();
            tx.execute(
                "UPDATE extractions SET
                    processing_status = ?2,
                    error_message = ?3,
                    raw_response = COALESCE(?4, raw_response),
                    updated_at = ?5
                 WHERE id = ?1",
                params![extraction_id, status, message, raw_response, now],
            )?;
            set_parent_status(tx, extraction_id, status_for_processing(status), now)?;
            load_extraction(tx, extraction_id)?
                .ok_or_else(|| Error::not_found("extraction", extraction_id))
        })
    }

    /// Deletes the notification with all of its downtime side effects.
    pub fn delete(&self, notification_id: i64) -> Result<()> {
        self.store.with_tx(|tx| delete_notification(tx, notification_id))?;
        tracing::info!(notification_id, "deleted notification");
        Ok(())
    }

    /// Administrative override; never re-runs the status mapping.
    pub fn update(&self, notification_id: i64, patch: &NotificationPatch) -> Result<Notification> {
        self.store.with_tx(|tx| {
            let notification = load_notification(tx, notification_id)?
                .ok_or_else(|| Error::not_found("notification", notification_id))?;
            if patch.is_empty() {
                return Ok(notification);
            }

            let now = Utc::now();
            tx.execute(
                "UPDATE notifications SET
                    title = COALESCE(?2, title),
                    status = COALESCE(?3, status),
                    updated_at = ?4
                 WHERE id = ?1",
                params![notification_id, patch.title, patch.status, now],
            )?;

            if patch.service_name.is_some() || patch.severity.is_some() {
                let touched = tx.execute(
                    "UPDATE extractions SET
                        extracted_service_name = COALESCE(?2, extracted_service_name),
                        severity = COALESCE(?3, severity),
                        updated_at = ?4
                     WHERE id = ?1",
                    params![
                        notification.extraction_id,
                        patch.service_name,
                        patch.severity,
                        now
                    ],
                )?;
                if touched == 0 {
                    tracing::warn!(
                        notification_id,
                        extraction_id = notification.extraction_id,
                        "extraction record missing; override applied to notification only"
                    );
                }
            }

            load_notification(tx, notification_id)?
                .ok_or_else(|| Error::not_found("notification", notification_id))
        })
    }
}

pub(crate) fn load_notification(conn: &Connection, id: i64) -> Result<Option<Notification>> {
    let sql = format!("SELECT {} FROM notifications WHERE id = ?1", Notification::COLUMNS);
    Ok(conn
        .query_row(&sql, params![id], Notification::from_row)
        .optional()?)
}

pub(crate) fn load_extraction(conn: &Connection, id: i64) -> Result<Option<ExtractionRecord>> {
    let sql = format!("SELECT {} FROM extractions WHERE id = ?1", ExtractionRecord::COLUMNS);
    Ok(conn
        .query_row(&sql, params![id], ExtractionRecord::from_row)
        .optional()?)
}

pub(crate) fn load_raw_source(conn: &Connection, id: i64) -> Result<Option<RawSource>> {
    let sql = format!("SELECT {} FROM raw_sources WHERE id = ?1", RawSource::COLUMNS);
    Ok(conn
        .query_row(&sql, params![id], RawSource::from_row)
        .optional()?)
}

fn ensure_extraction(conn: &Connection, extraction_id: i64) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM extractions WHERE id = ?1)",
        params![extraction_id],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(Error::not_found("extraction", extraction_id))
    }
}

fn set_parent_status(
    conn: &Connection,
    extraction_id: i64,
    status: NotificationStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE notifications SET status = ?2, last_checked_at = ?3, updated_at = ?3
         WHERE extraction_id = ?1",
        params![extraction_id, status, now],
    )?;
    if updated == 0 {
        tracing::warn!(extraction_id, "no parent notification for extraction");
    } else {
        tracing::info!(extraction_id, status = %status, "notification status updated");
    }
    Ok(())
}

/// Full delete path, run inside the caller's transaction. Shared with the
/// reconciler so repairs get the same downtime handling.
pub(crate) fn delete_notification(conn: &Connection, notification_id: i64) -> Result<()> {
    if load_notification(conn, notification_id)?.is_none() {
        return Err(Error::not_found("notification", notification_id));
    }
    let mut visited = HashSet::new();
    cascade_delete(conn, notification_id, &mut visited)
}

fn cascade_delete(
    conn: &Connection,
    notification_id: i64,
    visited: &mut HashSet<i64>,
) -> Result<()> {
    if !visited.insert(notification_id) {
        return Ok(());
    }
    let Some(notification) = load_notification(conn, notification_id)? else {
        return Ok(());
    };

    // Events this notification started go away, together with whatever closed them.
    let started: Vec<(i64, Option<i64>)> = {
        let mut stmt = conn.prepare(
            "SELECT id, end_notification_id FROM downtime_events WHERE start_notification_id = ?1",
        )?;
        let rows = stmt.query_map(params![notification_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };
    for (event_id, end_notification_id) in started {
        conn.execute("DELETE FROM downtime_events WHERE id = ?1", params![event_id])?;
        tracing::info!(notification_id, event_id, "deleted downtime event started by notification");
        if let Some(end_id) = end_notification_id.filter(|end_id| *end_id != notification_id) {
            cascade_delete(conn, end_id, visited)?;
        }
    }

    let reopened = conn.execute(
        "UPDATE downtime_events SET end_notification_id = NULL, end_time = NULL
         WHERE end_notification_id = ?1",
        params![notification_id],
    )?;
    if reopened > 0 {
        tracing::info!(notification_id, reopened, "reopened downtime events");
    }

    conn.execute(
        "DELETE FROM notification_impacts WHERE notification_id = ?1",
        params![notification_id],
    )?;
    conn.execute("DELETE FROM notifications WHERE id = ?1", params![notification_id])?;
    conn.execute(
        "DELETE FROM raw_sources WHERE id = ?1",
        params![notification.raw_source_id],
    )?;
    conn.execute(
        "DELETE FROM extractions WHERE id = ?1",
        params![notification.extraction_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downtime::DowntimeTracker;
    use crate::store::test_support::{count, open_store};
    use chrono::Duration;

    fn new_notification(id: &str) -> NewNotification {
        NewNotification {
            subject: format!("Subject {id}"),
            received_at: Utc::now(),
            external_message_id: id.to_string(),
            sender: Some("status@cloudprovider.com".into()),
            body_text: Some("Service degraded".into()),
            body_html: None,
        }
    }

    fn service(store: &Store, name: &str) -> i64 {
        let conn = store.connection().expect("conn");
        conn.execute("INSERT INTO external_services (name) VALUES (?1)", params![name])
            .expect("insert service");
        conn.last_insert_rowid()
    }

    #[test]
    fn create_builds_full_aggregate() {
        let lifecycle = NotificationLifecycle::new(open_store("create"));
        let created = lifecycle.create(&new_notification("msg-1")).expect("create");

        assert_eq!(created.status, NotificationStatus::New);
        assert_eq!(created.title.as_deref(), Some("Subject msg-1"));

        let detail = lifecycle.get_detail(created.id).expect("detail");
        let raw = detail.raw_source.expect("raw source");
        assert_eq!(raw.message_id_hash, message_id_hash("msg-1"));
        assert!(!raw.has_html_body);
        let extraction = detail.extraction.expect("extraction");
        assert_eq!(extraction.processing_status, ProcessingStatus::Unprocessed);
    }

    #[test]
    fn second_intake_of_same_message_is_detected() {
        let lifecycle = NotificationLifecycle::new(open_store("idempotent"));
        let first = lifecycle.create(&new_notification("dup")).expect("create");

        let found = lifecycle
            .find_by_external_message_id("dup")
            .expect("lookup")
            .expect("found");
        assert_eq!(found.id, first.id);

        let err = lifecycle.create(&new_notification("dup")).expect_err("duplicate");
        assert!(err.is_duplicate());
        assert_eq!(count(lifecycle.store(), "notifications"), 1);
        assert_eq!(count(lifecycle.store(), "raw_sources"), 1);
        assert_eq!(count(lifecycle.store(), "extractions"), 1);
    }

    #[test]
    fn create_rolls_back_on_every_failure_point() {
        for table in ["extractions", "notifications"] {
            let store = open_store(&format!("atomic-{table}"));
            store
                .connection()
                .expect("conn")
                .execute_batch(&format!(
                    "CREATE TRIGGER fail_insert BEFORE INSERT ON {table}
                     BEGIN SELECT RAISE(ABORT, 'injected failure'); END;"
                ))
                .expect("trigger");

            let lifecycle = NotificationLifecycle::new(store.clone());
            let err = lifecycle.create(&new_notification("boom")).expect_err("fails");
            assert!(matches!(err, Error::Storage(_)), "{table}: {err}");

            assert_eq!(count(&store, "raw_sources"), 0, "{table}");
            assert_eq!(count(&store, "extractions"), 0, "{table}");
            assert_eq!(count(&store, "notifications"), 0, "{table}");
        }
    }

    #[test]
    fn completed_status_follows_notification_type() {
        let cases = [
            (NotificationType::Outage, "", NotificationStatus::InProgress),
            (NotificationType::Alert, "", NotificationStatus::InProgress),
            (NotificationType::Maintenance, "", NotificationStatus::ActionPending),
            (NotificationType::Security, "", NotificationStatus::ActionPending),
            (
                NotificationType::Update,
                "Service fully restored and operating normally",
                NotificationStatus::Resolved,
            ),
            (NotificationType::Info, "Issue FIXED", NotificationStatus::Resolved),
            (NotificationType::Update, "Still investigating", NotificationStatus::New),
            (NotificationType::Unknown, "resolved", NotificationStatus::New),
        ];
        for (notification_type, summary, expected) in cases {
            assert_eq!(
                resolve_status(
                    None,
                    ProcessingStatus::Completed,
                    Some(notification_type),
                    Some(summary),
                ),
                expected,
                "{notification_type} / {summary}"
            );
        }
    }

    #[test]
    fn incomplete_processing_maps_by_status() {
        assert_eq!(
            resolve_status(None, ProcessingStatus::Error, Some(NotificationType::Outage), None),
            NotificationStatus::ErrorProcessing
        );
        assert_eq!(
            status_for_processing(ProcessingStatus::ManualReview),
            NotificationStatus::PendingManualReview
        );
        assert_eq!(
            status_for_processing(ProcessingStatus::PendingValidation),
            NotificationStatus::PendingValidation
        );
        assert_eq!(
            status_for_processing(ProcessingStatus::Processing),
            NotificationStatus::New
        );
        assert_eq!(
            resolve_status(
                Some(NotificationStatus::Archived),
                ProcessingStatus::Completed,
                Some(NotificationType::Outage),
                None
            ),
            NotificationStatus::Archived
        );
    }

    #[test]
    fn apply_extraction_updates_both_records() {
        let lifecycle = NotificationLifecycle::new(open_store("apply"));
        let created = lifecycle.create(&new_notification("apply")).expect("create");
        lifecycle
            .mark_extraction_failed(created.extraction_id, "earlier failure", None)
            .expect("fail first");

        let record = lifecycle
            .apply_extraction(
                created.extraction_id,
                &ExtractionUpdate {
                    extracted_service_name: Some("AWS".into()),
                    notification_type: Some(NotificationType::Update),
                    severity: Some(Severity::Low),
                    summary: Some("Service fully restored and operating normally".into()),
                    raw_response: Some("{}".into()),
                    processing_status: ProcessingStatus::Completed,
                    ..ExtractionUpdate::default()
                },
            )
            .expect("apply");

        assert_eq!(record.processing_status, ProcessingStatus::Completed);
        assert_eq!(record.error_message, None);
        assert_eq!(record.extracted_service_name.as_deref(), Some("AWS"));

        let notification = lifecycle.get(created.id).expect("get");
        assert_eq!(notification.status, NotificationStatus::Resolved);
        assert!(notification.last_checked_at >= created.last_checked_at);
    }

    #[test]
    fn apply_extraction_on_missing_record_is_not_found() {
        let lifecycle = NotificationLifecycle::new(open_store("apply-missing"));
        let err = lifecycle
            .apply_extraction(999, &ExtractionUpdate::default())
            .expect_err("missing");
        assert!(err.is_not_found());
    }

    #[test]
    fn failure_and_manual_review_paths() {
        let lifecycle = NotificationLifecycle::new(open_store("failure"));
        let created = lifecycle.create(&new_notification("fail")).expect("create");

        let failed = lifecycle
            .mark_extraction_failed(created.extraction_id, "llm timeout", Some("not json"))
            .expect("fail");
        assert_eq!(failed.processing_status, ProcessingStatus::Error);
        assert_eq!(failed.error_message.as_deref(), Some("llm timeout"));
        assert_eq!(failed.raw_response.as_deref(), Some("not json"));
        assert_eq!(
            lifecycle.get(created.id).expect("get").status,
            NotificationStatus::ErrorProcessing
        );

        let review = lifecycle
            .set_processing_status(
                created.extraction_id,
                ProcessingStatus::ManualReview,
                Some("no completion provider configured"),
            )
            .expect("review");
        assert_eq!(review.raw_response.as_deref(), Some("not json"));
        assert_eq!(
            lifecycle.get(created.id).expect("get").status,
            NotificationStatus::PendingManualReview
        );
    }

    #[test]
    fn pending_lists_unfinished_extractions() {
        let lifecycle = NotificationLifecycle::new(open_store("pending"));
        let a = lifecycle.create(&new_notification("a")).expect("a");
        let b = lifecycle.create(&new_notification("b")).expect("b");
        let c = lifecycle.create(&new_notification("c")).expect("c");
        let d = lifecycle.create(&new_notification("d")).expect("d");
        lifecycle
            .set_processing_status(b.extraction_id, ProcessingStatus::PendingValidation, None)
            .expect("b");
        lifecycle
            .mark_extraction_failed(c.extraction_id, "x", None)
            .expect("c");
        lifecycle
            .set_processing_status(d.extraction_id, ProcessingStatus::Processing, None)
            .expect("d");

        let pending: Vec<i64> = lifecycle
            .list_pending(10)
            .expect("pending")
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(pending, vec![a.id, b.id, d.id]);

        let newest_first: Vec<i64> = lifecycle
            .list(Pagination { skip: 0, limit: 2 })
            .expect("list")
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(newest_first, vec![d.id, c.id]);
    }

    #[test]
    fn update_overrides_without_status_mapping() {
        let lifecycle = NotificationLifecycle::new(open_store("update"));
        let created = lifecycle.create(&new_notification("upd")).expect("create");

        let updated = lifecycle
            .update(
                created.id,
                &NotificationPatch {
                    title: Some("Renamed".into()),
                    status: Some(NotificationStatus::Archived),
                    service_name: Some("GitHub".into()),
                    severity: Some(Severity::Critical),
                },
            )
            .expect("update");
        assert_eq!(updated.title.as_deref(), Some("Renamed"));
        assert_eq!(updated.status, NotificationStatus::Archived);

        let extraction = lifecycle
            .get_detail(created.id)
            .expect("detail")
            .extraction
            .expect("extraction");
        assert_eq!(extraction.extracted_service_name.as_deref(), Some("GitHub"));
        assert_eq!(extraction.severity, Some(Severity::Critical));
        assert_eq!(extraction.processing_status, ProcessingStatus::Unprocessed);

        assert!(lifecycle
            .update(404, &NotificationPatch::default())
            .expect_err("missing")
            .is_not_found());
    }

    #[test]
    fn delete_removes_owned_records_and_impacts() {
        let store = open_store("delete");
        let lifecycle = NotificationLifecycle::new(store.clone());
        let created = lifecycle.create(&new_notification("del")).expect("create");
        store
            .connection()
            .expect("conn")
            .execute(
                "INSERT INTO notification_impacts (notification_id, internal_system_id, created_at)
                 VALUES (?1, 1, ?2)",
                params![created.id, Utc::now()],
            )
            .expect("impact");

        lifecycle.delete(created.id).expect("delete");
        assert_eq!(count(&store, "notifications"), 0);
        assert_eq!(count(&store, "raw_sources"), 0);
        assert_eq!(count(&store, "extractions"), 0);
        assert_eq!(count(&store, "notification_impacts"), 0);
        assert!(lifecycle.delete(created.id).expect_err("gone").is_not_found());
    }

    #[test]
    fn deleting_start_notification_cascades_to_closing_notification() {
        let store = open_store("delete-start");
        let lifecycle = NotificationLifecycle::new(store.clone());
        let tracker = DowntimeTracker::new(store.clone());
        let service_id = service(&store, "Cascade");
        let start = lifecycle.create(&new_notification("start")).expect("start");
        let end = lifecycle.create(&new_notification("end")).expect("end");
        let other = lifecycle.create(&new_notification("other")).expect("other");

        let t0 = Utc::now();
        let event = tracker
            .open_event(service_id, start.id, t0, None, None)
            .expect("open");
        tracker
            .close_event(event.id, end.id, t0 + Duration::minutes(10))
            .expect("close");

        lifecycle.delete(start.id).expect("delete");
        assert_eq!(count(&store, "downtime_events"), 0);
        assert!(lifecycle.get(end.id).expect_err("end removed").is_not_found());
        assert_eq!(lifecycle.get(other.id).expect("other stays").id, other.id);
        assert_eq!(count(&store, "raw_sources"), 1);
    }

    #[test]
    fn deleting_end_notification_reopens_event() {
        let store = open_store("delete-end");
        let lifecycle = NotificationLifecycle::new(store.clone());
        let tracker = DowntimeTracker::new(store.clone());
        let service_id = service(&store, "Reopen");
        let start = lifecycle.create(&new_notification("s")).expect("start");
        let end = lifecycle.create(&new_notification("e")).expect("end");

        let t0 = Utc::now();
        let event = tracker
            .open_event(service_id, start.id, t0, None, None)
            .expect("open");
        tracker
            .close_event(event.id, end.id, t0 + Duration::minutes(5))
            .expect("close");

        lifecycle.delete(end.id).expect("delete");
        let reopened = tracker
            .find_open_event(service_id)
            .expect("lookup")
            .expect("reopened");
        assert_eq!(reopened.id, event.id);
        assert_eq!(reopened.end_time, None);
        assert_eq!(reopened.end_notification_id, None);
        assert_eq!(lifecycle.get(start.id).expect("start stays").id, start.id);
    }

    #[test]
    fn mutual_references_do_not_loop() {
        let store = open_store("delete-cycle");
        let lifecycle = NotificationLifecycle::new(store.clone());
        let tracker = DowntimeTracker::new(store.clone());
        let first_service = service(&store, "First");
        let second_service = service(&store, "Second");
        let a = lifecycle.create(&new_notification("cycle-a")).expect("a");
        let b = lifecycle.create(&new_notification("cycle-b")).expect("b");

        let t0 = Utc::now();
        let e1 = tracker.open_event(first_service, a.id, t0, None, None).expect("e1");
        tracker.close_event(e1.id, b.id, t0).expect("close e1");
        let e2 = tracker.open_event(second_service, b.id, t0, None, None).expect("e2");
        tracker.close_event(e2.id, a.id, t0).expect("close e2");

        lifecycle.delete(a.id).expect("delete");
        assert_eq!(count(&store, "notifications"), 0);
        assert_eq!(count(&store, "downtime_events"), 0);
    }
}
