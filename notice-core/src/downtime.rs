use crate::error::{Error, Result};
use crate::models::{DowntimeEvent, NotificationStatus, NotificationType, Pagination, Severity};
use crate::store::Store;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-service downtime aggregate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DowntimeStats {
    pub service_id: i64,
    pub service_name: String,
    pub average_minutes: f64,
    pub event_count: u32,
    pub ongoing_count: u32,
    pub has_ongoing: bool,
}

/// What the pipeline knows about a freshly extracted notification.
#[derive(Clone, Debug)]
pub struct DowntimeSignal<'a> {
    pub notification_id: i64,
    pub service_name: Option<&'a str>,
    pub notification_type: Option<NotificationType>,
    pub status: NotificationStatus,
    pub event_start_time: Option<DateTime<Utc>>,
    pub event_end_time: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    pub severity: Option<Severity>,
    pub summary: Option<&'a str>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DowntimeChange {
    Opened(DowntimeEvent),
    AlreadyOpen(DowntimeEvent),
    Closed(DowntimeEvent),
    Unchanged,
}

#[derive(Clone, Debug)]
pub struct DowntimeTracker {
    store: Store,
}

impl DowntimeTracker {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Opens an event for the service, or hands back the one already open.
    pub fn open_event(
        &self,
        service_id: i64,
        start_notification_id: i64,
        start_time: DateTime<Utc>,
        severity: Option<Severity>,
        summary: Option<&str>,
    ) -> Result<DowntimeEvent> {
        self.store.with_tx(|tx| {
            if let Some(open) = open_event_for(tx, service_id)? {
                tracing::info!(
                    service_id,
                    event_id = open.id,
                    "downtime event already open"
                );
                return Ok(open);
            }
            tx.execute(
                "INSERT INTO downtime_events
                 (external_service_id, start_notification_id, start_time, severity, summary, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    service_id,
                    start_notification_id,
                    start_time,
                    severity,
                    summary,
                    Utc::now()
                ],
            )?;
            let event_id = tx.last_insert_rowid();
            tracing::info!(service_id, event_id, start_notification_id, "opened downtime event");
            load_event(tx, event_id)?.ok_or_else(|| Error::not_found("downtime event", event_id))
        })
    }

    pub fn close_event(
        &self,
        event_id: i64,
        end_notification_id: i64,
        end_time: DateTime<Utc>,
    ) -> Result<DowntimeEvent> {
        self.store.with_tx(|tx| {
            let updated = tx.execute(
                "UPDATE downtime_events SET end_notification_id = ?2, end_time = ?3 WHERE id = ?1",
                params![event_id, end_notification_id, end_time],
            )?;
            if updated == 0 {
                return Err(Error::not_found("downtime event", event_id));
            }
            let event = load_event(tx, event_id)?
                .ok_or_else(|| Error::not_found("downtime event", event_id))?;
            tracing::info!(
                event_id,
                end_notification_id,
                duration_minutes = event.duration_minutes,
                "closed downtime event"
            );
            Ok(event)
        })
    }

    pub fn find_open_event(&self, service_id: i64) -> Result<Option<DowntimeEvent>> {
        let conn = self.store.connection()?;
        open_event_for(&conn, service_id)
    }

    pub fn get_event(&self, event_id: i64) -> Result<DowntimeEvent> {
        let conn = self.store.connection()?;
        load_event(&conn, event_id)?.ok_or_else(|| Error::not_found("downtime event", event_id))
    }

    /// Newest start first, optionally for one service.
    pub fn list_events(
        &self,
        service_id: Option<i64>,
        page: Pagination,
    ) -> Result<Vec<DowntimeEvent>> {
        let conn = self.store.connection()?;
        let sql = format!(
            "SELECT {} FROM downtime_events
             WHERE (?1 IS NULL OR external_service_id = ?1)
             ORDER BY start_time DESC, id DESC
             LIMIT ?2 OFFSET ?3",
            DowntimeEvent::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![service_id, page.limit, page.skip],
            DowntimeEvent::from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Average downtime per service; open events count up to `now`.
    pub fn compute_average_downtime(&self, now: DateTime<Utc>) -> Result<Vec<DowntimeStats>> {
        let conn = self.store.connection()?;
        let mut stmt = conn.prepare(
            "SELECT e.id, e.external_service_id, e.start_notification_id, e.end_notification_id,
                    e.start_time, e.end_time, e.severity, e.summary, s.name
             FROM downtime_events e
             JOIN external_services s ON s.id = e.external_service_id",
        )?;
        let rows = stmt.query_map([], |row| {
            let event = DowntimeEvent::from_row(row)?;
            let name: String = row.get(8)?;
            Ok((name, event))
        })?;

        // (service_id, total seconds, events, ongoing), keyed by name for ordering.
        let mut totals: BTreeMap<(String, i64), (i64, u32, u32)> = BTreeMap::new();
        for row in rows {
            let (name, event) = row?;
            let entry = totals
                .entry((name, event.external_service_id))
                .or_insert((0, 0, 0));
            entry.0 += event.elapsed(now).num_seconds();
            entry.1 += 1;
            if event.is_open() {
                entry.2 += 1;
            }
        }

        Ok(totals
            .into_iter()
            .map(|((service_name, service_id), (seconds, count, ongoing))| {
                let minutes = seconds as f64 / f64::from(count) / 60.0;
                DowntimeStats {
                    service_id,
                    service_name,
                    average_minutes: (minutes * 100.0).round() / 100.0,
                    event_count: count,
                    ongoing_count: ongoing,
                    has_ongoing: ongoing > 0,
                }
            })
            .collect())
    }

    /// Opens on outages and closes on resolutions for a known service.
    pub fn record_for_notification(&self, signal: &DowntimeSignal<'_>) -> Result<DowntimeChange> {
        let Some(service_name) = signal.service_name.filter(|name| !name.is_empty()) else {
            return Ok(DowntimeChange::Unchanged);
        };
        let conn = self.store.connection()?;
        let service_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM external_services WHERE name = ?1",
                params![service_name],
                |row| row.get(0),
            )
            .optional()?;
        drop(conn);
        let Some(service_id) = service_id else {
            tracing::debug!(service_name, "no external service; downtime untouched");
            return Ok(DowntimeChange::Unchanged);
        };

        if signal.notification_type == Some(NotificationType::Outage) {
            if let Some(open) = self.find_open_event(service_id)? {
                return Ok(DowntimeChange::AlreadyOpen(open));
            }
            let start = signal.event_start_time.unwrap_or(signal.received_at);
            let event = self.open_event(
                service_id,
                signal.notification_id,
                start,
                signal.severity,
                signal.summary,
            )?;
            return Ok(if event.start_notification_id == signal.notification_id {
                DowntimeChange::Opened(event)
            } else {
                DowntimeChange::AlreadyOpen(event)
            });
        }

        if signal.status == NotificationStatus::Resolved {
            if let Some(open) = self.find_open_event(service_id)? {
                let end = signal.event_end_time.unwrap_or(signal.received_at);
                let closed = self.close_event(open.id, signal.notification_id, end)?;
                return Ok(DowntimeChange::Closed(closed));
            }
        }
        Ok(DowntimeChange::Unchanged)
    }
}

fn open_event_for(conn: &Connection, service_id: i64) -> Result<Option<DowntimeEvent>> {
    let sql = format!(
        "SELECT {} FROM downtime_events
         WHERE external_service_id = ?1 AND end_time IS NULL
         ORDER BY start_time DESC, id DESC
         LIMIT 1",
        DowntimeEvent::COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![service_id], DowntimeEvent::from_row)
        .optional()?)
}

fn load_event(conn: &Connection, event_id: i64) -> Result<Option<DowntimeEvent>> {
    let sql = format!("SELECT {} FROM downtime_events WHERE id = ?1", DowntimeEvent::COLUMNS);
    Ok(conn
        .query_row(&sql, params![event_id], DowntimeEvent::from_row)
        .optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::open_store;
    use chrono::Duration;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().expect("timestamp")
    }

    fn service(store: &Store, name: &str) -> i64 {
        let conn = store.connection().expect("conn");
        conn.execute("INSERT INTO external_services (name) VALUES (?1)", params![name])
            .expect("service");
        conn.last_insert_rowid()
    }

    fn signal(notification_id: i64, service_name: &str) -> DowntimeSignal<'_> {
        DowntimeSignal {
            notification_id,
            service_name: Some(service_name),
            notification_type: None,
            status: NotificationStatus::New,
            event_start_time: None,
            event_end_time: None,
            received_at: at("2024-05-01T12:00:00Z"),
            severity: None,
            summary: None,
        }
    }

    #[test]
    fn closed_event_reports_whole_minutes() {
        let store = open_store("downtime-duration");
        let tracker = DowntimeTracker::new(store.clone());
        let service_id = service(&store, "Payments API");
        let start = at("2024-05-01T10:00:00Z");

        let event = tracker
            .open_event(service_id, 1, start, Some(Severity::High), Some("down"))
            .expect("open");
        assert!(event.is_open());
        assert_eq!(event.duration_minutes, None);

        let closed = tracker
            .close_event(event.id, 2, start + Duration::minutes(60))
            .expect("close");
        assert_eq!(closed.duration_minutes, Some(60));
        assert_eq!(closed.end_notification_id, Some(2));
        assert!(tracker.find_open_event(service_id).expect("lookup").is_none());
    }

    #[test]
    fn second_open_returns_existing_event() {
        let store = open_store("downtime-single-open");
        let tracker = DowntimeTracker::new(store.clone());
        let service_id = service(&store, "Queue");
        let t0 = at("2024-05-01T10:00:00Z");

        let first = tracker.open_event(service_id, 1, t0, None, None).expect("first");
        let second = tracker
            .open_event(service_id, 2, t0 + Duration::minutes(5), None, None)
            .expect("second");
        assert_eq!(first.id, second.id);
        let listed = tracker
            .list_events(Some(service_id), Pagination::default())
            .expect("list");
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn close_missing_event_is_not_found() {
        let tracker = DowntimeTracker::new(open_store("downtime-missing"));
        let err = tracker
            .close_event(42, 1, at("2024-05-01T10:00:00Z"))
            .expect_err("missing");
        assert!(err.is_not_found());
    }

    #[test]
    fn averages_include_ongoing_events_up_to_now() {
        let store = open_store("downtime-average");
        let tracker = DowntimeTracker::new(store.clone());
        let api = service(&store, "API");
        let cdn = service(&store, "CDN");
        service(&store, "Idle");
        let t0 = at("2024-05-01T10:00:00Z");

        let a = tracker.open_event(api, 1, t0, None, None).expect("a");
        tracker.close_event(a.id, 2, t0 + Duration::minutes(30)).expect("close a");
        let b = tracker
            .open_event(api, 3, t0 + Duration::hours(2), None, None)
            .expect("b");
        tracker
            .close_event(b.id, 4, t0 + Duration::hours(2) + Duration::minutes(90))
            .expect("close b");
        tracker.open_event(cdn, 5, t0, None, None).expect("ongoing");

        let stats = tracker
            .compute_average_downtime(t0 + Duration::minutes(45))
            .expect("stats");
        assert_eq!(stats.len(), 2);

        assert_eq!(stats[0].service_name, "API");
        assert_eq!(stats[0].service_id, api);
        assert_eq!(stats[0].event_count, 2);
        assert_eq!(stats[0].average_minutes, 60.0);
        assert!(!stats[0].has_ongoing);

        assert_eq!(stats[1].service_name, "CDN");
        assert_eq!(stats[1].average_minutes, 45.0);
        assert_eq!(stats[1].ongoing_count, 1);
        assert!(stats[1].has_ongoing);
    }

    #[test]
    fn average_is_rounded_to_two_decimals() {
        let store = open_store("downtime-rounding");
        let tracker = DowntimeTracker::new(store.clone());
        let svc = service(&store, "Search");
        let t0 = at("2024-05-01T10:00:00Z");
        let event = tracker.open_event(svc, 1, t0, None, None).expect("open");
        tracker
            .close_event(event.id, 2, t0 + Duration::seconds(100))
            .expect("close");

        let stats = tracker.compute_average_downtime(t0).expect("stats");
        assert_eq!(stats[0].average_minutes, 1.67);
    }

    #[test]
    fn list_is_newest_first_and_filterable() {
        let store = open_store("downtime-list");
        let tracker = DowntimeTracker::new(store.clone());
        let a = service(&store, "A");
        let b = service(&store, "B");
        let t0 = at("2024-05-01T10:00:00Z");
        let old = tracker.open_event(a, 1, t0, None, None).expect("old");
        tracker.close_event(old.id, 2, t0 + Duration::minutes(1)).expect("close");
        let new = tracker
            .open_event(a, 3, t0 + Duration::hours(1), None, None)
            .expect("new");
        tracker.open_event(b, 4, t0, None, None).expect("other");

        let ids: Vec<i64> = tracker
            .list_events(Some(a), Pagination::default())
            .expect("list")
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![new.id, old.id]);
        assert_eq!(tracker.list_events(None, Pagination::default()).expect("all").len(), 3);
        assert_eq!(
            tracker
                .list_events(None, Pagination { skip: 1, limit: 1 })
                .expect("page")
                .len(),
            1
        );
    }

    #[test]
    fn outage_opens_and_resolution_closes() {
        let store = open_store("downtime-signal");
        let tracker = DowntimeTracker::new(store.clone());
        let svc = service(&store, "Storage");

        let mut outage = signal(10, "Storage");
        outage.notification_type = Some(NotificationType::Outage);
        outage.status = NotificationStatus::InProgress;
        outage.event_start_time = Some(at("2024-05-01T09:30:00Z"));
        let opened = match tracker.record_for_notification(&outage).expect("open") {
            DowntimeChange::Opened(event) => event,
            other => panic!("expected open, got {other:?}"),
        };
        assert_eq!(opened.start_time, at("2024-05-01T09:30:00Z"));
        assert_eq!(opened.external_service_id, svc);

        let mut repeat = signal(11, "Storage");
        repeat.notification_type = Some(NotificationType::Outage);
        assert!(matches!(
            tracker.record_for_notification(&repeat).expect("repeat"),
            DowntimeChange::AlreadyOpen(event) if event.id == opened.id
        ));

        let mut resolved = signal(12, "Storage");
        resolved.notification_type = Some(NotificationType::Info);
        resolved.status = NotificationStatus::Resolved;
        let closed = match tracker.record_for_notification(&resolved).expect("close") {
            DowntimeChange::Closed(event) => event,
            other => panic!("expected close, got {other:?}"),
        };
        assert_eq!(closed.end_time, Some(at("2024-05-01T12:00:00Z")));
        assert_eq!(closed.duration_minutes, Some(150));
    }

    #[test]
    fn unknown_service_and_other_types_leave_events_alone() {
        let store = open_store("downtime-noop");
        let tracker = DowntimeTracker::new(store.clone());
        service(&store, "Known");

        let mut outage = signal(1, "Unknown Service");
        outage.notification_type = Some(NotificationType::Outage);
        assert_eq!(
            tracker.record_for_notification(&outage).expect("unknown"),
            DowntimeChange::Unchanged
        );

        let mut maintenance = signal(2, "Known");
        maintenance.notification_type = Some(NotificationType::Maintenance);
        maintenance.status = NotificationStatus::ActionPending;
        assert_eq!(
            tracker.record_for_notification(&maintenance).expect("maintenance"),
            DowntimeChange::Unchanged
        );

        let mut resolved = signal(3, "Known");
        resolved.status = NotificationStatus::Resolved;
        assert_eq!(
            tracker.record_for_notification(&resolved).expect("nothing open"),
            DowntimeChange::Unchanged
        );
    }
}
