use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Implements string conversion plus SQLite TEXT storage for a lowercase-tagged enum.
macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $tag:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $tag),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($tag => Ok($ty::$variant),)+
                    other => Err(format!("invalid {} '{}'", stringify!($ty), other)),
                }
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let s = value.as_str()?;
                s.parse().map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    #[default]
    Unprocessed,
    Pending,
    Processing,
    Completed,
    Error,
    PendingValidation,
    ManualReview,
}

text_enum!(ProcessingStatus {
    Unprocessed => "unprocessed",
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Error => "error",
    PendingValidation => "pending_validation",
    ManualReview => "manual_review",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Maintenance,
    Outage,
    Update,
    Alert,
    Info,
    Security,
    Unknown,
}

text_enum!(NotificationType {
    Maintenance => "maintenance",
    Outage => "outage",
    Update => "update",
    Alert => "alert",
    Info => "info",
    Security => "security",
    Unknown => "unknown",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
    Info,
    Unknown,
}

text_enum!(Severity {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
    Info => "info",
    Unknown => "unknown",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    New,
    Triaged,
    ActionPending,
    InProgress,
    Resolved,
    Archived,
    ErrorProcessing,
    PendingManualReview,
    PendingValidation,
}

text_enum!(NotificationStatus {
    New => "new",
    Triaged => "triaged",
    ActionPending => "action_pending",
    InProgress => "in_progress",
    Resolved => "resolved",
    Archived => "archived",
    ErrorProcessing => "error_processing",
    PendingManualReview => "pending_manual_review",
    PendingValidation => "pending_validation",
});

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSource {
    pub id: i64,
    pub message_id_hash: String,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub received_at: DateTime<Utc>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub has_html_body: bool,
    pub created_at: DateTime<Utc>,
}

impl RawSource {
    pub(crate) const COLUMNS: &'static str = "id, message_id_hash, subject, sender, received_at, \
         body_text, body_html, has_html_body, created_at";

    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            message_id_hash: row.get(1)?,
            subject: row.get(2)?,
            sender: row.get(3)?,
            received_at: row.get(4)?,
            body_text: row.get(5)?,
            body_html: row.get(6)?,
            has_html_body: row.get(7)?,
            created_at: row.get(8)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub id: i64,
    pub processing_status: ProcessingStatus,
    pub extracted_service_name: Option<String>,
    pub event_start_time: Option<DateTime<Utc>>,
    pub event_end_time: Option<DateTime<Utc>>,
    pub notification_type: Option<NotificationType>,
    pub severity: Option<Severity>,
    pub summary: Option<String>,
    pub raw_response: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExtractionRecord {
    pub(crate) const COLUMNS: &'static str = "id, processing_status, extracted_service_name, \
         event_start_time, event_end_time, notification_type, severity, summary, raw_response, \
         error_message, created_at, updated_at";

    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            processing_status: row.get(1)?,
            extracted_service_name: row.get(2)?,
            event_start_time: row.get(3)?,
            event_end_time: row.get(4)?,
            notification_type: row.get(5)?,
            severity: row.get(6)?,
            summary: row.get(7)?,
            raw_response: row.get(8)?,
            error_message: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub title: Option<String>,
    pub status: NotificationStatus,
    pub raw_source_id: i64,
    pub extraction_id: i64,
    pub last_checked_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Notification {
    pub(crate) const COLUMNS: &'static str = "id, title, status, raw_source_id, extraction_id, \
         last_checked_at, created_at, updated_at";

    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            status: row.get(2)?,
            raw_source_id: row.get(3)?,
            extraction_id: row.get(4)?,
            last_checked_at: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}

/// A notification together with whichever of its owned records still resolve.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotificationDetail {
    #[serde(flatten)]
    pub notification: Notification,
    pub raw_source: Option<RawSource>,
    pub extraction: Option<ExtractionRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalService {
    pub id: i64,
    pub name: String,
    pub provider: Option<String>,
    pub description: Option<String>,
}

impl ExternalService {
    pub(crate) const COLUMNS: &'static str = "id, name, provider, description";

    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            provider: row.get(2)?,
            description: row.get(3)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalSystem {
    pub id: i64,
    pub name: String,
    pub responsible_contact: Option<String>,
    pub description: Option<String>,
}

impl InternalSystem {
    pub(crate) const COLUMNS: &'static str = "id, name, responsible_contact, description";

    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            responsible_contact: row.get(2)?,
            description: row.get(3)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub id: i64,
    pub internal_system_id: i64,
    pub external_service_id: i64,
    pub description: Option<String>,
}

impl Dependency {
    pub(crate) const COLUMNS: &'static str =
        "id, internal_system_id, external_service_id, description";

    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            internal_system_id: row.get(1)?,
            external_service_id: row.get(2)?,
            description: row.get(3)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationImpact {
    pub id: i64,
    pub notification_id: i64,
    pub internal_system_id: i64,
    pub created_at: DateTime<Utc>,
}

impl NotificationImpact {
    pub(crate) const COLUMNS: &'static str =
        "id, notification_id, internal_system_id, created_at";

    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            notification_id: row.get(1)?,
            internal_system_id: row.get(2)?,
            created_at: row.get(3)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DowntimeEvent {
    pub id: i64,
    pub external_service_id: i64,
    pub start_notification_id: i64,
    pub end_notification_id: Option<i64>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub severity: Option<Severity>,
    pub summary: Option<String>,
    /// Whole minutes between start and end; absent while the event is open.
    pub duration_minutes: Option<i64>,
}

impl DowntimeEvent {
    pub(crate) const COLUMNS: &'static str = "id, external_service_id, start_notification_id, \
         end_notification_id, start_time, end_time, severity, summary";

    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let start_time: DateTime<Utc> = row.get(4)?;
        let end_time: Option<DateTime<Utc>> = row.get(5)?;
        Ok(Self {
            id: row.get(0)?,
            external_service_id: row.get(1)?,
            start_notification_id: row.get(2)?,
            end_notification_id: row.get(3)?,
            start_time,
            end_time,
            severity: row.get(6)?,
            summary: row.get(7)?,
            duration_minutes: end_time.map(|end| (end - start_time).num_minutes()),
        })
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Downtime so far: the closed duration, or `now - start` for an open event.
    pub fn elapsed(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.end_time.unwrap_or(now) - self.start_time
    }

    pub fn elapsed_minutes(&self, now: DateTime<Utc>) -> i64 {
        self.elapsed(now).num_minutes()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub skip: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { skip: 0, limit: 100 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_tags_match_serde_names() {
        for status in NotificationStatus::ALL {
            let json = serde_json::to_string(status).expect("serialize");
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(status.as_str().parse::<NotificationStatus>().as_ref(), Ok(status));
        }
        for status in ProcessingStatus::ALL {
            let json = serde_json::to_string(status).expect("serialize");
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!("sideways".parse::<Severity>().is_err());
        assert!("OUTAGE".parse::<NotificationType>().is_err());
    }

    #[test]
    fn open_event_elapsed_uses_now() {
        let start = "2024-05-01T10:00:00Z".parse::<DateTime<Utc>>().expect("start");
        let now = "2024-05-01T10:45:00Z".parse::<DateTime<Utc>>().expect("now");
        let event = DowntimeEvent {
            id: 1,
            external_service_id: 1,
            start_notification_id: 1,
            end_notification_id: None,
            start_time: start,
            end_time: None,
            severity: None,
            summary: None,
            duration_minutes: None,
        };
        assert!(event.is_open());
        assert_eq!(event.elapsed_minutes(now), 45);
    }
}
