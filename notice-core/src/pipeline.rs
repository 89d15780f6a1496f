//! Per-message intake: dedup, pre-filter, aggregate creation, extraction,
//! impact resolution, contact notification and downtime bookkeeping.

use crate::catalog::Catalog;
use crate::downtime::{DowntimeSignal, DowntimeTracker};
use crate::error::{Error, Result};
use crate::extraction::{
    parse_datetime, parse_notification_type, parse_severity, TextCompletion, VotingEngine,
};
use crate::impact::{ImpactResolver, ImpactedSystem};
use crate::lifecycle::{ExtractionUpdate, NewNotification, NotificationLifecycle};
use crate::models::{Notification, NotificationStatus, ProcessingStatus};
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub const DEFAULT_SUBJECT_KEYWORDS: &[&str] = &[
    "maintenance",
    "outage",
    "störung",
    "wartung",
    "incident",
    "alert",
    "update",
    "degradation",
    "resolved",
];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxMessage {
    pub id: String,
    pub subject: String,
    pub from: String,
    /// Header date as sent; parsed leniently.
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub body_text: Option<String>,
    #[serde(default)]
    pub body_html: Option<String>,
}

pub trait MailboxSource {
    fn fetch_unread(&self) -> Result<Vec<MailboxMessage>>;

    /// Called once the pipeline has handled `message_id`.
    fn acknowledge(&self, _message_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Directory spool: one JSON-encoded [`MailboxMessage`] per `*.json` file.
/// Handled files are removed.
pub struct SpoolMailbox {
    dir: PathBuf,
    pending: Mutex<HashMap<String, PathBuf>>,
}

impl SpoolMailbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl MailboxSource for SpoolMailbox {
    fn fetch_unread(&self) -> Result<Vec<MailboxMessage>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            Error::ExternalCall(format!("read spool {}: {e}", self.dir.display()))
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut messages = Vec::with_capacity(paths.len());
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| Error::ExternalCall("spool index poisoned".into()))?;
        for path in paths {
            let parsed = std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|raw| {
                    serde_json::from_str::<MailboxMessage>(&raw).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(message) => {
                    pending.insert(message.id.clone(), path);
                    messages.push(message);
                }
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "skipping unreadable spool file"
                ),
            }
        }
        Ok(messages)
    }

    fn acknowledge(&self, message_id: &str) -> Result<()> {
        let path = self
            .pending
            .lock()
            .map_err(|_| Error::ExternalCall("spool index poisoned".into()))?
            .remove(message_id);
        if let Some(path) = path {
            std::fs::remove_file(&path).map_err(|e| {
                Error::ExternalCall(format!("remove {}: {e}", path.display()))
            })?;
        }
        Ok(())
    }
}

/// Sender and subject screening. All lists hold lowercase substrings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PreFilter {
    pub sender_allow: Vec<String>,
    pub sender_deny: Vec<String>,
    pub subject_keywords: Vec<String>,
}

impl PreFilter {
    pub fn with_default_keywords() -> Self {
        Self {
            subject_keywords: DEFAULT_SUBJECT_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Why the message is skipped, if it is.
    pub fn rejection(&self, sender: &str, subject: &str) -> Option<String> {
        let sender = sender.to_lowercase();
        let subject = subject.to_lowercase();

        if self.sender_deny.iter().any(|d| sender.contains(d.as_str())) {
            return Some(format!("sender '{sender}' is denied"));
        }
        if !self.sender_allow.is_empty()
            && !self.sender_allow.iter().any(|a| sender.contains(a.as_str()))
        {
            return Some(format!("sender '{sender}' is not allowed"));
        }
        if !self.subject_keywords.is_empty()
            && !self.subject_keywords.iter().any(|k| subject.contains(k.as_str()))
        {
            return Some("subject has no matching keyword".to_string());
        }
        None
    }
}

/// Plain text from an HTML body: tags dropped, block ends become line
/// breaks, the common entities decoded.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(start) = rest.find('<') {
        out.push_str(&rest[..start]);
        let Some(len) = rest[start..].find('>') else {
            rest = "";
            break;
        };
        let tag = rest[start + 1..start + len].trim().to_lowercase();
        rest = &rest[start + len + 1..];

        let name = tag
            .trim_start_matches('/')
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or_default()
            .to_string();
        if !tag.starts_with('/') && (name == "script" || name == "style" || name == "head") {
            let close = format!("</{name}");
            rest = match rest.to_ascii_lowercase().find(&close) {
                Some(at) => rest[at..].find('>').map_or("", |end| &rest[at + end + 1..]),
                None => "",
            };
            continue;
        }
        if matches!(
            name.as_str(),
            "br" | "p" | "div" | "li" | "tr" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "table"
        ) {
            out.push('\n');
        }
    }
    out.push_str(rest);

    let decoded = out
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    decoded
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Outbound notice to an impacted system's responsible contact.
pub trait ContactNotifier: Send + Sync {
    fn notify(&self, contact: &str, subject: &str, body: &str) -> std::result::Result<(), String>;
}

#[derive(Default, Clone)]
pub struct LogNotifier;

impl ContactNotifier for LogNotifier {
    fn notify(&self, contact: &str, subject: &str, body: &str) -> std::result::Result<(), String> {
        tracing::info!(contact, subject, body_len = body.len(), "contact notified");
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Skipped {
        reason: String,
    },
    Duplicate,
    Processed {
        notification_id: i64,
        status: NotificationStatus,
        impacted: Vec<ImpactedSystem>,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub fetched: u32,
    pub processed: u32,
    pub skipped: u32,
    pub duplicates: u32,
    pub failed: u32,
}

pub struct Pipeline {
    lifecycle: NotificationLifecycle,
    catalog: Catalog,
    impacts: ImpactResolver,
    downtime: DowntimeTracker,
    completion: Option<Arc<dyn TextCompletion>>,
    notifier: Arc<dyn ContactNotifier>,
    filter: PreFilter,
    votes: usize,
    max_attempts: usize,
}

impl Pipeline {
    pub fn new(store: Store, filter: PreFilter) -> Self {
        Self {
            lifecycle: NotificationLifecycle::new(store.clone()),
            catalog: Catalog::new(store.clone()),
            impacts: ImpactResolver::new(store.clone()),
            downtime: DowntimeTracker::new(store),
            completion: None,
            notifier: Arc::new(LogNotifier),
            filter,
            votes: 3,
            max_attempts: 2,
        }
    }

    pub fn with_completion(mut self, completion: Arc<dyn TextCompletion>) -> Self {
        self.completion = Some(completion);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ContactNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_voting(mut self, votes: usize, max_attempts: usize) -> Self {
        self.votes = votes;
        self.max_attempts = max_attempts;
        self
    }

    pub fn lifecycle(&self) -> &NotificationLifecycle {
        &self.lifecycle
    }

    pub fn ingest(&self, message: &MailboxMessage) -> Result<IngestOutcome> {
        if self
            .lifecycle
            .find_by_external_message_id(&message.id)?
            .is_some()
        {
            tracing::info!(message_id = %message.id, "message already ingested");
            return Ok(IngestOutcome::Duplicate);
        }

        if let Some(reason) = self.filter.rejection(&message.from, &message.subject) {
            tracing::debug!(message_id = %message.id, reason = %reason, "message skipped");
            return Ok(IngestOutcome::Skipped { reason });
        }

        let body_text = message
            .body_text
            .clone()
            .filter(|text| !text.trim().is_empty())
            .or_else(|| message.body_html.as_deref().map(html_to_text));
        let received_at = parse_datetime(message.date.as_deref()).unwrap_or_else(Utc::now);

        let notification = match self.lifecycle.create(&NewNotification {
            subject: message.subject.clone(),
            received_at,
            external_message_id: message.id.clone(),
            sender: Some(message.from.clone()),
            body_text: body_text.clone(),
            body_html: message.body_html.clone(),
        }) {
            Ok(notification) => notification,
            Err(err) if err.is_duplicate() => return Ok(IngestOutcome::Duplicate),
            Err(err) => return Err(err),
        };

        self.analyze(
            &notification,
            &message.subject,
            body_text.as_deref().unwrap_or_default(),
            received_at,
        )
    }

    /// Ingests every unread message in turn. A failed message is logged and
    /// left unacknowledged.
    pub fn run_once(&self, source: &dyn MailboxSource) -> Result<RunSummary> {
        let messages = source.fetch_unread()?;
        let mut summary = RunSummary {
            fetched: messages.len() as u32,
            ..RunSummary::default()
        };
        for message in &messages {
            match self.ingest(message) {
                Ok(outcome) => {
                    match outcome {
                        IngestOutcome::Processed { .. } => summary.processed += 1,
                        IngestOutcome::Skipped { .. } => summary.skipped += 1,
                        IngestOutcome::Duplicate => summary.duplicates += 1,
                    }
                    if let Err(err) = source.acknowledge(&message.id) {
                        tracing::warn!(
                            message_id = %message.id,
                            error = %err,
                            "acknowledge failed"
                        );
                    }
                }
                Err(err) => {
                    summary.failed += 1;
                    tracing::error!(message_id = %message.id, error = %err, "ingest failed");
                }
            }
        }
        if summary.fetched > 0 {
            tracing::info!(?summary, "intake pass complete");
        }
        Ok(summary)
    }

    /// Re-runs analysis for notifications left unprocessed or awaiting
    /// validation, oldest first.
    pub fn resume_pending(&self, limit: u32) -> Result<u32> {
        let mut resumed = 0;
        for notification in self.lifecycle.list_pending(limit)? {
            let detail = self.lifecycle.get_detail(notification.id)?;
            let Some(raw) = detail.raw_source else {
                tracing::warn!(
                    notification_id = notification.id,
                    "pending notification lost its raw source"
                );
                continue;
            };
            let text = raw
                .body_text
                .clone()
                .filter(|text| !text.trim().is_empty())
                .or_else(|| raw.body_html.as_deref().map(html_to_text))
                .unwrap_or_default();
            self.analyze(
                &notification,
                raw.subject.as_deref().unwrap_or_default(),
                &text,
                raw.received_at,
            )?;
            resumed += 1;
        }
        if resumed > 0 {
            tracing::info!(resumed, "resumed pending notifications");
        }
        Ok(resumed)
    }

    fn analyze(
        &self,
        notification: &Notification,
        subject: &str,
        text: &str,
        received_at: DateTime<Utc>,
    ) -> Result<IngestOutcome> {
        let extraction_id = notification.extraction_id;
        let processed = |status| IngestOutcome::Processed {
            notification_id: notification.id,
            status,
            impacted: Vec::new(),
        };

        let Some(completion) = self.completion.as_deref() else {
            self.lifecycle.set_processing_status(
                extraction_id,
                ProcessingStatus::ManualReview,
                Some("no completion provider configured"),
            )?;
            return Ok(processed(NotificationStatus::PendingManualReview));
        };
        if text.trim().is_empty() {
            self.lifecycle
                .mark_extraction_failed(extraction_id, "no text body for analysis", None)?;
            return Ok(processed(NotificationStatus::ErrorProcessing));
        }

        self.lifecycle
            .set_processing_status(extraction_id, ProcessingStatus::Processing, None)?;
        let known = self.catalog.external_service_names()?;
        let outcome = VotingEngine::new(completion, self.votes, self.max_attempts)
            .extract(text, subject, &known);

        let Some(payload) = outcome.payload() else {
            let message = format!(
                "llm error: {}",
                outcome.error_message().unwrap_or("no valid extraction")
            );
            self.lifecycle
                .mark_extraction_failed(extraction_id, &message, outcome.raw_response())?;
            tracing::warn!(
                notification_id = notification.id,
                error = %message,
                "extraction failed"
            );
            return Ok(processed(NotificationStatus::ErrorProcessing));
        };

        let service_name = payload
            .extracted_service_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        let update = ExtractionUpdate {
            extracted_service_name: service_name.clone(),
            event_start_time: parse_datetime(payload.event_start_time.as_deref()),
            event_end_time: parse_datetime(payload.event_end_time.as_deref()),
            notification_type: Some(parse_notification_type(payload.notification_type.as_deref())),
            severity: Some(parse_severity(payload.severity_level.as_deref())),
            summary: payload.event_summary.clone(),
            raw_response: outcome.raw_response().map(str::to_string),
            processing_status: ProcessingStatus::Completed,
            notification_status: None,
        };
        self.lifecycle.apply_extraction(extraction_id, &update)?;
        let status = self.lifecycle.get(notification.id)?.status;

        let impacted = self
            .impacts
            .resolve_impacts(notification.id, service_name.as_deref())?;
        for entry in &impacted {
            let Some(contact) = entry.system.responsible_contact.as_deref() else {
                continue;
            };
            let body = format!(
                "Service '{}' reported a {} notification affecting {}.\n\n{}",
                service_name.as_deref().unwrap_or("unknown"),
                update
                    .notification_type
                    .map(|t| t.as_str())
                    .unwrap_or("unknown"),
                entry.system.name,
                update.summary.as_deref().unwrap_or_default(),
            );
            if let Err(err) = self.notifier.notify(contact, subject, &body) {
                tracing::warn!(contact, error = %err, "contact notification failed");
            }
        }

        self.downtime.record_for_notification(&DowntimeSignal {
            notification_id: notification.id,
            service_name: service_name.as_deref(),
            notification_type: update.notification_type,
            status,
            event_start_time: update.event_start_time,
            event_end_time: update.event_end_time,
            received_at,
            severity: update.severity,
            summary: update.summary.as_deref(),
        })?;

        tracing::info!(
            notification_id = notification.id,
            status = %status,
            impacted = impacted.len(),
            "notification processed"
        );
        Ok(IngestOutcome::Processed {
            notification_id: notification.id,
            status,
            impacted,
        })
    }
}
