//! Structured fact extraction from notification text by repeated LLM
//! completion and a majority vote on the extracted service name.

use crate::models::{NotificationType, Severity};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rig::client::{completion::CompletionClient, ProviderClient};
use rig::completion::Prompt;
use rig::providers::openai;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::future::IntoFuture;

const REQUIRED_KEYS: [&str; 6] = [
    "extracted_service_name",
    "event_start_time",
    "event_end_time",
    "notification_type",
    "event_summary",
    "severity_level",
];

const ALLOWED_TYPES: [&str; 7] = [
    "maintenance",
    "outage",
    "update",
    "alert",
    "info",
    "security",
    "unknown",
];

const ALLOWED_SEVERITIES: [&str; 6] = ["low", "medium", "high", "critical", "info", "unknown"];

const TYPE_KEYWORDS: &[(&str, NotificationType)] = &[
    ("maintenance", NotificationType::Maintenance),
    ("outage", NotificationType::Outage),
    ("incident", NotificationType::Outage),
    ("störung", NotificationType::Outage),
    ("degradation", NotificationType::Alert),
    ("alert", NotificationType::Alert),
    ("update", NotificationType::Info),
    ("informational", NotificationType::Info),
    ("info", NotificationType::Info),
    ("resolved", NotificationType::Info),
];

const SEVERITY_KEYWORDS: &[(&str, Severity)] = &[
    ("critical", Severity::Critical),
    ("high", Severity::High),
    ("medium", Severity::Medium),
    ("moderate", Severity::Medium),
    ("low", Severity::Low),
    ("informational", Severity::Info),
    ("info", Severity::Info),
];

/// Anything that turns a prompt into completion text.
pub trait TextCompletion: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String, String>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub api_key_env: String,
    pub temperature: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            temperature: 0.2,
        }
    }
}

/// OpenAI-backed completion through rig. Owns a single-threaded runtime so
/// callers on plain threads can stay synchronous.
pub struct RigCompletion {
    config: LlmConfig,
    runtime: tokio::runtime::Runtime,
}

impl RigCompletion {
    pub fn new(config: LlmConfig) -> Result<Self, String> {
        if config.provider.to_lowercase() != "openai" {
            return Err(format!("unsupported llm provider '{}'", config.provider));
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| format!("llm runtime error: {e}"))?;
        Ok(Self { config, runtime })
    }
}

impl TextCompletion for RigCompletion {
    fn complete(&self, prompt: &str) -> Result<String, String> {
        let client = if self.config.api_key_env == "OPENAI_API_KEY" {
            openai::Client::from_env()
        } else {
            let api_key = std::env::var(&self.config.api_key_env)
                .map_err(|_| format!("missing env var {}", self.config.api_key_env))?;
            openai::Client::new(&api_key).map_err(|e| format!("openai client error: {e}"))?
        };

        let agent = client
            .agent(&self.config.model)
            .preamble("You extract structured facts from service status notifications.")
            .temperature(self.config.temperature)
            .build();

        let fut = agent.prompt(prompt).into_future();
        let out: Result<String, _> = self.runtime.block_on(fut);
        out.map_err(|e| format!("llm prompt failed: {e}"))
    }
}

/// The six keys the model must return. Values stay as strings here and are
/// normalized by the `parse_*` helpers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExtractionPayload {
    pub extracted_service_name: Option<String>,
    /// ISO-8601 timestamp, UTC when no offset is given.
    pub event_start_time: Option<String>,
    pub event_end_time: Option<String>,
    /// One of maintenance, outage, update, alert, info, security, unknown.
    pub notification_type: Option<String>,
    pub event_summary: Option<String>,
    /// One of low, medium, high, critical, info, unknown.
    pub severity_level: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Vote {
    Valid {
        payload: ExtractionPayload,
        raw: String,
    },
    Error {
        message: String,
        raw: Option<String>,
    },
}

impl Vote {
    pub fn is_valid(&self) -> bool {
        matches!(self, Vote::Valid { .. })
    }

    pub fn raw(&self) -> Option<&str> {
        match self {
            Vote::Valid { raw, .. } => Some(raw),
            Vote::Error { raw, .. } => raw.as_deref(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExtractionOutcome {
    pub accepted: Vote,
    pub votes: Vec<Vote>,
}

impl ExtractionOutcome {
    pub fn is_error(&self) -> bool {
        !self.accepted.is_valid()
    }

    pub fn payload(&self) -> Option<&ExtractionPayload> {
        match &self.accepted {
            Vote::Valid { payload, .. } => Some(payload),
            Vote::Error { .. } => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.accepted {
            Vote::Error { message, .. } => Some(message),
            Vote::Valid { .. } => None,
        }
    }

    pub fn raw_response(&self) -> Option<&str> {
        self.accepted.raw()
    }
}

pub fn build_prompt(subject: &str, body: &str, known_service_names: &[String]) -> String {
    let schema = serde_json::to_string_pretty(&schemars::schema_for!(ExtractionPayload))
        .unwrap_or_default();
    let known = if known_service_names.is_empty() {
        "(none registered)".to_string()
    } else {
        known_service_names.join(", ")
    };
    format!(
        "Analyze the service status notification below and return JSON only.\n\
         Return exactly these keys: {keys}.\n\
         - notification_type: one of {types}\n\
         - severity_level: one of {severities}\n\
         - event_start_time / event_end_time: ISO-8601, UTC if no offset is known\n\
         - use null for any value the notification does not state\n\
         Prefer one of these known service names when it matches: {known}\n\
         JSON schema:\n{schema}\n\
         Subject: {subject}\n\
         Body:\n{body}",
        keys = REQUIRED_KEYS.join(", "),
        types = ALLOWED_TYPES.join(", "),
        severities = ALLOWED_SEVERITIES.join(", "),
    )
}

/// Drops a surrounding markdown code fence, with or without a `json` tag.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parses and validates one completion result into a vote.
pub fn parse_vote(completion: Result<String, String>) -> Vote {
    let raw = match completion {
        Ok(raw) => raw,
        Err(message) => return Vote::Error { message, raw: None },
    };
    let value: serde_json::Value = match serde_json::from_str(strip_code_fences(&raw)) {
        Ok(value) => value,
        Err(e) => {
            return Vote::Error {
                message: format!("invalid llm json: {e}"),
                raw: Some(raw),
            }
        }
    };
    if let Err(message) = validate(&value) {
        return Vote::Error {
            message,
            raw: Some(raw),
        };
    }
    match serde_json::from_value::<ExtractionPayload>(value) {
        Ok(payload) => Vote::Valid { payload, raw },
        Err(e) => Vote::Error {
            message: format!("invalid llm payload: {e}"),
            raw: Some(raw),
        },
    }
}

fn validate(value: &serde_json::Value) -> Result<(), String> {
    let object = value
        .as_object()
        .ok_or_else(|| "llm response is not a JSON object".to_string())?;
    let missing: Vec<&str> = REQUIRED_KEYS
        .iter()
        .copied()
        .filter(|key| !object.contains_key(*key))
        .collect();
    if !missing.is_empty() {
        return Err(format!("missing keys: {}", missing.join(", ")));
    }
    check_enum(object.get("notification_type"), &ALLOWED_TYPES, "notification_type")?;
    check_enum(object.get("severity_level"), &ALLOWED_SEVERITIES, "severity_level")?;
    Ok(())
}

fn check_enum(
    value: Option<&serde_json::Value>,
    allowed: &[&str],
    key: &str,
) -> Result<(), String> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(()),
        Some(serde_json::Value::String(s)) if allowed.contains(&s.to_lowercase().as_str()) => {
            Ok(())
        }
        Some(other) => Err(format!("invalid {key}: {other}")),
    }
}

pub struct VotingEngine<'a> {
    completion: &'a dyn TextCompletion,
    votes: usize,
    max_attempts: usize,
}

impl<'a> VotingEngine<'a> {
    pub fn new(completion: &'a dyn TextCompletion, votes: usize, max_attempts: usize) -> Self {
        Self {
            completion,
            votes: votes.max(1),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn extract(
        &self,
        body: &str,
        subject: &str,
        known_service_names: &[String],
    ) -> ExtractionOutcome {
        let prompt = build_prompt(subject, body, known_service_names);
        let votes: Vec<Vote> = (0..self.votes).map(|round| self.vote(round, &prompt)).collect();
        let accepted = majority(&votes).unwrap_or_else(|| {
            tracing::warn!(votes = votes.len(), "no valid extraction vote");
            votes[0].clone()
        });
        ExtractionOutcome { accepted, votes }
    }

    fn vote(&self, round: usize, prompt: &str) -> Vote {
        let mut attempt = 1;
        loop {
            let vote = parse_vote(self.completion.complete(prompt));
            if vote.is_valid() || attempt >= self.max_attempts {
                return vote;
            }
            if let Vote::Error { message, .. } = &vote {
                tracing::warn!(
                    round,
                    attempt,
                    error = %message,
                    "extraction attempt rejected; retrying"
                );
            }
            attempt += 1;
        }
    }
}

/// First valid vote carrying the most frequent service name; ties go to
/// the name seen first.
fn majority(votes: &[Vote]) -> Option<Vote> {
    let mut tally: Vec<(Option<&str>, usize)> = Vec::new();
    for vote in votes {
        if let Vote::Valid { payload, .. } = vote {
            let name = payload.extracted_service_name.as_deref();
            match tally.iter_mut().find(|(seen, _)| *seen == name) {
                Some((_, count)) => *count += 1,
                None => tally.push((name, 1)),
            }
        }
    }
    let mut winner: Option<(Option<&str>, usize)> = None;
    for (name, count) in tally {
        if winner.map_or(true, |(_, best)| count > best) {
            winner = Some((name, count));
        }
    }
    let (name, _) = winner?;
    votes
        .iter()
        .find(|vote| match vote {
            Vote::Valid { payload, .. } => payload.extracted_service_name.as_deref() == name,
            Vote::Error { .. } => false,
        })
        .cloned()
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%B %d, %Y %H:%M:%S",
    "%B %d, %Y %H:%M",
    "%d %B %Y %H:%M:%S",
    "%d %B %Y %H:%M",
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
];

/// Lenient timestamp parsing; naive values are taken as UTC.
pub fn parse_datetime(value: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = value?.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("null") {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S %z", "%Y-%m-%dT%H:%M:%S%z"] {
        if let Ok(dt) = DateTime::parse_from_str(raw, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    let naive = ["UTC", "GMT", "Z"]
        .iter()
        .find_map(|zone| raw.strip_suffix(zone))
        .unwrap_or(raw)
        .trim();
    for format in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, format) {
            return Some(dt.and_utc());
        }
    }
    if let Some(dt) = NaiveDate::parse_from_str(naive, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Some(dt.and_utc());
    }
    tracing::warn!(value = raw, "could not parse datetime");
    None
}

pub fn parse_notification_type(value: Option<&str>) -> NotificationType {
    let Some(normalized) = normalize(value) else {
        return NotificationType::Unknown;
    };
    if let Ok(exact) = normalized.parse() {
        return exact;
    }
    lookup(TYPE_KEYWORDS, &normalized).unwrap_or_else(|| {
        tracing::warn!(value = %normalized, "unknown notification type");
        NotificationType::Unknown
    })
}

pub fn parse_severity(value: Option<&str>) -> Severity {
    let Some(normalized) = normalize(value) else {
        return Severity::Unknown;
    };
    if let Ok(exact) = normalized.parse() {
        return exact;
    }
    lookup(SEVERITY_KEYWORDS, &normalized).unwrap_or_else(|| {
        tracing::warn!(value = %normalized, "unknown severity");
        Severity::Unknown
    })
}

fn normalize(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_lowercase())
}

fn lookup<T: Copy>(table: &[(&str, T)], value: &str) -> Option<T> {
    table
        .iter()
        .find(|(keyword, _)| value.contains(keyword))
        .map(|(_, mapped)| *mapped)
}


#[cfg(test)]
mod tests {
    use super::test_support::{payload_json, ScriptedCompletion};
    use super::*;

    fn service_of(outcome: &ExtractionOutcome) -> Option<&str> {
        outcome
            .payload()
            .and_then(|payload| payload.extracted_service_name.as_deref())
    }

    #[test]
    fn majority_service_name_wins() {
        let completion = ScriptedCompletion::new(vec![
            Ok(payload_json("AWS", "outage", "first")),
            Ok(payload_json("Azure", "outage", "second")),
            Ok(payload_json("AWS", "outage", "third")),
        ]);
        let outcome = VotingEngine::new(&completion, 3, 2).extract("body", "subject", &[]);

        assert!(!outcome.is_error());
        assert_eq!(service_of(&outcome), Some("AWS"));
        assert_eq!(
            outcome.payload().and_then(|p| p.event_summary.as_deref()),
            Some("first")
        );
        assert_eq!(outcome.votes.len(), 3);
        assert_eq!(completion.calls(), 3);
    }

    #[test]
    fn ties_go_to_first_seen_name() {
        let completion = ScriptedCompletion::new(vec![
            Ok(payload_json("GitHub", "alert", "a")),
            Ok(payload_json("Slack", "alert", "b")),
        ]);
        let outcome = VotingEngine::new(&completion, 2, 1).extract("body", "subject", &[]);
        assert_eq!(service_of(&outcome), Some("GitHub"));
    }

    #[test]
    fn invalid_votes_fall_back_to_first_raw_vote() {
        let completion = ScriptedCompletion::new(vec![
            Ok("not json at all".into()),
            Err("rate limited".into()),
            Ok(r#"{"extracted_service_name":"AWS"}"#.into()),
        ]);
        let outcome = VotingEngine::new(&completion, 3, 1).extract("body", "subject", &[]);

        assert!(outcome.is_error());
        assert_eq!(outcome.raw_response(), Some("not json at all"));
        assert!(outcome
            .error_message()
            .is_some_and(|message| message.starts_with("invalid llm json")));
        assert!(outcome.votes.iter().all(|vote| !vote.is_valid()));
    }

    #[test]
    fn invalid_attempt_is_retried() {
        let completion = ScriptedCompletion::new(vec![
            Ok(r#"{"extracted_service_name":"AWS","notification_type":"sideways"}"#.into()),
            Ok(payload_json("AWS", "maintenance", "window")),
        ]);
        let outcome = VotingEngine::new(&completion, 1, 2).extract("body", "subject", &[]);
        assert!(!outcome.is_error());
        assert_eq!(completion.calls(), 2);
    }

    #[test]
    fn retries_stop_at_max_attempts() {
        let completion = ScriptedCompletion::new(vec![Err("timeout".into())]);
        let outcome = VotingEngine::new(&completion, 3, 2).extract("body", "subject", &[]);
        assert!(outcome.is_error());
        assert_eq!(completion.calls(), 6);
        assert_eq!(outcome.error_message(), Some("timeout"));
    }

    #[test]
    fn validation_checks_keys_and_enums() {
        let fenced = format!("```json\n{}\n```", payload_json("AWS", "OUTAGE", "s"));
        assert!(parse_vote(Ok(fenced)).is_valid());

        let nulls = r#"{"extracted_service_name":null,"event_start_time":null,"event_end_time":null,
                        "notification_type":null,"event_summary":null,"severity_level":null}"#;
        assert!(parse_vote(Ok(nulls.into())).is_valid());

        let bad_severity = payload_json("AWS", "outage", "s").replace("\"high\"", "\"extreme\"");
        assert!(matches!(
            parse_vote(Ok(bad_severity)),
            Vote::Error { message, .. } if message.contains("severity_level")
        ));

        assert!(matches!(
            parse_vote(Ok("[1, 2]".into())),
            Vote::Error { message, .. } if message.contains("not a JSON object")
        ));
    }

    #[test]
    fn prompt_lists_keys_and_known_services() {
        let prompt = build_prompt("AWS outage", "EC2 is down", &["AWS".into(), "GCP".into()]);
        for key in REQUIRED_KEYS {
            assert!(prompt.contains(key), "{key}");
        }
        assert!(prompt.contains("AWS, GCP"));
        assert!(prompt.contains("EC2 is down"));
    }

    #[test]
    fn strip_code_fences_variants() {
        assert_eq!(strip_code_fences("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("  {} "), "{}");
    }

    #[test]
    fn datetime_parsing_is_lenient() {
        let expected: DateTime<Utc> = "2024-05-01T10:00:00Z".parse().expect("ts");
        for raw in [
            "2024-05-01T10:00:00Z",
            "2024-05-01T12:00:00+02:00",
            "2024-05-01T10:00:00",
            "2024-05-01 10:00:00 UTC",
            "2024-05-01 10:00",
            "Wed, 01 May 2024 10:00:00 +0000",
            "2024-05-01T10:00:00+0000",
            "2024-05-01T12:00:00+0200",
            "May 1, 2024 10:00 UTC",
            "May 01, 2024 10:00:00 GMT",
            "1 May 2024 10:00 UTC",
            "01 May 2024 10:00",
            "01.05.2024 10:00",
            "2024/05/01 10:00",
            "2024/05/01 10:00:00 UTC",
        ] {
            assert_eq!(parse_datetime(Some(raw)), Some(expected), "{raw}");
        }
        assert_eq!(
            parse_datetime(Some("2024-05-01")),
            Some("2024-05-01T00:00:00Z".parse().expect("midnight"))
        );
        assert_eq!(parse_datetime(Some("null")), None);
        assert_eq!(parse_datetime(Some("  ")), None);
        assert_eq!(parse_datetime(Some("next tuesday")), None);
        assert_eq!(parse_datetime(None), None);
    }

    #[test]
    fn notification_type_keywords() {
        let cases = [
            ("Outage", NotificationType::Outage),
            ("security", NotificationType::Security),
            ("Major Incident", NotificationType::Outage),
            ("Störung", NotificationType::Outage),
            ("performance degradation", NotificationType::Alert),
            ("Scheduled Maintenance", NotificationType::Maintenance),
            ("status update", NotificationType::Info),
            ("Resolved", NotificationType::Info),
            ("", NotificationType::Unknown),
            ("newsletter", NotificationType::Unknown),
        ];
        for (raw, expected) in cases {
            assert_eq!(parse_notification_type(Some(raw)), expected, "{raw}");
        }
        assert_eq!(parse_notification_type(None), NotificationType::Unknown);
    }

    #[test]
    fn severity_keywords() {
        assert_eq!(parse_severity(Some("HIGH")), Severity::High);
        assert_eq!(parse_severity(Some("moderate")), Severity::Medium);
        assert_eq!(parse_severity(Some("informational")), Severity::Info);
        assert_eq!(parse_severity(Some("very critical")), Severity::Critical);
        assert_eq!(parse_severity(Some("meh")), Severity::Unknown);
        assert_eq!(parse_severity(None), Severity::Unknown);
    }
}
