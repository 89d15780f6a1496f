use serde::{Deserialize, Serialize};

pub const SUBMISSION_V1: &str = "submission.v1";

/// A status notification posted over HTTP instead of arriving by mail.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalSubmissionV1 {
    pub schema: String,
    pub html: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    /// Caller-side identity used for dedup; generated when absent.
    #[serde(default)]
    pub original_id: Option<String>,
    /// Any common date layout; unparseable values fall back to the time of
    /// receipt during ingestion.
    #[serde(default)]
    pub received_at: Option<String>,
}

pub fn validate_submission_v1(submission: &CanonicalSubmissionV1) -> Result<(), String> {
    if submission.schema != SUBMISSION_V1 {
        return Err(format!("unsupported schema '{}'", submission.schema));
    }
    if submission.html.trim().is_empty() {
        return Err("html is required".into());
    }
    if let Some(id) = &submission.original_id {
        if id.trim().is_empty() {
            return Err("original_id must not be blank".into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission() -> CanonicalSubmissionV1 {
        CanonicalSubmissionV1 {
            schema: SUBMISSION_V1.into(),
            html: "<p>Scheduled maintenance</p>".into(),
            subject: Some("Maintenance".into()),
            sender: Some("status@cloudprovider.com".into()),
            original_id: Some("sub-1".into()),
            received_at: Some("2024-05-01T10:00:00Z".into()),
        }
    }

    #[test]
    fn validates_submission_v1() {
        assert!(validate_submission_v1(&submission()).is_ok());

        let minimal: CanonicalSubmissionV1 =
            serde_json::from_str(r#"{"schema":"submission.v1","html":"<b>x</b>"}"#).expect("parse");
        assert!(validate_submission_v1(&minimal).is_ok());
    }

    #[test]
    fn rejects_bad_submissions() {
        let mut wrong_schema = submission();
        wrong_schema.schema = "alert.v1".into();
        assert!(validate_submission_v1(&wrong_schema)
            .unwrap_err()
            .contains("unsupported schema"));

        let mut empty_html = submission();
        empty_html.html = "   ".into();
        assert_eq!(validate_submission_v1(&empty_html), Err("html is required".into()));

        let mut blank_id = submission();
        blank_id.original_id = Some(" ".into());
        assert!(validate_submission_v1(&blank_id).is_err());
    }

    #[test]
    fn received_at_is_not_validated() {
        let mut human = submission();
        human.received_at = Some("May 20, 2025 10:00 UTC".into());
        assert!(validate_submission_v1(&human).is_ok());

        let mut garbled = submission();
        garbled.received_at = Some("yesterday".into());
        assert!(validate_submission_v1(&garbled).is_ok());
    }
}
