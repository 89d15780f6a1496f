use crate::extraction::LlmConfig;
use crate::pipeline::{PreFilter, DEFAULT_SUBJECT_KEYWORDS};
use std::path::PathBuf;
use std::time::Duration;

/// Runtime settings, read from the environment.
#[derive(Clone, Debug)]
pub struct Settings {
    pub db_path: PathBuf,
    pub bind_addr: String,
    pub email_spool_dir: Option<PathBuf>,
    pub email_check_interval: Duration,
    pub consistency_check_interval: Duration,
    pub consistency_check_initial_delay: Duration,
    pub filter: PreFilter,
    pub llm_votes: usize,
    pub llm_max_attempts: usize,
    /// `None` when no API key is available.
    pub llm: Option<LlmConfig>,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let seconds = |key: &str, default: u64| {
            Duration::from_secs(
                var(key)
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .unwrap_or(default),
            )
        };
        let count = |key: &str, default: usize| {
            var(key)
                .and_then(|v| v.trim().parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(default)
        };

        let subject_keywords = var("EMAIL_SUBJECT_KEYWORDS")
            .map(|v| split_list(&v))
            .unwrap_or_else(|| DEFAULT_SUBJECT_KEYWORDS.iter().map(|k| k.to_string()).collect());

        Self {
            db_path: var("NOTICEHUB_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("noticehub.db")),
            bind_addr: var("NOTICEHUB_BIND").unwrap_or_else(|| "0.0.0.0:5001".into()),
            email_spool_dir: var("EMAIL_SPOOL_DIR").map(PathBuf::from),
            email_check_interval: seconds("EMAIL_CHECK_INTERVAL_SECONDS", 60),
            consistency_check_interval: seconds("DB_CONSISTENCY_CHECK_INTERVAL_SECONDS", 3600),
            consistency_check_initial_delay: seconds(
                "DB_CONSISTENCY_CHECK_INITIAL_DELAY_SECONDS",
                60,
            ),
            filter: PreFilter {
                sender_allow: var("EMAIL_SENDER_DOMAIN_WHITELIST")
                    .map(|v| split_list(&v))
                    .unwrap_or_default(),
                sender_deny: var("EMAIL_SENDER_DOMAIN_BLACKLIST")
                    .map(|v| split_list(&v))
                    .unwrap_or_default(),
                subject_keywords,
            },
            llm_votes: count("LLM_VOTES", 3),
            llm_max_attempts: count("LLM_MAX_ATTEMPTS", 2),
            llm: llm_config(&var),
        }
    }
}

fn llm_config(var: &dyn Fn(&str) -> Option<String>) -> Option<LlmConfig> {
    let api_key_env = var("LLM_API_KEY_ENV").unwrap_or_else(|| "OPENAI_API_KEY".into());
    var(&api_key_env)?;

    Some(LlmConfig {
        provider: var("LLM_PROVIDER").unwrap_or_else(|| "openai".into()),
        model: var("LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".into()),
        api_key_env,
        temperature: var("LLM_TEMPERATURE")
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.2),
    })
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().to_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Settings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_without_environment() {
        let s = settings(&[]);
        assert_eq!(s.db_path, PathBuf::from("noticehub.db"));
        assert_eq!(s.bind_addr, "0.0.0.0:5001");
        assert_eq!(s.email_spool_dir, None);
        assert_eq!(s.email_check_interval, Duration::from_secs(60));
        assert_eq!(s.consistency_check_interval, Duration::from_secs(3600));
        assert_eq!(s.consistency_check_initial_delay, Duration::from_secs(60));
        assert_eq!(s.llm_votes, 3);
        assert_eq!(s.llm_max_attempts, 2);
        assert!(s.llm.is_none());
        assert!(s.filter.sender_allow.is_empty());
        assert!(s.filter.subject_keywords.contains(&"störung".to_string()));
    }

    #[test]
    fn lists_are_trimmed_and_lowercased() {
        let s = settings(&[
            ("EMAIL_SENDER_DOMAIN_WHITELIST", " CloudProvider.com, status.example.com ,"),
            ("EMAIL_SENDER_DOMAIN_BLACKLIST", "spam@example.net"),
            ("EMAIL_SUBJECT_KEYWORDS", "Outage,Maintenance"),
            ("EMAIL_CHECK_INTERVAL_SECONDS", "15"),
            ("LLM_VOTES", "0"),
        ]);
        assert_eq!(s.filter.sender_allow, vec!["cloudprovider.com", "status.example.com"]);
        assert_eq!(s.filter.sender_deny, vec!["spam@example.net"]);
        assert_eq!(s.filter.subject_keywords, vec!["outage", "maintenance"]);
        assert_eq!(s.email_check_interval, Duration::from_secs(15));
        assert_eq!(s.llm_votes, 3);
    }

    #[test]
    fn llm_block_requires_api_key() {
        let s = settings(&[
            ("LLM_API_KEY_ENV", "NOTICEHUB_TEST_KEY"),
            ("NOTICEHUB_TEST_KEY", "sk-test"),
            ("LLM_MODEL", "gpt-4o"),
            ("LLM_TEMPERATURE", "0.5"),
        ]);
        let llm = s.llm.expect("llm configured");
        assert_eq!(llm.model, "gpt-4o");
        assert_eq!(llm.provider, "openai");
        assert_eq!(llm.api_key_env, "NOTICEHUB_TEST_KEY");
        assert_eq!(llm.temperature, 0.5);

        assert!(settings(&[("LLM_API_KEY_ENV", "NOTICEHUB_TEST_KEY")]).llm.is_none());
    }
}
