//! Engine configuration.
//!
//! Every field has a default; [`EngineConfig::from_env`] overlays the
//! `EDGEWORKER_*` environment variables on top of those defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_CONTEXTS: usize = 64;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_HEAP_MEMORY_MAX_MB: usize = 128;
pub const DEFAULT_MAX_LOG_ENTRIES: usize = 1000;
pub const DEFAULT_MAX_REDIRECTS: usize = 20;
pub const DEFAULT_USER_AGENT: &str = concat!("edgeworker/", env!("CARGO_PKG_VERSION"));

// ── Fetch policy ─────────────────────────────────────────────────────────

/// A header injected into outbound requests whose host matches `host`.
///
/// `host` is either an exact hostname or a `*.suffix` wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRule {
    pub host: String,
    pub header: String,
    pub value: String,
}

impl HeaderRule {
    pub fn new(host: impl Into<String>, header: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            header: header.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        host_matches(&self.host, host)
    }
}

/// Policy applied to every outbound `fetch()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchPolicy {
    /// Hosts the worker may reach. Empty means any host.
    pub allowed_hosts: Vec<String>,
    pub header_rules: Vec<HeaderRule>,
    pub max_redirects: usize,
    pub connect_timeout_ms: u64,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            header_rules: Vec::new(),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            connect_timeout_ms: 10_000,
        }
    }
}

impl FetchPolicy {
    pub fn is_allowed(&self, host: &str) -> bool {
        self.allowed_hosts.is_empty() || self.allowed_hosts.iter().any(|pattern| host_matches(pattern, host))
    }

    pub fn headers_for<'a>(&'a self, host: &'a str) -> impl Iterator<Item = &'a HeaderRule> + 'a {
        self.header_rules.iter().filter(move |rule| rule.matches(host))
    }
}

fn host_matches(pattern: &str, host: &str) -> bool {
    let host = host.trim_end_matches('.');
    match pattern.strip_prefix("*.") {
        Some(suffix) => {
            host.len() > suffix.len()
                && host.ends_with(suffix)
                && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
        }
        None => pattern.eq_ignore_ascii_case(host),
    }
}

// ── Engine configuration ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of compiled sites kept resident before LRU eviction.
    pub max_contexts: usize,
    /// Default wall-clock deadline per request; `Env::timeout` overrides it.
    pub request_timeout_ms: u64,
    pub heap_memory_max_mb: usize,
    /// Console entries kept per request; later entries are dropped.
    pub max_log_entries: usize,
    pub user_agent: String,
    pub fetch: FetchPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_contexts: DEFAULT_MAX_CONTEXTS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            heap_memory_max_mb: DEFAULT_HEAP_MEMORY_MAX_MB,
            max_log_entries: DEFAULT_MAX_LOG_ENTRIES,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            fetch: FetchPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `EDGEWORKER_*` environment variables.
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(v) = parse_var(&lookup, "EDGEWORKER_MAX_CONTEXTS") {
            config.max_contexts = v;
        }
        if let Some(v) = parse_var(&lookup, "EDGEWORKER_REQUEST_TIMEOUT_MS") {
            config.request_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "EDGEWORKER_HEAP_MAX_MB") {
            config.heap_memory_max_mb = v;
        }
        if let Some(v) = parse_var(&lookup, "EDGEWORKER_MAX_LOG_ENTRIES") {
            config.max_log_entries = v;
        }
        if let Some(v) = lookup("EDGEWORKER_USER_AGENT") {
            config.user_agent = v;
        }
        if let Some(v) = lookup("EDGEWORKER_ALLOWED_HOSTS") {
            config.fetch.allowed_hosts = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        config
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heap_memory_max_bytes(&self) -> usize {
        self.heap_memory_max_mb * 1024 * 1024
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable configuration value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_contexts, 64);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.fetch.max_redirects, 20);
        assert!(config.fetch.is_allowed("example.com"));
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("EDGEWORKER_MAX_CONTEXTS", "4"),
            ("EDGEWORKER_REQUEST_TIMEOUT_MS", "250"),
            ("EDGEWORKER_HEAP_MAX_MB", "not-a-number"),
            ("EDGEWORKER_ALLOWED_HOSTS", "api.example.com, *.internal"),
        ]
        .into_iter()
        .collect();
        let config = EngineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.max_contexts, 4);
        assert_eq!(config.request_timeout_ms, 250);
        assert_eq!(config.heap_memory_max_mb, DEFAULT_HEAP_MEMORY_MAX_MB);
        assert_eq!(config.fetch.allowed_hosts, vec!["api.example.com", "*.internal"]);
    }

    #[test]
    fn host_patterns() {
        let policy = FetchPolicy {
            allowed_hosts: vec!["api.example.com".into(), "*.internal".into()],
            ..Default::default()
        };
        assert!(policy.is_allowed("api.example.com"));
        assert!(policy.is_allowed("db.internal"));
        assert!(!policy.is_allowed("internal"));
        assert!(!policy.is_allowed("evilinternal"));
        assert!(!policy.is_allowed("example.com"));
    }

    #[test]
    fn header_rules_filter_by_host() {
        let policy = FetchPolicy {
            header_rules: vec![
                HeaderRule::new("api.example.com", "authorization", "Bearer t"),
                HeaderRule::new("*.example.org", "x-team", "edge"),
            ],
            ..Default::default()
        };
        let names: Vec<_> = policy.headers_for("a.example.org").map(|r| r.header.as_str()).collect();
        assert_eq!(names, vec!["x-team"]);
        assert_eq!(policy.headers_for("api.example.com").count(), 1);
    }

    #[test]
    fn deserializes_partial_config() {
        let config: EngineConfig = serde_json::from_str(r#"{"max_contexts": 2, "fetch": {"max_redirects": 3}}"#).unwrap();
        assert_eq!(config.max_contexts, 2);
        assert_eq!(config.fetch.max_redirects, 3);
        assert_eq!(config.max_log_entries, DEFAULT_MAX_LOG_ENTRIES);
    }
}
