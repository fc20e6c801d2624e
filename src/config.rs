//! Runtime options for the telemetry core
//!
//! There is no configuration file: embedders construct [`Options`] in
//! code (or start from [`Options::default`]) and hand it to `Sift::new`.
//! Defaults mirror the production deployment values.

use std::time::Duration;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ─────────────────────────────────────────────────────────────────────────────
// Runtime options
// ─────────────────────────────────────────────────────────────────────────────

/// Enumerated runtime options for the whole pipeline.
#[derive(Debug, Clone)]
pub struct Options {
    /// Channel identifier stamped on every outbound message.
    pub channel: String,

    /// Message envelope version (`ver` field).
    pub message_version: u32,

    /// Optional platform tag for the envelope (`platform` field).
    pub platform: Option<String>,

    /// Optional user agent family for the envelope (`userAgent` field).
    pub user_agent: Option<String>,

    /// Base URL of the quorum server (`/config`, `/incrquorum`, `/checkquorum`).
    pub quorum_base_url: String,

    /// URL returning `{ location: "de", … }` for the country provider.
    pub country_config_url: String,

    /// Base URL of the whitelist CDN (`update.json.gz`, `<version>/bloom_filter.gz`).
    pub whitelist_cdn_url: String,

    /// Country codes that may be reported as-is; everything else becomes `--`.
    pub allowed_countries: Vec<String>,

    /// How long observed request pairs accumulate before a batch is processed.
    pub token_buffer_interval: Duration,

    /// Interval between token send cycles.
    pub token_batch_interval: Duration,

    /// Interval between key send cycles.
    pub key_batch_interval: Duration,

    /// Interval between clean cycles.
    pub clean_interval: Duration,

    /// Entries per outbound token/key message.
    pub token_message_size: usize,

    /// Messages emitted per send cycle before the rest is re-enqueued.
    pub batch_limit: usize,

    /// Maximum tokens kept per key entry; larger sets are uniformly sampled.
    pub key_tokens_limit: usize,

    /// Minimum hit count before a single-site entry may be sent.
    pub min_count: u32,

    /// Entries younger than this never qualify through the count threshold.
    pub new_entry_min_age: Duration,

    /// Low-count entries older than this are discarded by the clean cycle.
    pub low_count_discard_age: Duration,

    /// Distinct first parties before a token lands on the block list.
    pub token_domain_count_threshold: usize,

    /// TTL of the quorum bucket assignment.
    pub quorum_config_ttl: Duration,

    /// Doublefetch response body cap.
    pub doublefetch_body_limit: usize,

    /// Doublefetch request timeout.
    pub doublefetch_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            channel: "ext".into(),
            message_version: 1,
            platform: None,
            user_agent: None,
            quorum_base_url: "https://quorum.example.invalid".into(),
            country_config_url: "https://config.example.invalid/location".into(),
            whitelist_cdn_url: "https://cdn.example.invalid/qswhitelist".into(),
            allowed_countries: default_country_allow_list(),
            token_buffer_interval: Duration::from_secs(10),
            token_batch_interval: Duration::from_secs(60),
            key_batch_interval: Duration::from_secs(60),
            clean_interval: Duration::from_secs(4 * 60),
            token_message_size: 10,
            batch_limit: 100,
            key_tokens_limit: 512,
            min_count: 1,
            new_entry_min_age: Duration::from_secs(60 * 60),
            low_count_discard_age: Duration::from_secs(3 * 24 * 60 * 60),
            token_domain_count_threshold: 2,
            quorum_config_ttl: Duration::from_secs(2 * 60 * 60),
            doublefetch_body_limit: 2 * 1024 * 1024,
            doublefetch_timeout: Duration::from_secs(15),
        }
    }
}

/// Countries populous enough that a country tag cannot identify anyone.
fn default_country_allow_list() -> Vec<String> {
    [
        "at", "au", "be", "br", "ca", "ch", "cn", "cz", "de", "dk", "es", "fi", "fr", "gb", "gr",
        "hu", "ie", "in", "it", "jp", "mx", "nl", "no", "pl", "pt", "ro", "ru", "se", "ua", "us",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let opts = Options::default();
        assert_eq!(opts.token_message_size, 10);
        assert_eq!(opts.key_tokens_limit, 512);
        assert_eq!(opts.clean_interval, Duration::from_secs(240));
        assert_eq!(opts.doublefetch_body_limit, 2 * 1024 * 1024);
        assert!(opts.allowed_countries.iter().any(|c| c == "de"));
        assert!(!opts.allowed_countries.iter().any(|c| c == "li"));
    }
}
