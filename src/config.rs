use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

// Serde default helpers, one function per field so request bodies can
// override any subset of the config.
fn default_fetch_concurrency() -> usize {
    6
}
fn default_page_timeout_secs() -> u64 {
    30
}
fn default_job_timeout_secs() -> u64 {
    180
}
fn default_max_candidates() -> usize {
    300
}
fn default_max_pages_to_fetch() -> usize {
    50
}
fn default_link_depth() -> usize {
    2
}
fn default_link_page_cap() -> usize {
    40
}
fn default_rate_capacity() -> u32 {
    8
}
fn default_rate_refill_per_minute() -> f64 {
    8.0
}
fn default_breaker_failure_threshold() -> u32 {
    5
}
fn default_breaker_cooldown_secs() -> u64 {
    30
}
fn default_breaker_cooldown_cap_secs() -> u64 {
    240
}
fn default_sufficiency_threshold() -> usize {
    300
}
fn default_ai_max_attempts() -> u32 {
    3
}
fn default_ai_rerank() -> bool {
    true
}

/// Every knob the pipeline recognizes, validated once at job start.
///
/// Replaces point-of-use option lookups: a job either starts with a fully
/// valid configuration or not at all.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ResearchConfig {
    /// Number of pages fetched and extracted in parallel
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    /// Per-page fetch timeout in seconds, independent of the job deadline
    #[serde(default = "default_page_timeout_secs")]
    pub page_timeout_secs: u64,
    /// Wall-clock ceiling for the whole job in seconds
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// Cap on discovered candidate URLs per job
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    /// Cap on pages actually fetched per job
    #[serde(default = "default_max_pages_to_fetch")]
    pub max_pages_to_fetch: usize,
    /// Recursion depth for same-origin link following
    #[serde(default = "default_link_depth")]
    pub link_depth: usize,
    /// Cap on pages visited while following links (sitemap URLs excluded)
    #[serde(default = "default_link_page_cap")]
    pub link_page_cap: usize,
    /// Token bucket capacity for outbound AI calls
    #[serde(default = "default_rate_capacity")]
    pub rate_capacity: u32,
    /// Token bucket refill rate, tokens per minute
    #[serde(default = "default_rate_refill_per_minute")]
    pub rate_refill_per_minute: f64,
    /// Consecutive AI failures before the circuit opens
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,
    /// Initial circuit cooldown in seconds; doubles on repeated probe failure
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
    /// Upper bound on the circuit cooldown in seconds
    #[serde(default = "default_breaker_cooldown_cap_secs")]
    pub breaker_cooldown_cap_secs: u64,
    /// Minimum extracted characters for a page to count as successfully extracted
    #[serde(default = "default_sufficiency_threshold")]
    pub sufficiency_threshold: usize,
    /// Attempts per AI call (first try plus retries)
    #[serde(default = "default_ai_max_attempts")]
    pub ai_max_attempts: u32,
    /// Whether to ask the model to re-rank the heuristic page selection
    #[serde(default = "default_ai_rerank")]
    pub ai_rerank: bool,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        // Round-trips through serde so the per-field default fns stay the
        // single source of truth.
        serde_json::from_value(serde_json::json!({})).expect("defaults are valid")
    }
}

impl ResearchConfig {
    /// Build a config from defaults with environment overrides applied.
    ///
    /// Recognized variables mirror the field names, prefixed `COMPANYINTEL_`
    /// (e.g. `COMPANYINTEL_FETCH_CONCURRENCY`). Unparsable values are
    /// ignored with a warning rather than failing startup.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();

        fn read<T: std::str::FromStr>(name: &str, slot: &mut T) {
            if let Ok(raw) = env::var(name) {
                match raw.parse() {
                    Ok(v) => *slot = v,
                    Err(_) => tracing::warn!("Ignoring unparsable {}={}", name, raw),
                }
            }
        }

        read(
            "COMPANYINTEL_FETCH_CONCURRENCY",
            &mut config.fetch_concurrency,
        );
        read("COMPANYINTEL_PAGE_TIMEOUT_SECS", &mut config.page_timeout_secs);
        read("COMPANYINTEL_JOB_TIMEOUT_SECS", &mut config.job_timeout_secs);
        read("COMPANYINTEL_MAX_CANDIDATES", &mut config.max_candidates);
        read(
            "COMPANYINTEL_MAX_PAGES_TO_FETCH",
            &mut config.max_pages_to_fetch,
        );
        read("COMPANYINTEL_LINK_DEPTH", &mut config.link_depth);
        read("COMPANYINTEL_LINK_PAGE_CAP", &mut config.link_page_cap);
        read("COMPANYINTEL_RATE_CAPACITY", &mut config.rate_capacity);
        read(
            "COMPANYINTEL_RATE_REFILL_PER_MINUTE",
            &mut config.rate_refill_per_minute,
        );
        read(
            "COMPANYINTEL_BREAKER_FAILURE_THRESHOLD",
            &mut config.breaker_failure_threshold,
        );
        read(
            "COMPANYINTEL_BREAKER_COOLDOWN_SECS",
            &mut config.breaker_cooldown_secs,
        );
        read(
            "COMPANYINTEL_BREAKER_COOLDOWN_CAP_SECS",
            &mut config.breaker_cooldown_cap_secs,
        );
        read(
            "COMPANYINTEL_SUFFICIENCY_THRESHOLD",
            &mut config.sufficiency_threshold,
        );
        read("COMPANYINTEL_AI_MAX_ATTEMPTS", &mut config.ai_max_attempts);
        read("COMPANYINTEL_AI_RERANK", &mut config.ai_rerank);

        config
    }

    /// Validate on job start so a bad option fails the request, not a phase.
    pub fn validate(&self) -> Result<(), String> {
        if self.fetch_concurrency == 0 || self.fetch_concurrency > 64 {
            return Err(format!(
                "fetch_concurrency must be 1..=64, got {}",
                self.fetch_concurrency
            ));
        }
        if self.page_timeout_secs == 0 {
            return Err("page_timeout_secs must be > 0".to_string());
        }
        if self.job_timeout_secs == 0 {
            return Err("job_timeout_secs must be > 0".to_string());
        }
        if self.page_timeout_secs >= self.job_timeout_secs {
            return Err(format!(
                "page_timeout_secs ({}) must be below job_timeout_secs ({})",
                self.page_timeout_secs, self.job_timeout_secs
            ));
        }
        if self.max_pages_to_fetch == 0 {
            return Err("max_pages_to_fetch must be > 0".to_string());
        }
        if self.max_candidates < self.max_pages_to_fetch {
            return Err(format!(
                "max_candidates ({}) must be at least max_pages_to_fetch ({})",
                self.max_candidates, self.max_pages_to_fetch
            ));
        }
        if self.rate_capacity == 0 {
            return Err("rate_capacity must be > 0".to_string());
        }
        if !(self.rate_refill_per_minute > 0.0) {
            return Err("rate_refill_per_minute must be > 0".to_string());
        }
        if self.breaker_failure_threshold == 0 {
            return Err("breaker_failure_threshold must be > 0".to_string());
        }
        if self.breaker_cooldown_cap_secs < self.breaker_cooldown_secs {
            return Err(format!(
                "breaker_cooldown_cap_secs ({}) must be at least breaker_cooldown_secs ({})",
                self.breaker_cooldown_cap_secs, self.breaker_cooldown_secs
            ));
        }
        if self.sufficiency_threshold == 0 {
            return Err("sufficiency_threshold must be > 0".to_string());
        }
        if self.ai_max_attempts == 0 {
            return Err("ai_max_attempts must be > 0".to_string());
        }
        Ok(())
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }

    pub fn breaker_cooldown_cap(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_cap_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ResearchConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_concurrency() {
        let mut config = ResearchConfig::default();
        config.fetch_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_page_timeout_above_job_timeout() {
        let mut config = ResearchConfig::default();
        config.page_timeout_secs = 300;
        config.job_timeout_secs = 120;
        assert!(config.validate().is_err());
    }

    #[test]
    fn breaker_cooldown_cap_is_read_from_the_environment() {
        env::set_var("COMPANYINTEL_BREAKER_COOLDOWN_CAP_SECS", "600");
        let config = ResearchConfig::from_env();
        env::remove_var("COMPANYINTEL_BREAKER_COOLDOWN_CAP_SECS");
        assert_eq!(config.breaker_cooldown_cap_secs, 600);
    }

    #[test]
    fn partial_request_body_falls_back_to_defaults() {
        let config: ResearchConfig =
            serde_json::from_value(serde_json::json!({"fetch_concurrency": 3})).unwrap();
        assert_eq!(config.fetch_concurrency, 3);
        assert_eq!(config.max_pages_to_fetch, 50);
        assert!(config.validate().is_ok());
    }
}
