//! Server configuration, loaded from environment variables at startup.

/// Runtime configuration for kiln-server.
///
/// Every field has a default so the server works without any environment
/// variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of parallel slots sharing the context window
    /// (`LLAMACPP_PARALLEL`, default 1).
    pub n_parallel: usize,

    /// `tracing` filter string, e.g. `"info"` or `"debug,axum=warn"`
    /// (`KILN_LOG`).
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON
    /// (`KILN_LOG_JSON`).
    pub log_json: bool,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            n_parallel: parse_env("LLAMACPP_PARALLEL", 1).max(1),
            log_level: env_or("KILN_LOG", "info"),
            log_json: std::env::var("KILN_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Tests ──────────────────────────────────────────────────────────────────────
