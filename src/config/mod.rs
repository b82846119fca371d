//! Configuration for the clawdfather service.
//!
//! Loaded from environment variables via figment at boot. Duration-typed
//! fields accept both bare numbers (seconds) and strings with units
//! ("30s", "2m", "1500ms"). Required values that are missing cause
//! `Figment::extract` to fail, which aborts startup loudly.

use fundu::{DurationParser, TimeUnit};
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration.
#[derive(Deserialize, Clone)]
pub struct Config {
    /// Log level for this application's target specifically.
    /// Valid values: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Process-wide master secret that per-account key-encryption-keys are
    /// derived from. Never logged, never written to disk.
    pub master_key: String,

    /// Port for the web server (default: 8080)
    #[serde(default = "default_web_port")]
    pub web_port: u16,

    /// Public base URL of this deployment, used to build chat URLs and the
    /// OAuth redirect URI.
    #[serde(default = "default_web_domain")]
    pub web_domain: String,

    /// Postgres connection URL. When absent the service boots on the
    /// in-memory store backend.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Idle age after which an SSH session is terminated.
    #[serde(
        default = "default_session_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub session_timeout: Duration,

    /// Credit ticker period. One tick debits this many wall-clock seconds
    /// from each account with a live session.
    #[serde(
        default = "default_tick_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub tick_interval: Duration,

    /// Default port for outbound SSH connections.
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Maximum concurrent pending/active session leases per account.
    #[serde(default = "default_session_cap")]
    pub session_cap: usize,

    /// Directory holding control sockets and short-lived key files.
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,

    /// Bearer token lifetime.
    #[serde(
        default = "default_token_ttl",
        deserialize_with = "deserialize_duration"
    )]
    pub token_ttl: Duration,

    /// Stripe API secret key. Only needed when selling credits.
    #[serde(default)]
    pub stripe_secret_key: Option<String>,

    /// Stripe webhook signing secret. The webhook endpoint refuses to
    /// process events while this is unset.
    #[serde(default)]
    pub stripe_webhook_secret: Option<String>,

    /// GitHub OAuth application credentials.
    pub github_client_id: String,
    pub github_client_secret: String,

    /// Graceful shutdown timeout.
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub shutdown_timeout: Duration,

    /// Per-request deadline applied to the HTTP surface and outbound calls.
    #[serde(
        default = "default_request_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub request_timeout: Duration,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_web_port() -> u16 {
    8080
}

fn default_web_domain() -> String {
    "http://localhost:8080".to_string()
}

/// Default idle timeout of 30 minutes
fn default_session_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

/// Default ticker period of 30 seconds
fn default_tick_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_ssh_port() -> u16 {
    22
}

fn default_session_cap() -> usize {
    3
}

fn default_runtime_dir() -> PathBuf {
    PathBuf::from("/tmp/clawdfather")
}

/// Default token lifetime of 30 days
fn default_token_ttl() -> Duration {
    Duration::from_secs(30 * 24 * 3600)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(8)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Duration parser accepting ms/s/m/h with seconds as the default unit.
/// Allows whitespace between number and unit and multiple summed units
/// ("1m 30s" = 90 seconds).
const DURATION_PARSER: DurationParser<'static> = DurationParser::builder()
    .time_units(&[
        TimeUnit::MilliSecond,
        TimeUnit::Second,
        TimeUnit::Minute,
        TimeUnit::Hour,
    ])
    .parse_multiple(None)
    .allow_time_unit_delimiter()
    .disable_infinity()
    .disable_fraction()
    .disable_exponent()
    .default_unit(TimeUnit::Second)
    .build();

/// Deserializer for duration fields that accepts both numeric seconds and
/// unit-suffixed strings.
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Visitor;

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a duration string or number")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            DURATION_PARSER
                .parse(value)
                .map_err(|e| {
                    serde::de::Error::custom(format!(
                        "Invalid duration format '{}': {}. Examples: '30' (30 seconds), '1500ms', '30s', '2m'",
                        value, e
                    ))
                })?
                .try_into()
                .map_err(|e| serde::de::Error::custom(format!("Duration conversion error: {}", e)))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if value < 0 {
                return Err(serde::de::Error::custom("Duration cannot be negative"));
            }
            Ok(Duration::from_secs(value as u64))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extract(extra: serde_json::Value) -> Result<Config, serde_json::Error> {
        let mut base = json!({
            "master_key": "test-master-key",
            "github_client_id": "iv-client",
            "github_client_secret": "iv-secret",
        });
        if let (Some(base_map), Some(extra_map)) = (base.as_object_mut(), extra.as_object()) {
            for (k, v) in extra_map {
                base_map.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(base)
    }

    #[test]
    fn defaults_fill_in() {
        let config = extract(json!({})).unwrap();
        assert_eq!(config.web_port, 8080);
        assert_eq!(config.tick_interval, Duration::from_secs(30));
        assert_eq!(config.session_timeout, Duration::from_secs(1800));
        assert_eq!(config.session_cap, 3);
        assert_eq!(config.ssh_port, 22);
        assert!(config.database_url.is_none());
        assert!(config.stripe_webhook_secret.is_none());
    }

    #[test]
    fn duration_strings_parse() {
        let config = extract(json!({
            "tick_interval": "10s",
            "session_timeout": "15m",
            "token_ttl": "500ms",
        }))
        .unwrap();
        assert_eq!(config.tick_interval, Duration::from_secs(10));
        assert_eq!(config.session_timeout, Duration::from_secs(900));
        assert_eq!(config.token_ttl, Duration::from_millis(500));
    }

    #[test]
    fn numeric_durations_are_seconds() {
        let config = extract(json!({ "tick_interval": 5 })).unwrap();
        assert_eq!(config.tick_interval, Duration::from_secs(5));
    }

    #[test]
    fn missing_master_key_fails() {
        let result: Result<Config, _> = serde_json::from_value(json!({
            "github_client_id": "iv-client",
            "github_client_secret": "iv-secret",
        }));
        assert!(result.is_err());
    }
}
