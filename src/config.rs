//! Engine runtime configuration

use std::time::Duration;

use tracing::warn;

/// Any non-empty value enables verbose build logging.
pub const ENV_DEBUG: &str = "CLDCTL_DEBUG";

/// Overrides the default build timeout; accepts `20m`, `90s`, `1h`, `500ms`
/// or a bare number of seconds.
pub const ENV_BUILD_TIMEOUT: &str = "CLDCTL_BUILD_TIMEOUT";

const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Knobs resolved once per engine instance
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub build_timeout: Duration,
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            build_timeout: DEFAULT_BUILD_TIMEOUT,
            debug: false,
        }
    }
}

impl EngineConfig {
    /// Resolve configuration from the ambient environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if std::env::var(ENV_DEBUG).map(|v| !v.is_empty()).unwrap_or(false) {
            config.debug = true;
        }

        if let Ok(raw) = std::env::var(ENV_BUILD_TIMEOUT) {
            match parse_duration(&raw) {
                Some(timeout) => config.build_timeout = timeout,
                None => warn!("Ignoring unparsable {}={}", ENV_BUILD_TIMEOUT, raw),
            }
        }

        config
    }
}

/// Parse a human duration string: `500ms`, `90s`, `20m`, `1h`, or bare
/// seconds.
pub(crate) fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let (digits, unit): (&str, &str) = match raw.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(idx) => (&raw[..idx], raw[idx..].trim()),
        None => (raw, "s"),
    };

    let amount: f64 = digits.parse().ok()?;
    let millis = match unit {
        "ms" => amount,
        "s" | "" => amount * 1000.0,
        "m" => amount * 60.0 * 1000.0,
        "h" => amount * 60.0 * 60.0 * 1000.0,
        _ => return None,
    };

    if millis < 0.0 {
        return None;
    }
    Some(Duration::from_millis(millis as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("20m"), Some(Duration::from_secs(20 * 60)));
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("10 fortnights"), None);
    }

    #[test]
    fn test_default_build_timeout() {
        let config = EngineConfig::default();
        assert_eq!(config.build_timeout, Duration::from_secs(600));
        assert!(!config.debug);
    }
}
