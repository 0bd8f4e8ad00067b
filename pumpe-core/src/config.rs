//! Environment-driven configuration.
//!
//! All keys live under the `PUMPE_` prefix. Unset or unparsable values fall
//! back to defaults, and loop timeouts/delays above their documented
//! ceilings snap back to defaults as well, so a typo cannot wedge the
//! selection or drain loops.

use std::time::Duration;

use tracing::warn;

use crate::kind::Kind;

const CEIL_SHUTDOWN: Duration = Duration::from_secs(60);
const CEIL_LOOP_TIMEOUT: Duration = Duration::from_secs(60);
const CEIL_LOOP_DELAY: Duration = Duration::from_millis(100);
const MIN_TOR_STARTUP: Duration = Duration::from_secs(120);

/// Process settings, straight from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub log_level: String,
    pub log_format: String,
    pub log_add_source: bool,
    pub default_kind: String,
    pub wg_dir: String,
    pub wg_parse_mode: u8,
    pub wg_dns: String,
    pub tor_num: usize,
    pub tor_max: usize,
    pub tor_startup_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub http_client_timeout: Duration,
    pub set_random_loop_timeout: Duration,
    pub set_random_loop_delay: Duration,
    pub set_state_loop_timeout: Duration,
    pub set_state_loop_delay: Duration,
    pub randomise_kinds: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 8080,
            log_level: "INFO".to_string(),
            log_format: "json".to_string(),
            log_add_source: false,
            default_kind: "tor".to_string(),
            wg_dir: String::new(),
            wg_parse_mode: 0,
            wg_dns: "9.9.9.9".to_string(),
            tor_num: 0,
            tor_max: 128,
            tor_startup_timeout: Duration::from_secs(180),
            shutdown_timeout: Duration::from_secs(30),
            http_client_timeout: Duration::from_secs(60),
            set_random_loop_timeout: Duration::from_secs(30),
            set_random_loop_delay: Duration::from_millis(10),
            set_state_loop_timeout: Duration::from_secs(30),
            set_state_loop_delay: Duration::from_millis(10),
            randomise_kinds: false,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let default_kind = env_string("PUMPE_DEFAULT_KIND", &defaults.default_kind);

        let mut tor_num = env_parse("PUMPE_TOR_NUM", 0usize);
        // A warm Tor pool only makes sense when tor is the default kind;
        // with other defaults gates can still be started via the API.
        if default_kind == "tor" && tor_num == 0 {
            tor_num = 4;
        }

        let mut tor_max = env_parse("PUMPE_TOR_MAX", 0usize);
        if tor_max == 0 {
            tor_max = defaults.tor_max;
        }

        Self {
            port: env_parse("PUMPE_PORT", defaults.port),
            log_level: env_string("PUMPE_LOG_LEVEL", &defaults.log_level),
            log_format: env_string("PUMPE_LOG_FORMAT", &defaults.log_format),
            log_add_source: env_parse("PUMPE_LOG_ADD_SOURCE", false),
            default_kind,
            wg_dir: env_string("PUMPE_WG_DIR", ""),
            wg_parse_mode: env_parse("PUMPE_WG_PARSE_MODE", defaults.wg_parse_mode),
            wg_dns: env_string("PUMPE_WG_DNS", &defaults.wg_dns),
            tor_num,
            tor_max,
            tor_startup_timeout: env_duration_floor(
                "PUMPE_TOR_STARTUP_TIMEOUT",
                MIN_TOR_STARTUP,
                defaults.tor_startup_timeout,
            ),
            shutdown_timeout: env_duration_ceil(
                "PUMPE_SHUTDOWN_TIMEOUT",
                CEIL_SHUTDOWN,
                defaults.shutdown_timeout,
            ),
            http_client_timeout: env_duration(
                "PUMPE_HTTP_CLIENT_TIMEOUT",
                defaults.http_client_timeout,
            ),
            set_random_loop_timeout: env_duration_ceil(
                "PUMPE_SET_RANDOM_LOOP_TIMEOUT",
                CEIL_LOOP_TIMEOUT,
                defaults.set_random_loop_timeout,
            ),
            set_random_loop_delay: env_duration_ceil(
                "PUMPE_SET_RANDOM_LOOP_DELAY",
                CEIL_LOOP_DELAY,
                defaults.set_random_loop_delay,
            ),
            set_state_loop_timeout: env_duration_ceil(
                "PUMPE_SET_STATE_LOOP_TIMEOUT",
                CEIL_LOOP_TIMEOUT,
                defaults.set_state_loop_timeout,
            ),
            set_state_loop_delay: env_duration_ceil(
                "PUMPE_SET_STATE_LOOP_DELAY",
                CEIL_LOOP_DELAY,
                defaults.set_state_loop_delay,
            ),
            randomise_kinds: env_parse("PUMPE_RANDOMISE_KINDS", false),
        }
    }
}

/// Static configuration of the gate set.
#[derive(Debug, Clone)]
pub struct SetConfig {
    pub default_kind: Kind,
    pub randomise_kinds: bool,
    pub http_timeout: Duration,
    pub random_loop_tout: Duration,
    pub random_loop_delay: Duration,
    pub state_loop_tout: Duration,
    pub state_loop_delay: Duration,
    pub tor_startup_tout: Duration,
    pub tor_max: usize,
}

impl Default for SetConfig {
    fn default() -> Self {
        Self {
            default_kind: Kind::Tor,
            randomise_kinds: false,
            http_timeout: Duration::from_secs(60),
            random_loop_tout: Duration::from_secs(30),
            random_loop_delay: Duration::from_millis(10),
            state_loop_tout: Duration::from_secs(30),
            state_loop_delay: Duration::from_millis(10),
            tor_startup_tout: Duration::from_secs(180),
            tor_max: 128,
        }
    }
}

impl SetConfig {
    pub fn from_settings(settings: &Settings, default_kind: Kind) -> Self {
        Self {
            default_kind,
            randomise_kinds: settings.randomise_kinds,
            http_timeout: settings.http_client_timeout,
            random_loop_tout: settings.set_random_loop_timeout,
            random_loop_delay: settings.set_random_loop_delay,
            state_loop_tout: settings.set_state_loop_timeout,
            state_loop_delay: settings.set_state_loop_delay,
            tor_startup_tout: settings.tor_startup_timeout,
            tor_max: settings.tor_max,
        }
    }
}

fn env_string(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val,
        _ => default.to_string(),
    }
}

fn env_parse<T: std::str::FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => match val.parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(key = name, value = %val, default = %default, "unparsable setting, using default");
                default
            }
        },
        _ => default,
    }
}

fn env_duration(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => match parse_duration(&val) {
            Some(parsed) if !parsed.is_zero() => parsed,
            _ => {
                warn!(key = name, value = %val, "unparsable duration, using default");
                default
            }
        },
        _ => default,
    }
}

fn env_duration_ceil(name: &str, ceil: Duration, default: Duration) -> Duration {
    let out = env_duration(name, default);
    if out > ceil { default } else { out }
}

fn env_duration_floor(name: &str, floor: Duration, default: Duration) -> Duration {
    let out = env_duration(name, default);
    if out < floor { default } else { out }
}

/// Parse durations of the `10ms` / `30s` / `3m` / `1h` form.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits.parse().ok()?;

    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_forms() {
        assert_eq!(parse_duration("10ms"), Some(Duration::from_millis(10)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("3m"), Some(Duration::from_secs(180)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("5"), None);
        assert_eq!(parse_duration("s"), None);
        assert_eq!(parse_duration("ten seconds"), None);
    }

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.port, 8080);
        assert_eq!(settings.log_level, "INFO");
        assert_eq!(settings.log_format, "json");
        assert_eq!(settings.default_kind, "tor");
        assert_eq!(settings.wg_dns, "9.9.9.9");
        assert_eq!(settings.tor_max, 128);
        assert_eq!(settings.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(settings.http_client_timeout, Duration::from_secs(60));
        assert_eq!(settings.set_random_loop_delay, Duration::from_millis(10));
        assert!(!settings.randomise_kinds);
    }

    #[test]
    #[serial_test::serial]
    fn from_env_overrides() {
        unsafe {
            std::env::set_var("PUMPE_PORT", "9090");
            std::env::set_var("PUMPE_DEFAULT_KIND", "direct");
            std::env::set_var("PUMPE_TOR_MAX", "16");
            std::env::set_var("PUMPE_SET_STATE_LOOP_TIMEOUT", "5s");
            std::env::set_var("PUMPE_RANDOMISE_KINDS", "true");
        }

        let settings = Settings::from_env();

        assert_eq!(settings.port, 9090);
        assert_eq!(settings.default_kind, "direct");
        assert_eq!(settings.tor_max, 16);
        assert_eq!(settings.set_state_loop_timeout, Duration::from_secs(5));
        assert!(settings.randomise_kinds);
        // Non-tor default kind means no warm Tor pool unless asked for.
        assert_eq!(settings.tor_num, 0);

        unsafe {
            std::env::remove_var("PUMPE_PORT");
            std::env::remove_var("PUMPE_DEFAULT_KIND");
            std::env::remove_var("PUMPE_TOR_MAX");
            std::env::remove_var("PUMPE_SET_STATE_LOOP_TIMEOUT");
            std::env::remove_var("PUMPE_RANDOMISE_KINDS");
        }
    }

    #[test]
    #[serial_test::serial]
    fn loop_values_above_ceiling_snap_back() {
        unsafe {
            std::env::set_var("PUMPE_SET_RANDOM_LOOP_TIMEOUT", "5m");
            std::env::set_var("PUMPE_SET_RANDOM_LOOP_DELAY", "2s");
            std::env::set_var("PUMPE_SHUTDOWN_TIMEOUT", "10m");
        }

        let settings = Settings::from_env();

        assert_eq!(settings.set_random_loop_timeout, Duration::from_secs(30));
        assert_eq!(settings.set_random_loop_delay, Duration::from_millis(10));
        assert_eq!(settings.shutdown_timeout, Duration::from_secs(30));

        unsafe {
            std::env::remove_var("PUMPE_SET_RANDOM_LOOP_TIMEOUT");
            std::env::remove_var("PUMPE_SET_RANDOM_LOOP_DELAY");
            std::env::remove_var("PUMPE_SHUTDOWN_TIMEOUT");
        }
    }

    #[test]
    #[serial_test::serial]
    fn tor_startup_below_floor_snaps_back() {
        unsafe {
            std::env::set_var("PUMPE_TOR_STARTUP_TIMEOUT", "30s");
        }

        let settings = Settings::from_env();
        assert_eq!(settings.tor_startup_timeout, Duration::from_secs(180));

        unsafe {
            std::env::remove_var("PUMPE_TOR_STARTUP_TIMEOUT");
        }
    }

    #[test]
    #[serial_test::serial]
    fn tor_default_kind_implies_warm_pool() {
        unsafe {
            std::env::remove_var("PUMPE_DEFAULT_KIND");
            std::env::remove_var("PUMPE_TOR_NUM");
        }

        let settings = Settings::from_env();
        assert_eq!(settings.tor_num, 4);
    }
}
