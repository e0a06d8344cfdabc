//! Shared helpers for the CLI: tracing setup, environment and formatting.

use std::path::{Path, PathBuf};

use tracing_subscriber::EnvFilter;

/// Default config file when neither `--config` nor `$STEWARD_CONFIG` is set.
pub const DEFAULT_CONFIG_PATH: &str = "steward.toml";

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Install the global subscriber. `RUST_LOG` wins over `default_level`.
///
/// Logs go to stderr so that command output on stdout stays parseable.
pub fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Read an environment variable, treating empty values as unset.
pub fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// `--config`, then `$STEWARD_CONFIG`, then [`DEFAULT_CONFIG_PATH`].
pub fn config_path(flag: Option<&Path>) -> PathBuf {
    flag.map(Path::to_path_buf)
        .or_else(|| env_non_empty("STEWARD_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

/// Unix milliseconds as local `YYYY-MM-DD HH:MM:SS`.
pub fn format_millis(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| {
            t.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| ms.to_string())
}

/// First `max` characters of the first line of `text`.
pub fn preview(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    let mut out: String = line.chars().take(max).collect();
    if line.chars().count() > max || text.lines().nth(1).is_some() {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_cuts_long_and_multiline_text() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("abcdefghij", 4), "abcd...");
        assert_eq!(preview("first\nsecond", 20), "first...");
        assert_eq!(preview("", 5), "");
    }

    #[test]
    fn explicit_config_flag_wins() {
        let path = config_path(Some(Path::new("/etc/steward.toml")));
        assert_eq!(path, PathBuf::from("/etc/steward.toml"));
    }

    #[test]
    fn invalid_timestamp_falls_back_to_number() {
        assert_eq!(format_millis(i64::MAX), i64::MAX.to_string());
        assert!(format_millis(0).starts_with("19"));
    }
}
