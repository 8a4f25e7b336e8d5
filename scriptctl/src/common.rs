use anyhow::{Context, Result, bail};
use scriptctl_core::{Config, ConfigLoader, ScriptId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const RUNNING_ICON: &str = "●";
pub const STOPPED_ICON: &str = "○";
pub const FAILURE_ICON: &str = "✗";

/// Resolves the config file: an explicit path must exist, otherwise the
/// loader's search paths are tried.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => ConfigLoader::new().discover(),
    }
}

/// Loads the config, or an empty one when no file is found.
pub async fn load_config(explicit: Option<&Path>) -> Result<Config> {
    match resolve_config_path(explicit) {
        Some(path) => {
            debug!("Loading config from {:?}", path);
            ConfigLoader::new()
                .load_file(&path)
                .await
                .with_context(|| format!("Failed to load config from {}", path.display()))
        }
        None => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
    }
}

pub fn parse_script_id(name: &str) -> Result<ScriptId> {
    ScriptId::new(name).with_context(|| format!("Invalid script name '{}'", name))
}

/// Parses `KEY=VALUE` pairs.
pub fn parse_env(pairs: &[String]) -> Result<HashMap<String, String>> {
    let mut env = HashMap::with_capacity(pairs.len());
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("Invalid environment variable '{}', expected KEY=VALUE", pair);
        };
        if key.is_empty() {
            bail!("Invalid environment variable '{}', empty key", pair);
        }
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if size.fract() == 0.0 {
        format!("{:.0} {}", size, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

pub fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

/// Local time of a millisecond epoch timestamp.
pub fn format_epoch_ms(ms: u64) -> String {
    match chrono::DateTime::from_timestamp_millis(ms as i64) {
        Some(time) => time
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => "-".to_string(),
    }
}

/// Keeps the last `n` lines of `text`.
pub fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    let mut out = lines[start..].join("\n");
    if !out.is_empty() && text.ends_with('\n') {
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env() {
        let env = parse_env(&["A=1".to_string(), "URL=http://x?a=b".to_string()]).unwrap();
        assert_eq!(env["A"], "1");
        assert_eq!(env["URL"], "http://x?a=b");

        assert!(parse_env(&["NOVALUE".to_string()]).is_err());
        assert!(parse_env(&["=x".to_string()]).is_err());
        assert_eq!(parse_env(&["EMPTY=".to_string()]).unwrap()["EMPTY"], "");
    }

    #[test]
    fn test_parse_script_id() {
        assert_eq!(parse_script_id("Dev Server").unwrap().as_str(), "dev-server");
        assert!(parse_script_id("   ").is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1 MB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(59), "59s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(3665), "1h 1m");
        assert_eq!(format_duration(90061), "1d 1h");
    }

    #[test]
    fn test_last_lines() {
        assert_eq!(last_lines("a\nb\nc\n", 2), "b\nc\n");
        assert_eq!(last_lines("a\nb", 5), "a\nb");
        assert_eq!(last_lines("a\nb\n", 0), "");
        assert_eq!(last_lines("", 3), "");
    }
}
