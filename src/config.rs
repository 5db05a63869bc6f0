// ABOUTME: Loads the key=value startup configuration file described in section 6
// ABOUTME: Unknown or malformed lines are skipped with a warning; only a missing backend is fatal

use std::collections::HashMap;
use std::path::Path;

use tracing::warn;

use crate::error::{ProxyError, ProxyResult};

/// Immutable, process-wide configuration loaded once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub listen_ip: String,
    pub listen_port: u16,
    pub proxy_target_ip: String,
    pub proxy_target_port: u16,
    pub buffer_size: usize,
    pub sock_timeout_s: u64,
    pub tid_rewrite: bool,
    pub tid_strict: bool,
    pub strict_uid: bool,
    pub pass_stray: bool,
    pub drop_stray_silent: bool,
    pub log_file: String,
    pub log_level: String,
    pub log_hexdump: bool,
    pub log_sample_bytes: usize,
    pub log_stats_interval: u64,
    pub log_max_bytes: u64,
    pub log_backup_count: usize,
}

impl Config {
    /// Read `path` as a `key=value` file; `#` starts a comment, blank lines
    /// are ignored. Falls back to the documented default for any key that is
    /// absent or fails to parse as its expected type.
    pub fn load(path: impl AsRef<Path>) -> ProxyResult<Config> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ProxyError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::from_str(&raw))
    }

    fn from_str(raw: &str) -> Config {
        let mut kv = HashMap::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once('=') {
                Some((key, value)) => {
                    kv.insert(key.trim().to_string(), value.trim().to_string());
                }
                None => warn!(line, "ignoring malformed configuration line"),
            }
        }

        Config {
            listen_ip: get_or(&kv, "LISTEN_IP", "0.0.0.0"),
            listen_port: get_parsed_or(&kv, "LISTEN_PORT", 502),
            proxy_target_ip: get_or(&kv, "PROXY_TARGET_IP", ""),
            proxy_target_port: get_parsed_or(&kv, "PROXY_TARGET_PORT", 502),
            buffer_size: get_parsed_or(&kv, "BUFFER_SIZE", 4096),
            sock_timeout_s: get_parsed_or(&kv, "SOCK_TIMEOUT_S", 30),
            tid_rewrite: get_bool_or(&kv, "TID_REWRITE", true),
            tid_strict: get_bool_or(&kv, "TID_STRICT", false),
            strict_uid: get_bool_or(&kv, "STRICT_UID", false),
            pass_stray: get_bool_or(&kv, "PASS_STRAY", false),
            drop_stray_silent: get_bool_or(&kv, "DROP_STRAY_SILENT", false),
            log_file: get_or(&kv, "LOG_FILE", "/var/log/modbus_proxy.log"),
            log_level: get_or(&kv, "LOG_LEVEL", "INFO"),
            log_hexdump: get_bool_or(&kv, "LOG_HEXDUMP", false),
            log_sample_bytes: get_parsed_or(&kv, "LOG_SAMPLE_BYTES", 64),
            log_stats_interval: get_parsed_or(&kv, "LOG_STATS_INTERVAL", 60),
            log_max_bytes: get_parsed_or(&kv, "LOG_MAX_BYTES", 5_242_880),
            log_backup_count: get_parsed_or(&kv, "LOG_BACKUP_COUNT", 5),
        }
    }

    /// Validate fields that have no sensible default. Called explicitly by
    /// the daemon binary rather than from `load`, so unit tests can build a
    /// `Config` from a partial file without a live backend configured.
    pub fn validate(&self) -> ProxyResult<()> {
        if self.proxy_target_ip.is_empty() {
            return Err(ProxyError::ConfigInvalid(
                "PROXY_TARGET_IP must be set; there is no meaningful default backend".into(),
            ));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_ip, self.listen_port)
    }

    pub fn target_addr(&self) -> String {
        format!("{}:{}", self.proxy_target_ip, self.proxy_target_port)
    }
}

fn get_or(kv: &HashMap<String, String>, key: &str, default: &str) -> String {
    kv.get(key).cloned().unwrap_or_else(|| default.to_string())
}

fn get_parsed_or<T: std::str::FromStr>(kv: &HashMap<String, String>, key: &str, default: T) -> T {
    match kv.get(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, raw, "ignoring unparsable configuration value, using default");
            default
        }),
        None => default,
    }
}

fn get_bool_or(kv: &HashMap<String, String>, key: &str, default: bool) -> bool {
    match kv.get(key) {
        Some(raw) => match raw.as_str() {
            "1" | "true" | "TRUE" | "yes" => true,
            "0" | "false" | "FALSE" | "no" => false,
            _ => {
                warn!(key, raw, "ignoring unparsable boolean, using default");
                default
            }
        },
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_file_is_empty() {
        let cfg = Config::from_str("");
        assert_eq!(cfg.listen_ip, "0.0.0.0");
        assert_eq!(cfg.listen_port, 502);
        assert_eq!(cfg.buffer_size, 4096);
        assert!(cfg.tid_rewrite);
        assert!(!cfg.tid_strict);
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let cfg = Config::from_str(
            "# a comment\n\nLISTEN_PORT=1502\nPROXY_TARGET_IP=10.0.0.5\n",
        );
        assert_eq!(cfg.listen_port, 1502);
        assert_eq!(cfg.proxy_target_ip, "10.0.0.5");
    }

    #[test]
    fn malformed_line_falls_back_to_default() {
        let cfg = Config::from_str("not a key value line\nBUFFER_SIZE=8192\n");
        assert_eq!(cfg.buffer_size, 8192);
    }

    #[test]
    fn validate_rejects_missing_backend() {
        let cfg = Config::from_str("LISTEN_PORT=502\n");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_a_configured_backend() {
        let cfg = Config::from_str("PROXY_TARGET_IP=10.0.0.5\n");
        assert!(cfg.validate().is_ok());
    }
}
