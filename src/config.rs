use std::env;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    pub sled_path: String,
    pub log_level: String,
    pub enable_file_logs: bool,
    pub log_dir: String,
    pub resolver_cache_capacity: usize,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            sled_path: env_or("SLED_PATH", "./data/reporting.sled"),
            log_level: env_or("RUST_LOG", "info"),
            enable_file_logs: env_or_bool("ENABLE_FILE_LOGS", false),
            log_dir: env_or("LOG_DIR", "./logs"),
            resolver_cache_capacity: env_or_parse("RESOLVER_CACHE_CAPACITY", 10_000_usize),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sled_path: "./data/reporting.sled".to_string(),
            log_level: "info".to_string(),
            enable_file_logs: false,
            log_dir: "./logs".to_string(),
            resolver_cache_capacity: 10_000,
        }
    }
}

pub fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn env_or_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy + fmt::Debug,
{
    match env::var(key) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(
                    key,
                    value = %raw,
                    "Failed to parse env var, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

pub fn env_or_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, OnceLock};

    use super::*;

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    fn managed_keys() -> &'static [&'static str] {
        &[
            "SLED_PATH",
            "RUST_LOG",
            "ENABLE_FILE_LOGS",
            "LOG_DIR",
            "RESOLVER_CACHE_CAPACITY",
        ]
    }

    fn clear_keys(keys: &[&str]) {
        for key in keys {
            env::remove_var(key);
        }
    }

    #[test]
    fn loads_defaults_when_missing() {
        let _guard = env_lock().lock().expect("env lock");
        clear_keys(managed_keys());

        let cfg = Config::from_env();
        assert_eq!(cfg.sled_path, "./data/reporting.sled");
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.resolver_cache_capacity, 10_000);
        assert!(!cfg.enable_file_logs);
    }

    #[test]
    fn reads_values_from_env() {
        let _guard = env_lock().lock().expect("env lock");
        clear_keys(managed_keys());

        env::set_var("SLED_PATH", "/tmp/other.sled");
        env::set_var("RESOLVER_CACHE_CAPACITY", "512");
        env::set_var("ENABLE_FILE_LOGS", "yes");

        let cfg = Config::from_env();
        assert_eq!(cfg.sled_path, "/tmp/other.sled");
        assert_eq!(cfg.resolver_cache_capacity, 512);
        assert!(cfg.enable_file_logs);

        clear_keys(managed_keys());
    }

    #[test]
    fn invalid_values_fall_back() {
        let _guard = env_lock().lock().expect("env lock");
        clear_keys(managed_keys());

        env::set_var("RESOLVER_CACHE_CAPACITY", "not-a-number");
        let cfg = Config::from_env();
        assert_eq!(cfg.resolver_cache_capacity, 10_000);

        clear_keys(managed_keys());
    }
}
