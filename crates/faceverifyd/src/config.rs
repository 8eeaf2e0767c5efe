use faceverify_core::{MatchPolicy, DEFAULT_MATCH_THRESHOLD};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_API_BASE_URL: &str = "https://pleasant-tie-deer.cyclic.app";
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Daemon configuration: defaults, then the TOML file, then `FACEVERIFY_*`
/// environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the reference-image service.
    pub api_base_url: String,
    /// Euclidean distance below which a face matches a reference.
    pub match_threshold: f32,
    pub match_policy: MatchPolicy,
    /// Time between two capture ticks.
    pub poll_interval: Duration,
    /// Timeout for one reference fetch.
    pub fetch_timeout: Duration,
    /// JSON Lines recording replayed as the live capture feed.
    pub capture_replay: PathBuf,
    /// Restart the recording when it ends.
    pub capture_loop: bool,
    /// Register on the system bus instead of the session bus.
    pub system_bus: bool,
}

/// Optional overrides read from `faceverifyd.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    api_base_url: Option<String>,
    match_threshold: Option<f32>,
    match_policy: Option<MatchPolicy>,
    poll_interval_ms: Option<u64>,
    fetch_timeout_secs: Option<u64>,
    capture_replay: Option<PathBuf>,
    capture_loop: Option<bool>,
    system_bus: Option<bool>,
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Config {
    /// Load configuration from the optional config file and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok();
        let file = match config_file_path(&env) {
            Some(path) => {
                tracing::info!(path = %path.display(), "reading config file");
                FileConfig::read(&path)?
            }
            None => FileConfig::default(),
        };
        Ok(Self::from_layers(file, &env))
    }

    fn from_layers(file: FileConfig, env: &impl Fn(&str) -> Option<String>) -> Self {
        let match_threshold = env_parse::<f32>(env, "FACEVERIFY_MATCH_THRESHOLD")
            .filter(|t| t.is_finite())
            .or(file.match_threshold.filter(|t| t.is_finite()))
            .unwrap_or(DEFAULT_MATCH_THRESHOLD);

        let poll_interval_ms = env_parse::<u64>(env, "FACEVERIFY_POLL_INTERVAL_MS")
            .filter(|&ms| ms > 0)
            .or(file.poll_interval_ms.filter(|&ms| ms > 0))
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);

        let fetch_timeout_secs = env_parse::<u64>(env, "FACEVERIFY_FETCH_TIMEOUT_SECS")
            .filter(|&s| s > 0)
            .or(file.fetch_timeout_secs.filter(|&s| s > 0))
            .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS);

        let capture_replay = env("FACEVERIFY_CAPTURE_REPLAY")
            .map(PathBuf::from)
            .or(file.capture_replay)
            .unwrap_or_else(|| data_dir(env).join("detections.jsonl"));

        Self {
            api_base_url: env("FACEVERIFY_API_BASE_URL")
                .or(file.api_base_url)
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            match_threshold,
            match_policy: env_parse(env, "FACEVERIFY_MATCH_POLICY")
                .or(file.match_policy)
                .unwrap_or_default(),
            poll_interval: Duration::from_millis(poll_interval_ms),
            fetch_timeout: Duration::from_secs(fetch_timeout_secs),
            capture_replay,
            capture_loop: env_bool(env, "FACEVERIFY_CAPTURE_LOOP")
                .or(file.capture_loop)
                .unwrap_or(true),
            system_bus: env_bool(env, "FACEVERIFY_SYSTEM_BUS")
                .or(file.system_bus)
                .unwrap_or(false),
        }
    }
}

/// `FACEVERIFY_CONFIG` if set, else `faceverifyd.toml` in the user config dir when present.
fn config_file_path(env: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(path) = env("FACEVERIFY_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let path = env("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home(env).join(".config"))
        .join("faceverify/faceverifyd.toml");
    path.exists().then_some(path)
}

fn data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home(env).join(".local/share"))
        .join("faceverify")
}

fn home(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    PathBuf::from(env("HOME").unwrap_or_else(|| "/tmp".to_string()))
}

fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment value");
            None
        }
    }
}

fn env_bool(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = env(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let env = env_from(&[("HOME", "/home/ada")]);
        let config = Config::from_layers(FileConfig::default(), &env);
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.match_policy, MatchPolicy::First);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.fetch_timeout, Duration::from_secs(10));
        assert_eq!(
            config.capture_replay,
            PathBuf::from("/home/ada/.local/share/faceverify/detections.jsonl")
        );
        assert!(config.capture_loop);
        assert!(!config.system_bus);
    }

    #[test]
    fn test_file_layer_then_env_layer() {
        let file: FileConfig = toml::from_str(
            r#"
            api_base_url = "http://localhost:8080"
            match_threshold = 0.5
            match_policy = "best"
            poll_interval_ms = 250
            capture_loop = false
            "#,
        )
        .unwrap();

        let env = env_from(&[
            ("FACEVERIFY_MATCH_THRESHOLD", "0.45"),
            ("FACEVERIFY_CAPTURE_REPLAY", "/srv/replay.jsonl"),
            ("FACEVERIFY_SYSTEM_BUS", "yes"),
        ]);
        let config = Config::from_layers(file, &env);

        assert_eq!(config.api_base_url, "http://localhost:8080");
        assert_eq!(config.match_threshold, 0.45);
        assert_eq!(config.match_policy, MatchPolicy::Best);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.capture_replay, PathBuf::from("/srv/replay.jsonl"));
        assert!(!config.capture_loop);
        assert!(config.system_bus);
    }

    #[test]
    fn test_bad_env_values_fall_back() {
        let file = FileConfig {
            match_threshold: Some(0.55),
            ..FileConfig::default()
        };
        let env = env_from(&[
            ("FACEVERIFY_MATCH_THRESHOLD", "NaN"),
            ("FACEVERIFY_POLL_INTERVAL_MS", "fast"),
            ("FACEVERIFY_MATCH_POLICY", "closest"),
            ("FACEVERIFY_CAPTURE_LOOP", "maybe"),
        ]);
        let config = Config::from_layers(file, &env);
        assert_eq!(config.match_threshold, 0.55);
        assert_eq!(config.poll_interval, Duration::from_millis(DEFAULT_POLL_INTERVAL_MS));
        assert_eq!(config.match_policy, MatchPolicy::First);
        assert!(config.capture_loop);
    }

    #[test]
    fn test_zero_durations_rejected() {
        let file = FileConfig {
            poll_interval_ms: Some(250),
            fetch_timeout_secs: Some(0),
            ..FileConfig::default()
        };
        let env = env_from(&[("FACEVERIFY_POLL_INTERVAL_MS", "0")]);
        let config = Config::from_layers(file, &env);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.fetch_timeout, Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS));
    }

    #[test]
    fn test_unknown_file_keys_rejected() {
        assert!(toml::from_str::<FileConfig>("threshhold = 0.4").is_err());
    }

    #[test]
    fn test_explicit_config_path() {
        let env = env_from(&[("FACEVERIFY_CONFIG", "/etc/faceverify/faceverifyd.toml")]);
        assert_eq!(
            config_file_path(&env),
            Some(PathBuf::from("/etc/faceverify/faceverifyd.toml"))
        );
    }

    #[test]
    fn test_missing_config_file_is_read_error() {
        let err = FileConfig::read(Path::new("/nonexistent/faceverifyd.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
