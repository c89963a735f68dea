//! Configuration for voxly.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (VOXLY_HOME, TELEGRAM_BOT_TOKEN, ...)
//! 2. Config file (`--config`, `$VOXLY_CONFIG`, or `.voxly/config.yaml`)
//! 3. Defaults (~/.voxly)
//!
//! Config file discovery:
//! - Searches current directory and parents for .voxly/config.yaml
//! - Relative paths in the config file resolve against its `.voxly/` directory

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::{RecognizerSettings, StorageSettings, TelegramConfig};
use crate::core::PipelineSettings;
use crate::domain::VOICE_QUEUE;
use crate::queue::ConsumerConfig;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub recognizer: RecognizerSettings,
    #[serde(default)]
    pub storage: Option<StorageSettings>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub pipeline: PipelineSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to the config file's directory)
    pub home: Option<String>,
    /// SQLite database file (default: <home>/voxly.db)
    pub database: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_name")]
    pub name: String,
    /// Redelivery deadline for unacknowledged messages (default: 15 min)
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

fn default_queue_name() -> String {
    VOICE_QUEUE.to_string()
}
fn default_lease_secs() -> u64 {
    15 * 60
}
fn default_idle_poll_ms() -> u64 {
    500
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            lease_secs: default_lease_secs(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent consumers per worker process (default: 1)
    #[serde(default = "default_consumers")]
    pub consumers: usize,
}

fn default_consumers() -> usize {
    1
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            consumers: default_consumers(),
        }
    }
}

/// Resolved configuration with absolute paths and env overrides applied
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub home: PathBuf,
    pub database: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub telegram: TelegramConfig,
    pub recognizer: RecognizerSettings,
    pub storage: StorageSettings,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub pipeline: PipelineSettings,
}

impl ResolvedConfig {
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            queue: self.queue.name.clone(),
            idle_poll_ms: self.queue.idle_poll_ms,
            lease_renew_ms: self.queue.lease_secs.saturating_mul(1000) / 3,
        }
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.queue.lease_secs)
    }
}

fn mask(secret: &Option<String>) -> &'static str {
    match secret {
        Some(_) => "********",
        None => "(unset)",
    }
}

impl fmt::Display for ResolvedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let config_file = self
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none)".to_string());

        writeln!(f, "config file:      {}", config_file)?;
        writeln!(f, "home:             {}", self.home.display())?;
        writeln!(f, "database:         {}", self.database.display())?;
        writeln!(f, "telegram token:   {}", mask(&self.telegram.bot_token))?;
        writeln!(f, "recognizer key:   {}", mask(&self.recognizer.api_key))?;
        writeln!(
            f,
            "recognizer:       {} ({}, {})",
            self.recognizer.recognize_url, self.recognizer.language, self.recognizer.model
        )?;
        match &self.storage {
            StorageSettings::Http {
                endpoint,
                bucket,
                access_token,
                ..
            } => writeln!(
                f,
                "storage:          http {}/{} (token {})",
                endpoint,
                bucket,
                mask(access_token)
            )?,
            StorageSettings::Filesystem { dir } => {
                writeln!(f, "storage:          filesystem {}", dir.display())?
            }
        }
        writeln!(
            f,
            "queue:            {} (lease {}s)",
            self.queue.name, self.queue.lease_secs
        )?;
        writeln!(f, "consumers:        {}", self.worker.consumers)?;
        write!(f, "retry ceiling:    {}", self.pipeline.retry_ceiling)
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".voxly").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn parse_env<T: std::str::FromStr>(env: &dyn Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match env(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(None),
    }
}

/// Merge a parsed config file with environment overrides.
///
/// `env` is the variable lookup; `default_home` is used when neither the
/// file nor `VOXLY_HOME` names one.
pub fn resolve(
    file: Option<(PathBuf, ConfigFile)>,
    env: &dyn Fn(&str) -> Option<String>,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    let (config_file, raw) = match file {
        Some((path, raw)) => (Some(path), raw),
        None => (None, ConfigFile::default()),
    };
    let config_dir = config_file
        .as_ref()
        .and_then(|p| p.parent())
        .map(Path::to_path_buf);

    let home = if let Some(env_home) = env("VOXLY_HOME") {
        PathBuf::from(env_home)
    } else if let (Some(dir), Some(home_path)) = (&config_dir, &raw.paths.home) {
        resolve_path(dir, home_path)
    } else {
        default_home
    };

    let database = if let Some(env_db) = env("VOXLY_DATABASE") {
        PathBuf::from(env_db)
    } else if let Some(db_path) = &raw.paths.database {
        match &config_dir {
            Some(dir) => resolve_path(dir, db_path),
            None => PathBuf::from(db_path),
        }
    } else {
        home.join("voxly.db")
    };

    let mut telegram = raw.telegram;
    if let Some(token) = env("TELEGRAM_BOT_TOKEN") {
        telegram.bot_token = Some(token);
    }

    let mut recognizer = raw.recognizer;
    if let Some(key) = env("RECOGNIZER_API_KEY") {
        recognizer.api_key = Some(key);
    }
    if let Some(folder) = env("RECOGNIZER_FOLDER_ID") {
        recognizer.folder_id = Some(folder);
    }

    let storage = match (env("S3_ENDPOINT"), env("S3_BUCKET"), raw.storage) {
        (Some(endpoint), Some(bucket), _) => StorageSettings::Http {
            endpoint,
            bucket,
            public_base: None,
            access_token: env("S3_ACCESS_TOKEN"),
        },
        (_, _, Some(StorageSettings::Filesystem { dir })) => StorageSettings::Filesystem {
            dir: match &config_dir {
                Some(base) if dir.is_relative() => base.join(dir),
                _ => dir,
            },
        },
        (_, _, Some(StorageSettings::Http {
            endpoint,
            bucket,
            public_base,
            access_token,
        })) => StorageSettings::Http {
            endpoint,
            bucket,
            public_base,
            access_token: env("S3_ACCESS_TOKEN").or(access_token),
        },
        (_, _, None) => StorageSettings::Filesystem {
            dir: home.join("blobs"),
        },
    };

    let mut worker = raw.worker;
    if let Some(consumers) = parse_env::<usize>(env, "WORKER_CONSUMERS")? {
        worker.consumers = consumers;
    }
    if raw.queue.lease_secs == 0 {
        anyhow::bail!("queue.lease_secs must be at least 1");
    }
    if worker.consumers == 0 {
        anyhow::bail!("worker.consumers must be at least 1");
    }

    raw.pipeline
        .validate()
        .context("Invalid pipeline settings")?;

    Ok(ResolvedConfig {
        home,
        database,
        config_file,
        telegram,
        recognizer,
        storage,
        queue: raw.queue,
        worker,
        pipeline: raw.pipeline,
    })
}

/// Load configuration from all sources
pub fn load_config(explicit: Option<&Path>) -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".voxly");

    let path = explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var("VOXLY_CONFIG").ok().map(PathBuf::from))
        .or_else(find_config_file);

    let file = match path {
        Some(path) => {
            let raw = load_config_file(&path)?;
            Some((path, raw))
        }
        None => None,
    };

    resolve(file, &|key| std::env::var(key).ok(), default_home)
}

/// Get the global configuration (loads once, then cached).
///
/// `explicit` only takes effect on the first call.
pub fn config(explicit: Option<&Path>) -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config(explicit).map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_file() {
        let config = resolve(None, &env_from(&[]), PathBuf::from("/home/u/.voxly")).unwrap();

        assert_eq!(config.home, PathBuf::from("/home/u/.voxly"));
        assert_eq!(config.database, PathBuf::from("/home/u/.voxly/voxly.db"));
        assert!(config.config_file.is_none());
        assert_eq!(config.queue.name, "voice_processing");
        assert_eq!(config.lease(), Duration::from_secs(900));
        assert_eq!(config.worker.consumers, 1);
        assert_eq!(config.pipeline.retry_ceiling, 3);
        assert_eq!(config.telegram.poll_timeout_secs, 30);
        match config.storage {
            StorageSettings::Filesystem { dir } => {
                assert_eq!(dir, PathBuf::from("/home/u/.voxly/blobs"))
            }
            other => panic!("unexpected storage {:?}", other),
        }
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let voxly_dir = temp.path().join(".voxly");
        std::fs::create_dir_all(&voxly_dir).unwrap();

        let config_path = voxly_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  home: ./state
telegram:
  bot_token: "123:abc"
recognizer:
  folder_id: folder-1
  language: en-US
storage:
  kind: http
  endpoint: https://storage.example.com
  bucket: voices
queue:
  lease_secs: 60
worker:
  consumers: 4
pipeline:
  retry_ceiling: 5
  retry:
    max_attempts: 2
"#
        )
        .unwrap();

        let raw = load_config_file(&config_path).unwrap();
        let config = resolve(Some((config_path.clone(), raw)), &env_from(&[]), PathBuf::from("/unused")).unwrap();

        assert_eq!(config.home, voxly_dir.join("state"));
        assert_eq!(config.database, voxly_dir.join("state").join("voxly.db"));
        assert_eq!(config.config_file, Some(config_path));
        assert_eq!(config.telegram.bot_token.as_deref(), Some("123:abc"));
        assert_eq!(config.recognizer.language, "en-US");
        assert_eq!(config.recognizer.model, "general:rc");
        assert_eq!(config.queue.lease_secs, 60);
        assert_eq!(config.consumer_config().lease_renew_ms, 20_000);
        assert_eq!(config.queue.name, "voice_processing");
        assert_eq!(config.worker.consumers, 4);
        assert_eq!(config.pipeline.retry_ceiling, 5);
        assert_eq!(config.pipeline.retry.max_attempts, 2);
        assert_eq!(config.pipeline.retry.initial_interval_ms, 1000);
        assert!(matches!(config.storage, StorageSettings::Http { ref bucket, .. } if bucket == "voices"));
    }

    #[test]
    fn test_env_overrides_file() {
        let raw: ConfigFile = serde_yaml::from_str(
            r#"
telegram:
  bot_token: from-file
worker:
  consumers: 2
"#,
        )
        .unwrap();
        let env = env_from(&[
            ("VOXLY_HOME", "/srv/voxly"),
            ("TELEGRAM_BOT_TOKEN", "from-env"),
            ("RECOGNIZER_API_KEY", "key"),
            ("S3_ENDPOINT", "https://s3.local"),
            ("S3_BUCKET", "b"),
            ("WORKER_CONSUMERS", "8"),
        ]);

        let config = resolve(Some((PathBuf::from("/etc/voxly/config.yaml"), raw)), &env, PathBuf::from("/unused")).unwrap();

        assert_eq!(config.home, PathBuf::from("/srv/voxly"));
        assert_eq!(config.database, PathBuf::from("/srv/voxly/voxly.db"));
        assert_eq!(config.telegram.bot_token.as_deref(), Some("from-env"));
        assert_eq!(config.recognizer.api_key.as_deref(), Some("key"));
        assert_eq!(config.worker.consumers, 8);
        assert!(matches!(config.storage, StorageSettings::Http { ref endpoint, .. } if endpoint == "https://s3.local"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let env = env_from(&[("WORKER_CONSUMERS", "many")]);
        assert!(resolve(None, &env, PathBuf::from("/h")).is_err());

        let env = env_from(&[("WORKER_CONSUMERS", "0")]);
        assert!(resolve(None, &env, PathBuf::from("/h")).is_err());

        let raw: ConfigFile = serde_yaml::from_str("pipeline:\n  retry_ceiling: 0\n").unwrap();
        assert!(resolve(Some((PathBuf::from("/c/config.yaml"), raw)), &env_from(&[]), PathBuf::from("/h")).is_err());

        let raw: ConfigFile = serde_yaml::from_str("queue:\n  lease_secs: 0\n").unwrap();
        assert!(resolve(Some((PathBuf::from("/c/config.yaml"), raw)), &env_from(&[]), PathBuf::from("/h")).is_err());
    }

    #[test]
    fn test_display_masks_secrets() {
        let env = env_from(&[("TELEGRAM_BOT_TOKEN", "123:secret"), ("RECOGNIZER_API_KEY", "hunter2")]);
        let config = resolve(None, &env, PathBuf::from("/h")).unwrap();
        let shown = config.to_string();

        assert!(!shown.contains("secret"));
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("********"));
        assert!(shown.contains("voice_processing"));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
        assert_eq!(
            resolve_path(&base, "../sibling"),
            PathBuf::from("/home/user/project/../sibling")
        );
    }
}
