use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::crawl::RetryPolicy;
use crate::graph::store::canonical_key;
use crate::graph::EntityKind;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub seeds: SeedsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
}

/// Store location and logging
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlerConfig {
    pub db_path: PathBuf,
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Remote document source
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

/// Root set fetched unconditionally before draining
#[derive(Debug, Clone, Deserialize)]
pub struct SeedsConfig {
    #[serde(default = "default_seed_kind")]
    pub kind: String,
    #[serde(default = "default_seed_keys")]
    pub keys: Vec<String>,
}

impl Default for SeedsConfig {
    fn default() -> Self {
        Self {
            kind: default_seed_kind(),
            keys: default_seed_keys(),
        }
    }
}

/// Fetch retry and store retry budgets
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_store_retries")]
    pub store_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            store_retries: default_store_retries(),
        }
    }
}

/// Drain worker pool
#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_base_url() -> String {
    "https://swapi.dev/api/".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("swgraph/{}", env!("CARGO_PKG_VERSION"))
}

fn default_seed_kind() -> String {
    "Film".to_string()
}

fn default_seed_keys() -> Vec<String> {
    (1..=7).map(|id| format!("films/{}", id)).collect()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

fn default_store_retries() -> u32 {
    3
}

fn default_worker_count() -> usize {
    1
}

fn default_idle_poll_ms() -> u64 {
    200
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in SWGRAPH_CONFIG environment variable
    /// 2. ./config.toml in current directory
    pub fn load() -> Result<Self> {
        // .env is optional
        let _ = dotenv::dotenv();

        let config_path = std::env::var("SWGRAPH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        Self::from_file(&config_path)
    }

    /// Parse and validate a specific config file
    pub fn from_file(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Config = toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let base = Url::parse(&self.source.base_url).with_context(|| {
            format!("source.base_url is not a valid URL: {}", self.source.base_url)
        })?;
        if base.cannot_be_a_base() {
            anyhow::bail!("source.base_url cannot be used as a base URL: {}", base);
        }

        if self.source.timeout_secs == 0 {
            anyhow::bail!("source.timeout_secs must be greater than 0");
        }

        let seed_kind = EntityKind::from_str(&self.seeds.kind)
            .with_context(|| format!("seeds.kind is not a known entity kind: {}", self.seeds.kind))?;
        if seed_kind.is_tag() {
            anyhow::bail!("seeds.kind must be a fetchable kind, not the tag kind {}", seed_kind);
        }

        if self.seeds.keys.iter().any(|k| k.trim().is_empty()) {
            anyhow::bail!("seeds.keys must not contain blank keys");
        }

        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be greater than 0");
        }

        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            anyhow::bail!("retry.initial_backoff_ms must not exceed retry.max_backoff_ms");
        }

        if self.workers.count == 0 {
            anyhow::bail!("workers.count must be greater than 0");
        }

        Ok(())
    }

    /// Get database path
    pub fn db_path(&self) -> &Path {
        &self.crawler.db_path
    }

    /// Get migrations directory
    pub fn migrations_dir(&self) -> &Path {
        &self.crawler.migrations_dir
    }

    /// Seed kind, already checked by `validate`
    pub fn seed_kind(&self) -> crate::Result<EntityKind> {
        EntityKind::from_str(&self.seeds.kind)
    }

    /// Seed keys as absolute URLs under `source.base_url`, in the canonical form
    /// the API uses for `url` fields, so seeds and discovered references agree.
    pub fn seed_keys(&self) -> Result<Vec<String>> {
        let mut base = Url::parse(&self.source.base_url)
            .with_context(|| format!("source.base_url is not a valid URL: {}", self.source.base_url))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        self.seeds
            .keys
            .iter()
            .map(|key| {
                let key = key.trim();
                let url = if key.starts_with("http://") || key.starts_with("https://") {
                    Url::parse(key)
                } else {
                    base.join(key.trim_start_matches('/'))
                }
                .with_context(|| format!("cannot resolve seed key {}", key))?;
                canonical_key(url.as_str()).with_context(|| format!("blank seed key {}", key))
            })
            .collect()
    }

    /// Fetch retry policy derived from `[retry]`
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            store_retries: self.retry.store_retries,
        }
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.workers.idle_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serialize config tests that mutate process-wide env so they don't race.
    static CONFIG_TEST_LOCK: Mutex<()> = Mutex::new(());

    const MINIMAL: &str = r#"
[crawler]
db_path = "./swgraph.db"
"#;

    fn write_config(temp_dir: &TempDir, content: &str) -> PathBuf {
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(&temp_dir, MINIMAL);
        let config = Config::from_file(&path).unwrap();

        assert_eq!(config.crawler.log_level, "info");
        assert_eq!(config.migrations_dir(), Path::new("migrations"));
        assert_eq!(config.source.base_url, "https://swapi.dev/api/");
        assert_eq!(config.seed_kind().unwrap(), EntityKind::Film);
        assert_eq!(config.seeds.keys.len(), 7);
        assert_eq!(config.seeds.keys[0], "films/1");
        assert_eq!(config.seeds.keys[6], "films/7");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.workers.count, 1);
    }

    #[test]
    fn test_full_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(
            &temp_dir,
            r#"
[crawler]
db_path = "./graph.db"
migrations_dir = "./sql"
log_level = "debug"

[source]
base_url = "http://localhost:9000/api/"
timeout_secs = 5
user_agent = "test-agent"

[seeds]
kind = "Person"
keys = ["people/1", "people/2"]

[retry]
max_attempts = 5
initial_backoff_ms = 10
max_backoff_ms = 100
store_retries = 1

[workers]
count = 4
idle_poll_ms = 20
"#,
        );
        let config = Config::from_file(&path).unwrap();

        assert_eq!(config.seed_kind().unwrap(), EntityKind::Person);
        assert_eq!(config.seeds.keys, vec!["people/1", "people/2"]);
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_backoff, Duration::from_millis(10));
        assert_eq!(policy.max_backoff, Duration::from_millis(100));
        assert_eq!(config.workers.count, 4);
        assert_eq!(config.idle_poll(), Duration::from_millis(20));
    }

    #[test]
    fn test_seed_keys_resolve_against_base() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(
            &temp_dir,
            r#"
[crawler]
db_path = "./swgraph.db"

[source]
base_url = "https://swapi.dev/api"

[seeds]
keys = ["films/1/", "/people/2", "https://mirror.local/api/planets/3/"]
"#,
        );
        let config = Config::from_file(&path).unwrap();
        assert_eq!(
            config.seed_keys().unwrap(),
            vec![
                "https://swapi.dev/api/films/1",
                "https://swapi.dev/api/people/2",
                "https://mirror.local/api/planets/3",
            ]
        );
    }

    #[test]
    fn test_rejects_tag_seed_kind() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(
            &temp_dir,
            &format!("{}\n[seeds]\nkind = \"Director\"\n", MINIMAL),
        );
        let err = Config::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("tag kind"));
    }

    #[test]
    fn test_rejects_unknown_seed_kind() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(&temp_dir, &format!("{}\n[seeds]\nkind = \"Droid\"\n", MINIMAL));
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn test_rejects_zero_attempts_and_workers() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(&temp_dir, &format!("{}\n[retry]\nmax_attempts = 0\n", MINIMAL));
        assert!(Config::from_file(&path).is_err());

        let path = write_config(&temp_dir, &format!("{}\n[workers]\ncount = 0\n", MINIMAL));
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn test_rejects_bad_base_url() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(
            &temp_dir,
            &format!("{}\n[source]\nbase_url = \"not a url\"\n", MINIMAL),
        );
        let err = Config::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn test_load_honours_env_path() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(&temp_dir, MINIMAL);
        let original = std::env::var("SWGRAPH_CONFIG").ok();
        std::env::set_var("SWGRAPH_CONFIG", &path);
        let config = Config::load();
        std::env::remove_var("SWGRAPH_CONFIG");
        if let Some(v) = original {
            std::env::set_var("SWGRAPH_CONFIG", v);
        }
        assert!(config.is_ok(), "Config::load() failed: {:?}", config.err());
    }

    #[test]
    fn test_config_invalid_path() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let original = std::env::var("SWGRAPH_CONFIG").ok();
        std::env::set_var("SWGRAPH_CONFIG", "nonexistent.toml");
        let config = Config::load();
        assert!(config.is_err());
        std::env::remove_var("SWGRAPH_CONFIG");
        if let Some(v) = original {
            std::env::set_var("SWGRAPH_CONFIG", v);
        }
    }
}
