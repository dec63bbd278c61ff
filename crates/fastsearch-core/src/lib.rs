use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub type Result<T> = anyhow::Result<T>;

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/fastsearch.sock";
pub const DEFAULT_PID_PATH: &str = "/tmp/fastsearch.pid";
pub const CONFIG_ENV_VAR: &str = "FASTSEARCH_CONFIG";

/// Embedding dimension of the default embedder (bge-base-en-v1.5).
pub const DEFAULT_EMBEDDING_DIM: usize = 768;

pub const DEFAULT_EMBEDDER_MODEL: &str = "BAAI/bge-base-en-v1.5";
pub const DEFAULT_RERANKER_MODEL: &str = "cross-encoder/ms-marco-MiniLM-L-6-v2";

/// Seconds since the Unix epoch as a float, the timestamp unit used on the
/// wire (`ping`, `status`) and in slot bookkeeping.
pub fn unix_time_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var_os("HOME").map_or_else(|| PathBuf::from("/"), PathBuf::from);
    home.join(".config").join("fastsearch").join("config.toml")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepLoaded {
    Always,
    OnDemand,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    Lru,
    Fifo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: String,
    pub pid_path: String,
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            pid_path: DEFAULT_PID_PATH.to_string(),
            log_level: "INFO".to_string(),
        }
    }
}

/// Configuration for a single model slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    #[serde(default = "ModelConfig::default_keep_loaded")]
    pub keep_loaded: KeepLoaded,
    #[serde(default = "ModelConfig::default_idle_timeout")]
    pub idle_timeout_seconds: u64,
}

impl ModelConfig {
    fn default_keep_loaded() -> KeepLoaded {
        KeepLoaded::OnDemand
    }

    fn default_idle_timeout() -> u64 {
        300
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_ram_mb: u64,
    pub eviction_policy: EvictionPolicy,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_ram_mb: 4000,
            eviction_policy: EvictionPolicy::Lru,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FastSearchConfig {
    pub daemon: DaemonConfig,
    pub models: BTreeMap<String, ModelConfig>,
    pub memory: MemoryConfig,
}

impl FastSearchConfig {
    /// Built-in defaults: pinned embedder, on-demand reranker.
    pub fn builtin() -> Self {
        let mut models = BTreeMap::new();
        models.insert(
            "embedder".to_string(),
            ModelConfig {
                name: DEFAULT_EMBEDDER_MODEL.to_string(),
                keep_loaded: KeepLoaded::Always,
                idle_timeout_seconds: 0,
            },
        );
        models.insert(
            "reranker".to_string(),
            ModelConfig {
                name: DEFAULT_RERANKER_MODEL.to_string(),
                keep_loaded: KeepLoaded::OnDemand,
                idle_timeout_seconds: 300,
            },
        );
        Self {
            daemon: DaemonConfig::default(),
            models,
            memory: MemoryConfig::default(),
        }
    }

    /// Load from a TOML file, merging over the built-in defaults.
    ///
    /// A missing file yields the defaults. Model slots from the file extend
    /// the default slot set rather than replacing it.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::builtin());
        }
        let raw = fs::read_to_string(path)?;
        let parsed: FastSearchConfig = toml::from_str(&raw)?;
        let mut cfg = Self::builtin();
        cfg.daemon = parsed.daemon;
        for (slot, model) in parsed.models {
            cfg.models.insert(slot, model);
        }
        cfg.memory = parsed.memory;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Resolve and load the configuration.
///
/// Priority: explicit path, then `FASTSEARCH_CONFIG`, then
/// `~/.config/fastsearch/config.toml`, then built-in defaults.
pub fn load_config(path: Option<&Path>) -> Result<FastSearchConfig> {
    if let Some(path) = path {
        return FastSearchConfig::from_file(path);
    }
    if let Some(env_path) = std::env::var_os(CONFIG_ENV_VAR) {
        return FastSearchConfig::from_file(Path::new(&env_path));
    }
    let default_path = default_config_path();
    if default_path.exists() {
        return FastSearchConfig::from_file(&default_path);
    }
    Ok(FastSearchConfig::builtin())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_config_registers_default_slots() {
        let cfg = FastSearchConfig::builtin();
        let embedder = cfg.models.get("embedder").unwrap();
        assert_eq!(embedder.keep_loaded, KeepLoaded::Always);
        assert_eq!(embedder.idle_timeout_seconds, 0);
        let reranker = cfg.models.get("reranker").unwrap();
        assert_eq!(reranker.keep_loaded, KeepLoaded::OnDemand);
        assert_eq!(reranker.idle_timeout_seconds, 300);
        assert_eq!(cfg.memory.max_ram_mb, 4000);
    }

    #[test]
    fn missing_file_falls_back_to_builtin() {
        let cfg = FastSearchConfig::from_file(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(cfg.daemon.socket_path, DEFAULT_SOCKET_PATH);
        assert!(cfg.models.contains_key("embedder"));
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[daemon]
socket_path = "/tmp/other.sock"

[models.reranker]
name = "custom/reranker"
keep_loaded = "never"
idle_timeout_seconds = 60

[memory]
max_ram_mb = 512
"#,
        )
        .unwrap();

        let cfg = FastSearchConfig::from_file(&path).unwrap();
        assert_eq!(cfg.daemon.socket_path, "/tmp/other.sock");
        // Untouched default slot survives the merge.
        assert_eq!(
            cfg.models.get("embedder").unwrap().keep_loaded,
            KeepLoaded::Always
        );
        let reranker = cfg.models.get("reranker").unwrap();
        assert_eq!(reranker.name, "custom/reranker");
        assert_eq!(reranker.keep_loaded, KeepLoaded::Never);
        assert_eq!(cfg.memory.max_ram_mb, 512);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let cfg = FastSearchConfig::builtin();
        cfg.save(&path).unwrap();
        let reloaded = FastSearchConfig::from_file(&path).unwrap();
        assert_eq!(reloaded.daemon.socket_path, cfg.daemon.socket_path);
        assert_eq!(reloaded.models.len(), cfg.models.len());
    }
}
