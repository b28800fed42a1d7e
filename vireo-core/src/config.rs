use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agent::AgentSettings;
use crate::mcp::McpServerConfig;
use crate::tools::BrowserTool;

const CONFIG_FILE: &str = "assistant.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("no configuration directory available")]
    NoConfigDir,
}

/// An OpenAI-compatible endpoint and the models it offers.
#[derive(Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub models: Vec<String>,
    pub default_model: Option<String>,
}

// Keeps keys out of logs.
impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("models", &self.models)
            .field("default_model", &self.default_model)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationSettings {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub max_iterations: usize,
    pub request_timeout_secs: u64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        GenerationSettings {
            temperature: 0.7,
            max_tokens: None,
            max_iterations: crate::agent::DEFAULT_MAX_ITERATIONS,
            request_timeout_secs: crate::agent::DEFAULT_PROVIDER_TIMEOUT.as_secs(),
        }
    }
}

/// Assistant settings, persisted to `<config dir>/vireo/assistant.json`.
///
/// `#[serde(default)]` lets files written by older versions load after new
/// fields are added.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AssistantConfig {
    // ── Providers ────────────────────────────────────────────────────────
    pub providers: Vec<ProviderConfig>,
    pub active_provider: Option<String>,
    pub active_model: Option<String>,

    // ── Generation ───────────────────────────────────────────────────────
    pub system_prompt: Option<String>,
    pub generation: GenerationSettings,

    // ── Tools ────────────────────────────────────────────────────────────
    pub enabled_tools: Vec<BrowserTool>,
    pub mcp_servers: Vec<McpServerConfig>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        AssistantConfig {
            providers: Vec::new(),
            active_provider: None,
            active_model: None,

            system_prompt: None,
            generation: GenerationSettings::default(),

            enabled_tools: BrowserTool::ALL.to_vec(),
            mcp_servers: Vec::new(),
        }
    }
}

impl AssistantConfig {
    /// The active provider, falling back to the first configured one.
    pub fn provider(&self) -> Option<&ProviderConfig> {
        self.active_provider
            .as_deref()
            .and_then(|id| self.providers.iter().find(|p| p.id == id))
            .or_else(|| self.providers.first())
    }

    pub fn model(&self) -> Option<String> {
        if let Some(model) = self.active_model.as_ref().filter(|m| !m.is_empty()) {
            return Some(model.clone());
        }
        let provider = self.provider()?;
        provider
            .default_model
            .clone()
            .or_else(|| provider.models.first().cloned())
    }

    pub fn agent_settings(&self) -> AgentSettings {
        let defaults = AgentSettings::default();
        AgentSettings {
            system_prompt: self.system_prompt.clone().unwrap_or(defaults.system_prompt),
            model: self.model().unwrap_or_default(),
            temperature: self.generation.temperature,
            max_tokens: self.generation.max_tokens,
            max_iterations: self
                .generation
                .max_iterations
                .clamp(1, crate::agent::DEFAULT_MAX_ITERATIONS),
            provider_timeout: Duration::from_secs(self.generation.request_timeout_secs.max(1)),
            enabled_tools: self.enabled_tools.clone(),
        }
    }
}

/// `$XDG_CONFIG_HOME/vireo/assistant.json`, else the platform config dir.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::config_dir)
        .ok_or(ConfigError::NoConfigDir)?;
    Ok(base.join("vireo").join(CONFIG_FILE))
}

fn write_atomic(path: &Path, config: &AssistantConfig) -> Result<(), ConfigError> {
    let json = serde_json::to_string_pretty(config).map_err(ConfigError::Serialize)?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(json.as_bytes())?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| ConfigError::Io(e.error))?;
    Ok(())
}

/// The loaded config plus where it lives. Every change is written back
/// atomically.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    config: AssistantConfig,
}

impl ConfigStore {
    pub fn open_default() -> Result<Self, ConfigError> {
        Ok(Self::load_or_default(default_config_path()?))
    }

    /// A missing file yields defaults; an unreadable or invalid one is an error.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AssistantConfig::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, config })
    }

    pub fn load_or_default(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::load(path.clone()) {
            Ok(store) => store,
            Err(e) => {
                log::warn!("Using default assistant config: {}", e);
                Self {
                    path,
                    config: AssistantConfig::default(),
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &AssistantConfig {
        &self.config
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        write_atomic(&self.path, &self.config)
    }

    /// Apply `change` and rewrite the file. The in-memory config only
    /// changes if the write succeeds.
    pub fn update<F>(&mut self, change: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut AssistantConfig),
    {
        let mut next = self.config.clone();
        change(&mut next);
        write_atomic(&self.path, &next)?;
        self.config = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::McpTransportConfig;
    use std::collections::HashMap;

    fn provider() -> ProviderConfig {
        ProviderConfig {
            id: "local".into(),
            name: "Local".into(),
            base_url: "http://localhost:11434/v1".into(),
            api_key: Some("sk-secret".into()),
            models: vec!["llama3".into(), "qwen".into()],
            default_model: None,
        }
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("assistant.json")).unwrap();
        assert_eq!(*store.config(), AssistantConfig::default());
        assert_eq!(store.config().enabled_tools.len(), BrowserTool::ALL.len());
    }

    #[test]
    fn update_writes_atomically_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("assistant.json");
        let mut store = ConfigStore::load(&path).unwrap();
        store
            .update(|c| {
                c.providers.push(provider());
                c.mcp_servers.push(McpServerConfig {
                    id: "fs".into(),
                    name: "Files".into(),
                    enabled: true,
                    transport: McpTransportConfig::Stdio {
                        command: "mcp-fs".into(),
                        args: vec!["--root".into(), "/tmp".into()],
                        env: HashMap::new(),
                    },
                });
                c.generation.max_iterations = 5;
            })
            .unwrap();

        let reloaded = ConfigStore::load(&path).unwrap();
        assert_eq!(reloaded.config(), store.config());
        // Only the target file remains; the temp file was renamed over it.
        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn invalid_file_is_an_error_or_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assistant.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(ConfigStore::load(&path), Err(ConfigError::Parse { .. })));
        let store = ConfigStore::load_or_default(&path);
        assert_eq!(*store.config(), AssistantConfig::default());
    }

    #[test]
    fn older_files_fill_in_new_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assistant.json");
        std::fs::write(
            &path,
            r#"{"providers":[{"id":"p","base_url":"https://api.example.com/v1"}],"generation":{"temperature":0.1}}"#,
        )
        .unwrap();
        let config = ConfigStore::load(&path).unwrap().config().clone();
        assert_eq!(config.providers[0].id, "p");
        assert!(config.providers[0].api_key.is_none());
        assert_eq!(config.generation.temperature, 0.1);
        assert_eq!(config.generation.max_iterations, 20);
        assert!(config.mcp_servers.is_empty());
    }

    #[test]
    fn model_selection_and_agent_settings() {
        let mut config = AssistantConfig {
            providers: vec![provider()],
            ..AssistantConfig::default()
        };
        assert_eq!(config.model().as_deref(), Some("llama3"));
        config.providers[0].default_model = Some("qwen".into());
        assert_eq!(config.model().as_deref(), Some("qwen"));
        config.active_model = Some("custom".into());

        let settings = config.agent_settings();
        assert_eq!(settings.model, "custom");
        assert_eq!(settings.max_iterations, 20);
        assert_eq!(settings.provider_timeout, Duration::from_secs(120));
        assert!(!settings.system_prompt.is_empty());

        config.active_provider = Some("missing".into());
        assert_eq!(config.provider().map(|p| p.id.as_str()), Some("local"));
    }

    #[test]
    fn iteration_cap_from_file_cannot_exceed_the_hard_limit() {
        let mut config = AssistantConfig::default();
        config.generation.max_iterations = 100_000;
        assert_eq!(config.agent_settings().max_iterations, 20);
        config.generation.max_iterations = 0;
        assert_eq!(config.agent_settings().max_iterations, 1);
        config.generation.max_iterations = 5;
        assert_eq!(config.agent_settings().max_iterations, 5);
    }

    #[test]
    fn debug_output_hides_api_keys() {
        let rendered = format!("{:?}", provider());
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
