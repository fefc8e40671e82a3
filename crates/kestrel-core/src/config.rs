use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use kestrel_providers::{ProviderConfig, ProvidersConfig};
use kestrel_tools::ShellLimits;

use crate::TurnSettings;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ProviderSettings {
    pub id: Option<String>,
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShellConfig {
    pub default_timeout_secs: u64,
    pub max_timeout_secs: u64,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 120,
            max_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct JobsConfig {
    pub root: Option<PathBuf>,
    pub bin_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub retention_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { retention_days: 14 }
    }
}

/// Effective configuration after all layers are merged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub provider: ProviderSettings,
    pub temperature: Option<f32>,
    pub thinking: bool,
    pub force_deep_reasoning: bool,
    pub plan_only: bool,
    pub max_rounds: usize,
    pub system_prompt: Option<String>,
    pub shell: ShellConfig,
    pub jobs: JobsConfig,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: ProviderSettings::default(),
            temperature: None,
            thinking: false,
            force_deep_reasoning: false,
            plan_only: false,
            max_rounds: 50,
            system_prompt: None,
            shell: ShellConfig::default(),
            jobs: JobsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn provider_id(&self) -> &str {
        self.provider
            .id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or("openai")
    }

    pub fn providers_config(&self) -> ProvidersConfig {
        let id = self.provider_id().to_string();
        let mut providers = HashMap::new();
        providers.insert(
            id.clone(),
            ProviderConfig {
                api_key: self.provider.api_key.clone(),
                url: self.provider.url.clone(),
                default_model: self.provider.model.clone(),
            },
        );
        ProvidersConfig {
            providers,
            default_provider: Some(id),
        }
    }

    pub fn shell_limits(&self) -> ShellLimits {
        let max = self.shell.max_timeout_secs.max(1);
        ShellLimits {
            default_timeout: Duration::from_secs(self.shell.default_timeout_secs.clamp(1, max)),
            max_timeout: Duration::from_secs(max),
        }
    }

    pub fn turn_settings(&self) -> TurnSettings {
        TurnSettings {
            model: self.provider.model.clone(),
            temperature: self.temperature,
            thinking: self.thinking,
            force_deep_reasoning: self.force_deep_reasoning,
            plan_only: self.plan_only,
            max_rounds: self.max_rounds.max(1),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    cli: Value,
}

/// Layered JSON configuration: global file, project file, environment and
/// command-line overrides, later layers winning key by key.
#[derive(Clone)]
pub struct ConfigStore {
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(
        project_path: impl AsRef<Path>,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let global_path = resolve_global_config_path();
        Self::with_layers(
            global_path.as_deref(),
            project_path.as_ref(),
            env_layer(|key| std::env::var(key).ok()),
            cli_overrides,
        )
        .await
    }

    pub async fn with_layers(
        global_path: Option<&Path>,
        project_path: &Path,
        env: Value,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let global = match global_path {
            Some(path) => read_json_file(path).await?,
            None => empty_object(),
        };
        let project = read_json_file(project_path).await?;
        Ok(Self {
            layers: Arc::new(RwLock::new(ConfigLayers {
                global,
                project,
                env,
                cli: cli_overrides.unwrap_or_else(empty_object),
            })),
        })
    }

    pub async fn get(&self) -> EngineConfig {
        let merged = self.get_effective_value().await;
        serde_json::from_value(merged).unwrap_or_else(|err| {
            tracing::warn!("invalid configuration, using defaults: {err}");
            EngineConfig::default()
        })
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|err| {
        tracing::warn!("ignoring unreadable config {}: {err}", path.display());
        empty_object()
    }))
}

fn resolve_global_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("KESTREL_GLOBAL_CONFIG") {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    dirs::config_dir().map(|dir| dir.join("kestrel").join("config.json"))
}

/// `--state-dir` flag, then `KESTREL_STATE_DIR`, then the platform data dir.
pub fn resolve_state_dir(flag: Option<&Path>) -> PathBuf {
    if let Some(dir) = flag {
        return dir.to_path_buf();
    }
    if let Ok(dir) = std::env::var("KESTREL_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_dir()
        .map(|dir| dir.join("kestrel"))
        .unwrap_or_else(|| PathBuf::from(".kestrel"))
}

pub fn env_layer(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let mut root = empty_object();

    if let Some(id) = get("KESTREL_PROVIDER") {
        deep_merge(&mut root, &json!({"provider": {"id": id}}));
    }
    if let Some(model) = get("KESTREL_MODEL") {
        deep_merge(&mut root, &json!({"provider": {"model": model}}));
    }
    if let Some(url) = get("KESTREL_BASE_URL") {
        deep_merge(&mut root, &json!({"provider": {"url": url}}));
    }
    if let Some(key) = get("KESTREL_API_KEY").or_else(|| get("OPENAI_API_KEY")) {
        deep_merge(&mut root, &json!({"provider": {"api_key": key}}));
    }
    if let Some(enabled) = get("KESTREL_PLAN_ONLY").and_then(|v| parse_bool_like(&v)) {
        deep_merge(&mut root, &json!({"plan_only": enabled}));
    }
    root
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_merge_overrides_leaves_and_keeps_siblings() {
        let mut base = json!({"provider": {"id": "openai", "model": "a"}, "max_rounds": 10});
        deep_merge(
            &mut base,
            &json!({"provider": {"model": "b", "url": null}, "plan_only": true}),
        );
        assert_eq!(
            base,
            json!({"provider": {"id": "openai", "model": "b"}, "max_rounds": 10, "plan_only": true})
        );
    }

    #[test]
    fn env_layer_reads_known_variables() {
        let env = env_layer(|key| match key {
            "KESTREL_MODEL" => Some("gpt-x".to_string()),
            "OPENAI_API_KEY" => Some("sk-1".to_string()),
            "KESTREL_PLAN_ONLY" => Some("yes".to_string()),
            "KESTREL_PROVIDER" => Some("   ".to_string()),
            _ => None,
        });
        assert_eq!(
            env,
            json!({"provider": {"model": "gpt-x", "api_key": "sk-1"}, "plan_only": true})
        );
    }

    #[tokio::test]
    async fn layers_merge_in_order_over_a_missing_project_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let global = dir.path().join("global.json");
        let project = dir.path().join("project").join("config.json");
        std::fs::write(&global, r#"{"max_rounds": 7, "provider": {"id": "groq"}}"#).expect("seed");

        let store = ConfigStore::with_layers(
            Some(&global),
            &project,
            json!({"provider": {"api_key": "sk-env"}}),
            Some(json!({"plan_only": true})),
        )
        .await
        .expect("store");
        let config = store.get().await;
        assert_eq!(config.max_rounds, 7);
        assert_eq!(config.provider_id(), "groq");
        assert!(config.plan_only);
        assert_eq!(config.shell, ShellConfig::default());
        assert_eq!(config.providers_config().providers["groq"].api_key.as_deref(), Some("sk-env"));
        assert!(!project.exists());
    }

    #[test]
    fn derived_settings_respect_bounds() {
        let mut config = EngineConfig::default();
        config.shell.default_timeout_secs = 900;
        config.max_rounds = 0;
        let limits = config.shell_limits();
        assert_eq!(limits.default_timeout, Duration::from_secs(600));
        assert_eq!(config.turn_settings().max_rounds, 1);
        let providers = config.providers_config();
        assert_eq!(providers.default_provider.as_deref(), Some("openai"));
        assert!(providers.providers.contains_key("openai"));
    }
}
