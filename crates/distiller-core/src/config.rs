use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use distiller_providers::{ProviderConfig, DEFAULT_MODEL};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use crate::PromptHistory;

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const MAX_TEMPERATURE: f32 = 2.0;

pub fn default_seed_prompt() -> &'static str {
    include_str!("default_prompt.md").trim()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub jitter_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub seed_prompt: Option<String>,
    /// Only ever present in the env, runtime or cli layers.
    pub api_key: Option<String>,
    #[serde(default)]
    pub prompt_history: Vec<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl AppConfig {
    pub fn effective_model(&self) -> String {
        self.model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_MODEL)
            .to_string()
    }

    pub fn effective_temperature(&self) -> f32 {
        clamp_temperature(self.temperature.unwrap_or(DEFAULT_TEMPERATURE))
    }

    pub fn effective_seed_prompt(&self) -> String {
        self.seed_prompt
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(default_seed_prompt())
            .to_string()
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            credential: self
                .api_key
                .as_deref()
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string),
            model: self.effective_model(),
            temperature: self.effective_temperature(),
            seed_prompt: self.effective_seed_prompt(),
        }
    }
}

pub fn clamp_temperature(value: f32) -> f32 {
    if value.is_nan() {
        return DEFAULT_TEMPERATURE;
    }
    value.clamp(0.0, MAX_TEMPERATURE)
}

/// Immutable per-run copy of the settings a job reads at Start.
#[derive(Clone, PartialEq)]
pub struct RunSettings {
    pub credential: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub seed_prompt: String,
}

impl Default for RunSettings {
    fn default() -> Self {
        AppConfig::default().run_settings()
    }
}

impl std::fmt::Debug for RunSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunSettings")
            .field("credential", &self.credential.as_ref().map(|_| "[set]"))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("seed_prompt_len", &self.seed_prompt.len())
            .finish()
    }
}

/// Key-value collaborator that supplies settings at Start and keeps the
/// prompt history.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn snapshot(&self) -> anyhow::Result<RunSettings>;
    async fn record_prompt(&self, prompt: &str) -> anyhow::Result<()>;
}

/// In-process settings, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySettings {
    settings: RwLock<RunSettings>,
    history: RwLock<PromptHistory>,
}

impl MemorySettings {
    pub fn new(settings: RunSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
            history: RwLock::new(PromptHistory::default()),
        }
    }

    pub async fn update(&self, f: impl FnOnce(&mut RunSettings)) {
        let mut settings = self.settings.write().await;
        f(&mut settings);
    }

    pub async fn history(&self) -> PromptHistory {
        self.history.read().await.clone()
    }
}

#[async_trait]
impl SettingsStore for MemorySettings {
    async fn snapshot(&self) -> anyhow::Result<RunSettings> {
        Ok(self.settings.read().await.clone())
    }

    async fn record_prompt(&self, prompt: &str) -> anyhow::Result<()> {
        self.history.write().await.record(prompt);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    runtime: Value,
    cli: Value,
}

#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    global_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let global_path = resolve_global_config_path().await?;
        Self::with_global_path(path, global_path, cli_overrides).await
    }

    pub async fn with_global_path(
        path: impl AsRef<Path>,
        global_path: impl AsRef<Path>,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let project_path = path.as_ref().to_path_buf();
        let global_path = global_path.as_ref().to_path_buf();
        if let Some(parent) = project_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut global = read_json_file(&global_path)
            .await
            .unwrap_or_else(|_| empty_object());
        let mut project = read_json_file(&project_path)
            .await
            .unwrap_or_else(|_| empty_object());

        scrub_persisted_secrets(&mut global, &global_path).await?;
        scrub_persisted_secrets(&mut project, &project_path).await?;

        let layers = ConfigLayers {
            global,
            project,
            env: env_layer(),
            runtime: empty_object(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };

        Ok(Self {
            project_path,
            global_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> AppConfig {
        let merged = self.get_effective_value().await;
        serde_json::from_value(merged).unwrap_or_default()
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    /// Effective config with secrets masked, for display.
    pub async fn get_redacted_value(&self) -> Value {
        let mut value = self.get_effective_value().await;
        if let Some(root) = value.as_object_mut() {
            for key in ["api_key", "apiKey"] {
                if root.contains_key(key) {
                    root.insert(key.to_string(), Value::String("********".to_string()));
                }
            }
        }
        value
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "global": layers.global,
            "project": layers.project,
            "env": layers.env,
            "runtime": layers.runtime,
            "cli": layers.cli
        })
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        self.save_project().await?;
        Ok(self.get_effective_value().await)
    }

    pub async fn patch_global(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.global, &patch);
        }
        self.save_global().await?;
        Ok(self.get_effective_value().await)
    }

    /// Never written to disk.
    pub async fn patch_runtime(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.runtime, &patch);
        }
        Ok(self.get_effective_value().await)
    }

    pub async fn prompt_history(&self) -> PromptHistory {
        PromptHistory::from_entries(self.get().await.prompt_history)
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.project.clone();
        write_json_file(&self.project_path, &snapshot).await
    }

    async fn save_global(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.global.clone();
        write_json_file(&self.global_path, &snapshot).await
    }
}

#[async_trait]
impl SettingsStore for ConfigStore {
    async fn snapshot(&self) -> anyhow::Result<RunSettings> {
        Ok(self.get().await.run_settings())
    }

    async fn record_prompt(&self, prompt: &str) -> anyhow::Result<()> {
        let mut history = self.prompt_history().await;
        if !history.record(prompt) {
            return Ok(());
        }
        self.patch_global(json!({ "prompt_history": history.into_entries() }))
            .await?;
        Ok(())
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut to_write = value.clone();
    strip_persisted_secrets(&mut to_write);
    let raw = serde_json::to_string_pretty(&to_write)?;
    fs::write(path, raw).await?;
    Ok(())
}

fn strip_persisted_secrets(value: &mut Value) {
    let Value::Object(root) = value else {
        return;
    };
    root.remove("api_key");
    root.remove("apiKey");
    if let Some(provider) = root.get_mut("provider").and_then(|v| v.as_object_mut()) {
        provider.remove("api_key");
        provider.remove("apiKey");
    }
}

async fn scrub_persisted_secrets(value: &mut Value, path: &Path) -> anyhow::Result<()> {
    let before = value.clone();
    strip_persisted_secrets(value);
    if *value != before {
        tracing::warn!(path = %path.display(), "removed API key from persisted config");
        write_json_file(path, value).await?;
    }
    Ok(())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()))
}

async fn resolve_global_config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("DISTILLER_GLOBAL_CONFIG") {
        let path = PathBuf::from(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        return Ok(path);
    }
    if let Some(config_dir) = dirs::config_dir() {
        let path = config_dir.join("distiller").join("config.json");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        return Ok(path);
    }
    Ok(PathBuf::from(".distiller/global_config.json"))
}

fn env_layer() -> Value {
    let mut root = empty_object();

    if let Some(provider) = non_empty_env("DISTILLER_PROVIDER") {
        deep_merge(&mut root, &json!({ "provider": { "id": provider } }));
    }
    if let Some(model) = non_empty_env("DISTILLER_MODEL") {
        deep_merge(&mut root, &json!({ "model": model }));
    }
    if let Some(raw) = non_empty_env("DISTILLER_TEMPERATURE") {
        match raw.parse::<f32>() {
            Ok(value) => deep_merge(&mut root, &json!({ "temperature": value })),
            Err(_) => tracing::warn!(value = %raw, "ignoring unparseable DISTILLER_TEMPERATURE"),
        }
    }
    if let Some(key) = non_empty_env("DISTILLER_API_KEY").or_else(|| non_empty_env("GEMINI_API_KEY"))
    {
        deep_merge(&mut root, &json!({ "api_key": key }));
    }

    root
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn deep_merge(base: &mut Value, overlay: &Value) {
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
