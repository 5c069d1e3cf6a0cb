//! Layered JSON configuration: file < environment < CLI overrides.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use cadence_providers::BackendConfig;
use cadence_types::PollingConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    pub logs_dir: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    cli: Value,
}

#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = read_json_file(&path).await?;
        let layers = ConfigLayers {
            file,
            env: env_layer(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self {
            path,
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
        deep_merge(&mut merged, &layers.file);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn reload(&self) -> anyhow::Result<()> {
        let file = read_json_file(&self.path).await?;
        self.layers.write().await.file = file;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
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
    let value: Value = serde_json::from_str(&raw)
        .map_err(|err| anyhow::anyhow!("invalid JSON in {}: {err}", path.display()))?;
    Ok(value)
}

fn env_layer() -> Value {
    let mut root = empty_object();

    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        if !key.trim().is_empty() {
            deep_merge(&mut root, &json!({ "backend": { "api_key": key } }));
        }
    }
    if let Ok(url) = std::env::var("CADENCE_BASE_URL") {
        if !url.trim().is_empty() {
            deep_merge(&mut root, &json!({ "backend": { "url": url } }));
        }
    }
    if let Ok(assistant) = std::env::var("CADENCE_ASSISTANT_ID") {
        if !assistant.trim().is_empty() {
            deep_merge(&mut root, &json!({ "backend": { "assistant_id": assistant } }));
        }
    }
    if let Ok(model) = std::env::var("CADENCE_MODEL") {
        if !model.trim().is_empty() {
            deep_merge(&mut root, &json!({ "backend": { "default_model": model } }));
        }
    }
    if let Ok(dir) = std::env::var("CADENCE_LOGS_DIR") {
        if !dir.trim().is_empty() {
            deep_merge(&mut root, &json!({ "logs_dir": dir }));
        }
    }

    root
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_merge_overlays_nested_keys_and_skips_nulls() {
        let mut base = json!({ "backend": { "url": "http://a", "api_key": "k1" } });
        let overlay = json!({ "backend": { "url": "http://b", "api_key": null }, "logs_dir": "logs" });
        deep_merge(&mut base, &overlay);
        assert_eq!(base["backend"]["url"], "http://b");
        assert_eq!(base["backend"]["api_key"], "k1");
        assert_eq!(base["logs_dir"], "logs");
    }

    #[tokio::test]
    async fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::new(dir.path().join("config.json"), None)
            .await
            .expect("store");
        let config = store.get().await;
        assert_eq!(config.polling.max_attempts, 80);
        assert!(config.backend.api_key.is_none() || std::env::var("OPENAI_API_KEY").is_ok());
    }

    #[tokio::test]
    async fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").expect("write");
        let err = ConfigStore::new(&path, None).await.err().expect("error");
        assert!(err.to_string().contains("invalid JSON"));
    }

    #[tokio::test]
    async fn cli_overrides_beat_file_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "backend": { "assistant_id": "asst_file" }, "polling": { "timeout_ms": 10000 } }"#,
        )
        .expect("write");

        let overrides = json!({ "backend": { "assistant_id": "asst_cli" } });
        let store = ConfigStore::new(&path, Some(overrides)).await.expect("store");
        let config = store.get().await;
        assert_eq!(config.backend.assistant_id.as_deref(), Some("asst_cli"));
        assert_eq!(config.polling.timeout_ms, 10_000);
        assert_eq!(config.polling.max_attempts, 80);
    }

    #[tokio::test]
    async fn reload_picks_up_file_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "logs_dir": "a" }"#).expect("write");
        let store = ConfigStore::new(&path, None).await.expect("store");
        assert_eq!(store.get().await.logs_dir.as_deref(), Some("a"));

        std::fs::write(&path, r#"{ "logs_dir": "b" }"#).expect("write");
        store.reload().await.expect("reload");
        assert_eq!(store.get().await.logs_dir.as_deref(), Some("b"));
    }
}
