//! Provider settings persisted as a providers.json file.
//!
//! Credentials may reference the environment (`${VAR_NAME}`) instead of
//! embedding secrets in the file; references are resolved when the
//! active provider is handed out, never at load time, so the file can be
//! edited while the program runs.

use crate::types::{ApiError, ProviderSettings};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;

/// Read access to the configured providers as the completion engine
/// needs it.
pub trait ProviderStore: Send + Sync {
    /// The provider the next send should use, credentials resolved.
    fn active_provider(&self) -> Result<ProviderSettings>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    active: Option<String>,
    #[serde(default)]
    providers: Vec<ProviderSettings>,
}

/// File-backed registry of provider entries plus the active selection.
pub struct ProviderRegistry {
    path: PathBuf,
    state: Mutex<SettingsFile>,
}

impl ProviderRegistry {
    /// Loads providers.json from the first config directory that has
    /// one. A missing file yields an empty registry that will be created
    /// on the first save.
    pub fn load() -> Result<Self> {
        Self::load_from(default_settings_path())
    }

    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read provider settings: {}", path.display()))?;
            serde_json::from_str(&content).with_context(|| {
                format!("Failed to parse provider settings: {}", path.display())
            })?
        } else {
            debug!("No provider settings at {}, starting empty", path.display());
            SettingsFile::default()
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn save(&self) -> Result<()> {
        let state = self.state.lock().unwrap().clone();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create settings directory: {}", parent.display())
            })?;
        }
        let content = serde_json::to_string_pretty(&state)?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write provider settings: {}", self.path.display()))
    }

    /// Adds or replaces the entry with the same name.
    pub fn upsert(&self, provider: ProviderSettings) {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state
            .providers
            .iter_mut()
            .find(|entry| entry.name == provider.name)
        {
            *existing = provider;
        } else {
            state.providers.push(provider);
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let before = state.providers.len();
        state.providers.retain(|entry| entry.name != name);
        if state.active.as_deref() == Some(name) {
            state.active = None;
        }
        state.providers.len() != before
    }

    pub fn set_active(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.providers.iter().any(|entry| entry.name == name) {
            return Err(anyhow::anyhow!("Unknown provider: {}", name));
        }
        state.active = Some(name.to_string());
        Ok(())
    }

    /// All entries as stored, credentials unresolved.
    pub fn list(&self) -> Vec<ProviderSettings> {
        self.state.lock().unwrap().providers.clone()
    }

    pub fn active_name(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .active
            .clone()
            .or_else(|| state.providers.first().map(|entry| entry.name.clone()))
    }
}

impl ProviderStore for ProviderRegistry {
    fn active_provider(&self) -> Result<ProviderSettings> {
        let state = self.state.lock().unwrap();
        let entry = match &state.active {
            Some(name) => state
                .providers
                .iter()
                .find(|provider| &provider.name == name),
            None => state.providers.first(),
        };
        let entry = entry.ok_or_else(|| {
            ApiError::Configuration("no provider configured".to_string())
        })?;
        resolve_settings(entry)
    }
}

fn resolve_settings(entry: &ProviderSettings) -> Result<ProviderSettings> {
    Ok(ProviderSettings {
        name: entry.name.clone(),
        endpoint: substitute_env_vars(&entry.endpoint)
            .with_context(|| format!("Bad endpoint for provider {}", entry.name))?,
        api_key: substitute_env_vars(&entry.api_key)
            .with_context(|| format!("Bad api_key for provider {}", entry.name))?,
        model: substitute_env_vars(&entry.model)
            .with_context(|| format!("Bad model for provider {}", entry.name))?,
    })
}

/// Substitutes `${VAR_NAME}` patterns from the environment.
fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();

    while let Some(start) = result.find("${") {
        let end = result[start..]
            .find('}')
            .ok_or_else(|| anyhow::anyhow!("Unclosed environment variable substitution: {input}"))?;
        let end = start + end;

        let var_name = &result[start + 2..end];
        let var_value = std::env::var(var_name)
            .with_context(|| format!("Environment variable not set: {var_name}"))?;

        result.replace_range(start..=end, &var_value);
    }

    Ok(result)
}

fn default_settings_path() -> PathBuf {
    for dir in config_directories() {
        let candidate = dir.join("providers.json");
        if candidate.exists() {
            return candidate;
        }
    }
    config_directories()
        .into_iter()
        .next()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("providers.json")
}

/// Directories that may hold settings, ordered by priority.
fn config_directories() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if let Ok(custom_dir) = std::env::var("PAGECHAT_CONFIG_DIR") {
        push_unique_dir(&mut dirs, PathBuf::from(custom_dir));
    }
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        push_unique_dir(&mut dirs, PathBuf::from(xdg_config).join("pagechat"));
    }
    if let Some(home_dir) = dirs::home_dir() {
        push_unique_dir(&mut dirs, home_dir.join(".config").join("pagechat"));
    }
    if let Some(system_config) = dirs::config_dir() {
        push_unique_dir(&mut dirs, system_config.join("pagechat"));
    }

    if dirs.is_empty() {
        dirs.push(PathBuf::from("pagechat"));
    }

    dirs
}

fn push_unique_dir(dirs: &mut Vec<PathBuf>, candidate: PathBuf) {
    if !dirs.iter().any(|existing| existing == &candidate) {
        dirs.push(candidate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn sample(name: &str) -> ProviderSettings {
        ProviderSettings {
            name: name.to_string(),
            endpoint: "http://localhost:11434".to_string(),
            api_key: String::new(),
            model: "llama3.2".to_string(),
        }
    }

    #[test]
    fn test_env_var_substitution() {
        env::set_var("PAGECHAT_TEST_KEY", "secret");
        let result = substitute_env_vars("prefix_${PAGECHAT_TEST_KEY}_suffix").unwrap();
        assert_eq!(result, "prefix_secret_suffix");
        env::remove_var("PAGECHAT_TEST_KEY");
    }

    #[test]
    fn test_env_var_substitution_missing() {
        let result = substitute_env_vars("${PAGECHAT_TEST_NOT_SET}");
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("PAGECHAT_TEST_NOT_SET"));
    }

    #[test]
    fn test_env_var_substitution_unclosed() {
        let result = substitute_env_vars("${PAGECHAT_TEST_UNCLOSED");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Unclosed"));
    }

    #[test]
    fn test_active_provider_defaults_to_first() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProviderRegistry::load_from(dir.path().join("providers.json")).unwrap();
        registry.upsert(sample("local"));
        registry.upsert(sample("other"));

        let active = registry.active_provider().unwrap();
        assert_eq!(active.name, "local");

        registry.set_active("other").unwrap();
        assert_eq!(registry.active_provider().unwrap().name, "other");
    }

    #[test]
    fn test_active_provider_resolves_key_reference() {
        env::set_var("PAGECHAT_TEST_RESOLVED", "resolved-key");
        let dir = tempfile::tempdir().unwrap();
        let registry = ProviderRegistry::load_from(dir.path().join("providers.json")).unwrap();
        registry.upsert(ProviderSettings {
            name: "cloud".to_string(),
            endpoint: "https://api.anthropic.com".to_string(),
            api_key: "${PAGECHAT_TEST_RESOLVED}".to_string(),
            model: "claude-sonnet-4-0".to_string(),
        });

        let active = registry.active_provider().unwrap();
        assert_eq!(active.api_key, "resolved-key");
        // The stored entry keeps the reference.
        assert_eq!(registry.list()[0].api_key, "${PAGECHAT_TEST_RESOLVED}");
        env::remove_var("PAGECHAT_TEST_RESOLVED");
    }

    #[test]
    fn test_no_providers_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProviderRegistry::load_from(dir.path().join("providers.json")).unwrap();
        let error = registry.active_provider().unwrap_err();
        assert!(matches!(
            error.downcast_ref::<ApiError>(),
            Some(ApiError::Configuration(_))
        ));
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("providers.json");

        let registry = ProviderRegistry::load_from(&path).unwrap();
        registry.upsert(sample("local"));
        registry.set_active("local").unwrap();
        registry.save().unwrap();

        let reloaded = ProviderRegistry::load_from(&path).unwrap();
        assert_eq!(reloaded.active_name().as_deref(), Some("local"));
        assert_eq!(reloaded.list().len(), 1);
    }
}
