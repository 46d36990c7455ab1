use std::{
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::TokenwardConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "tokenward.toml",
    "tokenward.yaml",
    "tokenward.yml",
    "tokenward.json",
];

/// Default credential file name under the data directory.
const CREDENTIALS_FILENAME: &str = "oauth_credentials.json";

/// Override for the config directory, set via `set_config_dir()`.
static CONFIG_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Lock guarding config read-modify-write cycles.
static CONFIG_SAVE_LOCK: Mutex<()> = Mutex::new(());

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Set a custom config directory. When set, discovery only looks there.
pub fn set_config_dir(path: PathBuf) {
    *lock(&CONFIG_DIR_OVERRIDE) = Some(path);
}

/// Clear the config directory override, restoring default discovery.
pub fn clear_config_dir() {
    *lock(&CONFIG_DIR_OVERRIDE) = None;
}

fn config_dir_override() -> Option<PathBuf> {
    lock(&CONFIG_DIR_OVERRIDE).clone()
}

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<TokenwardConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Load an explicit config file, or fall back to discovery when `path` is `None`.
pub fn load_or_discover(path: Option<&Path>) -> anyhow::Result<TokenwardConfig> {
    match path {
        Some(path) => load_config(path),
        None => Ok(discover_and_load()),
    }
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./tokenward.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/tokenward/tokenward.{toml,yaml,yml,json}` (user-global)
///
/// Returns `TokenwardConfig::default()` if no config file is found, and
/// writes that default to the user-global path.
pub fn discover_and_load() -> TokenwardConfig {
    let Some(path) = find_config_file() else {
        debug!("no config file found, writing default config");
        let config = TokenwardConfig::default();
        if let Err(e) = write_default_config(&config) {
            warn!(error = %e, "failed to write default config file");
        }
        return config;
    };

    debug!(path = %path.display(), "loading config");
    load_config(&path).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
        TokenwardConfig::default()
    })
}

fn find_in(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Find the first config file in standard locations.
fn find_config_file() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        // Override is set: don't fall through to other locations.
        return find_in(&dir);
    }

    find_in(Path::new(".")).or_else(|| user_config_dir().and_then(|dir| find_in(&dir)))
}

fn user_config_dir() -> Option<PathBuf> {
    home_dir().map(|h| h.join(".config").join("tokenward"))
}

/// Returns the config directory: override, or `~/.config/tokenward/`.
pub fn config_dir() -> Option<PathBuf> {
    config_dir_override().or_else(user_config_dir)
}

/// Returns the data directory: `~/.tokenward/`.
pub fn data_dir() -> PathBuf {
    home_dir()
        .map(|h| h.join(".tokenward"))
        .unwrap_or_else(|| PathBuf::from(".tokenward"))
}

/// Credential file path: `store.path` if configured, else under [`data_dir`].
pub fn credential_store_path(config: &TokenwardConfig) -> PathBuf {
    config
        .store
        .path
        .clone()
        .unwrap_or_else(|| data_dir().join(CREDENTIALS_FILENAME))
}

fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}

/// Returns the path of an existing config file, or the default TOML path.
pub fn find_or_default_config_path() -> PathBuf {
    if let Some(path) = find_config_file() {
        return path;
    }
    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tokenward.toml")
}

/// Atomically load the current config, apply `f`, and save.
///
/// Returns the path written to.
pub fn update_config(f: impl FnOnce(&mut TokenwardConfig)) -> anyhow::Result<PathBuf> {
    let _guard = lock(&CONFIG_SAVE_LOCK);
    let mut config = discover_and_load();
    f(&mut config);
    save_config_to(&config, &find_or_default_config_path())
}

/// Serialize `config` and write it to `path`, picking the format from the extension.
///
/// Prefer [`update_config`] for read-modify-write cycles on the discovered file.
pub fn save_config_to(config: &TokenwardConfig, path: &Path) -> anyhow::Result<PathBuf> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let raw = render_config(config, path)?;
    std::fs::write(path, raw)?;
    debug!(path = %path.display(), "saved config");
    Ok(path.to_path_buf())
}

/// Only called when no config file exists yet.
fn write_default_config(config: &TokenwardConfig) -> anyhow::Result<()> {
    let path = find_or_default_config_path();
    if path.exists() {
        return Ok(());
    }
    save_config_to(config, &path)?;
    Ok(())
}

fn extension(path: &Path) -> &str {
    path.extension().and_then(|e| e.to_str()).unwrap_or("toml")
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<TokenwardConfig> {
    match extension(path) {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        ext => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

fn render_config(config: &TokenwardConfig, path: &Path) -> anyhow::Result<String> {
    match extension(path) {
        "toml" => toml::to_string_pretty(config)
            .map_err(|e| anyhow::anyhow!("serialize config: {e}")),
        "yaml" | "yml" => Ok(serde_yaml::to_string(config)?),
        "json" => Ok(serde_json::to_string_pretty(config)?),
        ext => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[cfg(test)]
mod tests {
    use {super::*, tempfile::TempDir};

    #[test]
    fn load_toml_yaml_and_json() {
        let dir = TempDir::new().unwrap();

        let toml_path = dir.path().join("tokenward.toml");
        std::fs::write(&toml_path, "[manager]\nexpiry_skew_secs = 12\n").unwrap();
        assert_eq!(load_config(&toml_path).unwrap().manager.expiry_skew_secs, 12);

        let yaml_path = dir.path().join("tokenward.yaml");
        std::fs::write(&yaml_path, "manager:\n  save_attempts: 7\n").unwrap();
        assert_eq!(load_config(&yaml_path).unwrap().manager.save_attempts, 7);

        let json_path = dir.path().join("tokenward.json");
        std::fs::write(&json_path, r#"{"retry":{"max_attempts":1}}"#).unwrap();
        assert_eq!(load_config(&json_path).unwrap().retry.max_attempts, 1);
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokenward.ini");
        std::fs::write(&path, "x=1").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported config format"));
    }

    #[test]
    fn env_fallback_is_applied_before_parsing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokenward.toml");
        std::fs::write(
            &path,
            "[manager]\nrefresh_timeout_secs = ${TOKENWARD_TEST_UNSET_TIMEOUT:-45}\n",
        )
        .unwrap();
        assert_eq!(load_config(&path).unwrap().manager.refresh_timeout_secs, 45);
    }

    #[test]
    fn save_then_load_keeps_settings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("tokenward.toml");
        let mut config = TokenwardConfig::default();
        config.manager.expiry_skew_secs = 99;
        config.store.path = Some(dir.path().join("creds.json"));

        save_config_to(&config, &path).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.manager.expiry_skew_secs, 99);
        assert_eq!(credential_store_path(&loaded), dir.path().join("creds.json"));
    }

    #[test]
    fn default_credential_path_is_under_data_dir() {
        let config = TokenwardConfig::default();
        assert_eq!(
            credential_store_path(&config),
            data_dir().join("oauth_credentials.json")
        );
    }

    #[test]
    fn explicit_path_bypasses_discovery() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.json");
        std::fs::write(&path, r#"{"manager":{"save_attempts":2}}"#).unwrap();
        let cfg = load_or_discover(Some(&path)).unwrap();
        assert_eq!(cfg.manager.save_attempts, 2);
    }
}
