use crate::codeship::auth::Credentials;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const ENV_FILE: &str = ".env";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub codeship: CodeshipConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CodeshipConfig {
    pub api_base: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout() -> u64 { 10_000 }

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Refresh interval used until the user stores one. 0 disables polling.
    #[serde(default = "default_refresh_interval")]
    pub default_refresh_interval_s: u64,
}

fn default_refresh_interval() -> u64 { 60 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_refresh_interval_s: default_refresh_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_settings_path")]
    pub settings_path: PathBuf,
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
}

fn default_settings_path() -> PathBuf { PathBuf::from("harbor-settings.toml") }
fn default_credentials_path() -> PathBuf { PathBuf::from(".harbor-credentials") }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            settings_path: default_settings_path(),
            credentials_path: default_credentials_path(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .with_context(|| "Failed to parse config TOML")?;
        Ok(config)
    }

    /// Load .env file into process environment. Real env vars take precedence.
    pub fn load_env_file() {
        let path = Path::new(ENV_FILE);
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return,
        };
        for (key, value) in parse_env_lines(&content) {
            if std::env::var(&key).is_err() {
                std::env::set_var(key, value);
            }
        }
    }

    /// Credentials supplied through the environment, if any.
    /// `HARBOR_API_KEY` wins over `HARBOR_EMAIL` + `HARBOR_PASSWORD`.
    pub fn credentials_from_env() -> Option<Credentials> {
        if let Some(key) = non_empty_var("HARBOR_API_KEY") {
            return Some(Credentials::ApiKey { key });
        }
        let email = non_empty_var("HARBOR_EMAIL")?;
        let password = non_empty_var("HARBOR_PASSWORD")?;
        Some(Credentials::Password { email, password })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(sanitize_key(&value)),
        _ => None,
    }
}

/// Parse KEY=VALUE lines, skipping blanks and `#` comments.
pub(crate) fn parse_env_lines(content: &str) -> Vec<(String, String)> {
    // Strip BOM if present (common on Windows-created files)
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut out = Vec::new();
    for line in content.lines() {
        let line = line.trim().trim_matches('\r');
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"').trim_matches('\'');
            out.push((key.to_string(), value.to_string()));
        }
    }
    out
}

/// Ask for a value on stdin. Empty input is an error.
pub fn prompt(label: &str) -> Result<String> {
    print!("  {} > ", label);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let value = input.trim().to_string();
    if value.is_empty() {
        anyhow::bail!("{} cannot be empty", label);
    }
    Ok(value)
}

/// Strip carriage returns, BOM, and other invisible chars from a key/path value.
fn sanitize_key(raw: &str) -> String {
    raw.replace(['\r', '\u{feff}', '\u{200b}'], "")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parses() {
        let config = Config::load(Path::new("config.toml")).unwrap();
        assert_eq!(config.codeship.api_base, "https://api.codeship.com/v2");
        assert_eq!(config.codeship.request_timeout_ms, 10_000);
        assert_eq!(config.sync.default_refresh_interval_s, 60);
        assert_eq!(config.storage.settings_path, PathBuf::from("harbor-settings.toml"));
    }

    #[test]
    fn test_optional_sections_default() {
        let config = Config::parse("[codeship]\napi_base = \"http://localhost\"\n").unwrap();
        assert_eq!(config.codeship.request_timeout_ms, 10_000);
        assert_eq!(config.sync.default_refresh_interval_s, 60);
        assert_eq!(config.storage.credentials_path, PathBuf::from(".harbor-credentials"));
    }

    #[test]
    fn test_missing_codeship_section_is_an_error() {
        assert!(Config::parse("[sync]\ndefault_refresh_interval_s = 5\n").is_err());
    }

    #[test]
    fn test_env_lines_skip_comments_and_strip_quotes() {
        let parsed = parse_env_lines("\u{feff}# comment\n\nA=1\r\nB = \"two\"\nnot a pair\n");
        assert_eq!(
            parsed,
            vec![("A".to_string(), "1".to_string()), ("B".to_string(), "two".to_string())]
        );
    }

    #[test]
    fn test_sanitize_key_strips_invisible_chars() {
        assert_eq!(sanitize_key("\u{feff} abc\r\u{200b} "), "abc");
    }
}
