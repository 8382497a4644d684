//! Storage contracts the settings store is written against, plus the
//! backends bundled with the binary.
//!
//! Plain fields go through [`SettingsBackend`]; the credential field goes
//! through [`SecretStore`] only.

use base64::Engine as _;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

pub trait SettingsBackend: Send + Sync {
    fn read_field(&self, key: &str) -> Result<Option<toml::Value>, PersistenceError>;
    fn write_field(&self, key: &str, value: toml::Value) -> Result<(), PersistenceError>;
    fn remove_field(&self, key: &str) -> Result<(), PersistenceError>;
}

/// Secure-storage variant, used for the credential field only.
pub trait SecretStore: Send + Sync {
    fn read_secret(&self, key: &str) -> Result<Option<String>, PersistenceError>;
    fn write_secret(&self, key: &str, value: &str) -> Result<(), PersistenceError>;
    fn remove_secret(&self, key: &str) -> Result<(), PersistenceError>;
}

// ---------------------------------------------------------------------------
// TOML file
// ---------------------------------------------------------------------------

/// Plain fields in one TOML table. Every write rewrites the whole file.
pub struct TomlFileBackend {
    path: PathBuf,
    table: Mutex<toml::Table>,
}

impl TomlFileBackend {
    /// Open (or lazily create) the settings file. A missing file is an empty table.
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        let table = match std::fs::read_to_string(path) {
            Ok(content) => content
                .parse::<toml::Table>()
                .map_err(|e| PersistenceError::Decode(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => toml::Table::new(),
            Err(source) => {
                return Err(PersistenceError::Io { path: path.to_path_buf(), source });
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            table: Mutex::new(table),
        })
    }

    fn flush(&self, table: &toml::Table) -> Result<(), PersistenceError> {
        let content = toml::to_string(table).map_err(|e| PersistenceError::Encode(e.to_string()))?;
        std::fs::write(&self.path, content)
            .map_err(|source| PersistenceError::Io { path: self.path.clone(), source })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, toml::Table>, PersistenceError> {
        self.table
            .lock()
            .map_err(|_| PersistenceError::Unavailable("settings table lock poisoned".into()))
    }
}

impl SettingsBackend for TomlFileBackend {
    fn read_field(&self, key: &str) -> Result<Option<toml::Value>, PersistenceError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn write_field(&self, key: &str, value: toml::Value) -> Result<(), PersistenceError> {
        let mut table = self.lock()?;
        table.insert(key.to_string(), value);
        self.flush(&table)
    }

    fn remove_field(&self, key: &str) -> Result<(), PersistenceError> {
        let mut table = self.lock()?;
        if table.remove(key).is_some() {
            self.flush(&table)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// KEY=VALUE secrets file
// ---------------------------------------------------------------------------

/// Secrets in a dotenv-style file, values base64-encoded so any byte
/// sequence survives the line format.
pub struct EnvFileSecrets {
    path: PathBuf,
    lock: Mutex<()>,
}

impl EnvFileSecrets {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn read_all(&self) -> Result<Vec<(String, String)>, PersistenceError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(crate::config::parse_env_lines(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(PersistenceError::Io { path: self.path.clone(), source }),
        }
    }

    fn write_all(&self, entries: &[(String, String)]) -> Result<(), PersistenceError> {
        let mut contents = String::new();
        for (key, value) in entries {
            contents.push_str(&format!("{}={}\n", key, value));
        }
        std::fs::write(&self.path, contents)
            .map_err(|source| PersistenceError::Io { path: self.path.clone(), source })
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>, PersistenceError> {
        self.lock
            .lock()
            .map_err(|_| PersistenceError::Unavailable("secrets lock poisoned".into()))
    }
}

impl SecretStore for EnvFileSecrets {
    fn read_secret(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        let _guard = self.guard()?;
        let Some((_, encoded)) = self.read_all()?.into_iter().find(|(k, _)| k == key) else {
            return Ok(None);
        };
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| PersistenceError::Decode(format!("{}: {}", key, e)))?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| PersistenceError::Decode(format!("{}: {}", key, e)))
    }

    fn write_secret(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        let _guard = self.guard()?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(value.as_bytes());
        let mut entries: Vec<_> = self.read_all()?.into_iter().filter(|(k, _)| k != key).collect();
        entries.push((key.to_string(), encoded));
        self.write_all(&entries)
    }

    fn remove_secret(&self, key: &str) -> Result<(), PersistenceError> {
        let _guard = self.guard()?;
        let entries = self.read_all()?;
        let kept: Vec<_> = entries.iter().filter(|(k, _)| k != key).cloned().collect();
        if kept.len() != entries.len() {
            self.write_all(&kept)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In memory
// ---------------------------------------------------------------------------

/// Both contracts in memory. Writes can be made to fail for exercising
/// degraded durability.
#[derive(Default)]
pub struct MemoryBackend {
    fields: Mutex<HashMap<String, toml::Value>>,
    secrets: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }

    fn poisoned() -> PersistenceError {
        PersistenceError::Unavailable("memory backend lock poisoned".into())
    }
}

impl SettingsBackend for MemoryBackend {
    fn read_field(&self, key: &str) -> Result<Option<toml::Value>, PersistenceError> {
        Ok(self.fields.lock().map_err(|_| Self::poisoned())?.get(key).cloned())
    }

    fn write_field(&self, key: &str, value: toml::Value) -> Result<(), PersistenceError> {
        self.check_writable()?;
        self.fields.lock().map_err(|_| Self::poisoned())?.insert(key.to_string(), value);
        Ok(())
    }

    fn remove_field(&self, key: &str) -> Result<(), PersistenceError> {
        self.check_writable()?;
        self.fields.lock().map_err(|_| Self::poisoned())?.remove(key);
        Ok(())
    }
}

impl SecretStore for MemoryBackend {
    fn read_secret(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.secrets.lock().map_err(|_| Self::poisoned())?.get(key).cloned())
    }

    fn write_secret(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        self.check_writable()?;
        self.secrets
            .lock()
            .map_err(|_| Self::poisoned())?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_secret(&self, key: &str) -> Result<(), PersistenceError> {
        self.check_writable()?;
        self.secrets.lock().map_err(|_| Self::poisoned())?.remove(key);
        Ok(())
    }
}
