//! Persistent Config Store
//!
//! The resolved credential lives in a dotenv-style file shared with the
//! playlist scripts. Writes replace the whole file through a temp file and
//! rename, serialized by a mutex, so readers see either the previous set of
//! keys or the new one and never a mix.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::token::AccessToken;

pub const KEY_URL: &str = "PLEX_URL";
pub const KEY_TOKEN: &str = "PLEX_TOKEN";
pub const KEY_VERIFY_TLS: &str = "PLEX_VERIFY_SSL";
pub const KEY_SERVER_ID: &str = "PLEX_SERVER_ID";

/// Durable key/value configuration
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Update every key or none, durable before returning
    async fn write_all(&self, values: &BTreeMap<String, String>) -> Result<(), StoreError>;

    /// Last successfully written set
    async fn read_all(&self) -> Result<BTreeMap<String, String>, StoreError>;
}

/// The persisted (url, token, verify flag, server id) tuple
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedCredential {
    pub url: String,
    pub token: AccessToken,
    pub verify_tls: bool,
    pub server_id: String,
}

impl std::fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("url", &self.url)
            .field("token", &self.token)
            .field("verify_tls", &self.verify_tls)
            .field("server_id", &self.server_id)
            .finish()
    }
}

impl ResolvedCredential {
    pub fn to_entries(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (KEY_URL.to_string(), self.url.clone()),
            (KEY_TOKEN.to_string(), self.token.expose().to_string()),
            (
                KEY_VERIFY_TLS.to_string(),
                if self.verify_tls { "true" } else { "false" }.to_string(),
            ),
            (KEY_SERVER_ID.to_string(), self.server_id.clone()),
        ])
    }

    /// Rebuild from stored entries; `None` when url or token is missing
    pub fn from_entries(entries: &BTreeMap<String, String>) -> Option<Self> {
        let url = entries.get(KEY_URL).map(|s| s.trim()).filter(|s| !s.is_empty())?;
        let token = entries.get(KEY_TOKEN).and_then(|t| AccessToken::new(t.trim()))?;
        let verify_tls = entries.get(KEY_VERIFY_TLS).map(|v| parse_flag(v)).unwrap_or(false);

        Some(Self {
            url: url.to_string(),
            token,
            verify_tls,
            server_id: entries.get(KEY_SERVER_ID).cloned().unwrap_or_default(),
        })
    }
}

/// `1`, `true` or `yes`, ignoring case and whitespace
pub fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}

/// Persist a credential as one atomic write
pub async fn save_credential(
    store: &dyn ConfigStore,
    credential: &ResolvedCredential,
) -> Result<(), StoreError> {
    store.write_all(&credential.to_entries()).await
}

/// Load the current credential, if one is configured
pub async fn load_credential(store: &dyn ConfigStore) -> Result<Option<ResolvedCredential>, StoreError> {
    Ok(ResolvedCredential::from_entries(&store.read_all().await?))
}

// ============================================================
// .env file store
// ============================================================

/// dotenv file store; unrelated keys and comments are preserved
pub struct EnvFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl EnvFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_text(&self) -> Result<String, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }

    async fn replace_file(&self, contents: &str) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".env".to_string());
        let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

        let write = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(contents.as_bytes()).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, &self.path).await
        };

        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::io(&self.path, e));
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for EnvFileStore {
    async fn write_all(&self, values: &BTreeMap<String, String>) -> Result<(), StoreError> {
        for key in values.keys() {
            if !is_valid_key(key) {
                return Err(StoreError::Malformed {
                    key: key.clone(),
                    reason: "keys must be [A-Za-z0-9_]".to_string(),
                });
            }
        }

        let _guard = self.write_lock.lock().await;
        let current = self.read_text().await?;
        let updated = render_updates(&current, values);
        self.replace_file(&updated).await?;

        info!(path = %self.path.display(), keys = values.len(), "Configuration written");
        Ok(())
    }

    async fn read_all(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let text = self.read_text().await?;
        let entries = parse_env(&text)?;
        debug!(path = %self.path.display(), keys = entries.len(), "Configuration read");
        Ok(entries)
    }
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Key of a `KEY=value` line (optionally prefixed with `export`), for in-place rewrites
fn split_assignment(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return None;
    }
    let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    let (key, value) = trimmed.split_once('=')?;
    let key = key.trim();
    is_valid_key(key).then_some((key, value))
}

/// Render a value so dotenv readers get it back unchanged
///
/// Single quotes disable escapes and `$` substitution; values holding a
/// single quote or newline fall back to escaped double quotes.
fn quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_.:/@+,".contains(c));
    if plain {
        return value.to_string();
    }
    if !value.contains(['\'', '\n', '\r']) {
        return format!("'{}'", value);
    }
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "\\$")
        .replace('\n', "\\n");
    format!("\"{}\"", escaped)
}

/// Parse dotenv text the way the scripts' dotenv loader does
fn parse_env(text: &str) -> Result<BTreeMap<String, String>, StoreError> {
    dotenvy::from_read_iter(text.as_bytes())
        .map(|item| {
            item.map_err(|e| StoreError::Malformed {
                key: "env file".to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Rewrite assignments for `values` in place, appending keys not present
fn render_updates(current: &str, values: &BTreeMap<String, String>) -> String {
    let mut written = std::collections::HashSet::new();
    let mut lines: Vec<String> = Vec::new();

    for line in current.lines() {
        match split_assignment(line).and_then(|(k, _)| values.get_key_value(k)) {
            Some((key, value)) if !written.contains(key.as_str()) => {
                lines.push(format!("{}={}", key, quote(value)));
                written.insert(key.as_str());
            }
            // Later duplicates of an updated key would shadow the new value
            Some(_) => {}
            None => lines.push(line.to_string()),
        }
    }

    for (key, value) in values {
        if !written.contains(key.as_str()) {
            lines.push(format!("{}={}", key, quote(value)));
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}
