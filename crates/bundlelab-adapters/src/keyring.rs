//! Credential storage for model provider API keys
//!
//! All provider keys live in a single keychain entry as one JSON object, so a
//! run touches the system keychain at most once. A JSON file under the config
//! directory replaces the keychain when it is disabled.

use crate::config::Provider;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

const KEYRING_SERVICE: &str = "bundlelab-credentials";
const KEYRING_USERNAME: &str = "default";

pub const DISABLE_KEYRING_ENV: &str = "BUNDLELAB_DISABLE_KEYRING";
pub const CREDENTIALS_FILE_ENV: &str = "BUNDLELAB_CREDENTIALS_FILE";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredCredentials {
    #[serde(skip_serializing_if = "Option::is_none")]
    openai_api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    anthropic_api_key: Option<String>,
}

impl StoredCredentials {
    fn get(&self, provider: Provider) -> Option<&String> {
        match provider {
            Provider::OpenAi => self.openai_api_key.as_ref(),
            Provider::Anthropic => self.anthropic_api_key.as_ref(),
        }
    }

    fn set(&mut self, provider: Provider, key: String) {
        match provider {
            Provider::OpenAi => self.openai_api_key = Some(key),
            Provider::Anthropic => self.anthropic_api_key = Some(key),
        }
    }

    fn has_any(&self) -> bool {
        self.openai_api_key.is_some() || self.anthropic_api_key.is_some()
    }
}

type KeyringResult<T> = Result<T, String>;

#[derive(Debug, Default)]
struct CredentialsCache {
    cached: Option<KeyringResult<StoredCredentials>>,
}

static CREDENTIALS_CACHE: OnceLock<Mutex<CredentialsCache>> = OnceLock::new();
static KEYRING_ERROR_WARNED: AtomicBool = AtomicBool::new(false);

fn credentials_cache() -> &'static Mutex<CredentialsCache> {
    CREDENTIALS_CACHE.get_or_init(|| Mutex::new(CredentialsCache::default()))
}

fn keyring_disabled() -> bool {
    if cfg!(test) {
        return true;
    }

    let disabled_by_env = matches!(
        std::env::var(DISABLE_KEYRING_ENV)
            .unwrap_or_default()
            .to_lowercase()
            .as_str(),
        "1" | "true" | "yes"
    );
    if disabled_by_env {
        return true;
    }

    // A populated credentials file wins over the keychain so batch runs never
    // block on an interactive keychain prompt.
    if let Ok(creds) = read_fallback_credentials() {
        if creds.has_any() {
            return true;
        }
    }

    false
}

/// Human-friendly credential backend label used in CLI messages.
pub fn credentials_store_label() -> &'static str {
    if keyring_disabled() {
        "local credentials file"
    } else {
        "system keychain"
    }
}

fn keyring_entry() -> Result<Entry, keyring::Error> {
    Entry::new(KEYRING_SERVICE, KEYRING_USERNAME)
}

fn fallback_credentials_path() -> KeyringResult<PathBuf> {
    if let Ok(path) = std::env::var(CREDENTIALS_FILE_ENV) {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }

    if cfg!(test) {
        return Ok(std::env::temp_dir().join("bundlelab-test-credentials.json"));
    }

    dirs::config_dir()
        .map(|p| p.join("bundlelab").join("credentials.json"))
        .ok_or_else(|| "Could not determine credentials file path".to_string())
}

fn read_fallback_credentials() -> KeyringResult<StoredCredentials> {
    let path = fallback_credentials_path()?;
    if !path.exists() {
        return Ok(StoredCredentials::default());
    }
    let json = fs::read_to_string(&path).map_err(|e| {
        format!(
            "Failed to read credentials file '{}': {}",
            path.display(),
            e
        )
    })?;
    serde_json::from_str(&json).map_err(|e| {
        format!(
            "Failed to parse credentials file '{}': {}",
            path.display(),
            e
        )
    })
}

fn write_fallback_credentials(creds: &StoredCredentials) -> KeyringResult<()> {
    let path = fallback_credentials_path()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            format!(
                "Failed to create credentials directory '{}': {}",
                parent.display(),
                e
            )
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
        }
    }

    let content = serde_json::to_string(creds)
        .map_err(|e| format!("Failed to serialize credentials: {}", e))?;
    #[cfg(unix)]
    {
        let tmp_path = path.with_extension("json.tmp");
        let mut tmp_file = fs::File::create(&tmp_path).map_err(|e| {
            format!(
                "Failed to create temp credentials file '{}': {}",
                tmp_path.display(),
                e
            )
        })?;
        use std::os::unix::fs::PermissionsExt;
        let _ = tmp_file.set_permissions(fs::Permissions::from_mode(0o600));
        tmp_file.write_all(content.as_bytes()).map_err(|e| {
            format!(
                "Failed to write credentials file '{}': {}",
                tmp_path.display(),
                e
            )
        })?;
        fs::rename(&tmp_path, &path).map_err(|e| {
            format!(
                "Failed to finalize credentials file '{}': {}",
                path.display(),
                e
            )
        })?;
    }

    #[cfg(not(unix))]
    {
        fs::write(&path, content).map_err(|e| {
            format!(
                "Failed to write credentials file '{}': {}",
                path.display(),
                e
            )
        })?;
    }
    Ok(())
}

/// Log a keychain failure once per process.
pub fn warn_keychain_error_once(context: &str, err: &str) {
    if KEYRING_ERROR_WARNED.swap(true, Ordering::Relaxed) {
        return;
    }
    tracing::warn!(
        context,
        error = err,
        "couldn't access system keychain; set {}=1 or the provider API key env var to bypass it",
        DISABLE_KEYRING_ENV
    );
}

fn read_credentials_uncached() -> KeyringResult<StoredCredentials> {
    if keyring_disabled() {
        return read_fallback_credentials();
    }
    let entry = keyring_entry().map_err(|e| e.to_string())?;
    match entry.get_password() {
        Ok(json) => {
            serde_json::from_str(&json).map_err(|e| format!("Failed to parse credentials: {}", e))
        }
        Err(keyring::Error::NoEntry) => Ok(StoredCredentials::default()),
        Err(err) => Err(err.to_string()),
    }
}

fn write_credentials(creds: &StoredCredentials) -> KeyringResult<()> {
    if keyring_disabled() {
        return write_fallback_credentials(creds);
    }
    let entry = keyring_entry().map_err(|e| e.to_string())?;
    let json = serde_json::to_string(creds)
        .map_err(|e| format!("Failed to serialize credentials: {}", e))?;
    entry.set_password(&json).map_err(|e| e.to_string())?;
    Ok(())
}

fn read_credentials_cached() -> KeyringResult<StoredCredentials> {
    let cache = credentials_cache();
    let mut guard = match cache.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };

    if let Some(ref result) = guard.cached {
        return result.clone();
    }

    let creds = read_credentials_uncached()?;

    guard.cached = Some(Ok(creds.clone()));
    Ok(creds)
}

fn update_cache(creds: StoredCredentials) {
    let cache = credentials_cache();
    let mut guard = match cache.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.cached = Some(Ok(creds));
}

#[cfg(test)]
pub(crate) fn reset_for_tests() {
    let cache = credentials_cache();
    let mut guard = match cache.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.cached = None;
    KEYRING_ERROR_WARNED.store(false, Ordering::Relaxed);
}

// ============================================================================
// Public API
// ============================================================================

/// Stored API key for a provider.
pub fn get_provider_key(provider: Provider) -> KeyringResult<Option<String>> {
    let creds = read_credentials_cached()?;
    Ok(creds.get(provider).cloned())
}

/// Store an API key for a provider, keeping the other provider's key.
pub fn set_provider_key(provider: Provider, key: &str) -> Result<(), String> {
    let mut creds = read_credentials_cached().unwrap_or_default();
    creds.set(provider, key.to_string());
    write_credentials(&creds)?;
    update_cache(creds);
    Ok(())
}

/// Read back a freshly stored key and confirm it matches.
pub fn verify_provider_key(provider: Provider, key: &str) -> Result<(), String> {
    match get_provider_key(provider) {
        Ok(Some(stored)) if stored == key => Ok(()),
        Ok(Some(_)) => Err(format!(
            "stored {} key doesn't match in {}",
            provider.as_str(),
            credentials_store_label()
        )),
        Ok(None) => Err(format!(
            "{} key was not persisted to {}",
            provider.as_str(),
            credentials_store_label()
        )),
        Err(err) => Err(format!(
            "couldn't read back from {} ({})",
            credentials_store_label(),
            err
        )),
    }
}
