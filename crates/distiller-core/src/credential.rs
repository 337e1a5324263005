use std::path::{Path, PathBuf};

const KEY_SERVICE: &str = "distiller";
const KEY_ACCOUNT: &str = "gemini_api_key";
const ENV_KEYS: [&str; 2] = ["DISTILLER_API_KEY", "GEMINI_API_KEY"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialBackend {
    Env,
    Keychain,
    File,
}

impl CredentialBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialBackend::Env => "env",
            CredentialBackend::Keychain => "keychain",
            CredentialBackend::File => "file",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CredentialMaterial {
    pub secret: String,
    pub backend: CredentialBackend,
}

/// Resolves the API key from the environment, the OS keychain, then a file
/// under the data dir.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    file_path: PathBuf,
    use_keychain: bool,
}

impl CredentialStore {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            use_keychain: true,
        }
    }

    /// File-only store, used where no keychain service is reachable.
    pub fn file_only(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            use_keychain: false,
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn load(&self) -> Option<CredentialMaterial> {
        for key in ENV_KEYS {
            if let Ok(value) = std::env::var(key) {
                let value = value.trim();
                if !value.is_empty() {
                    return Some(CredentialMaterial {
                        secret: value.to_string(),
                        backend: CredentialBackend::Env,
                    });
                }
            }
        }

        if let Some(entry) = self.keyring_entry() {
            if let Ok(secret) = entry.get_password() {
                let secret = secret.trim().to_string();
                if !secret.is_empty() {
                    return Some(CredentialMaterial {
                        secret,
                        backend: CredentialBackend::Keychain,
                    });
                }
            }
        }

        read_file_secret(&self.file_path).map(|secret| CredentialMaterial {
            secret,
            backend: CredentialBackend::File,
        })
    }

    /// Keychain first; the file is the fallback when the keychain refuses.
    pub fn store(&self, secret: &str) -> anyhow::Result<CredentialBackend> {
        let secret = secret.trim();
        if secret.is_empty() {
            anyhow::bail!("refusing to store an empty API key");
        }
        if let Some(entry) = self.keyring_entry() {
            if entry.set_password(secret).is_ok() {
                return Ok(CredentialBackend::Keychain);
            }
        }
        write_file_secret(&self.file_path, secret)?;
        Ok(CredentialBackend::File)
    }

    fn keyring_entry(&self) -> Option<keyring::Entry> {
        if !self.use_keychain {
            return None;
        }
        keyring::Entry::new(KEY_SERVICE, KEY_ACCOUNT).ok()
    }
}

fn read_file_secret(path: &Path) -> Option<String> {
    let existing = std::fs::read_to_string(path).ok()?;
    let secret = existing.trim();
    if secret.is_empty() {
        None
    } else {
        Some(secret.to_string())
    }
}

fn write_file_secret(path: &Path, secret: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, secret)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_round_trips_trimmed_secret() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CredentialStore::file_only(temp.path().join("security").join("api_key"));
        assert_eq!(store.store("  AIza-file  ").expect("store"), CredentialBackend::File);
        let raw = std::fs::read_to_string(store.file_path()).expect("read");
        assert_eq!(raw, "AIza-file");
        assert_eq!(read_file_secret(store.file_path()).as_deref(), Some("AIza-file"));
    }

    #[test]
    fn empty_secret_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CredentialStore::file_only(temp.path().join("api_key"));
        assert!(store.store("   ").is_err());
        assert!(!store.file_path().exists());
    }

    #[test]
    fn blank_file_counts_as_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("api_key");
        std::fs::write(&path, "\n").expect("write");
        assert!(read_file_secret(&path).is_none());
    }
}
