// src/core/auth.rs

//! Client authentication: the process-wide "authentication required" switch and
//! the credential store it consults.

use crate::core::SamError;
use crate::core::protocol::Props;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Delay applied after a failed verification to blunt timing attacks.
const FAILED_AUTH_DELAY: Duration = Duration::from_millis(100);

/// Storage for user credentials. Implementations receive password hashes,
/// never plaintext, and verify with a salted-hash comparison.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn verify(&self, user: &str, password: &str) -> bool;
    async fn add(&self, user: &str, password_hash: String) -> Result<(), SamError>;
    /// Returns whether the user existed.
    async fn remove(&self, user: &str) -> Result<bool, SamError>;
}

/// Hashes `password` with Argon2 and a fresh salt.
pub fn hash_password(password: &str) -> Result<String, SamError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| SamError::Internal("Password hashing failed".to_string()))
}

#[derive(Debug, Deserialize, Serialize, Clone)]
struct StoredUser {
    username: String,
    password_hash: String,
}

#[derive(Debug, Deserialize, Serialize, Default)]
struct UsersFile {
    users: Vec<StoredUser>,
}

/// A credential store kept in memory and, when given a path, mirrored to a
/// JSON file.
pub struct FileCredentialStore {
    path: Option<PathBuf>,
    users: RwLock<BTreeMap<String, String>>,
    save_lock: tokio::sync::Mutex<()>,
}

impl FileCredentialStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            users: RwLock::new(BTreeMap::new()),
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Loads users from `path`; a missing file starts the store empty.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SamError> {
        let path = path.as_ref().to_path_buf();
        let users = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<UsersFile>(&contents) {
                Ok(file) => file
                    .users
                    .into_iter()
                    .map(|u| (u.username, u.password_hash))
                    .collect(),
                Err(e) => {
                    return Err(SamError::Internal(format!(
                        "Failed to parse credentials file '{}': {e}",
                        path.display()
                    )));
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Credentials file '{}' not found. Starting with no users.",
                    path.display()
                );
                BTreeMap::new()
            }
            Err(e) => {
                return Err(SamError::Internal(format!(
                    "Failed to read credentials file '{}': {e}",
                    path.display()
                )));
            }
        };
        Ok(Self {
            path: Some(path),
            users: RwLock::new(users),
            save_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }

    async fn save(&self) -> Result<(), SamError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let _guard = self.save_lock.lock().await;
        let file = UsersFile {
            users: self
                .users
                .read()
                .iter()
                .map(|(username, password_hash)| StoredUser {
                    username: username.clone(),
                    password_hash: password_hash.clone(),
                })
                .collect(),
        };

        tokio::task::spawn_blocking(move || -> Result<(), SamError> {
            let json = serde_json::to_string_pretty(&file).map_err(|e| {
                SamError::Internal(format!("Failed to serialize credentials: {e}"))
            })?;
            let temp_path = PathBuf::from(format!(
                "{}.tmp-{}",
                path.display(),
                rand::random::<u32>()
            ));
            std::fs::write(&temp_path, json).map_err(|e| {
                SamError::Internal(format!("Failed to write temp credentials file: {e}"))
            })?;
            std::fs::rename(&temp_path, &path).map_err(|e| {
                SamError::Internal(format!("Failed to rename credentials file: {e}"))
            })?;
            Ok(())
        })
        .await
        .map_err(|e| SamError::Internal(format!("Credentials save task failed: {e}")))?
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn verify(&self, user: &str, password: &str) -> bool {
        let stored = self.users.read().get(user).cloned();
        let Some(stored) = stored else {
            return false;
        };
        let user = user.to_string();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || match PasswordHash::new(&stored) {
            Ok(parsed) => Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(e) => {
                warn!("Stored hash for user '{user}' is unreadable: {e}");
                false
            }
        })
        .await
        .unwrap_or(false)
    }

    async fn add(&self, user: &str, password_hash: String) -> Result<(), SamError> {
        self.users.write().insert(user.to_string(), password_hash);
        self.save().await
    }

    async fn remove(&self, user: &str) -> Result<bool, SamError> {
        let existed = self.users.write().remove(user).is_some();
        if existed {
            self.save().await?;
        }
        Ok(existed)
    }
}

/// The authentication switch shared by every connection.
pub struct AuthManager {
    required: AtomicBool,
    store: Arc<dyn CredentialStore>,
}

impl AuthManager {
    pub fn new(required: bool, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            required: AtomicBool::new(required),
            store,
        }
    }

    pub fn is_required(&self) -> bool {
        self.required.load(Ordering::Acquire)
    }

    pub fn set_required(&self, required: bool) {
        self.required.store(required, Ordering::Release);
        info!(
            "Client authentication {}.",
            if required { "enabled" } else { "disabled" }
        );
    }

    /// Validates the `USER`/`PASSWORD` pair carried by a command.
    pub async fn authenticate(&self, props: &Props) -> Result<(), SamError> {
        let (Some(user), Some(password)) = (props.get("USER"), props.get("PASSWORD")) else {
            return Err(SamError::AuthRequired);
        };
        if self.store.verify(user, password).await {
            Ok(())
        } else {
            tokio::time::sleep(FAILED_AUTH_DELAY).await;
            Err(SamError::AuthFailed)
        }
    }

    pub async fn add_user(&self, user: &str, password: &str) -> Result<(), SamError> {
        if user.is_empty() || password.is_empty() {
            return Err(SamError::MissingProperty(if user.is_empty() {
                "USER"
            } else {
                "PASSWORD"
            }));
        }
        let password = password.to_string();
        let hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| SamError::Internal(format!("Password hashing task failed: {e}")))??;
        self.store.add(user, hash).await
    }

    pub async fn remove_user(&self, user: &str) -> Result<(), SamError> {
        if self.store.remove(user).await? {
            Ok(())
        } else {
            Err(SamError::InvalidState(format!("no such user '{user}'")))
        }
    }
}
