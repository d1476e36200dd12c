// src/core/keys.rs

//! The persistent name-to-keystream store behind named destinations.
//!
//! The file holds one `name=keystream` pair per line. Keystreams are base64
//! and may end in `=` padding, so a line is split at its first `=` only.

use crate::core::SamError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct KeyStore {
    path: Option<PathBuf>,
    keys: Mutex<BTreeMap<String, String>>,
    /// Serializes file rewrites.
    save_lock: tokio::sync::Mutex<()>,
}

impl KeyStore {
    /// A store that forgets everything on restart.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            keys: Mutex::new(BTreeMap::new()),
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Loads the store at `path`. A missing file yields an empty store that is
    /// created on the first insert.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SamError> {
        let path = path.as_ref().to_path_buf();
        let keys = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => parse(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Key file '{}' not found. It will be created on first use.",
                    path.display()
                );
                BTreeMap::new()
            }
            Err(e) => {
                return Err(SamError::Internal(format!(
                    "Failed to read key file '{}': {e}",
                    path.display()
                )));
            }
        };
        info!("Loaded {} named keys from '{}'.", keys.len(), path.display());
        Ok(Self {
            path: Some(path),
            keys: Mutex::new(keys),
            save_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.keys.lock().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores `keystream` under `name` unless the name is already taken, and
    /// returns whichever keystream the name now maps to.
    pub async fn insert_if_absent(&self, name: &str, keystream: String) -> Result<String, SamError> {
        let (stored, inserted) = {
            let mut keys = self.keys.lock();
            match keys.get(name) {
                Some(existing) => (existing.clone(), false),
                None => {
                    keys.insert(name.to_string(), keystream.clone());
                    (keystream, true)
                }
            }
        };
        if inserted {
            debug!("Stored new keystream for name '{name}'.");
            self.save().await?;
        }
        Ok(stored)
    }

    /// Rewrites the backing file atomically.
    pub async fn save(&self) -> Result<(), SamError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let _guard = self.save_lock.lock().await;
        let contents = render(&self.keys.lock());

        tokio::task::spawn_blocking(move || -> Result<(), SamError> {
            let temp_path = PathBuf::from(format!(
                "{}.tmp-{}",
                path.display(),
                rand::random::<u32>()
            ));
            std::fs::write(&temp_path, contents)
                .map_err(|e| SamError::Internal(format!("Failed to write temp key file: {e}")))?;
            std::fs::rename(&temp_path, &path)
                .map_err(|e| SamError::Internal(format!("Failed to rename key file: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| SamError::Internal(format!("Key file save task failed: {e}")))?
    }
}

fn parse(contents: &str) -> BTreeMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .filter(|(name, stream)| !name.is_empty() && !stream.is_empty())
        .map(|(name, stream)| (name.trim().to_string(), stream.trim().to_string()))
        .collect()
}

fn render(keys: &BTreeMap<String, String>) -> String {
    keys.iter().map(|(name, stream)| format!("{name}={stream}\n")).collect()
}
