// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Blob storage.
//!
//! Blobs are addressed by slash-separated names such as
//! `<team>/videos/<video>/frame_000042.jpg`. The filesystem backend keeps the
//! bytes under `<root>/objects/` and a small JSON sidecar (content type,
//! update time) under `<root>/meta/`. Writes land in `<root>/tmp/` first and
//! are renamed into place, so readers never observe partial blobs.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use crate::error::{CoreError, Result};

/// HTTP method a signed URL is valid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignedMethod {
    /// Download.
    Get,
    /// Upload.
    Put,
}

impl SignedMethod {
    fn as_str(self) -> &'static str {
        match self {
            SignedMethod::Get => "GET",
            SignedMethod::Put => "PUT",
        }
    }
}

/// Named blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Whether the blob exists.
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Create or replace a blob.
    async fn upload(&self, name: &str, data: &[u8], content_type: &str) -> Result<()>;

    /// Read a blob. Missing blobs are [`CoreError::NotFound`].
    async fn download(&self, name: &str) -> Result<Vec<u8>>;

    /// Delete a blob. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Time-limited URL for direct client access.
    fn signed_url(
        &self,
        name: &str,
        method: SignedMethod,
        expires_at: DateTime<Utc>,
    ) -> Result<String>;

    /// Atomically read and delete a blob. Of several concurrent callers at
    /// most one receives the bytes; the rest get `None`.
    async fn take(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Names of all blobs starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Last update time, `None` if the blob does not exist.
    async fn updated(&self, name: &str) -> Result<Option<DateTime<Utc>>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct BlobMeta {
    content_type: String,
    updated: DateTime<Utc>,
}

/// Filesystem-backed [`BlobStore`].
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    base_url: String,
    signing_key: Vec<u8>,
}

impl FsBlobStore {
    /// Create a store rooted at `root`. Directories are created lazily.
    pub fn new(
        root: impl Into<PathBuf>,
        base_url: impl Into<String>,
        signing_key: impl AsRef<[u8]>,
    ) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            signing_key: signing_key.as_ref().to_vec(),
        }
    }

    /// Check a signed URL's parameters. Used by the HTTP layer serving
    /// `<base_url>/<name>`.
    pub fn verify_signature(
        &self,
        name: &str,
        method: SignedMethod,
        expires: i64,
        signature: &str,
        now: DateTime<Utc>,
    ) -> bool {
        if now.timestamp() > expires {
            return false;
        }
        let Ok(provided) = URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(&self.signing_key) else {
            return false;
        };
        mac.update(signing_payload(name, method, expires).as_bytes());
        mac.verify_slice(&provided).is_ok()
    }

    fn object_path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.root.join("objects").join(checked_name(name)?))
    }

    fn meta_path(&self, name: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join("meta")
            .join(format!("{}.json", checked_name(name)?.display())))
    }

    fn tmp_path(&self) -> PathBuf {
        self.root.join("tmp").join(uuid::Uuid::new_v4().to_string())
    }

    async fn write_atomically(&self, path: &Path, data: &[u8]) -> Result<()> {
        let tmp = self.tmp_path();
        create_parent(&tmp).await?;
        create_parent(path).await?;
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| io_error(path, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| io_error(path, e))
    }
}

fn signing_payload(name: &str, method: SignedMethod, expires: i64) -> String {
    format!("{}\n{}\n{}", method.as_str(), name, expires)
}

/// Reject names that would escape the store root.
fn checked_name(name: &str) -> Result<PathBuf> {
    let path = Path::new(name);
    let valid = !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if valid {
        Ok(path.to_path_buf())
    } else {
        Err(CoreError::validation("blob_name", format!("invalid blob name '{name}'")))
    }
}

fn io_error(path: &Path, err: std::io::Error) -> CoreError {
    CoreError::Blob {
        name: path.display().to_string(),
        details: err.to_string(),
    }
}

async fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(parent, e))?;
    }
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_error(path, e)),
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn exists(&self, name: &str) -> Result<bool> {
        let path = self.object_path(name)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_error(&path, e))
    }

    async fn upload(&self, name: &str, data: &[u8], content_type: &str) -> Result<()> {
        let path = self.object_path(name)?;
        self.write_atomically(&path, data).await?;

        let meta = BlobMeta {
            content_type: content_type.to_string(),
            updated: Utc::now(),
        };
        let meta_path = self.meta_path(name)?;
        self.write_atomically(&meta_path, &serde_json::to_vec(&meta)?)
            .await?;

        debug!(blob = %name, size = data.len(), "Uploaded blob");
        Ok(())
    }

    async fn download(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.object_path(name)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CoreError::not_found("blob", name))
            }
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let existed = remove_if_exists(&self.object_path(name)?).await?;
        remove_if_exists(&self.meta_path(name)?).await?;
        if existed {
            debug!(blob = %name, "Deleted blob");
        }
        Ok(existed)
    }

    fn signed_url(
        &self,
        name: &str,
        method: SignedMethod,
        expires_at: DateTime<Utc>,
    ) -> Result<String> {
        checked_name(name)?;
        let expires = expires_at.timestamp();
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.signing_key).map_err(|e| {
            CoreError::Blob {
                name: name.to_string(),
                details: format!("invalid signing key: {e}"),
            }
        })?;
        mac.update(signing_payload(name, method, expires).as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!(
            "{}/{}?method={}&expires={}&signature={}",
            self.base_url,
            name,
            method.as_str(),
            expires,
            signature
        ))
    }

    async fn take(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.object_path(name)?;
        let claimed = self.tmp_path();
        create_parent(&claimed).await?;

        // rename is atomic: exactly one caller moves the file out.
        match tokio::fs::rename(&path, &claimed).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e)),
        }
        let data = tokio::fs::read(&claimed)
            .await
            .map_err(|e| io_error(&claimed, e))?;
        remove_if_exists(&claimed).await?;
        remove_if_exists(&self.meta_path(name)?).await?;
        Ok(Some(data))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let objects = self.root.join("objects");
        let mut names = Vec::new();
        let mut pending = vec![objects.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(&dir, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_error(&dir, e))?
            {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(|e| io_error(&path, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&objects) {
                    let name = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if name.starts_with(prefix) {
                        names.push(name);
                    }
                }
            }
        }

        names.sort();
        Ok(names)
    }

    async fn updated(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        let meta_path = self.meta_path(name)?;
        match tokio::fs::read(&meta_path).await {
            Ok(raw) => {
                let meta: BlobMeta = serde_json::from_slice(&raw)?;
                Ok(Some(meta.updated))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&meta_path, e)),
        }
    }
}
