//! Local artifacts and the three well-known files that hold them.
//!
//! The processed payload is only meaningful together with the promotion
//! marker: [`ArtifactCache::promote`] writes them as a unit and
//! [`ArtifactCache::load_processed`] only returns content when both exist.
//! Replacing the raw payload always clears both first, so a marker that is
//! present always refers to the current raw payload.

use std::sync::Arc;

use serde::Serialize;

use crate::config::LocalLayout;
use crate::error::{Result, UpdaterError};
use crate::hasher::ContentHasher;
use crate::store::{ResourceStore, StoreExt};

/// Last known good raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedArtifact {
    pub content: String,
    pub digest: String,
    /// Store path the payload was read from.
    pub path: String,
}

/// Original resource URL to local reference, in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceMapping {
    entries: Vec<(String, String)>,
}

impl ResourceMapping {
    pub fn insert(&mut self, url: impl Into<String>, local: impl Into<String>) {
        let url = url.into();
        let local = local.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == url) {
            Some(entry) => entry.1 = local,
            None => self.entries.push((url, local)),
        }
    }

    pub fn get(&self, url: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == url)
            .map(|(_, local)| local.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(url, local)| (url.as_str(), local.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A resource that could not be localised during a rewrite pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceFailure {
    pub url: String,
    pub reason: String,
}

/// Payload whose resource references point at local copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedArtifact {
    pub content: String,
    pub mappings: ResourceMapping,
    /// Resources left pointing at their remote URL.
    pub failures: Vec<ResourceFailure>,
}

/// What the store currently holds for the processed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessedState {
    /// Processed payload and marker are both present.
    Promoted,
    /// A processed payload exists without its marker; it must not be run.
    Unmarked,
    Missing,
}

/// Reads and writes the payload files through a [`ResourceStore`].
#[derive(Clone)]
pub struct ArtifactCache {
    store: Arc<dyn ResourceStore>,
    hasher: Arc<dyn ContentHasher>,
    layout: LocalLayout,
}

impl ArtifactCache {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        hasher: Arc<dyn ContentHasher>,
        layout: LocalLayout,
    ) -> Self {
        Self {
            store,
            hasher,
            layout,
        }
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    pub fn layout(&self) -> &LocalLayout {
        &self.layout
    }

    /// Raw payload text without hashing it. Empty files count as absent.
    pub async fn read_payload(&self) -> Result<Option<String>> {
        self.read_text(&self.layout.payload).await
    }

    /// Raw payload together with its digest.
    pub async fn load_cached(&self) -> Result<Option<CachedArtifact>> {
        let Some(content) = self.read_payload().await? else {
            return Ok(None);
        };
        let digest = self.hasher.digest(content.as_bytes())?;
        tracing::debug!(path = %self.layout.payload, %digest, "loaded cached payload");
        Ok(Some(CachedArtifact {
            content,
            digest,
            path: self.layout.payload.clone(),
        }))
    }

    /// Replace the raw payload. Any processed payload derived from the old one
    /// is discarded first.
    pub async fn store_payload(&self, content: &str) -> Result<CachedArtifact> {
        let digest = self.hasher.digest(content.as_bytes())?;
        self.clear_processed().await?;
        self.store
            .write_file(&self.layout.payload, content.as_bytes())
            .await?;
        tracing::info!(path = %self.layout.payload, %digest, "stored raw payload");
        Ok(CachedArtifact {
            content: content.to_string(),
            digest,
            path: self.layout.payload.clone(),
        })
    }

    /// Remove the marker, then the processed payload.
    pub async fn clear_processed(&self) -> Result<()> {
        self.store.remove_if_exists(&self.layout.marker).await?;
        self.store.remove_if_exists(&self.layout.processed).await?;
        Ok(())
    }

    pub async fn processed_state(&self) -> Result<ProcessedState> {
        let processed = self.store.exists(&self.layout.processed).await?;
        if !processed {
            return Ok(ProcessedState::Missing);
        }
        let marked = self.store.exists(&self.layout.marker).await?;
        Ok(if marked {
            ProcessedState::Promoted
        } else {
            ProcessedState::Unmarked
        })
    }

    /// Processed payload, only when its marker is present too.
    pub async fn load_processed(&self) -> Result<Option<String>> {
        if self.processed_state().await? != ProcessedState::Promoted {
            return Ok(None);
        }
        self.read_text(&self.layout.processed).await
    }

    /// Write the processed payload, then the marker. If the marker cannot be
    /// written the processed payload is removed again.
    pub async fn promote(&self, content: &str) -> Result<()> {
        self.store
            .write_file(&self.layout.processed, content.as_bytes())
            .await?;
        if let Err(err) = self.store.write_file(&self.layout.marker, &[]).await {
            tracing::error!(%err, "promotion marker could not be written, discarding processed payload");
            if let Err(cleanup) = self.store.remove_if_exists(&self.layout.processed).await {
                tracing::error!(err = %cleanup, "failed to remove unmarked processed payload");
            }
            return Err(err.into());
        }
        tracing::info!(path = %self.layout.processed, "processed payload promoted");
        Ok(())
    }

    async fn read_text(&self, path: &str) -> Result<Option<String>> {
        let Some(bytes) = self.store.read_file(path).await? else {
            return Ok(None);
        };
        if bytes.is_empty() {
            return Ok(None);
        }
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| UpdaterError::validation(format!("{path} is not valid UTF-8")))
    }
}
