//! Updater configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, UpdaterError};

/// Version endpoint used when none is configured.
pub const DEFAULT_SERVER_URL: &str = "https://open.lihouse.xyz/apk/elixir/query/";

/// Scripts, stylesheets and common images referenced by absolute http(s) URL.
/// Query strings are part of the match; `\b` keeps `.js` from matching `.json`.
pub const DEFAULT_RESOURCE_PATTERN: &str =
    r"https?://[a-z0-9\-_.]+(?::\d+)?/[a-z0-9\-_./]+\.(?:jsx?|css|png|jpe?g|gif|svg|webp)\b(?:\?[a-z0-9\-_=&.%]*)?";

/// Digest engine selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// MD5, the digest advertised by the version endpoint.
    #[default]
    Md5,
    Sha256,
}

/// Names of the three well-known files in the storage root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalLayout {
    pub payload: String,
    pub processed: String,
    pub marker: String,
}

/// Updater configuration. Every field has a default so partial JSON files work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Base URL of the version endpoint; the URL-encoded app id is appended.
    pub server_url: String,
    /// Application identifier queried at the version endpoint.
    pub app_id: String,
    /// Directory backing the file store.
    pub storage_root: PathBuf,
    pub payload_file: String,
    pub processed_file: String,
    pub marker_file: String,
    pub version_timeout_ms: u64,
    pub download_timeout_ms: u64,
    /// Case-insensitive pattern recognising external resource URLs.
    pub resource_pattern: String,
    /// Lowercase extension to storage subdirectory. Extensions the pattern
    /// matches but this table lacks are skipped as unsupported.
    pub resource_dirs: BTreeMap<String, String>,
    /// Prefix written before the store-relative path of a rewritten resource.
    pub local_reference_base: String,
    pub digest_algorithm: DigestAlgorithm,
    /// Reject downloads whose digest differs from the advertised one.
    pub verify_payload_digest: bool,
    /// Values handed to the executor alongside every payload.
    pub bindings: Map<String, Value>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            app_id: String::new(),
            storage_root: default_storage_root(),
            payload_file: "latest.js".to_string(),
            processed_file: "latest_processed.js".to_string(),
            marker_file: "lock.lock".to_string(),
            version_timeout_ms: 10_000,
            download_timeout_ms: 30_000,
            resource_pattern: DEFAULT_RESOURCE_PATTERN.to_string(),
            resource_dirs: default_resource_dirs(),
            local_reference_base: String::new(),
            digest_algorithm: DigestAlgorithm::Md5,
            verify_payload_digest: true,
            bindings: Map::new(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bundle-sync")
}

fn default_resource_dirs() -> BTreeMap<String, String> {
    [
        ("js", "js/"),
        ("jsx", "js/"),
        ("css", "css/"),
        ("jpg", "jpg/"),
        ("jpeg", "jpg/"),
        ("png", "png/"),
    ]
    .into_iter()
    .map(|(ext, dir)| (ext.to_string(), dir.to_string()))
    .collect()
}

impl UpdaterConfig {
    /// Create a configuration for `app_id` with every other field defaulted.
    pub fn for_app(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            UpdaterError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        serde_json::from_str(&raw)
            .map_err(|err| UpdaterError::Config(format!("cannot parse {}: {err}", path.display())))
    }

    /// Check the configuration for values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.app_id.trim().is_empty() {
            return Err(UpdaterError::Config("app_id must be set".into()));
        }
        if self.server_url.trim().is_empty() {
            return Err(UpdaterError::Config("server_url must be set".into()));
        }
        let names = [&self.payload_file, &self.processed_file, &self.marker_file];
        if names.iter().any(|name| name.trim().is_empty()) {
            return Err(UpdaterError::Config("file names must not be empty".into()));
        }
        if names[0] == names[1] || names[0] == names[2] || names[1] == names[2] {
            return Err(UpdaterError::Config(
                "payload, processed and marker files must differ".into(),
            ));
        }
        if self.version_timeout_ms == 0 || self.download_timeout_ms == 0 {
            return Err(UpdaterError::Config("timeouts must be positive".into()));
        }
        self.resource_regex()?;
        Ok(())
    }

    /// Compile [`Self::resource_pattern`].
    pub fn resource_regex(&self) -> Result<Regex> {
        RegexBuilder::new(&self.resource_pattern)
            .case_insensitive(true)
            .build()
            .map_err(|err| UpdaterError::Config(format!("invalid resource pattern: {err}")))
    }

    pub fn layout(&self) -> LocalLayout {
        LocalLayout {
            payload: self.payload_file.clone(),
            processed: self.processed_file.clone(),
            marker: self.marker_file.clone(),
        }
    }

    pub fn version_timeout(&self) -> Duration {
        Duration::from_millis(self.version_timeout_ms)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_millis(self.download_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: UpdaterConfig =
            serde_json::from_str(r#"{ "app_id": "com.example.app", "download_timeout_ms": 5 }"#)
                .unwrap();
        assert_eq!(config.app_id, "com.example.app");
        assert_eq!(config.download_timeout(), Duration::from_millis(5));
        assert_eq!(config.payload_file, "latest.js");
        assert_eq!(config.digest_algorithm, DigestAlgorithm::Md5);
        assert_eq!(config.resource_dirs.get("jpeg").map(String::as_str), Some("jpg/"));
        config.validate().unwrap();
    }

    #[test]
    fn validation_rejects_unusable_values() {
        assert!(UpdaterConfig::default().validate().is_err());

        let mut config = UpdaterConfig::for_app("app");
        config.marker_file = config.payload_file.clone();
        assert!(matches!(config.validate(), Err(UpdaterError::Config(_))));

        let mut config = UpdaterConfig::for_app("app");
        config.resource_pattern = "(".into();
        assert!(config.validate().is_err());

        let mut config = UpdaterConfig::for_app("app");
        config.version_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_pattern_matches_resources_and_not_json() {
        let regex = UpdaterConfig::default().resource_regex().unwrap();
        let text = r#"a("https://cdn.example.com/img/Logo.PNG?v=2"); b("https://cdn.example.com/data.json");"#;
        let found: Vec<&str> = regex.find_iter(text).map(|m| m.as_str()).collect();
        assert_eq!(found, vec!["https://cdn.example.com/img/Logo.PNG?v=2"]);
    }
}
