use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UpdaterError};
use crate::transport::Transport;

/// Latest release as advertised by the version endpoint. Fetched fresh for
/// every reconciliation and never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVersionDescriptor {
    /// Digest of the published payload.
    pub digest: String,
    /// Where the payload can be downloaded. May be empty, in which case only
    /// decisions (not downloads) can be made from this descriptor.
    pub download_url: String,
    /// Refresh regardless of the digest comparison.
    pub forced: bool,
}

impl RemoteVersionDescriptor {
    /// Download URL, rejecting descriptors that do not carry one.
    pub fn require_download_url(&self) -> Result<&str> {
        let url = self.download_url.trim();
        if url.is_empty() {
            return Err(UpdaterError::MalformedRemoteDescriptor(
                "descriptor does not provide a download url".into(),
            ));
        }
        Ok(url)
    }
}

/// Wire format: `{ "status": bool, "data": { "md5", "url", "ifForced" } }`.
#[derive(Debug, Deserialize)]
struct VersionResponse {
    status: bool,
    #[serde(default)]
    data: Option<VersionData>,
}

#[derive(Debug, Deserialize)]
struct VersionData {
    md5: String,
    #[serde(default)]
    url: String,
    #[serde(default, rename = "ifForced")]
    if_forced: Option<bool>,
}

/// Parse a version endpoint response body.
pub fn parse_descriptor(body: &str) -> Result<RemoteVersionDescriptor> {
    let response: VersionResponse = serde_json::from_str(body)
        .map_err(|err| UpdaterError::MalformedRemoteDescriptor(format!("invalid json: {err}")))?;
    if !response.status {
        return Err(UpdaterError::MalformedRemoteDescriptor(
            "endpoint reported status=false".into(),
        ));
    }
    let data = response
        .data
        .ok_or_else(|| UpdaterError::MalformedRemoteDescriptor("missing data".into()))?;
    if data.md5.trim().is_empty() {
        return Err(UpdaterError::MalformedRemoteDescriptor("empty digest".into()));
    }
    Ok(RemoteVersionDescriptor {
        digest: data.md5.trim().to_ascii_lowercase(),
        download_url: data.url,
        forced: data.if_forced.unwrap_or(false),
    })
}

/// The `<server>/<urlEncodedAppId>` endpoint.
#[derive(Debug, Clone)]
pub struct VersionEndpoint {
    url: String,
    timeout: Duration,
}

impl VersionEndpoint {
    pub fn new(server_url: &str, app_id: &str, timeout: Duration) -> Self {
        let separator = if server_url.ends_with('/') { "" } else { "/" };
        Self {
            url: format!("{server_url}{separator}{}", urlencoding::encode(app_id)),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Query the endpoint for the current release.
    pub async fn fetch(&self, transport: &dyn Transport) -> Result<RemoteVersionDescriptor> {
        tracing::debug!(url = %self.url, "querying version endpoint");
        let body = transport.fetch_text(&self.url, self.timeout).await?;
        let descriptor = parse_descriptor(&body)?;
        tracing::info!(
            digest = %descriptor.digest,
            url = %descriptor.download_url,
            forced = descriptor.forced,
            "remote version descriptor received"
        );
        Ok(descriptor)
    }
}
