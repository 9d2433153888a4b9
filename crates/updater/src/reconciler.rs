//! Decides whether the local payload has to be refreshed.

use serde::Serialize;

use crate::artifact::CachedArtifact;
use crate::descriptor::RemoteVersionDescriptor;
use crate::error::Result;
use crate::hasher::ContentHasher;

/// Why a decision was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileReason {
    Forced,
    NoLocalArtifact,
    DigestMismatch,
    UpToDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub need_update: bool,
    pub reason: ReconcileReason,
    /// Digest recomputed from the local content, when there is one.
    pub local_digest: Option<String>,
}

/// Outcome of a side-effect free update check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub need_update: bool,
    pub local_digest: Option<String>,
    pub remote_digest: String,
    pub forced: bool,
}

/// Compare a local snapshot against the remote descriptor. Neither input is
/// modified. The forced flag wins over everything, then a missing local
/// artifact, then the digest comparison.
pub fn reconcile(
    local: Option<&CachedArtifact>,
    remote: &RemoteVersionDescriptor,
    hasher: &dyn ContentHasher,
) -> Result<Reconciliation> {
    let local_digest = match local {
        Some(artifact) => Some(hasher.digest(artifact.content.as_bytes())?),
        None => None,
    };

    let reason = if remote.forced {
        ReconcileReason::Forced
    } else {
        match &local_digest {
            None => ReconcileReason::NoLocalArtifact,
            Some(digest) if !digest.eq_ignore_ascii_case(&remote.digest) => {
                ReconcileReason::DigestMismatch
            }
            Some(_) => ReconcileReason::UpToDate,
        }
    };

    tracing::debug!(
        ?reason,
        local = local_digest.as_deref().unwrap_or("-"),
        remote = %remote.digest,
        "reconciled versions"
    );

    Ok(Reconciliation {
        need_update: reason != ReconcileReason::UpToDate,
        reason,
        local_digest,
    })
}

/// Same decision as [`reconcile`], packaged for diagnostics.
pub fn probe(
    local: Option<&CachedArtifact>,
    remote: &RemoteVersionDescriptor,
    hasher: &dyn ContentHasher,
) -> Result<ProbeReport> {
    let decision = reconcile(local, remote, hasher)?;
    Ok(ProbeReport {
        need_update: decision.need_update,
        local_digest: decision.local_digest,
        remote_digest: remote.digest.clone(),
        forced: remote.forced,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HashError, UpdaterError};
    use crate::hasher::Md5Hasher;

    fn local(content: &str) -> CachedArtifact {
        CachedArtifact {
            content: content.to_string(),
            digest: Md5Hasher.digest(content.as_bytes()).unwrap(),
            path: "latest.js".into(),
        }
    }

    fn remote(digest: &str, forced: bool) -> RemoteVersionDescriptor {
        RemoteVersionDescriptor {
            digest: digest.to_string(),
            download_url: "https://x/latest.js".into(),
            forced,
        }
    }

    #[test]
    fn forced_wins_even_with_equal_digests() {
        let artifact = local("run()");
        let decision = reconcile(Some(&artifact), &remote(&artifact.digest, true), &Md5Hasher)
            .unwrap();
        assert!(decision.need_update);
        assert_eq!(decision.reason, ReconcileReason::Forced);
    }

    #[test]
    fn equal_digests_are_up_to_date() {
        let artifact = local("run()");
        let decision = reconcile(Some(&artifact), &remote(&artifact.digest, false), &Md5Hasher)
            .unwrap();
        assert!(!decision.need_update);
        assert_eq!(decision.reason, ReconcileReason::UpToDate);
        assert_eq!(decision.local_digest, Some(artifact.digest));
    }

    #[test]
    fn missing_local_or_different_digest_needs_update() {
        let missing = reconcile(None, &remote("abc", false), &Md5Hasher).unwrap();
        assert_eq!(missing.reason, ReconcileReason::NoLocalArtifact);
        assert!(missing.need_update);

        let artifact = local("run()");
        let stale = reconcile(Some(&artifact), &remote("abc", false), &Md5Hasher).unwrap();
        assert_eq!(stale.reason, ReconcileReason::DigestMismatch);
    }

    #[test]
    fn digest_is_recomputed_from_content() {
        let mut artifact = local("run()");
        artifact.digest = "stale".into();
        let fresh = Md5Hasher.digest(b"run()").unwrap();
        let report = probe(Some(&artifact), &remote(&fresh, false), &Md5Hasher).unwrap();
        assert!(!report.need_update);
        assert_eq!(report.local_digest.as_deref(), Some(fresh.as_str()));
        assert!(!report.forced);
    }

    struct BrokenHasher;

    impl ContentHasher for BrokenHasher {
        fn digest(&self, _content: &[u8]) -> std::result::Result<String, HashError> {
            Err(HashError::Unavailable("engine not initialised".into()))
        }

        fn algorithm(&self) -> crate::config::DigestAlgorithm {
            crate::config::DigestAlgorithm::Md5
        }
    }

    #[test]
    fn hashing_failure_is_reported() {
        let artifact = local("run()");
        assert!(matches!(
            reconcile(Some(&artifact), &remote("abc", false), &BrokenHasher),
            Err(UpdaterError::HashingUnavailable(_))
        ));
    }
}
