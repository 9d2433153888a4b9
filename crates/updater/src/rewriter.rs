//! Localises the external resources a payload references.
//!
//! Every distinct resource URL is downloaded concurrently into a per-type
//! directory under a name derived from the URL's digest, and the payload is
//! rewritten to point at the local copies. A resource that cannot be fetched
//! or has no storage directory keeps its remote URL; the pass still promotes
//! the result.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use regex::{Captures, Regex};

use crate::artifact::{ArtifactCache, ProcessedArtifact, ResourceFailure, ResourceMapping};
use crate::config::UpdaterConfig;
use crate::error::Result;
use crate::hasher::ContentHasher;
use crate::store::StoreExt;
use crate::transport::Transport;

/// Number of digest characters used in local resource names.
const NAME_DIGEST_LEN: usize = 16;

pub struct ResourceRewriter {
    cache: ArtifactCache,
    transport: Arc<dyn Transport>,
    hasher: Arc<dyn ContentHasher>,
    pattern: Regex,
    resource_dirs: BTreeMap<String, String>,
    reference_base: String,
    timeout: Duration,
}

enum Plan {
    Download(PlannedResource),
    Skip(String),
}

/// A resource scheduled for download.
struct PlannedResource {
    url: String,
    store_path: String,
    reference: String,
}

impl ResourceRewriter {
    pub fn new(
        cache: ArtifactCache,
        transport: Arc<dyn Transport>,
        hasher: Arc<dyn ContentHasher>,
        config: &UpdaterConfig,
    ) -> Result<Self> {
        Ok(Self {
            cache,
            transport,
            hasher,
            pattern: config.resource_regex()?,
            resource_dirs: config.resource_dirs.clone(),
            reference_base: config.local_reference_base.clone(),
            timeout: config.download_timeout(),
        })
    }

    /// Distinct resource URLs in order of first appearance.
    pub fn extract_urls(&self, content: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        self.pattern
            .find_iter(content)
            .map(|found| found.as_str())
            .filter(|url| seen.insert(*url))
            .map(str::to_string)
            .collect()
    }

    pub async fn rewrite(&self, content: &str) -> Result<ProcessedArtifact> {
        self.rewrite_with_progress(content, &|_, _| {}).await
    }

    /// Rewrite `content` and promote the result. `observer` receives
    /// `(settled, total)` each time a resource download finishes.
    pub async fn rewrite_with_progress(
        &self,
        content: &str,
        observer: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> Result<ProcessedArtifact> {
        self.cache.clear_processed().await?;

        let urls = self.extract_urls(content);
        tracing::info!(resources = urls.len(), "rewriting payload resources");

        let mut failures = Vec::new();
        let mut planned = Vec::new();
        for url in urls {
            match self.plan(&url)? {
                Plan::Download(resource) => planned.push(resource),
                Plan::Skip(reason) => {
                    tracing::warn!(%url, %reason, "skipping resource");
                    failures.push(ResourceFailure { url, reason });
                }
            }
        }

        let mappings = self.localise(&planned, &mut failures, observer).await;
        let rewritten = apply_mappings(&self.pattern, content, &mappings);

        self.cache.promote(&rewritten).await?;

        if failures.is_empty() {
            tracing::info!(localised = mappings.len(), "all resources localised");
        } else {
            tracing::warn!(
                localised = mappings.len(),
                failed = failures.len(),
                "resources partially localised"
            );
        }

        Ok(ProcessedArtifact {
            content: rewritten,
            mappings,
            failures,
        })
    }

    /// Decide where a resource goes. Digest failures abort the whole pass.
    fn plan(&self, url: &str) -> Result<Plan> {
        let without_query = url.split(['?', '#']).next().unwrap_or(url);
        let file_name = without_query.rsplit('/').next().unwrap_or(without_query);
        let extension = match file_name.rsplit_once('.') {
            Some((_, extension)) if !extension.is_empty() => extension,
            _ => return Ok(Plan::Skip("resource has no extension".to_string())),
        };
        let Some(dir) = self.resource_dirs.get(&extension.to_ascii_lowercase()) else {
            return Ok(Plan::Skip(format!("unsupported resource type .{extension}")));
        };

        let digest = self.hasher.digest(url.as_bytes())?;
        let short: String = digest.chars().take(NAME_DIGEST_LEN).collect();
        let dir = dir.trim_matches('/');
        let store_path = if dir.is_empty() {
            format!("{short}.{extension}")
        } else {
            format!("{dir}/{short}.{extension}")
        };

        Ok(Plan::Download(PlannedResource {
            url: url.to_string(),
            reference: format!("{}{store_path}", self.reference_base),
            store_path,
        }))
    }

    async fn localise(
        &self,
        planned: &[PlannedResource],
        failures: &mut Vec<ResourceFailure>,
        observer: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> ResourceMapping {
        let total = planned.len();
        let settled = AtomicUsize::new(0);

        let downloads = planned.iter().map(|resource| {
            let settled = &settled;
            async move {
                let outcome = self.fetch_and_store(resource).await;
                let done = settled.fetch_add(1, Ordering::SeqCst) + 1;
                observer(done, total);
                outcome
            }
        });

        let mut mappings = ResourceMapping::default();
        for (resource, outcome) in planned.iter().zip(join_all(downloads).await) {
            match outcome {
                Ok(()) => {
                    tracing::debug!(url = %resource.url, local = %resource.reference, "resource localised");
                    mappings.insert(resource.url.clone(), resource.reference.clone());
                }
                Err(err) => {
                    tracing::warn!(url = %resource.url, %err, "resource download failed");
                    failures.push(ResourceFailure {
                        url: resource.url.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        mappings
    }

    async fn fetch_and_store(&self, resource: &PlannedResource) -> Result<()> {
        let bytes = self
            .transport
            .fetch_binary(&resource.url, self.timeout)
            .await?;
        self.cache
            .store()
            .write_file(&resource.store_path, &bytes)
            .await?;
        Ok(())
    }
}

/// Replace every mapped URL match with its local reference. Only whole
/// matches are touched, so an unmapped URL that merely starts with a mapped
/// one keeps its remote form.
fn apply_mappings(pattern: &Regex, content: &str, mappings: &ResourceMapping) -> String {
    pattern
        .replace_all(content, |caps: &Captures<'_>| {
            let url = &caps[0];
            mappings.get(url).unwrap_or(url).to_string()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ProcessedState;
    use crate::error::{StoreError, TransportError, UpdaterError};
    use crate::hasher::Md5Hasher;
    use crate::store::{Handle, MemoryStore, ResourceStore};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MockTransport {
        responses: HashMap<String, std::result::Result<Bytes, TransportError>>,
        requests: Mutex<Vec<String>>,
    }

    impl MockTransport {
        fn serving(mut self, url: &str, body: &[u8]) -> Self {
            self.responses
                .insert(url.to_string(), Ok(Bytes::copy_from_slice(body)));
            self
        }

        fn failing(mut self, url: &str, err: TransportError) -> Self {
            self.responses.insert(url.to_string(), Err(err));
            self
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn fetch_text(
            &self,
            url: &str,
            timeout: Duration,
        ) -> std::result::Result<String, TransportError> {
            let bytes = self.fetch_binary(url, timeout).await?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }

        async fn fetch_binary(
            &self,
            url: &str,
            _timeout: Duration,
        ) -> std::result::Result<Bytes, TransportError> {
            self.requests.lock().push(url.to_string());
            self.responses
                .get(url)
                .cloned()
                .unwrap_or(Err(TransportError::HttpStatus(404)))
        }
    }

    /// Delegates to a [`MemoryStore`] but refuses to create one file name.
    struct RefusingStore {
        inner: MemoryStore,
        refused: &'static str,
    }

    #[async_trait]
    impl ResourceStore for RefusingStore {
        async fn open(&self, path: &str) -> std::result::Result<Handle, StoreError> {
            self.inner.open(path).await
        }
        async fn open_child(&self, dir: Handle, name: &str) -> std::result::Result<Handle, StoreError> {
            self.inner.open_child(dir, name).await
        }
        async fn create_child(
            &self,
            dir: Handle,
            name: &str,
            exclusive: bool,
        ) -> std::result::Result<Handle, StoreError> {
            if name == self.refused {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "read-only",
                )));
            }
            self.inner.create_child(dir, name, exclusive).await
        }
        async fn create_dir(
            &self,
            dir: Handle,
            name: &str,
            exclusive: bool,
        ) -> std::result::Result<Handle, StoreError> {
            self.inner.create_dir(dir, name, exclusive).await
        }
        async fn list(&self, dir: Handle) -> std::result::Result<Vec<String>, StoreError> {
            self.inner.list(dir).await
        }
        async fn read(&self, file: Handle) -> std::result::Result<Vec<u8>, StoreError> {
            self.inner.read(file).await
        }
        async fn write(
            &self,
            file: Handle,
            bytes: &[u8],
            append: bool,
        ) -> std::result::Result<(), StoreError> {
            self.inner.write(file, bytes, append).await
        }
        async fn remove(&self, entry: Handle) -> std::result::Result<(), StoreError> {
            self.inner.remove(entry).await
        }
        fn release(&self, handle: Handle) -> std::result::Result<(), StoreError> {
            self.inner.release(handle)
        }
    }

    fn rewriter(
        store: Arc<dyn ResourceStore>,
        transport: MockTransport,
    ) -> (ResourceRewriter, ArtifactCache) {
        let config = UpdaterConfig::for_app("app");
        let hasher: Arc<dyn ContentHasher> = Arc::new(Md5Hasher);
        let cache = ArtifactCache::new(store, hasher.clone(), config.layout());
        let rewriter =
            ResourceRewriter::new(cache.clone(), Arc::new(transport), hasher, &config).unwrap();
        (rewriter, cache)
    }

    fn local_name(url: &str, dir: &str, ext: &str) -> String {
        let digest = Md5Hasher.digest(url.as_bytes()).unwrap();
        format!("{dir}/{}.{ext}", &digest[..16])
    }

    #[tokio::test]
    async fn content_without_resources_is_promoted_verbatim() {
        let store = Arc::new(MemoryStore::new());
        let (rewriter, cache) = rewriter(store.clone(), MockTransport::default());

        let artifact = rewriter.rewrite("console.log('offline');").await.unwrap();

        assert_eq!(artifact.content, "console.log('offline');");
        assert!(artifact.mappings.is_empty());
        assert_eq!(cache.processed_state().await.unwrap(), ProcessedState::Promoted);
        assert_eq!(
            store.file("latest_processed.js").as_deref(),
            Some(&b"console.log('offline');"[..])
        );
        assert_eq!(store.file("lock.lock").as_deref(), Some(&b""[..]));
    }

    #[tokio::test]
    async fn repeated_urls_are_fetched_once_and_all_rewritten() {
        let url = "https://cdn.example.com/app/main.css?v=3";
        let store = Arc::new(MemoryStore::new());
        let transport = MockTransport::default().serving(url, b"body{}");
        let (rewriter, _) = rewriter(store.clone(), transport);

        let content = format!("load('{url}'); reload('{url}');");
        let artifact = rewriter.rewrite(&content).await.unwrap();

        let local = local_name(url, "css", "css");
        assert_eq!(artifact.content, format!("load('{local}'); reload('{local}');"));
        assert_eq!(artifact.mappings.get(url), Some(local.as_str()));
        assert_eq!(store.file(&local).as_deref(), Some(&b"body{}"[..]));
    }

    #[tokio::test]
    async fn failed_and_unsupported_resources_do_not_abort_the_batch() {
        let ok = "https://cdn.example.com/a.js";
        let broken = "https://cdn.example.com/img/b.png";
        let gif = "https://cdn.example.com/img/c.gif";
        let store = Arc::new(MemoryStore::new());
        let transport = MockTransport::default()
            .serving(ok, b"a()")
            .failing(broken, TransportError::Timeout);
        let (rewriter, cache) = rewriter(store.clone(), transport);

        let content = format!("[\"{ok}\", \"{broken}\", \"{gif}\"]");
        let artifact = rewriter.rewrite(&content).await.unwrap();

        let local = local_name(ok, "js", "js");
        assert_eq!(
            artifact.content,
            format!("[\"{local}\", \"{broken}\", \"{gif}\"]")
        );
        let failed: Vec<&str> = artifact.failures.iter().map(|f| f.url.as_str()).collect();
        assert!(failed.contains(&broken));
        assert!(failed.contains(&gif));
        assert_eq!(cache.processed_state().await.unwrap(), ProcessedState::Promoted);
    }

    #[tokio::test]
    async fn marker_failure_leaves_no_processed_payload() {
        let store = Arc::new(RefusingStore {
            inner: MemoryStore::new(),
            refused: "lock.lock",
        });
        let (rewriter, _) = rewriter(store.clone(), MockTransport::default());

        let result = rewriter.rewrite("run();").await;

        assert!(matches!(result, Err(UpdaterError::Store(_))));
        assert!(store.inner.file("latest_processed.js").is_none());
        assert!(store.inner.file("lock.lock").is_none());
        assert_eq!(store.inner.live_handles(), 0);
    }

    #[tokio::test]
    async fn previous_processed_payload_is_removed_first() {
        let store = Arc::new(MemoryStore::new());
        let (rewriter, cache) = rewriter(store.clone(), MockTransport::default());
        cache.promote("stale()").await.unwrap();

        let artifact = rewriter.rewrite("fresh()").await.unwrap();
        assert_eq!(artifact.content, "fresh()");
        assert_eq!(
            cache.load_processed().await.unwrap().as_deref(),
            Some("fresh()")
        );
    }

    #[tokio::test]
    async fn observer_sees_every_resource_settle() {
        let urls = [
            "https://cdn.example.com/1.js",
            "https://cdn.example.com/2.css",
            "https://cdn.example.com/3.jpeg",
        ];
        let transport = urls
            .iter()
            .fold(MockTransport::default(), |t, url| t.serving(url, b"x"));
        let (rewriter, _) = rewriter(Arc::new(MemoryStore::new()), transport);
        let seen = Mutex::new(Vec::new());

        let content = urls.join(" ");
        rewriter
            .rewrite_with_progress(&content, &|done, total| seen.lock().push((done, total)))
            .await
            .unwrap();

        let mut seen = seen.into_inner();
        seen.sort();
        assert_eq!(seen, vec![(1, 3), (2, 3), (3, 3)]);
    }

    struct BrokenHasher;

    impl ContentHasher for BrokenHasher {
        fn digest(&self, _content: &[u8]) -> std::result::Result<String, crate::error::HashError> {
            Err(crate::error::HashError::Unavailable("not initialised".into()))
        }

        fn algorithm(&self) -> crate::config::DigestAlgorithm {
            crate::config::DigestAlgorithm::Md5
        }
    }

    #[tokio::test]
    async fn hashing_failure_aborts_resource_naming() {
        let config = UpdaterConfig::for_app("app");
        let store = Arc::new(MemoryStore::new());
        let hasher: Arc<dyn ContentHasher> = Arc::new(BrokenHasher);
        let cache = ArtifactCache::new(store.clone(), hasher.clone(), config.layout());
        let rewriter =
            ResourceRewriter::new(cache, Arc::new(MockTransport::default()), hasher, &config)
                .unwrap();

        let result = rewriter.rewrite("load('https://cdn.example.com/a.js')").await;
        assert!(matches!(result, Err(UpdaterError::HashingUnavailable(_))));
        assert!(store.file("lock.lock").is_none());
    }

    #[test]
    fn prefix_urls_do_not_corrupt_longer_ones() {
        let pattern = UpdaterConfig::for_app("app").resource_regex().unwrap();
        let mut mappings = ResourceMapping::default();
        mappings.insert("https://c/a.js", "js/short.js");
        mappings.insert("https://c/a.js?v=2", "js/long.js");
        let text = apply_mappings(
            &pattern,
            "x('https://c/a.js?v=2'); y('https://c/a.js');",
            &mappings,
        );
        assert_eq!(text, "x('js/long.js'); y('js/short.js');");
    }

    #[tokio::test]
    async fn failed_url_extending_a_mapped_one_stays_remote() {
        let short = "https://cdn.test/a.js";
        let long = "https://cdn.test/a.jsx";
        let transport = MockTransport::default()
            .serving(short, b"a()")
            .failing(long, TransportError::Timeout);
        let (rewriter, _) = rewriter(Arc::new(MemoryStore::new()), transport);

        let content = format!("load('{short}'); load('{long}');");
        let artifact = rewriter.rewrite(&content).await.unwrap();

        assert_eq!(
            artifact.content,
            format!("load('{}'); load('{long}');", local_name(short, "js", "js"))
        );
        assert_eq!(artifact.failures.len(), 1);
        assert_eq!(artifact.failures[0].url, long);
    }

    /// Returns a non-ASCII digest to exercise local name derivation.
    struct AccentHasher;

    impl ContentHasher for AccentHasher {
        fn digest(&self, _content: &[u8]) -> std::result::Result<String, crate::error::HashError> {
            Ok("é".repeat(20))
        }

        fn algorithm(&self) -> crate::config::DigestAlgorithm {
            crate::config::DigestAlgorithm::Md5
        }
    }

    #[tokio::test]
    async fn non_ascii_digest_is_truncated_by_characters() {
        let config = UpdaterConfig::for_app("app");
        let store = Arc::new(MemoryStore::new());
        let hasher: Arc<dyn ContentHasher> = Arc::new(AccentHasher);
        let cache = ArtifactCache::new(store.clone(), hasher.clone(), config.layout());
        let url = "https://cdn.example.com/a.js";
        let transport = MockTransport::default().serving(url, b"a()");
        let rewriter = ResourceRewriter::new(cache, Arc::new(transport), hasher, &config).unwrap();

        let artifact = rewriter.rewrite(&format!("load('{url}')")).await.unwrap();

        let expected = format!("js/{}.js", "é".repeat(16));
        assert_eq!(artifact.mappings.get(url), Some(expected.as_str()));
        assert!(store.file(&expected).is_some());
    }
}
