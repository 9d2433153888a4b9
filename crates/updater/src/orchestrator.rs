//! End-to-end update run.
//!
//! A run first executes the best payload already on disk, so startup never
//! waits on the network when a usable copy exists, and only then reconciles
//! with the remote release. A refresh found after a successful local run is
//! downloaded and promoted for the next start but not executed again. When
//! nothing local is runnable the run depends on the download and executes
//! whatever it produced.
//!
//! Transport and storage failures during the refresh fall back to the cached
//! payload; only the absence of anything executable fails the run.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;

use crate::artifact::{ArtifactCache, CachedArtifact, ProcessedArtifact, ProcessedState};
use crate::config::UpdaterConfig;
use crate::descriptor::{RemoteVersionDescriptor, VersionEndpoint};
use crate::error::{ExecutionError, Result, UpdaterError};
use crate::executor::CodeExecutor;
use crate::hasher::{hasher_for, ContentHasher};
use crate::progress::{ProgressBand, ProgressReader, ProgressTracker, UpdateState};
use crate::reconciler::{self, ProbeReport};
use crate::rewriter::ResourceRewriter;
use crate::store::{FsStore, ResourceStore};
use crate::transport::{HttpTransport, Transport};

const INITIALIZING: u8 = 5;
const LOCAL_START: u8 = 10;
const LOCAL_DONE: u8 = 20;
const CHECKING: u8 = 30;
const QUERYING: u8 = 35;
const DOWNLOADING: u8 = 40;
const DOWNLOADED: u8 = 50;
const EXECUTING: u8 = 90;

const LOCAL_REWRITE: ProgressBand = ProgressBand::new(LOCAL_START, LOCAL_DONE);
const UPDATE_REWRITE: ProgressBand = ProgressBand::new(DOWNLOADED, 85);

/// Outcome of [`UpdateOrchestrator::run`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub success: bool,
    /// A newer payload was downloaded during this run.
    pub updated: bool,
    pub executed: bool,
    pub error: Option<String>,
}

/// Outcome of a reconcile-and-download pass.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub need_update: bool,
    /// A new payload was downloaded and persisted.
    pub updated: bool,
    /// Raw payload that is now current: the download, or the cached copy.
    pub content: Option<String>,
    /// Rewritten payload, when the rewrite pass for a download succeeded.
    pub processed: Option<ProcessedArtifact>,
}

impl SyncOutcome {
    fn unchanged(local: Option<CachedArtifact>) -> Self {
        Self {
            need_update: false,
            updated: false,
            content: local.map(|artifact| artifact.content),
            processed: None,
        }
    }
}

/// Which local artifact ended up running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalSource {
    /// Promoted processed payload.
    Processed,
    /// Processed payload rebuilt from the raw payload in this run.
    Rederived,
    /// Raw payload, resources still remote.
    Raw,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalExecution {
    pub source: LocalSource,
    pub value: Value,
}

/// Builder for [`UpdateOrchestrator`].
pub struct UpdateOrchestratorBuilder {
    config: UpdaterConfig,
    store: Option<Arc<dyn ResourceStore>>,
    transport: Option<Arc<dyn Transport>>,
    hasher: Option<Arc<dyn ContentHasher>>,
    executor: Option<Arc<dyn CodeExecutor>>,
}

impl UpdateOrchestratorBuilder {
    fn new(config: UpdaterConfig) -> Self {
        Self {
            config,
            store: None,
            transport: None,
            hasher: None,
            executor: None,
        }
    }

    /// Storage to use instead of an [`FsStore`] at `storage_root`.
    pub fn with_store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Transport to use instead of the default [`HttpTransport`].
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Hasher to use instead of the configured algorithm.
    pub fn with_hasher(mut self, hasher: Arc<dyn ContentHasher>) -> Self {
        self.hasher = Some(hasher);
        self
    }

    /// Host capability that runs payloads. Required.
    pub fn with_executor(mut self, executor: Arc<dyn CodeExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(self) -> Result<UpdateOrchestrator> {
        self.config.validate()?;
        let executor = self
            .executor
            .ok_or_else(|| UpdaterError::Config("an executor is required".into()))?;
        let store: Arc<dyn ResourceStore> = match self.store {
            Some(store) => store,
            None => Arc::new(FsStore::new(&self.config.storage_root)?),
        };
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::builder().build()?),
        };
        let hasher = self
            .hasher
            .unwrap_or_else(|| hasher_for(self.config.digest_algorithm));

        let cache = ArtifactCache::new(store, hasher.clone(), self.config.layout());
        let rewriter =
            ResourceRewriter::new(cache.clone(), transport.clone(), hasher.clone(), &self.config)?;
        let endpoint = VersionEndpoint::new(
            &self.config.server_url,
            &self.config.app_id,
            self.config.version_timeout(),
        );

        Ok(UpdateOrchestrator {
            config: self.config,
            cache,
            rewriter,
            transport,
            hasher,
            executor,
            endpoint,
            progress: ProgressTracker::new(),
        })
    }
}

/// Drives load-local, reconcile, download, rewrite, promote and execute.
///
/// Operations that change local state take `&mut self`; one run at a time
/// is the caller's contract and the borrow checker enforces it. Progress can
/// be polled concurrently through [`UpdateOrchestrator::progress`].
pub struct UpdateOrchestrator {
    config: UpdaterConfig,
    cache: ArtifactCache,
    rewriter: ResourceRewriter,
    transport: Arc<dyn Transport>,
    hasher: Arc<dyn ContentHasher>,
    executor: Arc<dyn CodeExecutor>,
    endpoint: VersionEndpoint,
    progress: ProgressTracker,
}

impl UpdateOrchestrator {
    pub fn builder(config: UpdaterConfig) -> UpdateOrchestratorBuilder {
        UpdateOrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    /// Poll handle for the progress of the current or last run.
    pub fn progress(&self) -> ProgressReader {
        self.progress.reader()
    }

    /// Run the full state machine to completion.
    pub async fn run(&mut self) -> RunReport {
        self.progress.reset();
        tracing::info!(app_id = %self.config.app_id, "update run started");

        self.progress
            .advance(UpdateState::Initializing, INITIALIZING, "checking digest engine");
        if let Err(err) = self.hasher.self_test() {
            return self.run_without_hashing(err.into()).await;
        }

        self.progress.advance(
            UpdateState::ExecutingLocalCode,
            LOCAL_START,
            "running best local payload",
        );
        match self.run_best_local().await {
            Ok(local) => {
                tracing::info!(source = ?local.source, "local payload executed");
                self.progress.advance(
                    UpdateState::ExecutingLocalCode,
                    LOCAL_DONE,
                    "local payload executed",
                );
                self.refresh_after_local_run().await
            }
            Err(err) => self.run_update_dependent(err).await,
        }
    }

    /// Compare local and remote digests without downloading or writing anything.
    pub async fn probe(&self) -> Result<ProbeReport> {
        let local = self.cache.load_cached().await?;
        let remote = self.endpoint.fetch(self.transport.as_ref()).await?;
        reconciler::probe(local.as_ref(), &remote, self.hasher.as_ref())
    }

    /// Reconcile and download if needed, without executing anything.
    pub async fn sync(&mut self) -> Result<SyncOutcome> {
        self.progress.reset();
        match self.sync_inner(false).await {
            Ok(outcome) => {
                self.progress.complete("sync complete", None);
                Ok(outcome)
            }
            Err(err) => {
                self.progress.fail("sync failed", err.to_string());
                Err(err)
            }
        }
    }

    /// Download the advertised payload regardless of the cached digest and
    /// the forced flag. There is no fallback: failures are returned as is.
    pub async fn force_refresh(&mut self) -> Result<SyncOutcome> {
        self.progress.reset();
        tracing::info!("unconditional refresh requested");
        self.progress
            .advance(UpdateState::CheckingRemote, QUERYING, "querying version endpoint");
        let refreshed = match self.endpoint.fetch(self.transport.as_ref()).await {
            Ok(remote) => self.download_and_process(&remote, false).await,
            Err(err) => Err(err),
        };
        match refreshed {
            Ok(outcome) => {
                self.progress.complete("refresh complete", None);
                Ok(outcome)
            }
            Err(err) => {
                self.progress.fail("refresh failed", err.to_string());
                Err(err)
            }
        }
    }

    /// Execute the best local artifact: promoted processed payload, else a
    /// processed payload rebuilt from the raw one, else the raw payload.
    pub async fn execute_best_local(&mut self) -> Result<LocalExecution> {
        self.run_best_local().await
    }

    /// Execute the raw cached payload as is.
    pub async fn execute_cached(&self) -> Result<Value> {
        let code = self.cache.read_payload().await?.ok_or_else(|| {
            UpdaterError::NoExecutableContent("no cached payload".into())
        })?;
        Ok(self.execute(&code).await?)
    }

    async fn run_without_hashing(&mut self, err: UpdaterError) -> RunReport {
        tracing::error!(%err, "digest engine unavailable, skipping update check");
        self.progress.advance(
            UpdateState::ExecutingLocalCode,
            LOCAL_START,
            "running local payload without update check",
        );
        match self.run_best_local().await {
            Ok(local) => {
                tracing::info!(source = ?local.source, "local payload executed");
                self.progress
                    .complete("update check skipped", Some(err.to_string()));
                RunReport {
                    success: true,
                    updated: false,
                    executed: true,
                    error: None,
                }
            }
            Err(local_err) => {
                tracing::error!(err = %local_err, "no local payload could be run");
                self.progress.fail("digest engine unavailable", err.to_string());
                RunReport {
                    success: false,
                    updated: false,
                    executed: false,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    /// Local code already ran; refresh the cache for the next start.
    async fn refresh_after_local_run(&mut self) -> RunReport {
        match self.sync_inner(false).await {
            Ok(outcome) => {
                self.progress.complete("update run complete", None);
                RunReport {
                    success: true,
                    updated: outcome.updated,
                    executed: true,
                    error: None,
                }
            }
            Err(err) => {
                tracing::warn!(%err, "update check failed, local payload already running");
                self.progress
                    .complete("update check failed, local payload in use", Some(err.to_string()));
                RunReport {
                    success: true,
                    updated: false,
                    executed: true,
                    error: None,
                }
            }
        }
    }

    /// Nothing local could run; everything hinges on the refresh.
    async fn run_update_dependent(&mut self, local_err: UpdaterError) -> RunReport {
        tracing::warn!(err = %local_err, "no runnable local payload, update required");
        let outcome = match self.sync_inner(true).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let err = UpdaterError::NoExecutableContent(format!(
                    "local payload: {local_err}; update: {err}"
                ));
                return self.fail_run(err, false);
            }
        };

        let mut candidates = Vec::new();
        if let Some(processed) = outcome.processed {
            candidates.push(processed.content);
        }
        if let Some(raw) = outcome.content {
            if !candidates.contains(&raw) {
                candidates.push(raw);
            }
        }
        if candidates.is_empty() {
            let err = UpdaterError::NoExecutableContent(format!("local payload: {local_err}"));
            return self.fail_run(err, outcome.updated);
        }

        self.progress
            .advance(UpdateState::ExecutingCode, EXECUTING, "running payload");
        let mut last_err = None;
        for code in &candidates {
            match self.execute(code).await {
                Ok(_) => {
                    self.progress.complete("update run complete", None);
                    return RunReport {
                        success: true,
                        updated: outcome.updated,
                        executed: true,
                        error: None,
                    };
                }
                Err(err) => {
                    tracing::warn!(%err, "payload execution failed");
                    last_err = Some(err);
                }
            }
        }

        let err = match last_err {
            Some(err) => UpdaterError::from(err),
            None => UpdaterError::NoExecutableContent("nothing to run".into()),
        };
        self.fail_run(err, outcome.updated)
    }

    fn fail_run(&self, err: UpdaterError, updated: bool) -> RunReport {
        tracing::error!(%err, "update run failed");
        self.progress.fail("update run failed", err.to_string());
        RunReport {
            success: false,
            updated,
            executed: false,
            error: Some(err.to_string()),
        }
    }

    async fn run_best_local(&self) -> Result<LocalExecution> {
        if self.cache.processed_state().await? == ProcessedState::Promoted {
            if let Some(code) = self.cache.load_processed().await? {
                tracing::debug!("running promoted processed payload");
                let value = self.execute(&code).await?;
                return Ok(LocalExecution {
                    source: LocalSource::Processed,
                    value,
                });
            }
        }

        let raw = self.cache.read_payload().await?.ok_or_else(|| {
            UpdaterError::NoExecutableContent("no cached payload".into())
        })?;

        match self
            .process(&raw, LOCAL_REWRITE, UpdateState::ExecutingLocalCode)
            .await
        {
            Ok(processed) => {
                let value = self.execute(&processed.content).await?;
                Ok(LocalExecution {
                    source: LocalSource::Rederived,
                    value,
                })
            }
            Err(err) => {
                tracing::warn!(%err, "could not rebuild processed payload, running raw payload");
                let value = self.execute(&raw).await?;
                Ok(LocalExecution {
                    source: LocalSource::Raw,
                    value,
                })
            }
        }
    }

    /// Reconcile and download. With `keep_unstored`, a download that could not
    /// be persisted is still handed back so it can run once.
    async fn sync_inner(&self, keep_unstored: bool) -> Result<SyncOutcome> {
        self.progress
            .advance(UpdateState::CheckingRemote, CHECKING, "reading cached payload");
        let local = match self.cache.load_cached().await {
            Ok(local) => local,
            Err(err) if err.is_recoverable() => {
                tracing::warn!(%err, "cached payload unreadable, treating it as absent");
                self.progress.note_error(err.to_string());
                None
            }
            Err(err) => return Err(err),
        };

        self.progress
            .advance(UpdateState::CheckingRemote, QUERYING, "querying version endpoint");
        let remote = match self.endpoint.fetch(self.transport.as_ref()).await {
            Ok(remote) => remote,
            Err(err) => return self.fall_back(local, err),
        };

        let decision = reconciler::reconcile(local.as_ref(), &remote, self.hasher.as_ref())?;
        if !decision.need_update {
            tracing::info!(digest = %remote.digest, "cached payload is current");
            return Ok(SyncOutcome::unchanged(local));
        }
        tracing::info!(reason = ?decision.reason, "refresh required");

        match self.download_and_process(&remote, keep_unstored).await {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.is_recoverable() => self.fall_back(local, err),
            Err(err) => Err(err),
        }
    }

    fn fall_back(&self, local: Option<CachedArtifact>, err: UpdaterError) -> Result<SyncOutcome> {
        match local {
            Some(artifact) => {
                tracing::warn!(%err, "refresh failed, keeping cached payload");
                self.progress.note_error(err.to_string());
                Ok(SyncOutcome::unchanged(Some(artifact)))
            }
            None => Err(err),
        }
    }

    async fn download_and_process(
        &self,
        remote: &RemoteVersionDescriptor,
        keep_unstored: bool,
    ) -> Result<SyncOutcome> {
        let url = remote.require_download_url()?;
        self.progress
            .advance(UpdateState::DownloadingPayload, DOWNLOADING, "downloading payload");
        let content = self
            .transport
            .fetch_text(url, self.config.download_timeout())
            .await?;
        if content.is_empty() {
            return Err(UpdaterError::validation("downloaded payload is empty"));
        }

        let digest = self.hasher.digest(content.as_bytes())?;
        if self.config.verify_payload_digest && !digest.eq_ignore_ascii_case(&remote.digest) {
            return Err(UpdaterError::IntegrityMismatch {
                expected: remote.digest.clone(),
                actual: digest,
            });
        }

        if let Err(err) = self.cache.store_payload(&content).await {
            tracing::error!(%err, "downloaded payload could not be stored");
            if !keep_unstored {
                return Err(err);
            }
            self.progress.note_error(err.to_string());
            return Ok(SyncOutcome {
                need_update: true,
                updated: false,
                content: Some(content),
                processed: None,
            });
        }
        self.progress
            .advance(UpdateState::DownloadingPayload, DOWNLOADED, "payload stored");

        let processed = match self
            .process(&content, UPDATE_REWRITE, UpdateState::ProcessingResources)
            .await
        {
            Ok(processed) => Some(processed),
            Err(err) => {
                tracing::warn!(%err, "resource processing failed, raw payload stays usable");
                self.progress.note_error(err.to_string());
                None
            }
        };

        Ok(SyncOutcome {
            need_update: true,
            updated: true,
            content: Some(content),
            processed,
        })
    }

    async fn process(
        &self,
        content: &str,
        band: ProgressBand,
        state: UpdateState,
    ) -> Result<ProcessedArtifact> {
        self.progress.advance(state, band.start, "localising resources");
        let progress = &self.progress;
        let observer = move |done: usize, total: usize| {
            progress.advance(
                state,
                band.at(done, total),
                format!("localising resources ({done}/{total})"),
            );
        };
        self.rewriter.rewrite_with_progress(content, &observer).await
    }

    /// Run `code`, turning executor panics into errors.
    async fn execute(&self, code: &str) -> std::result::Result<Value, ExecutionError> {
        let running = self.executor.execute(code, &self.config.bindings);
        match AssertUnwindSafe(running).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(ExecutionError::Panicked(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DigestAlgorithm;
    use crate::error::{HashError, TransportError};
    use crate::store::{MemoryStore, StoreExt};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use serde_json::Map;
    use std::time::Duration;

    struct OfflineTransport;

    #[async_trait]
    impl Transport for OfflineTransport {
        async fn fetch_text(
            &self,
            _url: &str,
            _timeout: Duration,
        ) -> std::result::Result<String, TransportError> {
            Err(TransportError::NetworkUnavailable("offline".into()))
        }

        async fn fetch_binary(
            &self,
            _url: &str,
            _timeout: Duration,
        ) -> std::result::Result<Bytes, TransportError> {
            Err(TransportError::NetworkUnavailable("offline".into()))
        }
    }

    struct BrokenHasher;

    impl ContentHasher for BrokenHasher {
        fn digest(&self, _content: &[u8]) -> std::result::Result<String, HashError> {
            Err(HashError::Unavailable("engine not initialised".into()))
        }

        fn algorithm(&self) -> DigestAlgorithm {
            DigestAlgorithm::Md5
        }
    }

    #[derive(Default)]
    struct Recorder {
        executed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CodeExecutor for Recorder {
        async fn execute(
            &self,
            code: &str,
            _bindings: &Map<String, Value>,
        ) -> std::result::Result<Value, ExecutionError> {
            if code.contains("explode") {
                panic!("exploded");
            }
            self.executed.lock().push(code.to_string());
            Ok(Value::Null)
        }
    }

    fn orchestrator(
        store: Arc<MemoryStore>,
        hasher: Option<Arc<dyn ContentHasher>>,
        executor: Arc<Recorder>,
    ) -> UpdateOrchestrator {
        let mut builder = UpdateOrchestrator::builder(UpdaterConfig::for_app("demo"))
            .with_store(store)
            .with_transport(Arc::new(OfflineTransport))
            .with_executor(executor);
        if let Some(hasher) = hasher {
            builder = builder.with_hasher(hasher);
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn broken_hasher_still_runs_local_payload() {
        let store = Arc::new(MemoryStore::new());
        store.write_file("latest.js", b"boot();").await.unwrap();
        let executor = Arc::new(Recorder::default());
        let mut engine = orchestrator(store, Some(Arc::new(BrokenHasher)), executor.clone());

        let report = engine.run().await;

        assert!(report.success);
        assert!(!report.updated);
        assert_eq!(executor.executed.lock().as_slice(), &["boot();".to_string()]);
        let progress = engine.progress().snapshot();
        assert_eq!(progress.state, UpdateState::Completed);
        assert!(progress.error.unwrap().contains("engine not initialised"));
    }

    #[tokio::test]
    async fn broken_hasher_without_local_payload_fails() {
        let executor = Arc::new(Recorder::default());
        let mut engine = orchestrator(
            Arc::new(MemoryStore::new()),
            Some(Arc::new(BrokenHasher)),
            executor,
        );

        let report = engine.run().await;

        assert!(!report.success);
        assert!(!report.executed);
        assert_eq!(engine.progress().snapshot().state, UpdateState::Failed);
    }

    #[tokio::test]
    async fn offline_run_uses_cached_payload() {
        let store = Arc::new(MemoryStore::new());
        store.write_file("latest.js", b"boot();").await.unwrap();
        let executor = Arc::new(Recorder::default());
        let mut engine = orchestrator(store.clone(), None, executor.clone());

        let report = engine.run().await;

        assert_eq!(
            report,
            RunReport {
                success: true,
                updated: false,
                executed: true,
                error: None,
            }
        );
        assert_eq!(store.live_handles(), 0);
    }

    #[tokio::test]
    async fn executor_panic_becomes_error() {
        let store = Arc::new(MemoryStore::new());
        store.write_file("latest.js", b"explode();").await.unwrap();
        let engine = orchestrator(store, None, Arc::new(Recorder::default()));

        let err = engine.execute_cached().await.unwrap_err();

        assert!(matches!(
            err,
            UpdaterError::Execution(ExecutionError::Panicked(ref message)) if message == "exploded"
        ));
    }

    #[tokio::test]
    async fn sync_without_anything_reports_transport_error() {
        let executor = Arc::new(Recorder::default());
        let mut engine = orchestrator(Arc::new(MemoryStore::new()), None, executor);

        let err = engine.sync().await.unwrap_err();

        assert!(matches!(err, UpdaterError::Transport(_)));
        let progress = engine.progress().snapshot();
        assert_eq!(progress.state, UpdateState::Failed);
        assert!(!progress.is_updating());
    }
}
