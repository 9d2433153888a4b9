//! Self-updating script bundle with local resource caching.
//!
//! A remote version endpoint advertises the digest and download location of
//! the latest payload for an application id. The updater keeps one raw copy of
//! the payload in private storage, downloads a fresh one whenever the digests
//! differ (or the server forces it), localises the payload's remote images,
//! scripts and stylesheets into the same storage, and hands the rewritten
//! payload to a host-provided [`CodeExecutor`].
//!
//! The local copy always runs first, so a broken network only ever delays the
//! next refresh.
//!
//! ```ignore
//! use std::sync::Arc;
//! use bundle_updater::{ProcessExecutor, UpdateOrchestrator, UpdaterConfig};
//!
//! # async fn demo() -> bundle_updater::Result<()> {
//! let config = UpdaterConfig::for_app("com.example.app");
//! let mut orchestrator = UpdateOrchestrator::builder(config)
//!     .with_executor(Arc::new(ProcessExecutor::new("node")))
//!     .build()?;
//!
//! let progress = orchestrator.progress();
//! let report = orchestrator.run().await;
//! println!("{report:?} at {}%", progress.snapshot().percent);
//! # Ok(())
//! # }
//! ```

mod artifact;
mod config;
mod descriptor;
mod error;
mod executor;
mod hasher;
mod orchestrator;
mod progress;
mod reconciler;
mod rewriter;
mod store;
mod transport;

pub use artifact::{
    ArtifactCache, CachedArtifact, ProcessedArtifact, ProcessedState, ResourceFailure,
    ResourceMapping,
};
pub use config::{
    DigestAlgorithm, LocalLayout, UpdaterConfig, DEFAULT_RESOURCE_PATTERN, DEFAULT_SERVER_URL,
};
pub use descriptor::{parse_descriptor, RemoteVersionDescriptor, VersionEndpoint};
pub use error::{
    ExecutionError, HashError, Result, StoreError, TransportError, UpdaterError,
};
pub use executor::{CodeExecutor, ProcessExecutor, BINDINGS_ENV};
pub use hasher::{hasher_for, ContentHasher, Md5Hasher, Sha256Hasher};
pub use orchestrator::{
    LocalExecution, LocalSource, RunReport, SyncOutcome, UpdateOrchestrator,
    UpdateOrchestratorBuilder,
};
pub use progress::{
    ProgressBand, ProgressReader, ProgressTracker, UpdateProgress, UpdateState,
};
pub use reconciler::{probe, reconcile, ProbeReport, ReconcileReason, Reconciliation};
pub use rewriter::ResourceRewriter;
pub use store::{FsStore, Handle, MemoryStore, ResourceStore, StoreExt};
pub use transport::{HttpTransport, HttpTransportBuilder, Transport};
