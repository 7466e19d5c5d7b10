//! OpenSASE Upload Gate - File Upload Admission
//!
//! Accepts a client-submitted file, runs it through a fail-closed inspection
//! pipeline and either publishes it to the destination area or rejects it
//! with a reason.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         UPLOAD GATE                                  │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │ POST /upload (multipart "file")                                     │
//! │        │                                                            │
//! │        ▼                                                            │
//! │ ┌────────────────┐                                                  │
//! │ │ Staging        │ Private uniquely-named copy, removed on drop      │
//! │ └───────┬────────┘                                                  │
//! │         ▼                                                            │
//! │ ┌────────────────┐    ┌──────────────┐                              │
//! │ │ Admission      │◄───│ Policy Store │ rules.json, reload per run   │
//! │ │ Pipeline       │    └──────────────┘                              │
//! │ │                │                                                  │
//! │ │ 1. Extension   │ allowlist lookup                                 │
//! │ │ 2. Content     │ file(1) sniffer                                  │
//! │ │ 3. Strings     │ strings(1) extractor                             │
//! │ │ 4. Metadata    │ exiftool + binwalk                               │
//! │ │ 5. Antivirus   │ clamscan                                         │
//! │ └───────┬────────┘                                                  │
//! │         ▼                                                            │
//! │    COMMIT (atomic publish) / DISCARD                                │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Any inspector that crashes, times out or cannot be started rejects the
//! file. A policy document that cannot be loaded rejects every upload.

#![warn(missing_docs)]

pub mod api;
pub mod config;
pub mod inspect;
pub mod pipeline;
pub mod policy;
pub mod staging;
pub mod stats;

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub use config::GateConfig;
pub use inspect::{Capabilities, InspectionFinding, Inspector, StageKind};
pub use pipeline::{AdmissionPipeline, Outcome, ReasonCode, Verdict};
pub use policy::{Policy, PolicyError, PolicyStore, RuleEntry};
pub use staging::{StagedFile, StagingArea, StagingError};
pub use stats::{AdmissionStats, AdmissionStatsSnapshot};

/// Gate error types
///
/// Pipeline rejections are not errors; they are [`Verdict`]s. These cover
/// the cases where no verdict can be produced at all.
#[derive(Debug, Error)]
pub enum GateError {
    /// Policy document unreadable or malformed. Fails closed.
    #[error("config error: {0}")]
    Config(#[from] PolicyError),
    /// Staging or commit failure.
    #[error("staging error: {0}")]
    Staging(#[from] StagingError),
    /// Malformed upload request.
    #[error("bad request: {0}")]
    Request(String),
    /// Listener failure.
    #[error("network error: {0}")]
    Network(String),
}

/// Result of one admission run
#[derive(Debug)]
pub struct Admission {
    /// Pipeline verdict
    pub verdict: Verdict,
    /// Final location, set only when the file was accepted and committed
    pub stored_path: Option<PathBuf>,
}

/// Upload admission service
pub struct UploadGate {
    config: GateConfig,
    policy: PolicyStore,
    staging: StagingArea,
    pipeline: AdmissionPipeline,
    stats: Arc<AdmissionStats>,
}

impl UploadGate {
    /// Create a gate backed by the external inspector commands from `config`
    pub fn new(config: GateConfig) -> Self {
        let capabilities = Capabilities::from_config(&config.inspectors);
        Self::with_capabilities(config, capabilities)
    }

    /// Create a gate with explicit inspectors
    pub fn with_capabilities(config: GateConfig, capabilities: Capabilities) -> Self {
        Self {
            policy: PolicyStore::new(config.policy_path.clone(), config.policy_reload),
            staging: StagingArea::new(config.staging_dir.clone(), config.max_upload_bytes),
            pipeline: AdmissionPipeline::new(capabilities),
            stats: Arc::new(AdmissionStats::default()),
            config,
        }
    }

    /// Prepare staging and destination directories
    pub async fn init(&self) -> Result<(), GateError> {
        tracing::info!("Initializing upload gate...");

        self.staging.prepare().await?;
        tokio::fs::create_dir_all(&self.config.destination_dir)
            .await
            .map_err(StagingError::Io)?;

        // Surface a broken policy at startup; requests still reload it.
        match self.policy.load() {
            Ok(policy) => tracing::info!(
                path = %self.policy.path().display(),
                "Policy loaded, allowed extensions: {:?}",
                policy.extensions()
            ),
            Err(e) => tracing::warn!("Policy not loadable at startup, all uploads will be rejected: {}", e),
        }

        tracing::info!(
            staging = %self.config.staging_dir.display(),
            destination = %self.config.destination_dir.display(),
            "Upload gate initialized"
        );
        Ok(())
    }

    /// Run a staged upload through the pipeline and commit or discard it.
    ///
    /// The staged file is consumed: on every path it is either published or
    /// removed from the staging area.
    pub async fn admit(&self, mut staged: StagedFile) -> Result<Admission, GateError> {
        self.stats.record_processed();

        let policy = match self.policy.load() {
            Ok(policy) => policy,
            Err(e) => {
                tracing::error!(file = %staged.original_filename(), "Policy load failed, rejecting: {}", e);
                staged.discard().await;
                self.stats.record_error();
                return Err(GateError::Config(e));
            }
        };

        let verdict = self.pipeline.run(&policy, &staged).await;

        if !verdict.is_accepted() {
            staged.discard().await;
            if let Some(reason) = verdict.reason {
                self.stats.record_rejected(reason);
            }
            return Ok(Admission { verdict, stored_path: None });
        }

        match self
            .staging
            .commit(staged, &self.config.destination_dir, self.config.collision)
            .await
        {
            Ok(path) => {
                self.stats.record_accepted();
                tracing::info!(path = %path.display(), "No anomaly found, file stored");
                Ok(Admission { verdict, stored_path: Some(path) })
            }
            Err(e) => {
                self.stats.record_error();
                tracing::error!("Commit failed: {}", e);
                Err(GateError::Staging(e))
            }
        }
    }

    /// Staging area
    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Policy store
    pub fn policy(&self) -> &PolicyStore {
        &self.policy
    }

    /// Service configuration
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Statistics snapshot
    pub fn stats(&self) -> AdmissionStatsSnapshot {
        self.stats.snapshot()
    }
}
