//! Capability Adapters
//!
//! Uniform wrappers around the external inspectors. Each adapter reads a
//! staged file and reports raw findings; judging those findings against
//! policy is the pipeline's job.

mod adapters;
mod command;

pub use adapters::{AntivirusScanner, ContentSniffer, EmbeddedPayloadProbe, MetadataProbe, StringExtractor};
pub use command::{run_inspector_command, CommandOutput};

use crate::config::InspectorsConfig;
use crate::staging::StagedFile;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Extension allowlist
    ExtensionCheck,
    /// True content type
    ContentCheck,
    /// Embedded strings
    StringCheck,
    /// Metadata and embedded payloads
    MetadataCheck,
    /// Antivirus scan
    AntivirusCheck,
}

impl StageKind {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExtensionCheck => "extension_check",
            Self::ContentCheck => "content_check",
            Self::StringCheck => "string_check",
            Self::MetadataCheck => "metadata_check",
            Self::AntivirusCheck => "antivirus_check",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized output of one inspector invocation
#[derive(Debug, Clone, Serialize)]
pub struct InspectionFinding {
    /// Stage the inspector ran for
    pub stage: StageKind,
    /// Inspector that produced the finding (`file`, `clamscan`, ...)
    pub probe: &'static str,
    /// Inspector output; logged, never sent to clients
    pub raw_output: String,
    /// False when the inspector could not complete; always fails the stage
    pub succeeded: bool,
    /// Antivirus signature match
    pub threat_found: bool,
    /// Why the inspector did not complete
    pub failure_detail: Option<String>,
}

impl InspectionFinding {
    /// Finding from an inspector that ran to completion
    pub fn completed(stage: StageKind, probe: &'static str, raw_output: impl Into<String>) -> Self {
        Self {
            stage,
            probe,
            raw_output: raw_output.into(),
            succeeded: true,
            threat_found: false,
            failure_detail: None,
        }
    }

    /// Finding from an inspector that could not complete
    pub fn failed(stage: StageKind, probe: &'static str, detail: impl Into<String>) -> Self {
        Self {
            stage,
            probe,
            raw_output: String::new(),
            succeeded: false,
            threat_found: false,
            failure_detail: Some(detail.into()),
        }
    }

    /// Set the antivirus match flag
    pub fn with_threat(mut self, threat_found: bool) -> Self {
        self.threat_found = threat_found;
        self
    }
}

/// Inspection capability
#[async_trait]
pub trait Inspector: Send + Sync {
    /// Probe name, used in findings and logs
    fn probe(&self) -> &'static str;

    /// Inspect a staged file without modifying it
    async fn inspect(&self, file: &StagedFile) -> InspectionFinding;
}

/// The inspector set one pipeline runs with
#[derive(Clone)]
pub struct Capabilities {
    /// True content type sniffer
    pub content: Arc<dyn Inspector>,
    /// Printable string extractor
    pub strings: Arc<dyn Inspector>,
    /// Embedded metadata/tag extraction
    pub metadata: Arc<dyn Inspector>,
    /// Appended or embedded secondary payload scan
    pub embedded: Arc<dyn Inspector>,
    /// Signature scanner
    pub antivirus: Arc<dyn Inspector>,
}

impl Capabilities {
    /// Command-backed inspectors
    pub fn from_config(config: &InspectorsConfig) -> Self {
        Self {
            content: Arc::new(ContentSniffer::new(config.content.clone())),
            strings: Arc::new(StringExtractor::new(config.strings.clone())),
            metadata: Arc::new(MetadataProbe::new(config.metadata.clone())),
            embedded: Arc::new(EmbeddedPayloadProbe::new(config.embedded.clone())),
            antivirus: Arc::new(AntivirusScanner::new(config.antivirus.clone())),
        }
    }
}
