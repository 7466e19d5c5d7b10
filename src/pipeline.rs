//! Admission Pipeline
//!
//! Extension → Content → Strings → Metadata → Antivirus → Accepted
//!
//! Stages run strictly in order and the first failing stage ends the run
//! with `Rejected`. An inspector that did not complete counts as a failing
//! stage.

use crate::inspect::{Capabilities, InspectionFinding, StageKind};
use crate::policy::{Policy, RuleEntry};
use crate::staging::StagedFile;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    /// Waiting on the extension allowlist
    AwaitingExtensionCheck,
    /// Waiting on the content sniffer
    AwaitingContentCheck,
    /// Waiting on the string extractor
    AwaitingStringCheck,
    /// Waiting on metadata and embedded payload scans
    AwaitingMetadataCheck,
    /// Waiting on the antivirus scan
    AwaitingAvCheck,
    /// Every stage passed
    Accepted,
    /// Absorbing rejection
    Rejected {
        /// Stage that failed
        stage: StageKind,
        /// Why it failed
        reason: ReasonCode,
    },
}

impl PipelineState {
    /// State after the pending stage passes
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::AwaitingExtensionCheck => Some(Self::AwaitingContentCheck),
            Self::AwaitingContentCheck => Some(Self::AwaitingStringCheck),
            Self::AwaitingStringCheck => Some(Self::AwaitingMetadataCheck),
            Self::AwaitingMetadataCheck => Some(Self::AwaitingAvCheck),
            Self::AwaitingAvCheck => Some(Self::Accepted),
            Self::Accepted | Self::Rejected { .. } => None,
        }
    }

    /// Stage this state is waiting on
    pub fn pending_stage(&self) -> Option<StageKind> {
        match self {
            Self::AwaitingExtensionCheck => Some(StageKind::ExtensionCheck),
            Self::AwaitingContentCheck => Some(StageKind::ContentCheck),
            Self::AwaitingStringCheck => Some(StageKind::StringCheck),
            Self::AwaitingMetadataCheck => Some(StageKind::MetadataCheck),
            Self::AwaitingAvCheck => Some(StageKind::AntivirusCheck),
            Self::Accepted | Self::Rejected { .. } => None,
        }
    }

    /// Accepted or Rejected
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected { .. })
    }
}

/// Machine-readable rejection reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// Extension not in the allowlist
    ExtensionNotAllowed,
    /// Sniffed content type differs from the expected descriptor
    ContentMismatch,
    /// No allowed string found
    StringMismatch,
    /// Forbidden keyword in metadata or embedded payloads
    ForbiddenContentDetected,
    /// Antivirus signature match
    ThreatDetected,
    /// An inspector did not complete
    ScanError,
}

impl ReasonCode {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExtensionNotAllowed => "extension_not_allowed",
            Self::ContentMismatch => "content_mismatch",
            Self::StringMismatch => "string_mismatch",
            Self::ForbiddenContentDetected => "forbidden_content_detected",
            Self::ThreatDetected => "threat_detected",
            Self::ScanError => "scan_error",
        }
    }

    /// Client-facing message; never includes inspector output
    pub fn message(&self) -> &'static str {
        match self {
            Self::ExtensionNotAllowed => "File extension is not allowed",
            Self::ContentMismatch => "File description does not match the expected type",
            Self::StringMismatch => "Mismatching strings in file detected",
            Self::ForbiddenContentDetected => "Forbidden content detected in file metadata",
            Self::ThreatDetected => "This file contains a virus. Aborting upload.",
            Self::ScanError => "File could not be fully inspected",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// File may be committed
    Accepted,
    /// File must be discarded
    Rejected,
}

/// Stage outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    /// Stage passed
    Passed,
    /// Stage rejected the file
    Failed,
}

/// One stage transition, recorded for audit
#[derive(Debug, Clone, Serialize)]
pub struct StageEvent {
    /// Stage that ran
    pub stage: StageKind,
    /// Passed or failed
    pub outcome: StageOutcome,
    /// Internal detail; may include inspector output
    pub detail: String,
    /// When the stage finished
    pub at: DateTime<Utc>,
}

/// Final decision of one admission run
#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    /// Accepted or rejected
    pub outcome: Outcome,
    /// Stage that rejected the file
    pub rejection_stage: Option<StageKind>,
    /// Why, when rejected
    pub reason: Option<ReasonCode>,
    /// Client-safe message
    pub message: String,
    /// Internal explanation of the rejection; not for clients
    pub detail: Option<String>,
    /// Stage transitions in order
    pub events: Vec<StageEvent>,
}

impl Verdict {
    /// Whether the file may be committed
    pub fn is_accepted(&self) -> bool {
        self.outcome == Outcome::Accepted
    }
}

/// A failed stage
#[derive(Debug)]
struct Rejection {
    stage: StageKind,
    reason: ReasonCode,
    detail: String,
}

impl Rejection {
    fn new(stage: StageKind, reason: ReasonCode, detail: impl Into<String>) -> Self {
        Self { stage, reason, detail: detail.into() }
    }

    /// An inspector that could not complete
    fn scan_error(stage: StageKind, finding: &InspectionFinding) -> Self {
        Self::new(
            stage,
            ReasonCode::ScanError,
            format!(
                "{} did not complete: {}",
                finding.probe,
                finding.failure_detail.as_deref().unwrap_or("unknown failure")
            ),
        )
    }
}

/// Per-run state
struct AdmissionContext<'a> {
    file: &'a StagedFile,
    state: PipelineState,
    events: Vec<StageEvent>,
}

impl<'a> AdmissionContext<'a> {
    fn new(file: &'a StagedFile) -> Self {
        Self {
            file,
            state: PipelineState::AwaitingExtensionCheck,
            events: Vec::new(),
        }
    }

    fn pass(&mut self, stage: StageKind, detail: impl Into<String>) {
        let detail = detail.into();
        tracing::info!(
            file = %self.file.original_filename(),
            stage = %stage,
            outcome = "passed",
            "{}",
            detail
        );
        self.events.push(StageEvent {
            stage,
            outcome: StageOutcome::Passed,
            detail,
            at: Utc::now(),
        });
        debug_assert_eq!(self.state.pending_stage(), Some(stage));
        if let Some(next) = self.state.next() {
            self.state = next;
        }
    }

    fn reject(&mut self, rejection: &Rejection) {
        tracing::warn!(
            file = %self.file.original_filename(),
            stage = %rejection.stage,
            outcome = "rejected",
            reason = %rejection.reason,
            "{}",
            rejection.detail
        );
        self.events.push(StageEvent {
            stage: rejection.stage,
            outcome: StageOutcome::Failed,
            detail: rejection.detail.clone(),
            at: Utc::now(),
        });
        self.state = PipelineState::Rejected {
            stage: rejection.stage,
            reason: rejection.reason,
        };
    }

    fn into_verdict(mut self, result: Result<(), Rejection>) -> Verdict {
        match result {
            Ok(()) => {
                debug_assert_eq!(self.state, PipelineState::Accepted);
                Verdict {
                    outcome: Outcome::Accepted,
                    rejection_stage: None,
                    reason: None,
                    message: "File uploaded successfully".into(),
                    detail: None,
                    events: self.events,
                }
            }
            Err(rejection) => {
                self.reject(&rejection);
                Verdict {
                    outcome: Outcome::Rejected,
                    rejection_stage: Some(rejection.stage),
                    reason: Some(rejection.reason),
                    message: rejection.reason.message().into(),
                    detail: Some(rejection.detail),
                    events: self.events,
                }
            }
        }
    }
}

/// Admission pipeline
pub struct AdmissionPipeline {
    capabilities: Capabilities,
}

impl AdmissionPipeline {
    /// Create a pipeline over an inspector set
    pub fn new(capabilities: Capabilities) -> Self {
        Self { capabilities }
    }

    /// Run every stage against a staged file.
    ///
    /// `policy` is fixed for the whole run. Always yields exactly one
    /// verdict; stage failures never escape as errors.
    pub async fn run(&self, policy: &Policy, file: &StagedFile) -> Verdict {
        let mut ctx = AdmissionContext::new(file);
        let result = self.run_stages(policy, &mut ctx).await;
        let verdict = ctx.into_verdict(result);

        tracing::info!(
            file = %file.original_filename(),
            size = file.size_bytes(),
            outcome = ?verdict.outcome,
            reason = ?verdict.reason,
            "Admission complete"
        );
        verdict
    }

    async fn run_stages(&self, policy: &Policy, ctx: &mut AdmissionContext<'_>) -> Result<(), Rejection> {
        let rule = self.check_extension(policy, ctx)?;
        self.check_content(rule, ctx).await?;
        self.check_strings(rule, ctx).await?;
        self.check_metadata(policy, rule, ctx).await?;
        self.check_antivirus(ctx).await?;
        Ok(())
    }

    /// Stage 1: Extension allowlist
    fn check_extension<'p>(
        &self,
        policy: &'p Policy,
        ctx: &mut AdmissionContext<'_>,
    ) -> Result<&'p RuleEntry, Rejection> {
        let file = ctx.file;
        let extension = file.extension();
        let rule = policy.rule(extension).ok_or_else(|| {
            Rejection::new(
                StageKind::ExtensionCheck,
                ReasonCode::ExtensionNotAllowed,
                format!("extension {:?} is not in the allowlist", extension),
            )
        })?;

        ctx.pass(StageKind::ExtensionCheck, format!("extension {} allowed", extension));
        Ok(rule)
    }

    /// Stage 2: True content type
    async fn check_content(&self, rule: &RuleEntry, ctx: &mut AdmissionContext<'_>) -> Result<(), Rejection> {
        let finding = self.capabilities.content.inspect(ctx.file).await;
        let output = completed_output(StageKind::ContentCheck, &finding)?;

        if !content_matches(output, &rule.expected_content_descriptor) {
            return Err(Rejection::new(
                StageKind::ContentCheck,
                ReasonCode::ContentMismatch,
                format!(
                    "expected {:?}, sniffer reported {:?}",
                    rule.expected_content_descriptor,
                    output.trim()
                ),
            ));
        }

        ctx.pass(
            StageKind::ContentCheck,
            format!("content matches {:?}", rule.expected_content_descriptor),
        );
        Ok(())
    }

    /// Stage 3: Embedded strings
    async fn check_strings(&self, rule: &RuleEntry, ctx: &mut AdmissionContext<'_>) -> Result<(), Rejection> {
        let finding = self.capabilities.strings.inspect(ctx.file).await;
        let output = completed_output(StageKind::StringCheck, &finding)?;

        if rule.allowed_substrings.is_empty() {
            ctx.pass(StageKind::StringCheck, "no required strings configured");
            return Ok(());
        }

        match find_any(output, &rule.allowed_substrings) {
            Some(matched) => {
                ctx.pass(StageKind::StringCheck, format!("found allowed string {:?}", matched));
                Ok(())
            }
            None => Err(Rejection::new(
                StageKind::StringCheck,
                ReasonCode::StringMismatch,
                format!("none of {:?} found in extracted strings", rule.allowed_substrings),
            )),
        }
    }

    /// Stage 4: Metadata tags, then embedded payloads
    async fn check_metadata(
        &self,
        policy: &Policy,
        rule: &RuleEntry,
        ctx: &mut AdmissionContext<'_>,
    ) -> Result<(), Rejection> {
        let probes = [&self.capabilities.metadata, &self.capabilities.embedded];

        for probe in probes {
            let finding = probe.inspect(ctx.file).await;
            let output = completed_output(StageKind::MetadataCheck, &finding)?;

            let forbidden = find_any(output, policy.forbidden_keywords())
                .or_else(|| find_any(output, &rule.forbidden_contained_names));
            if let Some(keyword) = forbidden {
                return Err(Rejection::new(
                    StageKind::MetadataCheck,
                    ReasonCode::ForbiddenContentDetected,
                    format!("{} reported forbidden keyword {:?}", finding.probe, keyword),
                ));
            }
        }

        ctx.pass(StageKind::MetadataCheck, "no forbidden metadata or embedded content");
        Ok(())
    }

    /// Stage 5: Antivirus
    async fn check_antivirus(&self, ctx: &mut AdmissionContext<'_>) -> Result<(), Rejection> {
        let finding = self.capabilities.antivirus.inspect(ctx.file).await;
        let output = completed_output(StageKind::AntivirusCheck, &finding)?;

        if finding.threat_found {
            return Err(Rejection::new(
                StageKind::AntivirusCheck,
                ReasonCode::ThreatDetected,
                format!("signature match: {}", output.trim()),
            ));
        }

        ctx.pass(StageKind::AntivirusCheck, "no threat found");
        Ok(())
    }
}

/// Output of a finding, or a scan error if the inspector did not complete
fn completed_output(stage: StageKind, finding: &InspectionFinding) -> Result<&str, Rejection> {
    if !finding.succeeded {
        return Err(Rejection::scan_error(stage, finding));
    }
    tracing::debug!(
        stage = %stage,
        probe = finding.probe,
        output = %finding.raw_output,
        "Inspector output"
    );
    Ok(&finding.raw_output)
}

/// Case-insensitive containment of the trimmed descriptor in sniffer output
pub fn content_matches(sniffer_output: &str, expected: &str) -> bool {
    let expected = expected.trim().to_lowercase();
    !expected.is_empty() && sniffer_output.to_lowercase().contains(&expected)
}

/// First needle (trimmed, case-insensitive) contained in `haystack`
pub fn find_any<'n, I>(haystack: &str, needles: I) -> Option<&'n str>
where
    I: IntoIterator<Item = &'n String>,
{
    let haystack = haystack.to_lowercase();
    needles.into_iter().map(String::as_str).find(|needle| {
        let needle = needle.trim().to_lowercase();
        !needle.is_empty() && haystack.contains(&needle)
    })
}
