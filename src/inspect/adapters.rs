//! Command-backed inspectors

use super::command::{run_inspector_command, CommandOutput};
use super::{InspectionFinding, Inspector, StageKind};
use crate::config::CommandSpec;
use crate::staging::StagedFile;
use async_trait::async_trait;

/// Run `spec` and accept only a zero exit status
async fn inspect_zero_exit(
    spec: &CommandSpec,
    stage: StageKind,
    probe: &'static str,
    file: &StagedFile,
) -> InspectionFinding {
    match run_inspector_command(spec, file.path()).await {
        Ok(output) if output.success() => InspectionFinding::completed(stage, probe, output.stdout),
        Ok(output) => InspectionFinding::failed(stage, probe, exit_detail(spec, &output)),
        Err(detail) => InspectionFinding::failed(stage, probe, detail),
    }
}

fn exit_detail(spec: &CommandSpec, output: &CommandOutput) -> String {
    let status = output
        .code
        .map(|c| format!("exit code {}", c))
        .unwrap_or_else(|| "terminated by signal".into());
    format!("{} {}: {}", spec.program, status, output.stderr.trim())
}

/// True content type sniffer (`file -b`)
pub struct ContentSniffer {
    spec: CommandSpec,
}

impl ContentSniffer {
    /// Create the adapter from its command
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Inspector for ContentSniffer {
    fn probe(&self) -> &'static str {
        "content_sniffer"
    }

    async fn inspect(&self, file: &StagedFile) -> InspectionFinding {
        inspect_zero_exit(&self.spec, StageKind::ContentCheck, self.probe(), file).await
    }
}

/// Printable string extractor (`strings`)
pub struct StringExtractor {
    spec: CommandSpec,
}

impl StringExtractor {
    /// Create the adapter from its command
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Inspector for StringExtractor {
    fn probe(&self) -> &'static str {
        "string_extractor"
    }

    async fn inspect(&self, file: &StagedFile) -> InspectionFinding {
        inspect_zero_exit(&self.spec, StageKind::StringCheck, self.probe(), file).await
    }
}

/// Embedded metadata/tag extraction (`exiftool`)
pub struct MetadataProbe {
    spec: CommandSpec,
}

impl MetadataProbe {
    /// Create the adapter from its command
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Inspector for MetadataProbe {
    fn probe(&self) -> &'static str {
        "metadata_tags"
    }

    async fn inspect(&self, file: &StagedFile) -> InspectionFinding {
        inspect_zero_exit(&self.spec, StageKind::MetadataCheck, self.probe(), file).await
    }
}

/// Appended/embedded payload signature scan (`binwalk`)
pub struct EmbeddedPayloadProbe {
    spec: CommandSpec,
}

impl EmbeddedPayloadProbe {
    /// Create the adapter from its command
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Inspector for EmbeddedPayloadProbe {
    fn probe(&self) -> &'static str {
        "embedded_payload"
    }

    async fn inspect(&self, file: &StagedFile) -> InspectionFinding {
        inspect_zero_exit(&self.spec, StageKind::MetadataCheck, self.probe(), file).await
    }
}

/// Signature antivirus scan (`clamscan`)
///
/// clamscan exits 0 when clean, 1 when a signature matched and 2 on error.
/// Any other outcome, and any clean exit whose output still reports
/// `FOUND`, is not trusted as clean.
pub struct AntivirusScanner {
    spec: CommandSpec,
}

impl AntivirusScanner {
    /// Create the adapter from its command
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    fn interpret(&self, output: CommandOutput) -> InspectionFinding {
        let stage = StageKind::AntivirusCheck;
        let reported = output.combined();
        let found = reported.lines().any(|l| l.trim_end().ends_with("FOUND"));

        match output.code {
            Some(0) => InspectionFinding::completed(stage, self.probe(), reported).with_threat(found),
            Some(1) if found => InspectionFinding::completed(stage, self.probe(), reported).with_threat(true),
            _ => InspectionFinding::failed(stage, self.probe(), exit_detail(&self.spec, &output)),
        }
    }
}

#[async_trait]
impl Inspector for AntivirusScanner {
    fn probe(&self) -> &'static str {
        "antivirus"
    }

    async fn inspect(&self, file: &StagedFile) -> InspectionFinding {
        match run_inspector_command(&self.spec, file.path()).await {
            Ok(output) => self.interpret(output),
            Err(detail) => InspectionFinding::failed(StageKind::AntivirusCheck, self.probe(), detail),
        }
    }
}
