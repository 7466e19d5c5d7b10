//! Gate Configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Upload gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// HTTP listen address
    pub listen_addr: String,
    /// Policy document location
    pub policy_path: PathBuf,
    /// When the policy document is reread
    pub policy_reload: PolicyReload,
    /// Private working area for uploads under inspection
    pub staging_dir: PathBuf,
    /// Accepted files area
    pub destination_dir: PathBuf,
    /// What to do when an accepted name already exists at the destination
    pub collision: CollisionPolicy,
    /// Upload size limit in bytes
    pub max_upload_bytes: u64,
    /// External inspector commands
    pub inspectors: InspectorsConfig,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:2000".into(),
            policy_path: PathBuf::from("rules.json"),
            policy_reload: PolicyReload::EveryRequest,
            staging_dir: PathBuf::from("./user_files/.staging"),
            destination_dir: PathBuf::from("./user_files"),
            collision: CollisionPolicy::Reject,
            max_upload_bytes: 50 * 1024 * 1024, // 50MB
            inspectors: InspectorsConfig::default(),
        }
    }
}

impl GateConfig {
    /// Load from file
    pub fn load(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// Policy reload mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyReload {
    /// Reread the document for every upload
    EveryRequest,
    /// Reuse the parsed policy until the file changes or is invalidated
    OnChange,
}

/// Destination name collision handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Refuse to publish over an existing file
    Reject,
    /// Publish under `name (n).ext`
    Uniquify,
    /// Replace the existing file
    Overwrite,
}

/// Inspector command set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectorsConfig {
    /// Content sniffer
    pub content: CommandSpec,
    /// String extractor
    pub strings: CommandSpec,
    /// Metadata tag extractor
    pub metadata: CommandSpec,
    /// Embedded payload scanner
    pub embedded: CommandSpec,
    /// Antivirus scanner
    pub antivirus: CommandSpec,
}

impl Default for InspectorsConfig {
    fn default() -> Self {
        Self {
            content: CommandSpec::new("file", &["-b"], 10),
            strings: CommandSpec::new("strings", &["-a"], 30),
            metadata: CommandSpec::new("exiftool", &[], 30),
            embedded: CommandSpec::new("binwalk", &[], 60),
            antivirus: CommandSpec::new("clamscan", &["--no-summary"], 120),
        }
    }
}

/// External command; the staged file path is appended as the last argument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Executable name or path
    pub program: String,
    /// Arguments placed before the file path
    #[serde(default)]
    pub args: Vec<String>,
    /// Kill the process after this many seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl CommandSpec {
    /// Build a command spec
    pub fn new(program: &str, args: &[&str], timeout_secs: u64) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout_secs,
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}
