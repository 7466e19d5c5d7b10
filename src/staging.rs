//! Staging Manager
//!
//! Every upload is written to a private, uniquely-named file in the staging
//! area. The staged copy leaves the staging area exactly once: either
//! published by [`StagingArea::commit`] or removed by
//! [`StagedFile::discard`] (or by `Drop` when neither ran).

use crate::config::CollisionPolicy;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const MAX_UNIQUIFY_ATTEMPTS: u32 = 1000;

/// Staging and commit errors
#[derive(Debug, Error)]
pub enum StagingError {
    /// Filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Client filename unusable
    #[error("invalid filename: {0:?}")]
    InvalidFilename(String),
    /// Upload over the size limit
    #[error("upload exceeds {limit} bytes")]
    TooLarge {
        /// Configured limit in bytes
        limit: u64,
    },
    /// Name already taken at the destination
    #[error("destination already exists: {}", .0.display())]
    DestinationExists(PathBuf),
}

/// Private working area for uploads under inspection
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
    max_bytes: u64,
}

impl StagingArea {
    /// Create a staging area; uploads over `max_bytes` are refused
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self { dir: dir.into(), max_bytes }
    }

    /// Create the staging directory
    pub async fn prepare(&self) -> Result<(), StagingError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    /// Staging directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Open a new staging file for `suggested_name`.
    ///
    /// Bytes are streamed in with [`StagedWriter::write_chunk`]; dropping the
    /// writer before [`StagedWriter::finish`] removes the partial file.
    pub async fn begin(&self, suggested_name: &str) -> Result<StagedWriter, StagingError> {
        let original_filename = sanitize_filename(suggested_name)?;
        let extension = extension_of(&original_filename);
        // Inspectors print the path they scanned; keep client text out of it.
        let path = self.dir.join(format!("{}{}", Uuid::new_v4(), extension));

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            options.mode(0o600);
        }
        let file = options.open(&path).await?;

        tracing::debug!(path = %path.display(), "Staging upload");

        Ok(StagedWriter {
            file,
            staged: StagedFile {
                original_filename,
                extension,
                path,
                size_bytes: 0,
                released: false,
            },
            max_bytes: self.max_bytes,
        })
    }

    /// Stage an in-memory upload
    pub async fn stage_bytes(&self, suggested_name: &str, data: &[u8]) -> Result<StagedFile, StagingError> {
        let mut writer = self.begin(suggested_name).await?;
        writer.write_chunk(data).await?;
        writer.finish().await
    }

    /// Publish an accepted file into `destination_dir`.
    ///
    /// The file becomes visible at its final name in one step; readers never
    /// observe a partially written file.
    pub async fn commit(
        &self,
        mut staged: StagedFile,
        destination_dir: &Path,
        collision: CollisionPolicy,
    ) -> Result<PathBuf, StagingError> {
        let target = destination_dir.join(&staged.original_filename);

        let published = match collision {
            CollisionPolicy::Overwrite => {
                tokio::fs::rename(&staged.path, &target).await?;
                target
            }
            CollisionPolicy::Reject => {
                publish_new(&staged.path, &target).await?;
                target
            }
            CollisionPolicy::Uniquify => {
                publish_unique(&staged.path, destination_dir, &staged.original_filename).await?
            }
        };

        if collision != CollisionPolicy::Overwrite {
            if let Err(e) = tokio::fs::remove_file(&staged.path).await {
                if e.kind() != ErrorKind::NotFound {
                    tracing::warn!(path = %staged.path.display(), "Failed to unlink staged file after commit: {}", e);
                    return Ok(published);
                }
            }
        }

        staged.released = true;
        Ok(published)
    }
}

/// Hard-link `target` to the staged data; fails if `target` exists
async fn publish_new(staged: &Path, target: &Path) -> Result<(), StagingError> {
    match tokio::fs::hard_link(staged, target).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            Err(StagingError::DestinationExists(target.to_path_buf()))
        }
        Err(e) => Err(StagingError::Io(e)),
    }
}

async fn publish_unique(staged: &Path, dir: &Path, name: &str) -> Result<PathBuf, StagingError> {
    let (stem, ext) = match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    };

    let mut candidate = dir.join(name);
    for n in 1..=MAX_UNIQUIFY_ATTEMPTS {
        match publish_new(staged, &candidate).await {
            Ok(()) => return Ok(candidate),
            Err(StagingError::DestinationExists(_)) => {
                candidate = dir.join(format!("{} ({}){}", stem, n, ext));
            }
            Err(e) => return Err(e),
        }
    }
    Err(StagingError::DestinationExists(dir.join(name)))
}

/// Streaming writer for one upload
pub struct StagedWriter {
    file: File,
    staged: StagedFile,
    max_bytes: u64,
}

impl StagedWriter {
    /// Append a chunk of the upload
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StagingError> {
        let size = self.staged.size_bytes + chunk.len() as u64;
        if size > self.max_bytes {
            return Err(StagingError::TooLarge { limit: self.max_bytes });
        }

        self.file.write_all(chunk).await?;
        self.staged.size_bytes = size;
        Ok(())
    }

    /// Flush and close; the upload was fully received
    pub async fn finish(self) -> Result<StagedFile, StagingError> {
        let StagedWriter { mut file, staged, .. } = self;
        file.flush().await?;
        file.sync_all().await?;
        Ok(staged)
    }

    /// Bytes received so far
    pub fn size_bytes(&self) -> u64 {
        self.staged.size_bytes
    }
}

/// Exclusively owned working copy of an upload.
///
/// Inspectors only read it. Removed from the staging area on drop unless
/// committed or discarded first.
#[derive(Debug)]
pub struct StagedFile {
    original_filename: String,
    extension: String,
    path: PathBuf,
    size_bytes: u64,
    released: bool,
}

impl StagedFile {
    /// Client filename, reduced to its final path component
    pub fn original_filename(&self) -> &str {
        &self.original_filename
    }

    /// Lowercased extension including the leading dot, or empty
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Location in the staging area
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes received
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Remove the staging file. Safe to call more than once.
    pub async fn discard(&mut self) {
        if self.released {
            return;
        }
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "Failed to discard staged file: {}", e);
                return;
            }
        }
        self.released = true;
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), "Failed to remove staged file: {}", e);
            }
        }
    }
}

/// Reduce a client-supplied name to a safe basename
pub fn sanitize_filename(name: &str) -> Result<String, StagingError> {
    let basename = name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .trim();

    if basename.is_empty() || basename == "." || basename == ".." || basename.chars().any(char::is_control) {
        return Err(StagingError::InvalidFilename(name.to_string()));
    }
    Ok(basename.to_string())
}

/// Extension of a basename: final dot onwards, lowercased
pub fn extension_of(filename: &str) -> String {
    match filename.rfind('.') {
        Some(idx) => filename[idx..].to_lowercase(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area(dir: &tempfile::TempDir) -> StagingArea {
        StagingArea::new(dir.path().join("staging"), 1024)
    }

    async fn prepared(dir: &tempfile::TempDir) -> StagingArea {
        let area = area(dir);
        area.prepare().await.unwrap();
        area
    }

    fn staging_entries(area: &StagingArea) -> usize {
        std::fs::read_dir(area.dir()).unwrap().count()
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("report.pdf").unwrap(), "report.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_filename("C:\\temp\\a.png").unwrap(), "a.png");
        assert!(sanitize_filename("").is_err());
        assert!(sanitize_filename("dir/").is_err());
        assert!(sanitize_filename("..").is_err());
        assert!(sanitize_filename("a\0.png").is_err());
        assert!(sanitize_filename("report\n.pdf").is_err());
        assert!(sanitize_filename("tab\there.txt").is_err());
        assert!(sanitize_filename("\u{1b}[31mred.txt").is_err());
        assert_eq!(sanitize_filename("résumé 2024.pdf").unwrap(), "résumé 2024.pdf");
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("image.PNG"), ".png");
        assert_eq!(extension_of("archive.tar.gz"), ".gz");
        assert_eq!(extension_of("Makefile"), "");
        assert_eq!(extension_of(".bashrc"), ".bashrc");
    }

    #[tokio::test]
    async fn test_stage_and_discard() {
        let dir = tempfile::tempdir().unwrap();
        let area = prepared(&dir).await;

        let mut staged = area.stage_bytes("Report.PDF", b"%PDF-1.4").await.unwrap();
        assert_eq!(staged.original_filename(), "Report.PDF");
        assert_eq!(staged.extension(), ".pdf");
        assert_eq!(staged.size_bytes(), 8);
        assert_eq!(std::fs::read(staged.path()).unwrap(), b"%PDF-1.4");
        let staged_name = staged.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(!staged_name.contains("Report"));
        assert!(staged_name.ends_with(".pdf"));

        staged.discard().await;
        assert!(!staged.path().exists());
        staged.discard().await;
        assert_eq!(staging_entries(&area), 0);
    }

    #[tokio::test]
    async fn test_unique_staging_names() {
        let dir = tempfile::tempdir().unwrap();
        let area = prepared(&dir).await;

        let a = area.stage_bytes("same.txt", b"a").await.unwrap();
        let b = area.stage_bytes("same.txt", b"b").await.unwrap();
        assert_ne!(a.path(), b.path());
        assert_eq!(staging_entries(&area), 2);
    }

    #[tokio::test]
    async fn test_drop_removes_staged_file() {
        let dir = tempfile::tempdir().unwrap();
        let area = prepared(&dir).await;

        let staged = area.stage_bytes("a.txt", b"data").await.unwrap();
        let path = staged.path().to_path_buf();
        drop(staged);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_aborted_upload_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let area = prepared(&dir).await;

        let mut writer = area.begin("big.bin").await.unwrap();
        writer.write_chunk(&[0u8; 1000]).await.unwrap();
        let err = writer.write_chunk(&[0u8; 100]).await.unwrap_err();
        assert!(matches!(err, StagingError::TooLarge { limit: 1024 }));
        drop(writer);
        assert_eq!(staging_entries(&area), 0);
    }

    #[tokio::test]
    async fn test_commit_moves_file() {
        let dir = tempfile::tempdir().unwrap();
        let area = prepared(&dir).await;
        let dest = dir.path().join("files");
        std::fs::create_dir_all(&dest).unwrap();

        let staged = area.stage_bytes("report.pdf", b"%PDF").await.unwrap();
        let staged_path = staged.path().to_path_buf();
        let path = area.commit(staged, &dest, CollisionPolicy::Reject).await.unwrap();

        assert_eq!(path, dest.join("report.pdf"));
        assert_eq!(std::fs::read(&path).unwrap(), b"%PDF");
        assert!(!staged_path.exists());
        assert_eq!(staging_entries(&area), 0);
    }

    #[tokio::test]
    async fn test_commit_collision_policies() {
        let dir = tempfile::tempdir().unwrap();
        let area = prepared(&dir).await;
        let dest = dir.path().join("files");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("a.txt"), b"old").unwrap();

        let staged = area.stage_bytes("a.txt", b"new").await.unwrap();
        let err = area.commit(staged, &dest, CollisionPolicy::Reject).await.unwrap_err();
        assert!(matches!(err, StagingError::DestinationExists(_)));
        assert_eq!(std::fs::read(dest.join("a.txt")).unwrap(), b"old");
        assert_eq!(staging_entries(&area), 0);

        let staged = area.stage_bytes("a.txt", b"new").await.unwrap();
        let path = area.commit(staged, &dest, CollisionPolicy::Uniquify).await.unwrap();
        assert_eq!(path, dest.join("a (1).txt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"new");

        let staged = area.stage_bytes("a.txt", b"newest").await.unwrap();
        let path = area.commit(staged, &dest, CollisionPolicy::Overwrite).await.unwrap();
        assert_eq!(path, dest.join("a.txt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"newest");
        assert_eq!(staging_entries(&area), 0);
    }
}
