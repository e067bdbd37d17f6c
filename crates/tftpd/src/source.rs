//! Data sources for read requests
//!
//! Sessions only see a byte stream; how a filename becomes one is up to the
//! [`SourceFactory`] the server was built with.
//!
//! NIST 800-53 Controls:
//! - AC-3: Access Enforcement (all reads confined to the root directory)
//! - SI-10: Information Input Validation (filename normalization)

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncRead;

/// A readable byte stream handed to a read session
pub type DataSource = Box<dyn AsyncRead + Send + Unpin>;

/// Why a filename could not be opened
///
/// The `Display` text is sent to the client in an AccessViolation error, so
/// it never includes host paths.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Invalid filename")]
    InvalidFilename,

    #[error("File not found")]
    NotFound,

    #[error("Symlinks are not allowed")]
    Symlink,

    #[error("Not a regular file")]
    NotAFile,

    #[error("Access denied")]
    AccessDenied,

    #[error("File too large")]
    TooLarge { size: u64, limit: u64 },

    #[error("Root directory error")]
    RootDir(#[source] std::io::Error),

    #[error("Cannot open file")]
    Open(#[source] std::io::Error),
}

#[async_trait]
pub trait SourceFactory: Send + Sync {
    async fn open(&self, filename: &str) -> std::result::Result<DataSource, SourceError>;
}

/// Serves regular files below a root directory
#[derive(Debug, Clone)]
pub struct RootDirSource {
    root_dir: PathBuf,
    max_file_size_bytes: u64,
}

impl RootDirSource {
    /// `max_file_size_bytes` of 0 disables the size limit
    pub fn new(root_dir: impl Into<PathBuf>, max_file_size_bytes: u64) -> Self {
        Self {
            root_dir: root_dir.into(),
            max_file_size_bytes,
        }
    }

    /// Map a client filename onto a path inside the root directory
    async fn resolve(&self, filename: &str) -> std::result::Result<PathBuf, SourceError> {
        // NIST SI-10: Normalize the filename and check for directory traversal
        // STIG V-222603: Prevent path traversal attacks
        let filename = filename.replace('\\', "/");
        let relative = filename.trim_start_matches('/');
        if relative.is_empty()
            || Path::new(relative)
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(SourceError::InvalidFilename);
        }

        let file_path = self.root_dir.join(relative);

        // STIG V-222604: Validate file type and reject symbolic links
        let metadata = match fs::symlink_metadata(&file_path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(SourceError::NotFound),
            Err(_) => return Err(SourceError::AccessDenied),
        };
        if metadata.file_type().is_symlink() {
            return Err(SourceError::Symlink);
        }
        if !metadata.is_file() {
            return Err(SourceError::NotAFile);
        }

        // NIST SC-7(12): symlinked parent directories must not leave the root
        let canonical_root = fs::canonicalize(&self.root_dir)
            .await
            .map_err(SourceError::RootDir)?;
        let canonical_file = fs::canonicalize(&file_path)
            .await
            .map_err(|_| SourceError::AccessDenied)?;
        if !canonical_file.starts_with(&canonical_root) {
            return Err(SourceError::AccessDenied);
        }

        Ok(canonical_file)
    }
}

#[async_trait]
impl SourceFactory for RootDirSource {
    async fn open(&self, filename: &str) -> std::result::Result<DataSource, SourceError> {
        let path = self.resolve(filename).await?;

        let file = File::open(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => SourceError::NotFound,
            ErrorKind::PermissionDenied => SourceError::AccessDenied,
            _ => SourceError::Open(e),
        })?;

        let size = file.metadata().await.map_err(SourceError::Open)?.len();
        if self.max_file_size_bytes > 0 && size > self.max_file_size_bytes {
            return Err(SourceError::TooLarge {
                size,
                limit: self.max_file_size_bytes,
            });
        }

        Ok(Box::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    async fn read_all(mut source: DataSource) -> Vec<u8> {
        let mut contents = Vec::new();
        source.read_to_end(&mut contents).await.unwrap();
        contents
    }

    fn root_with_files() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("boot.img"), b"kernel").unwrap();
        std::fs::create_dir(dir.path().join("pxe")).unwrap();
        std::fs::write(dir.path().join("pxe").join("menu.cfg"), b"default").unwrap();
        dir
    }

    #[tokio::test]
    async fn opens_files_below_root() {
        let dir = root_with_files();
        let source = RootDirSource::new(dir.path(), 0);

        assert_eq!(read_all(source.open("boot.img").await.unwrap()).await, b"kernel");
        assert_eq!(read_all(source.open("/boot.img").await.unwrap()).await, b"kernel");
        assert_eq!(read_all(source.open("pxe\\menu.cfg").await.unwrap()).await, b"default");
    }

    #[tokio::test]
    async fn rejects_traversal_and_empty_names() {
        let dir = root_with_files();
        let source = RootDirSource::new(dir.path(), 0);

        for name in ["../etc/passwd", "pxe/../../secret", "..\\boot.img", "", "/"] {
            assert!(
                matches!(source.open(name).await, Err(SourceError::InvalidFilename)),
                "{name:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn missing_file_and_directory() {
        let dir = root_with_files();
        let source = RootDirSource::new(dir.path(), 0);

        assert!(matches!(source.open("nope.bin").await, Err(SourceError::NotFound)));
        assert!(matches!(source.open("pxe").await, Err(SourceError::NotAFile)));
    }

    #[tokio::test]
    async fn enforces_size_limit() {
        let dir = root_with_files();
        let source = RootDirSource::new(dir.path(), 3);

        let err = source.open("boot.img").await.err().unwrap();
        assert!(matches!(err, SourceError::TooLarge { size: 6, limit: 3 }));
        assert_eq!(err.to_string(), "File too large");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rejects_symlinks() {
        let dir = root_with_files();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), b"hidden").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), dir.path().join("link"))
            .unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("outside")).unwrap();

        let source = RootDirSource::new(dir.path(), 0);
        assert!(matches!(source.open("link").await, Err(SourceError::Symlink)));
        assert!(matches!(
            source.open("outside/secret").await,
            Err(SourceError::AccessDenied)
        ));
    }
}
