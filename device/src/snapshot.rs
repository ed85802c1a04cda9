use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("refusing to store an empty snapshot")]
    Empty,
    #[error("failed to write snapshot {0}: {1}")]
    Write(String, std::io::Error),
}

/// Persistence collaborator for snapshots.
///
/// Called from a blocking context, so implementations may do file or
/// network I/O directly.
pub trait SnapshotSink: Send + Sync {
    fn store(&self, filename: &str, jpeg: &[u8]) -> Result<(), SnapshotError>;
}

/// Writes each snapshot as a file under one directory.
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SnapshotSink for DirectorySink {
    fn store(&self, filename: &str, jpeg: &[u8]) -> Result<(), SnapshotError> {
        if jpeg.is_empty() {
            return Err(SnapshotError::Empty);
        }
        let path = self.dir.join(filename);
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| SnapshotError::Write(self.dir.display().to_string(), e))?;
        std::fs::write(&path, jpeg)
            .map_err(|e| SnapshotError::Write(path.display().to_string(), e))?;
        info!(path = path.display().to_string(), bytes = jpeg.len(), "snapshot saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_into_directory() {
        let dir = std::env::temp_dir().join(format!("edge-viewer-snap-{}", std::process::id()));
        let sink = DirectorySink::new(dir.join("nested"));
        sink.store("EdgeViewer_1.jpg", b"\xFF\xD8jpeg").unwrap();

        let written = std::fs::read(sink.dir().join("EdgeViewer_1.jpg")).unwrap();
        assert_eq!(written, b"\xFF\xD8jpeg");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn rejects_empty_payload() {
        let sink = DirectorySink::new(std::env::temp_dir());
        assert!(matches!(sink.store("x.jpg", b""), Err(SnapshotError::Empty)));
    }
}
