use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use image::ImageFormat;
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::ArtifactSection;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("screenshot payload invalid: {0}")]
    Image(String),
}

pub type ArtifactResult<T> = Result<T, ArtifactError>;

impl From<image::ImageError> for ArtifactError {
    fn from(source: image::ImageError) -> Self {
        ArtifactError::Image(source.to_string())
    }
}

/// Filesystem home for debugging captures. Screenshots land under one
/// directory per task and age out on a retention window.
pub struct ArtifactStore {
    config: ArtifactSection,
}

impl ArtifactStore {
    pub fn new(config: ArtifactSection) -> Self {
        Self { config }
    }

    pub fn root(&self) -> &Path {
        Path::new(&self.config.root)
    }

    /// Decodes the raw capture and stores it as PNG, so a corrupt buffer from
    /// the browser never lands on disk. Returns the stored path.
    pub fn save_screenshot(
        &self,
        task_id: &str,
        attempt: u32,
        step_number: u32,
        label: &str,
        bytes: &[u8],
    ) -> ArtifactResult<PathBuf> {
        let dir = self.root().join(task_id);
        fs::create_dir_all(&dir).map_err(|source| ArtifactError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = dir.join(format!("attempt{attempt:02}-step{step_number:02}-{label}.png"));
        let decoded = image::load_from_memory(bytes)?;
        decoded.save_with_format(&path, ImageFormat::Png)?;
        debug!(path = %path.display(), "screenshot stored");
        Ok(path)
    }

    /// Deletes captures older than the retention window and prunes task
    /// directories left empty. Returns the removed paths.
    pub fn sweep_expired(&self) -> ArtifactResult<Vec<PathBuf>> {
        let root = self.root().to_path_buf();
        if !root.exists() {
            return Ok(Vec::new());
        }
        let ttl = Duration::from_secs(u64::from(self.config.retention_days) * 24 * 3600);
        let mut removed = Vec::new();
        for entry in WalkDir::new(&root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_file())
        {
            let path = entry.path();
            let metadata = fs::metadata(path).map_err(|source| ArtifactError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let modified = metadata
                .modified()
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            if let Ok(age) = modified.elapsed() {
                if age > ttl {
                    fs::remove_file(path).map_err(|source| ArtifactError::Io {
                        path: path.to_path_buf(),
                        source,
                    })?;
                    removed.push(path.to_path_buf());
                }
            }
        }
        for entry in WalkDir::new(&root)
            .min_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_dir())
        {
            // remove_dir leaves non-empty directories alone
            let _ = fs::remove_dir(entry.path());
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "expired artifacts removed");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{ImageBuffer, Rgb};
    use tempfile::tempdir;

    use super::*;

    fn png_bytes() -> Vec<u8> {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::new(4, 4);
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn store_at(root: &Path, retention_days: u32) -> ArtifactStore {
        ArtifactStore::new(ArtifactSection {
            root: root.to_string_lossy().into_owned(),
            retention_days,
        })
    }

    #[test]
    fn screenshot_lands_under_task_directory() {
        let dir = tempdir().unwrap();
        let store = store_at(dir.path(), 14);
        let path = store
            .save_screenshot("task-abc", 1, 7, "verify", &png_bytes())
            .unwrap();
        assert!(path.exists());
        assert!(path.starts_with(dir.path().join("task-abc")));
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "attempt01-step07-verify.png"
        );
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        let dir = tempdir().unwrap();
        let store = store_at(dir.path(), 14);
        let err = store
            .save_screenshot("task-abc", 1, 1, "navigate", b"not a png")
            .unwrap_err();
        assert!(matches!(err, ArtifactError::Image(_)));
    }

    #[test]
    fn sweep_honors_retention_window() {
        let dir = tempdir().unwrap();
        let store = store_at(dir.path(), 14);
        store
            .save_screenshot("task-abc", 1, 1, "navigate", &png_bytes())
            .unwrap();
        assert!(store.sweep_expired().unwrap().is_empty());

        let eager = store_at(dir.path(), 0);
        std::thread::sleep(Duration::from_millis(50));
        let removed = eager.sweep_expired().unwrap();
        assert_eq!(removed.len(), 1);
        assert!(!dir.path().join("task-abc").exists());
    }
}
