//! RAII guard for the per-request temp files created for
//! `passFileToCommand`. Deletion runs on every exit path, including panics.

use std::io;
use std::path::{Path, PathBuf};

pub struct TempFileGuard {
    paths: Vec<PathBuf>,
}

impl TempFileGuard {
    pub fn new() -> Self {
        TempFileGuard { paths: Vec::new() }
    }

    pub fn write(&mut self, dir: &Path, prefix: &str, contents: &[u8]) -> io::Result<PathBuf> {
        let filename = format!("{prefix}-{}", uuid::Uuid::new_v4());
        let path = dir.join(filename);
        std::fs::write(&path, contents)?;
        self.paths.push(path.clone());
        Ok(path)
    }
}

impl Default for TempFileGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        for path in &self.paths {
            if let Err(e) = std::fs::remove_file(path) {
                log::warn!("failed to remove temp file {}: {e}", path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_files_are_removed_on_drop() {
        let dir = std::env::temp_dir();
        let path = {
            let mut guard = TempFileGuard::new();
            guard.write(&dir, "hookrelay-test", b"contents").unwrap()
        };
        assert!(!path.exists());
    }

    #[test]
    fn temp_file_survives_until_guard_drops() {
        let dir = std::env::temp_dir();
        let mut guard = TempFileGuard::new();
        let path = guard.write(&dir, "hookrelay-test2", b"contents").unwrap();
        assert!(path.exists());
        drop(guard);
        assert!(!path.exists());
    }
}
