use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Platform data directory holding the ledger, exemption windows, and
/// pairing records.
pub fn data_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("", "", "family-rewards")
        .context("Could not determine a data directory for this platform")?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn ledger_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("ledger.json"))
}

pub fn windows_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("exemption-windows.json"))
}

pub fn pairings_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("pairings.json"))
}

/// Write a file atomically: the content goes to a sibling temp file, is
/// synced to disk, then renamed over the target. Readers either see the old
/// document or the new one, never a torn write.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    {
        let mut file = File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;
        file.write_all(content)
            .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync temp file: {}", temp_path.display()))?;
    }

    std::fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to move {} into place at {}",
            temp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write_roundtrip() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("ledger.json");

        atomic_write(&target, b"{\"entries\":[]}").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"{\"entries\":[]}");
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("nested").join("deep").join("state.json");

        atomic_write(&target, b"ok").unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "ok");
    }

    #[test]
    fn test_atomic_write_replaces_existing_content() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("state.json");

        atomic_write(&target, b"first").unwrap();
        atomic_write(&target, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "second");
    }
}
