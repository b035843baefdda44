//! Bundle File Scanner (C3): discovers, validates, orders and backs up bundle
//! files in a directory (spec §4.3).

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::bundle::{file_name_str, BundleFileName};
use crate::error::Result;

/// A bundle file discovered on disk, already filename-parsed.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub name: BundleFileName,
}

/// Scans `dir` for regular files matching the bundle filename grammar,
/// returning them ordered by the canonical filename comparator (spec §4.3).
/// Files failing the format check are logged and skipped, not errored — only a
/// filesystem failure on the scan itself aborts (spec §7 `FilesystemError`).
pub async fn scan(dir: &Path, collection: &str) -> Result<Vec<ScannedFile>> {
    let mut found = Vec::new();
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = read_dir.next_entry().await? {
        let file_type = entry.file_type().await?;
        if !file_type.is_file() {
            continue;
        }
        let path = entry.path();
        let Some(name_str) = file_name_str(&path) else {
            continue;
        };
        match BundleFileName::parse(name_str) {
            Ok(name) if name.matches_collection(collection) => {
                found.push(ScannedFile { path, name });
            }
            Ok(name) => {
                debug!(file = %name_str, collection = %name.collection, "skipping bundle for another collection");
            }
            Err(e) => {
                warn!(file = %name_str, error = %e, "skipping malformed bundle filename");
            }
        }
    }

    found.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(found)
}

/// Atomically renames a scanned file into `backup_dir` after a successful build
/// pass (spec §4.3). Rename failures are logged per-file and never abort the
/// build (spec §7).
pub async fn backup_file(backup_dir: &Path, file: &ScannedFile) -> bool {
    if let Err(e) = tokio::fs::create_dir_all(backup_dir).await {
        warn!(file = %file.name.raw, error = %e, "failed to create backup directory");
        return false;
    }
    let dest = backup_dir.join(&file.name.raw);
    match tokio::fs::rename(&file.path, &dest).await {
        Ok(()) => {
            debug!(file = %file.name.raw, "moved bundle file to backup");
            true
        }
        Err(e) => {
            warn!(file = %file.name.raw, error = %e, "failed to move bundle file to backup");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn touch(dir: &Path, name: &str) {
        tokio::fs::write(dir.join(name), b"").await.unwrap();
    }

    #[tokio::test]
    async fn scan_orders_by_filename_and_skips_bad_format() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "B-02-202401021530-00123-I-c1.SCD").await;
        touch(dir.path(), "B-01-202401021530-00123-I-c1.SCD").await;
        touch(dir.path(), "not-a-bundle.txt").await;
        touch(dir.path(), "B-01-202401021530-00123-I-otherCollection.SCD").await;

        let scanned = scan(dir.path(), "c1").await.unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].name.sequence, 1);
        assert_eq!(scanned[1].name.sequence, 2);
    }

    #[tokio::test]
    async fn scan_on_missing_dir_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let scanned = scan(&dir.path().join("missing"), "c1").await.unwrap();
        assert!(scanned.is_empty());
    }

    #[tokio::test]
    async fn successful_pass_leaves_no_bundle_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "B-01-202401021530-00123-I-c1.SCD").await;
        let scanned = scan(dir.path(), "c1").await.unwrap();

        let backup_dir = dir.path().join("backup");
        for file in &scanned {
            assert!(backup_file(&backup_dir, file).await);
        }

        let remaining = scan(dir.path(), "c1").await.unwrap();
        assert!(remaining.is_empty());
        assert!(backup_dir.join("B-01-202401021530-00123-I-c1.SCD").exists());
    }
}
