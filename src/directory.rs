//! Directory Rotator (C2): a pair of on-disk data directories with atomic
//! handover and validity marks (spec §4.2). `current` holds live data; `next` is
//! the prepared backup target. A scoped [`DirectoryGuard`] must be held for the
//! full duration of any write path that touches persistent state.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// One on-disk root of the current/next pair.
pub struct Directory {
    name: String,
    root: PathBuf,
    parent_name: Mutex<Option<String>>,
    valid: AtomicBool,
    dirty: AtomicBool,
    held: AtomicBool,
}

impl Directory {
    pub fn new(name: impl Into<String>, root: PathBuf) -> Self {
        Self {
            name: name.into(),
            root,
            parent_name: Mutex::new(None),
            valid: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            held: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent_name(&self) -> Option<String> {
        self.parent_name.lock().expect("parent_name mutex poisoned").clone()
    }

    pub fn valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    /// Clears the valid mark; called on the sibling of whichever directory a
    /// write just landed in, since a stale copy is no longer a faithful backup
    /// (spec §4.2: `next` is only a valid copy until `current` changes again).
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sibling `backup/` directory bundle files are atomically renamed into
    /// after a successful build pass (spec §4.3).
    pub fn backup_dir(&self) -> PathBuf {
        self.root.join("backup")
    }

    /// File recording which bundle filenames this directory has durably
    /// absorbed mutations from (spec §3 `appendSCD log`).
    pub fn scd_log_path(&self) -> PathBuf {
        self.root.join("appendSCD.log")
    }

    pub async fn append_scd(&self, filename: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.scd_log_path())
            .await?;
        file.write_all(filename.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    pub async fn read_scd_log(&self) -> Result<Vec<String>> {
        match tokio::fs::read_to_string(self.scd_log_path()).await {
            Ok(raw) => Ok(raw.lines().map(str::to_string).filter(|l| !l.is_empty()).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Recursively copies `other`'s contents into this directory and marks it a
    /// valid copy with `other` as parent (spec §4.2 backup protocol step 1).
    pub async fn copy_from(&self, other: &Directory) -> Result<()> {
        let src = other.root.clone();
        let dst = self.root.clone();
        tokio::task::spawn_blocking(move || copy_dir_all(&src, &dst))
            .await
            .map_err(|e| Error::FilesystemError(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        *self.parent_name.lock().expect("parent_name mutex poisoned") = Some(other.name.clone());
        self.valid.store(true, Ordering::SeqCst);
        info!(from = %other.name, to = %self.name, "directory copy complete");
        Ok(())
    }

    /// True if this directory is already a valid, up-to-date copy of `other`
    /// (spec §4.2 step 1: "next is not already a valid copy of current").
    pub fn is_valid_copy_of(&self, other: &Directory) -> bool {
        self.valid() && self.parent_name().as_deref() == Some(other.name())
    }

    /// Acquires a scoped guard, failing immediately if this directory is dirty
    /// or already held by another writer (spec §4.2 Guard).
    pub fn guard(&self) -> Result<DirectoryGuard<'_>> {
        if self.dirty.load(Ordering::SeqCst) {
            return Err(Error::DirectoryDirty);
        }
        if self.held.swap(true, Ordering::SeqCst) {
            return Err(Error::DirectoryDirty);
        }
        Ok(DirectoryGuard { dir: self, poison: false })
    }

    /// Clears the dirty mark; the only way guard acquisition recovers after a
    /// poisoned write (spec §8: "subsequent guard acquisitions fail until an
    /// external reset").
    pub fn reset_dirty(&self) {
        self.dirty.store(false, Ordering::SeqCst);
        warn!(dir = %self.name, "dirty mark cleared by external reset");
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }
}

/// RAII guard over a [`Directory`]. On normal drop it simply releases; if the
/// holder calls [`DirectoryGuard::poison`] before dropping (because a write
/// raised an error), the directory is marked dirty on drop.
pub struct DirectoryGuard<'a> {
    dir: &'a Directory,
    poison: bool,
}

impl DirectoryGuard<'_> {
    pub fn poison(&mut self) {
        self.poison = true;
    }

    pub fn directory(&self) -> &Directory {
        self.dir
    }
}

impl Drop for DirectoryGuard<'_> {
    fn drop(&mut self) {
        self.dir.held.store(false, Ordering::SeqCst);
        if self.poison {
            self.dir.dirty.store(true, Ordering::SeqCst);
            warn!(dir = %self.dir.name, "directory guard poisoned on drop");
        }
    }
}

/// The current/next directory pair with atomic role handover (spec §3, §4.2).
pub struct DirectoryPair {
    a: Directory,
    b: Directory,
    /// `true` selects `a` as current; swapped by [`DirectoryPair::rotate`].
    a_is_current: AtomicBool,
}

impl DirectoryPair {
    pub fn new(a: Directory, b: Directory) -> Self {
        Self {
            a,
            b,
            a_is_current: AtomicBool::new(true),
        }
    }

    pub fn current(&self) -> &Directory {
        if self.a_is_current.load(Ordering::SeqCst) {
            &self.a
        } else {
            &self.b
        }
    }

    pub fn next(&self) -> &Directory {
        if self.a_is_current.load(Ordering::SeqCst) {
            &self.b
        } else {
            &self.a
        }
    }

    /// Backup protocol step 1 (spec §4.2): copy current into next unless next is
    /// already a valid copy.
    pub async fn backup(&self) -> Result<()> {
        let current = self.current();
        let next = self.next();
        if next.is_valid_copy_of(current) {
            info!(current = %current.name(), next = %next.name(), "backup is a no-op, already up to date");
            return Ok(());
        }
        next.copy_from(current).await
    }

    /// Backup protocol step 2 (spec §4.2): swap the roles of current and next.
    pub fn rotate(&self) {
        self.a_is_current.fetch_xor(true, Ordering::SeqCst);
        info!(current = %self.current().name(), "directory pair rotated");
    }
}

fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let dst_path = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_all(&entry.path(), &dst_path)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &dst_path)?;
        }
    }
    Ok(())
}
