use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;

use anyhow::{Context, Result};

/// What sits at a path, without following a final symlink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Missing,
    Symlink,
    Directory,
    File,
    Other,
}

/// The filesystem operations the upgrade sequence performs.
pub trait Filesystem: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    fn entry_kind(&self, path: &Path) -> Result<EntryKind>;
    fn create_private_dir(&self, path: &Path) -> Result<()>;
    /// Copies `from` into a new file at `to` that is created with `mode`.
    fn copy_file(&self, from: &Path, to: &Path, mode: u32) -> Result<u64>;
    fn set_mode(&self, path: &Path, mode: u32) -> Result<()>;
    /// Writes a fresh copy of `from` at `to` with `mode`, flushed to disk.
    /// Neither path may be a symlink.
    fn install_file(&self, from: &Path, to: &Path, mode: u32) -> Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    fn remove_file(&self, path: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFilesystem;

impl Filesystem for LocalFilesystem {
    fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    fn entry_kind(&self, path: &Path) -> Result<EntryKind> {
        let metadata = match fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(EntryKind::Missing),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed reading metadata {}", path.display()));
            }
        };
        let file_type = metadata.file_type();
        Ok(if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        })
    }

    fn create_private_dir(&self, path: &Path) -> Result<()> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(path)
            .with_context(|| format!("failed creating directory {}", path.display()))
    }

    fn copy_file(&self, from: &Path, to: &Path, mode: u32) -> Result<u64> {
        let mut source = open_no_follow(from)?;
        let mut target = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .custom_flags(nix::libc::O_NOFOLLOW)
            .open(to)
            .with_context(|| format!("failed creating {}", to.display()))?;
        let copied = std::io::copy(&mut source, &mut target).with_context(|| {
            format!("failed copying {} -> {}", from.display(), to.display())
        })?;
        target
            .sync_all()
            .with_context(|| format!("failed syncing {}", to.display()))?;
        Ok(copied)
    }

    fn set_mode(&self, path: &Path, mode: u32) -> Result<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("failed setting mode {:04o} on {}", mode, path.display()))
    }

    fn install_file(&self, from: &Path, to: &Path, mode: u32) -> Result<()> {
        let mut source = open_no_follow(from)?;

        // A leftover from an earlier interrupted install is replaced, not reused.
        match fs::remove_file(to) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed removing stale {}", to.display()));
            }
        }

        let mut target = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .custom_flags(nix::libc::O_NOFOLLOW)
            .open(to)
            .with_context(|| format!("failed creating {}", to.display()))?;
        std::io::copy(&mut source, &mut target).with_context(|| {
            format!("failed writing {} -> {}", from.display(), to.display())
        })?;
        target
            .flush()
            .with_context(|| format!("failed flushing {}", to.display()))?;
        target
            .sync_all()
            .with_context(|| format!("failed syncing {}", to.display()))?;
        drop(target);

        // The umask may have narrowed the create mode.
        self.set_mode(to, mode)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).with_context(|| {
            format!("failed renaming {} -> {}", from.display(), to.display())
        })
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).with_context(|| format!("failed removing {}", path.display()))
    }
}

fn open_no_follow(path: &Path) -> Result<fs::File> {
    fs::OpenOptions::new()
        .read(true)
        .custom_flags(nix::libc::O_NOFOLLOW)
        .open(path)
        .with_context(|| format!("failed opening {} without following links", path.display()))
}
