//! Build-context checksums and archives.
//!
//! A stage that reads files from the build context (COPY/ADD) contributes a
//! checksum over exactly those files to its digest. The same file set can be
//! packaged into a deterministic tar archive for backends that need the
//! context transferred rather than read in place.

use crate::digest::Digest;
use crate::error::{Result, StagecraftError};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tracing::debug;

/// Policy options for context checksums.
#[derive(Debug, Clone, Default)]
pub struct ChecksumOptions {
    /// Also hash file mode bits. Off by default: the legacy checksum only
    /// covered content bytes, so this is an explicit opt-in policy.
    pub include_mode_bits: bool,
}

/// One file collected from the context, in canonical order.
#[derive(Debug, Clone)]
struct ContextEntry {
    /// Path relative to the context root, always with `/` separators.
    rel_path: String,
    abs_path: PathBuf,
    kind: EntryKind,
}

#[derive(Debug, Clone, PartialEq)]
enum EntryKind {
    File,
    Dir,
    Symlink { target: String },
}

/// Computes checksums and archives over a build-context directory.
#[derive(Debug, Clone)]
pub struct BuildContextArchiver {
    root: PathBuf,
}

impl BuildContextArchiver {
    /// Creates an archiver rooted at the given context directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let root = root
            .canonicalize()
            .map_err(|source| StagecraftError::Io { path: root.clone(), source })?;
        if !root.is_dir() {
            return Err(StagecraftError::ContextPathNotFound { path: root });
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Checksum over exactly the files matched by `sources`.
    ///
    /// Deterministic under file content (and mode bits when enabled); files
    /// outside the named sources never participate. A source that does not
    /// exist is a fatal error, not a skip.
    pub fn checksum(&self, sources: &[String], opts: &ChecksumOptions) -> Result<Digest> {
        let entries = self.collect(sources)?;
        let mut parts: Vec<String> = Vec::with_capacity(entries.len() * 2);
        for entry in &entries {
            parts.push(entry.rel_path.clone());
            match &entry.kind {
                EntryKind::File => {
                    let data = fs::read(&entry.abs_path).map_err(|source| StagecraftError::Io {
                        path: entry.abs_path.clone(),
                        source,
                    })?;
                    parts.push(Digest::compute_bytes(&data).as_str().to_string());
                    if opts.include_mode_bits {
                        parts.push(format!("{:o}", mode_of(&entry.abs_path)?));
                    }
                }
                EntryKind::Dir => parts.push("dir".to_string()),
                EntryKind::Symlink { target } => parts.push(format!("link:{target}")),
            }
        }
        let digest = Digest::compute(&parts);
        debug!(files = entries.len(), digest = %digest.short(), "computed context checksum");
        Ok(digest)
    }

    /// Packages the matched files into a deterministic tar archive.
    ///
    /// Entries are appended in sorted path order with zeroed timestamps,
    /// zeroed ownership and normalized mode bits, so the archive bytes are a
    /// pure function of path names and file contents.
    pub fn create_archive(&self, sources: &[String]) -> Result<ContextArchive> {
        let entries = self.collect(sources)?;

        let file = tempfile::Builder::new()
            .prefix("stagecraft-context-")
            .suffix(".tar")
            .tempfile()
            .map_err(|source| StagecraftError::Io { path: self.root.clone(), source })?;
        let mut builder = tar::Builder::new(file);

        for entry in &entries {
            let mut header = tar::Header::new_gnu();
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            match &entry.kind {
                EntryKind::File => {
                    let data = fs::read(&entry.abs_path).map_err(|source| StagecraftError::Io {
                        path: entry.abs_path.clone(),
                        source,
                    })?;
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(data.len() as u64);
                    header.set_mode(normalized_mode(mode_of(&entry.abs_path)?));
                    builder
                        .append_data(&mut header, &entry.rel_path, data.as_slice())
                        .map_err(|source| StagecraftError::Io {
                            path: entry.abs_path.clone(),
                            source,
                        })?;
                }
                EntryKind::Dir => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                    header.set_mode(0o755);
                    builder
                        .append_data(&mut header, format!("{}/", entry.rel_path), &[][..])
                        .map_err(|source| StagecraftError::Io {
                            path: entry.abs_path.clone(),
                            source,
                        })?;
                }
                EntryKind::Symlink { target } => {
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_size(0);
                    header.set_mode(0o777);
                    builder
                        .append_link(&mut header, &entry.rel_path, target)
                        .map_err(|source| StagecraftError::Io {
                            path: entry.abs_path.clone(),
                            source,
                        })?;
                }
            }
        }

        let file = builder
            .into_inner()
            .map_err(|source| StagecraftError::Io { path: self.root.clone(), source })?;
        let path = file.into_temp_path();
        debug!(entries = entries.len(), path = %path.display(), "created context archive");
        Ok(ContextArchive { path })
    }

    /// Resolves the named sources into a sorted entry list. Directories are
    /// walked recursively; a missing source path is fatal.
    fn collect(&self, sources: &[String]) -> Result<Vec<ContextEntry>> {
        let mut entries = Vec::new();
        for source in sources {
            let abs = self.root.join(source);
            let meta = fs::symlink_metadata(&abs)
                .map_err(|_| StagecraftError::ContextPathNotFound { path: abs.clone() })?;
            if meta.is_dir() {
                self.walk_dir(&abs, &mut entries)?;
            } else {
                entries.push(self.entry_for(&abs, &meta)?);
            }
        }
        entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        entries.dedup_by(|a, b| a.rel_path == b.rel_path);
        Ok(entries)
    }

    fn walk_dir(&self, dir: &Path, entries: &mut Vec<ContextEntry>) -> Result<()> {
        let meta = fs::symlink_metadata(dir)
            .map_err(|source| StagecraftError::Io { path: dir.to_path_buf(), source })?;
        entries.push(self.entry_for(dir, &meta)?);

        let mut children: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|source| StagecraftError::Io { path: dir.to_path_buf(), source })?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        children.sort();

        for child in children {
            let meta = fs::symlink_metadata(&child)
                .map_err(|source| StagecraftError::Io { path: child.clone(), source })?;
            if meta.is_dir() {
                self.walk_dir(&child, entries)?;
            } else {
                entries.push(self.entry_for(&child, &meta)?);
            }
        }
        Ok(())
    }

    fn entry_for(&self, abs: &Path, meta: &fs::Metadata) -> Result<ContextEntry> {
        let rel = abs
            .strip_prefix(&self.root)
            .map_err(|_| StagecraftError::ContextPathNotFound { path: abs.to_path_buf() })?;
        let rel_path = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let kind = if meta.is_dir() {
            EntryKind::Dir
        } else if meta.file_type().is_symlink() {
            let target = fs::read_link(abs)
                .map_err(|source| StagecraftError::Io { path: abs.to_path_buf(), source })?;
            EntryKind::Symlink { target: target.to_string_lossy().to_string() }
        } else {
            EntryKind::File
        };
        Ok(ContextEntry { rel_path, abs_path: abs.to_path_buf(), kind })
    }
}

fn mode_of(path: &Path) -> Result<u32> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let meta = fs::symlink_metadata(path)
            .map_err(|source| StagecraftError::Io { path: path.to_path_buf(), source })?;
        Ok(meta.permissions().mode() & 0o7777)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(0o644)
    }
}

/// Archive entry modes collapse to executable or not, so incidental
/// permission noise does not change the archive bytes.
fn normalized_mode(mode: u32) -> u32 {
    if mode & 0o111 != 0 {
        0o755
    } else {
        0o644
    }
}

/// A transportable context archive backed by a temporary file.
///
/// The file is removed when the archive is dropped; `close()` removes it
/// eagerly and surfaces any deletion error.
#[derive(Debug)]
pub struct ContextArchive {
    path: TempPath,
}

impl ContextArchive {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the archive file.
    pub fn close(self) -> Result<()> {
        let display = self.path.to_path_buf();
        self.path
            .close()
            .map_err(|source| StagecraftError::Io { path: display, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &Path, rel: &str, content: &[u8]) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = fs::File::create(path).unwrap();
        f.write_all(content).unwrap();
    }

    fn sources(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn checksum_is_deterministic() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "src/main.rs", b"fn main() {}");
        write_file(dir.path(), "src/lib.rs", b"pub fn lib() {}");

        let archiver = BuildContextArchiver::new(dir.path()).unwrap();
        let opts = ChecksumOptions::default();
        let a = archiver.checksum(&sources(&["src"]), &opts).unwrap();
        let b = archiver.checksum(&sources(&["src"]), &opts).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn checksum_changes_with_content() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "app/worker.py", b"print(1)");

        let archiver = BuildContextArchiver::new(dir.path()).unwrap();
        let opts = ChecksumOptions::default();
        let before = archiver.checksum(&sources(&["app"]), &opts).unwrap();

        write_file(dir.path(), "app/worker.py", b"print(2)");
        let after = archiver.checksum(&sources(&["app"]), &opts).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn unrelated_files_do_not_affect_checksum() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "app/worker.py", b"print(1)");

        let archiver = BuildContextArchiver::new(dir.path()).unwrap();
        let opts = ChecksumOptions::default();
        let before = archiver.checksum(&sources(&["app"]), &opts).unwrap();

        write_file(dir.path(), "README.md", b"docs");
        let after = archiver.checksum(&sources(&["app"]), &opts).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn missing_source_is_fatal() {
        let dir = TempDir::new().unwrap();
        let archiver = BuildContextArchiver::new(dir.path()).unwrap();
        let err = archiver
            .checksum(&sources(&["no-such-path"]), &ChecksumOptions::default())
            .unwrap_err();
        assert!(matches!(err, StagecraftError::ContextPathNotFound { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn mode_bits_participate_only_when_enabled() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "run.sh", b"#!/bin/sh");
        let archiver = BuildContextArchiver::new(dir.path()).unwrap();

        let plain = ChecksumOptions::default();
        let with_mode = ChecksumOptions { include_mode_bits: true };

        let before_plain = archiver.checksum(&sources(&["run.sh"]), &plain).unwrap();
        let before_mode = archiver.checksum(&sources(&["run.sh"]), &with_mode).unwrap();

        let path = dir.path().join("run.sh");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

        let after_plain = archiver.checksum(&sources(&["run.sh"]), &plain).unwrap();
        let after_mode = archiver.checksum(&sources(&["run.sh"]), &with_mode).unwrap();

        assert_eq!(before_plain, after_plain);
        assert_ne!(before_mode, after_mode);
    }

    #[test]
    fn archive_bytes_are_deterministic() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "src/a.txt", b"alpha");
        write_file(dir.path(), "src/b.txt", b"beta");

        let archiver = BuildContextArchiver::new(dir.path()).unwrap();
        let first = archiver.create_archive(&sources(&["src"])).unwrap();
        let second = archiver.create_archive(&sources(&["src"])).unwrap();

        let a = fs::read(first.path()).unwrap();
        let b = fs::read(second.path()).unwrap();
        assert!(!a.is_empty());
        assert_eq!(a, b);

        first.close().unwrap();
        second.close().unwrap();
    }

    #[test]
    fn archive_is_removed_on_close() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "f.txt", b"x");
        let archiver = BuildContextArchiver::new(dir.path()).unwrap();

        let archive = archiver.create_archive(&sources(&["f.txt"])).unwrap();
        let path = archive.path().to_path_buf();
        assert!(path.exists());
        archive.close().unwrap();
        assert!(!path.exists());
    }
}
