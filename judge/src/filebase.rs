//! Path-safe filesystem primitive: every operation is scoped to a root and refuses upward
//! traversal; owns chmod/chown policy.
//!
//! Grounded in `util.FileBase` (`util/files.go` in the original implementation): an absolute,
//! symlink-resolved root, with every write followed by a fixed owner/mode re-application.

use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use log::warn;

use crate::{Error, ErrorKind, Result};

const FILE_MODE: u32 = 0o640;
const DIR_MODE: u32 = 0o750;
const GROUP_WRITE_BIT: u32 = 0o020;

/// A directory tree that every consumer must address through root-relative subpaths, each of
/// which is validated to resolve inside the root before any filesystem call touches it.
///
/// Every file or directory this type creates gets `FixOwners`/`FixMode` re-applied: group owner
/// set to `gid`, mode `0640`/`0750` (or `0660`/`0770` if `group_writable`).
pub struct FileBase {
    root: PathBuf,
    uid: Option<u32>,
    gid: Option<u32>,
    group_writable: bool,
}

impl FileBase {
    /// Create a `FileBase` rooted at `root`, resolving symlinks in `root` itself up front so
    /// later containment checks compare against a canonical path. `root` is created if it does
    /// not already exist.
    pub fn new<P: AsRef<Path>>(root: P, uid: Option<u32>, gid: Option<u32>) -> Result<FileBase> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let resolved = fs::canonicalize(root)?;
        Ok(FileBase { root: resolved, uid, gid, group_writable: false })
    }

    /// Construct a sub-`FileBase` rooted at an existing subdirectory of this one, inheriting
    /// ownership policy. The subdirectory is created if necessary.
    pub fn sub_base<P: AsRef<Path>>(&self, subpath: P) -> Result<FileBase> {
        let full = self.mkdir(subpath)?;
        Ok(FileBase { root: full, uid: self.uid, gid: self.gid, group_writable: self.group_writable })
    }

    /// Mark every subsequent write in this base as group-writable (`0660`/`0770` instead of
    /// `0640`/`0750`). Used for the writable side of a [`crate::FileLinker`].
    pub fn with_group_writable(mut self, group_writable: bool) -> Self {
        self.group_writable = group_writable;
        self
    }

    /// The resolved, absolute root of this base.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path<P: AsRef<Path>>(&self, subpath: P) -> Result<PathBuf> {
        let subpath = subpath.as_ref();
        let joined = self.root.join(subpath);

        // Resolve as much of the path as actually exists; anything below the deepest existing
        // ancestor cannot yet have been diverted by a symlink, so it is safe to append verbatim.
        let mut existing = joined.clone();
        let mut remainder = PathBuf::new();
        loop {
            match fs::canonicalize(&existing) {
                Ok(resolved) => {
                    let full = resolved.join(&remainder);
                    return self.check_contained(full);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    let name = match existing.file_name() {
                        Some(name) => name.to_owned(),
                        None => return self.check_contained(joined),
                    };
                    remainder = Path::new(&name).join(&remainder);
                    if !existing.pop() {
                        return self.check_contained(joined);
                    }
                }
                Err(e) => return Err(Error::from(e)),
            }
        }
    }

    fn check_contained(&self, resolved: PathBuf) -> Result<PathBuf> {
        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            bail!(ErrorKind::PathEscape(
                self.root.to_string_lossy().into_owned(),
                resolved.to_string_lossy().into_owned(),
            ));
        }
    }

    fn target_file_mode(&self) -> u32 {
        if self.group_writable { FILE_MODE | GROUP_WRITE_BIT } else { FILE_MODE }
    }

    fn target_dir_mode(&self) -> u32 {
        if self.group_writable { DIR_MODE | GROUP_WRITE_BIT } else { DIR_MODE }
    }

    fn fix_owners<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if self.uid.is_some() || self.gid.is_some() {
            let meta = fs::metadata(&path)?;
            let uid = self.uid.unwrap_or_else(|| meta.uid());
            let gid = self.gid.unwrap_or_else(|| meta.gid());
            nix::unistd::chown(
                path.as_ref(),
                Some(nix::unistd::Uid::from_raw(uid)),
                Some(nix::unistd::Gid::from_raw(gid)),
            )
            .map_err(|e| {
                Error::from(
                    e.as_errno()
                        .map(io::Error::from)
                        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, e.to_string())),
                )
            })?;
        }
        Ok(())
    }

    fn fix_mode<P: AsRef<Path>>(&self, path: P, mode: u32) -> Result<()> {
        fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    /// Create a directory (and its ancestors under the root) and apply owner/mode policy to it.
    /// Returns the resolved absolute path. Tolerates the directory already existing.
    pub fn mkdir<P: AsRef<Path>>(&self, subpath: P) -> Result<PathBuf> {
        let full = self.full_path(&subpath)?;
        match fs::create_dir_all(&full) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(Error::from(e)),
        }
        self.fix_owners(&full)?;
        self.fix_mode(&full, self.target_dir_mode())?;
        Ok(full)
    }

    /// Write `bytes` to `subpath`, creating (and fixing the owner/mode of) its parent directory
    /// first, then fixing the owner/mode of the file itself.
    pub fn write_file<P: AsRef<Path>>(&self, subpath: P, bytes: &[u8]) -> Result<PathBuf> {
        let full = self.full_path(&subpath)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&full, bytes)?;
        self.fix_owners(&full)?;
        self.fix_mode(&full, self.target_file_mode())?;
        Ok(full)
    }

    /// Read the full contents of `subpath`.
    pub fn read_file<P: AsRef<Path>>(&self, subpath: P) -> Result<Vec<u8>> {
        let full = self.full_path(&subpath)?;
        Ok(fs::read(&full)?)
    }

    /// Hard-link `src` (an absolute host path outside this base) into `subpath`.
    pub fn link_into<P: AsRef<Path>>(&self, src: &Path, subpath: P) -> Result<PathBuf> {
        let full = self.full_path(&subpath)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        if full.exists() {
            fs::remove_file(&full)?;
        }
        fs::hard_link(src, &full)?;
        Ok(full)
    }

    /// Recursively copy the directory tree rooted at `src` into `subpath`, fixing owner/mode on
    /// every created entry. Used by the compilation pipeline to materialize judge-provided
    /// source files one write at a time.
    pub fn copy_into<P: AsRef<Path>>(&self, src: &Path, subpath: P) -> Result<PathBuf> {
        let full = self.full_path(&subpath)?;
        self.copy_tree(src, &full)?;
        Ok(full)
    }

    fn copy_tree(&self, src: &Path, dst: &Path) -> Result<()> {
        let meta = fs::metadata(src)?;
        if meta.is_dir() {
            fs::create_dir_all(dst)?;
            self.fix_owners(dst)?;
            self.fix_mode(dst, self.target_dir_mode())?;
            for entry in fs::read_dir(src)? {
                let entry = entry?;
                self.copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
            }
        } else {
            fs::copy(src, dst)?;
            self.fix_owners(dst)?;
            self.fix_mode(dst, self.target_file_mode())?;
        }
        Ok(())
    }

    /// Remove all entries inside `subpath` without removing `subpath` itself.
    pub fn remove_contents<P: AsRef<Path>>(&self, subpath: P) -> Result<()> {
        let full = self.full_path(&subpath)?;
        if !full.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&full)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Remove `subpath` itself, file or directory.
    pub fn remove<P: AsRef<Path>>(&self, subpath: P) -> Result<()> {
        let full = self.full_path(&subpath)?;
        match fs::metadata(&full) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&full)?,
            Ok(_) => fs::remove_file(&full)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::from(e)),
        }
        Ok(())
    }

    /// Does `subpath` exist? Distinguishes "absent" from "unknown": any I/O error other than
    /// not-found is treated as fatal rather than silently reported as absence, matching the
    /// original's `Exists` helper.
    pub fn exists<P: AsRef<Path>>(&self, subpath: P) -> Result<bool> {
        let full = self.full_path(&subpath)?;
        match fs::metadata(&full) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                warn!("unexpected stat failure on {}: {}", full.display(), e);
                Err(Error::from(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let base = FileBase::new(dir.path(), None, None).unwrap();
        base.write_file("a/b.txt", b"hello").unwrap();
        assert_eq!(base.read_file("a/b.txt").unwrap(), b"hello");
    }

    #[test]
    fn traversal_outside_root_is_rejected() {
        let dir = tempdir().unwrap();
        let base = FileBase::new(dir.path(), None, None).unwrap();
        let result = base.write_file("../escape.txt", b"x");
        assert!(result.is_err());
    }

    #[test]
    fn traversal_via_dotdot_inside_existing_subdir_is_rejected() {
        let dir = tempdir().unwrap();
        let base = FileBase::new(dir.path(), None, None).unwrap();
        base.mkdir("sub").unwrap();
        let result = base.write_file("sub/../../escape.txt", b"x");
        assert!(result.is_err());
    }

    #[test]
    fn file_mode_is_0640_by_default() {
        let dir = tempdir().unwrap();
        let base = FileBase::new(dir.path(), None, None).unwrap();
        let path = base.write_file("f.txt", b"x").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
    }

    #[test]
    fn group_writable_base_uses_0660() {
        let dir = tempdir().unwrap();
        let base = FileBase::new(dir.path(), None, None).unwrap().with_group_writable(true);
        let path = base.write_file("f.txt", b"x").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o660);
    }

    #[test]
    fn exists_distinguishes_absent_from_present() {
        let dir = tempdir().unwrap();
        let base = FileBase::new(dir.path(), None, None).unwrap();
        assert!(!base.exists("nope.txt").unwrap());
        base.write_file("nope.txt", b"x").unwrap();
        assert!(base.exists("nope.txt").unwrap());
    }

    #[test]
    fn remove_contents_empties_without_removing_subpath() {
        let dir = tempdir().unwrap();
        let base = FileBase::new(dir.path(), None, None).unwrap();
        base.write_file("keep/a.txt", b"x").unwrap();
        base.remove_contents("keep").unwrap();
        assert!(base.exists("keep").unwrap());
        assert!(!base.exists("keep/a.txt").unwrap());
    }
}
