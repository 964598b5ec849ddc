//! Pairs a read-only staging directory and a writable staging directory; hard-links arbitrary
//! host files into stable names (`input`, `output`, `error`, `judge_answer`, `team_output`) and
//! clears them between cases.
//!
//! Grounded in `fileLinker` (`judgehost/filelinker.go` in the original implementation).

use std::path::{Path, PathBuf};

use crate::filebase::FileBase;
use crate::Result;

/// Hard links per-case files into a small, predictable set of directories so the sandbox's view
/// can be reasoned about as a fixed set of mounts rather than an arbitrary one.
pub struct FileLinker {
    read_base: FileBase,
    write_base: FileBase,
}

impl FileLinker {
    /// Create a linker rooted at `root`, with `root/read` (not group-writable) and `root/write`
    /// (group-writable) as its two sides.
    pub fn new(root: &FileBase) -> Result<FileLinker> {
        let read_base = root.sub_base("read")?;
        let write_base = root.sub_base("write")?.with_group_writable(true);
        Ok(FileLinker { read_base, write_base })
    }

    /// Absolute path of `name` on the selected side, whether or not it has been linked yet.
    pub fn path_for(&self, name: &str, writable: bool) -> PathBuf {
        let base = if writable { &self.write_base } else { &self.read_base };
        base.root().join(name)
    }

    /// Hard-link `src` into `name` on the selected side.
    pub fn link_file(&self, src: &Path, name: &str, writable: bool) -> Result<PathBuf> {
        let base = if writable { &self.write_base } else { &self.read_base };
        base.link_into(src, name)
    }

    /// Create an empty file at `name` on the writable side, for the sandbox to fill in (e.g.
    /// `output`/`error`).
    pub fn create_empty(&self, name: &str) -> Result<PathBuf> {
        self.write_base.write_file(name, b"")
    }

    /// Read the contents of `name` from the writable side.
    pub fn read_write_side(&self, name: &str) -> Result<Vec<u8>> {
        self.write_base.read_file(name)
    }

    /// Does `name` exist on the writable side?
    pub fn write_side_exists(&self, name: &str) -> Result<bool> {
        self.write_base.exists(name)
    }

    /// Remove all entries from both sides, ready for the next case.
    pub fn clear(&self) -> Result<()> {
        self.read_base.remove_contents(".")?;
        self.write_base.remove_contents(".")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn link_file_lands_on_the_requested_side() {
        let dir = tempdir().unwrap();
        let root = FileBase::new(dir.path(), None, None).unwrap();
        let linker = FileLinker::new(&root).unwrap();

        let src_dir = tempdir().unwrap();
        let src = src_dir.path().join("input.txt");
        fs::write(&src, b"1 2 3").unwrap();

        linker.link_file(&src, "input", false).unwrap();
        let path = linker.path_for("input", false);
        assert_eq!(fs::read(&path).unwrap(), b"1 2 3");
    }

    #[test]
    fn clear_empties_both_sides() {
        let dir = tempdir().unwrap();
        let root = FileBase::new(dir.path(), None, None).unwrap();
        let linker = FileLinker::new(&root).unwrap();

        linker.create_empty("output").unwrap();
        assert!(linker.write_side_exists("output").unwrap());

        linker.clear().unwrap();
        assert!(!linker.write_side_exists("output").unwrap());
    }
}
