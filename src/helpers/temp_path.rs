use std::{
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
};

/// A file path that is removed when the guard drops, unless kept.
#[derive(Debug)]
pub struct TempPath {
    path: PathBuf,
    delete_on_drop: bool,
}
impl TempPath {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            delete_on_drop: true,
        }
    }

    /// `<path>.<suffix>` next to the original, e.g. `song.flac.cover.jpg`.
    pub fn beside<S: AsRef<OsStr>>(path: &Path, suffix: S) -> Self {
        let mut f = path.as_os_str().to_os_string();
        f.push(".");
        f.push(suffix);
        Self::new(f)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Disarms the guard and hands back the path.
    pub fn keep(mut self) -> PathBuf {
        self.delete_on_drop = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for TempPath {
    fn drop(&mut self) {
        if self.delete_on_drop {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_on_drop() {
        let dir = tempfile::tempdir().expect("temp dir");
        let guard = TempPath::beside(&dir.path().join("song.flac"), "cover.jpg");
        assert_eq!(guard.path(), dir.path().join("song.flac.cover.jpg"));

        fs::write(guard.path(), b"jpeg").expect("write");
        let p = guard.path().to_path_buf();
        drop(guard);

        assert!(!p.exists());
    }

    #[test]
    fn kept_files_survive() {
        let dir = tempfile::tempdir().expect("temp dir");
        let guard = TempPath::new(dir.path().join("keep.tmp"));
        fs::write(guard.path(), b"data").expect("write");

        let p = guard.keep();
        assert!(p.exists());
    }

    #[test]
    fn missing_file_is_fine() {
        let dir = tempfile::tempdir().expect("temp dir");
        drop(TempPath::new(dir.path().join("never-created")));
    }
}
