use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Atomically write bytes to a file by writing to a temp file then renaming.
///
/// This provides crash-safety: the file will either have the old contents or
/// the new contents, never a partial write.
///
/// # Errors
/// Returns an error if the write or rename fails.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    atomic_write_all(&[(path, bytes)])
}

/// Atomically replace several files as one unit.
///
/// Every temp file is written and synced before the first rename happens, so a
/// failure while writing leaves all targets untouched. Files that must never
/// disagree on disk (e.g. a lockfile and its private copy) go through here
/// together.
///
/// # Errors
/// Returns an error if any write or rename fails. Temp files are cleaned up.
pub fn atomic_write_all(files: &[(&Path, &[u8])]) -> io::Result<()> {
    let mut staged: Vec<(PathBuf, &Path)> = Vec::with_capacity(files.len());

    for (path, bytes) in files {
        match write_temp(path, bytes) {
            Ok(temp_path) => staged.push((temp_path, path)),
            Err(e) => {
                discard(&staged);
                return Err(e);
            }
        }
    }

    for (i, (temp_path, path)) in staged.iter().enumerate() {
        if let Err(e) = rename_over(temp_path, path) {
            discard(&staged[i..]);
            return Err(e);
        }
    }

    Ok(())
}

fn write_temp(path: &Path, bytes: &[u8]) -> io::Result<PathBuf> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;

    // Same directory as the target so the rename stays on one filesystem
    let temp_path = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        std::process::id()
    ));

    let mut file = File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;

    Ok(temp_path)
}

fn rename_over(temp_path: &Path, path: &Path) -> io::Result<()> {
    match fs::rename(temp_path, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            // On Windows, rename can fail if target exists. Try copy + remove as fallback.
            if cfg!(windows) {
                fs::copy(temp_path, path)?;
                let _ = fs::remove_file(temp_path);
                Ok(())
            } else {
                let _ = fs::remove_file(temp_path);
                Err(e)
            }
        }
    }
}

fn discard(staged: &[(PathBuf, &Path)]) {
    for (temp_path, _) in staged {
        let _ = fs::remove_file(temp_path);
    }
}

/// Check whether `path` lies inside `dir` (lexically, after canonicalizing both when possible).
#[must_use]
pub fn is_subdir(dir: &Path, path: &Path) -> bool {
    let dir = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    path.starts_with(&dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.txt");

        atomic_write(&path, b"hello").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");

        // Overwrite
        atomic_write(&path, b"world").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "world");
    }

    #[test]
    fn test_atomic_write_creates_parent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node_modules").join(".lock.json");

        atomic_write(&path, b"{}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn test_atomic_write_all_writes_every_file() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.json");
        let b = dir.path().join("nested").join("b.json");

        atomic_write_all(&[(&a, b"one"), (&b, b"two")]).unwrap();

        assert_eq!(fs::read_to_string(&a).unwrap(), "one");
        assert_eq!(fs::read_to_string(&b).unwrap(), "two");
    }

    #[test]
    fn test_atomic_write_all_no_temp_left_on_success() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");

        atomic_write_all(&[(&a, b"one"), (&b, b"two")]).unwrap();

        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.json", "b.json"]);
    }

    #[test]
    fn test_is_subdir() {
        let dir = tempdir().unwrap();
        let inner = dir.path().join("store").join("pkg");
        fs::create_dir_all(&inner).unwrap();

        assert!(is_subdir(&dir.path().join("store"), &inner));
        assert!(!is_subdir(&inner, &dir.path().join("store")));
    }
}
