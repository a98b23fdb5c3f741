use std::fs;
use std::io;
use std::path::Path;
use walkdir::WalkDir;

/// Compute the BLAKE3 hash of a byte slice, returning the hex-encoded digest.
#[must_use]
pub fn blake3_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Digest an entire directory tree: relative paths, entry kinds, file
/// contents and symlink targets. Symlinks are not followed.
///
/// Two trees with the same digest are byte-for-byte identical.
///
/// # Errors
/// Returns an error if any entry cannot be read.
pub fn tree_digest(root: &Path) -> io::Result<String> {
    let mut hasher = blake3::Hasher::new();

    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
    {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        let ft = entry.file_type();

        hasher.update(rel.as_bytes());
        hasher.update(&[0]);
        if ft.is_symlink() {
            hasher.update(b"L");
            let target = fs::read_link(entry.path())?;
            hasher.update(target.to_string_lossy().as_bytes());
        } else if ft.is_dir() {
            hasher.update(b"D");
        } else {
            hasher.update(b"F");
            hasher.update(&fs::read(entry.path())?);
        }
        hasher.update(&[0]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_blake3_bytes() {
        let hash = blake3_bytes(b"hello world");
        assert_eq!(
            hash,
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
    }

    #[test]
    fn test_tree_digest_tracks_content() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        fs::write(dir.path().join("a").join("f"), "one").unwrap();
        let before = tree_digest(dir.path()).unwrap();

        assert_eq!(before, tree_digest(dir.path()).unwrap());

        fs::write(dir.path().join("a").join("f"), "two").unwrap();
        assert_ne!(before, tree_digest(dir.path()).unwrap());
    }

    #[test]
    fn test_tree_digest_tracks_empty_dirs() {
        let dir = tempdir().unwrap();
        let before = tree_digest(dir.path()).unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();
        assert_ne!(before, tree_digest(dir.path()).unwrap());
    }
}
