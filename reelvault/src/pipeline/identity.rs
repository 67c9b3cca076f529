//! Content-derived video identity.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// How many bytes from the start of the file go into the hash.
const HASH_SAMPLE_BYTES: u64 = 32 * 1024;

/// Length of the hex identifier.
const HASH_LEN: usize = 8;

/// Compute the identity hash for a submitted file.
///
/// SHA-256 over the file name, the owner, the file size (big-endian u64) and
/// the first 32 KiB of content, truncated to the first 8 hex digits. The same
/// file resubmitted by the same owner always maps to the same hash; a
/// different owner gets a different one.
///
/// Empty files are rejected here so no identity is ever derived from them.
pub fn compute_video_hash(path: &Path, owner: &str) -> Result<String> {
    let meta = std::fs::metadata(path)?;
    if meta.len() == 0 {
        return Err(Error::metadata(format!(
            "refusing to hash empty file '{}'",
            path.display()
        )));
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::metadata(format!("invalid file name '{}'", path.display())))?;

    let mut hasher = Sha256::new();
    hasher.update(file_name.as_bytes());
    hasher.update(owner.as_bytes());
    hasher.update(meta.len().to_be_bytes());

    let mut sample = Vec::with_capacity(HASH_SAMPLE_BYTES as usize);
    File::open(path)?
        .take(HASH_SAMPLE_BYTES)
        .read_to_end(&mut sample)?;
    hasher.update(&sample);

    Ok(hex::encode(hasher.finalize())[..HASH_LEN].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn deterministic_for_same_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "clip.mp4", b"some video bytes");

        let a = compute_video_hash(&path, "alice").unwrap();
        let b = compute_video_hash(&path, "alice").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn owner_changes_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "clip.mp4", b"some video bytes");

        let alice = compute_video_hash(&path, "alice").unwrap();
        let bob = compute_video_hash(&path, "bob").unwrap();
        assert_ne!(alice, bob);
    }

    #[test]
    fn name_changes_hash_even_for_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_file(dir.path(), "a.mp4", b"identical");
        let b = write_file(dir.path(), "b.mp4", b"identical");

        assert_ne!(
            compute_video_hash(&a, "alice").unwrap(),
            compute_video_hash(&b, "alice").unwrap()
        );
    }

    #[test]
    fn bytes_past_sample_window_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut head = vec![7u8; HASH_SAMPLE_BYTES as usize];
        let a = write_file(dir.path(), "clip.mp4", &[head.clone(), vec![1, 2, 3]].concat());

        head.extend_from_slice(&[9, 9, 9]);
        let dir2 = tempfile::tempdir().unwrap();
        let b = write_file(dir2.path(), "clip.mp4", &head);

        // Same name, owner, size and prefix: tails differ but hashes match.
        assert_eq!(
            compute_video_hash(&a, "alice").unwrap(),
            compute_video_hash(&b, "alice").unwrap()
        );
    }

    #[test]
    fn empty_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "empty.mp4", b"");
        assert!(compute_video_hash(&path, "alice").is_err());
    }
}
