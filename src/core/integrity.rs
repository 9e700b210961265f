use crate::core::error::{EngineError, IntegrityError};
/// Size and SHA-256 validation of assembled files and chunks
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// Streaming hash buffer.
const HASH_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Files at or above this size are hashed even without an expected hash, so
/// the computed digest can be recorded.
const HASH_ALWAYS_THRESHOLD: u64 = 1024 * 1024;

/// Outcome of a successful verification.
#[derive(Debug, Clone)]
pub struct Verification {
    pub size: u64,
    pub hash: Option<String>,
    pub hash_checked: bool,
}

pub struct Verifier;

impl Verifier {
    /// Verify an assembled file: size first, then SHA-256 when an expected
    /// hash is present or the file is large enough to be worth recording.
    pub fn verify_file(
        path: &Path,
        expected_size: u64,
        expected_hash: Option<&str>,
        progress: Option<&mut dyn FnMut(u64, u64)>,
    ) -> Result<Verification, EngineError> {
        let actual = std::fs::metadata(path)?.len();
        if actual != expected_size {
            return Err(IntegrityError::SizeMismatch {
                expected: expected_size,
                actual,
            }
            .into());
        }

        let should_hash = expected_hash.is_some() || expected_size >= HASH_ALWAYS_THRESHOLD;
        if !should_hash {
            return Ok(Verification {
                size: actual,
                hash: None,
                hash_checked: false,
            });
        }

        let computed = Self::hash_file(path, expected_size, progress)?;
        if let Some(expected) = expected_hash {
            if !computed.eq_ignore_ascii_case(expected) {
                return Err(IntegrityError::HashMismatch {
                    expected: expected.to_string(),
                    actual: computed,
                }
                .into());
            }
            debug!(path = %path.display(), "hash verified");
            return Ok(Verification {
                size: actual,
                hash: Some(computed),
                hash_checked: true,
            });
        }

        Ok(Verification {
            size: actual,
            hash: Some(computed),
            hash_checked: false,
        })
    }

    /// Chunk-granularity mirror of `verify_file`.
    pub fn verify_chunk(
        path: &Path,
        index: u32,
        expected_size: u64,
        expected_hash: Option<&str>,
    ) -> Result<Verification, EngineError> {
        let actual = std::fs::metadata(path)?.len();
        if actual != expected_size {
            return Err(IntegrityError::ChunkSizeMismatch {
                index,
                expected: expected_size,
                actual,
            }
            .into());
        }
        if let Some(expected) = expected_hash {
            let computed = Self::hash_file(path, expected_size, None)?;
            if !computed.eq_ignore_ascii_case(expected) {
                return Err(IntegrityError::HashMismatch {
                    expected: expected.to_string(),
                    actual: computed,
                }
                .into());
            }
            return Ok(Verification {
                size: actual,
                hash: Some(computed),
                hash_checked: true,
            });
        }
        Ok(Verification {
            size: actual,
            hash: None,
            hash_checked: false,
        })
    }

    /// Streaming SHA-256 of a whole file.
    pub fn hash_file(
        path: &Path,
        total: u64,
        mut progress: Option<&mut dyn FnMut(u64, u64)>,
    ) -> Result<String, EngineError> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
        let mut hashed = 0u64;
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            hashed += read as u64;
            if let Some(cb) = progress.as_deref_mut() {
                cb(hashed, total);
            }
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// SHA-256 of an in-memory window (tail checkpoints).
    pub fn hash_bytes(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    /// Hash the last `window` bytes of a file, for resume checkpoints.
    /// Returns the window size actually hashed.
    pub fn hash_tail(path: &Path, window: u64) -> Result<(String, u64), EngineError> {
        use std::io::{Seek, SeekFrom};
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        let take = window.min(len);
        file.seek(SeekFrom::Start(len - take))?;
        let mut data = vec![0u8; take as usize];
        file.read_exact(&mut data)?;
        Ok((Self::hash_bytes(&data), take))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_file(dir: &Path, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    #[test]
    fn test_size_mismatch() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "f.bin", b"hello");
        let err = Verifier::verify_file(&path, 99, None, None).unwrap_err();
        assert_eq!(err.error_code(), "SIZE_MISMATCH");
    }

    #[test]
    fn test_small_file_skips_hash_without_expectation() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "f.bin", b"hello");
        let v = Verifier::verify_file(&path, 5, None, None).unwrap();
        assert!(v.hash.is_none());
        assert!(!v.hash_checked);
    }

    #[test]
    fn test_expected_hash_checked() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "f.bin", b"hello");
        let expected = Verifier::hash_bytes(b"hello");

        let v = Verifier::verify_file(&path, 5, Some(&expected), None).unwrap();
        assert!(v.hash_checked);
        assert_eq!(v.hash.as_deref(), Some(expected.as_str()));

        let err = Verifier::verify_file(&path, 5, Some("deadbeef"), None).unwrap_err();
        assert_eq!(err.error_code(), "HASH_MISMATCH");
    }

    #[test]
    fn test_chunk_verification() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "c.bin", b"0123456789");
        assert!(Verifier::verify_chunk(&path, 0, 10, None).is_ok());
        let err = Verifier::verify_chunk(&path, 3, 11, None).unwrap_err();
        assert_eq!(err.error_code(), "CHUNK_SIZE_MISMATCH");
    }

    #[test]
    fn test_progress_callback_reports() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "f.bin", &vec![7u8; 1024]);
        let mut seen = Vec::new();
        let mut cb = |done: u64, total: u64| seen.push((done, total));
        Verifier::hash_file(&path, 1024, Some(&mut cb)).unwrap();
        assert_eq!(seen.last(), Some(&(1024, 1024)));
    }

    #[test]
    fn test_hash_tail_window() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "f.bin", b"abcdefghij");
        let (tail, size) = Verifier::hash_tail(&path, 4).unwrap();
        assert_eq!(size, 4);
        assert_eq!(tail, Verifier::hash_bytes(b"ghij"));

        // window larger than file hashes the whole file
        let (whole, size) = Verifier::hash_tail(&path, 100).unwrap();
        assert_eq!(size, 10);
        assert_eq!(whole, Verifier::hash_bytes(b"abcdefghij"));
    }
}
