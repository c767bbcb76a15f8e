// Hashing module using BLAKE3
//
// Fast hashes identify duplicate media copies across album folders and
// fingerprint source archives. The same scheme is computed either from a file
// on disk or from bytes read out of an archive, and both forms must agree.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use crate::constants::{HASH_CHUNK_SIZE, HASH_FAST_SCHEME};
use crate::error::{MigrateError, Result};

/// Compute fast hash: first 1MB + last 1MB + file size
/// Format: "blake3:first_last_size_v1:<hash>"
pub fn compute_fast_hash(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|e| MigrateError::Hash(format!("Failed to open file: {}", e)))?;

    let file_size = file.metadata()
        .map_err(|e| MigrateError::Hash(format!("Failed to get metadata: {}", e)))?
        .len();

    let mut hasher = blake3::Hasher::new();

    let mut first_chunk = vec![0u8; HASH_CHUNK_SIZE.min(file_size as usize)];
    file.read_exact(&mut first_chunk)
        .map_err(|e| MigrateError::Hash(format!("Failed to read first chunk: {}", e)))?;
    hasher.update(&first_chunk);

    if file_size > HASH_CHUNK_SIZE as u64 {
        let last_offset = file_size.saturating_sub(HASH_CHUNK_SIZE as u64);
        file.seek(SeekFrom::Start(last_offset))
            .map_err(|e| MigrateError::Hash(format!("Failed to seek: {}", e)))?;

        let mut last_chunk = vec![0u8; HASH_CHUNK_SIZE];
        file.read_exact(&mut last_chunk)
            .map_err(|e| MigrateError::Hash(format!("Failed to read last chunk: {}", e)))?;
        hasher.update(&last_chunk);
    }

    hasher.update(&file_size.to_le_bytes());

    let hash = hasher.finalize();
    Ok(format!("blake3:{}:{}", HASH_FAST_SCHEME, hash.to_hex()))
}

/// Same scheme as `compute_fast_hash`, over an in-memory buffer
/// (archive entries scanned during a dry run).
pub fn compute_fast_hash_bytes(data: &[u8]) -> String {
    let size = data.len();
    let mut hasher = blake3::Hasher::new();

    hasher.update(&data[..HASH_CHUNK_SIZE.min(size)]);
    if size > HASH_CHUNK_SIZE {
        hasher.update(&data[size - HASH_CHUNK_SIZE..]);
    }
    hasher.update(&(size as u64).to_le_bytes());

    let hash = hasher.finalize();
    format!("blake3:{}:{}", HASH_FAST_SCHEME, hash.to_hex())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_fast_hash_small_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"Hello, World!").unwrap();

        let hash = compute_fast_hash(file.path()).unwrap();
        assert!(hash.starts_with("blake3:first_last_size_v1:"));
    }

    #[test]
    fn test_file_and_bytes_agree() {
        // Larger than two chunks so the seek path is exercised
        let data: Vec<u8> = (0..(HASH_CHUNK_SIZE * 2 + 17)).map(|i| (i % 251) as u8).collect();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();

        assert_eq!(compute_fast_hash(file.path()).unwrap(), compute_fast_hash_bytes(&data));
        assert_eq!(
            compute_fast_hash_bytes(b"short"),
            {
                let mut f = NamedTempFile::new().unwrap();
                f.write_all(b"short").unwrap();
                compute_fast_hash(f.path()).unwrap()
            }
        );
    }

    #[test]
    fn test_different_content_differs() {
        assert_ne!(compute_fast_hash_bytes(b"aaaa"), compute_fast_hash_bytes(b"aaab"));
    }
}
