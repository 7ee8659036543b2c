//! Content hashing with BLAKE3 or SHA-256.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::fmt;
use std::io::Read;

/// Default read size for streaming hashes (64 * 64 bytes).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 64;

/// Supported hash algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Algorithm {
    /// BLAKE3 with 256-bit output.
    #[default]
    #[serde(rename = "blake3-256")]
    Blake3,
    /// SHA-256.
    #[serde(rename = "sha256")]
    Sha256,
}

impl Algorithm {
    /// Returns the string representation of the algorithm (for settings files).
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Blake3 => "blake3-256",
            Algorithm::Sha256 => "sha256",
        }
    }

    /// Parse algorithm from string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "blake3" | "blake3-256" => Ok(Algorithm::Blake3),
            "sha256" => Ok(Algorithm::Sha256),
            _ => Err(Error::invalid_settings(format!(
                "unsupported hash algorithm: {}",
                s
            ))),
        }
    }

    /// Length of a hex digest produced by this algorithm.
    pub fn hex_len(&self) -> usize {
        64
    }

    /// True if `digest` is a lower-case hex digest of the right length.
    pub fn is_valid_digest(&self, digest: &str) -> bool {
        digest.len() == self.hex_len()
            && digest
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }

    fn hasher(&self) -> Hasher {
        match self {
            Algorithm::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
            Algorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Hasher {
    Blake3(Box<blake3::Hasher>),
    Sha256(sha2::Sha256),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Blake3(h) => {
                h.update(data);
            }
            Hasher::Sha256(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Blake3(h) => hex::encode(h.finalize().as_bytes()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Observer for long-running hashes. Has no influence on the result.
pub trait Progress: Send + Sync {
    /// Called after every chunk with the number of bytes just consumed.
    fn advance(&self, label: &str, bytes: u64);

    /// Called once the stream for `label` is exhausted.
    fn finish(&self, _label: &str, _total: u64) {}
}

/// Hash raw bytes, returning a lower-case hex digest.
pub fn hash_bytes(algorithm: Algorithm, data: &[u8]) -> String {
    let mut hasher = algorithm.hasher();
    hasher.update(data);
    hasher.finalize_hex()
}

/// Hash a reader in `chunk_size` pieces, reporting each chunk to `progress`.
pub fn hash_reader<R: Read + ?Sized>(
    algorithm: Algorithm,
    reader: &mut R,
    chunk_size: usize,
    progress: Option<(&dyn Progress, &str)>,
) -> Result<String> {
    let mut hasher = algorithm.hasher();
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buf[..n]);
        total += n as u64;
        if let Some((observer, label)) = progress {
            observer.advance(label, n as u64);
        }
    }

    if let Some((observer, label)) = progress {
        observer.finish(label, total);
    }
    Ok(hasher.finalize_hex())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_blake3_hello_world() {
        assert_eq!(
            hash_bytes(Algorithm::Blake3, b"hello world"),
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
    }

    #[test]
    fn test_sha256_hello_world() {
        assert_eq!(
            hash_bytes(Algorithm::Sha256, b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_algorithm_parse() {
        assert_eq!(Algorithm::parse("blake3").unwrap(), Algorithm::Blake3);
        assert_eq!(Algorithm::parse("blake3-256").unwrap(), Algorithm::Blake3);
        assert_eq!(Algorithm::parse("sha256").unwrap(), Algorithm::Sha256);
        assert!(Algorithm::parse("md5").is_err());
    }

    #[test]
    fn test_digest_validation() {
        let algo = Algorithm::Blake3;
        let good = hash_bytes(algo, b"x");
        assert!(algo.is_valid_digest(&good));
        assert!(!algo.is_valid_digest(&good.to_uppercase()));
        assert!(!algo.is_valid_digest(&good[1..]));
    }

    struct Counter(AtomicU64, AtomicU64);

    impl Progress for Counter {
        fn advance(&self, _label: &str, bytes: u64) {
            self.0.fetch_add(bytes, Ordering::SeqCst);
        }

        fn finish(&self, _label: &str, total: u64) {
            self.1.store(total, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_progress_sees_every_byte() {
        let data = vec![7u8; 10_000];
        let counter = Counter(AtomicU64::new(0), AtomicU64::new(0));
        let digest = hash_reader(
            Algorithm::Blake3,
            &mut Cursor::new(&data),
            DEFAULT_CHUNK_SIZE,
            Some((&counter, "blob")),
        )
        .unwrap();
        assert_eq!(digest, hash_bytes(Algorithm::Blake3, &data));
        assert_eq!(counter.0.load(Ordering::SeqCst), 10_000);
        assert_eq!(counter.1.load(Ordering::SeqCst), 10_000);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            max_shrink_iters: 1000,
            ..ProptestConfig::default()
        })]

        #[test]
        fn prop_chunked_matches_one_shot(
            data in prop::collection::vec(any::<u8>(), 0..20_000),
            chunk in 1usize..9000,
        ) {
            for algo in [Algorithm::Blake3, Algorithm::Sha256] {
                let streamed = hash_reader(algo, &mut Cursor::new(&data), chunk, None).unwrap();
                prop_assert_eq!(streamed, hash_bytes(algo, &data));
            }
        }
    }
}
