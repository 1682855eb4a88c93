//! Payload checksum verification.
//!
//! The expected value is given as `algorithm:hash`. Bytes are hashed as they
//! stream past, so verification costs no extra pass over the data.

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use importer_shared::{ImportError, ImportResult};
use parking_lot::Mutex;
use sha1::Digest;

/// Supported hash algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    fn parse(name: &str) -> ImportResult<Self> {
        match name {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(ImportError::InvalidArgument(format!(
                "unsupported hash algorithm '{}': supported algorithms are: md5, sha1, sha256, sha512",
                other
            ))),
        }
    }

    /// Length of the hex digest.
    fn hex_len(self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Sha1 => 40,
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        };
        f.write_str(name)
    }
}

enum Hasher {
    Md5(md5::Context),
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
}

impl Hasher {
    fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Md5 => Hasher::Md5(md5::Context::new()),
            ChecksumAlgorithm::Sha1 => Hasher::Sha1(sha1::Sha1::new()),
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            ChecksumAlgorithm::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(ctx) => ctx.consume(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    fn finish_hex(&mut self, algorithm: ChecksumAlgorithm) -> String {
        match std::mem::replace(self, Hasher::new(algorithm)) {
            Hasher::Md5(ctx) => format!("{:x}", ctx.compute()),
            Hasher::Sha1(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Expected checksum plus the running hash of the bytes seen so far.
pub struct ChecksumValidator {
    algorithm: ChecksumAlgorithm,
    expected: String,
    hasher: Arc<Mutex<Hasher>>,
}

impl std::fmt::Debug for ChecksumValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChecksumValidator")
            .field("algorithm", &self.algorithm)
            .field("expected", &self.expected)
            .finish_non_exhaustive()
    }
}

impl ChecksumValidator {
    /// Parse `algorithm:hash`. The hash must be hex of the algorithm's length.
    pub fn parse(spec: &str) -> ImportResult<Self> {
        let (algorithm, hash) = spec.split_once(':').ok_or_else(|| {
            ImportError::InvalidArgument(format!(
                "invalid checksum format: expected 'algorithm:hash', got '{}'",
                spec
            ))
        })?;

        let algorithm = ChecksumAlgorithm::parse(&algorithm.trim().to_ascii_lowercase())?;
        let expected = hash.trim().to_ascii_lowercase();
        if expected.is_empty() {
            return Err(ImportError::InvalidArgument(
                "checksum hash value cannot be empty".into(),
            ));
        }
        if expected.len() != algorithm.hex_len() {
            return Err(ImportError::InvalidArgument(format!(
                "invalid {} hash length: expected {} hex characters, got {}",
                algorithm,
                algorithm.hex_len(),
                expected.len()
            )));
        }
        if hex::decode(&expected).is_err() {
            return Err(ImportError::InvalidArgument(
                "checksum hash is not valid hexadecimal".into(),
            ));
        }

        Ok(Self {
            algorithm,
            hasher: Arc::new(Mutex::new(Hasher::new(algorithm))),
            expected,
        })
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Wrap `inner` so everything read through it is hashed.
    pub fn reader<R: Read>(&self, inner: R) -> ChecksumReader<R> {
        ChecksumReader {
            inner,
            hasher: Arc::clone(&self.hasher),
        }
    }

    /// Compare the digest of everything read so far with the expected value.
    pub fn validate(&self) -> ImportResult<()> {
        let actual = self.hasher.lock().finish_hex(self.algorithm);
        if actual != self.expected {
            return Err(ImportError::ChecksumMismatch {
                expected: format!("{}:{}", self.algorithm, self.expected),
                actual: format!("{}:{}", self.algorithm, actual),
            });
        }
        tracing::info!("Checksum verification passed: {}:{}", self.algorithm, actual);
        Ok(())
    }
}

/// Reader that feeds a [`ChecksumValidator`].
pub struct ChecksumReader<R> {
    inner: R,
    hasher: Arc<Mutex<Hasher>>,
}

impl<R: Read> Read for ChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.hasher.lock().update(&buf[..n]);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use importer_shared::ErrorKind;

    const DATA: &[u8] = b"hello world";
    const MD5: &str = "5eb63bbbe01eeed093cb22bb8f5acdc3";
    const SHA1: &str = "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed";
    const SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    fn read_through(validator: &ChecksumValidator) {
        let mut reader = validator.reader(DATA);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).expect("Should read test data");
        assert_eq!(out, DATA);
    }

    #[test]
    fn test_matching_checksums() {
        for spec in [
            format!("md5:{}", MD5),
            format!("sha1:{}", SHA1),
            format!("SHA256:{}", SHA256.to_uppercase()),
        ] {
            let validator = ChecksumValidator::parse(&spec).expect("Should parse checksum");
            read_through(&validator);
            validator.validate().expect("Checksum should match");
        }
    }

    #[test]
    fn test_mismatch() {
        let wrong = "0".repeat(64);
        let validator =
            ChecksumValidator::parse(&format!("sha256:{}", wrong)).expect("Should parse checksum");
        read_through(&validator);
        let err = validator.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
        assert!(err.to_string().contains(SHA256));
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            "sha256",
            "sha256:",
            "crc32:deadbeef",
            "md5:abc",
            &format!("md5:{}", "z".repeat(32)),
        ] {
            let err = ChecksumValidator::parse(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "input {}", bad);
        }
    }
}
