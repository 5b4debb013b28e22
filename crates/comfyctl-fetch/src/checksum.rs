use std::fmt::{Display, Formatter};
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use md5::Md5;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid checksum `{0}`: expected `sha256:<hex>`, `md5:<hex>`, or bare hex")]
pub struct ChecksumParseError(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChecksumAlgorithm {
    Sha256,
    Md5,
}

impl ChecksumAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Md5 => "md5",
        }
    }
}

/// An expected artifact checksum, `<algo>:<hex>`.
///
/// Bare hex is accepted and taken to mean sha256.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Checksum {
    algorithm: ChecksumAlgorithm,
    digest: String,
}

impl Checksum {
    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// The lowercase hex digest, without the algorithm prefix.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Hash `path` with this checksum's algorithm and compare.
    ///
    /// Returns the actual digest on mismatch.
    pub fn matches_file(&self, path: &Path) -> std::io::Result<Result<(), String>> {
        let actual = hash_file(path, self.algorithm)?;
        if actual == self.digest {
            Ok(Ok(()))
        } else {
            Ok(Err(actual))
        }
    }
}

impl FromStr for Checksum {
    type Err = ChecksumParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (algorithm, digest) = match value.split_once(':') {
            Some(("sha256", digest)) => (ChecksumAlgorithm::Sha256, digest),
            Some(("md5", digest)) => (ChecksumAlgorithm::Md5, digest),
            Some(_) => return Err(ChecksumParseError(value.to_string())),
            // Bare hex implies sha256.
            None => (ChecksumAlgorithm::Sha256, value),
        };
        let digest = digest.trim().to_lowercase();
        let expected_len = match algorithm {
            ChecksumAlgorithm::Sha256 => 64,
            ChecksumAlgorithm::Md5 => 32,
        };
        if digest.len() != expected_len || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ChecksumParseError(value.to_string()));
        }
        Ok(Self { algorithm, digest })
    }
}

impl Display for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.digest)
    }
}

/// Hash a file in 1 MiB chunks.
pub fn hash_file(path: &Path, algorithm: ChecksumAlgorithm) -> std::io::Result<String> {
    let mut file = fs_err::File::open(path)?;
    let mut buffer = vec![0u8; 1024 * 1024];
    match algorithm {
        ChecksumAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = file.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
        ChecksumAlgorithm::Md5 => {
            let mut hasher = Md5::new();
            loop {
                let n = file.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prefixed_and_bare() {
        let prefixed: Checksum =
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
                .parse()
                .unwrap();
        let bare: Checksum = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
            .parse()
            .unwrap();
        assert_eq!(prefixed, bare);
        assert_eq!(prefixed.algorithm(), ChecksumAlgorithm::Sha256);

        let md5: Checksum = "md5:d41d8cd98f00b204e9800998ecf8427e".parse().unwrap();
        assert_eq!(md5.algorithm(), ChecksumAlgorithm::Md5);
    }

    #[test]
    fn rejects_malformed() {
        assert!("sha512:abcd".parse::<Checksum>().is_err());
        assert!("sha256:xyz".parse::<Checksum>().is_err());
        assert!("not-hex".parse::<Checksum>().is_err());
        assert!("sha256:abc".parse::<Checksum>().is_err());
    }

    #[test]
    fn hashes_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        fs_err::write(&path, b"").unwrap();
        assert_eq!(
            hash_file(&path, ChecksumAlgorithm::Sha256).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            hash_file(&path, ChecksumAlgorithm::Md5).unwrap(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[test]
    fn matches_file_reports_actual() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        fs_err::write(&path, b"payload").unwrap();
        let checksum: Checksum =
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
                .parse()
                .unwrap();
        let actual = checksum.matches_file(&path).unwrap().unwrap_err();
        assert_eq!(actual, hash_file(&path, ChecksumAlgorithm::Sha256).unwrap());
    }
}
