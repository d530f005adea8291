//! SHA-256 content digests for cached artifacts

use sha2::{Digest, Sha256};

/// Compute the lowercase hex SHA-256 digest of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(
        b"" as &[u8],
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    )]
    #[case(
        b"hello" as &[u8],
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
    )]
    fn sha256_hex_matches_known_digests(#[case] input: &[u8], #[case] expected: &str) {
        assert_eq!(sha256_hex(input), expected);
    }

    #[test]
    fn sha256_hex_is_deterministic() {
        let data = vec![0u8; 1024];
        assert_eq!(sha256_hex(&data), sha256_hex(&data));
    }
}
