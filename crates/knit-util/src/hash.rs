/// Compute the BLAKE3 hash of a byte slice, returning the hex-encoded digest.
#[must_use]
pub fn blake3_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Short, filesystem-friendly digest of a string (first 16 hex chars of BLAKE3).
///
/// Used to derive stable directory names for identities that are not
/// valid path segments, such as tarball URLs.
#[must_use]
pub fn short_hash(input: &str) -> String {
    let mut hex = blake3_bytes(input.as_bytes());
    hex.truncate(16);
    hex
}
