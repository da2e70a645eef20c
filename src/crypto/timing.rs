//! Constant-time comparisons for identity checks.
//!
//! Admin and delegation checks compare wallet addresses and key bytes
//! through `subtle`, so a peer cannot probe admin identities by timing
//! moderation rejections.

use subtle::ConstantTimeEq;

/// Constant-time equality helpers.
pub struct TimingSafe;

impl TimingSafe {
    /// Compares two byte strings. A length mismatch returns early; lengths
    /// of addresses and keys are public.
    pub fn bytes_equal(a: &[u8], b: &[u8]) -> bool {
        a.len() == b.len() && bool::from(a.ct_eq(b))
    }

    /// Compares two addresses or other identity strings.
    pub fn string_equal(a: &str, b: &str) -> bool {
        Self::bytes_equal(a.as_bytes(), b.as_bytes())
    }

    /// Compares two public keys by their bytes.
    pub fn identity_equal(a: &[u8], b: &[u8]) -> bool {
        Self::bytes_equal(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_equal() {
        assert!(TimingSafe::bytes_equal(b"admin", b"admin"));
        assert!(!TimingSafe::bytes_equal(b"admin", b"admim"));
        assert!(!TimingSafe::bytes_equal(b"admin", b"admin2"));
    }

    #[test]
    fn test_address_equal() {
        assert!(TimingSafe::string_equal("0xabc", "0xabc"));
        assert!(!TimingSafe::string_equal("0xabc", "0xabd"));
    }
}
