//! HKDF-SHA256 key schedule helpers.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::CryptoError;

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
///
/// `salt` may be `None` (HKDF will use a zeroed salt).
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Derive a labelled 32-byte subkey from a 32-byte root.
pub fn derive_subkey(root: &[u8; 32], label: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut key = [0u8; 32];
    hkdf_expand(root, Some(b"rps-session-v1"), label, &mut key)?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subkeys_differ_per_label() {
        let root = [7u8; 32];
        let a = derive_subkey(&root, b"rps-host-to-sat").unwrap();
        let b = derive_subkey(&root, b"rps-sat-to-host").unwrap();
        assert_ne!(a, b);
    }
}
