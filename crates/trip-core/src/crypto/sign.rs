//! Ed25519 signing and verification over canonical encodings.
//!
//! Every signature in the protocol covers a deterministic canonical CBOR
//! encoding, so verification always re-encodes from parsed fields rather
//! than trusting attacker-supplied bytes.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use thiserror::Error;

/// Ed25519 public key size in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 secret key size in bytes.
pub const SECRET_KEY_SIZE: usize = 32;

/// Ed25519 signature size in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Errors from signature parsing and verification.
#[derive(Debug, Error)]
pub enum SignError {
    /// Public key bytes have the wrong length.
    #[error("invalid public key length: expected {PUBLIC_KEY_SIZE}, got {got}")]
    InvalidKeyLength {
        /// Actual length supplied.
        got: usize,
    },

    /// Public key bytes are not a valid curve point.
    #[error("malformed Ed25519 public key: not a valid curve point")]
    MalformedKey,

    /// Signature bytes have the wrong length.
    #[error("invalid signature length: expected {SIGNATURE_SIZE}, got {got}")]
    InvalidSignatureLength {
        /// Actual length supplied.
        got: usize,
    },

    /// Signature did not verify under the given key.
    #[error("signature verification failed")]
    VerificationFailed,
}

/// Parses a verifying key from raw bytes, rejecting invalid curve points.
///
/// # Errors
///
/// Returns [`SignError::InvalidKeyLength`] or [`SignError::MalformedKey`].
pub fn parse_verifying_key(bytes: &[u8]) -> Result<VerifyingKey, SignError> {
    let arr: [u8; PUBLIC_KEY_SIZE] = bytes
        .try_into()
        .map_err(|_| SignError::InvalidKeyLength { got: bytes.len() })?;
    VerifyingKey::from_bytes(&arr).map_err(|_| SignError::MalformedKey)
}

/// Parses a 64-byte signature.
///
/// # Errors
///
/// Returns [`SignError::InvalidSignatureLength`] on length mismatch.
pub fn parse_signature(bytes: &[u8]) -> Result<Signature, SignError> {
    let arr: [u8; SIGNATURE_SIZE] = bytes
        .try_into()
        .map_err(|_| SignError::InvalidSignatureLength { got: bytes.len() })?;
    Ok(Signature::from_bytes(&arr))
}

/// Verifies `signature` over `message` under `public_key`.
///
/// Uses strict verification to reject malleable and non-canonical
/// signatures.
///
/// # Errors
///
/// Returns [`SignError::VerificationFailed`] if the signature does not
/// verify, or a parse error for malformed inputs.
pub fn verify_signature(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), SignError> {
    let key = parse_verifying_key(public_key)?;
    let sig = parse_signature(signature)?;
    key.verify_strict(message, &sig)
        .map_err(|_| SignError::VerificationFailed)
}

/// Signs `message` with `key`, returning the raw 64 signature bytes.
#[must_use]
pub fn sign_message(key: &SigningKey, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
    key.sign(message).to_bytes()
}

/// Non-strict verification for interoperability tests.
///
/// # Errors
///
/// Returns [`SignError::VerificationFailed`] if the signature does not
/// verify.
pub fn verify_signature_lenient(
    key: &VerifyingKey,
    message: &[u8],
    signature: &Signature,
) -> Result<(), SignError> {
    key.verify(message, signature)
        .map_err(|_| SignError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;

    fn keypair() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let key = keypair();
        let msg = b"canonical bytes";
        let sig = sign_message(&key, msg);

        verify_signature(key.verifying_key().as_bytes(), msg, &sig).unwrap();
    }

    #[test]
    fn single_bit_flip_fails() {
        let key = keypair();
        let msg = b"canonical bytes".to_vec();
        let sig = sign_message(&key, &msg);

        for byte in 0..msg.len() {
            let mut mutated = msg.clone();
            mutated[byte] ^= 0x01;
            assert!(
                verify_signature(key.verifying_key().as_bytes(), &mutated, &sig).is_err(),
                "flip at byte {byte} should fail verification"
            );
        }
    }

    #[test]
    fn wrong_key_fails() {
        let key = keypair();
        let other = keypair();
        let sig = sign_message(&key, b"msg");

        assert!(matches!(
            verify_signature(other.verifying_key().as_bytes(), b"msg", &sig),
            Err(SignError::VerificationFailed)
        ));
    }

    #[test]
    fn bad_lengths_rejected() {
        assert!(matches!(
            parse_verifying_key(&[0u8; 31]),
            Err(SignError::InvalidKeyLength { got: 31 })
        ));
        assert!(matches!(
            parse_signature(&[0u8; 63]),
            Err(SignError::InvalidSignatureLength { got: 63 })
        ));
    }
}
