//! Proof-of-Humanity certificates: the signed attestation result.
//!
//! A certificate carries only statistical summaries, never cells,
//! coordinates, timestamps beyond issuance, or any breadcrumb material.
//! The wire form is a canonical CBOR map with integer keys 0..14:
//!
//! | key | field            | type          |
//! |-----|------------------|---------------|
//! | 0   | identity         | bstr .size 32 |
//! | 1   | issued at        | uint          |
//! | 2   | epoch count      | uint          |
//! | 3   | α                | float         |
//! | 4   | β                | float         |
//! | 5   | κ (km)           | float         |
//! | 6   | Π                | float         |
//! | 7   | confidence       | float         |
//! | 8   | trust score      | uint          |
//! | 9   | unique cells     | uint          |
//! | 10  | breadcrumb count | uint          |
//! | 11  | validity (s)     | uint          |
//! | 12  | nonce            | bstr .size 16 |
//! | 13  | chain head hash  | bstr .size 32 |
//! | 14  | signature        | bstr .size 64 |
//!
//! The nonce (field 12) and chain-head hash (field 13) are mandatory:
//! they bind the certificate to one relying-party challenge and one
//! chain state. The verifier signs fields 0..13.

use ciborium::value::Value;
use ed25519_dalek::SigningKey;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::breadcrumb::IdentityKey;
use crate::codec::{CanonicalMap, CodecError, MapReader, decode_canonical, encode_value};
use crate::criticality::Verdict;
use crate::crypto::{Hash, SIGNATURE_SIZE, sign_message, verify_signature};

/// Size of the relying-party nonce.
pub const NONCE_SIZE: usize = 16;

mod wire {
    pub const IDENTITY: u64 = 0;
    pub const ISSUED_AT: u64 = 1;
    pub const EPOCH_COUNT: u64 = 2;
    pub const ALPHA: u64 = 3;
    pub const BETA: u64 = 4;
    pub const KAPPA: u64 = 5;
    pub const PREDICTABILITY: u64 = 6;
    pub const CONFIDENCE: u64 = 7;
    pub const TRUST: u64 = 8;
    pub const UNIQUE_CELLS: u64 = 9;
    pub const BREADCRUMBS: u64 = 10;
    pub const VALID_SECONDS: u64 = 11;
    pub const NONCE: u64 = 12;
    pub const HEAD_HASH: u64 = 13;
    pub const SIGNATURE: u64 = 14;
}

/// Errors from certificate construction and relying-party verification.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// Input bytes are not a canonical certificate encoding.
    #[error("malformed certificate encoding: {0}")]
    Malformed(#[from] CodecError),

    /// Verifier signature did not verify.
    #[error("certificate signature verification failed")]
    InvalidSignature,

    /// Certificate nonce differs from the relying party's challenge.
    #[error("certificate nonce mismatch")]
    NonceMismatch,

    /// Certificate head hash differs from the expected chain head.
    #[error("certificate chain-head mismatch")]
    HeadHashMismatch,
}

/// A signed Proof-of-Humanity certificate.
#[derive(Debug, Clone, PartialEq)]
pub struct PohCertificate {
    /// Attested identity.
    pub identity: IdentityKey,
    /// Issuance time, Unix seconds.
    pub issued_at: u64,
    /// Sealed epochs behind the verdict.
    pub epoch_count: u64,
    /// Spectral scaling exponent.
    pub alpha: f64,
    /// Heavy-tail exponent.
    pub beta: f64,
    /// Heavy-tail cutoff, kilometers.
    pub kappa_km: f64,
    /// Markov predictability.
    pub predictability: f64,
    /// Criticality confidence.
    pub confidence: f64,
    /// Trust score, rounded to an integer.
    pub trust_score: u8,
    /// Distinct cells visited (count only).
    pub unique_cells: u64,
    /// Total breadcrumbs evaluated.
    pub breadcrumb_count: u64,
    /// Validity duration, seconds.
    pub valid_seconds: u64,
    /// Relying-party nonce.
    pub nonce: [u8; NONCE_SIZE],
    /// Chain head hash at issuance.
    pub chain_head_hash: Hash,
    /// Verifier signature over fields 0..13.
    pub signature: [u8; SIGNATURE_SIZE],
}

impl PohCertificate {
    /// Assembles and signs a certificate from a verdict.
    ///
    /// # Errors
    ///
    /// Returns [`CertificateError::Malformed`] if encoding fails.
    pub fn issue(
        verdict: &Verdict,
        identity: IdentityKey,
        nonce: [u8; NONCE_SIZE],
        chain_head_hash: Hash,
        issued_at: u64,
        valid_seconds: u64,
        signing_key: &SigningKey,
    ) -> Result<Self, CertificateError> {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let trust_score = verdict.trust_score.round().clamp(0.0, 100.0) as u8;

        let mut cert = Self {
            identity,
            issued_at,
            epoch_count: verdict.epoch_count,
            alpha: verdict.alpha,
            beta: verdict.beta,
            kappa_km: verdict.kappa_km,
            predictability: verdict.predictability,
            confidence: verdict.confidence,
            trust_score,
            unique_cells: verdict.unique_cells,
            breadcrumb_count: verdict.breadcrumb_count,
            valid_seconds,
            nonce,
            chain_head_hash,
            signature: [0u8; SIGNATURE_SIZE],
        };
        cert.signature = sign_message(signing_key, &cert.signing_bytes()?);
        Ok(cert)
    }

    fn signing_value(&self) -> Value {
        let mut map = CanonicalMap::new();
        map.push(wire::IDENTITY, Value::Bytes(self.identity.0.to_vec()));
        map.push(wire::ISSUED_AT, Value::Integer(self.issued_at.into()));
        map.push(wire::EPOCH_COUNT, Value::Integer(self.epoch_count.into()));
        map.push(wire::ALPHA, Value::Float(self.alpha));
        map.push(wire::BETA, Value::Float(self.beta));
        map.push(wire::KAPPA, Value::Float(self.kappa_km));
        map.push(wire::PREDICTABILITY, Value::Float(self.predictability));
        map.push(wire::CONFIDENCE, Value::Float(self.confidence));
        map.push(wire::TRUST, Value::Integer(self.trust_score.into()));
        map.push(wire::UNIQUE_CELLS, Value::Integer(self.unique_cells.into()));
        map.push(
            wire::BREADCRUMBS,
            Value::Integer(self.breadcrumb_count.into()),
        );
        map.push(
            wire::VALID_SECONDS,
            Value::Integer(self.valid_seconds.into()),
        );
        map.push(wire::NONCE, Value::Bytes(self.nonce.to_vec()));
        map.push(wire::HEAD_HASH, Value::Bytes(self.chain_head_hash.to_vec()));
        map.into_value()
    }

    /// Canonical encoding of fields 0..13, the signed byte string.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if encoding fails.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CodecError> {
        encode_value(&self.signing_value())
    }

    /// Canonical encoding of the complete certificate.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let Value::Map(mut entries) = self.signing_value() else {
            unreachable!("signing_value always builds a map")
        };
        entries.push((
            Value::Integer(wire::SIGNATURE.into()),
            Value::Bytes(self.signature.to_vec()),
        ));
        encode_value(&Value::Map(entries))
    }

    /// Decodes a certificate from canonical bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] for malformed or non-canonical input.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = MapReader::new(decode_canonical(bytes)?)?;
        let cert = Self {
            identity: IdentityKey(reader.bytes_exact(wire::IDENTITY)?),
            issued_at: reader.uint(wire::ISSUED_AT)?,
            epoch_count: reader.uint(wire::EPOCH_COUNT)?,
            alpha: reader.float(wire::ALPHA)?,
            beta: reader.float(wire::BETA)?,
            kappa_km: reader.float(wire::KAPPA)?,
            predictability: reader.float(wire::PREDICTABILITY)?,
            confidence: reader.float(wire::CONFIDENCE)?,
            trust_score: u8::try_from(reader.uint(wire::TRUST)?)
                .map_err(|_| CodecError::WrongType { key: wire::TRUST })?,
            unique_cells: reader.uint(wire::UNIQUE_CELLS)?,
            breadcrumb_count: reader.uint(wire::BREADCRUMBS)?,
            valid_seconds: reader.uint(wire::VALID_SECONDS)?,
            nonce: reader.bytes_exact(wire::NONCE)?,
            chain_head_hash: reader.bytes_exact(wire::HEAD_HASH)?,
            signature: reader.bytes_exact(wire::SIGNATURE)?,
        };
        reader.finish()?;
        Ok(cert)
    }

    /// Relying-party verification: the certificate must be signed by the
    /// trusted verifier and bound to the relying party's own nonce and
    /// expected chain head.
    ///
    /// # Errors
    ///
    /// Returns a [`CertificateError`] naming the first failing binding.
    pub fn verify(
        &self,
        verifier_public_key: &[u8; 32],
        expected_nonce: &[u8; NONCE_SIZE],
        expected_head: Option<&Hash>,
    ) -> Result<(), CertificateError> {
        let message = self.signing_bytes()?;
        verify_signature(verifier_public_key, &message, &self.signature)
            .map_err(|_| CertificateError::InvalidSignature)?;

        if self.nonce.as_slice().ct_eq(expected_nonce.as_slice()).unwrap_u8() != 1 {
            return Err(CertificateError::NonceMismatch);
        }
        if let Some(head) = expected_head {
            if self
                .chain_head_hash
                .as_slice()
                .ct_eq(head.as_slice())
                .unwrap_u8()
                != 1
            {
                return Err(CertificateError::HeadHashMismatch);
            }
        }
        Ok(())
    }

    /// Whether the certificate has expired at `now_secs`.
    #[must_use]
    pub fn is_expired(&self, now_secs: u64) -> bool {
        now_secs >= self.issued_at.saturating_add(self.valid_seconds)
    }
}
