//! Challenge-triple messages and the frame envelope.
//!
//! Every message is a canonical CBOR map with integer keys. The
//! envelope wraps one message with a kind tag so a single framed
//! connection can carry the whole protocol:
//!
//! ```text
//! { 0: kind, 1: body }
//! ```
//!
//! Request kinds: 1 submit breadcrumbs, 2 verification request,
//! 3 liveness response, 4 cancel, 5 sealed epoch. Response kinds:
//! 64 ack, 65 liveness challenge, 66 certificate, 67 error.

use ciborium::value::Value;
use ed25519_dalek::SigningKey;
use thiserror::Error;
use trip_core::breadcrumb::IdentityKey;
use trip_core::certificate::NONCE_SIZE;
use trip_core::codec::{
    CanonicalMap, CodecError, MapReader, decode_canonical, encode_value,
};
use trip_core::crypto::{Hash, SIGNATURE_SIZE, sign_message, verify_signature};

use super::ErrorCode;

/// Structured decode failures above the raw codec layer.
#[derive(Debug, Error)]
pub enum WireError {
    /// Not a canonical message encoding.
    #[error("malformed message: {0}")]
    Codec(#[from] CodecError),

    /// Envelope kind is not defined by the protocol.
    #[error("unknown frame kind {kind}")]
    UnknownKind {
        /// The offending kind tag.
        kind: u64,
    },

    /// Error frame carried an unknown code.
    #[error("unknown error code {code}")]
    UnknownErrorCode {
        /// The offending code value.
        code: u64,
    },
}

/// Relying party's verification request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRequest {
    /// Identity to verify.
    pub identity: IdentityKey,
    /// Relying-party nonce; binds the eventual certificate.
    pub nonce: [u8; NONCE_SIZE],
    /// Request time, Unix seconds.
    pub request_timestamp: u64,
    /// Acceptable evidence freshness, seconds.
    pub freshness_window_secs: u64,
}

impl VerificationRequest {
    fn to_value(&self) -> Value {
        let mut map = CanonicalMap::new();
        map.push(0, Value::Bytes(self.identity.0.to_vec()));
        map.push(1, Value::Bytes(self.nonce.to_vec()));
        map.push(2, Value::Integer(self.request_timestamp.into()));
        map.push(3, Value::Integer(self.freshness_window_secs.into()));
        map.into_value()
    }

    fn from_value(value: Value) -> Result<Self, CodecError> {
        let mut reader = MapReader::new(value)?;
        let request = Self {
            identity: IdentityKey(reader.bytes_exact(0)?),
            nonce: reader.bytes_exact(1)?,
            request_timestamp: reader.uint(2)?,
            freshness_window_secs: reader.uint(3)?,
        };
        reader.finish()?;
        Ok(request)
    }
}

/// Verifier's liveness challenge to the attester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessChallenge {
    /// The relying party's nonce, forwarded.
    pub nonce: [u8; NONCE_SIZE],
    /// The verifier's public key.
    pub verifier_identity: [u8; 32],
    /// Challenge issue time, Unix seconds.
    pub challenge_timestamp: u64,
    /// Seconds the attester has to respond.
    pub response_deadline_secs: u64,
}

impl LivenessChallenge {
    fn to_value(&self) -> Value {
        let mut map = CanonicalMap::new();
        map.push(0, Value::Bytes(self.nonce.to_vec()));
        map.push(1, Value::Bytes(self.verifier_identity.to_vec()));
        map.push(2, Value::Integer(self.challenge_timestamp.into()));
        map.push(3, Value::Integer(self.response_deadline_secs.into()));
        map.into_value()
    }

    fn from_value(value: Value) -> Result<Self, CodecError> {
        let mut reader = MapReader::new(value)?;
        let challenge = Self {
            nonce: reader.bytes_exact(0)?,
            verifier_identity: reader.bytes_exact(1)?,
            challenge_timestamp: reader.uint(2)?,
            response_deadline_secs: reader.uint(3)?,
        };
        reader.finish()?;
        Ok(challenge)
    }
}

/// Attester's signed liveness response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessResponse {
    /// Byte-for-byte echo of the challenge nonce.
    pub nonce_echo: [u8; NONCE_SIZE],
    /// The attester's current chain head hash.
    pub chain_head_hash: Hash,
    /// Response time, Unix seconds.
    pub response_timestamp: u64,
    /// The attester's current breadcrumb index.
    pub current_index: u64,
    /// Ed25519 signature over fields 0..3.
    pub signature: [u8; SIGNATURE_SIZE],
}

impl LivenessResponse {
    fn signing_value(&self) -> Value {
        let mut map = CanonicalMap::new();
        map.push(0, Value::Bytes(self.nonce_echo.to_vec()));
        map.push(1, Value::Bytes(self.chain_head_hash.to_vec()));
        map.push(2, Value::Integer(self.response_timestamp.into()));
        map.push(3, Value::Integer(self.current_index.into()));
        map.into_value()
    }

    /// Canonical encoding of fields 0..3, the signed byte string.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if encoding fails.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CodecError> {
        encode_value(&self.signing_value())
    }

    /// Verifies the response signature under the identity key.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the signing bytes cannot be rebuilt;
    /// a `false` return means the signature did not verify.
    pub fn verify(&self, identity: &IdentityKey) -> Result<bool, CodecError> {
        let message = self.signing_bytes()?;
        Ok(verify_signature(&identity.0, &message, &self.signature).is_ok())
    }

    /// Builds and signs a response (attester fixtures and tooling).
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if encoding fails.
    pub fn signed(
        key: &SigningKey,
        nonce_echo: [u8; NONCE_SIZE],
        chain_head_hash: Hash,
        response_timestamp: u64,
        current_index: u64,
    ) -> Result<Self, CodecError> {
        let mut response = Self {
            nonce_echo,
            chain_head_hash,
            response_timestamp,
            current_index,
            signature: [0u8; SIGNATURE_SIZE],
        };
        response.signature = sign_message(key, &response.signing_bytes()?);
        Ok(response)
    }

    fn to_value(&self) -> Value {
        let Value::Map(mut entries) = self.signing_value() else {
            unreachable!("signing_value always builds a map")
        };
        entries.push((Value::Integer(4.into()), Value::Bytes(self.signature.to_vec())));
        Value::Map(entries)
    }

    fn from_value(value: Value) -> Result<Self, CodecError> {
        let mut reader = MapReader::new(value)?;
        let response = Self {
            nonce_echo: reader.bytes_exact(0)?,
            chain_head_hash: reader.bytes_exact(1)?,
            response_timestamp: reader.uint(2)?,
            current_index: reader.uint(3)?,
            signature: reader.bytes_exact(4)?,
        };
        reader.finish()?;
        Ok(response)
    }
}

mod kind {
    pub const SUBMIT: u64 = 1;
    pub const VERIFY: u64 = 2;
    pub const RESPOND: u64 = 3;
    pub const CANCEL: u64 = 4;
    pub const SEAL: u64 = 5;
    pub const ACK: u64 = 64;
    pub const CHALLENGE: u64 = 65;
    pub const CERTIFICATE: u64 = 66;
    pub const ERROR: u64 = 67;
}

/// One protocol frame: a kind-tagged message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Breadcrumb batch from an attester; the body is the canonical
    /// CBOR breadcrumb array, embedded as a byte string.
    SubmitBreadcrumbs(Vec<u8>),
    /// Verification request from a relying party.
    Verify(VerificationRequest),
    /// Liveness response from an attester.
    Respond(LivenessResponse),
    /// Relying-party withdrawal of an outstanding challenge.
    Cancel {
        /// Identity whose challenge is withdrawn.
        identity: IdentityKey,
    },
    /// Sealed epoch from an attester; the body is the canonical epoch
    /// encoding, embedded as a byte string.
    SubmitEpoch(Vec<u8>),
    /// Acknowledgement of an accepted batch.
    Ack {
        /// Breadcrumbs appended.
        appended: u64,
    },
    /// Liveness challenge toward the attester.
    Challenge(LivenessChallenge),
    /// Issued certificate; the body is the canonical certificate
    /// encoding, embedded as a byte string.
    Certificate(Vec<u8>),
    /// Failure response.
    Error {
        /// Protocol error code.
        code: ErrorCode,
        /// Human-readable detail, never required for machine handling.
        detail: String,
    },
}

impl Frame {
    /// Encodes the frame envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let (kind, body) = match self {
            Self::SubmitBreadcrumbs(batch) => (kind::SUBMIT, Value::Bytes(batch.clone())),
            Self::Verify(request) => (kind::VERIFY, request.to_value()),
            Self::Respond(response) => (kind::RESPOND, response.to_value()),
            Self::Cancel { identity } => {
                let mut map = CanonicalMap::new();
                map.push(0, Value::Bytes(identity.0.to_vec()));
                (kind::CANCEL, map.into_value())
            },
            Self::SubmitEpoch(epoch) => (kind::SEAL, Value::Bytes(epoch.clone())),
            Self::Ack { appended } => {
                let mut map = CanonicalMap::new();
                map.push(0, Value::Integer((*appended).into()));
                (kind::ACK, map.into_value())
            },
            Self::Challenge(challenge) => (kind::CHALLENGE, challenge.to_value()),
            Self::Certificate(cert) => (kind::CERTIFICATE, Value::Bytes(cert.clone())),
            Self::Error { code, detail } => {
                let mut map = CanonicalMap::new();
                map.push(0, Value::Integer(code.as_u64().into()));
                map.push(1, Value::Text(detail.clone()));
                (kind::ERROR, map.into_value())
            },
        };

        let mut envelope = CanonicalMap::new();
        envelope.push(0, Value::Integer(kind.into()));
        envelope.push(1, body);
        envelope.encode()
    }

    /// Decodes a frame envelope.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] for malformed envelopes or unknown kinds.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = MapReader::new(decode_canonical(bytes)?)?;
        let kind = reader.uint(0)?;
        let body = reader.take(1).ok_or(CodecError::MissingField { key: 1 })?;
        reader.finish()?;

        let frame = match kind {
            kind::SUBMIT => match body {
                Value::Bytes(batch) => Self::SubmitBreadcrumbs(batch),
                _ => return Err(CodecError::WrongType { key: 1 }.into()),
            },
            kind::VERIFY => Self::Verify(VerificationRequest::from_value(body)?),
            kind::RESPOND => Self::Respond(LivenessResponse::from_value(body)?),
            kind::CANCEL => {
                let mut reader = MapReader::new(body)?;
                let identity = IdentityKey(reader.bytes_exact(0)?);
                reader.finish()?;
                Self::Cancel { identity }
            },
            kind::SEAL => match body {
                Value::Bytes(epoch) => Self::SubmitEpoch(epoch),
                _ => return Err(CodecError::WrongType { key: 1 }.into()),
            },
            kind::ACK => {
                let mut reader = MapReader::new(body)?;
                let appended = reader.uint(0)?;
                reader.finish()?;
                Self::Ack { appended }
            },
            kind::CHALLENGE => Self::Challenge(LivenessChallenge::from_value(body)?),
            kind::CERTIFICATE => match body {
                Value::Bytes(cert) => Self::Certificate(cert),
                _ => return Err(CodecError::WrongType { key: 1 }.into()),
            },
            kind::ERROR => {
                let mut reader = MapReader::new(body)?;
                let code = reader.uint(0)?;
                let detail = match reader.take(1) {
                    Some(Value::Text(text)) => text,
                    Some(_) => return Err(CodecError::WrongType { key: 1 }.into()),
                    None => String::new(),
                };
                reader.finish()?;
                Self::Error {
                    code: ErrorCode::from_u64(code)
                        .ok_or(WireError::UnknownErrorCode { code })?,
                    detail,
                }
            },
            _ => return Err(WireError::UnknownKind { kind }),
        };
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn request_roundtrip() {
        let frame = Frame::Verify(VerificationRequest {
            identity: IdentityKey([0x11; 32]),
            nonce: [0x22; NONCE_SIZE],
            request_timestamp: 1_700_000_000,
            freshness_window_secs: 600,
        });
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn challenge_roundtrip() {
        let frame = Frame::Challenge(LivenessChallenge {
            nonce: [0x22; NONCE_SIZE],
            verifier_identity: [0x33; 32],
            challenge_timestamp: 1_700_000_000,
            response_deadline_secs: 30,
        });
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn response_signature_roundtrip() {
        let key = SigningKey::generate(&mut StdRng::seed_from_u64(31));
        let response =
            LivenessResponse::signed(&key, [0x22; NONCE_SIZE], [0x44; 32], 1_700_000_010, 250)
                .unwrap();
        let identity = IdentityKey(key.verifying_key().to_bytes());

        assert!(response.verify(&identity).unwrap());

        let frame = Frame::Respond(response.clone());
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);

        // A flipped nonce byte invalidates the signature.
        let mut tampered = response;
        tampered.nonce_echo[0] ^= 0x01;
        assert!(!tampered.verify(&identity).unwrap());
    }

    #[test]
    fn error_frame_roundtrip() {
        let frame = Frame::Error {
            code: ErrorCode::NonceMismatch,
            detail: "response nonce differs".into(),
        };
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn unknown_kind_rejected() {
        let mut map = CanonicalMap::new();
        map.push(0, Value::Integer(200.into()));
        map.push(1, Value::Null);
        let bytes = map.encode().unwrap();

        assert!(matches!(
            Frame::decode(&bytes),
            Err(WireError::UnknownKind { kind: 200 })
        ));
    }

    #[test]
    fn submit_and_certificate_carry_embedded_bytes() {
        let frame = Frame::SubmitBreadcrumbs(vec![0x80]);
        assert_eq!(Frame::decode(&frame.encode().unwrap()).unwrap(), frame);

        let frame = Frame::Certificate(vec![0xa0]);
        assert_eq!(Frame::decode(&frame.encode().unwrap()).unwrap(), frame);

        let frame = Frame::SubmitEpoch(vec![0xa1, 0x00, 0x00]);
        assert_eq!(Frame::decode(&frame.encode().unwrap()).unwrap(), frame);
    }
}
