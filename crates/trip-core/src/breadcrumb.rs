//! Breadcrumb: the atomic unit of evidence.
//!
//! A breadcrumb is a signed attestation of spatially-quantized presence.
//! On the wire it is a canonical CBOR map with integer keys 0..8:
//!
//! | key | field            | type                        |
//! |-----|------------------|-----------------------------|
//! | 0   | index            | uint                        |
//! | 1   | identity         | bstr .size 32               |
//! | 2   | timestamp        | uint (Unix seconds)         |
//! | 3   | cell             | uint (H3 index)             |
//! | 4   | resolution       | uint (7..10)                |
//! | 5   | context digest   | bstr .size 32               |
//! | 6   | predecessor hash | bstr .size 32 / null        |
//! | 7   | meta flags       | map (text keys)             |
//! | 8   | signature        | bstr .size 64               |
//!
//! The Ed25519 signature in field 8 covers the canonical encoding of
//! fields 0..7. The block hash covers the canonical encoding of all nine
//! fields.

use std::collections::BTreeMap;
use std::fmt;

use ciborium::value::Value;
use ed25519_dalek::SigningKey;

use crate::codec::{CanonicalMap, CodecError, MapReader, decode_canonical, encode_value};
use crate::crypto::{
    Hash, PUBLIC_KEY_SIZE, SIGNATURE_SIZE, SignError, block_hash, sign_message, verify_signature,
};

/// Lowest hexagonal-grid resolution accepted on the wire.
pub const MIN_RESOLUTION: u8 = 7;

/// Highest hexagonal-grid resolution accepted on the wire.
pub const MAX_RESOLUTION: u8 = 10;

/// Longest meta-flag key, chosen so the CBOR text header stays a single
/// byte and `(length, bytes)` ordering equals encoded-bytes ordering.
pub const MAX_META_KEY_LEN: usize = 23;

/// Meta-flag key that marks a deliberate exploration burst, relaxing the
/// recommended collection interval down to the hard floor.
pub const META_EXPLORE: &str = "explore";

mod wire {
    pub const INDEX: u64 = 0;
    pub const IDENTITY: u64 = 1;
    pub const TIMESTAMP: u64 = 2;
    pub const CELL: u64 = 3;
    pub const RESOLUTION: u64 = 4;
    pub const CONTEXT: u64 = 5;
    pub const PREV_HASH: u64 = 6;
    pub const META: u64 = 7;
    pub const SIGNATURE: u64 = 8;
}

/// The 32-byte Ed25519 public key anchoring a chain.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey(pub [u8; PUBLIC_KEY_SIZE]);

impl IdentityKey {
    /// Raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Full lowercase hex form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Abbreviated for logs; use `to_hex` for the full key.
        write!(f, "{}", &self.to_hex()[..8])
    }
}

/// A hexagonal-grid cell identifier (H3 index).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(pub u64);

impl fmt::Debug for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellId({:x})", self.0)
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A single meta-flag value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer flag (battery level, accuracy class, ...).
    Int(i64),
    /// Short text flag (sampling mode, network state, ...).
    Text(String),
}

impl MetaValue {
    fn to_cbor(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::Integer((*i).into()),
            Self::Text(t) => Value::Text(t.clone()),
        }
    }
}

/// Open map of meta flags, opaque to the verifier except for the
/// exploration marker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaFlags {
    entries: BTreeMap<String, MetaValue>,
}

impl MetaFlags {
    /// Creates an empty flag map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a flag.
    ///
    /// # Panics
    ///
    /// Panics if `key` exceeds [`MAX_META_KEY_LEN`] bytes; locally
    /// produced keys are short by construction.
    pub fn insert(&mut self, key: &str, value: MetaValue) {
        assert!(
            key.len() <= MAX_META_KEY_LEN,
            "meta key too long: {}",
            key.len()
        );
        self.entries.insert(key.to_string(), value);
    }

    /// Looks up a flag.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.entries.get(key)
    }

    /// Whether the exploration marker is set.
    #[must_use]
    pub fn exploration(&self) -> bool {
        matches!(self.get(META_EXPLORE), Some(MetaValue::Bool(true)))
    }

    /// Number of flags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn to_cbor(&self) -> Value {
        // Canonical text-key order: length first, then bytes, which for
        // keys under 24 bytes equals encoded-byte order.
        let mut keys: Vec<&String> = self.entries.keys().collect();
        keys.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
        Value::Map(
            keys.into_iter()
                .map(|k| (Value::Text(k.clone()), self.entries[k].to_cbor()))
                .collect(),
        )
    }

    fn from_cbor(entries: Vec<(Value, Value)>) -> Result<Self, CodecError> {
        let mut flags = BTreeMap::new();
        let mut last: Option<(usize, String)> = None;
        for (key, value) in entries {
            let Value::Text(key) = key else {
                return Err(CodecError::WrongType { key: wire::META });
            };
            if key.len() > MAX_META_KEY_LEN {
                return Err(CodecError::Malformed(format!(
                    "meta key exceeds {MAX_META_KEY_LEN} bytes"
                )));
            }
            let ordering = (key.len(), key.clone());
            if last.as_ref().is_some_and(|prev| *prev >= ordering) {
                return Err(CodecError::NonCanonical);
            }
            last = Some(ordering);

            let value = match value {
                Value::Bool(b) => MetaValue::Bool(b),
                Value::Integer(i) => MetaValue::Int(
                    i128::from(i)
                        .try_into()
                        .map_err(|_| CodecError::WrongType { key: wire::META })?,
                ),
                Value::Text(t) => MetaValue::Text(t),
                _ => return Err(CodecError::WrongType { key: wire::META }),
            };
            flags.insert(key, value);
        }
        Ok(Self { entries: flags })
    }
}

/// A signed record of spatiotemporal presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breadcrumb {
    /// Sequence index within the chain, starting at 0.
    pub index: u64,
    /// Owning identity; all signatures verify against this key.
    pub identity: IdentityKey,
    /// Collection time, Unix seconds.
    pub timestamp: u64,
    /// Quantized location cell.
    pub cell: CellId,
    /// Grid resolution of `cell`, 7..=10.
    pub resolution: u8,
    /// Digest of the attester's sensor context, opaque here but bound by
    /// the signature.
    pub context_digest: Hash,
    /// Block hash of the predecessor, or `None` for the genesis record.
    pub prev_hash: Option<Hash>,
    /// Open meta flags.
    pub meta: MetaFlags,
    /// Ed25519 signature over the canonical encoding of fields 0..7.
    pub signature: [u8; SIGNATURE_SIZE],
}

impl Breadcrumb {
    fn signing_value(&self) -> Value {
        let mut map = CanonicalMap::new();
        map.push(wire::INDEX, Value::Integer(self.index.into()));
        map.push(wire::IDENTITY, Value::Bytes(self.identity.0.to_vec()));
        map.push(wire::TIMESTAMP, Value::Integer(self.timestamp.into()));
        map.push(wire::CELL, Value::Integer(self.cell.0.into()));
        map.push(wire::RESOLUTION, Value::Integer(self.resolution.into()));
        map.push(wire::CONTEXT, Value::Bytes(self.context_digest.to_vec()));
        map.push(
            wire::PREV_HASH,
            self.prev_hash
                .map_or(Value::Null, |h| Value::Bytes(h.to_vec())),
        );
        map.push(wire::META, self.meta.to_cbor());
        map.into_value()
    }

    /// Canonical encoding of fields 0..7, the byte string the attester
    /// signed.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if encoding fails.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CodecError> {
        encode_value(&self.signing_value())
    }

    fn full_value(&self) -> Value {
        let Value::Map(mut entries) = self.signing_value() else {
            unreachable!("signing_value always builds a map")
        };
        entries.push((
            Value::Integer(wire::SIGNATURE.into()),
            Value::Bytes(self.signature.to_vec()),
        ));
        Value::Map(entries)
    }

    /// Canonical encoding of all nine fields.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode_value(&self.full_value())
    }

    /// SHA-256 over the complete canonical encoding.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if encoding fails.
    pub fn block_hash(&self) -> Result<Hash, CodecError> {
        Ok(block_hash(&self.encode()?))
    }

    /// Verifies the breadcrumb signature against its own identity key.
    ///
    /// # Errors
    ///
    /// Returns [`SignError`] if the signature is invalid, or
    /// [`SignError::MalformedKey`] for an identity key that is not a
    /// valid curve point.
    pub fn verify_signature(&self) -> Result<(), SignError> {
        let message = self
            .signing_bytes()
            .map_err(|_| SignError::VerificationFailed)?;
        verify_signature(&self.identity.0, &message, &self.signature)
    }

    /// Parses a breadcrumb from a decoded canonical map value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] for any structural violation.
    pub fn from_value(value: Value) -> Result<Self, CodecError> {
        let mut reader = MapReader::new(value)?;

        let index = reader.uint(wire::INDEX)?;
        let identity = IdentityKey(reader.bytes_exact(wire::IDENTITY)?);
        let timestamp = reader.uint(wire::TIMESTAMP)?;
        let cell = CellId(reader.uint(wire::CELL)?);
        let resolution = u8::try_from(reader.uint(wire::RESOLUTION)?)
            .map_err(|_| CodecError::WrongType { key: wire::RESOLUTION })?;
        if !(MIN_RESOLUTION..=MAX_RESOLUTION).contains(&resolution) {
            return Err(CodecError::Malformed(format!(
                "resolution {resolution} outside {MIN_RESOLUTION}..={MAX_RESOLUTION}"
            )));
        }
        let context_digest = reader.bytes_exact(wire::CONTEXT)?;
        let prev_hash = reader.bytes_or_null(wire::PREV_HASH)?;
        let meta = MetaFlags::from_cbor(reader.map(wire::META)?)?;
        let signature = reader.bytes_exact(wire::SIGNATURE)?;
        reader.finish()?;

        Ok(Self {
            index,
            identity,
            timestamp,
            cell,
            resolution,
            context_digest,
            prev_hash,
            meta,
            signature,
        })
    }

    /// Decodes a single breadcrumb from canonical bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] for malformed or non-canonical input.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Self::from_value(decode_canonical(bytes)?)
    }

    /// Builds and signs a breadcrumb with `key`.
    ///
    /// Used by test fixtures and local tooling; the verifier itself never
    /// produces breadcrumbs.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the signing bytes cannot be encoded.
    #[allow(clippy::too_many_arguments)]
    pub fn signed(
        key: &SigningKey,
        index: u64,
        timestamp: u64,
        cell: CellId,
        resolution: u8,
        context_digest: Hash,
        prev_hash: Option<Hash>,
        meta: MetaFlags,
    ) -> Result<Self, CodecError> {
        let mut crumb = Self {
            index,
            identity: IdentityKey(key.verifying_key().to_bytes()),
            timestamp,
            cell,
            resolution,
            context_digest,
            prev_hash,
            meta,
            signature: [0u8; SIGNATURE_SIZE],
        };
        crumb.signature = sign_message(key, &crumb.signing_bytes()?);
        Ok(crumb)
    }
}

/// Decodes a canonical CBOR array of breadcrumbs.
///
/// # Errors
///
/// Returns [`CodecError`] for malformed, non-canonical, or non-array
/// input.
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<Breadcrumb>, CodecError> {
    let Value::Array(items) = decode_canonical(bytes)? else {
        return Err(CodecError::Malformed("expected breadcrumb array".into()));
    };
    items.into_iter().map(Breadcrumb::from_value).collect()
}

/// Encodes breadcrumbs as a canonical CBOR array.
///
/// # Errors
///
/// Returns [`CodecError`] if encoding fails.
pub fn encode_batch(crumbs: &[Breadcrumb]) -> Result<Vec<u8>, CodecError> {
    let items = crumbs
        .iter()
        .map(Breadcrumb::full_value)
        .collect::<Vec<_>>();
    encode_value(&Value::Array(items))
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;

    fn fixture(key: &SigningKey, index: u64, prev: Option<Hash>) -> Breadcrumb {
        Breadcrumb::signed(
            key,
            index,
            1_700_000_000 + index * 900,
            CellId(0x8a2a_1072_b59f_fff + index),
            10,
            [0x11; 32],
            prev,
            MetaFlags::new(),
        )
        .unwrap()
    }

    #[test]
    fn roundtrip_preserves_fields_and_bytes() {
        let key = SigningKey::generate(&mut OsRng);
        let crumb = fixture(&key, 0, None);

        let bytes = crumb.encode().unwrap();
        let decoded = Breadcrumb::decode(&bytes).unwrap();

        assert_eq!(decoded, crumb);
        assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn signature_verifies_and_mutations_fail() {
        let key = SigningKey::generate(&mut OsRng);
        let crumb = fixture(&key, 0, None);
        crumb.verify_signature().unwrap();

        let mut tampered = crumb.clone();
        tampered.timestamp += 1;
        assert!(tampered.verify_signature().is_err());

        let mut tampered = crumb.clone();
        tampered.cell = CellId(tampered.cell.0 ^ 1);
        assert!(tampered.verify_signature().is_err());

        let mut tampered = crumb;
        tampered.context_digest[0] ^= 0x80;
        assert!(tampered.verify_signature().is_err());
    }

    #[test]
    fn resolution_out_of_range_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let mut crumb = fixture(&key, 0, None);
        crumb.resolution = 6;
        let bytes = crumb.encode().unwrap();

        assert!(matches!(
            Breadcrumb::decode(&bytes),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn genesis_prev_hash_is_explicit_null() {
        let key = SigningKey::generate(&mut OsRng);
        let crumb = fixture(&key, 0, None);
        let bytes = crumb.encode().unwrap();

        let decoded = Breadcrumb::decode(&bytes).unwrap();
        assert_eq!(decoded.prev_hash, None);
    }

    #[test]
    fn meta_flags_canonical_order_enforced() {
        // "zz" sorts before "aaa" in canonical (length-first) order;
        // reversed order must be rejected.
        let value = Value::Map(vec![
            (Value::Text("aaa".into()), Value::Bool(true)),
            (Value::Text("zz".into()), Value::Bool(true)),
        ]);
        assert!(matches!(
            MetaFlags::from_cbor(match value {
                Value::Map(m) => m,
                _ => unreachable!(),
            }),
            Err(CodecError::NonCanonical)
        ));
    }

    #[test]
    fn exploration_flag_detected() {
        let mut meta = MetaFlags::new();
        meta.insert(META_EXPLORE, MetaValue::Bool(true));
        assert!(meta.exploration());

        let mut meta = MetaFlags::new();
        meta.insert(META_EXPLORE, MetaValue::Bool(false));
        assert!(!meta.exploration());
    }

    #[test]
    fn batch_roundtrip() {
        let key = SigningKey::generate(&mut OsRng);
        let a = fixture(&key, 0, None);
        let b = fixture(&key, 1, Some(a.block_hash().unwrap()));

        let bytes = encode_batch(&[a.clone(), b.clone()]).unwrap();
        let decoded = decode_batch(&bytes).unwrap();
        assert_eq!(decoded, vec![a, b]);
    }
}
