//! Sealed epochs: immutable bundles of consecutive breadcrumbs.
//!
//! An epoch groups `epoch_size` consecutive breadcrumbs under a Merkle
//! root over their block hashes and carries the identity's signature over
//! the canonical encoding. The wire form is a canonical CBOR map with
//! integer keys 0..8: epoch number, identity, first/last index,
//! first/last timestamp, Merkle root, unique-cell count, signature.

use ciborium::value::Value;
use ed25519_dalek::SigningKey;
use thiserror::Error;

use crate::breadcrumb::{CellId, IdentityKey};
use crate::chain::Chain;
use crate::codec::{CanonicalMap, CodecError, MapReader, decode_canonical, encode_value};
use crate::crypto::{Hash, SIGNATURE_SIZE, merkle_root, sign_message, verify_signature};

mod wire {
    pub const NUMBER: u64 = 0;
    pub const IDENTITY: u64 = 1;
    pub const FIRST_INDEX: u64 = 2;
    pub const LAST_INDEX: u64 = 3;
    pub const FIRST_TIMESTAMP: u64 = 4;
    pub const LAST_TIMESTAMP: u64 = 5;
    pub const MERKLE_ROOT: u64 = 6;
    pub const UNIQUE_CELLS: u64 = 7;
    pub const SIGNATURE: u64 = 8;
}

/// Errors from epoch decoding and verification.
#[derive(Debug, Error)]
pub enum EpochError {
    /// Input bytes are not a canonical epoch encoding.
    #[error("malformed epoch encoding: {0}")]
    Malformed(#[from] CodecError),

    /// Signature did not verify under the identity key.
    #[error("invalid epoch signature for epoch {number}")]
    InvalidSignature {
        /// Offending epoch number.
        number: u64,
    },

    /// Epoch does not cover the span the chain requires.
    #[error("epoch {number} span mismatch: expected {expected_first}..={expected_last}")]
    SpanMismatch {
        /// Offending epoch number.
        number: u64,
        /// Required first index.
        expected_first: u64,
        /// Required last index.
        expected_last: u64,
    },

    /// A declared field disagrees with the validated chain.
    #[error("epoch {number} field mismatch: {field}")]
    FieldMismatch {
        /// Offending epoch number.
        number: u64,
        /// Name of the disagreeing field.
        field: &'static str,
    },

    /// The chain is too short to contain this epoch.
    #[error("chain too short for epoch {number}")]
    ChainTooShort {
        /// Offending epoch number.
        number: u64,
    },
}

/// A sealed, attester-signed epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Epoch {
    /// Epoch sequence number, starting at 0.
    pub number: u64,
    /// Owning identity.
    pub identity: IdentityKey,
    /// Index of the first member breadcrumb.
    pub first_index: u64,
    /// Index of the last member breadcrumb.
    pub last_index: u64,
    /// Timestamp of the first member.
    pub first_timestamp: u64,
    /// Timestamp of the last member.
    pub last_timestamp: u64,
    /// Merkle root over member block hashes in index order.
    pub merkle_root: Hash,
    /// Distinct cells among the members.
    pub unique_cells: u64,
    /// Ed25519 signature over fields 0..7.
    pub signature: [u8; SIGNATURE_SIZE],
}

impl Epoch {
    fn signing_value(&self) -> Value {
        let mut map = CanonicalMap::new();
        map.push(wire::NUMBER, Value::Integer(self.number.into()));
        map.push(wire::IDENTITY, Value::Bytes(self.identity.0.to_vec()));
        map.push(wire::FIRST_INDEX, Value::Integer(self.first_index.into()));
        map.push(wire::LAST_INDEX, Value::Integer(self.last_index.into()));
        map.push(
            wire::FIRST_TIMESTAMP,
            Value::Integer(self.first_timestamp.into()),
        );
        map.push(
            wire::LAST_TIMESTAMP,
            Value::Integer(self.last_timestamp.into()),
        );
        map.push(wire::MERKLE_ROOT, Value::Bytes(self.merkle_root.to_vec()));
        map.push(wire::UNIQUE_CELLS, Value::Integer(self.unique_cells.into()));
        map.into_value()
    }

    /// Canonical encoding of fields 0..7, the signed byte string.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if encoding fails.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CodecError> {
        encode_value(&self.signing_value())
    }

    /// Canonical encoding of the complete epoch.
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

    /// Decodes an epoch from canonical bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] for malformed or non-canonical input.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = MapReader::new(decode_canonical(bytes)?)?;
        let epoch = Self {
            number: reader.uint(wire::NUMBER)?,
            identity: IdentityKey(reader.bytes_exact(wire::IDENTITY)?),
            first_index: reader.uint(wire::FIRST_INDEX)?,
            last_index: reader.uint(wire::LAST_INDEX)?,
            first_timestamp: reader.uint(wire::FIRST_TIMESTAMP)?,
            last_timestamp: reader.uint(wire::LAST_TIMESTAMP)?,
            merkle_root: reader.bytes_exact(wire::MERKLE_ROOT)?,
            unique_cells: reader.uint(wire::UNIQUE_CELLS)?,
            signature: reader.bytes_exact(wire::SIGNATURE)?,
        };
        reader.finish()?;
        Ok(epoch)
    }

    /// Verifies the epoch signature under its identity key.
    ///
    /// # Errors
    ///
    /// Returns [`EpochError::InvalidSignature`] on failure.
    pub fn verify_signature(&self) -> Result<(), EpochError> {
        let message = self.signing_bytes()?;
        verify_signature(&self.identity.0, &message, &self.signature).map_err(|_| {
            EpochError::InvalidSignature {
                number: self.number,
            }
        })
    }

    /// Verifies a sealed epoch against the verifier's own validated
    /// chain: span, timestamps, Merkle root, unique-cell count, and
    /// signature must all agree.
    ///
    /// # Errors
    ///
    /// Returns an [`EpochError`] naming the first disagreement.
    pub fn verify_against_chain(&self, chain: &Chain, epoch_size: u64) -> Result<(), EpochError> {
        if self.identity != chain.identity() {
            return Err(EpochError::FieldMismatch {
                number: self.number,
                field: "identity",
            });
        }

        let expected_first = self.number * epoch_size;
        let expected_last = expected_first + epoch_size - 1;
        if self.first_index != expected_first || self.last_index != expected_last {
            return Err(EpochError::SpanMismatch {
                number: self.number,
                expected_first,
                expected_last,
            });
        }

        let span = usize::try_from(expected_first).ok().zip(
            usize::try_from(expected_last)
                .ok()
                .map(|last| last + 1),
        );
        let Some((start, end)) = span.filter(|&(_, end)| end <= chain.len()) else {
            return Err(EpochError::ChainTooShort {
                number: self.number,
            });
        };

        let members = &chain.breadcrumbs()[start..end];
        if self.first_timestamp != members[0].timestamp {
            return Err(EpochError::FieldMismatch {
                number: self.number,
                field: "first_timestamp",
            });
        }
        if self.last_timestamp != members[members.len() - 1].timestamp {
            return Err(EpochError::FieldMismatch {
                number: self.number,
                field: "last_timestamp",
            });
        }

        let root = merkle_root(&chain.block_hashes()[start..end]);
        if self.merkle_root != root {
            return Err(EpochError::FieldMismatch {
                number: self.number,
                field: "merkle_root",
            });
        }

        let mut cells: Vec<CellId> = members.iter().map(|b| b.cell).collect();
        cells.sort_unstable();
        cells.dedup();
        if self.unique_cells != cells.len() as u64 {
            return Err(EpochError::FieldMismatch {
                number: self.number,
                field: "unique_cells",
            });
        }

        self.verify_signature()
    }

    /// Seals and signs an epoch over a chain span.
    ///
    /// Used by fixtures and local tooling; in production the attester
    /// seals its own epochs.
    ///
    /// # Errors
    ///
    /// Returns [`EpochError::ChainTooShort`] if the chain does not cover
    /// the epoch, or a [`CodecError`] if encoding fails.
    pub fn seal_signed(
        chain: &Chain,
        number: u64,
        epoch_size: u64,
        key: &SigningKey,
    ) -> Result<Self, EpochError> {
        let first = number * epoch_size;
        let last = first + epoch_size - 1;
        let (Ok(start), Ok(end)) = (usize::try_from(first), usize::try_from(last + 1)) else {
            return Err(EpochError::ChainTooShort { number });
        };
        if end > chain.len() {
            return Err(EpochError::ChainTooShort { number });
        }

        let members = &chain.breadcrumbs()[start..end];
        let mut cells: Vec<CellId> = members.iter().map(|b| b.cell).collect();
        cells.sort_unstable();
        cells.dedup();

        let mut epoch = Self {
            number,
            identity: chain.identity(),
            first_index: first,
            last_index: last,
            first_timestamp: members[0].timestamp,
            last_timestamp: members[members.len() - 1].timestamp,
            merkle_root: merkle_root(&chain.block_hashes()[start..end]),
            unique_cells: cells.len() as u64,
            signature: [0u8; SIGNATURE_SIZE],
        };
        epoch.signature = sign_message(key, &epoch.signing_bytes()?);
        Ok(epoch)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::breadcrumb::{Breadcrumb, MetaFlags, encode_batch};
    use crate::config::ChainConfig;

    fn chain_with(key: &SigningKey, n: usize) -> Chain {
        let origin = h3o::LatLng::new(48.8566, 2.3522)
            .unwrap()
            .to_cell(h3o::Resolution::Ten);
        let cells: Vec<CellId> = origin
            .grid_disk::<Vec<_>>(4)
            .into_iter()
            .map(|c| CellId(c.into()))
            .collect();

        let mut crumbs: Vec<Breadcrumb> = Vec::new();
        for i in 0..n {
            let prev_hash = crumbs.last().map(|p: &Breadcrumb| p.block_hash().unwrap());
            crumbs.push(
                Breadcrumb::signed(
                    key,
                    i as u64,
                    1_700_000_000 + i as u64 * 900,
                    cells[i % cells.len()],
                    10,
                    [0x33; 32],
                    prev_hash,
                    MetaFlags::new(),
                )
                .unwrap(),
            );
        }
        Chain::from_bytes(&encode_batch(&crumbs).unwrap(), &ChainConfig::default()).unwrap()
    }

    #[test]
    fn seal_verify_roundtrip() {
        let key = SigningKey::generate(&mut StdRng::seed_from_u64(7));
        let chain = chain_with(&key, 10);

        let epoch = Epoch::seal_signed(&chain, 0, 10, &key).unwrap();
        epoch.verify_against_chain(&chain, 10).unwrap();

        let bytes = epoch.encode().unwrap();
        let decoded = Epoch::decode(&bytes).unwrap();
        assert_eq!(decoded, epoch);
        assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn tampered_root_detected() {
        let key = SigningKey::generate(&mut StdRng::seed_from_u64(7));
        let chain = chain_with(&key, 10);

        let mut epoch = Epoch::seal_signed(&chain, 0, 10, &key).unwrap();
        epoch.merkle_root[0] ^= 0x01;

        assert!(matches!(
            epoch.verify_against_chain(&chain, 10),
            Err(EpochError::FieldMismatch {
                field: "merkle_root",
                ..
            })
        ));
    }

    #[test]
    fn foreign_signature_rejected() {
        let key = SigningKey::generate(&mut StdRng::seed_from_u64(7));
        let outsider = SigningKey::generate(&mut StdRng::seed_from_u64(8));
        let chain = chain_with(&key, 10);

        let epoch = Epoch::seal_signed(&chain, 0, 10, &outsider).unwrap();
        assert!(matches!(
            epoch.verify_against_chain(&chain, 10),
            Err(EpochError::InvalidSignature { number: 0 })
        ));
    }

    #[test]
    fn epoch_beyond_chain_rejected() {
        let key = SigningKey::generate(&mut StdRng::seed_from_u64(7));
        let chain = chain_with(&key, 10);

        assert!(matches!(
            Epoch::seal_signed(&chain, 1, 10, &key),
            Err(EpochError::ChainTooShort { number: 1 })
        ));
    }
}
