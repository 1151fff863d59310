//! Chain validation: the append-only, hash-linked breadcrumb sequence.
//!
//! A [`Chain`] only ever contains breadcrumbs that passed the full
//! validation battery, applied in streaming order per breadcrumb:
//!
//! 1. Ed25519 signature over the re-encoded canonical fields
//! 2. index contiguity
//! 3. timestamp monotonicity and predecessor-hash linkage
//! 4. adjacent-cell deduplication
//! 5. per-cell occupancy cap
//! 6. minimum collection interval (hard floor plus policy warning)
//!
//! Every failure is fatal for the submitted batch; the verifier never
//! repairs a chain. Chains are append-only and are destroyed only when
//! the identity is purged.

use std::collections::HashMap;

use thiserror::Error;
use tracing::warn;

use crate::breadcrumb::{Breadcrumb, CellId, IdentityKey, decode_batch};
use crate::codec::CodecError;
use crate::config::ChainConfig;
use crate::crypto::Hash;

/// Fatal chain validation errors, reported with the first offending
/// breadcrumb.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Input bytes are not a canonical encoding of breadcrumbs.
    #[error("malformed encoding: {0}")]
    Malformed(#[from] CodecError),

    /// Signature did not verify under the identity key.
    #[error("invalid signature at index {index}")]
    InvalidSignature {
        /// Offending breadcrumb index.
        index: u64,
    },

    /// Sequence index is not the next expected value.
    #[error("index gap: got {index}, expected {expected}")]
    IndexGap {
        /// Index carried by the breadcrumb.
        index: u64,
        /// Index the chain required.
        expected: u64,
    },

    /// Timestamp is earlier than its predecessor.
    #[error("timestamp regression at index {index}")]
    TimestampRegress {
        /// Offending breadcrumb index.
        index: u64,
    },

    /// Predecessor hash does not match the previous block hash, or the
    /// genesis breadcrumb carries a non-null predecessor.
    #[error("broken predecessor link at index {index}")]
    BrokenLink {
        /// Offending breadcrumb index.
        index: u64,
    },

    /// Cell equals the immediately preceding cell.
    #[error("duplicate cell at index {index}")]
    DuplicateCell {
        /// Offending breadcrumb index.
        index: u64,
    },

    /// Collection interval is below the hard floor.
    #[error("interval too short at index {index}: {got_secs}s < {min_secs}s")]
    IntervalTooShort {
        /// Offending breadcrumb index.
        index: u64,
        /// Observed interval, seconds.
        got_secs: u64,
        /// Configured hard floor, seconds.
        min_secs: u64,
    },

    /// A single cell exceeded the per-cell occupancy cap.
    #[error("per-cell cap exceeded for cell {cell}")]
    CellCapExceeded {
        /// Offending cell.
        cell: CellId,
    },

    /// Breadcrumb belongs to a different identity than the chain.
    #[error("identity mismatch at index {index}")]
    IdentityMismatch {
        /// Offending breadcrumb index.
        index: u64,
    },

    /// Cell is not a valid grid index at the declared resolution.
    #[error("invalid cell at index {index}")]
    InvalidCell {
        /// Offending breadcrumb index.
        index: u64,
    },
}

/// Non-fatal policy findings accumulated during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyWarning {
    /// Interval below the recommended spacing without the exploration
    /// flag set.
    ShortInterval {
        /// Offending breadcrumb index.
        index: u64,
        /// Observed interval, seconds.
        got_secs: u64,
    },
}

/// A validated, append-only breadcrumb chain for one identity.
#[derive(Debug, Clone)]
pub struct Chain {
    identity: IdentityKey,
    breadcrumbs: Vec<Breadcrumb>,
    block_hashes: Vec<Hash>,
    cell_counts: HashMap<CellId, u32>,
    warnings: Vec<PolicyWarning>,
}

impl Chain {
    /// Creates an empty chain for `identity`.
    #[must_use]
    pub fn new(identity: IdentityKey) -> Self {
        Self {
            identity,
            breadcrumbs: Vec::new(),
            block_hashes: Vec::new(),
            cell_counts: HashMap::new(),
            warnings: Vec::new(),
        }
    }

    /// Validates and appends one breadcrumb.
    ///
    /// On error the chain is unchanged.
    ///
    /// # Errors
    ///
    /// Returns the first failing check as a [`ChainError`].
    pub fn append(&mut self, crumb: Breadcrumb, config: &ChainConfig) -> Result<(), ChainError> {
        let index = crumb.index;

        if crumb.identity != self.identity {
            return Err(ChainError::IdentityMismatch { index });
        }

        // 1. Signature over the canonical re-encoding.
        crumb
            .verify_signature()
            .map_err(|_| ChainError::InvalidSignature { index })?;

        // 2. Index contiguity.
        let expected = self.breadcrumbs.len() as u64;
        if index != expected {
            return Err(ChainError::IndexGap { index, expected });
        }

        // The cell must be a real grid index at the declared resolution,
        // or every downstream centroid lookup is undefined.
        match h3o::CellIndex::try_from(crumb.cell.0) {
            Ok(cell) if u8::from(cell.resolution()) == crumb.resolution => {},
            _ => return Err(ChainError::InvalidCell { index }),
        }

        // 3. Linkage and timestamps.
        if let Some(prev) = self.breadcrumbs.last() {
            if crumb.timestamp < prev.timestamp {
                return Err(ChainError::TimestampRegress { index });
            }
            let head = self.block_hashes.last().copied();
            if crumb.prev_hash != head {
                return Err(ChainError::BrokenLink { index });
            }

            // 4. Adjacent-cell deduplication.
            if crumb.cell == prev.cell {
                return Err(ChainError::DuplicateCell { index });
            }

            // 5. Per-cell occupancy cap.
            let count = self.cell_counts.get(&crumb.cell).copied().unwrap_or(0);
            if count >= config.per_cell_cap {
                return Err(ChainError::CellCapExceeded { cell: crumb.cell });
            }

            // 6. Collection interval: hard floor, then policy spacing.
            let dt = crumb.timestamp - prev.timestamp;
            if dt < config.min_interval_secs {
                return Err(ChainError::IntervalTooShort {
                    index,
                    got_secs: dt,
                    min_secs: config.min_interval_secs,
                });
            }
            if dt < config.recommended_interval_secs && !crumb.meta.exploration() {
                warn!(
                    identity = %self.identity,
                    index,
                    interval_secs = dt,
                    "collection interval below recommended spacing"
                );
                self.warnings.push(PolicyWarning::ShortInterval {
                    index,
                    got_secs: dt,
                });
            }
        } else if crumb.prev_hash.is_some() {
            // Genesis must carry the explicit null sentinel.
            return Err(ChainError::BrokenLink { index });
        }

        let hash = crumb.block_hash()?;
        *self.cell_counts.entry(crumb.cell).or_insert(0) += 1;
        self.block_hashes.push(hash);
        self.breadcrumbs.push(crumb);
        Ok(())
    }

    /// Decodes a canonical breadcrumb batch and appends every record.
    ///
    /// The append is transactional: on any failure the chain is restored
    /// to its state before the call.
    ///
    /// # Errors
    ///
    /// Returns the first failing check as a [`ChainError`].
    pub fn extend_from_bytes(
        &mut self,
        bytes: &[u8],
        config: &ChainConfig,
    ) -> Result<usize, ChainError> {
        let crumbs = decode_batch(bytes)?;
        let checkpoint = self.breadcrumbs.len();
        let warning_checkpoint = self.warnings.len();

        for crumb in crumbs {
            if let Err(err) = self.append(crumb, config) {
                self.truncate_to(checkpoint, warning_checkpoint);
                return Err(err);
            }
        }
        Ok(self.breadcrumbs.len() - checkpoint)
    }

    /// Builds a chain from a canonical batch of breadcrumbs.
    ///
    /// # Errors
    ///
    /// Returns a [`ChainError`] identifying the first failing breadcrumb.
    pub fn from_bytes(bytes: &[u8], config: &ChainConfig) -> Result<Self, ChainError> {
        let crumbs = decode_batch(bytes)?;
        let Some(first) = crumbs.first() else {
            return Err(ChainError::Malformed(CodecError::Malformed(
                "empty breadcrumb batch".into(),
            )));
        };
        let mut chain = Self::new(first.identity);
        for crumb in crumbs {
            chain.append(crumb, config)?;
        }
        Ok(chain)
    }

    fn truncate_to(&mut self, len: usize, warnings_len: usize) {
        self.breadcrumbs.truncate(len);
        self.block_hashes.truncate(len);
        self.warnings.truncate(warnings_len);
        self.cell_counts.clear();
        for crumb in &self.breadcrumbs {
            *self.cell_counts.entry(crumb.cell).or_insert(0) += 1;
        }
    }

    /// The identity anchoring this chain.
    #[must_use]
    pub const fn identity(&self) -> IdentityKey {
        self.identity
    }

    /// Number of breadcrumbs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breadcrumbs.len()
    }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breadcrumbs.is_empty()
    }

    /// The validated breadcrumbs, in index order.
    #[must_use]
    pub fn breadcrumbs(&self) -> &[Breadcrumb] {
        &self.breadcrumbs
    }

    /// Block hashes, parallel to the breadcrumbs.
    #[must_use]
    pub fn block_hashes(&self) -> &[Hash] {
        &self.block_hashes
    }

    /// Index of the most recent breadcrumb.
    #[must_use]
    pub fn head_index(&self) -> Option<u64> {
        self.breadcrumbs.last().map(|b| b.index)
    }

    /// Block hash of the most recent breadcrumb.
    #[must_use]
    pub fn head_hash(&self) -> Option<Hash> {
        self.block_hashes.last().copied()
    }

    /// Number of distinct cells visited.
    #[must_use]
    pub fn unique_cells(&self) -> usize {
        self.cell_counts.len()
    }

    /// Occurrences of `cell` in the chain.
    #[must_use]
    pub fn cell_count(&self, cell: CellId) -> u32 {
        self.cell_counts.get(&cell).copied().unwrap_or(0)
    }

    /// Timestamp of the first breadcrumb.
    #[must_use]
    pub fn first_timestamp(&self) -> Option<u64> {
        self.breadcrumbs.first().map(|b| b.timestamp)
    }

    /// Timestamp of the most recent breadcrumb.
    #[must_use]
    pub fn last_timestamp(&self) -> Option<u64> {
        self.breadcrumbs.last().map(|b| b.timestamp)
    }

    /// Number of complete (sealable) epochs at the given epoch size.
    #[must_use]
    pub fn sealed_epochs(&self, epoch_size: u64) -> u64 {
        if epoch_size == 0 {
            return 0;
        }
        self.breadcrumbs.len() as u64 / epoch_size
    }

    /// Policy warnings accumulated during validation.
    #[must_use]
    pub fn warnings(&self) -> &[PolicyWarning] {
        &self.warnings
    }
}
