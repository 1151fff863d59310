//! Cryptographic primitives for the TRIP verifier.
//!
//! This module provides the hash-chain and signature primitives used
//! across the verifier:
//!
//! - **SHA-256 hashing**: block hashes and epoch Merkle roots
//! - **Ed25519 signatures**: breadcrumb, epoch, liveness-response, and
//!   certificate signatures
//! - **Key storage**: the verifier's long-lived signing key and the
//!   read-only trusted-identity registry
//!
//! # Hash chain
//!
//! Every breadcrumb after the genesis carries the SHA-256 of the previous
//! breadcrumb's complete canonical encoding. Tampering with any historical
//! breadcrumb therefore breaks the chain at the next link.
//!
//! # Signatures
//!
//! Signatures always cover a deterministic canonical CBOR encoding that
//! the verifier reconstructs from parsed fields, never bytes supplied by
//! the peer.

mod hash;
mod keys;
mod sign;

pub use hash::{GENESIS_PREV, HASH_SIZE, Hash, block_hash, merkle_root};
pub use keys::{KeyStoreError, TrustedRegistry, load_or_generate_signing_key, load_signing_key};
pub use sign::{
    PUBLIC_KEY_SIZE, SECRET_KEY_SIZE, SIGNATURE_SIZE, SignError, parse_signature,
    parse_verifying_key, sign_message, verify_signature, verify_signature_lenient,
};
