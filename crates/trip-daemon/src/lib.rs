//! # trip-daemon
//!
//! Long-lived verifier service for the TRIP protocol: evidence intake,
//! nonce-bound liveness challenges, verdict computation over consistent
//! snapshots, and signed Proof-of-Humanity certificate issuance.
//!
//! Transport is a thin shell: the service consumes and emits canonical
//! CBOR frames over any bidirectional byte stream (the bundled binary
//! listens on a Unix socket).

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod challenge;
pub mod limiter;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod service;

pub use challenge::{ChallengeCoordinator, ChallengeError};
pub use service::{ServiceError, VerifierService};
