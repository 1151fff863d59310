//! Challenge coordinator: the active verification state machine.
//!
//! One state machine per outstanding challenge:
//!
//! ```text
//! REQUESTED -> CHALLENGED -> RESPONDED
//!                         -> TIMED_OUT
//!                         -> CANCELLED
//! ```
//!
//! The coordinator owns every challenge slot and serializes transitions
//! behind a single lock that is never held across an await. Deadlines
//! are monotonic ([`tokio::time::Instant`]) so wall-clock jumps cannot
//! extend or shorten a window. Completion flows through a one-shot
//! channel: the task awaiting the attester response wins exactly one of
//! response, deadline, or cancellation, and releases the slot on every
//! path.
//!
//! Spent nonces stay dead for the retention window even after their
//! challenge completes or times out; re-presenting one is a protocol
//! error, and a relying party retries with a fresh nonce.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use trip_core::breadcrumb::IdentityKey;
use trip_core::certificate::NONCE_SIZE;
use trip_core::config::ChallengeConfig;
use trip_core::crypto::Hash;

use crate::protocol::{LivenessChallenge, LivenessResponse};

/// Errors from the challenge protocol.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChallengeError {
    /// The nonce was already used for a challenge.
    #[error("nonce reuse: nonce already spent")]
    NonceReuse,

    /// The identity already has an in-flight challenge.
    #[error("challenge slot busy for identity")]
    SlotBusy,

    /// Requested freshness window exceeds the configured maximum.
    #[error("freshness window {got}s exceeds maximum {max}s")]
    FreshnessTooLong {
        /// Requested window.
        got: u64,
        /// Configured maximum.
        max: u64,
    },

    /// The attester did not respond before the deadline.
    #[error("challenge timed out")]
    Timeout,

    /// The relying party withdrew the challenge.
    #[error("challenge cancelled")]
    Cancelled,

    /// No outstanding challenge for the identity.
    #[error("no outstanding challenge for identity")]
    NoChallenge,

    /// Response nonce did not echo the challenge byte-for-byte.
    #[error("response nonce mismatch")]
    NonceMismatch,

    /// Response signature did not verify under the identity key.
    #[error("response signature invalid")]
    InvalidSignature,

    /// Response head hash does not equal the verifier's stored head.
    #[error("response chain-head mismatch")]
    HeadHashMismatch,

    /// Response index is behind the verifier's last known index.
    #[error("response index {got} behind verifier head {expected}")]
    StaleIndex {
        /// Index claimed by the attester.
        got: u64,
        /// Verifier's last known index.
        expected: u64,
    },

    /// Response timestamp falls outside the challenge window.
    #[error("response timestamp outside challenge window")]
    TimestampOutOfWindow,
}

struct InFlight {
    nonce: [u8; NONCE_SIZE],
    challenge_timestamp: u64,
    deadline: Instant,
    responder: Option<oneshot::Sender<LivenessResponse>>,
    receiver: Option<oneshot::Receiver<LivenessResponse>>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct CoordinatorState {
    /// In-flight challenges per identity, at most the configured cap.
    slots: HashMap<IdentityKey, Vec<InFlight>>,
    spent: HashSet<[u8; NONCE_SIZE]>,
    spent_order: VecDeque<[u8; NONCE_SIZE]>,
}

/// Owner of all outstanding challenges.
pub struct ChallengeCoordinator {
    config: ChallengeConfig,
    verifier_identity: [u8; 32],
    state: Mutex<CoordinatorState>,
}

impl ChallengeCoordinator {
    /// Creates a coordinator announcing `verifier_identity` in its
    /// challenges.
    #[must_use]
    pub fn new(config: ChallengeConfig, verifier_identity: [u8; 32]) -> Self {
        Self {
            config,
            verifier_identity,
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    /// Opens a challenge for `identity` bound to the relying party's
    /// nonce.
    ///
    /// # Errors
    ///
    /// Returns [`ChallengeError::FreshnessTooLong`],
    /// [`ChallengeError::NonceReuse`], or [`ChallengeError::SlotBusy`].
    pub fn begin(
        &self,
        identity: IdentityKey,
        nonce: [u8; NONCE_SIZE],
        freshness_window_secs: u64,
        now_unix: u64,
    ) -> Result<LivenessChallenge, ChallengeError> {
        if freshness_window_secs > self.config.max_freshness_secs {
            return Err(ChallengeError::FreshnessTooLong {
                got: freshness_window_secs,
                max: self.config.max_freshness_secs,
            });
        }

        let mut state = self.state.lock().expect("lock poisoned");

        if state.spent.contains(&nonce) {
            return Err(ChallengeError::NonceReuse);
        }
        if state
            .slots
            .get(&identity)
            .is_some_and(|slots| slots.len() >= self.config.max_inflight_per_identity)
        {
            return Err(ChallengeError::SlotBusy);
        }

        // The nonce is dead from this moment, whatever the outcome.
        state.spent.insert(nonce);
        state.spent_order.push_back(nonce);
        while state.spent_order.len() > self.config.nonce_history {
            if let Some(old) = state.spent_order.pop_front() {
                state.spent.remove(&old);
            }
        }

        let (tx, rx) = oneshot::channel();
        let deadline =
            Instant::now() + Duration::from_secs(self.config.response_deadline_secs);
        state.slots.entry(identity).or_default().push(InFlight {
            nonce,
            challenge_timestamp: now_unix,
            deadline,
            responder: Some(tx),
            receiver: Some(rx),
            cancel: CancellationToken::new(),
        });

        info!(identity = %identity, "challenge opened");
        Ok(LivenessChallenge {
            nonce,
            verifier_identity: self.verifier_identity,
            challenge_timestamp: now_unix,
            response_deadline_secs: self.config.response_deadline_secs,
        })
    }

    /// Validates an attester response against the open challenge and
    /// the verifier's stored chain head, then completes the waiting
    /// task.
    ///
    /// A nonce mismatch does not penalize the identity: the attester
    /// may have been handed a forged challenge, so the condition is
    /// reported to the operator and the challenge stays open until its
    /// deadline.
    ///
    /// # Errors
    ///
    /// Returns the first failing validation as a [`ChallengeError`].
    pub fn submit_response(
        &self,
        identity: IdentityKey,
        response: LivenessResponse,
        stored_head: Hash,
        stored_index: u64,
    ) -> Result<(), ChallengeError> {
        let mut state = self.state.lock().expect("lock poisoned");
        let slots = state
            .slots
            .get_mut(&identity)
            .filter(|slots| !slots.is_empty())
            .ok_or(ChallengeError::NoChallenge)?;

        let Some(slot) = slots.iter_mut().find(|slot| {
            response
                .nonce_echo
                .as_slice()
                .ct_eq(slot.nonce.as_slice())
                .unwrap_u8()
                == 1
        }) else {
            warn!(identity = %identity, "liveness response with mismatched nonce");
            return Err(ChallengeError::NonceMismatch);
        };

        if !response.verify(&identity).unwrap_or(false) {
            return Err(ChallengeError::InvalidSignature);
        }

        if response
            .chain_head_hash
            .as_slice()
            .ct_eq(stored_head.as_slice())
            .unwrap_u8()
            != 1
        {
            return Err(ChallengeError::HeadHashMismatch);
        }

        if response.current_index < stored_index {
            return Err(ChallengeError::StaleIndex {
                got: response.current_index,
                expected: stored_index,
            });
        }

        let window_end = slot
            .challenge_timestamp
            .saturating_add(self.config.response_deadline_secs);
        if response.response_timestamp < slot.challenge_timestamp
            || response.response_timestamp > window_end
        {
            return Err(ChallengeError::TimestampOutOfWindow);
        }

        let responder = slot
            .responder
            .take()
            .ok_or(ChallengeError::NoChallenge)?;
        // A dropped receiver means the waiter already timed out.
        responder
            .send(response)
            .map_err(|_| ChallengeError::Timeout)?;
        Ok(())
    }

    /// Awaits the attester's response, the deadline, or cancellation.
    ///
    /// Exactly one outcome wins; the challenge slot is released on
    /// every path.
    ///
    /// # Errors
    ///
    /// Returns [`ChallengeError::Timeout`], [`ChallengeError::Cancelled`],
    /// or [`ChallengeError::NoChallenge`].
    pub async fn await_response(
        &self,
        identity: IdentityKey,
        nonce: [u8; NONCE_SIZE],
    ) -> Result<LivenessResponse, ChallengeError> {
        let (receiver, deadline, cancel) = {
            let mut state = self.state.lock().expect("lock poisoned");
            let slot = state
                .slots
                .get_mut(&identity)
                .and_then(|slots| slots.iter_mut().find(|slot| slot.nonce == nonce))
                .ok_or(ChallengeError::NoChallenge)?;
            let receiver = slot.receiver.take().ok_or(ChallengeError::NoChallenge)?;
            (receiver, slot.deadline, slot.cancel.clone())
        };

        let outcome = tokio::select! {
            () = sleep_until(deadline) => Err(ChallengeError::Timeout),
            () = cancel.cancelled() => Err(ChallengeError::Cancelled),
            response = receiver => response.map_err(|_| ChallengeError::Cancelled),
        };

        self.release(identity, nonce);
        match &outcome {
            Ok(_) => info!(identity = %identity, "challenge responded"),
            Err(err) => warn!(identity = %identity, %err, "challenge failed"),
        }
        outcome
    }

    /// Withdraws every outstanding challenge for `identity`
    /// (relying-party cancellation).
    ///
    /// Returns whether any challenge existed. A waiting task observes
    /// the cancellation and releases its slot; challenges nobody awaits
    /// are released here directly.
    pub fn cancel(&self, identity: IdentityKey) -> bool {
        let mut state = self.state.lock().expect("lock poisoned");
        let Some(slots) = state.slots.get_mut(&identity) else {
            return false;
        };
        let existed = !slots.is_empty();

        // Challenges with a live waiter are cancelled through the
        // token; unawaited ones are dropped outright.
        slots.retain(|slot| {
            if slot.receiver.is_none() {
                slot.cancel.cancel();
                true
            } else {
                false
            }
        });
        if slots.is_empty() {
            state.slots.remove(&identity);
        }
        existed
    }

    /// Identities with at least one outstanding challenge.
    #[must_use]
    pub fn identities_in_flight(&self) -> Vec<IdentityKey> {
        self.state
            .lock()
            .expect("lock poisoned")
            .slots
            .iter()
            .filter(|(_, slots)| !slots.is_empty())
            .map(|(identity, _)| *identity)
            .collect()
    }

    /// Outstanding challenge count across all identities.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state
            .lock()
            .expect("lock poisoned")
            .slots
            .values()
            .map(Vec::len)
            .sum()
    }

    fn release(&self, identity: IdentityKey, nonce: [u8; NONCE_SIZE]) {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(slots) = state.slots.get_mut(&identity) {
            slots.retain(|slot| slot.nonce != nonce);
            if slots.is_empty() {
                state.slots.remove(&identity);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::Arc;

    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn coordinator() -> Arc<ChallengeCoordinator> {
        Arc::new(ChallengeCoordinator::new(
            ChallengeConfig::default(),
            [0xee; 32],
        ))
    }

    fn attester() -> (SigningKey, IdentityKey) {
        let key = SigningKey::generate(&mut StdRng::seed_from_u64(41));
        let identity = IdentityKey(key.verifying_key().to_bytes());
        (key, identity)
    }

    #[tokio::test]
    async fn responded_path_issues_within_deadline() {
        let coordinator = coordinator();
        let (key, identity) = attester();
        let head = [0x10; 32];

        let challenge = coordinator.begin(identity, [1; NONCE_SIZE], 600, NOW).unwrap();
        assert_eq!(challenge.response_deadline_secs, 30);

        let response =
            LivenessResponse::signed(&key, challenge.nonce, head, NOW + 5, 128).unwrap();
        coordinator
            .submit_response(identity, response.clone(), head, 128)
            .unwrap();

        let received = coordinator.await_response(identity, [1; NONCE_SIZE]).await.unwrap();
        assert_eq!(received, response);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_elapses_to_timeout_and_releases_slot() {
        let coordinator = coordinator();
        let (key, identity) = attester();

        coordinator.begin(identity, [2; NONCE_SIZE], 600, NOW).unwrap();
        let outcome = coordinator.await_response(identity, [2; NONCE_SIZE]).await;
        assert_eq!(outcome, Err(ChallengeError::Timeout));
        assert_eq!(coordinator.in_flight(), 0);

        // The old nonce is dead; a fresh one opens a new challenge.
        assert_eq!(
            coordinator.begin(identity, [2; NONCE_SIZE], 600, NOW),
            Err(ChallengeError::NonceReuse)
        );
        coordinator.begin(identity, [3; NONCE_SIZE], 600, NOW).unwrap();

        // A late response finds the new challenge, not the dead one.
        let late = LivenessResponse::signed(&key, [2; NONCE_SIZE], [0; 32], NOW, 0).unwrap();
        assert_eq!(
            coordinator.submit_response(identity, late, [0; 32], 0),
            Err(ChallengeError::NonceMismatch)
        );
    }

    #[tokio::test]
    async fn cancellation_reaches_the_waiter() {
        let coordinator = coordinator();
        let (_, identity) = attester();

        coordinator.begin(identity, [4; NONCE_SIZE], 600, NOW).unwrap();

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.await_response(identity, [4; NONCE_SIZE]).await })
        };
        tokio::task::yield_now().await;

        assert!(coordinator.cancel(identity));
        assert_eq!(waiter.await.unwrap(), Err(ChallengeError::Cancelled));
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn one_challenge_per_identity() {
        let coordinator = coordinator();
        let (_, identity) = attester();

        coordinator.begin(identity, [5; NONCE_SIZE], 600, NOW).unwrap();
        assert_eq!(
            coordinator.begin(identity, [6; NONCE_SIZE], 600, NOW),
            Err(ChallengeError::SlotBusy)
        );
    }

    #[tokio::test]
    async fn freshness_window_bounded() {
        let coordinator = coordinator();
        let (_, identity) = attester();

        assert_eq!(
            coordinator.begin(identity, [7; NONCE_SIZE], 3601, NOW),
            Err(ChallengeError::FreshnessTooLong {
                got: 3601,
                max: 3600
            })
        );
    }

    #[tokio::test]
    async fn response_validation_battery() {
        let coordinator = coordinator();
        let (key, identity) = attester();
        let head = [0x10; 32];

        let challenge = coordinator.begin(identity, [8; NONCE_SIZE], 600, NOW).unwrap();

        // Flipped nonce.
        let mut nonce = challenge.nonce;
        nonce[0] ^= 0xff;
        let bad = LivenessResponse::signed(&key, nonce, head, NOW + 1, 10).unwrap();
        assert_eq!(
            coordinator.submit_response(identity, bad, head, 10),
            Err(ChallengeError::NonceMismatch)
        );

        // Foreign signature.
        let outsider = SigningKey::generate(&mut StdRng::seed_from_u64(42));
        let bad =
            LivenessResponse::signed(&outsider, challenge.nonce, head, NOW + 1, 10).unwrap();
        assert_eq!(
            coordinator.submit_response(identity, bad, head, 10),
            Err(ChallengeError::InvalidSignature)
        );

        // Wrong head hash.
        let bad =
            LivenessResponse::signed(&key, challenge.nonce, [0x99; 32], NOW + 1, 10).unwrap();
        assert_eq!(
            coordinator.submit_response(identity, bad, head, 10),
            Err(ChallengeError::HeadHashMismatch)
        );

        // Stale index.
        let bad = LivenessResponse::signed(&key, challenge.nonce, head, NOW + 1, 9).unwrap();
        assert_eq!(
            coordinator.submit_response(identity, bad, head, 10),
            Err(ChallengeError::StaleIndex {
                got: 9,
                expected: 10
            })
        );

        // Timestamp beyond the deadline window.
        let bad = LivenessResponse::signed(&key, challenge.nonce, head, NOW + 31, 10).unwrap();
        assert_eq!(
            coordinator.submit_response(identity, bad, head, 10),
            Err(ChallengeError::TimestampOutOfWindow)
        );

        // The challenge is still open: a correct response completes it.
        let good = LivenessResponse::signed(&key, challenge.nonce, head, NOW + 2, 10).unwrap();
        coordinator.submit_response(identity, good, head, 10).unwrap();
        coordinator.await_response(identity, [8; NONCE_SIZE]).await.unwrap();
    }
}
