//! The verification service: evidence intake, challenge orchestration,
//! and certificate issuance behind bounded resources.
//!
//! CPU-bound verdict computation runs on the blocking pool behind a
//! semaphore sized by configuration; when the pool is saturated,
//! requests fail immediately with resource exhaustion rather than
//! queueing. Intake and verification are rate-limited per identity and
//! per relying-party peer.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::SigningKey;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use trip_core::breadcrumb::{IdentityKey, decode_batch};
use trip_core::certificate::{CertificateError, NONCE_SIZE, PohCertificate};
use trip_core::chain::ChainError;
use trip_core::codec::CodecError;
use trip_core::config::VerifierConfig;
use trip_core::criticality::CriticalityEngine;
use trip_core::crypto::TrustedRegistry;
use trip_core::epoch::{Epoch, EpochError};
use trip_core::store::ChainStore;

use crate::challenge::{ChallengeCoordinator, ChallengeError};
use crate::limiter::KeyedLimiter;
use crate::protocol::{ErrorCode, LivenessChallenge, LivenessResponse, VerificationRequest};
use crate::registry::{Registry, RegistryError};

/// Errors surfaced by the service, each mapping to one protocol error
/// code.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Chain validation or persistence failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Challenge protocol failure.
    #[error(transparent)]
    Challenge(#[from] ChallengeError),

    /// Malformed input encoding.
    #[error("malformed input: {0}")]
    Codec(#[from] CodecError),

    /// Certificate construction failure.
    #[error(transparent)]
    Certificate(#[from] CertificateError),

    /// Epoch seal verification failure.
    #[error(transparent)]
    Epoch(#[from] EpochError),

    /// The verifier's registry does not serve this identity.
    #[error("identity is not served by this verifier")]
    UntrustedIdentity,

    /// The identity has no validated chain.
    #[error("identity has no validated chain")]
    UnknownIdentity,

    /// Token bucket empty for the caller.
    #[error("rate limited")]
    RateLimited,

    /// Worker pool saturated.
    #[error("verification worker pool saturated")]
    ResourceExhausted,

    /// Unexpected internal failure.
    #[error("internal fault: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Protocol error code for the wire.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Registry(RegistryError::Chain(chain)) => match chain {
                ChainError::Malformed(_) => ErrorCode::MalformedEncoding,
                ChainError::InvalidSignature { .. } => ErrorCode::InvalidSignature,
                ChainError::IndexGap { .. } => ErrorCode::IndexGap,
                ChainError::TimestampRegress { .. } => ErrorCode::TimestampRegress,
                ChainError::BrokenLink { .. } => ErrorCode::BrokenLink,
                ChainError::DuplicateCell { .. } => ErrorCode::DuplicateCell,
                ChainError::IntervalTooShort { .. } => ErrorCode::IntervalTooShort,
                ChainError::CellCapExceeded { .. } => ErrorCode::CellCapExceeded,
                ChainError::IdentityMismatch { .. } | ChainError::InvalidCell { .. } => {
                    ErrorCode::MalformedEncoding
                },
            },
            Self::Registry(RegistryError::Store(_)) => ErrorCode::IoFault,
            Self::Challenge(challenge) => match challenge {
                ChallengeError::NonceReuse => ErrorCode::NonceReuse,
                ChallengeError::SlotBusy => ErrorCode::ResourceExhausted,
                ChallengeError::Timeout => ErrorCode::ChallengeTimeout,
                ChallengeError::Cancelled => ErrorCode::Cancelled,
                ChallengeError::NonceMismatch => ErrorCode::NonceMismatch,
                ChallengeError::InvalidSignature => ErrorCode::InvalidSignature,
                ChallengeError::HeadHashMismatch => ErrorCode::HeadHashMismatch,
                ChallengeError::FreshnessTooLong { .. }
                | ChallengeError::NoChallenge
                | ChallengeError::StaleIndex { .. }
                | ChallengeError::TimestampOutOfWindow => ErrorCode::InvalidRequest,
            },
            Self::Codec(_) => ErrorCode::MalformedEncoding,
            Self::Epoch(epoch) => match epoch {
                EpochError::Malformed(_) => ErrorCode::MalformedEncoding,
                EpochError::InvalidSignature { .. } => ErrorCode::InvalidSignature,
                EpochError::SpanMismatch { .. }
                | EpochError::FieldMismatch { .. }
                | EpochError::ChainTooShort { .. } => ErrorCode::InvalidRequest,
            },
            Self::Certificate(_) | Self::Internal(_) => ErrorCode::IoFault,
            Self::UntrustedIdentity | Self::UnknownIdentity => ErrorCode::UntrustedIdentity,
            Self::RateLimited => ErrorCode::RateLimited,
            Self::ResourceExhausted => ErrorCode::ResourceExhausted,
        }
    }
}

/// The long-lived verifier service.
pub struct VerifierService {
    config: VerifierConfig,
    engine: CriticalityEngine,
    registry: Registry,
    coordinator: ChallengeCoordinator,
    signing_key: SigningKey,
    trusted: TrustedRegistry,
    workers: Arc<Semaphore>,
    identity_limiter: KeyedLimiter,
    rp_limiter: KeyedLimiter,
}

impl VerifierService {
    /// Assembles a service from its startup resources.
    #[must_use]
    pub fn new(
        config: VerifierConfig,
        signing_key: SigningKey,
        trusted: TrustedRegistry,
        store: Option<Arc<ChainStore>>,
    ) -> Self {
        let verifier_identity = signing_key.verifying_key().to_bytes();
        Self {
            engine: CriticalityEngine::new(config.clone()),
            registry: Registry::new(config.clone(), store),
            coordinator: ChallengeCoordinator::new(config.challenge.clone(), verifier_identity),
            signing_key,
            trusted,
            workers: Arc::new(Semaphore::new(config.limits.worker_permits)),
            identity_limiter: KeyedLimiter::new(
                config.limits.identity_rate_per_sec,
                config.limits.identity_burst,
            ),
            rp_limiter: KeyedLimiter::new(
                config.limits.relying_party_rate_per_sec,
                config.limits.relying_party_burst,
            ),
            config,
        }
    }

    /// Rebuilds in-memory state from the chain store.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Registry`] if recovery fails.
    pub fn recover(&self) -> Result<usize, ServiceError> {
        Ok(self.registry.recover()?)
    }

    /// The verifier's public key.
    #[must_use]
    pub fn verifier_identity(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Wall-clock seconds, for callers that do not supply their own
    /// evaluation clock.
    #[must_use]
    #[allow(clippy::missing_panics_doc)]
    pub fn now_unix() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_secs()
    }

    /// Validates and applies a breadcrumb batch.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] naming the first failing check.
    pub async fn submit_breadcrumbs(&self, batch: &[u8]) -> Result<u64, ServiceError> {
        let crumbs = decode_batch(batch)?;
        let Some(first) = crumbs.first() else {
            return Err(ServiceError::Codec(CodecError::Malformed(
                "empty breadcrumb batch".into(),
            )));
        };
        let identity = first.identity;
        drop(crumbs);

        if !self.trusted.serves(&identity.0) {
            return Err(ServiceError::UntrustedIdentity);
        }
        if !self.identity_limiter.try_acquire(&identity.0) {
            return Err(ServiceError::RateLimited);
        }

        let (appended, _, head_index) = self.registry.ingest(identity, batch).await?;
        info!(
            identity = %identity,
            appended,
            head_index = head_index.unwrap_or(0),
            "evidence accepted"
        );
        Ok(appended as u64)
    }

    /// Verifies an attester's sealed epoch against the stored chain:
    /// span, timestamps, Merkle root, unique-cell count, and signature
    /// must all match the verifier's own view.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] naming the first disagreement.
    pub async fn submit_epoch(&self, bytes: &[u8]) -> Result<u64, ServiceError> {
        let epoch = Epoch::decode(bytes)?;
        if !self.trusted.serves(&epoch.identity.0) {
            return Err(ServiceError::UntrustedIdentity);
        }
        if !self.identity_limiter.try_acquire(&epoch.identity.0) {
            return Err(ServiceError::RateLimited);
        }

        let snapshot = self
            .registry
            .snapshot(epoch.identity)
            .await
            .ok_or(ServiceError::UnknownIdentity)?;
        epoch.verify_against_chain(snapshot.chain(), self.config.chain.epoch_size)?;
        info!(identity = %epoch.identity, epoch = epoch.number, "epoch seal verified");
        Ok(epoch.number)
    }

    /// Opens an active-verification challenge for a relying party.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] if the identity is unknown, limits
    /// are exceeded, or the nonce was already spent.
    pub async fn begin_verification(
        &self,
        request: &VerificationRequest,
        peer: &[u8],
    ) -> Result<LivenessChallenge, ServiceError> {
        if !self.rp_limiter.try_acquire(peer) {
            return Err(ServiceError::RateLimited);
        }
        if !self.trusted.serves(&request.identity.0) {
            return Err(ServiceError::UntrustedIdentity);
        }
        if self.registry.head(request.identity).await.is_none() {
            return Err(ServiceError::UnknownIdentity);
        }

        let challenge = self.coordinator.begin(
            request.identity,
            request.nonce,
            request.freshness_window_secs,
            Self::now_unix(),
        )?;
        Ok(challenge)
    }

    /// Awaits the liveness response for an open challenge, computes the
    /// verdict over a consistent snapshot, and issues the bound
    /// certificate.
    ///
    /// The certificate's chain-head hash is the head at the moment the
    /// response was accepted; evidence arriving afterwards does not
    /// shift it.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] on timeout, cancellation, resource
    /// exhaustion, or issuance failure. No certificate is produced on
    /// any failure path.
    pub async fn complete_verification(
        &self,
        identity: IdentityKey,
        nonce: [u8; NONCE_SIZE],
        now_unix: u64,
    ) -> Result<Vec<u8>, ServiceError> {
        let response = self.coordinator.await_response(identity, nonce).await?;

        let Ok(_permit) = self.workers.try_acquire() else {
            warn!(identity = %identity, "worker pool saturated; rejecting verification");
            return Err(ServiceError::ResourceExhausted);
        };

        let snapshot = self
            .registry
            .snapshot(identity)
            .await
            .ok_or(ServiceError::UnknownIdentity)?;
        let engine = self.engine.clone();
        let mut verdict =
            tokio::task::spawn_blocking(move || snapshot.evaluate(&engine, now_unix))
                .await
                .map_err(|e| ServiceError::Internal(e.to_string()))?;
        self.registry
            .with_state(identity, |state| state.commit_verdict(&mut verdict))
            .await;

        info!(identity = %identity, summary = %verdict.summary(), "issuing certificate");
        let certificate = PohCertificate::issue(
            &verdict,
            identity,
            nonce,
            response.chain_head_hash,
            now_unix,
            self.config.challenge.certificate_valid_secs,
            &self.signing_key,
        )?;
        Ok(certificate.encode()?)
    }

    /// Routes an attester's liveness response to its open challenge.
    ///
    /// The response carries no identity field; it is routed to the
    /// in-flight identity whose key verifies its signature, so a forged
    /// or mis-addressed response cannot attach to someone else's
    /// challenge.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] naming the failing validation.
    pub async fn submit_response(&self, response: LivenessResponse) -> Result<(), ServiceError> {
        for identity in self.coordinator.identities_in_flight() {
            if response.verify(&identity).unwrap_or(false) {
                let (head, index) = self
                    .registry
                    .head(identity)
                    .await
                    .ok_or(ServiceError::UnknownIdentity)?;
                return Ok(self
                    .coordinator
                    .submit_response(identity, response, head, index)?);
            }
        }
        // No in-flight challenge matches the signer; if exactly one
        // identity is being challenged this is a nonce/signature
        // problem, otherwise there is simply no challenge.
        Err(ServiceError::Challenge(ChallengeError::NoChallenge))
    }

    /// Withdraws outstanding challenges for `identity`.
    pub fn cancel(&self, identity: IdentityKey) -> bool {
        self.coordinator.cancel(identity)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use trip_core::breadcrumb::{Breadcrumb, CellId, MetaFlags, encode_batch};

    use super::*;

    const PEER: &[u8] = b"rp-1";

    fn batch(key: &SigningKey, n: usize) -> Vec<u8> {
        let origin = h3o_cell();
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
                    [0x88; 32],
                    prev_hash,
                    MetaFlags::new(),
                )
                .unwrap(),
            );
        }
        encode_batch(&crumbs).unwrap()
    }

    fn h3o_cell() -> h3o::CellIndex {
        h3o::LatLng::new(59.3293, 18.0686)
            .unwrap()
            .to_cell(h3o::Resolution::Ten)
    }

    fn service_with(config: VerifierConfig) -> Arc<VerifierService> {
        let signing_key = SigningKey::generate(&mut StdRng::seed_from_u64(51));
        Arc::new(VerifierService::new(
            config,
            signing_key,
            TrustedRegistry::open(),
            None,
        ))
    }

    fn request(identity: IdentityKey, nonce: [u8; NONCE_SIZE]) -> VerificationRequest {
        VerificationRequest {
            identity,
            nonce,
            request_timestamp: VerifierService::now_unix(),
            freshness_window_secs: 600,
        }
    }

    #[tokio::test]
    async fn full_round_trip_issues_bound_certificate() {
        let service = service_with(VerifierConfig::default());
        let attester = SigningKey::generate(&mut StdRng::seed_from_u64(52));
        let identity = IdentityKey(attester.verifying_key().to_bytes());

        let appended = service.submit_breadcrumbs(&batch(&attester, 8)).await.unwrap();
        assert_eq!(appended, 8);

        let nonce = [0x21; NONCE_SIZE];
        let challenge = service
            .begin_verification(&request(identity, nonce), PEER)
            .await
            .unwrap();

        let completion = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .complete_verification(identity, nonce, VerifierService::now_unix())
                    .await
            })
        };
        tokio::task::yield_now().await;

        let (head, index) = service.registry.head(identity).await.unwrap();
        let response = LivenessResponse::signed(
            &attester,
            challenge.nonce,
            head,
            challenge.challenge_timestamp + 2,
            index,
        )
        .unwrap();
        service.submit_response(response).await.unwrap();

        let cert_bytes = completion.await.unwrap().unwrap();
        let cert = PohCertificate::decode(&cert_bytes).unwrap();
        cert.verify(&service.verifier_identity(), &nonce, Some(&head))
            .unwrap();
        assert_eq!(cert.breadcrumb_count, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_challenge_times_out_and_frees_slot() {
        let service = service_with(VerifierConfig::default());
        let attester = SigningKey::generate(&mut StdRng::seed_from_u64(53));
        let identity = IdentityKey(attester.verifying_key().to_bytes());
        service.submit_breadcrumbs(&batch(&attester, 4)).await.unwrap();

        let nonce = [0x22; NONCE_SIZE];
        service
            .begin_verification(&request(identity, nonce), PEER)
            .await
            .unwrap();

        let err = service
            .complete_verification(identity, nonce, VerifierService::now_unix())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ChallengeTimeout);

        // Slot released: a fresh nonce opens a new challenge; the dead
        // nonce stays dead.
        let fresh = [0x23; NONCE_SIZE];
        service
            .begin_verification(&request(identity, fresh), PEER)
            .await
            .unwrap();
        let reused = service
            .begin_verification(&request(identity, nonce), PEER)
            .await
            .unwrap_err();
        assert_eq!(reused.code(), ErrorCode::NonceReuse);
    }

    #[tokio::test]
    async fn flipped_nonce_reports_mismatch_without_completing() {
        let service = service_with(VerifierConfig::default());
        let attester = SigningKey::generate(&mut StdRng::seed_from_u64(54));
        let identity = IdentityKey(attester.verifying_key().to_bytes());
        service.submit_breadcrumbs(&batch(&attester, 4)).await.unwrap();

        let nonce = [0x24; NONCE_SIZE];
        let challenge = service
            .begin_verification(&request(identity, nonce), PEER)
            .await
            .unwrap();

        let mut flipped = challenge.nonce;
        flipped[0] ^= 0x01;
        let (head, index) = service.registry.head(identity).await.unwrap();
        let response = LivenessResponse::signed(
            &attester,
            flipped,
            head,
            challenge.challenge_timestamp + 1,
            index,
        )
        .unwrap();

        let err = service.submit_response(response).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NonceMismatch);
    }

    #[tokio::test]
    async fn saturated_worker_pool_rejects_instead_of_queueing() {
        let mut config = VerifierConfig::default();
        config.limits.worker_permits = 0;
        let service = service_with(config);
        let attester = SigningKey::generate(&mut StdRng::seed_from_u64(55));
        let identity = IdentityKey(attester.verifying_key().to_bytes());
        service.submit_breadcrumbs(&batch(&attester, 4)).await.unwrap();

        let nonce = [0x25; NONCE_SIZE];
        let challenge = service
            .begin_verification(&request(identity, nonce), PEER)
            .await
            .unwrap();

        let completion = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .complete_verification(identity, nonce, VerifierService::now_unix())
                    .await
            })
        };
        tokio::task::yield_now().await;

        let (head, index) = service.registry.head(identity).await.unwrap();
        let response = LivenessResponse::signed(
            &attester,
            challenge.nonce,
            head,
            challenge.challenge_timestamp + 1,
            index,
        )
        .unwrap();
        service.submit_response(response).await.unwrap();

        let err = completion.await.unwrap().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ResourceExhausted);
    }

    #[tokio::test]
    async fn verification_requests_rate_limited_per_peer() {
        let mut config = VerifierConfig::default();
        config.limits.relying_party_burst = 1;
        config.limits.relying_party_rate_per_sec = 0;
        let service = service_with(config);
        let attester = SigningKey::generate(&mut StdRng::seed_from_u64(56));
        let identity = IdentityKey(attester.verifying_key().to_bytes());
        service.submit_breadcrumbs(&batch(&attester, 4)).await.unwrap();

        service
            .begin_verification(&request(identity, [0x26; NONCE_SIZE]), PEER)
            .await
            .unwrap();
        service.cancel(identity);

        let err = service
            .begin_verification(&request(identity, [0x27; NONCE_SIZE]), PEER)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RateLimited);
    }

    #[tokio::test]
    async fn unknown_identity_cannot_be_verified() {
        let service = service_with(VerifierConfig::default());
        let err = service
            .begin_verification(&request(IdentityKey([0x0f; 32]), [0x28; NONCE_SIZE]), PEER)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UntrustedIdentity);
    }

    #[tokio::test]
    async fn sealed_epoch_verified_against_stored_chain() {
        let mut config = VerifierConfig::default();
        config.chain.epoch_size = 4;
        let service = service_with(config.clone());
        let attester = SigningKey::generate(&mut StdRng::seed_from_u64(59));
        let bytes = batch(&attester, 8);
        service.submit_breadcrumbs(&bytes).await.unwrap();

        let chain = trip_core::chain::Chain::from_bytes(&bytes, &config.chain).unwrap();
        let epoch = trip_core::epoch::Epoch::seal_signed(&chain, 0, 4, &attester).unwrap();
        let number = service.submit_epoch(&epoch.encode().unwrap()).await.unwrap();
        assert_eq!(number, 0);

        // A seal signed by anyone else is rejected.
        let outsider = SigningKey::generate(&mut StdRng::seed_from_u64(60));
        let forged = trip_core::epoch::Epoch::seal_signed(&chain, 1, 4, &outsider).unwrap();
        let err = service
            .submit_epoch(&forged.encode().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidSignature);
    }

    #[tokio::test]
    async fn closed_registry_refuses_unlisted_attester() {
        let trusted = TrustedRegistry::from_keys([[0x01; 32]]);
        let signing_key = SigningKey::generate(&mut StdRng::seed_from_u64(57));
        let service = Arc::new(VerifierService::new(
            VerifierConfig::default(),
            signing_key,
            trusted,
            None,
        ));

        let attester = SigningKey::generate(&mut StdRng::seed_from_u64(58));
        let err = service
            .submit_breadcrumbs(&batch(&attester, 2))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UntrustedIdentity);
    }
}
