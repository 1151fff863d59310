//! Per-identity verifier state: the chain, its derived caches, and the
//! streaming analyses, mutated together in strict breadcrumb order.
//!
//! [`IdentityState`] is the single owner of everything the verifier
//! knows about one identity. Batch ingestion is transactional: a batch
//! that fails validation anywhere leaves the state exactly as it was.
//! Every accepted breadcrumb flows through the mobility profiler and
//! the Hamiltonian scorer before the next one is considered.
//!
//! The displacement cache is the chain's append-only derived vector: it
//! grows with the chain and never shrinks during the chain's lifetime.

use tracing::{info, warn};

use crate::breadcrumb::{Breadcrumb, IdentityKey, decode_batch};
use crate::chain::{Chain, ChainError};
use crate::config::VerifierConfig;
use crate::criticality::{CriticalityEngine, Verdict};
use crate::geo::{DisplacementSample, cell_distance_km};
use crate::hamiltonian::{AlertLevel, HamiltonianScorer, ScoreContext};
use crate::heavytail::{anomaly_threshold_km, fit_tail};
use crate::mobility::MobilityProfile;

/// All verifier-side state for one identity.
#[derive(Debug, Clone)]
pub struct IdentityState {
    chain: Chain,
    displacements: Vec<DisplacementSample>,
    profile: MobilityProfile,
    scorer: HamiltonianScorer,
    config: VerifierConfig,
    endorsements: u32,
    trust_frozen: bool,
    last_trust: Option<f64>,
}

impl IdentityState {
    /// Creates empty state for `identity`.
    #[must_use]
    pub fn new(identity: IdentityKey, config: VerifierConfig) -> Self {
        Self {
            chain: Chain::new(identity),
            displacements: Vec::new(),
            profile: MobilityProfile::new(&config.mobility),
            scorer: HamiltonianScorer::new(
                config.hamiltonian.clone(),
                config.heavy_tail.clone(),
            ),
            config,
            endorsements: 0,
            trust_frozen: false,
            last_trust: None,
        }
    }

    /// Rebuilds state from a previously validated chain (recovery path).
    ///
    /// Replays every breadcrumb through the streaming analyses, so the
    /// rebuilt state reproduces identical verdicts for the same
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError`] if any stored breadcrumb fails validation.
    pub fn recover(chain: Chain, config: VerifierConfig) -> Result<Self, ChainError> {
        let mut state = Self::new(chain.identity(), config);
        for crumb in chain.breadcrumbs() {
            state.admit(crumb.clone())?;
        }
        Ok(state)
    }

    /// Validates and ingests a canonical breadcrumb batch.
    ///
    /// Transactional: on any failure the state is unchanged and the
    /// error identifies the first failing breadcrumb.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError`] for the first failing check.
    pub fn ingest_batch(&mut self, bytes: &[u8]) -> Result<usize, ChainError> {
        let crumbs = decode_batch(bytes)?;

        // Dry-run the chain rules on a scratch copy first, so the
        // profiler and scorer never observe a breadcrumb that a later
        // record in the same batch invalidates.
        let mut scratch = self.chain.clone();
        for crumb in &crumbs {
            scratch.append(crumb.clone(), &self.config.chain)?;
        }
        drop(scratch);

        let count = crumbs.len();
        for crumb in crumbs {
            self.admit(crumb)?;
        }
        info!(
            identity = %self.chain.identity(),
            appended = count,
            head = self.chain.head_index().unwrap_or(0),
            "breadcrumb batch accepted"
        );
        Ok(count)
    }

    /// Appends one pre-validated breadcrumb and streams it through the
    /// analyses.
    fn admit(&mut self, crumb: Breadcrumb) -> Result<(), ChainError> {
        let prev = self.chain.breadcrumbs().last().cloned();
        self.chain.append(crumb, &self.config.chain)?;
        let current = self
            .chain
            .breadcrumbs()
            .last()
            .expect("append succeeded")
            .clone();

        // Extend the append-only displacement cache.
        let displacement = prev.as_ref().map(|p| {
            #[allow(clippy::cast_precision_loss)]
            let dt_secs = current.timestamp.saturating_sub(p.timestamp) as f64;
            DisplacementSample {
                dr_km: cell_distance_km(p.cell, current.cell).unwrap_or(0.0),
                dt_secs,
                timestamp: current.timestamp,
                from_cell: p.cell,
                to_cell: current.cell,
            }
        });
        if let Some(sample) = displacement {
            if let Some(fit) = self.profile.tail_fit() {
                if sample.dr_km > anomaly_threshold_km(fit, &self.config.heavy_tail) {
                    warn!(
                        identity = %self.chain.identity(),
                        index = current.index,
                        displacement_km = sample.dr_km,
                        "displacement beyond fitted anomaly threshold"
                    );
                    self.profile.record_spatial_anomaly();
                }
            }
            self.displacements.push(sample);
        }

        self.profile.observe(prev.as_ref(), &current);

        let breakdown = self.scorer.score(&ScoreContext {
            profile: &self.profile,
            prev: prev.as_ref(),
            current: &current,
            displacement,
            chain_intact: true,
            flock: None,
            context_divergence: None,
        });
        if breakdown.alert == AlertLevel::Critical {
            warn!(
                identity = %self.chain.identity(),
                index = current.index,
                energy = breakdown.total,
                "critical energy: trust growth frozen pending fresh verdict"
            );
            self.trust_frozen = true;
        }

        // Epoch boundary: refresh the tail fit and rebuild the Markov
        // matrix and predictability.
        let epoch_size = self.config.chain.epoch_size;
        if epoch_size > 0 && self.chain.len() as u64 % epoch_size == 0 {
            let window = self
                .displacements
                .len()
                .min(self.config.heavy_tail.fit_window);
            let samples: Vec<f64> = self.displacements[self.displacements.len() - window..]
                .iter()
                .map(|s| s.dr_km)
                .collect();
            let fit = fit_tail(&samples, &self.config.heavy_tail).ok();
            self.profile.on_epoch_sealed(fit);
        }

        Ok(())
    }

    /// Computes a verdict over the current snapshot without touching
    /// any state. Safe to run on a clone while the live state keeps
    /// accepting breadcrumbs.
    #[must_use]
    pub fn evaluate(&self, engine: &CriticalityEngine, now_secs: u64) -> Verdict {
        engine.evaluate(
            &self.chain,
            &self.displacements,
            &self.profile,
            &self.scorer,
            self.endorsements,
            now_secs,
        )
    }

    /// Applies freeze bookkeeping for a completed verdict.
    ///
    /// A fresh verdict lifts a critical-energy trust freeze; while
    /// frozen, the reported trust never exceeds the last unfrozen
    /// value.
    pub fn commit_verdict(&mut self, verdict: &mut Verdict) {
        if self.trust_frozen {
            if let Some(last) = self.last_trust {
                verdict.trust_score = verdict.trust_score.min(last);
            }
            self.trust_frozen = false;
        }
        self.last_trust = Some(verdict.trust_score);
    }

    /// Computes a fresh verdict and applies freeze bookkeeping in one
    /// step.
    pub fn verdict(&mut self, engine: &CriticalityEngine, now_secs: u64) -> Verdict {
        let mut verdict = self.evaluate(engine, now_secs);
        self.commit_verdict(&mut verdict);
        verdict
    }

    /// Records an opaque endorsement for this identity.
    pub fn add_endorsement(&mut self) {
        self.endorsements = self.endorsements.saturating_add(1);
    }

    /// The identity key.
    #[must_use]
    pub const fn identity(&self) -> IdentityKey {
        self.chain.identity()
    }

    /// The validated chain.
    #[must_use]
    pub const fn chain(&self) -> &Chain {
        &self.chain
    }

    /// The displacement cache.
    #[must_use]
    pub fn displacements(&self) -> &[DisplacementSample] {
        &self.displacements
    }

    /// The mobility profile.
    #[must_use]
    pub const fn profile(&self) -> &MobilityProfile {
        &self.profile
    }

    /// Whether trust growth is currently frozen by a critical alert.
    #[must_use]
    pub const fn trust_frozen(&self) -> bool {
        self.trust_frozen
    }
}
