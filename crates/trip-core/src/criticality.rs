//! The criticality engine: orchestrates the statistical battery into a
//! verdict.
//!
//! Chain validation, mobility updates, and Hamiltonian scoring stream
//! per breadcrumb; the spectral and heavy-tail fits are batch estimates
//! recomputed here, lazily, on each verdict request over the sliding
//! window. The engine itself is stateless across calls.
//!
//! A numerical failure in any fit never aborts the verdict: the failed
//! estimate reports as non-finite, confidence drops to zero, and the
//! classification degrades to suspicious, per the no-silent-downgrade
//! policy the certificate then carries outward.

use tracing::{debug, warn};

use crate::chain::Chain;
use crate::config::VerifierConfig;
use crate::geo::DisplacementSample;
use crate::hamiltonian::{AlertLevel, HamiltonianScorer};
use crate::heavytail::{TailError, fit_tail};
use crate::mobility::MobilityProfile;
use crate::spectral::{SpectralBand, SpectralError, criticality_confidence, estimate_alpha};

/// Chain-length regimes that widen acceptance while estimators
/// converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRegime {
    /// Below the spectral minimum; no classification is possible.
    Insufficient,
    /// Enough for a first estimate, highest variance.
    Bootstrap,
    /// Usable but still maturing.
    Provisional,
    /// Full-confidence regime.
    Mature,
}

impl DataRegime {
    fn from_samples(displacements: usize, min_samples: usize) -> Self {
        if displacements < min_samples {
            Self::Insufficient
        } else if displacements < 100 {
            Self::Bootstrap
        } else if displacements < 200 {
            Self::Provisional
        } else {
            Self::Mature
        }
    }

    /// Short label for logs and verdict summaries.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Insufficient => "insufficient",
            Self::Bootstrap => "bootstrap",
            Self::Provisional => "provisional",
            Self::Mature => "mature",
        }
    }
}

/// Final classification of an identity's trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Spectral signature consistent with human mobility.
    Human,
    /// Out-of-band signature that is not clearly machine-generated.
    Suspicious,
    /// White-noise or replay signature.
    Synthetic,
    /// Chain too short to classify.
    InsufficientData,
}

impl Classification {
    /// Short label for logs and verdict summaries.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Suspicious => "suspicious",
            Self::Synthetic => "synthetic",
            Self::InsufficientData => "insufficient_data",
        }
    }
}

/// Snapshot verdict over a chain. Contains statistical summaries only,
/// never cells or coordinates.
#[derive(Debug, Clone)]
pub struct Verdict {
    /// Spectral scaling exponent α; non-finite on numerical failure.
    pub alpha: f64,
    /// Goodness of the α fit.
    pub r_squared: f64,
    /// Noise band of α, when the fit succeeded.
    pub band: Option<SpectralBand>,
    /// Heavy-tail exponent β; non-finite on fit failure.
    pub beta: f64,
    /// Heavy-tail cutoff κ, kilometers; non-finite on fit failure.
    pub kappa_km: f64,
    /// Percentile placement of the largest observed displacement.
    pub tail_quality: f64,
    /// Kolmogorov–Smirnov distance of the tail fit.
    pub ks_distance: f64,
    /// Markov predictability Π from the last sealed epoch.
    pub predictability: f64,
    /// Criticality confidence in [0, 1].
    pub confidence: f64,
    /// Trust score in [0, 100].
    pub trust_score: f64,
    /// Classification tag.
    pub classification: Classification,
    /// Alert band of the most recent breadcrumb.
    pub alert: AlertLevel,
    /// Data regime of the evaluated window.
    pub regime: DataRegime,
    /// Breadcrumbs in the chain.
    pub breadcrumb_count: u64,
    /// Distinct cells visited.
    pub unique_cells: u64,
    /// Complete epochs at the configured epoch size.
    pub epoch_count: u64,
    /// Lifetime mean Hamiltonian energy.
    pub mean_energy: f64,
    /// Set when α and β disagree with the scaling-relation advisory.
    pub consistency_warning: bool,
    /// Whether chain validation was fully intact.
    pub chain_integrity: bool,
}

impl Verdict {
    /// One-line operator summary.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "alpha={:.3} ({}, r2={:.2}) beta={:.3} kappa={:.1}km pi={:.2} \
             H={:.3} conf={:.2} trust={:.0} n={} cells={} -> {}/{}",
            self.alpha,
            self.band.map_or("unfit", SpectralBand::label),
            self.r_squared,
            self.beta,
            self.kappa_km,
            self.predictability,
            self.mean_energy,
            self.confidence,
            self.trust_score,
            self.breadcrumb_count,
            self.unique_cells,
            self.classification.label(),
            self.alert.label(),
        )
    }
}

/// Stateless verdict orchestrator.
#[derive(Debug, Clone)]
pub struct CriticalityEngine {
    config: VerifierConfig,
}

impl CriticalityEngine {
    /// Creates an engine over a validated configuration.
    #[must_use]
    pub fn new(config: VerifierConfig) -> Self {
        Self { config }
    }

    /// The engine's configuration.
    #[must_use]
    pub const fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Evaluates a chain snapshot into a verdict.
    ///
    /// `series` is the chain's displacement cache (one sample per
    /// consecutive breadcrumb pair); `endorsements` counts opaque trust
    /// endorsements recorded for the identity; `now_secs` supplies the
    /// evaluation clock so replays of the same snapshot reproduce the
    /// same verdict.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn evaluate(
        &self,
        chain: &Chain,
        series: &[DisplacementSample],
        profile: &MobilityProfile,
        scorer: &HamiltonianScorer,
        endorsements: u32,
        now_secs: u64,
    ) -> Verdict {
        let spectral_cfg = &self.config.spectral;
        let samples = series.len();
        let regime = DataRegime::from_samples(samples, spectral_cfg.min_samples);

        let mut verdict = Verdict {
            alpha: f64::NAN,
            r_squared: 0.0,
            band: None,
            beta: f64::NAN,
            kappa_km: f64::NAN,
            tail_quality: 0.0,
            ks_distance: 1.0,
            predictability: profile.predictability(),
            confidence: 0.0,
            trust_score: 0.0,
            classification: Classification::InsufficientData,
            alert: scorer.last_alert(),
            regime,
            breadcrumb_count: chain.len() as u64,
            unique_cells: chain.unique_cells() as u64,
            epoch_count: chain.sealed_epochs(self.config.chain.epoch_size),
            mean_energy: scorer.mean_energy(),
            consistency_warning: false,
            chain_integrity: true,
        };

        if regime == DataRegime::Insufficient {
            debug!(
                identity = %chain.identity(),
                samples,
                need = spectral_cfg.min_samples,
                "verdict: insufficient data"
            );
            return verdict;
        }

        let window_len = series.len().min(spectral_cfg.window);
        let window = &series[series.len() - window_len..];
        let displacements: Vec<f64> = window.iter().map(|s| s.dr_km).collect();
        let dt_mean = window.iter().map(|s| s.dt_secs).sum::<f64>() / window_len as f64;

        let mut numerical_failure = false;
        match estimate_alpha(&displacements, dt_mean, spectral_cfg) {
            Ok(est) => {
                verdict.alpha = est.alpha;
                verdict.r_squared = est.r_squared;
                verdict.band = Some(est.band);
            },
            Err(SpectralError::InsufficientData { .. }) => {
                return verdict;
            },
            Err(SpectralError::TooFewBins { .. } | SpectralError::Numerical) => {
                numerical_failure = true;
            },
        }

        let tail_window = series.len().min(self.config.heavy_tail.fit_window);
        let tail_samples: Vec<f64> = series[series.len() - tail_window..]
            .iter()
            .map(|s| s.dr_km)
            .collect();
        match fit_tail(&tail_samples, &self.config.heavy_tail) {
            Ok(fit) => {
                verdict.beta = fit.beta;
                verdict.kappa_km = fit.kappa_km;
                verdict.tail_quality = fit.quality_percentile;
                verdict.ks_distance = fit.ks_distance;
            },
            Err(TailError::InsufficientData { .. } | TailError::Numerical) => {},
        }

        verdict.confidence = criticality_confidence(verdict.alpha, verdict.r_squared, spectral_cfg);
        verdict.trust_score = self.trust_score(chain, endorsements, now_secs, verdict.alpha);
        verdict.classification = if numerical_failure {
            Classification::Suspicious
        } else {
            self.classify(verdict.alpha, spectral_cfg)
        };

        // Advisory scaling-relation check between the two exponents;
        // never affects the verdict.
        if verdict.alpha.is_finite() && verdict.beta.is_finite() {
            let lo = 0.3 * (3.0 - verdict.beta);
            let hi = 0.7 * (3.0 - verdict.beta);
            if verdict.alpha < lo || verdict.alpha > hi {
                warn!(
                    identity = %chain.identity(),
                    alpha = verdict.alpha,
                    beta = verdict.beta,
                    "alpha/beta scaling relation violated"
                );
                verdict.consistency_warning = true;
            }
        }

        debug!(identity = %chain.identity(), summary = %verdict.summary(), "verdict");
        verdict
    }

    fn classify(
        &self,
        alpha: f64,
        cfg: &crate::config::SpectralConfig,
    ) -> Classification {
        if !alpha.is_finite() {
            return Classification::Suspicious;
        }
        if alpha < cfg.alpha_synthetic_max || alpha > cfg.alpha_replay_min {
            Classification::Synthetic
        } else if alpha < cfg.alpha_bio_min || alpha > cfg.alpha_bio_max {
            Classification::Suspicious
        } else {
            Classification::Human
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn trust_score(&self, chain: &Chain, endorsements: u32, now_secs: u64, alpha: f64) -> f64 {
        let trust = &self.config.trust;

        let count_term = (chain.len() as f64 / trust.count_norm as f64).min(1.0);
        let cells_term = (chain.unique_cells() as f64 / trust.cells_norm as f64).min(1.0);
        let days = chain
            .first_timestamp()
            .map_or(0.0, |first| now_secs.saturating_sub(first) as f64 / 86_400.0);
        let age_term = (days / trust.days_norm as f64).min(1.0);
        // Chains in the registry validated on append; integrity is 1 by
        // construction.
        let integrity = 1.0;

        let mut score = trust.weight_count * count_term
            + trust.weight_cells * cells_term
            + trust.weight_age * age_term
            + trust.weight_integrity * integrity;

        score += (f64::from(endorsements) * trust.endorsement_bonus).min(trust.endorsement_cap);

        let in_band = alpha.is_finite()
            && alpha >= self.config.spectral.alpha_bio_min
            && alpha <= self.config.spectral.alpha_bio_max;
        if !in_band {
            score = score.min(trust.out_of_band_cap);
        }

        score.clamp(0.0, 100.0)
    }

    /// Handle-claim admission policy: long enough chain, enough trust.
    #[must_use]
    pub fn handle_claim_allowed(&self, verdict: &Verdict) -> bool {
        verdict.breadcrumb_count >= self.config.trust.handle_min_count
            && verdict.trust_score >= self.config.trust.handle_min_trust
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SpectralConfig, TrustConfig};

    fn engine() -> CriticalityEngine {
        CriticalityEngine::new(VerifierConfig::default())
    }

    #[test]
    fn classification_bands() {
        let engine = engine();
        let cfg = SpectralConfig::default();

        assert_eq!(engine.classify(0.05, &cfg), Classification::Synthetic);
        assert_eq!(engine.classify(0.20, &cfg), Classification::Suspicious);
        assert_eq!(engine.classify(0.55, &cfg), Classification::Human);
        assert_eq!(engine.classify(0.90, &cfg), Classification::Suspicious);
        assert_eq!(engine.classify(1.80, &cfg), Classification::Synthetic);
        assert_eq!(engine.classify(f64::NAN, &cfg), Classification::Suspicious);
    }

    #[test]
    fn regimes_by_sample_count() {
        assert_eq!(
            DataRegime::from_samples(63, 64),
            DataRegime::Insufficient
        );
        assert_eq!(DataRegime::from_samples(64, 64), DataRegime::Bootstrap);
        assert_eq!(DataRegime::from_samples(100, 64), DataRegime::Provisional);
        assert_eq!(DataRegime::from_samples(200, 64), DataRegime::Mature);
    }

    #[test]
    fn trust_formula_reaches_components() {
        // Synthetic check of the closed-form pieces, using a chain-free
        // path: the formula itself is exercised end-to-end in the
        // integration suite.
        let trust = TrustConfig::default();
        assert!((trust.weight_count + trust.weight_cells + trust.weight_age
            + trust.weight_integrity
            - 100.0)
            .abs()
            < 1e-9);
    }
}
