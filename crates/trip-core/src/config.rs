//! Verifier configuration.
//!
//! Every protocol knob is a plain config field with a protocol-fixed
//! default; deployments may recalibrate (notably the α classification
//! bands, whose empirical calibration the draft leaves open) without any
//! change to wire formats. Loaded from a TOML file once at startup; the
//! daemon applies CLI overrides on top.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::breadcrumb::{MAX_RESOLUTION, MIN_RESOLUTION};

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading the config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML syntax or schema error.
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field value fails validation.
    #[error("invalid config: {field}: {reason}")]
    Invalid {
        /// Dotted field path.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },
}

/// Top-level verifier configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerifierConfig {
    /// Chain validation policy.
    pub chain: ChainConfig,
    /// Spectral analyzer parameters.
    pub spectral: SpectralConfig,
    /// Heavy-tail displacement fit parameters.
    pub heavy_tail: HeavyTailConfig,
    /// Mobility profiler parameters.
    pub mobility: MobilityConfig,
    /// Hamiltonian scorer parameters.
    pub hamiltonian: HamiltonianConfig,
    /// Trust score and classification policy.
    pub trust: TrustConfig,
    /// Challenge protocol timing.
    pub challenge: ChallengeConfig,
    /// Worker-pool and rate-limit bounds.
    pub limits: LimitConfig,
}

impl VerifierConfig {
    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on I/O failure, parse failure, or invalid
    /// field values.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_RESOLUTION..=MAX_RESOLUTION).contains(&self.chain.default_resolution) {
            return Err(ConfigError::Invalid {
                field: "chain.default_resolution",
                reason: format!(
                    "{} outside {MIN_RESOLUTION}..={MAX_RESOLUTION}",
                    self.chain.default_resolution
                ),
            });
        }
        if self.chain.per_cell_cap == 0 {
            return Err(ConfigError::Invalid {
                field: "chain.per_cell_cap",
                reason: "must be positive".into(),
            });
        }
        if self.chain.epoch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "chain.epoch_size",
                reason: "must be positive".into(),
            });
        }
        if self.spectral.min_samples < 16 {
            return Err(ConfigError::Invalid {
                field: "spectral.min_samples",
                reason: "must be at least 16".into(),
            });
        }
        if self.spectral.alpha_bio_min >= self.spectral.alpha_bio_max {
            return Err(ConfigError::Invalid {
                field: "spectral.alpha_bio_min",
                reason: "biological band is empty".into(),
            });
        }
        if self.heavy_tail.beta_min >= self.heavy_tail.beta_max {
            return Err(ConfigError::Invalid {
                field: "heavy_tail.beta_min",
                reason: "beta bracket is empty".into(),
            });
        }
        if self.heavy_tail.kappa_min_km >= self.heavy_tail.kappa_max_km {
            return Err(ConfigError::Invalid {
                field: "heavy_tail.kappa_min_km",
                reason: "kappa bracket is empty".into(),
            });
        }
        let w = &self.hamiltonian.weights;
        let sum = w.spatial + w.temporal + w.kinetic + w.flock + w.context + w.structure;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::Invalid {
                field: "hamiltonian.weights",
                reason: format!("weights sum to {sum}, expected 1.0"),
            });
        }
        if self.challenge.response_deadline_secs == 0
            || self.challenge.response_deadline_secs > self.challenge.max_freshness_secs
        {
            return Err(ConfigError::Invalid {
                field: "challenge.response_deadline_secs",
                reason: "must be positive and within the freshness window".into(),
            });
        }
        Ok(())
    }
}

/// Chain validation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChainConfig {
    /// Expected grid resolution for new chains (7..=10).
    pub default_resolution: u8,
    /// Maximum breadcrumbs at a single cell across a chain.
    pub per_cell_cap: u32,
    /// Breadcrumbs per sealed epoch.
    pub epoch_size: u64,
    /// Hard floor on the collection interval, seconds.
    pub min_interval_secs: u64,
    /// Recommended interval, seconds; shorter intervals without the
    /// exploration flag raise a policy warning.
    pub recommended_interval_secs: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            default_resolution: 10,
            per_cell_cap: 10,
            epoch_size: 100,
            min_interval_secs: 300,
            recommended_interval_secs: 900,
        }
    }
}

/// Spectral analyzer parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpectralConfig {
    /// Minimum displacement samples for a PSD estimate.
    pub min_samples: usize,
    /// Recommended sliding-window length.
    pub window: usize,
    /// Lower edge of the biological α band.
    pub alpha_bio_min: f64,
    /// Upper edge of the biological α band.
    pub alpha_bio_max: f64,
    /// α below this is classified synthetic (white noise).
    pub alpha_synthetic_max: f64,
    /// α above this is classified replay (brown noise).
    pub alpha_replay_min: f64,
    /// Center of the criticality score.
    pub alpha_center: f64,
    /// Half-width of the criticality score.
    pub alpha_half_width: f64,
}

impl Default for SpectralConfig {
    fn default() -> Self {
        Self {
            min_samples: 64,
            window: 256,
            alpha_bio_min: 0.30,
            alpha_bio_max: 0.80,
            alpha_synthetic_max: 0.15,
            alpha_replay_min: 1.20,
            alpha_center: 0.55,
            alpha_half_width: 0.25,
        }
    }
}

/// Heavy-tail displacement fit parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeavyTailConfig {
    /// Samples in the fit window (most recent epoch worth).
    pub fit_window: usize,
    /// Lower bound on the exponent β.
    pub beta_min: f64,
    /// Upper bound on the exponent β.
    pub beta_max: f64,
    /// Lower bound on the cutoff κ, kilometers.
    pub kappa_min_km: f64,
    /// Upper bound on the cutoff κ, kilometers.
    pub kappa_max_km: f64,
    /// Clamp floor for displacements entering logarithms, kilometers.
    pub floor_km: f64,
    /// Percentile above which a displacement counts as a spatial anomaly.
    pub anomaly_percentile: f64,
}

impl Default for HeavyTailConfig {
    fn default() -> Self {
        Self {
            fit_window: 100,
            beta_min: 1.0,
            beta_max: 3.0,
            kappa_min_km: 0.05,
            kappa_max_km: 1000.0,
            floor_km: 0.001,
            anomaly_percentile: 0.999,
        }
    }
}

/// Mobility profiler parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MobilityConfig {
    /// Breadcrumb count at which a cell becomes an anchor.
    pub anchor_threshold: u32,
    /// Offset applied before circadian binning, seconds east of UTC.
    /// Zero bins in UTC; fixed per deployment.
    pub utc_offset_secs: i64,
}

impl Default for MobilityConfig {
    fn default() -> Self {
        Self {
            anchor_threshold: 5,
            utc_offset_secs: 0,
        }
    }
}

/// Six-component energy weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HamiltonianWeights {
    /// Displacement-likelihood component.
    pub spatial: f64,
    /// Circadian/weekly rhythm component.
    pub temporal: f64,
    /// Anchor-transition component.
    pub kinetic: f64,
    /// Peer-alignment component.
    pub flock: f64,
    /// Sensor-context component.
    pub context: f64,
    /// Structural-regularity component.
    pub structure: f64,
}

impl Default for HamiltonianWeights {
    fn default() -> Self {
        Self {
            spatial: 0.25,
            temporal: 0.20,
            kinetic: 0.20,
            flock: 0.15,
            context: 0.10,
            structure: 0.10,
        }
    }
}

/// Hamiltonian scorer parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HamiltonianConfig {
    /// Component weights; redistributed proportionally when a component
    /// is unavailable.
    pub weights: HamiltonianWeights,
    /// Floor applied to histogram bins before logarithms.
    pub histogram_floor: f64,
    /// Interval-regularity window, breadcrumbs.
    pub regularity_window: usize,
    /// Interval standard deviation below this (seconds) scores the full
    /// regularity penalty.
    pub regularity_min_std_secs: f64,
    /// Energy assigned to an upstream chain break (practical cap on the
    /// indicator's infinity).
    pub chain_break_energy: f64,
    /// Rolling-median baseline window, breadcrumbs.
    pub baseline_window: usize,
    /// Breadcrumb count at which the maturity factor reaches 1.
    pub maturity_count: u64,
    /// Nominal band upper edge as a multiple of the baseline.
    pub nominal_baseline_factor: f64,
    /// Elevated band upper edge, absolute energy.
    pub elevated_ceiling: f64,
    /// Suspicious band upper edge, absolute energy.
    pub suspicious_ceiling: f64,
    /// Nearest co-located peers considered for the flock component.
    pub flock_neighbors: usize,
}

impl Default for HamiltonianConfig {
    fn default() -> Self {
        Self {
            weights: HamiltonianWeights::default(),
            histogram_floor: 1e-3,
            regularity_window: 16,
            regularity_min_std_secs: 30.0,
            chain_break_energy: 10.0,
            baseline_window: 64,
            maturity_count: 200,
            nominal_baseline_factor: 1.5,
            elevated_ceiling: 3.0,
            suspicious_ceiling: 5.0,
            flock_neighbors: 7,
        }
    }
}

/// Trust score and classification policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrustConfig {
    /// Breadcrumb count normalizer in the trust formula.
    pub count_norm: u64,
    /// Unique-cell normalizer in the trust formula.
    pub cells_norm: u64,
    /// Chain-age normalizer in the trust formula, days.
    pub days_norm: u64,
    /// Weight of the breadcrumb-count term.
    pub weight_count: f64,
    /// Weight of the unique-cell term.
    pub weight_cells: f64,
    /// Weight of the chain-age term.
    pub weight_age: f64,
    /// Weight of the chain-integrity term.
    pub weight_integrity: f64,
    /// Trust ceiling when α is outside the biological band.
    pub out_of_band_cap: f64,
    /// Trust added per recorded endorsement.
    pub endorsement_bonus: f64,
    /// Ceiling on the total endorsement bonus.
    pub endorsement_cap: f64,
    /// Minimum breadcrumbs before a handle claim is accepted.
    pub handle_min_count: u64,
    /// Minimum trust before a handle claim is accepted.
    pub handle_min_trust: f64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            count_norm: 200,
            cells_norm: 50,
            days_norm: 365,
            weight_count: 40.0,
            weight_cells: 30.0,
            weight_age: 20.0,
            weight_integrity: 10.0,
            out_of_band_cap: 50.0,
            endorsement_bonus: 2.0,
            endorsement_cap: 10.0,
            handle_min_count: 100,
            handle_min_trust: 20.0,
        }
    }
}

/// Challenge protocol timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChallengeConfig {
    /// Attester response deadline, seconds.
    pub response_deadline_secs: u64,
    /// Maximum relying-party freshness window, seconds.
    pub max_freshness_secs: u64,
    /// In-flight challenges allowed per identity.
    pub max_inflight_per_identity: usize,
    /// Validity duration stamped into issued certificates, seconds.
    pub certificate_valid_secs: u64,
    /// Spent nonces remembered before the oldest are evicted.
    pub nonce_history: usize,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            response_deadline_secs: 30,
            max_freshness_secs: 3600,
            max_inflight_per_identity: 1,
            certificate_valid_secs: 3600,
            nonce_history: 65536,
        }
    }
}

/// Worker-pool and rate-limit bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitConfig {
    /// Concurrent verdict computations; excess requests are rejected,
    /// never queued.
    pub worker_permits: usize,
    /// Per-identity request rate, tokens per second.
    pub identity_rate_per_sec: u64,
    /// Per-identity burst capacity.
    pub identity_burst: u64,
    /// Per-relying-party request rate, tokens per second.
    pub relying_party_rate_per_sec: u64,
    /// Per-relying-party burst capacity.
    pub relying_party_burst: u64,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            worker_permits: 8,
            identity_rate_per_sec: 4,
            identity_burst: 8,
            relying_party_rate_per_sec: 4,
            relying_party_burst: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        VerifierConfig::default().validate().unwrap();
    }

    #[test]
    fn default_weights_sum_to_one() {
        let w = HamiltonianWeights::default();
        let sum = w.spatial + w.temporal + w.kinetic + w.flock + w.context + w.structure;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn bad_resolution_rejected() {
        let mut config = VerifierConfig::default();
        config.chain.default_resolution = 11;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "chain.default_resolution",
                ..
            })
        ));
    }

    #[test]
    fn skewed_weights_rejected() {
        let mut config = VerifierConfig::default();
        config.hamiltonian.weights.spatial = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_roundtrip_with_overrides() {
        let toml = r#"
            [chain]
            per_cell_cap = 20

            [spectral]
            alpha_bio_min = 0.25
        "#;
        let config: VerifierConfig = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.chain.per_cell_cap, 20);
        assert!((config.spectral.alpha_bio_min - 0.25).abs() < 1e-12);
        // Untouched sections keep protocol defaults.
        assert_eq!(config.spectral.min_samples, 64);
        assert_eq!(config.challenge.response_deadline_secs, 30);
    }

    #[test]
    fn unknown_fields_rejected() {
        let toml = r#"
            [chain]
            not_a_field = 1
        "#;
        assert!(toml::from_str::<VerifierConfig>(toml).is_err());
    }
}
