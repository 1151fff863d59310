//! The six-component Hamiltonian: per-breadcrumb anomaly energy.
//!
//! Each accepted breadcrumb is scored against the identity's learned
//! profile:
//!
//! ```text
//! H = 0.25·H_spatial + 0.20·H_temporal + 0.20·H_kinetic
//!   + 0.15·H_flock   + 0.10·H_context  + 0.10·H_structure
//! ```
//!
//! Components are a capability set: flock data and the sensor-context
//! model may be absent, in which case their weight is redistributed
//! proportionally across the present components so the total weight
//! stays 1. The weighted sum is scaled by the profile-maturity factor
//! `m = min(count/200, 1)` so young profiles score low energy while
//! their statistics converge.
//!
//! The scorer keeps a rolling-median baseline of recent energies; alert
//! bands compare the current energy against that baseline and against
//! the absolute ceilings.

use std::collections::VecDeque;

use crate::breadcrumb::Breadcrumb;
use crate::config::{HamiltonianConfig, HeavyTailConfig};
use crate::geo::DisplacementSample;
use crate::heavytail::log_pdf;
use crate::mobility::MobilityProfile;

/// Alert bands over the per-breadcrumb energy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertLevel {
    /// Energy within the nominal band of the baseline.
    Nominal,
    /// Energy above the baseline band but below the suspicious ceiling.
    Elevated,
    /// Energy in the suspicious band.
    Suspicious,
    /// Energy at or above the critical ceiling; trust growth freezes
    /// until a fresh verdict completes.
    Critical,
}

impl AlertLevel {
    /// Short label for logs and verdict summaries.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Nominal => "nominal",
            Self::Elevated => "elevated",
            Self::Suspicious => "suspicious",
            Self::Critical => "critical",
        }
    }
}

/// Co-located peer movement, when a flock feed is available.
#[derive(Debug, Clone, Copy)]
pub struct FlockObservation {
    /// Mean peer heading, east component of a unit vector.
    pub mean_east: f64,
    /// Mean peer heading, north component of a unit vector.
    pub mean_north: f64,
}

/// Everything the scorer needs for one breadcrumb.
#[derive(Debug)]
pub struct ScoreContext<'a> {
    /// The identity's mobility profile.
    pub profile: &'a MobilityProfile,
    /// Predecessor breadcrumb, if any.
    pub prev: Option<&'a Breadcrumb>,
    /// The breadcrumb being scored.
    pub current: &'a Breadcrumb,
    /// Displacement from the predecessor, if any.
    pub displacement: Option<DisplacementSample>,
    /// False when upstream validation flagged the chain.
    pub chain_intact: bool,
    /// Mean heading of the k nearest co-located identities, when the
    /// deployment has a flock feed.
    pub flock: Option<FlockObservation>,
    /// Divergence between the observed sensor-magnitude digest and the
    /// expected model, when an IMU model is deployed.
    pub context_divergence: Option<f64>,
}

/// One scored breadcrumb.
#[derive(Debug, Clone, Copy)]
pub struct EnergyBreakdown {
    /// Displacement-likelihood energy, or `None` when no tail fit
    /// exists yet.
    pub spatial: Option<f64>,
    /// Circadian/weekly rhythm energy.
    pub temporal: f64,
    /// Anchor-transition energy, or `None` before anchors exist.
    pub kinetic: Option<f64>,
    /// Flock-alignment energy, or `None` without peer or heading data.
    pub flock: Option<f64>,
    /// Sensor-context energy, or `None` without an IMU model.
    pub context: Option<f64>,
    /// Structural-regularity energy.
    pub structure: f64,
    /// Maturity-scaled weighted total.
    pub total: f64,
    /// Maturity factor applied.
    pub maturity: f64,
    /// Baseline the alert compared against.
    pub baseline: f64,
    /// Alert band of this breadcrumb.
    pub alert: AlertLevel,
}

/// Streaming per-identity energy scorer.
#[derive(Debug, Clone)]
pub struct HamiltonianScorer {
    config: HamiltonianConfig,
    tail_config: HeavyTailConfig,
    recent_energy: VecDeque<f64>,
    recent_intervals: VecDeque<f64>,
    recent_velocity: VecDeque<f64>,
    phase_points: VecDeque<(f64, f64)>,
    energy_sum: f64,
    energy_count: u64,
    max_energy: f64,
    last_alert: AlertLevel,
}

impl HamiltonianScorer {
    /// Creates an empty scorer.
    #[must_use]
    pub fn new(config: HamiltonianConfig, tail_config: HeavyTailConfig) -> Self {
        Self {
            config,
            tail_config,
            recent_energy: VecDeque::new(),
            recent_intervals: VecDeque::new(),
            recent_velocity: VecDeque::new(),
            phase_points: VecDeque::new(),
            energy_sum: 0.0,
            energy_count: 0,
            max_energy: 0.0,
            last_alert: AlertLevel::Nominal,
        }
    }

    /// Scores one breadcrumb and advances the rolling state.
    #[allow(clippy::cast_precision_loss)]
    pub fn score(&mut self, ctx: &ScoreContext<'_>) -> EnergyBreakdown {
        let cap = self.config.chain_break_energy;
        let (hour, weekday) = ctx.profile.bins(ctx.current.timestamp);

        let spatial = self.spatial_energy(ctx).map(|e| e.clamp(0.0, cap));
        let temporal = self.temporal_energy(ctx.profile, hour, weekday).clamp(0.0, cap);
        let kinetic = self.kinetic_energy(ctx).map(|e| e.clamp(0.0, cap));
        let flock = self.flock_energy(ctx, hour).map(|e| e.clamp(0.0, cap));
        let context = ctx.context_divergence.map(|d| d.clamp(0.0, cap));
        let structure = self.structure_energy(ctx).clamp(0.0, cap);

        // Redistribute absent component weights proportionally.
        let w = &self.config.weights;
        let mut weighted = 0.0;
        let mut present_weight = 0.0;
        for (weight, energy) in [
            (w.spatial, spatial),
            (w.temporal, Some(temporal)),
            (w.kinetic, kinetic),
            (w.flock, flock),
            (w.context, context),
            (w.structure, Some(structure)),
        ] {
            if let Some(energy) = energy {
                weighted += weight * energy;
                present_weight += weight;
            }
        }
        let normalized = if present_weight > 0.0 {
            weighted / present_weight
        } else {
            0.0
        };

        let maturity = (ctx.profile.observed() as f64 / self.config.maturity_count as f64).min(1.0);
        let total = maturity * normalized;

        // Baseline over prior history only, so a first-ever breadcrumb
        // compares against the neutral default rather than itself.
        let baseline = self.baseline();
        let alert = self.classify(total, baseline);

        self.push_energy(total);
        self.last_alert = alert;

        EnergyBreakdown {
            spatial,
            temporal,
            kinetic,
            flock,
            context,
            structure,
            total,
            maturity,
            baseline,
            alert,
        }
    }

    // Energies use decimal logs so a floored histogram bin costs 3 and
    // typical behavior sits well inside the absolute alert ceilings.

    fn spatial_energy(&self, ctx: &ScoreContext<'_>) -> Option<f64> {
        let displacement = ctx.displacement?;
        let fit = ctx.profile.tail_fit()?;
        Some(-log_pdf(fit, displacement.dr_km, &self.tail_config) * std::f64::consts::LOG10_E)
    }

    fn temporal_energy(&self, profile: &MobilityProfile, hour: usize, weekday: usize) -> f64 {
        let floor = self.config.histogram_floor;
        let c = profile.hour_prob(hour).max(floor);
        let w = profile.weekday_prob(weekday).max(floor);
        -c.log10() - w.log10()
    }

    fn kinetic_energy(&self, ctx: &ScoreContext<'_>) -> Option<f64> {
        let prev = ctx.prev?;
        let from = ctx.profile.nearest_anchor(prev.cell)?;
        let to = ctx.profile.nearest_anchor(ctx.current.cell)?;
        let prob = ctx
            .profile
            .transition_prob(from, to)
            .unwrap_or(0.0)
            .max(self.config.histogram_floor);
        Some(-prob.log10())
    }

    fn flock_energy(&self, ctx: &ScoreContext<'_>, hour: usize) -> Option<f64> {
        let displacement = ctx.displacement?;
        let own = heading_of(&displacement)?;

        let reference = if let Some(flock) = ctx.flock {
            (flock.mean_east, flock.mean_north)
        } else {
            // Fallback: the identity's own historical heading at the
            // same (anchor, hour) bucket.
            let prev = ctx.prev?;
            let anchor = ctx.profile.nearest_anchor(prev.cell)?;
            ctx.profile.mean_heading(anchor, hour)?
        };

        let cos_theta = own.0 * reference.0 + own.1 * reference.1;
        Some(1.0 - cos_theta.max(0.0))
    }

    #[allow(clippy::cast_precision_loss)]
    fn structure_energy(&mut self, ctx: &ScoreContext<'_>) -> f64 {
        let mut energy = 0.0;

        if !ctx.chain_intact {
            energy += self.config.chain_break_energy;
        }

        if let Some(displacement) = ctx.displacement {
            let dt = displacement.dt_secs.max(1e-3);
            self.recent_intervals.push_back(dt);
            if self.recent_intervals.len() > self.config.regularity_window {
                self.recent_intervals.pop_front();
            }

            // Excessive uniformity of the collection intervals reads as
            // automation.
            if self.recent_intervals.len() == self.config.regularity_window {
                let n = self.recent_intervals.len() as f64;
                let mean = self.recent_intervals.iter().sum::<f64>() / n;
                let var = self
                    .recent_intervals
                    .iter()
                    .map(|&x| (x - mean).powi(2))
                    .sum::<f64>()
                    / (n - 1.0);
                if var.sqrt() < self.config.regularity_min_std_secs {
                    energy += 1.0;
                }
            }

            let velocity = displacement.dr_km / dt * 3600.0;
            if let Some(&prev_v) = self.recent_velocity.back() {
                let acceleration = (velocity - prev_v) / dt * 3600.0;
                self.phase_points.push_back((velocity, acceleration));
                if self.phase_points.len() > self.config.regularity_window {
                    self.phase_points.pop_front();
                }
            }
            self.recent_velocity.push_back(velocity);
            if self.recent_velocity.len() > self.config.regularity_window + 1 {
                self.recent_velocity.pop_front();
            }

            energy += self.phase_space_energy();
        }

        energy
    }

    /// Phase-space irregularity from the velocity–acceleration
    /// trajectory: a smooth loop encloses signed area relative to its
    /// bounding box, while chaotic scribbles and degenerate
    /// (collinear or near-zero) trajectories cancel to nothing.
    fn phase_space_energy(&self) -> f64 {
        if self.phase_points.len() < 8 {
            return 0.0;
        }

        let points: Vec<(f64, f64)> = self.phase_points.iter().copied().collect();
        let mut area = 0.0;
        for i in 0..points.len() {
            let (x0, y0) = points[i];
            let (x1, y1) = points[(i + 1) % points.len()];
            area += x0 * y1 - x1 * y0;
        }
        area = area.abs() / 2.0;

        let (mut min_v, mut max_v) = (f64::INFINITY, f64::NEG_INFINITY);
        let (mut min_a, mut max_a) = (f64::INFINITY, f64::NEG_INFINITY);
        for &(v, a) in &points {
            min_v = min_v.min(v);
            max_v = max_v.max(v);
            min_a = min_a.min(a);
            max_a = max_a.max(a);
        }
        let bbox = (max_v - min_v) * (max_a - min_a);
        if bbox < f64::EPSILON {
            // Flat trajectory: no dynamics at all.
            return 1.0;
        }

        let ratio = (area / bbox).clamp(0.0, 1.0);
        1.0 - (ratio * 4.0).min(1.0)
    }

    fn classify(&self, energy: f64, baseline: f64) -> AlertLevel {
        if energy < self.config.nominal_baseline_factor * baseline {
            AlertLevel::Nominal
        } else if energy < self.config.elevated_ceiling {
            AlertLevel::Elevated
        } else if energy < self.config.suspicious_ceiling {
            AlertLevel::Suspicious
        } else {
            AlertLevel::Critical
        }
    }

    fn push_energy(&mut self, energy: f64) {
        self.recent_energy.push_back(energy);
        if self.recent_energy.len() > self.config.baseline_window {
            self.recent_energy.pop_front();
        }
        self.energy_sum += energy;
        self.energy_count += 1;
        self.max_energy = self.max_energy.max(energy);
    }

    /// Rolling median of recent energies; 1.0 until history exists.
    #[must_use]
    pub fn baseline(&self) -> f64 {
        if self.recent_energy.is_empty() {
            return 1.0;
        }
        let mut sorted: Vec<f64> = self.recent_energy.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).expect("energies are finite"));
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        }
    }

    /// Mean energy over the identity's lifetime.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean_energy(&self) -> f64 {
        if self.energy_count == 0 {
            return 0.0;
        }
        self.energy_sum / self.energy_count as f64
    }

    /// Highest energy ever scored.
    #[must_use]
    pub const fn max_energy(&self) -> f64 {
        self.max_energy
    }

    /// Alert band of the most recent breadcrumb.
    #[must_use]
    pub const fn last_alert(&self) -> AlertLevel {
        self.last_alert
    }
}

fn heading_of(displacement: &DisplacementSample) -> Option<(f64, f64)> {
    let (lat_a, lon_a) = crate::geo::cell_centroid(displacement.from_cell).ok()?;
    let (lat_b, lon_b) = crate::geo::cell_centroid(displacement.to_cell).ok()?;
    let north = lat_b - lat_a;
    let east = (lon_b - lon_a) * lat_a.to_radians().cos();
    let norm = east.hypot(north);
    if norm < f64::EPSILON {
        return None;
    }
    Some((east / norm, north / norm))
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::breadcrumb::{Breadcrumb, CellId, MetaFlags};
    use crate::config::MobilityConfig;

    fn cells() -> Vec<CellId> {
        let origin = h3o::LatLng::new(40.4168, -3.7038)
            .unwrap()
            .to_cell(h3o::Resolution::Ten);
        origin
            .grid_disk::<Vec<_>>(5)
            .into_iter()
            .map(|c| CellId(c.into()))
            .collect()
    }

    fn crumb(key: &SigningKey, index: u64, cell: CellId, timestamp: u64) -> Breadcrumb {
        Breadcrumb::signed(
            key,
            index,
            timestamp,
            cell,
            10,
            [0x55; 32],
            None,
            MetaFlags::new(),
        )
        .unwrap()
    }

    fn scorer() -> HamiltonianScorer {
        HamiltonianScorer::new(HamiltonianConfig::default(), HeavyTailConfig::default())
    }

    #[test]
    fn absent_components_redistribute_to_unit_weight() {
        // With every optional component absent, the score must equal
        // the weighted mean of the present ones, not a discounted sum.
        let key = SigningKey::generate(&mut StdRng::seed_from_u64(11));
        let cells = cells();
        let mut profile = MobilityProfile::new(&MobilityConfig::default());
        let a = crumb(&key, 0, cells[0], 1_700_000_000);
        profile.observe(None, &a);

        let mut scorer = scorer();
        let breakdown = scorer.score(&ScoreContext {
            profile: &profile,
            prev: None,
            current: &a,
            displacement: None,
            chain_intact: true,
            flock: None,
            context_divergence: None,
        });

        assert!(breakdown.spatial.is_none());
        assert!(breakdown.kinetic.is_none());
        assert!(breakdown.flock.is_none());
        assert!(breakdown.context.is_none());

        let w = HamiltonianConfig::default().weights;
        let expected_weight = w.temporal + w.structure;
        let expected = breakdown.maturity
            * (w.temporal * breakdown.temporal + w.structure * breakdown.structure)
            / expected_weight;
        assert!((breakdown.total - expected).abs() < 1e-12);
    }

    #[test]
    fn maturity_scales_energy() {
        let key = SigningKey::generate(&mut StdRng::seed_from_u64(12));
        let cells = cells();
        let mut profile = MobilityProfile::new(&MobilityConfig::default());
        let a = crumb(&key, 0, cells[0], 1_700_000_000);
        profile.observe(None, &a);

        let mut scorer = scorer();
        let breakdown = scorer.score(&ScoreContext {
            profile: &profile,
            prev: None,
            current: &a,
            displacement: None,
            chain_intact: true,
            flock: None,
            context_divergence: None,
        });

        // One observation out of 200.
        assert!((breakdown.maturity - 0.005).abs() < 1e-12);
    }

    #[test]
    fn chain_break_dominates_structure_energy() {
        let key = SigningKey::generate(&mut StdRng::seed_from_u64(13));
        let cells = cells();
        let mut profile = MobilityProfile::new(&MobilityConfig::default());

        let mut prev: Option<Breadcrumb> = None;
        for i in 0..200u64 {
            let cur = crumb(
                &key,
                i,
                cells[i as usize % cells.len()],
                1_700_000_000 + i * 900,
            );
            profile.observe(prev.as_ref(), &cur);
            prev = Some(cur);
        }

        let cur = crumb(&key, 200, cells[1], 1_700_000_000 + 200 * 900);
        let mut scorer = scorer();
        let breakdown = scorer.score(&ScoreContext {
            profile: &profile,
            prev: prev.as_ref(),
            current: &cur,
            displacement: None,
            chain_intact: false,
            flock: None,
            context_divergence: None,
        });

        assert!(breakdown.structure >= 10.0);
        assert!(breakdown.alert >= AlertLevel::Suspicious);
    }

    #[test]
    fn alert_bands_follow_baseline_then_ceilings() {
        let config = HamiltonianConfig::default();
        let scorer = HamiltonianScorer::new(config, HeavyTailConfig::default());

        // Default baseline is 1.0: nominal band reaches 1.5.
        assert_eq!(scorer.classify(0.0, 1.0), AlertLevel::Nominal);
        assert_eq!(scorer.classify(1.49, 1.0), AlertLevel::Nominal);
        assert_eq!(scorer.classify(1.51, 1.0), AlertLevel::Elevated);
        assert_eq!(scorer.classify(3.5, 1.0), AlertLevel::Suspicious);
        assert_eq!(scorer.classify(5.0, 1.0), AlertLevel::Critical);

        // A depressed baseline tightens the nominal band.
        assert_eq!(scorer.classify(0.4, 0.2), AlertLevel::Elevated);
    }

    #[test]
    fn flock_alignment_and_opposition() {
        let key = SigningKey::generate(&mut StdRng::seed_from_u64(14));
        let cells = cells();
        let mut profile = MobilityProfile::new(&MobilityConfig {
            anchor_threshold: 1,
            ..MobilityConfig::default()
        });

        let a = crumb(&key, 0, cells[0], 1_700_000_000);
        let b = crumb(&key, 1, cells[30], 1_700_000_900);
        profile.observe(None, &a);
        profile.observe(Some(&a), &b);

        let displacement = crate::geo::displacement_series(&[a.clone(), b.clone()])
            .unwrap()
            .pop()
            .unwrap();
        let own = heading_of(&displacement).unwrap();

        let mut s = scorer();
        let aligned = s.score(&ScoreContext {
            profile: &profile,
            prev: Some(&a),
            current: &b,
            displacement: Some(displacement),
            chain_intact: true,
            flock: Some(FlockObservation {
                mean_east: own.0,
                mean_north: own.1,
            }),
            context_divergence: None,
        });
        assert!(aligned.flock.unwrap() < 1e-9);

        let mut s = scorer();
        let opposed = s.score(&ScoreContext {
            profile: &profile,
            prev: Some(&a),
            current: &b,
            displacement: Some(displacement),
            chain_intact: true,
            flock: Some(FlockObservation {
                mean_east: -own.0,
                mean_north: -own.1,
            }),
            context_divergence: None,
        });
        assert!((opposed.flock.unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn metronomic_intervals_raise_structure_energy() {
        let key = SigningKey::generate(&mut StdRng::seed_from_u64(15));
        let cells = cells();
        let mut profile = MobilityProfile::new(&MobilityConfig::default());
        let mut s = scorer();

        let mut prev = crumb(&key, 0, cells[0], 1_700_000_000);
        profile.observe(None, &prev);
        let mut last_structure = 0.0;

        for i in 1..=20u64 {
            // Perfectly regular 900 s cadence.
            let cur = crumb(
                &key,
                i,
                cells[i as usize % cells.len()],
                1_700_000_000 + i * 900,
            );
            profile.observe(Some(&prev), &cur);
            let displacement = crate::geo::displacement_series(&[prev.clone(), cur.clone()])
                .unwrap()
                .pop()
                .unwrap();
            let breakdown = s.score(&ScoreContext {
                profile: &profile,
                prev: Some(&prev),
                current: &cur,
                displacement: Some(displacement),
                chain_intact: true,
                flock: None,
                context_divergence: None,
            });
            last_structure = breakdown.structure;
            prev = cur;
        }

        // Zero interval variance earns the regularity penalty.
        assert!(last_structure >= 1.0, "structure = {last_structure}");
    }
}
