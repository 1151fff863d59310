//! Per-identity mobility profile.
//!
//! Tracks anchor cells (cells with enough recorded presence), a Markov
//! transition matrix between anchors, circadian and weekly histograms,
//! the latest heavy-tail fit, and directional history for the flock
//! fallback. Streaming updates happen per accepted breadcrumb; the
//! row-normalized matrix and predictability Π are rebuilt only at epoch
//! boundaries.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Datelike, Timelike};

use crate::breadcrumb::{Breadcrumb, CellId};
use crate::config::MobilityConfig;
use crate::geo::{cell_centroid, grid_distance, haversine_km};
use crate::heavytail::TailFit;

/// Hour-of-day and weekday bin for a timestamp, shifted by the
/// deployment's fixed offset from UTC.
#[must_use]
pub fn time_bins(timestamp: u64, utc_offset_secs: i64) -> (usize, usize) {
    let shifted = i64::try_from(timestamp)
        .unwrap_or(0)
        .saturating_add(utc_offset_secs);
    let dt = DateTime::from_timestamp(shifted, 0)
        .unwrap_or_else(|| DateTime::from_timestamp(0, 0).expect("epoch is representable"));
    (
        dt.hour() as usize,
        dt.weekday().num_days_from_monday() as usize,
    )
}

/// Per-identity mobility state.
#[derive(Debug, Clone)]
pub struct MobilityProfile {
    anchor_threshold: u32,
    utc_offset_secs: i64,
    cell_counts: HashMap<CellId, u32>,
    anchors: Vec<CellId>,
    /// Anchor-to-anchor transition counts, including self-loops.
    transitions: HashMap<CellId, HashMap<CellId, u32>>,
    hour_hist: [u64; 24],
    weekday_hist: [u64; 7],
    /// Transitions observed since the last epoch boundary.
    recent_transitions: VecDeque<(CellId, CellId)>,
    /// Argmax successor per anchor row, rebuilt at epoch boundaries.
    argmax: HashMap<CellId, CellId>,
    predictability: f64,
    /// Latest heavy-tail fit, refreshed at epoch boundaries.
    tail_fit: Option<TailFit>,
    /// Displacements beyond the fitted anomaly threshold.
    spatial_anomalies: u64,
    /// Mean displacement heading per (anchor, hour) bucket:
    /// accumulated (east, north) unit vectors and sample count.
    headings: HashMap<(CellId, u8), (f64, f64, u32)>,
    count: u64,
}

impl MobilityProfile {
    /// Creates an empty profile.
    #[must_use]
    pub fn new(config: &MobilityConfig) -> Self {
        Self {
            anchor_threshold: config.anchor_threshold,
            utc_offset_secs: config.utc_offset_secs,
            cell_counts: HashMap::new(),
            anchors: Vec::new(),
            transitions: HashMap::new(),
            hour_hist: [0; 24],
            weekday_hist: [0; 7],
            recent_transitions: VecDeque::new(),
            argmax: HashMap::new(),
            predictability: 0.0,
            tail_fit: None,
            spatial_anomalies: 0,
            headings: HashMap::new(),
            count: 0,
        }
    }

    /// Streams one accepted breadcrumb into the profile.
    pub fn observe(&mut self, prev: Option<&Breadcrumb>, current: &Breadcrumb) {
        self.count += 1;

        let count = self.cell_counts.entry(current.cell).or_insert(0);
        *count += 1;
        if *count == self.anchor_threshold {
            self.anchors.push(current.cell);
        }

        let (hour, weekday) = self.bins(current.timestamp);
        self.hour_hist[hour] += 1;
        self.weekday_hist[weekday] += 1;

        if let Some(prev) = prev {
            if let (Some(from), Some(to)) = (
                self.nearest_anchor(prev.cell),
                self.nearest_anchor(current.cell),
            ) {
                *self
                    .transitions
                    .entry(from)
                    .or_default()
                    .entry(to)
                    .or_insert(0) += 1;
                self.recent_transitions.push_back((from, to));

                self.record_heading(from, prev.cell, current.cell, hour);
            }
        }
    }

    fn record_heading(&mut self, anchor: CellId, from: CellId, to: CellId, hour: usize) {
        let (Ok((lat_a, lon_a)), Ok((lat_b, lon_b))) = (cell_centroid(from), cell_centroid(to))
        else {
            return;
        };
        let north = lat_b - lat_a;
        let east = (lon_b - lon_a) * lat_a.to_radians().cos();
        let norm = east.hypot(north);
        if norm < f64::EPSILON {
            return;
        }

        #[allow(clippy::cast_possible_truncation)]
        let bucket = (anchor, hour as u8);
        let slot = self.headings.entry(bucket).or_insert((0.0, 0.0, 0));
        slot.0 += east / norm;
        slot.1 += north / norm;
        slot.2 += 1;
    }

    /// Nearest anchor to `cell` by grid distance, falling back to
    /// centroid distance where the grid metric is undefined. Ties break
    /// on the anchor id so the result is deterministic.
    #[must_use]
    pub fn nearest_anchor(&self, cell: CellId) -> Option<CellId> {
        self.anchors
            .iter()
            .copied()
            .min_by(|&a, &b| {
                let key = |anchor: CellId| {
                    (
                        grid_distance(cell, anchor).unwrap_or(u32::MAX),
                        cell_centroid(cell)
                            .ok()
                            .zip(cell_centroid(anchor).ok())
                            .map_or(f64::INFINITY, |((la, lo), (lb, lob))| {
                                haversine_km(la, lo, lb, lob)
                            }),
                    )
                };
                let (ga, da) = key(a);
                let (gb, db) = key(b);
                ga.cmp(&gb)
                    .then_with(|| da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal))
                    .then_with(|| a.cmp(&b))
            })
    }

    /// Rebuilds the row-normalized matrix and predictability at an epoch
    /// boundary, and installs the epoch's heavy-tail fit.
    pub fn on_epoch_sealed(&mut self, tail_fit: Option<TailFit>) {
        self.argmax.clear();
        for (from, row) in &self.transitions {
            if let Some((&to, _)) = row
                .iter()
                .max_by(|(ca, na), (cb, nb)| na.cmp(nb).then_with(|| cb.cmp(ca)))
            {
                self.argmax.insert(*from, to);
            }
        }

        let total = self.recent_transitions.len();
        if total == 0 {
            self.predictability = 0.0;
        } else {
            let matched = self
                .recent_transitions
                .iter()
                .filter(|(from, to)| self.argmax.get(from) == Some(to))
                .count();
            #[allow(clippy::cast_precision_loss)]
            {
                self.predictability = matched as f64 / total as f64;
            }
        }
        self.recent_transitions.clear();

        if tail_fit.is_some() {
            self.tail_fit = tail_fit;
        }
    }

    /// Counts a displacement beyond the fitted anomaly threshold.
    pub fn record_spatial_anomaly(&mut self) {
        self.spatial_anomalies += 1;
    }

    /// Predictability Π from the last sealed epoch.
    #[must_use]
    pub const fn predictability(&self) -> f64 {
        self.predictability
    }

    /// Registered anchors, in registration order.
    #[must_use]
    pub fn anchors(&self) -> &[CellId] {
        &self.anchors
    }

    /// Latest heavy-tail fit, if an epoch has been sealed with one.
    #[must_use]
    pub const fn tail_fit(&self) -> Option<&TailFit> {
        self.tail_fit.as_ref()
    }

    /// Total spatial anomalies recorded.
    #[must_use]
    pub const fn spatial_anomalies(&self) -> u64 {
        self.spatial_anomalies
    }

    /// Breadcrumbs observed.
    #[must_use]
    pub const fn observed(&self) -> u64 {
        self.count
    }

    /// Hour and weekday bins for a timestamp under this profile's
    /// deployment offset.
    #[must_use]
    pub fn bins(&self, timestamp: u64) -> (usize, usize) {
        time_bins(timestamp, self.utc_offset_secs)
    }

    /// Empirical probability of the hour bin.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hour_prob(&self, hour: usize) -> f64 {
        let total: u64 = self.hour_hist.iter().sum();
        if total == 0 {
            return 0.0;
        }
        self.hour_hist[hour % 24] as f64 / total as f64
    }

    /// Empirical probability of the weekday bin (0 = Monday).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn weekday_prob(&self, weekday: usize) -> f64 {
        let total: u64 = self.weekday_hist.iter().sum();
        if total == 0 {
            return 0.0;
        }
        self.weekday_hist[weekday % 7] as f64 / total as f64
    }

    /// Row-normalized transition probability between anchors.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn transition_prob(&self, from: CellId, to: CellId) -> Option<f64> {
        let row = self.transitions.get(&from)?;
        let total: u32 = row.values().sum();
        if total == 0 {
            return None;
        }
        Some(f64::from(row.get(&to).copied().unwrap_or(0)) / f64::from(total))
    }

    /// Mean displacement heading for an (anchor, hour) bucket, as an
    /// (east, north) unit vector.
    #[must_use]
    pub fn mean_heading(&self, anchor: CellId, hour: usize) -> Option<(f64, f64)> {
        #[allow(clippy::cast_possible_truncation)]
        let slot = self.headings.get(&(anchor, (hour % 24) as u8))?;
        if slot.2 == 0 {
            return None;
        }
        let norm = slot.0.hypot(slot.1);
        if norm < f64::EPSILON {
            return None;
        }
        Some((slot.0 / norm, slot.1 / norm))
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::breadcrumb::MetaFlags;

    fn cells() -> Vec<CellId> {
        let origin = h3o::LatLng::new(51.5074, -0.1278)
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
            [0x44; 32],
            None,
            MetaFlags::new(),
        )
        .unwrap()
    }

    #[test]
    fn time_bins_utc() {
        // 2023-11-14 22:13:20 UTC, a Tuesday.
        let (hour, weekday) = time_bins(1_700_000_000, 0);
        assert_eq!(hour, 22);
        assert_eq!(weekday, 1);

        // A +2h deployment offset rolls the bin past midnight into
        // Wednesday.
        let (hour, weekday) = time_bins(1_700_000_000, 7200);
        assert_eq!(hour, 0);
        assert_eq!(weekday, 2);

        let (hour, weekday) = time_bins(1_700_000_000, -3600);
        assert_eq!(hour, 21);
        assert_eq!(weekday, 1);
    }

    #[test]
    fn anchor_registered_at_threshold() {
        let key = SigningKey::generate(&mut StdRng::seed_from_u64(1));
        let cells = cells();
        let mut profile = MobilityProfile::new(&MobilityConfig::default());

        // Visit cell 0 five times, bouncing off distinct cells between.
        let mut prev: Option<Breadcrumb> = None;
        let mut index = 0;
        for i in 0..5 {
            for &cell in &[cells[0], cells[1 + i]] {
                let cur = crumb(&key, index, cell, 1_700_000_000 + index * 900);
                profile.observe(prev.as_ref(), &cur);
                prev = Some(cur);
                index += 1;
            }
        }

        assert_eq!(profile.anchors(), &[cells[0]]);
        assert!(profile.nearest_anchor(cells[2]).is_some());
    }

    #[test]
    fn predictability_of_shuttle_is_high() {
        let key = SigningKey::generate(&mut StdRng::seed_from_u64(2));
        let cells = cells();
        let mut profile = MobilityProfile::new(&MobilityConfig {
            anchor_threshold: 2,
            ..MobilityConfig::default()
        });

        // Strict A-B shuttle: after both anchors exist, every
        // anchor-to-anchor transition alternates deterministically.
        let mut prev: Option<Breadcrumb> = None;
        for i in 0..40u64 {
            let cell = if i % 2 == 0 { cells[0] } else { cells[30] };
            let cur = crumb(&key, i, cell, 1_700_000_000 + i * 900);
            profile.observe(prev.as_ref(), &cur);
            prev = Some(cur);
        }
        profile.on_epoch_sealed(None);

        assert!(
            profile.predictability() > 0.9,
            "Π = {}",
            profile.predictability()
        );
    }

    #[test]
    fn predictability_zero_before_first_epoch() {
        let profile = MobilityProfile::new(&MobilityConfig::default());
        assert!(profile.predictability().abs() < f64::EPSILON);
    }

    #[test]
    fn histograms_normalize() {
        let key = SigningKey::generate(&mut StdRng::seed_from_u64(3));
        let cells = cells();
        let mut profile = MobilityProfile::new(&MobilityConfig::default());

        let mut prev: Option<Breadcrumb> = None;
        for i in 0..24u64 {
            let cur = crumb(
                &key,
                i,
                cells[i as usize % cells.len()],
                1_700_000_000 + i * 3600,
            );
            profile.observe(prev.as_ref(), &cur);
            prev = Some(cur);
        }

        let total: f64 = (0..24).map(|h| profile.hour_prob(h)).sum();
        assert!((total - 1.0).abs() < 1e-9);
        let total: f64 = (0..7).map(|d| profile.weekday_prob(d)).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn transition_rows_normalize() {
        let key = SigningKey::generate(&mut StdRng::seed_from_u64(4));
        let cells = cells();
        let mut profile = MobilityProfile::new(&MobilityConfig {
            anchor_threshold: 1,
            ..MobilityConfig::default()
        });

        let route = [cells[0], cells[10], cells[0], cells[20], cells[0], cells[10]];
        let mut prev: Option<Breadcrumb> = None;
        for (i, &cell) in route.iter().enumerate() {
            let cur = crumb(&key, i as u64, cell, 1_700_000_000 + i as u64 * 900);
            profile.observe(prev.as_ref(), &cur);
            prev = Some(cur);
        }

        let p_10 = profile.transition_prob(cells[0], cells[10]).unwrap();
        let p_20 = profile.transition_prob(cells[0], cells[20]).unwrap();
        assert!((p_10 + p_20 - 1.0).abs() < 1e-9);
        assert!(p_10 > p_20);
    }

    #[test]
    fn heading_bucket_tracks_direction() {
        let key = SigningKey::generate(&mut StdRng::seed_from_u64(5));
        let cells = cells();
        let mut profile = MobilityProfile::new(&MobilityConfig {
            anchor_threshold: 1,
            ..MobilityConfig::default()
        });

        let a = crumb(&key, 0, cells[0], 1_700_000_000);
        let b = crumb(&key, 1, cells[30], 1_700_000_900);
        profile.observe(None, &a);
        profile.observe(Some(&a), &b);

        let (hour, _) = profile.bins(b.timestamp);
        let anchor = profile.nearest_anchor(a.cell).unwrap();
        let (east, north) = profile.mean_heading(anchor, hour).unwrap();
        assert!((east.hypot(north) - 1.0).abs() < 1e-9);
    }
}
