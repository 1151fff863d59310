//! Spectral analysis of the displacement series.
//!
//! Estimates the power-spectral-density scaling exponent α of the
//! displacement signal with an overlapping-window Welch estimator: Hann
//! windows at 50% overlap, averaged one-sided periodograms, then an
//! ordinary-least-squares fit of `log S(f) = c − α·log f` over the
//! usable bins (DC and Nyquist discarded).
//!
//! α near 0 is white noise (memoryless generators), α in the configured
//! biological band reflects the 1/f^α correlations of human mobility,
//! and α near 2 is brown noise (replayed or integrated trajectories).

use rustfft::FftPlanner;
use rustfft::num_complex::Complex;
use thiserror::Error;

use crate::config::SpectralConfig;

/// Smallest Welch segment the estimator will use.
const MIN_SEGMENT_LEN: usize = 16;

/// Errors from the spectral estimator.
#[derive(Debug, Error)]
pub enum SpectralError {
    /// Not enough displacement samples for a PSD estimate.
    #[error("insufficient data: got {got} samples, need {need}")]
    InsufficientData {
        /// Samples supplied.
        got: usize,
        /// Configured minimum.
        need: usize,
    },

    /// The spectrum collapsed to too few usable bins to fit.
    #[error("too few non-zero frequency bins: {got}")]
    TooFewBins {
        /// Usable bins after filtering.
        got: usize,
    },

    /// The log-log regression was singular or produced non-finite
    /// values.
    #[error("numerical failure in spectral fit")]
    Numerical,
}

/// Named noise band for diagnostics; boundaries track the configured
/// classification bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpectralBand {
    /// α below the synthetic ceiling: white noise.
    White,
    /// α between the synthetic ceiling and the biological band.
    Borderline,
    /// α inside the biological band.
    Biological,
    /// α above the biological band but below the replay floor.
    Correlated,
    /// α at or above the replay floor: brown noise.
    Brown,
}

impl SpectralBand {
    /// Buckets an exponent into its band.
    #[must_use]
    pub fn from_alpha(alpha: f64, config: &SpectralConfig) -> Self {
        if alpha < config.alpha_synthetic_max {
            Self::White
        } else if alpha < config.alpha_bio_min {
            Self::Borderline
        } else if alpha <= config.alpha_bio_max {
            Self::Biological
        } else if alpha < config.alpha_replay_min {
            Self::Correlated
        } else {
            Self::Brown
        }
    }

    /// Short label for logs and verdict summaries.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::White => "white",
            Self::Borderline => "borderline",
            Self::Biological => "biological",
            Self::Correlated => "correlated",
            Self::Brown => "brown",
        }
    }
}

/// Result of the Welch PSD fit.
#[derive(Debug, Clone)]
pub struct PsdEstimate {
    /// Scaling exponent α (negated log-log slope).
    pub alpha: f64,
    /// Coefficient of determination of the fit.
    pub r_squared: f64,
    /// Frequency bins used in the fit.
    pub num_bins: usize,
    /// Welch segment length.
    pub segment_len: usize,
    /// Averaged segments.
    pub segments: usize,
    /// Noise band of α.
    pub band: SpectralBand,
}

/// Estimates α over a displacement window.
///
/// `dt_mean_secs` scales the frequency axis; it shifts the fit intercept
/// but not the slope, so α is invariant to it.
///
/// # Errors
///
/// Returns [`SpectralError::InsufficientData`] below the configured
/// minimum, [`SpectralError::TooFewBins`] for degenerate spectra, and
/// [`SpectralError::Numerical`] for singular fits.
#[allow(clippy::cast_precision_loss)]
pub fn estimate_alpha(
    displacements: &[f64],
    dt_mean_secs: f64,
    config: &SpectralConfig,
) -> Result<PsdEstimate, SpectralError> {
    let n = displacements.len();
    if n < config.min_samples {
        return Err(SpectralError::InsufficientData {
            got: n,
            need: config.min_samples,
        });
    }

    // Center the signal so the DC bin carries no information.
    let mean = displacements.iter().sum::<f64>() / n as f64;
    let centered: Vec<f64> = displacements.iter().map(|&x| x - mean).collect();

    // Segment length: N/4 rounded down to a power of two.
    let target = (n / 4).max(1);
    let segment_len = if target.is_power_of_two() {
        target
    } else {
        target.next_power_of_two() / 2
    };
    let segment_len = segment_len.max(MIN_SEGMENT_LEN).min(n);
    let step = segment_len / 2;

    let window = hann(segment_len);
    let window_power =
        window.iter().map(|w| w * w).sum::<f64>() / segment_len as f64;

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(segment_len);

    let half = segment_len / 2;
    let mut psd = vec![0.0f64; half + 1];
    let mut segments = 0usize;

    let mut start = 0;
    let mut buffer: Vec<Complex<f64>> = vec![Complex::new(0.0, 0.0); segment_len];
    while start + segment_len <= n {
        for (slot, (&x, &w)) in buffer
            .iter_mut()
            .zip(centered[start..start + segment_len].iter().zip(window.iter()))
        {
            *slot = Complex::new(x * w, 0.0);
        }
        fft.process(&mut buffer);

        for (i, bin) in psd.iter_mut().enumerate() {
            // One-sided spectrum: double everything between DC and
            // Nyquist.
            let scale = if i == 0 || i == half { 1.0 } else { 2.0 };
            *bin += scale * buffer[i].norm_sqr() / (segment_len as f64 * window_power);
        }

        segments += 1;
        start += step;
    }

    for bin in &mut psd {
        *bin /= segments as f64;
    }

    // Frequency axis; DC (i == 0) and the Nyquist bin are discarded.
    let df = 1.0 / (dt_mean_secs.max(f64::MIN_POSITIVE) * segment_len as f64);
    let points: Vec<(f64, f64)> = (1..half)
        .map(|i| (i as f64 * df, psd[i]))
        .filter(|&(_, p)| p > 0.0)
        .collect();

    if points.len() < 4 {
        return Err(SpectralError::TooFewBins { got: points.len() });
    }

    let log_f: Vec<f64> = points.iter().map(|&(f, _)| f.ln()).collect();
    let log_p: Vec<f64> = points.iter().map(|&(_, p)| p.ln()).collect();
    let (slope, _, r_squared) = linear_regression(&log_f, &log_p).ok_or(SpectralError::Numerical)?;

    let alpha = -slope;
    if !alpha.is_finite() || !r_squared.is_finite() {
        return Err(SpectralError::Numerical);
    }

    Ok(PsdEstimate {
        alpha,
        r_squared,
        num_bins: points.len(),
        segment_len,
        segments,
        band: SpectralBand::from_alpha(alpha, config),
    })
}

/// Criticality confidence: how firmly α sits at the biological center,
/// discounted by fit quality. Clamped to [0, 1]; non-finite inputs score
/// zero.
#[must_use]
pub fn criticality_confidence(alpha: f64, r_squared: f64, config: &SpectralConfig) -> f64 {
    if !alpha.is_finite() || !r_squared.is_finite() {
        return 0.0;
    }
    let alpha_score =
        (1.0 - (alpha - config.alpha_center).abs() / config.alpha_half_width).max(0.0);
    (alpha_score * r_squared.clamp(0.0, 1.0)).clamp(0.0, 1.0)
}

/// Hann window: `w(i) = 0.5·(1 − cos(2πi/(N−1)))`.
#[allow(clippy::cast_precision_loss)]
fn hann(len: usize) -> Vec<f64> {
    let denom = (len - 1) as f64;
    (0..len)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f64::consts::PI * i as f64 / denom).cos()))
        .collect()
}

/// Ordinary least squares; returns `(slope, intercept, r_squared)` or
/// `None` for a singular system.
#[allow(clippy::cast_precision_loss)]
fn linear_regression(x: &[f64], y: &[f64]) -> Option<(f64, f64, f64)> {
    let n = x.len() as f64;
    let sum_x: f64 = x.iter().sum();
    let sum_y: f64 = y.iter().sum();
    let sum_xy: f64 = x.iter().zip(y).map(|(a, b)| a * b).sum();
    let sum_x2: f64 = x.iter().map(|a| a * a).sum();
    let sum_y2: f64 = y.iter().map(|a| a * a).sum();

    let denom = n * sum_x2 - sum_x * sum_x;
    if denom.abs() < f64::EPSILON {
        return None;
    }

    let slope = (n * sum_xy - sum_x * sum_y) / denom;
    let intercept = (sum_y - slope * sum_x) / n;

    let y_mean = sum_y / n;
    let ss_tot = sum_y2 - n * y_mean * y_mean;
    let ss_res: f64 = x
        .iter()
        .zip(y)
        .map(|(&xi, &yi)| (yi - (slope * xi + intercept)).powi(2))
        .sum();

    let r_squared = if ss_tot.abs() > f64::EPSILON {
        1.0 - ss_res / ss_tot
    } else {
        0.0
    };

    Some((slope, intercept, r_squared))
}
