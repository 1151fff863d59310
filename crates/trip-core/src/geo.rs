//! Displacement extraction from consecutive cells.
//!
//! Distances are great-circle kilometers between H3 cell centroids, so the
//! verifier never handles raw coordinates finer than the quantization
//! grid.

use thiserror::Error;

use crate::breadcrumb::{Breadcrumb, CellId};

/// Mean Earth radius in kilometers for the haversine formula.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Errors from cell geometry lookups.
#[derive(Debug, Error)]
pub enum GeoError {
    /// The cell value is not a valid H3 index.
    #[error("invalid cell index: {0}")]
    InvalidCell(CellId),
}

/// Returns the centroid of a cell as `(latitude, longitude)` degrees.
///
/// # Errors
///
/// Returns [`GeoError::InvalidCell`] for values that are not H3 indexes.
pub fn cell_centroid(cell: CellId) -> Result<(f64, f64), GeoError> {
    let index = h3o::CellIndex::try_from(cell.0).map_err(|_| GeoError::InvalidCell(cell))?;
    let ll = h3o::LatLng::from(index);
    Ok((ll.lat(), ll.lng()))
}

/// Great-circle distance between two cell centroids, kilometers.
///
/// # Errors
///
/// Returns [`GeoError::InvalidCell`] if either cell is not an H3 index.
pub fn cell_distance_km(a: CellId, b: CellId) -> Result<f64, GeoError> {
    let (lat_a, lon_a) = cell_centroid(a)?;
    let (lat_b, lon_b) = cell_centroid(b)?;
    Ok(haversine_km(lat_a, lon_a, lat_b, lon_b))
}

/// Grid-step distance between two cells, where defined.
///
/// H3 local coordinates do not span icosahedron faces; `None` means the
/// cells are too far apart for a grid distance and callers should fall
/// back to [`cell_distance_km`].
#[must_use]
pub fn grid_distance(a: CellId, b: CellId) -> Option<u32> {
    let a = h3o::CellIndex::try_from(a.0).ok()?;
    let b = h3o::CellIndex::try_from(b.0).ok()?;
    a.grid_distance(b).ok().and_then(|d| u32::try_from(d).ok())
}

/// Haversine great-circle distance in kilometers.
#[must_use]
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    EARTH_RADIUS_KM * 2.0 * a.sqrt().asin()
}

/// One step of the displacement series: the fundamental observable for
/// the spectral and heavy-tail analyses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplacementSample {
    /// Great-circle displacement, kilometers.
    pub dr_km: f64,
    /// Time delta, seconds.
    pub dt_secs: f64,
    /// Timestamp of the later breadcrumb, Unix seconds.
    pub timestamp: u64,
    /// Cell moved from.
    pub from_cell: CellId,
    /// Cell moved to.
    pub to_cell: CellId,
}

/// Derives the displacement series from an ordered breadcrumb slice.
///
/// For a chain of length N the series has N−1 entries. Deterministic
/// given the chain and the grid library's centroid mapping.
///
/// # Errors
///
/// Returns [`GeoError::InvalidCell`] if any cell is not an H3 index.
pub fn displacement_series(crumbs: &[Breadcrumb]) -> Result<Vec<DisplacementSample>, GeoError> {
    let mut series = Vec::with_capacity(crumbs.len().saturating_sub(1));
    for pair in crumbs.windows(2) {
        let [prev, next] = pair else { unreachable!() };
        #[allow(clippy::cast_precision_loss)]
        let dt_secs = next.timestamp.saturating_sub(prev.timestamp) as f64;
        series.push(DisplacementSample {
            dr_km: cell_distance_km(prev.cell, next.cell)?,
            dt_secs,
            timestamp: next.timestamp,
            from_cell: prev.cell,
            to_cell: next.cell,
        });
    }
    Ok(series)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_rome_to_naples() {
        // Rome 41.9028,12.4964; Naples 40.8518,14.2681: ~190 km apart.
        let d = haversine_km(41.9028, 12.4964, 40.8518, 14.2681);
        assert!((d - 190.0).abs() < 10.0, "got {d}");
    }

    #[test]
    fn haversine_same_point_is_zero() {
        let d = haversine_km(41.9028, 12.4964, 41.9028, 12.4964);
        assert!(d < 1e-9);
    }

    #[test]
    fn centroid_of_valid_cell() {
        // Resolution-10 cell over central Rome.
        let cell = CellId(
            h3o::LatLng::new(41.9028, 12.4964)
                .unwrap()
                .to_cell(h3o::Resolution::Ten)
                .into(),
        );
        let (lat, lon) = cell_centroid(cell).unwrap();
        assert!((lat - 41.9028).abs() < 0.01);
        assert!((lon - 12.4964).abs() < 0.01);
    }

    #[test]
    fn invalid_cell_rejected() {
        assert!(matches!(
            cell_centroid(CellId(0)),
            Err(GeoError::InvalidCell(_))
        ));
    }

    #[test]
    fn neighbor_cells_have_small_distance_and_grid_step() {
        let origin = h3o::LatLng::new(41.9028, 12.4964)
            .unwrap()
            .to_cell(h3o::Resolution::Ten);
        let neighbor = origin
            .grid_disk::<Vec<_>>(1)
            .into_iter()
            .find(|c| *c != origin)
            .unwrap();

        let d = cell_distance_km(CellId(origin.into()), CellId(neighbor.into())).unwrap();
        // Resolution-10 hexagons have ~75 m edges.
        assert!(d > 0.0 && d < 0.5, "got {d}");

        assert_eq!(
            grid_distance(CellId(origin.into()), CellId(neighbor.into())),
            Some(1)
        );
    }
}
