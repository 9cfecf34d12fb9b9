//! Geodesic helpers on the WGS-84 mean sphere

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters (IUGG)
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// Slack added to prefilter boxes so rounding never drops a boundary point
const BOX_MARGIN_DEGREES: f64 = 1e-7;

/// A validated latitude/longitude pair in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(Error::InvalidCoordinate(format!("latitude out of range: {latitude}")));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(Error::InvalidCoordinate(format!("longitude out of range: {longitude}")));
        }
        Ok(Self { latitude, longitude })
    }

    /// Build from nullable columns; `None` unless both are present and valid
    pub fn from_parts(latitude: Option<f64>, longitude: Option<f64>) -> Option<Self> {
        match (latitude, longitude) {
            (Some(lat), Some(lon)) => Self::new(lat, lon).ok(),
            _ => None,
        }
    }

    /// Great-circle distance in meters
    pub fn haversine_meters(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = (other.latitude - self.latitude).to_radians();
        let dlon = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_METERS * c
    }

    /// Box guaranteed to contain every point within `radius_meters`
    ///
    /// Used as an index-friendly prefilter; exact distance is checked after.
    pub fn bounding_box(&self, radius_meters: f64) -> BoundingBox {
        let angular = radius_meters.max(0.0) / EARTH_RADIUS_METERS;
        let dlat = angular.to_degrees() + BOX_MARGIN_DEGREES;
        let min_lat = (self.latitude - dlat).max(-90.0);
        let max_lat = (self.latitude + dlat).min(90.0);

        let cos_lat = self.latitude.to_radians().cos();
        let spread = angular.sin() / cos_lat;
        let (min_lon, max_lon) = if max_lat >= 90.0 || min_lat <= -90.0 || !(0.0..1.0).contains(&spread) {
            (-180.0, 180.0)
        } else {
            let dlon = spread.asin().to_degrees() + BOX_MARGIN_DEGREES;
            let lo = self.longitude - dlon;
            let hi = self.longitude + dlon;
            if lo < -180.0 || hi > 180.0 {
                (-180.0, 180.0)
            } else {
                (lo, hi)
            }
        };

        BoundingBox { min_lat, max_lat, min_lon, max_lon }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn contains(&self, point: &GeoPoint) -> bool {
        (self.min_lat..=self.max_lat).contains(&point.latitude)
            && (self.min_lon..=self.max_lon).contains(&point.longitude)
    }
}
