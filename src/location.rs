//! Location value and accuracy-level types shared by every source.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::nmea::parser::{Gga, Rmc};

/// How trustworthy a location fix is, from coarsest to most precise.
///
/// Ordering matters: sources are compared by [`AccuracyLevel`] to decide
/// which one currently "wins" for the aggregated position.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccuracyLevel {
    /// No location available at all.
    #[default]
    None = 0,
    /// Only wide-area country-level accuracy (GeoIP with no other data).
    Country = 1,
    /// City-level accuracy, typically a few kilometers.
    City = 2,
    /// Neighbourhood-level accuracy.
    Neighborhood = 3,
    /// Street-level accuracy.
    Street = 4,
    /// Exact, typically GPS-grade, accuracy.
    Exact = 5,
}

/// A single resolved location fix.
///
/// Numeric fields use `Option<f64>` rather than `f64::NAN` as the "unknown"
/// sentinel: `NAN != NAN` would otherwise make every comparison and
/// `PartialEq`-based dedup check silently fail.
#[derive(Clone, Debug, PartialEq)]
pub struct LocationValue {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in meters, `None` if unknown.
    pub accuracy: Option<f64>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    /// Free-text description of which data sources contributed to this fix,
    /// e.g. `"3GPP + WiFi"`.
    pub description: Option<String>,
    /// Unix timestamp, in milliseconds, of when the fix was produced.
    pub timestamp: u64,
}

impl LocationValue {
    /// Build a location fix, rejecting out-of-range coordinates.
    ///
    /// Returns `None` if `latitude` is outside `[-90, 90]` or `longitude` is
    /// outside `[-180, 180]`, rather than constructing a value no downstream
    /// consumer (plotting, submission, accuracy comparison) could trust.
    pub fn new(latitude: f64, longitude: f64, accuracy: Option<f64>) -> Option<Self> {
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return None;
        }
        Some(Self {
            latitude,
            longitude,
            accuracy,
            altitude: None,
            speed: None,
            heading: None,
            description: None,
            timestamp: now_millis(),
        })
    }

    /// Combine the last GGA and RMC sentences of an NMEA read batch into one
    /// fix: position and altitude come from GGA, speed/heading from RMC.
    ///
    /// Either sentence may be absent; position always comes from GGA when
    /// present since it's the more complete fix of the two.
    pub fn from_nmeas(gga: Option<&Gga>, rmc: Option<&Rmc>) -> Option<Self> {
        let (latitude, longitude) = match (gga, rmc) {
            (Some(gga), _) => (gga.latitude, gga.longitude),
            (None, Some(rmc)) => (rmc.latitude, rmc.longitude),
            (None, None) => return None,
        };

        let mut location = Self::new(latitude, longitude, None)?;
        location.altitude = gga.and_then(|gga| gga.altitude);
        location.speed = rmc.and_then(|rmc| rmc.speed_knots);
        location.heading = rmc.and_then(|rmc| rmc.heading);
        Some(location)
    }

    /// Duplicate the location with a fresh timestamp.
    ///
    /// Used by [`crate::static_source::StaticSource`] to re-announce an
    /// unchanged location so that subscribers relying on timestamp
    /// monotonicity don't treat it as stale.
    pub fn duplicate_fresh(&self) -> Self {
        Self { timestamp: now_millis(), ..self.clone() }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accuracy_level_orders_by_declaration() {
        assert!(AccuracyLevel::None < AccuracyLevel::Country);
        assert!(AccuracyLevel::Country < AccuracyLevel::City);
        assert!(AccuracyLevel::City < AccuracyLevel::Exact);
    }

    #[test]
    fn duplicate_fresh_keeps_coordinates() {
        let location = LocationValue::new(1.0, 2.0, Some(10.0)).unwrap();
        let fresh = location.duplicate_fresh();
        assert_eq!(location.latitude, fresh.latitude);
        assert_eq!(location.longitude, fresh.longitude);
        assert!(fresh.timestamp >= location.timestamp);
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(LocationValue::new(91.0, 0.0, None).is_none());
        assert!(LocationValue::new(0.0, -181.0, None).is_none());
        assert!(LocationValue::new(-90.0, 180.0, None).is_some());
    }

    #[test]
    fn from_nmeas_combines_gga_and_rmc() {
        let gga = Gga { timestamp_us: 0, latitude: 48.1173, longitude: 11.5167, fix_quality: 1, altitude: Some(545.4) };
        let rmc = Rmc {
            timestamp_us: 0,
            active: true,
            latitude: 48.1173,
            longitude: 11.5167,
            speed_knots: Some(22.4),
            heading: Some(84.4),
        };

        let location = LocationValue::from_nmeas(Some(&gga), Some(&rmc)).unwrap();
        assert_eq!(location.latitude, gga.latitude);
        assert_eq!(location.altitude, Some(545.4));
        assert_eq!(location.speed, Some(22.4));
        assert_eq!(location.heading, Some(84.4));
    }

    #[test]
    fn from_nmeas_requires_at_least_one_sentence() {
        assert!(LocationValue::from_nmeas(None, None).is_none());
    }
}
