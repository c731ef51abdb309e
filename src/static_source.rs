//! Statically configured fallback location, read from a plaintext file and
//! kept in sync with it via `notify`.
//!
//! Grounded in `gclue-static-source.c`. The original reads four lines in
//! order (latitude, longitude, altitude, accuracy) via
//! `GDataInputStream::read_line_async`; the line-oriented parsing idiom here
//! instead follows `downloader.rs`'s `Polygon::from_str`: skip blank/comment
//! lines, parse each field with `f64::from_str`, and wrap failures as
//! `io::Error`.

use std::io::{Error as IoError, ErrorKind as IoErrorKind};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::warn;

use crate::location::{AccuracyLevel, LocationValue};

/// Minimum spacing between two file-watch-driven re-reads, so a flurry of
/// filesystem events from one edit doesn't re-parse the file repeatedly.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(2500);

/// Parsed contents of the static location file.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub accuracy: Option<f64>,
}

impl FromStr for StaticLocation {
    type Err = IoError;

    fn from_str(contents: &str) -> Result<Self, Self::Err> {
        let mut fields = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'));

        let mut next_f64 = |name: &str| -> Result<f64, IoError> {
            let line = fields.next().ok_or_else(|| {
                IoError::new(IoErrorKind::InvalidInput, format!("missing {name} in static location file"))
            })?;
            f64::from_str(line).map_err(|err| {
                IoError::new(IoErrorKind::InvalidInput, format!("invalid {name} {line:?}: {err}"))
            })
        };

        let latitude = next_f64("latitude")?;
        let longitude = next_f64("longitude")?;
        let altitude = next_f64("altitude").ok();
        let accuracy = next_f64("accuracy").ok();

        Ok(Self { latitude, longitude, altitude, accuracy })
    }
}

impl StaticLocation {
    /// Build a [`LocationValue`] from the configured coordinates.
    ///
    /// Scrambling (see [`Self::available_accuracy_level`]) only caps the
    /// accuracy *level* reported to subscribers; the coordinates and numeric
    /// accuracy from the file are never altered here. Locators that want
    /// coarser positions are expected to scramble below city level
    /// themselves.
    pub fn to_location_value(&self) -> Option<LocationValue> {
        let mut location = LocationValue::new(self.latitude, self.longitude, self.accuracy)?;
        location.altitude = self.altitude;
        Some(location)
    }

    pub fn available_accuracy_level(scramble: bool) -> AccuracyLevel {
        if scramble { AccuracyLevel::City } else { AccuracyLevel::Exact }
    }
}

/// Events produced by watching the static location file.
#[derive(Debug)]
pub enum StaticSourceEvent {
    Updated(StaticLocation),
    Cleared,
}

/// Owns a `notify` file watcher for the static location file and forwards
/// parsed updates over a channel.
pub struct StaticSource {
    _watcher: RecommendedWatcher,
}

impl StaticSource {
    pub fn spawn(path: String) -> Result<(Self, mpsc::UnboundedReceiver<StaticSourceEvent>), notify::Error> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let path_clone = path.clone();
        let last_event: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            let Ok(event) = result else { return };
            if !event.kind.is_modify() && !event.kind.is_create() && !event.kind.is_remove() {
                return;
            }

            let mut last_event = last_event.lock().unwrap();
            if last_event.is_some_and(|at| at.elapsed() < WATCH_DEBOUNCE) {
                return;
            }
            *last_event = Some(Instant::now());
            drop(last_event);

            let parsed = Self::read_file(&path_clone);
            let _ = event_tx.send(parsed);
        })?;

        if let Some(parent) = std::path::Path::new(&path).parent() {
            watcher.watch(parent, RecursiveMode::NonRecursive)?;
        }

        Ok((Self { _watcher: watcher }, event_rx))
    }

    fn read_file(path: &str) -> StaticSourceEvent {
        match std::fs::read_to_string(path) {
            Ok(contents) => match StaticLocation::from_str(&contents) {
                Ok(location) => StaticSourceEvent::Updated(location),
                Err(err) => {
                    warn!("Static location file parse error: {err}");
                    StaticSourceEvent::Cleared
                },
            },
            Err(_) => StaticSourceEvent::Cleared,
        }
    }

    /// Read the static location file once, e.g. at startup before the first
    /// filesystem event arrives.
    pub fn read_initial(path: &str) -> StaticSourceEvent {
        Self::read_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_four_line_file() {
        let contents = "51.5074\n-0.1278\n35.0\n10.0\n";
        let location = StaticLocation::from_str(contents).unwrap();
        assert_eq!(location.latitude, 51.5074);
        assert_eq!(location.longitude, -0.1278);
        assert_eq!(location.altitude, Some(35.0));
        assert_eq!(location.accuracy, Some(10.0));
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let contents = "# location override\n\n51.5074\n-0.1278\n";
        let location = StaticLocation::from_str(contents).unwrap();
        assert_eq!(location.latitude, 51.5074);
        assert_eq!(location.altitude, None);
    }

    #[test]
    fn missing_coordinates_is_an_error() {
        let contents = "51.5074\n";
        assert!(StaticLocation::from_str(contents).is_err());
    }

    #[test]
    fn scrambled_location_caps_at_city_accuracy() {
        assert_eq!(StaticLocation::available_accuracy_level(true), AccuracyLevel::City);
        assert_eq!(StaticLocation::available_accuracy_level(false), AccuracyLevel::Exact);
    }

    #[test]
    fn to_location_value_keeps_exact_coordinates() {
        let location = StaticLocation { latitude: 51.5074, longitude: -0.1278, altitude: None, accuracy: None };
        let value = location.to_location_value().unwrap();
        assert_eq!(value.latitude, 51.5074);
        assert_eq!(value.longitude, -0.1278);
    }

    #[test]
    fn to_location_value_rejects_invalid_coordinates() {
        let location = StaticLocation { latitude: 200.0, longitude: 0.0, altitude: None, accuracy: None };
        assert!(location.to_location_value().is_none());
    }
}
